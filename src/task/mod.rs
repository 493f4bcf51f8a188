pub mod config;
pub mod registry;
pub mod types;

pub use config::{ComparisonRule, TaskTable};
pub use registry::ReferenceSet;
pub use types::{CapabilityClass, Sample};
