pub mod comparator;
pub mod judge;
pub mod report;
pub mod scorer;

pub use comparator::{build_comparators, Comparator, Judgement, Verdict};
pub use judge::{CachedJudge, HttpJudge, Judge};
pub use report::{AggregateReport, GroupScore, ScoreRecord};
pub use scorer::Scorer;
