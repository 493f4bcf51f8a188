use std::path::PathBuf;

use crate::task::CapabilityClass;

const DEFAULT_WORKERS: usize = 8;
const DEFAULT_JUDGE_TIMEOUT: u64 = 60;
const DEFAULT_OUTPUT_DIR: &str = "eval_results";

#[derive(Debug, Clone)]
pub struct Config {
    pub workers: usize,
    pub capability: CapabilityClass,
    pub judge_url: Option<String>,
    pub judge_token: Option<String>,
    pub judge_timeout_secs: u64,
    pub output_dir: PathBuf,
    pub task_table: Option<PathBuf>,
}

impl Config {
    pub fn from_env() -> Self {
        Self {
            workers: env_parse("UNIFY_EVAL_WORKERS", DEFAULT_WORKERS),
            capability: env_parse("UNIFY_EVAL_CAPABILITY", CapabilityClass::default()),
            judge_url: std::env::var("UNIFY_EVAL_JUDGE_URL").ok(),
            judge_token: std::env::var("UNIFY_EVAL_JUDGE_TOKEN").ok(),
            judge_timeout_secs: env_parse("UNIFY_EVAL_JUDGE_TIMEOUT_SECS", DEFAULT_JUDGE_TIMEOUT),
            output_dir: PathBuf::from(
                std::env::var("UNIFY_EVAL_OUTPUT_DIR").unwrap_or_else(|_| DEFAULT_OUTPUT_DIR.into()),
            ),
            task_table: std::env::var("UNIFY_EVAL_TASKS").ok().map(PathBuf::from),
        }
    }

    pub fn print_banner(&self) {
        tracing::info!("╔══════════════════════════════════════════════════╗");
        tracing::info!("║              unify-eval v{:<24}║", env!("CARGO_PKG_VERSION"));
        tracing::info!("╠══════════════════════════════════════════════════╣");
        tracing::info!("║  Capability:        {:<29}║", self.capability);
        tracing::info!("║  Workers:           {:<29}║", self.workers);
        tracing::info!("║  Judge:             {:<29}║", self.judge_url.as_deref().unwrap_or("none"));
        tracing::info!("║  Judge timeout:     {:<28}s║", self.judge_timeout_secs);
        tracing::info!(
            "║  Task table:        {:<29}║",
            self.task_table
                .as_ref()
                .map(|p| p.display().to_string())
                .unwrap_or_else(|| "built-in".into())
        );
        tracing::info!("║  Output dir:        {:<29}║", self.output_dir.display());
        tracing::info!("╚══════════════════════════════════════════════════╝");
    }
}

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}
