mod config;
mod error;
mod evaluation;
mod metrics;
mod output;
mod prediction;
mod task;

use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info};

use evaluation::{build_comparators, CachedJudge, HttpJudge, Judge, Scorer};
use output::{OutputFormat, ReportEnvelope};
use prediction::Predictions;
use task::{CapabilityClass, ReferenceSet, TaskTable};

/// Score model answers for the unified multimodal benchmark.
#[derive(Parser, Debug)]
#[command(name = "unify-eval", version)]
#[command(about = "Score model predictions against benchmark reference answers")]
struct Cli {
    /// Predictions file (.json mapping or record array, or .jsonl)
    predictions: PathBuf,

    /// Reference file or directory tree (<task>/<subtask>/*.json)
    #[arg(long, short = 'r')]
    references: PathBuf,

    /// Only score samples of this task
    #[arg(long, short = 't')]
    task: Option<String>,

    /// YAML task table mapping tasks to comparison rules
    #[arg(long)]
    tasks: Option<PathBuf>,

    /// Capability class of the model under test
    #[arg(long)]
    capability: Option<CapabilityClass>,

    /// Concurrent comparison workers
    #[arg(long, short = 'w')]
    workers: Option<usize>,

    /// Endpoint of an external judge for external_judge tasks
    #[arg(long)]
    judge_url: Option<String>,

    /// Seconds to wait for one judge verdict
    #[arg(long)]
    judge_timeout: Option<u64>,

    /// Model name recorded in the saved report
    #[arg(long, short = 'm')]
    model: Option<String>,

    /// Format of the report printed to stdout
    #[arg(long, short = 'f', value_enum, default_value_t = OutputFormat::Table)]
    format: OutputFormat,

    /// Where to save the JSON report (default: <output dir>/evaluation_results.json)
    #[arg(long, short = 'o')]
    output: Option<PathBuf>,

    /// Include per-sample records in the saved report
    #[arg(long)]
    records: bool,

    /// Write run counters in Prometheus text format to this file
    #[arg(long)]
    metrics_file: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> ExitCode {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("unify_eval=info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(e) => {
            let _ = e.print();
            return ExitCode::from(parse_exit_code(&e));
        }
    };
    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{:#}", e);
            ExitCode::from(error::exit_code_for(&e))
        }
    }
}

/// `--help` and `--version` succeed; usage errors get their own code, distinct from run failures.
fn parse_exit_code(err: &clap::Error) -> u8 {
    match err.kind() {
        clap::error::ErrorKind::DisplayHelp | clap::error::ErrorKind::DisplayVersion => 0,
        _ => error::USAGE_EXIT_CODE,
    }
}

async fn run(cli: Cli) -> Result<()> {
    let mut config = config::Config::from_env();
    if let Some(workers) = cli.workers {
        config.workers = workers;
    }
    if let Some(capability) = cli.capability {
        config.capability = capability;
    }
    if cli.judge_url.is_some() {
        config.judge_url = cli.judge_url.clone();
    }
    if let Some(secs) = cli.judge_timeout {
        config.judge_timeout_secs = secs;
    }
    if cli.tasks.is_some() {
        config.task_table = cli.tasks.clone();
    }
    config.print_banner();

    let table = match config.task_table {
        Some(ref path) => TaskTable::load(path)?,
        None => TaskTable::builtin(),
    };

    let mut references = ReferenceSet::load(&cli.references, cli.task.as_deref())
        .with_context(|| format!("Failed to load references from {}", cli.references.display()))?;
    if let Some(ref task) = cli.task {
        table.rule_for(task)?;
        references = references.only_task(task)?;
        info!(task = %task, samples = references.len(), "Restricted run to one task");
    }
    let predictions = Predictions::load(&cli.predictions)?;

    // Only the rules the selected samples need; an unused judge task must not block the run.
    let mut needed = TaskTable::default();
    for name in references.tasks() {
        let rule = table.rule_for(name)?;
        needed.tasks.insert(name.to_string(), rule.clone());
    }
    if needed.tasks.is_empty() {
        anyhow::bail!("Reference set {} is empty", cli.references.display());
    }

    let judge_timeout = Duration::from_secs(config.judge_timeout_secs);
    let judge: Option<Arc<dyn Judge>> = match config.judge_url {
        Some(ref url) if needed.uses_judge() => {
            let http: Arc<dyn Judge> = Arc::new(HttpJudge::new(
                url.clone(),
                config.judge_token.clone(),
                judge_timeout,
            )?);
            let cached: Arc<dyn Judge> = Arc::new(CachedJudge::new(http));
            Some(cached)
        }
        _ => None,
    };
    let comparators = build_comparators(&needed, judge, judge_timeout)?;

    let metrics = metrics::Metrics::new();
    let scorer = Scorer::new(comparators)
        .with_capability(config.capability)
        .with_max_concurrent(config.workers)
        .with_metrics(metrics.clone());

    let records = scorer.score_records(&references, &predictions).await?;
    let report = evaluation::AggregateReport::from_records(&records);

    println!("{}", output::render(&report, cli.format)?);

    let mut envelope = ReportEnvelope::new(cli.model.clone(), config.capability, report);
    if cli.records {
        envelope = envelope.with_records(records);
    }
    let report_path = cli
        .output
        .clone()
        .unwrap_or_else(|| config.output_dir.join("evaluation_results.json"));
    envelope.save(&report_path).await?;

    if let Some(ref path) = cli.metrics_file {
        tokio::fs::write(path, metrics.render_prometheus())
            .await
            .with_context(|| format!("Failed to write metrics to {}", path.display()))?;
        info!("Metrics written to {}", path.display());
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write(path: &std::path::Path, body: &str) {
        std::fs::write(path, body).unwrap();
    }

    fn arg(path: &std::path::Path) -> String {
        path.to_str().unwrap().to_string()
    }

    #[test]
    fn test_cli_parses() {
        let cli = Cli::parse_from([
            "unify-eval",
            "preds.json",
            "-r",
            "refs",
            "--task",
            "understanding",
            "--capability",
            "understanding",
            "--format",
            "markdown",
        ]);
        assert_eq!(cli.predictions, PathBuf::from("preds.json"));
        assert_eq!(cli.task.as_deref(), Some("understanding"));
        assert_eq!(cli.capability, Some(CapabilityClass::Understanding));
        assert_eq!(cli.format, OutputFormat::Markdown);
        assert!(!cli.records);
    }

    #[test]
    fn test_usage_errors_have_their_own_exit_code() {
        let missing = Cli::try_parse_from(["unify-eval", "preds.json"]).unwrap_err();
        assert_eq!(parse_exit_code(&missing), error::USAGE_EXIT_CODE);
        let bad_class =
            Cli::try_parse_from(["unify-eval", "p.json", "-r", "r", "--capability", "omni"])
                .unwrap_err();
        assert_eq!(parse_exit_code(&bad_class), error::USAGE_EXIT_CODE);
        assert_ne!(error::USAGE_EXIT_CODE, 2);
        assert_ne!(error::USAGE_EXIT_CODE, 3);

        let help = Cli::try_parse_from(["unify-eval", "--help"]).unwrap_err();
        assert_eq!(parse_exit_code(&help), 0);
    }

    #[tokio::test]
    async fn test_run_scores_combined_results_file() {
        let tmp = tempfile::tempdir().unwrap();
        let results = tmp.path().join("result.json");
        let out = tmp.path().join("report.json");
        write(
            &results,
            r#"[{"id": "1", "category": "ocr", "output": "B", "answer": "B"},
                {"id": "2", "category": "ocr", "output": "(A) a cat", "answer": "C"},
                {"id": "3", "category": "counting", "output": "I think D.", "answer": "D"}]"#,
        );
        let cli = Cli::parse_from([
            "unify-eval".to_string(),
            arg(&results),
            "-r".into(),
            arg(&results),
            "--task".into(),
            "understanding".into(),
            "-o".into(),
            arg(&out),
        ]);
        run(cli).await.expect("run should succeed");

        let saved: ReportEnvelope =
            serde_json::from_str(&std::fs::read_to_string(&out).unwrap()).unwrap();
        assert_eq!(saved.report.overall.correct, 2);
        assert_eq!(saved.report.overall.total, 3);
        let ocr = saved.report.subtask("understanding", "ocr").expect("ocr");
        assert_eq!((ocr.correct, ocr.total), (1, 2));
    }

    #[tokio::test]
    async fn test_run_writes_report_and_metrics() {
        let tmp = tempfile::tempdir().unwrap();
        let refs = tmp.path().join("refs.json");
        let preds = tmp.path().join("preds.json");
        let out = tmp.path().join("out").join("report.json");
        let metrics = tmp.path().join("metrics.prom");
        write(
            &refs,
            r#"[{"id": "1", "task": "understanding", "category": "ocr", "answer": "B"},
                {"id": "2", "task": "spot_diff", "answer": "4"}]"#,
        );
        write(&preds, r#"{"1": "The answer is B.", "2": "five"}"#);

        let cli = Cli::parse_from([
            "unify-eval".to_string(),
            arg(&preds),
            "-r".into(),
            arg(&refs),
            "-o".into(),
            arg(&out),
            "--metrics-file".into(),
            arg(&metrics),
            "--records".into(),
        ]);
        run(cli).await.expect("run should succeed");

        let saved: ReportEnvelope =
            serde_json::from_str(&std::fs::read_to_string(&out).unwrap()).unwrap();
        assert_eq!(saved.report.overall.correct, 1);
        assert_eq!(saved.report.overall.total, 2);
        assert_eq!(saved.records.map(|r| r.len()), Some(2));
        let prom = std::fs::read_to_string(&metrics).unwrap();
        assert!(prom.contains("unify_eval_samples_correct 1"));
    }

    #[tokio::test]
    async fn test_run_duplicate_reference_exit_code() {
        let tmp = tempfile::tempdir().unwrap();
        let refs = tmp.path().join("refs.json");
        let preds = tmp.path().join("preds.json");
        write(
            &refs,
            r#"[{"id": "1", "task": "spot_diff", "answer": "4"},
                {"id": "1", "task": "spot_diff", "answer": "5"}]"#,
        );
        write(&preds, r#"{"1": "4"}"#);
        let cli = Cli::parse_from([
            "unify-eval".to_string(),
            arg(&preds),
            "-r".into(),
            arg(&refs),
            "-o".into(),
            arg(&tmp.path().join("r.json")),
        ]);
        let err = run(cli).await.unwrap_err();
        assert_eq!(error::exit_code_for(&err), 3);
    }

    #[tokio::test]
    async fn test_run_unknown_task_exit_code() {
        let tmp = tempfile::tempdir().unwrap();
        let refs = tmp.path().join("refs.json");
        let preds = tmp.path().join("preds.json");
        write(&refs, r#"[{"id": "1", "task": "spot_diff", "answer": "4"}]"#);
        write(&preds, r#"{"1": "4"}"#);
        let cli = Cli::parse_from([
            "unify-eval".to_string(),
            arg(&preds),
            "-r".into(),
            arg(&refs),
            "--task".into(),
            "no_such_task".into(),
        ]);
        let err = run(cli).await.unwrap_err();
        assert_eq!(error::exit_code_for(&err), 2);
    }
}
