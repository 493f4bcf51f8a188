use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use comfy_table::{modifiers::UTF8_ROUND_CORNERS, presets::UTF8_FULL, Cell, ContentArrangement, Table};
use serde::{Deserialize, Serialize};
use std::path::Path;
use tracing::info;

use crate::evaluation::{AggregateReport, GroupScore, ScoreRecord};
use crate::task::CapabilityClass;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, clap::ValueEnum)]
pub enum OutputFormat {
    #[default]
    Table,
    Markdown,
    Json,
}

/// What gets saved to disk: the report plus run metadata.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReportEnvelope {
    pub run_id: uuid::Uuid,
    #[serde(default)]
    pub model: Option<String>,
    pub capability: CapabilityClass,
    pub generated_at: DateTime<Utc>,
    pub report: AggregateReport,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub records: Option<Vec<ScoreRecord>>,
}

impl ReportEnvelope {
    pub fn new(model: Option<String>, capability: CapabilityClass, report: AggregateReport) -> Self {
        Self {
            run_id: uuid::Uuid::new_v4(),
            model,
            capability,
            generated_at: Utc::now(),
            report,
            records: None,
        }
    }

    pub fn with_records(mut self, records: Vec<ScoreRecord>) -> Self {
        self.records = Some(records);
        self
    }

    pub async fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent)
                    .await
                    .with_context(|| format!("Failed to create {}", parent.display()))?;
            }
        }
        let body = serde_json::to_string_pretty(self).context("Failed to serialize report")?;
        tokio::fs::write(path, body)
            .await
            .with_context(|| format!("Failed to write report to {}", path.display()))?;
        info!("Results saved to {}", path.display());
        Ok(())
    }
}

pub fn render(report: &AggregateReport, format: OutputFormat) -> Result<String> {
    match format {
        OutputFormat::Table => Ok(render_table(report)),
        OutputFormat::Markdown => Ok(render_markdown(report)),
        OutputFormat::Json => {
            serde_json::to_string_pretty(report).context("Failed to serialize report")
        }
    }
}

fn pct(score: &GroupScore) -> String {
    format!("{:.2}%", score.accuracy * 100.0)
}

/// Rows in display order: each task, then its subtasks indented below it, then overall.
fn rows(report: &AggregateReport) -> Vec<(String, &GroupScore)> {
    let mut rows = Vec::new();
    for (task, task_score) in &report.tasks {
        rows.push((task.clone(), &task_score.score));
        let only_self = task_score.subtasks.len() == 1 && task_score.subtasks.contains_key(task);
        if !only_self {
            for (sub, score) in &task_score.subtasks {
                rows.push((format!("  {}", sub), score));
            }
        }
    }
    rows.push(("Overall".to_string(), &report.overall));
    rows
}

fn render_table(report: &AggregateReport) -> String {
    let mut table = Table::new();
    table
        .load_preset(UTF8_FULL)
        .apply_modifier(UTF8_ROUND_CORNERS)
        .set_content_arrangement(ContentArrangement::Dynamic)
        .set_header(vec![
            "Task / Subtask",
            "Correct",
            "Total",
            "Attempted",
            "Skipped",
            "Failed",
            "Accuracy",
        ]);

    for (label, score) in rows(report) {
        table.add_row(vec![
            Cell::new(label),
            Cell::new(score.correct),
            Cell::new(score.total),
            Cell::new(score.attempted),
            Cell::new(score.skipped),
            Cell::new(score.failed),
            Cell::new(pct(score)),
        ]);
    }

    let mut out = table.to_string();
    if report.excluded > 0 {
        out.push_str(&format!(
            "\n{} samples excluded (not applicable to this model)\n",
            report.excluded
        ));
    }
    out
}

fn render_markdown(report: &AggregateReport) -> String {
    let mut md = String::new();
    md.push_str("# Evaluation Results\n\n");
    md.push_str(&format!(
        "**Overall Accuracy**: {} ({}/{})\n\n",
        pct(&report.overall),
        report.overall.correct,
        report.overall.total
    ));
    if report.excluded > 0 {
        md.push_str(&format!("**Excluded**: {}\n\n", report.excluded));
    }
    md.push_str("| Task / Subtask | Correct | Total | Skipped | Failed | Accuracy |\n");
    md.push_str("|----------------|---------|-------|---------|--------|----------|\n");
    for (label, score) in rows(report) {
        let label = match label.strip_prefix("  ") {
            Some(sub) => format!("&nbsp;&nbsp;{}", sub),
            None => format!("**{}**", label),
        };
        md.push_str(&format!(
            "| {} | {} | {} | {} | {} | {} |\n",
            label,
            score.correct,
            score.total,
            score.skipped,
            score.failed,
            pct(score)
        ));
    }
    md
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::evaluation::Verdict;

    fn report() -> AggregateReport {
        let rec = |id: &str, task: &str, sub: &str, verdict| ScoreRecord {
            sample_id: id.into(),
            task: task.into(),
            subtask: sub.into(),
            extracted: String::new(),
            verdict,
        };
        AggregateReport::from_records(&[
            rec("1", "understanding", "ocr", Verdict::Correct),
            rec("2", "understanding", "counting", Verdict::Incorrect),
            rec("3", "spot_diff", "spot_diff", Verdict::Missing),
            rec("4", "text_image_generation", "t2i", Verdict::Excluded),
        ])
    }

    #[test]
    fn test_render_table() {
        let out = render(&report(), OutputFormat::Table).expect("should render");
        assert!(out.contains("understanding"));
        assert!(out.contains("ocr"));
        assert!(out.contains("Overall"));
        assert!(out.contains("33.33%"));
        assert!(out.contains("1 samples excluded"));
    }

    #[test]
    fn test_render_markdown() {
        let out = render(&report(), OutputFormat::Markdown).expect("should render");
        assert!(out.contains("**Overall Accuracy**: 33.33% (1/3)"));
        assert!(out.contains("| **understanding** | 1 | 2 |"));
        assert!(out.contains("&nbsp;&nbsp;counting"));
        // a task whose only subtask is itself gets no nested row
        assert_eq!(out.matches("spot_diff").count(), 1);
    }

    #[test]
    fn test_render_json() {
        let out = render(&report(), OutputFormat::Json).expect("should render");
        let back: AggregateReport = serde_json::from_str(&out).expect("should parse back");
        assert_eq!(back.overall.correct, 1);
        assert_eq!(back.overall.total, 3);
        assert_eq!(back.excluded, 1);
        assert_eq!(back.tasks["understanding"].subtasks.len(), 2);
    }

    #[tokio::test]
    async fn test_envelope_save() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("nested").join("evaluation_results.json");
        let envelope = ReportEnvelope::new(Some("MGM-7B".into()), CapabilityClass::Unified, report())
            .with_records(Vec::new());
        envelope.save(&path).await.expect("should save");

        let content = std::fs::read_to_string(&path).unwrap();
        let back: ReportEnvelope = serde_json::from_str(&content).expect("should parse");
        assert_eq!(back.run_id, envelope.run_id);
        assert_eq!(back.model.as_deref(), Some("MGM-7B"));
        assert_eq!(back.report.overall.total, 3);
        assert_eq!(back.records, Some(Vec::new()));
    }
}
