use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use tracing::info;

use crate::error::ScoreError;

const DEFAULT_OPTIONS: &str = "ABCD";
const DEFAULT_OVERLAP_THRESHOLD: f64 = 0.5;

/// How a task's predictions are compared with its references.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "rule", rename_all = "snake_case")]
pub enum ComparisonRule {
    ExactMatch,
    ChoiceExtract {
        #[serde(default = "default_options")]
        options: String,
    },
    KeywordOverlap {
        #[serde(default = "default_threshold")]
        threshold: f64,
    },
    ExternalJudge,
}

impl ComparisonRule {
    pub fn name(&self) -> &'static str {
        match self {
            ComparisonRule::ExactMatch => "exact_match",
            ComparisonRule::ChoiceExtract { .. } => "choice_extract",
            ComparisonRule::KeywordOverlap { .. } => "keyword_overlap",
            ComparisonRule::ExternalJudge => "external_judge",
        }
    }
}

fn default_options() -> String {
    DEFAULT_OPTIONS.to_string()
}

fn default_threshold() -> f64 {
    DEFAULT_OVERLAP_THRESHOLD
}

/// Task name → comparison rule.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TaskTable {
    #[serde(default)]
    pub tasks: BTreeMap<String, ComparisonRule>,
}

impl TaskTable {
    /// Rules for the benchmark's task families.
    pub fn builtin() -> Self {
        let choice = || ComparisonRule::ChoiceExtract {
            options: default_options(),
        };
        let mut tasks = BTreeMap::new();
        tasks.insert("understanding".to_string(), choice());
        tasks.insert("common_sense_qa".to_string(), choice());
        tasks.insert("auxiliary_lines".to_string(), choice());
        tasks.insert("spot_diff".to_string(), ComparisonRule::ExactMatch);
        tasks.insert("visual_cot".to_string(), ComparisonRule::ExactMatch);
        tasks.insert(
            "image_editing_explanation".to_string(),
            ComparisonRule::KeywordOverlap {
                threshold: default_threshold(),
            },
        );
        tasks.insert(
            "text_image_generation".to_string(),
            ComparisonRule::ExternalJudge,
        );
        Self { tasks }
    }

    pub fn from_yaml(yaml: &str) -> Result<Self, ScoreError> {
        let table: TaskTable =
            serde_yaml::from_str(yaml).map_err(|e| ScoreError::InvalidTaskTable(e.to_string()))?;
        table.validate()?;
        Ok(table)
    }

    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read task table {}", path.display()))?;
        let table = Self::from_yaml(&content)
            .with_context(|| format!("Invalid task table {}", path.display()))?;
        info!(
            "Loaded {} task rules from {}",
            table.tasks.len(),
            path.display()
        );
        Ok(table)
    }

    pub fn rule_for(&self, task: &str) -> Result<&ComparisonRule, ScoreError> {
        self.tasks.get(task).ok_or_else(|| ScoreError::UnknownTask {
            task: task.to_string(),
        })
    }

    pub fn validate(&self) -> Result<(), ScoreError> {
        if self.tasks.is_empty() {
            return Err(ScoreError::InvalidTaskTable("no tasks defined".into()));
        }
        for (task, rule) in &self.tasks {
            match rule {
                ComparisonRule::ChoiceExtract { options } => validate_options(task, options)?,
                ComparisonRule::KeywordOverlap { threshold } => {
                    if !(*threshold > 0.0 && *threshold <= 1.0) {
                        return Err(ScoreError::InvalidTaskTable(format!(
                            "task {:?}: threshold {} must be in (0, 1]",
                            task, threshold
                        )));
                    }
                }
                ComparisonRule::ExactMatch | ComparisonRule::ExternalJudge => {}
            }
        }
        Ok(())
    }

    pub fn uses_judge(&self) -> bool {
        self.tasks
            .values()
            .any(|rule| matches!(rule, ComparisonRule::ExternalJudge))
    }
}

fn validate_options(task: &str, options: &str) -> Result<(), ScoreError> {
    if options.is_empty() {
        return Err(ScoreError::InvalidTaskTable(format!(
            "task {:?}: choice_extract needs at least one option",
            task
        )));
    }
    let mut seen = Vec::new();
    for c in options.chars() {
        if !c.is_ascii_uppercase() || seen.contains(&c) {
            return Err(ScoreError::InvalidTaskTable(format!(
                "task {:?}: options must be distinct uppercase letters, got {:?}",
                task, options
            )));
        }
        seen.push(c);
    }
    Ok(())
}
