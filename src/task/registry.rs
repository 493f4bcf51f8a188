use anyhow::{Context, Result};
use serde_json::Value;
use std::collections::{BTreeSet, HashSet};
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, info};

use super::types::Sample;
use crate::error::ScoreError;

/// The reference side of a run: samples with unique, non-empty ids.
#[derive(Debug, Clone, Default)]
pub struct ReferenceSet {
    samples: Vec<Arc<Sample>>,
    ids: HashSet<String>,
}

impl ReferenceSet {
    pub fn new(samples: Vec<Sample>) -> Result<Self, ScoreError> {
        let mut seen = HashSet::with_capacity(samples.len());
        for (index, sample) in samples.iter().enumerate() {
            if sample.id.trim().is_empty() {
                return Err(ScoreError::MalformedSampleId {
                    index,
                    reason: "id is empty".into(),
                });
            }
            if sample.id.trim() != sample.id {
                return Err(ScoreError::MalformedSampleId {
                    index,
                    reason: format!("id {:?} has surrounding whitespace", sample.id),
                });
            }
            if !seen.insert(sample.id.clone()) {
                return Err(ScoreError::DuplicateSample {
                    id: sample.id.clone(),
                });
            }
        }
        Ok(Self {
            samples: samples.into_iter().map(Arc::new).collect(),
            ids: seen,
        })
    }

    pub fn samples(&self) -> &[Arc<Sample>] {
        &self.samples
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn contains(&self, id: &str) -> bool {
        self.ids.contains(id)
    }

    pub fn tasks(&self) -> BTreeSet<&str> {
        self.samples.iter().map(|s| s.task.as_str()).collect()
    }

    /// Keeps only the samples of `task`.
    pub fn only_task(&self, task: &str) -> Result<Self, ScoreError> {
        let samples: Vec<Arc<Sample>> = self
            .samples
            .iter()
            .filter(|s| s.task == task)
            .cloned()
            .collect();
        if samples.is_empty() {
            return Err(ScoreError::UnknownTask {
                task: task.to_string(),
            });
        }
        let ids = samples.iter().map(|s| s.id.clone()).collect();
        Ok(Self { samples, ids })
    }

    /// Loads a `.json` array, a `.jsonl` file, or a directory tree of either.
    ///
    /// Inside a directory tree, `<root>/<task>/<subtask>/file.json` supplies
    /// `task` and `subtask` for records that leave them out. A single file's
    /// records without a `task` take `default_task`, or the file stem.
    pub fn load(path: &Path, default_task: Option<&str>) -> Result<Self> {
        let mut records = Vec::new();
        if path.is_dir() {
            collect_dir(path, path, &mut records)?;
        } else {
            let task = default_task
                .map(str::to_string)
                .or_else(|| path.file_stem().map(|s| s.to_string_lossy().into_owned()));
            for mut value in read_records(path)? {
                if let (Value::Object(map), Some(task)) = (&mut value, task.as_ref()) {
                    map.entry("task").or_insert_with(|| Value::String(task.clone()));
                }
                records.push((path.display().to_string(), value));
            }
        }

        let mut samples = Vec::with_capacity(records.len());
        for (source_name, value) in records {
            let sample: Sample =
                serde_json::from_value(value).map_err(|e| ScoreError::InvalidReference {
                    source_name: source_name.clone(),
                    reason: e.to_string(),
                })?;
            samples.push(sample);
        }

        let set = Self::new(samples)
            .with_context(|| format!("Reference set {} failed validation", path.display()))?;
        info!(
            "Loaded {} reference samples across {} tasks from {}",
            set.len(),
            set.tasks().len(),
            path.display()
        );
        Ok(set)
    }
}

fn collect_dir(root: &Path, dir: &Path, out: &mut Vec<(String, Value)>) -> Result<()> {
    let mut entries: Vec<_> = std::fs::read_dir(dir)
        .with_context(|| format!("Failed to read reference directory {}", dir.display()))?
        .collect::<std::io::Result<Vec<_>>>()
        .with_context(|| format!("Failed to list {}", dir.display()))?;
    entries.sort_by_key(|e| e.file_name());

    for entry in entries {
        let path = entry.path();
        if path.is_dir() {
            collect_dir(root, &path, out)?;
            continue;
        }
        if !is_record_file(&path) {
            continue;
        }

        let rel = path.strip_prefix(root).unwrap_or(&path);
        let components: Vec<String> = rel
            .parent()
            .map(|p| {
                p.components()
                    .map(|c| c.as_os_str().to_string_lossy().into_owned())
                    .collect()
            })
            .unwrap_or_default();

        debug!("Reading reference file {}", path.display());
        for mut value in read_records(&path)? {
            if let Value::Object(ref mut map) = value {
                if let Some(task) = components.first() {
                    map.entry("task").or_insert_with(|| Value::String(task.clone()));
                }
                if let Some(subtask) = components.get(1) {
                    if !map.contains_key("subtask") && !map.contains_key("category") {
                        map.insert("subtask".into(), Value::String(subtask.clone()));
                    }
                }
            }
            out.push((path.display().to_string(), value));
        }
    }
    Ok(())
}

fn is_record_file(path: &Path) -> bool {
    matches!(
        path.extension().and_then(|e| e.to_str()),
        Some("json") | Some("jsonl")
    )
}

/// Reads one file of records: a JSON array, or JSON lines when the extension is `.jsonl`.
pub(crate) fn read_records(path: &Path) -> Result<Vec<Value>> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read {}", path.display()))?;

    if path.extension().and_then(|e| e.to_str()) == Some("jsonl") {
        let mut records = Vec::new();
        for (lineno, line) in content.lines().enumerate() {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            let value: Value = serde_json::from_str(line).with_context(|| {
                format!("Invalid JSON on line {} of {}", lineno + 1, path.display())
            })?;
            records.push(value);
        }
        return Ok(records);
    }

    let value: Value = serde_json::from_str(&content)
        .with_context(|| format!("{} is not valid JSON", path.display()))?;
    match value {
        Value::Array(items) => Ok(items),
        other => Ok(vec![other]),
    }
}
