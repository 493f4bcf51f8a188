use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use super::comparator::Verdict;

/// Outcome for one sample.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScoreRecord {
    pub sample_id: String,
    pub task: String,
    pub subtask: String,
    pub extracted: String,
    pub verdict: Verdict,
}

impl ScoreRecord {
    pub fn is_correct(&self) -> bool {
        self.verdict.is_correct()
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
struct Tally {
    correct: usize,
    total: usize,
    attempted: usize,
    skipped: usize,
    failed: usize,
}

impl Tally {
    fn add(&mut self, verdict: Verdict) {
        if !verdict.counts() {
            return;
        }
        self.total += 1;
        if verdict.is_correct() {
            self.correct += 1;
        }
        if verdict.attempted() {
            self.attempted += 1;
        } else {
            self.skipped += 1;
        }
        if verdict == Verdict::JudgeFailed {
            self.failed += 1;
        }
    }

    fn finish(self) -> GroupScore {
        let accuracy = if self.total > 0 {
            self.correct as f64 / self.total as f64
        } else {
            0.0
        };
        GroupScore {
            correct: self.correct,
            total: self.total,
            attempted: self.attempted,
            skipped: self.skipped,
            failed: self.failed,
            accuracy,
        }
    }
}

/// Counts and accuracy for one group of samples. `accuracy = correct / total`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GroupScore {
    pub correct: usize,
    pub total: usize,
    pub attempted: usize,
    pub skipped: usize,
    pub failed: usize,
    pub accuracy: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskScore {
    #[serde(flatten)]
    pub score: GroupScore,
    pub subtasks: BTreeMap<String, GroupScore>,
}

/// Per-subtask, per-task and overall accuracy of one run.
///
/// Every level is computed from summed counts, never by averaging the
/// accuracies below it, so groups of different sizes weigh by sample count.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AggregateReport {
    pub overall: GroupScore,
    pub tasks: BTreeMap<String, TaskScore>,
    pub excluded: usize,
}

impl AggregateReport {
    pub fn from_records(records: &[ScoreRecord]) -> Self {
        let mut builder = ReportBuilder::default();
        for record in records {
            builder.add(record);
        }
        builder.finish()
    }

    pub fn subtask(&self, task: &str, subtask: &str) -> Option<&GroupScore> {
        self.tasks.get(task).and_then(|t| t.subtasks.get(subtask))
    }
}

/// Accumulator for a single scoring pass.
#[derive(Debug, Default)]
pub struct ReportBuilder {
    overall: Tally,
    tasks: BTreeMap<String, (Tally, BTreeMap<String, Tally>)>,
    excluded: usize,
}

impl ReportBuilder {
    pub fn add(&mut self, record: &ScoreRecord) {
        if !record.verdict.counts() {
            self.excluded += 1;
            return;
        }
        self.overall.add(record.verdict);
        let (task_tally, subtasks) = self.tasks.entry(record.task.clone()).or_default();
        task_tally.add(record.verdict);
        subtasks
            .entry(record.subtask.clone())
            .or_default()
            .add(record.verdict);
    }

    pub fn finish(self) -> AggregateReport {
        let tasks = self
            .tasks
            .into_iter()
            .map(|(name, (tally, subtasks))| {
                let subtasks = subtasks
                    .into_iter()
                    .map(|(sub, t)| (sub, t.finish()))
                    .collect();
                (
                    name,
                    TaskScore {
                        score: tally.finish(),
                        subtasks,
                    },
                )
            })
            .collect();
        AggregateReport {
            overall: self.overall.finish(),
            tasks,
            excluded: self.excluded,
        }
    }
}
