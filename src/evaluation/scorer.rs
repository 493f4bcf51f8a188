use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::Semaphore;
use tracing::{debug, info, warn};

use super::comparator::{Comparator, Judgement, Verdict};
use super::report::{AggregateReport, ScoreRecord};
use crate::error::ScoreError;
use crate::metrics::Metrics;
use crate::prediction::Predictions;
use crate::task::{CapabilityClass, ReferenceSet, Sample};

const DEFAULT_MAX_CONCURRENT: usize = 8;

/// Scores predictions against a reference set.
///
/// Holds no state between calls; everything a run accumulates lives in the
/// records it returns (and the optional per-run metrics).
pub struct Scorer {
    comparators: Arc<HashMap<String, Arc<dyn Comparator>>>,
    capability: CapabilityClass,
    max_concurrent: usize,
    metrics: Option<Arc<Metrics>>,
}

impl Scorer {
    pub fn new(comparators: HashMap<String, Arc<dyn Comparator>>) -> Self {
        Self {
            comparators: Arc::new(comparators),
            capability: CapabilityClass::default(),
            max_concurrent: DEFAULT_MAX_CONCURRENT,
            metrics: None,
        }
    }

    pub fn with_capability(mut self, capability: CapabilityClass) -> Self {
        self.capability = capability;
        self
    }

    pub fn with_max_concurrent(mut self, max: usize) -> Self {
        self.max_concurrent = max.max(1);
        self
    }

    pub fn with_metrics(mut self, metrics: Arc<Metrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub async fn score(
        &self,
        references: &ReferenceSet,
        predictions: &Predictions,
    ) -> Result<AggregateReport, ScoreError> {
        let records = self.score_records(references, predictions).await?;
        Ok(AggregateReport::from_records(&records))
    }

    /// One record per reference sample, sorted by sample id.
    pub async fn score_records(
        &self,
        references: &ReferenceSet,
        predictions: &Predictions,
    ) -> Result<Vec<ScoreRecord>, ScoreError> {
        for task in references.tasks() {
            if !self.comparators.contains_key(task) {
                return Err(ScoreError::UnknownTask {
                    task: task.to_string(),
                });
            }
        }
        predictions.check_resolvable(references)?;

        let start = Instant::now();
        info!(
            samples = references.len(),
            predictions = predictions.len(),
            capability = %self.capability,
            workers = self.max_concurrent,
            "Starting scoring pass"
        );

        let semaphore = Arc::new(Semaphore::new(self.max_concurrent));
        let mut records = Vec::with_capacity(references.len());
        let mut pending = Vec::new();

        for sample in references.samples() {
            if !sample.is_applicable(self.capability) {
                records.push(record(sample, String::new(), Verdict::Excluded));
                continue;
            }
            let response = match predictions.get(&sample.id) {
                Some(text) if !text.trim().is_empty() => text.to_string(),
                _ => {
                    records.push(record(sample, String::new(), Verdict::Missing));
                    continue;
                }
            };

            let comparator = Arc::clone(&self.comparators[sample.task.as_str()]);
            let sample = Arc::clone(sample);
            let sem = Arc::clone(&semaphore);
            let handle = tokio::spawn({
                let sample = Arc::clone(&sample);
                async move {
                    let _permit = sem.acquire_owned().await.ok();
                    comparator.compare(&sample, &response).await
                }
            });
            pending.push((sample, handle));
        }

        let joined = futures::future::join_all(
            pending
                .into_iter()
                .map(|(sample, handle)| async move { (sample, handle.await) }),
        )
        .await;

        for (sample, result) in joined {
            let Judgement { extracted, verdict } = match result {
                Ok(judgement) => judgement,
                Err(e) => {
                    warn!(sample_id = %sample.id, error = %e, "Comparator task panicked");
                    Judgement {
                        extracted: String::new(),
                        verdict: Verdict::JudgeFailed,
                    }
                }
            };
            debug!(sample_id = %sample.id, verdict = ?verdict, "Scored sample");
            records.push(record(&sample, extracted, verdict));
        }

        records.sort_by(|a, b| a.sample_id.cmp(&b.sample_id));

        let elapsed_ms = start.elapsed().as_millis() as u64;
        if let Some(ref metrics) = self.metrics {
            for r in &records {
                metrics.record_verdict(r.verdict);
            }
            metrics.finish(elapsed_ms);
        }

        info!(
            records = records.len(),
            correct = records.iter().filter(|r| r.is_correct()).count(),
            elapsed_ms = elapsed_ms,
            "Scoring pass complete"
        );
        Ok(records)
    }
}

fn record(sample: &Sample, extracted: String, verdict: Verdict) -> ScoreRecord {
    ScoreRecord {
        sample_id: sample.id.clone(),
        task: sample.task.clone(),
        subtask: sample.subtask().to_string(),
        extracted,
        verdict,
    }
}
