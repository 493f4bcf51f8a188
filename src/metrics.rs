use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crate::evaluation::Verdict;

/// Counters for one scoring run. Shared by the worker tasks of that run only.
#[derive(Debug)]
pub struct Metrics {
    pub samples_total: AtomicU64,
    pub samples_excluded: AtomicU64,
    pub samples_correct: AtomicU64,
    pub predictions_missing: AtomicU64,
    pub extraction_misses: AtomicU64,
    pub judge_failures: AtomicU64,
    pub duration_ms: AtomicU64,
}

impl Metrics {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            samples_total: AtomicU64::new(0),
            samples_excluded: AtomicU64::new(0),
            samples_correct: AtomicU64::new(0),
            predictions_missing: AtomicU64::new(0),
            extraction_misses: AtomicU64::new(0),
            judge_failures: AtomicU64::new(0),
            duration_ms: AtomicU64::new(0),
        })
    }

    pub fn record_verdict(&self, verdict: Verdict) {
        self.samples_total.fetch_add(1, Ordering::Relaxed);
        let counter = match verdict {
            Verdict::Correct => &self.samples_correct,
            Verdict::Excluded => &self.samples_excluded,
            Verdict::Missing => &self.predictions_missing,
            Verdict::ExtractionMiss => &self.extraction_misses,
            Verdict::JudgeFailed => &self.judge_failures,
            Verdict::Incorrect => return,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn finish(&self, duration_ms: u64) {
        self.duration_ms.store(duration_ms, Ordering::Relaxed);
    }

    pub fn render_prometheus(&self) -> String {
        let total = self.samples_total.load(Ordering::Relaxed);
        let excluded = self.samples_excluded.load(Ordering::Relaxed);
        let correct = self.samples_correct.load(Ordering::Relaxed);
        let missing = self.predictions_missing.load(Ordering::Relaxed);
        let misses = self.extraction_misses.load(Ordering::Relaxed);
        let judge_failures = self.judge_failures.load(Ordering::Relaxed);
        let duration = self.duration_ms.load(Ordering::Relaxed);

        format!(
            "# HELP unify_eval_samples_total Samples seen, including excluded ones.\n\
             # TYPE unify_eval_samples_total counter\n\
             unify_eval_samples_total {}\n\
             # HELP unify_eval_samples_excluded Samples not applicable to the model's capability class.\n\
             # TYPE unify_eval_samples_excluded counter\n\
             unify_eval_samples_excluded {}\n\
             # HELP unify_eval_samples_correct Samples scored correct.\n\
             # TYPE unify_eval_samples_correct counter\n\
             unify_eval_samples_correct {}\n\
             # HELP unify_eval_predictions_missing Samples with no or empty prediction.\n\
             # TYPE unify_eval_predictions_missing counter\n\
             unify_eval_predictions_missing {}\n\
             # HELP unify_eval_extraction_misses Responses with no answer in the expected format.\n\
             # TYPE unify_eval_extraction_misses counter\n\
             unify_eval_extraction_misses {}\n\
             # HELP unify_eval_judge_failures External judge errors and timeouts.\n\
             # TYPE unify_eval_judge_failures counter\n\
             unify_eval_judge_failures {}\n\
             # HELP unify_eval_duration_ms Wall time of the scoring pass in ms.\n\
             # TYPE unify_eval_duration_ms gauge\n\
             unify_eval_duration_ms {}\n",
            total, excluded, correct, missing, misses, judge_failures, duration
        )
    }
}
