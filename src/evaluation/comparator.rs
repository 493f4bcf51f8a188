use async_trait::async_trait;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Duration;
use tracing::warn;

use super::judge::{Judge, JudgeRequest};
use crate::error::ScoreError;
use crate::task::{ComparisonRule, Sample, TaskTable};

const MIN_KEYWORD_LEN: usize = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Verdict {
    Correct,
    Incorrect,
    /// No prediction, or an empty one.
    Missing,
    /// The response did not contain anything in the expected answer format.
    ExtractionMiss,
    JudgeFailed,
    /// Not applicable to the model's capability class; outside every denominator.
    Excluded,
}

impl Verdict {
    pub fn is_correct(self) -> bool {
        self == Verdict::Correct
    }

    pub fn counts(self) -> bool {
        self != Verdict::Excluded
    }

    pub fn attempted(self) -> bool {
        !matches!(self, Verdict::Missing | Verdict::Excluded)
    }
}

/// The answer pulled out of a response and what it was judged to be.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Judgement {
    pub extracted: String,
    pub verdict: Verdict,
}

impl Judgement {
    fn graded(extracted: impl Into<String>, correct: bool) -> Self {
        Self {
            extracted: extracted.into(),
            verdict: if correct {
                Verdict::Correct
            } else {
                Verdict::Incorrect
            },
        }
    }

    fn miss() -> Self {
        Self {
            extracted: String::new(),
            verdict: Verdict::ExtractionMiss,
        }
    }
}

/// A per-task comparison strategy. Never fails: ambiguity degrades to a non-correct verdict.
#[async_trait]
pub trait Comparator: Send + Sync {
    fn name(&self) -> &'static str;

    async fn compare(&self, sample: &Sample, response: &str) -> Judgement;
}

pub fn normalize(text: &str) -> String {
    text.trim().to_lowercase()
}

pub struct ExactMatch;

#[async_trait]
impl Comparator for ExactMatch {
    fn name(&self) -> &'static str {
        "exact_match"
    }

    async fn compare(&self, sample: &Sample, response: &str) -> Judgement {
        let extracted = normalize(response);
        let correct = extracted == normalize(&sample.answer);
        Judgement::graded(extracted, correct)
    }
}

pub struct ChoiceExtract {
    options: Vec<char>,
    token: Regex,
}

impl ChoiceExtract {
    pub fn new(options: &str) -> Result<Self, ScoreError> {
        let class: String = options.chars().map(|c| regex::escape(&c.to_string())).collect();
        let token = Regex::new(&format!(r"\b([{}])\b", class)).map_err(|e| {
            ScoreError::InvalidTaskTable(format!("options {:?}: {}", options, e))
        })?;
        Ok(Self {
            options: options.chars().collect(),
            token,
        })
    }

    fn effective_options(&self, sample: &Sample) -> &[char] {
        if sample.choices.is_empty() {
            &self.options
        } else {
            &self.options[..sample.choices.len().min(self.options.len())]
        }
    }

    pub fn extract(&self, sample: &Sample, response: &str) -> Option<char> {
        let allowed = self.effective_options(sample);

        if let Some(ref pattern) = sample.answer_pattern {
            let caps = pattern.captures(response)?;
            let found = caps.get(1).or_else(|| caps.get(0))?;
            let mut chars = found.as_str().trim().chars();
            let letter = chars.next()?.to_ascii_uppercase();
            return (chars.next().is_none() && allowed.contains(&letter)).then_some(letter);
        }

        self.token
            .captures_iter(response)
            .filter_map(|c| c.get(1).and_then(|m| m.as_str().chars().next()))
            .find(|letter| allowed.contains(letter))
    }
}

/// Letter of the reference answer; answers given as choice text map to their position.
fn reference_letter(sample: &Sample, options: &[char]) -> Option<char> {
    let answer = sample.answer.trim();
    let mut chars = answer.chars();
    if let (Some(first), None) = (chars.next(), chars.next()) {
        let upper = first.to_ascii_uppercase();
        if options.contains(&upper) {
            return Some(upper);
        }
    }
    let wanted = normalize(answer);
    sample
        .choices
        .iter()
        .position(|c| normalize(c) == wanted)
        .and_then(|i| options.get(i).copied())
}

#[async_trait]
impl Comparator for ChoiceExtract {
    fn name(&self) -> &'static str {
        "choice_extract"
    }

    async fn compare(&self, sample: &Sample, response: &str) -> Judgement {
        let Some(letter) = self.extract(sample, response) else {
            return Judgement::miss();
        };
        let expected = reference_letter(sample, &self.options);
        Judgement::graded(letter.to_string(), expected == Some(letter))
    }
}

pub struct KeywordOverlap {
    threshold: f64,
    letters: Vec<char>,
}

impl KeywordOverlap {
    pub fn new(threshold: f64) -> Self {
        Self {
            threshold,
            letters: ('A'..='Z').collect(),
        }
    }
}

pub fn keywords(text: &str) -> BTreeSet<String> {
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|w| w.chars().count() >= MIN_KEYWORD_LEN)
        .map(str::to_lowercase)
        .collect()
}

/// Share of `target`'s keywords that also occur in `found`.
fn overlap(target: &BTreeSet<String>, found: &BTreeSet<String>) -> f64 {
    if target.is_empty() {
        return 0.0;
    }
    target.intersection(found).count() as f64 / target.len() as f64
}

#[async_trait]
impl Comparator for KeywordOverlap {
    fn name(&self) -> &'static str {
        "keyword_overlap"
    }

    async fn compare(&self, sample: &Sample, response: &str) -> Judgement {
        let found = keywords(response);

        if !sample.choices.is_empty() {
            let mut best: Option<(usize, f64)> = None;
            for (i, choice) in sample.choices.iter().enumerate() {
                let score = overlap(&keywords(choice), &found);
                if score > 0.0 && best.map_or(true, |(_, b)| score > b) {
                    best = Some((i, score));
                }
            }
            let Some((index, _)) = best else {
                return Judgement::miss();
            };
            let Some(letter) = self.letters.get(index).copied() else {
                return Judgement::miss();
            };
            let expected = reference_letter(sample, &self.letters);
            return Judgement::graded(letter.to_string(), expected == Some(letter));
        }

        let target = keywords(&sample.answer);
        if target.is_empty() {
            let extracted = normalize(response);
            let correct = extracted == normalize(&sample.answer);
            return Judgement::graded(extracted, correct);
        }

        let matched: Vec<&str> = target
            .intersection(&found)
            .map(String::as_str)
            .collect();
        let share = matched.len() as f64 / target.len() as f64;
        Judgement::graded(matched.join(" "), share >= self.threshold)
    }
}

pub struct ExternalJudge {
    judge: Arc<dyn Judge>,
    timeout: Duration,
}

impl ExternalJudge {
    pub fn new(judge: Arc<dyn Judge>, timeout: Duration) -> Self {
        Self { judge, timeout }
    }
}

#[async_trait]
impl Comparator for ExternalJudge {
    fn name(&self) -> &'static str {
        "external_judge"
    }

    async fn compare(&self, sample: &Sample, response: &str) -> Judgement {
        let request = JudgeRequest {
            sample_id: &sample.id,
            task: &sample.task,
            subtask: sample.subtask(),
            reference: &sample.answer,
            choices: &sample.choices,
            response,
        };
        let extracted = response.trim().to_string();

        match tokio::time::timeout(self.timeout, self.judge.judge(&request)).await {
            Ok(Ok(correct)) => Judgement::graded(extracted, correct),
            Ok(Err(e)) => {
                warn!(sample_id = %sample.id, judge = %self.judge.name(), error = %e, "Judge failed");
                Judgement {
                    extracted,
                    verdict: Verdict::JudgeFailed,
                }
            }
            Err(_) => {
                warn!(
                    sample_id = %sample.id,
                    judge = %self.judge.name(),
                    timeout_secs = %self.timeout.as_secs(),
                    "Judge timed out"
                );
                Judgement {
                    extracted,
                    verdict: Verdict::JudgeFailed,
                }
            }
        }
    }
}

/// Builds one comparator per task in the table.
pub fn build_comparators(
    table: &TaskTable,
    judge: Option<Arc<dyn Judge>>,
    judge_timeout: Duration,
) -> Result<HashMap<String, Arc<dyn Comparator>>, ScoreError> {
    table.validate()?;
    let mut comparators: HashMap<String, Arc<dyn Comparator>> = HashMap::new();
    for (task, rule) in &table.tasks {
        let comparator: Arc<dyn Comparator> = match rule {
            ComparisonRule::ExactMatch => Arc::new(ExactMatch),
            ComparisonRule::ChoiceExtract { options } => Arc::new(ChoiceExtract::new(options)?),
            ComparisonRule::KeywordOverlap { threshold } => {
                Arc::new(KeywordOverlap::new(*threshold))
            }
            ComparisonRule::ExternalJudge => {
                let judge = judge.clone().ok_or_else(|| ScoreError::MissingJudge {
                    task: task.clone(),
                })?;
                Arc::new(ExternalJudge::new(judge, judge_timeout))
            }
        };
        comparators.insert(task.clone(), comparator);
    }
    Ok(comparators)
}
