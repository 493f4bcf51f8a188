use regex::Regex;
use serde::{Deserialize, Deserializer, Serialize};
use std::fmt;
use std::str::FromStr;

/// What kind of model produced the predictions, and what a sample needs.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CapabilityClass {
    Understanding,
    Generation,
    #[default]
    Unified,
}

impl CapabilityClass {
    /// Whether a model of this class can be asked a sample that requires `required`.
    pub fn covers(self, required: CapabilityClass) -> bool {
        match self {
            CapabilityClass::Unified => true,
            other => other == required,
        }
    }
}

impl fmt::Display for CapabilityClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            CapabilityClass::Understanding => "understanding",
            CapabilityClass::Generation => "generation",
            CapabilityClass::Unified => "unified",
        };
        f.pad(name)
    }
}

impl FromStr for CapabilityClass {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "understanding" => Ok(CapabilityClass::Understanding),
            "generation" => Ok(CapabilityClass::Generation),
            "unified" => Ok(CapabilityClass::Unified),
            other => Err(format!(
                "unknown capability class {:?} (expected understanding, generation or unified)",
                other
            )),
        }
    }
}

/// One benchmark question with its reference answer.
#[derive(Debug, Clone, Deserialize)]
pub struct Sample {
    #[serde(alias = "sample_id", deserialize_with = "scalar_string")]
    pub id: String,
    pub task: String,
    #[serde(default, alias = "category")]
    pub subtask: Option<String>,
    #[serde(alias = "reference", deserialize_with = "scalar_string")]
    pub answer: String,
    #[serde(default, alias = "choice")]
    pub choices: Vec<String>,
    #[serde(default, deserialize_with = "optional_pattern")]
    pub answer_pattern: Option<Regex>,
    #[serde(default)]
    pub requires: Option<CapabilityClass>,
}

impl Sample {
    pub fn new(id: impl Into<String>, task: impl Into<String>, answer: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            task: task.into(),
            subtask: None,
            answer: answer.into(),
            choices: Vec::new(),
            answer_pattern: None,
            requires: None,
        }
    }

    pub fn with_subtask(mut self, subtask: impl Into<String>) -> Self {
        self.subtask = Some(subtask.into());
        self
    }

    pub fn with_choices<I, S>(mut self, choices: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.choices = choices.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_pattern(mut self, pattern: Regex) -> Self {
        self.answer_pattern = Some(pattern);
        self
    }

    pub fn with_requirement(mut self, requires: CapabilityClass) -> Self {
        self.requires = Some(requires);
        self
    }

    /// Subtask label; samples without one report under their task name.
    pub fn subtask(&self) -> &str {
        self.subtask.as_deref().unwrap_or(&self.task)
    }

    pub fn is_applicable(&self, capability: CapabilityClass) -> bool {
        self.requires.map_or(true, |required| capability.covers(required))
    }
}

/// Accepts strings, integers and booleans; datasets are not consistent about ids.
pub(crate) fn scalar_string<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    let value = serde_json::Value::deserialize(deserializer)?;
    scalar_to_string(&value)
        .ok_or_else(|| serde::de::Error::custom(format!("expected a string or number, got {}", value)))
}

pub(crate) fn scalar_to_string(value: &serde_json::Value) -> Option<String> {
    match value {
        serde_json::Value::String(s) => Some(s.clone()),
        serde_json::Value::Number(n) => Some(n.to_string()),
        serde_json::Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

fn optional_pattern<'de, D>(deserializer: D) -> Result<Option<Regex>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw: Option<String> = Option::deserialize(deserializer)?;
    match raw {
        Some(p) if !p.trim().is_empty() => Regex::new(&p)
            .map(Some)
            .map_err(|e| serde::de::Error::custom(format!("invalid answer_pattern {:?}: {}", p, e))),
        _ => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_capability_covers() {
        assert!(CapabilityClass::Unified.covers(CapabilityClass::Generation));
        assert!(CapabilityClass::Unified.covers(CapabilityClass::Understanding));
        assert!(CapabilityClass::Understanding.covers(CapabilityClass::Understanding));
        assert!(!CapabilityClass::Understanding.covers(CapabilityClass::Generation));
        assert!(!CapabilityClass::Generation.covers(CapabilityClass::Unified));
    }

    #[test]
    fn test_capability_parse() {
        assert_eq!(
            "Generation".parse::<CapabilityClass>(),
            Ok(CapabilityClass::Generation)
        );
        assert!("omni".parse::<CapabilityClass>().is_err());
    }

    #[test]
    fn test_sample_deserialize_aliases() {
        let json = r#"{
            "sample_id": 42,
            "task": "understanding",
            "category": "ocr",
            "reference": "B",
            "choice": ["cat", "dog", "fish"]
        }"#;
        let sample: Sample = serde_json::from_str(json).expect("should deserialize");
        assert_eq!(sample.id, "42");
        assert_eq!(sample.subtask(), "ocr");
        assert_eq!(sample.answer, "B");
        assert_eq!(sample.choices.len(), 3);
        assert!(sample.answer_pattern.is_none());
        assert!(sample.requires.is_none());
    }

    #[test]
    fn test_sample_subtask_defaults_to_task() {
        let sample = Sample::new("1", "spot_diff", "3");
        assert_eq!(sample.subtask(), "spot_diff");
    }

    #[test]
    fn test_sample_pattern_and_requirement() {
        let json = r#"{
            "id": "g-1",
            "task": "text_image_generation",
            "answer": "A",
            "answer_pattern": "Option\\s+([A-D])",
            "requires": "generation"
        }"#;
        let sample: Sample = serde_json::from_str(json).expect("should deserialize");
        assert!(sample.answer_pattern.is_some());
        assert!(sample.is_applicable(CapabilityClass::Unified));
        assert!(sample.is_applicable(CapabilityClass::Generation));
        assert!(!sample.is_applicable(CapabilityClass::Understanding));
    }

    #[test]
    fn test_sample_rejects_bad_pattern() {
        let json = r#"{"id": "x", "task": "t", "answer": "A", "answer_pattern": "([A-"}"#;
        let err = serde_json::from_str::<Sample>(json).unwrap_err();
        assert!(err.to_string().contains("answer_pattern"));
    }

    #[test]
    fn test_sample_rejects_structured_id() {
        let json = r#"{"id": {"n": 1}, "task": "t", "answer": "A"}"#;
        assert!(serde_json::from_str::<Sample>(json).is_err());
    }
}
