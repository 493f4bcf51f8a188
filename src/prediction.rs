use anyhow::{Context, Result};
use serde::de::{self as de, Deserializer, MapAccess, SeqAccess, Visitor};
use serde::Deserialize;
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use std::path::Path;
use tracing::{info, warn};

use crate::error::ScoreError;
use crate::task::registry::read_records;
use crate::task::types::scalar_to_string;
use crate::task::ReferenceSet;

const ID_FIELDS: &[&str] = &["id", "sample_id", "question_id"];
const TEXT_FIELDS: &[&str] = &["output", "response", "prediction", "text"];
const NESTED_TEXT_FIELDS: &[&str] = &["output_explanation", "text"];

/// Raw model responses keyed by sample id. `None` means the model gave no answer.
#[derive(Debug, Clone, Default)]
pub struct Predictions {
    entries: HashMap<String, Option<String>>,
}

impl Predictions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, id: impl Into<String>, text: impl Into<String>) {
        self.entries.insert(id.into(), Some(text.into()));
    }

    pub fn get(&self, id: &str) -> Option<&str> {
        self.entries.get(id).and_then(|t| t.as_deref())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn ids(&self) -> impl Iterator<Item = &str> {
        self.entries.keys().map(String::as_str)
    }

    /// Accepts `{id: text}`, `{id: {output: text}}`, or an array of records with an id field.
    pub fn from_value(value: Value) -> Result<Self, ScoreError> {
        match value {
            Value::Object(map) => Self::from_mapping(map.into_iter().collect()),
            Value::Array(items) => Self::from_records(items),
            other => Err(top_level_error(type_name(&other))),
        }
    }

    /// Parses a JSON predictions document. Unlike going through `Value`, a key
    /// repeated in the top-level object is reported instead of overwritten.
    pub fn from_json(content: &str) -> Result<Self> {
        let document: Document =
            serde_json::from_str(content).context("Predictions are not valid JSON")?;
        let predictions = match document {
            Document::Mapping(pairs) => Self::from_mapping(pairs)?,
            Document::Records(items) => Self::from_records(items)?,
            Document::Scalar(kind) => return Err(top_level_error(kind).into()),
        };
        Ok(predictions)
    }

    fn from_mapping(pairs: Vec<(String, Value)>) -> Result<Self, ScoreError> {
        let mut entries = HashMap::with_capacity(pairs.len());
        for (id, value) in pairs {
            let text = response_text(&value).map_err(|reason| {
                ScoreError::MalformedPredictions(format!("prediction {:?}: {}", id, reason))
            })?;
            if entries.contains_key(&id) {
                return Err(duplicate_error(&id));
            }
            entries.insert(id, text);
        }
        Ok(Self { entries })
    }

    fn from_records(items: Vec<Value>) -> Result<Self, ScoreError> {
        let mut entries = HashMap::with_capacity(items.len());
        for (index, item) in items.into_iter().enumerate() {
            let Value::Object(record) = item else {
                return Err(ScoreError::MalformedPredictions(format!(
                    "record {} is not an object",
                    index
                )));
            };
            let id = ID_FIELDS
                .iter()
                .find_map(|f| record.get(*f).and_then(scalar_to_string))
                .ok_or_else(|| {
                    ScoreError::MalformedPredictions(format!("record {} has no sample id", index))
                })?;
            let text = response_text(&Value::Object(record)).map_err(|reason| {
                ScoreError::MalformedPredictions(format!("record {} ({:?}): {}", index, id, reason))
            })?;
            if entries.contains_key(&id) {
                return Err(duplicate_error(&id));
            }
            entries.insert(id, text);
        }
        Ok(Self { entries })
    }

    pub fn load(path: &Path) -> Result<Self> {
        let predictions = if path.extension().and_then(|e| e.to_str()) == Some("jsonl") {
            Self::from_records(read_records(path)?)
                .with_context(|| format!("Failed to interpret predictions {}", path.display()))?
        } else {
            let content = std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read predictions {}", path.display()))?;
            Self::from_json(&content)
                .with_context(|| format!("Failed to interpret predictions {}", path.display()))?
        };
        info!(
            "Loaded {} predictions from {}",
            predictions.len(),
            path.display()
        );
        Ok(predictions)
    }

    /// Fails when no prediction id matches the reference set; otherwise returns the unmatched count.
    pub fn check_resolvable(&self, references: &ReferenceSet) -> Result<usize, ScoreError> {
        if self.entries.is_empty() {
            return Ok(0);
        }
        let unmatched = self.ids().filter(|id| !references.contains(id)).count();
        if unmatched == self.entries.len() {
            return Err(ScoreError::MalformedPredictions(format!(
                "none of the {} prediction ids match the reference set",
                unmatched
            )));
        }
        if unmatched > 0 {
            warn!(
                unmatched = unmatched,
                "Ignoring predictions for samples not in the reference set"
            );
        }
        Ok(unmatched)
    }
}

/// Top level of a predictions file, with object keys kept in file order and repeats intact.
enum Document {
    Mapping(Vec<(String, Value)>),
    Records(Vec<Value>),
    Scalar(&'static str),
}

impl<'de> Deserialize<'de> for Document {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        deserializer.deserialize_any(DocumentVisitor)
    }
}

struct DocumentVisitor;

impl<'de> Visitor<'de> for DocumentVisitor {
    type Value = Document;

    fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("an object or array of predictions")
    }

    fn visit_map<A>(self, mut map: A) -> Result<Document, A::Error>
    where
        A: MapAccess<'de>,
    {
        let mut pairs = Vec::with_capacity(map.size_hint().unwrap_or(0));
        while let Some((id, value)) = map.next_entry::<String, Value>()? {
            pairs.push((id, value));
        }
        Ok(Document::Mapping(pairs))
    }

    fn visit_seq<A>(self, mut seq: A) -> Result<Document, A::Error>
    where
        A: SeqAccess<'de>,
    {
        let mut items = Vec::with_capacity(seq.size_hint().unwrap_or(0));
        while let Some(item) = seq.next_element::<Value>()? {
            items.push(item);
        }
        Ok(Document::Records(items))
    }

    fn visit_unit<E>(self) -> Result<Document, E>
    where
        E: de::Error,
    {
        Ok(Document::Scalar("null"))
    }

    fn visit_bool<E>(self, _: bool) -> Result<Document, E>
    where
        E: de::Error,
    {
        Ok(Document::Scalar("boolean"))
    }

    fn visit_i64<E>(self, _: i64) -> Result<Document, E>
    where
        E: de::Error,
    {
        Ok(Document::Scalar("number"))
    }

    fn visit_u64<E>(self, _: u64) -> Result<Document, E>
    where
        E: de::Error,
    {
        Ok(Document::Scalar("number"))
    }

    fn visit_f64<E>(self, _: f64) -> Result<Document, E>
    where
        E: de::Error,
    {
        Ok(Document::Scalar("number"))
    }

    fn visit_str<E>(self, _: &str) -> Result<Document, E>
    where
        E: de::Error,
    {
        Ok(Document::Scalar("string"))
    }
}

fn top_level_error(kind: &str) -> ScoreError {
    ScoreError::MalformedPredictions(format!(
        "expected an object or array at top level, got {}",
        kind
    ))
}

fn duplicate_error(id: &str) -> ScoreError {
    ScoreError::MalformedPredictions(format!("duplicate prediction for sample {:?}", id))
}

fn response_text(value: &Value) -> Result<Option<String>, String> {
    match value {
        Value::String(s) => Ok(Some(s.clone())),
        Value::Null => Ok(None),
        Value::Object(map) => {
            for field in TEXT_FIELDS {
                match map.get(*field) {
                    None => continue,
                    Some(Value::Null) => return Ok(None),
                    Some(Value::String(s)) => return Ok(Some(s.clone())),
                    Some(Value::Object(nested)) => {
                        return Ok(NESTED_TEXT_FIELDS
                            .iter()
                            .find_map(|f| nested.get(*f).and_then(Value::as_str))
                            .map(str::to_string));
                    }
                    Some(other) => {
                        return Err(format!("field {:?} is a {}", field, type_name(other)));
                    }
                }
            }
            Err(format!("no response field (expected one of {:?})", TEXT_FIELDS))
        }
        other => Err(format!("expected text, got {}", type_name(other))),
    }
}

fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::Sample;
    use serde_json::json;

    #[test]
    fn test_from_flat_mapping() {
        let p = Predictions::from_value(json!({"q1": "A", "q2": "The answer is C"}))
            .expect("should parse");
        assert_eq!(p.len(), 2);
        assert_eq!(p.get("q2"), Some("The answer is C"));
        assert_eq!(p.get("q3"), None);
    }

    #[test]
    fn test_from_nested_mapping() {
        let p = Predictions::from_value(json!({
            "q1": {"response": "B"},
            "q2": {"output": null},
            "q3": {"output": {"output_explanation": "the sky was recolored", "output_image": "x.png"}}
        }))
        .expect("should parse");
        assert_eq!(p.get("q1"), Some("B"));
        assert_eq!(p.get("q2"), None);
        assert_eq!(p.get("q3"), Some("the sky was recolored"));
    }

    #[test]
    fn test_from_record_array() {
        let p = Predictions::from_value(json!([
            {"id": 1, "category": "ocr", "output": "A", "answer": "A"},
            {"question_id": "2", "prediction": "D"}
        ]))
        .expect("should parse");
        assert_eq!(p.get("1"), Some("A"));
        assert_eq!(p.get("2"), Some("D"));
    }

    #[test]
    fn test_duplicate_record_rejected() {
        let err = Predictions::from_value(json!([
            {"id": "a", "output": "A"},
            {"id": "a", "output": "B"}
        ]))
        .unwrap_err();
        assert!(err.to_string().contains("duplicate"));
    }

    #[test]
    fn test_record_without_id_rejected() {
        assert!(Predictions::from_value(json!([{"output": "A"}])).is_err());
    }

    #[test]
    fn test_value_without_text_rejected() {
        assert!(Predictions::from_value(json!({"q1": {"score": 3}})).is_err());
        assert!(Predictions::from_value(json!({"q1": 7})).is_err());
    }

    #[test]
    fn test_scalar_top_level_rejected() {
        let err = Predictions::from_value(json!("A")).unwrap_err();
        assert!(matches!(err, ScoreError::MalformedPredictions(_)));
    }

    #[test]
    fn test_check_resolvable() {
        let refs = ReferenceSet::new(vec![Sample::new("q1", "t", "A"), Sample::new("q2", "t", "B")])
            .expect("should build");

        let mut partial = Predictions::new();
        partial.insert("q1", "A");
        partial.insert("stray", "B");
        assert_eq!(partial.check_resolvable(&refs).expect("resolvable"), 1);

        let mut none = Predictions::new();
        none.insert("x", "A");
        assert!(none.check_resolvable(&refs).is_err());

        assert_eq!(Predictions::new().check_resolvable(&refs).expect("empty ok"), 0);
    }

    #[test]
    fn test_load_jsonl() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("preds.jsonl");
        std::fs::write(
            &path,
            "{\"id\": \"q1\", \"output\": \"A\"}\n{\"id\": \"q2\", \"output\": \"B\"}\n",
        )
        .unwrap();
        let p = Predictions::load(&path).expect("should load");
        assert_eq!(p.len(), 2);
    }

    #[test]
    fn test_repeated_key_in_mapping_rejected() {
        let err = Predictions::from_json(r#"{"q1": "A", "q2": "C", "q1": "B"}"#).unwrap_err();
        let typed = err
            .chain()
            .find_map(|c| c.downcast_ref::<ScoreError>())
            .expect("should carry a ScoreError");
        assert!(matches!(typed, ScoreError::MalformedPredictions(m) if m.contains("\"q1\"")));
    }

    #[test]
    fn test_load_repeated_key_rejected() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("preds.json");
        std::fs::write(&path, r#"{"q1": "A", "q1": "B"}"#).unwrap();
        let err = Predictions::load(&path).unwrap_err();
        assert_eq!(crate::error::exit_code_for(&err), 2);
    }

    #[test]
    fn test_from_json_matches_from_value() {
        let text = r#"{"q1": {"response": "B"}, "q2": null, "q3": "C"}"#;
        let parsed = Predictions::from_json(text).expect("should parse");
        let via_value =
            Predictions::from_value(serde_json::from_str(text).unwrap()).expect("should parse");
        assert_eq!(parsed.entries, via_value.entries);

        let records = Predictions::from_json(r#"[{"id": "q1", "output": "A"}]"#).expect("records");
        assert_eq!(records.get("q1"), Some("A"));

        let err = Predictions::from_json(r#""A""#).unwrap_err();
        assert_eq!(crate::error::exit_code_for(&err), 2);
    }

    #[test]
    fn test_load_invalid_json() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("preds.json");
        std::fs::write(&path, "{not json").unwrap();
        assert!(Predictions::load(&path).is_err());
    }
}
