//! Classifier backends and the structured-output contract they share.

use core_model::{ClassificationSignal, CrmRecord, Field, FieldSet, SyncError};
use serde_json::{Map, Value};

mod command;
mod rules;

pub use command::{CLASSIFIER_KEY_ENV, CommandClassifier};
pub use rules::RuleClassifier;

/// Drops a surrounding markdown code fence (with or without a language tag).
pub fn strip_code_fence(raw: &str) -> &str {
    let trimmed = raw.trim();
    let Some(rest) = trimmed.strip_prefix("```") else {
        return trimmed;
    };
    let body = rest.split_once('\n').map(|(_, body)| body).unwrap_or("");
    body.trim_end()
        .strip_suffix("```")
        .unwrap_or(body)
        .trim()
}

/// Parses a classification verdict. Missing keys take their defaults; text
/// that is not a JSON object is a `ClassificationParse` error.
pub fn parse_signal(raw: &str) -> Result<ClassificationSignal, SyncError> {
    let body = strip_code_fence(raw);
    let value: Value =
        serde_json::from_str(body).map_err(|e| SyncError::ClassificationParse(e.to_string()))?;
    if !value.is_object() {
        return Err(SyncError::ClassificationParse(format!(
            "expected an object, got {}",
            kind_of(&value)
        )));
    }
    serde_json::from_value(value).map_err(|e| SyncError::ClassificationParse(e.to_string()))
}

/// Parses proposed field values, keeping only `wanted` fields with string
/// values. Keys may use any spelling `Field` accepts.
pub fn parse_field_set(raw: &str, wanted: &[Field]) -> Result<FieldSet, SyncError> {
    let body = strip_code_fence(raw);
    let value: Value =
        serde_json::from_str(body).map_err(|e| SyncError::ClassificationParse(e.to_string()))?;
    let Value::Object(obj) = value else {
        return Err(SyncError::ClassificationParse(format!(
            "expected an object, got {}",
            kind_of(&value)
        )));
    };
    let mut out = FieldSet::new();
    for (key, val) in obj {
        let Ok(field) = key.parse::<Field>() else {
            continue;
        };
        if let (true, Some(text)) = (wanted.contains(&field), val.as_str()) {
            out.set_non_empty(field, text);
        }
    }
    Ok(out)
}

/// Free text, or the `summary`/`answer` member when the reply is JSON.
pub fn parse_text(raw: &str) -> String {
    let body = strip_code_fence(raw);
    if let Ok(Value::Object(obj)) = serde_json::from_str::<Value>(body) {
        for key in ["summary", "answer", "text"] {
            if let Some(text) = obj.get(key).and_then(Value::as_str) {
                return text.trim().to_string();
            }
        }
    }
    body.to_string()
}

pub(crate) fn record_json(record: &CrmRecord) -> Value {
    let mut obj = Map::new();
    for field in Field::ALL {
        obj.insert(field.as_str().to_string(), Value::String(record.get(field)));
    }
    Value::Object(obj)
}

fn kind_of(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fenced_signal_parses() {
        let raw = "```json\n{\"relevant\": true, \"organization\": \"Acme\"}\n```";
        let signal = parse_signal(raw).unwrap();
        assert!(signal.relevant);
        assert_eq!(signal.organization, "Acme");
        assert!(signal.note_text.is_empty());
    }

    #[test]
    fn bare_signal_parses() {
        let signal = parse_signal(r#" {"relevant": false} "#).unwrap();
        assert!(!signal.relevant);
    }

    #[test]
    fn prose_is_a_parse_error() {
        let err = parse_signal("Sure! This looks relevant.").unwrap_err();
        assert!(matches!(err, SyncError::ClassificationParse(_)));
        let err = parse_signal("[1, 2]").unwrap_err();
        assert!(err.to_string().contains("an array"));
    }

    #[test]
    fn field_set_keeps_only_wanted_strings() {
        let raw = r#"{"company": "Acme", "email": "x@y.com", "status": 3, "colour": "red"}"#;
        let set = parse_field_set(raw, &[Field::Organization, Field::MeetingStatus]).unwrap();
        assert_eq!(set.len(), 1);
        assert_eq!(set.get(Field::Organization), Some("Acme"));
    }

    #[test]
    fn text_prefers_summary_member() {
        assert_eq!(parse_text("{\"summary\": \" Two intros. \"}"), "Two intros.");
        assert_eq!(parse_text("  plain words \n"), "plain words");
    }

    #[test]
    fn fence_without_closing_is_tolerated() {
        assert_eq!(strip_code_fence("```\n{}"), "{}");
        assert_eq!(strip_code_fence("{}"), "{}");
    }
}
