// SPDX-License-Identifier: AGPL-3.0-only
// Copyright (c) 2025 The Rucket Authors

//! Attribute values observed on nodes or declared in clauses.

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A single attribute value.
///
/// Values keep the type they were declared or observed with, but comparisons
/// are lenient: two values are compared numerically whenever both sides parse
/// as numbers, so an opaque tag such as `metrics:x:y` holding `"12.7"` still
/// compares against `<13`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum TagValue {
    /// Integer value.
    Int(i64),
    /// Floating point value.
    Float(f64),
    /// String value.
    Str(String),
}

impl TagValue {
    /// Returns the numeric view of this value, parsing strings if needed.
    #[must_use]
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Self::Int(i) => Some(*i as f64),
            Self::Float(f) => Some(*f),
            Self::Str(s) => s.trim().parse::<f64>().ok().filter(|f| f.is_finite()),
        }
    }

    /// Returns the string if this is a string value.
    #[must_use]
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::Str(s) => Some(s),
            _ => None,
        }
    }

    /// Converts a JSON scalar. Arrays, objects and null have no tag form.
    #[must_use]
    pub fn from_json(value: &Value) -> Option<Self> {
        match value {
            Value::Number(n) => match n.as_i64() {
                Some(i) => Some(Self::Int(i)),
                None => n.as_f64().map(Self::Float),
            },
            Value::String(s) => Some(Self::Str(s.clone())),
            Value::Bool(b) => Some(Self::Str(b.to_string())),
            Value::Null | Value::Array(_) | Value::Object(_) => None,
        }
    }

    /// Converts back to a JSON scalar.
    #[must_use]
    pub fn to_json(&self) -> Value {
        match self {
            Self::Int(i) => Value::from(*i),
            Self::Float(f) => Value::from(*f),
            Self::Str(s) => Value::from(s.as_str()),
        }
    }

    /// Equality used by clause conditions: numeric when both sides are
    /// numeric, otherwise a case-sensitive string comparison.
    #[must_use]
    pub fn matches(&self, other: &TagValue) -> bool {
        match (self.as_f64(), other.as_f64()) {
            (Some(a), Some(b)) => a == b,
            _ => self.to_string() == other.to_string(),
        }
    }
}

impl fmt::Display for TagValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Int(i) => write!(f, "{i}"),
            Self::Float(v) => write!(f, "{v}"),
            Self::Str(s) => f.write_str(s),
        }
    }
}

impl From<i64> for TagValue {
    fn from(value: i64) -> Self {
        Self::Int(value)
    }
}

impl From<f64> for TagValue {
    fn from(value: f64) -> Self {
        Self::Float(value)
    }
}

impl From<&str> for TagValue {
    fn from(value: &str) -> Self {
        Self::Str(value.to_string())
    }
}

impl From<String> for TagValue {
    fn from(value: String) -> Self {
        Self::Str(value)
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn test_numeric_view() {
        assert_eq!(TagValue::Int(4).as_f64(), Some(4.0));
        assert_eq!(TagValue::from("12.7").as_f64(), Some(12.7));
        assert_eq!(TagValue::from("rack1").as_f64(), None);
        assert_eq!(TagValue::from("NaN").as_f64(), None);
    }

    #[test]
    fn test_matches_is_numeric_or_case_sensitive() {
        assert!(TagValue::Int(1).matches(&TagValue::from("1.0")));
        assert!(TagValue::from("ssd").matches(&TagValue::from("ssd")));
        assert!(!TagValue::from("overseer").matches(&TagValue::from("OVERSEER")));
    }

    #[test]
    fn test_from_json() {
        assert_eq!(TagValue::from_json(&json!(3)), Some(TagValue::Int(3)));
        assert_eq!(TagValue::from_json(&json!(3.5)), Some(TagValue::Float(3.5)));
        assert_eq!(TagValue::from_json(&json!("x")), Some(TagValue::from("x")));
        assert_eq!(TagValue::from_json(&json!(null)), None);
        assert_eq!(TagValue::from_json(&json!([1])), None);
    }

    #[test]
    fn test_untagged_serde() {
        let values: Vec<TagValue> = serde_json::from_str(r#"[1, 2.5, "a"]"#).unwrap();
        assert_eq!(values, vec![TagValue::Int(1), TagValue::Float(2.5), TagValue::from("a")]);
        assert_eq!(serde_json::to_string(&values).unwrap(), r#"[1,2.5,"a"]"#);
    }
}
