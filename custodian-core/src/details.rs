//! Tagged key/value details attached to audit events and consent records.
//!
//! Values are restricted to a fixed set of primitive kinds so that
//! serialization and redaction are total.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

pub const REDACTED: &str = "[redacted]";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum DetailValue {
    Text(String),
    Number(f64),
    Bool(bool),
    Timestamp(DateTime<Utc>),
}

impl DetailValue {
    pub fn as_text(&self) -> Option<&str> {
        match self {
            DetailValue::Text(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_number(&self) -> Option<f64> {
        match self {
            DetailValue::Number(n) => Some(*n),
            _ => None,
        }
    }
}

impl fmt::Display for DetailValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DetailValue::Text(s) => write!(f, "{}", s),
            DetailValue::Number(n) => write!(f, "{}", n),
            DetailValue::Bool(b) => write!(f, "{}", b),
            DetailValue::Timestamp(t) => write!(f, "{}", t.to_rfc3339()),
        }
    }
}

impl From<&str> for DetailValue {
    fn from(value: &str) -> Self {
        DetailValue::Text(value.to_string())
    }
}

impl From<String> for DetailValue {
    fn from(value: String) -> Self {
        DetailValue::Text(value)
    }
}

impl From<&String> for DetailValue {
    fn from(value: &String) -> Self {
        DetailValue::Text(value.clone())
    }
}

impl From<f64> for DetailValue {
    fn from(value: f64) -> Self {
        DetailValue::Number(value)
    }
}

impl From<i64> for DetailValue {
    fn from(value: i64) -> Self {
        DetailValue::Number(value as f64)
    }
}

impl From<u64> for DetailValue {
    fn from(value: u64) -> Self {
        DetailValue::Number(value as f64)
    }
}

impl From<usize> for DetailValue {
    fn from(value: usize) -> Self {
        DetailValue::Number(value as f64)
    }
}

impl From<bool> for DetailValue {
    fn from(value: bool) -> Self {
        DetailValue::Bool(value)
    }
}

impl From<DateTime<Utc>> for DetailValue {
    fn from(value: DateTime<Utc>) -> Self {
        DetailValue::Timestamp(value)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Details(BTreeMap<String, DetailValue>);

impl Details {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder-style insert.
    pub fn with(mut self, key: impl Into<String>, value: impl Into<DetailValue>) -> Self {
        self.0.insert(key.into(), value.into());
        self
    }

    /// Insert only when `value` is present.
    pub fn with_opt<V: Into<DetailValue>>(self, key: impl Into<String>, value: Option<V>) -> Self {
        match value {
            Some(v) => self.with(key, v),
            None => self,
        }
    }

    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<DetailValue>) {
        self.0.insert(key.into(), value.into());
    }

    pub fn get(&self, key: &str) -> Option<&DetailValue> {
        self.0.get(key)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &DetailValue)> {
        self.0.iter()
    }

    /// True when any text value equals `needle`.
    pub fn mentions(&self, needle: &str) -> bool {
        self.0.values().any(|v| v.as_text() == Some(needle))
    }

    /// Copy with the text values of `keys` replaced by a marker.
    pub fn redacted(&self, keys: &[&str]) -> Self {
        let mut out = self.clone();
        for key in keys {
            if let Some(value) = out.0.get_mut(*key) {
                *value = DetailValue::Text(REDACTED.to_string());
            }
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builder_and_lookup() {
        let details = Details::new()
            .with("resource", "doc")
            .with("count", 3u64)
            .with("allowed", true)
            .with_opt("missing", None::<&str>);

        assert_eq!(details.len(), 3);
        assert_eq!(details.get("resource"), Some(&DetailValue::Text("doc".into())));
        assert_eq!(details.get("count").and_then(|v| v.as_number()), Some(3.0));
        assert!(details.get("missing").is_none());
    }

    #[test]
    fn test_serialization_is_tagged() {
        let details = Details::new().with("allowed", true);
        let json = serde_json::to_value(&details).unwrap();
        assert_eq!(json["allowed"]["kind"], "bool");
        assert_eq!(json["allowed"]["value"], true);

        let back: Details = serde_json::from_value(json).unwrap();
        assert_eq!(back, details);
    }

    #[test]
    fn test_mentions_matches_text_values_only() {
        let details = Details::new().with("subject", "u1").with("count", 1u64);
        assert!(details.mentions("u1"));
        assert!(!details.mentions("1"));
        assert!(!details.mentions("subject"));
    }

    #[test]
    fn test_redacted_leaves_other_keys() {
        let details = Details::new().with("email", "a@b.c").with("action", "login");
        let redacted = details.redacted(&["email", "absent"]);
        assert_eq!(redacted.get("email").and_then(|v| v.as_text()), Some(REDACTED));
        assert_eq!(redacted.get("action").and_then(|v| v.as_text()), Some("login"));
        assert_eq!(details.get("email").and_then(|v| v.as_text()), Some("a@b.c"));
    }
}
