//! Canonical keyword-argument mappings.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};

use crate::error::{MetricError, Result};

/// A key-ordered mapping of JSON values used for domain and value kwargs.
///
/// Key order never affects equality, serialization or [`Kwargs::id`], so two
/// mappings built in different insertion orders are interchangeable.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Kwargs(BTreeMap<String, Value>);

impl Kwargs {
    /// Creates an empty mapping.
    pub fn new() -> Self {
        Self::default()
    }

    /// Converts a JSON value into kwargs.
    ///
    /// `null` becomes the empty mapping; anything other than an object is
    /// rejected immediately.
    pub fn try_from_json(value: Value) -> Result<Self> {
        match value {
            Value::Null => Ok(Self::new()),
            Value::Object(map) => Ok(Self(map.into_iter().collect())),
            other => Err(MetricError::Configuration {
                metric: String::new(),
                kwarg: "kwargs".to_string(),
                message: format!("expected a mapping, got {}", json_type_name(&other)),
            }),
        }
    }

    /// Builder-style insert.
    pub fn with(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.0.insert(key.into(), value.into());
        self
    }

    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<Value>) -> Option<Value> {
        self.0.insert(key.into(), value.into())
    }

    pub fn remove(&mut self, key: &str) -> Option<Value> {
        self.0.remove(key)
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.0.get(key)
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.0.contains_key(key)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &Value)> {
        self.0.iter()
    }

    /// Returns a copy without the given keys.
    pub fn without(&self, keys: &[&str]) -> Self {
        Self(
            self.0
                .iter()
                .filter(|(k, _)| !keys.contains(&k.as_str()))
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
        )
    }

    /// Returns a copy holding only the given keys.
    pub fn only(&self, keys: &[&str]) -> Self {
        Self(
            self.0
                .iter()
                .filter(|(k, _)| keys.contains(&k.as_str()))
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
        )
    }

    /// Canonical JSON text (sorted keys at every depth).
    pub fn to_canonical_json(&self) -> String {
        // serde_json::Map is a BTreeMap without `preserve_order`, so nested
        // objects serialize sorted as well.
        serde_json::to_string(&self.0).unwrap_or_default()
    }

    /// Stable identity of the mapping.
    ///
    /// Empty mappings map to `""`, single-key mappings to `key=value`, and
    /// anything larger to the hex SHA-256 of the canonical JSON.
    pub fn id(&self) -> String {
        let mut entries = self.0.iter();
        match (entries.next(), entries.next()) {
            (None, _) => String::new(),
            (Some((key, value)), None) => format!("{key}={}", display_value(value)),
            _ => hex::encode(Sha256::digest(self.to_canonical_json().as_bytes())),
        }
    }

    /// Reads a string kwarg.
    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.0.get(key).and_then(Value::as_str)
    }

    /// Reads a boolean kwarg.
    pub fn get_bool(&self, key: &str) -> Option<bool> {
        self.0.get(key).and_then(Value::as_bool)
    }

    /// Reads a non-negative integer kwarg.
    pub fn get_u64(&self, key: &str) -> Option<u64> {
        self.0.get(key).and_then(Value::as_u64)
    }
}

impl fmt::Display for Kwargs {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_canonical_json())
    }
}

impl FromIterator<(String, Value)> for Kwargs {
    fn from_iter<I: IntoIterator<Item = (String, Value)>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}

impl<'a> IntoIterator for &'a Kwargs {
    type Item = (&'a String, &'a Value);
    type IntoIter = std::collections::btree_map::Iter<'a, String, Value>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.iter()
    }
}

fn display_value(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

pub(crate) fn json_type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}
