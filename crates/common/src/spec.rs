//! A single resolved experiment: an insertion-ordered mapping from parameter
//! name to YAML value, plus bookkeeping about which parameters were read.
//!
//! Usage tracking exists to catch typos: the run driver resets it (ignoring
//! infrastructure keys) before a module runs, and the module reports every
//! key it never looked at.

use std::cell::RefCell;
use std::collections::BTreeSet;
use std::fmt;

use serde::de::DeserializeOwned;
use serde_yaml::{Mapping, Value};

use crate::error::ConfigError;

#[derive(Debug, Clone, Default)]
pub struct ExperimentSpec {
    entries: Mapping,
    used: RefCell<BTreeSet<String>>,
    ignored: BTreeSet<String>,
}

impl PartialEq for ExperimentSpec {
    fn eq(&self, other: &Self) -> bool {
        self.entries == other.entries
    }
}

impl ExperimentSpec {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_mapping(entries: Mapping) -> Self {
        Self {
            entries,
            ..Default::default()
        }
    }

    /// Accepts a mapping document; an empty (`null`) document yields an empty spec.
    pub fn from_value(value: Value) -> Result<Self, ConfigError> {
        match value {
            Value::Mapping(m) => Ok(Self::from_mapping(m)),
            Value::Null => Ok(Self::new()),
            other => Err(ConfigError::InvalidType {
                key: "<document>".into(),
                expected: "a mapping",
                found: describe(&other),
            }),
        }
    }

    pub fn as_mapping(&self) -> &Mapping {
        &self.entries
    }

    pub fn into_mapping(self) -> Mapping {
        self.entries
    }

    pub fn to_value(&self) -> Value {
        Value::Mapping(self.entries.clone())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Keys in insertion order, rendered as strings.
    pub fn keys(&self) -> impl Iterator<Item = String> + '_ {
        self.entries.iter().map(|(k, _)| key_to_string(k))
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.entries.contains_key(key)
    }

    /// Read a value without counting it as used.
    pub fn peek(&self, key: &str) -> Option<&Value> {
        self.entries.get(key)
    }

    /// Read a value and mark the key as used.
    pub fn get(&self, key: &str) -> Option<&Value> {
        let value = self.entries.get(key);
        if value.is_some() {
            self.used.borrow_mut().insert(key.to_string());
        }
        value
    }

    /// Insert or overwrite. Overwriting keeps the key's original position.
    pub fn set(&mut self, key: &str, value: impl Into<Value>) {
        self.entries
            .insert(Value::String(key.to_string()), value.into());
    }

    pub fn name(&self) -> Option<&str> {
        self.peek("name").and_then(Value::as_str)
    }

    pub fn module(&self) -> Option<&str> {
        self.peek("module").and_then(Value::as_str)
    }

    // ── Typed accessors ─────────────────────────────────────────────────────

    pub fn f64_opt(&self, key: &str) -> Result<Option<f64>, ConfigError> {
        match self.get(key) {
            None | Some(Value::Null) => Ok(None),
            Some(v) => value_as_f64(v)
                .map(Some)
                .ok_or_else(|| invalid(key, "a number", v)),
        }
    }

    pub fn f64_or(&self, key: &str, default: f64) -> Result<f64, ConfigError> {
        Ok(self.f64_opt(key)?.unwrap_or(default))
    }

    pub fn i64_opt(&self, key: &str) -> Result<Option<i64>, ConfigError> {
        match self.get(key) {
            None | Some(Value::Null) => Ok(None),
            Some(v) => value_as_i64(v)
                .map(Some)
                .ok_or_else(|| invalid(key, "an integer", v)),
        }
    }

    pub fn usize_opt(&self, key: &str) -> Result<Option<usize>, ConfigError> {
        match self.i64_opt(key)? {
            None => Ok(None),
            Some(n) if n >= 0 => Ok(Some(n as usize)),
            Some(n) => Err(ConfigError::InvalidValue {
                key: key.to_string(),
                reason: format!("must be non-negative, got {n}"),
            }),
        }
    }

    pub fn usize_or(&self, key: &str, default: usize) -> Result<usize, ConfigError> {
        Ok(self.usize_opt(key)?.unwrap_or(default))
    }

    pub fn bool_or(&self, key: &str, default: bool) -> Result<bool, ConfigError> {
        match self.get(key) {
            None | Some(Value::Null) => Ok(default),
            Some(Value::Bool(b)) => Ok(*b),
            Some(v) => Err(invalid(key, "a boolean", v)),
        }
    }

    pub fn str_opt(&self, key: &str) -> Result<Option<String>, ConfigError> {
        match self.get(key) {
            None | Some(Value::Null) => Ok(None),
            Some(Value::String(s)) => Ok(Some(s.clone())),
            Some(v) => Err(invalid(key, "a string", v)),
        }
    }

    pub fn str_or(&self, key: &str, default: &str) -> Result<String, ConfigError> {
        Ok(self.str_opt(key)?.unwrap_or_else(|| default.to_string()))
    }

    /// Deserialize a nested value (typically a sub-config mapping).
    pub fn deserialize_opt<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>, ConfigError> {
        match self.get(key) {
            None | Some(Value::Null) => Ok(None),
            Some(v) => serde_yaml::from_value(v.clone())
                .map(Some)
                .map_err(|e| ConfigError::InvalidValue {
                    key: key.to_string(),
                    reason: e.to_string(),
                }),
        }
    }

    // ── Usage tracking ──────────────────────────────────────────────────────

    /// Forget all reads so far; `ignore` keys are never reported as unused.
    pub fn reset_usage<I, S>(&mut self, ignore: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.used.borrow_mut().clear();
        self.ignored = ignore.into_iter().map(Into::into).collect();
    }

    /// Keys never read since the last [`reset_usage`](Self::reset_usage).
    pub fn unused_keys(&self) -> Vec<String> {
        let used = self.used.borrow();
        self.keys()
            .filter(|k| !used.contains(k) && !self.ignored.contains(k))
            .collect()
    }

    pub fn to_yaml(&self) -> Result<String, serde_yaml::Error> {
        serde_yaml::to_string(&self.entries)
    }
}

impl fmt::Display for ExperimentSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (k, v) in &self.entries {
            let rendered = match v {
                Value::String(s) => s.clone(),
                other => serde_yaml::to_string(other)
                    .map(|s| s.trim_end().replace('\n', " "))
                    .unwrap_or_else(|_| "?".into()),
            };
            writeln!(f, "  {}: {}", key_to_string(k), rendered)?;
        }
        Ok(())
    }
}

impl From<Mapping> for ExperimentSpec {
    fn from(entries: Mapping) -> Self {
        Self::from_mapping(entries)
    }
}

// ── Value helpers ───────────────────────────────────────────────────────────

pub fn key_to_string(key: &Value) -> String {
    match key {
        Value::String(s) => s.clone(),
        Value::Number(n) => n.to_string(),
        Value::Bool(b) => b.to_string(),
        other => serde_yaml::to_string(other)
            .map(|s| s.trim().to_string())
            .unwrap_or_default(),
    }
}

pub fn value_as_f64(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

/// Integers, or floats with an integral value (`3.0` resolves to `3`).
pub fn value_as_i64(value: &Value) -> Option<i64> {
    match value {
        Value::Number(n) => n.as_i64().or_else(|| {
            n.as_f64()
                .filter(|f| f.fract() == 0.0 && f.is_finite())
                .map(|f| f as i64)
        }),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

pub fn describe(value: &Value) -> String {
    match value {
        Value::Null => "null".into(),
        Value::Bool(b) => format!("boolean {b}"),
        Value::Number(n) => format!("number {n}"),
        Value::String(s) => format!("string {s:?}"),
        Value::Sequence(_) => "a sequence".into(),
        Value::Mapping(_) => "a mapping".into(),
        Value::Tagged(t) => format!("tagged value {}", t.tag),
    }
}

fn invalid(key: &str, expected: &'static str, found: &Value) -> ConfigError {
    ConfigError::InvalidType {
        key: key.to_string(),
        expected,
        found: describe(found),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec(yaml: &str) -> ExperimentSpec {
        ExperimentSpec::from_value(serde_yaml::from_str(yaml).unwrap()).unwrap()
    }

    #[test]
    fn set_keeps_position_of_existing_key() {
        let mut s = spec("a: 1\nb: 2\nc: 3\n");
        s.set("a", 10);
        s.set("d", 4);
        assert_eq!(s.keys().collect::<Vec<_>>(), vec!["a", "b", "c", "d"]);
        assert_eq!(s.i64_opt("a").unwrap(), Some(10));
    }

    #[test]
    fn typed_accessors_coerce_integral_floats() {
        let s = spec("steps: 200.0\nlr: 3\nname: run\nflag: true\n");
        assert_eq!(s.usize_or("steps", 0).unwrap(), 200);
        assert_eq!(s.f64_or("lr", 0.0).unwrap(), 3.0);
        assert_eq!(s.str_or("name", "").unwrap(), "run");
        assert!(s.bool_or("flag", false).unwrap());
        assert_eq!(s.usize_or("missing", 7).unwrap(), 7);
    }

    #[test]
    fn wrong_type_is_reported() {
        let s = spec("steps: many\n");
        let err = s.usize_or("steps", 0).unwrap_err();
        assert!(matches!(err, ConfigError::InvalidType { .. }));
    }

    #[test]
    fn unused_keys_respect_ignore_list() {
        let mut s = spec("module: pruning\nlr: 0.1\ntypo_key: 3\nREP: 0\n");
        s.reset_usage(["module", "REP"]);
        s.f64_or("lr", 0.0).unwrap();
        assert_eq!(s.unused_keys(), vec!["typo_key".to_string()]);
    }

    #[test]
    fn peek_does_not_mark_usage() {
        let mut s = spec("a: 1\n");
        s.reset_usage(Vec::<String>::new());
        assert!(s.peek("a").is_some());
        assert_eq!(s.unused_keys(), vec!["a".to_string()]);
    }
}
