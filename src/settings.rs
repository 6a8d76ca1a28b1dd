//! Typed settings lookup.
//!
//! The crawler hands components a flat key/value settings object. This module
//! defines the narrow read-only view they need plus a JSON-backed
//! implementation used by the CLI and tests.

use crate::{Error, Result};
use serde_json::{Map, Value};
use std::collections::HashMap;

/// Read-only settings with typed accessors and fallback defaults
pub trait Settings {
    fn get(&self, key: &str) -> Option<&Value>;

    /// Booleans also accept `"true"/"false"/"1"/"0"` strings and 0/1 numbers.
    fn get_bool(&self, key: &str, default: bool) -> bool {
        match self.get(key) {
            Some(Value::Bool(b)) => *b,
            Some(Value::Number(n)) => n.as_i64().map(|v| v != 0).unwrap_or(default),
            Some(Value::String(s)) => match s.trim().to_ascii_lowercase().as_str() {
                "true" | "1" | "yes" | "on" => true,
                "false" | "0" | "no" | "off" => false,
                _ => default,
            },
            _ => default,
        }
    }

    fn get_str(&self, key: &str) -> Option<String> {
        match self.get(key) {
            Some(Value::String(s)) => Some(s.clone()),
            Some(Value::Number(n)) => Some(n.to_string()),
            Some(Value::Bool(b)) => Some(b.to_string()),
            _ => None,
        }
    }

    fn get_str_or(&self, key: &str, default: &str) -> String {
        self.get_str(key).unwrap_or_else(|| default.to_string())
    }

    fn get_f64(&self, key: &str, default: f64) -> f64 {
        match self.get(key) {
            Some(Value::Number(n)) => n.as_f64().unwrap_or(default),
            Some(Value::String(s)) => s.trim().parse().unwrap_or(default),
            _ => default,
        }
    }

    /// Lists accept JSON arrays or comma-separated strings.
    fn get_list(&self, key: &str) -> Vec<String> {
        match self.get(key) {
            Some(Value::Array(items)) => items
                .iter()
                .filter_map(|v| v.as_str().map(str::to_string))
                .collect(),
            Some(Value::String(s)) => s
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(str::to_string)
                .collect(),
            _ => Vec::new(),
        }
    }
}

/// Settings held in memory, keyed by setting name
#[derive(Debug, Clone, Default)]
pub struct MapSettings {
    values: HashMap<String, Value>,
}

impl MapSettings {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse a JSON object of settings.
    pub fn from_json_str(json: &str) -> Result<Self> {
        let parsed: Map<String, Value> = serde_json::from_str(json)
            .map_err(|e| Error::Configuration(format!("Invalid settings JSON: {}", e)))?;
        Ok(Self {
            values: parsed.into_iter().collect(),
        })
    }

    pub fn set(&mut self, key: impl Into<String>, value: impl Into<Value>) -> &mut Self {
        self.values.insert(key.into(), value.into());
        self
    }
}

impl Settings for MapSettings {
    fn get(&self, key: &str) -> Option<&Value> {
        self.values.get(key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn typed_access_with_defaults() {
        let s = MapSettings::from_json_str(
            r#"{"ENABLED": "false", "TIMEOUT": 40, "AGENTS": ["a", "b"], "CSV": "x, y,,z"}"#,
        )
        .unwrap();
        assert!(!s.get_bool("ENABLED", true));
        assert!(s.get_bool("MISSING", true));
        assert_eq!(s.get_f64("TIMEOUT", 1.0), 40.0);
        assert_eq!(s.get_list("AGENTS"), vec!["a", "b"]);
        assert_eq!(s.get_list("CSV"), vec!["x", "y", "z"]);
        assert!(s.get_list("MISSING").is_empty());
        assert_eq!(s.get_str("TIMEOUT").as_deref(), Some("40"));
        assert_eq!(s.get_str_or("NOPE", "splash"), "splash");
    }

    #[test]
    fn rejects_non_object_json() {
        assert!(MapSettings::from_json_str("[1, 2]").is_err());
    }

    #[test]
    fn set_overrides_values() {
        let mut s = MapSettings::new();
        s.set("ROTATE_USER_AGENT", true).set("ROTATE_USER_AGENT", false);
        assert!(!s.get_bool("ROTATE_USER_AGENT", true));
    }
}
