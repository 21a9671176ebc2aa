//! Deterministic request fingerprints
//!
//! A fingerprint identifies a logical resource request: an endpoint plus a
//! normalized parameter set. Parameters live in a sorted map, so two requests
//! that differ only in parameter order produce the same key. Path segments,
//! parameter names and values are percent-encoded, so distinct requests never
//! render the same key.

use crate::cache::types::CacheKey;
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;
use urlencoding::encode;

/// Builder for request fingerprints
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Fingerprint {
    endpoint: String,
    params: BTreeMap<String, String>,
}

impl Fingerprint {
    /// Start a fingerprint for an endpoint such as `/customers`
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self {
            endpoint: normalize_endpoint(&endpoint.into()),
            params: BTreeMap::new(),
        }
    }

    /// Add a parameter; a repeated name keeps the last value
    pub fn param(mut self, name: impl Into<String>, value: impl ToString) -> Self {
        self.params.insert(name.into(), value.to_string());
        self
    }

    /// Add every field of a JSON object as a parameter
    ///
    /// Nested values are rendered canonically (object keys sorted), so
    /// `{"a":1,"b":2}` and `{"b":2,"a":1}` fingerprint identically.
    /// Non-object values are stored under the `_` parameter.
    pub fn json_params(mut self, params: &Value) -> Self {
        match params {
            Value::Object(map) => {
                for (name, value) in map {
                    self.params.insert(name.clone(), canonical_json(value));
                }
            }
            Value::Null => {}
            other => {
                self.params.insert("_".to_string(), canonical_json(other));
            }
        }
        self
    }

    /// Endpoint part of the fingerprint
    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    /// Render the fingerprint as a cache key
    pub fn build(&self) -> CacheKey {
        self.to_string()
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.endpoint)?;
        for (i, (name, value)) in self.params.iter().enumerate() {
            let sep = if i == 0 { '?' } else { '&' };
            write!(f, "{}{}={}", sep, encode(name), encode(value))?;
        }
        Ok(())
    }
}

impl From<Fingerprint> for CacheKey {
    fn from(fingerprint: Fingerprint) -> Self {
        fingerprint.build()
    }
}

impl From<&Fingerprint> for CacheKey {
    fn from(fingerprint: &Fingerprint) -> Self {
        fingerprint.build()
    }
}

// Collapse duplicate and trailing slashes so "/customers/" and "/customers" agree.
fn normalize_endpoint(endpoint: &str) -> String {
    let segments: Vec<String> = endpoint
        .split('/')
        .filter(|s| !s.is_empty())
        .map(|s| encode(s).into_owned())
        .collect();
    if endpoint.starts_with('/') || segments.is_empty() {
        format!("/{}", segments.join("/"))
    } else {
        segments.join("/")
    }
}

fn canonical_json(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Object(map) => {
            let sorted: BTreeMap<&String, String> =
                map.iter().map(|(k, v)| (k, canonical_json_nested(v))).collect();
            let body: Vec<String> = sorted
                .iter()
                .map(|(k, v)| format!("{}:{}", Value::String((*k).clone()), v))
                .collect();
            format!("{{{}}}", body.join(","))
        }
        other => canonical_json_nested(other),
    }
}

fn canonical_json_nested(value: &Value) -> String {
    match value {
        Value::Object(_) => canonical_json(value),
        Value::Array(items) => {
            let body: Vec<String> = items.iter().map(canonical_json_nested).collect();
            format!("[{}]", body.join(","))
        }
        other => other.to_string(),
    }
}
