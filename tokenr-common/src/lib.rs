//! Wire types for usage tracking payloads.
//!
//! Shared by the `tokenr` client and anything that produces or ingests its
//! records. Absent values are never serialized: a record only carries the
//! fields that mean something.

use std::{collections::BTreeMap, fmt, str::FromStr};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Outcome of the tracked call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Status {
    #[default]
    Success,
    Error,
}

impl Status {
    pub fn as_str(self) -> &'static str {
        match self {
            Status::Success => "success",
            Status::Error => "error",
        }
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Status {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "success" => Ok(Status::Success),
            "error" => Ok(Status::Error),
            other => Err(format!("unknown status '{}', expected success or error", other)),
        }
    }
}

/// A single attribution tag value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum TagValue {
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
}

impl TagValue {
    /// Reads a command-line style value: booleans and numbers are kept typed,
    /// anything else is text.
    pub fn infer(raw: &str) -> Self {
        match raw {
            "true" => return TagValue::Bool(true),
            "false" => return TagValue::Bool(false),
            _ => {}
        }
        if let Ok(n) = raw.parse::<i64>() {
            return TagValue::Int(n);
        }
        match raw.parse::<f64>() {
            Ok(f) if f.is_finite() => TagValue::Float(f),
            _ => TagValue::Text(raw.to_string()),
        }
    }
}

impl From<&str> for TagValue {
    fn from(value: &str) -> Self {
        TagValue::Text(value.to_string())
    }
}

impl From<String> for TagValue {
    fn from(value: String) -> Self {
        TagValue::Text(value)
    }
}

impl From<bool> for TagValue {
    fn from(value: bool) -> Self {
        TagValue::Bool(value)
    }
}

impl From<i64> for TagValue {
    fn from(value: i64) -> Self {
        TagValue::Int(value)
    }
}

impl From<i32> for TagValue {
    fn from(value: i32) -> Self {
        TagValue::Int(value.into())
    }
}

impl From<u32> for TagValue {
    fn from(value: u32) -> Self {
        TagValue::Int(value.into())
    }
}

impl From<f64> for TagValue {
    fn from(value: f64) -> Self {
        TagValue::Float(value)
    }
}

/// Attribution tags, ordered by key so payloads serialize deterministically.
pub type Tags = BTreeMap<String, TagValue>;

fn is_zero(n: &u64) -> bool {
    *n == 0
}

/// Canonical token accounting for one LLM call.
///
/// `input_tokens` never includes cache-derived tokens; those are carried in
/// `cache_read_tokens` / `cache_write_tokens` so each category can be
/// priced separately.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct UsageRecord {
    pub provider: String,
    pub model: String,
    pub input_tokens: u64,
    pub output_tokens: u64,
    #[serde(default, skip_serializing_if = "is_zero")]
    pub cache_read_tokens: u64,
    #[serde(default, skip_serializing_if = "is_zero")]
    pub cache_write_tokens: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub feature_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub team_id: Option<String>,
    #[serde(default)]
    pub status: Status,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub latency_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Tags::is_empty")]
    pub tags: Tags,
    /// Defaults to receipt time on the server when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub requested_at: Option<DateTime<Utc>>,
}

impl UsageRecord {
    pub fn new(
        provider: impl Into<String>,
        model: impl Into<String>,
        input_tokens: u64,
        output_tokens: u64,
    ) -> Self {
        Self {
            provider: provider.into(),
            model: model.into(),
            input_tokens,
            output_tokens,
            ..Default::default()
        }
    }

    pub fn with_cache(mut self, read: u64, write: u64) -> Self {
        self.cache_read_tokens = read;
        self.cache_write_tokens = write;
        self
    }

    pub fn with_tag(mut self, key: impl Into<String>, value: impl Into<TagValue>) -> Self {
        self.tags.insert(key.into(), value.into());
        self
    }
}

/// Reply from the tracking endpoint.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct TrackAck {
    /// Cost the endpoint priced the record at, in USD.
    #[serde(default)]
    pub cost: Option<f64>,
}
