use serde_json::Value;

use super::{Vendor, schema::UsageSchema};

/// Model name used when a response does not say which model served it.
pub const UNKNOWN_MODEL: &str = "unknown";

/// Token counts split into billable categories.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct NormalizedUsage {
    pub model: String,
    /// Fresh input only, never including cache reads.
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub cache_read_tokens: u64,
    pub cache_write_tokens: u64,
}

/// Normalize a response body using the vendor's accounting rules.
///
/// Returns `None` when the response carries no usage at all.
pub fn normalize(response: &Value, vendor: Vendor) -> Option<NormalizedUsage> {
    vendor.schema().parse(response)
}

impl UsageSchema {
    /// Parse usage from response JSON using this schema's paths.
    ///
    /// Missing or malformed counts read as zero.
    pub fn parse(&self, response: &Value) -> Option<NormalizedUsage> {
        let usage = get_nested_value(response, self.usage_path)
            .filter(|u| u.as_object().is_some_and(|fields| !fields.is_empty()))?;

        let reported_input = count(usage, Some(self.input_tokens));
        let output_tokens = count(usage, Some(self.output_tokens));
        let cache_read_tokens = count(usage, self.cache_read_tokens);
        let cache_write_tokens = count(usage, self.cache_write_tokens);

        // Inconsistent upstream data can report more cache hits than input.
        let input_tokens = if self.input_includes_cache_reads {
            reported_input.saturating_sub(cache_read_tokens)
        } else {
            reported_input
        };

        let model = get_nested_value(response, self.model_path)
            .and_then(Value::as_str)
            .unwrap_or(UNKNOWN_MODEL)
            .to_string();

        Some(NormalizedUsage {
            model,
            input_tokens,
            output_tokens,
            cache_read_tokens,
            cache_write_tokens,
        })
    }
}

fn count(usage: &Value, path: Option<&str>) -> u64 {
    path.and_then(|p| get_nested_value(usage, p))
        .and_then(Value::as_u64)
        .unwrap_or(0)
}

/// Get a nested value using dot-notation path (e.g., "usage.prompt_tokens")
fn get_nested_value<'a>(json: &'a Value, path: &str) -> Option<&'a Value> {
    let mut current = json;
    for key in path.split('.') {
        current = current.get(key)?;
    }
    Some(current)
}
