/// Where a vendor keeps its usage figures inside a response body.
///
/// Paths are dot-separated (e.g. `prompt_tokens_details.cached_tokens`) and,
/// except for `usage_path` and `model_path`, relative to the usage object.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UsageSchema {
    /// Path to the usage object from the response root.
    pub usage_path: &'static str,

    /// Field for prompt/input tokens.
    pub input_tokens: &'static str,

    /// Field for completion/output tokens.
    pub output_tokens: &'static str,

    /// Field for tokens served from the prompt cache, if reported.
    pub cache_read_tokens: Option<&'static str>,

    /// Field for tokens written to the prompt cache, if reported.
    pub cache_write_tokens: Option<&'static str>,

    /// The reported input figure already includes cache reads and has to be
    /// corrected down.
    pub input_includes_cache_reads: bool,

    /// Path to the model name from the response root.
    pub model_path: &'static str,
}

impl UsageSchema {
    pub const OPENAI: UsageSchema = UsageSchema {
        usage_path: "usage",
        input_tokens: "prompt_tokens",
        output_tokens: "completion_tokens",
        cache_read_tokens: Some("prompt_tokens_details.cached_tokens"),
        cache_write_tokens: None,
        input_includes_cache_reads: true,
        model_path: "model",
    };

    pub const ANTHROPIC: UsageSchema = UsageSchema {
        usage_path: "usage",
        input_tokens: "input_tokens",
        output_tokens: "output_tokens",
        cache_read_tokens: Some("cache_read_input_tokens"),
        cache_write_tokens: Some("cache_creation_input_tokens"),
        input_includes_cache_reads: false,
        model_path: "model",
    };
}
