//! Provider detection for OpenAI-wire-compatible clients.
//!
//! Many services speak the OpenAI chat completions protocol. The only thing
//! that tells them apart on the client side is the base URL the client was
//! pointed at.

/// Slug reported when nothing in the base URL identifies another provider.
pub const FALLBACK_PROVIDER: &str = "openai";

/// Hostname fragments and the provider slug each identifies.
/// Order matters: the first fragment found in the URL wins.
pub const OPENAI_COMPATIBLE_HOSTS: &[(&str, &str)] = &[
    ("minimax", "minimax"),
    ("anthropic", "anthropic"),
    ("googleapis", "google"),
    ("mistral", "mistral"),
    ("cohere", "cohere"),
    ("deepseek", "deepseek"),
    ("x.ai", "xai"),
    ("xai", "xai"),
    ("azure", "azure_openai"),
];

#[derive(Debug, Clone)]
pub struct ProviderDetector {
    hosts: &'static [(&'static str, &'static str)],
}

impl Default for ProviderDetector {
    fn default() -> Self {
        Self::with_defaults()
    }
}

impl ProviderDetector {
    pub fn with_defaults() -> Self {
        Self::new(OPENAI_COMPATIBLE_HOSTS)
    }

    /// Fragments must be lowercase.
    pub fn new(hosts: &'static [(&'static str, &'static str)]) -> Self {
        Self { hosts }
    }

    /// Find the provider slug for a client's base URL.
    pub fn detect(&self, base_url: Option<&str>) -> &'static str {
        let Some(base_url) = base_url else {
            return FALLBACK_PROVIDER;
        };
        let base_url = base_url.to_lowercase();

        self.hosts
            .iter()
            .find(|&&(fragment, _)| base_url.contains(fragment))
            .map_or(FALLBACK_PROVIDER, |&(_, slug)| slug)
    }
}
