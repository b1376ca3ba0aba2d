//! Usage normalization.
//!
//! Vendors report cache activity differently. OpenAI-compatible APIs fold
//! cache reads into `prompt_tokens`; Anthropic reports input, cache reads
//! and cache writes as separate figures. Everything here turns a raw
//! response body into the same split: fresh input, output, cache reads,
//! cache writes.

mod normalize;
mod schema;

pub use normalize::{NormalizedUsage, UNKNOWN_MODEL, normalize};
pub use schema::UsageSchema;

/// Vendor family whose wire format and accounting rules a response follows.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Vendor {
    /// OpenAI chat completions and every OpenAI-wire-compatible service.
    OpenAi,
    /// Anthropic messages API.
    Anthropic,
}

impl Vendor {
    /// Vendors whose interception is compiled in.
    pub fn supported() -> Vec<Vendor> {
        let mut vendors = Vec::new();
        #[cfg(feature = "openai")]
        vendors.push(Vendor::OpenAi);
        #[cfg(feature = "anthropic")]
        vendors.push(Vendor::Anthropic);
        vendors
    }

    pub fn schema(self) -> &'static UsageSchema {
        match self {
            Vendor::OpenAi => &UsageSchema::OPENAI,
            Vendor::Anthropic => &UsageSchema::ANTHROPIC,
        }
    }

    /// The client call this vendor's interceptor observes.
    pub fn entry_point(self) -> &'static str {
        match self {
            Vendor::OpenAi => "chat.completions.create",
            Vendor::Anthropic => "messages.create",
        }
    }
}
