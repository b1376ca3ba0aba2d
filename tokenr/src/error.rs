use thiserror::Error;

/// Errors surfaced by the calls that report an outcome.
///
/// Fire-and-forget tracking never returns these; they only come back from
/// [`Tracker::configure`](crate::Tracker::configure) and the awaited
/// delivery path.
#[derive(Debug, Error)]
pub enum TrackerError {
    #[error("no API token configured (set TOKENR_TOKEN or pass a token to init)")]
    MissingToken,

    #[error("tracking is disabled")]
    Disabled,

    #[error("invalid configuration override: {0}")]
    Config(#[from] serde_json::Error),

    #[error("HTTP client could not be created")]
    Unavailable,

    #[error("tracking request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("tracking endpoint returned {status}: {body}")]
    Rejected { status: u16, body: String },
}

pub type Result<T, E = TrackerError> = std::result::Result<T, E>;
