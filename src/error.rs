//! Error taxonomy for the asset pipeline.
//!
//! Every stage of the virtualized fetch path reports through [`ProxyError`].
//! The host and control layers wrap these in `anyhow` with context, the
//! same way V8 failures are wrapped.

/// Failure raised anywhere between request classification and response
/// construction.
#[derive(Debug, Clone, thiserror::Error)]
pub enum ProxyError {
    /// The metadata lookup matched zero records for the logical name.
    #[error("no asset record found with the name '{name}'")]
    NotFound { name: String },

    /// The payload was not valid base64 or not a well-formed gzip envelope.
    #[error("failed to decode asset payload: {0}")]
    Decode(String),

    /// Network failure or unexpected response from an external endpoint.
    #[error("transport failure: {0}")]
    Transport(String),

    /// A required patch rule found nothing to rewrite in loader source.
    #[error("loader source does not match patch table '{table}': rule '{rule}' found no match")]
    PatchMismatch { table: String, rule: String },

    /// Error posted by the isolated worker context.
    #[error("worker error: {0}")]
    Worker(String),

    /// Malformed wire message or other protocol violation.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// Invalid configuration value.
    #[error("invalid configuration: {0}")]
    Config(String),
}

impl ProxyError {
    pub fn not_found(name: impl Into<String>) -> Self {
        Self::NotFound { name: name.into() }
    }
}

impl From<reqwest::Error> for ProxyError {
    fn from(value: reqwest::Error) -> Self {
        Self::Transport(value.to_string())
    }
}

impl From<base64::DecodeError> for ProxyError {
    fn from(value: base64::DecodeError) -> Self {
        Self::Decode(format!("invalid base64: {value}"))
    }
}

impl From<serde_json::Error> for ProxyError {
    fn from(value: serde_json::Error) -> Self {
        Self::Protocol(value.to_string())
    }
}
