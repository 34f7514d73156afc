//! Error types for tern-ai

use thiserror::Error;

/// Result type alias using tern-ai Error
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while talking to a model backend or decoding its stream
#[derive(Error, Debug)]
pub enum Error {
    /// HTTP request failed
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// JSON serialization/deserialization failed
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// API returned an error response
    #[error("API error: {message} (type: {error_type})")]
    Api { error_type: String, message: String },

    /// Rate limit exceeded
    #[error("Rate limited: retry after {retry_after:?} seconds")]
    RateLimited { retry_after: Option<u64> },

    /// Transport-level failure while reading or connecting
    #[error("Network error: {0}")]
    Network(String),

    /// The event stream was malformed or terminated by an `error` event
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// Invalid API key
    #[error("Invalid or missing API key")]
    InvalidApiKey,

    /// Stream was aborted
    #[error("Request aborted")]
    Aborted,

    /// Invalid configuration
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// Context overflow / too many tokens
    #[error("Context overflow: {0}")]
    ContextOverflow(String),
}

impl Error {
    /// Create an API error from type and message
    pub fn api(error_type: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Api {
            error_type: error_type.into(),
            message: message.into(),
        }
    }

    /// Check if this error is retryable
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::Http(e) => !e.is_status() || e.status().is_some_and(|s| s.is_server_error()),
            Error::RateLimited { .. } | Error::Network(_) => true,
            Error::Api {
                error_type,
                message,
            } => {
                let et = error_type.to_lowercase();
                let msg = message.to_lowercase();
                et.contains("rate_limit")
                    || et.contains("overloaded")
                    || et.contains("api_error")
                    || msg.contains("rate limit")
                    || msg.contains("overloaded")
                    || msg.contains("too many requests")
                    || msg.contains("529")
            }
            _ => false,
        }
    }

    /// Check if this error indicates a context overflow / too many tokens
    pub fn is_context_overflow(&self) -> bool {
        match self {
            Error::ContextOverflow(_) => true,
            Error::Api { message, .. } | Error::Protocol(message) => {
                let msg = message.to_lowercase();
                msg.contains("too many tokens")
                    || msg.contains("context length")
                    || msg.contains("context window")
                    || msg.contains("prompt is too long")
                    || msg.contains("prompt too long")
                    || msg.contains("request too large")
                    || msg.contains("context_length_exceeded")
            }
            _ => false,
        }
    }
}
