//! Error types for tern-agent

use thiserror::Error;

/// Result type alias using tern-agent Error
pub type Result<T> = std::result::Result<T, Error>;

/// Errors surfaced by the conversation engine
#[derive(Error, Debug)]
pub enum Error {
    /// An error from the wire layer
    #[error(transparent)]
    Ai(#[from] tern_ai::Error),

    /// The model stream failed mid-turn or retries were exhausted
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// Input rejected before anything ran
    #[error("Validation error: {0}")]
    Validation(String),

    /// Compaction could not be performed
    #[error("Compaction error: {0}")]
    Compaction(String),

    /// Configuration could not be loaded or is invalid
    #[error("Configuration error: {0}")]
    Config(String),

    /// The operation was aborted
    #[error("Cancelled")]
    Cancelled,

    /// The engine has been terminated
    #[error("Engine terminated")]
    Terminated,

    /// A generic engine error
    #[error("{0}")]
    Other(String),
}

impl Error {
    /// Check if this error indicates a context overflow
    pub fn is_context_overflow(&self) -> bool {
        match self {
            Error::Ai(e) => e.is_context_overflow(),
            Error::Protocol(message) => crate::transport::is_context_overflow(message),
            _ => false,
        }
    }

    /// True for failures that move the engine into the `Error` state
    pub fn is_protocol_failure(&self) -> bool {
        matches!(self, Error::Ai(_) | Error::Protocol(_))
    }
}
