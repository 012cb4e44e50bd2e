//! Error types for the queue manager.

use thiserror::Error;

/// Result type alias using the floodgate error type.
pub type Result<T> = std::result::Result<T, FloodgateError>;

/// Main error type for the queue manager.
#[derive(Error, Debug)]
pub enum FloodgateError {
    /// The remote service rejected the submission because of rate limiting.
    ///
    /// This is an operational signal, not a job failure: the worker halts
    /// the queue and retries the same record after the cooldown. It is never
    /// surfaced through a request's error callback.
    #[error("generation service throttled: {0}")]
    Throttled(String),

    /// The submission was accepted but the response carried no task handle.
    #[error("no task handle returned from generation service")]
    MissingTaskHandle,

    /// Manager is shutting down.
    #[error("queue manager is shutting down")]
    Shutdown,

    /// HTTP client error
    #[error("HTTP request failed: {0}")]
    HttpClient(#[from] reqwest::Error),

    /// Serialization/deserialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// General error from anyhow
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl FloodgateError {
    /// Returns true if this error is a throttle-class rejection.
    ///
    /// Throttle errors halt the queue instead of discarding the head record.
    pub fn is_throttle(&self) -> bool {
        matches!(self, FloodgateError::Throttled(_))
    }
}
