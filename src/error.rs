//! Error types for the agent hub daemon

use thiserror::Error;

/// Main error type for the agent hub daemon
#[derive(Error, Debug)]
pub enum HubError {
    /// I/O error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON decode/encode error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// HTTP error when talking to the hub API
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// Backend returned a non-success status for a prompt injection
    #[error("Injection rejected for session {session_id}: status {status}")]
    InjectionRejected {
        /// Target session id
        session_id: String,
        /// HTTP status code returned by the backend
        status: u16,
    },

    /// Startup precondition failure; the entry point turns this into a
    /// non-zero exit before any worker is started.
    #[error("Precondition failed: {0}")]
    Precondition(String),

    /// Invalid configuration value
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
}

/// Result type alias for hub daemon operations
pub type Result<T> = std::result::Result<T, HubError>;

impl HubError {
    /// Create a precondition error
    pub fn precondition(msg: impl Into<String>) -> Self {
        Self::Precondition(msg.into())
    }

    /// Create an invalid configuration error
    pub fn invalid_config(msg: impl Into<String>) -> Self {
        Self::InvalidConfig(msg.into())
    }
}
