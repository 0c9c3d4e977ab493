//! Error types for appcop

use thiserror::Error;

use crate::orchestrator::AppId;

/// Result type for appcop operations
pub type Result<T> = std::result::Result<T, AppcopError>;

/// appcop error types
#[derive(Error, Debug)]
pub enum AppcopError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("network error: {0}")]
    Network(#[from] reqwest::Error),

    #[error("expected 200 but got {status} for {path}")]
    BadStatus { status: u16, path: String },

    #[error("configuration error: {0}")]
    Config(String),

    #[error("unparseable orchestrator date {0:?}")]
    BadDate(String),

    #[error("unable to scale down, zero instances")]
    ZeroInstances,

    #[error("app {0} has immunity")]
    Immune(AppId),

    #[error("internal channel closed: {0}")]
    ChannelClosed(&'static str),

    #[error("unexpected EOF in event stream")]
    UnexpectedEof,

    #[error("event stream ended")]
    StreamEof,
}

impl AppcopError {
    /// Errors that must take the process down so a supervisor can restart
    /// it. Everything else is counted and the affected loop continues.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            AppcopError::Config(_) | AppcopError::UnexpectedEof | AppcopError::StreamEof
        )
    }
}
