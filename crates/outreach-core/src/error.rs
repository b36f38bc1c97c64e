//! Error types shared across the Outreach crates.

use thiserror::Error;

/// Unified error type.
#[derive(Debug, Error)]
pub enum OutreachError {
    #[error("Config error: {0}")]
    Config(String),

    #[error("Database error: {0}")]
    Database(String),

    /// Delivery failed at the transport (SMTP, HTTP API, ...).
    #[error("Transport error: {0}")]
    Transport(String),

    /// A subject or body template could not be rendered.
    #[error("Render error: {0}")]
    Render(String),

    /// A step's timing cannot produce a valid next send time.
    #[error("Schedule error: {0}")]
    Schedule(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, OutreachError>;

impl OutreachError {
    /// Per-recipient failures are recorded and deferred; everything else aborts the pass.
    pub fn is_recipient_scoped(&self) -> bool {
        matches!(
            self,
            OutreachError::Transport(_) | OutreachError::Render(_) | OutreachError::Schedule(_)
        )
    }
}
