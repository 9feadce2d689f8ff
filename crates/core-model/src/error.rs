use std::fmt;

/// Failure taxonomy shared by every collaborator.
///
/// Only `Configuration` (and `Authentication` at init) is fatal. The cycle
/// driver turns everything else into a skipped unit and a counter.
#[derive(Debug, thiserror::Error)]
pub enum SyncError {
    #[error("configuration error: {0}")]
    Configuration(String),
    #[error("authentication failed for {service}: {message}")]
    Authentication { service: String, message: String },
    #[error("transport error: {0}")]
    Transport(String),
    #[error("classifier output could not be parsed: {0}")]
    ClassificationParse(String),
    #[error("cursor invalidated for {account}")]
    CursorInvalidated { account: String },
    #[error("store error: {0}")]
    Store(String),
}

impl SyncError {
    pub fn transport(err: impl fmt::Display) -> Self {
        SyncError::Transport(err.to_string())
    }

    pub fn store(err: impl fmt::Display) -> Self {
        SyncError::Store(err.to_string())
    }

    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            SyncError::Configuration(_) | SyncError::Authentication { .. }
        )
    }
}

impl From<anyhow::Error> for SyncError {
    fn from(err: anyhow::Error) -> Self {
        SyncError::Store(format!("{err:#}"))
    }
}
