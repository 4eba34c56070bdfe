use thiserror::Error;
use time::OffsetDateTime;

/// Errors surfaced by relay components to their callers.
#[derive(Debug, Error)]
pub enum RelayError {
    #[error("{0} not found")]
    NotFound(String),
    #[error("pairing window has expired")]
    Expired,
    #[error("session is already paired")]
    AlreadyPaired,
    #[error("session has been disconnected")]
    Disconnected,
    #[error("rate limit exceeded, retry after {reset_at}")]
    RateLimited { reset_at: OffsetDateTime },
    #[error("invalid input: {0}")]
    InvalidInput(String),
    #[error("storage failure")]
    Storage(#[source] anyhow::Error),
    #[error("backend unavailable")]
    BackendUnavailable(#[source] anyhow::Error),
}

impl RelayError {
    pub fn not_found(what: impl Into<String>) -> Self {
        Self::NotFound(what.into())
    }

    pub fn storage(err: impl Into<anyhow::Error>) -> Self {
        Self::Storage(err.into())
    }

    /// Whether the failure came from infrastructure rather than the caller.
    pub fn is_internal(&self) -> bool {
        matches!(self, Self::Storage(_) | Self::BackendUnavailable(_))
    }
}

pub type Result<T, E = RelayError> = std::result::Result<T, E>;
