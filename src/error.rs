//! Domain errors raised by match operations

use crate::store::StoreError;

/// Errors surfaced by match operations and transactions.
///
/// Only the HTTP layer turns these into user-visible responses; background
/// tasks log and swallow them.
#[derive(Debug, thiserror::Error)]
pub enum MatchError {
    /// Malformed input or a failed business precondition
    #[error("{0}")]
    Validation(String),

    /// Caller's role or state does not permit the operation
    #[error("{0}")]
    Forbidden(String),

    /// Match (or session) absent or expired
    #[error("{0}")]
    NotFound(String),

    /// Concurrent state already moved past the requested operation
    #[error("{0}")]
    Conflict(String),

    /// Resource temporarily closed (fuel window)
    #[error("{0}")]
    Locked(String),

    /// Per-match lock could not be acquired within the bounded wait
    #[error("timed out acquiring lock for match {code}")]
    LockTimeout { code: String },

    #[error(transparent)]
    Store(#[from] StoreError),
}

impl MatchError {
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    pub fn forbidden(msg: impl Into<String>) -> Self {
        Self::Forbidden(msg.into())
    }

    pub fn conflict(msg: impl Into<String>) -> Self {
        Self::Conflict(msg.into())
    }

    pub fn match_not_found(code: &str) -> Self {
        Self::NotFound(format!("Match {} not found or expired", code))
    }

    /// Short machine-readable tag, used in WebSocket error frames
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Validation(_) => "validation",
            Self::Forbidden(_) => "forbidden",
            Self::NotFound(_) => "not_found",
            Self::Conflict(_) => "conflict",
            Self::Locked(_) => "locked",
            Self::LockTimeout { .. } => "busy",
            Self::Store(_) => "internal",
        }
    }

    /// Background tasks stop quietly on these instead of logging an error
    pub fn ends_background_task(&self) -> bool {
        matches!(self, Self::NotFound(_) | Self::LockTimeout { .. })
    }
}

pub type MatchResult<T> = Result<T, MatchError>;
