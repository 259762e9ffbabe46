use thiserror::Error;

/// The primary error type for lock/session operations.
///
/// Variants map one-to-one onto the conditions callers are expected to
/// branch on; anything else is plumbing and stays `anyhow` at the binary
/// layer.
#[derive(Debug, Error)]
pub enum LockError {
    /// Malformed input (bad email, short password, empty card id).
    /// Returned synchronously, never retried.
    #[error("invalid input: {0}")]
    Validation(String),

    /// Unknown card, account or code. Terminal for the request.
    #[error("{0} not found")]
    NotFound(String),

    /// Card bound elsewhere, duplicate account, or a lost conditional
    /// update that could not be recovered. Terminal, surfaced verbatim.
    #[error("conflict: {0}")]
    Conflict(String),

    /// One-time code past its window. A new code must be issued.
    #[error("{0} has expired")]
    Expired(String),

    /// No emergency tapouts remaining. Recoverable by waiting for a refill.
    #[error("no emergency tapouts remaining")]
    QuotaExhausted,

    /// The device is locked; mutating operations require unlocking first.
    #[error("device is locked - unlock first")]
    Locked,

    /// Network or store failure. The only class eligible for a bounded
    /// retry at the reconciliation layer.
    #[error("remote store unavailable: {0}")]
    RemoteUnavailable(String),

    /// Code was stored but could not be dispatched. State is intact;
    /// distinct from a validation failure.
    #[error("code delivery failed: {0}")]
    Delivery(String),
}

impl LockError {
    pub fn validation(msg: impl Into<String>) -> Self {
        LockError::Validation(msg.into())
    }

    pub fn not_found(what: impl Into<String>) -> Self {
        LockError::NotFound(what.into())
    }

    pub fn conflict(msg: impl Into<String>) -> Self {
        LockError::Conflict(msg.into())
    }

    pub fn unavailable(msg: impl Into<String>) -> Self {
        LockError::RemoteUnavailable(msg.into())
    }

    /// Whether the reconciliation layer may retry this error once.
    pub fn is_retryable(&self) -> bool {
        matches!(self, LockError::RemoteUnavailable(_))
    }
}

pub type Result<T> = std::result::Result<T, LockError>;
