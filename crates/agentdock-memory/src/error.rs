//! Error taxonomy for the memory engine.
//!
//! Every fallible operation returns [`MemoryError`]. The variant carries
//! enough detail for a caller to log and recover; [`MemoryError::kind`]
//! exposes the coarser recovery class from the propagation policy (local
//! vs surfaced, retryable vs terminal) without requiring callers to match
//! every variant individually.

use std::fmt;

/// Recovery class for a [`MemoryError`].
///
/// This does not replace the variant itself — it answers "what should the
/// caller do" rather than "what happened".
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Empty tenant key, malformed record, out-of-range config. Never retried.
    InvalidArgument,
    /// Record or edge missing. Recall treats this as an empty result.
    NotFound,
    /// Edge endpoint tenant mismatch, archive race. Write rejected atomically.
    Conflict,
    /// Provider-reported retryable failure (timeout, connection drop).
    Transient,
    /// Tenant limits or C4 overflow; the update is dropped, caller proceeds.
    QuotaExceeded,
    /// Optional capability used on a provider that lacks it; caller downgrades.
    CapabilityMissing,
    /// Stored metadata/keywords failed to parse; field reset, record still returned.
    Integrity,
    /// The processor is destroyed or the provider's health check is failing.
    Fatal,
}

/// The error type returned by every fallible engine operation.
#[non_exhaustive]
#[derive(Debug, thiserror::Error)]
pub enum MemoryError {
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("transient failure in {operation}: {cause}")]
    Transient { operation: String, cause: String },

    #[error("quota exceeded: {0}")]
    QuotaExceeded(String),

    #[error("capability missing: {0}")]
    CapabilityMissing(String),

    #[error("integrity error in {field}: {cause}")]
    Integrity { field: String, cause: String },

    #[error("fatal: {0}")]
    Fatal(String),

    /// A provider-specific failure that doesn't map cleanly onto the other
    /// variants. `operation` names the call that failed; `source` names the
    /// provider; `cause` is the provider's own error text.
    #[error("{operation} failed on provider {provider}: {cause}")]
    Provider {
        operation: String,
        provider: String,
        cause: String,
    },
}

impl MemoryError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            MemoryError::InvalidArgument(_) => ErrorKind::InvalidArgument,
            MemoryError::NotFound(_) => ErrorKind::NotFound,
            MemoryError::Conflict(_) => ErrorKind::Conflict,
            MemoryError::Transient { .. } => ErrorKind::Transient,
            MemoryError::QuotaExceeded(_) => ErrorKind::QuotaExceeded,
            MemoryError::CapabilityMissing(_) => ErrorKind::CapabilityMissing,
            MemoryError::Integrity { .. } => ErrorKind::Integrity,
            MemoryError::Fatal(_) => ErrorKind::Fatal,
            MemoryError::Provider { .. } => ErrorKind::Transient,
        }
    }

    /// True for failures the propagation policy treats as local to a
    /// collaborator call (classifier, embedding, connection discovery) —
    /// these are logged and must never fail the containing store/recall.
    pub fn is_local_only(&self) -> bool {
        matches!(
            self.kind(),
            ErrorKind::CapabilityMissing | ErrorKind::Transient
        )
    }

    pub fn invalid_argument(msg: impl Into<String>) -> Self {
        MemoryError::InvalidArgument(msg.into())
    }

    pub fn not_found(msg: impl Into<String>) -> Self {
        MemoryError::NotFound(msg.into())
    }

    pub fn conflict(msg: impl Into<String>) -> Self {
        MemoryError::Conflict(msg.into())
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ErrorKind::InvalidArgument => "invalid_argument",
            ErrorKind::NotFound => "not_found",
            ErrorKind::Conflict => "conflict",
            ErrorKind::Transient => "transient",
            ErrorKind::QuotaExceeded => "quota_exceeded",
            ErrorKind::CapabilityMissing => "capability_missing",
            ErrorKind::Integrity => "integrity",
            ErrorKind::Fatal => "fatal",
        };
        write!(f, "{s}")
    }
}

/// Result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, MemoryError>;
