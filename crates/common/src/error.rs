//! Error type shared across the engine.

use {serde::Serialize, thiserror::Error};

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// One failed item inside a batch operation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ItemFailure {
    pub key: String,
    pub error: String,
}

impl ItemFailure {
    pub fn new(key: impl Into<String>, error: impl ToString) -> Self {
        Self {
            key: key.into(),
            error: error.to_string(),
        }
    }
}

#[derive(Debug, Error)]
pub enum Error {
    /// The key is absent. Recoverable; the caller picks a fallback.
    #[error("not found: {0}")]
    NotFound(String),

    /// Authentication tag or format check failed. Fatal for that document.
    #[error("integrity check failed for {subject}: {reason}")]
    Integrity { subject: String, reason: String },

    #[error("invalid configuration: {0}")]
    InvalidConfiguration(String),

    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("capacity exceeded for {scope} (limit {limit})")]
    CapacityExceeded { scope: String, limit: usize },

    #[error("{} of {total} items failed", failures.len())]
    PartialFailure {
        total: usize,
        failures: Vec<ItemFailure>,
    },

    #[error("encryption key fingerprint {actual} does not match stored fingerprint {expected}")]
    KeyMismatch { expected: String, actual: String },

    #[error("policy violation: {0}")]
    PolicyViolation(String),

    #[error("operation cancelled")]
    Cancelled,

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Serialization(#[from] serde_json::Error),

    /// Failure reported by an external collaborator (vector index, embedder,
    /// secrets provider).
    #[error(transparent)]
    External(#[from] anyhow::Error),
}

impl Error {
    pub fn not_found(key: impl Into<String>) -> Self {
        Self::NotFound(key.into())
    }

    pub fn integrity(subject: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Integrity {
            subject: subject.into(),
            reason: reason.into(),
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_))
    }

    pub fn is_integrity(&self) -> bool {
        matches!(self, Self::Integrity { .. })
    }

    /// `Ok(())` for an empty failure list, `PartialFailure` otherwise.
    pub fn from_failures(total: usize, failures: Vec<ItemFailure>) -> Result<()> {
        if failures.is_empty() {
            Ok(())
        } else {
            Err(Self::PartialFailure { total, failures })
        }
    }
}
