//! Error types for flag synchronization

use thiserror::Error;

use crate::entity::Id;

/// Failure reported by a [`FlagStore`](crate::store::FlagStore) backend.
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[cfg(feature = "sled")]
    #[error("Sled error: {0}")]
    Sled(#[from] sled::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("{kind} {id} not found")]
    NotFound { kind: &'static str, id: Id },

    #[error("Integrity violation: {0}")]
    Integrity(String),

    #[error("Lock poisoned: {0}")]
    Lock(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

/// A malformed document detected while synchronizing one flag.
///
/// `segment` is the zero-based position of the segment in the document.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ValidationError {
    #[error("segment #{segment}: distribution percent sums to {total}, expected 100")]
    PercentSum { segment: usize, total: u64 },

    #[error("segment #{segment}: unsupported operator {token:?}")]
    UnknownOperator { segment: usize, token: String },

    #[error("segment #{segment}: distribution references undeclared variant {key:?}")]
    UnknownVariant { segment: usize, key: String },

    #[error("segment #{segment}: rollout {rollout} is out of range (0-100)")]
    RolloutOutOfRange { segment: usize, rollout: u32 },

    #[error("segment #{segment}: unable to serialize constraint value for {property:?}: {message}")]
    ConstraintValue {
        segment: usize,
        property: String,
        message: String,
    },
}

/// Why a synchronization run stopped.
#[derive(Error, Debug)]
pub enum SyncError {
    #[error("storage failure: {0}")]
    Storage(#[from] StoreError),

    #[error("invalid flag {flag}: {source}")]
    Validation {
        flag: String,
        #[source]
        source: ValidationError,
    },
}

impl SyncError {
    pub fn is_validation(&self) -> bool {
        matches!(self, SyncError::Validation { .. })
    }
}

/// The desired-state document could not be loaded.
#[derive(Error, Debug)]
pub enum DocumentError {
    #[error("unable to read {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("unable to parse document: {0}")]
    Parse(#[from] serde_yaml::Error),
}
