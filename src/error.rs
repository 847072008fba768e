//! Error types for scangraph.
//!
//! All errors are strongly typed using thiserror so callers can match on
//! the specific reconcile/propagate/publish failure and decide whether a
//! retry makes sense.

use chrono::{DateTime, Utc};
use thiserror::Error;

use crate::config::ConfigError;
use crate::graph::Reference;
use crate::origin::OriginId;
use crate::storage::{StorageError, TransactionId};

/// Validation errors that occur while checking an ingestion payload.
#[allow(missing_docs)]
#[derive(Debug, Error)]
pub enum ValidationError {
    #[error("Origin id cannot be empty")]
    EmptyOriginId,

    #[error("Invalid object type '{object_type}': must match [A-Z][A-Za-z0-9_]*")]
    InvalidObjectType {
        object_type: String,
    },

    #[error("Invalid reference '{reference}': {reason}")]
    InvalidReference {
        reference: String,
        reason: String,
    },

    #[error("Invalid relation name '{relation}': must be lower snake case")]
    InvalidRelation {
        relation: String,
    },

    #[error("Scan level {level} exceeds the configured maximum {max}")]
    ScanLevelOutOfRange {
        level: u8,
        max: u8,
    },

    #[error("Observation origin '{origin}' cannot declare scan levels")]
    DeclarationFromObservation {
        origin: String,
    },

    #[error("Origin '{origin}' was registered as {expected} but submitted as {actual}")]
    MethodMismatch {
        origin: String,
        expected: String,
        actual: String,
    },

    #[error("Duplicate {kind} '{id}' in payload")]
    DuplicateFact {
        kind: String,
        id: String,
    },

    #[error("Malformed payload: {reason}")]
    MalformedPayload {
        reason: String,
    },
}

/// Top-level error type for scangraph.
#[allow(missing_docs)]
#[derive(Debug, Error)]
pub enum GraphError {
    /// The origin already reported a later valid time. Not retried.
    #[error("Stale origin '{origin}': valid time {submitted} is older than recorded {recorded}")]
    StaleOrigin {
        origin: OriginId,
        submitted: DateTime<Utc>,
        recorded: DateTime<Utc>,
    },

    /// An edge endpoint or declared reference is neither in the payload nor in the graph.
    #[error("Dependency missing: {dependent} references absent object {missing}")]
    DependencyMissing {
        dependent: String,
        missing: Reference,
    },

    /// The store stayed unavailable for every attempt.
    #[error("Store unavailable after {attempts} attempt(s): {message}")]
    StoreUnavailable {
        attempts: u32,
        message: String,
    },

    /// Another writer changed the origin's ledger entry concurrently.
    #[error("Concurrent modification of origin '{origin}' after {attempts} attempt(s)")]
    ConcurrentModification {
        origin: OriginId,
        attempts: u32,
    },

    /// Deltas of a transaction could not be published; they are parked for republish.
    #[error("Publishing deltas of transaction {transaction_id} failed after {attempts} attempt(s): {message}")]
    PublishFailure {
        transaction_id: TransactionId,
        attempts: u32,
        message: String,
    },

    #[error("Validation error: {0}")]
    Validation(#[from] ValidationError),

    #[error("Storage error: {0}")]
    Storage(StorageError),

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Internal error: {message}")]
    Internal {
        message: String,
    },
}

impl GraphError {
    /// Creates an internal error.
    #[must_use]
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    /// Returns true if this is a validation error.
    #[must_use]
    pub const fn is_validation(&self) -> bool {
        matches!(self, Self::Validation(_))
    }

    /// Returns true if the same call may succeed when repeated later.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        match self {
            Self::StoreUnavailable { .. }
            | Self::ConcurrentModification { .. }
            | Self::PublishFailure { .. } => true,
            Self::Storage(e) => e.is_retryable(),
            Self::StaleOrigin { .. }
            | Self::DependencyMissing { .. }
            | Self::Validation(_)
            | Self::Config(_)
            | Self::Internal { .. } => false,
        }
    }
}

impl From<StorageError> for GraphError {
    fn from(err: StorageError) -> Self {
        match err {
            StorageError::Unavailable(message) => Self::StoreUnavailable {
                attempts: 1,
                message,
            },
            other => Self::Storage(other),
        }
    }
}

/// Result type alias for scangraph operations.
pub type GraphResult<T> = Result<T, GraphError>;
