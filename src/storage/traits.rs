//! Abstract storage traits for scangraph.
//!
//! The graph lives in a transactional, time-versioned document store. These
//! traits define the contract a backend must implement:
//! - point-in-time queries over valid time
//! - atomic multi-document submits with a total order of transaction ids
//! - a transaction log so committed work can be replayed by id
//!
//! Nothing is ever physically deleted: a delete appends a tombstone version
//! valid from the transaction's valid time onward.

use std::collections::BTreeSet;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::events::OutboxEntry;
use crate::graph::{Edge, EdgeKey, FactId, Object, Reference};
use crate::origin::{OriginId, OriginRecord};
use crate::scan_profile::{DeclaredLevel, ScanProfile};
use crate::time::TimeRange;

/// Errors that can occur during storage operations.
#[derive(Debug, Error)]
pub enum StorageError {
    /// The backend cannot be reached right now. Retryable.
    #[error("Store unavailable: {0}")]
    Unavailable(String),

    /// A `Match` operation saw a different document; the transaction was not applied.
    #[error("Match failed on {0}")]
    MatchFailed(DocumentKey),

    /// A document does not fit the key it was filed under.
    #[error("Document key mismatch: {0}")]
    KeyMismatch(String),

    /// Backend error.
    #[error("Storage backend error: {0}")]
    BackendError(String),

    /// Serialization failed.
    #[error("Serialization error: {0}")]
    SerializationError(String),
}

impl StorageError {
    /// Returns true if resubmitting the same request may succeed.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(self, Self::Unavailable(_))
    }
}

/// Store-assigned, monotonically increasing transaction id.
///
/// Also the ordering key for downstream events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TransactionId(u64);

impl TransactionId {
    #[allow(missing_docs)]
    #[must_use]
    pub const fn new(id: u64) -> Self {
        Self(id)
    }

    #[allow(missing_docs)]
    #[must_use]
    pub const fn value(self) -> u64 {
        self.0
    }
}

impl fmt::Display for TransactionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identity of a stored document.
#[allow(missing_docs)]
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(tag = "type", content = "id", rename_all = "snake_case")]
pub enum DocumentKey {
    Object(Reference),
    Edge(EdgeKey),
    Origin(OriginId),
    Declaration(Reference),
    Profile(Reference),
    /// Events of a graph transaction awaiting publication.
    Outbox(TransactionId),
}

impl DocumentKey {
    /// Key of the document that materializes an origin-owned fact.
    #[must_use]
    pub fn for_fact(fact: &FactId) -> Self {
        match fact {
            FactId::Object(r) => Self::Object(r.clone()),
            FactId::Edge(k) => Self::Edge(k.clone()),
            FactId::Declaration(r) => Self::Declaration(r.clone()),
        }
    }

    /// The origin-owned fact this key materializes, if any.
    #[must_use]
    pub fn fact(&self) -> Option<FactId> {
        match self {
            Self::Object(r) => Some(FactId::Object(r.clone())),
            Self::Edge(k) => Some(FactId::Edge(k.clone())),
            Self::Declaration(r) => Some(FactId::Declaration(r.clone())),
            Self::Origin(_) | Self::Profile(_) | Self::Outbox(_) => None,
        }
    }
}

impl fmt::Display for DocumentKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Object(r) => write!(f, "object {r}"),
            Self::Edge(k) => write!(f, "edge {k}"),
            Self::Origin(o) => write!(f, "origin {o}"),
            Self::Declaration(r) => write!(f, "declaration {r}"),
            Self::Profile(r) => write!(f, "profile {r}"),
            Self::Outbox(id) => write!(f, "outbox {id}"),
        }
    }
}

/// A stored document.
#[allow(missing_docs)]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "document", rename_all = "snake_case")]
pub enum Document {
    Object(Object),
    Edge(Edge),
    Origin(OriginRecord),
    Declaration(DeclaredLevel),
    Profile(ScanProfile),
    Outbox(OutboxEntry),
}

impl Document {
    /// The key this document is filed under.
    #[must_use]
    pub fn key(&self) -> DocumentKey {
        match self {
            Self::Object(o) => DocumentKey::Object(o.primary_key.clone()),
            Self::Edge(e) => DocumentKey::Edge(e.key.clone()),
            Self::Origin(o) => DocumentKey::Origin(o.id.clone()),
            Self::Declaration(d) => DocumentKey::Declaration(d.reference.clone()),
            Self::Profile(p) => DocumentKey::Profile(p.reference().clone()),
            Self::Outbox(e) => DocumentKey::Outbox(e.batch.transaction_id),
        }
    }

    /// The origin-owned fact this document materializes.
    #[must_use]
    pub fn fact(&self) -> Option<FactId> {
        match self {
            Self::Object(o) => Some(FactId::Object(o.primary_key.clone())),
            Self::Edge(e) => Some(FactId::Edge(e.key.clone())),
            Self::Declaration(d) => Some(FactId::Declaration(d.reference.clone())),
            Self::Origin(_) | Self::Profile(_) | Self::Outbox(_) => None,
        }
    }

    #[allow(missing_docs)]
    #[must_use]
    pub const fn as_object(&self) -> Option<&Object> {
        match self {
            Self::Object(o) => Some(o),
            _ => None,
        }
    }

    #[allow(missing_docs)]
    #[must_use]
    pub const fn as_edge(&self) -> Option<&Edge> {
        match self {
            Self::Edge(e) => Some(e),
            _ => None,
        }
    }

    #[allow(missing_docs)]
    #[must_use]
    pub const fn as_origin(&self) -> Option<&OriginRecord> {
        match self {
            Self::Origin(o) => Some(o),
            _ => None,
        }
    }

    #[allow(missing_docs)]
    #[must_use]
    pub const fn as_declaration(&self) -> Option<&DeclaredLevel> {
        match self {
            Self::Declaration(d) => Some(d),
            _ => None,
        }
    }

    #[allow(missing_docs)]
    #[must_use]
    pub const fn as_profile(&self) -> Option<&ScanProfile> {
        match self {
            Self::Profile(p) => Some(p),
            _ => None,
        }
    }

    #[allow(missing_docs)]
    #[must_use]
    pub const fn as_outbox(&self) -> Option<&OutboxEntry> {
        match self {
            Self::Outbox(e) => Some(e),
            _ => None,
        }
    }
}

/// One operation inside a transaction.
#[allow(missing_docs)]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Operation {
    /// Store a new version of the document.
    Put { document: Document },
    /// Append a tombstone version.
    Delete { key: DocumentKey },
    /// Abort the whole transaction unless the visible document equals `expected`.
    Match {
        key: DocumentKey,
        expected: Option<Document>,
    },
}

impl Operation {
    /// Key the operation touches.
    #[must_use]
    pub fn key(&self) -> DocumentKey {
        match self {
            Self::Put { document } => document.key(),
            Self::Delete { key } | Self::Match { key, .. } => key.clone(),
        }
    }

    /// Returns true for `Put` and `Delete`.
    #[must_use]
    pub const fn is_write(&self) -> bool {
        !matches!(self, Self::Match { .. })
    }
}

/// An atomic batch of operations, all applied at one valid time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Transaction {
    /// Valid time every operation takes effect at.
    pub valid_time: DateTime<Utc>,
    #[allow(missing_docs)]
    pub operations: Vec<Operation>,
}

impl Transaction {
    #[allow(missing_docs)]
    #[must_use]
    pub const fn new(valid_time: DateTime<Utc>) -> Self {
        Self {
            valid_time,
            operations: Vec::new(),
        }
    }

    #[allow(missing_docs)]
    pub fn put(&mut self, document: Document) {
        self.operations.push(Operation::Put { document });
    }

    #[allow(missing_docs)]
    pub fn delete(&mut self, key: DocumentKey) {
        self.operations.push(Operation::Delete { key });
    }

    #[allow(missing_docs)]
    pub fn expect(&mut self, key: DocumentKey, expected: Option<Document>) {
        self.operations.push(Operation::Match { key, expected });
    }

    /// Returns true if the transaction would not write anything.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        !self.operations.iter().any(Operation::is_write)
    }
}

/// A transaction as recorded in the store's log.
#[allow(missing_docs)]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommittedTransaction {
    pub id: TransactionId,
    pub tx_time: DateTime<Utc>,
    pub valid_time: DateTime<Utc>,
    pub operations: Vec<Operation>,
}

/// One version of a document in its history.
#[allow(missing_docs)]
#[derive(Debug, Clone, PartialEq)]
pub struct DocumentVersion {
    pub valid: TimeRange,
    pub tx_id: TransactionId,
    pub tx_time: DateTime<Utc>,
    /// None for a tombstone.
    pub document: Option<Document>,
}

/// Query patterns the store evaluates at a point in valid time.
#[allow(missing_docs)]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum QueryPattern {
    /// A single document.
    Key(DocumentKey),
    /// All live objects, optionally of one type.
    Objects { object_type: Option<String> },
    /// All live edges.
    Edges,
    /// Live edges with `reference` as source or target.
    EdgesTouching(Reference),
    /// All live origin ledger documents.
    Origins,
    /// Live origin ledger documents whose result set contains the fact.
    OriginsAsserting(FactId),
    /// All live declared levels.
    Declarations,
    /// All live scan profiles.
    Profiles,
    /// All live outbox entries.
    Outbox,
}

/// Storage trait for the bitemporal graph store.
///
/// # Safety Considerations
/// - `submit` must be atomic: either every operation applies or none does
/// - transaction ids must be strictly increasing in commit order
/// - implementations must handle concurrent access safely
pub trait GraphStore: Send + Sync {
    /// Evaluate a pattern against the versions visible at `at`.
    fn query(&self, at: DateTime<Utc>, pattern: &QueryPattern) -> Result<Vec<Document>, StorageError>;

    /// Atomically apply a transaction; returns its id.
    fn submit(&self, tx: Transaction) -> Result<TransactionId, StorageError>;

    /// Block until every prior submit is queryable; returns the latest id.
    fn sync(&self) -> Result<Option<TransactionId>, StorageError>;

    /// Look up a committed transaction by id.
    fn transaction(&self, id: TransactionId) -> Result<Option<CommittedTransaction>, StorageError>;

    /// All versions of a document, ordered by valid time then transaction id.
    fn history(&self, key: &DocumentKey) -> Result<Vec<DocumentVersion>, StorageError>;

    /// Valid times strictly after `after` at which a version starts for the
    /// object, declaration or profile of any of `references`, or for any edge
    /// ever touching one of them.
    fn valid_times_after(
        &self,
        after: DateTime<Utc>,
        references: &BTreeSet<Reference>,
    ) -> Result<BTreeSet<DateTime<Utc>>, StorageError>;

    /// Fetch one document visible at `at`.
    fn get(&self, at: DateTime<Utc>, key: &DocumentKey) -> Result<Option<Document>, StorageError> {
        Ok(self
            .query(at, &QueryPattern::Key(key.clone()))?
            .into_iter()
            .next())
    }
}
