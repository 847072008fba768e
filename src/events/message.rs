//! Wire messages.
//!
//! Messages are JSON. Every message carries the transaction id it belongs to
//! and a message id derived deterministically from `(transaction_id,
//! object_id, kind)`, so redelivering a transaction produces byte-identical
//! messages that consumers can drop.

use std::collections::HashSet;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::graph::{FactId, Reference};
use crate::origin::OriginId;
use crate::reconcile::{ChangeKind, GraphChange};
use crate::scan_profile::{DeltaKind, ProfileDelta, ScanLevel};
use crate::storage::TransactionId;

use super::queue::QueueError;

/// UUIDv5 namespace for message ids.
const MESSAGE_NAMESPACE: Uuid = Uuid::from_u128(0x5c1a_9e0f_4b7d_4e21_a3f6_2d8c_17b0_e944);

fn message_id(transaction_id: TransactionId, object: &str, kind: &str) -> Uuid {
    let name = format!("{transaction_id}|{object}|{kind}");
    Uuid::new_v5(&MESSAGE_NAMESPACE, name.as_bytes())
}

/// Scan profile change as published on the increment and mutation topics.
#[allow(missing_docs)]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProfileMessage {
    pub message_id: Uuid,
    pub transaction_id: TransactionId,
    pub object_id: Reference,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub old_level: Option<ScanLevel>,
    pub new_level: ScanLevel,
    pub kind: DeltaKind,
}

impl ProfileMessage {
    #[allow(missing_docs)]
    #[must_use]
    pub fn new(transaction_id: TransactionId, delta: &ProfileDelta) -> Self {
        Self {
            message_id: message_id(transaction_id, delta.reference.as_str(), delta.kind.as_str()),
            transaction_id,
            object_id: delta.reference.clone(),
            old_level: delta.old_level,
            new_level: delta.new_level,
            kind: delta.kind,
        }
    }

    /// Consumer-side deduplication key.
    #[must_use]
    pub fn dedup_key(&self) -> (TransactionId, String) {
        (self.transaction_id, self.object_id.to_string())
    }
}

/// Fact-level graph change, published only when a graph change topic is configured.
#[allow(missing_docs)]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GraphChangeMessage {
    pub message_id: Uuid,
    pub transaction_id: TransactionId,
    pub origin: OriginId,
    pub fact: FactId,
    pub kind: ChangeKind,
}

impl GraphChangeMessage {
    #[allow(missing_docs)]
    #[must_use]
    pub fn new(transaction_id: TransactionId, origin: &OriginId, change: &GraphChange) -> Self {
        let kind = match change.kind {
            ChangeKind::Created => "created",
            ChangeKind::Updated => "updated",
            ChangeKind::Retracted => "retracted",
        };
        Self {
            message_id: message_id(transaction_id, &change.fact.to_string(), kind),
            transaction_id,
            origin: origin.clone(),
            fact: change.fact.clone(),
            kind: change.kind,
        }
    }
}

/// Serializes a message to its wire form.
///
/// # Errors
///
/// Returns `QueueError::Serialization` if encoding fails.
pub fn encode<T: Serialize>(message: &T) -> Result<Vec<u8>, QueueError> {
    serde_json::to_vec(message).map_err(|e| QueueError::Serialization(e.to_string()))
}

/// Parses a message from its wire form.
///
/// # Errors
///
/// Returns `QueueError::Serialization` for malformed bytes.
pub fn decode<T: for<'de> Deserialize<'de>>(bytes: &[u8]) -> Result<T, QueueError> {
    serde_json::from_slice(bytes).map_err(|e| QueueError::Serialization(e.to_string()))
}

/// Idempotent-consumer helper: accepts each `(transaction_id, object_id)` once.
#[derive(Debug, Default)]
pub struct Deduplicator {
    seen: HashSet<(TransactionId, String)>,
}

impl Deduplicator {
    #[allow(missing_docs)]
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns true the first time a message's key is seen.
    pub fn accept(&mut self, message: &ProfileMessage) -> bool {
        self.seen.insert(message.dedup_key())
    }
}
