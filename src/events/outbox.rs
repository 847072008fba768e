//! Durable outbox between profile writes and the broker.
//!
//! Propagation writes a transaction's event batch into the store in the same
//! transaction as the profile writes it describes. The publisher tombstones
//! the entry once every message went out. Any version of an entry, live or
//! tombstoned, marks its graph transaction as propagated, so a restarted
//! engine can tell finished work from work it still owes.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::GraphResult;
use crate::storage::{Document, DocumentKey, GraphStore, QueryPattern, Transaction, TransactionId};

use super::EventBatch;

/// Events of one graph transaction awaiting publication.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutboxEntry {
    #[allow(missing_docs)]
    pub batch: EventBatch,
    /// Valid time the entry was written at; its tombstone goes at the same time.
    pub valid_time: DateTime<Utc>,
    /// False while later valid times of the transaction are still to be recomputed.
    pub propagated: bool,
}

impl OutboxEntry {
    #[allow(missing_docs)]
    #[must_use]
    pub const fn key(&self) -> DocumentKey {
        DocumentKey::Outbox(self.batch.transaction_id)
    }
}

/// How far a graph transaction got through propagation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum FlushState {
    /// Propagation never recorded anything for it.
    Unrecorded,
    /// Stopped between valid times; resume from the recorded batch.
    Partial(EventBatch),
    /// Fully propagated. Its events may still await publication.
    Recorded,
}

/// Appends the outbox write for `batch` to `tx`.
///
/// A batch with events is stored as an entry. An empty batch leaves a bare
/// tombstone once propagation is done, and nothing before that.
pub(crate) fn record(tx: &mut Transaction, batch: &EventBatch, propagated: bool) {
    if !batch.is_empty() {
        tx.put(Document::Outbox(OutboxEntry {
            batch: batch.clone(),
            valid_time: tx.valid_time,
            propagated,
        }));
    } else if propagated {
        tx.delete(DocumentKey::Outbox(batch.transaction_id));
    }
}

pub(crate) fn flush_state(store: &dyn GraphStore, id: TransactionId) -> GraphResult<FlushState> {
    let history = store.history(&DocumentKey::Outbox(id))?;
    let Some(latest) = history.into_iter().max_by_key(|v| (v.valid.from, v.tx_id)) else {
        return Ok(FlushState::Unrecorded);
    };
    Ok(match latest.document {
        Some(Document::Outbox(entry)) if !entry.propagated => FlushState::Partial(entry.batch),
        _ => FlushState::Recorded,
    })
}

/// Live entry of a transaction, regardless of the valid time it was written at.
pub(crate) fn entry(store: &dyn GraphStore, id: TransactionId) -> GraphResult<Option<OutboxEntry>> {
    let doc = store.get(DateTime::<Utc>::MAX_UTC, &DocumentKey::Outbox(id))?;
    Ok(doc.and_then(|d| d.as_outbox().cloned()))
}

/// Every live entry, in transaction order.
pub(crate) fn entries(store: &dyn GraphStore) -> GraphResult<Vec<OutboxEntry>> {
    let docs = store.query(DateTime::<Utc>::MAX_UTC, &QueryPattern::Outbox)?;
    Ok(docs.iter().filter_map(|d| d.as_outbox().cloned()).collect())
}
