//! Origin ledger: per-origin record of the most recent run.
//!
//! The ledger is stored in the graph store itself, one `Origin` document per
//! origin, so its update commits in the same transaction as the graph
//! mutation it describes. A `Match` on the previous record makes a concurrent
//! writer of the same origin fail instead of silently interleaving.

use std::collections::BTreeSet;
use std::sync::Arc;

use chrono::{DateTime, Utc};

use crate::error::{GraphError, GraphResult};
use crate::graph::FactId;
use crate::origin::{OriginId, OriginRecord};
use crate::storage::{Document, DocumentKey, GraphStore, QueryPattern, Transaction};

/// Read/write access to origin records.
#[derive(Clone)]
pub struct OriginLedger {
    store: Arc<dyn GraphStore>,
}

impl std::fmt::Debug for OriginLedger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OriginLedger").finish_non_exhaustive()
    }
}

impl OriginLedger {
    #[allow(missing_docs)]
    pub fn new(store: Arc<dyn GraphStore>) -> Self {
        Self { store }
    }

    /// The origin's latest record, regardless of valid time.
    ///
    /// A retired origin has a tombstone as its latest version and reads as `None`.
    ///
    /// # Errors
    ///
    /// Propagates store errors.
    pub fn get_previous(&self, origin: &OriginId) -> GraphResult<Option<OriginRecord>> {
        let history = self.store.history(&DocumentKey::Origin(origin.clone()))?;
        let Some(latest) = history.into_iter().max_by_key(|v| (v.valid.from, v.tx_id)) else {
            return Ok(None);
        };
        match latest.document {
            None => Ok(None),
            Some(Document::Origin(record)) => Ok(Some(record)),
            Some(other) => Err(GraphError::internal(format!(
                "ledger entry for {origin} holds a {} document",
                other.key()
            ))),
        }
    }

    /// Valid time of the origin's latest ledger version, including a retirement.
    ///
    /// # Errors
    ///
    /// Propagates store errors.
    pub fn last_seen(&self, origin: &OriginId) -> GraphResult<Option<DateTime<Utc>>> {
        Ok(self
            .store
            .history(&DocumentKey::Origin(origin.clone()))?
            .into_iter()
            .map(|v| v.valid.from)
            .max())
    }

    /// Facts the origin asserted in its latest run (empty if unknown).
    ///
    /// # Errors
    ///
    /// Propagates store errors.
    pub fn previous_facts(&self, origin: &OriginId) -> GraphResult<BTreeSet<FactId>> {
        Ok(self
            .get_previous(origin)?
            .map(|record| record.facts())
            .unwrap_or_default())
    }

    /// Appends the ledger update for `record` to `tx`.
    ///
    /// `previous` must be exactly what [`OriginLedger::get_previous`] returned
    /// when the plan was made; the guard fails the transaction otherwise.
    pub fn set_current(tx: &mut Transaction, previous: Option<&OriginRecord>, record: OriginRecord) {
        tx.expect(
            DocumentKey::Origin(record.id.clone()),
            previous.cloned().map(Document::Origin),
        );
        tx.put(Document::Origin(record));
    }

    /// Appends a tombstone for the origin's record to `tx`.
    pub fn retire(tx: &mut Transaction, previous: &OriginRecord) {
        let key = DocumentKey::Origin(previous.id.clone());
        tx.expect(key.clone(), Some(Document::Origin(previous.clone())));
        tx.delete(key);
    }

    /// Latest records of every live origin that asserts `fact`.
    ///
    /// Ownership follows each origin's latest run whatever its valid time, the
    /// same record [`OriginLedger::get_previous`] returns. An origin that last
    /// ran later than `fact` is being dropped still owns it.
    ///
    /// # Errors
    ///
    /// Propagates store errors.
    pub fn owners(&self, fact: &FactId) -> GraphResult<Vec<OriginRecord>> {
        Ok(self
            .store
            .query(DateTime::<Utc>::MAX_UTC, &QueryPattern::OriginsAsserting(fact.clone()))?
            .into_iter()
            .filter_map(|doc| match doc {
                Document::Origin(record) => Some(record),
                _ => None,
            })
            .collect())
    }
}
