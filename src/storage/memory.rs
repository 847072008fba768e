//! In-memory storage backend.
//!
//! Thread-safe, append-only implementation of [`GraphStore`]. It keeps every
//! version of every document, answers point-in-time queries over valid time
//! and records a transaction log. It is intended for embedded usage, tests,
//! and as a reference implementation of the store contract.

use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::RwLock;

use chrono::{DateTime, Utc};

use crate::graph::{EdgeKey, Reference};
use crate::storage::traits::{
    CommittedTransaction, Document, DocumentKey, DocumentVersion, GraphStore, Operation, QueryPattern,
    StorageError, Transaction, TransactionId,
};
use crate::time::TimeRange;

fn lock_err(context: &'static str) -> StorageError {
    StorageError::BackendError(format!("poisoned lock: {context}"))
}

#[derive(Debug, Clone)]
struct StoredVersion {
    valid_from: DateTime<Utc>,
    tx_id: TransactionId,
    tx_time: DateTime<Utc>,
    document: Option<Document>,
}

#[derive(Debug, Default)]
struct StoreState {
    versions: HashMap<DocumentKey, Vec<StoredVersion>>,
    /// Every edge key ever written, by endpoint. Visibility is checked at query time.
    edges_by_endpoint: HashMap<Reference, BTreeSet<EdgeKey>>,
    log: Vec<CommittedTransaction>,
}

impl StoreState {
    fn visible(&self, key: &DocumentKey, at: DateTime<Utc>) -> Option<&Document> {
        self.versions
            .get(key)?
            .iter()
            .filter(|v| v.valid_from <= at)
            .max_by_key(|v| (v.valid_from, v.tx_id))
            .and_then(|v| v.document.as_ref())
    }

    fn visible_where<F>(&self, at: DateTime<Utc>, keep: F) -> Vec<Document>
    where
        F: Fn(&DocumentKey, &Document) -> bool,
    {
        let mut keys: Vec<&DocumentKey> = self.versions.keys().collect();
        keys.sort();
        keys.into_iter()
            .filter_map(|key| {
                self.visible(key, at)
                    .filter(|doc| keep(key, doc))
                    .cloned()
            })
            .collect()
    }

    fn last_id(&self) -> Option<TransactionId> {
        self.log.last().map(|tx| tx.id)
    }
}

/// In-memory bitemporal graph store.
#[derive(Debug, Default)]
pub struct InMemoryGraphStore {
    state: RwLock<StoreState>,
    failing_submits: AtomicU32,
    unavailable: AtomicBool,
}

impl InMemoryGraphStore {
    /// Create an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `n` submits fail with `StorageError::Unavailable`.
    pub fn fail_next_submits(&self, n: u32) {
        self.failing_submits.store(n, Ordering::SeqCst);
    }

    /// Toggle availability of every operation.
    pub fn set_available(&self, available: bool) {
        self.unavailable.store(!available, Ordering::SeqCst);
    }

    /// Number of committed transactions.
    ///
    /// # Errors
    ///
    /// Returns `StorageError::BackendError` on a poisoned lock.
    pub fn transaction_count(&self) -> Result<usize, StorageError> {
        let state = self.state.read().map_err(|_| lock_err("transaction_count"))?;
        Ok(state.log.len())
    }

    fn check_available(&self) -> Result<(), StorageError> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(StorageError::Unavailable("store marked unavailable".to_string()));
        }
        Ok(())
    }

    fn take_injected_failure(&self) -> bool {
        self.failing_submits
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

impl GraphStore for InMemoryGraphStore {
    fn query(&self, at: DateTime<Utc>, pattern: &QueryPattern) -> Result<Vec<Document>, StorageError> {
        self.check_available()?;
        let state = self.state.read().map_err(|_| lock_err("query"))?;

        let docs = match pattern {
            QueryPattern::Key(key) => state.visible(key, at).cloned().into_iter().collect(),
            QueryPattern::Objects { object_type } => state.visible_where(at, |_, doc| {
                doc.as_object()
                    .is_some_and(|o| object_type.as_ref().map_or(true, |t| &o.object_type == t))
            }),
            QueryPattern::Edges => state.visible_where(at, |key, _| matches!(key, DocumentKey::Edge(_))),
            QueryPattern::EdgesTouching(reference) => state
                .edges_by_endpoint
                .get(reference)
                .into_iter()
                .flatten()
                .filter_map(|edge| state.visible(&DocumentKey::Edge(edge.clone()), at).cloned())
                .collect(),
            QueryPattern::Origins => state.visible_where(at, |key, _| matches!(key, DocumentKey::Origin(_))),
            QueryPattern::OriginsAsserting(fact) => {
                state.visible_where(at, |_, doc| doc.as_origin().is_some_and(|o| o.asserts(fact)))
            }
            QueryPattern::Declarations => {
                state.visible_where(at, |key, _| matches!(key, DocumentKey::Declaration(_)))
            }
            QueryPattern::Profiles => state.visible_where(at, |key, _| matches!(key, DocumentKey::Profile(_))),
            QueryPattern::Outbox => state.visible_where(at, |key, _| matches!(key, DocumentKey::Outbox(_))),
        };
        Ok(docs)
    }

    fn submit(&self, tx: Transaction) -> Result<TransactionId, StorageError> {
        self.check_available()?;
        if self.take_injected_failure() {
            return Err(StorageError::Unavailable("injected submit failure".to_string()));
        }

        let mut state = self.state.write().map_err(|_| lock_err("submit"))?;

        for op in &tx.operations {
            if let Operation::Match { key, expected } = op {
                if state.visible(key, tx.valid_time) != expected.as_ref() {
                    return Err(StorageError::MatchFailed(key.clone()));
                }
            }
        }

        let id = TransactionId::new(state.last_id().map_or(1, |last| last.value() + 1));
        let tx_time = Utc::now();

        for op in &tx.operations {
            let (key, document) = match op {
                Operation::Put { document } => (document.key(), Some(document.clone())),
                Operation::Delete { key } => (key.clone(), None),
                Operation::Match { .. } => continue,
            };
            if let DocumentKey::Edge(edge) = &key {
                for endpoint in [&edge.source, &edge.target] {
                    state
                        .edges_by_endpoint
                        .entry(endpoint.clone())
                        .or_default()
                        .insert(edge.clone());
                }
            }
            state.versions.entry(key).or_default().push(StoredVersion {
                valid_from: tx.valid_time,
                tx_id: id,
                tx_time,
                document,
            });
        }

        state.log.push(CommittedTransaction {
            id,
            tx_time,
            valid_time: tx.valid_time,
            operations: tx.operations,
        });
        Ok(id)
    }

    fn sync(&self) -> Result<Option<TransactionId>, StorageError> {
        self.check_available()?;
        // Submits apply under the write lock, so everything committed is already visible.
        let state = self.state.read().map_err(|_| lock_err("sync"))?;
        Ok(state.last_id())
    }

    fn transaction(&self, id: TransactionId) -> Result<Option<CommittedTransaction>, StorageError> {
        self.check_available()?;
        let state = self.state.read().map_err(|_| lock_err("transaction"))?;
        let Some(index) = usize::try_from(id.value()).ok().and_then(|v| v.checked_sub(1)) else {
            return Ok(None);
        };
        Ok(state.log.get(index).cloned())
    }

    fn history(&self, key: &DocumentKey) -> Result<Vec<DocumentVersion>, StorageError> {
        self.check_available()?;
        let state = self.state.read().map_err(|_| lock_err("history"))?;

        let mut versions = state.versions.get(key).cloned().unwrap_or_default();
        versions.sort_by_key(|v| (v.valid_from, v.tx_id));

        let mut out = Vec::with_capacity(versions.len());
        for (i, v) in versions.iter().enumerate() {
            let mut valid = TimeRange::starting_at(v.valid_from);
            if let Some(next) = versions.get(i + 1) {
                valid
                    .close_at(next.valid_from)
                    .map_err(|e| StorageError::BackendError(e.to_string()))?;
            }
            out.push(DocumentVersion {
                valid,
                tx_id: v.tx_id,
                tx_time: v.tx_time,
                document: v.document.clone(),
            });
        }
        Ok(out)
    }

    fn valid_times_after(
        &self,
        after: DateTime<Utc>,
        references: &BTreeSet<Reference>,
    ) -> Result<BTreeSet<DateTime<Utc>>, StorageError> {
        self.check_available()?;
        let state = self.state.read().map_err(|_| lock_err("valid_times_after"))?;

        let mut keys = Vec::new();
        for reference in references {
            keys.push(DocumentKey::Object(reference.clone()));
            keys.push(DocumentKey::Declaration(reference.clone()));
            keys.push(DocumentKey::Profile(reference.clone()));
            if let Some(edges) = state.edges_by_endpoint.get(reference) {
                keys.extend(edges.iter().cloned().map(DocumentKey::Edge));
            }
        }
        Ok(keys
            .iter()
            .filter_map(|key| state.versions.get(key))
            .flatten()
            .map(|v| v.valid_from)
            .filter(|t| *t > after)
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::collections::BTreeMap;

    use chrono::Duration;

    use crate::graph::{Edge, FactId, Object};
    use crate::origin::{OriginId, OriginMethod, OriginRecord};

    fn host() -> Object {
        Object::new("Hostname", &["internet", "example.com"]).unwrap()
    }

    fn ip() -> Object {
        Object::new("IPAddressV4", &["internet", "1.1.1.1"]).unwrap()
    }

    fn put(valid_time: DateTime<Utc>, docs: Vec<Document>) -> Transaction {
        let mut tx = Transaction::new(valid_time);
        for doc in docs {
            tx.put(doc);
        }
        tx
    }

    #[test]
    fn test_point_in_time_reads() {
        let store = InMemoryGraphStore::new();
        let t0 = Utc::now();
        let key = DocumentKey::Object(host().primary_key);

        store.submit(put(t0, vec![Document::Object(host())])).unwrap();
        let mut delete = Transaction::new(t0 + Duration::hours(1));
        delete.delete(key.clone());
        store.submit(delete).unwrap();

        assert!(store.get(t0 - Duration::seconds(1), &key).unwrap().is_none());
        assert!(store.get(t0, &key).unwrap().is_some());
        assert!(store.get(t0 + Duration::minutes(30), &key).unwrap().is_some());
        assert!(store.get(t0 + Duration::hours(2), &key).unwrap().is_none());
    }

    #[test]
    fn test_later_transaction_at_same_valid_time_wins() {
        let store = InMemoryGraphStore::new();
        let t0 = Utc::now();
        let updated = host().with_attribute("ttl", serde_json::json!(60));

        store.submit(put(t0, vec![Document::Object(host())])).unwrap();
        store.submit(put(t0, vec![Document::Object(updated.clone())])).unwrap();

        let got = store.get(t0, &DocumentKey::Object(host().primary_key)).unwrap();
        assert_eq!(got, Some(Document::Object(updated)));

        let history = store.history(&DocumentKey::Object(host().primary_key)).unwrap();
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].valid.to, Some(history[0].valid.from));
        assert!(history[1].valid.to.is_none());
    }

    #[test]
    fn test_transaction_ids_increase_and_log_replays() {
        let store = InMemoryGraphStore::new();
        let t0 = Utc::now();
        let a = store.submit(put(t0, vec![Document::Object(host())])).unwrap();
        let b = store.submit(put(t0, vec![Document::Object(ip())])).unwrap();
        assert!(b > a);
        assert_eq!(store.sync().unwrap(), Some(b));

        let logged = store.transaction(a).unwrap().unwrap();
        assert_eq!(logged.operations.len(), 1);
        assert!(store.transaction(TransactionId::new(99)).unwrap().is_none());
        assert!(store.transaction(TransactionId::new(0)).unwrap().is_none());
    }

    #[test]
    fn test_match_failure_aborts_whole_transaction() {
        let store = InMemoryGraphStore::new();
        let t0 = Utc::now();
        let origin = OriginId::new("dns");
        let record = OriginRecord {
            id: origin.clone(),
            method: OriginMethod::Observation,
            valid_time: t0,
            result: BTreeMap::from([(FactId::Object(host().primary_key), Document::Object(host()))]),
            runs: 1,
        };

        let mut tx = put(t0, vec![Document::Object(host())]);
        tx.expect(DocumentKey::Origin(origin.clone()), Some(Document::Origin(record)));
        let err = store.submit(tx).unwrap_err();
        assert!(matches!(err, StorageError::MatchFailed(DocumentKey::Origin(_))));

        assert!(store.get(t0, &DocumentKey::Object(host().primary_key)).unwrap().is_none());
        assert_eq!(store.sync().unwrap(), None);
    }

    #[test]
    fn test_edges_touching_respects_tombstones() {
        let store = InMemoryGraphStore::new();
        let t0 = Utc::now();
        let key = EdgeKey::new(host().primary_key, "resolves_to", ip().primary_key).unwrap();
        store
            .submit(put(
                t0,
                vec![
                    Document::Object(host()),
                    Document::Object(ip()),
                    Document::Edge(Edge::new(key.clone())),
                ],
            ))
            .unwrap();

        let touching = store
            .query(t0, &QueryPattern::EdgesTouching(ip().primary_key))
            .unwrap();
        assert_eq!(touching.len(), 1);

        let mut delete = Transaction::new(t0 + Duration::seconds(1));
        delete.delete(DocumentKey::Edge(key));
        store.submit(delete).unwrap();

        let later = store
            .query(t0 + Duration::seconds(2), &QueryPattern::EdgesTouching(ip().primary_key))
            .unwrap();
        assert!(later.is_empty());
        assert_eq!(store.query(t0, &QueryPattern::Edges).unwrap().len(), 1);
    }

    #[test]
    fn test_valid_times_after_includes_touching_edges() {
        let store = InMemoryGraphStore::new();
        let t0 = Utc::now();
        let t1 = t0 + Duration::seconds(1);
        let t2 = t0 + Duration::seconds(2);
        let key = EdgeKey::new(host().primary_key, "resolves_to", ip().primary_key).unwrap();

        store.submit(put(t0, vec![Document::Object(host())])).unwrap();
        store.submit(put(t1, vec![Document::Object(ip())])).unwrap();
        let mut delete = Transaction::new(t2);
        delete.delete(DocumentKey::Edge(key.clone()));
        store.submit(put(t1, vec![Document::Edge(Edge::new(key))])).unwrap();
        store.submit(delete).unwrap();

        let host_only = BTreeSet::from([host().primary_key]);
        assert_eq!(store.valid_times_after(t0, &host_only).unwrap(), BTreeSet::from([t1, t2]));
        assert_eq!(store.valid_times_after(t1, &host_only).unwrap(), BTreeSet::from([t2]));
        assert!(store.valid_times_after(t2, &host_only).unwrap().is_empty());
    }

    #[test]
    fn test_objects_filtered_by_type() {
        let store = InMemoryGraphStore::new();
        let t0 = Utc::now();
        store
            .submit(put(t0, vec![Document::Object(host()), Document::Object(ip())]))
            .unwrap();

        let all = store.query(t0, &QueryPattern::Objects { object_type: None }).unwrap();
        assert_eq!(all.len(), 2);
        let hosts = store
            .query(
                t0,
                &QueryPattern::Objects {
                    object_type: Some("Hostname".to_string()),
                },
            )
            .unwrap();
        assert_eq!(hosts, vec![Document::Object(host())]);
    }

    #[test]
    fn test_injected_failures_are_consumed() {
        let store = InMemoryGraphStore::new();
        store.fail_next_submits(2);
        let t0 = Utc::now();

        for _ in 0..2 {
            let err = store.submit(put(t0, vec![Document::Object(host())])).unwrap_err();
            assert!(err.is_retryable());
        }
        assert!(store.submit(put(t0, vec![Document::Object(host())])).is_ok());
        assert_eq!(store.transaction_count().unwrap(), 1);
    }

    #[test]
    fn test_unavailable_store_rejects_reads() {
        let store = InMemoryGraphStore::new();
        store.set_available(false);
        assert!(matches!(store.sync(), Err(StorageError::Unavailable(_))));
        store.set_available(true);
        assert_eq!(store.sync().unwrap(), None);
    }
}
