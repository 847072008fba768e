//! Engine facade wiring reconciliation, propagation, publishing and the
//! flush barrier together.
//!
//! Ingestion is synchronous up to the graph commit. Everything after it
//! (profile propagation, event publishing, flush bookkeeping) runs on one
//! background worker fed through a bounded channel, so the caller of
//! [`GraphEngine::ingest`] only waits for the commit and, when the channel
//! is full, for room in the queue.

mod recalculation;
mod worker;

pub use recalculation::{RecalculationHandle, RecalculationReport};

use std::collections::BTreeSet;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Utc};

use crate::barrier::SyncBarrier;
use crate::config::{EngineConfig, LevelConfig};
use crate::error::{GraphError, GraphResult};
use crate::events::outbox::{self, FlushState};
use crate::events::{EventBatch, EventPublisher, QueueClient};
use crate::graph::{Object, Reference};
use crate::origin::{OriginId, OriginPayload};
use crate::propagation::ScanProfilePropagator;
use crate::reconcile::{ChangeKind, GraphChange, OriginReconciler, TransactionResult};
use crate::scan_profile::{ScanLevel, ScanProfile};
use crate::storage::{CommittedTransaction, Document, DocumentKey, GraphStore, Operation, TransactionId};

use worker::Worker;

/// Post-commit work for one graph transaction: the events known at commit.
pub(crate) type FlushJob = EventBatch;

fn job_for(result: &TransactionResult) -> Option<FlushJob> {
    result
        .transaction_id
        .map(|id| EventBatch::new(id).with_graph_changes(result.origin.clone(), result.changes.clone()))
}

/// Graph transactions are the ones reconciliation commits; each writes its
/// origin's ledger record.
fn is_graph_transaction(tx: &CommittedTransaction) -> bool {
    tx.operations
        .iter()
        .any(|op| op.is_write() && matches!(op.key(), DocumentKey::Origin(_)))
}

/// State shared by the engine, its worker and the recalculation thread.
pub(crate) struct Core {
    pub(crate) store: Arc<dyn GraphStore>,
    pub(crate) reconciler: OriginReconciler,
    pub(crate) propagator: ScanProfilePropagator,
    pub(crate) publisher: EventPublisher,
    pub(crate) barrier: SyncBarrier,
    pub(crate) levels: LevelConfig,
    /// Transactions a flush is working on right now.
    claimed: Mutex<BTreeSet<TransactionId>>,
    /// Log position below which every graph transaction is known to be propagated.
    recovered: Mutex<u64>,
}

impl Core {
    /// Propagates a committed transaction and publishes its events.
    ///
    /// Progress lives in the store's outbox, so the job resumes wherever an
    /// earlier attempt (from this process or a previous one) stopped. The
    /// transaction is marked flushed only once both steps succeed. A failed
    /// propagation is picked up by the next recalculation pass; a failed
    /// publish leaves the batch in the outbox.
    pub(crate) fn flush(&self, job: FlushJob) {
        let id = job.transaction_id;
        if !lock(&self.claimed).insert(id) {
            tracing::debug!(tx = %id, "transaction already being flushed");
            return;
        }
        match self.flush_claimed(job) {
            Ok(()) => self.barrier.complete(id),
            // Parked in the outbox; completed once republished.
            Err(e @ GraphError::PublishFailure { .. }) => tracing::debug!(tx = %id, error = %e, "transaction left pending"),
            Err(e) => tracing::warn!(tx = %id, error = %e, "flush failed, transaction deferred to recalculation"),
        }
        lock(&self.claimed).remove(&id);
    }

    fn flush_claimed(&self, job: FlushJob) -> GraphResult<()> {
        let id = job.transaction_id;
        let seed = match outbox::flush_state(&*self.store, id)? {
            FlushState::Unrecorded => job,
            FlushState::Partial(batch) => batch,
            FlushState::Recorded => {
                return match outbox::entry(&*self.store, id)? {
                    None => Ok(()),
                    Some(entry) => self.publisher.publish(entry.batch),
                };
            }
        };

        let report = self.propagator.propagate_recorded(&seed)?;
        self.publisher.publish(seed.with_profile_deltas(report.deltas))
    }

    /// Graph transactions whose propagation never finished, oldest first,
    /// skipping those a flush is working on.
    fn unfinished(&self) -> GraphResult<Vec<(CommittedTransaction, FlushState)>> {
        let Some(latest) = self.store.sync()? else {
            return Ok(Vec::new());
        };
        let mut recovered = lock(&self.recovered);
        let claimed = lock(&self.claimed).clone();

        let mut out = Vec::new();
        let mut contiguous = true;
        for raw in *recovered..=latest.value() {
            let id = TransactionId::new(raw);
            let Some(tx) = self.store.transaction(id)? else { continue };
            let state = if is_graph_transaction(&tx) {
                outbox::flush_state(&*self.store, id)?
            } else {
                FlushState::Recorded
            };
            if state == FlushState::Recorded {
                if contiguous {
                    *recovered = raw + 1;
                }
                continue;
            }
            contiguous = false;
            if !claimed.contains(&id) {
                out.push((tx, state));
            }
        }
        Ok(out)
    }

    /// Rebuilds the post-commit job of an unfinished transaction.
    fn recover(&self, tx: &CommittedTransaction, state: FlushState) -> GraphResult<FlushJob> {
        if let FlushState::Partial(batch) = state {
            return Ok(batch);
        }

        let mut origin = None;
        let mut changes = Vec::new();
        for op in &tx.operations {
            let kind = match op {
                Operation::Match { .. } => continue,
                Operation::Put {
                    document: Document::Origin(record),
                } => {
                    origin = Some(record.id.clone());
                    continue;
                }
                Operation::Delete {
                    key: DocumentKey::Origin(id),
                } => {
                    origin = Some(id.clone());
                    continue;
                }
                Operation::Delete { .. } => ChangeKind::Retracted,
                Operation::Put { document } if self.existed_before(tx, &document.key())? => ChangeKind::Updated,
                Operation::Put { .. } => ChangeKind::Created,
            };
            if let Some(fact) = op.key().fact() {
                changes.push(GraphChange { fact, kind });
            }
        }

        let job = EventBatch::new(tx.id);
        Ok(match origin {
            Some(origin) => job.with_graph_changes(origin, changes),
            None => job,
        })
    }

    /// True if the document was visible at the transaction's valid time
    /// before the transaction committed.
    fn existed_before(&self, tx: &CommittedTransaction, key: &DocumentKey) -> GraphResult<bool> {
        let history = self.store.history(key)?;
        Ok(history
            .into_iter()
            .filter(|v| v.tx_id < tx.id && v.valid.from <= tx.valid_time)
            .max_by_key(|v| (v.valid.from, v.tx_id))
            .is_some_and(|v| v.document.is_some()))
    }

    pub(crate) fn deferred(&self) -> GraphResult<Vec<TransactionId>> {
        Ok(self.unfinished()?.into_iter().map(|(tx, _)| tx.id).collect())
    }
}

// Id sets and a counter stay consistent under any panic, so a poisoned lock
// is still usable.
fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// The graph engine.
///
/// # Example
///
/// ```
/// use std::sync::Arc;
/// use std::time::Duration;
///
/// use chrono::Utc;
/// use scangraph::{
///     EngineConfig, GraphEngine, InMemoryGraphStore, InMemoryQueue, Object, OriginId, OriginPayload, ScanLevel,
/// };
///
/// let engine = GraphEngine::new(
///     Arc::new(InMemoryGraphStore::new()),
///     Arc::new(InMemoryQueue::new()),
///     EngineConfig::default(),
/// )
/// .unwrap();
///
/// let host = Object::new("Hostname", &["internet", "example.com"]).unwrap();
/// let reference = host.reference().clone();
/// let payload = OriginPayload::declaration(OriginId::new("user"), Utc::now())
///     .with_object(host)
///     .with_declared_level(reference.clone(), ScanLevel::new(2));
///
/// let result = engine.ingest(&payload).unwrap();
/// let tx = result.transaction_id.unwrap();
/// assert!(engine.await_flush(tx, Duration::from_secs(5)));
/// assert_eq!(engine.effective_level(&reference).unwrap(), ScanLevel::new(2));
/// ```
pub struct GraphEngine {
    core: Arc<Core>,
    config: EngineConfig,
    worker: Option<Worker>,
}

impl std::fmt::Debug for GraphEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GraphEngine")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl GraphEngine {
    /// Creates an engine and starts its background worker.
    ///
    /// # Errors
    ///
    /// Returns `GraphError::Config` for an invalid configuration and
    /// `GraphError::Internal` if the worker thread cannot be spawned.
    pub fn new(store: Arc<dyn GraphStore>, queue: Arc<dyn QueueClient>, config: EngineConfig) -> GraphResult<Self> {
        config.validate()?;

        let core = Arc::new(Core {
            reconciler: OriginReconciler::new(Arc::clone(&store), config.levels.clone(), config.reconcile.clone()),
            propagator: ScanProfilePropagator::new(
                Arc::clone(&store),
                config.levels.clone(),
                config.propagation.clone(),
            ),
            publisher: EventPublisher::new(queue, Arc::clone(&store), config.publisher.clone()),
            barrier: SyncBarrier::new(),
            levels: config.levels.clone(),
            claimed: Mutex::new(BTreeSet::new()),
            recovered: Mutex::new(1),
            store,
        });
        let worker = Worker::start(Arc::clone(&core), config.worker.queue_capacity)?;

        Ok(Self {
            core,
            config,
            worker: Some(worker),
        })
    }

    /// Returns the engine configuration.
    #[must_use]
    pub const fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Returns the underlying store.
    #[must_use]
    pub fn store(&self) -> &Arc<dyn GraphStore> {
        &self.core.store
    }

    /// Reconciles one origin run and queues its post-commit work.
    ///
    /// Blocks while the worker queue is full.
    ///
    /// # Errors
    ///
    /// See [`OriginReconciler::reconcile`].
    pub fn ingest(&self, payload: &OriginPayload) -> GraphResult<TransactionResult> {
        let ticket = self.core.barrier.begin();
        let result = self.core.reconciler.reconcile(payload)?;
        if let Some(job) = job_for(&result) {
            ticket.commit(job.transaction_id);
            self.enqueue(job);
        }
        Ok(result)
    }

    /// Parses an ingestion payload and reconciles it.
    ///
    /// # Errors
    ///
    /// Returns `ValidationError::MalformedPayload` for bad JSON, otherwise as
    /// [`GraphEngine::ingest`].
    pub fn ingest_json(&self, json: &str) -> GraphResult<TransactionResult> {
        let payload = OriginPayload::from_json(json)?;
        self.ingest(&payload)
    }

    /// Retracts everything an origin owns and forgets the origin.
    ///
    /// # Errors
    ///
    /// See [`OriginReconciler::retire`].
    pub fn retire_origin(&self, origin: &OriginId, valid_time: DateTime<Utc>) -> GraphResult<TransactionResult> {
        let ticket = self.core.barrier.begin();
        let result = self.core.reconciler.retire(origin, valid_time)?;
        if let Some(job) = job_for(&result) {
            ticket.commit(job.transaction_id);
            self.enqueue(job);
        }
        Ok(result)
    }

    /// Waits until every transaction up to `min_transaction_id` is committed,
    /// propagated and published. Returns false on timeout.
    #[must_use]
    pub fn await_flush(&self, min_transaction_id: TransactionId, timeout: Duration) -> bool {
        self.core
            .barrier
            .await_flush(self.core.store.as_ref(), min_transaction_id, timeout)
    }

    /// Runs one recalculation pass on the calling thread.
    ///
    /// # Errors
    ///
    /// Returns store errors from the full propagation pass and
    /// `GraphError::PublishFailure` if its deltas could not be published.
    pub fn recalculate(&self) -> GraphResult<RecalculationReport> {
        recalculation::run_pass(&self.core)
    }

    /// Starts a thread running [`GraphEngine::recalculate`] every
    /// configured interval until the handle is stopped or dropped.
    ///
    /// # Errors
    ///
    /// Returns `GraphError::Internal` if the thread cannot be spawned.
    pub fn start_recalculation(&self) -> GraphResult<RecalculationHandle> {
        RecalculationHandle::start(Arc::clone(&self.core), self.config.recalculation.interval())
    }

    /// Object at the current time.
    ///
    /// # Errors
    ///
    /// Propagates store errors.
    pub fn object(&self, reference: &Reference) -> GraphResult<Option<Object>> {
        self.object_at(reference, Utc::now())
    }

    /// Object as of `at`.
    ///
    /// # Errors
    ///
    /// Propagates store errors.
    pub fn object_at(&self, reference: &Reference, at: DateTime<Utc>) -> GraphResult<Option<Object>> {
        let doc = self.core.store.get(at, &DocumentKey::Object(reference.clone()))?;
        Ok(doc.and_then(|d| d.as_object().cloned()))
    }

    /// Current scan profile of an object.
    ///
    /// # Errors
    ///
    /// Propagates store errors.
    pub fn scan_profile(&self, reference: &Reference) -> GraphResult<Option<ScanProfile>> {
        self.scan_profile_at(reference, Utc::now())
    }

    /// Scan profile of an object as of `at`.
    ///
    /// None if the object does not exist then. An object whose profile has
    /// not been written yet reads as an empty profile at the default level.
    ///
    /// # Errors
    ///
    /// Propagates store errors.
    pub fn scan_profile_at(&self, reference: &Reference, at: DateTime<Utc>) -> GraphResult<Option<ScanProfile>> {
        if self.object_at(reference, at)?.is_none() {
            return Ok(None);
        }
        let stored = self.core.store.get(at, &DocumentKey::Profile(reference.clone()))?;
        Ok(Some(stored.and_then(|d| d.as_profile().cloned()).unwrap_or_else(|| {
            ScanProfile::Empty {
                reference: reference.clone(),
                level: self.core.levels.default,
            }
        })))
    }

    /// Current effective level; the default level for unknown objects.
    ///
    /// # Errors
    ///
    /// Propagates store errors.
    pub fn effective_level(&self, reference: &Reference) -> GraphResult<ScanLevel> {
        Ok(self
            .scan_profile(reference)?
            .map_or(self.core.levels.default, |p| p.level()))
    }

    /// Transactions committed but not yet flushed.
    #[must_use]
    pub fn unflushed(&self) -> Vec<TransactionId> {
        self.core.barrier.pending()
    }

    /// Transactions whose events wait in the store's outbox after publish failures.
    ///
    /// # Errors
    ///
    /// Propagates store errors.
    pub fn unpublished(&self) -> GraphResult<Vec<TransactionId>> {
        self.core.publisher.pending()
    }

    /// Committed graph transactions in the store whose propagation has not
    /// finished and that no flush is working on. Includes transactions
    /// committed by an earlier engine on the same store.
    ///
    /// # Errors
    ///
    /// Propagates store errors.
    pub fn deferred(&self) -> GraphResult<Vec<TransactionId>> {
        self.core.deferred()
    }

    fn enqueue(&self, job: FlushJob) {
        let Some(worker) = &self.worker else {
            tracing::warn!(tx = %job.transaction_id, "no worker, transaction deferred to recalculation");
            return;
        };
        if let Err(job) = worker.submit(job) {
            tracing::warn!(tx = %job.transaction_id, "worker stopped, transaction deferred to recalculation");
        }
    }
}

impl Drop for GraphEngine {
    fn drop(&mut self) {
        if let Some(worker) = self.worker.take() {
            worker.shutdown();
        }
    }
}
