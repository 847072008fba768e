//! Origin reconciliation.
//!
//! An origin's run is the complete list of facts it currently asserts. The
//! reconciler diffs that list against the origin's previous run and turns
//! the difference into one atomic store transaction:
//!
//! 1. facts that are new, or whose stored content differs, are put
//! 2. facts the origin no longer asserts are retracted, unless another live
//!    origin still asserts them
//! 3. the ledger record is replaced, guarded by a match on the old record
//!
//! Nothing is written when the run changes nothing.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::config::{CascadePolicy, LevelConfig, ReconcileConfig};
use crate::error::{GraphError, GraphResult, ValidationError};
use crate::graph::{FactId, Reference};
use crate::ledger::OriginLedger;
use crate::origin::{OriginId, OriginPayload, OriginRecord};
use crate::storage::{Document, DocumentKey, GraphStore, QueryPattern, StorageError, Transaction, TransactionId};

/// How a fact changed in a transaction.
#[allow(missing_docs)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeKind {
    Created,
    /// Re-asserted with different content, or restored after going missing.
    Updated,
    Retracted,
}

/// One fact-level change in a committed transaction.
#[allow(missing_docs)]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GraphChange {
    pub fact: FactId,
    pub kind: ChangeKind,
}

/// Outcome of a reconcile or retire call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransactionResult {
    /// None when the run changed nothing and no transaction was submitted.
    pub transaction_id: Option<TransactionId>,
    #[allow(missing_docs)]
    pub origin: OriginId,
    #[allow(missing_docs)]
    pub valid_time: DateTime<Utc>,
    #[allow(missing_docs)]
    pub changes: Vec<GraphChange>,
    /// Facts dropped by this origin but kept because another origin asserts them.
    pub shared: Vec<FactId>,
}

impl TransactionResult {
    /// Returns true if nothing was submitted.
    #[must_use]
    pub const fn is_noop(&self) -> bool {
        self.transaction_id.is_none()
    }

    /// Number of changes of the given kind.
    #[must_use]
    pub fn count(&self, kind: ChangeKind) -> usize {
        self.changes.iter().filter(|c| c.kind == kind).count()
    }
}

struct Plan {
    tx: Transaction,
    changes: Vec<GraphChange>,
    shared: Vec<FactId>,
}

impl Plan {
    fn new(valid_time: DateTime<Utc>) -> Self {
        Self {
            tx: Transaction::new(valid_time),
            changes: Vec::new(),
            shared: Vec::new(),
        }
    }

    fn record(&mut self, fact: FactId, kind: ChangeKind) {
        self.changes.push(GraphChange { fact, kind });
    }

    fn writes(&self, key: &DocumentKey) -> bool {
        self.tx
            .operations
            .iter()
            .any(|op| op.is_write() && &op.key() == key)
    }
}

/// Diffs origin runs and commits the result atomically.
pub struct OriginReconciler {
    store: Arc<dyn GraphStore>,
    ledger: OriginLedger,
    levels: LevelConfig,
    config: ReconcileConfig,
    origin_locks: Mutex<HashMap<OriginId, Arc<Mutex<()>>>>,
}

impl std::fmt::Debug for OriginReconciler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OriginReconciler")
            .field("levels", &self.levels)
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl OriginReconciler {
    #[allow(missing_docs)]
    pub fn new(store: Arc<dyn GraphStore>, levels: LevelConfig, config: ReconcileConfig) -> Self {
        Self {
            ledger: OriginLedger::new(Arc::clone(&store)),
            store,
            levels,
            config,
            origin_locks: Mutex::new(HashMap::new()),
        }
    }

    #[allow(missing_docs)]
    #[must_use]
    pub const fn ledger(&self) -> &OriginLedger {
        &self.ledger
    }

    /// Reconciles one complete run of an origin.
    ///
    /// # Errors
    ///
    /// - `GraphError::Validation` for a malformed payload
    /// - `GraphError::StaleOrigin` if the origin already reported a later valid time
    /// - `GraphError::DependencyMissing` for an edge or declaration on an absent object
    /// - `GraphError::StoreUnavailable` once retries are exhausted
    /// - `GraphError::ConcurrentModification` if the ledger kept changing underneath
    pub fn reconcile(&self, payload: &OriginPayload) -> GraphResult<TransactionResult> {
        payload.validate(self.levels.max)?;

        let lock = self.origin_lock(&payload.origin)?;
        let _guard = lock
            .lock()
            .map_err(|_| GraphError::internal(format!("origin lock poisoned: {}", payload.origin)))?;

        self.commit_with_retry(&payload.origin, payload.valid_time, || self.plan_run(payload))
    }

    /// Retracts everything the origin owns and removes its ledger record.
    ///
    /// Retiring an unknown origin is a no-op.
    ///
    /// # Errors
    ///
    /// Same as [`OriginReconciler::reconcile`], minus dependency checks.
    pub fn retire(&self, origin: &OriginId, valid_time: DateTime<Utc>) -> GraphResult<TransactionResult> {
        if origin.is_empty() {
            return Err(ValidationError::EmptyOriginId.into());
        }

        let lock = self.origin_lock(origin)?;
        let _guard = lock
            .lock()
            .map_err(|_| GraphError::internal(format!("origin lock poisoned: {origin}")))?;

        self.commit_with_retry(origin, valid_time, || self.plan_retire(origin, valid_time))
    }

    fn origin_lock(&self, origin: &OriginId) -> GraphResult<Arc<Mutex<()>>> {
        let mut locks = self
            .origin_locks
            .lock()
            .map_err(|_| GraphError::internal("origin lock table poisoned"))?;
        Ok(Arc::clone(locks.entry(origin.clone()).or_default()))
    }

    fn commit_with_retry<F>(
        &self,
        origin: &OriginId,
        valid_time: DateTime<Utc>,
        plan: F,
    ) -> GraphResult<TransactionResult>
    where
        F: Fn() -> GraphResult<Option<Plan>>,
    {
        let (result, attempts) = self.config.retry.run(
            || {
                let Some(plan) = plan()? else {
                    return Ok(TransactionResult {
                        transaction_id: None,
                        origin: origin.clone(),
                        valid_time,
                        changes: Vec::new(),
                        shared: Vec::new(),
                    });
                };
                self.submit(origin, plan)
            },
            |e| {
                matches!(
                    e,
                    GraphError::StoreUnavailable { .. } | GraphError::ConcurrentModification { .. }
                )
            },
            |attempt, e| tracing::warn!(origin = %origin, attempt, error = %e, "reconcile attempt failed, retrying"),
        );

        match result {
            Err(GraphError::StoreUnavailable { message, .. }) => Err(GraphError::StoreUnavailable { attempts, message }),
            Err(GraphError::ConcurrentModification { origin, .. }) => {
                Err(GraphError::ConcurrentModification { origin, attempts })
            }
            other => other,
        }
    }

    fn submit(&self, origin: &OriginId, plan: Plan) -> GraphResult<TransactionResult> {
        let valid_time = plan.tx.valid_time;
        let id = match self.store.submit(plan.tx) {
            Ok(id) => id,
            Err(StorageError::MatchFailed(key)) => {
                tracing::debug!(origin = %origin, key = %key, "ledger guard failed");
                return Err(GraphError::ConcurrentModification {
                    origin: origin.clone(),
                    attempts: 1,
                });
            }
            Err(e) => return Err(e.into()),
        };

        let result = TransactionResult {
            transaction_id: Some(id),
            origin: origin.clone(),
            valid_time,
            changes: plan.changes,
            shared: plan.shared,
        };
        tracing::info!(
            origin = %origin,
            tx = %id,
            created = result.count(ChangeKind::Created),
            updated = result.count(ChangeKind::Updated),
            retracted = result.count(ChangeKind::Retracted),
            shared = result.shared.len(),
            "origin reconciled"
        );
        Ok(result)
    }

    fn check_not_stale(&self, origin: &OriginId, submitted: DateTime<Utc>) -> GraphResult<()> {
        if let Some(recorded) = self.ledger.last_seen(origin)? {
            if submitted < recorded {
                return Err(GraphError::StaleOrigin {
                    origin: origin.clone(),
                    submitted,
                    recorded,
                });
            }
        }
        Ok(())
    }

    fn plan_run(&self, payload: &OriginPayload) -> GraphResult<Option<Plan>> {
        let origin = &payload.origin;
        let at = payload.valid_time;

        self.check_not_stale(origin, at)?;
        let previous = self.ledger.get_previous(origin)?;
        if let Some(prev) = &previous {
            if prev.method != payload.method {
                return Err(ValidationError::MethodMismatch {
                    origin: origin.to_string(),
                    expected: prev.method.to_string(),
                    actual: payload.method.to_string(),
                }
                .into());
            }
        }

        let asserted = payload.asserted_documents();
        let mut plan = Plan::new(at);

        for (fact, document) in &asserted {
            self.put_if_changed(&mut plan, fact.clone(), document.clone())?;
        }

        let dropped: Vec<&FactId> = previous
            .as_ref()
            .map(|p| p.result.keys().filter(|fact| !asserted.contains_key(*fact)).collect())
            .unwrap_or_default();
        let retracted = self.plan_retractions(&mut plan, origin, dropped, &asserted)?;

        self.check_dependencies(payload, &retracted, &plan)?;

        let unchanged = previous.as_ref().map_or(asserted.is_empty(), |p| p.result == asserted);
        if plan.tx.is_empty() && unchanged {
            tracing::debug!(origin = %origin, "run changes nothing");
            return Ok(None);
        }

        let record = OriginRecord {
            id: origin.clone(),
            method: payload.method,
            valid_time: at,
            result: asserted,
            runs: previous.as_ref().map_or(1, |p| p.runs + 1),
        };
        OriginLedger::set_current(&mut plan.tx, previous.as_ref(), record);
        Ok(Some(plan))
    }

    fn plan_retire(&self, origin: &OriginId, at: DateTime<Utc>) -> GraphResult<Option<Plan>> {
        self.check_not_stale(origin, at)?;
        let Some(previous) = self.ledger.get_previous(origin)? else {
            return Ok(None);
        };

        let mut plan = Plan::new(at);
        self.plan_retractions(&mut plan, origin, previous.result.keys().collect(), &BTreeMap::new())?;
        OriginLedger::retire(&mut plan.tx, &previous);
        Ok(Some(plan))
    }

    fn put_if_changed(&self, plan: &mut Plan, fact: FactId, document: Document) -> GraphResult<()> {
        let kind = match self.store.get(plan.tx.valid_time, &document.key())? {
            None => ChangeKind::Created,
            Some(current) if current != document => ChangeKind::Updated,
            Some(_) => return Ok(()),
        };
        plan.tx.put(document);
        plan.record(fact, kind);
        Ok(())
    }

    /// Retracts `dropped` facts nobody else asserts; returns the retracted objects.
    ///
    /// A dropped fact another origin still asserts stays, with the content of
    /// the most recent surviving owner.
    fn plan_retractions(
        &self,
        plan: &mut Plan,
        origin: &OriginId,
        dropped: Vec<&FactId>,
        asserted: &BTreeMap<FactId, Document>,
    ) -> GraphResult<BTreeSet<Reference>> {
        let at = plan.tx.valid_time;
        let mut retracted_objects = BTreeSet::new();

        for fact in dropped {
            let others: Vec<OriginRecord> = self
                .ledger
                .owners(fact)?
                .into_iter()
                .filter(|record| &record.id != origin)
                .collect();
            let survivor = others
                .iter()
                .max_by(|a, b| (a.valid_time, &a.id).cmp(&(b.valid_time, &b.id)));
            if let Some(survivor) = survivor {
                tracing::debug!(origin = %origin, fact = %fact, owners = others.len(), survivor = %survivor.id, "retraction skipped, fact is shared");
                plan.shared.push(fact.clone());
                if let Some(content) = survivor.content(fact) {
                    self.put_if_changed(plan, fact.clone(), content.clone())?;
                }
                continue;
            }

            let key = DocumentKey::for_fact(fact);
            if self.store.get(at, &key)?.is_none() {
                continue;
            }
            plan.tx.delete(key);
            plan.record(fact.clone(), ChangeKind::Retracted);
            if let FactId::Object(reference) = fact {
                retracted_objects.insert(reference.clone());
            }
        }

        if self.config.cascade == CascadePolicy::RetractOrphanedEdges {
            for reference in &retracted_objects {
                for doc in self.store.query(at, &QueryPattern::EdgesTouching(reference.clone()))? {
                    let Document::Edge(edge) = doc else { continue };
                    let fact = FactId::Edge(edge.key.clone());
                    let key = DocumentKey::Edge(edge.key);
                    if asserted.contains_key(&fact) || plan.writes(&key) {
                        continue;
                    }
                    plan.tx.delete(key);
                    plan.record(fact, ChangeKind::Retracted);
                }
            }
        }

        Ok(retracted_objects)
    }

    fn check_dependencies(
        &self,
        payload: &OriginPayload,
        retracted: &BTreeSet<Reference>,
        plan: &Plan,
    ) -> GraphResult<()> {
        let in_payload: BTreeSet<&Reference> = payload.objects.iter().map(|o| &o.primary_key).collect();
        let at = plan.tx.valid_time;

        let check = |dependent: String, reference: &Reference| -> GraphResult<()> {
            if in_payload.contains(reference) {
                return Ok(());
            }
            let present = !retracted.contains(reference)
                && self
                    .store
                    .get(at, &DocumentKey::Object(reference.clone()))?
                    .is_some();
            if present {
                Ok(())
            } else {
                Err(GraphError::DependencyMissing {
                    dependent,
                    missing: reference.clone(),
                })
            }
        };

        for edge in &payload.edges {
            check(format!("edge {}", edge.key), &edge.key.source)?;
            check(format!("edge {}", edge.key), &edge.key.target)?;
        }
        for declared in &payload.scan_profiles {
            check(format!("declaration {}", declared.reference), &declared.reference)?;
        }
        Ok(())
    }
}
