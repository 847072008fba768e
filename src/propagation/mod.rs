//! Scan profile propagation.
//!
//! After every committed graph transaction the propagator recomputes the
//! effective scan profile of each object the transaction can have affected
//! and writes the results back to the store.
//!
//! The affected region is the transaction's dirty objects plus everything
//! downstream of them within `max_depth` hops. Levels are relaxed from every
//! declared object upstream of the region over a hop-bounded worklist. When the region or
//! its upstream search outgrows the node budget the propagator falls back to
//! a one-hop recomputation from neighbours' stored levels and flags the
//! report as partial; the periodic full pass repairs whatever that misses.
//!
//! A transaction's writes stay visible until the next version of each
//! document, so the region is recomputed at the trigger's valid time and
//! again at every later valid time at which a document it reads changes.
//! Each of those valid times is written in its own store transaction.

mod relax;
mod view;

use std::collections::btree_map::Entry;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};

use crate::config::{LevelConfig, PropagationConfig};
use crate::error::{GraphError, GraphResult};
use crate::events::{outbox, EventBatch};
use crate::graph::Reference;
use crate::scan_profile::{DeltaKind, Inheritance, ProfileDelta, ScanLevel, ScanProfile};
use crate::storage::{
    CommittedTransaction, Document, DocumentKey, GraphStore, StorageError, Transaction, TransactionId,
};

use relax::{closure, relax, Bounds};
use view::GraphView;

type Inherited = HashMap<Reference, (ScanLevel, Vec<Inheritance>)>;

/// Outcome of one propagation pass.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PropagationReport {
    /// Graph transaction that triggered the pass; None for a full pass.
    pub transaction_id: Option<TransactionId>,
    /// Valid time the pass read and wrote at.
    pub valid_time: DateTime<Utc>,
    /// Later valid times the triggering transaction was recomputed at.
    pub later_valid_times: Vec<DateTime<Utc>>,
    /// Level changes, one per object, ordered by object reference.
    pub deltas: Vec<ProfileDelta>,
    /// True when the node budget forced the one-hop fallback.
    pub partial: bool,
    /// Last transaction the pass wrote, if it wrote anything.
    pub profile_transaction: Option<TransactionId>,
}

impl PropagationReport {
    fn empty(transaction_id: Option<TransactionId>, valid_time: DateTime<Utc>) -> Self {
        Self {
            transaction_id,
            valid_time,
            later_valid_times: Vec::new(),
            deltas: Vec::new(),
            partial: false,
            profile_transaction: None,
        }
    }

    /// Transaction id downstream events are keyed by.
    #[must_use]
    pub fn event_transaction(&self) -> Option<TransactionId> {
        self.transaction_id.or(self.profile_transaction)
    }
}

/// Region recomputed at one valid time.
struct Recomputed {
    targets: BTreeSet<Reference>,
    inherited: Inherited,
    /// Every node read; later versions of these can change the outcome.
    reach: BTreeSet<Reference>,
    partial: bool,
}

/// Keeps stored scan profiles consistent with the graph.
pub struct ScanProfilePropagator {
    store: Arc<dyn GraphStore>,
    levels: LevelConfig,
    config: PropagationConfig,
    /// Serializes profile writes between the worker and the recalculation pass.
    write_lock: Mutex<()>,
}

impl std::fmt::Debug for ScanProfilePropagator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ScanProfilePropagator")
            .field("levels", &self.levels)
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl ScanProfilePropagator {
    #[allow(missing_docs)]
    pub fn new(store: Arc<dyn GraphStore>, levels: LevelConfig, config: PropagationConfig) -> Self {
        Self {
            store,
            levels,
            config,
            write_lock: Mutex::new(()),
        }
    }

    /// Objects whose profile a committed transaction may have changed:
    /// put or deleted objects and declarations, and both endpoints of put or
    /// deleted edges. Ledger, profile and outbox writes dirty nothing.
    #[must_use]
    pub fn dirty_set(tx: &CommittedTransaction) -> BTreeSet<Reference> {
        let mut dirty = BTreeSet::new();
        for op in tx.operations.iter().filter(|op| op.is_write()) {
            match op.key() {
                DocumentKey::Object(r) | DocumentKey::Declaration(r) => {
                    dirty.insert(r);
                }
                DocumentKey::Edge(k) => {
                    dirty.insert(k.source);
                    dirty.insert(k.target);
                }
                DocumentKey::Origin(_) | DocumentKey::Profile(_) | DocumentKey::Outbox(_) => {}
            }
        }
        dirty
    }

    /// Recomputes profiles affected by a committed graph transaction.
    ///
    /// # Errors
    ///
    /// Returns `GraphError::Internal` for an unknown transaction id and store
    /// errors once retries are exhausted.
    pub fn propagate(&self, transaction_id: TransactionId) -> GraphResult<PropagationReport> {
        self.run(&EventBatch::new(transaction_id), false)
    }

    /// Like [`ScanProfilePropagator::propagate`], recording the events in the
    /// store's outbox alongside the profile writes.
    ///
    /// `seed` carries the transaction's graph changes and any profile deltas
    /// an interrupted earlier run recorded; the report's deltas include them.
    /// Every profile write also stores the batch so far, marked propagated on
    /// the last valid time.
    ///
    /// # Errors
    ///
    /// As [`ScanProfilePropagator::propagate`].
    pub fn propagate_recorded(&self, seed: &EventBatch) -> GraphResult<PropagationReport> {
        self.run(seed, true)
    }

    fn run(&self, seed: &EventBatch, record: bool) -> GraphResult<PropagationReport> {
        let _guard = self
            .write_lock
            .lock()
            .map_err(|_| GraphError::internal("propagation lock poisoned"))?;

        let transaction_id = seed.transaction_id;
        let committed = self
            .store
            .transaction(transaction_id)?
            .ok_or_else(|| GraphError::internal(format!("unknown transaction {transaction_id}")))?;
        let at = committed.valid_time;
        let dirty = Self::dirty_set(&committed);

        let mut report = PropagationReport::empty(Some(transaction_id), at);
        let mut deltas = BTreeMap::new();
        fold(&mut deltas, seed.profile_deltas.clone());

        let mut checkpoints = BTreeSet::from([at]);
        let mut watched = BTreeSet::new();
        while let Some(checkpoint) = checkpoints.pop_first() {
            let mut view = GraphView::new(&*self.store, checkpoint, &self.config);
            let region = self.recompute(&mut view, &dirty, transaction_id)?;
            report.partial |= region.partial;

            let fresh: BTreeSet<Reference> = region.reach.difference(&watched).cloned().collect();
            if !fresh.is_empty() {
                checkpoints.extend(self.store.valid_times_after(checkpoint, &fresh)?);
                watched.extend(fresh);
            }

            let (mut tx, found) = self.settle(&mut view, &region.targets, &region.inherited)?;
            fold(&mut deltas, found);
            if record {
                let batch = seed.clone().with_profile_deltas(deltas.values().cloned().collect());
                outbox::record(&mut tx, &batch, checkpoints.is_empty());
            }
            if checkpoint > at {
                report.later_valid_times.push(checkpoint);
            }
            if let Some(id) = self.write(tx)? {
                report.profile_transaction = Some(id);
            }
        }

        if !report.later_valid_times.is_empty() {
            tracing::debug!(
                tx = %transaction_id,
                later = report.later_valid_times.len(),
                "recomputed at later valid times"
            );
        }
        report.deltas = deltas.into_values().collect();
        Ok(report)
    }

    fn recompute(
        &self,
        view: &mut GraphView<'_>,
        dirty: &BTreeSet<Reference>,
        transaction_id: TransactionId,
    ) -> GraphResult<Recomputed> {
        if let Some(region) = self.incremental(view, dirty)? {
            return Ok(region);
        }
        tracing::warn!(
            tx = %transaction_id,
            dirty = dirty.len(),
            budget = self.config.node_budget,
            "partial propagation: node budget exceeded, recomputing one hop from stored levels"
        );
        self.one_hop(view, dirty)
    }

    /// Recomputes every profile in the graph at `valid_time`.
    ///
    /// # Errors
    ///
    /// Propagates store errors once retries are exhausted.
    pub fn propagate_all(&self, valid_time: DateTime<Utc>) -> GraphResult<PropagationReport> {
        let _guard = self
            .write_lock
            .lock()
            .map_err(|_| GraphError::internal("propagation lock poisoned"))?;

        let mut view = GraphView::load_all(&*self.store, valid_time, &self.config)?;
        let targets = view.known_nodes();
        let sources = view.declared_nodes();
        let fronts = relax(&mut view, &sources, None, self.bounds())?;
        tracing::debug!(nodes = targets.len(), sources = sources.len(), reached = fronts.len(), "full propagation");

        let inherited: Inherited = targets
            .iter()
            .filter_map(|n| fronts.best(n).map(|best| (n.clone(), best)))
            .collect();
        let (tx, deltas) = self.settle(&mut view, &targets, &inherited)?;

        let mut report = PropagationReport::empty(None, valid_time);
        report.deltas = deltas;
        report.profile_transaction = self.write(tx)?;
        Ok(report)
    }

    const fn bounds(&self) -> Bounds {
        Bounds {
            max_depth: self.config.max_depth,
            default_level: self.levels.default,
        }
    }

    /// Region and inherited levels, or None when the node budget is exceeded.
    fn incremental(&self, view: &mut GraphView<'_>, dirty: &BTreeSet<Reference>) -> GraphResult<Option<Recomputed>> {
        let depth = self.config.max_depth;
        let budget = self.config.node_budget;

        let Some(region) = closure(view, dirty, depth, true, budget)? else {
            return Ok(None);
        };
        let region: BTreeSet<Reference> = region.into_iter().collect();
        let Some(search) = closure(view, &region, depth, false, budget)? else {
            return Ok(None);
        };

        let mut ordered: Vec<&Reference> = search.iter().collect();
        ordered.sort();
        let mut sources = Vec::new();
        for node in ordered {
            if let Some(level) = view.declared(node)? {
                sources.push((node.clone(), level));
            }
        }

        let fronts = relax(view, &sources, Some(&search), self.bounds())?;
        tracing::debug!(
            dirty = dirty.len(),
            region = region.len(),
            searched = search.len(),
            sources = sources.len(),
            "incremental propagation"
        );

        let inherited = region
            .iter()
            .filter_map(|n| fronts.best(n).map(|best| (n.clone(), best)))
            .collect();
        Ok(Some(Recomputed {
            targets: region,
            inherited,
            reach: search.into_iter().collect(),
            partial: false,
        }))
    }

    /// Dirty nodes plus one downstream hop, inheriting from neighbours' stored profiles.
    fn one_hop(&self, view: &mut GraphView<'_>, dirty: &BTreeSet<Reference>) -> GraphResult<Recomputed> {
        let mut targets = dirty.clone();
        for node in dirty {
            targets.extend(view.downstream(node)?.into_iter().map(|hop| hop.node));
        }

        let mut reach = targets.clone();
        let mut inherited = Inherited::new();
        for node in &targets {
            let mut candidates = Vec::new();
            for hop in view.upstream(node)? {
                reach.insert(hop.node.clone());
                let Some(stored) = view.profile(&hop.node)? else { continue };
                let Some((source, depth)) = stored_origin(&stored) else { continue };
                let level = hop.carry(stored.level());
                if level > self.levels.default && depth < self.config.max_depth {
                    candidates.push(Inheritance {
                        parent: hop.node,
                        source,
                        level,
                        depth: depth + 1,
                    });
                }
            }
            if let Some(best) = candidates.iter().map(|c| c.level).max() {
                candidates.retain(|c| c.level == best);
                candidates.sort();
                inherited.insert(node.clone(), (best, candidates));
            }
        }
        Ok(Recomputed {
            targets,
            inherited,
            reach,
            partial: true,
        })
    }

    fn desired(&self, view: &mut GraphView<'_>, node: &Reference, inherited: &Inherited) -> GraphResult<ScanProfile> {
        if let Some(level) = view.declared(node)? {
            return Ok(ScanProfile::Declared {
                reference: node.clone(),
                level,
            });
        }
        Ok(match inherited.get(node) {
            Some((level, inheritances)) if *level > self.levels.default => ScanProfile::Inherited {
                reference: node.clone(),
                level: *level,
                inheritances: inheritances.clone(),
            },
            _ => ScanProfile::Empty {
                reference: node.clone(),
                level: self.levels.default,
            },
        })
    }

    /// Profile writes and deltas bringing `targets` to their desired profiles.
    fn settle(
        &self,
        view: &mut GraphView<'_>,
        targets: &BTreeSet<Reference>,
        inherited: &Inherited,
    ) -> GraphResult<(Transaction, Vec<ProfileDelta>)> {
        let mut tx = Transaction::new(view.valid_time());
        let mut deltas = Vec::new();

        for node in targets {
            let stored = view.profile(node)?;

            if !view.exists(node)? {
                if let Some(old) = stored {
                    tx.delete(DocumentKey::Profile(node.clone()));
                    deltas.push(ProfileDelta {
                        reference: node.clone(),
                        old_level: Some(old.level()),
                        new_level: self.levels.default,
                        kind: DeltaKind::Retracted,
                    });
                }
                continue;
            }

            let desired = self.desired(view, node, inherited)?;
            match stored {
                None => deltas.push(ProfileDelta {
                    reference: node.clone(),
                    old_level: None,
                    new_level: desired.level(),
                    kind: DeltaKind::Created,
                }),
                Some(old) if old == desired => continue,
                Some(old) => {
                    if old.level() != desired.level() {
                        deltas.push(ProfileDelta {
                            reference: node.clone(),
                            old_level: Some(old.level()),
                            new_level: desired.level(),
                            kind: if desired.is_declared() {
                                DeltaKind::Declared
                            } else {
                                DeltaKind::Inherited
                            },
                        });
                    }
                }
            }
            tx.put(Document::Profile(desired));
        }

        Ok((tx, deltas))
    }

    /// Submits profile writes with retries; None when there is nothing to write.
    fn write(&self, tx: Transaction) -> GraphResult<Option<TransactionId>> {
        if tx.is_empty() {
            return Ok(None);
        }
        let at = tx.valid_time;
        let writes = tx.operations.len();
        let (result, attempts) = self.config.retry.run(
            || self.store.submit(tx.clone()),
            StorageError::is_retryable,
            |attempt, e| tracing::warn!(attempt, error = %e, "profile write failed, retrying"),
        );
        let id = match result {
            Ok(id) => id,
            Err(StorageError::Unavailable(message)) => return Err(GraphError::StoreUnavailable { attempts, message }),
            Err(e) => return Err(e.into()),
        };
        tracing::debug!(profile_tx = %id, valid_time = %at, writes, "profiles written");
        Ok(Some(id))
    }
}

/// Merges deltas of a later valid time into one delta per object.
///
/// The first old level and the last new level survive. A creation stays a
/// creation unless the object is later retracted.
fn fold(into: &mut BTreeMap<Reference, ProfileDelta>, later: Vec<ProfileDelta>) {
    for delta in later {
        match into.entry(delta.reference.clone()) {
            Entry::Vacant(slot) => {
                slot.insert(delta);
            }
            Entry::Occupied(mut slot) => {
                let merged = slot.get_mut();
                if merged.kind != DeltaKind::Created || delta.kind == DeltaKind::Retracted {
                    merged.kind = delta.kind;
                }
                merged.new_level = delta.new_level;
            }
        }
    }
}

/// Declared source and hop depth a stored profile carries its level from.
fn stored_origin(profile: &ScanProfile) -> Option<(Reference, u32)> {
    match profile {
        ScanProfile::Empty { .. } => None,
        ScanProfile::Declared { reference, .. } => Some((reference.clone(), 0)),
        ScanProfile::Inherited { inheritances, .. } => inheritances
            .iter()
            .min_by_key(|i| i.depth)
            .map(|i| (i.source.clone(), i.depth)),
    }
}
