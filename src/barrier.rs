//! Flush barrier between committed graph transactions and their events.
//!
//! Every graph submit takes a [`FlushTicket`] before it reaches the store.
//! Committing the ticket turns it into a pending transaction id, which stays
//! pending until its profile deltas are written and its events published.
//! [`SyncBarrier::await_flush`] waits for the store and the pending set to
//! pass a given transaction id.

use std::collections::BTreeSet;
use std::sync::{Condvar, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use crate::storage::{GraphStore, TransactionId};

const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(10);

#[derive(Debug, Default)]
struct BarrierState {
    in_flight: usize,
    pending: BTreeSet<TransactionId>,
}

impl BarrierState {
    fn settled(&self, min: TransactionId) -> bool {
        self.in_flight == 0 && self.pending.first().map_or(true, |first| *first > min)
    }
}

/// Tracks transactions between commit and flush.
#[derive(Debug)]
pub struct SyncBarrier {
    state: Mutex<BarrierState>,
    changed: Condvar,
    poll_interval: Duration,
}

impl Default for SyncBarrier {
    fn default() -> Self {
        Self::new()
    }
}

impl SyncBarrier {
    #[allow(missing_docs)]
    #[must_use]
    pub fn new() -> Self {
        Self::with_poll_interval(DEFAULT_POLL_INTERVAL)
    }

    /// Barrier that re-checks the store at least every `poll_interval`.
    #[must_use]
    pub fn with_poll_interval(poll_interval: Duration) -> Self {
        Self {
            state: Mutex::new(BarrierState::default()),
            changed: Condvar::new(),
            poll_interval,
        }
    }

    // Counters and an id set stay consistent under any panic, so a poisoned
    // lock is still usable.
    fn lock(&self) -> MutexGuard<'_, BarrierState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Registers a submit that is about to reach the store.
    pub fn begin(&self) -> FlushTicket<'_> {
        self.lock().in_flight += 1;
        FlushTicket { barrier: self, done: false }
    }

    /// Marks a pending transaction as flushed.
    pub fn complete(&self, transaction_id: TransactionId) {
        let removed = self.lock().pending.remove(&transaction_id);
        if removed {
            self.changed.notify_all();
        }
    }

    /// Transactions committed but not yet flushed, in id order.
    #[must_use]
    pub fn pending(&self) -> Vec<TransactionId> {
        self.lock().pending.iter().copied().collect()
    }

    /// Returns true if nothing at or below `min` is in flight or pending.
    #[must_use]
    pub fn is_settled(&self, min: TransactionId) -> bool {
        self.lock().settled(min)
    }

    /// Blocks until every transaction up to `min` is committed and flushed.
    ///
    /// Returns false if `timeout` elapses first. A store that fails to
    /// answer counts as not yet caught up.
    pub fn await_flush(&self, store: &dyn GraphStore, min: TransactionId, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        loop {
            let committed = match store.sync() {
                Ok(latest) => latest,
                Err(e) => {
                    tracing::debug!(error = %e, "store sync failed while awaiting flush");
                    None
                }
            };

            let state = self.lock();
            if committed >= Some(min) && state.settled(min) {
                return true;
            }

            let now = Instant::now();
            if now >= deadline {
                tracing::debug!(min = %min, pending = state.pending.len(), in_flight = state.in_flight, "await_flush timed out");
                return false;
            }
            let wait = (deadline - now).min(self.poll_interval);
            drop(
                self.changed
                    .wait_timeout(state, wait)
                    .unwrap_or_else(PoisonError::into_inner),
            );
        }
    }

    fn release(&self, committed: Option<TransactionId>) {
        let mut state = self.lock();
        state.in_flight = state.in_flight.saturating_sub(1);
        if let Some(id) = committed {
            state.pending.insert(id);
        }
        drop(state);
        self.changed.notify_all();
    }
}

/// An in-flight submit. Dropping it without [`FlushTicket::commit`] means
/// nothing was committed.
#[derive(Debug)]
#[must_use = "a ticket holds the barrier until committed or dropped"]
pub struct FlushTicket<'a> {
    barrier: &'a SyncBarrier,
    done: bool,
}

impl FlushTicket<'_> {
    /// Records the committed transaction as pending.
    pub fn commit(mut self, transaction_id: TransactionId) {
        self.done = true;
        self.barrier.release(Some(transaction_id));
    }
}

impl Drop for FlushTicket<'_> {
    fn drop(&mut self) {
        if !self.done {
            self.barrier.release(None);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::sync::Arc;
    use std::thread;

    use chrono::Utc;

    use crate::graph::Object;
    use crate::storage::{Document, InMemoryGraphStore, Transaction};

    fn commit_one(store: &InMemoryGraphStore, key: &str) -> TransactionId {
        let mut tx = Transaction::new(Utc::now());
        tx.put(Document::Object(Object::new("Hostname", &["internet", key]).unwrap()));
        store.submit(tx).unwrap()
    }

    #[test]
    fn test_flushed_once_pending_completes() {
        let store = InMemoryGraphStore::new();
        let barrier = SyncBarrier::new();

        let ticket = barrier.begin();
        let id = commit_one(&store, "a");
        ticket.commit(id);

        assert!(!barrier.await_flush(&store, id, Duration::from_millis(30)));
        barrier.complete(id);
        assert!(barrier.await_flush(&store, id, Duration::from_millis(30)));
    }

    #[test]
    fn test_waits_for_store_to_reach_min() {
        let store = InMemoryGraphStore::new();
        let barrier = SyncBarrier::new();
        assert!(!barrier.await_flush(&store, TransactionId::new(1), Duration::from_millis(20)));
        commit_one(&store, "a");
        assert!(barrier.await_flush(&store, TransactionId::new(1), Duration::from_millis(20)));
    }

    #[test]
    fn test_in_flight_ticket_blocks() {
        let store = InMemoryGraphStore::new();
        let barrier = SyncBarrier::new();
        let id = commit_one(&store, "a");

        let ticket = barrier.begin();
        assert!(!barrier.is_settled(id));
        drop(ticket);
        assert!(barrier.is_settled(id));
        assert!(barrier.pending().is_empty());
    }

    #[test]
    fn test_later_pending_does_not_block_earlier_min() {
        let store = InMemoryGraphStore::new();
        let barrier = SyncBarrier::new();
        let first = commit_one(&store, "a");
        let second = commit_one(&store, "b");
        barrier.begin().commit(second);

        assert!(barrier.await_flush(&store, first, Duration::from_millis(20)));
        assert!(!barrier.await_flush(&store, second, Duration::from_millis(20)));
    }

    #[test]
    fn test_completion_wakes_waiter() {
        let store = Arc::new(InMemoryGraphStore::new());
        let barrier = Arc::new(SyncBarrier::with_poll_interval(Duration::from_secs(1)));
        let id = commit_one(&store, "a");
        barrier.begin().commit(id);

        let waiter = {
            let store = Arc::clone(&store);
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || barrier.await_flush(store.as_ref(), id, Duration::from_secs(5)))
        };
        thread::sleep(Duration::from_millis(20));
        barrier.complete(id);
        assert!(waiter.join().unwrap());
    }
}
