//! Periodic recalculation.
//!
//! A pass first retries whatever the incremental path left behind in the
//! store: batches parked in the outbox, then graph transactions whose
//! propagation never finished, including those of an engine that stopped.
//! It then recomputes every profile from scratch, which repairs drift from
//! partial propagation.

use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use chrono::Utc;
use crossbeam_channel::{bounded, RecvTimeoutError, Sender};

use crate::error::{GraphError, GraphResult};
use crate::events::EventBatch;
use crate::propagation::PropagationReport;
use crate::storage::TransactionId;

use super::Core;

/// Outcome of one recalculation pass.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecalculationReport {
    /// Parked transactions whose events went out in this pass.
    pub republished: Vec<TransactionId>,
    /// Unfinished transactions handed back to the flush path.
    pub retried: Vec<TransactionId>,
    /// The full propagation pass.
    pub full: PropagationReport,
}

pub(super) fn run_pass(core: &Core) -> GraphResult<RecalculationReport> {
    let republished = core.publisher.republish_pending()?;
    for id in &republished {
        core.barrier.complete(*id);
    }

    let mut retried = Vec::new();
    for (tx, state) in core.unfinished()? {
        let job = core.recover(&tx, state)?;
        retried.push(job.transaction_id);
        core.flush(job);
    }

    let full = core.propagator.propagate_all(Utc::now())?;
    if full.partial || !full.deltas.is_empty() {
        tracing::info!(deltas = full.deltas.len(), "recalculation corrected scan profiles");
    }
    if let Some(tx) = full.event_transaction() {
        let batch = EventBatch::new(tx).with_profile_deltas(full.deltas.clone());
        core.publisher.publish(batch)?;
    }

    tracing::debug!(
        republished = republished.len(),
        retried = retried.len(),
        "recalculation pass finished"
    );
    Ok(RecalculationReport {
        republished,
        retried,
        full,
    })
}

/// Runs recalculation passes on a background thread.
///
/// Dropping the handle stops the thread and waits for the current pass.
#[derive(Debug)]
pub struct RecalculationHandle {
    stop: Option<Sender<()>>,
    handle: Option<JoinHandle<()>>,
}

impl RecalculationHandle {
    pub(super) fn start(core: Arc<Core>, interval: Duration) -> GraphResult<Self> {
        let (stop_tx, stop_rx) = bounded::<()>(1);
        let handle = thread::Builder::new()
            .name("scangraph-recalculation".to_string())
            .spawn(move || loop {
                match stop_rx.recv_timeout(interval) {
                    Err(RecvTimeoutError::Timeout) => {
                        if let Err(e) = run_pass(&core) {
                            tracing::warn!(error = %e, "recalculation pass failed");
                        }
                    }
                    Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
                }
            })
            .map_err(|e| GraphError::internal(format!("failed to spawn recalculation thread: {e}")))?;

        Ok(Self {
            stop: Some(stop_tx),
            handle: Some(handle),
        })
    }

    /// Stops the thread and waits for it to exit.
    pub fn stop(mut self) {
        self.shutdown();
    }

    fn shutdown(&mut self) {
        if let Some(stop) = self.stop.take() {
            let _ = stop.try_send(());
        }
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                tracing::error!("recalculation thread panicked");
            }
        }
    }
}

impl Drop for RecalculationHandle {
    fn drop(&mut self) {
        self.shutdown();
    }
}
