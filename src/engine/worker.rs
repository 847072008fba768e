//! Background worker draining post-commit jobs in commit order.

use std::sync::Arc;
use std::thread::{self, JoinHandle};

use crossbeam_channel::{bounded, Receiver, Sender};

use crate::error::{GraphError, GraphResult};

use super::{Core, FlushJob};

pub(super) struct Worker {
    tx: Sender<FlushJob>,
    handle: JoinHandle<()>,
}

impl Worker {
    pub(super) fn start(core: Arc<Core>, queue_capacity: usize) -> GraphResult<Self> {
        let (tx, rx) = bounded::<FlushJob>(queue_capacity.max(1));
        let handle = thread::Builder::new()
            .name("scangraph-flush".to_string())
            .spawn(move || run(&core, &rx))
            .map_err(|e| GraphError::internal(format!("failed to spawn flush worker: {e}")))?;
        Ok(Self { tx, handle })
    }

    /// Queues a job, blocking while the queue is full. Hands the job back if
    /// the worker has exited.
    pub(super) fn submit(&self, job: FlushJob) -> Result<(), FlushJob> {
        self.tx.send(job).map_err(|e| e.into_inner())
    }

    pub(super) fn shutdown(self) {
        // Close the channel: the worker drains queued jobs then exits.
        drop(self.tx);
        if self.handle.join().is_err() {
            tracing::error!("flush worker panicked");
        }
    }
}

fn run(core: &Core, rx: &Receiver<FlushJob>) {
    tracing::debug!("flush worker started");
    while let Ok(job) = rx.recv() {
        core.flush(job);
    }
    tracing::debug!("flush worker stopped");
}
