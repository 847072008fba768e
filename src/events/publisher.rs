//! Publishes per-transaction delta batches with bounded retries.
//!
//! Routing: profile creation deltas go to the increment topic, every other
//! profile delta to the mutation topic, and graph changes to the graph
//! change topic when one is configured. A batch whose retries run out stays
//! in the store's outbox; [`EventPublisher::republish_pending`] retries it
//! later, from this process or a restarted one. Delivery is at-least-once: a
//! republished batch may repeat messages that already went out, with
//! identical message ids.

use std::sync::Arc;

use chrono::Utc;
use serde::{Deserialize, Serialize};

use crate::config::PublisherConfig;
use crate::error::{GraphError, GraphResult};
use crate::origin::OriginId;
use crate::reconcile::GraphChange;
use crate::scan_profile::{DeltaKind, ProfileDelta};
use crate::storage::{Document, GraphStore, Transaction, TransactionId};

use super::message::{encode, GraphChangeMessage, ProfileMessage};
use super::outbox::{self, OutboxEntry};
use super::queue::{QueueClient, QueueError};

/// All events belonging to one transaction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventBatch {
    /// Ordering and deduplication key of every message in the batch.
    pub transaction_id: TransactionId,
    #[allow(missing_docs)]
    pub origin: Option<OriginId>,
    #[allow(missing_docs)]
    pub graph_changes: Vec<GraphChange>,
    #[allow(missing_docs)]
    pub profile_deltas: Vec<ProfileDelta>,
}

impl EventBatch {
    #[allow(missing_docs)]
    #[must_use]
    pub const fn new(transaction_id: TransactionId) -> Self {
        Self {
            transaction_id,
            origin: None,
            graph_changes: Vec::new(),
            profile_deltas: Vec::new(),
        }
    }

    #[allow(missing_docs)]
    #[must_use]
    pub fn with_graph_changes(mut self, origin: OriginId, changes: Vec<GraphChange>) -> Self {
        self.origin = Some(origin);
        self.graph_changes = changes;
        self
    }

    #[allow(missing_docs)]
    #[must_use]
    pub fn with_profile_deltas(mut self, deltas: Vec<ProfileDelta>) -> Self {
        self.profile_deltas = deltas;
        self
    }

    #[allow(missing_docs)]
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.graph_changes.is_empty() && self.profile_deltas.is_empty()
    }
}

/// Publishes event batches to the configured topics.
pub struct EventPublisher {
    queue: Arc<dyn QueueClient>,
    store: Arc<dyn GraphStore>,
    config: PublisherConfig,
}

impl std::fmt::Debug for EventPublisher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventPublisher")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl EventPublisher {
    /// Publisher whose unpublished batches are kept in `store`.
    pub fn new(queue: Arc<dyn QueueClient>, store: Arc<dyn GraphStore>, config: PublisherConfig) -> Self {
        Self { queue, store, config }
    }

    /// Topic a profile delta of `kind` is routed to.
    #[must_use]
    pub fn topic_for(&self, kind: DeltaKind) -> &str {
        if kind.is_increment() {
            &self.config.increments_topic
        } else {
            &self.config.mutations_topic
        }
    }

    /// Publishes every event of a batch and clears its outbox entry.
    ///
    /// On failure the batch stays in the outbox for
    /// [`EventPublisher::republish_pending`].
    ///
    /// # Errors
    ///
    /// Returns `GraphError::PublishFailure` once retries are exhausted, or a
    /// store error if the failed batch could not be kept in the outbox.
    pub fn publish(&self, batch: EventBatch) -> GraphResult<()> {
        if batch.is_empty() {
            return Ok(());
        }
        match self.send(&batch) {
            Ok(sent) => {
                tracing::debug!(tx = %batch.transaction_id, messages = sent, "events published");
                if let Some(entry) = outbox::entry(&*self.store, batch.transaction_id)? {
                    self.clear(&entry);
                }
                Ok(())
            }
            Err((attempts, err)) => {
                let transaction_id = batch.transaction_id;
                tracing::error!(tx = %transaction_id, attempts, error = %err, "publishing failed, batch parked as unpublished");
                self.park(batch)?;
                Err(GraphError::PublishFailure {
                    transaction_id,
                    attempts,
                    message: err.to_string(),
                })
            }
        }
    }

    /// Retries every parked batch; returns the transactions now fully published.
    ///
    /// # Errors
    ///
    /// Returns store errors from reading the outbox. Batches that fail again
    /// stay parked and are not reported as errors.
    pub fn republish_pending(&self) -> GraphResult<Vec<TransactionId>> {
        let mut published = Vec::new();

        for entry in outbox::entries(&*self.store)?.into_iter().filter(|e| e.propagated) {
            let transaction_id = entry.batch.transaction_id;
            match self.send(&entry.batch) {
                Ok(_) => {
                    tracing::info!(tx = %transaction_id, "parked events republished");
                    self.clear(&entry);
                    published.push(transaction_id);
                }
                Err((attempts, err)) => {
                    tracing::warn!(tx = %transaction_id, attempts, error = %err, "republish failed, batch stays parked");
                }
            }
        }
        Ok(published)
    }

    /// Transactions whose events are parked as unpublished.
    ///
    /// # Errors
    ///
    /// Returns store errors from reading the outbox.
    pub fn pending(&self) -> GraphResult<Vec<TransactionId>> {
        Ok(outbox::entries(&*self.store)?
            .into_iter()
            .filter(|e| e.propagated)
            .map(|e| e.batch.transaction_id)
            .collect())
    }

    /// Keeps a batch in the outbox, next to the entry propagation wrote if any.
    fn park(&self, batch: EventBatch) -> GraphResult<()> {
        let existing = outbox::entry(&*self.store, batch.transaction_id)?;
        if existing.as_ref().is_some_and(|e| e.propagated && e.batch == batch) {
            return Ok(());
        }
        let valid_time = existing.map_or_else(Utc::now, |e| e.valid_time);
        let mut tx = Transaction::new(valid_time);
        tx.put(Document::Outbox(OutboxEntry {
            batch,
            valid_time,
            propagated: true,
        }));
        self.store.submit(tx)?;
        Ok(())
    }

    /// Tombstones a published entry unless it changed since it was read.
    fn clear(&self, entry: &OutboxEntry) {
        let mut tx = Transaction::new(entry.valid_time);
        tx.expect(entry.key(), Some(Document::Outbox(entry.clone())));
        tx.delete(entry.key());
        if let Err(e) = self.store.submit(tx) {
            tracing::warn!(tx = %entry.batch.transaction_id, error = %e, "could not clear published outbox entry; events will be sent again");
        }
    }

    fn messages(&self, batch: &EventBatch) -> Result<Vec<(String, Vec<u8>)>, QueueError> {
        let mut out = Vec::new();
        if let (Some(topic), Some(origin)) = (&self.config.graph_changes_topic, &batch.origin) {
            for change in &batch.graph_changes {
                let msg = GraphChangeMessage::new(batch.transaction_id, origin, change);
                out.push((topic.clone(), encode(&msg)?));
            }
        }
        for delta in &batch.profile_deltas {
            let msg = ProfileMessage::new(batch.transaction_id, delta);
            out.push((self.topic_for(delta.kind).to_string(), encode(&msg)?));
        }
        Ok(out)
    }

    /// Sends every message in order; returns the count, or the attempts and
    /// error of the first message that could not be delivered.
    fn send(&self, batch: &EventBatch) -> Result<usize, (u32, QueueError)> {
        let messages = self.messages(batch).map_err(|e| (1, e))?;
        for (topic, payload) in &messages {
            let (result, attempts) = self.config.retry.run(
                || self.queue.publish(topic, payload),
                QueueError::is_retryable,
                |attempt, e| tracing::warn!(tx = %batch.transaction_id, topic = %topic, attempt, error = %e, "publish failed, retrying"),
            );
            result.map_err(|e| (attempts, e))?;
        }
        Ok(messages.len())
    }
}
