//! Message broker abstraction.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::RwLock;

use thiserror::Error;

/// Errors raised by a queue client.
#[allow(missing_docs)]
#[derive(Debug, Error)]
pub enum QueueError {
    /// Broker cannot be reached right now. Retryable.
    #[error("Broker unavailable: {0}")]
    Unavailable(String),

    #[error("Message rejected by broker: {0}")]
    Rejected(String),

    #[error("Message serialization failed: {0}")]
    Serialization(String),
}

impl QueueError {
    /// Returns true if publishing the same message again may succeed.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(self, Self::Unavailable(_))
    }
}

/// A topic-based message broker.
pub trait QueueClient: Send + Sync {
    /// Publishes one message; returns once the broker has accepted it.
    fn publish(&self, topic: &str, payload: &[u8]) -> Result<(), QueueError>;
}

/// In-process broker that records every message per topic.
#[derive(Debug, Default)]
pub struct InMemoryQueue {
    topics: RwLock<HashMap<String, Vec<Vec<u8>>>>,
    failing: AtomicU32,
    unavailable: AtomicBool,
}

impl InMemoryQueue {
    #[allow(missing_docs)]
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `n` publishes fail with `QueueError::Unavailable`.
    pub fn fail_next_publishes(&self, n: u32) {
        self.failing.store(n, Ordering::SeqCst);
    }

    /// Toggle broker availability.
    pub fn set_available(&self, available: bool) {
        self.unavailable.store(!available, Ordering::SeqCst);
    }

    /// Every payload published to `topic`, in publish order.
    #[must_use]
    pub fn messages(&self, topic: &str) -> Vec<Vec<u8>> {
        self.topics
            .read()
            .map(|topics| topics.get(topic).cloned().unwrap_or_default())
            .unwrap_or_default()
    }

    /// Decodes every payload on `topic`.
    ///
    /// # Errors
    ///
    /// Returns `QueueError::Serialization` for a payload that is not a `T`.
    pub fn decode<T: for<'de> serde::Deserialize<'de>>(&self, topic: &str) -> Result<Vec<T>, QueueError> {
        self.messages(topic)
            .iter()
            .map(|bytes| super::message::decode(bytes))
            .collect()
    }
}

impl QueueClient for InMemoryQueue {
    fn publish(&self, topic: &str, payload: &[u8]) -> Result<(), QueueError> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(QueueError::Unavailable("broker marked unavailable".to_string()));
        }
        if self
            .failing
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            return Err(QueueError::Unavailable("injected publish failure".to_string()));
        }
        let mut topics = self
            .topics
            .write()
            .map_err(|_| QueueError::Rejected("poisoned lock: publish".to_string()))?;
        topics.entry(topic.to_string()).or_default().push(payload.to_vec());
        Ok(())
    }
}
