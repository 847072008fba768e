//! Event publishing: wire messages, the durable outbox, the broker seam and
//! the publisher.

mod message;
pub(crate) mod outbox;
mod publisher;
mod queue;

pub use message::{decode, encode, Deduplicator, GraphChangeMessage, ProfileMessage};
pub use outbox::OutboxEntry;
pub use publisher::{EventBatch, EventPublisher};
pub use queue::{InMemoryQueue, QueueClient, QueueError};
