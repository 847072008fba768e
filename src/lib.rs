//! # scangraph - origin-tracked object graph with scan profile propagation
//!
//! scangraph keeps a bitemporal graph of objects and edges that many
//! independent origins (scanners, normalizers, users) report into, and
//! derives from it how intensively each object may be scanned.
//!
//! ## Core Concepts
//!
//! - **Origin**: a producer of facts. Each run replaces the origin's previous
//!   run; facts it stops asserting are retracted unless another origin still
//!   asserts them.
//! - **Scan level**: a small bounded integer. Declared levels flow along
//!   edges to everything reachable within a hop limit; each object takes the
//!   highest level that reaches it.
//! - **Events**: every committed transaction yields profile deltas published
//!   at-least-once, keyed by transaction id.
//! - **Flush barrier**: callers can wait until a transaction's deltas are
//!   written and published.
//!
//! ## Usage
//!
//! ```rust
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! use chrono::Utc;
//! use scangraph::{
//!     Edge, EdgeKey, EngineConfig, GraphEngine, InMemoryGraphStore, InMemoryQueue, Object, OriginId,
//!     OriginPayload, ScanLevel,
//! };
//!
//! let engine = GraphEngine::new(
//!     Arc::new(InMemoryGraphStore::new()),
//!     Arc::new(InMemoryQueue::new()),
//!     EngineConfig::default(),
//! )?;
//!
//! let host = Object::new("Hostname", &["internet", "example.com"])?;
//! let ip = Object::new("IPAddressV4", &["internet", "192.0.2.1"])?;
//! let resolves = Edge::new(EdgeKey::new(host.reference().clone(), "resolves_to", ip.reference().clone())?);
//!
//! let now = Utc::now();
//! engine.ingest(
//!     &OriginPayload::observation(OriginId::new("dns|example.com"), now)
//!         .with_object(host.clone())
//!         .with_object(ip.clone())
//!         .with_edge(resolves),
//! )?;
//! let declared = engine.ingest(
//!     &OriginPayload::declaration(OriginId::new("user|example.com"), now)
//!         .with_declared_level(host.reference().clone(), ScanLevel::new(2)),
//! )?;
//!
//! if let Some(tx) = declared.transaction_id {
//!     assert!(engine.await_flush(tx, Duration::from_secs(5)));
//! }
//! assert_eq!(engine.effective_level(ip.reference())?, ScanLevel::new(2));
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

// Core types
pub mod error;
pub mod graph;
pub mod origin;
pub mod scan_profile;
pub mod time;

// Storage and configuration
pub mod config;
pub mod retry;
pub mod storage;

// Components
pub mod barrier;
pub mod engine;
pub mod events;
pub mod ledger;
pub mod propagation;
pub mod reconcile;

// Re-export primary types at crate root for convenience
pub use error::{GraphError, GraphResult, ValidationError};
pub use graph::{Edge, EdgeKey, FactId, Object, Reference};
pub use origin::{OriginId, OriginMethod, OriginPayload, OriginRecord};
pub use scan_profile::{DeclaredLevel, DeltaKind, Inheritance, ProfileDelta, ScanLevel, ScanProfile};
pub use time::TimeRange;

pub use config::{CascadePolicy, ConfigError, EngineConfig};
pub use retry::RetryPolicy;
pub use storage::{GraphStore, InMemoryGraphStore, StorageError, TransactionId};

pub use barrier::SyncBarrier;
pub use engine::{GraphEngine, RecalculationHandle, RecalculationReport};
pub use events::{EventBatch, EventPublisher, InMemoryQueue, OutboxEntry, ProfileMessage, QueueClient, QueueError};
pub use ledger::OriginLedger;
pub use propagation::{PropagationReport, ScanProfilePropagator};
pub use reconcile::{ChangeKind, GraphChange, OriginReconciler, TransactionResult};
