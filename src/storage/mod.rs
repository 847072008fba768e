//! Storage layer for scangraph.
//!
//! `traits` defines the bitemporal store contract; `memory` is the
//! in-process implementation used for embedding and tests.

mod memory;
mod traits;

pub use memory::InMemoryGraphStore;
pub use traits::{
    CommittedTransaction, Document, DocumentKey, DocumentVersion, GraphStore, Operation, QueryPattern,
    StorageError, Transaction, TransactionId,
};
