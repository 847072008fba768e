//! Graph model: objects, edges and the fact identifiers origins own.
//!
//! Objects are keyed by a content-derived natural key (`Reference`), edges by
//! `(source, relation, target)`. Neither carries valid time itself; time lives
//! in the store's version history.

mod edge;
mod fact;
mod object;
mod reference;

pub use edge::{Edge, EdgeInput, EdgeKey};
pub use fact::FactId;
pub use object::{Object, ObjectInput};
pub use reference::Reference;
