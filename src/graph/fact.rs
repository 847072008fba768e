//! Ownership unit tracked per origin.

use std::fmt;

use serde::{Deserialize, Serialize};

use super::edge::EdgeKey;
use super::reference::Reference;

/// Identifier of one fact an origin asserts.
///
/// Origins own objects, edges and (for declarations) declared scan levels.
/// Diffing between runs happens over these identifiers, not over content.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", content = "id", rename_all = "snake_case")]
pub enum FactId {
    /// An object node.
    Object(Reference),
    /// An edge.
    Edge(EdgeKey),
    /// A declared scan level on an object.
    Declaration(Reference),
}

impl FactId {
    /// The object reference for object and declaration facts.
    #[must_use]
    pub const fn object_reference(&self) -> Option<&Reference> {
        match self {
            Self::Object(r) | Self::Declaration(r) => Some(r),
            Self::Edge(_) => None,
        }
    }

    /// Short lowercase label of the fact kind.
    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::Object(_) => "object",
            Self::Edge(_) => "edge",
            Self::Declaration(_) => "declaration",
        }
    }
}

impl fmt::Display for FactId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Object(r) => write!(f, "object {r}"),
            Self::Edge(k) => write!(f, "edge {k}"),
            Self::Declaration(r) => write!(f, "declaration {r}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_serde_tagged() {
        let fact = FactId::Object(Reference::from_raw("Network|internet"));
        let json = serde_json::to_value(&fact).unwrap();
        assert_eq!(json["kind"], "object");
        assert_eq!(json["id"], "Network|internet");
        let back: FactId = serde_json::from_value(json).unwrap();
        assert_eq!(back, fact);
    }

    #[test]
    fn test_edge_fact_has_no_object_reference() {
        let key = EdgeKey::new(
            Reference::from_raw("Hostname|internet|a"),
            "resolves_to",
            Reference::from_raw("IPAddressV4|internet|1.1.1.1"),
        )
        .unwrap();
        assert!(FactId::Edge(key).object_reference().is_none());
        assert!(FactId::Declaration(Reference::from_raw("Network|internet"))
            .object_reference()
            .is_some());
    }
}
