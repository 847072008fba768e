//! Typed, directed relations between objects.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::ValidationError;

use super::reference::{is_valid_relation, Reference};

/// Identity of an edge: one relation between two objects.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct EdgeKey {
    /// Origin of the relation.
    pub source: Reference,
    /// Relation name (lower snake case).
    pub relation: String,
    /// Destination of the relation.
    pub target: Reference,
}

impl EdgeKey {
    /// Creates an edge key.
    ///
    /// # Errors
    ///
    /// Returns `ValidationError::InvalidRelation` for a malformed relation name.
    pub fn new(
        source: Reference,
        relation: impl Into<String>,
        target: Reference,
    ) -> Result<Self, ValidationError> {
        let relation = relation.into();
        if !is_valid_relation(&relation) {
            return Err(ValidationError::InvalidRelation { relation });
        }
        Ok(Self {
            source,
            relation,
            target,
        })
    }

    /// Returns true if either endpoint is `reference`.
    #[must_use]
    pub fn touches(&self, reference: &Reference) -> bool {
        &self.source == reference || &self.target == reference
    }
}

impl fmt::Display for EdgeKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} -[{}]-> {}", self.source, self.relation, self.target)
    }
}

/// A stored edge.
#[allow(missing_docs)]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Edge {
    pub key: EdgeKey,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub attributes: BTreeMap<String, serde_json::Value>,
}

impl Edge {
    /// Creates an attribute-less edge.
    #[must_use]
    pub fn new(key: EdgeKey) -> Self {
        Self {
            key,
            attributes: BTreeMap::new(),
        }
    }
}

/// Edge as it appears in an ingestion payload.
#[allow(missing_docs)]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EdgeInput {
    pub source: String,
    pub relation: String,
    pub target: String,
    #[serde(default)]
    pub attributes: BTreeMap<String, serde_json::Value>,
}

impl TryFrom<EdgeInput> for Edge {
    type Error = ValidationError;

    fn try_from(input: EdgeInput) -> Result<Self, Self::Error> {
        let key = EdgeKey::new(
            Reference::parse(&input.source)?,
            input.relation,
            Reference::parse(&input.target)?,
        )?;
        Ok(Self {
            key,
            attributes: input.attributes,
        })
    }
}
