//! Origins and their ingestion payloads.
//!
//! Every fact in the graph is attributed to an origin: the producer
//! (automated normalizer run or manual declaration) of a set of objects and
//! edges, identified stably across runs. An origin's most recent run is the
//! complete list of what it asserts; the reconciler diffs successive runs.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{GraphResult, ValidationError};
use crate::graph::{Edge, EdgeInput, FactId, Object, ObjectInput, Reference};
use crate::scan_profile::{DeclaredLevel, DeclaredLevelInput, ScanLevel};
use crate::storage::Document;

/// Stable origin identifier, conventionally `source|method|target`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct OriginId(String);

impl OriginId {
    #[allow(missing_docs)]
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Composes an origin id from the producing source, method and target.
    ///
    /// ```
    /// use scangraph::{OriginId, Reference};
    ///
    /// let target = Reference::from_raw("Hostname|internet|example.com");
    /// let id = OriginId::from_parts("boefje", "dns_records", &target);
    /// assert_eq!(id.as_str(), "boefje|dns_records|Hostname|internet|example.com");
    /// ```
    #[must_use]
    pub fn from_parts(source: &str, method: &str, target: &Reference) -> Self {
        Self(format!("{source}|{method}|{target}"))
    }

    #[allow(missing_docs)]
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    #[allow(missing_docs)]
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.trim().is_empty()
    }
}

impl fmt::Display for OriginId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// How an origin produced its facts.
#[allow(missing_docs)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OriginMethod {
    /// Automated scan / normalizer output.
    Observation,
    /// Manually authored assertion; may carry declared scan levels.
    Declaration,
}

impl fmt::Display for OriginMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Observation => f.write_str("observation"),
            Self::Declaration => f.write_str("declaration"),
        }
    }
}

/// Ledger document: what an origin asserted in its most recent run.
#[allow(missing_docs)]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OriginRecord {
    pub id: OriginId,
    pub method: OriginMethod,
    pub valid_time: DateTime<Utc>,
    /// Every fact of the run with the content this origin asserted for it.
    #[serde(with = "asserted_content")]
    pub result: BTreeMap<FactId, Document>,
    /// Number of committed runs.
    pub runs: u64,
}

impl OriginRecord {
    /// Returns true if this run asserts `fact`.
    #[must_use]
    pub fn asserts(&self, fact: &FactId) -> bool {
        self.result.contains_key(fact)
    }

    /// Identifiers of every fact in this run.
    #[must_use]
    pub fn facts(&self) -> BTreeSet<FactId> {
        self.result.keys().cloned().collect()
    }

    /// What this origin asserted for `fact`, if it asserts it.
    #[must_use]
    pub fn content(&self, fact: &FactId) -> Option<&Document> {
        self.result.get(fact)
    }
}

/// Stores the result as a plain document list; fact ids are keys derived
/// from the documents, and JSON maps only take string keys.
mod asserted_content {
    use std::collections::BTreeMap;

    use serde::de::Error as _;
    use serde::{Deserialize, Deserializer, Serializer};

    use crate::graph::FactId;
    use crate::storage::Document;

    pub fn serialize<S: Serializer>(result: &BTreeMap<FactId, Document>, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_seq(result.values())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<BTreeMap<FactId, Document>, D::Error> {
        Vec::<Document>::deserialize(deserializer)?
            .into_iter()
            .map(|doc| match doc.fact() {
                Some(fact) => Ok((fact, doc)),
                None => Err(D::Error::custom(format!("{} is not an origin-owned fact", doc.key()))),
            })
            .collect()
    }
}

/// A complete run of one origin.
#[derive(Debug, Clone, PartialEq)]
pub struct OriginPayload {
    /// Producing origin.
    pub origin: OriginId,
    #[allow(missing_docs)]
    pub method: OriginMethod,
    /// When the asserted facts became true.
    pub valid_time: DateTime<Utc>,
    #[allow(missing_docs)]
    pub objects: Vec<Object>,
    #[allow(missing_docs)]
    pub edges: Vec<Edge>,
    /// Declared scan levels (declarations only).
    pub scan_profiles: Vec<DeclaredLevel>,
}

#[derive(Debug, Deserialize)]
struct RawPayload {
    origin: String,
    method: OriginMethod,
    valid_time: DateTime<Utc>,
    #[serde(default)]
    objects: Vec<ObjectInput>,
    #[serde(default)]
    edges: Vec<EdgeInput>,
    #[serde(default)]
    scan_profiles: Vec<DeclaredLevelInput>,
}

impl OriginPayload {
    /// Starts an empty observation run.
    #[must_use]
    pub fn observation(origin: OriginId, valid_time: DateTime<Utc>) -> Self {
        Self::empty(origin, OriginMethod::Observation, valid_time)
    }

    /// Starts an empty declaration run.
    #[must_use]
    pub fn declaration(origin: OriginId, valid_time: DateTime<Utc>) -> Self {
        Self::empty(origin, OriginMethod::Declaration, valid_time)
    }

    fn empty(origin: OriginId, method: OriginMethod, valid_time: DateTime<Utc>) -> Self {
        Self {
            origin,
            method,
            valid_time,
            objects: Vec::new(),
            edges: Vec::new(),
            scan_profiles: Vec::new(),
        }
    }

    #[allow(missing_docs)]
    #[must_use]
    pub fn with_object(mut self, object: Object) -> Self {
        self.objects.push(object);
        self
    }

    #[allow(missing_docs)]
    #[must_use]
    pub fn with_edge(mut self, edge: Edge) -> Self {
        self.edges.push(edge);
        self
    }

    #[allow(missing_docs)]
    #[must_use]
    pub fn with_declared_level(mut self, reference: Reference, level: ScanLevel) -> Self {
        self.scan_profiles.push(DeclaredLevel::new(reference, level));
        self
    }

    /// Parses the JSON ingestion format.
    ///
    /// ```
    /// use scangraph::OriginPayload;
    ///
    /// let payload = OriginPayload::from_json(r#"{
    ///     "origin": "nmap|scan|IPAddressV4|internet|1.1.1.1",
    ///     "method": "observation",
    ///     "valid_time": "2024-01-01T00:00:00Z",
    ///     "objects": [{"object_type": "IPPort", "natural_key": ["internet", "1.1.1.1", "tcp", "80"]}]
    /// }"#).unwrap();
    /// assert_eq!(payload.objects.len(), 1);
    /// ```
    ///
    /// # Errors
    ///
    /// Returns `ValidationError::MalformedPayload` for invalid JSON and other
    /// validation errors for malformed references.
    pub fn from_json(json: &str) -> GraphResult<Self> {
        let raw: RawPayload = serde_json::from_str(json).map_err(|e| ValidationError::MalformedPayload {
            reason: e.to_string(),
        })?;

        let objects = raw
            .objects
            .into_iter()
            .map(Object::try_from)
            .collect::<Result<Vec<_>, _>>()?;
        let edges = raw
            .edges
            .into_iter()
            .map(Edge::try_from)
            .collect::<Result<Vec<_>, _>>()?;
        let scan_profiles = raw
            .scan_profiles
            .into_iter()
            .map(DeclaredLevel::try_from)
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Self {
            origin: OriginId::new(raw.origin),
            method: raw.method,
            valid_time: raw.valid_time,
            objects,
            edges,
            scan_profiles,
        })
    }

    /// Structural checks that need no store access.
    ///
    /// # Errors
    ///
    /// Returns the first violation found.
    pub fn validate(&self, max_level: ScanLevel) -> Result<(), ValidationError> {
        if self.origin.is_empty() {
            return Err(ValidationError::EmptyOriginId);
        }
        if self.method == OriginMethod::Observation && !self.scan_profiles.is_empty() {
            return Err(ValidationError::DeclarationFromObservation {
                origin: self.origin.to_string(),
            });
        }

        let mut seen = BTreeSet::new();
        for object in &self.objects {
            if object.reference().object_type() != object.object_type {
                return Err(ValidationError::InvalidReference {
                    reference: object.reference().to_string(),
                    reason: format!("object type '{}' does not match key prefix", object.object_type),
                });
            }
            if !seen.insert(FactId::Object(object.primary_key.clone())) {
                return Err(duplicate("object", object.reference()));
            }
        }
        for edge in &self.edges {
            if !seen.insert(FactId::Edge(edge.key.clone())) {
                return Err(duplicate("edge", &edge.key));
            }
        }
        for declared in &self.scan_profiles {
            declared.level.check(max_level)?;
            if !seen.insert(FactId::Declaration(declared.reference.clone())) {
                return Err(duplicate("declaration", &declared.reference));
            }
        }
        Ok(())
    }

    /// Identifiers of every fact in this run.
    #[must_use]
    pub fn asserted_facts(&self) -> BTreeSet<FactId> {
        self.asserted_documents().into_keys().collect()
    }

    /// Every fact in this run with the document that materializes it.
    #[must_use]
    pub fn asserted_documents(&self) -> BTreeMap<FactId, Document> {
        self.objects
            .iter()
            .map(|o| (FactId::Object(o.primary_key.clone()), Document::Object(o.clone())))
            .chain(
                self.edges
                    .iter()
                    .map(|e| (FactId::Edge(e.key.clone()), Document::Edge(e.clone()))),
            )
            .chain(
                self.scan_profiles
                    .iter()
                    .map(|d| (FactId::Declaration(d.reference.clone()), Document::Declaration(d.clone()))),
            )
            .collect()
    }
}

fn duplicate(kind: &str, id: &impl fmt::Display) -> ValidationError {
    ValidationError::DuplicateFact {
        kind: kind.to_string(),
        id: id.to_string(),
    }
}
