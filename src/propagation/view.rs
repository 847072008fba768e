//! Read-only snapshot of the graph at one valid time.
//!
//! Lookups go to the store lazily and are cached for the rest of the pass.
//! A view built with [`GraphView::load_all`] is complete up front and never
//! queries the store again.

use std::collections::{BTreeSet, HashMap};

use chrono::{DateTime, Utc};

use crate::config::PropagationConfig;
use crate::error::GraphResult;
use crate::graph::{EdgeKey, Reference};
use crate::scan_profile::{ScanLevel, ScanProfile};
use crate::storage::{Document, DocumentKey, GraphStore, QueryPattern};

/// One propagation step to a neighbour.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct Hop {
    pub node: Reference,
    pub decay: u8,
    pub cap: Option<ScanLevel>,
}

impl Hop {
    /// Level that arrives after crossing this hop.
    pub fn carry(&self, level: ScanLevel) -> ScanLevel {
        let decayed = level.decayed(self.decay);
        self.cap.map_or(decayed, |cap| decayed.min(cap))
    }
}

pub(crate) struct GraphView<'a> {
    store: &'a dyn GraphStore,
    at: DateTime<Utc>,
    rules: &'a PropagationConfig,
    complete: bool,
    edges: HashMap<Reference, Vec<EdgeKey>>,
    objects: HashMap<Reference, bool>,
    declared: HashMap<Reference, Option<ScanLevel>>,
    profiles: HashMap<Reference, Option<ScanProfile>>,
}

impl<'a> GraphView<'a> {
    pub fn new(store: &'a dyn GraphStore, at: DateTime<Utc>, rules: &'a PropagationConfig) -> Self {
        Self {
            store,
            at,
            rules,
            complete: false,
            edges: HashMap::new(),
            objects: HashMap::new(),
            declared: HashMap::new(),
            profiles: HashMap::new(),
        }
    }

    /// Loads every object, edge, declaration and profile visible at `at`.
    pub fn load_all(store: &'a dyn GraphStore, at: DateTime<Utc>, rules: &'a PropagationConfig) -> GraphResult<Self> {
        let mut view = Self::new(store, at, rules);
        view.complete = true;

        for doc in store.query(at, &QueryPattern::Objects { object_type: None })? {
            if let Document::Object(o) = doc {
                view.objects.insert(o.primary_key, true);
            }
        }
        for doc in store.query(at, &QueryPattern::Edges)? {
            if let Document::Edge(e) = doc {
                for endpoint in [&e.key.source, &e.key.target] {
                    view.edges.entry(endpoint.clone()).or_default().push(e.key.clone());
                }
            }
        }
        for doc in store.query(at, &QueryPattern::Declarations)? {
            if let Document::Declaration(d) = doc {
                view.declared.insert(d.reference, Some(d.level));
            }
        }
        for doc in store.query(at, &QueryPattern::Profiles)? {
            if let Document::Profile(p) = doc {
                view.profiles.insert(p.reference().clone(), Some(p));
            }
        }
        Ok(view)
    }

    pub const fn valid_time(&self) -> DateTime<Utc> {
        self.at
    }

    /// Every existing object and every object that still has a profile.
    /// Only meaningful on a complete view.
    pub fn known_nodes(&self) -> BTreeSet<Reference> {
        self.objects
            .iter()
            .filter(|(_, exists)| **exists)
            .map(|(r, _)| r.clone())
            .chain(
                self.profiles
                    .iter()
                    .filter(|(_, p)| p.is_some())
                    .map(|(r, _)| r.clone()),
            )
            .collect()
    }

    /// Declared objects that exist. Only meaningful on a complete view.
    pub fn declared_nodes(&self) -> Vec<(Reference, ScanLevel)> {
        let mut out: Vec<(Reference, ScanLevel)> = self
            .declared
            .iter()
            .filter_map(|(r, level)| level.map(|l| (r.clone(), l)))
            .filter(|(r, _)| self.objects.get(r).copied().unwrap_or(false))
            .collect();
        out.sort();
        out
    }

    pub fn exists(&mut self, reference: &Reference) -> GraphResult<bool> {
        if let Some(&exists) = self.objects.get(reference) {
            return Ok(exists);
        }
        let exists = !self.complete
            && self
                .store
                .get(self.at, &DocumentKey::Object(reference.clone()))?
                .is_some();
        self.objects.insert(reference.clone(), exists);
        Ok(exists)
    }

    /// Declared level of an existing object.
    pub fn declared(&mut self, reference: &Reference) -> GraphResult<Option<ScanLevel>> {
        if !self.exists(reference)? {
            return Ok(None);
        }
        if let Some(level) = self.declared.get(reference) {
            return Ok(*level);
        }
        let level = if self.complete {
            None
        } else {
            self.store
                .get(self.at, &DocumentKey::Declaration(reference.clone()))?
                .and_then(|doc| doc.as_declaration().map(|d| d.level))
        };
        self.declared.insert(reference.clone(), level);
        Ok(level)
    }

    /// Stored profile, if any.
    pub fn profile(&mut self, reference: &Reference) -> GraphResult<Option<ScanProfile>> {
        if let Some(profile) = self.profiles.get(reference) {
            return Ok(profile.clone());
        }
        let profile = if self.complete {
            None
        } else {
            self.store
                .get(self.at, &DocumentKey::Profile(reference.clone()))?
                .and_then(|doc| doc.as_profile().cloned())
        };
        self.profiles.insert(reference.clone(), profile.clone());
        Ok(profile)
    }

    fn touching(&mut self, reference: &Reference) -> GraphResult<Vec<EdgeKey>> {
        if let Some(keys) = self.edges.get(reference) {
            return Ok(keys.clone());
        }
        let keys: Vec<EdgeKey> = if self.complete {
            Vec::new()
        } else {
            self.store
                .query(self.at, &QueryPattern::EdgesTouching(reference.clone()))?
                .into_iter()
                .filter_map(|doc| doc.as_edge().map(|e| e.key.clone()))
                .collect()
        };
        self.edges.insert(reference.clone(), keys.clone());
        Ok(keys)
    }

    /// Existing neighbours `reference` passes its level to.
    pub fn downstream(&mut self, reference: &Reference) -> GraphResult<Vec<Hop>> {
        self.hops(reference, true)
    }

    /// Existing neighbours `reference` receives levels from.
    pub fn upstream(&mut self, reference: &Reference) -> GraphResult<Vec<Hop>> {
        self.hops(reference, false)
    }

    fn hops(&mut self, reference: &Reference, outgoing: bool) -> GraphResult<Vec<Hop>> {
        let mut hops = Vec::new();
        for key in self.touching(reference)? {
            let rule = self.rules.rule_for(&key.relation);
            let direction = rule.direction;
            // Levels leave a source forward and a target backward; they enter the other way round.
            let (from_source, from_target) = if outgoing {
                (direction.forward(), direction.backward())
            } else {
                (direction.backward(), direction.forward())
            };
            let (node, forward) = if &key.source == reference && from_source {
                (key.target, outgoing)
            } else if &key.target == reference && from_target {
                (key.source, !outgoing)
            } else {
                continue;
            };
            if &node != reference && self.exists(&node)? {
                hops.push(Hop {
                    node,
                    decay: rule.decay,
                    cap: rule.cap(forward),
                });
            }
        }
        Ok(hops)
    }
}
