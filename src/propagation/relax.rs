//! Hop-bounded relaxation of inherited levels.
//!
//! Levels travel from declared sources over propagation edges, losing the
//! relation's decay and clamped to its cap at every hop, for at most
//! `max_depth` hops. Each node keeps a Pareto front of `(depth, level)`
//! arrivals: an arrival is only kept if no recorded arrival reached the node
//! in as few hops with at least the same level. Because depth strictly grows along every path and is bounded,
//! the FIFO worklist terminates on cyclic graphs too.

use std::collections::{BTreeSet, HashMap, HashSet, VecDeque};

use crate::error::GraphResult;
use crate::graph::Reference;
use crate::scan_profile::{Inheritance, ScanLevel};

use super::view::GraphView;

/// One way a level reached a node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct Arrival {
    pub level: ScanLevel,
    pub depth: u32,
    pub parent: Reference,
    pub source: Reference,
}

impl Arrival {
    fn dominated_by(&self, other: &Self) -> bool {
        other.depth <= self.depth && other.level >= self.level
    }

    fn into_inheritance(self) -> Inheritance {
        Inheritance {
            parent: self.parent,
            source: self.source,
            level: self.level,
            depth: self.depth,
        }
    }
}

/// Arena of per-node Pareto fronts.
#[derive(Debug, Default)]
pub(crate) struct Fronts {
    index: HashMap<Reference, usize>,
    arena: Vec<Vec<Arrival>>,
}

impl Fronts {
    fn slot(&mut self, node: &Reference) -> usize {
        if let Some(&i) = self.index.get(node) {
            return i;
        }
        self.arena.push(Vec::new());
        let i = self.arena.len() - 1;
        self.index.insert(node.clone(), i);
        i
    }

    /// Records the arrival unless it is dominated; returns whether it was kept.
    fn offer(&mut self, node: &Reference, arrival: &Arrival) -> bool {
        let slot = self.slot(node);
        let front = &mut self.arena[slot];
        if front.iter().any(|kept| arrival.dominated_by(kept)) {
            return false;
        }
        front.retain(|kept| !kept.dominated_by(arrival));
        front.push(arrival.clone());
        true
    }

    /// Best inherited level and the inheritances achieving it.
    pub fn best(&self, node: &Reference) -> Option<(ScanLevel, Vec<Inheritance>)> {
        let front = &self.arena[*self.index.get(node)?];
        let level = front.iter().map(|a| a.level).max()?;
        let mut inheritances: Vec<Inheritance> = front
            .iter()
            .filter(|a| a.level == level)
            .cloned()
            .map(Arrival::into_inheritance)
            .collect();
        inheritances.sort();
        Some((level, inheritances))
    }

    pub fn len(&self) -> usize {
        self.arena.len()
    }
}

/// Limits of one relaxation pass.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Bounds {
    pub max_depth: u32,
    pub default_level: ScanLevel,
}

/// Relaxes levels from `sources`, optionally confined to `within`.
pub(crate) fn relax(
    view: &mut GraphView<'_>,
    sources: &[(Reference, ScanLevel)],
    within: Option<&HashSet<Reference>>,
    bounds: Bounds,
) -> GraphResult<Fronts> {
    let mut fronts = Fronts::default();
    let mut queue: VecDeque<(Reference, Arrival)> = VecDeque::new();

    let allowed = |node: &Reference| within.map_or(true, |set| set.contains(node));

    for (source, level) in sources {
        for hop in view.downstream(source)? {
            let arrived = hop.carry(*level);
            if arrived > bounds.default_level && allowed(&hop.node) {
                queue.push_back((
                    hop.node,
                    Arrival {
                        level: arrived,
                        depth: 1,
                        parent: source.clone(),
                        source: source.clone(),
                    },
                ));
            }
        }
    }

    while let Some((node, arrival)) = queue.pop_front() {
        // Declared objects keep their own level and are sources themselves.
        if view.declared(&node)?.is_some() || !fronts.offer(&node, &arrival) {
            continue;
        }
        if arrival.depth >= bounds.max_depth {
            continue;
        }
        for hop in view.downstream(&node)? {
            let arrived = hop.carry(arrival.level);
            if arrived <= bounds.default_level || !allowed(&hop.node) {
                continue;
            }
            queue.push_back((
                hop.node,
                Arrival {
                    level: arrived,
                    depth: arrival.depth + 1,
                    parent: node.clone(),
                    source: arrival.source.clone(),
                },
            ));
        }
    }

    Ok(fronts)
}

/// Breadth-first closure of `start` within `max_depth` hops.
///
/// Follows downstream hops when `downstream` is set, upstream hops otherwise.
/// Returns `None` once more than `budget` nodes are collected.
pub(crate) fn closure(
    view: &mut GraphView<'_>,
    start: &BTreeSet<Reference>,
    max_depth: u32,
    downstream: bool,
    budget: usize,
) -> GraphResult<Option<HashSet<Reference>>> {
    let mut seen: HashSet<Reference> = start.iter().cloned().collect();
    let mut frontier: Vec<Reference> = start.iter().cloned().collect();

    for _ in 0..max_depth {
        if frontier.is_empty() {
            break;
        }
        let mut next = Vec::new();
        for node in &frontier {
            let hops = if downstream {
                view.downstream(node)?
            } else {
                view.upstream(node)?
            };
            for hop in hops {
                if seen.insert(hop.node.clone()) {
                    if seen.len() > budget {
                        return Ok(None);
                    }
                    next.push(hop.node);
                }
            }
        }
        frontier = next;
    }

    if seen.len() > budget {
        return Ok(None);
    }
    Ok(Some(seen))
}

#[cfg(test)]
mod tests {
    use super::*;

    use chrono::{DateTime, Utc};

    use crate::config::{Direction, PropagationConfig, PropagationRule};
    use crate::graph::{Edge, EdgeKey, Object};
    use crate::storage::{Document, GraphStore, InMemoryGraphStore, Transaction};

    fn r(key: &str) -> Reference {
        Object::new("Hostname", &["internet", key]).unwrap().primary_key
    }

    fn graph(store: &InMemoryGraphStore, at: DateTime<Utc>, nodes: &[&str], edges: &[(&str, &str, &str)]) {
        let mut tx = Transaction::new(at);
        for n in nodes {
            tx.put(Document::Object(Object::new("Hostname", &["internet", *n]).unwrap()));
        }
        for (s, rel, t) in edges {
            tx.put(Document::Edge(Edge::new(EdgeKey::new(r(s), *rel, r(t)).unwrap())));
        }
        store.submit(tx).unwrap();
    }

    fn decaying() -> PropagationConfig {
        PropagationConfig {
            rules: vec![PropagationRule {
                relation: "next".to_string(),
                direction: Direction::Forward,
                decay: Some(1),
                ..PropagationRule::default()
            }],
            ..PropagationConfig::default()
        }
    }

    const BOUNDS: Bounds = Bounds {
        max_depth: 8,
        default_level: ScanLevel::L0,
    };

    #[test]
    fn test_decay_along_chain() {
        let store = InMemoryGraphStore::new();
        let at = Utc::now();
        graph(&store, at, &["a", "b", "c", "d", "e"], &[
            ("a", "next", "b"),
            ("b", "next", "c"),
            ("c", "next", "d"),
            ("d", "next", "e"),
        ]);
        let rules = decaying();
        let mut view = GraphView::new(&store, at, &rules);

        let fronts = relax(&mut view, &[(r("a"), ScanLevel::new(3))], None, BOUNDS).unwrap();
        assert_eq!(fronts.best(&r("b")).unwrap().0, ScanLevel::new(2));
        assert_eq!(fronts.best(&r("c")).unwrap().0, ScanLevel::new(1));
        // L0 is the default: no inheritance recorded.
        assert!(fronts.best(&r("d")).is_none());
        assert!(fronts.best(&r("e")).is_none());
    }

    #[test]
    fn test_max_depth_bounds_inheritance() {
        let store = InMemoryGraphStore::new();
        let at = Utc::now();
        graph(&store, at, &["a", "b", "c", "d"], &[
            ("a", "link", "b"),
            ("b", "link", "c"),
            ("c", "link", "d"),
        ]);
        let rules = PropagationConfig::default();
        let mut view = GraphView::new(&store, at, &rules);

        let bounds = Bounds {
            max_depth: 2,
            ..BOUNDS
        };
        let fronts = relax(&mut view, &[(r("a"), ScanLevel::new(4))], None, bounds).unwrap();
        assert_eq!(fronts.best(&r("c")).unwrap().1[0].depth, 2);
        assert!(fronts.best(&r("d")).is_none());
    }

    #[test]
    fn test_cycle_terminates_and_keeps_best() {
        let store = InMemoryGraphStore::new();
        let at = Utc::now();
        graph(&store, at, &["a", "b", "c"], &[
            ("a", "link", "b"),
            ("b", "link", "c"),
            ("c", "link", "a"),
        ]);
        let rules = PropagationConfig::default();
        let mut view = GraphView::new(&store, at, &rules);

        let fronts = relax(&mut view, &[(r("a"), ScanLevel::new(2))], None, BOUNDS).unwrap();
        let (level, inheritances) = fronts.best(&r("b")).unwrap();
        assert_eq!(level, ScanLevel::new(2));
        // Reached directly from a (depth 1); the way round through c is dominated.
        assert_eq!(inheritances.len(), 1);
        assert_eq!(inheritances[0].depth, 1);
        assert!(fronts.best(&r("a")).is_some());
    }

    #[test]
    fn test_arrival_stops_at_declared_node() {
        let store = InMemoryGraphStore::new();
        let at = Utc::now();
        graph(&store, at, &["a", "b", "c"], &[("a", "link", "b"), ("b", "link", "c")]);
        let mut tx = Transaction::new(at);
        tx.put(Document::Declaration(crate::scan_profile::DeclaredLevel::new(
            r("b"),
            ScanLevel::new(1),
        )));
        store.submit(tx).unwrap();

        let rules = PropagationConfig::default();
        let mut view = GraphView::new(&store, at, &rules);
        let fronts = relax(&mut view, &[(r("a"), ScanLevel::new(4))], None, BOUNDS).unwrap();
        assert!(fronts.best(&r("b")).is_none());
        assert!(fronts.best(&r("c")).is_none());
    }

    #[test]
    fn test_higher_level_at_greater_depth_is_kept() {
        let store = InMemoryGraphStore::new();
        let at = Utc::now();
        // a(L1) -> t directly, b(L3) -> x -> t.
        graph(&store, at, &["a", "b", "x", "t"], &[
            ("a", "link", "t"),
            ("b", "link", "x"),
            ("x", "link", "t"),
        ]);
        let rules = PropagationConfig::default();
        let mut view = GraphView::new(&store, at, &rules);
        let sources = [(r("a"), ScanLevel::new(1)), (r("b"), ScanLevel::new(3))];
        let fronts = relax(&mut view, &sources, None, BOUNDS).unwrap();

        let (level, inheritances) = fronts.best(&r("t")).unwrap();
        assert_eq!(level, ScanLevel::new(3));
        assert_eq!(inheritances[0].source, r("b"));
        assert_eq!(inheritances[0].depth, 2);
    }

    #[test]
    fn test_relation_caps_clamp_each_direction() {
        let store = InMemoryGraphStore::new();
        let at = Utc::now();
        // a(L4) -service-> b -link-> d, and x -service-> a.
        graph(&store, at, &["a", "b", "d", "x"], &[
            ("a", "service", "b"),
            ("b", "link", "d"),
            ("x", "service", "a"),
        ]);
        let rules = PropagationConfig {
            rules: vec![PropagationRule {
                relation: "service".to_string(),
                max_issue: Some(ScanLevel::new(1)),
                max_inherit: Some(ScanLevel::new(2)),
                ..PropagationRule::default()
            }],
            ..PropagationConfig::default()
        };
        let mut view = GraphView::new(&store, at, &rules);

        let fronts = relax(&mut view, &[(r("a"), ScanLevel::new(4))], None, BOUNDS).unwrap();
        assert_eq!(fronts.best(&r("b")).unwrap().0, ScanLevel::new(1));
        assert_eq!(fronts.best(&r("d")).unwrap().0, ScanLevel::new(1));
        assert_eq!(fronts.best(&r("x")).unwrap().0, ScanLevel::new(2));
    }

    #[test]
    fn test_zero_cap_blocks_inheritance() {
        let store = InMemoryGraphStore::new();
        let at = Utc::now();
        graph(&store, at, &["ip", "svc"], &[("svc", "ip_service", "ip")]);
        let rules = PropagationConfig {
            rules: vec![PropagationRule {
                relation: "ip_service".to_string(),
                max_issue: Some(ScanLevel::L0),
                ..PropagationRule::default()
            }],
            ..PropagationConfig::default()
        };
        let mut view = GraphView::new(&store, at, &rules);

        // Nothing flows from the service to the address, the address still hands its level back.
        let fronts = relax(&mut view, &[(r("svc"), ScanLevel::new(3))], None, BOUNDS).unwrap();
        assert!(fronts.best(&r("ip")).is_none());
        let fronts = relax(&mut view, &[(r("ip"), ScanLevel::new(3))], None, BOUNDS).unwrap();
        assert_eq!(fronts.best(&r("svc")).unwrap().0, ScanLevel::new(3));
    }

    #[test]
    fn test_closure_respects_budget() {
        let store = InMemoryGraphStore::new();
        let at = Utc::now();
        graph(&store, at, &["a", "b", "c", "d"], &[
            ("a", "next", "b"),
            ("b", "next", "c"),
            ("c", "next", "d"),
        ]);
        let rules = decaying();
        let mut view = GraphView::new(&store, at, &rules);
        let start = BTreeSet::from([r("b")]);

        let down = closure(&mut view, &start, 8, true, 100).unwrap().unwrap();
        assert_eq!(down.len(), 3);
        let up = closure(&mut view, &start, 8, false, 100).unwrap().unwrap();
        assert_eq!(up, HashSet::from([r("a"), r("b")]));
        let one_hop = closure(&mut view, &start, 1, true, 100).unwrap().unwrap();
        assert_eq!(one_hop.len(), 2);
        assert!(closure(&mut view, &start, 8, true, 2).unwrap().is_none());
    }
}
