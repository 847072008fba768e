//! End-to-end scan profile propagation through the engine.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};

use scangraph::config::{Direction, PropagationRule};
use scangraph::{
    ChangeKind, DeltaKind, Edge, EdgeKey, EngineConfig, FactId, GraphEngine, InMemoryGraphStore, InMemoryQueue,
    Object, OriginId, OriginPayload, ProfileMessage, Reference, ScanLevel, ScanProfile, TransactionId,
};

const WAIT: Duration = Duration::from_secs(5);
const INCREMENTS: &str = "scan_profile_increments";
const MUTATIONS: &str = "scan_profile_mutations";

fn minutes_ago(minutes: i64) -> DateTime<Utc> {
    Utc::now() - chrono::Duration::minutes(minutes)
}

fn host(name: &str) -> Object {
    Object::new("Hostname", &["internet", name]).unwrap()
}

fn ip(addr: &str) -> Object {
    Object::new("IPAddressV4", &["internet", addr]).unwrap()
}

fn edge(source: &Object, relation: &str, target: &Object) -> Edge {
    Edge::new(EdgeKey::new(source.reference().clone(), relation, target.reference().clone()).unwrap())
}

struct Harness {
    engine: GraphEngine,
    queue: Arc<InMemoryQueue>,
}

impl Harness {
    fn new(config: EngineConfig) -> Self {
        let queue = Arc::new(InMemoryQueue::new());
        let engine = GraphEngine::new(Arc::new(InMemoryGraphStore::new()), queue.clone(), config).unwrap();
        Self { engine, queue }
    }

    fn ingest(&self, payload: &OriginPayload) -> TransactionId {
        let tx = self.engine.ingest(payload).unwrap().transaction_id.unwrap();
        assert!(self.engine.await_flush(tx, WAIT), "transaction {tx} not flushed");
        tx
    }

    fn messages(&self, topic: &str, tx: TransactionId) -> Vec<ProfileMessage> {
        self.queue
            .decode::<ProfileMessage>(topic)
            .unwrap()
            .into_iter()
            .filter(|m| m.transaction_id == tx)
            .collect()
    }

    fn level(&self, reference: &Reference) -> ScanLevel {
        self.engine.effective_level(reference).unwrap()
    }
}

fn observation(origin: &str, at: DateTime<Utc>) -> OriginPayload {
    OriginPayload::observation(OriginId::new(origin), at)
}

fn declare(reference: &Reference, level: u8, at: DateTime<Utc>) -> OriginPayload {
    OriginPayload::declaration(OriginId::new(format!("declaration|{reference}")), at)
        .with_declared_level(reference.clone(), ScanLevel::new(level))
}

#[test]
fn test_observation_creates_default_profiles() {
    let h = Harness::new(EngineConfig::default());
    let host1 = host("host1");
    let ip1 = ip("192.0.2.1");

    let tx = h.ingest(
        &observation("A", minutes_ago(30))
            .with_object(host1.clone())
            .with_object(ip1.clone())
            .with_edge(edge(&host1, "resolves_to", &ip1)),
    );

    assert_eq!(h.level(host1.reference()), ScanLevel::L0);
    assert_eq!(h.level(ip1.reference()), ScanLevel::L0);

    let created = h.messages(INCREMENTS, tx);
    assert_eq!(created.len(), 2);
    assert!(created.iter().all(|m| m.kind == DeltaKind::Created && m.new_level == ScanLevel::L0));
    assert!(h.messages(MUTATIONS, tx).is_empty());
}

#[test]
fn test_declaration_propagates_to_neighbour() {
    let h = Harness::new(EngineConfig::default());
    let host1 = host("host1");
    let ip1 = ip("192.0.2.1");

    h.ingest(
        &observation("A", minutes_ago(30))
            .with_object(host1.clone())
            .with_object(ip1.clone())
            .with_edge(edge(&host1, "resolves_to", &ip1)),
    );
    let tx = h.ingest(&declare(host1.reference(), 3, minutes_ago(20)));

    let mutations = h.messages(MUTATIONS, tx);
    assert_eq!(mutations.len(), 2);
    let declared = mutations.iter().find(|m| &m.object_id == host1.reference()).unwrap();
    assert_eq!(declared.kind, DeltaKind::Declared);
    assert_eq!(declared.old_level, Some(ScanLevel::L0));
    assert_eq!(declared.new_level, ScanLevel::new(3));

    let inherited = mutations.iter().find(|m| &m.object_id == ip1.reference()).unwrap();
    assert_eq!(inherited.kind, DeltaKind::Inherited);
    assert_eq!(inherited.new_level, ScanLevel::new(3));

    match h.engine.scan_profile(ip1.reference()).unwrap().unwrap() {
        ScanProfile::Inherited { inheritances, .. } => {
            assert_eq!(inheritances.len(), 1);
            assert_eq!(&inheritances[0].source, host1.reference());
            assert_eq!(inheritances[0].depth, 1);
        }
        other => panic!("expected inherited profile, got {other:?}"),
    }
}

#[test]
fn test_dropped_facts_are_retracted_with_their_profile() {
    let h = Harness::new(EngineConfig::default());
    let host1 = host("host1");
    let ip1 = ip("192.0.2.1");

    h.ingest(
        &observation("A", minutes_ago(30))
            .with_object(host1.clone())
            .with_object(ip1.clone())
            .with_edge(edge(&host1, "resolves_to", &ip1)),
    );
    h.ingest(&declare(host1.reference(), 3, minutes_ago(20)));

    let rerun = h.engine.ingest(&observation("A", minutes_ago(10)).with_object(host1.clone())).unwrap();
    let tx = rerun.transaction_id.unwrap();
    assert!(h.engine.await_flush(tx, WAIT));

    assert_eq!(rerun.count(ChangeKind::Retracted), 2);
    assert!(rerun
        .changes
        .contains(&scangraph::GraphChange { fact: FactId::Object(ip1.reference().clone()), kind: ChangeKind::Retracted }));

    let retracted = h.messages(MUTATIONS, tx);
    assert_eq!(retracted.len(), 1);
    assert_eq!(&retracted[0].object_id, ip1.reference());
    assert_eq!(retracted[0].kind, DeltaKind::Retracted);
    assert_eq!(retracted[0].old_level, Some(ScanLevel::new(3)));
    assert_eq!(retracted[0].new_level, ScanLevel::L0);

    assert!(h.engine.object(ip1.reference()).unwrap().is_none());
    assert_eq!(h.level(host1.reference()), ScanLevel::new(3));
}

#[test]
fn test_decay_and_direction_rules() {
    let mut config = EngineConfig::default();
    config.propagation.rules = vec![PropagationRule {
        relation: "resolves_to".to_string(),
        direction: Direction::Forward,
        decay: Some(1),
        ..PropagationRule::default()
    }];
    let h = Harness::new(config);

    let host1 = host("host1");
    let ip1 = ip("192.0.2.1");
    let ip2 = ip("192.0.2.2");
    h.ingest(
        &observation("A", minutes_ago(30))
            .with_object(host1.clone())
            .with_object(ip1.clone())
            .with_object(ip2.clone())
            .with_edge(edge(&host1, "resolves_to", &ip1))
            .with_edge(edge(&ip2, "resolves_to", &host1)),
    );
    h.ingest(&declare(host1.reference(), 3, minutes_ago(20)));

    // Forward with decay 1: host1 -> ip1 loses one level.
    assert_eq!(h.level(ip1.reference()), ScanLevel::new(2));
    // ip2 only points at host1, nothing flows backwards.
    assert_eq!(h.level(ip2.reference()), ScanLevel::L0);
}

#[test]
fn test_relation_level_caps() {
    let mut config = EngineConfig::default();
    config.propagation.rules = vec![PropagationRule {
        relation: "certificate_for".to_string(),
        max_issue: Some(ScanLevel::new(1)),
        max_inherit: Some(ScanLevel::L0),
        ..PropagationRule::default()
    }];
    let h = Harness::new(config);

    let host1 = host("host1");
    let host2 = host("host2");
    let ip1 = ip("192.0.2.1");
    let ip2 = ip("192.0.2.2");
    h.ingest(
        &observation("A", minutes_ago(30))
            .with_object(host1.clone())
            .with_object(host2.clone())
            .with_object(ip1.clone())
            .with_object(ip2.clone())
            .with_edge(edge(&host1, "certificate_for", &ip1))
            .with_edge(edge(&ip2, "certificate_for", &host2)),
    );
    h.ingest(&declare(host1.reference(), 3, minutes_ago(20)));
    h.ingest(&declare(host2.reference(), 4, minutes_ago(20)));

    // Issued forward at most L1, nothing inherited backward.
    assert_eq!(h.level(ip1.reference()), ScanLevel::new(1));
    assert_eq!(h.level(ip2.reference()), ScanLevel::L0);
    assert_eq!(h.level(host1.reference()), ScanLevel::new(3));
}

#[test]
fn test_hop_limit() {
    let mut config = EngineConfig::default();
    config.propagation.max_depth = 2;
    let h = Harness::new(config);

    let chain: Vec<Object> = (0..4).map(|i| host(&format!("h{i}"))).collect();
    let mut run = observation("A", minutes_ago(30));
    for object in &chain {
        run = run.with_object(object.clone());
    }
    for pair in chain.windows(2) {
        run = run.with_edge(edge(&pair[0], "link", &pair[1]));
    }
    h.ingest(&run);
    h.ingest(&declare(chain[0].reference(), 2, minutes_ago(20)));

    assert_eq!(h.level(chain[1].reference()), ScanLevel::new(2));
    assert_eq!(h.level(chain[2].reference()), ScanLevel::new(2));
    assert_eq!(h.level(chain[3].reference()), ScanLevel::L0);
}

#[test]
fn test_highest_reaching_level_wins() {
    let h = Harness::new(EngineConfig::default());
    let low = host("low");
    let high = host("high");
    let shared = ip("192.0.2.9");

    h.ingest(
        &observation("A", minutes_ago(30))
            .with_object(low.clone())
            .with_object(high.clone())
            .with_object(shared.clone())
            .with_edge(edge(&low, "resolves_to", &shared))
            .with_edge(edge(&high, "resolves_to", &shared)),
    );
    h.ingest(&declare(low.reference(), 1, minutes_ago(25)));
    h.ingest(&declare(high.reference(), 4, minutes_ago(20)));
    assert_eq!(h.level(shared.reference()), ScanLevel::new(4));

    // Removing the higher declaration falls back to the lower one.
    let retired = h
        .engine
        .retire_origin(&OriginId::new(format!("declaration|{}", high.reference())), minutes_ago(10))
        .unwrap();
    assert!(h.engine.await_flush(retired.transaction_id.unwrap(), WAIT));
    assert_eq!(h.level(shared.reference()), ScanLevel::new(1));
    assert_eq!(h.level(high.reference()), ScanLevel::new(1));
}

#[test]
fn test_backdated_declaration_reaches_later_edges() {
    let h = Harness::new(EngineConfig::default());
    let a = host("a");
    let b = host("b");
    h.ingest(&observation("seed", minutes_ago(30)).with_object(a.clone()));
    h.ingest(
        &observation("dns", minutes_ago(10))
            .with_object(a.clone())
            .with_object(b.clone())
            .with_edge(edge(&a, "resolves", &b)),
    );
    assert_eq!(h.level(b.reference()), ScanLevel::L0);

    // Declared at a time before the edge existed.
    let tx = h.ingest(&declare(a.reference(), 3, minutes_ago(20)));
    assert_eq!(h.level(a.reference()), ScanLevel::new(3));
    assert_eq!(h.level(b.reference()), ScanLevel::new(3));

    let at_declaration = h
        .engine
        .scan_profile_at(b.reference(), minutes_ago(15))
        .unwrap();
    assert!(at_declaration.is_none());

    let changed: Vec<DeltaKind> = h.messages(MUTATIONS, tx).iter().map(|m| m.kind).collect();
    assert_eq!(changed, vec![DeltaKind::Declared, DeltaKind::Inherited]);
}

