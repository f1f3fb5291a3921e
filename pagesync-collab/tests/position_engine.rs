//! Position engine properties: contiguity after arbitrary mutation
//! sequences, optimistic locking, concurrent moves and drift recovery.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use pagesync_collab::{
    EngineConfig, EngineError, GroupWrite, ItemStore, MemoryStore, PositionEngine, RocksStore,
    StoreConfig, StoreError,
};
use pagesync_core::{
    EventKind, GroupKey, InvariantViolation, ItemKind, MoveTarget, MutationReply,
    MutationRequest, PositionedItem, StaticIdentity,
};
use serde_json::{json, Map};

fn main_group() -> GroupKey {
    GroupKey::new("home", "main")
}

fn editor() -> StaticIdentity {
    StaticIdentity::user("u1")
}

fn insert_request(group: &GroupKey, id: &str, position: u32) -> MutationRequest {
    MutationRequest::Insert {
        group: group.clone(),
        position,
        kind: ItemKind::Component,
        item_type: "text".into(),
        payload: Map::new(),
        item_id: Some(id.into()),
    }
}

async fn seed(engine: &PositionEngine, group: &GroupKey, count: u32) {
    for i in 0..count {
        engine
            .apply(&editor(), insert_request(group, &format!("c{i}"), i))
            .await
            .unwrap();
    }
}

fn orders(engine: &PositionEngine, group: &GroupKey) -> Vec<(String, u32)> {
    engine
        .fetch_group(group)
        .unwrap()
        .into_iter()
        .map(|item| (item.id, item.order))
        .collect()
}

fn version(engine: &PositionEngine, id: &str) -> u64 {
    engine.get_item(id).unwrap().unwrap().version
}

fn memory_engine() -> PositionEngine {
    PositionEngine::new(Arc::new(MemoryStore::new()), EngineConfig::default())
}

#[tokio::test]
async fn test_insert_into_middle_shifts_tail() {
    let engine = memory_engine();
    let group = main_group();
    seed(&engine, &group, 5).await;

    let outcome = engine
        .apply(&editor(), insert_request(&group, "new", 2))
        .await
        .unwrap();
    assert_eq!(outcome.items[0].order, 2);
    assert_eq!(outcome.event.kind, EventKind::ComponentAdd);
    assert_eq!(outcome.event.data["position"], 2);

    let shifted: Vec<_> = outcome.items[1..]
        .iter()
        .map(|item| (item.id.as_str(), item.order))
        .collect();
    assert_eq!(shifted, vec![("c2", 3), ("c3", 4), ("c4", 5)]);
    assert_eq!(
        orders(&engine, &group),
        vec![
            ("c0".to_string(), 0),
            ("c1".to_string(), 1),
            ("new".to_string(), 2),
            ("c2".to_string(), 3),
            ("c3".to_string(), 4),
            ("c4".to_string(), 5),
        ]
    );
    engine.verify_group(&group).unwrap();
}

#[tokio::test]
async fn test_orders_stay_contiguous_under_mixed_mutations() {
    let engine = memory_engine();
    let main = main_group();
    let side = GroupKey::new("home", "side");
    seed(&engine, &main, 4).await;

    // Deterministic linear congruential sequence
    let mut state: u64 = 0x2545_f491;
    let mut next = |bound: u64| {
        state = state.wrapping_mul(6_364_136_223_846_793_005).wrapping_add(1);
        (state >> 33) % bound.max(1)
    };

    for step in 0..150u64 {
        let group = if next(2) == 0 { &main } else { &side };
        let items = engine.fetch_group(group).unwrap();
        let request = match next(4) {
            0 => insert_request(group, &format!("n{step}"), next(items.len() as u64 + 3) as u32),
            _ if items.is_empty() => continue,
            1 => {
                let item = &items[next(items.len() as u64) as usize];
                let target = if next(3) == 0 {
                    Some(MoveTarget {
                        section_id: if group == &main { "side" } else { "main" }.into(),
                        parent_id: None,
                    })
                } else {
                    None
                };
                MutationRequest::Move {
                    item_id: item.id.clone(),
                    expected_version: item.version,
                    target,
                    position: next(items.len() as u64 + 2) as u32,
                }
            }
            2 => {
                let item = &items[next(items.len() as u64) as usize];
                MutationRequest::Delete {
                    item_id: item.id.clone(),
                    expected_version: item.version,
                }
            }
            _ => {
                let item = &items[next(items.len() as u64) as usize];
                let mut patch = Map::new();
                patch.insert("step".into(), json!(step));
                MutationRequest::Update {
                    item_id: item.id.clone(),
                    expected_version: item.version,
                    patch,
                }
            }
        };
        engine.apply(&editor(), request).await.unwrap();
        engine.verify_group(&main).unwrap();
        engine.verify_group(&side).unwrap();
    }
}

#[tokio::test]
async fn test_stale_version_changes_nothing() {
    let engine = memory_engine();
    let group = main_group();
    seed(&engine, &group, 3).await;
    engine
        .apply(
            &editor(),
            MutationRequest::Move {
                item_id: "c0".into(),
                expected_version: 1,
                target: None,
                position: 2,
            },
        )
        .await
        .unwrap();
    let before = orders(&engine, &group);

    let err = engine
        .apply(
            &editor(),
            MutationRequest::Delete {
                item_id: "c0".into(),
                expected_version: 1,
            },
        )
        .await
        .unwrap_err();
    match err {
        EngineError::Conflict(conflict) => {
            assert_eq!(conflict.current_version(), 2);
            assert_eq!(conflict.current.order, 2);
        }
        other => panic!("unexpected {other:?}"),
    }
    assert_eq!(orders(&engine, &group), before);
    assert_eq!(version(&engine, "c0"), 2);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_concurrent_moves_one_conflicts() {
    let engine = Arc::new(memory_engine());
    let group = main_group();
    seed(&engine, &group, 5).await;

    let spawn_move = |position: u32| {
        let engine = engine.clone();
        tokio::spawn(async move {
            engine
                .apply(
                    &editor(),
                    MutationRequest::Move {
                        item_id: "c1".into(),
                        expected_version: 1,
                        target: None,
                        position,
                    },
                )
                .await
        })
    };
    let first = spawn_move(4);
    let second = spawn_move(0);
    let results = [first.await.unwrap(), second.await.unwrap()];

    let applied = results.iter().filter(|r| r.is_ok()).count();
    assert_eq!(applied, 1);
    let conflict = results
        .iter()
        .find_map(|r| match r {
            Err(EngineError::Conflict(conflict)) => Some(conflict.clone()),
            _ => None,
        })
        .expect("one move must conflict");
    assert_eq!(conflict.expected_version, 1);
    assert_eq!(conflict.current_version(), 2);
    assert_eq!(version(&engine, "c1"), 2);
    engine.verify_group(&group).unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_inserts_and_moves_stay_contiguous() {
    let engine = Arc::new(memory_engine());
    let main = main_group();
    let side = GroupKey::new("home", "side");
    seed(&engine, &main, 4).await;

    let mut tasks = Vec::new();
    for i in 0..40u32 {
        let engine = engine.clone();
        let group = if i % 2 == 0 { main.clone() } else { side.clone() };
        tasks.push(tokio::spawn(async move {
            engine
                .apply(&editor(), insert_request(&group, &format!("n{i}"), (i * 7) % 13))
                .await
        }));
    }
    // Seeded items hop between the two groups while inserts land
    for i in 0..4u32 {
        let engine = engine.clone();
        tasks.push(tokio::spawn(async move {
            engine
                .apply(
                    &editor(),
                    MutationRequest::Move {
                        item_id: format!("c{i}"),
                        expected_version: 1,
                        target: Some(MoveTarget {
                            section_id: "side".into(),
                            parent_id: None,
                        }),
                        position: i,
                    },
                )
                .await
        }));
    }
    for task in tasks {
        task.await.unwrap().unwrap();
    }

    engine.verify_group(&main).unwrap();
    engine.verify_group(&side).unwrap();
    let main_orders = orders(&engine, &main);
    let side_orders = orders(&engine, &side);
    assert_eq!(main_orders.len(), 20);
    assert_eq!(side_orders.len(), 24);
    for (expected, (_, order)) in side_orders.iter().enumerate() {
        assert_eq!(*order, expected as u32);
    }
}

#[tokio::test]
async fn test_cross_group_move_closes_gap_and_opens_slot() {
    let engine = memory_engine();
    let main = main_group();
    let side = GroupKey::new("home", "side");
    seed(&engine, &main, 4).await;
    for i in 0..2 {
        engine
            .apply(&editor(), insert_request(&side, &format!("s{i}"), i))
            .await
            .unwrap();
    }

    let outcome = engine
        .apply(
            &editor(),
            MutationRequest::Move {
                item_id: "c1".into(),
                expected_version: 1,
                target: Some(MoveTarget {
                    section_id: "side".into(),
                    parent_id: None,
                }),
                position: 1,
            },
        )
        .await
        .unwrap();
    assert_eq!(outcome.event.data["oldPosition"], 1);
    assert_eq!(outcome.event.data["newPosition"], 1);
    assert_eq!(outcome.event.data["fromSectionId"], "main");

    let main_ids: Vec<_> = orders(&engine, &main).into_iter().map(|(id, _)| id).collect();
    let side_ids: Vec<_> = orders(&engine, &side).into_iter().map(|(id, _)| id).collect();
    assert_eq!(main_ids, vec!["c0", "c2", "c3"]);
    assert_eq!(side_ids, vec!["s0", "c1", "s1"]);
    engine.verify_group(&main).unwrap();
    engine.verify_group(&side).unwrap();

    let moved = engine.get_item("c1").unwrap().unwrap();
    assert_eq!(moved.page_id, "home");
    assert_eq!(moved.version, 2);
}

#[tokio::test]
async fn test_delete_is_soft_and_closes_gap() {
    let engine = memory_engine();
    let group = main_group();
    seed(&engine, &group, 3).await;

    let outcome = engine
        .apply(
            &editor(),
            MutationRequest::Delete {
                item_id: "c0".into(),
                expected_version: 1,
            },
        )
        .await
        .unwrap();
    assert_eq!(outcome.event.kind, EventKind::ComponentDelete);
    assert_eq!(outcome.event.data["position"], 0);

    let deleted = engine.get_item("c0").unwrap().unwrap();
    assert!(!deleted.is_active);
    assert_eq!(
        orders(&engine, &group),
        vec![("c1".to_string(), 0), ("c2".to_string(), 1)]
    );

    let again = engine
        .apply(
            &editor(),
            MutationRequest::Delete {
                item_id: "c0".into(),
                expected_version: 2,
            },
        )
        .await
        .unwrap_err();
    assert!(matches!(again, EngineError::Inactive(_)));
}

#[tokio::test]
async fn test_reorder_requires_exact_set() {
    let engine = memory_engine();
    let group = main_group();
    seed(&engine, &group, 3).await;
    let admin = StaticIdentity::admin("root");
    let reorder = |ids: &[&str]| MutationRequest::Reorder {
        group: group.clone(),
        ordered_ids: ids.iter().map(|id| id.to_string()).collect(),
    };

    let err = engine.apply(&admin, reorder(&["c2", "c0"])).await.unwrap_err();
    assert!(matches!(
        err,
        EngineError::Invariant(InvariantViolation::MissingIds { ref ids, .. }) if ids == &["c1"]
    ));
    let err = engine
        .apply(&admin, reorder(&["c2", "c0", "c1", "zz"]))
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::Invariant(InvariantViolation::ForeignIds { .. })));
    let err = engine
        .apply(&admin, reorder(&["c2", "c0", "c0", "c1"]))
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::Invariant(InvariantViolation::DuplicateIds { .. })));

    let outcome = engine.apply(&admin, reorder(&["c2", "c0", "c1"])).await.unwrap();
    assert!(outcome.event.is_batched());
    assert_eq!(outcome.event.data.as_array().map(Vec::len), Some(3));
    assert_eq!(
        orders(&engine, &group),
        vec![
            ("c2".to_string(), 0),
            ("c0".to_string(), 1),
            ("c1".to_string(), 2)
        ]
    );
    assert!(["c0", "c1", "c2"].iter().all(|id| version(&engine, id) == 2));
}

#[tokio::test]
async fn test_authorization_rules() {
    let engine = memory_engine();
    let group = main_group();

    let err = engine
        .apply(&StaticIdentity::anonymous(), insert_request(&group, "c0", 0))
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::Authorization(_)));

    let nav = MutationRequest::Insert {
        group: GroupKey::new("home", "header"),
        position: 0,
        kind: ItemKind::Navigation,
        item_type: "link".into(),
        payload: Map::new(),
        item_id: Some("nav-1".into()),
    };
    let err = engine.apply(&editor(), nav.clone()).await.unwrap_err();
    assert!(matches!(err, EngineError::Authorization(_)));

    let outcome = engine.apply(&StaticIdentity::admin("root"), nav).await.unwrap();
    assert_eq!(outcome.event.kind, EventKind::NavUpdate);
    assert_eq!(outcome.event.data["changeType"], "update");

    seed(&engine, &group, 2).await;
    let err = engine
        .apply(
            &editor(),
            MutationRequest::Reorder {
                group: group.clone(),
                ordered_ids: vec!["c1".into(), "c0".into()],
            },
        )
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::Authorization(_)));
    assert!(matches!(
        err.into_reply(),
        MutationReply::Rejected { .. }
    ));
}

/// Bumps a sibling's version behind the engine's back before each of the
/// first `drifts` commits.
struct DriftingStore {
    inner: MemoryStore,
    victim: String,
    drifts: AtomicUsize,
}

impl ItemStore for DriftingStore {
    fn fetch_group(&self, group: &GroupKey) -> Result<Vec<PositionedItem>, StoreError> {
        self.inner.fetch_group(group)
    }

    fn get_item(&self, id: &str) -> Result<Option<PositionedItem>, StoreError> {
        self.inner.get_item(id)
    }

    fn commit(&self, write: GroupWrite) -> Result<(), StoreError> {
        let remaining = self.drifts.load(Ordering::SeqCst);
        if remaining > 0 {
            self.drifts.store(remaining - 1, Ordering::SeqCst);
            if let Some(mut victim) = self.inner.get_item(&self.victim)? {
                victim.version += 1;
                self.inner.put_unchecked(victim);
            }
        }
        self.inner.commit(write)
    }
}

async fn drifting_engine(drifts: usize) -> (PositionEngine, Arc<DriftingStore>) {
    let store = Arc::new(DriftingStore {
        inner: MemoryStore::new(),
        victim: "c2".into(),
        drifts: AtomicUsize::new(0),
    });
    let engine = PositionEngine::new(store.clone(), EngineConfig::default());
    seed(&engine, &main_group(), 3).await;
    store.drifts.store(drifts, Ordering::SeqCst);
    (engine, store)
}

#[tokio::test]
async fn test_drift_is_retried() {
    let (engine, store) = drifting_engine(2).await;
    engine
        .apply(&editor(), insert_request(&main_group(), "front", 0))
        .await
        .unwrap();
    assert_eq!(store.drifts.load(Ordering::SeqCst), 0);
    engine.verify_group(&main_group()).unwrap();
    assert_eq!(engine.get_item("c2").unwrap().unwrap().order, 3);
}

#[tokio::test]
async fn test_persistent_drift_gives_up() {
    let (engine, _) = drifting_engine(usize::MAX).await;
    let err = engine
        .apply(&editor(), insert_request(&main_group(), "front", 0))
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::Drift { attempts: 4, .. }));
    assert!(engine.get_item("front").unwrap().is_none());
    engine.verify_group(&main_group()).unwrap();
}

#[tokio::test]
async fn test_rocks_store_keeps_orders_across_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let group = main_group();
    {
        let store = Arc::new(RocksStore::open(StoreConfig::for_testing(dir.path())).unwrap());
        let engine = PositionEngine::new(store, EngineConfig::default());
        seed(&engine, &group, 4).await;
        engine
            .apply(
                &editor(),
                MutationRequest::Move {
                    item_id: "c3".into(),
                    expected_version: 1,
                    target: None,
                    position: 0,
                },
            )
            .await
            .unwrap();
    }

    let store = Arc::new(RocksStore::open(StoreConfig::for_testing(dir.path())).unwrap());
    let engine = PositionEngine::new(store, EngineConfig::default());
    let ids: Vec<_> = orders(&engine, &group).into_iter().map(|(id, _)| id).collect();
    assert_eq!(ids, vec!["c3", "c0", "c1", "c2"]);
    engine.verify_group(&group).unwrap();
}
