use std::hint::black_box;
use std::sync::Arc;
use std::time::{Duration, Instant};

use criterion::{criterion_group, criterion_main, BatchSize, Criterion};
use pagesync_collab::{EngineConfig, Frame, MemoryStore, OutboundQueue, PositionEngine};
use pagesync_core::{
    sanitize, validate, ContentChange, GroupKey, ItemKind, MutationRequest, RealtimeEvent,
    StaticIdentity,
};
use serde_json::{json, Map};

fn edit(key: &str, value: &str) -> RealtimeEvent {
    RealtimeEvent::content_change(
        "home",
        "u1",
        1,
        &ContentChange {
            content_key: key.to_string(),
            old_value: None,
            new_value: json!(value),
            content_type: "text".into(),
        },
    )
}

fn bench_queue_push(c: &mut Criterion) {
    let events: Vec<_> = (0..100).map(|i| edit(&format!("k{i}"), "v")).collect();

    c.bench_function("queue_push_100_distinct", |b| {
        b.iter(|| {
            let mut queue = OutboundQueue::new(100, Duration::ZERO, false);
            for event in &events {
                black_box(queue.push(event.clone()));
            }
        })
    });
}

fn bench_queue_coalesce(c: &mut Criterion) {
    let event = edit("hero.title", "typing");

    c.bench_function("queue_coalesce_100_same_key", |b| {
        b.iter(|| {
            let mut queue = OutboundQueue::new(100, Duration::from_millis(50), true);
            let now = Instant::now();
            for _ in 0..100 {
                black_box(queue.push_at(event.clone(), now));
            }
        })
    });
}

fn bench_validate_sanitize(c: &mut Criterion) {
    let event = edit(
        "hero.body",
        "<p onclick=\"steal()\">Hello <script>alert(1)</script><a href=\"javascript:x\">link</a></p>",
    );

    c.bench_function("validate_and_sanitize", |b| {
        b.iter(|| {
            validate(black_box(&event)).unwrap();
            black_box(sanitize(&event));
        })
    });
}

fn bench_frame_codec(c: &mut Criterion) {
    let frame = Frame::Event {
        event: edit("hero.title", "Hello world"),
    };
    let encoded = frame.encode().unwrap();

    c.bench_function("frame_encode_event", |b| {
        b.iter(|| black_box(frame.encode().unwrap()))
    });
    c.bench_function("frame_decode_event", |b| {
        b.iter(|| black_box(Frame::decode(black_box(&encoded)).unwrap()))
    });
}

fn bench_engine(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();
    let identity = StaticIdentity::user("u1");
    let group = GroupKey::new("home", "main");
    let insert = |id: String, position: u32| MutationRequest::Insert {
        group: group.clone(),
        position,
        kind: ItemKind::Component,
        item_type: "text".into(),
        payload: Map::new(),
        item_id: Some(id),
    };

    c.bench_function("engine_insert_head_of_50", |b| {
        b.iter_batched(
            || {
                let engine = PositionEngine::new(Arc::new(MemoryStore::new()), EngineConfig::default());
                rt.block_on(async {
                    for i in 0..50 {
                        engine.apply(&identity, insert(format!("c{i}"), i)).await.unwrap();
                    }
                });
                engine
            },
            |engine| {
                rt.block_on(async {
                    black_box(engine.apply(&identity, insert("head".into(), 0)).await.unwrap());
                })
            },
            BatchSize::SmallInput,
        )
    });

    let engine = PositionEngine::new(Arc::new(MemoryStore::new()), EngineConfig::default());
    rt.block_on(async {
        for i in 0..50 {
            engine.apply(&identity, insert(format!("c{i}"), i)).await.unwrap();
        }
    });
    c.bench_function("engine_move_back_and_forth_50", |b| {
        let mut forward = true;
        b.iter(|| {
            let version = engine.get_item("c0").unwrap().unwrap().version;
            let position = if forward { 49 } else { 0 };
            forward = !forward;
            rt.block_on(async {
                black_box(
                    engine
                        .apply(
                            &identity,
                            MutationRequest::Move {
                                item_id: "c0".into(),
                                expected_version: version,
                                target: None,
                                position,
                            },
                        )
                        .await
                        .unwrap(),
                );
            })
        })
    });
}

criterion_group!(
    benches,
    bench_queue_push,
    bench_queue_coalesce,
    bench_validate_sanitize,
    bench_frame_codec,
    bench_engine,
);
criterion_main!(benches);
