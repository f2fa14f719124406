//! Performance benchmarks for parcel-engine

use parcel_engine::codec::{self, EncodeContext};
use parcel_engine::{
    BackendObject, Command, CommandDraft, FieldValue, IdentityRegistry, QueueState, Resolution,
    RetryPolicy,
};
use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use std::collections::BTreeMap;

fn sample_object(i: u64) -> BackendObject {
    BackendObject::without_data("GameScore", format!("score{}", i))
        .with("score", i)
        .with("playerName", "Sean Plott")
        .with("cheatMode", false)
        .with("tags", FieldValue::List(vec!["a".into(), "b".into()]))
        .with("avatar", vec![0u8; 256])
}

fn bench_codec(c: &mut Criterion) {
    let mut group = c.benchmark_group("codec");

    group.bench_function("encode_durable", |b| {
        let object = sample_object(1);
        b.iter(|| codec::encode(black_box(&object), EncodeContext::Durable))
    });

    group.bench_function("decode", |b| {
        let map = codec::encode(&sample_object(1), EncodeContext::Immediate).unwrap();
        b.iter(|| codec::decode(black_box(&map), Some("GameScore")))
    });

    group.bench_function("encode_nested_immediate", |b| {
        let mut object = sample_object(0);
        for i in 1..20 {
            object.set(format!("child{}", i), sample_object(i));
        }
        b.iter(|| codec::encode(black_box(&object), EncodeContext::Immediate))
    });

    group.finish();
}

fn bench_queue(c: &mut Criterion) {
    let mut group = c.benchmark_group("queue");

    group.bench_function("enqueue_merge", |b| {
        let mut queue = QueueState::new();
        let mut object = sample_object(1);
        let mut n = 0u64;
        b.iter(|| {
            n += 1;
            object.set("score", n);
            queue.enqueue(black_box(CommandDraft::save(&object)), n)
        })
    });

    for size in [100u64, 1_000, 10_000] {
        group.bench_with_input(BenchmarkId::new("drain", size), &size, |b, &size| {
            let mut queue = QueueState::new();
            for i in 0..size {
                let _ = queue.enqueue(CommandDraft::save(&sample_object(i)), i);
            }
            let policy = RetryPolicy::default();

            b.iter(|| {
                let mut queue = queue.clone();
                loop {
                    let ready = queue.next_ready(0, 64);
                    if ready.is_empty() {
                        break;
                    }
                    for command in ready {
                        queue.complete(command.id, Resolution::Committed { remote_id: None }, 0, &policy);
                    }
                }
                queue
            })
        });
    }

    group.bench_function("reload_log", |b| {
        let mut queue = QueueState::new();
        for i in 0..1_000 {
            let _ = queue.enqueue(CommandDraft::save(&sample_object(i)), i);
        }
        let log: Vec<Command> = queue.iter().map(|e| e.command.clone()).collect();
        b.iter(|| QueueState::from_log(black_box(log.clone()), 1))
    });

    group.finish();
}

fn bench_registry(c: &mut Criterion) {
    let mut group = c.benchmark_group("registry");

    group.bench_function("save_order_wide", |b| {
        let mut parent = BackendObject::new("Post");
        let children: BTreeMap<String, FieldValue> = (0..50)
            .map(|i| (format!("c{}", i), BackendObject::new("Comment").with("n", i).into()))
            .collect();
        for (name, child) in children {
            parent.set(name, child);
        }
        let registry = IdentityRegistry::new();
        b.iter(|| registry.save_order(black_box(&parent)).map(|order| order.len()))
    });

    group.finish();
}

fn bench_serialization(c: &mut Criterion) {
    let mut group = c.benchmark_group("serialization");

    group.bench_function("command_to_json", |b| {
        let mut queue = QueueState::new();
        let _ = queue.enqueue(CommandDraft::save(&sample_object(1)), 1);
        let command = queue.iter().next().map(|e| e.command.clone());
        b.iter(|| serde_json::to_string(black_box(&command)))
    });

    group.finish();
}

criterion_group!(
    benches,
    bench_codec,
    bench_queue,
    bench_registry,
    bench_serialization,
);
criterion_main!(benches);
