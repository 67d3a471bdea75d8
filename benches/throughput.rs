//! Throughput Benchmark for FlashMC
//!
//! This benchmark measures the performance of the command layer, the text
//! protocol and the expiration sweep under various workloads.

use bytes::{Buf, Bytes};
use criterion::{black_box, criterion_group, criterion_main, Criterion, Throughput};
use flashmc::commands::{ArithOp, CommandHandler, StoreMode};
use flashmc::connection::ConnectionState;
use flashmc::protocol::{ParseOutcome, Protocol, TextProtocol};
use flashmc::service::Service;
use flashmc::storage::{expire_batch, StorageEngine};
use std::sync::Arc;
use std::time::Duration;

const SPACE: u32 = 512;

fn handler() -> CommandHandler {
    let store = Arc::new(StorageEngine::new());
    store.create_space(SPACE, "bench").unwrap();
    CommandHandler::new(Service::new("bench", SPACE, store))
}

fn set(handler: &CommandHandler, key: Bytes, value: Bytes, exptime: i64) {
    handler
        .store(StoreMode::Set, key, value, 0, exptime)
        .unwrap();
}

/// Benchmark SET operations
fn bench_set(c: &mut Criterion) {
    let handler = handler();

    let mut group = c.benchmark_group("set");
    group.throughput(Throughput::Elements(1));

    group.bench_function("set_small", |b| {
        let mut i = 0u64;
        b.iter(|| {
            let key = Bytes::from(format!("key:{}", i));
            set(&handler, key, Bytes::from("small_value"), 0);
            i += 1;
        });
    });

    group.bench_function("set_medium", |b| {
        let mut i = 0u64;
        let value = Bytes::from("x".repeat(1024)); // 1KB value
        b.iter(|| {
            let key = Bytes::from(format!("key:{}", i));
            set(&handler, key, value.clone(), 0);
            i += 1;
        });
    });

    group.bench_function("set_large", |b| {
        let mut i = 0u64;
        let value = Bytes::from("x".repeat(64 * 1024)); // 64KB value
        b.iter(|| {
            let key = Bytes::from(format!("key:{}", i % 1_000));
            set(&handler, key, value.clone(), 0);
            i += 1;
        });
    });

    group.finish();
}

/// Benchmark GET operations
fn bench_get(c: &mut Criterion) {
    let handler = handler();

    // Pre-populate with data
    for i in 0..100_000 {
        let key = Bytes::from(format!("key:{}", i));
        let value = Bytes::from(format!("value:{}", i));
        set(&handler, key, value, 0);
    }

    let mut group = c.benchmark_group("get");
    group.throughput(Throughput::Elements(1));

    group.bench_function("get_existing", |b| {
        let mut i = 0u64;
        b.iter(|| {
            let key = format!("key:{}", i % 100_000);
            black_box(handler.get(key.as_bytes()).unwrap());
            i += 1;
        });
    });

    group.bench_function("get_missing", |b| {
        let mut i = 0u64;
        b.iter(|| {
            let key = format!("missing:{}", i);
            black_box(handler.get(key.as_bytes()).unwrap());
            i += 1;
        });
    });

    group.finish();
}

/// Benchmark INCR operations
fn bench_incr(c: &mut Criterion) {
    let handler = handler();

    let mut group = c.benchmark_group("incr");
    group.throughput(Throughput::Elements(1));

    group.bench_function("single_counter", |b| {
        let key = Bytes::from("counter");
        b.iter(|| {
            black_box(
                handler
                    .arith(ArithOp::Incr, key.clone(), 1, Some((0, 0)))
                    .unwrap(),
            );
        });
    });

    group.bench_function("multiple_counters", |b| {
        let mut i = 0u64;
        b.iter(|| {
            let key = Bytes::from(format!("counter:{}", i % 1000));
            black_box(handler.arith(ArithOp::Incr, key, 1, Some((0, 0))).unwrap());
            i += 1;
        });
    });

    group.finish();
}

/// Benchmark concurrent access
fn bench_concurrent(c: &mut Criterion) {
    use std::thread;

    let mut group = c.benchmark_group("concurrent");
    group.measurement_time(Duration::from_secs(10));

    group.bench_function("4_threads_mixed", |b| {
        b.iter(|| {
            let handler = handler();
            let handles: Vec<_> = (0..4)
                .map(|t| {
                    let handler = handler.clone();
                    thread::spawn(move || {
                        for i in 0..10_000 {
                            let key = Bytes::from(format!("key:{}:{}", t, i));
                            set(&handler, key.clone(), Bytes::from("value"), 0);
                            let _ = handler.get(&key);
                        }
                    })
                })
                .collect();

            for handle in handles {
                handle.join().unwrap();
            }

            black_box(handler.service().store().len(SPACE).unwrap());
        });
    });

    group.finish();
}

/// Benchmark pipelined text requests through the protocol layer
fn bench_text_protocol(c: &mut Criterion) {
    let handler = handler();
    set(&handler, Bytes::from("name"), Bytes::from("Ariz"), 0);

    let mut batch = Vec::new();
    for _ in 0..20 {
        batch.extend_from_slice(b"set name 0 0 4\r\nAriz\r\nget name\r\n");
    }

    let mut group = c.benchmark_group("text_protocol");
    group.throughput(Throughput::Elements(40));

    group.bench_function("set_get_pipeline", |b| {
        let mut protocol = TextProtocol::new(handler.clone());
        let mut con = ConnectionState::new(Arc::clone(handler.service()));
        b.iter(|| {
            con.input.extend_from_slice(&batch);
            while !con.input.is_empty() {
                con.reset_request_flags();
                match protocol.parse_request(&mut con) {
                    Ok(ParseOutcome::Complete) => protocol.process_request(&mut con).unwrap(),
                    other => panic!("unexpected parse result: {:?}", other),
                }
                con.input.advance(con.pending);
            }
            black_box(con.output.take_chunks());
        });
    });

    group.finish();
}

/// Benchmark expiration batches
fn bench_expiry(c: &mut Criterion) {
    let mut group = c.benchmark_group("expiry");

    group.bench_function("set_with_exptime", |b| {
        let handler = handler();
        let mut i = 0u64;
        b.iter(|| {
            let key = Bytes::from(format!("key:{}", i));
            set(&handler, key, Bytes::from("value"), 3600);
            i += 1;
        });
    });

    group.bench_function("sweep_live_batch", |b| {
        let handler = handler();
        for i in 0..10_000 {
            let key = Bytes::from(format!("live:{}", i));
            set(&handler, key, Bytes::from("value"), 3600);
        }

        let service = Arc::clone(handler.service());
        let mut cursor = None;
        b.iter(|| {
            cursor = expire_batch(&service, cursor.take(), 50).unwrap();
        });
    });

    group.finish();
}

criterion_group!(
    benches,
    bench_set,
    bench_get,
    bench_incr,
    bench_concurrent,
    bench_text_protocol,
    bench_expiry,
);

criterion_main!(benches);
