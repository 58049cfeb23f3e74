//! # Wire Codec Benchmark
//!
//! Measures what the broadcast tick pays per `state` frame:
//! - Encoding a snapshot, plain and compressed
//! - Decoding it again on the client
//! - Splitting a burst of frames out of one read
//!
//! Run with: `cargo bench --package tether_net`

// Benchmarks don't need strict docs
#![allow(missing_docs)]

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};

use tether_net::{decode, encode, FrameBuffer, Message, ObjectState, Vec2};

fn snapshot(count: u64) -> Message {
    let objects = (0..count)
        .map(|i| {
            let t = i as f64 * 0.37;
            ObjectState::at_rest(i + 1, Vec2::new(t.cos() * 40.0, t.sin() * 40.0), t)
                .with_velocity(Vec2::new(-t.sin(), t.cos()), 0.5)
        })
        .collect();
    Message::State { objects, ts: 123_456 }
}

/// Benchmark: encoding a snapshot at several world sizes.
fn bench_encode(c: &mut Criterion) {
    let mut group = c.benchmark_group("encode_state");

    for count in [16, 256, 2048] {
        let msg = snapshot(count);
        group.throughput(Throughput::Elements(count));
        group.bench_with_input(BenchmarkId::new("plain", count), &msg, |b, msg| {
            b.iter(|| black_box(encode(msg, false)));
        });
        group.bench_with_input(BenchmarkId::new("lz4", count), &msg, |b, msg| {
            b.iter(|| black_box(encode(msg, true)));
        });
    }

    group.finish();
}

/// Benchmark: decoding what the host sent.
fn bench_decode(c: &mut Criterion) {
    let mut group = c.benchmark_group("decode_state");

    for count in [16, 256, 2048] {
        let msg = snapshot(count);
        let Ok(plain) = encode(&msg, false) else {
            continue;
        };
        let Ok(packed) = encode(&msg, true) else {
            continue;
        };
        group.throughput(Throughput::Elements(count));
        group.bench_with_input(BenchmarkId::new("plain", count), &plain, |b, bytes| {
            b.iter(|| black_box(decode(bytes)));
        });
        group.bench_with_input(BenchmarkId::new("lz4", count), &packed, |b, bytes| {
            b.iter(|| black_box(decode(bytes)));
        });
    }

    group.finish();
}

/// Benchmark: one read carrying a burst of small frames.
fn bench_frame_buffer(c: &mut Criterion) {
    let mut burst = Vec::new();
    for t in 0..64 {
        if let Ok(line) = encode(&Message::Ping { t }, false) {
            burst.extend_from_slice(&line);
        }
    }

    c.bench_function("frame_buffer_64_pings", |b| {
        let mut buffer = FrameBuffer::new(1024 * 1024);
        b.iter(|| black_box(buffer.extend(&burst)));
    });
}

criterion_group!(benches, bench_encode, bench_decode, bench_frame_buffer);
criterion_main!(benches);
