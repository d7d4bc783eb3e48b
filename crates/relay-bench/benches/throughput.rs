//! Throughput benchmarks for Relay.
//!
//! These benchmarks measure the raw message throughput of the codec, the
//! channel registry and gateway fan-out over in-process transports.

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use relay_protocol::{codec, Frame, Message, OfflinePolicy};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tenvis_relay_core::{Channel, ChannelConfig, ChannelRegistry};
use tenvis_relay_gateway::{Gateway, GatewayConfig};
use tenvis_relay_transport::{MemorySocketDialer, WebSocketConfig, WebSocketFactory};
use tokio::runtime::Runtime;

fn publish_frame(size: usize) -> Frame {
    Frame::publish(Message::new("test:channel", vec![0u8; size]))
}

/// Benchmark frame encoding.
fn bench_encode(c: &mut Criterion) {
    let mut group = c.benchmark_group("encode");

    for (label, size) in [("64B", 64), ("1KB", 1024), ("64KB", 65536)] {
        let frame = publish_frame(size);
        group.throughput(Throughput::Bytes(size as u64));
        group.bench_function(label, |b| b.iter(|| codec::encode(black_box(&frame))));
    }

    group.finish();
}

/// Benchmark frame decoding.
fn bench_decode(c: &mut Criterion) {
    let mut group = c.benchmark_group("decode");

    for (label, size) in [("64B", 64), ("1KB", 1024), ("64KB", 65536)] {
        let encoded = codec::encode(&publish_frame(size)).unwrap();
        group.throughput(Throughput::Bytes(encoded.len() as u64));
        group.bench_function(label, |b| b.iter(|| codec::decode(black_box(&encoded))));
    }

    group.finish();
}

/// Benchmark registry operations.
fn bench_registry(c: &mut Criterion) {
    let mut group = c.benchmark_group("registry");

    group.bench_function("subscribe", |b| {
        let registry = ChannelRegistry::new();
        let mut i = 0u64;
        b.iter(|| {
            let channel = format!("channel:{}", i);
            let conn = format!("conn:{}", i);
            i += 1;
            let _ = registry.subscribe(&channel, &conn);
        });
    });

    for subscribers in [1, 100, 1000] {
        group.bench_function(format!("publish_{}_sub", subscribers), |b| {
            let registry = ChannelRegistry::new();
            for i in 0..subscribers {
                let _ = registry.subscribe("test", &format!("conn-{}", i));
            }
            let message = Arc::new(Message::new("test", vec![0u8; 64]));

            b.iter(|| registry.publish(black_box(Arc::clone(&message))));
        });
    }

    group.finish();
}

/// Benchmark channel operations.
fn bench_channel(c: &mut Criterion) {
    let mut group = c.benchmark_group("channel");

    group.bench_function("subscribe", |b| {
        let mut channel = Channel::new("test");
        let mut i = 0u64;
        b.iter(|| {
            let conn = format!("conn-{}", i);
            i += 1;
            channel.subscribe(conn)
        });
    });

    group.bench_function("publish", |b| {
        let mut channel = Channel::new("test");
        channel.subscribe("conn-1");
        let message = Arc::new(Message::new("test", vec![0u8; 64]));

        b.iter(|| channel.publish(black_box(Arc::clone(&message))));
    });

    // Buffer stays at capacity, so every publish also evicts.
    group.bench_function("publish_queue_full", |b| {
        let config = ChannelConfig::default()
            .with_max_buffer_size(1000)
            .with_offline(OfflinePolicy::queue());
        let mut channel = Channel::with_config("test", config);
        let message = Arc::new(Message::new("test", vec![0u8; 64]));
        for _ in 0..1000 {
            channel.publish(Arc::clone(&message));
        }

        b.iter(|| channel.publish(black_box(Arc::clone(&message))));
    });

    group.finish();
}

/// Gateway with `size` connections subscribed to "broadcast".
fn fanout_gateway(rt: &Runtime, size: usize) -> (Gateway, MemorySocketDialer) {
    let dialer = MemorySocketDialer::new();
    let ws = WebSocketConfig {
        heartbeat_interval: Duration::ZERO,
        ..WebSocketConfig::default()
    };
    let gateway = Gateway::new(
        GatewayConfig::default(),
        WebSocketFactory::new(ws, Arc::new(dialer.clone())),
    );

    rt.block_on(async {
        for _ in 0..size {
            let id = gateway.connect(None, None).await.unwrap();
            gateway.subscribe(&id, "broadcast").unwrap();
        }
    });
    (gateway, dialer)
}

/// Benchmark fan-out scenarios through the gateway.
fn bench_fanout(c: &mut Criterion) {
    let rt = Runtime::new().unwrap();
    let mut group = c.benchmark_group("fanout");

    for size in [10, 100, 1000].iter() {
        group.throughput(Throughput::Elements(*size as u64));
        group.bench_with_input(BenchmarkId::from_parameter(size), size, |b, &size| {
            let (gateway, dialer) = fanout_gateway(&rt, size);
            let message = Message::new("broadcast", vec![0u8; 64]);

            b.iter_custom(|iters| {
                let mut elapsed = Duration::ZERO;
                for _ in 0..iters {
                    let start = Instant::now();
                    rt.block_on(gateway.broadcast(black_box(message.clone())))
                        .unwrap();
                    elapsed += start.elapsed();
                    dialer.clear_sent();
                }
                elapsed
            });

            rt.block_on(gateway.disconnect_all());
        });
    }

    group.finish();
}

criterion_group!(
    benches,
    bench_encode,
    bench_decode,
    bench_registry,
    bench_channel,
    bench_fanout,
);
criterion_main!(benches);
