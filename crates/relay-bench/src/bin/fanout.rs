//! In-process fan-out throughput benchmark for Relay.
//!
//! Drives the gateway over loopback transports, so the numbers cover
//! routing, encoding and adapter bookkeeping but no network I/O.

use anyhow::Result;
use relay_protocol::Message;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tenvis_relay_gateway::{metrics, Gateway, GatewayConfig};
use tenvis_relay_transport::{MemorySocketDialer, WebSocketFactory};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

const CHANNEL: &str = "benchmark";
const WARMUP_SECS: u64 = 1;
const BENCH_SECS: u64 = 5;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "fanout=info,tenvis_relay_gateway=warn".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let args: Vec<String> = std::env::args().collect();
    let num_clients = args.get(1).and_then(|s| s.parse().ok()).unwrap_or(16);
    let payload_size = args.get(2).and_then(|s| s.parse().ok()).unwrap_or(64);

    let mut config = GatewayConfig::load()?;
    config.websocket.heartbeat_interval_ms = 0;
    metrics::init_metrics();

    println!("╔══════════════════════════════════════════════════════════════╗");
    println!("║         Relay In-Process Fan-out Benchmark                   ║");
    println!("╚══════════════════════════════════════════════════════════════╝");
    println!();

    let dialer = MemorySocketDialer::new();
    let factory = WebSocketFactory::new(config.websocket_config(), Arc::new(dialer.clone()));
    let gateway = Gateway::new(config, factory);

    let publisher = gateway.connect(None, None).await?;
    for _ in 0..num_clients {
        let id = gateway.connect(None, None).await?;
        gateway.subscribe(&id, CHANNEL)?;
    }
    tracing::info!(clients = num_clients, payload_size, "Subscribers connected");

    println!("⏳ Warming up for {}s...", WARMUP_SECS);
    run_for(&gateway, &publisher, &dialer, payload_size, Duration::from_secs(WARMUP_SECS)).await?;

    println!("📈 Measuring for {}s...", BENCH_SECS);
    let start = Instant::now();
    let (published, delivered) =
        run_for(&gateway, &publisher, &dialer, payload_size, Duration::from_secs(BENCH_SECS)).await?;
    let elapsed = start.elapsed();

    let publish_rate = published as f64 / elapsed.as_secs_f64();
    let delivery_rate = delivered as f64 / elapsed.as_secs_f64();

    println!();
    println!("╔══════════════════════════════════════════════════════════════╗");
    println!("║                         RESULTS                              ║");
    println!("╠══════════════════════════════════════════════════════════════╣");
    println!("║  Subscribers:          {:>10}                            ║", num_clients);
    println!("║  Payload:              {:>10} B                          ║", payload_size);
    println!("║  Duration:             {:>10.2}s                           ║", elapsed.as_secs_f64());
    println!("║  Published:            {:>10.0} msg/s                      ║", publish_rate);
    println!("║  Delivered:            {:>10.0} msg/s                      ║", delivery_rate);
    println!("╚══════════════════════════════════════════════════════════════╝");

    let stats = gateway.stats();
    tracing::info!(
        connections = stats.connections,
        subscriptions = stats.subscriptions,
        "Benchmark finished"
    );
    gateway.disconnect_all().await;
    Ok(())
}

/// Publish back to back for `duration`. Returns (published, delivered).
async fn run_for(
    gateway: &Gateway,
    publisher: &relay_protocol::ConnectionId,
    dialer: &MemorySocketDialer,
    payload_size: usize,
    duration: Duration,
) -> Result<(u64, u64)> {
    let deadline = Instant::now() + duration;
    let mut published = 0u64;
    let mut delivered = 0u64;

    while Instant::now() < deadline {
        let report = gateway
            .publish(publisher, Message::new(CHANNEL, vec![0u8; payload_size]))
            .await?;
        published += 1;
        delivered += report.sent as u64;
        dialer.clear_sent();
    }
    Ok((published, delivered))
}
