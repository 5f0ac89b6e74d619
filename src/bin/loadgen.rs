//! Load generator: opens a fleet of clients against a running chanbus
//! server, drives broadcasts through one sender, and reports delivery and
//! latency figures.
//!
//! Latency is measured end to end: the sender stamps each broadcast with its
//! wall-clock send time and every receiver records the delta on arrival.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use clap::Parser;
use hdrhistogram::Histogram;
use serde_json::json;

use chanbus::client::{SendStatus, Socket, SocketOptions, SubscribeStatus};
use chanbus::protocol::{BroadcastConfig, ChannelConfig, PresenceConfig};

#[derive(Parser, Debug)]
#[command(name = "loadgen", about = "chanbus load generator")]
struct Cli {
    /// Server WebSocket URL
    #[arg(long, default_value = "ws://127.0.0.1:4000")]
    url: String,

    /// Number of concurrent clients
    #[arg(long, default_value_t = 50)]
    clients: usize,

    /// Topic every client joins
    #[arg(long, default_value = "room:load")]
    topic: String,

    /// Test duration in seconds
    #[arg(long, default_value_t = 10)]
    duration: u64,

    /// Broadcast payload size in bytes
    #[arg(long, default_value_t = 256)]
    payload_bytes: usize,

    /// Broadcasts per second from the sender
    #[arg(long, default_value_t = 50)]
    rate: u64,

    /// JWT secret; when set, clients join with a signed token
    #[arg(long)]
    secret: Option<String>,

    /// Track presence from every client
    #[arg(long, default_value_t = false)]
    presence: bool,
}

/// Latency recorder: 1 us to 60 s, 3 significant digits.
struct LatencyHistogram {
    inner: Histogram<u64>,
}

impl LatencyHistogram {
    fn new() -> Self {
        Self {
            inner: Histogram::new_with_bounds(1, 60_000_000, 3).expect("static bounds"),
        }
    }

    fn record_us(&mut self, us: u64) {
        let _ = self.inner.record(us.max(1));
    }

    fn percentile_ms(&self, p: f64) -> f64 {
        self.inner.value_at_percentile(p) as f64 / 1000.0
    }

    fn print_summary(&self) {
        if self.inner.is_empty() {
            println!("  latency: no samples");
            return;
        }
        println!("  latency p50:  {:>8.2} ms", self.percentile_ms(50.0));
        println!("  latency p95:  {:>8.2} ms", self.percentile_ms(95.0));
        println!("  latency p99:  {:>8.2} ms", self.percentile_ms(99.0));
        println!("  latency max:  {:>8.2} ms", self.inner.max() as f64 / 1000.0);
        println!("  latency mean: {:>8.2} ms", self.inner.mean() / 1000.0);
    }
}

fn epoch_us() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_micros() as u64
}

fn token_for(secret: &str, subject: &str) -> String {
    let exp = (SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs() as i64)
        + 3600;
    chanbus::auth::sign(&json!({"sub": subject, "exp": exp}), secret.as_bytes())
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    println!("chanbus loadgen");
    println!("  url:      {}", cli.url);
    println!("  clients:  {}", cli.clients);
    println!("  topic:    {}", cli.topic);
    println!("  duration: {}s @ {} msg/s, {} B payloads", cli.duration, cli.rate, cli.payload_bytes);

    let received = Arc::new(AtomicU64::new(0));
    let latencies = Arc::new(Mutex::new(LatencyHistogram::new()));

    // Open the fleet. The first client is the sender and opts into acks so
    // delivery is confirmed end to end.
    let mut sockets = Vec::with_capacity(cli.clients);
    for i in 0..cli.clients {
        let mut opts = SocketOptions::new(cli.url.clone());
        if let Some(secret) = &cli.secret {
            opts.access_token = Some(token_for(secret, &format!("loadgen-{i}")));
        }
        let socket = Socket::new(opts);
        socket.connect();
        if !socket.wait_until_open(Duration::from_secs(10)).await {
            eprintln!("client {i} failed to connect; is the server running at {}?", cli.url);
            std::process::exit(1);
        }

        let config = ChannelConfig {
            broadcast: BroadcastConfig {
                include_self: false,
                ack: i == 0,
            },
            presence: if cli.presence {
                PresenceConfig {
                    key: format!("loadgen-{i}"),
                    enabled: true,
                }
            } else {
                PresenceConfig::default()
            },
        };
        let channel = socket.channel(cli.topic.clone(), config);
        let (status, err) = channel.join().await;
        if status != SubscribeStatus::Subscribed {
            eprintln!("client {i} failed to join: {status:?} {err:?}");
            std::process::exit(1);
        }

        if i > 0 {
            let received = received.clone();
            let latencies = latencies.clone();
            channel.on_broadcast(Some("load"), move |_event, payload| {
                received.fetch_add(1, Ordering::Relaxed);
                if let Some(sent_at) = payload.get("sent_at_us").and_then(|v| v.as_u64()) {
                    let now = epoch_us();
                    latencies
                        .lock()
                        .unwrap()
                        .record_us(now.saturating_sub(sent_at));
                }
            });
        }
        if cli.presence {
            let _ = channel.track(json!({"client": i})).await;
        }
        sockets.push((socket, channel));
    }
    println!("  fleet connected and joined");

    // Drive broadcasts from client 0 for the configured window.
    let sender = sockets[0].1.clone();
    let filler = "x".repeat(cli.payload_bytes);
    let mut ticker = tokio::time::interval(Duration::from_micros(1_000_000 / cli.rate.max(1)));
    let deadline = tokio::time::Instant::now() + Duration::from_secs(cli.duration);
    let mut sent = 0u64;
    let mut send_failures = 0u64;

    while tokio::time::Instant::now() < deadline {
        ticker.tick().await;
        let result = sender
            .send("load", json!({"sent_at_us": epoch_us(), "fill": filler}))
            .await;
        sent += 1;
        if result.status != SendStatus::Ok {
            send_failures += 1;
        }
    }

    // Let stragglers land before reading the counters.
    tokio::time::sleep(Duration::from_millis(500)).await;

    let expected = sent * (cli.clients as u64 - 1);
    let got = received.load(Ordering::Relaxed);
    println!("\nresults");
    println!("  sent:          {sent} ({send_failures} failures)");
    println!("  delivered:     {got} / {expected} expected");
    if expected > 0 {
        println!("  delivery rate: {:.2}%", got as f64 / expected as f64 * 100.0);
    }
    latencies.lock().unwrap().print_summary();

    for (socket, _) in &sockets {
        socket.disconnect();
    }
}
