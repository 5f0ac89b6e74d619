//! External-fabric adapter: cross-instance relay of broadcasts and presence
//! events.
//!
//! Two Redis backends sit behind one command-channel interface. The pub/sub
//! backend pattern-subscribes to every bus channel and pushes messages as
//! they arrive; the stream backend appends to capped streams and polls them
//! on a ~100 ms cadence, remembering the last-seen entry id per topic so a
//! resubscribe resumes where it left off.
//!
//! Every published event carries the originating instance id; the engine
//! drops events it originated itself. Publish failures are dead-lettered and
//! logged; local fan-out never waits on the fabric.

use std::collections::hash_map::RandomState;
use std::collections::{HashMap, VecDeque};
use std::hash::BuildHasher;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::{Duration, Instant};

use futures_util::StreamExt;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::mpsc;

/// Redis key prefix for bus traffic.
const KEY_PREFIX: &str = "chanbus:";
/// Cap on entries retained per stream (MAXLEN ~).
const STREAM_MAX_LEN: usize = 1000;
/// Idle stream expiry, refreshed on every append.
const STREAM_TTL_SECS: u64 = 3600;
/// Poll blocking window for the stream backend.
const POLL_BLOCK_MS: u64 = 100;
/// Publish attempts before dead-lettering.
const PUBLISH_MAX_ATTEMPTS: usize = 3;
const PUBLISH_RETRY_DELAYS: &[Duration] = &[Duration::from_millis(100), Duration::from_millis(200)];
/// Id placeholder for topics subscribed while the fabric was unreachable;
/// resolved to the stream tail once a connection exists.
const UNANCHORED_ID: &str = "$";

// ---------------------------------------------------------------------------
// Events
// ---------------------------------------------------------------------------

/// One relayed event. `origin` is the publishing instance's id.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FabricEvent {
    pub origin: String,
    pub topic: String,
    #[serde(flatten)]
    pub kind: FabricEventKind,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum FabricEventKind {
    Broadcast {
        sender: String,
        payload: Value,
    },
    PresenceTrack {
        key: String,
        presence_ref: String,
        meta: Value,
    },
    PresenceUntrack {
        key: String,
        presence_ref: String,
    },
}

// ---------------------------------------------------------------------------
// Commands and handle
// ---------------------------------------------------------------------------

pub enum FabricCommand {
    Publish(FabricEvent),
    Subscribe(String),
    Unsubscribe(String),
    Shutdown,
}

/// Engine-facing handle to a fabric task. Cloneable; all methods are
/// fire-and-forget.
#[derive(Clone)]
pub struct FabricHandle {
    cmd_tx: mpsc::UnboundedSender<FabricCommand>,
}

impl FabricHandle {
    pub fn new(cmd_tx: mpsc::UnboundedSender<FabricCommand>) -> Self {
        Self { cmd_tx }
    }

    pub fn publish(&self, event: FabricEvent) {
        let _ = self.cmd_tx.send(FabricCommand::Publish(event));
    }

    pub fn subscribe(&self, topic: &str) {
        let _ = self.cmd_tx.send(FabricCommand::Subscribe(topic.to_owned()));
    }

    pub fn unsubscribe(&self, topic: &str) {
        let _ = self
            .cmd_tx
            .send(FabricCommand::Unsubscribe(topic.to_owned()));
    }

    pub fn shutdown(&self) {
        let _ = self.cmd_tx.send(FabricCommand::Shutdown);
    }
}

// ---------------------------------------------------------------------------
// Reconnect pacing
// ---------------------------------------------------------------------------

/// Paces the adapter's reconnection attempts around a consecutive-failure
/// streak. Waits double from `floor` up to `ceil` while connects keep
/// failing; a link that stays up for `stable_uptime` forgives the streak.
/// Once the streak reaches `rest_streak` the fabric is considered down and
/// every further attempt waits a full `rest` instead, so a dead backend is
/// probed on a slow cadence rather than hammered.
struct RetryGate {
    floor: Duration,
    ceil: Duration,
    rest: Duration,
    rest_streak: u32,
    stable_uptime: Duration,
    streak: u32,
    connected_at: Option<Instant>,
    spread: RandomState,
}

impl RetryGate {
    fn new() -> Self {
        Self {
            floor: Duration::from_millis(500),
            ceil: Duration::from_secs(15),
            rest: Duration::from_secs(60),
            rest_streak: 8,
            stable_uptime: Duration::from_secs(30),
            streak: 0,
            connected_at: None,
            spread: RandomState::new(),
        }
    }

    /// The link came up.
    fn connected(&mut self) {
        self.connected_at = Some(Instant::now());
    }

    /// The link is down (or never came up). Returns how long to wait before
    /// the next attempt.
    fn next_wait(&mut self) -> Duration {
        if let Some(since) = self.connected_at.take() {
            if since.elapsed() >= self.stable_uptime {
                self.streak = 0;
            }
        }
        self.streak += 1;
        if self.streak >= self.rest_streak {
            return self.rest;
        }
        let doubled = self
            .floor
            .saturating_mul(1u32 << (self.streak - 1).min(10))
            .min(self.ceil);
        // Concurrent instances reconnecting to the same fabric should not
        // stampede in lockstep: hash the streak through a per-process random
        // state for a stable 0.85x..1.15x spread.
        let bucket = self.spread.hash_one(self.streak) % 31;
        doubled.mul_f64(0.85 + bucket as f64 * 0.01)
    }
}

// ---------------------------------------------------------------------------
// Metrics
// ---------------------------------------------------------------------------

pub struct FabricMetrics {
    pub published: AtomicU64,
    pub received: AtomicU64,
    pub publish_errors: AtomicU64,
    pub reconnects: AtomicU64,
    pub connected: AtomicBool,
}

impl FabricMetrics {
    fn new() -> Self {
        Self {
            published: AtomicU64::new(0),
            received: AtomicU64::new(0),
            publish_errors: AtomicU64::new(0),
            reconnects: AtomicU64::new(0),
            connected: AtomicBool::new(false),
        }
    }
}

// ---------------------------------------------------------------------------
// Dead letter queue
// ---------------------------------------------------------------------------

struct DlqEntry {
    topic: String,
    payload: String,
    error: String,
}

struct DeadLetterQueue {
    entries: VecDeque<DlqEntry>,
    max_entries: usize,
}

impl DeadLetterQueue {
    fn new(max_entries: usize) -> Self {
        Self {
            entries: VecDeque::new(),
            max_entries,
        }
    }

    fn push(&mut self, entry: DlqEntry) {
        if self.entries.len() >= self.max_entries {
            self.entries.pop_front();
        }
        self.entries.push_back(entry);
    }

    fn len(&self) -> usize {
        self.entries.len()
    }
}

// ---------------------------------------------------------------------------
// Pub/sub backend
// ---------------------------------------------------------------------------

/// Spawn the pub/sub backend. Per-topic subscribe commands are no-ops here:
/// the task pattern-subscribes to the whole prefix and local membership
/// filtering happens at fan-out.
pub fn spawn_redis_pubsub(
    url: String,
    inbound: mpsc::UnboundedSender<FabricEvent>,
) -> (FabricHandle, Arc<FabricMetrics>) {
    let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
    let metrics = Arc::new(FabricMetrics::new());
    let task_metrics = metrics.clone();
    tokio::spawn(async move {
        pubsub_listener(url, cmd_rx, inbound, task_metrics).await;
    });
    (FabricHandle::new(cmd_tx), metrics)
}

async fn pubsub_listener(
    url: String,
    mut cmd_rx: mpsc::UnboundedReceiver<FabricCommand>,
    inbound: mpsc::UnboundedSender<FabricEvent>,
    metrics: Arc<FabricMetrics>,
) {
    let mut gate = RetryGate::new();
    let mut dlq = DeadLetterQueue::new(1000);

    loop {
        match pubsub_run(&url, &mut cmd_rx, &inbound, &metrics, &mut dlq, &mut gate).await {
            Ok(()) => {
                tracing::info!("fabric shutting down");
                return;
            }
            Err(e) => {
                metrics.connected.store(false, Ordering::Relaxed);
                metrics.reconnects.fetch_add(1, Ordering::Relaxed);
                let delay = gate.next_wait();
                tracing::warn!(error = %e, delay_ms = delay.as_millis() as u64, "fabric connection lost, reconnecting");
                if drain_during_backoff(&mut cmd_rx, delay, &mut dlq, None).await {
                    return;
                }
            }
        }
    }
}

async fn pubsub_run(
    url: &str,
    cmd_rx: &mut mpsc::UnboundedReceiver<FabricCommand>,
    inbound: &mpsc::UnboundedSender<FabricEvent>,
    metrics: &FabricMetrics,
    dlq: &mut DeadLetterQueue,
    gate: &mut RetryGate,
) -> Result<(), String> {
    let client = redis::Client::open(url).map_err(|e| format!("open client: {e}"))?;
    let mut pub_conn = client
        .get_multiplexed_tokio_connection()
        .await
        .map_err(|e| format!("publish connection: {e}"))?;
    let mut pubsub = client
        .get_async_pubsub()
        .await
        .map_err(|e| format!("pubsub connection: {e}"))?;
    pubsub
        .psubscribe(format!("{KEY_PREFIX}*"))
        .await
        .map_err(|e| format!("psubscribe: {e}"))?;

    gate.connected();
    metrics.connected.store(true, Ordering::Relaxed);
    tracing::info!(pattern = %format!("{KEY_PREFIX}*"), "fabric connected (pubsub)");

    let stream = pubsub.into_on_message();
    tokio::pin!(stream);

    loop {
        tokio::select! {
            cmd = cmd_rx.recv() => match cmd {
                Some(FabricCommand::Publish(event)) => {
                    publish_pubsub(&mut pub_conn, &event, metrics, dlq).await;
                }
                // Wildcard subscription covers every topic.
                Some(FabricCommand::Subscribe(_)) | Some(FabricCommand::Unsubscribe(_)) => {}
                Some(FabricCommand::Shutdown) | None => return Ok(()),
            },
            msg = stream.next() => match msg {
                Some(msg) => {
                    metrics.received.fetch_add(1, Ordering::Relaxed);
                    if let Ok(payload) = msg.get_payload::<String>() {
                        deliver(&payload, inbound);
                    }
                }
                None => return Err("message stream ended".to_owned()),
            },
        }
    }
}

async fn publish_pubsub(
    conn: &mut redis::aio::MultiplexedConnection,
    event: &FabricEvent,
    metrics: &FabricMetrics,
    dlq: &mut DeadLetterQueue,
) {
    let channel = format!("{KEY_PREFIX}{}", event.topic);
    let payload = match serde_json::to_string(event) {
        Ok(p) => p,
        Err(e) => {
            tracing::warn!(error = %e, "fabric event failed to serialize");
            return;
        }
    };

    let mut last_err = String::new();
    for attempt in 0..PUBLISH_MAX_ATTEMPTS {
        let result: Result<(), redis::RedisError> = redis::cmd("PUBLISH")
            .arg(&channel)
            .arg(&payload)
            .query_async(conn)
            .await;
        match result {
            Ok(()) => {
                metrics.published.fetch_add(1, Ordering::Relaxed);
                return;
            }
            Err(e) => {
                last_err = e.to_string();
                if let Some(delay) = PUBLISH_RETRY_DELAYS.get(attempt) {
                    tokio::time::sleep(*delay).await;
                }
            }
        }
    }

    metrics.publish_errors.fetch_add(1, Ordering::Relaxed);
    dlq.push(DlqEntry {
        topic: event.topic.clone(),
        payload,
        error: last_err.clone(),
    });
    tracing::warn!(
        topic = %event.topic,
        error = %last_err,
        dlq_depth = dlq.len(),
        "fabric publish failed, dead-lettering"
    );
}

// ---------------------------------------------------------------------------
// Stream backend
// ---------------------------------------------------------------------------

/// Spawn the stream backend: XADD on publish, blocking XREAD poll on a
/// ~100 ms cadence over the subscribed topic set.
pub fn spawn_redis_streams(
    url: String,
    inbound: mpsc::UnboundedSender<FabricEvent>,
) -> (FabricHandle, Arc<FabricMetrics>) {
    let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
    let metrics = Arc::new(FabricMetrics::new());
    let task_metrics = metrics.clone();
    tokio::spawn(async move {
        stream_listener(url, cmd_rx, inbound, task_metrics).await;
    });
    (FabricHandle::new(cmd_tx), metrics)
}

async fn stream_listener(
    url: String,
    mut cmd_rx: mpsc::UnboundedReceiver<FabricCommand>,
    inbound: mpsc::UnboundedSender<FabricEvent>,
    metrics: Arc<FabricMetrics>,
) {
    let mut gate = RetryGate::new();
    let mut dlq = DeadLetterQueue::new(1000);
    // Last-seen stream id per topic; survives reconnects so a resubscribe
    // resumes where it left off.
    let mut last_ids: HashMap<String, String> = HashMap::new();

    loop {
        match stream_run(&url, &mut cmd_rx, &inbound, &metrics, &mut dlq, &mut last_ids, &mut gate)
            .await
        {
            Ok(()) => {
                tracing::info!("fabric shutting down");
                return;
            }
            Err(e) => {
                metrics.connected.store(false, Ordering::Relaxed);
                metrics.reconnects.fetch_add(1, Ordering::Relaxed);
                let delay = gate.next_wait();
                tracing::warn!(error = %e, delay_ms = delay.as_millis() as u64, "fabric connection lost, reconnecting");
                if drain_during_backoff(&mut cmd_rx, delay, &mut dlq, Some(&mut last_ids)).await {
                    return;
                }
            }
        }
    }
}

type StreamBatch = Vec<(String, Vec<(String, HashMap<String, String>)>)>;

async fn stream_run(
    url: &str,
    cmd_rx: &mut mpsc::UnboundedReceiver<FabricCommand>,
    inbound: &mpsc::UnboundedSender<FabricEvent>,
    metrics: &FabricMetrics,
    dlq: &mut DeadLetterQueue,
    last_ids: &mut HashMap<String, String>,
    gate: &mut RetryGate,
) -> Result<(), String> {
    let client = redis::Client::open(url).map_err(|e| format!("open client: {e}"))?;
    let mut conn = client
        .get_multiplexed_tokio_connection()
        .await
        .map_err(|e| format!("stream connection: {e}"))?;

    gate.connected();
    metrics.connected.store(true, Ordering::Relaxed);
    tracing::info!("fabric connected (streams)");

    // Topics subscribed during an outage carry a placeholder id; anchor them
    // at the current tail now that a connection exists.
    let unanchored: Vec<String> = last_ids
        .iter()
        .filter(|(_, id)| id.as_str() == UNANCHORED_ID)
        .map(|(topic, _)| topic.clone())
        .collect();
    for topic in unanchored {
        let key = format!("{KEY_PREFIX}{topic}");
        let id = latest_stream_id(&mut conn, &key).await?;
        last_ids.insert(topic, id);
    }

    loop {
        // Commands first, so publishes never queue behind a poll window.
        loop {
            match cmd_rx.try_recv() {
                Ok(cmd) => {
                    if stream_command(&mut conn, cmd, metrics, dlq, last_ids).await? {
                        return Ok(());
                    }
                }
                Err(mpsc::error::TryRecvError::Empty) => break,
                Err(mpsc::error::TryRecvError::Disconnected) => return Ok(()),
            }
        }

        if last_ids.is_empty() {
            // Nothing to poll; park on the command channel instead.
            match tokio::time::timeout(Duration::from_millis(POLL_BLOCK_MS), cmd_rx.recv()).await {
                Ok(Some(cmd)) => {
                    if stream_command(&mut conn, cmd, metrics, dlq, last_ids).await? {
                        return Ok(());
                    }
                }
                Ok(None) => return Ok(()),
                Err(_) => {}
            }
            continue;
        }

        // Build key/id pairs in one pass so positions always line up.
        let mut keys = Vec::with_capacity(last_ids.len());
        let mut ids = Vec::with_capacity(last_ids.len());
        for (topic, id) in last_ids.iter() {
            keys.push(format!("{KEY_PREFIX}{topic}"));
            ids.push(id.clone());
        }

        let mut xread = redis::cmd("XREAD");
        xread
            .arg("COUNT")
            .arg(100)
            .arg("BLOCK")
            .arg(POLL_BLOCK_MS)
            .arg("STREAMS");
        for key in &keys {
            xread.arg(key);
        }
        for id in &ids {
            xread.arg(id);
        }

        let batch: Option<StreamBatch> = xread
            .query_async(&mut conn)
            .await
            .map_err(|e| format!("xread: {e}"))?;

        let Some(batch) = batch else {
            continue;
        };
        for (key, entries) in batch {
            let topic = key.strip_prefix(KEY_PREFIX).unwrap_or(&key).to_owned();
            for (entry_id, fields) in entries {
                last_ids.insert(topic.clone(), entry_id);
                if let Some(payload) = fields.get("event") {
                    metrics.received.fetch_add(1, Ordering::Relaxed);
                    deliver(payload, inbound);
                }
            }
        }
    }
}

/// Handle one command for the stream backend. Returns true on shutdown.
async fn stream_command(
    conn: &mut redis::aio::MultiplexedConnection,
    cmd: FabricCommand,
    metrics: &FabricMetrics,
    dlq: &mut DeadLetterQueue,
    last_ids: &mut HashMap<String, String>,
) -> Result<bool, String> {
    match cmd {
        FabricCommand::Publish(event) => {
            publish_stream(conn, &event, metrics, dlq).await?;
        }
        FabricCommand::Subscribe(topic) => {
            // Anchor at the current tail so polls never skip entries landing
            // between calls. A retained id from a previous subscription
            // resumes where it left off.
            if !last_ids.contains_key(&topic) {
                let key = format!("{KEY_PREFIX}{topic}");
                let id = latest_stream_id(conn, &key).await?;
                last_ids.insert(topic, id);
            }
        }
        FabricCommand::Unsubscribe(topic) => {
            last_ids.remove(&topic);
        }
        FabricCommand::Shutdown => return Ok(true),
    }
    Ok(false)
}

/// Id of the newest entry in a stream, or the zero id for an empty one.
async fn latest_stream_id(
    conn: &mut redis::aio::MultiplexedConnection,
    key: &str,
) -> Result<String, String> {
    let rows: Vec<(String, HashMap<String, String>)> = redis::cmd("XREVRANGE")
        .arg(key)
        .arg("+")
        .arg("-")
        .arg("COUNT")
        .arg(1)
        .query_async(conn)
        .await
        .map_err(|e| format!("xrevrange: {e}"))?;
    Ok(rows
        .first()
        .map(|(id, _)| id.clone())
        .unwrap_or_else(|| "0-0".to_owned()))
}

async fn publish_stream(
    conn: &mut redis::aio::MultiplexedConnection,
    event: &FabricEvent,
    metrics: &FabricMetrics,
    dlq: &mut DeadLetterQueue,
) -> Result<(), String> {
    let key = format!("{KEY_PREFIX}{}", event.topic);
    let payload = match serde_json::to_string(event) {
        Ok(p) => p,
        Err(e) => {
            tracing::warn!(error = %e, "fabric event failed to serialize");
            return Ok(());
        }
    };

    let appended: Result<String, redis::RedisError> = redis::cmd("XADD")
        .arg(&key)
        .arg("MAXLEN")
        .arg("~")
        .arg(STREAM_MAX_LEN)
        .arg("*")
        .arg("event")
        .arg(&payload)
        .query_async(conn)
        .await;

    match appended {
        Ok(_id) => {
            metrics.published.fetch_add(1, Ordering::Relaxed);
            // Refresh the idle TTL on every append.
            let _: Result<(), redis::RedisError> = redis::cmd("EXPIRE")
                .arg(&key)
                .arg(STREAM_TTL_SECS)
                .query_async(conn)
                .await;
            Ok(())
        }
        Err(e) => {
            metrics.publish_errors.fetch_add(1, Ordering::Relaxed);
            dlq.push(DlqEntry {
                topic: event.topic.clone(),
                payload,
                error: e.to_string(),
            });
            tracing::warn!(
                topic = %event.topic,
                error = %e,
                dlq_depth = dlq.len(),
                "fabric append failed, dead-lettering"
            );
            // Connection-level errors trigger the outer reconnect loop.
            if e.is_connection_dropped() || e.is_io_error() {
                Err(e.to_string())
            } else {
                Ok(())
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Shared helpers
// ---------------------------------------------------------------------------

fn deliver(payload: &str, inbound: &mpsc::UnboundedSender<FabricEvent>) {
    match serde_json::from_str::<FabricEvent>(payload) {
        Ok(event) => {
            let _ = inbound.send(event);
        }
        Err(e) => {
            tracing::debug!(error = %e, "undecodable fabric payload dropped");
        }
    }
}

/// Sit out a backoff window while keeping the command channel drained.
/// Publishes during the window are dead-lettered; subscription changes are
/// recorded in `subs` (stream backend) so reconnection picks them up.
/// Returns true on shutdown.
async fn drain_during_backoff(
    cmd_rx: &mut mpsc::UnboundedReceiver<FabricCommand>,
    delay: Duration,
    dlq: &mut DeadLetterQueue,
    mut subs: Option<&mut HashMap<String, String>>,
) -> bool {
    let deadline = tokio::time::Instant::now() + delay;
    loop {
        tokio::select! {
            _ = tokio::time::sleep_until(deadline) => return false,
            cmd = cmd_rx.recv() => match cmd {
                Some(FabricCommand::Shutdown) | None => return true,
                Some(FabricCommand::Publish(event)) => {
                    if let Ok(payload) = serde_json::to_string(&event) {
                        dlq.push(DlqEntry {
                            topic: event.topic,
                            payload,
                            error: "fabric disconnected".to_owned(),
                        });
                    }
                }
                Some(FabricCommand::Subscribe(topic)) => {
                    if let Some(subs) = subs.as_deref_mut() {
                        subs.entry(topic).or_insert_with(|| UNANCHORED_ID.to_owned());
                    }
                }
                Some(FabricCommand::Unsubscribe(topic)) => {
                    if let Some(subs) = subs.as_deref_mut() {
                        subs.remove(&topic);
                    }
                }
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_event_roundtrip() {
        let event = FabricEvent {
            origin: "inst-1".into(),
            topic: "room:5".into(),
            kind: FabricEventKind::Broadcast {
                sender: "conn-9".into(),
                payload: json!({"type": "broadcast", "event": "msg", "payload": {"x": 1}}),
            },
        };
        let wire = serde_json::to_string(&event).unwrap();
        let back: FabricEvent = serde_json::from_str(&wire).unwrap();
        assert_eq!(back.origin, "inst-1");
        assert_eq!(back.topic, "room:5");
        assert!(matches!(back.kind, FabricEventKind::Broadcast { .. }));
    }

    #[test]
    fn test_presence_event_roundtrip() {
        let event = FabricEvent {
            origin: "inst-2".into(),
            topic: "room:1".into(),
            kind: FabricEventKind::PresenceTrack {
                key: "alice".into(),
                presence_ref: "ref-1".into(),
                meta: json!({"status": "online"}),
            },
        };
        let wire = serde_json::to_string(&event).unwrap();
        let back: FabricEvent = serde_json::from_str(&wire).unwrap();
        let FabricEventKind::PresenceTrack { key, presence_ref, .. } = back.kind else {
            panic!("wrong kind");
        };
        assert_eq!(key, "alice");
        assert_eq!(presence_ref, "ref-1");
    }

    #[test]
    fn test_retry_gate_waits_grow_and_cap() {
        let mut gate = RetryGate::new();
        let first = gate.next_wait();
        let second = gate.next_wait();
        let third = gate.next_wait();
        // Doubling with a 0.85..1.15 spread: each wait clearly exceeds the
        // previous one, and nothing passes the jittered ceiling.
        assert!(first >= Duration::from_millis(425));
        assert!(second > first);
        assert!(third > second);
        for _ in 0..3 {
            assert!(gate.next_wait() <= Duration::from_secs(18));
        }
    }

    #[test]
    fn test_retry_gate_rests_after_long_streak() {
        let mut gate = RetryGate::new();
        for _ in 0..7 {
            assert!(gate.next_wait() < gate.rest);
        }
        assert_eq!(gate.next_wait(), gate.rest);
        assert_eq!(gate.next_wait(), gate.rest);
    }

    #[test]
    fn test_retry_gate_forgives_stable_uptime() {
        let mut gate = RetryGate::new();
        gate.stable_uptime = Duration::from_millis(1);
        gate.next_wait();
        gate.next_wait();
        gate.next_wait();

        gate.connected();
        std::thread::sleep(Duration::from_millis(2));
        let wait = gate.next_wait();
        // The streak was forgiven, so this is a first-attempt wait again.
        assert!(wait <= gate.floor.mul_f64(1.15));
    }

    #[test]
    fn test_retry_gate_short_uptime_keeps_streak() {
        let mut gate = RetryGate::new();
        let first = gate.next_wait();
        gate.connected();
        // Immediate drop: the link never proved itself stable.
        let next = gate.next_wait();
        assert!(next > first);
    }

    #[test]
    fn test_dlq_bounded_fifo() {
        let mut dlq = DeadLetterQueue::new(2);
        for i in 0..3 {
            dlq.push(DlqEntry {
                topic: format!("t{i}"),
                payload: String::new(),
                error: String::new(),
            });
        }
        assert_eq!(dlq.len(), 2);
        assert_eq!(dlq.entries[0].topic, "t1");
        assert_eq!(dlq.entries[1].topic, "t2");
    }

    #[tokio::test]
    async fn test_handle_commands_flow_through() {
        let (cmd_tx, mut cmd_rx) = mpsc::unbounded_channel();
        let handle = FabricHandle::new(cmd_tx);
        handle.subscribe("room:1");
        handle.unsubscribe("room:1");
        handle.shutdown();
        assert!(matches!(cmd_rx.recv().await, Some(FabricCommand::Subscribe(t)) if t == "room:1"));
        assert!(matches!(cmd_rx.recv().await, Some(FabricCommand::Unsubscribe(_))));
        assert!(matches!(cmd_rx.recv().await, Some(FabricCommand::Shutdown)));
    }
}
