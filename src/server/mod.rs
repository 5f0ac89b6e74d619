//! Server engine: connection registry, channel registry, presence store,
//! frame router, REST surface, and the external-fabric adapter.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

use dashmap::DashMap;
use serde_json::{Value, json};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::protocol::Message;
use uuid::Uuid;

use crate::auth::JwtConfig;
use crate::protocol::{self, Frame};

pub mod channels;
pub mod connection;
pub mod fabric;
pub mod http;
pub mod presence;
pub mod rate_limit;
pub mod router;

use channels::ChannelRegistry;
use fabric::{FabricEvent, FabricEventKind, FabricHandle};
use presence::PresenceStore;

/// Writer handle for one accepted link. All frames to a link go through its
/// writer task, so writes are serialized per connection.
pub(crate) struct ConnectionHandle {
    pub tx: mpsc::UnboundedSender<Message>,
}

/// Engine counters. Plain atomics, cheap to bump from any task.
pub struct EngineMetrics {
    pub connections: AtomicUsize,
    pub frames_received: AtomicU64,
    pub frames_dropped: AtomicU64,
    pub broadcasts_delivered: AtomicU64,
    pub broadcasts_dropped: AtomicU64,
    pub fabric_published: AtomicU64,
    pub fabric_received: AtomicU64,
}

impl EngineMetrics {
    pub fn new() -> Self {
        Self {
            connections: AtomicUsize::new(0),
            frames_received: AtomicU64::new(0),
            frames_dropped: AtomicU64::new(0),
            broadcasts_delivered: AtomicU64::new(0),
            broadcasts_dropped: AtomicU64::new(0),
            fabric_published: AtomicU64::new(0),
            fabric_received: AtomicU64::new(0),
        }
    }
}

impl Default for EngineMetrics {
    fn default() -> Self {
        Self::new()
    }
}

pub(crate) struct SharedState {
    pub connections: DashMap<String, ConnectionHandle>,
    pub channels: ChannelRegistry,
    pub presence: PresenceStore,
    pub auth: Option<JwtConfig>,
    pub instance_id: String,
    pub fabric: std::sync::Mutex<Option<FabricHandle>>,
    pub metrics: EngineMetrics,
    pub max_connections: usize,
}

impl SharedState {
    /// Publish to the fabric when one is attached. Failures never block the
    /// local fan-out; the adapter logs and dead-letters on its side.
    pub fn fabric_publish(&self, topic: &str, kind: FabricEventKind) {
        let handle = self.fabric.lock().expect("fabric lock poisoned").clone();
        if let Some(handle) = handle {
            let event = FabricEvent {
                origin: self.instance_id.clone(),
                topic: topic.to_owned(),
                kind,
            };
            handle.publish(event);
            self.metrics.fabric_published.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn fabric_subscribe(&self, topic: &str) {
        let handle = self.fabric.lock().expect("fabric lock poisoned").clone();
        if let Some(handle) = handle {
            handle.subscribe(topic);
        }
    }

    pub fn fabric_unsubscribe(&self, topic: &str) {
        let handle = self.fabric.lock().expect("fabric lock poisoned").clone();
        if let Some(handle) = handle {
            handle.unsubscribe(topic);
        }
    }
}

/// Engine construction options.
pub struct EngineOptions {
    pub auth: Option<JwtConfig>,
    pub max_connections: usize,
}

impl Default for EngineOptions {
    fn default() -> Self {
        Self {
            auth: None,
            max_connections: 10_000,
        }
    }
}

/// The server engine. Cheap to clone; all state is shared.
#[derive(Clone)]
pub struct Engine {
    state: Arc<SharedState>,
}

impl Engine {
    pub fn new(options: EngineOptions) -> Self {
        Self {
            state: Arc::new(SharedState {
                connections: DashMap::new(),
                channels: ChannelRegistry::new(),
                presence: PresenceStore::new(),
                auth: options.auth,
                instance_id: Uuid::now_v7().to_string(),
                fabric: std::sync::Mutex::new(None),
                metrics: EngineMetrics::new(),
                max_connections: options.max_connections,
            }),
        }
    }

    pub fn instance_id(&self) -> &str {
        &self.state.instance_id
    }

    pub fn metrics(&self) -> &EngineMetrics {
        &self.state.metrics
    }

    /// Attach a fabric adapter for cross-instance relay.
    pub fn set_fabric(&self, handle: FabricHandle) {
        *self.state.fabric.lock().expect("fabric lock poisoned") = Some(handle);
    }

    /// Sender for fabric-delivered events. The engine applies them on its
    /// own task; events originated by this instance are dropped.
    pub fn fabric_sink(&self) -> mpsc::UnboundedSender<FabricEvent> {
        let (tx, mut rx) = mpsc::unbounded_channel::<FabricEvent>();
        let state = self.state.clone();
        tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                if event.origin == state.instance_id {
                    continue;
                }
                state.metrics.fabric_received.fetch_add(1, Ordering::Relaxed);
                apply_fabric_event(&state, event);
            }
        });
        tx
    }

    /// Accept loop. Runs until the listener errors out.
    pub async fn serve(&self, listener: TcpListener) {
        tracing::info!(
            addr = %listener.local_addr().map(|a| a.to_string()).unwrap_or_default(),
            instance = %self.state.instance_id,
            "listening for websocket connections"
        );
        loop {
            match listener.accept().await {
                Ok((stream, addr)) => {
                    let _ = stream.set_nodelay(true);
                    let state = self.state.clone();
                    tokio::spawn(async move {
                        connection::handle_connection(stream, addr, state).await;
                    });
                }
                Err(e) => {
                    tracing::warn!(error = %e, "accept failed");
                }
            }
        }
    }

    /// REST surface (`/api/broadcast`, `/api/channels/{topic}`, `/health`).
    pub fn http_router(&self) -> axum::Router {
        http::router(self.state.clone())
    }

    /// Inject a broadcast with the synthetic "api" sender identity. Every
    /// local member receives it; the fabric relays it to peer instances.
    /// Returns the local recipient count.
    pub fn broadcast_from_api(&self, topic: &str, event: &str, payload: Value) -> usize {
        let body = json!({"type": "broadcast", "event": event, "payload": payload});
        let frame = Frame::notify(topic, protocol::event::BROADCAST, body.clone());
        let delivered = match frame.encode() {
            Ok(text) => self
                .state
                .channels
                .fanout(topic, &text, None, &self.state.metrics),
            Err(e) => {
                tracing::warn!(error = %e, "api broadcast failed to encode");
                return 0;
            }
        };
        self.state.fabric_publish(
            topic,
            FabricEventKind::Broadcast {
                sender: "api".to_owned(),
                payload: body,
            },
        );
        delivered
    }

    pub fn channel_members(&self, topic: &str) -> Vec<String> {
        self.state.channels.members_of(topic)
    }

    pub fn topic_count(&self) -> usize {
        self.state.channels.topic_count()
    }

    pub fn total_members(&self) -> usize {
        self.state.channels.total_members()
    }

    /// Close every link. Used on shutdown.
    pub fn close_all(&self) {
        for conn in self.state.connections.iter() {
            let _ = conn.value().tx.send(Message::Close(None));
        }
    }

    /// Force-close a channel: members receive `chan:close`, then all local
    /// membership and presence for the topic is dropped. Returns how many
    /// members were notified.
    pub fn close_channel(&self, topic: &str) -> usize {
        let frame = Frame::notify(topic, protocol::event::CLOSE, json!({}));
        let notified = match frame.encode() {
            Ok(text) => self
                .state
                .channels
                .fanout(topic, &text, None, &self.state.metrics),
            Err(_) => 0,
        };
        let dropped = self.state.channels.drop_topic(topic);
        self.state.presence.remove_topic(topic);
        self.state.fabric_unsubscribe(topic);
        tracing::info!(topic, members = dropped.len(), "channel force-closed");
        notified
    }

    /// Emit an unsolicited `chan:error` to a channel's members. The channel
    /// itself stays up.
    pub fn notify_channel_error(&self, topic: &str, code: &str, reason: &str) -> usize {
        let frame = Frame::notify(
            topic,
            protocol::event::ERROR,
            json!({"code": code, "reason": reason}),
        );
        match frame.encode() {
            Ok(text) => self
                .state
                .channels
                .fanout(topic, &text, None, &self.state.metrics),
            Err(_) => 0,
        }
    }

    /// Close one link by connection id.
    pub fn disconnect_connection(&self, conn_id: &str) {
        if let Some(conn) = self.state.connections.get(conn_id) {
            let _ = conn.value().tx.send(Message::Close(None));
        }
    }

    /// Presence entries currently stored for a topic.
    pub fn presence_entries(&self, topic: &str) -> usize {
        self.state.presence.entry_count(topic)
    }
}

/// Apply one fabric-relayed event from a peer instance.
fn apply_fabric_event(state: &SharedState, event: FabricEvent) {
    match event.kind {
        FabricEventKind::Broadcast { payload, .. } => {
            // The originating instance already served its own members; this
            // fan-out skips no one.
            let frame = Frame::notify(&event.topic, protocol::event::BROADCAST, payload);
            if let Ok(text) = frame.encode() {
                state
                    .channels
                    .fanout(&event.topic, &text, None, &state.metrics);
            }
        }
        FabricEventKind::PresenceTrack {
            key,
            presence_ref,
            meta,
        } => {
            state.presence.apply_remote_track(
                &event.topic,
                &key,
                &presence_ref,
                meta.clone(),
                &event.origin,
            );
            let diff = presence::diff_payload(
                vec![(
                    key,
                    vec![presence::PresenceEntry {
                        presence_ref,
                        meta,
                        owner: String::new(),
                    }],
                )],
                vec![],
            );
            router::send_presence_diff(state, &event.topic, diff);
        }
        FabricEventKind::PresenceUntrack { key, presence_ref } => {
            if let Some(entry) = state
                .presence
                .apply_remote_untrack(&event.topic, &key, &presence_ref)
            {
                let diff = presence::diff_payload(vec![], vec![(key, vec![entry])]);
                router::send_presence_diff(state, &event.topic, diff);
            }
        }
    }
}
