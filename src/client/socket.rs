//! Client socket: one long-lived WebSocket multiplexing every channel.
//!
//! The socket owns the link lifecycle (connect, heartbeat-driven liveness,
//! reconnect with a stepped schedule), the sequence allocator, the
//! pending-reply registry, and the buffered sender that queues outbound
//! frames while the link is down. Channels hold a handle to the socket core
//! for writes and sequence allocation; the socket owns the channel list.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures_util::future::BoxFuture;
use futures_util::{SinkExt, StreamExt};
use serde_json::json;
use tokio::sync::mpsc;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::protocol::Message;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;

use crate::limits;
use crate::protocol::{self, ChannelConfig, Frame, Reply, SYSTEM_TOPIC};

use super::backoff::{ReconnectSchedule, ReconnectTimer, default_schedule};
use super::channel::{Channel, RemoveStatus};
use super::heartbeat::{Heartbeat, HeartbeatHook, HeartbeatStatus, RttStats, TickAction};
use super::sequence::{PendingReplies, ReplyOutcome, SequenceAllocator};

/// Async bearer-token source, called before each join.
pub type TokenProvider = Arc<dyn Fn() -> BoxFuture<'static, Option<String>> + Send + Sync>;

/// Link readiness.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    Connecting,
    Open,
    Closing,
    Closed,
}

pub struct SocketOptions {
    pub url: String,
    pub heartbeat_interval: Duration,
    pub request_timeout: Duration,
    pub reconnect_schedule: ReconnectSchedule,
    /// Literal bearer token; superseded by `token_provider` when both are set.
    pub access_token: Option<String>,
    pub token_provider: Option<TokenProvider>,
}

impl SocketOptions {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            heartbeat_interval: limits::DEFAULT_HEARTBEAT_INTERVAL,
            request_timeout: limits::DEFAULT_REQUEST_TIMEOUT,
            reconnect_schedule: default_schedule(),
            access_token: None,
            token_provider: None,
        }
    }
}

pub(crate) struct SocketCore {
    url: String,
    heartbeat_interval: Duration,
    pub(crate) request_timeout: Duration,
    pub(crate) schedule: ReconnectSchedule,
    state: Mutex<LinkState>,
    seq: SequenceAllocator,
    pub(crate) pending: PendingReplies,
    writer: Mutex<Option<mpsc::UnboundedSender<Message>>>,
    send_buffer: Mutex<VecDeque<String>>,
    channels: Mutex<Vec<Channel>>,
    heartbeat: Mutex<Heartbeat>,
    hb_hook: Mutex<Option<HeartbeatHook>>,
    reconnect: Mutex<ReconnectTimer>,
    shutdown: AtomicBool,
    access_token: Mutex<Option<String>>,
    token_provider: Option<TokenProvider>,
}

impl SocketCore {
    pub(crate) fn next_seq(&self) -> String {
        self.seq.next()
    }

    pub(crate) fn is_open(&self) -> bool {
        *self.state.lock().expect("state lock poisoned") == LinkState::Open
    }

    pub(crate) fn register_reply(
        &self,
        seq: String,
        sink: Box<dyn FnOnce(ReplyOutcome) + Send>,
    ) {
        self.pending.register(seq, self.request_timeout, sink);
    }

    pub(crate) fn register_reply_with(
        &self,
        seq: String,
        deadline: Duration,
        sink: Box<dyn FnOnce(ReplyOutcome) + Send>,
    ) {
        self.pending.register(seq, deadline, sink);
    }

    /// Write now, or queue for the next open. The queue is bounded; overflow
    /// drops the oldest frame.
    pub(crate) fn push_frame(&self, frame: &Frame) {
        let text = match frame.encode() {
            Ok(text) => text,
            Err(e) => {
                tracing::warn!(error = %e, "outbound frame failed to encode");
                return;
            }
        };
        let writer = self.writer.lock().expect("writer lock poisoned").clone();
        if self.is_open() {
            if let Some(writer) = writer {
                let _ = writer.send(Message::Text(text.into()));
                return;
            }
        }
        let mut buffer = self.send_buffer.lock().expect("send buffer lock poisoned");
        if buffer.len() >= limits::SEND_BUFFER_CAP {
            buffer.pop_front();
        }
        buffer.push_back(text);
    }

    pub(crate) async fn fetch_token(&self) -> Option<String> {
        if let Some(provider) = &self.token_provider {
            return provider().await;
        }
        self.access_token
            .lock()
            .expect("token lock poisoned")
            .clone()
    }

    fn channels_snapshot(&self) -> Vec<Channel> {
        self.channels.lock().expect("channels lock poisoned").clone()
    }

    fn hb_hook(&self) -> Option<HeartbeatHook> {
        self.hb_hook.lock().expect("hook lock poisoned").clone()
    }

    fn emit_heartbeat(&self, status: HeartbeatStatus, rtt: Option<Duration>) {
        if let Some(hook) = self.hb_hook() {
            hook(status, rtt);
        }
    }

    /// FIFO drain of frames queued while the link was down. Stops early if
    /// the link flips away from open mid-drain.
    fn flush_send_buffer(&self) {
        loop {
            let next = {
                if !self.is_open() {
                    return;
                }
                self.send_buffer
                    .lock()
                    .expect("send buffer lock poisoned")
                    .pop_front()
            };
            let Some(text) = next else {
                return;
            };
            let writer = self.writer.lock().expect("writer lock poisoned").clone();
            match writer {
                Some(writer) => {
                    let _ = writer.send(Message::Text(text.into()));
                }
                None => return,
            }
        }
    }

    /// One heartbeat interval tick. Returns false on liveness failure, which
    /// closes the link.
    fn heartbeat_tick(&self, writer: &mpsc::UnboundedSender<Message>) -> bool {
        let seq = self.next_seq();
        let action = self
            .heartbeat
            .lock()
            .expect("heartbeat lock poisoned")
            .tick(seq);
        match action {
            TickAction::Probe(seq) => {
                let frame =
                    Frame::request(None, seq, SYSTEM_TOPIC, protocol::event::HEARTBEAT, json!({}));
                if let Ok(text) = frame.encode() {
                    let _ = writer.send(Message::Text(text.into()));
                }
                self.emit_heartbeat(HeartbeatStatus::Sent, None);
                true
            }
            TickAction::LivenessFailure => {
                tracing::warn!("heartbeat timed out, closing link");
                self.emit_heartbeat(HeartbeatStatus::Timeout, None);
                let _ = writer.send(Message::Close(Some(CloseFrame {
                    code: CloseCode::Normal,
                    reason: "heartbeat timeout".into(),
                })));
                false
            }
        }
    }

    /// Route one inbound wire message.
    fn dispatch(&self, text: &str) {
        let frame = match Frame::decode(text) {
            Ok(frame) => frame,
            Err(e) => {
                tracing::debug!(error = %e, "undecodable frame dropped");
                return;
            }
        };

        if frame.is_reply() {
            let Some(seq) = frame.seq else {
                return;
            };
            if frame.topic == SYSTEM_TOPIC {
                let probe_ok = Reply::parse(&frame.payload).map_or(true, |r| r.ok);
                let rtt = self
                    .heartbeat
                    .lock()
                    .expect("heartbeat lock poisoned")
                    .settle(&seq);
                if rtt.is_some() {
                    if probe_ok {
                        self.emit_heartbeat(HeartbeatStatus::Ok, rtt);
                    } else {
                        self.emit_heartbeat(HeartbeatStatus::Error, None);
                    }
                }
                return;
            }
            let outcome = match Reply::parse(&frame.payload) {
                Some(reply) if reply.ok => ReplyOutcome::Ok(reply.response),
                Some(reply) => ReplyOutcome::Error(reply.response),
                None => ReplyOutcome::Error(frame.payload),
            };
            if !self.pending.settle(&seq, outcome) {
                tracing::debug!(seq = %seq, "reply after deadline discarded");
            }
            return;
        }

        let channel = self
            .channels
            .lock()
            .expect("channels lock poisoned")
            .iter()
            .find(|ch| ch.topic() == frame.topic)
            .cloned();
        match channel {
            Some(channel) => channel.handle_frame(frame),
            None => tracing::debug!(topic = %frame.topic, "frame for unknown channel dropped"),
        }
    }
}

/// The client socket. Cloneable; all state lives in the shared core.
#[derive(Clone)]
pub struct Socket {
    core: Arc<SocketCore>,
}

impl Socket {
    pub fn new(options: SocketOptions) -> Self {
        let schedule = options.reconnect_schedule.clone();
        Self {
            core: Arc::new(SocketCore {
                url: options.url,
                heartbeat_interval: options.heartbeat_interval,
                request_timeout: options.request_timeout,
                schedule: schedule.clone(),
                state: Mutex::new(LinkState::Closed),
                seq: SequenceAllocator::new(),
                pending: PendingReplies::new(),
                writer: Mutex::new(None),
                send_buffer: Mutex::new(VecDeque::new()),
                channels: Mutex::new(Vec::new()),
                heartbeat: Mutex::new(Heartbeat::new()),
                hb_hook: Mutex::new(None),
                reconnect: Mutex::new(ReconnectTimer::new(schedule)),
                shutdown: AtomicBool::new(false),
                access_token: Mutex::new(options.access_token),
                token_provider: options.token_provider,
            }),
        }
    }

    /// Start the connection driver. Returns immediately; reconnection is
    /// automatic until `disconnect`.
    pub fn connect(&self) {
        let core = self.core.clone();
        tokio::spawn(async move {
            run_driver(core).await;
        });
    }

    pub fn is_open(&self) -> bool {
        self.core.is_open()
    }

    /// Poll until the link is open. Convenience for startup sequencing.
    pub async fn wait_until_open(&self, timeout: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + timeout;
        while tokio::time::Instant::now() < deadline {
            if self.is_open() {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        self.is_open()
    }

    /// Clean shutdown: closes the link and cancels reconnection.
    pub fn disconnect(&self) {
        self.core.shutdown.store(true, Ordering::SeqCst);
        *self.core.state.lock().expect("state lock poisoned") = LinkState::Closing;
        let writer = self.core.writer.lock().expect("writer lock poisoned").clone();
        if let Some(writer) = writer {
            let _ = writer.send(Message::Close(Some(CloseFrame {
                code: CloseCode::Normal,
                reason: "client disconnect".into(),
            })));
        }
    }

    /// Get or create the channel for a topic. At most one channel exists per
    /// topic per socket.
    pub fn channel(&self, topic: impl Into<String>, config: ChannelConfig) -> Channel {
        let topic = topic.into();
        let mut channels = self.core.channels.lock().expect("channels lock poisoned");
        if let Some(existing) = channels.iter().find(|ch| ch.topic() == topic) {
            return existing.clone();
        }
        let channel = Channel::new(self.core.clone(), topic, config);
        channels.push(channel.clone());
        channel
    }

    /// Unsubscribe a channel and drop it from the socket.
    pub async fn remove_channel(&self, channel: &Channel) -> RemoveStatus {
        let status = channel.unsubscribe(None).await;
        self.core
            .channels
            .lock()
            .expect("channels lock poisoned")
            .retain(|ch| ch.topic() != channel.topic());
        status
    }

    /// Store a literal bearer token and push it to every joined channel.
    pub fn set_auth(&self, token: impl Into<String>) {
        let token = token.into();
        *self.core.access_token.lock().expect("token lock poisoned") = Some(token.clone());
        for channel in self.core.channels_snapshot() {
            channel.push_access_token(&token);
        }
    }

    pub fn on_heartbeat(&self, hook: HeartbeatHook) {
        *self.core.hb_hook.lock().expect("hook lock poisoned") = Some(hook);
    }

    pub fn heartbeat_stats(&self) -> RttStats {
        self.core
            .heartbeat
            .lock()
            .expect("heartbeat lock poisoned")
            .stats
            .clone()
    }

    /// Outstanding request count, for diagnostics.
    pub fn pending_requests(&self) -> usize {
        self.core.pending.outstanding()
    }

    pub(crate) fn core(&self) -> Arc<SocketCore> {
        self.core.clone()
    }
}

// ---------------------------------------------------------------------------
// Connection driver
// ---------------------------------------------------------------------------

async fn run_driver(core: Arc<SocketCore>) {
    loop {
        if core.shutdown.load(Ordering::SeqCst) {
            break;
        }
        *core.state.lock().expect("state lock poisoned") = LinkState::Connecting;

        match connect_async(core.url.as_str()).await {
            Ok((ws, _response)) => {
                run_link(&core, ws).await;
            }
            Err(e) => {
                tracing::debug!(error = %e, "connect attempt failed");
            }
        }

        if core.shutdown.load(Ordering::SeqCst) {
            break;
        }
        let delay = core
            .reconnect
            .lock()
            .expect("reconnect lock poisoned")
            .next_delay();
        tracing::debug!(delay_ms = delay.as_millis() as u64, "reconnecting");
        tokio::time::sleep(delay).await;
    }
    *core.state.lock().expect("state lock poisoned") = LinkState::Closed;
}

async fn run_link(
    core: &Arc<SocketCore>,
    ws: tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>,
) {
    let (mut sink, mut stream) = ws.split();
    let (tx, mut rx) = mpsc::unbounded_channel::<Message>();

    *core.writer.lock().expect("writer lock poisoned") = Some(tx.clone());
    *core.state.lock().expect("state lock poisoned") = LinkState::Open;
    core.reconnect
        .lock()
        .expect("reconnect lock poisoned")
        .reset();
    tracing::debug!("link open");

    let write_task = tokio::spawn(async move {
        while let Some(msg) = rx.recv().await {
            if sink.send(msg).await.is_err() {
                break;
            }
        }
        let _ = sink.close().await;
    });

    core.flush_send_buffer();
    for channel in core.channels_snapshot() {
        channel.on_socket_open();
    }

    let mut hb = tokio::time::interval(core.heartbeat_interval);
    hb.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    hb.tick().await; // first tick fires immediately; skip it

    loop {
        tokio::select! {
            msg = stream.next() => match msg {
                Some(Ok(Message::Text(text))) => core.dispatch(text.as_str()),
                Some(Ok(Message::Ping(payload))) => {
                    let _ = tx.send(Message::Pong(payload));
                }
                Some(Ok(Message::Close(_))) | None => break,
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    tracing::debug!(error = %e, "link read error");
                    break;
                }
            },
            _ = hb.tick() => {
                if !core.heartbeat_tick(&tx) {
                    break;
                }
            }
        }
    }

    // Teardown: cancel in-flight requests, then let every channel react.
    *core.writer.lock().expect("writer lock poisoned") = None;
    if !core.shutdown.load(Ordering::SeqCst) {
        *core.state.lock().expect("state lock poisoned") = LinkState::Closed;
    }
    drop(tx);
    let _ = write_task.await;

    core.pending.settle_all(ReplyOutcome::Timeout);
    core.heartbeat
        .lock()
        .expect("heartbeat lock poisoned")
        .clear();
    core.emit_heartbeat(HeartbeatStatus::Disconnected, None);
    for channel in core.channels_snapshot() {
        channel.on_socket_close();
    }
    tracing::debug!("link closed");
}
