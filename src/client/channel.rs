//! Client channel: one subscription to a topic, multiplexed over the socket.
//!
//! States: `closed` (initial), `joining`, `joined`, `leaving`, `errored`.
//! A channel that ever reached `joined` rejoins automatically after an
//! unclean transport close, and re-tracks its last presence meta once the
//! rejoin succeeds. Join failures with an auth-family error code suppress
//! auto-rejoin until credentials are refreshed and `subscribe` is called
//! again.
//!
//! Presence callbacks receive the reconciled state as an argument; they must
//! not call back into `presence_state()` from inside the callback.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde_json::{Value, json};

use crate::error::is_auth_code;
use crate::limits;
use crate::protocol::{self, ChannelConfig, Frame};

use super::backoff::ReconnectTimer;
use super::presence::{PresenceMeta, PresenceReconciler, PresenceState};
use super::sequence::ReplyOutcome;
use super::socket::SocketCore;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
    Closed,
    Joining,
    Joined,
    Leaving,
    Errored,
}

/// Terminal subscribe outcomes delivered to the subscribe callback.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscribeStatus {
    Subscribed,
    TimedOut,
    Closed,
    ChannelError,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendStatus {
    Ok,
    Error,
    Timeout,
}

/// Resolution of `send`, `track`, and `untrack`. `response` holds the full
/// error object for codes that carry extra fields (e.g. `retry_after` on
/// rate-limit errors).
#[derive(Debug, Clone)]
pub struct SendResult {
    pub status: SendStatus,
    pub code: Option<String>,
    pub reason: Option<String>,
    pub response: Option<Value>,
}

impl SendResult {
    fn ok() -> Self {
        Self {
            status: SendStatus::Ok,
            code: None,
            reason: None,
            response: None,
        }
    }

    fn from_outcome(outcome: ReplyOutcome) -> Self {
        match outcome {
            ReplyOutcome::Ok(_) => Self::ok(),
            ReplyOutcome::Error(resp) => Self {
                status: SendStatus::Error,
                code: resp
                    .get("code")
                    .and_then(Value::as_str)
                    .map(str::to_owned),
                reason: resp
                    .get("reason")
                    .and_then(Value::as_str)
                    .map(str::to_owned),
                response: Some(resp),
            },
            ReplyOutcome::Timeout => Self {
                status: SendStatus::Timeout,
                code: None,
                reason: None,
                response: None,
            },
        }
    }
}

/// Resolution of `unsubscribe` / `remove_channel`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemoveStatus {
    Ok,
    Error,
    TimedOut,
}

pub type SubscribeCallback = Arc<dyn Fn(SubscribeStatus, Option<Value>) + Send + Sync>;

struct BroadcastListener {
    /// `None` is the wildcard: every broadcast event matches.
    event: Option<String>,
    cb: Arc<dyn Fn(&str, &Value) + Send + Sync>,
}

pub(crate) struct ChannelInner {
    topic: String,
    config: ChannelConfig,
    socket: Arc<SocketCore>,
    state: Mutex<ChannelState>,
    join_seq: Mutex<Option<String>>,
    was_joined: AtomicBool,
    wants_rejoin: AtomicBool,
    auth_blocked: AtomicBool,
    tracked_meta: Mutex<Option<Value>>,
    prejoin: Mutex<VecDeque<Frame>>,
    listeners: Mutex<Vec<BroadcastListener>>,
    system_error_hooks: Mutex<Vec<Arc<dyn Fn(&Value) + Send + Sync>>>,
    presence: Mutex<PresenceReconciler>,
    subscribe_cb: Mutex<Option<SubscribeCallback>>,
    rejoin_timer: Mutex<ReconnectTimer>,
}

/// Public channel handle. Cloneable; all state is shared.
#[derive(Clone)]
pub struct Channel {
    inner: Arc<ChannelInner>,
}

impl Channel {
    pub(crate) fn new(socket: Arc<SocketCore>, topic: String, config: ChannelConfig) -> Self {
        let schedule = socket.schedule.clone();
        Self {
            inner: Arc::new(ChannelInner {
                topic,
                config,
                socket,
                state: Mutex::new(ChannelState::Closed),
                join_seq: Mutex::new(None),
                was_joined: AtomicBool::new(false),
                wants_rejoin: AtomicBool::new(false),
                auth_blocked: AtomicBool::new(false),
                tracked_meta: Mutex::new(None),
                prejoin: Mutex::new(VecDeque::new()),
                listeners: Mutex::new(Vec::new()),
                system_error_hooks: Mutex::new(Vec::new()),
                presence: Mutex::new(PresenceReconciler::new()),
                subscribe_cb: Mutex::new(None),
                rejoin_timer: Mutex::new(ReconnectTimer::new(schedule)),
            }),
        }
    }

    pub fn topic(&self) -> &str {
        &self.inner.topic
    }

    pub fn config(&self) -> &ChannelConfig {
        &self.inner.config
    }

    pub fn state(&self) -> ChannelState {
        *self.inner.state.lock().expect("state lock poisoned")
    }

    /// Begin joining. The callback receives each terminal outcome:
    /// `Subscribed`, `TimedOut`, `Closed`, or `ChannelError` (with the error
    /// response). A channel already joined fires `Subscribed` immediately
    /// without re-sending the join.
    pub fn subscribe<F>(&self, cb: F)
    where
        F: Fn(SubscribeStatus, Option<Value>) + Send + Sync + 'static,
    {
        let cb: SubscribeCallback = Arc::new(cb);
        let already_joined = self.state() == ChannelState::Joined;
        *self
            .inner
            .subscribe_cb
            .lock()
            .expect("subscribe cb lock poisoned") = Some(cb.clone());
        self.inner.auth_blocked.store(false, Ordering::SeqCst);

        if already_joined {
            cb(SubscribeStatus::Subscribed, None);
            return;
        }
        let inner = self.inner.clone();
        tokio::spawn(async move {
            inner.do_join().await;
        });
    }

    /// Subscribe and await the first terminal outcome.
    pub async fn join(&self) -> (SubscribeStatus, Option<Value>) {
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        self.subscribe(move |status, err| {
            let _ = tx.send((status, err));
        });
        rx.recv().await.unwrap_or((SubscribeStatus::Closed, None))
    }

    /// Leave the channel. Ends in `closed` whatever the reply outcome; the
    /// returned status reports which outcome it was.
    pub async fn unsubscribe(&self, timeout: Option<Duration>) -> RemoveStatus {
        let inner = &self.inner;
        *inner.state.lock().expect("state lock poisoned") = ChannelState::Leaving;
        inner.was_joined.store(false, Ordering::SeqCst);
        inner.wants_rejoin.store(false, Ordering::SeqCst);
        *inner
            .tracked_meta
            .lock()
            .expect("tracked meta lock poisoned") = None;

        let deadline = timeout.unwrap_or(inner.socket.request_timeout);
        let seq = inner.socket.next_seq();
        let (tx, rx) = tokio::sync::oneshot::channel();
        inner.socket.register_reply_with(
            seq.clone(),
            deadline,
            Box::new(move |outcome| {
                let _ = tx.send(outcome);
            }),
        );
        let frame = Frame::request(
            inner.current_join_seq(),
            seq,
            &inner.topic,
            protocol::event::LEAVE,
            json!({}),
        );
        inner.socket.push_frame(&frame);

        let outcome = rx.await.unwrap_or(ReplyOutcome::Timeout);
        *inner.state.lock().expect("state lock poisoned") = ChannelState::Closed;
        *inner.join_seq.lock().expect("join seq lock poisoned") = None;
        match outcome {
            ReplyOutcome::Ok(_) => RemoveStatus::Ok,
            ReplyOutcome::Error(_) => RemoveStatus::Error,
            ReplyOutcome::Timeout => RemoveStatus::TimedOut,
        }
    }

    /// Broadcast to the channel. With `broadcast.ack` the result reflects
    /// the server reply; otherwise it resolves ok on enqueue.
    pub async fn send(&self, event: &str, payload: Value) -> SendResult {
        let body = json!({"type": "broadcast", "event": event, "payload": payload});
        if self.inner.config.broadcast.ack {
            let outcome = self.inner.request(protocol::event::BROADCAST, body).await;
            SendResult::from_outcome(outcome)
        } else {
            self.inner
                .push_or_buffer(self.inner.build_notify(protocol::event::BROADCAST, body));
            SendResult::ok()
        }
    }

    /// Track presence meta under this channel's presence key. The meta is
    /// remembered and re-tracked automatically after a reconnect rejoin.
    pub async fn track(&self, meta: Value) -> SendResult {
        *self
            .inner
            .tracked_meta
            .lock()
            .expect("tracked meta lock poisoned") = Some(meta.clone());
        let outcome = self
            .inner
            .request(
                protocol::event::PRESENCE,
                json!({"event": "track", "payload": {"meta": meta}}),
            )
            .await;
        SendResult::from_outcome(outcome)
    }

    /// Remove this channel's presence and forget the stored meta.
    pub async fn untrack(&self) -> SendResult {
        *self
            .inner
            .tracked_meta
            .lock()
            .expect("tracked meta lock poisoned") = None;
        let outcome = self
            .inner
            .request(protocol::event::PRESENCE, json!({"event": "untrack"}))
            .await;
        SendResult::from_outcome(outcome)
    }

    /// Register a broadcast listener. `event = None` is the wildcard.
    pub fn on_broadcast<F>(&self, event: Option<&str>, cb: F)
    where
        F: Fn(&str, &Value) + Send + Sync + 'static,
    {
        self.inner
            .listeners
            .lock()
            .expect("listeners lock poisoned")
            .push(BroadcastListener {
                event: event.map(str::to_owned),
                cb: Arc::new(cb),
            });
    }

    pub fn on_presence_sync<F>(&self, cb: F)
    where
        F: Fn(&PresenceState) + Send + Sync + 'static,
    {
        self.inner
            .presence
            .lock()
            .expect("presence lock poisoned")
            .on_sync(Box::new(cb));
    }

    pub fn on_presence_join<F>(&self, cb: F)
    where
        F: Fn(&str, &[PresenceMeta]) + Send + Sync + 'static,
    {
        self.inner
            .presence
            .lock()
            .expect("presence lock poisoned")
            .on_join(Box::new(cb));
    }

    pub fn on_presence_leave<F>(&self, cb: F)
    where
        F: Fn(&str, &[PresenceMeta]) + Send + Sync + 'static,
    {
        self.inner
            .presence
            .lock()
            .expect("presence lock poisoned")
            .on_leave(Box::new(cb));
    }

    /// Listener for unsolicited `chan:error` frames.
    pub fn on_system_error<F>(&self, cb: F)
    where
        F: Fn(&Value) + Send + Sync + 'static,
    {
        self.inner
            .system_error_hooks
            .lock()
            .expect("error hooks lock poisoned")
            .push(Arc::new(cb));
    }

    /// Snapshot of the reconciled presence state.
    pub fn presence_state(&self) -> PresenceState {
        self.inner
            .presence
            .lock()
            .expect("presence lock poisoned")
            .state()
    }

    // -- socket-facing entry points -----------------------------------------

    pub(crate) fn handle_frame(&self, frame: Frame) {
        self.inner.handle_frame(frame);
    }

    pub(crate) fn on_socket_open(&self) {
        self.inner.on_socket_open();
    }

    pub(crate) fn on_socket_close(&self) {
        self.inner.on_socket_close();
    }

    pub(crate) fn push_access_token(&self, token: &str) {
        if *self.inner.state.lock().expect("state lock poisoned") == ChannelState::Joined {
            let frame = self
                .inner
                .build_notify(protocol::event::ACCESS_TOKEN, json!({"access_token": token}));
            self.inner.socket.push_frame(&frame);
        }
    }
}

impl ChannelInner {
    fn current_join_seq(&self) -> Option<String> {
        self.join_seq.lock().expect("join seq lock poisoned").clone()
    }

    fn build_notify(&self, event: &str, payload: Value) -> Frame {
        Frame {
            join_seq: self.current_join_seq(),
            seq: None,
            topic: self.topic.clone(),
            event: event.to_owned(),
            payload,
        }
    }

    /// Send now when joined, otherwise park in the pre-join buffer. The
    /// buffer is bounded; overflow drops the oldest entry.
    fn push_or_buffer(&self, frame: Frame) {
        if *self.state.lock().expect("state lock poisoned") == ChannelState::Joined {
            self.socket.push_frame(&frame);
            return;
        }
        let mut buffer = self.prejoin.lock().expect("prejoin lock poisoned");
        if buffer.len() >= limits::PREJOIN_BUFFER_CAP {
            buffer.pop_front();
        }
        buffer.push_back(frame);
    }

    /// Request through the pre-join buffer. The sequence and deadline are
    /// fixed at enqueue, so a request parked across a slow join can still
    /// time out.
    async fn request(&self, event: &str, payload: Value) -> ReplyOutcome {
        let seq = self.socket.next_seq();
        let (tx, rx) = tokio::sync::oneshot::channel();
        self.socket.register_reply(
            seq.clone(),
            Box::new(move |outcome| {
                let _ = tx.send(outcome);
            }),
        );
        let frame = Frame::request(self.current_join_seq(), seq, &self.topic, event, payload);
        self.push_or_buffer(frame);
        rx.await.unwrap_or(ReplyOutcome::Timeout)
    }

    /// Request whose outcome nobody awaits (automatic re-track).
    fn fire_request(&self, event: &str, payload: Value) {
        let seq = self.socket.next_seq();
        self.socket.register_reply(seq.clone(), Box::new(|_| {}));
        let frame = Frame::request(self.current_join_seq(), seq, &self.topic, event, payload);
        self.socket.push_frame(&frame);
    }

    async fn do_join(self: Arc<Self>) {
        *self.state.lock().expect("state lock poisoned") = ChannelState::Joining;

        let token = self.socket.fetch_token().await;
        let seq = self.socket.next_seq();
        *self.join_seq.lock().expect("join seq lock poisoned") = Some(seq.clone());

        let mut payload = json!({"config": self.config});
        if let Some(token) = token {
            payload["access_token"] = Value::String(token);
        }

        let me = self.clone();
        self.socket.register_reply(
            seq.clone(),
            Box::new(move |outcome| me.handle_join_reply(outcome)),
        );
        let frame = Frame::request(
            Some(seq.clone()),
            seq,
            &self.topic,
            protocol::event::JOIN,
            payload,
        );
        self.socket.push_frame(&frame);
    }

    fn handle_join_reply(self: Arc<Self>, outcome: ReplyOutcome) {
        match outcome {
            ReplyOutcome::Ok(_) => {
                {
                    let mut state = self.state.lock().expect("state lock poisoned");
                    if *state != ChannelState::Joining {
                        return;
                    }
                    *state = ChannelState::Joined;
                }
                self.was_joined.store(true, Ordering::SeqCst);
                self.rejoin_timer
                    .lock()
                    .expect("rejoin timer lock poisoned")
                    .reset();
                self.fire_subscribe(SubscribeStatus::Subscribed, None);

                // Restore presence, then release anything composed pre-join.
                let meta = self
                    .tracked_meta
                    .lock()
                    .expect("tracked meta lock poisoned")
                    .clone();
                if let Some(meta) = meta {
                    self.fire_request(
                        protocol::event::PRESENCE,
                        json!({"event": "track", "payload": {"meta": meta}}),
                    );
                }
                loop {
                    let buffered = self
                        .prejoin
                        .lock()
                        .expect("prejoin lock poisoned")
                        .pop_front();
                    match buffered {
                        Some(frame) => self.socket.push_frame(&frame),
                        None => break,
                    }
                }
            }
            ReplyOutcome::Error(resp) => {
                {
                    let mut state = self.state.lock().expect("state lock poisoned");
                    if *state != ChannelState::Joining {
                        return;
                    }
                    *state = ChannelState::Errored;
                }
                let auth = resp
                    .get("code")
                    .and_then(Value::as_str)
                    .is_some_and(is_auth_code);
                self.fire_subscribe(SubscribeStatus::ChannelError, Some(resp));
                if auth {
                    // Credentials must be refreshed explicitly; no rejoin.
                    self.auth_blocked.store(true, Ordering::SeqCst);
                } else {
                    self.arm_rejoin();
                }
            }
            ReplyOutcome::Timeout => {
                {
                    let mut state = self.state.lock().expect("state lock poisoned");
                    if *state != ChannelState::Joining {
                        return;
                    }
                    *state = ChannelState::Errored;
                }
                self.fire_subscribe(SubscribeStatus::TimedOut, None);
                self.arm_rejoin();
            }
        }
    }

    fn arm_rejoin(self: &Arc<Self>) {
        let delay = self
            .rejoin_timer
            .lock()
            .expect("rejoin timer lock poisoned")
            .next_delay();
        let me = self.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if me.auth_blocked.load(Ordering::SeqCst) {
                return;
            }
            if *me.state.lock().expect("state lock poisoned") != ChannelState::Errored {
                return;
            }
            if me.socket.is_open() {
                me.clone().do_join().await;
            } else {
                // The link is down; rejoin fires when it reopens.
                me.wants_rejoin.store(true, Ordering::SeqCst);
            }
        });
    }

    fn on_socket_open(self: &Arc<Self>) {
        let rejoin = !self.auth_blocked.load(Ordering::SeqCst)
            && (self.wants_rejoin.swap(false, Ordering::SeqCst)
                || (self.was_joined.load(Ordering::SeqCst)
                    && *self.state.lock().expect("state lock poisoned") == ChannelState::Errored));
        if rejoin {
            let me = self.clone();
            tokio::spawn(async move {
                me.do_join().await;
            });
        }
    }

    fn on_socket_close(self: &Arc<Self>) {
        let mut state = self.state.lock().expect("state lock poisoned");
        if *state == ChannelState::Joining || *state == ChannelState::Joined {
            *state = ChannelState::Errored;
            drop(state);
            if self.was_joined.load(Ordering::SeqCst) {
                self.wants_rejoin.store(true, Ordering::SeqCst);
            }
        }
    }

    fn fire_subscribe(&self, status: SubscribeStatus, err: Option<Value>) {
        let cb = self
            .subscribe_cb
            .lock()
            .expect("subscribe cb lock poisoned")
            .clone();
        if let Some(cb) = cb {
            cb(status, err);
        }
    }

    fn handle_frame(&self, frame: Frame) {
        match frame.event.as_str() {
            protocol::event::BROADCAST => {
                let event = frame
                    .payload
                    .get("event")
                    .and_then(Value::as_str)
                    .unwrap_or("")
                    .to_owned();
                let payload = frame
                    .payload
                    .get("payload")
                    .cloned()
                    .unwrap_or(Value::Null);
                let matching: Vec<_> = self
                    .listeners
                    .lock()
                    .expect("listeners lock poisoned")
                    .iter()
                    .filter(|l| l.event.as_deref().is_none_or(|e| e == event))
                    .map(|l| l.cb.clone())
                    .collect();
                for cb in matching {
                    cb(&event, &payload);
                }
            }
            protocol::event::PRESENCE_STATE => {
                self.presence
                    .lock()
                    .expect("presence lock poisoned")
                    .handle_state(&frame.payload);
            }
            protocol::event::PRESENCE_DIFF => {
                self.presence
                    .lock()
                    .expect("presence lock poisoned")
                    .handle_diff(&frame.payload);
            }
            protocol::event::CLOSE => {
                *self.state.lock().expect("state lock poisoned") = ChannelState::Closed;
                self.was_joined.store(false, Ordering::SeqCst);
                self.fire_subscribe(SubscribeStatus::Closed, None);
            }
            protocol::event::ERROR => {
                let hooks: Vec<_> = self
                    .system_error_hooks
                    .lock()
                    .expect("error hooks lock poisoned")
                    .iter()
                    .cloned()
                    .collect();
                for hook in hooks {
                    hook(&frame.payload);
                }
            }
            other => {
                tracing::debug!(topic = %self.topic, event = other, "unhandled channel frame");
            }
        }
    }
}
