//! Inbound frame routing. One router call per decoded frame, invoked from the
//! link's read loop, so frames from a single link are handled in arrival
//! order.

use std::sync::atomic::Ordering;

use serde_json::{Value, json};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::protocol::Message;

use crate::error::code;
use crate::limits;
use crate::protocol::{self, ChannelConfig, Frame, SYSTEM_TOPIC};

use super::SharedState;
use super::channels::{ChannelMember, JoinError};
use super::fabric::FabricEventKind;
use super::presence::{self, TrackOutcome};
use super::rate_limit::TokenBucket;

/// Per-link routing context, owned by the read loop.
pub(crate) struct ConnContext {
    pub conn_id: String,
    pub tx: mpsc::UnboundedSender<Message>,
    pub bucket: TokenBucket,
}

/// Entry point for one raw text message off the wire.
pub(crate) fn handle_text(state: &SharedState, ctx: &mut ConnContext, text: &str) {
    state.metrics.frames_received.fetch_add(1, Ordering::Relaxed);

    if text.len() > limits::MAX_MESSAGE_BYTES {
        // Decode only to recover the sequence for an addressable error reply.
        if let Ok(frame) = Frame::decode(text) {
            if let Some(seq) = frame.seq {
                reply_error(ctx, &seq, &frame.topic, code::MESSAGE_TOO_LARGE, "Message exceeds maximum size");
                return;
            }
        }
        state.metrics.frames_dropped.fetch_add(1, Ordering::Relaxed);
        tracing::debug!(conn = %ctx.conn_id, len = text.len(), "oversize frame dropped");
        return;
    }

    let frame = match Frame::decode(text) {
        Ok(frame) => frame,
        Err(e) => {
            state.metrics.frames_dropped.fetch_add(1, Ordering::Relaxed);
            tracing::debug!(conn = %ctx.conn_id, error = %e, "undecodable frame dropped");
            return;
        }
    };

    handle_frame(state, ctx, text.len(), frame);
}

fn handle_frame(state: &SharedState, ctx: &mut ConnContext, wire_len: usize, frame: Frame) {
    match frame.event.as_str() {
        protocol::event::HEARTBEAT if frame.topic == SYSTEM_TOPIC => {
            if let Some(seq) = &frame.seq {
                send_frame(&ctx.tx, &Frame::reply_ok(seq.clone(), SYSTEM_TOPIC, json!({})));
            }
        }
        protocol::event::JOIN => handle_join(state, ctx, frame),
        protocol::event::LEAVE => handle_leave(state, ctx, frame),
        protocol::event::BROADCAST => handle_broadcast(state, ctx, wire_len, frame),
        protocol::event::PRESENCE => handle_presence(state, ctx, frame),
        protocol::event::ACCESS_TOKEN => {
            // Token refresh notification; membership is re-verified on the
            // next join, nothing to update mid-stream.
            if let Some(seq) = &frame.seq {
                send_frame(&ctx.tx, &Frame::reply_ok(seq.clone(), frame.topic.clone(), json!({})));
            }
        }
        other => {
            state.metrics.frames_dropped.fetch_add(1, Ordering::Relaxed);
            tracing::warn!(conn = %ctx.conn_id, event = other, "unknown event dropped");
        }
    }
}

// ---------------------------------------------------------------------------
// chan:join
// ---------------------------------------------------------------------------

fn handle_join(state: &SharedState, ctx: &mut ConnContext, frame: Frame) {
    let Some(seq) = frame.seq.clone() else {
        tracing::debug!(conn = %ctx.conn_id, "join without sequence dropped");
        return;
    };
    let topic = frame.topic.clone();

    if topic.len() > limits::MAX_TOPIC_LEN {
        reply_error(ctx, &seq, &topic, code::MESSAGE_MALFORMED, "Topic name too long");
        return;
    }

    let config: ChannelConfig = match frame.payload.get("config") {
        Some(raw) => match serde_json::from_value(raw.clone()) {
            Ok(cfg) => cfg,
            Err(_) => {
                reply_error(ctx, &seq, &topic, code::MESSAGE_MALFORMED, "Invalid channel config");
                return;
            }
        },
        None => ChannelConfig::default(),
    };

    if let Some(jwt) = &state.auth {
        let token = frame
            .payload
            .get("access_token")
            .and_then(Value::as_str)
            .unwrap_or("");
        if token.is_empty() {
            reply_error(ctx, &seq, &topic, code::AUTH_MISSING, "Missing access token");
            return;
        }
        let claims = match crate::auth::verify(token, jwt) {
            Ok(claims) => claims,
            Err(e) => {
                reply_error(ctx, &seq, &topic, e.code(), &e.to_string());
                return;
            }
        };
        if !crate::auth::can_access_channel(&claims, &topic) {
            reply_error(ctx, &seq, &topic, code::AUTH_FORBIDDEN, "Channel not permitted");
            return;
        }
    }

    let first_member = state.channels.member_count(&topic) == 0;
    let member = ChannelMember {
        conn_id: ctx.conn_id.clone(),
        join_seq: seq.clone(),
        config: config.clone(),
        tx: ctx.tx.clone(),
    };
    match state.channels.join(&topic, member) {
        Ok(()) => {}
        Err(JoinError::AlreadyJoined) => {
            reply_error(ctx, &seq, &topic, code::CHANNEL_ALREADY_JOINED, "Already a member");
            return;
        }
        Err(JoinError::ChannelFull) => {
            reply_error(ctx, &seq, &topic, code::CHANNEL_FULL, "Channel is full");
            return;
        }
        Err(JoinError::TooManySubscriptions) => {
            reply_error(ctx, &seq, &topic, code::SYSTEM_OVERLOAD, "Subscription limit reached");
            return;
        }
    }

    if first_member {
        state.fabric_subscribe(&topic);
    }

    send_frame(&ctx.tx, &Frame::reply_ok(seq, topic.clone(), json!({})));

    // The joiner always receives its snapshot before any peer-originated
    // diff can be routed to it: both go through the same writer queue.
    if config.presence_enabled() {
        let snapshot = state.presence.snapshot(&topic);
        send_frame(
            &ctx.tx,
            &Frame::notify(topic, protocol::event::PRESENCE_STATE, snapshot),
        );
    }

    tracing::debug!(conn = %ctx.conn_id, "channel joined");
}

// ---------------------------------------------------------------------------
// chan:leave
// ---------------------------------------------------------------------------

fn handle_leave(state: &SharedState, ctx: &mut ConnContext, frame: Frame) {
    let topic = frame.topic.clone();

    untrack_member_presence(state, ctx, &topic);
    state.channels.leave(&topic, &ctx.conn_id);
    if !state.channels.topic_exists(&topic) {
        state.fabric_unsubscribe(&topic);
    }

    if let Some(seq) = frame.seq {
        send_frame(&ctx.tx, &Frame::reply_ok(seq, topic, json!({})));
    }
}

// ---------------------------------------------------------------------------
// broadcast
// ---------------------------------------------------------------------------

fn handle_broadcast(state: &SharedState, ctx: &mut ConnContext, wire_len: usize, frame: Frame) {
    let topic = frame.topic.clone();

    if !ctx.bucket.acquire(wire_len as f64) {
        let retry_after = ctx.bucket.retry_after_ms(wire_len as f64);
        if let Some(seq) = frame.seq {
            send_frame(
                &ctx.tx,
                &Frame::reply_error_with(
                    seq,
                    topic,
                    code::MESSAGE_RATE_LIMITED,
                    "Rate limit exceeded",
                    json!({"retry_after": retry_after}),
                ),
            );
        }
        return;
    }

    let Some(sender_cfg) = state.channels.member_config(&topic, &ctx.conn_id) else {
        let (reply_code, reason) = if state.channels.topic_exists(&topic) {
            (code::CHANNEL_FORBIDDEN, "Not a member of this channel")
        } else {
            (code::CHANNEL_NOT_FOUND, "Channel does not exist")
        };
        if let Some(seq) = frame.seq {
            reply_error(ctx, &seq, &topic, reply_code, reason);
        }
        return;
    };

    if let Some(event_name) = frame.payload.get("event").and_then(Value::as_str) {
        if event_name.len() > limits::MAX_EVENT_NAME_LEN {
            if let Some(seq) = frame.seq {
                reply_error(ctx, &seq, &topic, code::MESSAGE_MALFORMED, "Event name too long");
            }
            return;
        }
    }

    // Fan out the sender's payload verbatim, serialized once.
    let exclude = if sender_cfg.broadcast.include_self {
        None
    } else {
        Some(ctx.conn_id.as_str())
    };
    let out = Frame::notify(&topic, protocol::event::BROADCAST, frame.payload.clone());
    match out.encode() {
        Ok(text) => {
            state.channels.fanout(&topic, &text, exclude, &state.metrics);
        }
        Err(e) => {
            tracing::warn!(conn = %ctx.conn_id, error = %e, "broadcast failed to encode");
        }
    }

    state.fabric_publish(
        &topic,
        FabricEventKind::Broadcast {
            sender: ctx.conn_id.clone(),
            payload: frame.payload,
        },
    );

    if sender_cfg.broadcast.ack {
        if let Some(seq) = frame.seq {
            send_frame(&ctx.tx, &Frame::reply_ok(seq, topic, json!({})));
        }
    }
}

// ---------------------------------------------------------------------------
// presence (track / untrack)
// ---------------------------------------------------------------------------

fn handle_presence(state: &SharedState, ctx: &mut ConnContext, frame: Frame) {
    let topic = frame.topic.clone();
    let seq = frame.seq.clone();

    let Some(cfg) = state.channels.member_config(&topic, &ctx.conn_id) else {
        if let Some(seq) = seq {
            reply_error(ctx, &seq, &topic, code::CHANNEL_FORBIDDEN, "Not a member of this channel");
        }
        return;
    };
    if !cfg.presence_enabled() || cfg.presence.key.is_empty() {
        if let Some(seq) = seq {
            reply_error(ctx, &seq, &topic, code::PRESENCE_DISABLED, "Presence is not enabled");
        }
        return;
    }
    let key = cfg.presence.key.clone();

    match frame.payload.get("event").and_then(Value::as_str) {
        Some("track") => {
            let meta = frame
                .payload
                .get("payload")
                .and_then(|p| p.get("meta"))
                .cloned()
                .unwrap_or(Value::Null);
            let meta_len = meta.to_string().len();
            if meta_len > limits::MAX_PRESENCE_META_BYTES {
                if let Some(seq) = seq {
                    reply_error(ctx, &seq, &topic, code::PRESENCE_TOO_LARGE, "Presence payload too large");
                }
                return;
            }

            let presence_ref = match state.presence.track(&topic, &ctx.conn_id, &key, meta.clone()) {
                TrackOutcome::Joined { presence_ref } | TrackOutcome::Updated { presence_ref } => {
                    presence_ref
                }
                TrackOutcome::AtCapacity => {
                    if let Some(seq) = seq {
                        reply_error(ctx, &seq, &topic, code::SYSTEM_OVERLOAD, "Presence capacity reached");
                    }
                    return;
                }
            };

            let diff = presence::diff_payload(
                vec![(
                    key.clone(),
                    vec![presence::PresenceEntry {
                        presence_ref: presence_ref.clone(),
                        meta: meta.clone(),
                        owner: String::new(),
                    }],
                )],
                vec![],
            );
            send_presence_diff(state, &topic, diff);
            state.fabric_publish(
                &topic,
                FabricEventKind::PresenceTrack {
                    key,
                    presence_ref,
                    meta,
                },
            );
            if let Some(seq) = seq {
                send_frame(&ctx.tx, &Frame::reply_ok(seq, topic, json!({})));
            }
        }
        Some("untrack") => {
            if let Some(entry) = state.presence.untrack(&topic, &ctx.conn_id, &key) {
                let presence_ref = entry.presence_ref.clone();
                let diff = presence::diff_payload(vec![], vec![(key.clone(), vec![entry])]);
                send_presence_diff(state, &topic, diff);
                state.fabric_publish(
                    &topic,
                    FabricEventKind::PresenceUntrack { key, presence_ref },
                );
            }
            if let Some(seq) = seq {
                send_frame(&ctx.tx, &Frame::reply_ok(seq, topic, json!({})));
            }
        }
        _ => {
            if let Some(seq) = seq {
                reply_error(ctx, &seq, &topic, code::MESSAGE_MALFORMED, "Unknown presence event");
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Disconnect cleanup
// ---------------------------------------------------------------------------

/// Tear down everything a closed link owned: memberships first so the
/// departing link is excluded, then presence with one leave diff per topic.
pub(crate) fn handle_disconnect(state: &SharedState, conn_id: &str) {
    let left_topics = state.channels.remove_connection(conn_id);

    for (topic, leaves) in state.presence.remove_connection(conn_id) {
        for (key, entry) in &leaves {
            state.fabric_publish(
                &topic,
                FabricEventKind::PresenceUntrack {
                    key: key.clone(),
                    presence_ref: entry.presence_ref.clone(),
                },
            );
        }
        let grouped = leaves
            .into_iter()
            .map(|(key, entry)| (key, vec![entry]))
            .collect();
        let diff = presence::diff_payload(vec![], grouped);
        send_presence_diff(state, &topic, diff);
    }

    for topic in left_topics {
        if !state.channels.topic_exists(&topic) {
            state.fabric_unsubscribe(&topic);
        }
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn untrack_member_presence(state: &SharedState, ctx: &ConnContext, topic: &str) {
    let Some(cfg) = state.channels.member_config(topic, &ctx.conn_id) else {
        return;
    };
    if cfg.presence.key.is_empty() {
        return;
    }
    if let Some(entry) = state.presence.untrack(topic, &ctx.conn_id, &cfg.presence.key) {
        let presence_ref = entry.presence_ref.clone();
        let diff = presence::diff_payload(vec![], vec![(cfg.presence.key.clone(), vec![entry])]);
        send_presence_diff(state, topic, diff);
        state.fabric_publish(
            topic,
            FabricEventKind::PresenceUntrack {
                key: cfg.presence.key,
                presence_ref,
            },
        );
    }
}

/// Fan a `presence_diff` to every member of a topic.
pub(crate) fn send_presence_diff(state: &SharedState, topic: &str, diff: Value) {
    let frame = Frame::notify(topic, protocol::event::PRESENCE_DIFF, diff);
    if let Ok(text) = frame.encode() {
        state.channels.fanout(topic, &text, None, &state.metrics);
    }
}

fn send_frame(tx: &mpsc::UnboundedSender<Message>, frame: &Frame) {
    match frame.encode() {
        Ok(text) => {
            let _ = tx.send(Message::Text(text.into()));
        }
        Err(e) => tracing::warn!(error = %e, "outbound frame failed to encode"),
    }
}

fn reply_error(ctx: &ConnContext, seq: &str, topic: &str, code: &str, reason: &str) {
    send_frame(
        &ctx.tx,
        &Frame::reply_error(seq.to_owned(), topic.to_owned(), code, reason),
    );
}
