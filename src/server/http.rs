//! REST surface: server-originated broadcasts, channel inspection, health.

use std::sync::Arc;
use std::sync::atomic::Ordering;

use axum::Router;
use axum::extract::{Path, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::Json;
use axum::routing::{get, post};
use serde::Deserialize;
use serde_json::{Value, json};

use crate::protocol::{self, Frame};

use super::SharedState;
use super::fabric::FabricEventKind;

pub(crate) fn router(state: Arc<SharedState>) -> Router {
    Router::new()
        .route("/api/broadcast", post(broadcast))
        .route("/api/channels/{topic}", get(channel_info))
        .route("/health", get(health))
        .with_state(state)
}

#[derive(Deserialize)]
struct BroadcastRequest {
    topic: String,
    event: String,
    #[serde(default)]
    payload: Value,
}

/// `POST /api/broadcast` — inject a broadcast with the synthetic "api"
/// sender identity. All local members receive it; the fabric relays it on.
async fn broadcast(
    State(state): State<Arc<SharedState>>,
    headers: HeaderMap,
    body: Result<Json<BroadcastRequest>, axum::extract::rejection::JsonRejection>,
) -> (StatusCode, Json<Value>) {
    if let Some(jwt) = &state.auth {
        let token = bearer_token(&headers);
        let verified = token
            .as_deref()
            .map(|t| crate::auth::verify(t, jwt))
            .transpose();
        if token.is_none() || verified.is_err() {
            return (
                StatusCode::UNAUTHORIZED,
                Json(json!({"status": "error", "reason": "Invalid or missing bearer token"})),
            );
        }
    }

    let Json(req) = match body {
        Ok(body) => body,
        Err(e) => {
            return (
                StatusCode::BAD_REQUEST,
                Json(json!({"status": "error", "reason": e.to_string()})),
            );
        }
    };
    if req.topic.is_empty() || req.event.is_empty() {
        return (
            StatusCode::BAD_REQUEST,
            Json(json!({"status": "error", "reason": "topic and event are required"})),
        );
    }

    let payload = json!({"type": "broadcast", "event": req.event, "payload": req.payload});
    let frame = Frame::notify(&req.topic, protocol::event::BROADCAST, payload.clone());
    let delivered = match frame.encode() {
        Ok(text) => state
            .channels
            .fanout(&req.topic, &text, None, &state.metrics),
        Err(e) => {
            return (
                StatusCode::BAD_REQUEST,
                Json(json!({"status": "error", "reason": e.to_string()})),
            );
        }
    };
    state.fabric_publish(
        &req.topic,
        FabricEventKind::Broadcast {
            sender: "api".to_owned(),
            payload,
        },
    );

    (
        StatusCode::OK,
        Json(json!({"status": "ok", "recipientCount": delivered})),
    )
}

/// `GET /api/channels/{topic}` — membership snapshot for one topic.
async fn channel_info(
    State(state): State<Arc<SharedState>>,
    Path(topic): Path<String>,
) -> Json<Value> {
    let members: Vec<Value> = state
        .channels
        .members_of(&topic)
        .into_iter()
        .map(|conn_id| json!({"clientId": conn_id}))
        .collect();
    Json(json!({
        "topic": topic,
        "memberCount": members.len(),
        "members": members,
    }))
}

/// `GET /health` — instance liveness and aggregate counts.
async fn health(State(state): State<Arc<SharedState>>) -> Json<Value> {
    Json(json!({
        "status": "healthy",
        "totalChannels": state.channels.topic_count(),
        "totalMembers": state.channels.total_members(),
        "connections": state.metrics.connections.load(Ordering::Relaxed),
    }))
}

fn bearer_token(headers: &HeaderMap) -> Option<String> {
    let value = headers.get("authorization")?.to_str().ok()?;
    // RFC 7235: the auth scheme is case-insensitive.
    if value.len() > 7 && value[..7].eq_ignore_ascii_case("bearer ") {
        Some(value[7..].to_owned())
    } else {
        None
    }
}
