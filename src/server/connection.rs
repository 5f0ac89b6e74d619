//! Per-link lifecycle: WebSocket accept, read loop, dedicated write task,
//! close cleanup.

use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::Ordering;

use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::protocol::Message;
use uuid::Uuid;

use super::router::{self, ConnContext};
use super::{ConnectionHandle, SharedState};
use super::rate_limit::TokenBucket;

pub(crate) async fn handle_connection(stream: TcpStream, addr: SocketAddr, state: Arc<SharedState>) {
    let ws_stream = match tokio_tungstenite::accept_async(stream).await {
        Ok(ws) => ws,
        Err(e) => {
            tracing::debug!(%addr, error = %e, "websocket handshake failed");
            return;
        }
    };

    let conn_id = Uuid::now_v7().to_string();
    let (mut write_half, mut read_half) = ws_stream.split();
    let (tx, mut rx) = mpsc::unbounded_channel::<Message>();

    if state.connections.len() >= state.max_connections {
        tracing::warn!(%addr, "connection limit reached, rejecting");
        let _ = write_half.close().await;
        return;
    }
    state
        .connections
        .insert(conn_id.clone(), ConnectionHandle { tx: tx.clone() });
    state.metrics.connections.fetch_add(1, Ordering::Relaxed);
    tracing::debug!(conn = %conn_id, %addr, "connection accepted");

    // Write task: sole writer for this link. Coalesces bursts into one
    // flush; a write error ends the task and the read loop notices the
    // closed socket.
    let write_task = tokio::spawn(async move {
        while let Some(msg) = rx.recv().await {
            if write_half.feed(msg).await.is_err() {
                break;
            }
            let mut batched = 1u32;
            let mut failed = false;
            while batched < 64 {
                match rx.try_recv() {
                    Ok(msg) => {
                        if write_half.feed(msg).await.is_err() {
                            failed = true;
                            break;
                        }
                        batched += 1;
                    }
                    Err(_) => break,
                }
            }
            if failed || write_half.flush().await.is_err() {
                break;
            }
        }
        let _ = write_half.close().await;
    });

    let mut ctx = ConnContext {
        conn_id: conn_id.clone(),
        tx: tx.clone(),
        bucket: TokenBucket::per_connection(),
    };

    // Read loop: frames from one link are handled strictly in arrival order.
    while let Some(Ok(msg)) = read_half.next().await {
        match msg {
            Message::Text(text) => {
                router::handle_text(&state, &mut ctx, text.as_str());
            }
            Message::Binary(_) => {
                // The wire protocol is UTF-8 JSON text only.
                state.metrics.frames_dropped.fetch_add(1, Ordering::Relaxed);
                tracing::debug!(conn = %conn_id, "binary frame dropped");
            }
            Message::Ping(payload) => {
                let _ = tx.send(Message::Pong(payload));
            }
            Message::Close(_) => break,
            Message::Pong(_) | Message::Frame(_) => {}
        }
    }

    // Cleanup: membership first so the departing link is excluded from the
    // presence leave diffs that follow.
    state.connections.remove(&conn_id);
    state.metrics.connections.fetch_sub(1, Ordering::Relaxed);
    router::handle_disconnect(&state, &conn_id);
    tracing::debug!(conn = %conn_id, "connection closed");

    // Every sender clone must drop before the write task can finish.
    drop(ctx);
    drop(tx);
    let _ = write_task.await;
}
