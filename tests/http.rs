//! REST surface over a real listener: broadcast injection, channel
//! inspection, health.

mod common;

use std::time::Duration;

use serde_json::{Value, json};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

use chanbus::client::SubscribeStatus;
use chanbus::protocol::ChannelConfig;
use chanbus::server::{Engine, EngineOptions};

use common::{connect_socket, start_engine, wait_for};

async fn start_http(engine: &Engine) -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let router = engine.http_router();
    tokio::spawn(async move {
        let _ = axum::serve(listener, router).await;
    });
    addr.to_string()
}

/// Minimal HTTP/1.1 request; returns (status line, JSON body).
async fn http_request(addr: &str, method: &str, path: &str, body: Option<&str>) -> (String, Value) {
    let mut stream = TcpStream::connect(addr).await.unwrap();
    let body = body.unwrap_or("");
    let request = format!(
        "{method} {path} HTTP/1.1\r\nHost: {addr}\r\nConnection: close\r\nContent-Type: application/json\r\nContent-Length: {}\r\n\r\n{body}",
        body.len()
    );
    stream.write_all(request.as_bytes()).await.unwrap();

    let mut response = Vec::new();
    stream.read_to_end(&mut response).await.unwrap();
    let response = String::from_utf8_lossy(&response).to_string();
    let status = response.lines().next().unwrap_or_default().to_owned();
    let json_body = response
        .split("\r\n\r\n")
        .nth(1)
        .and_then(|b| serde_json::from_str(b).ok())
        .unwrap_or(Value::Null);
    (status, json_body)
}

#[tokio::test]
async fn health_reports_totals() {
    let (engine, url) = start_engine(EngineOptions::default()).await;
    let http_addr = start_http(&engine).await;

    let socket = connect_socket(&url).await;
    let chan = socket.channel("room:h", ChannelConfig::default());
    assert_eq!(chan.join().await.0, SubscribeStatus::Subscribed);

    let (status, body) = http_request(&http_addr, "GET", "/health", None).await;
    assert!(status.contains("200"));
    assert_eq!(body["status"], "healthy");
    assert_eq!(body["totalChannels"], 1);
    assert_eq!(body["totalMembers"], 1);
}

#[tokio::test]
async fn broadcast_endpoint_counts_recipients() {
    let (engine, url) = start_engine(EngineOptions::default()).await;
    let http_addr = start_http(&engine).await;

    let socket = connect_socket(&url).await;
    let chan = socket.channel("room:rest", ChannelConfig::default());
    assert_eq!(chan.join().await.0, SubscribeStatus::Subscribed);

    let received = std::sync::Arc::new(std::sync::Mutex::new(Vec::<Value>::new()));
    let sink = received.clone();
    chan.on_broadcast(Some("news"), move |_event, payload| {
        sink.lock().unwrap().push(payload.clone());
    });

    let body = json!({"topic": "room:rest", "event": "news", "payload": {"headline": "x"}});
    let (status, response) =
        http_request(&http_addr, "POST", "/api/broadcast", Some(&body.to_string())).await;
    assert!(status.contains("200"));
    assert_eq!(response["status"], "ok");
    assert_eq!(response["recipientCount"], 1);

    assert!(
        wait_for(Duration::from_secs(2), || !received.lock().unwrap().is_empty())
        .await
    );
    assert_eq!(received.lock().unwrap()[0], json!({"headline": "x"}));
}

#[tokio::test]
async fn broadcast_endpoint_rejects_bad_body() {
    let (engine, _url) = start_engine(EngineOptions::default()).await;
    let http_addr = start_http(&engine).await;

    let (status, response) =
        http_request(&http_addr, "POST", "/api/broadcast", Some(r#"{"event": "x"}"#)).await;
    assert!(status.contains("400") || status.contains("422"), "{status}");
    let _ = response;
}

#[tokio::test]
async fn channel_endpoint_lists_members() {
    let (engine, url) = start_engine(EngineOptions::default()).await;
    let http_addr = start_http(&engine).await;

    let socket = connect_socket(&url).await;
    let chan = socket.channel("room:list", ChannelConfig::default());
    assert_eq!(chan.join().await.0, SubscribeStatus::Subscribed);

    let (status, body) = http_request(&http_addr, "GET", "/api/channels/room:list", None).await;
    assert!(status.contains("200"));
    assert_eq!(body["topic"], "room:list");
    assert_eq!(body["memberCount"], 1);
    assert!(body["members"][0]["clientId"].is_string());

    let (_, empty) = http_request(&http_addr, "GET", "/api/channels/room:none", None).await;
    assert_eq!(empty["memberCount"], 0);
}

#[tokio::test]
async fn broadcast_endpoint_requires_bearer_when_auth_enabled() {
    let secret = b"http-secret";
    let (engine, _url) = start_engine(EngineOptions {
        auth: Some(chanbus::auth::JwtConfig::new(&secret[..])),
        max_connections: 100,
    })
    .await;
    let http_addr = start_http(&engine).await;

    let body = json!({"topic": "room:x", "event": "e", "payload": {}});
    let (status, response) =
        http_request(&http_addr, "POST", "/api/broadcast", Some(&body.to_string())).await;
    assert!(status.contains("401"), "{status}");
    assert_eq!(response["status"], "error");
}
