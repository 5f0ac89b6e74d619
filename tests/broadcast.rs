//! End-to-end broadcast behavior over real sockets.

mod common;

use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde_json::{Value, json};

use chanbus::client::{SendStatus, SubscribeStatus};
use chanbus::protocol::{BroadcastConfig, ChannelConfig};
use chanbus::server::EngineOptions;

use common::{connect_socket, start_engine, wait_for};

fn collector() -> (
    Arc<Mutex<Vec<(String, Value)>>>,
    impl Fn(&str, &Value) + Send + Sync + 'static,
) {
    let seen: Arc<Mutex<Vec<(String, Value)>>> = Arc::new(Mutex::new(Vec::new()));
    let sink = seen.clone();
    (seen, move |event: &str, payload: &Value| {
        sink.lock().unwrap().push((event.to_owned(), payload.clone()));
    })
}

#[tokio::test]
async fn broadcast_excludes_sender_when_self_off() {
    let (_engine, url) = start_engine(EngineOptions::default()).await;

    let socket_a = connect_socket(&url).await;
    let socket_b = connect_socket(&url).await;

    let chan_a = socket_a.channel("room:1", ChannelConfig::default());
    let chan_b = socket_b.channel(
        "room:1",
        ChannelConfig {
            broadcast: BroadcastConfig {
                include_self: false,
                ack: false,
            },
            ..Default::default()
        },
    );

    assert_eq!(chan_a.join().await.0, SubscribeStatus::Subscribed);
    assert_eq!(chan_b.join().await.0, SubscribeStatus::Subscribed);

    let (seen_a, cb_a) = collector();
    chan_a.on_broadcast(None, cb_a);
    let (seen_b, cb_b) = collector();
    chan_b.on_broadcast(None, cb_b);

    let result = chan_b.send("msg", json!({"text": "hi"})).await;
    assert_eq!(result.status, SendStatus::Ok);

    assert!(
        wait_for(Duration::from_secs(2), || !seen_a.lock().unwrap().is_empty())
        .await
    );

    let received = seen_a.lock().unwrap().clone();
    assert_eq!(received.len(), 1);
    assert_eq!(received[0].0, "msg");
    assert_eq!(received[0].1, json!({"text": "hi"}));

    // The sender opted out of its own broadcasts.
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(seen_b.lock().unwrap().is_empty());
}

#[tokio::test]
async fn broadcast_with_ack_resolves_ok() {
    let (_engine, url) = start_engine(EngineOptions::default()).await;
    let socket = connect_socket(&url).await;

    let chan = socket.channel(
        "room:2",
        ChannelConfig {
            broadcast: BroadcastConfig {
                include_self: false,
                ack: true,
            },
            ..Default::default()
        },
    );
    assert_eq!(chan.join().await.0, SubscribeStatus::Subscribed);

    let result = chan.send("ping", json!({"n": 1})).await;
    assert_eq!(result.status, SendStatus::Ok);
    assert!(result.code.is_none());
}

#[tokio::test]
async fn event_filter_selects_broadcasts() {
    let (_engine, url) = start_engine(EngineOptions::default()).await;
    let socket_a = connect_socket(&url).await;
    let socket_b = connect_socket(&url).await;

    let chan_a = socket_a.channel("room:3", ChannelConfig::default());
    let chan_b = socket_b.channel("room:3", ChannelConfig::default());
    assert_eq!(chan_a.join().await.0, SubscribeStatus::Subscribed);
    assert_eq!(chan_b.join().await.0, SubscribeStatus::Subscribed);

    let (only_chat, cb1) = collector();
    chan_a.on_broadcast(Some("chat"), cb1);
    let (all_events, cb2) = collector();
    chan_a.on_broadcast(None, cb2);

    chan_b.send("chat", json!({"m": 1})).await;
    chan_b.send("typing", json!({})).await;

    assert!(
        wait_for(Duration::from_secs(2), || all_events.lock().unwrap().len() == 2).await
    );
    let filtered = only_chat.lock().unwrap().clone();
    assert_eq!(filtered.len(), 1);
    assert_eq!(filtered[0].0, "chat");
}

#[tokio::test]
async fn api_broadcast_reaches_all_members() {
    let (engine, url) = start_engine(EngineOptions::default()).await;
    let socket = connect_socket(&url).await;

    let chan = socket.channel("room:api", ChannelConfig::default());
    assert_eq!(chan.join().await.0, SubscribeStatus::Subscribed);

    let (seen, cb) = collector();
    chan.on_broadcast(None, cb);

    let delivered = engine.broadcast_from_api("room:api", "announce", json!({"v": 2}));
    assert_eq!(delivered, 1);

    assert!(
        wait_for(Duration::from_secs(2), || !seen.lock().unwrap().is_empty())
        .await
    );
    let received = seen.lock().unwrap().clone();
    assert_eq!(received[0].0, "announce");
    assert_eq!(received[0].1, json!({"v": 2}));
}

#[tokio::test]
async fn subscribe_on_joined_channel_is_idempotent() {
    let (engine, url) = start_engine(EngineOptions::default()).await;
    let socket = connect_socket(&url).await;

    let chan = socket.channel("room:idem", ChannelConfig::default());
    assert_eq!(chan.join().await.0, SubscribeStatus::Subscribed);

    // A second subscribe fires SUBSCRIBED immediately without re-sending the
    // join; a resent join would be rejected as already-joined.
    assert_eq!(chan.join().await.0, SubscribeStatus::Subscribed);
    assert_eq!(engine.channel_members("room:idem").len(), 1);
}

#[tokio::test]
async fn oversize_message_yields_error_reply() {
    let (_engine, url) = start_engine(EngineOptions::default()).await;
    let socket = connect_socket(&url).await;

    let chan = socket.channel(
        "room:big",
        ChannelConfig {
            broadcast: BroadcastConfig {
                include_self: false,
                ack: true,
            },
            ..Default::default()
        },
    );
    assert_eq!(chan.join().await.0, SubscribeStatus::Subscribed);

    let huge = "x".repeat(110 * 1024);
    let result = chan.send("blob", json!({"data": huge})).await;
    assert_eq!(result.status, SendStatus::Error);
    assert_eq!(result.code.as_deref(), Some("MESSAGE_TOO_LARGE"));
}

#[tokio::test]
async fn rate_limited_sender_gets_retry_after() {
    let (_engine, url) = start_engine(EngineOptions::default()).await;
    let socket = connect_socket(&url).await;

    let chan = socket.channel(
        "room:rl",
        ChannelConfig {
            broadcast: BroadcastConfig {
                include_self: false,
                ack: true,
            },
            ..Default::default()
        },
    );
    assert_eq!(chan.join().await.0, SubscribeStatus::Subscribed);

    // The per-connection bucket holds 100k byte-tokens: the first 60 KiB
    // frame fits, the second overdraws it.
    let chunk = "x".repeat(60 * 1024);
    assert_eq!(
        chan.send("bulk", json!({"data": chunk})).await.status,
        SendStatus::Ok
    );
    let result = chan.send("bulk", json!({"data": chunk})).await;
    assert_eq!(result.status, SendStatus::Error);
    assert_eq!(result.code.as_deref(), Some("MESSAGE_RATE_LIMITED"));
    let retry_after = result.response.unwrap()["retry_after"].as_u64().unwrap();
    assert!(retry_after > 0);
}

#[tokio::test]
async fn remove_channel_drops_it_from_the_socket() {
    let (engine, url) = start_engine(EngineOptions::default()).await;
    let socket = connect_socket(&url).await;

    let chan = socket.channel("room:rm", ChannelConfig::default());
    assert_eq!(chan.join().await.0, SubscribeStatus::Subscribed);

    let status = socket.remove_channel(&chan).await;
    assert_eq!(status, chanbus::client::RemoveStatus::Ok);
    assert!(
        wait_for(Duration::from_secs(2), || engine.total_members() == 0).await
    );

    // A fresh handle for the topic is a brand-new channel.
    let again = socket.channel("room:rm", ChannelConfig::default());
    assert_eq!(again.state(), chanbus::client::ChannelState::Closed);
}

#[tokio::test]
async fn unsubscribe_then_resubscribe() {
    let (engine, url) = start_engine(EngineOptions::default()).await;
    let socket = connect_socket(&url).await;

    let chan = socket.channel("room:4", ChannelConfig::default());
    assert_eq!(chan.join().await.0, SubscribeStatus::Subscribed);
    assert_eq!(engine.total_members(), 1);

    let status = chan.unsubscribe(None).await;
    assert_eq!(status, chanbus::client::RemoveStatus::Ok);
    assert!(
        wait_for(Duration::from_secs(2), || engine.total_members() == 0)
        .await
    );

    assert_eq!(chan.join().await.0, SubscribeStatus::Subscribed);
    assert_eq!(engine.total_members(), 1);
}
