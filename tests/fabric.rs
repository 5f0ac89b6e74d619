//! Cross-instance relay through an in-memory fabric stub wired to two
//! engines. The stub delivers every published event to every instance; each
//! engine drops events carrying its own instance id.

mod common;

use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde_json::{Value, json};
use tokio::sync::{broadcast, mpsc};

use chanbus::client::{SendStatus, SubscribeStatus};
use chanbus::protocol::{ChannelConfig, PresenceConfig};
use chanbus::server::fabric::{FabricCommand, FabricEvent, FabricHandle};
use chanbus::server::{Engine, EngineOptions};

use common::{connect_socket, start_engine, wait_for};

/// Wire an engine to a shared in-memory bus.
fn attach_stub_fabric(engine: &Engine, bus: &broadcast::Sender<FabricEvent>) {
    let (cmd_tx, mut cmd_rx) = mpsc::unbounded_channel();
    engine.set_fabric(FabricHandle::new(cmd_tx));

    // Outbound: engine publishes land on the shared bus.
    let bus_tx = bus.clone();
    tokio::spawn(async move {
        while let Some(cmd) = cmd_rx.recv().await {
            match cmd {
                FabricCommand::Publish(event) => {
                    let _ = bus_tx.send(event);
                }
                FabricCommand::Shutdown => break,
                FabricCommand::Subscribe(_) | FabricCommand::Unsubscribe(_) => {}
            }
        }
    });

    // Inbound: everything on the bus reaches the engine's sink, which drops
    // self-originated events.
    let sink = engine.fabric_sink();
    let mut bus_rx = bus.subscribe();
    tokio::spawn(async move {
        while let Ok(event) = bus_rx.recv().await {
            let _ = sink.send(event);
        }
    });
}

async fn start_pair() -> (Engine, String, Engine, String) {
    let (bus, _) = broadcast::channel::<FabricEvent>(256);
    let (engine1, url1) = start_engine(EngineOptions::default()).await;
    let (engine2, url2) = start_engine(EngineOptions::default()).await;
    attach_stub_fabric(&engine1, &bus);
    attach_stub_fabric(&engine2, &bus);
    (engine1, url1, engine2, url2)
}

#[tokio::test]
async fn broadcast_crosses_instances_exactly_once() {
    let (_engine1, url1, _engine2, url2) = start_pair().await;

    let socket_a = connect_socket(&url1).await;
    let socket_b = connect_socket(&url2).await;
    let chan_a = socket_a.channel("room:5", ChannelConfig::default());
    let chan_b = socket_b.channel("room:5", ChannelConfig::default());
    assert_eq!(chan_a.join().await.0, SubscribeStatus::Subscribed);
    assert_eq!(chan_b.join().await.0, SubscribeStatus::Subscribed);

    let seen: Arc<Mutex<Vec<Value>>> = Arc::new(Mutex::new(Vec::new()));
    let sink = seen.clone();
    chan_b.on_broadcast(None, move |_event, payload| {
        sink.lock().unwrap().push(payload.clone());
    });

    let result = chan_a.send("msg", json!({"text": "cross"})).await;
    assert_eq!(result.status, SendStatus::Ok);

    assert!(
        wait_for(Duration::from_secs(2), || !seen.lock().unwrap().is_empty())
        .await
    );
    // Exactly one copy: the origin instance dropped its own fabric echo.
    tokio::time::sleep(Duration::from_millis(300)).await;
    let received = seen.lock().unwrap().clone();
    assert_eq!(received.len(), 1);
    assert_eq!(received[0], json!({"text": "cross"}));
}

#[tokio::test]
async fn presence_converges_across_instances() {
    let (engine1, url1, engine2, url2) = start_pair().await;

    let socket_a = connect_socket(&url1).await;
    let chan_a = socket_a.channel(
        "room:6",
        ChannelConfig {
            presence: PresenceConfig {
                key: "alice".to_owned(),
                enabled: true,
            },
            ..Default::default()
        },
    );
    assert_eq!(chan_a.join().await.0, SubscribeStatus::Subscribed);
    assert_eq!(chan_a.track(json!({"from": "s1"})).await.status, SendStatus::Ok);

    // The peer instance's shadow map picks up alice.
    assert!(
        wait_for(Duration::from_secs(2), || engine2.presence_entries("room:6") == 1)
        .await
    );

    // A late joiner on the second instance sees alice in its snapshot.
    let socket_b = connect_socket(&url2).await;
    let chan_b = socket_b.channel(
        "room:6",
        ChannelConfig {
            presence: PresenceConfig {
                key: "bob".to_owned(),
                enabled: true,
            },
            ..Default::default()
        },
    );
    assert_eq!(chan_b.join().await.0, SubscribeStatus::Subscribed);
    assert!(
        wait_for(Duration::from_secs(2), || chan_b.presence_state().contains_key("alice"))
        .await
    );

    // Untrack propagates as a leave on the peer instance.
    assert_eq!(chan_a.untrack().await.status, SendStatus::Ok);
    assert!(
        wait_for(Duration::from_secs(2), || !chan_b.presence_state().contains_key("alice"))
        .await
    );
    assert_eq!(engine1.presence_entries("room:6"), 0);
    assert_eq!(engine2.presence_entries("room:6"), 0);
}

#[tokio::test]
async fn api_broadcast_relays_to_peer_instance() {
    let (engine1, _url1, _engine2, url2) = start_pair().await;

    let socket_b = connect_socket(&url2).await;
    let chan_b = socket_b.channel("room:7", ChannelConfig::default());
    assert_eq!(chan_b.join().await.0, SubscribeStatus::Subscribed);

    let seen: Arc<Mutex<Vec<(String, Value)>>> = Arc::new(Mutex::new(Vec::new()));
    let sink = seen.clone();
    chan_b.on_broadcast(None, move |event, payload| {
        sink.lock().unwrap().push((event.to_owned(), payload.clone()));
    });

    // No local members on engine1, but the fabric carries it to engine2.
    let local = engine1.broadcast_from_api("room:7", "announce", json!({"n": 1}));
    assert_eq!(local, 0);

    assert!(
        wait_for(Duration::from_secs(2), || !seen.lock().unwrap().is_empty())
        .await
    );
    let received = seen.lock().unwrap().clone();
    assert_eq!(received[0].0, "announce");
    assert_eq!(received[0].1, json!({"n": 1}));
}
