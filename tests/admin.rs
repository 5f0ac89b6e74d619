//! Server-originated channel control: forced close and unsolicited errors.

mod common;

use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde_json::{Value, json};

use chanbus::client::{ChannelState, SubscribeStatus};
use chanbus::protocol::{ChannelConfig, PresenceConfig};
use chanbus::server::EngineOptions;

use common::{connect_socket, start_engine, wait_for};

#[tokio::test]
async fn forced_close_reaches_members_and_clears_state() {
    let (engine, url) = start_engine(EngineOptions::default()).await;
    let socket = connect_socket(&url).await;

    let chan = socket.channel(
        "room:adm",
        ChannelConfig {
            presence: PresenceConfig {
                key: "alice".to_owned(),
                enabled: true,
            },
            ..Default::default()
        },
    );

    let statuses: Arc<Mutex<Vec<SubscribeStatus>>> = Arc::new(Mutex::new(Vec::new()));
    let sink = statuses.clone();
    chan.subscribe(move |status, _| {
        sink.lock().unwrap().push(status);
    });
    assert!(
        wait_for(Duration::from_secs(2), || {
            statuses.lock().unwrap().contains(&SubscribeStatus::Subscribed)
        })
        .await
    );
    chan.track(json!({})).await;

    let notified = engine.close_channel("room:adm");
    assert_eq!(notified, 1);
    assert_eq!(engine.total_members(), 0);
    assert_eq!(engine.presence_entries("room:adm"), 0);

    // The client observes the close and does not auto-rejoin.
    assert!(
        wait_for(Duration::from_secs(2), || {
            chan.state() == ChannelState::Closed
        })
        .await
    );
    assert!(
        statuses.lock().unwrap().contains(&SubscribeStatus::Closed),
        "subscribe callback should see the forced close"
    );
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(engine.total_members(), 0);
}

#[tokio::test]
async fn unsolicited_error_reaches_system_listeners() {
    let (engine, url) = start_engine(EngineOptions::default()).await;
    let socket = connect_socket(&url).await;

    let chan = socket.channel("room:err", ChannelConfig::default());
    assert_eq!(chan.join().await.0, SubscribeStatus::Subscribed);

    let errors: Arc<Mutex<Vec<Value>>> = Arc::new(Mutex::new(Vec::new()));
    let sink = errors.clone();
    chan.on_system_error(move |payload| {
        sink.lock().unwrap().push(payload.clone());
    });

    let notified = engine.notify_channel_error("room:err", "SYSTEM_MAINTENANCE", "Rolling restart");
    assert_eq!(notified, 1);

    assert!(
        wait_for(Duration::from_secs(2), || !errors.lock().unwrap().is_empty()).await
    );
    let seen = errors.lock().unwrap().clone();
    assert_eq!(seen[0]["code"], "SYSTEM_MAINTENANCE");
    assert_eq!(seen[0]["reason"], "Rolling restart");

    // The channel is untouched.
    assert_eq!(chan.state(), ChannelState::Joined);
    assert_eq!(engine.total_members(), 1);
}
