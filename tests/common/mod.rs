//! Shared harness for the end-to-end tests: a real engine on an ephemeral
//! port and real sockets against it.
#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpListener;

use chanbus::client::{Socket, SocketOptions};
use chanbus::server::{Engine, EngineOptions};

pub async fn start_engine(options: EngineOptions) -> (Engine, String) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let engine = Engine::new(options);
    let serving = engine.clone();
    tokio::spawn(async move {
        serving.serve(listener).await;
    });
    (engine, format!("ws://{addr}"))
}

pub async fn connect_socket(url: &str) -> Socket {
    connect_socket_with(url, |opts| opts).await
}

pub async fn connect_socket_with<F>(url: &str, configure: F) -> Socket
where
    F: FnOnce(SocketOptions) -> SocketOptions,
{
    let mut opts = SocketOptions::new(url);
    // Fast schedules keep the reconnect tests snappy.
    opts.reconnect_schedule = Arc::new(|_| Duration::from_millis(50));
    let opts = configure(opts);
    let socket = Socket::new(opts);
    socket.connect();
    assert!(
        socket.wait_until_open(Duration::from_secs(5)).await,
        "socket failed to open"
    );
    socket
}

/// Poll `probe` until it returns true or the timeout elapses.
pub async fn wait_for<F>(timeout: Duration, mut probe: F) -> bool
where
    F: FnMut() -> bool,
{
    let deadline = tokio::time::Instant::now() + timeout;
    while tokio::time::Instant::now() < deadline {
        if probe() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    false
}
