use tokio::net::TcpListener;
use tracing_subscriber::EnvFilter;

use chanbus::config::{AppConfig, FabricMode};
use chanbus::server::{Engine, EngineOptions, fabric};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cfg = AppConfig::load()?;

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(cfg.server.log_level.clone())),
        )
        .init();

    let engine = Engine::new(EngineOptions {
        auth: cfg.auth.jwt(),
        max_connections: cfg.server.max_connections,
    });
    tracing::info!(instance = %engine.instance_id(), "starting chanbus");

    if let Some(url) = cfg.fabric.connection_url() {
        let sink = engine.fabric_sink();
        let (handle, _metrics) = match cfg.fabric.mode {
            FabricMode::Pubsub => fabric::spawn_redis_pubsub(url, sink),
            FabricMode::Stream => fabric::spawn_redis_streams(url, sink),
        };
        engine.set_fabric(handle);
        tracing::info!(mode = ?cfg.fabric.mode, "fabric relay enabled");
    }

    let http_listener = TcpListener::bind(cfg.server.http_addr()).await?;
    tracing::info!(addr = %cfg.server.http_addr(), "http surface listening");
    let router = engine.http_router();
    tokio::spawn(async move {
        if let Err(e) = axum::serve(http_listener, router).await {
            tracing::error!(error = %e, "http server exited");
        }
    });

    let ws_listener = TcpListener::bind(cfg.server.ws_addr()).await?;
    let serve = engine.serve(ws_listener);

    tokio::select! {
        _ = serve => {}
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("shutdown signal received");
            engine.close_all();
        }
    }

    Ok(())
}
