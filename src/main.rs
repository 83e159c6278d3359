//! corelink demo server.
//!
//! Binds an echo route and a health route, then serves TCP and WebSocket
//! concurrently. Configuration comes from CORELINK_CONFIG (YAML) with
//! CORELINK_* environment overrides.

use corelink_server::{Config, Router, Server};
use serde_json::json;
use std::net::SocketAddr;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config = Config::load()?;
    tracing::info!("Starting corelink server");
    tracing::info!("  TCP bind: {}", config.network.tcp_bind);
    tracing::info!(
        "  WebSocket bind: {}{}",
        config.network.websocket_bind,
        config.network.websocket_path,
    );
    tracing::info!("  Content type: {}", config.protocol.content_type);

    let mut router = Router::new();
    router.bind("echo", |ctx| {
        let body: serde_json::Value = match ctx.parse_param() {
            Ok(body) => body,
            Err(e) => {
                let _ = ctx.error(corelink_protocol::STATUS_INTERNAL_SERVER_ERROR, &e.to_string());
                return;
            }
        };
        let _ = ctx.success(body);
    })?;
    router.bind("v1/healthy", |ctx| {
        let _ = ctx.success(json!({ "keepalive": true }));
    })?;

    let tcp_addr: SocketAddr = config.network.tcp_bind.parse()?;
    let ws_addr: SocketAddr = config.network.websocket_bind.parse()?;

    let server = Server::new(config.server_config(), router);
    tokio::try_join!(server.run_tcp(tcp_addr), server.run_websocket(ws_addr))?;
    Ok(())
}
