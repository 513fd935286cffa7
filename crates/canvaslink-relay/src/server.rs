use std::sync::Arc;

use anyhow::Context;
use axum::Router;
use axum::extract::{State, WebSocketUpgrade};
use axum::response::Response;
use axum::routing::get;
use tokio::net::TcpListener;
use tracing::info;

use crate::channels::ChannelRegistry;
use crate::config::RelayConfig;
use crate::connection;

/// Bind the configured port and serve until shutdown.
pub async fn run(config: RelayConfig) -> anyhow::Result<()> {
    let listener = TcpListener::bind(("0.0.0.0", config.port))
        .await
        .with_context(|| format!("failed to bind relay listener on port {}", config.port))?;
    info!("relay listening on ws://{}", listener.local_addr()?);

    tokio::spawn(async move {
        tokio::signal::ctrl_c().await.ok();
        info!("shutting down");
        std::process::exit(0);
    });

    serve(listener, Arc::new(ChannelRegistry::new())).await
}

/// Serve an already-bound listener against a shared registry. Split out so
/// tests can run the relay in-process on an ephemeral port.
pub async fn serve(listener: TcpListener, registry: Arc<ChannelRegistry>) -> anyhow::Result<()> {
    let app = Router::new()
        .route("/", get(ws_handler))
        .with_state(registry);
    axum::serve(listener, app).await?;
    Ok(())
}

async fn ws_handler(
    ws: WebSocketUpgrade,
    State(registry): State<Arc<ChannelRegistry>>,
) -> Response {
    ws.on_upgrade(move |socket| connection::handle_socket(socket, registry))
}
