//! Axum-based WebSocket server.

use std::sync::Arc;

use axum::{
    Router,
    extract::{State, WebSocketUpgrade},
    response::IntoResponse,
    routing::get,
};
use serde_json::json;
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::connection::handle_ws_connection;
use crate::state::GatewayState;

/// Build the gateway router: `/ws`, `/health`, and `/metrics` when enabled.
pub fn router(state: Arc<GatewayState>) -> Router {
    #[allow(unused_mut)]
    let mut app = Router::new()
        .route("/ws", get(ws_handler))
        .route("/health", get(health_handler))
        .with_state(state);

    #[cfg(feature = "metrics")]
    if let Some(handle) = crate::metrics::install_prometheus_recorder() {
        app = app.route("/metrics", get(move || std::future::ready(handle.render())));
    }

    app.layer(TraceLayer::new_for_http())
}

/// Start the gateway and serve until Ctrl+C.
pub async fn start_gateway(state: Arc<GatewayState>, port: u16) -> anyhow::Result<()> {
    let bind_addr = state.config.bind_address();
    let app = router(state.clone());

    let addr = format!("{bind_addr}:{port}");
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    info!("Gateway listening on {addr}");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(state))
        .await?;

    Ok(())
}

async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<Arc<GatewayState>>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_ws_connection(state, socket))
}

async fn health_handler(State(state): State<Arc<GatewayState>>) -> impl IntoResponse {
    let version = env!("CARGO_PKG_VERSION");
    let sessions = state.session_count().await;

    axum::Json(json!({
        "status": "ok",
        "version": version,
        "sessions": sessions,
    }))
}

async fn shutdown_signal(state: Arc<GatewayState>) {
    tokio::signal::ctrl_c()
        .await
        .expect("Failed to install CTRL+C handler");
    info!("Shutdown signal received");
    state.close_all().await;
}
