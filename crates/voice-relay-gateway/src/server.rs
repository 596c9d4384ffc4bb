//! Axum-based WebSocket server.

use std::sync::Arc;

use axum::{
    extract::{State, WebSocketUpgrade},
    response::IntoResponse,
    routing::get,
    Router,
};
use serde_json::json;
use tracing::{error, info};

use crate::connection::handle_ws_connection;
use crate::state::GatewayState;

/// Build the gateway router.
///
/// When `ui_enabled` is true, the embedded demo page is served at `/`.
pub fn router(state: Arc<GatewayState>, ui_enabled: bool) -> Router {
    // /ws and /health are registered first so they take priority over the UI catch-all
    let app = Router::new()
        .route("/ws", get(ws_handler))
        .route("/health", get(health_handler));

    #[cfg(feature = "metrics")]
    let app = if state.metrics.is_some() {
        app.route("/metrics", get(metrics_handler))
    } else {
        app
    };

    let mut app = app.with_state(state);
    if ui_enabled {
        app = app.merge(voice_relay_web::ui_router());
    }
    app
}

/// Start the gateway WebSocket server and run until Ctrl+C.
pub async fn start_gateway(
    state: Arc<GatewayState>,
    port: u16,
    ui_enabled: bool,
) -> anyhow::Result<()> {
    let bind_addr = state.config.gateway_bind();
    let app = router(state.clone(), ui_enabled);

    let addr = format!("{bind_addr}:{port}");
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    info!("Gateway listening on {addr}");
    if ui_enabled {
        info!("Voice demo available at http://{addr}/");
    }

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    state.registry.close_all().await;
    info!("Gateway stopped");
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
    let sessions = state.registry.len().await;

    axum::Json(json!({
        "status": "ok",
        "version": version,
        "sessions": sessions,
    }))
}

#[cfg(feature = "metrics")]
async fn metrics_handler(State(state): State<Arc<GatewayState>>) -> impl IntoResponse {
    state
        .metrics
        .as_ref()
        .map(|handle| handle.render())
        .unwrap_or_default()
}

async fn shutdown_signal() {
    match tokio::signal::ctrl_c().await {
        Ok(()) => info!("Shutdown signal received"),
        Err(e) => {
            error!(%e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    }
}
