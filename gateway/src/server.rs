//! The downstream HTTP/WebSocket surface: one `/ws` upgrade route per
//! subscriber session, fronted by the access-log middleware and CORS policy
//! shared with the rest of the stack.

use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use axum::extract::State;
use axum::extract::ws::{WebSocket, WebSocketUpgrade};
use axum::response::IntoResponse;
use axum::routing::get;
use axum::{Router, middleware};
use tokio_util::sync::CancellationToken;
use tower_http::cors::{Any, CorsLayer};

use crate::session::{self, GatewayState};

/// Runs the downstream WebSocket server until `cancel` fires. New
/// connection attempts made after cancellation are refused with 503 rather
/// than accepted and immediately dropped.
pub async fn run(port: u16, state: Arc<GatewayState>, cancel: CancellationToken, ready: Arc<AtomicBool>) {
    let accepting = Arc::new(AtomicBool::new(true));

    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let app = Router::new()
        .route("/", get(index))
        .route("/ws", get(ws_handler))
        .layer(middleware::from_fn(aislink_common::access_log::request))
        .layer(cors)
        .with_state((state, accepting.clone()));

    let addr: SocketAddr = match format!("0.0.0.0:{port}").parse() {
        Ok(addr) => addr,
        Err(err) => {
            tracing::error!(error = %err, "invalid bind address");
            return;
        }
    };
    let listener = match tokio::net::TcpListener::bind(addr).await {
        Ok(listener) => listener,
        Err(err) => {
            tracing::error!(%addr, error = %err, "failed to bind downstream server");
            return;
        }
    };
    tracing::info!(%addr, "downstream WebSocket server listening");

    let shutdown = {
        let cancel = cancel.clone();
        let accepting = accepting.clone();
        async move {
            cancel.cancelled().await;
            accepting.store(false, Ordering::Relaxed);
            ready.store(false, Ordering::Relaxed);
        }
    };

    if let Err(err) = axum::serve(listener, app).with_graceful_shutdown(shutdown).await {
        tracing::error!(error = %err, "downstream server exited with error");
    }
}

async fn index() -> impl IntoResponse {
    "aislink gateway"
}

async fn ws_handler(
    ws: WebSocketUpgrade,
    State((state, accepting)): State<(Arc<GatewayState>, Arc<AtomicBool>)>,
) -> impl IntoResponse {
    if !accepting.load(Ordering::Relaxed) {
        return axum::http::StatusCode::SERVICE_UNAVAILABLE.into_response();
    }
    ws.on_upgrade(move |socket: WebSocket| session::handle_socket(socket, state))
}
