// handlers.rs - HTTP surface
//
// The broker speaks RPC over one WebSocket endpoint; HTTP carries only the
// upgrade and a health probe.

use axum::{
    extract::{State, WebSocketUpgrade},
    response::Response,
    routing::get,
    Router,
};

use crate::dispatcher;
use crate::service::AppState;

pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/ws", get(ws_upgrade))
        .with_state(state)
}

async fn health() -> &'static str {
    "ok"
}

async fn ws_upgrade(State(state): State<AppState>, upgrade: WebSocketUpgrade) -> Response {
    upgrade.on_upgrade(move |socket| dispatcher::handle_socket(socket, state))
}
