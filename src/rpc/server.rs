//! RPC HTTP Server
//!
//! Axum-based HTTP server that handles JSON-RPC requests.

use crate::rpc::methods::{handle_request, JsonRpcRequest, JsonRpcResponse, RpcState};
use axum::{extract::State, http::StatusCode, routing::post, Json, Router};
use std::net::SocketAddr;
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use tracing::info;

pub fn rpc_router(state: Arc<RpcState>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/", post(handle_rpc))
        .layer(cors)
        .with_state(state)
}

/// Serve JSON-RPC on `addr` until the server fails
pub async fn start_rpc_server(state: Arc<RpcState>, addr: SocketAddr) -> std::io::Result<()> {
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(%addr, "RPC server listening");
    axum::serve(listener, rpc_router(state)).await
}

/// Handle incoming JSON-RPC requests
async fn handle_rpc(
    State(state): State<Arc<RpcState>>,
    Json(request): Json<JsonRpcRequest>,
) -> (StatusCode, Json<JsonRpcResponse>) {
    let response = handle_request(&state, request).await;
    (StatusCode::OK, Json(response))
}
