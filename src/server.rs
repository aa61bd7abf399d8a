//! HTTP block server.
//!
//! Three endpoints over a local [`DiskStore`]:
//!
//! - `GET /sha256/{id}` — the block bytes, or 504 when not locally held
//! - `GET /sha256/like/{id}` — JSON `{url: size}` neighbors, 404 when empty
//! - `PUT /sha256/{id}` — store a block; the body digest must equal `{id}`
//!
//! No authentication: the server assumes trusted neighbors for PUT, but it
//! does verify the digest so a corrupt upload never lands on disk.

use std::sync::Arc;

use axum::body::Bytes;
use axum::extract::{Path, State};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::Router;
use tracing::{debug, info};

use crate::error::{LibernetError, Result};
use crate::hash::Identifier;
use crate::store::{BlockStore, DiskStore};
use crate::url;

#[derive(Clone)]
struct ServerState {
    store: Arc<DiskStore>,
}

/// Assemble the block-server router.
pub fn router(store: Arc<DiskStore>) -> Router {
    Router::new()
        .route("/", get(home))
        .route("/sha256/like/:id", get(like_block))
        .route("/sha256/:id", get(get_block).put(put_block))
        .with_state(ServerState { store })
}

async fn home() -> axum::response::Html<&'static str> {
    axum::response::Html("<html><body>Welcome</body></html>")
}

/// Serve on the given port until the task is cancelled.
pub async fn serve(store: Arc<DiskStore>, port: u16) -> Result<()> {
    let listener = tokio::net::TcpListener::bind(("0.0.0.0", port))
        .await
        .map_err(|e| LibernetError::io(e, format!("0.0.0.0:{port}")))?;
    serve_with_listener(store, listener).await
}

/// Serve on an already-bound listener. Lets callers (and tests) pick an
/// ephemeral port before handing control over.
pub async fn serve_with_listener(
    store: Arc<DiskStore>,
    listener: tokio::net::TcpListener,
) -> Result<()> {
    if let Ok(address) = listener.local_addr() {
        info!("block server listening on {address}");
    }

    axum::serve(listener, router(store))
        .await
        .map_err(|e| LibernetError::io(e, "block server"))
}

fn parse_identifier(id: &str) -> std::result::Result<Identifier, Response> {
    id.parse::<Identifier>()
        .map_err(|_| (StatusCode::BAD_REQUEST, "bad identifier").into_response())
}

async fn get_block(State(state): State<ServerState>, Path(id): Path<String>) -> Response {
    let identifier = match parse_identifier(&id) {
        Ok(identifier) => identifier,
        Err(response) => return response,
    };

    let address = url::for_data_block(&identifier, false);
    let result =
        tokio::task::spawn_blocking(move || state.store.get(&address)).await;

    match result {
        Ok(Ok(Some(data))) => (
            [(header::CONTENT_TYPE, "application/octet-stream")],
            data,
        )
            .into_response(),
        Ok(Ok(None)) => (StatusCode::GATEWAY_TIMEOUT, "block not available").into_response(),
        _ => (StatusCode::INTERNAL_SERVER_ERROR, "storage failure").into_response(),
    }
}

async fn like_block(State(state): State<ServerState>, Path(id): Path<String>) -> Response {
    let identifier = match parse_identifier(&id) {
        Ok(identifier) => identifier,
        Err(response) => return response,
    };

    let target = url::for_data_block(&identifier, true);
    let result = tokio::task::spawn_blocking(move || state.store.like(&target)).await;

    match result {
        Ok(Ok(likes)) if likes.is_empty() => {
            (StatusCode::NOT_FOUND, "no matches").into_response()
        }
        Ok(Ok(likes)) => axum::Json(likes).into_response(),
        _ => (StatusCode::INTERNAL_SERVER_ERROR, "storage failure").into_response(),
    }
}

async fn put_block(
    State(state): State<ServerState>,
    Path(id): Path<String>,
    body: Bytes,
) -> Response {
    let identifier = match parse_identifier(&id) {
        Ok(identifier) => identifier,
        Err(response) => return response,
    };

    if Identifier::of(&body) != identifier {
        return (StatusCode::BAD_REQUEST, "digest mismatch").into_response();
    }

    debug!("receiving {} bytes for {identifier}", body.len());
    let address = url::for_data_block(&identifier, false);
    let result =
        tokio::task::spawn_blocking(move || state.store.put(&address, &body)).await;

    match result {
        Ok(Ok(())) => "data received".into_response(),
        _ => (StatusCode::INTERNAL_SERVER_ERROR, "storage failure").into_response(),
    }
}
