//! HTTP surface: binds request headers to the public operations.

use crate::binding::RequestBinding;
use crate::error::BridgeError;
use crate::naming;
use crate::ops::{Bridge, ExecuteRequest, ExecuteResponse, QueryResponse};
use axum::{
    Extension, Json, Router,
    http::{HeaderMap, StatusCode},
    response::IntoResponse,
    routing::{get, post},
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use unrelated_http_tools::call::CallSpec;

#[derive(Debug, Deserialize)]
struct QueryRequest {
    question: String,
}

/// `execute` accepts `{call, poll}` or a bare call spec.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum ExecuteBody {
    Wrapped(ExecuteRequest),
    Bare(CallSpec),
}

#[derive(Serialize)]
struct OkResponse {
    ok: bool,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct RefreshResponse {
    ok: bool,
    kind: String,
    operations: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    title: Option<String>,
}

pub fn router(bridge: Arc<Bridge>) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/v1/tools", get(list_tools))
        .route("/v1/query", post(query))
        .route("/v1/execute", post(execute))
        .route("/v1/refresh", post(refresh))
        .layer(Extension(bridge))
}

/// Serve until `shutdown` is cancelled.
///
/// # Errors
///
/// Returns an error if the server fails while accepting connections.
pub async fn serve(
    listener: TcpListener,
    bridge: Arc<Bridge>,
    shutdown: CancellationToken,
) -> std::io::Result<()> {
    if let Ok(addr) = listener.local_addr() {
        tracing::info!(%addr, "bridge listening");
    }
    axum::serve(listener, router(bridge))
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await
}

async fn healthz() -> impl IntoResponse {
    Json(OkResponse { ok: true })
}

fn binding_error(e: &BridgeError) -> axum::response::Response {
    (
        StatusCode::BAD_REQUEST,
        Json(serde_json::json!({"ok": false, "error": e.body()})),
    )
        .into_response()
}

async fn list_tools(headers: HeaderMap) -> impl IntoResponse {
    match RequestBinding::from_headers(&headers) {
        Ok(binding) => Json(serde_json::json!({"tools": naming::tools(&binding)})).into_response(),
        Err(e) => binding_error(&e),
    }
}

async fn query(
    Extension(bridge): Extension<Arc<Bridge>>,
    headers: HeaderMap,
    Json(req): Json<QueryRequest>,
) -> impl IntoResponse {
    let binding = match RequestBinding::from_headers(&headers) {
        Ok(b) => b,
        Err(e) => return binding_error(&e),
    };
    // Dropped with the request future, cancelling outstanding calls and polls.
    let cancel = CancellationToken::new();
    let _guard = cancel.clone().drop_guard();
    let response: QueryResponse = bridge.query(&binding, &req.question, &cancel).await;
    Json(response).into_response()
}

async fn execute(
    Extension(bridge): Extension<Arc<Bridge>>,
    headers: HeaderMap,
    Json(body): Json<ExecuteBody>,
) -> impl IntoResponse {
    let binding = match RequestBinding::from_headers(&headers) {
        Ok(b) => b,
        Err(e) => return binding_error(&e),
    };
    let request = match body {
        ExecuteBody::Wrapped(r) => r,
        ExecuteBody::Bare(call) => call.into(),
    };
    let cancel = CancellationToken::new();
    let _guard = cancel.clone().drop_guard();
    let response: ExecuteResponse = bridge.execute(&binding, request, &cancel).await;
    Json(response).into_response()
}

async fn refresh(
    Extension(bridge): Extension<Arc<Bridge>>,
    headers: HeaderMap,
) -> impl IntoResponse {
    let binding = match RequestBinding::from_headers(&headers) {
        Ok(b) => b,
        Err(e) => return binding_error(&e),
    };
    match bridge.refresh(&binding).await {
        Ok(descriptor) => Json(RefreshResponse {
            ok: true,
            kind: descriptor.kind.to_string(),
            operations: descriptor.capability.operations.len(),
            title: descriptor.capability.title.clone(),
        })
        .into_response(),
        Err(e) => {
            tracing::warn!(target_url = %binding.target_url, error = %e, "refresh failed");
            Json(serde_json::json!({"ok": false, "error": e.body()})).into_response()
        }
    }
}
