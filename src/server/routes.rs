use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::rejection::JsonRejection;
use axum::extract::{ConnectInfo, Extension, Path};
use axum::http::{HeaderMap, HeaderValue, StatusCode, header};
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Deserialize;

use super::errors::{gateway_error_to_response, json_error, malformed_request};
use super::AppState;
use crate::gateway::SubmitRequest;

#[derive(Debug, Deserialize)]
pub struct ReceiptRequest {
    #[serde(default)]
    pub receipt: String,
}

pub fn router() -> Router {
    Router::new()
        .route("/v1/generate", post(generate))
        .route("/v1/task/:id", get(task))
        .route("/v1/quota", get(quota))
        .route("/v1/receipt/verify", post(verify_receipt))
        .route("/static/:file", get(artifact))
}

pub async fn health(Extension(state): Extension<Arc<AppState>>) -> axum::response::Response {
    Json(state.gateway.health()).into_response()
}

pub async fn generate(
    Extension(state): Extension<Arc<AppState>>,
    peer: Option<ConnectInfo<SocketAddr>>,
    headers: HeaderMap,
    body: Result<Json<SubmitRequest>, JsonRejection>,
) -> axum::response::Response {
    let Ok(Json(body)) = body else {
        return malformed_request();
    };
    let caller = state.identity.resolve(&headers, peer.map(|ConnectInfo(addr)| addr));
    match state.gateway.submit(&caller, body) {
        Ok(accepted) => Json(accepted).into_response(),
        Err(err) => gateway_error_to_response(err),
    }
}

pub async fn task(
    Extension(state): Extension<Arc<AppState>>,
    Path(id): Path<String>,
) -> axum::response::Response {
    match state.gateway.poll(&id) {
        Ok(view) => Json(view).into_response(),
        Err(err) => gateway_error_to_response(err),
    }
}

pub async fn quota(
    Extension(state): Extension<Arc<AppState>>,
    peer: Option<ConnectInfo<SocketAddr>>,
    headers: HeaderMap,
) -> axum::response::Response {
    let caller = state.identity.resolve(&headers, peer.map(|ConnectInfo(addr)| addr));
    Json(state.gateway.quota(&caller)).into_response()
}

pub async fn verify_receipt(
    Extension(state): Extension<Arc<AppState>>,
    peer: Option<ConnectInfo<SocketAddr>>,
    headers: HeaderMap,
    body: Result<Json<ReceiptRequest>, JsonRejection>,
) -> axum::response::Response {
    let Ok(Json(body)) = body else {
        return malformed_request();
    };
    let caller = state.identity.resolve(&headers, peer.map(|ConnectInfo(addr)| addr));
    match state.gateway.verify_receipt(&caller, &body.receipt) {
        Ok(outcome) => Json(outcome).into_response(),
        Err(err) => gateway_error_to_response(err),
    }
}

pub async fn artifact(
    Extension(state): Extension<Arc<AppState>>,
    Path(file): Path<String>,
) -> axum::response::Response {
    match state.gateway.artifacts().read(&file).await {
        Ok(Some(bytes)) => (
            StatusCode::OK,
            [(header::CONTENT_TYPE, HeaderValue::from_static("image/png"))],
            bytes,
        )
            .into_response(),
        Ok(None) => json_error(StatusCode::NOT_FOUND, "not_found", "artifact not found"),
        Err(err) => gateway_error_to_response(err),
    }
}
