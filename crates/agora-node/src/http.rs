// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//!
//! The HTTP front door: agent card, health, and the JSON-RPC 2.0 endpoint
//! with SSE streaming for `message/stream`.
//!
//! # Surface
//!
//! | Route | Method | Auth | Purpose |
//! |---|---|---|---|
//! | `/.well-known/agent.json` | GET | no | discovery card |
//! | `/health` | GET | no | liveness snapshot |
//! | `/` | POST | optional | JSON-RPC (`message/send`, `tasks/get`, …) |
//! | `/` (or `/ws`) | GET | optional | WebSocket peer fabric upgrade |
//! | `/shutdown` | POST | optional | clean stop (used by `agora stop`) |
//!
//! JSON-RPC errors are always HTTP 200 with an `error` member; only a
//! failed bearer check is an HTTP-level 401.

use std::convert::Infallible;
use std::sync::Arc;

use axum::{
    extract::{DefaultBodyLimit, State},
    http::{header, HeaderMap, HeaderValue, Method, StatusCode},
    response::sse::{Event, Sse},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json,
};
use tokio::sync::{mpsc, watch};
use tower_http::cors::{Any, CorsLayer};
use tracing::{info, warn};

use agora_config::HubConfig;
use agora_hub::HubHandle;
use agora_proto::{
    jsonrpc, now_ms, AgentCard, AgentMessage, JsonRpcError, JsonRpcRequest, JsonRpcResponse,
    MessageSendParams, WELL_KNOWN_PATH,
};

use crate::auth::BearerAuth;

/// JSON-RPC request bodies are capped at 10 MB.
pub const MAX_BODY_BYTES: usize = 10 * 1024 * 1024;

/// Shared state of every HTTP handler.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<HubConfig>,
    pub hub: HubHandle,
    pub card: Arc<AgentCard>,
    pub auth: Option<Arc<BearerAuth>>,
    /// Flipped by `POST /shutdown`; the serve loop watches it.
    pub shutdown: watch::Sender<bool>,
}

/// Build the Axum router for the full HTTP surface.
pub fn router(state: AppState) -> axum::Router {
    let mut app = axum::Router::new()
        .route(WELL_KNOWN_PATH, get(agent_card))
        .route("/health", get(health))
        // `/` carries both surfaces: POST is JSON-RPC, GET upgrades to the
        // WebSocket peer fabric. `/ws` is an alias for clients that prefer
        // an explicit path.
        .route("/", post(rpc).get(crate::ws::ws_handler))
        .route("/shutdown", post(shutdown))
        .route("/ws", get(crate::ws::ws_handler))
        .layer(DefaultBodyLimit::max(MAX_BODY_BYTES));

    if state.config.cors.enabled {
        app = app.layer(cors_layer(&state.config.cors.origin));
    }
    app.with_state(state)
}

fn cors_layer(origin: &str) -> CorsLayer {
    let layer = CorsLayer::new()
        .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
        .allow_headers([header::CONTENT_TYPE, header::ACCEPT, header::AUTHORIZATION]);
    if origin == "*" {
        layer.allow_origin(Any)
    } else {
        match origin.parse::<HeaderValue>() {
            Ok(value) => layer.allow_origin(value),
            Err(_) => {
                warn!(%origin, "invalid CORS origin, falling back to any");
                layer.allow_origin(Any)
            }
        }
    }
}

pub(crate) fn authorized(state: &AppState, headers: &HeaderMap) -> bool {
    match &state.auth {
        None => true,
        Some(auth) => auth.check(
            headers
                .get(header::AUTHORIZATION)
                .and_then(|v| v.to_str().ok()),
        ),
    }
}

fn unauthorized() -> Response {
    (
        StatusCode::UNAUTHORIZED,
        Json(JsonRpcResponse::error(
            None,
            JsonRpcError::new(jsonrpc::UNAUTHORIZED, "unauthorized"),
        )),
    )
        .into_response()
}

// ── Plain routes ──────────────────────────────────────────────────────────────

/// `GET /.well-known/agent.json` — idempotent, auth-free, and independent of
/// connected peers.
async fn agent_card(State(state): State<AppState>) -> Json<AgentCard> {
    Json((*state.card).clone())
}

async fn health(State(state): State<AppState>) -> Response {
    match state.hub.health().await {
        Ok(snapshot) => Json(snapshot).into_response(),
        Err(_) => StatusCode::SERVICE_UNAVAILABLE.into_response(),
    }
}

async fn shutdown(State(state): State<AppState>, headers: HeaderMap) -> Response {
    if !authorized(&state, &headers) {
        return unauthorized();
    }
    info!("shutdown requested over HTTP");
    let _ = state.shutdown.send(true);
    Json(serde_json::json!({"status": "shutting-down"})).into_response()
}

// ── JSON-RPC ──────────────────────────────────────────────────────────────────

async fn rpc(State(state): State<AppState>, headers: HeaderMap, body: String) -> Response {
    if !authorized(&state, &headers) {
        return unauthorized();
    }

    let request: JsonRpcRequest = match serde_json::from_str(&body) {
        Ok(r) => r,
        Err(_) => {
            return Json(JsonRpcResponse::error(
                None,
                JsonRpcError::new(jsonrpc::INVALID_REQUEST, "invalid request"),
            ))
            .into_response();
        }
    };
    if !request.is_well_formed() {
        return Json(JsonRpcResponse::error(
            request.id,
            JsonRpcError::new(jsonrpc::INVALID_REQUEST, "invalid request"),
        ))
        .into_response();
    }

    let method = request.method.clone();
    match method.as_str() {
        "message/send" => message_send(state, request).await,
        "message/stream" => message_stream(state, request),
        "tasks/get" => tasks_get(state, request).await,
        "tasks/cancel" => tasks_cancel(state, request).await,
        "tasks/pushNotificationConfig/set" | "tasks/pushNotificationConfig/get" => {
            rpc_error(
                request.id,
                jsonrpc::PUSH_NOTIFICATIONS_UNSUPPORTED,
                "push notifications are not supported",
            )
        }
        "tasks/resubscribe" => rpc_error(
            request.id,
            jsonrpc::RESUBSCRIBE_UNSUPPORTED,
            "resubscribe is not supported",
        ),
        _ => rpc_error(request.id, jsonrpc::METHOD_NOT_FOUND, "method not found"),
    }
}

fn rpc_error(
    id: Option<agora_proto::JsonRpcId>,
    code: i64,
    message: impl Into<String>,
) -> Response {
    Json(JsonRpcResponse::error(id, JsonRpcError::new(code, message))).into_response()
}

fn parse_params<T: serde::de::DeserializeOwned>(
    request: &JsonRpcRequest,
) -> Result<T, Response> {
    let params = request.params.clone().unwrap_or(serde_json::Value::Null);
    serde_json::from_value(params).map_err(|e| {
        rpc_error(
            request.id.clone(),
            jsonrpc::INVALID_PARAMS,
            format!("invalid params: {e}"),
        )
    })
}

/// The task id member of `tasks/get` / `tasks/cancel` params.
fn task_id_param(request: &JsonRpcRequest) -> Result<String, Response> {
    let params = request.params.as_ref();
    params
        .and_then(|p| p.get("id").or_else(|| p.get("taskId")))
        .and_then(|v| v.as_str())
        .map(str::to_string)
        .ok_or_else(|| {
            rpc_error(
                request.id.clone(),
                jsonrpc::INVALID_PARAMS,
                "invalid params: missing task id",
            )
        })
}

async fn message_send(state: AppState, request: JsonRpcRequest) -> Response {
    let params: MessageSendParams = match parse_params(&request) {
        Ok(p) => p,
        Err(resp) => return resp,
    };

    let timeout = state.config.network.request_timeout();
    match tokio::time::timeout(timeout, state.hub.send_message(params, None)).await {
        Ok(Ok(result)) => Json(JsonRpcResponse::success(
            request.id,
            serde_json::to_value(result).unwrap_or_default(),
        ))
        .into_response(),
        Ok(Err(e)) => rpc_error(request.id, e.kind().code(), e.to_string()),
        Err(_) => rpc_error(request.id, jsonrpc::INTERNAL_ERROR, "request timed out"),
    }
}

/// `message/stream` — the same semantics as `message/send`, but every
/// intermediate agent message is emitted as one SSE event framed as a
/// JSON-RPC response carrying the request's `id`.
fn message_stream(state: AppState, request: JsonRpcRequest) -> Response {
    let params: MessageSendParams = match parse_params(&request) {
        Ok(p) => p,
        Err(resp) => return resp,
    };

    let (tx, mut rx) = mpsc::channel::<AgentMessage>(64);
    let hub = state.hub.clone();
    let pending = tokio::spawn(async move { hub.send_message(params, Some(tx)).await });
    let id = request.id;

    let stream = async_stream::stream! {
        while let Some(msg) = rx.recv().await {
            let result = serde_json::json!({"taskId": msg.task_id, "message": msg});
            yield Ok::<Event, Infallible>(sse_event(JsonRpcResponse::success(
                id.clone(),
                result,
            )));
        }
        // The channel closed: the handler run is over. Surface a failure as
        // a final error event; a success already streamed its last message.
        match pending.await {
            Ok(Ok(_)) => {}
            Ok(Err(e)) => {
                yield Ok(sse_event(JsonRpcResponse::error(
                    id.clone(),
                    JsonRpcError::new(e.kind().code(), e.to_string()),
                )));
            }
            Err(_) => {
                yield Ok(sse_event(JsonRpcResponse::error(
                    id.clone(),
                    JsonRpcError::new(jsonrpc::INTERNAL_ERROR, "internal error"),
                )));
            }
        }
    };

    Sse::new(stream).into_response()
}

fn sse_event(response: JsonRpcResponse) -> Event {
    Event::default()
        .id(now_ms().to_string())
        .data(serde_json::to_string(&response).unwrap_or_default())
}

async fn tasks_get(state: AppState, request: JsonRpcRequest) -> Response {
    let task_id = match task_id_param(&request) {
        Ok(id) => id,
        Err(resp) => return resp,
    };
    match state.hub.get_task(task_id).await {
        Ok(Some(view)) => Json(JsonRpcResponse::success(
            request.id,
            serde_json::to_value(view).unwrap_or_default(),
        ))
        .into_response(),
        Ok(None) => rpc_error(request.id, jsonrpc::TASK_NOT_FOUND, "task not found"),
        Err(e) => rpc_error(request.id, e.kind().code(), e.to_string()),
    }
}

async fn tasks_cancel(state: AppState, request: JsonRpcRequest) -> Response {
    let task_id = match task_id_param(&request) {
        Ok(id) => id,
        Err(resp) => return resp,
    };
    match state.hub.cancel_task(task_id).await {
        Ok(view) => Json(JsonRpcResponse::success(
            request.id,
            serde_json::to_value(view).unwrap_or_default(),
        ))
        .into_response(),
        Err(e) => rpc_error(request.id, e.kind().code(), e.to_string()),
    }
}

// ── Unit tests ────────────────────────────────────────────────────────────────
