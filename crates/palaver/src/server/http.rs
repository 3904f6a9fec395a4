//! HTTP surfaces: the one-shot transport variant, the healthcheck, and
//! the admin disconnect.
//!
//! A POST is its own request/reply exchange: no push, no stale emission.
//! Status mapping is OK → 200 and ERR → the error's code when it is a
//! valid HTTP error status, else 500.

use std::sync::Arc;

use axum::{
    body::Bytes,
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::Value;
use tracing::debug;

use palaverproto::{CloseCode, Reply, Request, WireError};

use crate::events::ServerEvent;

use super::ServerInner;

fn error_status(error: &WireError) -> StatusCode {
    StatusCode::from_u16(error.http_status()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR)
}

fn error_body(error: &WireError) -> Json<Value> {
    Json(serde_json::to_value(error).unwrap_or_else(|_| Value::String(error.message.clone())))
}

/// `POST /api/{task}` — the stateless transport variant.
pub(super) async fn dispatch(
    State(inner): State<Arc<ServerInner>>,
    Path(task): Path<String>,
    body: Bytes,
) -> Response {
    let payload = if body.is_empty() {
        Value::Null
    } else {
        match serde_json::from_slice(&body) {
            Ok(value) => value,
            Err(e) => {
                let error = WireError::new(format!("bad frame: {e}")).with_code(400);
                inner.emit(ServerEvent::Error(error.message.clone()));
                return (StatusCode::BAD_REQUEST, error_body(&error)).into_response();
            }
        }
    };

    let request = Request::new(task, payload);
    debug!(task = %request.task, id = %request.id, "http dispatch");
    inner.emit(ServerEvent::Request(request.clone()));

    let reply = inner.execute(request).await;
    inner.emit(ServerEvent::Reply(reply.clone()));

    match reply {
        Reply::Ok { payload, .. } => (StatusCode::OK, Json(payload)).into_response(),
        Reply::Err { error, .. } => (error_status(&error), error_body(&error)).into_response(),
    }
}

/// `GET /healthcheck` — 200 with the healthcheck result, or the error's
/// status. A server without a healthcheck is trivially healthy.
pub(super) async fn healthcheck(State(inner): State<Arc<ServerInner>>) -> Response {
    match &inner.healthcheck {
        None => (StatusCode::OK, Json(Value::Null)).into_response(),
        Some(healthcheck) => match healthcheck().await {
            Ok(value) => (StatusCode::OK, Json(value)).into_response(),
            Err(error) => {
                inner.emit(ServerEvent::Error(format!(
                    "healthcheck failed: {}",
                    error.message
                )));
                (error_status(&error), error_body(&error)).into_response()
            }
        },
    }
}

/// `GET /disconnect` — admin: close every live connection.
pub(super) async fn disconnect(State(inner): State<Arc<ServerInner>>) -> Response {
    inner.close_all_connections(CloseCode::ServerShuttingOff.to_u16());
    StatusCode::OK.into_response()
}
