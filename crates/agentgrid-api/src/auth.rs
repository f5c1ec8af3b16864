//! Bearer-token middleware.
//!
//! With no shared secret configured the machine runs standalone and every
//! request passes. Otherwise `Authorization: Bearer <secret>` is required.

use axum::Json;
use axum::extract::{Request, State};
use axum::http::StatusCode;
use axum::http::header::AUTHORIZATION;
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use tracing::warn;

use agentgrid_core::{ErrorBody, ErrorCode};

use crate::ApiState;

pub async fn require_secret(State(state): State<ApiState>, request: Request, next: Next) -> Response {
    let Some(secret) = state.registry().secret() else {
        return next.run(request).await;
    };

    let Some(header) = request.headers().get(AUTHORIZATION) else {
        return unauthorized(ErrorCode::AuthRequired, "Missing Authorization header");
    };

    let presented = header
        .to_str()
        .ok()
        .and_then(|value| value.strip_prefix("Bearer "));
    if presented != Some(secret) {
        warn!(path = %request.uri().path(), "rejected request with invalid secret");
        return unauthorized(ErrorCode::AuthFailed, "Invalid secret");
    }

    next.run(request).await
}

fn unauthorized(code: ErrorCode, message: &str) -> Response {
    (StatusCode::UNAUTHORIZED, Json(ErrorBody::new(code, message))).into_response()
}
