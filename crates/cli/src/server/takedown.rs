//! Forwarding of `/takedown/` requests to the upstream license service.

use super::AppState;
use axum::{
    body::{Body, to_bytes},
    extract::State,
    http::{Method, StatusCode, Uri, header},
    response::{IntoResponse, Response},
};
use tracing::{info, warn};

const PREFIX: &str = "/takedown/";

/// Upper bound on a forwarded request body
const MAX_BODY: usize = 1024 * 1024;

pub async fn handle(
    State(state): State<AppState>,
    method: Method,
    uri: Uri,
    body: Body,
) -> Response {
    if method != Method::POST {
        return StatusCode::OK.into_response();
    }

    let rest = uri.path().strip_prefix(PREFIX).unwrap_or_default();
    let target = format!("{}{}", state.config.takedown_url, rest);

    let payload = match to_bytes(body, MAX_BODY).await {
        Ok(payload) => payload,
        Err(err) => {
            warn!(error = %err, "Failed to read takedown request");
            return StatusCode::INTERNAL_SERVER_ERROR.into_response();
        }
    };

    info!(%target, bytes = payload.len(), "Forwarding takedown");
    let upstream = match state
        .http
        .post(&target)
        .header(header::CONTENT_TYPE, "application/json")
        .body(payload)
        .send()
        .await
    {
        Ok(upstream) => upstream,
        Err(err) => {
            warn!(%target, error = %err, "Takedown upstream unreachable");
            return StatusCode::INTERNAL_SERVER_ERROR.into_response();
        }
    };

    let status = StatusCode::from_u16(upstream.status().as_u16())
        .unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    match upstream.bytes().await {
        Ok(bytes) => {
            info!(%target, %status, "Takedown answered");
            (status, bytes).into_response()
        }
        Err(err) => {
            warn!(%target, error = %err, "Failed to read takedown response");
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}
