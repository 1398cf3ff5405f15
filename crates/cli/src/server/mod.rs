//! HTTP surface of the origin.
//!
//! - `/time` answers with the current UTC time
//! - `/takedown/*` is proxied to the configured upstream
//! - everything else is dispatched to the live store or the filesystem

mod dispatch;
mod takedown;

use axum::{
    Router,
    http::{HeaderValue, StatusCode, header},
    response::IntoResponse,
    routing::any,
};
use chrono::{SecondsFormat, Utc};
use live_origin_core::{LiveStreamStore, OriginConfig, TokenBucket};
use std::sync::Arc;
use tower_http::{set_header::SetResponseHeaderLayer, trace::TraceLayer};
use tracing::debug;

#[derive(Clone)]
pub struct AppState {
    pub store: Arc<LiveStreamStore>,
    pub config: Arc<OriginConfig>,
    pub http: reqwest::Client,
}

impl AppState {
    pub fn new(store: Arc<LiveStreamStore>, config: OriginConfig) -> Self {
        Self {
            store,
            config: Arc::new(config),
            http: reqwest::Client::new(),
        }
    }

    /// Fresh bucket for one response stream
    pub fn bucket(&self) -> TokenBucket {
        TokenBucket::new(self.config.rate_limit_bytes(), self.config.burst_bytes)
    }
}

pub fn router(state: AppState) -> Router {
    let any_value = HeaderValue::from_static("*");

    Router::new()
        .route("/time", any(time_handler))
        .route("/takedown/", any(takedown::handle))
        .route("/takedown/{*rest}", any(takedown::handle))
        .fallback(dispatch::handle)
        .layer(SetResponseHeaderLayer::overriding(
            header::ACCESS_CONTROL_ALLOW_ORIGIN,
            any_value.clone(),
        ))
        .layer(SetResponseHeaderLayer::overriding(
            header::ACCESS_CONTROL_ALLOW_METHODS,
            any_value.clone(),
        ))
        .layer(SetResponseHeaderLayer::overriding(
            header::ACCESS_CONTROL_ALLOW_HEADERS,
            any_value,
        ))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Current server time, usable as a DASH UTCTiming source
async fn time_handler() -> impl IntoResponse {
    let now = Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true);
    debug!(time = %now, "TIME request");
    (StatusCode::OK, now)
}
