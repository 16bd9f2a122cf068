//! HTTP surface: routers, shared state, auth and deprecation middleware.

mod channels;
mod jobs;
mod rate_limit;
mod servers;
mod sessions;
mod ws;

pub use rate_limit::{ClientIp, RateLimiters};

use axum::extract::{Request, State};
use axum::http::HeaderValue;
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use serde_json::json;
use std::sync::Arc;

use crate::bus::MessageBus;
use crate::config::Config;
use crate::error::{ApiError, ErrorCode};
use crate::jobs::JobManager;
use crate::messages::MessageService;
use crate::runtime::RuntimeRegistry;
use crate::sessions::SessionManager;
use crate::socket::SocketHub;

/// Application state shared across handlers.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub service: Arc<MessageService>,
    pub sessions: Arc<SessionManager>,
    pub jobs: Arc<JobManager>,
    pub hub: Arc<SocketHub>,
    pub bus: Arc<MessageBus>,
    pub registry: Arc<RuntimeRegistry>,
    pub rate_limits: Arc<RateLimiters>,
}

/// Assemble the full router: canonical routes, deprecated aliases, auth,
/// and rate limiting.
pub fn create_router(state: AppState) -> Router {
    let api = Router::new()
        .nest("/channels", channels::routes())
        .merge(servers::routes())
        .nest("/sessions", sessions::routes())
        .nest("/jobs", jobs::routes())
        // Deprecated aliases forward to the same handlers and flag
        // themselves in a response header.
        .nest(
            "/central-channels",
            channels::routes().layer(middleware::from_fn(mark_deprecated)),
        )
        .nest(
            "/central-servers",
            servers::server_collection_routes().layer(middleware::from_fn(mark_deprecated)),
        )
        .nest(
            "/servers",
            servers::server_collection_routes().layer(middleware::from_fn(mark_deprecated)),
        )
        .layer(middleware::from_fn_with_state(
            state.clone(),
            require_api_key,
        ))
        .layer(middleware::from_fn_with_state(
            state.clone(),
            rate_limit::general_rate_limit,
        ));

    Router::new()
        .nest("/api", api)
        .route("/ws", get(ws::ws_upgrade))
        .route("/healthz", get(healthz))
        .layer(middleware::from_fn(rate_limit::attach_client_ip))
        .with_state(state)
}

async fn healthz(State(state): State<AppState>) -> impl IntoResponse {
    Json(json!({
        "status": "ok",
        "connectedSockets": state.hub.connected_sockets(),
    }))
}

/// Gate `/api/*` behind the shared API key when one is configured.
async fn require_api_key(
    State(state): State<AppState>,
    request: Request,
    next: Next,
) -> Response {
    if let Some(expected) = &state.config.auth_token {
        let provided = request
            .headers()
            .get("x-api-key")
            .and_then(|v| v.to_str().ok());
        if provided != Some(expected.as_str()) {
            return ApiError::new(ErrorCode::MissingApiKey, "missing or invalid API key")
                .into_response();
        }
    }
    next.run(request).await
}

/// Deprecated alias marker: warn once per request and advertise the
/// canonical prefix to the client.
async fn mark_deprecated(request: Request, next: Next) -> Response {
    let path = request.uri().path().to_string();
    tracing::warn!(path = %path, "deprecated API path used, serving canonical handler");
    let mut response = next.run(request).await;
    response.headers_mut().insert(
        "x-deprecation-warning",
        HeaderValue::from_static("this path prefix is deprecated"),
    );
    response
}
