use anyhow::Result;
use axum::extract::FromRequestParts;
use axum::http::request::Parts;
use axum::{
    extract::{Path, State},
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde_json::{json, Map, Value};
use std::net::SocketAddr;
use std::sync::Arc;
use subtle::ConstantTimeEq;
use tower_http::trace::TraceLayer;
use tracing::{error, info, warn};

use crate::commands::updater::SalesforceUpdater;
use crate::config::Settings;
use crate::security::auth::{AuthError, Authenticator};
use crate::security::token_cache::SessionCache;
use crate::transport::rest::SalesforceClient;
use crate::workflow::{run_sync, SyncError, SyncPlan, SyncSummary};

type SharedState = Arc<AppState>;

#[derive(Debug, Clone)]
pub struct AppState {
    pub settings: Arc<Settings>,
    pub sessions: SessionCache,
}

impl AppState {
    pub fn new(settings: Settings) -> Result<Self, AuthError> {
        let authenticator = Authenticator::new(settings.credentials.clone())?;
        let sessions = SessionCache::new(authenticator, settings.flow, &settings.api_version);
        Ok(Self {
            settings: Arc::new(settings),
            sessions,
        })
    }
}

fn error_body(status: StatusCode, message: impl Into<String>) -> Response {
    (status, Json(json!({"error": message.into()}))).into_response()
}

impl IntoResponse for SyncError {
    fn into_response(self) -> Response {
        let status = match &self {
            SyncError::InvalidPlan(_) => StatusCode::BAD_REQUEST,
            SyncError::Auth(_) | SyncError::Query(_) => StatusCode::BAD_GATEWAY,
            SyncError::Output(_) | SyncError::Upload(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        error!(status = status.as_u16(), error = %self, "trigger request failed");
        error_body(status, self.to_string())
    }
}

// Bearer check against TRIGGER_TOKEN; open when no token is configured.
struct Authorized;

impl FromRequestParts<SharedState> for Authorized {
    type Rejection = Response;

    async fn from_request_parts(parts: &mut Parts, state: &SharedState) -> Result<Self, Self::Rejection> {
        let Some(expected) = state.settings.trigger_token.as_deref() else {
            return Ok(Authorized);
        };

        let presented = parts
            .headers
            .get(header::AUTHORIZATION)
            .and_then(|value| value.to_str().ok())
            .and_then(|value| value.strip_prefix("Bearer "))
            .unwrap_or("");

        if bool::from(presented.as_bytes().ct_eq(expected.as_bytes())) {
            Ok(Authorized)
        } else {
            warn!(path = %parts.uri.path(), "rejected trigger request with bad token");
            Err(error_body(StatusCode::UNAUTHORIZED, "unauthorized"))
        }
    }
}

async fn health() -> impl IntoResponse {
    Json(json!({"status": "ok"}))
}

async fn trigger_sync(
    _auth: Authorized,
    State(state): State<SharedState>,
    Json(plan): Json<SyncPlan>,
) -> Result<Json<SyncSummary>, SyncError> {
    let summary = run_sync(&state.settings, &state.sessions, &plan).await?;
    Ok(Json(summary))
}

async fn updater_for(state: &AppState) -> Result<SalesforceUpdater, SyncError> {
    let session = state.sessions.session().await?;
    let client = SalesforceClient::new(session, state.sessions.api_version(), state.settings.http_timeout)
        .map_err(SyncError::Query)?;
    Ok(SalesforceUpdater::new(client))
}

fn outcome_response(outcome: crate::transport::UpdateOutcome) -> Response {
    let status = if outcome.success {
        StatusCode::OK
    } else {
        StatusCode::BAD_GATEWAY
    };
    (status, Json(outcome)).into_response()
}

async fn update_record(
    _auth: Authorized,
    State(state): State<SharedState>,
    Path((object, id)): Path<(String, String)>,
    Json(fields): Json<Map<String, Value>>,
) -> Result<Response, SyncError> {
    let updater = updater_for(&state).await?;
    let outcome = updater.update_record(&object, &id, fields, Map::new()).await;
    Ok(outcome_response(outcome))
}

async fn update_by_key(
    _auth: Authorized,
    State(state): State<SharedState>,
    Path((object, field, value)): Path<(String, String, String)>,
    Json(fields): Json<Map<String, Value>>,
) -> Result<Response, SyncError> {
    let updater = updater_for(&state).await?;
    let outcome = updater
        .update_by_natural_key(&object, &field, &value, fields, Map::new())
        .await;
    Ok(outcome_response(outcome))
}

pub fn create_router(state: SharedState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/api/v1/sync", post(trigger_sync))
        .route("/api/v1/records/{object}/{id}", post(update_record))
        .route("/api/v1/records/{object}/by/{field}/{value}", post(update_by_key))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!("Failed to listen for shutdown signal: {}", e);
    }
    info!("Shutdown signal received");
}

pub async fn serve(settings: Settings, port: u16) -> Result<()> {
    if settings.trigger_token.is_none() {
        warn!("TRIGGER_TOKEN is not set; trigger endpoints are unauthenticated");
    }
    let state = Arc::new(AppState::new(settings)?);
    let app = create_router(state);

    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!("HTTP server listening on {}", addr);
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;
    Ok(())
}
