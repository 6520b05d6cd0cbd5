use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::IntoResponse,
    Json,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

use crate::config::DispatchConfig;
use crate::error::DispatchError;
use crate::health::HealthChecker;
use crate::key_generator::IdempotencyKey;
use crate::router::{CallStatus, CommandRouter, HandleOrigin};
use crate::validation::{CallRequest, RequestValidator};

/// Shared application state
pub type SharedState = Arc<AppState>;

pub struct AppState {
    pub router: CommandRouter,
    pub health: HealthChecker,
    pub config: DispatchConfig,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct SubmitResponse {
    pub key: IdempotencyKey,
    pub job_id: Option<Uuid>,
    pub origin: HandleOrigin,
    pub status: CallStatus,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct StatusResponse {
    pub key: IdempotencyKey,
    pub status: CallStatus,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct CancelResponse {
    pub key: IdempotencyKey,
    pub cancelled: bool,
}

#[derive(Debug, Deserialize)]
pub struct WaitParams {
    #[serde(default)]
    pub timeout_ms: Option<u64>,
}

/// Submit a tool call
pub async fn call_tool(
    State(state): State<SharedState>,
    Json(payload): Json<CallRequest>,
) -> Result<impl IntoResponse, DispatchError> {
    let call = RequestValidator::validate_call(payload)?;
    let handle = state.router.submit(call).await?;

    let (code, status) = match &handle.cached {
        Some(cached) => (StatusCode::OK, cached.clone()),
        None => (StatusCode::ACCEPTED, CallStatus::Pending),
    };

    Ok((
        code,
        Json(SubmitResponse {
            key: handle.key,
            job_id: handle.job_id,
            origin: handle.origin,
            status,
        }),
    ))
}

/// Current status of a call
pub async fn get_job(
    State(state): State<SharedState>,
    Path(key): Path<String>,
) -> Result<impl IntoResponse, DispatchError> {
    let key = RequestValidator::validate_job_key(&key)?;
    let status = state.router.status_of(&key).await?;

    Ok(Json(StatusResponse { key, status }))
}

/// Block until a call is terminal, or until the optional timeout elapses
pub async fn wait_job(
    State(state): State<SharedState>,
    Path(key): Path<String>,
    Query(params): Query<WaitParams>,
) -> Result<impl IntoResponse, DispatchError> {
    let key = RequestValidator::validate_job_key(&key)?;

    let status = match params.timeout_ms {
        Some(ms) => {
            match tokio::time::timeout(Duration::from_millis(ms), state.router.wait_for(&key)).await
            {
                Ok(status) => status?,
                Err(_) => state.router.status_of(&key).await?,
            }
        }
        None => state.router.wait_for(&key).await?,
    };

    let code = if status.is_terminal() {
        StatusCode::OK
    } else {
        StatusCode::ACCEPTED
    };
    Ok((code, Json(StatusResponse { key, status })))
}

/// Cancel a call that has not settled yet
pub async fn cancel_job(
    State(state): State<SharedState>,
    Path(key): Path<String>,
) -> Result<impl IntoResponse, DispatchError> {
    let key = RequestValidator::validate_job_key(&key)?;
    let cancelled = state.router.cancel_key(&key).await?;

    Ok(Json(CancelResponse { key, cancelled }))
}

/// Health check endpoint
pub async fn health_check(State(state): State<SharedState>) -> impl IntoResponse {
    let health = state.health.check_health().await;
    let code = if health.status == "healthy" {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };

    (code, Json(health))
}

/// Effective dispatch configuration
pub async fn get_config(State(state): State<SharedState>) -> impl IntoResponse {
    Json(state.config.clone())
}
