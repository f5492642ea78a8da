//! fleetgated HTTP API
//!
//! Axum routes over the access engine. Handlers stay thin: decode the
//! request, call one engine operation with the current time, and map
//! the result. All error semantics live in the core error taxonomy;
//! this layer only translates each variant to a status code.

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{delete, get, post};
use axum::{Json, Router};
use chrono::{DateTime, Utc};
use fleetgate_core::{
    AccessEngine, CoreError, Credentials, IdentityUpdateRequest, NewIdentityRequest,
    RegistrationRequest,
};
use fleetgate_store::NewMachine;
use fleetgate_util::{IdentityId, MachineId, SessionId};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::Arc;
use tracing::error;

/// Shared server state injected into all handlers.
#[derive(Clone)]
pub struct AppState {
    pub engine: Arc<AccessEngine>,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/", get(|| async { "fleetgated ok" }))
        .route("/health", get(health))
        .route("/login", post(login))
        .route("/register", post(register))
        .route("/machines", get(list_machines).post(create_machine))
        .route("/machines/{id}", delete(delete_machine))
        .route("/identities", post(create_identity))
        .route(
            "/identities/{id}",
            axum::routing::patch(update_identity).delete(delete_identity),
        )
        .route("/identities/{id}/machines", get(list_assigned_machines))
        .route("/assignments", post(create_assignment))
        .route("/sessions", get(list_sessions))
        .route("/sessions/start", post(start_session))
        .route("/sessions/end", post(end_session))
        .with_state(state)
}

/// Wrapper so core errors can flow out of handlers with `?`.
struct ApiError(CoreError);

impl From<CoreError> for ApiError {
    fn from(e: CoreError) -> Self {
        Self(e)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            CoreError::NotAuthenticated => StatusCode::UNAUTHORIZED,
            CoreError::NotFound(_) => StatusCode::NOT_FOUND,
            CoreError::Forbidden(_) => StatusCode::FORBIDDEN,
            CoreError::Conflict(_) | CoreError::AlreadyClosed(_) => StatusCode::CONFLICT,
            CoreError::Store(_) | CoreError::Internal(_) => {
                error!(error = %self.0, "Request failed");
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };
        (status, Json(json!({ "error": self.0.to_string() }))).into_response()
    }
}

type ApiResult<T> = Result<T, ApiError>;

async fn health(State(state): State<AppState>) -> impl IntoResponse {
    let healthy = state.engine.is_healthy();
    let status = if healthy {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (status, Json(json!({ "healthy": healthy })))
}

async fn login(
    State(state): State<AppState>,
    Json(creds): Json<Credentials>,
) -> ApiResult<impl IntoResponse> {
    let identity = state.engine.authenticate(&creds)?;
    Ok(Json(identity))
}

async fn register(
    State(state): State<AppState>,
    Json(req): Json<RegistrationRequest>,
) -> ApiResult<impl IntoResponse> {
    let id = state.engine.register_device(&req)?;
    Ok((StatusCode::CREATED, Json(json!({ "identity_id": id }))))
}

async fn list_machines(State(state): State<AppState>) -> ApiResult<impl IntoResponse> {
    Ok(Json(state.engine.list_visible_machines()?))
}

#[derive(Debug, Deserialize)]
struct CreateMachinePayload {
    name: String,
    hw_address: String,
    #[serde(default)]
    friendly_name: Option<String>,
    #[serde(default = "default_active")]
    active: bool,
}

fn default_active() -> bool {
    true
}

async fn create_machine(
    State(state): State<AppState>,
    Json(payload): Json<CreateMachinePayload>,
) -> ApiResult<impl IntoResponse> {
    let machine = state.engine.create_machine(&NewMachine {
        name: payload.name,
        hw_address: payload.hw_address,
        friendly_name: payload.friendly_name,
        active: payload.active,
    })?;
    Ok((StatusCode::CREATED, Json(machine)))
}

async fn delete_machine(
    State(state): State<AppState>,
    Path(id): Path<MachineId>,
) -> ApiResult<impl IntoResponse> {
    state.engine.delete_machine(id)?;
    Ok(StatusCode::NO_CONTENT)
}

async fn create_identity(
    State(state): State<AppState>,
    Json(req): Json<NewIdentityRequest>,
) -> ApiResult<impl IntoResponse> {
    let identity = state.engine.create_identity(&req)?;
    Ok((StatusCode::CREATED, Json(identity)))
}

async fn update_identity(
    State(state): State<AppState>,
    Path(id): Path<IdentityId>,
    Json(req): Json<IdentityUpdateRequest>,
) -> ApiResult<impl IntoResponse> {
    let identity = state.engine.update_identity(id, &req)?;
    Ok(Json(identity))
}

async fn delete_identity(
    State(state): State<AppState>,
    Path(id): Path<IdentityId>,
) -> ApiResult<impl IntoResponse> {
    state.engine.delete_identity(id)?;
    Ok(StatusCode::NO_CONTENT)
}

async fn list_assigned_machines(
    State(state): State<AppState>,
    Path(id): Path<IdentityId>,
) -> ApiResult<impl IntoResponse> {
    let machines = state.engine.list_assigned_machines(id, fleetgate_util::now())?;
    Ok(Json(machines))
}

#[derive(Debug, Deserialize)]
struct CreateAssignmentPayload {
    identity_id: IdentityId,
    machine_id: MachineId,
    #[serde(default)]
    ends_at: Option<DateTime<Utc>>,
}

async fn create_assignment(
    State(state): State<AppState>,
    Json(payload): Json<CreateAssignmentPayload>,
) -> ApiResult<impl IntoResponse> {
    let assignment = state.engine.assign_machine(
        payload.identity_id,
        payload.machine_id,
        payload.ends_at,
        fleetgate_util::now(),
    )?;
    Ok((StatusCode::CREATED, Json(assignment)))
}

async fn list_sessions(State(state): State<AppState>) -> ApiResult<impl IntoResponse> {
    Ok(Json(state.engine.list_sessions()?))
}

#[derive(Debug, Deserialize)]
struct StartSessionPayload {
    identity_id: IdentityId,
    hw_address: String,
}

#[derive(Debug, Serialize)]
struct StartSessionReply {
    session_id: SessionId,
}

async fn start_session(
    State(state): State<AppState>,
    Json(payload): Json<StartSessionPayload>,
) -> ApiResult<impl IntoResponse> {
    let session_id = state.engine.start_session(
        payload.identity_id,
        &payload.hw_address,
        fleetgate_util::now(),
    )?;
    Ok((StatusCode::CREATED, Json(StartSessionReply { session_id })))
}

#[derive(Debug, Deserialize)]
struct EndSessionPayload {
    session_id: SessionId,
}

async fn end_session(
    State(state): State<AppState>,
    Json(payload): Json<EndSessionPayload>,
) -> ApiResult<impl IntoResponse> {
    let session = state
        .engine
        .end_session(payload.session_id, fleetgate_util::now())?;
    Ok(Json(session))
}
