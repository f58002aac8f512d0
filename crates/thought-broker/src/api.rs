//! HTTP API for the broker.
//!
//! `POST /v1/loop/start` drives a loop to its terminal state inside the
//! request. Every other route is a read against registry snapshots.

use std::sync::Arc;

use axum::{
    extract::{rejection::JsonRejection, DefaultBodyLimit, Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use chrono::Utc;
use deliberation::{LoopManager, StartRequest, VoiceId};
use serde::{de, Deserialize, Deserializer, Serialize};
use serde_path_to_error::Segment;
use serde_json::{json, Value};
use tower_http::trace::TraceLayer;
use tracing::error;

pub const SERVICE_NAME: &str = "thought-broker";

/// Request bodies above this are rejected before parsing.
const BODY_LIMIT: usize = 1024 * 1024;

pub type AppState = Arc<LoopManager>;

/// Build the API router.
pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/v1/loop/health", get(health))
        .route("/v1/loop/start", post(start_loop))
        .route("/v1/loop/:id/status", get(loop_status))
        .route("/v1/loop/:id/consensus", get(loop_consensus))
        .route("/v1/loop/:id/audit", get(loop_audit))
        .route("/v1/loops", get(list_loops))
        .route("/v1/actions/dispatch/cursor", post(dispatch_ack))
        .layer(DefaultBodyLimit::max(BODY_LIMIT))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// One problem with a start payload.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Issue {
    pub path: Vec<Value>,
    pub message: String,
}

impl Issue {
    fn at(path: Vec<Value>, message: impl Into<String>) -> Self {
        Self {
            path,
            message: message.into(),
        }
    }
}

#[derive(Debug)]
pub enum ApiError {
    BadRequest(Vec<Issue>),
    NotFound,
    NotReady,
    PayloadTooLarge,
    Internal(String),
}

impl From<JsonRejection> for ApiError {
    fn from(rejection: JsonRejection) -> Self {
        if rejection.status() == StatusCode::PAYLOAD_TOO_LARGE {
            return Self::PayloadTooLarge;
        }
        Self::BadRequest(vec![Issue::at(vec![], rejection.body_text())])
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        match self {
            Self::BadRequest(details) => (
                StatusCode::BAD_REQUEST,
                Json(json!({ "ok": false, "error": "bad_request", "details": details })),
            )
                .into_response(),
            Self::NotFound => (
                StatusCode::NOT_FOUND,
                Json(json!({ "ok": false, "error": "not_found" })),
            )
                .into_response(),
            Self::NotReady => (
                StatusCode::CONFLICT,
                Json(json!({ "ok": false, "error": "not_ready" })),
            )
                .into_response(),
            Self::PayloadTooLarge => (
                StatusCode::PAYLOAD_TOO_LARGE,
                Json(json!({ "ok": false, "error": "payload_too_large" })),
            )
                .into_response(),
            Self::Internal(message) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({ "ok": false, "error": "loop_start_failed", "message": message })),
            )
                .into_response(),
        }
    }
}

/// Wire shape of a start payload.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct StartBody {
    #[serde(deserialize_with = "non_empty")]
    cycle: String,
    #[serde(deserialize_with = "non_empty")]
    proposal_ref: String,
    #[serde(default)]
    spec_ref: Option<String>,
    #[serde(default)]
    tests_ref: Option<String>,
    #[serde(deserialize_with = "non_empty")]
    goal: String,
    #[serde(deserialize_with = "at_least_one")]
    models: Vec<ModelRef>,
}

#[derive(Debug, Deserialize)]
struct ModelRef {
    id: VoiceId,
}

fn non_empty<'de, D: Deserializer<'de>>(deserializer: D) -> Result<String, D::Error> {
    let value = String::deserialize(deserializer)?;
    if value.trim().is_empty() {
        return Err(de::Error::custom("String must contain at least 1 character(s)"));
    }
    Ok(value)
}

fn at_least_one<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<ModelRef>, D::Error> {
    let models = Vec::<ModelRef>::deserialize(deserializer)?;
    if models.is_empty() {
        return Err(de::Error::custom("Array must contain at least 1 element(s)"));
    }
    Ok(models)
}

impl From<StartBody> for StartRequest {
    fn from(body: StartBody) -> Self {
        Self {
            cycle: body.cycle,
            proposal_ref: body.proposal_ref,
            spec_ref: body.spec_ref,
            tests_ref: body.tests_ref,
            goal: body.goal,
            voices: body.models.into_iter().map(|m| m.id).collect(),
        }
    }
}

fn issue_path(path: &serde_path_to_error::Path) -> Vec<Value> {
    path.iter()
        .filter_map(|segment| match segment {
            Segment::Seq { index } => Some(json!(index)),
            Segment::Map { key } => Some(json!(key)),
            Segment::Enum { variant } => Some(json!(variant)),
            Segment::Unknown => None,
        })
        .collect()
}

/// Check a start payload and turn it into an engine request.
///
/// The issue points at the first offending field.
pub fn parse_start(body: &Value) -> Result<StartRequest, Issue> {
    serde_path_to_error::deserialize::<_, StartBody>(body)
        .map(StartRequest::from)
        .map_err(|err| Issue::at(issue_path(err.path()), err.inner().to_string()))
}

async fn health() -> Json<Value> {
    Json(json!({ "ok": true, "service": SERVICE_NAME, "ts": Utc::now().to_rfc3339() }))
}

async fn start_loop(
    State(manager): State<AppState>,
    payload: Result<Json<Value>, JsonRejection>,
) -> Result<Json<Value>, ApiError> {
    let Json(body) = payload?;
    let request = parse_start(&body).map_err(|issue| ApiError::BadRequest(vec![issue]))?;

    match manager.start(request).await {
        Ok(state) => Ok(Json(json!({
            "ok": true,
            "loopId": state.id,
            "status": state.status,
            "step": state.step,
        }))),
        Err(e) if e.kind() == deliberation::FailureKind::Request => {
            Err(ApiError::BadRequest(vec![Issue::at(vec![], e.to_string())]))
        }
        Err(e) => {
            error!(error = %e, "loop_start_failed");
            Err(ApiError::Internal(e.to_string()))
        }
    }
}

async fn loop_status(
    State(manager): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<Value>, ApiError> {
    let state = manager.get(&id).ok_or(ApiError::NotFound)?;
    Ok(Json(json!({
        "ok": true,
        "status": state.status,
        "step": state.step,
        "score": state.score(),
        "haltReason": state.halt_reason,
    })))
}

async fn loop_consensus(
    State(manager): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<Value>, ApiError> {
    let state = manager.get(&id).ok_or(ApiError::NotFound)?;
    let consensus = state.consensus.as_ref().ok_or(ApiError::NotReady)?;
    Ok(Json(json!({
        "ok": true,
        "consensus": consensus,
        "attestRef": state.attest_ref,
    })))
}

async fn loop_audit(
    State(manager): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<Value>, ApiError> {
    let state = manager.get(&id).ok_or(ApiError::NotFound)?;
    let trail = manager.audit().generate_audit_trail(&state);
    Ok(Json(json!({ "ok": true, "auditTrail": trail })))
}

async fn list_loops(State(manager): State<AppState>) -> Json<Value> {
    Json(json!({ "ok": true, "loops": manager.list() }))
}

async fn dispatch_ack() -> Json<Value> {
    Json(json!({
        "ok": true,
        "note": "dispatch runs automatically inside the loop when allowDispatch=true",
    }))
}
