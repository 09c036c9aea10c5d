//! Router and request handlers.

use axum::{
    Router,
    body::Bytes,
    extract::{Path as AxumPath, Query, State},
    http::{StatusCode, header},
    response::IntoResponse,
    routing::{get, post},
};
use serde::Deserialize;
use serde::de::DeserializeOwned;
use std::time::Duration;
use tower_http::cors::{AllowOrigin, Any, CorsLayer};
use tower_http::timeout::TimeoutLayer;

use super::{ApiError, ApiResult, ApiState, ok, success};
use crate::agents::transcript::load_transcript;
use crate::agents::{AgentSettingsPatch, DEFAULT_AGENT_ID};
use crate::commands::issues::{self, CreateIssueRequest, IssueList, UpdateIssueRequest};
use crate::processor::ProcessorPatch;
use crate::storage::artifacts::content_type_for_extension;

/// Deadline for every request except the event stream.
pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Build the full router: the JSON API under `/api/v1`, `/health` and `/ws`.
pub fn router(state: ApiState) -> Router {
    let cors = cors_layer(&state.allowed_origins);

    let api = Router::new()
        .route("/health", get(health))
        .route("/api/v1/issues", get(list_issues).post(create_issue))
        .route(
            "/api/v1/issues/:id",
            get(get_issue)
                .put(update_issue)
                .patch(update_issue)
                .delete(delete_issue),
        )
        .route("/api/v1/issues/:id/attachments/*path", get(get_attachment))
        .route("/api/v1/issues/:id/investigate", post(investigate_issue))
        .route("/api/v1/issues/:id/stop", post(stop_issue))
        .route("/api/v1/agents/running", get(running_agents))
        .route("/api/v1/agent/settings", get(get_settings).put(update_settings))
        .route("/api/v1/processor", get(get_processor).put(update_processor))
        .route("/api/v1/processor/reset-counter", post(reset_counter))
        .route("/api/v1/rate-limit-status", get(rate_limit_status))
        .route("/api/v1/transcripts", get(get_transcript))
        .route("/api/v1/stats", get(stats))
        .layer(TimeoutLayer::new(REQUEST_TIMEOUT));

    Router::new()
        .merge(api)
        .route("/ws", get(super::websocket::ws_handler))
        .layer(cors)
        .with_state(state)
}

fn cors_layer(allowed_origins: &[String]) -> CorsLayer {
    if allowed_origins.is_empty() {
        return CorsLayer::permissive();
    }
    let origins: Vec<header::HeaderValue> = allowed_origins
        .iter()
        .filter_map(|o| header::HeaderValue::from_str(o).ok())
        .collect();
    CorsLayer::new()
        .allow_origin(AllowOrigin::list(origins))
        .allow_methods(Any)
        .allow_headers(Any)
}

fn parse_body<T: DeserializeOwned>(body: &Bytes) -> Result<T, ApiError> {
    serde_json::from_slice(body).map_err(|e| ApiError::bad_request(format!("Invalid JSON body: {}", e)))
}

/// Like [`parse_body`], but an empty body yields the default value.
fn parse_optional_body<T: DeserializeOwned + Default>(body: &Bytes) -> Result<T, ApiError> {
    if body.iter().all(u8::is_ascii_whitespace) {
        return Ok(T::default());
    }
    parse_body(body)
}

/// Liveness and a few live counters.
async fn health(State(state): State<ApiState>) -> ApiResult {
    ok(serde_json::json!({
        "status": "healthy",
        "service": env!("CARGO_PKG_NAME"),
        "version": env!("CARGO_PKG_VERSION"),
        "build_timestamp": env!("ISSUE_TRACKER_BUILD_TIMESTAMP"),
        "git_commit": env!("ISSUE_TRACKER_GIT_COMMIT"),
        "timestamp": chrono::Utc::now(),
        "subscribers": state.lifecycle.hub().subscriber_count(),
        "running_agents": state.lifecycle.registry().len(),
        "processor_active": state.control.snapshot().active,
    }))
}

#[derive(Debug, Deserialize)]
struct ListQuery {
    status: Option<String>,
    limit: Option<usize>,
}

async fn list_issues(
    State(state): State<ApiState>,
    query: Result<Query<ListQuery>, axum::extract::rejection::QueryRejection>,
) -> ApiResult {
    let Query(query) = query.map_err(|e| ApiError::bad_request(e.body_text()))?;
    let found = issues::list(state.lifecycle.store(), query.status.as_deref(), query.limit)?;
    ok(IssueList::new(found))
}

async fn create_issue(State(state): State<ApiState>, body: Bytes) -> ApiResult {
    let request: CreateIssueRequest = parse_body(&body)?;
    let issue = issues::create(&state.lifecycle, &request)?;
    success(StatusCode::CREATED, Some("Issue created"), issue)
}

async fn get_issue(State(state): State<ApiState>, AxumPath(id): AxumPath<String>) -> ApiResult {
    let (issue, _) = state.lifecycle.store().load(&id)?;
    ok(issue)
}

async fn update_issue(
    State(state): State<ApiState>,
    AxumPath(id): AxumPath<String>,
    body: Bytes,
) -> ApiResult {
    let request: UpdateIssueRequest = parse_body(&body)?;
    let issue = issues::update(&state.lifecycle, &id, &request)?;
    success(StatusCode::OK, Some("Issue updated"), issue)
}

async fn delete_issue(State(state): State<ApiState>, AxumPath(id): AxumPath<String>) -> ApiResult {
    let issue = issues::delete(&state.lifecycle, &id)?;
    success(
        StatusCode::OK,
        Some("Issue deleted"),
        serde_json::json!({ "id": issue.id, "status": issue.status }),
    )
}

async fn get_attachment(
    State(state): State<ApiState>,
    AxumPath((id, path)): AxumPath<(String, String)>,
) -> ApiResult {
    let store = state.lifecycle.store();
    let file = store.attachment_path(&id, &path)?;
    let (issue, _) = store.load(&id)?;

    let bytes = match std::fs::read(&file) {
        Ok(bytes) => bytes,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            return Err(ApiError::new(
                StatusCode::NOT_FOUND,
                format!("Attachment not found: {}", path),
            ));
        }
        Err(e) => return Err(crate::Error::from(e).into()),
    };

    let content_type = issue
        .attachments
        .iter()
        .find(|a| a.path.trim_start_matches("./") == path.trim_start_matches('/'))
        .map(|a| a.content_type.clone())
        .filter(|t| !t.is_empty())
        .or_else(|| content_type_for_extension(&path).map(String::from))
        .unwrap_or_else(|| "application/octet-stream".to_string());

    Ok(([(header::CONTENT_TYPE, content_type)], bytes).into_response())
}

#[derive(Debug, Deserialize)]
#[serde(default)]
struct InvestigateRequest {
    agent_id: Option<String>,
    auto_resolve: bool,
}

impl Default for InvestigateRequest {
    fn default() -> Self {
        Self {
            agent_id: None,
            auto_resolve: true,
        }
    }
}

/// Register a run and return at once; the outcome arrives as events.
async fn investigate_issue(
    State(state): State<ApiState>,
    AxumPath(id): AxumPath<String>,
    body: Bytes,
) -> ApiResult {
    let request: InvestigateRequest = parse_optional_body(&body)?;
    let agent_id = request.agent_id.as_deref().unwrap_or(DEFAULT_AGENT_ID);
    let ticket = state
        .investigator
        .start(&id, Some(agent_id), request.auto_resolve)?;
    success(StatusCode::ACCEPTED, Some("Investigation started"), ticket)
}

async fn stop_issue(State(state): State<ApiState>, AxumPath(id): AxumPath<String>) -> ApiResult {
    state.investigator.stop(&id)?;
    success(
        StatusCode::OK,
        Some("Agent stop requested"),
        serde_json::json!({ "issue_id": id }),
    )
}

async fn running_agents(State(state): State<ApiState>) -> ApiResult {
    let running = state.lifecycle.registry().list();
    ok(serde_json::json!({ "count": running.len(), "agents": running }))
}

async fn get_settings(State(state): State<ApiState>) -> ApiResult {
    ok(state.settings.get().as_ref())
}

async fn update_settings(State(state): State<ApiState>, body: Bytes) -> ApiResult {
    let patch: AgentSettingsPatch = parse_body(&body)?;
    let settings = state.settings.update(&patch)?;
    success(StatusCode::OK, Some("Agent settings updated"), settings.as_ref())
}

async fn get_processor(State(state): State<ApiState>) -> ApiResult {
    ok(state.control.snapshot())
}

async fn update_processor(State(state): State<ApiState>, body: Bytes) -> ApiResult {
    let patch: ProcessorPatch = parse_body(&body)?;
    let snapshot = state.control.update(&patch)?;
    success(StatusCode::OK, Some("Processor updated"), snapshot)
}

async fn reset_counter(State(state): State<ApiState>) -> ApiResult {
    success(StatusCode::OK, Some("Counter reset"), state.control.reset_counter())
}

async fn rate_limit_status(State(state): State<ApiState>) -> ApiResult {
    ok(state.rate_limits.status()?)
}

#[derive(Debug, Deserialize)]
struct TranscriptQuery {
    path: Option<String>,
    max: Option<usize>,
}

async fn get_transcript(
    State(state): State<ApiState>,
    query: Result<Query<TranscriptQuery>, axum::extract::rejection::QueryRejection>,
) -> ApiResult {
    let Query(query) = query.map_err(|e| ApiError::bad_request(e.body_text()))?;
    let path = query
        .path
        .filter(|p| !p.trim().is_empty())
        .ok_or_else(|| ApiError::bad_request("path query parameter is required"))?;
    let transcript = load_transcript(&state.scenario_root, &path, query.max)?;
    ok(transcript)
}

async fn stats(State(state): State<ApiState>) -> ApiResult {
    let counts = state.lifecycle.store().stats()?;
    let total: usize = counts.values().sum();
    ok(serde_json::json!({ "total": total, "by_status": counts }))
}
