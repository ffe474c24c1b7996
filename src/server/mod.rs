//! HTTP/JSON API and SSE stream over the store and event hub.

mod sse;

use std::net::SocketAddr;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;

use anyhow::{Context, Result};
use axum::extract::{Path, Query, Request, State};
use axum::http::{header, StatusCode};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, patch, post};
use axum::{Json, Router};
use serde::Deserialize;
use tokio::sync::watch;
use tower_http::cors::CorsLayer;

use crate::events::{ControlEvent, EventHub};
use crate::store::{
    ApprovalMode, ReviewOutcome, StageType, StoreHandle, TaskStatus, WorkflowStage,
    WorkflowTransition,
};
use crate::{gitops, memory, review};

// ── Shared application state ──────────────────────────────────────────

pub struct AppState {
    pub store: StoreHandle,
    pub hub: Arc<EventHub>,
    pub home: PathBuf,
    pub api_key: Option<String>,
    /// Dev mode relaxes CORS for a local UI dev server.
    pub dev: bool,
}

pub type SharedState = Arc<AppState>;

// ── Error handling ────────────────────────────────────────────────────

pub enum ApiError {
    NotFound(String),
    BadRequest(String),
    Internal(String),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            ApiError::NotFound(msg) => (StatusCode::NOT_FOUND, msg),
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg),
            ApiError::Internal(msg) => (StatusCode::INTERNAL_SERVER_ERROR, msg),
        };
        (status, Json(serde_json::json!({"error": message}))).into_response()
    }
}

impl From<anyhow::Error> for ApiError {
    fn from(err: anyhow::Error) -> Self {
        let msg = err.to_string();
        if msg.contains("not found") {
            ApiError::NotFound(msg)
        } else {
            ApiError::Internal(msg)
        }
    }
}

// ── Request payload types ─────────────────────────────────────────────

#[derive(Deserialize)]
struct CreateTeamRequest {
    name: String,
}

#[derive(Deserialize)]
struct CreateAgentRequest {
    name: String,
    #[serde(default)]
    role: String,
}

#[derive(Deserialize)]
struct CreateTaskRequest {
    title: String,
    #[serde(default)]
    status: Option<String>,
}

#[derive(Deserialize)]
struct UpdateTaskRequest {
    status: Option<String>,
    assignee: Option<String>,
}

#[derive(Deserialize)]
struct CommentRequest {
    author: String,
    body: String,
}

#[derive(Deserialize)]
struct AttachmentRequest {
    file_path: String,
}

#[derive(Deserialize)]
struct AttachmentQuery {
    file_path: Option<String>,
}

#[derive(Deserialize)]
struct DependencyRequest {
    depends_on_task_id: i64,
}

#[derive(Deserialize)]
struct ApproveRequest {
    #[serde(default)]
    outcome: Option<String>,
}

#[derive(Deserialize)]
struct SubmitReviewRequest {
    #[serde(default)]
    reviewer_agent: String,
    outcome: String,
    #[serde(default)]
    comments: String,
}

#[derive(Deserialize)]
struct CreateRepoRequest {
    name: String,
    source: String,
    #[serde(default)]
    approval: Option<String>,
    #[serde(default)]
    test_cmd: Option<String>,
}

#[derive(Deserialize)]
struct RepoApprovalRequest {
    approval: String,
}

#[derive(Deserialize)]
struct StagePayload {
    name: String,
    #[serde(rename = "type")]
    stage_type: String,
    #[serde(default)]
    outcomes: String,
    #[serde(default)]
    candidate_agents: String,
}

#[derive(Deserialize)]
struct TransitionPayload {
    from: String,
    outcome: String,
    to: String,
}

#[derive(Deserialize)]
struct CreateWorkflowRequest {
    name: String,
    #[serde(default)]
    version: Option<i64>,
    #[serde(default)]
    source_path: Option<String>,
    #[serde(default)]
    stages: Vec<StagePayload>,
    #[serde(default)]
    transitions: Vec<TransitionPayload>,
}

#[derive(Deserialize)]
struct CreateMessageRequest {
    sender: String,
    recipient: String,
    content: String,
}

#[derive(Deserialize)]
struct DomainRequest {
    domain: String,
}

#[derive(Deserialize)]
struct ListQuery {
    #[serde(default)]
    limit: Option<i64>,
    #[serde(default)]
    recipient: Option<String>,
}

// ── Router ────────────────────────────────────────────────────────────

pub fn build_router(state: SharedState) -> Router {
    let mut router = Router::new()
        .route("/health", get(|| async { "ok" }))
        .route("/version", get(version))
        .route("/bootstrap", get(bootstrap))
        .route("/stream", get(sse::stream))
        .route("/teams", get(list_teams).post(create_team))
        .route("/teams/:team", axum::routing::delete(delete_team))
        .route("/teams/:team/agents", get(list_agents).post(create_agent))
        .route("/teams/:team/tasks", get(list_tasks).post(create_task))
        .route("/teams/:team/tasks/:id", get(get_task).patch(patch_task))
        .route(
            "/teams/:team/tasks/:id/comments",
            get(list_comments).post(create_comment),
        )
        .route(
            "/teams/:team/tasks/:id/attachments",
            get(list_attachments)
                .post(add_attachment)
                .delete(remove_attachment),
        )
        .route(
            "/teams/:team/tasks/:id/dependencies",
            get(list_dependencies).post(add_dependency),
        )
        .route("/teams/:team/tasks/:id/diff", get(task_diff))
        .route("/teams/:team/tasks/:id/reviews", get(list_reviews))
        .route("/teams/:team/tasks/:id/submit-review", post(submit_review))
        .route("/teams/:team/tasks/:id/request-review", post(request_review))
        .route("/teams/:team/tasks/:id/approve", post(approve))
        .route("/teams/:team/charter", get(get_charter).put(put_charter))
        .route("/teams/:team/repos", get(list_repos).post(create_repo))
        .route("/teams/:team/repos/:repo", patch(set_repo_approval))
        .route(
            "/teams/:team/workflows",
            get(list_workflows).post(create_workflow),
        )
        .route("/teams/:team/workflows/init", post(init_default_workflow))
        .route(
            "/teams/:team/messages",
            get(list_messages).post(create_message),
        )
        .route("/network", get(list_allowlist))
        .route("/network/allow", post(allow_domain))
        .route("/network/disallow", post(disallow_domain))
        .route("/network/reset", post(reset_allowlist))
        .layer(middleware::from_fn_with_state(
            state.clone(),
            require_api_key,
        ));
    if state.dev {
        router = router.layer(CorsLayer::permissive());
    }
    router.with_state(state)
}

/// Bind and serve until shutdown; failure to bind is a fatal startup error.
pub async fn serve(
    state: SharedState,
    addr: SocketAddr,
    mut shutdown: watch::Receiver<bool>,
) -> Result<()> {
    let router = build_router(state);
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind {}", addr))?;
    axum::serve(listener, router)
        .with_graceful_shutdown(async move {
            let _ = shutdown.changed().await;
        })
        .await
        .context("http server error")
}

async fn require_api_key(
    State(state): State<SharedState>,
    req: Request,
    next: Next,
) -> Response {
    if let Some(key) = &state.api_key {
        let expected = format!("Bearer {}", key);
        let presented = req
            .headers()
            .get(header::AUTHORIZATION)
            .and_then(|v| v.to_str().ok());
        if presented != Some(expected.as_str()) {
            return (
                StatusCode::UNAUTHORIZED,
                Json(serde_json::json!({"error": "unauthorized"})),
            )
                .into_response();
        }
    }
    next.run(req).await
}

// ── Meta ──────────────────────────────────────────────────────────────

async fn version() -> Json<serde_json::Value> {
    Json(serde_json::json!({"version": env!("CARGO_PKG_VERSION")}))
}

/// Single-request aggregate for UI startup: config, teams, the first team's
/// state, and the allowlist.
async fn bootstrap(State(state): State<SharedState>) -> Result<Json<serde_json::Value>, ApiError> {
    let teams = state.store.call(|s| s.list_teams()).await?;
    let allowlist = state.store.call(|s| s.list_allowed_domains()).await?;
    let team_state = match teams.first() {
        Some(team) => {
            let name = team.name.clone();
            let detail = state
                .store
                .call(move |s| {
                    Ok(serde_json::json!({
                        "team": s.get_team(&name)?,
                        "agents": s.list_agents(&name)?,
                        "tasks": s.list_tasks(&name, 100)?,
                        "workflows": s.list_workflows(&name)?,
                        "repos": s.list_repos(&name)?,
                    }))
                })
                .await?;
            Some(detail)
        }
        None => None,
    };
    Ok(Json(serde_json::json!({
        "config": {
            "version": env!("CARGO_PKG_VERSION"),
            "home": state.home.display().to_string(),
        },
        "teams": teams,
        "team": team_state,
        "allowlist": allowlist,
    })))
}

// ── Teams ─────────────────────────────────────────────────────────────

async fn list_teams(State(state): State<SharedState>) -> Result<Json<serde_json::Value>, ApiError> {
    let teams = state.store.call(|s| s.list_teams()).await?;
    Ok(Json(serde_json::json!(teams)))
}

async fn create_team(
    State(state): State<SharedState>,
    Json(body): Json<CreateTeamRequest>,
) -> Result<Json<serde_json::Value>, ApiError> {
    if body.name.is_empty() {
        return Err(ApiError::BadRequest("name required".into()));
    }
    let name = body.name.clone();
    let team = state
        .store
        .call(move |s| s.create_team(&name))
        .await
        .map_err(|e| ApiError::BadRequest(e.to_string()))?;
    let _ = memory::ensure_team_dirs(&memory::team_dir(&state.home, &body.name));
    state.hub.publish_json(&ControlEvent::TeamUpdate {
        team: Some(body.name),
    });
    Ok(Json(serde_json::json!(team)))
}

async fn delete_team(
    State(state): State<SharedState>,
    Path(team): Path<String>,
) -> Result<Json<serde_json::Value>, ApiError> {
    {
        let team = team.clone();
        state.store.call(move |s| s.delete_team(&team)).await?;
    }
    state
        .hub
        .publish_json(&ControlEvent::TeamUpdate { team: Some(team) });
    Ok(Json(serde_json::json!({"ok": true})))
}

// ── Agents ────────────────────────────────────────────────────────────

async fn list_agents(
    State(state): State<SharedState>,
    Path(team): Path<String>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let agents = state.store.call(move |s| s.list_agents(&team)).await?;
    Ok(Json(serde_json::json!(agents)))
}

async fn create_agent(
    State(state): State<SharedState>,
    Path(team): Path<String>,
    Json(body): Json<CreateAgentRequest>,
) -> Result<Json<serde_json::Value>, ApiError> {
    if body.name.is_empty() {
        return Err(ApiError::BadRequest("name required".into()));
    }
    {
        let (team, name, role) = (team.clone(), body.name.clone(), body.role.clone());
        state
            .store
            .call(move |s| s.create_agent(&team, &name, &role))
            .await
            .map_err(|e| ApiError::BadRequest(e.to_string()))?;
    }
    let _ = memory::ensure_agent_dir(&memory::team_dir(&state.home, &team), &body.name);
    state
        .hub
        .publish_json(&ControlEvent::TeamUpdate { team: Some(team) });
    Ok(Json(serde_json::json!({"ok": true})))
}

// ── Tasks ─────────────────────────────────────────────────────────────

async fn list_tasks(
    State(state): State<SharedState>,
    Path(team): Path<String>,
    Query(query): Query<ListQuery>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let limit = query.limit.unwrap_or(100);
    let tasks = state.store.call(move |s| s.list_tasks(&team, limit)).await?;
    Ok(Json(serde_json::json!(tasks)))
}

async fn create_task(
    State(state): State<SharedState>,
    Path(team): Path<String>,
    Json(body): Json<CreateTaskRequest>,
) -> Result<Json<serde_json::Value>, ApiError> {
    if body.title.is_empty() {
        return Err(ApiError::BadRequest("title required".into()));
    }
    let status = match body.status.as_deref() {
        None | Some("") => TaskStatus::Todo,
        Some(s) => TaskStatus::from_str(s).map_err(ApiError::BadRequest)?,
    };
    let id = {
        let team = team.clone();
        state
            .store
            .call(move |s| {
                // New tasks ride the team's default workflow when one exists.
                let wf = s.workflow_id_by_name(&team, "default", 1)?;
                s.create_task(&team, &body.title, status, wf.as_deref())
            })
            .await
            .map_err(|e| ApiError::BadRequest(e.to_string()))?
    };
    state
        .hub
        .publish_json(&ControlEvent::task_update(&team, id).with_status(status.as_str()));
    Ok(Json(serde_json::json!({"task_id": id})))
}

async fn get_task(
    State(state): State<SharedState>,
    Path((team, id)): Path<(String, i64)>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let task = state
        .store
        .call(move |s| s.get_task(&team, id))
        .await?
        .ok_or_else(|| ApiError::NotFound("task not found".into()))?;
    Ok(Json(serde_json::json!(task)))
}

async fn patch_task(
    State(state): State<SharedState>,
    Path((team, id)): Path<(String, i64)>,
    Json(body): Json<UpdateTaskRequest>,
) -> Result<Json<serde_json::Value>, ApiError> {
    {
        let team = team.clone();
        state
            .store
            .call(move |s| s.get_task(&team, id))
            .await?
            .ok_or_else(|| ApiError::NotFound("task not found".into()))?;
    }
    match (&body.status, &body.assignee) {
        (Some(status), assignee) => {
            let status = TaskStatus::from_str(status).map_err(|_| {
                ApiError::BadRequest(
                    "status must be todo, in_progress, in_review, in_approval, merging, done, failed, or cancelled"
                        .into(),
                )
            })?;
            let assignee = assignee.clone();
            state
                .store
                .call(move |s| s.set_task_status(id, status, assignee.as_deref()))
                .await?;
        }
        (None, Some(assignee)) => {
            let assignee = assignee.clone();
            state
                .store
                .call(move |s| s.assign_task(id, Some(&assignee)))
                .await?;
        }
        (None, None) => {
            return Err(ApiError::BadRequest("status or assignee required".into()));
        }
    }
    let updated = {
        let team = team.clone();
        state.store.call(move |s| s.get_task(&team, id)).await?
    };
    if let Some(task) = &updated {
        let mut event =
            ControlEvent::task_update(&team, id).with_status(task.status.as_str());
        if let Some(a) = &task.assignee {
            event = event.with_assignee(a);
        }
        state.hub.publish_json(&event);
    }
    Ok(Json(serde_json::json!(updated)))
}

// ── Task sub-resources ────────────────────────────────────────────────

async fn list_comments(
    State(state): State<SharedState>,
    Path((team, id)): Path<(String, i64)>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let comments = state
        .store
        .call(move |s| s.list_task_comments(&team, id))
        .await?;
    Ok(Json(serde_json::json!(comments)))
}

async fn create_comment(
    State(state): State<SharedState>,
    Path((team, id)): Path<(String, i64)>,
    Json(body): Json<CommentRequest>,
) -> Result<Json<serde_json::Value>, ApiError> {
    if body.body.is_empty() {
        return Err(ApiError::BadRequest("body required".into()));
    }
    let comment_id = state
        .store
        .call(move |s| s.create_task_comment(&team, id, &body.author, &body.body))
        .await?;
    Ok(Json(serde_json::json!({"comment_id": comment_id})))
}

async fn list_attachments(
    State(state): State<SharedState>,
    Path((team, id)): Path<(String, i64)>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let attachments = state
        .store
        .call(move |s| s.list_task_attachments(&team, id))
        .await?;
    Ok(Json(serde_json::json!(attachments)))
}

async fn add_attachment(
    State(state): State<SharedState>,
    Path((team, id)): Path<(String, i64)>,
    Json(body): Json<AttachmentRequest>,
) -> Result<Json<serde_json::Value>, ApiError> {
    if body.file_path.is_empty() {
        return Err(ApiError::BadRequest("file_path required".into()));
    }
    state
        .store
        .call(move |s| s.add_task_attachment(&team, id, &body.file_path))
        .await?;
    Ok(Json(serde_json::json!({"ok": true})))
}

async fn remove_attachment(
    State(state): State<SharedState>,
    Path((team, id)): Path<(String, i64)>,
    Query(query): Query<AttachmentQuery>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let file_path = query
        .file_path
        .filter(|p| !p.is_empty())
        .ok_or_else(|| ApiError::BadRequest("file_path query required".into()))?;
    state
        .store
        .call(move |s| s.remove_task_attachment(&team, id, &file_path))
        .await?;
    Ok(Json(serde_json::json!({"ok": true})))
}

async fn list_dependencies(
    State(state): State<SharedState>,
    Path((team, id)): Path<(String, i64)>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let deps = state
        .store
        .call(move |s| s.list_task_dependencies(&team, id))
        .await?;
    Ok(Json(serde_json::json!({"depends_on": deps})))
}

async fn add_dependency(
    State(state): State<SharedState>,
    Path((team, id)): Path<(String, i64)>,
    Json(body): Json<DependencyRequest>,
) -> Result<Json<serde_json::Value>, ApiError> {
    if body.depends_on_task_id <= 0 {
        return Err(ApiError::BadRequest("depends_on_task_id required".into()));
    }
    state
        .store
        .call(move |s| s.add_task_dependency(&team, id, body.depends_on_task_id))
        .await
        .map_err(|e| ApiError::BadRequest(e.to_string()))?;
    Ok(Json(serde_json::json!({"ok": true})))
}

async fn task_diff(
    State(state): State<SharedState>,
    Path((team, id)): Path<(String, i64)>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let task = state
        .store
        .call(move |s| s.get_task(&team, id))
        .await?
        .ok_or_else(|| ApiError::NotFound("task not found".into()))?;
    let worktree = task.worktree_path.clone().unwrap_or_default();
    let base = task.base_sha.clone().unwrap_or_default();
    let head = task.branch_name.clone().unwrap_or_default();
    let diff = gitops::diff(std::path::Path::new(&worktree), &base, &head)
        .await
        .map_err(|e| ApiError::Internal(e.to_string()))?;
    Ok(Json(serde_json::json!({"diff": diff})))
}

// ── Reviews ───────────────────────────────────────────────────────────

async fn list_reviews(
    State(state): State<SharedState>,
    Path((team, id)): Path<(String, i64)>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let reviews = state
        .store
        .call(move |s| s.list_task_reviews(&team, id))
        .await?;
    Ok(Json(serde_json::json!({"reviews": reviews})))
}

async fn submit_review(
    State(state): State<SharedState>,
    Path((team, id)): Path<(String, i64)>,
    Json(body): Json<SubmitReviewRequest>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let outcome = ReviewOutcome::from_str(&body.outcome).map_err(|_| {
        ApiError::BadRequest("outcome required (e.g. approved, changes_requested)".into())
    })?;
    review::submit_review(
        &state.store,
        &team,
        id,
        &body.reviewer_agent,
        outcome,
        &body.comments,
    )
    .await
    .map_err(|e| ApiError::BadRequest(e.to_string()))?;

    let updated = {
        let team = team.clone();
        state.store.call(move |s| s.get_task(&team, id)).await?
    };
    if let Some(task) = &updated {
        let mut event = ControlEvent::task_update(&team, id).with_status(task.status.as_str());
        if let Some(stage) = &task.current_stage {
            event = event.with_stage(stage);
        }
        state.hub.publish_json(&event);
    }
    Ok(Json(serde_json::json!({"ok": true})))
}

/// Follow the current stage's `submit_for_review` transition and, when the
/// new stage is the review stage, assign a reviewer other than the DRI.
async fn request_review(
    State(state): State<SharedState>,
    Path((team, id)): Path<(String, i64)>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let task = {
        let team = team.clone();
        state
            .store
            .call(move |s| s.get_task(&team, id))
            .await?
            .ok_or_else(|| ApiError::NotFound("task not found".into()))?
    };
    let wf_id = task
        .workflow_id
        .clone()
        .filter(|w| !w.is_empty())
        .ok_or_else(|| ApiError::BadRequest("task has no workflow".into()))?;
    let current = task.current_stage.clone().unwrap_or_default();

    let next = {
        let (wf, from) = (wf_id.clone(), current.clone());
        state
            .store
            .call(move |s| {
                Ok(s.get_workflow_transitions(&wf)?
                    .into_iter()
                    .find(|t| t.from_stage == from && t.outcome == "submit_for_review")
                    .map(|t| t.to_stage))
            })
            .await?
            .ok_or_else(|| {
                ApiError::BadRequest("no submit_for_review transition from current stage".into())
            })?
    };
    {
        let (wf, stage) = (wf_id.clone(), next.clone());
        state
            .store
            .call(move |s| s.set_task_workflow_and_stage(id, &wf, &stage))
            .await?;
    }

    let mut assignee = task.assignee.clone();
    if next == review::IN_REVIEW_STAGE {
        let (agents, updated) = {
            let team = team.clone();
            state
                .store
                .call(move |s| Ok((s.list_agents(&team)?, s.get_task(&team, id)?)))
                .await?
        };
        if let (Some(updated), false) = (updated, agents.is_empty()) {
            if let Some(reviewer) = review::pick_reviewer(&state.store, &updated, &agents).await {
                let who = reviewer.clone();
                state
                    .store
                    .call(move |s| s.assign_task(id, Some(&who)))
                    .await?;
                assignee = Some(reviewer);
            }
        }
    }

    let mut event = ControlEvent::task_update(&team, id).with_stage(&next);
    if let Some(a) = &assignee {
        event = event.with_assignee(a);
    }
    state.hub.publish_json(&event);
    Ok(Json(serde_json::json!({"ok": true, "current_stage": next})))
}

/// Advance a human (or review) stage with an explicit outcome; defaults to
/// "approved" when the body omits one.
async fn approve(
    State(state): State<SharedState>,
    Path((team, id)): Path<(String, i64)>,
    Json(body): Json<ApproveRequest>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let outcome = body.outcome.filter(|o| !o.is_empty()).unwrap_or_else(|| "approved".to_string());
    let task = {
        let team = team.clone();
        state
            .store
            .call(move |s| s.get_task(&team, id))
            .await?
            .ok_or_else(|| ApiError::NotFound("task not found".into()))?
    };
    let (Some(wf_id), Some(current)) = (
        task.workflow_id.clone().filter(|w| !w.is_empty()),
        task.current_stage.clone(),
    ) else {
        return Err(ApiError::BadRequest(
            "task has no workflow or current stage".into(),
        ));
    };

    let next = {
        let (wf, from, out) = (wf_id.clone(), current.clone(), outcome.clone());
        state
            .store
            .call(move |s| {
                Ok(s.get_workflow_transitions(&wf)?
                    .into_iter()
                    .find(|t| t.from_stage == from && t.outcome == out)
                    .map(|t| t.to_stage))
            })
            .await?
            .ok_or_else(|| {
                ApiError::BadRequest(format!(
                    "no transition for stage {} with outcome {}",
                    current, outcome
                ))
            })?
    };
    {
        let stage = next.clone();
        state
            .store
            .call(move |s| s.update_task_stage(id, &stage))
            .await?;
    }
    let terminal = {
        let (wf, stage) = (wf_id, next.clone());
        state
            .store
            .call(move |s| {
                Ok(s.get_workflow_stages(&wf)?
                    .iter()
                    .any(|st| st.stage_name == stage && st.stage_type == StageType::Terminal))
            })
            .await?
    };
    if terminal {
        state
            .store
            .call(move |s| s.set_task_status(id, TaskStatus::Done, None))
            .await?;
    }
    state
        .hub
        .publish_json(&ControlEvent::task_update(&team, id).with_stage(&next));
    Ok(Json(serde_json::json!({"ok": true, "current_stage": next})))
}

// ── Charter ───────────────────────────────────────────────────────────

#[derive(Deserialize)]
struct CharterRequest {
    content: String,
}

async fn get_charter(
    State(state): State<SharedState>,
    Path(team): Path<String>,
) -> Result<Json<serde_json::Value>, ApiError> {
    {
        let team = team.clone();
        state.store.call(move |s| s.get_team(&team)).await?;
    }
    let content = memory::read_charter(&memory::team_dir(&state.home, &team))
        .map_err(|e| ApiError::Internal(e.to_string()))?;
    Ok(Json(serde_json::json!({"content": content})))
}

async fn put_charter(
    State(state): State<SharedState>,
    Path(team): Path<String>,
    Json(body): Json<CharterRequest>,
) -> Result<Json<serde_json::Value>, ApiError> {
    {
        let team = team.clone();
        state.store.call(move |s| s.get_team(&team)).await?;
    }
    memory::write_charter(&memory::team_dir(&state.home, &team), &body.content)
        .map_err(|e| ApiError::Internal(e.to_string()))?;
    state
        .hub
        .publish_json(&ControlEvent::TeamUpdate { team: Some(team) });
    Ok(Json(serde_json::json!({"ok": true})))
}

// ── Repos ─────────────────────────────────────────────────────────────

async fn list_repos(
    State(state): State<SharedState>,
    Path(team): Path<String>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let repos = state.store.call(move |s| s.list_repos(&team)).await?;
    Ok(Json(serde_json::json!(repos)))
}

async fn create_repo(
    State(state): State<SharedState>,
    Path(team): Path<String>,
    Json(body): Json<CreateRepoRequest>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let approval = match body.approval.as_deref() {
        None | Some("") => ApprovalMode::Manual,
        Some(s) => ApprovalMode::from_str(s).map_err(ApiError::BadRequest)?,
    };
    state
        .store
        .call(move |s| {
            s.create_repo(
                &team,
                &body.name,
                &body.source,
                approval,
                body.test_cmd.as_deref(),
            )
        })
        .await
        .map_err(|e| ApiError::BadRequest(e.to_string()))?;
    Ok(Json(serde_json::json!({"ok": true})))
}

async fn set_repo_approval(
    State(state): State<SharedState>,
    Path((team, repo)): Path<(String, String)>,
    Json(body): Json<RepoApprovalRequest>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let approval = ApprovalMode::from_str(&body.approval).map_err(ApiError::BadRequest)?;
    state
        .store
        .call(move |s| s.set_repo_approval(&team, &repo, approval))
        .await
        .map_err(|e| ApiError::BadRequest(e.to_string()))?;
    Ok(Json(serde_json::json!({"ok": true})))
}

// ── Workflows ─────────────────────────────────────────────────────────

async fn list_workflows(
    State(state): State<SharedState>,
    Path(team): Path<String>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let workflows = state.store.call(move |s| s.list_workflows(&team)).await?;
    Ok(Json(serde_json::json!(workflows)))
}

async fn create_workflow(
    State(state): State<SharedState>,
    Path(team): Path<String>,
    Json(body): Json<CreateWorkflowRequest>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let version = body.version.unwrap_or(1);
    let source_path = body.source_path.unwrap_or_default();
    let stages: Vec<WorkflowStage> = body
        .stages
        .iter()
        .map(|p| {
            Ok(WorkflowStage {
                workflow_id: String::new(),
                stage_name: p.name.clone(),
                stage_type: StageType::from_str(&p.stage_type).map_err(ApiError::BadRequest)?,
                outcomes: p.outcomes.clone(),
                candidate_agents: p.candidate_agents.clone(),
            })
        })
        .collect::<Result<_, ApiError>>()?;
    let transitions: Vec<WorkflowTransition> = body
        .transitions
        .iter()
        .map(|p| WorkflowTransition {
            workflow_id: String::new(),
            from_stage: p.from.clone(),
            outcome: p.outcome.clone(),
            to_stage: p.to.clone(),
        })
        .collect();

    let wf_id = {
        let team = team.clone();
        let name = body.name.clone();
        state
            .store
            .call(move |s| {
                if stages.is_empty() {
                    s.create_workflow(&team, &name, version, &source_path)
                } else {
                    s.create_workflow_with_stages(
                        &team,
                        &name,
                        version,
                        &source_path,
                        &stages,
                        &transitions,
                    )
                }
            })
            .await
            .map_err(|e| ApiError::BadRequest(e.to_string()))?
    };
    state.hub.publish_json(&serde_json::json!({
        "type": "workflow_update", "team": team, "workflow": body.name,
    }));
    Ok(Json(serde_json::json!({"workflow_id": wf_id})))
}

/// Idempotent default-workflow seed: returns the existing id when the
/// default v1 is already present.
async fn init_default_workflow(
    State(state): State<SharedState>,
    Path(team): Path<String>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let wf_id = {
        let team = team.clone();
        state
            .store
            .call(move |s| {
                if let Some(existing) = s.workflow_id_by_name(&team, "default", 1)? {
                    return Ok(existing);
                }
                s.create_workflow(&team, "default", 1, "builtin:default")
            })
            .await?
    };
    state.hub.publish_json(&serde_json::json!({
        "type": "workflow_update", "team": team, "workflow": "default",
    }));
    Ok(Json(serde_json::json!({"workflow_id": wf_id})))
}

// ── Messages ──────────────────────────────────────────────────────────

async fn list_messages(
    State(state): State<SharedState>,
    Path(team): Path<String>,
    Query(query): Query<ListQuery>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let recipient = query.recipient.unwrap_or_default();
    let limit = query.limit.unwrap_or(100);
    let messages = state
        .store
        .call(move |s| s.list_messages(&team, &recipient, limit))
        .await?;
    Ok(Json(serde_json::json!(messages)))
}

async fn create_message(
    State(state): State<SharedState>,
    Path(team): Path<String>,
    Json(body): Json<CreateMessageRequest>,
) -> Result<Json<serde_json::Value>, ApiError> {
    if body.content.is_empty() {
        return Err(ApiError::BadRequest("content required".into()));
    }
    let id = {
        let team = team.clone();
        let (sender, recipient) = (body.sender.clone(), body.recipient.clone());
        state
            .store
            .call(move |s| s.create_message(&team, &sender, &recipient, &body.content))
            .await
            .map_err(|e| ApiError::BadRequest(e.to_string()))?
    };
    state.hub.publish_json(&ControlEvent::Message {
        team,
        from: body.sender,
        to: body.recipient,
    });
    Ok(Json(serde_json::json!({"message_id": id})))
}

// ── Network allowlist ─────────────────────────────────────────────────

async fn list_allowlist(
    State(state): State<SharedState>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let domains = state.store.call(|s| s.list_allowed_domains()).await?;
    Ok(Json(serde_json::json!({"allowlist": domains})))
}

async fn allow_domain(
    State(state): State<SharedState>,
    Json(body): Json<DomainRequest>,
) -> Result<Json<serde_json::Value>, ApiError> {
    state
        .store
        .call(move |s| s.allow_domain(&body.domain))
        .await
        .map_err(|e| ApiError::BadRequest(e.to_string()))?;
    state.hub.publish_json(&ControlEvent::NetworkUpdate);
    Ok(Json(serde_json::json!({"ok": true})))
}

async fn disallow_domain(
    State(state): State<SharedState>,
    Json(body): Json<DomainRequest>,
) -> Result<Json<serde_json::Value>, ApiError> {
    state
        .store
        .call(move |s| s.disallow_domain(&body.domain))
        .await
        .map_err(|e| ApiError::BadRequest(e.to_string()))?;
    state.hub.publish_json(&ControlEvent::NetworkUpdate);
    Ok(Json(serde_json::json!({"ok": true})))
}

async fn reset_allowlist(
    State(state): State<SharedState>,
) -> Result<Json<serde_json::Value>, ApiError> {
    state.store.call(|s| s.reset_allowlist()).await?;
    state.hub.publish_json(&ControlEvent::NetworkUpdate);
    Ok(Json(serde_json::json!({"ok": true})))
}

// ── Tests ─────────────────────────────────────────────────────────────
