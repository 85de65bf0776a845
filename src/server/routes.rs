use crate::core::model::{EnqueueOutcome, Mode, RequeueOutcome, Source, SourceCounter, Task, TaskId};
use crate::core::worker::WorkerSnapshot;
use crate::server::error::{ApiError, ApiResult};
use crate::server::AppState;
use axum::extract::{Query, State};
use axum::Json;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};
use url::Url;

const DEFAULT_PAGE: i64 = 50;
const MAX_PAGE: i64 = 500;
const DIGEST_PREVIEW: usize = 20;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PingResponse {
    pub status: String,
    pub server: String,
    pub server_url: String,
    pub token_digest: Option<String>,
}

/// What unauthenticated companions (browser extension, phone) need to connect.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExtConfig {
    pub server_url: String,
    pub scheme: String,
    pub host: String,
    pub port: u16,
    pub token: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EnqueueRequest {
    #[serde(default)]
    pub url: String,
    #[serde(default)]
    pub source: Option<String>,
    #[serde(default)]
    pub mode: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EnqueueResponse {
    pub task_id: Option<TaskId>,
    pub display_id: Option<String>,
    pub duplicate: bool,
    pub detail: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Paging {
    pub limit: Option<i64>,
    pub offset: Option<i64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskList {
    pub items: Vec<Task>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CounterList {
    pub counters: Vec<SourceCounter>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ControlRequest {
    pub action: String,
    #[serde(default)]
    pub task_id: Option<TaskId>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ControlResponse {
    pub detail: String,
    #[serde(default)]
    pub task_id: Option<TaskId>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlAction {
    PauseWorker,
    ResumeWorker,
    RestartWorker,
    CancelCurrent,
    RestartAll,
    Retry,
    Delete,
}

impl ControlAction {
    pub const ALL: [ControlAction; 7] = [
        ControlAction::PauseWorker,
        ControlAction::ResumeWorker,
        ControlAction::RestartWorker,
        ControlAction::CancelCurrent,
        ControlAction::RestartAll,
        ControlAction::Retry,
        ControlAction::Delete,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ControlAction::PauseWorker => "pause_worker",
            ControlAction::ResumeWorker => "resume_worker",
            ControlAction::RestartWorker => "restart_worker",
            ControlAction::CancelCurrent => "cancel_current",
            ControlAction::RestartAll => "restart_all",
            ControlAction::Retry => "retry",
            ControlAction::Delete => "delete",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        let value = value.trim();
        Self::ALL.into_iter().find(|a| a.as_str().eq_ignore_ascii_case(value))
    }
}

/// Trimmed URL if it is an absolute http(s) URL with a host.
pub fn validate_url(raw: &str) -> ApiResult<String> {
    let url = raw.trim();
    if url.is_empty() {
        return Err(ApiError::Validation("url is required".to_string()));
    }
    let parsed = Url::parse(url).map_err(|_| ApiError::Validation(format!("invalid url: {url}")))?;
    let has_host = parsed.host_str().is_some_and(|h| !h.is_empty());
    if !matches!(parsed.scheme(), "http" | "https") || !has_host {
        return Err(ApiError::Validation(format!("invalid url: {url}")));
    }
    Ok(url.to_string())
}

pub async fn ping(State(state): State<AppState>) -> Json<PingResponse> {
    let token_digest = match state.tokens.digest().await {
        Ok(d) => Some(format!("{}...", d.chars().take(DIGEST_PREVIEW).collect::<String>())),
        Err(e) => {
            warn!(error = %format!("{:#}", e), "token digest unavailable");
            None
        }
    };
    Json(PingResponse {
        status: "ok".to_string(),
        server: state.config.server.name.clone(),
        server_url: state.config.server_url(),
        token_digest,
    })
}

pub async fn ext_config(State(state): State<AppState>) -> Json<ExtConfig> {
    let token = state.tokens.load_or_create().await.unwrap_or_else(|e| {
        warn!(error = %format!("{:#}", e), "token unavailable for companion config");
        String::new()
    });
    let server = &state.config.server;
    Json(ExtConfig {
        server_url: state.config.server_url(),
        scheme: server.scheme.clone(),
        host: server.host.clone(),
        port: server.port,
        token,
    })
}

pub async fn enqueue(State(state): State<AppState>, Json(req): Json<EnqueueRequest>) -> ApiResult<Json<EnqueueResponse>> {
    let mode = match req.mode.as_deref().map(str::trim).filter(|m| !m.is_empty()) {
        None => Mode::Video,
        Some(raw) => Mode::parse(raw).unwrap_or_else(|| {
            warn!(mode = raw, "unknown mode, using VIDEO");
            Mode::Video
        }),
    };
    let url = validate_url(&req.url)?;
    let source = Source::parse(req.source.as_deref().unwrap_or("UNKNOWN"));

    match state.store.enqueue(&url, source, mode).await? {
        EnqueueOutcome::Queued(id) => {
            state.worker.notify_enqueued();
            let display_id = state.store.get(id).await?.map(|t| t.display_id());
            Ok(Json(EnqueueResponse {
                task_id: Some(id),
                display_id,
                duplicate: false,
                detail: "queued".to_string(),
            }))
        }
        EnqueueOutcome::Duplicate => Ok(Json(EnqueueResponse {
            task_id: None,
            display_id: None,
            duplicate: true,
            detail: "duplicate: url already queued".to_string(),
        })),
    }
}

pub async fn status(State(state): State<AppState>, Query(paging): Query<Paging>) -> ApiResult<Json<TaskList>> {
    let limit = paging.limit.unwrap_or(DEFAULT_PAGE).clamp(1, MAX_PAGE);
    let offset = paging.offset.unwrap_or(0).max(0);
    let items = state.store.list_tasks(limit, offset).await?;
    Ok(Json(TaskList { items }))
}

pub async fn counters(State(state): State<AppState>) -> ApiResult<Json<CounterList>> {
    Ok(Json(CounterList { counters: state.store.counters().await? }))
}

pub async fn worker_state(State(state): State<AppState>) -> Json<WorkerSnapshot> {
    Json(state.worker.snapshot())
}

fn reply(detail: impl Into<String>, task_id: Option<TaskId>) -> Json<ControlResponse> {
    Json(ControlResponse { detail: detail.into(), task_id })
}

pub async fn control(State(state): State<AppState>, Json(req): Json<ControlRequest>) -> ApiResult<Json<ControlResponse>> {
    let action = ControlAction::parse(&req.action)
        .ok_or_else(|| ApiError::Validation(format!("unsupported action: {}", req.action.trim())))?;
    info!(action = action.as_str(), task_id = ?req.task_id, "control request");

    let worker = &state.worker;
    match action {
        ControlAction::PauseWorker => {
            worker.pause();
            Ok(reply("worker paused", None))
        }
        ControlAction::ResumeWorker => {
            worker.resume();
            Ok(reply("worker resumed", None))
        }
        ControlAction::RestartWorker => {
            let healed = worker.restart().await?;
            Ok(reply(format!("worker restarted, {healed} stuck task(s) requeued"), None))
        }
        ControlAction::CancelCurrent => match worker.cancel_current() {
            Some(id) => Ok(reply("cancellation requested", Some(id))),
            None => Err(ApiError::Conflict("no active task".to_string())),
        },
        ControlAction::RestartAll => {
            worker.restart_all().await?;
            Ok(reply("queue wiped and counters reset", None))
        }
        ControlAction::Retry => {
            let id = required_task_id(&req)?;
            match state.store.requeue(id).await? {
                RequeueOutcome::Requeued => {
                    worker.notify_enqueued();
                    Ok(reply("task requeued", Some(id)))
                }
                RequeueOutcome::NotFound => Err(ApiError::NotFound(format!("task {id} not found"))),
                RequeueOutcome::Busy(status) => Err(ApiError::Conflict(format!(
                    "task {id} is {}, only finished tasks can be retried",
                    status.as_str()
                ))),
                RequeueOutcome::Duplicate => {
                    Err(ApiError::Conflict(format!("task {id}: the same url is already queued")))
                }
            }
        }
        ControlAction::Delete => {
            let id = required_task_id(&req)?;
            if worker.current_task_id() == Some(id) {
                worker.cancel_current();
            }
            if state.store.delete(id).await? {
                Ok(reply("task deleted", Some(id)))
            } else {
                Err(ApiError::NotFound(format!("task {id} not found")))
            }
        }
    }
}

fn required_task_id(req: &ControlRequest) -> ApiResult<TaskId> {
    req.task_id
        .ok_or_else(|| ApiError::Validation(format!("{} requires task_id", req.action.trim())))
}
