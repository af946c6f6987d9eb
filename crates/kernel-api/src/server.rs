use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::{Path, Query, Request, State};
use axum::http::header::{HeaderName, HeaderValue};
use axum::http::{Method, StatusCode};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use contracts::scenario::ScenarioDoc;
use contracts::{
    ApiError, Command, CommandResult, ErrorCode, Event, RunStatus, Snapshot, SCHEMA_VERSION_V1,
};
use serde::{Deserialize, Serialize};
use tokio::net::TcpListener;
use tokio::sync::Mutex;

use crate::{EngineApi, PersistenceError};

const MAX_EVENT_PAGE: usize = 5000;

#[derive(Debug)]
pub enum ServerError {
    Io(std::io::Error),
}

impl fmt::Display for ServerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Io(err) => write!(f, "server io error: {err}"),
        }
    }
}

impl std::error::Error for ServerError {}

impl From<std::io::Error> for ServerError {
    fn from(value: std::io::Error) -> Self {
        Self::Io(value)
    }
}

#[derive(Debug)]
struct HttpApiError {
    status: StatusCode,
    error: ApiError,
}

impl HttpApiError {
    fn run_not_found(requested_run_id: &str, active_run_id: Option<&str>) -> Self {
        let details = active_run_id
            .map(|active| format!("requested_run_id={requested_run_id} active_run_id={active}"));
        Self {
            status: StatusCode::NOT_FOUND,
            error: ApiError::new(
                ErrorCode::RunNotFound,
                "run_id does not match an active run",
                details,
            ),
        }
    }

    fn invalid_query(message: impl Into<String>, details: Option<String>) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            error: ApiError::new(ErrorCode::InvalidQuery, message, details),
        }
    }

    fn invalid_command(message: impl Into<String>, details: Option<String>) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            error: ApiError::new(ErrorCode::InvalidCommand, message, details),
        }
    }

    fn internal(message: impl Into<String>, details: Option<String>) -> Self {
        Self {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            error: ApiError::new(ErrorCode::InternalError, message, details),
        }
    }

    fn from_persistence(err: PersistenceError) -> Self {
        match err {
            PersistenceError::NotAttached => {
                Self::invalid_query("persistence store is not attached", None)
            }
            PersistenceError::RunAlreadyExists(run_id) => Self {
                status: StatusCode::CONFLICT,
                error: ApiError::new(
                    ErrorCode::RunStateConflict,
                    "run_id already exists; pass replace_existing=true to replace",
                    Some(format!("run_id={run_id}")),
                ),
            },
            other => Self::internal("persistence operation failed", Some(other.to_string())),
        }
    }
}

impl IntoResponse for HttpApiError {
    fn into_response(self) -> Response {
        (self.status, Json(self.error)).into_response()
    }
}

#[derive(Clone)]
struct AppState {
    inner: Arc<Mutex<ServerInner>>,
}

impl AppState {
    fn new(engine: Option<EngineApi>) -> Self {
        Self {
            inner: Arc::new(Mutex::new(ServerInner { engine })),
        }
    }
}

#[derive(Debug, Default)]
struct ServerInner {
    engine: Option<EngineApi>,
}

fn require_run<'a>(inner: &'a ServerInner, run_id: &str) -> Result<&'a EngineApi, HttpApiError> {
    let Some(engine) = inner.engine.as_ref() else {
        return Err(HttpApiError::run_not_found(run_id, None));
    };
    if engine.run_id() != run_id {
        return Err(HttpApiError::run_not_found(run_id, Some(engine.run_id())));
    }
    Ok(engine)
}

fn require_run_mut<'a>(
    inner: &'a mut ServerInner,
    run_id: &str,
) -> Result<&'a mut EngineApi, HttpApiError> {
    let active_run_id = inner
        .engine
        .as_ref()
        .map(|engine| engine.run_id().to_string());
    let Some(engine) = inner.engine.as_mut() else {
        return Err(HttpApiError::run_not_found(run_id, None));
    };
    if engine.run_id() != run_id {
        return Err(HttpApiError::run_not_found(
            run_id,
            active_run_id.as_deref(),
        ));
    }
    Ok(engine)
}

/// Serves the control/query API for a single active run.
pub async fn serve(addr: SocketAddr, engine: Option<EngineApi>) -> Result<(), ServerError> {
    let state = AppState::new(engine);
    let app = router(state);

    let listener = TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;
    Ok(())
}

fn router(state: AppState) -> Router {
    Router::new()
        .route("/api/v1/runs", post(create_run))
        .route("/api/v1/runs/{run_id}/start", post(start_run))
        .route("/api/v1/runs/{run_id}/pause", post(pause_run))
        .route("/api/v1/runs/{run_id}/step", post(step_run))
        .route("/api/v1/runs/{run_id}/run_to_month", post(run_to_month))
        .route("/api/v1/runs/{run_id}/status", get(get_status))
        .route("/api/v1/runs/{run_id}/commands", post(submit_command))
        .route("/api/v1/runs/{run_id}/events", get(get_events))
        .route("/api/v1/runs/{run_id}/snapshot", get(get_snapshot))
        .layer(middleware::from_fn(cors_middleware))
        .with_state(state)
}

async fn cors_middleware(request: Request, next: Next) -> Response {
    if request.method() == Method::OPTIONS {
        let mut response = Response::new(axum::body::Body::empty());
        *response.status_mut() = StatusCode::NO_CONTENT;
        apply_cors_headers(response.headers_mut());
        return response;
    }

    let mut response = next.run(request).await;
    apply_cors_headers(response.headers_mut());
    response
}

fn apply_cors_headers(headers: &mut axum::http::HeaderMap) {
    headers.insert(
        HeaderName::from_static("access-control-allow-origin"),
        HeaderValue::from_static("*"),
    );
    headers.insert(
        HeaderName::from_static("access-control-allow-methods"),
        HeaderValue::from_static("GET, POST, OPTIONS"),
    );
    headers.insert(
        HeaderName::from_static("access-control-allow-headers"),
        HeaderValue::from_static("content-type"),
    );
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum CreateRunRequest {
    Scenario(ScenarioDoc),
    WithOptions(CreateRunOptions),
}

#[derive(Debug, Deserialize)]
struct CreateRunOptions {
    scenario: ScenarioDoc,
    auto_start: Option<bool>,
    sqlite_path: Option<String>,
    replace_existing: Option<bool>,
}

#[derive(Debug, Serialize)]
struct CreateRunResponse {
    schema_version: String,
    run_id: String,
    status: RunStatus,
    started: bool,
}

async fn create_run(
    State(state): State<AppState>,
    Json(request): Json<CreateRunRequest>,
) -> Result<Json<CreateRunResponse>, HttpApiError> {
    let (scenario, auto_start, sqlite_path, replace_existing) = match request {
        CreateRunRequest::Scenario(scenario) => (scenario, false, None, true),
        CreateRunRequest::WithOptions(options) => (
            options.scenario,
            options.auto_start.unwrap_or(false),
            options
                .sqlite_path
                .filter(|path| !path.trim().is_empty()),
            options.replace_existing.unwrap_or(true),
        ),
    };

    let mut engine = EngineApi::from_scenario(&scenario)
        .map_err(|err| HttpApiError::invalid_command("scenario rejected", Some(err.to_string())))?;

    if let Some(path) = sqlite_path {
        engine
            .attach_sqlite_store(&path)
            .map_err(HttpApiError::from_persistence)?;
        engine
            .initialize_run_storage(replace_existing)
            .map_err(HttpApiError::from_persistence)?;
    }
    if auto_start {
        engine.start();
    }

    let response = CreateRunResponse {
        schema_version: SCHEMA_VERSION_V1.to_string(),
        run_id: engine.run_id().to_string(),
        status: engine.status().clone(),
        started: auto_start,
    };

    let mut inner = state.inner.lock().await;
    inner.engine = Some(engine);
    Ok(Json(response))
}

async fn start_run(
    State(state): State<AppState>,
    Path(run_id): Path<String>,
) -> Result<Json<RunStatus>, HttpApiError> {
    let mut inner = state.inner.lock().await;
    let engine = require_run_mut(&mut inner, &run_id)?;
    Ok(Json(engine.start().clone()))
}

async fn pause_run(
    State(state): State<AppState>,
    Path(run_id): Path<String>,
) -> Result<Json<RunStatus>, HttpApiError> {
    let mut inner = state.inner.lock().await;
    let engine = require_run_mut(&mut inner, &run_id)?;
    Ok(Json(engine.pause().clone()))
}

#[derive(Debug, Deserialize, Default)]
struct StepRequest {
    months: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct RunToMonthRequest {
    target_month: u64,
}

#[derive(Debug, Serialize)]
struct StepResponse {
    schema_version: String,
    status: RunStatus,
    committed: u64,
    runtime_error: Option<String>,
}

async fn step_run(
    State(state): State<AppState>,
    Path(run_id): Path<String>,
    request: Option<Json<StepRequest>>,
) -> Result<Json<StepResponse>, HttpApiError> {
    let months = request
        .map(|Json(body)| body.months.unwrap_or(1))
        .unwrap_or(1);
    if months == 0 {
        return Err(HttpApiError::invalid_command(
            "step requires months >= 1",
            None,
        ));
    }

    let mut inner = state.inner.lock().await;
    let engine = require_run_mut(&mut inner, &run_id)?;
    let (status, committed) = engine.step(months);
    let status = status.clone();
    Ok(Json(StepResponse {
        schema_version: SCHEMA_VERSION_V1.to_string(),
        status,
        committed,
        runtime_error: engine.last_runtime_error().map(str::to_string),
    }))
}

async fn run_to_month(
    State(state): State<AppState>,
    Path(run_id): Path<String>,
    Json(request): Json<RunToMonthRequest>,
) -> Result<Json<StepResponse>, HttpApiError> {
    let mut inner = state.inner.lock().await;
    let engine = require_run_mut(&mut inner, &run_id)?;
    let (status, committed) = engine.run_to_month(request.target_month);
    let status = status.clone();
    Ok(Json(StepResponse {
        schema_version: SCHEMA_VERSION_V1.to_string(),
        status,
        committed,
        runtime_error: engine.last_runtime_error().map(str::to_string),
    }))
}

async fn get_status(
    State(state): State<AppState>,
    Path(run_id): Path<String>,
) -> Result<Json<RunStatus>, HttpApiError> {
    let inner = state.inner.lock().await;
    let engine = require_run(&inner, &run_id)?;
    Ok(Json(engine.status().clone()))
}

#[derive(Debug, Deserialize)]
struct EventsQuery {
    from_month: Option<u64>,
    to_month: Option<u64>,
    page_size: Option<usize>,
}

#[derive(Debug, Serialize)]
struct EventsResponse {
    schema_version: String,
    run_id: String,
    events: Vec<Event>,
}

async fn get_events(
    State(state): State<AppState>,
    Path(run_id): Path<String>,
    Query(query): Query<EventsQuery>,
) -> Result<Json<EventsResponse>, HttpApiError> {
    let from_month = query.from_month.unwrap_or(0);
    let to_month = query.to_month.unwrap_or(u64::MAX);
    if to_month < from_month {
        return Err(HttpApiError::invalid_query(
            "to_month must be >= from_month",
            Some(format!("from_month={from_month} to_month={to_month}")),
        ));
    }
    let page_size = query.page_size.unwrap_or(MAX_EVENT_PAGE).min(MAX_EVENT_PAGE);

    let inner = state.inner.lock().await;
    let engine = require_run(&inner, &run_id)?;
    let events = engine
        .events()
        .iter()
        .filter(|event| event.month >= from_month && event.month <= to_month)
        .take(page_size)
        .cloned()
        .collect();

    Ok(Json(EventsResponse {
        schema_version: SCHEMA_VERSION_V1.to_string(),
        run_id,
        events,
    }))
}

async fn get_snapshot(
    State(state): State<AppState>,
    Path(run_id): Path<String>,
) -> Result<Json<Snapshot>, HttpApiError> {
    let inner = state.inner.lock().await;
    let engine = require_run(&inner, &run_id)?;
    Ok(Json(engine.snapshot_for_current_month()))
}

async fn submit_command(
    State(state): State<AppState>,
    Path(run_id): Path<String>,
    Json(command): Json<Command>,
) -> Result<Json<CommandResult>, HttpApiError> {
    let mut inner = state.inner.lock().await;
    let engine = require_run_mut(&mut inner, &run_id)?;
    Ok(Json(engine.submit_command(command)))
}
