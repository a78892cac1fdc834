//! HTTP submission and query surface.
//!
//! Identity is taken from headers set by a trusted upstream proxy; the
//! scheduler only sees the resulting [`Requester`].

use std::collections::BTreeSet;
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;

use axum::{
    extract::{
        rejection::{JsonRejection, QueryRejection},
        FromRequest, FromRequestParts, Path, Query, State,
    },
    http::{request::Parts, StatusCode},
    response::{
        sse::{Event, KeepAlive, Sse},
        IntoResponse, Response,
    },
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio_stream::wrappers::{errors::BroadcastStreamRecvError, BroadcastStream};
use tokio_stream::{Stream, StreamExt};
use tokio_util::sync::CancellationToken;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use uuid::Uuid;

use crate::access::Requester;
use crate::error::SchedulerError;
use crate::events::BroadcastEventSink;
use crate::registry::{CurrentLoad, NodeRegistration, NodeStatus};
use crate::scheduler::{Job, JobOutcome, JobSpec, JobStatus, Scheduler};
use crate::store::{JobFilter, NodeFilter};

pub const REQUESTER_ID_HEADER: &str = "x-requester-id";
pub const REQUESTER_ROLE_HEADER: &str = "x-requester-role";

#[derive(Clone)]
pub struct ApiState {
    pub scheduler: Arc<Scheduler>,
    pub events: BroadcastEventSink,
}

/// Error response: `{ "error": CODE, "message": ... }`.
#[derive(Debug)]
pub struct ApiError(pub SchedulerError);

impl From<SchedulerError> for ApiError {
    fn from(err: SchedulerError) -> Self {
        Self(err)
    }
}

impl ApiError {
    fn status(&self) -> StatusCode {
        match &self.0 {
            SchedulerError::NotFound { .. } => StatusCode::NOT_FOUND,
            SchedulerError::InvalidSpec(_) => StatusCode::BAD_REQUEST,
            SchedulerError::InvalidState { .. }
            | SchedulerError::NodeMismatch { .. }
            | SchedulerError::Conflict(_) => StatusCode::CONFLICT,
            SchedulerError::QueueFull { .. } => StatusCode::SERVICE_UNAVAILABLE,
            SchedulerError::Forbidden(_) => StatusCode::FORBIDDEN,
            SchedulerError::Storage(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() && status != StatusCode::SERVICE_UNAVAILABLE {
            tracing::error!(error = %self.0, "Request failed");
        }
        let body = Json(json!({
            "error": self.0.code(),
            "message": self.0.to_string(),
        }));
        (status, body).into_response()
    }
}

impl From<JsonRejection> for ApiError {
    fn from(rejection: JsonRejection) -> Self {
        Self(SchedulerError::InvalidSpec(rejection.body_text()))
    }
}

impl From<QueryRejection> for ApiError {
    fn from(rejection: QueryRejection) -> Self {
        Self(SchedulerError::InvalidSpec(rejection.body_text()))
    }
}

type ApiResult<T> = Result<T, ApiError>;

/// JSON body extractor whose failures render as `INVALID_SPEC`.
#[derive(Debug, FromRequest)]
#[from_request(via(Json), rejection(ApiError))]
pub struct ApiJson<T>(pub T);

/// Query string extractor whose failures render as `INVALID_SPEC`.
#[derive(Debug, FromRequestParts)]
#[from_request(via(Query), rejection(ApiError))]
pub struct ApiQuery<T>(pub T);

impl<S> FromRequestParts<S> for Requester
where
    S: Send + Sync,
{
    type Rejection = Infallible;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let id = header(parts, REQUESTER_ID_HEADER).unwrap_or("anonymous").to_string();
        let is_admin = header(parts, REQUESTER_ROLE_HEADER)
            .is_some_and(|role| role.eq_ignore_ascii_case("admin"));
        Ok(Requester { id, is_admin })
    }
}

fn header<'a>(parts: &'a Parts, name: &str) -> Option<&'a str> {
    parts
        .headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
}

#[derive(Debug, Default, Deserialize)]
pub struct ListJobsQuery {
    /// Comma-separated statuses.
    pub status: Option<String>,
    #[serde(rename = "type")]
    pub job_type: Option<String>,
    pub submitted_by: Option<String>,
    /// Comma-separated; matches jobs carrying any of them.
    pub tags: Option<String>,
    pub assigned_to: Option<String>,
    pub limit: Option<usize>,
    pub offset: Option<usize>,
}

fn split_list(value: Option<&str>) -> Vec<String> {
    value
        .into_iter()
        .flat_map(|v| v.split(','))
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(str::to_string)
        .collect()
}

impl TryFrom<ListJobsQuery> for JobFilter {
    type Error = SchedulerError;

    fn try_from(query: ListJobsQuery) -> Result<Self, Self::Error> {
        let statuses = split_list(query.status.as_deref())
            .iter()
            .map(|s| s.parse::<JobStatus>())
            .collect::<Result<Vec<_>, _>>()?;
        Ok(JobFilter {
            statuses,
            job_type: query.job_type,
            submitted_by: query.submitted_by,
            tags: split_list(query.tags.as_deref()),
            assigned_node_id: query.assigned_to,
            limit: query.limit,
            offset: query.offset.unwrap_or(0),
        })
    }
}

#[derive(Debug, Default, Deserialize)]
pub struct ListNodesQuery {
    pub status: Option<String>,
    pub limit: Option<usize>,
    pub offset: Option<usize>,
}

impl TryFrom<ListNodesQuery> for NodeFilter {
    type Error = SchedulerError;

    fn try_from(query: ListNodesQuery) -> Result<Self, Self::Error> {
        let statuses = split_list(query.status.as_deref())
            .iter()
            .map(|s| s.parse::<NodeStatus>())
            .collect::<Result<Vec<_>, _>>()?;
        Ok(NodeFilter {
            statuses,
            limit: query.limit,
            offset: query.offset.unwrap_or(0),
        })
    }
}

#[derive(Debug, Deserialize)]
pub struct ClaimRequest {
    pub node_id: String,
    pub capacity: usize,
    #[serde(default)]
    pub capabilities: BTreeSet<String>,
}

#[derive(Debug, Serialize)]
pub struct ClaimResponse {
    pub jobs: Vec<Job>,
}

#[derive(Debug, Deserialize)]
pub struct ResultRequest {
    pub job_id: Uuid,
    pub node_id: String,
    #[serde(flatten)]
    pub outcome: JobOutcome,
}

#[derive(Debug, Deserialize)]
pub struct ProgressRequest {
    pub node_id: String,
    pub progress: f64,
    #[serde(default)]
    pub message: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct HeartbeatRequest {
    pub node_id: String,
    pub status: NodeStatus,
    #[serde(default)]
    pub current_load: Option<CurrentLoad>,
}

pub fn router(state: ApiState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/api/jobs", get(list_jobs_handler).post(submit_job_handler))
        .route("/api/jobs/request", post(claim_handler))
        .route("/api/jobs/{id}", get(get_job_handler).delete(cancel_job_handler))
        .route("/api/jobs/{id}/result", post(result_handler))
        .route("/api/jobs/{id}/progress", post(progress_handler))
        .route("/api/nodes", get(list_nodes_handler))
        .route("/api/nodes/register", post(register_handler))
        .route("/api/nodes/heartbeat", post(heartbeat_handler))
        .route("/api/nodes/{id}", get(get_node_handler))
        .route("/api/queue/stats", get(queue_stats_handler))
        .route("/api/events", get(events_handler))
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}

/// Serve the API until `token` is cancelled.
pub async fn run_api(
    addr: SocketAddr,
    state: ApiState,
    token: CancellationToken,
) -> std::io::Result<()> {
    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!(addr = %listener.local_addr()?, "Starting API server");

    axum::serve(listener, router(state))
        .with_graceful_shutdown(async move { token.cancelled().await })
        .await
}

fn parse_job_id(raw: &str) -> ApiResult<Uuid> {
    Uuid::parse_str(raw)
        .map_err(|_| ApiError(SchedulerError::InvalidSpec(format!("invalid job id '{raw}'"))))
}

async fn submit_job_handler(
    State(state): State<ApiState>,
    requester: Requester,
    ApiJson(spec): ApiJson<JobSpec>,
) -> ApiResult<impl IntoResponse> {
    let job = state.scheduler.submit(spec, &requester.id).await?;
    Ok((StatusCode::CREATED, Json(job)))
}

async fn list_jobs_handler(
    State(state): State<ApiState>,
    requester: Requester,
    ApiQuery(query): ApiQuery<ListJobsQuery>,
) -> ApiResult<impl IntoResponse> {
    let filter = JobFilter::try_from(query)?;
    let page = state.scheduler.list_jobs_for(&filter, &requester).await?;
    Ok(Json(page))
}

async fn get_job_handler(
    State(state): State<ApiState>,
    requester: Requester,
    Path(id): Path<String>,
) -> ApiResult<impl IntoResponse> {
    let job_id = parse_job_id(&id)?;
    Ok(Json(state.scheduler.get_job_for(&job_id, &requester).await?))
}

async fn cancel_job_handler(
    State(state): State<ApiState>,
    requester: Requester,
    Path(id): Path<String>,
) -> ApiResult<impl IntoResponse> {
    let job_id = parse_job_id(&id)?;
    Ok(Json(state.scheduler.cancel(&job_id, &requester).await?))
}

async fn claim_handler(
    State(state): State<ApiState>,
    ApiJson(request): ApiJson<ClaimRequest>,
) -> ApiResult<impl IntoResponse> {
    let jobs = state
        .scheduler
        .claim(&request.node_id, request.capacity, &request.capabilities)
        .await?;
    Ok(Json(ClaimResponse { jobs }))
}

async fn result_handler(
    State(state): State<ApiState>,
    Path(id): Path<String>,
    ApiJson(request): ApiJson<ResultRequest>,
) -> ApiResult<impl IntoResponse> {
    let job_id = parse_job_id(&id)?;
    if job_id != request.job_id {
        return Err(SchedulerError::InvalidSpec(format!(
            "job id mismatch: path {job_id}, body {}",
            request.job_id
        ))
        .into());
    }
    let job = state
        .scheduler
        .report_result(&job_id, &request.node_id, request.outcome)
        .await?;
    Ok(Json(job))
}

async fn progress_handler(
    State(state): State<ApiState>,
    Path(id): Path<String>,
    ApiJson(request): ApiJson<ProgressRequest>,
) -> ApiResult<impl IntoResponse> {
    let job_id = parse_job_id(&id)?;
    let job = state
        .scheduler
        .update_progress(&job_id, &request.node_id, request.progress, request.message)
        .await?;
    Ok(Json(job))
}

async fn register_handler(
    State(state): State<ApiState>,
    ApiJson(registration): ApiJson<NodeRegistration>,
) -> ApiResult<impl IntoResponse> {
    Ok(Json(state.scheduler.register(registration).await?))
}

async fn heartbeat_handler(
    State(state): State<ApiState>,
    ApiJson(request): ApiJson<HeartbeatRequest>,
) -> ApiResult<impl IntoResponse> {
    let node = state
        .scheduler
        .heartbeat(&request.node_id, request.status, request.current_load)
        .await?;
    Ok(Json(node))
}

async fn list_nodes_handler(
    State(state): State<ApiState>,
    ApiQuery(query): ApiQuery<ListNodesQuery>,
) -> ApiResult<impl IntoResponse> {
    let filter = NodeFilter::try_from(query)?;
    Ok(Json(state.scheduler.list_nodes(&filter).await?))
}

async fn get_node_handler(
    State(state): State<ApiState>,
    Path(id): Path<String>,
) -> ApiResult<impl IntoResponse> {
    Ok(Json(state.scheduler.get_node(&id).await?))
}

async fn queue_stats_handler(State(state): State<ApiState>) -> impl IntoResponse {
    Json(state.scheduler.queue_stats())
}

async fn events_handler(
    State(state): State<ApiState>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let stream =
        BroadcastStream::new(state.events.subscribe()).filter_map(|message| match message {
            Ok(event) => Event::default()
                .event(event.name())
                .json_data(&event)
                .ok()
                .map(Ok),
            Err(BroadcastStreamRecvError::Lagged(skipped)) => {
                tracing::warn!(skipped, "Event subscriber lagging, events dropped");
                None
            }
        });
    Sse::new(stream).keep_alive(KeepAlive::default())
}
