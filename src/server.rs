//! Thin HTTP layer over [`TaskService`]
//!
//! Routes:
//! - `POST /tasks` submit a task, `202 {task_id}`
//! - `GET /tasks/{id}` poll a task snapshot
//! - `POST /tasks/{id}/cancel` request cancellation
//! - `GET /tasks/{id}/events` WebSocket stream of progress events
//! - `GET /health`, `GET /metrics`

use crate::agents::Stage;
use crate::error::{ErrorKind, PipelineError};
use crate::observability::{metrics, HealthMonitor};
use crate::pipeline::parse_stages;
use crate::progress::{ChannelBroadcaster, ProgressEvent};
use crate::service::{SubmitRequest, TaskService};
use crate::state::{FileKind, FileSource, InputFile, SeedData, TaskId};
use futures::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use std::convert::Infallible;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, warn, Instrument};
use warp::http::StatusCode;
use warp::ws::{Message, WebSocket, Ws};
use warp::{Filter, Rejection, Reply};

/// Largest accepted request body
const MAX_BODY_BYTES: u64 = 16 * 1024 * 1024;

/// Shared handles for every route
pub struct ServerState {
    pub service: Arc<TaskService>,
    pub progress: Arc<ChannelBroadcaster>,
    pub health: Arc<HealthMonitor>,
    /// Only directory `path` inputs may be read from
    pub upload_root: Option<PathBuf>,
}

#[derive(Debug, Deserialize)]
pub struct SubmitBody {
    #[serde(default)]
    pub query: Option<String>,
    #[serde(default)]
    pub files: Vec<FileBody>,
    #[serde(default)]
    pub stages: Option<StagesBody>,
    #[serde(default)]
    pub seed: SeedData,
}

/// One uploaded document: inline `text`, or a `path` under the configured
/// upload root
#[derive(Debug, Deserialize)]
pub struct FileBody {
    pub name: String,
    #[serde(default)]
    pub kind: Option<FileKind>,
    #[serde(default)]
    pub text: Option<String>,
    #[serde(default)]
    pub path: Option<PathBuf>,
}

/// A preset name (`"quick_estimate"`), a list string or a list of names
#[derive(Debug, Deserialize)]
#[serde(untagged)]
pub enum StagesBody {
    Named(String),
    List(Vec<String>),
}

impl StagesBody {
    fn resolve(&self) -> Result<Vec<Stage>, PipelineError> {
        match self {
            StagesBody::Named(spec) => parse_stages(spec),
            StagesBody::List(names) => names
                .iter()
                .map(|name| {
                    name.parse::<Stage>()
                        .map_err(|e| PipelineError::configuration(e.to_string()))
                })
                .collect(),
        }
    }
}

impl SubmitBody {
    async fn into_request(
        self,
        upload_root: Option<&Path>,
    ) -> Result<SubmitRequest, PipelineError> {
        let stages = self.stages.as_ref().map(StagesBody::resolve).transpose()?;
        let mut files = Vec::with_capacity(self.files.len());
        for file in self.files {
            files.push(file.into_input(upload_root).await?);
        }

        Ok(SubmitRequest {
            query: self.query,
            files,
            stages,
            seed: self.seed,
        })
    }
}

impl FileBody {
    async fn into_input(self, upload_root: Option<&Path>) -> Result<InputFile, PipelineError> {
        let source = match (self.text, self.path) {
            (Some(text), None) => FileSource::Text(text),
            (None, Some(path)) => {
                FileSource::Path(confine_path(&self.name, &path, upload_root).await?)
            }
            _ => {
                return Err(PipelineError::configuration(format!(
                    "file {} needs exactly one of text or path",
                    self.name
                )))
            }
        };
        Ok(InputFile {
            kind: self.kind.unwrap_or_else(|| FileKind::from_name(&self.name)),
            name: self.name,
            source,
        })
    }
}

/// Resolve `path` against the upload root and refuse anything that escapes
/// it once symlinks and `..` are resolved
async fn confine_path(
    name: &str,
    path: &Path,
    upload_root: Option<&Path>,
) -> Result<PathBuf, PipelineError> {
    let Some(root) = upload_root else {
        return Err(PipelineError::configuration(format!(
            "file {name}: path inputs are not accepted, send text instead"
        )));
    };
    let outside = || {
        PipelineError::configuration(format!("file {name}: path is outside the upload root"))
    };

    let root = tokio::fs::canonicalize(root).await.map_err(|error| {
        warn!(root = %root.display(), error = %error, "Upload root is not readable");
        outside()
    })?;
    let resolved = tokio::fs::canonicalize(root.join(path))
        .await
        .map_err(|_| outside())?;
    if !resolved.starts_with(&root) {
        warn!(file = name, "Rejected path input outside the upload root");
        return Err(outside());
    }
    Ok(resolved)
}

#[derive(Debug, Serialize)]
struct SubmitResponse {
    task_id: TaskId,
}

#[derive(Debug, Serialize)]
struct CancelResponse {
    task_id: TaskId,
    cancelled: bool,
}

#[derive(Debug, Serialize)]
struct ErrorResponse {
    error: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    kind: Option<ErrorKind>,
}

fn with_state(
    state: Arc<ServerState>,
) -> impl Filter<Extract = (Arc<ServerState>,), Error = Infallible> + Clone {
    warp::any().map(move || state.clone())
}

/// All routes, with CORS
pub fn routes(
    state: Arc<ServerState>,
) -> impl Filter<Extract = impl Reply, Error = Infallible> + Clone {
    // POST /tasks
    let submit = warp::path!("tasks")
        .and(warp::post())
        .and(warp::body::content_length_limit(MAX_BODY_BYTES))
        .and(warp::body::json())
        .and(with_state(state.clone()))
        .and_then(submit_task);

    // GET /tasks/{id}
    let status = warp::path!("tasks" / TaskId)
        .and(warp::get())
        .and(with_state(state.clone()))
        .and_then(task_status);

    // POST /tasks/{id}/cancel
    let cancel = warp::path!("tasks" / TaskId / "cancel")
        .and(warp::post())
        .and(with_state(state.clone()))
        .and_then(cancel_task);

    // GET /tasks/{id}/events
    let events = warp::path!("tasks" / TaskId / "events")
        .and(warp::ws())
        .and(with_state(state.clone()))
        .map(|task_id: TaskId, ws: Ws, state: Arc<ServerState>| {
            ws.on_upgrade(move |socket| stream_events(socket, task_id, state))
        });

    // GET /health
    let health = warp::path!("health")
        .and(warp::get())
        .and(with_state(state))
        .and_then(health_status);

    // GET /metrics
    let metrics_route = warp::path!("metrics")
        .and(warp::get())
        .map(|| warp::reply::json(&metrics().get_metrics()));

    submit
        .or(status)
        .or(cancel)
        .or(events)
        .or(health)
        .or(metrics_route)
        .with(warp::cors().allow_any_origin())
        .recover(handle_rejection)
}

/// Bind and serve until Ctrl-C
pub async fn serve(state: Arc<ServerState>, addr: SocketAddr) -> Result<(), PipelineError> {
    let (bound, server) = warp::serve(routes(state))
        .try_bind_with_graceful_shutdown(addr, async {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("Shutdown signal received");
            }
        })
        .map_err(|e| PipelineError::internal(format!("cannot bind {addr}: {e}")))?;

    info!(addr = %bound, "HTTP server listening");
    server.await;
    Ok(())
}

async fn submit_task(
    body: SubmitBody,
    state: Arc<ServerState>,
) -> Result<warp::reply::Response, Infallible> {
    let span = crate::http_span!(method = "POST", path = "/tasks");
    async move {
        let request = match body.into_request(state.upload_root.as_deref()).await {
            Ok(request) => request,
            Err(error) => return Ok(error_reply(&error)),
        };
        match state.service.submit(request).await {
            Ok(task_id) => Ok(warp::reply::with_status(
                warp::reply::json(&SubmitResponse { task_id }),
                StatusCode::ACCEPTED,
            )
            .into_response()),
            Err(error) => Ok(error_reply(&error)),
        }
    }
    .instrument(span)
    .await
}

async fn task_status(
    task_id: TaskId,
    state: Arc<ServerState>,
) -> Result<warp::reply::Response, Infallible> {
    match state.service.status(task_id).await {
        Ok(snapshot) => Ok(warp::reply::json(&snapshot).into_response()),
        Err(error) => Ok(error_reply(&error)),
    }
}

async fn cancel_task(
    task_id: TaskId,
    state: Arc<ServerState>,
) -> Result<warp::reply::Response, Infallible> {
    match state.service.cancel(task_id).await {
        Ok(cancelled) => Ok(warp::reply::with_status(
            warp::reply::json(&CancelResponse { task_id, cancelled }),
            StatusCode::ACCEPTED,
        )
        .into_response()),
        Err(error) => Ok(error_reply(&error)),
    }
}

async fn health_status(state: Arc<ServerState>) -> Result<warp::reply::Response, Infallible> {
    let status = state.health.status().await;
    let code = if status.is_healthy() {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    Ok(warp::reply::with_status(warp::reply::json(&status), code).into_response())
}

/// Forward one task's events to the socket, then close it after the
/// terminal event. A task that already finished gets its terminal event
/// rebuilt from the store.
async fn stream_events(socket: WebSocket, task_id: TaskId, state: Arc<ServerState>) {
    let (mut sink, _) = socket.split();
    // Subscribe before reading the store so no terminal event slips between
    let mut events = state
        .progress
        .subscribe_task(task_id)
        .with_store(state.service.orchestrator().store().clone());

    match state.service.status(task_id).await {
        Ok(snapshot) if snapshot.is_terminal() => {
            if let Some(event) = ProgressEvent::from_snapshot(&snapshot) {
                send_event(&mut sink, &event).await;
            }
            let _ = sink.close().await;
            return;
        }
        Ok(_) => {}
        Err(error) => {
            debug!(%task_id, error = %error, "Event stream requested for unknown task");
            let _ = sink.close().await;
            return;
        }
    }

    while let Some(event) = events.next().await {
        if !send_event(&mut sink, &event).await {
            return;
        }
    }
    let _ = sink.close().await;
}

async fn send_event<S>(sink: &mut S, event: &ProgressEvent) -> bool
where
    S: futures::Sink<Message> + Unpin,
{
    let text = match serde_json::to_string(event) {
        Ok(text) => text,
        Err(error) => {
            warn!(error = %error, "Cannot serialize progress event");
            return false;
        }
    };
    if sink.send(Message::text(text)).await.is_err() {
        debug!(task_id = %event.task_id, "Progress subscriber disconnected");
        return false;
    }
    true
}

fn error_reply(error: &PipelineError) -> warp::reply::Response {
    let code = match error {
        PipelineError::Configuration { .. } => StatusCode::BAD_REQUEST,
        PipelineError::TaskNotFound(_) => StatusCode::NOT_FOUND,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    let body = ErrorResponse {
        error: error.public_message(),
        kind: error.kind(),
    };
    warp::reply::with_status(warp::reply::json(&body), code).into_response()
}

async fn handle_rejection(rejection: Rejection) -> Result<warp::reply::Response, Infallible> {
    let (code, message) = if rejection.is_not_found() {
        (StatusCode::NOT_FOUND, "Not found".to_string())
    } else if let Some(error) = rejection.find::<warp::filters::body::BodyDeserializeError>() {
        (StatusCode::BAD_REQUEST, format!("Invalid request body: {error}"))
    } else if rejection.find::<warp::reject::MethodNotAllowed>().is_some() {
        (StatusCode::METHOD_NOT_ALLOWED, "Method not allowed".to_string())
    } else if rejection.find::<warp::reject::PayloadTooLarge>().is_some() {
        (StatusCode::PAYLOAD_TOO_LARGE, "Request body too large".to_string())
    } else {
        (StatusCode::BAD_REQUEST, format!("Bad request: {rejection:?}"))
    };

    let body = ErrorResponse {
        error: message,
        kind: None,
    };
    Ok(warp::reply::with_status(warp::reply::json(&body), code).into_response())
}
