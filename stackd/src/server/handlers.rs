//! HTTP request handlers

use std::convert::Infallible;
use std::future::Future;
use std::sync::Arc;

use axum::{
    body::{Body, Bytes},
    extract::{Path, Query, State},
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use futures::{stream, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, oneshot};
use tracing::warn;

use crate::deploy::cancel::CancelToken;
use crate::deploy::compose::StackStatus;
use crate::deploy::manager::{DeployOptions, LogQuery};
use crate::deploy::process::{OutputLine, OutputSink};
use crate::errors::StackError;
use crate::models::deployment::Deployment;
use crate::models::project::{GitAuth, NewProject, Project, ProjectUpdate};
use crate::server::errors::{ApiError, ErrorBody};
use crate::server::state::ServerState;
use crate::utils::{is_valid_git_url, version_info};

/// Lines buffered between a running command and a streaming response
const OUTPUT_QUEUE: usize = 1024;

/// Health check response
#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub service: String,
    pub version: String,
}

/// Health check handler
pub async fn health_handler() -> impl IntoResponse {
    let version = version_info();
    Json(HealthResponse {
        status: "healthy".to_string(),
        service: "stackd".to_string(),
        version: version.version,
    })
}

/// Version handler
pub async fn version_handler() -> impl IntoResponse {
    Json(version_info())
}

/// Repository credentials as accepted over HTTP. Never logged.
#[derive(Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum AuthRequest {
    Http {
        username: String,
        password: String,
    },
    Ssh {
        private_key: String,
        #[serde(default)]
        passphrase: Option<String>,
        #[serde(default)]
        user: Option<String>,
    },
}

impl From<AuthRequest> for GitAuth {
    fn from(auth: AuthRequest) -> Self {
        match auth {
            AuthRequest::Http { username, password } => GitAuth::http(username, password),
            AuthRequest::Ssh {
                private_key,
                passphrase,
                user,
            } => GitAuth::ssh(private_key, passphrase, user),
        }
    }
}

fn default_watch() -> bool {
    true
}

#[derive(Deserialize)]
pub struct CreateProjectRequest {
    pub name: String,
    pub git_url: String,

    /// Empty or missing selects the repository's default branch
    #[serde(default)]
    pub git_branch: String,

    #[serde(default)]
    pub auth: Option<AuthRequest>,

    pub compose_files: Vec<String>,

    #[serde(default)]
    pub variables: Vec<String>,

    #[serde(default = "default_watch")]
    pub watch_enabled: bool,
}

#[derive(Deserialize)]
pub struct UpdateProjectRequest {
    pub name: Option<String>,
    pub git_branch: Option<String>,
    pub auth: Option<AuthRequest>,

    /// Forget the stored credentials
    #[serde(default)]
    pub clear_auth: bool,

    pub compose_files: Option<Vec<String>>,
    pub variables: Option<Vec<String>>,
    pub watch_enabled: Option<bool>,
}

#[derive(Debug, Deserialize)]
pub struct DeployQuery {
    pub pull: Option<bool>,
}

#[derive(Debug, Deserialize)]
pub struct RemoveQuery {
    #[serde(default)]
    pub volumes: bool,
}

#[derive(Debug, Deserialize)]
pub struct LogsQuery {
    #[serde(default)]
    pub follow: bool,
    pub tail: Option<u32>,
}

#[derive(Deserialize)]
pub struct TestAuthRequest {
    pub git_url: String,
    #[serde(default)]
    pub auth: Option<AuthRequest>,
}

#[derive(Debug, Serialize)]
pub struct TestAuthResponse {
    pub authenticated: bool,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// One line of a streamed (NDJSON) response
#[derive(Debug, Serialize)]
#[serde(tag = "type", rename_all = "lowercase")]
enum StreamEvent {
    Output(OutputLine),
    Result { deployment: Deployment },
    Error(ErrorBody),
    Done,
}

/// Run `operation` on its own task so it finishes cleanly even when the
/// client goes away. The client going away or the server shutting down
/// cancels it.
async fn run_detached<T, F, Fut>(shutdown: &CancelToken, operation: F) -> Result<T, ApiError>
where
    F: FnOnce(CancelToken) -> Fut,
    Fut: Future<Output = Result<T, StackError>> + Send + 'static,
    T: Send + 'static,
{
    let cancel = shutdown.child();
    let _guard = cancel.drop_guard();
    let result = tokio::spawn(operation(cancel))
        .await
        .map_err(|e| ApiError::internal(format!("operation failed: {e}")))?;
    Ok(result?)
}

/// Stream command output as NDJSON followed by the operation's final event.
/// Dropping the response body or shutting down the server cancels the
/// operation.
fn stream_operation<F, Fut>(shutdown: &CancelToken, operation: F) -> Response
where
    F: FnOnce(OutputSink, CancelToken) -> Fut,
    Fut: Future<Output = StreamEvent> + Send + 'static,
{
    let (line_tx, line_rx) = mpsc::channel::<OutputLine>(OUTPUT_QUEUE);
    let (outcome_tx, outcome_rx) = oneshot::channel();
    let cancel = shutdown.child();
    let guard = cancel.drop_guard();

    let operation = operation(OutputSink::Channel(line_tx), cancel);
    tokio::spawn(async move {
        let _ = outcome_tx.send(operation.await);
    });

    let output = stream::unfold(line_rx, |mut rx| async move {
        rx.recv().await.map(|line| (StreamEvent::Output(line), rx))
    });
    let outcome = stream::once(async move {
        let event = outcome_rx.await.unwrap_or_else(|_| {
            StreamEvent::Error(ErrorBody {
                error: "operation aborted".to_string(),
                stdout: None,
                stderr: None,
            })
        });
        drop(guard);
        event
    });
    let body = output
        .chain(outcome)
        .map(|event| Ok::<_, Infallible>(encode(&event)));

    (
        [(header::CONTENT_TYPE, "application/x-ndjson")],
        Body::from_stream(body),
    )
        .into_response()
}

fn encode(event: &StreamEvent) -> Bytes {
    match serde_json::to_vec(event) {
        Ok(mut line) => {
            line.push(b'\n');
            Bytes::from(line)
        }
        Err(e) => {
            warn!("Failed to encode stream event: {}", e);
            Bytes::new()
        }
    }
}

pub async fn list_projects_handler(
    State(state): State<Arc<ServerState>>,
) -> Result<Json<Vec<Project>>, ApiError> {
    Ok(Json(state.manager.list().await?))
}

pub async fn create_project_handler(
    State(state): State<Arc<ServerState>>,
    Json(request): Json<CreateProjectRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let new = NewProject {
        name: request.name,
        git_url: request.git_url,
        git_branch: request.git_branch,
        git_auth: request.auth.map(GitAuth::from),
        compose_files: request.compose_files,
        variables: request.variables,
        watch_enabled: request.watch_enabled,
    };
    let manager = state.manager.clone();
    let project =
        run_detached(&state.shutdown, move |_| async move { manager.create(new).await }).await?;
    Ok((StatusCode::CREATED, Json(project)))
}

pub async fn get_project_handler(
    State(state): State<Arc<ServerState>>,
    Path(id): Path<String>,
) -> Result<Json<Project>, ApiError> {
    Ok(Json(state.manager.get(&id).await?))
}

pub async fn update_project_handler(
    State(state): State<Arc<ServerState>>,
    Path(id): Path<String>,
    Json(request): Json<UpdateProjectRequest>,
) -> Result<Json<Project>, ApiError> {
    let git_auth = if request.clear_auth {
        Some(None)
    } else {
        request.auth.map(|auth| Some(GitAuth::from(auth)))
    };
    let update = ProjectUpdate {
        name: request.name,
        git_branch: request.git_branch,
        git_auth,
        compose_files: request.compose_files,
        variables: request.variables,
        watch_enabled: request.watch_enabled,
    };
    Ok(Json(state.manager.update(&id, update).await?))
}

pub async fn remove_project_handler(
    State(state): State<Arc<ServerState>>,
    Path(id): Path<String>,
    Query(query): Query<RemoveQuery>,
) -> Result<StatusCode, ApiError> {
    let manager = state.manager.clone();
    run_detached(&state.shutdown, move |cancel| async move {
        manager.remove(&id, query.volumes, &cancel).await
    })
    .await?;
    Ok(StatusCode::NO_CONTENT)
}

pub async fn deploy_project_handler(
    State(state): State<Arc<ServerState>>,
    Path(id): Path<String>,
    Query(query): Query<DeployQuery>,
) -> Result<Response, ApiError> {
    state.manager.get(&id).await?;
    let manager = state.manager.clone();
    Ok(stream_operation(&state.shutdown, move |sink, cancel| async move {
        let options = DeployOptions {
            pull: query.pull.unwrap_or(true),
            sink,
            cancel,
        };
        match manager.deploy(&id, options).await {
            Ok(deployment) => StreamEvent::Result { deployment },
            Err(e) => StreamEvent::Error(ErrorBody::from(&e)),
        }
    }))
}

pub async fn stop_project_handler(
    State(state): State<Arc<ServerState>>,
    Path(id): Path<String>,
) -> Result<Json<Project>, ApiError> {
    let manager = state.manager.clone();
    let project = run_detached(&state.shutdown, move |cancel| async move {
        manager.stop(&id, OutputSink::Buffer, &cancel).await
    })
    .await?;
    Ok(Json(project))
}

pub async fn project_status_handler(
    State(state): State<Arc<ServerState>>,
    Path(id): Path<String>,
) -> Result<Json<StackStatus>, ApiError> {
    let manager = state.manager.clone();
    let status = run_detached(&state.shutdown, move |cancel| async move {
        manager.status(&id, &cancel).await
    })
    .await?;
    Ok(Json(status))
}

pub async fn project_config_handler(
    State(state): State<Arc<ServerState>>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let manager = state.manager.clone();
    let config = run_detached(&state.shutdown, move |cancel| async move {
        manager.config(&id, &cancel).await
    })
    .await?;
    Ok(([(header::CONTENT_TYPE, "application/yaml")], config))
}

pub async fn project_logs_handler(
    State(state): State<Arc<ServerState>>,
    Path(id): Path<String>,
    Query(query): Query<LogsQuery>,
) -> Result<Response, ApiError> {
    state.manager.get(&id).await?;
    let manager = state.manager.clone();
    let query = LogQuery {
        follow: query.follow,
        tail: query.tail,
    };
    Ok(stream_operation(&state.shutdown, move |sink, cancel| async move {
        match manager.logs(&id, query, sink, &cancel).await {
            Ok(_) => StreamEvent::Done,
            Err(e) if e.is_cancelled() => StreamEvent::Done,
            Err(e) => StreamEvent::Error(ErrorBody::from(&e)),
        }
    }))
}

pub async fn list_deployments_handler(
    State(state): State<Arc<ServerState>>,
    Path(id): Path<String>,
) -> Result<Json<Vec<Deployment>>, ApiError> {
    Ok(Json(state.manager.deployments(&id).await?))
}

pub async fn get_deployment_handler(
    State(state): State<Arc<ServerState>>,
    Path(id): Path<String>,
) -> Result<Json<Deployment>, ApiError> {
    Ok(Json(state.manager.deployment(&id).await?))
}

pub async fn test_auth_handler(
    State(state): State<Arc<ServerState>>,
    Json(request): Json<TestAuthRequest>,
) -> Result<Json<TestAuthResponse>, ApiError> {
    if !is_valid_git_url(&request.git_url) {
        return Err(StackError::ValidationError(format!(
            "invalid git url: {}",
            request.git_url
        ))
        .into());
    }

    let auth = request.auth.map(GitAuth::from);
    match state
        .manager
        .test_authentication(&request.git_url, auth.as_ref())
        .await
    {
        Ok(()) => Ok(Json(TestAuthResponse {
            authenticated: true,
            error: None,
        })),
        Err(StackError::Git(e)) => Ok(Json(TestAuthResponse {
            authenticated: false,
            error: Some(e.to_string()),
        })),
        Err(e) => Err(e.into()),
    }
}
