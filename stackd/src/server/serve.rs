//! HTTP server setup

use std::future::Future;
use std::sync::Arc;

use axum::{
    routing::{get, post},
    Router,
};
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::app::options::ServerOptions;
use crate::errors::StackError;
use crate::server::handlers::{
    create_project_handler, deploy_project_handler, get_deployment_handler, get_project_handler,
    health_handler, list_deployments_handler, list_projects_handler, project_config_handler,
    project_logs_handler, project_status_handler, remove_project_handler, stop_project_handler,
    test_auth_handler, update_project_handler, version_handler,
};
use crate::server::state::ServerState;

/// All routes with their state and middleware
pub fn router(state: Arc<ServerState>) -> Router {
    Router::new()
        // Health and version
        .route("/health", get(health_handler))
        .route("/version", get(version_handler))
        // Projects
        .route(
            "/projects",
            get(list_projects_handler).post(create_project_handler),
        )
        .route(
            "/projects/{id}",
            get(get_project_handler)
                .patch(update_project_handler)
                .delete(remove_project_handler),
        )
        .route("/projects/{id}/deploy", post(deploy_project_handler))
        .route("/projects/{id}/stop", post(stop_project_handler))
        .route("/projects/{id}/status", get(project_status_handler))
        .route("/projects/{id}/config", get(project_config_handler))
        .route("/projects/{id}/logs", get(project_logs_handler))
        .route("/projects/{id}/deployments", get(list_deployments_handler))
        // Deployments
        .route("/deployments/{id}", get(get_deployment_handler))
        // Git
        .route("/git/test-auth", post(test_auth_handler))
        // State and middleware
        .with_state(state)
        .layer(TraceLayer::new_for_http())
}

/// Start the HTTP server
pub async fn serve(
    options: &ServerOptions,
    state: Arc<ServerState>,
    shutdown_signal: impl Future<Output = ()> + Send + 'static,
) -> Result<JoinHandle<Result<(), StackError>>, StackError> {
    let app = router(state);

    let addr = format!("{}:{}", options.host, options.port);
    info!("Starting HTTP server on {}", addr);

    let listener = TcpListener::bind(&addr)
        .await
        .map_err(|e| StackError::ServerError(e.to_string()))?;

    let handle = tokio::spawn(async move {
        axum::serve(listener, app)
            .with_graceful_shutdown(shutdown_signal)
            .await
            .map_err(|e| StackError::ServerError(e.to_string()))
    });

    Ok(handle)
}
