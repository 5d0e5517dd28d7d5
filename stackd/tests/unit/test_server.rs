//! HTTP API tests

use std::sync::Arc;

use axum::body::{to_bytes, Body};
use axum::http::{Request, StatusCode};
use axum::Router;
use serde_json::{json, Value};
use tower::ServiceExt;

use stackd::deploy::cancel::CancelToken;
use stackd::deploy::git::GitError;
use stackd::server::serve::router;
use stackd::server::state::ServerState;

use crate::common::*;

fn app(h: &Harness) -> Router {
    router(Arc::new(ServerState::new(
        h.manager.clone(),
        CancelToken::new(),
    )))
}

async fn send(app: Router, method: &str, uri: &str, body: Option<Value>) -> (StatusCode, Vec<u8>) {
    let builder = Request::builder().method(method).uri(uri);
    let request = match body {
        Some(body) => builder
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap(),
        None => builder.body(Body::empty()).unwrap(),
    };
    let response = app.oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    (status, bytes.to_vec())
}

fn json_body(bytes: &[u8]) -> Value {
    serde_json::from_slice(bytes).unwrap()
}

fn ndjson(bytes: &[u8]) -> Vec<Value> {
    String::from_utf8_lossy(bytes)
        .lines()
        .map(|line| serde_json::from_str(line).unwrap())
        .collect()
}

fn create_request(name: &str) -> Value {
    json!({
        "name": name,
        "git_url": format!("https://git.example.com/org/{name}.git"),
        "auth": {"kind": "http", "username": "bot", "password": "s3cret"},
        "compose_files": ["compose.yml"],
    })
}

#[tokio::test]
async fn test_health() {
    let h = Harness::new().await;
    let (status, body) = send(app(&h), "GET", "/health", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json_body(&body)["status"], "healthy");
}

#[tokio::test]
async fn test_create_and_get_project() {
    let h = Harness::new().await;
    let (status, body) = send(app(&h), "POST", "/projects", Some(create_request("web"))).await;
    assert_eq!(status, StatusCode::CREATED);

    let created = json_body(&body);
    assert_eq!(created["git_branch"], "main");
    assert_eq!(created["auth"], "http");
    assert_eq!(created["watch_enabled"], true);
    assert!(!String::from_utf8_lossy(&body).contains("s3cret"));

    let uri = format!("/projects/{}", created["id"].as_str().unwrap());
    let (status, body) = send(app(&h), "GET", &uri, None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json_body(&body)["name"], "web");

    let (status, body) = send(app(&h), "GET", "/projects", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json_body(&body).as_array().unwrap().len(), 1);
}

#[tokio::test]
async fn test_error_statuses() {
    let h = Harness::new().await;
    h.create("web").await;

    let (status, body) = send(app(&h), "GET", "/projects/missing", None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert!(json_body(&body)["error"].is_string());

    let (status, _) = send(app(&h), "POST", "/projects", Some(create_request("web"))).await;
    assert_eq!(status, StatusCode::CONFLICT);

    let mut invalid = create_request("api");
    invalid["compose_files"] = json!([]);
    let (status, _) = send(app(&h), "POST", "/projects", Some(invalid)).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_deploy_streams_output_then_result() {
    let h = Harness::new().await;
    let project = h.create("web").await;
    h.compose.set_lines(&["Pulling web", "Container web-1 Started"]);

    let uri = format!("/projects/{}/deploy", project.id);
    let (status, body) = send(app(&h), "POST", &uri, None).await;
    assert_eq!(status, StatusCode::OK);

    let events = ndjson(&body);
    assert_eq!(events.len(), 3);
    assert_eq!(events[0]["type"], "output");
    assert_eq!(events[0]["stream"], "stdout");
    assert_eq!(events[0]["line"], "Pulling web");
    assert_eq!(events[2]["type"], "result");
    assert_eq!(events[2]["deployment"]["status"], "completed");
}

#[tokio::test]
async fn test_failed_deploy_streams_error_with_output() {
    let h = Harness::new().await;
    let project = h.create("web").await;
    h.compose.set_up_fails(true);

    let uri = format!("/projects/{}/deploy", project.id);
    let (_, body) = send(app(&h), "POST", &uri, None).await;

    let events = ndjson(&body);
    let last = events.last().unwrap();
    assert_eq!(last["type"], "error");
    assert_eq!(last["stderr"], "image not found");
}

#[tokio::test]
async fn test_deploy_unknown_project_is_not_found() {
    let h = Harness::new().await;
    let (status, _) = send(app(&h), "POST", "/projects/missing/deploy", None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_update_and_remove_project() {
    let h = Harness::new().await;
    let project = h.create("web").await;
    let uri = format!("/projects/{}", project.id);

    let (status, body) = send(
        app(&h),
        "PATCH",
        &uri,
        Some(json!({"watch_enabled": false, "clear_auth": true})),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json_body(&body)["watch_enabled"], false);

    let (status, _) = send(app(&h), "DELETE", &format!("{uri}?volumes=true"), None).await;
    assert_eq!(status, StatusCode::NO_CONTENT);

    let (status, _) = send(app(&h), "GET", &uri, None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_deployment_history_endpoints() {
    let h = Harness::new().await;
    let project = h.create("web").await;
    let uri = format!("/projects/{}/deploy", project.id);
    send(app(&h), "POST", &uri, None).await;

    let (status, body) = send(
        app(&h),
        "GET",
        &format!("/projects/{}/deployments", project.id),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    let history = json_body(&body);
    let id = history[0]["id"].as_str().unwrap().to_string();

    let (status, body) = send(app(&h), "GET", &format!("/deployments/{id}"), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json_body(&body)["commit_hash"], FIRST_COMMIT);
}

#[tokio::test]
async fn test_logs_stream_ends_with_done() {
    let h = Harness::new().await;
    let project = h.create("web").await;
    h.compose.set_lines(&["web-1  | listening on :8080"]);

    let uri = format!("/projects/{}/logs?tail=10", project.id);
    let (status, body) = send(app(&h), "GET", &uri, None).await;
    assert_eq!(status, StatusCode::OK);

    let events = ndjson(&body);
    assert_eq!(events[0]["line"], "web-1  | listening on :8080");
    assert_eq!(events.last().unwrap()["type"], "done");
}

#[tokio::test]
async fn test_following_logs_end_on_shutdown() {
    let h = Harness::new().await;
    let project = h.create("web").await;
    let shutdown = CancelToken::new();
    let app = router(Arc::new(ServerState::new(h.manager.clone(), shutdown.clone())));

    let uri = format!("/projects/{}/logs?follow=true", project.id);
    let request = send(app, "GET", &uri, None);
    tokio::spawn(async move {
        tokio::time::sleep(std::time::Duration::from_millis(100)).await;
        shutdown.cancel();
    });

    let (status, body) = tokio::time::timeout(std::time::Duration::from_secs(5), request)
        .await
        .unwrap();
    assert_eq!(status, StatusCode::OK);
    assert_eq!(ndjson(&body).last().unwrap()["type"], "done");
}

#[tokio::test]
async fn test_auth_check_reports_failure() {
    let h = Harness::new().await;
    let request = json!({"git_url": "https://git.example.com/org/private.git"});

    let (status, body) = send(app(&h), "POST", "/git/test-auth", Some(request.clone())).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json_body(&body)["authenticated"], true);

    h.git.fail_auth(GitError::AuthenticationFailed);
    let (status, body) = send(app(&h), "POST", "/git/test-auth", Some(request)).await;
    assert_eq!(status, StatusCode::OK);
    let body = json_body(&body);
    assert_eq!(body["authenticated"], false);
    assert_eq!(body["error"], "Authentication failed");

    let (status, _) = send(
        app(&h),
        "POST",
        "/git/test-auth",
        Some(json!({"git_url": "not a url"})),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}
