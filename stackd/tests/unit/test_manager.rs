//! Project lifecycle tests

use std::time::Duration;

use stackd::deploy::cancel::CancelToken;
use stackd::deploy::compose::{ComposeAction, ComposeError};
use stackd::deploy::git::GitError;
use stackd::deploy::manager::{CommandTimeouts, DeployOptions, StatusSync};
use stackd::errors::StackError;
use stackd::models::deployment::{Deployment, DeploymentStatus};
use stackd::models::project::{ProjectStatus, ProjectUpdate};
use stackd::store::Persistence;
use tokio_test::{assert_err, assert_ok};

use crate::common::*;

#[tokio::test]
async fn test_create_resolves_default_branch() {
    let h = Harness::new().await;
    let project = h.create("web").await;

    assert_eq!(project.git_branch, "main");
    assert_eq!(project.status, ProjectStatus::Stopped);
    assert_eq!(project.last_commit.as_deref(), Some(FIRST_COMMIT));
    assert!(project.git_dir().exists());
    assert!(h.compose.calls().is_empty());

    let listed = h.manager.list().await.unwrap();
    assert_eq!(listed.len(), 1);
    assert_eq!(listed[0].id, project.id);
    assert_eq!(h.manager.get_by_name("web").await.unwrap().id, project.id);
}

#[tokio::test]
async fn test_list_keeps_creation_order() {
    let h = Harness::new().await;
    let names = ["api", "web", "db"];
    for name in names {
        h.create(name).await;
    }

    let listed: Vec<String> = h
        .manager
        .list()
        .await
        .unwrap()
        .into_iter()
        .map(|p| p.name)
        .collect();
    assert_eq!(listed, names);
}

#[tokio::test]
async fn test_create_with_missing_branch_leaves_nothing_behind() {
    let h = Harness::new().await;
    let mut new = new_project("web");
    new.git_branch = "release".to_string();

    let err = h.manager.create(new).await.unwrap_err();
    assert!(matches!(
        err,
        StackError::Git(GitError::BranchNotFound(ref b)) if b == "release"
    ));
    assert!(h.manager.list().await.unwrap().is_empty());
    let leftovers = std::fs::read_dir(h.layout.projects_dir().path())
        .unwrap()
        .count();
    assert_eq!(leftovers, 0);
}

#[tokio::test]
async fn test_create_rejects_duplicate_name() {
    let h = Harness::new().await;
    h.create("web").await;

    let err = assert_err!(h.manager.create(new_project("web")).await);
    assert!(matches!(err, StackError::NameTaken(_)));
}

#[tokio::test]
async fn test_create_reports_auth_failure() {
    let h = Harness::new().await;
    h.git.fail_auth(GitError::AuthenticationRequired);

    let err = h.manager.create(new_project("web")).await.unwrap_err();
    assert!(matches!(
        err,
        StackError::Git(GitError::AuthenticationRequired)
    ));
}

#[tokio::test]
async fn test_deploy_pulls_and_records_history() {
    let h = Harness::new().await;
    let project = h.create("web").await;

    let first = h
        .manager
        .deploy(&project.id, DeployOptions::default())
        .await
        .unwrap();
    assert_eq!(first.status, DeploymentStatus::Completed);
    assert_eq!(first.commit_hash, FIRST_COMMIT);
    assert!(first.stdout.contains("Container web-1 Started"));

    h.git.push("main", SECOND_COMMIT);
    let second = h
        .manager
        .deploy(&project.id, DeployOptions::default())
        .await
        .unwrap();
    assert_eq!(second.commit_hash, SECOND_COMMIT);

    let project = h.manager.get(&project.id).await.unwrap();
    assert_eq!(project.status, ProjectStatus::Running);
    assert_eq!(project.last_commit.as_deref(), Some(SECOND_COMMIT));

    let history = h.manager.deployments(&project.id).await.unwrap();
    let ids: Vec<&str> = history.iter().map(|d| d.id.as_str()).collect();
    assert_eq!(ids, vec![second.id.as_str(), first.id.as_str()]);
    assert_eq!(h.compose.count(|a| *a == ComposeAction::Up), 2);
}

#[tokio::test]
async fn test_deploy_without_pull_keeps_checkout() {
    let h = Harness::new().await;
    let project = h.create("web").await;
    h.git.push("main", SECOND_COMMIT);

    let options = DeployOptions {
        pull: false,
        ..Default::default()
    };
    let deployment = h.manager.deploy(&project.id, options).await.unwrap();
    assert_eq!(deployment.commit_hash, FIRST_COMMIT);
}

#[tokio::test]
async fn test_failed_deploy_keeps_diagnostics() {
    let h = Harness::new().await;
    let project = h.create("web").await;
    h.compose.set_up_fails(true);

    let err = h
        .manager
        .deploy(&project.id, DeployOptions::default())
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        StackError::Compose(ComposeError::Failed { code: Some(1), .. })
    ));

    let project = h.manager.get(&project.id).await.unwrap();
    assert_eq!(project.status, ProjectStatus::Error);

    let history = h.manager.deployments(&project.id).await.unwrap();
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].status, DeploymentStatus::Failed);
    assert_eq!(history[0].stderr, "image not found");
    assert!(history[0].stdout.contains("Container web-1 Started"));
}

#[tokio::test]
async fn test_cancelled_deploy_leaves_status_alone() {
    let h = Harness::new().await;
    let project = h.create("web").await;
    h.compose.set_hang(true);

    let cancel = CancelToken::new();
    cancel.cancel();
    let options = DeployOptions {
        cancel,
        ..Default::default()
    };
    let err = assert_err!(h.manager.deploy(&project.id, options).await);
    assert!(err.is_cancelled());

    let project = h.manager.get(&project.id).await.unwrap();
    assert_eq!(project.status, ProjectStatus::Stopped);
    let history = h.manager.deployments(&project.id).await.unwrap();
    assert_eq!(history[0].status, DeploymentStatus::Failed);
}

#[tokio::test]
async fn test_deploy_timeout_marks_error() {
    let h = Harness::with_timeouts(CommandTimeouts {
        up: Duration::from_millis(50),
        ..Default::default()
    })
    .await;
    let project = h.create("web").await;
    h.compose.set_hang(true);

    let err = h
        .manager
        .deploy(&project.id, DeployOptions::default())
        .await
        .unwrap_err();
    assert!(err.is_cancelled());
    assert_eq!(
        h.manager.get(&project.id).await.unwrap().status,
        ProjectStatus::Error
    );
}

#[tokio::test]
async fn test_deploy_reclones_missing_checkout() {
    let h = Harness::new().await;
    let project = h.create("web").await;
    std::fs::remove_dir_all(project.git_dir()).unwrap();

    let deployment = h
        .manager
        .deploy(&project.id, DeployOptions::default())
        .await
        .unwrap();
    assert_eq!(deployment.status, DeploymentStatus::Completed);
    assert!(project.git_dir().exists());
}

#[tokio::test]
async fn test_stop_takes_stack_down() {
    let h = Harness::new().await;
    let project = h.create("web").await;
    h.manager
        .deploy(&project.id, DeployOptions::default())
        .await
        .unwrap();

    let stopped = h
        .manager
        .stop(
            &project.id,
            stackd::deploy::process::OutputSink::Buffer,
            &CancelToken::new(),
        )
        .await
        .unwrap();
    assert_eq!(stopped.status, ProjectStatus::Stopped);
    assert_eq!(
        h.compose.calls().last(),
        Some(&ComposeAction::Down {
            remove_volumes: false
        })
    );
}

#[tokio::test]
async fn test_remove_forgets_project_and_history() {
    let h = Harness::new().await;
    let project = h.create("web").await;
    let deployment = h
        .manager
        .deploy(&project.id, DeployOptions::default())
        .await
        .unwrap();

    h.manager
        .remove(&project.id, true, &CancelToken::new())
        .await
        .unwrap();

    assert!(matches!(
        h.manager.get(&project.id).await,
        Err(StackError::NotFound(_))
    ));
    assert!(matches!(
        h.manager.deployment(&deployment.id).await,
        Err(StackError::NotFound(_))
    ));
    assert!(!project.working_dir.exists());
    assert_eq!(
        h.compose.calls().last(),
        Some(&ComposeAction::Down {
            remove_volumes: true
        })
    );

    let moved: Vec<String> = std::fs::read_dir(h.layout.projects_dir().path())
        .unwrap()
        .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
        .collect();
    assert_eq!(moved.len(), 1);
    assert!(moved[0].starts_with(&format!("deleted-{}", project.id)));

    // The name is free again
    h.create("web").await;
}

#[tokio::test]
async fn test_update_validates_and_persists() {
    let h = Harness::new().await;
    let project = h.create("web").await;

    let update = ProjectUpdate {
        compose_files: Some(vec![]),
        ..Default::default()
    };
    assert!(matches!(
        h.manager.update(&project.id, update).await,
        Err(StackError::ValidationError(_))
    ));

    let update = ProjectUpdate {
        watch_enabled: Some(false),
        variables: Some(vec!["MODE=prod".to_string()]),
        ..Default::default()
    };
    assert_ok!(h.manager.update(&project.id, update).await);

    let stored = h.manager.get(&project.id).await.unwrap();
    assert!(!stored.watch_enabled);
    assert_eq!(stored.variables, vec!["MODE=prod"]);
}

#[tokio::test]
async fn test_recover_interrupted_deployments() {
    let h = Harness::new().await;
    let project = h.create("web").await;
    let stale = Deployment::start(&project.id, FIRST_COMMIT);
    h.store.create_deployment(&stale).await.unwrap();

    assert_eq!(h.manager.recover_interrupted().await.unwrap(), 1);
    assert_eq!(
        h.manager.deployment(&stale.id).await.unwrap().status,
        DeploymentStatus::Unknown
    );
    assert_eq!(h.manager.recover_interrupted().await.unwrap(), 0);
}

#[tokio::test]
async fn test_reconcile_status_is_idempotent() {
    let h = Harness::new().await;
    let project = h.create("web").await;
    h.compose.set_ps(RUNNING_PS);
    let cancel = CancelToken::new();

    let sync = h.manager.reconcile_status(&project.id, &cancel).await.unwrap();
    assert_eq!(
        sync,
        StatusSync::Updated {
            from: ProjectStatus::Stopped,
            to: ProjectStatus::Running
        }
    );

    let writes = h.store.writes();
    let sync = h.manager.reconcile_status(&project.id, &cancel).await.unwrap();
    assert_eq!(sync, StatusSync::Unchanged(ProjectStatus::Running));
    assert_eq!(h.store.writes(), writes);
}

#[tokio::test]
async fn test_reconcile_unreachable_engine() {
    let h = Harness::new().await;
    let project = h.create("web").await;
    h.compose.set_ps_error("Cannot connect to the Docker daemon");

    let sync = h
        .manager
        .reconcile_status(&project.id, &CancelToken::new())
        .await
        .unwrap();
    assert!(matches!(
        sync,
        StatusSync::Unreachable { updated: true, .. }
    ));
    assert_eq!(
        h.manager.get(&project.id).await.unwrap().status,
        ProjectStatus::Unknown
    );
}

#[tokio::test]
async fn test_reconcile_hung_engine_marks_unknown() {
    let h = Harness::with_timeouts(CommandTimeouts {
        query: Duration::from_millis(50),
        ..Default::default()
    })
    .await;
    let project = h.create("web").await;
    let cancel = CancelToken::new();

    h.compose.set_ps(RUNNING_PS);
    assert_ok!(h.manager.reconcile_status(&project.id, &cancel).await);
    assert_eq!(
        h.manager.get(&project.id).await.unwrap().status,
        ProjectStatus::Running
    );

    h.compose.set_ps_hang(true);
    let sync = h.manager.reconcile_status(&project.id, &cancel).await.unwrap();
    assert!(matches!(
        sync,
        StatusSync::Unreachable { updated: true, .. }
    ));
    assert_eq!(
        h.manager.get(&project.id).await.unwrap().status,
        ProjectStatus::Unknown
    );
}

#[tokio::test]
async fn test_reconcile_cancelled_by_caller_keeps_status() {
    let h = Harness::new().await;
    let project = h.create("web").await;
    h.compose.set_ps_hang(true);

    let cancel = CancelToken::new();
    cancel.cancel();
    let err = assert_err!(h.manager.reconcile_status(&project.id, &cancel).await);
    assert!(err.is_cancelled());
    assert_eq!(
        h.manager.get(&project.id).await.unwrap().status,
        ProjectStatus::Stopped
    );
}

#[tokio::test]
async fn test_reconcile_skips_busy_project() {
    let h = Harness::new().await;
    let project = h.create("web").await;
    h.compose.set_hang(true);

    let cancel = CancelToken::new();
    let manager = h.manager.clone();
    let id = project.id.clone();
    let options = DeployOptions {
        cancel: cancel.clone(),
        ..Default::default()
    };
    let deploy = tokio::spawn(async move { manager.deploy(&id, options).await });

    let compose = h.compose.clone();
    eventually(|| compose.count(|a| *a == ComposeAction::Up) == 1).await;

    let sync = h
        .manager
        .reconcile_status(&project.id, &CancelToken::new())
        .await
        .unwrap();
    assert_eq!(sync, StatusSync::Busy);

    cancel.cancel();
    let result = deploy.await.unwrap();
    assert!(result.unwrap_err().is_cancelled());
}

#[tokio::test]
async fn test_config_and_status_queries() {
    let h = Harness::new().await;
    let project = h.create("web").await;
    h.compose.set_ps(PARTIAL_PS);
    let cancel = CancelToken::new();

    let config = h.manager.config(&project.id, &cancel).await.unwrap();
    assert!(config.contains("image: nginx"));

    let status = h.manager.status(&project.id, &cancel).await.unwrap();
    assert_eq!(status.services.len(), 2);

    assert!(matches!(
        h.manager.status("missing", &cancel).await,
        Err(StackError::NotFound(_))
    ));
}
