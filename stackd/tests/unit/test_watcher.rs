//! Reconciliation watcher tests

use std::time::Duration;

use stackd::deploy::cancel::CancelToken;
use stackd::deploy::compose::ComposeAction;
use stackd::deploy::manager::DeployOptions;
use stackd::models::deployment::DeploymentStatus;
use stackd::models::project::{NewProject, ProjectStatus};
use stackd::workers::watcher::{self, check_once, CycleReport};

use crate::common::*;

#[tokio::test]
async fn test_drift_is_deployed_once() {
    let h = Harness::new().await;
    let project = h.create("web").await;
    h.manager
        .deploy(&project.id, DeployOptions::default())
        .await
        .unwrap();
    h.compose.set_ps(RUNNING_PS);
    h.git.push("main", SECOND_COMMIT);

    let cancel = CancelToken::new();
    let report = check_once(&h.manager, &cancel).await;
    assert_eq!(report.checked, 1);
    assert_eq!(report.deployed, 1);
    assert_eq!(report.failed, 0);

    let project = h.manager.get(&project.id).await.unwrap();
    assert_eq!(project.last_commit.as_deref(), Some(SECOND_COMMIT));

    let report = check_once(&h.manager, &cancel).await;
    assert_eq!(report.deployed, 0);
    assert_eq!(h.manager.deployments(&project.id).await.unwrap().len(), 2);
}

#[tokio::test]
async fn test_quiet_cycle_writes_nothing() {
    let h = Harness::new().await;
    let project = h.create("web").await;
    h.manager
        .deploy(&project.id, DeployOptions::default())
        .await
        .unwrap();
    h.compose.set_ps(RUNNING_PS);

    let writes = h.store.writes();
    let report = check_once(&h.manager, &CancelToken::new()).await;
    assert_eq!(
        report,
        CycleReport {
            checked: 1,
            ..Default::default()
        }
    );
    assert_eq!(h.store.writes(), writes);
}

#[tokio::test]
async fn test_stopped_project_is_not_deployed() {
    let h = Harness::new().await;
    let project = h.create("web").await;
    h.git.push("main", SECOND_COMMIT);

    let report = check_once(&h.manager, &CancelToken::new()).await;
    assert_eq!(report.checked, 1);
    assert_eq!(report.deployed, 0);
    assert_eq!(
        h.manager.get(&project.id).await.unwrap().status,
        ProjectStatus::Stopped
    );
    assert_eq!(h.compose.count(|a| *a == ComposeAction::Up), 0);
}

#[tokio::test]
async fn test_unwatched_project_is_not_deployed() {
    let h = Harness::new().await;
    let project = h
        .manager
        .create(NewProject {
            watch_enabled: false,
            ..new_project("web")
        })
        .await
        .unwrap();
    h.manager
        .deploy(&project.id, DeployOptions::default())
        .await
        .unwrap();
    h.compose.set_ps(RUNNING_PS);
    h.git.push("main", SECOND_COMMIT);

    let report = check_once(&h.manager, &CancelToken::new()).await;
    assert_eq!(report.deployed, 0);
    assert_eq!(h.compose.count(|a| *a == ComposeAction::Up), 1);
    assert_eq!(
        h.manager.get(&project.id).await.unwrap().last_commit.as_deref(),
        Some(FIRST_COMMIT)
    );
}

#[tokio::test]
async fn test_project_in_error_is_redeployed() {
    let h = Harness::new().await;
    let project = h.create("web").await;
    h.compose.set_up_fails(true);
    assert!(h
        .manager
        .deploy(&project.id, DeployOptions::default())
        .await
        .is_err());

    h.compose.set_up_fails(false);
    h.compose.set_ps(PARTIAL_PS);
    let report = check_once(&h.manager, &CancelToken::new()).await;
    assert_eq!(report.deployed, 1);

    let project = h.manager.get(&project.id).await.unwrap();
    assert_eq!(project.status, ProjectStatus::Running);
    let history = h.manager.deployments(&project.id).await.unwrap();
    assert_eq!(history[0].status, DeploymentStatus::Completed);
    assert_eq!(history[1].status, DeploymentStatus::Failed);
}

#[tokio::test]
async fn test_failing_project_does_not_stop_cycle() {
    let h = Harness::new().await;
    let broken = h
        .manager
        .create(NewProject {
            git_branch: "feature".to_string(),
            ..new_project("broken")
        })
        .await;
    // The branch does not exist yet
    assert!(broken.is_err());

    h.git.push("feature", FIRST_COMMIT);
    let broken = h
        .manager
        .create(NewProject {
            git_branch: "feature".to_string(),
            ..new_project("broken")
        })
        .await
        .unwrap();
    let healthy = h.create("healthy").await;
    for id in [&broken.id, &healthy.id] {
        h.manager.deploy(id, DeployOptions::default()).await.unwrap();
    }

    h.compose.set_ps(RUNNING_PS);
    h.git.delete_branch("feature");
    h.git.push("main", SECOND_COMMIT);

    let report = check_once(&h.manager, &CancelToken::new()).await;
    assert_eq!(report.checked, 2);
    assert_eq!(report.failed, 1);
    assert_eq!(report.deployed, 1);
    assert_eq!(
        h.manager.get(&healthy.id).await.unwrap().last_commit.as_deref(),
        Some(SECOND_COMMIT)
    );
}

#[tokio::test]
async fn test_cancelled_cycle_checks_nothing() {
    let h = Harness::new().await;
    h.create("web").await;

    let cancel = CancelToken::new();
    cancel.cancel();
    let report = check_once(&h.manager, &cancel).await;
    assert_eq!(report.checked, 0);
    assert!(h.compose.calls().is_empty());
}

#[tokio::test]
async fn test_run_stops_on_shutdown() {
    let h = Harness::new().await;
    h.create("web").await;
    h.compose.set_ps(RUNNING_PS);

    let options = watcher::Options {
        interval: Duration::from_secs(3600),
    };
    let shutdown = Box::pin(tokio::time::sleep(Duration::from_millis(100)));
    tokio::time::timeout(
        Duration::from_secs(5),
        watcher::run(&options, &h.manager, tokio::time::sleep, shutdown),
    )
    .await
    .unwrap();

    // The first cycle runs right away
    assert_eq!(h.compose.count(|a| *a == ComposeAction::Ps), 1);
}
