//! Reconciliation worker: keeps stored status in line with the engine and
//! redeploys watched projects whose branch moved

use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

use tracing::{debug, error, info, warn};

use crate::deploy::cancel::CancelToken;
use crate::deploy::manager::{DriftCheck, ProjectManager, StatusSync};
use crate::errors::StackError;

/// Watcher worker options
#[derive(Debug, Clone)]
pub struct Options {
    /// Time between two cycles
    pub interval: Duration,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(60),
        }
    }
}

/// What one cycle did
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CycleReport {
    pub checked: usize,
    pub status_updates: usize,
    pub deployed: usize,
    pub failed: usize,
}

/// Run the watcher until `shutdown_signal` resolves. The first cycle starts
/// immediately. A cycle in progress at shutdown is cancelled and allowed to
/// wind down.
pub async fn run<S, F>(
    options: &Options,
    manager: &ProjectManager,
    sleep_fn: S,
    mut shutdown_signal: Pin<Box<dyn Future<Output = ()> + Send>>,
) where
    S: Fn(Duration) -> F,
    F: Future<Output = ()>,
{
    info!("Watcher starting, checking every {:?}", options.interval);
    let cancel = CancelToken::new();

    loop {
        let cycle = check_once(manager, &cancel);
        tokio::pin!(cycle);

        let report = tokio::select! {
            report = &mut cycle => report,
            _ = &mut shutdown_signal => {
                info!("Watcher shutting down, cancelling current cycle...");
                cancel.cancel();
                let report = cycle.await;
                debug!("Interrupted cycle: {:?}", report);
                return;
            }
        };

        if report.status_updates > 0 || report.deployed > 0 || report.failed > 0 {
            info!(
                "Watcher cycle: {} checked, {} status updates, {} deployed, {} failed",
                report.checked, report.status_updates, report.deployed, report.failed
            );
        } else {
            debug!("Watcher cycle: {} checked, nothing to do", report.checked);
        }

        tokio::select! {
            _ = &mut shutdown_signal => {
                info!("Watcher shutting down...");
                return;
            }
            _ = sleep_fn(options.interval) => {}
        }
    }
}

/// One pass over every project: status sync first, then drift check. A
/// failing project never stops the pass.
pub async fn check_once(manager: &ProjectManager, cancel: &CancelToken) -> CycleReport {
    let mut report = CycleReport::default();

    let projects = match manager.list().await {
        Ok(projects) => projects,
        Err(e) => {
            error!("Watcher failed to list projects: {}", e);
            return report;
        }
    };

    for project in projects {
        if cancel.is_cancelled() {
            debug!("Watcher cycle cancelled");
            break;
        }
        report.checked += 1;

        match manager.reconcile_status(&project.id, cancel).await {
            Ok(StatusSync::Unchanged(_)) => {}
            Ok(StatusSync::Updated { .. }) => report.status_updates += 1,
            Ok(StatusSync::Unreachable { error, updated }) => {
                if updated {
                    report.status_updates += 1;
                }
                warn!("Cannot query status of {}: {}", project.name, error);
                continue;
            }
            Ok(StatusSync::Busy) => {
                debug!("{} is busy, skipping", project.name);
                continue;
            }
            Err(StackError::NotFound(_)) => continue,
            Err(e) => {
                report.failed += 1;
                warn!("Status sync of {} failed: {}", project.name, e);
                continue;
            }
        }

        match manager.check_drift(&project.id, cancel).await {
            Ok(DriftCheck::Deployed { commit }) => {
                report.deployed += 1;
                info!("Redeployed {} at {}", project.name, commit);
            }
            Ok(DriftCheck::Busy) => debug!("{} is busy, skipping drift check", project.name),
            Ok(DriftCheck::Skipped | DriftCheck::InSync) => {}
            Err(StackError::NotFound(_)) => {}
            Err(e) => {
                report.failed += 1;
                error!("Drift check of {} failed: {}", project.name, e);
            }
        }
    }

    report
}
