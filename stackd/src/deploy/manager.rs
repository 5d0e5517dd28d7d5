//! Project lifecycle: create, deploy, stop, remove and reconcile projects

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tracing::{debug, info, warn};

use crate::deploy::cancel::{CancelReason, CancelToken};
use crate::deploy::compose::{ComposeError, ComposeProject, ComposeRunner, StackStatus};
use crate::deploy::fsm::{self, DeploymentEvent, ProjectEvent};
use crate::deploy::git::GitClient;
use crate::deploy::lock::ProjectLocks;
use crate::deploy::process::{CommandOutput, OutputSink};
use crate::errors::StackError;
use crate::filesys::dir::Dir;
use crate::models::deployment::{Deployment, DeploymentStatus};
use crate::models::project::{GitAuth, NewProject, Project, ProjectStatus, ProjectUpdate};
use crate::storage::layout::StorageLayout;
use crate::store::Persistence;
use crate::utils::{generate_uuid, redact_url};

/// Limits applied to compose commands on top of the caller's cancel token
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CommandTimeouts {
    pub up: Duration,
    pub down: Duration,

    /// `ps`, `config` and non-following `logs`
    pub query: Duration,
}

impl Default for CommandTimeouts {
    fn default() -> Self {
        Self {
            up: Duration::from_secs(900),
            down: Duration::from_secs(300),
            query: Duration::from_secs(60),
        }
    }
}

/// How to run a deployment
#[derive(Debug, Clone)]
pub struct DeployOptions {
    /// Pull the branch before deploying
    pub pull: bool,
    pub sink: OutputSink,
    pub cancel: CancelToken,
}

impl Default for DeployOptions {
    fn default() -> Self {
        Self {
            pull: true,
            sink: OutputSink::Buffer,
            cancel: CancelToken::new(),
        }
    }
}

/// Which logs to fetch
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LogQuery {
    pub follow: bool,
    pub tail: Option<u32>,
}

/// Outcome of synchronizing a project's stored status with the engine
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StatusSync {
    Unchanged(ProjectStatus),
    Updated {
        from: ProjectStatus,
        to: ProjectStatus,
    },

    /// The engine could not be queried; `updated` is set when the stored
    /// status moved to `Unknown`
    Unreachable { error: String, updated: bool },

    /// Another operation holds the project
    Busy,
}

/// Outcome of comparing a project's deployed commit with its remote branch
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DriftCheck {
    /// Watching is disabled or the project is stopped
    Skipped,
    Busy,
    InSync,
    Deployed { commit: String },
}

/// Entry point for every operation on projects
pub struct ProjectManager {
    store: Arc<dyn Persistence>,
    git: Arc<dyn GitClient>,
    compose: Arc<dyn ComposeRunner>,
    layout: StorageLayout,
    timeouts: CommandTimeouts,
    locks: ProjectLocks,
}

impl ProjectManager {
    pub fn new(
        store: Arc<dyn Persistence>,
        git: Arc<dyn GitClient>,
        compose: Arc<dyn ComposeRunner>,
        layout: StorageLayout,
        timeouts: CommandTimeouts,
    ) -> Self {
        Self {
            store,
            git,
            compose,
            layout,
            timeouts,
            locks: ProjectLocks::new(),
        }
    }

    /// Clone the repository and register the project. Nothing is deployed.
    pub async fn create(&self, new: NewProject) -> Result<Project, StackError> {
        new.validate()?;
        if self.store.find_project_by_name(&new.name).await?.is_some() {
            return Err(StackError::NameTaken(new.name));
        }

        let branch = match new.git_branch.trim() {
            "" => {
                let branch = self
                    .git
                    .default_branch(&new.git_url, new.git_auth.as_ref())
                    .await?;
                debug!("Resolved default branch of {}: {}", redact_url(&new.git_url), branch);
                branch
            }
            branch => branch.to_string(),
        };

        let id = generate_uuid();
        let working_dir = self.layout.project_dir(&id);
        let now = Utc::now();
        let mut project = Project {
            id,
            name: new.name,
            git_url: new.git_url,
            git_branch: branch,
            git_auth: new.git_auth,
            auth_unreadable: false,
            working_dir: working_dir.path().to_path_buf(),
            compose_files: new.compose_files,
            variables: new.variables,
            status: ProjectStatus::Stopped,
            last_commit: None,
            watch_enabled: new.watch_enabled,
            created_at: now,
            updated_at: now,
        };

        working_dir.create().await?;
        if let Err(e) = self.clone_and_register(&mut project).await {
            if let Err(cleanup) = working_dir.delete().await {
                warn!(
                    "Failed to clean up {}: {}",
                    working_dir.path().display(),
                    cleanup
                );
            }
            return Err(e);
        }

        info!(
            "Created project {} ({}) from {} at {}",
            project.name,
            project.id,
            redact_url(&project.git_url),
            project.git_branch
        );
        Ok(project)
    }

    async fn clone_and_register(&self, project: &mut Project) -> Result<(), StackError> {
        self.git
            .clone_repo(
                &project.git_url,
                &project.git_branch,
                project.git_auth.as_ref(),
                &project.git_dir(),
            )
            .await?;
        project.last_commit = Some(self.git.local_commit(&project.git_dir()).await?);
        self.store.create_project(project).await
    }

    /// Bring the project's stack up at the current (optionally freshly pulled)
    /// commit and record the attempt
    pub async fn deploy(&self, id: &str, options: DeployOptions) -> Result<Deployment, StackError> {
        let _guard = self.locks.lock(id).await;
        let project = self.get(id).await?;
        self.deploy_locked(project, options).await
    }

    async fn deploy_locked(
        &self,
        mut project: Project,
        options: DeployOptions,
    ) -> Result<Deployment, StackError> {
        let git_dir = project.git_dir();
        if !Dir::new(&git_dir).exists().await {
            warn!("Checkout of {} is missing, cloning again", project.name);
            self.git
                .clone_repo(
                    &project.git_url,
                    &project.git_branch,
                    project.git_auth.as_ref(),
                    &git_dir,
                )
                .await?;
        } else if options.pull {
            self.git
                .pull(&git_dir, &project.git_branch, project.git_auth.as_ref())
                .await?;
        }

        let commit = self.git.local_commit(&git_dir).await?;
        let mut deployment = Deployment::start(&project.id, &commit);
        self.store.create_deployment(&deployment).await?;
        info!("Deploying {} at {}", project.name, commit);

        let cancel = options.cancel.with_timeout(self.timeouts.up);
        let result = self
            .compose
            .up(&ComposeProject::from_project(&project), options.sink, &cancel)
            .await;

        match result {
            Ok(CommandOutput { stdout, stderr, .. }) => {
                deployment.finish(DeploymentEvent::Succeeded, stdout, stderr)?;
                self.store.update_deployment(&deployment).await?;

                project.status =
                    fsm::next_project_status(project.status, &ProjectEvent::DeploySucceeded);
                project.last_commit = Some(commit);
                project.touch();
                self.store.update_project(&project).await?;

                info!("Deployed {} at {}", project.name, deployment.commit_hash);
                Ok(deployment)
            }
            Err(err) => {
                let (stdout, stderr) = match err.captured_output() {
                    Some((stdout, stderr)) => (stdout.to_string(), stderr.to_string()),
                    None => (String::new(), err.to_string()),
                };
                deployment.finish(DeploymentEvent::Failed, stdout, stderr)?;
                self.store.update_deployment(&deployment).await?;

                let requested = matches!(
                    err,
                    ComposeError::Cancelled {
                        reason: CancelReason::Requested,
                        ..
                    }
                );
                if requested {
                    warn!("Deployment of {} was cancelled", project.name);
                } else {
                    warn!("Deployment of {} failed: {}", project.name, err);
                    project.status =
                        fsm::next_project_status(project.status, &ProjectEvent::DeployFailed);
                    project.touch();
                    self.store.update_project(&project).await?;
                }
                Err(err.into())
            }
        }
    }

    /// Take the stack down, keeping volumes
    pub async fn stop(
        &self,
        id: &str,
        sink: OutputSink,
        cancel: &CancelToken,
    ) -> Result<Project, StackError> {
        let _guard = self.locks.lock(id).await;
        let mut project = self.get(id).await?;

        let cancel = cancel.with_timeout(self.timeouts.down);
        self.compose
            .down(&ComposeProject::from_project(&project), false, sink, &cancel)
            .await?;

        project.status = fsm::next_project_status(project.status, &ProjectEvent::Stopped);
        project.touch();
        self.store.update_project(&project).await?;
        info!("Stopped {}", project.name);
        Ok(project)
    }

    /// Take the stack down, forget the project and its deployments, and move
    /// the working directory aside
    pub async fn remove(
        &self,
        id: &str,
        remove_volumes: bool,
        cancel: &CancelToken,
    ) -> Result<(), StackError> {
        let guard = self.locks.lock(id).await;
        let project = self.get(id).await?;

        if Dir::new(project.git_dir()).exists().await {
            let cancel = cancel.with_timeout(self.timeouts.down);
            self.compose
                .down(
                    &ComposeProject::from_project(&project),
                    remove_volumes,
                    OutputSink::Buffer,
                    &cancel,
                )
                .await?;
        } else {
            warn!(
                "Checkout of {} is missing, skipping compose down",
                project.name
            );
        }

        self.store.delete_project(id).await?;

        let working_dir = Dir::new(&project.working_dir);
        if working_dir.exists().await {
            let target = self
                .layout
                .deleted_project_dir(&project.id, Utc::now().timestamp());
            match working_dir.rename_to(target.path()).await {
                Ok(moved) => debug!("Moved {} to {}", project.name, moved.path().display()),
                Err(e) => warn!(
                    "Failed to move working directory of {}: {}",
                    project.name, e
                ),
            }
        }

        drop(guard);
        self.locks.forget(id);
        info!("Removed project {} ({})", project.name, project.id);
        Ok(())
    }

    pub async fn update(&self, id: &str, update: ProjectUpdate) -> Result<Project, StackError> {
        let _guard = self.locks.lock(id).await;
        let mut project = self.get(id).await?;
        update.apply(&mut project)?;
        self.store.update_project(&project).await?;
        info!("Updated project {}", project.name);
        Ok(project)
    }

    pub async fn get(&self, id: &str) -> Result<Project, StackError> {
        self.store
            .find_project(id)
            .await?
            .ok_or_else(|| StackError::NotFound(format!("project {id}")))
    }

    pub async fn get_by_name(&self, name: &str) -> Result<Project, StackError> {
        self.store
            .find_project_by_name(name)
            .await?
            .ok_or_else(|| StackError::NotFound(format!("project named {name}")))
    }

    pub async fn list(&self) -> Result<Vec<Project>, StackError> {
        self.store.list_projects().await
    }

    /// What the engine reports for the project's containers
    pub async fn status(&self, id: &str, cancel: &CancelToken) -> Result<StackStatus, StackError> {
        let project = self.get(id).await?;
        let cancel = cancel.with_timeout(self.timeouts.query);
        Ok(self
            .compose
            .status(&ComposeProject::from_project(&project), &cancel)
            .await?)
    }

    /// The fully rendered compose configuration
    pub async fn config(&self, id: &str, cancel: &CancelToken) -> Result<String, StackError> {
        let project = self.get(id).await?;
        let cancel = cancel.with_timeout(self.timeouts.query);
        Ok(self
            .compose
            .config(&ComposeProject::from_project(&project), &cancel)
            .await?)
    }

    /// Container logs. Following logs only ends when `cancel` fires.
    pub async fn logs(
        &self,
        id: &str,
        query: LogQuery,
        sink: OutputSink,
        cancel: &CancelToken,
    ) -> Result<CommandOutput, StackError> {
        let project = self.get(id).await?;
        let cancel = if query.follow {
            cancel.clone()
        } else {
            cancel.with_timeout(self.timeouts.query)
        };
        Ok(self
            .compose
            .logs(
                &ComposeProject::from_project(&project),
                query.follow,
                query.tail,
                sink,
                &cancel,
            )
            .await?)
    }

    /// Deployment history of a project, newest first
    pub async fn deployments(&self, id: &str) -> Result<Vec<Deployment>, StackError> {
        self.get(id).await?;
        self.store.list_deployments(id).await
    }

    pub async fn deployment(&self, id: &str) -> Result<Deployment, StackError> {
        self.store
            .find_deployment(id)
            .await?
            .ok_or_else(|| StackError::NotFound(format!("deployment {id}")))
    }

    /// Check that `auth` grants access to `url`
    pub async fn test_authentication(
        &self,
        url: &str,
        auth: Option<&GitAuth>,
    ) -> Result<(), StackError> {
        Ok(self.git.test_authentication(url, auth).await?)
    }

    /// Mark deployments left `Started` by a previous run as `Unknown`
    pub async fn recover_interrupted(&self) -> Result<usize, StackError> {
        let mut recovered = 0;
        for project in self.store.list_projects().await? {
            for mut deployment in self.store.list_deployments(&project.id).await? {
                if deployment.status != DeploymentStatus::Started {
                    continue;
                }
                let (stdout, stderr) = (
                    std::mem::take(&mut deployment.stdout),
                    std::mem::take(&mut deployment.stderr),
                );
                deployment.finish(DeploymentEvent::Interrupted, stdout, stderr)?;
                self.store.update_deployment(&deployment).await?;
                recovered += 1;
            }
        }
        if recovered > 0 {
            warn!("Marked {} interrupted deployments as unknown", recovered);
        }
        Ok(recovered)
    }

    /// Align the stored status with what the engine reports. Projects busy
    /// with another operation are left alone.
    pub async fn reconcile_status(
        &self,
        id: &str,
        cancel: &CancelToken,
    ) -> Result<StatusSync, StackError> {
        let Some(_guard) = self.locks.try_lock(id) else {
            return Ok(StatusSync::Busy);
        };
        let mut project = self.get(id).await?;
        let current = project.status;

        let cancel = cancel.with_timeout(self.timeouts.query);
        let observed = self
            .compose
            .status(&ComposeProject::from_project(&project), &cancel)
            .await;

        let (next, error) = match observed {
            Ok(status) => (
                fsm::next_project_status(current, &ProjectEvent::Observed(status.state)),
                None,
            ),
            // A hung engine surfaces as a deadline and counts as a failed query
            Err(
                e @ ComposeError::Cancelled {
                    reason: CancelReason::Requested,
                    ..
                },
            ) => return Err(e.into()),
            Err(e) => (
                fsm::next_project_status(current, &ProjectEvent::QueryFailed),
                Some(e.to_string()),
            ),
        };

        let changed = next != current;
        if changed {
            project.status = next;
            project.touch();
            self.store.update_project(&project).await?;
            info!("Status of {} changed: {} -> {}", project.name, current, next);
        }

        Ok(match error {
            Some(error) => StatusSync::Unreachable {
                error,
                updated: changed,
            },
            None if changed => StatusSync::Updated {
                from: current,
                to: next,
            },
            None => StatusSync::Unchanged(current),
        })
    }

    /// Redeploy when the remote branch moved past the deployed commit, or when
    /// the project is in error
    pub async fn check_drift(
        &self,
        id: &str,
        cancel: &CancelToken,
    ) -> Result<DriftCheck, StackError> {
        let Some(_guard) = self.locks.try_lock(id) else {
            return Ok(DriftCheck::Busy);
        };
        let project = self.get(id).await?;
        if !project.watch_enabled || project.status == ProjectStatus::Stopped {
            return Ok(DriftCheck::Skipped);
        }

        let git_dir = project.git_dir();
        self.git
            .fetch(&git_dir, &project.git_branch, project.git_auth.as_ref())
            .await?;
        let remote = self.git.remote_commit(&git_dir, &project.git_branch).await?;

        let in_sync = project.last_commit.as_deref() == Some(remote.as_str());
        if in_sync && project.status != ProjectStatus::Error {
            return Ok(DriftCheck::InSync);
        }

        if in_sync {
            info!("{} is in error, redeploying {}", project.name, remote);
        } else {
            info!(
                "{} drifted: deployed {:?}, remote {}",
                project.name, project.last_commit, remote
            );
        }

        let options = DeployOptions {
            pull: true,
            sink: OutputSink::Buffer,
            cancel: cancel.clone(),
        };
        let deployment = self.deploy_locked(project, options).await?;
        Ok(DriftCheck::Deployed {
            commit: deployment.commit_hash,
        })
    }
}
