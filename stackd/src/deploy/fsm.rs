//! Status transitions for projects and deployments

use crate::deploy::compose::ContainerState;
use crate::models::deployment::DeploymentStatus;
use crate::models::project::ProjectStatus;

/// Something that happened to a project
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProjectEvent {
    /// `up` finished successfully
    DeploySucceeded,

    /// `up` failed
    DeployFailed,

    /// `down` finished successfully
    Stopped,

    /// The compose engine reported the stack's aggregate state
    Observed(ContainerState),

    /// The compose engine could not be queried
    QueryFailed,
}

/// Project status after `event`.
///
/// Every event is accepted in every state: a failure can always move a
/// project to `Error`/`Unknown`, and the next successful deploy or
/// reconciliation always brings it back.
pub fn next_project_status(_current: ProjectStatus, event: &ProjectEvent) -> ProjectStatus {
    match event {
        ProjectEvent::DeploySucceeded => ProjectStatus::Running,
        ProjectEvent::DeployFailed => ProjectStatus::Error,
        ProjectEvent::Stopped => ProjectStatus::Stopped,
        ProjectEvent::QueryFailed => ProjectStatus::Unknown,
        ProjectEvent::Observed(state) => match state {
            ContainerState::Running => ProjectStatus::Running,
            ContainerState::Stopped => ProjectStatus::Stopped,
            ContainerState::Partial | ContainerState::Failed => ProjectStatus::Error,
            ContainerState::Unknown => ProjectStatus::Unknown,
        },
    }
}

/// How a deployment attempt ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeploymentEvent {
    Succeeded,
    Failed,

    /// Found unfinished after a restart
    Interrupted,
}

/// Deployment status after `event`. Only a `Started` deployment can move.
pub fn next_deployment_status(
    current: DeploymentStatus,
    event: &DeploymentEvent,
) -> Result<DeploymentStatus, String> {
    match (current, event) {
        (DeploymentStatus::Started, DeploymentEvent::Succeeded) => Ok(DeploymentStatus::Completed),
        (DeploymentStatus::Started, DeploymentEvent::Failed) => Ok(DeploymentStatus::Failed),
        (DeploymentStatus::Started, DeploymentEvent::Interrupted) => Ok(DeploymentStatus::Unknown),
        (state, event) => Err(format!("Invalid transition: {:?} -> {:?}", state, event)),
    }
}
