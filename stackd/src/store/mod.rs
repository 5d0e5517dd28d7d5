//! Persistence of projects and deployment history

pub mod json;

use async_trait::async_trait;

use crate::errors::StackError;
use crate::models::deployment::Deployment;
use crate::models::project::Project;

/// Storage used by the project manager.
///
/// Implementations enforce unique project names ([`StackError::NameTaken`])
/// and delete a project's deployments together with the project.
#[async_trait]
pub trait Persistence: Send + Sync {
    async fn create_project(&self, project: &Project) -> Result<(), StackError>;

    /// Replace a stored project; [`StackError::NotFound`] if it does not exist
    async fn update_project(&self, project: &Project) -> Result<(), StackError>;

    async fn delete_project(&self, id: &str) -> Result<(), StackError>;

    async fn find_project(&self, id: &str) -> Result<Option<Project>, StackError>;

    async fn find_project_by_name(&self, name: &str) -> Result<Option<Project>, StackError>;

    /// All projects in creation order
    async fn list_projects(&self) -> Result<Vec<Project>, StackError>;

    async fn create_deployment(&self, deployment: &Deployment) -> Result<(), StackError>;

    async fn update_deployment(&self, deployment: &Deployment) -> Result<(), StackError>;

    async fn find_deployment(&self, id: &str) -> Result<Option<Deployment>, StackError>;

    /// Deployments of one project, newest first
    async fn list_deployments(&self, project_id: &str) -> Result<Vec<Deployment>, StackError>;
}
