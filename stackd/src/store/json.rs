//! JSON file persistence

use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use secrecy::ExposeSecret;
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use crate::crypto::cipher::CredentialCipher;
use crate::errors::StackError;
use crate::filesys::dir::Dir;
use crate::filesys::file::File;
use crate::models::deployment::Deployment;
use crate::models::project::{GitAuth, Project, ProjectStatus};
use crate::store::Persistence;

/// Credentials as written to disk; secret fields hold cipher tokens
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
enum StoredAuth {
    Http {
        username: String,
        password: String,
    },
    Ssh {
        private_key: String,
        #[serde(default)]
        passphrase: Option<String>,
        user: String,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct StoredProject {
    id: String,
    name: String,
    git_url: String,
    git_branch: String,
    #[serde(default)]
    auth: Option<StoredAuth>,
    working_dir: PathBuf,
    compose_files: Vec<String>,
    #[serde(default)]
    variables: Vec<String>,
    #[serde(default)]
    status: ProjectStatus,
    #[serde(default)]
    last_commit: Option<String>,
    #[serde(default)]
    watch_enabled: bool,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

#[derive(Debug, Default, Clone)]
struct State {
    projects: Vec<StoredProject>,
    deployments: Vec<Deployment>,
}

/// Projects live in one JSON file and each deployment in its own file under
/// `deployments/`, so recording an attempt never rewrites the history.
/// Every write is atomic.
pub struct JsonStore {
    projects_file: File,
    deployments_dir: Dir,
    cipher: Arc<dyn CredentialCipher>,
    state: RwLock<State>,
}

impl JsonStore {
    /// Load the store from `state_dir`, starting empty when the files are missing
    pub async fn open(
        state_dir: &Dir,
        cipher: Arc<dyn CredentialCipher>,
    ) -> Result<Self, StackError> {
        let projects_file = state_dir.file("projects.json");
        let deployments_dir = state_dir.subdir("deployments");

        let projects: Vec<StoredProject> = if projects_file.exists().await {
            read_state(&projects_file).await?
        } else {
            Vec::new()
        };

        migrate_deployments_file(&state_dir.file("deployments.json"), &deployments_dir).await?;

        let mut deployments = Vec::new();
        for file in deployments_dir.files("json").await? {
            let deployment: Deployment = read_state(&file).await?;
            if projects.iter().any(|p| p.id == deployment.project_id) {
                deployments.push(deployment);
            } else {
                warn!(
                    "Removing deployment {} of project {} that no longer exists",
                    deployment.id, deployment.project_id
                );
                file.delete().await?;
            }
        }
        deployments.sort_by(|a, b| a.created_at.cmp(&b.created_at));

        debug!(
            "Loaded {} projects and {} deployments",
            projects.len(),
            deployments.len()
        );

        Ok(Self {
            projects_file,
            deployments_dir,
            cipher,
            state: RwLock::new(State {
                projects,
                deployments,
            }),
        })
    }

    fn seal(&self, project: &Project) -> Result<StoredProject, StackError> {
        let auth = match &project.git_auth {
            None => None,
            Some(GitAuth::Http { username, password }) => Some(StoredAuth::Http {
                username: username.clone(),
                password: self.cipher.encrypt(password.expose_secret())?,
            }),
            Some(GitAuth::Ssh {
                private_key,
                passphrase,
                user,
            }) => Some(StoredAuth::Ssh {
                private_key: self.cipher.encrypt(private_key.expose_secret())?,
                passphrase: passphrase
                    .as_ref()
                    .map(|p| self.cipher.encrypt(p.expose_secret()))
                    .transpose()?,
                user: user.clone(),
            }),
        };

        Ok(StoredProject {
            id: project.id.clone(),
            name: project.name.clone(),
            git_url: project.git_url.clone(),
            git_branch: project.git_branch.clone(),
            auth,
            working_dir: project.working_dir.clone(),
            compose_files: project.compose_files.clone(),
            variables: project.variables.clone(),
            status: project.status,
            last_commit: project.last_commit.clone(),
            watch_enabled: project.watch_enabled,
            created_at: project.created_at,
            updated_at: project.updated_at,
        })
    }

    /// Decrypt a stored project. A project whose credentials cannot be
    /// decrypted loads without them and is marked `auth_unreadable`.
    fn unseal(&self, stored: &StoredProject) -> Project {
        let git_auth = stored.auth.as_ref().and_then(|auth| {
            self.open_auth(auth)
                .map_err(|e| {
                    warn!(
                        "Cannot decrypt credentials of project {}, continuing without them: {}",
                        stored.name, e
                    );
                })
                .ok()
        });
        let auth_unreadable = stored.auth.is_some() && git_auth.is_none();

        Project {
            id: stored.id.clone(),
            name: stored.name.clone(),
            git_url: stored.git_url.clone(),
            git_branch: stored.git_branch.clone(),
            git_auth,
            auth_unreadable,
            working_dir: stored.working_dir.clone(),
            compose_files: stored.compose_files.clone(),
            variables: stored.variables.clone(),
            status: stored.status,
            last_commit: stored.last_commit.clone(),
            watch_enabled: stored.watch_enabled,
            created_at: stored.created_at,
            updated_at: stored.updated_at,
        }
    }

    fn open_auth(&self, auth: &StoredAuth) -> Result<GitAuth, StackError> {
        match auth {
            StoredAuth::Http { username, password } => {
                Ok(GitAuth::http(username.clone(), self.cipher.decrypt(password)?))
            }
            StoredAuth::Ssh {
                private_key,
                passphrase,
                user,
            } => {
                let passphrase = passphrase
                    .as_ref()
                    .map(|p| self.cipher.decrypt(p))
                    .transpose()?;
                Ok(GitAuth::ssh(
                    self.cipher.decrypt(private_key)?,
                    passphrase,
                    Some(user.clone()),
                ))
            }
        }
    }

    async fn save_projects(&self, projects: &[StoredProject]) -> Result<(), StackError> {
        self.projects_file
            .write_json(&projects)
            .await
            .map_err(|e| StackError::StorageError(format!("cannot write projects: {e}")))
    }

    fn deployment_file(&self, id: &str) -> File {
        self.deployments_dir.file(&format!("{id}.json"))
    }

    async fn save_deployment(&self, deployment: &Deployment) -> Result<(), StackError> {
        self.deployment_file(&deployment.id)
            .write_json(deployment)
            .await
            .map_err(|e| {
                StackError::StorageError(format!("cannot write deployment {}: {e}", deployment.id))
            })
    }
}

async fn read_state<T: serde::de::DeserializeOwned>(file: &File) -> Result<T, StackError> {
    file.read_json().await.map_err(|e| {
        StackError::StorageError(format!("cannot read {}: {}", file.path().display(), e))
    })
}

/// Split a single-file deployment history into one file per deployment
async fn migrate_deployments_file(legacy: &File, dir: &Dir) -> Result<(), StackError> {
    if !legacy.exists().await {
        return Ok(());
    }

    let deployments: Vec<Deployment> = read_state(legacy).await?;
    for deployment in &deployments {
        dir.file(&format!("{}.json", deployment.id))
            .write_json(deployment)
            .await?;
    }
    legacy.delete().await?;
    info!(
        "Moved {} deployments from {} to {}",
        deployments.len(),
        legacy.path().display(),
        dir.path().display()
    );
    Ok(())
}

fn name_taken(projects: &[StoredProject], name: &str, except_id: &str) -> bool {
    projects.iter().any(|p| p.name == name && p.id != except_id)
}

#[async_trait]
impl Persistence for JsonStore {
    async fn create_project(&self, project: &Project) -> Result<(), StackError> {
        let stored = self.seal(project)?;
        let mut state = self.state.write().await;

        if state.projects.iter().any(|p| p.id == project.id) {
            return Err(StackError::StorageError(format!(
                "project {} already exists",
                project.id
            )));
        }
        if name_taken(&state.projects, &project.name, &project.id) {
            return Err(StackError::NameTaken(project.name.clone()));
        }

        let mut projects = state.projects.clone();
        projects.push(stored);
        self.save_projects(&projects).await?;
        state.projects = projects;
        Ok(())
    }

    async fn update_project(&self, project: &Project) -> Result<(), StackError> {
        let mut stored = self.seal(project)?;
        let mut state = self.state.write().await;

        let Some(index) = state.projects.iter().position(|p| p.id == project.id) else {
            return Err(StackError::NotFound(format!("project {}", project.id)));
        };
        if project.auth_unreadable && project.git_auth.is_none() {
            stored.auth = state.projects[index].auth.clone();
        }
        if name_taken(&state.projects, &project.name, &project.id) {
            return Err(StackError::NameTaken(project.name.clone()));
        }

        let mut projects = state.projects.clone();
        projects[index] = stored;
        self.save_projects(&projects).await?;
        state.projects = projects;
        Ok(())
    }

    async fn delete_project(&self, id: &str) -> Result<(), StackError> {
        let mut state = self.state.write().await;
        if !state.projects.iter().any(|p| p.id == id) {
            return Err(StackError::NotFound(format!("project {id}")));
        }

        let projects: Vec<StoredProject> = state
            .projects
            .iter()
            .filter(|p| p.id != id)
            .cloned()
            .collect();

        // Projects first: orphaned deployment files are removed on the next load
        self.save_projects(&projects).await?;
        state.projects = projects;

        let (removed, kept) = std::mem::take(&mut state.deployments)
            .into_iter()
            .partition(|d| d.project_id == id);
        state.deployments = kept;
        for deployment in removed {
            if let Err(e) = self.deployment_file(&deployment.id).delete().await {
                warn!("Failed to remove deployment {}: {}", deployment.id, e);
            }
        }
        Ok(())
    }

    async fn find_project(&self, id: &str) -> Result<Option<Project>, StackError> {
        let state = self.state.read().await;
        Ok(state
            .projects
            .iter()
            .find(|p| p.id == id)
            .map(|p| self.unseal(p)))
    }

    async fn find_project_by_name(&self, name: &str) -> Result<Option<Project>, StackError> {
        let state = self.state.read().await;
        Ok(state
            .projects
            .iter()
            .find(|p| p.name == name)
            .map(|p| self.unseal(p)))
    }

    async fn list_projects(&self) -> Result<Vec<Project>, StackError> {
        let state = self.state.read().await;
        Ok(state.projects.iter().map(|p| self.unseal(p)).collect())
    }

    async fn create_deployment(&self, deployment: &Deployment) -> Result<(), StackError> {
        let mut state = self.state.write().await;
        if !state.projects.iter().any(|p| p.id == deployment.project_id) {
            return Err(StackError::NotFound(format!(
                "project {}",
                deployment.project_id
            )));
        }

        self.save_deployment(deployment).await?;
        state.deployments.push(deployment.clone());
        Ok(())
    }

    async fn update_deployment(&self, deployment: &Deployment) -> Result<(), StackError> {
        let mut state = self.state.write().await;
        let Some(index) = state.deployments.iter().position(|d| d.id == deployment.id) else {
            return Err(StackError::NotFound(format!("deployment {}", deployment.id)));
        };

        self.save_deployment(deployment).await?;
        state.deployments[index] = deployment.clone();
        Ok(())
    }

    async fn find_deployment(&self, id: &str) -> Result<Option<Deployment>, StackError> {
        let state = self.state.read().await;
        Ok(state.deployments.iter().find(|d| d.id == id).cloned())
    }

    async fn list_deployments(&self, project_id: &str) -> Result<Vec<Deployment>, StackError> {
        let state = self.state.read().await;
        let mut deployments: Vec<Deployment> = state
            .deployments
            .iter()
            .rev()
            .filter(|d| d.project_id == project_id)
            .cloned()
            .collect();
        // Stable: equal timestamps keep newest-inserted first
        deployments.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(deployments)
    }
}
