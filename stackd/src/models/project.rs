//! Project models

use std::path::PathBuf;

use chrono::{DateTime, Utc};
use secrecy::SecretString;
use serde::{Deserialize, Serialize, Serializer};

use crate::errors::StackError;
use crate::utils::is_valid_git_url;

/// SSH user used when none is configured
pub const DEFAULT_SSH_USER: &str = "git";

/// Stored status of a project
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProjectStatus {
    #[default]
    Stopped,
    Running,
    Error,
    Unknown,
}

impl std::fmt::Display for ProjectStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ProjectStatus::Stopped => "stopped",
            ProjectStatus::Running => "running",
            ProjectStatus::Error => "error",
            ProjectStatus::Unknown => "unknown",
        };
        f.write_str(s)
    }
}

/// Credentials for a private repository.
///
/// `None` on a project means the repository is public.
#[derive(Debug, Clone)]
pub enum GitAuth {
    /// Username and password (usually a personal access token)
    Http {
        username: String,
        password: SecretString,
    },

    /// Private key material
    Ssh {
        private_key: SecretString,
        passphrase: Option<SecretString>,
        user: String,
    },
}

impl GitAuth {
    pub fn http(username: impl Into<String>, password: impl Into<String>) -> Self {
        GitAuth::Http {
            username: username.into(),
            password: SecretString::from(password.into()),
        }
    }

    pub fn ssh(
        private_key: impl Into<String>,
        passphrase: Option<String>,
        user: Option<String>,
    ) -> Self {
        GitAuth::Ssh {
            private_key: SecretString::from(private_key.into()),
            passphrase: passphrase.filter(|p| !p.is_empty()).map(SecretString::from),
            user: user
                .filter(|u| !u.trim().is_empty())
                .unwrap_or_else(|| DEFAULT_SSH_USER.to_string()),
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            GitAuth::Http { .. } => "http",
            GitAuth::Ssh { .. } => "ssh",
        }
    }
}

fn serialize_auth_kind<S: Serializer>(
    auth: &Option<GitAuth>,
    serializer: S,
) -> Result<S::Ok, S::Error> {
    match auth {
        Some(auth) => serializer.serialize_some(auth.kind()),
        None => serializer.serialize_none(),
    }
}

/// A Git-backed compose stack managed by stackd
#[derive(Debug, Clone, Serialize)]
pub struct Project {
    pub id: String,
    pub name: String,
    pub git_url: String,
    pub git_branch: String,

    /// Only the kind of credentials is exposed when serialized
    #[serde(rename = "auth", serialize_with = "serialize_auth_kind")]
    pub git_auth: Option<GitAuth>,

    /// Stored credentials exist but could not be decrypted. They stay on
    /// disk until replaced or cleared explicitly.
    #[serde(skip)]
    pub auth_unreadable: bool,

    pub working_dir: PathBuf,

    /// Compose files relative to the checkout, in `--file` order
    pub compose_files: Vec<String>,

    /// `KEY=value` entries passed to the compose engine
    pub variables: Vec<String>,

    pub status: ProjectStatus,

    /// Commit of the last successful deployment
    pub last_commit: Option<String>,

    pub watch_enabled: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Project {
    /// The repository checkout always lives at `<working_dir>/git`
    pub fn git_dir(&self) -> PathBuf {
        self.working_dir.join("git")
    }

    pub fn touch(&mut self) {
        self.updated_at = Utc::now();
    }
}

/// Input for creating a project
#[derive(Debug, Clone, Default)]
pub struct NewProject {
    pub name: String,
    pub git_url: String,

    /// Empty means the repository's default branch
    pub git_branch: String,

    pub git_auth: Option<GitAuth>,
    pub compose_files: Vec<String>,
    pub variables: Vec<String>,
    pub watch_enabled: bool,
}

impl NewProject {
    pub fn validate(&self) -> Result<(), StackError> {
        validate_name(&self.name)?;
        if !is_valid_git_url(&self.git_url) {
            return Err(StackError::ValidationError(format!(
                "invalid git url: {}",
                self.git_url
            )));
        }
        validate_compose_files(&self.compose_files)?;
        validate_variables(&self.variables)
    }
}

/// Partial update of a project; `None` fields are left untouched
#[derive(Debug, Clone, Default)]
pub struct ProjectUpdate {
    pub name: Option<String>,
    pub git_branch: Option<String>,

    /// `Some(None)` clears the credentials
    pub git_auth: Option<Option<GitAuth>>,

    pub compose_files: Option<Vec<String>>,
    pub variables: Option<Vec<String>>,
    pub watch_enabled: Option<bool>,
}

impl ProjectUpdate {
    /// Validate and apply the update to `project`
    pub fn apply(self, project: &mut Project) -> Result<(), StackError> {
        if let Some(name) = self.name {
            validate_name(&name)?;
            project.name = name;
        }
        if let Some(branch) = self.git_branch {
            let branch = branch.trim();
            if branch.is_empty() {
                return Err(StackError::ValidationError(
                    "branch cannot be empty".to_string(),
                ));
            }
            project.git_branch = branch.to_string();
        }
        if let Some(auth) = self.git_auth {
            project.git_auth = auth;
            project.auth_unreadable = false;
        }
        if let Some(files) = self.compose_files {
            validate_compose_files(&files)?;
            project.compose_files = files;
        }
        if let Some(variables) = self.variables {
            validate_variables(&variables)?;
            project.variables = variables;
        }
        if let Some(watch) = self.watch_enabled {
            project.watch_enabled = watch;
        }
        project.touch();
        Ok(())
    }
}

fn validate_name(name: &str) -> Result<(), StackError> {
    if name.trim().is_empty() {
        return Err(StackError::ValidationError(
            "project name cannot be empty".to_string(),
        ));
    }
    Ok(())
}

pub fn validate_compose_files(files: &[String]) -> Result<(), StackError> {
    if files.is_empty() {
        return Err(StackError::ValidationError(
            "at least one compose file is required".to_string(),
        ));
    }
    if let Some(empty) = files.iter().position(|f| f.trim().is_empty()) {
        return Err(StackError::ValidationError(format!(
            "compose file #{} is empty",
            empty + 1
        )));
    }
    Ok(())
}

pub fn validate_variables(variables: &[String]) -> Result<(), StackError> {
    for variable in variables {
        match variable.split_once('=') {
            Some((key, _)) if !key.trim().is_empty() => {}
            _ => {
                return Err(StackError::ValidationError(format!(
                    "variable must be KEY=value: {variable}"
                )))
            }
        }
    }
    Ok(())
}
