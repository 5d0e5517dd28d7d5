//! Storage layout configuration

use std::path::PathBuf;

use crate::errors::StackError;
use crate::filesys::dir::Dir;
use crate::filesys::file::File;

/// Prefix given to working directories of removed projects
pub const DELETED_PREFIX: &str = "deleted-";

/// Storage layout for stackd
#[derive(Debug, Clone)]
pub struct StorageLayout {
    /// Base directory for all storage
    pub base_dir: PathBuf,
}

impl StorageLayout {
    /// Create a new storage layout
    pub fn new(base_dir: impl Into<PathBuf>) -> Self {
        Self {
            base_dir: base_dir.into(),
        }
    }

    /// Get the settings file path
    pub fn settings_file(&self) -> File {
        File::new(self.base_dir.join("settings.json"))
    }

    /// Key used to encrypt repository credentials at rest
    pub fn key_file(&self) -> File {
        File::new(self.base_dir.join("secret.key"))
    }

    /// Directory holding persisted projects and deployments
    pub fn state_dir(&self) -> Dir {
        Dir::new(self.base_dir.join("state"))
    }

    /// Parent of every project's working directory
    pub fn projects_dir(&self) -> Dir {
        Dir::new(self.base_dir.join("projects"))
    }

    /// Working directory of one project, derived from its id
    pub fn project_dir(&self, project_id: &str) -> Dir {
        self.projects_dir().subdir(project_id)
    }

    /// Where a removed project's working directory is moved to
    pub fn deleted_project_dir(&self, project_id: &str, removed_at: i64) -> Dir {
        self.projects_dir()
            .subdir(&format!("{DELETED_PREFIX}{project_id}-{removed_at}"))
    }

    /// Get the logs directory
    pub fn logs_dir(&self) -> Dir {
        Dir::new(self.base_dir.join("logs"))
    }

    /// Setup the storage layout (create directories)
    pub async fn setup(&self) -> Result<(), StackError> {
        self.state_dir().create().await?;
        self.projects_dir().create().await?;
        self.logs_dir().create().await?;
        Ok(())
    }
}

impl Default for StorageLayout {
    fn default() -> Self {
        #[cfg(target_os = "linux")]
        let base_dir = PathBuf::from("/var/lib/stackd");

        #[cfg(not(target_os = "linux"))]
        let base_dir = std::env::var_os("HOME")
            .or_else(|| std::env::var_os("USERPROFILE"))
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".stackd");

        Self::new(base_dir)
    }
}
