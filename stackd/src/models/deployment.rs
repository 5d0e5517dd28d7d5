//! Deployment models

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::deploy::fsm::{self, DeploymentEvent};
use crate::errors::StackError;
use crate::utils::generate_uuid;

/// Status of one deployment attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeploymentStatus {
    Started,
    Completed,
    Failed,

    /// The attempt was interrupted before it could be finalized
    Unknown,
}

impl DeploymentStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, DeploymentStatus::Started)
    }
}

/// A recorded deployment attempt with the compose output it produced
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Deployment {
    pub id: String,
    pub project_id: String,
    pub commit_hash: String,
    pub status: DeploymentStatus,

    #[serde(default)]
    pub stdout: String,

    #[serde(default)]
    pub stderr: String,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Deployment {
    /// A new attempt in the `Started` state
    pub fn start(project_id: &str, commit_hash: &str) -> Self {
        let now = Utc::now();
        Self {
            id: generate_uuid(),
            project_id: project_id.to_string(),
            commit_hash: commit_hash.to_string(),
            status: DeploymentStatus::Started,
            stdout: String::new(),
            stderr: String::new(),
            created_at: now,
            updated_at: now,
        }
    }

    /// Move to a terminal status, keeping the captured output
    pub fn finish(
        &mut self,
        event: DeploymentEvent,
        stdout: String,
        stderr: String,
    ) -> Result<(), StackError> {
        self.status = fsm::next_deployment_status(self.status, &event)
            .map_err(StackError::Internal)?;
        self.stdout = stdout;
        self.stderr = stderr;
        self.updated_at = Utc::now();
        Ok(())
    }
}
