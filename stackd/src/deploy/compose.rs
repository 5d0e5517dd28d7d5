//! Compose command construction, execution and status parsing

use std::path::PathBuf;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

use crate::deploy::cancel::{CancelReason, CancelToken};
use crate::deploy::process::{self, CommandOutput, CommandSpec, OutputSink};
use crate::models::project::Project;

/// Failures of a compose invocation
#[derive(Error, Debug)]
pub enum ComposeError {
    #[error("Failed to start {program}: {message}")]
    Spawn { program: String, message: String },

    #[error("Compose command failed with exit code {}", code.map_or_else(|| "none".to_string(), |c| c.to_string()))]
    Failed {
        code: Option<i32>,
        stdout: String,
        stderr: String,
    },

    #[error("Compose command {reason}")]
    Cancelled {
        reason: CancelReason,
        stdout: String,
        stderr: String,
    },

    #[error("Unexpected compose output: {0}")]
    InvalidOutput(String),

    #[error("Compose IO error: {0}")]
    Io(String),
}

impl ComposeError {
    /// Output captured before the command failed or was cancelled
    pub fn captured_output(&self) -> Option<(&str, &str)> {
        match self {
            ComposeError::Failed { stdout, stderr, .. }
            | ComposeError::Cancelled { stdout, stderr, .. } => {
                Some((stdout.as_str(), stderr.as_str()))
            }
            _ => None,
        }
    }
}

/// How the compose engine is invoked
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ComposeOptions {
    pub program: String,

    /// Arguments placed before the project flags, e.g. `["compose"]`
    pub base_args: Vec<String>,

    /// Exported as `DOCKER_HOST` when set
    pub docker_host: Option<String>,
}

impl Default for ComposeOptions {
    fn default() -> Self {
        Self {
            program: "docker".to_string(),
            base_args: vec!["compose".to_string()],
            docker_host: None,
        }
    }
}

/// A compose subcommand
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ComposeAction {
    Up,
    Down { remove_volumes: bool },
    Logs { follow: bool, tail: Option<u32> },
    Config,
    Ps,
}

impl ComposeAction {
    fn args(&self) -> Vec<String> {
        let args: Vec<&str> = match self {
            ComposeAction::Up => vec!["up", "--detach", "--wait", "--quiet-pull", "--remove-orphans"],
            ComposeAction::Down { remove_volumes } => {
                let mut args = vec!["down", "--remove-orphans"];
                if *remove_volumes {
                    args.push("--volumes");
                }
                args
            }
            ComposeAction::Logs { follow, tail } => {
                let mut args = vec!["logs".to_string()];
                if *follow {
                    args.push("--follow".to_string());
                }
                if let Some(tail) = tail {
                    args.push("--tail".to_string());
                    args.push(tail.to_string());
                }
                return args;
            }
            ComposeAction::Config => vec!["config"],
            ComposeAction::Ps => vec!["ps", "--all", "--format", "json"],
        };
        args.into_iter().map(String::from).collect()
    }
}

/// The compose view of a project
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ComposeProject {
    pub name: String,
    pub checkout_dir: PathBuf,
    pub files: Vec<String>,
    pub variables: Vec<String>,
}

impl ComposeProject {
    pub fn from_project(project: &Project) -> Self {
        Self {
            name: project_name(&project.name, &project.id),
            checkout_dir: project.git_dir(),
            files: project.compose_files.clone(),
            variables: project.variables.clone(),
        }
    }

    /// Full command line for `action`
    pub fn command(&self, options: &ComposeOptions, action: &ComposeAction) -> CommandSpec {
        let mut args = options.base_args.clone();
        args.push("--project-name".to_string());
        args.push(self.name.clone());
        for file in &self.files {
            args.push("--file".to_string());
            args.push(self.checkout_dir.join(file).to_string_lossy().into_owned());
        }
        args.extend(action.args());

        let mut envs: Vec<(String, String)> = self
            .variables
            .iter()
            .filter_map(|v| v.split_once('='))
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        if let Some(host) = &options.docker_host {
            envs.push(("DOCKER_HOST".to_string(), host.clone()));
        }

        CommandSpec {
            program: options.program.clone(),
            args,
            envs,
        }
    }
}

/// Compose project names allow lowercase letters, digits, `-` and `_`, and
/// must start with a letter or digit.
fn project_name(name: &str, id: &str) -> String {
    let sanitized: String = name
        .trim()
        .to_lowercase()
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
                c
            } else {
                '-'
            }
        })
        .collect();
    let sanitized = sanitized.trim_start_matches(['-', '_']).to_string();

    if sanitized.is_empty() {
        let short: String = id.chars().filter(|c| c.is_ascii_alphanumeric()).take(8).collect();
        format!("stack-{}", short.to_lowercase())
    } else {
        sanitized
    }
}

/// Aggregate state of a stack's containers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ContainerState {
    Running,
    Stopped,
    Partial,
    Failed,
    Unknown,
}

/// One container as reported by `ps`
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ServiceStatus {
    pub service: String,
    pub name: String,
    pub state: String,
    pub status: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct PsRecord {
    #[serde(default)]
    service: String,
    #[serde(default)]
    name: String,
    #[serde(default)]
    state: String,
    #[serde(default)]
    status: String,
    #[serde(default)]
    running_for: String,
}

/// Observed status of a stack
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StackStatus {
    pub state: ContainerState,
    pub services: Vec<ServiceStatus>,
    pub uptime: Option<String>,
}

impl StackStatus {
    /// Parse `ps --format json` output. Newer engines print one object per
    /// line, older ones a single array.
    pub fn from_ps_output(output: &str) -> Result<Self, ComposeError> {
        let trimmed = output.trim();
        let records: Vec<PsRecord> = if trimmed.is_empty() {
            Vec::new()
        } else if trimmed.starts_with('[') {
            serde_json::from_str(trimmed).map_err(|e| ComposeError::InvalidOutput(e.to_string()))?
        } else {
            trimmed
                .lines()
                .filter(|line| !line.trim().is_empty())
                .map(serde_json::from_str)
                .collect::<Result<_, _>>()
                .map_err(|e| ComposeError::InvalidOutput(e.to_string()))?
        };

        let state = aggregate(&records);
        let uptime = records
            .iter()
            .find(|r| is_running(&r.state) && !r.running_for.is_empty())
            .map(|r| r.running_for.trim_end_matches(" ago").to_string());
        let services = records
            .into_iter()
            .map(|r| ServiceStatus {
                service: r.service,
                name: r.name,
                state: r.state,
                status: r.status,
            })
            .collect();

        Ok(Self {
            state,
            services,
            uptime,
        })
    }
}

fn is_running(state: &str) -> bool {
    state.eq_ignore_ascii_case("running")
}

fn aggregate(records: &[PsRecord]) -> ContainerState {
    let running = records.iter().filter(|r| is_running(&r.state)).count();
    if running == records.len() {
        // Also covers an empty stack
        if records.is_empty() {
            ContainerState::Stopped
        } else {
            ContainerState::Running
        }
    } else if running == 0 {
        if records.iter().any(|r| r.state.eq_ignore_ascii_case("dead")) {
            ContainerState::Failed
        } else {
            ContainerState::Stopped
        }
    } else {
        ContainerState::Partial
    }
}

/// Runs compose actions for a project
#[async_trait]
pub trait ComposeRunner: Send + Sync {
    async fn run(
        &self,
        project: &ComposeProject,
        action: &ComposeAction,
        sink: OutputSink,
        cancel: &CancelToken,
    ) -> Result<CommandOutput, ComposeError>;

    async fn up(
        &self,
        project: &ComposeProject,
        sink: OutputSink,
        cancel: &CancelToken,
    ) -> Result<CommandOutput, ComposeError> {
        self.run(project, &ComposeAction::Up, sink, cancel).await
    }

    async fn down(
        &self,
        project: &ComposeProject,
        remove_volumes: bool,
        sink: OutputSink,
        cancel: &CancelToken,
    ) -> Result<CommandOutput, ComposeError> {
        self.run(project, &ComposeAction::Down { remove_volumes }, sink, cancel)
            .await
    }

    async fn status(
        &self,
        project: &ComposeProject,
        cancel: &CancelToken,
    ) -> Result<StackStatus, ComposeError> {
        let output = self
            .run(project, &ComposeAction::Ps, OutputSink::Buffer, cancel)
            .await?;
        StackStatus::from_ps_output(&output.stdout)
    }

    async fn config(
        &self,
        project: &ComposeProject,
        cancel: &CancelToken,
    ) -> Result<String, ComposeError> {
        let output = self
            .run(project, &ComposeAction::Config, OutputSink::Buffer, cancel)
            .await?;
        Ok(output.stdout)
    }

    async fn logs(
        &self,
        project: &ComposeProject,
        follow: bool,
        tail: Option<u32>,
        sink: OutputSink,
        cancel: &CancelToken,
    ) -> Result<CommandOutput, ComposeError> {
        self.run(project, &ComposeAction::Logs { follow, tail }, sink, cancel)
            .await
    }
}

/// Runs compose through the configured engine binary
#[derive(Debug, Clone, Default)]
pub struct ComposeExecutor {
    options: ComposeOptions,
}

impl ComposeExecutor {
    pub fn new(options: ComposeOptions) -> Self {
        Self { options }
    }

    pub fn options(&self) -> &ComposeOptions {
        &self.options
    }
}

#[async_trait]
impl ComposeRunner for ComposeExecutor {
    async fn run(
        &self,
        project: &ComposeProject,
        action: &ComposeAction,
        sink: OutputSink,
        cancel: &CancelToken,
    ) -> Result<CommandOutput, ComposeError> {
        let spec = project.command(&self.options, action);
        debug!("Compose {:?} for project {}", action, project.name);
        process::run(&spec, sink, cancel).await
    }
}
