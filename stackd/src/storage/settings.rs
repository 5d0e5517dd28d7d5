//! Settings file management

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::errors::StackError;
use crate::filesys::file::File;
use crate::logs::LogLevel;

/// stackd settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    /// Log level
    #[serde(default)]
    pub log_level: LogLevel,

    /// Emit logs as JSON
    #[serde(default)]
    pub json_logs: bool,

    /// Also write logs to daily files under the logs directory
    #[serde(default)]
    pub log_to_file: bool,

    /// Reconciliation watcher configuration
    #[serde(default)]
    pub watcher: WatcherSettings,

    /// Git configuration
    #[serde(default)]
    pub git: GitSettings,

    /// Compose engine configuration
    #[serde(default)]
    pub compose: ComposeSettings,

    /// Local HTTP API configuration
    #[serde(default)]
    pub server: ServerSettings,
}

fn default_true() -> bool {
    true
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            log_level: LogLevel::Info,
            json_logs: false,
            log_to_file: false,
            watcher: WatcherSettings::default(),
            git: GitSettings::default(),
            compose: ComposeSettings::default(),
            server: ServerSettings::default(),
        }
    }
}

impl Settings {
    /// Read the settings file, falling back to defaults when it does not exist
    pub async fn load(file: &File) -> Result<Self, StackError> {
        if !file.exists().await {
            info!("No settings file at {}, using defaults", file.path().display());
            return Ok(Self::default());
        }
        file.read_json::<Settings>()
            .await
            .map_err(|e| StackError::ConfigError(format!("{}: {}", file.path().display(), e)))
    }
}

/// Watcher settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WatcherSettings {
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Seconds between reconciliation cycles
    #[serde(default = "default_poll_interval")]
    pub poll_interval_secs: u64,
}

fn default_poll_interval() -> u64 {
    60
}

impl Default for WatcherSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            poll_interval_secs: default_poll_interval(),
        }
    }
}

/// Git settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GitSettings {
    /// Timeout for every network git operation, in seconds
    #[serde(default = "default_git_timeout")]
    pub timeout_secs: u64,
}

fn default_git_timeout() -> u64 {
    60
}

impl Default for GitSettings {
    fn default() -> Self {
        Self {
            timeout_secs: default_git_timeout(),
        }
    }
}

/// Compose engine settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ComposeSettings {
    /// Executable to invoke
    #[serde(default = "default_compose_program")]
    pub program: String,

    /// Arguments placed before the project flags (`compose` for the docker plugin)
    #[serde(default = "default_compose_base_args")]
    pub base_args: Vec<String>,

    /// Engine socket, exported as `DOCKER_HOST` when set
    #[serde(default)]
    pub docker_host: Option<String>,

    #[serde(default = "default_up_timeout")]
    pub up_timeout_secs: u64,

    #[serde(default = "default_down_timeout")]
    pub down_timeout_secs: u64,

    /// Timeout for `ps` and `config`
    #[serde(default = "default_query_timeout")]
    pub query_timeout_secs: u64,
}

fn default_compose_program() -> String {
    "docker".to_string()
}

fn default_compose_base_args() -> Vec<String> {
    vec!["compose".to_string()]
}

fn default_up_timeout() -> u64 {
    900
}

fn default_down_timeout() -> u64 {
    300
}

fn default_query_timeout() -> u64 {
    60
}

impl Default for ComposeSettings {
    fn default() -> Self {
        Self {
            program: default_compose_program(),
            base_args: default_compose_base_args(),
            docker_host: None,
            up_timeout_secs: default_up_timeout(),
            down_timeout_secs: default_down_timeout(),
            query_timeout_secs: default_query_timeout(),
        }
    }
}

/// HTTP API settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerSettings {
    #[serde(default = "default_true")]
    pub enabled: bool,

    #[serde(default = "default_server_host")]
    pub host: String,

    #[serde(default = "default_server_port")]
    pub port: u16,
}

fn default_server_host() -> String {
    "127.0.0.1".to_string()
}

fn default_server_port() -> u16 {
    8180
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            host: default_server_host(),
            port: default_server_port(),
        }
    }
}
