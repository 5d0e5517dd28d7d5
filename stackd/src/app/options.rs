//! Application configuration options

use std::time::Duration;

use crate::deploy::compose::ComposeOptions;
use crate::deploy::git::GitOptions;
use crate::deploy::manager::CommandTimeouts;
use crate::storage::layout::StorageLayout;
use crate::storage::settings::Settings;
use crate::workers::watcher;

/// Main application options
#[derive(Debug, Clone)]
pub struct AppOptions {
    /// Storage layout paths
    pub layout: StorageLayout,

    /// Enable the local HTTP API
    pub enable_server: bool,

    /// Enable the reconciliation watcher
    pub enable_watcher: bool,

    /// Server configuration
    pub server: ServerOptions,

    /// Watcher worker options
    pub watcher: watcher::Options,

    pub git: GitOptions,
    pub compose: ComposeOptions,
    pub timeouts: CommandTimeouts,

    /// Maximum delay for graceful shutdown
    pub max_shutdown_delay: Duration,
}

impl Default for AppOptions {
    fn default() -> Self {
        Self {
            layout: StorageLayout::default(),
            enable_server: true,
            enable_watcher: true,
            server: ServerOptions::default(),
            watcher: watcher::Options::default(),
            git: GitOptions::default(),
            compose: ComposeOptions::default(),
            timeouts: CommandTimeouts::default(),
            max_shutdown_delay: Duration::from_secs(30),
        }
    }
}

impl AppOptions {
    pub fn from_settings(layout: StorageLayout, settings: &Settings) -> Self {
        Self {
            layout,
            enable_server: settings.server.enabled,
            enable_watcher: settings.watcher.enabled,
            server: ServerOptions {
                host: settings.server.host.clone(),
                port: settings.server.port,
            },
            watcher: watcher::Options {
                interval: Duration::from_secs(settings.watcher.poll_interval_secs.max(1)),
            },
            git: GitOptions {
                timeout: Duration::from_secs(settings.git.timeout_secs),
            },
            compose: ComposeOptions {
                program: settings.compose.program.clone(),
                base_args: settings.compose.base_args.clone(),
                docker_host: settings.compose.docker_host.clone(),
            },
            timeouts: CommandTimeouts {
                up: Duration::from_secs(settings.compose.up_timeout_secs),
                down: Duration::from_secs(settings.compose.down_timeout_secs),
                query: Duration::from_secs(settings.compose.query_timeout_secs),
            },
            ..Default::default()
        }
    }
}

/// Local HTTP server options
#[derive(Debug, Clone)]
pub struct ServerOptions {
    /// Host to bind to
    pub host: String,

    /// Port to listen on
    pub port: u16,
}

impl Default for ServerOptions {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 8180,
        }
    }
}
