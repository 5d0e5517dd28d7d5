//! Application state management

use std::sync::Arc;

use tracing::{info, warn};

use crate::app::options::AppOptions;
use crate::crypto::cipher::AesGcmCipher;
use crate::deploy::compose::ComposeExecutor;
use crate::deploy::git::Git2Client;
use crate::deploy::manager::ProjectManager;
use crate::errors::StackError;
use crate::store::json::JsonStore;

/// Main application state
pub struct AppState {
    pub manager: Arc<ProjectManager>,
}

impl AppState {
    /// Prepare the storage layout and wire the store, Git client and compose
    /// executor into the project manager
    pub async fn init(options: &AppOptions) -> Result<Self, StackError> {
        info!("Initializing application state...");

        let layout = options.layout.clone();
        layout.setup().await?;

        let cipher = Arc::new(AesGcmCipher::load_or_generate(&layout.key_file()).await?);
        let store = Arc::new(JsonStore::open(&layout.state_dir(), cipher).await?);
        let git = Arc::new(Git2Client::new(options.git));
        let compose = Arc::new(ComposeExecutor::new(options.compose.clone()));

        let manager = Arc::new(ProjectManager::new(
            store,
            git,
            compose,
            layout,
            options.timeouts,
        ));

        match manager.recover_interrupted().await {
            Ok(0) => {}
            Ok(count) => info!("Recovered {} interrupted deployments", count),
            Err(e) => warn!("Failed to recover interrupted deployments: {}", e),
        }

        Ok(Self { manager })
    }
}
