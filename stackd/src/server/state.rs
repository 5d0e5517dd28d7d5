//! Server state

use std::sync::Arc;

use crate::deploy::cancel::CancelToken;
use crate::deploy::manager::ProjectManager;

/// Server state shared across handlers
pub struct ServerState {
    pub manager: Arc<ProjectManager>,

    /// Fired when the server shuts down; every request's token is a child
    pub shutdown: CancelToken,
}

impl ServerState {
    pub fn new(manager: Arc<ProjectManager>, shutdown: CancelToken) -> Self {
        Self { manager, shutdown }
    }
}
