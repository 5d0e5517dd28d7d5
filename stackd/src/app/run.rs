//! Main application run loop

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{error, info};

use crate::app::options::AppOptions;
use crate::app::state::AppState;
use crate::deploy::cancel::CancelToken;
use crate::errors::StackError;
use crate::server::serve::serve;
use crate::server::state::ServerState;
use crate::workers::watcher;

/// Run stackd until `shutdown_signal` resolves
pub async fn run(
    options: AppOptions,
    shutdown_signal: impl Future<Output = ()> + Send + 'static,
) -> Result<(), StackError> {
    info!("Initializing stackd...");

    // Create shutdown channel
    let (shutdown_tx, _shutdown_rx): (broadcast::Sender<()>, _) = broadcast::channel(1);
    let mut shutdown_manager =
        ShutdownManager::new(shutdown_tx.clone(), options.max_shutdown_delay);

    if let Err(e) = init(&options, &shutdown_tx, &mut shutdown_manager).await {
        error!("Failed to start stackd: {}", e);
        shutdown_manager.shutdown().await?;
        return Err(e);
    }

    shutdown_signal.await;
    info!("Shutdown signal received, shutting down...");

    drop(shutdown_tx);
    shutdown_manager.shutdown().await
}

// =============================== INITIALIZATION ================================== //

async fn init(
    options: &AppOptions,
    shutdown_tx: &broadcast::Sender<()>,
    shutdown_manager: &mut ShutdownManager,
) -> Result<(), StackError> {
    let app_state = AppState::init(options).await?;

    if options.enable_server {
        init_server(
            options,
            &app_state,
            shutdown_manager,
            shutdown_tx.subscribe(),
        )
        .await?;
    }

    if options.enable_watcher {
        init_watcher(
            options.watcher.clone(),
            &app_state,
            shutdown_manager,
            shutdown_tx.subscribe(),
        )?;
    } else {
        info!("Watcher disabled");
    }

    Ok(())
}

fn init_watcher(
    options: watcher::Options,
    app_state: &AppState,
    shutdown_manager: &mut ShutdownManager,
    mut shutdown_rx: broadcast::Receiver<()>,
) -> Result<(), StackError> {
    info!("Initializing watcher...");

    let manager = app_state.manager.clone();
    let watcher_handle = tokio::spawn(async move {
        watcher::run(
            &options,
            manager.as_ref(),
            tokio::time::sleep,
            Box::pin(async move {
                let _ = shutdown_rx.recv().await;
            }),
        )
        .await;
    });

    shutdown_manager.with_watcher_handle(watcher_handle)
}

async fn init_server(
    options: &AppOptions,
    app_state: &AppState,
    shutdown_manager: &mut ShutdownManager,
    mut shutdown_rx: broadcast::Receiver<()>,
) -> Result<(), StackError> {
    info!("Initializing local HTTP server...");

    let shutdown = CancelToken::new();
    let server_state = ServerState::new(app_state.manager.clone(), shutdown.clone());
    let server_handle = serve(&options.server, Arc::new(server_state), async move {
        let _ = shutdown_rx.recv().await;
        // Streams such as followed logs never end on their own
        shutdown.cancel();
    })
    .await?;

    shutdown_manager.with_server_handle(server_handle)
}

// ================================= SHUTDOWN ===================================== //

struct ShutdownManager {
    shutdown_tx: broadcast::Sender<()>,
    max_shutdown_delay: Duration,
    server_handle: Option<JoinHandle<Result<(), StackError>>>,
    watcher_handle: Option<JoinHandle<()>>,
}

impl ShutdownManager {
    pub fn new(shutdown_tx: broadcast::Sender<()>, max_shutdown_delay: Duration) -> Self {
        Self {
            shutdown_tx,
            max_shutdown_delay,
            server_handle: None,
            watcher_handle: None,
        }
    }

    pub fn with_watcher_handle(&mut self, handle: JoinHandle<()>) -> Result<(), StackError> {
        if self.watcher_handle.is_some() {
            return Err(StackError::ShutdownError(
                "watcher_handle already set".to_string(),
            ));
        }
        self.watcher_handle = Some(handle);
        Ok(())
    }

    pub fn with_server_handle(
        &mut self,
        handle: JoinHandle<Result<(), StackError>>,
    ) -> Result<(), StackError> {
        if self.server_handle.is_some() {
            return Err(StackError::ShutdownError(
                "server_handle already set".to_string(),
            ));
        }
        self.server_handle = Some(handle);
        Ok(())
    }

    pub async fn shutdown(&mut self) -> Result<(), StackError> {
        let _ = self.shutdown_tx.send(());

        match tokio::time::timeout(self.max_shutdown_delay, self.shutdown_impl()).await {
            Ok(result) => result,
            Err(_) => {
                error!(
                    "Shutdown timed out after {:?}, forcing shutdown...",
                    self.max_shutdown_delay
                );
                std::process::exit(1);
            }
        }
    }

    async fn shutdown_impl(&mut self) -> Result<(), StackError> {
        info!("Shutting down stackd...");

        // 1. Watcher: cancels its current cycle and waits for commands to stop
        if let Some(handle) = self.watcher_handle.take() {
            handle
                .await
                .map_err(|e| StackError::ShutdownError(e.to_string()))?;
        }

        // 2. HTTP server
        if let Some(handle) = self.server_handle.take() {
            handle
                .await
                .map_err(|e| StackError::ShutdownError(e.to_string()))??;
        }

        info!("Shutdown complete");
        Ok(())
    }
}
