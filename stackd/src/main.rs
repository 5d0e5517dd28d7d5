//! stackd - Entry Point
//!
//! Keeps docker compose stacks in step with the Git branches they are
//! deployed from.

use std::collections::HashMap;
use std::env;

use anyhow::Context;
use stackd::app::options::AppOptions;
use stackd::app::run::run;
use stackd::logs::{init_logging, LogOptions};
use stackd::storage::layout::StorageLayout;
use stackd::storage::settings::Settings;
use stackd::utils::version_info;

use tracing::{error, info};

#[tokio::main]
async fn main() {
    // Parse command line arguments
    let args: Vec<String> = env::args().collect();
    let mut cli_args: HashMap<String, String> = HashMap::new();

    for arg in args.iter().skip(1) {
        if let Some((key, value)) = arg.split_once('=') {
            // Handle --key=value format
            let clean_key = key.trim_start_matches('-');
            cli_args.insert(clean_key.to_string(), value.to_string());
        } else if arg.starts_with("--") {
            // Handle standalone flags like --version
            let clean_key = arg.trim_start_matches('-');
            cli_args.insert(clean_key.to_string(), "true".to_string());
        }
    }

    // Print version and exit
    let version = version_info();
    if cli_args.contains_key("version") {
        match serde_json::to_string_pretty(&version) {
            Ok(json) => println!("{json}"),
            Err(_) => println!("{}", version.version),
        }
        return;
    }

    if let Err(e) = start(&cli_args).await {
        eprintln!("stackd: {e:#}");
        std::process::exit(1);
    }
}

async fn start(cli_args: &HashMap<String, String>) -> anyhow::Result<()> {
    let layout = match cli_args.get("base-dir") {
        Some(dir) => StorageLayout::new(dir),
        None => StorageLayout::default(),
    };

    // Retrieve the settings file
    let settings_file = match cli_args.get("settings") {
        Some(path) => stackd::filesys::file::File::new(path),
        None => layout.settings_file(),
    };
    let settings = Settings::load(&settings_file)
        .await
        .context("unable to read settings")?;

    // Initialize logging; the guard flushes the file writer on exit
    let log_options = LogOptions {
        log_level: settings.log_level.clone(),
        json_format: settings.json_logs,
        log_dir: settings
            .log_to_file
            .then(|| layout.logs_dir().path().to_path_buf()),
        ..Default::default()
    };
    let _log_guard = init_logging(log_options).context("failed to initialize logging")?;

    let options = AppOptions::from_settings(layout, &settings);
    info!(
        "Running stackd {} with options: {:?}",
        version_info().version,
        options
    );

    if let Err(e) = run(options, await_shutdown_signal()).await {
        error!("stackd stopped with an error: {e}");
        return Err(e.into());
    }
    Ok(())
}

async fn await_shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let (mut sigterm, mut sigint) =
            match (signal(SignalKind::terminate()), signal(SignalKind::interrupt())) {
                (Ok(sigterm), Ok(sigint)) => (sigterm, sigint),
                _ => {
                    error!("Unable to install signal handlers, falling back to Ctrl+C");
                    let _ = tokio::signal::ctrl_c().await;
                    return;
                }
            };

        tokio::select! {
            _ = sigterm.recv() => {
                info!("SIGTERM received, shutting down...");
            }
            _ = sigint.recv() => {
                info!("SIGINT received, shutting down...");
            }
        }
    }

    #[cfg(not(unix))]
    {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to listen for Ctrl+C: {e}");
        }
        info!("Ctrl+C received, shutting down...");
    }
}
