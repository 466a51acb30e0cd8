// hubd: Audio/video stream orchestration hub daemon.

use av_config::{ConfigPaths, ConfigStore};
use clap::{Arg, Command};
use hubd::settings::Settings;
use hubd::supervisor::Supervisor;
use std::path::PathBuf;
use tracing::info;

#[tokio::main]
async fn main() {
    let matches = Command::new("avhub")
        .version(env!("CARGO_PKG_VERSION"))
        .about("Audio/video stream orchestration hub")
        .arg(
            Arg::new("config")
                .help("Path to a configuration file used as the project layer")
                .short('c')
                .long("config"),
        )
        .arg(
            Arg::new("storage")
                .help("Override the storage path")
                .short('s')
                .long("storage"),
        )
        .get_matches();

    let mut paths = ConfigPaths::default();
    if let Some(config) = matches.get_one::<String>("config") {
        paths.project = PathBuf::from(config);
    }
    let config = ConfigStore::load_from(paths);
    let mut settings = Settings::from_config(&config);
    if let Some(storage) = matches.get_one::<String>("storage") {
        settings.storage_path = PathBuf::from(storage);
    }

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(settings.log_level.to_lowercase())),
        )
        .init();

    info!(version = env!("CARGO_PKG_VERSION"), "avhub starting");

    let mut supervisor = Supervisor::new(settings);
    if let Err(e) = supervisor.start().await {
        eprintln!("FATAL: failed to start: {e}");
        std::process::exit(1);
    }

    wait_for_shutdown_signal().await;
    info!("shutdown signal received");
    supervisor.stop().await;
}

#[cfg(unix)]
async fn wait_for_shutdown_signal() {
    use tokio::signal::unix::{SignalKind, signal};
    let mut terminate = match signal(SignalKind::terminate()) {
        Ok(terminate) => terminate,
        Err(e) => {
            tracing::warn!(error = %e, "SIGTERM handler unavailable; relying on ctrl-c");
            let _ = tokio::signal::ctrl_c().await;
            return;
        }
    };
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {}
        _ = terminate.recv() => {}
    }
}

#[cfg(not(unix))]
async fn wait_for_shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
}
