use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use clap::Parser;
use tokio::sync::{mpsc, watch};
use tracing::{error, info};

use revclock_api_client::ApiClient;
use revclock_daemon::activity::ActivityMonitor;
use revclock_daemon::config;
use revclock_daemon::dispatcher::{SyncDispatcher, TokenProvider};
use revclock_daemon::events;
use revclock_daemon::registry::SessionRegistry;
use revclock_daemon::tracker::{self, Tracker};
use revclock_store::Store;

#[derive(Debug, Parser)]
#[command(name = "revclock-daemon", about = "Review-time tracking daemon")]
struct Args {
    /// Config file (default: ~/.config/revclock/daemon.toml)
    #[arg(long)]
    config: Option<PathBuf>,
    /// Intake socket path override
    #[arg(long)]
    socket: Option<PathBuf>,
    /// State document path override
    #[arg(long)]
    store: Option<PathBuf>,
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("revclock_daemon=info".parse().unwrap())
                .add_directive(tracing::Level::WARN.into()),
        )
        .init();

    if let Err(e) = run().await {
        error!("Daemon fatal error: {:#}", e);
        std::process::exit(1);
    }
}

async fn run() -> Result<()> {
    info!("revclock-daemon starting");

    let args = Args::parse();
    let cfg = config::load_config(args.config.as_deref())?;

    let state_path = match args.store {
        Some(p) => p,
        None => cfg.state_path()?,
    };
    let socket_path = match args.socket {
        Some(p) => p,
        None => cfg.socket_path()?,
    };

    let store = Store::new(state_path);
    let registry = SessionRegistry::new(store.clone());
    info!("state document at {}", store.path().display());

    let mut api = ApiClient::new(
        &cfg.server.url,
        Duration::from_secs(cfg.tracker.request_timeout_secs),
    )?;
    if !cfg.server.api_key.is_empty() {
        api.set_auth(cfg.server.api_key.clone());
    }

    let tokens = ConfigTokenProvider {
        config_path: args.config.clone(),
    };
    let dispatcher = SyncDispatcher::new(store, api, tokens, cfg.tracker.max_attempts);
    let monitor = ActivityMonitor::new(cfg.tracker.activity_debounce_secs);
    let tracker = Tracker::new(
        registry.clone(),
        monitor,
        dispatcher,
        cfg.tracker.idle_threshold_secs,
    );

    write_pid_file()?;

    let (tx, rx) = mpsc::unbounded_channel();
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let listener_handle = tokio::spawn(events::run_listener(
        socket_path,
        registry,
        tx,
        shutdown_rx.clone(),
    ));

    let tracker_handle = tokio::spawn(tracker::run_tracker(
        tracker,
        cfg.tracker.reaper_interval_secs,
        cfg.tracker.sync_interval_secs,
        rx,
        shutdown_rx,
    ));

    wait_for_shutdown().await;

    info!("Shutdown signal received, stopping...");
    let _ = shutdown_tx.send(true);

    let _ = tracker_handle.await;
    match listener_handle.await {
        Ok(Err(e)) => error!("intake listener failed: {:#}", e),
        Err(e) => error!("intake listener panicked: {e}"),
        Ok(Ok(())) => {}
    }

    cleanup_pid_file();

    info!("revclock-daemon stopped");
    Ok(())
}

/// Token source for auth refresh: re-reads the config file, so a key rotated
/// by the authentication collaborator is picked up without a restart.
struct ConfigTokenProvider {
    config_path: Option<PathBuf>,
}

impl TokenProvider for ConfigTokenProvider {
    async fn refresh(&mut self) -> Result<String> {
        let cfg = config::load_config(self.config_path.as_deref())?;
        if cfg.server.api_key.is_empty() {
            bail!("no API key configured");
        }
        Ok(cfg.server.api_key)
    }
}

/// Write PID file so display surfaces can find us
fn write_pid_file() -> Result<()> {
    let path = config::pid_file_path()?;
    let dir = path.parent().context("pid file has no parent dir")?;
    std::fs::create_dir_all(dir)?;
    std::fs::write(&path, std::process::id().to_string())?;
    info!("PID file written: {}", path.display());
    Ok(())
}

/// Remove PID file on clean shutdown
fn cleanup_pid_file() {
    if let Ok(path) = config::pid_file_path() {
        let _ = std::fs::remove_file(path);
    }
}

/// Wait for SIGTERM or SIGINT
async fn wait_for_shutdown() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};
        let mut sigterm = match signal(SignalKind::terminate()) {
            Ok(s) => s,
            Err(e) => {
                error!("Failed to register SIGTERM handler: {e}");
                return;
            }
        };
        let mut sigint = match signal(SignalKind::interrupt()) {
            Ok(s) => s,
            Err(e) => {
                error!("Failed to register SIGINT handler: {e}");
                return;
            }
        };
        tokio::select! {
            _ = sigterm.recv() => {}
            _ = sigint.recv() => {}
        }
    }

    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}
