//! termhost - headless terminal session daemon
//!
//! Owns PTY sessions keyed by pane id and serves them to clients over a
//! Unix socket speaking newline-delimited JSON.

use anyhow::{Context, Result};
use once_cell::sync::Lazy;
use settings::constants::scrollback::SPOOL_MAX_FILE_BYTES;
use settings::Config;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use terminal::{
    JsonlHistoryStore, ManagerOptions, ScrollbackSpool, StaticWorkspaceResolver, TerminalManager,
};
use tracing::{debug, error, info, warn};

/// Daemon startup time for performance monitoring
static STARTUP_TIME: Lazy<Instant> = Lazy::new(Instant::now);

const STORE_FLUSH_TIMEOUT: Duration = Duration::from_secs(2);

/// Check if debug mode is enabled via environment variable.
fn is_debug_mode() -> bool {
    std::env::var("TERMHOST_DEBUG").is_ok()
}

fn default_filter() -> &'static str {
    if is_debug_mode() {
        "termhost=trace,terminal=trace,rpc=debug,info"
    } else {
        "termhost=info,warn"
    }
}

/// Initialize the logging system.
fn init_logging() {
    use tracing_subscriber::{fmt, prelude::*, EnvFilter};

    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter()));

    tracing_subscriber::registry()
        .with(fmt::layer().with_target(true).with_line_number(true))
        .with(filter)
        .init();

    if is_debug_mode() {
        info!(
            "termhost v{} starting up (DEBUG MODE ENABLED)",
            env!("CARGO_PKG_VERSION")
        );
        info!("Set RUST_LOG for custom log levels, e.g. RUST_LOG=terminal=trace");
    } else {
        info!("termhost v{} starting up", env!("CARGO_PKG_VERSION"));
    }
}

/// On-disk locations for persisted session data.
#[derive(Debug, Clone)]
struct StoragePaths {
    history_file: PathBuf,
    scrollback_dir: PathBuf,
}

impl StoragePaths {
    fn default_locations() -> Self {
        Self {
            history_file: termhost_paths::command_history_file(),
            scrollback_dir: termhost_paths::scrollback_dir(),
        }
    }
}

/// Persistence stores opened for this run, kept so they can be flushed on exit.
#[derive(Default)]
struct Stores {
    history: Option<Arc<JsonlHistoryStore>>,
    spool: Option<Arc<ScrollbackSpool>>,
}

impl Stores {
    fn open(config: &Config, paths: &StoragePaths) -> Self {
        let mut stores = Stores::default();

        if config.record_command_history {
            match JsonlHistoryStore::open(&paths.history_file) {
                Ok(store) => stores.history = Some(Arc::new(store)),
                Err(e) => warn!("Command history disabled: {:#}", e),
            }
        }

        if config.persist_scrollback {
            match ScrollbackSpool::open(&paths.scrollback_dir, SPOOL_MAX_FILE_BYTES) {
                Ok(spool) => stores.spool = Some(Arc::new(spool)),
                Err(e) => warn!("Scrollback persistence disabled: {:#}", e),
            }
        }

        stores
    }

    fn flush(&self) {
        if let Some(history) = &self.history {
            if !history.flush(STORE_FLUSH_TIMEOUT) {
                warn!("Timed out flushing command history");
            }
        }
        if let Some(spool) = &self.spool {
            if !spool.flush(STORE_FLUSH_TIMEOUT) {
                warn!("Timed out flushing scrollback spool");
            }
        }
    }
}

/// Build the session manager described by `config`.
fn build_manager(config: &Config, stores: &Stores) -> Arc<TerminalManager> {
    let resolver = StaticWorkspaceResolver::from_config(config);
    debug!("Configured {} workspace(s)", resolver.len());

    let mut manager = TerminalManager::new(ManagerOptions::from_config(config))
        .with_resolver(Arc::new(resolver));
    if let Some(history) = &stores.history {
        manager = manager.with_history(history.clone());
    }
    if let Some(spool) = &stores.spool {
        manager = manager.with_spool(spool.clone());
    }
    Arc::new(manager)
}

/// Resolves on Ctrl-C, or SIGTERM on Unix.
async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut terminate) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {}
                    _ = terminate.recv() => {}
                }
            }
            Err(e) => {
                warn!("Failed to install SIGTERM handler: {}", e);
                let _ = tokio::signal::ctrl_c().await;
            }
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
    info!("Shutdown requested");
}

async fn run() -> Result<()> {
    if settings::ensure_config_file().is_none() {
        warn!("Could not create default config file");
    }
    let config = settings::load_config();

    let stores = Stores::open(&config, &StoragePaths::default_locations());
    let manager = build_manager(&config, &stores);

    // Scrollback cap follows config edits for running sessions.
    let _watcher = settings::watch_config({
        let manager = manager.clone();
        move |config| manager.set_scrollback_limit(config.scrollback_limit())
    });

    let socket = config
        .socket_path()
        .unwrap_or_else(termhost_paths::socket_file);

    info!("Daemon initialized in {:?}", STARTUP_TIME.elapsed());

    let result = rpc::serve(&socket, manager.clone(), shutdown_signal())
        .await
        .with_context(|| format!("RPC server on {:?} failed", socket));

    let killed = manager.kill_all();
    info!("Stopped {} session(s)", killed);
    stores.flush();
    result
}

#[tokio::main]
async fn main() {
    let _ = *STARTUP_TIME;

    init_logging();

    if let Err(e) = run().await {
        error!("{:#}", e);
        std::process::exit(1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serial_test::serial;

    fn storage_in(dir: &std::path::Path) -> StoragePaths {
        StoragePaths {
            history_file: dir.join("command-history.jsonl"),
            scrollback_dir: dir.join("scrollback"),
        }
    }

    #[test]
    #[serial]
    fn debug_env_switches_filter() {
        std::env::remove_var("TERMHOST_DEBUG");
        assert_eq!(default_filter(), "termhost=info,warn");

        std::env::set_var("TERMHOST_DEBUG", "1");
        assert!(default_filter().contains("terminal=trace"));
        std::env::remove_var("TERMHOST_DEBUG");
    }

    #[test]
    fn stores_follow_config_flags() {
        let dir = tempfile::tempdir().expect("tempdir");
        let paths = storage_in(dir.path());

        let config = Config {
            record_command_history: false,
            persist_scrollback: false,
            ..Config::default()
        };
        let stores = Stores::open(&config, &paths);
        assert!(stores.history.is_none());
        assert!(stores.spool.is_none());
        assert!(!paths.scrollback_dir.exists());

        let config = Config {
            record_command_history: true,
            persist_scrollback: true,
            ..Config::default()
        };
        let stores = Stores::open(&config, &paths);
        assert!(stores.history.is_some());
        assert!(stores.spool.is_some());
        assert!(paths.scrollback_dir.is_dir());
        stores.flush();
    }

    #[test]
    fn manager_uses_configured_scrollback_limit() {
        let config = Config {
            scrollback_bytes: 64 * 1024,
            ..Config::default()
        };
        let manager = build_manager(&config, &Stores::default());
        assert_eq!(manager.scrollback_limit(), 64 * 1024);
        assert!(manager.list_sessions().is_empty());
    }
}
