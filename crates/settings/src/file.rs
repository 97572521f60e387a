//! TOML config file support with live reload.
//!
//! Config location: `~/.config/termhost/config.toml`

use crate::constants;
use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

/// Maps a logical workspace id to the directory new sessions start in.
#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(rename_all = "kebab-case")]
pub struct WorkspaceEntry {
    pub id: String,
    /// Absolute path, or `~/`-relative.
    pub path: String,
}

/// User-facing config parsed from TOML.
#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(default, rename_all = "kebab-case")]
pub struct Config {
    /// Shell program. Falls back to `$SHELL`, then a platform default.
    pub shell: Option<String>,
    /// Arguments passed to the shell. Defaults to `["-l"]` on Unix.
    pub shell_args: Option<Vec<String>>,
    /// Windows: shell preference ("powershell", "pwsh", or "cmd").
    pub windows_shell: Option<String>,
    /// Extra environment variables for every spawned shell.
    pub env: BTreeMap<String, String>,
    /// Columns used when a client does not send a size.
    pub default_cols: u16,
    /// Rows used when a client does not send a size.
    pub default_rows: u16,
    /// In-memory scrollback cap per session, in bytes.
    pub scrollback_bytes: usize,
    /// Mirror session output to disk so it survives restarts.
    pub persist_scrollback: bool,
    /// Append completed commands to the history log.
    pub record_command_history: bool,
    /// RPC socket path override.
    pub socket_path: Option<String>,
    /// Workspace id to directory mappings.
    pub workspaces: Vec<WorkspaceEntry>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            shell: None,
            shell_args: None,
            windows_shell: None,
            env: BTreeMap::new(),
            default_cols: constants::terminal::DEFAULT_COLS,
            default_rows: constants::terminal::DEFAULT_ROWS,
            scrollback_bytes: constants::scrollback::DEFAULT_BYTES,
            persist_scrollback: false,
            record_command_history: true,
            socket_path: None,
            workspaces: Vec::new(),
        }
    }
}

impl Config {
    /// Scrollback cap clamped to the supported range.
    pub fn scrollback_limit(&self) -> usize {
        self.scrollback_bytes.clamp(
            constants::scrollback::MIN_BYTES,
            constants::scrollback::MAX_BYTES,
        )
    }

    /// Default geometry with zero or oversized values replaced.
    pub fn default_size(&self) -> (u16, u16) {
        let sane = |value: u16, fallback: u16| {
            if value == 0 || value > constants::terminal::MAX_DIMENSION {
                fallback
            } else {
                value
            }
        };
        (
            sane(self.default_cols, constants::terminal::DEFAULT_COLS),
            sane(self.default_rows, constants::terminal::DEFAULT_ROWS),
        )
    }

    /// Directory configured for a workspace id, with `~` expanded.
    pub fn workspace_path(&self, workspace_id: &str) -> Option<PathBuf> {
        self.workspaces
            .iter()
            .find(|entry| entry.id == workspace_id)
            .map(|entry| expand_tilde(&entry.path))
    }

    /// Socket path from config, if set and not absurdly long.
    pub fn socket_path(&self) -> Option<PathBuf> {
        let raw = self.socket_path.as_deref()?;
        if raw.is_empty() || raw.len() > constants::settings::MAX_STRING_LENGTH {
            tracing::warn!("Ignoring invalid socket-path in config");
            return None;
        }
        Some(expand_tilde(raw))
    }
}

/// Expand a leading `~` or `~/` to the home directory.
pub fn expand_tilde(path: &str) -> PathBuf {
    if path == "~" {
        if let Some(home) = dirs::home_dir() {
            return home;
        }
    } else if let Some(rest) = path.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    }
    PathBuf::from(path)
}

/// Default config file content with comments (generated on first launch).
const DEFAULT_CONFIG: &str = r#"# termhost configuration
# Changes are applied live where noted. Just save this file.

# Shell program (defaults to $SHELL)
# shell = "/bin/zsh"

# Arguments passed to the shell (defaults to ["-l"] on macOS/Linux)
# shell-args = ["-l"]

# Windows: shell, one of "powershell", "pwsh", or "cmd"
# windows-shell = "powershell"

# Size used when a client does not send one
default-cols = 80
default-rows = 24

# In-memory scrollback per session in bytes (applied live)
scrollback-bytes = 5242880

# Mirror terminal output to disk so history survives restarts
persist-scrollback = false

# Record commands reported by shell integration (OSC 133)
record-command-history = true

# RPC socket path (defaults to $TERMHOST_SOCKET, then the data directory)
# socket-path = "~/.local/share/termhost/termhost.sock"

# Extra environment for every shell
# [env]
# EDITOR = "nvim"

# Workspaces: where sessions for a workspace id start
# [[workspaces]]
# id = "main"
# path = "~/projects/main"
"#;

/// Return the config file path.
pub fn config_path() -> PathBuf {
    termhost_paths::config_file()
}

/// Ensure the config file exists, creating a default if missing.
/// Returns the path to the config file.
pub fn ensure_config_file() -> Option<PathBuf> {
    let path = config_path();
    if !path.exists() {
        let parent = path.parent()?;
        std::fs::create_dir_all(parent).ok()?;
        std::fs::write(&path, DEFAULT_CONFIG).ok()?;
        tracing::info!("Created default config at {:?}", path);
    }
    Some(path)
}

/// Load and parse the config file. Returns default on any error.
pub fn load_config() -> Config {
    load_config_from(&config_path())
}

/// Load and parse a config file at `path`. Returns default on any error.
pub fn load_config_from(path: &Path) -> Config {
    let content = match std::fs::read_to_string(path) {
        Ok(c) => c,
        Err(e) => {
            if e.kind() != std::io::ErrorKind::NotFound {
                tracing::warn!("Failed to read config: {}", e);
            }
            return Config::default();
        }
    };

    // Size guard
    if content.len() > constants::settings::MAX_FILE_SIZE as usize {
        tracing::warn!(
            "Config file too large ({} bytes), using defaults",
            content.len()
        );
        return Config::default();
    }

    match toml::from_str(&content) {
        Ok(cfg) => cfg,
        Err(e) => {
            tracing::warn!("Failed to parse config.toml: {}", e);
            Config::default()
        }
    }
}

/// Start watching the config file for changes.
///
/// Returns a guard that stops watching on drop. `on_change` runs on a
/// background thread whenever the parsed config differs from the last one.
pub fn watch_config(
    on_change: impl Fn(&Config) + Send + 'static,
) -> Option<notify_debouncer_mini::Debouncer<notify::RecommendedWatcher>> {
    watch_config_at(config_path(), on_change)
}

/// [`watch_config`] for an explicit path.
pub fn watch_config_at(
    path: PathBuf,
    on_change: impl Fn(&Config) + Send + 'static,
) -> Option<notify_debouncer_mini::Debouncer<notify::RecommendedWatcher>> {
    use notify_debouncer_mini::new_debouncer;

    let watch_dir = path.parent()?.to_path_buf();

    let current = std::sync::Arc::new(parking_lot::Mutex::new(load_config_from(&path)));
    let path_clone = path.clone();

    let (tx, rx) = std::sync::mpsc::channel();

    let mut debouncer = new_debouncer(
        constants::timing::CONFIG_DEBOUNCE,
        move |res: Result<Vec<notify_debouncer_mini::DebouncedEvent>, _>| {
            if let Ok(events) = res {
                if events.iter().any(|event| event.path == path_clone) {
                    let _ = tx.send(());
                }
            }
        },
    )
    .ok()?;

    debouncer
        .watcher()
        .watch(&watch_dir, notify::RecursiveMode::NonRecursive)
        .ok()?;

    let reload_path = path.clone();
    std::thread::Builder::new()
        .name("termhost-config-watch".into())
        .spawn(move || {
            // Ends when the debouncer (and with it the sender) is dropped.
            while rx.recv().is_ok() {
                while rx.try_recv().is_ok() {}

                let new_config = load_config_from(&reload_path);
                let mut prev = current.lock();
                if new_config != *prev {
                    tracing::info!("Config file changed, reloading...");
                    *prev = new_config.clone();
                    drop(prev);
                    on_change(&new_config);
                }
            }
        })
        .ok()?;

    tracing::info!("Watching config file: {:?}", path);
    Some(debouncer)
}
