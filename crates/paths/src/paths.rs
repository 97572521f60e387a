//! Centralized path management for termhost.
//!
//! All application directories are lazily initialized and cached.

use std::path::PathBuf;
use std::sync::OnceLock;

static CONFIG_DIR: OnceLock<PathBuf> = OnceLock::new();
static DATA_DIR: OnceLock<PathBuf> = OnceLock::new();

/// Environment variable that overrides the RPC socket location.
pub const SOCKET_ENV_VAR: &str = "TERMHOST_SOCKET";

/// ~/.config/termhost (or platform equivalent)
pub fn config_dir() -> &'static PathBuf {
    CONFIG_DIR.get_or_init(|| {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("termhost")
    })
}

/// ~/Library/Application Support/termhost (or platform equivalent)
pub fn data_dir() -> &'static PathBuf {
    DATA_DIR.get_or_init(|| {
        dirs::data_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("termhost")
    })
}

/// Config file path: config_dir()/config.toml
pub fn config_file() -> PathBuf {
    config_dir().join("config.toml")
}

/// Command history log: data_dir()/command-history.jsonl
pub fn command_history_file() -> PathBuf {
    data_dir().join("command-history.jsonl")
}

/// Spooled scrollback files, one per session.
pub fn scrollback_dir() -> PathBuf {
    data_dir().join("scrollback")
}

/// Default RPC socket: `$TERMHOST_SOCKET`, else data_dir()/termhost.sock
pub fn socket_file() -> PathBuf {
    match std::env::var_os(SOCKET_ENV_VAR) {
        Some(path) if !path.is_empty() => PathBuf::from(path),
        _ => data_dir().join("termhost.sock"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_dir_ends_with_termhost() {
        let dir = config_dir();
        assert!(
            dir.ends_with("termhost"),
            "config_dir should end with 'termhost': {:?}",
            dir
        );
    }

    #[test]
    fn config_file_is_toml() {
        let path = config_file();
        assert_eq!(path.extension().and_then(|e| e.to_str()), Some("toml"));
    }

    #[test]
    fn history_and_scrollback_live_under_data_dir() {
        assert!(command_history_file().starts_with(data_dir()));
        assert!(scrollback_dir().starts_with(data_dir()));
        assert_eq!(
            command_history_file().extension().and_then(|e| e.to_str()),
            Some("jsonl")
        );
    }

    #[test]
    fn socket_file_has_sock_extension_by_default() {
        if std::env::var_os(SOCKET_ENV_VAR).is_some() {
            return;
        }
        let path = socket_file();
        assert_eq!(path.extension().and_then(|e| e.to_str()), Some("sock"));
    }
}
