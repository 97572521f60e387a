//! Centralized configuration constants for termhost.
//!
//! Compile-time defaults and limits, organized by the component that
//! consumes them.

/// PTY geometry and environment.
pub mod terminal {
    /// Columns used when a create request omits them.
    pub const DEFAULT_COLS: u16 = 80;
    /// Rows used when a create request omits them.
    pub const DEFAULT_ROWS: u16 = 24;
    /// Largest accepted dimension in either direction.
    pub const MAX_DIMENSION: u16 = 4096;
    /// Value exported as `TERM` to spawned shells.
    pub const TERM: &str = "xterm-256color";

    /// Fallback shell when neither config nor `$SHELL` name one.
    #[cfg(target_os = "macos")]
    pub const FALLBACK_SHELL: &str = "/bin/zsh";

    /// Fallback shell when neither config nor `$SHELL` name one.
    #[cfg(all(unix, not(target_os = "macos")))]
    pub const FALLBACK_SHELL: &str = "/bin/bash";

    /// Fallback shell when `windows-shell` is unset.
    #[cfg(windows)]
    pub const FALLBACK_SHELL: &str = "powershell.exe";
}

/// Scrollback buffer configuration.
pub mod scrollback {
    /// Default in-memory scrollback cap per session (5 MiB).
    pub const DEFAULT_BYTES: usize = 5 * 1024 * 1024;
    /// Maximum allowed in-memory scrollback cap (64 MiB).
    pub const MAX_BYTES: usize = 64 * 1024 * 1024;
    /// Smallest cap honoured; lower values are raised to this.
    pub const MIN_BYTES: usize = 4 * 1024;
    /// Spool files are halved once they grow past this size (32 MiB).
    pub const SPOOL_MAX_FILE_BYTES: u64 = 32 * 1024 * 1024;
}

/// Shell-integration parsing limits.
pub mod osc {
    /// Longest unterminated OSC 133 tail held back between chunks.
    pub const MAX_PENDING_BYTES: usize = 8 * 1024;
}

/// RPC transport limits.
pub mod rpc {
    /// Maximum size of one JSON frame (1 MiB).
    pub const MAX_FRAME_BYTES: usize = 1024 * 1024;
    /// Maximum length of a session id.
    pub const MAX_SESSION_ID_LENGTH: usize = 256;
}

/// Timing configuration.
pub mod timing {
    use std::time::Duration;

    /// Debounce window for config file change events.
    pub const CONFIG_DEBOUNCE: Duration = Duration::from_millis(100);
}

/// Settings file validation limits.
pub mod settings {
    /// Maximum settings file size in bytes (64 KB).
    /// Settings files should be tiny; anything larger is suspicious.
    pub const MAX_FILE_SIZE: u64 = 64 * 1024;

    /// Maximum length for string fields (shell path, socket path).
    pub const MAX_STRING_LENGTH: usize = 1024;
}
