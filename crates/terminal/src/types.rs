//! Session data types shared by the manager and its transports.
//!
//! Everything here is plain data: serializable, cloneable, and free of
//! process handles, so RPC layers and tests can build and inspect values
//! without a live PTY.

use serde::{Deserialize, Serialize};
use settings::constants::terminal::{DEFAULT_COLS, DEFAULT_ROWS, MAX_DIMENSION};
use std::collections::BTreeMap;
use std::path::PathBuf;

/// Terminal dimensions in rows and columns.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TermSize {
    pub cols: u16,
    pub rows: u16,
}

impl Default for TermSize {
    fn default() -> Self {
        Self {
            cols: DEFAULT_COLS,
            rows: DEFAULT_ROWS,
        }
    }
}

impl TermSize {
    pub fn new(cols: u16, rows: u16) -> Self {
        Self { cols, rows }
    }

    /// Both dimensions non-zero and within the supported maximum.
    pub fn is_valid(&self) -> bool {
        (1..=MAX_DIMENSION).contains(&self.cols) && (1..=MAX_DIMENSION).contains(&self.rows)
    }
}

/// How a PTY child ended.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExitInfo {
    pub exit_code: u32,
    /// Signal name when the child was killed by one (Unix only).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub signal: Option<String>,
}

/// Lifecycle state of a session.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "camelCase")]
pub enum SessionStatus {
    Spawning,
    Running,
    #[serde(rename_all = "camelCase")]
    Exited {
        exit_code: u32,
        #[serde(skip_serializing_if = "Option::is_none")]
        signal: Option<String>,
    },
}

impl SessionStatus {
    pub fn is_alive(&self) -> bool {
        !matches!(self, SessionStatus::Exited { .. })
    }
}

/// Parameters for [`TerminalManager::create_or_attach`](crate::TerminalManager::create_or_attach).
#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct CreateOptions {
    /// Requested working directory; ignored if it does not exist.
    pub cwd: Option<PathBuf>,
    pub workspace_id: Option<String>,
    pub cols: Option<u16>,
    pub rows: Option<u16>,
    /// Written to the shell, one per line, right after spawning.
    pub initial_commands: Vec<String>,
    /// Extra environment for this session only.
    pub env: BTreeMap<String, String>,
}

/// Outcome of a create-or-attach call.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AttachResult {
    /// True when a new process was spawned.
    pub is_new: bool,
    /// Retained output; empty for a new session.
    pub scrollback: String,
}

/// Parameters for [`TerminalManager::kill`](crate::TerminalManager::kill).
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct KillOptions {
    /// Also drop spooled scrollback and recorded command history.
    pub delete_history: bool,
}

/// Read-only snapshot of a session.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionInfo {
    pub id: String,
    pub workspace_id: Option<String>,
    pub status: SessionStatus,
    pub cwd: Option<PathBuf>,
    pub size: TermSize,
    pub pid: Option<u32>,
    pub pending_command: Option<String>,
    pub scrollback_bytes: usize,
    /// Milliseconds since the Unix epoch.
    pub created_at: u64,
}

/// Milliseconds since the Unix epoch, 0 if the clock is before it.
pub(crate) fn now_millis() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|duration| duration.as_millis() as u64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use test_case::test_case;

    #[test_case(80, 24, true; "default")]
    #[test_case(0, 24, false; "zero cols")]
    #[test_case(80, 0, false; "zero rows")]
    #[test_case(MAX_DIMENSION + 1, 24, false; "too wide")]
    fn term_size_validity(cols: u16, rows: u16, valid: bool) {
        assert_eq!(TermSize::new(cols, rows).is_valid(), valid);
    }

    #[test]
    fn create_options_accept_partial_json() {
        let options: CreateOptions =
            serde_json::from_str(r#"{"workspaceId":"ws","cols":120}"#).expect("valid json");
        assert_eq!(options.workspace_id.as_deref(), Some("ws"));
        assert_eq!(options.cols, Some(120));
        assert_eq!(options.rows, None);
        assert!(options.initial_commands.is_empty());
    }

    #[test]
    fn exited_status_serializes_flat() {
        let status = SessionStatus::Exited {
            exit_code: 1,
            signal: None,
        };
        let json = serde_json::to_value(&status).expect("serializable");
        assert_eq!(json, serde_json::json!({"state": "exited", "exitCode": 1}));
        assert!(!status.is_alive());
        assert!(SessionStatus::Running.is_alive());
    }

    #[test]
    fn attach_result_uses_camel_case() {
        let json = serde_json::to_value(AttachResult {
            is_new: true,
            scrollback: String::new(),
        })
        .expect("serializable");
        assert_eq!(json, serde_json::json!({"isNew": true, "scrollback": ""}));
    }
}
