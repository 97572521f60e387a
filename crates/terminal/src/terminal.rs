//! Terminal session core.
//!
//! PTY-backed sessions keyed by pane id, shell-integration marker parsing,
//! command tracking, and per-session output fan-out. Transports live in the
//! `rpc` crate; this crate has no knowledge of sockets.

pub mod command_tracker;
pub mod history;
mod manager;
pub mod osc;
mod pty_handler;
pub mod scrollback;
mod session;
pub mod shell;
pub mod spool;
pub mod subscription;
#[cfg(any(test, feature = "test-support"))]
pub mod test_support;
pub mod types;
mod utf8;
pub mod workspace;

pub use command_tracker::{CommandTracker, CompletedCommand};
pub use history::{load_history, CommandHistoryEntry, CommandHistorySink, JsonlHistoryStore, NoopHistorySink};
pub use manager::{ManagerOptions, TerminalManager, DEFAULT_SIGNAL};
pub use osc::{OscEvent, OscStream, ParsedChunk};
pub use pty_handler::{
    normalize_signal_name, NativePty, NativePtySpawner, PtyListener, PtyProcess, PtySpawner,
    SpawnRequest,
};
pub use shell::ShellCommand;
pub use spool::ScrollbackSpool;
pub use subscription::{SubscriberId, SubscriberRegistry, Subscription, SubscriptionGuard, TerminalEvent};
pub use types::*;
pub use utf8::Utf8Decoder;
pub use workspace::{NoWorkspaces, StaticWorkspaceResolver, WorkspaceResolver};
