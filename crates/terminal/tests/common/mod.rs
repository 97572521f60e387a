//! Shared helpers for terminal integration tests.

// Not every test binary uses every helper.
#![allow(dead_code)]

use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use terminal::test_support::FakePtySpawner;
use terminal::{
    JsonlHistoryStore, ManagerOptions, ScrollbackSpool, ShellCommand, Subscription,
    TerminalEvent, TerminalManager,
};

pub use tempfile::{tempdir, TempDir};

/// Upper bound for anything that waits on a real shell.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);

const POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Isolated data directory with history and spool locations.
pub struct TestEnv {
    pub temp_dir: TempDir,
    pub history_path: PathBuf,
    pub spool_dir: PathBuf,
}

impl TestEnv {
    pub fn new() -> Self {
        let temp_dir = tempdir().expect("Failed to create temp directory");
        let history_path = temp_dir.path().join("command-history.jsonl");
        let spool_dir = temp_dir.path().join("scrollback");
        Self {
            temp_dir,
            history_path,
            spool_dir,
        }
    }

    pub fn open_history(&self) -> Arc<JsonlHistoryStore> {
        Arc::new(JsonlHistoryStore::open(&self.history_path).expect("should open history"))
    }

    pub fn open_spool(&self) -> Arc<ScrollbackSpool> {
        Arc::new(ScrollbackSpool::open(&self.spool_dir, 1024 * 1024).expect("should open spool"))
    }
}

/// Manager backed by the in-memory PTY.
pub fn fake_manager() -> (TerminalManager, FakePtySpawner) {
    let spawner = FakePtySpawner::new();
    let manager =
        TerminalManager::new(ManagerOptions::default()).with_spawner(Arc::new(spawner.clone()));
    (manager, spawner)
}

/// Manager that spawns a plain `/bin/sh` without login flags.
pub fn sh_manager() -> TerminalManager {
    TerminalManager::new(ManagerOptions {
        shell: ShellCommand {
            program: "/bin/sh".into(),
            args: Vec::new(),
        },
        ..ManagerOptions::default()
    })
}

/// Output collected until the exit event (or the timeout).
#[derive(Debug, Default)]
pub struct Transcript {
    pub output: String,
    pub exit: Option<(u32, Option<String>)>,
}

/// Poll `subscription` until an exit arrives or `timeout` passes.
pub fn collect_until_exit(subscription: &mut Subscription, timeout: Duration) -> Transcript {
    let deadline = Instant::now() + timeout;
    let mut transcript = Transcript::default();
    while Instant::now() < deadline {
        match subscription.try_recv() {
            Some(TerminalEvent::Data { data }) => transcript.output.push_str(&data),
            Some(TerminalEvent::Exit { exit_code, signal }) => {
                transcript.exit = Some((exit_code, signal));
                break;
            }
            None => std::thread::sleep(POLL_INTERVAL),
        }
    }
    transcript
}

/// Wait until `condition` holds or `timeout` passes.
pub fn wait_until(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        std::thread::sleep(POLL_INTERVAL);
    }
    condition()
}
