//! In-memory PTY for tests.
//!
//! [`FakePtySpawner`] records every spawn and hands back a [`FakePtyHandle`]
//! that drives the session's listener directly, so output and exits are
//! delivered synchronously on the calling thread.

use crate::pty_handler::{normalize_signal_name, PtyListener, PtyProcess, PtySpawner, SpawnRequest};
use crate::types::{ExitInfo, TermSize};
use anyhow::{bail, Result};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

const FIRST_FAKE_PID: u32 = 10_000;

const KNOWN_SIGNALS: &[&str] = &[
    "SIGINT", "SIGTERM", "SIGKILL", "SIGHUP", "SIGQUIT", "SIGTSTP", "SIGCONT", "SIGWINCH",
    "SIGUSR1", "SIGUSR2",
];

/// Spawner that never touches the OS.
#[derive(Clone, Default)]
pub struct FakePtySpawner {
    inner: Arc<Mutex<SpawnerState>>,
    next_pid: Arc<AtomicU32>,
}

#[derive(Default)]
struct SpawnerState {
    spawned: Vec<FakePtyHandle>,
    fail_next: Option<String>,
}

impl FakePtySpawner {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next spawn return an error with `message`.
    pub fn fail_next_spawn(&self, message: impl Into<String>) {
        self.inner.lock().fail_next = Some(message.into());
    }

    pub fn spawn_count(&self) -> usize {
        self.inner.lock().spawned.len()
    }

    pub fn handles(&self) -> Vec<FakePtyHandle> {
        self.inner.lock().spawned.clone()
    }

    /// Most recent spawn.
    pub fn last(&self) -> Option<FakePtyHandle> {
        self.inner.lock().spawned.last().cloned()
    }

    /// Most recent spawn for `session_id`.
    pub fn for_session(&self, session_id: &str) -> Option<FakePtyHandle> {
        self.inner
            .lock()
            .spawned
            .iter()
            .rev()
            .find(|handle| handle.shared.request.session_id == session_id)
            .cloned()
    }
}

impl PtySpawner for FakePtySpawner {
    fn spawn(
        &self,
        request: &SpawnRequest,
        listener: Box<dyn PtyListener>,
    ) -> Result<Box<dyn PtyProcess>> {
        let mut state = self.inner.lock();
        if let Some(message) = state.fail_next.take() {
            bail!("{}", message);
        }

        let pid = FIRST_FAKE_PID + self.next_pid.fetch_add(1, Ordering::Relaxed);
        let shared = Arc::new(FakeShared {
            request: request.clone(),
            pid,
            listener: Mutex::new(Some(listener)),
            state: Mutex::new(FakeState::default()),
        });
        state.spawned.push(FakePtyHandle {
            shared: shared.clone(),
        });
        Ok(Box::new(FakePty { shared }))
    }
}

struct FakeShared {
    request: SpawnRequest,
    pid: u32,
    listener: Mutex<Option<Box<dyn PtyListener>>>,
    state: Mutex<FakeState>,
}

#[derive(Default)]
struct FakeState {
    written: Vec<u8>,
    resizes: Vec<TermSize>,
    signals: Vec<String>,
    killed: bool,
    exited: bool,
}

/// Test-side view of one fake child.
#[derive(Clone)]
pub struct FakePtyHandle {
    shared: Arc<FakeShared>,
}

impl FakePtyHandle {
    pub fn request(&self) -> SpawnRequest {
        self.shared.request.clone()
    }

    pub fn pid(&self) -> u32 {
        self.shared.pid
    }

    /// Deliver output as if the child printed it.
    pub fn emit(&self, text: &str) {
        self.emit_bytes(text.as_bytes());
    }

    pub fn emit_bytes(&self, bytes: &[u8]) {
        if let Some(listener) = self.shared.listener.lock().as_mut() {
            listener.on_data(bytes);
        }
    }

    /// End the child with `exit_code`.
    pub fn exit(&self, exit_code: u32) {
        self.exit_with(ExitInfo {
            exit_code,
            signal: None,
        });
    }

    /// End the child. The listener is released afterwards, like a reader
    /// thread that returns after reporting.
    pub fn exit_with(&self, exit: ExitInfo) {
        self.shared.state.lock().exited = true;
        let listener = self.shared.listener.lock().take();
        if let Some(mut listener) = listener {
            listener.on_exit(exit);
        }
    }

    pub fn written(&self) -> Vec<u8> {
        self.shared.state.lock().written.clone()
    }

    pub fn written_string(&self) -> String {
        String::from_utf8_lossy(&self.written()).into_owned()
    }

    pub fn resizes(&self) -> Vec<TermSize> {
        self.shared.state.lock().resizes.clone()
    }

    pub fn signals(&self) -> Vec<String> {
        self.shared.state.lock().signals.clone()
    }

    pub fn is_killed(&self) -> bool {
        self.shared.state.lock().killed
    }

    pub fn is_exited(&self) -> bool {
        self.shared.state.lock().exited
    }
}

impl std::fmt::Debug for FakePtyHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FakePtyHandle")
            .field("session_id", &self.shared.request.session_id)
            .field("pid", &self.shared.pid)
            .finish()
    }
}

struct FakePty {
    shared: Arc<FakeShared>,
}

impl PtyProcess for FakePty {
    fn write(&mut self, data: &[u8]) -> Result<()> {
        let mut state = self.shared.state.lock();
        if state.killed || state.exited {
            bail!("fake PTY is closed");
        }
        state.written.extend_from_slice(data);
        Ok(())
    }

    fn resize(&mut self, size: TermSize) -> Result<()> {
        self.shared.state.lock().resizes.push(size);
        Ok(())
    }

    fn signal(&mut self, signal: &str) -> Result<bool> {
        let name = normalize_signal_name(signal);
        if !KNOWN_SIGNALS.contains(&name.as_str()) {
            return Ok(false);
        }
        let mut state = self.shared.state.lock();
        if state.exited {
            return Ok(false);
        }
        state.signals.push(name);
        Ok(true)
    }

    fn kill(&mut self) -> Result<()> {
        self.shared.state.lock().killed = true;
        Ok(())
    }

    fn pid(&self) -> Option<u32> {
        Some(self.shared.pid)
    }
}
