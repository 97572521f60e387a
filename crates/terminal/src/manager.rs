//! Session table and the operations clients drive it with.
//!
//! The manager owns every PTY. Sessions are keyed by the client's pane id,
//! survive client detach, and are only torn down by an explicit kill.
//! Subscriptions are keyed by id as well, so a client can subscribe before
//! the session exists and keep receiving across a re-spawn.

use crate::history::{CommandHistorySink, NoopHistorySink};
use crate::pty_handler::{NativePtySpawner, PtySpawner, SpawnRequest};
use crate::session::{Session, SessionPipeline, SessionShared};
use crate::shell::{self, ShellCommand};
use crate::spool::ScrollbackSpool;
use crate::subscription::{SubscriberRegistry, Subscription};
use crate::types::{AttachResult, CreateOptions, KillOptions, SessionInfo, TermSize};
use crate::workspace::{NoWorkspaces, WorkspaceResolver};
use anyhow::{Context, Result};
use collections::FxHashMap;
use parking_lot::Mutex;
use settings::constants::{scrollback, terminal};
use settings::Config;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use util::debug_panic;

/// Signal sent when a client does not name one.
pub const DEFAULT_SIGNAL: &str = "SIGINT";

/// Spawn-time settings, usually taken from the config file.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ManagerOptions {
    pub shell: ShellCommand,
    /// Extra environment for every session.
    pub env: BTreeMap<String, String>,
    pub default_size: TermSize,
    pub scrollback_limit: usize,
}

impl ManagerOptions {
    pub fn from_config(config: &Config) -> Self {
        let (cols, rows) = config.default_size();
        Self {
            shell: ShellCommand::from_config(config),
            env: config.env.clone(),
            default_size: TermSize::new(cols, rows),
            scrollback_limit: config.scrollback_limit(),
        }
    }
}

impl Default for ManagerOptions {
    fn default() -> Self {
        Self::from_config(&Config::default())
    }
}

/// Owns all sessions and routes their output to subscribers.
pub struct TerminalManager {
    options: ManagerOptions,
    scrollback_limit: AtomicUsize,
    sessions: Mutex<FxHashMap<String, Arc<Session>>>,
    registry: Arc<SubscriberRegistry>,
    spawner: Arc<dyn PtySpawner>,
    resolver: Arc<dyn WorkspaceResolver>,
    history: Arc<dyn CommandHistorySink>,
    spool: Option<Arc<ScrollbackSpool>>,
}

impl TerminalManager {
    pub fn new(options: ManagerOptions) -> Self {
        Self {
            scrollback_limit: AtomicUsize::new(options.scrollback_limit),
            options,
            sessions: Mutex::new(FxHashMap::default()),
            registry: SubscriberRegistry::new(),
            spawner: Arc::new(NativePtySpawner),
            resolver: Arc::new(NoWorkspaces),
            history: Arc::new(NoopHistorySink),
            spool: None,
        }
    }

    pub fn with_spawner(mut self, spawner: Arc<dyn PtySpawner>) -> Self {
        self.spawner = spawner;
        self
    }

    pub fn with_resolver(mut self, resolver: Arc<dyn WorkspaceResolver>) -> Self {
        self.resolver = resolver;
        self
    }

    pub fn with_history(mut self, history: Arc<dyn CommandHistorySink>) -> Self {
        self.history = history;
        self
    }

    pub fn with_spool(mut self, spool: Arc<ScrollbackSpool>) -> Self {
        self.spool = Some(spool);
        self
    }

    /// Attach to the live session for `id`, or spawn one.
    ///
    /// An exited session is replaced by a fresh process. Existing
    /// subscriptions for `id` keep receiving from the new one.
    pub fn create_or_attach(&self, id: &str, options: CreateOptions) -> Result<AttachResult> {
        let mut sessions = self.sessions.lock();
        if let Some(existing) = sessions.get(id) {
            if existing.is_alive() {
                tracing::debug!(session_id = id, "Attaching to live session");
                return Ok(AttachResult {
                    is_new: false,
                    scrollback: existing.scrollback(),
                });
            }
            tracing::info!(session_id = id, "Replacing exited session");
        }

        let cwd = self.resolve_cwd(&options);
        let size = self.initial_size(&options);
        let request = SpawnRequest {
            session_id: id.to_string(),
            shell: self.options.shell.clone(),
            cwd: cwd.clone(),
            env: self.session_env(id, &options),
            size,
        };

        let shared = SessionShared::new(
            id.to_string(),
            options.workspace_id.clone(),
            cwd,
            size,
            self.scrollback_limit(),
            self.history.clone(),
        );
        let pipeline = SessionPipeline::new(shared.clone(), self.registry.clone(), self.spool.clone());
        let process = self
            .spawner
            .spawn(&request, Box::new(pipeline))
            .with_context(|| format!("Failed to start session {}", id))?;

        let session = Arc::new(Session::new(shared, process));
        if let Some(previous) = sessions.insert(id.to_string(), session.clone()) {
            if previous.is_alive() {
                debug_panic!("replaced live session {}", id);
            }
        }
        drop(sessions);

        for command in &options.initial_commands {
            let line = format!("{}{}", command, shell::newline());
            if !session.write(line.as_bytes()) {
                tracing::warn!(session_id = id, "Failed to send initial command");
            }
        }

        tracing::info!(
            session_id = id,
            workspace_id = options.workspace_id.as_deref(),
            cols = size.cols,
            rows = size.rows,
            "Session created"
        );
        Ok(AttachResult {
            is_new: true,
            scrollback: String::new(),
        })
    }

    /// Forward input. False if the id is unknown, exited, or the write failed.
    pub fn write(&self, id: &str, data: &[u8]) -> bool {
        self.session(id).is_some_and(|session| session.write(data))
    }

    /// Resize unless a dimension is zero or `seq` is older than the last one applied.
    pub fn resize(&self, id: &str, cols: u16, rows: u16, seq: Option<u64>) -> bool {
        self.session(id)
            .is_some_and(|session| session.resize(TermSize::new(cols, rows), seq))
    }

    /// Signal the foreground process group. Defaults to `SIGINT`.
    pub fn signal(&self, id: &str, signal: Option<&str>) -> bool {
        let signal = signal.unwrap_or(DEFAULT_SIGNAL);
        self.session(id)
            .is_some_and(|session| session.signal(signal))
    }

    /// Listen to output and exits for `id`. The session need not exist yet.
    pub fn subscribe(&self, id: &str) -> Subscription {
        self.registry.subscribe(id)
    }

    /// Remove one subscription. The session keeps running.
    pub fn detach(&self, subscription: Subscription) {
        tracing::debug!(
            session_id = subscription.session_id(),
            subscriber = subscription.id(),
            "Detaching"
        );
        subscription.unsubscribe();
    }

    /// Terminate the process and forget the session.
    ///
    /// With `delete_history` the spooled scrollback and recorded commands for
    /// `id` are removed too, even if no session is live.
    pub fn kill(&self, id: &str, options: KillOptions) -> bool {
        let session = {
            let mut sessions = self.sessions.lock();
            if let Some(session) = sessions.get(id) {
                session.mark_killed();
            }
            sessions.remove(id)
        };

        if options.delete_history {
            if let Some(spool) = &self.spool {
                spool.delete(id);
            }
            self.history.delete_session_history(id);
        } else if let Some(spool) = &self.spool {
            spool.close(id);
        }

        let Some(session) = session else {
            return false;
        };
        session.kill();
        tracing::info!(session_id = id, "Session killed");
        true
    }

    pub fn get_session(&self, id: &str) -> Option<SessionInfo> {
        self.session(id).map(|session| session.info())
    }

    /// Retained in-memory scrollback.
    pub fn get_history(&self, id: &str) -> Option<String> {
        self.session(id).map(|session| session.scrollback())
    }

    /// Scrollback mirrored to disk, available across restarts.
    pub fn persisted_history(&self, id: &str) -> Option<String> {
        self.spool.as_ref()?.read(id)
    }

    /// All sessions, oldest first.
    pub fn list_sessions(&self) -> Vec<SessionInfo> {
        let sessions: Vec<Arc<Session>> = self.sessions.lock().values().cloned().collect();
        let mut infos: Vec<SessionInfo> = sessions.iter().map(|session| session.info()).collect();
        infos.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        infos
    }

    pub fn listener_count(&self, id: &str) -> usize {
        self.registry.listener_count(id)
    }

    pub fn scrollback_limit(&self) -> usize {
        self.scrollback_limit.load(Ordering::Relaxed)
    }

    /// Change the per-session cap and trim existing buffers to it.
    pub fn set_scrollback_limit(&self, bytes: usize) {
        let limit = bytes.clamp(scrollback::MIN_BYTES, scrollback::MAX_BYTES);
        if self.scrollback_limit.swap(limit, Ordering::Relaxed) == limit {
            return;
        }
        let sessions: Vec<Arc<Session>> = self.sessions.lock().values().cloned().collect();
        for session in sessions {
            session.set_scrollback_limit(limit);
        }
        tracing::info!("Scrollback limit set to {} bytes", limit);
    }

    /// Kill every session. Returns how many there were.
    pub fn kill_all(&self) -> usize {
        let sessions: Vec<Arc<Session>> = {
            let mut table = self.sessions.lock();
            for session in table.values() {
                session.mark_killed();
            }
            table.drain().map(|(_, session)| session).collect()
        };
        for session in &sessions {
            session.kill();
            if let Some(spool) = &self.spool {
                spool.close(session.id());
            }
        }
        if !sessions.is_empty() {
            tracing::info!("Killed {} sessions", sessions.len());
        }
        sessions.len()
    }

    fn session(&self, id: &str) -> Option<Arc<Session>> {
        self.sessions.lock().get(id).cloned()
    }

    /// Explicit cwd, then the workspace directory, then home, then the
    /// process cwd, then the filesystem root.
    fn resolve_cwd(&self, options: &CreateOptions) -> PathBuf {
        if let Some(requested) = &options.cwd {
            let requested = match requested.to_str() {
                Some(raw) => settings::expand_tilde(raw),
                None => requested.clone(),
            };
            if requested.is_dir() {
                return requested;
            }
            tracing::warn!("Requested cwd {:?} does not exist, falling back", requested);
        }

        if let Some(dir) = self
            .resolver
            .resolve_working_directory(options.workspace_id.as_deref())
        {
            if dir.is_dir() {
                return dir;
            }
            tracing::warn!(
                workspace_id = options.workspace_id.as_deref(),
                "Workspace directory {:?} does not exist, falling back",
                dir
            );
        }

        match dirs::home_dir() {
            Some(home) if home.is_dir() => return home,
            Some(home) => tracing::warn!("Home directory {:?} does not exist, falling back", home),
            None => tracing::warn!("No home directory, falling back to the current directory"),
        }

        match std::env::current_dir() {
            Ok(dir) if dir.is_dir() => dir,
            _ => {
                tracing::warn!("Current directory unavailable, using /");
                Path::new("/").to_path_buf()
            }
        }
    }

    fn initial_size(&self, options: &CreateOptions) -> TermSize {
        let size = TermSize::new(
            options.cols.unwrap_or(self.options.default_size.cols),
            options.rows.unwrap_or(self.options.default_size.rows),
        );
        if size.is_valid() {
            size
        } else {
            tracing::warn!(
                "Ignoring invalid size {}x{}, using {}x{}",
                size.cols,
                size.rows,
                self.options.default_size.cols,
                self.options.default_size.rows
            );
            self.options.default_size
        }
    }

    /// Config env, then request env, then the variables termhost owns.
    fn session_env(&self, id: &str, options: &CreateOptions) -> Vec<(String, String)> {
        let mut env: BTreeMap<String, String> = self.options.env.clone();
        env.extend(options.env.clone());
        env.insert("TERM".into(), terminal::TERM.into());
        env.insert("COLORTERM".into(), "truecolor".into());
        env.insert("TERMHOST_PANE_ID".into(), id.into());
        match &options.workspace_id {
            Some(workspace_id) => {
                env.insert("TERMHOST_WORKSPACE_ID".into(), workspace_id.clone());
            }
            None => {
                env.remove("TERMHOST_WORKSPACE_ID");
            }
        }
        env.into_iter().collect()
    }
}

impl Drop for TerminalManager {
    fn drop(&mut self) {
        self.kill_all();
    }
}

#[cfg(test)]
#[path = "manager_tests.rs"]
mod tests;
