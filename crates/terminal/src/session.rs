//! A single PTY-backed session and its output pipeline.

use crate::command_tracker::CommandTracker;
use crate::history::{CommandHistoryEntry, CommandHistorySink};
use crate::osc::{self, OscStream};
use crate::pty_handler::{PtyListener, PtyProcess};
use crate::scrollback::Scrollback;
use crate::spool::ScrollbackSpool;
use crate::subscription::{SubscriberRegistry, TerminalEvent};
use crate::types::{now_millis, ExitInfo, SessionInfo, SessionStatus, TermSize};
use crate::utf8::Utf8Decoder;
use parking_lot::Mutex;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use util::ResultExt;

/// State shared between a [`Session`] and its reader thread.
pub(crate) struct SessionShared {
    pub id: String,
    pub workspace_id: Option<String>,
    pub created_at: u64,
    output: Mutex<SessionOutput>,
    /// Separate from `output` so the tracker callback can read it.
    cwd: Arc<Mutex<Option<PathBuf>>>,
    killed: AtomicBool,
}

struct SessionOutput {
    status: SessionStatus,
    scrollback: Scrollback,
    tracker: CommandTracker,
    decoder: Utf8Decoder,
    osc: OscStream,
    size: TermSize,
    last_resize_seq: Option<u64>,
}

impl SessionShared {
    pub fn new(
        id: String,
        workspace_id: Option<String>,
        cwd: PathBuf,
        size: TermSize,
        scrollback_limit: usize,
        history: Arc<dyn CommandHistorySink>,
    ) -> Arc<Self> {
        let cwd = Arc::new(Mutex::new(Some(cwd)));
        let tracker = {
            let session_id = id.clone();
            let workspace_id = workspace_id.clone();
            let cwd = cwd.clone();
            CommandTracker::new(move |completed| {
                tracing::debug!(
                    session_id = %session_id,
                    exit_code = completed.exit_code,
                    "Command completed"
                );
                history.record(CommandHistoryEntry {
                    command: completed.command,
                    session_id: session_id.clone(),
                    workspace_id: workspace_id.clone(),
                    cwd: cwd.lock().clone(),
                    exit_code: Some(completed.exit_code),
                    timestamp: now_millis(),
                });
            })
        };

        Arc::new(Self {
            id,
            workspace_id,
            created_at: now_millis(),
            output: Mutex::new(SessionOutput {
                status: SessionStatus::Spawning,
                scrollback: Scrollback::new(scrollback_limit),
                tracker,
                decoder: Utf8Decoder::new(),
                osc: OscStream::new(),
                size,
                last_resize_seq: None,
            }),
            cwd,
            killed: AtomicBool::new(false),
        })
    }

    pub fn is_killed(&self) -> bool {
        self.killed.load(Ordering::SeqCst)
    }
}

/// Feeds PTY output through decode, marker parsing, tracking, scrollback,
/// broadcast and spool. Runs on the session's reader thread.
pub(crate) struct SessionPipeline {
    shared: Arc<SessionShared>,
    registry: Arc<SubscriberRegistry>,
    spool: Option<Arc<ScrollbackSpool>>,
}

impl SessionPipeline {
    pub fn new(
        shared: Arc<SessionShared>,
        registry: Arc<SubscriberRegistry>,
        spool: Option<Arc<ScrollbackSpool>>,
    ) -> Self {
        Self {
            shared,
            registry,
            spool,
        }
    }

    fn publish(&self, output: &mut SessionOutput, text: String) {
        if text.is_empty() {
            return;
        }
        output.scrollback.push_str(&text);
        if let Some(spool) = &self.spool {
            spool.append(&self.shared.id, &text);
        }
        self.registry
            .broadcast(&self.shared.id, &TerminalEvent::Data { data: text });
    }
}

impl PtyListener for SessionPipeline {
    fn on_data(&mut self, data: &[u8]) {
        if self.shared.is_killed() {
            return;
        }
        let mut output = self.shared.output.lock();
        if self.shared.is_killed() {
            return;
        }

        let text = output.decoder.decode(data);
        if text.is_empty() {
            return;
        }
        let parsed = output.osc.push(&text);
        for event in &parsed.events {
            output.tracker.process_event(event);
        }
        if let Some(cwd) = osc::parse_osc7_cwd(&parsed.clean_data) {
            tracing::trace!(session_id = %self.shared.id, cwd = %cwd.display(), "Working directory changed");
            *self.shared.cwd.lock() = Some(cwd);
        }
        self.publish(&mut output, parsed.clean_data);
    }

    fn on_exit(&mut self, exit: ExitInfo) {
        if self.shared.is_killed() {
            tracing::debug!(session_id = %self.shared.id, "Dropping exit of killed session");
            return;
        }
        let mut output = self.shared.output.lock();
        if self.shared.is_killed() {
            return;
        }

        // Release anything held back waiting for the rest of a sequence.
        let tail = output.decoder.flush();
        let parsed = output.osc.push(&tail);
        for event in &parsed.events {
            output.tracker.process_event(event);
        }
        let mut text = parsed.clean_data;
        text.push_str(&output.osc.flush());
        self.publish(&mut output, text);

        tracing::info!(
            session_id = %self.shared.id,
            exit_code = exit.exit_code,
            signal = exit.signal.as_deref(),
            "Session process exited"
        );
        if let Some(spool) = &self.spool {
            spool.close(&self.shared.id);
        }
        output.status = SessionStatus::Exited {
            exit_code: exit.exit_code,
            signal: exit.signal.clone(),
        };
        self.registry.broadcast(
            &self.shared.id,
            &TerminalEvent::Exit {
                exit_code: exit.exit_code,
                signal: exit.signal,
            },
        );
    }
}

/// A live or exited session owned by the manager's table.
///
/// Lock order: the process lock may be held while taking the output lock,
/// never the reverse.
pub(crate) struct Session {
    shared: Arc<SessionShared>,
    process: Mutex<Option<Box<dyn PtyProcess>>>,
    pid: Option<u32>,
}

impl Session {
    pub fn new(shared: Arc<SessionShared>, process: Box<dyn PtyProcess>) -> Self {
        let pid = process.pid();
        {
            let mut output = shared.output.lock();
            // The child may already have exited before we got here.
            if output.status == SessionStatus::Spawning {
                output.status = SessionStatus::Running;
            }
        }
        Self {
            shared,
            process: Mutex::new(Some(process)),
            pid,
        }
    }

    pub fn id(&self) -> &str {
        &self.shared.id
    }

    pub fn is_alive(&self) -> bool {
        self.shared.output.lock().status.is_alive()
    }

    pub fn scrollback(&self) -> String {
        self.shared.output.lock().scrollback.as_str().to_string()
    }

    pub fn set_scrollback_limit(&self, limit: usize) {
        self.shared.output.lock().scrollback.set_limit(limit);
    }

    pub fn info(&self) -> SessionInfo {
        let cwd = self.shared.cwd.lock().clone();
        let output = self.shared.output.lock();
        SessionInfo {
            id: self.shared.id.clone(),
            workspace_id: self.shared.workspace_id.clone(),
            status: output.status.clone(),
            cwd,
            size: output.size,
            pid: self.pid,
            pending_command: output.tracker.pending_command().map(str::to_string),
            scrollback_bytes: output.scrollback.len(),
            created_at: self.shared.created_at,
        }
    }

    pub fn write(&self, data: &[u8]) -> bool {
        if !self.is_alive() {
            return false;
        }
        let mut process = self.process.lock();
        let Some(process) = process.as_mut() else {
            return false;
        };
        process
            .write(data)
            .map_err(|e| e.context(format!("write to session {}", self.shared.id)))
            .warn_on_err()
            .is_some()
    }

    /// Apply a geometry change unless `seq` is older than the last applied one.
    pub fn resize(&self, size: TermSize, seq: Option<u64>) -> bool {
        if !size.is_valid() {
            return false;
        }
        {
            let mut output = self.shared.output.lock();
            if !output.status.is_alive() {
                return false;
            }
            if let (Some(seq), Some(last)) = (seq, output.last_resize_seq) {
                if seq < last {
                    tracing::debug!(
                        session_id = %self.shared.id,
                        seq,
                        last,
                        "Discarding stale resize"
                    );
                    return false;
                }
            }
            output.size = size;
            if seq.is_some() {
                output.last_resize_seq = seq;
            }
        }

        let mut process = self.process.lock();
        let Some(process) = process.as_mut() else {
            return false;
        };
        // Apply whatever size won, in case a newer resize raced this one.
        let size = self.shared.output.lock().size;
        process
            .resize(size)
            .map_err(|e| e.context(format!("resize session {}", self.shared.id)))
            .warn_on_err()
            .is_some()
    }

    pub fn signal(&self, signal: &str) -> bool {
        if !self.is_alive() {
            return false;
        }
        let mut process = self.process.lock();
        let Some(process) = process.as_mut() else {
            return false;
        };
        process
            .signal(signal)
            .map_err(|e| e.context(format!("signal session {}", self.shared.id)))
            .warn_on_err()
            .unwrap_or(false)
    }

    /// Drop all further output and exit reports from the reader.
    pub fn mark_killed(&self) {
        self.shared.killed.store(true, Ordering::SeqCst);
    }

    /// Silence the reader, reset tracker and buffers, and end the process.
    pub fn kill(&self) {
        self.mark_killed();
        {
            // Waits for any chunk that is mid-pipeline.
            let mut output = self.shared.output.lock();
            output.tracker.clear();
            output.scrollback.clear();
        }
        self.shared.cwd.lock().take();

        if let Some(mut process) = self.process.lock().take() {
            process
                .kill()
                .map_err(|e| e.context(format!("kill session {}", self.shared.id)))
                .warn_on_err();
        }
    }
}
