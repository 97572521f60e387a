//! Command history sink.
//!
//! Completed commands are handed to a [`CommandHistorySink`] from the PTY
//! reader thread, so implementations must not block. [`JsonlHistoryStore`]
//! queues entries to a writer thread that appends one JSON object per line.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::mpsc;
use std::thread;
use std::time::Duration;
use util::ResultExt;

/// One executed command as reported by shell integration.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommandHistoryEntry {
    pub command: String,
    pub session_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub workspace_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cwd: Option<PathBuf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,
    /// Milliseconds since the Unix epoch.
    pub timestamp: u64,
}

/// Destination for completed commands. Fire-and-forget.
#[cfg_attr(test, mockall::automock)]
pub trait CommandHistorySink: Send + Sync {
    fn record(&self, entry: CommandHistoryEntry);

    /// Forget every entry recorded for `session_id`.
    fn delete_session_history(&self, _session_id: &str) {}
}

/// Discards everything.
#[derive(Clone, Copy, Debug, Default)]
pub struct NoopHistorySink;

impl CommandHistorySink for NoopHistorySink {
    fn record(&self, _entry: CommandHistoryEntry) {}
}

enum HistoryCommand {
    Record(CommandHistoryEntry),
    DeleteSession(String),
    Flush(mpsc::Sender<()>),
}

/// Appends entries to a JSON-lines file on a background thread.
pub struct JsonlHistoryStore {
    path: PathBuf,
    sender: Option<mpsc::Sender<HistoryCommand>>,
    writer_thread: Option<thread::JoinHandle<()>>,
}

impl JsonlHistoryStore {
    /// Open (creating if needed) the history file and start the writer.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create history directory: {:?}", parent))?;
        }
        let writer = open_appender(&path)?;

        let (sender, receiver) = mpsc::channel();
        let thread_path = path.clone();
        let writer_thread = thread::Builder::new()
            .name("termhost-history-writer".into())
            .spawn(move || writer_loop(thread_path, writer, receiver))
            .context("Failed to spawn history writer thread")?;

        tracing::info!("Recording command history to {:?}", path);
        Ok(Self {
            path,
            sender: Some(sender),
            writer_thread: Some(writer_thread),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Block until every queued entry has been written, or `timeout` passes.
    pub fn flush(&self, timeout: Duration) -> bool {
        let (ack_tx, ack_rx) = mpsc::channel();
        self.send(HistoryCommand::Flush(ack_tx));
        ack_rx.recv_timeout(timeout).is_ok()
    }

    fn send(&self, command: HistoryCommand) {
        let Some(sender) = &self.sender else {
            return;
        };
        if sender.send(command).is_err() {
            tracing::warn!("History writer has stopped; dropping entry");
        }
    }
}

impl CommandHistorySink for JsonlHistoryStore {
    fn record(&self, entry: CommandHistoryEntry) {
        self.send(HistoryCommand::Record(entry));
    }

    fn delete_session_history(&self, session_id: &str) {
        self.send(HistoryCommand::DeleteSession(session_id.to_string()));
    }
}

impl Drop for JsonlHistoryStore {
    fn drop(&mut self) {
        // Closing the channel lets the writer drain and exit.
        self.sender.take();
        if let Some(handle) = self.writer_thread.take() {
            if handle.join().is_err() {
                tracing::warn!("History writer thread panicked");
            }
        }
    }
}

fn open_appender(path: &Path) -> Result<BufWriter<std::fs::File>> {
    let file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .with_context(|| format!("Failed to open history file: {:?}", path))?;
    Ok(BufWriter::new(file))
}

fn writer_loop(
    path: PathBuf,
    mut writer: BufWriter<std::fs::File>,
    receiver: mpsc::Receiver<HistoryCommand>,
) {
    while let Ok(command) = receiver.recv() {
        match command {
            HistoryCommand::Record(entry) => {
                if let Err(e) = append_entry(&mut writer, &entry) {
                    tracing::warn!("Failed to record command history: {:#}", e);
                }
            }
            HistoryCommand::DeleteSession(session_id) => {
                if let Err(e) = writer.flush() {
                    tracing::warn!("Failed to flush command history: {}", e);
                }
                match remove_session_entries(&path, &session_id) {
                    Ok(removed) => {
                        tracing::debug!(session_id = %session_id, removed, "Deleted command history")
                    }
                    Err(e) => tracing::warn!("Failed to delete command history: {:#}", e),
                }
                // The file was replaced; reopen so appends land in the new one.
                if let Some(reopened) = open_appender(&path).log_err() {
                    writer = reopened;
                }
            }
            HistoryCommand::Flush(ack) => {
                if let Err(e) = writer.flush() {
                    tracing::warn!("Failed to flush command history: {}", e);
                }
                let _ = ack.send(());
            }
        }
    }

    if let Err(e) = writer.flush() {
        tracing::warn!("Failed to flush command history on shutdown: {}", e);
    }
}

fn append_entry(writer: &mut BufWriter<std::fs::File>, entry: &CommandHistoryEntry) -> Result<()> {
    serde_json::to_writer(&mut *writer, entry).context("Failed to serialize history entry")?;
    writeln!(writer).context("Failed to write history entry")?;
    writer.flush().context("Failed to flush history entry")?;
    Ok(())
}

/// Rewrite the file without `session_id`'s lines. Returns how many were removed.
fn remove_session_entries(path: &Path, session_id: &str) -> Result<usize> {
    let content = match std::fs::read_to_string(path) {
        Ok(content) => content,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(0),
        Err(e) => return Err(e).with_context(|| format!("Failed to read {:?}", path)),
    };

    let mut kept = String::with_capacity(content.len());
    let mut removed = 0;
    for line in content.lines() {
        let belongs_to_session = serde_json::from_str::<CommandHistoryEntry>(line)
            .map(|entry| entry.session_id == session_id)
            .unwrap_or(false);
        if belongs_to_session {
            removed += 1;
        } else {
            kept.push_str(line);
            kept.push('\n');
        }
    }

    if removed > 0 {
        let temp = path.with_extension("jsonl.tmp");
        std::fs::write(&temp, kept).with_context(|| format!("Failed to write {:?}", temp))?;
        std::fs::rename(&temp, path).with_context(|| format!("Failed to replace {:?}", path))?;
    }
    Ok(removed)
}

/// Read every entry from a history file. Malformed lines are skipped.
pub fn load_history(path: &Path) -> Result<Vec<CommandHistoryEntry>> {
    let file = match std::fs::File::open(path) {
        Ok(file) => file,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e).with_context(|| format!("Failed to open {:?}", path)),
    };

    let mut entries = Vec::new();
    for (index, line) in BufReader::new(file).lines().enumerate() {
        let line = line.with_context(|| format!("Failed to read {:?}", path))?;
        if line.trim().is_empty() {
            continue;
        }
        match serde_json::from_str(&line) {
            Ok(entry) => entries.push(entry),
            Err(e) => tracing::warn!("Skipping malformed history line {}: {}", index + 1, e),
        }
    }
    Ok(entries)
}
