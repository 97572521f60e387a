//! On-disk scrollback mirror.
//!
//! Each session's clean output is appended to `<dir>/<file-name>.log` by a
//! single background thread so a restarted daemon can still show what a pane
//! printed. Files are cut to their newest half once they pass the size cap.

use anyhow::{Context, Result};
use collections::{FxBuildHasher, FxHashMap};
use std::fs::File;
use std::hash::BuildHasher;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::mpsc;
use std::thread;
use std::time::Duration;

/// How long `read` waits for queued writes to land.
const READ_FLUSH_TIMEOUT: Duration = Duration::from_secs(2);
/// Encoded ids longer than this are shortened and suffixed with a hash.
const MAX_FILE_STEM: usize = 180;
/// Extra distance searched for a newline when halving a file.
const LINE_SEARCH_WINDOW: usize = 4096;

enum SpoolCommand {
    Append { session_id: String, data: String },
    Delete(String),
    /// Flush and release the handle; the file stays on disk.
    Close(String),
    Flush(mpsc::Sender<()>),
    OpenFiles(mpsc::Sender<usize>),
}

struct SpoolFile {
    writer: BufWriter<File>,
    len: u64,
}

/// Background writer for per-session scrollback files.
pub struct ScrollbackSpool {
    dir: PathBuf,
    sender: Option<mpsc::Sender<SpoolCommand>>,
    writer_thread: Option<thread::JoinHandle<()>>,
}

impl ScrollbackSpool {
    pub fn open(dir: impl Into<PathBuf>, max_file_bytes: u64) -> Result<Self> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir)
            .with_context(|| format!("Failed to create scrollback directory: {:?}", dir))?;

        let (sender, receiver) = mpsc::channel();
        let thread_dir = dir.clone();
        let max_file_bytes = max_file_bytes.max(2);
        let writer_thread = thread::Builder::new()
            .name("termhost-spool-writer".into())
            .spawn(move || SpoolWriter::new(thread_dir, max_file_bytes).run(receiver))
            .context("Failed to spawn scrollback spool thread")?;

        tracing::info!("Spooling scrollback to {:?}", dir);
        Ok(Self {
            dir,
            sender: Some(sender),
            writer_thread: Some(writer_thread),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Queue output for `session_id`. Never blocks on disk.
    pub fn append(&self, session_id: &str, data: &str) {
        if data.is_empty() {
            return;
        }
        self.send(SpoolCommand::Append {
            session_id: session_id.to_string(),
            data: data.to_string(),
        });
    }

    /// Everything spooled for `session_id`, including queued writes.
    pub fn read(&self, session_id: &str) -> Option<String> {
        self.flush(READ_FLUSH_TIMEOUT);
        let path = spool_path(&self.dir, session_id);
        match std::fs::read(&path) {
            Ok(bytes) => Some(String::from_utf8_lossy(&bytes).into_owned()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => None,
            Err(e) => {
                tracing::warn!("Failed to read spooled scrollback {:?}: {}", path, e);
                None
            }
        }
    }

    /// Remove the file for `session_id` once earlier writes are done.
    pub fn delete(&self, session_id: &str) {
        self.send(SpoolCommand::Delete(session_id.to_string()));
    }

    /// Flush and close the file for `session_id`, keeping its contents.
    ///
    /// A later append reopens it.
    pub fn close(&self, session_id: &str) {
        self.send(SpoolCommand::Close(session_id.to_string()));
    }

    /// Number of spool files the writer currently holds open.
    pub fn open_file_count(&self) -> usize {
        let (count_tx, count_rx) = mpsc::channel();
        self.send(SpoolCommand::OpenFiles(count_tx));
        count_rx.recv_timeout(READ_FLUSH_TIMEOUT).unwrap_or(0)
    }

    /// Block until queued commands are processed, or `timeout` passes.
    pub fn flush(&self, timeout: Duration) -> bool {
        let (ack_tx, ack_rx) = mpsc::channel();
        self.send(SpoolCommand::Flush(ack_tx));
        ack_rx.recv_timeout(timeout).is_ok()
    }

    fn send(&self, command: SpoolCommand) {
        let Some(sender) = &self.sender else {
            return;
        };
        if sender.send(command).is_err() {
            tracing::warn!("Scrollback spool has stopped; dropping write");
        }
    }
}

impl Drop for ScrollbackSpool {
    fn drop(&mut self) {
        self.sender.take();
        if let Some(handle) = self.writer_thread.take() {
            if handle.join().is_err() {
                tracing::warn!("Scrollback spool thread panicked");
            }
        }
    }
}

struct SpoolWriter {
    dir: PathBuf,
    max_file_bytes: u64,
    files: FxHashMap<String, SpoolFile>,
}

impl SpoolWriter {
    fn new(dir: PathBuf, max_file_bytes: u64) -> Self {
        Self {
            dir,
            max_file_bytes,
            files: FxHashMap::default(),
        }
    }

    fn run(mut self, receiver: mpsc::Receiver<SpoolCommand>) {
        while let Ok(command) = receiver.recv() {
            match command {
                SpoolCommand::Append { session_id, data } => {
                    if let Err(e) = self.append(&session_id, &data) {
                        tracing::warn!(session_id = %session_id, "Failed to spool scrollback: {:#}", e);
                        self.files.remove(&session_id);
                    }
                }
                SpoolCommand::Delete(session_id) => self.delete(&session_id),
                SpoolCommand::Close(session_id) => self.close(&session_id),
                SpoolCommand::Flush(ack) => {
                    self.flush_all();
                    let _ = ack.send(());
                }
                SpoolCommand::OpenFiles(reply) => {
                    let _ = reply.send(self.files.len());
                }
            }
        }
        self.flush_all();
    }

    fn append(&mut self, session_id: &str, data: &str) -> Result<()> {
        if !self.files.contains_key(session_id) {
            let file = open_spool_file(&spool_path(&self.dir, session_id))?;
            self.files.insert(session_id.to_string(), file);
        }
        let Some(file) = self.files.get_mut(session_id) else {
            return Ok(());
        };

        file.writer
            .write_all(data.as_bytes())
            .context("Failed to append to spool file")?;
        file.len += data.len() as u64;

        if file.len > self.max_file_bytes {
            file.writer.flush().context("Failed to flush spool file")?;
            self.files.remove(session_id);
            let path = spool_path(&self.dir, session_id);
            truncate_to_newest_half(&path, self.max_file_bytes)?;
            let reopened = open_spool_file(&path)?;
            self.files.insert(session_id.to_string(), reopened);
        }
        Ok(())
    }

    fn delete(&mut self, session_id: &str) {
        self.files.remove(session_id);
        let path = spool_path(&self.dir, session_id);
        match std::fs::remove_file(&path) {
            Ok(()) => tracing::debug!(session_id, "Deleted spooled scrollback"),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => tracing::warn!("Failed to delete {:?}: {}", path, e),
        }
    }

    fn close(&mut self, session_id: &str) {
        let Some(mut file) = self.files.remove(session_id) else {
            return;
        };
        if let Err(e) = file.writer.flush() {
            tracing::warn!(session_id, "Failed to flush spool file on close: {}", e);
        }
    }

    fn flush_all(&mut self) {
        for (session_id, file) in &mut self.files {
            if let Err(e) = file.writer.flush() {
                tracing::warn!(session_id = %session_id, "Failed to flush spool file: {}", e);
            }
        }
    }
}

fn open_spool_file(path: &Path) -> Result<SpoolFile> {
    let file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .with_context(|| format!("Failed to open spool file: {:?}", path))?;
    let len = file
        .metadata()
        .with_context(|| format!("Failed to stat spool file: {:?}", path))?
        .len();
    Ok(SpoolFile {
        writer: BufWriter::new(file),
        len,
    })
}

/// Keep roughly the last `max_file_bytes / 2` bytes, starting on a line or
/// at least a char boundary.
fn truncate_to_newest_half(path: &Path, max_file_bytes: u64) -> Result<()> {
    let bytes = std::fs::read(path).with_context(|| format!("Failed to read {:?}", path))?;
    let keep = (max_file_bytes / 2) as usize;
    if bytes.len() <= keep {
        return Ok(());
    }

    let start = newest_tail_start(&bytes, keep);
    let temp = path.with_extension("log.tmp");
    std::fs::write(&temp, &bytes[start..]).with_context(|| format!("Failed to write {:?}", temp))?;
    std::fs::rename(&temp, path).with_context(|| format!("Failed to replace {:?}", path))?;
    tracing::debug!("Halved spool file {:?} ({} -> {} bytes)", path, bytes.len(), bytes.len() - start);
    Ok(())
}

fn newest_tail_start(bytes: &[u8], keep: usize) -> usize {
    let mut start = bytes.len().saturating_sub(keep);
    if start > 0 && bytes[start - 1] == b'\n' {
        return start;
    }
    let search_end = (start + LINE_SEARCH_WINDOW).min(bytes.len());
    if let Some(offset) = bytes[start..search_end].iter().position(|&b| b == b'\n') {
        return start + offset + 1;
    }
    // Skip UTF-8 continuation bytes.
    while start < bytes.len() && (bytes[start] & 0xC0) == 0x80 {
        start += 1;
    }
    start
}

/// File for `session_id`: percent-encoded, shortened with a hash when long.
pub fn spool_path(dir: &Path, session_id: &str) -> PathBuf {
    dir.join(format!("{}.log", file_stem(session_id)))
}

fn file_stem(session_id: &str) -> String {
    let encoded = match session_id {
        "" => "_".to_string(),
        "." => "%2E".to_string(),
        ".." => "%2E%2E".to_string(),
        id => urlencoding::encode(id).into_owned(),
    };
    if encoded.len() <= MAX_FILE_STEM {
        return encoded;
    }
    let hash = FxBuildHasher::default().hash_one(session_id);
    // Encoded output is ASCII, so any byte index is a char boundary.
    format!("{}-{:016x}", &encoded[..MAX_FILE_STEM - 17], hash)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use test_case::test_case;

    const FLUSH_TIMEOUT: Duration = Duration::from_secs(5);

    fn temp_spool(max_file_bytes: u64) -> (ScrollbackSpool, tempfile::TempDir) {
        let dir = tempfile::tempdir().expect("should create tempdir");
        let spool =
            ScrollbackSpool::open(dir.path().join("scrollback"), max_file_bytes).expect("should open");
        (spool, dir)
    }

    #[test]
    fn appends_are_readable() {
        let (spool, _dir) = temp_spool(1024 * 1024);
        spool.append("pane-1", "hello ");
        spool.append("pane-1", "world\n");
        spool.append("pane-2", "other");

        assert_eq!(spool.read("pane-1").as_deref(), Some("hello world\n"));
        assert_eq!(spool.read("pane-2").as_deref(), Some("other"));
        assert_eq!(spool.read("pane-3"), None);
    }

    #[test]
    fn delete_removes_file() {
        let (spool, _dir) = temp_spool(1024 * 1024);
        spool.append("pane-1", "data");
        spool.delete("pane-1");
        assert!(spool.flush(FLUSH_TIMEOUT));

        assert_eq!(spool.read("pane-1"), None);
        assert!(!spool_path(spool.dir(), "pane-1").exists());
    }

    #[test]
    fn close_releases_handle_and_keeps_contents() {
        let (spool, _dir) = temp_spool(1024 * 1024);
        for index in 0..50 {
            spool.append(&format!("pane-{}", index), "line\n");
        }
        assert_eq!(spool.open_file_count(), 50);

        for index in 0..50 {
            spool.close(&format!("pane-{}", index));
        }
        assert_eq!(spool.open_file_count(), 0);
        assert_eq!(spool.read("pane-7").as_deref(), Some("line\n"));

        spool.append("pane-7", "more\n");
        assert_eq!(spool.read("pane-7").as_deref(), Some("line\nmore\n"));
        assert_eq!(spool.open_file_count(), 1);
    }

    #[test]
    fn append_after_delete_starts_fresh() {
        let (spool, _dir) = temp_spool(1024 * 1024);
        spool.append("pane-1", "old");
        spool.delete("pane-1");
        spool.append("pane-1", "new");
        assert_eq!(spool.read("pane-1").as_deref(), Some("new"));
    }

    #[test]
    fn oversized_file_keeps_newest_half() {
        let (spool, _dir) = temp_spool(64);
        for i in 0..20 {
            spool.append("pane", &format!("line {:02}\n", i));
        }
        let content = spool.read("pane").expect("file exists");

        assert!(content.len() as u64 <= 64);
        assert!(content.ends_with("line 19\n"));
        assert!(content.starts_with("line "));
    }

    #[test_case("pane-1", "pane-1"; "plain")]
    #[test_case("a/b", "a%2Fb"; "slash")]
    #[test_case("..", "%2E%2E"; "parent")]
    #[test_case("", "_"; "empty")]
    fn file_names_are_safe(id: &str, stem: &str) {
        assert_eq!(file_stem(id), stem);
    }

    #[test]
    fn long_ids_are_shortened_and_distinct() {
        let a = file_stem(&"x".repeat(256));
        let b = file_stem(&format!("{}y", "x".repeat(255)));
        assert_eq!(a.len(), MAX_FILE_STEM);
        assert_ne!(a, b);
    }

    #[test]
    fn tail_start_respects_char_boundaries() {
        let text = "ééééé".as_bytes();
        let start = newest_tail_start(text, 5);
        assert!(std::str::from_utf8(&text[start..]).is_ok());
    }

    #[test]
    fn drop_flushes_queued_writes() {
        let (spool, _dir) = temp_spool(1024);
        let path = spool_path(spool.dir(), "pane");
        spool.append("pane", "bye");
        drop(spool);
        assert_eq!(std::fs::read_to_string(path).expect("should read"), "bye");
    }
}
