//! PTY process management.
//!
//! [`PtySpawner`] is the seam between the session manager and the OS. The
//! native implementation uses `portable-pty`; tests substitute a fake that
//! emits output on demand.

use crate::shell::ShellCommand;
use crate::types::{ExitInfo, TermSize};
use anyhow::{Context, Result};
use portable_pty::{native_pty_system, ChildKiller, CommandBuilder, MasterPty, PtySize};
use std::io::{Read, Write};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;

/// Size of each PTY read.
const READ_BUFFER_SIZE: usize = 8192;

/// Everything needed to start one shell.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SpawnRequest {
    pub session_id: String,
    pub shell: ShellCommand,
    pub cwd: PathBuf,
    pub env: Vec<(String, String)>,
    pub size: TermSize,
}

/// Receives output and the final exit from a PTY reader.
///
/// Called from the reader thread, one chunk at a time, in order.
pub trait PtyListener: Send + 'static {
    fn on_data(&mut self, data: &[u8]);
    fn on_exit(&mut self, exit: ExitInfo);
}

/// A running PTY child.
pub trait PtyProcess: Send {
    fn write(&mut self, data: &[u8]) -> Result<()>;
    fn resize(&mut self, size: TermSize) -> Result<()>;
    /// Deliver a signal to the foreground process group. Returns false when
    /// the signal is unknown or signals are unsupported on this platform.
    fn signal(&mut self, signal: &str) -> Result<bool>;
    fn kill(&mut self) -> Result<()>;
    fn pid(&self) -> Option<u32>;
}

/// Creates PTY children.
pub trait PtySpawner: Send + Sync {
    fn spawn(
        &self,
        request: &SpawnRequest,
        listener: Box<dyn PtyListener>,
    ) -> Result<Box<dyn PtyProcess>>;
}

/// Spawns real shells through the platform PTY.
#[derive(Clone, Copy, Debug, Default)]
pub struct NativePtySpawner;

impl PtySpawner for NativePtySpawner {
    fn spawn(
        &self,
        request: &SpawnRequest,
        listener: Box<dyn PtyListener>,
    ) -> Result<Box<dyn PtyProcess>> {
        Ok(Box::new(NativePty::spawn(request, listener)?))
    }
}

/// Handles PTY spawning and I/O for one session.
///
/// The reader thread owns the child: it forwards output until EOF, then
/// waits for the exit status and reports it.
pub struct NativePty {
    master: Box<dyn MasterPty + Send>,
    writer: Box<dyn Write + Send>,
    killer: Box<dyn ChildKiller + Send + Sync>,
    pid: Option<u32>,
    exited: Arc<AtomicBool>,
    _reader_thread: thread::JoinHandle<()>,
}

impl NativePty {
    pub fn spawn(request: &SpawnRequest, mut listener: Box<dyn PtyListener>) -> Result<Self> {
        let pty_system = native_pty_system();

        let pair = pty_system
            .openpty(pty_size(request.size))
            .context("Failed to open PTY")?;

        let mut cmd = CommandBuilder::new(&request.shell.program);
        cmd.args(&request.shell.args);
        cmd.cwd(&request.cwd);
        for (key, value) in &request.env {
            cmd.env(key, value);
        }

        let mut child = pair
            .slave
            .spawn_command(cmd)
            .with_context(|| format!("Failed to spawn shell {:?}", request.shell.program))?;
        // Release our copy of the slave so the reader sees EOF when the child exits.
        drop(pair.slave);

        let pid = child.process_id();
        let killer = child.clone_killer();

        let writer = pair
            .master
            .take_writer()
            .context("Failed to get PTY writer")?;

        let mut reader = pair
            .master
            .try_clone_reader()
            .context("Failed to get PTY reader")?;

        let exited = Arc::new(AtomicBool::new(false));
        let exited_clone = exited.clone();
        let session_id = request.session_id.clone();

        let reader_thread = thread::Builder::new()
            .name(format!("termhost-pty-{}", session_id))
            .spawn(move || {
                let mut buf = [0u8; READ_BUFFER_SIZE];
                loop {
                    match reader.read(&mut buf) {
                        Ok(0) => break,
                        Ok(n) => listener.on_data(&buf[..n]),
                        Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                        Err(e) => {
                            // EIO is how Linux reports a closed slave.
                            tracing::trace!(session_id = %session_id, "PTY read ended: {}", e);
                            break;
                        }
                    }
                }

                let exit = match child.wait() {
                    Ok(status) => ExitInfo {
                        exit_code: status.exit_code(),
                        signal: status.signal().map(str::to_string),
                    },
                    Err(e) => {
                        tracing::warn!(session_id = %session_id, "Failed to wait for child: {}", e);
                        ExitInfo {
                            exit_code: 1,
                            signal: None,
                        }
                    }
                };
                exited_clone.store(true, Ordering::SeqCst);
                tracing::debug!(
                    session_id = %session_id,
                    exit_code = exit.exit_code,
                    signal = exit.signal.as_deref(),
                    "PTY child exited"
                );
                listener.on_exit(exit);
            })
            .context("Failed to spawn PTY reader thread")?;

        tracing::info!(
            session_id = %request.session_id,
            shell = %request.shell.program,
            cwd = %request.cwd.display(),
            pid = pid,
            "Spawned PTY"
        );

        Ok(Self {
            master: pair.master,
            writer,
            killer,
            pid,
            exited,
            _reader_thread: reader_thread,
        })
    }

    /// Check if the PTY process has exited
    pub fn has_exited(&self) -> bool {
        self.exited.load(Ordering::SeqCst)
    }
}

impl PtyProcess for NativePty {
    fn write(&mut self, data: &[u8]) -> Result<()> {
        self.writer
            .write_all(data)
            .context("Failed to write to PTY")?;
        self.writer.flush().context("Failed to flush PTY")?;
        Ok(())
    }

    fn resize(&mut self, size: TermSize) -> Result<()> {
        self.master
            .resize(pty_size(size))
            .context("Failed to resize PTY")?;
        Ok(())
    }

    #[cfg(unix)]
    fn signal(&mut self, signal: &str) -> Result<bool> {
        use nix::sys::signal::{kill, killpg, Signal};
        use nix::unistd::Pid;

        let Ok(parsed) = normalize_signal_name(signal).parse::<Signal>() else {
            tracing::warn!("Unknown signal name: {}", signal);
            return Ok(false);
        };
        if self.has_exited() {
            return Ok(false);
        }

        if let Some(group) = self.master.process_group_leader() {
            killpg(Pid::from_raw(group), parsed)
                .with_context(|| format!("Failed to send {} to process group {}", parsed, group))?;
            return Ok(true);
        }

        let Some(pid) = self.pid else {
            return Ok(false);
        };
        kill(Pid::from_raw(pid as i32), parsed)
            .with_context(|| format!("Failed to send {} to pid {}", parsed, pid))?;
        Ok(true)
    }

    #[cfg(not(unix))]
    fn signal(&mut self, signal: &str) -> Result<bool> {
        tracing::debug!("Signals are not supported on this platform, ignoring {}", signal);
        Ok(false)
    }

    fn kill(&mut self) -> Result<()> {
        if self.has_exited() {
            return Ok(());
        }
        self.killer.kill().context("Failed to kill PTY child")?;
        Ok(())
    }

    fn pid(&self) -> Option<u32> {
        self.pid
    }
}

impl Drop for NativePty {
    fn drop(&mut self) {
        if !self.has_exited() {
            if let Err(e) = self.killer.kill() {
                tracing::debug!("Failed to kill PTY child on drop: {}", e);
            }
        }
    }
}

/// Canonical `SIGXXX` spelling: upper case with a `SIG` prefix.
pub fn normalize_signal_name(name: &str) -> String {
    let upper = name.trim().to_ascii_uppercase();
    if upper.starts_with("SIG") {
        upper
    } else {
        format!("SIG{}", upper)
    }
}

fn pty_size(size: TermSize) -> PtySize {
    PtySize {
        rows: size.rows,
        cols: size.cols,
        pixel_width: 0,
        pixel_height: 0,
    }
}
