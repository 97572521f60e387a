//! Pairs `CommandStart` with the following `CommandDone`.
//!
//! The tracker is either idle or awaiting a done marker for one command.
//! A second start before the done replaces the pending command without
//! reporting it; a done while idle is ignored.

use crate::osc::OscEvent;

/// A command line and the exit code it finished with.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompletedCommand {
    pub command: String,
    pub exit_code: i32,
}

/// Per-session command correlator.
pub struct CommandTracker {
    pending: Option<String>,
    on_complete: Box<dyn FnMut(CompletedCommand) + Send>,
}

impl CommandTracker {
    /// Create a tracker that reports each completed pair to `on_complete`.
    pub fn new(on_complete: impl FnMut(CompletedCommand) + Send + 'static) -> Self {
        Self {
            pending: None,
            on_complete: Box::new(on_complete),
        }
    }

    /// Advance the state machine by one marker.
    pub fn process_event(&mut self, event: &OscEvent) {
        match event {
            OscEvent::CommandStart { command } => {
                if let Some(previous) = self.pending.replace(command.clone()) {
                    tracing::trace!(previous = %previous, "Command superseded before completion");
                }
            }
            OscEvent::CommandDone { exit_code } => match self.pending.take() {
                Some(command) => (self.on_complete)(CompletedCommand {
                    command,
                    exit_code: *exit_code,
                }),
                None => tracing::trace!(exit_code, "Ignoring done marker with no pending command"),
            },
        }
    }

    /// The command awaiting its done marker, if any.
    pub fn pending_command(&self) -> Option<&str> {
        self.pending.as_deref()
    }

    /// Drop any pending command without reporting it.
    pub fn clear(&mut self) {
        self.pending = None;
    }
}

impl std::fmt::Debug for CommandTracker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CommandTracker")
            .field("pending", &self.pending)
            .finish_non_exhaustive()
    }
}
