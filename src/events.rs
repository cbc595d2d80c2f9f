//! Build lifecycle events.
//!
//! A target run is observed as a stream of `BuildEvent`s sent over a tokio
//! channel. Intermediate events describe progress; every stream ends with
//! exactly one `Terminal` event, after which the sender is dropped.

use crate::output::StreamKind;

/// A discrete notification in a target run's lifecycle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BuildEvent {
    /// The target's command is about to be spawned.
    Starting,
    /// The command could not be spawned or tracked.
    SpawnFailed { error: String },
    /// The command was spawned and its pid is tracked.
    Started { pid: u32 },
    /// A line of output from the command.
    Output { line: String, stream: StreamKind },
    /// The target passed its readiness check.
    Ready,
    /// The readiness check gave up.
    ReadinessFailed { error: String },
    /// One watch-mode cycle finished; another will follow on change.
    Rebuilt { success: bool },
    /// The run is over. No further events follow.
    Terminal { success: bool, code: Option<i32> },
}

impl BuildEvent {
    pub fn is_terminal(&self) -> bool {
        matches!(self, BuildEvent::Terminal { .. })
    }
}

/// Signals the CLI reacts to while a run is in flight.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessSignal {
    SigInt,
    SigTerm,
}

impl ProcessSignal {
    pub fn label(self) -> &'static str {
        match self {
            ProcessSignal::SigInt => "SIGINT",
            ProcessSignal::SigTerm => "SIGTERM",
        }
    }
}
