//! Process lifecycle guard.
//!
//! Tracks at most one live child process (the dev server) and terminates the
//! whole process tree rooted at it on demand. Termination is best effort:
//! failures are logged, never returned, and the slot is always cleared.

use std::sync::{Arc, Mutex, MutexGuard};

use crate::error::GuardError;

/// Lifecycle of the tracked handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandleState {
    Absent,
    Running { pid: u32 },
    Terminating { pid: u32 },
}

/// The shapes a tree termination failure can take.
#[derive(Debug)]
pub enum TerminateError {
    /// Several processes of the tree could not be signalled.
    Tree(Vec<String>),
    /// A single signal failed.
    Signal(std::io::Error),
    /// The platform reported failure without any detail.
    Opaque,
}

/// Owner of the single tracked process handle.
///
/// Clones share the same slot, so the runner task can release the handle on
/// natural exit while the orchestrator or a signal handler terminates it.
#[derive(Debug, Clone)]
pub struct ProcessGuard {
    state: Arc<Mutex<HandleState>>,
}

impl Default for ProcessGuard {
    fn default() -> Self {
        Self::new()
    }
}

impl ProcessGuard {
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(HandleState::Absent)),
        }
    }

    fn lock(&self) -> MutexGuard<'_, HandleState> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn state(&self) -> HandleState {
        *self.lock()
    }

    /// Starts tracking `pid`. Only valid while no other process is tracked.
    pub fn track(&self, pid: u32) -> Result<(), GuardError> {
        let mut state = self.lock();
        match *state {
            HandleState::Absent => {
                *state = HandleState::Running { pid };
                tracing::debug!(pid, "tracking process");
                Ok(())
            }
            HandleState::Running { pid: current } | HandleState::Terminating { pid: current } => {
                Err(GuardError::AlreadyTracking { pid: current })
            }
        }
    }

    /// Clears the slot after `pid` exited on its own. Returns false if the
    /// slot held something else.
    pub fn release(&self, pid: u32) -> bool {
        let mut state = self.lock();
        match *state {
            HandleState::Running { pid: current } | HandleState::Terminating { pid: current }
                if current == pid =>
            {
                *state = HandleState::Absent;
                true
            }
            _ => false,
        }
    }

    /// Sends SIGTERM to the tracked process tree and clears the slot.
    ///
    /// Returns whether a termination was attempted. Calling this with nothing
    /// tracked, or while another call is terminating, is a silent no-op.
    pub fn terminate(&self) -> bool {
        let pid = {
            let mut state = self.lock();
            let HandleState::Running { pid } = *state else {
                return false;
            };
            *state = HandleState::Terminating { pid };
            pid
        };

        tracing::debug!(pid, "terminating process tree");
        let result = kill_tree(pid);
        *self.lock() = HandleState::Absent;

        if let Err(err) = result {
            report_terminate_error(pid, err);
        }
        true
    }
}

fn report_terminate_error(pid: u32, err: TerminateError) {
    match err {
        TerminateError::Tree(messages) => {
            if let Some(first) = messages.first() {
                tracing::warn!(
                    pid,
                    failures = messages.len(),
                    "failed to terminate process tree: {}",
                    first
                );
            }
        }
        TerminateError::Signal(err) => {
            tracing::warn!(pid, "failed to terminate process tree: {}", err);
        }
        // Nothing useful to report.
        TerminateError::Opaque => {}
    }
}

#[cfg(unix)]
fn kill_tree(pid: u32) -> Result<(), TerminateError> {
    let Ok(root) = i32::try_from(pid) else {
        return Err(TerminateError::Opaque);
    };
    if root <= 1 {
        return Ok(());
    }

    let mut pids = vec![pid];
    pids.extend(collect_descendants(pid, &process_table()));

    let mut failures = Vec::new();

    // The target was spawned as its own group leader; this reaches children
    // that were started in between the table snapshot and now.
    if let Err(err) = send_sigterm(-root) {
        failures.push((-root, err));
    }

    for target in pids {
        let Ok(target) = i32::try_from(target) else {
            continue;
        };
        if let Err(err) = send_sigterm(target) {
            failures.push((target, err));
        }
    }

    match failures.len() {
        0 => Ok(()),
        1 => Err(TerminateError::Signal(failures.remove(0).1)),
        _ => Err(TerminateError::Tree(
            failures
                .into_iter()
                .map(|(target, err)| match target {
                    t if t < 0 => format!("group {}: {}", -t, err),
                    t => format!("pid {}: {}", t, err),
                })
                .collect(),
        )),
    }
}

// Negative targets address a process group. A target that is already gone
// is not a failure.
#[cfg(unix)]
fn send_sigterm(target: i32) -> std::io::Result<()> {
    let rc = unsafe { libc::kill(target, libc::SIGTERM) };
    if rc == 0 {
        return Ok(());
    }
    let err = std::io::Error::last_os_error();
    if err.raw_os_error() == Some(libc::ESRCH) {
        return Ok(());
    }
    Err(err)
}

#[cfg(windows)]
fn kill_tree(pid: u32) -> Result<(), TerminateError> {
    use windows_sys::Win32::System::Console::GenerateConsoleCtrlEvent;
    use windows_sys::Win32::System::Console::CTRL_BREAK_EVENT;
    // Windows has no SIGTERM; CTRL_BREAK reaches the whole process group.
    let ok = unsafe { GenerateConsoleCtrlEvent(CTRL_BREAK_EVENT, pid) };
    if ok == 0 {
        return Err(TerminateError::Opaque);
    }
    Ok(())
}

#[cfg(all(not(unix), not(windows)))]
fn kill_tree(_pid: u32) -> Result<(), TerminateError> {
    Err(TerminateError::Opaque)
}

/// Snapshot of `(pid, ppid)` pairs for every visible process.
#[cfg(target_os = "linux")]
fn process_table() -> Vec<(u32, u32)> {
    let Ok(entries) = std::fs::read_dir("/proc") else {
        return Vec::new();
    };
    entries
        .filter_map(|entry| entry.ok())
        .filter(|entry| {
            entry
                .file_name()
                .to_str()
                .map(|name| name.bytes().all(|b| b.is_ascii_digit()))
                .unwrap_or(false)
        })
        .filter_map(|entry| std::fs::read_to_string(entry.path().join("stat")).ok())
        .filter_map(|stat| parse_stat_line(&stat))
        .collect()
}

#[cfg(all(unix, not(target_os = "linux")))]
fn process_table() -> Vec<(u32, u32)> {
    let output = std::process::Command::new("ps")
        .args(["-A", "-o", "pid=", "-o", "ppid="])
        .output();
    let Ok(output) = output else {
        return Vec::new();
    };
    String::from_utf8_lossy(&output.stdout)
        .lines()
        .filter_map(|line| {
            let mut fields = line.split_whitespace();
            let pid = fields.next()?.parse().ok()?;
            let ppid = fields.next()?.parse().ok()?;
            Some((pid, ppid))
        })
        .collect()
}

// `/proc/<pid>/stat` is "pid (comm) state ppid ..."; comm may contain spaces
// and parentheses, so fields are read after the last ')'.
#[cfg_attr(not(target_os = "linux"), allow(dead_code))]
fn parse_stat_line(stat: &str) -> Option<(u32, u32)> {
    let pid = stat.split_whitespace().next()?.parse().ok()?;
    let rest = &stat[stat.rfind(')')? + 1..];
    let mut fields = rest.split_whitespace();
    let _state = fields.next()?;
    let ppid = fields.next()?.parse().ok()?;
    Some((pid, ppid))
}

/// All descendants of `root`, breadth first.
#[cfg_attr(not(unix), allow(dead_code))]
fn collect_descendants(root: u32, table: &[(u32, u32)]) -> Vec<u32> {
    let mut found = Vec::new();
    let mut frontier = vec![root];
    while let Some(parent) = frontier.pop() {
        for &(pid, ppid) in table {
            if ppid == parent && pid != root && !found.contains(&pid) {
                found.push(pid);
                frontier.push(pid);
            }
        }
    }
    found
}
