//! Target execution.
//!
//! `TargetRunner::execute` spawns a validated target's command, registers it
//! with the process guard and reports progress as `BuildEvent`s. Standard
//! output and error are forwarded line by line, readiness checks run next to
//! the process, and in watch mode the command is rerun when files change.
//! Every run ends with exactly one `BuildEvent::Terminal`.

use std::process::{ExitStatus, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use regex::Regex;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::net::TcpStream;
use tokio::process::{Child, Command};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

use crate::base_url::derive_base_url;
use crate::events::BuildEvent;
use crate::guard::ProcessGuard;
use crate::options::{ReadinessCheck, ServerOptions};
use crate::output::{strip_ansi, StreamKind};
use crate::registry::ValidatedTarget;
use crate::watch::spawn_watcher;

const PROBE_INTERVAL: Duration = Duration::from_millis(500);
const DRAIN_TIMEOUT: Duration = Duration::from_secs(1);
const SIGTERM_TIMEOUT: Duration = Duration::from_secs(5);

/// Spawns targets and tracks them through a shared `ProcessGuard`.
#[derive(Debug, Clone)]
pub struct TargetRunner {
    guard: ProcessGuard,
}

/// Handle to an executing target.
pub struct BuildRun {
    events: mpsc::Receiver<BuildEvent>,
    stop: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl BuildRun {
    /// Next event, or `None` once the terminal event has been consumed.
    pub async fn next_event(&mut self) -> Option<BuildEvent> {
        self.events.recv().await
    }

    /// Terminates the target and drains its events, returning the terminal one.
    ///
    /// A process that ignores SIGTERM is killed after a short grace period.
    pub async fn stop(mut self) -> Option<BuildEvent> {
        let _ = self.stop.send(true);
        let mut terminal = None;
        while let Some(event) = self.events.recv().await {
            if event.is_terminal() {
                terminal = Some(event);
            }
        }
        let _ = self.task.await;
        terminal
    }
}

enum CycleEnd {
    Exited { success: bool, code: Option<i32> },
    Restart,
    Stopped { code: Option<i32> },
    Failed,
}

// Log readiness shared between both stream readers and the timeout task.
// Whoever flips `settled` first decides between `Ready` and `ReadinessFailed`.
#[derive(Clone)]
struct LogReadiness {
    pattern: Regex,
    settled: Arc<AtomicBool>,
}

impl TargetRunner {
    pub fn new(guard: ProcessGuard) -> Self {
        Self { guard }
    }

    /// Starts `target` in the background and returns its event stream.
    pub fn execute(&self, target: ValidatedTarget) -> BuildRun {
        let (tx, rx) = mpsc::channel(256);
        let (stop_tx, stop_rx) = watch::channel(false);
        let guard = self.guard.clone();
        let task = tokio::spawn(run_target(target, guard, tx, stop_rx));
        BuildRun {
            events: rx,
            stop: stop_tx,
            task,
        }
    }
}

async fn run_target(
    target: ValidatedTarget,
    guard: ProcessGuard,
    tx: mpsc::Sender<BuildEvent>,
    mut stop: watch::Receiver<bool>,
) {
    let label = target.spec.to_string();
    let settings = target.watch();
    let mut triggers = if settings.enabled {
        if settings.paths.is_empty() {
            tracing::warn!(target_name = %label, "watch enabled without watch_paths; running once");
        }
        Some(spawn_watcher(label.clone(), target.cwd.as_deref(), &settings))
    } else {
        None
    };

    loop {
        let (success, code) = match run_cycle(&target, &guard, &tx, &mut triggers, &mut stop).await {
            CycleEnd::Restart => {
                tracing::info!(target_name = %label, "change detected, restarting");
                continue;
            }
            CycleEnd::Failed => (false, None),
            CycleEnd::Stopped { code } => (false, code),
            CycleEnd::Exited { success, code } => {
                // A signal exit means the tree was terminated from outside.
                if triggers.is_none() || code.is_none() {
                    (success, code)
                } else {
                    let _ = tx.send(BuildEvent::Rebuilt { success }).await;
                    tokio::select! {
                        trigger = next_trigger(&mut triggers) => {
                            if trigger.is_some() {
                                tracing::info!(target_name = %label, "change detected, rebuilding");
                                continue;
                            }
                        }
                        _ = stop.changed() => {}
                    }
                    (success, code)
                }
            }
        };
        let _ = tx.send(BuildEvent::Terminal { success, code }).await;
        return;
    }
}

async fn next_trigger(triggers: &mut Option<mpsc::Receiver<()>>) -> Option<()> {
    match triggers {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}

async fn run_cycle(
    target: &ValidatedTarget,
    guard: &ProcessGuard,
    tx: &mpsc::Sender<BuildEvent>,
    triggers: &mut Option<mpsc::Receiver<()>>,
    stop: &mut watch::Receiver<bool>,
) -> CycleEnd {
    let label = target.spec.to_string();
    if *stop.borrow() {
        return CycleEnd::Stopped { code: None };
    }
    let _ = tx.send(BuildEvent::Starting).await;

    let mut child = match spawn(target) {
        Ok(child) => child,
        Err(err) => {
            let _ = tx
                .send(BuildEvent::SpawnFailed {
                    error: format!("failed to spawn {}: {}", target.program, err),
                })
                .await;
            return CycleEnd::Failed;
        }
    };
    let pid = child.id().unwrap_or(0);
    if let Err(err) = guard.track(pid) {
        let _ = child.kill().await;
        let _ = tx
            .send(BuildEvent::SpawnFailed {
                error: err.to_string(),
            })
            .await;
        return CycleEnd::Failed;
    }
    tracing::debug!(target_name = %label, pid, "started");
    let _ = tx.send(BuildEvent::Started { pid }).await;

    let ready_check = target.ready_check();
    let log_readiness = match &ready_check {
        ReadinessCheck::Log(pattern) => Regex::new(pattern).ok().map(|pattern| LogReadiness {
            pattern,
            settled: Arc::new(AtomicBool::new(false)),
        }),
        _ => None,
    };

    let mut readers = Vec::new();
    if let Some(stdout) = child.stdout.take() {
        readers.push(tokio::spawn(read_stream(
            StreamKind::Stdout,
            stdout,
            tx.clone(),
            log_readiness.clone(),
        )));
    }
    if let Some(stderr) = child.stderr.take() {
        readers.push(tokio::spawn(read_stream(
            StreamKind::Stderr,
            stderr,
            tx.clone(),
            log_readiness.clone(),
        )));
    }

    let readiness = spawn_readiness(
        &ready_check,
        target.server(),
        target.ready_timeout(),
        log_readiness.map(|log| log.settled),
        tx.clone(),
    )
    .await;

    let end = tokio::select! {
        status = child.wait() => match status {
            Ok(status) => CycleEnd::Exited { success: status.success(), code: status.code() },
            Err(err) => {
                tracing::warn!(target_name = %label, "failed to wait for process: {}", err);
                CycleEnd::Exited { success: false, code: None }
            }
        },
        Some(()) = next_trigger(triggers) => {
            shutdown(guard, &mut child, pid).await;
            CycleEnd::Restart
        }
        _ = stop.changed() => {
            let code = shutdown(guard, &mut child, pid).await.and_then(|status| status.code());
            CycleEnd::Stopped { code }
        }
    };
    guard.release(pid);

    if let Some(readiness) = readiness {
        readiness.abort();
    }
    // Grandchildren may keep the pipes open after the root exits.
    for reader in readers {
        let abort = reader.abort_handle();
        if tokio::time::timeout(DRAIN_TIMEOUT, reader).await.is_err() {
            abort.abort();
        }
    }
    end
}

// SIGTERM through the guard first, SIGKILL for the group once the grace
// period is over.
async fn shutdown(guard: &ProcessGuard, child: &mut Child, pid: u32) -> Option<ExitStatus> {
    guard.terminate();
    if let Some(status) = wait_for_exit(child, SIGTERM_TIMEOUT).await {
        return Some(status);
    }
    tracing::warn!(pid, "process did not exit after SIGTERM, killing it");
    kill_group(pid);
    let _ = child.kill().await;
    child.wait().await.ok()
}

async fn wait_for_exit(child: &mut Child, timeout: Duration) -> Option<ExitStatus> {
    match tokio::time::timeout(timeout, child.wait()).await {
        Ok(Ok(status)) => Some(status),
        Ok(Err(_)) | Err(_) => None,
    }
}

#[cfg(unix)]
fn kill_group(pid: u32) {
    let Ok(pgid) = i32::try_from(pid) else {
        return;
    };
    if pgid > 1 {
        unsafe {
            let _ = libc::kill(-pgid, libc::SIGKILL);
        }
    }
}

#[cfg(not(unix))]
fn kill_group(_pid: u32) {}

fn spawn(target: &ValidatedTarget) -> std::io::Result<Child> {
    let mut command = Command::new(&target.program);
    command.args(&target.args);
    if let Some(cwd) = &target.cwd {
        command.current_dir(cwd);
    }
    if !target.env.is_empty() {
        command.envs(&target.env);
    }
    command
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());
    command.kill_on_drop(true);

    #[cfg(windows)]
    {
        const CREATE_NEW_PROCESS_GROUP: u32 = 0x00000200;
        command.creation_flags(CREATE_NEW_PROCESS_GROUP);
    }

    #[cfg(unix)]
    unsafe {
        command.pre_exec(|| {
            let _ = libc::setpgid(0, 0);
            Ok(())
        });
    }

    command.spawn()
}

// Starts the readiness check for one cycle. `Started` is satisfied
// immediately; log checks are matched by the stream readers and only need
// the timeout here.
async fn spawn_readiness(
    check: &ReadinessCheck,
    server: Option<ServerOptions>,
    timeout: Duration,
    log_settled: Option<Arc<AtomicBool>>,
    tx: mpsc::Sender<BuildEvent>,
) -> Option<JoinHandle<()>> {
    match check {
        ReadinessCheck::Started => {
            let _ = tx.send(BuildEvent::Ready).await;
            None
        }
        ReadinessCheck::Log(pattern) => {
            let settled = log_settled?;
            let pattern = pattern.clone();
            Some(tokio::spawn(async move {
                tokio::time::sleep(timeout).await;
                if !settled.swap(true, Ordering::SeqCst) {
                    let error = format!("no output matched {:?} within {:?}", pattern, timeout);
                    let _ = tx.send(BuildEvent::ReadinessFailed { error }).await;
                }
            }))
        }
        ReadinessCheck::Delay(ms) => {
            let ms = *ms;
            Some(tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(ms)).await;
                let _ = tx.send(BuildEvent::Ready).await;
            }))
        }
        ReadinessCheck::Tcp | ReadinessCheck::Http => {
            let Some(server) = server else {
                let _ = tx.send(BuildEvent::Ready).await;
                return None;
            };
            let http = matches!(check, ReadinessCheck::Http);
            Some(tokio::spawn(async move {
                let event = match probe(&server, http, timeout).await {
                    Ok(()) => BuildEvent::Ready,
                    Err(error) => BuildEvent::ReadinessFailed { error },
                };
                let _ = tx.send(event).await;
            }))
        }
    }
}

async fn probe(server: &ServerOptions, http: bool, timeout: Duration) -> Result<(), String> {
    let deadline = tokio::time::Instant::now() + timeout;
    let host = probe_host(&server.host);
    if http {
        let local = ServerOptions {
            host: host.to_string(),
            ..server.clone()
        };
        let url = derive_base_url(&local).map_err(|err| err.to_string())?;
        let client = reqwest::Client::builder()
            .user_agent(format!("testrack/{}", env!("CARGO_PKG_VERSION")))
            .timeout(Duration::from_secs(3))
            .danger_accept_invalid_certs(true)
            .build()
            .map_err(|err| err.to_string())?;
        while tokio::time::Instant::now() < deadline {
            if client.get(url.clone()).send().await.is_ok() {
                return Ok(());
            }
            tokio::time::sleep(PROBE_INTERVAL).await;
        }
        return Err(format!("no HTTP response from {} within {:?}", url, timeout));
    }

    while tokio::time::Instant::now() < deadline {
        if TcpStream::connect((host, server.port)).await.is_ok() {
            return Ok(());
        }
        tokio::time::sleep(PROBE_INTERVAL).await;
    }
    Err(format!(
        "{} port {} did not accept connections within {:?}",
        host, server.port, timeout
    ))
}

// Wildcard bind addresses are reachable through loopback. Brackets are
// dropped so the result resolves as a plain address.
fn probe_host(host: &str) -> &str {
    let host = host.trim_start_matches('[').trim_end_matches(']');
    match host {
        "0.0.0.0" => "127.0.0.1",
        "::" => "::1",
        other => other,
    }
}

async fn read_stream<R>(
    stream: StreamKind,
    reader: R,
    tx: mpsc::Sender<BuildEvent>,
    readiness: Option<LogReadiness>,
) where
    R: tokio::io::AsyncRead + Unpin,
{
    let mut reader = BufReader::new(reader);
    let mut buf = Vec::new();
    loop {
        buf.clear();
        match reader.read_until(b'\n', &mut buf).await {
            Ok(0) | Err(_) => break,
            Ok(_) => {}
        }
        let line = String::from_utf8_lossy(&buf)
            .trim_end_matches(&['\r', '\n'][..])
            .to_string();
        if let Some(log) = &readiness {
            if !log.settled.load(Ordering::SeqCst)
                && log.pattern.is_match(&strip_ansi(&line))
                && !log.settled.swap(true, Ordering::SeqCst)
            {
                let _ = tx.send(BuildEvent::Ready).await;
            }
        }
        let _ = tx.send(BuildEvent::Output { line, stream }).await;
    }
}
