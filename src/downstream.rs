//! Downstream test runner invocation.
//!
//! The runner is driven through a small session surface: create a session
//! bound to two local ports, configure a runner with sources and browsers,
//! run it to get the number of failed tests, and close the session. The
//! invoker closes every session it created, whether the run succeeded or not.

use std::net::TcpListener;
use std::path::Path;
use std::process::Stdio;

use reqwest::Url;
use serde::{Deserialize, Serialize};
use tokio::process::Command;

use crate::config::RunnerConfig;
use crate::error::DownstreamError;

/// Terminal value of one run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct RunOutcome {
    pub success: bool,
}

/// Maps a failure tally to an outcome. Only exactly zero failures succeed.
pub fn outcome_for(failed: i64) -> RunOutcome {
    RunOutcome {
        success: failed == 0,
    }
}

/// What to run and where the runner session listens.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DownstreamRequest {
    pub hostname: String,
    pub ports: [u16; 2],
    pub src: String,
    pub browsers: Vec<String>,
}

pub trait SessionFactory {
    type Session: Session;

    async fn create_session(
        &self,
        hostname: &str,
        ports: [u16; 2],
    ) -> Result<Self::Session, DownstreamError>;
}

pub trait Session {
    type Runner: Runner;

    fn create_runner(&self) -> Self::Runner;

    async fn close(self);
}

pub trait Runner: Sized {
    fn src(self, src: &str) -> Self;

    fn browsers(self, browsers: &[String]) -> Self;

    fn base_url(self, url: Option<&Url>) -> Self;

    /// Runs the tests and resolves to the number that failed.
    async fn run(self) -> Result<i64, DownstreamError>;
}

/// Drives one session through create, configure, run and close.
pub async fn invoke<F: SessionFactory>(
    factory: &F,
    request: &DownstreamRequest,
    base_url: Option<&Url>,
) -> Result<RunOutcome, DownstreamError> {
    let session = factory
        .create_session(&request.hostname, request.ports)
        .await?;
    let result = session
        .create_runner()
        .src(&request.src)
        .browsers(&request.browsers)
        .base_url(base_url)
        .run()
        .await;
    session.close().await;

    let failed = result?;
    tracing::info!(failed, "test run finished");
    Ok(outcome_for(failed))
}

/// Runs the configured test runner CLI as a child process.
#[derive(Debug, Clone)]
pub struct CommandSessionFactory {
    config: RunnerConfig,
}

impl CommandSessionFactory {
    pub fn new(config: RunnerConfig) -> Self {
        Self { config }
    }
}

impl SessionFactory for CommandSessionFactory {
    type Session = CommandSession;

    async fn create_session(
        &self,
        hostname: &str,
        ports: [u16; 2],
    ) -> Result<CommandSession, DownstreamError> {
        for port in ports {
            // Bound only long enough to prove the port is free.
            TcpListener::bind((hostname, port)).map_err(|source| DownstreamError::PortInUse {
                hostname: hostname.to_string(),
                port,
                source,
            })?;
        }
        tracing::debug!(hostname, ports = ?ports, "runner session created");
        Ok(CommandSession {
            config: self.config.clone(),
            hostname: hostname.to_string(),
            ports,
        })
    }
}

#[derive(Debug)]
pub struct CommandSession {
    config: RunnerConfig,
    hostname: String,
    ports: [u16; 2],
}

impl Session for CommandSession {
    type Runner = CommandRunner;

    fn create_runner(&self) -> CommandRunner {
        CommandRunner {
            config: self.config.clone(),
            hostname: self.hostname.clone(),
            ports: self.ports,
            src: None,
            browsers: Vec::new(),
            base_url: None,
        }
    }

    // `create_session` only bound the ports briefly; nothing is held open.
    async fn close(self) {
        tracing::debug!(hostname = %self.hostname, ports = ?self.ports, "runner session closed");
    }
}

#[derive(Debug)]
pub struct CommandRunner {
    config: RunnerConfig,
    hostname: String,
    ports: [u16; 2],
    src: Option<String>,
    browsers: Vec<String>,
    base_url: Option<Url>,
}

impl CommandRunner {
    fn runner_args(&self, report: Option<&Path>) -> Vec<String> {
        let mut args = vec![self.browsers.join(",")];
        if let Some(src) = &self.src {
            args.push(src.clone());
        }
        args.push("--hostname".to_string());
        args.push(self.hostname.clone());
        args.push("--ports".to_string());
        args.push(format!("{},{}", self.ports[0], self.ports[1]));
        let reporter = match (&self.config.reporter, report) {
            (Some(reporter), Some(report)) => Some(format!("{},json:{}", reporter, report.display())),
            (None, Some(report)) => Some(format!("spec,json:{}", report.display())),
            (Some(reporter), None) => Some(reporter.clone()),
            (None, None) => None,
        };
        if let Some(reporter) = reporter {
            args.push("--reporter".to_string());
            args.push(reporter);
        }
        if let Some(concurrency) = self.config.concurrency {
            args.push("--concurrency".to_string());
            args.push(concurrency.to_string());
        }
        if self.config.quarantine_mode.unwrap_or(false) {
            args.push("--quarantine-mode".to_string());
        }
        if let Some(screenshots) = &self.config.screenshots {
            args.push("--screenshots".to_string());
            args.push(screenshots.clone());
        }
        args.extend(self.config.args.iter().cloned());
        args
    }
}

impl Runner for CommandRunner {
    fn src(mut self, src: &str) -> Self {
        self.src = Some(src.to_string());
        self
    }

    fn browsers(mut self, browsers: &[String]) -> Self {
        self.browsers = browsers.to_vec();
        self
    }

    fn base_url(mut self, url: Option<&Url>) -> Self {
        self.base_url = url.cloned();
        self
    }

    async fn run(self) -> Result<i64, DownstreamError> {
        let mut parts = shell_words::split(&self.config.cmd)
            .map_err(|err| DownstreamError::Runner(format!("invalid runner command: {}", err)))?;
        if parts.is_empty() {
            return Err(DownstreamError::Runner("runner command is empty".to_string()));
        }
        let program = parts.remove(0);

        let report = if self.config.json_report {
            Some(
                tempfile::Builder::new()
                    .prefix("testrack-report-")
                    .suffix(".json")
                    .tempfile()?,
            )
        } else {
            None
        };
        let report_path = report.as_ref().map(|file| file.path());

        let mut command = Command::new(&program);
        command.args(parts).args(self.runner_args(report_path));
        if let Some(cwd) = &self.config.cwd {
            command.current_dir(cwd);
        }
        if !self.config.env.is_empty() {
            command.envs(&self.config.env);
        }
        if let Some(url) = &self.base_url {
            command.env("BASE_URL", url.as_str());
        }
        command
            .stdin(Stdio::null())
            .stdout(Stdio::inherit())
            .stderr(Stdio::inherit())
            .kill_on_drop(true);

        let mut child = command.spawn().map_err(|source| DownstreamError::Spawn {
            cmd: program.clone(),
            source,
        })?;
        let status = child.wait().await?;
        let Some(code) = status.code() else {
            return Err(DownstreamError::Killed);
        };
        Ok(failed_count(code, report_path.and_then(read_failed_count)))
    }
}

/// Summary of the runner's JSON reporter output.
#[derive(Debug, Deserialize)]
struct JsonReport {
    total: i64,
    passed: i64,
}

fn read_failed_count(path: &Path) -> Option<i64> {
    let raw = std::fs::read_to_string(path).ok()?;
    if raw.trim().is_empty() {
        return None;
    }
    match serde_json::from_str::<JsonReport>(&raw) {
        Ok(report) => Some((report.total - report.passed).max(0)),
        Err(err) => {
            tracing::warn!(path = %path.display(), "ignoring unreadable runner report: {}", err);
            None
        }
    }
}

// The exit code is the failed test count, but it wraps at 256. A report that
// shows failures always wins.
fn failed_count(exit_code: i32, reported: Option<i64>) -> i64 {
    match reported {
        Some(failed) if failed > 0 => failed,
        _ => i64::from(exit_code),
    }
}

#[cfg(test)]
pub(crate) mod fake {
    use std::sync::{Arc, Mutex};

    use super::*;

    /// Scripted runner session that records every call.
    #[derive(Debug, Clone, Default)]
    pub struct FakeFactory {
        pub calls: Arc<Mutex<Vec<String>>>,
        pub failed: i64,
        pub fail_create: bool,
        pub fail_run: bool,
    }

    impl FakeFactory {
        pub fn with_failed(failed: i64) -> Self {
            Self {
                failed,
                ..Self::default()
            }
        }

        pub fn calls(&self) -> Vec<String> {
            self.calls.lock().unwrap().clone()
        }

        fn record(&self, call: String) {
            self.calls.lock().unwrap().push(call);
        }
    }

    pub struct FakeSession(FakeFactory);

    pub struct FakeRunner(FakeFactory);

    impl SessionFactory for FakeFactory {
        type Session = FakeSession;

        async fn create_session(
            &self,
            hostname: &str,
            ports: [u16; 2],
        ) -> Result<FakeSession, DownstreamError> {
            self.record(format!("create {} {},{}", hostname, ports[0], ports[1]));
            if self.fail_create {
                return Err(DownstreamError::Runner("browser failed to start".into()));
            }
            Ok(FakeSession(self.clone()))
        }
    }

    impl Session for FakeSession {
        type Runner = FakeRunner;

        fn create_runner(&self) -> FakeRunner {
            FakeRunner(self.0.clone())
        }

        async fn close(self) {
            self.0.record("close".to_string());
        }
    }

    impl Runner for FakeRunner {
        fn src(self, src: &str) -> Self {
            self.0.record(format!("src {}", src));
            self
        }

        fn browsers(self, browsers: &[String]) -> Self {
            self.0.record(format!("browsers {}", browsers.join(",")));
            self
        }

        fn base_url(self, url: Option<&Url>) -> Self {
            let url = url.map(Url::as_str).unwrap_or("-");
            self.0.record(format!("base_url {}", url));
            self
        }

        async fn run(self) -> Result<i64, DownstreamError> {
            self.0.record("run".to_string());
            if self.0.fail_run {
                return Err(DownstreamError::Runner("test file failed to compile".into()));
            }
            Ok(self.0.failed)
        }
    }
}
