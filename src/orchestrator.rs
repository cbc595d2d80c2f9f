//! End-to-end run orchestration.
//!
//! A run optionally starts a dev server target and waits for it to become
//! ready, records the base URL it serves on, hands that URL to the test
//! runner, and finally stops the dev server. The outcome of the test run is
//! the outcome of the whole run.

use reqwest::Url;

use crate::base_url::{derive_base_url, parse_base_url};
use crate::downstream::{self, DownstreamRequest, RunOutcome, SessionFactory};
use crate::error::OrchestratorError;
use crate::events::BuildEvent;
use crate::guard::ProcessGuard;
use crate::output::{strip_ansi, OutputTail, StreamKind};
use crate::registry::TargetRegistry;
use crate::runner::{BuildRun, TargetRunner};
use crate::target::TargetSpec;

const TAIL_LINES: usize = 20;

/// Parameters of one end-to-end run.
#[derive(Debug, Clone)]
pub struct RunRequest {
    /// Dev server to start first (`project:target[:configuration]`).
    pub dev_server_target: Option<String>,
    /// URL to use when no dev server provides one.
    pub base_url: Option<String>,
    /// Keep the dev server rebuilding on change.
    pub watch: bool,
    pub downstream: DownstreamRequest,
}

pub struct Orchestrator<F> {
    registry: TargetRegistry,
    runner: TargetRunner,
    factory: F,
    base_url: Option<Url>,
}

impl<F: SessionFactory> Orchestrator<F> {
    pub fn new(registry: TargetRegistry, guard: ProcessGuard, factory: F) -> Self {
        Self {
            registry,
            runner: TargetRunner::new(guard),
            factory,
            base_url: None,
        }
    }

    /// Base URL of the run in progress, if one was derived.
    #[cfg(test)]
    pub fn base_url(&self) -> Option<&Url> {
        self.base_url.as_ref()
    }

    /// Executes one run. The base URL only lives for the duration of the call.
    pub async fn run(&mut self, request: &RunRequest) -> Result<RunOutcome, OrchestratorError> {
        self.base_url = None;
        let result = self.run_inner(request).await;
        self.base_url = None;
        result
    }

    async fn run_inner(&mut self, request: &RunRequest) -> Result<RunOutcome, OrchestratorError> {
        let explicit = request
            .base_url
            .as_deref()
            .map(parse_base_url)
            .transpose()?;

        let mut dev_server = None;
        let mut label = String::new();
        if let Some(raw) = &request.dev_server_target {
            let spec: TargetSpec = raw.parse()?;
            label = spec.to_string();
            let (run, derived) = self.start_dev_server(&spec, request.watch).await?;
            dev_server = Some(run);
            self.base_url = derived;
        }
        if self.base_url.is_none() {
            self.base_url = explicit;
        }

        match &self.base_url {
            Some(url) => tracing::info!(base_url = %url, "running tests"),
            None => tracing::info!("running tests without a base url"),
        }

        let outcome = {
            let invoke =
                downstream::invoke(&self.factory, &request.downstream, self.base_url.as_ref());
            tokio::pin!(invoke);
            // Keep draining the dev server so its output pipes never fill up.
            loop {
                tokio::select! {
                    outcome = &mut invoke => break outcome,
                    Some(event) = next_build_event(&mut dev_server) => observe(&label, event),
                }
            }
        };

        if let Some(run) = dev_server.take() {
            tracing::info!(target_name = %label, "stopping dev server");
            run.stop().await;
        }

        let outcome = outcome?;
        if outcome.success {
            tracing::info!("all tests passed");
        } else {
            tracing::warn!("tests failed");
        }
        Ok(outcome)
    }

    // Resolves, validates and starts the target, then waits for readiness.
    // Nothing is spawned unless resolution and validation both pass.
    async fn start_dev_server(
        &self,
        spec: &TargetSpec,
        watch: bool,
    ) -> Result<(BuildRun, Option<Url>), OrchestratorError> {
        let label = spec.to_string();
        let resolved = self.registry.resolve(spec)?;
        let target = self.registry.validate(resolved, watch)?;
        let url = target
            .server()
            .map(|server| derive_base_url(&server))
            .transpose()?;

        tracing::info!(target_name = %label, "starting {} {}", target.program, target.args.join(" "));
        let mut run = self.runner.execute(target);
        let mut tail = OutputTail::new(TAIL_LINES);
        loop {
            match run.next_event().await {
                Some(BuildEvent::Ready) => break,
                Some(BuildEvent::Output { line, stream }) => {
                    log_output(&label, &line, stream);
                    tail.push(strip_ansi(&line));
                }
                Some(BuildEvent::SpawnFailed { error }) => {
                    run.stop().await;
                    return Err(OrchestratorError::Spawn {
                        target: label,
                        message: error,
                    });
                }
                Some(BuildEvent::ReadinessFailed { error }) => {
                    run.stop().await;
                    return Err(OrchestratorError::NotReady {
                        target: label,
                        message: error,
                    });
                }
                Some(BuildEvent::Terminal { code, .. }) => {
                    return Err(OrchestratorError::ExitedBeforeReady {
                        target: label,
                        code,
                        tail: tail.render(),
                    });
                }
                Some(other) => observe(&label, other),
                None => {
                    return Err(OrchestratorError::ExitedBeforeReady {
                        target: label,
                        code: None,
                        tail: tail.render(),
                    });
                }
            }
        }
        tracing::info!(target_name = %label, "dev server ready");
        Ok((run, url))
    }
}

async fn next_build_event(run: &mut Option<BuildRun>) -> Option<BuildEvent> {
    match run {
        Some(run) => run.next_event().await,
        None => std::future::pending().await,
    }
}

fn observe(label: &str, event: BuildEvent) {
    match event {
        BuildEvent::Output { line, stream } => log_output(label, &line, stream),
        BuildEvent::Started { pid } => tracing::debug!(target_name = %label, pid, "started"),
        BuildEvent::Rebuilt { success } => {
            tracing::info!(target_name = %label, success, "rebuilt")
        }
        BuildEvent::Terminal { success, code } => {
            tracing::warn!(target_name = %label, success, ?code, "dev server exited during the test run")
        }
        other => tracing::debug!(target_name = %label, event = ?other),
    }
}

fn log_output(label: &str, line: &str, stream: StreamKind) {
    match stream {
        StreamKind::Stdout => tracing::debug!(target_name = %label, "{}", line),
        StreamKind::Stderr => tracing::debug!(target_name = %label, stderr = true, "{}", line),
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::downstream::fake::FakeFactory;
    use crate::error::{ResolveError, ValidationError};
    use crate::guard::HandleState;

    const TARGETS: &str = r#"
[targets."app:serve"]
executor = "dev-server"
cmd = "sleep 30"

[targets."app:serve".options]
host = "0.0.0.0"
port = 4200
ssl = false

[targets."app:serve".configurations.production]

[targets."app:serve".configurations.invalid]
port = 0

[targets."app:crash"]
executor = "dev-server"
cmd = "sh -c 'printf \"\\033[31mcannot bind port\\033[0m\\n\"; exit 1'"

[targets."app:crash".options]
ready_check = { log = "listening" }
"#;

    fn orchestrator_with(
        extra: &str,
        factory: FakeFactory,
    ) -> (Orchestrator<FakeFactory>, ProcessGuard) {
        let config: crate::config::Config = toml::from_str(&format!("{}{}", TARGETS, extra)).unwrap();
        let guard = ProcessGuard::new();
        let orchestrator = Orchestrator::new(TargetRegistry::new(config.targets), guard.clone(), factory);
        (orchestrator, guard)
    }

    fn orchestrator(factory: FakeFactory) -> (Orchestrator<FakeFactory>, ProcessGuard) {
        orchestrator_with("", factory)
    }

    fn request(dev_server_target: Option<&str>) -> RunRequest {
        RunRequest {
            dev_server_target: dev_server_target.map(str::to_string),
            base_url: None,
            watch: false,
            downstream: DownstreamRequest {
                hostname: "localhost".to_string(),
                ports: [1337, 1338],
                src: "apps/app-e2e/src".to_string(),
                browsers: vec!["chrome:headless".to_string()],
            },
        }
    }

    #[tokio::test]
    async fn serves_then_tests_against_derived_url() {
        let factory = FakeFactory::with_failed(0);
        let (mut orchestrator, guard) = orchestrator(factory.clone());

        let outcome = orchestrator
            .run(&request(Some("app:serve:production")))
            .await
            .unwrap();

        assert_eq!(outcome, RunOutcome { success: true });
        assert!(factory
            .calls()
            .contains(&"base_url http://0.0.0.0:4200/".to_string()));
        assert_eq!(guard.state(), HandleState::Absent);
        assert!(orchestrator.base_url().is_none());
    }

    #[tokio::test]
    async fn failed_tests_stop_the_dev_server_too() {
        let factory = FakeFactory::with_failed(3);
        let (mut orchestrator, guard) = orchestrator(factory.clone());
        let outcome = orchestrator.run(&request(Some("app:serve"))).await.unwrap();
        assert_eq!(outcome, RunOutcome { success: false });
        assert_eq!(guard.state(), HandleState::Absent);
    }

    #[tokio::test]
    async fn no_dev_server_means_no_base_url() {
        let factory = FakeFactory::with_failed(0);
        let (mut orchestrator, _guard) = orchestrator(factory.clone());
        let outcome = orchestrator.run(&request(None)).await.unwrap();
        assert!(outcome.success);
        assert!(factory.calls().contains(&"base_url -".to_string()));
    }

    #[tokio::test]
    async fn explicit_base_url_is_used_without_dev_server() {
        let factory = FakeFactory::with_failed(0);
        let (mut orchestrator, _guard) = orchestrator(factory.clone());
        let mut request = request(None);
        request.base_url = Some("https://staging.example.com".to_string());
        orchestrator.run(&request).await.unwrap();
        assert!(factory
            .calls()
            .contains(&"base_url https://staging.example.com/".to_string()));
    }

    #[tokio::test]
    async fn setup_errors_fail_before_anything_runs() {
        let factory = FakeFactory::with_failed(0);
        let (mut orchestrator, guard) = orchestrator(factory.clone());

        let err = orchestrator.run(&request(Some("app"))).await.unwrap_err();
        assert!(matches!(
            err,
            OrchestratorError::Resolve(ResolveError::Unresolvable { .. })
        ));

        let err = orchestrator
            .run(&request(Some("app:serve:invalid")))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            OrchestratorError::Validation(ValidationError::Invalid { .. })
        ));

        assert!(factory.calls().is_empty());
        assert_eq!(guard.state(), HandleState::Absent);
    }

    #[tokio::test]
    async fn early_exit_reports_last_output() {
        let factory = FakeFactory::with_failed(0);
        let (mut orchestrator, guard) = orchestrator(factory.clone());
        let err = orchestrator.run(&request(Some("app:crash"))).await.unwrap_err();
        match err {
            OrchestratorError::ExitedBeforeReady { code, tail, .. } => {
                assert_eq!(code, Some(1));
                assert!(tail.contains("  cannot bind port"));
                assert!(!tail.contains('\u{1b}'));
            }
            other => panic!("unexpected error: {other}"),
        }
        assert!(factory.calls().is_empty());
        assert_eq!(guard.state(), HandleState::Absent);
    }

    #[tokio::test]
    async fn readiness_failure_stops_the_server_before_tests() {
        let port = {
            let listener = std::net::TcpListener::bind(("127.0.0.1", 0)).unwrap();
            listener.local_addr().unwrap().port()
        };
        let extra = format!(
            r#"
[targets."app:silent"]
executor = "dev-server"
cmd = "sleep 30"

[targets."app:silent".options]
host = "127.0.0.1"
port = {}
ready_check = "tcp"
ready_timeout_ms = 300
"#,
            port
        );
        let factory = FakeFactory::with_failed(0);
        let (mut orchestrator, guard) = orchestrator_with(&extra, factory.clone());
        let err = orchestrator.run(&request(Some("app:silent"))).await.unwrap_err();
        assert!(matches!(err, OrchestratorError::NotReady { .. }));
        assert!(factory.calls().is_empty());
        assert_eq!(guard.state(), HandleState::Absent);
    }
}
