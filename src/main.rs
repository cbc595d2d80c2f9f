//! testrack: start a dev server target and run end-to-end tests against it.
//!
//! This is the entry point of the application. It parses command-line
//! arguments, loads `testrack.toml`, and drives one orchestrated run: dev
//! server first, then the test runner, then teardown.

mod base_url;
mod config;
mod downstream;
mod error;
mod events;
mod guard;
mod init;
mod options;
mod orchestrator;
mod output;
mod registry;
mod runner;
mod target;
mod watch;

use std::path::{Path, PathBuf};
use std::process::ExitCode;

use anyhow::{anyhow, bail, Result};
use clap::builder::styling::{AnsiColor, Effects, Style};
use clap::builder::Styles;
use clap::{Args, Parser, Subcommand};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::config::{Config, CONFIG_FILE};
use crate::downstream::{CommandSessionFactory, DownstreamRequest};
use crate::events::ProcessSignal;
use crate::guard::{HandleState, ProcessGuard};
use crate::orchestrator::{Orchestrator, RunRequest};
use crate::registry::TargetRegistry;

/// Command-line interface definition.
#[derive(Debug, Parser)]
#[command(
    name = "testrack",
    version,
    about = "Start a dev server target and run end-to-end tests against it",
    styles = help_styles(),
    disable_help_subcommand = true
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
    /// Path to testrack.toml configuration file.
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    /// Ignore any testrack.toml in the current directory.
    #[arg(long, global = true)]
    no_config: bool,
    /// Log debug output, including dev server output.
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Start the dev server (if any) and run the tests.
    Run(RunArgs),
    /// Write a starter testrack.toml.
    Init(InitArgs),
    /// List configured targets.
    Targets,
    /// Show version information.
    Version,
}

#[derive(Debug, Args)]
struct RunArgs {
    /// Dev server target to start first (project:target[:configuration]).
    #[arg(long)]
    dev_server_target: Option<String>,
    /// Do not start the configured dev server.
    #[arg(long, conflicts_with = "dev_server_target")]
    skip_serve: bool,
    /// URL to test against when no dev server is started.
    #[arg(long)]
    base_url: Option<String>,
    /// Test sources passed to the runner.
    #[arg(long)]
    src: Option<String>,
    /// Comma-separated browsers.
    #[arg(long, value_delimiter = ',')]
    browsers: Vec<String>,
    /// Hostname for the runner session.
    #[arg(long)]
    hostname: Option<String>,
    /// The two runner session ports (e.g. 1337,1338).
    #[arg(long, value_delimiter = ',')]
    ports: Vec<u16>,
    /// Keep the dev server rebuilding on change.
    #[arg(long)]
    watch: bool,
    /// Print the outcome as JSON on stdout.
    #[arg(long)]
    json: bool,
}

#[derive(Debug, Args)]
struct InitArgs {
    /// Project to generate the configuration for.
    #[arg(long)]
    project: String,
    /// Overwrite an existing configuration file.
    #[arg(long)]
    force: bool,
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    match &cli.command {
        Commands::Version => {
            println!("testrack {}", env!("CARGO_PKG_VERSION"));
            Ok(ExitCode::SUCCESS)
        }
        Commands::Init(args) => {
            let path = cli.config.clone().unwrap_or_else(|| PathBuf::from(CONFIG_FILE));
            init::init(&path, &args.project, args.force)?;
            Ok(ExitCode::SUCCESS)
        }
        Commands::Targets => {
            let config = load_config(&cli)?;
            print_targets(&TargetRegistry::new(config.targets));
            Ok(ExitCode::SUCCESS)
        }
        Commands::Run(args) => run(&cli, args).await,
    }
}

async fn run(cli: &Cli, args: &RunArgs) -> Result<ExitCode> {
    let config = load_config(cli)?;
    let request = build_request(&config, args)?;

    let guard = ProcessGuard::new();
    let factory = CommandSessionFactory::new(config.runner.clone());
    let mut orchestrator = Orchestrator::new(
        TargetRegistry::new(config.targets.clone()),
        guard.clone(),
        factory,
    );

    let result = tokio::select! {
        result = orchestrator.run(&request) => result,
        signal = wait_for_signal() => {
            tracing::warn!("received {}, shutting down", signal.label());
            if let HandleState::Running { pid } = guard.state() {
                tracing::info!(pid, "stopping dev server");
            }
            guard.terminate();
            return Ok(ExitCode::from(130));
        }
    };
    let outcome = result?;

    if args.json {
        println!("{}", serde_json::to_string(&outcome)?);
    }
    Ok(if outcome.success {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    })
}

fn init_tracing(verbose: bool) {
    let default = if verbose { "testrack=debug" } else { "testrack=info" };
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| default.into()))
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(std::io::stderr)
                .with_target(false),
        )
        .init();
}

fn load_config(cli: &Cli) -> Result<Config> {
    if cli.no_config {
        return Ok(Config::default());
    }
    match cli.config.clone().or_else(default_config_path) {
        Some(path) => config::load_config(&path),
        None => Ok(Config::default()),
    }
}

fn default_config_path() -> Option<PathBuf> {
    let path = Path::new(CONFIG_FILE);
    if path.exists() {
        Some(path.to_path_buf())
    } else {
        None
    }
}

// Command-line values win over the configuration file.
fn build_request(config: &Config, args: &RunArgs) -> Result<RunRequest> {
    let dev_server_target = if args.skip_serve {
        None
    } else {
        args.dev_server_target
            .clone()
            .or_else(|| config.e2e.dev_server_target.clone())
    };
    let base_url = args.base_url.clone().or_else(|| config.e2e.base_url.clone());
    let watch = args.watch || config.e2e.watch.unwrap_or(false);

    let src = args
        .src
        .clone()
        .or_else(|| config.runner.src.clone())
        .ok_or_else(|| anyhow!("no test sources configured (set runner.src or pass --src)"))?;
    let browsers = if args.browsers.is_empty() {
        config.runner.browsers.clone()
    } else {
        args.browsers.clone()
    };
    if browsers.is_empty() {
        bail!("no browsers configured (set runner.browsers or pass --browsers)");
    }
    let hostname = args
        .hostname
        .clone()
        .unwrap_or_else(|| config.runner.hostname.clone());
    let ports = match args.ports.as_slice() {
        [] => config.runner.ports,
        [first, second] => [*first, *second],
        _ => bail!("--ports takes exactly two ports"),
    };
    if ports[0] == ports[1] {
        bail!("runner ports must differ (got {} twice)", ports[0]);
    }

    Ok(RunRequest {
        dev_server_target,
        base_url,
        watch,
        downstream: DownstreamRequest {
            hostname,
            ports,
            src,
            browsers,
        },
    })
}

fn print_targets(registry: &TargetRegistry) {
    let mut any = false;
    for (key, target) in registry.targets() {
        any = true;
        let configurations: Vec<&str> = target.configurations.keys().map(String::as_str).collect();
        if configurations.is_empty() {
            println!("{} ({})", key, target.executor.label());
        } else {
            println!(
                "{} ({}) configurations: {}",
                key,
                target.executor.label(),
                configurations.join(", ")
            );
        }
    }
    if !any {
        println!("no targets configured");
    }
}

async fn wait_for_signal() -> ProcessSignal {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = match signal(SignalKind::terminate()) {
            Ok(signal) => signal,
            Err(_) => {
                let _ = tokio::signal::ctrl_c().await;
                return ProcessSignal::SigInt;
            }
        };
        tokio::select! {
            _ = tokio::signal::ctrl_c() => ProcessSignal::SigInt,
            _ = sigterm.recv() => ProcessSignal::SigTerm,
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
        ProcessSignal::SigInt
    }
}

fn help_styles() -> Styles {
    Styles::styled()
        .header(
            Style::new()
                .fg_color(Some(AnsiColor::Cyan.into()))
                .effects(Effects::BOLD),
        )
        .usage(
            Style::new()
                .fg_color(Some(AnsiColor::Green.into()))
                .effects(Effects::BOLD),
        )
        .literal(Style::new().fg_color(Some(AnsiColor::Yellow.into())))
        .placeholder(Style::new().fg_color(Some(AnsiColor::Magenta.into())))
        .valid(Style::new().fg_color(Some(AnsiColor::Green.into())))
        .invalid(
            Style::new()
                .fg_color(Some(AnsiColor::Red.into()))
                .effects(Effects::BOLD),
        )
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse_run(args: &[&str]) -> RunArgs {
        let cli = Cli::try_parse_from(std::iter::once("testrack").chain(args.iter().copied()))
            .unwrap();
        match cli.command {
            Commands::Run(args) => args,
            other => panic!("expected run, got {other:?}"),
        }
    }

    fn config() -> Config {
        toml::from_str(
            r#"
[e2e]
dev_server_target = "app:serve"

[runner]
src = "apps/app-e2e/src"
browsers = ["chrome:headless"]
"#,
        )
        .unwrap()
    }

    #[test]
    fn cli_values_override_config() {
        let args = parse_run(&[
            "run",
            "--dev-server-target",
            "app:serve:production",
            "--browsers",
            "firefox,safari",
            "--ports",
            "2000,2001",
            "--watch",
        ]);
        let request = build_request(&config(), &args).unwrap();
        assert_eq!(request.dev_server_target.as_deref(), Some("app:serve:production"));
        assert!(request.watch);
        assert_eq!(request.downstream.browsers, vec!["firefox", "safari"]);
        assert_eq!(request.downstream.ports, [2000, 2001]);
        assert_eq!(request.downstream.src, "apps/app-e2e/src");
        assert_eq!(request.downstream.hostname, "localhost");
    }

    #[test]
    fn skip_serve_drops_configured_dev_server() {
        let args = parse_run(&["run", "--skip-serve", "--base-url", "http://localhost:8080"]);
        let request = build_request(&config(), &args).unwrap();
        assert_eq!(request.dev_server_target, None);
        assert_eq!(request.base_url.as_deref(), Some("http://localhost:8080"));
    }

    #[test]
    fn rejects_bad_ports_and_missing_sources() {
        let args = parse_run(&["run", "--ports", "1337"]);
        assert!(build_request(&config(), &args).is_err());

        let args = parse_run(&["run", "--ports", "1337,1337"]);
        assert!(build_request(&config(), &args).is_err());

        let args = parse_run(&["run"]);
        let err = build_request(&Config::default(), &args).unwrap_err();
        assert!(err.to_string().contains("no test sources"));
    }

    #[test]
    fn skip_serve_conflicts_with_explicit_target() {
        let result = Cli::try_parse_from([
            "testrack",
            "run",
            "--skip-serve",
            "--dev-server-target",
            "app:serve",
        ]);
        assert!(result.is_err());
    }
}
