//! Configuration management for testrack.
//!
//! This module defines the structure of the `testrack.toml` configuration file
//! and provides functionality to load, parse and write it.

use std::collections::{BTreeMap, HashMap};
use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::registry::Executor;

/// Name of the configuration file looked up in the working directory.
pub const CONFIG_FILE: &str = "testrack.toml";

/// Top-level configuration structure corresponding to `testrack.toml`.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct Config {
    /// Defaults for `testrack run`.
    #[serde(default)]
    pub e2e: E2eConfig,
    /// The external test runner.
    #[serde(default)]
    pub runner: RunnerConfig,
    /// Buildable targets keyed by `project:target`.
    #[serde(default)]
    pub targets: BTreeMap<String, TargetConfig>,
}

/// Defaults for an end-to-end run.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct E2eConfig {
    /// Dev server to start before the tests (`project:target[:configuration]`).
    pub dev_server_target: Option<String>,
    /// URL to test against when no dev server target is given.
    pub base_url: Option<String>,
    /// Keep the dev server rebuilding on change.
    pub watch: Option<bool>,
}

/// Configuration of the external test runner.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct RunnerConfig {
    /// Command used to launch the runner.
    pub cmd: String,
    /// Hostname the runner binds its session to.
    pub hostname: String,
    /// The two local ports the runner session listens on.
    pub ports: [u16; 2],
    /// Test sources (file, directory or glob).
    pub src: Option<String>,
    /// Browsers to run the tests in.
    pub browsers: Vec<String>,
    /// Reporter name forwarded to the runner.
    pub reporter: Option<String>,
    /// Add a `json:<file>` reporter and take the failure count from it.
    pub json_report: bool,
    /// Number of browser instances per browser.
    pub concurrency: Option<u32>,
    /// Rerun failing tests to detect unstable ones.
    pub quarantine_mode: Option<bool>,
    /// Directory for screenshots.
    pub screenshots: Option<String>,
    /// Extra arguments appended verbatim.
    pub args: Vec<String>,
    /// Working directory for the runner.
    pub cwd: Option<String>,
    /// Environment variables for the runner.
    #[serde(skip_serializing_if = "HashMap::is_empty")]
    pub env: HashMap<String, String>,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            cmd: "npx testcafe".to_string(),
            hostname: "localhost".to_string(),
            ports: [1337, 1338],
            src: None,
            browsers: Vec::new(),
            reporter: None,
            json_report: true,
            concurrency: None,
            quarantine_mode: None,
            screenshots: None,
            args: Vec::new(),
            cwd: None,
            env: HashMap::new(),
        }
    }
}

/// Configuration for a single target.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct TargetConfig {
    /// Executor kind that validates and runs the target.
    pub executor: Executor,
    /// Command to execute; may contain `{host}`-style placeholders.
    pub cmd: String,
    /// Working directory for the command.
    pub cwd: Option<String>,
    /// Environment variables to set for the command.
    pub env: Option<HashMap<String, String>>,
    /// Base options, checked against the executor's schema.
    #[serde(default)]
    pub options: toml::Table,
    /// Named option overrides, selected by the third target segment.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub configurations: BTreeMap<String, toml::Table>,
}

/// Loads and parses the configuration from a file path.
pub fn load_config(path: &Path) -> Result<Config> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read config file {}", path.display()))?;
    let config: Config = toml::from_str(&raw)
        .with_context(|| format!("failed to parse config file {}", path.display()))?;
    Ok(config)
}

/// Serializes a configuration to `path`.
pub fn write_config(path: &Path, config: &Config) -> Result<()> {
    let raw = toml::to_string_pretty(config).context("failed to serialize config")?;
    std::fs::write(path, raw)
        .with_context(|| format!("failed to write config file {}", path.display()))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_full_config() {
        let raw = r#"
[e2e]
dev_server_target = "app:serve"
watch = false

[runner]
cmd = "npx testcafe"
hostname = "127.0.0.1"
ports = [2337, 2338]
src = "apps/app-e2e/src/**/*.spec.ts"
browsers = ["chrome:headless", "firefox:headless"]
reporter = "spec"
concurrency = 2
quarantine_mode = true
screenshots = "dist/screenshots"
args = ["--skip-js-errors"]

[targets."app:serve"]
executor = "dev-server"
cmd = "npx vite --host {host} --port {port}"
cwd = "apps/app"
env = { NODE_ENV = "development" }

[targets."app:serve".options]
host = "0.0.0.0"
port = 4200

[targets."app:serve".configurations.production]
port = 4300
ssl = true

[targets."app:build"]
executor = "command"
cmd = "npx vite build"
"#;
        let config: Config = toml::from_str(raw).unwrap();
        assert_eq!(config.e2e.dev_server_target.as_deref(), Some("app:serve"));
        assert_eq!(config.e2e.watch, Some(false));
        assert_eq!(config.runner.hostname, "127.0.0.1");
        assert_eq!(config.runner.ports, [2337, 2338]);
        assert_eq!(config.runner.browsers.len(), 2);
        assert_eq!(config.runner.concurrency, Some(2));
        assert_eq!(config.targets.len(), 2);

        let serve = &config.targets["app:serve"];
        assert_eq!(serve.executor, Executor::DevServer);
        assert_eq!(serve.options.get("port").and_then(|v| v.as_integer()), Some(4200));
        assert!(serve.configurations.contains_key("production"));
        assert_eq!(config.targets["app:build"].executor, Executor::Command);
    }

    #[test]
    fn runner_defaults_apply() {
        let config: Config = toml::from_str("").unwrap();
        assert_eq!(config.runner.cmd, "npx testcafe");
        assert_eq!(config.runner.hostname, "localhost");
        assert_eq!(config.runner.ports, [1337, 1338]);
        assert!(config.runner.json_report);
        assert!(config.targets.is_empty());
    }

    #[test]
    fn rejects_unknown_executor() {
        let raw = r#"
[targets."app:serve"]
executor = "webpack"
cmd = "webpack serve"
"#;
        assert!(toml::from_str::<Config>(raw).is_err());
    }

    #[test]
    fn load_reports_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let err = load_config(&dir.path().join(CONFIG_FILE)).unwrap_err();
        assert!(err.to_string().contains("failed to read config file"));
    }
}
