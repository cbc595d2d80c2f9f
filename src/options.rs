//! Typed option schemas for each executor kind.
//!
//! Target options arrive as loose TOML tables (base options merged with a
//! named configuration). Validation deserializes them into these structs,
//! which rejects unknown keys and wrong types before anything is spawned.

use std::time::Duration;

use serde::Deserialize;

/// Network settings of a dev server; exactly one base URL derives from it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerOptions {
    pub host: String,
    pub port: u16,
    pub ssl: bool,
    pub public_host: Option<String>,
}

/// How to decide that a started dev server is ready for tests.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReadinessCheck {
    /// Ready as soon as the process has been spawned.
    #[default]
    Started,
    /// Wait for the server's host and port to accept TCP connections.
    Tcp,
    /// Wait for any HTTP response from the base URL.
    Http,
    /// Wait for a fixed duration (milliseconds).
    Delay(u64),
    /// Wait for an output line matching a regex.
    Log(String),
}

/// File watching used when a target runs with `watch` enabled.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WatchSettings {
    pub enabled: bool,
    pub paths: Vec<String>,
    pub ignore: Vec<String>,
    /// Skip `.gitignore` rules when filtering change events.
    pub ignore_gitignore: bool,
    pub debounce_ms: u64,
}

const DEFAULT_DEBOUNCE_MS: u64 = 200;
const DEFAULT_READY_TIMEOUT_MS: u64 = 60_000;

/// Options accepted by `dev-server` targets.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DevServerOptions {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default)]
    pub ssl: bool,
    pub public_host: Option<String>,
    #[serde(default)]
    pub watch: bool,
    #[serde(default)]
    pub ready_check: ReadinessCheck,
    /// How long `tcp`, `http` and `log` checks wait before giving up.
    pub ready_timeout_ms: Option<u64>,
    #[serde(default)]
    pub watch_paths: Vec<String>,
    #[serde(default)]
    pub watch_ignore: Vec<String>,
    #[serde(default)]
    pub watch_ignore_gitignore: bool,
    pub watch_debounce_ms: Option<u64>,
}

/// Options accepted by plain `command` targets.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CommandOptions {
    #[serde(default)]
    pub watch: bool,
    #[serde(default)]
    pub watch_paths: Vec<String>,
    #[serde(default)]
    pub watch_ignore: Vec<String>,
    #[serde(default)]
    pub watch_ignore_gitignore: bool,
    pub watch_debounce_ms: Option<u64>,
}

fn default_host() -> String {
    "localhost".to_string()
}

fn default_port() -> u16 {
    4200
}

impl DevServerOptions {
    pub fn server(&self) -> ServerOptions {
        ServerOptions {
            host: self.host.clone(),
            port: self.port,
            ssl: self.ssl,
            public_host: self.public_host.clone(),
        }
    }

    pub fn watch_settings(&self) -> WatchSettings {
        WatchSettings {
            enabled: self.watch,
            paths: self.watch_paths.clone(),
            ignore: self.watch_ignore.clone(),
            ignore_gitignore: self.watch_ignore_gitignore,
            debounce_ms: self.watch_debounce_ms.unwrap_or(DEFAULT_DEBOUNCE_MS),
        }
    }

    pub fn ready_timeout(&self) -> Duration {
        Duration::from_millis(self.ready_timeout_ms.unwrap_or(DEFAULT_READY_TIMEOUT_MS))
    }

    /// Checks constraints the type system does not express.
    pub fn check(&self) -> Result<(), String> {
        if self.host.trim().is_empty() {
            return Err("host must not be empty".to_string());
        }
        if self.port == 0 {
            return Err("port must be between 1 and 65535".to_string());
        }
        if let Some(public_host) = &self.public_host {
            if public_host.trim().is_empty() {
                return Err("public_host must not be empty when set".to_string());
            }
        }
        if self.ready_timeout_ms == Some(0) {
            return Err("ready_timeout_ms must be positive".to_string());
        }
        if let ReadinessCheck::Log(pattern) = &self.ready_check {
            regex::Regex::new(pattern)
                .map_err(|err| format!("ready_check log pattern is invalid: {}", err))?;
        }
        Ok(())
    }
}

impl CommandOptions {
    pub fn watch_settings(&self) -> WatchSettings {
        WatchSettings {
            enabled: self.watch,
            paths: self.watch_paths.clone(),
            ignore: self.watch_ignore.clone(),
            ignore_gitignore: self.watch_ignore_gitignore,
            debounce_ms: self.watch_debounce_ms.unwrap_or(DEFAULT_DEBOUNCE_MS),
        }
    }
}
