//! Error types for target resolution, validation and test runs.

use thiserror::Error;

/// A target string could not be mapped to a configured target.
#[derive(Debug, Error)]
pub enum ResolveError {
    #[error("unresolvable target \"{spec}\" (expected project:target[:configuration])")]
    Unresolvable { spec: String },

    #[error("no target named \"{key}\" is configured")]
    UnknownTarget { key: String },

    #[error("target \"{key}\" has no configuration named \"{configuration}\"")]
    UnknownConfiguration { key: String, configuration: String },
}

/// Target options did not match the executor's schema.
#[derive(Debug, Error)]
pub enum ValidationError {
    #[error("invalid options for {target}: {source}")]
    Schema {
        target: String,
        #[source]
        source: toml::de::Error,
    },

    #[error("invalid options for {target}: {message}")]
    Invalid { target: String, message: String },

    #[error("invalid command for {target}: {message}")]
    Command { target: String, message: String },
}

/// The base URL could not be derived from the server options.
#[derive(Debug, Error)]
pub enum BaseUrlError {
    #[error("invalid base url \"{url}\": {message}")]
    Parse { url: String, message: String },
}

/// Failures while driving the external test runner.
#[derive(Debug, Error)]
pub enum DownstreamError {
    #[error("port {port} on {hostname} is already in use")]
    PortInUse {
        hostname: String,
        port: u16,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to spawn test runner {cmd}: {source}")]
    Spawn {
        cmd: String,
        #[source]
        source: std::io::Error,
    },

    #[error("test runner I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("test runner was terminated by a signal")]
    Killed,

    #[error("test runner error: {0}")]
    Runner(String),
}

/// Errors from the process guard's bookkeeping (never from termination).
#[derive(Debug, Error, PartialEq, Eq)]
pub enum GuardError {
    #[error("already tracking process {pid}; terminate it before spawning another")]
    AlreadyTracking { pid: u32 },
}

/// Top-level failure of an end-to-end run.
#[derive(Debug, Error)]
pub enum OrchestratorError {
    #[error(transparent)]
    Resolve(#[from] ResolveError),

    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error(transparent)]
    BaseUrl(#[from] BaseUrlError),

    #[error(transparent)]
    Downstream(#[from] DownstreamError),

    #[error("failed to start {target}: {message}")]
    Spawn { target: String, message: String },

    #[error("{target} exited before it was ready (code {code:?}){tail}")]
    ExitedBeforeReady {
        target: String,
        code: Option<i32>,
        tail: String,
    },

    #[error("{target} did not become ready: {message}")]
    NotReady { target: String, message: String },
}
