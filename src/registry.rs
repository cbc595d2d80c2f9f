//! Target registry: resolve, then validate.
//!
//! Targets are looked up by `project:target`, their option tables merged with
//! the requested configuration, and the result checked against the schema of
//! the target's executor kind. Only a `ValidatedTarget` can be executed, so a
//! resolution or validation failure never reaches process spawning.

use std::collections::{BTreeMap, HashMap};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::config::TargetConfig;
use crate::error::{ResolveError, ValidationError};
use crate::options::{
    CommandOptions, DevServerOptions, ReadinessCheck, ServerOptions, WatchSettings,
};
use crate::target::TargetSpec;

/// Executor kinds a target can declare.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum Executor {
    /// A long running server with host/port options.
    DevServer,
    /// Any other command (builds, code generators, scripts).
    Command,
}

impl Executor {
    pub fn label(self) -> &'static str {
        match self {
            Executor::DevServer => "dev-server",
            Executor::Command => "command",
        }
    }

    fn validate(
        self,
        target: &str,
        mut options: toml::Table,
        watch: bool,
    ) -> Result<TargetOptions, ValidationError> {
        // The caller's flag always wins over the target's own watch setting.
        options.insert("watch".to_string(), toml::Value::Boolean(watch));
        let schema_err = |source: toml::de::Error| ValidationError::Schema {
            target: target.to_string(),
            source,
        };
        match self {
            Executor::DevServer => {
                let parsed: DevServerOptions =
                    toml::Value::Table(options).try_into().map_err(schema_err)?;
                parsed.check().map_err(|message| ValidationError::Invalid {
                    target: target.to_string(),
                    message,
                })?;
                Ok(TargetOptions::DevServer(parsed))
            }
            Executor::Command => {
                let parsed: CommandOptions =
                    toml::Value::Table(options).try_into().map_err(schema_err)?;
                Ok(TargetOptions::Command(parsed))
            }
        }
    }
}

/// Validated options, tagged by executor kind.
#[derive(Debug, Clone)]
pub enum TargetOptions {
    DevServer(DevServerOptions),
    Command(CommandOptions),
}

/// A target found in the registry with its options merged, not yet validated.
#[derive(Debug, Clone)]
pub struct ResolvedTarget {
    pub spec: TargetSpec,
    pub executor: Executor,
    pub cmd: String,
    pub cwd: Option<String>,
    pub env: HashMap<String, String>,
    pub options: toml::Table,
}

/// A target whose options passed validation and whose command is rendered.
#[derive(Debug, Clone)]
pub struct ValidatedTarget {
    pub spec: TargetSpec,
    pub program: String,
    pub args: Vec<String>,
    pub cwd: Option<String>,
    pub env: HashMap<String, String>,
    pub options: TargetOptions,
}

impl ValidatedTarget {
    /// Server settings, for targets that serve something.
    pub fn server(&self) -> Option<ServerOptions> {
        match &self.options {
            TargetOptions::DevServer(options) => Some(options.server()),
            TargetOptions::Command(_) => None,
        }
    }

    pub fn watch(&self) -> WatchSettings {
        match &self.options {
            TargetOptions::DevServer(options) => options.watch_settings(),
            TargetOptions::Command(options) => options.watch_settings(),
        }
    }

    pub fn ready_check(&self) -> ReadinessCheck {
        match &self.options {
            TargetOptions::DevServer(options) => options.ready_check.clone(),
            TargetOptions::Command(_) => ReadinessCheck::Started,
        }
    }

    pub fn ready_timeout(&self) -> Duration {
        match &self.options {
            TargetOptions::DevServer(options) => options.ready_timeout(),
            TargetOptions::Command(_) => Duration::ZERO,
        }
    }
}

/// Maps `project:target` keys to their configuration.
#[derive(Debug, Clone, Default)]
pub struct TargetRegistry {
    targets: BTreeMap<String, TargetConfig>,
}

impl TargetRegistry {
    pub fn new(targets: BTreeMap<String, TargetConfig>) -> Self {
        Self { targets }
    }

    pub fn targets(&self) -> impl Iterator<Item = (&String, &TargetConfig)> {
        self.targets.iter()
    }

    /// Looks up a target and merges the requested configuration over its options.
    pub fn resolve(&self, spec: &TargetSpec) -> Result<ResolvedTarget, ResolveError> {
        let key = spec.key();
        let config = self
            .targets
            .get(&key)
            .ok_or_else(|| ResolveError::UnknownTarget { key: key.clone() })?;

        let mut options = config.options.clone();
        if let Some(name) = &spec.configuration {
            let overrides = config.configurations.get(name).ok_or_else(|| {
                ResolveError::UnknownConfiguration {
                    key: key.clone(),
                    configuration: name.clone(),
                }
            })?;
            for (k, v) in overrides {
                options.insert(k.clone(), v.clone());
            }
        }

        Ok(ResolvedTarget {
            spec: spec.clone(),
            executor: config.executor,
            cmd: config.cmd.clone(),
            cwd: config.cwd.clone(),
            env: config.env.clone().unwrap_or_default(),
            options,
        })
    }

    /// Checks the merged options against the executor's schema and renders
    /// the command line. `watch` overrides the target's own watch option.
    pub fn validate(
        &self,
        resolved: ResolvedTarget,
        watch: bool,
    ) -> Result<ValidatedTarget, ValidationError> {
        let label = resolved.spec.to_string();
        let options = resolved
            .executor
            .validate(&label, resolved.options, watch)?;

        let vars = template_vars(&resolved.spec, &options);
        let parts = shell_words::split(&resolved.cmd).map_err(|err| {
            ValidationError::Command {
                target: label.clone(),
                message: err.to_string(),
            }
        })?;
        if parts.is_empty() {
            return Err(ValidationError::Command {
                target: label,
                message: "command is empty".to_string(),
            });
        }
        let parts: Vec<String> = parts
            .into_iter()
            .map(|part| render_template(&part, &vars))
            .collect();
        let program = parts[0].clone();
        let args = parts[1..].to_vec();

        Ok(ValidatedTarget {
            spec: resolved.spec,
            program,
            args,
            cwd: resolved.cwd,
            env: resolved.env,
            options,
        })
    }
}

fn template_vars(spec: &TargetSpec, options: &TargetOptions) -> Vec<(&'static str, String)> {
    let mut vars = vec![
        ("project", spec.project.clone()),
        ("target", spec.target.clone()),
        ("configuration", spec.configuration.clone().unwrap_or_default()),
    ];
    match options {
        TargetOptions::DevServer(options) => {
            vars.push(("host", options.host.clone()));
            vars.push(("port", options.port.to_string()));
            vars.push(("ssl", options.ssl.to_string()));
            vars.push(("public_host", options.public_host.clone().unwrap_or_default()));
            vars.push(("watch", options.watch.to_string()));
        }
        TargetOptions::Command(options) => {
            vars.push(("watch", options.watch.to_string()));
        }
    }
    vars
}

fn render_template(template: &str, vars: &[(&str, String)]) -> String {
    let mut out = template.to_string();
    for (name, value) in vars {
        out = out.replace(&format!("{{{}}}", name), value);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registry() -> TargetRegistry {
        let raw = r#"
[targets."app:serve"]
executor = "dev-server"
cmd = "npx vite --host {host} --port {port} --watch={watch}"
env = { NODE_ENV = "development" }

[targets."app:serve".options]
host = "0.0.0.0"
port = 4200
watch = true

[targets."app:serve".configurations.production]
port = 4300
ssl = true

[targets."app:serve".configurations.broken]
port = "not-a-port"

[targets."app:build"]
executor = "command"
cmd = "npx vite build --mode {configuration}"

[targets."app:empty"]
executor = "command"
cmd = "  "
"#;
        let config: crate::config::Config = toml::from_str(raw).unwrap();
        TargetRegistry::new(config.targets)
    }

    fn spec(raw: &str) -> TargetSpec {
        raw.parse().unwrap()
    }

    #[test]
    fn resolve_merges_configuration_over_options() {
        let resolved = registry().resolve(&spec("app:serve:production")).unwrap();
        assert_eq!(resolved.executor, Executor::DevServer);
        assert_eq!(resolved.options["port"].as_integer(), Some(4300));
        assert_eq!(resolved.options["ssl"].as_bool(), Some(true));
        assert_eq!(resolved.options["host"].as_str(), Some("0.0.0.0"));
        assert_eq!(resolved.env["NODE_ENV"], "development");
    }

    #[test]
    fn resolve_rejects_unknown_targets_and_configurations() {
        let registry = registry();
        assert!(matches!(
            registry.resolve(&spec("web:serve")),
            Err(ResolveError::UnknownTarget { .. })
        ));
        assert!(matches!(
            registry.resolve(&spec("app:serve:staging")),
            Err(ResolveError::UnknownConfiguration { .. })
        ));
    }

    #[test]
    fn validate_forces_watch_off_and_renders_command() {
        let registry = registry();
        let resolved = registry.resolve(&spec("app:serve")).unwrap();
        let validated = registry.validate(resolved, false).unwrap();
        assert!(!validated.watch().enabled);
        assert_eq!(validated.program, "npx");
        assert_eq!(
            validated.args,
            vec!["vite", "--host", "0.0.0.0", "--port", "4200", "--watch=false"]
        );
        let server = validated.server().unwrap();
        assert_eq!(server.host, "0.0.0.0");
        assert_eq!(server.port, 4200);
    }

    #[test]
    fn validate_keeps_watch_when_requested() {
        let registry = registry();
        let resolved = registry.resolve(&spec("app:build:production")).unwrap_err();
        assert!(matches!(resolved, ResolveError::UnknownConfiguration { .. }));

        let resolved = registry.resolve(&spec("app:build")).unwrap();
        let validated = registry.validate(resolved, true).unwrap();
        assert!(validated.watch().enabled);
        assert!(validated.server().is_none());
        assert_eq!(validated.args, vec!["vite", "build", "--mode", ""]);
    }

    #[test]
    fn validate_reports_schema_errors() {
        let registry = registry();
        let resolved = registry.resolve(&spec("app:serve:broken")).unwrap();
        let err = registry.validate(resolved, false).unwrap_err();
        assert!(matches!(err, ValidationError::Schema { .. }));
        assert!(err.to_string().contains("app:serve:broken"));
    }

    #[test]
    fn validate_rejects_empty_commands() {
        let registry = registry();
        let resolved = registry.resolve(&spec("app:empty")).unwrap();
        let err = registry.validate(resolved, false).unwrap_err();
        assert!(matches!(err, ValidationError::Command { .. }));
    }
}
