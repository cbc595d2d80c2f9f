//! `testrack init`: writes a starter configuration for a project.

use std::collections::BTreeMap;
use std::path::Path;

use anyhow::{bail, Result};

use crate::config::{self, Config, E2eConfig, RunnerConfig, TargetConfig};
use crate::registry::Executor;

/// Builds the starter configuration for `project`.
pub fn starter_config(project: &str) -> Config {
    let serve_key = format!("{}:serve", project);

    let mut options = toml::Table::new();
    options.insert("host".to_string(), toml::Value::String("localhost".to_string()));
    options.insert("port".to_string(), toml::Value::Integer(4200));
    options.insert("ready_check".to_string(), toml::Value::String("tcp".to_string()));

    let mut production = toml::Table::new();
    production.insert("port".to_string(), toml::Value::Integer(4300));

    let mut targets = BTreeMap::new();
    targets.insert(
        serve_key.clone(),
        TargetConfig {
            executor: Executor::DevServer,
            cmd: "npm run start -- --host {host} --port {port}".to_string(),
            cwd: Some(format!("apps/{}", project)),
            env: None,
            options,
            configurations: BTreeMap::from([("production".to_string(), production)]),
        },
    );

    Config {
        e2e: E2eConfig {
            dev_server_target: Some(serve_key),
            base_url: None,
            watch: Some(false),
        },
        runner: RunnerConfig {
            src: Some(format!("apps/{}-e2e/src/**/*.spec.ts", project)),
            browsers: vec!["chrome:headless".to_string()],
            ..RunnerConfig::default()
        },
        targets,
    }
}

/// Writes the starter configuration to `path`.
pub fn init(path: &Path, project: &str, force: bool) -> Result<()> {
    if project.trim().is_empty() || project.contains(':') {
        bail!("invalid project name \"{}\" (must be non-empty and contain no ':')", project);
    }
    if path.exists() && !force {
        bail!("{} already exists (use --force to overwrite)", path.display());
    }
    config::write_config(path, &starter_config(project))?;
    tracing::info!(path = %path.display(), project, "wrote starter configuration");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::TargetRegistry;

    #[test]
    fn starter_config_round_trips_and_validates() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(config::CONFIG_FILE);
        init(&path, "shop", false).unwrap();

        let loaded = config::load_config(&path).unwrap();
        assert_eq!(loaded.e2e.dev_server_target.as_deref(), Some("shop:serve"));
        assert_eq!(loaded.runner.browsers, vec!["chrome:headless"]);

        let registry = TargetRegistry::new(loaded.targets);
        let resolved = registry
            .resolve(&"shop:serve:production".parse().unwrap())
            .unwrap();
        let validated = registry.validate(resolved, false).unwrap();
        assert_eq!(validated.server().unwrap().port, 4300);
        assert_eq!(validated.program, "npm");
    }

    #[test]
    fn refuses_to_overwrite_without_force() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(config::CONFIG_FILE);
        std::fs::write(&path, "# existing\n").unwrap();

        let err = init(&path, "shop", false).unwrap_err();
        assert!(err.to_string().contains("already exists"));
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "# existing\n");

        init(&path, "shop", true).unwrap();
        assert!(config::load_config(&path).is_ok());
    }

    #[test]
    fn rejects_invalid_project_names() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(config::CONFIG_FILE);
        assert!(init(&path, "", false).is_err());
        assert!(init(&path, "a:b", false).is_err());
        assert!(!path.exists());
    }
}
