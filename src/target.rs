//! Target specifications.
//!
//! A target is addressed as `project:target[:configuration]`, the same string
//! users put in `testrack.toml` and pass to `--dev-server-target`.

use std::fmt;
use std::str::FromStr;

use crate::error::ResolveError;

/// A parsed `project:target[:configuration]` string.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TargetSpec {
    /// Project that owns the target.
    pub project: String,
    /// Target name within the project (e.g. `serve`).
    pub target: String,
    /// Optional named configuration (e.g. `production`).
    pub configuration: Option<String>,
}

impl TargetSpec {
    /// Key used for the target in the registry, without the configuration.
    pub fn key(&self) -> String {
        format!("{}:{}", self.project, self.target)
    }
}

impl FromStr for TargetSpec {
    type Err = ResolveError;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        let unresolvable = || ResolveError::Unresolvable {
            spec: raw.to_string(),
        };
        let parts: Vec<&str> = raw.trim().split(':').collect();
        if parts.len() > 3 {
            return Err(unresolvable());
        }
        let project = parts.first().copied().unwrap_or_default();
        let target = parts.get(1).copied().unwrap_or_default();
        if project.is_empty() || target.is_empty() {
            return Err(unresolvable());
        }
        let configuration = parts
            .get(2)
            .filter(|value| !value.is_empty())
            .map(|value| value.to_string());
        Ok(Self {
            project: project.to_string(),
            target: target.to_string(),
            configuration,
        })
    }
}

impl fmt::Display for TargetSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.configuration {
            Some(configuration) => write!(f, "{}:{}:{}", self.project, self.target, configuration),
            None => write!(f, "{}:{}", self.project, self.target),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_all_three_segments() {
        let spec: TargetSpec = "app:serve:production".parse().unwrap();
        assert_eq!(spec.project, "app");
        assert_eq!(spec.target, "serve");
        assert_eq!(spec.configuration.as_deref(), Some("production"));
        assert_eq!(spec.key(), "app:serve");
    }

    #[test]
    fn configuration_is_optional() {
        let spec: TargetSpec = "app:serve".parse().unwrap();
        assert_eq!(spec.configuration, None);

        let empty: TargetSpec = "app:serve:".parse().unwrap();
        assert_eq!(empty.configuration, None);
        assert_eq!(empty.to_string(), "app:serve");
    }

    #[test]
    fn rejects_missing_segments() {
        for raw in ["app", "app:", ":serve", "", "a:b:c:d"] {
            let err = raw.parse::<TargetSpec>().unwrap_err();
            assert!(
                matches!(err, ResolveError::Unresolvable { .. }),
                "{raw} should be unresolvable"
            );
        }
    }
}
