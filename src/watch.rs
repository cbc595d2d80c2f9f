//! File watching for targets running in watch mode.
//!
//! A watcher thread monitors a target's `watch_paths` and sends a rebuild
//! trigger whenever a relevant change settles. It supports debouncing and
//! ignoring files based on glob patterns and `.gitignore`.

use std::path::{Path, PathBuf};
use std::sync::mpsc::RecvTimeoutError;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use globset::{Glob, GlobSet, GlobSetBuilder};
use ignore::gitignore::{Gitignore, GitignoreBuilder};
use notify::{Event as NotifyEvent, RecommendedWatcher, RecursiveMode, Watcher};
use tokio::sync::mpsc;

use crate::options::WatchSettings;

/// Spawns a watcher thread for `settings` and returns its trigger channel.
///
/// The channel closes when the watcher stops (or could not start), and
/// immediately when there is nothing to watch.
pub fn spawn_watcher(label: String, cwd: Option<&str>, settings: &WatchSettings) -> mpsc::Receiver<()> {
    let (tx, rx) = mpsc::channel(1);
    if settings.paths.is_empty() {
        return rx;
    }
    let base = cwd.map(PathBuf::from);
    let settings = settings.clone();
    std::thread::spawn(move || {
        if let Err(err) = watch_paths(base, &settings, tx) {
            tracing::warn!(target_name = %label, "watcher failed: {:#}", err);
        }
    });
    rx
}

fn watch_paths(base: Option<PathBuf>, settings: &WatchSettings, tx: mpsc::Sender<()>) -> Result<()> {
    let base = match base {
        Some(base) => base,
        None => std::env::current_dir().context("failed to resolve current dir")?,
    };
    let watch_paths = resolve_watch_paths(&base, &settings.paths);
    let matcher = IgnoreMatcher::new(&base, &settings.ignore, settings.ignore_gitignore)?;

    let (raw_tx, raw_rx) = std::sync::mpsc::channel();
    let mut watcher = RecommendedWatcher::new(
        move |res| {
            let _ = raw_tx.send(res);
        },
        notify::Config::default(),
    )
    .context("failed to create watcher")?;

    for path in &watch_paths {
        watcher
            .watch(path, RecursiveMode::Recursive)
            .with_context(|| format!("failed to watch {}", path.display()))?;
    }

    let debounce = Duration::from_millis(settings.debounce_ms.max(50));
    loop {
        let event = match raw_rx.recv() {
            Ok(res) => res,
            Err(_) => break,
        };
        if !is_relevant(&event, &matcher) {
            continue;
        }

        let mut last = Instant::now();
        loop {
            let elapsed = last.elapsed();
            if elapsed >= debounce {
                break;
            }
            match raw_rx.recv_timeout(debounce - elapsed) {
                Ok(res) => {
                    if is_relevant(&res, &matcher) {
                        last = Instant::now();
                    }
                }
                Err(RecvTimeoutError::Timeout) => break,
                Err(RecvTimeoutError::Disconnected) => return Ok(()),
            }
        }

        // A full channel already holds a pending trigger.
        match tx.try_send(()) {
            Ok(()) | Err(mpsc::error::TrySendError::Full(())) => {}
            Err(mpsc::error::TrySendError::Closed(())) => break,
        }
    }

    Ok(())
}

fn resolve_watch_paths(base: &Path, paths: &[String]) -> Vec<PathBuf> {
    paths
        .iter()
        .map(|path| {
            let path_buf = PathBuf::from(path);
            if path_buf.is_absolute() {
                path_buf
            } else {
                base.join(path_buf)
            }
        })
        .collect()
}

fn is_relevant(event: &notify::Result<NotifyEvent>, matcher: &IgnoreMatcher) -> bool {
    let Ok(event) = event else {
        return true;
    };
    if event.paths.is_empty() {
        return true;
    }
    event.paths.iter().any(|path| !matcher.is_ignored(path))
}

struct IgnoreMatcher {
    // Combines explicit ignore globs with optional gitignore rules.
    base: PathBuf,
    globset: Option<GlobSet>,
    gitignore: Option<Gitignore>,
}

impl IgnoreMatcher {
    fn new(base: &Path, patterns: &[String], ignore_gitignore: bool) -> Result<Self> {
        let globset = if patterns.is_empty() {
            None
        } else {
            let mut builder = GlobSetBuilder::new();
            for pattern in patterns {
                for expanded in expand_pattern(pattern) {
                    builder.add(Glob::new(&expanded)?);
                }
            }
            Some(builder.build()?)
        };

        let gitignore = if ignore_gitignore {
            None
        } else {
            Some(build_gitignore(base)?)
        };

        Ok(Self {
            base: base.to_path_buf(),
            globset,
            gitignore,
        })
    }

    fn is_ignored(&self, path: &Path) -> bool {
        if let Some(globset) = &self.globset {
            if globset.is_match(path) {
                return true;
            }
            if let Ok(relative) = path.strip_prefix(&self.base) {
                if globset.is_match(relative) {
                    return true;
                }
            }
        }
        if let Some(gitignore) = &self.gitignore {
            if gitignore.matched(path, path.is_dir()).is_ignore() {
                return true;
            }
        }
        false
    }
}

fn expand_pattern(pattern: &str) -> Vec<String> {
    let trimmed = pattern.trim_end_matches('/');
    let has_glob = pattern.contains('*') || pattern.contains('?') || pattern.contains('[');
    if has_glob {
        vec![pattern.to_string()]
    } else {
        vec![trimmed.to_string(), format!("{}/**", trimmed)]
    }
}

fn build_gitignore(base: &Path) -> Result<Gitignore> {
    let mut builder = GitignoreBuilder::new(base);
    for ancestor in base.ancestors() {
        let path = ancestor.join(".gitignore");
        if path.exists() {
            builder.add(path);
        }
        let exclude = ancestor.join(".git").join("info").join("exclude");
        if exclude.exists() {
            builder.add(exclude);
        }
    }
    Ok(builder.build()?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolve_watch_paths_handles_absolute_and_relative() {
        let base = Path::new("/tmp/testrack-tests");
        let paths = vec!["src".to_string(), "/var/log".to_string()];
        let resolved = resolve_watch_paths(base, &paths);
        assert_eq!(resolved[0], base.join("src"));
        assert_eq!(resolved[1], PathBuf::from("/var/log"));
    }

    #[test]
    fn expand_pattern_adds_recursive_glob_for_dirs() {
        assert_eq!(expand_pattern("dist/"), vec!["dist".to_string(), "dist/**".to_string()]);
        assert_eq!(expand_pattern("*.map"), vec!["*.map".to_string()]);
    }

    #[test]
    fn ignore_matcher_respects_globs() {
        let base = Path::new("/tmp/testrack-tests");
        let matcher = IgnoreMatcher::new(base, &["dist".to_string()], true).unwrap();
        assert!(matcher.is_ignored(&base.join("dist")));
        assert!(matcher.is_ignored(&base.join("dist/main.js")));
        assert!(!matcher.is_ignored(&base.join("src/app.ts")));
    }

    #[tokio::test]
    async fn empty_watch_list_closes_immediately() {
        let settings = WatchSettings {
            enabled: true,
            ..WatchSettings::default()
        };
        let mut rx = spawn_watcher("app:build".to_string(), None, &settings);
        assert_eq!(rx.recv().await, None);
    }
}
