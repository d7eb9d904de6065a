//! Config hot-reload watcher.
//!
//! Watches `workforge.toml` and hands every successfully parsed and
//! validated [`AppConfig`] to a callback after a debounce window.

use crate::app_config::AppConfig;
use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use std::path::{Path, PathBuf};
use std::sync::mpsc as std_mpsc;
use std::sync::Arc;
use tracing::{debug, info, warn};
use workforge_core::{WorkforgeError, WorkforgeResult};
use workforge_orchestrator::Orchestrator;

/// Keeps the file watch alive; dropping it stops reloading.
pub struct ConfigWatcher {
    _watcher: RecommendedWatcher,
}

impl ConfigWatcher {
    /// Start watching `config_path`.
    ///
    /// `on_reload` runs on a background thread. A file that fails to parse or
    /// validate is logged and skipped, so the last good configuration stays
    /// in force.
    pub fn start<F>(config_path: PathBuf, debounce_ms: u64, on_reload: F) -> WorkforgeResult<Self>
    where
        F: Fn(AppConfig) + Send + Sync + 'static,
    {
        let (tx, rx) = std_mpsc::channel();

        let mut watcher = notify::recommended_watcher(move |res: Result<Event, notify::Error>| {
            if let Ok(event) = res {
                // Editors that save by rename show up as Create.
                if matches!(event.kind, EventKind::Modify(_) | EventKind::Create(_)) {
                    let _ = tx.send(());
                }
            }
        })
        .map_err(|e| WorkforgeError::Config(format!("Failed to create file watcher: {e}")))?;

        watcher
            .watch(config_path.as_ref(), RecursiveMode::NonRecursive)
            .map_err(|e| WorkforgeError::Config(format!("Failed to watch config file: {e}")))?;

        let path = config_path.clone();
        std::thread::spawn(move || {
            let debounce = std::time::Duration::from_millis(debounce_ms);

            while rx.recv().is_ok() {
                // Let the burst of writes finish, then reload once.
                std::thread::sleep(debounce);
                while rx.try_recv().is_ok() {}

                match AppConfig::load(&path) {
                    Ok(config) => on_reload(config),
                    Err(e) => warn!(error = %e, "Ignoring invalid config reload"),
                }
            }

            debug!("Config watcher thread exiting");
        });

        info!(path = %config_path.display(), "Config hot-reload watcher started");

        Ok(Self { _watcher: watcher })
    }
}

/// Watch `path` and apply every valid change to `orchestrator`.
pub fn watch_and_apply(
    path: &Path,
    debounce_ms: u64,
    orchestrator: Arc<Orchestrator>,
) -> WorkforgeResult<ConfigWatcher> {
    let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel::<AppConfig>();
    tokio::spawn(async move {
        while let Some(config) = rx.recv().await {
            if let Err(e) = orchestrator.apply_config(config.orchestrator).await {
                warn!(error = %e, "Reloaded config rejected");
            }
        }
    });
    ConfigWatcher::start(path.to_path_buf(), debounce_ms, move |config| {
        let _ = tx.send(config);
    })
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use std::io::Write;
    use std::time::Duration;

    const BASE: &str = r#"
[limits]
concurrency_ceiling = 2

[[roles.executor.providers]]
name = "local"
kind = "ollama"
model = "qwen2.5-coder"

[[roles.tester.providers]]
name = "local"
kind = "ollama"
model = "qwen2.5-coder"

[[roles.documenter.providers]]
name = "local"
kind = "ollama"
model = "llama3"
"#;

    fn write_config(path: &Path, body: &str) {
        let mut file = std::fs::File::create(path).unwrap();
        file.write_all(body.as_bytes()).unwrap();
        file.sync_all().unwrap();
    }

    #[test]
    fn test_start_fails_for_missing_file() {
        let result = ConfigWatcher::start(PathBuf::from("/nonexistent/workforge.toml"), 10, |_| {});
        let err = result.err().unwrap();
        assert!(err.to_string().contains("Failed to watch config file"));
    }

    #[test]
    fn test_change_triggers_reload_and_invalid_is_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("workforge.toml");
        write_config(&path, BASE);

        let (tx, rx) = std_mpsc::channel();
        let _watcher = ConfigWatcher::start(path.clone(), 50, move |config| {
            let _ = tx.send(config.orchestrator.limits.concurrency_ceiling);
        })
        .unwrap();

        write_config(&path, &BASE.replace("concurrency_ceiling = 2", "concurrency_ceiling = 0"));
        assert!(rx.recv_timeout(Duration::from_millis(600)).is_err());

        write_config(&path, &BASE.replace("concurrency_ceiling = 2", "concurrency_ceiling = 5"));
        let ceiling = rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(ceiling, 5);
    }
}
