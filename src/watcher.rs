//! Filesystem watcher driving config hot reload.
//!
//! The watcher observes the *directory* containing the config file, not the
//! file itself, so atomic-replace edits (editors, Kubernetes projected
//! volumes) are seen. Events are filtered to those naming the config file or
//! resembling a symlink-indirection update (names beginning with `..`), then
//! debounced: editors and volume updates produce bursts, and one reload per
//! burst is enough.
//!
//! A reload that fails to parse or validate is logged and leaves the manager
//! state untouched.

use std::ffi::{OsStr, OsString};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher as _};
use tokio::sync::Mutex;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config;
use crate::error::{Error, Result};
use crate::manager::Manager;

/// Window for coalescing bursts of filesystem events into one reload.
const WATCH_DEBOUNCE: Duration = Duration::from_millis(150);

type EventResult = std::result::Result<Event, notify::Error>;

/// Watches the config file and reconciles the manager on changes.
pub struct ConfigWatcher {
    config_path: PathBuf,
    config_dir: PathBuf,
    config_name: OsString,
    manager: Arc<Manager>,
    fs_watcher: Mutex<Option<RecommendedWatcher>>,
    events: Mutex<Option<mpsc::UnboundedReceiver<EventResult>>>,
    cancel: CancellationToken,
}

impl std::fmt::Debug for ConfigWatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConfigWatcher")
            .field("config_path", &self.config_path)
            .finish_non_exhaustive()
    }
}

impl ConfigWatcher {
    /// Create a watcher bound to `config_path` and `manager`. The watcher is
    /// inert until [`ConfigWatcher::start`] is called.
    pub fn new(config_path: &Path, manager: Arc<Manager>) -> Result<Self> {
        let config_name = config_path
            .file_name()
            .ok_or_else(|| {
                Error::ConfigInvalid(format!(
                    "config path {} has no file name",
                    config_path.display()
                ))
            })?
            .to_os_string();
        let config_dir = match config_path.parent() {
            Some(dir) if !dir.as_os_str().is_empty() => dir.to_path_buf(),
            _ => PathBuf::from("."),
        };

        let (tx, rx) = mpsc::unbounded_channel();
        let fs_watcher = notify::recommended_watcher(move |event: EventResult| {
            let _ = tx.send(event);
        })?;

        Ok(Self {
            config_path: config_path.to_path_buf(),
            config_dir,
            config_name,
            manager,
            fs_watcher: Mutex::new(Some(fs_watcher)),
            events: Mutex::new(Some(rx)),
            cancel: CancellationToken::new(),
        })
    }

    /// Begin watching the config directory and spawn the reload task.
    pub async fn start(&self) -> Result<()> {
        {
            let mut watcher = self.fs_watcher.lock().await;
            let watcher = watcher
                .as_mut()
                .ok_or_else(|| Error::Watch(notify::Error::generic("watcher already stopped")))?;
            watcher.watch(&self.config_dir, RecursiveMode::NonRecursive)?;
        }

        let rx = self
            .events
            .lock()
            .await
            .take()
            .ok_or_else(|| Error::Watch(notify::Error::generic("watcher already started")))?;

        tokio::spawn(watch_loop(
            self.manager.clone(),
            self.config_path.clone(),
            self.config_name.clone(),
            rx,
            self.cancel.clone(),
        ));

        Ok(())
    }

    /// Stop watching and release the filesystem watcher.
    pub async fn stop(&self) {
        self.cancel.cancel();
        self.fs_watcher.lock().await.take();
    }
}

async fn watch_loop(
    manager: Arc<Manager>,
    config_path: PathBuf,
    config_name: OsString,
    mut rx: mpsc::UnboundedReceiver<EventResult>,
    cancel: CancellationToken,
) {
    loop {
        let event = tokio::select! {
            _ = cancel.cancelled() => return,
            event = rx.recv() => match event {
                Some(event) => event,
                None => return,
            },
        };

        let event = match event {
            Ok(event) => event,
            Err(e) => {
                warn!("watcher error: {}", e);
                continue;
            }
        };

        if !is_relevant(&event, &config_name) {
            continue;
        }
        debug!(?event, "config file event");

        // Coalesce the burst: every further event restarts the window.
        loop {
            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = tokio::time::sleep(WATCH_DEBOUNCE) => break,
                more = rx.recv() => match more {
                    Some(_) => continue,
                    None => break,
                },
            }
        }

        info!("config changed, reloading");
        reload(&manager, &config_path).await;
    }
}

/// Reload the config from disk and reconcile. Parse and validation failures
/// leave the manager untouched.
pub(crate) async fn reload(manager: &Arc<Manager>, config_path: &Path) {
    match config::load(config_path) {
        Ok(cfg) => {
            if let Err(e) = manager.reconcile(&cfg).await {
                error!("failed to reconcile: {}", e);
            }
        }
        Err(e) => {
            warn!("invalid config, keeping current state: {}", e);
        }
    }
}

/// A write or create event naming the config file, or a symlink-indirection
/// update (Kubernetes projected volumes swap a `..data` symlink).
fn is_relevant(event: &Event, config_name: &OsStr) -> bool {
    if !matches!(event.kind, EventKind::Create(_) | EventKind::Modify(_)) {
        return false;
    }

    event.paths.iter().any(|path| match path.file_name() {
        Some(name) if name == config_name => true,
        Some(name) => name.to_string_lossy().starts_with(".."),
        None => false,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SshConfig;
    use notify::event::{CreateKind, DataChange, ModifyKind, RemoveKind};
    use std::io::Write;

    fn unreachable_manager() -> Arc<Manager> {
        // Port 1 is essentially never listening; reconcile's start attempts
        // fail fast and are logged, which is all these tests need.
        Manager::new(SshConfig {
            host: "127.0.0.1".to_string(),
            port: 1,
            user: "test".to_string(),
            password: Some("test".to_string()),
            max_retries: 0,
            retry_delay: Duration::from_millis(10),
            connect_timeout: Some(Duration::from_secs(2)),
            ..SshConfig::default()
        })
    }

    const VALID_YAML: &str = r#"
ssh:
  host: 127.0.0.1
  port: 1
  user: test
  password: test
  maxRetries: 0
  retryDelay: 10ms
tunnels:
  - name: db
    remoteHost: db.internal
    remotePort: 5432
    localPort: 15432
"#;

    mod relevance {
        use super::*;

        fn modify_event(path: &str) -> Event {
            Event::new(EventKind::Modify(ModifyKind::Data(DataChange::Any)))
                .add_path(PathBuf::from(path))
        }

        #[test]
        fn test_modify_of_config_file_is_relevant() {
            let event = modify_event("/etc/conduit/config.yaml");
            assert!(is_relevant(&event, OsStr::new("config.yaml")));
        }

        #[test]
        fn test_create_of_config_file_is_relevant() {
            let event = Event::new(EventKind::Create(CreateKind::File))
                .add_path(PathBuf::from("/etc/conduit/config.yaml"));
            assert!(is_relevant(&event, OsStr::new("config.yaml")));
        }

        #[test]
        fn test_other_file_is_ignored() {
            let event = modify_event("/etc/conduit/other.yaml");
            assert!(!is_relevant(&event, OsStr::new("config.yaml")));
        }

        #[test]
        fn test_symlink_indirection_is_relevant() {
            let event = Event::new(EventKind::Create(CreateKind::Folder))
                .add_path(PathBuf::from("/etc/conduit/..2024_01_01_data"));
            assert!(is_relevant(&event, OsStr::new("config.yaml")));
        }

        #[test]
        fn test_remove_is_ignored() {
            let event = Event::new(EventKind::Remove(RemoveKind::File))
                .add_path(PathBuf::from("/etc/conduit/config.yaml"));
            assert!(!is_relevant(&event, OsStr::new("config.yaml")));
        }
    }

    mod reloading {
        use super::*;

        #[tokio::test]
        async fn test_valid_reload_reconciles() {
            let manager = unreachable_manager();
            let dir = tempfile::tempdir().expect("tempdir");
            let path = dir.path().join("config.yaml");
            std::fs::write(&path, VALID_YAML).expect("write config");

            reload(&manager, &path).await;

            assert_eq!(manager.list().await, vec!["db".to_string()]);
        }

        #[tokio::test]
        async fn test_invalid_reload_leaves_state_untouched() {
            let manager = unreachable_manager();
            let dir = tempfile::tempdir().expect("tempdir");
            let path = dir.path().join("config.yaml");
            std::fs::write(&path, VALID_YAML).expect("write config");
            reload(&manager, &path).await;

            // Empty tunnel list fails validation; the reload is ignored.
            std::fs::write(&path, "ssh:\n  host: x\n  user: y\n  password: z\ntunnels: []\n")
                .expect("write config");
            reload(&manager, &path).await;

            assert_eq!(manager.list().await, vec!["db".to_string()]);
        }

        #[tokio::test]
        async fn test_unparseable_reload_leaves_state_untouched() {
            let manager = unreachable_manager();
            let dir = tempfile::tempdir().expect("tempdir");
            let path = dir.path().join("config.yaml");
            std::fs::write(&path, VALID_YAML).expect("write config");
            reload(&manager, &path).await;

            std::fs::write(&path, "tunnels: [broken").expect("write config");
            reload(&manager, &path).await;

            assert_eq!(manager.list().await, vec!["db".to_string()]);
        }
    }

    mod watching {
        use super::*;

        #[tokio::test]
        async fn test_new_rejects_path_without_file_name() {
            let manager = unreachable_manager();
            let err = ConfigWatcher::new(Path::new("/"), manager).unwrap_err();
            assert!(matches!(err, Error::ConfigInvalid(_)));
        }

        #[tokio::test]
        async fn test_write_triggers_reconcile() {
            let manager = unreachable_manager();
            let dir = tempfile::tempdir().expect("tempdir");
            let path = dir.path().join("config.yaml");
            std::fs::write(&path, "tunnels: []\n").expect("seed config");

            let watcher = ConfigWatcher::new(&path, manager.clone()).expect("watcher");
            watcher.start().await.expect("start");

            {
                let mut file = std::fs::File::create(&path).expect("rewrite config");
                file.write_all(VALID_YAML.as_bytes()).expect("write");
            }

            // Debounce plus reconcile should land well within this bound.
            let deadline = tokio::time::Instant::now() + Duration::from_secs(3);
            loop {
                if manager.list().await == vec!["db".to_string()] {
                    break;
                }
                assert!(
                    tokio::time::Instant::now() < deadline,
                    "reconcile did not happen within the deadline"
                );
                tokio::time::sleep(Duration::from_millis(50)).await;
            }

            watcher.stop().await;
        }

        #[tokio::test]
        async fn test_start_twice_fails() {
            let manager = unreachable_manager();
            let dir = tempfile::tempdir().expect("tempdir");
            let path = dir.path().join("config.yaml");
            std::fs::write(&path, "tunnels: []\n").expect("seed config");

            let watcher = ConfigWatcher::new(&path, manager).expect("watcher");
            watcher.start().await.expect("first start");
            assert!(watcher.start().await.is_err());
            watcher.stop().await;
        }
    }
}
