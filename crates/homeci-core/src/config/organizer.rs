//! Config file ownership and live reload.
//!
//! The organizer keeps the last-known-good [`ConfigSnapshot`]. A reload that
//! fails to read or parse leaves that snapshot in place and notifies nobody;
//! a successful reload swaps the snapshot and then calls every listener.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};

use notify::{EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::{ConfigError, ConfigSnapshot};

/// Used when no path is given on the command line.
pub const DEFAULT_CONFIG_PATH: &str = "./config.yaml";

/// Zero-argument callback fired after a successful reload.
pub type ChangeListener = Arc<dyn Fn() + Send + Sync>;

struct Shared {
    path: PathBuf,
    current: watch::Sender<Arc<ConfigSnapshot>>,
    listeners: Mutex<Vec<ChangeListener>>,
}

impl Shared {
    fn reload(&self) -> Result<Arc<ConfigSnapshot>, ConfigError> {
        let snapshot = Arc::new(ConfigSnapshot::load(&self.path)?);
        self.current.send_replace(Arc::clone(&snapshot));

        let listeners = self
            .listeners
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        for listener in listeners {
            listener();
        }
        Ok(snapshot)
    }
}

/// Owns the config file, its current snapshot and its watcher.
pub struct ConfigOrganizer {
    shared: Arc<Shared>,
    watcher: Option<RecommendedWatcher>,
    watch_task: Option<JoinHandle<()>>,
}

impl ConfigOrganizer {
    /// Load the file at `path` (or [`DEFAULT_CONFIG_PATH`]). Fails if the
    /// initial snapshot cannot be read or parsed.
    pub fn open(path: Option<PathBuf>) -> Result<Self, ConfigError> {
        let path = path.unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_PATH));
        let snapshot = ConfigSnapshot::load(&path)?;
        info!(path = %path.display(), repositories = snapshot.repositories.len(), "Config loaded");

        let (current, _) = watch::channel(Arc::new(snapshot));
        Ok(Self {
            shared: Arc::new(Shared {
                path,
                current,
                listeners: Mutex::new(Vec::new()),
            }),
            watcher: None,
            watch_task: None,
        })
    }

    pub fn path(&self) -> &Path {
        &self.shared.path
    }

    /// Last-known-good snapshot.
    pub fn current(&self) -> Arc<ConfigSnapshot> {
        Arc::clone(&self.shared.current.borrow())
    }

    /// Receiver that observes every successfully reloaded snapshot.
    pub fn subscribe(&self) -> watch::Receiver<Arc<ConfigSnapshot>> {
        self.shared.current.subscribe()
    }

    /// Register a callback fired after every successful reload.
    pub fn add_change_listener(&self, listener: impl Fn() + Send + Sync + 'static) {
        self.shared
            .listeners
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(Arc::new(listener));
    }

    /// Re-read the file now. On failure the previous snapshot stays current.
    pub fn reload(&self) -> Result<Arc<ConfigSnapshot>, ConfigError> {
        self.shared.reload()
    }

    /// Start watching the config file; changes trigger [`Self::reload`].
    ///
    /// The parent directory is watched so that editors which replace the file
    /// (write to temp, rename) are still observed. Must be called inside a
    /// Tokio runtime.
    pub fn watch(&mut self) -> Result<(), ConfigError> {
        if self.watcher.is_some() {
            return Ok(());
        }

        let file_name = self.shared.path.file_name().map(|n| n.to_os_string());
        let (tx, mut rx) = mpsc::unbounded_channel::<()>();

        let mut watcher = notify::recommended_watcher(move |res: notify::Result<notify::Event>| {
            match res {
                Ok(event) => {
                    let relevant = matches!(event.kind, EventKind::Modify(_) | EventKind::Create(_))
                        && event
                            .paths
                            .iter()
                            .any(|p| p.file_name().map(|n| n.to_os_string()) == file_name);
                    if relevant {
                        let _ = tx.send(());
                    }
                }
                Err(e) => warn!(error = %e, "Config watcher reported an error"),
            }
        })?;

        let watch_dir = match self.shared.path.parent() {
            Some(dir) if !dir.as_os_str().is_empty() => dir.to_path_buf(),
            _ => PathBuf::from("."),
        };
        watcher.watch(&watch_dir, RecursiveMode::NonRecursive)?;

        let shared = Arc::clone(&self.shared);
        let task = tokio::spawn(async move {
            while rx.recv().await.is_some() {
                // Collapse bursts of events from a single save.
                while rx.try_recv().is_ok() {}

                let reloading = Arc::clone(&shared);
                match tokio::task::spawn_blocking(move || reloading.reload()).await {
                    Ok(Ok(snapshot)) => info!(
                        path = %shared.path.display(),
                        repositories = snapshot.repositories.len(),
                        "Config reloaded"
                    ),
                    Ok(Err(e)) => error!(
                        path = %shared.path.display(),
                        error = %e,
                        "Config reload failed, keeping last good config"
                    ),
                    Err(e) => error!(error = %e, "Config reload task failed"),
                }
            }
            debug!("Config watch task stopped");
        });

        info!(path = %self.shared.path.display(), "Watching config file");
        self.watcher = Some(watcher);
        self.watch_task = Some(task);
        Ok(())
    }

    /// Stop watching. Listeners stay registered; `reload` still works.
    pub fn close(&mut self) {
        // Dropping the watcher drops its sender, which ends the task.
        self.watcher = None;
        if let Some(task) = self.watch_task.take() {
            task.abort();
        }
    }
}

impl Drop for ConfigOrganizer {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    const V1: &str = "bufferDirectory: /tmp/v1\n";
    const V2: &str = "bufferDirectory: /tmp/v2\n";

    fn write_config(dir: &tempfile::TempDir, body: &str) -> PathBuf {
        let path = dir.path().join("config.yaml");
        std::fs::write(&path, body).unwrap();
        path
    }

    #[test]
    fn open_fails_for_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let err = ConfigOrganizer::open(Some(dir.path().join("absent.yaml")));
        assert!(matches!(err, Err(ConfigError::Io { .. })));
    }

    #[test]
    fn open_fails_for_invalid_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_config(&dir, "bufferDirectory: [");
        assert!(matches!(
            ConfigOrganizer::open(Some(path)),
            Err(ConfigError::Parse(_))
        ));
    }

    #[test]
    fn successful_reload_swaps_snapshot_and_fires_listeners() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_config(&dir, V1);
        let organizer = ConfigOrganizer::open(Some(path.clone())).unwrap();

        let fired = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&fired);
        organizer.add_change_listener(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        std::fs::write(&path, V2).unwrap();
        let snapshot = organizer.reload().unwrap();

        assert_eq!(snapshot.buffer_directory, PathBuf::from("/tmp/v2"));
        assert_eq!(organizer.current().buffer_directory, PathBuf::from("/tmp/v2"));
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn failed_reload_keeps_last_good_snapshot_and_stays_silent() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_config(&dir, V1);
        let organizer = ConfigOrganizer::open(Some(path.clone())).unwrap();

        let fired = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&fired);
        organizer.add_change_listener(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        std::fs::write(&path, "bufferDirectory: [").unwrap();
        assert!(organizer.reload().is_err());

        assert_eq!(organizer.current().buffer_directory, PathBuf::from("/tmp/v1"));
        assert_eq!(fired.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn subscribers_observe_reloads() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_config(&dir, V1);
        let organizer = ConfigOrganizer::open(Some(path.clone())).unwrap();
        let mut rx = organizer.subscribe();

        std::fs::write(&path, V2).unwrap();
        organizer.reload().unwrap();

        assert!(rx.has_changed().unwrap());
        assert_eq!(
            rx.borrow_and_update().buffer_directory,
            PathBuf::from("/tmp/v2")
        );
    }

    #[tokio::test]
    async fn watched_file_change_reloads_snapshot() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_config(&dir, V1);
        let mut organizer = ConfigOrganizer::open(Some(path.clone())).unwrap();

        let fired = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&fired);
        organizer.add_change_listener(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        organizer.watch().unwrap();

        std::fs::write(&path, V2).unwrap();
        let deadline = tokio::time::Instant::now() + std::time::Duration::from_secs(5);
        while organizer.current().buffer_directory != PathBuf::from("/tmp/v2") {
            assert!(
                tokio::time::Instant::now() < deadline,
                "watcher never picked up the change"
            );
            tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        }
        assert!(fired.load(Ordering::SeqCst) >= 1);
        organizer.close();
    }

    #[tokio::test]
    async fn watch_and_close_are_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_config(&dir, V1);
        let mut organizer = ConfigOrganizer::open(Some(path)).unwrap();

        organizer.watch().unwrap();
        organizer.watch().unwrap();
        organizer.close();
        organizer.close();
    }
}
