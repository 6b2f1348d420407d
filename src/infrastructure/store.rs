//! Crash-safe persistent JSON store.
//!
//! Every persisted config is a single JSON document (an array for agents,
//! skills, rules, and history; an object for metrics) rewritten in full
//! on mutation via temp-file-plus-rename. Readers are tolerant: a missing
//! file yields the empty state, and unreadable or wrongly-shaped content
//! yields the empty state with a warning. A `.bak` sibling is written
//! before a non-empty document is replaced by an empty one, and consulted
//! on read where the caller opts in (the agent registry does).
//!
//! Each store can watch its file at directory level (catching atomic
//! temp+rename writes). Self-writes are suppressed by a one-second window
//! armed via [`JsonStore::mark_self_write`] just before the write;
//! external events are debounced 300 ms and then surfaced to the caller
//! for reload.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use notify::{RecommendedWatcher, RecursiveMode, Watcher};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// Error types for store operations.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("io error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("serialization failed for {path}: {source}")]
    Serialize {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("watch failed for {path}: {source}")]
    Watch {
        path: PathBuf,
        #[source]
        source: notify::Error,
    },
}

const SELF_WRITE_WINDOW: Duration = Duration::from_secs(1);
const EXTERNAL_DEBOUNCE: Duration = Duration::from_millis(300);

/// One persisted JSON document.
pub struct JsonStore {
    path: PathBuf,
    self_write_window: Duration,
    debounce: Duration,
    last_self_write: Mutex<Option<Instant>>,
}

impl JsonStore {
    pub fn new(path: impl Into<PathBuf>) -> Arc<Self> {
        Arc::new(Self {
            path: path.into(),
            self_write_window: SELF_WRITE_WINDOW,
            debounce: EXTERNAL_DEBOUNCE,
            last_self_write: Mutex::new(None),
        })
    }

    /// Shortened windows for tests.
    pub fn with_timing(path: impl Into<PathBuf>, self_write_window: Duration, debounce: Duration) -> Arc<Self> {
        Arc::new(Self {
            path: path.into(),
            self_write_window,
            debounce,
            last_self_write: Mutex::new(None),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn bak_path(&self) -> PathBuf {
        let mut name = self.path.as_os_str().to_owned();
        name.push(".bak");
        PathBuf::from(name)
    }

    /// Load an array document. Missing file, unreadable content, or a
    /// non-array shape all yield the empty collection.
    pub fn load_array<T: DeserializeOwned>(&self) -> Vec<T> {
        Self::read_array(&self.path)
    }

    /// Array load that consults the `.bak` sibling when the primary is
    /// missing or empty (the agents document's read policy).
    pub fn load_array_with_backup<T: DeserializeOwned>(&self) -> Vec<T> {
        let primary: Vec<T> = Self::read_array(&self.path);
        if !primary.is_empty() {
            return primary;
        }
        let backup = self.bak_path();
        if backup.exists() {
            let restored: Vec<T> = Self::read_array(&backup);
            if !restored.is_empty() {
                warn!(path = %self.path.display(), "primary document missing or empty, restored from .bak");
                return restored;
            }
        }
        primary
    }

    /// Load an object document; missing or malformed content yields empty.
    pub fn load_object(&self) -> serde_json::Map<String, serde_json::Value> {
        match std::fs::read_to_string(&self.path) {
            Ok(raw) => match serde_json::from_str::<serde_json::Value>(&raw) {
                Ok(serde_json::Value::Object(map)) => map,
                Ok(_) => {
                    warn!(path = %self.path.display(), "persisted document is not an object, treating as empty");
                    serde_json::Map::new()
                }
                Err(e) => {
                    warn!(path = %self.path.display(), error = %e, "failed to parse persisted document, treating as empty");
                    serde_json::Map::new()
                }
            },
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => serde_json::Map::new(),
            Err(e) => {
                warn!(path = %self.path.display(), error = %e, "failed to read persisted document, treating as empty");
                serde_json::Map::new()
            }
        }
    }

    fn read_array<T: DeserializeOwned>(path: &Path) -> Vec<T> {
        match std::fs::read_to_string(path) {
            Ok(raw) => match serde_json::from_str::<Vec<T>>(&raw) {
                Ok(items) => items,
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "failed to parse persisted document, treating as empty");
                    Vec::new()
                }
            },
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Vec::new(),
            Err(e) => {
                warn!(path = %path.display(), error = %e, "failed to read persisted document, treating as empty");
                Vec::new()
            }
        }
    }

    /// Rewrite the document with the given array. Arms the self-write
    /// window, and backs the current content up to `.bak` before a
    /// non-empty document is replaced with an empty one.
    pub fn save_array<T: Serialize>(&self, items: &[T]) -> Result<(), StoreError> {
        if items.is_empty() {
            self.backup_if_nonempty();
        }
        let json = serde_json::to_string_pretty(items).map_err(|source| StoreError::Serialize {
            path: self.path.clone(),
            source,
        })?;
        self.write_document(&json)
    }

    /// Rewrite the document with the given object.
    pub fn save_object(&self, map: &serde_json::Map<String, serde_json::Value>) -> Result<(), StoreError> {
        let json = serde_json::to_string_pretty(map).map_err(|source| StoreError::Serialize {
            path: self.path.clone(),
            source,
        })?;
        self.write_document(&json)
    }

    fn backup_if_nonempty(&self) {
        let current: Vec<serde_json::Value> = Self::read_array(&self.path);
        if current.is_empty() {
            return;
        }
        let backup = self.bak_path();
        if let Err(e) = std::fs::copy(&self.path, &backup) {
            warn!(path = %self.path.display(), error = %e, "failed to write .bak before empty overwrite");
        } else {
            debug!(path = %self.path.display(), "backed up non-empty document before empty overwrite");
        }
    }

    fn write_document(&self, json: &str) -> Result<(), StoreError> {
        let io_err = |source| StoreError::Io {
            path: self.path.clone(),
            source,
        };

        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent).map_err(io_err)?;
        }

        self.mark_self_write();

        // Temp-file-plus-rename keeps readers from ever seeing a torn write.
        let tmp = self.path.with_extension("tmp");
        std::fs::write(&tmp, json).map_err(io_err)?;
        std::fs::rename(&tmp, &self.path).map_err(io_err)?;
        Ok(())
    }

    /// Arm the self-write suppression window. Called automatically by the
    /// save methods; exposed for callers that write through other means.
    pub fn mark_self_write(&self) {
        if let Ok(mut guard) = self.last_self_write.lock() {
            *guard = Some(Instant::now());
        }
    }

    fn in_self_write_window(&self) -> bool {
        self.last_self_write
            .lock()
            .ok()
            .and_then(|guard| *guard)
            .is_some_and(|at| at.elapsed() < self.self_write_window)
    }

    /// Watch the document's parent directory for external edits. Each
    /// debounced external change sends one `()` on `reload_tx`; the
    /// caller reloads and reconciles. Dropping the returned handle stops
    /// the watch.
    pub fn watch(self: &Arc<Self>, reload_tx: mpsc::UnboundedSender<()>) -> Result<StoreWatch, StoreError> {
        let dir = self
            .path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("."));
        std::fs::create_dir_all(&dir).map_err(|source| StoreError::Io {
            path: dir.clone(),
            source,
        })?;

        let file_name = self.path.file_name().map(std::ffi::OsStr::to_owned);
        let (raw_tx, mut raw_rx) = mpsc::unbounded_channel::<()>();

        let mut watcher = notify::recommended_watcher(move |res: Result<notify::Event, notify::Error>| {
            let Ok(event) = res else { return };
            let relevant = event
                .paths
                .iter()
                .any(|p| p.file_name().map(std::ffi::OsStr::to_owned) == file_name);
            if relevant {
                let _ = raw_tx.send(());
            }
        })
        .map_err(|source| StoreError::Watch {
            path: self.path.clone(),
            source,
        })?;

        watcher
            .watch(&dir, RecursiveMode::NonRecursive)
            .map_err(|source| StoreError::Watch {
                path: self.path.clone(),
                source,
            })?;

        let store = self.clone();
        let debounce = self.debounce;
        let task = tokio::spawn(async move {
            while raw_rx.recv().await.is_some() {
                if store.in_self_write_window() {
                    continue;
                }
                // Trailing debounce: wait for the churn to settle.
                loop {
                    match tokio::time::timeout(debounce, raw_rx.recv()).await {
                        Ok(Some(())) => {}
                        Ok(None) => return,
                        Err(_) => break,
                    }
                }
                debug!(path = %store.path.display(), "external change detected, requesting reload");
                if reload_tx.send(()).is_err() {
                    return;
                }
            }
        });

        Ok(StoreWatch {
            _watcher: watcher,
            task,
        })
    }
}

/// Live watch on a store; dropping it closes the watcher and the
/// debounce task.
pub struct StoreWatch {
    _watcher: RecommendedWatcher,
    task: JoinHandle<()>,
}

impl Drop for StoreWatch {
    fn drop(&mut self) {
        self.task.abort();
    }
}
