//! Workspace monitor: filesystem/git watchers and session mining.
//!
//! For each monitored workspace the monitor runs a recursive watch on the
//! discovered `chatSessions` directory (a `state.json` write publishes
//! `workspace:session-updated`, other entries publish
//! `workspace:file-changed`, and JSONL churn debounces into a re-mine), a
//! recursive watch on `.vscode`, a non-recursive watch on `.git` metadata
//! files plus a recursive watch on `refs/heads`, a periodic remote-fetch
//! task that diffs `refs/remotes/**` across `git fetch --all --prune`,
//! and a periodic session-mining task. Per-workspace buffers are bounded.

pub mod git;
pub mod sessions;

use std::collections::{HashMap, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::Mutex as StdMutex;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use notify::{RecommendedWatcher, RecursiveMode, Watcher};
use serde::Serialize;
use tokio::sync::{mpsc, Mutex, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::domain::models::{
    FileChange, GitActivity, GitEventKind, MonitorStopReason, SessionSummary,
    WorkspaceHistoryEntry,
};
use crate::infrastructure::store::JsonStore;
use crate::services::event_bus::{Event, EventBus};

/// Bound on the per-workspace change and git-event buffers.
pub const MAX_RECENT: usize = 50;
/// History entries retained in `config/workspace-history.json`.
const HISTORY_LIMIT: usize = 100;
/// Quiet period before a changed session JSONL is re-mined.
const JSONL_DEBOUNCE: Duration = Duration::from_secs(5);
const DEFAULT_FETCH_INTERVAL: Duration = Duration::from_secs(300);
const DEFAULT_MINE_INTERVAL: Duration = Duration::from_secs(60);

/// Error types for monitor operations.
#[derive(Debug, thiserror::Error)]
pub enum MonitorError {
    #[error("already monitoring: {0}")]
    AlreadyMonitoring(String),

    #[error("not monitoring: {0}")]
    NotMonitoring(String),

    #[error("workspace path does not exist: {0}")]
    MissingPath(String),

    #[error("watch failed: {0}")]
    Watch(#[from] notify::Error),
}

/// Monitor tuning; the fetch interval honours `GIT_FETCH_INTERVAL_MS`.
#[derive(Debug, Clone)]
pub struct MonitorConfig {
    pub fetch_interval: Duration,
    pub mine_interval: Duration,
    pub jsonl_debounce: Duration,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            fetch_interval: DEFAULT_FETCH_INTERVAL,
            mine_interval: DEFAULT_MINE_INTERVAL,
            jsonl_debounce: JSONL_DEBOUNCE,
        }
    }
}

impl MonitorConfig {
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Ok(raw) = std::env::var("GIT_FETCH_INTERVAL_MS") {
            match raw.parse::<u64>() {
                Ok(ms) if ms > 0 => config.fetch_interval = Duration::from_millis(ms),
                _ => warn!(value = %raw, "invalid GIT_FETCH_INTERVAL_MS, keeping default"),
            }
        }
        config
    }
}

/// Raw watcher notifications, classified on the monitor's worker task.
enum RawChange {
    Sessions(PathBuf),
    Vscode(PathBuf),
    GitMeta(PathBuf),
    GitHeads(PathBuf),
}

struct MonitorInner {
    path: PathBuf,
    bus: Arc<EventBus>,
    config: MonitorConfig,
    recent_changes: StdMutex<VecDeque<FileChange>>,
    git_events: StdMutex<VecDeque<GitActivity>>,
    sessions: RwLock<HashMap<String, SessionSummary>>,
    session_sizes: StdMutex<HashMap<PathBuf, u64>>,
    head: StdMutex<Option<String>>,
    jsonl_debounces: Mutex<HashMap<PathBuf, JoinHandle<()>>>,
}

impl MonitorInner {
    fn workspace(&self) -> String {
        self.path.display().to_string()
    }

    async fn push_file_change(&self, file: &Path) {
        let change = FileChange {
            path: file.display().to_string(),
            timestamp: Utc::now(),
        };
        if let Ok(mut buffer) = self.recent_changes.lock() {
            if buffer.len() == MAX_RECENT {
                buffer.pop_front();
            }
            buffer.push_back(change);
        }
        self.bus
            .publish(Event::WorkspaceFileChanged {
                path: self.workspace(),
                file: file.display().to_string(),
            })
            .await;
    }

    async fn push_git_event(&self, kind: GitEventKind, detail: Option<String>) {
        let activity = GitActivity {
            kind,
            detail: detail.clone(),
            timestamp: Utc::now(),
        };
        if let Ok(mut buffer) = self.git_events.lock() {
            if buffer.len() == MAX_RECENT {
                buffer.pop_front();
            }
            buffer.push_back(activity);
        }
        self.bus
            .publish(Event::WorkspaceGitEvent {
                path: self.workspace(),
                kind,
                detail,
            })
            .await;
    }

    async fn handle_sessions_change(self: &Arc<Self>, file: PathBuf) {
        let name = file.file_name().and_then(|n| n.to_str()).unwrap_or_default();
        if name == "state.json" {
            let session_id = file
                .parent()
                .and_then(|p| p.file_name())
                .and_then(|n| n.to_str())
                .filter(|s| uuid::Uuid::parse_str(s).is_ok())
                .map(str::to_string);
            self.bus
                .publish(Event::WorkspaceSessionUpdated {
                    path: self.workspace(),
                    session_id,
                })
                .await;
            return;
        }

        self.push_file_change(&file).await;

        if file.extension().and_then(|e| e.to_str()) == Some("jsonl") {
            self.debounce_remine(file).await;
        }
    }

    /// Re-mine a changed transcript after a quiet period, coalescing
    /// repeated writes to the same file.
    async fn debounce_remine(self: &Arc<Self>, file: PathBuf) {
        let mut debounces = self.jsonl_debounces.lock().await;
        if let Some(pending) = debounces.remove(&file) {
            pending.abort();
        }
        let inner = self.clone();
        let key = file.clone();
        let handle = tokio::spawn(async move {
            tokio::time::sleep(inner.config.jsonl_debounce).await;
            inner.mine_one(&file).await;
            inner.jsonl_debounces.lock().await.remove(&file);
        });
        debounces.insert(key, handle);
    }

    async fn mine_one(&self, file: &Path) {
        if let Some(summary) = sessions::mine_session_file(file) {
            if let Ok(meta) = std::fs::metadata(file) {
                if let Ok(mut sizes) = self.session_sizes.lock() {
                    sizes.insert(file.to_path_buf(), meta.len());
                }
            }
            self.sessions
                .write()
                .await
                .insert(summary.session_id.clone(), summary);
        }
    }

    async fn handle_git_meta(self: &Arc<Self>, file: PathBuf) {
        let Some(name) = file.file_name().and_then(|n| n.to_str()) else {
            return;
        };
        match name {
            "HEAD" => {
                let new_head = git::read_head(&self.path);
                let changed = {
                    let Ok(mut head) = self.head.lock() else { return };
                    let changed = *head != new_head;
                    if changed {
                        head.clone_from(&new_head);
                    }
                    changed
                };
                if changed {
                    let branch = new_head
                        .as_deref()
                        .and_then(git::branch_from_head)
                        .map(str::to_string);
                    self.push_git_event(GitEventKind::BranchSwitch, branch).await;
                }
            }
            "COMMIT_EDITMSG" => {
                let message = git::read_commit_message(&self.path);
                self.push_git_event(GitEventKind::CommitMessage, message).await;
            }
            "MERGE_HEAD" => self.push_git_event(GitEventKind::Merge, None).await,
            "REBASE_HEAD" => self.push_git_event(GitEventKind::Rebase, None).await,
            _ => {}
        }
    }

    async fn handle_git_heads(self: &Arc<Self>, file: PathBuf) {
        let branch = git::branch_from_ref_path(&self.path, &file);
        self.push_git_event(GitEventKind::Commit, branch).await;
    }

    /// One remote-poll cycle: snapshot, fetch, diff, publish.
    async fn poll_remotes(&self) {
        let before = git::snapshot_remote_refs(&self.path);
        match git::run_fetch(&self.path).await {
            Ok(()) => {
                let after = git::snapshot_remote_refs(&self.path);
                for (ref_name, change) in git::diff_remote_refs(&before, &after) {
                    self.bus
                        .publish(Event::WorkspaceRemoteUpdate {
                            path: self.workspace(),
                            ref_name,
                            change,
                        })
                        .await;
                }
            }
            Err(error) => {
                warn!(workspace = %self.workspace(), error = %error, "remote fetch failed");
                self.push_git_event(GitEventKind::FetchFailed, Some(error)).await;
            }
        }
    }

    /// One mining sweep over the chatSessions transcripts; files whose
    /// size is unchanged are skipped.
    async fn mine_sessions(&self, dir: &Path) {
        let Ok(entries) = std::fs::read_dir(dir) else {
            return;
        };
        for entry in entries.flatten() {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("jsonl") {
                continue;
            }
            let Ok(meta) = entry.metadata() else { continue };
            let unchanged = self
                .session_sizes
                .lock()
                .ok()
                .is_some_and(|sizes| sizes.get(&path) == Some(&meta.len()));
            if unchanged {
                continue;
            }
            self.mine_one(&path).await;
        }
    }
}

/// Point-in-time status for one monitored workspace.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MonitorStatus {
    pub path: String,
    pub started_at: DateTime<Utc>,
    pub recent_changes: Vec<FileChange>,
    pub git_events: Vec<GitActivity>,
    pub session_count: usize,
}

/// One running workspace monitor: its watchers and periodic tasks.
pub struct WorkspaceMonitor {
    inner: Arc<MonitorInner>,
    watchers: Vec<RecommendedWatcher>,
    tasks: Vec<JoinHandle<()>>,
    started_at: DateTime<Utc>,
    started_instant: Instant,
}

impl WorkspaceMonitor {
    /// Start watching a workspace. Missing optional directories
    /// (`chatSessions`, `.vscode`, `.git`) simply skip their watchers.
    pub async fn start(
        path: PathBuf,
        bus: Arc<EventBus>,
        config: MonitorConfig,
    ) -> Result<Self, MonitorError> {
        if !path.is_dir() {
            return Err(MonitorError::MissingPath(path.display().to_string()));
        }

        let inner = Arc::new(MonitorInner {
            head: StdMutex::new(git::read_head(&path)),
            path: path.clone(),
            bus: bus.clone(),
            config: config.clone(),
            recent_changes: StdMutex::new(VecDeque::new()),
            git_events: StdMutex::new(VecDeque::new()),
            sessions: RwLock::new(HashMap::new()),
            session_sizes: StdMutex::new(HashMap::new()),
            jsonl_debounces: Mutex::new(HashMap::new()),
        });

        let (raw_tx, raw_rx) = mpsc::unbounded_channel::<RawChange>();
        let mut watchers = Vec::new();

        let chat_sessions = discover_chat_sessions_dir(&path);
        if let Some(ref dir) = chat_sessions {
            watchers.push(spawn_watch(dir, RecursiveMode::Recursive, raw_tx.clone(), RawChange::Sessions)?);
        }

        let vscode = path.join(".vscode");
        if vscode.is_dir() {
            watchers.push(spawn_watch(&vscode, RecursiveMode::Recursive, raw_tx.clone(), RawChange::Vscode)?);
        }

        let git_dir = path.join(".git");
        if git_dir.is_dir() {
            watchers.push(spawn_watch(&git_dir, RecursiveMode::NonRecursive, raw_tx.clone(), RawChange::GitMeta)?);
            let heads = git::heads_dir(&path);
            if heads.is_dir() {
                watchers.push(spawn_watch(&heads, RecursiveMode::Recursive, raw_tx.clone(), RawChange::GitHeads)?);
            }
        }
        drop(raw_tx);

        let mut tasks = Vec::new();
        tasks.push(tokio::spawn(classify_loop(inner.clone(), raw_rx)));

        if git_dir.is_dir() {
            let fetch_inner = inner.clone();
            let interval = config.fetch_interval;
            tasks.push(tokio::spawn(async move {
                loop {
                    tokio::time::sleep(interval).await;
                    fetch_inner.poll_remotes().await;
                }
            }));
        }

        if let Some(dir) = chat_sessions {
            let mine_inner = inner.clone();
            let interval = config.mine_interval;
            tasks.push(tokio::spawn(async move {
                loop {
                    mine_inner.mine_sessions(&dir).await;
                    tokio::time::sleep(interval).await;
                }
            }));
        }

        bus.publish(Event::WorkspaceMonitoring {
            path: path.display().to_string(),
        })
        .await;
        info!(workspace = %path.display(), watchers = watchers.len(), "workspace monitoring started");

        Ok(Self {
            inner,
            watchers,
            tasks,
            started_at: Utc::now(),
            started_instant: Instant::now(),
        })
    }

    pub async fn status(&self) -> MonitorStatus {
        MonitorStatus {
            path: self.inner.workspace(),
            started_at: self.started_at,
            recent_changes: self
                .inner
                .recent_changes
                .lock()
                .map(|b| b.iter().cloned().collect())
                .unwrap_or_default(),
            git_events: self
                .inner
                .git_events
                .lock()
                .map(|b| b.iter().cloned().collect())
                .unwrap_or_default(),
            session_count: self.inner.sessions.read().await.len(),
        }
    }

    pub async fn sessions(&self) -> Vec<SessionSummary> {
        let mut all: Vec<_> = self.inner.sessions.read().await.values().cloned().collect();
        all.sort_by(|a, b| a.session_id.cmp(&b.session_id));
        all
    }

    /// Close every watcher, cancel the timers and pending debounces,
    /// publish `workspace:stopped`, and produce the history entry.
    pub async fn stop(mut self, reason: MonitorStopReason) -> WorkspaceHistoryEntry {
        for task in &self.tasks {
            task.abort();
        }
        self.tasks.clear();
        self.watchers.clear();

        let mut debounces = self.inner.jsonl_debounces.lock().await;
        for (_, pending) in debounces.drain() {
            pending.abort();
        }
        drop(debounces);

        let path = self.inner.workspace();
        self.inner
            .bus
            .publish(Event::WorkspaceStopped {
                path: path.clone(),
                reason,
            })
            .await;
        info!(workspace = %path, reason = reason.as_str(), "workspace monitoring stopped");

        WorkspaceHistoryEntry {
            path,
            started_at: self.started_at,
            stopped_at: Utc::now(),
            duration_ms: self.started_instant.elapsed().as_millis() as u64,
            reason,
        }
    }
}

async fn classify_loop(inner: Arc<MonitorInner>, mut rx: mpsc::UnboundedReceiver<RawChange>) {
    while let Some(change) = rx.recv().await {
        match change {
            RawChange::Sessions(file) => inner.handle_sessions_change(file).await,
            RawChange::Vscode(file) => inner.push_file_change(&file).await,
            RawChange::GitMeta(file) => {
                if git::is_watched_git_meta(&file) {
                    inner.handle_git_meta(file).await;
                }
            }
            RawChange::GitHeads(file) => inner.handle_git_heads(file).await,
        }
    }
}

fn spawn_watch(
    dir: &Path,
    mode: RecursiveMode,
    tx: mpsc::UnboundedSender<RawChange>,
    wrap: fn(PathBuf) -> RawChange,
) -> Result<RecommendedWatcher, MonitorError> {
    let mut watcher = notify::recommended_watcher(move |res: Result<notify::Event, notify::Error>| {
        let Ok(event) = res else { return };
        for path in event.paths {
            let _ = tx.send(wrap(path));
        }
    })?;
    watcher.watch(dir, mode)?;
    debug!(dir = %dir.display(), "watcher attached");
    Ok(watcher)
}

/// The workspace's chat-session storage, when present.
fn discover_chat_sessions_dir(workspace: &Path) -> Option<PathBuf> {
    let candidate = workspace.join(".vscode").join("chatSessions");
    candidate.is_dir().then_some(candidate)
}

/// Manager over all workspace monitors; persists the monitored-path list
/// and the start/stop history.
pub struct MonitorManager {
    monitors: Mutex<HashMap<String, WorkspaceMonitor>>,
    paths_store: Arc<JsonStore>,
    history_store: Arc<JsonStore>,
    bus: Arc<EventBus>,
    config: MonitorConfig,
}

impl MonitorManager {
    pub fn new(
        paths_store: Arc<JsonStore>,
        history_store: Arc<JsonStore>,
        bus: Arc<EventBus>,
        config: MonitorConfig,
    ) -> Arc<Self> {
        Arc::new(Self {
            monitors: Mutex::new(HashMap::new()),
            paths_store,
            history_store,
            bus,
            config,
        })
    }

    /// Restart monitors persisted in `config/monitors.json`.
    pub async fn restore(&self) {
        let paths: Vec<String> = self.paths_store.load_array();
        for path in paths {
            if let Err(e) = self.start_monitoring(&path).await {
                warn!(workspace = %path, error = %e, "failed to restore workspace monitor");
            }
        }
    }

    pub async fn start_monitoring(&self, path: &str) -> Result<(), MonitorError> {
        let mut monitors = self.monitors.lock().await;
        if monitors.contains_key(path) {
            return Err(MonitorError::AlreadyMonitoring(path.to_string()));
        }
        let monitor = WorkspaceMonitor::start(
            PathBuf::from(path),
            self.bus.clone(),
            self.config.clone(),
        )
        .await?;
        monitors.insert(path.to_string(), monitor);
        self.persist_paths_locked(&monitors);
        Ok(())
    }

    /// Stop one monitor. `skip_persist` leaves `monitors.json` untouched
    /// so the monitor restarts on next boot (graceful shutdown).
    pub async fn stop_monitoring(
        &self,
        path: &str,
        reason: MonitorStopReason,
        skip_persist: bool,
    ) -> Result<(), MonitorError> {
        let monitor = {
            let mut monitors = self.monitors.lock().await;
            let monitor = monitors
                .remove(path)
                .ok_or_else(|| MonitorError::NotMonitoring(path.to_string()))?;
            if !skip_persist {
                self.persist_paths_locked(&monitors);
            }
            monitor
        };
        let entry = monitor.stop(reason).await;
        self.append_history(entry);
        Ok(())
    }

    pub async fn stop_all(&self, reason: MonitorStopReason, skip_persist: bool) {
        let drained: Vec<(String, WorkspaceMonitor)> = {
            let mut monitors = self.monitors.lock().await;
            let drained = monitors.drain().collect();
            if !skip_persist {
                self.persist_paths_locked(&monitors);
            }
            drained
        };
        for (_, monitor) in drained {
            let entry = monitor.stop(reason).await;
            self.append_history(entry);
        }
    }

    pub async fn status(&self) -> Vec<MonitorStatus> {
        let monitors = self.monitors.lock().await;
        let mut statuses = Vec::with_capacity(monitors.len());
        for monitor in monitors.values() {
            statuses.push(monitor.status().await);
        }
        statuses.sort_by(|a, b| a.path.cmp(&b.path));
        statuses
    }

    pub async fn is_monitoring(&self, path: &str) -> bool {
        self.monitors.lock().await.contains_key(path)
    }

    fn persist_paths_locked(&self, monitors: &HashMap<String, WorkspaceMonitor>) {
        let mut paths: Vec<&String> = monitors.keys().collect();
        paths.sort();
        if let Err(e) = self.paths_store.save_array(&paths) {
            warn!(error = %e, "failed to persist monitored paths");
        }
    }

    fn append_history(&self, entry: WorkspaceHistoryEntry) {
        let mut history: Vec<WorkspaceHistoryEntry> = self.history_store.load_array();
        history.push(entry);
        if history.len() > HISTORY_LIMIT {
            let excess = history.len() - HISTORY_LIMIT;
            history.drain(..excess);
        }
        if let Err(e) = self.history_store.save_array(&history) {
            warn!(error = %e, "failed to persist workspace history");
        }
    }
}
