//! Bounded event log: in-memory ring backed by an append-only JSONL tail.
//!
//! Wraps the event bus with one subscriber per known event name. Every
//! published event is appended as `{ ts, event, ...data }` to both the
//! ring and the `logs/events.jsonl` tail; the ring is seeded from the
//! tail on the first read after startup. Corrupt lines are skipped
//! silently — the log tolerates truncation and garbage by design.

use std::collections::VecDeque;
use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tracing::warn;

use super::event_bus::{Event, EventBus, EventHandler, ALL_EVENT_NAMES};

/// Default ring capacity.
pub const DEFAULT_RING_CAPACITY: usize = 200;

/// One logged event: monotone timestamp, event name, flat payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventLogEntry {
    pub ts: DateTime<Utc>,
    pub event: String,
    #[serde(flatten)]
    pub data: serde_json::Map<String, serde_json::Value>,
}

impl EventLogEntry {
    fn from_event(event: &Event) -> Self {
        let data = match event.data() {
            serde_json::Value::Object(map) => map,
            _ => serde_json::Map::new(),
        };
        Self {
            ts: Utc::now(),
            event: event.name().to_string(),
            data,
        }
    }

    /// RFC3339 with nanoseconds, the tail's line format.
    fn to_jsonl_line(&self) -> Option<String> {
        let mut value = serde_json::Map::new();
        value.insert(
            "ts".to_string(),
            serde_json::Value::String(self.ts.to_rfc3339_opts(SecondsFormat::Nanos, true)),
        );
        value.insert(
            "event".to_string(),
            serde_json::Value::String(self.event.clone()),
        );
        for (k, v) in &self.data {
            value.entry(k.clone()).or_insert_with(|| v.clone());
        }
        serde_json::to_string(&serde_json::Value::Object(value)).ok()
    }
}

/// Append-only event log with a bounded in-memory ring.
pub struct EventLog {
    path: PathBuf,
    capacity: usize,
    ring: RwLock<VecDeque<EventLogEntry>>,
    /// Set once the ring has been seeded from the tail.
    seeded: AtomicBool,
    /// Serialized JSONL writer; short critical sections, no awaits held.
    file: Mutex<File>,
}

impl EventLog {
    /// Open (creating parents as needed) the JSONL tail in append mode.
    pub fn new(path: impl AsRef<Path>) -> std::io::Result<Arc<Self>> {
        Self::with_capacity(path, DEFAULT_RING_CAPACITY)
    }

    pub fn with_capacity(path: impl AsRef<Path>, capacity: usize) -> std::io::Result<Arc<Self>> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        Ok(Arc::new(Self {
            path,
            capacity,
            ring: RwLock::new(VecDeque::with_capacity(capacity)),
            seeded: AtomicBool::new(false),
            file: Mutex::new(file),
        }))
    }

    /// Register this log on the bus, one subscription per known event name.
    pub async fn attach(self: &Arc<Self>, bus: &EventBus) {
        for name in ALL_EVENT_NAMES.iter().copied() {
            bus.subscribe(name, self.clone() as Arc<dyn EventHandler>).await;
        }
    }

    /// Up to `limit` newest entries, newest last. The first call seeds the
    /// ring from the JSONL tail.
    pub async fn get_recent_events(&self, limit: usize) -> Vec<EventLogEntry> {
        if !self.seeded.load(Ordering::Acquire) {
            self.seed_from_tail().await;
        }
        let ring = self.ring.read().await;
        let skip = ring.len().saturating_sub(limit);
        ring.iter().skip(skip).cloned().collect()
    }

    /// Replace the ring with the last `capacity` parseable lines of the
    /// tail. Every ring entry was also appended to the file, so the tail
    /// is a superset of anything already in memory.
    async fn seed_from_tail(&self) {
        let mut entries: VecDeque<EventLogEntry> = VecDeque::with_capacity(self.capacity);

        match File::open(&self.path) {
            Ok(file) => {
                let reader = BufReader::new(file);
                for line in reader.lines() {
                    let Ok(line) = line else { break };
                    let trimmed = line.trim();
                    if trimmed.is_empty() {
                        continue;
                    }
                    match serde_json::from_str::<EventLogEntry>(trimmed) {
                        Ok(entry) => {
                            if entries.len() == self.capacity {
                                entries.pop_front();
                            }
                            entries.push_back(entry);
                        }
                        Err(_) => {
                            // Corrupt line: skip silently.
                        }
                    }
                }
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => {
                warn!(path = %self.path.display(), error = %e, "failed to read event log tail");
            }
        }

        let mut ring = self.ring.write().await;
        if !self.seeded.swap(true, Ordering::AcqRel) {
            *ring = entries;
        }
    }

    async fn append(&self, event: &Event) {
        let entry = EventLogEntry::from_event(event);

        if let Some(line) = entry.to_jsonl_line() {
            match self.file.lock() {
                Ok(mut file) => {
                    if let Err(e) = writeln!(file, "{line}") {
                        warn!(path = %self.path.display(), error = %e, "failed to append event log entry");
                    }
                }
                Err(_) => {
                    warn!(path = %self.path.display(), "event log writer lock poisoned, dropping entry");
                }
            }
        }

        let mut ring = self.ring.write().await;
        if ring.len() == self.capacity {
            ring.pop_front();
        }
        ring.push_back(entry);
    }
}

#[async_trait]
impl EventHandler for EventLog {
    fn name(&self) -> &str {
        "event-log"
    }

    async fn handle(&self, event: &Event) {
        self.append(event).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn task_started(n: usize) -> Event {
        Event::TaskStarted {
            task_id: format!("t{n}"),
            skill_id: "s".to_string(),
            agent_count: 1,
        }
    }

    #[tokio::test]
    async fn test_append_and_read_back() {
        let dir = tempdir().unwrap();
        let log = EventLog::new(dir.path().join("events.jsonl")).unwrap();

        log.append(&task_started(1)).await;
        log.append(&task_started(2)).await;

        let recent = log.get_recent_events(10).await;
        assert_eq!(recent.len(), 2);
        assert_eq!(recent[0].event, "task:started");
        assert_eq!(recent[0].data["taskId"], "t1");
        assert_eq!(recent[1].data["taskId"], "t2");
    }

    #[tokio::test]
    async fn test_ring_is_bounded() {
        let dir = tempdir().unwrap();
        let log = EventLog::with_capacity(dir.path().join("events.jsonl"), 3).unwrap();

        for n in 0..5 {
            log.append(&task_started(n)).await;
        }

        let recent = log.get_recent_events(10).await;
        assert_eq!(recent.len(), 3);
        assert_eq!(recent[0].data["taskId"], "t2");
    }

    #[tokio::test]
    async fn test_seed_skips_corrupt_lines() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("events.jsonl");
        std::fs::write(
            &path,
            "garbage\n{\"ts\":\"2026-01-01T00:00:00.000000000Z\",\"event\":\"task:started\",\"taskId\":\"t0\"}\n{broken\n",
        )
        .unwrap();

        let log = EventLog::new(&path).unwrap();
        let recent = log.get_recent_events(100).await;
        assert_eq!(recent.len(), 1);
        assert_eq!(recent[0].event, "task:started");

        // The log keeps growing after a corrupt tail.
        log.append(&task_started(1)).await;
        let recent = log.get_recent_events(100).await;
        assert_eq!(recent.len(), 2);
    }

    #[tokio::test]
    async fn test_limit_returns_newest() {
        let dir = tempdir().unwrap();
        let log = EventLog::new(dir.path().join("events.jsonl")).unwrap();
        for n in 0..4 {
            log.append(&task_started(n)).await;
        }
        let recent = log.get_recent_events(2).await;
        assert_eq!(recent.len(), 2);
        assert_eq!(recent[0].data["taskId"], "t2");
        assert_eq!(recent[1].data["taskId"], "t3");
    }
}
