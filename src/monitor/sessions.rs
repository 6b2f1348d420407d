//! Chat-session metadata mining.
//!
//! Sessions live under the workspace's `chatSessions` directory as
//! `<session-id>.jsonl` transcripts with an optional `<session-id>/state.json`
//! companion. Mining stream-reads a bounded number of JSONL lines and
//! extracts summary metadata; the state file is read under a size cap
//! with dangerous object keys rejected, and session ids must be UUIDs.

use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::Path;

use chrono::{DateTime, Utc};
use serde_json::Value;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::domain::models::SessionSummary;

/// Maximum JSONL lines read per session file.
pub const MAX_JSONL_LINES: usize = 5000;
/// Maximum `state.json` size accepted.
pub const MAX_STATE_FILE_BYTES: u64 = 10 * 1024 * 1024;

/// Keys rejected when reading untrusted state files.
const DANGEROUS_KEYS: &[&str] = &["__proto__", "constructor", "prototype"];

/// Extract a validated session id from a `<session-id>.jsonl` path.
pub fn session_id_from_path(path: &Path) -> Option<String> {
    let stem = path.file_stem()?.to_str()?;
    Uuid::parse_str(stem).ok()?;
    Some(stem.to_string())
}

/// Mine one session transcript, then enrich from its companion state
/// file when present. Returns `None` for files whose name is not a
/// UUID-shaped session id.
pub fn mine_session_file(path: &Path) -> Option<SessionSummary> {
    let session_id = session_id_from_path(path)?;
    let file = match File::open(path) {
        Ok(f) => f,
        Err(e) => {
            warn!(path = %path.display(), error = %e, "failed to open session transcript");
            return None;
        }
    };

    let mut summary = SessionSummary {
        session_id: session_id.clone(),
        ..SessionSummary::default()
    };

    let reader = BufReader::new(file);
    for line in reader.lines().take(MAX_JSONL_LINES) {
        let Ok(line) = line else { break };
        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }
        let Ok(value) = serde_json::from_str::<Value>(trimmed) else {
            continue;
        };
        fold_line(&mut summary, &value);
    }

    if let Some(state_dir) = path.parent() {
        let state_path = state_dir.join(&session_id).join("state.json");
        if let Some(state) = read_state_file(&state_path) {
            enrich_from_state(&mut summary, &state);
        }
    }

    debug!(session_id = %session_id, requests = summary.request_count, "session mined");
    Some(summary)
}

fn fold_line(summary: &mut SessionSummary, value: &Value) {
    if summary.title.is_none() {
        if let Some(title) = value.get("title").and_then(Value::as_str) {
            summary.title = Some(title.to_string());
        }
    }

    if let Some(model) = value
        .get("model")
        .and_then(Value::as_str)
        .or_else(|| value.pointer("/request/model").and_then(Value::as_str))
    {
        if !summary.models.iter().any(|m| m == model) {
            summary.models.push(model.to_string());
        }
    }

    let is_request = value.get("request").is_some()
        || value.get("type").and_then(Value::as_str) == Some("request");
    if is_request {
        summary.request_count += 1;
        if let Some(ts) = value
            .get("timestamp")
            .and_then(Value::as_str)
            .and_then(parse_timestamp)
        {
            if summary.first_request.is_none_or(|first| ts < first) {
                summary.first_request = Some(ts);
            }
            if summary.last_request.is_none_or(|last| ts > last) {
                summary.last_request = Some(ts);
            }
        }
    }

    if value.get("error").map(|e| !e.is_null()).unwrap_or(false) {
        summary.error_count += 1;
    }

    summary.prompt_tokens += value
        .pointer("/usage/promptTokens")
        .and_then(Value::as_u64)
        .unwrap_or(0);
    summary.output_tokens += value
        .pointer("/usage/outputTokens")
        .and_then(Value::as_u64)
        .unwrap_or(0);
}

fn parse_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .ok()
}

/// Read a state file defensively: size-capped, and any object graph
/// carrying prototype-pollution keys is rejected outright.
pub fn read_state_file(path: &Path) -> Option<Value> {
    let meta = std::fs::metadata(path).ok()?;
    if meta.len() > MAX_STATE_FILE_BYTES {
        warn!(path = %path.display(), size = meta.len(), "state file exceeds size cap, ignoring");
        return None;
    }
    let raw = std::fs::read_to_string(path).ok()?;
    let value: Value = match serde_json::from_str(&raw) {
        Ok(v) => v,
        Err(e) => {
            warn!(path = %path.display(), error = %e, "unreadable state file");
            return None;
        }
    };
    if has_dangerous_keys(&value) {
        warn!(path = %path.display(), "state file carries dangerous keys, ignoring");
        return None;
    }
    Some(value)
}

fn has_dangerous_keys(value: &Value) -> bool {
    match value {
        Value::Object(map) => map.iter().any(|(key, child)| {
            DANGEROUS_KEYS.contains(&key.as_str()) || has_dangerous_keys(child)
        }),
        Value::Array(items) => items.iter().any(has_dangerous_keys),
        _ => false,
    }
}

fn enrich_from_state(summary: &mut SessionSummary, state: &Value) {
    if summary.title.is_none() {
        if let Some(title) = state.get("title").and_then(Value::as_str) {
            summary.title = Some(title.to_string());
        }
    }
    if let Some(count) = state.get("requestCount").and_then(Value::as_u64) {
        summary.request_count = summary.request_count.max(count);
    }
    if let Some(errors) = state.get("errorCount").and_then(Value::as_u64) {
        summary.error_count = summary.error_count.max(errors);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    const SESSION_ID: &str = "0193a1b2-aaaa-bbbb-cccc-1234567890ab";

    #[test]
    fn test_session_id_must_be_uuid() {
        assert!(session_id_from_path(Path::new("notes.jsonl")).is_none());
        assert_eq!(
            session_id_from_path(Path::new(&format!("{SESSION_ID}.jsonl"))).as_deref(),
            Some(SESSION_ID)
        );
    }

    #[test]
    fn test_mine_extracts_metadata() {
        let dir = tempdir().unwrap();
        let path = dir.path().join(format!("{SESSION_ID}.jsonl"));
        std::fs::write(
            &path,
            concat!(
                "{\"title\":\"Fix the parser\"}\n",
                "not json at all\n",
                "{\"request\":{\"model\":\"sonnet\"},\"timestamp\":\"2026-03-01T10:00:00Z\",\"usage\":{\"promptTokens\":100,\"outputTokens\":20}}\n",
                "{\"request\":{\"model\":\"haiku\"},\"timestamp\":\"2026-03-01T11:00:00Z\",\"error\":\"boom\"}\n",
            ),
        )
        .unwrap();

        let summary = mine_session_file(&path).unwrap();
        assert_eq!(summary.title.as_deref(), Some("Fix the parser"));
        assert_eq!(summary.request_count, 2);
        assert_eq!(summary.error_count, 1);
        assert_eq!(summary.prompt_tokens, 100);
        assert_eq!(summary.output_tokens, 20);
        assert!(summary.first_request.unwrap() < summary.last_request.unwrap());
    }

    #[test]
    fn test_state_enrichment_and_dangerous_keys() {
        let dir = tempdir().unwrap();
        let transcript = dir.path().join(format!("{SESSION_ID}.jsonl"));
        std::fs::write(&transcript, "{\"request\":{}}\n").unwrap();

        let state_dir = dir.path().join(SESSION_ID);
        std::fs::create_dir_all(&state_dir).unwrap();
        std::fs::write(
            state_dir.join("state.json"),
            r#"{"title":"From state","requestCount":7}"#,
        )
        .unwrap();

        let summary = mine_session_file(&transcript).unwrap();
        assert_eq!(summary.title.as_deref(), Some("From state"));
        assert_eq!(summary.request_count, 7);

        // Prototype-pollution keys reject the whole state file.
        std::fs::write(
            state_dir.join("state.json"),
            r#"{"nested":{"__proto__":{"polluted":true}},"requestCount":99}"#,
        )
        .unwrap();
        let summary = mine_session_file(&transcript).unwrap();
        assert_eq!(summary.request_count, 1);
    }
}
