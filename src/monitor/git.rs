//! Git repository inspection helpers for the workspace monitor.
//!
//! Watches are classified here: a `HEAD` delta is a branch switch, a
//! `refs/heads/<branch>` delta is a commit, `COMMIT_EDITMSG` is a commit
//! message. Remote polling snapshots `refs/remotes/**` (loose and
//! packed), runs `git fetch --all --prune` under a timeout, and diffs the
//! ref sets.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use tokio::process::Command;
use tokio::time::timeout;
use tracing::{debug, warn};

use crate::domain::models::RemoteRefChange;

/// Timeout for `git fetch --all --prune`.
pub const FETCH_TIMEOUT: Duration = Duration::from_secs(30);

/// `.git` metadata files the monitor watches (non-recursively).
pub const GIT_META_FILES: &[&str] = &["HEAD", "COMMIT_EDITMSG", "MERGE_HEAD", "REBASE_HEAD"];

/// Current `HEAD` content, trimmed (`ref: refs/heads/main` or a sha).
pub fn read_head(workspace: &Path) -> Option<String> {
    std::fs::read_to_string(workspace.join(".git").join("HEAD"))
        .ok()
        .map(|s| s.trim().to_string())
}

/// Short branch name out of a `HEAD` value, when it is a symbolic ref.
pub fn branch_from_head(head: &str) -> Option<&str> {
    head.strip_prefix("ref: refs/heads/")
}

/// First line of `COMMIT_EDITMSG`, skipping comments.
pub fn read_commit_message(workspace: &Path) -> Option<String> {
    let raw = std::fs::read_to_string(workspace.join(".git").join("COMMIT_EDITMSG")).ok()?;
    raw.lines()
        .map(str::trim)
        .find(|l| !l.is_empty() && !l.starts_with('#'))
        .map(str::to_string)
}

/// Branch name out of a changed `refs/heads/...` path.
pub fn branch_from_ref_path(workspace: &Path, ref_path: &Path) -> Option<String> {
    let heads = workspace.join(".git").join("refs").join("heads");
    ref_path
        .strip_prefix(&heads)
        .ok()
        .map(|rel| rel.to_string_lossy().replace('\\', "/"))
}

/// Snapshot of every remote-tracking ref: `refs/remotes/...` → sha.
/// Reads loose refs from the filesystem and merges `packed-refs`.
pub fn snapshot_remote_refs(workspace: &Path) -> HashMap<String, String> {
    let git_dir = workspace.join(".git");
    let mut refs = HashMap::new();

    // Packed refs first; loose refs override them.
    if let Ok(packed) = std::fs::read_to_string(git_dir.join("packed-refs")) {
        for line in packed.lines() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') || line.starts_with('^') {
                continue;
            }
            if let Some((sha, name)) = line.split_once(' ') {
                if name.starts_with("refs/remotes/") {
                    refs.insert(name.to_string(), sha.to_string());
                }
            }
        }
    }

    let remotes_dir = git_dir.join("refs").join("remotes");
    collect_loose_refs(&remotes_dir, &remotes_dir, &mut refs);
    refs
}

fn collect_loose_refs(root: &Path, dir: &Path, refs: &mut HashMap<String, String>) {
    let Ok(entries) = std::fs::read_dir(dir) else {
        return;
    };
    for entry in entries.flatten() {
        let path = entry.path();
        if path.is_dir() {
            collect_loose_refs(root, &path, refs);
        } else if let Ok(sha) = std::fs::read_to_string(&path) {
            if let Ok(rel) = path.strip_prefix(root) {
                let name = format!("refs/remotes/{}", rel.to_string_lossy().replace('\\', "/"));
                refs.insert(name, sha.trim().to_string());
            }
        }
    }
}

/// Changed/added/deleted remote refs between two snapshots.
pub fn diff_remote_refs(
    before: &HashMap<String, String>,
    after: &HashMap<String, String>,
) -> Vec<(String, RemoteRefChange)> {
    let mut changes = Vec::new();
    for (name, sha) in after {
        match before.get(name) {
            None => changes.push((name.clone(), RemoteRefChange::Added)),
            Some(old) if old != sha => changes.push((name.clone(), RemoteRefChange::Changed)),
            Some(_) => {}
        }
    }
    for name in before.keys() {
        if !after.contains_key(name) {
            changes.push((name.clone(), RemoteRefChange::Deleted));
        }
    }
    changes.sort_by(|a, b| a.0.cmp(&b.0));
    changes
}

/// Run `git fetch --all --prune` in the workspace under [`FETCH_TIMEOUT`].
pub async fn run_fetch(workspace: &Path) -> Result<(), String> {
    let mut child = Command::new("git")
        .arg("fetch")
        .arg("--all")
        .arg("--prune")
        .current_dir(workspace)
        .stdout(std::process::Stdio::null())
        .stderr(std::process::Stdio::piped())
        .kill_on_drop(true)
        .spawn()
        .map_err(|e| format!("failed to spawn git: {e}"))?;

    let waited = timeout(FETCH_TIMEOUT, child.wait_with_output()).await;
    match waited {
        Ok(Ok(output)) if output.status.success() => {
            debug!(workspace = %workspace.display(), "remote fetch completed");
            Ok(())
        }
        Ok(Ok(output)) => {
            let stderr = String::from_utf8_lossy(&output.stderr);
            Err(format!(
                "git fetch exited with {:?}: {}",
                output.status.code(),
                stderr.trim()
            ))
        }
        Ok(Err(e)) => Err(format!("git fetch failed: {e}")),
        Err(_) => {
            warn!(workspace = %workspace.display(), "git fetch timed out");
            Err("git fetch timed out".to_string())
        }
    }
}

/// Paths the non-recursive `.git` watch should report on.
pub fn is_watched_git_meta(path: &Path) -> bool {
    path.file_name()
        .and_then(|n| n.to_str())
        .is_some_and(|name| GIT_META_FILES.contains(&name))
}

/// The `refs/heads` directory for a workspace, if it exists.
pub fn heads_dir(workspace: &Path) -> PathBuf {
    workspace.join(".git").join("refs").join("heads")
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn write(path: &Path, content: &str) {
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(path, content).unwrap();
    }

    #[test]
    fn test_branch_from_head() {
        assert_eq!(branch_from_head("ref: refs/heads/main"), Some("main"));
        assert_eq!(branch_from_head("ref: refs/heads/feat/x"), Some("feat/x"));
        assert_eq!(branch_from_head("deadbeef"), None);
    }

    #[test]
    fn test_commit_message_skips_comments() {
        let dir = tempdir().unwrap();
        write(
            &dir.path().join(".git").join("COMMIT_EDITMSG"),
            "# Please enter the commit message\n\nFix watcher debounce\n",
        );
        assert_eq!(
            read_commit_message(dir.path()).as_deref(),
            Some("Fix watcher debounce")
        );
    }

    #[test]
    fn test_snapshot_merges_loose_and_packed() {
        let dir = tempdir().unwrap();
        write(
            &dir.path().join(".git").join("packed-refs"),
            "# pack-refs with: peeled fully-peeled sorted\naaaa refs/remotes/origin/main\nbbbb refs/heads/main\n",
        );
        write(
            &dir.path()
                .join(".git")
                .join("refs")
                .join("remotes")
                .join("origin")
                .join("dev"),
            "cccc\n",
        );

        let refs = snapshot_remote_refs(dir.path());
        assert_eq!(refs.get("refs/remotes/origin/main").map(String::as_str), Some("aaaa"));
        assert_eq!(refs.get("refs/remotes/origin/dev").map(String::as_str), Some("cccc"));
        assert!(!refs.contains_key("refs/heads/main"));
    }

    #[test]
    fn test_diff_remote_refs() {
        let mut before = HashMap::new();
        before.insert("refs/remotes/origin/main".to_string(), "aaaa".to_string());
        before.insert("refs/remotes/origin/gone".to_string(), "bbbb".to_string());

        let mut after = HashMap::new();
        after.insert("refs/remotes/origin/main".to_string(), "cccc".to_string());
        after.insert("refs/remotes/origin/new".to_string(), "dddd".to_string());

        let changes = diff_remote_refs(&before, &after);
        assert_eq!(
            changes,
            vec![
                ("refs/remotes/origin/gone".to_string(), RemoteRefChange::Deleted),
                ("refs/remotes/origin/main".to_string(), RemoteRefChange::Changed),
                ("refs/remotes/origin/new".to_string(), RemoteRefChange::Added),
            ]
        );
    }
}
