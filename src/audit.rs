use std::path::PathBuf;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use serde::{Deserialize, Serialize};
use tracing::{error, warn};

use crate::statedir;
use crate::types::now_ms;

/// Rotate once the live file reaches this size.
pub const ROTATE_AT_BYTES: u64 = 10 * 1024 * 1024;

/// Event taxonomy for the audit trail.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AuditEvent {
    #[serde(rename = "alert.created")]
    AlertCreated,
    #[serde(rename = "alert.resolved")]
    AlertResolved,
    #[serde(rename = "alert.expired")]
    AlertExpired,
    #[serde(rename = "alert.auto_allowed")]
    AlertAutoAllowed,
    #[serde(rename = "alert.auto_denied")]
    AlertAutoDenied,
    #[serde(rename = "rule.created")]
    RuleCreated,
    #[serde(rename = "rule.deleted")]
    RuleDeleted,
    #[serde(rename = "config.updated")]
    ConfigUpdated,
    #[serde(rename = "hygiene.scan")]
    HygieneScan,
}

/// Append-only JSONL audit log with size-based rotation.
///
/// Every record is one complete JSON line; writes rely on the OS's atomic
/// small-append semantics. Failures are swallowed and counted, never
/// propagated: losing an audit line must not fail the decision path.
pub struct AuditLog {
    path: PathBuf,
    write_lock: Mutex<()>,
    rotating: AtomicBool,
    dropped_entries: AtomicU64,
}

impl AuditLog {
    pub fn new(path: PathBuf) -> Self {
        Self {
            path,
            write_lock: Mutex::new(()),
            rotating: AtomicBool::new(false),
            dropped_entries: AtomicU64::new(0),
        }
    }

    /// Append one event. `fields` supplies the event-specific payload and
    /// is merged beside `ts` and `type`.
    pub fn append(&self, event: AuditEvent, fields: serde_json::Value) {
        let mut record = serde_json::json!({
            "ts": now_ms(),
            "type": event,
        });
        if let (Some(base), Some(extra)) = (record.as_object_mut(), fields.as_object()) {
            for (k, v) in extra {
                base.insert(k.clone(), v.clone());
            }
        }

        let line = match serde_json::to_string(&record) {
            Ok(line) => line,
            Err(e) => {
                self.dropped_entries.fetch_add(1, Ordering::SeqCst);
                error!(error = %e, "audit record not serializable, dropped");
                return;
            }
        };

        let _guard = self.write_lock.lock().unwrap_or_else(|p| p.into_inner());
        match statedir::append_line(&self.path, &line) {
            Ok(size) => {
                if size >= ROTATE_AT_BYTES {
                    self.rotate();
                }
            }
            Err(e) => {
                self.dropped_entries.fetch_add(1, Ordering::SeqCst);
                error!(error = %e, path = %self.path.display(), "audit append failed, dropped");
            }
        }
    }

    /// Rename the live file aside as `<stem>.<epoch-ms>.jsonl`. The boolean
    /// latch stops re-entrant rotations; the write lock is already held.
    fn rotate(&self) {
        if self
            .rotating
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return;
        }

        let result = (|| -> crate::error::Result<PathBuf> {
            statedir::ensure_not_symlink(&self.path)?;
            let rotated = rotated_path(&self.path, now_ms());
            statedir::ensure_not_symlink(&rotated)?;
            std::fs::rename(&self.path, &rotated)?;
            Ok(rotated)
        })();

        match result {
            Ok(rotated) => warn!(rotated = %rotated.display(), "audit log rotated"),
            Err(e) => error!(error = %e, "audit rotation failed"),
        }
        self.rotating.store(false, Ordering::SeqCst);
    }

    /// How many records have been lost to IO or serialization failures.
    pub fn dropped_entries(&self) -> u64 {
        self.dropped_entries.load(Ordering::SeqCst)
    }

    pub fn path(&self) -> &std::path::Path {
        &self.path
    }
}

/// `security-coach-audit.jsonl` -> `security-coach-audit.<ts>.jsonl`.
fn rotated_path(path: &std::path::Path, ts: u64) -> PathBuf {
    let stem = path
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| "audit".to_string());
    let rotated = format!("{stem}.{ts}.jsonl");
    path.with_file_name(rotated)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lines(path: &std::path::Path) -> Vec<serde_json::Value> {
        std::fs::read_to_string(path)
            .unwrap_or_default()
            .lines()
            .map(|l| serde_json::from_str(l).expect("complete JSON line"))
            .collect()
    }

    #[test]
    fn appends_complete_json_lines() {
        let dir = tempfile::tempdir().unwrap();
        let log = AuditLog::new(dir.path().join("security-coach-audit.jsonl"));

        log.append(
            AuditEvent::AlertCreated,
            serde_json::json!({"alert_id": "abc", "level": "block"}),
        );
        log.append(AuditEvent::ConfigUpdated, serde_json::json!({}));

        let records = lines(log.path());
        assert_eq!(records.len(), 2);
        assert_eq!(records[0]["type"], "alert.created");
        assert_eq!(records[0]["alert_id"], "abc");
        assert!(records[0]["ts"].as_u64().unwrap() > 0);
        assert_eq!(records[1]["type"], "config.updated");
    }

    #[test]
    fn event_type_strings() {
        let json = serde_json::to_string(&AuditEvent::AlertAutoAllowed).unwrap();
        assert_eq!(json, "\"alert.auto_allowed\"");
        let json = serde_json::to_string(&AuditEvent::HygieneScan).unwrap();
        assert_eq!(json, "\"hygiene.scan\"");
    }

    #[test]
    fn failures_are_swallowed_and_counted() {
        let dir = tempfile::tempdir().unwrap();
        // A directory at the target path makes every append fail.
        let path = dir.path().join("security-coach-audit.jsonl");
        std::fs::create_dir(&path).unwrap();

        let log = AuditLog::new(path);
        log.append(AuditEvent::AlertCreated, serde_json::json!({}));
        log.append(AuditEvent::AlertExpired, serde_json::json!({}));
        assert_eq!(log.dropped_entries(), 2);
    }

    #[test]
    fn rotation_renames_live_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("security-coach-audit.jsonl");
        // Pre-fill the live file past the rotation threshold.
        let big = "x".repeat(ROTATE_AT_BYTES as usize + 10);
        std::fs::write(&path, &big).unwrap();

        let log = AuditLog::new(path.clone());
        log.append(AuditEvent::AlertCreated, serde_json::json!({}));

        // The oversize file was renamed aside; the live file is fresh or
        // absent depending on whether another append landed after.
        let rotated: Vec<_> = std::fs::read_dir(dir.path())
            .unwrap()
            .filter_map(|e| e.ok())
            .map(|e| e.file_name().to_string_lossy().into_owned())
            .filter(|name| name.starts_with("security-coach-audit.") && name != "security-coach-audit.jsonl")
            .collect();
        assert_eq!(rotated.len(), 1);
        assert!(std::fs::metadata(&path).map(|m| m.len()).unwrap_or(0) < ROTATE_AT_BYTES);
    }

    #[test]
    fn rotated_path_shape() {
        let p = rotated_path(std::path::Path::new("/state/security-coach-audit.jsonl"), 1234);
        assert_eq!(
            p,
            std::path::Path::new("/state/security-coach-audit.1234.jsonl")
        );
    }

    #[cfg(unix)]
    #[test]
    fn symlinked_log_is_refused() {
        let dir = tempfile::tempdir().unwrap();
        let real = dir.path().join("real.jsonl");
        std::fs::write(&real, "").unwrap();
        let path = dir.path().join("security-coach-audit.jsonl");
        std::os::unix::fs::symlink(&real, &path).unwrap();

        let log = AuditLog::new(path);
        log.append(AuditEvent::AlertCreated, serde_json::json!({}));
        assert_eq!(log.dropped_entries(), 1);
        assert_eq!(std::fs::read_to_string(&real).unwrap(), "");
    }
}
