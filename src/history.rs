use std::path::PathBuf;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use serde::{Deserialize, Serialize};
use tracing::{error, warn};
use uuid::Uuid;

use crate::audit::ROTATE_AT_BYTES;
use crate::statedir;
use crate::types::{CoachAlertLevel, CoachDecision, ThreatCategory, ThreatSeverity, now_ms};

/// One resolved (or expired) alert, as persisted to history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoryRecord {
    pub id: Uuid,
    pub level: CoachAlertLevel,
    pub title: String,
    pub severity: ThreatSeverity,
    pub category: ThreatCategory,
    pub pattern_ids: Vec<String>,
    /// None when the alert expired without a decision.
    pub decision: Option<CoachDecision>,
    pub resolved_by: Option<String>,
    pub created_at_ms: u64,
    pub resolved_at_ms: u64,
    pub duration_ms: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context: Option<String>,
}

/// Filters for querying history. All optional; `limit` defaults to 50.
#[derive(Debug, Clone, Default)]
pub struct HistoryQuery {
    pub since_ms: Option<u64>,
    pub until_ms: Option<u64>,
    pub level: Option<CoachAlertLevel>,
    pub severity: Option<ThreatSeverity>,
    pub decision: Option<Option<CoachDecision>>,
    pub category: Option<ThreatCategory>,
    pub limit: Option<usize>,
    pub offset: Option<usize>,
}

#[derive(Debug, Clone, Serialize)]
pub struct HistoryPage {
    pub entries: Vec<HistoryRecord>,
    pub total: usize,
}

/// Append-only JSONL history of resolved alerts, with the same rotation and
/// failure-swallowing shape as the audit log.
pub struct AlertHistory {
    path: PathBuf,
    write_lock: Mutex<()>,
    rotating: AtomicBool,
    dropped_entries: AtomicU64,
}

impl AlertHistory {
    pub fn new(path: PathBuf) -> Self {
        Self {
            path,
            write_lock: Mutex::new(()),
            rotating: AtomicBool::new(false),
            dropped_entries: AtomicU64::new(0),
        }
    }

    pub fn append(&self, record: &HistoryRecord) {
        let line = match serde_json::to_string(record) {
            Ok(line) => line,
            Err(e) => {
                self.dropped_entries.fetch_add(1, Ordering::SeqCst);
                error!(error = %e, "history record not serializable, dropped");
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
                error!(error = %e, path = %self.path.display(), "history append failed, dropped");
            }
        }
    }

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
            let stem = self
                .path
                .file_stem()
                .map(|s| s.to_string_lossy().into_owned())
                .unwrap_or_else(|| "history".to_string());
            let rotated = self.path.with_file_name(format!("{stem}.{}.jsonl", now_ms()));
            statedir::ensure_not_symlink(&rotated)?;
            std::fs::rename(&self.path, &rotated)?;
            Ok(rotated)
        })();

        match result {
            Ok(rotated) => warn!(rotated = %rotated.display(), "alert history rotated"),
            Err(e) => error!(error = %e, "history rotation failed"),
        }
        self.rotating.store(false, Ordering::SeqCst);
    }

    /// Query the live history file. Entries are newest-first by
    /// `resolved_at_ms`; `total` counts everything matching the filters
    /// before pagination.
    pub fn query(&self, query: &HistoryQuery) -> HistoryPage {
        let _guard = self.write_lock.lock().unwrap_or_else(|p| p.into_inner());
        let raw = std::fs::read_to_string(&self.path).unwrap_or_default();
        drop(_guard);

        let mut matching: Vec<HistoryRecord> = raw
            .lines()
            .filter_map(|line| serde_json::from_str::<HistoryRecord>(line).ok())
            .filter(|r| query.since_ms.is_none_or(|since| r.resolved_at_ms >= since))
            .filter(|r| query.until_ms.is_none_or(|until| r.resolved_at_ms <= until))
            .filter(|r| query.level.is_none_or(|level| r.level == level))
            .filter(|r| query.severity.is_none_or(|sev| r.severity == sev))
            .filter(|r| {
                query
                    .decision
                    .as_ref()
                    .is_none_or(|decision| r.decision == *decision)
            })
            .filter(|r| query.category.is_none_or(|cat| r.category == cat))
            .collect();

        matching.sort_by(|a, b| b.resolved_at_ms.cmp(&a.resolved_at_ms));
        let total = matching.len();

        let offset = query.offset.unwrap_or(0).min(total);
        let limit = query.limit.unwrap_or(50);
        let entries = matching.into_iter().skip(offset).take(limit).collect();

        HistoryPage { entries, total }
    }

    pub fn dropped_entries(&self) -> u64 {
        self.dropped_entries.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(
        title: &str,
        level: CoachAlertLevel,
        severity: ThreatSeverity,
        decision: Option<CoachDecision>,
        resolved_at_ms: u64,
    ) -> HistoryRecord {
        HistoryRecord {
            id: Uuid::new_v4(),
            level,
            title: title.to_string(),
            severity,
            category: ThreatCategory::DestructiveOperation,
            pattern_ids: vec!["destruct-rm-root".into()],
            decision,
            resolved_by: decision.map(|_| "user".to_string()),
            created_at_ms: resolved_at_ms.saturating_sub(500),
            resolved_at_ms,
            duration_ms: 500,
            context: None,
        }
    }

    fn history(dir: &tempfile::TempDir) -> AlertHistory {
        AlertHistory::new(dir.path().join("security-coach-history.jsonl"))
    }

    #[test]
    fn append_and_query_newest_first() {
        let dir = tempfile::tempdir().unwrap();
        let history = history(&dir);
        history.append(&record("old", CoachAlertLevel::Warn, ThreatSeverity::High, Some(CoachDecision::AllowOnce), 1_000));
        history.append(&record("new", CoachAlertLevel::Block, ThreatSeverity::Critical, Some(CoachDecision::Deny), 2_000));
        history.append(&record("mid", CoachAlertLevel::Warn, ThreatSeverity::High, None, 1_500));

        let page = history.query(&HistoryQuery::default());
        assert_eq!(page.total, 3);
        let titles: Vec<&str> = page.entries.iter().map(|e| e.title.as_str()).collect();
        assert_eq!(titles, vec!["new", "mid", "old"]);
    }

    #[test]
    fn filters_apply() {
        let dir = tempfile::tempdir().unwrap();
        let history = history(&dir);
        history.append(&record("a", CoachAlertLevel::Block, ThreatSeverity::Critical, Some(CoachDecision::Deny), 1_000));
        history.append(&record("b", CoachAlertLevel::Warn, ThreatSeverity::High, Some(CoachDecision::AllowOnce), 2_000));
        history.append(&record("c", CoachAlertLevel::Warn, ThreatSeverity::High, None, 3_000));

        let blocks = history.query(&HistoryQuery {
            level: Some(CoachAlertLevel::Block),
            ..Default::default()
        });
        assert_eq!(blocks.total, 1);
        assert_eq!(blocks.entries[0].title, "a");

        let undecided = history.query(&HistoryQuery {
            decision: Some(None),
            ..Default::default()
        });
        assert_eq!(undecided.total, 1);
        assert_eq!(undecided.entries[0].title, "c");

        let denied = history.query(&HistoryQuery {
            decision: Some(Some(CoachDecision::Deny)),
            ..Default::default()
        });
        assert_eq!(denied.total, 1);

        let windowed = history.query(&HistoryQuery {
            since_ms: Some(1_500),
            until_ms: Some(2_500),
            ..Default::default()
        });
        assert_eq!(windowed.total, 1);
        assert_eq!(windowed.entries[0].title, "b");
    }

    #[test]
    fn pagination_with_total() {
        let dir = tempfile::tempdir().unwrap();
        let history = history(&dir);
        for i in 0..10 {
            history.append(&record(
                &format!("r{i}"),
                CoachAlertLevel::Inform,
                ThreatSeverity::Low,
                None,
                1_000 + i,
            ));
        }

        let page = history.query(&HistoryQuery {
            limit: Some(3),
            offset: Some(4),
            ..Default::default()
        });
        assert_eq!(page.total, 10);
        assert_eq!(page.entries.len(), 3);
        assert_eq!(page.entries[0].title, "r5");
    }

    #[test]
    fn decision_null_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let history = history(&dir);
        history.append(&record("expired", CoachAlertLevel::Block, ThreatSeverity::Critical, None, 1_000));

        let raw = std::fs::read_to_string(dir.path().join("security-coach-history.jsonl")).unwrap();
        let value: serde_json::Value = serde_json::from_str(raw.lines().next().unwrap()).unwrap();
        assert!(value["decision"].is_null());

        let page = history.query(&HistoryQuery::default());
        assert_eq!(page.entries[0].decision, None);
    }

    #[test]
    fn failures_swallowed_and_counted() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("security-coach-history.jsonl");
        std::fs::create_dir(&path).unwrap();
        let history = AlertHistory::new(path);
        history.append(&record("x", CoachAlertLevel::Warn, ThreatSeverity::High, None, 1));
        assert_eq!(history.dropped_entries(), 1);
    }
}
