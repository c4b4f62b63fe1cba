use std::path::PathBuf;
use std::sync::Mutex;

use serde::{Deserialize, Serialize};
use tracing::{info, warn};
use uuid::Uuid;

use crate::error::{CoachError, Result};
use crate::statedir;
use crate::types::now_ms;

const RULE_FILE_VERSION: u32 = 1;

/// Standing decision a rule applies automatically.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RuleDecision {
    Allow,
    Deny,
}

impl RuleDecision {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Allow => "allow",
            Self::Deny => "deny",
        }
    }
}

impl std::fmt::Display for RuleDecision {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A persisted user decision that short-circuits future evaluations.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Rule {
    pub id: Uuid,
    pub pattern_id: String,
    /// When set, the rule applies only to this exact evaluated value; when
    /// unset, it applies to every hit of the pattern.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub match_value: Option<String>,
    pub decision: RuleDecision,
    pub created_at_ms: u64,
    /// 0 = never expires.
    #[serde(default)]
    pub expires_at_ms: u64,
    #[serde(default)]
    pub hit_count: u64,
    #[serde(default)]
    pub last_hit_at_ms: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub note: Option<String>,
}

impl Rule {
    pub fn is_expired_at(&self, now: u64) -> bool {
        self.expires_at_ms != 0 && self.expires_at_ms <= now
    }

    pub fn is_expired(&self) -> bool {
        self.is_expired_at(now_ms())
    }
}

/// Fields supplied when creating a rule; ids and timestamps are assigned by
/// the store.
#[derive(Debug, Clone)]
pub struct NewRule {
    pub pattern_id: String,
    pub match_value: Option<String>,
    pub decision: RuleDecision,
    pub expires_at_ms: u64,
    pub note: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct RuleSummary {
    pub total: usize,
    pub allow: usize,
    pub deny: usize,
    pub active: usize,
    pub expired: usize,
}

#[derive(Debug, Serialize, Deserialize)]
struct RuleFile {
    version: u32,
    rules: Vec<Rule>,
}

/// Durable rule store backed by `security-coach-rules.json`.
///
/// The in-memory vector is exclusively owned here; all access goes through
/// methods. Saves are serialized into a chain so the on-disk state always
/// reflects a complete snapshot from some prefix of the save calls.
pub struct RuleStore {
    path: PathBuf,
    rules: Mutex<Vec<Rule>>,
    save_chain: tokio::sync::Mutex<()>,
}

impl RuleStore {
    /// Load from disk. A missing file starts empty; a corrupt file is
    /// backed up to `<path>.corrupt.<ts>` and the store starts empty.
    pub fn load(path: PathBuf) -> Self {
        let rules = match std::fs::read_to_string(&path) {
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Vec::new(),
            Err(e) => {
                warn!(path = %path.display(), error = %e, "cannot read rules file, starting empty");
                Vec::new()
            }
            Ok(raw) => match serde_json::from_str::<RuleFile>(&raw) {
                Ok(file) => {
                    if file.version != RULE_FILE_VERSION {
                        warn!(version = file.version, "unexpected rules file version");
                    }
                    info!(path = %path.display(), rules = file.rules.len(), "rules loaded");
                    file.rules
                }
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "corrupt rules file, starting empty");
                    match statedir::backup_corrupt(&path) {
                        Ok(backup) => {
                            warn!(backup = %backup.display(), "corrupt rules file backed up")
                        }
                        Err(e) => warn!(error = %e, "could not back up corrupt rules file"),
                    }
                    Vec::new()
                }
            },
        };

        Self {
            path,
            rules: Mutex::new(rules),
            save_chain: tokio::sync::Mutex::new(()),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Vec<Rule>> {
        self.rules.lock().unwrap_or_else(|p| p.into_inner())
    }

    /// Atomic save: snapshot under the chain lock, write to a uuid-suffixed
    /// tmp file, chmod 0600, rename over the target.
    pub async fn save(&self) -> Result<()> {
        let _chain = self.save_chain.lock().await;
        let snapshot = RuleFile {
            version: RULE_FILE_VERSION,
            rules: self.lock().clone(),
        };
        let bytes = serde_json::to_vec_pretty(&snapshot)?;
        let path = self.path.clone();
        tokio::task::spawn_blocking(move || statedir::atomic_replace(&path, &bytes))
            .await
            .map_err(|e| CoachError::RuleStore(format!("save task failed: {e}")))?
    }

    /// Create and persist a rule. On save failure the rule is rolled back
    /// so memory stays consistent with disk.
    pub async fn add_rule(&self, fields: NewRule) -> Result<Rule> {
        let rule = Rule {
            id: Uuid::new_v4(),
            pattern_id: fields.pattern_id,
            match_value: fields.match_value,
            decision: fields.decision,
            created_at_ms: now_ms(),
            expires_at_ms: fields.expires_at_ms,
            hit_count: 0,
            last_hit_at_ms: 0,
            note: fields.note,
        };
        self.lock().push(rule.clone());

        if let Err(e) = self.save().await {
            self.lock().retain(|r| r.id != rule.id);
            return Err(e);
        }
        info!(rule = %rule.id, pattern = %rule.pattern_id, decision = %rule.decision, "rule created");
        Ok(rule)
    }

    /// Remove a rule by id. Returns the removed rule, or None if unknown.
    pub async fn remove_rule(&self, id: Uuid) -> Result<Option<Rule>> {
        let removed = {
            let mut rules = self.lock();
            match rules.iter().position(|r| r.id == id) {
                Some(pos) => Some(rules.remove(pos)),
                None => None,
            }
        };
        let Some(rule) = removed else {
            return Ok(None);
        };

        if let Err(e) = self.save().await {
            self.lock().push(rule);
            return Err(e);
        }
        info!(rule = %id, "rule deleted");
        Ok(Some(rule))
    }

    /// Find the rule governing `(pattern_id, match_value)`.
    ///
    /// Priority: exact match on both fields, else the pattern-only rule.
    /// Expired rules are returned; the caller decides what expiry means.
    pub fn find_rule(&self, pattern_id: &str, match_value: Option<&str>) -> Option<Rule> {
        let rules = self.lock();
        if let Some(value) = match_value {
            if let Some(rule) = rules
                .iter()
                .find(|r| r.pattern_id == pattern_id && r.match_value.as_deref() == Some(value))
            {
                return Some(rule.clone());
            }
        }
        rules
            .iter()
            .find(|r| r.pattern_id == pattern_id && r.match_value.is_none())
            .cloned()
    }

    /// Return the standing decision for `(pattern_id, match_value)` iff a
    /// non-expired rule governs it, recording exactly one hit on that rule.
    pub fn lookup(&self, pattern_id: &str, match_value: Option<&str>) -> Option<RuleDecision> {
        let governing = self.find_rule(pattern_id, match_value)?;
        let now = now_ms();
        if governing.is_expired_at(now) {
            return None;
        }

        let mut rules = self.lock();
        let rule = rules.iter_mut().find(|r| r.id == governing.id)?;
        rule.hit_count += 1;
        rule.last_hit_at_ms = now;
        Some(rule.decision)
    }

    /// Remove all expired rules, returning how many were pruned.
    pub async fn prune_expired(&self) -> Result<usize> {
        let now = now_ms();
        let removed: Vec<Rule> = {
            let mut rules = self.lock();
            let (expired, live): (Vec<Rule>, Vec<Rule>) =
                rules.drain(..).partition(|r| r.is_expired_at(now));
            *rules = live;
            expired
        };
        if removed.is_empty() {
            return Ok(0);
        }

        if let Err(e) = self.save().await {
            self.lock().extend(removed);
            return Err(e);
        }
        info!(pruned = removed.len(), "expired rules pruned");
        Ok(removed.len())
    }

    pub fn list(&self) -> Vec<Rule> {
        self.lock().clone()
    }

    pub fn get_summary(&self) -> RuleSummary {
        let now = now_ms();
        let rules = self.lock();
        let mut summary = RuleSummary {
            total: rules.len(),
            ..Default::default()
        };
        for rule in rules.iter() {
            match rule.decision {
                RuleDecision::Allow => summary.allow += 1,
                RuleDecision::Deny => summary.deny += 1,
            }
            if rule.is_expired_at(now) {
                summary.expired += 1;
            } else {
                summary.active += 1;
            }
        }
        summary
    }

    pub fn count(&self) -> usize {
        self.lock().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store(dir: &tempfile::TempDir) -> RuleStore {
        RuleStore::load(dir.path().join("security-coach-rules.json"))
    }

    fn allow_rule(pattern_id: &str) -> NewRule {
        NewRule {
            pattern_id: pattern_id.to_string(),
            match_value: None,
            decision: RuleDecision::Allow,
            expires_at_ms: 0,
            note: None,
        }
    }

    #[tokio::test]
    async fn add_and_lookup_records_hit() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(&dir);
        let rule = store.add_rule(allow_rule("privesc-sudo")).await.unwrap();
        assert_eq!(rule.hit_count, 0);

        let decision = store.lookup("privesc-sudo", Some("sudo apt update"));
        assert_eq!(decision, Some(RuleDecision::Allow));

        let after = store.find_rule("privesc-sudo", None).unwrap();
        assert_eq!(after.hit_count, 1);
        assert!(after.last_hit_at_ms > 0);
    }

    #[tokio::test]
    async fn exact_match_beats_pattern_only() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(&dir);
        store.add_rule(allow_rule("privesc-sudo")).await.unwrap();
        store
            .add_rule(NewRule {
                pattern_id: "privesc-sudo".into(),
                match_value: Some("sudo reboot".into()),
                decision: RuleDecision::Deny,
                expires_at_ms: 0,
                note: None,
            })
            .await
            .unwrap();

        assert_eq!(
            store.lookup("privesc-sudo", Some("sudo reboot")),
            Some(RuleDecision::Deny)
        );
        assert_eq!(
            store.lookup("privesc-sudo", Some("sudo apt update")),
            Some(RuleDecision::Allow)
        );
        assert_eq!(store.lookup("privesc-sudo", None), Some(RuleDecision::Allow));
    }

    #[tokio::test]
    async fn expired_rule_found_but_not_applied() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(&dir);
        store
            .add_rule(NewRule {
                pattern_id: "privesc-sudo".into(),
                match_value: None,
                decision: RuleDecision::Allow,
                expires_at_ms: now_ms() - 1,
                note: None,
            })
            .await
            .unwrap();

        // find_rule returns it, lookup refuses it.
        let found = store.find_rule("privesc-sudo", None).unwrap();
        assert!(found.is_expired());
        assert_eq!(store.lookup("privesc-sudo", None), None);
        assert_eq!(store.find_rule("privesc-sudo", None).unwrap().hit_count, 0);
    }

    #[tokio::test]
    async fn lookup_unknown_pattern_is_none() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(&dir);
        assert_eq!(store.lookup("no-such-pattern", None), None);
    }

    #[tokio::test]
    async fn prune_removes_only_expired() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(&dir);
        store.add_rule(allow_rule("a")).await.unwrap();
        store
            .add_rule(NewRule {
                expires_at_ms: now_ms() - 10,
                ..allow_rule("b")
            })
            .await
            .unwrap();
        store
            .add_rule(NewRule {
                expires_at_ms: now_ms() + 60_000,
                ..allow_rule("c")
            })
            .await
            .unwrap();

        assert_eq!(store.prune_expired().await.unwrap(), 1);
        assert_eq!(store.count(), 2);
        assert!(store.find_rule("b", None).is_none());
    }

    #[tokio::test]
    async fn summary_counts() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(&dir);
        store.add_rule(allow_rule("a")).await.unwrap();
        store
            .add_rule(NewRule {
                decision: RuleDecision::Deny,
                ..allow_rule("b")
            })
            .await
            .unwrap();
        store
            .add_rule(NewRule {
                expires_at_ms: now_ms() - 10,
                ..allow_rule("c")
            })
            .await
            .unwrap();

        let summary = store.get_summary();
        assert_eq!(summary.total, 3);
        assert_eq!(summary.allow, 2);
        assert_eq!(summary.deny, 1);
        assert_eq!(summary.active, 2);
        assert_eq!(summary.expired, 1);
    }

    #[tokio::test]
    async fn persists_and_reloads() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("security-coach-rules.json");
        {
            let store = RuleStore::load(path.clone());
            store.add_rule(allow_rule("privesc-sudo")).await.unwrap();
            store.add_rule(allow_rule("net-tor")).await.unwrap();
            store.remove_rule(store.list()[1].id).await.unwrap();
        }

        let raw = std::fs::read_to_string(&path).unwrap();
        let parsed: serde_json::Value = serde_json::from_str(&raw).unwrap();
        assert_eq!(parsed["version"], 1);
        assert_eq!(parsed["rules"].as_array().unwrap().len(), 1);

        let reloaded = RuleStore::load(path);
        assert_eq!(reloaded.count(), 1);
        assert!(reloaded.find_rule("privesc-sudo", None).is_some());
    }

    #[tokio::test]
    async fn corrupt_file_backed_up_and_empty() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("security-coach-rules.json");
        std::fs::write(&path, "][ not json").unwrap();

        let store = RuleStore::load(path.clone());
        assert_eq!(store.count(), 0);
        assert!(!path.exists());

        let backups: Vec<_> = std::fs::read_dir(dir.path())
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().contains(".corrupt."))
            .collect();
        assert_eq!(backups.len(), 1);
    }

    #[tokio::test]
    async fn remove_unknown_rule_is_none() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(&dir);
        assert!(store.remove_rule(Uuid::new_v4()).await.unwrap().is_none());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn save_through_symlink_refused() {
        let dir = tempfile::tempdir().unwrap();
        let real = dir.path().join("elsewhere.json");
        std::fs::write(&real, r#"{"version":1,"rules":[]}"#).unwrap();
        let path = dir.path().join("security-coach-rules.json");
        std::os::unix::fs::symlink(&real, &path).unwrap();

        let store = RuleStore::load(path);
        let err = store.add_rule(allow_rule("a")).await.unwrap_err();
        assert!(matches!(err, CoachError::SymlinkRefused(_)));
        // Rolled back: memory still consistent with (refused) disk.
        assert_eq!(store.count(), 0);
    }

    #[tokio::test]
    async fn concurrent_saves_serialize() {
        let dir = tempfile::tempdir().unwrap();
        let store = std::sync::Arc::new(store(&dir));
        let mut handles = Vec::new();
        for i in 0..8 {
            let store = store.clone();
            handles.push(tokio::spawn(async move {
                store.add_rule(allow_rule(&format!("p{i}"))).await
            }));
        }
        for handle in handles {
            handle.await.unwrap().unwrap();
        }
        // On-disk state is the final complete snapshot.
        let reloaded = RuleStore::load(dir.path().join("security-coach-rules.json"));
        assert_eq!(reloaded.count(), 8);
    }
}
