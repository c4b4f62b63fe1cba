use std::collections::{HashMap, VecDeque};
use std::hash::{DefaultHasher, Hash, Hasher};
use std::sync::Mutex;

use serde::Serialize;

use crate::types::{MatchInput, now_ms};

use super::ThreatMatch;

/// Content cap applied to `content` before fingerprinting.
const FINGERPRINT_CONTENT_CAP: usize = 500;

/// Size- and TTL-bounded LRU cache from input fingerprint to match result.
///
/// The fingerprint is a non-cryptographic hash over the canonical string of
/// the input's non-empty fields; two inputs share an entry only if they are
/// identical after canonicalization.
pub struct MatchCache {
    capacity: usize,
    ttl_ms: u64,
    inner: Mutex<CacheInner>,
}

struct CacheInner {
    entries: HashMap<u64, CacheEntry>,
    /// Access order, least-recently-used at the front.
    order: VecDeque<u64>,
    hits: u64,
    misses: u64,
}

struct CacheEntry {
    matches: Vec<ThreatMatch>,
    inserted_at_ms: u64,
    hits: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct CacheStats {
    pub entries: usize,
    pub capacity: usize,
    pub hits: u64,
    pub misses: u64,
    pub hit_rate: f64,
    pub avg_hits_per_entry: f64,
}

/// Non-cryptographic fingerprint of a match input.
pub fn fingerprint(input: &MatchInput) -> u64 {
    let mut hasher = DefaultHasher::new();
    for (name, value) in input.canonical_fields(FINGERPRINT_CONTENT_CAP) {
        name.hash(&mut hasher);
        value.hash(&mut hasher);
    }
    hasher.finish()
}

impl MatchCache {
    pub fn new(capacity: usize, ttl_ms: u64) -> Self {
        Self {
            capacity: capacity.max(1),
            ttl_ms,
            inner: Mutex::new(CacheInner {
                entries: HashMap::new(),
                order: VecDeque::new(),
                hits: 0,
                misses: 0,
            }),
        }
    }

    /// Look up a cached result. An entry older than the TTL is deleted and
    /// reported as a miss.
    pub fn get(&self, input: &MatchInput) -> Option<Vec<ThreatMatch>> {
        let key = fingerprint(input);
        let now = now_ms();
        let mut inner = self.inner.lock().unwrap_or_else(|p| p.into_inner());

        let expired = match inner.entries.get(&key) {
            None => {
                inner.misses += 1;
                return None;
            }
            Some(entry) => now.saturating_sub(entry.inserted_at_ms) > self.ttl_ms,
        };

        if expired {
            inner.entries.remove(&key);
            inner.order.retain(|k| *k != key);
            inner.misses += 1;
            return None;
        }

        inner.hits += 1;
        // Move to most-recently-used position.
        inner.order.retain(|k| *k != key);
        inner.order.push_back(key);
        let entry = inner.entries.get_mut(&key)?;
        entry.hits += 1;
        Some(entry.matches.clone())
    }

    /// Insert a result, evicting the least-recently-accessed entry when over
    /// capacity.
    pub fn set(&self, input: &MatchInput, matches: Vec<ThreatMatch>) {
        let key = fingerprint(input);
        let mut inner = self.inner.lock().unwrap_or_else(|p| p.into_inner());

        if inner.entries.contains_key(&key) {
            inner.order.retain(|k| *k != key);
        }
        inner.entries.insert(
            key,
            CacheEntry {
                matches,
                inserted_at_ms: now_ms(),
                hits: 0,
            },
        );
        inner.order.push_back(key);

        while inner.entries.len() > self.capacity {
            if let Some(oldest) = inner.order.pop_front() {
                inner.entries.remove(&oldest);
            } else {
                break;
            }
        }
    }

    /// Drop all expired entries, returning how many were removed.
    pub fn prune(&self) -> usize {
        let now = now_ms();
        let ttl = self.ttl_ms;
        let mut inner = self.inner.lock().unwrap_or_else(|p| p.into_inner());
        let before = inner.entries.len();
        inner
            .entries
            .retain(|_, e| now.saturating_sub(e.inserted_at_ms) <= ttl);
        let removed = before - inner.entries.len();
        if removed > 0 {
            let live: std::collections::HashSet<u64> = inner.entries.keys().copied().collect();
            inner.order.retain(|k| live.contains(k));
        }
        removed
    }

    pub fn clear(&self) {
        let mut inner = self.inner.lock().unwrap_or_else(|p| p.into_inner());
        inner.entries.clear();
        inner.order.clear();
    }

    pub fn stats(&self) -> CacheStats {
        let inner = self.inner.lock().unwrap_or_else(|p| p.into_inner());
        let lookups = inner.hits + inner.misses;
        let entry_hits: u64 = inner.entries.values().map(|e| e.hits).sum();
        CacheStats {
            entries: inner.entries.len(),
            capacity: self.capacity,
            hits: inner.hits,
            misses: inner.misses,
            hit_rate: if lookups == 0 {
                0.0
            } else {
                inner.hits as f64 / lookups as f64
            },
            avg_hits_per_entry: if inner.entries.is_empty() {
                0.0
            } else {
                entry_hits as f64 / inner.entries.len() as f64
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::matcher::match_threats;

    fn cmd(command: &str) -> MatchInput {
        MatchInput {
            command: Some(command.to_string()),
            ..Default::default()
        }
    }

    #[test]
    fn round_trip_within_ttl() {
        let cache = MatchCache::new(10, 60_000);
        let input = cmd("rm -rf /");
        let matches = match_threats(&input);
        assert!(!matches.is_empty());

        cache.set(&input, matches.clone());
        let got = cache.get(&input).expect("cache hit");
        let got_ids: Vec<&str> = got.iter().map(|m| m.pattern.id).collect();
        let want_ids: Vec<&str> = matches.iter().map(|m| m.pattern.id).collect();
        assert_eq!(got_ids, want_ids);
    }

    #[test]
    fn miss_on_unknown_input() {
        let cache = MatchCache::new(10, 60_000);
        assert!(cache.get(&cmd("ls")).is_none());
        let stats = cache.stats();
        assert_eq!(stats.misses, 1);
        assert_eq!(stats.hits, 0);
    }

    #[test]
    fn lru_evicts_least_recently_accessed() {
        let cache = MatchCache::new(3, 60_000);
        let inputs: Vec<MatchInput> = (0..4).map(|i| cmd(&format!("echo {i}"))).collect();

        cache.set(&inputs[0], vec![]);
        cache.set(&inputs[1], vec![]);
        cache.set(&inputs[2], vec![]);
        // Touch 0 so 1 becomes least-recently-used.
        assert!(cache.get(&inputs[0]).is_some());
        cache.set(&inputs[3], vec![]);

        assert!(cache.get(&inputs[1]).is_none(), "LRU entry evicted");
        assert!(cache.get(&inputs[0]).is_some());
        assert!(cache.get(&inputs[2]).is_some());
        assert!(cache.get(&inputs[3]).is_some());
    }

    #[test]
    fn eviction_count_matches_overflow() {
        let capacity = 5;
        let cache = MatchCache::new(capacity, 60_000);
        let k = 9;
        for i in 0..k {
            cache.set(&cmd(&format!("distinct {i}")), vec![]);
        }
        assert_eq!(cache.stats().entries, capacity);
        // Exactly k - capacity oldest keys are gone.
        let mut evicted = 0;
        for i in 0..k {
            if cache.get(&cmd(&format!("distinct {i}"))).is_none() {
                evicted += 1;
            }
        }
        assert_eq!(evicted, k - capacity);
    }

    #[test]
    fn ttl_expiry_counts_as_miss() {
        let cache = MatchCache::new(10, 30);
        let input = cmd("ls -la");
        cache.set(&input, vec![]);
        assert!(cache.get(&input).is_some());

        std::thread::sleep(std::time::Duration::from_millis(60));
        assert!(cache.get(&input).is_none());
        let stats = cache.stats();
        assert_eq!(stats.entries, 0);
        assert_eq!(stats.misses, 1);
    }

    #[test]
    fn prune_removes_only_expired() {
        let cache = MatchCache::new(10, 40);
        cache.set(&cmd("old"), vec![]);
        std::thread::sleep(std::time::Duration::from_millis(70));
        cache.set(&cmd("fresh"), vec![]);

        assert_eq!(cache.prune(), 1);
        assert_eq!(cache.stats().entries, 1);
        assert!(cache.get(&cmd("fresh")).is_some());
    }

    #[test]
    fn clear_empties_everything() {
        let cache = MatchCache::new(10, 60_000);
        cache.set(&cmd("a"), vec![]);
        cache.set(&cmd("b"), vec![]);
        cache.clear();
        assert_eq!(cache.stats().entries, 0);
        assert!(cache.get(&cmd("a")).is_none());
    }

    #[test]
    fn stats_rates() {
        let cache = MatchCache::new(10, 60_000);
        let input = cmd("cargo build");
        cache.set(&input, vec![]);
        assert!(cache.get(&input).is_some());
        assert!(cache.get(&input).is_some());
        assert!(cache.get(&cmd("other")).is_none());

        let stats = cache.stats();
        assert_eq!(stats.hits, 2);
        assert_eq!(stats.misses, 1);
        assert!((stats.hit_rate - 2.0 / 3.0).abs() < 1e-9);
        assert!((stats.avg_hits_per_entry - 2.0).abs() < 1e-9);
    }

    #[test]
    fn fingerprint_distinguishes_fields() {
        // Same text in different fields must not collide after
        // canonicalization.
        let as_command = cmd("hello");
        let as_content = MatchInput {
            content: Some("hello".into()),
            ..Default::default()
        };
        assert_ne!(fingerprint(&as_command), fingerprint(&as_content));
    }

    #[test]
    fn fingerprint_ignores_content_past_cap() {
        let mut long_a = String::from("prefix ");
        long_a.push_str(&"a".repeat(600));
        let mut long_b = long_a.clone();
        long_b.push_str("different tail past the cap");

        let a = MatchInput {
            content: Some(long_a),
            ..Default::default()
        };
        let b = MatchInput {
            content: Some(long_b),
            ..Default::default()
        };
        assert_eq!(fingerprint(&a), fingerprint(&b));
    }
}
