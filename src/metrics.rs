use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;

use serde::Serialize;

use crate::types::{ThreatCategory, ThreatSeverity, now_ms};

/// Circular-buffer capacity for decision durations.
pub const MAX_DECISION_TIMES: usize = 1_000;

const HOUR_MS: u64 = 3_600_000;

/// In-memory engine metrics: lifetime counters, two rolling-hour windows,
/// decision-time percentiles, and per-pattern/category/severity breakdowns.
pub struct Metrics {
    inner: Mutex<MetricsInner>,
}

#[derive(Default)]
struct MetricsInner {
    alerts_total: u64,
    blocks: u64,
    allows: u64,
    denies: u64,
    expired: u64,
    auto_allowed: u64,
    auto_denied: u64,
    tips: u64,
    hygiene_scans: u64,
    hygiene_findings: u64,
    dropped_entries: u64,
    /// Rolling windows of emit timestamps, pruned on read.
    alerts_window: VecDeque<u64>,
    blocks_window: VecDeque<u64>,
    /// Fixed-size circular buffer of decision durations.
    decision_times: Vec<u64>,
    decision_next: usize,
    by_category: HashMap<ThreatCategory, u64>,
    by_severity: HashMap<ThreatSeverity, u64>,
    pattern_counts: HashMap<String, u64>,
    last_alert_at_ms: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct MetricsSnapshot {
    pub alerts_total: u64,
    pub blocks: u64,
    pub allows: u64,
    pub denies: u64,
    pub expired: u64,
    pub auto_allowed: u64,
    pub auto_denied: u64,
    pub tips: u64,
    pub hygiene_scans: u64,
    pub hygiene_findings: u64,
    pub dropped_entries: u64,
    pub alerts_last_hour: usize,
    pub blocks_last_hour: usize,
    pub avg_decision_ms: f64,
    pub median_decision_ms: f64,
    pub by_category: HashMap<String, u64>,
    pub by_severity: HashMap<String, u64>,
    /// Top patterns by alert frequency, most frequent first, capped at 20.
    pub top_patterns: Vec<(String, u64)>,
    pub last_alert_at_ms: u64,
}

impl Metrics {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(MetricsInner::default()),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, MetricsInner> {
        self.inner.lock().unwrap_or_else(|p| p.into_inner())
    }

    /// Record an emitted alert with its contributing patterns.
    pub fn record_alert(
        &self,
        severity: ThreatSeverity,
        category: ThreatCategory,
        pattern_ids: &[String],
    ) {
        let now = now_ms();
        let mut inner = self.lock();
        inner.alerts_total += 1;
        inner.alerts_window.push_back(now);
        inner.last_alert_at_ms = now;
        *inner.by_category.entry(category).or_insert(0) += 1;
        *inner.by_severity.entry(severity).or_insert(0) += 1;
        for id in pattern_ids {
            *inner.pattern_counts.entry(id.clone()).or_insert(0) += 1;
        }
    }

    pub fn record_block(&self) {
        let now = now_ms();
        let mut inner = self.lock();
        inner.blocks += 1;
        inner.blocks_window.push_back(now);
    }

    pub fn record_allow(&self) {
        self.lock().allows += 1;
    }

    pub fn record_deny(&self) {
        self.lock().denies += 1;
    }

    pub fn record_expired(&self) {
        self.lock().expired += 1;
    }

    pub fn record_auto_allow(&self) {
        self.lock().auto_allowed += 1;
    }

    pub fn record_auto_deny(&self) {
        self.lock().auto_denied += 1;
    }

    pub fn record_tip(&self) {
        self.lock().tips += 1;
    }

    pub fn record_hygiene_scan(&self, findings: u64) {
        let mut inner = self.lock();
        inner.hygiene_scans += 1;
        inner.hygiene_findings += findings;
    }

    pub fn record_dropped_entry(&self) {
        self.lock().dropped_entries += 1;
    }

    /// Record how long one evaluation took, into the circular buffer.
    pub fn record_decision_time(&self, ms: u64) {
        let mut inner = self.lock();
        if inner.decision_times.len() < MAX_DECISION_TIMES {
            inner.decision_times.push(ms);
        } else {
            let slot = inner.decision_next;
            inner.decision_times[slot] = ms;
        }
        inner.decision_next = (inner.decision_next + 1) % MAX_DECISION_TIMES;
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        let now = now_ms();
        let mut inner = self.lock();

        // Prune rolling windows on read.
        while inner
            .alerts_window
            .front()
            .is_some_and(|t| now.saturating_sub(*t) > HOUR_MS)
        {
            inner.alerts_window.pop_front();
        }
        while inner
            .blocks_window
            .front()
            .is_some_and(|t| now.saturating_sub(*t) > HOUR_MS)
        {
            inner.blocks_window.pop_front();
        }

        let (avg, median) = decision_stats(&inner.decision_times);

        let mut top: Vec<(String, u64)> = inner
            .pattern_counts
            .iter()
            .map(|(k, v)| (k.clone(), *v))
            .collect();
        top.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
        top.truncate(20);

        MetricsSnapshot {
            alerts_total: inner.alerts_total,
            blocks: inner.blocks,
            allows: inner.allows,
            denies: inner.denies,
            expired: inner.expired,
            auto_allowed: inner.auto_allowed,
            auto_denied: inner.auto_denied,
            tips: inner.tips,
            hygiene_scans: inner.hygiene_scans,
            hygiene_findings: inner.hygiene_findings,
            dropped_entries: inner.dropped_entries,
            alerts_last_hour: inner.alerts_window.len(),
            blocks_last_hour: inner.blocks_window.len(),
            avg_decision_ms: avg,
            median_decision_ms: median,
            by_category: inner
                .by_category
                .iter()
                .map(|(k, v)| (k.as_str().to_string(), *v))
                .collect(),
            by_severity: inner
                .by_severity
                .iter()
                .map(|(k, v)| (k.as_str().to_string(), *v))
                .collect(),
            top_patterns: top,
            last_alert_at_ms: inner.last_alert_at_ms,
        }
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

fn decision_stats(times: &[u64]) -> (f64, f64) {
    if times.is_empty() {
        return (0.0, 0.0);
    }
    let sum: u64 = times.iter().sum();
    let avg = sum as f64 / times.len() as f64;

    let mut sorted: Vec<u64> = times.to_vec();
    sorted.sort_unstable();
    let mid = sorted.len() / 2;
    let median = if sorted.len() % 2 == 0 {
        (sorted[mid - 1] + sorted[mid]) as f64 / 2.0
    } else {
        sorted[mid] as f64
    };
    (avg, median)
}
