use std::collections::HashMap;
use std::sync::Mutex;

use serde::Serialize;
use tracing::debug;

use crate::config::ThrottleConfig;
use crate::types::{MatchInput, now_ms};

/// Why a candidate alert was suppressed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SuppressReason {
    Duplicate,
    PatternCooldown,
    GlobalCooldown,
    PendingOverflow,
}

impl SuppressReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Duplicate => "duplicate",
            Self::PatternCooldown => "pattern cooldown",
            Self::GlobalCooldown => "global cooldown",
            Self::PendingOverflow => "pending overflow",
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ThrottleStats {
    pub suppressed_by_dedup: u64,
    pub suppressed_by_pattern: u64,
    pub suppressed_by_global: u64,
    pub suppressed_by_overflow: u64,
    pub recorded_alerts: u64,
}

struct ThrottleInner {
    /// (pattern_id, context_key) -> last emit ms.
    dedup: HashMap<(String, String), u64>,
    /// pattern_id -> last emit ms.
    pattern_last: HashMap<String, u64>,
    last_alert_ms: u64,
    stats: ThrottleStats,
}

/// Suppression policy preventing alert storms.
///
/// Four gates, evaluated in order: dedup window, per-pattern cooldown,
/// global cooldown, pending overflow. Already-pending alerts are never
/// evicted; the overflow gate only refuses new ones.
pub struct Throttle {
    config: ThrottleConfig,
    inner: Mutex<ThrottleInner>,
}

/// Build the dedup context key from the fields that identify "the same
/// alert happening again". Null-byte joined so content containing `|`
/// cannot forge a different key.
pub fn context_key(input: &MatchInput) -> String {
    let content_head: String = input
        .content
        .as_deref()
        .unwrap_or("")
        .chars()
        .take(100)
        .collect();
    [
        input.tool_name.as_deref().unwrap_or(""),
        input.command.as_deref().unwrap_or(""),
        input.channel_id.as_deref().unwrap_or(""),
        &content_head,
    ]
    .join("\0")
}

impl Throttle {
    pub fn new(config: ThrottleConfig) -> Self {
        Self {
            config,
            inner: Mutex::new(ThrottleInner {
                dedup: HashMap::new(),
                pattern_last: HashMap::new(),
                last_alert_ms: 0,
                stats: ThrottleStats::default(),
            }),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, ThrottleInner> {
        self.inner.lock().unwrap_or_else(|p| p.into_inner())
    }

    /// Decide whether a candidate alert must be suppressed, incrementing the
    /// suppression counter for the matching reason. `pending_count` is the
    /// engine's current pending-alert count.
    pub fn should_suppress(
        &self,
        pattern_id: &str,
        context_key: &str,
        pending_count: usize,
    ) -> Option<SuppressReason> {
        let now = now_ms();
        let mut inner = self.lock();

        let dedup_key = (pattern_id.to_string(), context_key.to_string());
        if let Some(last) = inner.dedup.get(&dedup_key) {
            if now.saturating_sub(*last) < self.config.dedup_window_ms {
                inner.stats.suppressed_by_dedup += 1;
                debug!(pattern = pattern_id, "alert suppressed: duplicate");
                return Some(SuppressReason::Duplicate);
            }
        }

        if let Some(last) = inner.pattern_last.get(pattern_id) {
            if now.saturating_sub(*last) < self.config.pattern_cooldown_ms {
                inner.stats.suppressed_by_pattern += 1;
                debug!(pattern = pattern_id, "alert suppressed: pattern cooldown");
                return Some(SuppressReason::PatternCooldown);
            }
        }

        if inner.last_alert_ms != 0
            && now.saturating_sub(inner.last_alert_ms) < self.config.global_cooldown_ms
        {
            inner.stats.suppressed_by_global += 1;
            debug!(pattern = pattern_id, "alert suppressed: global cooldown");
            return Some(SuppressReason::GlobalCooldown);
        }

        if pending_count >= self.config.max_pending_alerts {
            inner.stats.suppressed_by_overflow += 1;
            debug!(
                pattern = pattern_id,
                pending = pending_count,
                "alert suppressed: pending overflow"
            );
            return Some(SuppressReason::PendingOverflow);
        }

        None
    }

    /// Record a successfully emitted alert: updates the pattern cooldown,
    /// the global last-alert timestamp, and the dedup map.
    pub fn record_alert(&self, pattern_id: &str, context_key: &str) {
        let now = now_ms();
        let mut inner = self.lock();
        inner
            .dedup
            .insert((pattern_id.to_string(), context_key.to_string()), now);
        inner.pattern_last.insert(pattern_id.to_string(), now);
        inner.last_alert_ms = now;
        inner.stats.recorded_alerts += 1;
    }

    /// Purge entries whose windows have fully elapsed. Callers invoke this
    /// every N evaluations.
    pub fn cleanup(&self) {
        let now = now_ms();
        let dedup_window = self.config.dedup_window_ms;
        let pattern_window = self.config.pattern_cooldown_ms;
        let mut inner = self.lock();
        inner
            .dedup
            .retain(|_, last| now.saturating_sub(*last) < dedup_window);
        inner
            .pattern_last
            .retain(|_, last| now.saturating_sub(*last) < pattern_window);
    }

    pub fn stats(&self) -> ThrottleStats {
        self.lock().stats.clone()
    }
}
