use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::error::Result;
use crate::statedir;
use crate::types::ThreatSeverity;

pub const MIN_DECISION_TIMEOUT_MS: u64 = 5_000;
pub const MAX_DECISION_TIMEOUT_MS: u64 = 300_000;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CoachConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Matches strictly below this severity are discarded before any
    /// decisioning.
    #[serde(default = "default_min_severity")]
    pub min_severity: ThreatSeverity,

    /// Whether a critical pattern hit produces a blocking alert (otherwise
    /// it warns).
    #[serde(default = "default_true")]
    pub block_on_critical: bool,

    /// How long a blocking alert waits for the human before expiring.
    #[serde(default = "default_decision_timeout_ms")]
    pub decision_timeout_ms: u64,

    /// Emit non-blocking educational tips for suppressed and informational
    /// findings.
    #[serde(default)]
    pub educational_mode: bool,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub llm_judge: Option<LlmJudgeConfig>,

    /// Offload pattern matching to the worker pool.
    #[serde(default)]
    pub use_worker_threads: bool,

    #[serde(default = "default_true")]
    pub use_cache: bool,

    #[serde(default = "default_cache_size")]
    pub cache_size: usize,

    #[serde(default = "default_cache_ttl_ms")]
    pub cache_ttl_ms: u64,

    #[serde(default)]
    pub throttle: ThrottleConfig,
}

// -- LLM judge ------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LlmJudgeConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,

    #[serde(default = "default_judge_model")]
    pub model: String,

    /// Wall-clock budget for one judge call.
    #[serde(default = "default_judge_latency_ms")]
    pub max_latency_ms: u64,

    /// Verdicts below this confidence are ignored (0..=100).
    #[serde(default = "default_confidence_threshold")]
    pub confidence_threshold: u8,

    /// Ask the judge to confirm or override non-critical pattern hits.
    #[serde(default = "default_true")]
    pub confirm_pattern_matches: bool,

    /// On judge failure, fall back to the pattern verdict instead of
    /// propagating the error.
    #[serde(default = "default_true")]
    pub fallback_to_patterns: bool,

    #[serde(default = "default_true")]
    pub cache_enabled: bool,

    #[serde(default = "default_judge_cache_ttl_ms")]
    pub cache_ttl_ms: u64,

    #[serde(default = "default_judge_max_tokens")]
    pub max_tokens: u32,

    /// Pattern severities the judge is consulted for.
    #[serde(default = "default_llm_severities")]
    pub use_llm_for_severity: Vec<ThreatSeverity>,
}

// -- Throttle --------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ThrottleConfig {
    /// Same (pattern, context) pair within this window is suppressed.
    #[serde(default = "default_dedup_window_ms")]
    pub dedup_window_ms: u64,

    /// Same pattern within this window is suppressed.
    #[serde(default = "default_pattern_cooldown_ms")]
    pub pattern_cooldown_ms: u64,

    /// Any alert within this window of the previous one is suppressed.
    #[serde(default = "default_global_cooldown_ms")]
    pub global_cooldown_ms: u64,

    /// New alerts are refused while this many are already pending.
    #[serde(default = "default_max_pending_alerts")]
    pub max_pending_alerts: usize,
}

// -- Defaults --------------------------------------------------------------

fn default_true() -> bool {
    true
}
fn default_min_severity() -> ThreatSeverity {
    ThreatSeverity::Low
}
fn default_decision_timeout_ms() -> u64 {
    30_000
}
fn default_cache_size() -> usize {
    500
}
fn default_cache_ttl_ms() -> u64 {
    60_000
}
fn default_judge_model() -> String {
    "sonnet".to_string()
}
fn default_judge_latency_ms() -> u64 {
    3_000
}
fn default_confidence_threshold() -> u8 {
    70
}
fn default_judge_cache_ttl_ms() -> u64 {
    300_000
}
fn default_judge_max_tokens() -> u32 {
    1024
}
fn default_llm_severities() -> Vec<ThreatSeverity> {
    vec![ThreatSeverity::Medium, ThreatSeverity::High]
}
fn default_dedup_window_ms() -> u64 {
    300_000
}
fn default_pattern_cooldown_ms() -> u64 {
    60_000
}
fn default_global_cooldown_ms() -> u64 {
    2_000
}
fn default_max_pending_alerts() -> usize {
    50
}

impl Default for CoachConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            min_severity: default_min_severity(),
            block_on_critical: true,
            decision_timeout_ms: default_decision_timeout_ms(),
            educational_mode: false,
            llm_judge: None,
            use_worker_threads: false,
            use_cache: true,
            cache_size: default_cache_size(),
            cache_ttl_ms: default_cache_ttl_ms(),
            throttle: ThrottleConfig::default(),
        }
    }
}

impl Default for LlmJudgeConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            model: default_judge_model(),
            max_latency_ms: default_judge_latency_ms(),
            confidence_threshold: default_confidence_threshold(),
            confirm_pattern_matches: true,
            fallback_to_patterns: true,
            cache_enabled: true,
            cache_ttl_ms: default_judge_cache_ttl_ms(),
            max_tokens: default_judge_max_tokens(),
            use_llm_for_severity: default_llm_severities(),
        }
    }
}

impl Default for ThrottleConfig {
    fn default() -> Self {
        Self {
            dedup_window_ms: default_dedup_window_ms(),
            pattern_cooldown_ms: default_pattern_cooldown_ms(),
            global_cooldown_ms: default_global_cooldown_ms(),
            max_pending_alerts: default_max_pending_alerts(),
        }
    }
}

impl CoachConfig {
    /// Clamp out-of-range values, warning for each correction. Applied on
    /// load and on every host-driven update; direct struct construction in
    /// tests bypasses it on purpose.
    pub fn sanitize(&mut self) {
        if !(MIN_DECISION_TIMEOUT_MS..=MAX_DECISION_TIMEOUT_MS).contains(&self.decision_timeout_ms)
        {
            let clamped = self
                .decision_timeout_ms
                .clamp(MIN_DECISION_TIMEOUT_MS, MAX_DECISION_TIMEOUT_MS);
            warn!(
                requested = self.decision_timeout_ms,
                clamped, "decision_timeout_ms out of range"
            );
            self.decision_timeout_ms = clamped;
        }
        if self.cache_size == 0 {
            warn!("cache_size of 0 is not usable, using default");
            self.cache_size = default_cache_size();
        }
        if let Some(judge) = &mut self.llm_judge {
            if judge.confidence_threshold > 100 {
                warn!(
                    requested = judge.confidence_threshold,
                    "confidence_threshold above 100, clamping"
                );
                judge.confidence_threshold = 100;
            }
        }
    }

    /// Load the config snapshot from disk. A missing file yields defaults;
    /// a corrupt file is backed up and replaced by defaults.
    pub fn load(path: &Path) -> Self {
        let raw = match std::fs::read_to_string(path) {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Self::default();
            }
            Err(e) => {
                warn!(path = %path.display(), error = %e, "cannot read config, using defaults");
                return Self::default();
            }
        };

        let mut config: Self = match serde_json::from_str(&raw) {
            Ok(c) => c,
            Err(e) => {
                warn!(path = %path.display(), error = %e, "corrupt config file, using defaults");
                if let Ok(backup) = statedir::backup_corrupt(path) {
                    warn!(backup = %backup.display(), "corrupt config backed up");
                }
                return Self::default();
            }
        };
        config.sanitize();
        info!(path = %path.display(), enabled = config.enabled, "security coach config loaded");
        config
    }

    /// Persist the full snapshot atomically with mode `0o600`.
    pub fn save(&self, path: &Path) -> Result<()> {
        let bytes = serde_json::to_vec_pretty(self)?;
        statedir::atomic_replace(path, &bytes)
    }
}
