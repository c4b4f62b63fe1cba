use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, Instant};

use serde::Serialize;
use tokio::sync::oneshot;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::audit::{AuditEvent, AuditLog};
use crate::coaching::{CopyBuilder, PatternCopy};
use crate::config::CoachConfig;
use crate::error::Result;
use crate::history::{AlertHistory, HistoryRecord};
use crate::judge::{ChatClient, JudgeVerdict, LlmJudge, should_use_llm};
use crate::matcher::{self, ThreatMatch, cache::MatchCache, pool::WorkerPool};
use crate::metrics::Metrics;
use crate::rules::{NewRule, RuleDecision, RuleStore};
use crate::siem::{SiemDispatcher, SiemEvent};
use crate::statedir::StateDir;
use crate::types::{
    AlertThreat, CoachAlert, CoachAlertLevel, CoachDecision, MatchInput, ThreatCategory,
    ThreatSeverity, now_ms,
};

/// Hard cap on alerts pending a decision, across all sessions.
pub const MAX_PENDING_ALERTS: usize = 100;

/// Per-session pending cap.
pub const MAX_PENDING_PER_SESSION: usize = 20;

/// Session bucket used when no session key is supplied.
pub const GLOBAL_SESSION_BUCKET: &str = "__global__";

// -- Evaluation outcome -----------------------------------------------------

/// Where the verdict came from. These strings are telemetry-visible;
/// changing one is an interface change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum EvalSource {
    #[serde(rename = "disabled")]
    Disabled,
    #[serde(rename = "rule")]
    Rule,
    #[serde(rename = "pattern")]
    Pattern,
    #[serde(rename = "hybrid-llm-override")]
    HybridLlmOverride,
    #[serde(rename = "llm")]
    Llm,
    #[serde(rename = "none")]
    None,
}

#[derive(Debug, Clone, Serialize)]
pub struct EvalOutcome {
    pub allowed: bool,
    pub alert: Option<CoachAlert>,
    pub auto_decision: Option<RuleDecision>,
    pub auto_pattern_id: Option<String>,
    pub llm_result: Option<JudgeVerdict>,
    pub source: EvalSource,
}

impl EvalOutcome {
    fn allow(source: EvalSource) -> Self {
        Self {
            allowed: true,
            alert: None,
            auto_decision: None,
            auto_pattern_id: None,
            llm_result: None,
            source,
        }
    }
}

// -- Pending alerts ---------------------------------------------------------

struct PendingAlert {
    alert: CoachAlert,
    /// Set on first wait; resolvers must then supply the same key.
    session_key: Option<String>,
    /// Which per-session bucket this alert was counted against.
    bucket: Option<String>,
    waiters: Vec<oneshot::Sender<Option<CoachDecision>>>,
    timer: tokio::task::JoinHandle<()>,
    /// Evaluated value a future allow-always rule should be scoped to.
    rule_match_value: Option<String>,
}

// -- Engine -----------------------------------------------------------------

/// Construction options: the host's LLM client, SIEM pipeline, and persona
/// copy generator all plug in here.
#[derive(Default)]
pub struct EngineOptions {
    pub chat_client: Option<Arc<dyn ChatClient>>,
    pub siem: Option<Arc<SiemDispatcher>>,
    pub copy_builder: Option<Box<dyn CopyBuilder>>,
}

/// The decision pipeline: matcher (with cache and workers) → rule store →
/// LLM judge → alert construction → human arbitration.
pub struct CoachEngine {
    config: RwLock<CoachConfig>,
    state: StateDir,
    rules: Arc<RuleStore>,
    cache: Option<MatchCache>,
    pool: Option<WorkerPool>,
    judge: Option<LlmJudge>,
    copy: Box<dyn CopyBuilder>,
    pending: Mutex<HashMap<Uuid, PendingAlert>>,
    session_counts: Mutex<HashMap<String, usize>>,
    audit: Arc<AuditLog>,
    history: Arc<AlertHistory>,
    metrics: Arc<Metrics>,
    siem: Option<Arc<SiemDispatcher>>,
    shut_down: AtomicBool,
}

impl CoachEngine {
    pub fn new(config: CoachConfig, state: StateDir, options: EngineOptions) -> Arc<Self> {
        let rules = Arc::new(RuleStore::load(state.rules_path()));
        let audit = Arc::new(AuditLog::new(state.audit_path()));
        let history = Arc::new(AlertHistory::new(state.history_path()));

        let cache = config
            .use_cache
            .then(|| MatchCache::new(config.cache_size, config.cache_ttl_ms));
        let pool = config.use_worker_threads.then(|| WorkerPool::new(0));
        let judge = match (&config.llm_judge, options.chat_client) {
            (Some(judge_config), Some(client)) => {
                Some(LlmJudge::new(judge_config.clone(), client))
            }
            _ => None,
        };

        info!(
            enabled = config.enabled,
            cache = cache.is_some(),
            workers = pool.as_ref().map(|p| p.size()).unwrap_or(0),
            judge = judge.is_some(),
            "coach engine initialized"
        );

        Arc::new(Self {
            config: RwLock::new(config),
            state,
            rules,
            cache,
            pool,
            judge,
            copy: options.copy_builder.unwrap_or_else(|| Box::new(PatternCopy)),
            pending: Mutex::new(HashMap::new()),
            session_counts: Mutex::new(HashMap::new()),
            audit,
            history,
            metrics: Arc::new(Metrics::new()),
            siem: options.siem,
            shut_down: AtomicBool::new(false),
        })
    }

    pub fn rules(&self) -> &Arc<RuleStore> {
        &self.rules
    }

    pub fn audit(&self) -> &Arc<AuditLog> {
        &self.audit
    }

    pub fn history(&self) -> &Arc<AlertHistory> {
        &self.history
    }

    pub fn metrics(&self) -> &Arc<Metrics> {
        &self.metrics
    }

    pub fn get_config(&self) -> CoachConfig {
        self.config.read().unwrap_or_else(|p| p.into_inner()).clone()
    }

    /// Apply and persist a new config snapshot. Out-of-range values are
    /// clamped with a warning before anything is written.
    pub async fn update_config(&self, mut new_config: CoachConfig) -> Result<()> {
        new_config.sanitize();
        new_config.save(&self.state.config_path())?;
        {
            let mut config = self.config.write().unwrap_or_else(|p| p.into_inner());
            *config = new_config;
        }
        self.audit
            .append(AuditEvent::ConfigUpdated, serde_json::json!({}));
        Ok(())
    }

    pub fn pending_count(&self) -> usize {
        self.lock_pending().len()
    }

    fn lock_pending(&self) -> std::sync::MutexGuard<'_, HashMap<Uuid, PendingAlert>> {
        self.pending.lock().unwrap_or_else(|p| p.into_inner())
    }

    // -- Evaluation ---------------------------------------------------------

    /// Evaluate one input through cache → workers → matcher → rules → LLM,
    /// building an alert when nothing auto-resolves. Failures in the match
    /// path are recovered silently; durable-output failures never surface.
    pub async fn evaluate(self: &Arc<Self>, input: &MatchInput) -> EvalOutcome {
        let started = Instant::now();
        let config = self.get_config();
        if !config.enabled {
            return EvalOutcome::allow(EvalSource::Disabled);
        }

        let mut matches = self.obtain_matches(input, &config).await;
        matches.retain(|m| m.pattern.severity >= config.min_severity);

        let match_value = rule_match_value(input);
        let outcome = if matches
            .first()
            .is_some_and(|m| m.pattern.severity == ThreatSeverity::Critical)
        {
            self.decide_critical(input, &matches, match_value.as_deref(), &config)
        } else if !matches.is_empty() {
            self.decide_flagged(input, &matches, match_value.as_deref(), &config)
                .await
        } else {
            self.decide_clean(input, &config).await
        };

        self.metrics
            .record_decision_time(started.elapsed().as_millis() as u64);
        outcome
    }

    /// Critical branch: rules may auto-resolve, but the LLM is never
    /// consulted to downgrade a critical pattern hit.
    fn decide_critical(
        self: &Arc<Self>,
        input: &MatchInput,
        matches: &[ThreatMatch],
        match_value: Option<&str>,
        config: &CoachConfig,
    ) -> EvalOutcome {
        let criticals: Vec<ThreatMatch> = matches
            .iter()
            .filter(|m| m.pattern.severity == ThreatSeverity::Critical)
            .cloned()
            .collect();
        let representative = &criticals[0];

        if let Some(outcome) = self.apply_rule(representative.pattern.id, match_value) {
            return outcome;
        }

        let alert = self.build_alert_from_matches(&criticals, config);
        self.emit_alert(&alert, match_value, EvalSource::Pattern);
        EvalOutcome {
            allowed: false,
            alert: Some(alert),
            auto_decision: None,
            auto_pattern_id: None,
            llm_result: None,
            source: EvalSource::Pattern,
        }
    }

    /// Non-critical hits: rules first, then the judge may confirm or
    /// override, otherwise the pattern alert stands.
    async fn decide_flagged(
        self: &Arc<Self>,
        input: &MatchInput,
        matches: &[ThreatMatch],
        match_value: Option<&str>,
        config: &CoachConfig,
    ) -> EvalOutcome {
        let representative = &matches[0];
        if let Some(outcome) = self.apply_rule(representative.pattern.id, match_value) {
            return outcome;
        }

        if let Some(judge) = &self.judge {
            let consult = judge
                .config()
                .use_llm_for_severity
                .contains(&representative.pattern.severity);
            if consult {
                match judge.confirm_pattern_match(input, matches).await {
                    Ok(Some(verdict)) => {
                        let confident = verdict.confidence >= judge.config().confidence_threshold;
                        if !verdict.is_threat && confident {
                            debug!(
                                pattern = representative.pattern.id,
                                confidence = verdict.confidence,
                                "LLM overrode pattern hit"
                            );
                            let mut outcome = EvalOutcome::allow(EvalSource::HybridLlmOverride);
                            outcome.llm_result = Some(verdict);
                            return outcome;
                        }
                        if verdict.is_threat {
                            let alert = self.build_alert_from_verdict(&verdict, config);
                            self.emit_alert(&alert, match_value, EvalSource::Llm);
                            return EvalOutcome {
                                allowed: false,
                                alert: Some(alert),
                                auto_decision: None,
                                auto_pattern_id: None,
                                llm_result: Some(verdict),
                                source: EvalSource::Llm,
                            };
                        }
                        // A low-confidence all-clear: the pattern alert stands.
                    }
                    Ok(None) => {}
                    Err(e) => {
                        // Only reachable with fallback_to_patterns = false;
                        // the pattern verdict still governs the decision.
                        warn!(error = %e, "judge confirmation failed");
                    }
                }
            }
        }

        let alert = self.build_alert_from_matches(matches, config);
        self.emit_alert(&alert, match_value, EvalSource::Pattern);
        let blocked = alert.requires_decision;
        EvalOutcome {
            allowed: !blocked,
            alert: Some(alert),
            auto_decision: None,
            auto_pattern_id: None,
            llm_result: None,
            source: EvalSource::Pattern,
        }
    }

    /// No pattern hits: the judge may still assess interesting inputs.
    async fn decide_clean(self: &Arc<Self>, input: &MatchInput, config: &CoachConfig) -> EvalOutcome {
        if let Some(judge) = &self.judge {
            if judge.enabled() && should_use_llm(input) {
                match judge.evaluate(input).await {
                    Ok(Some(verdict))
                        if verdict.is_threat
                            && verdict.confidence >= judge.config().confidence_threshold =>
                    {
                        let alert = self.build_alert_from_verdict(&verdict, config);
                        self.emit_alert(&alert, rule_match_value(input).as_deref(), EvalSource::Llm);
                        let blocked = alert.requires_decision;
                        return EvalOutcome {
                            allowed: !blocked,
                            alert: Some(alert),
                            auto_decision: None,
                            auto_pattern_id: None,
                            llm_result: Some(verdict),
                            source: EvalSource::Llm,
                        };
                    }
                    Ok(_) => {}
                    Err(e) => warn!(error = %e, "judge evaluation failed"),
                }
            }
        }
        EvalOutcome::allow(EvalSource::None)
    }

    /// Consult the rule store; a standing decision short-circuits the alert.
    fn apply_rule(&self, pattern_id: &str, match_value: Option<&str>) -> Option<EvalOutcome> {
        let decision = self.rules.lookup(pattern_id, match_value)?;
        match decision {
            RuleDecision::Allow => {
                self.metrics.record_auto_allow();
                self.audit.append(
                    AuditEvent::AlertAutoAllowed,
                    serde_json::json!({"pattern_id": pattern_id, "match_value": match_value}),
                );
                self.enqueue_siem(SiemEvent::auto_decision(
                    "alert.auto_allowed",
                    pattern_id,
                    "allow",
                ));
            }
            RuleDecision::Deny => {
                self.metrics.record_auto_deny();
                self.audit.append(
                    AuditEvent::AlertAutoDenied,
                    serde_json::json!({"pattern_id": pattern_id, "match_value": match_value}),
                );
                self.enqueue_siem(SiemEvent::auto_decision(
                    "alert.auto_denied",
                    pattern_id,
                    "deny",
                ));
            }
        }
        Some(EvalOutcome {
            allowed: decision == RuleDecision::Allow,
            alert: None,
            auto_decision: Some(decision),
            auto_pattern_id: Some(pattern_id.to_string()),
            llm_result: None,
            source: EvalSource::Rule,
        })
    }

    /// Cache → worker → main-thread matcher. A worker failure always falls
    /// back to the main thread; the engine never observes a pool error.
    async fn obtain_matches(&self, input: &MatchInput, config: &CoachConfig) -> Vec<ThreatMatch> {
        if config.use_cache {
            if let Some(cache) = &self.cache {
                if let Some(hit) = cache.get(input) {
                    return hit;
                }
            }
        }

        let matches = match (&self.pool, config.use_worker_threads) {
            (Some(pool), true) => match pool.match_threats(input).await {
                Ok(matches) => matches,
                Err(e) => {
                    warn!(error = %e, "worker pool failed, matching on main thread");
                    matcher::match_threats(input)
                }
            },
            _ => matcher::match_threats(input),
        };

        if config.use_cache {
            if let Some(cache) = &self.cache {
                cache.set(input, matches.clone());
            }
        }
        matches
    }

    // -- Alert construction -------------------------------------------------

    fn build_alert_from_matches(&self, matches: &[ThreatMatch], config: &CoachConfig) -> CoachAlert {
        let threats: Vec<AlertThreat> = matches.iter().map(|m| m.to_alert_threat()).collect();
        let severity = threats
            .iter()
            .map(|t| t.severity)
            .max()
            .unwrap_or(ThreatSeverity::Info);
        let level = level_for(severity, config.block_on_critical);
        let copy = self.copy.build(&threats, level);
        assemble_alert(threats, level, copy.title, copy.message, copy.recommendation, config)
    }

    fn build_alert_from_verdict(&self, verdict: &JudgeVerdict, config: &CoachConfig) -> CoachAlert {
        let level = level_for(verdict.severity, config.block_on_critical);
        let threats = vec![AlertThreat {
            pattern_id: "llm-judge".to_string(),
            title: "Flagged by security review".to_string(),
            severity: verdict.severity,
            category: verdict.category,
            context: None,
        }];
        assemble_alert(
            threats,
            level,
            "Flagged by security review".to_string(),
            verdict.reasoning.clone(),
            verdict.recommendation.clone(),
            config,
        )
    }

    /// Record a new alert everywhere it needs to exist: pending table (for
    /// decision-bearing levels), audit, metrics, SIEM.
    fn emit_alert(self: &Arc<Self>, alert: &CoachAlert, match_value: Option<&str>, source: EvalSource) {
        let severity = alert.max_severity().unwrap_or(ThreatSeverity::Info);
        let category = alert
            .threats
            .first()
            .map(|t| t.category)
            .unwrap_or(ThreatCategory::Reconnaissance);
        let pattern_ids: Vec<String> =
            alert.threats.iter().map(|t| t.pattern_id.clone()).collect();

        if alert.requires_decision {
            self.register_pending(alert, match_value);
        }

        self.metrics.record_alert(severity, category, &pattern_ids);
        if alert.level == CoachAlertLevel::Block {
            self.metrics.record_block();
        }
        self.audit.append(
            AuditEvent::AlertCreated,
            serde_json::json!({
                "alert_id": alert.id,
                "level": alert.level,
                "title": alert.title,
                "severity": severity,
                "pattern_ids": pattern_ids,
                "source": source,
            }),
        );
        self.enqueue_siem(SiemEvent::alert("alert.created", alert));
    }

    fn register_pending(self: &Arc<Self>, alert: &CoachAlert, match_value: Option<&str>) {
        if self.shut_down.load(Ordering::SeqCst) {
            return;
        }
        let mut pending = self.lock_pending();
        if pending.len() >= MAX_PENDING_ALERTS {
            warn!(
                alert = %alert.id,
                pending = pending.len(),
                "pending-alert cap reached, alert will fail closed"
            );
            return;
        }

        let engine = Arc::clone(self);
        let id = alert.id;
        let timeout = Duration::from_millis(alert.timeout_ms);
        let timer = tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            engine.expire(id);
        });

        pending.insert(
            id,
            PendingAlert {
                alert: alert.clone(),
                session_key: None,
                bucket: None,
                waiters: Vec::new(),
                timer,
                rule_match_value: match_value.map(String::from),
            },
        );
    }

    // -- Decision arbitration -----------------------------------------------

    /// Await the human decision for an alert.
    ///
    /// Returns `None` immediately when the alert is unknown (global cap or
    /// already terminal) or when the per-session cap is reached; callers
    /// treat `None` as deny for blocking alerts. All concurrent waiters on
    /// one id observe the identical final decision.
    pub async fn wait_for_decision(
        &self,
        alert_id: Uuid,
        session_key: Option<&str>,
    ) -> Option<CoachDecision> {
        if self.shut_down.load(Ordering::SeqCst) {
            return None;
        }

        let rx = {
            let mut pending = self.lock_pending();
            let entry = pending.get_mut(&alert_id)?;

            if entry.bucket.is_none() {
                // First waiter registers the alert against its session.
                let bucket = session_key.unwrap_or(GLOBAL_SESSION_BUCKET).to_string();
                let mut counts = self
                    .session_counts
                    .lock()
                    .unwrap_or_else(|p| p.into_inner());
                let count = counts.entry(bucket.clone()).or_insert(0);
                if *count >= MAX_PENDING_PER_SESSION {
                    warn!(bucket = %bucket, "per-session pending cap reached");
                    return None;
                }
                *count += 1;
                entry.bucket = Some(bucket);
                entry.session_key = session_key.map(String::from);
            }

            let (tx, rx) = oneshot::channel();
            entry.waiters.push(tx);
            rx
        };

        rx.await.ok().flatten()
    }

    /// Deliver a decision to an alert's waiters.
    ///
    /// Session affinity: when the alert was registered with a session key,
    /// a resolver with a different (or missing) key is refused and the
    /// alert stays pending. Success cancels the timer, clears the entry,
    /// and fans the decision out to every waiter.
    pub async fn resolve(
        &self,
        alert_id: Uuid,
        decision: CoachDecision,
        session_key: Option<&str>,
        resolved_by: Option<&str>,
    ) -> bool {
        let entry = {
            let mut pending = self.lock_pending();
            let affine = match pending.get(&alert_id) {
                None => return false,
                Some(entry) => match &entry.session_key {
                    Some(bound) => session_key == Some(bound.as_str()),
                    None => true,
                },
            };
            if !affine {
                debug!(alert = %alert_id, "resolve refused: session key mismatch");
                return false;
            }
            match pending.remove(&alert_id) {
                Some(entry) => entry,
                None => return false,
            }
        };

        entry.timer.abort();
        self.release_bucket(entry.bucket.as_deref());
        for waiter in entry.waiters {
            waiter.send(Some(decision)).ok();
        }

        let alert = &entry.alert;
        let resolved_at = now_ms();
        match decision {
            CoachDecision::AllowOnce | CoachDecision::AllowAlways => self.metrics.record_allow(),
            CoachDecision::Deny => self.metrics.record_deny(),
            CoachDecision::LearnMore => {}
        }
        self.audit.append(
            AuditEvent::AlertResolved,
            serde_json::json!({
                "alert_id": alert.id,
                "decision": decision,
                "resolved_by": resolved_by,
            }),
        );
        self.append_history(alert, Some(decision), resolved_by, resolved_at);
        self.enqueue_siem(SiemEvent::resolution(alert, decision.as_str(), resolved_by));

        if decision == CoachDecision::AllowAlways {
            self.create_rule_from_alert(alert, entry.rule_match_value.clone())
                .await;
        }
        info!(alert = %alert_id, decision = %decision, "alert resolved");
        true
    }

    /// Standing allow rule for an allow-always decision. A rule-save
    /// failure must not retract the already-delivered decision, so it is
    /// logged rather than propagated.
    async fn create_rule_from_alert(&self, alert: &CoachAlert, match_value: Option<String>) {
        let Some(pattern_id) = alert.primary_pattern_id() else {
            return;
        };
        let new_rule = NewRule {
            pattern_id: pattern_id.to_string(),
            match_value,
            decision: RuleDecision::Allow,
            expires_at_ms: 0,
            note: Some(format!("allow-always from alert {}", alert.id)),
        };
        match self.rules.add_rule(new_rule).await {
            Ok(rule) => {
                self.audit.append(
                    AuditEvent::RuleCreated,
                    serde_json::json!({
                        "rule_id": rule.id,
                        "pattern_id": rule.pattern_id,
                        "decision": rule.decision,
                    }),
                );
            }
            Err(e) => warn!(error = %e, "allow-always rule could not be persisted"),
        }
    }

    /// Quietly drop a pending alert the hooks layer decided to suppress:
    /// no waiters exist yet, so nothing is delivered and nothing is
    /// recorded beyond the suppression counters the throttle already keeps.
    pub fn discard_alert(&self, alert_id: Uuid) -> bool {
        let entry = {
            let mut pending = self.lock_pending();
            match pending.remove(&alert_id) {
                Some(entry) if entry.waiters.is_empty() => entry,
                Some(entry) => {
                    // Someone is already waiting; leave it alone.
                    pending.insert(alert_id, entry);
                    return false;
                }
                None => return false,
            }
        };
        entry.timer.abort();
        self.release_bucket(entry.bucket.as_deref());
        true
    }

    /// Timer expiry: all waiters observe `None`, the record lands in audit
    /// and history with a null decision.
    fn expire(&self, alert_id: Uuid) {
        let entry = {
            let mut pending = self.lock_pending();
            match pending.remove(&alert_id) {
                Some(entry) => entry,
                None => return,
            }
        };
        self.release_bucket(entry.bucket.as_deref());
        for waiter in entry.waiters {
            waiter.send(None).ok();
        }

        let alert = &entry.alert;
        self.metrics.record_expired();
        self.audit.append(
            AuditEvent::AlertExpired,
            serde_json::json!({"alert_id": alert.id, "level": alert.level}),
        );
        self.append_history(alert, None, None, now_ms());
        self.enqueue_siem(SiemEvent::alert("alert.expired", alert));
        debug!(alert = %alert_id, "alert expired without decision");
    }

    fn release_bucket(&self, bucket: Option<&str>) {
        let Some(bucket) = bucket else { return };
        let mut counts = self
            .session_counts
            .lock()
            .unwrap_or_else(|p| p.into_inner());
        if let Some(count) = counts.get_mut(bucket) {
            *count = count.saturating_sub(1);
            if *count == 0 {
                counts.remove(bucket);
            }
        }
    }

    fn append_history(
        &self,
        alert: &CoachAlert,
        decision: Option<CoachDecision>,
        resolved_by: Option<&str>,
        resolved_at_ms: u64,
    ) {
        let record = HistoryRecord {
            id: alert.id,
            level: alert.level,
            title: alert.title.clone(),
            severity: alert.max_severity().unwrap_or(ThreatSeverity::Info),
            category: alert
                .threats
                .first()
                .map(|t| t.category)
                .unwrap_or(ThreatCategory::Reconnaissance),
            pattern_ids: alert.threats.iter().map(|t| t.pattern_id.clone()).collect(),
            decision,
            resolved_by: resolved_by.map(String::from),
            created_at_ms: alert.created_at_ms,
            resolved_at_ms,
            duration_ms: resolved_at_ms.saturating_sub(alert.created_at_ms),
            context: alert.threats.first().and_then(|t| t.context.clone()),
        };
        self.history.append(&record);
    }

    fn enqueue_siem(&self, event: SiemEvent) {
        if let Some(siem) = &self.siem {
            siem.enqueue(event);
        }
    }

    /// Resolve every pending waiter to `None` and tear down shared state.
    pub fn shutdown(&self) {
        self.shut_down.store(true, Ordering::SeqCst);
        let drained: Vec<PendingAlert> = {
            let mut pending = self.lock_pending();
            pending.drain().map(|(_, entry)| entry).collect()
        };
        for entry in drained {
            entry.timer.abort();
            for waiter in entry.waiters {
                waiter.send(None).ok();
            }
        }
        self.session_counts
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .clear();
        if let Some(pool) = &self.pool {
            pool.shutdown();
        }
        info!("coach engine shut down");
    }

    #[cfg(test)]
    pub(crate) fn shutdown_pool_for_tests(&self) {
        if let Some(pool) = &self.pool {
            pool.shutdown();
        }
    }
}

fn level_for(severity: ThreatSeverity, block_on_critical: bool) -> CoachAlertLevel {
    match severity {
        ThreatSeverity::Critical => {
            if block_on_critical {
                CoachAlertLevel::Block
            } else {
                CoachAlertLevel::Warn
            }
        }
        ThreatSeverity::High | ThreatSeverity::Medium => CoachAlertLevel::Warn,
        ThreatSeverity::Low | ThreatSeverity::Info => CoachAlertLevel::Inform,
    }
}

/// The evaluated value standing rules are scoped to: the command, else the
/// URL, else the file path.
fn rule_match_value(input: &MatchInput) -> Option<String> {
    input
        .command
        .clone()
        .or_else(|| input.url.clone())
        .or_else(|| input.file_path.clone())
}

fn assemble_alert(
    threats: Vec<AlertThreat>,
    level: CoachAlertLevel,
    title: String,
    coach_message: String,
    recommendation: String,
    config: &CoachConfig,
) -> CoachAlert {
    let created_at_ms = now_ms();
    let timeout_ms = config.decision_timeout_ms;
    CoachAlert {
        id: Uuid::new_v4(),
        threats,
        level,
        title,
        coach_message,
        recommendation,
        timeout_ms,
        created_at_ms,
        expires_at_ms: created_at_ms + timeout_ms,
        requires_decision: matches!(level, CoachAlertLevel::Block | CoachAlertLevel::Warn),
    }
}
