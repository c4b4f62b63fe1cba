mod datadog;
mod sentinel;
mod splunk;

pub use datadog::DatadogAdapter;
pub use sentinel::SentinelAdapter;
pub use splunk::SplunkHecAdapter;

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use rand::Rng;
use serde::Serialize;
use tracing::{debug, error, warn};

use crate::error::{CoachError, Result};
use crate::types::{CoachAlert, ThreatCategory, ThreatSeverity};

/// One event shipped to external SIEMs. Timestamps here are ISO-8601; the
/// rest of the engine speaks epoch milliseconds.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SiemEvent {
    pub timestamp: String,
    pub host: String,
    pub source: String,
    pub event_type: String,
    pub severity: ThreatSeverity,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub alert_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub decision: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub resolved_by: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub category: Option<ThreatCategory>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pattern_id: Option<String>,
    #[serde(skip_serializing_if = "Vec::is_empty", default)]
    pub threats: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub context: Option<String>,
    #[serde(skip_serializing_if = "Vec::is_empty", default)]
    pub tags: Vec<String>,
}

fn hostname() -> String {
    std::env::var("HOSTNAME")
        .ok()
        .filter(|h| !h.is_empty())
        .unwrap_or_else(|| "unknown-host".to_string())
}

impl SiemEvent {
    fn base(event_type: &str, severity: ThreatSeverity) -> Self {
        Self {
            timestamp: chrono::Utc::now().to_rfc3339(),
            host: hostname(),
            source: "security-coach".to_string(),
            event_type: event_type.to_string(),
            severity,
            alert_id: None,
            title: None,
            message: None,
            decision: None,
            resolved_by: None,
            category: None,
            pattern_id: None,
            threats: Vec::new(),
            context: None,
            tags: Vec::new(),
        }
    }

    pub fn alert(event_type: &str, alert: &CoachAlert) -> Self {
        let mut event = Self::base(
            event_type,
            alert.max_severity().unwrap_or(ThreatSeverity::Info),
        );
        event.alert_id = Some(alert.id.to_string());
        event.title = Some(alert.title.clone());
        event.message = Some(alert.coach_message.clone());
        event.category = alert.threats.first().map(|t| t.category);
        event.pattern_id = alert.threats.first().map(|t| t.pattern_id.clone());
        event.threats = alert.threats.iter().map(|t| t.pattern_id.clone()).collect();
        event.context = alert.threats.first().and_then(|t| t.context.clone());
        event
    }

    pub fn resolution(alert: &CoachAlert, decision: &str, resolved_by: Option<&str>) -> Self {
        let mut event = Self::alert("alert.resolved", alert);
        event.decision = Some(decision.to_string());
        event.resolved_by = resolved_by.map(String::from);
        event
    }

    pub fn auto_decision(event_type: &str, pattern_id: &str, decision: &str) -> Self {
        let mut event = Self::base(event_type, ThreatSeverity::Info);
        event.pattern_id = Some(pattern_id.to_string());
        event.decision = Some(decision.to_string());
        event
    }
}

// -- Adapter seam -----------------------------------------------------------

/// A ready-to-POST HTTP request produced by an adapter.
#[derive(Debug, Clone, PartialEq)]
pub struct SiemRequest {
    pub url: String,
    pub headers: Vec<(String, String)>,
    pub body: String,
}

/// Formats a batch of events for one SIEM backend.
pub trait SiemAdapter: Send + Sync {
    fn name(&self) -> &str;
    fn format_batch(&self, events: &[SiemEvent]) -> Result<SiemRequest>;
}

// -- Dispatcher -------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct DispatcherConfig {
    /// Buffered events before the lowest-priority ones are dropped.
    pub buffer_capacity: usize,
    /// Events per shipped batch.
    pub batch_size: usize,
    pub max_retries: u32,
    pub retry_backoff_ms: u64,
    pub request_timeout_ms: u64,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            buffer_capacity: 1_000,
            batch_size: 50,
            max_retries: 3,
            retry_backoff_ms: 250,
            request_timeout_ms: 10_000,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct SiemStats {
    pub enqueued: u64,
    pub shipped: u64,
    pub dropped_overflow: u64,
    pub failed_batches: u64,
}

/// Buffers engine events, batches them, and ships each batch to every
/// destination with bounded retries. On buffer saturation the
/// lowest-severity buffered event is sacrificed first.
pub struct SiemDispatcher {
    config: DispatcherConfig,
    destinations: Vec<Box<dyn SiemAdapter>>,
    buffer: Mutex<VecDeque<SiemEvent>>,
    stats: Mutex<SiemStats>,
    http: reqwest::Client,
}

impl SiemDispatcher {
    pub fn new(config: DispatcherConfig, destinations: Vec<Box<dyn SiemAdapter>>) -> Arc<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_millis(config.request_timeout_ms))
            .build()
            .unwrap_or_default();
        Arc::new(Self {
            config,
            destinations,
            buffer: Mutex::new(VecDeque::new()),
            stats: Mutex::new(SiemStats::default()),
            http,
        })
    }

    fn lock_stats(&self) -> std::sync::MutexGuard<'_, SiemStats> {
        self.stats.lock().unwrap_or_else(|p| p.into_inner())
    }

    /// Non-blocking enqueue. When the buffer is saturated, the buffered
    /// event with the lowest severity is dropped to make room; if the new
    /// event ranks no higher than that, the new event is dropped instead.
    pub fn enqueue(&self, event: SiemEvent) {
        let mut buffer = self.buffer.lock().unwrap_or_else(|p| p.into_inner());
        self.lock_stats().enqueued += 1;

        if buffer.len() >= self.config.buffer_capacity {
            let lowest = buffer
                .iter()
                .enumerate()
                .min_by_key(|(_, e)| e.severity.rank())
                .map(|(i, e)| (i, e.severity));
            match lowest {
                Some((index, severity)) if event.severity > severity => {
                    buffer.remove(index);
                    warn!(dropped = %severity, "SIEM buffer saturated, dropped lowest-priority event");
                }
                _ => {
                    self.lock_stats().dropped_overflow += 1;
                    warn!("SIEM buffer saturated, dropping incoming event");
                    return;
                }
            }
            self.lock_stats().dropped_overflow += 1;
        }
        buffer.push_back(event);
    }

    pub fn buffered(&self) -> usize {
        self.buffer.lock().unwrap_or_else(|p| p.into_inner()).len()
    }

    /// Drain the buffer, shipping batches to every destination. Returns how
    /// many events were handed to at least one destination successfully.
    pub async fn flush(&self) -> usize {
        let mut shipped_total = 0usize;
        loop {
            let batch: Vec<SiemEvent> = {
                let mut buffer = self.buffer.lock().unwrap_or_else(|p| p.into_inner());
                let take = buffer.len().min(self.config.batch_size);
                buffer.drain(..take).collect()
            };
            if batch.is_empty() {
                break;
            }

            let mut any_success = self.destinations.is_empty();
            for destination in &self.destinations {
                match self.ship(destination.as_ref(), &batch).await {
                    Ok(()) => any_success = true,
                    Err(e) => {
                        self.lock_stats().failed_batches += 1;
                        error!(
                            destination = destination.name(),
                            error = %e,
                            events = batch.len(),
                            "SIEM batch failed after retries"
                        );
                    }
                }
            }
            if any_success {
                shipped_total += batch.len();
                self.lock_stats().shipped += batch.len() as u64;
            }
        }
        shipped_total
    }

    async fn ship(&self, adapter: &dyn SiemAdapter, batch: &[SiemEvent]) -> Result<()> {
        let request = adapter.format_batch(batch)?;
        let mut attempt = 0u32;
        loop {
            attempt += 1;
            let mut builder = self.http.post(&request.url);
            for (name, value) in &request.headers {
                builder = builder.header(name, value);
            }
            let result = builder.body(request.body.clone()).send().await;

            match result {
                Ok(response) if response.status().is_success() => {
                    debug!(destination = adapter.name(), events = batch.len(), "SIEM batch shipped");
                    return Ok(());
                }
                Ok(response) => {
                    if attempt > self.config.max_retries {
                        return Err(CoachError::Siem(format!(
                            "{} returned {}",
                            adapter.name(),
                            response.status()
                        )));
                    }
                }
                Err(e) => {
                    if attempt > self.config.max_retries {
                        return Err(CoachError::Siem(format!("{}: {e}", adapter.name())));
                    }
                }
            }

            let jitter = rand::thread_rng().gen_range(0..=self.config.retry_backoff_ms / 2 + 1);
            let backoff = self.config.retry_backoff_ms * attempt as u64 + jitter;
            tokio::time::sleep(Duration::from_millis(backoff)).await;
        }
    }

    pub fn stats(&self) -> SiemStats {
        self.lock_stats().clone()
    }

    /// Spawn the periodic flusher. The host keeps the handle and aborts it
    /// on shutdown.
    pub fn spawn_flusher(self: &Arc<Self>, interval: Duration) -> tokio::task::JoinHandle<()> {
        let dispatcher = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                dispatcher.flush().await;
            }
        })
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use crate::types::{AlertThreat, CoachAlertLevel};
    use uuid::Uuid;

    pub fn sample_alert() -> CoachAlert {
        CoachAlert {
            id: Uuid::new_v4(),
            threats: vec![AlertThreat {
                pattern_id: "destruct-rm-root".into(),
                title: "Recursive delete of the filesystem root".into(),
                severity: ThreatSeverity::Critical,
                category: ThreatCategory::DestructiveOperation,
                context: Some("rm -rf /".into()),
            }],
            level: CoachAlertLevel::Block,
            title: "Recursive delete of the filesystem root".into(),
            coach_message: "This command deletes the root filesystem.".into(),
            recommendation: "Do not run it.".into(),
            timeout_ms: 30_000,
            created_at_ms: 1_700_000_000_000,
            expires_at_ms: 1_700_000_030_000,
            requires_decision: true,
        }
    }

    pub fn sample_events(n: usize, severity: ThreatSeverity) -> Vec<SiemEvent> {
        (0..n)
            .map(|i| {
                let mut event = SiemEvent::base("alert.created", severity);
                event.alert_id = Some(format!("evt-{i}"));
                event
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::test_support::{sample_alert, sample_events};
    use super::*;

    #[test]
    fn alert_event_carries_fields() {
        let alert = sample_alert();
        let event = SiemEvent::alert("alert.created", &alert);
        assert_eq!(event.event_type, "alert.created");
        assert_eq!(event.severity, ThreatSeverity::Critical);
        assert_eq!(event.alert_id.as_deref(), Some(alert.id.to_string().as_str()));
        assert_eq!(event.pattern_id.as_deref(), Some("destruct-rm-root"));
        assert_eq!(event.source, "security-coach");
        // RFC 3339 shape.
        assert!(event.timestamp.contains('T'));
    }

    #[test]
    fn resolution_event_has_decision() {
        let alert = sample_alert();
        let event = SiemEvent::resolution(&alert, "deny", Some("operator"));
        assert_eq!(event.event_type, "alert.resolved");
        assert_eq!(event.decision.as_deref(), Some("deny"));
        assert_eq!(event.resolved_by.as_deref(), Some("operator"));
    }

    #[tokio::test]
    async fn overflow_drops_lowest_priority() {
        let dispatcher = SiemDispatcher::new(
            DispatcherConfig {
                buffer_capacity: 3,
                ..Default::default()
            },
            Vec::new(),
        );
        for event in sample_events(3, ThreatSeverity::Low) {
            dispatcher.enqueue(event);
        }
        // A critical event bumps a low one.
        dispatcher.enqueue(sample_events(1, ThreatSeverity::Critical).remove(0));
        assert_eq!(dispatcher.buffered(), 3);
        assert_eq!(dispatcher.stats().dropped_overflow, 1);

        // Another low event cannot displace anything and is itself dropped.
        dispatcher.enqueue(sample_events(1, ThreatSeverity::Low).remove(0));
        assert_eq!(dispatcher.buffered(), 3);
        assert_eq!(dispatcher.stats().dropped_overflow, 2);

        let buffered_severities: Vec<ThreatSeverity> = {
            let buffer = dispatcher.buffer.lock().unwrap();
            buffer.iter().map(|e| e.severity).collect()
        };
        assert!(buffered_severities.contains(&ThreatSeverity::Critical));
    }

    #[tokio::test]
    async fn flush_without_destinations_drains() {
        let dispatcher = SiemDispatcher::new(DispatcherConfig::default(), Vec::new());
        for event in sample_events(120, ThreatSeverity::Medium) {
            dispatcher.enqueue(event);
        }
        let shipped = dispatcher.flush().await;
        assert_eq!(shipped, 120);
        assert_eq!(dispatcher.buffered(), 0);
        assert_eq!(dispatcher.stats().shipped, 120);
    }

    #[tokio::test]
    async fn unreachable_destination_counts_failures() {
        let dispatcher = SiemDispatcher::new(
            DispatcherConfig {
                max_retries: 0,
                retry_backoff_ms: 1,
                request_timeout_ms: 500,
                ..Default::default()
            },
            vec![Box::new(SplunkHecAdapter::new(
                // Discard port: connection refused immediately.
                "http://127.0.0.1:9/services/collector/event".into(),
                "test-token".into(),
            ))],
        );
        dispatcher.enqueue(sample_events(1, ThreatSeverity::High).remove(0));
        let shipped = dispatcher.flush().await;
        assert_eq!(shipped, 0);
        assert_eq!(dispatcher.stats().failed_batches, 1);
        assert_eq!(dispatcher.buffered(), 0);
    }
}
