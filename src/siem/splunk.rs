use crate::error::Result;
use crate::types::ThreatSeverity;

use super::{SiemAdapter, SiemEvent, SiemRequest};

/// Splunk HTTP Event Collector adapter. One JSON envelope per event,
/// newline-joined, as HEC expects for batched submissions.
pub struct SplunkHecAdapter {
    endpoint: String,
    token: String,
}

impl SplunkHecAdapter {
    /// `endpoint` is the full collector URL, e.g.
    /// `https://splunk.example.com:8088/services/collector/event`.
    pub fn new(endpoint: String, token: String) -> Self {
        Self { endpoint, token }
    }
}

/// Splunk CIM-style severity_id: info(1) .. critical(5).
fn severity_id(severity: ThreatSeverity) -> u8 {
    severity.rank() + 1
}

fn event_time_secs(event: &SiemEvent) -> f64 {
    chrono::DateTime::parse_from_rfc3339(&event.timestamp)
        .map(|t| t.timestamp_millis() as f64 / 1000.0)
        .unwrap_or(0.0)
}

impl SiemAdapter for SplunkHecAdapter {
    fn name(&self) -> &str {
        "splunk-hec"
    }

    fn format_batch(&self, events: &[SiemEvent]) -> Result<SiemRequest> {
        let mut lines = Vec::with_capacity(events.len());
        for event in events {
            let mut payload = serde_json::to_value(event)?;
            if let Some(map) = payload.as_object_mut() {
                map.insert(
                    "severity_id".to_string(),
                    serde_json::json!(severity_id(event.severity)),
                );
            }
            let envelope = serde_json::json!({
                "time": event_time_secs(event),
                "host": event.host,
                "source": event.source,
                "sourcetype": "security:coach",
                "event": payload,
            });
            lines.push(serde_json::to_string(&envelope)?);
        }

        Ok(SiemRequest {
            url: self.endpoint.clone(),
            headers: vec![
                ("Authorization".to_string(), format!("Splunk {}", self.token)),
                ("Content-Type".to_string(), "application/json".to_string()),
            ],
            body: lines.join("\n"),
        })
    }
}
