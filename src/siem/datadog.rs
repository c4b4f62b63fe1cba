use crate::error::Result;
use crate::types::ThreatSeverity;

use super::{SiemAdapter, SiemEvent, SiemRequest};

/// Datadog Logs intake adapter. Ships a JSON array to the v2 logs endpoint.
pub struct DatadogAdapter {
    api_key: String,
    site: String,
    service: String,
}

impl DatadogAdapter {
    /// `site` is the Datadog site domain, e.g. `datadoghq.com` or
    /// `datadoghq.eu`.
    pub fn new(api_key: String, site: String, service: String) -> Self {
        Self {
            api_key,
            site,
            service,
        }
    }
}

fn status(severity: ThreatSeverity) -> &'static str {
    match severity {
        ThreatSeverity::Info | ThreatSeverity::Low => "info",
        ThreatSeverity::Medium => "warning",
        ThreatSeverity::High => "error",
        ThreatSeverity::Critical => "critical",
    }
}

/// Syslog-style numeric severity: informational(6) down to critical(2).
fn syslog_severity(severity: ThreatSeverity) -> u8 {
    match severity {
        ThreatSeverity::Info => 6,
        ThreatSeverity::Low => 5,
        ThreatSeverity::Medium => 4,
        ThreatSeverity::High => 3,
        ThreatSeverity::Critical => 2,
    }
}

impl SiemAdapter for DatadogAdapter {
    fn name(&self) -> &str {
        "datadog"
    }

    fn format_batch(&self, events: &[SiemEvent]) -> Result<SiemRequest> {
        let mut items = Vec::with_capacity(events.len());
        for event in events {
            let mut tags = vec![
                format!("event_type:{}", event.event_type),
                format!("severity:{}", event.severity),
            ];
            tags.extend(event.tags.iter().cloned());

            items.push(serde_json::json!({
                "ddsource": event.source,
                "ddtags": tags.join(","),
                "hostname": event.host,
                "service": self.service,
                "status": status(event.severity),
                "syslog_severity": syslog_severity(event.severity),
                "message": serde_json::to_string(event)?,
            }));
        }

        Ok(SiemRequest {
            url: format!("https://http-intake.logs.{}/api/v2/logs", self.site),
            headers: vec![
                ("DD-API-KEY".to_string(), self.api_key.clone()),
                ("Content-Type".to_string(), "application/json".to_string()),
            ],
            body: serde_json::to_string(&items)?,
        })
    }
}
