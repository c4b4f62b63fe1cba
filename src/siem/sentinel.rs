use crate::error::Result;
use crate::types::ThreatSeverity;

use super::{SiemAdapter, SiemEvent, SiemRequest};

/// Microsoft Sentinel adapter, targeting the Azure Monitor Logs Ingestion
/// API (data collection endpoint + DCR stream). The host supplies a valid
/// bearer token; token acquisition is its problem, not this crate's.
pub struct SentinelAdapter {
    endpoint: String,
    dcr_immutable_id: String,
    stream_name: String,
    bearer_token: String,
}

impl SentinelAdapter {
    pub fn new(
        endpoint: String,
        dcr_immutable_id: String,
        stream_name: String,
        bearer_token: String,
    ) -> Self {
        Self {
            endpoint,
            dcr_immutable_id,
            stream_name,
            bearer_token,
        }
    }
}

/// Sentinel's incident severity scale has no "critical"; critical maps to
/// High with the numeric column preserving the distinction.
fn severity_label(severity: ThreatSeverity) -> &'static str {
    match severity {
        ThreatSeverity::Info => "Informational",
        ThreatSeverity::Low => "Low",
        ThreatSeverity::Medium => "Medium",
        ThreatSeverity::High | ThreatSeverity::Critical => "High",
    }
}

impl SiemAdapter for SentinelAdapter {
    fn name(&self) -> &str {
        "sentinel"
    }

    fn format_batch(&self, events: &[SiemEvent]) -> Result<SiemRequest> {
        let rows: Vec<serde_json::Value> = events
            .iter()
            .map(|event| {
                serde_json::json!({
                    "TimeGenerated": event.timestamp,
                    "Host": event.host,
                    "Source": event.source,
                    "EventType": event.event_type,
                    "Severity": severity_label(event.severity),
                    "SeverityNumber": event.severity.rank(),
                    "AlertId": event.alert_id,
                    "Title": event.title,
                    "Message": event.message,
                    "Decision": event.decision,
                    "ResolvedBy": event.resolved_by,
                    "Category": event.category,
                    "PatternId": event.pattern_id,
                    "Threats": event.threats,
                    "Context": event.context,
                    "Tags": event.tags,
                })
            })
            .collect();

        Ok(SiemRequest {
            url: format!(
                "{}/dataCollectionRules/{}/streams/{}?api-version=2023-01-01",
                self.endpoint.trim_end_matches('/'),
                self.dcr_immutable_id,
                self.stream_name
            ),
            headers: vec![
                (
                    "Authorization".to_string(),
                    format!("Bearer {}", self.bearer_token),
                ),
                ("Content-Type".to_string(), "application/json".to_string()),
            ],
            body: serde_json::to_string(&rows)?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::siem::test_support::sample_events;

    #[test]
    fn batch_targets_dcr_stream() {
        let adapter = SentinelAdapter::new(
            "https://dce-example.eastus-1.ingest.monitor.azure.com/".into(),
            "dcr-abc123".into(),
            "Custom-SecurityCoach_CL".into(),
            "token".into(),
        );
        let events = sample_events(1, ThreatSeverity::Critical);
        let request = adapter.format_batch(&events).unwrap();

        assert_eq!(
            request.url,
            "https://dce-example.eastus-1.ingest.monitor.azure.com/dataCollectionRules/dcr-abc123/streams/Custom-SecurityCoach_CL?api-version=2023-01-01"
        );
        assert!(request
            .headers
            .contains(&("Authorization".to_string(), "Bearer token".to_string())));

        let rows: Vec<serde_json::Value> = serde_json::from_str(&request.body).unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0]["Severity"], "High");
        assert_eq!(rows[0]["SeverityNumber"], 4);
        assert_eq!(rows[0]["EventType"], "alert.created");
        assert_eq!(rows[0]["Source"], "security-coach");
    }

    #[test]
    fn severity_labels() {
        assert_eq!(severity_label(ThreatSeverity::Info), "Informational");
        assert_eq!(severity_label(ThreatSeverity::Medium), "Medium");
        assert_eq!(severity_label(ThreatSeverity::High), "High");
        assert_eq!(severity_label(ThreatSeverity::Critical), "High");
    }
}
