use std::collections::BTreeMap;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Epoch milliseconds. All core timestamps use this; ISO-8601 appears only
/// at the SIEM boundary.
pub fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

// -- Severity ---------------------------------------------------------------

/// Threat severity, ordered `info < low < medium < high < critical`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ThreatSeverity {
    Info,
    Low,
    Medium,
    High,
    Critical,
}

impl ThreatSeverity {
    /// Numeric rank, `info = 0` through `critical = 4`.
    pub fn rank(&self) -> u8 {
        match self {
            Self::Info => 0,
            Self::Low => 1,
            Self::Medium => 2,
            Self::High => 3,
            Self::Critical => 4,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Info => "info",
            Self::Low => "low",
            Self::Medium => "medium",
            Self::High => "high",
            Self::Critical => "critical",
        }
    }
}

impl std::fmt::Display for ThreatSeverity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// -- Category ---------------------------------------------------------------

/// Closed set of threat categories.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ThreatCategory {
    DataExfiltration,
    PrivilegeEscalation,
    DestructiveOperation,
    NetworkSuspicious,
    CredentialExposure,
    SocialEngineering,
    CodeInjection,
    PersistenceMechanism,
    Reconnaissance,
}

impl ThreatCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::DataExfiltration => "data-exfiltration",
            Self::PrivilegeEscalation => "privilege-escalation",
            Self::DestructiveOperation => "destructive-operation",
            Self::NetworkSuspicious => "network-suspicious",
            Self::CredentialExposure => "credential-exposure",
            Self::SocialEngineering => "social-engineering",
            Self::CodeInjection => "code-injection",
            Self::PersistenceMechanism => "persistence-mechanism",
            Self::Reconnaissance => "reconnaissance",
        }
    }
}

impl std::fmt::Display for ThreatCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// -- Direction --------------------------------------------------------------

/// Message direction relative to the host.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Inbound,
    Outbound,
}

// -- Match input ------------------------------------------------------------

/// One evaluated action or message. Every field is optional; hooks fill in
/// whatever the host event carries.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MatchInput {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub command: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_path: Option<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub params: BTreeMap<String, serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub channel_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sender_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sender_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub direction: Option<Direction>,
}

impl MatchInput {
    pub fn is_empty(&self) -> bool {
        self.tool_name.is_none()
            && self.command.is_none()
            && self.content.is_none()
            && self.url.is_none()
            && self.file_path.is_none()
            && self.params.is_empty()
            && self.channel_id.is_none()
            && self.sender_id.is_none()
            && self.sender_name.is_none()
    }

    /// Canonical `(field, value)` pairs over the non-empty fields, with
    /// `content` truncated to `content_cap` characters. Shared by the match
    /// cache fingerprint and the LLM judge cache key so identical logical
    /// inputs canonicalize identically.
    pub fn canonical_fields(&self, content_cap: usize) -> Vec<(&'static str, String)> {
        let mut fields = Vec::new();
        if let Some(v) = &self.tool_name {
            fields.push(("tool_name", v.clone()));
        }
        if let Some(v) = &self.command {
            fields.push(("command", v.clone()));
        }
        if let Some(v) = &self.content {
            let truncated: String = v.chars().take(content_cap).collect();
            fields.push(("content", truncated));
        }
        if let Some(v) = &self.url {
            fields.push(("url", v.clone()));
        }
        if let Some(v) = &self.file_path {
            fields.push(("file_path", v.clone()));
        }
        if !self.params.is_empty() {
            // BTreeMap iteration is key-ordered, so this is stable.
            fields.push((
                "params",
                serde_json::to_string(&self.params).unwrap_or_default(),
            ));
        }
        if let Some(v) = &self.channel_id {
            fields.push(("channel_id", v.clone()));
        }
        if let Some(v) = &self.sender_id {
            fields.push(("sender_id", v.clone()));
        }
        if let Some(v) = &self.sender_name {
            fields.push(("sender_name", v.clone()));
        }
        if let Some(d) = self.direction {
            fields.push((
                "direction",
                match d {
                    Direction::Inbound => "inbound".to_string(),
                    Direction::Outbound => "outbound".to_string(),
                },
            ));
        }
        fields
    }
}

// -- Alert-facing threat summary --------------------------------------------

/// Serializable summary of one fired pattern, carried inside alerts and the
/// broadcast payloads.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AlertThreat {
    pub pattern_id: String,
    pub title: String,
    pub severity: ThreatSeverity,
    pub category: ThreatCategory,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context: Option<String>,
}

// -- Alert level / decision -------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CoachAlertLevel {
    Block,
    Warn,
    Inform,
}

impl CoachAlertLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Block => "block",
            Self::Warn => "warn",
            Self::Inform => "inform",
        }
    }
}

impl std::fmt::Display for CoachAlertLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum CoachDecision {
    AllowOnce,
    AllowAlways,
    Deny,
    LearnMore,
}

impl CoachDecision {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::AllowOnce => "allow-once",
            Self::AllowAlways => "allow-always",
            Self::Deny => "deny",
            Self::LearnMore => "learn-more",
        }
    }

    /// Whether this decision lets the underlying action proceed.
    pub fn allows(&self) -> bool {
        matches!(self, Self::AllowOnce | Self::AllowAlways)
    }
}

impl std::fmt::Display for CoachDecision {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for CoachDecision {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "allow-once" => Ok(Self::AllowOnce),
            "allow-always" => Ok(Self::AllowAlways),
            "deny" => Ok(Self::Deny),
            "learn-more" => Ok(Self::LearnMore),
            other => Err(format!("unknown decision: {other}")),
        }
    }
}

// -- Alert ------------------------------------------------------------------

/// A user-facing alert built from one or more matches.
///
/// `requires_decision` holds exactly when `level` is block or warn, and
/// `expires_at_ms = created_at_ms + timeout_ms`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CoachAlert {
    pub id: Uuid,
    pub threats: Vec<AlertThreat>,
    pub level: CoachAlertLevel,
    pub title: String,
    pub coach_message: String,
    pub recommendation: String,
    pub timeout_ms: u64,
    pub created_at_ms: u64,
    pub expires_at_ms: u64,
    pub requires_decision: bool,
}

impl CoachAlert {
    /// Severity of the most severe contributing threat.
    pub fn max_severity(&self) -> Option<ThreatSeverity> {
        self.threats.iter().map(|t| t.severity).max()
    }

    /// Pattern id of the first (representative) threat.
    pub fn primary_pattern_id(&self) -> Option<&str> {
        self.threats.first().map(|t| t.pattern_id.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn severity_is_ordered() {
        assert!(ThreatSeverity::Info < ThreatSeverity::Low);
        assert!(ThreatSeverity::Low < ThreatSeverity::Medium);
        assert!(ThreatSeverity::Medium < ThreatSeverity::High);
        assert!(ThreatSeverity::High < ThreatSeverity::Critical);
        assert_eq!(ThreatSeverity::Info.rank(), 0);
        assert_eq!(ThreatSeverity::Critical.rank(), 4);
    }

    #[test]
    fn severity_serde_round_trip() {
        let json = serde_json::to_string(&ThreatSeverity::Critical).unwrap();
        assert_eq!(json, "\"critical\"");
        let back: ThreatSeverity = serde_json::from_str(&json).unwrap();
        assert_eq!(back, ThreatSeverity::Critical);
    }

    #[test]
    fn category_kebab_case() {
        let json = serde_json::to_string(&ThreatCategory::DataExfiltration).unwrap();
        assert_eq!(json, "\"data-exfiltration\"");
        assert_eq!(ThreatCategory::SocialEngineering.as_str(), "social-engineering");
    }

    #[test]
    fn decision_parse_and_display() {
        for s in ["allow-once", "allow-always", "deny", "learn-more"] {
            let d: CoachDecision = s.parse().unwrap();
            assert_eq!(d.as_str(), s);
        }
        assert!("maybe".parse::<CoachDecision>().is_err());
        assert!(CoachDecision::AllowOnce.allows());
        assert!(CoachDecision::AllowAlways.allows());
        assert!(!CoachDecision::Deny.allows());
        assert!(!CoachDecision::LearnMore.allows());
    }

    #[test]
    fn empty_input_is_empty() {
        assert!(MatchInput::default().is_empty());
        let input = MatchInput {
            command: Some("ls".into()),
            ..Default::default()
        };
        assert!(!input.is_empty());
    }

    #[test]
    fn canonical_fields_truncate_content() {
        let input = MatchInput {
            content: Some("x".repeat(1000)),
            ..Default::default()
        };
        let fields = input.canonical_fields(500);
        assert_eq!(fields.len(), 1);
        assert_eq!(fields[0].0, "content");
        assert_eq!(fields[0].1.len(), 500);
    }

    #[test]
    fn canonical_fields_stable_for_params() {
        let mut a = MatchInput::default();
        a.params.insert("b".into(), serde_json::json!(1));
        a.params.insert("a".into(), serde_json::json!(2));
        let mut b = MatchInput::default();
        b.params.insert("a".into(), serde_json::json!(2));
        b.params.insert("b".into(), serde_json::json!(1));
        assert_eq!(a.canonical_fields(500), b.canonical_fields(500));
    }

    #[test]
    fn now_ms_is_monotonic_enough() {
        let a = now_ms();
        let b = now_ms();
        assert!(b >= a);
        assert!(a > 1_600_000_000_000); // after 2020
    }
}
