use crate::patterns;
use crate::types::{AlertThreat, CoachAlertLevel};

/// The user-facing text of one alert.
#[derive(Debug, Clone, PartialEq)]
pub struct AlertCopy {
    pub title: String,
    pub message: String,
    pub recommendation: String,
}

/// Seam for the host's persona/message-copy generator: a pure mapping from
/// (threats, level) to the alert text. The engine calls it but does not own
/// its voice.
pub trait CopyBuilder: Send + Sync {
    fn build(&self, threats: &[AlertThreat], level: CoachAlertLevel) -> AlertCopy;
}

/// Default copy composed from the fired patterns' own coaching fields.
pub struct PatternCopy;

impl CopyBuilder for PatternCopy {
    fn build(&self, threats: &[AlertThreat], level: CoachAlertLevel) -> AlertCopy {
        let Some(primary) = threats.first() else {
            return AlertCopy {
                title: "Security review".to_string(),
                message: "This action was flagged for review.".to_string(),
                recommendation: "Review the action before proceeding.".to_string(),
            };
        };

        let pattern = patterns::by_id(&primary.pattern_id);
        let mut message = pattern
            .map(|p| p.coaching.to_string())
            .unwrap_or_else(|| format!("{} was flagged.", primary.title));
        if threats.len() > 1 {
            let others: Vec<&str> = threats[1..]
                .iter()
                .take(3)
                .map(|t| t.title.as_str())
                .collect();
            message.push_str(&format!(" Also flagged: {}.", others.join("; ")));
        }

        let recommendation = pattern
            .map(|p| p.recommendation.to_string())
            .unwrap_or_else(|| match level {
                CoachAlertLevel::Block => "Do not proceed without review.".to_string(),
                CoachAlertLevel::Warn => "Proceed only if you understand the risk.".to_string(),
                CoachAlertLevel::Inform => "No action required.".to_string(),
            });

        AlertCopy {
            title: primary.title.clone(),
            message,
            recommendation,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{ThreatCategory, ThreatSeverity};

    fn threat(pattern_id: &str, title: &str) -> AlertThreat {
        AlertThreat {
            pattern_id: pattern_id.to_string(),
            title: title.to_string(),
            severity: ThreatSeverity::High,
            category: ThreatCategory::CredentialExposure,
            context: None,
        }
    }

    #[test]
    fn copy_comes_from_catalog_fields() {
        let pattern = crate::patterns::by_id("destruct-rm-root").unwrap();
        let copy = PatternCopy.build(
            &[threat("destruct-rm-root", pattern.title)],
            CoachAlertLevel::Block,
        );
        assert_eq!(copy.title, pattern.title);
        assert_eq!(copy.message, pattern.coaching);
        assert_eq!(copy.recommendation, pattern.recommendation);
    }

    #[test]
    fn extra_threats_are_mentioned() {
        let copy = PatternCopy.build(
            &[
                threat("cred-ssh-key-read", "Private SSH key being read or copied"),
                threat("cred-shell-history", "Shell history harvesting"),
            ],
            CoachAlertLevel::Warn,
        );
        assert!(copy.message.contains("Also flagged: Shell history harvesting"));
    }

    #[test]
    fn unknown_pattern_falls_back() {
        let copy = PatternCopy.build(
            &[threat("llm-judge", "Flagged by security review")],
            CoachAlertLevel::Warn,
        );
        assert!(copy.message.contains("was flagged"));
        assert!(!copy.recommendation.is_empty());
    }

    #[test]
    fn empty_threats_still_produce_copy() {
        let copy = PatternCopy.build(&[], CoachAlertLevel::Inform);
        assert!(!copy.title.is_empty());
    }
}
