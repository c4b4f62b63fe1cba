pub mod cache;
pub mod pool;

use std::sync::OnceLock;
use std::time::Instant;

use tracing::warn;

use crate::patterns::{self, PatternMatcher, ThreatPattern};
use crate::types::{AlertThreat, Direction, MatchInput, now_ms};

/// Character cap for the concatenated input blob.
pub const BLOB_CAP_CHARS: usize = 50_000;

/// Wall-clock budget for one full catalog evaluation.
pub const MATCH_BUDGET_MS: u64 = 500;

/// Character cap for a match's context snippet.
pub const CONTEXT_CAP_CHARS: usize = 120;

// -- Lazy input view --------------------------------------------------------

/// Per-call memo over a `MatchInput`: the concatenated blob and its
/// case-folded forms are each computed at most once, on first access.
pub struct InputView<'a> {
    input: &'a MatchInput,
    blob: OnceLock<String>,
    lower: OnceLock<String>,
    upper: OnceLock<String>,
}

impl<'a> InputView<'a> {
    pub fn new(input: &'a MatchInput) -> Self {
        Self {
            input,
            blob: OnceLock::new(),
            lower: OnceLock::new(),
            upper: OnceLock::new(),
        }
    }

    pub fn input(&self) -> &MatchInput {
        self.input
    }

    /// The concatenated text blob, capped at [`BLOB_CAP_CHARS`].
    pub fn blob(&self) -> &str {
        self.blob.get_or_init(|| {
            let mut parts: Vec<&str> = Vec::new();
            if let Some(v) = self.input.tool_name.as_deref() {
                parts.push(v);
            }
            if let Some(v) = self.input.command.as_deref() {
                parts.push(v);
            }
            if let Some(v) = self.input.content.as_deref() {
                parts.push(v);
            }
            if let Some(v) = self.input.url.as_deref() {
                parts.push(v);
            }
            if let Some(v) = self.input.file_path.as_deref() {
                parts.push(v);
            }
            let params: Vec<String> = self
                .input
                .params
                .values()
                .map(|v| match v {
                    serde_json::Value::String(s) => s.clone(),
                    other => other.to_string(),
                })
                .collect();
            let mut all: Vec<&str> = parts;
            for p in &params {
                all.push(p.as_str());
            }
            if let Some(v) = self.input.sender_name.as_deref() {
                all.push(v);
            }
            let blob = all.join("\n");
            if blob.chars().count() > BLOB_CAP_CHARS {
                blob.chars().take(BLOB_CAP_CHARS).collect()
            } else {
                blob
            }
        })
    }

    pub fn lower(&self) -> &str {
        self.lower.get_or_init(|| self.blob().to_lowercase())
    }

    pub fn upper(&self) -> &str {
        self.upper.get_or_init(|| self.blob().to_uppercase())
    }

    pub fn is_inbound(&self) -> bool {
        self.input.direction == Some(Direction::Inbound)
    }

    pub fn is_outbound(&self) -> bool {
        self.input.direction == Some(Direction::Outbound)
    }
}

// -- Match result -----------------------------------------------------------

/// One fired pattern against one input.
#[derive(Debug, Clone)]
pub struct ThreatMatch {
    pub pattern: &'static ThreatPattern,
    pub matched_at_ms: u64,
    /// Up to [`CONTEXT_CAP_CHARS`] of the matched substring, when derivable.
    pub context: Option<String>,
}

impl ThreatMatch {
    pub fn to_alert_threat(&self) -> AlertThreat {
        AlertThreat {
            pattern_id: self.pattern.id.to_string(),
            title: self.pattern.title.to_string(),
            severity: self.pattern.severity,
            category: self.pattern.category,
            context: self.context.clone(),
        }
    }
}

fn truncate_chars(s: &str, cap: usize) -> String {
    if s.chars().count() > cap {
        s.chars().take(cap).collect()
    } else {
        s.to_string()
    }
}

/// Context for predicate matches: the primary text field, capped.
fn predicate_context(input: &MatchInput) -> Option<String> {
    input
        .command
        .as_deref()
        .or(input.content.as_deref())
        .or(input.url.as_deref())
        .map(|s| truncate_chars(s, CONTEXT_CAP_CHARS))
}

// -- Tiered evaluation ------------------------------------------------------

/// Evaluate the full catalog against one input.
///
/// Patterns run in severity buckets, critical first, preserving catalog
/// insertion order within each bucket. A wall-clock budget is checked
/// before each pattern; on overrun the matches collected so far are
/// returned. Deterministic for a given catalog and input, never panics,
/// and an empty input yields an empty list.
pub fn match_threats(input: &MatchInput) -> Vec<ThreatMatch> {
    if input.is_empty() {
        return Vec::new();
    }

    let view = InputView::new(input);
    let started = Instant::now();
    let mut matches: Vec<ThreatMatch> = Vec::new();

    for pattern in patterns::ordered_by_severity().iter().copied() {
        if started.elapsed().as_millis() as u64 > MATCH_BUDGET_MS {
            warn!(
                collected = matches.len(),
                budget_ms = MATCH_BUDGET_MS,
                "pattern evaluation over budget, returning partial result"
            );
            break;
        }

        let fired = match &pattern.matcher {
            PatternMatcher::Regex(re) => re.find(view.blob()).map(|m| {
                ThreatMatch {
                    pattern,
                    matched_at_ms: now_ms(),
                    context: Some(truncate_chars(m.as_str(), CONTEXT_CAP_CHARS)),
                }
            }),
            PatternMatcher::Predicate(f) => f(&view).then(|| ThreatMatch {
                pattern,
                matched_at_ms: now_ms(),
                context: predicate_context(input),
            }),
        };
        if let Some(m) = fired {
            matches.push(m);
        }
    }

    // The bucket walk already yields severity order; the final stable sort
    // keeps the guarantee even if the iteration strategy changes.
    matches.sort_by_key(|m| std::cmp::Reverse(m.pattern.severity.rank()));
    matches
}

/// Advisory fast-path: does the lowered blob contain any known-critical
/// literal? Lets callers short-circuit obviously hot inputs; never replaces
/// full evaluation.
pub fn critical_literal_hit(input: &MatchInput) -> bool {
    if input.is_empty() {
        return false;
    }
    let view = InputView::new(input);
    let lower = view.lower();
    patterns::critical_literals().iter().any(|lit| lower.contains(lit))
}
