mod catalog;

use std::collections::HashMap;
use std::sync::LazyLock;

use regex::Regex;

use crate::matcher::InputView;
use crate::types::{ThreatCategory, ThreatSeverity};

/// How a pattern decides whether it fires.
///
/// `Regex` runs against the concatenated input blob; `Predicate` is a pure
/// function over the lazy input view. Any future matcher kind is a new
/// variant here.
pub enum PatternMatcher {
    Regex(Regex),
    Predicate(fn(&InputView<'_>) -> bool),
}

impl std::fmt::Debug for PatternMatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Regex(re) => f.debug_tuple("Regex").field(&re.as_str()).finish(),
            Self::Predicate(_) => f.write_str("Predicate"),
        }
    }
}

/// One threat descriptor in the static catalog.
#[derive(Debug)]
pub struct ThreatPattern {
    pub id: &'static str,
    pub category: ThreatCategory,
    pub severity: ThreatSeverity,
    pub title: &'static str,
    pub matcher: PatternMatcher,
    /// Short explanation shown to the user when this pattern fires.
    pub coaching: &'static str,
    /// What the user should do instead.
    pub recommendation: &'static str,
    pub tags: &'static [&'static str],
}

static CATALOG: LazyLock<Vec<ThreatPattern>> = LazyLock::new(catalog::build);

static BY_ID: LazyLock<HashMap<&'static str, &'static ThreatPattern>> = LazyLock::new(|| {
    CATALOG.iter().map(|p| (p.id, p)).collect()
});

/// Catalog in severity-bucket order: critical first, then high, medium,
/// low, info; insertion order preserved within each bucket.
static BY_SEVERITY: LazyLock<Vec<&'static ThreatPattern>> = LazyLock::new(|| {
    let mut ordered: Vec<&'static ThreatPattern> = CATALOG.iter().collect();
    ordered.sort_by_key(|p| std::cmp::Reverse(p.severity.rank()));
    ordered
});

/// All patterns in catalog insertion order.
pub fn catalog() -> &'static [ThreatPattern] {
    &CATALOG
}

/// Patterns ordered for tiered evaluation (critical → info, stable).
pub fn ordered_by_severity() -> &'static [&'static ThreatPattern] {
    &BY_SEVERITY
}

pub fn by_id(id: &str) -> Option<&'static ThreatPattern> {
    BY_ID.get(id).copied()
}

/// Advisory literal substrings whose presence in the lowered blob almost
/// always means a critical hit. Callers may use this for early decisions;
/// it never replaces full evaluation.
pub fn critical_literals() -> &'static [&'static str] {
    &[
        "rm -rf /",
        "--no-preserve-root",
        "mkfs",
        "of=/dev/sd",
        ":(){ :|:& };:",
        "/etc/shadow",
        "/etc/sudoers",
        "169.254.169.254",
        "authorized_keys",
        "-----begin rsa private key-----",
        "-----begin openssh private key-----",
    ]
}
