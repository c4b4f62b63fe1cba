use std::collections::HashMap;
use std::sync::{Arc, LazyLock, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use regex::Regex;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::{debug, warn};

use crate::config::LlmJudgeConfig;
use crate::error::{CoachError, Result};
use crate::types::{MatchInput, ThreatCategory, ThreatSeverity, now_ms};

/// Per-field character cap applied before anything reaches the model.
const SANITIZE_FIELD_CAP: usize = 2_000;

// -- Abstract chat interface -----------------------------------------------

#[derive(Debug, Clone)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
}

#[derive(Debug, Clone)]
pub struct ChatRequest {
    pub model: String,
    pub messages: Vec<ChatMessage>,
    pub max_tokens: u32,
    /// Hint for providers that support forced output shapes ("json").
    pub response_format: Option<String>,
}

#[derive(Debug, Clone)]
pub struct ChatResponse {
    pub content: String,
}

/// The one capability the judge needs from an LLM provider. Adapters for
/// concrete SDKs live in the host, behind this trait.
#[async_trait]
pub trait ChatClient: Send + Sync {
    async fn chat(&self, request: ChatRequest) -> Result<ChatResponse>;
}

// -- Verdict ----------------------------------------------------------------

/// Parsed judge assessment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JudgeVerdict {
    pub is_threat: bool,
    /// 0..=100 after clamping.
    pub confidence: u8,
    pub severity: ThreatSeverity,
    pub category: ThreatCategory,
    pub reasoning: String,
    pub recommendation: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub safe_alternative: Option<String>,
    #[serde(default)]
    pub evaluated_at_ms: u64,
}

/// Wire shape the model is asked for; required fields are enforced here.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawVerdict {
    is_threat: bool,
    confidence: f64,
    severity: ThreatSeverity,
    category: ThreatCategory,
    reasoning: String,
    recommendation: String,
    #[serde(default)]
    safe_alternative: Option<String>,
}

// -- Sanitizer --------------------------------------------------------------

static INJECTION_KEYWORDS: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\b(?:IGNORE|DISREGARD|FORGET|OVERRIDE|SYSTEM|ASSISTANT)\b")
        .expect("static keyword regex")
});

fn sanitize_text(text: &str) -> String {
    let replaced = INJECTION_KEYWORDS.replace_all(text, "[REDACTED]");
    if replaced.chars().count() > SANITIZE_FIELD_CAP {
        replaced.chars().take(SANITIZE_FIELD_CAP).collect()
    } else {
        replaced.into_owned()
    }
}

/// Defang instruction-injection keywords and cap every text field before it
/// is embedded into a prompt.
pub fn sanitize_input(input: &MatchInput) -> MatchInput {
    let mut out = input.clone();
    out.tool_name = out.tool_name.as_deref().map(sanitize_text);
    out.command = out.command.as_deref().map(sanitize_text);
    out.content = out.content.as_deref().map(sanitize_text);
    out.url = out.url.as_deref().map(sanitize_text);
    out.file_path = out.file_path.as_deref().map(sanitize_text);
    out.sender_name = out.sender_name.as_deref().map(sanitize_text);
    for value in out.params.values_mut() {
        if let serde_json::Value::String(s) = value {
            *value = serde_json::Value::String(sanitize_text(s));
        }
    }
    out
}

// -- Heuristic gate ---------------------------------------------------------

const SENSITIVE_PATH_MARKERS: &[&str] = &[
    "/etc/", "/.ssh", ".ssh/", ".aws", "shadow", "credentials", "keychain", "/proc/",
];

const CLOUD_CLI_MARKERS: &[&str] = &["aws ", "gcloud ", "az ", "kubectl ", "terraform "];

/// Cheap pre-filter deciding whether an input is interesting enough to pay
/// for an LLM call. Clearly safe inputs return false.
pub fn should_use_llm(input: &MatchInput) -> bool {
    let mut text = String::new();
    if let Some(v) = &input.command {
        text.push_str(v);
        text.push('\n');
    }
    if let Some(v) = &input.content {
        text.push_str(v);
        text.push('\n');
    }
    if let Some(v) = &input.url {
        text.push_str(v);
    }
    if text.trim().is_empty() {
        return false;
    }
    let lower = text.to_lowercase();

    // Shell plumbing and substitution.
    if lower.contains('|') || lower.contains("$(") || lower.contains('`') {
        return true;
    }
    // Encodings and obfuscation.
    if lower.contains("base64") || lower.contains("xxd") || lower.contains("\\x") {
        return true;
    }
    if has_long_opaque_token(&text) {
        return true;
    }
    // Dynamic evaluation.
    if lower.contains("eval") || lower.contains("exec") {
        return true;
    }
    // External URLs (localhost traffic is not interesting).
    if (lower.contains("http://") || lower.contains("https://"))
        && !lower.contains("://localhost")
        && !lower.contains("://127.0.0.1")
    {
        return true;
    }
    if SENSITIVE_PATH_MARKERS.iter().any(|m| lower.contains(m)) {
        return true;
    }
    if CLOUD_CLI_MARKERS.iter().any(|m| lower.contains(m)) {
        return true;
    }
    false
}

/// A run of 32+ base64/hex-ish characters usually means an embedded payload
/// or credential.
fn has_long_opaque_token(text: &str) -> bool {
    let mut run = 0usize;
    for c in text.chars() {
        if c.is_ascii_alphanumeric() || c == '+' || c == '/' || c == '=' {
            run += 1;
            if run >= 32 {
                return true;
            }
        } else {
            run = 0;
        }
    }
    false
}

// -- Judge ------------------------------------------------------------------

struct CachedVerdict {
    verdict: JudgeVerdict,
    cached_at_ms: u64,
}

/// Optional oracle that confirms or overrides pattern hits and assesses
/// novel inputs. Latency-bounded; results are cached by a hash of the
/// normalized input so identical inputs do not re-query the model.
pub struct LlmJudge {
    config: LlmJudgeConfig,
    client: Arc<dyn ChatClient>,
    cache: Mutex<HashMap<String, CachedVerdict>>,
}

impl LlmJudge {
    pub fn new(config: LlmJudgeConfig, client: Arc<dyn ChatClient>) -> Self {
        Self {
            config,
            client,
            cache: Mutex::new(HashMap::new()),
        }
    }

    pub fn config(&self) -> &LlmJudgeConfig {
        &self.config
    }

    pub fn enabled(&self) -> bool {
        self.config.enabled
    }

    /// Full assessment of an input the pattern matcher had no opinion on.
    pub async fn evaluate(&self, input: &MatchInput) -> Result<Option<JudgeVerdict>> {
        if !self.config.enabled {
            return Ok(None);
        }
        let sanitized = sanitize_input(input);
        let key = cache_key("evaluate", &sanitized, &[]);
        if let Some(verdict) = self.cache_get(&key) {
            return Ok(Some(verdict));
        }

        let prompt = evaluate_prompt(&sanitized);
        match self.ask(prompt).await {
            Ok(verdict) => {
                self.cache_put(key, &verdict);
                Ok(Some(verdict))
            }
            Err(e) => self.recover(e),
        }
    }

    /// Ask the judge to confirm or override pattern hits.
    pub async fn confirm_pattern_match(
        &self,
        input: &MatchInput,
        threats: &[crate::matcher::ThreatMatch],
    ) -> Result<Option<JudgeVerdict>> {
        if !self.config.enabled || !self.config.confirm_pattern_matches {
            return Ok(None);
        }
        let pattern_ids: Vec<&str> = threats.iter().map(|m| m.pattern.id).collect();
        let sanitized = sanitize_input(input);
        let key = cache_key("confirm", &sanitized, &pattern_ids);
        if let Some(verdict) = self.cache_get(&key) {
            return Ok(Some(verdict));
        }

        let prompt = confirm_prompt(&sanitized, threats);
        match self.ask(prompt).await {
            Ok(verdict) => {
                self.cache_put(key, &verdict);
                Ok(Some(verdict))
            }
            Err(e) => self.recover(e),
        }
    }

    async fn ask(&self, prompt: String) -> Result<JudgeVerdict> {
        let request = ChatRequest {
            model: self.config.model.clone(),
            messages: vec![
                ChatMessage {
                    role: "system".into(),
                    content: SYSTEM_PROMPT.into(),
                },
                ChatMessage {
                    role: "user".into(),
                    content: prompt,
                },
            ],
            max_tokens: self.config.max_tokens,
            response_format: Some("json".into()),
        };

        let deadline = Duration::from_millis(self.config.max_latency_ms);
        let response = match tokio::time::timeout(deadline, self.client.chat(request)).await {
            Err(_) => return Err(CoachError::JudgeTimeout(self.config.max_latency_ms)),
            Ok(result) => result?,
        };

        let mut verdict = parse_verdict(&response.content)?;
        verdict.evaluated_at_ms = now_ms();
        debug!(
            is_threat = verdict.is_threat,
            confidence = verdict.confidence,
            severity = %verdict.severity,
            "judge verdict"
        );
        Ok(verdict)
    }

    fn recover(&self, e: CoachError) -> Result<Option<JudgeVerdict>> {
        if self.config.fallback_to_patterns {
            warn!(error = %e, "LLM judge failed, falling back to pattern verdict");
            Ok(None)
        } else {
            Err(e)
        }
    }

    fn cache_get(&self, key: &str) -> Option<JudgeVerdict> {
        if !self.config.cache_enabled {
            return None;
        }
        let mut cache = self.cache.lock().unwrap_or_else(|p| p.into_inner());
        let entry = cache.get(key)?;
        if now_ms().saturating_sub(entry.cached_at_ms) > self.config.cache_ttl_ms {
            cache.remove(key);
            return None;
        }
        Some(entry.verdict.clone())
    }

    fn cache_put(&self, key: String, verdict: &JudgeVerdict) {
        if !self.config.cache_enabled {
            return;
        }
        let mut cache = self.cache.lock().unwrap_or_else(|p| p.into_inner());
        cache.insert(
            key,
            CachedVerdict {
                verdict: verdict.clone(),
                cached_at_ms: now_ms(),
            },
        );
    }
}

/// Cryptographic key over the normalized fields plus the entry point, so
/// `evaluate` and `confirm` verdicts never cross-contaminate.
fn cache_key(kind: &str, sanitized: &MatchInput, pattern_ids: &[&str]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(kind.as_bytes());
    for (name, value) in sanitized.canonical_fields(SANITIZE_FIELD_CAP) {
        hasher.update(name.as_bytes());
        hasher.update([0u8]);
        hasher.update(value.as_bytes());
        hasher.update([0u8]);
    }
    for id in pattern_ids {
        hasher.update(id.as_bytes());
        hasher.update([0u8]);
    }
    hex::encode(hasher.finalize())
}

// -- Prompts ----------------------------------------------------------------

const SYSTEM_PROMPT: &str = "You are a security analyst reviewing actions an AI assistant is about to take on a user's machine. \
Respond with strict JSON only, no prose and no markdown fences, conforming to: \
{\"isThreat\": boolean, \"confidence\": number 0-100, \"severity\": \"info\"|\"low\"|\"medium\"|\"high\"|\"critical\", \
\"category\": \"data-exfiltration\"|\"privilege-escalation\"|\"destructive-operation\"|\"network-suspicious\"|\"credential-exposure\"|\"social-engineering\"|\"code-injection\"|\"persistence-mechanism\"|\"reconnaissance\", \
\"reasoning\": string, \"recommendation\": string, \"safeAlternative\": string (optional)}";

fn describe_input(input: &MatchInput) -> String {
    let mut lines = Vec::new();
    if let Some(v) = &input.tool_name {
        lines.push(format!("tool: {v}"));
    }
    if let Some(v) = &input.command {
        lines.push(format!("command: {v}"));
    }
    if let Some(v) = &input.content {
        lines.push(format!("content: {v}"));
    }
    if let Some(v) = &input.url {
        lines.push(format!("url: {v}"));
    }
    if let Some(v) = &input.file_path {
        lines.push(format!("file path: {v}"));
    }
    if let Some(d) = input.direction {
        lines.push(format!("direction: {d:?}"));
    }
    lines.join("\n")
}

fn evaluate_prompt(input: &MatchInput) -> String {
    format!(
        "Assess whether the following action is a security threat.\n\n{}\n\nRespond with the JSON schema only.",
        describe_input(input)
    )
}

fn confirm_prompt(input: &MatchInput, threats: &[crate::matcher::ThreatMatch]) -> String {
    let fired: Vec<String> = threats
        .iter()
        .map(|m| format!("- {} ({}, {})", m.pattern.id, m.pattern.severity, m.pattern.title))
        .collect();
    format!(
        "Static patterns flagged the following action. Confirm whether it is genuinely a threat or a false positive.\n\nFired patterns:\n{}\n\nAction:\n{}\n\nRespond with the JSON schema only.",
        fired.join("\n"),
        describe_input(input)
    )
}

// -- Parsing ----------------------------------------------------------------

/// Parse the model response. Markdown fences are tolerated; required fields
/// are enforced; confidence is clamped to 0..=100.
fn parse_verdict(content: &str) -> Result<JudgeVerdict> {
    let trimmed = strip_fences(content);
    let raw: RawVerdict = serde_json::from_str(trimmed)
        .map_err(|e| CoachError::Judge(format!("malformed verdict: {e}")))?;
    Ok(JudgeVerdict {
        is_threat: raw.is_threat,
        confidence: raw.confidence.clamp(0.0, 100.0).round() as u8,
        severity: raw.severity,
        category: raw.category,
        reasoning: raw.reasoning,
        recommendation: raw.recommendation,
        safe_alternative: raw.safe_alternative,
        evaluated_at_ms: 0,
    })
}

fn strip_fences(content: &str) -> &str {
    let trimmed = content.trim();
    let without_open = trimmed
        .strip_prefix("```json")
        .or_else(|| trimmed.strip_prefix("```"))
        .unwrap_or(trimmed);
    without_open.strip_suffix("```").unwrap_or(without_open).trim()
}
