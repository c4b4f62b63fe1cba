//! Security coaching and policy enforcement engine for AI-assistant hosts.
//!
//! Sits in the request path of the host: every tool invocation, outbound
//! message, and inbound channel message flows through the [`hooks`] layer,
//! which drives the [`engine`] (pattern matcher with cache and worker
//! pool, rule store, optional LLM judge) and either allows the action,
//! refers it to the human, or applies a standing rule. Every decision lands
//! in the append-only audit log and alert history, in-memory metrics, and
//! optionally an external SIEM.
//!
//! The host owns process bootstrap, transport, and the LLM provider SDK;
//! it plugs those in through [`judge::ChatClient`], [`siem::SiemAdapter`],
//! and the broadcast receiver returned by [`hooks::CoachHooks::subscribe`].

pub mod audit;
pub mod coaching;
pub mod config;
pub mod engine;
pub mod error;
pub mod history;
pub mod hooks;
pub mod judge;
pub mod matcher;
pub mod metrics;
pub mod patterns;
pub mod rules;
pub mod siem;
pub mod statedir;
pub mod throttle;
pub mod types;

pub use config::{CoachConfig, LlmJudgeConfig, ThrottleConfig};
pub use engine::{CoachEngine, EngineOptions, EvalOutcome, EvalSource};
pub use error::{CoachError, Result};
pub use hooks::{CoachEvent, CoachHooks, HookVerdict, SecurityCoachAlertEvent};
pub use rules::{NewRule, Rule, RuleDecision, RuleStore};
pub use statedir::StateDir;
pub use types::{
    CoachAlert, CoachAlertLevel, CoachDecision, Direction, MatchInput, ThreatCategory,
    ThreatSeverity,
};
