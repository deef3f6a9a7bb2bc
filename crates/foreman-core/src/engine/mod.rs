//! Engine subprocess execution: result model, envelope parsing and failure
//! classification.
//!
//! Engines are opaque commands named by config. Stdout is free-form; the
//! last JSON-parseable line with a `result` key is treated as the
//! structured outcome. Stderr is diagnostic only.

pub mod chain;
pub mod runner;

pub use chain::FallbackChain;
pub use runner::{EngineHandle, EngineRunner};

use serde::{Deserialize, Serialize};
use std::sync::OnceLock;

/// Classified engine failure kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EngineErrorKind {
    RateLimit,
    Timeout,
    Crash,
    Unknown,
}

impl EngineErrorKind {
    /// Kinds the fallback chain reacts to by trying the next engine.
    /// Validation-style failures and "stuck" propagate to the scheduler's
    /// own retry policy instead.
    pub fn triggers_fallback(self) -> bool {
        matches!(self, EngineErrorKind::RateLimit | EngineErrorKind::Crash)
    }
}

/// Outcome of one engine invocation.
#[derive(Debug, Clone)]
pub struct EngineResult {
    pub engine: String,
    pub success: bool,
    /// Engine reported success but claims it changed nothing.
    pub no_changes: bool,
    pub output: String,
    pub error: Option<String>,
    pub error_kind: Option<EngineErrorKind>,
    /// The invocation was aborted through [`EngineHandle::kill`].
    pub killed: bool,
    pub duration_ms: u64,
}

impl EngineResult {
    /// Whether the chain should move on to the next engine.
    pub fn triggers_fallback(&self) -> bool {
        !self.killed
            && !self.success
            && self.error_kind.is_some_and(EngineErrorKind::triggers_fallback)
    }
}

/// The structured line an engine may print as its final verdict.
#[derive(Debug, Clone, Deserialize)]
pub struct Envelope {
    pub result: String,
    #[serde(default)]
    pub error_type: Option<String>,
    #[serde(default)]
    pub message: Option<String>,
}

/// Find the last JSON-parseable stdout line shaped like an [`Envelope`].
pub fn parse_envelope(stdout: &str) -> Option<Envelope> {
    stdout
        .lines()
        .rev()
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .find_map(|l| serde_json::from_str::<Envelope>(l).ok())
}

/// Map an envelope `error_type` string to a classification.
pub fn classify_error_type(error_type: &str) -> EngineErrorKind {
    match error_type.trim().to_ascii_lowercase().as_str() {
        "rate_limit" | "rate-limit" | "ratelimit" => EngineErrorKind::RateLimit,
        "timeout" => EngineErrorKind::Timeout,
        "crash" => EngineErrorKind::Crash,
        _ => EngineErrorKind::Unknown,
    }
}

const RATE_LIMIT_PATTERNS: &[&str] = &[
    r"(?i)rate.?limit",
    r"\b429\b",
    r"(?i)too many requests",
    r"(?i)quota exceeded",
    r"(?i)overloaded",
];

fn builtin_rate_limit_set() -> &'static regex::RegexSet {
    static SET: OnceLock<regex::RegexSet> = OnceLock::new();
    SET.get_or_init(|| {
        regex::RegexSet::new(RATE_LIMIT_PATTERNS).expect("builtin rate-limit patterns are valid")
    })
}

/// Whether free-form engine output reads like provider rate limiting.
/// `extra_patterns` come from the engine's config and are regexes; invalid
/// ones are ignored.
pub fn looks_rate_limited(text: &str, extra_patterns: &[String]) -> bool {
    if builtin_rate_limit_set().is_match(text) {
        return true;
    }
    extra_patterns.iter().any(|p| {
        regex::Regex::new(p)
            .map(|re| re.is_match(text))
            .unwrap_or(false)
    })
}
