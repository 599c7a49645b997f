//! [`OutputVerifier`] – rules that force human review of an agent output.
//!
//! Unlike constraint checks, a hit here does not lower the compliance score.
//! It unconditionally sets `requires_human_review`, and every rule runs even
//! when all constraints pass.
//!
//! One built-in rule is provided:
//! - [`CrisisPatternRule`] – case-insensitive regular expressions for
//!   crisis and safety indicators (self-harm, abuse, emergencies).

use regex::{Regex, RegexBuilder};

use crate::constraint_check::AgentOutput;

// ────────────────────────────────────────────────────────────────────────────
// Rule trait
// ────────────────────────────────────────────────────────────────────────────

/// A single review trigger evaluated against every output.
///
/// Implement this trait for custom triggers and add them to an
/// [`OutputVerifier`] via [`OutputVerifier::add_rule`].
pub trait OutputRule: Send + Sync {
    /// Human-readable name used in logs.
    fn name(&self) -> &str;

    /// Labels of everything in `output` that triggered the rule; empty when
    /// the output is clean.
    fn check(&self, output: &AgentOutput<'_>) -> Vec<String>;
}

// ────────────────────────────────────────────────────────────────────────────
// OutputVerifier
// ────────────────────────────────────────────────────────────────────────────

/// Runs every registered [`OutputRule`] and collects all hits.
///
/// # Example
///
/// ```
/// use mothership_kernel::constraint_check::AgentOutput;
/// use mothership_kernel::output_rules::{CrisisPatternRule, OutputVerifier};
///
/// let mut verifier = OutputVerifier::new();
/// verifier.add_rule(Box::new(CrisisPatternRule::with_defaults()));
///
/// let calm = serde_json::json!({"result": "x=2"});
/// assert!(verifier.verify(&AgentOutput::new(&calm)).is_empty());
///
/// let alarming = serde_json::json!({"result": "I am thinking about self-harm"});
/// assert!(!verifier.verify(&AgentOutput::new(&alarming)).is_empty());
/// ```
#[derive(Default)]
pub struct OutputVerifier {
    rules: Vec<Box<dyn OutputRule>>,
}

impl OutputVerifier {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a new [`OutputRule`]. Rules are evaluated in insertion order.
    pub fn add_rule(&mut self, rule: Box<dyn OutputRule>) {
        self.rules.push(rule);
    }

    pub fn verify(&self, output: &AgentOutput<'_>) -> Vec<String> {
        self.rules
            .iter()
            .flat_map(|rule| {
                let hits = rule.check(output);
                if !hits.is_empty() {
                    tracing::info!(rule = rule.name(), hits = ?hits, "review rule triggered");
                }
                hits
            })
            .collect()
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Built-in rules
// ────────────────────────────────────────────────────────────────────────────

/// Matches crisis and safety indicators in the output text.
pub struct CrisisPatternRule {
    patterns: Vec<(String, Regex)>,
}

impl CrisisPatternRule {
    pub const DEFAULT_PATTERNS: [&'static str; 7] = [
        r"\bsuicid(e|al)\b",
        r"\b(self[- ])?harm\b",
        r"\bkill (myself|yourself)\b",
        r"\babus(e|ed|ive)\b",
        r"\bcrisis\b",
        r"\b(mental health )?emergency\b",
        r"\btrauma(tic)?\b",
    ];

    /// Compile `patterns` case-insensitively.
    pub fn new<S: AsRef<str>>(patterns: &[S]) -> Result<Self, regex::Error> {
        let patterns = patterns
            .iter()
            .map(|p| {
                let p = p.as_ref();
                RegexBuilder::new(p)
                    .case_insensitive(true)
                    .build()
                    .map(|re| (p.to_string(), re))
            })
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self { patterns })
    }

    pub fn with_defaults() -> Self {
        let patterns = Self::DEFAULT_PATTERNS
            .iter()
            .filter_map(|p| {
                RegexBuilder::new(p)
                    .case_insensitive(true)
                    .build()
                    .ok()
                    .map(|re| (p.to_string(), re))
            })
            .collect();
        Self { patterns }
    }
}

impl OutputRule for CrisisPatternRule {
    fn name(&self) -> &str {
        "crisis_pattern"
    }

    fn check(&self, output: &AgentOutput<'_>) -> Vec<String> {
        self.patterns
            .iter()
            .filter(|(_, re)| re.is_match(output.text()))
            .map(|(label, _)| label.clone())
            .collect()
    }
}
