//! Satisfaction tests for each [`Constraint`] kind.
//!
//! | Kind                  | Satisfied when                                          |
//! |-----------------------|---------------------------------------------------------|
//! | `forbidden_topic`     | no keyword occurs as a whole-token run in the text      |
//! | `required_disclosure` | the top-level field is present and not null or empty    |
//! | `max_length`          | the text has at most `max_chars` characters             |
//! | `guideline`           | always (advisory)                                       |
//!
//! "Text" is every string leaf of the output JSON, joined with newlines, so a
//! bare string output and `{"result": "..."}` are checked the same way.

use mothership_types::{Constraint, ConstraintSet, ConstraintViolation};

/// Read-only view of an agent's output used by the checks.
pub struct AgentOutput<'a> {
    raw: &'a serde_json::Value,
    text: String,
}

impl<'a> AgentOutput<'a> {
    pub fn new(raw: &'a serde_json::Value) -> Self {
        let mut parts = Vec::new();
        collect_strings(raw, &mut parts);
        Self {
            raw,
            text: parts.join("\n"),
        }
    }

    pub fn text(&self) -> &str {
        &self.text
    }

    /// Top-level field lookup; `None` for non-object outputs.
    pub fn field(&self, name: &str) -> Option<&serde_json::Value> {
        self.raw.as_object().and_then(|o| o.get(name))
    }
}

fn collect_strings<'v>(value: &'v serde_json::Value, out: &mut Vec<&'v str>) {
    match value {
        serde_json::Value::String(s) => out.push(s),
        serde_json::Value::Array(items) => items.iter().for_each(|v| collect_strings(v, out)),
        serde_json::Value::Object(map) => map.values().for_each(|v| collect_strings(v, out)),
        _ => {}
    }
}

fn tokens(text: &str) -> Vec<String> {
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|t| !t.is_empty())
        .map(str::to_lowercase)
        .collect()
}

fn is_blank(value: &serde_json::Value) -> bool {
    match value {
        serde_json::Value::Null => true,
        serde_json::Value::String(s) => s.trim().is_empty(),
        serde_json::Value::Array(a) => a.is_empty(),
        serde_json::Value::Object(o) => o.is_empty(),
        _ => false,
    }
}

/// Test one constraint entry, returning the violation if it is unsatisfied.
pub fn check(key: &str, constraint: &Constraint, output: &AgentOutput<'_>) -> Option<ConstraintViolation> {
    let detail = match constraint {
        Constraint::ForbiddenTopic { keywords } => {
            let haystack = tokens(output.text());
            let hit = keywords.iter().find(|keyword| {
                let needle = tokens(keyword);
                !needle.is_empty() && haystack.windows(needle.len()).any(|w| w == needle.as_slice())
            })?;
            format!("mentions forbidden topic '{hit}'")
        }
        Constraint::RequiredDisclosure { field } => match output.field(field) {
            Some(v) if !is_blank(v) => return None,
            _ => format!("missing required field '{field}'"),
        },
        Constraint::MaxLength { max_chars } => {
            let len = output.text().chars().count();
            if len <= *max_chars {
                return None;
            }
            format!("{len} characters exceeds limit of {max_chars}")
        }
        Constraint::Guideline { .. } => return None,
    };
    Some(ConstraintViolation {
        key: key.to_string(),
        kind: constraint.kind(),
        detail,
    })
}

/// Check every entry of `constraints`, in key order.
pub fn check_all(constraints: &ConstraintSet, output: &AgentOutput<'_>) -> Vec<ConstraintViolation> {
    constraints
        .iter()
        .filter_map(|(key, c)| check(key, c, output))
        .collect()
}

/// `1 − violated / total`, floored at zero. An empty set scores `1.0`.
pub fn compliance_score(violated: usize, total: usize) -> f32 {
    if total == 0 {
        return 1.0;
    }
    (1.0 - violated as f32 / total as f32).max(0.0)
}
