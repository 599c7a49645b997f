use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

pub type ValueId = Uuid;
pub type BeliefId = Uuid;
pub type DirectiveId = Uuid;
pub type AgentId = Uuid;
pub type TaskId = Uuid;

/// Current revision of the [`Constraint`] schema. Bumped whenever a kind is
/// added or its satisfaction test changes meaning.
pub const CONSTRAINT_SCHEMA_VERSION: u32 = 1;

// ─────────────────────────────────────────────────────────────────────────────
// Constraints
// ─────────────────────────────────────────────────────────────────────────────

/// Closed set of constraint kinds a directive may carry.
///
/// Each kind has a deterministic satisfaction test in the compliance gate.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Constraint {
    /// None of the keywords may appear in the output text.
    ForbiddenTopic { keywords: Vec<String> },
    /// The output object must carry a non-empty `field`.
    RequiredDisclosure { field: String },
    /// The output text may not exceed `max_chars` characters.
    MaxLength { max_chars: usize },
    /// Advisory guidance forwarded to the agent. Always satisfied.
    Guideline { text: String },
}

impl Constraint {
    pub fn kind(&self) -> ConstraintKind {
        match self {
            Constraint::ForbiddenTopic { .. } => ConstraintKind::ForbiddenTopic,
            Constraint::RequiredDisclosure { .. } => ConstraintKind::RequiredDisclosure,
            Constraint::MaxLength { .. } => ConstraintKind::MaxLength,
            Constraint::Guideline { .. } => ConstraintKind::Guideline,
        }
    }
}

/// Discriminant of [`Constraint`], used to classify violations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum ConstraintKind {
    ForbiddenTopic,
    RequiredDisclosure,
    MaxLength,
    Guideline,
}

/// Versioned, key-ordered constraint map.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct ConstraintSet {
    pub version: u32,
    #[serde(default)]
    pub entries: BTreeMap<String, Constraint>,
}

impl Default for ConstraintSet {
    fn default() -> Self {
        Self {
            version: CONSTRAINT_SCHEMA_VERSION,
            entries: BTreeMap::new(),
        }
    }
}

impl ConstraintSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder-style insert that overwrites any existing entry.
    pub fn with(mut self, key: impl Into<String>, constraint: Constraint) -> Self {
        self.entries.insert(key.into(), constraint);
        self
    }

    /// Insert `constraint` under `key` only when the key is still free.
    /// Returns `true` when the entry was added.
    pub fn fill(&mut self, key: &str, constraint: &Constraint) -> bool {
        if self.entries.contains_key(key) {
            return false;
        }
        self.entries.insert(key.to_string(), constraint.clone());
        true
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &Constraint)> {
        self.entries.iter()
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Capabilities
// ─────────────────────────────────────────────────────────────────────────────

/// A single capability an agent advertises (or a task requires).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Capability {
    /// Plain presence, e.g. `"latex": {"kind": "flag"}`.
    Flag,
    /// Numeric proficiency; satisfied by any level at or above the requirement.
    Level { value: u32 },
    /// Set of supported tags; satisfied by any superset.
    Tags { values: BTreeSet<String> },
}

impl Capability {
    /// Whether this (held) capability meets `required`.
    pub fn satisfies(&self, required: &Capability) -> bool {
        match (self, required) {
            (_, Capability::Flag) => true,
            (Capability::Level { value: held }, Capability::Level { value: need }) => held >= need,
            (Capability::Tags { values: held }, Capability::Tags { values: need }) => {
                need.is_subset(held)
            }
            _ => false,
        }
    }
}

pub type CapabilityMap = BTreeMap<String, Capability>;

// ─────────────────────────────────────────────────────────────────────────────
// Knowledge
// ─────────────────────────────────────────────────────────────────────────────

/// A desired property of agent behaviour.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Value {
    pub id: ValueId,
    pub name: String,
    pub description: String,
    pub embedding: Vec<f32>,
    /// Constraints this value contributes to matching directives.
    #[serde(default)]
    pub guidance: ConstraintSet,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// An operational guideline linked to one or more [`Value`]s.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Belief {
    pub id: BeliefId,
    pub name: String,
    pub description: String,
    pub embedding: Vec<f32>,
    pub related_values: BTreeSet<ValueId>,
    #[serde(default)]
    pub guidance: ConstraintSet,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// A bounded, expiring set of constraints for one task context.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Directive {
    pub id: DirectiveId,
    pub task_type: String,
    /// Stable hash of `(task_type, context)` used for reuse lookups.
    pub fingerprint: String,
    pub constraints: ConstraintSet,
    pub source_values: BTreeSet<ValueId>,
    pub source_beliefs: BTreeSet<BeliefId>,
    pub created_at: DateTime<Utc>,
    pub expires_at: Option<DateTime<Utc>>,
}

impl Directive {
    /// A directive with no horizon never expires.
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.is_some_and(|at| now >= at)
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Agents
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AgentStatus {
    Active,
    Inactive,
    Error,
    Maintenance,
}

impl AgentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            AgentStatus::Active => "active",
            AgentStatus::Inactive => "inactive",
            AgentStatus::Error => "error",
            AgentStatus::Maintenance => "maintenance",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "active" => Some(AgentStatus::Active),
            "inactive" => Some(AgentStatus::Inactive),
            "error" => Some(AgentStatus::Error),
            "maintenance" => Some(AgentStatus::Maintenance),
            _ => None,
        }
    }
}

impl fmt::Display for AgentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A registered external worker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Agent {
    pub id: AgentId,
    pub name: String,
    pub agent_type: String,
    pub capabilities: CapabilityMap,
    pub status: AgentStatus,
    pub last_heartbeat: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Agent {
    /// Whether every required capability is held at a sufficient level.
    pub fn has_capabilities(&self, required: &CapabilityMap) -> bool {
        required.iter().all(|(key, need)| {
            self.capabilities
                .get(key)
                .is_some_and(|held| held.satisfies(need))
        })
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tasks
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    InProgress,
    Completed,
    Failed,
    Cancelled,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Pending => "pending",
            TaskStatus::InProgress => "in_progress",
            TaskStatus::Completed => "completed",
            TaskStatus::Failed => "failed",
            TaskStatus::Cancelled => "cancelled",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(TaskStatus::Pending),
            "in_progress" => Some(TaskStatus::InProgress),
            "completed" => Some(TaskStatus::Completed),
            "failed" => Some(TaskStatus::Failed),
            "cancelled" => Some(TaskStatus::Cancelled),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskStatus::Completed | TaskStatus::Failed | TaskStatus::Cancelled
        )
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Output envelope stored on a completed task: the agent's data plus the
/// compliance classification it received.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskOutput {
    pub data: serde_json::Value,
    pub compliance: ComplianceReport,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub id: TaskId,
    pub user_id: Option<String>,
    pub agent_id: AgentId,
    pub directive_id: DirectiveId,
    pub input_data: serde_json::Value,
    pub output_data: Option<TaskOutput>,
    pub status: TaskStatus,
    pub error_message: Option<String>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

// ─────────────────────────────────────────────────────────────────────────────
// Compliance
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BiasCategory {
    Gender,
    Racial,
    Cultural,
    Religious,
    Socioeconomic,
    Accessibility,
    Age,
    Disability,
}

impl BiasCategory {
    pub const ALL: [BiasCategory; 8] = [
        BiasCategory::Gender,
        BiasCategory::Racial,
        BiasCategory::Cultural,
        BiasCategory::Religious,
        BiasCategory::Socioeconomic,
        BiasCategory::Accessibility,
        BiasCategory::Age,
        BiasCategory::Disability,
    ];
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BiasSeverity {
    None,
    Low,
    Medium,
    High,
}

impl BiasSeverity {
    /// Bands: `>= 0.3` high, `>= 0.2` medium, `>= 0.1` low.
    pub fn from_score(score: f32) -> Self {
        if score >= 0.3 {
            BiasSeverity::High
        } else if score >= 0.2 {
            BiasSeverity::Medium
        } else if score >= 0.1 {
            BiasSeverity::Low
        } else {
            BiasSeverity::None
        }
    }
}

/// Result of a bias estimator run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BiasAssessment {
    /// Overall score in `[0, 1]`.
    pub score: f32,
    pub severity: BiasSeverity,
    #[serde(default)]
    pub categories: BTreeMap<BiasCategory, f32>,
}

impl BiasAssessment {
    pub fn clean() -> Self {
        Self {
            score: 0.0,
            severity: BiasSeverity::None,
            categories: BTreeMap::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConstraintViolation {
    /// Key of the violated entry in the directive's constraint set.
    pub key: String,
    pub kind: ConstraintKind,
    pub detail: String,
}

/// Classification of one agent output against one directive.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ComplianceReport {
    pub compliance_score: f32,
    pub bias_score: f32,
    pub requires_human_review: bool,
    pub violations: Vec<ConstraintViolation>,
    pub bias: BiasAssessment,
    /// Crisis patterns that matched the output, if any.
    #[serde(default)]
    pub crisis_matches: Vec<String>,
}

// ─────────────────────────────────────────────────────────────────────────────
// Observer events
// ─────────────────────────────────────────────────────────────────────────────

/// Unified event wrapper for the observers topic.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    pub id: Uuid,
    pub timestamp: DateTime<Utc>,
    /// e.g., "mothership-runtime::orchestrator"
    pub source: String,
    pub payload: EventPayload,
}

impl Event {
    pub fn new(source: impl Into<String>, payload: EventPayload) -> Self {
        Self {
            id: Uuid::new_v4(),
            timestamp: Utc::now(),
            source: source.into(),
            payload,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EventPayload {
    TaskStatus {
        task_id: TaskId,
        agent_id: AgentId,
        status: TaskStatus,
        #[serde(skip_serializing_if = "Option::is_none")]
        requires_human_review: Option<bool>,
        #[serde(skip_serializing_if = "Option::is_none")]
        error_message: Option<String>,
    },
    AgentStatus {
        agent_id: AgentId,
        status: AgentStatus,
    },
    DirectiveIssued {
        directive_id: DirectiveId,
        task_type: String,
    },
}

// ─────────────────────────────────────────────────────────────────────────────
// Errors
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntityKind {
    Value,
    Belief,
    Directive,
    Agent,
    Task,
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            EntityKind::Value => "value",
            EntityKind::Belief => "belief",
            EntityKind::Directive => "directive",
            EntityKind::Agent => "agent",
            EntityKind::Task => "task",
        })
    }
}

/// Global error type shared by every orchestration component.
#[derive(Error, Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum MothershipError {
    #[error("{kind} {id} references unknown value {missing}")]
    UnknownReference {
        kind: EntityKind,
        id: Uuid,
        missing: Uuid,
    },

    #[error("{kind} name already taken: {name}")]
    DuplicateName { kind: EntityKind, name: String },

    #[error("no applicable knowledge for task type '{task_type}'")]
    NoApplicableKnowledge { task_type: String },

    #[error("no eligible agent of type '{agent_type}'")]
    NoEligibleAgent { agent_type: String },

    #[error("task {task_id}: cannot {action} from {from}")]
    InvalidTransition {
        task_id: TaskId,
        from: TaskStatus,
        action: String,
    },

    #[error("directive {0} has expired")]
    DirectiveExpired(DirectiveId),

    #[error("{kind} not found: {id}")]
    NotFound { kind: EntityKind, id: Uuid },

    #[error("{kind} {id} is still referenced by a dependent record")]
    ReferencedByDependent { kind: EntityKind, id: Uuid },

    #[error("agent {agent_id} is not assigned to task {task_id}")]
    Unauthorized { task_id: TaskId, agent_id: AgentId },

    #[error("invalid request: {0}")]
    Validation(String),

    #[error("storage error: {0}")]
    Storage(String),

    #[error("provider error: {0}")]
    Provider(String),
}

impl MothershipError {
    /// Short machine-readable error label used in API error bodies.
    pub fn kind(&self) -> &'static str {
        match self {
            MothershipError::UnknownReference { .. } => "unknown_reference",
            MothershipError::DuplicateName { .. } => "duplicate_name",
            MothershipError::NoApplicableKnowledge { .. } => "no_applicable_knowledge",
            MothershipError::NoEligibleAgent { .. } => "no_eligible_agent",
            MothershipError::InvalidTransition { .. } => "invalid_transition",
            MothershipError::DirectiveExpired(_) => "directive_expired",
            MothershipError::NotFound { .. } => "not_found",
            MothershipError::ReferencedByDependent { .. } => "referenced_by_dependent",
            MothershipError::Unauthorized { .. } => "unauthorized",
            MothershipError::Validation(_) => "validation",
            MothershipError::Storage(_) => "storage",
            MothershipError::Provider(_) => "provider",
        }
    }
}

pub type Result<T, E = MothershipError> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn constraint_is_tagged_by_kind() {
        let c = Constraint::ForbiddenTopic {
            keywords: vec!["password".to_string()],
        };
        let json = serde_json::to_value(&c).unwrap();
        assert_eq!(json["kind"], "forbidden_topic");
        assert_eq!(json["keywords"][0], "password");
    }

    #[test]
    fn constraint_set_fill_is_first_wins() {
        let mut set = ConstraintSet::new();
        assert!(set.fill("length", &Constraint::MaxLength { max_chars: 10 }));
        assert!(!set.fill("length", &Constraint::MaxLength { max_chars: 99 }));
        assert_eq!(
            set.entries["length"],
            Constraint::MaxLength { max_chars: 10 }
        );
        assert_eq!(set.version, CONSTRAINT_SCHEMA_VERSION);
    }

    #[test]
    fn unknown_constraint_kind_is_rejected() {
        let raw = r#"{"kind": "vibes", "text": "be nice"}"#;
        assert!(serde_json::from_str::<Constraint>(raw).is_err());
    }

    #[test]
    fn capability_satisfaction_rules() {
        let level3 = Capability::Level { value: 3 };
        assert!(level3.satisfies(&Capability::Level { value: 2 }));
        assert!(!level3.satisfies(&Capability::Level { value: 4 }));
        assert!(level3.satisfies(&Capability::Flag));

        let tags = Capability::Tags {
            values: ["algebra", "calculus"].iter().map(|s| s.to_string()).collect(),
        };
        let need = Capability::Tags {
            values: ["algebra"].iter().map(|s| s.to_string()).collect(),
        };
        assert!(tags.satisfies(&need));
        assert!(!need.satisfies(&tags));
        assert!(!Capability::Flag.satisfies(&level3));
    }

    #[test]
    fn capability_flag_roundtrip() {
        let json = serde_json::to_string(&Capability::Flag).unwrap();
        assert_eq!(json, r#"{"kind":"flag"}"#);
        let back: Capability = serde_json::from_str(&json).unwrap();
        assert_eq!(back, Capability::Flag);
    }

    #[test]
    fn task_status_strings() {
        for status in [
            TaskStatus::Pending,
            TaskStatus::InProgress,
            TaskStatus::Completed,
            TaskStatus::Failed,
            TaskStatus::Cancelled,
        ] {
            assert_eq!(TaskStatus::parse(status.as_str()), Some(status));
            let json = serde_json::to_string(&status).unwrap();
            assert_eq!(json, format!("\"{}\"", status.as_str()));
        }
        assert!(TaskStatus::parse("running").is_none());
        assert!(!TaskStatus::InProgress.is_terminal());
        assert!(TaskStatus::Cancelled.is_terminal());
    }

    #[test]
    fn directive_without_horizon_never_expires() {
        let now = Utc::now();
        let mut d = Directive {
            id: Uuid::new_v4(),
            task_type: "math".to_string(),
            fingerprint: "abc".to_string(),
            constraints: ConstraintSet::new(),
            source_values: BTreeSet::new(),
            source_beliefs: BTreeSet::new(),
            created_at: now,
            expires_at: None,
        };
        assert!(!d.is_expired(now + chrono::Duration::days(3650)));
        d.expires_at = Some(now);
        assert!(d.is_expired(now));
        assert!(!d.is_expired(now - chrono::Duration::seconds(1)));
    }

    #[test]
    fn bias_severity_bands() {
        assert_eq!(BiasSeverity::from_score(0.05), BiasSeverity::None);
        assert_eq!(BiasSeverity::from_score(0.1), BiasSeverity::Low);
        assert_eq!(BiasSeverity::from_score(0.25), BiasSeverity::Medium);
        assert_eq!(BiasSeverity::from_score(0.9), BiasSeverity::High);
    }

    #[test]
    fn event_payload_tagging() {
        let event = Event::new(
            "mothership-runtime::orchestrator",
            EventPayload::TaskStatus {
                task_id: Uuid::new_v4(),
                agent_id: Uuid::new_v4(),
                status: TaskStatus::Completed,
                requires_human_review: Some(false),
                error_message: None,
            },
        );
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["payload"]["type"], "task_status");
        assert_eq!(json["payload"]["status"], "completed");
        assert!(json["payload"].get("error_message").is_none());
    }

    #[test]
    fn error_display_and_kind() {
        let err = MothershipError::NoEligibleAgent {
            agent_type: "math".to_string(),
        };
        assert!(err.to_string().contains("math"));
        assert_eq!(err.kind(), "no_eligible_agent");

        let err = MothershipError::DuplicateName {
            kind: EntityKind::Agent,
            name: "math-1".to_string(),
        };
        assert_eq!(err.to_string(), "agent name already taken: math-1");
    }
}
