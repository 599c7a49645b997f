//! [`TaskOrchestrator`] – the task state machine.
//!
//! ```text
//!            mark_in_progress            complete / fail
//!  pending ──────────────────▶ in_progress ─────────────▶ completed | failed
//!     │                            │
//!     └──────── cancel ────────────┴──────────────────▶ cancelled
//! ```
//!
//! * Every transition holds the task's own mutex for its whole duration,
//!   including the compliance gate, so transitions on one task are totally
//!   ordered. Different tasks never contend.
//! * `complete` / `fail` / `cancel` on a task that is already terminal return
//!   it unchanged. Agents report over an at-least-once transport.
//! * Submission is all-or-nothing: directive synthesis and agent selection
//!   happen before any task row exists.
//! * Human review is advisory. A flagged output still completes; the flag
//!   rides in the output envelope.
//! * A task whose directive lapses fails with `"directive expired"` instead
//!   of completing against stale constraints.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use mothership_kernel::{AgentRegistry, ComplianceGate};
use mothership_memory::Ledger;
use mothership_middleware::{AgentReceiver, Assignment, RealtimeBus, ServerMessage, TaskReport};
use mothership_types::{
    AgentId, CapabilityMap, Directive, DirectiveId, EntityKind, Event, EventPayload,
    MothershipError, Task, TaskId, TaskOutput, TaskStatus,
};
use parking_lot::RwLock;
use serde::Deserialize;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::directive_engine::DirectiveGenerator;

const EVENT_SOURCE: &str = "mothership-runtime::orchestrator";

/// `error_message` of a task whose directive lapsed before it finished.
pub const DIRECTIVE_EXPIRED: &str = "directive expired";
/// `error_message` of a task failed by the watchdog.
pub const TIMEOUT: &str = "timeout";
/// `error_message` of an open task whose agent stopped heartbeating.
pub const AGENT_LOST: &str = "agent heartbeat timeout";

/// Who is asking for a transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Actor {
    /// Only the assigned agent may start its task.
    Agent(AgentId),
    Admin,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SubmitRequest {
    #[serde(default)]
    pub user_id: Option<String>,
    pub agent_type: String,
    pub context: String,
    #[serde(default)]
    pub required_capabilities: CapabilityMap,
    /// Defaults to `{"context": <context>}` when absent.
    #[serde(default)]
    pub input_data: serde_json::Value,
}

impl SubmitRequest {
    pub fn new(agent_type: impl Into<String>, context: impl Into<String>) -> Self {
        Self {
            user_id: None,
            agent_type: agent_type.into(),
            context: context.into(),
            required_capabilities: CapabilityMap::new(),
            input_data: serde_json::Value::Null,
        }
    }

    pub fn with_input(mut self, input_data: serde_json::Value) -> Self {
        self.input_data = input_data;
        self
    }
}

/// Bind an explicit agent to an existing directive.
#[derive(Debug, Clone, Deserialize)]
pub struct CreateTask {
    #[serde(default)]
    pub user_id: Option<String>,
    pub agent_id: AgentId,
    pub directive_id: DirectiveId,
    #[serde(default)]
    pub input_data: serde_json::Value,
}

type TaskSlot = Arc<Mutex<Task>>;

pub struct TaskOrchestrator {
    directives: Arc<DirectiveGenerator>,
    registry: Arc<AgentRegistry>,
    gate: Arc<ComplianceGate>,
    bus: RealtimeBus,
    ledger: Arc<Ledger>,
    tasks: RwLock<HashMap<TaskId, TaskSlot>>,
}

impl TaskOrchestrator {
    /// Build the orchestrator, reloading every task the ledger holds.
    pub fn new(
        directives: Arc<DirectiveGenerator>,
        registry: Arc<AgentRegistry>,
        gate: Arc<ComplianceGate>,
        bus: RealtimeBus,
        ledger: Arc<Ledger>,
    ) -> Result<Self, MothershipError> {
        let tasks: HashMap<TaskId, TaskSlot> = ledger
            .load_tasks()?
            .into_iter()
            .map(|t| (t.id, Arc::new(Mutex::new(t))))
            .collect();
        debug!(tasks = tasks.len(), "task orchestrator restored");
        Ok(Self {
            directives,
            registry,
            gate,
            bus,
            ledger,
            tasks: RwLock::new(tasks),
        })
    }

    // ── Creation ────────────────────────────────────────────────────────────

    /// Generate (or reuse) a directive, pick an agent and assign a new task.
    ///
    /// Nothing is created when either step fails.
    pub async fn submit(&self, req: SubmitRequest) -> Result<Task, MothershipError> {
        let directive = self.directives.generate(&req.agent_type, &req.context).await?;
        let agent = self.registry.select_for_assignment(
            &req.agent_type,
            &req.required_capabilities,
            Utc::now(),
        )?;
        let input_data = if req.input_data.is_null() {
            serde_json::json!({ "context": req.context })
        } else {
            req.input_data
        };
        self.open_task(req.user_id, agent.id, &directive, input_data)
    }

    /// Create a task for a known agent under a known, unexpired directive.
    pub async fn create_task(&self, req: CreateTask) -> Result<Task, MothershipError> {
        let agent = self.registry.get(req.agent_id)?;
        let directive = self.directives.get(req.directive_id)?;
        if directive.is_expired(Utc::now()) {
            return Err(MothershipError::DirectiveExpired(directive.id));
        }
        self.open_task(req.user_id, agent.id, &directive, req.input_data)
    }

    fn open_task(
        &self,
        user_id: Option<String>,
        agent_id: AgentId,
        directive: &Directive,
        input_data: serde_json::Value,
    ) -> Result<Task, MothershipError> {
        let task = Task {
            id: Uuid::new_v4(),
            user_id,
            agent_id,
            directive_id: directive.id,
            input_data,
            output_data: None,
            status: TaskStatus::Pending,
            error_message: None,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
        };
        self.ledger.save_task(&task)?;
        self.tasks
            .write()
            .insert(task.id, Arc::new(Mutex::new(task.clone())));

        let delivery = self.bus.publish_to_agent(
            agent_id,
            ServerMessage::Assignment(Assignment::new(&task, directive)),
        );
        info!(
            task_id = %task.id,
            agent_id = %agent_id,
            directive_id = %directive.id,
            ?delivery,
            "task assigned"
        );
        self.publish_status(&task);
        Ok(task)
    }

    // ── Transitions ─────────────────────────────────────────────────────────

    /// `pending → in_progress`.
    pub async fn mark_in_progress(&self, task_id: TaskId, actor: Actor) -> Result<Task, MothershipError> {
        let slot = self.slot(task_id)?;
        let mut task = slot.lock().await;
        if let Actor::Agent(agent_id) = actor {
            if agent_id != task.agent_id {
                warn!(task_id = %task_id, agent_id = %agent_id, "start rejected: not the assigned agent");
                return Err(MothershipError::Unauthorized { task_id, agent_id });
            }
        }
        if task.status != TaskStatus::Pending {
            return Err(invalid(&task, "start"));
        }
        let mut next = task.clone();
        next.status = TaskStatus::InProgress;
        next.started_at = Some(Utc::now());
        self.commit(&mut task, next)?;
        info!(task_id = %task_id, "task in progress");
        Ok(task.clone())
    }

    /// `in_progress → completed`, or `→ failed` when the directive lapsed.
    pub async fn complete(
        &self,
        task_id: TaskId,
        output: serde_json::Value,
    ) -> Result<Task, MothershipError> {
        let slot = self.slot(task_id)?;
        let mut task = slot.lock().await;
        if task.status.is_terminal() {
            debug!(task_id = %task_id, status = %task.status, "duplicate completion ignored");
            return Ok(task.clone());
        }
        if task.status != TaskStatus::InProgress {
            return Err(invalid(&task, "complete"));
        }

        let directive = self.directives.get(task.directive_id)?;
        let now = Utc::now();
        let mut next = task.clone();
        if directive.is_expired(now) {
            warn!(task_id = %task_id, directive_id = %directive.id, "directive expired before completion");
            next.status = TaskStatus::Failed;
            next.error_message = Some(DIRECTIVE_EXPIRED.to_string());
            next.completed_at = Some(now);
        } else {
            let compliance = self.gate.evaluate(&directive, &output).await;
            info!(
                task_id = %task_id,
                compliance_score = compliance.compliance_score,
                bias_score = compliance.bias_score,
                requires_human_review = compliance.requires_human_review,
                "task completed"
            );
            next.status = TaskStatus::Completed;
            next.output_data = Some(TaskOutput {
                data: output,
                compliance,
            });
            next.completed_at = Some(Utc::now());
        }
        self.commit(&mut task, next)?;
        Ok(task.clone())
    }

    /// `in_progress → failed`.
    pub async fn fail(&self, task_id: TaskId, message: impl Into<String>) -> Result<Task, MothershipError> {
        let slot = self.slot(task_id)?;
        let mut task = slot.lock().await;
        if task.status.is_terminal() {
            return Ok(task.clone());
        }
        if task.status != TaskStatus::InProgress {
            return Err(invalid(&task, "fail"));
        }
        let message = message.into();
        warn!(task_id = %task_id, error = %message, "task failed");
        self.fail_locked(&mut task, message, Utc::now())?;
        Ok(task.clone())
    }

    /// `pending | in_progress → cancelled`.
    pub async fn cancel(&self, task_id: TaskId) -> Result<Task, MothershipError> {
        let slot = self.slot(task_id)?;
        let mut task = slot.lock().await;
        if task.status.is_terminal() {
            return Ok(task.clone());
        }
        let mut next = task.clone();
        next.status = TaskStatus::Cancelled;
        next.completed_at = Some(Utc::now());
        self.commit(&mut task, next)?;
        info!(task_id = %task_id, "task cancelled");
        Ok(task.clone())
    }

    /// Apply a progress report received from `agent_id`.
    ///
    /// A repeated `in_progress` report for a running task is a no-op.
    pub async fn apply_report(
        &self,
        agent_id: AgentId,
        report: TaskReport,
    ) -> Result<Task, MothershipError> {
        let task_id = report.task_id;
        {
            let slot = self.slot(task_id)?;
            let task = slot.lock().await;
            if task.agent_id != agent_id {
                warn!(task_id = %task_id, agent_id = %agent_id, "report from unassigned agent rejected");
                return Err(MothershipError::Unauthorized { task_id, agent_id });
            }
            if report.status == TaskStatus::InProgress && task.status == TaskStatus::InProgress {
                return Ok(task.clone());
            }
        }
        match report.status {
            TaskStatus::InProgress => self.mark_in_progress(task_id, Actor::Agent(agent_id)).await,
            TaskStatus::Completed => {
                self.complete(task_id, report.output_data.unwrap_or_default())
                    .await
            }
            TaskStatus::Failed => {
                let message = report
                    .error_message
                    .unwrap_or_else(|| "agent reported failure".to_string());
                self.fail(task_id, message).await
            }
            other => Err(MothershipError::Validation(format!(
                "agents cannot report status '{other}'"
            ))),
        }
    }

    // ── Watchdog ────────────────────────────────────────────────────────────

    /// Fail every `in_progress` task that started more than `max_duration`
    /// before `now`. Returns the tasks that were failed.
    pub async fn timeout_overdue(&self, max_duration: Duration, now: DateTime<Utc>) -> Vec<Task> {
        let mut failed = Vec::new();
        for slot in self.snapshot() {
            let mut task = slot.lock().await;
            if task.status != TaskStatus::InProgress {
                continue;
            }
            let started = task.started_at.unwrap_or(task.created_at);
            if now.signed_duration_since(started) < max_duration {
                continue;
            }
            warn!(task_id = %task.id, "task timed out");
            match self.fail_locked(&mut task, TIMEOUT.to_string(), now) {
                Ok(()) => failed.push(task.clone()),
                Err(e) => warn!(task_id = %task.id, error = %e, "failed to persist timeout"),
            }
        }
        failed
    }

    /// Fail every open task whose directive has lapsed.
    pub async fn fail_expired(&self, now: DateTime<Utc>) -> Vec<Task> {
        let mut directives: HashMap<DirectiveId, Option<Directive>> = HashMap::new();
        let mut failed = Vec::new();
        for slot in self.snapshot() {
            let mut task = slot.lock().await;
            if task.status.is_terminal() {
                continue;
            }
            let directive = directives
                .entry(task.directive_id)
                .or_insert_with(|| self.directives.get(task.directive_id).ok());
            if !directive.as_ref().is_some_and(|d| d.is_expired(now)) {
                continue;
            }
            warn!(task_id = %task.id, "directive lapsed on open task");
            match self.fail_locked(&mut task, DIRECTIVE_EXPIRED.to_string(), now) {
                Ok(()) => failed.push(task.clone()),
                Err(e) => warn!(task_id = %task.id, error = %e, "failed to persist expiry"),
            }
        }
        failed
    }

    /// Fail every open task assigned to `agent_id`. Called once the agent has
    /// been demoted for missing its heartbeat window.
    pub async fn fail_for_agent(
        &self,
        agent_id: AgentId,
        message: &str,
        now: DateTime<Utc>,
    ) -> Vec<Task> {
        let mut failed = Vec::new();
        for slot in self.snapshot() {
            let mut task = slot.lock().await;
            if task.agent_id != agent_id || task.status.is_terminal() {
                continue;
            }
            warn!(task_id = %task.id, agent_id = %agent_id, "agent lost; failing open task");
            match self.fail_locked(&mut task, message.to_string(), now) {
                Ok(()) => failed.push(task.clone()),
                Err(e) => warn!(task_id = %task.id, error = %e, "failed to persist agent loss"),
            }
        }
        failed
    }

    // ── Redelivery ──────────────────────────────────────────────────────────

    /// Pending tasks assigned to `agent_id`, oldest first.
    pub async fn pending_for_agent(&self, agent_id: AgentId) -> Vec<Task> {
        let mut pending = Vec::new();
        for slot in self.snapshot() {
            let task = slot.lock().await;
            if task.agent_id == agent_id && task.status == TaskStatus::Pending {
                pending.push(task.clone());
            }
        }
        pending.sort_by_key(|t| t.created_at);
        pending
    }

    /// Open the agent's lane with each of its pending assignments replayed
    /// exactly once, ahead of anything still parked for it.
    pub async fn attach_agent(&self, agent_id: AgentId) -> Result<AgentReceiver, MothershipError> {
        let pending = self.pending_for_agent(agent_id).await;
        let mut replay = Vec::with_capacity(pending.len());
        for task in &pending {
            let directive = self.directives.get(task.directive_id)?;
            replay.push(ServerMessage::Assignment(Assignment::new(task, &directive)));
        }
        if !replay.is_empty() {
            info!(agent_id = %agent_id, count = replay.len(), "pending assignments replayed");
        }
        Ok(self.bus.subscribe_agent_with(agent_id, replay))
    }

    // ── Queries ─────────────────────────────────────────────────────────────

    pub async fn get(&self, task_id: TaskId) -> Result<Task, MothershipError> {
        let slot = self.slot(task_id)?;
        let task = slot.lock().await;
        Ok(task.clone())
    }

    /// Newest first.
    pub fn list_recent(&self, limit: usize) -> Result<Vec<Task>, MothershipError> {
        Ok(self.ledger.list_recent_tasks(limit)?)
    }

    pub fn count(&self) -> Result<usize, MothershipError> {
        Ok(self.ledger.count_tasks()?)
    }

    pub async fn generate_directive(
        &self,
        task_type: &str,
        context: &str,
    ) -> Result<Directive, MothershipError> {
        let directive = self.directives.generate(task_type, context).await?;
        self.bus.publish_event(Event::new(
            EVENT_SOURCE,
            EventPayload::DirectiveIssued {
                directive_id: directive.id,
                task_type: directive.task_type.clone(),
            },
        ));
        Ok(directive)
    }

    pub fn get_directive(&self, id: DirectiveId) -> Result<Directive, MothershipError> {
        self.directives.get(id)
    }

    // ── Internals ───────────────────────────────────────────────────────────

    fn slot(&self, task_id: TaskId) -> Result<TaskSlot, MothershipError> {
        self.tasks
            .read()
            .get(&task_id)
            .cloned()
            .ok_or(MothershipError::NotFound {
                kind: EntityKind::Task,
                id: task_id,
            })
    }

    fn snapshot(&self) -> Vec<TaskSlot> {
        self.tasks.read().values().cloned().collect()
    }

    /// Persist `next` and only then make it visible.
    fn commit(&self, current: &mut Task, next: Task) -> Result<(), MothershipError> {
        self.ledger.save_task(&next)?;
        if current.status == TaskStatus::Pending && next.status != TaskStatus::Pending {
            self.bus.retract_assignment(next.agent_id, next.id);
        }
        *current = next;
        self.publish_status(current);
        Ok(())
    }

    fn fail_locked(
        &self,
        task: &mut Task,
        message: String,
        now: DateTime<Utc>,
    ) -> Result<(), MothershipError> {
        let mut next = task.clone();
        next.status = TaskStatus::Failed;
        next.error_message = Some(message);
        next.completed_at = Some(now);
        self.commit(task, next)
    }

    fn publish_status(&self, task: &Task) {
        self.bus.publish_event(Event::new(
            EVENT_SOURCE,
            EventPayload::TaskStatus {
                task_id: task.id,
                agent_id: task.agent_id,
                status: task.status,
                requires_human_review: task
                    .output_data
                    .as_ref()
                    .map(|o| o.compliance.requires_human_review),
                error_message: task.error_message.clone(),
            },
        ));
    }
}

fn invalid(task: &Task, action: &str) -> MothershipError {
    MothershipError::InvalidTransition {
        task_id: task.id,
        from: task.status,
        action: action.to_string(),
    }
}
