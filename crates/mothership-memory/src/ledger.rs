//! Orchestration Ledger.
//!
//! Durable record of the directives, agents and tasks the orchestrator
//! manages. The in-process registries stay authoritative while running; the
//! ledger is written through on every change and read back on start-up.
//!
//! # Storage layout
//!
//! | table        | key           | notes                                            |
//! |--------------|---------------|--------------------------------------------------|
//! | `directives` | `id`          | constraints and source id sets as JSON           |
//! | `agents`     | `id`          | `name` unique, `status` constrained              |
//! | `tasks`      | `id`          | `directive_id` references `directives(id)`,      |
//! |              |               | `status` constrained to the five task states     |
//!
//! `tasks.agent_id` carries no foreign key: deregistering an agent deletes its
//! `agents` row but keeps the tasks it worked on as history.
//!
//! # Example
//!
//! ```rust
//! use mothership_memory::ledger::Ledger;
//!
//! let ledger = Ledger::open_in_memory().unwrap();
//! assert_eq!(ledger.count_tasks().unwrap(), 0);
//! ```

use mothership_types::{Agent, AgentId, Directive, DirectiveId, MothershipError, Task, TaskId};
use parking_lot::Mutex;
use rusqlite::{Connection, OptionalExtension, params};
use thiserror::Error;
use tracing::debug;

use crate::sql::{json_col, opt_json_col, opt_time_col, opt_ts, time_col, ts, uuid_col};

// ─────────────────────────────────────────────────────────────────────────────
// Error type
// ─────────────────────────────────────────────────────────────────────────────

/// Errors that can arise from ledger operations.
#[derive(Error, Debug)]
pub enum LedgerError {
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("Serialization error: {0}")]
    Json(#[from] serde_json::Error),
}

impl From<LedgerError> for MothershipError {
    fn from(err: LedgerError) -> Self {
        MothershipError::Storage(err.to_string())
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Ledger
// ─────────────────────────────────────────────────────────────────────────────

const DIRECTIVE_COLUMNS: &str =
    "id, task_type, fingerprint, constraints, source_values, source_beliefs, created_at, expires_at";
const AGENT_COLUMNS: &str =
    "id, name, agent_type, capabilities, status, last_heartbeat, created_at, updated_at";
const TASK_COLUMNS: &str = "id, user_id, agent_id, directive_id, input_data, output_data, status, \
     error_message, created_at, started_at, completed_at";

/// SQLite-backed persistence for orchestration state.
pub struct Ledger {
    conn: Mutex<Connection>,
}

impl Ledger {
    /// Open (or create) a persistent ledger at `path`.
    pub fn open(path: &str) -> Result<Self, LedgerError> {
        let conn = Connection::open(path)?;
        let ledger = Self {
            conn: Mutex::new(conn),
        };
        ledger.init_schema()?;
        Ok(ledger)
    }

    /// Open a temporary in-memory ledger (useful for testing).
    pub fn open_in_memory() -> Result<Self, LedgerError> {
        let conn = Connection::open_in_memory()?;
        let ledger = Self {
            conn: Mutex::new(conn),
        };
        ledger.init_schema()?;
        Ok(ledger)
    }

    fn init_schema(&self) -> Result<(), LedgerError> {
        self.conn.lock().execute_batch(
            "PRAGMA foreign_keys = ON;
            CREATE TABLE IF NOT EXISTS directives (
                id             TEXT NOT NULL PRIMARY KEY,
                task_type      TEXT NOT NULL,
                fingerprint    TEXT NOT NULL,
                constraints    TEXT NOT NULL,
                source_values  TEXT NOT NULL,
                source_beliefs TEXT NOT NULL,
                created_at     TEXT NOT NULL,
                expires_at     TEXT
            );
            CREATE TABLE IF NOT EXISTS agents (
                id             TEXT NOT NULL PRIMARY KEY,
                name           TEXT NOT NULL UNIQUE,
                agent_type     TEXT NOT NULL,
                capabilities   TEXT NOT NULL,
                status         TEXT NOT NULL DEFAULT 'inactive'
                    CHECK (status IN ('active', 'inactive', 'error', 'maintenance')),
                last_heartbeat TEXT,
                created_at     TEXT NOT NULL,
                updated_at     TEXT NOT NULL
            );
            CREATE TABLE IF NOT EXISTS tasks (
                id            TEXT NOT NULL PRIMARY KEY,
                user_id       TEXT,
                -- No REFERENCES agents(id): task history outlives deregistration.
                agent_id      TEXT NOT NULL,
                directive_id  TEXT NOT NULL REFERENCES directives(id),
                input_data    TEXT NOT NULL,
                output_data   TEXT,
                status        TEXT NOT NULL DEFAULT 'pending'
                    CHECK (status IN ('pending', 'in_progress', 'completed', 'failed', 'cancelled')),
                error_message TEXT,
                created_at    TEXT NOT NULL,
                started_at    TEXT,
                completed_at  TEXT
            );
            CREATE INDEX IF NOT EXISTS tasks_created_at ON tasks (created_at);",
        )?;
        Ok(())
    }

    // ── Directives ──────────────────────────────────────────────────────────

    /// Directives are immutable; a repeated save of the same id is ignored.
    pub fn save_directive(&self, directive: &Directive) -> Result<(), LedgerError> {
        self.conn.lock().execute(
            "INSERT OR IGNORE INTO directives
                 (id, task_type, fingerprint, constraints, source_values, source_beliefs, created_at, expires_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                directive.id.to_string(),
                directive.task_type,
                directive.fingerprint,
                serde_json::to_string(&directive.constraints)?,
                serde_json::to_string(&directive.source_values)?,
                serde_json::to_string(&directive.source_beliefs)?,
                ts(&directive.created_at),
                opt_ts(&directive.expires_at),
            ],
        )?;
        debug!(directive_id = %directive.id, "directive persisted");
        Ok(())
    }

    pub fn get_directive(&self, id: DirectiveId) -> Result<Option<Directive>, LedgerError> {
        let conn = self.conn.lock();
        let sql = format!("SELECT {DIRECTIVE_COLUMNS} FROM directives WHERE id = ?1");
        Ok(conn
            .query_row(&sql, params![id.to_string()], row_to_directive)
            .optional()?)
    }

    pub fn load_directives(&self) -> Result<Vec<Directive>, LedgerError> {
        let conn = self.conn.lock();
        let sql = format!("SELECT {DIRECTIVE_COLUMNS} FROM directives ORDER BY created_at ASC");
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map([], row_to_directive)?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    // ── Agents ──────────────────────────────────────────────────────────────

    pub fn save_agent(&self, agent: &Agent) -> Result<(), LedgerError> {
        self.conn.lock().execute(
            "INSERT INTO agents
                 (id, name, agent_type, capabilities, status, last_heartbeat, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
             ON CONFLICT(id) DO UPDATE SET
                 capabilities = excluded.capabilities,
                 status = excluded.status,
                 last_heartbeat = excluded.last_heartbeat,
                 updated_at = excluded.updated_at",
            params![
                agent.id.to_string(),
                agent.name,
                agent.agent_type,
                serde_json::to_string(&agent.capabilities)?,
                agent.status.as_str(),
                opt_ts(&agent.last_heartbeat),
                ts(&agent.created_at),
                ts(&agent.updated_at),
            ],
        )?;
        Ok(())
    }

    pub fn delete_agent(&self, id: AgentId) -> Result<(), LedgerError> {
        self.conn
            .lock()
            .execute("DELETE FROM agents WHERE id = ?1", params![id.to_string()])?;
        Ok(())
    }

    /// All agents in registration order.
    pub fn load_agents(&self) -> Result<Vec<Agent>, LedgerError> {
        let conn = self.conn.lock();
        let sql = format!("SELECT {AGENT_COLUMNS} FROM agents ORDER BY created_at ASC, rowid ASC");
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map([], row_to_agent)?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    // ── Tasks ───────────────────────────────────────────────────────────────

    /// Insert or update a task row. The bound directive must already be saved.
    pub fn save_task(&self, task: &Task) -> Result<(), LedgerError> {
        let output = task.output_data.as_ref().map(serde_json::to_string).transpose()?;
        self.conn.lock().execute(
            "INSERT INTO tasks
                 (id, user_id, agent_id, directive_id, input_data, output_data, status,
                  error_message, created_at, started_at, completed_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)
             ON CONFLICT(id) DO UPDATE SET
                 output_data = excluded.output_data,
                 status = excluded.status,
                 error_message = excluded.error_message,
                 started_at = excluded.started_at,
                 completed_at = excluded.completed_at",
            params![
                task.id.to_string(),
                task.user_id,
                task.agent_id.to_string(),
                task.directive_id.to_string(),
                serde_json::to_string(&task.input_data)?,
                output,
                task.status.as_str(),
                task.error_message,
                ts(&task.created_at),
                opt_ts(&task.started_at),
                opt_ts(&task.completed_at),
            ],
        )?;
        Ok(())
    }

    pub fn get_task(&self, id: TaskId) -> Result<Option<Task>, LedgerError> {
        let conn = self.conn.lock();
        let sql = format!("SELECT {TASK_COLUMNS} FROM tasks WHERE id = ?1");
        Ok(conn
            .query_row(&sql, params![id.to_string()], row_to_task)
            .optional()?)
    }

    /// Most recent tasks, newest first.
    pub fn list_recent_tasks(&self, limit: usize) -> Result<Vec<Task>, LedgerError> {
        let conn = self.conn.lock();
        let sql = format!(
            "SELECT {TASK_COLUMNS} FROM tasks ORDER BY created_at DESC, rowid DESC LIMIT ?1"
        );
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(params![limit as i64], row_to_task)?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    /// All tasks, oldest first.
    pub fn load_tasks(&self) -> Result<Vec<Task>, LedgerError> {
        let conn = self.conn.lock();
        let sql = format!("SELECT {TASK_COLUMNS} FROM tasks ORDER BY created_at ASC, rowid ASC");
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map([], row_to_task)?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    pub fn count_tasks(&self) -> Result<usize, LedgerError> {
        let n: i64 = self
            .conn
            .lock()
            .query_row("SELECT COUNT(*) FROM tasks", [], |r| r.get(0))?;
        Ok(n as usize)
    }
}

fn row_to_directive(row: &rusqlite::Row<'_>) -> rusqlite::Result<Directive> {
    Ok(Directive {
        id: uuid_col(row, 0)?,
        task_type: row.get(1)?,
        fingerprint: row.get(2)?,
        constraints: json_col(row, 3)?,
        source_values: json_col(row, 4)?,
        source_beliefs: json_col(row, 5)?,
        created_at: time_col(row, 6)?,
        expires_at: opt_time_col(row, 7)?,
    })
}

fn row_to_agent(row: &rusqlite::Row<'_>) -> rusqlite::Result<Agent> {
    let status_str: String = row.get(4)?;
    let status = mothership_types::AgentStatus::parse(&status_str).ok_or_else(|| {
        rusqlite::Error::InvalidColumnType(4, status_str, rusqlite::types::Type::Text)
    })?;
    Ok(Agent {
        id: uuid_col(row, 0)?,
        name: row.get(1)?,
        agent_type: row.get(2)?,
        capabilities: json_col(row, 3)?,
        status,
        last_heartbeat: opt_time_col(row, 5)?,
        created_at: time_col(row, 6)?,
        updated_at: time_col(row, 7)?,
    })
}

fn row_to_task(row: &rusqlite::Row<'_>) -> rusqlite::Result<Task> {
    let status_str: String = row.get(6)?;
    let status = mothership_types::TaskStatus::parse(&status_str).ok_or_else(|| {
        rusqlite::Error::InvalidColumnType(6, status_str, rusqlite::types::Type::Text)
    })?;
    Ok(Task {
        id: uuid_col(row, 0)?,
        user_id: row.get(1)?,
        agent_id: uuid_col(row, 2)?,
        directive_id: uuid_col(row, 3)?,
        input_data: json_col(row, 4)?,
        output_data: opt_json_col(row, 5)?,
        status,
        error_message: row.get(7)?,
        created_at: time_col(row, 8)?,
        started_at: opt_time_col(row, 9)?,
        completed_at: opt_time_col(row, 10)?,
    })
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, Utc};
    use mothership_types::{
        AgentStatus, BiasAssessment, Capability, ComplianceReport, ConstraintSet, TaskOutput,
        TaskStatus,
    };
    use std::collections::{BTreeMap, BTreeSet};
    use uuid::Uuid;

    fn make_directive() -> Directive {
        let now = Utc::now();
        Directive {
            id: Uuid::new_v4(),
            task_type: "math".to_string(),
            fingerprint: "fp".to_string(),
            constraints: ConstraintSet::new(),
            source_values: [Uuid::new_v4()].into_iter().collect(),
            source_beliefs: BTreeSet::new(),
            created_at: now,
            expires_at: Some(now + Duration::hours(24)),
        }
    }

    fn make_agent(name: &str) -> Agent {
        let now = Utc::now();
        let mut capabilities = BTreeMap::new();
        capabilities.insert("algebra".to_string(), Capability::Level { value: 2 });
        Agent {
            id: Uuid::new_v4(),
            name: name.to_string(),
            agent_type: "math".to_string(),
            capabilities,
            status: AgentStatus::Active,
            last_heartbeat: Some(now),
            created_at: now,
            updated_at: now,
        }
    }

    fn make_task(directive: &Directive, agent: &Agent) -> Task {
        Task {
            id: Uuid::new_v4(),
            user_id: Some("user-1".to_string()),
            agent_id: agent.id,
            directive_id: directive.id,
            input_data: serde_json::json!({"problem": "2x+3=7"}),
            output_data: None,
            status: TaskStatus::Pending,
            error_message: None,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
        }
    }

    #[test]
    fn directive_roundtrip() {
        let ledger = Ledger::open_in_memory().unwrap();
        let d = make_directive();
        ledger.save_directive(&d).unwrap();
        assert_eq!(ledger.get_directive(d.id).unwrap(), Some(d));
    }

    #[test]
    fn agent_upsert_keeps_single_row() {
        let ledger = Ledger::open_in_memory().unwrap();
        let mut a = make_agent("math-1");
        ledger.save_agent(&a).unwrap();
        a.status = AgentStatus::Inactive;
        ledger.save_agent(&a).unwrap();
        let agents = ledger.load_agents().unwrap();
        assert_eq!(agents.len(), 1);
        assert_eq!(agents[0].status, AgentStatus::Inactive);

        ledger.delete_agent(a.id).unwrap();
        assert!(ledger.load_agents().unwrap().is_empty());
    }

    #[test]
    fn task_requires_saved_directive() {
        let ledger = Ledger::open_in_memory().unwrap();
        let d = make_directive();
        let a = make_agent("math-1");
        let task = make_task(&d, &a);
        assert!(ledger.save_task(&task).is_err());
        assert_eq!(ledger.count_tasks().unwrap(), 0);
    }

    #[test]
    fn deregistered_agent_keeps_task_history() {
        let ledger = Ledger::open_in_memory().unwrap();
        let d = make_directive();
        ledger.save_directive(&d).unwrap();
        let a = make_agent("math-1");
        ledger.save_agent(&a).unwrap();
        let task = make_task(&d, &a);
        ledger.save_task(&task).unwrap();

        ledger.delete_agent(a.id).unwrap();
        assert!(ledger.load_agents().unwrap().is_empty());
        let kept = ledger.get_task(task.id).unwrap().unwrap();
        assert_eq!(kept.agent_id, a.id);
    }

    #[test]
    fn task_terminal_update_is_persisted() {
        let ledger = Ledger::open_in_memory().unwrap();
        let d = make_directive();
        ledger.save_directive(&d).unwrap();
        let a = make_agent("math-1");
        let mut task = make_task(&d, &a);
        ledger.save_task(&task).unwrap();

        task.status = TaskStatus::Completed;
        task.completed_at = Some(Utc::now());
        task.output_data = Some(TaskOutput {
            data: serde_json::json!({"result": "x=2"}),
            compliance: ComplianceReport {
                compliance_score: 1.0,
                bias_score: 0.0,
                requires_human_review: false,
                violations: vec![],
                bias: BiasAssessment::clean(),
                crisis_matches: vec![],
            },
        });
        ledger.save_task(&task).unwrap();

        let back = ledger.get_task(task.id).unwrap().unwrap();
        assert_eq!(back, task);
        assert_eq!(ledger.count_tasks().unwrap(), 1);
    }

    #[test]
    fn recent_tasks_are_newest_first() {
        let ledger = Ledger::open_in_memory().unwrap();
        let d = make_directive();
        ledger.save_directive(&d).unwrap();
        let a = make_agent("math-1");
        let mut ids = Vec::new();
        for i in 0..3 {
            let mut t = make_task(&d, &a);
            t.created_at = Utc::now() + Duration::seconds(i);
            ledger.save_task(&t).unwrap();
            ids.push(t.id);
        }
        let recent: Vec<_> = ledger
            .list_recent_tasks(2)
            .unwrap()
            .into_iter()
            .map(|t| t.id)
            .collect();
        assert_eq!(recent, vec![ids[2], ids[1]]);
    }
}
