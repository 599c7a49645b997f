//! Agent wire protocol.
//!
//! Every frame is a JSON object tagged by `"type"`.
//!
//! | Direction      | `type`              | Payload                                            |
//! |----------------|---------------------|----------------------------------------------------|
//! | server → agent | `welcome`           | `agent_id`, `heartbeat_interval_secs`              |
//! | server → agent | `assignment`        | `task_id`, `directive {id, constraints, expires_at}`, `input_data` |
//! | server → agent | `heartbeat`         | `timestamp` (liveness check)                       |
//! | server → agent | `heartbeat_ack`     | `timestamp`                                        |
//! | server → agent | `error`             | `message`                                          |
//! | agent → server | `heartbeat`         | optional `timestamp`                               |
//! | agent → server | `task_request`      | `task_id`, `status`, `output_data?`, `error_message?` |
//! | agent → server | `status_update`     | `status`                                           |

use chrono::{DateTime, Utc};
use mothership_types::{AgentId, AgentStatus, ConstraintSet, Directive, DirectiveId, Task, TaskId, TaskStatus};
use serde::{Deserialize, Serialize};

/// Directive as seen by the agent: only what it needs to comply.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AssignedDirective {
    pub id: DirectiveId,
    pub constraints: ConstraintSet,
    pub expires_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Assignment {
    pub task_id: TaskId,
    pub directive: AssignedDirective,
    pub input_data: serde_json::Value,
}

impl Assignment {
    pub fn new(task: &Task, directive: &Directive) -> Self {
        Self {
            task_id: task.id,
            directive: AssignedDirective {
                id: directive.id,
                constraints: directive.constraints.clone(),
                expires_at: directive.expires_at,
            },
            input_data: task.input_data.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    /// First frame on a lane; confirms the agent is registered.
    Welcome {
        agent_id: AgentId,
        heartbeat_interval_secs: u64,
    },
    Assignment(Assignment),
    Heartbeat {
        timestamp: DateTime<Utc>,
    },
    HeartbeatAck {
        timestamp: DateTime<Utc>,
    },
    Error {
        message: String,
    },
}

/// Progress report for one task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskReport {
    pub task_id: TaskId,
    /// `in_progress`, `completed` or `failed`.
    pub status: TaskStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output_data: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AgentMessage {
    Heartbeat {
        #[serde(default)]
        timestamp: Option<DateTime<Utc>>,
    },
    TaskRequest(TaskReport),
    StatusUpdate {
        status: AgentStatus,
    },
}

impl ServerMessage {
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

impl AgentMessage {
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    pub fn from_json(raw: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(raw)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    #[test]
    fn assignment_frame_shape() {
        let msg = ServerMessage::Assignment(Assignment {
            task_id: Uuid::nil(),
            directive: AssignedDirective {
                id: Uuid::nil(),
                constraints: ConstraintSet::new(),
                expires_at: None,
            },
            input_data: serde_json::json!({"problem": "2x+3=7"}),
        });
        let v: serde_json::Value = serde_json::from_str(&msg.to_json().unwrap()).unwrap();
        assert_eq!(v["type"], "assignment");
        assert_eq!(v["input_data"]["problem"], "2x+3=7");
        assert_eq!(v["directive"]["constraints"]["version"], 1);
    }

    #[test]
    fn task_request_parses_with_optional_fields() {
        let raw = format!(
            r#"{{"type":"task_request","task_id":"{}","status":"in_progress"}}"#,
            Uuid::nil()
        );
        match AgentMessage::from_json(&raw).unwrap() {
            AgentMessage::TaskRequest(report) => {
                assert_eq!(report.status, TaskStatus::InProgress);
                assert!(report.output_data.is_none());
            }
            other => panic!("unexpected message: {other:?}"),
        }
    }

    #[test]
    fn bare_heartbeat_parses() {
        let msg = AgentMessage::from_json(r#"{"type":"heartbeat"}"#).unwrap();
        assert_eq!(msg, AgentMessage::Heartbeat { timestamp: None });
    }

    #[test]
    fn unknown_type_is_rejected() {
        assert!(AgentMessage::from_json(r#"{"type":"dance"}"#).is_err());
    }
}
