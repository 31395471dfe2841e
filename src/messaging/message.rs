//! Message types exchanged between agents.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::error::{MeshError, Result};

/// Error code for a request whose intent has no registered handler.
pub const NO_HANDLER: &str = "no_handler";
/// Error code for a handler that panicked.
pub const HANDLER_PANIC: &str = "handler_panic";
/// Error code for a synthetic requester-side timeout.
pub const TIMEOUT: &str = "timeout";
/// Error code for a request cancelled because the requester stopped.
pub const AGENT_STOPPED: &str = "agent_stopped";
/// Error code for a send that exhausted its transport retries.
pub const TRANSPORT: &str = "transport";

pub fn new_message_id() -> String {
    Uuid::new_v4().to_string()
}

pub fn new_task_id() -> String {
    format!("task-{}", Uuid::new_v4())
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskRequest {
    pub message_id: String,
    pub task_id: String,
    pub source_agent: String,
    pub target_agent: String,
    pub intent: String,
    #[serde(default)]
    pub payload: Value,
    pub created_at: DateTime<Utc>,
}

impl TaskRequest {
    pub fn new(
        source_agent: impl Into<String>,
        target_agent: impl Into<String>,
        intent: impl Into<String>,
        payload: Value,
    ) -> Self {
        Self {
            message_id: new_message_id(),
            task_id: new_task_id(),
            source_agent: source_agent.into(),
            target_agent: target_agent.into(),
            intent: intent.into(),
            payload,
            created_at: Utc::now(),
        }
    }

    /// Same logical task, new delivery attempt.
    pub fn resend(&self) -> Self {
        Self {
            message_id: new_message_id(),
            ..self.clone()
        }
    }

    pub fn validate(&self) -> Result<()> {
        require("message_id", &self.message_id)?;
        require("task_id", &self.task_id)?;
        require("source_agent", &self.source_agent)?;
        require("target_agent", &self.target_agent)?;
        require("intent", &self.intent)?;
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Completed,
    Failed,
    Timeout,
}

impl TaskStatus {
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Completed)
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Timeout => "timeout",
        };
        write!(f, "{}", s)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskError {
    pub code: String,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<Value>,
}

impl TaskError {
    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            message: message.into(),
            detail: None,
        }
    }

    pub fn with_detail(mut self, detail: Value) -> Self {
        self.detail = Some(detail);
        self
    }
}

impl fmt::Display for TaskError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.code, self.message)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskResult {
    pub message_id: String,
    pub task_id: String,
    pub status: TaskStatus,
    #[serde(default)]
    pub output: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<TaskError>,
}

impl TaskResult {
    pub fn completed(task_id: impl Into<String>, output: Value) -> Self {
        Self {
            message_id: new_message_id(),
            task_id: task_id.into(),
            status: TaskStatus::Completed,
            output,
            error: None,
        }
    }

    pub fn failed(task_id: impl Into<String>, error: TaskError) -> Self {
        Self {
            message_id: new_message_id(),
            task_id: task_id.into(),
            status: TaskStatus::Failed,
            output: Value::Null,
            error: Some(error),
        }
    }

    pub fn no_handler(task_id: impl Into<String>, intent: &str) -> Self {
        Self::failed(
            task_id,
            TaskError::new(NO_HANDLER, format!("no handler registered for intent '{}'", intent)),
        )
    }

    /// Synthesized by the requester; never travels over the broker.
    pub fn timeout(task_id: impl Into<String>, waited_ms: u64) -> Self {
        Self {
            message_id: new_message_id(),
            task_id: task_id.into(),
            status: TaskStatus::Timeout,
            output: Value::Null,
            error: Some(TaskError::new(
                TIMEOUT,
                format!("no result within {}ms", waited_ms),
            )),
        }
    }

    pub fn is_completed(&self) -> bool {
        self.status.is_success()
    }

    pub fn error_code(&self) -> Option<&str> {
        self.error.as_ref().map(|e| e.code.as_str())
    }

    pub fn validate(&self) -> Result<()> {
        require("message_id", &self.message_id)?;
        require("task_id", &self.task_id)?;
        match (self.status, &self.error) {
            (TaskStatus::Completed, Some(_)) => Err(MeshError::validation(
                "completed result must not carry an error",
            )),
            (TaskStatus::Failed | TaskStatus::Timeout, None) => Err(MeshError::validation(
                format!("{} result must carry an error", self.status),
            )),
            _ => Ok(()),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentStatus {
    Starting,
    Idle,
    Busy,
    Stopping,
}

impl fmt::Display for AgentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Starting => "starting",
            Self::Idle => "idle",
            Self::Busy => "busy",
            Self::Stopping => "stopping",
        };
        write!(f, "{}", s)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Heartbeat {
    pub agent_id: String,
    pub timestamp: DateTime<Utc>,
    pub status: AgentStatus,
}

impl Heartbeat {
    pub fn new(agent_id: impl Into<String>, status: AgentStatus) -> Self {
        Self {
            agent_id: agent_id.into(),
            timestamp: Utc::now(),
            status,
        }
    }

    pub fn validate(&self) -> Result<()> {
        require("agent_id", &self.agent_id)
    }
}

/// Unit of transport: every broker publish carries exactly one envelope.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Envelope {
    TaskRequest(TaskRequest),
    TaskResult(TaskResult),
    Heartbeat(Heartbeat),
}

impl Envelope {
    /// Dedup key. Heartbeats have none and are never deduplicated.
    pub fn message_id(&self) -> Option<&str> {
        match self {
            Self::TaskRequest(r) => Some(&r.message_id),
            Self::TaskResult(r) => Some(&r.message_id),
            Self::Heartbeat(_) => None,
        }
    }

    pub fn task_id(&self) -> Option<&str> {
        match self {
            Self::TaskRequest(r) => Some(&r.task_id),
            Self::TaskResult(r) => Some(&r.task_id),
            Self::Heartbeat(_) => None,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Self::TaskRequest(_) => "task_request",
            Self::TaskResult(_) => "task_result",
            Self::Heartbeat(_) => "heartbeat",
        }
    }

    pub fn validate(&self) -> Result<()> {
        match self {
            Self::TaskRequest(r) => r.validate(),
            Self::TaskResult(r) => r.validate(),
            Self::Heartbeat(h) => h.validate(),
        }
    }

    /// Mint a fresh delivery id, keeping the task id.
    pub fn with_fresh_message_id(mut self) -> Self {
        match &mut self {
            Self::TaskRequest(r) => r.message_id = new_message_id(),
            Self::TaskResult(r) => r.message_id = new_message_id(),
            Self::Heartbeat(_) => {}
        }
        self
    }
}

impl From<TaskRequest> for Envelope {
    fn from(value: TaskRequest) -> Self {
        Self::TaskRequest(value)
    }
}

impl From<TaskResult> for Envelope {
    fn from(value: TaskResult) -> Self {
        Self::TaskResult(value)
    }
}

impl From<Heartbeat> for Envelope {
    fn from(value: Heartbeat) -> Self {
        Self::Heartbeat(value)
    }
}

fn require(field: &str, value: &str) -> Result<()> {
    if value.trim().is_empty() {
        return Err(MeshError::validation(format!("{} must not be empty", field)));
    }
    Ok(())
}
