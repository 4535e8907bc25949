//! Bus messages.
//!
//! `MessageKind` is a tagged union with one variant per message type, so a
//! payload can never disagree with its type tag.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;

use crate::agent::AgentRole;
use crate::ids::{AgentId, CorrelationId, MessageId, StepId, TaskId};
use crate::kernel::{Alert, KernelMetrics, KernelState, KernelStatus};
use crate::task::{PlannedStep, Priority, Task, TaskRequest, TaskStatus, TaskType};

/// Where a message is going or coming from.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "type", content = "id", rename_all = "snake_case")]
pub enum Address {
    Kernel,
    Broadcast,
    Agent(AgentId),
    /// A caller outside the agent population (CLI, HTTP API, tests).
    External(String),
}

impl Address {
    pub fn external(name: impl Into<String>) -> Self {
        Address::External(name.into())
    }

    /// Topic string the bus routes on.
    pub fn topic(&self) -> String {
        match self {
            Address::Kernel => "kernel".to_owned(),
            Address::Broadcast => "broadcast".to_owned(),
            Address::Agent(id) => format!("agent.{id}"),
            Address::External(name) => format!("external.{name}"),
        }
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.topic())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SenseRequest {
    pub task_id: TaskId,
    pub task_type: TaskType,
    pub goal: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlanRequest {
    pub task_id: TaskId,
    pub task_type: TaskType,
    pub goal: String,
    pub sensor_context: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context: Option<Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepSummary {
    pub id: StepId,
    pub role: AgentRole,
    pub action: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EthicalCheckRequest {
    pub task_id: TaskId,
    pub task_type: TaskType,
    pub goal: String,
    pub steps: Vec<StepSummary>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecuteRequest {
    pub task_id: TaskId,
    pub step_id: StepId,
    pub action: String,
    pub input: Value,
    #[serde(default)]
    pub dependency_outputs: BTreeMap<StepId, Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CritiqueRequest {
    pub task_id: TaskId,
    pub step_id: StepId,
    pub action: String,
    pub error: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NarrateRequest {
    pub task_id: TaskId,
    pub goal: String,
    pub status: TaskStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImprovementReviewRequest {
    pub completed: usize,
    pub failed: usize,
    pub recent_errors: Vec<String>,
}

/// Outcome of an ethical evaluation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "decision", rename_all = "snake_case")]
pub enum EthicalVerdict {
    Allow,
    Block { reason: String },
    Defer { reason: String },
}

/// Payload of a `Response` message.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Response {
    Sensed { context: Value },
    Planned { steps: Vec<PlannedStep> },
    Verdict { verdict: EthicalVerdict },
    Executed { output: Value },
    Critiqued {
        continue_execution: bool,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        reason: Option<String>,
    },
    Stored { key: String },
    Narrated { text: String },
    Reviewed { suggestions: Vec<String> },
    TaskAccepted { task_id: TaskId },
    Status { status: KernelStatus },
    Metrics { metrics: KernelMetrics },
    TaskSnapshot {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        task: Option<Box<Task>>,
    },
    EnergySet { energy: f64, state: KernelState },
    Stopped,
    Error { message: String },
}

impl Response {
    pub fn error(message: impl Into<String>) -> Self {
        Response::Error {
            message: message.into(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum MessageKind {
    // Agent requests.
    Sense(SenseRequest),
    Plan(PlanRequest),
    EthicalCheck(EthicalCheckRequest),
    Execute(ExecuteRequest),
    Critique(CritiqueRequest),
    MemoryStore(Box<Task>),
    Narrate(NarrateRequest),
    ImprovementReview(ImprovementReviewRequest),

    // Kernel commands.
    SubmitTask(TaskRequest),
    GetStatus,
    GetMetrics,
    GetTask { task_id: TaskId },
    SetEnergy { value: f64 },
    Stop,

    Response(Response),

    // Notifications.
    Alert(Alert),
    StateChanged { from: KernelState, to: KernelState },
}

impl MessageKind {
    /// Requests expect a correlated `Response`.
    pub fn expects_reply(&self) -> bool {
        !matches!(
            self,
            MessageKind::Response(_) | MessageKind::Alert(_) | MessageKind::StateChanged { .. }
        )
    }

    pub fn name(&self) -> &'static str {
        match self {
            MessageKind::Sense(_) => "sense",
            MessageKind::Plan(_) => "plan",
            MessageKind::EthicalCheck(_) => "ethical_check",
            MessageKind::Execute(_) => "execute",
            MessageKind::Critique(_) => "critique",
            MessageKind::MemoryStore(_) => "memory_store",
            MessageKind::Narrate(_) => "narrate",
            MessageKind::ImprovementReview(_) => "improvement_review",
            MessageKind::SubmitTask(_) => "submit_task",
            MessageKind::GetStatus => "get_status",
            MessageKind::GetMetrics => "get_metrics",
            MessageKind::GetTask { .. } => "get_task",
            MessageKind::SetEnergy { .. } => "set_energy",
            MessageKind::Stop => "stop",
            MessageKind::Response(_) => "response",
            MessageKind::Alert(_) => "alert",
            MessageKind::StateChanged { .. } => "state_changed",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub id: MessageId,
    pub kind: MessageKind,
    pub from: Address,
    pub to: Address,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub priority: Priority,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reply_to: Option<MessageId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<CorrelationId>,
}

impl Message {
    pub fn new(from: Address, to: Address, kind: MessageKind) -> Self {
        Self {
            id: MessageId::generate(),
            kind,
            from,
            to,
            timestamp: Utc::now(),
            priority: Priority::Normal,
            reply_to: None,
            correlation_id: None,
        }
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_correlation(mut self, correlation_id: CorrelationId) -> Self {
        self.correlation_id = Some(correlation_id);
        self
    }

    /// Build the reply to this message, addressed back to its sender.
    pub fn reply(&self, from: Address, response: Response) -> Message {
        Message {
            id: MessageId::generate(),
            kind: MessageKind::Response(response),
            from,
            to: self.from.clone(),
            timestamp: Utc::now(),
            priority: self.priority,
            reply_to: Some(self.id.clone()),
            correlation_id: self.correlation_id.clone(),
        }
    }

    pub fn is_reply(&self) -> bool {
        self.reply_to.is_some()
    }
}
