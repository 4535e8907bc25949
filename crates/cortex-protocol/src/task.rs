//! Tasks, plans and steps.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

use crate::agent::AgentRole;
use crate::error::{ProtocolError, ProtocolResult};
use crate::ids::{PlanId, StepId, TaskId};

/// Scheduling priority shared by tasks and messages. Ordering is
/// `Low < Normal < High < Critical`.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    Low,
    #[default]
    Normal,
    High,
    Critical,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskType {
    #[default]
    Query,
    Research,
    Build,
    Analysis,
    Creative,
    Maintenance,
}

impl fmt::Display for TaskType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            TaskType::Query => "query",
            TaskType::Research => "research",
            TaskType::Build => "build",
            TaskType::Analysis => "analysis",
            TaskType::Creative => "creative",
            TaskType::Maintenance => "maintenance",
        };
        f.write_str(name)
    }
}

/// What a caller hands to `submit`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskRequest {
    #[serde(rename = "type", default)]
    pub task_type: TaskType,
    pub goal: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context: Option<Value>,
    #[serde(default)]
    pub priority: Priority,
    #[serde(default = "default_requester")]
    pub requester: String,
}

fn default_requester() -> String {
    "anonymous".to_owned()
}

impl TaskRequest {
    pub fn new(task_type: TaskType, goal: impl Into<String>) -> Self {
        Self {
            task_type,
            goal: goal.into(),
            context: None,
            priority: Priority::Normal,
            requester: default_requester(),
        }
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_context(mut self, context: Value) -> Self {
        self.context = Some(context);
        self
    }

    pub fn with_requester(mut self, requester: impl Into<String>) -> Self {
        self.requester = requester.into();
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl TaskStatus {
    /// `Pending -> Failed` covers tasks rejected before execution (ethics
    /// block); `Pending -> Cancelled` covers queued tasks dropped by a stop.
    pub fn can_transition_to(self, next: TaskStatus) -> bool {
        use TaskStatus::*;
        matches!(
            (self, next),
            (Pending, Running)
                | (Pending, Failed)
                | (Pending, Cancelled)
                | (Running, Completed)
                | (Running, Failed)
                | (Running, Cancelled)
        )
    }

    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            TaskStatus::Completed | TaskStatus::Failed | TaskStatus::Cancelled
        )
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            TaskStatus::Pending => "pending",
            TaskStatus::Running => "running",
            TaskStatus::Completed => "completed",
            TaskStatus::Failed => "failed",
            TaskStatus::Cancelled => "cancelled",
        };
        f.write_str(name)
    }
}

/// A unit of work owned by the kernel. `status` only moves through
/// [`Task::advance`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: TaskId,
    #[serde(rename = "type")]
    pub task_type: TaskType,
    pub goal: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context: Option<Value>,
    pub priority: Priority,
    pub requester: String,
    pub created_at: DateTime<Utc>,
    status: TaskStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
}

impl Task {
    pub fn from_request(request: TaskRequest) -> Self {
        Self {
            id: TaskId::generate(),
            task_type: request.task_type,
            goal: request.goal,
            context: request.context,
            priority: request.priority,
            requester: request.requester,
            created_at: Utc::now(),
            status: TaskStatus::Pending,
            result: None,
            error: None,
            completed_at: None,
        }
    }

    pub fn status(&self) -> TaskStatus {
        self.status
    }

    pub fn advance(&mut self, next: TaskStatus) -> ProtocolResult<()> {
        if !self.status.can_transition_to(next) {
            return Err(ProtocolError::InvalidTaskTransition {
                from: self.status,
                to: next,
            });
        }
        self.status = next;
        if next.is_terminal() {
            self.completed_at = Some(Utc::now());
        }
        Ok(())
    }

    pub fn fail(&mut self, error: impl Into<String>) -> ProtocolResult<()> {
        self.advance(TaskStatus::Failed)?;
        self.error = Some(error.into());
        Ok(())
    }
}

/// Declared kind of a planned step; the kernel maps each kind to a role.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepKind {
    Sense,
    Research,
    Analyze,
    Build,
    Review,
    Remember,
    Narrate,
    Evaluate,
    General,
}

/// One step as returned by a planner agent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlannedStep {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<StepKind>,
    pub action: String,
    #[serde(default)]
    pub input: Value,
    #[serde(default)]
    pub depends_on: Vec<String>,
}

impl PlannedStep {
    pub fn new(kind: StepKind, action: impl Into<String>) -> Self {
        Self {
            id: None,
            kind: Some(kind),
            action: action.into(),
            input: Value::Null,
            depends_on: Vec::new(),
        }
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    pub fn depends_on(mut self, ids: &[&str]) -> Self {
        self.depends_on = ids.iter().map(|id| (*id).to_owned()).collect();
        self
    }

    pub fn with_input(mut self, input: Value) -> Self {
        self.input = input;
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Skipped,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskStep {
    pub id: StepId,
    pub kind: StepKind,
    pub role: AgentRole,
    pub action: String,
    pub input: Value,
    /// `None` until the step ran; `Some(Value::Null)` when a failure was
    /// waved through by the critic.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub status: StepStatus,
    #[serde(default)]
    pub depends_on: Vec<StepId>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PlanStatus {
    Planning,
    Executing,
    Completed,
    Failed,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskPlan {
    pub id: PlanId,
    pub task_id: TaskId,
    pub steps: Vec<TaskStep>,
    pub current_step: usize,
    pub status: PlanStatus,
}

impl TaskPlan {
    pub fn new(task_id: TaskId, steps: Vec<TaskStep>) -> Self {
        Self {
            id: PlanId::generate(),
            task_id,
            steps,
            current_step: 0,
            status: PlanStatus::Planning,
        }
    }

    pub fn step(&self, id: &StepId) -> Option<&TaskStep> {
        self.steps.iter().find(|step| &step.id == id)
    }

    /// True when every dependency names a sibling step that completed.
    /// Unknown ids count as unmet.
    pub fn dependencies_met(&self, step: &TaskStep) -> bool {
        step.depends_on.iter().all(|dependency| {
            self.step(dependency)
                .is_some_and(|sibling| sibling.status == StepStatus::Completed)
        })
    }

    pub fn completed_outputs(&self) -> impl Iterator<Item = (&StepId, &Value)> {
        self.steps.iter().filter_map(|step| match (&step.status, &step.output) {
            (StepStatus::Completed, Some(output)) => Some((&step.id, output)),
            _ => None,
        })
    }
}
