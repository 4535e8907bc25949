//! Deterministic in-process agents, one per role.
//!
//! They carry no intelligence: the planner splits work by task type, ethics
//! blocks only configured terms, workers echo their input. Enough to drive the
//! kernel end to end in the daemon and in tests.

use std::sync::Arc;

use anyhow::{Result, bail};
use async_trait::async_trait;
use chrono::Utc;
use cortex_protocol::{
    AgentRole, EthicalVerdict, ExecuteRequest, MessageKind, PlannedStep, Response,
    StepKind, Task, TaskId, TaskType,
};
use indexmap::IndexMap;
use parking_lot::Mutex;
use serde_json::{Value, json};

use crate::Agent;

fn unsupported(role: AgentRole, request: &MessageKind) -> Result<Response> {
    bail!("{role} agent cannot handle {} requests", request.name())
}

/// Every role can be routed plan steps; reference agents echo them back.
fn echo_execution(role: AgentRole, request: &ExecuteRequest) -> Response {
    Response::Executed {
        output: json!({
            "role": role,
            "action": request.action,
            "input": request.input,
            "dependencies": request.dependency_outputs.keys().collect::<Vec<_>>(),
        }),
    }
}

#[derive(Debug, Default)]
pub struct SensorAgent;

#[async_trait]
impl Agent for SensorAgent {
    fn role(&self) -> AgentRole {
        AgentRole::Sensor
    }

    async fn handle(&self, request: &MessageKind) -> Result<Response> {
        match request {
            MessageKind::Sense(sense) => Ok(Response::Sensed {
                context: json!({
                    "status": "ok",
                    "task_type": sense.task_type,
                    "goal_words": sense.goal.split_whitespace().count(),
                    "observed_at": Utc::now(),
                }),
            }),
            MessageKind::Execute(execute) => Ok(echo_execution(self.role(), execute)),
            other => unsupported(self.role(), other),
        }
    }
}

/// Splits a goal into a fixed step template per task type.
#[derive(Debug, Default)]
pub struct PlannerAgent;

impl PlannerAgent {
    pub fn plan(task_type: TaskType, goal: &str) -> Vec<PlannedStep> {
        match task_type {
            TaskType::Query => vec![
                PlannedStep::new(StepKind::Research, format!("look up: {goal}")).with_id("lookup"),
            ],
            TaskType::Research | TaskType::Analysis => vec![
                PlannedStep::new(StepKind::Research, format!("gather sources for {goal}"))
                    .with_id("gather"),
                PlannedStep::new(StepKind::Analyze, format!("analyze findings for {goal}"))
                    .with_id("analyze")
                    .depends_on(&["gather"]),
            ],
            TaskType::Build => vec![
                PlannedStep::new(StepKind::Research, format!("collect requirements for {goal}"))
                    .with_id("requirements"),
                PlannedStep::new(StepKind::Build, format!("build {goal}"))
                    .with_id("build")
                    .depends_on(&["requirements"]),
                PlannedStep::new(StepKind::Review, format!("review {goal}"))
                    .with_id("review")
                    .depends_on(&["build"]),
            ],
            TaskType::Creative => vec![
                PlannedStep::new(StepKind::Narrate, format!("draft {goal}")).with_id("draft"),
            ],
            TaskType::Maintenance => vec![
                PlannedStep::new(StepKind::Analyze, format!("inspect {goal}")).with_id("inspect"),
                PlannedStep::new(StepKind::Build, format!("repair {goal}"))
                    .with_id("repair")
                    .depends_on(&["inspect"]),
            ],
        }
    }
}

#[async_trait]
impl Agent for PlannerAgent {
    fn role(&self) -> AgentRole {
        AgentRole::Planner
    }

    async fn handle(&self, request: &MessageKind) -> Result<Response> {
        match request {
            MessageKind::Plan(plan) => Ok(Response::Planned {
                steps: Self::plan(plan.task_type, &plan.goal),
            }),
            MessageKind::Execute(execute) => Ok(echo_execution(self.role(), execute)),
            other => unsupported(self.role(), other),
        }
    }
}

/// Allows everything except goals containing a blocked or deferred term.
#[derive(Debug, Default)]
pub struct EthicsAgent {
    blocked_terms: Vec<String>,
    deferred_terms: Vec<String>,
}

impl EthicsAgent {
    pub fn permissive() -> Self {
        Self::default()
    }

    pub fn with_blocked_terms(mut self, terms: &[&str]) -> Self {
        self.blocked_terms = terms.iter().map(|term| term.to_lowercase()).collect();
        self
    }

    pub fn with_deferred_terms(mut self, terms: &[&str]) -> Self {
        self.deferred_terms = terms.iter().map(|term| term.to_lowercase()).collect();
        self
    }

    fn evaluate(&self, goal: &str) -> EthicalVerdict {
        let goal = goal.to_lowercase();
        if let Some(term) = self.blocked_terms.iter().find(|t| goal.contains(t.as_str())) {
            return EthicalVerdict::Block {
                reason: format!("goal mentions blocked term '{term}'"),
            };
        }
        if let Some(term) = self.deferred_terms.iter().find(|t| goal.contains(t.as_str())) {
            return EthicalVerdict::Defer {
                reason: format!("goal mentions '{term}', needs human review"),
            };
        }
        EthicalVerdict::Allow
    }
}

#[async_trait]
impl Agent for EthicsAgent {
    fn role(&self) -> AgentRole {
        AgentRole::Ethics
    }

    async fn handle(&self, request: &MessageKind) -> Result<Response> {
        match request {
            MessageKind::EthicalCheck(check) => Ok(Response::Verdict {
                verdict: self.evaluate(&check.goal),
            }),
            MessageKind::Execute(execute) => Ok(echo_execution(self.role(), execute)),
            other => unsupported(self.role(), other),
        }
    }
}

/// Executes steps by echoing them. Used for researcher and builder roles.
#[derive(Debug)]
pub struct WorkerAgent {
    role: AgentRole,
}

impl WorkerAgent {
    pub fn new(role: AgentRole) -> Self {
        Self { role }
    }
}

#[async_trait]
impl Agent for WorkerAgent {
    fn role(&self) -> AgentRole {
        self.role
    }

    async fn handle(&self, request: &MessageKind) -> Result<Response> {
        match request {
            MessageKind::Execute(execute) => Ok(echo_execution(self.role, execute)),
            other => unsupported(self.role, other),
        }
    }
}

/// Always lets execution continue after a failed step.
#[derive(Debug, Default)]
pub struct CriticAgent;

#[async_trait]
impl Agent for CriticAgent {
    fn role(&self) -> AgentRole {
        AgentRole::Critic
    }

    async fn handle(&self, request: &MessageKind) -> Result<Response> {
        match request {
            MessageKind::Critique(critique) => Ok(Response::Critiqued {
                continue_execution: true,
                reason: Some(format!(
                    "step {} failed ({}); remaining steps can proceed",
                    critique.step_id, critique.error
                )),
            }),
            MessageKind::ImprovementReview(review) => {
                let mut suggestions = Vec::new();
                if review.failed > 0 {
                    suggestions.push(format!(
                        "investigate {} failed task(s) out of {}",
                        review.failed,
                        review.failed + review.completed
                    ));
                }
                suggestions.extend(
                    review
                        .recent_errors
                        .iter()
                        .take(3)
                        .map(|error| format!("address recurring error: {error}")),
                );
                Ok(Response::Reviewed { suggestions })
            }
            MessageKind::Execute(execute) => Ok(echo_execution(self.role(), execute)),
            other => unsupported(self.role(), other),
        }
    }
}

/// Keeps finished tasks in memory, keyed by task id.
#[derive(Debug, Default)]
pub struct MemoryAgent {
    records: Mutex<IndexMap<TaskId, Task>>,
}

impl MemoryAgent {
    pub fn records(&self) -> Vec<Task> {
        self.records.lock().values().cloned().collect()
    }
}

#[async_trait]
impl Agent for MemoryAgent {
    fn role(&self) -> AgentRole {
        AgentRole::Memory
    }

    async fn handle(&self, request: &MessageKind) -> Result<Response> {
        match request {
            MessageKind::MemoryStore(task) => {
                let key = task.id.to_string();
                self.records.lock().insert(task.id.clone(), (**task).clone());
                Ok(Response::Stored { key })
            }
            MessageKind::Execute(execute) => Ok(echo_execution(self.role(), execute)),
            other => unsupported(self.role(), other),
        }
    }
}

#[derive(Debug, Default)]
pub struct NarratorAgent;

#[async_trait]
impl Agent for NarratorAgent {
    fn role(&self) -> AgentRole {
        AgentRole::Narrator
    }

    async fn handle(&self, request: &MessageKind) -> Result<Response> {
        match request {
            MessageKind::Narrate(narrate) => {
                let steps = narrate
                    .result
                    .as_ref()
                    .and_then(|result| result.get("steps"))
                    .and_then(Value::as_array)
                    .map_or(0, Vec::len);
                Ok(Response::Narrated {
                    text: format!(
                        "Task {} \"{}\" finished as {} after {steps} step(s).",
                        narrate.task_id, narrate.goal, narrate.status
                    ),
                })
            }
            MessageKind::Execute(execute) => Ok(echo_execution(self.role(), execute)),
            other => unsupported(self.role(), other),
        }
    }
}

/// One reference agent per role, in `AgentRole::ALL` order.
pub fn population() -> Vec<Arc<dyn Agent>> {
    AgentRole::ALL
        .into_iter()
        .map(|role| -> Arc<dyn Agent> {
            match role {
                AgentRole::Sensor => Arc::new(SensorAgent),
                AgentRole::Planner => Arc::new(PlannerAgent),
                AgentRole::Ethics => Arc::new(EthicsAgent::permissive()),
                AgentRole::Researcher | AgentRole::Builder => Arc::new(WorkerAgent::new(role)),
                AgentRole::Critic => Arc::new(CriticAgent),
                AgentRole::Memory => Arc::new(MemoryAgent::default()),
                AgentRole::Narrator => Arc::new(NarratorAgent),
            }
        })
        .collect()
}
