//! Drives one task through `sensing -> thinking -> deciding -> acting ->
//! reflecting` and settles its outcome.

use std::collections::BTreeMap;

use cortex_bus::MessageBus;
use cortex_protocol::{
    Address, AgentRole, Alert, AlertKind, AlertLevel, BusError, CritiqueRequest, EthicalCheckRequest,
    EthicalVerdict, ExecuteRequest, KernelState, MessageKind, NarrateRequest, PlanRequest,
    PlanStatus, Response, SenseRequest, StepStatus, StepSummary, Task, TaskId, TaskPlan,
    TaskStatus,
};
use serde_json::{Value, json};
use tracing::{debug, info, instrument, warn};

use crate::kernel::Kernel;
use crate::planner::{build_plan, fallback_plan};
use crate::scheduler::QueuedTask;

/// How a task left the pipeline.
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum TaskOutcome {
    Completed(Value),
    Deferred(String),
    Blocked(String),
    Failed(String),
    Cancelled,
}

/// Why an agent call produced no usable answer.
#[derive(Debug)]
pub(crate) enum AskError {
    NoAgent(AgentRole),
    Bus(BusError),
    Agent(String),
}

impl std::fmt::Display for AskError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AskError::NoAgent(role) => write!(f, "no {role} agent registered"),
            AskError::Bus(error) => write!(f, "{error}"),
            AskError::Agent(message) => write!(f, "{message}"),
        }
    }
}

impl Kernel {
    /// Send `kind` to an agent of `role` and wait up to `request_timeout`.
    /// An `Error` response is folded into `AskError::Agent`.
    pub(crate) async fn ask(&self, role: AgentRole, kind: MessageKind) -> Result<Response, AskError> {
        let agent = self
            .inner
            .agents
            .find_by_role(role)
            .ok_or(AskError::NoAgent(role))?;
        let bus: &MessageBus = &self.inner.bus;
        match bus
            .request(
                Address::Kernel,
                Address::Agent(agent),
                kind,
                self.inner.config.request_timeout(),
            )
            .await
        {
            Ok(Response::Error { message }) => Err(AskError::Agent(message)),
            Ok(response) => Ok(response),
            Err(error) => Err(AskError::Bus(error)),
        }
    }

    #[instrument(skip_all, fields(task_id = %entry.task_id, priority = ?entry.priority))]
    pub(crate) async fn run_task(&self, entry: QueuedTask) {
        let task = self.inner.core.lock().tasks.get(&entry.task_id).cloned();
        let Some(task) = task else {
            warn!("claimed task vanished before execution");
            self.inner.core.lock().active = None;
            self.transition(KernelState::Idle);
            return;
        };
        info!(task_type = %task.task_type, goal = %task.goal, "task started");

        let budget = self.inner.config.max_task_timeout();
        let outcome = match tokio::time::timeout(budget, self.execute(&task)).await {
            Ok(outcome) => outcome,
            Err(_) => TaskOutcome::Failed(format!(
                "task exceeded its {}ms budget",
                budget.as_millis()
            )),
        };
        self.finish_task(&task.id, outcome);
    }

    async fn execute(&self, task: &Task) -> TaskOutcome {
        let sensor_context = self.sense(task).await;
        if let Some(outcome) = self.advance_phase(KernelState::Thinking) {
            return outcome;
        }

        let plan = self.plan(task, sensor_context).await;
        if let Some(outcome) = self.advance_phase(KernelState::Deciding) {
            return outcome;
        }

        match self.evaluate(task, &plan).await {
            EthicalVerdict::Allow => {}
            EthicalVerdict::Block { reason } => return TaskOutcome::Blocked(reason),
            EthicalVerdict::Defer { reason } => return TaskOutcome::Deferred(reason),
        }
        if let Some(outcome) = self.advance_phase(KernelState::Acting) {
            return outcome;
        }
        self.update_task(&task.id, |task| {
            if let Err(error) = task.advance(TaskStatus::Running) {
                warn!(%error, "task could not start running");
            }
        });

        let plan = match self.act(task, plan).await {
            Ok(plan) => plan,
            Err(outcome) => return outcome,
        };
        if let Some(outcome) = self.advance_phase(KernelState::Reflecting) {
            return outcome;
        }

        let mut result = json!({
            "plan_id": plan.id,
            "steps": plan.steps,
        });
        if let Some(narrative) = self.reflect(task, &result).await {
            result["narrative"] = Value::String(narrative);
        }
        TaskOutcome::Completed(result)
    }

    /// `None` when the kernel moved on to `next`.
    fn advance_phase(&self, next: KernelState) -> Option<TaskOutcome> {
        if self.is_stopping() {
            return Some(TaskOutcome::Cancelled);
        }
        if self.transition(next) {
            return None;
        }
        Some(TaskOutcome::Failed(format!(
            "kernel could not enter {next} from {}",
            self.state()
        )))
    }

    async fn sense(&self, task: &Task) -> Value {
        let request = MessageKind::Sense(SenseRequest {
            task_id: task.id.clone(),
            task_type: task.task_type,
            goal: task.goal.clone(),
        });
        match self.ask(AgentRole::Sensor, request).await {
            Ok(Response::Sensed { context }) => context,
            Ok(other) => unavailable(format!("unexpected sensor reply: {other:?}")),
            Err(error) => {
                debug!(%error, "sensor unavailable; continuing with placeholder");
                unavailable(error.to_string())
            }
        }
    }

    async fn plan(&self, task: &Task, sensor_context: Value) -> TaskPlan {
        let request = MessageKind::Plan(PlanRequest {
            task_id: task.id.clone(),
            task_type: task.task_type,
            goal: task.goal.clone(),
            sensor_context,
            context: task.context.clone(),
        });
        let mut plan = match self.ask(AgentRole::Planner, request).await {
            Ok(Response::Planned { steps }) if !steps.is_empty() => build_plan(task, steps),
            Ok(Response::Planned { .. }) => {
                debug!("planner returned no steps; using fallback plan");
                fallback_plan(task)
            }
            Ok(other) => {
                warn!(reply = ?other, "unexpected planner reply; using fallback plan");
                fallback_plan(task)
            }
            Err(error) => {
                warn!(%error, "planner unavailable; using fallback plan");
                fallback_plan(task)
            }
        };
        plan.status = PlanStatus::Executing;
        debug!(plan_id = %plan.id, steps = plan.steps.len(), "plan ready");
        plan
    }

    async fn evaluate(&self, task: &Task, plan: &TaskPlan) -> EthicalVerdict {
        let request = MessageKind::EthicalCheck(EthicalCheckRequest {
            task_id: task.id.clone(),
            task_type: task.task_type,
            goal: task.goal.clone(),
            steps: plan
                .steps
                .iter()
                .map(|step| StepSummary {
                    id: step.id.clone(),
                    role: step.role,
                    action: step.action.clone(),
                })
                .collect(),
        });
        match self.ask(AgentRole::Ethics, request).await {
            Ok(Response::Verdict { verdict }) => verdict,
            Ok(other) => EthicalVerdict::Defer {
                reason: format!("ethics evaluator gave no verdict: {other:?}"),
            },
            Err(error) => EthicalVerdict::Defer {
                reason: format!("ethics evaluator unavailable: {error}"),
            },
        }
    }

    /// Run steps in plan order. `Err` carries the outcome of an aborted or
    /// cancelled run.
    async fn act(&self, task: &Task, mut plan: TaskPlan) -> Result<TaskPlan, TaskOutcome> {
        for index in 0..plan.steps.len() {
            if self.is_stopping() {
                return Err(TaskOutcome::Cancelled);
            }
            plan.current_step = index;

            if !plan.dependencies_met(&plan.steps[index]) {
                let step = &mut plan.steps[index];
                step.status = StepStatus::Skipped;
                debug!(step = %step.id, "dependencies unmet; step skipped");
                self.inner.core.lock().metrics.steps_skipped += 1;
                continue;
            }

            let dependency_outputs: BTreeMap<_, _> = {
                let step = &plan.steps[index];
                plan.completed_outputs()
                    .filter(|(id, _)| step.depends_on.contains(*id))
                    .map(|(id, output)| (id.clone(), output.clone()))
                    .collect()
            };
            let step = &mut plan.steps[index];
            step.status = StepStatus::Running;
            let request = MessageKind::Execute(ExecuteRequest {
                task_id: task.id.clone(),
                step_id: step.id.clone(),
                action: step.action.clone(),
                input: step.input.clone(),
                dependency_outputs,
            });
            let result = self.ask(step.role, request).await;
            self.inner.core.lock().metrics.steps_executed += 1;

            let error = match result {
                Ok(Response::Executed { output }) => {
                    step.output = Some(output);
                    step.status = StepStatus::Completed;
                    continue;
                }
                Ok(other) => format!("unexpected reply: {other:?}"),
                Err(error) => error.to_string(),
            };

            self.inner.core.lock().metrics.steps_failed += 1;
            step.status = StepStatus::Failed;
            step.error = Some(error.clone());
            warn!(step = %step.id, role = %step.role, %error, "step failed");

            let critique = MessageKind::Critique(CritiqueRequest {
                task_id: task.id.clone(),
                step_id: step.id.clone(),
                action: step.action.clone(),
                error: error.clone(),
            });
            let proceed = match self.ask(AgentRole::Critic, critique).await {
                Ok(Response::Critiqued {
                    continue_execution,
                    reason,
                }) => {
                    if let Some(reason) = reason {
                        debug!(step = %step.id, %reason, "critic verdict");
                    }
                    continue_execution
                }
                Ok(_) | Err(_) => true,
            };
            if !proceed {
                plan.status = PlanStatus::Failed;
                return Err(TaskOutcome::Failed(format!(
                    "step {} failed: {error}",
                    plan.steps[index].id
                )));
            }
            plan.steps[index].output = Some(Value::Null);
        }
        plan.status = PlanStatus::Completed;
        Ok(plan)
    }

    /// Memory store and narration. Both are optional.
    async fn reflect(&self, task: &Task, result: &Value) -> Option<String> {
        let mut snapshot = task.clone();
        snapshot.result = Some(result.clone());
        match self
            .ask(AgentRole::Memory, MessageKind::MemoryStore(Box::new(snapshot)))
            .await
        {
            Ok(Response::Stored { key }) => debug!(%key, "task stored in memory"),
            Ok(_) => {}
            Err(error) => debug!(%error, "memory store skipped"),
        }

        let request = MessageKind::Narrate(NarrateRequest {
            task_id: task.id.clone(),
            goal: task.goal.clone(),
            status: TaskStatus::Completed,
            result: Some(result.clone()),
        });
        match self.ask(AgentRole::Narrator, request).await {
            Ok(Response::Narrated { text }) => Some(text),
            Ok(_) => None,
            Err(error) => {
                debug!(%error, "narration skipped");
                None
            }
        }
    }

    pub(crate) fn update_task(&self, id: &TaskId, update: impl FnOnce(&mut Task)) {
        if let Some(task) = self.inner.core.lock().tasks.get_mut(id) {
            update(task);
        }
    }

    /// Record the outcome, move the kernel back to `idle` and keep draining.
    ///
    /// The live entry in `tasks` is dropped last, after the outcome is in the
    /// ledger or the deferred set, so lookups and waiters never miss the task.
    #[instrument(skip(self, outcome), fields(task_id = %id))]
    pub(crate) fn finish_task(&self, id: &TaskId, outcome: TaskOutcome) {
        let (task, stopped) = {
            let mut core = self.inner.core.lock();
            if core.active.as_ref() == Some(id) {
                core.active = None;
            }
            (core.tasks.get(id).cloned(), core.stopped)
        };
        if stopped {
            // stop() already settled the task.
            debug!("kernel stopped; outcome discarded");
            self.notify_task_change();
            return;
        }
        let Some(mut task) = task else {
            warn!("finished task is no longer tracked");
            self.force_state(KernelState::Idle);
            return;
        };

        match outcome {
            TaskOutcome::Completed(result) => {
                task.result = Some(result);
                if let Err(error) = task.advance(TaskStatus::Completed) {
                    warn!(%error, "task could not complete");
                }
                info!("task completed");
                self.record_finished(task, true);
                self.transition(KernelState::Idle);
            }
            TaskOutcome::Deferred(reason) => {
                info!(%reason, "task deferred for human review");
                task.error = Some(format!("deferred: {reason}"));
                {
                    let mut core = self.inner.core.lock();
                    core.metrics.tasks_deferred += 1;
                    if let Some(live) = core.tasks.get_mut(&task.id) {
                        live.clone_from(&task);
                    }
                    core.deferred.insert(task.id.clone(), task);
                }
                self.transition(KernelState::Idle);
            }
            TaskOutcome::Blocked(reason) => {
                warn!(%reason, "task blocked by ethics evaluation");
                self.fail_task(task, format!("blocked: {reason}"));
                self.transition(KernelState::Idle);
            }
            TaskOutcome::Failed(reason) => {
                warn!(%reason, "task failed");
                self.fail_task(task, reason);
                if !self.transition(KernelState::Error) {
                    debug!(state = %self.state(), "error state not reachable; recovering directly");
                }
                self.recover();
            }
            TaskOutcome::Cancelled => {
                if task.advance(TaskStatus::Cancelled).is_ok() {
                    self.inner.core.lock().metrics.tasks_cancelled += 1;
                }
                self.append_ledger(task);
                self.force_state(KernelState::Idle);
            }
        }

        self.spend_energy();
        self.inner.core.lock().tasks.remove(id);
        self.notify_task_change();
        self.resume();
    }

    fn fail_task(&self, mut task: Task, reason: String) {
        let task_id = task.id.clone();
        if let Err(error) = task.fail(reason.clone()) {
            warn!(%error, "task could not be marked failed");
        }
        self.record_finished(task, false);
        self.alert(Alert::new(
            AlertLevel::Warning,
            AlertKind::TaskFailed {
                task_id: task_id.to_string(),
            },
            reason,
        ));
    }

    fn record_finished(&self, task: Task, completed: bool) {
        {
            let mut core = self.inner.core.lock();
            if completed {
                core.metrics.tasks_completed += 1;
            } else {
                core.metrics.tasks_failed += 1;
            }
            core.finished_since_review += 1;
        }
        self.append_ledger(task);
    }

    /// Mirror the settled task into its live entry, then append it.
    fn append_ledger(&self, task: Task) {
        let mut core = self.inner.core.lock();
        if let Some(live) = core.tasks.get_mut(&task.id) {
            live.clone_from(&task);
        }
        if let Err(error) = self.inner.ledger.append(task) {
            warn!(%error, "task could not be appended to the ledger");
        }
    }

    fn spend_energy(&self) {
        let cost = self.inner.config.task_energy_cost;
        if cost > 0.0 {
            let energy = self.energy();
            self.set_energy(energy - cost);
        }
    }
}

fn unavailable(reason: String) -> Value {
    json!({ "status": "unavailable", "reason": reason })
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use anyhow::Result;
    use std::sync::atomic::{AtomicBool, Ordering};

    use cortex_protocol::{
        AgentState, KernelConfig, PlannedStep, Priority, StepKind, TaskRequest, TaskType,
    };
    use tokio::task::JoinHandle;
    use serde_json::json;

    use super::*;
    use crate::test_support::{FnAgent, TestKernel, kernel_with};

    const WAIT: Duration = Duration::from_secs(5);

    fn quick_config() -> KernelConfig {
        KernelConfig {
            request_timeout_ms: 100,
            ..KernelConfig::default()
        }
    }

    #[tokio::test]
    async fn critical_query_completes_and_lands_in_history() -> Result<()> {
        let TestKernel { kernel, .. } = kernel_with(Vec::new(), KernelConfig::default())?;
        kernel.start().await?;
        let before = kernel.metrics().tasks_completed;

        let id = kernel.submit(TaskRequest::new(TaskType::Query, "g").with_priority(Priority::Critical))?;
        let task = kernel.wait_for_task(&id, WAIT).await?;

        assert_eq!(task.status(), TaskStatus::Completed);
        assert!(task.completed_at.is_some());
        assert!(kernel.history(10).iter().any(|finished| finished.id == id));
        assert_eq!(kernel.metrics().tasks_completed, before + 1);
        let found = kernel.task(&id).expect("task queryable by id");
        assert_eq!(found.id, id);
        assert_eq!(found.task_type, TaskType::Query);
        assert_eq!(found.goal, "g");
        assert_eq!(found.status(), TaskStatus::Completed);
        assert!(task.result.as_ref().and_then(|result| result.get("narrative")).is_some());
        assert_eq!(kernel.state(), KernelState::Idle);
        kernel.stop().await;
        Ok(())
    }

    #[tokio::test]
    async fn tasks_run_in_priority_order() -> Result<()> {
        let TestKernel { kernel, .. } = kernel_with(Vec::new(), KernelConfig::default())?;
        let mut ids = Vec::new();
        for (goal, priority) in [
            ("low", Priority::Low),
            ("critical", Priority::Critical),
            ("normal", Priority::Normal),
            ("high", Priority::High),
        ] {
            ids.push(kernel.submit(TaskRequest::new(TaskType::Query, goal).with_priority(priority))?);
        }
        kernel.start().await?;
        for id in &ids {
            kernel.wait_for_task(id, WAIT).await?;
        }

        let order: Vec<_> = kernel.history(10).into_iter().map(|task| task.goal).collect();
        assert_eq!(order, vec!["critical", "high", "normal", "low"]);
        kernel.stop().await;
        Ok(())
    }

    #[tokio::test]
    async fn silent_ethics_defers_the_task() -> Result<()> {
        let silent = FnAgent::new(AgentRole::Ethics, |_| Ok(Response::Stopped))
            .with_delay(Duration::from_millis(500));
        let TestKernel { kernel, .. } = kernel_with(vec![Arc::new(silent)], quick_config())?;
        kernel.start().await?;

        let id = kernel.submit(TaskRequest::new(TaskType::Research, "map the field"))?;
        let task = kernel.wait_for_task(&id, WAIT).await?;

        assert_eq!(task.status(), TaskStatus::Pending);
        let error = task.error.clone().unwrap_or_default();
        assert!(error.starts_with("deferred"), "{error}");
        assert_eq!(kernel.deferred_tasks().len(), 1);
        assert_eq!(kernel.metrics().tasks_deferred, 1);
        assert_eq!(kernel.state(), KernelState::Idle);
        kernel.stop().await;
        Ok(())
    }

    #[tokio::test]
    async fn failing_ethics_defers_every_task() -> Result<()> {
        let broken = FnAgent::new(AgentRole::Ethics, |_| anyhow::bail!("scoring model offline"));
        let TestKernel { kernel, .. } = kernel_with(vec![Arc::new(broken)], quick_config())?;
        kernel.start().await?;

        let mut ids = Vec::new();
        for goal in ["one", "two", "three"] {
            ids.push(kernel.submit(TaskRequest::new(TaskType::Query, goal))?);
        }
        for id in &ids {
            let task = kernel.wait_for_task(id, WAIT).await?;
            assert_eq!(task.status(), TaskStatus::Pending);
            assert!(task.error.as_deref().is_some_and(|error| error.contains("deferred")));
        }
        assert_eq!(kernel.metrics().tasks_completed, 0);
        kernel.stop().await;
        Ok(())
    }

    #[tokio::test]
    async fn blocked_task_fails_with_reason() -> Result<()> {
        let strict = FnAgent::new(AgentRole::Ethics, |_| {
            Ok(Response::Verdict {
                verdict: EthicalVerdict::Block {
                    reason: "touches personal data".to_owned(),
                },
            })
        });
        let TestKernel { kernel, .. } = kernel_with(vec![Arc::new(strict)], quick_config())?;
        kernel.start().await?;

        let id = kernel.submit(TaskRequest::new(TaskType::Build, "scrape profiles"))?;
        let task = kernel.wait_for_task(&id, WAIT).await?;
        assert_eq!(task.status(), TaskStatus::Failed);
        assert_eq!(task.error.as_deref(), Some("blocked: touches personal data"));
        assert_eq!(kernel.metrics().tasks_failed, 1);
        kernel.stop().await;
        Ok(())
    }

    #[tokio::test]
    async fn steps_with_unmet_dependencies_are_skipped() -> Result<()> {
        let planner = FnAgent::new(AgentRole::Planner, |_| {
            Ok(Response::Planned {
                steps: vec![
                    PlannedStep::new(StepKind::Build, "compile").with_id("a"),
                    PlannedStep::new(StepKind::Build, "package").with_id("b").depends_on(&["missing"]),
                    PlannedStep::new(StepKind::Build, "ship").with_id("c").depends_on(&["a"]),
                ],
            })
        });
        let builder = FnAgent::new(AgentRole::Builder, |request| match request {
            MessageKind::Execute(execute) => Ok(Response::Executed {
                output: json!({ "did": execute.action, "deps": execute.dependency_outputs.len() }),
            }),
            _ => Ok(Response::error("unsupported")),
        });
        let builder = Arc::new(builder);
        let TestKernel { kernel, .. } =
            kernel_with(vec![Arc::new(planner), builder.clone()], quick_config())?;
        kernel.start().await?;

        let id = kernel.submit(TaskRequest::new(TaskType::Build, "release"))?;
        let task = kernel.wait_for_task(&id, WAIT).await?;
        assert_eq!(task.status(), TaskStatus::Completed);

        let executed: Vec<_> = builder
            .requests()
            .into_iter()
            .filter_map(|request| match request {
                MessageKind::Execute(execute) => Some(execute.step_id.to_string()),
                _ => None,
            })
            .collect();
        assert_eq!(executed, vec!["a", "c"]);

        let steps = task
            .result
            .as_ref()
            .and_then(|result| result.get("steps"))
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default();
        assert_eq!(steps[1]["status"], "skipped");
        assert!(steps[1].get("output").is_none());
        assert_eq!(steps[2]["output"]["deps"], 1);
        assert_eq!(kernel.metrics().steps_skipped, 1);
        kernel.stop().await;
        Ok(())
    }

    #[tokio::test]
    async fn critic_can_wave_a_failed_step_through() -> Result<()> {
        let builder = FnAgent::new(AgentRole::Builder, |_| anyhow::bail!("compiler crashed"));
        let TestKernel { kernel, .. } = kernel_with(vec![Arc::new(builder)], quick_config())?;
        kernel.start().await?;

        let id = kernel.submit(TaskRequest::new(TaskType::Maintenance, "patch the server"))?;
        let task = kernel.wait_for_task(&id, WAIT).await?;
        assert_eq!(task.status(), TaskStatus::Completed);
        let steps = task
            .result
            .as_ref()
            .and_then(|result| result.get("steps"))
            .cloned()
            .unwrap_or_default();
        assert_eq!(steps[0]["status"], "completed");
        assert_eq!(steps[1]["status"], "failed");
        assert!(steps[1]["output"].is_null());
        assert_eq!(kernel.metrics().steps_failed, 1);
        kernel.stop().await;
        Ok(())
    }

    #[tokio::test]
    async fn critic_abort_fails_task_and_recovers() -> Result<()> {
        let builder = FnAgent::new(AgentRole::Builder, |_| anyhow::bail!("disk full"));
        let critic = FnAgent::new(AgentRole::Critic, |_| {
            Ok(Response::Critiqued {
                continue_execution: false,
                reason: Some("unsafe to continue".to_owned()),
            })
        });
        let TestKernel { kernel, .. } =
            kernel_with(vec![Arc::new(builder), Arc::new(critic)], quick_config())?;
        let states = Arc::new(parking_lot::Mutex::new(Vec::new()));
        let seen = states.clone();
        kernel.on_state_change(move |next, _| seen.lock().push(next));
        kernel.start().await?;

        let id = kernel.submit(TaskRequest::new(TaskType::Build, "build the image"))?;
        let task = kernel.wait_for_task(&id, WAIT).await?;
        assert_eq!(task.status(), TaskStatus::Failed);
        assert!(task.error.as_deref().is_some_and(|error| error.contains("disk full")));

        assert!(states.lock().contains(&KernelState::Error));
        assert_eq!(kernel.state(), KernelState::Idle);
        let metrics = kernel.metrics();
        assert_eq!(metrics.recoveries, 1);
        assert_eq!(metrics.tasks_failed, 1);
        // The failing builder went to error and was restarted.
        assert!(metrics.agent_restarts >= 1);
        assert_eq!(kernel.agents().counts().errored, 0);
        kernel.stop().await;
        Ok(())
    }

    #[tokio::test]
    async fn slow_task_hits_the_task_budget() -> Result<()> {
        let slow = FnAgent::new(AgentRole::Researcher, |_| {
            Ok(Response::Executed { output: Value::Null })
        })
        .with_delay(Duration::from_millis(400));
        let config = KernelConfig {
            max_task_timeout_ms: 150,
            request_timeout_ms: 1_000,
            ..KernelConfig::default()
        };
        let TestKernel { kernel, .. } = kernel_with(vec![Arc::new(slow)], config)?;
        kernel.start().await?;

        let id = kernel.submit(TaskRequest::new(TaskType::Query, "look up the weather"))?;
        let task = kernel.wait_for_task(&id, WAIT).await?;
        assert_eq!(task.status(), TaskStatus::Failed);
        assert!(task.error.as_deref().is_some_and(|error| error.contains("budget")));
        assert_eq!(kernel.state(), KernelState::Idle);
        kernel.stop().await;
        Ok(())
    }

    #[tokio::test]
    async fn deferred_task_can_be_requeued() -> Result<()> {
        let gate = Arc::new(std::sync::atomic::AtomicBool::new(false));
        let open = gate.clone();
        let ethics = FnAgent::new(AgentRole::Ethics, move |_| {
            let verdict = if open.load(std::sync::atomic::Ordering::SeqCst) {
                EthicalVerdict::Allow
            } else {
                EthicalVerdict::Defer {
                    reason: "needs sign-off".to_owned(),
                }
            };
            Ok(Response::Verdict { verdict })
        });
        let TestKernel { kernel, .. } = kernel_with(vec![Arc::new(ethics)], quick_config())?;
        kernel.start().await?;

        let id = kernel.submit(TaskRequest::new(TaskType::Creative, "write a poem"))?;
        let task = kernel.wait_for_task(&id, WAIT).await?;
        assert_eq!(task.error.as_deref(), Some("deferred: needs sign-off"));

        gate.store(true, std::sync::atomic::Ordering::SeqCst);
        kernel.requeue_deferred(&id)?;
        assert!(kernel.requeue_deferred(&id).is_err());
        let task = kernel.wait_for_task(&id, WAIT).await?;
        assert_eq!(task.status(), TaskStatus::Completed);
        assert!(kernel.deferred_tasks().is_empty());
        kernel.stop().await;
        Ok(())
    }

    #[tokio::test]
    async fn task_energy_cost_drains_into_dormancy() -> Result<()> {
        let config = KernelConfig {
            energy: 0.3,
            task_energy_cost: 0.15,
            ..KernelConfig::default()
        };
        let TestKernel { kernel, .. } = kernel_with(Vec::new(), config)?;
        kernel.start().await?;

        let first = kernel.submit(TaskRequest::new(TaskType::Query, "first"))?;
        kernel.wait_for_task(&first, WAIT).await?;
        assert_eq!(kernel.state(), KernelState::Idle);

        let second = kernel.submit(TaskRequest::new(TaskType::Query, "second"))?;
        kernel.wait_for_task(&second, WAIT).await?;
        assert!(kernel.energy() <= 0.1);
        assert_eq!(kernel.state(), KernelState::Dormant);
        kernel.stop().await;
        Ok(())
    }

    fn result_steps(task: &Task) -> Vec<Value> {
        task.result
            .as_ref()
            .and_then(|result| result.get("steps"))
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default()
    }

    #[tokio::test]
    async fn unreachable_sensor_yields_placeholder_context() -> Result<()> {
        let failing = FnAgent::new(AgentRole::Sensor, |_| anyhow::bail!("probe offline"));
        let slow = FnAgent::new(AgentRole::Sensor, |_| {
            Ok(Response::Sensed { context: json!({ "cpu": 0.2 }) })
        })
        .with_delay(Duration::from_millis(400));

        for sensor in [failing, slow] {
            let planner = Arc::new(FnAgent::new(AgentRole::Planner, |_| {
                Ok(Response::Planned {
                    steps: vec![PlannedStep::new(StepKind::Research, "look around").with_id("only")],
                })
            }));
            let TestKernel { kernel, .. } =
                kernel_with(vec![Arc::new(sensor), planner.clone()], quick_config())?;
            kernel.start().await?;

            let id = kernel.submit(TaskRequest::new(TaskType::Query, "uptime"))?;
            let task = kernel.wait_for_task(&id, WAIT).await?;
            assert_eq!(task.status(), TaskStatus::Completed);

            let contexts: Vec<_> = planner
                .requests()
                .into_iter()
                .filter_map(|request| match request {
                    MessageKind::Plan(plan) => Some(plan.sensor_context),
                    _ => None,
                })
                .collect();
            assert_eq!(contexts.len(), 1);
            assert_eq!(contexts[0]["status"], "unavailable");
            kernel.stop().await;
        }
        Ok(())
    }

    #[tokio::test]
    async fn planner_trouble_falls_back_to_a_single_default_step() -> Result<()> {
        let failing = FnAgent::new(AgentRole::Planner, |_| anyhow::bail!("model overloaded"));
        let slow = FnAgent::new(AgentRole::Planner, |_| {
            Ok(Response::Planned {
                steps: vec![PlannedStep::new(StepKind::Build, "never seen")],
            })
        })
        .with_delay(Duration::from_millis(400));
        let empty = FnAgent::new(AgentRole::Planner, |_| Ok(Response::Planned { steps: Vec::new() }));

        for planner in [failing, slow, empty] {
            let TestKernel { kernel, .. } = kernel_with(vec![Arc::new(planner)], quick_config())?;
            kernel.start().await?;

            let id = kernel.submit(TaskRequest::new(TaskType::Query, "open incidents"))?;
            let task = kernel.wait_for_task(&id, WAIT).await?;
            assert_eq!(task.status(), TaskStatus::Completed);

            let steps = result_steps(&task);
            assert_eq!(steps.len(), 1);
            assert_eq!(steps[0]["id"], "step-1");
            assert_eq!(steps[0]["role"], "researcher");
            assert_eq!(steps[0]["action"], "open incidents");
            assert_eq!(steps[0]["status"], "completed");
            kernel.stop().await;
        }
        Ok(())
    }

    #[tokio::test]
    async fn reflection_failures_do_not_fail_the_task() -> Result<()> {
        let memory = FnAgent::new(AgentRole::Memory, |_| anyhow::bail!("store is read-only"));
        let narrator = FnAgent::new(AgentRole::Narrator, |_| {
            Ok(Response::Narrated { text: "too late".to_owned() })
        })
        .with_delay(Duration::from_millis(400));
        let TestKernel { kernel, .. } =
            kernel_with(vec![Arc::new(memory), Arc::new(narrator)], quick_config())?;
        kernel.start().await?;

        let id = kernel.submit(TaskRequest::new(TaskType::Research, "queue theory"))?;
        let task = kernel.wait_for_task(&id, WAIT).await?;
        assert_eq!(task.status(), TaskStatus::Completed);
        let result = task.result.clone().unwrap_or_default();
        assert!(result.get("narrative").is_none());
        assert!(!result_steps(&task).is_empty());
        assert_eq!(kernel.metrics().tasks_failed, 0);
        assert_eq!(kernel.state(), KernelState::Idle);
        kernel.stop().await;
        Ok(())
    }

    #[tokio::test]
    async fn recovery_wakes_sleeping_agents() -> Result<()> {
        let builder = FnAgent::new(AgentRole::Builder, |_| anyhow::bail!("linker crashed"));
        let critic = FnAgent::new(AgentRole::Critic, |_| {
            Ok(Response::Critiqued {
                continue_execution: false,
                reason: None,
            })
        });
        let TestKernel { kernel, .. } =
            kernel_with(vec![Arc::new(builder), Arc::new(critic)], quick_config())?;
        kernel.start().await?;

        let narrator = kernel
            .agents()
            .agents_by_role(AgentRole::Narrator)
            .into_iter()
            .next()
            .expect("narrator registered");
        kernel.agents().sleep(&narrator)?;

        let id = kernel.submit(TaskRequest::new(TaskType::Build, "the installer"))?;
        let task = kernel.wait_for_task(&id, WAIT).await?;
        assert_eq!(task.status(), TaskStatus::Failed);
        assert_eq!(kernel.metrics().recoveries, 1);

        let state = kernel.agents().health(&narrator).map(|health| health.state);
        assert_eq!(state, Some(AgentState::Idle));
        assert_eq!(kernel.agents().counts().sleeping, 0);
        kernel.stop().await;
        Ok(())
    }

    /// Look every id up in a tight loop until `done` is set; returns how many
    /// lookups found nothing.
    fn watch_lookups(kernel: &Kernel, ids: &[TaskId], done: &Arc<AtomicBool>) -> JoinHandle<usize> {
        let kernel = kernel.clone();
        let ids = ids.to_vec();
        let done = done.clone();
        tokio::spawn(async move {
            let mut misses = 0;
            while !done.load(Ordering::SeqCst) {
                misses += ids.iter().filter(|id| kernel.task(id).is_none()).count();
                tokio::task::yield_now().await;
            }
            misses
        })
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn settling_tasks_stay_queryable() -> Result<()> {
        let TestKernel { kernel, .. } = kernel_with(Vec::new(), KernelConfig::default())?;
        let mut ids = Vec::new();
        for index in 0..200 {
            ids.push(kernel.submit(TaskRequest::new(TaskType::Query, format!("metric {index}")))?);
        }
        let done = Arc::new(AtomicBool::new(false));
        let watcher = watch_lookups(&kernel, &ids, &done);
        kernel.start().await?;

        for id in &ids {
            let task = kernel.wait_for_task(id, Duration::from_secs(30)).await?;
            assert_eq!(task.status(), TaskStatus::Completed);
        }
        done.store(true, Ordering::SeqCst);
        assert_eq!(watcher.await?, 0);
        assert_eq!(kernel.metrics().tasks_completed, 200);
        kernel.stop().await;
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn deferring_tasks_stay_queryable() -> Result<()> {
        let broken = FnAgent::new(AgentRole::Ethics, |_| anyhow::bail!("scoring model offline"));
        let TestKernel { kernel, .. } = kernel_with(vec![Arc::new(broken)], quick_config())?;
        let mut ids = Vec::new();
        for index in 0..100 {
            ids.push(kernel.submit(TaskRequest::new(TaskType::Query, format!("report {index}")))?);
        }
        let done = Arc::new(AtomicBool::new(false));
        let watcher = watch_lookups(&kernel, &ids, &done);
        kernel.start().await?;

        for id in &ids {
            let task = kernel.wait_for_task(id, Duration::from_secs(30)).await?;
            assert_eq!(task.status(), TaskStatus::Pending);
            assert!(task.error.as_deref().is_some_and(|error| error.starts_with("deferred")));
        }
        done.store(true, Ordering::SeqCst);
        assert_eq!(watcher.await?, 0);
        assert_eq!(kernel.deferred_tasks().len(), 100);
        kernel.stop().await;
        Ok(())
    }
}
