//! Turns planner output into an executable [`TaskPlan`].
//!
//! Routing is capability-based: a declared [`StepKind`] maps to a role
//! through [`role_for_kind`]. Steps without a kind fall back to keyword
//! matching over the action text, then to the task type's default role.

use std::collections::HashSet;

use cortex_protocol::{
    AgentRole, PlannedStep, StepId, StepKind, StepStatus, Task, TaskPlan, TaskStep, TaskType,
};
use serde_json::Value;

/// Role that executes a step of `kind`. `General` uses the task default.
pub fn role_for_kind(kind: StepKind, task_type: TaskType) -> AgentRole {
    match kind {
        StepKind::Sense => AgentRole::Sensor,
        StepKind::Research | StepKind::Analyze => AgentRole::Researcher,
        StepKind::Build => AgentRole::Builder,
        StepKind::Review => AgentRole::Critic,
        StepKind::Remember => AgentRole::Memory,
        StepKind::Narrate => AgentRole::Narrator,
        StepKind::Evaluate => AgentRole::Ethics,
        StepKind::General => default_role(task_type),
    }
}

pub fn default_role(task_type: TaskType) -> AgentRole {
    match task_type {
        TaskType::Query | TaskType::Research | TaskType::Analysis => AgentRole::Researcher,
        TaskType::Build | TaskType::Maintenance => AgentRole::Builder,
        TaskType::Creative => AgentRole::Narrator,
    }
}

// First match wins, so more specific intents come first.
const KEYWORD_ROUTES: &[(&[&str], AgentRole)] = &[
    (
        &["review", "critique", "verify", "validate", "test"],
        AgentRole::Critic,
    ),
    (&["remember", "store", "record", "archive"], AgentRole::Memory),
    (
        &["narrate", "summarize", "summarise", "explain", "report", "draft"],
        AgentRole::Narrator,
    ),
    (&["ethic", "compliance", "consent"], AgentRole::Ethics),
    (&["sense", "observe", "monitor", "measure"], AgentRole::Sensor),
    (
        &["build", "implement", "code", "deploy", "fix", "repair", "write"],
        AgentRole::Builder,
    ),
    (
        &[
            "research",
            "search",
            "look up",
            "gather",
            "find",
            "analyze",
            "analyse",
            "investigate",
        ],
        AgentRole::Researcher,
    ),
];

/// Keyword guess for an action without a declared kind.
pub fn role_for_action(action: &str) -> Option<AgentRole> {
    let action = action.to_lowercase();
    KEYWORD_ROUTES
        .iter()
        .find(|(keywords, _)| keywords.iter().any(|keyword| action.contains(keyword)))
        .map(|(_, role)| *role)
}

fn route(step: &PlannedStep, task_type: TaskType) -> (StepKind, AgentRole) {
    match step.kind {
        Some(kind) => (kind, role_for_kind(kind, task_type)),
        None => (
            StepKind::General,
            role_for_action(&step.action).unwrap_or_else(|| default_role(task_type)),
        ),
    }
}

/// Convert planner steps into task steps. Missing ids become `step-<n>`;
/// duplicate ids get a numeric suffix.
pub fn build_plan(task: &Task, planned: Vec<PlannedStep>) -> TaskPlan {
    let mut seen = HashSet::new();
    let steps = planned
        .into_iter()
        .enumerate()
        .map(|(index, step)| {
            let base = step.id.clone().unwrap_or_else(|| format!("step-{}", index + 1));
            let mut id = base.clone();
            let mut suffix = index + 1;
            while !seen.insert(id.clone()) {
                id = format!("{base}-{suffix}");
                suffix += 1;
            }
            let (kind, role) = route(&step, task.task_type);
            TaskStep {
                id: StepId::from(id),
                kind,
                role,
                action: step.action,
                input: step.input,
                output: None,
                error: None,
                status: StepStatus::Pending,
                depends_on: step.depends_on.into_iter().map(StepId::from).collect(),
            }
        })
        .collect();
    TaskPlan::new(task.id.clone(), steps)
}

/// Single step running the task type's default role on the goal itself.
pub fn fallback_plan(task: &Task) -> TaskPlan {
    let step = TaskStep {
        id: StepId::from("step-1"),
        kind: StepKind::General,
        role: default_role(task.task_type),
        action: task.goal.clone(),
        input: task.context.clone().unwrap_or(Value::Null),
        output: None,
        error: None,
        status: StepStatus::Pending,
        depends_on: Vec::new(),
    };
    TaskPlan::new(task.id.clone(), vec![step])
}

#[cfg(test)]
mod tests {
    use super::*;
    use cortex_protocol::TaskRequest;

    fn task(task_type: TaskType) -> Task {
        Task::from_request(TaskRequest::new(task_type, "ship the parser"))
    }

    #[test]
    fn declared_kinds_route_through_the_table() {
        assert_eq!(role_for_kind(StepKind::Review, TaskType::Query), AgentRole::Critic);
        assert_eq!(role_for_kind(StepKind::Evaluate, TaskType::Query), AgentRole::Ethics);
        assert_eq!(role_for_kind(StepKind::General, TaskType::Creative), AgentRole::Narrator);
        assert_eq!(role_for_kind(StepKind::General, TaskType::Maintenance), AgentRole::Builder);
    }

    #[test]
    fn keyword_fallback_and_default_role() {
        assert_eq!(role_for_action("Review the diff"), Some(AgentRole::Critic));
        assert_eq!(role_for_action("write a report"), Some(AgentRole::Narrator));
        assert_eq!(role_for_action("implement the lexer"), Some(AgentRole::Builder));
        assert_eq!(role_for_action("ponder"), None);

        let plan = build_plan(
            &task(TaskType::Build),
            vec![PlannedStep {
                id: None,
                kind: None,
                action: "ponder".to_owned(),
                input: Value::Null,
                depends_on: Vec::new(),
            }],
        );
        assert_eq!(plan.steps[0].role, AgentRole::Builder);
        assert_eq!(plan.steps[0].id.as_str(), "step-1");
    }

    #[test]
    fn ids_and_dependencies_are_preserved() {
        let plan = build_plan(
            &task(TaskType::Build),
            vec![
                PlannedStep::new(StepKind::Research, "requirements").with_id("req"),
                PlannedStep::new(StepKind::Build, "build").with_id("req").depends_on(&["req"]),
                PlannedStep::new(StepKind::Review, "review"),
            ],
        );
        let ids: Vec<_> = plan.steps.iter().map(|step| step.id.as_str()).collect();
        assert_eq!(ids, vec!["req", "req-2", "step-3"]);
        assert_eq!(plan.steps[1].depends_on, vec![StepId::from("req")]);
        assert!(plan.steps.iter().all(|step| step.status == StepStatus::Pending));
    }

    #[test]
    fn renamed_duplicates_never_collide() {
        let plan = build_plan(
            &task(TaskType::Build),
            vec![
                PlannedStep::new(StepKind::Build, "first").with_id("a"),
                PlannedStep::new(StepKind::Build, "second").with_id("a-3"),
                PlannedStep::new(StepKind::Build, "third").with_id("a"),
            ],
        );
        let ids: Vec<_> = plan.steps.iter().map(|step| step.id.as_str()).collect();
        assert_eq!(ids, vec!["a", "a-3", "a-4"]);
    }

    #[test]
    fn fallback_uses_task_default_role() {
        let plan = fallback_plan(&task(TaskType::Creative));
        assert_eq!(plan.steps.len(), 1);
        assert_eq!(plan.steps[0].role, AgentRole::Narrator);
        assert_eq!(plan.steps[0].action, "ship the parser");
    }
}
