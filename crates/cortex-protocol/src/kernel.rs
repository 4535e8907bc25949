//! Kernel states, status snapshots, metrics and alerts.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Top-level kernel state. Transitions are restricted to
/// [`KernelState::allowed_transitions`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KernelState {
    #[default]
    Idle,
    Sensing,
    Thinking,
    Deciding,
    Acting,
    Reflecting,
    Dormant,
    SelfImproving,
    Error,
}

impl KernelState {
    pub const ALL: [KernelState; 9] = [
        KernelState::Idle,
        KernelState::Sensing,
        KernelState::Thinking,
        KernelState::Deciding,
        KernelState::Acting,
        KernelState::Reflecting,
        KernelState::Dormant,
        KernelState::SelfImproving,
        KernelState::Error,
    ];

    pub fn allowed_transitions(self) -> &'static [KernelState] {
        use KernelState::*;
        match self {
            Idle => &[Sensing, SelfImproving, Dormant],
            Sensing => &[Thinking, Error, Idle],
            Thinking => &[Deciding, Sensing, Error, Idle],
            // Deciding -> Idle is the "deferred to a human" path.
            Deciding => &[Acting, Thinking, Idle],
            Acting => &[Reflecting, Error],
            Reflecting => &[Idle, Thinking],
            Dormant => &[Idle],
            SelfImproving => &[Idle, Error],
            Error => &[Idle],
        }
    }

    pub fn can_transition_to(self, next: KernelState) -> bool {
        self.allowed_transitions().contains(&next)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            KernelState::Idle => "idle",
            KernelState::Sensing => "sensing",
            KernelState::Thinking => "thinking",
            KernelState::Deciding => "deciding",
            KernelState::Acting => "acting",
            KernelState::Reflecting => "reflecting",
            KernelState::Dormant => "dormant",
            KernelState::SelfImproving => "self_improving",
            KernelState::Error => "error",
        }
    }
}

impl fmt::Display for KernelState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentCounts {
    pub total: usize,
    pub healthy: usize,
    pub sleeping: usize,
    pub errored: usize,
}

/// Aggregate view returned by `status()` and the `GetStatus` command.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KernelStatus {
    pub state: KernelState,
    pub energy: f64,
    pub dormancy_threshold: f64,
    pub agents: AgentCounts,
    pub queue_length: usize,
    pub active_tasks: usize,
    pub deferred_tasks: usize,
    pub completed_tasks: u64,
    pub failed_tasks: u64,
    pub uptime_ms: u64,
    pub running: bool,
}

/// Monotonic counters. Only the kernel increments them.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct KernelMetrics {
    pub tasks_submitted: u64,
    pub tasks_completed: u64,
    pub tasks_failed: u64,
    pub tasks_deferred: u64,
    pub tasks_cancelled: u64,
    pub steps_executed: u64,
    pub steps_skipped: u64,
    pub steps_failed: u64,
    pub state_transitions: u64,
    pub rejected_transitions: u64,
    pub dormancy_entries: u64,
    pub health_checks: u64,
    pub invariant_checks: u64,
    pub invariant_violations: u64,
    pub critical_violations: u64,
    pub recoveries: u64,
    pub agent_restarts: u64,
    pub self_improvement_cycles: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertLevel {
    Info,
    Warning,
    Critical,
}

/// What an alert is about.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AlertKind {
    Dormancy { energy: f64, threshold: f64 },
    Wake { energy: f64 },
    InvariantViolation { invariant_id: String, name: String },
    AgentUnhealthy { agent_id: String, state: String },
    TaskFailed { task_id: String },
    Recovery { restarted_agents: usize },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Alert {
    pub level: AlertLevel,
    pub kind: AlertKind,
    pub message: String,
}

impl Alert {
    pub fn new(level: AlertLevel, kind: AlertKind, message: impl Into<String>) -> Self {
        Self {
            level,
            kind,
            message: message.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transition_table_matches_lifecycle() {
        use KernelState::*;
        assert!(Idle.can_transition_to(Sensing));
        assert!(Idle.can_transition_to(Dormant));
        assert!(Deciding.can_transition_to(Idle));
        assert!(Dormant.can_transition_to(Idle));
        assert!(!Dormant.can_transition_to(Sensing));
        assert!(!Acting.can_transition_to(Idle));
        assert!(!Reflecting.can_transition_to(Error));
        assert!(!Idle.can_transition_to(Idle));
    }

    #[test]
    fn every_state_can_eventually_reach_idle() {
        for state in KernelState::ALL {
            let mut frontier = vec![state];
            let mut seen = vec![state];
            let mut reached = state == KernelState::Idle;
            while let Some(current) = frontier.pop() {
                for next in current.allowed_transitions() {
                    if *next == KernelState::Idle {
                        reached = true;
                    }
                    if !seen.contains(next) {
                        seen.push(*next);
                        frontier.push(*next);
                    }
                }
            }
            assert!(reached, "{state} cannot reach idle");
        }
    }

    #[test]
    fn state_serializes_snake_case() {
        let json = serde_json::to_string(&KernelState::SelfImproving).unwrap();
        assert_eq!(json, "\"self_improving\"");
    }
}
