//! Agent roles, lifecycle states and health snapshots.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Capability role of an agent. The set is closed: steps and requests are
/// routed by role, never by agent identity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentRole {
    Sensor,
    Planner,
    Ethics,
    Researcher,
    Builder,
    Critic,
    Memory,
    Narrator,
}

impl AgentRole {
    pub const ALL: [AgentRole; 8] = [
        AgentRole::Sensor,
        AgentRole::Planner,
        AgentRole::Ethics,
        AgentRole::Researcher,
        AgentRole::Builder,
        AgentRole::Critic,
        AgentRole::Memory,
        AgentRole::Narrator,
    ];

    /// Roles kept awake while the kernel is dormant.
    pub fn is_essential(self) -> bool {
        matches!(self, AgentRole::Memory | AgentRole::Sensor)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            AgentRole::Sensor => "sensor",
            AgentRole::Planner => "planner",
            AgentRole::Ethics => "ethics",
            AgentRole::Researcher => "researcher",
            AgentRole::Builder => "builder",
            AgentRole::Critic => "critic",
            AgentRole::Memory => "memory",
            AgentRole::Narrator => "narrator",
        }
    }
}

impl fmt::Display for AgentRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Lifecycle state of a single agent.
///
/// Normal cycle is `Idle -> Working -> Waiting -> Idle`. Any state may move
/// to `Sleeping` or `Error`; `Sleeping` only leaves through a wake, and
/// `Shutdown` is terminal.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentState {
    #[default]
    Idle,
    Working,
    Waiting,
    Sleeping,
    Error,
    Shutdown,
}

impl AgentState {
    pub fn is_healthy(self) -> bool {
        matches!(
            self,
            AgentState::Idle | AgentState::Working | AgentState::Waiting
        )
    }

    pub fn can_transition_to(self, next: AgentState) -> bool {
        use AgentState::*;
        match (self, next) {
            (Shutdown, _) => false,
            (_, Shutdown) | (_, Sleeping) | (_, Error) => true,
            (Idle, Working) | (Working, Waiting) | (Waiting, Idle) => true,
            (Sleeping, Idle) => true,
            _ => false,
        }
    }
}

impl fmt::Display for AgentState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            AgentState::Idle => "idle",
            AgentState::Working => "working",
            AgentState::Waiting => "waiting",
            AgentState::Sleeping => "sleeping",
            AgentState::Error => "error",
            AgentState::Shutdown => "shutdown",
        };
        f.write_str(name)
    }
}

/// Point-in-time health probe of one agent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentHealth {
    pub state: AgentState,
    pub uptime_ms: u64,
    pub messages_processed: u64,
    pub errors: u64,
    pub last_activity: DateTime<Utc>,
}

impl AgentHealth {
    /// Health is derived from the reported state, never tracked separately.
    pub fn is_healthy(&self) -> bool {
        self.state.is_healthy()
    }
}
