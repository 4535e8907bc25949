//! Invariant context snapshots and check results.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

use crate::kernel::KernelState;

#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Low,
    #[default]
    Medium,
    High,
    Critical,
}

/// Read-only snapshot assembled by the kernel for one check cycle.
///
/// `merkle_valid` and `consistency_valid` are supplied by other subsystems;
/// `None` means nobody reported and the corresponding check passes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InvariantContext {
    pub state: KernelState,
    pub energy: f64,
    pub dormancy_threshold: f64,
    pub responsive_agents: usize,
    pub total_agents: usize,
    pub queue_length: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub merkle_valid: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub consistency_valid: Option<bool>,
    #[serde(default)]
    pub extra: BTreeMap<String, Value>,
}

impl InvariantContext {
    pub fn new(energy: f64, dormancy_threshold: f64) -> Self {
        Self {
            state: KernelState::Idle,
            energy,
            dormancy_threshold,
            responsive_agents: 0,
            total_agents: 0,
            queue_length: 0,
            merkle_valid: None,
            consistency_valid: None,
            extra: BTreeMap::new(),
        }
    }

    pub fn with_agents(mut self, responsive: usize, total: usize) -> Self {
        self.responsive_agents = responsive;
        self.total_agents = total;
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InvariantResult {
    pub id: String,
    pub name: String,
    pub satisfied: bool,
    pub severity: Severity,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl InvariantResult {
    pub fn pass(id: impl Into<String>, name: impl Into<String>, severity: Severity) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            satisfied: true,
            severity,
            message: None,
        }
    }

    pub fn violation(
        id: impl Into<String>,
        name: impl Into<String>,
        severity: Severity,
        message: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            satisfied: false,
            severity,
            message: Some(message.into()),
        }
    }

    pub fn is_critical_violation(&self) -> bool {
        !self.satisfied && self.severity == Severity::Critical
    }
}
