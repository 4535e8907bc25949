//! Checks every registry starts with. They cannot be removed or replaced.

use cortex_protocol::{InvariantContext, InvariantResult, Severity};

use crate::Invariant;

pub const MIN_RESPONSIVE_AGENTS: &str = "min_responsive_agents";
pub const ENERGY_POSITIVE: &str = "energy_positive";
pub const MERKLE_VALID: &str = "merkle_valid";
pub const CONSISTENCY_VALID: &str = "consistency_valid";

/// At least `min` agents must be in a healthy state.
#[derive(Debug, Clone)]
pub struct MinResponsiveAgents {
    pub min: usize,
}

impl Invariant for MinResponsiveAgents {
    fn id(&self) -> &str {
        MIN_RESPONSIVE_AGENTS
    }

    fn name(&self) -> &str {
        "Minimum responsive agents"
    }

    fn severity(&self) -> Severity {
        Severity::Critical
    }

    fn check(&self, ctx: &InvariantContext) -> InvariantResult {
        if ctx.responsive_agents >= self.min {
            return InvariantResult::pass(self.id(), self.name(), self.severity());
        }
        InvariantResult::violation(
            self.id(),
            self.name(),
            self.severity(),
            format!(
                "{} of {} agents responsive, need at least {}",
                ctx.responsive_agents, ctx.total_agents, self.min
            ),
        )
    }
}

#[derive(Debug, Clone, Default)]
pub struct EnergyPositive;

impl Invariant for EnergyPositive {
    fn id(&self) -> &str {
        ENERGY_POSITIVE
    }

    fn name(&self) -> &str {
        "Energy above zero"
    }

    fn severity(&self) -> Severity {
        Severity::High
    }

    fn check(&self, ctx: &InvariantContext) -> InvariantResult {
        if ctx.energy > 0.0 {
            InvariantResult::pass(self.id(), self.name(), self.severity())
        } else {
            InvariantResult::violation(self.id(), self.name(), self.severity(), "energy exhausted")
        }
    }
}

/// Reported by the task ledger. An unreported flag passes.
#[derive(Debug, Clone, Default)]
pub struct MerkleValid;

impl Invariant for MerkleValid {
    fn id(&self) -> &str {
        MERKLE_VALID
    }

    fn name(&self) -> &str {
        "Ledger hash chain valid"
    }

    fn severity(&self) -> Severity {
        Severity::Critical
    }

    fn check(&self, ctx: &InvariantContext) -> InvariantResult {
        match ctx.merkle_valid {
            Some(false) => InvariantResult::violation(
                self.id(),
                self.name(),
                self.severity(),
                "ledger hash chain does not verify",
            ),
            _ => InvariantResult::pass(self.id(), self.name(), self.severity()),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct ConsistencyValid;

impl Invariant for ConsistencyValid {
    fn id(&self) -> &str {
        CONSISTENCY_VALID
    }

    fn name(&self) -> &str {
        "State consistency"
    }

    fn severity(&self) -> Severity {
        Severity::High
    }

    fn check(&self, ctx: &InvariantContext) -> InvariantResult {
        match ctx.consistency_valid {
            Some(false) => InvariantResult::violation(
                self.id(),
                self.name(),
                self.severity(),
                "consistency check reported a mismatch",
            ),
            _ => InvariantResult::pass(self.id(), self.name(), self.severity()),
        }
    }
}
