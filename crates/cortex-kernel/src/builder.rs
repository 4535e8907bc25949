use std::collections::HashSet;
use std::sync::Arc;

use anyhow::{Context, Result};
use cortex_agents::{Agent, AgentRegistry, reference};
use cortex_bus::MessageBus;
use cortex_invariants::InvariantRegistry;
use cortex_protocol::KernelConfig;
use tracing::debug;

use crate::kernel::Kernel;
use crate::ledger::{LedgerContributor, TaskLedger};

/// Assembles a [`Kernel`] from explicitly injected parts.
pub struct KernelBuilder {
    config: KernelConfig,
    bus: Option<MessageBus>,
    invariants: Option<InvariantRegistry>,
    agents: Vec<Arc<dyn Agent>>,
    reference_agents: bool,
}

impl Default for KernelBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl KernelBuilder {
    pub fn new() -> Self {
        Self {
            config: KernelConfig::default(),
            bus: None,
            invariants: None,
            agents: Vec::new(),
            reference_agents: false,
        }
    }

    pub fn config(mut self, config: KernelConfig) -> Self {
        self.config = config;
        self
    }

    pub fn energy(mut self, energy: f64) -> Self {
        self.config.energy = energy;
        self
    }

    pub fn dormancy_threshold(mut self, threshold: f64) -> Self {
        self.config.dormancy_threshold = threshold;
        self
    }

    /// Share an existing bus instead of creating one.
    pub fn bus(mut self, bus: MessageBus) -> Self {
        self.bus = Some(bus);
        self
    }

    /// Start from a registry that already holds external checks.
    pub fn invariants(mut self, invariants: InvariantRegistry) -> Self {
        self.invariants = Some(invariants);
        self
    }

    pub fn agent(mut self, agent: Arc<dyn Agent>) -> Self {
        self.agents.push(agent);
        self
    }

    pub fn agents(mut self, agents: impl IntoIterator<Item = Arc<dyn Agent>>) -> Self {
        self.agents.extend(agents);
        self
    }

    /// Fill every role without an injected agent with its reference agent.
    pub fn reference_agents(mut self, enabled: bool) -> Self {
        self.reference_agents = enabled;
        self
    }

    pub fn build(self) -> Result<Kernel> {
        self.config.validate().context("invalid kernel configuration")?;

        let bus = self.bus.unwrap_or_default();
        let invariants = self.invariants.unwrap_or_else(|| {
            InvariantRegistry::with_capacity(
                self.config.min_responsive_agents,
                self.config.violation_log_capacity,
            )
        });

        let agents = AgentRegistry::new();
        let mut covered = HashSet::new();
        for agent in self.agents {
            covered.insert(agent.role());
            agents.register(agent)?;
        }
        if self.reference_agents {
            for agent in reference::population() {
                if !covered.contains(&agent.role()) {
                    agents.register(agent)?;
                }
            }
        }

        let ledger = Arc::new(TaskLedger::new(self.config.task_history_capacity));
        invariants
            .register_contributor(Arc::new(LedgerContributor::new(ledger.clone())))
            .context("invariant registry must be open when building a kernel")?;

        debug!(
            agents = agents.len(),
            invariants = invariants.len(),
            "kernel assembled"
        );
        Ok(Kernel::from_parts(
            self.config,
            bus,
            agents,
            invariants,
            ledger,
        ))
    }
}
