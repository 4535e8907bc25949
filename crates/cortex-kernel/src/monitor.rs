//! Out-of-band supervision: invariant checks, agent health, recovery and the
//! self-improvement cycle.

use std::time::Duration;

use cortex_invariants::InvariantRegistry;
use cortex_protocol::{
    AgentState, Alert, AlertKind, AlertLevel, ImprovementReviewRequest, InvariantContext,
    InvariantResult, KernelState, MessageKind, Response, AgentRole, TaskStatus,
};
use serde::Serialize;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, instrument, warn};

use crate::executor::AskError;
use crate::kernel::Kernel;

/// Number of finished tasks summarised in an improvement review.
const REVIEW_WINDOW: usize = 50;

/// Result of one monitor pass.
#[derive(Debug, Clone, Serialize)]
pub struct HealthReport {
    pub state: KernelState,
    pub energy: f64,
    pub unhealthy_agents: Vec<String>,
    pub invariants: Vec<InvariantResult>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub improvement_suggestions: Option<usize>,
}

impl HealthReport {
    pub fn violations(&self) -> Vec<&InvariantResult> {
        InvariantRegistry::violations(&self.invariants)
    }
}

impl Kernel {
    fn invariant_context(&self) -> InvariantContext {
        let agents = self.inner.agents.counts();
        let core = self.inner.core.lock();
        let mut ctx = InvariantContext::new(core.energy, self.inner.config.dormancy_threshold)
            .with_agents(agents.healthy, agents.total);
        ctx.state = core.state;
        ctx.queue_length = core.queue.len();
        ctx
    }

    /// Run every registered invariant against a fresh snapshot. Each
    /// violation is broadcast as an alert; critical ones are counted apart.
    #[instrument(skip(self))]
    pub fn check_invariants(&self) -> Vec<InvariantResult> {
        let registry = &self.inner.invariants;
        let ctx = registry.prepare(self.invariant_context());
        let results = registry.check_all(&ctx);

        let violations = InvariantRegistry::violations(&results);
        let critical = InvariantRegistry::critical_violations(&results).len();
        {
            let mut core = self.inner.core.lock();
            core.metrics.invariant_checks += 1;
            core.metrics.invariant_violations += violations.len() as u64;
            core.metrics.critical_violations += critical as u64;
        }
        for violation in violations {
            let level = if violation.is_critical_violation() {
                AlertLevel::Critical
            } else {
                AlertLevel::Warning
            };
            self.alert(Alert::new(
                level,
                AlertKind::InvariantViolation {
                    invariant_id: violation.id.clone(),
                    name: violation.name.clone(),
                },
                violation
                    .message
                    .clone()
                    .unwrap_or_else(|| format!("invariant {} violated", violation.id)),
            ));
        }
        debug!(checked = results.len(), critical, "invariants checked");
        results
    }

    /// One monitor pass: agent health, invariants, and an improvement cycle
    /// when enabled.
    #[instrument(skip(self))]
    pub async fn health_check(&self) -> HealthReport {
        self.inner.core.lock().metrics.health_checks += 1;

        let mut unhealthy_agents = Vec::new();
        for snapshot in self.inner.agents.health_report() {
            if snapshot.health.state != AgentState::Error {
                continue;
            }
            warn!(agent = %snapshot.id, errors = snapshot.health.errors, "agent unhealthy");
            self.alert(Alert::new(
                AlertLevel::Warning,
                AlertKind::AgentUnhealthy {
                    agent_id: snapshot.id.to_string(),
                    state: snapshot.health.state.to_string(),
                },
                snapshot
                    .last_error
                    .unwrap_or_else(|| format!("agent {} is in error state", snapshot.id)),
            ));
            unhealthy_agents.push(snapshot.id.to_string());
        }

        let invariants = self.check_invariants();
        // Applies a dormancy that was deferred while a task ran.
        self.resume();
        let improvement_suggestions = if self.inner.config.enable_self_improvement {
            self.self_improve().await
        } else {
            None
        };

        HealthReport {
            state: self.state(),
            energy: self.energy(),
            unhealthy_agents,
            invariants,
            improvement_suggestions,
        }
    }

    /// Restart every unhealthy agent (errored or sleeping), re-check
    /// invariants and force `idle`.
    /// Never fails; problems along the way are logged.
    #[instrument(skip(self))]
    pub(crate) fn recover(&self) {
        let agents = &self.inner.agents;
        let mut restarted = 0usize;
        for snapshot in agents.health_report() {
            if snapshot.health.is_healthy() || snapshot.health.state == AgentState::Shutdown {
                continue;
            }
            match agents.restart(&snapshot.id) {
                Ok(()) => restarted += 1,
                Err(error) => warn!(agent = %snapshot.id, %error, "agent restart failed"),
            }
        }
        {
            let mut core = self.inner.core.lock();
            core.metrics.recoveries += 1;
            core.metrics.agent_restarts += restarted as u64;
        }

        self.check_invariants();
        self.force_state(KernelState::Idle);
        info!(restarted, "recovery complete");
        self.alert(Alert::new(
            AlertLevel::Info,
            AlertKind::Recovery {
                restarted_agents: restarted,
            },
            format!("recovered; {restarted} agent(s) restarted"),
        ));
    }

    /// Ask the critic to review recent outcomes. Runs only from `idle` with an
    /// empty queue and at least one task finished since the last cycle.
    /// Returns the number of suggestions received.
    #[instrument(skip(self))]
    pub async fn self_improve(&self) -> Option<usize> {
        let claimed = {
            let mut core = self.inner.core.lock();
            if !core.started
                || core.stopped
                || core.state != KernelState::Idle
                || !core.queue.is_empty()
                || core.finished_since_review == 0
            {
                return None;
            }
            let claimed = self
                .transition_locked(&mut core, KernelState::SelfImproving)
                .is_some();
            if claimed {
                core.finished_since_review = 0;
            }
            claimed
        };
        if !claimed {
            return None;
        }
        self.after_transition(KernelState::Idle, KernelState::SelfImproving);

        let recent = self.inner.ledger.recent(REVIEW_WINDOW);
        let completed = recent
            .iter()
            .filter(|task| task.status() == TaskStatus::Completed)
            .count();
        let failed: Vec<_> = recent
            .iter()
            .filter(|task| task.status() == TaskStatus::Failed)
            .collect();
        let request = MessageKind::ImprovementReview(ImprovementReviewRequest {
            completed,
            failed: failed.len(),
            recent_errors: failed
                .iter()
                .rev()
                .filter_map(|task| task.error.clone())
                .collect(),
        });

        let suggestions = match self.ask(AgentRole::Critic, request).await {
            Ok(Response::Reviewed { suggestions }) => {
                self.inner.core.lock().metrics.self_improvement_cycles += 1;
                info!(suggestions = suggestions.len(), "improvement review finished");
                for suggestion in &suggestions {
                    debug!(%suggestion, "improvement suggestion");
                }
                self.transition(KernelState::Idle);
                Some(suggestions.len())
            }
            Err(AskError::Agent(message)) => {
                warn!(%message, "improvement review failed");
                self.transition(KernelState::Error);
                self.recover();
                None
            }
            Ok(other) => {
                warn!(reply = ?other, "unexpected improvement review reply");
                self.transition(KernelState::Idle);
                None
            }
            Err(error) => {
                warn!(%error, "critic unavailable for improvement review");
                self.transition(KernelState::Idle);
                None
            }
        };
        self.resume();
        suggestions
    }
}

/// Spawn the periodic monitor. It holds only a weak handle, so dropping every
/// `Kernel` ends it as well as `stop()`.
pub(crate) fn spawn_monitor(kernel: &Kernel) -> JoinHandle<()> {
    let weak = kernel.downgrade();
    let mut shutdown = kernel.inner.shutdown.subscribe();
    let period = kernel
        .config()
        .health_check_interval()
        .max(Duration::from_millis(1));
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // The first tick completes immediately.
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let Some(kernel) = Kernel::from_weak(&weak) else { break };
                    let report = kernel.health_check().await;
                    debug!(
                        state = %report.state,
                        violations = report.violations().len(),
                        unhealthy = report.unhealthy_agents.len(),
                        "health check finished"
                    );
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
        debug!("monitor stopped");
    })
}
