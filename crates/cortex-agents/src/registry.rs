use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use anyhow::{Result, bail};
use chrono::{DateTime, Utc};
use cortex_bus::{MessageBus, Subscription};
use cortex_protocol::{
    Address, AgentCounts, AgentHealth, AgentId, AgentRole, AgentState, Message, Response,
};
use indexmap::IndexMap;
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, instrument, warn};

use crate::Agent;

const SHUTDOWN_GRACE: Duration = Duration::from_millis(250);

#[derive(Debug)]
struct Lifecycle {
    state: AgentState,
    started_at: DateTime<Utc>,
    messages_processed: u64,
    errors: u64,
    last_activity: DateTime<Utc>,
    last_error: Option<String>,
}

struct AgentSlot {
    id: AgentId,
    role: AgentRole,
    agent: Arc<dyn Agent>,
    lifecycle: Mutex<Lifecycle>,
}

impl AgentSlot {
    fn state(&self) -> AgentState {
        self.lifecycle.lock().state
    }

    /// Apply `next` if the lifecycle table allows it.
    fn transition(&self, next: AgentState) -> bool {
        let mut lifecycle = self.lifecycle.lock();
        if lifecycle.state == next {
            return true;
        }
        if !lifecycle.state.can_transition_to(next) {
            return false;
        }
        lifecycle.state = next;
        lifecycle.last_activity = Utc::now();
        true
    }

    /// Move `from -> to` only if the agent is still in `from`.
    fn advance_if(&self, from: AgentState, to: AgentState) {
        let mut lifecycle = self.lifecycle.lock();
        if lifecycle.state == from && from.can_transition_to(to) {
            lifecycle.state = to;
            lifecycle.last_activity = Utc::now();
        }
    }

    fn health(&self) -> AgentHealth {
        let lifecycle = self.lifecycle.lock();
        let uptime = Utc::now().signed_duration_since(lifecycle.started_at);
        AgentHealth {
            state: lifecycle.state,
            uptime_ms: u64::try_from(uptime.num_milliseconds()).unwrap_or(0),
            messages_processed: lifecycle.messages_processed,
            errors: lifecycle.errors,
            last_activity: lifecycle.last_activity,
        }
    }
}

/// Serializable health entry of one registered agent.
#[derive(Debug, Clone, Serialize)]
pub struct AgentSnapshot {
    pub id: AgentId,
    pub role: AgentRole,
    pub health: AgentHealth,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
}

struct RegistryInner {
    agents: RwLock<IndexMap<AgentId, Arc<AgentSlot>>>,
    role_counters: Mutex<HashMap<AgentRole, usize>>,
    sealed: AtomicBool,
    shutdown: watch::Sender<bool>,
    runners: Mutex<Vec<JoinHandle<()>>>,
}

/// Owns every agent. Registration closes when `start` runs.
#[derive(Clone)]
pub struct AgentRegistry {
    inner: Arc<RegistryInner>,
}

impl Default for AgentRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for AgentRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AgentRegistry")
            .field("agents", &self.inner.agents.read().len())
            .field("started", &self.is_started())
            .finish()
    }
}

impl AgentRegistry {
    pub fn new() -> Self {
        let (shutdown, _) = watch::channel(false);
        Self {
            inner: Arc::new(RegistryInner {
                agents: RwLock::new(IndexMap::new()),
                role_counters: Mutex::new(HashMap::new()),
                sealed: AtomicBool::new(false),
                shutdown,
                runners: Mutex::new(Vec::new()),
            }),
        }
    }

    /// Register an agent and return its id (`<role>-<n>`).
    pub fn register(&self, agent: Arc<dyn Agent>) -> Result<AgentId> {
        if self.is_started() {
            bail!("agent registry is sealed; register agents before start");
        }
        let role = agent.role();
        let id = {
            let mut counters = self.inner.role_counters.lock();
            let counter = counters.entry(role).or_insert(0);
            *counter += 1;
            AgentId::from_string(format!("{role}-{counter}"))
        };
        let now = Utc::now();
        let slot = Arc::new(AgentSlot {
            id: id.clone(),
            role,
            agent,
            lifecycle: Mutex::new(Lifecycle {
                state: AgentState::Idle,
                started_at: now,
                messages_processed: 0,
                errors: 0,
                last_activity: now,
                last_error: None,
            }),
        });
        self.inner.agents.write().insert(id.clone(), slot);
        debug!(agent = %id, %role, "agent registered");
        Ok(id)
    }

    pub fn is_started(&self) -> bool {
        self.inner.sealed.load(Ordering::SeqCst)
    }

    /// Seal the registry and spawn one runner per agent. Each runner is
    /// subscribed before this returns, so requests can be sent immediately.
    #[instrument(skip_all)]
    pub fn start(&self, bus: &MessageBus) -> Result<()> {
        if self.inner.sealed.swap(true, Ordering::SeqCst) {
            bail!("agent registry already started");
        }
        let slots: Vec<_> = self.inner.agents.read().values().cloned().collect();
        let mut runners = self.inner.runners.lock();
        for slot in slots {
            let subscription = bus.subscribe(&Address::Agent(slot.id.clone()));
            let shutdown = self.inner.shutdown.subscribe();
            runners.push(tokio::spawn(run_agent(
                slot,
                bus.clone(),
                subscription,
                shutdown,
            )));
        }
        info!(agents = runners.len(), "agent runners started");
        Ok(())
    }

    /// Put an agent to sleep. Sleeping agents ignore requests.
    pub fn sleep(&self, id: &AgentId) -> Result<()> {
        let slot = self.slot(id)?;
        if !slot.transition(AgentState::Sleeping) {
            bail!("agent {id} cannot sleep from {}", slot.state());
        }
        debug!(agent = %id, "agent sleeping");
        Ok(())
    }

    /// Wake a sleeping agent. Agents that are not asleep are left alone.
    pub fn wake(&self, id: &AgentId) -> Result<()> {
        let slot = self.slot(id)?;
        match slot.state() {
            AgentState::Sleeping => {
                slot.advance_if(AgentState::Sleeping, AgentState::Idle);
                debug!(agent = %id, "agent woken");
                Ok(())
            }
            AgentState::Shutdown => bail!("agent {id} is shut down"),
            _ => Ok(()),
        }
    }

    /// Sleep then wake, clearing an error state.
    pub fn restart(&self, id: &AgentId) -> Result<()> {
        self.sleep(id)?;
        self.wake(id)?;
        if let Ok(slot) = self.slot(id) {
            slot.lifecycle.lock().last_error = None;
        }
        info!(agent = %id, "agent restarted");
        Ok(())
    }

    /// Move every agent to `shutdown` and stop its runner.
    pub async fn shutdown_all(&self) {
        let _ = self.inner.shutdown.send(true);
        for slot in self.inner.agents.read().values() {
            slot.transition(AgentState::Shutdown);
        }
        let runners: Vec<_> = self.inner.runners.lock().drain(..).collect();
        for mut runner in runners {
            if tokio::time::timeout(SHUTDOWN_GRACE, &mut runner)
                .await
                .is_err()
            {
                runner.abort();
                let _ = runner.await;
            }
        }
        info!("all agents shut down");
    }

    pub fn health(&self, id: &AgentId) -> Option<AgentHealth> {
        self.inner.agents.read().get(id).map(|slot| slot.health())
    }

    /// Health of every agent, in registration order.
    pub fn health_report(&self) -> Vec<AgentSnapshot> {
        self.inner
            .agents
            .read()
            .values()
            .map(|slot| AgentSnapshot {
                id: slot.id.clone(),
                role: slot.role,
                health: slot.health(),
                last_error: slot.lifecycle.lock().last_error.clone(),
            })
            .collect()
    }

    pub fn counts(&self) -> AgentCounts {
        let agents = self.inner.agents.read();
        let mut counts = AgentCounts {
            total: agents.len(),
            ..AgentCounts::default()
        };
        for slot in agents.values() {
            match slot.state() {
                state if state.is_healthy() => counts.healthy += 1,
                AgentState::Sleeping => counts.sleeping += 1,
                AgentState::Error => counts.errored += 1,
                _ => {}
            }
        }
        counts
    }

    /// First healthy agent with `role`, or the first one registered.
    pub fn find_by_role(&self, role: AgentRole) -> Option<AgentId> {
        let agents = self.inner.agents.read();
        let mut candidates = agents.values().filter(|slot| slot.role == role);
        let first = candidates.next()?;
        if first.state().is_healthy() {
            return Some(first.id.clone());
        }
        candidates
            .find(|slot| slot.state().is_healthy())
            .map(|slot| slot.id.clone())
            .or_else(|| Some(first.id.clone()))
    }

    pub fn agents_by_role(&self, role: AgentRole) -> Vec<AgentId> {
        self.inner
            .agents
            .read()
            .values()
            .filter(|slot| slot.role == role)
            .map(|slot| slot.id.clone())
            .collect()
    }

    pub fn role_of(&self, id: &AgentId) -> Option<AgentRole> {
        self.inner.agents.read().get(id).map(|slot| slot.role)
    }

    pub fn ids(&self) -> Vec<AgentId> {
        self.inner.agents.read().keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.inner.agents.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.agents.read().is_empty()
    }

    fn slot(&self, id: &AgentId) -> Result<Arc<AgentSlot>> {
        match self.inner.agents.read().get(id) {
            Some(slot) => Ok(slot.clone()),
            None => bail!("unknown agent: {id}"),
        }
    }
}

async fn run_agent(
    slot: Arc<AgentSlot>,
    bus: MessageBus,
    mut subscription: Subscription,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
            }
            message = subscription.recv() => {
                let Some(message) = message else { break };
                handle_message(&slot, &bus, message).await;
            }
        }
    }
    slot.transition(AgentState::Shutdown);
    debug!(agent = %slot.id, "agent runner exited");
}

async fn handle_message(slot: &AgentSlot, bus: &MessageBus, message: Message) {
    if !message.kind.expects_reply() {
        return;
    }
    let me = Address::Agent(slot.id.clone());
    match slot.state() {
        AgentState::Sleeping | AgentState::Shutdown => {
            debug!(agent = %slot.id, kind = message.kind.name(), "request ignored while unavailable");
            return;
        }
        AgentState::Error => {
            bus.reply(
                &message,
                me,
                Response::error(format!("agent {} is in error state", slot.id)),
            );
            return;
        }
        _ => {}
    }

    slot.advance_if(AgentState::Idle, AgentState::Working);
    let result = slot.agent.handle(&message.kind).await;
    match result {
        Ok(response) => {
            {
                let mut lifecycle = slot.lifecycle.lock();
                lifecycle.messages_processed += 1;
                lifecycle.last_activity = Utc::now();
            }
            slot.advance_if(AgentState::Working, AgentState::Waiting);
            bus.reply(&message, me, response);
            slot.advance_if(AgentState::Waiting, AgentState::Idle);
        }
        Err(error) => {
            warn!(agent = %slot.id, kind = message.kind.name(), %error, "agent handler failed");
            {
                let mut lifecycle = slot.lifecycle.lock();
                lifecycle.errors += 1;
                lifecycle.last_error = Some(error.to_string());
            }
            slot.transition(AgentState::Error);
            bus.reply(&message, me, Response::error(error.to_string()));
        }
    }
}
