use std::collections::HashMap;
use std::sync::{Arc, Weak};
use std::time::Duration;

use anyhow::{Result, bail};
use chrono::{DateTime, Utc};
use cortex_agents::AgentRegistry;
use cortex_bus::MessageBus;
use cortex_invariants::InvariantRegistry;
use cortex_protocol::{
    Address, Alert, AlertKind, AlertLevel, KernelConfig, KernelMetrics, KernelState,
    KernelStatus, Message, MessageKind, Task, TaskId, TaskRequest, TaskStatus, clamp_energy,
};
use indexmap::IndexMap;
use parking_lot::{Mutex, RwLock};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, instrument, warn};

use crate::ledger::TaskLedger;
use crate::scheduler::{QueuedTask, TaskQueue};

/// Topic every successful state transition is published on.
pub const STATE_TOPIC: &str = "kernel.state";

type StateListener = dyn Fn(KernelState, KernelState) + Send + Sync;

/// Mutable kernel fields shared by the drain loop, the monitor, the command
/// endpoint and API callers. Never held across an `.await`.
#[derive(Debug)]
pub(crate) struct KernelCore {
    pub(crate) state: KernelState,
    pub(crate) energy: f64,
    pub(crate) pending_dormancy: bool,
    pub(crate) started: bool,
    pub(crate) stopped: bool,
    pub(crate) started_at: Option<DateTime<Utc>>,
    pub(crate) queue: TaskQueue,
    /// Queued and in-flight tasks.
    pub(crate) tasks: HashMap<TaskId, Task>,
    pub(crate) active: Option<TaskId>,
    pub(crate) deferred: IndexMap<TaskId, Task>,
    pub(crate) metrics: KernelMetrics,
    pub(crate) finished_since_review: usize,
}

pub(crate) struct KernelInner {
    pub(crate) config: KernelConfig,
    pub(crate) bus: MessageBus,
    pub(crate) agents: AgentRegistry,
    pub(crate) invariants: InvariantRegistry,
    pub(crate) ledger: Arc<TaskLedger>,
    pub(crate) core: Mutex<KernelCore>,
    listeners: RwLock<Vec<Arc<StateListener>>>,
    pub(crate) drain_lock: tokio::sync::Mutex<()>,
    pub(crate) shutdown: watch::Sender<bool>,
    task_events: watch::Sender<u64>,
    background: Mutex<Vec<JoinHandle<()>>>,
}

/// Handle to one kernel instance. Cheap to clone.
#[derive(Clone)]
pub struct Kernel {
    pub(crate) inner: Arc<KernelInner>,
}

impl std::fmt::Debug for Kernel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Kernel")
            .field("state", &self.state())
            .field("energy", &self.energy())
            .finish()
    }
}

impl Kernel {
    pub(crate) fn from_parts(
        config: KernelConfig,
        bus: MessageBus,
        agents: AgentRegistry,
        invariants: InvariantRegistry,
        ledger: Arc<TaskLedger>,
    ) -> Self {
        let (shutdown, _) = watch::channel(false);
        let (task_events, _) = watch::channel(0);
        let energy = clamp_energy(config.energy);
        Self {
            inner: Arc::new(KernelInner {
                config,
                bus,
                agents,
                invariants,
                ledger,
                core: Mutex::new(KernelCore {
                    state: KernelState::Idle,
                    energy,
                    pending_dormancy: false,
                    started: false,
                    stopped: false,
                    started_at: None,
                    queue: TaskQueue::default(),
                    tasks: HashMap::new(),
                    active: None,
                    deferred: IndexMap::new(),
                    metrics: KernelMetrics::default(),
                    finished_since_review: 0,
                }),
                listeners: RwLock::new(Vec::new()),
                drain_lock: tokio::sync::Mutex::new(()),
                shutdown,
                task_events,
                background: Mutex::new(Vec::new()),
            }),
        }
    }

    pub(crate) fn from_weak(inner: &Weak<KernelInner>) -> Option<Self> {
        inner.upgrade().map(|inner| Self { inner })
    }

    pub(crate) fn downgrade(&self) -> Weak<KernelInner> {
        Arc::downgrade(&self.inner)
    }

    pub fn config(&self) -> &KernelConfig {
        &self.inner.config
    }

    pub fn bus(&self) -> &MessageBus {
        &self.inner.bus
    }

    pub fn agents(&self) -> &AgentRegistry {
        &self.inner.agents
    }

    /// Register checks and contributors here before `start`.
    pub fn invariants(&self) -> &InvariantRegistry {
        &self.inner.invariants
    }

    pub fn ledger(&self) -> &TaskLedger {
        &self.inner.ledger
    }

    // ---------------------------------------------------------------------
    // Lifecycle
    // ---------------------------------------------------------------------

    /// Seal the registries, start agent runners, the command endpoint and the
    /// health monitor, then begin draining anything already queued.
    #[instrument(skip(self))]
    pub async fn start(&self) -> Result<()> {
        {
            let core = self.inner.core.lock();
            if core.stopped {
                bail!("kernel was stopped and cannot be restarted");
            }
            if core.started {
                bail!("kernel already started");
            }
        }
        self.inner.invariants.seal();
        self.inner.agents.start(&self.inner.bus)?;

        let endpoint = crate::commands::spawn_endpoint(self);
        let monitor = crate::monitor::spawn_monitor(self);
        self.inner.background.lock().extend([endpoint, monitor]);

        let (energy, queued) = {
            let mut core = self.inner.core.lock();
            core.started = true;
            core.started_at = Some(Utc::now());
            (core.energy, core.queue.len())
        };
        info!(
            agents = self.inner.agents.len(),
            invariants = self.inner.invariants.len(),
            energy,
            queued,
            "kernel started"
        );

        if energy <= self.inner.config.dormancy_threshold {
            self.enter_dormancy_or_defer();
        } else {
            self.resume();
        }
        Ok(())
    }

    /// Cancel the monitor, cancel the in-flight and queued tasks, shut every
    /// agent down and force `idle`. A stopped kernel stays stopped.
    #[instrument(skip(self))]
    pub async fn stop(&self) {
        let cancelled_count = {
            let mut core = self.inner.core.lock();
            if core.stopped {
                return;
            }
            core.stopped = true;
            core.pending_dormancy = false;
            let mut ids: Vec<TaskId> = core.active.take().into_iter().collect();
            ids.extend(core.queue.drain().into_iter().map(|entry| entry.task_id));
            let mut cancelled = 0usize;
            for id in ids {
                let Some(mut task) = core.tasks.remove(&id) else {
                    continue;
                };
                if task.advance(TaskStatus::Cancelled).is_ok() {
                    core.metrics.tasks_cancelled += 1;
                }
                // Moves to the ledger under the same lock.
                if let Err(error) = self.inner.ledger.append(task) {
                    warn!(%error, "failed to record cancelled task");
                }
                cancelled += 1;
            }
            cancelled
        };

        let _ = self.inner.shutdown.send(true);
        let background: Vec<_> = self.inner.background.lock().drain(..).collect();
        for handle in background {
            handle.abort();
        }
        self.force_state(KernelState::Idle);
        self.inner.agents.shutdown_all().await;
        self.notify_task_change();
        info!(cancelled = cancelled_count, "kernel stopped");
    }

    pub fn is_running(&self) -> bool {
        let core = self.inner.core.lock();
        core.started && !core.stopped
    }

    pub(crate) fn is_stopping(&self) -> bool {
        self.inner.core.lock().stopped
    }

    // ---------------------------------------------------------------------
    // State machine
    // ---------------------------------------------------------------------

    pub fn state(&self) -> KernelState {
        self.inner.core.lock().state
    }

    /// Register a listener called with `(new, previous)` after every state
    /// change, in registration order.
    pub fn on_state_change<F>(&self, listener: F)
    where
        F: Fn(KernelState, KernelState) + Send + Sync + 'static,
    {
        self.inner.listeners.write().push(Arc::new(listener));
    }

    /// Attempt `current -> next`. Transitions outside the table, and
    /// `dormant -> idle` while energy is at or below the threshold, are
    /// rejected and leave the state unchanged.
    pub fn transition(&self, next: KernelState) -> bool {
        let previous = {
            let mut core = self.inner.core.lock();
            match self.transition_locked(&mut core, next) {
                Some(previous) => previous,
                None => return false,
            }
        };
        self.after_transition(previous, next);
        true
    }

    /// Table check and bookkeeping. Caller runs `after_transition` once the
    /// lock is released.
    pub(crate) fn transition_locked(
        &self,
        core: &mut KernelCore,
        next: KernelState,
    ) -> Option<KernelState> {
        let current = core.state;
        let energy_gate = current == KernelState::Dormant
            && next == KernelState::Idle
            && core.energy <= self.inner.config.dormancy_threshold;
        if !current.can_transition_to(next) || energy_gate {
            core.metrics.rejected_transitions += 1;
            debug!(from = %current, to = %next, "state transition rejected");
            return None;
        }
        core.state = next;
        core.metrics.state_transitions += 1;
        if next == KernelState::Dormant {
            core.metrics.dormancy_entries += 1;
            core.pending_dormancy = false;
        }
        Some(current)
    }

    /// Set the state without consulting the table. Used by recovery and stop.
    pub(crate) fn force_state(&self, next: KernelState) {
        let previous = {
            let mut core = self.inner.core.lock();
            let previous = core.state;
            if previous == next {
                return;
            }
            core.state = next;
            core.metrics.state_transitions += 1;
            previous
        };
        self.after_transition(previous, next);
    }

    pub(crate) fn after_transition(&self, previous: KernelState, next: KernelState) {
        debug!(from = %previous, to = %next, "state changed");
        if next == KernelState::Dormant {
            self.on_enter_dormant();
        } else if previous == KernelState::Dormant {
            self.on_leave_dormant();
        }

        let listeners: Vec<_> = self.inner.listeners.read().clone();
        for listener in listeners {
            listener(next, previous);
        }

        self.inner.bus.publish(
            STATE_TOPIC,
            Message::new(
                Address::Kernel,
                Address::Broadcast,
                MessageKind::StateChanged {
                    from: previous,
                    to: next,
                },
            ),
        );
    }

    fn on_enter_dormant(&self) {
        let agents = &self.inner.agents;
        for id in agents.ids() {
            if agents.role_of(&id).is_some_and(|role| role.is_essential()) {
                continue;
            }
            if let Err(error) = agents.sleep(&id) {
                debug!(agent = %id, %error, "agent not put to sleep");
            }
        }
        let energy = self.energy();
        let threshold = self.inner.config.dormancy_threshold;
        info!(energy, threshold, "kernel entering dormancy");
        self.alert(Alert::new(
            AlertLevel::Warning,
            AlertKind::Dormancy { energy, threshold },
            format!("energy {energy:.3} at or below threshold {threshold:.3}; entering dormancy"),
        ));
    }

    fn on_leave_dormant(&self) {
        let agents = &self.inner.agents;
        for id in agents.ids() {
            if let Err(error) = agents.wake(&id) {
                debug!(agent = %id, %error, "agent not woken");
            }
        }
        let energy = self.energy();
        info!(energy, "kernel waking from dormancy");
        self.alert(Alert::new(
            AlertLevel::Info,
            AlertKind::Wake { energy },
            format!("energy restored to {energy:.3}; leaving dormancy"),
        ));
    }

    pub(crate) fn alert(&self, alert: Alert) {
        self.inner
            .bus
            .broadcast(Address::Kernel, MessageKind::Alert(alert));
    }

    // ---------------------------------------------------------------------
    // Energy and dormancy
    // ---------------------------------------------------------------------

    pub fn energy(&self) -> f64 {
        self.inner.core.lock().energy
    }

    /// Clamp and store `value`. Crossing from above to at-or-below the
    /// dormancy threshold enters `dormant` (now if idle, otherwise on the next
    /// return to idle); rising above it while dormant wakes the kernel.
    #[instrument(skip(self))]
    pub fn set_energy(&self, value: f64) -> KernelState {
        enum Follow {
            Nothing,
            Sleep,
            Wake,
        }

        let value = clamp_energy(value);
        let threshold = self.inner.config.dormancy_threshold;
        let follow = {
            let mut core = self.inner.core.lock();
            let previous = core.energy;
            core.energy = value;
            if previous > threshold && value <= threshold {
                if core.state == KernelState::Idle {
                    Follow::Sleep
                } else {
                    core.pending_dormancy = true;
                    Follow::Nothing
                }
            } else if value > threshold {
                core.pending_dormancy = false;
                if core.state == KernelState::Dormant {
                    Follow::Wake
                } else {
                    Follow::Nothing
                }
            } else {
                Follow::Nothing
            }
        };

        match follow {
            Follow::Sleep => self.enter_dormancy_or_defer(),
            Follow::Wake => {
                if self.transition(KernelState::Idle) {
                    self.resume();
                }
            }
            Follow::Nothing => {}
        }
        self.state()
    }

    pub(crate) fn enter_dormancy_or_defer(&self) {
        if self.transition(KernelState::Dormant) {
            return;
        }
        let mut core = self.inner.core.lock();
        if core.energy <= self.inner.config.dormancy_threshold && core.state != KernelState::Dormant
        {
            core.pending_dormancy = true;
        }
    }

    /// Called whenever the kernel is back at `idle`: apply a deferred
    /// dormancy, otherwise keep draining.
    pub(crate) fn resume(&self) {
        let sleep = {
            let core = self.inner.core.lock();
            core.state == KernelState::Idle
                && core.pending_dormancy
                && core.energy <= self.inner.config.dormancy_threshold
        };
        if sleep {
            self.enter_dormancy_or_defer();
            return;
        }
        if self.has_runnable() {
            self.spawn_drain();
        }
    }

    // ---------------------------------------------------------------------
    // Tasks
    // ---------------------------------------------------------------------

    /// Queue a task. Draining starts right away when the kernel is started
    /// and idle.
    #[instrument(skip(self, request), fields(task_type = %request.task_type, priority = ?request.priority))]
    pub fn submit(&self, request: TaskRequest) -> Result<TaskId> {
        let task = Task::from_request(request);
        let task_id = task.id.clone();
        {
            let mut core = self.inner.core.lock();
            if core.stopped {
                bail!("kernel is stopped");
            }
            core.queue.push(task_id.clone(), task.priority);
            core.tasks.insert(task_id.clone(), task);
            core.metrics.tasks_submitted += 1;
        }
        debug!(task_id = %task_id, "task queued");
        self.notify_task_change();
        self.resume();
        Ok(task_id)
    }

    /// Look a task up among queued, in-flight, deferred and finished tasks.
    pub fn task(&self, id: &TaskId) -> Option<Task> {
        {
            let core = self.inner.core.lock();
            if let Some(task) = core.tasks.get(id).or_else(|| core.deferred.get(id)) {
                return Some(task.clone());
            }
        }
        self.inner.ledger.find(id)
    }

    /// Finished tasks, oldest first.
    pub fn history(&self, limit: usize) -> Vec<Task> {
        self.inner.ledger.recent(limit)
    }

    /// Queued tasks in dequeue order, then the in-flight task.
    pub fn pending_tasks(&self) -> Vec<Task> {
        let core = self.inner.core.lock();
        core.queue
            .task_ids()
            .iter()
            .chain(core.active.iter())
            .filter_map(|id| core.tasks.get(id).cloned())
            .collect()
    }

    pub fn deferred_tasks(&self) -> Vec<Task> {
        self.inner.core.lock().deferred.values().cloned().collect()
    }

    /// Put a deferred task back on the queue once a human has reviewed it.
    #[instrument(skip(self), fields(task_id = %id))]
    pub fn requeue_deferred(&self, id: &TaskId) -> Result<()> {
        {
            let mut core = self.inner.core.lock();
            if core.stopped {
                bail!("kernel is stopped");
            }
            if core.tasks.contains_key(id) {
                bail!("task {id} is still settling");
            }
            let Some(mut task) = core.deferred.shift_remove(id) else {
                bail!("task {id} is not deferred");
            };
            task.error = None;
            core.queue.push(task.id.clone(), task.priority);
            core.tasks.insert(task.id.clone(), task);
        }
        info!("deferred task requeued");
        self.notify_task_change();
        self.resume();
        Ok(())
    }

    /// Wait until `id` is finished or deferred.
    pub async fn wait_for_task(&self, id: &TaskId, timeout: Duration) -> Result<Task> {
        let mut events = self.inner.task_events.subscribe();
        let wait = async {
            loop {
                match self.settled(id) {
                    Some(Ok(task)) => return Ok(task),
                    Some(Err(error)) => return Err(error),
                    None => {}
                }
                if events.changed().await.is_err() {
                    bail!("kernel dropped while waiting for task {id}");
                }
            }
        };
        match tokio::time::timeout(timeout, wait).await {
            Ok(result) => result,
            Err(_) => bail!("task {id} did not settle within {}ms", timeout.as_millis()),
        }
    }

    fn settled(&self, id: &TaskId) -> Option<Result<Task>> {
        {
            let core = self.inner.core.lock();
            if core.tasks.contains_key(id) {
                return None;
            }
            if let Some(task) = core.deferred.get(id) {
                return Some(Ok(task.clone()));
            }
        }
        match self.inner.ledger.find(id) {
            Some(task) => Some(Ok(task)),
            None => Some(Err(anyhow::anyhow!("unknown task {id}"))),
        }
    }

    pub(crate) fn notify_task_change(&self) {
        self.inner.task_events.send_modify(|generation| *generation += 1);
    }

    // ---------------------------------------------------------------------
    // Status
    // ---------------------------------------------------------------------

    pub fn metrics(&self) -> KernelMetrics {
        self.inner.core.lock().metrics.clone()
    }

    pub fn status(&self) -> KernelStatus {
        let agents = self.inner.agents.counts();
        let core = self.inner.core.lock();
        let uptime_ms = core
            .started_at
            .map(|started| Utc::now().signed_duration_since(started).num_milliseconds())
            .and_then(|ms| u64::try_from(ms).ok())
            .unwrap_or(0);
        KernelStatus {
            state: core.state,
            energy: core.energy,
            dormancy_threshold: self.inner.config.dormancy_threshold,
            agents,
            queue_length: core.queue.len(),
            active_tasks: usize::from(core.active.is_some()),
            deferred_tasks: core.deferred.len(),
            completed_tasks: core.metrics.tasks_completed,
            failed_tasks: core.metrics.tasks_failed,
            uptime_ms,
            running: core.started && !core.stopped,
        }
    }

    // ---------------------------------------------------------------------
    // Draining
    // ---------------------------------------------------------------------

    pub(crate) fn has_runnable(&self) -> bool {
        let core = self.inner.core.lock();
        core.started && !core.stopped && core.state == KernelState::Idle && !core.queue.is_empty()
    }

    /// Pop the next task and move `idle -> sensing` under one lock, so a
    /// concurrent dormancy or self-improvement cycle cannot interleave.
    pub(crate) fn claim_next(&self) -> Option<QueuedTask> {
        let claimed = {
            let mut core = self.inner.core.lock();
            if !core.started || core.stopped || core.state != KernelState::Idle {
                return None;
            }
            let entry = core.queue.pop()?;
            if self
                .transition_locked(&mut core, KernelState::Sensing)
                .is_none()
            {
                core.queue.restore(entry);
                return None;
            }
            core.active = Some(entry.task_id.clone());
            entry
        };
        self.after_transition(KernelState::Idle, KernelState::Sensing);
        Some(claimed)
    }

    pub(crate) fn spawn_drain(&self) {
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            warn!("no tokio runtime available; queued tasks wait for the next drain");
            return;
        };
        let kernel = self.clone();
        runtime.spawn(async move { kernel.drain().await });
    }

    /// Run queued tasks one at a time until the queue is empty or the kernel
    /// leaves `idle` for anything but a task.
    pub(crate) async fn drain(&self) {
        loop {
            let Ok(guard) = self.inner.drain_lock.try_lock() else {
                return;
            };
            while let Some(entry) = self.claim_next() {
                self.run_task(entry).await;
            }
            drop(guard);
            // A submit may have raced the release of the drain lock.
            if !self.has_runnable() {
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{TestKernel, kernel_with};
    use cortex_protocol::{Priority, TaskType};

    #[tokio::test]
    async fn rejected_transition_leaves_state_unchanged() -> Result<()> {
        let TestKernel { kernel, .. } = kernel_with(Vec::new(), KernelConfig::default())?;
        let before = kernel.metrics().rejected_transitions;

        assert!(!kernel.transition(KernelState::Acting));
        assert_eq!(kernel.state(), KernelState::Idle);
        assert!(!kernel.transition(KernelState::Idle));
        assert_eq!(kernel.metrics().rejected_transitions, before + 2);

        assert!(kernel.transition(KernelState::Sensing));
        assert!(!kernel.transition(KernelState::Reflecting));
        assert_eq!(kernel.state(), KernelState::Sensing);
        Ok(())
    }

    #[tokio::test]
    async fn every_transition_outside_the_table_is_rejected() -> Result<()> {
        let TestKernel { kernel, .. } = kernel_with(Vec::new(), KernelConfig::default())?;
        for from in KernelState::ALL {
            for to in KernelState::ALL {
                kernel.force_state(from);
                let accepted = kernel.transition(to);
                assert_eq!(accepted, from.can_transition_to(to), "{from} -> {to}");
                assert_eq!(kernel.state(), if accepted { to } else { from });
            }
        }
        Ok(())
    }

    #[tokio::test]
    async fn listeners_fire_in_order_after_update() -> Result<()> {
        let TestKernel { kernel, .. } = kernel_with(Vec::new(), KernelConfig::default())?;
        let seen = Arc::new(Mutex::new(Vec::new()));

        let probe = kernel.clone();
        let first = seen.clone();
        kernel.on_state_change(move |next, previous| {
            assert_eq!(probe.state(), next);
            first.lock().push(("first", next, previous));
        });
        let second = seen.clone();
        kernel.on_state_change(move |next, previous| {
            second.lock().push(("second", next, previous));
        });

        assert!(kernel.transition(KernelState::Sensing));
        assert!(!kernel.transition(KernelState::Dormant));
        assert_eq!(
            *seen.lock(),
            vec![
                ("first", KernelState::Sensing, KernelState::Idle),
                ("second", KernelState::Sensing, KernelState::Idle),
            ]
        );
        Ok(())
    }

    #[tokio::test]
    async fn transitions_are_published_on_state_topic() -> Result<()> {
        let TestKernel { kernel, bus } = kernel_with(Vec::new(), KernelConfig::default())?;
        let mut observer = bus.subscribe_topic(STATE_TOPIC);
        assert!(kernel.transition(KernelState::Sensing));

        let message = observer.try_recv().expect("state change published");
        assert!(matches!(
            message.kind,
            MessageKind::StateChanged {
                from: KernelState::Idle,
                to: KernelState::Sensing
            }
        ));
        Ok(())
    }

    #[tokio::test]
    async fn energy_is_clamped() -> Result<()> {
        let TestKernel { kernel, .. } = kernel_with(Vec::new(), KernelConfig::default())?;
        kernel.set_energy(7.5);
        assert_eq!(kernel.energy(), 1.0);
        kernel.set_energy(f64::NAN);
        assert_eq!(kernel.energy(), 0.0);
        kernel.set_energy(0.5);
        kernel.set_energy(-2.0);
        assert_eq!(kernel.energy(), 0.0);
        Ok(())
    }

    #[tokio::test]
    async fn low_energy_enters_dormancy_once_and_recovers() -> Result<()> {
        let config = KernelConfig {
            dormancy_threshold: 0.1,
            ..KernelConfig::default()
        };
        let TestKernel { kernel, .. } = kernel_with(Vec::new(), config)?;
        kernel.start().await?;

        assert_eq!(kernel.set_energy(0.05), KernelState::Dormant);
        kernel.set_energy(0.05);
        kernel.set_energy(0.02);
        assert_eq!(kernel.metrics().dormancy_entries, 1);

        let counts = kernel.agents().counts();
        assert_eq!(counts.healthy, 2, "only sensor and memory stay awake");

        assert_eq!(kernel.set_energy(0.5), KernelState::Idle);
        assert_eq!(kernel.agents().counts().sleeping, 0);

        kernel.set_energy(0.1);
        assert_eq!(kernel.state(), KernelState::Dormant);
        assert_eq!(kernel.metrics().dormancy_entries, 2);
        kernel.stop().await;
        Ok(())
    }

    #[tokio::test]
    async fn dormancy_waits_for_idle() -> Result<()> {
        let TestKernel { kernel, .. } = kernel_with(Vec::new(), KernelConfig::default())?;
        assert!(kernel.transition(KernelState::Sensing));
        kernel.set_energy(0.05);
        assert_eq!(kernel.state(), KernelState::Sensing);

        assert!(kernel.transition(KernelState::Idle));
        kernel.resume();
        assert_eq!(kernel.state(), KernelState::Dormant);
        assert_eq!(kernel.metrics().dormancy_entries, 1);
        Ok(())
    }

    #[tokio::test]
    async fn dormant_kernel_holds_tasks_until_woken() -> Result<()> {
        let TestKernel { kernel, .. } = kernel_with(Vec::new(), KernelConfig::default())?;
        kernel.start().await?;
        kernel.set_energy(0.0);

        let id = kernel.submit(TaskRequest::new(TaskType::Query, "wait for energy"))?;
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(kernel.status().queue_length, 1);
        assert_eq!(kernel.task(&id).map(|task| task.status()), Some(TaskStatus::Pending));

        kernel.set_energy(0.9);
        let task = kernel.wait_for_task(&id, Duration::from_secs(5)).await?;
        assert_eq!(task.status(), TaskStatus::Completed);
        kernel.stop().await;
        Ok(())
    }

    #[tokio::test]
    async fn stop_cancels_queue_and_blocks_restart() -> Result<()> {
        let TestKernel { kernel, .. } = kernel_with(Vec::new(), KernelConfig::default())?;
        let queued = kernel.submit(
            TaskRequest::new(TaskType::Build, "never runs").with_priority(Priority::High),
        )?;
        kernel.stop().await;

        let task = kernel.task(&queued).expect("cancelled task is kept");
        assert_eq!(task.status(), TaskStatus::Cancelled);
        assert_eq!(kernel.state(), KernelState::Idle);
        assert!(!kernel.is_running());
        assert!(kernel.start().await.is_err());
        assert!(kernel.submit(TaskRequest::new(TaskType::Query, "late")).is_err());
        assert_eq!(kernel.metrics().tasks_cancelled, 1);
        Ok(())
    }
}
