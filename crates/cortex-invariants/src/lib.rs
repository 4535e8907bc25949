//! # cortex-invariants — system invariant checks
//!
//! An [`Invariant`] is a pure function from an [`InvariantContext`] snapshot
//! to an [`InvariantResult`]. The [`InvariantRegistry`] keeps checks in
//! registration order, lets [`ContextContributor`]s enrich each snapshot, and
//! keeps a bounded log of recent violations.
//!
//! Every registry carries the [`floor`] checks. External modules add their
//! own before the kernel starts; after that the registry is sealed.

pub mod floor;

use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use anyhow::{Result, bail};
use chrono::{DateTime, Utc};
use cortex_protocol::{InvariantContext, InvariantResult, KernelState, Severity};
use indexmap::IndexMap;
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use tracing::{debug, warn};

pub const DEFAULT_VIOLATION_LOG_CAPACITY: usize = 256;

pub trait Invariant: Send + Sync {
    fn id(&self) -> &str;

    fn name(&self) -> &str;

    fn severity(&self) -> Severity;

    fn check(&self, ctx: &InvariantContext) -> InvariantResult;
}

/// Fills in parts of the context before each check cycle (for example the
/// `merkle_valid` flag or entries in `extra`).
pub trait ContextContributor: Send + Sync {
    fn name(&self) -> &str;

    fn contribute(&self, ctx: &mut InvariantContext);
}

type CheckFn = dyn Fn(&InvariantContext) -> Result<(), String> + Send + Sync;

/// Closure-backed invariant built by [`InvariantRegistry::register_fn`].
struct FnInvariant {
    id: String,
    name: String,
    severity: Severity,
    check: Box<CheckFn>,
}

impl Invariant for FnInvariant {
    fn id(&self) -> &str {
        &self.id
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn severity(&self) -> Severity {
        self.severity
    }

    fn check(&self, ctx: &InvariantContext) -> InvariantResult {
        match (self.check)(ctx) {
            Ok(()) => InvariantResult::pass(&self.id, &self.name, self.severity),
            Err(message) => InvariantResult::violation(&self.id, &self.name, self.severity, message),
        }
    }
}

type ContributeFn = dyn Fn(&mut InvariantContext) + Send + Sync;

struct FnContributor {
    name: String,
    contribute: Box<ContributeFn>,
}

impl ContextContributor for FnContributor {
    fn name(&self) -> &str {
        &self.name
    }

    fn contribute(&self, ctx: &mut InvariantContext) {
        (self.contribute)(ctx)
    }
}

/// One logged violation together with the kernel situation it was seen in.
#[derive(Debug, Clone, Serialize)]
pub struct ViolationRecord {
    pub result: InvariantResult,
    pub state: KernelState,
    pub energy: f64,
    pub recorded_at: DateTime<Utc>,
}

struct RegistryInner {
    checks: RwLock<IndexMap<String, Arc<dyn Invariant>>>,
    contributors: RwLock<Vec<Arc<dyn ContextContributor>>>,
    log: Mutex<VecDeque<ViolationRecord>>,
    log_capacity: usize,
    sealed: AtomicBool,
}

#[derive(Clone)]
pub struct InvariantRegistry {
    inner: Arc<RegistryInner>,
}

impl std::fmt::Debug for InvariantRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InvariantRegistry")
            .field("checks", &self.ids())
            .field("sealed", &self.is_sealed())
            .finish()
    }
}

impl InvariantRegistry {
    /// A registry holding the floor checks.
    pub fn with_floor(min_responsive_agents: usize) -> Self {
        Self::with_capacity(min_responsive_agents, DEFAULT_VIOLATION_LOG_CAPACITY)
    }

    pub fn with_capacity(min_responsive_agents: usize, log_capacity: usize) -> Self {
        let mut checks: IndexMap<String, Arc<dyn Invariant>> = IndexMap::new();
        let floor: [Arc<dyn Invariant>; 4] = [
            Arc::new(floor::MinResponsiveAgents {
                min: min_responsive_agents,
            }),
            Arc::new(floor::EnergyPositive),
            Arc::new(floor::MerkleValid),
            Arc::new(floor::ConsistencyValid),
        ];
        for check in floor {
            checks.insert(check.id().to_owned(), check);
        }
        Self {
            inner: Arc::new(RegistryInner {
                checks: RwLock::new(checks),
                contributors: RwLock::new(Vec::new()),
                log: Mutex::new(VecDeque::new()),
                log_capacity,
                sealed: AtomicBool::new(false),
            }),
        }
    }

    pub fn register(&self, check: Arc<dyn Invariant>) -> Result<()> {
        self.ensure_open()?;
        let id = check.id().to_owned();
        let mut checks = self.inner.checks.write();
        if checks.contains_key(&id) {
            bail!("invariant '{id}' is already registered");
        }
        debug!(invariant = %id, severity = ?check.severity(), "invariant registered");
        checks.insert(id, check);
        Ok(())
    }

    /// Register a closure check. `Err(message)` marks a violation.
    pub fn register_fn<F>(
        &self,
        id: impl Into<String>,
        name: impl Into<String>,
        severity: Severity,
        check: F,
    ) -> Result<()>
    where
        F: Fn(&InvariantContext) -> Result<(), String> + Send + Sync + 'static,
    {
        self.register(Arc::new(FnInvariant {
            id: id.into(),
            name: name.into(),
            severity,
            check: Box::new(check),
        }))
    }

    pub fn register_contributor(&self, contributor: Arc<dyn ContextContributor>) -> Result<()> {
        self.ensure_open()?;
        debug!(contributor = contributor.name(), "context contributor registered");
        self.inner.contributors.write().push(contributor);
        Ok(())
    }

    pub fn register_contributor_fn<F>(&self, name: impl Into<String>, contribute: F) -> Result<()>
    where
        F: Fn(&mut InvariantContext) + Send + Sync + 'static,
    {
        self.register_contributor(Arc::new(FnContributor {
            name: name.into(),
            contribute: Box::new(contribute),
        }))
    }

    /// Close registration. Called by the kernel on start.
    pub fn seal(&self) {
        self.inner.sealed.store(true, Ordering::SeqCst);
    }

    pub fn is_sealed(&self) -> bool {
        self.inner.sealed.load(Ordering::SeqCst)
    }

    fn ensure_open(&self) -> Result<()> {
        if self.is_sealed() {
            bail!("invariant registry is sealed; register before the kernel starts");
        }
        Ok(())
    }

    pub fn ids(&self) -> Vec<String> {
        self.inner.checks.read().keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.inner.checks.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.checks.read().is_empty()
    }

    /// Let every contributor enrich `ctx`, in registration order.
    pub fn prepare(&self, mut ctx: InvariantContext) -> InvariantContext {
        let contributors: Vec<_> = self.inner.contributors.read().clone();
        for contributor in contributors {
            contributor.contribute(&mut ctx);
        }
        ctx
    }

    /// Run every check against `ctx` and log the violations.
    pub fn check_all(&self, ctx: &InvariantContext) -> Vec<InvariantResult> {
        let checks: Vec<_> = self.inner.checks.read().values().cloned().collect();
        let results: Vec<_> = checks.iter().map(|check| check.check(ctx)).collect();
        let now = Utc::now();
        for result in Self::violations(&results) {
            warn!(
                invariant = %result.id,
                severity = ?result.severity,
                message = result.message.as_deref().unwrap_or_default(),
                "invariant violated"
            );
            self.push_log(ViolationRecord {
                result: result.clone(),
                state: ctx.state,
                energy: ctx.energy,
                recorded_at: now,
            });
        }
        results
    }

    pub fn violations(results: &[InvariantResult]) -> Vec<&InvariantResult> {
        results.iter().filter(|result| !result.satisfied).collect()
    }

    pub fn critical_violations(results: &[InvariantResult]) -> Vec<&InvariantResult> {
        results
            .iter()
            .filter(|result| result.is_critical_violation())
            .collect()
    }

    fn push_log(&self, record: ViolationRecord) {
        if self.inner.log_capacity == 0 {
            return;
        }
        let mut log = self.inner.log.lock();
        if log.len() == self.inner.log_capacity {
            log.pop_front();
        }
        log.push_back(record);
    }

    /// Most recent `limit` violations, oldest first.
    pub fn violation_log(&self, limit: usize) -> Vec<ViolationRecord> {
        let log = self.inner.log.lock();
        let skip = log.len().saturating_sub(limit);
        log.iter().skip(skip).cloned().collect()
    }
}
