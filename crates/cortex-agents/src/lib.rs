//! # cortex-agents — agent contract and lifecycle
//!
//! An [`Agent`] is a worker with one capability [`AgentRole`]. The
//! [`AgentRegistry`] owns every agent for the lifetime of the process, runs
//! one bus runner per agent and tracks its lifecycle state.
//!
//! [`reference`] holds small deterministic agents for each role, used by the
//! daemon and by tests.

pub mod reference;
pub mod registry;

use anyhow::Result;
use async_trait::async_trait;
use cortex_protocol::{AgentRole, MessageKind, Response};

pub use registry::{AgentRegistry, AgentSnapshot};

/// A capability worker. `handle` receives one request at a time; an `Err`
/// puts the agent into the `error` state until it is restarted.
#[async_trait]
pub trait Agent: Send + Sync {
    fn role(&self) -> AgentRole;

    async fn handle(&self, request: &MessageKind) -> Result<Response>;
}
