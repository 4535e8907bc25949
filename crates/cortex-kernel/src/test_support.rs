//! Scripted agents and kernel fixtures shared by the unit tests.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use cortex_agents::Agent;
use cortex_bus::MessageBus;
use cortex_protocol::{AgentRole, KernelConfig, MessageKind, Response};
use parking_lot::Mutex;

use crate::{Kernel, KernelBuilder};

type Handler = dyn Fn(&MessageKind) -> Result<Response> + Send + Sync;

/// Agent whose answers come from a closure. Records every request it sees.
pub(crate) struct FnAgent {
    role: AgentRole,
    handler: Box<Handler>,
    delay: Option<Duration>,
    requests: Mutex<Vec<MessageKind>>,
}

impl FnAgent {
    pub(crate) fn new<F>(role: AgentRole, handler: F) -> Self
    where
        F: Fn(&MessageKind) -> Result<Response> + Send + Sync + 'static,
    {
        Self {
            role,
            handler: Box::new(handler),
            delay: None,
            requests: Mutex::new(Vec::new()),
        }
    }

    /// Sleep before answering, to simulate a slow or unreachable agent.
    pub(crate) fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub(crate) fn requests(&self) -> Vec<MessageKind> {
        self.requests.lock().clone()
    }
}

#[async_trait]
impl Agent for FnAgent {
    fn role(&self) -> AgentRole {
        self.role
    }

    async fn handle(&self, request: &MessageKind) -> Result<Response> {
        self.requests.lock().push(request.clone());
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        (self.handler)(request)
    }
}

pub(crate) struct TestKernel {
    pub(crate) kernel: Kernel,
    /// The bus injected through the builder, shared with the kernel.
    pub(crate) bus: MessageBus,
}

/// Kernel with `overrides` registered first and reference agents for every
/// other role.
pub(crate) fn kernel_with(
    overrides: Vec<Arc<dyn Agent>>,
    config: KernelConfig,
) -> Result<TestKernel> {
    let bus = MessageBus::new();
    let kernel = KernelBuilder::new()
        .config(config)
        .bus(bus.clone())
        .agents(overrides)
        .reference_agents(true)
        .build()?;
    Ok(TestKernel { kernel, bus })
}
