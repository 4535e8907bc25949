//! # cortex-protocol — shared contract types
//!
//! Every other Cortex crate speaks in these types: the bus moves
//! [`Message`]s, agents answer [`MessageKind`] requests with [`Response`]s,
//! and the kernel drives [`Task`]s through the [`KernelState`] machine.
//!
//! The crate carries no runtime dependencies (no tokio, no axum) so it can be
//! used as a pure contract crate by external agents and clients.
//!
//! ## Module Overview
//!
//! - [`ids`]: typed id wrappers (TaskId, AgentId, CorrelationId, ...)
//! - [`agent`]: AgentRole, AgentState, AgentHealth
//! - [`task`]: TaskRequest, Task, TaskPlan, TaskStep, Priority
//! - [`kernel`]: KernelState transition table, status, metrics, alerts
//! - [`message`]: Address, Message, MessageKind, Response
//! - [`invariant`]: InvariantContext, InvariantResult, Severity
//! - [`config`]: KernelConfig
//! - [`error`]: ProtocolError, BusError

pub mod agent;
pub mod config;
pub mod error;
pub mod ids;
pub mod invariant;
pub mod kernel;
pub mod message;
pub mod task;

pub use agent::{AgentHealth, AgentRole, AgentState};
pub use config::{KernelConfig, clamp_energy};
pub use error::{BusError, ProtocolError, ProtocolResult};
pub use ids::{AgentId, CorrelationId, MessageId, PlanId, StepId, TaskId};
pub use invariant::{InvariantContext, InvariantResult, Severity};
pub use kernel::{
    AgentCounts, Alert, AlertKind, AlertLevel, KernelMetrics, KernelState, KernelStatus,
};
pub use message::{
    Address, CritiqueRequest, EthicalCheckRequest, EthicalVerdict, ExecuteRequest,
    ImprovementReviewRequest, Message, MessageKind, NarrateRequest, PlanRequest, Response,
    SenseRequest, StepSummary,
};
pub use task::{
    PlanStatus, PlannedStep, Priority, StepKind, StepStatus, Task, TaskPlan, TaskRequest,
    TaskStatus, TaskStep, TaskType,
};
