//! Error types shared across the Cortex crates.

use std::time::Duration;

use thiserror::Error;

use crate::ids::CorrelationId;
use crate::kernel::KernelState;
use crate::task::TaskStatus;

/// Contract violations detected by the protocol types themselves.
#[derive(Debug, Error, PartialEq)]
pub enum ProtocolError {
    #[error("invalid task status transition: {from} -> {to}")]
    InvalidTaskTransition { from: TaskStatus, to: TaskStatus },
    #[error("invalid kernel state transition: {from} -> {to}")]
    InvalidStateTransition { from: KernelState, to: KernelState },
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
}

/// Failure of a bus request. Callers map each variant onto a fallback.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum BusError {
    #[error("request {correlation_id} timed out after {}ms", timeout.as_millis())]
    Timeout {
        correlation_id: CorrelationId,
        timeout: Duration,
    },
    #[error("endpoint unavailable: {0}")]
    Unavailable(String),
}

impl BusError {
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout { .. })
    }
}

pub type ProtocolResult<T> = Result<T, ProtocolError>;
