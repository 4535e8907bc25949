//! # cortex-kernel — the supervisor
//!
//! The [`Kernel`] does no cognitive work. It queues submitted tasks, drives
//! each one through `sensing -> thinking -> deciding -> acting -> reflecting`
//! by sending typed requests to agents over the [`MessageBus`], and keeps a
//! state machine, an energy budget and a set of invariants in check while it
//! does.
//!
//! ```no_run
//! # async fn demo() -> anyhow::Result<()> {
//! use cortex_kernel::KernelBuilder;
//! use cortex_protocol::{Priority, TaskRequest, TaskType};
//!
//! let kernel = KernelBuilder::new().reference_agents(true).build()?;
//! kernel.start().await?;
//! let id = kernel.submit(
//!     TaskRequest::new(TaskType::Query, "summarise the logs").with_priority(Priority::High),
//! )?;
//! let task = kernel
//!     .wait_for_task(&id, std::time::Duration::from_secs(10))
//!     .await?;
//! println!("{:?}", task.status());
//! kernel.stop().await;
//! # Ok(())
//! # }
//! ```
//!
//! Besides the state machine in [`kernel`], the crate holds the priority
//! queue ([`scheduler`]), plan construction and capability routing
//! ([`planner`]), the hash-chained task history ([`ledger`]) and the health
//! monitor ([`monitor`]).
//!
//! [`MessageBus`]: cortex_bus::MessageBus

mod builder;
mod commands;
mod executor;
pub mod kernel;
pub mod ledger;
pub mod monitor;
pub mod planner;
pub mod scheduler;

#[cfg(test)]
mod test_support;

pub use builder::KernelBuilder;
pub use kernel::{Kernel, STATE_TOPIC};
pub use ledger::{LedgerContributor, LedgerEntry, TaskLedger};
pub use monitor::HealthReport;
pub use scheduler::{QueuedTask, TaskQueue};
