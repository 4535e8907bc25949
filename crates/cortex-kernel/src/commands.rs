//! The kernel's own bus endpoint. External callers address `kernel` with
//! command messages and get a `Response` back.

use cortex_protocol::{Address, Message, MessageKind, Response};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::kernel::Kernel;

/// Subscribe to `Address::Kernel` now and serve commands on a spawned task.
pub(crate) fn spawn_endpoint(kernel: &Kernel) -> JoinHandle<()> {
    let mut subscription = kernel.bus().subscribe(&Address::Kernel);
    let mut shutdown = kernel.inner.shutdown.subscribe();
    let weak = kernel.downgrade();
    tokio::spawn(async move {
        loop {
            tokio::select! {
                message = subscription.recv() => {
                    let Some(message) = message else { break };
                    let Some(kernel) = Kernel::from_weak(&weak) else { break };
                    kernel.handle_command(message);
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
        debug!("command endpoint stopped");
    })
}

impl Kernel {
    fn handle_command(&self, message: Message) {
        if !message.kind.expects_reply() {
            return;
        }
        debug!(kind = message.kind.name(), from = %message.from, "kernel command");
        let response = match &message.kind {
            MessageKind::SubmitTask(request) => match self.submit(request.clone()) {
                Ok(task_id) => Response::TaskAccepted { task_id },
                Err(error) => Response::error(error.to_string()),
            },
            MessageKind::GetStatus => Response::Status {
                status: self.status(),
            },
            MessageKind::GetMetrics => Response::Metrics {
                metrics: self.metrics(),
            },
            MessageKind::GetTask { task_id } => Response::TaskSnapshot {
                task: self.task(task_id).map(Box::new),
            },
            MessageKind::SetEnergy { value } => {
                let state = self.set_energy(*value);
                Response::EnergySet {
                    energy: self.energy(),
                    state,
                }
            }
            MessageKind::Stop => {
                self.inner
                    .bus
                    .reply(&message, Address::Kernel, Response::Stopped);
                let kernel = self.clone();
                tokio::spawn(async move { kernel.stop().await });
                return;
            }
            other => {
                warn!(kind = other.name(), "kernel cannot handle this request");
                Response::error(format!("kernel does not handle {} requests", other.name()))
            }
        };
        self.inner.bus.reply(&message, Address::Kernel, response);
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use anyhow::Result;
    use cortex_protocol::{KernelConfig, KernelState, TaskRequest, TaskStatus, TaskType};

    use super::*;
    use crate::test_support::{TestKernel, kernel_with};

    const TIMEOUT: Duration = Duration::from_secs(2);

    #[tokio::test]
    async fn commands_round_trip_over_the_bus() -> Result<()> {
        let TestKernel { kernel, bus } = kernel_with(Vec::new(), KernelConfig::default())?;
        kernel.start().await?;
        let client = Address::external("cli");

        let accepted = bus
            .request(
                client.clone(),
                Address::Kernel,
                MessageKind::SubmitTask(TaskRequest::new(TaskType::Query, "uptime")),
                TIMEOUT,
            )
            .await?;
        let Response::TaskAccepted { task_id } = accepted else {
            panic!("unexpected reply {accepted:?}");
        };
        kernel.wait_for_task(&task_id, TIMEOUT).await?;

        let snapshot = bus
            .request(
                client.clone(),
                Address::Kernel,
                MessageKind::GetTask {
                    task_id: task_id.clone(),
                },
                TIMEOUT,
            )
            .await?;
        match snapshot {
            Response::TaskSnapshot { task: Some(task) } => {
                assert_eq!(task.id, task_id);
                assert_eq!(task.status(), TaskStatus::Completed);
            }
            other => panic!("unexpected reply {other:?}"),
        }

        let energy = bus
            .request(
                client.clone(),
                Address::Kernel,
                MessageKind::SetEnergy { value: 0.05 },
                TIMEOUT,
            )
            .await?;
        assert!(matches!(
            energy,
            Response::EnergySet {
                state: KernelState::Dormant,
                ..
            }
        ));

        let status = bus
            .request(client.clone(), Address::Kernel, MessageKind::GetStatus, TIMEOUT)
            .await?;
        match status {
            Response::Status { status } => {
                assert_eq!(status.state, KernelState::Dormant);
                assert_eq!(status.completed_tasks, 1);
            }
            other => panic!("unexpected reply {other:?}"),
        }
        kernel.stop().await;
        Ok(())
    }

    #[tokio::test]
    async fn stop_command_replies_then_stops() -> Result<()> {
        let TestKernel { kernel, .. } = kernel_with(Vec::new(), KernelConfig::default())?;
        kernel.start().await?;

        let reply = kernel
            .bus()
            .request(Address::external("ops"), Address::Kernel, MessageKind::Stop, TIMEOUT)
            .await?;
        assert!(matches!(reply, Response::Stopped));

        tokio::time::timeout(TIMEOUT, async {
            while kernel.is_running() {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await?;
        assert!(!kernel.is_running());
        Ok(())
    }

    #[tokio::test]
    async fn agent_requests_are_refused() -> Result<()> {
        let TestKernel { kernel, .. } = kernel_with(Vec::new(), KernelConfig::default())?;
        kernel.start().await?;
        let reply = kernel
            .bus()
            .request(
                Address::external("cli"),
                Address::Kernel,
                MessageKind::Narrate(cortex_protocol::NarrateRequest {
                    task_id: "t".into(),
                    goal: "g".to_owned(),
                    status: TaskStatus::Pending,
                    result: None,
                }),
                TIMEOUT,
            )
            .await?;
        assert!(matches!(reply, Response::Error { .. }));
        kernel.stop().await;
        Ok(())
    }
}
