use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use cortex_agents::reference::EthicsAgent;
use cortex_kernel::{Kernel, KernelBuilder};
use cortex_protocol::{KernelConfig, MessageKind, Priority, TaskRequest, TaskType};
use serde_json::json;
use tracing::{info, warn};

#[derive(Debug, Parser)]
#[command(name = "cortexd")]
#[command(about = "Cortex kernel daemon")]
struct Cli {
    /// JSON file with a `KernelConfig`. Flags below override it.
    #[arg(long)]
    config: Option<PathBuf>,
    #[arg(long)]
    energy: Option<f64>,
    #[arg(long)]
    dormancy_threshold: Option<f64>,
    #[arg(long)]
    health_check_interval_ms: Option<u64>,
    #[arg(long)]
    self_improve: bool,
    /// Goals containing this term are blocked by the ethics agent.
    #[arg(long = "block-term")]
    block_terms: Vec<String>,
    /// Goals containing this term are deferred to a human.
    #[arg(long = "defer-term")]
    defer_terms: Vec<String>,
    /// Submit a handful of demo tasks after start.
    #[arg(long)]
    demo: bool,
    #[arg(long, default_value = "info")]
    log_filter: String,
}

fn load_config(cli: &Cli) -> Result<KernelConfig> {
    let mut config = match &cli.config {
        Some(path) => read_config(path)?,
        None => KernelConfig::default(),
    };
    if let Some(energy) = cli.energy {
        config.energy = energy;
    }
    if let Some(threshold) = cli.dormancy_threshold {
        config.dormancy_threshold = threshold;
    }
    if let Some(interval) = cli.health_check_interval_ms {
        config.health_check_interval_ms = interval;
    }
    if cli.self_improve {
        config.enable_self_improvement = true;
    }
    Ok(config)
}

fn read_config(path: &Path) -> Result<KernelConfig> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read config {}", path.display()))?;
    KernelConfig::from_json(&raw).with_context(|| format!("invalid config {}", path.display()))
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::new(&cli.log_filter))
        .compact()
        .init();

    let config = load_config(&cli)?;
    let block_terms: Vec<&str> = cli.block_terms.iter().map(String::as_str).collect();
    let defer_terms: Vec<&str> = cli.defer_terms.iter().map(String::as_str).collect();
    let ethics = EthicsAgent::permissive()
        .with_blocked_terms(&block_terms)
        .with_deferred_terms(&defer_terms);

    let kernel = KernelBuilder::new()
        .config(config)
        .agent(Arc::new(ethics))
        .reference_agents(true)
        .build()?;

    kernel.on_state_change(|next, previous| {
        info!(from = %previous, to = %next, "kernel.state");
    });

    let mut events = kernel.bus().watch();
    let event_task = tokio::spawn(async move {
        while let Ok(message) = events.recv().await {
            if let MessageKind::Alert(alert) = &message.kind {
                let rendered = serde_json::to_string(alert).unwrap_or_else(|_| "{}".to_owned());
                info!(level = ?alert.level, alert = %rendered, "kernel.alert");
            }
        }
    });

    kernel.start().await?;
    let status = kernel.status();
    info!(
        state = %status.state,
        energy = status.energy,
        agents = status.agents.total,
        "cortexd running"
    );

    if cli.demo {
        run_demo(&kernel).await?;
    }

    if let Err(error) = tokio::signal::ctrl_c().await {
        warn!(%error, "failed to install Ctrl+C handler");
    }
    info!("shutting down");
    kernel.stop().await;

    event_task.abort();
    if let Err(error) = event_task.await
        && !error.is_cancelled()
    {
        warn!(%error, "event task stopped");
    }
    Ok(())
}

async fn run_demo(kernel: &Kernel) -> Result<()> {
    let requests = [
        TaskRequest::new(TaskType::Query, "current queue depth").with_priority(Priority::Critical),
        TaskRequest::new(TaskType::Research, "recent scheduler designs"),
        TaskRequest::new(TaskType::Build, "a status page")
            .with_priority(Priority::High)
            .with_context(json!({ "format": "html" })),
        TaskRequest::new(TaskType::Maintenance, "stale caches").with_priority(Priority::Low),
    ];
    let mut ids = Vec::with_capacity(requests.len());
    for request in requests {
        ids.push(kernel.submit(request.with_requester("cortexd-demo"))?);
    }
    for id in ids {
        let task = kernel.wait_for_task(&id, Duration::from_secs(30)).await?;
        info!(
            task_id = %task.id,
            status = %task.status(),
            error = task.error.as_deref().unwrap_or_default(),
            "demo task settled"
        );
    }
    let metrics = serde_json::to_string(&kernel.metrics())?;
    info!(%metrics, "demo finished; press Ctrl+C to stop");
    Ok(())
}
