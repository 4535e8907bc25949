use std::convert::Infallible;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use async_stream::stream;
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use clap::Parser;
use cortex_kernel::{Kernel, KernelBuilder};
use cortex_protocol::{KernelConfig, Message, MessageKind, TaskId, TaskRequest};
use futures_util::Stream;
use serde::Deserialize;
use serde_json::json;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::info;

#[derive(Debug, Parser)]
#[command(name = "cortex-api")]
#[command(about = "Cortex kernel control-plane API")]
struct Cli {
    #[arg(long, default_value = "127.0.0.1:8788")]
    listen: SocketAddr,
    /// JSON file with a `KernelConfig`.
    #[arg(long)]
    config: Option<PathBuf>,
}

#[derive(Clone)]
struct AppState {
    kernel: Kernel,
}

#[derive(Debug, Deserialize)]
struct ListQuery {
    limit: Option<usize>,
}

#[derive(Debug, Deserialize)]
struct EventQuery {
    /// Only forward messages whose kind matches, e.g. `alert`.
    kind: Option<String>,
}

#[derive(Debug, Deserialize)]
struct EnergyRequest {
    value: f64,
}

#[derive(Debug)]
struct ApiError {
    status: StatusCode,
    message: String,
}

impl ApiError {
    fn bad_request(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            message: message.into(),
        }
    }

    fn not_found(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::NOT_FOUND,
            message: message.into(),
        }
    }

    fn unavailable(error: impl std::fmt::Display) -> Self {
        Self {
            status: StatusCode::SERVICE_UNAVAILABLE,
            message: error.to_string(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status, Json(json!({ "error": self.message }))).into_response()
    }
}

type ApiResult<T> = Result<T, ApiError>;

fn load_config(path: Option<&PathBuf>) -> Result<KernelConfig> {
    let Some(path) = path else {
        return Ok(KernelConfig::default());
    };
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read config {}", path.display()))?;
    KernelConfig::from_json(&raw).with_context(|| format!("invalid config {}", path.display()))
}

fn router(state: AppState) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/tasks", post(submit_task).get(list_tasks))
        .route("/tasks/{task_id}", get(get_task))
        .route("/deferred/{task_id}/requeue", post(requeue_task))
        .route("/status", get(status))
        .route("/metrics", get(metrics))
        .route("/energy", post(set_energy))
        .route("/events", get(stream_events))
        .with_state(state)
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .json()
        .init();

    let cli = Cli::parse();
    let config = load_config(cli.config.as_ref())?;
    let kernel = KernelBuilder::new()
        .config(config)
        .reference_agents(true)
        .build()?;
    kernel.start().await?;

    let app = router(AppState {
        kernel: kernel.clone(),
    });

    let listener = tokio::net::TcpListener::bind(cli.listen).await?;
    info!(listen = %cli.listen, "cortex-api listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    kernel.stop().await;
    Ok(())
}

async fn healthz(State(state): State<AppState>) -> Json<serde_json::Value> {
    Json(json!({
        "status": "ok",
        "service": "cortex-api",
        "kernel_state": state.kernel.state(),
    }))
}

async fn submit_task(
    State(state): State<AppState>,
    Json(request): Json<TaskRequest>,
) -> ApiResult<(StatusCode, Json<serde_json::Value>)> {
    if request.goal.trim().is_empty() {
        return Err(ApiError::bad_request("goal must not be empty"));
    }
    let task_id = state
        .kernel
        .submit(request)
        .map_err(ApiError::unavailable)?;
    Ok((StatusCode::ACCEPTED, Json(json!({ "task_id": task_id }))))
}

async fn list_tasks(
    State(state): State<AppState>,
    Query(query): Query<ListQuery>,
) -> Json<serde_json::Value> {
    let limit = query.limit.unwrap_or(50).clamp(1, 1000);
    Json(json!({
        "pending": state.kernel.pending_tasks(),
        "deferred": state.kernel.deferred_tasks(),
        "history": state.kernel.history(limit),
    }))
}

async fn get_task(
    Path(task_id): Path<String>,
    State(state): State<AppState>,
) -> ApiResult<Json<serde_json::Value>> {
    let task_id = TaskId::from(task_id);
    let task = state
        .kernel
        .task(&task_id)
        .ok_or_else(|| ApiError::not_found(format!("task not found: {task_id}")))?;
    Ok(Json(json!(task)))
}

async fn requeue_task(
    Path(task_id): Path<String>,
    State(state): State<AppState>,
) -> ApiResult<Json<serde_json::Value>> {
    let task_id = TaskId::from(task_id);
    state
        .kernel
        .requeue_deferred(&task_id)
        .map_err(|error| ApiError::bad_request(error.to_string()))?;
    Ok(Json(json!({ "task_id": task_id, "requeued": true })))
}

async fn status(State(state): State<AppState>) -> Json<serde_json::Value> {
    Json(json!(state.kernel.status()))
}

async fn metrics(State(state): State<AppState>) -> Json<serde_json::Value> {
    Json(json!(state.kernel.metrics()))
}

async fn set_energy(
    State(state): State<AppState>,
    Json(request): Json<EnergyRequest>,
) -> ApiResult<Json<serde_json::Value>> {
    if !request.value.is_finite() {
        return Err(ApiError::bad_request("energy must be a finite number"));
    }
    let kernel_state = state.kernel.set_energy(request.value);
    Ok(Json(json!({
        "energy": state.kernel.energy(),
        "state": kernel_state,
    })))
}

async fn stream_events(
    State(state): State<AppState>,
    Query(query): Query<EventQuery>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let mut subscription = state.kernel.bus().watch();
    let stream = stream! {
        loop {
            match subscription.recv().await {
                Ok(message) => {
                    if query.kind.as_deref().is_some_and(|kind| kind != message.kind.name()) {
                        continue;
                    }
                    yield Ok(as_sse_event(&message));
                }
                Err(tokio::sync::broadcast::error::RecvError::Lagged(skipped)) => {
                    let lag_payload = json!({ "skipped": skipped }).to_string();
                    yield Ok(Event::default().event("stream.lagged").data(lag_payload));
                }
                Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
            }
        }
    };

    Sse::new(stream).keep_alive(
        KeepAlive::new()
            .interval(Duration::from_secs(15))
            .text("keep-alive"),
    )
}

fn as_sse_event(message: &Message) -> Event {
    let event_name = match &message.kind {
        MessageKind::Alert(_) => "kernel.alert",
        MessageKind::StateChanged { .. } => "kernel.state",
        MessageKind::Response(_) => "bus.response",
        _ => "bus.message",
    };
    let payload = serde_json::to_string(message).unwrap_or_else(|_| "{}".to_owned());
    Event::default()
        .id(message.id.to_string())
        .event(event_name)
        .data(payload)
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(error) = tokio::signal::ctrl_c().await {
            tracing::error!(%error, "failed to install Ctrl+C handler");
        }
    };

    #[cfg(unix)]
    {
        let terminate = async {
            match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
                Ok(mut signal) => {
                    signal.recv().await;
                }
                Err(error) => {
                    tracing::error!(%error, "failed to install SIGTERM handler");
                }
            }
        };

        tokio::select! {
            _ = ctrl_c => {},
            _ = terminate => {},
        }
    }

    #[cfg(not(unix))]
    {
        ctrl_c.await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cortex_protocol::{KernelState, TaskType};

    async fn test_state() -> Result<AppState> {
        let kernel = KernelBuilder::new().reference_agents(true).build()?;
        kernel.start().await?;
        Ok(AppState { kernel })
    }

    #[tokio::test]
    async fn unknown_task_is_not_found() -> Result<()> {
        let state = test_state().await?;
        let result = get_task(Path("missing".to_owned()), State(state.clone())).await;
        let error = result.err().expect("missing task");
        assert_eq!(error.status, StatusCode::NOT_FOUND);
        state.kernel.stop().await;
        Ok(())
    }

    #[tokio::test]
    async fn submitted_task_is_queryable() -> Result<()> {
        let state = test_state().await?;
        let (code, Json(body)) = submit_task(
            State(state.clone()),
            Json(TaskRequest::new(TaskType::Query, "disk usage")),
        )
        .await
        .map_err(|error| anyhow::anyhow!(error.message))?;
        assert_eq!(code, StatusCode::ACCEPTED);

        let task_id = body["task_id"].as_str().unwrap_or_default().to_owned();
        state
            .kernel
            .wait_for_task(&TaskId::from(task_id.clone()), Duration::from_secs(5))
            .await?;
        let Json(task) = get_task(Path(task_id), State(state.clone()))
            .await
            .map_err(|error| anyhow::anyhow!(error.message))?;
        assert_eq!(task["status"], "completed");
        state.kernel.stop().await;
        Ok(())
    }

    #[tokio::test]
    async fn empty_goal_and_non_finite_energy_are_rejected() -> Result<()> {
        let state = test_state().await?;
        let empty = submit_task(
            State(state.clone()),
            Json(TaskRequest::new(TaskType::Query, "  ")),
        )
        .await;
        assert!(empty.is_err());

        let energy = set_energy(State(state.clone()), Json(EnergyRequest { value: f64::NAN })).await;
        assert!(energy.is_err());

        let Json(body) = set_energy(State(state.clone()), Json(EnergyRequest { value: 0.0 }))
            .await
            .map_err(|error| anyhow::anyhow!(error.message))?;
        assert_eq!(body["state"], json!(KernelState::Dormant));
        state.kernel.stop().await;
        Ok(())
    }
}
