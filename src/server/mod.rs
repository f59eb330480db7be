use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::http::{HeaderValue, Method, StatusCode};
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use tower_http::cors::CorsLayer;

use crate::core::gpu::GpuProbe;
use crate::core::manager::Manager;
use crate::core::session::SessionHost;
use crate::core::task::TaskCreate;
use crate::error::AppResult;

type SharedManager<G, S> = Arc<Manager<G, S>>;

pub fn router<G, S>(manager: SharedManager<G, S>, cors_origins: &[String]) -> Router
where
    G: GpuProbe + Send + Sync + 'static,
    S: SessionHost + Send + Sync + 'static,
{
    let cors = build_cors(cors_origins);

    Router::new()
        .route("/api/health", get(health))
        .route("/api/gpus", get(get_gpus::<G, S>))
        .route("/api/tasks", get(list_tasks::<G, S>).post(create_task::<G, S>))
        .route("/api/tasks/{id}", get(get_task::<G, S>))
        .route("/api/tasks/{id}/logs", get(get_task_logs::<G, S>))
        .route("/api/tasks/{id}/cancel", post(cancel_task::<G, S>))
        .layer(cors)
        .with_state(manager)
}

fn build_cors(origins: &[String]) -> CorsLayer {
    let origins: Vec<HeaderValue> = origins
        .iter()
        .filter_map(|origin| origin.parse().ok())
        .collect();
    CorsLayer::new()
        .allow_origin(origins)
        .allow_credentials(true)
        .allow_methods([Method::GET, Method::POST])
        .allow_headers([axum::http::header::CONTENT_TYPE])
}

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
}

async fn health() -> impl IntoResponse {
    Json(HealthResponse { status: "ok" })
}

async fn get_gpus<G, S>(State(manager): State<SharedManager<G, S>>) -> AppResult<impl IntoResponse>
where
    G: GpuProbe + Send + Sync + 'static,
    S: SessionHost + Send + Sync + 'static,
{
    let gpus = manager.get_gpu_status().await?;
    Ok(Json(gpus))
}

async fn list_tasks<G, S>(State(manager): State<SharedManager<G, S>>) -> AppResult<impl IntoResponse>
where
    G: GpuProbe + Send + Sync + 'static,
    S: SessionHost + Send + Sync + 'static,
{
    let tasks = manager.list_tasks()?;
    Ok(Json(tasks))
}

async fn create_task<G, S>(
    State(manager): State<SharedManager<G, S>>,
    Json(payload): Json<TaskCreate>,
) -> AppResult<impl IntoResponse>
where
    G: GpuProbe + Send + Sync + 'static,
    S: SessionHost + Send + Sync + 'static,
{
    let task = manager.create_task(payload).await?;
    Ok((StatusCode::CREATED, Json(task)))
}

async fn get_task<G, S>(
    State(manager): State<SharedManager<G, S>>,
    Path(id): Path<i64>,
) -> AppResult<impl IntoResponse>
where
    G: GpuProbe + Send + Sync + 'static,
    S: SessionHost + Send + Sync + 'static,
{
    let task = manager.get_task(id)?;
    Ok(Json(task))
}

#[derive(Deserialize)]
struct LogsQuery {
    tail: Option<usize>,
}

const DEFAULT_LOG_TAIL: usize = 100;

async fn get_task_logs<G, S>(
    State(manager): State<SharedManager<G, S>>,
    Path(id): Path<i64>,
    Query(query): Query<LogsQuery>,
) -> AppResult<impl IntoResponse>
where
    G: GpuProbe + Send + Sync + 'static,
    S: SessionHost + Send + Sync + 'static,
{
    let response = manager.get_task_logs(id, query.tail.unwrap_or(DEFAULT_LOG_TAIL))?;
    Ok(Json(response))
}

async fn cancel_task<G, S>(
    State(manager): State<SharedManager<G, S>>,
    Path(id): Path<i64>,
) -> AppResult<impl IntoResponse>
where
    G: GpuProbe + Send + Sync + 'static,
    S: SessionHost + Send + Sync + 'static,
{
    let task = manager.cancel_task(id)?;
    Ok(Json(task))
}
