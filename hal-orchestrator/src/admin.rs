//! Admin/health HTTP surface (spec.md §4.H admin API). Grounded on the
//! teacher's `/` and `/admin/status` routes in `main.rs`, rebuilt on
//! `axum::Router` with the same `tower_http::cors`/`trace` layering.

use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Json, Router};
use hal_common::{TaskStatus, VmStatus};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::Arc;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use uuid::Uuid;

use crate::orchestrator::Orchestrator;
use crate::pool::VmPoolManager;
use crate::store::Store;
use crate::task_manager::{NewTask, TaskManager};

pub struct AppState {
    pub store: Arc<Store>,
    pub pool: Arc<VmPoolManager>,
    pub tasks: Arc<TaskManager>,
    pub orchestrator: Arc<Orchestrator>,
}

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/admin/status", get(status))
        .route("/admin/reconcile", post(reconcile))
        .route("/tasks", post(create_task))
        .route("/tasks/:id", get(get_task))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

async fn healthz() -> impl axum::response::IntoResponse {
    Json(json!({"status": "ok"}))
}

/// spec.md §6 admin status: counts by VM status, counts by task status,
/// and per-slot capacity usage (used vs. `max_pool_size`) — not just
/// flat totals.
async fn status(State(state): State<Arc<AppState>>) -> impl axum::response::IntoResponse {
    let vms = state.store.list_vms().await.unwrap_or_default();
    let images = state.store.list_images().await.unwrap_or_default();

    let mut vms_by_status = serde_json::Map::new();
    for s in [
        VmStatus::Provisioning,
        VmStatus::Ready,
        VmStatus::Assigned,
        VmStatus::Destroying,
        VmStatus::Destroyed,
        VmStatus::Error,
    ] {
        let n = vms.iter().filter(|v| v.status == s).count();
        vms_by_status.insert(s.as_str().to_string(), json!(n));
    }

    let mut tasks_by_status = serde_json::Map::new();
    for s in [
        TaskStatus::Pending,
        TaskStatus::Assigned,
        TaskStatus::Running,
        TaskStatus::Completed,
        TaskStatus::Failed,
    ] {
        let n = state.store.list_tasks_by_status(s).await.unwrap_or_default().len();
        tasks_by_status.insert(s.as_str().to_string(), json!(n));
    }

    let slots: Vec<_> = state
        .pool
        .slots()
        .iter()
        .map(|slot| {
            let used = vms
                .iter()
                .filter(|v| v.provider == slot.name && v.status.counts_against_capacity())
                .count();
            json!({
                "slot": slot.name,
                "used": used,
                "max_pool_size": slot.max_pool_size,
            })
        })
        .collect();

    Json(json!({
        "vms_by_status": vms_by_status,
        "tasks_by_status": tasks_by_status,
        "images": images.len(),
        "slots": slots,
    }))
}

async fn reconcile(State(state): State<Arc<AppState>>) -> impl axum::response::IntoResponse {
    match state.pool.reconcile().await {
        Ok(report) => (
            StatusCode::OK,
            Json(json!({"updated": report.updated, "destroyed": report.destroyed})),
        ),
        Err(e) => (StatusCode::INTERNAL_SERVER_ERROR, Json(json!({"error": e.to_string()}))),
    }
}

#[derive(Debug, Deserialize)]
struct CreateTaskRequest {
    repo_url: String,
    context: String,
    agent: String,
    branch: Option<String>,
}

#[derive(Debug, Serialize)]
struct TaskResponse {
    id: Uuid,
    slug: String,
    status: String,
}

async fn create_task(
    State(state): State<Arc<AppState>>,
    Json(req): Json<CreateTaskRequest>,
) -> impl axum::response::IntoResponse {
    let result = state
        .orchestrator
        .start_task(NewTask {
            repo_url: req.repo_url,
            context: req.context,
            agent: req.agent,
            branch: req.branch,
        })
        .await;

    match result {
        Ok(task) => (
            StatusCode::CREATED,
            Json(json!(TaskResponse { id: task.id, slug: task.slug, status: task.status.to_string() })),
        ),
        Err(e) => (StatusCode::BAD_REQUEST, Json(json!({"error": e.to_string()}))),
    }
}

async fn get_task(
    State(state): State<Arc<AppState>>,
    axum::extract::Path(id): axum::extract::Path<Uuid>,
) -> impl axum::response::IntoResponse {
    match state.tasks.get(id).await {
        Ok(task) => (StatusCode::OK, Json(json!(task))),
        Err(e) => (StatusCode::NOT_FOUND, Json(json!({"error": e.to_string()}))),
    }
}
