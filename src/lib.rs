// src/lib.rs

use std::sync::Arc;

use axum::routing::{get, patch, post};
use axum::Router;
use sqlx::{Pool, Postgres};
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

pub mod cli;
pub mod config;
pub mod db;
pub mod error;
pub mod models;
pub mod routes;
pub mod scheduler;
pub mod services;
pub mod telemetry;

use config::AppConfig;
use scheduler::TaskStats;
use services::notify::Notifier;

#[derive(Clone)]
pub struct AppState {
    pub pool: Pool<Postgres>,
    pub config: Arc<AppConfig>,
    pub notifier: Arc<dyn Notifier>,
    pub task_stats: TaskStats,
}

pub fn router(state: AppState) -> Router {
    // The gateway in front of us owns authentication; CORS stays permissive.
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let api = Router::new()
        .route("/health", get(routes::health::health))
        // reports
        .route("/api/v1/reports", get(routes::reports::list_reports))
        .route("/api/v1/reports/operator", post(routes::reports::submit_operator))
        .route("/api/v1/reports/smt", post(routes::reports::submit_smt))
        .route("/api/v1/reports/manager", post(routes::reports::submit_manager))
        .route("/api/v1/reports/onsite/start", post(routes::reports::start_onsite))
        .route(
            "/api/v1/reports/onsite/:session_id/stop",
            post(routes::reports::stop_onsite),
        )
        .route(
            "/api/v1/reports/:id",
            patch(routes::reports::patch_report).delete(routes::reports::delete_report),
        )
        .route("/api/v1/reports/:id/approval", post(routes::reports::decide_report))
        // work-orders
        .route(
            "/api/v1/workorders/:id/cumulative",
            get(routes::workorders::get_cumulative),
        )
        .route(
            "/api/v1/workorders/:id/processes/:process_id/recompute",
            post(routes::workorders::recompute_process),
        )
        .route(
            "/api/v1/workorders/:id/manual-completion",
            post(routes::workorders::set_manual_completion),
        )
        .route("/api/v1/workorders/:id/reconcile", post(routes::workorders::reconcile))
        .route(
            "/api/v1/workorders/:id/revert-completion",
            post(routes::workorders::revert_completion),
        )
        .route("/api/v1/workorders/:id/archive", post(routes::workorders::archive))
        // admin
        .route(
            "/api/v1/completion-check-config",
            get(routes::admin::get_config).put(routes::admin::put_config),
        )
        .route("/api/v1/scheduler/tasks", get(routes::admin::list_tasks));

    api.with_state(state)
        .layer(TraceLayer::new_for_http())
        .layer(cors)
}
