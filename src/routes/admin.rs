// src/routes/admin.rs

use std::collections::HashMap;

use axum::extract::State;
use axum::Json;
use serde::Serialize;

use super::ApiResult;
use crate::models::{CompletionCheckConfig, PeriodicTaskRow};
use crate::scheduler::TaskSnapshot;
use crate::services::permission::Actor;
use crate::services::settings::{self, ConfigPatch};
use crate::AppState;

pub async fn get_config(State(state): State<AppState>, _actor: Actor) -> ApiResult<CompletionCheckConfig> {
    let mut conn = state.pool.acquire().await?;
    Ok(Json(settings::load_config(&mut conn).await?))
}

pub async fn put_config(
    State(state): State<AppState>,
    actor: Actor,
    Json(patch): Json<ConfigPatch>,
) -> ApiResult<CompletionCheckConfig> {
    actor.require_superuser()?;
    let cfg = settings::update_config(&state.pool, patch).await?;
    tracing::info!(actor = %actor.username, "completion-check config updated");
    Ok(Json(cfg))
}

#[derive(Serialize)]
pub struct TasksResp {
    /// Registrations and cumulative counters shared by every worker.
    pub tasks: Vec<PeriodicTaskRow>,
    /// Runs started by this process since it booted.
    pub this_node: HashMap<String, TaskSnapshot>,
}

pub async fn list_tasks(State(state): State<AppState>, _actor: Actor) -> ApiResult<TasksResp> {
    Ok(Json(TasksResp {
        tasks: settings::list_tasks(&state.pool).await?,
        this_node: state.task_stats.snapshot(),
    }))
}
