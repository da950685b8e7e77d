// src/routes/workorders.rs

use axum::extract::{Path, State};
use axum::Json;
use serde::{Deserialize, Serialize};

use super::ApiResult;
use crate::models::WorkOrder;
use crate::services::accumulator::{self, CountPolicy, Cumulative, ProcessCumulative};
use crate::services::archiver::{self, ArchiveOutcome};
use crate::services::completion;
use crate::services::permission::Actor;
use crate::services::settings;
use crate::AppState;

#[derive(Serialize)]
pub struct CumulativeResp {
    pub workorder_id: i64,
    pub count_pending: bool,
    pub processes: Vec<ProcessCumulative>,
}

pub async fn get_cumulative(
    State(state): State<AppState>,
    actor: Actor,
    Path(id): Path<i64>,
) -> ApiResult<CumulativeResp> {
    let mut conn = state.pool.acquire().await?;
    let cfg = settings::load_config(&mut conn).await?;
    let policy = CountPolicy::from_config(&cfg);
    let processes = accumulator::workorder_cumulative(&mut conn, &actor, id, policy).await?;
    Ok(Json(CumulativeResp {
        workorder_id: id,
        count_pending: policy.count_pending,
        processes,
    }))
}

pub async fn recompute_process(
    State(state): State<AppState>,
    actor: Actor,
    Path((id, process_id)): Path<(i64, i64)>,
) -> ApiResult<Cumulative> {
    actor.require_superuser()?;
    let mut tx = state.pool.begin().await?;
    let cfg = settings::load_config(&mut tx).await?;
    let totals = accumulator::recompute(&mut tx, id, process_id, CountPolicy::from_config(&cfg)).await?;
    tx.commit().await?;
    tracing::info!(workorder_id = id, process_id, actor = %actor.username, "partition recomputed");
    Ok(Json(totals))
}

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ManualCompletionBody {
    pub manual_completion: bool,
}

pub async fn set_manual_completion(
    State(state): State<AppState>,
    actor: Actor,
    Path(id): Path<i64>,
    Json(body): Json<ManualCompletionBody>,
) -> ApiResult<WorkOrder> {
    Ok(Json(
        completion::set_manual_completion(&state.pool, &actor, id, body.manual_completion).await?,
    ))
}

pub async fn reconcile(
    State(state): State<AppState>,
    actor: Actor,
    Path(id): Path<i64>,
) -> ApiResult<WorkOrder> {
    let cfg = {
        let mut conn = state.pool.acquire().await?;
        settings::load_config(&mut conn).await?
    };
    Ok(Json(completion::reconcile(&state.pool, &actor, id, &cfg).await?))
}

pub async fn revert_completion(
    State(state): State<AppState>,
    actor: Actor,
    Path(id): Path<i64>,
) -> ApiResult<WorkOrder> {
    Ok(Json(completion::revert_completion(&state.pool, &actor, id).await?))
}

pub async fn archive(
    State(state): State<AppState>,
    actor: Actor,
    Path(id): Path<i64>,
) -> ApiResult<ArchiveOutcome> {
    actor.require_superuser()?;
    Ok(Json(archiver::archive(&state.pool, id, &actor).await?))
}
