// src/routes/reports.rs

use axum::extract::{Path, Query, State};
use axum::http::{header, HeaderName, StatusCode};
use axum::Json;
use chrono::Utc;
use serde_json::{json, Value};
use uuid::Uuid;

use super::ApiResult;
use crate::error::CoreError;
use crate::models::{Report, ReportSource};
use crate::services::approval::{self, ApprovalRequest};
use crate::services::ingest::{OnsiteStart, OnsiteStop, ReportPatch, ReportSubmission};
use crate::services::permission::Actor;
use crate::services::report_store::{self, ReportFilter};
use crate::services::settings;
use crate::AppState;

type Created = (StatusCode, [(HeaderName, String); 1], Json<Report>);

fn created(report: Report) -> Created {
    let location = format!("/api/v1/reports/{}", report.header().report_id);
    (StatusCode::CREATED, [(header::LOCATION, location)], Json(report))
}

async fn submit(
    state: &AppState,
    actor: &Actor,
    source: ReportSource,
    body: ReportSubmission,
) -> Result<Created, CoreError> {
    let new = body.into_new_report(source, state.config.timezone, Utc::now())?;
    let report = report_store::create(&state.pool, actor, new).await?;
    Ok(created(report))
}

pub async fn submit_operator(
    State(state): State<AppState>,
    actor: Actor,
    Json(body): Json<ReportSubmission>,
) -> Result<Created, CoreError> {
    submit(&state, &actor, ReportSource::OperatorSupplement, body).await
}

pub async fn submit_smt(
    State(state): State<AppState>,
    actor: Actor,
    Json(body): Json<ReportSubmission>,
) -> Result<Created, CoreError> {
    submit(&state, &actor, ReportSource::SmtProduction, body).await
}

pub async fn submit_manager(
    State(state): State<AppState>,
    actor: Actor,
    Json(body): Json<ReportSubmission>,
) -> Result<Created, CoreError> {
    submit(&state, &actor, ReportSource::ManagerReport, body).await
}

pub async fn start_onsite(
    State(state): State<AppState>,
    actor: Actor,
    Json(body): Json<OnsiteStart>,
) -> Result<Created, CoreError> {
    let new = body.into_new_report(state.config.timezone, Utc::now())?;
    let report = report_store::create(&state.pool, &actor, new).await?;
    Ok(created(report))
}

pub async fn stop_onsite(
    State(state): State<AppState>,
    actor: Actor,
    Path(session_id): Path<Uuid>,
    Json(body): Json<OnsiteStop>,
) -> ApiResult<Report> {
    let report = report_store::stop_session(
        &state.pool,
        &actor,
        session_id,
        body,
        state.config.timezone,
        Utc::now(),
    )
    .await?;
    Ok(Json(report))
}

pub async fn list_reports(
    State(state): State<AppState>,
    actor: Actor,
    Query(filter): Query<ReportFilter>,
) -> ApiResult<Vec<Report>> {
    Ok(Json(report_store::list(&state.pool, &actor, &filter).await?))
}

pub async fn patch_report(
    State(state): State<AppState>,
    actor: Actor,
    Path(id): Path<i64>,
    Json(body): Json<ReportPatch>,
) -> ApiResult<Report> {
    let report = report_store::update(
        &state.pool,
        &actor,
        id,
        body,
        state.config.timezone,
        Utc::now(),
    )
    .await?;
    Ok(Json(report))
}

pub async fn delete_report(
    State(state): State<AppState>,
    actor: Actor,
    Path(id): Path<i64>,
) -> ApiResult<Value> {
    report_store::delete(&state.pool, &actor, id).await?;
    Ok(Json(json!({ "deleted": true, "report_id": id })))
}

pub async fn decide_report(
    State(state): State<AppState>,
    actor: Actor,
    Path(id): Path<i64>,
    Json(body): Json<ApprovalRequest>,
) -> ApiResult<Report> {
    let cfg = {
        let mut conn = state.pool.acquire().await?;
        settings::load_config(&mut conn).await?
    };
    Ok(Json(approval::decide(&state.pool, &actor, id, body, &cfg).await?))
}
