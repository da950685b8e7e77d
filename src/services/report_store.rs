// src/services/report_store.rs
//
// Transactional writes for all four report variants. Classification, accumulator refresh and
// audit are explicit steps of each write, in that order.

use chrono::{DateTime, FixedOffset, Utc};
use serde::Deserialize;
use serde_json::json;
use sqlx::{PgConnection, PgPool, Postgres, QueryBuilder};
use uuid::Uuid;

use crate::db::locks::lock_dedup_key;
use crate::error::{CoreError, CoreResult};
use crate::models::report::REPORT_VIEW_COLUMNS;
use crate::models::{
    ApprovalState, Page, Process, Report, ReportRow, ReportSource, ReportType, WorkOrder,
    WorkOrderStatus,
};
use crate::models::work_order::WORKORDER_COLUMNS;
use crate::services::accumulator::{self, CountPolicy};
use crate::services::audit::{self, AuditTarget};
use crate::services::classifier;
use crate::services::ingest::{
    self, parse_report_time, validate_hours, validate_quantity, NewReport, OnsiteStop, ReportPatch,
};
use crate::services::permission::{self, AccessScopes, Actor};
use crate::services::settings;

/// Identical submissions within this many seconds of the original replay its id.
pub const DEDUP_WINDOW_SECS: i64 = 5;

// ─────────────────────────────────────────────────────────────────────────────
// Reads
// ─────────────────────────────────────────────────────────────────────────────

pub(crate) async fn fetch_row(conn: &mut PgConnection, report_id: i64) -> CoreResult<ReportRow> {
    sqlx::query_as::<_, ReportRow>(&format!(
        "SELECT {REPORT_VIEW_COLUMNS} FROM production_report_all WHERE report_id = $1"
    ))
    .bind(report_id)
    .fetch_optional(conn)
    .await?
    .ok_or_else(|| CoreError::not_found("report", report_id))
}

/// Locks the report's row in its variant table and returns a fresh read of it.
pub(crate) async fn lock_row(conn: &mut PgConnection, report_id: i64) -> CoreResult<ReportRow> {
    let (source,): (ReportSource,) =
        sqlx::query_as("SELECT source FROM production_report_all WHERE report_id = $1")
            .bind(report_id)
            .fetch_optional(&mut *conn)
            .await?
            .ok_or_else(|| CoreError::not_found("report", report_id))?;

    sqlx::query(&format!(
        "SELECT report_id FROM {} WHERE report_id = $1 FOR UPDATE",
        source.table()
    ))
    .bind(report_id)
    .execute(&mut *conn)
    .await?;

    let row = fetch_row(conn, report_id).await?;
    if row.archived_at.is_some() {
        return Err(CoreError::not_found("report", report_id));
    }
    Ok(row)
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ReportFilter {
    pub source: Option<ReportSource>,
    pub workorder_id: Option<i64>,
    pub process_id: Option<i64>,
    pub process_name: Option<String>,
    pub operator: Option<String>,
    pub approval_state: Option<ApprovalState>,
    pub report_type: Option<ReportType>,
    pub limit: Option<i64>,
    pub offset: Option<i64>,
}

impl ReportFilter {
    pub fn page(&self) -> Page {
        Page::new(self.limit, self.offset)
    }

    fn push_where(&self, qb: &mut QueryBuilder<'_, Postgres>) {
        if let Some(source) = self.source {
            qb.push(" AND source = ").push_bind(source);
        }
        if let Some(id) = self.workorder_id {
            qb.push(" AND workorder_id = ").push_bind(id);
        }
        if let Some(id) = self.process_id {
            qb.push(" AND process_id = ").push_bind(id);
        }
        if let Some(name) = &self.process_name {
            qb.push(" AND process_name = ").push_bind(name.clone());
        }
        if let Some(op) = &self.operator {
            qb.push(" AND operator_or_equipment = ").push_bind(op.clone());
        }
        if let Some(state) = self.approval_state {
            qb.push(" AND approval_state = ").push_bind(state);
        }
        if let Some(kind) = self.report_type {
            qb.push(" AND report_type = ").push_bind(kind);
        }
    }
}

/// Reports visible to `actor`, newest first. Rows of archived work-orders never appear.
pub async fn list(pool: &PgPool, actor: &Actor, filter: &ReportFilter) -> CoreResult<Vec<Report>> {
    let mut conn = pool.acquire().await?;
    let rows = permission::load_permissions(&mut conn, actor).await?;
    let scopes = AccessScopes::resolve(actor, &rows);
    if scopes.is_denied_everywhere() {
        return Err(CoreError::denied(format!(
            "{} has no work permission rows",
            actor.username
        )));
    }

    let page = filter.page();
    let mut qb = QueryBuilder::<Postgres>::new(format!(
        "SELECT {REPORT_VIEW_COLUMNS} FROM production_report_all \
         WHERE archived_at IS NULL \
           AND (workorder_id IS NULL OR workorder_id IN \
                (SELECT workorder_id FROM workorder WHERE is_visible)) AND "
    ));
    scopes.push_predicate(&mut qb);
    filter.push_where(&mut qb);
    qb.push(" ORDER BY report_time DESC, report_id DESC LIMIT ")
        .push_bind(page.limit)
        .push(" OFFSET ")
        .push_bind(page.offset);

    let reports = qb
        .build_query_as::<ReportRow>()
        .fetch_all(&mut *conn)
        .await?
        .into_iter()
        .map(Report::from)
        .collect();
    Ok(reports)
}

// ─────────────────────────────────────────────────────────────────────────────
// Create
// ─────────────────────────────────────────────────────────────────────────────

/// Resolves a work-order reference for a new report; archived or hidden ones do not exist here.
async fn resolve_workorder(conn: &mut PgConnection, workorder_id: i64) -> CoreResult<WorkOrder> {
    let wo = sqlx::query_as::<_, WorkOrder>(&format!(
        "SELECT {WORKORDER_COLUMNS} FROM workorder WHERE workorder_id = $1"
    ))
    .bind(workorder_id)
    .fetch_optional(conn)
    .await?
    .filter(|wo| wo.is_visible && wo.status.accepts_reports())
    .ok_or_else(|| CoreError::not_found("work-order", workorder_id))?;
    Ok(wo)
}

async fn resolve_process(
    conn: &mut PgConnection,
    workorder_id: i64,
    name: &str,
) -> CoreResult<Process> {
    sqlx::query_as::<_, Process>(
        r#"SELECT process_id, workorder_id, name, seq, planned_quantity
           FROM workorder_process WHERE workorder_id = $1 AND name = $2"#,
    )
    .bind(workorder_id)
    .bind(name)
    .fetch_optional(conn)
    .await?
    .ok_or_else(|| CoreError::not_found("process", format!("{workorder_id}/{name}")))
}

/// Stores one validated report. An identical submission within the de-dup window is a
/// `Conflict` carrying the original report id.
pub async fn create(pool: &PgPool, actor: &Actor, mut new: NewReport) -> CoreResult<Report> {
    classifier::classify(&mut new);
    let dedup_key = new.dedup_key();

    let mut tx = pool.begin().await?;
    permission::authorize(
        &mut tx,
        actor,
        new.source,
        &new.operator_or_equipment,
        &new.process_name,
    )
    .await?;

    lock_dedup_key(&mut tx, &dedup_key).await?;
    let replay: Option<(i64,)> = sqlx::query_as(
        r#"SELECT report_id FROM production_report_all
           WHERE dedup_key = $1 AND created_at >= now() - make_interval(secs => $2)
           ORDER BY created_at LIMIT 1"#,
    )
    .bind(&dedup_key)
    .bind(DEDUP_WINDOW_SECS as f64)
    .fetch_optional(&mut *tx)
    .await?;
    if let Some((original,)) = replay {
        tx.rollback().await?;
        tracing::info!(report_id = original, source = %new.source, "duplicate submission replayed");
        return Err(CoreError::Conflict {
            message: format!("duplicate of report {original}"),
            existing_report_id: Some(original),
        });
    }

    let (workorder, process) = match new.workorder_id {
        Some(id) => {
            let wo = resolve_workorder(&mut tx, id).await?;
            let process = resolve_process(&mut tx, id, &new.process_name).await?;
            (Some(wo), Some(process))
        }
        None => (None, None),
    };
    let process_id = process.as_ref().map(|p| p.process_id);

    let report_id = insert(&mut tx, &new, process_id, &dedup_key, &actor.username).await?;

    if let Some(wo) = &workorder {
        if wo.status == WorkOrderStatus::Pending {
            sqlx::query(
                r#"UPDATE workorder SET status = 'in_production', updated_at = now()
                   WHERE workorder_id = $1 AND status = 'pending'"#,
            )
            .bind(wo.workorder_id)
            .execute(&mut *tx)
            .await?;
            tracing::info!(workorder_id = wo.workorder_id, "work-order entered production");
        }
    }

    let policy = CountPolicy::from_config(&settings::load_config(&mut tx).await?);
    accumulator::recompute_for(&mut tx, new.workorder_id, process_id, policy).await?;

    audit::record_operation(
        &mut tx,
        AuditTarget::Report {
            source: new.source,
            report_id,
        },
        if new.session.is_some() { "session_start" } else { "create" },
        &actor.username,
        json!({
            "workorder_id": new.workorder_id,
            "process": new.process_name,
            "quantity": new.quantity,
            "hours": new.hours,
            "report_type": new.report_type,
        }),
    )
    .await?;

    let report = Report::from(fetch_row(&mut tx, report_id).await?);
    tx.commit().await?;

    tracing::info!(
        report_id,
        source = %new.source,
        workorder_id = ?new.workorder_id,
        report_type = %new.report_type,
        quantity = new.quantity,
        "report stored"
    );
    Ok(report)
}

async fn insert(
    conn: &mut PgConnection,
    new: &NewReport,
    process_id: Option<i64>,
    dedup_key: &str,
    submitted_by: &str,
) -> CoreResult<i64> {
    let (session_cols, session_vals) = match new.session {
        Some(_) => (", session_id, started_at", ", $17, $18"),
        None => ("", ""),
    };
    let sql = format!(
        r#"INSERT INTO {} (workorder_id, process_id, process_name, product_code,
                operator_or_equipment, report_time, quantity, hours, report_type, remarks,
                abnormal_notes, rd_workorder_number, rd_product_code, rd_sample_name, dedup_key,
                submitted_by{session_cols})
           VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16{session_vals})
           RETURNING report_id"#,
        new.source.table()
    );

    let mut query = sqlx::query_as::<_, (i64,)>(&sql)
        .bind(new.workorder_id)
        .bind(process_id)
        .bind(&new.process_name)
        .bind(&new.product_code)
        .bind(&new.operator_or_equipment)
        .bind(new.report_time)
        .bind(new.quantity)
        .bind(new.hours)
        .bind(new.report_type)
        .bind(&new.remarks)
        .bind(&new.abnormal_notes)
        .bind(&new.rd_workorder_number)
        .bind(&new.rd_product_code)
        .bind(&new.rd_sample_name)
        .bind(dedup_key)
        .bind(submitted_by);
    if let Some(session) = &new.session {
        query = query.bind(session.session_id).bind(session.started_at);
    }

    let (report_id,) = query.fetch_one(conn).await?;
    Ok(report_id)
}

// ─────────────────────────────────────────────────────────────────────────────
// Update / delete
// ─────────────────────────────────────────────────────────────────────────────

pub async fn update(
    pool: &PgPool,
    actor: &Actor,
    report_id: i64,
    patch: ReportPatch,
    tz: FixedOffset,
    now: DateTime<Utc>,
) -> CoreResult<Report> {
    if patch.is_empty() {
        return Err(CoreError::invalid("nothing to update"));
    }

    let mut tx = pool.begin().await?;
    let row = lock_row(&mut tx, report_id).await?;
    permission::authorize(
        &mut tx,
        actor,
        row.source,
        &row.operator_or_equipment,
        &row.process_name,
    )
    .await?;

    let quantity = match patch.quantity {
        Some(q) => {
            validate_quantity(q)?;
            q
        }
        None => row.quantity,
    };
    let hours = match patch.hours {
        Some(h) => validate_hours(h)?,
        None => row.hours,
    };
    let report_time = match &patch.report_time {
        Some(raw) => parse_report_time(raw, patch.report_date, tz, now)?,
        None => row.report_time,
    };
    let dedup_key = ingest::dedup_key(
        row.source,
        &row.operator_or_equipment,
        row.workorder_id,
        &row.process_name,
        report_time,
        quantity,
    );

    sqlx::query(&format!(
        r#"UPDATE {} SET
               quantity = $2, hours = $3, report_time = $4,
               remarks = COALESCE($5, remarks), abnormal_notes = COALESCE($6, abnormal_notes),
               report_type = CASE WHEN workorder_id IS NULL THEN 'rd_sample' ELSE 'normal' END,
               dedup_key = $7, updated_at = now()
           WHERE report_id = $1"#,
        row.source.table()
    ))
    .bind(report_id)
    .bind(quantity)
    .bind(hours)
    .bind(report_time)
    .bind(&patch.remarks)
    .bind(&patch.abnormal_notes)
    .bind(&dedup_key)
    .execute(&mut *tx)
    .await?;

    if patch.touches_counted_fields() {
        let policy = CountPolicy::from_config(&settings::load_config(&mut tx).await?);
        accumulator::recompute_for(&mut tx, row.workorder_id, row.process_id, policy).await?;
    }

    audit::record_operation(
        &mut tx,
        AuditTarget::Report {
            source: row.source,
            report_id,
        },
        "update",
        &actor.username,
        json!({
            "before": { "quantity": row.quantity, "hours": row.hours, "report_time": row.report_time },
            "after": { "quantity": quantity, "hours": hours, "report_time": report_time },
            "remarks_changed": patch.remarks.is_some(),
            "abnormal_notes_changed": patch.abnormal_notes.is_some(),
        }),
    )
    .await?;

    let report = Report::from(fetch_row(&mut tx, report_id).await?);
    tx.commit().await?;
    tracing::info!(report_id, source = %row.source, "report updated");
    Ok(report)
}

/// Withdraws a pending submission. Decided rows belong to the record and stay.
pub async fn delete(pool: &PgPool, actor: &Actor, report_id: i64) -> CoreResult<()> {
    let mut tx = pool.begin().await?;
    let row = lock_row(&mut tx, report_id).await?;
    permission::authorize(
        &mut tx,
        actor,
        row.source,
        &row.operator_or_equipment,
        &row.process_name,
    )
    .await?;

    if row.approval_state != ApprovalState::Pending {
        return Err(CoreError::conflict(format!(
            "report {report_id} is {} and can no longer be deleted",
            row.approval_state
        )));
    }

    sqlx::query(&format!("DELETE FROM {} WHERE report_id = $1", row.source.table()))
        .bind(report_id)
        .execute(&mut *tx)
        .await?;

    let policy = CountPolicy::from_config(&settings::load_config(&mut tx).await?);
    accumulator::recompute_for(&mut tx, row.workorder_id, row.process_id, policy).await?;

    audit::record_operation(
        &mut tx,
        AuditTarget::Report {
            source: row.source,
            report_id,
        },
        "delete",
        &actor.username,
        json!({
            "workorder_id": row.workorder_id,
            "process": row.process_name,
            "operator_or_equipment": row.operator_or_equipment,
            "quantity": row.quantity,
            "hours": row.hours,
            "report_time": row.report_time,
        }),
    )
    .await?;

    tx.commit().await?;
    tracing::info!(report_id, source = %row.source, "pending report withdrawn");
    Ok(())
}

// ─────────────────────────────────────────────────────────────────────────────
// Onsite sessions
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, sqlx::FromRow)]
struct OpenSession {
    report_id: i64,
    operator_or_equipment: String,
    process_name: String,
    workorder_id: Option<i64>,
    process_id: Option<i64>,
    started_at: DateTime<Utc>,
    stopped_at: Option<DateTime<Utc>>,
    archived_at: Option<DateTime<Utc>>,
}

/// Closes an onsite session; its quantity starts counting from here.
pub async fn stop_session(
    pool: &PgPool,
    actor: &Actor,
    session_id: Uuid,
    stop: OnsiteStop,
    tz: FixedOffset,
    now: DateTime<Utc>,
) -> CoreResult<Report> {
    let mut tx = pool.begin().await?;
    let session = sqlx::query_as::<_, OpenSession>(
        r#"SELECT report_id, operator_or_equipment, process_name, workorder_id, process_id,
                  started_at, stopped_at, archived_at
           FROM workorder_onsite_report WHERE session_id = $1 FOR UPDATE"#,
    )
    .bind(session_id)
    .fetch_optional(&mut *tx)
    .await?
    .filter(|s| s.archived_at.is_none())
    .ok_or_else(|| CoreError::not_found("onsite session", session_id))?;

    permission::authorize(
        &mut tx,
        actor,
        ReportSource::OnsiteLive,
        &session.operator_or_equipment,
        &session.process_name,
    )
    .await?;

    if session.stopped_at.is_some() {
        return Err(CoreError::conflict(format!(
            "onsite session {session_id} is already closed"
        )));
    }

    let close = stop.into_close(session.started_at, tz, now)?;
    let dedup_key = ingest::dedup_key(
        ReportSource::OnsiteLive,
        &session.operator_or_equipment,
        session.workorder_id,
        &session.process_name,
        session.started_at,
        close.quantity,
    );

    sqlx::query(
        r#"UPDATE workorder_onsite_report SET
               stopped_at = $2, quantity = $3, hours = $4,
               abnormal_notes = CASE WHEN $5 = '' THEN abnormal_notes ELSE $5 END,
               dedup_key = $6, updated_at = now()
           WHERE report_id = $1"#,
    )
    .bind(session.report_id)
    .bind(close.stopped_at)
    .bind(close.quantity)
    .bind(close.hours)
    .bind(&close.abnormal_notes)
    .bind(&dedup_key)
    .execute(&mut *tx)
    .await?;

    let policy = CountPolicy::from_config(&settings::load_config(&mut tx).await?);
    accumulator::recompute_for(&mut tx, session.workorder_id, session.process_id, policy).await?;

    audit::record_operation(
        &mut tx,
        AuditTarget::Report {
            source: ReportSource::OnsiteLive,
            report_id: session.report_id,
        },
        "session_stop",
        &actor.username,
        json!({
            "session_id": session_id,
            "quantity": close.quantity,
            "hours": close.hours,
            "stopped_at": close.stopped_at,
        }),
    )
    .await?;

    let report = Report::from(fetch_row(&mut tx, session.report_id).await?);
    tx.commit().await?;
    tracing::info!(
        report_id = session.report_id,
        %session_id,
        quantity = close.quantity,
        "onsite session closed"
    );
    Ok(report)
}
