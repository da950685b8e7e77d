// src/services/archiver.rs

use serde::Serialize;
use serde_json::json;
use sqlx::PgPool;

use crate::db::locks::try_lock_workorder;
use crate::error::{CoreError, CoreResult};
use crate::models::work_order::WORKORDER_COLUMNS;
use crate::models::{ReportSource, WorkOrder, WorkOrderStatus};
use crate::services::audit;
use crate::services::permission::Actor;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum ArchiveOutcome {
    Archived { archive_id: i64, report_count: i64 },
    AlreadyArchived { archive_id: Option<i64> },
}

const REPORT_COPY_COLUMNS: &str = "source, report_id, workorder_id, process_id, process_name, \
     product_code, operator_or_equipment, report_time, quantity, hours, report_type, approval_state, \
     approved_at, approver, remarks, abnormal_notes, auto_completed, completion_time, \
     cumulative_quantity, cumulative_hours, rd_workorder_number, rd_product_code, rd_sample_name, \
     submitted_by, needs_reconciliation, session_id, started_at, stopped_at, created_at, updated_at";

/// Moves a completed work-order and all of its reports into the history store in one
/// transaction. Re-archiving is a no-op.
pub async fn archive(pool: &PgPool, workorder_id: i64, actor: &Actor) -> CoreResult<ArchiveOutcome> {
    let mut tx = pool.begin().await?;
    if !try_lock_workorder(&mut tx, workorder_id).await? {
        return Err(CoreError::conflict(format!(
            "work-order {workorder_id} is being evaluated; retry later"
        )));
    }

    let wo = sqlx::query_as::<_, WorkOrder>(&format!(
        "SELECT {WORKORDER_COLUMNS} FROM workorder WHERE workorder_id = $1 FOR UPDATE"
    ))
    .bind(workorder_id)
    .fetch_optional(&mut *tx)
    .await?
    .ok_or_else(|| CoreError::not_found("work-order", workorder_id))?;

    match wo.status {
        WorkOrderStatus::Archived => {
            let archive_id: Option<(i64,)> =
                sqlx::query_as("SELECT archive_id FROM workorder_completed WHERE workorder_id = $1")
                    .bind(workorder_id)
                    .fetch_optional(&mut *tx)
                    .await?;
            return Ok(ArchiveOutcome::AlreadyArchived {
                archive_id: archive_id.map(|(id,)| id),
            });
        }
        WorkOrderStatus::Completed => {}
        other => {
            return Err(CoreError::conflict(format!(
                "work-order {workorder_id} is {other}; only completed work-orders are archived"
            )))
        }
    }

    let (archive_id,): (i64,) = sqlx::query_as(
        r#"INSERT INTO workorder_completed (workorder_id, company_code, order_number, product_code,
                planned_quantity, manual_completion, completed_at, processes, created_at, updated_at)
           SELECT w.workorder_id, w.company_code, w.order_number, w.product_code,
                  w.planned_quantity, w.manual_completion, w.completed_at,
                  COALESCE((SELECT jsonb_agg(to_jsonb(p) ORDER BY p.seq)
                            FROM workorder_process p WHERE p.workorder_id = w.workorder_id),
                           '[]'::JSONB),
                  w.created_at, w.updated_at
           FROM workorder w WHERE w.workorder_id = $1
           RETURNING archive_id"#,
    )
    .bind(workorder_id)
    .fetch_one(&mut *tx)
    .await?;

    let report_count = sqlx::query(&format!(
        "INSERT INTO workorder_completed_report (archive_id, {REPORT_COPY_COLUMNS}) \
         SELECT $1, {REPORT_COPY_COLUMNS} FROM production_report_all \
         WHERE workorder_id = $2 AND archived_at IS NULL"
    ))
    .bind(archive_id)
    .bind(workorder_id)
    .execute(&mut *tx)
    .await?
    .rows_affected() as i64;

    sqlx::query("UPDATE workorder_completed SET report_count = $2 WHERE archive_id = $1")
        .bind(archive_id)
        .bind(report_count)
        .execute(&mut *tx)
        .await?;

    for source in ReportSource::ALL {
        sqlx::query(&format!(
            "UPDATE {} SET archived_at = now() WHERE workorder_id = $1 AND archived_at IS NULL",
            source.table()
        ))
        .bind(workorder_id)
        .execute(&mut *tx)
        .await?;
    }

    sqlx::query(
        r#"UPDATE workorder SET status = 'archived', is_visible = FALSE, updated_at = now()
           WHERE workorder_id = $1"#,
    )
    .bind(workorder_id)
    .execute(&mut *tx)
    .await?;

    audit::record_allocation(
        &mut tx,
        workorder_id,
        Some(archive_id),
        "archived",
        &actor.username,
        json!({
            "order_number": wo.order_number,
            "report_count": report_count,
            "completed_at": wo.completed_at,
        }),
    )
    .await?;

    tx.commit().await?;
    tracing::info!(workorder_id, archive_id, report_count, "work-order archived");
    Ok(ArchiveOutcome::Archived {
        archive_id,
        report_count,
    })
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ArchiveStats {
    pub scanned: u64,
    pub archived: u64,
    pub errored: u64,
}

/// Archives completed work-orders whose grace period has passed, oldest completion first.
pub async fn archive_pending(
    pool: &PgPool,
    grace_minutes: i32,
    limit: i64,
    actor: &Actor,
) -> CoreResult<ArchiveStats> {
    let due: Vec<(i64,)> = sqlx::query_as(
        r#"SELECT workorder_id FROM workorder
           WHERE status = 'completed'
             AND completed_at <= now() - make_interval(mins => $1)
           ORDER BY completed_at
           LIMIT $2"#,
    )
    .bind(grace_minutes)
    .bind(limit)
    .fetch_all(pool)
    .await?;

    let mut stats = ArchiveStats::default();
    for (workorder_id,) in due {
        stats.scanned += 1;
        match archive(pool, workorder_id, actor).await {
            Ok(ArchiveOutcome::Archived { .. }) => stats.archived += 1,
            Ok(ArchiveOutcome::AlreadyArchived { .. }) => {}
            Err(err) => {
                stats.errored += 1;
                tracing::warn!(workorder_id, error = %err, "archive failed; retrying next tick");
            }
        }
    }
    Ok(stats)
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PurgeStats {
    pub workorders: u64,
    pub reports: u64,
}

/// Physically removes live rows of work-orders archived more than `older_than_days` ago.
/// The history store is untouched.
pub async fn purge_archived(pool: &PgPool, older_than_days: i32) -> CoreResult<PurgeStats> {
    if older_than_days < 0 {
        return Err(CoreError::invalid("older_than_days must be >= 0"));
    }
    let mut tx = pool.begin().await?;

    let ids: Vec<i64> = sqlx::query_as::<_, (i64,)>(
        r#"SELECT w.workorder_id FROM workorder w
           JOIN workorder_completed c ON c.workorder_id = w.workorder_id
           WHERE w.status = 'archived'
             AND c.archived_at <= now() - make_interval(days => $1)
           FOR UPDATE OF w"#,
    )
    .bind(older_than_days)
    .fetch_all(&mut *tx)
    .await?
    .into_iter()
    .map(|(id,)| id)
    .collect();

    let mut stats = PurgeStats::default();
    if ids.is_empty() {
        tx.rollback().await?;
        return Ok(stats);
    }

    for source in ReportSource::ALL {
        stats.reports += sqlx::query(&format!(
            "DELETE FROM {} WHERE workorder_id = ANY($1) AND archived_at IS NOT NULL",
            source.table()
        ))
        .bind(&ids)
        .execute(&mut *tx)
        .await?
        .rows_affected();
    }
    sqlx::query("DELETE FROM workorder_process WHERE workorder_id = ANY($1)")
        .bind(&ids)
        .execute(&mut *tx)
        .await?;
    stats.workorders = sqlx::query("DELETE FROM workorder WHERE workorder_id = ANY($1)")
        .bind(&ids)
        .execute(&mut *tx)
        .await?
        .rows_affected();

    tx.commit().await?;
    tracing::info!(
        workorders = stats.workorders,
        reports = stats.reports,
        older_than_days,
        "archived work-orders purged"
    );
    Ok(stats)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn copy_columns_cover_the_history_table() {
        // Every report field plus the session triple travels into history.
        for column in [
            "cumulative_quantity",
            "cumulative_hours",
            "approver",
            "session_id",
            "stopped_at",
            "needs_reconciliation",
        ] {
            assert!(REPORT_COPY_COLUMNS.contains(column), "missing {column}");
        }
        assert!(!REPORT_COPY_COLUMNS.contains("dedup_key"));
    }

    #[test]
    fn outcome_serializes_with_tag() {
        let json = serde_json::to_value(ArchiveOutcome::AlreadyArchived { archive_id: Some(4) })
            .expect("serialize");
        assert_eq!(json["outcome"], "already_archived");
        assert_eq!(json["archive_id"], 4);
    }
}
