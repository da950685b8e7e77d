// src/services/audit.rs

use serde_json::Value;
use sqlx::{Connection, PgConnection};

use crate::error::CoreResult;
use crate::models::{ReportSource, TargetKind};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuditTarget {
    Report { source: ReportSource, report_id: i64 },
    Workorder(i64),
}

impl AuditTarget {
    fn kind(&self) -> TargetKind {
        match self {
            Self::Report { .. } => TargetKind::Report,
            Self::Workorder(_) => TargetKind::Workorder,
        }
    }

    fn id(&self) -> i64 {
        match self {
            Self::Report { report_id, .. } => *report_id,
            Self::Workorder(id) => *id,
        }
    }
}

/// Appends an operation log row inside a savepoint of the caller's transaction.
///
/// A failed audit write does not undo the operation: the savepoint is rolled back and the target
/// is flagged `needs_reconciliation` instead. Returns whether the row was written.
pub async fn record_operation(
    conn: &mut PgConnection,
    target: AuditTarget,
    action: &str,
    actor: &str,
    detail: Value,
) -> CoreResult<bool> {
    let mut savepoint = conn.begin().await?;
    let written = sqlx::query(
        r#"INSERT INTO workorder_operation_log (target_kind, target_id, action, actor, detail)
           VALUES ($1, $2, $3, $4, $5)"#,
    )
    .bind(target.kind())
    .bind(target.id())
    .bind(action)
    .bind(actor)
    .bind(&detail)
    .execute(&mut *savepoint)
    .await;

    match written {
        Ok(_) => {
            savepoint.commit().await?;
            Ok(true)
        }
        Err(err) => {
            savepoint.rollback().await?;
            tracing::warn!(
                target_kind = %target.kind(),
                target_id = target.id(),
                action,
                error = %err,
                "operation log write failed; flagging for reconciliation"
            );
            flag_for_reconciliation(conn, target).await?;
            Ok(false)
        }
    }
}

async fn flag_for_reconciliation(conn: &mut PgConnection, target: AuditTarget) -> CoreResult<()> {
    match target {
        AuditTarget::Report { source, report_id } => {
            sqlx::query(&format!(
                "UPDATE {} SET needs_reconciliation = TRUE WHERE report_id = $1",
                source.table()
            ))
            .bind(report_id)
            .execute(conn)
            .await?;
        }
        AuditTarget::Workorder(id) => {
            sqlx::query("UPDATE workorder SET needs_reconciliation = TRUE WHERE workorder_id = $1")
                .bind(id)
                .execute(conn)
                .await?;
        }
    }
    Ok(())
}

/// Appends an allocation log row. Part of the archive transaction, so a failure aborts it.
pub async fn record_allocation(
    conn: &mut PgConnection,
    workorder_id: i64,
    archive_id: Option<i64>,
    action: &str,
    actor: &str,
    detail: Value,
) -> CoreResult<i64> {
    let (log_id,): (i64,) = sqlx::query_as(
        r#"INSERT INTO workorder_allocation_log (workorder_id, archive_id, action, actor, detail)
           VALUES ($1, $2, $3, $4, $5)
           RETURNING log_id"#,
    )
    .bind(workorder_id)
    .bind(archive_id)
    .bind(action)
    .bind(actor)
    .bind(&detail)
    .fetch_one(conn)
    .await?;
    Ok(log_id)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn targets_map_to_log_columns() {
        let report = AuditTarget::Report {
            source: ReportSource::SmtProduction,
            report_id: 41,
        };
        assert_eq!(report.kind(), TargetKind::Report);
        assert_eq!(report.id(), 41);
        assert_eq!(AuditTarget::Workorder(9).kind(), TargetKind::Workorder);
    }
}
