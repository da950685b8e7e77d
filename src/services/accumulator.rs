// src/services/accumulator.rs

use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::Serialize;
use sqlx::{FromRow, PgConnection, Postgres, QueryBuilder};

use crate::error::{CoreError, CoreResult};
use crate::models::{ApprovalState, CompletionCheckConfig, ReportSource, ReportType};
use crate::services::permission::{self, AccessScopes, Actor};

/// Which reports contribute to cumulative totals.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CountPolicy {
    pub count_pending: bool,
}

impl CountPolicy {
    pub const APPROVED_ONLY: CountPolicy = CountPolicy {
        count_pending: false,
    };

    pub fn from_config(cfg: &CompletionCheckConfig) -> Self {
        Self {
            count_pending: cfg.count_pending,
        }
    }

    pub fn counts(
        &self,
        report_type: ReportType,
        approval_state: ApprovalState,
        session_open: bool,
    ) -> bool {
        if report_type != ReportType::Normal || session_open {
            return false;
        }
        match approval_state {
            ApprovalState::Approved => true,
            ApprovalState::Pending => self.count_pending,
            ApprovalState::Rejected => false,
        }
    }

    /// Same rule as [`CountPolicy::counts`] over a `production_report_all` row.
    pub fn sql_predicate(&self) -> String {
        format!(
            "report_type = 'normal' \
             AND (approval_state = 'approved' OR ({} AND approval_state = 'pending')) \
             AND NOT (source = 'onsite' AND stopped_at IS NULL) \
             AND archived_at IS NULL",
            self.count_pending
        )
    }
}

/// A partition member as the accumulator sees it.
#[derive(Debug, Clone, PartialEq, FromRow)]
pub struct PartitionRow {
    pub source: ReportSource,
    pub report_id: i64,
    pub report_time: DateTime<Utc>,
    pub quantity: i64,
    pub hours: Decimal,
    pub report_type: ReportType,
    pub approval_state: ApprovalState,
    pub session_open: bool,
    pub cumulative_quantity: i64,
    pub cumulative_hours: Decimal,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Snapshot {
    pub source: ReportSource,
    pub report_id: i64,
    pub cumulative_quantity: i64,
    pub cumulative_hours: Decimal,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct Cumulative {
    pub quantity: i64,
    pub hours: Decimal,
}

/// Running totals over the partition in `(report_time, report_id)` order.
///
/// Every row gets the totals after its own contribution, which is zero when it does not count.
pub fn snapshot_partition(rows: &mut [PartitionRow], policy: CountPolicy) -> Vec<Snapshot> {
    rows.sort_by(|a, b| (a.report_time, a.report_id).cmp(&(b.report_time, b.report_id)));

    let mut running = Cumulative::default();
    rows.iter()
        .map(|row| {
            if policy.counts(row.report_type, row.approval_state, row.session_open) {
                running.quantity += row.quantity;
                running.hours += row.hours;
            }
            Snapshot {
                source: row.source,
                report_id: row.report_id,
                cumulative_quantity: running.quantity,
                cumulative_hours: running.hours,
            }
        })
        .collect()
}

const PARTITION_COLUMNS: &str = "source, report_id, report_time, quantity, hours, report_type, \
     approval_state, (source = 'onsite' AND stopped_at IS NULL) AS session_open, \
     cumulative_quantity, cumulative_hours";

/// Rewrites the snapshot columns of one `(work-order, process)` partition.
///
/// The partition is serialized on its `workorder_process` row for the rest of the caller's
/// transaction.
pub async fn recompute(
    conn: &mut PgConnection,
    workorder_id: i64,
    process_id: i64,
    policy: CountPolicy,
) -> CoreResult<Cumulative> {
    let locked: Option<(i64,)> = sqlx::query_as(
        "SELECT process_id FROM workorder_process WHERE process_id = $1 AND workorder_id = $2 FOR UPDATE",
    )
    .bind(process_id)
    .bind(workorder_id)
    .fetch_optional(&mut *conn)
    .await?;
    if locked.is_none() {
        return Err(CoreError::not_found("process", process_id));
    }

    let mut rows = sqlx::query_as::<_, PartitionRow>(&format!(
        "SELECT {PARTITION_COLUMNS} FROM production_report_all \
         WHERE workorder_id = $1 AND process_id = $2 AND archived_at IS NULL"
    ))
    .bind(workorder_id)
    .bind(process_id)
    .fetch_all(&mut *conn)
    .await?;

    let snapshots = snapshot_partition(&mut rows, policy);
    let totals = snapshots
        .last()
        .map(|s| Cumulative {
            quantity: s.cumulative_quantity,
            hours: s.cumulative_hours,
        })
        .unwrap_or_default();

    // Only rows whose snapshot moved are written, grouped per variant table.
    let mut stale: BTreeMap<ReportSource, (Vec<i64>, Vec<i64>, Vec<Decimal>)> = BTreeMap::new();
    for (row, snap) in rows.iter().zip(&snapshots) {
        if row.cumulative_quantity != snap.cumulative_quantity
            || row.cumulative_hours != snap.cumulative_hours
        {
            let entry = stale.entry(snap.source).or_default();
            entry.0.push(snap.report_id);
            entry.1.push(snap.cumulative_quantity);
            entry.2.push(snap.cumulative_hours);
        }
    }

    let mut rewritten = 0u64;
    for (source, (ids, quantities, hours)) in stale {
        rewritten += sqlx::query(&format!(
            "UPDATE {} AS t SET cumulative_quantity = s.q, cumulative_hours = s.h \
             FROM UNNEST($1::BIGINT[], $2::BIGINT[], $3::NUMERIC[]) AS s(id, q, h) \
             WHERE t.report_id = s.id",
            source.table()
        ))
        .bind(ids)
        .bind(quantities)
        .bind(hours)
        .execute(&mut *conn)
        .await?
        .rows_affected();
    }

    tracing::debug!(
        workorder_id,
        process_id,
        rows = rows.len(),
        rewritten,
        cumulative_quantity = totals.quantity,
        "partition recomputed"
    );
    Ok(totals)
}

/// Recomputes when the report belongs to a partition; RD samples have none.
pub async fn recompute_for(
    conn: &mut PgConnection,
    workorder_id: Option<i64>,
    process_id: Option<i64>,
    policy: CountPolicy,
) -> CoreResult<Option<Cumulative>> {
    match (workorder_id, process_id) {
        (Some(w), Some(p)) => recompute(conn, w, p, policy).await.map(Some),
        _ => Ok(None),
    }
}

/// Recomputes each distinct partition once, in `process_id` order so concurrent callers lock
/// partitions in the same sequence.
pub async fn recompute_partitions(
    conn: &mut PgConnection,
    partitions: impl IntoIterator<Item = (i64, i64)>,
    policy: CountPolicy,
) -> CoreResult<usize> {
    let ordered: BTreeSet<(i64, i64)> = partitions
        .into_iter()
        .map(|(workorder_id, process_id)| (process_id, workorder_id))
        .collect();
    for (process_id, workorder_id) in &ordered {
        recompute(conn, *workorder_id, *process_id, policy).await?;
    }
    Ok(ordered.len())
}

/// Recomputes every partition of every work-order that is not archived. Needed whenever the
/// counting policy itself changes, since stored snapshots were taken under the old one.
pub async fn recompute_live(conn: &mut PgConnection, policy: CountPolicy) -> CoreResult<usize> {
    let partitions: Vec<(i64, i64)> = sqlx::query_as(
        r#"SELECT p.workorder_id, p.process_id
           FROM workorder_process p
           JOIN workorder w ON w.workorder_id = p.workorder_id
           WHERE w.status <> 'archived'"#,
    )
    .fetch_all(&mut *conn)
    .await?;
    let count = recompute_partitions(conn, partitions, policy).await?;
    tracing::info!(partitions = count, count_pending = policy.count_pending, "live partitions recomputed");
    Ok(count)
}

/// Live totals of the counted reports in one partition.
pub async fn cumulative(
    conn: &mut PgConnection,
    workorder_id: i64,
    process_id: i64,
    policy: CountPolicy,
) -> CoreResult<Cumulative> {
    let (quantity, hours): (i64, Decimal) = sqlx::query_as(&format!(
        "SELECT COALESCE(SUM(quantity), 0)::BIGINT, COALESCE(SUM(hours), 0)::NUMERIC \
         FROM production_report_all \
         WHERE workorder_id = $1 AND process_id = $2 AND {}",
        policy.sql_predicate()
    ))
    .bind(workorder_id)
    .bind(process_id)
    .fetch_one(conn)
    .await?;
    Ok(Cumulative { quantity, hours })
}

#[derive(Debug, Clone, Serialize, FromRow)]
pub struct ProcessCumulative {
    pub process_id: i64,
    pub name: String,
    pub seq: i32,
    pub planned_quantity: i64,
    pub cumulative_quantity: i64,
    pub cumulative_hours: Decimal,
}

/// Per-process totals over the counted reports `scopes` lets the caller see.
fn workorder_cumulative_query(
    workorder_id: i64,
    policy: CountPolicy,
    scopes: &AccessScopes,
) -> QueryBuilder<'static, Postgres> {
    let mut qb = QueryBuilder::<Postgres>::new(format!(
        "SELECT p.process_id, p.name, p.seq, \
                COALESCE(p.planned_quantity, w.planned_quantity) AS planned_quantity, \
                COALESCE(SUM(r.quantity), 0)::BIGINT AS cumulative_quantity, \
                COALESCE(SUM(r.hours), 0)::NUMERIC AS cumulative_hours \
         FROM workorder_process p \
         JOIN workorder w ON w.workorder_id = p.workorder_id \
         LEFT JOIN (SELECT process_id, quantity, hours FROM production_report_all \
                    WHERE {} AND ",
        policy.sql_predicate()
    ));
    scopes.push_predicate(&mut qb);
    qb.push(") r ON r.process_id = p.process_id WHERE p.workorder_id = ")
        .push_bind(workorder_id)
        .push(
            " GROUP BY p.process_id, p.name, p.seq, p.planned_quantity, w.planned_quantity \
             ORDER BY p.seq",
        );
    qb
}

/// Per-process totals for a work-order, including processes with no reports yet. Only reports
/// the actor may see contribute; an actor without any work permission is refused outright.
pub async fn workorder_cumulative(
    conn: &mut PgConnection,
    actor: &Actor,
    workorder_id: i64,
    policy: CountPolicy,
) -> CoreResult<Vec<ProcessCumulative>> {
    let rows = permission::load_permissions(conn, actor).await?;
    let scopes = AccessScopes::resolve(actor, &rows);
    if scopes.is_denied_everywhere() {
        return Err(CoreError::denied(format!(
            "{} has no work permission rows",
            actor.username
        )));
    }

    let visible: Option<(i64,)> = sqlx::query_as(
        "SELECT workorder_id FROM workorder \
         WHERE workorder_id = $1 AND is_visible AND status <> 'archived'",
    )
    .bind(workorder_id)
    .fetch_optional(&mut *conn)
    .await?;
    if visible.is_none() {
        return Err(CoreError::not_found("work-order", workorder_id));
    }

    let mut qb = workorder_cumulative_query(workorder_id, policy, &scopes);
    let processes = qb
        .build_query_as::<ProcessCumulative>()
        .fetch_all(conn)
        .await?;
    Ok(processes)
}
