// src/services/completion.rs
//
// Dual-accumulator completion. The verdict is pure; the store side wraps both aggregate reads and
// the status transition for one work-order in a serializable transaction.

use chrono::{DateTime, FixedOffset, Utc};
use serde::Serialize;
use serde_json::json;
use sqlx::{FromRow, PgConnection, PgPool};
use tokio::time::Instant;

use crate::db::locks::try_lock_workorder;
use crate::error::{CoreError, CoreResult};
use crate::models::work_order::WORKORDER_COLUMNS;
use crate::models::{CompletionCheckConfig, ReportSource, WorkOrder, WorkOrderStatus};
use crate::services::accumulator::{self, CountPolicy};
use crate::services::audit::{self, AuditTarget};
use crate::services::notify::{CompletionPath, CoreEvent, Notifier};
use crate::services::permission::Actor;

// ─────────────────────────────────────────────────────────────────────────────
// Verdict
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Aggregates {
    /// Process-indexed: last cumulative snapshot of each partition, summed.
    pub q_proc: i64,
    /// Source-indexed: raw sum over counted fill-work reports.
    pub q_fill: i64,
}

impl Aggregates {
    pub fn agree_within(&self, tolerance: i64) -> bool {
        (self.q_proc - self.q_fill).abs() <= tolerance
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EvaluationInput {
    pub planned_quantity: i64,
    pub manual_completion: bool,
    pub final_process_approved: bool,
    pub streak: i32,
    pub aggregates: Aggregates,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "verdict", rename_all = "snake_case")]
pub enum Verdict {
    Complete { path: CompletionPath },
    /// Both paths agree and at least one is short of the plan.
    NotYet,
    /// Aggregates disagree beyond tolerance; `streak` consecutive ticks so far.
    Disagree { streak: i32 },
    Alert { streak: i32 },
}

impl Verdict {
    pub fn completes(&self) -> bool {
        matches!(self, Self::Complete { .. })
    }

    pub fn next_streak(&self) -> i32 {
        match self {
            Self::Disagree { streak } | Self::Alert { streak } => *streak,
            Self::Complete { .. } | Self::NotYet => 0,
        }
    }
}

/// Decides one tick for one work-order.
///
/// A human-set manual flag with an approved report on the final process completes regardless of
/// the aggregates. Otherwise both aggregates must agree within `tolerance` and reach the plan.
pub fn evaluate(input: &EvaluationInput, tolerance: i64, alert_after_ticks: i32) -> Verdict {
    if input.manual_completion && input.final_process_approved {
        return Verdict::Complete {
            path: CompletionPath::Manual,
        };
    }

    let agg = input.aggregates;
    if !agg.agree_within(tolerance) {
        let streak = input.streak.saturating_add(1);
        return if streak >= alert_after_ticks {
            Verdict::Alert { streak }
        } else {
            Verdict::Disagree { streak }
        };
    }

    if agg.q_proc >= input.planned_quantity && agg.q_fill >= input.planned_quantity {
        Verdict::Complete {
            path: CompletionPath::Quantity,
        }
    } else {
        Verdict::NotYet
    }
}

/// A counted report of the work-order, in the order the tipping scan walks them.
#[derive(Debug, Clone, PartialEq, Eq, FromRow)]
pub struct CountedReport {
    pub source: ReportSource,
    pub report_id: i64,
    pub report_time: DateTime<Utc>,
    pub quantity: i64,
}

/// First report at which both running aggregates reach `planned`.
pub fn tipping_report<'a>(
    counted: &'a [CountedReport],
    fill_work_sources: &[ReportSource],
    planned: i64,
) -> Option<&'a CountedReport> {
    let mut q_proc = 0i64;
    let mut q_fill = 0i64;
    let mut ordered: Vec<&CountedReport> = counted.iter().collect();
    ordered.sort_by(|a, b| (a.report_time, a.report_id).cmp(&(b.report_time, b.report_id)));

    ordered.into_iter().find(|r| {
        q_proc += r.quantity;
        if fill_work_sources.contains(&r.source) {
            q_fill += r.quantity;
        }
        q_proc >= planned && q_fill >= planned
    })
}

// ─────────────────────────────────────────────────────────────────────────────
// Store reads
// ─────────────────────────────────────────────────────────────────────────────

pub async fn load_aggregates(
    conn: &mut PgConnection,
    workorder_id: i64,
    policy: CountPolicy,
    fill_work_sources: &[ReportSource],
) -> CoreResult<Aggregates> {
    let predicate = policy.sql_predicate();

    let (q_proc,): (i64,) = sqlx::query_as(&format!(
        r#"SELECT COALESCE(SUM(last_cumulative), 0)::BIGINT FROM (
               SELECT DISTINCT ON (process_id) cumulative_quantity AS last_cumulative
               FROM production_report_all
               WHERE workorder_id = $1 AND process_id IS NOT NULL AND {predicate}
               ORDER BY process_id, report_time DESC, report_id DESC
           ) AS partitions"#
    ))
    .bind(workorder_id)
    .fetch_one(&mut *conn)
    .await?;

    let (q_fill,): (i64,) = sqlx::query_as(&format!(
        r#"SELECT COALESCE(SUM(quantity), 0)::BIGINT FROM production_report_all
           WHERE workorder_id = $1 AND source = ANY($2) AND {predicate}"#
    ))
    .bind(workorder_id)
    .bind(fill_work_sources)
    .fetch_one(&mut *conn)
    .await?;

    Ok(Aggregates { q_proc, q_fill })
}

/// Raw sum of counted reports across every source; the legacy single-accumulator figure.
pub async fn raw_total(conn: &mut PgConnection, workorder_id: i64, policy: CountPolicy) -> CoreResult<i64> {
    let (total,): (i64,) = sqlx::query_as(&format!(
        "SELECT COALESCE(SUM(quantity), 0)::BIGINT FROM production_report_all \
         WHERE workorder_id = $1 AND {}",
        policy.sql_predicate()
    ))
    .bind(workorder_id)
    .fetch_one(conn)
    .await?;
    Ok(total)
}

async fn final_process_approved(conn: &mut PgConnection, workorder_id: i64) -> CoreResult<bool> {
    let (approved,): (bool,) = sqlx::query_as(
        r#"SELECT EXISTS (
               SELECT 1 FROM production_report_all r
               JOIN workorder_process p ON p.process_id = r.process_id
               WHERE r.workorder_id = $1
                 AND r.approval_state = 'approved'
                 AND r.report_type = 'normal'
                 AND r.archived_at IS NULL
                 AND p.seq = (SELECT MAX(seq) FROM workorder_process WHERE workorder_id = $1)
           )"#,
    )
    .bind(workorder_id)
    .fetch_one(conn)
    .await?;
    Ok(approved)
}

async fn counted_reports(
    conn: &mut PgConnection,
    workorder_id: i64,
    policy: CountPolicy,
) -> CoreResult<Vec<CountedReport>> {
    let rows = sqlx::query_as::<_, CountedReport>(&format!(
        "SELECT source, report_id, report_time, quantity FROM production_report_all \
         WHERE workorder_id = $1 AND {} ORDER BY report_time, report_id",
        policy.sql_predicate()
    ))
    .bind(workorder_id)
    .fetch_all(conn)
    .await?;
    Ok(rows)
}

async fn lock_workorder_row(conn: &mut PgConnection, workorder_id: i64) -> CoreResult<WorkOrder> {
    sqlx::query_as::<_, WorkOrder>(&format!(
        "SELECT {WORKORDER_COLUMNS} FROM workorder WHERE workorder_id = $1 FOR UPDATE"
    ))
    .bind(workorder_id)
    .fetch_optional(conn)
    .await?
    .ok_or_else(|| CoreError::not_found("work-order", workorder_id))
}

// ─────────────────────────────────────────────────────────────────────────────
// Evaluation
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum Outcome {
    Completed {
        path: CompletionPath,
        tipping_report_id: Option<i64>,
    },
    Waiting,
    Disagreeing { streak: i32 },
    Alerted { q_proc: i64, q_fill: i64 },
    /// Another transaction holds the work-order lock, or its status moved on.
    Skipped,
}

/// Evaluates one work-order in its own serializable transaction.
pub async fn evaluate_workorder(
    pool: &PgPool,
    cfg: &CompletionCheckConfig,
    workorder_id: i64,
    notifier: &dyn Notifier,
) -> CoreResult<Outcome> {
    let mut tx = pool.begin().await?;
    sqlx::query("SET TRANSACTION ISOLATION LEVEL SERIALIZABLE")
        .execute(&mut *tx)
        .await?;

    if !try_lock_workorder(&mut tx, workorder_id).await? {
        return Ok(Outcome::Skipped);
    }
    let wo = lock_workorder_row(&mut tx, workorder_id).await?;
    if wo.status != WorkOrderStatus::InProduction || wo.needs_reconciliation {
        return Ok(Outcome::Skipped);
    }

    let policy = CountPolicy::from_config(cfg);
    let aggregates = load_aggregates(&mut tx, workorder_id, policy, &cfg.fill_work_sources).await?;
    let input = EvaluationInput {
        planned_quantity: wo.planned_quantity,
        manual_completion: wo.manual_completion,
        final_process_approved: final_process_approved(&mut tx, workorder_id).await?,
        streak: wo.inconsistency_streak,
        aggregates,
    };
    let verdict = evaluate(&input, cfg.inconsistency_tolerance, cfg.inconsistency_ticks);

    let outcome = match verdict {
        Verdict::Complete { path } => {
            let tipping = match path {
                CompletionPath::Quantity => {
                    let counted = counted_reports(&mut tx, workorder_id, policy).await?;
                    tipping_report(&counted, &cfg.fill_work_sources, wo.planned_quantity).cloned()
                }
                CompletionPath::Manual => None,
            };

            let (completed_at,): (DateTime<Utc>,) = sqlx::query_as(
                r#"UPDATE workorder SET
                       status = 'completed', completed_at = now(), inconsistency_streak = 0,
                       last_evaluated_at = now(), updated_at = now()
                   WHERE workorder_id = $1 AND status = 'in_production'
                   RETURNING completed_at"#,
            )
            .bind(workorder_id)
            .fetch_one(&mut *tx)
            .await?;

            if let Some(report) = &tipping {
                sqlx::query(&format!(
                    "UPDATE {} SET auto_completed = TRUE, completion_time = $2, updated_at = now() \
                     WHERE report_id = $1",
                    report.source.table()
                ))
                .bind(report.report_id)
                .bind(completed_at)
                .execute(&mut *tx)
                .await?;
            }

            audit::record_operation(
                &mut tx,
                AuditTarget::Workorder(workorder_id),
                "completed",
                "system:completion",
                json!({
                    "path": path,
                    "q_proc": aggregates.q_proc,
                    "q_fill": aggregates.q_fill,
                    "planned_quantity": wo.planned_quantity,
                    "tipping_report_id": tipping.as_ref().map(|r| r.report_id),
                }),
            )
            .await?;
            tx.commit().await?;

            tracing::info!(
                workorder_id,
                path = ?path,
                q_proc = aggregates.q_proc,
                q_fill = aggregates.q_fill,
                tipping_report_id = ?tipping.as_ref().map(|r| r.report_id),
                "work-order completed"
            );
            if cfg.enable_notifications {
                notifier
                    .notify(&CoreEvent::WorkOrderCompleted {
                        workorder_id,
                        order_number: wo.order_number.clone(),
                        path,
                        tipping_report_id: tipping.as_ref().map(|r| r.report_id),
                        completed_at,
                    })
                    .await;
            }
            Outcome::Completed {
                path,
                tipping_report_id: tipping.map(|r| r.report_id),
            }
        }
        Verdict::Alert { streak } => {
            sqlx::query(
                r#"UPDATE workorder SET
                       inconsistency_streak = $2, needs_reconciliation = TRUE,
                       last_evaluated_at = now(), updated_at = now()
                   WHERE workorder_id = $1"#,
            )
            .bind(workorder_id)
            .bind(streak)
            .execute(&mut *tx)
            .await?;
            audit::record_operation(
                &mut tx,
                AuditTarget::Workorder(workorder_id),
                "inconsistency_alert",
                "system:completion",
                json!({ "q_proc": aggregates.q_proc, "q_fill": aggregates.q_fill, "streak": streak }),
            )
            .await?;
            tx.commit().await?;

            let alert = CoreError::InconsistencyAlert {
                workorder_id,
                q_proc: aggregates.q_proc,
                q_fill: aggregates.q_fill,
            };
            tracing::error!(workorder_id, streak, error = %alert, "work-order needs reconciliation");
            notifier
                .notify(&CoreEvent::InconsistencyAlert {
                    workorder_id,
                    q_proc: aggregates.q_proc,
                    q_fill: aggregates.q_fill,
                    streak,
                })
                .await;
            Outcome::Alerted {
                q_proc: aggregates.q_proc,
                q_fill: aggregates.q_fill,
            }
        }
        Verdict::Disagree { .. } | Verdict::NotYet => {
            sqlx::query(
                r#"UPDATE workorder SET inconsistency_streak = $2, last_evaluated_at = now()
                   WHERE workorder_id = $1"#,
            )
            .bind(workorder_id)
            .bind(verdict.next_streak())
            .execute(&mut *tx)
            .await?;
            tx.commit().await?;

            if let Verdict::Disagree { streak } = verdict {
                tracing::warn!(
                    workorder_id,
                    streak,
                    q_proc = aggregates.q_proc,
                    q_fill = aggregates.q_fill,
                    "accumulators disagree"
                );
                Outcome::Disagreeing { streak }
            } else {
                Outcome::Waiting
            }
        }
    };
    Ok(outcome)
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct BatchStats {
    pub scanned: u64,
    pub completed: u64,
    pub errored: u64,
    pub skipped: u64,
    /// Candidates left for the next tick because the soft deadline passed.
    pub deferred: u64,
    pub window_closed: bool,
}

/// Evaluates up to `max_workorders_per_check` work-orders in production, least recently
/// evaluated first. No new work-order is started after `soft_deadline`.
pub async fn evaluate_batch(
    pool: &PgPool,
    cfg: &CompletionCheckConfig,
    tz: FixedOffset,
    now: DateTime<Utc>,
    soft_deadline: Instant,
    notifier: &dyn Notifier,
) -> CoreResult<BatchStats> {
    let mut stats = BatchStats::default();
    if !cfg.daily_window().is_open_at(now, tz) {
        stats.window_closed = true;
        tracing::info!(
            window_start = %cfg.window_start,
            window_end = %cfg.window_end,
            "daily window closed; evaluation skipped"
        );
        return Ok(stats);
    }

    let candidates: Vec<(i64,)> = sqlx::query_as(
        r#"SELECT workorder_id FROM workorder
           WHERE status = 'in_production' AND NOT needs_reconciliation AND is_visible
           ORDER BY last_evaluated_at NULLS FIRST, updated_at
           LIMIT $1"#,
    )
    .bind(i64::from(cfg.max_workorders_per_check))
    .fetch_all(pool)
    .await?;

    let total = candidates.len() as u64;
    for (workorder_id,) in candidates {
        if Instant::now() >= soft_deadline {
            stats.deferred = total - stats.scanned;
            tracing::warn!(deferred = stats.deferred, "soft deadline reached; resuming next tick");
            break;
        }
        stats.scanned += 1;
        match evaluate_workorder(pool, cfg, workorder_id, notifier).await {
            Ok(Outcome::Completed { .. }) => stats.completed += 1,
            Ok(Outcome::Alerted { .. }) => stats.errored += 1,
            Ok(Outcome::Skipped) => stats.skipped += 1,
            Ok(Outcome::Waiting | Outcome::Disagreeing { .. }) => {}
            Err(err) => {
                stats.errored += 1;
                tracing::warn!(workorder_id, error = %err, "evaluation failed; retrying next tick");
            }
        }
    }
    Ok(stats)
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct LegacyCheckStats {
    pub scanned: u64,
    /// Work-orders the raw sum alone would have completed.
    pub would_complete: u64,
    pub divergent: u64,
    pub errored: u64,
}

/// Single-accumulator comparison check. Reads only; divergences are logged and counted.
pub async fn legacy_check(pool: &PgPool, cfg: &CompletionCheckConfig) -> CoreResult<LegacyCheckStats> {
    let candidates = sqlx::query_as::<_, WorkOrder>(&format!(
        "SELECT {WORKORDER_COLUMNS} FROM workorder \
         WHERE status = 'in_production' AND is_visible \
         ORDER BY last_evaluated_at NULLS FIRST, updated_at LIMIT $1"
    ))
    .bind(i64::from(cfg.max_workorders_per_check))
    .fetch_all(pool)
    .await?;

    let policy = CountPolicy::from_config(cfg);
    let mut stats = LegacyCheckStats::default();
    for wo in candidates {
        stats.scanned += 1;
        let checked = legacy_verdict(pool, cfg, &wo, policy).await;
        match checked {
            Ok((raw, verdict)) => {
                let legacy_completes = raw >= wo.planned_quantity;
                if legacy_completes {
                    stats.would_complete += 1;
                }
                if legacy_completes != verdict.completes() {
                    stats.divergent += 1;
                    tracing::warn!(
                        workorder_id = wo.workorder_id,
                        raw_total = raw,
                        planned_quantity = wo.planned_quantity,
                        legacy_completes,
                        dual_verdict = ?verdict,
                        "legacy completion check diverges"
                    );
                }
            }
            Err(err) => {
                stats.errored += 1;
                tracing::warn!(workorder_id = wo.workorder_id, error = %err, "legacy check failed");
            }
        }
    }
    tracing::info!(
        scanned = stats.scanned,
        would_complete = stats.would_complete,
        divergent = stats.divergent,
        "legacy completion check finished"
    );
    Ok(stats)
}

async fn legacy_verdict(
    pool: &PgPool,
    cfg: &CompletionCheckConfig,
    wo: &WorkOrder,
    policy: CountPolicy,
) -> CoreResult<(i64, Verdict)> {
    let mut conn = pool.acquire().await?;
    let raw = raw_total(&mut conn, wo.workorder_id, policy).await?;
    let input = EvaluationInput {
        planned_quantity: wo.planned_quantity,
        manual_completion: wo.manual_completion,
        final_process_approved: final_process_approved(&mut conn, wo.workorder_id).await?,
        streak: wo.inconsistency_streak,
        aggregates: load_aggregates(&mut conn, wo.workorder_id, policy, &cfg.fill_work_sources)
            .await?,
    };
    Ok((raw, evaluate(&input, cfg.inconsistency_tolerance, cfg.inconsistency_ticks)))
}

// ─────────────────────────────────────────────────────────────────────────────
// Admin actions
// ─────────────────────────────────────────────────────────────────────────────

pub async fn set_manual_completion(
    pool: &PgPool,
    actor: &Actor,
    workorder_id: i64,
    flag: bool,
) -> CoreResult<WorkOrder> {
    actor.require_superuser()?;
    let mut tx = pool.begin().await?;
    let wo = lock_workorder_row(&mut tx, workorder_id).await?;
    if !matches!(wo.status, WorkOrderStatus::Pending | WorkOrderStatus::InProduction) {
        return Err(CoreError::conflict(format!(
            "work-order {workorder_id} is {}; the manual flag no longer applies",
            wo.status
        )));
    }

    let updated = sqlx::query_as::<_, WorkOrder>(&format!(
        "UPDATE workorder SET manual_completion = $2, updated_at = now() \
         WHERE workorder_id = $1 RETURNING {WORKORDER_COLUMNS}"
    ))
    .bind(workorder_id)
    .bind(flag)
    .fetch_one(&mut *tx)
    .await?;
    audit::record_operation(
        &mut tx,
        AuditTarget::Workorder(workorder_id),
        "manual_completion",
        &actor.username,
        json!({ "manual_completion": flag }),
    )
    .await?;
    tx.commit().await?;
    tracing::info!(workorder_id, flag, actor = %actor.username, "manual completion flag set");
    Ok(updated)
}

/// Rewrites every partition's snapshots and clears the alert so evaluation resumes.
pub async fn reconcile(
    pool: &PgPool,
    actor: &Actor,
    workorder_id: i64,
    cfg: &CompletionCheckConfig,
) -> CoreResult<WorkOrder> {
    actor.require_superuser()?;
    let mut tx = pool.begin().await?;
    let wo = lock_workorder_row(&mut tx, workorder_id).await?;
    if wo.status == WorkOrderStatus::Archived {
        return Err(CoreError::not_found("work-order", workorder_id));
    }

    let process_ids: Vec<(i64,)> =
        sqlx::query_as("SELECT process_id FROM workorder_process WHERE workorder_id = $1 ORDER BY seq")
            .bind(workorder_id)
            .fetch_all(&mut *tx)
            .await?;
    let policy = CountPolicy::from_config(cfg);
    for (process_id,) in &process_ids {
        accumulator::recompute(&mut tx, workorder_id, *process_id, policy).await?;
    }
    let after = load_aggregates(&mut tx, workorder_id, policy, &cfg.fill_work_sources).await?;

    let updated = sqlx::query_as::<_, WorkOrder>(&format!(
        "UPDATE workorder SET needs_reconciliation = FALSE, inconsistency_streak = 0, \
         updated_at = now() WHERE workorder_id = $1 RETURNING {WORKORDER_COLUMNS}"
    ))
    .bind(workorder_id)
    .fetch_one(&mut *tx)
    .await?;
    audit::record_operation(
        &mut tx,
        AuditTarget::Workorder(workorder_id),
        "reconciled",
        &actor.username,
        json!({
            "partitions": process_ids.len(),
            "q_proc": after.q_proc,
            "q_fill": after.q_fill,
            "previous_streak": wo.inconsistency_streak,
        }),
    )
    .await?;
    tx.commit().await?;
    tracing::info!(
        workorder_id,
        q_proc = after.q_proc,
        q_fill = after.q_fill,
        actor = %actor.username,
        "work-order reconciled"
    );
    Ok(updated)
}

/// Moves a completed, not yet archived work-order back into production.
pub async fn revert_completion(pool: &PgPool, actor: &Actor, workorder_id: i64) -> CoreResult<WorkOrder> {
    actor.require_superuser()?;
    let mut tx = pool.begin().await?;
    if !try_lock_workorder(&mut tx, workorder_id).await? {
        return Err(CoreError::conflict(format!("work-order {workorder_id} is busy")));
    }
    let wo = lock_workorder_row(&mut tx, workorder_id).await?;
    if wo.status != WorkOrderStatus::Completed {
        return Err(CoreError::conflict(format!(
            "work-order {workorder_id} is {}, not completed",
            wo.status
        )));
    }

    for source in ReportSource::ALL {
        sqlx::query(&format!(
            "UPDATE {} SET auto_completed = FALSE, completion_time = NULL, updated_at = now() \
             WHERE workorder_id = $1 AND auto_completed",
            source.table()
        ))
        .bind(workorder_id)
        .execute(&mut *tx)
        .await?;
    }
    let updated = sqlx::query_as::<_, WorkOrder>(&format!(
        "UPDATE workorder SET status = 'in_production', completed_at = NULL, \
         manual_completion = FALSE, inconsistency_streak = 0, updated_at = now() \
         WHERE workorder_id = $1 RETURNING {WORKORDER_COLUMNS}"
    ))
    .bind(workorder_id)
    .fetch_one(&mut *tx)
    .await?;
    audit::record_operation(
        &mut tx,
        AuditTarget::Workorder(workorder_id),
        "completion_reverted",
        &actor.username,
        json!({ "completed_at": wo.completed_at }),
    )
    .await?;
    tx.commit().await?;
    tracing::warn!(workorder_id, actor = %actor.username, "completion reverted");
    Ok(updated)
}
