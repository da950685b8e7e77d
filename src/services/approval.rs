// src/services/approval.rs

use chrono::{DateTime, Duration, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use serde_json::json;
use sqlx::{FromRow, PgConnection, PgPool};

use crate::error::{CoreError, CoreResult};
use crate::models::{
    ApprovalState, CompletionCheckConfig, Report, ReportRow, ReportSource, ReportType,
};
use crate::services::accumulator::{self, CountPolicy};
use crate::services::audit::{self, AuditTarget};
use crate::services::permission::{self, Actor};
use crate::services::report_store::{fetch_row, lock_row};

pub const AUTO_APPROVER: &str = "system:auto-approve";

/// Upper bound on reports promoted by one auto-approval run.
const AUTO_APPROVE_BATCH: i64 = 500;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Decision {
    Approve,
    Reject,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ApprovalRequest {
    pub decision: Decision,
    /// Mandatory when rejecting.
    pub reason: Option<String>,
}

/// Checks that `request` may move a report out of `current`; returns the new state and the
/// trimmed rejection reason.
pub fn validate_decision(
    current: ApprovalState,
    open_session: bool,
    request: &ApprovalRequest,
) -> CoreResult<(ApprovalState, Option<String>)> {
    if open_session {
        return Err(CoreError::invalid("an open onsite session cannot be decided"));
    }
    if current != ApprovalState::Pending {
        return Err(CoreError::conflict(format!("report is already {current}")));
    }
    match request.decision {
        Decision::Approve => Ok((ApprovalState::Approved, None)),
        Decision::Reject => {
            let reason = request
                .reason
                .as_deref()
                .map(str::trim)
                .filter(|r| !r.is_empty())
                .ok_or_else(|| CoreError::invalid("a rejection needs a reason"))?;
            Ok((ApprovalState::Rejected, Some(reason.to_string())))
        }
    }
}

async fn write_decision(
    conn: &mut PgConnection,
    source: ReportSource,
    report_id: i64,
    state: ApprovalState,
    approver: &str,
    reason: Option<&str>,
) -> CoreResult<()> {
    sqlx::query(&format!(
        r#"UPDATE {} SET
               approval_state = $2, approved_at = now(), approver = $3,
               remarks = CASE
                   WHEN $4::TEXT IS NULL THEN remarks
                   WHEN remarks = '' THEN $4
                   ELSE remarks || E'\n' || $4
               END,
               updated_at = now()
           WHERE report_id = $1 AND approval_state = 'pending'"#,
        source.table()
    ))
    .bind(report_id)
    .bind(state)
    .bind(approver)
    .bind(reason.map(|r| format!("rejected: {r}")))
    .execute(conn)
    .await?;
    Ok(())
}

/// Manual approval or rejection by an authorized actor.
pub async fn decide(
    pool: &PgPool,
    actor: &Actor,
    report_id: i64,
    request: ApprovalRequest,
    cfg: &CompletionCheckConfig,
) -> CoreResult<Report> {
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

    let (state, reason) = validate_decision(row.approval_state, row.is_open_session(), &request)?;

    write_decision(
        &mut tx,
        row.source,
        report_id,
        state,
        &actor.username,
        reason.as_deref(),
    )
    .await?;
    accumulator::recompute_for(
        &mut tx,
        row.workorder_id,
        row.process_id,
        CountPolicy::from_config(cfg),
    )
    .await?;
    audit::record_operation(
        &mut tx,
        AuditTarget::Report {
            source: row.source,
            report_id,
        },
        state.as_str(),
        &actor.username,
        json!({ "from": row.approval_state, "to": state, "reason": reason }),
    )
    .await?;

    let report = Report::from(fetch_row(&mut tx, report_id).await?);
    tx.commit().await?;
    tracing::info!(report_id, source = %row.source, state = %state, approver = %actor.username, "report decided");
    Ok(report)
}

// ─────────────────────────────────────────────────────────────────────────────
// Auto-approval
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, FromRow)]
pub struct AutoApprovalCandidate {
    pub source: ReportSource,
    pub report_id: i64,
    pub workorder_id: Option<i64>,
    pub process_id: Option<i64>,
    pub report_type: ReportType,
    pub quantity: i64,
    pub hours: Decimal,
    /// Process plan, falling back to the work-order plan.
    pub planned_quantity: Option<i64>,
}

impl AutoApprovalCandidate {
    /// The candidate as the locked row now reads; only the plan is carried over from the scan.
    pub fn refreshed(&self, row: &ReportRow) -> Self {
        Self {
            source: row.source,
            report_id: row.report_id,
            workorder_id: row.workorder_id,
            process_id: row.process_id,
            report_type: row.report_type,
            quantity: row.quantity,
            hours: row.hours,
            planned_quantity: self.planned_quantity,
        }
    }
}

/// Non-zero quantity or hours, and no more quantity than the partition still has room for.
pub fn passes_sanity(candidate: &AutoApprovalCandidate, cumulative_quantity: i64, tolerance: i64) -> bool {
    if candidate.quantity == 0 && candidate.hours.is_zero() {
        return false;
    }
    if candidate.report_type == ReportType::RdSample {
        return true;
    }
    match candidate.planned_quantity {
        Some(planned) => candidate.quantity <= planned - cumulative_quantity + tolerance,
        None => false,
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct AutoApprovalStats {
    pub scanned: u64,
    pub approved: u64,
    pub skipped: u64,
    pub errored: u64,
}

/// Promotes old enough pending reports that pass the sanity rule, one transaction each.
pub async fn auto_approve(
    pool: &PgPool,
    cfg: &CompletionCheckConfig,
    now: DateTime<Utc>,
) -> CoreResult<AutoApprovalStats> {
    let cutoff = now - Duration::minutes(i64::from(cfg.auto_approve_min_age_minutes));
    let enabled_sources: Vec<ReportSource> = ReportSource::ALL
        .into_iter()
        .filter(|s| cfg.auto_approval_enabled_for(*s))
        .collect();

    let candidates = sqlx::query_as::<_, AutoApprovalCandidate>(
        r#"SELECT r.source, r.report_id, r.workorder_id, r.process_id, r.report_type,
                  r.quantity, r.hours,
                  COALESCE(p.planned_quantity, w.planned_quantity) AS planned_quantity
           FROM production_report_all r
           LEFT JOIN workorder_process p ON p.process_id = r.process_id
           LEFT JOIN workorder w ON w.workorder_id = r.workorder_id
           WHERE r.approval_state = 'pending'
             AND r.archived_at IS NULL
             AND r.created_at <= $1
             AND r.source = ANY($2)
             AND NOT (r.source = 'onsite' AND r.stopped_at IS NULL)
           ORDER BY r.report_time, r.report_id
           LIMIT $3"#,
    )
    .bind(cutoff)
    .bind(&enabled_sources)
    .bind(AUTO_APPROVE_BATCH)
    .fetch_all(pool)
    .await?;

    let mut stats = AutoApprovalStats::default();
    let policy = CountPolicy::from_config(cfg);
    for candidate in candidates {
        stats.scanned += 1;
        match approve_one(pool, &candidate, cfg.auto_approve_tolerance, policy).await {
            Ok(true) => stats.approved += 1,
            Ok(false) => stats.skipped += 1,
            Err(err) => {
                stats.errored += 1;
                tracing::warn!(report_id = candidate.report_id, error = %err, "auto-approval failed");
            }
        }
    }

    tracing::info!(
        scanned = stats.scanned,
        approved = stats.approved,
        skipped = stats.skipped,
        errored = stats.errored,
        "auto-approval finished"
    );
    Ok(stats)
}

async fn approve_one(
    pool: &PgPool,
    candidate: &AutoApprovalCandidate,
    tolerance: i64,
    policy: CountPolicy,
) -> CoreResult<bool> {
    let mut tx = pool.begin().await?;
    let row = lock_row(&mut tx, candidate.report_id).await?;
    if row.approval_state != ApprovalState::Pending || row.is_open_session() {
        return Ok(false);
    }
    // The row may have been edited since the scan.
    let current = candidate.refreshed(&row);

    // The room left is measured against approved quantity only.
    let cumulative = match (row.workorder_id, row.process_id) {
        (Some(w), Some(p)) => {
            accumulator::cumulative(&mut tx, w, p, CountPolicy::APPROVED_ONLY)
                .await?
                .quantity
        }
        _ => 0,
    };
    if !passes_sanity(&current, cumulative, tolerance) {
        tracing::debug!(
            report_id = row.report_id,
            quantity = current.quantity,
            cumulative,
            "auto-approval sanity check failed"
        );
        return Ok(false);
    }

    write_decision(
        &mut tx,
        row.source,
        row.report_id,
        ApprovalState::Approved,
        AUTO_APPROVER,
        None,
    )
    .await?;
    accumulator::recompute_for(&mut tx, row.workorder_id, row.process_id, policy).await?;
    audit::record_operation(
        &mut tx,
        AuditTarget::Report {
            source: row.source,
            report_id: row.report_id,
        },
        "approved",
        AUTO_APPROVER,
        json!({ "from": "pending", "to": "approved", "cumulative_before": cumulative }),
    )
    .await?;
    tx.commit().await?;
    Ok(true)
}
