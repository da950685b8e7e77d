// src/services/classifier.rs

use serde::Serialize;
use sqlx::PgPool;

use crate::error::{CoreError, CoreResult};
use crate::models::{ReportSource, ReportType, RD_SAMPLE_PRODUCT_CODE};
use crate::services::accumulator::{self, CountPolicy};
use crate::services::ingest::NewReport;
use crate::services::settings;

/// Absence of a work-order makes a report an RD sample; presence makes it normal.
pub fn classify(report: &mut NewReport) {
    if report.workorder_id.is_none() {
        report.report_type = ReportType::RdSample;
        if report.product_code.trim().is_empty() {
            report.product_code = RD_SAMPLE_PRODUCT_CODE.to_string();
        }
    } else {
        report.report_type = ReportType::Normal;
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ReclassifyCounts {
    pub source: Option<ReportSource>,
    pub marked_rd_sample: u64,
    pub marked_normal: u64,
    pub product_code_filled: u64,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct ReclassifySummary {
    pub per_source: Vec<ReclassifyCounts>,
    /// Partitions whose snapshots were rewritten because a row changed type.
    pub partitions_recomputed: usize,
}

/// `(workorder_id, process_id)` of a changed row, when it belongs to a partition.
type ChangedRow = (Option<i64>, Option<i64>);

fn partitions_of(changed: &[ChangedRow]) -> impl Iterator<Item = (i64, i64)> + '_ {
    changed.iter().filter_map(|row| match row {
        (Some(w), Some(p)) => Some((*w, *p)),
        _ => None,
    })
}

impl ReclassifySummary {
    pub fn total_changed(&self) -> u64 {
        self.per_source
            .iter()
            .map(|c| c.marked_rd_sample + c.marked_normal)
            .sum()
    }
}

/// Repairs historical rows in every variant table. Idempotent: a second run changes nothing.
///
/// SMT and operator tables go first; those are the two tables the legacy migrations covered.
pub async fn reclassify_all(pool: &PgPool) -> CoreResult<ReclassifySummary> {
    let order = [
        ReportSource::SmtProduction,
        ReportSource::OperatorSupplement,
        ReportSource::OnsiteLive,
        ReportSource::ManagerReport,
    ];

    let mut tx = pool.begin().await?;
    let mut summary = ReclassifySummary::default();
    let mut changed: Vec<ChangedRow> = Vec::new();

    for source in order {
        let table = source.table();

        let product_code_filled = sqlx::query(&format!(
            "UPDATE {table} SET product_code = $1, updated_at = now() \
             WHERE workorder_id IS NULL AND btrim(product_code) = ''"
        ))
        .bind(RD_SAMPLE_PRODUCT_CODE)
        .execute(&mut *tx)
        .await?
        .rows_affected();

        let to_rd_sample: Vec<ChangedRow> = sqlx::query_as(&format!(
            "UPDATE {table} SET report_type = 'rd_sample', updated_at = now() \
             WHERE workorder_id IS NULL AND report_type <> 'rd_sample' \
             RETURNING workorder_id, process_id"
        ))
        .fetch_all(&mut *tx)
        .await?;

        let to_normal: Vec<ChangedRow> = sqlx::query_as(&format!(
            "UPDATE {table} SET report_type = 'normal', updated_at = now() \
             WHERE workorder_id IS NOT NULL AND report_type <> 'normal' \
             RETURNING workorder_id, process_id"
        ))
        .fetch_all(&mut *tx)
        .await?;

        let marked_rd_sample = to_rd_sample.len() as u64;
        let marked_normal = to_normal.len() as u64;
        changed.extend(to_rd_sample);
        changed.extend(to_normal);

        tracing::info!(
            source = %source,
            marked_rd_sample,
            marked_normal,
            product_code_filled,
            "reclassified report rows"
        );

        summary.per_source.push(ReclassifyCounts {
            source: Some(source),
            marked_rd_sample,
            marked_normal,
            product_code_filled,
        });
    }

    // A type flip moves quantity in or out of a partition's running totals.
    let policy = CountPolicy::from_config(&settings::load_config(&mut tx).await?);
    summary.partitions_recomputed =
        accumulator::recompute_partitions(&mut tx, partitions_of(&changed), policy).await?;

    tx.commit().await?;
    tracing::info!(
        changed = summary.total_changed(),
        partitions_recomputed = summary.partitions_recomputed,
        "RD-sample reclassification finished"
    );
    Ok(summary)
}

/// Rollback of [`reclassify_all`]: only rows whose RD fields are all empty return to `normal`.
pub async fn revert_reclassification(pool: &PgPool) -> CoreResult<ReclassifySummary> {
    let mut tx = pool.begin().await?;
    let mut summary = ReclassifySummary::default();
    let mut changed: Vec<ChangedRow> = Vec::new();

    for source in [ReportSource::SmtProduction, ReportSource::OperatorSupplement] {
        let table = source.table();
        let reverted: Vec<ChangedRow> = sqlx::query_as(&format!(
            "UPDATE {table} \
                SET report_type = 'normal', \
                    product_code = CASE WHEN product_code = $1 THEN '' ELSE product_code END, \
                    updated_at = now() \
              WHERE report_type = 'rd_sample' \
                AND COALESCE(rd_workorder_number, '') = '' \
                AND COALESCE(rd_product_code, '') = '' \
                AND COALESCE(rd_sample_name, '') = '' \
             RETURNING workorder_id, process_id"
        ))
        .bind(RD_SAMPLE_PRODUCT_CODE)
        .fetch_all(&mut *tx)
        .await?;
        let marked_normal = reverted.len() as u64;
        changed.extend(reverted);

        tracing::warn!(source = %source, marked_normal, "reverted RD-sample classification");
        summary.per_source.push(ReclassifyCounts {
            source: Some(source),
            marked_normal,
            ..Default::default()
        });
    }

    let policy = CountPolicy::from_config(&settings::load_config(&mut tx).await?);
    summary.partitions_recomputed =
        accumulator::recompute_partitions(&mut tx, partitions_of(&changed), policy).await?;

    tx.commit().await?;
    Ok(summary)
}

/// Legacy audit table names and their canonical replacements.
pub const ALLOCATION_TABLE_RENAMES: [(&str, &str); 2] = [
    ("allocation_log", "workorder_allocation_log"),
    ("operation_log", "workorder_operation_log"),
];

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RenameOutcome {
    NothingToDo,
    Renamed,
    ReplacedEmptyCanonical,
}

/// Brings legacy audit tables under their canonical names; safe to re-run.
pub async fn rename_allocation_tables(pool: &PgPool) -> CoreResult<Vec<(String, RenameOutcome)>> {
    let mut tx = pool.begin().await?;
    let mut outcomes = Vec::new();

    for (legacy, canonical) in ALLOCATION_TABLE_RENAMES {
        let legacy_exists = table_exists(&mut tx, legacy).await?;
        let canonical_exists = table_exists(&mut tx, canonical).await?;

        let outcome = match (legacy_exists, canonical_exists) {
            (false, _) => RenameOutcome::NothingToDo,
            (true, false) => {
                sqlx::query(&format!("ALTER TABLE {legacy} RENAME TO {canonical}"))
                    .execute(&mut *tx)
                    .await?;
                RenameOutcome::Renamed
            }
            (true, true) => {
                let (rows,): (i64,) =
                    sqlx::query_as(&format!("SELECT COUNT(*) FROM {canonical}"))
                        .fetch_one(&mut *tx)
                        .await?;
                if rows > 0 {
                    return Err(CoreError::conflict(format!(
                        "both {legacy} and {canonical} hold rows; reconcile manually"
                    )));
                }
                sqlx::query(&format!("DROP TABLE {canonical}"))
                    .execute(&mut *tx)
                    .await?;
                sqlx::query(&format!("ALTER TABLE {legacy} RENAME TO {canonical}"))
                    .execute(&mut *tx)
                    .await?;
                RenameOutcome::ReplacedEmptyCanonical
            }
        };

        tracing::info!(legacy, canonical, outcome = ?outcome, "allocation table repair");
        outcomes.push((canonical.to_string(), outcome));
    }

    tx.commit().await?;
    Ok(outcomes)
}

async fn table_exists(conn: &mut sqlx::PgConnection, name: &str) -> CoreResult<bool> {
    let (exists,): (bool,) = sqlx::query_as("SELECT to_regclass($1) IS NOT NULL")
        .bind(name)
        .fetch_one(conn)
        .await?;
    Ok(exists)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use rust_decimal::Decimal;

    fn report(workorder_id: Option<i64>, product_code: &str) -> NewReport {
        NewReport {
            source: ReportSource::OperatorSupplement,
            workorder_id,
            process_name: "SMT".into(),
            product_code: product_code.into(),
            operator_or_equipment: "OP-1".into(),
            report_time: Utc::now(),
            quantity: 5,
            hours: Decimal::ONE,
            report_type: ReportType::Normal,
            remarks: String::new(),
            abnormal_notes: String::new(),
            rd_workorder_number: None,
            rd_product_code: Some("RDX-1".into()),
            rd_sample_name: None,
            session: None,
        }
    }

    #[test]
    fn missing_workorder_becomes_rd_sample_with_sentinel_product() {
        let mut r = report(None, "");
        classify(&mut r);
        assert_eq!(r.report_type, ReportType::RdSample);
        assert_eq!(r.product_code, RD_SAMPLE_PRODUCT_CODE);
        assert_eq!(r.rd_product_code.as_deref(), Some("RDX-1"));
    }

    #[test]
    fn explicit_product_code_is_kept_for_rd_samples() {
        let mut r = report(None, "PROTO-9");
        classify(&mut r);
        assert_eq!(r.report_type, ReportType::RdSample);
        assert_eq!(r.product_code, "PROTO-9");
    }

    #[test]
    fn classification_is_idempotent() {
        let mut once = report(None, "");
        classify(&mut once);
        let mut twice = once.clone();
        classify(&mut twice);
        assert_eq!(once, twice);

        let mut normal = report(Some(4), "P-1");
        normal.report_type = ReportType::RdSample;
        classify(&mut normal);
        assert_eq!(normal.report_type, ReportType::Normal);
    }

    #[test]
    fn summary_totals_changed_rows() {
        let summary = ReclassifySummary {
            per_source: vec![
                ReclassifyCounts {
                    source: Some(ReportSource::SmtProduction),
                    marked_rd_sample: 3,
                    marked_normal: 1,
                    product_code_filled: 2,
                },
                ReclassifyCounts {
                    source: Some(ReportSource::OperatorSupplement),
                    marked_rd_sample: 0,
                    marked_normal: 0,
                    product_code_filled: 0,
                },
            ],
            partitions_recomputed: 1,
        };
        assert_eq!(summary.total_changed(), 4);
    }

    #[test]
    fn only_rows_with_a_partition_are_recomputed() {
        let changed: Vec<ChangedRow> = vec![
            (Some(4), Some(9)),
            (None, None),
            (Some(4), None),
            (Some(5), Some(2)),
        ];
        let partitions: Vec<(i64, i64)> = partitions_of(&changed).collect();
        assert_eq!(partitions, vec![(4, 9), (5, 2)]);
    }
}
