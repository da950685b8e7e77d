// src/services/erp.rs

use serde::Serialize;
use sqlx::PgPool;

use crate::error::CoreResult;

/// Processes created for a work-order promoted from ERP staging.
pub const DEFAULT_PROCESSES: [&str; 3] = ["SMT", "assembly", "inspection"];

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PromotionStats {
    pub staged: u64,
    pub promoted: u64,
    pub processes_created: u64,
}

/// Promotes staged ERP rows to `pending` work-orders, one per `(company_code, order_number)`.
///
/// The latest staging row of each key wins; keys that already have a work-order are left alone.
pub async fn promote_erp_orders(
    pool: &PgPool,
    default_processes: &[String],
) -> CoreResult<PromotionStats> {
    let mut tx = pool.begin().await?;

    let (staged,): (i64,) =
        sqlx::query_as("SELECT COUNT(DISTINCT (company_code, order_number)) FROM erp_orders")
            .fetch_one(&mut *tx)
            .await?;

    let promoted: Vec<(i64, i64)> = sqlx::query_as(
        r#"INSERT INTO workorder (company_code, order_number, product_code, planned_quantity, status)
           SELECT DISTINCT ON (company_code, order_number)
                  company_code, order_number, product_code, planned_quantity, 'pending'
           FROM erp_orders
           ORDER BY company_code, order_number, created_at DESC, erp_order_id DESC
           ON CONFLICT (company_code, order_number) DO NOTHING
           RETURNING workorder_id, planned_quantity"#,
    )
    .fetch_all(&mut *tx)
    .await?;

    let mut processes_created = 0u64;
    if !promoted.is_empty() && !default_processes.is_empty() {
        let ids: Vec<i64> = promoted.iter().map(|(id, _)| *id).collect();
        let names: Vec<String> = default_processes.to_vec();
        let seqs: Vec<i32> = (1..=default_processes.len() as i32).collect();

        processes_created = sqlx::query(
            r#"INSERT INTO workorder_process (workorder_id, name, seq)
               SELECT w.id, p.name, p.seq
               FROM UNNEST($1::BIGINT[]) AS w(id)
               CROSS JOIN UNNEST($2::TEXT[], $3::INT[]) AS p(name, seq)
               ON CONFLICT (workorder_id, name) DO NOTHING"#,
        )
        .bind(&ids)
        .bind(&names)
        .bind(&seqs)
        .execute(&mut *tx)
        .await?
        .rows_affected();
    }

    tx.commit().await?;

    let stats = PromotionStats {
        staged: staged.max(0) as u64,
        promoted: promoted.len() as u64,
        processes_created,
    };
    tracing::info!(
        staged = stats.staged,
        promoted = stats.promoted,
        processes_created = stats.processes_created,
        "ERP orders promoted"
    );
    Ok(stats)
}
