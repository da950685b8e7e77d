// src/services/settings.rs
//
// Business settings (the completion-check singleton) and periodic task registrations.

use chrono::{DateTime, NaiveTime, Utc};
use serde::Deserialize;
use sqlx::{PgConnection, PgPool};

use crate::error::{CoreError, CoreResult};
use crate::models::settings::COMPLETION_CONFIG_COLUMNS;
use crate::models::{CompletionCheckConfig, PeriodicTaskRow, ReportSource};
use crate::services::accumulator::{self, CountPolicy};

// ─────────────────────────────────────────────────────────────────────────────
// Completion-check config
// ─────────────────────────────────────────────────────────────────────────────

pub async fn load_config(conn: &mut PgConnection) -> CoreResult<CompletionCheckConfig> {
    let cfg = sqlx::query_as::<_, CompletionCheckConfig>(&format!(
        "SELECT {COMPLETION_CONFIG_COLUMNS} FROM system_completion_check_config WHERE id = 1"
    ))
    .fetch_optional(conn)
    .await?;
    // The migration seeds the row; its absence means the schema was tampered with.
    cfg.ok_or_else(|| CoreError::Fatal("system_completion_check_config row is missing".into()))
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ConfigPatch {
    pub enabled: Option<bool>,
    pub interval_minutes: Option<i32>,
    /// `HH:MM` or `HH:MM:SS` in the canonical timezone.
    pub window_start: Option<String>,
    pub window_end: Option<String>,
    pub max_workorders_per_check: Option<i32>,
    pub enable_notifications: Option<bool>,
    pub inconsistency_tolerance: Option<i64>,
    pub inconsistency_ticks: Option<i32>,
    pub auto_approve_min_age_minutes: Option<i32>,
    pub auto_approve_tolerance: Option<i64>,
    pub auto_approve_disabled_sources: Option<Vec<ReportSource>>,
    pub fill_work_sources: Option<Vec<ReportSource>>,
    pub count_pending: Option<bool>,
    pub archive_after_minutes: Option<i32>,
}

impl ConfigPatch {
    pub fn apply(self, mut cfg: CompletionCheckConfig) -> CoreResult<CompletionCheckConfig> {
        if let Some(v) = self.enabled {
            cfg.enabled = v;
        }
        if let Some(v) = self.interval_minutes {
            cfg.interval_minutes = positive("interval_minutes", v)?;
        }
        if let Some(raw) = self.window_start {
            cfg.window_start = parse_wall_clock("window_start", &raw)?;
        }
        if let Some(raw) = self.window_end {
            cfg.window_end = parse_wall_clock("window_end", &raw)?;
        }
        if let Some(v) = self.max_workorders_per_check {
            cfg.max_workorders_per_check = positive("max_workorders_per_check", v)?;
        }
        if let Some(v) = self.enable_notifications {
            cfg.enable_notifications = v;
        }
        if let Some(v) = self.inconsistency_tolerance {
            cfg.inconsistency_tolerance = non_negative("inconsistency_tolerance", v)?;
        }
        if let Some(v) = self.inconsistency_ticks {
            cfg.inconsistency_ticks = positive("inconsistency_ticks", v)?;
        }
        if let Some(v) = self.auto_approve_min_age_minutes {
            cfg.auto_approve_min_age_minutes =
                non_negative("auto_approve_min_age_minutes", i64::from(v))? as i32;
        }
        if let Some(v) = self.auto_approve_tolerance {
            cfg.auto_approve_tolerance = non_negative("auto_approve_tolerance", v)?;
        }
        if let Some(mut v) = self.auto_approve_disabled_sources {
            v.sort();
            v.dedup();
            cfg.auto_approve_disabled_sources = v;
        }
        if let Some(mut v) = self.fill_work_sources {
            v.sort();
            v.dedup();
            cfg.fill_work_sources = v;
        }
        if let Some(v) = self.count_pending {
            cfg.count_pending = v;
        }
        if let Some(v) = self.archive_after_minutes {
            cfg.archive_after_minutes = non_negative("archive_after_minutes", i64::from(v))? as i32;
        }
        Ok(cfg)
    }
}

fn positive(field: &str, v: i32) -> CoreResult<i32> {
    if v <= 0 {
        return Err(CoreError::invalid(format!("{field} must be > 0, got {v}")));
    }
    Ok(v)
}

fn non_negative(field: &str, v: i64) -> CoreResult<i64> {
    if v < 0 {
        return Err(CoreError::invalid(format!("{field} must be >= 0, got {v}")));
    }
    Ok(v)
}

fn parse_wall_clock(field: &str, raw: &str) -> CoreResult<NaiveTime> {
    let raw = raw.trim();
    NaiveTime::parse_from_str(raw, "%H:%M")
        .or_else(|_| NaiveTime::parse_from_str(raw, "%H:%M:%S"))
        .map_err(|_| CoreError::invalid(format!("{field} must be HH:MM, got '{raw}'")))
}

pub async fn update_config(pool: &PgPool, patch: ConfigPatch) -> CoreResult<CompletionCheckConfig> {
    let mut tx = pool.begin().await?;
    sqlx::query("SELECT id FROM system_completion_check_config WHERE id = 1 FOR UPDATE")
        .execute(&mut *tx)
        .await?;
    let current = load_config(&mut tx).await?;
    let policy_before = CountPolicy::from_config(&current);
    let next = patch.apply(current)?;

    let saved = sqlx::query_as::<_, CompletionCheckConfig>(&format!(
        r#"UPDATE system_completion_check_config SET
               enabled = $1, interval_minutes = $2, window_start = $3, window_end = $4,
               max_workorders_per_check = $5, enable_notifications = $6,
               inconsistency_tolerance = $7, inconsistency_ticks = $8,
               auto_approve_min_age_minutes = $9, auto_approve_tolerance = $10,
               auto_approve_disabled_sources = $11, fill_work_sources = $12,
               count_pending = $13, archive_after_minutes = $14, updated_at = now()
           WHERE id = 1
           RETURNING {COMPLETION_CONFIG_COLUMNS}"#
    ))
    .bind(next.enabled)
    .bind(next.interval_minutes)
    .bind(next.window_start)
    .bind(next.window_end)
    .bind(next.max_workorders_per_check)
    .bind(next.enable_notifications)
    .bind(next.inconsistency_tolerance)
    .bind(next.inconsistency_ticks)
    .bind(next.auto_approve_min_age_minutes)
    .bind(next.auto_approve_tolerance)
    .bind(&next.auto_approve_disabled_sources)
    .bind(&next.fill_work_sources)
    .bind(next.count_pending)
    .bind(next.archive_after_minutes)
    .fetch_one(&mut *tx)
    .await?;

    // Snapshots taken under the old policy would disagree with the live SUM from here on.
    let policy_after = CountPolicy::from_config(&saved);
    if policy_after != policy_before {
        accumulator::recompute_live(&mut tx, policy_after).await?;
    }

    tx.commit().await?;
    tracing::info!(
        enabled = saved.enabled,
        interval_minutes = saved.interval_minutes,
        window_start = %saved.window_start,
        window_end = %saved.window_end,
        "completion check config updated"
    );
    Ok(saved)
}

// ─────────────────────────────────────────────────────────────────────────────
// Periodic task registrations
// ─────────────────────────────────────────────────────────────────────────────

const TASK_COLUMNS: &str = "name, interval_minutes, enabled, last_run_at, last_duration_ms, \
     scanned, completed, errored, skipped, overran, updated_at";

pub async fn list_tasks(pool: &PgPool) -> CoreResult<Vec<PeriodicTaskRow>> {
    let rows = sqlx::query_as::<_, PeriodicTaskRow>(&format!(
        "SELECT {TASK_COLUMNS} FROM system_periodic_task ORDER BY name"
    ))
    .fetch_all(pool)
    .await?;
    Ok(rows)
}

/// Creates or reschedules a task. `enabled = None` keeps the current flag (new rows are enabled).
pub async fn upsert_task(
    pool: &PgPool,
    name: &str,
    interval_minutes: i32,
    enabled: Option<bool>,
) -> CoreResult<PeriodicTaskRow> {
    let interval_minutes = positive("interval", interval_minutes)?;
    let row = sqlx::query_as::<_, PeriodicTaskRow>(&format!(
        r#"INSERT INTO system_periodic_task (name, interval_minutes, enabled)
           VALUES ($1, $2, COALESCE($3, TRUE))
           ON CONFLICT (name) DO UPDATE
              SET interval_minutes = EXCLUDED.interval_minutes,
                  enabled = COALESCE($3, system_periodic_task.enabled),
                  updated_at = now()
           RETURNING {TASK_COLUMNS}"#
    ))
    .bind(name)
    .bind(interval_minutes)
    .bind(enabled)
    .fetch_one(pool)
    .await?;

    tracing::info!(
        task = name,
        interval_minutes = row.interval_minutes,
        enabled = row.enabled,
        "periodic task registered"
    );
    Ok(row)
}

pub async fn remove_task(pool: &PgPool, name: &str) -> CoreResult<bool> {
    let removed = sqlx::query("DELETE FROM system_periodic_task WHERE name = $1")
        .bind(name)
        .execute(pool)
        .await?
        .rows_affected();
    tracing::info!(task = name, removed = removed > 0, "periodic task removed");
    Ok(removed > 0)
}

/// Counters from one run, added onto the task's totals.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize)]
pub struct RunRecord {
    pub scanned: u64,
    pub completed: u64,
    pub errored: u64,
    pub skipped: u64,
    pub overran: u64,
}

pub async fn record_run(
    pool: &PgPool,
    name: &str,
    started_at: DateTime<Utc>,
    duration_ms: i64,
    run: RunRecord,
) -> CoreResult<()> {
    sqlx::query(
        r#"UPDATE system_periodic_task SET
               last_run_at = $2, last_duration_ms = $3,
               scanned = scanned + $4, completed = completed + $5, errored = errored + $6,
               skipped = skipped + $7, overran = overran + $8, updated_at = now()
           WHERE name = $1"#,
    )
    .bind(name)
    .bind(started_at)
    .bind(duration_ms)
    .bind(run.scanned as i64)
    .bind(run.completed as i64)
    .bind(run.errored as i64)
    .bind(run.skipped as i64)
    .bind(run.overran as i64)
    .execute(pool)
    .await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn patch_updates_only_given_fields() {
        let base = CompletionCheckConfig::default();
        let patch: ConfigPatch = serde_json::from_value(serde_json::json!({
            "window_start": "08:00",
            "window_end": "18:00:00",
            "inconsistency_ticks": 5,
            "fill_work_sources": ["smt", "operator", "smt"]
        }))
        .expect("valid patch");
        let next = patch.apply(base.clone()).expect("applies");

        assert_eq!(next.window_start, NaiveTime::from_hms_opt(8, 0, 0).expect("time"));
        assert_eq!(next.window_end, NaiveTime::from_hms_opt(18, 0, 0).expect("time"));
        assert_eq!(next.inconsistency_ticks, 5);
        assert_eq!(
            next.fill_work_sources,
            vec![ReportSource::OperatorSupplement, ReportSource::SmtProduction]
        );
        assert_eq!(next.interval_minutes, base.interval_minutes);
        assert_eq!(next.enabled, base.enabled);
    }

    #[test]
    fn patch_rejects_out_of_range_values() {
        let bad = ConfigPatch {
            max_workorders_per_check: Some(0),
            ..Default::default()
        };
        assert!(matches!(
            bad.apply(CompletionCheckConfig::default()),
            Err(CoreError::InvalidInput(_))
        ));

        let bad_window = ConfigPatch {
            window_start: Some("8am".into()),
            ..Default::default()
        };
        assert!(bad_window.apply(CompletionCheckConfig::default()).is_err());

        let negative = ConfigPatch {
            inconsistency_tolerance: Some(-1),
            ..Default::default()
        };
        assert!(negative.apply(CompletionCheckConfig::default()).is_err());
    }

    #[test]
    fn unknown_config_keys_are_rejected() {
        let result: Result<ConfigPatch, _> =
            serde_json::from_value(serde_json::json!({ "interval": 5 }));
        assert!(result.is_err());
    }
}
