// src/scheduler/tasks.rs

use std::str::FromStr;
use std::sync::Arc;

use chrono::{FixedOffset, Utc};
use sqlx::PgPool;
use tokio::time::Instant;

use crate::error::CoreResult;
use crate::models::UnknownVariant;
use crate::services::notify::Notifier;
use crate::services::permission::Actor;
use crate::services::settings::{self, RunRecord};
use crate::services::{approval, archiver, completion, erp};

/// Live rows of archived work-orders are kept this long before the periodic purge.
pub const DEFAULT_PURGE_AFTER_DAYS: i32 = 90;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TaskKind {
    AutoApprove,
    CompletionTrigger,
    LegacyCompletionCheck,
    PromoteErpOrders,
    ArchiveCompleted,
    PurgeArchived,
}

impl TaskKind {
    pub const ALL: [TaskKind; 6] = [
        Self::AutoApprove,
        Self::CompletionTrigger,
        Self::LegacyCompletionCheck,
        Self::PromoteErpOrders,
        Self::ArchiveCompleted,
        Self::PurgeArchived,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::AutoApprove => "auto_approve_work_reports",
            Self::CompletionTrigger => "completion_trigger_task",
            Self::LegacyCompletionCheck => "auto_check_workorder_completion",
            Self::PromoteErpOrders => "promote_erp_orders",
            Self::ArchiveCompleted => "archive_completed_workorders",
            Self::PurgeArchived => "purge_archived_workorders",
        }
    }

    pub fn default_interval_minutes(&self) -> i32 {
        match self {
            Self::AutoApprove => 30,
            Self::CompletionTrigger => 5,
            Self::LegacyCompletionCheck => 30,
            Self::PromoteErpOrders => 10,
            Self::ArchiveCompleted => 5,
            Self::PurgeArchived => 1440,
        }
    }
}

impl FromStr for TaskKind {
    type Err = UnknownVariant;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|kind| kind.as_str() == s)
            .ok_or_else(|| UnknownVariant::new("periodic task", s))
    }
}

impl std::fmt::Display for TaskKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What a task body needs beyond its own arguments.
#[derive(Clone)]
pub struct TaskContext {
    pub pool: PgPool,
    pub timezone: FixedOffset,
    pub default_processes: Vec<String>,
    pub notifier: Arc<dyn Notifier>,
}

/// Runs one task body. The config row is re-read on every run.
pub async fn execute(kind: TaskKind, ctx: &TaskContext, soft_deadline: Instant) -> CoreResult<RunRecord> {
    let cfg = {
        let mut conn = ctx.pool.acquire().await?;
        settings::load_config(&mut conn).await?
    };
    let actor = Actor::system(kind.as_str());

    match kind {
        TaskKind::CompletionTrigger => {
            if !cfg.enabled {
                tracing::debug!(task = %kind, "completion check disabled");
                return Ok(RunRecord::default());
            }
            let stats = completion::evaluate_batch(
                &ctx.pool,
                &cfg,
                ctx.timezone,
                Utc::now(),
                soft_deadline,
                ctx.notifier.as_ref(),
            )
            .await?;
            Ok(RunRecord {
                scanned: stats.scanned,
                completed: stats.completed,
                errored: stats.errored,
                skipped: stats.skipped + u64::from(stats.window_closed),
                overran: 0,
            })
        }
        TaskKind::LegacyCompletionCheck => {
            if !cfg.enabled {
                return Ok(RunRecord::default());
            }
            let stats = completion::legacy_check(&ctx.pool, &cfg).await?;
            Ok(RunRecord {
                scanned: stats.scanned,
                completed: stats.would_complete,
                errored: stats.errored,
                ..Default::default()
            })
        }
        TaskKind::AutoApprove => {
            let stats = approval::auto_approve(&ctx.pool, &cfg, Utc::now()).await?;
            Ok(RunRecord {
                scanned: stats.scanned,
                completed: stats.approved,
                errored: stats.errored,
                skipped: stats.skipped,
                overran: 0,
            })
        }
        TaskKind::PromoteErpOrders => {
            let stats = erp::promote_erp_orders(&ctx.pool, &ctx.default_processes).await?;
            Ok(RunRecord {
                scanned: stats.staged,
                completed: stats.promoted,
                ..Default::default()
            })
        }
        TaskKind::ArchiveCompleted => {
            let stats = archiver::archive_pending(
                &ctx.pool,
                cfg.archive_after_minutes,
                i64::from(cfg.max_workorders_per_check),
                &actor,
            )
            .await?;
            Ok(RunRecord {
                scanned: stats.scanned,
                completed: stats.archived,
                errored: stats.errored,
                ..Default::default()
            })
        }
        TaskKind::PurgeArchived => {
            let stats = archiver::purge_archived(&ctx.pool, DEFAULT_PURGE_AFTER_DAYS).await?;
            Ok(RunRecord {
                scanned: stats.workorders,
                completed: stats.workorders,
                ..Default::default()
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn task_names_round_trip() {
        for kind in TaskKind::ALL {
            assert_eq!(kind.as_str().parse::<TaskKind>(), Ok(kind));
        }
        assert!("nightly_backup".parse::<TaskKind>().is_err());
    }

    #[test]
    fn default_intervals() {
        assert_eq!(TaskKind::AutoApprove.default_interval_minutes(), 30);
        assert_eq!(TaskKind::CompletionTrigger.default_interval_minutes(), 5);
        assert_eq!(TaskKind::LegacyCompletionCheck.default_interval_minutes(), 30);
    }
}
