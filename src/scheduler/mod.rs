// src/scheduler/mod.rs
//
// Periodic driver. Every tick reads `system_periodic_task`, starts the enabled tasks whose
// interval has elapsed, and runs each under its named lock so only one worker in the
// deployment executes a task at a time.

pub mod tasks;

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::task::JoinHandle;
use tokio::time::{interval, Instant, MissedTickBehavior};

use crate::db::locks::TaskLocks;
use crate::error::CoreResult;
use crate::models::PeriodicTaskRow;
use crate::services::notify::{CoreEvent, Notifier};
use crate::services::settings::{self, RunRecord};

pub use tasks::{TaskContext, TaskKind};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Finished,
    /// Another worker held the task lock.
    Skipped,
    /// Cancelled after twice the interval.
    Overran,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RunReport {
    pub task: String,
    pub status: RunStatus,
    pub started_at: DateTime<Utc>,
    pub duration_ms: i64,
    pub record: RunRecord,
}

/// Runs `job` while holding the lock for `task`.
///
/// A held lock yields `Skipped` without touching the job. The job is cancelled once it has
/// run for twice `every`; its transaction rolls back and a task-overrun event goes out.
pub async fn run_guarded<Fut>(
    task: &str,
    every: Duration,
    locks: &dyn TaskLocks,
    notifier: &dyn Notifier,
    job: Fut,
) -> RunReport
where
    Fut: Future<Output = CoreResult<RunRecord>>,
{
    let started_at = Utc::now();
    let clock = Instant::now();
    let finish = |status: RunStatus, record: RunRecord| RunReport {
        task: task.to_string(),
        status,
        started_at,
        duration_ms: clock.elapsed().as_millis() as i64,
        record,
    };

    let lease = match locks.try_acquire(task).await {
        Ok(Some(lease)) => lease,
        Ok(None) => {
            tracing::info!(task, "task lock held elsewhere; skipping run");
            return finish(
                RunStatus::Skipped,
                RunRecord {
                    skipped: 1,
                    ..Default::default()
                },
            );
        }
        Err(err) => {
            tracing::error!(task, error = %err, "could not take task lock");
            return finish(
                RunStatus::Failed,
                RunRecord {
                    errored: 1,
                    ..Default::default()
                },
            );
        }
    };

    let hard_limit = every * 2;
    let (status, record) = match tokio::time::timeout(hard_limit, job).await {
        Ok(Ok(record)) => (RunStatus::Finished, record),
        Ok(Err(err)) => {
            tracing::error!(task, error = %err, "task run failed");
            (
                RunStatus::Failed,
                RunRecord {
                    errored: 1,
                    ..Default::default()
                },
            )
        }
        Err(_) => {
            let elapsed_ms = clock.elapsed().as_millis() as i64;
            tracing::warn!(task, elapsed_ms, limit_ms = hard_limit.as_millis() as u64, "task overran; cancelled");
            notifier
                .notify(&CoreEvent::TaskOverrun {
                    task: task.to_string(),
                    interval_minutes: (every.as_secs() / 60) as i64,
                    elapsed_ms,
                })
                .await;
            (
                RunStatus::Overran,
                RunRecord {
                    overran: 1,
                    ..Default::default()
                },
            )
        }
    };
    drop(lease);

    let report = finish(status, record);
    tracing::info!(
        task,
        status = ?report.status,
        duration_ms = report.duration_ms,
        scanned = record.scanned,
        completed = record.completed,
        errored = record.errored,
        "task run finished"
    );
    report
}

// ─── In-memory run history ──────────────────────────────────────────────────

#[derive(Debug, Clone, Default, Serialize)]
pub struct TaskSnapshot {
    pub runs: u64,
    pub running: bool,
    pub last: Option<RunReport>,
    pub totals: RunRecord,
}

/// Per-node view of the tasks this process has run, served next to the persisted rows.
#[derive(Clone, Default)]
pub struct TaskStats {
    inner: Arc<RwLock<HashMap<String, TaskSnapshot>>>,
}

impl TaskStats {
    pub fn snapshot(&self) -> HashMap<String, TaskSnapshot> {
        self.inner.read().map(|m| m.clone()).unwrap_or_default()
    }

    fn mark_running(&self, task: &str) {
        if let Ok(mut m) = self.inner.write() {
            m.entry(task.to_string()).or_default().running = true;
        }
    }

    fn record(&self, report: &RunReport) {
        if let Ok(mut m) = self.inner.write() {
            let entry = m.entry(report.task.clone()).or_default();
            entry.runs += 1;
            entry.running = false;
            entry.totals.scanned += report.record.scanned;
            entry.totals.completed += report.record.completed;
            entry.totals.errored += report.record.errored;
            entry.totals.skipped += report.record.skipped;
            entry.totals.overran += report.record.overran;
            entry.last = Some(report.clone());
        }
    }
}

/// True when `row` is enabled and its interval has elapsed since the last run.
pub fn is_due(row: &PeriodicTaskRow, now: DateTime<Utc>) -> bool {
    if !row.enabled || row.interval_minutes <= 0 {
        return false;
    }
    match row.last_run_at {
        None => true,
        Some(last) => now >= last + chrono::Duration::minutes(i64::from(row.interval_minutes)),
    }
}

// ─── Driver ─────────────────────────────────────────────────────────────────

pub struct Scheduler {
    ctx: TaskContext,
    locks: Arc<dyn TaskLocks>,
    stats: TaskStats,
    tick_secs: u64,
}

impl Scheduler {
    pub fn new(ctx: TaskContext, locks: Arc<dyn TaskLocks>, stats: TaskStats, tick_secs: u64) -> Self {
        Self {
            ctx,
            locks,
            stats,
            tick_secs: tick_secs.max(1),
        }
    }

    /// Polls forever. Tasks run on their own tokio tasks so a slow one never delays the rest.
    pub async fn run(self) {
        tracing::info!(tick_secs = self.tick_secs, "scheduler started");
        let mut tick = interval(Duration::from_secs(self.tick_secs));
        tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut in_flight: HashMap<String, JoinHandle<()>> = HashMap::new();

        loop {
            tick.tick().await;
            in_flight.retain(|_, handle| !handle.is_finished());
            if let Err(err) = self.start_due(&mut in_flight).await {
                tracing::error!(error = %err, "scheduler tick failed");
            }
        }
    }

    async fn start_due(&self, in_flight: &mut HashMap<String, JoinHandle<()>>) -> CoreResult<()> {
        let now = Utc::now();
        for row in settings::list_tasks(&self.ctx.pool).await? {
            if !is_due(&row, now) || in_flight.contains_key(&row.name) {
                continue;
            }
            let kind = match row.name.parse::<TaskKind>() {
                Ok(kind) => kind,
                Err(err) => {
                    tracing::warn!(task = %row.name, error = %err, "unknown periodic task; ignored");
                    continue;
                }
            };

            let every = Duration::from_secs(row.interval_minutes as u64 * 60);
            let ctx = self.ctx.clone();
            let locks = self.locks.clone();
            let stats = self.stats.clone();
            stats.mark_running(kind.as_str());

            let handle = tokio::spawn(async move {
                let soft_deadline = Instant::now() + every;
                let report = run_guarded(
                    kind.as_str(),
                    every,
                    locks.as_ref(),
                    ctx.notifier.as_ref(),
                    tasks::execute(kind, &ctx, soft_deadline),
                )
                .await;
                if let Err(err) = settings::record_run(
                    &ctx.pool,
                    &report.task,
                    report.started_at,
                    report.duration_ms,
                    report.record,
                )
                .await
                {
                    tracing::warn!(task = %report.task, error = %err, "could not persist run record");
                }
                stats.record(&report);
            });
            in_flight.insert(row.name, handle);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use tokio::sync::oneshot;

    use super::*;
    use crate::db::locks::LocalTaskLocks;
    use crate::error::CoreError;
    use crate::services::notify::testing::RecordingNotifier;

    fn row(enabled: bool, interval_minutes: i32, last_run_at: Option<DateTime<Utc>>) -> PeriodicTaskRow {
        PeriodicTaskRow {
            name: "completion_trigger_task".into(),
            interval_minutes,
            enabled,
            last_run_at,
            last_duration_ms: None,
            scanned: 0,
            completed: 0,
            errored: 0,
            skipped: 0,
            overran: 0,
            updated_at: Utc::now(),
        }
    }

    #[test]
    fn due_after_interval_elapses() {
        let now = Utc::now();
        assert!(is_due(&row(true, 5, None), now));
        assert!(!is_due(&row(true, 5, Some(now - chrono::Duration::minutes(4))), now));
        assert!(is_due(&row(true, 5, Some(now - chrono::Duration::minutes(5))), now));
        assert!(!is_due(&row(false, 5, None), now));
    }

    #[tokio::test]
    async fn concurrent_runs_of_one_task_skip_cleanly() {
        let locks = LocalTaskLocks::default();
        let notifier = RecordingNotifier::default();
        let (release, wait) = oneshot::channel::<()>();

        let first = run_guarded(
            "completion_trigger_task",
            Duration::from_secs(300),
            &locks,
            &notifier,
            async move {
                let _ = wait.await;
                Ok(RunRecord {
                    scanned: 3,
                    completed: 1,
                    ..Default::default()
                })
            },
        );
        let second = async {
            let report = run_guarded(
                "completion_trigger_task",
                Duration::from_secs(300),
                &locks,
                &notifier,
                async { Ok(RunRecord::default()) },
            )
            .await;
            let _ = release.send(());
            report
        };

        let (a, b) = tokio::join!(first, second);
        assert_eq!(a.status, RunStatus::Finished);
        assert_eq!(a.record.completed, 1);
        assert_eq!(b.status, RunStatus::Skipped);
        assert_eq!(b.record.skipped, 1);
        assert!(notifier.events.lock().expect("lock").is_empty());

        // the lease is gone once the winner finishes
        let again = run_guarded(
            "completion_trigger_task",
            Duration::from_secs(300),
            &locks,
            &notifier,
            async { Ok(RunRecord::default()) },
        )
        .await;
        assert_eq!(again.status, RunStatus::Finished);
    }

    #[tokio::test]
    async fn overrunning_task_is_cancelled_and_reported() {
        let locks = LocalTaskLocks::default();
        let notifier = RecordingNotifier::default();

        let report = run_guarded(
            "auto_approve_work_reports",
            Duration::from_millis(20),
            &locks,
            &notifier,
            std::future::pending::<CoreResult<RunRecord>>(),
        )
        .await;

        assert_eq!(report.status, RunStatus::Overran);
        assert_eq!(report.record.overran, 1);
        assert!(report.duration_ms >= 30);
        let events = notifier.events.lock().expect("lock");
        assert!(matches!(
            events.as_slice(),
            [CoreEvent::TaskOverrun { task, .. }] if task == "auto_approve_work_reports"
        ));
        drop(events);

        assert!(locks
            .try_acquire("auto_approve_work_reports")
            .await
            .expect("acquire")
            .is_some());
    }

    #[tokio::test]
    async fn failing_task_counts_one_error() {
        let locks = LocalTaskLocks::default();
        let notifier = RecordingNotifier::default();
        let report = run_guarded(
            "promote_erp_orders",
            Duration::from_secs(600),
            &locks,
            &notifier,
            async { Err::<RunRecord, _>(CoreError::Fatal("boom".into())) },
        )
        .await;
        assert_eq!(report.status, RunStatus::Failed);
        assert_eq!(report.record.errored, 1);
    }

    #[test]
    fn stats_accumulate_totals() {
        let stats = TaskStats::default();
        let report = RunReport {
            task: "completion_trigger_task".into(),
            status: RunStatus::Finished,
            started_at: Utc::now(),
            duration_ms: 12,
            record: RunRecord {
                scanned: 4,
                completed: 2,
                ..Default::default()
            },
        };
        stats.mark_running("completion_trigger_task");
        stats.record(&report);
        stats.record(&report);

        let snap = stats.snapshot();
        let entry = &snap["completion_trigger_task"];
        assert_eq!(entry.runs, 2);
        assert!(!entry.running);
        assert_eq!(entry.totals.scanned, 8);
        assert_eq!(entry.totals.completed, 4);
    }
}
