// src/db/locks.rs
//
// Advisory locks. Every key is namespaced ("task:", "workorder:", "dedup:") and hashed to the
// bigint keyspace with hashtextextended.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use sqlx::{PgConnection, PgPool};

use crate::error::CoreResult;

/// Held for as long as a periodic task runs; dropping it releases the named lock.
pub struct TaskLease {
    _guard: Box<dyn Send>,
}

impl std::fmt::Debug for TaskLease {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("TaskLease")
    }
}

#[async_trait]
pub trait TaskLocks: Send + Sync {
    /// Returns `None` when another worker already holds the lock for `task`.
    async fn try_acquire(&self, task: &str) -> CoreResult<Option<TaskLease>>;
}

/// Cluster-wide task locks: a transaction-scoped advisory lock on a dedicated connection that
/// stays open for the task's lifetime. Rollback on drop releases it, including on cancellation.
#[derive(Clone)]
pub struct PgTaskLocks {
    pool: PgPool,
}

impl PgTaskLocks {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl TaskLocks for PgTaskLocks {
    async fn try_acquire(&self, task: &str) -> CoreResult<Option<TaskLease>> {
        let mut tx = self.pool.begin().await?;
        let (acquired,): (bool,) =
            sqlx::query_as("SELECT pg_try_advisory_xact_lock(hashtextextended($1, 0))")
                .bind(format!("task:{task}"))
                .fetch_one(&mut *tx)
                .await?;

        if acquired {
            Ok(Some(TaskLease {
                _guard: Box::new(tx),
            }))
        } else {
            tx.rollback().await?;
            Ok(None)
        }
    }
}

/// In-process task locks for single-node deployments and tests.
#[derive(Clone, Default)]
pub struct LocalTaskLocks {
    held: Arc<Mutex<HashSet<String>>>,
}

struct LocalLease {
    task: String,
    held: Arc<Mutex<HashSet<String>>>,
}

impl Drop for LocalLease {
    fn drop(&mut self) {
        if let Ok(mut held) = self.held.lock() {
            held.remove(&self.task);
        }
    }
}

#[async_trait]
impl TaskLocks for LocalTaskLocks {
    async fn try_acquire(&self, task: &str) -> CoreResult<Option<TaskLease>> {
        let mut held = self
            .held
            .lock()
            .map_err(|_| crate::error::CoreError::Fatal("task lock table poisoned".into()))?;
        if !held.insert(task.to_string()) {
            return Ok(None);
        }
        Ok(Some(TaskLease {
            _guard: Box::new(LocalLease {
                task: task.to_string(),
                held: self.held.clone(),
            }),
        }))
    }
}

/// Serializes Evaluator and Archiver on one work-order for the rest of the transaction.
pub async fn try_lock_workorder(conn: &mut PgConnection, workorder_id: i64) -> CoreResult<bool> {
    let (acquired,): (bool,) = sqlx::query_as(
        "SELECT pg_try_advisory_xact_lock(hashtextextended('workorder:' || $1::TEXT, 0))",
    )
    .bind(workorder_id)
    .fetch_one(conn)
    .await?;
    Ok(acquired)
}

/// Blocks until no other transaction is creating a report with the same de-dup key.
pub async fn lock_dedup_key(conn: &mut PgConnection, dedup_key: &str) -> CoreResult<()> {
    sqlx::query("SELECT pg_advisory_xact_lock(hashtextextended('dedup:' || $1, 0))")
        .bind(dedup_key)
        .execute(conn)
        .await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn local_lock_is_exclusive_until_lease_drops() {
        let locks = LocalTaskLocks::default();

        let lease = locks
            .try_acquire("completion_trigger_task")
            .await
            .expect("acquire")
            .expect("first caller wins");
        assert!(locks
            .try_acquire("completion_trigger_task")
            .await
            .expect("acquire")
            .is_none());

        // unrelated task names never contend
        assert!(locks
            .try_acquire("auto_approve_work_reports")
            .await
            .expect("acquire")
            .is_some());

        drop(lease);
        assert!(locks
            .try_acquire("completion_trigger_task")
            .await
            .expect("acquire")
            .is_some());
    }
}
