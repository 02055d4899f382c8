use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::Value;
use sqlx::{PgExecutor, Pool, Postgres, Transaction};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::dequeuers::Dequeuers;
use crate::listener::Listener;
use crate::task::sanitize_error_message;
use crate::{
    Error, Queue, Result, Task, TaskInfo, TaskStatus, TaskTableProvider, TaskingConfig,
};

const CANCELLATION_BUFFER: usize = 64;

/// Filter for [`PgQueue::list`].
#[derive(Debug, Clone, Default)]
pub struct TaskFilter {
    /// Only tasks that are not finished yet.
    pub only_unfinished: bool,
    /// Only tasks queued within this duration.
    pub newer: Option<Duration>,
    pub task_type: Option<String>,
    pub limit: Option<i64>,
}

/// [`Queue`] implementation on top of postgres. Claims use
/// `FOR UPDATE SKIP LOCKED` so concurrent dequeuers never get the same task
/// and never block on each other; LISTEN/NOTIFY on the queue channel is used
/// to wake them up.
pub struct PgQueue {
    pool: Pool<Postgres>,
    tables: Arc<dyn TaskTableProvider>,
    dequeuers: Arc<Dequeuers>,
    cancellations: broadcast::Sender<Uuid>,
    max_retries: u32,
    stop_listener: CancellationToken,
    listener: Mutex<Option<JoinHandle<()>>>,
}

impl PgQueue {
    /// Connects the listener and returns once it is subscribed, so no change
    /// published after this returns can be missed.
    pub async fn new(
        pool: Pool<Postgres>,
        tables: impl TaskTableProvider,
        config: &TaskingConfig,
    ) -> Result<Self> {
        let tables: Arc<dyn TaskTableProvider> = Arc::new(tables);
        let dequeuers = Dequeuers::new();
        let (cancellations, _) = broadcast::channel(CANCELLATION_BUFFER);

        let mut listener = Listener::new(
            pool.clone(),
            tables.tasks_queue_name().to_string(),
            tables.tasks_cancel_name(),
            Arc::clone(&dequeuers),
            cancellations.clone(),
            config.listener_backoff,
        );
        listener.ensure_connection().await?;

        let stop_listener = CancellationToken::new();
        let handle = tokio::spawn(listener.run(stop_listener.clone()));

        Ok(Self {
            pool,
            tables,
            dequeuers,
            cancellations,
            max_retries: config.max_retries,
            stop_listener,
            listener: Mutex::new(Some(handle)),
        })
    }

    /// Stops the listener and waits for it to release its connection.
    pub async fn close(&self) {
        self.stop_listener.cancel();
        let handle = self.listener.lock().take();
        if let Some(handle) = handle {
            if let Err(err) = handle.await {
                error!("listener task failed: {err}");
            }
        }
    }

    pub fn pool(&self) -> &Pool<Postgres> {
        &self.pool
    }

    pub fn tables(&self) -> &dyn TaskTableProvider {
        &*self.tables
    }

    /// Single claim attempt: locks one ready row (skipping rows other
    /// claimants hold), marks it running under a fresh token and records its
    /// heartbeat, all in one transaction.
    #[instrument(level = "trace", skip(self))]
    async fn dequeue_maybe(&self, task_types: &[String]) -> Result<Option<TaskInfo>> {
        let table = self.tables.tasks_table_full_name();
        let table_ready = self.tables.tasks_ready_view_full_name();
        let heartbeats = self.tables.heartbeats_table_full_name();
        let token = Uuid::new_v4();

        let mut tx = self.pool.begin().await?;

        let sql = format!(
            "
UPDATE {table}
SET token = $1,
    started_at = statement_timestamp(),
    status = 'running'
WHERE id = (SELECT id
            FROM {table}
            WHERE status = 'pending'
              AND started_at IS NULL
              AND type = ANY($2)
              AND id IN (SELECT id FROM {table_ready})
            LIMIT 1
            FOR UPDATE SKIP LOCKED)
RETURNING *
"
        );
        let claimed: Option<TaskInfo> = sqlx::query_as(&sql)
            .bind(token)
            .bind(task_types.to_vec())
            .fetch_optional(&mut *tx)
            .await?;

        let Some(mut info) = claimed else {
            return Ok(None);
        };

        let sql = format!("INSERT INTO {heartbeats} (token, id, heartbeat) VALUES ($1, $2, now())");
        sqlx::query(&sql)
            .bind(token)
            .bind(info.id)
            .execute(&mut *tx)
            .await?;

        info.dependencies = self.task_dependencies(&mut *tx, info.id).await?;

        tx.commit().await?;

        Ok(Some(info))
    }

    async fn task_dependencies<'e, E: PgExecutor<'e>>(&self, db: E, id: Uuid) -> Result<Vec<Uuid>> {
        let deps = self.tables.dependencies_table_full_name();
        let sql = format!("SELECT dependency_id FROM {deps} WHERE task_id = $1");
        Ok(sqlx::query_scalar(&sql).bind(id).fetch_all(db).await?)
    }

    async fn lock_task(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        id: Uuid,
    ) -> Result<Option<TaskInfo>> {
        let table = self.tables.tasks_table_full_name();
        let sql = format!("SELECT * FROM {table} WHERE id = $1 FOR UPDATE");
        Ok(sqlx::query_as(&sql)
            .bind(id)
            .fetch_optional(&mut **tx)
            .await?)
    }

    /// Share-locks the given dependencies and returns those that failed or
    /// were canceled.
    async fn failed_dependencies(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        dependencies: &[Uuid],
    ) -> Result<Vec<Uuid>> {
        if dependencies.is_empty() {
            return Ok(Vec::new());
        }
        let table = self.tables.tasks_table_full_name();
        let sql = format!("SELECT id, status FROM {table} WHERE id = ANY($1) FOR SHARE");
        let rows: Vec<(Uuid, String)> = sqlx::query_as(&sql)
            .bind(dependencies.to_vec())
            .fetch_all(&mut **tx)
            .await?;
        Ok(rows
            .into_iter()
            .filter(|(_, status)| status == "failed" || status == "canceled")
            .map(|(id, _)| id)
            .collect())
    }

    async fn delete_heartbeat(&self, tx: &mut Transaction<'_, Postgres>, id: Uuid) -> Result<u64> {
        let heartbeats = self.tables.heartbeats_table_full_name();
        let sql = format!("DELETE FROM {heartbeats} WHERE id = $1");
        Ok(sqlx::query(&sql)
            .bind(id)
            .execute(&mut **tx)
            .await?
            .rows_affected())
    }

    /// Cancels every pending task that (transitively) depends on `id`.
    async fn cancel_dependents(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        id: Uuid,
    ) -> Result<Vec<Uuid>> {
        let table = self.tables.tasks_table_full_name();
        let deps = self.tables.dependencies_table_full_name();
        let sql = format!(
            "
WITH RECURSIVE dependents(id) AS (
    SELECT d.task_id FROM {deps} d WHERE d.dependency_id = $1
  UNION
    SELECT d.task_id FROM {deps} d JOIN dependents ON d.dependency_id = dependents.id
)
UPDATE {table} t
SET status = 'canceled',
    finished_at = now()
FROM dependents
WHERE t.id = dependents.id AND t.status = 'pending' AND t.finished_at IS NULL
RETURNING t.id
"
        );
        let canceled: Vec<Uuid> = sqlx::query_scalar(&sql)
            .bind(id)
            .fetch_all(&mut **tx)
            .await?;
        if !canceled.is_empty() {
            debug!("canceled {} dependents of task {id}", canceled.len());
        }
        Ok(canceled)
    }

    /// Puts a running task back to pending. With `count_retry` the retry cap
    /// applies and the attempt is counted.
    async fn requeue_task(&self, id: Uuid, count_retry: bool) -> Result<()> {
        let table = self.tables.tasks_table_full_name();
        let mut tx = self.pool.begin().await?;

        let task = self.lock_task(&mut tx, id).await?.ok_or(Error::NotExist)?;
        if task.status == TaskStatus::Canceled {
            return Err(Error::Canceled);
        }
        if !task.is_running() {
            return Err(Error::NotRunning);
        }

        if self.delete_heartbeat(&mut tx, id).await? == 0 {
            return Err(Error::NotExist);
        }

        if count_retry && task.retries >= self.max_retries as i32 {
            let message = format!("task exceeded the maximum of {} retries", self.max_retries);
            let sql = format!(
                "
UPDATE {table}
SET finished_at = now(),
    status = 'failed',
    error = $2,
    token = NULL
WHERE id = $1 AND finished_at IS NULL
"
            );
            sqlx::query(&sql)
                .bind(id)
                .bind(&message)
                .execute(&mut *tx)
                .await?;
            self.cancel_dependents(&mut tx, id).await?;
            self.notify(&mut tx, id).await?;
            tx.commit().await?;

            warn!(task_id = %id, task_type = %task.task_type, "[Finished Task] {message}");

            return Err(Error::RetriesExceeded {
                task: id,
                max: self.max_retries,
            });
        }

        let sql = format!(
            "
UPDATE {table}
SET started_at = NULL,
    token = NULL,
    status = 'pending',
    retries = retries + $2
WHERE id = $1 AND started_at IS NOT NULL AND finished_at IS NULL
"
        );
        let updated = sqlx::query(&sql)
            .bind(id)
            .bind(i32::from(count_retry))
            .execute(&mut *tx)
            .await?
            .rows_affected();
        if updated != 1 {
            return Err(Error::NotExist);
        }

        self.notify(&mut tx, id).await?;

        tx.commit().await?;

        if count_retry {
            info!(task_id = %id, task_type = %task.task_type, retries = task.retries + 1, "[Requeued Task]");
        } else {
            info!(task_id = %id, task_type = %task.task_type, "[Released Task]");
        }

        Ok(())
    }

    /// Publishes on the queue channel. Only delivered if the transaction commits.
    async fn notify(&self, tx: &mut Transaction<'_, Postgres>, id: Uuid) -> Result<()> {
        let notify_fn = self.tables.tasks_notify_fn_full_name();
        let sql = format!("SELECT {notify_fn}($1)");
        sqlx::query(&sql).bind(id).execute(&mut **tx).await?;
        Ok(())
    }

    async fn notify_cancel(&self, tx: &mut Transaction<'_, Postgres>, id: Uuid) -> Result<()> {
        let notify_fn = self.tables.tasks_notify_cancel_fn_full_name();
        let sql = format!("SELECT {notify_fn}($1)");
        sqlx::query(&sql).bind(id).execute(&mut **tx).await?;
        Ok(())
    }

    /// Operator listing, newest first.
    #[instrument(level = "trace", skip(self))]
    pub async fn list(&self, filter: &TaskFilter) -> Result<Vec<TaskInfo>> {
        let table = self.tables.tasks_table_full_name();
        let sql = format!(
            "
SELECT *
FROM {table}
WHERE ($1 = false OR finished_at IS NULL)
  AND ($2::float8 IS NULL OR queued_at >= now() - make_interval(secs => $2::float8))
  AND ($3::text IS NULL OR type = $3)
ORDER BY queued_at DESC
LIMIT $4
"
        );
        Ok(sqlx::query_as(&sql)
            .bind(filter.only_unfinished)
            .bind(filter.newer.map(|d| d.as_secs_f64()))
            .bind(filter.task_type.as_deref())
            .bind(filter.limit.unwrap_or(i64::MAX))
            .fetch_all(&self.pool)
            .await?)
    }

    /// Waits until the task reached a terminal status and returns its final
    /// state. Between notifications, at `poll_interval`, the task is queried
    /// manually.
    #[instrument(level = "trace", skip(self))]
    pub async fn wait_until_finished(
        &self,
        id: Uuid,
        poll_interval: Option<Duration>,
    ) -> Result<TaskInfo> {
        let start_time = Instant::now();

        let mut listener = sqlx::postgres::PgListener::connect_with(&self.pool).await?;
        listener.listen(self.tables.tasks_queue_name()).await?;

        let info = loop {
            let info = self.status(id).await?;
            if info.status.is_terminal() {
                break info;
            }

            trace!("waiting for task {id} to finish");

            let notification = if let Some(poll_interval) = poll_interval {
                tokio::select! {
                    _ = tokio::time::sleep(poll_interval) => continue,
                    notification = listener.recv() => notification,
                }
            } else {
                listener.recv().await
            };

            if let Err(err) = notification {
                return Err(err.into());
            }
        };

        debug!(
            "task {id} {}, wait time: {}ms",
            info.status,
            start_time.elapsed().as_millis()
        );

        Ok(info)
    }
}

#[async_trait]
impl Queue for PgQueue {
    #[instrument(level = "trace", skip(self, task), fields(task_type = %task.task_type))]
    async fn enqueue(&self, task: &Task) -> Result<Uuid> {
        let table = self.tables.tasks_table_full_name();
        let deps = self.tables.dependencies_table_full_name();
        let id = Uuid::new_v4();

        let mut tx = self.pool.begin().await?;

        // a dependency failing concurrently waits for this transaction, so
        // its dependent cancellation sees the new edges
        let poisoned = self.failed_dependencies(&mut tx, &task.dependencies).await?;
        let status = if poisoned.is_empty() {
            TaskStatus::Pending
        } else {
            TaskStatus::Canceled
        };

        let sql = format!(
            "
INSERT INTO {table} (id, type, payload, payload_version, org_id, resource_id, request_id, queued_at, status, finished_at)
VALUES ($1, $2, $3, $4, $5, $6, $7, statement_timestamp(), $8,
        CASE WHEN $9 THEN statement_timestamp() END)
"
        );
        sqlx::query(&sql)
            .bind(id)
            .bind(&task.task_type)
            .bind(&task.payload)
            .bind(task.payload_version)
            .bind(&task.org_id)
            .bind(task.resource_id)
            .bind(&task.request_id)
            .bind(status.as_str())
            .bind(status.is_terminal())
            .execute(&mut *tx)
            .await?;

        let sql = format!("INSERT INTO {deps} (task_id, dependency_id) VALUES ($1, $2)");
        for dependency in &task.dependencies {
            sqlx::query(&sql)
                .bind(id)
                .bind(dependency)
                .execute(&mut *tx)
                .await?;
        }

        self.notify(&mut tx, id).await?;

        tx.commit().await?;

        if poisoned.is_empty() {
            info!(task_id = %id, task_type = %task.task_type, "[Enqueued Task]");
        } else {
            warn!(
                task_id = %id,
                task_type = %task.task_type,
                "[Enqueued Task] canceled, dependencies {poisoned:?} did not complete"
            );
        }

        Ok(id)
    }

    async fn dequeue(&self, cancel: &CancellationToken, task_types: &[String]) -> Result<TaskInfo> {
        // register before the first attempt so no wakeup in between is lost
        let mut dequeuer = self.dequeuers.register();

        loop {
            if cancel.is_cancelled() {
                return Err(Error::ContextCanceled);
            }

            if let Some(info) = self.dequeue_maybe(task_types).await? {
                info!(task_id = %info.id, task_type = %info.task_type, "[Dequeued Task]");
                return Ok(info);
            }

            // no suitable task was found, wait for the next queue update
            tokio::select! {
                _ = cancel.cancelled() => return Err(Error::ContextCanceled),
                _ = dequeuer.woken() => {}
            }
        }
    }

    #[instrument(level = "trace", skip(self))]
    async fn status(&self, id: Uuid) -> Result<TaskInfo> {
        let table = self.tables.tasks_table_full_name();
        let sql = format!("SELECT * FROM {table} WHERE id = $1");
        let info: Option<TaskInfo> = sqlx::query_as(&sql)
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        let mut info = info.ok_or(Error::NotExist)?;
        info.dependencies = self.task_dependencies(&self.pool, id).await?;
        Ok(info)
    }

    #[instrument(level = "trace", skip(self, task_error))]
    async fn finish(&self, id: Uuid, task_error: Option<String>) -> Result<()> {
        let table = self.tables.tasks_table_full_name();
        let mut tx = self.pool.begin().await?;

        let task = self.lock_task(&mut tx, id).await?.ok_or(Error::NotExist)?;
        if task.status == TaskStatus::Canceled {
            return Err(Error::Canceled);
        }
        if !task.is_running() {
            return Err(Error::NotRunning);
        }

        if self.delete_heartbeat(&mut tx, id).await? == 0 {
            return Err(Error::NotExist);
        }

        let status = if task_error.is_some() {
            TaskStatus::Failed
        } else {
            TaskStatus::Completed
        };
        let error = task_error.as_deref().map(sanitize_error_message);

        let sql = format!(
            "
UPDATE {table}
SET finished_at = now(),
    status = $2,
    error = $3,
    token = NULL
WHERE id = $1 AND finished_at IS NULL
"
        );
        let updated = sqlx::query(&sql)
            .bind(id)
            .bind(status.as_str())
            .bind(error)
            .execute(&mut *tx)
            .await?
            .rows_affected();
        if updated != 1 {
            return Err(Error::NotExist);
        }

        if status == TaskStatus::Failed {
            self.cancel_dependents(&mut tx, id).await?;
        }

        // dependents of this task may have become ready
        self.notify(&mut tx, id).await?;

        tx.commit().await?;

        info!(task_id = %id, task_type = %task.task_type, %status, "[Finished Task]");

        Ok(())
    }

    #[instrument(level = "trace", skip(self))]
    async fn cancel(&self, id: Uuid) -> Result<()> {
        let table = self.tables.tasks_table_full_name();
        let mut tx = self.pool.begin().await?;

        let sql = format!(
            "
UPDATE {table}
SET status = 'canceled',
    finished_at = now(),
    token = NULL
WHERE id = $1 AND finished_at IS NULL
RETURNING type
"
        );
        let canceled: Option<String> = sqlx::query_scalar(&sql)
            .bind(id)
            .fetch_optional(&mut *tx)
            .await?;

        let Some(task_type) = canceled else {
            let sql = format!("SELECT count(*) FROM {table} WHERE id = $1");
            let n: i64 = sqlx::query_scalar(&sql).bind(id).fetch_one(&mut *tx).await?;
            return Err(if n == 0 {
                Error::NotExist
            } else {
                Error::NotRunning
            });
        };

        self.delete_heartbeat(&mut tx, id).await?;
        self.cancel_dependents(&mut tx, id).await?;
        self.notify(&mut tx, id).await?;
        self.notify_cancel(&mut tx, id).await?;

        tx.commit().await?;

        info!(task_id = %id, %task_type, "[Canceled Task]");

        Ok(())
    }

    #[instrument(level = "trace", skip(self))]
    async fn requeue(&self, id: Uuid) -> Result<()> {
        self.requeue_task(id, true).await
    }

    #[instrument(level = "trace", skip(self))]
    async fn release(&self, id: Uuid) -> Result<()> {
        self.requeue_task(id, false).await
    }

    #[instrument(level = "trace", skip(self))]
    async fn heartbeats(&self, older_than: Duration) -> Result<Vec<Uuid>> {
        let heartbeats = self.tables.heartbeats_table_full_name();
        let sql = format!(
            "SELECT token FROM {heartbeats} WHERE heartbeat < now() - make_interval(secs => $1)"
        );
        Ok(sqlx::query_scalar(&sql)
            .bind(older_than.as_secs_f64())
            .fetch_all(&self.pool)
            .await?)
    }

    #[instrument(level = "trace", skip(self))]
    async fn id_from_token(&self, token: Uuid) -> Result<Uuid> {
        let table = self.tables.tasks_table_full_name();
        let sql = format!(
            "SELECT id FROM {table} WHERE token = $1 AND finished_at IS NULL AND status != 'canceled'"
        );
        let id: Option<Uuid> = sqlx::query_scalar(&sql)
            .bind(token)
            .fetch_optional(&self.pool)
            .await?;
        id.ok_or(Error::NotExist)
    }

    #[instrument(level = "trace", skip(self))]
    async fn refresh_heartbeat(&self, token: Uuid) -> Result<()> {
        let heartbeats = self.tables.heartbeats_table_full_name();
        let sql = format!("UPDATE {heartbeats} SET heartbeat = now() WHERE token = $1");
        let updated = sqlx::query(&sql)
            .bind(token)
            .execute(&self.pool)
            .await?
            .rows_affected();
        if updated == 0 {
            return Err(Error::NotExist);
        }
        Ok(())
    }

    #[instrument(level = "trace", skip(self, task, payload), fields(task_id = %task.id))]
    async fn update_payload(&self, task: &TaskInfo, payload: Value) -> Result<TaskInfo> {
        let token = task.token.ok_or(Error::NotRunning)?;
        let table = self.tables.tasks_table_full_name();
        let sql = format!(
            "
UPDATE {table}
SET payload = $3
WHERE id = $1 AND token = $2 AND finished_at IS NULL
RETURNING *
"
        );
        let updated: Option<TaskInfo> = sqlx::query_as(&sql)
            .bind(task.id)
            .bind(token)
            .bind(payload)
            .fetch_optional(&self.pool)
            .await?;
        let mut updated = updated.ok_or(Error::NotRunning)?;
        updated.dependencies = task.dependencies.clone();
        Ok(updated)
    }

    fn subscribe_cancellations(&self) -> broadcast::Receiver<Uuid> {
        self.cancellations.subscribe()
    }
}

impl Drop for PgQueue {
    fn drop(&mut self) {
        self.stop_listener.cancel();
    }
}
