use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::{Result, Task, TaskInfo};

/// The task queue as seen by producers, workers and handlers.
///
/// Every state transition is atomic: readers never observe a half-applied
/// claim, finish, cancel or requeue. Wakeup notifications are only hints to
/// retry a claim, correctness lives entirely in the store.
#[async_trait]
pub trait Queue: Send + Sync {
    /// Stores `task` as pending together with its dependency edges and wakes
    /// blocked dequeuers. Returns the new task id.
    ///
    /// A task depending on a failed or canceled task is stored as canceled
    /// right away, it would never become ready.
    async fn enqueue(&self, task: &Task) -> Result<Uuid>;

    /// Claims one ready task whose type is in `task_types`, blocking until one
    /// becomes available. Fails with [`crate::Error::ContextCanceled`] once
    /// `cancel` fires.
    async fn dequeue(&self, cancel: &CancellationToken, task_types: &[String]) -> Result<TaskInfo>;

    /// Snapshot of a task including its dependency ids.
    async fn status(&self, id: Uuid) -> Result<TaskInfo>;

    /// Terminates a running task as completed (`task_error` is `None`) or
    /// failed with the given message.
    async fn finish(&self, id: Uuid, task_error: Option<String>) -> Result<()>;

    /// Marks a pending or running task as canceled. A running handler is not
    /// interrupted, it learns about the cancellation through
    /// [`Queue::subscribe_cancellations`].
    async fn cancel(&self, id: Uuid) -> Result<()>;

    /// Puts a running task back to pending. Counts as a retry: once a task was
    /// requeued `max_retries` times, the next requeue fails it with
    /// [`crate::Error::RetriesExceeded`].
    async fn requeue(&self, id: Uuid) -> Result<()>;

    /// Hands a claim back to the queue without counting a retry. Used by
    /// workers that shut down while owning a task.
    async fn release(&self, id: Uuid) -> Result<()>;

    /// Tokens of all claims whose heartbeat is older than `older_than`.
    async fn heartbeats(&self, older_than: Duration) -> Result<Vec<Uuid>>;

    /// Resolves the claim token of a running task to the task id.
    async fn id_from_token(&self, token: Uuid) -> Result<Uuid>;

    async fn refresh_heartbeat(&self, token: Uuid) -> Result<()>;

    /// Overwrites the payload of `task` to checkpoint progress. Only the
    /// holder of the active claim (matching token) may do this.
    async fn update_payload(&self, task: &TaskInfo, payload: Value) -> Result<TaskInfo>;

    /// Ids of tasks canceled from now on.
    fn subscribe_cancellations(&self) -> broadcast::Receiver<Uuid>;
}
