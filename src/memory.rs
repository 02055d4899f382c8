use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::dequeuers::Dequeuers;
use crate::task::sanitize_error_message;
use crate::{Error, Queue, Result, Task, TaskInfo, TaskStatus, TaskingConfig};

struct Heartbeat {
    id: Uuid,
    at: DateTime<Utc>,
}

#[derive(Default)]
struct State {
    tasks: HashMap<Uuid, TaskInfo>,
    /// Enqueue order.
    order: Vec<Uuid>,
    /// Position of every task in `order`.
    positions: HashMap<Uuid, usize>,
    /// Unclaimed pending tasks by position, claims are handed out oldest first.
    pending: BTreeMap<usize, Uuid>,
    /// Active claims by token.
    heartbeats: HashMap<Uuid, Heartbeat>,
}

impl State {
    fn is_ready(&self, task: &TaskInfo) -> bool {
        task.status == TaskStatus::Pending
            && task.started_at.is_none()
            && task.dependencies.iter().all(|dep| {
                self.tasks
                    .get(dep)
                    .map(|dep| dep.status == TaskStatus::Completed)
                    .unwrap_or(true)
            })
    }

    fn insert(&mut self, task: TaskInfo) {
        let id = task.id;
        let position = self.order.len();
        if task.status == TaskStatus::Pending {
            self.pending.insert(position, id);
        }
        self.order.push(id);
        self.positions.insert(id, position);
        self.tasks.insert(id, task);
    }

    fn set_pending(&mut self, id: Uuid, pending: bool) {
        let Some(&position) = self.positions.get(&id) else {
            return;
        };
        if pending {
            self.pending.insert(position, id);
        } else {
            self.pending.remove(&position);
        }
    }

    fn claim(&mut self, task_types: &[String]) -> Option<TaskInfo> {
        let id = self.pending.values().copied().find(|id| {
            self.tasks
                .get(id)
                .map(|task| task_types.contains(&task.task_type) && self.is_ready(task))
                .unwrap_or(false)
        })?;
        self.set_pending(id, false);

        let now = Utc::now();
        let token = Uuid::new_v4();
        let task = self.tasks.get_mut(&id)?;
        task.token = Some(token);
        task.started_at = Some(now);
        task.status = TaskStatus::Running;
        let claimed = task.clone();

        self.heartbeats.insert(token, Heartbeat { id, at: now });
        Some(claimed)
    }

    fn remove_heartbeat(&mut self, id: Uuid) -> bool {
        let before = self.heartbeats.len();
        self.heartbeats.retain(|_, heartbeat| heartbeat.id != id);
        before != self.heartbeats.len()
    }

    /// Running-state checks shared by finish and requeue.
    fn running_task(&self, id: Uuid) -> Result<&TaskInfo> {
        let task = self.tasks.get(&id).ok_or(Error::NotExist)?;
        if task.status == TaskStatus::Canceled {
            return Err(Error::Canceled);
        }
        if !task.is_running() {
            return Err(Error::NotRunning);
        }
        Ok(task)
    }

    fn terminate(&mut self, id: Uuid, status: TaskStatus, error: Option<String>) {
        if let Some(task) = self.tasks.get_mut(&id) {
            task.finished_at = Some(Utc::now());
            task.status = status;
            task.error = error;
            task.token = None;
        }
        self.set_pending(id, false);
    }

    /// Cancels every pending task that (transitively) depends on `id`.
    fn cancel_dependents(&mut self, id: Uuid) -> Vec<Uuid> {
        let mut canceled = Vec::new();
        let mut todo = VecDeque::from([id]);
        while let Some(parent) = todo.pop_front() {
            let dependents: Vec<Uuid> = self
                .pending
                .values()
                .filter_map(|id| self.tasks.get(id))
                .filter(|task| task.dependencies.contains(&parent))
                .map(|task| task.id)
                .collect();
            for dependent in dependents {
                self.terminate(dependent, TaskStatus::Canceled, None);
                canceled.push(dependent);
                todo.push_back(dependent);
            }
        }
        canceled
    }
}

/// [`Queue`] kept entirely in process memory. Follows the same state machine
/// as [`crate::PgQueue`] and is meant for tests and single-process setups.
pub struct MemoryQueue {
    state: Mutex<State>,
    dequeuers: Arc<Dequeuers>,
    cancellations: broadcast::Sender<Uuid>,
    max_retries: u32,
}

impl Default for MemoryQueue {
    fn default() -> Self {
        Self::new(&TaskingConfig::default())
    }
}

impl MemoryQueue {
    pub fn new(config: &TaskingConfig) -> Self {
        let (cancellations, _) = broadcast::channel(64);
        Self {
            state: Mutex::new(State::default()),
            dequeuers: Dequeuers::new(),
            cancellations,
            max_retries: config.max_retries,
        }
    }

    /// All tasks in enqueue order.
    pub fn list(&self) -> Vec<TaskInfo> {
        let state = self.state.lock();
        state
            .order
            .iter()
            .filter_map(|id| state.tasks.get(id).cloned())
            .collect()
    }

    fn wake_dequeuers(&self) {
        self.dequeuers.notify_all();
    }

    /// Puts a running task back to pending. With `count_retry` the retry cap
    /// applies and the attempt is counted.
    fn requeue_task(&self, id: Uuid, count_retry: bool) -> Result<()> {
        let result = {
            let mut state = self.state.lock();
            let task = state.running_task(id)?;
            let task_type = task.task_type.clone();
            let retries = task.retries;
            if !state.remove_heartbeat(id) {
                return Err(Error::NotExist);
            }

            if count_retry && retries >= self.max_retries as i32 {
                let message = format!("task exceeded the maximum of {} retries", self.max_retries);
                state.terminate(id, TaskStatus::Failed, Some(message));
                state.cancel_dependents(id);
                warn!(task_id = %id, %task_type, "[Finished Task] retries exceeded");
                Err(Error::RetriesExceeded {
                    task: id,
                    max: self.max_retries,
                })
            } else {
                if let Some(task) = state.tasks.get_mut(&id) {
                    task.started_at = None;
                    task.token = None;
                    task.status = TaskStatus::Pending;
                    task.retries += i32::from(count_retry);
                }
                state.set_pending(id, true);
                if count_retry {
                    info!(task_id = %id, %task_type, retries = retries + 1, "[Requeued Task]");
                } else {
                    info!(task_id = %id, %task_type, "[Released Task]");
                }
                Ok(())
            }
        };
        self.wake_dequeuers();
        result
    }
}

#[async_trait]
impl Queue for MemoryQueue {
    async fn enqueue(&self, task: &Task) -> Result<Uuid> {
        let id = Uuid::new_v4();
        let poisoned = {
            let mut state = self.state.lock();
            let mut poisoned = Vec::new();
            for dep in &task.dependencies {
                let dep = state.tasks.get(dep).ok_or(Error::NotExist)?;
                if matches!(dep.status, TaskStatus::Failed | TaskStatus::Canceled) {
                    poisoned.push(dep.id);
                }
            }
            let (status, finished_at) = if poisoned.is_empty() {
                (TaskStatus::Pending, None)
            } else {
                (TaskStatus::Canceled, Some(Utc::now()))
            };
            state.insert(TaskInfo {
                id,
                task_type: task.task_type.clone(),
                payload: task.payload.clone(),
                payload_version: task.payload_version,
                org_id: task.org_id.clone(),
                resource_id: task.resource_id,
                request_id: task.request_id.clone(),
                token: None,
                queued_at: Utc::now(),
                started_at: None,
                finished_at,
                status,
                error: None,
                retries: 0,
                dependencies: task.dependencies.clone(),
            });
            poisoned
        };
        self.wake_dequeuers();

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
        let mut dequeuer = self.dequeuers.register();

        loop {
            if cancel.is_cancelled() {
                return Err(Error::ContextCanceled);
            }

            let claimed = self.state.lock().claim(task_types);
            if let Some(info) = claimed {
                info!(task_id = %info.id, task_type = %info.task_type, "[Dequeued Task]");
                return Ok(info);
            }

            tokio::select! {
                _ = cancel.cancelled() => return Err(Error::ContextCanceled),
                _ = dequeuer.woken() => {}
            }
        }
    }

    async fn status(&self, id: Uuid) -> Result<TaskInfo> {
        self.state
            .lock()
            .tasks
            .get(&id)
            .cloned()
            .ok_or(Error::NotExist)
    }

    async fn finish(&self, id: Uuid, task_error: Option<String>) -> Result<()> {
        let status = if task_error.is_some() {
            TaskStatus::Failed
        } else {
            TaskStatus::Completed
        };
        let task_type = {
            let mut state = self.state.lock();
            let task_type = state.running_task(id)?.task_type.clone();
            if !state.remove_heartbeat(id) {
                return Err(Error::NotExist);
            }
            state.terminate(id, status, task_error.as_deref().map(sanitize_error_message));
            if status == TaskStatus::Failed {
                state.cancel_dependents(id);
            }
            task_type
        };
        self.wake_dequeuers();

        info!(task_id = %id, %task_type, %status, "[Finished Task]");

        Ok(())
    }

    async fn cancel(&self, id: Uuid) -> Result<()> {
        let task_type = {
            let mut state = self.state.lock();
            let task = state.tasks.get(&id).ok_or(Error::NotExist)?;
            if task.finished_at.is_some() {
                return Err(Error::NotRunning);
            }
            let task_type = task.task_type.clone();
            state.remove_heartbeat(id);
            state.terminate(id, TaskStatus::Canceled, None);
            state.cancel_dependents(id);
            task_type
        };
        // no receivers is fine
        let _ = self.cancellations.send(id);
        self.wake_dequeuers();

        info!(task_id = %id, %task_type, "[Canceled Task]");

        Ok(())
    }

    async fn requeue(&self, id: Uuid) -> Result<()> {
        self.requeue_task(id, true)
    }

    async fn release(&self, id: Uuid) -> Result<()> {
        self.requeue_task(id, false)
    }

    async fn heartbeats(&self, older_than: Duration) -> Result<Vec<Uuid>> {
        let older_than = chrono::Duration::from_std(older_than)
            .map_err(|err| Error::Config(format!("heartbeat duration out of range: {err}")))?;
        let cutoff = Utc::now() - older_than;
        Ok(self
            .state
            .lock()
            .heartbeats
            .iter()
            .filter(|(_, heartbeat)| heartbeat.at < cutoff)
            .map(|(token, _)| *token)
            .collect())
    }

    async fn id_from_token(&self, token: Uuid) -> Result<Uuid> {
        let state = self.state.lock();
        let id = state.heartbeats.get(&token).ok_or(Error::NotExist)?.id;
        state
            .tasks
            .get(&id)
            .filter(|task| {
                task.token == Some(token)
                    && task.finished_at.is_none()
                    && task.status != TaskStatus::Canceled
            })
            .map(|task| task.id)
            .ok_or(Error::NotExist)
    }

    async fn refresh_heartbeat(&self, token: Uuid) -> Result<()> {
        let mut state = self.state.lock();
        let heartbeat = state.heartbeats.get_mut(&token).ok_or(Error::NotExist)?;
        heartbeat.at = Utc::now();
        Ok(())
    }

    async fn update_payload(&self, task: &TaskInfo, payload: Value) -> Result<TaskInfo> {
        let token = task.token.ok_or(Error::NotRunning)?;
        let mut state = self.state.lock();
        let stored = state
            .tasks
            .get_mut(&task.id)
            .filter(|stored| stored.token == Some(token) && stored.finished_at.is_none())
            .ok_or(Error::NotRunning)?;
        stored.payload = Some(payload);
        Ok(stored.clone())
    }

    fn subscribe_cancellations(&self) -> broadcast::Receiver<Uuid> {
        self.cancellations.subscribe()
    }
}
