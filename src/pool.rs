use futures::Future;
use std::collections::HashMap;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::worker::{RunningTasks, Worker};
use crate::{Error, Metrics, Queue, Result, TaskInfo, TaskType, TaskingConfig};

pub type TaskFunctionResult = Pin<Box<dyn Future<Output = anyhow::Result<()>> + Send>>;

/// A task handler. Gets a token that fires when the task is canceled or the
/// worker shuts down, the claimed task and the queue to checkpoint into.
/// Returning an error fails the task with that message.
///
/// Cancellation is cooperative. On cancel the handler keeps running until it
/// returns. On shutdown the task is handed back to the queue first, then the
/// token fires; a handler still running a second later is dropped at its
/// next `.await`. Handlers with side effects should watch the token and
/// checkpoint through [`Queue::update_payload`].
pub type TaskHandler =
    Arc<dyn Fn(CancellationToken, TaskInfo, Arc<dyn Queue>) -> TaskFunctionResult + Send + Sync>;

/// Owns the handlers, the workers and the heartbeat monitor of one process.
pub struct WorkerPool {
    queue: Arc<dyn Queue>,
    config: TaskingConfig,
    handlers: HashMap<String, TaskHandler>,
    metrics: Option<Metrics>,
    running: RunningTasks,
    stop: CancellationToken,
    workers: Vec<JoinHandle<()>>,
    background: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    pub fn new(queue: Arc<dyn Queue>, config: TaskingConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            queue,
            config,
            handlers: HashMap::new(),
            metrics: None,
            running: Default::default(),
            stop: CancellationToken::new(),
            workers: Vec::new(),
            background: Vec::new(),
        })
    }

    #[must_use]
    pub fn with_metrics(mut self, metrics: Metrics) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn metrics(&self) -> Option<&Metrics> {
        self.metrics.as_ref()
    }

    pub fn queue(&self) -> &Arc<dyn Queue> {
        &self.queue
    }

    /// Registers the handler for `task_type`, replacing an earlier one. Only
    /// handlers registered before [`WorkerPool::start_workers`] are used.
    pub fn register_handler<F>(&mut self, task_type: impl TaskType, handler: F)
    where
        F: Fn(CancellationToken, TaskInfo, Arc<dyn Queue>) -> TaskFunctionResult
            + Send
            + Sync
            + 'static,
    {
        let task_type = task_type.to_string();
        if self.handlers.insert(task_type.clone(), Arc::new(handler)).is_some() {
            warn!("replaced handler for {task_type}");
        }
    }

    pub fn task_types(&self) -> Vec<String> {
        let mut types: Vec<String> = self.handlers.keys().cloned().collect();
        types.sort();
        types
    }

    /// Spawns the configured number of workers plus the heartbeat monitor and
    /// the cancellation watcher. All of them stop once `ctx` fires or
    /// [`WorkerPool::stop`] is called.
    pub fn start_workers(&mut self, ctx: &CancellationToken) -> Result<()> {
        if self.handlers.is_empty() {
            return Err(Error::Config("no task handlers registered".to_string()));
        }
        if !self.workers.is_empty() {
            return Err(Error::Config("workers already started".to_string()));
        }

        // stopping the pool must not cancel the caller's token
        self.stop = ctx.child_token();

        let handlers = Arc::new(self.handlers.clone());
        for _ in 0..self.config.worker_count {
            let worker = Worker::new(
                Arc::clone(&self.queue),
                Arc::clone(&handlers),
                self.config.heartbeat_refresh_interval(),
                self.metrics.clone(),
                Arc::clone(&self.running),
            );
            self.workers.push(tokio::spawn(worker.run(self.stop.clone())));
        }

        self.background.push(tokio::spawn(heartbeat_monitor(
            Arc::clone(&self.queue),
            self.config.heartbeat,
            self.config.heartbeat_check_interval(),
            self.stop.clone(),
        )));
        self.background.push(tokio::spawn(cancellation_watcher(
            Arc::clone(&self.queue),
            Arc::clone(&self.running),
            self.stop.clone(),
        )));

        info!(
            "started {} workers for {:?}",
            self.config.worker_count,
            self.task_types()
        );

        Ok(())
    }

    /// Number of handlers currently running.
    pub fn running_tasks(&self) -> usize {
        self.running.lock().len()
    }

    /// Signals every worker to stop and waits until all have exited, each
    /// having requeued its in-flight task.
    pub async fn stop(&mut self) {
        self.stop.cancel();

        for handle in self.workers.drain(..).chain(self.background.drain(..)) {
            if let Err(err) = handle.await {
                error!("worker pool task failed: {err}");
            }
        }

        info!("worker pool stopped");
    }
}

/// Requeues tasks whose claim has not been refreshed within `heartbeat`. This
/// is what brings back work of crashed or hung workers.
async fn heartbeat_monitor(
    queue: Arc<dyn Queue>,
    heartbeat: Duration,
    check_interval: Duration,
    stop: CancellationToken,
) {
    let mut interval = tokio::time::interval(check_interval);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = stop.cancelled() => break,
            _ = interval.tick() => {}
        }

        let tokens = match queue.heartbeats(heartbeat).await {
            Ok(tokens) => tokens,
            Err(err) => {
                error!("unable to scan heartbeats: {err}");
                continue;
            }
        };

        for token in tokens {
            let id = match queue.id_from_token(token).await {
                Ok(id) => id,
                Err(err) => {
                    warn!("stale heartbeat {token} has no running task: {err}");
                    continue;
                }
            };
            match queue.requeue(id).await {
                Ok(()) => warn!(task_id = %id, "requeued task with stale heartbeat"),
                Err(Error::RetriesExceeded { max, .. }) => {
                    warn!(task_id = %id, "stale task failed after {max} retries");
                }
                Err(err) => warn!(task_id = %id, "unable to requeue stale task: {err}"),
            }
        }
    }

    debug!("heartbeat monitor stopped");
}

/// Trips the handler token of running tasks that get canceled.
async fn cancellation_watcher(queue: Arc<dyn Queue>, running: RunningTasks, stop: CancellationToken) {
    let mut canceled = queue.subscribe_cancellations();

    loop {
        let id: Uuid = tokio::select! {
            _ = stop.cancelled() => break,
            id = canceled.recv() => match id {
                Ok(id) => id,
                Err(RecvError::Lagged(n)) => {
                    warn!("missed {n} cancellations");
                    continue;
                }
                Err(RecvError::Closed) => break,
            },
        };

        if let Some(cancel) = running.lock().get(&id) {
            info!(task_id = %id, "canceling running handler");
            cancel.cancel();
        }
    }

    debug!("cancellation watcher stopped");
}
