use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::AtomicUsize;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::{AbortHandle, JoinHandle};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::Instrument;
use uuid::Uuid;

use crate::pool::TaskHandler;
use crate::{Error, Metrics, Queue};

static COUNTER: AtomicUsize = AtomicUsize::new(1);

/// Pause after a failed dequeue so a broken database does not turn the worker
/// into a busy loop.
const DEQUEUE_BACKOFF: Duration = Duration::from_secs(1);

/// How long a handler gets to react to the shutdown signal before it is
/// aborted.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(1);

/// Cancellation tokens of the handlers currently running in a pool, by task id.
pub(crate) type RunningTasks = Arc<Mutex<HashMap<Uuid, CancellationToken>>>;

/// The task a worker currently owns.
struct InFlight {
    id: Uuid,
    token: Uuid,
    cancel: CancellationToken,
    handler: AbortHandle,
}

/// Processes one task at a time: claim, run the handler, finish. Meanwhile the
/// heartbeat of the claim is refreshed; on shutdown the claim is handed back.
#[derive(Clone)]
pub(crate) struct Worker {
    name: String,
    queue: Arc<dyn Queue>,
    handlers: Arc<HashMap<String, TaskHandler>>,
    task_types: Arc<Vec<String>>,
    heartbeat_interval: Duration,
    metrics: Option<Metrics>,
    running: RunningTasks,
    in_flight: Arc<Mutex<Option<InFlight>>>,
}

impl Worker {
    pub(crate) fn new(
        queue: Arc<dyn Queue>,
        handlers: Arc<HashMap<String, TaskHandler>>,
        heartbeat_interval: Duration,
        metrics: Option<Metrics>,
        running: RunningTasks,
    ) -> Self {
        let n = COUNTER.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
        let mut task_types: Vec<String> = handlers.keys().cloned().collect();
        task_types.sort();
        Self {
            name: format!("Worker.{n}"),
            queue,
            handlers,
            task_types: Arc::new(task_types),
            heartbeat_interval,
            metrics,
            running,
            in_flight: Arc::new(Mutex::new(None)),
        }
    }

    pub(crate) async fn run(self, stop: CancellationToken) {
        let name = self.name.clone();
        info!("[{name}] starting, accepting {:?}", self.task_types);

        let mut heartbeat = tokio::time::interval(self.heartbeat_interval);
        heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // the first tick completes immediately
        heartbeat.tick().await;

        let mut episode = self.spawn_episode(&stop);

        loop {
            tokio::select! {
                biased;
                _ = stop.cancelled() => {
                    debug!("[{name}] received STOP signal");
                    break;
                }
                _ = heartbeat.tick() => self.refresh_heartbeat().await,
                result = &mut episode => {
                    if let Err(err) = result {
                        if err.is_panic() {
                            error!("[{name}] panic while claiming or finishing a task: {err}");
                        }
                        self.take_in_flight();
                    }
                    // ready again
                    episode = self.spawn_episode(&stop);
                }
            }
        }

        self.shutdown(episode).await;

        info!("[{name}] stopped");
    }

    fn spawn_episode(&self, stop: &CancellationToken) -> JoinHandle<()> {
        tokio::spawn(self.clone().process_next(stop.clone()))
    }

    /// One claim episode: waits for a task, runs its handler and finishes it.
    async fn process_next(self, stop: CancellationToken) {
        let name = &self.name;

        let info = match self.queue.dequeue(&stop, &self.task_types).await {
            Ok(info) => info,
            Err(Error::ContextCanceled) => return,
            Err(err) => {
                error!("[{name}] unable to dequeue: {err}");
                tokio::select! {
                    _ = stop.cancelled() => {}
                    _ = tokio::time::sleep(DEQUEUE_BACKOFF) => {}
                }
                return;
            }
        };

        let id = info.id;
        let span = info_span!(
            "task",
            task_id = %id,
            task_type = %info.task_type,
            request_id = info.request_id.as_deref().unwrap_or_default(),
        );

        if let Some(metrics) = &self.metrics {
            metrics.record_message_latency(info.queued_at);
        }

        let Some(token) = info.token else {
            error!(parent: &span, "[{name}] claimed task without a token");
            return;
        };

        let Some(handler) = self.handlers.get(&info.task_type) else {
            // task_types is derived from the handler map, so this is a bug
            let message = format!("no handler registered for {}", info.task_type);
            error!(parent: &span, "[{name}] {message}");
            if let Err(err) = self.queue.finish(id, Some(message)).await {
                error!(parent: &span, "[{name}] unable to finish task: {err}");
            }
            return;
        };

        let cancel = CancellationToken::new();
        let future = handler(cancel.clone(), info, Arc::clone(&self.queue)).instrument(span.clone());

        let handle = {
            let mut in_flight = self.in_flight.lock();
            if stop.is_cancelled() {
                // the worker is already shutting down and will not requeue this one
                None
            } else {
                let handle = tokio::spawn(future);
                *in_flight = Some(InFlight {
                    id,
                    token,
                    cancel: cancel.clone(),
                    handler: handle.abort_handle(),
                });
                self.running.lock().insert(id, cancel.clone());
                Some(handle)
            }
        };

        let Some(handle) = handle else {
            if let Err(err) = self.queue.release(id).await {
                warn!(parent: &span, "[{name}] unable to requeue task claimed during shutdown: {err}");
            }
            return;
        };

        debug!(parent: &span, "[{name}] processing");

        let result = handle.await;

        // whoever takes the in-flight task owns the claim from here on
        if self.take_in_flight().is_none() {
            debug!(parent: &span, "[{name}] claim was handed back on shutdown, not finishing");
            return;
        }

        let result = match result {
            Ok(result) => result,
            Err(err) if err.is_panic() => {
                // the heartbeat stops now, the monitor requeues the orphan
                error!(parent: &span, "[{name}] handler panicked: {err}");
                return;
            }
            Err(_) => {
                debug!(parent: &span, "[{name}] handler aborted");
                return;
            }
        };

        if let Some(metrics) = &self.metrics {
            metrics.record_message_result(result.is_ok() || cancel.is_cancelled());
        }

        let task_error = result.err().map(|err| format!("{err:#}"));
        if let Some(task_error) = &task_error {
            info!(parent: &span, "[{name}] handler failed: {task_error}");
        }

        match self.queue.finish(id, task_error).await {
            Ok(()) => {}
            Err(Error::Canceled) => {
                info!(parent: &span, "[{name}] task was canceled while running");
            }
            Err(err @ (Error::NotRunning | Error::NotExist)) => {
                warn!(parent: &span, "[{name}] claim was lost before finishing: {err}");
            }
            Err(err) => {
                error!(parent: &span, "[{name}] unable to finish task: {err}");
            }
        }
    }

    /// Takes the in-flight task, if it was not taken yet.
    fn take_in_flight(&self) -> Option<InFlight> {
        let task = self.in_flight.lock().take()?;
        self.running.lock().remove(&task.id);
        Some(task)
    }

    async fn refresh_heartbeat(&self) {
        let current = self
            .in_flight
            .lock()
            .as_ref()
            .map(|task| (task.id, task.token));
        let Some((id, token)) = current else {
            return;
        };

        match self.queue.refresh_heartbeat(token).await {
            Ok(()) => trace!("[{}] refreshed heartbeat of {id}", self.name),
            Err(Error::NotExist) => {
                warn!("[{}] heartbeat of {id} is gone, task was requeued or canceled", self.name);
            }
            Err(err) => error!("[{}] unable to refresh heartbeat of {id}: {err}", self.name),
        }
    }

    /// Hands the in-flight task back to the queue, trips the handler token
    /// and waits for the current episode to wind down. A handler that does
    /// not return within [`SHUTDOWN_GRACE`] is aborted at its next `.await`.
    async fn shutdown(&self, mut episode: JoinHandle<()>) {
        let name = &self.name;

        let handler = match self.take_in_flight() {
            Some(task) => {
                match self.queue.release(task.id).await {
                    Ok(()) => info!("[{name}] requeued {} on shutdown", task.id),
                    Err(Error::NotRunning | Error::NotExist | Error::Canceled) => {
                        debug!("[{name}] {} finished before it could be requeued", task.id);
                    }
                    Err(err) => warn!("[{name}] unable to requeue {} on shutdown: {err}", task.id),
                }
                task.cancel.cancel();
                Some(task.handler)
            }
            None => None,
        };

        let result = match tokio::time::timeout(SHUTDOWN_GRACE, &mut episode).await {
            Ok(result) => result,
            Err(_) => {
                if let Some(handler) = handler {
                    warn!("[{name}] handler ignored the shutdown signal, aborting it");
                    handler.abort();
                }
                episode.await
            }
        };

        if let Err(err) = result {
            if err.is_panic() {
                error!("[{name}] panic while shutting down: {err}");
            }
        }
    }
}

impl std::fmt::Debug for Worker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Worker")
            .field("name", &self.name)
            .field("task_types", &self.task_types)
            .finish()
    }
}
