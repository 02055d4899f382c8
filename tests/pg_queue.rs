mod common;

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use common::{with_db, Result};
use parking_lot::Mutex;
use pg_tasking::{
    Error, PgQueue, Queue, TaskBuilder, TaskFilter, TaskPayload, TaskStatus, TaskingConfig,
};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

fn types(names: &[&str]) -> Vec<String> {
    names.iter().map(|name| name.to_string()).collect()
}

/// Dequeue that gives up after `wait`.
async fn try_dequeue(
    queue: &PgQueue,
    names: &[&str],
    wait: Duration,
) -> pg_tasking::Result<pg_tasking::TaskInfo> {
    let cancel = CancellationToken::new();
    let timer = {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(wait).await;
            cancel.cancel();
        })
    };
    let result = queue.dequeue(&cancel, &types(names)).await;
    timer.abort();
    result
}

async fn dequeue(queue: &PgQueue, names: &[&str]) -> pg_tasking::TaskInfo {
    try_dequeue(queue, names, Duration::from_secs(5))
        .await
        .expect("dequeue")
}

#[derive(Debug, PartialEq, Serialize, Deserialize)]
struct Echo {
    msg: String,
}

impl TaskPayload for Echo {
    const TYPE_NAME: &'static str = "echo";
}

#[tokio::test]
async fn enqueue_dequeue_finish() -> Result<()> {
    with_db(|pool, tables| {
        Box::pin(async move {
            let queue = PgQueue::new(pool, tables, &TaskingConfig::default()).await?;

            let id = TaskBuilder::for_payload(&Echo { msg: "x".into() })?
                .with_org("org-1")
                .with_request_id("req-1")
                .enqueue(&queue)
                .await?;

            let pending = queue.status(id).await?;
            assert_eq!(pending.status, TaskStatus::Pending);
            assert!(pending.started_at.is_none());
            assert!(pending.token.is_none());

            let info = dequeue(&queue, &["echo"]).await;
            assert_eq!(info.id, id);
            assert_eq!(info.status, TaskStatus::Running);
            assert!(info.started_at.is_some());
            assert!(info.token.is_some());
            assert_eq!(info.org_id, "org-1");
            assert_eq!(info.request_id.as_deref(), Some("req-1"));
            assert_eq!(info.payload::<Echo>()?, Echo { msg: "x".into() });
            assert_eq!(queue.status(id).await?.status, TaskStatus::Running);

            queue.finish(id, None).await?;

            let done = queue.status(id).await?;
            assert_eq!(done.status, TaskStatus::Completed);
            assert!(done.error.is_none());
            assert!(done.finished_at.is_some());
            assert!(done.token.is_none());

            queue.close().await;
            Ok(())
        })
    })
    .await
}

#[tokio::test]
async fn dependency_gates_claim() -> Result<()> {
    with_db(|pool, tables| {
        Box::pin(async move {
            let queue = PgQueue::new(pool, tables, &TaskingConfig::default()).await?;

            let a = TaskBuilder::new("a").enqueue(&queue).await?;
            let b = TaskBuilder::new("b").with_dependency(a).enqueue(&queue).await?;

            let result = try_dequeue(&queue, &["b"], Duration::from_millis(200)).await;
            assert!(matches!(result, Err(Error::ContextCanceled)));

            let claimed = dequeue(&queue, &["a"]).await;
            assert_eq!(claimed.id, a);

            let result = try_dequeue(&queue, &["b"], Duration::from_millis(200)).await;
            assert!(matches!(result, Err(Error::ContextCanceled)));

            queue.finish(a, None).await?;

            let claimed = dequeue(&queue, &["b"]).await;
            assert_eq!(claimed.id, b);
            assert_eq!(claimed.dependencies, vec![a]);
            assert_eq!(queue.status(b).await?.dependencies, vec![a]);

            queue.close().await;
            Ok(())
        })
    })
    .await
}

#[tokio::test]
async fn blocked_dequeue_wakes_on_enqueue() -> Result<()> {
    with_db(|pool, tables| {
        Box::pin(async move {
            let queue = Arc::new(PgQueue::new(pool, tables, &TaskingConfig::default()).await?);

            let waiter = {
                let queue = Arc::clone(&queue);
                tokio::spawn(async move {
                    queue
                        .dequeue(&CancellationToken::new(), &types(&["late"]))
                        .await
                })
            };

            tokio::time::sleep(Duration::from_millis(100)).await;
            let id = TaskBuilder::new("late").enqueue(&*queue).await?;

            let claimed = tokio::time::timeout(Duration::from_secs(5), waiter).await???;
            assert_eq!(claimed.id, id);

            queue.close().await;
            Ok(())
        })
    })
    .await
}

#[tokio::test]
async fn concurrent_dequeuers_never_share_a_task() -> Result<()> {
    with_db(|pool, tables| {
        Box::pin(async move {
            const TASKS: usize = 30;
            const WORKERS: usize = 6;

            let queue = Arc::new(PgQueue::new(pool, tables, &TaskingConfig::default()).await?);

            let mut enqueued = HashSet::new();
            for _ in 0..TASKS {
                enqueued.insert(TaskBuilder::new("job").enqueue(&*queue).await?);
            }

            let claimed = Arc::new(Mutex::new(Vec::new()));
            let cancel = CancellationToken::new();
            let mut workers = Vec::new();
            for _ in 0..WORKERS {
                let queue = Arc::clone(&queue);
                let claimed = Arc::clone(&claimed);
                let cancel = cancel.clone();
                workers.push(tokio::spawn(async move {
                    loop {
                        match queue.dequeue(&cancel, &types(&["job"])).await {
                            Ok(info) => {
                                claimed.lock().push(info.id);
                                queue.finish(info.id, None).await.expect("finish");
                            }
                            Err(Error::ContextCanceled) => break,
                            Err(err) => panic!("dequeue failed: {err}"),
                        }
                    }
                }));
            }

            let started = std::time::Instant::now();
            while claimed.lock().len() < TASKS {
                assert!(started.elapsed() < Duration::from_secs(20), "claims stalled");
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
            cancel.cancel();
            for worker in workers {
                worker.await?;
            }

            let claimed = claimed.lock().clone();
            let unique: HashSet<Uuid> = claimed.iter().copied().collect();
            assert_eq!(claimed.len(), unique.len(), "a task was claimed twice");
            assert_eq!(unique, enqueued);

            queue.close().await;
            Ok(())
        })
    })
    .await
}

#[tokio::test]
async fn finish_twice_fails() -> Result<()> {
    with_db(|pool, tables| {
        Box::pin(async move {
            let queue = PgQueue::new(pool, tables, &TaskingConfig::default()).await?;

            let id = TaskBuilder::new("a").enqueue(&queue).await?;
            assert!(matches!(queue.finish(id, None).await, Err(Error::NotRunning)));

            dequeue(&queue, &["a"]).await;
            queue.finish(id, Some("first".into())).await?;

            let second = queue.finish(id, None).await;
            assert!(matches!(second, Err(Error::NotRunning | Error::NotExist)));

            let info = queue.status(id).await?;
            assert_eq!(info.status, TaskStatus::Failed);
            assert_eq!(info.error.as_deref(), Some("first"));

            assert!(matches!(queue.finish(Uuid::new_v4(), None).await, Err(Error::NotExist)));
            assert!(matches!(queue.status(Uuid::new_v4()).await, Err(Error::NotExist)));

            queue.close().await;
            Ok(())
        })
    })
    .await
}

#[tokio::test]
async fn cancel_pending_running_and_finished() -> Result<()> {
    with_db(|pool, tables| {
        Box::pin(async move {
            let queue = PgQueue::new(pool, tables, &TaskingConfig::default()).await?;
            let mut canceled = queue.subscribe_cancellations();

            // pending
            let pending = TaskBuilder::new("p").enqueue(&queue).await?;
            queue.cancel(pending).await?;
            let info = queue.status(pending).await?;
            assert_eq!(info.status, TaskStatus::Canceled);
            assert!(info.error.is_none());
            assert!(info.finished_at.is_some());
            let result = try_dequeue(&queue, &["p"], Duration::from_millis(200)).await;
            assert!(matches!(result, Err(Error::ContextCanceled)));

            // running
            let running = TaskBuilder::new("r").enqueue(&queue).await?;
            let claimed = dequeue(&queue, &["r"]).await;
            queue.cancel(running).await?;
            assert_eq!(queue.status(running).await?.status, TaskStatus::Canceled);
            assert!(matches!(queue.finish(running, None).await, Err(Error::Canceled)));
            assert!(matches!(queue.requeue(running).await, Err(Error::Canceled)));
            assert!(matches!(
                queue.refresh_heartbeat(claimed.token.unwrap()).await,
                Err(Error::NotExist)
            ));

            // the cancel channel delivers both ids in order
            for expected in [pending, running] {
                let id = tokio::time::timeout(Duration::from_secs(5), canceled.recv()).await??;
                assert_eq!(id, expected);
            }

            // finished
            let finished = TaskBuilder::new("f").enqueue(&queue).await?;
            dequeue(&queue, &["f"]).await;
            queue.finish(finished, None).await?;
            assert!(matches!(queue.cancel(finished).await, Err(Error::NotRunning)));
            assert_eq!(queue.status(finished).await?.status, TaskStatus::Completed);

            assert!(matches!(queue.cancel(Uuid::new_v4()).await, Err(Error::NotExist)));

            queue.close().await;
            Ok(())
        })
    })
    .await
}

#[tokio::test]
async fn requeue_round_trip() -> Result<()> {
    with_db(|pool, tables| {
        Box::pin(async move {
            let queue = PgQueue::new(pool, tables, &TaskingConfig::default()).await?;

            let id = TaskBuilder::new("a").enqueue(&queue).await?;
            assert!(matches!(queue.requeue(id).await, Err(Error::NotRunning)));

            let first = dequeue(&queue, &["a"]).await;
            assert!(first.started_at.is_some());

            queue.requeue(id).await?;
            let info = queue.status(id).await?;
            assert_eq!(info.status, TaskStatus::Pending);
            assert!(info.started_at.is_none());
            assert!(info.token.is_none());
            assert_eq!(info.retries, 1);
            assert_eq!(info.queued_at, first.queued_at);

            let second = dequeue(&queue, &["a"]).await;
            assert_eq!(second.id, id);
            assert_ne!(second.token, first.token);

            queue.close().await;
            Ok(())
        })
    })
    .await
}

#[tokio::test]
async fn stale_heartbeat_is_found_and_requeued() -> Result<()> {
    with_db(|pool, tables| {
        Box::pin(async move {
            let queue = PgQueue::new(pool, tables, &TaskingConfig::default()).await?;

            let id = TaskBuilder::new("a").enqueue(&queue).await?;
            let first = dequeue(&queue, &["a"]).await;
            let token = first.token.unwrap();

            assert!(queue.heartbeats(Duration::from_secs(60)).await?.is_empty());

            tokio::time::sleep(Duration::from_millis(1200)).await;
            let stale = queue.heartbeats(Duration::from_secs(1)).await?;
            assert_eq!(stale, vec![token]);

            // a refresh makes it fresh again
            queue.refresh_heartbeat(token).await?;
            assert!(queue.heartbeats(Duration::from_secs(1)).await?.is_empty());

            assert_eq!(queue.id_from_token(token).await?, id);
            queue.requeue(id).await?;
            assert!(matches!(queue.id_from_token(token).await, Err(Error::NotExist)));

            let second = dequeue(&queue, &["a"]).await;
            assert_eq!(second.id, id);
            assert_ne!(second.token, Some(token));

            queue.close().await;
            Ok(())
        })
    })
    .await
}

#[tokio::test]
async fn failed_task_cancels_its_dependents() -> Result<()> {
    with_db(|pool, tables| {
        Box::pin(async move {
            let queue = PgQueue::new(pool, tables, &TaskingConfig::default()).await?;

            let a = TaskBuilder::new("a").enqueue(&queue).await?;
            let b = TaskBuilder::new("b").with_dependency(a).enqueue(&queue).await?;
            let c = TaskBuilder::new("c").with_dependency(b).enqueue(&queue).await?;
            let unrelated = TaskBuilder::new("c").enqueue(&queue).await?;

            dequeue(&queue, &["a"]).await;
            queue.finish(a, Some("boom".into())).await?;

            for id in [b, c] {
                let info = queue.status(id).await?;
                assert_eq!(info.status, TaskStatus::Canceled);
                assert!(info.finished_at.is_some());
            }
            assert_eq!(queue.status(unrelated).await?.status, TaskStatus::Pending);

            let claimed = dequeue(&queue, &["b", "c"]).await;
            assert_eq!(claimed.id, unrelated);

            queue.close().await;
            Ok(())
        })
    })
    .await
}

#[tokio::test]
async fn late_dependent_of_failed_task_never_runs() -> Result<()> {
    with_db(|pool, tables| {
        Box::pin(async move {
            let queue = PgQueue::new(pool, tables, &TaskingConfig::default()).await?;

            let failed = TaskBuilder::new("a").enqueue(&queue).await?;
            let canceled = TaskBuilder::new("a").enqueue(&queue).await?;
            let completed = TaskBuilder::new("c").enqueue(&queue).await?;

            queue.cancel(canceled).await?;
            assert_eq!(dequeue(&queue, &["a"]).await.id, failed);
            queue.finish(failed, Some("boom".into())).await?;
            assert_eq!(dequeue(&queue, &["c"]).await.id, completed);
            queue.finish(completed, None).await?;

            for dep in [failed, canceled] {
                let b = TaskBuilder::new("b").with_dependency(dep).enqueue(&queue).await?;
                let b = queue.status(b).await?;
                assert_eq!(b.status, TaskStatus::Canceled);
                assert!(b.finished_at.is_some());
                assert_eq!(b.dependencies, vec![dep]);
            }
            let mixed = TaskBuilder::new("b")
                .with_dependency(completed)
                .with_dependency(failed)
                .enqueue(&queue)
                .await?;
            assert_eq!(queue.status(mixed).await?.status, TaskStatus::Canceled);

            let result = try_dequeue(&queue, &["b"], Duration::from_millis(200)).await;
            assert!(matches!(result, Err(Error::ContextCanceled)));

            let ok = TaskBuilder::new("b").with_dependency(completed).enqueue(&queue).await?;
            assert_eq!(dequeue(&queue, &["b"]).await.id, ok);

            queue.close().await;
            Ok(())
        })
    })
    .await
}

#[tokio::test]
async fn unknown_dependency_rolls_back_enqueue() -> Result<()> {
    with_db(|pool, tables| {
        Box::pin(async move {
            let queue = PgQueue::new(pool, tables, &TaskingConfig::default()).await?;

            let result = TaskBuilder::new("a")
                .with_dependency(Uuid::new_v4())
                .enqueue(&queue)
                .await;
            assert!(matches!(result, Err(Error::Db(_))));
            assert!(queue.list(&TaskFilter::default()).await?.is_empty());

            queue.close().await;
            Ok(())
        })
    })
    .await
}

#[tokio::test]
async fn payload_checkpoint_needs_active_claim() -> Result<()> {
    with_db(|pool, tables| {
        Box::pin(async move {
            let queue = PgQueue::new(pool, tables, &TaskingConfig::default()).await?;

            let id = TaskBuilder::new("a")
                .with_request(json!({"step": 0}))?
                .enqueue(&queue)
                .await?;

            let pending = queue.status(id).await?;
            assert!(matches!(
                queue.update_payload(&pending, json!({"step": 1})).await,
                Err(Error::NotRunning)
            ));

            let claimed = dequeue(&queue, &["a"]).await;
            let updated = queue.update_payload(&claimed, json!({"step": 2})).await?;
            assert_eq!(updated.payload, Some(json!({"step": 2})));

            // after a requeue the old claim must not write anymore
            queue.requeue(id).await?;
            assert!(matches!(
                queue.update_payload(&claimed, json!({"step": 3})).await,
                Err(Error::NotRunning)
            ));

            let resumed = dequeue(&queue, &["a"]).await;
            assert_eq!(resumed.payload, Some(json!({"step": 2})));

            queue.close().await;
            Ok(())
        })
    })
    .await
}

#[tokio::test]
async fn requeue_beyond_max_retries_fails_task() -> Result<()> {
    with_db(|pool, tables| {
        Box::pin(async move {
            let config = TaskingConfig {
                max_retries: 1,
                ..Default::default()
            };
            let queue = PgQueue::new(pool, tables, &config).await?;

            let id = TaskBuilder::new("a").enqueue(&queue).await?;
            dequeue(&queue, &["a"]).await;
            queue.requeue(id).await?;
            dequeue(&queue, &["a"]).await;

            let result = queue.requeue(id).await;
            assert!(matches!(result, Err(Error::RetriesExceeded { max: 1, .. })));

            let info = queue.status(id).await?;
            assert_eq!(info.status, TaskStatus::Failed);
            assert!(info.error.unwrap().contains("retries"));
            assert!(queue.heartbeats(Duration::ZERO).await?.is_empty());

            queue.close().await;
            Ok(())
        })
    })
    .await
}

#[tokio::test]
async fn release_keeps_retry_budget() -> Result<()> {
    with_db(|pool, tables| {
        Box::pin(async move {
            let config = TaskingConfig {
                max_retries: 1,
                ..Default::default()
            };
            let queue = PgQueue::new(pool, tables, &config).await?;

            let id = TaskBuilder::new("a").enqueue(&queue).await?;
            for _ in 0..3 {
                dequeue(&queue, &["a"]).await;
                queue.release(id).await?;
                let info = queue.status(id).await?;
                assert_eq!(info.status, TaskStatus::Pending);
                assert_eq!(info.retries, 0);
                assert!(info.token.is_none());
            }
            assert!(queue.heartbeats(Duration::ZERO).await?.is_empty());
            assert!(matches!(queue.release(id).await, Err(Error::NotRunning)));

            dequeue(&queue, &["a"]).await;
            queue.requeue(id).await?;
            assert_eq!(queue.status(id).await?.retries, 1);

            queue.close().await;
            Ok(())
        })
    })
    .await
}

#[tokio::test]
async fn stored_error_is_sanitized() -> Result<()> {
    with_db(|pool, tables| {
        Box::pin(async move {
            let queue = PgQueue::new(pool, tables, &TaskingConfig::default()).await?;

            let id = TaskBuilder::new("a").enqueue(&queue).await?;
            dequeue(&queue, &["a"]).await;

            let message = format!("bad\0byte {}", "x".repeat(5000));
            queue.finish(id, Some(message)).await?;

            let error = queue.status(id).await?.error.unwrap();
            assert!(error.starts_with("badbyte "));
            assert_eq!(error.chars().count(), pg_tasking::task::MAX_ERROR_LENGTH);

            queue.close().await;
            Ok(())
        })
    })
    .await
}

#[tokio::test]
async fn wait_until_finished_and_list() -> Result<()> {
    with_db(|pool, tables| {
        Box::pin(async move {
            let queue = Arc::new(PgQueue::new(pool, tables, &TaskingConfig::default()).await?);

            let id = TaskBuilder::new("a").enqueue(&*queue).await?;
            let other = TaskBuilder::new("b").enqueue(&*queue).await?;

            let waiter = {
                let queue = Arc::clone(&queue);
                tokio::spawn(async move { queue.wait_until_finished(id, None).await })
            };

            dequeue(&queue, &["a"]).await;
            queue.finish(id, None).await?;

            let info = tokio::time::timeout(Duration::from_secs(5), waiter).await???;
            assert_eq!(info.status, TaskStatus::Completed);

            let unfinished = queue
                .list(&TaskFilter {
                    only_unfinished: true,
                    ..Default::default()
                })
                .await?;
            assert_eq!(
                unfinished.iter().map(|t| t.id).collect::<Vec<_>>(),
                vec![other]
            );

            let of_type = queue
                .list(&TaskFilter {
                    task_type: Some("a".into()),
                    newer: Some(Duration::from_secs(60)),
                    ..Default::default()
                })
                .await?;
            assert_eq!(of_type.len(), 1);
            assert_eq!(of_type[0].id, id);

            queue.close().await;
            Ok(())
        })
    })
    .await
}

#[tokio::test]
async fn install_is_idempotent() -> Result<()> {
    with_db(|pool, tables| {
        Box::pin(async move {
            assert!(tables.exists(&pool).await?);
            tables.create(&pool).await?;
            assert!(tables.exists(&pool).await?);
            Ok(())
        })
    })
    .await
}
