#![allow(dead_code)]

use std::pin::Pin;
use std::time::Duration;

use futures::Future;
use pg_setup::PostgresDBBuilder;
use pg_tasking::{Queue, TaskInfo, TaskStatus, TaskTableBuilder, TaskTables};
use sqlx::{Pool, Postgres};
use uuid::Uuid;

pub type Result<T> = std::result::Result<T, Box<dyn std::error::Error>>;

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::builder()
                .parse_lossy("info,pg_tasking=debug,sqlx=warn"),
        )
        .with_test_writer()
        .try_init();
}

/// Runs `cb` against a throwaway database with freshly installed task tables.
/// Skipped when `TEST_DATABASE_URL` is not set.
pub async fn with_db(
    cb: impl FnOnce(Pool<Postgres>, TaskTables) -> Pin<Box<dyn Future<Output = Result<()>>>>,
) -> Result<()> {
    init_tracing();

    let Ok(pg_url) = std::env::var("TEST_DATABASE_URL") else {
        eprintln!("TEST_DATABASE_URL not set, skipping");
        return Ok(());
    };

    // one database per test so tests can run in parallel
    let base_url = pg_url
        .rsplit_once('/')
        .map(|(base, _)| base)
        .unwrap_or(&pg_url);
    let db_url = format!("{base_url}/pg_tasking_{}", Uuid::new_v4().simple());

    let db = PostgresDBBuilder::new(db_url).start().await?;

    let result = {
        let pool = db.pool().await?;

        let tables = TaskTableBuilder::new().base_name("test_tasks").build();
        tables.create(&pool).await?;

        let result = cb(pool.clone(), tables.clone()).await;

        tables.drop(&pool).await?;
        pool.close().await;

        result
    };

    result?;

    Ok(())
}

/// Polls `id` until it reaches `status`.
pub async fn wait_for_status(
    queue: &dyn Queue,
    id: Uuid,
    status: TaskStatus,
    timeout: Duration,
) -> TaskInfo {
    let started = std::time::Instant::now();
    loop {
        let info = queue.status(id).await.expect("task status");
        if info.status == status {
            return info;
        }
        assert!(
            started.elapsed() < timeout,
            "task {id} did not reach {status} within {timeout:?}, is {}",
            info.status
        );
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}
