use sqlx::{Pool, Postgres, Result, Transaction};

/// Used to make the postgres table/view/function/channel names pluggable.
/// You'll typically want to use its implementor [`TaskTables`] that can be
/// instantiated with a customizable schema and name prefix.
pub trait TaskTableProvider: Send + Sync + 'static {
    fn schema_name(&self) -> &str;
    fn tasks_table(&self) -> &str;
    fn dependencies_table(&self) -> &str;
    fn heartbeats_table(&self) -> &str;
    fn tasks_ready_view(&self) -> &str;
    fn tasks_notify_fn(&self) -> &str;
    fn tasks_notify_cancel_fn(&self) -> &str;

    /// Channel that Enqueue/Finish/Cancel/Requeue publish to so that blocked
    /// dequeuers retry their claim.
    fn tasks_queue_name(&self) -> &str;

    /// Channel carrying the ids of canceled tasks.
    fn tasks_cancel_name(&self) -> String {
        format!("{}_cancel", self.tasks_table())
    }

    fn tasks_table_full_name(&self) -> String {
        format!("{}.{}", self.schema_name(), self.tasks_table())
    }
    fn dependencies_table_full_name(&self) -> String {
        format!("{}.{}", self.schema_name(), self.dependencies_table())
    }
    fn heartbeats_table_full_name(&self) -> String {
        format!("{}.{}", self.schema_name(), self.heartbeats_table())
    }
    fn tasks_ready_view_full_name(&self) -> String {
        format!("{}.{}", self.schema_name(), self.tasks_ready_view())
    }
    fn tasks_notify_fn_full_name(&self) -> String {
        format!("{}.{}", self.schema_name(), self.tasks_notify_fn())
    }
    fn tasks_notify_cancel_fn_full_name(&self) -> String {
        format!("{}.{}", self.schema_name(), self.tasks_notify_cancel_fn())
    }
}

impl TaskTableProvider for TaskTables {
    fn schema_name(&self) -> &str {
        &self.schema
    }

    fn tasks_table(&self) -> &str {
        &self.tasks_table.name
    }

    fn dependencies_table(&self) -> &str {
        &self.dependencies_table.name
    }

    fn heartbeats_table(&self) -> &str {
        &self.heartbeats_table.name
    }

    fn tasks_ready_view(&self) -> &str {
        &self.tasks_ready.name
    }

    fn tasks_notify_fn(&self) -> &str {
        &self.tasks_notify.name
    }

    fn tasks_notify_cancel_fn(&self) -> &str {
        &self.tasks_notify_cancel.name
    }

    fn tasks_queue_name(&self) -> &str {
        &self.tasks_queue_name
    }

    fn tasks_cancel_name(&self) -> String {
        self.tasks_cancel_name.clone()
    }
}

// -=-=-=-=-=-=-=-=-=-=-=-=-=-=-=-=-=-=-=-=-=-=-=-=-=-=-=-

/// Helper used by [`TaskTables`] to create/delete/test existance of postgres
/// entities.
#[derive(Debug, Clone)]
enum EntityType {
    Function,
    View,
    Table,
    Index,
}

#[derive(Debug, Clone)]
pub struct TaskTableEntity {
    schema: String,
    name: String,
    definition: String,
    entity_type: EntityType,
}

impl TaskTableEntity {
    fn new(schema: &str, name: String, definition: String, entity_type: EntityType) -> Self {
        Self {
            schema: schema.to_string(),
            name,
            definition,
            entity_type,
        }
    }

    async fn exists(&self, tx: &mut Transaction<'_, Postgres>) -> Result<bool> {
        let Self {
            schema,
            name,
            entity_type,
            ..
        } = self;

        let query = match entity_type {
            EntityType::Function => {
                "
SELECT count(*)
FROM information_schema.routines
WHERE routine_schema = $1 AND routine_name = $2
"
            }
            EntityType::View | EntityType::Table => {
                "
SELECT count(*)
FROM information_schema.tables
WHERE table_schema = $1 AND table_name = $2
"
            }
            EntityType::Index => {
                "
SELECT count(*)
FROM pg_indexes
WHERE schemaname = $1 AND indexname = $2
"
            }
        };

        let n = sqlx::query_scalar::<_, i64>(query)
            .bind(schema)
            .bind(name)
            .fetch_one(&mut **tx)
            .await?;

        let exists = n > 0;

        debug!("{schema}.{name} exists={exists}");

        Ok(exists)
    }

    async fn create(&self, tx: &mut Transaction<'_, Postgres>) -> Result<()> {
        if self.exists(tx).await? {
            return Ok(());
        }
        sqlx::query(&self.definition).execute(&mut **tx).await?;
        debug!("{}.{} created", self.schema, self.name);
        Ok(())
    }

    async fn drop(&self, tx: &mut Transaction<'_, Postgres>) -> Result<()> {
        if !self.exists(tx).await? {
            return Ok(());
        }

        let Self {
            schema,
            name,
            entity_type,
            ..
        } = self;

        let query = match entity_type {
            EntityType::Function => format!("DROP FUNCTION {schema}.{name} CASCADE"),
            EntityType::View => format!("DROP VIEW {schema}.{name} CASCADE"),
            EntityType::Table => format!("DROP TABLE {schema}.{name} CASCADE"),
            EntityType::Index => format!("DROP INDEX {schema}.{name} CASCADE"),
        };

        sqlx::query(&query).execute(&mut **tx).await?;

        debug!("{}.{} dropped", self.schema, self.name);

        Ok(())
    }
}

// -=-=-=-=-=-=-=-=-=-=-=-=-=-=-=-=-=-=-=-=-=-=-=-=-=-=-=-

/// Use this to make [`TaskTables`].
#[derive(Default)]
pub struct TaskTableBuilder {
    schema_name: Option<String>,
    base_name: Option<String>,
}

impl TaskTableBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// The postgres schema name to install the task queue tables into.
    #[must_use]
    pub fn schema_name(mut self, schema_name: impl ToString) -> Self {
        self.schema_name = Some(schema_name.to_string());
        self
    }

    /// Prefix name used for the postgres entities and notification channels.
    /// Useful if you want to install multiple independent task queues into the
    /// same database.
    #[must_use]
    pub fn base_name(mut self, base_name: impl ToString) -> Self {
        self.base_name = Some(base_name.to_string());
        self
    }

    pub fn build(self) -> TaskTables {
        let schema = self.schema_name.unwrap_or_else(|| "public".to_string());
        let base_name = self.base_name.unwrap_or_else(|| "tasks".to_string());

        let fullname = |name: Option<&str>| -> String {
            if let Some(name) = name {
                format!("{}_{}", base_name, name)
            } else {
                base_name.to_string()
            }
        };

        let tasks = fullname(None);
        let dependencies = fullname(Some("dependencies"));
        let heartbeats = fullname(Some("heartbeats"));
        let ready = fullname(Some("ready"));
        let claim_idx = fullname(Some("status_type_idx"));
        let notify = fullname(Some("notify"));
        let notify_cancel = fullname(Some("notify_cancel"));
        let queue_channel = fullname(Some("queue"));
        let cancel_channel = fullname(Some("cancel"));

        let tasks_table_def = format!(
            "
CREATE TABLE {schema}.{tasks} (
    id UUID PRIMARY KEY,
    type TEXT NOT NULL,
    payload JSONB DEFAULT NULL,
    payload_version INTEGER NOT NULL DEFAULT 1,
    org_id TEXT NOT NULL DEFAULT '',
    resource_id UUID DEFAULT NULL,
    request_id TEXT DEFAULT NULL,
    token UUID DEFAULT NULL,
    queued_at TIMESTAMPTZ NOT NULL DEFAULT statement_timestamp(),
    started_at TIMESTAMPTZ DEFAULT NULL,
    finished_at TIMESTAMPTZ DEFAULT NULL,
    status TEXT NOT NULL DEFAULT 'pending',
    error TEXT DEFAULT NULL,
    retries INTEGER NOT NULL DEFAULT 0
);
"
        );

        let claim_idx_def = format!("CREATE INDEX {claim_idx} ON {schema}.{tasks} (status, type)");

        let dependencies_table_def = format!(
            "
CREATE TABLE {schema}.{dependencies} (
    task_id UUID NOT NULL REFERENCES {schema}.{tasks}(id) ON DELETE CASCADE,
    dependency_id UUID NOT NULL REFERENCES {schema}.{tasks}(id) ON DELETE CASCADE,
    PRIMARY KEY (task_id, dependency_id)
);
"
        );

        let heartbeats_table_def = format!(
            "
CREATE TABLE {schema}.{heartbeats} (
    token UUID PRIMARY KEY,
    id UUID NOT NULL REFERENCES {schema}.{tasks}(id) ON DELETE CASCADE,
    heartbeat TIMESTAMPTZ NOT NULL DEFAULT now()
);
"
        );

        // A task is ready when it is pending, not claimed and all of its
        // dependencies completed.
        let tasks_ready_view_def = format!(
            "
CREATE VIEW {schema}.{ready} AS (
  SELECT t.*
  FROM {schema}.{tasks} t
  WHERE t.status = 'pending'
    AND t.started_at IS NULL
    AND NOT EXISTS (
      SELECT 1
      FROM {schema}.{dependencies} d
      JOIN {schema}.{tasks} dep ON dep.id = d.dependency_id
      WHERE d.task_id = t.id
        AND dep.status <> 'completed'
    )
);
"
        );

        let tasks_notify_fn_def = format!(
            "
CREATE FUNCTION {schema}.{notify}(task_id uuid)
RETURNS VOID AS $$
BEGIN
PERFORM pg_notify('{queue_channel}', task_id::text);
END;
$$ LANGUAGE plpgsql;
"
        );

        let tasks_notify_cancel_fn_def = format!(
            "
CREATE FUNCTION {schema}.{notify_cancel}(task_id uuid)
RETURNS VOID AS $$
BEGIN
PERFORM pg_notify('{cancel_channel}', task_id::text);
END;
$$ LANGUAGE plpgsql;
"
        );

        TaskTables {
            tasks_table: TaskTableEntity::new(&schema, tasks, tasks_table_def, EntityType::Table),
            claim_index: TaskTableEntity::new(&schema, claim_idx, claim_idx_def, EntityType::Index),
            dependencies_table: TaskTableEntity::new(
                &schema,
                dependencies,
                dependencies_table_def,
                EntityType::Table,
            ),
            heartbeats_table: TaskTableEntity::new(
                &schema,
                heartbeats,
                heartbeats_table_def,
                EntityType::Table,
            ),
            tasks_ready: TaskTableEntity::new(&schema, ready, tasks_ready_view_def, EntityType::View),
            tasks_notify: TaskTableEntity::new(
                &schema,
                notify,
                tasks_notify_fn_def,
                EntityType::Function,
            ),
            tasks_notify_cancel: TaskTableEntity::new(
                &schema,
                notify_cancel,
                tasks_notify_cancel_fn_def,
                EntityType::Function,
            ),
            schema,
            tasks_queue_name: queue_channel,
            tasks_cancel_name: cancel_channel,
        }
    }
}

// -=-=-=-=-=-=-=-=-=-=-=-=-=-=-=-=-=-=-=-=-=-=-=-=-=-=-=-

/// [`TaskTables`] is used for creating the necessary tables/views/functions in
/// a postgres database. It implements [`TaskTableProvider`] and is handed to
/// [`crate::PgQueue`] that uses it for finding out what postgres entities and
/// notification channels to use.
///
/// Use [`TaskTableBuilder`] to create it or use `TaskTables::default()` if you
/// are OK with default set of postgres entities.
///
/// That default will create:
/// - table `public.tasks`
/// - table `public.tasks_dependencies`
/// - table `public.tasks_heartbeats`
/// - view `public.tasks_ready`
/// - function `public.tasks_notify` (channel `tasks_queue`)
/// - function `public.tasks_notify_cancel` (channel `tasks_cancel`)
#[derive(Debug, Clone)]
pub struct TaskTables {
    schema: String,
    tasks_queue_name: String,
    tasks_cancel_name: String,
    tasks_table: TaskTableEntity,
    claim_index: TaskTableEntity,
    dependencies_table: TaskTableEntity,
    heartbeats_table: TaskTableEntity,
    tasks_ready: TaskTableEntity,
    tasks_notify: TaskTableEntity,
    tasks_notify_cancel: TaskTableEntity,
}

impl Default for TaskTables {
    fn default() -> Self {
        TaskTableBuilder::new().build()
    }
}

impl TaskTables {
    /// In creation order.
    fn entities(&self) -> [&TaskTableEntity; 7] {
        [
            &self.tasks_table,
            &self.claim_index,
            &self.dependencies_table,
            &self.heartbeats_table,
            &self.tasks_ready,
            &self.tasks_notify,
            &self.tasks_notify_cancel,
        ]
    }

    /// Check if the necessary postgres entities have been installed already.
    pub async fn exists(&self, pool: &Pool<Postgres>) -> Result<bool> {
        let mut tx = pool.begin().await?;

        for entity in self.entities() {
            if !entity.exists(&mut tx).await? {
                return Ok(false);
            }
        }

        Ok(true)
    }

    /// Create the necessary postgres entities for the task queue in the
    /// connected postgres database. This function is idempotent and it will not
    /// error if the entities already exist.
    pub async fn create(&self, pool: &Pool<Postgres>) -> Result<()> {
        let mut tx = pool.begin().await?;
        for entity in self.entities() {
            entity.create(&mut tx).await?;
        }
        tx.commit().await?;

        Ok(())
    }

    /// Delete all postgres entities used by the task queue. This function is
    /// idempotent and will not error if the entities don't exist.
    pub async fn drop(self, pool: &Pool<Postgres>) -> Result<()> {
        let mut tx = pool.begin().await?;
        for entity in self.entities().into_iter().rev() {
            entity.drop(&mut tx).await?;
        }
        tx.commit().await?;

        debug!("cleanup for task setup done");

        Ok(())
    }
}
