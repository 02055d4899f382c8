use chrono::prelude::*;
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::{Error, Queue, Result, TaskType};

/// Failure messages longer than this (in chars) are cut before they are stored.
pub const MAX_ERROR_LENGTH: usize = 4000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Canceled,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Pending => "pending",
            TaskStatus::Running => "running",
            TaskStatus::Completed => "completed",
            TaskStatus::Failed => "failed",
            TaskStatus::Canceled => "canceled",
        }
    }

    /// Completed, failed and canceled tasks never change status again.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskStatus::Completed | TaskStatus::Failed | TaskStatus::Canceled
        )
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for TaskStatus {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "pending" => Ok(TaskStatus::Pending),
            "running" => Ok(TaskStatus::Running),
            "completed" => Ok(TaskStatus::Completed),
            "failed" => Ok(TaskStatus::Failed),
            "canceled" => Ok(TaskStatus::Canceled),
            other => Err(Error::InvalidStatus(other.to_string())),
        }
    }
}

impl TryFrom<String> for TaskStatus {
    type Error = Error;

    fn try_from(value: String) -> Result<Self> {
        value.parse()
    }
}

/// The payload contract of one task type. The queue itself never looks inside
/// a payload, it only stores the JSON and the version it was written with so
/// that a handler can refuse payloads of a schema it does not understand.
pub trait TaskPayload: Serialize + DeserializeOwned {
    const TYPE_NAME: &'static str;
    const VERSION: i32 = 1;
}

// -=-=-=-=-=-=-=-=-=-=-=-=-=-=-=-=-=-=-=-=-=-=-=-=-=-=-=-

/// A unit of work as submitted by a producer. Immutable once enqueued.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Task {
    pub task_type: String,
    pub payload: Option<Value>,
    pub payload_version: i32,
    pub org_id: String,
    pub resource_id: Option<Uuid>,
    pub dependencies: Vec<Uuid>,
    pub request_id: Option<String>,
}

#[derive(Default)]
pub struct TaskBuilder {
    task: Task,
}

impl TaskBuilder {
    pub fn new(task_type: impl TaskType) -> Self {
        Self {
            task: Task {
                task_type: task_type.to_string(),
                payload_version: 1,
                ..Default::default()
            },
        }
    }

    /// Starts a task of `P::TYPE_NAME` carrying `payload`, stamped with `P::VERSION`.
    pub fn for_payload<P: TaskPayload>(payload: &P) -> Result<Self> {
        Self::new(P::TYPE_NAME).with_payload(payload)
    }

    pub fn with_payload<P: TaskPayload>(mut self, payload: &P) -> Result<Self> {
        self.task.payload = Some(serde_json::to_value(payload)?);
        self.task.payload_version = P::VERSION;
        Ok(self)
    }

    /// Untyped payload, stored with version 1.
    pub fn with_request(mut self, req: impl Serialize) -> Result<Self> {
        self.task.payload = Some(serde_json::to_value(req)?);
        Ok(self)
    }

    #[must_use]
    pub fn with_org(mut self, org_id: impl ToString) -> Self {
        self.task.org_id = org_id.to_string();
        self
    }

    #[must_use]
    pub fn with_resource(mut self, resource_id: Uuid) -> Self {
        self.task.resource_id = Some(resource_id);
        self
    }

    #[must_use]
    pub fn with_dependency(mut self, dependency: Uuid) -> Self {
        self.task.dependencies.push(dependency);
        self
    }

    #[must_use]
    pub fn with_dependencies(mut self, dependencies: impl IntoIterator<Item = Uuid>) -> Self {
        self.task.dependencies.extend(dependencies);
        self
    }

    #[must_use]
    pub fn with_request_id(mut self, request_id: impl ToString) -> Self {
        self.task.request_id = Some(request_id.to_string());
        self
    }

    pub fn build(self) -> Task {
        self.task
    }

    pub async fn enqueue(self, queue: &dyn Queue) -> Result<Uuid> {
        queue.enqueue(&self.task).await
    }
}

// -=-=-=-=-=-=-=-=-=-=-=-=-=-=-=-=-=-=-=-=-=-=-=-=-=-=-=-

/// The stored, queryable record of a task.
#[derive(Debug, Clone, PartialEq, sqlx::FromRow, Serialize)]
pub struct TaskInfo {
    pub id: Uuid,
    #[sqlx(rename = "type")]
    pub task_type: String,
    pub payload: Option<Value>,
    pub payload_version: i32,
    pub org_id: String,
    pub resource_id: Option<Uuid>,
    pub request_id: Option<String>,
    /// Claim token of the active claim episode, `None` otherwise.
    pub token: Option<Uuid>,
    pub queued_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    #[sqlx(try_from = "String")]
    pub status: TaskStatus,
    pub error: Option<String>,
    pub retries: i32,
    #[sqlx(skip)]
    pub dependencies: Vec<Uuid>,
}

impl TaskInfo {
    pub fn is_running(&self) -> bool {
        self.started_at.is_some() && self.finished_at.is_none()
    }

    /// Deserializes the payload as `P`, refusing payloads written for another
    /// schema version.
    pub fn payload<P: TaskPayload>(&self) -> Result<P> {
        if self.payload_version != P::VERSION {
            return Err(Error::PayloadVersion {
                task: self.id,
                found: self.payload_version,
                expected: P::VERSION,
            });
        }
        self.payload_as()
    }

    /// Deserializes the payload without a version check.
    pub fn payload_as<R: DeserializeOwned>(&self) -> Result<R> {
        match &self.payload {
            None => Err(Error::MissingPayload { task: self.id }),
            Some(payload) => Ok(serde_json::from_value(payload.clone())?),
        }
    }
}

/// Makes a handler error storable: postgres text cannot hold NUL and very long
/// messages are cut to [`MAX_ERROR_LENGTH`] chars.
pub fn sanitize_error_message(message: &str) -> String {
    message
        .chars()
        .filter(|c| *c != '\0')
        .take(MAX_ERROR_LENGTH)
        .collect()
}
