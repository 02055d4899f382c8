use thiserror::Error;
use uuid::Uuid;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug)]
pub enum Error {
    #[error("sql error {0}")]
    Db(#[from] sqlx::Error),
    #[error("json error {0}")]
    JSONError(#[from] serde_json::Error),
    #[error("metrics error {0}")]
    Metrics(#[from] prometheus::Error),

    /// The task id or claim token is unknown, or the heartbeat of the claim is
    /// already gone.
    #[error("task does not exist")]
    NotExist,
    /// The task is not in the state the operation requires (e.g. finishing a
    /// pending task, canceling a finished one).
    #[error("task is not running")]
    NotRunning,
    /// The task was canceled underneath its worker.
    #[error("task was canceled")]
    Canceled,
    /// A blocking dequeue was aborted by its caller.
    #[error("dequeue context timed out or was canceled")]
    ContextCanceled,
    #[error("task {task} exceeded the maximum of {max} retries")]
    RetriesExceeded { task: Uuid, max: u32 },

    #[error("payload of task {task} has version {found}, expected {expected}")]
    PayloadVersion {
        task: Uuid,
        found: i32,
        expected: i32,
    },
    #[error("task {task} has no payload")]
    MissingPayload { task: Uuid },
    #[error("invalid task status {0:?}")]
    InvalidStatus(String),
    #[error("configuration error: {0}")]
    Config(String),
}

impl Error {
    /// True for the state-precondition sentinels callers are expected to branch
    /// on, as opposed to infrastructure failures.
    pub fn is_sentinel(&self) -> bool {
        matches!(
            self,
            Error::NotExist
                | Error::NotRunning
                | Error::Canceled
                | Error::ContextCanceled
                | Error::RetriesExceeded { .. }
        )
    }
}
