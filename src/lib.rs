#[macro_use]
extern crate tracing;

mod config;
mod dequeuers;
mod error;
mod listener;
mod memory;
mod metrics;
mod pg_queue;
mod pool;
mod queue;
mod tables;
pub mod task;
pub mod task_type;
mod worker;

pub use config::TaskingConfig;
pub use dequeuers::{Dequeuer, Dequeuers};
pub use error::{Error, Result};
pub use memory::MemoryQueue;
pub use metrics::Metrics;
pub use pg_queue::{PgQueue, TaskFilter};
pub use pool::{TaskFunctionResult, TaskHandler, WorkerPool};
pub use queue::Queue;
pub use tables::{TaskTableBuilder, TaskTableProvider, TaskTables};
pub use task::{Task, TaskBuilder, TaskInfo, TaskPayload, TaskStatus};
pub use task_type::{TaskType, TaskTypeName};
