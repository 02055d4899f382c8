use std::time::Duration;

use clap::Args;

use crate::{Error, Result};

/// Settings of a queue instance and its worker pool. Parsed from the command
/// line / environment by the `pgtasking` binary, or built in code starting
/// from `TaskingConfig::default()`.
#[derive(Args, Debug, Clone, PartialEq)]
pub struct TaskingConfig {
    #[clap(
        long,
        env = "PGTASKING_WORKER_COUNT",
        default_value_t = 3,
        help = "Number of workers, each processing one task at a time"
    )]
    pub worker_count: usize,

    #[clap(
        long,
        env = "PGTASKING_HEARTBEAT",
        value_parser = humantime::parse_duration,
        default_value = "1m",
        help = "A running task whose heartbeat is older than this is requeued"
    )]
    pub heartbeat: Duration,

    #[clap(
        long,
        env = "PGTASKING_HEARTBEAT_CHECK_INTERVAL",
        value_parser = humantime::parse_duration,
        help = "How often to scan for stale heartbeats [default: heartbeat / 3]"
    )]
    pub heartbeat_check_interval: Option<Duration>,

    #[clap(
        long,
        env = "PGTASKING_MAX_RETRIES",
        default_value_t = 3,
        help = "How often a task may be requeued before it is failed"
    )]
    pub max_retries: u32,

    #[clap(
        long,
        env = "PGTASKING_LISTENER_BACKOFF",
        value_parser = humantime::parse_duration,
        default_value = "500ms",
        help = "Pause before re-establishing a broken LISTEN connection"
    )]
    pub listener_backoff: Duration,
}

impl Default for TaskingConfig {
    fn default() -> Self {
        Self {
            worker_count: 3,
            heartbeat: Duration::from_secs(60),
            heartbeat_check_interval: None,
            max_retries: 3,
            listener_backoff: Duration::from_millis(500),
        }
    }
}

impl TaskingConfig {
    /// Workers refresh their heartbeat three times per staleness window so a
    /// missed tick does not get a healthy task requeued.
    pub fn heartbeat_refresh_interval(&self) -> Duration {
        self.heartbeat / 3
    }

    pub fn heartbeat_check_interval(&self) -> Duration {
        self.heartbeat_check_interval
            .unwrap_or_else(|| self.heartbeat_refresh_interval())
    }

    pub fn validate(&self) -> Result<()> {
        if self.worker_count == 0 {
            return Err(Error::Config("worker_count must be at least 1".to_string()));
        }
        if self.heartbeat < Duration::from_millis(3) {
            return Err(Error::Config(format!(
                "heartbeat of {} is too short",
                humantime::format_duration(self.heartbeat)
            )));
        }
        if self.heartbeat_check_interval == Some(Duration::ZERO) {
            return Err(Error::Config(
                "heartbeat_check_interval must not be zero".to_string(),
            ));
        }
        Ok(())
    }
}
