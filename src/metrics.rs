//! Worker pool metrics

use chrono::{DateTime, Utc};
use prometheus::{Encoder, Histogram, HistogramOpts, IntCounterVec, Opts, Registry};

use crate::Result;

/// Prometheus collectors updated by the workers. Every pool owns its own
/// registry so several pools (and tests) can live in one process.
#[derive(Clone)]
pub struct Metrics {
    registry: Registry,
    message_latency: Histogram,
    message_result: IntCounterVec,
}

impl Metrics {
    pub fn new() -> Result<Self> {
        let registry = Registry::new();

        let message_latency = Histogram::with_opts(HistogramOpts::new(
            "tasking_message_latency_seconds",
            "Time between enqueueing a task and a worker claiming it",
        ))?;

        let message_result = IntCounterVec::new(
            Opts::new(
                "tasking_message_result_total",
                "Processed tasks by outcome",
            ),
            &["result"],
        )?;

        registry.register(Box::new(message_latency.clone()))?;
        registry.register(Box::new(message_result.clone()))?;

        Ok(Self {
            registry,
            message_latency,
            message_result,
        })
    }

    pub fn record_message_latency(&self, queued_at: DateTime<Utc>) {
        let latency = (Utc::now() - queued_at).num_milliseconds().max(0) as f64 / 1000.0;
        self.message_latency.observe(latency);
    }

    pub fn record_message_result(&self, success: bool) {
        let result = if success { "success" } else { "failure" };
        self.message_result.with_label_values(&[result]).inc();
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Text exposition format.
    pub fn render(&self) -> Result<String> {
        let mut buffer = Vec::new();
        prometheus::TextEncoder::new().encode(&self.registry.gather(), &mut buffer)?;
        Ok(String::from_utf8_lossy(&buffer).into_owned())
    }

    pub fn message_result_count(&self, success: bool) -> u64 {
        let result = if success { "success" } else { "failure" };
        self.message_result.with_label_values(&[result]).get()
    }

    pub fn message_latency_count(&self) -> u64 {
        self.message_latency.get_sample_count()
    }
}
