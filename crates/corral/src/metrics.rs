//! Pluggable metrics emission.
//!
//! The coordinator reports counters, histograms, meters, and history events
//! through a single `notify` call on a caller-provided sink. The default
//! sink discards everything.

use std::sync::Arc;

/// How a metric value should be aggregated by the sink.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MetricKind {
    Counter,
    Histogram,
    History,
    Meter,
}

/// A metric observation: a number, or a symbolic history event.
#[derive(Debug, Clone, PartialEq)]
pub enum MetricValue {
    Number(u64),
    Event(serde_json::Value),
}

/// Receiver for coordinator metrics.
///
/// Implementations must be cheap and non-blocking; `notify` is called from
/// inside the coordinator loop.
pub trait MetricsSink: Send + Sync {
    fn notify(&self, name: &str, value: MetricValue, kind: MetricKind);
}

/// Sink that drops every observation.
pub struct NullSink;

impl MetricsSink for NullSink {
    fn notify(&self, _name: &str, _value: MetricValue, _kind: MetricKind) {}
}

/// History event stream shared by all pools.
pub const EVENTS: &str = "pooler.events";
/// Failed-take counter shared by all pools.
pub const ERROR_NO_MEMBERS_COUNT: &str = "pooler.error_no_members_count";
/// Destroyed-while-free counter.
pub const KILLED_FREE_COUNT: &str = "pooler.killed_free_count";
/// Destroyed-while-held counter.
pub const KILLED_IN_USE_COUNT: &str = "pooler.killed_in_use_count";

/// Per-pool metric name, e.g. `pooler.db.take_rate`.
pub fn pool_metric(pool: &str, suffix: &str) -> String {
    format!("pooler.{pool}.{suffix}")
}

/// Convenience wrapper the coordinator state uses for its emissions.
#[derive(Clone)]
pub(crate) struct Emitter {
    sink: Arc<dyn MetricsSink>,
}

impl Emitter {
    pub fn new(sink: Arc<dyn MetricsSink>) -> Self {
        Self { sink }
    }

    pub fn counter(&self, name: &str) {
        self.sink
            .notify(name, MetricValue::Number(1), MetricKind::Counter);
    }

    pub fn meter(&self, name: &str) {
        self.sink
            .notify(name, MetricValue::Number(1), MetricKind::Meter);
    }

    pub fn histogram(&self, name: &str, value: u64) {
        self.sink
            .notify(name, MetricValue::Number(value), MetricKind::Histogram);
    }

    pub fn history(&self, event: serde_json::Value) {
        self.sink
            .notify(EVENTS, MetricValue::Event(event), MetricKind::History);
    }

    /// Both gauges for a pool, emitted together after every count change.
    pub fn pool_counts(&self, pool: &str, in_use: u32, free: u32) {
        self.histogram(&pool_metric(pool, "in_use_count"), u64::from(in_use));
        self.histogram(&pool_metric(pool, "free_count"), u64::from(free));
    }
}
