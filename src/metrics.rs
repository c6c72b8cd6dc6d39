use metriken::{AtomicHistogram, Counter, Gauge, LazyCounter, LazyGauge, metric};
use std::time::Duration;

#[derive(Debug, Clone, Copy)]
pub enum RequestStatus {
    Success,
    Timeout,
    Failed,
}

// Request metrics
#[metric(
    name = "requests",
    description = "Chat completion requests sent",
    metadata = { status = "sent" }
)]
pub static REQUESTS_SENT: LazyCounter = LazyCounter::new(Counter::default);

#[metric(
    name = "requests",
    description = "Chat completion requests answered with HTTP 200",
    metadata = { status = "success" }
)]
pub static REQUESTS_SUCCESS: LazyCounter = LazyCounter::new(Counter::default);

#[metric(
    name = "requests",
    description = "Chat completion requests that hit the timeout budget",
    metadata = { status = "timeout" }
)]
pub static REQUESTS_TIMEOUT: LazyCounter = LazyCounter::new(Counter::default);

#[metric(
    name = "requests",
    description = "Chat completion requests that failed outright",
    metadata = { status = "failed" }
)]
pub static REQUESTS_FAILED: LazyCounter = LazyCounter::new(Counter::default);

#[metric(
    name = "requests",
    description = "Requests resubmitted by the batch driver",
    metadata = { status = "resubmitted" }
)]
pub static REQUESTS_RESUBMITTED: LazyCounter = LazyCounter::new(Counter::default);

#[metric(
    name = "requests_inflight",
    description = "Current number of requests in flight"
)]
pub static REQUESTS_INFLIGHT: LazyGauge = LazyGauge::new(Gauge::default);

#[metric(name = "batch_rounds", description = "Dispatch rounds run by the batch driver")]
pub static BATCH_ROUNDS: LazyCounter = LazyCounter::new(Counter::default);

// Token metrics
#[metric(
    name = "tokens",
    description = "Prompt tokens reported by the server",
    metadata = { direction = "prompt" }
)]
pub static TOKENS_PROMPT: LazyCounter = LazyCounter::new(Counter::default);

#[metric(
    name = "tokens",
    description = "Completion tokens reported by the server",
    metadata = { direction = "completion" }
)]
pub static TOKENS_COMPLETION: LazyCounter = LazyCounter::new(Counter::default);

#[metric(
    name = "timeout_budget",
    description = "Per-request timeout currently in force",
    metadata = { unit = "milliseconds" }
)]
pub static TIMEOUT_BUDGET: LazyGauge = LazyGauge::new(Gauge::default);

// Histogram parameters: (grouping_power=5, max_value_power=64)
#[metric(
    name = "request_latency",
    description = "Total request latency in nanoseconds",
    metadata = { unit = "nanoseconds" }
)]
pub static REQUEST_LATENCY: AtomicHistogram = AtomicHistogram::new(5, 64);

/// Holds one unit of an in-flight gauge and gives it back when dropped, so a
/// request future cancelled mid-flight still leaves the gauge balanced.
#[must_use]
pub struct InflightGuard<'a> {
    gauge: &'a Gauge,
}

impl<'a> InflightGuard<'a> {
    pub fn new(gauge: &'a Gauge) -> Self {
        gauge.increment();
        Self { gauge }
    }
}

impl Drop for InflightGuard<'_> {
    fn drop(&mut self) {
        self.gauge.decrement();
    }
}

pub struct Metrics;

impl Metrics {
    /// Count a sent request. The request stays in flight until the returned
    /// guard is dropped.
    pub fn record_request_sent() -> InflightGuard<'static> {
        REQUESTS_SENT.increment();
        InflightGuard::new(&REQUESTS_INFLIGHT)
    }

    pub fn record_request_complete(status: RequestStatus) {
        match status {
            RequestStatus::Success => REQUESTS_SUCCESS.increment(),
            RequestStatus::Timeout => REQUESTS_TIMEOUT.increment(),
            RequestStatus::Failed => REQUESTS_FAILED.increment(),
        };
    }

    pub fn record_tokens(prompt: u64, completion: u64) {
        TOKENS_PROMPT.add(prompt);
        TOKENS_COMPLETION.add(completion);
    }

    pub fn record_latency(duration: Duration) {
        let _ = REQUEST_LATENCY.increment(duration.as_nanos() as u64);
    }

    pub fn record_timeout_budget(budget: Duration) {
        TIMEOUT_BUDGET.set(budget.as_millis() as i64);
    }

    pub fn record_round(resubmitted: usize) {
        BATCH_ROUNDS.increment();
        REQUESTS_RESUBMITTED.add(resubmitted as u64);
    }
}
