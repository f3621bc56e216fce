//! Prometheus metrics for the sniper.
//!
//! Covers:
//! - Session outcomes by terminal state
//! - Order submission latency and counts
//! - Feed messages and reconnects
//! - Trigger lateness and clock drift corrections

use std::net::SocketAddr;
use std::time::Instant;

use metrics::{counter, describe_counter, describe_histogram, histogram};
use metrics_exporter_prometheus::PrometheusBuilder;
use tracing::{debug, info};

// === Metric Name Constants ===

/// Order submission latency metric name.
pub const METRIC_ORDER_SUBMIT_LATENCY: &str = "order_submit_latency_ms";
/// How late the fire instant was observed, in milliseconds.
pub const METRIC_FIRE_LATENESS: &str = "fire_lateness_ms";
/// Sessions finished, labelled by terminal state.
pub const METRIC_SESSIONS: &str = "sessions_total";
/// Orders submitted counter metric name.
pub const METRIC_ORDERS_SUBMITTED: &str = "orders_submitted_total";
/// Orders filled counter metric name.
pub const METRIC_ORDERS_FILLED: &str = "orders_filled_total";
/// Orders rejected counter metric name.
pub const METRIC_ORDERS_REJECTED: &str = "orders_rejected_total";
/// Orders failed counter metric name.
pub const METRIC_ORDERS_FAILED: &str = "orders_failed_total";
/// Feed messages received counter metric name.
pub const METRIC_FEED_MESSAGES: &str = "feed_messages_received_total";
/// Feed reconnects counter metric name.
pub const METRIC_FEED_RECONNECTS: &str = "feed_reconnects_total";
/// Clock drift corrections counter metric name.
pub const METRIC_DRIFT_CORRECTIONS: &str = "clock_drift_corrections_total";

/// Initialize all metric descriptions.
/// Call this once at startup to register metrics with descriptions.
pub fn init_metrics() {
    describe_histogram!(
        METRIC_ORDER_SUBMIT_LATENCY,
        "Order submission latency in milliseconds"
    );
    describe_histogram!(
        METRIC_FIRE_LATENESS,
        "Delay between the scheduled fire instant and the observed wake-up"
    );

    describe_counter!(METRIC_SESSIONS, "Sessions finished, by terminal state");
    describe_counter!(METRIC_ORDERS_SUBMITTED, "Total number of orders submitted");
    describe_counter!(METRIC_ORDERS_FILLED, "Total number of orders filled");
    describe_counter!(METRIC_ORDERS_REJECTED, "Total number of orders rejected by the exchange");
    describe_counter!(METRIC_ORDERS_FAILED, "Total number of orders that failed");
    describe_counter!(METRIC_FEED_MESSAGES, "Total number of feed messages received");
    describe_counter!(METRIC_FEED_RECONNECTS, "Total number of feed reconnections");
    describe_counter!(METRIC_DRIFT_CORRECTIONS, "Clock drift corrections applied");

    debug!("Metrics initialized");
}

/// Install the Prometheus exporter on the given port.
pub fn install_exporter(port: u16) -> anyhow::Result<()> {
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    PrometheusBuilder::new().with_http_listener(addr).install()?;
    info!(%addr, "Prometheus exporter listening");
    Ok(())
}

/// Record how late the trigger fired.
pub fn record_fire_lateness(lateness_ms: f64) {
    histogram!(METRIC_FIRE_LATENESS).record(lateness_ms);
}

/// Count a finished session by its terminal state label.
pub fn inc_sessions(state: &'static str) {
    counter!(METRIC_SESSIONS, "state" => state).increment(1);
}

/// Increment order submitted counter.
pub fn inc_orders_submitted() {
    counter!(METRIC_ORDERS_SUBMITTED).increment(1);
}

/// Increment orders filled counter.
pub fn inc_orders_filled() {
    counter!(METRIC_ORDERS_FILLED).increment(1);
}

/// Increment orders rejected counter.
pub fn inc_orders_rejected() {
    counter!(METRIC_ORDERS_REJECTED).increment(1);
}

/// Increment orders failed counter.
pub fn inc_orders_failed() {
    counter!(METRIC_ORDERS_FAILED).increment(1);
}

/// Increment feed messages received counter.
pub fn inc_feed_messages() {
    counter!(METRIC_FEED_MESSAGES).increment(1);
}

/// Increment feed reconnects counter.
pub fn inc_feed_reconnects() {
    counter!(METRIC_FEED_RECONNECTS).increment(1);
}

/// Increment drift corrections counter.
pub fn inc_drift_corrections() {
    counter!(METRIC_DRIFT_CORRECTIONS).increment(1);
}

/// RAII guard for timing operations.
/// Automatically records latency when dropped.
pub struct LatencyTimer {
    start: Instant,
    metric_name: &'static str,
}

impl LatencyTimer {
    /// Create a new latency timer for the given metric.
    pub fn new(metric_name: &'static str) -> Self {
        Self {
            start: Instant::now(),
            metric_name,
        }
    }

    /// Get elapsed time in milliseconds (without recording).
    pub fn elapsed_ms(&self) -> f64 {
        self.start.elapsed().as_secs_f64() * 1000.0
    }
}

impl Drop for LatencyTimer {
    fn drop(&mut self) {
        histogram!(self.metric_name).record(self.elapsed_ms());
    }
}

/// Create a latency timer for order submission.
pub fn timer_order_submit() -> LatencyTimer {
    LatencyTimer::new(METRIC_ORDER_SUBMIT_LATENCY)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread::sleep;
    use std::time::Duration;

    #[test]
    fn latency_timer_measures_time() {
        let timer = timer_order_submit();
        sleep(Duration::from_millis(10));
        assert!(timer.elapsed_ms() >= 9.0);
    }

    #[test]
    fn recording_without_recorder_is_noop() {
        inc_sessions("settled");
        record_fire_lateness(3.0);
        inc_drift_corrections();
    }
}
