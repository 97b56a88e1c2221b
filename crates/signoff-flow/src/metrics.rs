//! Observability metrics for the orchestration kernel.
//!
//! Metrics are exposed via the `metrics` crate facade; wiring an exporter
//! (Prometheus or otherwise) is an outer-surface concern.
//!
//! ## Metrics Exported
//!
//! | Metric | Type | Labels | Description |
//! |--------|------|--------|-------------|
//! | `signoff_flow_transitions_total` | Counter | `from_state`, `to_state` | Workflow state transitions |
//! | `signoff_flow_events_published_total` | Counter | `kind` | Events accepted by the bus |
//! | `signoff_flow_bus_deliveries_total` | Counter | `handler` | Delivery attempts per subscriber |
//! | `signoff_flow_bus_retries_total` | Counter | `handler` | Redeliveries after handler failure |
//! | `signoff_flow_dead_letters_total` | Counter | `handler` | Events parked in the DLQ |
//! | `signoff_flow_decisions_total` | Counter | `decision` | Approval decisions recorded |
//! | `signoff_flow_timeout_scan_seconds` | Histogram | - | Timeout manager tick duration |

use std::time::Instant;

/// Metric names as constants for consistency.
pub mod names {
    /// Counter: Workflow state transitions.
    pub const TRANSITIONS_TOTAL: &str = "signoff_flow_transitions_total";
    /// Counter: Events accepted by the bus.
    pub const EVENTS_PUBLISHED_TOTAL: &str = "signoff_flow_events_published_total";
    /// Counter: Delivery attempts per subscriber.
    pub const BUS_DELIVERIES_TOTAL: &str = "signoff_flow_bus_deliveries_total";
    /// Counter: Redeliveries after handler failure.
    pub const BUS_RETRIES_TOTAL: &str = "signoff_flow_bus_retries_total";
    /// Counter: Events parked in the dead-letter queue.
    pub const DEAD_LETTERS_TOTAL: &str = "signoff_flow_dead_letters_total";
    /// Counter: Approval decisions recorded.
    pub const DECISIONS_TOTAL: &str = "signoff_flow_decisions_total";
    /// Histogram: Timeout manager tick duration in seconds.
    pub const TIMEOUT_SCAN_SECONDS: &str = "signoff_flow_timeout_scan_seconds";
}

/// Label keys used across metrics.
pub mod labels {
    /// Previous workflow state (for transitions).
    pub const FROM_STATE: &str = "from_state";
    /// Target workflow state (for transitions).
    pub const TO_STATE: &str = "to_state";
    /// Event kind.
    pub const KIND: &str = "kind";
    /// Subscriber name.
    pub const HANDLER: &str = "handler";
    /// Recorded decision (approve, reject, timeout).
    pub const DECISION: &str = "decision";
}

/// Records a duration into a callback when dropped.
///
/// ## Example
///
/// ```rust
/// use metrics::histogram;
/// use signoff_flow::metrics::{names, TimingGuard};
///
/// let _guard = TimingGuard::new(|duration| {
///     histogram!(names::TIMEOUT_SCAN_SECONDS).record(duration.as_secs_f64());
/// });
/// // ... timed work
/// ```
pub struct TimingGuard<F: FnOnce(std::time::Duration)> {
    started: Instant,
    record: Option<F>,
}

impl<F: FnOnce(std::time::Duration)> TimingGuard<F> {
    /// Starts timing; `record` runs with the elapsed duration on drop.
    #[must_use]
    pub fn new(record: F) -> Self {
        Self {
            started: Instant::now(),
            record: Some(record),
        }
    }
}

impl<F: FnOnce(std::time::Duration)> Drop for TimingGuard<F> {
    fn drop(&mut self) {
        if let Some(record) = self.record.take() {
            record(self.started.elapsed());
        }
    }
}
