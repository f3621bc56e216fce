//! Trigger timing: fire-instant computation and drift-corrected waiting.

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use time::OffsetDateTime;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::config::SniperConfig;
use crate::error::SchedulerError;
use crate::market::Market;
use crate::metrics;

/// Timing tunables for the scheduler and session.
#[derive(Debug, Clone, PartialEq)]
pub struct TimingSettings {
    /// Arm this long before the fire instant.
    pub arm_lead: Duration,
    /// Longest single coarse sleep.
    pub coarse_step: Duration,
    /// Switch to fine polling this close to the target.
    pub near_window: Duration,
    /// Fine poll interval.
    pub fine_poll: Duration,
    /// Drift above this is corrected.
    pub drift_tolerance: Duration,
    /// Drift above this is a fault.
    pub drift_fault: Duration,
    /// Oldest book a session will fire on.
    pub max_book_age: Duration,
}

impl Default for TimingSettings {
    fn default() -> Self {
        Self {
            arm_lead: Duration::from_millis(500),
            coarse_step: Duration::from_secs(1),
            near_window: Duration::from_secs(2),
            fine_poll: Duration::from_millis(10),
            drift_tolerance: Duration::from_millis(250),
            drift_fault: Duration::from_secs(5),
            max_book_age: Duration::from_secs(3),
        }
    }
}

/// Time source: monotonic instants plus a corrected wall clock.
pub trait Clock: Send + Sync {
    /// Monotonic now.
    fn instant(&self) -> Instant;

    /// Wall-clock now, including the correction offset.
    fn now(&self) -> OffsetDateTime;

    /// Current correction offset in milliseconds.
    fn offset_ms(&self) -> i64;

    /// Replace the correction offset.
    fn set_offset_ms(&self, offset_ms: i64);
}

/// Wall clock derived from a monotonic anchor, so it never jumps and
/// follows tokio's paused clock in tests.
#[derive(Debug)]
pub struct WallClock {
    anchor_instant: Instant,
    anchor_wall: OffsetDateTime,
    offset_ms: AtomicI64,
}

impl WallClock {
    /// Anchor to the system clock.
    pub fn system() -> Self {
        Self::starting_at(OffsetDateTime::now_utc())
    }

    /// Anchor to an arbitrary wall time.
    pub fn starting_at(wall: OffsetDateTime) -> Self {
        Self {
            anchor_instant: Instant::now(),
            anchor_wall: wall,
            offset_ms: AtomicI64::new(0),
        }
    }
}

impl Clock for WallClock {
    fn instant(&self) -> Instant {
        Instant::now()
    }

    fn now(&self) -> OffsetDateTime {
        let elapsed = Instant::now().saturating_duration_since(self.anchor_instant);
        self.anchor_wall + elapsed + time::Duration::milliseconds(self.offset_ms())
    }

    fn offset_ms(&self) -> i64 {
        self.offset_ms.load(Ordering::SeqCst)
    }

    fn set_offset_ms(&self, offset_ms: i64) {
        self.offset_ms.store(offset_ms, Ordering::SeqCst);
    }
}

/// Session timeline, computed once.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TriggerPlan {
    /// Resolution deadline.
    pub deadline: OffsetDateTime,
    /// Start of the monitoring window.
    pub monitor_from: OffsetDateTime,
    /// Arm instant.
    pub arm_at: OffsetDateTime,
    /// Fire instant.
    pub fire_at: OffsetDateTime,
}

impl TriggerPlan {
    /// Lay out the timeline for a market.
    pub fn new(market: &Market, config: &SniperConfig, arm_lead: Duration) -> Self {
        let fire_at = compute_fire_instant(market, config.trigger_offset);
        Self {
            deadline: market.deadline,
            monitor_from: market.deadline - config.monitor_window,
            arm_at: fire_at - arm_lead,
            fire_at,
        }
    }
}

/// Fire instant for a market: `deadline - offset`.
pub fn compute_fire_instant(market: &Market, offset: Duration) -> OffsetDateTime {
    market.deadline - offset
}

/// Result of comparing the local clock with a server timestamp.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DriftStatus {
    /// Residual drift within tolerance; nothing changed.
    WithinTolerance,
    /// Offset updated to absorb the drift.
    Corrected {
        /// Residual drift that was corrected, milliseconds.
        drift_ms: i64,
    },
}

/// Suspends callers until wall-clock instants, never past the deadline.
#[derive(Clone)]
pub struct TriggerScheduler {
    clock: Arc<dyn Clock>,
    settings: TimingSettings,
    deadline: OffsetDateTime,
}

impl TriggerScheduler {
    /// Scheduler bounded by `deadline`.
    pub fn new(clock: Arc<dyn Clock>, settings: TimingSettings, deadline: OffsetDateTime) -> Self {
        Self { clock, settings, deadline }
    }

    /// Corrected wall-clock now.
    pub fn now(&self) -> OffsetDateTime {
        self.clock.now()
    }

    /// Sleep until `instant`.
    ///
    /// Coarse sleeps while far away, fine polls near the target. Returns how late the
    /// wake-up was, or `MissedWindow` as soon as the deadline is observed to have passed.
    pub async fn wait_until(&self, instant: OffsetDateTime) -> Result<Duration, SchedulerError> {
        loop {
            let now = self.clock.now();
            if now >= self.deadline {
                return Err(SchedulerError::MissedWindow { deadline: self.deadline, now });
            }
            if now >= instant {
                return Ok(Duration::try_from(now - instant).unwrap_or_default());
            }

            let remaining = Duration::try_from(instant - now).unwrap_or_default();
            let step = if remaining > self.settings.near_window {
                (remaining - self.settings.near_window).min(self.settings.coarse_step)
            } else {
                remaining.min(self.settings.fine_poll)
            };
            tokio::time::sleep(step.max(Duration::from_millis(1))).await;
        }
    }

    /// Compare a server timestamp with the receipt time and correct the clock offset.
    ///
    /// `received_at` is the uncorrected local wall time at receipt.
    pub fn resync(&self, server_time: OffsetDateTime, received_at: OffsetDateTime) -> Result<DriftStatus, SchedulerError> {
        let total_ms = i64::try_from((server_time - received_at).whole_milliseconds()).unwrap_or(i64::MAX);
        let fault_ms = self.settings.drift_fault.as_millis() as i64;

        if total_ms.abs() > fault_ms {
            return Err(SchedulerError::DriftFault { drift_ms: total_ms, bound_ms: fault_ms });
        }

        let residual = total_ms - self.clock.offset_ms();
        if residual.abs() > self.settings.drift_tolerance.as_millis() as i64 {
            self.clock.set_offset_ms(total_ms);
            metrics::inc_drift_corrections();
            warn!(drift_ms = residual, offset_ms = total_ms, "Clock drift exceeded tolerance, corrected");
            return Ok(DriftStatus::Corrected { drift_ms: residual });
        }

        debug!(drift_ms = residual, "Clock within tolerance");
        Ok(DriftStatus::WithinTolerance)
    }
}
