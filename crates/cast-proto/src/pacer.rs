//! Absolute-clock frame pacing.
//!
//! Both ends of the pipeline release exactly one frame per period. The
//! deadline advances by exactly one period per tick (`t₀ + k·Δ`); when the
//! caller falls behind, the deadline resyncs to `now` instead of accumulating
//! lag. Long-term drift over a minute stays within ±10 ms.

use std::time::Duration;
use tokio::time::Instant;

pub struct Pacer {
    period: Duration,
    deadline: Instant,
}

impl Pacer {
    pub fn new(period: Duration) -> Self {
        Self {
            period,
            deadline: Instant::now(),
        }
    }

    pub fn period(&self) -> Duration {
        self.period
    }

    /// Reset the schedule to start from now.
    pub fn resync(&mut self) {
        self.deadline = Instant::now();
    }

    /// Sleep until the next frame deadline, then advance it by one period.
    ///
    /// If the deadline has already passed, returns immediately and resyncs.
    pub async fn wait(&mut self) {
        self.deadline += self.period;
        let now = Instant::now();
        if self.deadline > now {
            tokio::time::sleep_until(self.deadline).await;
        } else {
            self.deadline = now;
        }
    }

    /// Pace one tick according to a telemetry zone.
    ///
    /// `Nominal` keeps the absolute schedule. The adaptive zones sleep their
    /// fixed amount and resync, since they deliberately run off-schedule.
    pub async fn pace(&mut self, zone: PaceZone) {
        match zone {
            PaceZone::Nominal => self.wait().await,
            zone => {
                let nap = zone.sleep(self.period);
                if !nap.is_zero() {
                    tokio::time::sleep(nap).await;
                }
                self.deadline = Instant::now();
            }
        }
    }
}

/// Zone classification of the receiver's ring-buffer fill level.
///
/// Below 20% the writer pushes flat out; between 20% and 70% it runs slightly
/// faster than the consumer; above 70% it backs off. Without telemetry the
/// writer holds the exact nominal period. The boundaries and sleeps are
/// empirical defaults.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PaceZone {
    Low,
    Sweet,
    High,
    Nominal,
}

impl PaceZone {
    pub fn classify(fill: Option<(usize, usize)>) -> Self {
        match fill {
            Some((fill, capacity)) if capacity > 0 => {
                let low = capacity * 20 / 100;
                let high = capacity * 70 / 100;
                if fill <= low {
                    PaceZone::Low
                } else if fill >= high {
                    PaceZone::High
                } else {
                    PaceZone::Sweet
                }
            }
            _ => PaceZone::Nominal,
        }
    }

    pub fn sleep(&self, nominal: Duration) -> Duration {
        match self {
            PaceZone::Low => Duration::ZERO,
            PaceZone::Sweet => Duration::from_millis(18),
            PaceZone::High => Duration::from_millis(30),
            PaceZone::Nominal => nominal,
        }
    }
}
