//! # Sync Metrics
//!
//! Drain-cycle counters for diagnostics.

use std::time::Duration;
use tokio::time::Instant;

#[derive(Debug, Clone, Default, PartialEq)]
pub struct SyncMetrics {
    pub total_drains: u64,
    pub delivered: u64,
    pub retried: u64,
    pub failed: u64,
    pub average_drain_duration: Duration,
    pub last_drain_duration: Option<Duration>,
    last_drain_start: Option<Instant>,
}

impl SyncMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_drain_start(&mut self) {
        self.last_drain_start = Some(Instant::now());
        self.total_drains += 1;
    }

    pub fn record_drain_end(&mut self, delivered: u64, retried: u64, failed: u64) {
        self.delivered += delivered;
        self.retried += retried;
        self.failed += failed;

        if let Some(start) = self.last_drain_start.take() {
            let duration = start.elapsed();
            self.last_drain_duration = Some(duration);

            // Rolling average over completed drains
            let completed = self.total_drains.max(1) as u32;
            let total = self.average_drain_duration * (completed - 1) + duration;
            self.average_drain_duration = total / completed;
        }
    }

    /// Share of attempted deliveries that succeeded
    pub fn success_rate(&self) -> f64 {
        let attempts = self.delivered + self.retried + self.failed;
        if attempts == 0 {
            0.0
        } else {
            self.delivered as f64 / attempts as f64
        }
    }
}
