//! Heartbeat ping/pong latency tracking.
//!
//! One ping is in flight at a time. If the next tick arrives before its pong,
//! the ping counts as stale. A stale heartbeat never forces a disconnect;
//! the transport decides when a connection is dead.

use crate::shared::event::HeartbeatPayload;
use std::time::Duration;

/// What a heartbeat tick produced
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HeartbeatTick {
    /// The previous ping went unanswered
    pub stale: bool,
    /// Ping to send now
    pub ping: HeartbeatPayload,
}

/// Single-flight heartbeat state
#[derive(Debug, Clone, Default)]
pub struct HeartbeatMonitor {
    in_flight: Option<i64>,
}

impl HeartbeatMonitor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Interval tick at `now_ms` (milliseconds since the Unix epoch)
    pub fn on_tick(&mut self, now_ms: i64) -> HeartbeatTick {
        let stale = self.in_flight.replace(now_ms).is_some();
        HeartbeatTick {
            stale,
            ping: HeartbeatPayload { timestamp: now_ms },
        }
    }

    /// Pong received at `now_ms`. Returns the round-trip latency, or `None`
    /// for a pong that does not answer the in-flight ping.
    pub fn on_pong(&mut self, pong: HeartbeatPayload, now_ms: i64) -> Option<Duration> {
        if self.in_flight != Some(pong.timestamp) {
            return None;
        }
        self.in_flight = None;
        let elapsed = now_ms.saturating_sub(pong.timestamp).max(0);
        Some(Duration::from_millis(elapsed as u64))
    }

    /// Forget the in-flight ping (connection went away)
    pub fn reset(&mut self) {
        self.in_flight = None;
    }

    pub fn is_waiting(&self) -> bool {
        self.in_flight.is_some()
    }
}
