//! # Broadcast Tick
//!
//! Decides when a state broadcast is due and keeps timing statistics.
//!
//! ## Design
//!
//! The tick runs at the faster of the broadcast and ping rates. Every pass
//! pings idle peers; only passes where a broadcast interval has elapsed pull
//! a snapshot.

use std::time::{Duration, Instant};

/// Tick timing statistics.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct TickStats {
    /// Passes executed.
    pub ticks: u64,
    /// Passes that broadcast a `state` frame.
    pub broadcasts: u64,
    /// Keep-alive pings queued.
    pub pings_sent: u64,
    /// Longest pass observed.
    pub max_tick_us: u64,
    /// Rolling average pass duration.
    pub avg_tick_us: u64,
}

/// Broadcast timer for the host tick.
#[derive(Debug)]
pub struct TickSchedule {
    broadcast_interval: Duration,
    last_broadcast: Option<Instant>,
    stats: TickStats,
}

impl TickSchedule {
    /// Creates a schedule broadcasting every `broadcast_interval`.
    #[must_use]
    pub const fn new(broadcast_interval: Duration) -> Self {
        Self {
            broadcast_interval,
            last_broadcast: None,
            stats: TickStats {
                ticks: 0,
                broadcasts: 0,
                pings_sent: 0,
                max_tick_us: 0,
                avg_tick_us: 0,
            },
        }
    }

    /// Returns true, and restarts the interval, if a broadcast is due at `now`.
    ///
    /// Small scheduler jitter is tolerated so a tick firing a hair early does
    /// not skip a whole interval.
    pub fn broadcast_due(&mut self, now: Instant) -> bool {
        let slack = self.broadcast_interval / 10;
        let due = self
            .last_broadcast
            .map_or(true, |last| now.saturating_duration_since(last) + slack >= self.broadcast_interval);
        if due {
            self.last_broadcast = Some(now);
        }
        due
    }

    /// Records one finished pass.
    pub fn record(&mut self, start: Instant, pings: usize, broadcast: bool) {
        let duration_us = start.elapsed().as_micros() as u64;

        self.stats.ticks += 1;
        self.stats.pings_sent += pings as u64;
        if broadcast {
            self.stats.broadcasts += 1;
        }
        self.stats.max_tick_us = self.stats.max_tick_us.max(duration_us);
        self.stats.avg_tick_us = if self.stats.ticks == 1 {
            duration_us
        } else {
            (self.stats.avg_tick_us * 15 + duration_us) / 16
        };
    }

    /// Statistics so far.
    #[must_use]
    pub const fn stats(&self) -> TickStats {
        self.stats
    }

    /// Target time between broadcasts.
    #[must_use]
    pub const fn broadcast_interval(&self) -> Duration {
        self.broadcast_interval
    }
}
