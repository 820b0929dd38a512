//! Shared budget clock consulted by steps and by the run driver.

use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use parking_lot::Mutex;

#[derive(Debug, Default)]
struct Clock {
    started: Option<Instant>,
    stopped: Option<Instant>,
    start_time: Option<DateTime<Utc>>,
    stop_time: Option<DateTime<Utc>>,
}

/// Wall-clock budget with an optional limit. Without a limit it never
/// times out.
#[derive(Debug)]
pub struct Countdown {
    limit: Option<Duration>,
    clock: Mutex<Clock>,
}

impl Countdown {
    pub fn new(limit: Option<Duration>) -> Self {
        Self {
            limit: limit.filter(|d| !d.is_zero()),
            clock: Mutex::new(Clock::default()),
        }
    }

    /// Zero or negative means unlimited.
    pub fn from_secs(secs: f64) -> Self {
        let limit = (secs > 0.0).then(|| Duration::from_secs_f64(secs));
        Self::new(limit)
    }

    pub fn limit(&self) -> Option<Duration> {
        self.limit
    }

    /// Starts the clock. Restarting a running clock has no effect.
    pub fn start(&self) {
        let mut clock = self.clock.lock();
        if clock.started.is_some() && clock.stopped.is_none() {
            return;
        }
        clock.started = Some(Instant::now());
        clock.start_time = Some(Utc::now());
        clock.stopped = None;
        clock.stop_time = None;
    }

    /// Stops the clock. Idempotent.
    pub fn stop(&self) {
        let mut clock = self.clock.lock();
        if clock.started.is_some() && clock.stopped.is_none() {
            clock.stopped = Some(Instant::now());
            clock.stop_time = Some(Utc::now());
        }
    }

    pub fn running(&self) -> bool {
        let clock = self.clock.lock();
        clock.started.is_some() && clock.stopped.is_none()
    }

    /// Time elapsed since start, frozen once stopped.
    pub fn elapsed(&self) -> Duration {
        let clock = self.clock.lock();
        match (clock.started, clock.stopped) {
            (Some(start), Some(stop)) => stop.duration_since(start),
            (Some(start), None) => start.elapsed(),
            _ => Duration::ZERO,
        }
    }

    /// `None` when unlimited.
    pub fn remaining(&self) -> Option<Duration> {
        self.limit.map(|limit| limit.saturating_sub(self.elapsed()))
    }

    pub fn timed_out(&self) -> bool {
        self.remaining().is_some_and(|r| r.is_zero())
    }

    pub fn start_time(&self) -> Option<DateTime<Utc>> {
        self.clock.lock().start_time
    }

    pub fn stop_time(&self) -> Option<DateTime<Utc>> {
        self.clock.lock().stop_time
    }
}
