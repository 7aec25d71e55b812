//! Receive watchdog.
//!
//! Pure state machine without timers of its own: the owner calls
//! [`ReceiveWatchdog::check`] periodically and acts on the verdict. Time is
//! passed in, which keeps the hysteresis testable.
//!
//! * Every full `timeout` without a telegram requests one restart, so a
//!   silent link is restarted at `T`, `2T`, `3T`, ... and never on every tick.
//! * After `OFFLINE_FACTOR * timeout` the link is reported offline once.
//! * The next telegram reports it online again.

use std::time::Duration;
use tokio::time::Instant;

use crate::constants::{MIN_WATCHDOG_PERIOD, OFFLINE_FACTOR};

/// Online/offline transition reported by the watchdog.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusChange {
    Online,
    Offline,
}

/// Result of one watchdog check.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WatchdogVerdict {
    /// The link should be reopened
    pub restart: bool,
    /// The link just crossed the offline threshold
    pub offline: bool,
}

impl WatchdogVerdict {
    pub fn status_change(&self) -> Option<StatusChange> {
        self.offline.then_some(StatusChange::Offline)
    }
}

#[derive(Debug, Clone)]
pub struct ReceiveWatchdog {
    timeout: Duration,
    offline_after: Duration,
    last_received: Instant,
    /// Number of breach windows a restart was already requested for
    restarts_requested: u64,
    /// `None` until the first telegram or offline transition
    online: Option<bool>,
}

impl ReceiveWatchdog {
    pub fn new(timeout: Duration, now: Instant) -> Self {
        let timeout = timeout.max(Duration::from_millis(1));
        ReceiveWatchdog {
            timeout,
            offline_after: timeout * OFFLINE_FACTOR,
            last_received: now,
            restarts_requested: 0,
            online: None,
        }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub fn offline_after(&self) -> Duration {
        self.offline_after
    }

    /// Interval at which the owner should call [`check`](Self::check).
    pub fn period(&self) -> Duration {
        (self.timeout / 4).max(MIN_WATCHDOG_PERIOD)
    }

    pub fn last_received(&self) -> Instant {
        self.last_received
    }

    /// Records a telegram. Returns `Online` when the link was not online
    /// before.
    pub fn telegram_received(&mut self, now: Instant) -> Option<StatusChange> {
        self.last_received = now;
        self.restarts_requested = 0;
        if self.online == Some(true) {
            None
        } else {
            self.online = Some(true);
            Some(StatusChange::Online)
        }
    }

    /// Restarts the silence measurement without changing the online state,
    /// e.g. after the device was (re)started.
    pub fn rearm(&mut self, now: Instant) {
        self.last_received = now;
        self.restarts_requested = 0;
    }

    pub fn check(&mut self, now: Instant) -> WatchdogVerdict {
        let elapsed = now.saturating_duration_since(self.last_received);
        let breaches = (elapsed.as_millis() / self.timeout.as_millis()) as u64;

        let mut verdict = WatchdogVerdict::default();
        if breaches > self.restarts_requested {
            self.restarts_requested = breaches;
            verdict.restart = true;
        }
        if elapsed >= self.offline_after && self.online != Some(false) {
            self.online = Some(false);
            verdict.offline = true;
        }
        verdict
    }
}
