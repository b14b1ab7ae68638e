//! Liveness watchdog.
//!
//! Pings are written by the session's send task; the watchdog only samples
//! the connection's alive flag once per interval.

use std::sync::Arc;
use std::time::Duration;

use tokio::time::{self, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use super::connection::ClientConnection;

/// Shortest tick period; `tokio::time::interval` rejects zero.
const MIN_PERIOD: Duration = Duration::from_millis(1);

/// `period`, raised to at least one millisecond.
pub(crate) fn tick_period(period: Duration) -> Duration {
    period.max(MIN_PERIOD)
}

/// Why [`Watchdog::watch`] returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    /// Too many silent intervals in a row.
    Unresponsive,
    /// The session ended first.
    Stopped,
}

/// Samples one connection's alive flag on a fixed interval.
#[derive(Debug, Clone, Copy)]
pub struct Watchdog {
    interval: Duration,
    allowed_silences: u32,
}

impl Watchdog {
    /// A watchdog that gives up after roughly `timeout` without inbound frames.
    ///
    /// At least one full silent interval is always tolerated.
    pub fn new(interval: Duration, timeout: Duration) -> Self {
        let interval = tick_period(interval);
        let per_tick = interval.as_millis();
        let allowed_silences = u32::try_from(timeout.as_millis() / per_tick)
            .unwrap_or(u32::MAX)
            .max(1);
        Self {
            interval,
            allowed_silences,
        }
    }

    /// Consecutive silent samples that end the watch.
    pub fn allowed_silences(&self) -> u32 {
        self.allowed_silences
    }

    /// Sample `conn` until it goes quiet or `stop` fires.
    ///
    /// The first sample happens one interval after the call. Each sample
    /// consumes the alive flag, so only frames received since the previous
    /// sample count.
    pub async fn watch(self, conn: Arc<ClientConnection>, stop: CancellationToken) -> Verdict {
        let mut ticks = time::interval_at(Instant::now() + self.interval, self.interval);
        ticks.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut silent = 0_u32;

        loop {
            tokio::select! {
                () = stop.cancelled() => return Verdict::Stopped,
                _ = ticks.tick() => {
                    silent = if conn.check_alive() { 0 } else { silent + 1 };
                    if silent >= self.allowed_silences {
                        return Verdict::Unresponsive;
                    }
                }
            }
        }
    }
}
