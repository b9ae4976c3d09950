//! Global ceiling on outbound provider calls.
//!
//! One limiter instance is shared by every fetcher in the process. It admits
//! at most `calls` acquisitions within any rolling `period`; callers over the
//! budget block until the oldest admission leaves the window. The limiter
//! never fails, it only delays.

use crate::clock::Clock;
use chrono::{DateTime, Utc};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

pub struct RateLimiter {
    calls: usize,
    period: Duration,
    clock: Arc<dyn Clock>,
    admitted: Mutex<VecDeque<DateTime<Utc>>>,
}

impl RateLimiter {
    /// A limiter admitting `calls` per rolling `period`. Zero calls is treated as one.
    pub fn new(calls: usize, period: Duration, clock: Arc<dyn Clock>) -> Self {
        let calls = calls.max(1);
        Self {
            calls,
            period,
            clock,
            admitted: Mutex::new(VecDeque::with_capacity(calls)),
        }
    }

    /// Default provider ceiling: 2 calls per second.
    pub fn default_provider(clock: Arc<dyn Clock>) -> Self {
        Self::new(2, Duration::from_secs(1), clock)
    }

    pub fn calls(&self) -> usize {
        self.calls
    }

    pub fn period(&self) -> Duration {
        self.period
    }

    /// Block until one more call fits under the ceiling, then record it.
    pub fn acquire(&self) {
        loop {
            match self.admit_or_wait() {
                None => return,
                Some(wait) => self.clock.sleep(wait),
            }
        }
    }

    /// Record a call if it fits under the ceiling right now.
    pub fn try_acquire(&self) -> bool {
        self.admit_or_wait().is_none()
    }

    /// Admit now (`None`) or report how long until the oldest admission expires.
    fn admit_or_wait(&self) -> Option<Duration> {
        let period = chrono::Duration::from_std(self.period).unwrap_or(chrono::Duration::zero());
        // The window is plain data; a panicked holder cannot leave it inconsistent.
        let mut admitted = self.admitted.lock().unwrap_or_else(|e| e.into_inner());
        let now = self.clock.now();

        while let Some(&oldest) = admitted.front() {
            if oldest + period <= now {
                admitted.pop_front();
            } else {
                break;
            }
        }

        if admitted.len() < self.calls {
            admitted.push_back(now);
            return None;
        }

        let oldest = *admitted.front()?;
        let wait = (oldest + period - now)
            .to_std()
            .unwrap_or(Duration::ZERO)
            .max(Duration::from_millis(1));
        Some(wait)
    }
}

impl std::fmt::Debug for RateLimiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RateLimiter")
            .field("calls", &self.calls)
            .field("period", &self.period)
            .finish()
    }
}
