// Polling / retry pacing
//
// One abstraction for every "check, sleep, check again" loop in the engine (health monitor,
// credential probe readiness, mismatch retries). A `Pacer` is armed when created: its deadline
// is wall-clock from that moment and is never carried over into another loop.
//
// Usage:
//   let mut pacer = policy.start();
//   loop {
//       if check().await { break; }
//       if let Err(stop) = pacer.next_attempt(&cancel).await { ... }
//   }

use std::time::Duration;
use tokio::time::Instant;
use tokio_retry::strategy::FixedInterval;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub interval: Duration,
    pub timeout: Duration,
    /// Upper bound on checks performed; `None` means bounded by `timeout` only.
    pub max_attempts: Option<u32>,
}

/// Why a pacer refused another attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PaceStop {
    TimedOut,
    Exhausted,
    Cancelled,
}

impl RetryPolicy {
    pub fn new(interval: Duration, timeout: Duration) -> Self {
        Self {
            interval,
            timeout,
            max_attempts: None,
        }
    }

    pub fn with_max_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = Some(attempts.max(1));
        self
    }

    /// Arm a new pacer; the timeout starts counting now.
    pub fn start(&self) -> Pacer {
        let started = Instant::now();
        Pacer {
            started,
            deadline: started + self.timeout,
            attempts: 0,
            max_attempts: self.max_attempts,
            delays: FixedInterval::new(self.interval),
        }
    }
}

#[derive(Debug)]
pub struct Pacer {
    started: Instant,
    deadline: Instant,
    attempts: u32,
    max_attempts: Option<u32>,
    delays: FixedInterval,
}

impl Pacer {
    /// Checks performed so far.
    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }

    pub fn remaining(&self) -> Duration {
        self.deadline.saturating_duration_since(Instant::now())
    }

    /// Record a failed check and wait for the next slot.
    ///
    /// The sleep is the only suspension point; cancellation is observed before and during it.
    /// The wait is clipped to the deadline so the final check happens at the deadline rather
    /// than after it.
    pub async fn next_attempt(&mut self, cancel: &CancellationToken) -> Result<(), PaceStop> {
        self.attempts = self.attempts.saturating_add(1);

        if cancel.is_cancelled() {
            return Err(PaceStop::Cancelled);
        }
        if let Some(max) = self.max_attempts {
            if self.attempts >= max {
                return Err(PaceStop::Exhausted);
            }
        }
        let remaining = self.remaining();
        if remaining.is_zero() {
            return Err(PaceStop::TimedOut);
        }

        let delay = self
            .delays
            .next()
            .unwrap_or(Duration::ZERO)
            .min(remaining);

        tokio::select! {
            _ = tokio::time::sleep(delay) => Ok(()),
            _ = cancel.cancelled() => Err(PaceStop::Cancelled),
        }
    }
}
