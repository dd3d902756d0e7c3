//! Liveness watchdog with exponential backoff.
//!
//! The watchdog only decides; the recovery action itself (restarting the
//! encoder, rebinding a source) is supplied by the caller.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crate::error::Result;
use crate::pipeline::Liveness;

/// Doubling delay between recovery attempts, capped at `max`.
#[derive(Debug, Clone)]
pub struct Backoff {
    base: Duration,
    max: Duration,
    current: Duration,
}

impl Backoff {
    pub fn new(base: Duration, max: Duration) -> Self {
        Self {
            base,
            max: max.max(base),
            current: base,
        }
    }

    /// Delay to wait now; the following call returns twice as much.
    pub fn next_delay(&mut self) -> Duration {
        let delay = self.current;
        self.current = (self.current * 2).min(self.max);
        delay
    }

    pub fn reset(&mut self) {
        self.current = self.base;
    }
}

/// What a recovery attempt reported.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecoveryOutcome {
    /// The action ran; liveness decides whether it worked.
    Attempted,
    Failed(String),
}

/// What the watchdog wants done after a check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchdogDecision {
    Healthy,
    /// Stalled, but the previous attempt's backoff has not elapsed.
    Waiting { remaining: Duration },
    Recover { attempt: u32, idle: Duration },
}

#[derive(Debug, Clone)]
pub struct Watchdog {
    stall_after: Duration,
    backoff: Backoff,
    attempts: u32,
    next_attempt: Option<Instant>,
}

impl Watchdog {
    /// `stall_after`: how long without a frame counts as a stall.
    pub fn new(stall_after: Duration, backoff: Backoff) -> Self {
        Self {
            stall_after,
            backoff,
            attempts: 0,
            next_attempt: None,
        }
    }

    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    pub fn evaluate(&mut self, idle: Duration, now: Instant) -> WatchdogDecision {
        if idle < self.stall_after {
            if self.attempts > 0 {
                tracing::info!(attempts = self.attempts, "stream healthy again");
            }
            self.attempts = 0;
            self.next_attempt = None;
            self.backoff.reset();
            return WatchdogDecision::Healthy;
        }
        if let Some(at) = self.next_attempt
            && now < at
        {
            return WatchdogDecision::Waiting {
                remaining: at - now,
            };
        }
        self.attempts += 1;
        WatchdogDecision::Recover {
            attempt: self.attempts,
            idle,
        }
    }

    /// Schedule the next attempt after a recovery action ran.
    pub fn record(&mut self, outcome: &RecoveryOutcome, now: Instant) {
        let delay = self.backoff.next_delay();
        self.next_attempt = Some(now + delay);
        match outcome {
            RecoveryOutcome::Attempted => {
                tracing::info!(attempt = self.attempts, next_in_ms = delay.as_millis() as u64, "recovery attempted");
            }
            RecoveryOutcome::Failed(reason) => {
                tracing::warn!(attempt = self.attempts, next_in_ms = delay.as_millis() as u64, reason = %reason, "recovery failed");
            }
        }
    }

    /// Run checks every `interval` on a background thread until stopped.
    pub fn spawn<F>(
        mut self,
        interval: Duration,
        liveness: Arc<Liveness>,
        mut recover: F,
    ) -> Result<WatchdogHandle>
    where
        F: FnMut(u32) -> RecoveryOutcome + Send + 'static,
    {
        let running = Arc::new(AtomicBool::new(true));
        let flag = running.clone();
        let handle = thread::Builder::new()
            .name("watchdog".into())
            .spawn(move || {
                while flag.load(Ordering::SeqCst) {
                    thread::sleep(interval);
                    let now = Instant::now();
                    match self.evaluate(liveness.idle_for(), now) {
                        WatchdogDecision::Recover { attempt, idle } => {
                            tracing::warn!(attempt, idle_ms = idle.as_millis() as u64, "stream stalled");
                            let outcome = recover(attempt);
                            self.record(&outcome, Instant::now());
                        }
                        WatchdogDecision::Waiting { .. } | WatchdogDecision::Healthy => {}
                    }
                }
            })?;
        Ok(WatchdogHandle {
            running,
            handle: Some(handle),
        })
    }
}

pub struct WatchdogHandle {
    running: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl WatchdogHandle {
    pub fn stop(&mut self) {
        self.running.store(false, Ordering::SeqCst);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for WatchdogHandle {
    fn drop(&mut self) {
        self.stop();
    }
}
