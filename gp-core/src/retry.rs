//! Retry policy with pluggable clock
//!
//! Module loading and device availability polling both wait on hardware.
//! The waits are expressed as a [`RetryPolicy`] run against a [`Clock`], so
//! tests can drive the loop with [`FakeClock`] and never sleep.

use std::cell::RefCell;
use std::time::Duration;
use tracing::debug;

/// Delay schedule between attempts
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Backoff {
    /// Same delay between every attempt
    Fixed(Duration),
    /// Delay grows by one step per failed attempt (step, 2*step, ...)
    Linear(Duration),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts including the first, at least 1
    pub max_attempts: u32,
    pub backoff: Backoff,
}

impl RetryPolicy {
    pub fn fixed(max_attempts: u32, interval: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            backoff: Backoff::Fixed(interval),
        }
    }

    pub fn linear(max_attempts: u32, step: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            backoff: Backoff::Linear(step),
        }
    }

    /// Single attempt, no waiting
    pub fn once() -> Self {
        Self::fixed(1, Duration::ZERO)
    }

    /// Delay after the given failed attempt (1-indexed)
    pub fn delay_after(&self, attempt: u32) -> Duration {
        match self.backoff {
            Backoff::Fixed(interval) => interval,
            Backoff::Linear(step) => step * attempt,
        }
    }

    /// Run `op` until it succeeds or attempts run out; returns the last error
    pub fn run<T, E, F>(&self, clock: &dyn Clock, mut op: F) -> Result<T, E>
    where
        F: FnMut(u32) -> Result<T, E>,
        E: std::fmt::Display,
    {
        let mut attempt = 1;
        loop {
            match op(attempt) {
                Ok(value) => return Ok(value),
                Err(e) if attempt >= self.max_attempts => return Err(e),
                Err(e) => {
                    let delay = self.delay_after(attempt);
                    debug!(attempt, max = self.max_attempts, "Attempt failed: {}, retrying in {:?}", e, delay);
                    clock.sleep(delay);
                    attempt += 1;
                }
            }
        }
    }

    /// Poll `check` until it returns true; false when attempts run out
    pub fn poll<F>(&self, clock: &dyn Clock, mut check: F) -> bool
    where
        F: FnMut() -> bool,
    {
        for attempt in 1..=self.max_attempts {
            if check() {
                return true;
            }
            if attempt < self.max_attempts {
                clock.sleep(self.delay_after(attempt));
            }
        }
        false
    }
}

/// Source of waiting
pub trait Clock {
    fn sleep(&self, duration: Duration);
}

impl<C: Clock + ?Sized> Clock for &C {
    fn sleep(&self, duration: Duration) {
        (**self).sleep(duration)
    }
}

/// Real clock backed by `std::thread::sleep`
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn sleep(&self, duration: Duration) {
        if !duration.is_zero() {
            std::thread::sleep(duration);
        }
    }
}

/// Clock that records requested sleeps and returns immediately
#[derive(Debug, Default)]
pub struct FakeClock {
    sleeps: RefCell<Vec<Duration>>,
}

impl FakeClock {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn sleeps(&self) -> Vec<Duration> {
        self.sleeps.borrow().clone()
    }

    pub fn total(&self) -> Duration {
        self.sleeps.borrow().iter().sum()
    }
}

impl Clock for FakeClock {
    fn sleep(&self, duration: Duration) {
        self.sleeps.borrow_mut().push(duration);
    }
}
