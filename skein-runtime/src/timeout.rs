//! Timeout Enforcement
//!
//! Timeouts race an effect against an interruptible sleep:
//! - When the sleep wins, the effect's fiber is interrupted and awaited
//! - When the effect wins, the sleep is interrupted and its timer cancelled
//!
//! Either way both fibers have finished before the caller continues. An
//! effect that is uninterruptible is allowed to run to completion, so the
//! timeout only takes effect at its next interruptible boundary.
//!
//! # Example
//!
//! ```rust,ignore
//! use skein_runtime::Effect;
//! use std::time::Duration;
//!
//! let slow = Effect::<bool, String>::succeed(true).delay(Duration::from_secs(5));
//! let timed = slow.timeout(Duration::from_millis(10)); // Effect<Option<bool>, String>
//! ```

use std::time::{Duration, Instant};

use crate::cause::{Cause, Failure};
use crate::effect::Effect;

/// Roughly thirty years.
const FAR_FUTURE: Duration = Duration::from_secs(86_400 * 365 * 30);

/// A deadline represents an absolute point in time by which an operation
/// must complete.
///
/// Unlike a `Duration`, a `Deadline` shared by several steps does not
/// restart for each of them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct Deadline {
    instant: Instant,
}

impl Deadline {
    /// Create a deadline at a specific instant.
    pub fn at(instant: Instant) -> Self {
        Self { instant }
    }

    /// Create a deadline that expires after a duration from now.
    ///
    /// Durations past the representable range are clamped to the far
    /// future.
    pub fn after(duration: Duration) -> Self {
        let now = Instant::now();
        let instant = now
            .checked_add(duration)
            .or_else(|| now.checked_add(FAR_FUTURE))
            .unwrap_or(now);
        Self { instant }
    }

    /// Get the underlying instant.
    pub fn instant(&self) -> Instant {
        self.instant
    }

    /// Check if the deadline has passed.
    pub fn is_expired(&self) -> bool {
        Instant::now() >= self.instant
    }

    /// Get the time remaining until the deadline.
    ///
    /// Returns `Duration::ZERO` if the deadline has already passed.
    pub fn remaining(&self) -> Duration {
        self.instant.saturating_duration_since(Instant::now())
    }
}

impl From<Instant> for Deadline {
    fn from(instant: Instant) -> Self {
        Self::at(instant)
    }
}

impl From<Duration> for Deadline {
    fn from(duration: Duration) -> Self {
        Self::after(duration)
    }
}

impl<A: Send + 'static, E: Failure> Effect<A, E> {
    /// Run with a time limit. Produces `None` if the limit passes first.
    pub fn timeout(self, duration: Duration) -> Effect<Option<A>, E>
    where
        A: Clone,
    {
        let timer = Effect::<(), E>::sleep(duration)
            .interruptible()
            .as_value(None);
        self.map(Some).race(timer)
    }

    /// Run until `deadline`. Produces `None` if it passes first.
    ///
    /// The remaining time is measured when the effect starts.
    pub fn timeout_at(self, deadline: Deadline) -> Effect<Option<A>, E>
    where
        A: Clone,
    {
        Effect::suspend(move || self.timeout(deadline.remaining()))
    }

    /// Run with a time limit, failing with `error` if it passes first.
    pub fn timeout_fail(self, error: E, duration: Duration) -> Effect<A, E>
    where
        A: Clone,
    {
        self.timeout_fail_cause(Cause::fail(error), duration)
    }

    /// Run with a time limit, failing with `cause` if it passes first.
    pub fn timeout_fail_cause(self, cause: Cause<E>, duration: Duration) -> Effect<A, E>
    where
        A: Clone,
    {
        self.timeout(duration).flat_map(move |value| match value {
            Some(a) => Effect::succeed(a),
            None => Effect::fail_cause(cause),
        })
    }
}

impl<E: Failure> Effect<(), E> {
    /// Suspend the fiber until `deadline`. Returns at once if it has passed.
    pub fn sleep_until(deadline: Deadline) -> Self {
        Effect::suspend(move || Effect::sleep(deadline.remaining()))
    }
}
