//! Panic Capture
//!
//! Every user closure the interpreter runs (sync thunks, continuations,
//! failure handlers, finalizers) goes through [`catch_panic`]. A caught
//! panic is turned into a [`Defect`](crate::cause::Defect) carrying the
//! panic message, so it surfaces as a `Die` leaf in the fiber's cause
//! instead of tearing down the worker thread.
//!
//! The process-wide panic hook is left alone: the default hook still prints
//! the panic to stderr before it is caught here.

use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};

/// Counter for panics caught by the runtime.
static PANIC_COUNT: AtomicU64 = AtomicU64::new(0);

/// Information about a caught panic.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CaughtPanic {
    /// Panic message.
    message: String,
    /// Thread name where the panic occurred.
    thread_name: Option<String>,
    /// Sequence number of this panic among all panics caught by the runtime.
    count: u64,
}

impl CaughtPanic {
    fn from_payload(payload: &(dyn Any + Send)) -> Self {
        let count = PANIC_COUNT.fetch_add(1, Ordering::Relaxed) + 1;
        Self {
            message: payload_message(payload),
            thread_name: std::thread::current().name().map(str::to_string),
            count,
        }
    }

    /// Get the panic message.
    pub fn message(&self) -> &str {
        &self.message
    }

    /// Get the thread name, if available.
    pub fn thread_name(&self) -> Option<&str> {
        self.thread_name.as_deref()
    }

    /// Get the panic sequence number.
    pub fn count(&self) -> u64 {
        self.count
    }

    /// Take the message out of the panic info.
    pub fn into_message(self) -> String {
        self.message
    }
}

/// Extract a human-readable message from a panic payload.
///
/// `panic!("literal")` produces a `&str` payload, formatted panics produce a
/// `String`; anything else is reported as "unknown panic".
pub fn payload_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

/// Run a closure, converting a panic into a [`CaughtPanic`].
///
/// The closure is wrapped in `AssertUnwindSafe`. The interpreter owns all
/// state the closure can observe after the unwind, and it discards the
/// continuation that panicked.
pub fn catch_panic<F, R>(f: F) -> Result<R, CaughtPanic>
where
    F: FnOnce() -> R,
{
    panic::catch_unwind(AssertUnwindSafe(f)).map_err(|payload| CaughtPanic::from_payload(&*payload))
}

/// Number of panics caught by the runtime since process start.
pub fn caught_panic_count() -> u64 {
    PANIC_COUNT.load(Ordering::Relaxed)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_catch_panic_success() {
        let result = catch_panic(|| 42);
        assert_eq!(result, Ok(42));
    }

    #[test]
    fn test_catch_panic_str() {
        let result: Result<(), _> = catch_panic(|| panic!("oops"));
        let info = result.unwrap_err();
        assert_eq!(info.message(), "oops");
        assert!(info.count() >= 1);
    }

    #[test]
    fn test_catch_panic_string() {
        let code = 7;
        let result: Result<(), _> = catch_panic(|| panic!("failed with code {}", code));
        assert_eq!(result.unwrap_err().into_message(), "failed with code 7");
    }

    #[test]
    fn test_payload_message_unknown() {
        let payload: Box<dyn Any + Send> = Box::new(17u32);
        assert_eq!(payload_message(&*payload), "unknown panic");
    }

    #[test]
    fn test_caught_panic_count_increases() {
        let before = caught_panic_count();
        let _ = catch_panic(|| panic!("counted"));
        assert!(caught_panic_count() > before);
    }
}
