//! # Skein Runtime
//!
//! A structured-concurrency effect runtime:
//!
//! - **Effects**: lazy, composable descriptions of computations that
//!   succeed with `A` or fail with a [`Cause`] of typed failures, defects
//!   and interruptions
//! - **Fibers**: lightweight interpreters of effects, forming a supervision
//!   tree where a finishing parent interrupts and awaits its children
//! - **Scheduler**: M:N cooperative scheduling with work-stealing
//! - **Scopes**: finalizers released in reverse acquisition order on every
//!   exit path
//! - **Layers**: services built once per graph and shared between fibers
//!
//! ## Technical Standards
//!
//! - **Work Stealing**: Based on Chase-Lev deque per
//!   [crossbeam-deque](https://docs.rs/crossbeam-deque)
//! - **Blocking handoff**: results leave the worker pool through
//!   [crossbeam-channel](https://docs.rs/crossbeam-channel)
//! - **Logging**: [tracing](https://docs.rs/tracing) events, see [`log`]
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                         SKEIN RUNTIME                            │
//! ├─────────────────────────────────────────────────────────────────┤
//! │                                                                  │
//! │  ┌──────────────┐  ┌──────────────┐  ┌──────────────┐          │
//! │  │    Effect    │  │  Cause/Exit  │  │   Context    │          │
//! │  │ (effect.rs)  │  │  (cause.rs)  │  │ (context.rs) │          │
//! │  └──────────────┘  └──────────────┘  └──────────────┘          │
//! │         │                 │                 │                   │
//! │         └─────────────────┼─────────────────┘                   │
//! │                           │                                     │
//! │  ┌──────────────┐  ┌──────────────┐  ┌──────────────┐          │
//! │  │    Fiber     │  │  Scheduler   │  │    Timer     │          │
//! │  │  (fiber.rs)  │  │(scheduler.rs)│  │  (timer.rs)  │          │
//! │  └──────────────┘  └──────────────┘  └──────────────┘          │
//! │         │                 │                 │                   │
//! │         └─────────────────┼─────────────────┘                   │
//! │                           │                                     │
//! │  ┌──────────────┐  ┌──────────────┐  ┌──────────────┐          │
//! │  │    Scope     │  │   Deferred   │  │    Layer     │          │
//! │  │  (scope.rs)  │  │(deferred.rs) │  │  (layer.rs)  │          │
//! │  └──────────────┘  └──────────────┘  └──────────────┘          │
//! │                                                                  │
//! └─────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Example
//!
//! ```rust,ignore
//! use skein_runtime::{Effect, Exit, Runtime, RuntimeConfig};
//! use std::time::Duration;
//!
//! let rt = Runtime::new(RuntimeConfig::default())?;
//! let slow = Effect::<bool, String>::succeed(true).delay(Duration::from_secs(5));
//! let exit = rt.run(slow.race(Effect::fail("boom".to_string())));
//! assert_eq!(exit, Exit::fail("boom".to_string()));
//! ```

#![warn(missing_docs)]
#![warn(rust_2018_idioms)]

pub mod cause;
pub mod config;
pub mod context;
pub mod deferred;
pub mod effect;
pub mod exit;
pub mod fiber;
pub mod layer;
pub mod log;
pub mod panic;
pub mod parallel;
pub mod runtime;
mod scheduler;
pub mod scope;
pub mod timeout;
mod timer;

// Re-exports
pub use cause::{AnyError, Cause, Defect, Failure};
pub use config::{ConfigError, LogConfig, LogLevel, RuntimeConfig, RuntimeConfigBuilder};
pub use context::Context;
pub use deferred::Deferred;
pub use effect::{Effect, Restore, Resume};
pub use exit::{AnyExit, Exit};
pub use fiber::{FiberHandle, FiberId, FiberStatus};
pub use layer::{Layer, LayerGraph, LayerId};
pub use log::init_logging;
pub use panic::CaughtPanic;
pub use parallel::collect_all_par;
pub use runtime::{Runtime, RuntimeError};
pub use scope::{acquire_release, scoped, Finalizer, Scope};
pub use timeout::Deadline;

/// Runtime version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version() {
        assert!(!VERSION.is_empty());
    }

    #[test]
    fn test_end_to_end() {
        let rt = Runtime::new(RuntimeConfig::builder().num_workers(2).build().unwrap()).unwrap();
        let effect = Effect::<i32, String>::succeed(20)
            .zip_par(Effect::succeed(22))
            .map(|(a, b)| a + b);
        assert_eq!(rt.run(effect), Exit::succeed(42));
    }
}
