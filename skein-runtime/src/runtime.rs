//! # Runtime
//!
//! Owns the scheduler, its worker threads and the timer, and is the entry
//! point for running effects from ordinary threads.
//!
//! ```rust,ignore
//! use skein_runtime::{Effect, Exit, Runtime, RuntimeConfig};
//!
//! let rt = Runtime::new(RuntimeConfig::builder().num_workers(2).build()?)?;
//! let exit = rt.run(Effect::<i32, String>::succeed(1).map(|n| n + 1));
//! assert_eq!(exit, Exit::succeed(2));
//! ```
//!
//! Shutdown interrupts every live fiber, waits up to the configured grace
//! period for their finalizers, then stops the workers. Fibers that still
//! have not finished are completed with a defect.

use std::sync::{Arc, OnceLock};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use thiserror::Error;
use tracing::{info, warn};

use crate::cause::Failure;
use crate::config::{ConfigError, RuntimeConfig};
use crate::effect::Effect;
use crate::exit::{AnyExit, Exit};
use crate::fiber::{store_result, FiberHandle, FiberId, Observer};
use crate::log::init_logging;
use crate::scheduler::{self, Scheduler};

/// Errors from starting or using a [`Runtime`].
#[derive(Debug, Error)]
pub enum RuntimeError {
    /// The runtime no longer accepts fibers.
    #[error("runtime is shut down")]
    ShutDown,
    /// A blocking call was made on a runtime worker thread.
    #[error("blocking call made from a runtime worker thread")]
    CalledFromWorker,
    /// The configuration failed validation.
    #[error("invalid runtime configuration: {0}")]
    Config(#[from] ConfigError),
    /// A runtime thread could not be started.
    #[error("failed to start runtime thread: {0}")]
    WorkerSpawn(#[from] std::io::Error),
}

/// A running fiber runtime.
pub struct Runtime {
    scheduler: Arc<Scheduler>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    config: RuntimeConfig,
}

impl Runtime {
    /// Start a runtime with the given configuration.
    pub fn new(config: RuntimeConfig) -> Result<Self, RuntimeError> {
        config.validate()?;
        Self::start(config)
    }

    fn start(config: RuntimeConfig) -> Result<Self, RuntimeError> {
        let (scheduler, workers) = Scheduler::start(config.scheduler.clone())?;
        Ok(Self {
            scheduler,
            workers: Mutex::new(workers),
            config,
        })
    }

    /// The process-wide runtime, configured from `SKEIN_*` environment
    /// variables on first use. Also installs the log subscriber.
    ///
    /// # Panics
    ///
    /// Panics if the worker threads cannot be started.
    pub fn global() -> &'static Runtime {
        static GLOBAL: OnceLock<Runtime> = OnceLock::new();
        GLOBAL.get_or_init(|| {
            let config = RuntimeConfig::from_env();
            init_logging(&config.log);
            let config = match config.validate() {
                Ok(()) => config,
                Err(err) => {
                    warn!(error = %err, "invalid environment configuration, using defaults");
                    RuntimeConfig::default()
                }
            };
            Runtime::start(config).expect("failed to start the global runtime")
        })
    }

    /// The configuration the runtime was started with.
    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    /// Number of worker threads.
    pub fn num_workers(&self) -> usize {
        self.scheduler.num_workers()
    }

    /// Start `effect` in a new root fiber.
    pub fn spawn<A, E>(&self, effect: Effect<A, E>) -> Result<FiberHandle<A, E>, RuntimeError>
    where
        A: Send + 'static,
        E: Failure,
    {
        self.spawn_observed(effect, None)
    }

    fn spawn_observed<A, E>(
        &self,
        effect: Effect<A, E>,
        observer: Option<Observer>,
    ) -> Result<FiberHandle<A, E>, RuntimeError>
    where
        A: Send + 'static,
        E: Failure,
    {
        let result = Arc::new(Mutex::new(None));
        let op = store_result(effect, Arc::clone(&result));
        let fiber = self.scheduler.spawn_root(op, observer)?;
        Ok(FiberHandle::new(fiber, result))
    }

    /// Run `effect` to completion, blocking the calling thread.
    ///
    /// Must not be called from a runtime worker thread: the result is a
    /// defect instead of a deadlock.
    pub fn run<A, E>(&self, effect: Effect<A, E>) -> Exit<E, A>
    where
        A: Send + 'static,
        E: Failure,
    {
        if scheduler::on_worker_thread() {
            return Exit::die(RuntimeError::CalledFromWorker.to_string());
        }
        let (tx, rx) = crossbeam_channel::bounded(1);
        let observer: Observer = Box::new(move |exit: &AnyExit| {
            let _ = tx.send(exit.clone());
        });
        let handle = match self.spawn_observed(effect, Some(observer)) {
            Ok(handle) => handle,
            Err(err) => return Exit::die(err.to_string()),
        };
        match rx.recv() {
            Ok(exit) => handle.take_exit(&exit),
            Err(_) => Exit::die(RuntimeError::ShutDown.to_string()),
        }
    }

    /// Number of fibers that have started and not finished.
    pub fn active_fiber_count(&self) -> usize {
        self.scheduler.active_fiber_count()
    }

    /// True once [`Runtime::shutdown`] has been called.
    pub fn is_shut_down(&self) -> bool {
        self.scheduler.is_shutting_down()
    }

    /// Interrupt all fibers, wait for them within the grace period and stop
    /// the workers. Idempotent.
    pub fn shutdown(&self) {
        if !self.scheduler.begin_shutdown() {
            return;
        }
        let live = self.scheduler.live_fibers();
        info!(fibers = live.len(), "runtime shutting down");
        for fiber in &live {
            fiber.interrupt_as(FiberId::NONE);
        }
        drop(live);

        let deadline = Instant::now() + self.config.timeout.shutdown_grace;
        while self.scheduler.active_fiber_count() > 0 && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(1));
        }

        self.scheduler.stop();
        let current = thread::current().id();
        for handle in self.workers.lock().drain(..) {
            if handle.thread().id() != current {
                let _ = handle.join();
            }
        }

        let remaining = self.scheduler.active_fiber_count();
        if remaining > 0 {
            warn!(fibers = remaining, "fibers did not finish within the shutdown grace period");
        }
        self.scheduler.drain(&Exit::die("runtime shut down"));
        info!("runtime shut down");
    }

    #[cfg(test)]
    pub(crate) fn scheduler(&self) -> &Arc<Scheduler> {
        &self.scheduler
    }
}

impl Drop for Runtime {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl std::fmt::Debug for Runtime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Runtime")
            .field("workers", &self.num_workers())
            .field("fibers", &self.active_fiber_count())
            .field("shut_down", &self.is_shut_down())
            .finish()
    }
}
