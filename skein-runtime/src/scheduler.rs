//! # Work-Stealing Fiber Scheduler
//!
//! M:N cooperative scheduler with work-stealing.
//!
//! ## Design
//!
//! - Multiple worker threads, each with a local deque
//! - Global injection queue for fibers submitted from outside a worker
//! - Work-stealing for load balancing
//! - Idle workers park on a condition variable with a timeout
//!
//! The unit of work is a boxed [`FiberRuntime`]: whoever holds it may run
//! the fiber, so a fiber is on at most one queue at a time. A fiber
//! submitted from a worker of the same scheduler goes to that worker's
//! deque; anything else goes through the injector. A fiber that yields or
//! runs out of budget is requeued through the injector, behind timer and
//! foreign resumptions, and every worker checks the injector first once
//! every `GLOBAL_POLL_INTERVAL` ticks.
//!
//! ## Technical References
//!
//! - [Chase-Lev Deque](https://doi.org/10.1145/1073970.1073974)
//! - [crossbeam-deque](https://docs.rs/crossbeam-deque)
//! - [Tokio Scheduler](https://tokio.rs/blog/2019-10-scheduler)

use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock};
use std::thread::{self, JoinHandle};

use crossbeam_deque::{Injector, Steal, Stealer, Worker as Deque};
use parking_lot::{Condvar, Mutex};
use tracing::{debug, info};

use crate::config::SchedulerConfig;
use crate::context::Context;
use crate::effect::Op;
use crate::exit::AnyExit;
use crate::fiber::{FiberId, FiberRuntime, FiberShared, Observer};
use crate::runtime::RuntimeError;
use crate::timer::{Timer, TimerHandle};

type Task = Box<FiberRuntime>;

static NEXT_SCHEDULER_ID: AtomicU64 = AtomicU64::new(1);

/// Ticks between forced polls of the global queue.
const GLOBAL_POLL_INTERVAL: u32 = 61;

thread_local! {
    /// The scheduler owning this worker thread and the worker's deque.
    static CURRENT: RefCell<Option<(u64, Deque<Task>)>> = const { RefCell::new(None) };
}

/// True when called from any runtime worker thread.
pub(crate) fn on_worker_thread() -> bool {
    CURRENT
        .try_with(|current| current.borrow().is_some())
        .unwrap_or(false)
}

/// Work-stealing scheduler for fibers.
pub(crate) struct Scheduler {
    id: u64,
    /// Configuration.
    config: SchedulerConfig,
    /// Global injection queue.
    global_queue: Injector<Task>,
    /// Stealers for work-stealing, one per worker.
    stealers: OnceLock<Vec<Stealer<Task>>>,
    /// Every fiber that has started and not yet finished.
    fibers: Mutex<HashMap<FiberId, Arc<FiberShared>>>,
    /// Set once shutdown begins; new root fibers are rejected.
    closing: AtomicBool,
    /// Set when workers must exit.
    shutdown: AtomicBool,
    /// Number of parked workers.
    idle: Mutex<usize>,
    wakeup: Condvar,
    /// Number of active workers.
    active_workers: AtomicUsize,
    timer: Timer,
}

impl Scheduler {
    /// Start the timer and `config.num_workers` worker threads.
    pub(crate) fn start(config: SchedulerConfig) -> Result<(Arc<Self>, Vec<JoinHandle<()>>), RuntimeError> {
        let timer = Timer::start()?;
        let num_workers = config.num_workers;
        let scheduler = Arc::new(Self {
            id: NEXT_SCHEDULER_ID.fetch_add(1, Ordering::Relaxed),
            config,
            global_queue: Injector::new(),
            stealers: OnceLock::new(),
            fibers: Mutex::new(HashMap::new()),
            closing: AtomicBool::new(false),
            shutdown: AtomicBool::new(false),
            idle: Mutex::new(0),
            wakeup: Condvar::new(),
            active_workers: AtomicUsize::new(0),
            timer,
        });

        // Create worker deques and collect stealers
        let deques: Vec<Deque<Task>> = (0..num_workers).map(|_| Deque::new_fifo()).collect();
        let _ = scheduler
            .stealers
            .set(deques.iter().map(Deque::stealer).collect());

        let mut threads = Vec::with_capacity(num_workers);
        for (id, deque) in deques.into_iter().enumerate() {
            let worker = Worker {
                id,
                scheduler: Arc::clone(&scheduler),
                tick: Cell::new(0),
            };
            let dispatch = tracing::dispatcher::get_default(Clone::clone);
            let spawned = thread::Builder::new()
                .name(format!("skein-worker-{id}"))
                .spawn(move || tracing::dispatcher::with_default(&dispatch, || worker.run_loop(deque)));
            match spawned {
                Ok(handle) => threads.push(handle),
                Err(err) => {
                    scheduler.stop();
                    for handle in threads {
                        let _ = handle.join();
                    }
                    scheduler.timer.shutdown();
                    return Err(err.into());
                }
            }
        }

        info!(
            scheduler = scheduler.id,
            workers = num_workers,
            work_stealing = scheduler.config.work_stealing,
            "scheduler started"
        );
        Ok((scheduler, threads))
    }

    /// Get the number of workers.
    pub(crate) fn num_workers(&self) -> usize {
        self.config.num_workers
    }

    pub(crate) fn ops_before_yield(&self) -> usize {
        self.config.ops_before_yield
    }

    pub(crate) fn timer(&self) -> &TimerHandle {
        self.timer.handle()
    }

    /// Start a root fiber running `op`.
    ///
    /// The observer is attached before the fiber is queued, so it sees the
    /// exit however quickly the fiber finishes.
    pub(crate) fn spawn_root(
        self: &Arc<Self>,
        op: Op,
        observer: Option<Observer>,
    ) -> Result<Arc<FiberShared>, RuntimeError> {
        if self.closing.load(Ordering::Acquire) {
            return Err(RuntimeError::ShutDown);
        }
        let shared = FiberShared::new(None);
        if let Some(observer) = observer {
            shared.observe(observer);
        }
        let runtime = FiberRuntime::new(
            Arc::clone(&shared),
            Arc::clone(self),
            op,
            Context::new(),
            true,
        );
        self.register(Arc::clone(&shared));
        self.submit(runtime);
        Ok(shared)
    }

    /// Queue a fiber to run.
    pub(crate) fn submit(&self, task: Task) {
        let mut task = Some(task);
        let _ = CURRENT.try_with(|current| {
            if let Some((owner, local)) = &*current.borrow() {
                if *owner == self.id {
                    if let Some(task) = task.take() {
                        local.push(task);
                    }
                }
            }
        });
        if let Some(task) = task {
            self.global_queue.push(task);
        }
        self.notify_idle();
    }

    /// Queue a fiber that gave up its turn.
    ///
    /// Always goes through the injector so it runs after work that was
    /// already waiting there.
    pub(crate) fn requeue(&self, task: Task) {
        self.global_queue.push(task);
        self.notify_idle();
    }

    fn notify_idle(&self) {
        let idle = self.idle.lock();
        if *idle > 0 {
            self.wakeup.notify_one();
        }
    }

    pub(crate) fn register(&self, fiber: Arc<FiberShared>) {
        self.fibers.lock().insert(fiber.id(), fiber);
    }

    pub(crate) fn deregister(&self, id: FiberId) {
        let removed = self.fibers.lock().remove(&id);
        drop(removed);
    }

    /// Get the number of fibers that have not finished.
    pub(crate) fn active_fiber_count(&self) -> usize {
        self.fibers.lock().len()
    }

    pub(crate) fn live_fibers(&self) -> Vec<Arc<FiberShared>> {
        self.fibers.lock().values().cloned().collect()
    }

    /// Stop accepting root fibers. Returns false if shutdown already began.
    pub(crate) fn begin_shutdown(&self) -> bool {
        !self.closing.swap(true, Ordering::AcqRel)
    }

    /// Check if shutdown has begun.
    pub(crate) fn is_shutting_down(&self) -> bool {
        self.closing.load(Ordering::Acquire)
    }

    /// Signal the workers to exit.
    pub(crate) fn stop(&self) {
        self.shutdown.store(true, Ordering::Release);
        let _idle = self.idle.lock();
        self.wakeup.notify_all();
    }

    /// Tear down what the workers left behind: the timer, queued fibers and
    /// fibers that never finished.
    pub(crate) fn drain(&self, exit: &AnyExit) {
        self.timer.shutdown();
        loop {
            match self.global_queue.steal() {
                Steal::Success(task) => drop(task),
                Steal::Empty => break,
                Steal::Retry => continue,
            }
        }
        let remaining: Vec<Arc<FiberShared>> = self.fibers.lock().drain().map(|(_, f)| f).collect();
        if !remaining.is_empty() {
            debug!(fibers = remaining.len(), "abandoning unfinished fibers");
        }
        for fiber in remaining {
            fiber.abandon(exit.clone());
        }
    }

    fn stealers(&self) -> &[Stealer<Task>] {
        self.stealers.get().map(Vec::as_slice).unwrap_or(&[])
    }
}

/// Worker thread.
struct Worker {
    id: usize,
    scheduler: Arc<Scheduler>,
    tick: Cell<u32>,
}

impl Worker {
    /// Main worker loop.
    fn run_loop(self, local: Deque<Task>) {
        CURRENT.with(|current| *current.borrow_mut() = Some((self.scheduler.id, local)));
        self.scheduler.active_workers.fetch_add(1, Ordering::AcqRel);
        debug!(worker = self.id, "worker started");

        loop {
            if self.scheduler.shutdown.load(Ordering::Acquire) {
                break;
            }

            match self.find_work() {
                Some(task) => task.run(),
                None => self.park(),
            }
        }

        let leftover = CURRENT.with(|current| current.borrow_mut().take());
        drop(leftover);
        self.scheduler.active_workers.fetch_sub(1, Ordering::AcqRel);
        debug!(worker = self.id, "worker stopped");
    }

    /// Find work: local queue, then global queue, then steal.
    ///
    /// Every `GLOBAL_POLL_INTERVAL` ticks the global queue goes first.
    fn find_work(&self) -> Option<Task> {
        let tick = self.tick.get().wrapping_add(1);
        self.tick.set(tick);

        CURRENT.with(|current| {
            let current = current.borrow();
            let (_, local) = current.as_ref()?;

            if tick % GLOBAL_POLL_INTERVAL == 0 {
                if let Some(task) = self.steal_global() {
                    return Some(task);
                }
            }

            if let Some(task) = local.pop() {
                return Some(task);
            }

            loop {
                match self.scheduler.global_queue.steal_batch_and_pop(local) {
                    Steal::Success(task) => return Some(task),
                    Steal::Empty => break,
                    Steal::Retry => continue,
                }
            }

            if !self.scheduler.config.work_stealing {
                return None;
            }

            for (i, stealer) in self.scheduler.stealers().iter().enumerate() {
                if i == self.id {
                    continue;
                }
                loop {
                    match stealer.steal() {
                        Steal::Success(task) => return Some(task),
                        Steal::Empty => break,
                        Steal::Retry => continue,
                    }
                }
            }

            None
        })
    }

    fn steal_global(&self) -> Option<Task> {
        loop {
            match self.scheduler.global_queue.steal() {
                Steal::Success(task) => return Some(task),
                Steal::Empty => return None,
                Steal::Retry => continue,
            }
        }
    }

    /// Sleep until new work is submitted or the idle timeout passes.
    fn park(&self) {
        let mut idle = self.scheduler.idle.lock();
        if self.scheduler.shutdown.load(Ordering::Acquire) || !self.scheduler.global_queue.is_empty() {
            return;
        }
        *idle += 1;
        self.scheduler
            .wakeup
            .wait_for(&mut idle, self.scheduler.config.idle_timeout);
        *idle -= 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RuntimeConfig;
    use crate::effect::Effect;
    use crate::exit::Exit;
    use crate::runtime::Runtime;
    use std::time::Duration;

    fn runtime(workers: usize, stealing: bool) -> Runtime {
        Runtime::new(
            RuntimeConfig::builder()
                .num_workers(workers)
                .work_stealing(stealing)
                .build()
                .unwrap(),
        )
        .unwrap()
    }

    #[test]
    fn test_scheduler_creation() {
        let rt = runtime(4, true);
        assert_eq!(rt.scheduler().num_workers(), 4);
        assert_eq!(rt.active_fiber_count(), 0);
    }

    #[test]
    fn test_not_a_worker_thread() {
        assert!(!on_worker_thread());
        let rt = runtime(1, false);
        let seen = rt.run(Effect::<bool, String>::sync(on_worker_thread));
        assert_eq!(seen, Exit::succeed(true));
    }

    #[test]
    fn test_multiple_fibers() {
        let rt = runtime(2, true);
        let handles: Vec<_> = (0..20)
            .map(|n| {
                rt.spawn(Effect::<(), String>::sleep(Duration::from_millis(2)).as_value(n))
                    .unwrap()
            })
            .collect();
        let total: i32 = handles
            .iter()
            .map(|h| h.block_on().into_result().unwrap())
            .sum();
        assert_eq!(total, (0..20).sum());
    }

    #[test]
    fn test_work_stealing_spreads_forks() {
        let rt = runtime(4, true);
        let forked = (0..16).fold(Effect::<Vec<_>, String>::succeed(Vec::new()), |acc, n| {
            acc.zip(Effect::<i32, String>::succeed(n).fork()).map(|(mut v, h)| {
                v.push(h);
                v
            })
        });
        let effect = forked.flat_map(|handles| {
            handles.into_iter().fold(Effect::succeed(Vec::new()), |acc, h| {
                acc.zip(h.join()).map(|(mut v, n)| {
                    v.push(n);
                    v
                })
            })
        });
        let mut values = rt.run(effect).into_result().unwrap();
        values.sort_unstable();
        assert_eq!(values, (0..16).collect::<Vec<_>>());
    }

    #[test]
    fn test_yielding_loop_lets_timer_resume_on_one_worker() {
        let rt = runtime(1, false);
        let spinning = Effect::<(), String>::forever(Effect::yield_now);
        assert_eq!(
            rt.run(spinning.timeout(Duration::from_millis(10))),
            Exit::succeed(None)
        );
    }

    #[test]
    fn test_busy_loop_lets_timer_resume_on_one_worker() {
        let rt = runtime(1, false);
        let busy = Effect::<(), String>::forever(|| Effect::<(), String>::unit().uninterruptible());
        assert_eq!(rt.run(busy.timeout(Duration::from_millis(10))), Exit::succeed(None));
    }

    #[test]
    fn test_timeout_with_every_worker_busy() {
        let rt = runtime(2, true);
        let spinners: Vec<_> = (0..4)
            .map(|_| rt.spawn(Effect::<(), String>::forever(Effect::yield_now)).unwrap())
            .collect();
        let slow = Effect::<(), String>::sleep(Duration::from_secs(5));
        assert_eq!(rt.run(slow.timeout(Duration::from_millis(10))), Exit::succeed(None));
        for spinner in &spinners {
            spinner.interrupt_now();
        }
        assert!(spinners.iter().all(|s| s.block_on().is_interrupted()));
    }

    #[test]
    fn test_spawn_after_shutdown_rejected() {
        let rt = runtime(1, false);
        rt.shutdown();
        assert!(rt.scheduler().is_shutting_down());
        assert!(matches!(
            rt.spawn(Effect::<(), String>::unit()),
            Err(RuntimeError::ShutDown)
        ));
    }
}
