//! # Fiber Implementation
//!
//! Lightweight, cooperatively-scheduled units of execution that interpret
//! effects.
//!
//! ## Design
//!
//! - A fiber is split in two. [`FiberRuntime`] is the continuation: the
//!   frame stack, the next op, the context and interruptibility. It is owned
//!   by whoever runs the fiber: a worker thread, a run queue, or the fiber's
//!   own suspension slot. [`FiberShared`] is the half everyone else sees:
//!   status, exit, observers, pending interruption and the child table.
//! - The interpreter is a trampoline. Nested effects push frames instead of
//!   recursing, so long `flat_map` chains and `forever` loops run in
//!   constant native stack.
//! - Suspension parks the `FiberRuntime` inside the shared half. A resume
//!   callback takes it back out and pushes it onto a run queue. Each
//!   suspension has an epoch; callbacks from an older suspension are ignored.
//! - Interruption is cooperative: a flag plus the list of interruptors. It
//!   is applied at step boundaries while interruptible, and it wakes a fiber
//!   parked at an interruptible suspension.
//! - On completion a fiber interrupts and awaits its children before it
//!   publishes its exit.
//!
//! ## Technical References
//!
//! - [ZIO 2 fiber runtime](https://zio.dev/reference/fiber/)
//! - [Tokio Scheduler Design](https://tokio.rs/blog/2019-10-scheduler)

use std::collections::HashMap;
use std::fmt;
use std::marker::PhantomData;
use std::mem;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::{SystemTime, UNIX_EPOCH};

use parking_lot::Mutex;
use tracing::{trace, warn};

use crate::cause::{Cause, Defect, Failure};
use crate::context::Context;
use crate::effect::{downcast, Canceler, Cont, Effect, ErasedCause, Op, Recover, Value};
use crate::exit::{AnyExit, Exit};
use crate::panic::catch_panic;
use crate::runtime::RuntimeError;
use crate::scheduler::{self, Scheduler};
use crate::timer::TimerHandle;

// ============================================================================
// Identity and status
// ============================================================================

/// Unique identifier for a fiber.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FiberId {
    id: u64,
    started_at: u64,
}

impl FiberId {
    /// The id used for interruptions that come from outside any fiber.
    pub const NONE: FiberId = FiberId {
        id: 0,
        started_at: 0,
    };

    #[cfg(test)]
    pub(crate) fn from_raw(id: u64) -> Self {
        Self { id, started_at: 0 }
    }

    /// Get the raw ID value.
    pub fn as_u64(&self) -> u64 {
        self.id
    }

    /// Milliseconds since the Unix epoch at which the fiber was created.
    pub fn started_at_millis(&self) -> u64 {
        self.started_at
    }

    /// True for [`FiberId::NONE`].
    pub fn is_none(&self) -> bool {
        self.id == 0
    }
}

impl fmt::Display for FiberId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_none() {
            f.write_str("Fiber(none)")
        } else {
            write!(f, "Fiber({})", self.id)
        }
    }
}

/// Global fiber ID counter.
static NEXT_FIBER_ID: AtomicU64 = AtomicU64::new(1);

/// Generate a new unique fiber ID.
fn next_fiber_id() -> FiberId {
    let started_at = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0);
    FiberId {
        id: NEXT_FIBER_ID.fetch_add(1, Ordering::Relaxed),
        started_at,
    }
}

/// Fiber execution status.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FiberStatus {
    /// Queued or executing on a worker thread.
    Running,
    /// Waiting at an asynchronous boundary.
    Suspended {
        /// Whether an interruption would wake the fiber.
        interruptible: bool,
    },
    /// Finished; the exit is available.
    Done,
}

/// Callback invoked once with a fiber's exit.
pub(crate) type Observer = Box<dyn FnOnce(&AnyExit) + Send>;

// ============================================================================
// Shared half
// ============================================================================

enum Lifecycle {
    Running,
    Suspended {
        runtime: Box<FiberRuntime>,
        canceler: Option<Canceler>,
    },
    Done(AnyExit),
}

struct Slot {
    lifecycle: Lifecycle,
    /// Epoch of the suspension a resume callback may complete.
    awaiting: Option<u64>,
    /// A resume that arrived before the fiber finished parking.
    early_resume: Option<Op>,
    interruptors: Vec<FiberId>,
    observers: Vec<(u64, Observer)>,
    next_observer: u64,
    children: HashMap<FiberId, Arc<FiberShared>>,
}

/// The publicly observable half of a fiber.
pub(crate) struct FiberShared {
    id: FiberId,
    parent: Option<Weak<FiberShared>>,
    interrupt_requested: AtomicBool,
    slot: Mutex<Slot>,
}

impl FiberShared {
    pub(crate) fn new(parent: Option<&Arc<FiberShared>>) -> Arc<Self> {
        Arc::new(Self {
            id: next_fiber_id(),
            parent: parent.map(Arc::downgrade),
            interrupt_requested: AtomicBool::new(false),
            slot: Mutex::new(Slot {
                lifecycle: Lifecycle::Running,
                awaiting: None,
                early_resume: None,
                interruptors: Vec::new(),
                observers: Vec::new(),
                next_observer: 0,
                children: HashMap::new(),
            }),
        })
    }

    pub(crate) fn id(&self) -> FiberId {
        self.id
    }

    pub(crate) fn status(&self) -> FiberStatus {
        match &self.slot.lock().lifecycle {
            Lifecycle::Running => FiberStatus::Running,
            Lifecycle::Suspended { runtime, .. } => FiberStatus::Suspended {
                interruptible: runtime.interruptible,
            },
            Lifecycle::Done(_) => FiberStatus::Done,
        }
    }

    pub(crate) fn exit(&self) -> Option<AnyExit> {
        match &self.slot.lock().lifecycle {
            Lifecycle::Done(exit) => Some(exit.clone()),
            _ => None,
        }
    }

    fn is_interrupt_requested(&self) -> bool {
        self.interrupt_requested.load(Ordering::Acquire)
    }

    fn interrupt_cause(&self) -> ErasedCause {
        let slot = self.slot.lock();
        let cause = slot
            .interruptors
            .iter()
            .fold(Cause::Empty, |acc, by| acc.both(Cause::interrupt(*by)));
        if cause.is_empty() {
            Cause::interrupt(FiberId::NONE)
        } else {
            cause
        }
    }

    /// Register an observer. A finished fiber calls it at once and returns `None`.
    pub(crate) fn observe(&self, observer: Observer) -> Option<u64> {
        let mut slot = self.slot.lock();
        if let Lifecycle::Done(exit) = &slot.lifecycle {
            let exit = exit.clone();
            drop(slot);
            observer(&exit);
            return None;
        }
        let key = slot.next_observer;
        slot.next_observer += 1;
        slot.observers.push((key, observer));
        Some(key)
    }

    pub(crate) fn unobserve(&self, key: u64) {
        let removed = {
            let mut slot = self.slot.lock();
            let index = slot.observers.iter().position(|(k, _)| *k == key);
            index.map(|i| slot.observers.swap_remove(i))
        };
        drop(removed);
    }

    /// Request interruption on behalf of `by`.
    pub(crate) fn interrupt_as(&self, by: FiberId) {
        let woken = {
            let mut slot = self.slot.lock();
            if matches!(slot.lifecycle, Lifecycle::Done(_)) {
                return;
            }
            if !slot.interruptors.contains(&by) {
                slot.interruptors.push(by);
            }
            self.interrupt_requested.store(true, Ordering::Release);
            let parked_interruptible = matches!(
                &slot.lifecycle,
                Lifecycle::Suspended { runtime, .. } if runtime.interruptible
            );
            if parked_interruptible {
                slot.awaiting = None;
                match mem::replace(&mut slot.lifecycle, Lifecycle::Running) {
                    Lifecycle::Suspended { runtime, canceler } => Some((runtime, canceler)),
                    other => {
                        slot.lifecycle = other;
                        None
                    }
                }
            } else {
                None
            }
        };
        trace!(fiber = %self.id, by = %by, "interrupt requested");
        if let Some((mut runtime, canceler)) = woken {
            run_canceler(self.id, canceler);
            runtime.next = Some(Op::unit());
            let scheduler = Arc::clone(&runtime.scheduler);
            scheduler.submit(runtime);
        }
    }

    fn begin_async(&self, epoch: u64) {
        self.slot.lock().awaiting = Some(epoch);
    }

    fn abandon_async(&self) {
        let stale = {
            let mut slot = self.slot.lock();
            slot.awaiting = None;
            slot.early_resume.take()
        };
        drop(stale);
    }

    /// Park the runtime, unless a resume or an interruption already arrived.
    fn park(
        &self,
        mut runtime: Box<FiberRuntime>,
        canceler: Option<Canceler>,
    ) -> Option<Box<FiberRuntime>> {
        let mut slot = self.slot.lock();
        if let Some(op) = slot.early_resume.take() {
            drop(slot);
            runtime.next = Some(op);
            return Some(runtime);
        }
        if runtime.interruptible && self.is_interrupt_requested() {
            slot.awaiting = None;
            drop(slot);
            run_canceler(self.id, canceler);
            runtime.next = Some(Op::unit());
            return Some(runtime);
        }
        slot.lifecycle = Lifecycle::Suspended { runtime, canceler };
        None
    }

    fn complete(&self, exit: AnyExit) -> Vec<Observer> {
        let mut slot = self.slot.lock();
        slot.lifecycle = Lifecycle::Done(exit);
        slot.awaiting = None;
        mem::take(&mut slot.observers)
            .into_iter()
            .map(|(_, observer)| observer)
            .collect()
    }

    /// Force a fiber that will never run again into `Done`.
    pub(crate) fn abandon(&self, exit: AnyExit) {
        let (observers, previous) = {
            let mut slot = self.slot.lock();
            if matches!(slot.lifecycle, Lifecycle::Done(_)) {
                return;
            }
            let previous = mem::replace(&mut slot.lifecycle, Lifecycle::Done(exit.clone()));
            slot.awaiting = None;
            slot.children.clear();
            let observers: Vec<Observer> = mem::take(&mut slot.observers)
                .into_iter()
                .map(|(_, observer)| observer)
                .collect();
            (observers, previous)
        };
        drop(previous);
        notify(self.id, observers, &exit);
    }

    fn add_child(&self, child: Arc<FiberShared>) {
        self.slot.lock().children.insert(child.id, child);
    }

    fn remove_child(&self, id: FiberId) {
        let removed = self.slot.lock().children.remove(&id);
        drop(removed);
    }

    fn take_children(&self) -> Vec<Arc<FiberShared>> {
        self.slot
            .lock()
            .children
            .drain()
            .map(|(_, child)| child)
            .collect()
    }
}

fn run_canceler(fiber: FiberId, canceler: Option<Canceler>) {
    if let Some(cancel) = canceler {
        if let Err(panic) = catch_panic(cancel) {
            warn!(fiber = %fiber, panic = panic.message(), "suspension canceler panicked");
        }
    }
}

fn notify(fiber: FiberId, observers: Vec<Observer>, exit: &AnyExit) {
    for observer in observers {
        if let Err(panic) = catch_panic(|| observer(exit)) {
            warn!(fiber = %fiber, panic = panic.message(), "fiber observer panicked");
        }
    }
}

/// Wakes a fiber suspended at one particular asynchronous boundary.
pub(crate) struct Resumer {
    fiber: Arc<FiberShared>,
    epoch: u64,
}

impl Resumer {
    /// Continue the fiber with `op`. Stale or repeated calls are ignored.
    pub(crate) fn resume(self, op: Op) {
        let runtime = {
            let mut slot = self.fiber.slot.lock();
            if slot.awaiting != Some(self.epoch) {
                return;
            }
            slot.awaiting = None;
            match mem::replace(&mut slot.lifecycle, Lifecycle::Running) {
                Lifecycle::Suspended { mut runtime, .. } => {
                    runtime.next = Some(op);
                    runtime
                }
                other => {
                    slot.lifecycle = other;
                    slot.early_resume = Some(op);
                    return;
                }
            }
        };
        let scheduler = Arc::clone(&runtime.scheduler);
        scheduler.submit(runtime);
    }
}

/// An op that waits for `fiber` and produces its [`AnyExit`].
pub(crate) fn await_fiber(fiber: Arc<FiberShared>) -> Op {
    Op::Async(Box::new(move |resumer| {
        let key = fiber.observe(Box::new(move |exit: &AnyExit| {
            resumer.resume(Op::value(exit.clone()))
        }))?;
        Some(Box::new(move || fiber.unobserve(key)) as Canceler)
    }))
}

fn shutdown_children(by: FiberId, children: Vec<Arc<FiberShared>>) -> Op {
    for child in &children {
        child.interrupt_as(by);
    }
    children
        .into_iter()
        .fold(Op::unit(), |acc, child| acc.then(move |_| await_fiber(child)))
}

fn guard_op(f: impl FnOnce() -> Op) -> Op {
    match catch_panic(f) {
        Ok(op) => op,
        Err(panic) => Op::Fail(Cause::die(Defect::from_panic(panic))),
    }
}

// ============================================================================
// Interpreter
// ============================================================================

enum Frame {
    OnSuccess(Cont),
    Fold(Recover, Cont),
    Region(bool),
    Env(Context),
}

/// The continuation of a fiber: everything needed to take its next step.
pub(crate) struct FiberRuntime {
    shared: Arc<FiberShared>,
    scheduler: Arc<Scheduler>,
    stack: Vec<Frame>,
    next: Option<Op>,
    env: Context,
    interruptible: bool,
    /// The failure being unwound already carries the interruption.
    interrupting: bool,
    epoch: u64,
    /// Exit held back while children are shut down.
    pending_exit: Option<AnyExit>,
}

impl FiberRuntime {
    pub(crate) fn new(
        shared: Arc<FiberShared>,
        scheduler: Arc<Scheduler>,
        op: Op,
        env: Context,
        interruptible: bool,
    ) -> Box<Self> {
        Box::new(Self {
            shared,
            scheduler,
            stack: Vec::new(),
            next: Some(op),
            env,
            interruptible,
            interrupting: false,
            epoch: 0,
            pending_exit: None,
        })
    }

    /// Run until the fiber suspends, yields or finishes.
    pub(crate) fn run(mut self: Box<Self>) {
        let budget = self.scheduler.ops_before_yield();
        let mut cur = match self.next.take() {
            Some(op) => op,
            None => return,
        };
        let mut steps = 0usize;

        loop {
            if self.interruptible && self.shared.is_interrupt_requested() {
                cur = self.apply_interrupt(cur);
            }

            steps += 1;
            if steps > budget {
                self.next = Some(cur);
                let scheduler = Arc::clone(&self.scheduler);
                scheduler.requeue(self);
                return;
            }

            cur = match cur {
                Op::Succeed(value) => match self.unwind_success(value) {
                    Some(op) => op,
                    None => match self.finish(Exit::Success(())) {
                        Some(op) => op,
                        None => return,
                    },
                },
                Op::Fail(cause) => match self.unwind_failure(cause) {
                    Ok(op) => op,
                    Err(cause) => match self.finish(Exit::Failure(cause)) {
                        Some(op) => op,
                        None => return,
                    },
                },
                Op::Sync(thunk) => match catch_panic(thunk) {
                    Ok(Ok(value)) => Op::Succeed(value),
                    Ok(Err(cause)) => Op::Fail(cause),
                    Err(panic) => Op::Fail(Cause::die(Defect::from_panic(panic))),
                },
                Op::FlatMap(inner, k) => {
                    self.stack.push(Frame::OnSuccess(k));
                    *inner
                }
                Op::Fold(inner, recover, k) => {
                    self.stack.push(Frame::Fold(recover, k));
                    *inner
                }
                Op::Region(interruptible, inner) => {
                    self.stack.push(Frame::Region(self.interruptible));
                    self.interruptible = interruptible;
                    *inner
                }
                Op::Provide(env, inner) => {
                    let previous = mem::replace(&mut self.env, env);
                    self.stack.push(Frame::Env(previous));
                    *inner
                }
                Op::WithFiber(f) => {
                    let mut ctx = FiberCtx {
                        runtime: &mut *self,
                    };
                    guard_op(|| f(&mut ctx))
                }
                Op::Fork { child, daemon } => Op::value(self.fork(*child, daemon)),
                Op::Yield => {
                    self.next = Some(Op::unit());
                    let scheduler = Arc::clone(&self.scheduler);
                    scheduler.requeue(self);
                    return;
                }
                Op::Async(register) => {
                    self.epoch += 1;
                    let resumer = Resumer {
                        fiber: Arc::clone(&self.shared),
                        epoch: self.epoch,
                    };
                    self.shared.begin_async(self.epoch);
                    match catch_panic(|| register(resumer)) {
                        Err(panic) => {
                            self.shared.abandon_async();
                            Op::Fail(Cause::die(Defect::from_panic(panic)))
                        }
                        Ok(canceler) => {
                            let shared = Arc::clone(&self.shared);
                            match shared.park(self, canceler) {
                                Some(runtime) => {
                                    self = runtime;
                                    self.next.take().unwrap_or_else(Op::unit)
                                }
                                None => return,
                            }
                        }
                    }
                }
            };
        }
    }

    fn apply_interrupt(&mut self, cur: Op) -> Op {
        match cur {
            Op::Fail(cause) if self.interrupting || cause.is_interrupted() => {
                self.interrupting = true;
                Op::Fail(cause)
            }
            Op::Fail(cause) => {
                self.interrupting = true;
                Op::Fail(cause.then(self.shared.interrupt_cause()))
            }
            _ => {
                self.interrupting = true;
                trace!(fiber = %self.shared.id, "interruption applied");
                Op::Fail(self.shared.interrupt_cause())
            }
        }
    }

    fn unwind_success(&mut self, value: Value) -> Option<Op> {
        while let Some(frame) = self.stack.pop() {
            match frame {
                Frame::OnSuccess(k) | Frame::Fold(_, k) => return Some(guard_op(move || k(value))),
                Frame::Region(previous) => {
                    self.interruptible = previous;
                    if previous && self.shared.is_interrupt_requested() {
                        self.interrupting = true;
                        return Some(Op::Fail(self.shared.interrupt_cause()));
                    }
                }
                Frame::Env(previous) => self.env = previous,
            }
        }
        None
    }

    fn unwind_failure(&mut self, mut cause: ErasedCause) -> Result<Op, ErasedCause> {
        while let Some(frame) = self.stack.pop() {
            match frame {
                Frame::OnSuccess(_) => {}
                Frame::Fold(recover, _) => {
                    if self.interruptible && self.shared.is_interrupt_requested() {
                        continue;
                    }
                    self.interrupting = false;
                    return Ok(guard_op(move || recover(cause)));
                }
                Frame::Region(previous) => {
                    self.interruptible = previous;
                    if previous && self.shared.is_interrupt_requested() && !cause.is_interrupted() {
                        self.interrupting = true;
                        cause = cause.then(self.shared.interrupt_cause());
                    }
                }
                Frame::Env(previous) => self.env = previous,
            }
        }
        Err(cause)
    }

    /// Publish the exit, or return the op that shuts down children first.
    fn finish(&mut self, exit: AnyExit) -> Option<Op> {
        let exit = self.pending_exit.take().unwrap_or(exit);
        let children = self.shared.take_children();
        if !children.is_empty() {
            self.pending_exit = Some(exit);
            self.interruptible = false;
            return Some(shutdown_children(self.shared.id, children));
        }

        let id = self.shared.id;
        let observers = self.shared.complete(exit.clone());
        if let Some(parent) = self.shared.parent.as_ref().and_then(Weak::upgrade) {
            parent.remove_child(id);
        }
        self.scheduler.deregister(id);

        if let Exit::Failure(cause) = &exit {
            if observers.is_empty() && !cause.is_interrupted_only() {
                warn!(fiber = %id, cause = %cause, "fiber failed with no observer");
            }
        }
        trace!(fiber = %id, success = exit.is_success(), "fiber completed");
        notify(id, observers, &exit);
        None
    }

    fn fork(&mut self, child: Op, daemon: bool) -> Arc<FiberShared> {
        let parent = if daemon { None } else { Some(&self.shared) };
        let shared = FiberShared::new(parent);
        if !daemon {
            self.shared.add_child(Arc::clone(&shared));
        }
        trace!(parent = %self.shared.id, child = %shared.id, daemon, "fiber forked");
        let runtime = FiberRuntime::new(
            Arc::clone(&shared),
            Arc::clone(&self.scheduler),
            child,
            self.env.clone(),
            self.interruptible,
        );
        self.scheduler.register(Arc::clone(&shared));
        self.scheduler.submit(runtime);
        shared
    }
}

/// What a `WithFiber` step may see of the running fiber.
pub(crate) struct FiberCtx<'a> {
    runtime: &'a mut FiberRuntime,
}

impl FiberCtx<'_> {
    pub(crate) fn id(&self) -> FiberId {
        self.runtime.shared.id
    }

    pub(crate) fn env(&self) -> &Context {
        &self.runtime.env
    }

    pub(crate) fn interruptible(&self) -> bool {
        self.runtime.interruptible
    }

    pub(crate) fn timer(&self) -> TimerHandle {
        self.runtime.scheduler.timer().clone()
    }
}

// ============================================================================
// Typed handles
// ============================================================================

/// Wrap `effect` so its value lands in `slot` before the fiber finishes.
pub(crate) fn store_result<A, E>(effect: Effect<A, E>, slot: Arc<Mutex<Option<A>>>) -> Op
where
    A: Send + 'static,
    E: Failure,
{
    effect
        .map(move |a| {
            *slot.lock() = Some(a);
        })
        .into_op()
}

/// A handle to a forked fiber.
pub struct FiberHandle<A, E> {
    fiber: Arc<FiberShared>,
    result: Arc<Mutex<Option<A>>>,
    _marker: PhantomData<fn() -> E>,
}

impl<A, E> Clone for FiberHandle<A, E> {
    fn clone(&self) -> Self {
        Self {
            fiber: Arc::clone(&self.fiber),
            result: Arc::clone(&self.result),
            _marker: PhantomData,
        }
    }
}

impl<A, E> fmt::Debug for FiberHandle<A, E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FiberHandle")
            .field("id", &self.fiber.id)
            .field("status", &self.fiber.status())
            .finish()
    }
}

impl<A: Send + 'static, E: Failure> FiberHandle<A, E> {
    pub(crate) fn new(fiber: Arc<FiberShared>, result: Arc<Mutex<Option<A>>>) -> Self {
        Self {
            fiber,
            result,
            _marker: PhantomData,
        }
    }

    /// The fiber's id.
    pub fn id(&self) -> FiberId {
        self.fiber.id
    }

    /// The fiber's current status.
    pub fn status(&self) -> FiberStatus {
        self.fiber.status()
    }

    /// True once the fiber has finished.
    pub fn is_done(&self) -> bool {
        self.status() == FiberStatus::Done
    }

    /// The exit, if the fiber has finished.
    pub fn poll(&self) -> Option<Exit<E, A>>
    where
        A: Clone,
    {
        self.fiber.exit().map(|exit| self.typed(&exit))
    }

    /// Wait for the fiber and return its exit.
    pub fn await_exit<E2>(&self) -> Effect<Exit<E, A>, E2>
    where
        A: Clone,
    {
        let handle = self.clone();
        Effect::from_op(await_fiber(Arc::clone(&self.fiber)).then(move |value| {
            match downcast::<AnyExit>(value) {
                Ok(exit) => Op::value(handle.typed(&exit)),
                Err(cause) => Op::Fail(cause),
            }
        }))
    }

    /// Wait for the fiber and continue with its outcome, re-raising its cause.
    pub fn join(&self) -> Effect<A, E>
    where
        A: Clone,
    {
        self.await_exit::<E>().flat_map(Effect::from_exit)
    }

    /// Interrupt the fiber and wait until it has finished, finalizers
    /// included. A finished fiber just returns its exit.
    pub fn interrupt<E2: Failure>(&self) -> Effect<Exit<E, A>, E2>
    where
        A: Clone,
    {
        self.interrupt_fork::<E2>().zip_right(self.await_exit())
    }

    /// Signal interruption without waiting.
    pub fn interrupt_fork<E2>(&self) -> Effect<(), E2> {
        let fiber = Arc::clone(&self.fiber);
        Effect::from_op(Op::WithFiber(Box::new(move |ctx| {
            fiber.interrupt_as(ctx.id());
            Op::unit()
        })))
    }

    /// Signal interruption from outside the runtime.
    pub fn interrupt_now(&self) {
        self.fiber.interrupt_as(FiberId::NONE);
    }

    /// Block the calling thread until the fiber finishes.
    ///
    /// Must not be called from a runtime worker thread.
    pub fn block_on(&self) -> Exit<E, A>
    where
        A: Clone,
    {
        if scheduler::on_worker_thread() {
            return Exit::die(RuntimeError::CalledFromWorker.to_string());
        }
        let (tx, rx) = crossbeam_channel::bounded(1);
        self.fiber.observe(Box::new(move |exit: &AnyExit| {
            let _ = tx.send(exit.clone());
        }));
        match rx.recv() {
            Ok(exit) => self.typed(&exit),
            Err(_) => Exit::die(RuntimeError::ShutDown.to_string()),
        }
    }

    /// Convert the fiber's exit, moving the value out of the handle.
    pub(crate) fn take_exit(&self, exit: &AnyExit) -> Exit<E, A> {
        match exit {
            Exit::Success(()) => match self.result.lock().take() {
                Some(a) => Exit::Success(a),
                None => Exit::die("fiber value was already taken"),
            },
            Exit::Failure(cause) => Exit::Failure(cause.clone().unerase()),
        }
    }

    fn typed(&self, exit: &AnyExit) -> Exit<E, A>
    where
        A: Clone,
    {
        match exit {
            Exit::Success(()) => match self.result.lock().clone() {
                Some(a) => Exit::Success(a),
                None => Exit::die("fiber value was already taken"),
            },
            Exit::Failure(cause) => Exit::Failure(cause.clone().unerase()),
        }
    }
}

impl<A: Send + 'static, E: Failure> Effect<A, E> {
    /// Start this effect in a child fiber supervised by the current one.
    ///
    /// The child inherits the context and interruptibility. When the parent
    /// finishes, children that are still running are interrupted and awaited.
    pub fn fork<E2>(self) -> Effect<FiberHandle<A, E>, E2> {
        self.fork_with(false)
    }

    /// Start this effect in a fiber that outlives the current one.
    pub fn fork_daemon<E2>(self) -> Effect<FiberHandle<A, E>, E2> {
        self.fork_with(true)
    }

    fn fork_with<E2>(self, daemon: bool) -> Effect<FiberHandle<A, E>, E2> {
        let result = Arc::new(Mutex::new(None));
        let child = store_result(self, Arc::clone(&result));
        let fork = Op::Fork {
            child: Box::new(child),
            daemon,
        };
        Effect::from_op(fork.then(move |value| {
            match downcast::<Arc<FiberShared>>(value) {
                Ok(fiber) => Op::value(FiberHandle::<A, E>::new(fiber, result)),
                Err(cause) => Op::Fail(cause),
            }
        }))
    }
}
