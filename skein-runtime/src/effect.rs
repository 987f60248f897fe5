//! # Effect
//!
//! [`Effect<A, E>`] is a description of a computation that may succeed with
//! an `A`, fail with a [`Cause<E>`], suspend, fork fibers and read services
//! from its [`Context`]. Nothing happens until a fiber interprets it.
//!
//! ## Design
//!
//! - An effect is a tree of [`Op`] steps. The typed surface only adds
//!   phantom types; values travel through the interpreter boxed as
//!   `dyn Any` and failures as [`AnyError`], and are downcast back at each
//!   typed continuation.
//! - Effects are single-use: closures in the tree are `FnOnce`, so captured
//!   values can be moved into the continuation. Repetition (`forever`,
//!   `repeat_n`) takes a factory producing a fresh effect per iteration.
//! - The interpreter catches panics in every closure it calls and turns
//!   them into `Die` leaves.
//!
//! ## Technical References
//!
//! - [ZIO 2 runloop](https://zio.dev/reference/core/zio/)
//! - [Effect-TS fiber runtime](https://effect.website/docs/runtime/)

use std::any::{type_name, Any};
use std::convert::Infallible;
use std::marker::PhantomData;
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::cause::{AnyError, Cause, Defect, Failure};
use crate::context::Context;
use crate::exit::Exit;
use crate::fiber::{FiberCtx, FiberId, Resumer};
use crate::panic::catch_panic;

// ============================================================================
// Interpreter steps
// ============================================================================

pub(crate) type Value = Box<dyn Any + Send>;
pub(crate) type ErasedCause = Cause<AnyError>;
pub(crate) type Cont = Box<dyn FnOnce(Value) -> Op + Send>;
pub(crate) type Recover = Box<dyn FnOnce(ErasedCause) -> Op + Send>;
pub(crate) type Thunk = Box<dyn FnOnce() -> Result<Value, ErasedCause> + Send>;
pub(crate) type Canceler = Box<dyn FnOnce() + Send>;
pub(crate) type Register = Box<dyn FnOnce(Resumer) -> Option<Canceler> + Send>;
pub(crate) type FiberFn = Box<dyn FnOnce(&mut FiberCtx<'_>) -> Op + Send>;

/// One step of an effect, as seen by the interpreter.
pub(crate) enum Op {
    /// Produce a value.
    Succeed(Value),
    /// Fail with a cause.
    Fail(ErasedCause),
    /// Run a synchronous thunk.
    Sync(Thunk),
    /// Run the inner op, feed its value to the continuation.
    FlatMap(Box<Op>, Cont),
    /// Run the inner op, route the outcome to the matching branch.
    Fold(Box<Op>, Recover, Cont),
    /// Suspend until the registered callback resumes the fiber.
    Async(Register),
    /// Start a child fiber; produces its `Arc<FiberShared>`.
    Fork { child: Box<Op>, daemon: bool },
    /// Run the inner op with the given interruptibility.
    Region(bool, Box<Op>),
    /// Read or update the running fiber.
    WithFiber(FiberFn),
    /// Run the inner op with a different context.
    Provide(Context, Box<Op>),
    /// Give up the worker and re-queue.
    Yield,
}

impl Op {
    pub(crate) fn unit() -> Op {
        Op::Succeed(Box::new(()))
    }

    pub(crate) fn value<A: Send + 'static>(value: A) -> Op {
        Op::Succeed(Box::new(value))
    }

    pub(crate) fn die(defect: impl Into<Defect>) -> Op {
        Op::Fail(Cause::die(defect))
    }

    pub(crate) fn then(self, next: impl FnOnce(Value) -> Op + Send + 'static) -> Op {
        Op::FlatMap(Box::new(self), Box::new(next))
    }
}

/// Recover a typed value from the interpreter.
pub(crate) fn downcast<A: 'static>(value: Value) -> Result<A, ErasedCause> {
    value.downcast::<A>().map(|boxed| *boxed).map_err(|_| {
        Cause::die(format!(
            "effect produced a value that is not {}",
            type_name::<A>()
        ))
    })
}

/// Build an effect from a closure that may panic.
pub(crate) fn guarded<A, E>(build: impl FnOnce() -> Effect<A, E>) -> Effect<A, E> {
    match catch_panic(build) {
        Ok(effect) => effect,
        Err(panic) => Effect::from_op(Op::Fail(Cause::die(Defect::from_panic(panic)))),
    }
}

// ============================================================================
// Effect
// ============================================================================

/// A lazy, composable computation producing `A` or failing with `Cause<E>`.
#[must_use = "effects are descriptions and do nothing until run"]
pub struct Effect<A, E = Infallible> {
    op: Op,
    _marker: PhantomData<fn() -> (A, E)>,
}

impl<A, E> Effect<A, E> {
    pub(crate) fn from_op(op: Op) -> Self {
        Self {
            op,
            _marker: PhantomData,
        }
    }

    pub(crate) fn into_op(self) -> Op {
        self.op
    }

    pub(crate) fn with_fiber(f: impl FnOnce(&mut FiberCtx<'_>) -> Effect<A, E> + Send + 'static) -> Self {
        Effect::from_op(Op::WithFiber(Box::new(move |ctx| f(ctx).op)))
    }
}

/// Reinstates the interruptibility that was in effect when
/// [`Effect::uninterruptible_mask`] was entered.
#[derive(Debug, Clone, Copy)]
pub struct Restore {
    interruptible: bool,
}

impl Restore {
    /// Run `effect` with the caller's original interruptibility.
    pub fn apply<A, E>(self, effect: Effect<A, E>) -> Effect<A, E> {
        Effect::from_op(Op::Region(self.interruptible, Box::new(effect.op)))
    }
}

/// The resume side of an asynchronous effect.
///
/// Calling any of its methods wakes the suspended fiber with the given
/// outcome. Dropping it without calling leaves the fiber suspended until it
/// is interrupted.
pub struct Resume<A, E> {
    resumer: Resumer,
    _marker: PhantomData<fn() -> (A, E)>,
}

impl<A: Send + 'static, E: Failure> Resume<A, E> {
    /// Continue the fiber with `effect`.
    pub fn resume(self, effect: Effect<A, E>) {
        self.resumer.resume(effect.op);
    }

    /// Continue the fiber with a value.
    pub fn succeed(self, value: A) {
        self.resumer.resume(Op::value(value));
    }

    /// Continue the fiber with a typed failure.
    pub fn fail(self, error: E) {
        self.resumer.resume(Op::Fail(Cause::fail(AnyError::new(error))));
    }

    /// Continue the fiber with an exit.
    pub fn complete(self, exit: Exit<E, A>) {
        self.resume(Effect::from_exit(exit));
    }
}

impl<A: Send + 'static, E: Failure> Effect<A, E> {
    /// An effect that succeeds with `value`.
    pub fn succeed(value: A) -> Self {
        Effect::from_op(Op::value(value))
    }

    /// An effect that fails with `error`.
    pub fn fail(error: E) -> Self {
        Effect::from_op(Op::Fail(Cause::fail(AnyError::new(error))))
    }

    /// An effect that fails with `cause`.
    pub fn fail_cause(cause: Cause<E>) -> Self {
        Effect::from_op(Op::Fail(cause.erase()))
    }

    /// An effect that dies with a defect.
    pub fn die(defect: impl Into<Defect>) -> Self {
        Effect::from_op(Op::die(defect))
    }

    /// An effect that fails with the current fiber's interruption.
    ///
    /// The fiber's interruption signal is not raised, so `exit` and
    /// `catch_all_cause` still observe the cause.
    pub fn interrupt() -> Self {
        Effect::from_op(Op::WithFiber(Box::new(|ctx| {
            Op::Fail(Cause::interrupt(ctx.id()))
        })))
    }

    /// An effect that replays an exit.
    pub fn from_exit(exit: Exit<E, A>) -> Self {
        match exit {
            Exit::Success(a) => Effect::succeed(a),
            Exit::Failure(cause) => Effect::fail_cause(cause),
        }
    }

    /// An effect that replays a `Result`.
    pub fn from_result(result: Result<A, E>) -> Self {
        Effect::from_exit(result.into())
    }

    /// Run a synchronous closure. A panic becomes a defect.
    pub fn sync(f: impl FnOnce() -> A + Send + 'static) -> Self {
        Effect::from_op(Op::Sync(Box::new(move || Ok(Box::new(f()) as Value))))
    }

    /// Run a synchronous closure returning a `Result`.
    pub fn try_sync(f: impl FnOnce() -> Result<A, E> + Send + 'static) -> Self {
        Effect::from_op(Op::Sync(Box::new(move || match f() {
            Ok(a) => Ok(Box::new(a) as Value),
            Err(e) => Err(Cause::fail(AnyError::new(e))),
        })))
    }

    /// Build the effect lazily, when it is run.
    pub fn suspend(f: impl FnOnce() -> Effect<A, E> + Send + 'static) -> Self {
        Effect::from_op(Op::WithFiber(Box::new(move |_| f().op)))
    }

    /// An effect that never completes on its own.
    pub fn never() -> Self {
        Effect::from_op(Op::Async(Box::new(|_resumer| None)))
    }

    /// Suspend until `register` arranges for the fiber to resume.
    ///
    /// The closure may return a canceler, which is called if the fiber is
    /// interrupted while waiting.
    pub fn async_interruptible<F>(register: F) -> Self
    where
        F: FnOnce(Resume<A, E>) -> Option<Box<dyn FnOnce() + Send>> + Send + 'static,
    {
        Effect::from_op(Op::Async(Box::new(move |resumer| {
            register(Resume {
                resumer,
                _marker: PhantomData,
            })
        })))
    }

    /// Suspend until `register` arranges for the fiber to resume.
    pub fn async_<F>(register: F) -> Self
    where
        F: FnOnce(Resume<A, E>) + Send + 'static,
    {
        Effect::async_interruptible(move |resume| {
            register(resume);
            None
        })
    }

    /// Look up a service in the fiber's context. Dies if it is missing.
    pub fn service() -> Self
    where
        A: Clone + Sync,
    {
        Effect::from_op(Op::WithFiber(Box::new(|ctx| match ctx.env().get::<A>() {
            Some(service) => Op::value(service.clone()),
            None => Op::die(format!("service {} not found in context", type_name::<A>())),
        })))
    }

    /// Run `make()` forever, one iteration after another.
    pub fn forever<F>(make: F) -> Effect<Infallible, E>
    where
        F: Fn() -> Effect<A, E> + Send + Sync + 'static,
    {
        fn step<A, E, F>(make: Arc<F>) -> Op
        where
            F: Fn() -> Effect<A, E> + Send + Sync + 'static,
        {
            Op::WithFiber(Box::new(move |_| {
                let again = Arc::clone(&make);
                (*make)().op.then(move |_| step::<A, E, F>(again))
            }))
        }
        Effect::from_op(step::<A, E, F>(Arc::new(make)))
    }

    /// Run `make()` `times` times in sequence, collecting the results.
    pub fn repeat_n<F>(times: usize, make: F) -> Effect<Vec<A>, E>
    where
        F: Fn() -> Effect<A, E> + Send + Sync + 'static,
    {
        let make = Arc::new(make);
        (0..times).fold(Effect::succeed(Vec::with_capacity(times)), |acc, _| {
            let make = Arc::clone(&make);
            acc.flat_map(move |mut out| {
                (*make)().map(move |a| {
                    out.push(a);
                    out
                })
            })
        })
    }

    /// Run `f` with the current interruptibility switched off, handing it a
    /// [`Restore`] for the parts that may be interrupted.
    pub fn uninterruptible_mask<F>(f: F) -> Self
    where
        F: FnOnce(Restore) -> Effect<A, E> + Send + 'static,
    {
        Effect::from_op(Op::WithFiber(Box::new(move |ctx| {
            let restore = Restore {
                interruptible: ctx.interruptible(),
            };
            Op::Region(false, Box::new(f(restore).op))
        })))
    }

    // ------------------------------------------------------------------------
    // Sequencing
    // ------------------------------------------------------------------------

    /// Transform the value.
    pub fn map<B, F>(self, f: F) -> Effect<B, E>
    where
        B: Send + 'static,
        F: FnOnce(A) -> B + Send + 'static,
    {
        Effect::from_op(self.op.then(move |value| match downcast::<A>(value) {
            Ok(a) => Op::value(f(a)),
            Err(cause) => Op::Fail(cause),
        }))
    }

    /// Continue with the effect produced from the value.
    pub fn flat_map<B, F>(self, f: F) -> Effect<B, E>
    where
        F: FnOnce(A) -> Effect<B, E> + Send + 'static,
    {
        Effect::from_op(self.op.then(move |value| match downcast::<A>(value) {
            Ok(a) => f(a).op,
            Err(cause) => Op::Fail(cause),
        }))
    }

    /// Replace the value.
    pub fn as_value<B: Send + 'static>(self, value: B) -> Effect<B, E> {
        self.map(move |_| value)
    }

    /// Discard the value.
    pub fn as_unit(self) -> Effect<(), E> {
        self.map(|_| ())
    }

    /// Run `that` after this effect, keeping its value.
    pub fn zip_right<B>(self, that: Effect<B, E>) -> Effect<B, E> {
        Effect::from_op(self.op.then(move |_| that.op))
    }

    /// Run `that` after this effect, keeping this effect's value.
    pub fn zip_left<B: Send + 'static>(self, that: Effect<B, E>) -> Effect<A, E> {
        self.flat_map(move |a| that.as_value(a))
    }

    /// Run both in sequence and pair the values.
    pub fn zip<B: Send + 'static>(self, that: Effect<B, E>) -> Effect<(A, B), E> {
        self.flat_map(move |a| that.map(move |b| (a, b)))
    }

    /// Run an effect on the value, keeping the value.
    pub fn tap<F>(self, f: F) -> Effect<A, E>
    where
        F: FnOnce(&A) -> Effect<(), E> + Send + 'static,
    {
        self.flat_map(move |a| f(&a).as_value(a))
    }

    /// Wait for `duration`, then run this effect.
    pub fn delay(self, duration: Duration) -> Effect<A, E> {
        Effect::<(), E>::sleep(duration).zip_right(self)
    }

    // ------------------------------------------------------------------------
    // Failure handling
    // ------------------------------------------------------------------------

    /// Route the outcome: the full cause on failure, the value on success.
    pub fn fold_cause_effect<B, E2, F, S>(self, on_failure: F, on_success: S) -> Effect<B, E2>
    where
        E2: Failure,
        F: FnOnce(Cause<E>) -> Effect<B, E2> + Send + 'static,
        S: FnOnce(A) -> Effect<B, E2> + Send + 'static,
    {
        Effect::from_op(Op::Fold(
            Box::new(self.op),
            Box::new(move |cause| on_failure(cause.unerase::<E>()).op),
            Box::new(move |value| match downcast::<A>(value) {
                Ok(a) => on_success(a).op,
                Err(cause) => Op::Fail(cause),
            }),
        ))
    }

    /// Map a typed failure or the value to a result. Defects and
    /// interruptions pass through.
    pub fn fold<B, E2, F, S>(self, on_failure: F, on_success: S) -> Effect<B, E2>
    where
        B: Send + 'static,
        E2: Failure,
        F: FnOnce(E) -> B + Send + 'static,
        S: FnOnce(A) -> B + Send + 'static,
    {
        self.fold_cause_effect(
            move |cause| match cause.failure_or_cause() {
                Ok(e) => Effect::succeed(on_failure(e)),
                Err(cause) => Effect::fail_cause(cause.strip_failures()),
            },
            move |a| Effect::succeed(on_success(a)),
        )
    }

    /// Recover from a typed failure. Defects and interruptions pass through.
    pub fn catch_all<E2, F>(self, f: F) -> Effect<A, E2>
    where
        E2: Failure,
        F: FnOnce(E) -> Effect<A, E2> + Send + 'static,
    {
        self.fold_cause_effect(
            move |cause| match cause.failure_or_cause() {
                Ok(e) => f(e),
                Err(cause) => Effect::fail_cause(cause.strip_failures()),
            },
            Effect::succeed,
        )
    }

    /// Recover from any failure, seeing the full cause.
    pub fn catch_all_cause<E2, F>(self, f: F) -> Effect<A, E2>
    where
        E2: Failure,
        F: FnOnce(Cause<E>) -> Effect<A, E2> + Send + 'static,
    {
        self.fold_cause_effect(f, Effect::succeed)
    }

    /// Transform typed failures.
    pub fn map_error<E2, F>(self, f: F) -> Effect<A, E2>
    where
        E2: Failure,
        F: FnMut(E) -> E2 + Send + 'static,
    {
        self.catch_all_cause(move |cause| Effect::fail_cause(cause.map(f)))
    }

    /// Expose typed failures as `Err`.
    pub fn either(self) -> Effect<Result<A, E>, Infallible> {
        self.fold(Err, Ok)
    }

    /// Expose the outcome as an [`Exit`]. The resulting effect cannot fail
    /// unless it is interrupted.
    pub fn exit(self) -> Effect<Exit<E, A>, Infallible> {
        self.fold_cause_effect(
            |cause| Effect::succeed(Exit::Failure(cause)),
            |a| Effect::succeed(Exit::Success(a)),
        )
    }

    /// Expose the full cause as the typed failure.
    pub fn sandbox(self) -> Effect<A, Cause<E>> {
        self.catch_all_cause(|cause| Effect::fail(cause))
    }

    /// Peek at the outcome without changing it.
    pub fn tap_exit<F>(self, f: F) -> Effect<A, E>
    where
        F: FnOnce(&Exit<E, A>) -> Effect<(), Infallible> + Send + 'static,
    {
        self.exit().widen().flat_map(move |exit| {
            let peek = guarded(|| f(&exit));
            peek.widen().zip_right(Effect::from_exit(exit))
        })
    }

    /// Peek at a success or a typed failure without changing the outcome.
    ///
    /// Defects and interruptions pass through without calling `f`.
    pub fn tap_either<F>(self, f: F) -> Effect<A, E>
    where
        F: FnOnce(Result<&A, &E>) -> Effect<(), Infallible> + Send + 'static,
    {
        self.tap_exit(move |exit| match exit {
            Exit::Success(a) => f(Ok(a)),
            Exit::Failure(cause) => match cause.failures().first() {
                Some(error) => f(Err(*error)),
                None => Effect::unit(),
            },
        })
    }

    // ------------------------------------------------------------------------
    // Finalization and interruptibility
    // ------------------------------------------------------------------------

    /// Run `f` with the exit after this effect finishes, however it
    /// finishes. The finalizer runs uninterruptibly; its failure is
    /// sequenced after the effect's own cause.
    pub fn on_exit<F>(self, f: F) -> Effect<A, E>
    where
        F: FnOnce(&Exit<E, A>) -> Effect<(), Infallible> + Send + 'static,
    {
        Effect::uninterruptible_mask(move |restore| {
            restore.apply(self).exit().widen().flat_map(move |exit| {
                guarded(|| f(&exit))
                    .exit()
                    .widen()
                    .flat_map(move |done| Effect::from_exit(exit.with_finalizer(done)))
            })
        })
    }

    /// Run `finalizer` after this effect, however it finishes.
    pub fn ensuring(self, finalizer: Effect<(), Infallible>) -> Effect<A, E> {
        self.on_exit(move |_| finalizer)
    }

    /// Run `f` if this effect is interrupted.
    pub fn on_interrupt<F>(self, f: F) -> Effect<A, E>
    where
        F: FnOnce() -> Effect<(), Infallible> + Send + 'static,
    {
        self.on_exit(move |exit| {
            if exit.is_interrupted() {
                f()
            } else {
                Effect::unit()
            }
        })
    }

    /// Run this effect without observing interruption.
    pub fn uninterruptible(self) -> Effect<A, E> {
        Effect::from_op(Op::Region(false, Box::new(self.op)))
    }

    /// Run this effect observing interruption, even inside an
    /// uninterruptible region.
    pub fn interruptible(self) -> Effect<A, E> {
        Effect::from_op(Op::Region(true, Box::new(self.op)))
    }

    // ------------------------------------------------------------------------
    // Environment
    // ------------------------------------------------------------------------

    /// Run this effect with `service` added to its context.
    pub fn provide_service<S: Send + Sync + 'static>(self, service: S) -> Effect<A, E> {
        let op = self.op;
        Effect::from_op(Op::WithFiber(Box::new(move |ctx| {
            Op::Provide(ctx.env().with(service), Box::new(op))
        })))
    }

    /// Run this effect with exactly `context` as its context.
    pub fn provide_context(self, context: Context) -> Effect<A, E> {
        Effect::from_op(Op::Provide(context, Box::new(self.op)))
    }
}

impl<A, E: Failure> Effect<A, Cause<E>> {
    /// Undo [`Effect::sandbox`].
    pub fn unsandbox(self) -> Effect<A, E>
    where
        A: Send + 'static,
    {
        self.catch_all_cause(|cause: Cause<Cause<E>>| {
            Effect::fail_cause(cause.flat_map(&mut |inner| inner))
        })
    }
}

impl<A> Effect<A, Infallible> {
    /// View an effect that cannot fail with a typed error at any error type.
    pub fn widen<E>(self) -> Effect<A, E> {
        Effect::from_op(self.op)
    }
}

impl<E: Failure> Effect<(), E> {
    /// An effect that succeeds with `()`.
    pub fn unit() -> Self {
        Effect::from_op(Op::unit())
    }

    /// Give other fibers a chance to run.
    pub fn yield_now() -> Self {
        Effect::from_op(Op::Yield)
    }

    /// Suspend the fiber for `duration`. Interruptible.
    ///
    /// A duration too large to add to the current instant never elapses.
    pub fn sleep(duration: Duration) -> Self {
        Effect::from_op(Op::WithFiber(Box::new(move |ctx| {
            let timer = ctx.timer();
            Op::Async(Box::new(move |resumer| {
                let at = Instant::now().checked_add(duration)?;
                let key = timer.schedule(at, Box::new(move || resumer.resume(Op::unit())));
                Some(Box::new(move || {
                    timer.cancel(key);
                }) as Canceler)
            }))
        })))
    }
}

impl<E: Failure> Effect<FiberId, E> {
    /// The id of the running fiber.
    pub fn fiber_id() -> Self {
        Effect::from_op(Op::WithFiber(Box::new(|ctx| Op::value(ctx.id()))))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RuntimeConfig;
    use crate::runtime::Runtime;
    use parking_lot::Mutex;

    fn runtime() -> Runtime {
        Runtime::new(RuntimeConfig::builder().num_workers(2).build().unwrap()).unwrap()
    }

    #[test]
    fn test_succeed_map_flat_map() {
        let rt = runtime();
        let effect = Effect::<i32, String>::succeed(20)
            .map(|n| n + 1)
            .flat_map(|n| Effect::succeed(n * 2));
        assert_eq!(rt.run(effect), Exit::succeed(42));
    }

    #[test]
    fn test_fail_short_circuits() {
        let rt = runtime();
        let touched = Arc::new(Mutex::new(false));
        let flag = Arc::clone(&touched);
        let effect = Effect::<i32, String>::fail("boom".into()).map(move |n| {
            *flag.lock() = true;
            n
        });
        assert_eq!(rt.run(effect), Exit::fail("boom".to_string()));
        assert!(!*touched.lock());
    }

    #[test]
    fn test_sync_panic_becomes_defect() {
        let rt = runtime();
        let effect = Effect::<i32, String>::sync(|| panic!("kaboom"));
        let exit = rt.run(effect);
        let cause = exit.into_cause();
        assert_eq!(cause, Cause::die("kaboom"));
    }

    #[test]
    fn test_panic_in_continuation_becomes_defect() {
        let rt = runtime();
        let effect = Effect::<i32, String>::succeed(1).map(|_| -> i32 { panic!("in map") });
        assert_eq!(rt.run(effect), Exit::die("in map"));
    }

    #[test]
    fn test_try_sync() {
        let rt = runtime();
        let ok = Effect::<i32, String>::try_sync(|| Ok(3));
        let err = Effect::<i32, String>::try_sync(|| Err("nope".into()));
        assert_eq!(rt.run(ok), Exit::succeed(3));
        assert_eq!(rt.run(err), Exit::fail("nope".to_string()));
    }

    #[test]
    fn test_catch_all_recovers_typed_failure_only() {
        let rt = runtime();
        let recovered = Effect::<i32, String>::fail("x".into()).catch_all(|e| Effect::<i32, String>::succeed(e.len() as i32));
        assert_eq!(rt.run(recovered), Exit::succeed(1));

        let died = Effect::<i32, String>::die("d").catch_all(|_| Effect::<i32, String>::succeed(0));
        assert_eq!(rt.run(died), Exit::die("d"));
    }

    #[test]
    fn test_catch_all_cause_sees_defects() {
        let rt = runtime();
        let effect = Effect::<i32, String>::die("d").catch_all_cause(|cause| {
            Effect::<i32, String>::succeed(cause.defects().len() as i32)
        });
        assert_eq!(rt.run(effect), Exit::succeed(1));
    }

    #[test]
    fn test_either_and_fold() {
        let rt = runtime();
        let either = Effect::<i32, String>::fail("e".into()).either();
        assert_eq!(rt.run(either), Exit::succeed(Err("e".to_string())));

        let folded = Effect::<i32, String>::succeed(4).fold::<_, Infallible, _, _>(|_| 0, |n| n * 2);
        assert_eq!(rt.run(folded), Exit::succeed(8));
    }

    #[test]
    fn test_map_error() {
        let rt = runtime();
        let effect = Effect::<(), i32>::fail(7).map_error(|n| format!("code {n}"));
        assert_eq!(rt.run(effect), Exit::fail("code 7".to_string()));
    }

    #[test]
    fn test_sandbox_unsandbox() {
        let rt = runtime();
        let sandboxed = Effect::<(), String>::die("d").sandbox();
        let exit = rt.run(sandboxed);
        assert_eq!(exit, Exit::fail(Cause::die("d")));

        let round = Effect::<(), String>::fail("f".into()).sandbox().unsandbox();
        assert_eq!(rt.run(round), Exit::fail("f".to_string()));
    }

    #[test]
    fn test_ensuring_chain_composes_with_then() {
        let rt = runtime();
        let effect = Effect::<(), String>::fail("fail".into())
            .ensuring(Effect::die("die1"))
            .ensuring(Effect::die("die2"))
            .ensuring(Effect::die("die3"));
        let expected = Cause::fail("fail".to_string())
            .then(Cause::die("die1"))
            .then(Cause::die("die2"))
            .then(Cause::die("die3"));
        assert_eq!(rt.run(effect), Exit::Failure(expected));
    }

    #[test]
    fn test_ensuring_runs_on_success() {
        let rt = runtime();
        let ran = Arc::new(Mutex::new(0));
        let counter = Arc::clone(&ran);
        let effect = Effect::<i32, String>::succeed(1).ensuring(Effect::sync(move || *counter.lock() += 1));
        assert_eq!(rt.run(effect), Exit::succeed(1));
        assert_eq!(*ran.lock(), 1);
    }

    #[test]
    fn test_on_exit_panic_in_finalizer_builder() {
        let rt = runtime();
        let effect = Effect::<i32, String>::fail("boom".into()).on_exit(|_| -> Effect<(), Infallible> { panic!("finalizer panicked") });
        let expected = Cause::fail("boom".to_string()).then(Cause::die("finalizer panicked"));
        assert_eq!(rt.run(effect), Exit::Failure(expected));
    }

    #[test]
    fn test_interrupt_is_visible_to_exit() {
        let rt = runtime();
        let effect = Effect::<(), String>::interrupt().exit();
        let exit = rt.run(effect);
        let inner = exit.value().cloned().unwrap();
        assert!(inner.is_interrupted());
    }

    #[test]
    fn test_tap_exit_peeks() {
        let rt = runtime();
        let seen = Arc::new(Mutex::new(None));
        let slot = Arc::clone(&seen);
        let effect = Effect::<i32, String>::fail("e".into()).tap_exit(move |exit| {
            let failed = exit.is_failure();
            Effect::sync(move || *slot.lock() = Some(failed))
        });
        assert_eq!(rt.run(effect), Exit::fail("e".to_string()));
        assert_eq!(*seen.lock(), Some(true));
    }

    #[test]
    fn test_tap_either_sees_values_and_typed_failures() {
        let rt = runtime();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let tap = |seen: &Arc<Mutex<Vec<String>>>| {
            let seen = Arc::clone(seen);
            move |outcome: Result<&i32, &String>| {
                let entry = match outcome {
                    Ok(n) => format!("ok {n}"),
                    Err(e) => format!("err {e}"),
                };
                Effect::sync(move || seen.lock().push(entry))
            }
        };

        let ok = Effect::<i32, String>::succeed(3).tap_either(tap(&seen));
        assert_eq!(rt.run(ok), Exit::succeed(3));
        let failed = Effect::<i32, String>::fail("e".into()).tap_either(tap(&seen));
        assert_eq!(rt.run(failed), Exit::fail("e".to_string()));
        let died = Effect::<i32, String>::die("d").tap_either(tap(&seen));
        assert_eq!(rt.run(died), Exit::die("d"));

        assert_eq!(*seen.lock(), vec!["ok 3", "err e"]);
    }

    #[test]
    fn test_zip_variants() {
        let rt = runtime();
        let zipped = Effect::<i32, String>::succeed(1).zip(Effect::succeed("a"));
        assert_eq!(rt.run(zipped), Exit::succeed((1, "a")));

        let left = Effect::<i32, String>::succeed(1).zip_left(Effect::succeed(2));
        assert_eq!(rt.run(left), Exit::succeed(1));

        let right = Effect::<i32, String>::succeed(1).zip_right(Effect::succeed(2));
        assert_eq!(rt.run(right), Exit::succeed(2));
    }

    #[test]
    fn test_repeat_n_collects() {
        let rt = runtime();
        let counter = Arc::new(Mutex::new(0));
        let c = Arc::clone(&counter);
        let effect = Effect::<i32, String>::repeat_n(3, move || {
            let c = Arc::clone(&c);
            Effect::sync(move || {
                let mut n = c.lock();
                *n += 1;
                *n
            })
        });
        assert_eq!(rt.run(effect), Exit::succeed(vec![1, 2, 3]));
    }

    #[test]
    fn test_forever_stops_on_failure() {
        let rt = runtime();
        let counter = Arc::new(Mutex::new(0));
        let c = Arc::clone(&counter);
        let effect = Effect::<(), String>::forever(move || {
            let c = Arc::clone(&c);
            Effect::try_sync(move || {
                let mut n = c.lock();
                *n += 1;
                if *n == 5_000 {
                    Err("done".to_string())
                } else {
                    Ok(())
                }
            })
        });
        assert_eq!(rt.run(effect), Exit::fail("done".to_string()));
        assert_eq!(*counter.lock(), 5_000);
    }

    #[test]
    fn test_service_lookup() {
        #[derive(Clone, Debug, PartialEq)]
        struct Greeting(&'static str);

        let rt = runtime();
        let found = Effect::<Greeting, String>::service().provide_service(Greeting("hi"));
        assert_eq!(rt.run(found), Exit::succeed(Greeting("hi")));

        let missing = Effect::<Greeting, String>::service();
        let exit = rt.run(missing);
        assert!(exit.cause().map(Cause::is_die).unwrap_or(false));
    }

    #[test]
    fn test_fiber_id_is_not_none() {
        let rt = runtime();
        let exit = rt.run(Effect::<FiberId, String>::fiber_id());
        assert!(!exit.value().unwrap().is_none());
    }

    #[test]
    fn test_sleep_and_delay() {
        let rt = runtime();
        let start = Instant::now();
        let effect = Effect::<i32, String>::succeed(9).delay(Duration::from_millis(20));
        assert_eq!(rt.run(effect), Exit::succeed(9));
        assert!(start.elapsed() >= Duration::from_millis(20));
    }

    #[test]
    fn test_async_resumed_from_another_thread() {
        let rt = runtime();
        let effect = Effect::<i32, String>::async_(|resume| {
            std::thread::spawn(move || {
                std::thread::sleep(Duration::from_millis(5));
                resume.succeed(11);
            });
        });
        assert_eq!(rt.run(effect), Exit::succeed(11));
    }

    #[test]
    fn test_async_resumed_synchronously() {
        let rt = runtime();
        let effect = Effect::<i32, String>::async_(|resume| resume.fail("sync".into()));
        assert_eq!(rt.run(effect), Exit::fail("sync".to_string()));
    }
}
