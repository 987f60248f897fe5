//! # Scope
//!
//! A dynamic extent owning an ordered list of finalizers. Closing a scope
//! runs every finalizer exactly once, most recently added first, with the
//! exit that closed it.
//!
//! ## Design
//!
//! - The finalizer list is guarded by a mutex; fibers sharing a scope may
//!   add finalizers concurrently. The lock is never held while a finalizer
//!   runs.
//! - The first close wins. Adding a finalizer to a closed scope runs it at
//!   once with the close exit.
//! - A child scope ([`Scope::fork`]) registers its own close as a finalizer
//!   of the parent and removes it again when closed on its own, so the
//!   parent never closes it twice.
//! - Close runs the whole chain uninterruptibly. A failing finalizer does
//!   not stop the chain; its cause is appended with `then`.

use std::convert::Infallible;
use std::fmt;
use std::mem;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;

use crate::cause::{Cause, Failure};
use crate::effect::{guarded, Effect, Op};
use crate::exit::{AnyExit, Exit};

/// A finalizer: given the scope's exit, the effect that releases a resource.
pub type Finalizer = Box<dyn FnOnce(&AnyExit) -> Effect<(), Infallible> + Send>;

static NEXT_SCOPE_ID: AtomicU64 = AtomicU64::new(1);

enum ScopeState {
    Open {
        finalizers: Vec<(u64, Finalizer)>,
        next: u64,
    },
    Closed(AnyExit),
}

struct Inner {
    id: u64,
    state: Mutex<ScopeState>,
    /// The parent and the key of our close within it.
    parent: Mutex<Option<(Weak<Inner>, u64)>>,
}

impl Inner {
    fn try_register(&self, finalizer: Finalizer) -> Result<u64, (Finalizer, AnyExit)> {
        let mut state = self.state.lock();
        match &mut *state {
            ScopeState::Open { finalizers, next } => {
                let key = *next;
                *next += 1;
                finalizers.push((key, finalizer));
                Ok(key)
            }
            ScopeState::Closed(exit) => Err((finalizer, exit.clone())),
        }
    }

    fn remove(&self, key: u64) {
        let removed = match &mut *self.state.lock() {
            ScopeState::Open { finalizers, .. } => finalizers
                .iter()
                .position(|(k, _)| *k == key)
                .map(|i| finalizers.remove(i)),
            ScopeState::Closed(_) => None,
        };
        drop(removed);
    }

    /// Transition to closed, handing back the finalizers to run.
    fn seal(&self, exit: &AnyExit) -> Option<Vec<Finalizer>> {
        let mut state = self.state.lock();
        match &*state {
            ScopeState::Closed(_) => None,
            ScopeState::Open { .. } => {
                match mem::replace(&mut *state, ScopeState::Closed(exit.clone())) {
                    ScopeState::Open { finalizers, .. } => {
                        Some(finalizers.into_iter().map(|(_, f)| f).collect())
                    }
                    ScopeState::Closed(_) => None,
                }
            }
        }
    }
}

/// A set of finalizers released together.
#[derive(Clone)]
pub struct Scope {
    inner: Arc<Inner>,
}

impl Default for Scope {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for Scope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Scope")
            .field("id", &self.inner.id)
            .field("closed", &self.is_closed())
            .field("finalizers", &self.finalizer_count())
            .finish()
    }
}

impl Scope {
    /// A new open scope.
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                id: NEXT_SCOPE_ID.fetch_add(1, Ordering::Relaxed),
                state: Mutex::new(ScopeState::Open {
                    finalizers: Vec::new(),
                    next: 0,
                }),
                parent: Mutex::new(None),
            }),
        }
    }

    /// Identity of this scope.
    pub fn id(&self) -> u64 {
        self.inner.id
    }

    /// True once closed.
    pub fn is_closed(&self) -> bool {
        matches!(&*self.inner.state.lock(), ScopeState::Closed(_))
    }

    /// Number of finalizers waiting for close.
    pub fn finalizer_count(&self) -> usize {
        match &*self.inner.state.lock() {
            ScopeState::Open { finalizers, .. } => finalizers.len(),
            ScopeState::Closed(_) => 0,
        }
    }

    /// A child scope closed by this one, unless closed earlier on its own.
    /// The child of a closed scope starts out closed.
    pub fn fork(&self) -> Scope {
        let child = Scope::new();
        let owned = child.clone();
        let close: Finalizer = Box::new(move |exit| owned.close(exit));
        match self.inner.try_register(close) {
            Ok(key) => {
                *child.inner.parent.lock() = Some((Arc::downgrade(&self.inner), key));
            }
            Err((_, exit)) => {
                *child.inner.state.lock() = ScopeState::Closed(exit);
            }
        }
        child
    }

    /// Add a finalizer. On a closed scope it runs immediately.
    pub fn add_finalizer<E2: Failure>(&self, finalizer: Finalizer) -> Effect<(), E2> {
        let scope = self.clone();
        Effect::suspend(move || match scope.inner.try_register(finalizer) {
            Ok(_) => Effect::unit(),
            Err((finalizer, exit)) => guarded(move || finalizer(&exit)).uninterruptible().widen(),
        })
    }

    /// Close the scope with `exit`, running the finalizers in reverse order.
    ///
    /// Fails with the finalizers' combined cause if any of them failed.
    /// Closing an already closed scope does nothing.
    pub fn close<E2: Failure>(&self, exit: &AnyExit) -> Effect<(), E2> {
        let scope = self.clone();
        let exit = exit.clone();
        Effect::suspend(move || {
            let finalizers = match scope.inner.seal(&exit) {
                Some(finalizers) => finalizers,
                None => return Effect::unit(),
            };
            if let Some((parent, key)) = scope.inner.parent.lock().take() {
                if let Some(parent) = parent.upgrade() {
                    parent.remove(key);
                }
            }
            let chain = finalizers.into_iter().rev().fold(
                Effect::<Cause<Infallible>, Infallible>::succeed(Cause::Empty),
                |acc, finalizer| {
                    let exit = exit.clone();
                    acc.flat_map(move |cause| {
                        guarded(move || finalizer(&exit))
                            .exit()
                            .map(move |done| cause.then(done.into_cause()))
                    })
                },
            );
            chain
                .uninterruptible()
                .widen::<E2>()
                .flat_map(|cause| {
                    if cause.is_empty() {
                        Effect::unit()
                    } else {
                        Effect::fail_cause(cause.widen())
                    }
                })
        })
    }

    /// Run `effect` with this scope in its context.
    pub fn extend<A, E>(&self, effect: Effect<A, E>) -> Effect<A, E>
    where
        A: Send + 'static,
        E: Failure,
    {
        effect.provide_service(self.clone())
    }
}

impl<E: Failure> Effect<Scope, E> {
    /// The scope in the fiber's context. Dies if there is none.
    pub fn scope() -> Self {
        Effect::from_op(Op::WithFiber(Box::new(|ctx| match ctx.env().get::<Scope>() {
            Some(scope) => Op::value(scope.clone()),
            None => Op::die("no scope in context"),
        })))
    }
}

impl<E: Failure> Effect<(), E> {
    /// Add a finalizer to the scope in context.
    pub fn add_finalizer<F>(finalizer: F) -> Self
    where
        F: FnOnce(&AnyExit) -> Effect<(), Infallible> + Send + 'static,
    {
        Effect::<Scope, E>::scope().flat_map(move |scope| scope.add_finalizer(Box::new(finalizer)))
    }
}

/// Acquire a resource and register its release with the scope in context.
///
/// Acquisition and registration are uninterruptible, so an acquired
/// resource is always released.
pub fn acquire_release<A, E, R>(acquire: Effect<A, E>, release: R) -> Effect<A, E>
where
    A: Clone + Send + 'static,
    E: Failure,
    R: FnOnce(A, &AnyExit) -> Effect<(), Infallible> + Send + 'static,
{
    Effect::<Scope, E>::scope()
        .flat_map(move |scope| {
            acquire.flat_map(move |resource| {
                let owned = resource.clone();
                scope
                    .add_finalizer(Box::new(move |exit| release(owned, exit)))
                    .as_value(resource)
            })
        })
        .uninterruptible()
}

/// Run `effect` in a fresh scope that is closed on every exit path.
///
/// Finalizer failures are sequenced after the effect's own cause.
pub fn scoped<A, E>(effect: Effect<A, E>) -> Effect<A, E>
where
    A: Send + 'static,
    E: Failure,
{
    Effect::uninterruptible_mask(move |restore| {
        let scope = Scope::new();
        restore
            .apply(scope.extend(effect))
            .exit()
            .widen()
            .flat_map(move |exit| {
                let any = exit.to_any_exit();
                scope
                    .close::<Infallible>(&any)
                    .exit()
                    .widen()
                    .flat_map(move |closed: Exit<Infallible, ()>| {
                        Effect::from_exit(exit.with_finalizer(closed))
                    })
            })
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RuntimeConfig;
    use crate::runtime::Runtime;
    use std::time::Duration;

    fn runtime() -> Runtime {
        Runtime::new(RuntimeConfig::builder().num_workers(2).build().unwrap()).unwrap()
    }

    fn record(log: &Arc<Mutex<Vec<&'static str>>>, name: &'static str) -> Finalizer {
        let log = Arc::clone(log);
        Box::new(move |_| Effect::sync(move || log.lock().push(name)))
    }

    #[test]
    fn test_close_runs_in_reverse_order() {
        let rt = runtime();
        let log = Arc::new(Mutex::new(Vec::new()));
        let scope = Scope::new();
        let effect = scope
            .add_finalizer::<String>(record(&log, "f1"))
            .zip_right(scope.add_finalizer(record(&log, "f2")))
            .zip_right(scope.add_finalizer(record(&log, "f3")))
            .zip_right(scope.close(&Exit::succeed(())));
        assert_eq!(rt.run(effect), Exit::succeed(()));
        assert_eq!(*log.lock(), vec!["f3", "f2", "f1"]);
        assert!(scope.is_closed());
    }

    #[test]
    fn test_close_is_honored_once() {
        let rt = runtime();
        let log = Arc::new(Mutex::new(Vec::new()));
        let scope = Scope::new();
        let exit = Exit::succeed(());
        let effect = scope
            .add_finalizer::<String>(record(&log, "f"))
            .zip_right(scope.close(&exit))
            .zip_right(scope.close(&exit));
        assert_eq!(rt.run(effect), Exit::succeed(()));
        assert_eq!(log.lock().len(), 1);
    }

    #[test]
    fn test_add_to_closed_scope_runs_immediately() {
        let rt = runtime();
        let log = Arc::new(Mutex::new(Vec::new()));
        let scope = Scope::new();
        rt.run(scope.close::<String>(&Exit::succeed(())));
        rt.run(scope.add_finalizer::<String>(record(&log, "late")));
        assert_eq!(*log.lock(), vec!["late"]);
    }

    #[test]
    fn test_failing_finalizers_compose_sequentially() {
        let rt = runtime();
        let effect = scoped(
            Effect::<(), String>::add_finalizer(|_| Effect::die("f1"))
                .zip_right(Effect::add_finalizer(|_| Effect::die("f2")))
                .zip_right(Effect::add_finalizer(|_| Effect::die("f3")))
                .zip_right(Effect::<(), String>::fail("boom".to_string())),
        );
        let expected = Cause::fail("boom".to_string())
            .then(Cause::die("f3"))
            .then(Cause::die("f2"))
            .then(Cause::die("f1"));
        assert_eq!(rt.run(effect), Exit::Failure(expected));
    }

    #[test]
    fn test_finalizer_panic_is_captured() {
        let rt = runtime();
        let log = Arc::new(Mutex::new(Vec::new()));
        let first = record(&log, "first");
        let effect = scoped(
            Effect::<(), String>::add_finalizer(first)
                .zip_right(Effect::add_finalizer(|_| -> Effect<(), Infallible> { panic!("bad release") }))
                .as_value(1),
        );
        assert_eq!(rt.run(effect), Exit::die("bad release"));
        assert_eq!(*log.lock(), vec!["first"]);
    }

    #[test]
    fn test_finalizer_sees_exit() {
        let rt = runtime();
        let seen = Arc::new(Mutex::new(None));
        let slot = Arc::clone(&seen);
        let effect = scoped(
            Effect::<(), String>::add_finalizer(move |exit| {
                let failed = exit.is_failure();
                Effect::sync(move || *slot.lock() = Some(failed))
            })
            .zip_right(Effect::<(), String>::fail("e".to_string())),
        );
        assert_eq!(rt.run(effect), Exit::fail("e".to_string()));
        assert_eq!(*seen.lock(), Some(true));
    }

    #[test]
    fn test_child_scope_closed_with_parent() {
        let rt = runtime();
        let log = Arc::new(Mutex::new(Vec::new()));
        let parent = Scope::new();
        let child = parent.fork();
        let effect = parent
            .add_finalizer::<String>(record(&log, "parent"))
            .zip_right(child.add_finalizer(record(&log, "child")))
            .zip_right(parent.close(&Exit::succeed(())));
        assert_eq!(rt.run(effect), Exit::succeed(()));
        assert_eq!(*log.lock(), vec!["parent", "child"]);
        assert!(child.is_closed());
    }

    #[test]
    fn test_child_closed_first_is_detached() {
        let rt = runtime();
        let parent = Scope::new();
        let child = parent.fork();
        assert_eq!(parent.finalizer_count(), 1);
        rt.run(child.close::<String>(&Exit::succeed(())));
        assert_eq!(parent.finalizer_count(), 0);

        let late = parent.fork();
        rt.run(parent.close::<String>(&Exit::die("gone")));
        assert!(parent.fork().is_closed());
        assert!(late.is_closed());
    }

    #[test]
    fn test_acquire_release_requires_scope() {
        let rt = runtime();
        let effect = acquire_release(Effect::<i32, String>::succeed(1), |_, _| Effect::unit());
        assert_eq!(rt.run(effect), Exit::die("no scope in context"));
    }

    #[test]
    fn test_interrupt_releases_acquired_in_reverse() {
        let rt = runtime();
        let log = Arc::new(Mutex::new(Vec::new()));
        let acquire = |n: usize, log: &Arc<Mutex<Vec<usize>>>| {
            let log = Arc::clone(log);
            acquire_release(Effect::<usize, String>::succeed(n), move |n, _| {
                Effect::sync(move || log.lock().push(n))
            })
        };
        let body = acquire(1, &log)
            .zip_right(acquire(2, &log))
            .zip_right(acquire(3, &log))
            .zip_right(Effect::<(), String>::never());
        let effect = scoped(body).fork::<String>().flat_map(|fiber| {
            Effect::<(), String>::sleep(Duration::from_millis(20)).zip_right(fiber.interrupt())
        });
        let exit = rt.run(effect).into_result().unwrap();
        assert!(exit.is_interrupted());
        assert_eq!(*log.lock(), vec![3, 2, 1]);
    }

    #[test]
    fn test_scope_in_context() {
        let rt = runtime();
        let effect = scoped(Effect::<Scope, String>::scope().map(|s| s.is_closed()));
        assert_eq!(rt.run(effect), Exit::succeed(false));
    }
}
