//! # Deferred
//!
//! A one-shot cell: `Pending` until completed with an [`Exit`], then `Done`
//! forever. Fibers waiting on a pending cell are suspended and released
//! together when it completes, all with the same exit.
//!
//! Waiters are released in no particular order.

use std::convert::Infallible;
use std::fmt;
use std::mem;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::cause::{Cause, Defect, Failure};
use crate::effect::{Effect, Resume};
use crate::exit::Exit;
use crate::fiber::FiberId;

type Waiter<A, E> = Box<dyn FnOnce(Exit<E, A>) + Send>;

enum State<A, E> {
    Pending {
        waiters: Vec<(u64, Waiter<A, E>)>,
        next: u64,
    },
    Done(Exit<E, A>),
}

/// A one-shot synchronization cell.
pub struct Deferred<A, E = Infallible> {
    state: Arc<Mutex<State<A, E>>>,
}

impl<A, E> Clone for Deferred<A, E> {
    fn clone(&self) -> Self {
        Self {
            state: Arc::clone(&self.state),
        }
    }
}

impl<A, E> Deferred<A, E> {
    /// True if both handles point at the same cell.
    pub(crate) fn same_cell(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.state, &other.state)
    }
}

impl<A, E> fmt::Debug for Deferred<A, E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.lock();
        match &*state {
            State::Pending { waiters, .. } => f
                .debug_struct("Deferred")
                .field("done", &false)
                .field("waiters", &waiters.len())
                .finish(),
            State::Done(_) => f.debug_struct("Deferred").field("done", &true).finish(),
        }
    }
}

impl<A, E> Default for Deferred<A, E>
where
    A: Clone + Send + 'static,
    E: Failure,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<A, E> Deferred<A, E>
where
    A: Clone + Send + 'static,
    E: Failure,
{
    /// A pending cell.
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(State::Pending {
                waiters: Vec::new(),
                next: 0,
            })),
        }
    }

    /// An effect creating a pending cell.
    pub fn make<E2: Failure>() -> Effect<Self, E2> {
        Effect::sync(Self::new)
    }

    /// Complete the cell now. Returns false if it was already done.
    pub fn try_complete(&self, exit: Exit<E, A>) -> bool {
        let waiters = {
            let mut state = self.state.lock();
            let waiters = match &mut *state {
                State::Done(_) => return false,
                State::Pending { waiters, .. } => mem::take(waiters),
            };
            *state = State::Done(exit.clone());
            waiters
        };
        for (_, waiter) in waiters {
            waiter(exit.clone());
        }
        true
    }

    /// Complete with `exit`. Succeeds with false if already completed.
    pub fn complete<E2: Failure>(&self, exit: Exit<E, A>) -> Effect<bool, E2> {
        let cell = self.clone();
        Effect::sync(move || cell.try_complete(exit))
    }

    /// Complete with a value.
    pub fn succeed<E2: Failure>(&self, value: A) -> Effect<bool, E2> {
        self.complete(Exit::succeed(value))
    }

    /// Complete with a typed failure.
    pub fn fail<E2: Failure>(&self, error: E) -> Effect<bool, E2> {
        self.complete(Exit::fail(error))
    }

    /// Complete with a cause.
    pub fn fail_cause<E2: Failure>(&self, cause: Cause<E>) -> Effect<bool, E2> {
        self.complete(Exit::fail_cause(cause))
    }

    /// Complete with a defect.
    pub fn die<E2: Failure>(&self, defect: impl Into<Defect>) -> Effect<bool, E2> {
        self.complete(Exit::die(defect))
    }

    /// Complete with an interruption by the calling fiber.
    pub fn interrupt<E2: Failure>(&self) -> Effect<bool, E2> {
        let cell = self.clone();
        Effect::<FiberId, E2>::fiber_id().map(move |id| cell.try_complete(Exit::interrupt(id)))
    }

    /// Run `effect` and complete the cell with its exit.
    pub fn complete_with<E2: Failure>(&self, effect: Effect<A, E>) -> Effect<bool, E2> {
        let cell = self.clone();
        effect.exit().widen().map(move |exit| cell.try_complete(exit))
    }

    /// Suspend until the cell is done, then continue with its outcome.
    pub fn wait(&self) -> Effect<A, E> {
        self.wait_exit::<E>().flat_map(Effect::from_exit)
    }

    /// Suspend until the cell is done and return its exit.
    ///
    /// An interrupted waiter is removed from the cell.
    pub fn wait_exit<E2: Failure>(&self) -> Effect<Exit<E, A>, E2> {
        let state = Arc::clone(&self.state);
        Effect::async_interruptible(move |resume: Resume<Exit<E, A>, E2>| {
            let mut guard = state.lock();
            let key = match &mut *guard {
                State::Done(exit) => {
                    let exit = exit.clone();
                    drop(guard);
                    resume.succeed(exit);
                    return None;
                }
                State::Pending { waiters, next } => {
                    let key = *next;
                    *next += 1;
                    waiters.push((key, Box::new(move |exit| resume.succeed(exit))));
                    key
                }
            };
            drop(guard);
            Some(Box::new(move || {
                let removed = match &mut *state.lock() {
                    State::Pending { waiters, .. } => waiters
                        .iter()
                        .position(|(k, _)| *k == key)
                        .map(|i| waiters.swap_remove(i)),
                    State::Done(_) => None,
                };
                drop(removed);
            }) as Box<dyn FnOnce() + Send>)
        })
    }

    /// The exit, if done.
    pub fn poll(&self) -> Option<Exit<E, A>> {
        match &*self.state.lock() {
            State::Done(exit) => Some(exit.clone()),
            State::Pending { .. } => None,
        }
    }

    /// True once completed.
    pub fn is_done(&self) -> bool {
        matches!(&*self.state.lock(), State::Done(_))
    }

    /// Number of suspended waiters.
    pub fn waiter_count(&self) -> usize {
        match &*self.state.lock() {
            State::Pending { waiters, .. } => waiters.len(),
            State::Done(_) => 0,
        }
    }
}
