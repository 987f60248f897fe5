//! # Cause Algebra
//!
//! A [`Cause`] describes every reason an effect did not succeed: zero, one
//! or many typed failures, defects and interruptions, composed sequentially
//! ([`Cause::then`]) or in parallel ([`Cause::both`]).
//!
//! ## Design
//!
//! - `Then` records program order: a failure followed by failing finalizers.
//! - `Both` records concurrency: two branches of `zip_par` failing independently.
//! - `Empty` is the identity of both operators. The smart constructors drop it,
//!   and equality ignores it wherever it appears.
//! - Equality is semantic: associativity of `Then`/`Both` is ignored, `Both` is
//!   compared as a multiset, `Then` keeps its order.
//!
//! ## Technical References
//!
//! - [ZIO Cause](https://zio.dev/reference/core/cause/)
//! - [Effect-TS Cause](https://effect.website/docs/data-types/cause/)

use std::any::Any;
use std::convert::Infallible;
use std::fmt;
use std::sync::Arc;

use crate::fiber::FiberId;
use crate::panic::CaughtPanic;

/// Bound for typed failure values carried by effects.
///
/// Failures are cloned into every observer of an exit, so they must be
/// cheap enough to clone and shareable across threads.
pub trait Failure: Clone + fmt::Debug + Send + Sync + 'static {}

impl<T> Failure for T where T: Clone + fmt::Debug + Send + Sync + 'static {}

// ============================================================================
// Defect
// ============================================================================

/// An unexpected failure: a panic caught by the runtime or an explicit `die`.
///
/// Defects compare by message.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct Defect {
    message: Arc<str>,
}

impl Defect {
    /// Create a defect from a message.
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: Arc::from(message.into()),
        }
    }

    /// Create a defect from a caught panic.
    pub fn from_panic(panic: CaughtPanic) -> Self {
        Self::new(panic.into_message())
    }

    /// The defect message.
    pub fn message(&self) -> &str {
        &self.message
    }
}

impl fmt::Debug for Defect {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Defect").field(&&*self.message).finish()
    }
}

impl fmt::Display for Defect {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.message)
    }
}

impl From<&str> for Defect {
    fn from(message: &str) -> Self {
        Self::new(message)
    }
}

impl From<String> for Defect {
    fn from(message: String) -> Self {
        Self::new(message)
    }
}

// ============================================================================
// Cause
// ============================================================================

/// The full story of why an effect did not succeed.
#[derive(Clone, Debug)]
pub enum Cause<E> {
    /// No failure at all.
    Empty,
    /// A typed, expected failure.
    Fail(E),
    /// An unexpected failure.
    Die(Defect),
    /// Interruption, attributed to the fiber that requested it.
    Interrupt(FiberId),
    /// The left cause happened, then the right cause happened.
    Then(Box<Cause<E>>, Box<Cause<E>>),
    /// Both causes happened concurrently.
    Both(Box<Cause<E>>, Box<Cause<E>>),
}

impl<E> Cause<E> {
    /// The empty cause.
    pub fn empty() -> Self {
        Cause::Empty
    }

    /// A typed failure.
    pub fn fail(error: E) -> Self {
        Cause::Fail(error)
    }

    /// A defect.
    pub fn die(defect: impl Into<Defect>) -> Self {
        Cause::Die(defect.into())
    }

    /// An interruption by `by`.
    pub fn interrupt(by: FiberId) -> Self {
        Cause::Interrupt(by)
    }

    /// Sequential composition. `Empty` on either side yields the other side.
    pub fn then(self, other: Cause<E>) -> Self {
        match (self, other) {
            (Cause::Empty, right) => right,
            (left, Cause::Empty) => left,
            (left, right) => Cause::Then(Box::new(left), Box::new(right)),
        }
    }

    /// Parallel composition. `Empty` on either side yields the other side.
    pub fn both(self, other: Cause<E>) -> Self {
        match (self, other) {
            (Cause::Empty, right) => right,
            (left, Cause::Empty) => left,
            (left, right) => Cause::Both(Box::new(left), Box::new(right)),
        }
    }

    /// True if the cause contains no leaves.
    pub fn is_empty(&self) -> bool {
        let mut empty = true;
        self.for_each_leaf(&mut |_| empty = false);
        empty
    }

    /// True if the cause contains a typed failure.
    pub fn is_failure(&self) -> bool {
        self.any_leaf(|leaf| matches!(leaf, Cause::Fail(_)))
    }

    /// True if the cause contains a defect.
    pub fn is_die(&self) -> bool {
        self.any_leaf(|leaf| matches!(leaf, Cause::Die(_)))
    }

    /// True if the cause contains an interruption.
    pub fn is_interrupted(&self) -> bool {
        self.any_leaf(|leaf| matches!(leaf, Cause::Interrupt(_)))
    }

    /// True if the cause has at least one leaf and every leaf is an interruption.
    pub fn is_interrupted_only(&self) -> bool {
        let mut seen = false;
        let mut only = true;
        self.for_each_leaf(&mut |leaf| {
            seen = true;
            if !matches!(leaf, Cause::Interrupt(_)) {
                only = false;
            }
        });
        seen && only
    }

    /// Typed failures, in traversal order.
    pub fn failures(&self) -> Vec<&E> {
        let mut out = Vec::new();
        self.for_each_leaf(&mut |leaf| {
            if let Cause::Fail(e) = leaf {
                out.push(e);
            }
        });
        out
    }

    /// Defects, in traversal order.
    pub fn defects(&self) -> Vec<&Defect> {
        let mut out = Vec::new();
        self.for_each_leaf(&mut |leaf| {
            if let Cause::Die(d) = leaf {
                out.push(d);
            }
        });
        out
    }

    /// Distinct interrupting fibers, in traversal order.
    pub fn interruptors(&self) -> Vec<FiberId> {
        let mut out = Vec::new();
        self.for_each_leaf(&mut |leaf| {
            if let Cause::Interrupt(id) = leaf {
                if !out.contains(id) {
                    out.push(*id);
                }
            }
        });
        out
    }

    /// The first typed failure, or the whole cause when there is none.
    pub fn failure_or_cause(self) -> Result<E, Cause<E>> {
        if !self.is_failure() {
            return Err(self);
        }
        let mut first = None;
        self.into_each_leaf(&mut |leaf| {
            if first.is_none() {
                if let Cause::Fail(e) = leaf {
                    first = Some(e);
                }
            }
        });
        first.ok_or(Cause::Empty)
    }

    /// Transform every typed failure.
    pub fn map<F>(self, mut f: impl FnMut(E) -> F) -> Cause<F> {
        self.flat_map(&mut |e| Cause::Fail(f(e)))
    }

    /// Replace every typed failure with a cause.
    pub fn flat_map<F>(self, f: &mut dyn FnMut(E) -> Cause<F>) -> Cause<F> {
        match self {
            Cause::Empty => Cause::Empty,
            Cause::Fail(e) => f(e),
            Cause::Die(d) => Cause::Die(d),
            Cause::Interrupt(id) => Cause::Interrupt(id),
            Cause::Then(l, r) => {
                let l = l.flat_map(f);
                l.then(r.flat_map(f))
            }
            Cause::Both(l, r) => {
                let l = l.flat_map(f);
                l.both(r.flat_map(f))
            }
        }
    }

    /// Remove `Empty` leaves, keeping the shape of what remains.
    pub fn flatten(self) -> Self {
        match self {
            Cause::Then(l, r) => l.flatten().then(r.flatten()),
            Cause::Both(l, r) => l.flatten().both(r.flatten()),
            leaf => leaf,
        }
    }

    /// Drop typed failures, keeping defects and interruptions.
    pub fn strip_failures<F>(self) -> Cause<F> {
        self.flat_map(&mut |_| Cause::Empty)
    }

    fn any_leaf(&self, pred: impl Fn(&Cause<E>) -> bool) -> bool {
        let mut found = false;
        self.for_each_leaf(&mut |leaf| {
            if pred(leaf) {
                found = true;
            }
        });
        found
    }

    fn for_each_leaf<'a>(&'a self, f: &mut dyn FnMut(&'a Cause<E>)) {
        match self {
            Cause::Empty => {}
            Cause::Then(l, r) | Cause::Both(l, r) => {
                l.for_each_leaf(f);
                r.for_each_leaf(f);
            }
            leaf => f(leaf),
        }
    }

    fn into_each_leaf(self, f: &mut dyn FnMut(Cause<E>)) {
        match self {
            Cause::Empty => {}
            Cause::Then(l, r) | Cause::Both(l, r) => {
                l.into_each_leaf(f);
                r.into_each_leaf(f);
            }
            leaf => f(leaf),
        }
    }
}

impl Cause<Infallible> {
    /// View a cause with no typed failures at any failure type.
    pub fn widen<E>(self) -> Cause<E> {
        self.map(|never| match never {})
    }
}

impl<E: Failure> Cause<E> {
    pub(crate) fn erase(self) -> Cause<AnyError> {
        self.map(AnyError::new)
    }
}

impl Cause<AnyError> {
    /// Recover typed failures. A failure of any other type becomes a defect.
    pub(crate) fn unerase<E: Failure>(self) -> Cause<E> {
        self.flat_map(&mut |any| match any.downcast_ref::<E>() {
            Some(e) => Cause::Fail(e.clone()),
            None => Cause::Die(Defect::new(format!(
                "failure of unexpected type {}: {:?}",
                std::any::type_name::<E>(),
                any
            ))),
        })
    }
}

impl<E> Default for Cause<E> {
    fn default() -> Self {
        Cause::Empty
    }
}

// ============================================================================
// Semantic equality
// ============================================================================

enum Canon<'a, E> {
    Leaf(&'a Cause<E>),
    Seq(Vec<Canon<'a, E>>),
    Par(Vec<Canon<'a, E>>),
}

fn canon<E>(cause: &Cause<E>) -> Option<Canon<'_, E>> {
    match cause {
        Cause::Empty => None,
        Cause::Then(l, r) => {
            let mut items = Vec::new();
            push_seq(l, &mut items);
            push_seq(r, &mut items);
            collapse(items, Canon::Seq)
        }
        Cause::Both(l, r) => {
            let mut items = Vec::new();
            push_par(l, &mut items);
            push_par(r, &mut items);
            collapse(items, Canon::Par)
        }
        leaf => Some(Canon::Leaf(leaf)),
    }
}

fn collapse<'a, E>(
    mut items: Vec<Canon<'a, E>>,
    wrap: fn(Vec<Canon<'a, E>>) -> Canon<'a, E>,
) -> Option<Canon<'a, E>> {
    match items.len() {
        0 => None,
        1 => items.pop(),
        _ => Some(wrap(items)),
    }
}

fn push_seq<'a, E>(cause: &'a Cause<E>, out: &mut Vec<Canon<'a, E>>) {
    match canon(cause) {
        None => {}
        Some(Canon::Seq(items)) => out.extend(items),
        Some(other) => out.push(other),
    }
}

fn push_par<'a, E>(cause: &'a Cause<E>, out: &mut Vec<Canon<'a, E>>) {
    match canon(cause) {
        None => {}
        Some(Canon::Par(items)) => out.extend(items),
        Some(other) => out.push(other),
    }
}

fn canon_eq<E: PartialEq>(a: &Canon<'_, E>, b: &Canon<'_, E>) -> bool {
    match (a, b) {
        (Canon::Leaf(x), Canon::Leaf(y)) => match (x, y) {
            (Cause::Fail(x), Cause::Fail(y)) => x == y,
            (Cause::Die(x), Cause::Die(y)) => x == y,
            (Cause::Interrupt(x), Cause::Interrupt(y)) => x == y,
            _ => false,
        },
        (Canon::Seq(xs), Canon::Seq(ys)) => {
            xs.len() == ys.len() && xs.iter().zip(ys).all(|(x, y)| canon_eq(x, y))
        }
        (Canon::Par(xs), Canon::Par(ys)) => {
            if xs.len() != ys.len() {
                return false;
            }
            let mut used = vec![false; ys.len()];
            xs.iter().all(|x| {
                let slot = ys
                    .iter()
                    .enumerate()
                    .position(|(j, y)| !used[j] && canon_eq(x, y));
                match slot {
                    Some(j) => {
                        used[j] = true;
                        true
                    }
                    None => false,
                }
            })
        }
        _ => false,
    }
}

impl<E: PartialEq> PartialEq for Cause<E> {
    fn eq(&self, other: &Self) -> bool {
        match (canon(self), canon(other)) {
            (None, None) => true,
            (Some(a), Some(b)) => canon_eq(&a, &b),
            _ => false,
        }
    }
}

impl<E: Eq> Eq for Cause<E> {}

// ============================================================================
// Rendering
// ============================================================================

impl<E: fmt::Debug> fmt::Display for Cause<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Cause::Empty => f.write_str("Empty"),
            Cause::Fail(e) => write!(f, "Fail({e:?})"),
            Cause::Die(d) => write!(f, "Die({d})"),
            Cause::Interrupt(id) => write!(f, "Interrupt({id})"),
            Cause::Then(l, r) => write!(f, "({l} ; {r})"),
            Cause::Both(l, r) => write!(f, "({l} | {r})"),
        }
    }
}

// ============================================================================
// Type-erased failures
// ============================================================================

trait ErasedFailure: Any + fmt::Debug + Send + Sync {
    fn as_any(&self) -> &dyn Any;
}

impl<T: Any + fmt::Debug + Send + Sync> ErasedFailure for T {
    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// A typed failure with its type erased.
///
/// Finalizers observe exits through this type so that a scope can hold
/// resources acquired by effects with different failure types.
#[derive(Clone)]
pub struct AnyError(Arc<dyn ErasedFailure>);

impl AnyError {
    /// Erase a typed failure.
    pub fn new<E: Failure>(error: E) -> Self {
        Self(Arc::new(error))
    }

    /// Borrow the failure as `E` if that is its type.
    pub fn downcast_ref<E: 'static>(&self) -> Option<&E> {
        self.0.as_any().downcast_ref::<E>()
    }

    /// True if the failure has type `E`.
    pub fn is<E: 'static>(&self) -> bool {
        self.0.as_any().is::<E>()
    }
}

impl fmt::Debug for AnyError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(&*self.0, f)
    }
}
