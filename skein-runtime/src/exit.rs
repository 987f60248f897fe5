//! # Exit
//!
//! The terminal outcome of an effect: a value or the [`Cause`] of failure.

use std::convert::Infallible;

use crate::cause::{AnyError, Cause, Defect, Failure};
use crate::fiber::FiberId;

/// How an effect finished.
#[derive(Clone, Debug, PartialEq)]
pub enum Exit<E, A> {
    /// The effect produced a value.
    Success(A),
    /// The effect failed; the cause holds every reason.
    Failure(Cause<E>),
}

/// An exit with an erased failure type and no value, as seen by finalizers
/// and by fibers watching each other.
pub type AnyExit = Exit<AnyError, ()>;

impl<E, A> Exit<E, A> {
    /// A successful exit.
    pub fn succeed(value: A) -> Self {
        Exit::Success(value)
    }

    /// A typed failure.
    pub fn fail(error: E) -> Self {
        Exit::Failure(Cause::fail(error))
    }

    /// A failure with the given cause.
    pub fn fail_cause(cause: Cause<E>) -> Self {
        Exit::Failure(cause)
    }

    /// A defect.
    pub fn die(defect: impl Into<Defect>) -> Self {
        Exit::Failure(Cause::die(defect))
    }

    /// An interruption by `by`.
    pub fn interrupt(by: FiberId) -> Self {
        Exit::Failure(Cause::interrupt(by))
    }

    /// True for `Success`.
    pub fn is_success(&self) -> bool {
        matches!(self, Exit::Success(_))
    }

    /// True for `Failure`.
    pub fn is_failure(&self) -> bool {
        matches!(self, Exit::Failure(_))
    }

    /// True if the exit is a failure whose cause contains an interruption.
    pub fn is_interrupted(&self) -> bool {
        matches!(self, Exit::Failure(cause) if cause.is_interrupted())
    }

    /// The value, if successful.
    pub fn value(&self) -> Option<&A> {
        match self {
            Exit::Success(a) => Some(a),
            Exit::Failure(_) => None,
        }
    }

    /// The cause, if failed.
    pub fn cause(&self) -> Option<&Cause<E>> {
        match self {
            Exit::Success(_) => None,
            Exit::Failure(cause) => Some(cause),
        }
    }

    /// The cause of a failure, or `Empty` for a success.
    pub fn into_cause(self) -> Cause<E> {
        match self {
            Exit::Success(_) => Cause::Empty,
            Exit::Failure(cause) => cause,
        }
    }

    /// Convert to a `Result` keeping the full cause.
    pub fn into_result(self) -> Result<A, Cause<E>> {
        match self {
            Exit::Success(a) => Ok(a),
            Exit::Failure(cause) => Err(cause),
        }
    }

    /// Transform the value.
    pub fn map<B>(self, f: impl FnOnce(A) -> B) -> Exit<E, B> {
        match self {
            Exit::Success(a) => Exit::Success(f(a)),
            Exit::Failure(cause) => Exit::Failure(cause),
        }
    }

    /// Transform the typed failures.
    pub fn map_error<F>(self, f: impl FnMut(E) -> F) -> Exit<F, A> {
        match self {
            Exit::Success(a) => Exit::Success(a),
            Exit::Failure(cause) => Exit::Failure(cause.map(f)),
        }
    }

    /// Drop the value.
    pub fn as_unit(self) -> Exit<E, ()> {
        self.map(|_| ())
    }

    /// Combine two exits of sequential computations.
    pub fn zip<B>(self, other: Exit<E, B>) -> Exit<E, (A, B)> {
        match (self, other) {
            (Exit::Success(a), Exit::Success(b)) => Exit::Success((a, b)),
            (left, right) => Exit::Failure(left.into_cause().then(right.into_cause())),
        }
    }

    /// Combine two exits of concurrent computations.
    pub fn zip_par<B>(self, other: Exit<E, B>) -> Exit<E, (A, B)> {
        match (self, other) {
            (Exit::Success(a), Exit::Success(b)) => Exit::Success((a, b)),
            (left, right) => Exit::Failure(left.into_cause().both(right.into_cause())),
        }
    }

    /// Sequence the outcome of a finalizer after this exit.
    ///
    /// A failing finalizer turns a success into a failure and is appended
    /// after an existing failure.
    pub(crate) fn with_finalizer(self, finalizer: Exit<Infallible, ()>) -> Self {
        match (self, finalizer) {
            (exit, Exit::Success(())) => exit,
            (Exit::Success(_), Exit::Failure(c)) => Exit::Failure(c.widen()),
            (Exit::Failure(first), Exit::Failure(c)) => Exit::Failure(first.then(c.widen())),
        }
    }
}

impl<E: Failure, A> Exit<E, A> {
    /// The exit as finalizers see it.
    pub fn to_any_exit(&self) -> AnyExit {
        match self {
            Exit::Success(_) => Exit::Success(()),
            Exit::Failure(cause) => Exit::Failure(cause.clone().erase()),
        }
    }
}

impl<E, A> From<Result<A, E>> for Exit<E, A> {
    fn from(result: Result<A, E>) -> Self {
        match result {
            Ok(a) => Exit::Success(a),
            Err(e) => Exit::fail(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_predicates() {
        let ok: Exit<String, i32> = Exit::succeed(1);
        assert!(ok.is_success());
        assert_eq!(ok.value(), Some(&1));
        assert!(ok.cause().is_none());

        let interrupted: Exit<String, i32> = Exit::interrupt(FiberId::NONE);
        assert!(interrupted.is_failure());
        assert!(interrupted.is_interrupted());
    }

    #[test]
    fn test_zip_par_keeps_both_causes() {
        let left: Exit<&str, i32> = Exit::die("d1");
        let right: Exit<&str, i32> = Exit::die("d2");
        let zipped = left.zip_par(right);
        assert_eq!(
            zipped,
            Exit::Failure(Cause::die("d2").both(Cause::die("d1")))
        );
    }

    #[test]
    fn test_zip_sequential_order() {
        let left: Exit<&str, ()> = Exit::fail("a");
        let right: Exit<&str, ()> = Exit::succeed(());
        assert_eq!(left.zip(right), Exit::fail("a"));
    }

    #[test]
    fn test_with_finalizer() {
        let ok: Exit<&str, i32> = Exit::succeed(5);
        assert_eq!(ok.clone().with_finalizer(Exit::succeed(())), Exit::succeed(5));

        let failed_fin = ok.with_finalizer(Exit::die("fin"));
        assert_eq!(failed_fin, Exit::die("fin"));

        let failed: Exit<&str, i32> = Exit::fail("boom");
        assert_eq!(
            failed.with_finalizer(Exit::die("fin")),
            Exit::Failure(Cause::fail("boom").then(Cause::die("fin")))
        );
    }

    #[test]
    fn test_from_result() {
        let exit: Exit<String, i32> = Err("bad".to_string()).into();
        assert_eq!(exit.into_result(), Err(Cause::fail("bad".to_string())));
    }

    #[test]
    fn test_to_any_exit() {
        let exit: Exit<String, i32> = Exit::fail("bad".to_string());
        let any = exit.to_any_exit();
        let cause = any.into_cause();
        assert_eq!(
            cause.failures()[0].downcast_ref::<String>().map(String::as_str),
            Some("bad")
        );
    }
}
