//! # Racing and Parallel Composition
//!
//! Combinators that run effects in sibling fibers. Each one forks its
//! branches inside an uninterruptible mask, waits interruptibly, then
//! interrupts and awaits every branch before it continues, so no branch
//! outlives the combinator.

use std::convert::Infallible;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use crate::cause::{Cause, Failure};
use crate::deferred::Deferred;
use crate::effect::Effect;
use crate::exit::Exit;
use crate::fiber::FiberHandle;

type Branch = FiberHandle<(), Infallible>;

/// Record the exit of `effect` in `cell`.
fn settle<A, E>(effect: Effect<A, E>, cell: Deferred<A, E>) -> Effect<(), Infallible>
where
    A: Clone + Send + 'static,
    E: Failure,
{
    effect.exit().map(move |exit| {
        cell.try_complete(exit);
    })
}

/// Interrupt both branches and wait for them to finish.
fn shut_down<E: Failure>(
    left: Branch,
    right: Branch,
) -> Effect<(Exit<Infallible, ()>, Exit<Infallible, ()>), E> {
    left.interrupt_fork::<E>()
        .zip_right(right.interrupt_fork())
        .zip_right(left.await_exit().zip(right.await_exit()))
}

fn own_failure<E>(cause: &Cause<E>) -> bool {
    !cause.is_empty() && !cause.is_interrupted_only()
}

/// Combine the exits of two parallel branches. A branch that only reports
/// the interruption caused by its sibling's failure is dropped.
fn combine_par<E, A, B>(left: Exit<E, A>, right: Exit<E, B>) -> Exit<E, (A, B)> {
    match (left, right) {
        (Exit::Success(a), Exit::Success(b)) => Exit::Success((a, b)),
        (left, right) => {
            let left = left.into_cause();
            let right = right.into_cause();
            let cause = if left.is_interrupted_only() && own_failure(&right) {
                right
            } else if right.is_interrupted_only() && own_failure(&left) {
                left
            } else {
                left.both(right)
            };
            Exit::Failure(cause)
        }
    }
}

impl<A: Send + 'static, E: Failure> Effect<A, E> {
    /// Run both effects concurrently; the first to finish, successfully or
    /// not, wins and the other is interrupted.
    ///
    /// The loser is awaited before the result is returned. If the calling
    /// fiber is interrupted while waiting, both are interrupted.
    pub fn race(self, that: Effect<A, E>) -> Effect<A, E>
    where
        A: Clone,
    {
        Effect::uninterruptible_mask(move |restore| {
            let winner = Deferred::<A, E>::new();
            let left = settle(restore.apply(self), winner.clone());
            let right = settle(restore.apply(that), winner.clone());
            left.fork::<E>().zip(right.fork()).flat_map(move |(left, right)| {
                restore
                    .apply(winner.wait_exit::<E>())
                    .exit()
                    .widen()
                    .flat_map(move |waited| {
                        shut_down(left, right).zip_right(Effect::from_exit(match waited {
                            Exit::Success(exit) => exit,
                            Exit::Failure(cause) => Exit::Failure(cause),
                        }))
                    })
            })
        })
    }

    /// Run both effects concurrently and pair their values.
    ///
    /// The first failure interrupts the other branch. When both fail on
    /// their own, the causes are combined with `both`.
    pub fn zip_par<B>(self, that: Effect<B, E>) -> Effect<(A, B), E>
    where
        A: Clone,
        B: Clone + Send + 'static,
    {
        Effect::uninterruptible_mask(move |restore| {
            let left_cell = Deferred::<A, E>::new();
            let right_cell = Deferred::<B, E>::new();
            let done = Deferred::<(), Infallible>::new();
            let remaining = Arc::new(AtomicUsize::new(2));

            let signal = |done: Deferred<(), Infallible>, remaining: Arc<AtomicUsize>| {
                move |failed: bool| {
                    if failed || remaining.fetch_sub(1, Ordering::AcqRel) == 1 {
                        done.try_complete(Exit::succeed(()));
                    }
                }
            };
            let left_signal = signal(done.clone(), Arc::clone(&remaining));
            let right_signal = signal(done.clone(), remaining);

            let cell = left_cell.clone();
            let left = restore.apply(self).exit().map(move |exit| {
                let failed = exit.is_failure();
                cell.try_complete(exit);
                left_signal(failed);
            });
            let cell = right_cell.clone();
            let right = restore.apply(that).exit().map(move |exit| {
                let failed = exit.is_failure();
                cell.try_complete(exit);
                right_signal(failed);
            });

            left.fork::<E>().zip(right.fork()).flat_map(move |(lf, rf)| {
                restore
                    .apply(done.wait_exit::<E>())
                    .exit()
                    .widen()
                    .flat_map(move |waited: Exit<E, Exit<Infallible, ()>>| {
                        shut_down(lf, rf).flat_map(move |(lx, rx)| {
                            if let Exit::Failure(cause) = waited {
                                return Effect::fail_cause(cause);
                            }
                            let left = left_cell
                                .poll()
                                .unwrap_or_else(|| Exit::Failure(lx.into_cause().widen()));
                            let right = right_cell
                                .poll()
                                .unwrap_or_else(|| Exit::Failure(rx.into_cause().widen()));
                            Effect::from_exit(combine_par(left, right))
                        })
                    })
            })
        })
    }
}

/// Run every effect concurrently and collect the values in order.
pub fn collect_all_par<A, E, I>(effects: I) -> Effect<Vec<A>, E>
where
    A: Clone + Send + 'static,
    E: Failure,
    I: IntoIterator<Item = Effect<A, E>>,
{
    effects
        .into_iter()
        .fold(Effect::succeed(Vec::new()), |acc, effect| {
            acc.zip_par(effect).map(|(mut values, value)| {
                values.push(value);
                values
            })
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RuntimeConfig;
    use crate::runtime::Runtime;
    use parking_lot::Mutex;
    use std::time::{Duration, Instant};

    fn runtime() -> Runtime {
        Runtime::new(RuntimeConfig::builder().num_workers(2).build().unwrap()).unwrap()
    }

    #[test]
    fn test_race_failure_wins_and_loser_is_interrupted() {
        let rt = runtime();
        let (tx, rx) = crossbeam_channel::bounded(1);
        let sleeper = Effect::<(), String>::sleep(Duration::from_secs(5))
            .as_value(true)
            .on_interrupt(move || {
                Effect::sync(move || {
                    let _ = tx.send(());
                })
            });
        let start = Instant::now();
        let exit = rt.run(sleeper.race(Effect::fail("boom".to_string())));
        assert_eq!(exit, Exit::fail("boom".to_string()));
        assert!(start.elapsed() < Duration::from_secs(2));
        assert!(rx.try_recv().is_ok());
        assert_eq!(rt.active_fiber_count(), 0);
    }

    #[test]
    fn test_race_first_success_wins() {
        let rt = runtime();
        let slow = Effect::<i32, String>::succeed(1).delay(Duration::from_millis(200));
        let fast = Effect::<i32, String>::succeed(2).delay(Duration::from_millis(5));
        assert_eq!(rt.run(slow.race(fast)), Exit::succeed(2));
    }

    #[test]
    fn test_zip_par_pairs_values() {
        let rt = runtime();
        let left = Effect::<i32, String>::succeed(1).delay(Duration::from_millis(10));
        let right = Effect::<&str, String>::succeed("b");
        assert_eq!(rt.run(left.zip_par(right)), Exit::succeed((1, "b")));
    }

    #[test]
    fn test_zip_par_keeps_both_defects() {
        let rt = runtime();
        let left = Effect::<(), String>::sleep(Duration::from_millis(10))
            .zip_right(Effect::<(), String>::die("d1"))
            .uninterruptible();
        let right = Effect::<(), String>::sleep(Duration::from_millis(20))
            .zip_right(Effect::<(), String>::die("d2"))
            .uninterruptible();
        let exit = rt.run(left.zip_par(right));
        let cause = exit.into_cause();
        let defects: Vec<&str> = cause.defects().iter().map(|d| d.message()).collect();
        assert!(defects.contains(&"d1"));
        assert!(defects.contains(&"d2"));
    }

    #[test]
    fn test_zip_par_failure_interrupts_sibling() {
        let rt = runtime();
        let interrupted = Arc::new(Mutex::new(false));
        let flag = Arc::clone(&interrupted);
        let slow = Effect::<(), String>::never().on_interrupt(move || Effect::sync(move || *flag.lock() = true));
        let failing = Effect::<(), String>::fail("bad".into()).delay(Duration::from_millis(10));
        let exit = rt.run(slow.zip_par(failing));
        assert_eq!(exit, Exit::fail("bad".to_string()));
        assert!(*interrupted.lock());
    }

    #[test]
    fn test_collect_all_par_keeps_order() {
        let rt = runtime();
        let effects = (0..5u64).map(|n| Effect::<u64, String>::succeed(n).delay(Duration::from_millis(10 * (5 - n))));
        assert_eq!(rt.run(collect_all_par(effects)), Exit::succeed(vec![0, 1, 2, 3, 4]));
    }
}
