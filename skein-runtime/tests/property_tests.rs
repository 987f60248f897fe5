//! Property-based tests for causes and exits.
//!
//! Uses proptest to generate random cause trees and verify the algebra
//! holds under semantic equality.

use proptest::prelude::*;
use skein_runtime::{Cause, Exit, FiberId};

/// Strategy for generating leaves, including the empty cause.
fn leaf() -> impl Strategy<Value = Cause<u8>> {
    prop_oneof![
        Just(Cause::Empty),
        any::<u8>().prop_map(Cause::fail),
        "[a-z]{1,4}".prop_map(|message: String| Cause::die(message)),
        Just(Cause::interrupt(FiberId::NONE)),
    ]
}

/// Strategy for generating cause trees up to a few levels deep.
fn cause() -> impl Strategy<Value = Cause<u8>> {
    leaf().prop_recursive(4, 32, 2, |inner| {
        prop_oneof![
            (inner.clone(), inner.clone()).prop_map(|(a, b)| a.then(b)),
            (inner.clone(), inner).prop_map(|(a, b)| a.both(b)),
        ]
    })
}

fn interrupt_count(cause: &Cause<u8>) -> usize {
    match cause {
        Cause::Interrupt(_) => 1,
        Cause::Then(l, r) | Cause::Both(l, r) => interrupt_count(l) + interrupt_count(r),
        _ => 0,
    }
}

fn leaf_count(cause: &Cause<u8>) -> usize {
    cause.failures().len() + cause.defects().len() + interrupt_count(cause)
}

proptest! {
    /// Empty is the identity of both compositions
    #[test]
    fn empty_is_identity(a in cause()) {
        prop_assert_eq!(a.clone().then(Cause::Empty), a.clone());
        prop_assert_eq!(Cause::Empty.then(a.clone()), a.clone());
        prop_assert_eq!(a.clone().both(Cause::Empty), a.clone());
        prop_assert_eq!(Cause::Empty.both(a.clone()), a);
    }

    /// Sequential composition is associative
    #[test]
    fn then_is_associative(a in cause(), b in cause(), c in cause()) {
        let left = a.clone().then(b.clone()).then(c.clone());
        let right = a.then(b.then(c));
        prop_assert_eq!(left, right);
    }

    /// Parallel composition is associative and commutative
    #[test]
    fn both_is_associative_and_commutative(a in cause(), b in cause(), c in cause()) {
        prop_assert_eq!(a.clone().both(b.clone()), b.clone().both(a.clone()));
        let left = a.clone().both(b.clone()).both(c.clone());
        let right = a.both(b.both(c));
        prop_assert_eq!(left, right);
    }

    /// Composition never discards a leaf
    #[test]
    fn composition_keeps_every_leaf(a in cause(), b in cause()) {
        let total = leaf_count(&a) + leaf_count(&b);
        prop_assert_eq!(leaf_count(&a.clone().then(b.clone())), total);
        prop_assert_eq!(leaf_count(&a.both(b)), total);
    }

    /// Emptiness agrees with the leaf count
    #[test]
    fn empty_iff_no_leaves(a in cause()) {
        prop_assert_eq!(a.is_empty(), leaf_count(&a) == 0);
    }

    /// Sequential zip of exits keeps the causes in order
    #[test]
    fn exit_zip_sequences_causes(a in cause(), b in cause()) {
        prop_assume!(!a.is_empty() && !b.is_empty());
        let zipped = Exit::<u8, ()>::fail_cause(a.clone()).zip(Exit::<u8, ()>::fail_cause(b.clone()));
        prop_assert_eq!(zipped.into_cause(), a.then(b));
    }

    /// Mapping failures keeps the shape
    #[test]
    fn map_preserves_leaves(a in cause()) {
        let mapped = a.clone().map(u16::from);
        prop_assert_eq!(mapped.failures().len(), a.failures().len());
        prop_assert_eq!(mapped.defects().len(), a.defects().len());
        prop_assert_eq!(mapped.is_empty(), a.is_empty());
    }
}
