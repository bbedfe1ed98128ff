//! Property-based tests for the Filament runtime.
//!
//! Uses proptest to generate random inputs and verify invariants hold.

use std::sync::OnceLock;

use filament_runtime::{Cause, Effect, FiberId, Runtime, RuntimeConfig, Stm, TRef};
use proptest::prelude::*;

/// One runtime shared by every case; building a pool per case is slow.
fn runtime() -> &'static Runtime {
    static RUNTIME: OnceLock<Runtime> = OnceLock::new();
    RUNTIME.get_or_init(|| {
        let config = RuntimeConfig::builder().num_workers(2).build().unwrap();
        Runtime::builder().config(config).without_loggers().build().unwrap()
    })
}

/// Strategy for generating causes up to a small depth
fn cause() -> impl Strategy<Value = Cause<u8>> {
    let leaf = prop_oneof![
        Just(Cause::empty()),
        any::<u8>().prop_map(Cause::fail),
        "[a-z]{1,8}".prop_map(|message: String| Cause::die(message)),
        (1u64..100).prop_map(|seq| Cause::interrupt(FiberId::new(0, seq))),
    ];
    leaf.prop_recursive(3, 16, 2, |inner| {
        prop_oneof![
            (inner.clone(), inner.clone()).prop_map(|(l, r)| l.then(r)),
            (inner.clone(), inner).prop_map(|(l, r)| l.both(r)),
        ]
    })
}

/// Strategy for a sequence of effect steps: `Ok` adds, `Err` fails
fn steps() -> impl Strategy<Value = Vec<Result<i64, u8>>> {
    prop::collection::vec(
        prop_oneof![
            4 => (-100i64..100).prop_map(Ok),
            1 => any::<u8>().prop_map(Err),
        ],
        0..20,
    )
}

fn build(steps: &[Result<i64, u8>]) -> Effect<i64, u8> {
    steps.iter().fold(Effect::succeed(0), |acc, step| match *step {
        Ok(n) => acc.map(move |sum| sum + n),
        Err(e) => acc.zip_right(Effect::fail(e)),
    })
}

proptest! {
    /// The empty cause is an identity for both compositions
    #[test]
    fn cause_empty_is_identity(c in cause()) {
        prop_assert_eq!(Cause::empty().then(c.clone()), c.clone());
        prop_assert_eq!(c.clone().then(Cause::empty()), c.clone());
        prop_assert_eq!(Cause::empty().both(c.clone()), c.clone());
        prop_assert_eq!(c.clone().both(Cause::empty()), c);
    }

    /// Composition keeps every failure of both sides, left first
    #[test]
    fn cause_then_keeps_failures(a in cause(), b in cause()) {
        let expected: Vec<u8> = a.failures().into_iter().chain(b.failures()).copied().collect();
        let combined = a.clone().then(b.clone());
        let actual: Vec<u8> = combined.failures().into_iter().copied().collect();
        prop_assert_eq!(actual, expected);
        prop_assert!(combined.contains(&a));
        prop_assert!(combined.contains(&b));
    }

    /// Interruption-only causes stay interruption-only when combined
    #[test]
    fn cause_interrupt_only_closed(x in 1u64..100, y in 1u64..100) {
        let a = Cause::<u8>::interrupt(FiberId::new(0, x));
        let b = Cause::<u8>::interrupt(FiberId::new(0, y));
        let both = a.both(b);
        prop_assert!(both.is_interrupted_only());
        prop_assert!(!both.is_failure());
    }

    /// Stripping failures leaves no typed failure behind
    #[test]
    fn cause_strip_failures(c in cause()) {
        let defects = c.defects().len();
        let stripped = c.strip_failures();
        prop_assert!(stripped.failures().is_empty());
        prop_assert_eq!(stripped.defects().len(), defects);
    }

    /// A pipeline of maps and failures matches the same fold over results
    #[test]
    fn effect_matches_result_fold(steps in steps()) {
        let expected = steps.iter().try_fold(0i64, |sum, step| step.map(|n| sum + n));
        let actual = runtime().run(build(&steps)).into_result();
        prop_assert_eq!(actual, expected.map_err(Cause::fail));
    }

    /// Left identity: succeed(a).flat_map(f) == f(a)
    #[test]
    fn effect_flat_map_left_identity(a in any::<i32>(), k in any::<i32>()) {
        let f = move |n: i32| Effect::<i64, ()>::succeed(n as i64 * k as i64);
        let left = runtime().run(Effect::succeed(a).flat_map(f)).into_result();
        let right = runtime().run(f(a)).into_result();
        prop_assert_eq!(left, right);
    }

    /// catch_all recovers exactly the typed failure
    #[test]
    fn effect_catch_all_sees_error(e in any::<u8>()) {
        let program = Effect::<u8, u8>::fail(e).catch_all(|err: u8| Effect::<u8, ()>::succeed(err));
        prop_assert_eq!(runtime().run(program).into_result(), Ok(e));
    }

    /// After committing a set, the cell holds the value
    #[test]
    fn stm_set_then_snapshot(initial in any::<i64>(), next in any::<i64>()) {
        let tref = TRef::new(initial);
        prop_assert!(runtime().run(tref.set::<()>(next).commit()).is_success());
        prop_assert_eq!(tref.snapshot(), next);
    }

    /// A transaction sees its own writes and a failure discards them all
    #[test]
    fn stm_failure_is_all_or_nothing(values in prop::collection::vec(any::<u16>(), 1..8)) {
        let cells: Vec<TRef<u16>> = values.iter().map(|_| TRef::new(0)).collect();
        let writes = cells.iter().zip(values.iter()).fold(Stm::<(), u8>::succeed(()), |acc, (cell, v)| {
            acc.zip_right(cell.set(*v))
        });
        let last = cells[cells.len() - 1].clone();
        let expected = values[values.len() - 1];
        let program = writes.zip_right(last.get()).flat_map(move |seen| {
            if seen == expected { Stm::fail(1) } else { Stm::fail(2) }
        });

        let exit = runtime().run::<(), u8>(program.commit());
        prop_assert_eq!(exit.into_result(), Err(Cause::fail(1)));
        prop_assert!(cells.iter().all(|cell| cell.snapshot() == 0));
    }

    /// The builder accepts exactly the positive settings
    #[test]
    fn config_builder_validates(workers in 0usize..8, ops in 0usize..4096) {
        let built = RuntimeConfig::builder().num_workers(workers).max_op_count(ops).build();
        prop_assert_eq!(built.is_ok(), workers > 0 && ops > 0);
        if let Ok(config) = built {
            prop_assert_eq!(config.num_workers, workers);
            prop_assert_eq!(config.max_op_count, ops);
        }
    }
}
