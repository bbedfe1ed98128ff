//! Transactions under real contention on the work-stealing scheduler.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use filament_runtime::{atomically, Effect, Fiber, Runtime, RuntimeConfig, Stm, TRef};

fn runtime() -> Runtime {
    let config = RuntimeConfig::builder().num_workers(4).build().unwrap();
    Runtime::builder().config(config).without_loggers().build().unwrap()
}

fn increment_n(counter: &TRef<u64>, n: usize) -> Effect<(), ()> {
    atomically::<(), ()>(counter.update(|value| value + 1)).repeat_n(n)
}

#[test]
fn test_concurrent_increments_are_not_lost() {
    let runtime = runtime();
    let counter = TRef::new(0u64);
    let program = increment_n(&counter, 1000)
        .fork::<()>()
        .zip(increment_n(&counter, 1000).fork())
        .flat_map(|(left, right): (Fiber<(), ()>, Fiber<(), ()>)| left.join().zip_right(right.join()));

    assert!(runtime.run(program).is_success());
    assert_eq!(counter.snapshot(), 2000);
}

#[test]
fn test_retry_wakes_across_threads() {
    let runtime = Arc::new(runtime());
    let gate = TRef::new(None::<String>);

    let waiter = {
        let gate = gate.clone();
        runtime.fork(atomically::<String, ()>(gate.get().flat_map(|value| match value {
            Some(message) => Stm::succeed(message),
            None => Stm::retry(),
        })))
    };
    thread::sleep(Duration::from_millis(20));
    assert!(waiter.poll().is_none());

    let writer = {
        let runtime = Arc::clone(&runtime);
        let gate = gate.clone();
        thread::spawn(move || runtime.run(gate.set::<()>(Some("open".to_string())).commit()))
    };
    assert!(writer.join().unwrap().is_success());
    assert_eq!(runtime.run(waiter.join()).into_result(), Ok("open".to_string()));
}

fn diverge() -> Stm<u64, ()> {
    Stm::suspend(diverge)
}

#[test]
fn test_inconsistent_read_is_rerun() {
    let runtime = runtime();
    let a = TRef::new(0u64);
    let b = TRef::new(0u64);
    let read_a = Arc::new(AtomicBool::new(false));
    let committed = Arc::new(AtomicBool::new(false));

    // The first attempt sees a = 0 and, after the writer commits, b = 1.
    let reader = {
        let (b, read_a, committed) = (b.clone(), Arc::clone(&read_a), Arc::clone(&committed));
        a.get().flat_map(move |x| {
            if !read_a.swap(true, Ordering::SeqCst) {
                while !committed.load(Ordering::SeqCst) {
                    thread::yield_now();
                }
            }
            b.get().flat_map(move |y| if x == y { Stm::succeed(x) } else { diverge() })
        })
    };
    let waiter = runtime.fork(atomically::<u64, ()>(reader));

    while !read_a.load(Ordering::SeqCst) {
        thread::yield_now();
    }
    let writer = runtime.run(a.set::<()>(1).zip_right(b.set(1)).commit());
    assert!(writer.is_success());
    committed.store(true, Ordering::SeqCst);

    let deadline = Instant::now() + Duration::from_secs(5);
    while waiter.poll().is_none() {
        assert!(Instant::now() < deadline, "transaction with an inconsistent read never finished");
        thread::sleep(Duration::from_millis(1));
    }
    assert_eq!(runtime.run(waiter.join()).into_result(), Ok(1));
}

#[test]
fn test_transfers_preserve_total() {
    let runtime = runtime();
    let accounts: Vec<TRef<i64>> = (0..4).map(|_| TRef::new(100)).collect();

    let transfer = |from: &TRef<i64>, to: &TRef<i64>, amount: i64| {
        let (from, to) = (from.clone(), to.clone());
        atomically::<(), ()>(from.get().flat_map(move |balance| {
            let (from, to) = (from.clone(), to.clone());
            if balance >= amount {
                from.set(balance - amount).zip_right(to.update(move |n| n + amount))
            } else {
                Stm::succeed(())
            }
        }))
    };
    let mut fibers = Vec::new();
    for round in 0..50usize {
        let from = &accounts[round % 4];
        let to = &accounts[(round + 1) % 4];
        fibers.push(runtime.fork(transfer(from, to, (round % 7) as i64 + 1)));
    }
    for fiber in fibers {
        assert!(runtime.run(fiber.join()).is_success());
    }

    let total = runtime
        .run(atomically::<i64, ()>(accounts.iter().fold(Stm::succeed(0), |sum, account| {
            let account = account.clone();
            sum.flat_map(move |acc| account.get().map(move |n| acc + n))
        })))
        .into_result()
        .unwrap();
    assert_eq!(total, 400);
    assert!(accounts.iter().all(|account| account.snapshot() >= 0));
}
