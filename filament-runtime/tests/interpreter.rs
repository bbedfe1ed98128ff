//! Run-loop behaviour observed through the public API: sequencing,
//! failure handling, async suspension, interruption, finalizers, racing,
//! fiber refs and logging.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use filament_runtime::{
    AsyncReply, Cause, Data, Effect, Exit, Fiber, FiberId, FiberRef, FiberStatus, LogLevel, LogRecord, Logger,
    EffectKind, ManualScheduler, Runtime, RuntimeConfig, Supervisor, TrackingSupervisor,
};

fn runtime() -> Runtime {
    let config = RuntimeConfig::builder().num_workers(2).build().unwrap();
    Runtime::builder().config(config).without_loggers().build().unwrap()
}

fn wait_until_suspended<A: Data, E: Data>(fiber: &Fiber<A, E>) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while !matches!(fiber.status(), FiberStatus::Suspended { .. }) {
        assert!(Instant::now() < deadline, "fiber never suspended");
        thread::sleep(Duration::from_millis(1));
    }
}

#[test]
fn test_sequencing_left_to_right() {
    let runtime = runtime();
    let order = Arc::new(Mutex::new(Vec::new()));
    let step = {
        let order = Arc::clone(&order);
        move |n: u32| {
            let order = Arc::clone(&order);
            Effect::<u32, ()>::sync(move || {
                order.lock().unwrap().push(n);
                n
            })
        }
    };
    let program = step(1)
        .zip(step(2))
        .flat_map(move |(a, b)| step(3).map(move |c| a + b + c));
    assert_eq!(runtime.run(program).into_result(), Ok(6));
    assert_eq!(*order.lock().unwrap(), vec![1, 2, 3]);
}

#[test]
fn test_catch_all_recovers_failure() {
    let runtime = runtime();
    let program = Effect::<u32, String>::fail("bad".to_string())
        .map(|n| n + 1)
        .catch_all(|err: String| Effect::<u32, ()>::succeed(err.len() as u32));
    assert_eq!(runtime.run(program).into_result(), Ok(3));
}

#[test]
fn test_map_error_rewrites_failure() {
    let runtime = runtime();
    let program = Effect::<u8, u8>::fail(4).map_error(|code: u8| format!("code {}", code));
    let exit = runtime.run(program).map_cause(|cause| cause.map(|message| message.len()));
    assert_eq!(exit.into_result(), Err(Cause::fail(6)));
}

#[test]
fn test_panic_becomes_defect() {
    let runtime = runtime();
    let exit = runtime.run(Effect::<u32, ()>::sync(|| panic!("kaboom")));
    match exit.cause() {
        Some(Cause::Die(defect)) => assert!(defect.message().contains("kaboom")),
        other => panic!("expected a defect, got {:?}", other),
    }
}

#[test]
fn test_async_resumed_from_another_thread() {
    let runtime = runtime();
    let program = Effect::<u32, String>::async_(|callback| {
        thread::spawn(move || {
            thread::sleep(Duration::from_millis(10));
            callback.succeed(7);
        });
        AsyncReply::Pending(None)
    });
    assert_eq!(runtime.run(program.map(|n| n * 6)).into_result(), Ok(42));
}

#[test]
fn test_async_ready_continues_inline() {
    let runtime = runtime();
    let program = Effect::<u32, String>::async_(|_| AsyncReply::Ready(Effect::succeed(5)));
    assert_eq!(runtime.run(program).into_result(), Ok(5));
}

#[test]
fn test_canceler_runs_before_interrupt_exit() {
    let runtime = runtime();
    let cancelled = Arc::new(AtomicBool::new(false));
    let flag = Arc::clone(&cancelled);
    let fiber = runtime.fork(Effect::<(), ()>::async_(move |_| {
        let flag = Arc::clone(&flag);
        AsyncReply::Pending(Some(Effect::sync(move || flag.store(true, Ordering::SeqCst))))
    }));
    wait_until_suspended(&fiber);

    let exit = runtime.run(fiber.interrupt::<()>()).into_result().unwrap();
    assert!(exit.is_interrupted());
    assert!(cancelled.load(Ordering::SeqCst));
}

#[test]
fn test_async_blocking_on_reported() {
    let runtime = runtime();
    let awaited = FiberId::new(0, 99);
    let fiber = runtime.fork(Effect::<(), ()>::async_blocking_on(vec![awaited], |_| AsyncReply::Pending(None)));
    wait_until_suspended(&fiber);

    match fiber.status() {
        FiberStatus::Suspended { blocking_on, .. } => assert_eq!(blocking_on, vec![awaited]),
        other => panic!("expected suspension, got {:?}", other),
    }
    fiber.request_interrupt(FiberId::NONE);
    assert!(runtime.run(fiber.await_exit::<()>()).into_result().unwrap().is_interrupted());
}

#[test]
fn test_sleep_interrupted() {
    let runtime = runtime();
    let cleaned = Arc::new(AtomicBool::new(false));
    let flag = Arc::clone(&cleaned);
    let started = Instant::now();
    let fiber = runtime.fork(
        Effect::<(), ()>::sleep(Duration::from_secs(10))
            .on_interrupt(Effect::sync(move || flag.store(true, Ordering::SeqCst))),
    );
    wait_until_suspended(&fiber);

    let exit = runtime.run(fiber.interrupt::<()>()).into_result().unwrap();
    assert!(exit.is_interrupted());
    assert!(cleaned.load(Ordering::SeqCst));
    assert!(started.elapsed() < Duration::from_secs(5));
}

#[test]
fn test_uninterruptible_region_completes() {
    let runtime = runtime();
    let finished = Arc::new(AtomicBool::new(false));
    let flag = Arc::clone(&finished);
    let fiber = runtime.fork(
        Effect::<(), ()>::sleep(Duration::from_millis(50))
            .zip_right(Effect::sync(move || flag.store(true, Ordering::SeqCst)))
            .uninterruptible()
            .zip_right(Effect::<(), ()>::never()),
    );
    wait_until_suspended(&fiber);

    let exit = runtime.run(fiber.interrupt::<()>()).into_result().unwrap();
    assert!(exit.is_interrupted());
    assert!(finished.load(Ordering::SeqCst));
}

#[test]
fn test_finalizer_runs_once_and_merges_failure() {
    let runtime = runtime();
    let runs = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&runs);
    let program = Effect::<(), String>::fail("boom".to_string()).ensuring(
        Effect::sync(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        })
        .zip_right(Effect::die("finalizer")),
    );
    let exit = runtime.run(program);
    assert_eq!(runs.load(Ordering::SeqCst), 1);
    assert_eq!(
        exit.cause(),
        Some(&Cause::fail("boom".to_string()).then(Cause::die("finalizer")))
    );
}

#[test]
fn test_finalizer_runs_on_success() {
    let runtime = runtime();
    let runs = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&runs);
    let program = Effect::<u8, ()>::succeed(1).ensuring(Effect::sync(move || {
        counter.fetch_add(1, Ordering::SeqCst);
    }));
    assert_eq!(runtime.run(program).into_result(), Ok(1));
    assert_eq!(runs.load(Ordering::SeqCst), 1);
}

#[test]
fn test_race_first_completion_wins() {
    let runtime = runtime();
    let slow = Effect::<(), ()>::sleep(Duration::from_secs(10)).map(|_| 1u32);
    let started = Instant::now();
    let exit = runtime.run(slow.race(Effect::succeed(2)));
    assert_eq!(exit.into_result(), Ok(2));
    assert!(started.elapsed() < Duration::from_secs(5));
}

#[test]
fn test_timeout() {
    let runtime = runtime();
    let timed_out = runtime.run(Effect::<u32, ()>::never().timeout(Duration::from_millis(20)));
    assert_eq!(timed_out.into_result(), Ok(None));
    let in_time = runtime.run(Effect::<u32, ()>::succeed(3).timeout(Duration::from_secs(5)));
    assert_eq!(in_time.into_result(), Ok(Some(3)));
}

#[test]
fn test_max_op_count_bounds_quantum() {
    let scheduler = Arc::new(ManualScheduler::new());
    let tracker = Arc::new(TrackingSupervisor::new());
    let config = RuntimeConfig::builder().max_op_count(100).build().unwrap();
    let runtime = Runtime::builder()
        .config(config)
        .scheduler(Arc::clone(&scheduler))
        .supervisor(Arc::clone(&tracker))
        .without_loggers()
        .build()
        .unwrap();

    let fiber = runtime.fork(Effect::<(), ()>::unit().repeat_n(10_000));
    assert!(scheduler.run_one());
    assert_eq!(tracker.effect_count(), 100);
    assert_eq!(tracker.quantum_count(), 1);
    assert_eq!(scheduler.pending(), 1);
    assert!(fiber.poll().is_none());

    scheduler.run_until_idle();
    assert!(fiber.poll().map_or(false, |exit| exit.is_success()));
}

#[test]
fn test_yield_reschedules() {
    let scheduler = Arc::new(ManualScheduler::new());
    let runtime = Runtime::builder()
        .scheduler(Arc::clone(&scheduler))
        .without_loggers()
        .build()
        .unwrap();
    let fiber = runtime.fork(Effect::<(), ()>::yield_now().zip_right(Effect::succeed(9u8)));
    assert!(scheduler.run_one());
    assert_eq!(scheduler.pending(), 1);
    scheduler.run_until_idle();
    assert_eq!(fiber.poll().and_then(|exit| exit.value().copied()), Some(9));
}

#[test]
fn test_fiber_ref_inherited_and_restored() {
    let runtime = runtime();
    let tag = FiberRef::new(1u32);
    let child_view = tag.clone();
    let inner = tag.clone();
    let program = tag
        .locally(5, child_view.get::<()>().fork().flat_map(|fiber: Fiber<u32, ()>| fiber.join()))
        .zip(inner.get());
    assert_eq!(runtime.run(program).into_result(), Ok((5, 1)));
}

#[test]
fn test_join_propagates_failure() {
    let runtime = runtime();
    let program = Effect::<u32, String>::fail("child".to_string())
        .fork()
        .flat_map(|fiber: Fiber<u32, String>| fiber.join());
    assert_eq!(runtime.run(program).into_result(), Err(Cause::fail("child".to_string())));
}

type Captured = (LogLevel, String, BTreeMap<String, String>, Vec<String>, Option<String>);

#[derive(Default)]
struct CaptureLogger {
    records: Mutex<Vec<Captured>>,
}

impl Logger for CaptureLogger {
    fn log(&self, record: &LogRecord<'_>) {
        let spans = record.spans.iter().map(|span| span.label.clone()).collect();
        self.records.lock().unwrap().push((
            record.level,
            (record.message)(),
            record.annotations.clone(),
            spans,
            (record.cause)(),
        ));
    }
}

#[test]
fn test_log_carries_annotations_and_spans() {
    let logger = Arc::new(CaptureLogger::default());
    let runtime = Runtime::builder().logger(Arc::clone(&logger)).build().unwrap();
    let program = Effect::<(), ()>::log(LogLevel::Info, "hello")
        .log_annotate("request", "42")
        .log_span("handler");
    assert!(runtime.run(program).is_success());

    let records = logger.records.lock().unwrap();
    assert_eq!(records.len(), 1);
    let (level, message, annotations, spans, cause) = &records[0];
    assert_eq!(*level, LogLevel::Info);
    assert_eq!(message, "hello");
    assert_eq!(annotations.get("request").map(String::as_str), Some("42"));
    assert_eq!(spans, &vec!["handler".to_string()]);
    assert!(cause.is_none());
}

#[test]
fn test_log_cause_renders_cause() {
    let logger = Arc::new(CaptureLogger::default());
    let runtime = Runtime::builder().logger(Arc::clone(&logger)).build().unwrap();
    let program = Effect::<(), ()>::log_cause(LogLevel::Warn, "recovered", Cause::fail("disk".to_string()));
    assert!(runtime.run(program).is_success());

    let records = logger.records.lock().unwrap();
    let (level, message, _, _, cause) = &records[0];
    assert_eq!(*level, LogLevel::Warn);
    assert_eq!(message, "recovered");
    assert_eq!(cause.as_deref(), Some("Fail(\"disk\")"));
}

#[test]
fn test_unhandled_failure_reported() {
    let logger = Arc::new(CaptureLogger::default());
    let runtime = Runtime::builder().logger(Arc::clone(&logger)).build().unwrap();
    let exit: Exit<String, ()> = runtime.run(Effect::fail("lost".to_string()));
    assert!(!exit.is_success());

    let records = logger.records.lock().unwrap();
    let (level, message, _, _, cause) = records.last().unwrap();
    assert_eq!(*level, LogLevel::Debug);
    assert_eq!(message, "Fiber failed with an unhandled error");
    assert!(cause.as_deref().unwrap_or_default().contains("Fail(\"lost\")"));
}

#[test]
fn test_logger_panic_is_contained() {
    struct Exploding;
    impl Logger for Exploding {
        fn log(&self, _record: &LogRecord<'_>) {
            panic!("logger broke");
        }
    }
    let runtime = Runtime::builder().logger(Arc::new(Exploding)).build().unwrap();
    let program = Effect::<(), ()>::log(LogLevel::Error, "ignored").zip_right(Effect::succeed(1u8));
    assert_eq!(runtime.run(program).into_result(), Ok(1));
}

#[test]
fn test_supervisor_panic_does_not_change_outcome() {
    struct Exploding;
    impl Supervisor for Exploding {
        fn on_start(&self, _fiber: FiberId, _parent: Option<FiberId>) {
            panic!("on_start broke");
        }
        fn on_effect(&self, _fiber: FiberId, _kind: EffectKind) {
            panic!("on_effect broke");
        }
        fn on_resume(&self, _fiber: FiberId) {
            panic!("on_resume broke");
        }
    }
    let runtime = Runtime::builder()
        .supervisor(Arc::new(Exploding))
        .without_loggers()
        .build()
        .unwrap();
    let program = Effect::<u8, ()>::succeed(20)
        .flat_map(|n| Effect::succeed(n + 1))
        .fork::<()>()
        .flat_map(|fiber: Fiber<u8, ()>| fiber.join());
    assert_eq!(runtime.run(program).into_result(), Ok(21));
}
