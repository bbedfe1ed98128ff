//! # Task Schedulers
//!
//! The interpreter never blocks a thread: it hands each fiber quantum to a
//! [`Scheduler`] as a task and returns. Two implementations:
//!
//! - [`WorkStealingScheduler`]: M:N scheduling over a fixed pool of worker
//!   threads, each with a local deque, a global injection queue for tasks
//!   submitted from outside, and stealing between workers.
//! - [`ManualScheduler`]: a FIFO queue that only runs when told to, for
//!   deterministic tests.
//!
//! ## Technical References
//!
//! - [Chase-Lev Deque](https://doi.org/10.1145/1073970.1073974)
//! - [crossbeam-deque](https://docs.rs/crossbeam-deque)
//! - [Tokio Scheduler](https://tokio.rs/blog/2019-10-scheduler)

use std::collections::VecDeque;
use std::io;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam_deque::{Injector, Steal, Stealer, Worker as Deque};
use parking_lot::{Condvar, Mutex};

/// A unit of work: usually one fiber quantum.
pub type Task = Box<dyn FnOnce() + Send + 'static>;

/// Runs tasks, eventually.
pub trait Scheduler: Send + Sync {
    /// Queue `task` for execution. Must not run it inline.
    fn schedule_task(&self, task: Task);

    /// Stop accepting work. Default: nothing to stop.
    fn shutdown(&self) {}
}

/// How long an idle worker sleeps before looking for stolen work again.
const IDLE_TIMEOUT: Duration = Duration::from_millis(50);

struct Shared {
    /// Global injection queue.
    injector: Injector<Task>,
    /// Stealers for every worker's local deque.
    stealers: Vec<Stealer<Task>>,
    /// Shutdown flag.
    shutdown: AtomicBool,
    /// Number of parked workers.
    idle: Mutex<usize>,
    wakeup: Condvar,
    /// Tasks run to completion.
    executed: AtomicU64,
}

impl Shared {
    fn notify(&self) {
        let idle = self.idle.lock();
        if *idle > 0 {
            self.wakeup.notify_one();
        }
    }
}

/// Work-stealing scheduler over a fixed pool of worker threads.
pub struct WorkStealingScheduler {
    shared: Arc<Shared>,
    threads: Mutex<Vec<JoinHandle<()>>>,
}

impl WorkStealingScheduler {
    /// Start `num_workers` worker threads (at least one).
    pub fn new(num_workers: usize) -> io::Result<Self> {
        let num_workers = num_workers.max(1);
        let deques: Vec<Deque<Task>> = (0..num_workers).map(|_| Deque::new_fifo()).collect();
        let shared = Arc::new(Shared {
            injector: Injector::new(),
            stealers: deques.iter().map(Deque::stealer).collect(),
            shutdown: AtomicBool::new(false),
            idle: Mutex::new(0),
            wakeup: Condvar::new(),
            executed: AtomicU64::new(0),
        });

        let scheduler = Self {
            shared: Arc::clone(&shared),
            threads: Mutex::new(Vec::with_capacity(num_workers)),
        };

        for (id, deque) in deques.into_iter().enumerate() {
            let worker = Worker {
                id,
                shared: Arc::clone(&shared),
            };
            let handle = thread::Builder::new()
                .name(format!("filament-worker-{}", id))
                .spawn(move || worker.run_loop(deque))?;
            scheduler.threads.lock().push(handle);
        }

        tracing::debug!(num_workers, "work-stealing scheduler started");
        Ok(scheduler)
    }

    /// Get the number of workers.
    pub fn num_workers(&self) -> usize {
        self.shared.stealers.len()
    }

    /// Check if the scheduler is shutting down.
    pub fn is_shutting_down(&self) -> bool {
        self.shared.shutdown.load(Ordering::Acquire)
    }

    /// Tasks run so far.
    pub fn executed(&self) -> u64 {
        self.shared.executed.load(Ordering::Relaxed)
    }
}

impl Scheduler for WorkStealingScheduler {
    fn schedule_task(&self, task: Task) {
        self.shared.injector.push(task);
        self.shared.notify();
    }

    fn shutdown(&self) {
        self.shared.shutdown.store(true, Ordering::Release);
        let _idle = self.shared.idle.lock();
        self.shared.wakeup.notify_all();
    }
}

impl Drop for WorkStealingScheduler {
    fn drop(&mut self) {
        Scheduler::shutdown(self);
        let current = thread::current().id();
        for handle in self.threads.get_mut().drain(..) {
            if handle.thread().id() != current {
                let _ = handle.join();
            }
        }
    }
}

/// A worker thread in the scheduler.
struct Worker {
    id: usize,
    shared: Arc<Shared>,
}

impl Worker {
    /// Run the worker loop.
    fn run_loop(self, local: Deque<Task>) {
        while !self.shared.shutdown.load(Ordering::Acquire) {
            match self.find_work(&local) {
                Some(task) => {
                    if panic::catch_unwind(AssertUnwindSafe(task)).is_err() {
                        tracing::error!(worker = self.id, "task panicked");
                    }
                    self.shared.executed.fetch_add(1, Ordering::Relaxed);
                }
                None => self.park(),
            }
        }
        tracing::trace!(worker = self.id, "worker stopped");
    }

    /// Find work using work-stealing.
    fn find_work(&self, local: &Deque<Task>) -> Option<Task> {
        // 1. Try local queue first
        if let Some(task) = local.pop() {
            return Some(task);
        }

        // 2. Try global queue, moving a batch into the local deque
        loop {
            match self.shared.injector.steal_batch_and_pop(local) {
                Steal::Success(task) => return Some(task),
                Steal::Empty => break,
                Steal::Retry => continue,
            }
        }

        // 3. Try stealing from other workers
        for (i, stealer) in self.shared.stealers.iter().enumerate() {
            if i == self.id {
                continue;
            }
            loop {
                match stealer.steal() {
                    Steal::Success(task) => return Some(task),
                    Steal::Empty => break,
                    Steal::Retry => continue,
                }
            }
        }

        None
    }

    fn park(&self) {
        let mut idle = self.shared.idle.lock();
        if !self.shared.injector.is_empty() || self.shared.shutdown.load(Ordering::Acquire) {
            return;
        }
        *idle += 1;
        self.shared.wakeup.wait_for(&mut idle, IDLE_TIMEOUT);
        *idle -= 1;
    }
}

/// A scheduler that runs tasks only when asked, in submission order.
#[derive(Default)]
pub struct ManualScheduler {
    queue: Mutex<VecDeque<Task>>,
}

impl ManualScheduler {
    /// Create an empty scheduler.
    pub fn new() -> Self {
        Self::default()
    }

    /// Tasks waiting to run.
    pub fn pending(&self) -> usize {
        self.queue.lock().len()
    }

    /// Run the oldest task. `false` if the queue was empty.
    pub fn run_one(&self) -> bool {
        let task = self.queue.lock().pop_front();
        match task {
            Some(task) => {
                task();
                true
            }
            None => false,
        }
    }

    /// Run tasks until the queue is empty, including tasks queued by the
    /// tasks themselves. Returns how many ran.
    pub fn run_until_idle(&self) -> usize {
        let mut ran = 0;
        while self.run_one() {
            ran += 1;
        }
        ran
    }
}

impl Scheduler for ManualScheduler {
    fn schedule_task(&self, task: Task) {
        self.queue.lock().push_back(task);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicI32;
    use std::sync::mpsc;

    #[test]
    fn test_scheduler_creation() {
        let scheduler = WorkStealingScheduler::new(3).unwrap();
        assert_eq!(scheduler.num_workers(), 3);
        assert!(!scheduler.is_shutting_down());
        let zero = WorkStealingScheduler::new(0).unwrap();
        assert_eq!(zero.num_workers(), 1);
    }

    #[test]
    fn test_multiple_tasks() {
        let scheduler = WorkStealingScheduler::new(4).unwrap();
        let counter = Arc::new(AtomicI32::new(0));
        let (tx, rx) = mpsc::channel();

        for _ in 0..100 {
            let c = counter.clone();
            let tx = tx.clone();
            scheduler.schedule_task(Box::new(move || {
                c.fetch_add(1, Ordering::SeqCst);
                let _ = tx.send(());
            }));
        }

        for _ in 0..100 {
            rx.recv_timeout(Duration::from_secs(5)).unwrap();
        }
        assert_eq!(counter.load(Ordering::SeqCst), 100);
    }

    #[test]
    fn test_panicking_task_does_not_kill_worker() {
        let scheduler = WorkStealingScheduler::new(1).unwrap();
        let (tx, rx) = mpsc::channel();
        scheduler.schedule_task(Box::new(|| panic!("task failure")));
        scheduler.schedule_task(Box::new(move || {
            let _ = tx.send(7);
        }));
        assert_eq!(rx.recv_timeout(Duration::from_secs(5)).unwrap(), 7);
    }

    #[test]
    fn test_manual_scheduler_fifo() {
        let scheduler = Arc::new(ManualScheduler::new());
        let log = Arc::new(Mutex::new(Vec::new()));
        for n in 0..3 {
            let log = log.clone();
            let inner = scheduler.clone();
            scheduler.schedule_task(Box::new(move || {
                log.lock().push(n);
                if n == 0 {
                    let log = log.clone();
                    inner.schedule_task(Box::new(move || log.lock().push(10)));
                }
            }));
        }
        assert_eq!(scheduler.pending(), 3);
        assert!(scheduler.run_one());
        assert_eq!(scheduler.run_until_idle(), 3);
        assert!(!scheduler.run_one());
        assert_eq!(*log.lock(), vec![0, 1, 2, 10]);
    }
}
