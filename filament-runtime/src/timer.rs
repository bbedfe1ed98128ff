//! Deadline timer.
//!
//! One background thread per runtime, started on first use, sleeps until
//! the earliest deadline in a min-heap and runs the due callbacks outside
//! the lock. Cancellation removes the callback; the heap entry is skipped
//! when it surfaces.

use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashMap};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Instant;

use parking_lot::{Condvar, Mutex, MutexGuard};

type Callback = Box<dyn FnOnce() + Send>;

/// Handle to a scheduled callback.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TimerKey(u64);

#[derive(Debug, Clone, Eq, PartialEq)]
struct TimerEntry {
    deadline: Instant,
    key: u64,
}

impl Ord for TimerEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        // Reverse ordering for min-heap (earliest deadline first)
        other
            .deadline
            .cmp(&self.deadline)
            .then_with(|| other.key.cmp(&self.key))
    }
}

impl PartialOrd for TimerEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

#[derive(Default)]
struct TimerState {
    heap: BinaryHeap<TimerEntry>,
    callbacks: HashMap<u64, Callback>,
    next_key: u64,
    shutdown: bool,
}

#[derive(Default)]
struct Shared {
    state: Mutex<TimerState>,
    wakeup: Condvar,
}

/// Runs callbacks at deadlines.
#[derive(Default)]
pub struct Timer {
    shared: Arc<Shared>,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl Timer {
    /// Create a timer. No thread is started until the first `schedule`.
    pub fn new() -> Self {
        Self::default()
    }

    /// Run `callback` on the timer thread at or after `deadline`.
    pub fn schedule<F>(&self, deadline: Instant, callback: F) -> TimerKey
    where
        F: FnOnce() + Send + 'static,
    {
        self.ensure_started();
        let mut state = self.shared.state.lock();
        let key = state.next_key;
        state.next_key += 1;
        state.heap.push(TimerEntry { deadline, key });
        state.callbacks.insert(key, Box::new(callback));
        drop(state);
        self.shared.wakeup.notify_one();
        TimerKey(key)
    }

    /// Cancel a callback. `false` if it already ran or was cancelled.
    pub fn cancel(&self, key: TimerKey) -> bool {
        self.shared.state.lock().callbacks.remove(&key.0).is_some()
    }

    /// Callbacks scheduled and not yet run or cancelled.
    pub fn pending(&self) -> usize {
        self.shared.state.lock().callbacks.len()
    }

    /// Stop the timer thread. Pending callbacks are dropped unrun.
    pub fn shutdown(&self) {
        let mut state = self.shared.state.lock();
        state.shutdown = true;
        state.callbacks.clear();
        drop(state);
        self.shared.wakeup.notify_all();
    }

    fn ensure_started(&self) {
        let mut thread = self.thread.lock();
        if thread.is_some() {
            return;
        }
        let shared = Arc::clone(&self.shared);
        match thread::Builder::new()
            .name("filament-timer".to_string())
            .spawn(move || run(&shared))
        {
            Ok(handle) => *thread = Some(handle),
            Err(err) => tracing::error!(error = %err, "failed to spawn timer thread"),
        }
    }
}

fn run(shared: &Shared) {
    let mut state = shared.state.lock();
    loop {
        if state.shutdown {
            return;
        }
        let due = pop_expired(&mut state, Instant::now());
        if !due.is_empty() {
            MutexGuard::unlocked(&mut state, || {
                for callback in due {
                    callback();
                }
            });
            continue;
        }
        match state.heap.peek().map(|entry| entry.deadline) {
            Some(deadline) => {
                shared.wakeup.wait_until(&mut state, deadline);
            }
            None => shared.wakeup.wait(&mut state),
        }
    }
}

fn pop_expired(state: &mut TimerState, now: Instant) -> Vec<Callback> {
    let mut expired = Vec::new();
    while let Some(entry) = state.heap.peek() {
        if entry.deadline > now {
            break;
        }
        let key = entry.key;
        state.heap.pop();
        if let Some(callback) = state.callbacks.remove(&key) {
            expired.push(callback);
        }
    }
    expired
}

impl Drop for Timer {
    fn drop(&mut self) {
        self.shared.state.lock().shutdown = true;
        self.shared.wakeup.notify_all();
        if let Some(handle) = self.thread.get_mut().take() {
            if handle.thread().id() != thread::current().id() {
                let _ = handle.join();
            }
        }
    }
}
