//! Commit protocol.
//!
//! ```text
//!   attempt ──► driver ──► Stale ─────────────────────────────► attempt
//!                 │
//!                 ├──────► Retry ─────► journal valid? ──no──► attempt
//!                 │                          │ yes
//!                 │                          ▼
//!                 │                    register todos, suspend
//!                 │                          │ woken by a commit
//!                 │                          ▼
//!                 │                       attempt
//!                 ▼
//!        Succeed/Fail/Die/Interrupt
//!                 │
//!          COMMIT_LOCK: analyze
//!           Invalid ─────────────────────────────► attempt
//!           ReadWrite + Succeed ──► write cells
//!                 │
//!           wake todos, exit
//! ```

use std::collections::HashMap;
use std::panic;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;

use crate::effect::{AsyncCallback, AsyncReply, Data, Effect};
use crate::fiber::{FiberDescriptor, FiberId};
use crate::scheduler::Scheduler;
use crate::stm::driver::{self, StmInstr, TExit};
use crate::stm::journal::{exec_todos, Analysis, Journal, Todo, TxnId, COMMIT_LOCK};
use crate::stm::tref::TRefCell;

/// State shared by every attempt of one `commit`.
///
/// Each watched cell holds one todo for the whole transaction. The todo
/// fires the waker armed by the current suspension, if any.
struct Txn {
    id: TxnId,
    done: AtomicBool,
    tracked: Mutex<HashMap<u64, Arc<TRefCell>>>,
    waker: Mutex<Option<Todo>>,
}

impl Txn {
    fn new() -> Self {
        Self {
            id: TxnId::next(),
            done: AtomicBool::new(false),
            tracked: Mutex::new(HashMap::new()),
            waker: Mutex::new(None),
        }
    }

    fn is_done(&self) -> bool {
        self.done.load(Ordering::Acquire)
    }

    fn arm(&self, resume: Todo) {
        *self.waker.lock() = Some(resume);
    }

    /// Take back the waker. False if a todo already fired it.
    fn disarm(&self) -> bool {
        self.waker.lock().take().is_some()
    }

    fn wake(&self) {
        if self.is_done() {
            return;
        }
        let resume = self.waker.lock().take();
        if let Some(resume) = resume {
            resume();
        }
    }

    /// Watch every cell `journal` read that is not watched yet.
    fn track(self: &Arc<Self>, journal: &Journal) -> usize {
        let txn = Arc::downgrade(self);
        let mut tracked = self.tracked.lock();
        journal.add_todo(self.id, &mut tracked, |cell_id| {
            let txn: Weak<Txn> = Weak::clone(&txn);
            Arc::new(move || {
                if let Some(txn) = txn.upgrade() {
                    // A committer drained this todo from the cell.
                    txn.tracked.lock().remove(&cell_id);
                    txn.wake();
                }
            })
        })
    }

    /// Later todos become no-ops and registrations are withdrawn.
    fn finish(&self) {
        self.done.store(true, Ordering::Release);
        self.waker.lock().take();
        for (_, cell) in self.tracked.lock().drain() {
            cell.remove_todo(self.id);
        }
    }
}

/// Run `program` atomically on the current fiber.
pub(crate) fn commit<A: Data, E: Data>(program: StmInstr) -> Effect<A, E> {
    Effect::descriptor_with(move |descriptor: FiberDescriptor| {
        let txn = Arc::new(Txn::new());
        let scheduler = Arc::clone(&descriptor.platform.scheduler);
        let finished = Arc::clone(&txn);
        try_commit(program.clone(), txn, descriptor.id, scheduler).ensuring(Effect::sync(move || finished.finish()))
    })
}

fn try_commit<A: Data, E: Data>(
    program: StmInstr,
    txn: Arc<Txn>,
    fiber_id: FiberId,
    scheduler: Arc<dyn Scheduler>,
) -> Effect<A, E> {
    Effect::suspend(move || loop {
        let mut journal = Journal::new();
        let outcome = match driver::run(&program, &mut journal, fiber_id) {
            Ok(outcome) => outcome,
            // A panic after an inconsistent read may be caused by it.
            Err(payload) => {
                if journal.is_valid() {
                    panic::resume_unwind(payload);
                }
                continue;
            }
        };

        if let TExit::Stale = outcome {
            tracing::trace!(fiber = %fiber_id, "transaction read went stale, re-running");
            continue;
        }

        if let TExit::Retry = outcome {
            if !journal.is_valid() {
                continue;
            }
            return suspend_until_changed(
                program.clone(),
                Arc::clone(&txn),
                fiber_id,
                Arc::clone(&scheduler),
                journal,
            );
        }

        let committed = {
            let _guard = COMMIT_LOCK.lock();
            match journal.analyze() {
                Analysis::Invalid => false,
                Analysis::ReadWrite => {
                    if let TExit::Succeed(_) = outcome {
                        journal.commit();
                    }
                    true
                }
                Analysis::ReadOnly => true,
            }
        };
        if !committed {
            tracing::trace!(fiber = %fiber_id, "transaction conflict, re-running");
            continue;
        }

        exec_todos(journal.collect_todos(txn.id), &*scheduler);
        return Effect::from_instr(outcome.into_instr());
    })
}

/// Suspend until a cell read by `journal` is committed to, then re-run.
fn suspend_until_changed<A: Data, E: Data>(
    program: StmInstr,
    txn: Arc<Txn>,
    fiber_id: FiberId,
    scheduler: Arc<dyn Scheduler>,
    journal: Journal,
) -> Effect<A, E> {
    let journal = Arc::new(journal);
    Effect::async_(move |callback: AsyncCallback<A, E>| {
        let resume: Todo = {
            let program = program.clone();
            let txn = Arc::clone(&txn);
            let scheduler = Arc::clone(&scheduler);
            Arc::new(move || {
                callback.resume(try_commit(
                    program.clone(),
                    Arc::clone(&txn),
                    fiber_id,
                    Arc::clone(&scheduler),
                ));
            })
        };
        txn.arm(resume);
        let added = txn.track(&journal);

        // A commit may have landed before the todos were in place.
        if journal.is_valid() || !txn.disarm() {
            tracing::trace!(fiber = %fiber_id, watched = added, "transaction retrying, suspended");
            AsyncReply::Pending(None)
        } else {
            AsyncReply::Ready(try_commit(
                program.clone(),
                Arc::clone(&txn),
                fiber_id,
                Arc::clone(&scheduler),
            ))
        }
    })
}
