//! Fiber identity, status and handles.
//!
//! A fiber is a lightweight, cooperatively scheduled logical thread. The
//! interpreter state lives in [`crate::context`]; this module holds the
//! types user code sees: [`FiberId`], [`FiberStatus`], [`FiberDescriptor`]
//! and the typed [`Fiber`] handle returned by `fork`.

use std::collections::BTreeSet;
use std::fmt;
use std::marker::PhantomData;
use std::panic::Location;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use crate::context::{typed_exit, FiberContext, RawExit};
use crate::effect::{Data, Effect};
use crate::exit::Exit;
use crate::instr::{downcast, unit, Instr};
use crate::runtime::Platform;
use crate::scope::FiberScope;

/// Global fiber sequence counter.
static NEXT_FIBER_SEQ: AtomicU64 = AtomicU64::new(1);

/// Unique identifier for a fiber: creation time plus a process-wide
/// monotonic sequence number.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct FiberId {
    start_time: u64,
    seq: u64,
}

impl FiberId {
    /// The identity used when interruption is requested from outside any
    /// fiber.
    pub const NONE: FiberId = FiberId {
        start_time: 0,
        seq: 0,
    };

    /// Build an id from its parts.
    pub const fn new(start_time: u64, seq: u64) -> Self {
        Self { start_time, seq }
    }

    /// Allocate a fresh id.
    pub(crate) fn next() -> Self {
        let start_time = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or(0);
        Self {
            start_time,
            seq: NEXT_FIBER_SEQ.fetch_add(1, Ordering::Relaxed),
        }
    }

    /// Creation time in Unix milliseconds.
    pub fn start_time(&self) -> u64 {
        self.start_time
    }

    /// Sequence number.
    pub fn seq(&self) -> u64 {
        self.seq
    }
}

impl fmt::Display for FiberId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Fiber(#{})", self.seq)
    }
}

/// Execution status of a fiber.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FiberStatus {
    /// Executing instructions, or queued to.
    Running {
        /// The fiber is already unwinding because of an interruption.
        interrupting: bool,
    },
    /// Waiting on an async instruction.
    Suspended {
        /// The fiber is already unwinding because of an interruption.
        interrupting: bool,
        /// An interruption arriving now would run the registered canceler.
        interruptible: bool,
        /// Async epoch of the suspension.
        epoch: u64,
        /// Fibers this one is waiting on, when known.
        blocking_on: Vec<FiberId>,
        /// Where the async instruction was built.
        trace: Option<&'static Location<'static>>,
    },
    /// Finished.
    Done,
}

impl FiberStatus {
    /// True while the fiber is unwinding because of an interruption.
    pub fn is_interrupting(&self) -> bool {
        match self {
            FiberStatus::Running { interrupting } | FiberStatus::Suspended { interrupting, .. } => {
                *interrupting
            }
            FiberStatus::Done => false,
        }
    }

    pub(crate) fn set_interrupting(&mut self, value: bool) {
        match self {
            FiberStatus::Running { interrupting } | FiberStatus::Suspended { interrupting, .. } => {
                *interrupting = value;
            }
            FiberStatus::Done => {}
        }
    }
}

/// Whether interruption may currently be delivered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InterruptStatus {
    /// Interruption is observed at the next checkpoint.
    Interruptible,
    /// Interruption is deferred until the region ends.
    Uninterruptible,
}

impl InterruptStatus {
    /// True for [`InterruptStatus::Interruptible`].
    pub fn is_interruptible(self) -> bool {
        self == InterruptStatus::Interruptible
    }

    pub(crate) fn from_flag(interruptible: bool) -> Self {
        if interruptible {
            InterruptStatus::Interruptible
        } else {
            InterruptStatus::Uninterruptible
        }
    }
}

/// A snapshot of the running fiber, produced by `Effect::descriptor`.
#[derive(Clone)]
pub struct FiberDescriptor {
    /// The fiber's id.
    pub id: FiberId,
    /// Its status at the time of the snapshot.
    pub status: FiberStatus,
    /// Fibers that have requested its interruption.
    pub interruptors: BTreeSet<FiberId>,
    /// Current interruptibility.
    pub interrupt_status: InterruptStatus,
    /// The scope children forked here join by default.
    pub scope: FiberScope,
    pub(crate) platform: Arc<Platform>,
}

impl fmt::Debug for FiberDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FiberDescriptor")
            .field("id", &self.id)
            .field("status", &self.status)
            .field("interruptors", &self.interruptors)
            .field("interrupt_status", &self.interrupt_status)
            .finish_non_exhaustive()
    }
}

/// Handle to a forked fiber producing `A` or failing with `E`.
pub struct Fiber<A, E> {
    context: Arc<FiberContext>,
    _marker: PhantomData<fn() -> (A, E)>,
}

impl<A, E> Clone for Fiber<A, E> {
    fn clone(&self) -> Self {
        Self {
            context: Arc::clone(&self.context),
            _marker: PhantomData,
        }
    }
}

impl<A, E> fmt::Debug for Fiber<A, E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Fiber({})", self.context.id())
    }
}

impl<A: Data, E: Data> Fiber<A, E> {
    pub(crate) fn from_context(context: Arc<FiberContext>) -> Self {
        Self {
            context,
            _marker: PhantomData,
        }
    }

    pub(crate) fn erase(context: Arc<FiberContext>) -> crate::instr::Value {
        Arc::new(Self::from_context(context))
    }

    /// The fiber's id.
    pub fn id(&self) -> FiberId {
        self.context.id()
    }

    /// Current status.
    pub fn status(&self) -> FiberStatus {
        self.context.status()
    }

    /// The exit, if the fiber is done. Never blocks.
    pub fn poll(&self) -> Option<Exit<E, A>> {
        self.context.poll().map(|exit| typed_exit(&exit))
    }

    /// Wait for the fiber to finish and produce its exit.
    pub fn await_exit<E2: Data>(&self) -> Effect<Exit<E, A>, E2> {
        Effect::from_instr(Instr::FlatMap(
            Arc::new(self.context.await_exit()),
            Arc::new(|value: crate::instr::Value| {
                let raw: RawExit = downcast(&value);
                Instr::Succeed(Arc::new(typed_exit::<E, A>(&raw)))
            }),
        ))
    }

    /// Wait for the fiber and take on its outcome.
    pub fn join(&self) -> Effect<A, E> {
        self.await_exit::<E>().flat_map(Effect::done)
    }

    /// Interrupt the fiber on behalf of the current fiber and wait for it
    /// to finish.
    pub fn interrupt<E2: Data>(&self) -> Effect<Exit<E, A>, E2> {
        let fiber = self.clone();
        Effect::fiber_id().flat_map(move |id| fiber.interrupt_as(id))
    }

    /// Interrupt the fiber on behalf of `by` and wait for it to finish.
    pub fn interrupt_as<E2: Data>(&self, by: FiberId) -> Effect<Exit<E, A>, E2> {
        let context = Arc::clone(&self.context);
        let fiber = self.clone();
        Effect::<(), E2>::from_instr(Instr::Sync(Arc::new(move || {
            context.interrupt_as(by);
            unit()
        })))
        .zip_right(Effect::suspend(move || fiber.await_exit()))
    }

    /// Request interruption without waiting. Usable from outside any fiber.
    pub fn request_interrupt(&self, by: FiberId) {
        self.context.interrupt_as(by);
    }

    /// Run `effect` on this fiber before its next step. If the fiber is
    /// already done, `or_else` runs on the calling fiber instead.
    pub fn eval_on<E2: Data>(
        &self,
        effect: Effect<(), std::convert::Infallible>,
        or_else: Effect<(), std::convert::Infallible>,
    ) -> Effect<(), E2> {
        let context = Arc::clone(&self.context);
        Effect::suspend(move || {
            if context.add_message(effect.clone().into_instr()) {
                Effect::unit()
            } else {
                or_else.clone().lift()
            }
        })
    }

    /// Invoke `callback` with the exit once the fiber is done; immediately
    /// if it already is.
    pub fn on_exit<F>(&self, callback: F)
    where
        F: FnOnce(Exit<E, A>) + Send + 'static,
    {
        self.context
            .on_exit(Box::new(move |exit: &RawExit| callback(typed_exit(exit))));
    }
}
