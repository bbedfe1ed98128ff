//! Supervisors observe fiber lifecycles.
//!
//! Every method has a no-op default so an implementation only overrides
//! what it cares about. Callbacks run on the interpreter's thread, inside
//! the fiber's quantum, and must be quick.

use std::collections::BTreeSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::cause::Cause;
use crate::fiber::FiberId;
use crate::instr::Erased;

/// The instruction kinds reported to [`Supervisor::on_effect`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[allow(missing_docs)]
pub enum EffectKind {
    Succeed,
    Sync,
    Suspend,
    FlatMap,
    Fold,
    Fail,
    Async,
    Fork,
    InterruptStatus,
    CheckInterrupt,
    Descriptor,
    RaceWith,
    Ensuring,
    Yield,
    FiberRefModify,
    Supervise,
    WithRuntimeConfig,
    SetPlatform,
    Log,
}

/// Lifecycle observer.
pub trait Supervisor: Send + Sync {
    /// A fiber was created. `parent` is `None` for root fibers.
    fn on_start(&self, fiber: FiberId, parent: Option<FiberId>) {
        let _ = (fiber, parent);
    }

    /// A fiber finished; `failure` is its cause when it did not succeed.
    fn on_end(&self, fiber: FiberId, failure: Option<&Cause<Erased>>) {
        let _ = (fiber, failure);
    }

    /// An instruction is about to be dispatched.
    fn on_effect(&self, fiber: FiberId, kind: EffectKind) {
        let _ = (fiber, kind);
    }

    /// A quantum ended.
    fn on_suspend(&self, fiber: FiberId) {
        let _ = fiber;
    }

    /// A quantum began.
    fn on_resume(&self, fiber: FiberId) {
        let _ = fiber;
    }
}

/// Observes nothing.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoneSupervisor;

impl Supervisor for NoneSupervisor {}

/// Runs two supervisors, left first.
pub struct Both(pub Arc<dyn Supervisor>, pub Arc<dyn Supervisor>);

impl Supervisor for Both {
    fn on_start(&self, fiber: FiberId, parent: Option<FiberId>) {
        self.0.on_start(fiber, parent);
        self.1.on_start(fiber, parent);
    }

    fn on_end(&self, fiber: FiberId, failure: Option<&Cause<Erased>>) {
        self.0.on_end(fiber, failure);
        self.1.on_end(fiber, failure);
    }

    fn on_effect(&self, fiber: FiberId, kind: EffectKind) {
        self.0.on_effect(fiber, kind);
        self.1.on_effect(fiber, kind);
    }

    fn on_suspend(&self, fiber: FiberId) {
        self.0.on_suspend(fiber);
        self.1.on_suspend(fiber);
    }

    fn on_resume(&self, fiber: FiberId) {
        self.0.on_resume(fiber);
        self.1.on_resume(fiber);
    }
}

/// Records which fibers are alive and the order they started and ended.
#[derive(Debug, Default)]
pub struct TrackingSupervisor {
    live: Mutex<BTreeSet<FiberId>>,
    started: Mutex<Vec<(FiberId, Option<FiberId>)>>,
    ended: Mutex<Vec<(FiberId, bool)>>,
    effects: AtomicU64,
    quanta: AtomicU64,
}

impl TrackingSupervisor {
    /// Create an empty tracker.
    pub fn new() -> Self {
        Self::default()
    }

    /// Fibers started and not yet ended.
    pub fn live(&self) -> BTreeSet<FiberId> {
        self.live.lock().clone()
    }

    /// Every start, in order, with its parent.
    pub fn started(&self) -> Vec<(FiberId, Option<FiberId>)> {
        self.started.lock().clone()
    }

    /// Every end, in order, flagged `true` when the fiber failed.
    pub fn ended(&self) -> Vec<(FiberId, bool)> {
        self.ended.lock().clone()
    }

    /// Position of `fiber` in the end order.
    pub fn end_position(&self, fiber: FiberId) -> Option<usize> {
        self.ended.lock().iter().position(|(id, _)| *id == fiber)
    }

    /// Instructions dispatched.
    pub fn effect_count(&self) -> u64 {
        self.effects.load(Ordering::Relaxed)
    }

    /// Quanta begun.
    pub fn quantum_count(&self) -> u64 {
        self.quanta.load(Ordering::Relaxed)
    }
}

impl Supervisor for TrackingSupervisor {
    fn on_start(&self, fiber: FiberId, parent: Option<FiberId>) {
        self.live.lock().insert(fiber);
        self.started.lock().push((fiber, parent));
    }

    fn on_end(&self, fiber: FiberId, failure: Option<&Cause<Erased>>) {
        self.live.lock().remove(&fiber);
        self.ended.lock().push((fiber, failure.is_some()));
    }

    fn on_effect(&self, _fiber: FiberId, _kind: EffectKind) {
        self.effects.fetch_add(1, Ordering::Relaxed);
    }

    fn on_resume(&self, _fiber: FiberId) {
        self.quanta.fetch_add(1, Ordering::Relaxed);
    }
}
