//! # Fiber Interpreter
//!
//! [`FiberContext`] is the runtime representation of a fiber. It owns the
//! fiber's [`FiberState`] (shared with other threads, behind a short-lived
//! lock), its continuation stack and interruptibility stack (touched only
//! by the quantum that is running), its children and its platform.
//!
//! ## Run loop
//!
//! `run_until` executes one quantum: a trampoline over the closed [`Instr`]
//! enum that keeps going until the fiber completes, suspends on an async
//! instruction, yields, or has dispatched `max_op_count` instructions. Each
//! iteration first takes a single look at the shared state:
//!
//! ```text
//!  ┌───────────────────────┐  yes   ┌────────────────────────────┐
//!  │ interrupt pending and │ ─────▶ │ Fail(suppressed + interr.) │
//!  │ region interruptible? │        └────────────────────────────┘
//!  └───────────┬───────────┘
//!              │ no
//!  ┌───────────▼───────────┐  yes   ┌────────────────────────────┐
//!  │   mailbox non-empty?  │ ─────▶ │ mailbox, then current instr │
//!  └───────────┬───────────┘        └────────────────────────────┘
//!              │ no
//!  ┌───────────▼───────────┐  yes   ┌────────────────────────────┐
//!  │   op budget spent?    │ ─────▶ │ reschedule, end quantum    │
//!  └───────────┬───────────┘        └────────────────────────────┘
//!              │ no
//!        dispatch instr
//! ```
//!
//! ## Lock order
//!
//! `local` (held for a whole quantum), then `state`, then `children`. The
//! platform lock is never held while taking another.

use std::collections::HashMap;
use std::panic::{self, AssertUnwindSafe, Location};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use parking_lot::{Mutex, RwLock};

use crate::cause::Cause;
use crate::effect::Data;
use crate::exit::Exit;
use crate::fatal::{self, payload_message, PanicReport};
use crate::fiber::{FiberDescriptor, FiberId, FiberStatus, InterruptStatus};
use crate::fiber_ref::{FiberRefs, FORK_SCOPE_OVERRIDE, LOG_ANNOTATIONS, LOG_SPANS};
use crate::frame::Frame;
use crate::instr::{downcast, erase, unit, AsyncOutcome, CauseCont, Erased, Instr, RaceCont, Register, Value};
use crate::logger::{LogLevel, LogRecord};
use crate::runtime::Platform;
use crate::scope::FiberScope;
use crate::state::{FiberState, Observer, ObserverId, TryDone};
use crate::supervisor::{Both, EffectKind};

/// An exit as the interpreter carries it.
pub(crate) type RawExit = Exit<Erased, Value>;

/// Recover the typed view of an erased exit.
pub(crate) fn typed_exit<E: Data, A: Data>(exit: &RawExit) -> Exit<E, A> {
    match exit {
        Exit::Success(value) => Exit::Success(downcast(value)),
        Exit::Failure(cause) => Exit::Failure(cause.clone().map(|e: Erased| e.downcast::<E>())),
    }
}

/// Handle an async registration uses to resume its fiber. Only the first
/// resume of a suspension has any effect.
#[derive(Clone)]
pub(crate) struct Resume {
    fiber: Arc<FiberContext>,
    epoch: u64,
}

impl Resume {
    pub(crate) fn resume(&self, instr: Instr) {
        self.fiber.resume_async(self.epoch, instr);
    }

    pub(crate) fn fiber_id(&self) -> FiberId {
        self.fiber.id
    }
}

/// State only the running quantum touches.
struct LocalState {
    stack: Vec<Frame>,
    interrupt_status: Vec<bool>,
    async_epoch: u64,
    fiber_refs: FiberRefs,
    /// Epoch of an async registration in progress.
    registering: Option<u64>,
}

impl LocalState {
    fn interruptible(&self) -> bool {
        self.interrupt_status.last().copied().unwrap_or(true)
    }
}

/// Where unwinding stopped.
enum Unwound {
    Handler(CauseCont),
    Finalizer(Instr),
}

pub(crate) struct FiberContext {
    id: FiberId,
    state: Mutex<FiberState>,
    local: Mutex<LocalState>,
    children: Mutex<HashMap<FiberId, Arc<FiberContext>>>,
    platform: RwLock<Arc<Platform>>,
    scope: FiberScope,
    started: Instant,
    location: &'static Location<'static>,
}

impl FiberContext {
    pub(crate) fn new(
        id: FiberId,
        platform: Arc<Platform>,
        fiber_refs: FiberRefs,
        scope: FiberScope,
        location: &'static Location<'static>,
    ) -> Arc<Self> {
        Arc::new(Self {
            id,
            state: Mutex::new(FiberState::initial()),
            local: Mutex::new(LocalState {
                stack: Vec::new(),
                interrupt_status: Vec::new(),
                async_epoch: 0,
                fiber_refs,
                registering: None,
            }),
            children: Mutex::new(HashMap::new()),
            platform: RwLock::new(platform),
            scope,
            started: Instant::now(),
            location,
        })
    }

    pub(crate) fn id(&self) -> FiberId {
        self.id
    }

    pub(crate) fn platform(&self) -> Arc<Platform> {
        Arc::clone(&self.platform.read())
    }

    pub(crate) fn status(&self) -> FiberStatus {
        self.state.lock().status()
    }

    pub(crate) fn poll(&self) -> Option<RawExit> {
        self.state.lock().exit().cloned()
    }

    pub(crate) fn is_done(&self) -> bool {
        self.state.lock().is_done()
    }

    /// Register `child` as owned by this fiber. `false` once this fiber is
    /// done, so no child can be orphaned by a concurrent completion.
    pub(crate) fn add_child(&self, child: &Arc<FiberContext>) -> bool {
        let state = self.state.lock();
        if state.is_done() {
            return false;
        }
        self.children.lock().insert(child.id, Arc::clone(child));
        true
    }

    pub(crate) fn remove_child(&self, child: FiberId) {
        self.children.lock().remove(&child);
    }

    /// Run `instr` on this fiber in a new quantum.
    pub(crate) fn evaluate_later(self: &Arc<Self>, instr: Instr) {
        let fiber = Arc::clone(self);
        let scheduler = Arc::clone(&self.platform.read().scheduler);
        scheduler.schedule_task(Box::new(move || fiber.run_until(instr)));
    }

    fn resume_async(self: &Arc<Self>, epoch: u64, instr: Instr) {
        if self.state.lock().exit_async(epoch) {
            self.evaluate_later(instr);
        }
    }

    /// Queue `effect` to run on this fiber. `false` once it is done.
    pub(crate) fn add_message(&self, effect: Instr) -> bool {
        self.state.lock().add_message(effect)
    }

    /// Call `observer` with the exit, now if the fiber is already done.
    pub(crate) fn on_exit(&self, observer: Observer) {
        let mut state = self.state.lock();
        match state.exit().cloned() {
            Some(exit) => {
                drop(state);
                observer(&exit);
            }
            None => {
                state.add_observer(ObserverId::next(), observer);
            }
        }
    }

    /// Record `by` as an interruptor. A fiber suspended interruptibly is
    /// woken right away to run its canceler.
    pub(crate) fn interrupt_as(self: &Arc<Self>, by: FiberId) {
        let cancel = {
            let mut state = self.state.lock();
            state
                .interrupt_as(by)
                .map(|canceler| (canceler, state.clear_suppressed()))
        };
        tracing::trace!(fiber = %self.id, by = %by, "interruption requested");
        if let Some((canceler, cause)) = cancel {
            self.evaluate_later(then_fail(canceler, cause));
        }
    }

    /// Suspend until this fiber is done, then succeed with its [`RawExit`].
    #[track_caller]
    pub(crate) fn await_exit(self: &Arc<Self>) -> Instr {
        let fiber = Arc::clone(self);
        let register: Register = Arc::new(move |resume: Resume| {
            let id = ObserverId::next();
            let observer: Observer =
                Box::new(move |exit: &RawExit| resume.resume(Instr::Succeed(erase(exit.clone()))));
            match fiber.state.lock().add_observer(id, observer) {
                Some(exit) => AsyncOutcome::Ready(Instr::Succeed(erase(exit))),
                None => {
                    let fiber = Arc::clone(&fiber);
                    AsyncOutcome::Pending(Some(Instr::Sync(Arc::new(move || {
                        fiber.state.lock().remove_observer(id);
                        unit()
                    }))))
                }
            }
        });
        Instr::Async {
            register,
            blocking_on: vec![self.id],
            location: Location::caller(),
        }
    }

    /// Execute one quantum starting at `start`.
    pub(crate) fn run_until(self: &Arc<Self>, start: Instr) {
        if fatal::is_catastrophic() {
            return;
        }
        let mut local = self.local.lock();
        self.notify_supervisor(|| self.platform().supervisor.on_resume(self.id));

        let mut current = start;
        loop {
            let outcome = panic::catch_unwind(AssertUnwindSafe(|| self.drive(&mut local, current)));
            let payload = match outcome {
                Ok(()) => break,
                Err(payload) => payload,
            };

            // A panicking registration may already have been resumed from
            // elsewhere; that resume owns the fiber now.
            if let Some(epoch) = local.registering.take() {
                if !self.state.lock().exit_async(epoch) {
                    break;
                }
            }

            let platform = self.platform();
            let is_fatal = platform.fatal.is_fatal(&*payload);
            let report = PanicReport::capture(&*payload, Some(self.id), is_fatal);
            if is_fatal {
                platform.fatal.escalate(&report);
                return;
            }
            tracing::debug!(fiber = %self.id, "recovered panic: {}", report.message());
            current = Instr::Fail(Cause::die(report.defect_message()));
        }

        self.notify_supervisor(|| self.platform().supervisor.on_suspend(self.id));
    }

    fn drive(self: &Arc<Self>, local: &mut LocalState, start: Instr) {
        let mut platform = self.platform();
        let mut current = start;
        let mut ops = 0usize;

        loop {
            let interruptible = local.interruptible();
            let interrupt = {
                let mut state = self.state.lock();
                if !matches!(current, Instr::Fail(_))
                    && interruptible
                    && state.is_interrupted()
                    && !state.is_interrupting()
                {
                    state.set_interrupting(true);
                    Some(Ok(state.clear_suppressed()))
                } else {
                    state.take_mailbox().map(Err)
                }
            };

            match interrupt {
                Some(Ok(cause)) => {
                    tracing::trace!(fiber = %self.id, "interruption delivered");
                    current = Instr::Fail(cause);
                    continue;
                }
                Some(Err(mailbox)) => {
                    current = self.splice_mailbox(mailbox, current);
                    continue;
                }
                None => {}
            }

            if ops >= platform.config.max_op_count {
                tracing::trace!(fiber = %self.id, ops, "quantum exhausted");
                self.evaluate_later(current);
                return;
            }
            ops += 1;

            let kind = current.kind();
            self.notify_supervisor(|| platform.supervisor.on_effect(self.id, kind));
            match self.step(local, &platform, current) {
                Some(next) => current = next,
                None => return,
            }
            if matches!(
                kind,
                EffectKind::Supervise | EffectKind::WithRuntimeConfig | EffectKind::SetPlatform
            ) {
                platform = self.platform();
            }
        }
    }

    /// Dispatch one instruction. `None` ends the quantum.
    fn step(self: &Arc<Self>, local: &mut LocalState, platform: &Arc<Platform>, instr: Instr) -> Option<Instr> {
        match instr {
            Instr::Succeed(value) => self.next_instr(local, platform, value),
            Instr::Sync(effect) => {
                let value = effect();
                self.next_instr(local, platform, value)
            }
            Instr::Suspend(thunk) => Some(thunk()),
            Instr::FlatMap(inner, k) => {
                local.stack.push(Frame::Apply(k));
                Some(Arc::unwrap_or_clone(inner))
            }
            Instr::Fold(inner, on_failure, on_success) => {
                local.stack.push(Frame::Fold {
                    on_failure,
                    on_success,
                });
                Some(Arc::unwrap_or_clone(inner))
            }
            Instr::Fail(cause) => self.fail(local, platform, cause),
            Instr::Async {
                register,
                blocking_on,
                location,
            } => self.suspend_async(local, register, blocking_on, location),
            Instr::Fork {
                effect,
                scope,
                wrap,
                location,
            } => {
                let child = self.fork(local, platform, Arc::unwrap_or_clone(effect), scope, location);
                self.next_instr(local, platform, wrap(child))
            }
            Instr::InterruptStatus {
                effect,
                interruptible,
            } => {
                local.interrupt_status.push(interruptible);
                local.stack.push(Frame::InterruptExit);
                Some(Arc::unwrap_or_clone(effect))
            }
            Instr::CheckInterrupt(f) => Some(f(InterruptStatus::from_flag(local.interruptible()))),
            Instr::Descriptor(f) => Some(f(self.descriptor(local, platform))),
            Instr::RaceWith {
                left,
                right,
                left_wins,
                right_wins,
                scope,
                location,
            } => {
                let left = self.fork(local, platform, Arc::unwrap_or_clone(left), scope.clone(), location);
                let right = self.fork(local, platform, Arc::unwrap_or_clone(right), scope, location);
                Some(race(left, right, left_wins, right_wins, location))
            }
            Instr::Ensuring { effect, finalizer } => {
                local.stack.push(Frame::Finalizer(Arc::unwrap_or_clone(finalizer)));
                Some(Arc::unwrap_or_clone(effect))
            }
            Instr::Yield => {
                self.evaluate_later(Instr::unit());
                None
            }
            Instr::FiberRefModify { fiber_ref, f } => {
                let (out, next) = f(local.fiber_refs.get_value(&fiber_ref));
                local.fiber_refs.set_value(&fiber_ref, next);
                self.next_instr(local, platform, out)
            }
            Instr::Supervise { effect, supervisor } => {
                let mut next = Platform::clone(platform);
                next.supervisor = Arc::new(Both(Arc::clone(&platform.supervisor), supervisor));
                self.swap_platform(local, Arc::new(next));
                Some(Arc::unwrap_or_clone(effect))
            }
            Instr::WithRuntimeConfig { effect, config } => {
                let mut next = Platform::clone(platform);
                next.config = config;
                self.swap_platform(local, Arc::new(next));
                Some(Arc::unwrap_or_clone(effect))
            }
            Instr::SetPlatform(next) => {
                *self.platform.write() = next;
                self.next_instr(local, platform, unit())
            }
            Instr::Log {
                level,
                message,
                cause,
                location,
            } => {
                let render = || message();
                if !self.emit_log(local, platform, level, &render, cause.as_ref(), location) {
                    return None;
                }
                self.next_instr(local, platform, unit())
            }
        }
    }

    /// Continue with a success value.
    fn next_instr(self: &Arc<Self>, local: &mut LocalState, platform: &Arc<Platform>, value: Value) -> Option<Instr> {
        loop {
            match local.stack.pop() {
                None => return self.try_done(local, platform, Exit::Success(value)),
                Some(Frame::Apply(k)) => return Some(k(value)),
                Some(Frame::Fold { on_success, .. }) => return Some(on_success(value)),
                Some(Frame::InterruptExit) => {
                    local.interrupt_status.pop();
                }
                Some(Frame::Finalizer(finalizer)) => {
                    return Some(run_finalizer(local, finalizer, Exit::Success(value)));
                }
                Some(Frame::Replay(saved)) => return Some(Instr::from_exit(saved)),
            }
        }
    }

    /// Unwind the stack looking for a handler or a finalizer.
    fn fail(self: &Arc<Self>, local: &mut LocalState, platform: &Arc<Platform>, mut cause: Cause<Erased>) -> Option<Instr> {
        let pending_interrupt = {
            let state = self.state.lock();
            state.is_interrupted() && !state.is_interrupting()
        };

        let mut discarded = false;
        let unwound = loop {
            let Some(frame) = local.stack.pop() else {
                break None;
            };
            tracing::trace!(fiber = %self.id, frame = frame.name(), "unwinding");
            match frame {
                Frame::Apply(_) => {}
                Frame::InterruptExit => {
                    local.interrupt_status.pop();
                }
                Frame::Fold { on_failure, .. } => {
                    if pending_interrupt && local.interruptible() {
                        discarded = true;
                    } else {
                        break Some(Unwound::Handler(on_failure));
                    }
                }
                Frame::Finalizer(finalizer) => break Some(Unwound::Finalizer(finalizer)),
                Frame::Replay(saved) => {
                    if let Exit::Failure(prior) = saved {
                        cause = prior.then(cause);
                    }
                }
            }
        };

        if discarded {
            cause = self.with_suppressed(cause.strip_failures());
        }

        match unwound {
            Some(Unwound::Handler(on_failure)) => {
                self.state.lock().set_interrupting(false);
                Some(on_failure(cause))
            }
            Some(Unwound::Finalizer(finalizer)) => Some(run_finalizer(local, finalizer, Exit::Failure(cause))),
            None => {
                let cause = {
                    let mut state = self.state.lock();
                    state.set_interrupting(true);
                    merge_suppressed(cause, state.clear_suppressed())
                };
                self.try_done(local, platform, Exit::Failure(cause))
            }
        }
    }

    fn with_suppressed(&self, cause: Cause<Erased>) -> Cause<Erased> {
        let suppressed = self.state.lock().clear_suppressed();
        merge_suppressed(cause, suppressed)
    }

    /// Finish with `exit` once the mailbox is drained and every child is
    /// done.
    fn try_done(self: &Arc<Self>, local: &mut LocalState, platform: &Arc<Platform>, exit: RawExit) -> Option<Instr> {
        let outcome = {
            let mut state = self.state.lock();
            let children_pending = !self.children.lock().is_empty();
            state.try_done(exit, children_pending)
        };

        match outcome {
            TryDone::Mailbox(mailbox, exit) => Some(self.splice_mailbox(mailbox, Instr::from_exit(exit))),
            TryDone::Children(exit) => {
                let children: Vec<Arc<FiberContext>> = self.children.lock().values().cloned().collect();
                tracing::trace!(fiber = %self.id, children = children.len(), "interrupting children");
                let parent = self.id;
                let targets = children.clone();
                let mut program = Instr::Sync(Arc::new(move || {
                    for child in &targets {
                        child.interrupt_as(parent);
                    }
                    unit()
                }));
                for child in &children {
                    program = program.then(child.await_exit());
                }
                Some(Instr::InterruptStatus {
                    effect: Arc::new(program.then(Instr::from_exit(exit))),
                    interruptible: false,
                })
            }
            TryDone::Done(exit, observers) => {
                self.on_done(local, platform, &exit, observers);
                None
            }
            TryDone::AlreadyDone => None,
        }
    }

    fn on_done(&self, local: &LocalState, platform: &Arc<Platform>, exit: &RawExit, observers: Vec<Observer>) {
        self.scope.remove(self.id);

        let failure = exit.cause();
        if let Some(cause) = failure {
            if platform.config.report_unhandled && !cause.is_interrupted_only() {
                let render = || "Fiber failed with an unhandled error".to_string();
                self.emit_log(local, platform, LogLevel::Debug, &render, Some(cause), self.location);
            }
        }
        if platform.config.metrics_enabled {
            platform
                .metrics
                .record_end(failure.map(|cause| cause.kind()), self.started.elapsed());
        }
        tracing::trace!(fiber = %self.id, success = exit.is_success(), "fiber done");
        self.notify_supervisor(|| platform.supervisor.on_end(self.id, failure));

        for observer in observers {
            if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(|| observer(exit))) {
                tracing::warn!(fiber = %self.id, "exit observer panicked: {}", payload_message(&*payload));
            }
        }
    }

    /// Run `mailbox`, then `next`. Failures of the mailbox effect are kept
    /// as suppressed causes rather than failing the fiber.
    fn splice_mailbox(self: &Arc<Self>, mailbox: Instr, next: Instr) -> Instr {
        let fiber = Arc::downgrade(self);
        let after_failure = next.clone();
        Instr::Fold(
            Arc::new(mailbox),
            Arc::new(move |cause: Cause<Erased>| {
                if let Some(fiber) = fiber.upgrade() {
                    fiber.state.lock().add_suppressed(cause);
                }
                after_failure.clone()
            }),
            Arc::new(move |_: Value| next.clone()),
        )
    }

    fn suspend_async(
        self: &Arc<Self>,
        local: &mut LocalState,
        register: Register,
        blocking_on: Vec<FiberId>,
        location: &'static Location<'static>,
    ) -> Option<Instr> {
        local.async_epoch += 1;
        let epoch = local.async_epoch;
        let interruptible = local.interruptible();
        self.state
            .lock()
            .enter_async(epoch, interruptible, blocking_on, location);

        local.registering = Some(epoch);
        let outcome = register(Resume {
            fiber: Arc::clone(self),
            epoch,
        });
        local.registering = None;

        match outcome {
            AsyncOutcome::Ready(instr) => {
                if self.state.lock().exit_async(epoch) {
                    Some(instr)
                } else {
                    None
                }
            }
            AsyncOutcome::Pending(canceler) => {
                let canceler = canceler.unwrap_or_else(Instr::unit);
                let mut state = self.state.lock();
                state.set_async_canceler(epoch, canceler.clone());
                if interruptible
                    && state.is_interrupted()
                    && !state.is_interrupting()
                    && state.exit_async(epoch)
                {
                    state.set_interrupting(true);
                    let cause = state.clear_suppressed();
                    return Some(then_fail(canceler, cause));
                }
                tracing::trace!(fiber = %self.id, epoch, "suspended");
                None
            }
        }
    }

    fn fork(
        self: &Arc<Self>,
        local: &LocalState,
        platform: &Arc<Platform>,
        effect: Instr,
        scope: Option<FiberScope>,
        location: &'static Location<'static>,
    ) -> Arc<FiberContext> {
        let scope = scope
            .or_else(|| local.fiber_refs.get(&FORK_SCOPE_OVERRIDE))
            .unwrap_or_else(|| FiberScope::local(self));
        let child = FiberContext::new(
            FiberId::next(),
            Arc::clone(platform),
            local.fiber_refs.fork(),
            scope.clone(),
            location,
        );

        self.notify_supervisor(|| platform.supervisor.on_start(child.id, Some(self.id)));
        if platform.config.metrics_enabled {
            platform.metrics.record_start(location);
        }

        let program = if scope.unsafe_add(&child) {
            effect
        } else {
            Instr::Fail(Cause::interrupt(scope.owner().unwrap_or(self.id)))
        };
        tracing::trace!(parent = %self.id, child = %child.id, ?scope, "fork");
        child.evaluate_later(program);
        child
    }

    fn descriptor(self: &Arc<Self>, local: &LocalState, platform: &Arc<Platform>) -> FiberDescriptor {
        let (status, interruptors) = {
            let state = self.state.lock();
            (state.status(), state.interruptors())
        };
        FiberDescriptor {
            id: self.id,
            status,
            interruptors,
            interrupt_status: InterruptStatus::from_flag(local.interruptible()),
            scope: local
                .fiber_refs
                .get(&FORK_SCOPE_OVERRIDE)
                .unwrap_or_else(|| FiberScope::local(self)),
            platform: Arc::clone(platform),
        }
    }

    fn swap_platform(&self, local: &mut LocalState, next: Arc<Platform>) {
        let previous = std::mem::replace(&mut *self.platform.write(), next);
        local.stack.push(Frame::Finalizer(Instr::SetPlatform(previous)));
    }

    /// Run a supervisor hook. A panic in it is logged, never seen by the fiber.
    fn notify_supervisor(&self, hook: impl FnOnce()) {
        if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(hook)) {
            tracing::warn!(fiber = %self.id, "supervisor panicked: {}", payload_message(&*payload));
        }
    }

    /// Hand a record to every logger. `false` if a logger hit a fatal panic.
    fn emit_log(
        &self,
        local: &LocalState,
        platform: &Platform,
        level: LogLevel,
        message: &dyn Fn() -> String,
        cause: Option<&Cause<Erased>>,
        location: &'static Location<'static>,
    ) -> bool {
        let spans = local.fiber_refs.get(&LOG_SPANS);
        let annotations = local.fiber_refs.get(&LOG_ANNOTATIONS);
        let render_cause = || cause.map(|cause| cause.to_string());
        let record = LogRecord {
            location,
            fiber_id: self.id,
            level,
            message,
            cause: &render_cause,
            context: &local.fiber_refs,
            spans: &spans,
            annotations: &annotations,
        };

        for logger in &platform.loggers {
            let Err(payload) = panic::catch_unwind(AssertUnwindSafe(|| logger.log(&record))) else {
                continue;
            };
            if platform.fatal.is_fatal(&*payload) {
                platform
                    .fatal
                    .escalate(&PanicReport::capture(&*payload, Some(self.id), true));
                return false;
            }
            tracing::warn!(fiber = %self.id, "logger panicked: {}", payload_message(&*payload));
        }
        true
    }
}

fn merge_suppressed(cause: Cause<Erased>, suppressed: Cause<Erased>) -> Cause<Erased> {
    if cause.contains(&suppressed) {
        cause
    } else {
        cause.then(suppressed)
    }
}

/// Run a finalizer with interruption disabled, leaving the outcome it
/// interrupted to be replayed afterwards.
fn run_finalizer(local: &mut LocalState, finalizer: Instr, saved: RawExit) -> Instr {
    local.stack.push(Frame::Replay(saved));
    local.stack.push(Frame::InterruptExit);
    local.interrupt_status.push(false);
    finalizer
}

/// Run `canceler`, then fail with `cause` plus anything the canceler
/// failed with.
fn then_fail(canceler: Instr, cause: Cause<Erased>) -> Instr {
    let on_success = cause.clone();
    Instr::Fold(
        Arc::new(canceler),
        Arc::new(move |failure: Cause<Erased>| Instr::Fail(cause.clone().then(failure))),
        Arc::new(move |_: Value| Instr::Fail(on_success.clone())),
    )
}

/// Suspend until the first of `left` and `right` completes, then continue
/// with that side's continuation.
fn race(
    left: Arc<FiberContext>,
    right: Arc<FiberContext>,
    left_wins: RaceCont,
    right_wins: RaceCont,
    location: &'static Location<'static>,
) -> Instr {
    let blocking_on = vec![left.id, right.id];
    let register: Register = Arc::new(move |resume: Resume| {
        let decided = Arc::new(AtomicBool::new(false));
        let sides = [
            (Arc::clone(&left), Arc::clone(&right), Arc::clone(&left_wins)),
            (Arc::clone(&right), Arc::clone(&left), Arc::clone(&right_wins)),
        ];
        for (winner, loser, cont) in sides {
            let decided = Arc::clone(&decided);
            let resume = resume.clone();
            winner.on_exit(Box::new(move |exit: &RawExit| {
                if decided
                    .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
                    .is_ok()
                {
                    let exit = exit.clone();
                    resume.resume(Instr::Suspend(Arc::new(move || {
                        cont(exit.clone(), Arc::clone(&loser))
                    })));
                }
            }));
        }
        AsyncOutcome::Pending(None)
    });
    Instr::Async {
        register,
        blocking_on,
        location,
    }
}
