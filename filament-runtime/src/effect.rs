//! # Effects
//!
//! An [`Effect<A, E>`] is an immutable description of a computation that
//! succeeds with an `A`, fails with an `E`, dies with a defect, or is
//! interrupted. Nothing happens until the effect is run by a
//! [`crate::Runtime`] or forked from another effect.
//!
//! Effects are cheap to clone: the description is a tree of reference
//! counted instructions, and running an effect never consumes it.
//!
//! # Example
//!
//! ```rust,ignore
//! use std::time::Duration;
//! use filament_runtime::{Effect, Runtime};
//!
//! let runtime = Runtime::builder().build()?;
//! let program = Effect::<u32, String>::succeed(20)
//!     .zip_left(Effect::sleep(Duration::from_millis(5)))
//!     .map(|n| n + 1)
//!     .ensuring(Effect::sync(|| println!("done")));
//! assert_eq!(runtime.run(program).into_result(), Ok(21));
//! ```

use std::collections::BTreeMap;
use std::convert::Infallible;
use std::fmt;
use std::marker::PhantomData;
use std::panic::Location;
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::cause::{Cause, Defect};
use crate::context::{typed_exit, FiberContext, RawExit, Resume};
use crate::exit::Exit;
use crate::fiber::{Fiber, FiberDescriptor, FiberId, InterruptStatus};
use crate::fiber_ref::{LOG_ANNOTATIONS, LOG_SPANS};
use crate::instr::{downcast, erase, AsyncOutcome, Erased, Instr, Value};
use crate::logger::{LogLevel, LogSpan};
use crate::scope::FiberScope;
use crate::supervisor::Supervisor;
use crate::RuntimeConfig;

/// Values that can flow through effects: success values, typed errors and
/// fiber ref contents. `Debug` lets logged causes show the error itself.
pub trait Data: Clone + Send + Sync + fmt::Debug + 'static {}

impl<T: Clone + Send + Sync + fmt::Debug + 'static> Data for T {}

/// A lazy description of a computation.
pub struct Effect<A, E = Infallible> {
    instr: Instr,
    _marker: PhantomData<fn() -> (A, E)>,
}

impl<A, E> Clone for Effect<A, E> {
    fn clone(&self) -> Self {
        Self::from_instr(self.instr.clone())
    }
}

impl<A, E> fmt::Debug for Effect<A, E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Effect({:?})", self.instr.kind())
    }
}

impl<A, E> Effect<A, E> {
    pub(crate) fn from_instr(instr: Instr) -> Self {
        Self {
            instr,
            _marker: PhantomData,
        }
    }

    pub(crate) fn into_instr(self) -> Instr {
        self.instr
    }
}

/// Resumes a fiber suspended in [`Effect::async_`]. Only the first call on
/// any clone has an effect.
pub struct AsyncCallback<A, E> {
    resume: Resume,
    _marker: PhantomData<fn() -> (A, E)>,
}

impl<A, E> Clone for AsyncCallback<A, E> {
    fn clone(&self) -> Self {
        Self {
            resume: self.resume.clone(),
            _marker: PhantomData,
        }
    }
}

impl<A: Data, E: Data> AsyncCallback<A, E> {
    /// Resume the fiber with `effect`.
    pub fn resume(&self, effect: Effect<A, E>) {
        self.resume.resume(effect.instr);
    }

    /// Resume with a value.
    pub fn succeed(&self, value: A) {
        self.resume(Effect::succeed(value));
    }

    /// Resume with a typed failure.
    pub fn fail(&self, error: E) {
        self.resume(Effect::fail(error));
    }

    /// Resume with an exit.
    pub fn done(&self, exit: Exit<E, A>) {
        self.resume(Effect::done(exit));
    }

    /// The suspended fiber.
    pub fn fiber_id(&self) -> FiberId {
        self.resume.fiber_id()
    }
}

/// What an async registration reports back.
pub enum AsyncReply<A, E> {
    /// The result is already available.
    Ready(Effect<A, E>),
    /// Suspend. The effect, if any, cancels the pending operation when the
    /// fiber is interrupted.
    Pending(Option<Effect<(), Infallible>>),
}

impl<A: Data, E: Data> Effect<A, E> {
    /// Succeed with `value`.
    pub fn succeed(value: A) -> Self {
        Self::from_instr(Instr::Succeed(erase(value)))
    }

    /// Fail with a typed error.
    pub fn fail(error: E) -> Self {
        Self::fail_cause(Cause::fail(error))
    }

    /// Fail with a full cause.
    pub fn fail_cause(cause: Cause<E>) -> Self {
        Self::from_instr(Instr::Fail(cause.map(Erased::new)))
    }

    /// Die with a defect.
    pub fn die(defect: impl Into<Defect>) -> Self {
        Self::from_instr(Instr::Fail(Cause::die(defect)))
    }

    /// Take on the outcome `exit`.
    pub fn done(exit: Exit<E, A>) -> Self {
        match exit {
            Exit::Success(value) => Self::succeed(value),
            Exit::Failure(cause) => Self::fail_cause(cause),
        }
    }

    /// Run a side-effecting function. A panic becomes a defect.
    pub fn sync<F>(f: F) -> Self
    where
        F: Fn() -> A + Send + Sync + 'static,
    {
        Self::from_instr(Instr::Sync(Arc::new(move || erase(f()))))
    }

    /// Run a fallible function, failing with its error.
    pub fn attempt<F>(f: F) -> Self
    where
        F: Fn() -> Result<A, E> + Send + Sync + 'static,
    {
        Self::from_instr(Instr::Suspend(Arc::new(move || match f() {
            Ok(value) => Instr::Succeed(erase(value)),
            Err(error) => Instr::Fail(Cause::fail(Erased::new(error))),
        })))
    }

    /// Build the effect only when it runs.
    pub fn suspend<F>(f: F) -> Self
    where
        F: Fn() -> Effect<A, E> + Send + Sync + 'static,
    {
        Self::from_instr(Instr::Suspend(Arc::new(move || f().instr)))
    }

    /// Suspend the fiber until `register`'s callback is invoked, or
    /// continue immediately if it replies [`AsyncReply::Ready`].
    #[track_caller]
    pub fn async_<F>(register: F) -> Self
    where
        F: Fn(AsyncCallback<A, E>) -> AsyncReply<A, E> + Send + Sync + 'static,
    {
        Self::async_at(Location::caller(), Vec::new(), register)
    }

    /// [`Effect::async_`], recording the fibers being waited on for
    /// diagnostics.
    #[track_caller]
    pub fn async_blocking_on<F>(blocking_on: Vec<FiberId>, register: F) -> Self
    where
        F: Fn(AsyncCallback<A, E>) -> AsyncReply<A, E> + Send + Sync + 'static,
    {
        Self::async_at(Location::caller(), blocking_on, register)
    }

    fn async_at<F>(location: &'static Location<'static>, blocking_on: Vec<FiberId>, register: F) -> Self
    where
        F: Fn(AsyncCallback<A, E>) -> AsyncReply<A, E> + Send + Sync + 'static,
    {
        Self::from_instr(Instr::Async {
            register: Arc::new(move |resume: Resume| {
                let callback = AsyncCallback {
                    resume,
                    _marker: PhantomData,
                };
                match register(callback) {
                    AsyncReply::Ready(effect) => AsyncOutcome::Ready(effect.instr),
                    AsyncReply::Pending(canceler) => {
                        AsyncOutcome::Pending(canceler.map(Effect::into_instr))
                    }
                }
            }),
            blocking_on,
            location,
        })
    }

    /// Never completes. Can still be interrupted.
    #[track_caller]
    pub fn never() -> Self {
        Self::async_(|_| AsyncReply::Pending(None))
    }

    /// Inspect the running fiber.
    pub fn descriptor_with<F>(f: F) -> Self
    where
        F: Fn(FiberDescriptor) -> Effect<A, E> + Send + Sync + 'static,
    {
        Self::from_instr(Instr::Descriptor(Arc::new(move |descriptor: FiberDescriptor| f(descriptor).instr)))
    }

    /// Inspect the current interruptibility.
    pub fn check_interruptible<F>(f: F) -> Self
    where
        F: Fn(InterruptStatus) -> Effect<A, E> + Send + Sync + 'static,
    {
        Self::from_instr(Instr::CheckInterrupt(Arc::new(move |status: InterruptStatus| f(status).instr)))
    }

    /// Interrupt the running fiber.
    pub fn interrupt() -> Self {
        Self::from_instr(Instr::Descriptor(Arc::new(|descriptor: FiberDescriptor| {
            Instr::Fail(Cause::interrupt(descriptor.id))
        })))
    }

    /// Fail as though interrupted by `fiber`.
    pub fn interrupt_as(fiber: FiberId) -> Self {
        Self::from_instr(Instr::Fail(Cause::interrupt(fiber)))
    }

    /// Transform the success value.
    pub fn map<B, F>(self, f: F) -> Effect<B, E>
    where
        B: Data,
        F: Fn(A) -> B + Send + Sync + 'static,
    {
        Effect::from_instr(Instr::FlatMap(
            Arc::new(self.instr),
            Arc::new(move |value: Value| Instr::Succeed(erase(f(downcast::<A>(&value))))),
        ))
    }

    /// Continue with an effect computed from the success value.
    pub fn flat_map<B, F>(self, f: F) -> Effect<B, E>
    where
        B: Data,
        F: Fn(A) -> Effect<B, E> + Send + Sync + 'static,
    {
        Effect::from_instr(Instr::FlatMap(
            Arc::new(self.instr),
            Arc::new(move |value: Value| f(downcast::<A>(&value)).instr),
        ))
    }

    /// Run `that` after `self`, keeping its value.
    pub fn zip_right<B: Data>(self, that: Effect<B, E>) -> Effect<B, E> {
        self.flat_map(move |_| that.clone())
    }

    /// Run `that` after `self`, keeping `self`'s value.
    pub fn zip_left<B: Data>(self, that: Effect<B, E>) -> Effect<A, E> {
        self.flat_map(move |a: A| that.clone().map(move |_| a.clone()))
    }

    /// Run both in sequence and pair the values.
    pub fn zip<B: Data>(self, that: Effect<B, E>) -> Effect<(A, B), E> {
        self.flat_map(move |a: A| that.clone().map(move |b| (a.clone(), b)))
    }

    /// Handle both outcomes with effects.
    pub fn fold_cause_effect<B, E2, F, S>(self, on_failure: F, on_success: S) -> Effect<B, E2>
    where
        B: Data,
        E2: Data,
        F: Fn(Cause<E>) -> Effect<B, E2> + Send + Sync + 'static,
        S: Fn(A) -> Effect<B, E2> + Send + Sync + 'static,
    {
        Effect::from_instr(Instr::Fold(
            Arc::new(self.instr),
            Arc::new(move |cause: Cause<Erased>| on_failure(cause.map(|e| e.downcast::<E>())).instr),
            Arc::new(move |value: Value| on_success(downcast::<A>(&value)).instr),
        ))
    }

    /// Recover from any failure, including defects and interruption.
    pub fn catch_all_cause<E2, F>(self, f: F) -> Effect<A, E2>
    where
        E2: Data,
        F: Fn(Cause<E>) -> Effect<A, E2> + Send + Sync + 'static,
    {
        self.fold_cause_effect(f, Effect::succeed)
    }

    /// Recover from typed failures. Defects and interruption pass through.
    pub fn catch_all<E2, F>(self, f: F) -> Effect<A, E2>
    where
        E2: Data,
        F: Fn(E) -> Effect<A, E2> + Send + Sync + 'static,
    {
        self.catch_all_cause(move |cause| match cause.failure_or_cause() {
            Ok(error) => f(error),
            Err(rest) => Effect::fail_cause(rest.widen()),
        })
    }

    /// Transform the typed error.
    pub fn map_error<E2, F>(self, f: F) -> Effect<A, E2>
    where
        E2: Data,
        F: Fn(E) -> E2 + Send + Sync + 'static,
    {
        self.catch_all_cause(move |cause| Effect::fail_cause(cause.map(&f)))
    }

    /// Succeed with the exit of `self`.
    pub fn exit<E2: Data>(self) -> Effect<Exit<E, A>, E2> {
        self.fold_cause_effect(
            |cause| Effect::succeed(Exit::Failure(cause)),
            |value| Effect::succeed(Exit::Success(value)),
        )
    }

    /// Run `finalizer`, uninterruptibly, however `self` ends. A failure of
    /// the finalizer is added to the outcome.
    pub fn ensuring(self, finalizer: Effect<(), Infallible>) -> Self {
        Self::from_instr(Instr::Ensuring {
            effect: Arc::new(self.instr),
            finalizer: Arc::new(finalizer.instr),
        })
    }

    /// Run `cleanup` if `self` is interrupted.
    pub fn on_interrupt(self, cleanup: Effect<(), Infallible>) -> Self {
        Self::check_interruptible(move |status| {
            let cleanup = cleanup.clone();
            self.clone()
                .with_interrupt_status(status.is_interruptible())
                .fold_cause_effect(
                    move |cause: Cause<E>| {
                        if cause.is_interrupted() {
                            cleanup.clone().lift().zip_right(Effect::fail_cause(cause))
                        } else {
                            Effect::fail_cause(cause)
                        }
                    },
                    Effect::succeed,
                )
                .uninterruptible()
        })
    }

    /// Defer interruption until `self` ends.
    pub fn uninterruptible(self) -> Self {
        self.with_interrupt_status(false)
    }

    /// Allow interruption inside `self`.
    pub fn interruptible(self) -> Self {
        self.with_interrupt_status(true)
    }

    fn with_interrupt_status(self, interruptible: bool) -> Self {
        Self::from_instr(Instr::InterruptStatus {
            effect: Arc::new(self.instr),
            interruptible,
        })
    }

    /// Run `self` on a new fiber owned by the current one.
    #[track_caller]
    pub fn fork<E2: Data>(self) -> Effect<Fiber<A, E>, E2> {
        self.fork_at(None, Location::caller())
    }

    /// Run `self` on a new fiber in the global scope.
    #[track_caller]
    pub fn fork_daemon<E2: Data>(self) -> Effect<Fiber<A, E>, E2> {
        self.fork_at(Some(FiberScope::Global), Location::caller())
    }

    /// Run `self` on a new fiber registered in `scope`.
    #[track_caller]
    pub fn fork_in<E2: Data>(self, scope: FiberScope) -> Effect<Fiber<A, E>, E2> {
        self.fork_at(Some(scope), Location::caller())
    }

    fn fork_at<E2: Data>(
        self,
        scope: Option<FiberScope>,
        location: &'static Location<'static>,
    ) -> Effect<Fiber<A, E>, E2> {
        Effect::from_instr(Instr::Fork {
            effect: Arc::new(self.instr),
            scope,
            wrap: Fiber::<A, E>::erase,
            location,
        })
    }

    /// Run `self` and `that` concurrently; whichever finishes first picks
    /// the continuation, receiving its exit and the other fiber.
    #[track_caller]
    pub fn race_with<B, E2, C, E3, L, R>(self, that: Effect<B, E2>, left_done: L, right_done: R) -> Effect<C, E3>
    where
        B: Data,
        E2: Data,
        C: Data,
        E3: Data,
        L: Fn(Exit<E, A>, Fiber<B, E2>) -> Effect<C, E3> + Send + Sync + 'static,
        R: Fn(Exit<E2, B>, Fiber<A, E>) -> Effect<C, E3> + Send + Sync + 'static,
    {
        Effect::from_instr(Instr::RaceWith {
            left: Arc::new(self.instr),
            right: Arc::new(that.instr),
            left_wins: Arc::new(move |exit: RawExit, loser: Arc<FiberContext>| {
                left_done(typed_exit(&exit), Fiber::from_context(loser)).instr
            }),
            right_wins: Arc::new(move |exit: RawExit, loser: Arc<FiberContext>| {
                right_done(typed_exit(&exit), Fiber::from_context(loser)).instr
            }),
            scope: None,
            location: Location::caller(),
        })
    }

    /// The outcome of whichever of `self` and `that` finishes first. The
    /// other is interrupted and awaited.
    #[track_caller]
    pub fn race(self, that: Effect<A, E>) -> Self {
        self.race_with(
            that,
            |exit, loser: Fiber<A, E>| loser.interrupt::<E>().zip_right(Effect::done(exit)),
            |exit, loser: Fiber<A, E>| loser.interrupt::<E>().zip_right(Effect::done(exit)),
        )
    }

    /// `None` if `self` has not finished within `duration`; it is then
    /// interrupted.
    #[track_caller]
    pub fn timeout(self, duration: Duration) -> Effect<Option<A>, E> {
        self.map(Some)
            .race(Effect::<(), E>::sleep(duration).map(|_| None))
    }

    /// Also report lifecycle events of this fiber and its children to
    /// `supervisor` while `self` runs.
    pub fn supervised(self, supervisor: Arc<dyn Supervisor>) -> Self {
        Self::from_instr(Instr::Supervise {
            effect: Arc::new(self.instr),
            supervisor,
        })
    }

    /// Run `self` with a different runtime configuration.
    pub fn with_runtime_config(self, config: RuntimeConfig) -> Self {
        Self::from_instr(Instr::WithRuntimeConfig {
            effect: Arc::new(self.instr),
            config,
        })
    }

    /// Open a log span around `self`.
    pub fn log_span(self, label: impl Into<String>) -> Self {
        let label = label.into();
        LOG_SPANS.get::<E>().flat_map(move |mut spans: Vec<LogSpan>| {
            spans.push(LogSpan::new(label.clone()));
            LOG_SPANS.locally(spans, self.clone())
        })
    }

    /// Annotate every record logged inside `self`.
    pub fn log_annotate(self, key: impl Into<String>, value: impl Into<String>) -> Self {
        let (key, value) = (key.into(), value.into());
        LOG_ANNOTATIONS
            .get::<E>()
            .flat_map(move |mut annotations: BTreeMap<String, String>| {
                annotations.insert(key.clone(), value.clone());
                LOG_ANNOTATIONS.locally(annotations, self.clone())
            })
    }

    /// Run `self`, then repeat it `n` more times, keeping the last value.
    pub fn repeat_n(self, n: usize) -> Self {
        let again = self.clone();
        self.flat_map(move |value: A| {
            if n == 0 {
                Effect::succeed(value)
            } else {
                again.clone().repeat_n(n - 1)
            }
        })
    }
}

impl<E: Data> Effect<(), E> {
    /// Succeed with `()`.
    pub fn unit() -> Self {
        Self::succeed(())
    }

    /// Let other fibers run before continuing.
    pub fn yield_now() -> Self {
        Self::from_instr(Instr::Yield)
    }

    /// Suspend for `duration`. Interruption cancels the timer.
    #[track_caller]
    pub fn sleep(duration: Duration) -> Self {
        let location = Location::caller();
        Self::descriptor_with(move |descriptor| {
            let timer = Arc::clone(&descriptor.platform.timer);
            let deadline = Instant::now() + duration;
            Self::async_at(location, Vec::new(), move |callback: AsyncCallback<(), E>| {
                let key = timer.schedule(deadline, move || callback.succeed(()));
                let timer = Arc::clone(&timer);
                AsyncReply::Pending(Some(Effect::sync(move || {
                    timer.cancel(key);
                })))
            })
        })
    }

    /// Log `message` at `level`.
    #[track_caller]
    pub fn log(level: LogLevel, message: impl Into<String>) -> Self {
        let message: Arc<str> = Arc::from(message.into());
        Self::from_instr(Instr::Log {
            level,
            message: Arc::new(move || message.to_string()),
            cause: None,
            location: Location::caller(),
        })
    }

    /// Log `message` at `level` with a cause attached.
    #[track_caller]
    pub fn log_cause<E2: Data>(level: LogLevel, message: impl Into<String>, cause: Cause<E2>) -> Self {
        let message: Arc<str> = Arc::from(message.into());
        Self::from_instr(Instr::Log {
            level,
            message: Arc::new(move || message.to_string()),
            cause: Some(cause.map(Erased::new)),
            location: Location::caller(),
        })
    }
}

impl<E: Data> Effect<FiberId, E> {
    /// The running fiber's id.
    pub fn fiber_id() -> Self {
        Self::from_instr(Instr::Descriptor(Arc::new(|descriptor: FiberDescriptor| {
            Instr::Succeed(erase(descriptor.id))
        })))
    }
}

impl<E: Data> Effect<FiberDescriptor, E> {
    /// A snapshot of the running fiber.
    pub fn descriptor() -> Self {
        Self::from_instr(Instr::Descriptor(Arc::new(|descriptor: FiberDescriptor| {
            Instr::Succeed(erase(descriptor))
        })))
    }
}

impl<E: Data> Effect<FiberScope, E> {
    /// The scope children forked here join by default.
    pub fn scope() -> Self {
        Effect::<FiberDescriptor, E>::descriptor().map(|descriptor| descriptor.scope)
    }
}

impl<A: Data> Effect<A, Infallible> {
    /// View an effect that cannot fail at any error type.
    pub fn lift<E2: Data>(self) -> Effect<A, E2> {
        Effect::from_instr(self.instr)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::supervisor::EffectKind;

    #[test]
    fn test_effects_are_descriptions() {
        let effect = Effect::<u32, String>::succeed(1).map(|n| n + 1);
        assert_eq!(effect.clone().into_instr().kind(), EffectKind::FlatMap);
        assert_eq!(format!("{:?}", effect), "Effect(FlatMap)");
    }

    #[test]
    fn test_constructors_pick_instructions() {
        assert_eq!(Effect::<(), ()>::yield_now().into_instr().kind(), EffectKind::Yield);
        assert_eq!(Effect::<u8, ()>::fail(()).into_instr().kind(), EffectKind::Fail);
        assert_eq!(Effect::<u8, ()>::never().into_instr().kind(), EffectKind::Async);
        assert_eq!(
            Effect::<u8, ()>::succeed(1).uninterruptible().into_instr().kind(),
            EffectKind::InterruptStatus
        );
        assert_eq!(
            Effect::<(), ()>::log(LogLevel::Info, "hello").into_instr().kind(),
            EffectKind::Log
        );
    }
}
