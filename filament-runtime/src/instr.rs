//! The closed instruction set the run loop interprets.
//!
//! Every [`crate::Effect`] is a thin typed wrapper over an [`Instr`].
//! Values cross the interpreter type-erased as [`Value`]; the typed facade
//! is the only place that downcasts them, so a mismatch is a bug in this
//! crate rather than in user code.

use std::any::{type_name, Any};
use std::fmt;
use std::panic::Location;
use std::sync::Arc;

use crate::cause::Cause;
use crate::context::{FiberContext, RawExit, Resume};
use crate::fiber::{FiberDescriptor, FiberId, InterruptStatus};
use crate::fiber_ref::FiberRefInner;
use crate::logger::LogLevel;
use crate::runtime::Platform;
use crate::scope::FiberScope;
use crate::supervisor::{EffectKind, Supervisor};
use crate::RuntimeConfig;

/// A type-erased value flowing through the interpreter.
pub(crate) type Value = Arc<dyn Any + Send + Sync>;

pub(crate) type Cont = Arc<dyn Fn(Value) -> Instr + Send + Sync>;
pub(crate) type CauseCont = Arc<dyn Fn(Cause<Erased>) -> Instr + Send + Sync>;
pub(crate) type Register = Arc<dyn Fn(Resume) -> AsyncOutcome + Send + Sync>;
pub(crate) type RaceCont = Arc<dyn Fn(RawExit, Arc<FiberContext>) -> Instr + Send + Sync>;

pub(crate) fn erase<A: Send + Sync + 'static>(value: A) -> Value {
    Arc::new(value)
}

pub(crate) fn unit() -> Value {
    Arc::new(())
}

pub(crate) fn downcast<A: Clone + 'static>(value: &Value) -> A {
    match value.downcast_ref::<A>() {
        Some(a) => a.clone(),
        None => panic!("interpreter value is not a {}", type_name::<A>()),
    }
}

/// A typed failure with its type erased, as carried by causes inside the
/// interpreter and by supervisor callbacks.
#[derive(Clone)]
pub struct Erased {
    value: Value,
    type_name: &'static str,
    render: fn(&Value, &mut fmt::Formatter<'_>) -> fmt::Result,
}

fn render_as<E: fmt::Debug + 'static>(value: &Value, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match value.downcast_ref::<E>() {
        Some(error) => fmt::Debug::fmt(error, f),
        None => write!(f, "<{}>", type_name::<E>()),
    }
}

impl Erased {
    pub(crate) fn new<E: fmt::Debug + Send + Sync + 'static>(error: E) -> Self {
        Self {
            value: Arc::new(error),
            type_name: type_name::<E>(),
            render: render_as::<E>,
        }
    }

    /// Borrow the error if it has type `E`.
    pub fn downcast_ref<E: 'static>(&self) -> Option<&E> {
        self.value.downcast_ref::<E>()
    }

    /// Name of the original error type.
    pub fn type_name(&self) -> &'static str {
        self.type_name
    }

    pub(crate) fn downcast<E: Clone + 'static>(&self) -> E {
        downcast(&self.value)
    }
}

impl fmt::Debug for Erased {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        (self.render)(&self.value, f)
    }
}

impl PartialEq for Erased {
    fn eq(&self, other: &Self) -> bool {
        std::ptr::addr_eq(Arc::as_ptr(&self.value), Arc::as_ptr(&other.value))
    }
}

/// Reply of an async registration.
pub(crate) enum AsyncOutcome {
    /// Continue immediately with this instruction.
    Ready(Instr),
    /// Suspend; the optional instruction cancels the pending operation.
    Pending(Option<Instr>),
}

#[derive(Clone)]
pub(crate) enum Instr {
    Succeed(Value),
    Sync(Arc<dyn Fn() -> Value + Send + Sync>),
    Suspend(Arc<dyn Fn() -> Instr + Send + Sync>),
    FlatMap(Arc<Instr>, Cont),
    Fold(Arc<Instr>, CauseCont, Cont),
    Fail(Cause<Erased>),
    Async {
        register: Register,
        blocking_on: Vec<FiberId>,
        location: &'static Location<'static>,
    },
    Fork {
        effect: Arc<Instr>,
        scope: Option<FiberScope>,
        wrap: fn(Arc<FiberContext>) -> Value,
        location: &'static Location<'static>,
    },
    InterruptStatus {
        effect: Arc<Instr>,
        interruptible: bool,
    },
    CheckInterrupt(Arc<dyn Fn(InterruptStatus) -> Instr + Send + Sync>),
    Descriptor(Arc<dyn Fn(FiberDescriptor) -> Instr + Send + Sync>),
    RaceWith {
        left: Arc<Instr>,
        right: Arc<Instr>,
        left_wins: RaceCont,
        right_wins: RaceCont,
        scope: Option<FiberScope>,
        location: &'static Location<'static>,
    },
    Ensuring {
        effect: Arc<Instr>,
        finalizer: Arc<Instr>,
    },
    Yield,
    FiberRefModify {
        fiber_ref: Arc<FiberRefInner>,
        f: Arc<dyn Fn(Value) -> (Value, Value) + Send + Sync>,
    },
    Supervise {
        effect: Arc<Instr>,
        supervisor: Arc<dyn Supervisor>,
    },
    WithRuntimeConfig {
        effect: Arc<Instr>,
        config: RuntimeConfig,
    },
    SetPlatform(Arc<Platform>),
    Log {
        level: LogLevel,
        message: Arc<dyn Fn() -> String + Send + Sync>,
        cause: Option<Cause<Erased>>,
        location: &'static Location<'static>,
    },
}

impl Instr {
    pub(crate) fn unit() -> Instr {
        Instr::Succeed(unit())
    }

    /// Sequence `self` then `next`, discarding the first value.
    pub(crate) fn then(self, next: Instr) -> Instr {
        Instr::FlatMap(Arc::new(self), Arc::new(move |_: Value| next.clone()))
    }

    pub(crate) fn from_exit(exit: RawExit) -> Instr {
        match exit {
            crate::Exit::Success(value) => Instr::Succeed(value),
            crate::Exit::Failure(cause) => Instr::Fail(cause),
        }
    }

    pub(crate) fn kind(&self) -> EffectKind {
        match self {
            Instr::Succeed(_) => EffectKind::Succeed,
            Instr::Sync(_) => EffectKind::Sync,
            Instr::Suspend(_) => EffectKind::Suspend,
            Instr::FlatMap(..) => EffectKind::FlatMap,
            Instr::Fold(..) => EffectKind::Fold,
            Instr::Fail(_) => EffectKind::Fail,
            Instr::Async { .. } => EffectKind::Async,
            Instr::Fork { .. } => EffectKind::Fork,
            Instr::InterruptStatus { .. } => EffectKind::InterruptStatus,
            Instr::CheckInterrupt(_) => EffectKind::CheckInterrupt,
            Instr::Descriptor(_) => EffectKind::Descriptor,
            Instr::RaceWith { .. } => EffectKind::RaceWith,
            Instr::Ensuring { .. } => EffectKind::Ensuring,
            Instr::Yield => EffectKind::Yield,
            Instr::FiberRefModify { .. } => EffectKind::FiberRefModify,
            Instr::Supervise { .. } => EffectKind::Supervise,
            Instr::WithRuntimeConfig { .. } => EffectKind::WithRuntimeConfig,
            Instr::SetPlatform(_) => EffectKind::SetPlatform,
            Instr::Log { .. } => EffectKind::Log,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_erased_identity() {
        let a = Erased::new("boom");
        let b = a.clone();
        let c = Erased::new("boom");
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(a.downcast_ref::<&str>(), Some(&"boom"));
        assert_eq!(format!("{:?}", a), "\"boom\"");
        assert_eq!(format!("{:?}", Cause::fail(Erased::new(7u8))), "Fail(7)");
    }

    #[test]
    fn test_downcast_roundtrip() {
        let v = erase(41_u32);
        assert_eq!(downcast::<u32>(&v) + 1, 42);
    }

    #[test]
    #[should_panic(expected = "interpreter value is not a")]
    fn test_downcast_mismatch_panics() {
        let v = erase("text");
        let _ = downcast::<u64>(&v);
    }
}
