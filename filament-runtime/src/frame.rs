//! Continuation frames.
//!
//! A fiber's call stack is a `Vec<Frame>` owned by its context. Frames are
//! pushed by `FlatMap`, `Fold`, `Ensuring` and `InterruptStatus` and popped
//! either by a successful value (continuing with the frame) or by unwinding
//! after a failure.

use crate::context::RawExit;
use crate::instr::{CauseCont, Cont, Instr};

pub(crate) enum Frame {
    /// Restore the interruptibility in force before the region began.
    InterruptExit,
    /// Run the effect, uninterruptibly, however the region ends.
    Finalizer(Instr),
    /// Handle both outcomes.
    Fold { on_failure: CauseCont, on_success: Cont },
    /// Continue with the success value; skipped during unwinding.
    Apply(Cont),
    /// Left beneath a running finalizer: resumes the outcome the finalizer
    /// interrupted, and absorbs the finalizer's own failure into it.
    Replay(RawExit),
}

impl Frame {
    pub(crate) fn name(&self) -> &'static str {
        match self {
            Frame::InterruptExit => "interrupt-exit",
            Frame::Finalizer(_) => "finalizer",
            Frame::Fold { .. } => "fold",
            Frame::Apply(_) => "apply",
            Frame::Replay(_) => "replay",
        }
    }
}
