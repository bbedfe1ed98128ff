//! Fiber state machine.
//!
//! [`FiberState`] is the part of a fiber other threads may touch: its
//! status, observers, pending interruptors, async canceler and mailbox.
//! The context keeps it behind a short-lived mutex. Every method here is a
//! pure transition; anything with side effects (running a canceler,
//! notifying observers) is handed back to the caller to perform after the
//! lock is released.

use std::collections::BTreeSet;
use std::panic::Location;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::cause::Cause;
use crate::context::RawExit;
use crate::exit::Exit;
use crate::fiber::{FiberId, FiberStatus};
use crate::instr::{Erased, Instr};

/// Callback run once with the fiber's exit.
pub(crate) type Observer = Box<dyn FnOnce(&RawExit) + Send>;

static NEXT_OBSERVER: AtomicU64 = AtomicU64::new(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct ObserverId(u64);

impl ObserverId {
    pub(crate) fn next() -> Self {
        ObserverId(NEXT_OBSERVER.fetch_add(1, Ordering::Relaxed))
    }
}

/// Cancellation handle of the current async suspension.
pub(crate) enum CancelerState {
    Empty,
    Pending,
    Registered(Instr),
}

pub(crate) struct Executing {
    status: FiberStatus,
    observers: Vec<(ObserverId, Observer)>,
    suppressed: Cause<Erased>,
    interruptors: BTreeSet<FiberId>,
    async_canceler: CancelerState,
    mailbox: Option<Instr>,
}

pub(crate) enum FiberState {
    Executing(Executing),
    Done(RawExit),
}

/// Result of [`FiberState::try_done`].
pub(crate) enum TryDone {
    /// Run the mailbox, then try again with the exit.
    Mailbox(Instr, RawExit),
    /// Interrupt and await the children, then try again with the exit.
    Children(RawExit),
    /// The fiber is done; notify these observers.
    Done(RawExit, Vec<Observer>),
    /// Already done; nothing to do.
    AlreadyDone,
}

impl FiberState {
    pub(crate) fn initial() -> Self {
        FiberState::Executing(Executing {
            status: FiberStatus::Running {
                interrupting: false,
            },
            observers: Vec::new(),
            suppressed: Cause::Empty,
            interruptors: BTreeSet::new(),
            async_canceler: CancelerState::Empty,
            mailbox: None,
        })
    }

    pub(crate) fn is_done(&self) -> bool {
        matches!(self, FiberState::Done(_))
    }

    pub(crate) fn exit(&self) -> Option<&RawExit> {
        match self {
            FiberState::Done(exit) => Some(exit),
            FiberState::Executing(_) => None,
        }
    }

    pub(crate) fn status(&self) -> FiberStatus {
        match self {
            FiberState::Executing(ex) => ex.status.clone(),
            FiberState::Done(_) => FiberStatus::Done,
        }
    }

    pub(crate) fn interruptors(&self) -> BTreeSet<FiberId> {
        match self {
            FiberState::Executing(ex) => ex.interruptors.clone(),
            FiberState::Done(_) => BTreeSet::new(),
        }
    }

    /// Append `effect` to the mailbox. `false` once the fiber is done.
    pub(crate) fn add_message(&mut self, effect: Instr) -> bool {
        match self {
            FiberState::Executing(ex) => {
                ex.mailbox = Some(match ex.mailbox.take() {
                    Some(queued) => queued.then(effect),
                    None => effect,
                });
                true
            }
            FiberState::Done(_) => false,
        }
    }

    pub(crate) fn take_mailbox(&mut self) -> Option<Instr> {
        match self {
            FiberState::Executing(ex) => ex.mailbox.take(),
            FiberState::Done(_) => None,
        }
    }

    /// Register an observer. When the fiber is already done the observer
    /// is dropped and the exit handed back instead.
    pub(crate) fn add_observer(&mut self, id: ObserverId, observer: Observer) -> Option<RawExit> {
        match self {
            FiberState::Executing(ex) => {
                ex.observers.push((id, observer));
                None
            }
            FiberState::Done(exit) => Some(exit.clone()),
        }
    }

    pub(crate) fn remove_observer(&mut self, id: ObserverId) {
        if let FiberState::Executing(ex) = self {
            ex.observers.retain(|(observer, _)| *observer != id);
        }
    }

    pub(crate) fn is_interrupted(&self) -> bool {
        match self {
            FiberState::Executing(ex) => !ex.interruptors.is_empty(),
            FiberState::Done(_) => false,
        }
    }

    pub(crate) fn is_interrupting(&self) -> bool {
        match self {
            FiberState::Executing(ex) => ex.status.is_interrupting(),
            FiberState::Done(_) => false,
        }
    }

    pub(crate) fn set_interrupting(&mut self, value: bool) {
        if let FiberState::Executing(ex) = self {
            ex.status.set_interrupting(value);
        }
    }

    pub(crate) fn add_suppressed(&mut self, cause: Cause<Erased>) {
        if let FiberState::Executing(ex) = self {
            let suppressed = std::mem::take(&mut ex.suppressed);
            ex.suppressed = suppressed.then(cause);
        }
    }

    /// Take the suppressed cause, extended with the interruptors unless it
    /// already records them.
    pub(crate) fn clear_suppressed(&mut self) -> Cause<Erased> {
        match self {
            FiberState::Executing(ex) => {
                let suppressed = std::mem::take(&mut ex.suppressed);
                let interrupted = interrupted_cause(&ex.interruptors);
                if suppressed.contains(&interrupted) {
                    suppressed
                } else {
                    suppressed.then(interrupted)
                }
            }
            FiberState::Done(_) => Cause::Empty,
        }
    }

    /// Move from `Running` to `Suspended` for async epoch `epoch`.
    pub(crate) fn enter_async(
        &mut self,
        epoch: u64,
        interruptible: bool,
        blocking_on: Vec<FiberId>,
        trace: &'static Location<'static>,
    ) {
        if let FiberState::Executing(ex) = self {
            let interrupting = match ex.status {
                FiberStatus::Running { interrupting } => interrupting,
                _ => panic!("fiber suspended while not running"),
            };
            ex.status = FiberStatus::Suspended {
                interrupting,
                interruptible: interruptible && !interrupting,
                epoch,
                blocking_on,
                trace: Some(trace),
            };
            ex.async_canceler = CancelerState::Pending;
        }
    }

    /// Move back to `Running` if still suspended in `epoch`. Exactly one
    /// caller per suspension observes `true`.
    pub(crate) fn exit_async(&mut self, epoch: u64) -> bool {
        match self {
            FiberState::Executing(ex) => match ex.status {
                FiberStatus::Suspended {
                    interrupting,
                    epoch: current,
                    ..
                } if current == epoch => {
                    ex.status = FiberStatus::Running { interrupting };
                    ex.async_canceler = CancelerState::Empty;
                    true
                }
                _ => false,
            },
            FiberState::Done(_) => false,
        }
    }

    pub(crate) fn set_async_canceler(&mut self, epoch: u64, canceler: Instr) {
        if let FiberState::Executing(ex) = self {
            let suspended_in_epoch = matches!(
                ex.status,
                FiberStatus::Suspended { epoch: current, .. } if current == epoch
            );
            match ex.async_canceler {
                CancelerState::Pending if suspended_in_epoch => {
                    ex.async_canceler = CancelerState::Registered(canceler);
                }
                CancelerState::Registered(_) => panic!("inconsistent async canceler state"),
                _ => {}
            }
        }
    }

    /// Record `by` as an interruptor. Returns the canceler to run now when
    /// the fiber is suspended interruptibly with one registered; the fiber is
    /// then already marked running and interrupting.
    pub(crate) fn interrupt_as(&mut self, by: FiberId) -> Option<Instr> {
        let ex = match self {
            FiberState::Executing(ex) => ex,
            FiberState::Done(_) => return None,
        };
        ex.interruptors.insert(by);
        let interruptible = matches!(
            ex.status,
            FiberStatus::Suspended {
                interruptible: true,
                ..
            }
        );
        if !interruptible || !matches!(ex.async_canceler, CancelerState::Registered(_)) {
            return None;
        }
        ex.status = FiberStatus::Running { interrupting: true };
        match std::mem::replace(&mut ex.async_canceler, CancelerState::Empty) {
            CancelerState::Registered(canceler) => Some(canceler),
            _ => None,
        }
    }

    pub(crate) fn try_done(&mut self, exit: RawExit, children_pending: bool) -> TryDone {
        let ex = match self {
            FiberState::Executing(ex) => ex,
            FiberState::Done(_) => return TryDone::AlreadyDone,
        };
        if let Some(mailbox) = ex.mailbox.take() {
            return TryDone::Mailbox(mailbox, exit);
        }
        if children_pending {
            return TryDone::Children(exit);
        }
        let interrupted = interrupted_cause(&ex.interruptors);
        let exit = match exit {
            Exit::Failure(cause) if !cause.contains(&interrupted) => {
                Exit::Failure(cause.then(interrupted))
            }
            other => other,
        };
        let observers = std::mem::take(&mut ex.observers)
            .into_iter()
            .map(|(_, observer)| observer)
            .collect();
        *self = FiberState::Done(exit.clone());
        TryDone::Done(exit, observers)
    }
}

fn interrupted_cause(interruptors: &BTreeSet<FiberId>) -> Cause<Erased> {
    interruptors
        .iter()
        .fold(Cause::Empty, |acc, id| acc.both(Cause::interrupt(*id)))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fid(n: u64) -> FiberId {
        FiberId::new(0, n)
    }

    fn here() -> &'static Location<'static> {
        Location::caller()
    }

    #[test]
    fn test_exit_async_only_once_per_epoch() {
        let mut state = FiberState::initial();
        state.enter_async(1, true, Vec::new(), here());
        assert!(matches!(state.status(), FiberStatus::Suspended { epoch: 1, .. }));
        assert!(!state.exit_async(2));
        assert!(state.exit_async(1));
        assert!(!state.exit_async(1));
        assert_eq!(state.status(), FiberStatus::Running { interrupting: false });
    }

    #[test]
    fn test_interrupt_takes_registered_canceler() {
        let mut state = FiberState::initial();
        state.enter_async(1, true, Vec::new(), here());
        assert!(state.interrupt_as(fid(9)).is_none());

        state.set_async_canceler(1, Instr::unit());
        let canceler = state.interrupt_as(fid(9));
        assert!(canceler.is_some());
        assert_eq!(state.status(), FiberStatus::Running { interrupting: true });
        assert!(!state.exit_async(1));
        assert!(state.is_interrupted());
    }

    #[test]
    fn test_uninterruptible_suspension_keeps_canceler() {
        let mut state = FiberState::initial();
        state.enter_async(1, false, Vec::new(), here());
        state.set_async_canceler(1, Instr::unit());
        assert!(state.interrupt_as(fid(3)).is_none());
        assert!(state.exit_async(1));
    }

    #[test]
    #[should_panic(expected = "inconsistent async canceler state")]
    fn test_double_canceler_panics() {
        let mut state = FiberState::initial();
        state.enter_async(1, true, Vec::new(), here());
        state.set_async_canceler(1, Instr::unit());
        state.set_async_canceler(1, Instr::unit());
    }

    #[test]
    fn test_try_done_merges_interruptors() {
        let mut state = FiberState::initial();
        state.interrupt_as(fid(5));
        match state.try_done(Exit::Failure(Cause::die("boom")), false) {
            TryDone::Done(Exit::Failure(cause), observers) => {
                assert!(observers.is_empty());
                assert!(cause.is_die());
                assert!(cause.interruptors().contains(&fid(5)));
            }
            _ => panic!("expected done"),
        }
        assert!(state.is_done());
        assert!(matches!(state.try_done(Exit::Success(crate::instr::unit()), false), TryDone::AlreadyDone));
    }

    #[test]
    fn test_try_done_drains_mailbox_first() {
        let mut state = FiberState::initial();
        assert!(state.add_message(Instr::unit()));
        assert!(matches!(
            state.try_done(Exit::Success(crate::instr::unit()), true),
            TryDone::Mailbox(..)
        ));
        assert!(matches!(
            state.try_done(Exit::Success(crate::instr::unit()), true),
            TryDone::Children(_)
        ));
        assert!(matches!(
            state.try_done(Exit::Success(crate::instr::unit()), false),
            TryDone::Done(..)
        ));
        assert!(!state.add_message(Instr::unit()));
    }

    #[test]
    fn test_clear_suppressed_includes_interruptors_once() {
        let mut state = FiberState::initial();
        state.interrupt_as(fid(2));
        state.add_suppressed(Cause::interrupt(fid(2)));
        assert_eq!(state.clear_suppressed(), Cause::Interrupt(fid(2)));
        assert_eq!(state.clear_suppressed(), Cause::Interrupt(fid(2)));
    }

    #[test]
    fn test_observers_returned_when_done() {
        let mut state = FiberState::initial();
        let id = ObserverId::next();
        assert!(state.add_observer(id, Box::new(|_| {})).is_none());
        state.remove_observer(id);
        assert!(state.add_observer(ObserverId::next(), Box::new(|_| {})).is_none());
        match state.try_done(Exit::Success(crate::instr::unit()), false) {
            TryDone::Done(_, observers) => assert_eq!(observers.len(), 1),
            _ => panic!("expected done"),
        }
        assert!(state.add_observer(ObserverId::next(), Box::new(|_| {})).is_some());
    }
}
