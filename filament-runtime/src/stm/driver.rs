//! Runs one attempt of a transaction against a journal.
//!
//! The program is interpreted synchronously with an explicit frame stack,
//! the same way the fiber run loop walks its continuation stack. Recovery
//! frames carry a journal snapshot so a failed or retried branch leaves no
//! writes behind. Every [`REVALIDATE_EVERY`] steps the journal is checked,
//! so an attempt that read an inconsistent snapshot cannot run forever.

use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;

use crate::cause::{Cause, Defect};
use crate::fiber::FiberId;
use crate::instr::{Erased, Instr, Value};
use crate::stm::journal::Journal;

pub(crate) type Access = Arc<dyn Fn(&mut Journal, FiberId) -> Value + Send + Sync>;
type StmCont = Arc<dyn Fn(Value) -> StmInstr + Send + Sync>;

/// Steps between journal revalidations.
pub(crate) const REVALIDATE_EVERY: u32 = 64;

#[derive(Clone)]
pub(crate) enum StmInstr {
    Succeed(Value),
    Fail(Erased),
    Die(Defect),
    Retry,
    Interrupt,
    Access(Access),
    Suspend(Arc<dyn Fn() -> StmInstr + Send + Sync>),
    FlatMap(Arc<StmInstr>, StmCont),
    CatchAll(Arc<StmInstr>, Arc<dyn Fn(Erased) -> StmInstr + Send + Sync>),
    OrElse(Arc<StmInstr>, Arc<StmInstr>),
}

/// How an attempt ended.
pub(crate) enum TExit {
    Succeed(Value),
    Fail(Erased),
    Die(Defect),
    Interrupt(FiberId),
    Retry,
    /// A read went stale mid-attempt.
    Stale,
}

impl TExit {
    pub(crate) fn into_instr(self) -> Instr {
        match self {
            TExit::Succeed(value) => Instr::Succeed(value),
            TExit::Fail(error) => Instr::Fail(Cause::fail(error)),
            TExit::Die(defect) => Instr::Fail(Cause::die(defect)),
            TExit::Interrupt(fiber) => Instr::Fail(Cause::interrupt(fiber)),
            TExit::Retry => panic!("retry has no exit"),
            TExit::Stale => panic!("stale attempt has no exit"),
        }
    }
}

enum Frame {
    FlatMap(StmCont),
    CatchAll {
        handler: Arc<dyn Fn(Erased) -> StmInstr + Send + Sync>,
        snapshot: Journal,
    },
    OrElse {
        alternative: Arc<StmInstr>,
        snapshot: Journal,
    },
}

/// Run `program` to a terminal outcome. A panic in user code is returned
/// as its payload; the journal then holds whatever was read before it.
pub(crate) fn run(
    program: &StmInstr,
    journal: &mut Journal,
    fiber_id: FiberId,
) -> Result<TExit, Box<dyn Any + Send>> {
    panic::catch_unwind(AssertUnwindSafe(|| drive(program.clone(), journal, fiber_id)))
}

fn drive(mut current: StmInstr, journal: &mut Journal, fiber_id: FiberId) -> TExit {
    let mut stack: Vec<Frame> = Vec::new();
    let mut steps: u32 = 0;
    loop {
        steps = steps.wrapping_add(1);
        if steps % REVALIDATE_EVERY == 0 && !journal.is_valid() {
            return TExit::Stale;
        }
        current = match current {
            StmInstr::Succeed(value) => match continue_with(&mut stack, value) {
                Ok(next) => next,
                Err(value) => return TExit::Succeed(value),
            },
            StmInstr::Access(access) => {
                let value = access(journal, fiber_id);
                match continue_with(&mut stack, value) {
                    Ok(next) => next,
                    Err(value) => return TExit::Succeed(value),
                }
            }
            StmInstr::Suspend(build) => build(),
            StmInstr::FlatMap(inner, cont) => {
                stack.push(Frame::FlatMap(cont));
                Arc::unwrap_or_clone(inner)
            }
            StmInstr::CatchAll(inner, handler) => {
                stack.push(Frame::CatchAll {
                    handler,
                    snapshot: journal.snapshot(),
                });
                Arc::unwrap_or_clone(inner)
            }
            StmInstr::OrElse(left, right) => {
                stack.push(Frame::OrElse {
                    alternative: right,
                    snapshot: journal.snapshot(),
                });
                Arc::unwrap_or_clone(left)
            }
            StmInstr::Fail(error) => loop {
                match stack.pop() {
                    Some(Frame::CatchAll { handler, snapshot }) => {
                        journal.rollback_to(&snapshot);
                        break handler(error);
                    }
                    Some(_) => continue,
                    None => return TExit::Fail(error),
                }
            },
            StmInstr::Retry => loop {
                match stack.pop() {
                    Some(Frame::OrElse { alternative, snapshot }) => {
                        journal.rollback_to(&snapshot);
                        break Arc::unwrap_or_clone(alternative);
                    }
                    Some(_) => continue,
                    None => return TExit::Retry,
                }
            },
            StmInstr::Die(defect) => return TExit::Die(defect),
            StmInstr::Interrupt => return TExit::Interrupt(fiber_id),
        };
    }
}

/// Pass `value` to the nearest continuation, leaving any recovery frames
/// it crosses. `Err` when the stack is empty.
fn continue_with(stack: &mut Vec<Frame>, value: Value) -> Result<StmInstr, Value> {
    while let Some(frame) = stack.pop() {
        if let Frame::FlatMap(cont) = frame {
            return Ok(cont(value));
        }
    }
    Err(value)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::instr::{downcast, erase};
    use crate::stm::tref::TRefCell;

    fn id() -> FiberId {
        FiberId::new(0, 7)
    }

    fn write(cell: &Arc<TRefCell>, value: i32) -> StmInstr {
        let cell = Arc::clone(cell);
        StmInstr::Access(Arc::new(move |journal: &mut Journal, _: FiberId| {
            journal.write(&cell, erase(value));
            erase(())
        }))
    }

    fn then(first: StmInstr, next: StmInstr) -> StmInstr {
        StmInstr::FlatMap(Arc::new(first), Arc::new(move |_: Value| next.clone()))
    }

    #[test]
    fn test_flat_map_chain() {
        let program = StmInstr::FlatMap(
            Arc::new(StmInstr::Succeed(erase(20i32))),
            Arc::new(|value: Value| StmInstr::Succeed(erase(downcast::<i32>(&value) + 22))),
        );
        let mut journal = Journal::new();
        match run(&program, &mut journal, id()).unwrap() {
            TExit::Succeed(value) => assert_eq!(downcast::<i32>(&value), 42),
            _ => panic!("expected success"),
        }
    }

    #[test]
    fn test_catch_all_rolls_back_branch() {
        let cell = TRefCell::new(erase(0i32));
        let failing = then(write(&cell, 1), StmInstr::Fail(Erased::new("no")));
        let program = StmInstr::CatchAll(Arc::new(failing), Arc::new(|_: Erased| StmInstr::Succeed(erase(()))));
        let mut journal = Journal::new();
        assert!(matches!(run(&program, &mut journal, id()).unwrap(), TExit::Succeed(_)));
        assert_eq!(downcast::<i32>(&journal.read(&cell)), 0);
    }

    #[test]
    fn test_or_else_on_retry() {
        let cell = TRefCell::new(erase(0i32));
        let left = then(write(&cell, 1), StmInstr::Retry);
        let program = StmInstr::OrElse(Arc::new(left), Arc::new(write(&cell, 2)));
        let mut journal = Journal::new();
        assert!(matches!(run(&program, &mut journal, id()).unwrap(), TExit::Succeed(_)));
        assert_eq!(downcast::<i32>(&journal.read(&cell)), 2);
    }

    #[test]
    fn test_or_else_does_not_catch_failure() {
        let program = StmInstr::OrElse(
            Arc::new(StmInstr::Fail(Erased::new(1u8))),
            Arc::new(StmInstr::Succeed(erase(()))),
        );
        let mut journal = Journal::new();
        assert!(matches!(run(&program, &mut journal, id()).unwrap(), TExit::Fail(_)));
    }

    fn spin() -> StmInstr {
        StmInstr::Suspend(Arc::new(spin))
    }

    fn countdown(n: u32) -> StmInstr {
        if n == 0 {
            StmInstr::Succeed(erase(()))
        } else {
            StmInstr::Suspend(Arc::new(move || countdown(n - 1)))
        }
    }

    #[test]
    fn test_stale_read_stops_endless_attempt() {
        let cell = TRefCell::new(erase(0i32));
        let read = {
            let cell = Arc::clone(&cell);
            StmInstr::Access(Arc::new(move |journal: &mut Journal, _: FiberId| journal.read(&cell)))
        };
        let concurrent_commit = {
            let cell = Arc::clone(&cell);
            StmInstr::Access(Arc::new(move |_: &mut Journal, _: FiberId| {
                cell.store(erase(1i32));
                erase(())
            }))
        };
        let program = then(read, then(concurrent_commit, spin()));
        let mut journal = Journal::new();
        assert!(matches!(run(&program, &mut journal, id()).unwrap(), TExit::Stale));
    }

    #[test]
    fn test_long_attempt_with_valid_reads_completes() {
        let cell = TRefCell::new(erase(0i32));
        let program = then(write(&cell, 3), countdown(REVALIDATE_EVERY * 4));
        let mut journal = Journal::new();
        assert!(matches!(run(&program, &mut journal, id()).unwrap(), TExit::Succeed(_)));
        assert_eq!(downcast::<i32>(&journal.read(&cell)), 3);
    }

    #[test]
    fn test_interrupt_and_panic() {
        let mut journal = Journal::new();
        match run(&StmInstr::Interrupt, &mut journal, id()).unwrap() {
            TExit::Interrupt(fiber) => assert_eq!(fiber, id()),
            _ => panic!("expected interrupt"),
        }
        let panicking = StmInstr::Suspend(Arc::new(|| -> StmInstr { panic!("bad read") }));
        assert!(run(&panicking, &mut journal, id()).is_err());
    }
}
