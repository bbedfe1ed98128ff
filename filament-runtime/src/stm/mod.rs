//! # Software Transactional Memory
//!
//! An [`Stm<A, E>`] describes a transaction over [`TRef`] cells. Running
//! it with [`Stm::commit`] (or [`atomically`]) yields an [`Effect`] that
//! executes the transaction with all-or-nothing visibility:
//!
//! - every attempt runs against a fresh journal; no cell is written until
//!   the attempt commits;
//! - conflicts are detected, not prevented: an attempt whose reads went
//!   stale re-runs;
//! - [`Stm::retry`] abandons the attempt and suspends the fiber until a
//!   cell it read is committed to by another transaction.
//!
//! # Example
//!
//! ```rust,ignore
//! use filament_runtime::stm::{atomically, Stm, TRef};
//!
//! let account = TRef::new(100u64);
//! let withdraw = account
//!     .get()
//!     .flat_map(move |balance| Stm::check(balance >= 30).zip_right(account.set(balance - 30)));
//! runtime.run(atomically::<(), String>(withdraw));
//! ```

mod commit;
mod driver;
mod journal;
mod tref;

pub use tref::TRef;

use std::convert::Infallible;
use std::fmt;
use std::marker::PhantomData;
use std::sync::Arc;

use crate::cause::Defect;
use crate::effect::{Data, Effect};
use crate::fiber::FiberId;
use crate::instr::{downcast, erase, Erased, Value};
use driver::StmInstr;
use journal::Journal;

/// A transaction that succeeds with an `A` or fails with an `E`.
pub struct Stm<A, E = Infallible> {
    instr: StmInstr,
    _marker: PhantomData<fn() -> (A, E)>,
}

impl<A, E> Clone for Stm<A, E> {
    fn clone(&self) -> Self {
        Self::from_instr(self.instr.clone())
    }
}

impl<A, E> fmt::Debug for Stm<A, E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Stm")
    }
}

impl<A, E> Stm<A, E> {
    fn from_instr(instr: StmInstr) -> Self {
        Self {
            instr,
            _marker: PhantomData,
        }
    }
}

impl<A: Data, E: Data> Stm<A, E> {
    pub(crate) fn access<F>(f: F) -> Self
    where
        F: Fn(&mut Journal) -> A + Send + Sync + 'static,
    {
        Self::from_instr(StmInstr::Access(Arc::new(move |journal: &mut Journal, _: FiberId| {
            erase(f(journal))
        })))
    }

    /// Succeed with `value`.
    pub fn succeed(value: A) -> Self {
        Self::from_instr(StmInstr::Succeed(erase(value)))
    }

    /// Fail with a typed error. Staged writes are discarded.
    pub fn fail(error: E) -> Self {
        Self::from_instr(StmInstr::Fail(Erased::new(error)))
    }

    /// Die with a defect.
    pub fn die(defect: impl Into<Defect>) -> Self {
        Self::from_instr(StmInstr::Die(defect.into()))
    }

    /// Abandon this attempt and wait until a cell read so far changes.
    pub fn retry() -> Self {
        Self::from_instr(StmInstr::Retry)
    }

    /// Build the transaction only when an attempt reaches it.
    pub fn suspend<F>(f: F) -> Self
    where
        F: Fn() -> Stm<A, E> + Send + Sync + 'static,
    {
        Self::from_instr(StmInstr::Suspend(Arc::new(move || f().instr)))
    }

    /// Interrupt the fiber running the transaction.
    pub fn interrupt() -> Self {
        Self::from_instr(StmInstr::Interrupt)
    }

    /// Transform the success value.
    pub fn map<B, F>(self, f: F) -> Stm<B, E>
    where
        B: Data,
        F: Fn(A) -> B + Send + Sync + 'static,
    {
        self.flat_map(move |a| Stm::succeed(f(a)))
    }

    /// Continue with a transaction built from the success value.
    pub fn flat_map<B, F>(self, f: F) -> Stm<B, E>
    where
        B: Data,
        F: Fn(A) -> Stm<B, E> + Send + Sync + 'static,
    {
        Stm::from_instr(StmInstr::FlatMap(
            Arc::new(self.instr),
            Arc::new(move |value: Value| f(downcast::<A>(&value)).instr),
        ))
    }

    /// Run `that` after this, keeping its value.
    pub fn zip_right<B: Data>(self, that: Stm<B, E>) -> Stm<B, E> {
        self.flat_map(move |_| that.clone())
    }

    /// Recover from a typed failure. Writes made by the failed branch are
    /// rolled back; its reads stay part of the transaction.
    pub fn catch_all<E2, F>(self, f: F) -> Stm<A, E2>
    where
        E2: Data,
        F: Fn(E) -> Stm<A, E2> + Send + Sync + 'static,
    {
        Stm::from_instr(StmInstr::CatchAll(
            Arc::new(self.instr),
            Arc::new(move |error: Erased| f(error.downcast::<E>()).instr),
        ))
    }

    /// If this retries, roll back its writes and run `that` instead. The
    /// transaction waits on the reads of both branches.
    pub fn or_else(self, that: Stm<A, E>) -> Self {
        Self::from_instr(StmInstr::OrElse(Arc::new(self.instr), Arc::new(that.instr)))
    }

    /// Run the transaction atomically on the current fiber.
    pub fn commit(self) -> Effect<A, E> {
        commit::commit(self.instr)
    }
}

impl<E: Data> Stm<(), E> {
    /// Retry unless `condition` holds.
    pub fn check(condition: bool) -> Self {
        if condition {
            Self::succeed(())
        } else {
            Self::retry()
        }
    }
}

impl<E: Data> Stm<FiberId, E> {
    /// The id of the fiber running the transaction.
    pub fn fiber_id() -> Self {
        Self::from_instr(StmInstr::Access(Arc::new(|_: &mut Journal, fiber: FiberId| erase(fiber))))
    }
}

/// Run `stm` atomically. Same as [`Stm::commit`].
pub fn atomically<A: Data, E: Data>(stm: Stm<A, E>) -> Effect<A, E> {
    stm.commit()
}
