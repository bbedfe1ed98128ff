//! Transactional references.

use std::collections::HashMap;
use std::fmt;
use std::marker::PhantomData;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};

use crate::effect::{Data, Effect};
use crate::instr::{downcast, erase, Value};
use crate::stm::journal::{Journal, Todo, TxnId};
use crate::stm::Stm;

static NEXT_TREF_ID: AtomicU64 = AtomicU64::new(1);

/// A committed value and the version that wrote it.
#[derive(Clone)]
pub(crate) struct Versioned {
    pub(crate) version: u64,
    pub(crate) value: Value,
}

/// The shared cell behind a [`TRef`]. Written only by a journal commit
/// holding the commit lock.
pub(crate) struct TRefCell {
    id: u64,
    versioned: RwLock<Versioned>,
    todos: Mutex<HashMap<TxnId, Todo>>,
}

impl TRefCell {
    pub(crate) fn new(value: Value) -> Arc<Self> {
        Arc::new(Self {
            id: NEXT_TREF_ID.fetch_add(1, Ordering::Relaxed),
            versioned: RwLock::new(Versioned { version: 0, value }),
            todos: Mutex::new(HashMap::new()),
        })
    }

    pub(crate) fn id(&self) -> u64 {
        self.id
    }

    pub(crate) fn snapshot(&self) -> Versioned {
        self.versioned.read().clone()
    }

    pub(crate) fn version(&self) -> u64 {
        self.versioned.read().version
    }

    /// Install `value` as the next version.
    pub(crate) fn store(&self, value: Value) {
        let mut versioned = self.versioned.write();
        versioned.version += 1;
        versioned.value = value;
    }

    /// Register `todo` for `txn`, replacing any earlier one.
    pub(crate) fn add_todo(&self, txn: TxnId, todo: Todo) {
        self.todos.lock().insert(txn, todo);
    }

    pub(crate) fn remove_todo(&self, txn: TxnId) {
        self.todos.lock().remove(&txn);
    }

    /// Drain every todo except the one `txn` registered.
    pub(crate) fn take_todos(&self, txn: TxnId) -> Vec<Todo> {
        let mut todos = self.todos.lock();
        let own = todos.remove(&txn);
        let taken = todos.drain().map(|(_, todo)| todo).collect();
        if let Some(own) = own {
            todos.insert(txn, own);
        }
        taken
    }

    #[cfg(test)]
    pub(crate) fn todo_count(&self) -> usize {
        self.todos.lock().len()
    }
}

/// A transactional memory cell holding an `A`.
///
/// Reads and writes happen inside an [`Stm`] transaction and become
/// visible to other fibers only when the transaction commits.
pub struct TRef<A> {
    cell: Arc<TRefCell>,
    _marker: PhantomData<fn() -> A>,
}

impl<A> Clone for TRef<A> {
    fn clone(&self) -> Self {
        Self {
            cell: Arc::clone(&self.cell),
            _marker: PhantomData,
        }
    }
}

impl<A> PartialEq for TRef<A> {
    fn eq(&self, other: &Self) -> bool {
        self.cell.id == other.cell.id
    }
}

impl<A> Eq for TRef<A> {}

impl<A> fmt::Debug for TRef<A> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "TRef(#{})", self.cell.id)
    }
}

impl<A: Data> TRef<A> {
    /// Create a reference outside of any transaction.
    pub fn new(initial: A) -> Self {
        Self::from_cell(TRefCell::new(erase(initial)))
    }

    fn from_cell(cell: Arc<TRefCell>) -> Self {
        Self {
            cell,
            _marker: PhantomData,
        }
    }

    /// Create a reference inside a transaction.
    pub fn make<E: Data>(initial: A) -> Stm<TRef<A>, E> {
        Stm::access(move |journal: &mut Journal| {
            let cell = TRefCell::new(erase(initial.clone()));
            journal.insert_new(Arc::clone(&cell));
            Self::from_cell(cell)
        })
    }

    /// Create a reference in its own transaction.
    pub fn make_commit<E: Data>(initial: A) -> Effect<TRef<A>, E> {
        Self::make(initial).commit()
    }

    /// Read the value.
    pub fn get<E: Data>(&self) -> Stm<A, E> {
        let cell = Arc::clone(&self.cell);
        Stm::access(move |journal: &mut Journal| downcast::<A>(&journal.read(&cell)))
    }

    /// Write the value.
    pub fn set<E: Data>(&self, value: A) -> Stm<(), E> {
        let cell = Arc::clone(&self.cell);
        Stm::access(move |journal: &mut Journal| journal.write(&cell, erase(value.clone())))
    }

    /// Compute a return value and a new value from the current one.
    pub fn modify<B, E, F>(&self, f: F) -> Stm<B, E>
    where
        B: Data,
        E: Data,
        F: Fn(A) -> (B, A) + Send + Sync + 'static,
    {
        let cell = Arc::clone(&self.cell);
        Stm::access(move |journal: &mut Journal| {
            let (out, next) = f(downcast::<A>(&journal.read(&cell)));
            journal.write(&cell, erase(next));
            out
        })
    }

    /// Replace the value with `f` of it.
    pub fn update<E, F>(&self, f: F) -> Stm<(), E>
    where
        E: Data,
        F: Fn(A) -> A + Send + Sync + 'static,
    {
        self.modify(move |a| ((), f(a)))
    }

    /// Update, returning the previous value.
    pub fn get_and_update<E, F>(&self, f: F) -> Stm<A, E>
    where
        E: Data,
        F: Fn(A) -> A + Send + Sync + 'static,
    {
        self.modify(move |a| (a.clone(), f(a)))
    }

    /// Update, returning the new value.
    pub fn update_and_get<E, F>(&self, f: F) -> Stm<A, E>
    where
        E: Data,
        F: Fn(A) -> A + Send + Sync + 'static,
    {
        self.modify(move |a| {
            let next = f(a);
            (next.clone(), next)
        })
    }

    /// The last committed value, read outside of any transaction.
    pub fn snapshot(&self) -> A {
        downcast(&self.cell.snapshot().value)
    }

    #[cfg(test)]
    pub(crate) fn cell(&self) -> &Arc<TRefCell> {
        &self.cell
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_store_bumps_version() {
        let cell = TRefCell::new(erase(1u32));
        assert_eq!(cell.version(), 0);
        cell.store(erase(2u32));
        assert_eq!(cell.version(), 1);
        assert_eq!(downcast::<u32>(&cell.snapshot().value), 2);
    }

    #[test]
    fn test_take_todos_keeps_own() {
        let cell = TRefCell::new(erase(()));
        let mine = TxnId::next();
        let theirs = TxnId::next();
        cell.add_todo(mine, Arc::new(|| {}));
        cell.add_todo(theirs, Arc::new(|| {}));
        assert_eq!(cell.take_todos(mine).len(), 1);
        assert_eq!(cell.todo_count(), 1);
        cell.remove_todo(mine);
        assert_eq!(cell.todo_count(), 0);
    }

    #[test]
    fn test_tref_identity() {
        let a = TRef::new(5i64);
        let b = a.clone();
        assert_eq!(a, b);
        assert_ne!(a, TRef::new(5i64));
        assert_eq!(b.snapshot(), 5);
    }
}
