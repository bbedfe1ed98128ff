//! Per-attempt transaction journal.
//!
//! An attempt reads every [`TRefCell`] through its [`Journal`]: the first
//! read snapshots the committed version, later reads and writes see the
//! staged value. Nothing reaches a cell until [`Journal::commit`], which
//! runs under the global [`COMMIT_LOCK`] after [`Journal::analyze`] has
//! confirmed no snapshot went stale.

use std::collections::{hash_map, BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::{const_mutex, Mutex};

use crate::instr::Value;
use crate::scheduler::Scheduler;
use crate::stm::tref::{TRefCell, Versioned};

/// Serializes every commit in the process.
pub(crate) static COMMIT_LOCK: Mutex<()> = const_mutex(());

static NEXT_TXN_ID: AtomicU64 = AtomicU64::new(1);

/// Identity of one `commit` call, stable across its re-attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub(crate) struct TxnId(u64);

impl TxnId {
    pub(crate) fn next() -> Self {
        TxnId(NEXT_TXN_ID.fetch_add(1, Ordering::Relaxed))
    }
}

/// Wake-up callback registered on a cell by a retrying transaction.
pub(crate) type Todo = Arc<dyn Fn() + Send + Sync>;

/// Outcome of validating a journal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Analysis {
    /// Some snapshot is stale.
    Invalid,
    /// Consistent, with staged writes.
    ReadWrite,
    /// Consistent, nothing written.
    ReadOnly,
}

/// One transaction's view of one cell.
pub(crate) struct Entry {
    cell: Arc<TRefCell>,
    expected: Versioned,
    new_value: Value,
    is_new: bool,
    is_changed: bool,
}

impl Entry {
    pub(crate) fn read(cell: Arc<TRefCell>) -> Self {
        let expected = cell.snapshot();
        Self {
            new_value: Arc::clone(&expected.value),
            cell,
            expected,
            is_new: false,
            is_changed: false,
        }
    }

    /// An entry for a cell created by this transaction.
    pub(crate) fn created(cell: Arc<TRefCell>) -> Self {
        Self {
            is_new: true,
            ..Self::read(cell)
        }
    }

    pub(crate) fn get(&self) -> Value {
        Arc::clone(&self.new_value)
    }

    pub(crate) fn set(&mut self, value: Value) {
        self.new_value = value;
        self.is_changed = true;
    }

    /// Write the staged value to the cell. Caller holds [`COMMIT_LOCK`].
    pub(crate) fn commit(&self) {
        self.cell.store(Arc::clone(&self.new_value));
    }

    pub(crate) fn copy(&self) -> Self {
        Self {
            cell: Arc::clone(&self.cell),
            expected: self.expected.clone(),
            new_value: Arc::clone(&self.new_value),
            is_new: self.is_new,
            is_changed: self.is_changed,
        }
    }

    /// The cell still holds the version this entry was read at.
    pub(crate) fn is_valid(&self) -> bool {
        self.is_new || self.cell.version() == self.expected.version
    }

    pub(crate) fn is_invalid(&self) -> bool {
        !self.is_valid()
    }

    pub(crate) fn is_changed(&self) -> bool {
        self.is_changed
    }

    fn discard_write(&mut self) {
        self.new_value = Arc::clone(&self.expected.value);
        self.is_changed = false;
    }
}

/// Every cell an attempt touched, keyed by cell id.
#[derive(Default)]
pub(crate) struct Journal {
    entries: BTreeMap<u64, Entry>,
}

impl Journal {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    fn entry(&mut self, cell: &Arc<TRefCell>) -> &mut Entry {
        self.entries
            .entry(cell.id())
            .or_insert_with(|| Entry::read(Arc::clone(cell)))
    }

    pub(crate) fn read(&mut self, cell: &Arc<TRefCell>) -> Value {
        self.entry(cell).get()
    }

    pub(crate) fn write(&mut self, cell: &Arc<TRefCell>, value: Value) {
        self.entry(cell).set(value);
    }

    pub(crate) fn insert_new(&mut self, cell: Arc<TRefCell>) {
        self.entries.insert(cell.id(), Entry::created(cell));
    }

    pub(crate) fn analyze(&self) -> Analysis {
        let mut analysis = Analysis::ReadOnly;
        for entry in self.entries.values() {
            if entry.is_invalid() {
                return Analysis::Invalid;
            }
            if entry.is_changed() {
                analysis = Analysis::ReadWrite;
            }
        }
        analysis
    }

    pub(crate) fn is_valid(&self) -> bool {
        self.entries.values().all(Entry::is_valid)
    }

    /// Apply every staged write. Caller holds [`COMMIT_LOCK`] and has
    /// validated the journal under it.
    pub(crate) fn commit(&self) {
        assert!(self.is_valid(), "invalid journal");
        for entry in self.entries.values().filter(|entry| entry.is_changed()) {
            entry.commit();
        }
    }

    pub(crate) fn snapshot(&self) -> Journal {
        Journal {
            entries: self
                .entries
                .iter()
                .map(|(id, entry)| (*id, entry.copy()))
                .collect(),
        }
    }

    /// Undo the writes made since `snapshot` was taken. Cells first read
    /// after the snapshot stay in the journal as reads.
    pub(crate) fn rollback_to(&mut self, snapshot: &Journal) {
        for (id, entry) in self.entries.iter_mut() {
            match snapshot.entries.get(id) {
                Some(saved) => *entry = saved.copy(),
                None => entry.discard_write(),
            }
        }
    }

    /// Register a todo from `todo_for` on every pre-existing cell not yet in
    /// `tracked`, and record those cells. Returns how many were added.
    pub(crate) fn add_todo<F>(&self, txn: TxnId, tracked: &mut HashMap<u64, Arc<TRefCell>>, mut todo_for: F) -> usize
    where
        F: FnMut(u64) -> Todo,
    {
        let mut added = 0;
        for (id, entry) in self.entries.iter().filter(|(_, entry)| !entry.is_new) {
            if let hash_map::Entry::Vacant(slot) = tracked.entry(*id) {
                entry.cell.add_todo(txn, todo_for(*id));
                slot.insert(Arc::clone(&entry.cell));
                added += 1;
            }
        }
        added
    }

    /// Drain the todos other transactions registered on the touched cells.
    pub(crate) fn collect_todos(&self, txn: TxnId) -> Vec<Todo> {
        self.entries
            .values()
            .flat_map(|entry| entry.cell.take_todos(txn))
            .collect()
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }
}

/// Run each todo as its own task.
pub(crate) fn exec_todos(todos: Vec<Todo>, scheduler: &dyn Scheduler) {
    if !todos.is_empty() {
        tracing::trace!(count = todos.len(), "waking retrying transactions");
    }
    for todo in todos {
        scheduler.schedule_task(Box::new(move || todo()));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::instr::{downcast, erase};
    use crate::scheduler::ManualScheduler;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn test_read_write_analysis() {
        let cell = TRefCell::new(erase(1i32));
        let mut journal = Journal::new();
        assert_eq!(downcast::<i32>(&journal.read(&cell)), 1);
        assert_eq!(journal.analyze(), Analysis::ReadOnly);
        journal.write(&cell, erase(2i32));
        assert_eq!(downcast::<i32>(&journal.read(&cell)), 2);
        assert_eq!(journal.analyze(), Analysis::ReadWrite);
        assert_eq!(journal.len(), 1);
    }

    #[test]
    fn test_stale_read_is_invalid() {
        let cell = TRefCell::new(erase(1i32));
        let mut journal = Journal::new();
        journal.read(&cell);
        cell.store(erase(5i32));
        assert!(!journal.is_valid());
        assert_eq!(journal.analyze(), Analysis::Invalid);
    }

    #[test]
    #[should_panic(expected = "invalid journal")]
    fn test_commit_invalid_journal_panics() {
        let cell = TRefCell::new(erase(1i32));
        let mut journal = Journal::new();
        journal.write(&cell, erase(2i32));
        cell.store(erase(3i32));
        journal.commit();
    }

    #[test]
    fn test_new_cells_always_valid() {
        let cell = TRefCell::new(erase(0u8));
        let mut journal = Journal::new();
        journal.insert_new(Arc::clone(&cell));
        cell.store(erase(1u8));
        assert!(journal.is_valid());
    }

    #[test]
    fn test_rollback_keeps_reads() {
        let a = TRefCell::new(erase(1i32));
        let b = TRefCell::new(erase(10i32));
        let mut journal = Journal::new();
        journal.write(&a, erase(2i32));
        let saved = journal.snapshot();

        journal.write(&a, erase(3i32));
        journal.write(&b, erase(11i32));
        journal.rollback_to(&saved);

        assert_eq!(downcast::<i32>(&journal.read(&a)), 2);
        assert_eq!(downcast::<i32>(&journal.read(&b)), 10);
        assert_eq!(journal.len(), 2);

        b.store(erase(12i32));
        assert!(!journal.is_valid());
    }

    #[test]
    fn test_add_todo_skips_tracked_cells() {
        let a = TRefCell::new(erase(0u8));
        let b = TRefCell::new(erase(0u8));
        let created = TRefCell::new(erase(0u8));
        let waiter = TxnId::next();
        let mut tracked = HashMap::new();

        let mut first = Journal::new();
        first.read(&a);
        first.insert_new(Arc::clone(&created));
        assert_eq!(first.add_todo(waiter, &mut tracked, |_| Arc::new(|| {})), 1);

        let mut second = Journal::new();
        second.read(&a);
        second.read(&b);
        let mut asked = Vec::new();
        let added = second.add_todo(waiter, &mut tracked, |id| {
            asked.push(id);
            Arc::new(|| {})
        });
        assert_eq!(added, 1);
        assert_eq!(asked, vec![b.id()]);
        assert_eq!(a.todo_count(), 1);
        assert_eq!(created.todo_count(), 0);
        assert_eq!(tracked.len(), 2);
    }

    #[test]
    fn test_collect_and_exec_todos() {
        let cell = TRefCell::new(erase(()));
        let mut journal = Journal::new();
        journal.read(&cell);

        let woken = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&woken);
        let todo: Todo = Arc::new(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        let waiter = TxnId::next();
        let mut tracked = HashMap::new();
        assert_eq!(journal.add_todo(waiter, &mut tracked, |_| Arc::clone(&todo)), 1);
        assert_eq!(tracked.len(), 1);

        let scheduler = ManualScheduler::new();
        exec_todos(journal.collect_todos(TxnId::next()), &scheduler);
        assert_eq!(cell.todo_count(), 0);
        assert_eq!(scheduler.run_until_idle(), 1);
        assert_eq!(woken.load(Ordering::SeqCst), 1);
    }
}
