//! Fiber References
//!
//! A [`FiberRef`] is a variable scoped to a fiber rather than an OS thread.
//! Every fiber carries a [`FiberRefs`] map; reads of a ref the fiber never
//! wrote return the ref's initial value. When a fiber forks, the child gets
//! a copy of the parent's map with each value passed through that ref's
//! fork transform.
//!
//! # Example
//!
//! ```rust,ignore
//! use filament_runtime::{Effect, FiberRef};
//!
//! let request_id = FiberRef::new(String::new());
//! let program = request_id
//!     .locally("req-12345".to_string(), request_id.get())
//!     .map(|id| assert_eq!(id, "req-12345"));
//! ```

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::marker::PhantomData;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, LazyLock};

use crate::effect::{Data, Effect};
use crate::instr::{downcast, erase, Instr, Value};
use crate::logger::LogSpan;
use crate::scope::FiberScope;

/// Unique key of a fiber ref.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) struct FiberRefKey(u64);

impl FiberRefKey {
    fn next() -> Self {
        static NEXT_KEY: AtomicU64 = AtomicU64::new(1);
        Self(NEXT_KEY.fetch_add(1, Ordering::Relaxed))
    }
}

pub(crate) struct FiberRefInner {
    key: FiberRefKey,
    initial: Value,
    fork: Arc<dyn Fn(&Value) -> Value + Send + Sync>,
}

/// A fiber-scoped variable holding an `A`.
pub struct FiberRef<A> {
    inner: Arc<FiberRefInner>,
    _marker: PhantomData<fn() -> A>,
}

impl<A> Clone for FiberRef<A> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
            _marker: PhantomData,
        }
    }
}

impl<A> fmt::Debug for FiberRef<A> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "FiberRef({})", self.inner.key.0)
    }
}

impl<A: Data> FiberRef<A> {
    /// A ref whose children inherit the parent's value unchanged.
    pub fn new(initial: A) -> Self {
        Self::with_fork(initial, |a: &A| a.clone())
    }

    /// A ref whose children see `fork(parent_value)`.
    pub fn with_fork<F>(initial: A, fork: F) -> Self
    where
        F: Fn(&A) -> A + Send + Sync + 'static,
    {
        let inner = FiberRefInner {
            key: FiberRefKey::next(),
            initial: erase(initial),
            fork: Arc::new(move |value: &Value| erase(fork(&downcast::<A>(value)))),
        };
        Self {
            inner: Arc::new(inner),
            _marker: PhantomData,
        }
    }

    /// Atomically compute a result and a new value from the current one.
    pub fn modify<B, E, F>(&self, f: F) -> Effect<B, E>
    where
        B: Data,
        E: Data,
        F: Fn(A) -> (B, A) + Send + Sync + 'static,
    {
        Effect::from_instr(Instr::FiberRefModify {
            fiber_ref: Arc::clone(&self.inner),
            f: Arc::new(move |value: Value| {
                let (out, next) = f(downcast::<A>(&value));
                (erase(out), erase(next))
            }),
        })
    }

    /// Read the current value.
    pub fn get<E: Data>(&self) -> Effect<A, E> {
        self.modify(|a: A| (a.clone(), a))
    }

    /// Replace the current value.
    pub fn set<E: Data>(&self, value: A) -> Effect<(), E> {
        self.modify(move |_| ((), value.clone()))
    }

    /// Transform the current value.
    pub fn update<E, F>(&self, f: F) -> Effect<(), E>
    where
        E: Data,
        F: Fn(A) -> A + Send + Sync + 'static,
    {
        self.modify(move |a| ((), f(a)))
    }

    /// Run `effect` with the ref set to `value`, restoring the previous
    /// value afterwards however `effect` ends.
    pub fn locally<B: Data, E: Data>(&self, value: A, effect: Effect<B, E>) -> Effect<B, E> {
        let fiber_ref = self.clone();
        self.get::<E>().flat_map(move |previous: A| {
            fiber_ref
                .set::<E>(value.clone())
                .zip_right(effect.clone())
                .ensuring(fiber_ref.set(previous))
        })
    }
}

/// The values of every ref a fiber has written.
#[derive(Clone, Default)]
pub struct FiberRefs {
    values: HashMap<FiberRefKey, (Arc<FiberRefInner>, Value)>,
}

impl FiberRefs {
    pub(crate) fn get_value(&self, fiber_ref: &Arc<FiberRefInner>) -> Value {
        match self.values.get(&fiber_ref.key) {
            Some((_, value)) => Arc::clone(value),
            None => Arc::clone(&fiber_ref.initial),
        }
    }

    pub(crate) fn set_value(&mut self, fiber_ref: &Arc<FiberRefInner>, value: Value) {
        self.values
            .insert(fiber_ref.key, (Arc::clone(fiber_ref), value));
    }

    /// The value of `fiber_ref` in this map.
    pub fn get<A: Data>(&self, fiber_ref: &FiberRef<A>) -> A {
        downcast(&self.get_value(&fiber_ref.inner))
    }

    #[cfg(test)]
    pub(crate) fn set<A: Data>(&mut self, fiber_ref: &FiberRef<A>, value: A) {
        self.set_value(&fiber_ref.inner, erase(value));
    }

    /// Number of refs written in this fiber or inherited from its parent.
    pub fn len(&self) -> usize {
        self.values.len()
    }

    /// True if no ref has been written.
    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// The map a forked child starts with.
    pub(crate) fn fork(&self) -> FiberRefs {
        let values = self
            .values
            .iter()
            .map(|(key, (fiber_ref, value))| {
                (*key, (Arc::clone(fiber_ref), (fiber_ref.fork)(value)))
            })
            .collect();
        FiberRefs { values }
    }
}

impl fmt::Debug for FiberRefs {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FiberRefs")
            .field("len", &self.values.len())
            .finish()
    }
}

/// Key/value annotations attached to every log record.
pub(crate) static LOG_ANNOTATIONS: LazyLock<FiberRef<BTreeMap<String, String>>> =
    LazyLock::new(|| FiberRef::new(BTreeMap::new()));

/// Open log spans, innermost last.
pub(crate) static LOG_SPANS: LazyLock<FiberRef<Vec<LogSpan>>> =
    LazyLock::new(|| FiberRef::new(Vec::new()));

/// Scope children forked without an explicit scope join. Children do not
/// inherit it.
pub(crate) static FORK_SCOPE_OVERRIDE: LazyLock<FiberRef<Option<FiberScope>>> =
    LazyLock::new(|| FiberRef::with_fork(None, |_| None));

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unset_ref_reads_initial() {
        let refs = FiberRefs::default();
        let fiber_ref = FiberRef::new(7_u32);
        assert_eq!(refs.get(&fiber_ref), 7);
        assert!(refs.is_empty());
    }

    #[test]
    fn test_fork_applies_transform() {
        let inherited = FiberRef::new(1_i64);
        let bumped = FiberRef::with_fork(10_i64, |n| n + 1);
        let mut refs = FiberRefs::default();
        refs.set(&inherited, 5);
        refs.set(&bumped, 20);

        let child = refs.fork();
        assert_eq!(child.get(&inherited), 5);
        assert_eq!(child.get(&bumped), 21);
        assert_eq!(refs.get(&bumped), 20);
    }

    #[test]
    fn test_fork_scope_override_not_inherited() {
        let mut refs = FiberRefs::default();
        refs.set(&FORK_SCOPE_OVERRIDE, Some(FiberScope::Global));
        assert!(refs.get(&FORK_SCOPE_OVERRIDE).is_some());
        assert!(refs.fork().get(&FORK_SCOPE_OVERRIDE).is_none());
    }
}
