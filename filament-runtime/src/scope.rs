//! Fiber scopes.
//!
//! A scope decides who a forked fiber belongs to. Children of a local scope
//! are registered with the owning fiber and are interrupted and awaited
//! before it completes; the global scope tracks nothing and is where daemon
//! fibers live.

use std::fmt;
use std::sync::{Arc, Weak};

use crate::context::FiberContext;
use crate::fiber::FiberId;

/// Where a forked fiber is registered.
#[derive(Clone)]
pub enum FiberScope {
    /// Untracked: children outlive whoever forked them.
    Global,
    /// Owned by a fiber.
    Local(LocalScope),
}

/// A scope owned by a fiber. Holds only a weak edge to the owner.
#[derive(Clone)]
pub struct LocalScope {
    owner: FiberId,
    fiber: Weak<FiberContext>,
}

impl FiberScope {
    pub(crate) fn local(fiber: &Arc<FiberContext>) -> Self {
        FiberScope::Local(LocalScope {
            owner: fiber.id(),
            fiber: Arc::downgrade(fiber),
        })
    }

    /// The owning fiber, or `None` for the global scope.
    pub fn owner(&self) -> Option<FiberId> {
        match self {
            FiberScope::Global => None,
            FiberScope::Local(scope) => Some(scope.owner),
        }
    }

    /// True once the owner has completed. The global scope never closes.
    pub fn is_closed(&self) -> bool {
        match self {
            FiberScope::Global => false,
            FiberScope::Local(scope) => match scope.fiber.upgrade() {
                Some(owner) => owner.is_done(),
                None => true,
            },
        }
    }

    /// Register `child`. Fails once the owner is done.
    pub(crate) fn unsafe_add(&self, child: &Arc<FiberContext>) -> bool {
        match self {
            FiberScope::Global => true,
            FiberScope::Local(scope) => match scope.fiber.upgrade() {
                Some(owner) => owner.add_child(child),
                None => false,
            },
        }
    }

    pub(crate) fn remove(&self, child: FiberId) {
        if let FiberScope::Local(scope) = self {
            if let Some(owner) = scope.fiber.upgrade() {
                owner.remove_child(child);
            }
        }
    }
}

impl fmt::Debug for FiberScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FiberScope::Global => write!(f, "Global"),
            FiberScope::Local(scope) => write!(f, "Local({})", scope.owner),
        }
    }
}
