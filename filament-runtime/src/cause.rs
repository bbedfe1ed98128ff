//! Failure Causes
//!
//! A [`Cause`] is the structured reason an effect failed. It distinguishes
//! typed failures (`Fail`), defects (`Die`) and interruption (`Interrupt`),
//! and composes them sequentially (`Then`) or in parallel (`Both`) so that a
//! primary failure and, say, a finalizer's own failure are both preserved.
//!
//! `Empty` is the identity of both combinators: `Cause::empty().then(c)` is
//! `c`, never `Then(Empty, c)`.

use std::collections::HashSet;
use std::convert::Infallible;
use std::fmt;
use std::sync::Arc;

use crate::fiber::FiberId;

/// An unexpected failure: an explicit `die` or a panic caught by the
/// interpreter.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Defect {
    message: Arc<str>,
}

impl Defect {
    /// Create a defect with the given message.
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: Arc::from(message.into()),
        }
    }

    /// The defect message.
    pub fn message(&self) -> &str {
        &self.message
    }
}

impl fmt::Display for Defect {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.message)
    }
}

impl From<&str> for Defect {
    fn from(message: &str) -> Self {
        Defect::new(message)
    }
}

impl From<String> for Defect {
    fn from(message: String) -> Self {
        Defect::new(message)
    }
}

/// Why an effect failed.
#[derive(Debug, Clone, PartialEq)]
pub enum Cause<E> {
    /// No failure. Identity for [`Cause::then`] and [`Cause::both`].
    Empty,
    /// A typed, recoverable failure.
    Fail(E),
    /// A defect.
    Die(Defect),
    /// Interruption requested by the given fiber.
    Interrupt(FiberId),
    /// The left cause happened, then the right one.
    Then(Box<Cause<E>>, Box<Cause<E>>),
    /// Both causes happened in parallel.
    Both(Box<Cause<E>>, Box<Cause<E>>),
}

impl<E> Cause<E> {
    /// The empty cause.
    pub fn empty() -> Self {
        Cause::Empty
    }

    /// A typed failure.
    pub fn fail(error: E) -> Self {
        Cause::Fail(error)
    }

    /// A defect.
    pub fn die(defect: impl Into<Defect>) -> Self {
        Cause::Die(defect.into())
    }

    /// Interruption by `fiber`.
    pub fn interrupt(fiber: FiberId) -> Self {
        Cause::Interrupt(fiber)
    }

    /// Sequential composition.
    pub fn then(self, next: Cause<E>) -> Self {
        if self.is_empty() {
            next
        } else if next.is_empty() {
            self
        } else {
            Cause::Then(Box::new(self), Box::new(next))
        }
    }

    /// Parallel composition.
    pub fn both(self, other: Cause<E>) -> Self {
        if self.is_empty() {
            other
        } else if other.is_empty() {
            self
        } else {
            Cause::Both(Box::new(self), Box::new(other))
        }
    }

    /// True if the cause carries no failure at all.
    pub fn is_empty(&self) -> bool {
        match self {
            Cause::Empty => true,
            Cause::Then(l, r) | Cause::Both(l, r) => l.is_empty() && r.is_empty(),
            _ => false,
        }
    }

    /// All typed failures, left to right.
    pub fn failures(&self) -> Vec<&E> {
        let mut out = Vec::new();
        self.visit(&mut |c| {
            if let Cause::Fail(e) = c {
                out.push(e);
            }
        });
        out
    }

    /// The first typed failure, if any.
    pub fn failure_option(&self) -> Option<&E> {
        self.failures().into_iter().next()
    }

    /// All defects, left to right.
    pub fn defects(&self) -> Vec<&Defect> {
        let mut out = Vec::new();
        self.visit(&mut |c| {
            if let Cause::Die(d) = c {
                out.push(d);
            }
        });
        out
    }

    /// Every fiber that contributed an interruption.
    pub fn interruptors(&self) -> HashSet<FiberId> {
        let mut out = HashSet::new();
        self.visit(&mut |c| {
            if let Cause::Interrupt(id) = c {
                out.insert(*id);
            }
        });
        out
    }

    /// True if any branch is an interruption.
    pub fn is_interrupted(&self) -> bool {
        !self.interruptors().is_empty()
    }

    /// True if the cause is made of interruptions only.
    pub fn is_interrupted_only(&self) -> bool {
        self.is_interrupted() && self.failures().is_empty() && self.defects().is_empty()
    }

    /// True if any branch is a defect.
    pub fn is_die(&self) -> bool {
        !self.defects().is_empty()
    }

    /// True if any branch is a typed failure.
    pub fn is_failure(&self) -> bool {
        self.failure_option().is_some()
    }

    /// Label used by fiber metrics: `die`, `fail`, `interrupt` or `empty`,
    /// by decreasing severity.
    pub fn kind(&self) -> &'static str {
        if self.is_die() {
            "die"
        } else if self.is_failure() {
            "fail"
        } else if self.is_interrupted() {
            "interrupt"
        } else {
            "empty"
        }
    }

    /// Remove every typed failure, keeping defects and interruptions.
    pub fn strip_failures(self) -> Cause<E> {
        match self {
            Cause::Fail(_) => Cause::Empty,
            Cause::Then(l, r) => l.strip_failures().then(r.strip_failures()),
            Cause::Both(l, r) => l.strip_failures().both(r.strip_failures()),
            other => other,
        }
    }

    /// Transform every typed failure.
    pub fn map<E2, F>(self, f: F) -> Cause<E2>
    where
        F: Fn(E) -> E2,
    {
        self.map_ref(&f)
    }

    fn map_ref<E2, F>(self, f: &F) -> Cause<E2>
    where
        F: Fn(E) -> E2,
    {
        match self {
            Cause::Empty => Cause::Empty,
            Cause::Fail(e) => Cause::Fail(f(e)),
            Cause::Die(d) => Cause::Die(d),
            Cause::Interrupt(id) => Cause::Interrupt(id),
            Cause::Then(l, r) => Cause::Then(Box::new(l.map_ref(f)), Box::new(r.map_ref(f))),
            Cause::Both(l, r) => Cause::Both(Box::new(l.map_ref(f)), Box::new(r.map_ref(f))),
        }
    }

    /// Split off the first typed failure, or hand back the failure-free
    /// remainder of the cause.
    pub fn failure_or_cause(self) -> Result<E, Cause<Infallible>> {
        match self.take_failure() {
            Ok(e) => Ok(e),
            Err(rest) => Err(rest.map(|_| unreachable!("cause without failures"))),
        }
    }

    fn take_failure(self) -> Result<E, Cause<E>> {
        match self {
            Cause::Fail(e) => Ok(e),
            Cause::Then(l, r) => match l.take_failure() {
                Ok(e) => Ok(e),
                Err(l) => r.take_failure().map_err(|r| Cause::Then(Box::new(l), r.into())),
            },
            Cause::Both(l, r) => match l.take_failure() {
                Ok(e) => Ok(e),
                Err(l) => r.take_failure().map_err(|r| Cause::Both(Box::new(l), r.into())),
            },
            other => Err(other),
        }
    }

    fn visit<'a>(&'a self, f: &mut impl FnMut(&'a Cause<E>)) {
        f(self);
        if let Cause::Then(l, r) | Cause::Both(l, r) = self {
            l.visit(f);
            r.visit(f);
        }
    }
}

impl<E: PartialEq> Cause<E> {
    /// True if `other` appears in this cause, either as the whole cause or
    /// as one of its branches. The empty cause is contained in everything.
    pub fn contains(&self, other: &Cause<E>) -> bool {
        if other.is_empty() || self == other {
            return true;
        }
        match self {
            Cause::Then(l, r) | Cause::Both(l, r) => l.contains(other) || r.contains(other),
            _ => false,
        }
    }
}

impl Cause<Infallible> {
    /// View a failure-free cause at any error type.
    pub fn widen<E>(self) -> Cause<E> {
        self.map(|never| match never {})
    }
}

impl<E> Default for Cause<E> {
    fn default() -> Self {
        Cause::Empty
    }
}

impl<E: fmt::Debug> fmt::Display for Cause<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Cause::Empty => write!(f, "Empty"),
            Cause::Fail(e) => write!(f, "Fail({:?})", e),
            Cause::Die(d) => write!(f, "Die({})", d),
            Cause::Interrupt(id) => write!(f, "Interrupt({})", id),
            Cause::Then(l, r) => write!(f, "({} then {})", l, r),
            Cause::Both(l, r) => write!(f, "({} and {})", l, r),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fid(n: u64) -> FiberId {
        FiberId::new(0, n)
    }

    #[test]
    fn test_empty_is_identity() {
        let c: Cause<&str> = Cause::fail("boom");
        assert_eq!(Cause::empty().then(c.clone()), c);
        assert_eq!(c.clone().then(Cause::empty()), c);
        assert_eq!(Cause::empty().both(c.clone()), c);
        assert!(Cause::<&str>::empty().then(Cause::empty()).is_empty());
    }

    #[test]
    fn test_then_keeps_both_branches() {
        let c = Cause::fail("a").then(Cause::die("b"));
        assert_eq!(c.failures(), vec![&"a"]);
        assert_eq!(c.defects()[0].message(), "b");
    }

    #[test]
    fn test_strip_failures_keeps_interrupts() {
        let c = Cause::fail("a").both(Cause::interrupt(fid(7)));
        let stripped = c.strip_failures();
        assert_eq!(stripped, Cause::Interrupt(fid(7)));
        assert!(stripped.is_interrupted_only());
    }

    #[test]
    fn test_contains() {
        let i = Cause::<()>::interrupt(fid(1));
        let c = Cause::die("x").then(i.clone());
        assert!(c.contains(&i));
        assert!(c.contains(&Cause::Empty));
        assert!(!c.contains(&Cause::interrupt(fid(2))));
    }

    #[test]
    fn test_interruptors() {
        let c = Cause::<()>::interrupt(fid(1)).then(Cause::interrupt(fid(2)).both(Cause::interrupt(fid(1))));
        let ids = c.interruptors();
        assert_eq!(ids.len(), 2);
        assert!(ids.contains(&fid(2)));
    }

    #[test]
    fn test_failure_or_cause() {
        let c = Cause::die("d").then(Cause::fail(3));
        assert_eq!(c.failure_or_cause(), Ok(3));

        let c = Cause::<i32>::die("d").then(Cause::interrupt(fid(4)));
        let rest = c.failure_or_cause().unwrap_err();
        let widened: Cause<String> = rest.widen();
        assert!(widened.is_die());
        assert!(widened.is_interrupted());
    }

    #[test]
    fn test_kind() {
        assert_eq!(Cause::fail(1).kind(), "fail");
        assert_eq!(Cause::fail(1).then(Cause::die("x")).kind(), "die");
        assert_eq!(Cause::<i32>::interrupt(fid(1)).kind(), "interrupt");
        assert_eq!(Cause::<i32>::empty().kind(), "empty");
    }

    #[test]
    fn test_display() {
        let c = Cause::fail("a").then(Cause::die("b"));
        assert_eq!(c.to_string(), "(Fail(\"a\") then Die(b))");
    }
}
