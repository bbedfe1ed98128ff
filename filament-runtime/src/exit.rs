//! Fiber outcomes.

use crate::cause::{Cause, Defect};
use crate::fiber::FiberId;

/// How a fiber, or any effect, finished.
#[derive(Debug, Clone, PartialEq)]
pub enum Exit<E, A> {
    /// Completed with a value.
    Success(A),
    /// Failed with a cause.
    Failure(Cause<E>),
}

impl<E, A> Exit<E, A> {
    /// A successful exit.
    pub fn succeed(value: A) -> Self {
        Exit::Success(value)
    }

    /// An exit failed with a typed error.
    pub fn fail(error: E) -> Self {
        Exit::Failure(Cause::fail(error))
    }

    /// An exit failed with a defect.
    pub fn die(defect: impl Into<Defect>) -> Self {
        Exit::Failure(Cause::die(defect))
    }

    /// An exit interrupted by `fiber`.
    pub fn interrupt(fiber: FiberId) -> Self {
        Exit::Failure(Cause::interrupt(fiber))
    }

    /// True for `Success`.
    pub fn is_success(&self) -> bool {
        matches!(self, Exit::Success(_))
    }

    /// True for a failure whose cause contains an interruption.
    pub fn is_interrupted(&self) -> bool {
        match self {
            Exit::Success(_) => false,
            Exit::Failure(cause) => cause.is_interrupted(),
        }
    }

    /// The success value, if any.
    pub fn value(&self) -> Option<&A> {
        match self {
            Exit::Success(a) => Some(a),
            Exit::Failure(_) => None,
        }
    }

    /// The failure cause, if any.
    pub fn cause(&self) -> Option<&Cause<E>> {
        match self {
            Exit::Success(_) => None,
            Exit::Failure(cause) => Some(cause),
        }
    }

    /// Transform the success value.
    pub fn map<B>(self, f: impl FnOnce(A) -> B) -> Exit<E, B> {
        match self {
            Exit::Success(a) => Exit::Success(f(a)),
            Exit::Failure(cause) => Exit::Failure(cause),
        }
    }

    /// Transform the failure cause.
    pub fn map_cause<E2>(self, f: impl FnOnce(Cause<E>) -> Cause<E2>) -> Exit<E2, A> {
        match self {
            Exit::Success(a) => Exit::Success(a),
            Exit::Failure(cause) => Exit::Failure(f(cause)),
        }
    }

    /// Convert into a `Result`, keeping the whole cause on failure.
    pub fn into_result(self) -> Result<A, Cause<E>> {
        match self {
            Exit::Success(a) => Ok(a),
            Exit::Failure(cause) => Err(cause),
        }
    }
}

impl<E, A> From<Result<A, E>> for Exit<E, A> {
    fn from(result: Result<A, E>) -> Self {
        match result {
            Ok(a) => Exit::Success(a),
            Err(e) => Exit::fail(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exit_accessors() {
        let ok: Exit<&str, i32> = Exit::succeed(1);
        assert!(ok.is_success());
        assert_eq!(ok.value(), Some(&1));
        assert!(ok.cause().is_none());

        let interrupted: Exit<&str, i32> = Exit::interrupt(FiberId::NONE);
        assert!(interrupted.is_interrupted());
        assert!(!interrupted.is_success());
    }

    #[test]
    fn test_exit_from_result() {
        let exit: Exit<&str, i32> = Err("nope").into();
        assert_eq!(exit.into_result(), Err(Cause::fail("nope")));
    }

    #[test]
    fn test_exit_map() {
        let exit: Exit<(), i32> = Exit::succeed(20);
        assert_eq!(exit.map(|n| n + 1), Exit::Success(21));
    }
}
