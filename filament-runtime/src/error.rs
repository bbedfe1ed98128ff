//! Error types surfaced to code outside the runtime.

use std::fmt;
use std::io;

use thiserror::Error;

use crate::cause::Cause;
use crate::config::ConfigError;

/// Failure to build a [`crate::Runtime`].
#[derive(Debug, Error)]
pub enum RuntimeError {
    /// The configuration did not validate.
    #[error("invalid runtime configuration: {0}")]
    Config(#[from] ConfigError),
    /// A worker thread could not be started.
    #[error("failed to start worker threads: {0}")]
    Spawn(#[from] io::Error),
}

/// A failed exit, as a `std::error::Error`.
#[derive(Debug, Clone, PartialEq, Error)]
#[error("fiber failed: {cause}")]
pub struct FiberFailure<E: fmt::Debug> {
    cause: Cause<E>,
}

impl<E: fmt::Debug> FiberFailure<E> {
    /// Wrap a cause.
    pub fn new(cause: Cause<E>) -> Self {
        Self { cause }
    }

    /// The full cause.
    pub fn cause(&self) -> &Cause<E> {
        &self.cause
    }

    /// Take the cause.
    pub fn into_cause(self) -> Cause<E> {
        self.cause
    }

    /// The first typed failure, if the fiber failed with one.
    pub fn failure(&self) -> Option<&E> {
        self.cause.failure_option()
    }

    /// True if the fiber was interrupted.
    pub fn is_interrupted(&self) -> bool {
        self.cause.is_interrupted()
    }
}

impl<E: fmt::Debug> From<Cause<E>> for FiberFailure<E> {
    fn from(cause: Cause<E>) -> Self {
        Self::new(cause)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fiber::FiberId;

    #[test]
    fn test_fiber_failure_display() {
        let failure = FiberFailure::new(Cause::fail("bad input"));
        assert_eq!(failure.to_string(), "fiber failed: Fail(\"bad input\")");
        assert_eq!(failure.failure(), Some(&"bad input"));
        assert!(!failure.is_interrupted());
    }

    #[test]
    fn test_fiber_failure_interrupted() {
        let failure: FiberFailure<()> = Cause::interrupt(FiberId::new(0, 2)).into();
        assert!(failure.is_interrupted());
        assert!(failure.failure().is_none());
        assert_eq!(failure.into_cause(), Cause::interrupt(FiberId::new(0, 2)));
    }

    #[test]
    fn test_runtime_error_from_config() {
        let err: RuntimeError = ConfigError::InvalidValue {
            field: "num_workers".into(),
            message: "must be at least 1".into(),
        }
        .into();
        assert!(err.to_string().starts_with("invalid runtime configuration"));
    }
}
