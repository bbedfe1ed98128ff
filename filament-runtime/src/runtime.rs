//! Runtime
//!
//! A [`Runtime`] bundles what every fiber it runs shares: the scheduler
//! that executes quanta, the supervisor, the loggers, the fatal-panic
//! policy, metrics and the timer. Fibers hold this bundle as a
//! [`Platform`]; `supervised` and `with_runtime_config` swap in a modified
//! copy for the extent of one effect.
//!
//! # Example
//!
//! ```rust,ignore
//! use filament_runtime::{Effect, Runtime, RuntimeConfig};
//!
//! let runtime = Runtime::new(RuntimeConfig::default())?;
//! let exit = runtime.run(Effect::<i32, String>::succeed(20).map(|n| n + 22));
//! assert_eq!(exit.value(), Some(&42));
//! ```

use std::fmt;
use std::panic::Location;
use std::sync::Arc;
use std::time::Duration;

use crossbeam_channel::RecvTimeoutError;

use crate::config::RuntimeConfig;
use crate::context::FiberContext;
use crate::effect::{Data, Effect};
use crate::error::{FiberFailure, RuntimeError};
use crate::exit::Exit;
use crate::fatal::{self, FatalPolicy};
use crate::fiber::{Fiber, FiberId};
use crate::fiber_ref::FiberRefs;
use crate::logger::{Logger, StderrLogger};
use crate::metrics::FiberMetrics;
use crate::scheduler::{Scheduler, WorkStealingScheduler};
use crate::scope::FiberScope;
use crate::supervisor::{NoneSupervisor, Supervisor};
use crate::timer::Timer;

/// How often a blocked `run` checks whether its fiber was abandoned.
const ABANDON_POLL: Duration = Duration::from_millis(50);

/// Services shared by the fibers of one runtime.
#[derive(Clone)]
pub(crate) struct Platform {
    pub(crate) config: RuntimeConfig,
    pub(crate) scheduler: Arc<dyn Scheduler>,
    pub(crate) supervisor: Arc<dyn Supervisor>,
    pub(crate) loggers: Vec<Arc<dyn Logger>>,
    pub(crate) fatal: FatalPolicy,
    pub(crate) metrics: Arc<FiberMetrics>,
    pub(crate) timer: Arc<Timer>,
}

impl fmt::Debug for Platform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Platform")
            .field("config", &self.config)
            .field("loggers", &self.loggers.len())
            .finish_non_exhaustive()
    }
}

/// Entry point: runs effects as root fibers.
///
/// Dropping the runtime shuts down its worker threads and timer.
pub struct Runtime {
    platform: Arc<Platform>,
}

impl Runtime {
    /// Build a runtime with the default scheduler, supervisor and logger.
    pub fn new(config: RuntimeConfig) -> Result<Self, RuntimeError> {
        Self::builder().config(config).build()
    }

    /// Build a runtime configured from `FILAMENT_*` environment variables.
    pub fn from_env() -> Result<Self, RuntimeError> {
        Self::new(RuntimeConfig::try_from_env()?)
    }

    /// Start building a runtime.
    pub fn builder() -> RuntimeBuilder {
        RuntimeBuilder::new()
    }

    /// The configuration root fibers start with.
    pub fn config(&self) -> &RuntimeConfig {
        &self.platform.config
    }

    /// Fiber metrics. Only populated when `metrics_enabled` is set.
    pub fn metrics(&self) -> &FiberMetrics {
        &self.platform.metrics
    }

    /// Start `effect` as a root fiber in the global scope.
    #[track_caller]
    pub fn fork<A: Data, E: Data>(&self, effect: Effect<A, E>) -> Fiber<A, E> {
        let location = Location::caller();
        let context = FiberContext::new(
            FiberId::next(),
            Arc::clone(&self.platform),
            FiberRefs::default(),
            FiberScope::Global,
            location,
        );
        self.platform.supervisor.on_start(context.id(), None);
        if self.platform.config.metrics_enabled {
            self.platform.metrics.record_start(location);
        }
        tracing::debug!(fiber = %context.id(), "root fiber started");
        context.evaluate_later(effect.into_instr());
        Fiber::from_context(context)
    }

    /// Run `effect` to completion, blocking the calling thread.
    ///
    /// Must not be called from a worker of this runtime, nor with a
    /// scheduler that only makes progress when driven by the caller.
    #[track_caller]
    pub fn run<A: Data, E: Data>(&self, effect: Effect<A, E>) -> Exit<E, A> {
        let (tx, rx) = crossbeam_channel::bounded(1);
        let fiber = self.fork(effect);
        fiber.on_exit(move |exit| {
            let _ = tx.send(exit);
        });
        loop {
            match rx.recv_timeout(ABANDON_POLL) {
                Ok(exit) => return exit,
                Err(RecvTimeoutError::Timeout) if !fatal::is_catastrophic() => continue,
                Err(_) => {
                    tracing::error!(fiber = %fiber.id(), "fiber was abandoned");
                    return Exit::die("fiber was abandoned");
                }
            }
        }
    }

    /// Run `effect` to completion and convert its exit to a `Result`.
    #[track_caller]
    pub fn run_result<A: Data, E: Data + fmt::Debug>(&self, effect: Effect<A, E>) -> Result<A, FiberFailure<E>> {
        self.run(effect).into_result().map_err(FiberFailure::new)
    }

    /// Start `effect` and invoke `callback` with its exit when it is done.
    #[track_caller]
    pub fn run_callback<A, E, F>(&self, effect: Effect<A, E>, callback: F) -> Fiber<A, E>
    where
        A: Data,
        E: Data,
        F: FnOnce(Exit<E, A>) + Send + 'static,
    {
        let fiber = self.fork(effect);
        fiber.on_exit(callback);
        fiber
    }

    /// Stop the worker threads and the timer. Fibers still queued or
    /// sleeping never complete.
    pub fn shutdown(&self) {
        tracing::debug!("runtime shutting down");
        self.platform.scheduler.shutdown();
        self.platform.timer.shutdown();
    }
}

impl Drop for Runtime {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl fmt::Debug for Runtime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Runtime").field("platform", &self.platform).finish()
    }
}

/// Builder for [`Runtime`].
pub struct RuntimeBuilder {
    config: RuntimeConfig,
    scheduler: Option<Arc<dyn Scheduler>>,
    supervisor: Option<Arc<dyn Supervisor>>,
    loggers: Option<Vec<Arc<dyn Logger>>>,
    fatal: FatalPolicy,
}

impl RuntimeBuilder {
    /// Create a builder with the default configuration.
    pub fn new() -> Self {
        Self {
            config: RuntimeConfig::default(),
            scheduler: None,
            supervisor: None,
            loggers: None,
            fatal: FatalPolicy::default(),
        }
    }

    /// Set the configuration.
    pub fn config(mut self, config: RuntimeConfig) -> Self {
        self.config = config;
        self
    }

    /// Run fibers on `scheduler` instead of a work-stealing pool.
    pub fn scheduler<S: Scheduler + 'static>(mut self, scheduler: Arc<S>) -> Self {
        self.scheduler = Some(scheduler);
        self
    }

    /// Observe every fiber with `supervisor`.
    pub fn supervisor<S: Supervisor + 'static>(mut self, supervisor: Arc<S>) -> Self {
        self.supervisor = Some(supervisor);
        self
    }

    /// Add a logger. The first call replaces the default stderr logger.
    pub fn logger<L: Logger + 'static>(mut self, logger: Arc<L>) -> Self {
        self.loggers.get_or_insert_with(Vec::new).push(logger);
        self
    }

    /// Discard all log records.
    pub fn without_loggers(mut self) -> Self {
        self.loggers = Some(Vec::new());
        self
    }

    /// Set the fatal-panic policy.
    pub fn fatal_policy(mut self, policy: FatalPolicy) -> Self {
        self.fatal = policy;
        self
    }

    /// Validate the configuration and start the runtime.
    pub fn build(self) -> Result<Runtime, RuntimeError> {
        self.config.validate()?;
        fatal::install_panic_hook();

        let scheduler: Arc<dyn Scheduler> = match self.scheduler {
            Some(scheduler) => scheduler,
            None => Arc::new(WorkStealingScheduler::new(self.config.num_workers)?),
        };
        let loggers = self.loggers.unwrap_or_else(|| {
            vec![Arc::new(StderrLogger::new(self.config.log_level, self.config.log_format)) as Arc<dyn Logger>]
        });
        let supervisor = self
            .supervisor
            .unwrap_or_else(|| Arc::new(NoneSupervisor) as Arc<dyn Supervisor>);

        tracing::debug!(
            max_op_count = self.config.max_op_count,
            num_workers = self.config.num_workers,
            metrics = self.config.metrics_enabled,
            "runtime started"
        );

        Ok(Runtime {
            platform: Arc::new(Platform {
                config: self.config,
                scheduler,
                supervisor,
                loggers,
                fatal: self.fatal,
                metrics: Arc::new(FiberMetrics::default()),
                timer: Arc::new(Timer::new()),
            }),
        })
    }
}

impl Default for RuntimeBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for RuntimeBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RuntimeBuilder")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cause::Cause;
    use crate::scheduler::ManualScheduler;

    fn quiet(workers: usize) -> Runtime {
        let config = RuntimeConfig::builder().num_workers(workers).build().unwrap();
        Runtime::builder().config(config).without_loggers().build().unwrap()
    }

    #[test]
    fn test_run_success() {
        let runtime = quiet(2);
        let exit = runtime.run(Effect::<i32, String>::succeed(20).map(|n| n + 22));
        assert_eq!(exit.value(), Some(&42));
    }

    #[test]
    fn test_run_result_failure() {
        let runtime = quiet(1);
        let err = runtime
            .run_result(Effect::<i32, String>::fail("nope".to_string()))
            .unwrap_err();
        assert_eq!(err.failure(), Some(&"nope".to_string()));
    }

    #[test]
    fn test_invalid_config_rejected() {
        let config = RuntimeConfig::builder().num_workers(0).build_unchecked();
        let result = Runtime::builder().config(config).build();
        assert!(matches!(result, Err(RuntimeError::Config(_))));
    }

    #[test]
    fn test_manual_scheduler_callback() {
        let scheduler = Arc::new(ManualScheduler::new());
        let runtime = Runtime::builder()
            .scheduler(Arc::clone(&scheduler))
            .without_loggers()
            .build()
            .unwrap();
        let (tx, rx) = crossbeam_channel::bounded(1);
        let fiber = runtime.run_callback(Effect::<u8, ()>::die("boom"), move |exit| {
            let _ = tx.send(exit);
        });
        assert!(fiber.poll().is_none());
        scheduler.run_until_idle();
        let exit = rx.try_recv().unwrap();
        assert!(matches!(exit.cause(), Some(Cause::Die(_))));
    }

    #[test]
    fn test_metrics_recorded_when_enabled() {
        let config = RuntimeConfig::builder()
            .num_workers(1)
            .metrics_enabled(true)
            .build()
            .unwrap();
        let runtime = Runtime::builder().config(config).without_loggers().build().unwrap();
        runtime.run(Effect::<(), ()>::unit());
        runtime.run(Effect::<(), ()>::fail(()));
        assert_eq!(runtime.metrics().started().get(), 2);
        assert_eq!(runtime.metrics().successes().get(), 1);
        assert_eq!(runtime.metrics().failures("fail").unwrap().get(), 1);
    }
}
