//! # Filament Runtime Library
//!
//! Filament is a user-space concurrency runtime:
//!
//! - **Effects**: immutable descriptions of computations that succeed,
//!   fail with a typed error, die with a defect or are interrupted
//! - **Fibers**: cooperatively scheduled logical threads with structured
//!   parent/child lifetimes, interruption and finalizers
//! - **Scheduler**: M:N work-stealing execution of fiber quanta
//! - **STM**: software transactional memory over [`TRef`] cells, with
//!   `retry` built on the same async suspension fibers use
//!
//! ## Technical Standards
//!
//! Implementation follows these standards:
//!
//! - **Work Stealing**: Based on Chase-Lev deque per
//!   [crossbeam-deque](https://docs.rs/crossbeam-deque)
//! - **Channels**: blocking hand-off from fibers to threads per
//!   [crossbeam-channel](https://docs.rs/crossbeam-channel)
//! - **Locks**: [parking_lot](https://docs.rs/parking_lot)
//! - **Diagnostics**: [tracing](https://docs.rs/tracing)
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                      FILAMENT RUNTIME                            │
//! ├─────────────────────────────────────────────────────────────────┤
//! │                                                                  │
//! │  ┌──────────────┐  ┌──────────────┐  ┌──────────────┐          │
//! │  │    Effect    │  │     Stm      │  │   Runtime    │          │
//! │  │ (effect.rs)  │  │  (stm/*.rs)  │  │ (runtime.rs) │          │
//! │  └──────────────┘  └──────────────┘  └──────────────┘          │
//! │         │                 │                 │                   │
//! │         └─────────────────┼─────────────────┘                   │
//! │                           │                                     │
//! │  ┌──────────────┐  ┌──────────────┐  ┌──────────────┐          │
//! │  │   Run Loop   │  │  Scheduler   │  │    Timer     │          │
//! │  │ (context.rs) │  │(scheduler.rs)│  │  (timer.rs)  │          │
//! │  └──────────────┘  └──────────────┘  └──────────────┘          │
//! │                                                                  │
//! └─────────────────────────────────────────────────────────────────┘
//! ```

#![warn(missing_docs)]
#![warn(rust_2018_idioms)]

pub mod cause;
pub mod config;
pub mod effect;
pub mod error;
pub mod exit;
pub mod fatal;
pub mod fiber;
pub mod fiber_ref;
pub mod logger;
pub mod metrics;
pub mod runtime;
pub mod scheduler;
pub mod scope;
pub mod stm;
pub mod supervisor;
pub mod timer;

mod context;
mod frame;
mod instr;
mod state;

// Re-exports
pub use cause::{Cause, Defect};
pub use config::{ConfigError, RuntimeConfig, RuntimeConfigBuilder};
pub use effect::{AsyncCallback, AsyncReply, Data, Effect};
pub use error::{FiberFailure, RuntimeError};
pub use exit::Exit;
pub use fatal::{is_catastrophic, Fatal, FatalPolicy, PanicReport};
pub use fiber::{Fiber, FiberDescriptor, FiberId, FiberStatus, InterruptStatus};
pub use fiber_ref::{FiberRef, FiberRefs};
pub use instr::Erased;
pub use logger::{LogFormat, LogLevel, LogRecord, Logger, StderrLogger, TracingLogger};
pub use metrics::FiberMetrics;
pub use runtime::{Runtime, RuntimeBuilder};
pub use scheduler::{ManualScheduler, Scheduler, WorkStealingScheduler};
pub use scope::FiberScope;
pub use stm::{atomically, Stm, TRef};
pub use supervisor::{EffectKind, NoneSupervisor, Supervisor, TrackingSupervisor};
