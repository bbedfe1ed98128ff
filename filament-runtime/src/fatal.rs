//! Panic Triage
//!
//! The interpreter runs every quantum under `catch_unwind`. A caught panic
//! is either recoverable, and re-enters the fiber as a `Die` defect, or
//! fatal. A fatal panic sets the process-wide catastrophic flag, is handed
//! to the [`FatalPolicy`] report hook, and abandons the fiber; once the
//! flag is set no fiber runs another quantum.
//!
//! By default a panic is fatal exactly when its payload is a [`Fatal`]
//! marker, raised with [`Fatal::raise`].
//!
//! # Example
//!
//! ```rust,ignore
//! use filament_runtime::fatal::{Fatal, FatalPolicy};
//!
//! let policy = FatalPolicy::default()
//!     .with_report(|report| eprintln!("giving up: {}", report.format()));
//!
//! // Somewhere deep inside a fiber:
//! Fatal::raise("allocator state corrupted");
//! ```

use std::any::Any;
use std::cell::RefCell;
use std::fmt;
use std::panic;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Once};

use crate::fiber::FiberId;

/// Set once a fatal panic has been observed.
static CATASTROPHIC: AtomicBool = AtomicBool::new(false);

static HOOK_INSTALLED: Once = Once::new();

thread_local! {
    static LAST_LOCATION: RefCell<Option<PanicLocation>> = const { RefCell::new(None) };
}

/// True once any fiber has hit a fatal panic.
pub fn is_catastrophic() -> bool {
    CATASTROPHIC.load(Ordering::Acquire)
}

pub(crate) fn set_catastrophic() {
    CATASTROPHIC.store(true, Ordering::Release);
}

/// Source location of a panic.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PanicLocation {
    /// File name.
    pub file: String,
    /// Line number.
    pub line: u32,
    /// Column number.
    pub column: u32,
}

impl fmt::Display for PanicLocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}:{}", self.file, self.line, self.column)
    }
}

/// Panic payload that the default policy treats as fatal.
#[derive(Debug, Clone)]
pub struct Fatal {
    message: String,
}

impl Fatal {
    /// Create a marker.
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }

    /// The message.
    pub fn message(&self) -> &str {
        &self.message
    }

    /// Panic with a `Fatal` payload.
    pub fn raise(message: impl Into<String>) -> ! {
        panic::panic_any(Fatal::new(message))
    }
}

/// Information about a caught panic.
#[derive(Debug, Clone, PartialEq)]
pub struct PanicReport {
    message: String,
    location: Option<PanicLocation>,
    thread_name: Option<String>,
    fiber: Option<FiberId>,
    fatal: bool,
}

impl PanicReport {
    /// Describe a payload just caught on this thread.
    pub(crate) fn capture(payload: &(dyn Any + Send), fiber: Option<FiberId>, fatal: bool) -> Self {
        Self {
            message: payload_message(payload),
            location: take_last_location(),
            thread_name: std::thread::current().name().map(|s| s.to_string()),
            fiber,
            fatal,
        }
    }

    /// Get the panic message.
    pub fn message(&self) -> &str {
        &self.message
    }

    /// Get the source location, if the panic hook recorded one.
    pub fn location(&self) -> Option<&PanicLocation> {
        self.location.as_ref()
    }

    /// Get the thread name, if available.
    pub fn thread_name(&self) -> Option<&str> {
        self.thread_name.as_deref()
    }

    /// The fiber that was running, if any.
    pub fn fiber(&self) -> Option<FiberId> {
        self.fiber
    }

    /// Whether the panic was classified fatal.
    pub fn is_fatal(&self) -> bool {
        self.fatal
    }

    /// The defect message a recoverable panic becomes.
    pub fn defect_message(&self) -> String {
        match &self.location {
            Some(loc) => format!("{} (at {})", self.message, loc),
            None => self.message.clone(),
        }
    }

    /// Format as a string for logging.
    pub fn format(&self) -> String {
        let mut output = String::new();

        let kind = if self.fatal { "fatal panic" } else { "panic" };
        output.push_str(&format!("{}: {}\n", kind, self.message));

        if let Some(loc) = &self.location {
            output.push_str(&format!("  at {}\n", loc));
        }
        if let Some(fiber) = &self.fiber {
            output.push_str(&format!("  in {}\n", fiber));
        }
        if let Some(thread) = &self.thread_name {
            output.push_str(&format!("  on thread '{}'\n", thread));
        }

        output
    }
}

type Predicate = Arc<dyn Fn(&(dyn Any + Send)) -> bool + Send + Sync>;
type Report = Arc<dyn Fn(&PanicReport) + Send + Sync>;

/// Decides which panics are fatal and how they are reported.
#[derive(Clone)]
pub struct FatalPolicy {
    is_fatal: Predicate,
    report: Report,
}

impl Default for FatalPolicy {
    fn default() -> Self {
        Self {
            is_fatal: Arc::new(|payload| payload.is::<Fatal>()),
            report: Arc::new(|report| eprintln!("{}", report.format())),
        }
    }
}

impl fmt::Debug for FatalPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FatalPolicy").finish_non_exhaustive()
    }
}

impl FatalPolicy {
    /// Replace the fatal predicate.
    pub fn with_predicate<F>(mut self, is_fatal: F) -> Self
    where
        F: Fn(&(dyn Any + Send)) -> bool + Send + Sync + 'static,
    {
        self.is_fatal = Arc::new(is_fatal);
        self
    }

    /// Replace the report hook.
    pub fn with_report<F>(mut self, report: F) -> Self
    where
        F: Fn(&PanicReport) + Send + Sync + 'static,
    {
        self.report = Arc::new(report);
        self
    }

    pub(crate) fn is_fatal(&self, payload: &(dyn Any + Send)) -> bool {
        (self.is_fatal)(payload)
    }

    /// Set the catastrophic flag and report. The report hook itself may
    /// not bring the process down by panicking.
    pub(crate) fn escalate(&self, report: &PanicReport) {
        set_catastrophic();
        tracing::error!(fiber = ?report.fiber(), "{}", report.message());
        let _ = panic::catch_unwind(panic::AssertUnwindSafe(|| (self.report)(report)));
    }
}

/// Install a panic hook that records the location of the last panic on
/// each thread, then defers to the previously installed hook. Idempotent.
pub fn install_panic_hook() {
    HOOK_INSTALLED.call_once(|| {
        let previous = panic::take_hook();
        panic::set_hook(Box::new(move |info| {
            let location = info.location().map(|loc| PanicLocation {
                file: loc.file().to_string(),
                line: loc.line(),
                column: loc.column(),
            });
            LAST_LOCATION.with(|cell| *cell.borrow_mut() = location);
            previous(info);
        }));
    });
}

/// Take the location recorded for the last panic on this thread.
pub fn take_last_location() -> Option<PanicLocation> {
    LAST_LOCATION.with(|cell| cell.borrow_mut().take())
}

/// Extract a readable message from a panic payload.
pub(crate) fn payload_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else if let Some(fatal) = payload.downcast_ref::<Fatal>() {
        fatal.message.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_payload_message() {
        let boxed: Box<dyn Any + Send> = Box::new("static");
        assert_eq!(payload_message(&*boxed), "static");
        let boxed: Box<dyn Any + Send> = Box::new(String::from("owned"));
        assert_eq!(payload_message(&*boxed), "owned");
        let boxed: Box<dyn Any + Send> = Box::new(Fatal::new("marker"));
        assert_eq!(payload_message(&*boxed), "marker");
        let boxed: Box<dyn Any + Send> = Box::new(17_u8);
        assert_eq!(payload_message(&*boxed), "unknown panic");
    }

    #[test]
    fn test_default_policy_only_fatal_marker() {
        let policy = FatalPolicy::default();
        let marker: Box<dyn Any + Send> = Box::new(Fatal::new("x"));
        let plain: Box<dyn Any + Send> = Box::new("x");
        assert!(policy.is_fatal(&*marker));
        assert!(!policy.is_fatal(&*plain));

        let strict = policy.with_predicate(|_| true);
        assert!(strict.is_fatal(&*plain));
    }

    #[test]
    fn test_hook_records_location() {
        install_panic_hook();
        let result = panic::catch_unwind(|| panic!("located"));
        let payload = result.unwrap_err();
        let report = PanicReport::capture(&*payload, Some(FiberId::new(0, 4)), false);
        assert_eq!(report.message(), "located");
        let location = report.location().expect("hook should record a location");
        assert!(location.file.ends_with("fatal.rs"));
        assert!(report.defect_message().starts_with("located (at "));
        assert!(report.format().contains("in Fiber(#4)"));
        assert!(take_last_location().is_none());
    }
}
