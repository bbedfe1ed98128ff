//! Runtime Configuration
//!
//! Configuration can be set programmatically or loaded from environment
//! variables.
//!
//! # Environment Variables
//!
//! All environment variables use the `FILAMENT_` prefix:
//!
//! | Variable | Description | Default |
//! |----------|-------------|---------|
//! | `FILAMENT_MAX_OP_COUNT` | Instructions per fiber quantum | 2048 |
//! | `FILAMENT_NUM_WORKERS` | Number of worker threads | CPU count |
//! | `FILAMENT_LOG_LEVEL` | Log level (off/error/warn/info/debug/trace) | info |
//! | `FILAMENT_LOG_FORMAT` | Log format (plain/json) | plain |
//! | `FILAMENT_METRICS` | Record fiber metrics ("true"/"false") | false |
//! | `FILAMENT_REPORT_UNHANDLED` | Log fibers that fail unobserved ("true"/"false") | true |
//!
//! # Example
//!
//! ```rust,ignore
//! use filament_runtime::config::RuntimeConfig;
//!
//! // Load from environment with defaults
//! let config = RuntimeConfig::from_env();
//!
//! // Or use the builder pattern
//! let config = RuntimeConfig::builder()
//!     .num_workers(4)
//!     .max_op_count(512)
//!     .build()?;
//! ```

use std::env;

use thiserror::Error;

use crate::logger::{LogFormat, LogLevel};

/// Default number of instructions a fiber runs before yielding.
pub const DEFAULT_MAX_OP_COUNT: usize = 2048;

/// Complete runtime configuration.
///
/// Use `RuntimeConfig::default()` for sensible defaults, or
/// `RuntimeConfig::from_env()` to load from environment variables.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuntimeConfig {
    /// Instructions a fiber may dispatch before yielding its thread.
    /// Default: 2048.
    pub max_op_count: usize,

    /// Number of worker threads.
    /// Default: number of available CPUs.
    pub num_workers: usize,

    /// Minimum level of the default stderr logger.
    /// Default: Info.
    pub log_level: LogLevel,

    /// Rendering of the default stderr logger.
    /// Default: plain.
    pub log_format: LogFormat,

    /// Record fiber metrics.
    /// Default: false.
    pub metrics_enabled: bool,

    /// Log fibers that end in an unhandled failure other than
    /// interruption, at debug level.
    /// Default: true.
    pub report_unhandled: bool,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            max_op_count: DEFAULT_MAX_OP_COUNT,
            num_workers: num_cpus(),
            log_level: LogLevel::Info,
            log_format: LogFormat::Plain,
            metrics_enabled: false,
            report_unhandled: true,
        }
    }
}

impl RuntimeConfig {
    /// Create a new builder for RuntimeConfig.
    pub fn builder() -> RuntimeConfigBuilder {
        RuntimeConfigBuilder::new()
    }

    /// Load configuration from environment variables.
    ///
    /// Variables that are not set, or do not parse, keep their defaults.
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Some(val) = parse_env_usize("FILAMENT_MAX_OP_COUNT") {
            if val > 0 {
                config.max_op_count = val;
            }
        }

        if let Some(val) = parse_env_usize("FILAMENT_NUM_WORKERS") {
            if val > 0 {
                config.num_workers = val;
            }
        }

        if let Some(level) = env::var("FILAMENT_LOG_LEVEL").ok().and_then(|s| LogLevel::parse(&s)) {
            config.log_level = level;
        }

        if let Some(format) = env::var("FILAMENT_LOG_FORMAT").ok().and_then(|s| LogFormat::parse(&s)) {
            config.log_format = format;
        }

        if let Some(val) = env::var("FILAMENT_METRICS").ok().and_then(|s| parse_bool(&s)) {
            config.metrics_enabled = val;
        }

        if let Some(val) = env::var("FILAMENT_REPORT_UNHANDLED").ok().and_then(|s| parse_bool(&s)) {
            config.report_unhandled = val;
        }

        config
    }

    /// Load configuration from environment variables, rejecting any set
    /// variable that does not parse.
    pub fn try_from_env() -> Result<Self, ConfigError> {
        let mut config = Self::default();

        if let Some(val) = read_env("FILAMENT_MAX_OP_COUNT", |s| s.parse::<usize>().ok())? {
            config.max_op_count = val;
        }
        if let Some(val) = read_env("FILAMENT_NUM_WORKERS", |s| s.parse::<usize>().ok())? {
            config.num_workers = val;
        }
        if let Some(level) = read_env("FILAMENT_LOG_LEVEL", LogLevel::parse)? {
            config.log_level = level;
        }
        if let Some(format) = read_env("FILAMENT_LOG_FORMAT", LogFormat::parse)? {
            config.log_format = format;
        }
        if let Some(val) = read_env("FILAMENT_METRICS", parse_bool)? {
            config.metrics_enabled = val;
        }
        if let Some(val) = read_env("FILAMENT_REPORT_UNHANDLED", parse_bool)? {
            config.report_unhandled = val;
        }

        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration and return any errors.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.num_workers == 0 {
            return Err(ConfigError::InvalidValue {
                field: "num_workers".into(),
                message: "must be at least 1".into(),
            });
        }

        if self.max_op_count == 0 {
            return Err(ConfigError::InvalidValue {
                field: "max_op_count".into(),
                message: "must be at least 1".into(),
            });
        }

        Ok(())
    }
}

/// Configuration error.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    /// Invalid configuration value.
    #[error("invalid configuration for '{field}': {message}")]
    InvalidValue {
        /// Field name.
        field: String,
        /// Error message.
        message: String,
    },
    /// Environment variable parse error.
    #[error("failed to parse environment variable '{var}': {message}")]
    EnvParse {
        /// Variable name.
        var: String,
        /// Error message.
        message: String,
    },
}

/// Builder for RuntimeConfig.
#[derive(Debug, Clone, Default)]
pub struct RuntimeConfigBuilder {
    config: RuntimeConfig,
}

impl RuntimeConfigBuilder {
    /// Create a new builder with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the number of instructions per quantum.
    pub fn max_op_count(mut self, n: usize) -> Self {
        self.config.max_op_count = n;
        self
    }

    /// Set the number of worker threads.
    pub fn num_workers(mut self, n: usize) -> Self {
        self.config.num_workers = n;
        self
    }

    /// Set the log level.
    pub fn log_level(mut self, level: LogLevel) -> Self {
        self.config.log_level = level;
        self
    }

    /// Set the log format.
    pub fn log_format(mut self, format: LogFormat) -> Self {
        self.config.log_format = format;
        self
    }

    /// Enable or disable fiber metrics.
    pub fn metrics_enabled(mut self, enabled: bool) -> Self {
        self.config.metrics_enabled = enabled;
        self
    }

    /// Enable or disable reporting of unhandled fiber failures.
    pub fn report_unhandled(mut self, enabled: bool) -> Self {
        self.config.report_unhandled = enabled;
        self
    }

    /// Build the configuration.
    ///
    /// This validates the configuration and returns an error if invalid.
    pub fn build(self) -> Result<RuntimeConfig, ConfigError> {
        self.config.validate()?;
        Ok(self.config)
    }

    /// Build the configuration without validation.
    pub fn build_unchecked(self) -> RuntimeConfig {
        self.config
    }
}

/// Parse an environment variable as usize.
fn parse_env_usize(name: &str) -> Option<usize> {
    env::var(name).ok().and_then(|s| s.parse().ok())
}

fn parse_bool(s: &str) -> Option<bool> {
    match s.to_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => Some(true),
        "false" | "0" | "no" | "off" => Some(false),
        _ => None,
    }
}

/// Read `name`; `Ok(None)` if unset, an error if set but unparseable.
fn read_env<T>(name: &str, parse: impl Fn(&str) -> Option<T>) -> Result<Option<T>, ConfigError> {
    match env::var(name) {
        Ok(raw) => parse(&raw).map(Some).ok_or_else(|| ConfigError::EnvParse {
            var: name.to_string(),
            message: format!("unrecognized value '{}'", raw),
        }),
        Err(env::VarError::NotPresent) => Ok(None),
        Err(env::VarError::NotUnicode(_)) => Err(ConfigError::EnvParse {
            var: name.to_string(),
            message: "not valid unicode".to_string(),
        }),
    }
}

/// Get the number of available CPUs.
fn num_cpus() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
}
