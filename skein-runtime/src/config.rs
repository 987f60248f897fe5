//! Runtime Configuration
//!
//! Configuration for the skein runtime. Values can be set programmatically
//! through [`RuntimeConfig::builder`] or loaded from environment variables.
//!
//! # Environment Variables
//!
//! All environment variables use the `SKEIN_` prefix:
//!
//! | Variable | Description | Default |
//! |----------|-------------|---------|
//! | `SKEIN_NUM_WORKERS` | Number of worker threads | CPU count |
//! | `SKEIN_WORK_STEALING` | Enable work stealing ("true"/"false") | true |
//! | `SKEIN_OPS_BEFORE_YIELD` | Interpreter steps a fiber runs before yielding its worker | 2048 |
//! | `SKEIN_IDLE_TIMEOUT_MS` | How long an idle worker parks before rechecking queues | 5 |
//! | `SKEIN_SHUTDOWN_GRACE_MS` | How long shutdown waits for interrupted fibers | 5000 |
//! | `SKEIN_LOG_LEVEL` | Log level (off/error/warn/info/debug/trace) | info |
//!
//! # Example
//!
//! ```rust,ignore
//! use skein_runtime::config::RuntimeConfig;
//!
//! // Load from environment with defaults
//! let config = RuntimeConfig::from_env();
//!
//! // Or use the builder pattern
//! let config = RuntimeConfig::builder()
//!     .num_workers(4)
//!     .ops_before_yield(512)
//!     .build()?;
//! ```

use std::env;
use std::time::Duration;

use thiserror::Error;

/// Log level for runtime logging.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogLevel {
    /// No logging.
    Off,
    /// Error messages only.
    Error,
    /// Warnings and errors.
    Warn,
    /// Informational messages (default).
    #[default]
    Info,
    /// Debug messages.
    Debug,
    /// Trace-level messages.
    Trace,
}

impl LogLevel {
    /// Parse a log level from a string.
    pub fn from_str(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "off" | "none" | "0" => Some(LogLevel::Off),
            "error" | "err" | "1" => Some(LogLevel::Error),
            "warn" | "warning" | "2" => Some(LogLevel::Warn),
            "info" | "3" => Some(LogLevel::Info),
            "debug" | "4" => Some(LogLevel::Debug),
            "trace" | "5" => Some(LogLevel::Trace),
            _ => None,
        }
    }

    /// Convert to a string representation.
    ///
    /// The result is also a valid `EnvFilter` directive.
    pub fn as_str(&self) -> &'static str {
        match self {
            LogLevel::Off => "off",
            LogLevel::Error => "error",
            LogLevel::Warn => "warn",
            LogLevel::Info => "info",
            LogLevel::Debug => "debug",
            LogLevel::Trace => "trace",
        }
    }
}

/// Scheduler configuration.
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Number of worker threads.
    /// Default: number of available CPUs.
    pub num_workers: usize,

    /// Enable work stealing between worker threads.
    /// Default: true.
    pub work_stealing: bool,

    /// Interpreter steps a fiber may take before it is re-queued.
    /// Default: 2048.
    pub ops_before_yield: usize,

    /// How long an idle worker waits for a wakeup before polling the queues again.
    /// Default: 5ms.
    pub idle_timeout: Duration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            num_workers: num_cpus(),
            work_stealing: true,
            ops_before_yield: 2048,
            idle_timeout: Duration::from_millis(5),
        }
    }
}

/// Timeout configuration.
#[derive(Debug, Clone)]
pub struct TimeoutConfig {
    /// Time `Runtime::shutdown` waits for interrupted fibers to finish their
    /// finalizers before abandoning them.
    /// Default: 5 seconds.
    pub shutdown_grace: Duration,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            shutdown_grace: Duration::from_secs(5),
        }
    }
}

/// Logging configuration.
#[derive(Debug, Clone)]
pub struct LogConfig {
    /// Log level used when `RUST_LOG` is not set.
    /// Default: Info.
    pub level: LogLevel,

    /// Include thread names in log lines.
    /// Default: true.
    pub thread_names: bool,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: LogLevel::Info,
            thread_names: true,
        }
    }
}

/// Complete runtime configuration.
///
/// Use `RuntimeConfig::builder()` for programmatic configuration or
/// `RuntimeConfig::from_env()` to load from environment variables.
#[derive(Debug, Clone, Default)]
pub struct RuntimeConfig {
    /// Scheduler configuration.
    pub scheduler: SchedulerConfig,

    /// Timeout configuration.
    pub timeout: TimeoutConfig,

    /// Logging configuration.
    pub log: LogConfig,
}

impl RuntimeConfig {
    /// Create a new builder for RuntimeConfig.
    pub fn builder() -> RuntimeConfigBuilder {
        RuntimeConfigBuilder::new()
    }

    /// Load configuration from environment variables.
    ///
    /// Environment variables that are not set, or fail to parse, keep their
    /// default values.
    pub fn from_env() -> Self {
        let mut config = Self::default();

        // Scheduler configuration
        if let Some(val) = parse_env_usize("SKEIN_NUM_WORKERS") {
            if val > 0 {
                config.scheduler.num_workers = val;
            }
        }

        if let Some(val) = parse_env_bool("SKEIN_WORK_STEALING") {
            config.scheduler.work_stealing = val;
        }

        if let Some(val) = parse_env_usize("SKEIN_OPS_BEFORE_YIELD") {
            if val > 0 {
                config.scheduler.ops_before_yield = val;
            }
        }

        if let Some(val) = parse_env_usize("SKEIN_IDLE_TIMEOUT_MS") {
            if val > 0 {
                config.scheduler.idle_timeout = Duration::from_millis(val as u64);
            }
        }

        // Timeout configuration
        if let Some(val) = parse_env_usize("SKEIN_SHUTDOWN_GRACE_MS") {
            config.timeout.shutdown_grace = Duration::from_millis(val as u64);
        }

        // Logging configuration
        if let Ok(val) = env::var("SKEIN_LOG_LEVEL") {
            if let Some(level) = LogLevel::from_str(&val) {
                config.log.level = level;
            }
        }

        config
    }

    /// Validate the configuration and return the first error found.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.scheduler.num_workers == 0 {
            return Err(ConfigError::InvalidValue {
                field: "scheduler.num_workers".into(),
                message: "must be at least 1".into(),
            });
        }

        if self.scheduler.ops_before_yield == 0 {
            return Err(ConfigError::InvalidValue {
                field: "scheduler.ops_before_yield".into(),
                message: "must be at least 1".into(),
            });
        }

        if self.scheduler.idle_timeout.is_zero() {
            return Err(ConfigError::InvalidValue {
                field: "scheduler.idle_timeout".into(),
                message: "must be non-zero".into(),
            });
        }

        Ok(())
    }
}

/// Configuration error.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    /// Invalid configuration value.
    #[error("invalid config value for '{field}': {message}")]
    InvalidValue {
        /// Field name.
        field: String,
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

    /// Set the number of worker threads.
    pub fn num_workers(mut self, n: usize) -> Self {
        self.config.scheduler.num_workers = n;
        self
    }

    /// Enable or disable work stealing.
    pub fn work_stealing(mut self, enabled: bool) -> Self {
        self.config.scheduler.work_stealing = enabled;
        self
    }

    /// Set the step budget after which a fiber yields its worker.
    pub fn ops_before_yield(mut self, ops: usize) -> Self {
        self.config.scheduler.ops_before_yield = ops;
        self
    }

    /// Set how long idle workers park between queue checks.
    pub fn idle_timeout(mut self, timeout: Duration) -> Self {
        self.config.scheduler.idle_timeout = timeout;
        self
    }

    /// Set the shutdown grace period.
    pub fn shutdown_grace(mut self, grace: Duration) -> Self {
        self.config.timeout.shutdown_grace = grace;
        self
    }

    /// Set the log level.
    pub fn log_level(mut self, level: LogLevel) -> Self {
        self.config.log.level = level;
        self
    }

    /// Build the configuration, validating it first.
    pub fn build(self) -> Result<RuntimeConfig, ConfigError> {
        self.config.validate()?;
        Ok(self.config)
    }

    /// Build the configuration without validation.
    ///
    /// Use this only if you're certain the configuration is valid.
    pub fn build_unchecked(self) -> RuntimeConfig {
        self.config
    }
}

/// Parse an environment variable as usize.
fn parse_env_usize(name: &str) -> Option<usize> {
    env::var(name).ok().and_then(|s| s.trim().parse().ok())
}

/// Parse an environment variable as bool.
fn parse_env_bool(name: &str) -> Option<bool> {
    env::var(name).ok().and_then(|s| match s.trim().to_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => Some(true),
        "false" | "0" | "no" | "off" => Some(false),
        _ => None,
    })
}

/// Get the number of available CPUs.
fn num_cpus() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = RuntimeConfig::default();
        assert!(config.scheduler.num_workers >= 1);
        assert!(config.scheduler.work_stealing);
        assert_eq!(config.scheduler.ops_before_yield, 2048);
        assert_eq!(config.scheduler.idle_timeout, Duration::from_millis(5));
        assert_eq!(config.timeout.shutdown_grace, Duration::from_secs(5));
        assert_eq!(config.log.level, LogLevel::Info);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_builder() {
        let config = RuntimeConfig::builder()
            .num_workers(4)
            .work_stealing(false)
            .ops_before_yield(64)
            .shutdown_grace(Duration::from_millis(250))
            .log_level(LogLevel::Debug)
            .build()
            .unwrap();

        assert_eq!(config.scheduler.num_workers, 4);
        assert!(!config.scheduler.work_stealing);
        assert_eq!(config.scheduler.ops_before_yield, 64);
        assert_eq!(config.timeout.shutdown_grace, Duration::from_millis(250));
        assert_eq!(config.log.level, LogLevel::Debug);
    }

    #[test]
    fn test_builder_validation() {
        let result = RuntimeConfig::builder().num_workers(0).build();
        assert!(result.is_err());

        let result = RuntimeConfig::builder().ops_before_yield(0).build();
        assert!(matches!(
            result,
            Err(ConfigError::InvalidValue { ref field, .. }) if field == "scheduler.ops_before_yield"
        ));

        let result = RuntimeConfig::builder().idle_timeout(Duration::ZERO).build();
        assert!(result.is_err());
    }

    #[test]
    fn test_build_unchecked_skips_validation() {
        let config = RuntimeConfig::builder().num_workers(0).build_unchecked();
        assert_eq!(config.scheduler.num_workers, 0);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_log_level_from_str() {
        assert_eq!(LogLevel::from_str("off"), Some(LogLevel::Off));
        assert_eq!(LogLevel::from_str("ERROR"), Some(LogLevel::Error));
        assert_eq!(LogLevel::from_str("warn"), Some(LogLevel::Warn));
        assert_eq!(LogLevel::from_str("INFO"), Some(LogLevel::Info));
        assert_eq!(LogLevel::from_str("debug"), Some(LogLevel::Debug));
        assert_eq!(LogLevel::from_str("TRACE"), Some(LogLevel::Trace));
        assert_eq!(LogLevel::from_str("invalid"), None);
    }

    #[test]
    fn test_config_error_display() {
        let err = ConfigError::InvalidValue {
            field: "num_workers".into(),
            message: "must be positive".into(),
        };
        assert!(err.to_string().contains("num_workers"));
        assert!(err.to_string().contains("must be positive"));
    }

    #[test]
    fn test_from_env_with_no_vars() {
        env::remove_var("SKEIN_NUM_WORKERS");
        env::remove_var("SKEIN_OPS_BEFORE_YIELD");

        let config = RuntimeConfig::from_env();
        assert!(config.scheduler.num_workers >= 1);
        assert_eq!(config.scheduler.ops_before_yield, 2048);
    }

    #[test]
    fn test_from_env_reads_shutdown_grace() {
        env::set_var("SKEIN_SHUTDOWN_GRACE_MS", "125");
        let config = RuntimeConfig::from_env();
        env::remove_var("SKEIN_SHUTDOWN_GRACE_MS");

        assert_eq!(config.timeout.shutdown_grace, Duration::from_millis(125));
    }
}
