//! Logging Infrastructure
//!
//! The runtime logs through [`tracing`]: scheduler and runtime lifecycle at
//! `info`, worker and layer construction at `debug`, per-fiber events
//! (fork, interrupt, completion) at `trace`, and failures nobody observed
//! at `warn`.
//!
//! Applications usually install their own subscriber. [`init_logging`]
//! installs a `fmt` subscriber for programs that do not, honouring
//! `RUST_LOG` and falling back to the configured [`LogLevel`].
//!
//! [`LogLevel`]: crate::config::LogLevel

use std::sync::OnceLock;

use tracing_subscriber::EnvFilter;

use crate::config::LogConfig;

/// Install a global `fmt` subscriber.
///
/// Safe to call multiple times; only the first call does anything. Returns
/// true if this crate's subscriber is the one in use, false if another
/// subscriber was already installed.
pub fn init_logging(config: &LogConfig) -> bool {
    static INSTALLED: OnceLock<bool> = OnceLock::new();
    *INSTALLED.get_or_init(|| {
        tracing_subscriber::fmt()
            .with_env_filter(
                EnvFilter::try_from_default_env()
                    .unwrap_or_else(|_| EnvFilter::new(config.level.as_str())),
            )
            .with_thread_names(config.thread_names)
            .try_init()
            .is_ok()
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::LogLevel;

    #[test]
    fn test_init_logging_is_idempotent() {
        let config = LogConfig {
            level: LogLevel::Debug,
            thread_names: true,
        };
        let first = init_logging(&config);
        let second = init_logging(&LogConfig::default());
        assert_eq!(first, second);
    }
}
