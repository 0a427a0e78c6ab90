//! Tracing setup.
//!
//! Logging starts at `info` before configuration is read. Once it is, the
//! configured level is applied through [`LogLevel::apply`] unless `RUST_LOG`
//! is set.

use tracing_subscriber::{EnvFilter, Registry, fmt, prelude::*, reload};

const STARTUP_LEVEL: &str = "info";

/// Handle to the active filter of the global subscriber.
pub struct LogLevel {
    handle: Option<reload::Handle<EnvFilter, Registry>>,
}

impl LogLevel {
    /// Switch to `level`. No-op when `RUST_LOG` is set or this process did
    /// not install the subscriber.
    pub fn apply(&self, level: &str) {
        let Some(handle) = &self.handle else {
            return;
        };
        match handle.reload(EnvFilter::new(level)) {
            Ok(()) => tracing::info!(level, "Log level applied"),
            Err(e) => tracing::warn!(level, error = %e, "Failed to apply log level"),
        }
    }
}

/// Install the global subscriber.
pub fn init_tracing() -> LogLevel {
    let from_env = std::env::var_os("RUST_LOG").is_some();
    let filter = if from_env {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(STARTUP_LEVEL))
    } else {
        EnvFilter::new(STARTUP_LEVEL)
    };

    let (filter, handle) = reload::Layer::new(filter);
    let installed = tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer())
        .try_init()
        .is_ok();

    LogLevel {
        handle: (installed && !from_env).then_some(handle),
    }
}
