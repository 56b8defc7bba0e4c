//! Logging setup
//!
//! Library code only emits `tracing` events. Binaries and tests that want to
//! see them call [`init`]. `CGSTORE_LOG` takes an `EnvFilter` directive
//! (default `info`); `CGSTORE_DEBUG=1` turns on the step-by-step
//! `debug_log!` traces.

use std::sync::OnceLock;

pub const LOG_ENV: &str = "CGSTORE_LOG";
pub const DEBUG_ENV: &str = "CGSTORE_DEBUG";

// Debug logging macro - enabled via CGSTORE_DEBUG=1
macro_rules! debug_log {
    ($($arg:tt)*) => {
        if $crate::logging::debug_enabled() {
            eprintln!("[CGSTORE DEBUG] {}", format!($($arg)*));
        }
    };
}

pub fn debug_enabled() -> bool {
    static ENABLED: OnceLock<bool> = OnceLock::new();
    *ENABLED.get_or_init(|| std::env::var_os(DEBUG_ENV).is_some())
}

/// Install a fmt subscriber on stderr. Safe to call more than once.
pub fn init() {
    use tracing_subscriber::prelude::*;
    use tracing_subscriber::{fmt, EnvFilter};

    let env_filter = EnvFilter::try_from_env(LOG_ENV).unwrap_or_else(|_| EnvFilter::new("info"));

    // уже установлен другой subscriber - не страшно
    let _ = tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt::layer().with_writer(std::io::stderr).with_target(true))
        .try_init();
}
