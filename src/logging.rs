//! # Structured logging setup.
//!
//! Thin wrapper over `tracing-subscriber`: call [`init`] once at startup.
//! The `RUST_LOG` environment variable overrides the default filter, so a
//! single deployment knob controls verbosity per module.

use tracing::Level;
use tracing_subscriber::{fmt, EnvFilter};

/// Initializes logging, filtering from `RUST_LOG` when set.
///
/// Defaults to `info` for this crate and `warn` for everything else.
pub fn init() {
    init_with_filter("eventvisor=info,warn");
}

/// Initializes logging at a fixed level for this crate.
pub fn init_with_level(level: Level) {
    init_with_filter(&format!("eventvisor={level}"));
}

fn init_with_filter(default: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));

    fmt()
        .with_env_filter(filter)
        .with_target(true)
        .init();
}
