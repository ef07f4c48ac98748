//! Logging setup and teardown.
//!
//! The filter is installed behind a reload layer so the host can silence logging once
//! it has shut down, after flushing what was already written.
use std::{
    io::{self, Write},
    sync::OnceLock,
};

use tracing_subscriber::{EnvFilter, Registry, fmt, prelude::*, reload};

static FILTER_HANDLE: OnceLock<reload::Handle<EnvFilter, Registry>> = OnceLock::new();

/// Builds the filter from an explicit level, falling back to `RUST_LOG` and then `info`.
pub fn filter_for(level: Option<&str>) -> EnvFilter {
    match level {
        Some(level) => EnvFilter::new(level),
        None => EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
    }
}

/// Installs the global subscriber. Later calls are ignored.
pub fn init(filter: EnvFilter) {
    let (filter_layer, handle) = reload::Layer::new(filter);
    let installed = tracing_subscriber::registry()
        .with(filter_layer)
        .with(fmt::layer())
        .try_init()
        .is_ok();

    if installed {
        let _ = FILTER_HANDLE.set(handle);
    }
}

/// Flushes output and turns logging off. Safe to call repeatedly, and a no-op for
/// the filter when [`init`] never ran.
pub fn shutdown() {
    if let Some(handle) = FILTER_HANDLE.get() {
        let _ = handle.reload(EnvFilter::new("off"));
    }

    let _ = io::stdout().flush();
    let _ = io::stderr().flush();
}
