//! fallbranch/src/logging.rs
//! Logging initialization and runtime level updates.

use std::sync::Once;

use tracing_subscriber::filter::EnvFilter;
use tracing_subscriber::prelude::*;
use tracing_subscriber::{fmt, reload};

static LOG_INIT: Once = Once::new();

pub type ReloadHandle = reload::Handle<EnvFilter, tracing_subscriber::Registry>;

/// Installs the global subscriber once and returns a handle that can change
/// the filter at runtime (e.g. in response to a config reload). Calling this
/// more than once is a no-op after the first call; the handle from the first
/// call is the only one that's live.
pub fn init_logging(default: &str) -> ReloadHandle {
    let filter = EnvFilter::try_new(default).unwrap_or_else(|_| EnvFilter::new("info"));
    let (reload_layer, handle) = reload::Layer::new(filter);

    LOG_INIT.call_once(|| {
        let subscriber = tracing_subscriber::registry()
            .with(reload_layer)
            .with(fmt::layer());
        let _ = tracing::subscriber::set_global_default(subscriber);
    });

    handle
}

pub fn set_level(handle: &ReloadHandle, directive: &str) -> Result<(), String> {
    let filter = EnvFilter::try_new(directive).map_err(|e| e.to_string())?;
    handle.reload(filter).map_err(|e| e.to_string())
}
