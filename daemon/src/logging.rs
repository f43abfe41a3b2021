//! Log setup with a runtime-reloadable level, driven by the
//! `set debug-log` command in both namespaces.

use anyhow::{Context as _, Result};
use std::sync::OnceLock;
use tracing_subscriber::layer::SubscriberExt as _;
use tracing_subscriber::util::SubscriberInitExt as _;
use tracing_subscriber::{EnvFilter, Registry, reload};

static RELOAD_HANDLE: OnceLock<reload::Handle<EnvFilter, Registry>> = OnceLock::new();

fn filter_for(debug: bool) -> EnvFilter {
    let default = if debug { "debug" } else { "info" };

    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default))
}

pub fn init(debug: bool) -> Result<()> {
    let (filter, handle) = reload::Layer::new(filter_for(debug));

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .try_init()
        .context("Failed to install tracing subscriber")?;

    let _ = RELOAD_HANDLE.set(handle);

    Ok(())
}

/// Re-aims the level filter. The handle is process-local, so the command
/// path invokes this on both sides of the namespace boundary.
pub fn set_debug(debug: bool) {
    let Some(handle) = RELOAD_HANDLE.get() else {
        return;
    };

    if let Err(error) = handle.reload(filter_for(debug)) {
        tracing::warn!("Failed to reload log filter: {error}");
    }
}
