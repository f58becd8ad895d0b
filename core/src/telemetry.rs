use anyhow::{anyhow, Result};
use std::sync::OnceLock;
use tracing_subscriber::EnvFilter;

static INSTALLED: OnceLock<()> = OnceLock::new();

const DEFAULT_DIRECTIVES: &str = "sooz_core=info,xtask=info,warn";

/// `RUST_LOG` when set, otherwise info for the chat core and xtask, warn elsewhere.
pub fn default_filter() -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_DIRECTIVES))
}

/// Install the global subscriber with [`default_filter`].
pub fn init_from_env() -> Result<()> {
    init_tracing(default_filter())
}

/// Install a global `fmt` subscriber on stderr. Later calls are no-ops.
pub fn init_tracing(filter: EnvFilter) -> Result<()> {
    if INSTALLED.get().is_some() {
        return Ok(());
    }

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_writer(std::io::stderr)
        .try_init()
        .map_err(|err| anyhow!("failed to install tracing subscriber: {err}"))?;
    INSTALLED.set(()).ok();

    Ok(())
}
