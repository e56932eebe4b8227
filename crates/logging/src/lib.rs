//! Shared `tracing` subscriber setup for binaries and tests

use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Filter used when `RUST_LOG` is unset
pub fn default_filter(verbose: bool) -> &'static str {
    if verbose {
        "info,meshtun=debug"
    } else {
        "info"
    }
}

/// Install the global subscriber. `RUST_LOG` overrides the default filter.
///
/// Calling this again after a subscriber is installed does nothing.
pub fn init_logging(verbose: bool) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_filter(verbose)));

    if tracing_subscriber::registry()
        .with(fmt::layer())
        .with(filter)
        .try_init()
        .is_ok()
    {
        tracing::debug!("Logging initialised (verbose: {})", verbose);
    }
}
