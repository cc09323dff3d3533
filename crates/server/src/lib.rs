//! HTTP serving layer for the Gantry gateway: router assembly, the portal
//! API, and the serving loop with graceful shutdown.

pub mod portal;
pub mod router;
mod run;

pub use run::{serve, shutdown_signal};

use gantry_core::config::LoggingConfig;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Initializes the logging system from the configuration. `RUST_LOG`
/// overrides the configured level.
pub fn init_logging(config: &LoggingConfig) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new(format!("warn,gantry_core={0},gantry_server={0},gantry={0}", config.level))
    });

    let registry = tracing_subscriber::registry().with(filter);
    if config.format == "json" {
        registry.with(tracing_subscriber::fmt::layer().json()).init();
    } else {
        // "pretty" and anything else fall back to human-readable output.
        registry.with(tracing_subscriber::fmt::layer().with_target(false)).init();
    }
}
