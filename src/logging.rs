//! Tracing subscriber setup.
//!
//! `RUST_LOG` takes precedence; otherwise `MINIVLLM_LOG` or the level passed
//! in is used as the filter.

use std::sync::OnceLock;

use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

static TRACING_INITIALIZED: OnceLock<()> = OnceLock::new();

/// Fallback log filter when no environment variable is set.
pub const DEFAULT_LOG_FILTER: &str = "info";

/// Environment variable for a crate-specific log filter.
const LOG_FILTER_ENV: &str = "MINIVLLM_LOG";

fn env_filter(default_filter: &str) -> EnvFilter {
    EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_from_env(LOG_FILTER_ENV))
        .unwrap_or_else(|_| EnvFilter::new(default_filter))
}

/// Install the global fmt subscriber.
///
/// Safe to call more than once; only the first call has any effect, and a
/// subscriber installed elsewhere is left in place.
pub fn init_tracing(default_filter: &str) {
    TRACING_INITIALIZED.get_or_init(|| {
        let _ = tracing_subscriber::registry()
            .with(env_filter(default_filter))
            .with(fmt::layer().with_target(true))
            .try_init();
    });
}

/// Whether [`init_tracing`] has run.
pub fn is_initialized() -> bool {
    TRACING_INITIALIZED.get().is_some()
}
