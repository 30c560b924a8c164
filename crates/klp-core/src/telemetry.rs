//! Tracing setup for the klp-build binary.
//!
//! [`init_tracing`] installs the global subscriber once; later calls are
//! ignored because the global subscriber can only be set once per process.

use tracing::Level;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter};

/// HTTP stack crates only report warnings; their per-request INFO lines
/// would drown the batch progress output.
const QUIET_TARGETS: &[&str] = &["reqwest=warn", "hyper=warn", "hyper_util=warn", "rustls=warn"];

/// Build the filter used when `RUST_LOG` is not set.
fn default_filter(level: Level) -> EnvFilter {
    QUIET_TARGETS
        .iter()
        .filter_map(|d| d.parse().ok())
        .fold(EnvFilter::new(level.as_str()), |filter, directive| {
            filter.add_directive(directive)
        })
}

/// Initialise the global tracing subscriber.
///
/// * `json` emits newline-delimited JSON log lines.
/// * `level` is the verbosity used when `RUST_LOG` is not set.
pub fn init_tracing(json: bool, level: Level) {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| default_filter(level));

    if json {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(fmt::layer().with_target(false).json())
            .try_init()
            .ok();
    } else {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(fmt::layer().with_target(false).without_time())
            .try_init()
            .ok();
    }
}
