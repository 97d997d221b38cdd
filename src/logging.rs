//! Tracing subscriber setup for the CLI and embedders.

use crate::core::paths::env;
use tracing_subscriber::{fmt, EnvFilter};

/// Default filter: our crate at `info` (or `debug` when verbose), everything else at `warn`.
fn default_filter(verbose: bool) -> EnvFilter {
    let level = if verbose { "debug" } else { "info" };
    EnvFilter::new(format!("warn,beesigner={}", level))
}

/// Install the global subscriber. `RUST_LOG` wins over the default filter.
/// Writes to stderr so stdout stays clean JSON for the CLI.
pub fn init_logging(verbose: bool) {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| default_filter(verbose));
    let use_json = std::env::var(env::LOG_JSON)
        .map(|value| value == "1")
        .unwrap_or(false);

    if use_json {
        let _ = fmt::Subscriber::builder()
            .with_env_filter(env_filter)
            .json()
            .with_writer(std::io::stderr)
            .try_init();
    } else {
        let _ = fmt::Subscriber::builder()
            .with_env_filter(env_filter)
            .with_target(false)
            .compact()
            .with_writer(std::io::stderr)
            .try_init();
    }
}
