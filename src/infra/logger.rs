// src/infra/logger.rs - tracing subscriber for search runs

use tracing_subscriber::{fmt, EnvFilter};

/// Install the global subscriber. `RUST_LOG` wins over `level` when set.
///
/// With `verbose`, module targets and thread ids are printed so that
/// interleaved output from concurrent oracle sessions can be told apart.
pub fn init_logging(level: &str, verbose: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    let builder = fmt()
        .with_env_filter(filter)
        .with_target(verbose)
        .with_thread_ids(verbose)
        .compact();

    // A second init (e.g. from tests) is harmless.
    let _ = builder.try_init();
}
