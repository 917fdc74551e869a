//! Tracing setup for the engine.
//!
//! The engine emits structured `tracing` events at every state transition;
//! this module wires up the subscriber. Debug output can be enabled with
//! the `--debug` flag or `FOREMAN_DEBUG=1`.

use tracing_subscriber::{fmt, EnvFilter};

/// Initialize the global tracing subscriber.
pub fn init() {
    init_with_debug(false);
}

/// Initialize the subscriber with an explicit debug setting.
///
/// Precedence: `RUST_LOG` if set, otherwise `FOREMAN_DEBUG`/`debug` pick
/// between the `debug` and `info` levels for this crate.
pub fn init_with_debug(debug: bool) {
    let env_debug = std::env::var("FOREMAN_DEBUG")
        .map(|v| v == "1" || v.to_lowercase() == "true")
        .unwrap_or(false);

    let default_directive = if debug || env_debug {
        "foreman=debug"
    } else {
        "foreman=info"
    };

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_directive));

    // try_init so tests that race to install a subscriber don't panic
    let _ = fmt()
        .with_env_filter(filter)
        .with_target(false)
        .try_init();
}
