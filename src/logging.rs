//! Logging and tracing infrastructure.
//!
//! The parser emits `debug!`/`warn!` events through the tracing crate;
//! nothing is printed unless a subscriber is installed. Hosts that do not
//! bring their own subscriber can install the global one from here, in
//! plain-text or JSON form.

use std::sync::Once;
use tracing_subscriber::EnvFilter;

static INIT: Once = Once::new();

/// Install the global plain-text subscriber, filtered by `RUST_LOG`
/// (default `info`).
///
/// Only the first install in a process takes effect; later calls to either
/// variant are ignored.
pub fn init_tracing() {
    install(false);
}

/// Install the global subscriber with JSON output for structured logging.
pub fn init_tracing_json() {
    install(true);
}

fn install(json: bool) {
    INIT.call_once(|| {
        let filter =
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
        let builder = tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(true)
            .with_file(true)
            .with_line_number(true);
        // A host may already have set its own subscriber; that one wins.
        if json {
            let _ = builder.json().try_init();
        } else {
            let _ = builder.try_init();
        }
    });
}
