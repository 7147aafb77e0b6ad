//! Structured logging setup.
//!
//! Uses `tracing` with `tracing-subscriber`. The filter comes from
//! `MYNDHYVE_LOG` (or `RUST_LOG`), falling back to a default that keeps
//! third-party crates quiet. Output goes to stderr so the daemon's
//! redirected log file captures everything.

use tracing_subscriber::EnvFilter;

const ENV_VAR: &str = "MYNDHYVE_LOG";

/// Install the global subscriber. Safe to call once from `main()`.
pub fn init(verbose: bool) {
    let default_filter = if verbose {
        "myndhyve_relay=debug,info"
    } else {
        "myndhyve_relay=info,warn"
    };

    let filter = std::env::var(ENV_VAR)
        .or_else(|_| std::env::var("RUST_LOG"))
        .unwrap_or_else(|_| default_filter.to_string());

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new(filter))
        .with_writer(std::io::stderr)
        .with_target(true)
        .init();
}
