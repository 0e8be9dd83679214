//! Tracing setup for binaries embedding the store
//!
//! The library only emits events; installing a subscriber is the binary's job.

/// Install a compact stderr subscriber. `RUST_LOG` overrides `level`.
///
/// Safe to call more than once; later calls leave the first subscriber in place.
pub fn init_subscriber(level: &str) {
    use tracing_subscriber::EnvFilter;

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .compact();

    let _ = subscriber.try_init();
}

/// Map the CLI's `-v` count to a filter level
pub fn level_for_verbosity(verbose: u8) -> &'static str {
    match verbose {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    }
}
