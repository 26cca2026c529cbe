// ABOUTME: Shared logging setup for all tmi-cluster binaries
// ABOUTME: init() for operator commands, init_for() for the long-running sweep

use tracing::Level;
use tracing_subscriber::EnvFilter;

/// Standard logging to stderr. Default: INFO level, RUST_LOG override.
/// Used by one-shot CLI commands.
pub fn init() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive(Level::INFO.into()))
        .with_writer(std::io::stderr)
        .init();
}

/// Crate-filtered logging to stderr. Default: INFO for the named crates,
/// WARN for everything else (sqlx is chatty at INFO).
/// Used by the supervisor sweep loop.
pub fn init_for(crate_names: &[&str]) {
    tracing_subscriber::fmt()
        .with_env_filter(crate_filter(EnvFilter::from_default_env(), crate_names))
        .with_writer(std::io::stderr)
        .init();
}

/// WARN globally, INFO for each named crate. Names that do not parse as a
/// target are skipped.
fn crate_filter(base: EnvFilter, crate_names: &[&str]) -> EnvFilter {
    let mut filter = base.add_directive(Level::WARN.into());
    for name in crate_names {
        match format!("{name}=info").parse() {
            Ok(directive) => filter = filter.add_directive(directive),
            Err(e) => eprintln!("ignoring log target {name:?}: {e}"),
        }
    }
    filter
}
