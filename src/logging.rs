//! tracing subscriber setup for the CLI.

use tracing_subscriber::EnvFilter;

const DEFAULT_FILTER: &str = "info";

/// Install a stderr fmt subscriber. `RUST_LOG` overrides the default `info`
/// level; `verbose` raises the default to `debug`. Calling this twice is a
/// no-op.
pub fn init(verbose: bool) {
    let default = if verbose { "debug" } else { DEFAULT_FILTER };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));

    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_level(true)
        .with_writer(std::io::stderr)
        .try_init();
}
