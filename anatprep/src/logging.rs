//! Diagnostic tracing for anatprep commands.
//!
//! # Separation of Concerns
//!
//! - **Tracing (this module)**: progress and diagnostics via `RUST_LOG`,
//!   output to stderr.
//!
//! - **Tool logs (`io/process`)**: combined stdout/stderr of every delegated
//!   tool, written under `derivatives/anatprep/sub-*/ses-*/logs/`. Always
//!   written, unaffected by `RUST_LOG`.

use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Initialize the tracing subscriber.
///
/// `RUST_LOG` wins when set. Otherwise the level is `info`, or `debug` with
/// `--verbose`. Output: stderr, compact format.
///
/// # Example
/// ```bash
/// RUST_LOG=anatprep=debug anatprep mask --subject 01
/// ```
pub fn init(verbose: bool) {
    let default_level = if verbose { "debug" } else { "info" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    tracing_subscriber::registry()
        .with(filter)
        .with(
            fmt::layer()
                .with_writer(std::io::stderr)
                .with_target(false)
                .compact(),
        )
        .init();
}
