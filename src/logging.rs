//! Development-time tracing for debugging runs.
//!
//! # Separation of Concerns
//!
//! - **Tracing (this module)**: dev diagnostics via `RUST_LOG`, output to
//!   stderr. Not persisted, not part of the evidence bundle.
//!
//! - **Evidence (`io/evidence`)**: the product output under
//!   `.flowgate/runs/`. Always written, unaffected by `RUST_LOG`.

use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Initialize the tracing subscriber for development logging.
///
/// Reads `RUST_LOG`; defaults to `warn` when unset. Output goes to
/// stderr in compact format.
///
/// # Example
/// ```bash
/// RUST_LOG=flowgate=debug flowgate run -f pipeline.yaml
/// ```
pub fn init() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(std::io::stderr).compact())
        .init();
}
