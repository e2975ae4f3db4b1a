//! Diagnostic tracing, configured through `RUST_LOG`.
//!
//! Conversations themselves live in the store; nothing here is persisted.

use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Install a compact stderr subscriber.
///
/// `RUST_LOG` wins when set; otherwise `default_directive` applies
/// (for example `prompter=info`).
///
/// ```bash
/// RUST_LOG=prompter=debug prompter-server --port 8080
/// ```
pub fn init(default_directive: &str) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_directive));

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(std::io::stderr).compact())
        .init();
}
