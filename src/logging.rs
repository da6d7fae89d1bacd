//! Diagnostic tracing for the command-line tools.
//!
//! Tracing output is for debugging requests and lifecycle transitions and is
//! controlled by `RUST_LOG`. It is separate from the user-facing console
//! output, which the CLI writes itself.

use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Initialize the tracing subscriber.
///
/// Reads `RUST_LOG`, defaulting to `warn`. Output goes to stderr in compact
/// format.
///
/// ```bash
/// RUST_LOG=t2server_cli=debug run-workflow -w wf.t2flow http://localhost:8080/taverna
/// ```
pub fn init() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));

    // A second init (e.g. from tests) keeps the first subscriber.
    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(std::io::stderr).compact())
        .try_init();
}
