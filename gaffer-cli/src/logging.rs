//! Tracing setup for the CLI.
//!
//! Diagnostics go to stderr so the rendered event streams own stdout. The
//! filter comes from `LOG_LEVEL` (DEBUG/INFO/WARN/ERROR), overridden to
//! debug by `--verbose`, with `RUST_LOG` respected when set explicitly.

use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

pub fn init(verbose: bool) {
    let filter = if verbose {
        EnvFilter::new("debug")
    } else if let Ok(rust_log) = std::env::var("RUST_LOG") {
        EnvFilter::new(rust_log)
    } else {
        let level = std::env::var("LOG_LEVEL").unwrap_or_else(|_| "warn".to_string());
        EnvFilter::new(level.to_ascii_lowercase())
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(std::io::stderr).compact())
        .init();
}
