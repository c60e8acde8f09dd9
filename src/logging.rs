//! # Structured Logging Module
//!
//! Environment-aware console logging using the tracing ecosystem. Output goes
//! to stdout: JSON lines in production (for log shipping from the cluster),
//! human-readable lines everywhere else.

use std::io::IsTerminal;
use std::sync::OnceLock;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

static LOGGER_INITIALIZED: OnceLock<()> = OnceLock::new();

/// Initialize structured logging once per process
pub fn init_structured_logging(production: bool) {
    LOGGER_INITIALIZED.get_or_init(|| {
        let log_level = get_log_level();

        let layer = if production {
            fmt::layer()
                .json()
                .with_current_span(false)
                .with_target(true)
                .with_filter(EnvFilter::new(&log_level))
                .boxed()
        } else {
            fmt::layer()
                .with_target(true)
                .with_level(true)
                .with_ansi(std::io::stdout().is_terminal())
                .with_filter(EnvFilter::new(&log_level))
                .boxed()
        };

        // A subscriber may already be installed (tests, embedding binaries)
        if tracing_subscriber::registry().with(layer).try_init().is_err() {
            tracing::debug!("Global tracing subscriber already initialized - continuing with existing subscriber");
        }

        tracing::info!(
            pid = std::process::id(),
            production = production,
            log_level = %log_level,
            "Structured logging initialized"
        );
    });
}

/// `RUST_LOG` wins over `LOG_LEVEL`; `info` otherwise
fn get_log_level() -> String {
    std::env::var("RUST_LOG")
        .or_else(|_| std::env::var("LOG_LEVEL"))
        .unwrap_or_else(|_| "info".to_string())
}
