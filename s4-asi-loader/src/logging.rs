//! Tracing and logging support.
//!
//! The loader reports through `tracing`. A subscriber is installed from the
//! worker thread once the loader lock has been released; it writes to stderr,
//! which is only visible when the host was started from a console.

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Tracing output format.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TracingFormat {
    /// Human-readable multi-line format.
    Pretty,

    /// Single-line format (default).
    Compact,

    /// JSON format.
    Json,
}

/// Tracing configuration.
#[derive(Debug, Clone)]
pub struct TracingConfig {
    /// Log level filter.
    ///
    /// If None, uses RUST_LOG environment variable or defaults to "info".
    pub level: Option<tracing::Level>,

    /// Output format.
    pub format: TracingFormat,

    /// Include target module names in output.
    pub target: bool,

    /// Include thread IDs in output. Useful to tell the worker from the host thread.
    pub thread_ids: bool,
}

impl Default for TracingConfig {
    fn default() -> Self {
        Self {
            level: None,
            format: TracingFormat::Compact,
            target: true,
            thread_ids: true,
        }
    }
}

impl TracingConfig {
    fn filter(&self) -> EnvFilter {
        match self.level {
            Some(level) => EnvFilter::new(level.to_string()),
            None => EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        }
    }
}

/// Install a global subscriber for `config`.
///
/// Returns false if another subscriber was already installed, which is not an
/// error: the host or a previous call may have set one up.
pub fn init_subscriber(config: &TracingConfig) -> bool {
    let layer = tracing_subscriber::fmt::layer()
        .with_writer(std::io::stderr)
        .with_target(config.target)
        .with_thread_ids(config.thread_ids);

    let registry = tracing_subscriber::registry().with(config.filter());

    let result = match config.format {
        TracingFormat::Pretty => registry.with(layer.pretty()).try_init(),
        TracingFormat::Compact => registry.with(layer.compact()).try_init(),
        TracingFormat::Json => registry.with(layer.json()).try_init(),
    };

    result.is_ok()
}
