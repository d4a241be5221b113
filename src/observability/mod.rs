//! Logging initialization.
//!
//! Structured logs go to stderr via `tracing`; the terminal summary the
//! operator reads stays on stdout. `RUST_LOG` overrides the verbosity flags
//! when set.

use tracing_subscriber::EnvFilter;

/// Verbosity selected on the command line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verbosity {
    /// No log output at all.
    Silent,
    /// Warnings and errors only (default).
    Normal,
    /// Progress at info level.
    Verbose,
    /// Everything, including per-batch detail.
    Debug,
}

impl Verbosity {
    /// Returns the filter directive for this verbosity.
    #[must_use]
    pub const fn directive(self) -> &'static str {
        match self {
            Self::Silent => "off",
            Self::Normal => "warn",
            Self::Verbose => "s3gc=info",
            Self::Debug => "s3gc=trace,debug",
        }
    }
}

/// Initializes the global tracing subscriber.
///
/// Safe to call once per process; later calls are ignored so tests that
/// race on initialization do not panic.
pub fn init_logging(verbosity: Verbosity) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(verbosity.directive()));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(true)
        .try_init();
}
