//! Logging initialization and standard spans.
//!
//! Build, query and lifecycle work each run inside a span created here so
//! every log line carries the artifact and the identity it runs for.

use std::sync::Once;
use tracing::Span;
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

static INIT: Once = Once::new();

/// Log output format.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum LogFormat {
    /// JSON structured logs (for production).
    Json,
    /// Pretty-printed logs (for development).
    #[default]
    Pretty,
}

impl LogFormat {
    /// Parses `json` or `pretty` (case-insensitive).
    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value.to_ascii_lowercase().as_str() {
            "json" => Some(Self::Json),
            "pretty" => Some(Self::Pretty),
            _ => None,
        }
    }
}

/// Initializes the logging subsystem.
///
/// Safe to call multiple times; subsequent calls are no-ops. Levels come from
/// `RUST_LOG` (e.g. `info`, `vista_build=debug`), defaulting to `info`.
///
/// ```rust
/// use vista_core::observability::{init_logging, LogFormat};
///
/// init_logging(LogFormat::Pretty);
/// ```
pub fn init_logging(format: LogFormat) {
    INIT.call_once(|| {
        let env_filter =
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

        let registry = tracing_subscriber::registry().with(env_filter);
        let result = match format {
            LogFormat::Json => registry.with(fmt::layer().json()).try_init(),
            LogFormat::Pretty => registry.with(fmt::layer().pretty()).try_init(),
        };
        // Another subscriber (e.g. a test harness) may already be installed.
        let _ = result;
    });
}

/// Span for one build of an artifact.
#[must_use]
pub fn build_span(artifact: &str, consumer: &str, build_id: &str) -> Span {
    tracing::info_span!(
        "build",
        artifact = artifact,
        consumer = consumer,
        build_id = build_id,
        partitions = tracing::field::Empty,
    )
}

/// Span for one read against a generation.
#[must_use]
pub fn query_span(artifact: &str, generation: u64) -> Span {
    tracing::info_span!(
        "query",
        artifact = artifact,
        generation = generation,
        blocks = tracing::field::Empty,
    )
}

/// Span for lifecycle operations (resolve, register, serve).
#[must_use]
pub fn lifecycle_span(operation: &str, consumer: &str, requestor: &str) -> Span {
    tracing::info_span!(
        "lifecycle",
        op = operation,
        consumer = consumer,
        requestor = requestor,
        artifact = tracing::field::Empty,
    )
}
