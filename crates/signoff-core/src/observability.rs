//! Observability infrastructure for signoff.
//!
//! Structured logging with consistent spans. This module provides
//! initialization helpers and span constructors used across all
//! signoff components.

use std::sync::Once;
use tracing::Span;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

static INIT: Once = Once::new();

/// Log output format.
#[derive(Debug, Clone, Copy, Default)]
pub enum LogFormat {
    /// JSON structured logs (for production).
    Json,
    /// Pretty-printed logs (for development).
    #[default]
    Pretty,
}

/// Initializes the logging subsystem.
///
/// Call once at application startup. Safe to call multiple times;
/// subsequent calls are no-ops.
///
/// # Environment Variables
///
/// - `RUST_LOG`: Controls log levels (e.g., `info`, `signoff_flow=debug`)
///
/// # Example
///
/// ```rust
/// use signoff_core::observability::{init_logging, LogFormat};
///
/// init_logging(LogFormat::Pretty);
/// ```
pub fn init_logging(format: LogFormat) {
    INIT.call_once(|| {
        let env_filter =
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

        match format {
            LogFormat::Json => {
                tracing_subscriber::registry()
                    .with(env_filter)
                    .with(fmt::layer().json())
                    .init();
            }
            LogFormat::Pretty => {
                tracing_subscriber::registry()
                    .with(env_filter)
                    .with(fmt::layer().pretty())
                    .init();
            }
        }
    });
}

/// Creates a span for workflow operations with standard fields.
///
/// # Example
///
/// ```rust
/// use signoff_core::observability::workflow_span;
///
/// let span = workflow_span("transition", "01HQXYZ123");
/// let _guard = span.enter();
/// // ... do workflow operation
/// ```
#[must_use]
pub fn workflow_span(operation: &str, workflow_id: &str) -> Span {
    tracing::info_span!(
        "workflow",
        op = operation,
        workflow_id = workflow_id,
    )
}

/// Creates a span for approval operations.
#[must_use]
pub fn approval_span(operation: &str, approval_id: &str, workflow_id: &str) -> Span {
    tracing::info_span!(
        "approval",
        op = operation,
        approval_id = approval_id,
        workflow_id = workflow_id,
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn init_logging_is_idempotent() {
        // Should not panic (uses Once internally)
        init_logging(LogFormat::Pretty);
        init_logging(LogFormat::Pretty); // Second call should be no-op
    }

    #[test]
    fn span_helpers_create_spans() {
        let span = workflow_span("transition", "wf_123");
        let _guard = span.enter();
        tracing::info!("test message in span");

        let span = approval_span("submit", "ap_123", "wf_123");
        let _guard = span.enter();
        tracing::info!("approval message");
    }
}
