/*!
 * Structured Tracing
 * Subscriber setup plus a timed span for supervisor operations
 */

use std::time::Instant;
use tracing::{debug, info, span, warn, Level, Span};
use tracing_subscriber::{
    fmt::format::FmtSpan, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter,
};
use uuid::Uuid;

/// Operations slower than this are logged at warn
const SLOW_OPERATION_MS: u128 = 1000;

/// Install the global tracing subscriber
///
/// Environment variables:
/// - RUST_LOG: log filter (default: info)
/// - ORCHESTRATOR_TRACE_JSON: JSON output when `1` or `true`
///
/// Safe to call more than once; later calls are no-ops.
pub fn init_tracing() {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    let use_json = std::env::var("ORCHESTRATOR_TRACE_JSON")
        .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
        .unwrap_or(false);

    let registry = tracing_subscriber::registry().with(env_filter);

    let installed = if use_json {
        registry
            .with(
                tracing_subscriber::fmt::layer()
                    .json()
                    .with_target(true)
                    .with_thread_names(true)
                    .with_current_span(true)
                    .with_span_list(true)
                    .with_span_events(FmtSpan::CLOSE),
            )
            .try_init()
            .is_ok()
    } else {
        registry
            .with(
                tracing_subscriber::fmt::layer()
                    .with_target(true)
                    .with_line_number(true)
                    .compact(),
            )
            .try_init()
            .is_ok()
    };

    if installed {
        info!(json = use_json, "Tracing initialized");
    }
}

/// Generate a unique trace ID for correlating one operation's log lines
pub fn generate_trace_id() -> String {
    Uuid::new_v4().to_string()
}

/// Span around one supervisor operation (create, stop, shutdown_all, ...)
///
/// Logs the duration on drop; slow operations are reported at warn.
pub struct OperationSpan {
    span: Span,
    start: Instant,
    operation: &'static str,
    trace_id: String,
}

impl OperationSpan {
    pub fn new(operation: &'static str, process_id: &str) -> Self {
        let trace_id = generate_trace_id();
        let span = span!(
            Level::INFO,
            "operation",
            trace_id = %trace_id,
            operation,
            process_id = %process_id,
            success = tracing::field::Empty,
        );
        Self {
            span,
            start: Instant::now(),
            operation,
            trace_id,
        }
    }

    pub fn trace_id(&self) -> &str {
        &self.trace_id
    }

    pub fn span(&self) -> &Span {
        &self.span
    }

    pub fn record_result(&self, success: bool) {
        self.span.record("success", success);
    }
}

impl Drop for OperationSpan {
    fn drop(&mut self) {
        let elapsed = self.start.elapsed();
        let _entered = self.span.enter();
        if elapsed.as_millis() > SLOW_OPERATION_MS {
            warn!(
                operation = self.operation,
                duration_ms = elapsed.as_millis() as u64,
                slow = true,
                "Slow operation"
            );
        } else {
            debug!(
                operation = self.operation,
                duration_us = elapsed.as_micros() as u64,
                "Operation completed"
            );
        }
    }
}

/// Create an operation span
pub fn span_operation(operation: &'static str, process_id: &str) -> OperationSpan {
    OperationSpan::new(operation, process_id)
}
