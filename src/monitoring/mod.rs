/*!
 * Monitoring
 * Tracing setup, metrics and OS-level process monitoring
 */

mod metrics;
mod monitor;
mod tracer;

pub use metrics::{HistogramStats, MetricsCollector, MetricsSnapshot, Timer};
pub use monitor::{
    evaluate_thresholds, Alert, AlertCallback, AlertKind, AlertSeverity, AlertThresholds, Liveness,
    ProcessMetrics, ProcessMonitor, ReportedMetrics,
};
pub use tracer::{generate_trace_id, init_tracing, span_operation, OperationSpan};
