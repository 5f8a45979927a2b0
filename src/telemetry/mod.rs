//! Telemetry: structured logging, spans and metrics.
//!
//! The library only emits through the `tracing` and `metrics` facades and
//! mirrors counters into an in-process [`MetricsStore`]; installing a
//! subscriber or exporter is left to the binary.

mod logging;
mod metrics;
mod spans;
mod store;

pub use logging::{init_logging, LogConfig, LogError, LogFormat};
pub use metrics::{
    global_store, record_activation, record_deploy, record_download, record_execution, record_plan,
    record_request, set_deployed_models,
};
pub use spans::{DeploySpan, SpanExt};
pub use store::{HistogramSummary, MetricsSnapshot, MetricsStore};
