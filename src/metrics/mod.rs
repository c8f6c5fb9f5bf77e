//! Prometheus side of the pipeline: collectors, the sink that applies
//! observations to them, and the scrape endpoint.

pub mod error;
pub mod registry;
pub mod server;
pub mod sink;

pub use error::MetricsError;
pub use registry::{TrafficMetrics, FLOW_LABELS};
pub use sink::{MetricsSink, SinkStats};
