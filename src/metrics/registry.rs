//! Prometheus collectors for traffic flows and reassembled streams.
//!
//! Every collector lives in the [`Registry`] owned by [`TrafficMetrics`]. The
//! instance is built once at startup and shared as `Arc<TrafficMetrics>`
//! between the sink that writes and the scrape server that reads.

use prometheus::{
    Histogram, HistogramOpts, IntCounter, IntCounterVec, Opts, Registry, TextEncoder,
};

use crate::metrics::error::MetricsError;

/// Label names of the per-flow series, in label-value order.
pub const FLOW_LABELS: [&str; 6] = [
    "network_layer",
    "transport_layer",
    "source",
    "source_port",
    "destination",
    "destination_port",
];

pub struct TrafficMetrics {
    registry: Registry,

    /// Bytes per flow, partitioned by IP version, protocol and endpoints.
    pub traffic_bytes: IntCounterVec,
    /// Packets per flow, same labels as `traffic_bytes`.
    pub traffic_packets: IntCounterVec,
    /// Retractions that found no series to remove.
    pub retractions_unmatched: IntCounter,

    pub streams_completed: IntCounterVec,
    pub stream_bytes: IntCounter,
    pub stream_packets: IntCounter,
    pub stream_out_of_order: IntCounter,
    pub stream_skipped_bytes: IntCounter,
    pub stream_duration: Histogram,
    pub stream_throughput: Histogram,
}

impl TrafficMetrics {
    pub fn new() -> Result<Self, MetricsError> {
        let registry = Registry::new();

        let traffic_bytes = IntCounterVec::new(
            Opts::new(
                "network_traffic_bytes_total",
                "Network traffic in bytes, partitioned by IP4/6, protocol (TCP/UDP), and source/destination",
            ),
            &FLOW_LABELS,
        )?;
        let traffic_packets = IntCounterVec::new(
            Opts::new(
                "network_traffic_packets_total",
                "Network traffic in packets, partitioned by IP4/6, protocol (TCP/UDP), and source/destination",
            ),
            &FLOW_LABELS,
        )?;
        let retractions_unmatched = IntCounter::with_opts(Opts::new(
            "traffic_retractions_unmatched_total",
            "Flow retractions for which no series existed",
        ))?;

        let streams_completed = IntCounterVec::new(
            Opts::new("tcp_streams_completed_total", "Reassembled TCP streams by completion reason"),
            &["reason"],
        )?;
        let stream_bytes = IntCounter::with_opts(Opts::new(
            "tcp_stream_bytes_total",
            "Payload bytes delivered in order by reassembled TCP streams",
        ))?;
        let stream_packets = IntCounter::with_opts(Opts::new(
            "tcp_stream_packets_total",
            "Data-bearing segments delivered by reassembled TCP streams",
        ))?;
        let stream_out_of_order = IntCounter::with_opts(Opts::new(
            "tcp_stream_out_of_order_total",
            "Segments delivered after a later-captured segment of the same stream",
        ))?;
        let stream_skipped_bytes = IntCounter::with_opts(Opts::new(
            "tcp_stream_skipped_bytes_total",
            "Bytes never captured and skipped over during reassembly",
        ))?;
        let stream_duration = Histogram::with_opts(
            HistogramOpts::new("tcp_stream_duration_seconds", "Time between first and last data of a TCP stream")
                .buckets(vec![0.001, 0.01, 0.1, 0.5, 1.0, 5.0, 30.0, 120.0, 600.0, 3600.0]),
        )?;
        let stream_throughput = Histogram::with_opts(
            HistogramOpts::new(
                "tcp_stream_throughput_bytes_per_second",
                "Average throughput of TCP streams with a measurable duration",
            )
            .buckets(prometheus::exponential_buckets(1024.0, 4.0, 10)?),
        )?;

        registry.register(Box::new(traffic_bytes.clone()))?;
        registry.register(Box::new(traffic_packets.clone()))?;
        registry.register(Box::new(retractions_unmatched.clone()))?;
        registry.register(Box::new(streams_completed.clone()))?;
        registry.register(Box::new(stream_bytes.clone()))?;
        registry.register(Box::new(stream_packets.clone()))?;
        registry.register(Box::new(stream_out_of_order.clone()))?;
        registry.register(Box::new(stream_skipped_bytes.clone()))?;
        registry.register(Box::new(stream_duration.clone()))?;
        registry.register(Box::new(stream_throughput.clone()))?;

        Ok(Self {
            registry,
            traffic_bytes,
            traffic_packets,
            retractions_unmatched,
            streams_completed,
            stream_bytes,
            stream_packets,
            stream_out_of_order,
            stream_skipped_bytes,
            stream_duration,
            stream_throughput,
        })
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Encodes every registered collector in the Prometheus text format.
    pub fn gather_text(&self) -> Result<String, MetricsError> {
        let encoder = TextEncoder::new();
        Ok(encoder.encode_to_string(&self.registry.gather())?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_instances_are_independent() {
        let first = TrafficMetrics::new().unwrap();
        let second = TrafficMetrics::new().unwrap();

        first.stream_bytes.inc_by(10);
        assert_eq!(first.stream_bytes.get(), 10);
        assert_eq!(second.stream_bytes.get(), 0);
    }

    #[test]
    fn test_text_encoding_contains_series() {
        let metrics = TrafficMetrics::new().unwrap();
        metrics
            .traffic_bytes
            .with_label_values(&["ip4", "tcp", "10.0.0.1", "1234", "10.0.0.2", "80"])
            .inc_by(60);

        let text = metrics.gather_text().unwrap();
        assert!(text.contains("# TYPE network_traffic_bytes_total counter"));
        assert!(text.contains(
            "network_traffic_bytes_total{destination=\"10.0.0.2\",destination_port=\"80\",network_layer=\"ip4\",source=\"10.0.0.1\",source_port=\"1234\",transport_layer=\"tcp\"} 60"
        ));
    }
}
