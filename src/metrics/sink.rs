use log::{debug, info, warn};
use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::Arc;
use tokio::sync::mpsc::UnboundedReceiver;

use crate::dns::HostnameResolver;
use crate::metrics::registry::TrafficMetrics;
use crate::pipeline::Observation;
use crate::reassembly::StreamSummary;
use crate::traffic::{FlowKey, Traffic};

type FlowLabels = [String; 6];

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SinkStats {
    pub added: u64,
    pub removed: u64,
    pub unmatched_removals: u64,
    pub streams: u64,
}

/// Single consumer of the observation channel.
///
/// The label values of every live series are remembered by flow key, so a
/// retraction removes exactly the series its additions created even when
/// reverse DNS would now resolve the addresses differently. With DNS on,
/// distinct flows can share one label set; the series is removed only when
/// the last of them is retracted.
pub struct MetricsSink {
    metrics: Arc<TrafficMetrics>,
    series: HashMap<FlowKey, FlowLabels>,
    owners: HashMap<FlowLabels, usize>,
    resolver: Option<HostnameResolver>,
    stats: SinkStats,
}

impl MetricsSink {
    pub fn new(metrics: Arc<TrafficMetrics>) -> Self {
        Self {
            metrics,
            series: HashMap::new(),
            owners: HashMap::new(),
            resolver: None,
            stats: SinkStats::default(),
        }
    }

    pub fn with_resolver(mut self, resolver: HostnameResolver) -> Self {
        self.resolver = Some(resolver);
        self
    }

    pub fn live_series(&self) -> usize {
        self.series.len()
    }

    pub fn stats(&self) -> SinkStats {
        self.stats
    }

    async fn host(&self, ip: IpAddr) -> String {
        match self.resolver.as_ref() {
            Some(resolver) => resolver.resolve(ip).await,
            None => ip.to_string(),
        }
    }

    async fn labels_for(&self, flow: &FlowKey) -> FlowLabels {
        [
            flow.ip_version.as_str().to_string(),
            flow.transport.as_str().to_string(),
            self.host(flow.source.ip()).await,
            flow.source.port().to_string(),
            self.host(flow.destination.ip()).await,
            flow.destination.port().to_string(),
        ]
    }

    pub async fn apply(&mut self, observation: Observation) {
        match observation {
            Observation::Traffic(traffic) if traffic.is_retraction() => self.remove(&traffic),
            Observation::Traffic(traffic) => self.add(traffic).await,
            Observation::Stream(summary) => self.record_stream(&summary),
        }
    }

    async fn add(&mut self, traffic: Traffic) {
        if !self.series.contains_key(&traffic.flow) {
            let labels = self.labels_for(&traffic.flow).await;
            *self.owners.entry(labels.clone()).or_default() += 1;
            self.series.insert(traffic.flow, labels);
        }
        let Some(labels) = self.series.get(&traffic.flow) else {
            return;
        };
        let values = label_refs(labels);
        self.metrics.traffic_bytes.with_label_values(&values).inc_by(traffic.length);
        self.metrics.traffic_packets.with_label_values(&values).inc();
        self.stats.added += 1;
    }

    fn remove(&mut self, traffic: &Traffic) {
        let Some(labels) = self.series.remove(&traffic.flow) else {
            warn!("Failed to remove metric for {}: no such series", traffic.flow);
            self.metrics.retractions_unmatched.inc();
            self.stats.unmatched_removals += 1;
            return;
        };

        let remaining = self
            .owners
            .get_mut(&labels)
            .map(|count| {
                *count = count.saturating_sub(1);
                *count
            })
            .unwrap_or(0);
        if remaining == 0 {
            self.owners.remove(&labels);
        } else {
            debug!("Series for {} still shared by {} flows", traffic.flow, remaining);
            self.stats.removed += 1;
            return;
        }

        let values = label_refs(&labels);
        if let Err(e) = self.metrics.traffic_bytes.remove_label_values(&values) {
            warn!("Failed to remove metric for {}: {}", traffic.flow, e);
            self.metrics.retractions_unmatched.inc();
            self.stats.unmatched_removals += 1;
            return;
        }
        if let Err(e) = self.metrics.traffic_packets.remove_label_values(&values) {
            warn!("Failed to remove packet metric for {}: {}", traffic.flow, e);
        }
        debug!("Removed series for {}", traffic.flow);
        self.stats.removed += 1;
    }

    fn record_stream(&mut self, summary: &StreamSummary) {
        let metrics = &self.metrics;
        metrics.streams_completed.with_label_values(&[summary.reason.as_str()]).inc();
        metrics.stream_bytes.inc_by(summary.bytes);
        metrics.stream_packets.inc_by(summary.packets);
        metrics.stream_out_of_order.inc_by(summary.out_of_order);
        metrics.stream_skipped_bytes.inc_by(summary.skipped);
        metrics.stream_duration.observe(summary.elapsed.as_secs_f64());
        if let Some(rate) = summary.bytes_per_second() {
            metrics.stream_throughput.observe(rate);
        }
        self.stats.streams += 1;

        match serde_json::to_string(summary) {
            Ok(json) => info!("{}", json),
            Err(_) => info!("{}", summary),
        }
    }

    /// Applies observations until every sender is dropped.
    pub async fn run(mut self, mut observations: UnboundedReceiver<Observation>) -> SinkStats {
        while let Some(observation) = observations.recv().await {
            self.apply(observation).await;
        }
        if !self.series.is_empty() {
            warn!("Metrics channel closed with {} series still live", self.series.len());
        }
        debug!("Metrics sink stopped: {:?}", self.stats);
        self.stats
    }
}

fn label_refs(labels: &FlowLabels) -> [&str; 6] {
    [
        labels[0].as_str(),
        labels[1].as_str(),
        labels[2].as_str(),
        labels[3].as_str(),
        labels[4].as_str(),
        labels[5].as_str(),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DnsConfig;
    use crate::reassembly::{CompletionReason, StreamId};
    use crate::traffic::Transport;
    use std::time::{Duration, SystemTime};
    use tokio::sync::mpsc::unbounded_channel;

    const LABELS: [&str; 6] = ["ip4", "tcp", "10.0.0.1", "1234", "10.0.0.2", "80"];

    fn flow() -> FlowKey {
        FlowKey::new(
            Transport::Tcp,
            "10.0.0.1:1234".parse().unwrap(),
            "10.0.0.2:80".parse().unwrap(),
        )
    }

    fn sink() -> (MetricsSink, Arc<TrafficMetrics>) {
        let metrics = Arc::new(TrafficMetrics::new().unwrap());
        (MetricsSink::new(metrics.clone()), metrics)
    }

    #[tokio::test]
    async fn test_counter_is_running_sum() {
        let (mut sink, metrics) = sink();
        let mut expected = 0;
        for (i, length) in [60, 1514, 40, 1, 9000].into_iter().enumerate() {
            sink.apply(Observation::Traffic(Traffic::observed(flow(), length))).await;
            expected += length;
            assert_eq!(metrics.traffic_bytes.with_label_values(&LABELS).get(), expected);
            assert_eq!(metrics.traffic_packets.with_label_values(&LABELS).get(), i as u64 + 1);
        }
        assert_eq!(sink.live_series(), 1);
    }

    #[tokio::test]
    async fn test_flows_sharing_resolved_labels_keep_series_until_last_retraction() {
        let resolver = HostnameResolver::new(&DnsConfig {
            resolve: true,
            ..DnsConfig::default()
        });
        resolver.remember("10.0.0.1".parse().unwrap(), "client.example").await;
        resolver.remember("10.0.0.3".parse().unwrap(), "client.example").await;
        resolver.remember("10.0.0.2".parse().unwrap(), "server.example").await;
        let metrics = Arc::new(TrafficMetrics::new().unwrap());
        let mut sink = MetricsSink::new(metrics.clone()).with_resolver(resolver);

        let other = FlowKey::new(
            Transport::Tcp,
            "10.0.0.3:1234".parse().unwrap(),
            "10.0.0.2:80".parse().unwrap(),
        );
        let shared = ["ip4", "tcp", "client.example", "1234", "server.example", "80"];
        sink.apply(Observation::Traffic(Traffic::observed(flow(), 10))).await;
        sink.apply(Observation::Traffic(Traffic::observed(other, 5))).await;
        assert_eq!(metrics.traffic_bytes.with_label_values(&shared).get(), 15);

        sink.apply(Observation::Traffic(Traffic::retraction(flow()))).await;
        assert!(metrics.gather_text().unwrap().contains("client.example"));

        sink.apply(Observation::Traffic(Traffic::retraction(other))).await;
        assert!(!metrics.gather_text().unwrap().contains("client.example"));
        assert_eq!(sink.stats().removed, 2);
        assert_eq!(sink.stats().unmatched_removals, 0);
        assert_eq!(metrics.retractions_unmatched.get(), 0);
    }

    #[tokio::test]
    async fn test_removal_is_idempotent() {
        let (mut sink, metrics) = sink();
        sink.apply(Observation::Traffic(Traffic::observed(flow(), 100))).await;
        sink.apply(Observation::Traffic(Traffic::retraction(flow()))).await;
        sink.apply(Observation::Traffic(Traffic::retraction(flow()))).await;

        assert_eq!(sink.live_series(), 0);
        assert_eq!(sink.stats().removed, 1);
        assert_eq!(sink.stats().unmatched_removals, 1);
        assert_eq!(metrics.retractions_unmatched.get(), 1);
        assert!(!metrics.gather_text().unwrap().contains("network_traffic_bytes_total{"));
    }

    #[tokio::test]
    async fn test_series_restarts_after_retraction() {
        let (mut sink, metrics) = sink();
        sink.apply(Observation::Traffic(Traffic::observed(flow(), 100))).await;
        sink.apply(Observation::Traffic(Traffic::retraction(flow()))).await;
        sink.apply(Observation::Traffic(Traffic::observed(flow(), 7))).await;

        assert_eq!(metrics.traffic_bytes.with_label_values(&LABELS).get(), 7);
    }

    #[tokio::test]
    async fn test_stream_summary_metrics() {
        let (mut sink, metrics) = sink();
        let start = SystemTime::UNIX_EPOCH + Duration::from_secs(1_700_000_000);
        let summary = StreamSummary {
            id: StreamId::new("10.0.0.1:5000".parse().unwrap(), "10.0.0.2:443".parse().unwrap()),
            bytes: 4096,
            packets: 4,
            out_of_order: 1,
            skipped: 100,
            start,
            end: start + Duration::from_secs(2),
            elapsed: Duration::from_secs(2),
            saw_start: true,
            saw_end: true,
            reason: CompletionReason::Closed,
        };
        sink.apply(Observation::Stream(summary)).await;

        assert_eq!(metrics.streams_completed.with_label_values(&["closed"]).get(), 1);
        assert_eq!(metrics.stream_bytes.get(), 4096);
        assert_eq!(metrics.stream_out_of_order.get(), 1);
        assert_eq!(metrics.stream_skipped_bytes.get(), 100);
        assert_eq!(metrics.stream_throughput.get_sample_count(), 1);
        assert_eq!(metrics.stream_throughput.get_sample_sum(), 2048.0);
    }

    #[tokio::test]
    async fn test_run_drains_until_senders_drop() {
        let (sink, metrics) = sink();
        let (tx, rx) = unbounded_channel();
        tx.send(Observation::Traffic(Traffic::observed(flow(), 10))).unwrap();
        tx.send(Observation::Traffic(Traffic::retraction(flow()))).unwrap();
        drop(tx);

        let stats = sink.run(rx).await;
        assert_eq!(stats.added, 1);
        assert_eq!(stats.removed, 1);
        assert_eq!(metrics.retractions_unmatched.get(), 0);
    }
}
