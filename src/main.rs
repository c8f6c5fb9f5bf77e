use anyhow::{Context, Result};
use clap::{ArgAction, Parser};
use log::{error, info, LevelFilter};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::process;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

use traffic_monitor::capture::PcapEngine;
use traffic_monitor::config::{Config, Mode};
use traffic_monitor::dns::HostnameResolver;
use traffic_monitor::metrics::{server, MetricsError, MetricsSink, TrafficMetrics};
use traffic_monitor::pipeline::{CaptureLoop, FlowStage, PipelineError, Stage, StopReason, StreamStage};
use traffic_monitor::reassembly::{Assembler, StatsHandler};
use traffic_monitor::traffic::FlowCorrelator;
use traffic_monitor::utils::formatting::format_bytes;

#[derive(Parser)]
#[command(name = "traffic-monitor")]
#[command(about = "Capture traffic on one interface and export per-flow counters for Prometheus")]
struct Cli {
    #[arg(short, long, env = "TRAFFIC_MONITOR_INTERFACE", help = "Network interface to capture on")]
    interface: Option<String>,

    #[arg(short = 'C', long, env = "TRAFFIC_MONITOR_CONFIG", help = "Configuration file path")]
    config: Option<PathBuf>,

    #[arg(short, long, action = ArgAction::Count, help = "Increase log verbosity (-v info, -vv debug, -vvv trace)")]
    verbose: u8,

    #[arg(long, value_enum, help = "Track direction-normalized flows or reassemble TCP streams")]
    mode: Option<Mode>,

    #[arg(long, value_parser = humantime::parse_duration, help = "Idle time before a flow or stream is dropped, e.g. 2m")]
    flush_after: Option<Duration>,

    #[arg(short = 'c', long, allow_negative_numbers = true, help = "Stop after this many packets, negative for no limit")]
    packet_count: Option<i64>,

    #[arg(short, long, help = "Snap length")]
    snaplen: Option<i32>,

    #[arg(long, help = "Reverse-resolve addresses used as metric labels")]
    resolve_dns: bool,

    #[arg(long, help = "Ignore IPv4 packets")]
    no_ip4: bool,

    #[arg(long, help = "Ignore IPv6 packets")]
    no_ip6: bool,

    #[arg(short, long, env = "TRAFFIC_MONITOR_LISTEN", help = "Address of the metrics endpoint")]
    listen: Option<SocketAddr>,

    #[arg(long, help = "Per-connection reassembly buffer, in pages")]
    connection_max_buffer: Option<usize>,

    #[arg(long, help = "Total reassembly buffer, in pages")]
    total_max_buffer: Option<usize>,

    #[arg(long, help = "List capture devices and exit")]
    list_interfaces: bool,

    #[arg(trailing_var_arg = true, help = "BPF filter expression")]
    filter: Vec<String>,
}

impl Cli {
    fn apply(&self, config: &mut Config) {
        if let Some(interface) = &self.interface {
            config.capture.interface = Some(interface.clone());
        }
        if let Some(mode) = self.mode {
            config.tracking.mode = mode;
        }
        if let Some(flush_after) = self.flush_after {
            config.tracking.flush_after = flush_after;
        }
        if let Some(count) = self.packet_count {
            config.capture.packet_count = count;
        }
        if let Some(snaplen) = self.snaplen {
            config.capture.snaplen = snaplen;
        }
        if self.resolve_dns {
            config.dns.resolve = true;
        }
        if self.no_ip4 {
            config.capture.ip4 = false;
        }
        if self.no_ip6 {
            config.capture.ip6 = false;
        }
        if let Some(listen) = self.listen {
            config.metrics.listen = listen;
        }
        if let Some(pages) = self.connection_max_buffer {
            config.tracking.connection_max_buffer = pages;
        }
        if let Some(pages) = self.total_max_buffer {
            config.tracking.total_max_buffer = pages;
        }
        if !self.filter.is_empty() {
            config.capture.filter = Some(self.filter.join(" "));
        }
    }
}

fn init_logging(verbose: u8) {
    let level = match verbose {
        0 => LevelFilter::Warn,
        1 => LevelFilter::Info,
        2 => LevelFilter::Debug,
        _ => LevelFilter::Trace,
    };
    env_logger::Builder::new()
        .filter_level(level)
        .parse_default_env()
        .init();
}

fn spawn_capture<S>(mut capture: CaptureLoop<PcapEngine>, mut stage: S) -> JoinHandle<Result<StopReason, PipelineError>>
where
    S: Stage + Send + 'static,
{
    tokio::task::spawn_blocking(move || {
        let result = capture.run(&mut stage);
        let stats = capture.source_mut().get_statistics();
        info!(
            "pcap: {} packets ({}) captured, {} dropped",
            stats.packets_captured,
            format_bytes(stats.bytes_captured),
            stats.packets_dropped
        );
        result
    })
}

async fn run(cli: Cli) -> Result<()> {
    if cli.list_interfaces {
        for device in PcapEngine::list_devices()? {
            println!("{}\t{}", device.name, device.desc.unwrap_or_default());
        }
        return Ok(());
    }

    let mut config = match &cli.config {
        Some(path) => Config::load_from_file(path)?,
        None => Config::default(),
    };
    cli.apply(&mut config);
    config.validate()?;

    let engine = PcapEngine::open(&config.capture)?;
    info!("Capturing on {} in {:?} mode", engine.interface(), config.tracking.mode);

    let metrics = Arc::new(TrafficMetrics::new()?);
    let (server_error_tx, mut server_errors) = oneshot::channel::<MetricsError>();
    let server_task = tokio::spawn({
        let metrics = metrics.clone();
        let listen = config.metrics.listen;
        async move {
            if let Err(e) = server::serve(listen, metrics).await {
                error!("Could not launch Prometheus metrics listener: {}", e);
                let _ = server_error_tx.send(e);
            }
        }
    });

    let (events, observations) = mpsc::unbounded_channel();
    let mut sink = MetricsSink::new(metrics.clone());
    if config.dns.resolve {
        sink = sink.with_resolver(HostnameResolver::new(&config.dns));
    }
    let sink_task = tokio::spawn(sink.run(observations));

    let shutdown = Arc::new(AtomicBool::new(false));
    let capture = CaptureLoop::new(engine, config.capture.ip4, config.capture.ip6)
        .with_budget(config.capture.packet_budget())
        .with_shutdown(shutdown.clone());

    let tracking = &config.tracking;
    let mut janitor = None;
    let mut capture_task = match tracking.mode {
        Mode::Flows => {
            let correlator = FlowCorrelator::new(tracking.flush_after, events)
                .with_length_policy(tracking.length_policy)
                .with_adopt_unmatched(tracking.adopt_unmatched);
            janitor = Some(correlator.spawn_janitor(tracking.cleanup_interval));
            spawn_capture(capture, FlowStage::new(correlator))
        }
        Mode::Streams => {
            let assembler = Assembler::new(StatsHandler, tracking.assembler());
            spawn_capture(capture, StreamStage::new(assembler, tracking.flush_after, events))
        }
    };

    let mut fatal: Option<anyhow::Error> = None;
    let outcome = tokio::select! {
        result = &mut capture_task => result,
        _ = tokio::signal::ctrl_c() => {
            info!("Interrupted, flushing tracked flows");
            shutdown.store(true, Ordering::Relaxed);
            capture_task.await
        }
        Ok(e) = &mut server_errors => {
            fatal = Some(e.into());
            shutdown.store(true, Ordering::Relaxed);
            capture_task.await
        }
    };

    // the janitor holds a sender, the sink only finishes once it is gone
    if let Some(janitor) = janitor {
        janitor.abort();
        let _ = janitor.await;
    }
    let sink_stats = sink_task.await.context("metrics sink task failed")?;
    server_task.abort();

    info!(
        "Metrics sink: {} added, {} removed, {} unmatched removals, {} streams",
        sink_stats.added, sink_stats.removed, sink_stats.unmatched_removals, sink_stats.streams
    );

    let reason = outcome.context("capture task failed")??;
    info!("Stopped: {:?}", reason);

    match fatal {
        Some(e) => Err(e),
        None => Ok(()),
    }
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    if let Err(e) = run(cli).await {
        error!("{:#}", e);
        eprintln!("Error: {:#}", e);
        process::exit(1);
    }
}
