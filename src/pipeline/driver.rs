use log::{debug, info};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};
use tokio::sync::mpsc::UnboundedSender;

use crate::capture::{DecodedPacket, FieldExtractor, NextPacket, PacketSource, RawPacket};
use crate::pipeline::{Observation, PipelineError};
use crate::reassembly::{Assembler, StreamHandler, StreamSummary};
use crate::traffic::FlowCorrelator;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CaptureStats {
    pub packets: u64,
    pub decode_errors: u64,
    /// Decoded packets without both an IP and a TCP/UDP layer.
    pub without_flow: u64,
    pub timeouts: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    PacketBudget,
    SourceClosed,
    Shutdown,
}

/// Per-mode processing behind the capture loop.
pub trait Stage {
    fn packet(&mut self, packet: &DecodedPacket<'_>, raw: &RawPacket) -> Result<(), PipelineError>;

    /// How often [`Stage::tick`] should run, `None` for never.
    fn tick_interval(&self) -> Option<Duration> {
        None
    }

    fn tick(&mut self) -> Result<(), PipelineError> {
        Ok(())
    }

    /// Called once when capture stops. Returns how many records were flushed.
    fn finish(&mut self) -> Result<usize, PipelineError>;
}

/// Flow mode: every packet goes through the correlator. Expiry happens in the
/// correlator's janitor task, so there is nothing to do on ticks.
pub struct FlowStage {
    correlator: FlowCorrelator,
}

impl FlowStage {
    pub fn new(correlator: FlowCorrelator) -> Self {
        Self { correlator }
    }
}

impl Stage for FlowStage {
    fn packet(&mut self, packet: &DecodedPacket<'_>, raw: &RawPacket) -> Result<(), PipelineError> {
        self.correlator.correlate(packet, raw.wire_len, Instant::now())?;
        Ok(())
    }

    fn finish(&mut self) -> Result<usize, PipelineError> {
        let stats = self.correlator.stats();
        info!(
            "Correlator: {} forwarded, {} swapped, {} unmatched, {} suppressed, {} retracted",
            stats.forwarded, stats.swapped, stats.unmatched, stats.suppressed, stats.retracted
        );
        Ok(self.correlator.evict_all()?)
    }
}

/// Stream mode: TCP segments are reassembled, completed streams are sent as
/// summaries. Streams idle for `flush_after` are flushed every half of it.
pub struct StreamStage<H: StreamHandler> {
    assembler: Assembler<H>,
    flush_after: Duration,
    events: UnboundedSender<Observation>,
}

impl<H: StreamHandler> StreamStage<H> {
    pub fn new(assembler: Assembler<H>, flush_after: Duration, events: UnboundedSender<Observation>) -> Self {
        Self {
            assembler,
            flush_after,
            events,
        }
    }

    pub fn assembler(&self) -> &Assembler<H> {
        &self.assembler
    }

    fn send(&self, summaries: impl IntoIterator<Item = StreamSummary>) -> Result<usize, PipelineError> {
        let mut sent = 0;
        for summary in summaries {
            self.events
                .send(Observation::Stream(summary))
                .map_err(|_| PipelineError::ChannelClosed)?;
            sent += 1;
        }
        Ok(sent)
    }
}

impl<H: StreamHandler> Stage for StreamStage<H> {
    fn packet(&mut self, packet: &DecodedPacket<'_>, raw: &RawPacket) -> Result<(), PipelineError> {
        let (Some(tcp), Some((src_ip, dst_ip))) = (packet.tcp(), packet.addresses()) else {
            return Ok(());
        };
        let src = SocketAddr::new(src_ip, tcp.src_port);
        let dst = SocketAddr::new(dst_ip, tcp.dst_port);

        if let Some(summary) = self.assembler.assemble(src, dst, tcp, packet.payload, raw.timestamp) {
            self.send([summary])?;
        }
        Ok(())
    }

    fn tick_interval(&self) -> Option<Duration> {
        Some(self.flush_after / 2)
    }

    fn tick(&mut self) -> Result<(), PipelineError> {
        let cutoff = SystemTime::now()
            .checked_sub(self.flush_after)
            .unwrap_or(UNIX_EPOCH);
        let summaries = self.assembler.flush_older_than(cutoff);
        let flushed = self.send(summaries)?;
        if flushed > 0 {
            debug!(
                "Flushed {} idle streams, {} active, {} pages buffered",
                flushed,
                self.assembler.active_streams(),
                self.assembler.buffered_pages()
            );
        }
        Ok(())
    }

    fn finish(&mut self) -> Result<usize, PipelineError> {
        let summaries = self.assembler.flush_all();
        self.send(summaries)
    }
}

/// Pulls packets from a [`PacketSource`], decodes them and hands them to a
/// [`Stage`] until the budget is spent, the source closes or shutdown is
/// requested.
pub struct CaptureLoop<S: PacketSource> {
    source: S,
    extractor: FieldExtractor,
    budget: Option<u64>,
    shutdown: Arc<AtomicBool>,
    stats: CaptureStats,
}

impl<S: PacketSource> CaptureLoop<S> {
    pub fn new(source: S, ip4: bool, ip6: bool) -> Self {
        let extractor = FieldExtractor::new(source.link_layer(), ip4, ip6);
        Self {
            source,
            extractor,
            budget: None,
            shutdown: Arc::new(AtomicBool::new(false)),
            stats: CaptureStats::default(),
        }
    }

    pub fn with_budget(mut self, budget: Option<u64>) -> Self {
        self.budget = budget;
        self
    }

    pub fn with_shutdown(mut self, shutdown: Arc<AtomicBool>) -> Self {
        self.shutdown = shutdown;
        self
    }

    pub fn stats(&self) -> CaptureStats {
        self.stats
    }

    pub fn source(&self) -> &S {
        &self.source
    }

    pub fn source_mut(&mut self) -> &mut S {
        &mut self.source
    }

    /// Runs the loop, then lets the stage flush whatever it still tracks. The
    /// flush happens even when the loop itself failed.
    pub fn run(&mut self, stage: &mut impl Stage) -> Result<StopReason, PipelineError> {
        let outcome = self.pump(stage);
        let flushed = stage.finish();

        let reason = outcome?;
        let flushed = flushed?;
        info!(
            "Capture stopped ({:?}) after {} packets, {} undecodable, {} without flow; flushed {}",
            reason, self.stats.packets, self.stats.decode_errors, self.stats.without_flow, flushed
        );
        Ok(reason)
    }

    fn pump(&mut self, stage: &mut impl Stage) -> Result<StopReason, PipelineError> {
        let tick_interval = stage.tick_interval();
        let mut last_tick = Instant::now();

        loop {
            if self.shutdown.load(Ordering::Relaxed) {
                return Ok(StopReason::Shutdown);
            }
            if self.budget.is_some_and(|budget| self.stats.packets >= budget) {
                return Ok(StopReason::PacketBudget);
            }

            match self.source.next_packet()? {
                NextPacket::Packet(raw) => {
                    self.stats.packets += 1;
                    match self.extractor.decode(&raw.data) {
                        Ok(packet) if packet.flow_key().is_some() => stage.packet(&packet, &raw)?,
                        Ok(_) => self.stats.without_flow += 1,
                        Err(e) => {
                            debug!("Skipping packet {}: {}", self.stats.packets, e);
                            self.stats.decode_errors += 1;
                        }
                    }
                }
                NextPacket::Timeout => self.stats.timeouts += 1,
                NextPacket::Closed => return Ok(StopReason::SourceClosed),
            }

            if let Some(interval) = tick_interval {
                if last_tick.elapsed() >= interval {
                    stage.tick()?;
                    last_tick = Instant::now();
                }
            }
        }
    }
}
