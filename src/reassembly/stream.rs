use serde::Serialize;
use std::fmt;
use std::net::SocketAddr;
use std::time::{Duration, SystemTime};

use crate::traffic::IpVersion;
use crate::utils::formatting::{format_bytes, format_elapsed, format_rate};

/// Identity of a reassembled TCP stream, oriented client -> server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct StreamId {
    pub ip_version: IpVersion,
    pub client: SocketAddr,
    pub server: SocketAddr,
}

impl StreamId {
    pub fn new(client: SocketAddr, server: SocketAddr) -> Self {
        Self {
            ip_version: IpVersion::of(&client),
            client,
            server,
        }
    }
}

impl fmt::Display for StreamId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/tcp {} <-> {}", self.ip_version, self.client, self.server)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    ClientToServer,
    ServerToClient,
}

impl Direction {
    pub(crate) fn index(&self) -> usize {
        match self {
            Direction::ClientToServer => 0,
            Direction::ServerToClient => 1,
        }
    }
}

/// Ordered piece of one direction of a stream, handed over by the assembler.
#[derive(Debug, Clone, Copy)]
pub struct Chunk<'a> {
    pub direction: Direction,
    pub bytes: &'a [u8],
    /// Bytes the assembler gave up waiting for right before `bytes`.
    pub skip: usize,
    pub start: bool,
    pub end: bool,
    pub seen: SystemTime,
}

impl Chunk<'_> {
    /// A chunk that only marks a stream boundary (bare SYN or FIN).
    pub fn is_boundary_only(&self) -> bool {
        self.bytes.is_empty() && self.skip == 0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum CompletionReason {
    /// Both directions were closed with FIN.
    Closed,
    Reset,
    /// Idle longer than the flush age.
    Flushed,
    /// Capture stopped with the stream still open.
    Shutdown,
}

impl CompletionReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            CompletionReason::Closed => "closed",
            CompletionReason::Reset => "reset",
            CompletionReason::Flushed => "flushed",
            CompletionReason::Shutdown => "shutdown",
        }
    }
}

/// Capabilities the assembler needs from whatever consumes streams.
pub trait StreamHandler {
    type Handle;

    fn create(&mut self, id: &StreamId, first_seen: SystemTime) -> Self::Handle;

    fn deliver(&mut self, handle: &mut Self::Handle, chunk: &Chunk<'_>);

    fn complete(&mut self, handle: Self::Handle, reason: CompletionReason) -> StreamSummary;
}

/// Running statistics for one stream.
#[derive(Debug, Clone)]
pub struct StreamState {
    pub id: StreamId,
    pub bytes: u64,
    pub packets: u64,
    pub out_of_order: u64,
    pub skipped: u64,
    pub start: SystemTime,
    pub end: SystemTime,
    pub saw_start: bool,
    pub saw_end: bool,
}

impl StreamState {
    pub fn new(id: StreamId, first_seen: SystemTime) -> Self {
        Self {
            id,
            bytes: 0,
            packets: 0,
            out_of_order: 0,
            skipped: 0,
            start: first_seen,
            end: first_seen,
            saw_start: false,
            saw_end: false,
        }
    }

    pub fn record(&mut self, chunk: &Chunk<'_>) {
        self.saw_start |= chunk.start;
        self.saw_end |= chunk.end;
        if chunk.is_boundary_only() {
            return;
        }

        if chunk.seen < self.end {
            self.out_of_order += 1;
        } else {
            self.end = chunk.seen;
        }
        self.bytes += chunk.bytes.len() as u64;
        self.packets += 1;
        self.skipped += chunk.skip as u64;
    }

    pub fn finish(self, reason: CompletionReason) -> StreamSummary {
        let elapsed = self.end.duration_since(self.start).unwrap_or(Duration::ZERO);
        StreamSummary {
            id: self.id,
            bytes: self.bytes,
            packets: self.packets,
            out_of_order: self.out_of_order,
            skipped: self.skipped,
            start: self.start,
            end: self.end,
            elapsed,
            saw_start: self.saw_start,
            saw_end: self.saw_end,
            reason,
        }
    }
}

/// Final, read-only statistics of a completed stream.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StreamSummary {
    pub id: StreamId,
    pub bytes: u64,
    pub packets: u64,
    pub out_of_order: u64,
    pub skipped: u64,
    pub start: SystemTime,
    pub end: SystemTime,
    pub elapsed: Duration,
    pub saw_start: bool,
    pub saw_end: bool,
    pub reason: CompletionReason,
}

impl StreamSummary {
    /// `None` when the stream has no measurable duration.
    pub fn bytes_per_second(&self) -> Option<f64> {
        self.per_second(self.bytes)
    }

    pub fn packets_per_second(&self) -> Option<f64> {
        self.per_second(self.packets)
    }

    fn per_second(&self, count: u64) -> Option<f64> {
        let secs = self.elapsed.as_secs_f64();
        (secs > 0.0).then(|| count as f64 / secs)
    }
}

impl fmt::Display for StreamSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {}: {} in {} packets over {} ({}, {}), {} out of order, {} skipped, saw_start={} saw_end={}",
            self.id,
            self.reason.as_str(),
            format_bytes(self.bytes),
            self.packets,
            format_elapsed(self.elapsed),
            format_rate(self.bytes_per_second().unwrap_or(0.0), "B/s"),
            format_rate(self.packets_per_second().unwrap_or(0.0), "pkt/s"),
            self.out_of_order,
            format_bytes(self.skipped),
            self.saw_start,
            self.saw_end,
        )
    }
}

/// [`StreamHandler`] that only keeps delivery statistics.
#[derive(Debug, Default)]
pub struct StatsHandler;

impl StreamHandler for StatsHandler {
    type Handle = StreamState;

    fn create(&mut self, id: &StreamId, first_seen: SystemTime) -> StreamState {
        StreamState::new(*id, first_seen)
    }

    fn deliver(&mut self, handle: &mut StreamState, chunk: &Chunk<'_>) {
        handle.record(chunk);
    }

    fn complete(&mut self, handle: StreamState, reason: CompletionReason) -> StreamSummary {
        handle.finish(reason)
    }
}
