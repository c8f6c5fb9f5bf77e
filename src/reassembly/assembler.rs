//! TCP reassembly engine.
//!
//! Connections are tracked bidirectionally under an unordered endpoint pair.
//! Each direction keeps its own sequence space relative to the first sequence
//! number seen (the SYN when captured). In-order bytes are handed to the
//! [`StreamHandler`] immediately, future segments wait in a per-direction
//! buffer until the gap fills, a page budget is exceeded, or the connection is
//! flushed. Whatever could not be delivered in order is reported as `skip`.

use log::{debug, trace};
use std::collections::{BTreeMap, HashMap};
use std::net::SocketAddr;
use std::time::SystemTime;

use crate::capture::TcpSegment;
use crate::reassembly::stream::{
    Chunk, CompletionReason, Direction, StreamHandler, StreamId, StreamSummary,
};

/// Buffering limits, counted in pages (one page per buffered segment).
/// Zero means unlimited.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AssemblerConfig {
    pub connection_max_buffer: usize,
    pub total_max_buffer: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StreamPhase {
    /// Created, nothing delivered yet.
    New,
    Active,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
struct ConnectionKey {
    low: SocketAddr,
    high: SocketAddr,
}

impl ConnectionKey {
    fn new(a: SocketAddr, b: SocketAddr) -> Self {
        if a < b {
            Self { low: a, high: b }
        } else {
            Self { low: b, high: a }
        }
    }
}

#[derive(Debug)]
struct Segment {
    data: Vec<u8>,
    fin: bool,
    seen: SystemTime,
}

enum Accepted {
    Delivered,
    Buffered,
    Duplicate,
}

#[derive(Debug, Default)]
struct HalfStream {
    isn: Option<u32>,
    /// Offset of the next expected byte, relative to `isn`.
    next: u32,
    pending: BTreeMap<u32, Segment>,
    start_pending: bool,
    closed: bool,
    delivered: bool,
}

impl HalfStream {
    fn offset_of(&mut self, tcp: &TcpSegment) -> u32 {
        let isn = match self.isn {
            Some(isn) => isn,
            None => {
                self.isn = Some(tcp.sequence);
                if tcp.flags.syn() {
                    // SYN occupies one sequence number
                    self.next = 1;
                    self.start_pending = true;
                }
                tcp.sequence
            }
        };
        let data_seq = if tcp.flags.syn() {
            tcp.sequence.wrapping_add(1)
        } else {
            tcp.sequence
        };
        data_seq.wrapping_sub(isn)
    }

    fn emit(
        &mut self,
        direction: Direction,
        bytes: &[u8],
        skip: usize,
        fin: bool,
        seen: SystemTime,
        deliver: &mut dyn FnMut(&Chunk<'_>),
    ) {
        let chunk = Chunk {
            direction,
            bytes,
            skip,
            start: std::mem::take(&mut self.start_pending),
            end: fin,
            seen,
        };
        deliver(&chunk);
        self.delivered |= !chunk.is_boundary_only();

        self.next = self.next.wrapping_add(bytes.len() as u32);
        if fin {
            self.next = self.next.wrapping_add(1);
            self.closed = true;
        }
    }

    fn accept(
        &mut self,
        direction: Direction,
        offset: u32,
        data: &[u8],
        fin: bool,
        seen: SystemTime,
        deliver: &mut dyn FnMut(&Chunk<'_>),
    ) -> Accepted {
        if self.closed {
            return Accepted::Duplicate;
        }
        let diff = offset.wrapping_sub(self.next) as i32;
        if diff > 0 {
            self.pending.insert(
                offset,
                Segment {
                    data: data.to_vec(),
                    fin,
                    seen,
                },
            );
            return Accepted::Buffered;
        }

        let overlap = diff.unsigned_abs() as usize;
        if overlap > data.len() || (overlap == data.len() && !fin) {
            return Accepted::Duplicate;
        }
        self.emit(direction, &data[overlap..], 0, fin, seen, deliver);
        self.drain(direction, deliver);
        Accepted::Delivered
    }

    /// Delivers buffered segments that have become contiguous.
    fn drain(&mut self, direction: Direction, deliver: &mut dyn FnMut(&Chunk<'_>)) {
        while let Some((&offset, _)) = self.pending.first_key_value() {
            if self.closed {
                self.pending.clear();
                break;
            }
            let diff = offset.wrapping_sub(self.next) as i32;
            if diff > 0 {
                break;
            }
            let Some(segment) = self.pending.remove(&offset) else {
                break;
            };
            let overlap = diff.unsigned_abs() as usize;
            if overlap > segment.data.len() || (overlap == segment.data.len() && !segment.fin) {
                continue;
            }
            self.emit(direction, &segment.data[overlap..], 0, segment.fin, segment.seen, deliver);
        }
    }

    /// Gives up on the gap before the earliest buffered segment and delivers
    /// it with the gap reported as skipped. Returns `false` if nothing was
    /// buffered.
    fn skip_gap(&mut self, direction: Direction, deliver: &mut dyn FnMut(&Chunk<'_>)) -> bool {
        let Some((offset, segment)) = self.pending.pop_first() else {
            return false;
        };
        let gap = (offset.wrapping_sub(self.next) as i32).max(0) as usize;
        self.next = offset;
        self.emit(direction, &segment.data, gap, segment.fin, segment.seen, deliver);
        self.drain(direction, deliver);
        true
    }

    fn flush(&mut self, direction: Direction, deliver: &mut dyn FnMut(&Chunk<'_>)) {
        while self.skip_gap(direction, deliver) {}
    }

    fn report_start(&mut self, direction: Direction, seen: SystemTime, deliver: &mut dyn FnMut(&Chunk<'_>)) {
        if self.start_pending {
            self.emit(direction, &[], 0, false, seen, deliver);
        }
    }
}

struct Connection<T> {
    id: StreamId,
    handle: T,
    halves: [HalfStream; 2],
    last_seen: SystemTime,
}

impl<T> Connection<T> {
    fn buffered(&self) -> usize {
        self.halves.iter().map(|h| h.pending.len()).sum()
    }

    fn phase(&self) -> StreamPhase {
        if self.halves.iter().any(|h| h.delivered) {
            StreamPhase::Active
        } else {
            StreamPhase::New
        }
    }

    fn direction_of(&self, src: SocketAddr) -> Direction {
        if src == self.id.client {
            Direction::ClientToServer
        } else {
            Direction::ServerToClient
        }
    }
}

/// Orders TCP segments per connection and reports them to a [`StreamHandler`].
pub struct Assembler<H: StreamHandler> {
    handler: H,
    connections: HashMap<ConnectionKey, Connection<H::Handle>>,
    config: AssemblerConfig,
    buffered_total: usize,
}

impl<H: StreamHandler> Assembler<H> {
    pub fn new(handler: H, config: AssemblerConfig) -> Self {
        Self {
            handler,
            connections: HashMap::new(),
            config,
            buffered_total: 0,
        }
    }

    pub fn active_streams(&self) -> usize {
        self.connections.len()
    }

    pub fn buffered_pages(&self) -> usize {
        self.buffered_total
    }

    #[cfg(test)]
    fn phase(&self, a: SocketAddr, b: SocketAddr) -> Option<StreamPhase> {
        self.connections.get(&ConnectionKey::new(a, b)).map(|c| c.phase())
    }

    /// Feeds one TCP segment. Returns the summary if it completed its stream.
    pub fn assemble(
        &mut self,
        src: SocketAddr,
        dst: SocketAddr,
        tcp: &TcpSegment,
        payload: &[u8],
        seen: SystemTime,
    ) -> Option<StreamSummary> {
        let key = ConnectionKey::new(src, dst);

        if !self.connections.contains_key(&key) {
            if tcp.flags.rst() || (payload.is_empty() && !tcp.flags.syn()) {
                trace!("Ignoring segment {} -> {} for untracked stream", src, dst);
                return None;
            }
            let (client, server) = if tcp.flags.syn() && tcp.flags.ack() {
                (dst, src)
            } else {
                (src, dst)
            };
            let id = StreamId::new(client, server);
            debug!("New stream {}", id);
            let handle = self.handler.create(&id, seen);
            self.connections.insert(
                key,
                Connection {
                    id,
                    handle,
                    halves: [HalfStream::default(), HalfStream::default()],
                    last_seen: seen,
                },
            );
        }

        let Self {
            handler,
            connections,
            config,
            buffered_total,
        } = self;
        let conn = connections.get_mut(&key)?;
        let others = *buffered_total - conn.buffered();

        if seen > conn.last_seen {
            conn.last_seen = seen;
        }
        let direction = conn.direction_of(src);
        let Connection { handle, halves, .. } = &mut *conn;

        if tcp.flags.rst() {
            trace!("RST from {} -> {}", src, dst);
        } else {
            let deliver: &mut dyn FnMut(&Chunk<'_>) = &mut |chunk| handler.deliver(handle, chunk);
            let half = &mut halves[direction.index()];
            let offset = half.offset_of(tcp);
            if !payload.is_empty() || tcp.flags.fin() {
                let accepted = half.accept(direction, offset, payload, tcp.flags.fin(), seen, deliver);
                if let Accepted::Buffered = accepted {
                    loop {
                        let own: usize = halves.iter().map(|h| h.pending.len()).sum();
                        let over_connection = config.connection_max_buffer > 0 && own > config.connection_max_buffer;
                        let over_total = config.total_max_buffer > 0 && others + own > config.total_max_buffer;
                        if !(over_connection || over_total) {
                            break;
                        }
                        if !halves[direction.index()].skip_gap(direction, deliver) {
                            break;
                        }
                    }
                }
            }
            halves[direction.index()].report_start(direction, seen, deliver);
        }

        let reason = if tcp.flags.rst() {
            Some(CompletionReason::Reset)
        } else if halves.iter().all(|h| h.closed) {
            Some(CompletionReason::Closed)
        } else {
            None
        };

        *buffered_total = others + conn.buffered();

        match reason {
            Some(reason) => {
                let conn = self.connections.remove(&key)?;
                Some(self.finish(conn, reason))
            }
            None => None,
        }
    }

    fn finish(&mut self, conn: Connection<H::Handle>, reason: CompletionReason) -> StreamSummary {
        let phase = conn.phase();
        let Connection {
            id,
            mut handle,
            mut halves,
            ..
        } = conn;
        self.buffered_total -= halves.iter().map(|h| h.pending.len()).sum::<usize>();

        {
            let handler = &mut self.handler;
            let deliver: &mut dyn FnMut(&Chunk<'_>) = &mut |chunk| handler.deliver(&mut handle, chunk);
            halves[0].flush(Direction::ClientToServer, deliver);
            halves[1].flush(Direction::ServerToClient, deliver);
        }

        debug!("Stream {} complete ({}, {:?} before flush)", id, reason.as_str(), phase);
        self.handler.complete(handle, reason)
    }

    /// Force-completes every stream that has been idle since before `cutoff`.
    pub fn flush_older_than(&mut self, cutoff: SystemTime) -> Vec<StreamSummary> {
        let stale: Vec<ConnectionKey> = self
            .connections
            .iter()
            .filter(|(_, conn)| conn.last_seen < cutoff)
            .map(|(key, _)| *key)
            .collect();

        let mut summaries = Vec::with_capacity(stale.len());
        for key in stale {
            if let Some(conn) = self.connections.remove(&key) {
                summaries.push(self.finish(conn, CompletionReason::Flushed));
            }
        }
        summaries
    }

    /// Completes every tracked stream.
    pub fn flush_all(&mut self) -> Vec<StreamSummary> {
        let keys: Vec<ConnectionKey> = self.connections.keys().copied().collect();
        let mut summaries = Vec::with_capacity(keys.len());
        for key in keys {
            if let Some(conn) = self.connections.remove(&key) {
                summaries.push(self.finish(conn, CompletionReason::Shutdown));
            }
        }
        summaries
    }
}
