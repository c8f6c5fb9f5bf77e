use log::{debug, trace, warn};
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::sync::mpsc::UnboundedSender;
use tokio::task::JoinHandle;

use crate::capture::DecodedPacket;
use crate::pipeline::Observation;
use crate::traffic::cache::{ConnectionCache, ConnectionEntry};
use crate::traffic::model::{FlowKey, Traffic};

#[derive(Error, Debug)]
pub enum CorrelatorError {
    #[error("metrics channel closed, no consumer for traffic events")]
    ChannelClosed,
}

/// Which byte count a forwarded [`Traffic`] event carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LengthPolicy {
    /// Full frame length as seen on the wire.
    #[default]
    Frame,
    /// Transport payload only. Packets without payload update the cache but
    /// are not forwarded, since zero is the retraction sentinel.
    Payload,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CorrelatorStats {
    pub forwarded: u64,
    pub swapped: u64,
    pub unmatched: u64,
    pub suppressed: u64,
    pub retracted: u64,
}

struct Shared {
    cache: ConnectionCache,
    stats: CorrelatorStats,
}

/// Turns direction-ambiguous packets into initiator -> responder [`Traffic`]
/// events.
///
/// Cache access and the channel send for a packet happen under the same lock,
/// as does every eviction. For a given flow the consumer therefore never sees
/// a retraction before the additive events it retracts.
#[derive(Clone)]
pub struct FlowCorrelator {
    shared: Arc<Mutex<Shared>>,
    events: UnboundedSender<Observation>,
    length_policy: LengthPolicy,
    adopt_unmatched: bool,
}

impl FlowCorrelator {
    pub fn new(ttl: Duration, events: UnboundedSender<Observation>) -> Self {
        Self {
            shared: Arc::new(Mutex::new(Shared {
                cache: ConnectionCache::new(ttl),
                stats: CorrelatorStats::default(),
            })),
            events,
            length_policy: LengthPolicy::default(),
            adopt_unmatched: true,
        }
    }

    pub fn with_length_policy(mut self, policy: LengthPolicy) -> Self {
        self.length_policy = policy;
        self
    }

    /// Whether a flow first seen without its SYN is cached in its observed
    /// orientation so that it is retracted on expiry like any other.
    pub fn with_adopt_unmatched(mut self, adopt: bool) -> Self {
        self.adopt_unmatched = adopt;
        self
    }

    fn lock(&self) -> MutexGuard<'_, Shared> {
        self.shared.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn stats(&self) -> CorrelatorStats {
        self.lock().stats
    }

    pub fn tracked_flows(&self) -> usize {
        self.lock().cache.len()
    }

    fn length_of(&self, packet: &DecodedPacket<'_>, wire_len: usize) -> u64 {
        match self.length_policy {
            LengthPolicy::Frame => wire_len.max(packet.frame_len) as u64,
            LengthPolicy::Payload => packet.payload.len() as u64,
        }
    }

    /// Correlates one decoded packet and forwards the normalized event.
    ///
    /// Returns the forwarded event, or `None` when the packet has no flow
    /// identity or carries nothing to count under the active length policy.
    pub fn correlate(
        &self,
        packet: &DecodedPacket<'_>,
        wire_len: usize,
        now: Instant,
    ) -> Result<Option<Traffic>, CorrelatorError> {
        let Some(forward) = packet.flow_key() else {
            trace!("Packet without flow identity, {:?}/{:?}", packet.network, packet.transport);
            return Ok(None);
        };
        let observed = Traffic::observed(forward, self.length_of(packet, wire_len));
        let initial_syn = packet.tcp().map(|tcp| tcp.flags.is_initial_syn()).unwrap_or(false);

        if let Some(tcp) = packet.tcp() {
            trace!(
                "SYN: {} | ACK: {} | RST: {} | FIN: {}",
                tcp.flags.syn(),
                tcp.flags.ack(),
                tcp.flags.rst(),
                tcp.flags.fin()
            );
        }

        let mut shared = self.lock();

        // `owner` is the cache key whose retraction will cover this event
        let (traffic, owner) = if initial_syn {
            trace!("SYN seen, caching {} as initiator", forward);
            shared.cache.insert(forward, observed, now);
            (observed, Some(forward))
        } else if shared.cache.touch(&forward, now).is_some() {
            trace!("Flow {} matches its initiator record", forward);
            (observed, Some(forward))
        } else if shared.cache.touch(&forward.reversed(), now).is_some() {
            trace!("Return leg of {}, swapping endpoints", forward.reversed());
            shared.stats.swapped += 1;
            (observed.swapped(), Some(forward.reversed()))
        } else {
            warn!("Could not find {} or its reverse in cache", forward);
            shared.stats.unmatched += 1;
            if self.adopt_unmatched {
                shared.cache.insert(forward, observed, now);
                (observed, Some(forward))
            } else {
                (observed, None)
            }
        };

        if traffic.is_retraction() {
            shared.stats.suppressed += 1;
            return Ok(None);
        }

        debug!("{}", traffic);
        self.events
            .send(Observation::Traffic(traffic))
            .map_err(|_| CorrelatorError::ChannelClosed)?;
        if let Some(owner) = owner {
            shared.cache.mark_forwarded(&owner);
        }
        shared.stats.forwarded += 1;
        Ok(Some(traffic))
    }

    /// Retracts every flow whose entry has outlived its TTL.
    pub fn sweep(&self, now: Instant) -> Result<usize, CorrelatorError> {
        let mut shared = self.lock();
        let expired = shared.cache.drain_expired(now);
        self.retract(&mut shared, expired)
    }

    /// Retracts every tracked flow, used when the capture stops.
    pub fn evict_all(&self) -> Result<usize, CorrelatorError> {
        let mut shared = self.lock();
        let all = shared.cache.drain_all();
        self.retract(&mut shared, all)
    }

    /// Sends one retraction per entry that had an addition forwarded. Entries
    /// that never produced one, such as a bare SYN under the payload policy,
    /// are dropped silently.
    fn retract(&self, shared: &mut Shared, expired: Vec<(FlowKey, ConnectionEntry)>) -> Result<usize, CorrelatorError> {
        let mut count = 0;
        for (key, entry) in expired {
            if !entry.forwarded {
                trace!("Dropping {} with nothing forwarded", key);
                continue;
            }
            debug!("Expiring {} - {}", key, entry.traffic);
            self.events
                .send(Observation::Traffic(Traffic::retraction(entry.traffic.flow)))
                .map_err(|_| CorrelatorError::ChannelClosed)?;
            shared.stats.retracted += 1;
            count += 1;
        }
        Ok(count)
    }

    /// Runs [`FlowCorrelator::sweep`] every `interval` until the channel closes.
    pub fn spawn_janitor(&self, interval: Duration) -> JoinHandle<()> {
        let correlator = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                match correlator.sweep(Instant::now()) {
                    Ok(0) => {}
                    Ok(n) => debug!("Janitor expired {} flows, {} still tracked", n, correlator.tracked_flows()),
                    Err(e) => {
                        debug!("Janitor stopping: {}", e);
                        break;
                    }
                }
            }
        })
    }
}
