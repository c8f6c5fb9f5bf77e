use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap};
use std::time::{Duration, Instant};

use crate::traffic::model::{FlowKey, Traffic};

/// Last snapshot seen for a flow plus the instant it stops being valid.
#[derive(Debug, Clone)]
pub struct ConnectionEntry {
    pub traffic: Traffic,
    pub expires_at: Instant,
    /// Set once an additive event attributed to this entry has been sent.
    pub forwarded: bool,
}

/// Time-bounded map from flow key to its most recent snapshot.
///
/// Every live key owns exactly one slot in `deadlines`. Refreshing an entry only
/// moves `expires_at`; the stale heap slot is revalidated and re-queued when it
/// surfaces during [`ConnectionCache::drain_expired`]. Per-packet operations
/// never walk the map.
pub struct ConnectionCache {
    entries: HashMap<FlowKey, ConnectionEntry>,
    deadlines: BinaryHeap<Reverse<(Instant, FlowKey)>>,
    ttl: Duration,
}

impl ConnectionCache {
    pub fn new(ttl: Duration) -> Self {
        Self {
            entries: HashMap::new(),
            deadlines: BinaryHeap::new(),
            ttl,
        }
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Stores `traffic` under `key`, replacing any previous snapshot. The
    /// `forwarded` mark of a replaced entry carries over.
    pub fn insert(&mut self, key: FlowKey, traffic: Traffic, now: Instant) {
        let expires_at = now + self.ttl;
        match self.entries.get_mut(&key) {
            Some(entry) => {
                entry.traffic = traffic;
                entry.expires_at = expires_at;
            }
            None => {
                self.entries.insert(
                    key,
                    ConnectionEntry {
                        traffic,
                        expires_at,
                        forwarded: false,
                    },
                );
                self.deadlines.push(Reverse((expires_at, key)));
            }
        }
    }

    /// Records that an additive event for `key` reached the consumer.
    pub fn mark_forwarded(&mut self, key: &FlowKey) {
        if let Some(entry) = self.entries.get_mut(key) {
            entry.forwarded = true;
        }
    }

    /// Looks up a live entry and slides its deadline forward.
    pub fn touch(&mut self, key: &FlowKey, now: Instant) -> Option<&ConnectionEntry> {
        let ttl = self.ttl;
        match self.entries.get_mut(key) {
            Some(entry) if entry.expires_at > now => {
                entry.expires_at = now + ttl;
                Some(&*entry)
            }
            _ => None,
        }
    }

    pub fn get(&self, key: &FlowKey) -> Option<&ConnectionEntry> {
        self.entries.get(key)
    }

    /// Removes and returns every entry whose deadline is at or before `now`.
    pub fn drain_expired(&mut self, now: Instant) -> Vec<(FlowKey, ConnectionEntry)> {
        let mut expired = Vec::new();

        while let Some(Reverse((deadline, key))) = self.deadlines.peek().copied() {
            if deadline > now {
                break;
            }
            self.deadlines.pop();

            match self.entries.get(&key).map(|entry| entry.expires_at) {
                Some(expires_at) if expires_at <= now => {
                    if let Some(entry) = self.entries.remove(&key) {
                        expired.push((key, entry));
                    }
                }
                // refreshed since this slot was queued
                Some(expires_at) => self.deadlines.push(Reverse((expires_at, key))),
                None => {}
            }
        }

        expired
    }

    /// Empties the cache regardless of deadlines.
    pub fn drain_all(&mut self) -> Vec<(FlowKey, ConnectionEntry)> {
        self.deadlines.clear();
        self.entries.drain().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::traffic::model::Transport;

    fn key(port: u16) -> FlowKey {
        FlowKey::new(
            Transport::Tcp,
            format!("192.168.1.10:{}", port).parse().unwrap(),
            "93.184.216.34:443".parse().unwrap(),
        )
    }

    #[test]
    fn test_entry_expires_after_ttl() {
        let start = Instant::now();
        let mut cache = ConnectionCache::new(Duration::from_secs(120));
        cache.insert(key(1), Traffic::observed(key(1), 74), start);

        assert!(cache.drain_expired(start + Duration::from_secs(119)).is_empty());
        let expired = cache.drain_expired(start + Duration::from_secs(120));
        assert_eq!(expired.len(), 1);
        assert_eq!(expired[0].0, key(1));
        assert!(cache.is_empty());
        assert!(cache.drain_expired(start + Duration::from_secs(600)).is_empty());
    }

    #[test]
    fn test_touch_slides_deadline() {
        let start = Instant::now();
        let mut cache = ConnectionCache::new(Duration::from_secs(60));
        cache.insert(key(1), Traffic::observed(key(1), 74), start);

        assert!(cache.touch(&key(1), start + Duration::from_secs(50)).is_some());
        assert!(cache.drain_expired(start + Duration::from_secs(70)).is_empty());
        assert_eq!(cache.drain_expired(start + Duration::from_secs(110)).len(), 1);
    }

    #[test]
    fn test_touch_ignores_stale_entry() {
        let start = Instant::now();
        let mut cache = ConnectionCache::new(Duration::from_secs(10));
        cache.insert(key(1), Traffic::observed(key(1), 74), start);
        assert!(cache.touch(&key(1), start + Duration::from_secs(10)).is_none());
        assert!(cache.touch(&key(2), start).is_none());
    }

    #[test]
    fn test_overwrite_keeps_single_deadline_slot() {
        let start = Instant::now();
        let mut cache = ConnectionCache::new(Duration::from_secs(10));
        for i in 0..5 {
            cache.insert(key(1), Traffic::observed(key(1), 60 + i), start + Duration::from_secs(i));
        }
        assert_eq!(cache.len(), 1);
        assert_eq!(cache.deadlines.len(), 1);

        let expired = cache.drain_expired(start + Duration::from_secs(30));
        assert_eq!(expired.len(), 1);
        assert_eq!(expired[0].1.traffic.length, 64);
    }

    #[test]
    fn test_forwarded_mark_survives_overwrite() {
        let start = Instant::now();
        let mut cache = ConnectionCache::new(Duration::from_secs(10));
        cache.insert(key(1), Traffic::observed(key(1), 0), start);
        assert!(!cache.get(&key(1)).unwrap().forwarded);

        cache.mark_forwarded(&key(1));
        cache.insert(key(1), Traffic::observed(key(1), 0), start + Duration::from_secs(1));
        assert!(cache.get(&key(1)).unwrap().forwarded);

        cache.mark_forwarded(&key(2));
        assert!(cache.get(&key(2)).is_none());
    }

    #[test]
    fn test_drain_all() {
        let start = Instant::now();
        let mut cache = ConnectionCache::new(Duration::from_secs(10));
        cache.insert(key(1), Traffic::observed(key(1), 1), start);
        cache.insert(key(2), Traffic::observed(key(2), 1), start);
        assert_eq!(cache.drain_all().len(), 2);
        assert!(cache.is_empty());
        assert!(cache.drain_expired(start + Duration::from_secs(60)).is_empty());
    }
}
