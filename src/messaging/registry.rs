//! Message registry.
//!
//! Payload blobs are stored once under a UUID and referenced from queued
//! publishes, so a fan-out to many subscribers keeps a single copy. Entries
//! older than the TTL are tidied from the periodic state loop.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use bytes::Bytes;
use parking_lot::Mutex;
use uuid::Uuid;

use crate::core::time::Clock;

struct StoredPayload {
    data: Bytes,
    stored_at: Instant,
}

pub struct MessageRegistry<C: Clock> {
    clock: C,
    ttl: Duration,
    entries: Mutex<HashMap<Uuid, StoredPayload>>,
}

impl<C: Clock> MessageRegistry<C> {
    pub fn new(clock: C, ttl: Duration) -> Self {
        Self {
            clock,
            ttl,
            entries: Mutex::new(HashMap::new()),
        }
    }

    /// Store a payload once; fan-out paths share the buffer through the
    /// returned id and cheap [`Bytes`] clones.
    pub fn add(&self, data: Vec<u8>) -> Uuid {
        let id = Uuid::new_v4();
        self.entries.lock().insert(
            id,
            StoredPayload {
                data: Bytes::from(data),
                stored_at: self.clock.now(),
            },
        );
        id
    }

    pub fn get(&self, id: &Uuid) -> Option<Bytes> {
        self.entries.lock().get(id).map(|e| e.data.clone())
    }

    pub fn remove(&self, id: &Uuid) -> Option<Bytes> {
        self.entries.lock().remove(id).map(|e| e.data)
    }

    /// Drop entries past the TTL; returns how many were evicted.
    pub fn tidy(&self) -> usize {
        let now = self.clock.now();
        let mut entries = self.entries.lock();
        let before = entries.len();
        entries.retain(|_, e| now.saturating_duration_since(e.stored_at) <= self.ttl);
        before - entries.len()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::time::ManualClock;

    #[test]
    fn tidy_only_evicts_expired_entries() {
        let clock = ManualClock::default();
        let registry = MessageRegistry::new(clock.clone(), Duration::from_secs(60));
        let old = registry.add(b"old".to_vec());
        clock.advance(Duration::from_secs(45));
        let fresh = registry.add(b"fresh".to_vec());
        clock.advance(Duration::from_secs(30));

        assert_eq!(registry.tidy(), 1);
        assert!(registry.get(&old).is_none());
        assert_eq!(registry.get(&fresh).unwrap().as_ref(), b"fresh");
    }

    #[test]
    fn remove_returns_the_payload_once() {
        let clock = ManualClock::default();
        let registry = MessageRegistry::new(clock, Duration::from_secs(60));
        let id = registry.add(b"x".to_vec());
        assert_eq!(registry.remove(&id).unwrap().as_ref(), b"x");
        assert!(registry.remove(&id).is_none());
    }
}
