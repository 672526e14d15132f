//! Peer activity clocks.
//!
//! Three peer-keyed timestamps drive keepalive and idle-eviction decisions:
//! last sent, last received, and last "active" (messages the codec counts
//! towards session liveness; keepalive and error frames are excluded by the
//! callers). The periodic sweep evicts peers whose active clock has gone
//! stale and reports them so the application can react.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use crate::core::time::Clock;
use crate::peers::Peer;

pub struct ActivityClock<C: Clock> {
    clock: C,
    last_active: Mutex<HashMap<Peer, Instant>>,
    last_sent: Mutex<HashMap<Peer, Instant>>,
    last_received: Mutex<HashMap<Peer, Instant>>,
}

impl<C: Clock> ActivityClock<C> {
    pub fn new(clock: C) -> Self {
        Self {
            clock,
            last_active: Mutex::new(HashMap::new()),
            last_sent: Mutex::new(HashMap::new()),
            last_received: Mutex::new(HashMap::new()),
        }
    }

    /// Record a successful transport write. `counts_active` is true when the
    /// frame is an active, non-error message.
    pub fn note_sent(&self, peer: &Peer, counts_active: bool) {
        let now = self.clock.now();
        if counts_active {
            self.last_active.lock().insert(peer.clone(), now);
        }
        self.last_sent.lock().insert(peer.clone(), now);
    }

    /// Record a received frame, with the same active qualification.
    pub fn note_received(&self, peer: &Peer, counts_active: bool) {
        let now = self.clock.now();
        if counts_active {
            self.last_active.lock().insert(peer.clone(), now);
        }
        self.last_received.lock().insert(peer.clone(), now);
    }

    pub fn last_sent(&self, peer: &Peer) -> Option<Instant> {
        self.last_sent.lock().get(peer).copied()
    }

    pub fn last_received(&self, peer: &Peer) -> Option<Instant> {
        self.last_received.lock().get(peer).copied()
    }

    pub fn last_active(&self, peer: &Peer) -> Option<Instant> {
        self.last_active.lock().get(peer).copied()
    }

    /// Remove and return every peer whose active clock is older than
    /// `timeout`. Each timed-out peer is reported exactly once; its entry is
    /// dropped so the next sweep stays quiet until new traffic arrives.
    pub fn sweep_idle(&self, timeout: Duration) -> Vec<Peer> {
        let now = self.clock.now();
        let mut timed_out = Vec::new();
        let mut last_active = self.last_active.lock();
        last_active.retain(|peer, at| {
            if now.saturating_duration_since(*at) > timeout {
                timed_out.push(peer.clone());
                false
            } else {
                true
            }
        });
        timed_out
    }

    pub fn clear(&self, peer: &Peer) {
        self.last_active.lock().remove(peer);
        self.last_sent.lock().remove(peer);
        self.last_received.lock().remove(peer);
    }

    pub fn tracked_peers(&self) -> usize {
        self.last_active.lock().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::ProtocolVersion;
    use crate::core::time::ManualClock;

    fn peer(id: &str) -> Peer {
        Peer::new(id, ProtocolVersion::V1_2)
    }

    #[test]
    fn keepalive_writes_do_not_touch_the_active_clock() {
        let clock = ManualClock::default();
        let activity = ActivityClock::new(clock.clone());
        let p = peer("c1");
        activity.note_sent(&p, false);
        assert!(activity.last_sent(&p).is_some());
        assert!(activity.last_active(&p).is_none());
    }

    #[test]
    fn sweep_fires_once_per_idle_peer() {
        let clock = ManualClock::default();
        let activity = ActivityClock::new(clock.clone());
        let p = peer("c1");
        activity.note_received(&p, true);

        clock.advance(Duration::from_millis(600));
        let idle = activity.sweep_idle(Duration::from_millis(500));
        assert_eq!(idle, vec![p.clone()]);

        // Entry dropped: a second sweep with the same clock is silent.
        assert!(activity.sweep_idle(Duration::from_millis(500)).is_empty());
        // The send/receive clocks survive the active eviction.
        assert!(activity.last_received(&p).is_some());
    }

    #[test]
    fn fresh_peers_survive_the_sweep() {
        let clock = ManualClock::default();
        let activity = ActivityClock::new(clock.clone());
        activity.note_received(&peer("c1"), true);
        clock.advance(Duration::from_millis(100));
        assert!(activity.sweep_idle(Duration::from_millis(500)).is_empty());
        assert_eq!(activity.tracked_peers(), 1);
    }
}
