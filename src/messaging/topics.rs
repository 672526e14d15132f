//! Topic registry.
//!
//! MQTT-SN publishes never carry a full topic path; they carry a 16-bit id
//! interpreted per the topic-id-type flag. This registry owns the three
//! namespaces: per-peer registered aliases (NORMAL), the config-fed
//! predefined table (PREDEFINED), and 1–2 character short topics packed
//! directly into the id field (SHORT).

use std::collections::HashMap;

use parking_lot::Mutex;

use crate::codec::{pack_short_topic, unpack_short_topic, CodecError, TopicIdKind};
use crate::peers::Peer;

/// A normalized topic reference ready for the wire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TopicInfo {
    pub kind: TopicIdKind,
    pub topic_id: u16,
    pub path: String,
}

#[derive(Default)]
struct PeerTopics {
    by_id: HashMap<u16, String>,
    by_path: HashMap<String, u16>,
    next_id: u16,
}

pub struct TopicRegistry {
    predefined_by_id: HashMap<u16, String>,
    predefined_by_path: HashMap<String, u16>,
    peers: Mutex<HashMap<Peer, PeerTopics>>,
}

impl TopicRegistry {
    pub fn new(predefined: &HashMap<String, u16>) -> Self {
        let mut predefined_by_id = HashMap::new();
        let mut predefined_by_path = HashMap::new();
        for (path, id) in predefined {
            predefined_by_id.insert(*id, path.clone());
            predefined_by_path.insert(path.clone(), *id);
        }
        Self {
            predefined_by_id,
            predefined_by_path,
            peers: Mutex::new(HashMap::new()),
        }
    }

    /// Register (or fetch) a NORMAL alias for the peer, assigning the next
    /// free id on first sight.
    pub fn register(&self, peer: &Peer, path: &str) -> u16 {
        let mut peers = self.peers.lock();
        let topics = peers.entry(peer.clone()).or_default();
        if let Some(id) = topics.by_path.get(path) {
            return *id;
        }
        loop {
            topics.next_id = topics.next_id.wrapping_add(1).max(1);
            if !topics.by_id.contains_key(&topics.next_id) {
                break;
            }
        }
        let id = topics.next_id;
        topics.by_id.insert(id, path.to_string());
        topics.by_path.insert(path.to_string(), id);
        id
    }

    /// Record an alias announced by the other side (REGISTER in, or the
    /// topic id granted by a REGACK/SUBACK).
    pub fn learn(&self, peer: &Peer, path: &str, id: u16) {
        if id == 0 {
            return;
        }
        let mut peers = self.peers.lock();
        let topics = peers.entry(peer.clone()).or_default();
        topics.by_id.insert(id, path.to_string());
        topics.by_path.insert(path.to_string(), id);
    }

    pub fn alias_for(&self, peer: &Peer, path: &str) -> Option<u16> {
        self.peers.lock().get(peer)?.by_path.get(path).copied()
    }

    /// Pick the wire form of a topic path for a publish to `peer`. Short
    /// and predefined topics need no registration; everything else needs a
    /// registered alias first.
    pub fn info_for_path(&self, peer: &Peer, path: &str) -> Option<TopicInfo> {
        if let Some(id) = self.predefined_by_path.get(path) {
            return Some(TopicInfo {
                kind: TopicIdKind::Predefined,
                topic_id: *id,
                path: path.to_string(),
            });
        }
        if path.len() <= 2 {
            return pack_short_topic(path).ok().map(|id| TopicInfo {
                kind: TopicIdKind::Short,
                topic_id: id,
                path: path.to_string(),
            });
        }
        self.alias_for(peer, path).map(|id| TopicInfo {
            kind: TopicIdKind::Normal,
            topic_id: id,
            path: path.to_string(),
        })
    }

    /// Resolve a received topic reference back to its full path.
    pub fn path_for(&self, peer: &Peer, kind: TopicIdKind, topic_id: u16) -> Option<String> {
        match kind {
            TopicIdKind::Normal => self.peers.lock().get(peer)?.by_id.get(&topic_id).cloned(),
            TopicIdKind::Predefined => self.predefined_by_id.get(&topic_id).cloned(),
            TopicIdKind::Short => Some(unpack_short_topic(topic_id)),
        }
    }

    pub fn clear(&self, peer: &Peer) {
        self.peers.lock().remove(peer);
    }

    pub fn registered_count(&self, peer: &Peer) -> usize {
        self.peers.lock().get(peer).map_or(0, |t| t.by_id.len())
    }
}

/// Validate a concrete publish topic: non-empty, no wildcards.
pub fn check_publish_topic(path: &str) -> Result<(), CodecError> {
    if path.is_empty() || path.len() > crate::codec::MAX_TOPIC_LEN || path.contains(['+', '#']) {
        return Err(CodecError::TopicTooLong);
    }
    Ok(())
}

/// MQTT topic filter matching with `+` (single level) and `#` (trailing
/// multi-level) wildcards.
pub fn topic_matches(filter: &str, path: &str) -> bool {
    let mut filter_parts = filter.split('/');
    let mut path_parts = path.split('/');
    loop {
        match (filter_parts.next(), path_parts.next()) {
            (Some("#"), _) => return true,
            (Some("+"), Some(_)) => {}
            (Some(f), Some(p)) if f == p => {}
            (None, None) => return true,
            _ => return false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::ProtocolVersion;

    fn peer() -> Peer {
        Peer::new("c1", ProtocolVersion::V1_2)
    }

    #[test]
    fn register_is_idempotent_per_path() {
        let registry = TopicRegistry::new(&HashMap::new());
        let p = peer();
        let a = registry.register(&p, "sensors/temp");
        let b = registry.register(&p, "sensors/temp");
        assert_eq!(a, b);
        assert_ne!(registry.register(&p, "sensors/rh"), a);
    }

    #[test]
    fn predefined_topics_win_over_aliases() {
        let mut predefined = HashMap::new();
        predefined.insert("control/reboot".to_string(), 42);
        let registry = TopicRegistry::new(&predefined);
        let p = peer();
        let info = registry.info_for_path(&p, "control/reboot").unwrap();
        assert_eq!(info.kind, TopicIdKind::Predefined);
        assert_eq!(info.topic_id, 42);
        assert_eq!(
            registry.path_for(&p, TopicIdKind::Predefined, 42).unwrap(),
            "control/reboot"
        );
    }

    #[test]
    fn short_topics_need_no_registration() {
        let registry = TopicRegistry::new(&HashMap::new());
        let info = registry.info_for_path(&peer(), "ab").unwrap();
        assert_eq!(info.kind, TopicIdKind::Short);
        assert_eq!(
            registry.path_for(&peer(), TopicIdKind::Short, info.topic_id),
            Some("ab".to_string())
        );
    }

    #[test]
    fn unregistered_normal_topic_has_no_wire_form() {
        let registry = TopicRegistry::new(&HashMap::new());
        assert!(registry.info_for_path(&peer(), "sensors/temp").is_none());
    }

    #[test]
    fn filter_matching() {
        assert!(topic_matches("sensors/+/temp", "sensors/kitchen/temp"));
        assert!(topic_matches("sensors/#", "sensors/kitchen/temp"));
        assert!(topic_matches("sensors/kitchen/temp", "sensors/kitchen/temp"));
        assert!(!topic_matches("sensors/+", "sensors/kitchen/temp"));
        assert!(!topic_matches("sensors/#", "actuators/kitchen"));
        assert!(topic_matches("#", "anything/at/all"));
    }

    #[test]
    fn publish_topics_reject_wildcards() {
        assert!(check_publish_topic("sensors/temp").is_ok());
        assert!(check_publish_topic("sensors/+/temp").is_err());
        assert!(check_publish_topic("").is_err());
    }
}
