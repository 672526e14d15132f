//! Per-peer message queues.
//!
//! Publishes wait here until the flush scheduler drains them through the
//! state service. Queues are bounded; a full queue refuses the offer and the
//! caller decides whether that is fatal (fresh publish) or tolerable
//! (requeue on a dying session).

use std::collections::{HashMap, VecDeque};

use parking_lot::Mutex;

use crate::peers::Peer;
use crate::state::{QueuedPublish, StateError};

pub struct MessageQueue {
    max_depth: usize,
    queues: Mutex<HashMap<Peer, VecDeque<QueuedPublish>>>,
}

impl MessageQueue {
    pub fn new(max_depth: usize) -> Self {
        Self {
            max_depth: max_depth.max(1),
            queues: Mutex::new(HashMap::new()),
        }
    }

    /// Append a publish for the peer; fails when the queue is full.
    pub fn offer(&self, peer: &Peer, message: QueuedPublish) -> Result<(), StateError> {
        let mut queues = self.queues.lock();
        let queue = queues.entry(peer.clone()).or_default();
        if queue.len() >= self.max_depth {
            return Err(StateError::QueueAccept(format!(
                "queue for {peer} is at capacity ({})",
                self.max_depth
            )));
        }
        queue.push_back(message);
        Ok(())
    }

    /// Pop the next publish, bumping its delivery attempt counter.
    pub fn poll(&self, peer: &Peer) -> Option<QueuedPublish> {
        let mut queues = self.queues.lock();
        let queue = queues.get_mut(peer)?;
        let mut message = queue.pop_front()?;
        if queue.is_empty() {
            queues.remove(peer);
        }
        message.retry_count += 1;
        Some(message)
    }

    /// Read the head without consuming it.
    pub fn peek(&self, peer: &Peer) -> Option<QueuedPublish> {
        self.queues.lock().get(peer)?.front().cloned()
    }

    pub fn depth(&self, peer: &Peer) -> usize {
        self.queues.lock().get(peer).map_or(0, VecDeque::len)
    }

    pub fn clear(&self, peer: &Peer) {
        self.queues.lock().remove(peer);
    }

    pub fn total_depth(&self) -> usize {
        self.queues.lock().values().map(VecDeque::len).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::{ProtocolVersion, Qos};
    use uuid::Uuid;

    fn peer() -> Peer {
        Peer::new("c1", ProtocolVersion::V1_2)
    }

    fn publish() -> QueuedPublish {
        QueuedPublish::new(Uuid::new_v4(), "sensors/temp", Qos::AtLeastOnce, false)
    }

    #[test]
    fn poll_is_fifo_and_counts_attempts() {
        let queue = MessageQueue::new(4);
        let p = peer();
        let first = publish();
        let second = publish();
        queue.offer(&p, first.clone()).unwrap();
        queue.offer(&p, second.clone()).unwrap();

        let polled = queue.poll(&p).unwrap();
        assert_eq!(polled.message_id, first.message_id);
        assert_eq!(polled.retry_count, 1);
        assert_eq!(queue.depth(&p), 1);
    }

    #[test]
    fn full_queue_refuses_the_offer() {
        let queue = MessageQueue::new(1);
        let p = peer();
        queue.offer(&p, publish()).unwrap();
        assert!(matches!(
            queue.offer(&p, publish()),
            Err(StateError::QueueAccept(_))
        ));
    }

    #[test]
    fn requeued_messages_keep_their_attempt_count() {
        let queue = MessageQueue::new(4);
        let p = peer();
        queue.offer(&p, publish()).unwrap();
        let polled = queue.poll(&p).unwrap();
        queue.offer(&p, polled).unwrap();
        assert_eq!(queue.poll(&p).unwrap().retry_count, 2);
    }
}
