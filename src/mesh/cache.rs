//! Store-and-forward message cache
//!
//! Recent packets are held for a bounded window so peers that reconnect
//! shortly after a transmission can still be served. Capacity-bounded;
//! when full, the oldest arrival is evicted.

use std::collections::{HashMap, HashSet};
use std::time::{Duration, Instant};

use crate::protocol::{BitchatPacket, PacketId, PeerId};

/// A cached packet with its delivery bookkeeping
pub struct CachedMessage {
    pub packet: BitchatPacket,
    pub received_at: Instant,
    pub expires_at: Instant,
    pub delivered_to: HashSet<PeerId>,
    pub original_sender: PeerId,
}

/// Bounded TTL cache of recent packets
pub struct MessageCache {
    messages: HashMap<PacketId, CachedMessage>,
    max_size: usize,
}

impl MessageCache {
    /// Create a cache holding at most `max_size` packets
    pub fn new(max_size: usize) -> Self {
        Self {
            messages: HashMap::new(),
            max_size,
        }
    }

    /// Insert a packet, evicting the oldest arrival when full
    ///
    /// Re-inserting a cached id is a no-op so delivery bookkeeping is
    /// preserved across duplicate arrivals.
    pub fn insert(&mut self, id: PacketId, packet: BitchatPacket, sender: PeerId, ttl: Duration) {
        if self.messages.contains_key(&id) {
            return;
        }

        if self.messages.len() >= self.max_size {
            let oldest = self
                .messages
                .iter()
                .min_by_key(|(_, cached)| cached.received_at)
                .map(|(oldest_id, _)| *oldest_id);
            if let Some(oldest_id) = oldest {
                self.messages.remove(&oldest_id);
            }
        }

        let now = Instant::now();
        self.messages.insert(
            id,
            CachedMessage {
                packet,
                received_at: now,
                expires_at: now + ttl,
                delivered_to: HashSet::new(),
                original_sender: sender,
            },
        );
    }

    /// Look up a cached packet
    pub fn get(&self, id: &PacketId) -> Option<&CachedMessage> {
        self.messages.get(id)
    }

    /// Record that a peer has received the cached packet
    pub fn mark_delivered(&mut self, id: &PacketId, peer: PeerId) {
        if let Some(cached) = self.messages.get_mut(id) {
            cached.delivered_to.insert(peer);
        }
    }

    /// Cached packets not yet delivered to the given peer
    ///
    /// Used to replay recent traffic to a peer that just (re)appeared.
    pub fn undelivered_for(&self, peer: &PeerId) -> Vec<(PacketId, BitchatPacket)> {
        self.messages
            .iter()
            .filter(|(_, cached)| {
                !cached.delivered_to.contains(peer) && cached.original_sender != *peer
            })
            .map(|(id, cached)| (*id, cached.packet.clone()))
            .collect()
    }

    /// Drop entries past their expiry, returning how many were removed
    pub fn purge_expired(&mut self) -> usize {
        let now = Instant::now();
        let before = self.messages.len();
        self.messages.retain(|_, cached| cached.expires_at > now);
        before - self.messages.len()
    }

    /// Number of cached packets
    pub fn len(&self) -> usize {
        self.messages.len()
    }

    /// Whether the cache is empty
    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    /// Drop everything
    pub fn clear(&mut self) {
        self.messages.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::MessageType;

    fn packet(tag: u8) -> (PacketId, BitchatPacket, PeerId) {
        let sender = PeerId([tag; 8]);
        let packet = BitchatPacket::new_broadcast(MessageType::Message, sender, vec![tag]);
        (packet.packet_id(), packet, sender)
    }

    #[test]
    fn test_insert_and_get() {
        let mut cache = MessageCache::new(10);
        let (id, p, sender) = packet(1);
        cache.insert(id, p, sender, Duration::from_secs(60));
        assert_eq!(cache.len(), 1);
        assert_eq!(cache.get(&id).unwrap().original_sender, sender);
    }

    #[test]
    fn test_capacity_evicts_oldest() {
        let mut cache = MessageCache::new(3);
        let mut first = None;
        for tag in 1..=4 {
            let (id, p, sender) = packet(tag);
            if first.is_none() {
                first = Some(id);
            }
            cache.insert(id, p, sender, Duration::from_secs(60));
        }
        assert_eq!(cache.len(), 3);
        assert!(cache.get(&first.unwrap()).is_none());
    }

    #[test]
    fn test_reinsert_preserves_bookkeeping() {
        let mut cache = MessageCache::new(10);
        let (id, p, sender) = packet(1);
        cache.insert(id, p.clone(), sender, Duration::from_secs(60));
        let peer = PeerId([9; 8]);
        cache.mark_delivered(&id, peer);
        cache.insert(id, p, sender, Duration::from_secs(60));
        assert!(cache.get(&id).unwrap().delivered_to.contains(&peer));
    }

    #[test]
    fn test_undelivered_for() {
        let mut cache = MessageCache::new(10);
        let (id, p, sender) = packet(1);
        cache.insert(id, p, sender, Duration::from_secs(60));

        let newcomer = PeerId([7; 8]);
        assert_eq!(cache.undelivered_for(&newcomer).len(), 1);

        cache.mark_delivered(&id, newcomer);
        assert!(cache.undelivered_for(&newcomer).is_empty());

        // The original sender never gets its own traffic replayed.
        assert!(cache.undelivered_for(&sender).is_empty());
    }

    #[test]
    fn test_purge_expired() {
        let mut cache = MessageCache::new(10);
        let (id, p, sender) = packet(1);
        cache.insert(id, p, sender, Duration::from_millis(0));
        let (id2, p2, sender2) = packet(2);
        cache.insert(id2, p2, sender2, Duration::from_secs(60));

        assert_eq!(cache.purge_expired(), 1);
        assert!(cache.get(&id).is_none());
        assert!(cache.get(&id2).is_some());
    }
}
