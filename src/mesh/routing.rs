//! Routing and deduplication
//!
//! Tracks which packet ids have been seen, enforces the TTL hop budget,
//! keeps a best-metric next-hop table, and silently drops traffic for
//! blocked peers.

use std::collections::{HashMap, HashSet};
use std::time::Duration;

use crate::protocol::{BitchatPacket, PacketId, PeerId};
use crate::util::ExpiringSet;

/// A route toward a destination
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Route {
    pub next_hop: PeerId,
    pub metric: i32,
}

/// Dedup, TTL and next-hop bookkeeping for the mesh
pub struct MessageRouter {
    seen: ExpiringSet<PacketId>,
    routes: HashMap<PeerId, Route>,
    blocked: HashSet<PeerId>,
    default_ttl: u8,
}

impl MessageRouter {
    /// Create a router with the given dedup window and origin TTL
    pub fn new(seen_ttl: Duration, default_ttl: u8) -> Self {
        Self {
            seen: ExpiringSet::new(seen_ttl),
            routes: HashMap::new(),
            blocked: HashSet::new(),
            default_ttl,
        }
    }

    /// Record a packet id, returning `false` when it is a replay
    pub fn check_and_record(&mut self, id: PacketId) -> bool {
        self.seen.check_and_insert(id)
    }

    /// Whether a packet id has been seen within the dedup window
    pub fn has_seen(&self, id: &PacketId) -> bool {
        self.seen.contains(id)
    }

    /// Decrement the TTL in place; `false` when the hop budget is spent
    pub fn decrement_and_check_ttl(&self, packet: &mut BitchatPacket) -> bool {
        if packet.ttl == 0 {
            return false;
        }
        packet.ttl -= 1;
        true
    }

    /// Stamp the default TTL on a packet that has none
    pub fn prepare_outgoing(&self, packet: &mut BitchatPacket) {
        if packet.ttl == 0 {
            packet.ttl = self.default_ttl;
        }
    }

    /// Whether a decoded packet may be forwarded at all
    ///
    /// Unknown protocol versions are consumed locally but never relayed.
    pub fn relay_allowed(&self, packet: &BitchatPacket) -> bool {
        packet.version == crate::protocol::PROTOCOL_VERSION
            && packet.ttl > 0
            && !self.is_blocked(&packet.sender_id)
            && !packet
                .recipient_id
                .map(|recipient| self.is_blocked(&recipient))
                .unwrap_or(false)
    }

    /// Install or improve a route from a link observation
    ///
    /// A route replaces the current one only when none exists or the
    /// observed metric is better.
    pub fn update_route(&mut self, dest: PeerId, next_hop: Option<PeerId>, metric: i32) {
        let next_hop = next_hop.unwrap_or(dest);
        match self.routes.get(&dest) {
            Some(existing) if existing.metric >= metric => {}
            _ => {
                self.routes.insert(dest, Route { next_hop, metric });
            }
        }
    }

    /// Next hop toward a destination, if one is known
    pub fn next_hop(&self, dest: &PeerId) -> Option<Route> {
        self.routes.get(dest).copied()
    }

    /// Remove a peer and every route that goes through it
    pub fn remove_peer(&mut self, peer: &PeerId) {
        self.routes.remove(peer);
        self.routes.retain(|_, route| route.next_hop != *peer);
    }

    /// Destinations reached in a single hop
    pub fn direct_peers(&self) -> Vec<PeerId> {
        self.routes
            .iter()
            .filter(|(dest, route)| **dest == route.next_hop)
            .map(|(dest, _)| *dest)
            .collect()
    }

    /// Every destination with a route
    pub fn known_peers(&self) -> Vec<PeerId> {
        self.routes.keys().copied().collect()
    }

    /// Silence a peer in both directions
    pub fn block(&mut self, peer: PeerId) {
        self.blocked.insert(peer);
    }

    /// Lift a block
    pub fn unblock(&mut self, peer: &PeerId) {
        self.blocked.remove(peer);
    }

    /// Whether traffic from or to the peer is dropped
    pub fn is_blocked(&self, peer: &PeerId) -> bool {
        self.blocked.contains(peer)
    }

    /// Reclaim memory for expired dedup entries
    pub fn purge_seen(&mut self) {
        self.seen.purge_expired();
    }

    /// Forget all routes and dedup state
    pub fn clear(&mut self) {
        self.routes.clear();
        self.seen.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{MessageType, PROTOCOL_VERSION};

    fn router() -> MessageRouter {
        MessageRouter::new(Duration::from_secs(300), 7)
    }

    fn packet(ttl: u8) -> BitchatPacket {
        BitchatPacket::new_broadcast(MessageType::Message, PeerId([1; 8]), b"x".to_vec())
            .with_ttl(ttl)
    }

    #[test]
    fn test_dedup() {
        let mut router = router();
        let id = packet(3).packet_id();
        assert!(router.check_and_record(id));
        assert!(!router.check_and_record(id));
        assert!(router.has_seen(&id));
    }

    #[test]
    fn test_ttl_decrement() {
        let router = router();
        let mut p = packet(2);
        assert!(router.decrement_and_check_ttl(&mut p));
        assert_eq!(p.ttl, 1);
        assert!(router.decrement_and_check_ttl(&mut p));
        assert_eq!(p.ttl, 0);
        assert!(!router.decrement_and_check_ttl(&mut p));
    }

    #[test]
    fn test_prepare_outgoing() {
        let router = router();
        let mut p = packet(0);
        router.prepare_outgoing(&mut p);
        assert_eq!(p.ttl, 7);

        let mut explicit = packet(2);
        router.prepare_outgoing(&mut explicit);
        assert_eq!(explicit.ttl, 2);
    }

    #[test]
    fn test_relay_policy() {
        let mut router = router();
        let mut p = packet(3);
        assert!(router.relay_allowed(&p));

        p.version = PROTOCOL_VERSION + 1;
        assert!(!router.relay_allowed(&p));
        p.version = PROTOCOL_VERSION;

        p.ttl = 0;
        assert!(!router.relay_allowed(&p));
        p.ttl = 3;

        router.block(p.sender_id);
        assert!(!router.relay_allowed(&p));
        router.unblock(&p.sender_id);
        assert!(router.relay_allowed(&p));
    }

    #[test]
    fn test_best_metric_wins() {
        let mut router = router();
        let dest = PeerId([2; 8]);
        let via_a = PeerId([0xA; 8]);
        let via_b = PeerId([0xB; 8]);

        router.update_route(dest, Some(via_a), 40);
        router.update_route(dest, Some(via_b), 20);
        assert_eq!(router.next_hop(&dest).unwrap().next_hop, via_a);

        router.update_route(dest, Some(via_b), 80);
        assert_eq!(router.next_hop(&dest).unwrap().next_hop, via_b);
    }

    #[test]
    fn test_remove_peer_cascades() {
        let mut router = router();
        let hop = PeerId([2; 8]);
        let far = PeerId([3; 8]);
        router.update_route(hop, None, 90);
        router.update_route(far, Some(hop), 50);
        assert_eq!(router.direct_peers(), vec![hop]);

        router.remove_peer(&hop);
        assert!(router.next_hop(&hop).is_none());
        assert!(router.next_hop(&far).is_none());
        assert!(router.known_peers().is_empty());
    }

    #[test]
    fn test_direct_route_defaults_to_dest() {
        let mut router = router();
        let peer = PeerId([4; 8]);
        router.update_route(peer, None, 10);
        let route = router.next_hop(&peer).unwrap();
        assert_eq!(route.next_hop, peer);
    }
}
