//! Packet and message model
//!
//! Core types shared across the pipeline: the wire packet, the derived
//! packet id, peer ids and the delegate-facing chat message record.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;

/// Protocol version stamped on every packet
pub const PROTOCOL_VERSION: u8 = 1;

/// Maximum TTL at packet origin; one hop consumes one unit
pub const MAX_TTL: u8 = 7;

/// Recipient id meaning "every peer"
pub const BROADCAST_PEER: PeerId = PeerId([0xFF; 8]);

/// Message type enumeration
///
/// Unknown codes are preserved so a frame from a newer peer can still be
/// consumed locally; they are never dispatched or relayed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MessageType {
    Announce,
    KeyExchange,
    Leave,
    Message,
    FragmentStart,
    FragmentContinue,
    FragmentEnd,
    ChannelAnnounce,
    ChannelRetention,
    DeliveryAck,
    DeliveryStatusRequest,
    ReadReceipt,
    Unknown(u8),
}

impl MessageType {
    /// Wire code for this type
    pub fn code(&self) -> u8 {
        match self {
            MessageType::Announce => 0x01,
            MessageType::KeyExchange => 0x02,
            MessageType::Leave => 0x03,
            MessageType::Message => 0x04,
            MessageType::FragmentStart => 0x05,
            MessageType::FragmentContinue => 0x06,
            MessageType::FragmentEnd => 0x07,
            MessageType::ChannelAnnounce => 0x08,
            MessageType::ChannelRetention => 0x09,
            MessageType::DeliveryAck => 0x0A,
            MessageType::DeliveryStatusRequest => 0x0B,
            MessageType::ReadReceipt => 0x0C,
            MessageType::Unknown(code) => *code,
        }
    }

    /// Map a wire code to a type
    pub fn from_code(code: u8) -> Self {
        match code {
            0x01 => MessageType::Announce,
            0x02 => MessageType::KeyExchange,
            0x03 => MessageType::Leave,
            0x04 => MessageType::Message,
            0x05 => MessageType::FragmentStart,
            0x06 => MessageType::FragmentContinue,
            0x07 => MessageType::FragmentEnd,
            0x08 => MessageType::ChannelAnnounce,
            0x09 => MessageType::ChannelRetention,
            0x0A => MessageType::DeliveryAck,
            0x0B => MessageType::DeliveryStatusRequest,
            0x0C => MessageType::ReadReceipt,
            other => MessageType::Unknown(other),
        }
    }

    /// Whether this is one of the three fragment types
    pub fn is_fragment(&self) -> bool {
        matches!(
            self,
            MessageType::FragmentStart | MessageType::FragmentContinue | MessageType::FragmentEnd
        )
    }
}

/// 8-byte opaque peer identifier
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PeerId(pub [u8; 8]);

impl PeerId {
    /// Parse from raw bytes; anything but 8 bytes is rejected
    pub fn from_bytes(bytes: &[u8]) -> Option<Self> {
        let array: [u8; 8] = bytes.try_into().ok()?;
        Some(Self(array))
    }

    /// Parse from a 16-character hex string
    pub fn from_hex(s: &str) -> Option<Self> {
        let bytes = hex::decode(s).ok()?;
        Self::from_bytes(&bytes)
    }

    /// Raw id bytes
    pub fn as_bytes(&self) -> &[u8; 8] {
        &self.0
    }

    /// Whether this is the all-0xFF broadcast id
    pub fn is_broadcast(&self) -> bool {
        self.0 == [0xFF; 8]
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(self.0))
    }
}

impl fmt::Debug for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PeerId({})", hex::encode(self.0))
    }
}

/// 128-bit packet identifier used for deduplication and delivery tracking
///
/// Derived deterministically from the wire fields so that every node
/// computes the same id for the same frame.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PacketId(pub [u8; 16]);

impl PacketId {
    /// Parse from raw bytes; anything but 16 bytes is rejected
    pub fn from_bytes(bytes: &[u8]) -> Option<Self> {
        let array: [u8; 16] = bytes.try_into().ok()?;
        Some(Self(array))
    }

    /// Raw id bytes
    pub fn as_bytes(&self) -> &[u8; 16] {
        &self.0
    }
}

impl fmt::Display for PacketId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(self.0))
    }
}

impl fmt::Debug for PacketId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PacketId({})", hex::encode(self.0))
    }
}

/// Current wall-clock time as milliseconds since the Unix epoch
pub fn now_millis() -> u64 {
    chrono::Utc::now().timestamp_millis() as u64
}

/// The atomic wire unit
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BitchatPacket {
    pub version: u8,
    pub message_type: MessageType,
    pub sender_id: PeerId,
    pub recipient_id: Option<PeerId>,
    /// Wall-clock milliseconds since the Unix epoch; never used for liveness
    pub timestamp: u64,
    pub payload: Vec<u8>,
    pub signature: Option<Vec<u8>>,
    pub ttl: u8,
}

impl BitchatPacket {
    /// Create a packet with default version and TTL
    pub fn new(
        message_type: MessageType,
        sender_id: PeerId,
        recipient_id: Option<PeerId>,
        payload: Vec<u8>,
    ) -> Self {
        Self {
            version: PROTOCOL_VERSION,
            message_type,
            sender_id,
            recipient_id,
            timestamp: now_millis(),
            payload,
            signature: None,
            ttl: MAX_TTL,
        }
    }

    /// Create a packet addressed to every peer
    pub fn new_broadcast(message_type: MessageType, sender_id: PeerId, payload: Vec<u8>) -> Self {
        Self::new(message_type, sender_id, Some(BROADCAST_PEER), payload)
    }

    /// Set the TTL, builder style
    pub fn with_ttl(mut self, ttl: u8) -> Self {
        self.ttl = ttl;
        self
    }

    /// Derive the 128-bit packet id
    ///
    /// SHA-256 over timestamp, type, sender, recipient and a 16-byte
    /// payload prefix, truncated to 16 bytes. Deterministic so dedup and
    /// delivery acks agree across nodes.
    pub fn packet_id(&self) -> PacketId {
        let mut hasher = Sha256::new();
        hasher.update(self.timestamp.to_be_bytes());
        hasher.update([self.message_type.code()]);
        hasher.update(self.sender_id.as_bytes());
        if let Some(recipient) = &self.recipient_id {
            hasher.update(recipient.as_bytes());
        }
        let prefix_len = self.payload.len().min(16);
        hasher.update(&self.payload[..prefix_len]);
        let digest = hasher.finalize();
        let mut id = [0u8; 16];
        id.copy_from_slice(&digest[..16]);
        PacketId(id)
    }

    /// Whether the packet is addressed to every peer
    pub fn is_broadcast(&self) -> bool {
        self.recipient_id.map(|r| r.is_broadcast()).unwrap_or(false)
    }

    /// Whether the packet should be consumed by the given local peer
    pub fn is_for(&self, local: &PeerId) -> bool {
        match &self.recipient_id {
            Some(recipient) => recipient.is_broadcast() || recipient == local,
            None => false,
        }
    }
}

/// Delivery state of an outbound message
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DeliveryStatus {
    Sending,
    Sent,
    Delivered,
    Read,
    Failed,
    PartiallyDelivered,
}

/// Detail attached to a delivery status change
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeliveryInfo {
    pub status: DeliveryStatus,
    pub recipient: Option<PeerId>,
    /// Wall-clock milliseconds of the transition
    pub timestamp: u64,
    pub attempts: u32,
    pub fail_reason: Option<String>,
}

impl DeliveryInfo {
    /// Info for a successful delivery
    pub fn delivered(recipient: Option<PeerId>, attempts: u32) -> Self {
        Self {
            status: DeliveryStatus::Delivered,
            recipient,
            timestamp: now_millis(),
            attempts,
            fail_reason: None,
        }
    }

    /// Info for a failed delivery
    pub fn failed(reason: &str, attempts: u32) -> Self {
        Self {
            status: DeliveryStatus::Failed,
            recipient: None,
            timestamp: now_millis(),
            attempts,
            fail_reason: Some(reason.to_string()),
        }
    }
}

/// Delegate-facing chat message record
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BitchatMessage {
    pub id: PacketId,
    pub sender_nickname: String,
    pub sender_id: PeerId,
    pub content: String,
    /// Wall-clock milliseconds from the originating packet
    pub timestamp: u64,
    pub is_private: bool,
    pub is_relay: bool,
    pub is_encrypted: bool,
    pub channel: Option<String>,
    pub mentions: Vec<String>,
    pub delivery_status: Option<DeliveryStatus>,
}

impl BitchatMessage {
    /// Nicknames mentioned as `@name` in the content
    pub fn extract_mentions(content: &str) -> Vec<String> {
        content
            .split_whitespace()
            .filter_map(|word| word.strip_prefix('@'))
            .map(|name| name.trim_end_matches(|c: char| !c.is_alphanumeric()))
            .filter(|name| !name.is_empty())
            .map(str::to_string)
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_message_type_roundtrip() {
        for code in 0x01..=0x0C {
            assert_eq!(MessageType::from_code(code).code(), code);
        }
        assert_eq!(MessageType::from_code(0xE7), MessageType::Unknown(0xE7));
        assert!(MessageType::FragmentContinue.is_fragment());
        assert!(!MessageType::Message.is_fragment());
    }

    #[test]
    fn test_peer_id_hex() {
        let id = PeerId([0xDE, 0xAD, 0xBE, 0xEF, 0x00, 0x11, 0x22, 0x33]);
        assert_eq!(id.to_string(), "deadbeef00112233");
        assert_eq!(PeerId::from_hex("deadbeef00112233"), Some(id));
        assert_eq!(PeerId::from_bytes(&[1, 2, 3]), None);
        assert!(BROADCAST_PEER.is_broadcast());
        assert!(!id.is_broadcast());
    }

    #[test]
    fn test_packet_id_deterministic() {
        let packet = BitchatPacket::new_broadcast(
            MessageType::Message,
            PeerId([1; 8]),
            b"hello mesh".to_vec(),
        );
        let a = packet.packet_id();
        let b = packet.clone().packet_id();
        assert_eq!(a, b);

        let mut other = packet.clone();
        other.payload = b"another".to_vec();
        assert_ne!(a, other.packet_id());

        // TTL mutation on relay must not change the id.
        let mut relayed = packet;
        relayed.ttl -= 1;
        assert_eq!(a, relayed.packet_id());
    }

    #[test]
    fn test_addressing() {
        let local = PeerId([7; 8]);
        let other = PeerId([9; 8]);
        let broadcast =
            BitchatPacket::new_broadcast(MessageType::Message, other, vec![]);
        assert!(broadcast.is_broadcast());
        assert!(broadcast.is_for(&local));

        let private =
            BitchatPacket::new(MessageType::Message, other, Some(local), vec![]);
        assert!(!private.is_broadcast());
        assert!(private.is_for(&local));
        assert!(!private.is_for(&other));
    }

    #[test]
    fn test_extract_mentions() {
        let mentions = BitchatMessage::extract_mentions("hey @alice and @bob, ping @alice");
        assert_eq!(mentions, vec!["alice", "bob", "alice"]);
        assert!(BitchatMessage::extract_mentions("no mentions here").is_empty());
    }
}
