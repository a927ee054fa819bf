//! Fragmentation and reassembly
//!
//! BLE frames are capped at 512 bytes on the air, so larger encoded
//! packets are split into paced fragment bursts and stitched back
//! together on arrival. Fragments relay through the mesh like any other
//! packet; reassembly happens wherever all pieces meet.

use rand::RngCore;
use std::collections::HashMap;
use std::time::{Duration, Instant};

use super::binary::encode;
use super::types::{BitchatPacket, MessageType};
use crate::error::ProtocolError;

/// Encoded packets above this size are fragmented
pub const FRAGMENT_THRESHOLD: usize = 512;

/// Largest slice carried by one fragment, leaving room for the headers
pub const FRAGMENT_PAYLOAD_SIZE: usize = 480;

/// Bytes of fragment metadata preceding the slice
const FRAGMENT_HEADER_SIZE: usize = 6;

/// Metadata prefix of every fragment payload
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FragmentHeader {
    /// Opaque id grouping the fragments of one original packet
    pub fragment_id: [u8; 4],
    /// Zero-based position of this slice
    pub index: u8,
    /// Total number of fragments in the burst
    pub total: u8,
}

impl FragmentHeader {
    /// Serialize the header followed by the slice
    pub fn encode_with_slice(&self, slice: &[u8]) -> Vec<u8> {
        let mut payload = Vec::with_capacity(FRAGMENT_HEADER_SIZE + slice.len());
        payload.extend_from_slice(&self.fragment_id);
        payload.push(self.index);
        payload.push(self.total);
        payload.extend_from_slice(slice);
        payload
    }

    /// Split a fragment payload into header and slice
    pub fn parse(payload: &[u8]) -> Result<(Self, &[u8]), ProtocolError> {
        if payload.len() < FRAGMENT_HEADER_SIZE {
            return Err(ProtocolError::InvalidFragment);
        }
        let mut fragment_id = [0u8; 4];
        fragment_id.copy_from_slice(&payload[..4]);
        let header = Self {
            fragment_id,
            index: payload[4],
            total: payload[5],
        };
        if header.total == 0 || header.index >= header.total {
            return Err(ProtocolError::InvalidFragment);
        }
        Ok((header, &payload[FRAGMENT_HEADER_SIZE..]))
    }
}

/// Fragment type for a given position in the burst
fn fragment_type(index: usize, total: usize) -> MessageType {
    if index == 0 {
        MessageType::FragmentStart
    } else if index == total - 1 {
        MessageType::FragmentEnd
    } else {
        MessageType::FragmentContinue
    }
}

/// Split a packet into fragments when its encoding exceeds the air budget
///
/// Returns `None` when the packet fits in a single frame. Fragments carry
/// the originator's sender, recipient and TTL so they relay normally.
pub fn fragment_packet(
    packet: &BitchatPacket,
) -> Result<Option<Vec<BitchatPacket>>, ProtocolError> {
    let encoded = encode(packet);
    if encoded.len() <= FRAGMENT_THRESHOLD {
        return Ok(None);
    }

    let total = encoded.len().div_ceil(FRAGMENT_PAYLOAD_SIZE);
    if total > u8::MAX as usize {
        return Err(ProtocolError::PayloadTooLarge(encoded.len()));
    }

    let mut fragment_id = [0u8; 4];
    rand::thread_rng().fill_bytes(&mut fragment_id);

    let fragments = encoded
        .chunks(FRAGMENT_PAYLOAD_SIZE)
        .enumerate()
        .map(|(index, slice)| {
            let header = FragmentHeader {
                fragment_id,
                index: index as u8,
                total: total as u8,
            };
            BitchatPacket {
                version: packet.version,
                message_type: fragment_type(index, total),
                sender_id: packet.sender_id,
                recipient_id: packet.recipient_id,
                timestamp: packet.timestamp,
                payload: header.encode_with_slice(slice),
                signature: None,
                ttl: packet.ttl,
            }
        })
        .collect();

    Ok(Some(fragments))
}

/// Observable state of a reassembly slot
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotState {
    /// No slot exists for the id
    Empty,
    /// Some fragments stored, waiting for the rest
    Partial { received: u8, total: u8 },
}

/// One in-flight reassembly
struct Slot {
    started: Instant,
    total: u8,
    parts: HashMap<u8, Vec<u8>>,
}

/// Collects fragments and reproduces the original encoded packet
///
/// Slots are keyed by the hex fragment id. Completion and expiry both
/// free the slot. Duplicate indices overwrite idempotently, so replays
/// and retransmissions are harmless.
pub struct FragmentReassembler {
    slots: HashMap<String, Slot>,
    timeout: Duration,
}

impl FragmentReassembler {
    /// Create a reassembler whose slots expire after `timeout`
    pub fn new(timeout: Duration) -> Self {
        Self {
            slots: HashMap::new(),
            timeout,
        }
    }

    /// Feed one fragment packet
    ///
    /// Returns the reassembled original encoding once the final missing
    /// piece arrives, `None` while the slot is still partial.
    pub fn accept(&mut self, packet: &BitchatPacket) -> Result<Option<Vec<u8>>, ProtocolError> {
        let (header, slice) = FragmentHeader::parse(&packet.payload)?;
        let key = hex::encode(header.fragment_id);

        let slot = self.slots.entry(key.clone()).or_insert_with(|| Slot {
            started: Instant::now(),
            total: header.total,
            parts: HashMap::new(),
        });

        // A mismatched total under the same id means colliding bursts;
        // keep the slot's original expectation.
        slot.parts.insert(header.index, slice.to_vec());

        if slot.parts.len() as u8 == slot.total {
            let slot = self.slots.remove(&key).expect("slot present");
            let mut assembled = Vec::new();
            for index in 0..slot.total {
                match slot.parts.get(&index) {
                    Some(part) => assembled.extend_from_slice(part),
                    None => return Err(ProtocolError::InvalidFragment),
                }
            }
            return Ok(Some(assembled));
        }

        Ok(None)
    }

    /// State of the slot for a fragment id
    pub fn state_of(&self, fragment_id: &[u8; 4]) -> SlotState {
        match self.slots.get(&hex::encode(fragment_id)) {
            Some(slot) => SlotState::Partial {
                received: slot.parts.len() as u8,
                total: slot.total,
            },
            None => SlotState::Empty,
        }
    }

    /// Drop slots older than the timeout, returning how many were freed
    pub fn purge_expired(&mut self) -> usize {
        let deadline = Instant::now();
        let timeout = self.timeout;
        let before = self.slots.len();
        self.slots
            .retain(|_, slot| deadline.duration_since(slot.started) < timeout);
        before - self.slots.len()
    }

    /// Number of in-flight slots
    pub fn pending(&self) -> usize {
        self.slots.len()
    }
}
