//! Binary wire protocol
//!
//! Packet model, binary codec with privacy padding, and the
//! fragmentation engine for frames exceeding the BLE payload budget.

mod binary;
mod fragment;
mod types;

pub use binary::{decode, encode, signable_bytes, MessagePadding, MIN_PACKET_SIZE};
pub use fragment::{
    fragment_packet, FragmentHeader, FragmentReassembler, SlotState, FRAGMENT_PAYLOAD_SIZE,
    FRAGMENT_THRESHOLD,
};
pub use types::{
    now_millis, BitchatMessage, BitchatPacket, DeliveryInfo, DeliveryStatus, MessageType,
    PacketId, PeerId, BROADCAST_PEER, MAX_TTL, PROTOCOL_VERSION,
};
