//! Binary packet codec
//!
//! Serializes packets into the compact big-endian wire format and back.
//! Also provides the block padding primitive used to hide plaintext
//! lengths from traffic observers.

use rand::RngCore;
use subtle::{Choice, ConditionallySelectable};

use super::types::{BitchatPacket, MessageType, PeerId};
use crate::error::ProtocolError;

/// Smallest frame the decoder will look at
pub const MIN_PACKET_SIZE: usize = 13;

/// Encode a packet into its wire representation
///
/// Layout: version, type, len8(sender), sender, len8(recipient)|0,
/// recipient?, u64-BE timestamp, u32-BE payload length, payload,
/// len8(signature)|0, signature?, TTL.
pub fn encode(packet: &BitchatPacket) -> Vec<u8> {
    let recipient_len = packet.recipient_id.map(|_| 8).unwrap_or(0);
    let signature_len = packet.signature.as_ref().map(|s| s.len()).unwrap_or(0);
    let mut buf = Vec::with_capacity(
        2 + 1 + 8 + 1 + recipient_len + 8 + 4 + packet.payload.len() + 1 + signature_len + 1,
    );

    buf.push(packet.version);
    buf.push(packet.message_type.code());

    buf.push(8);
    buf.extend_from_slice(packet.sender_id.as_bytes());

    match &packet.recipient_id {
        Some(recipient) => {
            buf.push(8);
            buf.extend_from_slice(recipient.as_bytes());
        }
        None => buf.push(0),
    }

    buf.extend_from_slice(&packet.timestamp.to_be_bytes());

    buf.extend_from_slice(&(packet.payload.len() as u32).to_be_bytes());
    buf.extend_from_slice(&packet.payload);

    match &packet.signature {
        Some(signature) => {
            buf.push(signature.len() as u8);
            buf.extend_from_slice(signature);
        }
        None => buf.push(0),
    }

    buf.push(packet.ttl);
    buf
}

/// Cursor over a frame with explicit bounds checking
struct Reader<'a> {
    data: &'a [u8],
    offset: usize,
}

impl<'a> Reader<'a> {
    fn new(data: &'a [u8]) -> Self {
        Self { data, offset: 0 }
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8], ProtocolError> {
        if self.offset + n > self.data.len() {
            return Err(ProtocolError::Truncated {
                needed: self.offset + n,
                available: self.data.len(),
            });
        }
        let slice = &self.data[self.offset..self.offset + n];
        self.offset += n;
        Ok(slice)
    }

    fn take_u8(&mut self) -> Result<u8, ProtocolError> {
        Ok(self.take(1)?[0])
    }

    fn take_u32(&mut self) -> Result<u32, ProtocolError> {
        let bytes = self.take(4)?;
        Ok(u32::from_be_bytes(bytes.try_into().unwrap()))
    }

    fn take_u64(&mut self) -> Result<u64, ProtocolError> {
        let bytes = self.take(8)?;
        Ok(u64::from_be_bytes(bytes.try_into().unwrap()))
    }
}

/// Decode a wire frame into a packet
///
/// Frames with an unknown version still decode; the relay policy refuses
/// to forward them. Any declared length overrunning the buffer fails with
/// `Truncated`.
pub fn decode(data: &[u8]) -> Result<BitchatPacket, ProtocolError> {
    if data.len() < MIN_PACKET_SIZE {
        return Err(ProtocolError::Truncated {
            needed: MIN_PACKET_SIZE,
            available: data.len(),
        });
    }

    let mut reader = Reader::new(data);

    let version = reader.take_u8()?;
    let message_type = MessageType::from_code(reader.take_u8()?);

    let sender_len = reader.take_u8()? as usize;
    let sender_id =
        PeerId::from_bytes(reader.take(sender_len)?).ok_or(ProtocolError::Truncated {
            needed: 8,
            available: sender_len,
        })?;

    let recipient_len = reader.take_u8()? as usize;
    let recipient_id = if recipient_len > 0 {
        Some(
            PeerId::from_bytes(reader.take(recipient_len)?).ok_or(ProtocolError::Truncated {
                needed: 8,
                available: recipient_len,
            })?,
        )
    } else {
        None
    };

    let timestamp = reader.take_u64()?;

    let payload_len = reader.take_u32()? as usize;
    let payload = reader.take(payload_len)?.to_vec();

    let signature_len = reader.take_u8()? as usize;
    let signature = if signature_len > 0 {
        Some(reader.take(signature_len)?.to_vec())
    } else {
        None
    };

    let ttl = reader.take_u8()?;

    Ok(BitchatPacket {
        version,
        message_type,
        sender_id,
        recipient_id,
        timestamp,
        payload,
        signature,
        ttl,
    })
}

/// The byte view covered by a packet signature
///
/// Version, type, sender, recipient, timestamp, a TTL slot and the
/// payload. The TTL slot is normalized to zero because the live value
/// mutates at every hop.
pub fn signable_bytes(packet: &BitchatPacket) -> Vec<u8> {
    let mut buf = Vec::with_capacity(2 + 8 + 8 + 8 + 1 + packet.payload.len());
    buf.push(packet.version);
    buf.push(packet.message_type.code());
    buf.extend_from_slice(packet.sender_id.as_bytes());
    if let Some(recipient) = &packet.recipient_id {
        buf.extend_from_slice(recipient.as_bytes());
    }
    buf.extend_from_slice(&packet.timestamp.to_be_bytes());
    buf.push(0);
    buf.extend_from_slice(&packet.payload);
    buf
}

/// Block padding for plaintext payloads
///
/// Pads to the smallest standard block that fits the data plus a 16-byte
/// cipher tag, filling with random bytes and recording the pad length in
/// the final byte.
pub struct MessagePadding;

/// Standard padded block sizes
const BLOCK_SIZES: [usize; 4] = [256, 512, 1024, 2048];

impl MessagePadding {
    /// Pad `data` up to `target` bytes
    ///
    /// Returns the data unchanged when it already reaches the target or
    /// when the pad length would not fit in the trailing length byte.
    pub fn pad(data: &[u8], target: usize) -> Vec<u8> {
        if data.len() >= target {
            return data.to_vec();
        }
        let padding = target - data.len();
        if padding > 255 {
            return data.to_vec();
        }

        let mut padded = Vec::with_capacity(target);
        padded.extend_from_slice(data);
        let mut fill = vec![0u8; padding - 1];
        rand::thread_rng().fill_bytes(&mut fill);
        padded.extend_from_slice(&fill);
        padded.push(padding as u8);
        padded
    }

    /// Remove padding, constant-time in the padding value
    ///
    /// The kept length is selected without branching on the pad byte so a
    /// forged trailer cannot be probed through timing.
    pub fn unpad(data: &[u8]) -> Vec<u8> {
        if data.is_empty() {
            return Vec::new();
        }
        let len = data.len() as u64;
        let pad = data[data.len() - 1] as u64;

        let nonzero = Choice::from((pad != 0) as u8);
        let fits = Choice::from((pad <= len) as u8);
        let valid = nonzero & fits;

        let stripped = len.wrapping_sub(pad);
        let keep = u64::conditional_select(&len, &stripped, valid) as usize;
        data[..keep].to_vec()
    }

    /// Smallest standard block that fits `data_len` plus a 16-byte tag
    ///
    /// Data too large for the biggest block is returned at its own size;
    /// such payloads get fragmented anyway.
    pub fn optimal_block_size(data_len: usize) -> usize {
        let total = data_len + 16;
        for block in BLOCK_SIZES {
            if total <= block {
                return block;
            }
        }
        data_len
    }

    /// Pad to the optimal block for the data length
    pub fn pad_to_block(data: &[u8]) -> Vec<u8> {
        Self::pad(data, Self::optimal_block_size(data.len()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::types::{BROADCAST_PEER, MAX_TTL, PROTOCOL_VERSION};

    fn sample_packet() -> BitchatPacket {
        BitchatPacket {
            version: PROTOCOL_VERSION,
            message_type: MessageType::Message,
            sender_id: PeerId([1, 2, 3, 4, 5, 6, 7, 8]),
            recipient_id: Some(PeerId([9, 10, 11, 12, 13, 14, 15, 16])),
            timestamp: 1_700_000_000_123,
            payload: b"mesh payload".to_vec(),
            signature: Some(vec![0xAB; 64]),
            ttl: 5,
        }
    }

    #[test]
    fn test_encode_decode_roundtrip() {
        let original = sample_packet();
        let wire = encode(&original);
        let decoded = decode(&wire).unwrap();
        assert_eq!(original, decoded);
    }

    #[test]
    fn test_roundtrip_without_optionals() {
        let mut packet = sample_packet();
        packet.recipient_id = None;
        packet.signature = None;
        packet.payload = Vec::new();
        let decoded = decode(&encode(&packet)).unwrap();
        assert_eq!(packet, decoded);
    }

    #[test]
    fn test_encode_is_stable() {
        let packet = sample_packet();
        assert_eq!(encode(&packet), encode(&packet));
    }

    #[test]
    fn test_wire_layout() {
        let packet = BitchatPacket {
            version: 1,
            message_type: MessageType::Announce,
            sender_id: PeerId([0x11; 8]),
            recipient_id: Some(BROADCAST_PEER),
            timestamp: 0x0102030405060708,
            payload: vec![0xAA, 0xBB],
            signature: None,
            ttl: MAX_TTL,
        };
        let wire = encode(&packet);
        assert_eq!(wire[0], 1);
        assert_eq!(wire[1], 0x01);
        assert_eq!(wire[2], 8);
        assert_eq!(&wire[3..11], &[0x11; 8]);
        assert_eq!(wire[11], 8);
        assert_eq!(&wire[12..20], &[0xFF; 8]);
        assert_eq!(&wire[20..28], &[1, 2, 3, 4, 5, 6, 7, 8]);
        assert_eq!(&wire[28..32], &[0, 0, 0, 2]);
        assert_eq!(&wire[32..34], &[0xAA, 0xBB]);
        assert_eq!(wire[34], 0);
        assert_eq!(wire[35], MAX_TTL);
        assert_eq!(wire.len(), 36);
    }

    #[test]
    fn test_truncated_frames() {
        let wire = encode(&sample_packet());
        assert!(decode(&wire[..4]).is_err());
        // Every prefix short of the full frame must fail, not panic.
        for cut in MIN_PACKET_SIZE..wire.len() {
            assert!(decode(&wire[..cut]).is_err(), "cut at {cut} decoded");
        }
    }

    #[test]
    fn test_declared_payload_overrun() {
        let mut wire = encode(&sample_packet());
        // Inflate the declared payload length past the buffer end.
        wire[28] = 0xFF;
        assert!(matches!(
            decode(&wire),
            Err(ProtocolError::Truncated { .. })
        ));
    }

    #[test]
    fn test_unknown_version_decodes() {
        let mut packet = sample_packet();
        packet.version = 9;
        let decoded = decode(&encode(&packet)).unwrap();
        assert_eq!(decoded.version, 9);
    }

    #[test]
    fn test_signable_view_ignores_ttl() {
        let packet = sample_packet();
        let mut relayed = packet.clone();
        relayed.ttl -= 1;
        assert_eq!(signable_bytes(&packet), signable_bytes(&relayed));

        let mut other = packet;
        other.payload.push(0);
        assert_ne!(signable_bytes(&other), signable_bytes(&relayed));
    }

    #[test]
    fn test_padding_roundtrip() {
        let data = b"short secret".to_vec();
        let padded = MessagePadding::pad_to_block(&data);
        assert_eq!(padded.len(), 256);
        assert_eq!(MessagePadding::unpad(&padded), data);
    }

    #[test]
    fn test_padding_skips_oversize() {
        // A pad of more than 255 bytes cannot be encoded in one byte.
        let data = vec![0x42; 100];
        assert_eq!(MessagePadding::pad(&data, 1024), data);
        // Data already at or past the target is untouched.
        let big = vec![0x42; 600];
        assert_eq!(MessagePadding::pad(&big, 512), big);
    }

    #[test]
    fn test_optimal_block_size() {
        assert_eq!(MessagePadding::optimal_block_size(10), 256);
        assert_eq!(MessagePadding::optimal_block_size(240), 256);
        assert_eq!(MessagePadding::optimal_block_size(241), 512);
        assert_eq!(MessagePadding::optimal_block_size(1000), 1024);
        assert_eq!(MessagePadding::optimal_block_size(4000), 4000);
    }

    #[test]
    fn test_unpad_rejects_forged_trailer() {
        let mut data = vec![1, 2, 3];
        data.push(200);
        // Pad byte larger than the buffer keeps the data intact.
        assert_eq!(MessagePadding::unpad(&data), data);
        assert_eq!(MessagePadding::unpad(&[]), Vec::<u8>::new());
    }
}
