//! Bluetooth LE transport boundary
//!
//! The mesh kernel is radio-agnostic: the concrete driver (BlueZ,
//! CoreBluetooth, WinRT, or a simulator) lives behind the
//! [`PlatformProvider`] trait. This module carries the service
//! identifiers, the advertisement metadata codec, and the ingress handle
//! a driver uses to push received frames into the kernel.

use tokio::sync::mpsc;
use uuid::Uuid;

use crate::config::BatteryMode;
use crate::error::MeshError;
use crate::protocol::PeerId;

/// BLE service UUID advertised by every node
pub const SERVICE_UUID: &str = "6E400001-B5A3-F393-E0A9-E50E24DCCA9E";

/// Characteristic UUID for data exchange
pub const CHARACTERISTIC_UUID: &str = "6E400002-B5A3-F393-E0A9-E50E24DCCA9E";

/// ASCII marker opening the advertisement service data
pub const ADVERTISEMENT_PREFIX: &[u8; 5] = b"BTCHT";

/// Total advertisement metadata length: prefix, type, packet id, total
pub const ADVERTISEMENT_META_SIZE: usize = 5 + 1 + 32 + 1;

/// Maximum over-the-air frame size
pub const MAX_FRAME_SIZE: usize = 512;

/// Parsed service UUID
pub fn service_uuid() -> Uuid {
    Uuid::parse_str(SERVICE_UUID).expect("constant UUID parses")
}

/// Parsed characteristic UUID
pub fn characteristic_uuid() -> Uuid {
    Uuid::parse_str(CHARACTERISTIC_UUID).expect("constant UUID parses")
}

/// Fragmentation metadata carried in BLE service data
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AdvertisementMeta {
    /// Wire code of the advertised packet type
    pub packet_type: u8,
    /// Hex packet id, zero-padded to 32 bytes
    pub packet_id: [u8; 32],
    /// Number of fragments in the advertised burst
    pub total_fragments: u8,
}

impl AdvertisementMeta {
    /// Serialize into service data bytes
    pub fn encode(&self) -> Vec<u8> {
        let mut data = Vec::with_capacity(ADVERTISEMENT_META_SIZE);
        data.extend_from_slice(ADVERTISEMENT_PREFIX);
        data.push(self.packet_type);
        data.extend_from_slice(&self.packet_id);
        data.push(self.total_fragments);
        data
    }

    /// Parse service data, returning `None` for foreign advertisements
    pub fn parse(data: &[u8]) -> Option<Self> {
        if data.len() < ADVERTISEMENT_META_SIZE || &data[..5] != ADVERTISEMENT_PREFIX {
            return None;
        }
        let mut packet_id = [0u8; 32];
        packet_id.copy_from_slice(&data[6..38]);
        Some(Self {
            packet_type: data[5],
            packet_id,
            total_fragments: data[38],
        })
    }
}

/// Scan cadence advice derived from the battery mode
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScanPolicy {
    /// Multiplier the driver should apply to its base scan interval
    pub scan_interval_multiplier: u32,
}

impl From<BatteryMode> for ScanPolicy {
    fn from(mode: BatteryMode) -> Self {
        Self {
            scan_interval_multiplier: mode.scan_interval_multiplier(),
        }
    }
}

/// A frame received from the radio
#[derive(Debug, Clone)]
pub struct IncomingFrame {
    pub data: Vec<u8>,
    /// Immediate upstream link peer, when the driver knows it
    pub from: Option<PeerId>,
}

/// Ingress handle handed to the driver
///
/// The driver holds this instead of a kernel reference, keeping ownership
/// one-way. The backing queue is bounded; a full queue blocks the
/// producer rather than dropping frames.
#[derive(Clone)]
pub struct PacketSink {
    tx: mpsc::Sender<IncomingFrame>,
}

impl PacketSink {
    pub(crate) fn new(tx: mpsc::Sender<IncomingFrame>) -> Self {
        Self { tx }
    }

    /// Push a received frame, waiting for queue space
    pub async fn deliver(&self, data: Vec<u8>, from: Option<PeerId>) -> Result<(), MeshError> {
        self.tx
            .send(IncomingFrame { data, from })
            .await
            .map_err(|_| MeshError::QueueClosed)
    }

    /// Push a received frame from outside the async runtime
    pub fn blocking_deliver(&self, data: Vec<u8>, from: Option<PeerId>) -> Result<(), MeshError> {
        self.tx
            .blocking_send(IncomingFrame { data, from })
            .map_err(|_| MeshError::QueueClosed)
    }
}

/// Platform radio driver boundary
///
/// Methods are synchronous and expected to return quickly; drivers run
/// their own I/O machinery internally. The kernel calls `start` with the
/// ingress sink, then `send_packet` for every egress frame, and finally
/// `stop` before its own loops wind down.
pub trait PlatformProvider: Send + Sync {
    /// Probe and prepare the radio; called once before `start`
    fn initialize(&self) -> anyhow::Result<()>;

    /// Begin advertising and scanning, delivering frames into `sink`
    fn start(&self, sink: PacketSink) -> anyhow::Result<()>;

    /// Cease all radio activity; no deliveries after this returns
    fn stop(&self) -> anyhow::Result<()>;

    /// Transmit a frame to one peer, or to every neighbor when `None`
    fn send_packet(&self, data: &[u8], target: Option<PeerId>) -> anyhow::Result<()>;

    /// Battery advice; drivers may ignore it
    fn set_scan_policy(&self, _policy: ScanPolicy) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_uuids_parse() {
        assert_eq!(service_uuid().to_string().to_uppercase(), SERVICE_UUID);
        assert_eq!(
            characteristic_uuid().to_string().to_uppercase(),
            CHARACTERISTIC_UUID
        );
    }

    #[test]
    fn test_advertisement_roundtrip() {
        let meta = AdvertisementMeta {
            packet_type: 0x05,
            packet_id: [0x61; 32],
            total_fragments: 3,
        };
        let encoded = meta.encode();
        assert_eq!(encoded.len(), ADVERTISEMENT_META_SIZE);
        assert_eq!(&encoded[..5], b"BTCHT");
        assert_eq!(AdvertisementMeta::parse(&encoded), Some(meta));
    }

    #[test]
    fn test_foreign_advertisement_rejected() {
        assert_eq!(AdvertisementMeta::parse(b"NOTUS"), None);
        let mut wrong = AdvertisementMeta {
            packet_type: 0x05,
            packet_id: [0; 32],
            total_fragments: 1,
        }
        .encode();
        wrong[0] = b'X';
        assert_eq!(AdvertisementMeta::parse(&wrong), None);
    }

    #[test]
    fn test_scan_policy_from_battery() {
        assert_eq!(
            ScanPolicy::from(BatteryMode::Normal).scan_interval_multiplier,
            1
        );
        assert_eq!(
            ScanPolicy::from(BatteryMode::UltraLow).scan_interval_multiplier,
            3
        );
    }
}
