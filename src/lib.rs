//! Decentralized peer-to-peer chat over a Bluetooth LE mesh
//!
//! Nodes discover one another by advertisement, exchange identity keys,
//! and route end-to-end encrypted private messages, channel messages and
//! broadcasts across multiple radio hops. There is no server;
//! reachability emerges from nodes relaying each other's packets within
//! a hop budget.
//!
//! This crate is the mesh node kernel: the binary wire protocol, the
//! concurrent packet pipeline, fragmentation, per-peer session
//! cryptography, the retry scheduler and routing. The radio driver and
//! the user interface live behind narrow boundaries:
//!
//! - [`bluetooth::PlatformProvider`] is implemented by the platform BLE
//!   driver (BlueZ, CoreBluetooth, WinRT, or a simulator).
//! - [`mesh::MeshDelegate`] is implemented by the application front-end.
//!
//! # Module Map
//!
//! | Module | Responsibility |
//! |--------|----------------|
//! | [`protocol`] | Wire codec, padding, fragmentation, packet model |
//! | [`crypto`] | Identity, session keys, NaCl box, signatures, channels |
//! | [`mesh`] | Kernel pipeline, peers, cache, routing, retry |
//! | [`bluetooth`] | Transport boundary and BLE constants |
//! | [`config`] | Tunables and battery modes |
//! | [`error`] | Typed failure unions |
//!
//! # Usage
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use bitchat_mesh::{MeshConfig, MeshService};
//! # use bitchat_mesh::bluetooth::{PacketSink, PlatformProvider};
//! # use bitchat_mesh::mesh::MeshDelegate;
//! # use bitchat_mesh::protocol::{BitchatMessage, DeliveryInfo, DeliveryStatus, PacketId, PeerId};
//! # struct MyDriver;
//! # impl PlatformProvider for MyDriver {
//! #     fn initialize(&self) -> anyhow::Result<()> { Ok(()) }
//! #     fn start(&self, _sink: PacketSink) -> anyhow::Result<()> { Ok(()) }
//! #     fn stop(&self) -> anyhow::Result<()> { Ok(()) }
//! #     fn send_packet(&self, _data: &[u8], _target: Option<PeerId>) -> anyhow::Result<()> { Ok(()) }
//! # }
//! # struct MyApp;
//! # impl MeshDelegate for MyApp {
//! #     fn on_peer_discovered(&self, _id: PeerId, _nick: &str) {}
//! #     fn on_peer_lost(&self, _id: PeerId) {}
//! #     fn on_message_received(&self, _message: BitchatMessage) {}
//! #     fn on_message_delivery_changed(&self, _id: PacketId, _s: DeliveryStatus, _i: DeliveryInfo) {}
//! # }
//!
//! # async fn example() -> anyhow::Result<()> {
//! let config = MeshConfig {
//!     nickname: "nadia".to_string(),
//!     ..MeshConfig::default()
//! };
//! let service = MeshService::new(config, Arc::new(MyDriver), Arc::new(MyApp))?;
//! service.start().await?;
//! service.send_broadcast("hello mesh").await?;
//! # Ok(())
//! # }
//! ```

pub mod bluetooth;
pub mod config;
pub mod crypto;
pub mod error;
pub mod mesh;
pub mod protocol;
pub mod util;

// The everyday surface, re-exported at the crate root.
pub use config::{BatteryMode, MeshConfig, RetryConfig};
pub use error::{CryptoError, MeshError, MeshResult, ProtocolError};
pub use mesh::{MeshDelegate, MeshService};
pub use protocol::{BitchatMessage, BitchatPacket, DeliveryStatus, MessageType, PacketId, PeerId};
