//! Mesh service kernel
//!
//! Owns the packet pipeline: bounded ingress and egress queues, the
//! maintenance loop, type dispatch, store-and-forward, cover traffic and
//! shutdown. The radio is reached only through the platform provider
//! boundary; the application is reached only through the delegate.

use log::{debug, info, warn};
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;
use tokio::sync::{mpsc, watch};

use crate::bluetooth::{IncomingFrame, PacketSink, PlatformProvider, ScanPolicy};
use crate::config::{BatteryMode, MeshConfig};
use crate::crypto::{ChannelKey, EncryptionService, CHANNEL_SALT_SIZE};
use crate::error::{CryptoError, MeshError, MeshResult};
use crate::mesh::{MessageCache, MessageRouter, PeerInfo, PeerTable, RetryService};
use crate::protocol::{
    decode, encode, fragment_packet, BitchatMessage, BitchatPacket, DeliveryInfo, DeliveryStatus,
    FragmentReassembler, MessagePadding, MessageType, PacketId, PeerId,
};

/// Peers unseen for this long are dropped
const PEER_TIMEOUT: Duration = Duration::from_secs(10 * 60);

/// Annotation prefixed to messages whose signature does not verify
const INVALID_SIGNATURE_WARNING: &str = "[warning: invalid signature] ";

/// Placeholder content when a private payload cannot be opened
const UNDECRYPTABLE_CONTENT: &str = "[encrypted]";

/// Application-facing event callbacks
pub trait MeshDelegate: Send + Sync {
    /// A peer announced itself for the first time
    fn on_peer_discovered(&self, peer_id: PeerId, nickname: &str);

    /// A peer left or timed out
    fn on_peer_lost(&self, peer_id: PeerId);

    /// A chat message arrived for this node
    fn on_message_received(&self, message: BitchatMessage);

    /// Delivery state of an outbound message changed
    fn on_message_delivery_changed(
        &self,
        packet_id: PacketId,
        status: DeliveryStatus,
        info: DeliveryInfo,
    );
}

/// Pipeline drop and throughput counters
#[derive(Default)]
pub struct MeshCounters {
    invalid_packets: AtomicU64,
    duplicates_dropped: AtomicU64,
    ttl_expired: AtomicU64,
    blocked_dropped: AtomicU64,
    crypto_failures: AtomicU64,
    relayed: AtomicU64,
    messages_delivered: AtomicU64,
    packets_sent: AtomicU64,
    fragments_reassembled: AtomicU64,
    unhandled: AtomicU64,
}

/// Point-in-time copy of the counters
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CounterSnapshot {
    pub invalid_packets: u64,
    pub duplicates_dropped: u64,
    pub ttl_expired: u64,
    pub blocked_dropped: u64,
    pub crypto_failures: u64,
    pub relayed: u64,
    pub messages_delivered: u64,
    pub packets_sent: u64,
    pub fragments_reassembled: u64,
    pub unhandled: u64,
}

impl MeshCounters {
    fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    /// Snapshot every counter
    pub fn snapshot(&self) -> CounterSnapshot {
        CounterSnapshot {
            invalid_packets: self.invalid_packets.load(Ordering::Relaxed),
            duplicates_dropped: self.duplicates_dropped.load(Ordering::Relaxed),
            ttl_expired: self.ttl_expired.load(Ordering::Relaxed),
            blocked_dropped: self.blocked_dropped.load(Ordering::Relaxed),
            crypto_failures: self.crypto_failures.load(Ordering::Relaxed),
            relayed: self.relayed.load(Ordering::Relaxed),
            messages_delivered: self.messages_delivered.load(Ordering::Relaxed),
            packets_sent: self.packets_sent.load(Ordering::Relaxed),
            fragments_reassembled: self.fragments_reassembled.load(Ordering::Relaxed),
            unhandled: self.unhandled.load(Ordering::Relaxed),
        }
    }
}

/// Known state of a group channel
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChannelInfo {
    pub name: String,
    pub owner: Option<PeerId>,
    pub password_protected: bool,
    pub retention: bool,
    #[serde(skip)]
    pub salt: Option<[u8; CHANNEL_SALT_SIZE]>,
}

/// The mesh node kernel
pub struct MeshService {
    config: MeshConfig,
    local_id: PeerId,
    crypto: Arc<EncryptionService>,
    peers: Arc<PeerTable>,
    router: Mutex<MessageRouter>,
    cache: Mutex<MessageCache>,
    reassembler: Mutex<FragmentReassembler>,
    retry: Arc<RetryService>,
    provider: Arc<dyn PlatformProvider>,
    delegate: Arc<dyn MeshDelegate>,
    counters: Arc<MeshCounters>,

    outgoing_tx: mpsc::Sender<BitchatPacket>,
    outgoing_rx: Mutex<Option<mpsc::Receiver<BitchatPacket>>>,
    incoming_tx: mpsc::Sender<IncomingFrame>,
    incoming_rx: Mutex<Option<mpsc::Receiver<IncomingFrame>>>,
    shutdown_tx: watch::Sender<bool>,

    battery_mode: RwLock<BatteryMode>,
    cover_traffic: AtomicBool,
    channel_state: RwLock<HashMap<String, ChannelInfo>>,
    pending_private: Mutex<HashMap<PeerId, Vec<String>>>,
    running: AtomicBool,
}

impl MeshService {
    /// Build a node from its configuration and collaborators
    ///
    /// Loads or creates the persisted identity under the configured data
    /// directory; the wire peer id is derived from it.
    pub fn new(
        config: MeshConfig,
        provider: Arc<dyn PlatformProvider>,
        delegate: Arc<dyn MeshDelegate>,
    ) -> MeshResult<Arc<Self>> {
        let crypto = Arc::new(EncryptionService::new(&config.data_dir)?);
        Ok(Self::assemble(config, crypto, provider, delegate))
    }

    /// Build a node with a throwaway identity that never touches disk
    pub fn new_ephemeral(
        config: MeshConfig,
        provider: Arc<dyn PlatformProvider>,
        delegate: Arc<dyn MeshDelegate>,
    ) -> Arc<Self> {
        Self::assemble(
            config,
            Arc::new(EncryptionService::ephemeral()),
            provider,
            delegate,
        )
    }

    fn assemble(
        config: MeshConfig,
        crypto: Arc<EncryptionService>,
        provider: Arc<dyn PlatformProvider>,
        delegate: Arc<dyn MeshDelegate>,
    ) -> Arc<Self> {
        let local_id = crypto.wire_peer_id();
        let (outgoing_tx, outgoing_rx) = mpsc::channel(config.queue_capacity);
        let (incoming_tx, incoming_rx) = mpsc::channel(config.queue_capacity);
        let (shutdown_tx, _) = watch::channel(false);

        let retry_tx = outgoing_tx.clone();
        let retry = Arc::new(RetryService::new(
            config.retry.clone(),
            Arc::new(move |packet: &BitchatPacket, _target: PeerId| {
                retry_tx
                    .try_send(packet.clone())
                    .map_err(|_| MeshError::SendFailed("egress queue full".into()))
            }),
        ));

        Arc::new(Self {
            local_id,
            router: Mutex::new(MessageRouter::new(config.seen_ttl, config.default_ttl)),
            cache: Mutex::new(MessageCache::new(config.cache_size)),
            reassembler: Mutex::new(FragmentReassembler::new(config.fragment_timeout)),
            battery_mode: RwLock::new(config.battery_mode),
            cover_traffic: AtomicBool::new(config.cover_traffic),
            crypto,
            peers: Arc::new(PeerTable::new()),
            retry,
            provider,
            delegate,
            counters: Arc::new(MeshCounters::default()),
            outgoing_tx,
            outgoing_rx: Mutex::new(Some(outgoing_rx)),
            incoming_tx,
            incoming_rx: Mutex::new(Some(incoming_rx)),
            shutdown_tx,
            channel_state: RwLock::new(HashMap::new()),
            pending_private: Mutex::new(HashMap::new()),
            config,
            running: AtomicBool::new(false),
        })
    }

    /// The node's 8-byte wire id
    pub fn local_peer_id(&self) -> PeerId {
        self.local_id
    }

    /// The node's stable 16-byte identity id, hex encoded
    pub fn local_identity_id(&self) -> String {
        self.crypto.local_peer_id()
    }

    /// Ingress handle for a driver started out of band
    pub fn packet_sink(&self) -> PacketSink {
        PacketSink::new(self.incoming_tx.clone())
    }

    /// Start the transport and the kernel loops
    pub async fn start(self: &Arc<Self>) -> MeshResult<()> {
        if self.running.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        info!("starting mesh service as {}", self.local_id);

        self.provider
            .initialize()
            .map_err(|e| MeshError::BluetoothUnavailable(e.to_string()))?;
        self.provider
            .start(self.packet_sink())
            .map_err(|e| MeshError::BluetoothUnavailable(e.to_string()))?;
        self.provider
            .set_scan_policy(ScanPolicy::from(*self.battery_mode.read().expect("mode lock")));

        self.retry.start();

        let service = Arc::clone(self);
        let rx = self
            .incoming_rx
            .lock()
            .expect("incoming rx lock")
            .take()
            .expect("incoming receiver already taken");
        tokio::spawn(async move { service.incoming_loop(rx).await });

        let service = Arc::clone(self);
        let rx = self
            .outgoing_rx
            .lock()
            .expect("outgoing rx lock")
            .take()
            .expect("outgoing receiver already taken");
        tokio::spawn(async move { service.outgoing_loop(rx).await });

        let service = Arc::clone(self);
        tokio::spawn(async move { service.maintenance_loop().await });

        self.announce().await?;
        Ok(())
    }

    /// Stop the node: transport first, then drain, then release keys
    pub async fn stop(&self) {
        if !self.running.swap(false, Ordering::SeqCst) {
            return;
        }
        info!("stopping mesh service");

        if let Err(e) = self.provider.stop() {
            warn!("provider stop: {e}");
        }

        let _ = self.shutdown_tx.send(true);
        tokio::time::sleep(self.config.shutdown_drain).await;

        self.retry.shutdown("shutdown");
        self.crypto.clear();
        info!("mesh service stopped");
    }

    // ------------------------------------------------------------------
    // Sending
    // ------------------------------------------------------------------

    /// Broadcast a plaintext chat message to the whole mesh
    pub async fn send_broadcast(&self, content: &str) -> MeshResult<PacketId> {
        let mut packet = BitchatPacket::new_broadcast(
            MessageType::Message,
            self.local_id,
            content.as_bytes().to_vec(),
        )
        .with_ttl(0);
        self.crypto.sign_packet(&mut packet);
        let id = packet.packet_id();
        self.enqueue(packet).await?;
        Ok(id)
    }

    /// Send an encrypted private message to a peer by nickname
    ///
    /// Without an established session the message is queued, a key
    /// exchange is triggered, and `NoSharedSecret` is returned; the
    /// queued message flushes automatically once the peer's bundle
    /// arrives.
    pub async fn send_private(&self, nickname: &str, content: &str) -> MeshResult<PacketId> {
        let peer = self
            .peers
            .find_by_nickname(nickname)
            .await
            .ok_or_else(|| MeshError::PeerNotFound(nickname.to_string()))?;

        if !self.crypto.has_session(&peer) {
            self.pending_private
                .lock()
                .expect("pending lock")
                .entry(peer)
                .or_default()
                .push(content.to_string());
            self.send_key_exchange(peer).await?;
            return Err(MeshError::Crypto(CryptoError::NoSharedSecret));
        }

        self.send_private_to(peer, content).await
    }

    /// Encrypt, sign, track for retry and enqueue a private message
    async fn send_private_to(&self, peer: PeerId, content: &str) -> MeshResult<PacketId> {
        let sealed = self.crypto.encrypt_for_peer(&peer, content.as_bytes())?;
        let mut packet =
            BitchatPacket::new(MessageType::Message, self.local_id, Some(peer), sealed)
                .with_ttl(0);
        self.crypto.sign_packet(&mut packet);
        let id = packet.packet_id();

        let delegate = Arc::clone(&self.delegate);
        self.retry.add(
            packet.clone(),
            peer,
            Box::new(move |packet_id, _success, info| {
                delegate.on_message_delivery_changed(packet_id, info.status, info);
            }),
        );

        self.enqueue(packet).await?;
        self.delegate.on_message_delivery_changed(
            id,
            DeliveryStatus::Sending,
            DeliveryInfo {
                status: DeliveryStatus::Sending,
                recipient: Some(peer),
                timestamp: crate::protocol::now_millis(),
                attempts: 1,
                fail_reason: None,
            },
        );
        Ok(id)
    }

    /// Send an encrypted message to a joined channel
    pub async fn send_channel(&self, channel: &str, content: &str) -> MeshResult<PacketId> {
        if channel.is_empty() || channel.len() > 255 {
            return Err(MeshError::Crypto(CryptoError::KeyInvalid(
                "channel name length".into(),
            )));
        }
        let sealed = self.crypto.channels().encrypt(channel, content.as_bytes())?;

        let mut payload = Vec::with_capacity(1 + channel.len() + sealed.len());
        payload.push(channel.len() as u8);
        payload.extend_from_slice(channel.as_bytes());
        payload.extend_from_slice(&sealed);

        let mut packet =
            BitchatPacket::new_broadcast(MessageType::Message, self.local_id, payload)
                .with_ttl(0);
        self.crypto.sign_packet(&mut packet);
        let id = packet.packet_id();
        self.enqueue(packet).await?;
        Ok(id)
    }

    /// Create a password-protected channel and announce ownership
    pub async fn create_channel(&self, channel: &str, password: &str) -> MeshResult<()> {
        let key = ChannelKey::create(channel, password)?;
        let salt = *key.salt();
        self.crypto.channels().set_channel_key(channel, key);

        self.channel_state.write().expect("channel lock").insert(
            channel.to_string(),
            ChannelInfo {
                name: channel.to_string(),
                owner: Some(self.local_id),
                password_protected: true,
                retention: false,
                salt: Some(salt),
            },
        );
        self.announce_channel(channel).await
    }

    /// Join an announced channel with its password
    ///
    /// The key salt must have been learned from a ChannelAnnounce.
    pub async fn join_channel(&self, channel: &str, password: Option<&str>) -> MeshResult<()> {
        let info = self
            .channel_state
            .read()
            .expect("channel lock")
            .get(channel)
            .cloned();
        match (info, password) {
            (Some(info), Some(password)) if info.password_protected => {
                let salt = info
                    .salt
                    .ok_or(MeshError::Crypto(CryptoError::NoSharedSecret))?;
                let key = ChannelKey::from_salt(channel, password, salt)?;
                self.crypto.channels().set_channel_key(channel, key);
                Ok(())
            }
            (Some(_), _) => Ok(()),
            (None, _) => Err(MeshError::PeerNotFound(format!("channel {channel}"))),
        }
    }

    /// Leave a channel and forget its key
    pub async fn leave_channel(&self, channel: &str) {
        self.crypto.channels().remove_channel_key(channel);
    }

    /// Toggle whether channel messages should be retained, and announce it
    pub async fn set_channel_retention(&self, channel: &str, retain: bool) -> MeshResult<()> {
        if let Some(info) = self
            .channel_state
            .write()
            .expect("channel lock")
            .get_mut(channel)
        {
            info.retention = retain;
        }
        let mut payload = Vec::with_capacity(1 + channel.len() + 1);
        payload.push(channel.len() as u8);
        payload.extend_from_slice(channel.as_bytes());
        payload.push(retain as u8);

        let packet = BitchatPacket::new_broadcast(
            MessageType::ChannelRetention,
            self.local_id,
            payload,
        )
        .with_ttl(0);
        self.enqueue(packet).await
    }

    /// Notify a sender that its message was read
    pub async fn send_read_receipt(&self, packet_id: PacketId, peer: PeerId) -> MeshResult<()> {
        let mut packet = BitchatPacket::new(
            MessageType::ReadReceipt,
            self.local_id,
            Some(peer),
            packet_id.as_bytes().to_vec(),
        )
        .with_ttl(0);
        self.crypto.sign_packet(&mut packet);
        self.enqueue(packet).await
    }

    /// Tell the mesh this node is going away
    pub async fn send_leave(&self) -> MeshResult<()> {
        let packet =
            BitchatPacket::new_broadcast(MessageType::Leave, self.local_id, Vec::new())
                .with_ttl(0);
        self.enqueue(packet).await
    }

    /// Ask a peer whether it has seen one of our packets
    pub async fn request_delivery_status(
        &self,
        packet_id: PacketId,
        peer: PeerId,
    ) -> MeshResult<()> {
        let packet = BitchatPacket::new(
            MessageType::DeliveryStatusRequest,
            self.local_id,
            Some(peer),
            packet_id.as_bytes().to_vec(),
        )
        .with_ttl(0);
        self.enqueue(packet).await
    }

    /// Broadcast our nickname and key bundle
    pub async fn announce(&self) -> MeshResult<()> {
        let nickname = self.config.nickname.as_bytes();
        let bundle = self.crypto.combined_public_key_data();
        let mut payload = Vec::with_capacity(1 + nickname.len() + bundle.len());
        payload.push(nickname.len() as u8);
        payload.extend_from_slice(nickname);
        payload.extend_from_slice(&bundle);

        let packet =
            BitchatPacket::new_broadcast(MessageType::Announce, self.local_id, payload)
                .with_ttl(0);
        self.enqueue(packet).await
    }

    /// Send our key bundle to one peer; the key itself is the proof
    async fn send_key_exchange(&self, peer: PeerId) -> MeshResult<()> {
        let packet = BitchatPacket::new(
            MessageType::KeyExchange,
            self.local_id,
            Some(peer),
            self.crypto.combined_public_key_data(),
        )
        .with_ttl(1);
        self.enqueue(packet).await
    }

    /// Announce a channel's protection status, owner and salt
    async fn announce_channel(&self, channel: &str) -> MeshResult<()> {
        let info = self
            .channel_state
            .read()
            .expect("channel lock")
            .get(channel)
            .cloned();
        let Some(info) = info else {
            return Ok(());
        };

        let mut payload = Vec::with_capacity(1 + channel.len() + 8 + 1 + CHANNEL_SALT_SIZE);
        payload.push(channel.len() as u8);
        payload.extend_from_slice(channel.as_bytes());
        payload.extend_from_slice(info.owner.unwrap_or(self.local_id).as_bytes());
        payload.push(info.password_protected as u8);
        if let Some(salt) = info.salt {
            payload.extend_from_slice(&salt);
        }

        let packet = BitchatPacket::new_broadcast(
            MessageType::ChannelAnnounce,
            self.local_id,
            payload,
        )
        .with_ttl(0);
        self.enqueue(packet).await
    }

    /// Put a packet on the egress queue; blocks when the queue is full
    async fn enqueue(&self, packet: BitchatPacket) -> MeshResult<()> {
        self.outgoing_tx
            .send(packet)
            .await
            .map_err(|_| MeshError::QueueClosed)
    }

    // ------------------------------------------------------------------
    // Settings and introspection
    // ------------------------------------------------------------------

    /// Switch battery mode and advise the transport
    pub fn set_battery_mode(&self, mode: BatteryMode) {
        *self.battery_mode.write().expect("mode lock") = mode;
        self.provider.set_scan_policy(ScanPolicy::from(mode));
    }

    /// Enable or disable cover traffic
    pub fn set_cover_traffic(&self, enabled: bool) {
        self.cover_traffic.store(enabled, Ordering::Relaxed);
    }

    /// Drop all traffic from and to a peer
    pub fn block_peer(&self, peer: PeerId) {
        self.router.lock().expect("router lock").block(peer);
    }

    /// Lift a block
    pub fn unblock_peer(&self, peer: &PeerId) {
        self.router.lock().expect("router lock").unblock(peer);
    }

    /// Snapshot of every known peer
    pub async fn peer_list(&self) -> Vec<PeerInfo> {
        self.peers.snapshot().await
    }

    /// Snapshot of the pipeline counters
    pub fn counters(&self) -> CounterSnapshot {
        self.counters.snapshot()
    }

    /// Known channels and their announced state
    pub fn channel_list(&self) -> Vec<ChannelInfo> {
        self.channel_state
            .read()
            .expect("channel lock")
            .values()
            .cloned()
            .collect()
    }

    /// Messages still awaiting a delivery ack
    pub fn pending_delivery_count(&self) -> usize {
        self.retry.pending_count()
    }

    /// Service statistics for diagnostics
    pub async fn statistics(&self) -> serde_json::Value {
        serde_json::json!({
            "local_peer_id": self.local_id.to_string(),
            "identity_id": self.local_identity_id(),
            "peers": self.peers.count().await,
            "sessions": self.crypto.session_count(),
            "cached_messages": self.cache.lock().expect("cache lock").len(),
            "pending_retries": self.retry.pending_count(),
            "pending_fragments": self.reassembler.lock().expect("reassembler lock").pending(),
            "counters": self.counters.snapshot(),
        })
    }

    // ------------------------------------------------------------------
    // Kernel loops
    // ------------------------------------------------------------------

    async fn incoming_loop(self: Arc<Self>, mut rx: mpsc::Receiver<IncomingFrame>) {
        let mut shutdown_rx = self.shutdown_tx.subscribe();
        loop {
            tokio::select! {
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        debug!("incoming loop stopping");
                        return;
                    }
                }
                frame = rx.recv() => {
                    let Some(frame) = frame else { return };
                    match decode(&frame.data) {
                        Ok(packet) => self.ingress(packet, frame.from).await,
                        Err(e) => {
                            debug!("dropping undecodable frame: {e}");
                            MeshCounters::bump(&self.counters.invalid_packets);
                        }
                    }
                }
            }
        }
    }

    async fn outgoing_loop(self: Arc<Self>, mut rx: mpsc::Receiver<BitchatPacket>) {
        let mut shutdown_rx = self.shutdown_tx.subscribe();
        loop {
            tokio::select! {
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        self.drain_egress(&mut rx).await;
                        debug!("outgoing loop stopping");
                        return;
                    }
                }
                packet = rx.recv() => {
                    let Some(packet) = packet else { return };
                    self.handle_outgoing(packet).await;
                }
            }
        }
    }

    /// Flush what remains on the egress queue within the drain deadline
    async fn drain_egress(&self, rx: &mut mpsc::Receiver<BitchatPacket>) {
        let deadline = tokio::time::Instant::now() + self.config.shutdown_drain;
        loop {
            match tokio::time::timeout_at(deadline, rx.recv()).await {
                Ok(Some(packet)) => self.transmit(&packet).await,
                Ok(None) | Err(_) => break,
            }
        }
    }

    async fn maintenance_loop(self: Arc<Self>) {
        let mut shutdown_rx = self.shutdown_tx.subscribe();
        let mut ticker = tokio::time::interval(self.config.maintenance_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        // The first tick of a tokio interval fires immediately.
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        debug!("maintenance loop stopping");
                        return;
                    }
                }
                _ = ticker.tick() => {
                    self.run_maintenance().await;
                }
            }
        }
    }

    async fn run_maintenance(&self) {
        let expired = self.cache.lock().expect("cache lock").purge_expired();
        if expired > 0 {
            debug!("expired {expired} cached messages");
        }
        self.router.lock().expect("router lock").purge_seen();

        let gc = self.reassembler.lock().expect("reassembler lock").purge_expired();
        if gc > 0 {
            debug!("garbage-collected {gc} fragment slots");
        }

        let lost = self.peers.prune_stale(PEER_TIMEOUT).await;
        for peer in lost {
            info!("peer {peer} timed out");
            self.forget_peer(&peer);
            self.delegate.on_peer_lost(peer);
        }

        self.emit_cover_traffic().await;
    }

    /// With a small probability each tick, send an empty padded announce
    async fn emit_cover_traffic(&self) {
        if !self.cover_traffic.load(Ordering::Relaxed) {
            return;
        }
        if *self.battery_mode.read().expect("mode lock") != BatteryMode::Normal {
            return;
        }
        let roll = rand::thread_rng().gen_range(0..100);
        if roll >= self.config.cover_traffic_probability {
            return;
        }

        let payload = MessagePadding::pad_to_block(&[]);
        let packet =
            BitchatPacket::new_broadcast(MessageType::Announce, self.local_id, payload)
                .with_ttl(1);
        if self.outgoing_tx.try_send(packet).is_ok() {
            debug!("emitted cover traffic");
        }
    }

    fn forget_peer(&self, peer: &PeerId) {
        self.router.lock().expect("router lock").remove_peer(peer);
        self.crypto.remove_peer(peer);
    }

    // ------------------------------------------------------------------
    // Egress path
    // ------------------------------------------------------------------

    async fn handle_outgoing(&self, mut packet: BitchatPacket) {
        let id = packet.packet_id();
        {
            let mut router = self.router.lock().expect("router lock");
            router.prepare_outgoing(&mut packet);
            if router.is_blocked(&packet.sender_id)
                || packet
                    .recipient_id
                    .map(|r| router.is_blocked(&r))
                    .unwrap_or(false)
            {
                MeshCounters::bump(&self.counters.blocked_dropped);
                return;
            }
            // Record our own egress ids so relayed echoes die on arrival.
            let _ = router.check_and_record(id);
        }

        // Self-delivered copy for store-and-forward.
        let ttl = self
            .config
            .effective_cache_ttl(*self.battery_mode.read().expect("mode lock"));
        {
            let mut cache = self.cache.lock().expect("cache lock");
            cache.insert(id, packet.clone(), self.local_id, ttl);
            cache.mark_delivered(&id, self.local_id);
        }

        match fragment_packet(&packet) {
            Ok(Some(fragments)) => {
                debug!("fragmenting {id} into {} pieces", fragments.len());
                self.send_fragments(fragments, packet.recipient_id).await;
            }
            Ok(None) => self.transmit(&packet).await,
            Err(e) => {
                warn!("cannot fragment {id}: {e}");
                MeshCounters::bump(&self.counters.invalid_packets);
            }
        }
    }

    /// Transmit a fragment burst on its own task, paced between frames
    ///
    /// Fragments must leave in ascending index order, but the pacing
    /// sleeps must not stall the egress loop.
    async fn send_fragments(&self, fragments: Vec<BitchatPacket>, recipient: Option<PeerId>) {
        let provider = Arc::clone(&self.provider);
        let counters = Arc::clone(&self.counters);
        let pacing = self.config.fragment_pacing;
        let target = self.resolve_target(recipient);

        tokio::spawn(async move {
            for fragment in fragments {
                let data = encode(&fragment);
                if let Err(e) = provider.send_packet(&data, target) {
                    warn!("fragment send failed: {e}");
                } else {
                    MeshCounters::bump(&counters.packets_sent);
                }
                tokio::time::sleep(pacing).await;
            }
        });
    }

    async fn transmit(&self, packet: &BitchatPacket) {
        let data = encode(packet);
        let target = self.resolve_target(packet.recipient_id);
        match self.provider.send_packet(&data, target) {
            Ok(()) => MeshCounters::bump(&self.counters.packets_sent),
            Err(e) => warn!("send failed: {e}"),
        }
    }

    /// Pick the link target: broadcast, a routed next hop, or the peer itself
    fn resolve_target(&self, recipient: Option<PeerId>) -> Option<PeerId> {
        let recipient = recipient?;
        if recipient.is_broadcast() {
            return None;
        }
        let router = self.router.lock().expect("router lock");
        Some(
            router
                .next_hop(&recipient)
                .map(|route| route.next_hop)
                .unwrap_or(recipient),
        )
    }

    // ------------------------------------------------------------------
    // Ingress pipeline
    // ------------------------------------------------------------------

    async fn ingress(&self, mut packet: BitchatPacket, upstream: Option<PeerId>) {
        let id = packet.packet_id();

        {
            let mut router = self.router.lock().expect("router lock");
            if !router.check_and_record(id) {
                MeshCounters::bump(&self.counters.duplicates_dropped);
                return;
            }
            if packet.ttl == 0 {
                MeshCounters::bump(&self.counters.ttl_expired);
                return;
            }
            packet.ttl -= 1;

            if router.is_blocked(&packet.sender_id) {
                MeshCounters::bump(&self.counters.blocked_dropped);
                return;
            }

            // Link observation: the upstream neighbor is direct; the
            // original sender is reachable through it.
            if let Some(link) = upstream {
                router.update_route(link, None, 100);
                if link != packet.sender_id {
                    router.update_route(packet.sender_id, Some(link), 50);
                }
            }
        }

        let ttl = self
            .config
            .effective_cache_ttl(*self.battery_mode.read().expect("mode lock"));
        self.cache
            .lock()
            .expect("cache lock")
            .insert(id, packet.clone(), packet.sender_id, ttl);

        self.peers.touch(&packet.sender_id).await;

        if packet.is_for(&self.local_id) {
            self.dispatch(&packet, id, upstream).await;
        }

        let relay_ok = {
            let router = self.router.lock().expect("router lock");
            router.relay_allowed(&packet)
        };
        let addressed_only_to_us = packet
            .recipient_id
            .map(|r| !r.is_broadcast() && r == self.local_id)
            .unwrap_or(false);
        if relay_ok && !addressed_only_to_us {
            MeshCounters::bump(&self.counters.relayed);
            if self.outgoing_tx.try_send(packet).is_err() {
                debug!("egress queue full, relay dropped");
            }
        }
    }

    async fn dispatch(&self, packet: &BitchatPacket, id: PacketId, upstream: Option<PeerId>) {
        match packet.message_type {
            MessageType::Announce => self.handle_announce(packet).await,
            MessageType::KeyExchange => self.handle_key_exchange(packet).await,
            MessageType::Message => self.handle_user_message(packet, id).await,
            MessageType::DeliveryAck => self.handle_delivery_ack(packet).await,
            MessageType::ReadReceipt => self.handle_read_receipt(packet).await,
            MessageType::Leave => self.handle_leave(packet).await,
            MessageType::ChannelAnnounce => self.handle_channel_announce(packet),
            MessageType::ChannelRetention => self.handle_channel_retention(packet),
            MessageType::DeliveryStatusRequest => self.handle_status_request(packet).await,
            MessageType::FragmentStart
            | MessageType::FragmentContinue
            | MessageType::FragmentEnd => self.handle_fragment(packet, upstream).await,
            MessageType::Unknown(code) => {
                debug!("unhandled message type {code:#04x}");
                MeshCounters::bump(&self.counters.unhandled);
            }
        }
    }

    /// Announce payload: len8(nick), nick, key bundle
    async fn handle_announce(&self, packet: &BitchatPacket) {
        if packet.sender_id == self.local_id {
            return;
        }
        let payload = &packet.payload;
        if payload.len() < 2 {
            return;
        }
        let nick_len = payload[0] as usize;
        if payload.len() < 1 + nick_len {
            return;
        }
        let nickname = String::from_utf8_lossy(&payload[1..1 + nick_len]).into_owned();
        let bundle = &payload[1 + nick_len..];

        let sender = packet.sender_id;
        let bundle_arg = if bundle.is_empty() { None } else { Some(bundle) };
        let is_new = self.peers.add_or_update(sender, &nickname, bundle_arg).await;

        if let Some(bundle) = bundle_arg {
            if let Err(e) = self.crypto.add_peer_public_key(sender, bundle) {
                debug!("announce bundle from {sender} rejected: {e}");
            } else {
                self.flush_pending(sender).await;
            }
        }

        if is_new {
            info!("discovered peer {nickname} ({sender})");
            self.delegate.on_peer_discovered(sender, &nickname);
        }
    }

    /// KeyExchange payload: the bare 96-byte bundle
    async fn handle_key_exchange(&self, packet: &BitchatPacket) {
        let sender = packet.sender_id;
        if sender == self.local_id {
            return;
        }
        if let Err(e) = self.crypto.add_peer_public_key(sender, &packet.payload) {
            debug!("key exchange from {sender} rejected: {e}");
            MeshCounters::bump(&self.counters.crypto_failures);
            return;
        }

        let placeholder = sender.to_string();
        let nickname = &placeholder[..8.min(placeholder.len())];
        let is_new = self
            .peers
            .add_or_update(sender, nickname, Some(&packet.payload))
            .await;

        if is_new {
            self.delegate.on_peer_discovered(sender, nickname);
            if let Err(e) = self.send_key_exchange(sender).await {
                warn!("key exchange reply to {sender} failed: {e}");
            }
        }

        self.flush_pending(sender).await;
    }

    /// Send any private messages that were waiting for a session
    async fn flush_pending(&self, peer: PeerId) {
        let queued = self
            .pending_private
            .lock()
            .expect("pending lock")
            .remove(&peer);
        if let Some(queued) = queued {
            for content in queued {
                if let Err(e) = self.send_private_to(peer, &content).await {
                    warn!("queued private message to {peer} failed: {e}");
                }
            }
        }
    }

    async fn handle_user_message(&self, packet: &BitchatPacket, id: PacketId) {
        let sender = packet.sender_id;
        let nickname = match self.peers.get(&sender).await {
            Some(peer) => peer.nickname,
            None => sender.to_string(),
        };

        let is_private = packet
            .recipient_id
            .map(|r| r == self.local_id)
            .unwrap_or(false);

        let mut channel = None;
        let mut is_encrypted = false;
        let mut content;

        if is_private {
            match self.crypto.decrypt_from_peer(&sender, &packet.payload) {
                Ok(plaintext) => {
                    content = String::from_utf8_lossy(&plaintext).into_owned();
                    is_encrypted = true;
                }
                Err(_) => {
                    content = UNDECRYPTABLE_CONTENT.to_string();
                    is_encrypted = true;
                    MeshCounters::bump(&self.counters.crypto_failures);
                }
            }
        } else if let Some((name, sealed)) = self.parse_channel_frame(&packet.payload) {
            match self.crypto.channels().decrypt(&name, sealed) {
                Ok(plaintext) => {
                    content = String::from_utf8_lossy(&plaintext).into_owned();
                }
                Err(_) => {
                    content = UNDECRYPTABLE_CONTENT.to_string();
                    MeshCounters::bump(&self.counters.crypto_failures);
                }
            }
            is_encrypted = true;
            channel = Some(name);
        } else {
            content = String::from_utf8_lossy(&packet.payload).into_owned();
        }

        if packet.signature.is_some()
            && self.crypto.verify_packet_from(packet, &sender).is_err()
        {
            MeshCounters::bump(&self.counters.crypto_failures);
            content = format!("{INVALID_SIGNATURE_WARNING}{content}");
        }

        if is_private {
            if let Err(e) = self.send_delivery_ack(id, sender).await {
                warn!("delivery ack to {sender} failed: {e}");
            }
        }

        let mentions = BitchatMessage::extract_mentions(&content);
        let message = BitchatMessage {
            id,
            sender_nickname: nickname,
            sender_id: sender,
            content,
            timestamp: packet.timestamp,
            is_private,
            is_relay: false,
            is_encrypted,
            channel,
            mentions,
            delivery_status: None,
        };

        MeshCounters::bump(&self.counters.messages_delivered);
        self.delegate.on_message_received(message);
    }

    /// Channel frames open with len8(channel) followed by the sealed body
    fn parse_channel_frame<'a>(&self, payload: &'a [u8]) -> Option<(String, &'a [u8])> {
        let name_len = *payload.first()? as usize;
        if name_len == 0 || payload.len() < 1 + name_len {
            return None;
        }
        let name = std::str::from_utf8(&payload[1..1 + name_len]).ok()?;
        let known = self.crypto.channels().has_channel_key(name)
            || self
                .channel_state
                .read()
                .expect("channel lock")
                .contains_key(name);
        if !known {
            return None;
        }
        Some((name.to_string(), &payload[1 + name_len..]))
    }

    async fn send_delivery_ack(&self, original: PacketId, recipient: PeerId) -> MeshResult<()> {
        let mut packet = BitchatPacket::new(
            MessageType::DeliveryAck,
            self.local_id,
            Some(recipient),
            original.as_bytes().to_vec(),
        )
        .with_ttl(0);
        self.crypto.sign_packet(&mut packet);
        self.enqueue(packet).await
    }

    /// DeliveryAck payload: first 16 bytes name the original packet
    async fn handle_delivery_ack(&self, packet: &BitchatPacket) {
        let Some(original) = packet
            .payload
            .get(..16)
            .and_then(PacketId::from_bytes)
        else {
            return;
        };
        self.cache
            .lock()
            .expect("cache lock")
            .mark_delivered(&original, packet.sender_id);
        // Settles the retry entry; its callback reports Delivered.
        self.retry.mark_delivered(&original);
    }

    /// ReadReceipt payload mirrors DeliveryAck with a Read status
    async fn handle_read_receipt(&self, packet: &BitchatPacket) {
        let Some(original) = packet
            .payload
            .get(..16)
            .and_then(PacketId::from_bytes)
        else {
            return;
        };
        self.retry.mark_delivered(&original);
        self.delegate.on_message_delivery_changed(
            original,
            DeliveryStatus::Read,
            DeliveryInfo {
                status: DeliveryStatus::Read,
                recipient: Some(packet.sender_id),
                timestamp: crate::protocol::now_millis(),
                attempts: 0,
                fail_reason: None,
            },
        );
    }

    async fn handle_leave(&self, packet: &BitchatPacket) {
        let peer = packet.sender_id;
        if self.peers.remove(&peer).await {
            info!("peer {peer} left");
            self.forget_peer(&peer);
            self.delegate.on_peer_lost(peer);
        }
    }

    /// ChannelAnnounce payload: len8(name), name, owner(8), flags(1), salt?
    fn handle_channel_announce(&self, packet: &BitchatPacket) {
        let payload = &packet.payload;
        let Some(&name_len) = payload.first() else { return };
        let name_len = name_len as usize;
        if name_len == 0 || payload.len() < 1 + name_len + 8 + 1 {
            return;
        }
        let Ok(name) = std::str::from_utf8(&payload[1..1 + name_len]) else {
            return;
        };
        let owner = PeerId::from_bytes(&payload[1 + name_len..1 + name_len + 8]);
        let flags = payload[1 + name_len + 8];
        let password_protected = flags & 0x01 != 0;

        let salt_offset = 1 + name_len + 8 + 1;
        let salt = if password_protected && payload.len() >= salt_offset + CHANNEL_SALT_SIZE {
            let mut bytes = [0u8; CHANNEL_SALT_SIZE];
            bytes.copy_from_slice(&payload[salt_offset..salt_offset + CHANNEL_SALT_SIZE]);
            Some(bytes)
        } else {
            None
        };

        let mut channels = self.channel_state.write().expect("channel lock");
        let entry = channels.entry(name.to_string()).or_insert(ChannelInfo {
            name: name.to_string(),
            owner: None,
            password_protected,
            retention: false,
            salt: None,
        });
        entry.owner = owner;
        entry.password_protected = password_protected;
        if salt.is_some() {
            entry.salt = salt;
        }
        debug!("channel {name} announced by {:?}", entry.owner);
    }

    /// ChannelRetention payload: len8(name), name, retain(1)
    fn handle_channel_retention(&self, packet: &BitchatPacket) {
        let payload = &packet.payload;
        let Some(&name_len) = payload.first() else { return };
        let name_len = name_len as usize;
        if name_len == 0 || payload.len() < 1 + name_len + 1 {
            return;
        }
        let Ok(name) = std::str::from_utf8(&payload[1..1 + name_len]) else {
            return;
        };
        let retain = payload[1 + name_len] != 0;

        if let Some(info) = self
            .channel_state
            .write()
            .expect("channel lock")
            .get_mut(name)
        {
            info.retention = retain;
            debug!("channel {name} retention set to {retain}");
        }
    }

    /// Re-ack a cached packet when its sender asks for status
    async fn handle_status_request(&self, packet: &BitchatPacket) {
        let Some(original) = packet
            .payload
            .get(..16)
            .and_then(PacketId::from_bytes)
        else {
            return;
        };
        let cached = self
            .cache
            .lock()
            .expect("cache lock")
            .get(&original)
            .is_some();
        if cached {
            if let Err(e) = self.send_delivery_ack(original, packet.sender_id).await {
                warn!("status reply failed: {e}");
            }
        }
    }

    /// Feed a fragment to the reassembler; a completed buffer re-enters
    /// the pipeline as a fresh undecoded frame
    async fn handle_fragment(&self, packet: &BitchatPacket, upstream: Option<PeerId>) {
        let completed = {
            let mut reassembler = self.reassembler.lock().expect("reassembler lock");
            match reassembler.accept(packet) {
                Ok(done) => done,
                Err(e) => {
                    debug!("bad fragment from {}: {e}", packet.sender_id);
                    MeshCounters::bump(&self.counters.invalid_packets);
                    None
                }
            }
        };

        if let Some(assembled) = completed {
            MeshCounters::bump(&self.counters.fragments_reassembled);
            let tx = self.incoming_tx.clone();
            tokio::spawn(async move {
                let _ = tx
                    .send(IncomingFrame {
                        data: assembled,
                        from: upstream,
                    })
                    .await;
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct NullProvider;
    impl PlatformProvider for NullProvider {
        fn initialize(&self) -> anyhow::Result<()> {
            Ok(())
        }
        fn start(&self, _sink: PacketSink) -> anyhow::Result<()> {
            Ok(())
        }
        fn stop(&self) -> anyhow::Result<()> {
            Ok(())
        }
        fn send_packet(&self, _data: &[u8], _target: Option<PeerId>) -> anyhow::Result<()> {
            Ok(())
        }
    }

    struct NullDelegate;
    impl MeshDelegate for NullDelegate {
        fn on_peer_discovered(&self, _peer_id: PeerId, _nickname: &str) {}
        fn on_peer_lost(&self, _peer_id: PeerId) {}
        fn on_message_received(&self, _message: BitchatMessage) {}
        fn on_message_delivery_changed(
            &self,
            _packet_id: PacketId,
            _status: DeliveryStatus,
            _info: DeliveryInfo,
        ) {
        }
    }

    fn test_service() -> Arc<MeshService> {
        MeshService::new_ephemeral(
            MeshConfig::default(),
            Arc::new(NullProvider),
            Arc::new(NullDelegate),
        )
    }

    #[tokio::test]
    async fn test_ids_are_consistent() {
        let service = test_service();
        let wire = service.local_peer_id().to_string();
        assert!(service.local_identity_id().starts_with(&wire));
    }

    #[tokio::test]
    async fn test_send_private_unknown_nickname() {
        let service = test_service();
        let err = service.send_private("nobody", "hello").await.unwrap_err();
        assert!(matches!(err, MeshError::PeerNotFound(_)));
    }

    #[tokio::test]
    async fn test_send_private_without_session_queues() {
        let service = test_service();
        let peer = PeerId([5; 8]);
        service.peers.add_or_update(peer, "bob", None).await;

        let err = service.send_private("bob", "hello").await.unwrap_err();
        assert!(matches!(
            err,
            MeshError::Crypto(CryptoError::NoSharedSecret)
        ));
        assert_eq!(
            service
                .pending_private
                .lock()
                .unwrap()
                .get(&peer)
                .map(|v| v.len()),
            Some(1)
        );
    }

    #[tokio::test]
    async fn test_channel_frame_detection() {
        let service = test_service();
        service.create_channel("#ops", "pw").await.unwrap();

        let sealed = service.crypto.channels().encrypt("#ops", b"hi").unwrap();
        let mut payload = vec![4u8];
        payload.extend_from_slice(b"#ops");
        payload.extend_from_slice(&sealed);

        let parsed = service.parse_channel_frame(&payload).unwrap();
        assert_eq!(parsed.0, "#ops");
        assert_eq!(
            service.crypto.channels().decrypt("#ops", parsed.1).unwrap(),
            b"hi"
        );

        // Plain text never parses as a channel frame.
        assert!(service.parse_channel_frame(b"hello there").is_none());
    }

    #[tokio::test]
    async fn test_block_peer_drops_on_ingress() {
        let service = test_service();
        let stranger = PeerId([9; 8]);
        service.block_peer(stranger);

        let packet =
            BitchatPacket::new_broadcast(MessageType::Message, stranger, b"spam".to_vec());
        service.ingress(packet, None).await;
        assert_eq!(service.counters().blocked_dropped, 1);
        assert_eq!(service.counters().messages_delivered, 0);
    }

    #[tokio::test]
    async fn test_dedup_counts() {
        let service = test_service();
        let sender = PeerId([4; 8]);
        let packet =
            BitchatPacket::new_broadcast(MessageType::Leave, sender, Vec::new());
        service.ingress(packet.clone(), None).await;
        service.ingress(packet, None).await;
        assert_eq!(service.counters().duplicates_dropped, 1);
    }

    #[tokio::test]
    async fn test_ttl_zero_dropped() {
        let service = test_service();
        let packet =
            BitchatPacket::new_broadcast(MessageType::Message, PeerId([4; 8]), vec![1])
                .with_ttl(0);
        service.ingress(packet, None).await;
        assert_eq!(service.counters().ttl_expired, 1);
    }

    #[tokio::test]
    async fn test_channel_state_from_announce() {
        let service = test_service();
        let owner = PeerId([0xAB; 8]);
        let mut payload = vec![5u8];
        payload.extend_from_slice(b"#ops2");
        payload.extend_from_slice(owner.as_bytes());
        payload.push(0x01);
        payload.extend_from_slice(&[0x11; CHANNEL_SALT_SIZE]);

        let packet =
            BitchatPacket::new_broadcast(MessageType::ChannelAnnounce, owner, payload);
        service.handle_channel_announce(&packet);

        let channels = service.channel_list();
        assert_eq!(channels.len(), 1);
        assert_eq!(channels[0].name, "#ops2");
        assert_eq!(channels[0].owner, Some(owner));
        assert!(channels[0].password_protected);
        assert_eq!(channels[0].salt, Some([0x11; CHANNEL_SALT_SIZE]));
    }
}
