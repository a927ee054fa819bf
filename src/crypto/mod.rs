//! Cryptography engine
//!
//! Key management and the packet-level primitives: X25519 key agreement,
//! NaCl box for private messages, Ed25519 signatures, and the persisted
//! identity that makes a node recognizable across restarts.
//!
//! Key maps use interior mutability and are read-mostly; session keys are
//! written once per peer and read lock-free afterwards.

mod channel;
mod identity;

pub use channel::{
    derive_channel_key, generate_salt, ChannelCrypto, ChannelKey, CHANNEL_SALT_SIZE,
};

use crypto_box::aead::{Aead, AeadCore};
use crypto_box::SalsaBox;
use dashmap::DashMap;
use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use hkdf::Hkdf;
use log::debug;
use rand::rngs::OsRng;
use sha2::{Digest, Sha256};
use std::path::Path;
use x25519_dalek::{PublicKey as X25519Public, StaticSecret};
use zeroize::Zeroizing;

use crate::error::CryptoError;
use crate::protocol::{signable_bytes, BitchatPacket, PeerId};

/// Combined public key bundle length: X25519 + signing + identity
pub const KEY_BUNDLE_SIZE: usize = 96;

/// NaCl box nonce length
pub const BOX_NONCE_SIZE: usize = 24;

/// NaCl box authenticator tag length
const BOX_TAG_SIZE: usize = 16;

/// HKDF context for session key derivation
const SESSION_KDF_INFO: &[u8] = b"bitchat-v1";

/// A peer's three public keys as received in its bundle
struct PeerKeys {
    agreement: X25519Public,
    signing: VerifyingKey,
    identity: VerifyingKey,
}

/// Key generation, storage and packet crypto for one node
pub struct EncryptionService {
    // Ephemeral per-session keys
    private_key: StaticSecret,
    public_key: X25519Public,
    signing_key: SigningKey,

    // Persistent identity
    identity_key: SigningKey,

    // Per-peer key material
    peer_keys: DashMap<PeerId, PeerKeys>,
    session_keys: DashMap<PeerId, Zeroizing<[u8; 32]>>,

    // Group channel keys
    channels: ChannelCrypto,
}

impl EncryptionService {
    /// Create a service with a persisted identity under `data_dir`
    pub fn new(data_dir: &Path) -> Result<Self, CryptoError> {
        let (identity_key, _created) = identity::load_or_create(data_dir)?;
        Ok(Self::with_identity(identity_key))
    }

    /// Create a service with a throwaway identity, nothing touches disk
    pub fn ephemeral() -> Self {
        Self::with_identity(SigningKey::generate(&mut OsRng))
    }

    fn with_identity(identity_key: SigningKey) -> Self {
        let private_key = StaticSecret::random_from_rng(OsRng);
        let public_key = X25519Public::from(&private_key);
        Self {
            private_key,
            public_key,
            signing_key: SigningKey::generate(&mut OsRng),
            identity_key,
            peer_keys: DashMap::new(),
            session_keys: DashMap::new(),
            channels: ChannelCrypto::new(),
        }
    }

    /// The 96-byte bundle shipped in Announce and KeyExchange
    pub fn combined_public_key_data(&self) -> Vec<u8> {
        let mut data = Vec::with_capacity(KEY_BUNDLE_SIZE);
        data.extend_from_slice(self.public_key.as_bytes());
        data.extend_from_slice(self.signing_key.verifying_key().as_bytes());
        data.extend_from_slice(self.identity_key.verifying_key().as_bytes());
        data
    }

    /// Register a peer's bundle and derive the session key
    ///
    /// Bundles of any length other than 96 bytes are rejected before any
    /// key material is stored.
    pub fn add_peer_public_key(&self, peer: PeerId, bundle: &[u8]) -> Result<(), CryptoError> {
        if bundle.len() != KEY_BUNDLE_SIZE {
            return Err(CryptoError::KeyInvalid(format!(
                "bundle length {}, expected {KEY_BUNDLE_SIZE}",
                bundle.len()
            )));
        }

        let agreement_bytes: [u8; 32] = bundle[0..32].try_into().expect("length checked");
        let signing_bytes: [u8; 32] = bundle[32..64].try_into().expect("length checked");
        let identity_bytes: [u8; 32] = bundle[64..96].try_into().expect("length checked");

        let agreement = X25519Public::from(agreement_bytes);
        let signing = VerifyingKey::from_bytes(&signing_bytes)
            .map_err(|e| CryptoError::KeyInvalid(e.to_string()))?;
        let identity = VerifyingKey::from_bytes(&identity_bytes)
            .map_err(|e| CryptoError::KeyInvalid(e.to_string()))?;

        let shared = self.private_key.diffie_hellman(&agreement);
        let kdf = Hkdf::<Sha256>::new(None, shared.as_bytes());
        let mut session = Zeroizing::new([0u8; 32]);
        kdf.expand(SESSION_KDF_INFO, session.as_mut_slice())
            .map_err(|e| CryptoError::KeyInvalid(e.to_string()))?;

        self.peer_keys.insert(
            peer,
            PeerKeys {
                agreement,
                signing,
                identity,
            },
        );
        self.session_keys.insert(peer, session);
        debug!("registered key bundle for {peer}");
        Ok(())
    }

    /// Whether a session exists with the peer
    pub fn has_session(&self, peer: &PeerId) -> bool {
        self.session_keys.contains_key(peer)
    }

    /// The HKDF-derived symmetric session key for a peer
    pub fn session_key(&self, peer: &PeerId) -> Option<Zeroizing<[u8; 32]>> {
        self.session_keys.get(peer).map(|entry| entry.value().clone())
    }

    /// Encrypt for a peer with NaCl box; nonce is prepended
    pub fn encrypt_for_peer(&self, peer: &PeerId, data: &[u8]) -> Result<Vec<u8>, CryptoError> {
        let keys = self.peer_keys.get(peer).ok_or(CryptoError::NoSharedSecret)?;

        let salsa = SalsaBox::new(
            &crypto_box::PublicKey::from(keys.agreement.to_bytes()),
            &crypto_box::SecretKey::from(self.private_key.to_bytes()),
        );
        let nonce = SalsaBox::generate_nonce(&mut OsRng);
        let ciphertext = salsa
            .encrypt(&nonce, data)
            .map_err(|_| CryptoError::EncryptionFailed)?;

        let mut out = Vec::with_capacity(BOX_NONCE_SIZE + ciphertext.len());
        out.extend_from_slice(&nonce);
        out.extend_from_slice(&ciphertext);
        Ok(out)
    }

    /// Open a NaCl box produced by a peer's `encrypt_for_peer`
    pub fn decrypt_from_peer(&self, peer: &PeerId, data: &[u8]) -> Result<Vec<u8>, CryptoError> {
        if data.len() < BOX_NONCE_SIZE + BOX_TAG_SIZE {
            return Err(CryptoError::DecryptionFailed);
        }
        let keys = self.peer_keys.get(peer).ok_or(CryptoError::NoSharedSecret)?;

        let salsa = SalsaBox::new(
            &crypto_box::PublicKey::from(keys.agreement.to_bytes()),
            &crypto_box::SecretKey::from(self.private_key.to_bytes()),
        );
        let nonce = crypto_box::Nonce::from_slice(&data[..BOX_NONCE_SIZE]);
        salsa
            .decrypt(nonce, &data[BOX_NONCE_SIZE..])
            .map_err(|_| CryptoError::DecryptionFailed)
    }

    /// Sign a packet with the session signing key
    pub fn sign_packet(&self, packet: &mut BitchatPacket) {
        let signature = self.signing_key.sign(&signable_bytes(packet));
        packet.signature = Some(signature.to_bytes().to_vec());
    }

    /// Verify a packet signature against an explicit public key
    pub fn verify_packet(
        &self,
        packet: &BitchatPacket,
        key: &VerifyingKey,
    ) -> Result<(), CryptoError> {
        let raw = packet
            .signature
            .as_deref()
            .ok_or(CryptoError::SignatureInvalid)?;
        let bytes: [u8; 64] = raw.try_into().map_err(|_| CryptoError::SignatureInvalid)?;
        let signature = Signature::from_bytes(&bytes);
        key.verify(&signable_bytes(packet), &signature)
            .map_err(|_| CryptoError::SignatureInvalid)
    }

    /// Verify a packet signature against a peer's registered signing key
    pub fn verify_packet_from(
        &self,
        packet: &BitchatPacket,
        peer: &PeerId,
    ) -> Result<(), CryptoError> {
        let keys = self.peer_keys.get(peer).ok_or(CryptoError::NoSharedSecret)?;
        self.verify_packet(packet, &keys.signing)
    }

    /// A peer's long-lived identity key, if its bundle was registered
    pub fn peer_identity_key(&self, peer: &PeerId) -> Option<VerifyingKey> {
        self.peer_keys.get(peer).map(|keys| keys.identity)
    }

    /// Hex fingerprint of a key bundle: first 8 bytes of its SHA-256
    pub fn fingerprint(bundle: &[u8]) -> String {
        let digest = Sha256::digest(bundle);
        hex::encode(&digest[..8])
    }

    /// Stable local id: first 16 bytes of SHA-256 of the identity key, hex
    pub fn local_peer_id(&self) -> String {
        let digest = Sha256::digest(self.identity_key.verifying_key().as_bytes());
        hex::encode(&digest[..16])
    }

    /// The 8-byte wire id, a prefix of the identity digest
    pub fn wire_peer_id(&self) -> PeerId {
        let digest = Sha256::digest(self.identity_key.verifying_key().as_bytes());
        PeerId(digest[..8].try_into().expect("digest is long enough"))
    }

    /// Remove every key held for a peer
    pub fn remove_peer(&self, peer: &PeerId) {
        self.peer_keys.remove(peer);
        self.session_keys.remove(peer);
    }

    /// Number of peers with an established session
    pub fn session_count(&self) -> usize {
        self.session_keys.len()
    }

    /// Group channel key operations
    pub fn channels(&self) -> &ChannelCrypto {
        &self.channels
    }

    /// Drop all peer and channel key material
    pub fn clear(&self) {
        self.peer_keys.clear();
        self.session_keys.clear();
        self.channels.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::MessageType;

    fn pair() -> (EncryptionService, EncryptionService, PeerId, PeerId) {
        let alice = EncryptionService::ephemeral();
        let bob = EncryptionService::ephemeral();
        let alice_id = alice.wire_peer_id();
        let bob_id = bob.wire_peer_id();
        alice
            .add_peer_public_key(bob_id, &bob.combined_public_key_data())
            .unwrap();
        bob.add_peer_public_key(alice_id, &alice.combined_public_key_data())
            .unwrap();
        (alice, bob, alice_id, bob_id)
    }

    #[test]
    fn test_bundle_shape() {
        let service = EncryptionService::ephemeral();
        assert_eq!(service.combined_public_key_data().len(), KEY_BUNDLE_SIZE);
        assert_eq!(service.local_peer_id().len(), 32);
        assert_eq!(
            service.local_peer_id()[..16],
            service.wire_peer_id().to_string()
        );
    }

    #[test]
    fn test_bundle_length_rejected() {
        let service = EncryptionService::ephemeral();
        let peer = PeerId([1; 8]);
        assert!(matches!(
            service.add_peer_public_key(peer, &[0u8; 95]),
            Err(CryptoError::KeyInvalid(_))
        ));
        assert!(!service.has_session(&peer));
    }

    #[test]
    fn test_box_roundtrip() {
        let (alice, bob, alice_id, bob_id) = pair();

        let sealed = alice.encrypt_for_peer(&bob_id, b"secret").unwrap();
        assert!(sealed.len() >= BOX_NONCE_SIZE + BOX_TAG_SIZE + 6);
        assert_eq!(bob.decrypt_from_peer(&alice_id, &sealed).unwrap(), b"secret");

        // Nonces are random, so two seals of the same plaintext differ.
        let again = alice.encrypt_for_peer(&bob_id, b"secret").unwrap();
        assert_ne!(sealed, again);
    }

    #[test]
    fn test_box_tamper_detected() {
        let (alice, bob, alice_id, bob_id) = pair();
        let mut sealed = alice.encrypt_for_peer(&bob_id, b"secret").unwrap();
        let last = sealed.len() - 1;
        sealed[last] ^= 0x01;
        assert_eq!(
            bob.decrypt_from_peer(&alice_id, &sealed),
            Err(CryptoError::DecryptionFailed)
        );
    }

    #[test]
    fn test_no_session_errors() {
        let alice = EncryptionService::ephemeral();
        let stranger = PeerId([9; 8]);
        assert_eq!(
            alice.encrypt_for_peer(&stranger, b"x"),
            Err(CryptoError::NoSharedSecret)
        );
        assert_eq!(
            alice.decrypt_from_peer(&stranger, &[0u8; 64]),
            Err(CryptoError::NoSharedSecret)
        );
    }

    #[test]
    fn test_session_keys_agree() {
        let (alice, bob, alice_id, bob_id) = pair();
        let a = alice.session_key(&bob_id).unwrap();
        let b = bob.session_key(&alice_id).unwrap();
        assert_eq!(*a, *b);
        assert_eq!(alice.session_count(), 1);

        alice.remove_peer(&bob_id);
        assert!(!alice.has_session(&bob_id));
        assert_eq!(alice.session_count(), 0);
    }

    #[test]
    fn test_sign_verify_packet() {
        let (alice, bob, alice_id, bob_id) = pair();
        let mut packet = BitchatPacket::new(
            MessageType::Message,
            alice_id,
            Some(bob_id),
            b"signed content".to_vec(),
        );
        alice.sign_packet(&mut packet);
        assert_eq!(packet.signature.as_ref().unwrap().len(), 64);

        bob.verify_packet_from(&packet, &alice_id).unwrap();

        // Relaying decrements the TTL; the signature must survive.
        packet.ttl -= 1;
        bob.verify_packet_from(&packet, &alice_id).unwrap();

        // Any payload tamper must not.
        packet.payload.push(b'!');
        assert_eq!(
            bob.verify_packet_from(&packet, &alice_id),
            Err(CryptoError::SignatureInvalid)
        );
    }

    #[test]
    fn test_signature_length_rejected() {
        let (alice, bob, alice_id, bob_id) = pair();
        let mut packet =
            BitchatPacket::new(MessageType::Message, alice_id, Some(bob_id), vec![1]);
        alice.sign_packet(&mut packet);
        packet.signature = Some(vec![0u8; 63]);
        assert_eq!(
            bob.verify_packet_from(&packet, &alice_id),
            Err(CryptoError::SignatureInvalid)
        );
    }

    #[test]
    fn test_fingerprint_stable() {
        let service = EncryptionService::ephemeral();
        let bundle = service.combined_public_key_data();
        let fp = EncryptionService::fingerprint(&bundle);
        assert_eq!(fp.len(), 16);
        assert_eq!(fp, EncryptionService::fingerprint(&bundle));
    }
}
