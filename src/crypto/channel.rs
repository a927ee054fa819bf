//! Channel cryptography
//!
//! Password-protected group channels share a symmetric key stretched from
//! the channel password with Argon2id and bound to the channel name with
//! HKDF. Messages are sealed with AES-256-GCM, nonce prepended.

use aes_gcm::aead::{Aead, AeadCore, KeyInit, OsRng};
use aes_gcm::{Aes256Gcm, Nonce};
use argon2::{Algorithm, Argon2, Params, Version};
use dashmap::DashMap;
use hkdf::Hkdf;
use log::debug;
use rand::RngCore;
use sha2::Sha256;
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::error::CryptoError;

/// Salt length for channel key derivation
pub const CHANNEL_SALT_SIZE: usize = 16;

/// AES-GCM nonce length
const GCM_NONCE_SIZE: usize = 12;

/// HKDF context binding a key to the channel namespace
const CHANNEL_KDF_INFO: &[u8] = b"bitchat-channel-v1";

/// Argon2id memory cost in KiB
const ARGON_MEMORY_KIB: u32 = 64 * 1024;

/// Argon2id iteration count
const ARGON_TIME_COST: u32 = 1;

/// Argon2id parallelism
const ARGON_LANES: u32 = 4;

/// Derive a 32-byte channel key from a password and salt
///
/// The same password, salt and channel name always produce the same key,
/// on any node and across restarts.
pub fn derive_channel_key(
    channel: &str,
    password: &str,
    salt: &[u8; CHANNEL_SALT_SIZE],
) -> Result<[u8; 32], CryptoError> {
    let params = Params::new(ARGON_MEMORY_KIB, ARGON_TIME_COST, ARGON_LANES, Some(32))
        .map_err(|e| CryptoError::KeyInvalid(e.to_string()))?;
    let argon = Argon2::new(Algorithm::Argon2id, Version::V0x13, params);

    let mut stretched = [0u8; 32];
    argon
        .hash_password_into(password.as_bytes(), salt, &mut stretched)
        .map_err(|e| CryptoError::KeyInvalid(e.to_string()))?;

    let kdf = Hkdf::<Sha256>::new(Some(channel.as_bytes()), &stretched);
    let mut key = [0u8; 32];
    kdf.expand(CHANNEL_KDF_INFO, &mut key)
        .map_err(|e| CryptoError::KeyInvalid(e.to_string()))?;
    stretched.zeroize();

    Ok(key)
}

/// Generate a fresh random channel salt
pub fn generate_salt() -> [u8; CHANNEL_SALT_SIZE] {
    let mut salt = [0u8; CHANNEL_SALT_SIZE];
    rand::thread_rng().fill_bytes(&mut salt);
    salt
}

/// Derived key material for one channel
#[derive(Zeroize, ZeroizeOnDrop)]
pub struct ChannelKey {
    key: [u8; 32],
    #[zeroize(skip)]
    salt: [u8; CHANNEL_SALT_SIZE],
}

impl ChannelKey {
    /// Derive for a newly created channel, generating the salt
    pub fn create(channel: &str, password: &str) -> Result<Self, CryptoError> {
        let salt = generate_salt();
        Ok(Self {
            key: derive_channel_key(channel, password, &salt)?,
            salt,
        })
    }

    /// Re-derive for an existing channel from its shared salt
    pub fn from_salt(
        channel: &str,
        password: &str,
        salt: [u8; CHANNEL_SALT_SIZE],
    ) -> Result<Self, CryptoError> {
        Ok(Self {
            key: derive_channel_key(channel, password, &salt)?,
            salt,
        })
    }

    /// Salt to share with joining members
    pub fn salt(&self) -> &[u8; CHANNEL_SALT_SIZE] {
        &self.salt
    }
}

/// Key cache and sealing operations for joined channels
pub struct ChannelCrypto {
    keys: DashMap<String, ChannelKey>,
}

impl ChannelCrypto {
    pub fn new() -> Self {
        Self {
            keys: DashMap::new(),
        }
    }

    /// Install a key for a channel, replacing any previous one
    pub fn set_channel_key(&self, channel: &str, key: ChannelKey) {
        self.keys.insert(channel.to_string(), key);
    }

    /// Forget a channel's key
    pub fn remove_channel_key(&self, channel: &str) {
        self.keys.remove(channel);
    }

    /// Whether a key is installed for the channel
    pub fn has_channel_key(&self, channel: &str) -> bool {
        self.keys.contains_key(channel)
    }

    /// Salt of a joined channel
    pub fn channel_salt(&self, channel: &str) -> Option<[u8; CHANNEL_SALT_SIZE]> {
        self.keys.get(channel).map(|entry| *entry.salt())
    }

    /// Channels with an installed key
    pub fn joined_channels(&self) -> Vec<String> {
        self.keys.iter().map(|entry| entry.key().clone()).collect()
    }

    /// Seal a channel payload; output is nonce followed by ciphertext
    pub fn encrypt(&self, channel: &str, plaintext: &[u8]) -> Result<Vec<u8>, CryptoError> {
        let entry = self.keys.get(channel).ok_or(CryptoError::NoSharedSecret)?;
        let cipher = Aes256Gcm::new_from_slice(&entry.key)
            .map_err(|e| CryptoError::KeyInvalid(e.to_string()))?;

        let nonce = Aes256Gcm::generate_nonce(&mut OsRng);
        let ciphertext = cipher
            .encrypt(&nonce, plaintext)
            .map_err(|_| CryptoError::EncryptionFailed)?;

        let mut out = Vec::with_capacity(GCM_NONCE_SIZE + ciphertext.len());
        out.extend_from_slice(&nonce);
        out.extend_from_slice(&ciphertext);
        debug!("sealed {} bytes for channel {channel}", plaintext.len());
        Ok(out)
    }

    /// Open a channel payload produced by `encrypt`
    pub fn decrypt(&self, channel: &str, data: &[u8]) -> Result<Vec<u8>, CryptoError> {
        if data.len() < GCM_NONCE_SIZE + 16 {
            return Err(CryptoError::DecryptionFailed);
        }
        let entry = self.keys.get(channel).ok_or(CryptoError::NoSharedSecret)?;
        let cipher = Aes256Gcm::new_from_slice(&entry.key)
            .map_err(|e| CryptoError::KeyInvalid(e.to_string()))?;

        let nonce = Nonce::from_slice(&data[..GCM_NONCE_SIZE]);
        cipher
            .decrypt(nonce, &data[GCM_NONCE_SIZE..])
            .map_err(|_| CryptoError::DecryptionFailed)
    }

    /// Drop every channel key
    pub fn clear(&self) {
        self.keys.clear();
    }
}

impl Default for ChannelCrypto {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_derivation_reproducible() {
        let salt = [7u8; CHANNEL_SALT_SIZE];
        let a = derive_channel_key("#general", "hunter2", &salt).unwrap();
        let b = derive_channel_key("#general", "hunter2", &salt).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn test_key_depends_on_all_inputs() {
        let salt = [7u8; CHANNEL_SALT_SIZE];
        let base = derive_channel_key("#general", "hunter2", &salt).unwrap();
        assert_ne!(
            base,
            derive_channel_key("#other", "hunter2", &salt).unwrap()
        );
        assert_ne!(
            base,
            derive_channel_key("#general", "hunter3", &salt).unwrap()
        );
        assert_ne!(
            base,
            derive_channel_key("#general", "hunter2", &[8u8; CHANNEL_SALT_SIZE]).unwrap()
        );
    }

    #[test]
    fn test_channel_seal_roundtrip() {
        let crypto = ChannelCrypto::new();
        let key = ChannelKey::create("#secret", "pass").unwrap();
        let salt = *key.salt();
        crypto.set_channel_key("#secret", key);

        let sealed = crypto.encrypt("#secret", b"meet at dawn").unwrap();
        assert_ne!(&sealed[GCM_NONCE_SIZE..], b"meet at dawn".as_slice());
        assert_eq!(crypto.decrypt("#secret", &sealed).unwrap(), b"meet at dawn");

        // A member joining with the shared salt derives the same key.
        let rejoined = ChannelKey::from_salt("#secret", "pass", salt).unwrap();
        let other = ChannelCrypto::new();
        other.set_channel_key("#secret", rejoined);
        assert_eq!(other.decrypt("#secret", &sealed).unwrap(), b"meet at dawn");
    }

    #[test]
    fn test_wrong_password_fails() {
        let crypto = ChannelCrypto::new();
        let key = ChannelKey::create("#secret", "pass").unwrap();
        let salt = *key.salt();
        crypto.set_channel_key("#secret", key);
        let sealed = crypto.encrypt("#secret", b"payload").unwrap();

        let wrong = ChannelKey::from_salt("#secret", "wrong", salt).unwrap();
        let other = ChannelCrypto::new();
        other.set_channel_key("#secret", wrong);
        assert_eq!(
            other.decrypt("#secret", &sealed),
            Err(CryptoError::DecryptionFailed)
        );
    }

    #[test]
    fn test_unknown_channel() {
        let crypto = ChannelCrypto::new();
        assert_eq!(
            crypto.encrypt("#nope", b"x"),
            Err(CryptoError::NoSharedSecret)
        );
        assert!(!crypto.has_channel_key("#nope"));
    }

    #[test]
    fn test_truncated_ciphertext() {
        let crypto = ChannelCrypto::new();
        crypto.set_channel_key("#c", ChannelKey::create("#c", "p").unwrap());
        assert_eq!(
            crypto.decrypt("#c", &[0u8; 10]),
            Err(CryptoError::DecryptionFailed)
        );
    }
}
