//! Identity key persistence
//!
//! The long-lived Ed25519 identity keypair survives restarts so peers can
//! recognize a node across sessions. The private half is written with
//! owner-only permissions; everything else about the node is ephemeral.

use ed25519_dalek::{SigningKey, KEYPAIR_LENGTH};
use log::{info, warn};
use rand::rngs::OsRng;
use std::fs;
use std::path::Path;

use crate::error::CryptoError;

/// File name of the private identity key, mode 0600
const IDENTITY_KEY_FILE: &str = "identity_key";

/// File name of the public identity key, mode 0644
const IDENTITY_PUBKEY_FILE: &str = "identity_pubkey";

/// Load the persisted identity, or generate and persist a fresh one
///
/// Returns the keypair and whether it was newly created.
pub fn load_or_create(data_dir: &Path) -> Result<(SigningKey, bool), CryptoError> {
    fs::create_dir_all(data_dir)
        .map_err(|e| CryptoError::Storage(format!("create {}: {e}", data_dir.display())))?;

    let key_path = data_dir.join(IDENTITY_KEY_FILE);
    if let Ok(bytes) = fs::read(&key_path) {
        if bytes.len() == KEYPAIR_LENGTH {
            let array: [u8; KEYPAIR_LENGTH] = bytes.try_into().expect("length checked");
            match SigningKey::from_keypair_bytes(&array) {
                Ok(key) => {
                    info!("loaded identity key from {}", key_path.display());
                    return Ok((key, false));
                }
                Err(e) => warn!("stored identity key is corrupt, regenerating: {e}"),
            }
        } else {
            warn!(
                "stored identity key has wrong length {}, regenerating",
                bytes.len()
            );
        }
    }

    let key = SigningKey::generate(&mut OsRng);
    persist(data_dir, &key)?;
    info!("generated new identity key in {}", data_dir.display());
    Ok((key, true))
}

/// Write the keypair to disk with the documented permissions
pub fn persist(data_dir: &Path, key: &SigningKey) -> Result<(), CryptoError> {
    let key_path = data_dir.join(IDENTITY_KEY_FILE);
    fs::write(&key_path, key.to_keypair_bytes())
        .map_err(|e| CryptoError::Storage(format!("write {}: {e}", key_path.display())))?;
    set_mode(&key_path, 0o600)?;

    let pub_path = data_dir.join(IDENTITY_PUBKEY_FILE);
    fs::write(&pub_path, key.verifying_key().to_bytes())
        .map_err(|e| CryptoError::Storage(format!("write {}: {e}", pub_path.display())))?;
    set_mode(&pub_path, 0o644)?;

    Ok(())
}

#[cfg(unix)]
fn set_mode(path: &Path, mode: u32) -> Result<(), CryptoError> {
    use std::os::unix::fs::PermissionsExt;
    fs::set_permissions(path, fs::Permissions::from_mode(mode))
        .map_err(|e| CryptoError::Storage(format!("chmod {}: {e}", path.display())))
}

#[cfg(not(unix))]
fn set_mode(_path: &Path, _mode: u32) -> Result<(), CryptoError> {
    Ok(())
}
