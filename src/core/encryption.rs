//! Payload sealing with AES-256-GCM
//!
//! A sealed payload is laid out as `nonce(12) || ciphertext || tag(16)`.
//! Every seal draws a fresh random nonce, so sealing the same image twice
//! yields different bytes. An authentication failure is reported as
//! [`BlockError::CorruptData`]: a wrong key and a flipped bit look the same
//! to a reader.

use crate::error::{BlockError, Result};
use aes_gcm::{
    aead::{Aead, KeyInit, OsRng},
    Aes256Gcm, Nonce,
};
use rand::RngCore;
use sha2::{Digest, Sha256};

/// Raw AES-256 key
pub type EncryptionKey = [u8; 32];

const NONCE_LEN: usize = 12;
const TAG_LEN: usize = 16;

/// Bytes a sealed payload carries beyond its plaintext
pub const SEAL_OVERHEAD: usize = NONCE_LEN + TAG_LEN;

/// Draw a random key from the operating system's generator
pub fn generate_key() -> EncryptionKey {
    let mut key = EncryptionKey::default();
    OsRng.fill_bytes(&mut key);
    key
}

/// Turn operator-supplied key material into an AES-256 key
///
/// 32 bytes are taken as-is, anything else goes through SHA-256.
pub fn derive_key(material: &[u8]) -> Result<EncryptionKey> {
    if material.is_empty() {
        return Err(BlockError::ConfigError(
            "encryption key material must not be empty".to_string(),
        ));
    }
    Ok(EncryptionKey::try_from(material).unwrap_or_else(|_| Sha256::digest(material).into()))
}

/// A keyed AES-GCM instance, built once per store
#[derive(Clone)]
pub struct PayloadCipher {
    aead: Aes256Gcm,
}

impl std::fmt::Debug for PayloadCipher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("PayloadCipher(<redacted>)")
    }
}

impl PayloadCipher {
    pub fn new(key: &EncryptionKey) -> Self {
        PayloadCipher {
            aead: Aes256Gcm::new(key.into()),
        }
    }

    pub fn from_material(material: &[u8]) -> Result<Self> {
        derive_key(material).map(|key| PayloadCipher::new(&key))
    }

    pub fn seal(&self, plaintext: &[u8]) -> Result<Vec<u8>> {
        let mut nonce = [0u8; NONCE_LEN];
        OsRng.fill_bytes(&mut nonce);

        let body = self
            .aead
            .encrypt(Nonce::from_slice(&nonce), plaintext)
            .map_err(|e| BlockError::AllocationFailure(format!("sealing payload: {}", e)))?;

        let mut sealed = Vec::with_capacity(NONCE_LEN + body.len());
        sealed.extend_from_slice(&nonce);
        sealed.extend_from_slice(&body);
        Ok(sealed)
    }

    pub fn open(&self, sealed: &[u8]) -> Result<Vec<u8>> {
        if sealed.len() < SEAL_OVERHEAD {
            return Err(BlockError::CorruptData(format!(
                "sealed payload of {} bytes is shorter than its envelope",
                sealed.len()
            )));
        }
        let (nonce, body) = sealed.split_at(NONCE_LEN);
        self.aead
            .decrypt(Nonce::from_slice(nonce), body)
            .map_err(|_| BlockError::CorruptData("payload failed authentication".to_string()))
    }
}
