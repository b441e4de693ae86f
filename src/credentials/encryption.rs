//! AES-256-GCM envelope for credential tokens.
//!
//! Each seal uses a fresh random nonce, so sealing the same token twice gives
//! different ciphertexts. The sealed form carries the key version it was made
//! with so records survive a change of active key:
//!
//! ```text
//! v<version>.<base64(nonce || ciphertext || tag)>
//! ```

use crate::error::{OAuthError, Result};
use aes_gcm::{
    aead::{Aead, AeadCore, KeyInit, OsRng},
    Aes256Gcm, Nonce,
};
use anyhow::{anyhow, Context};
use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use std::collections::HashMap;
use std::fmt;

/// Size of the encryption key in bytes (256 bits)
const KEY_SIZE: usize = 32;

/// Size of the nonce in bytes (96 bits, standard for GCM)
const NONCE_SIZE: usize = 12;

/// Size of the GCM authentication tag in bytes
const TAG_SIZE: usize = 16;

/// Validates that a key is exactly 32 bytes when base64 decoded.
///
/// # Arguments
/// * `key_base64` - Base64-encoded key
///
/// # Returns
/// * `Ok(Vec<u8>)` - Decoded key bytes (32 bytes)
/// * `Err` - If key is invalid length or invalid base64
pub fn validate_key(key_base64: &str) -> anyhow::Result<Vec<u8>> {
    let key_bytes = BASE64
        .decode(key_base64.trim())
        .context("Failed to decode base64 encryption key")?;

    if key_bytes.len() != KEY_SIZE {
        return Err(anyhow!(
            "Encryption key must be {} bytes (256 bits), got {} bytes",
            KEY_SIZE,
            key_bytes.len()
        ));
    }

    Ok(key_bytes)
}

/// Authenticated encryption of secret strings at rest.
///
/// Holds every known key version; new records are always sealed with the
/// active one. Key material is loaded once at startup and never changes.
#[derive(Clone)]
pub struct Envelope {
    ciphers: HashMap<u32, Aes256Gcm>,
    active_version: u32,
}

impl Envelope {
    /// Builds an envelope from raw 32-byte keys indexed by version.
    ///
    /// Fails if any key has the wrong length or the active version has no key.
    pub fn new(active_version: u32, keys: HashMap<u32, Vec<u8>>) -> anyhow::Result<Self> {
        let mut ciphers = HashMap::with_capacity(keys.len());
        for (version, key) in keys {
            if key.len() != KEY_SIZE {
                return Err(anyhow!(
                    "Encryption key v{} must be {} bytes, got {}",
                    version,
                    KEY_SIZE,
                    key.len()
                ));
            }
            let cipher = Aes256Gcm::new_from_slice(&key)
                .map_err(|e| anyhow!("Failed to create cipher for key v{}: {}", version, e))?;
            ciphers.insert(version, cipher);
        }

        if !ciphers.contains_key(&active_version) {
            return Err(anyhow!(
                "No encryption key configured for active version v{}",
                active_version
            ));
        }

        Ok(Self {
            ciphers,
            active_version,
        })
    }

    /// Envelope with a single base64-encoded key as version 1.
    pub fn from_base64_key(key_base64: &str) -> anyhow::Result<Self> {
        let key = validate_key(key_base64).context("Invalid encryption key")?;
        Self::new(1, HashMap::from([(1, key)]))
    }

    pub fn active_version(&self) -> u32 {
        self.active_version
    }

    /// Encrypts `plaintext` with the active key and a random nonce.
    pub fn seal(&self, plaintext: &str) -> Result<String> {
        let cipher = self
            .ciphers
            .get(&self.active_version)
            .ok_or(OAuthError::Integrity)?;

        // Generate random nonce (never reuse!)
        let nonce = Aes256Gcm::generate_nonce(&mut OsRng);

        let ciphertext = cipher.encrypt(&nonce, plaintext.as_bytes()).map_err(|_| {
            tracing::error!(key_version = self.active_version, "Token encryption failed");
            OAuthError::Integrity
        })?;

        let mut payload = Vec::with_capacity(NONCE_SIZE + ciphertext.len());
        payload.extend_from_slice(&nonce);
        payload.extend_from_slice(&ciphertext);

        Ok(format!("v{}.{}", self.active_version, BASE64.encode(payload)))
    }

    /// Decrypts a sealed value.
    ///
    /// Any failure (unknown key version, bad framing, failed tag, invalid
    /// UTF-8) is `OAuthError::Integrity`. Never returns altered plaintext.
    pub fn open(&self, sealed: &str) -> Result<String> {
        let (version, encoded) = parse_sealed(sealed).ok_or(OAuthError::Integrity)?;

        let cipher = self.ciphers.get(&version).ok_or_else(|| {
            tracing::error!(key_version = version, "No key for sealed credential version");
            OAuthError::Integrity
        })?;

        let payload = BASE64.decode(encoded).map_err(|_| OAuthError::Integrity)?;
        if payload.len() < NONCE_SIZE + TAG_SIZE {
            return Err(OAuthError::Integrity);
        }

        let (nonce_bytes, ciphertext) = payload.split_at(NONCE_SIZE);
        let nonce = Nonce::from_slice(nonce_bytes);

        let plaintext = cipher
            .decrypt(nonce, ciphertext)
            .map_err(|_| OAuthError::Integrity)?;

        String::from_utf8(plaintext).map_err(|_| OAuthError::Integrity)
    }
}

/// Splits `v<version>.<payload>` into its parts.
fn parse_sealed(sealed: &str) -> Option<(u32, &str)> {
    let (version, payload) = sealed.strip_prefix('v')?.split_once('.')?;
    let version = version.parse::<u32>().ok()?;
    Some((version, payload))
}

impl fmt::Debug for Envelope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut versions: Vec<u32> = self.ciphers.keys().copied().collect();
        versions.sort_unstable();
        f.debug_struct("Envelope")
            .field("active_version", &self.active_version)
            .field("key_versions", &versions)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn envelope_with(version: u32, byte: u8) -> Envelope {
        Envelope::new(version, HashMap::from([(version, vec![byte; KEY_SIZE])])).unwrap()
    }

    #[test]
    fn test_key_validation() {
        // Valid 32-byte key (base64-encoded)
        let valid_key = BASE64.encode([0u8; 32]);
        assert!(validate_key(&valid_key).is_ok());

        // Too short
        let short_key = BASE64.encode([0u8; 16]);
        assert!(validate_key(&short_key).is_err());

        // Too long
        let long_key = BASE64.encode([0u8; 64]);
        assert!(validate_key(&long_key).is_err());

        // Invalid base64
        assert!(validate_key("not-valid-base64!@#$").is_err());
    }

    #[test]
    fn test_missing_active_key_rejected() {
        let keys = HashMap::from([(1, vec![0u8; KEY_SIZE])]);
        assert!(Envelope::new(2, keys).is_err());
    }

    #[test]
    fn test_seal_open_roundtrip() {
        let envelope = envelope_with(1, 0);

        for plaintext in ["ya29.a0AfH6SMB-access", "", "üñíçødé token ✓"] {
            let sealed = envelope.seal(plaintext).unwrap();
            assert_ne!(sealed, plaintext);
            assert!(sealed.starts_with("v1."));
            assert_eq!(envelope.open(&sealed).unwrap(), plaintext);
        }
    }

    #[test]
    fn test_seal_is_non_deterministic() {
        let envelope = envelope_with(1, 0);

        let first = envelope.seal("same-plaintext").unwrap();
        let second = envelope.seal("same-plaintext").unwrap();

        // Different random nonces
        assert_ne!(first, second);
        assert_eq!(envelope.open(&first).unwrap(), "same-plaintext");
        assert_eq!(envelope.open(&second).unwrap(), "same-plaintext");
    }

    #[test]
    fn test_every_tampered_byte_fails() {
        let envelope = envelope_with(1, 7);
        let sealed = envelope.seal("refresh-token-1").unwrap();
        let (_, encoded) = parse_sealed(&sealed).unwrap();
        let payload = BASE64.decode(encoded).unwrap();

        for i in 0..payload.len() {
            let mut tampered = payload.clone();
            tampered[i] ^= 0x01;
            let forged = format!("v1.{}", BASE64.encode(&tampered));
            assert_eq!(envelope.open(&forged), Err(OAuthError::Integrity), "byte {}", i);
        }
    }

    #[test]
    fn test_wrong_key_fails() {
        let sealed = envelope_with(1, 0).seal("secret").unwrap();
        assert_eq!(envelope_with(1, 1).open(&sealed), Err(OAuthError::Integrity));
    }

    #[test]
    fn test_malformed_input_fails() {
        let envelope = envelope_with(1, 0);

        for input in ["", "secret", "v1", "v1.", "vX.abcd", "1.abcd", "v1.not-base64!", "v1.AAAA"] {
            assert_eq!(envelope.open(input), Err(OAuthError::Integrity), "{:?}", input);
        }
    }

    #[test]
    fn test_old_version_opens_after_rotation() {
        let old = envelope_with(1, 1);
        let sealed_v1 = old.seal("issued-before-rotation").unwrap();

        let rotated = Envelope::new(
            2,
            HashMap::from([(1, vec![1u8; KEY_SIZE]), (2, vec![2u8; KEY_SIZE])]),
        )
        .unwrap();

        assert_eq!(rotated.open(&sealed_v1).unwrap(), "issued-before-rotation");
        let sealed_v2 = rotated.seal("issued-after-rotation").unwrap();
        assert!(sealed_v2.starts_with("v2."));

        // The old envelope cannot read records sealed with an unknown version
        assert_eq!(old.open(&sealed_v2), Err(OAuthError::Integrity));
    }

    #[test]
    fn test_debug_does_not_leak_keys() {
        let envelope = envelope_with(3, 0xAB);
        let debug = format!("{:?}", envelope);
        assert!(debug.contains("active_version: 3"));
        assert!(debug.contains("key_versions: [3]"));
        assert!(!debug.contains("171"));
    }
}
