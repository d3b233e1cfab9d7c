//! AES-256-GCM sealing for secret credential columns.
//!
//! Each sealed value is a single base64 blob of `nonce || ciphertext`, so a
//! column stores one opaque string. A fresh random nonce is generated per
//! seal and never reused.

use aes_gcm::{
    aead::{Aead, AeadCore, KeyInit, OsRng},
    Aes256Gcm, Nonce,
};
use anyhow::{anyhow, Context, Result};
use base64::{engine::general_purpose::STANDARD as BASE64, Engine};

/// Master key size in bytes (256 bits).
const KEY_SIZE: usize = 32;

/// GCM nonce size in bytes (96 bits).
const NONCE_SIZE: usize = 12;

/// Validates that the master key decodes to exactly 32 bytes.
pub fn validate_key(key_base64: &str) -> Result<Vec<u8>> {
    let key_bytes = BASE64
        .decode(key_base64)
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

/// Seals plaintext into a base64 `nonce || ciphertext` blob.
pub fn seal(plaintext: &str, key: &[u8]) -> Result<String> {
    if key.len() != KEY_SIZE {
        return Err(anyhow!("Encryption key must be {} bytes", KEY_SIZE));
    }

    let cipher = Aes256Gcm::new_from_slice(key)
        .map_err(|e| anyhow!("Failed to create cipher: {}", e))?;

    let nonce = Aes256Gcm::generate_nonce(&mut OsRng);

    let ciphertext = cipher
        .encrypt(&nonce, plaintext.as_bytes())
        .map_err(|e| anyhow!("Encryption failed: {}", e))?;

    let mut blob = Vec::with_capacity(NONCE_SIZE + ciphertext.len());
    blob.extend_from_slice(&nonce);
    blob.extend_from_slice(&ciphertext);

    Ok(BASE64.encode(&blob))
}

/// Opens a sealed blob produced by [`seal`].
///
/// Fails on a wrong key, a truncated blob, or tampered ciphertext
/// (authenticated encryption).
pub fn open(sealed: &str, key: &[u8]) -> Result<String> {
    if key.len() != KEY_SIZE {
        return Err(anyhow!("Encryption key must be {} bytes", KEY_SIZE));
    }

    let blob = BASE64
        .decode(sealed)
        .context("Failed to decode sealed value")?;

    if blob.len() <= NONCE_SIZE {
        return Err(anyhow!(
            "Sealed value too short: {} bytes (nonce alone is {})",
            blob.len(),
            NONCE_SIZE
        ));
    }

    let (nonce_bytes, ciphertext) = blob.split_at(NONCE_SIZE);

    let cipher = Aes256Gcm::new_from_slice(key)
        .map_err(|e| anyhow!("Failed to create cipher: {}", e))?;

    let nonce = Nonce::from_slice(nonce_bytes);

    let plaintext = cipher
        .decrypt(nonce, ciphertext)
        .map_err(|e| anyhow!("Decryption failed (wrong key or corrupted data): {}", e))?;

    String::from_utf8(plaintext).context("Decrypted data is not valid UTF-8")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_validation() {
        let valid_key = BASE64.encode([0u8; 32]);
        assert!(validate_key(&valid_key).is_ok());

        let short_key = BASE64.encode([0u8; 16]);
        assert!(validate_key(&short_key).is_err());

        let long_key = BASE64.encode([0u8; 64]);
        assert!(validate_key(&long_key).is_err());

        assert!(validate_key("not-valid-base64!@#$").is_err());
    }

    #[test]
    fn test_seal_open_roundtrip() {
        let key = [0u8; 32];
        let plaintext = "my-secret-access-token-12345";

        let sealed = seal(plaintext, &key).expect("Sealing failed");
        assert_ne!(sealed, plaintext);

        let opened = open(&sealed, &key).expect("Opening failed");
        assert_eq!(opened, plaintext);
    }

    #[test]
    fn test_unique_nonces() {
        let key = [0u8; 32];
        let plaintext = "same-plaintext";

        let sealed1 = seal(plaintext, &key).unwrap();
        let sealed2 = seal(plaintext, &key).unwrap();

        // Random nonces mean the blobs never collide
        assert_ne!(sealed1, sealed2);

        assert_eq!(open(&sealed1, &key).unwrap(), plaintext);
        assert_eq!(open(&sealed2, &key).unwrap(), plaintext);
    }

    #[test]
    fn test_wrong_key_fails() {
        let key1 = [0u8; 32];
        let key2 = [1u8; 32];

        let sealed = seal("secret", &key1).unwrap();
        assert!(open(&sealed, &key2).is_err());
    }

    #[test]
    fn test_tampered_blob_fails() {
        let key = [0u8; 32];
        let sealed = seal("secret", &key).unwrap();

        let mut blob = BASE64.decode(&sealed).unwrap();
        let last = blob.len() - 1;
        blob[last] ^= 0xff;
        let tampered = BASE64.encode(&blob);

        assert!(open(&tampered, &key).is_err());
    }

    #[test]
    fn test_truncated_blob_fails() {
        let key = [0u8; 32];
        let truncated = BASE64.encode([0u8; 8]);
        assert!(open(&truncated, &key).is_err());
    }
}
