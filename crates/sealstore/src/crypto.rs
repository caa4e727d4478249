//! AES-256-GCM sealing and Argon2id password derivation.

use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Nonce};
use argon2::{Algorithm, Argon2, Params, Version};
use rand::RngCore;
use zeroize::Zeroize;

use crate::error::{Result, StoreError};
use crate::{KEY_SIZE, NONCE_SIZE, SALT_LEN};

/// Argon2id cost parameters: 64 MiB memory, 3 passes, 4 lanes.
const ARGON2_MEM_KIB: u32 = 65536;
const ARGON2_TIME: u32 = 3;
const ARGON2_LANES: u32 = 4;

/// Salts shorter than this are rejected by [`derive_primary_key`].
const MIN_SALT_LEN: usize = 16;

/// The password-derived key that wraps every data key.
///
/// Never written to disk in clear; zeroized on drop.
#[derive(Clone)]
pub struct PrimaryKey {
    bytes: [u8; KEY_SIZE],
}

impl PrimaryKey {
    pub fn from_bytes(bytes: [u8; KEY_SIZE]) -> Self {
        Self { bytes }
    }

    pub fn as_bytes(&self) -> &[u8; KEY_SIZE] {
        &self.bytes
    }
}

impl Drop for PrimaryKey {
    fn drop(&mut self) {
        self.bytes.zeroize();
    }
}

impl std::fmt::Debug for PrimaryKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PrimaryKey")
            .field("bytes", &"[REDACTED]")
            .finish()
    }
}

/// Derive the primary key from a password and salt using Argon2id.
///
/// The salt is stored alongside the encrypted data and does not need to be
/// secret, but it must be at least 16 bytes long.
pub fn derive_primary_key(password: &[u8], salt: &[u8]) -> Result<PrimaryKey> {
    if salt.len() < MIN_SALT_LEN {
        return Err(StoreError::Crypto(format!(
            "salt too short: {} bytes (minimum {MIN_SALT_LEN})",
            salt.len()
        )));
    }

    let params = Params::new(ARGON2_MEM_KIB, ARGON2_TIME, ARGON2_LANES, Some(KEY_SIZE))
        .map_err(|e| StoreError::Crypto(format!("invalid Argon2id params: {e}")))?;
    let argon2 = Argon2::new(Algorithm::Argon2id, Version::V0x13, params);

    let mut key = [0u8; KEY_SIZE];
    argon2
        .hash_password_into(password, salt, &mut key)
        .map_err(|e| StoreError::Crypto(format!("Argon2id derivation failed: {e}")))?;

    Ok(PrimaryKey::from_bytes(key))
}

/// Generate a random salt for a new store.
pub fn generate_salt() -> [u8; SALT_LEN] {
    let mut salt = [0u8; SALT_LEN];
    rand::thread_rng().fill_bytes(&mut salt);
    salt
}

/// Encrypt `plaintext` under `key` with a fresh random nonce.
///
/// Returns the nonce and the ciphertext (tag appended).
pub fn seal(key: &[u8; KEY_SIZE], plaintext: &[u8]) -> Result<([u8; NONCE_SIZE], Vec<u8>)> {
    let cipher = Aes256Gcm::new(key.into());

    let mut nonce_bytes = [0u8; NONCE_SIZE];
    rand::thread_rng().fill_bytes(&mut nonce_bytes);
    let nonce = Nonce::from_slice(&nonce_bytes);

    let ciphertext = cipher
        .encrypt(nonce, plaintext)
        .map_err(|_| StoreError::Crypto("encryption failed".into()))?;

    Ok((nonce_bytes, ciphertext))
}

/// Decrypt and authenticate `ciphertext` under `key`.
///
/// Fails with [`StoreError::AuthFailed`] if the tag does not verify; the
/// caller decides whether that means a wrong password (key envelopes) or a
/// damaged record (data files).
pub fn open(key: &[u8; KEY_SIZE], nonce: &[u8], ciphertext: &[u8]) -> Result<Vec<u8>> {
    if nonce.len() != NONCE_SIZE {
        return Err(StoreError::Crypto(format!(
            "bad nonce length: {} bytes",
            nonce.len()
        )));
    }

    let cipher = Aes256Gcm::new(key.into());
    cipher
        .decrypt(Nonce::from_slice(nonce), ciphertext)
        .map_err(|_| StoreError::AuthFailed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::TAG_SIZE;

    #[test]
    fn derivation_is_deterministic() {
        let salt = [7u8; SALT_LEN];
        let a = derive_primary_key(b"correct horse", &salt).unwrap();
        let b = derive_primary_key(b"correct horse", &salt).unwrap();
        assert_eq!(a.as_bytes(), b.as_bytes());
    }

    #[test]
    fn different_salts_diverge() {
        let a = derive_primary_key(b"pw", &[1u8; SALT_LEN]).unwrap();
        let b = derive_primary_key(b"pw", &[2u8; SALT_LEN]).unwrap();
        assert_ne!(a.as_bytes(), b.as_bytes());
    }

    #[test]
    fn different_passwords_diverge() {
        let salt = [3u8; SALT_LEN];
        let a = derive_primary_key(b"pw-a", &salt).unwrap();
        let b = derive_primary_key(b"pw-b", &salt).unwrap();
        assert_ne!(a.as_bytes(), b.as_bytes());
    }

    #[test]
    fn short_salt_is_rejected() {
        assert!(matches!(
            derive_primary_key(b"pw", &[0u8; 15]),
            Err(StoreError::Crypto(_))
        ));
    }

    #[test]
    fn seal_open_roundtrip() {
        let key = [42u8; KEY_SIZE];
        let (nonce, ct) = seal(&key, b"attack at dawn").unwrap();
        assert_eq!(open(&key, &nonce, &ct).unwrap(), b"attack at dawn");
    }

    #[test]
    fn empty_plaintext_roundtrips() {
        let key = [42u8; KEY_SIZE];
        let (nonce, ct) = seal(&key, b"").unwrap();
        assert_eq!(ct.len(), TAG_SIZE);
        assert_eq!(open(&key, &nonce, &ct).unwrap(), b"");
    }

    #[test]
    fn tampered_ciphertext_fails() {
        let key = [42u8; KEY_SIZE];
        let (nonce, mut ct) = seal(&key, b"payload").unwrap();
        ct[0] ^= 0xFF;
        assert!(matches!(
            open(&key, &nonce, &ct),
            Err(StoreError::AuthFailed)
        ));
    }

    #[test]
    fn wrong_key_fails() {
        let (nonce, ct) = seal(&[1u8; KEY_SIZE], b"payload").unwrap();
        assert!(matches!(
            open(&[2u8; KEY_SIZE], &nonce, &ct),
            Err(StoreError::AuthFailed)
        ));
    }

    #[test]
    fn generated_salts_differ() {
        assert_ne!(generate_salt(), generate_salt());
    }
}
