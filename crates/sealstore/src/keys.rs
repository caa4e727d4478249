//! The `.keys/` directory: data-key envelopes, salt, current-key pointer.
//!
//! Key envelope format: `[alg:1][nonce:12][ciphertext+tag]`, the data key
//! sealed under the primary key. Algorithm byte 0 is AES-256-GCM; any other
//! value is a fatal read-side error, reserved for future agility.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

use rand::RngCore;
use zeroize::Zeroize;

use crate::crypto::{self, PrimaryKey};
use crate::error::{Result, StoreError};
use crate::{
    io, ALG_AES_256_GCM, INDEX_FILE, KEY_DIR_NAME, KEY_SIZE, LOCK_FILE, NONCE_SIZE, SALT_FILE,
    TMP_DIR_NAME,
};

/// A 256-bit data key used to encrypt user payloads. Zeroized on drop.
#[derive(Clone)]
pub struct DataKey {
    bytes: [u8; KEY_SIZE],
}

impl DataKey {
    pub fn from_bytes(bytes: [u8; KEY_SIZE]) -> Self {
        Self { bytes }
    }

    pub fn as_bytes(&self) -> &[u8; KEY_SIZE] {
        &self.bytes
    }

    /// Generate a fresh random data key.
    pub fn generate() -> Self {
        let mut bytes = [0u8; KEY_SIZE];
        rand::thread_rng().fill_bytes(&mut bytes);
        Self { bytes }
    }
}

impl Drop for DataKey {
    fn drop(&mut self) {
        self.bytes.zeroize();
    }
}

impl std::fmt::Debug for DataKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DataKey")
            .field("bytes", &"[REDACTED]")
            .finish()
    }
}

/// Paths and operations for one key directory.
#[derive(Debug, Clone)]
pub struct KeyVault {
    key_dir: PathBuf,
    salt_file: PathBuf,
    index_file: PathBuf,
    lock_file: PathBuf,
    tmp_dir: PathBuf,
}

impl KeyVault {
    /// The vault of the store rooted at `root` (i.e. `root/.keys`).
    pub fn new(root: &Path) -> Self {
        Self::at(root.join(KEY_DIR_NAME))
    }

    /// A vault over an explicit key directory. Used by the password-change
    /// protocol, which operates on a snapshot copy of `.keys/`.
    pub fn at(key_dir: PathBuf) -> Self {
        Self {
            salt_file: key_dir.join(SALT_FILE),
            index_file: key_dir.join(INDEX_FILE),
            lock_file: key_dir.join(LOCK_FILE),
            tmp_dir: key_dir.join(TMP_DIR_NAME),
            key_dir,
        }
    }

    pub fn key_dir(&self) -> &Path {
        &self.key_dir
    }

    pub fn salt_file(&self) -> &Path {
        &self.salt_file
    }

    pub fn index_file(&self) -> &Path {
        &self.index_file
    }

    pub fn lock_file(&self) -> &Path {
        &self.lock_file
    }

    pub fn tmp_dir(&self) -> &Path {
        &self.tmp_dir
    }

    pub fn key_path(&self, index: u8) -> PathBuf {
        self.key_dir.join(format!("key{index}"))
    }

    /// Generate a fresh salt, persist it, and derive the primary key.
    /// Used once, at store creation.
    pub fn init_primary(&self, password: &[u8]) -> Result<PrimaryKey> {
        let salt = crypto::generate_salt();
        io::write_file(&self.salt_file, &salt)?;
        crypto::derive_primary_key(password, &salt)
    }

    /// Derive the primary key from the persisted salt.
    pub fn derive_primary(&self, password: &[u8]) -> Result<PrimaryKey> {
        let salt = io::read_file(&self.salt_file)?;
        crypto::derive_primary_key(password, &salt)
    }

    /// Generate a new data key for `index` and persist its envelope.
    pub fn generate_key(&self, primary: &PrimaryKey, index: u8) -> Result<DataKey> {
        let key = DataKey::generate();
        let envelope = seal_envelope(primary, &key)?;
        io::write_file(&self.key_path(index), &envelope)?;
        Ok(key)
    }

    /// Load and unwrap the data key for `index`.
    pub fn load_key(&self, primary: &PrimaryKey, index: u8) -> Result<DataKey> {
        load_key_at(&self.key_path(index), primary)
    }

    pub fn delete_key(&self, index: u8) -> Result<()> {
        std::fs::remove_file(self.key_path(index))?;
        Ok(())
    }

    /// Persist the current-key pointer. A single-byte write, so it cannot
    /// tear.
    pub fn save_current_index(&self, index: u8) -> Result<()> {
        io::write_file(&self.index_file, &[index])
    }

    pub fn load_current_index(&self) -> Result<u8> {
        let data = io::read_file(&self.index_file)?;
        if data.len() != 1 {
            return Err(StoreError::Corrupt(format!(
                "current-key file holds {} bytes, expected 1",
                data.len()
            )));
        }
        Ok(data[0])
    }

    /// Indices of every key file currently on disk.
    pub fn list_key_indices(&self) -> Result<BTreeSet<u8>> {
        let mut indices = BTreeSet::new();
        for entry in std::fs::read_dir(&self.key_dir)? {
            let entry = entry?;
            if entry.file_type()?.is_dir() {
                continue;
            }
            let name = entry.file_name();
            let Some(name) = name.to_str() else { continue };
            if let Some(rest) = name.strip_prefix("key") {
                if let Ok(index) = rest.parse::<u8>() {
                    indices.insert(index);
                }
            }
        }
        Ok(indices)
    }
}

/// Wrap a data key under the primary key: `[alg:1][nonce:12][ct+tag]`.
pub fn seal_envelope(primary: &PrimaryKey, key: &DataKey) -> Result<Vec<u8>> {
    let (nonce, ciphertext) = crypto::seal(primary.as_bytes(), key.as_bytes())?;

    let mut envelope = Vec::with_capacity(1 + NONCE_SIZE + ciphertext.len());
    envelope.push(ALG_AES_256_GCM);
    envelope.extend_from_slice(&nonce);
    envelope.extend_from_slice(&ciphertext);
    Ok(envelope)
}

/// Load and unwrap the key envelope at `path`.
///
/// Fails `Corrupt` on framing damage, `UnsupportedAlgorithm` on an unknown
/// algorithm byte, and `AuthFailed` when the envelope does not open under
/// `primary` — which on the current key means a wrong password.
pub fn load_key_at(path: &Path, primary: &PrimaryKey) -> Result<DataKey> {
    let data = io::read_file(path)?;

    if data.is_empty() {
        return Err(StoreError::Corrupt(format!(
            "empty key file {}",
            path.display()
        )));
    }
    if data[0] != ALG_AES_256_GCM {
        return Err(StoreError::UnsupportedAlgorithm(data[0]));
    }
    if data.len() < 1 + NONCE_SIZE {
        return Err(StoreError::Corrupt(format!(
            "truncated key file {}",
            path.display()
        )));
    }

    let nonce = &data[1..1 + NONCE_SIZE];
    let ciphertext = &data[1 + NONCE_SIZE..];

    let mut raw = crypto::open(primary.as_bytes(), nonce, ciphertext)?;
    if raw.len() != KEY_SIZE {
        raw.zeroize();
        return Err(StoreError::Corrupt(format!(
            "unwrapped key has {} bytes, expected {KEY_SIZE}",
            raw.len()
        )));
    }

    let mut bytes = [0u8; KEY_SIZE];
    bytes.copy_from_slice(&raw);
    raw.zeroize();
    Ok(DataKey::from_bytes(bytes))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_primary() -> PrimaryKey {
        PrimaryKey::from_bytes([42u8; KEY_SIZE])
    }

    fn test_vault() -> (tempfile::TempDir, KeyVault) {
        let dir = tempfile::tempdir().unwrap();
        let vault = KeyVault::new(dir.path());
        std::fs::create_dir_all(vault.key_dir()).unwrap();
        (dir, vault)
    }

    #[test]
    fn generated_keys_differ() {
        assert_ne!(DataKey::generate().as_bytes(), DataKey::generate().as_bytes());
    }

    #[test]
    fn generate_then_load_roundtrip() {
        let (_dir, vault) = test_vault();
        let primary = test_primary();

        let key = vault.generate_key(&primary, 0).unwrap();
        let loaded = vault.load_key(&primary, 0).unwrap();
        assert_eq!(key.as_bytes(), loaded.as_bytes());
    }

    #[test]
    fn wrong_primary_fails_auth() {
        let (_dir, vault) = test_vault();
        vault.generate_key(&test_primary(), 0).unwrap();

        let wrong = PrimaryKey::from_bytes([7u8; KEY_SIZE]);
        assert!(matches!(
            vault.load_key(&wrong, 0),
            Err(StoreError::AuthFailed)
        ));
    }

    #[test]
    fn unknown_algorithm_byte_is_fatal() {
        let (_dir, vault) = test_vault();
        let primary = test_primary();
        vault.generate_key(&primary, 0).unwrap();

        let mut envelope = std::fs::read(vault.key_path(0)).unwrap();
        envelope[0] = 9;
        std::fs::write(vault.key_path(0), &envelope).unwrap();

        assert!(matches!(
            vault.load_key(&primary, 0),
            Err(StoreError::UnsupportedAlgorithm(9))
        ));
    }

    #[test]
    fn truncated_envelope_is_corrupt() {
        let (_dir, vault) = test_vault();
        std::fs::write(vault.key_path(0), [ALG_AES_256_GCM, 1, 2, 3]).unwrap();
        assert!(matches!(
            vault.load_key(&test_primary(), 0),
            Err(StoreError::Corrupt(_))
        ));
    }

    #[test]
    fn empty_envelope_is_corrupt() {
        let (_dir, vault) = test_vault();
        std::fs::write(vault.key_path(0), b"").unwrap();
        assert!(matches!(
            vault.load_key(&test_primary(), 0),
            Err(StoreError::Corrupt(_))
        ));
    }

    #[test]
    fn current_index_roundtrip() {
        let (_dir, vault) = test_vault();
        vault.save_current_index(17).unwrap();
        assert_eq!(vault.load_current_index().unwrap(), 17);
    }

    #[test]
    fn oversized_index_file_is_corrupt() {
        let (_dir, vault) = test_vault();
        std::fs::write(vault.index_file(), [0, 1]).unwrap();
        assert!(matches!(
            vault.load_current_index(),
            Err(StoreError::Corrupt(_))
        ));
    }

    #[test]
    fn list_key_indices_parses_names() {
        let (_dir, vault) = test_vault();
        let primary = test_primary();
        vault.generate_key(&primary, 0).unwrap();
        vault.generate_key(&primary, 3).unwrap();
        vault.generate_key(&primary, 255).unwrap();
        std::fs::write(vault.key_dir().join("keyring"), b"x").unwrap();
        std::fs::write(vault.key_dir().join("notakey"), b"x").unwrap();

        let indices = vault.list_key_indices().unwrap();
        assert_eq!(indices.into_iter().collect::<Vec<_>>(), vec![0, 3, 255]);
    }

    #[test]
    fn delete_key_removes_file() {
        let (_dir, vault) = test_vault();
        vault.generate_key(&test_primary(), 4).unwrap();
        vault.delete_key(4).unwrap();
        assert!(!vault.key_path(4).exists());
        assert!(vault.list_key_indices().unwrap().is_empty());
    }

    #[test]
    fn init_primary_persists_salt() {
        let (_dir, vault) = test_vault();
        let a = vault.init_primary(b"hunter2").unwrap();
        let b = vault.derive_primary(b"hunter2").unwrap();
        assert_eq!(a.as_bytes(), b.as_bytes());

        let salt = std::fs::read(vault.salt_file()).unwrap();
        assert_eq!(salt.len(), crate::SALT_LEN);
    }
}
