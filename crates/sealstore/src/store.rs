//! The public store: open/create, save, load, delete, close.

use std::fs::{self, DirBuilder};
use std::io::ErrorKind;
use std::os::unix::fs::DirBuilderExt;
use std::path::{Component, Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use crate::crypto::{self, PrimaryKey};
use crate::error::{Result, StoreError};
use crate::keys::{DataKey, KeyVault};
use crate::lock::FileLock;
use crate::recovery::StoreInfo;
use crate::rotate::RotateWatcher;
use crate::wipe::wipe;
use crate::{io, passwd, recovery, rotate};
use crate::{DIR_MODE, KEY_DIR_NAME, KEY_SIZE, NEWPW_DIR_NAME, NONCE_SIZE, OLDPW_DIR_NAME};

/// The in-memory key material. Updated only while holding `.keylock` on
/// disk plus the write half of the surrounding `RwLock`.
pub(crate) struct KeyState {
    pub primary: PrimaryKey,
    pub current: DataKey,
    pub index: u8,
}

/// State shared between the store handle and its background tasks.
pub(crate) struct Shared {
    pub root: PathBuf,
    pub vault: KeyVault,
    pub state: RwLock<KeyState>,
    pub closed: AtomicBool,
}

pub(crate) fn read_state(shared: &Shared) -> RwLockReadGuard<'_, KeyState> {
    shared.state.read().unwrap_or_else(|e| e.into_inner())
}

pub(crate) fn write_state(shared: &Shared) -> RwLockWriteGuard<'_, KeyState> {
    shared.state.write().unwrap_or_else(|e| e.into_inner())
}

/// A password-protected secret store rooted at a directory.
///
/// Opening spawns two background tasks: a watcher that picks up key
/// rotations performed by other processes, and (when an earlier rotation
/// was interrupted) a sweep that finishes re-encrypting records. Both stop
/// when the store is dropped or [`Store::close`]d.
pub struct Store {
    shared: Arc<Shared>,
    watcher: Option<RotateWatcher>,
}

enum OpenMode {
    Create,
    Attach,
}

impl Store {
    /// Open the store at `dir`, creating it if the directory is absent.
    ///
    /// `password` is wiped before this returns, on success and failure
    /// alike. On an existing store the password is authenticated by
    /// unwrapping the current key envelope; a mismatch surfaces as
    /// [`StoreError::AuthFailed`] and leaves the store untouched.
    pub fn open<P: AsRef<Path>>(dir: P, password: &mut [u8]) -> Result<Self> {
        let result = Self::open_inner(dir.as_ref(), password);
        wipe(password);
        result
    }

    fn open_inner(dir: &Path, password: &[u8]) -> Result<Self> {
        if password.is_empty() {
            return Err(StoreError::EmptyPassword);
        }

        let root = absolutize(dir)?;
        let vault = KeyVault::new(&root);

        let state = match check_layout(&root, &vault)? {
            OpenMode::Create => create_store(&vault, password)?,
            OpenMode::Attach => attach_store(&root, &vault, password)?,
        };

        let shared = Arc::new(Shared {
            root,
            vault,
            state: RwLock::new(state),
            closed: AtomicBool::new(false),
        });

        // Resume an interrupted rotation before anything new is written.
        recovery::resume_if_needed(&shared)?;

        let watcher = rotate::spawn_watch(Arc::clone(&shared))?;

        Ok(Self {
            shared,
            watcher: Some(watcher),
        })
    }

    /// Encrypt `data` under the current key and store it at the cleaned
    /// store-relative `path`, replacing any previous value.
    pub fn save(&self, path: &str, data: &[u8]) -> Result<()> {
        let full = self.data_path(path)?;

        if let Some(parent) = full.parent() {
            DirBuilder::new()
                .recursive(true)
                .mode(DIR_MODE)
                .create(parent)?;
        }
        match fs::metadata(&full) {
            Ok(meta) if meta.is_dir() => return Err(StoreError::IsDir(path.to_string())),
            Ok(_) => {}
            Err(e) if e.kind() == ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }

        let frame = encrypt_record(&self.shared, data)?;
        io::write_file(&full, &frame)
    }

    /// Load and decrypt the secret at `path`.
    ///
    /// Records written before the latest rotation decrypt transparently:
    /// the leading key-index byte names the wrapping key, and demoted keys
    /// stay on disk until the sweep has re-encrypted every record.
    pub fn load(&self, path: &str) -> Result<Vec<u8>> {
        let full = self.data_path(path)?;

        let frame = match io::read_file(&full) {
            Err(StoreError::Io(e)) if e.kind() == ErrorKind::NotFound => {
                return Err(StoreError::NotFound(path.to_string()));
            }
            other => other?,
        };

        decrypt_record(&self.shared, &frame)
    }

    /// Remove the secret at `path`. Deleting a path that does not exist is
    /// a success; the end state is the same.
    pub fn delete(&self, path: &str) -> Result<()> {
        let full = self.data_path(path)?;

        match fs::symlink_metadata(&full) {
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(e.into()),
            Ok(_) => {}
        }

        let _lk = FileLock::exclusive(&full)?;
        fs::remove_file(&full)?;
        Ok(())
    }

    /// Store-relative paths of every secret, sorted.
    pub fn list(&self) -> Result<Vec<String>> {
        let files = list_data_files(&self.shared.root)?;
        Ok(files
            .iter()
            .filter_map(|p| p.strip_prefix(&self.shared.root).ok())
            .map(|p| p.to_string_lossy().into_owned())
            .collect())
    }

    /// Install a new current key and launch the background re-encryption
    /// sweep. Returns as soon as the new key pointer is durably written.
    pub fn rotate(&self) -> Result<()> {
        rotate::rotate(&self.shared)
    }

    /// Re-wrap all key material under a new password.
    ///
    /// The store stays openable under either the old or the new password
    /// at every interruption point. Other processes attached to the same
    /// store lose access until they reopen with the new password.
    /// `new_password` is wiped before this returns.
    pub fn passwd(&self, new_password: &mut [u8]) -> Result<()> {
        passwd::passwd(&self.shared, new_password)
    }

    /// Re-check the store's structural invariants: salt present, current
    /// key pointer well-formed, current key envelope decrypts.
    pub fn validate(&self) -> Result<()> {
        recovery::validate(&self.shared)
    }

    /// Counts and key indices for diagnostics.
    pub fn info(&self) -> Result<StoreInfo> {
        recovery::info(&self.shared)
    }

    /// Close the store: stop the watcher, let any sweep wind down at its
    /// next file boundary, and wipe the in-memory keys.
    pub fn close(self) {}

    /// Clean `rel` against the store root and reject anything that would
    /// land outside it, including the reserved key directories.
    fn data_path(&self, rel: &str) -> Result<PathBuf> {
        let escape = || StoreError::PathEscape(rel.to_string());

        let rel_path = Path::new(rel);
        if rel.is_empty() || rel_path.is_absolute() {
            return Err(escape());
        }

        let mut full = self.shared.root.clone();
        for comp in rel_path.components() {
            match comp {
                Component::Normal(c) => full.push(c),
                Component::CurDir => {}
                Component::ParentDir => {
                    if !full.pop() {
                        return Err(escape());
                    }
                }
                Component::RootDir | Component::Prefix(_) => return Err(escape()),
            }
        }

        if full == self.shared.root || !full.starts_with(&self.shared.root) {
            return Err(escape());
        }

        // The key directories are not addressable as secrets.
        let first = full
            .strip_prefix(&self.shared.root)
            .map_err(|_| escape())?
            .components()
            .next();
        if let Some(Component::Normal(name)) = first {
            if name == KEY_DIR_NAME || name == NEWPW_DIR_NAME || name == OLDPW_DIR_NAME {
                return Err(escape());
            }
        }

        Ok(full)
    }
}

impl Drop for Store {
    fn drop(&mut self) {
        self.shared.closed.store(true, Ordering::SeqCst);
        // Joins the watcher thread.
        self.watcher.take();

        let mut st = write_state(&self.shared);
        st.primary = PrimaryKey::from_bytes([0u8; KEY_SIZE]);
        st.current = DataKey::from_bytes([0u8; KEY_SIZE]);
    }
}

fn absolutize(dir: &Path) -> Result<PathBuf> {
    if dir.is_absolute() {
        Ok(dir.to_path_buf())
    } else {
        Ok(std::env::current_dir()?.join(dir))
    }
}

/// Decide between creating a fresh store and attaching to an existing one,
/// recovering first from an interrupted password change if its backup
/// directory is present.
fn check_layout(root: &Path, vault: &KeyVault) -> Result<OpenMode> {
    match fs::metadata(root) {
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(OpenMode::Create),
        Err(e) => return Err(e.into()),
        Ok(meta) if !meta.is_dir() => return Err(StoreError::NotADir(root.to_path_buf())),
        Ok(_) => {}
    }

    match fs::metadata(vault.key_dir()) {
        Err(e) if e.kind() == ErrorKind::NotFound => {
            // A password change interrupted between its two renames leaves
            // the keys under `.keys.oldpw`, still wrapped for the old
            // password. Restore and attach.
            let old_dir = root.join(OLDPW_DIR_NAME);
            match fs::metadata(&old_dir) {
                Ok(meta) if meta.is_dir() => {
                    fs::rename(&old_dir, vault.key_dir())?;
                    return Ok(OpenMode::Attach);
                }
                Ok(_) => {
                    return Err(StoreError::Corrupt(format!(
                        "{} is not a directory",
                        old_dir.display()
                    )));
                }
                Err(e) if e.kind() == ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }

            if fs::read_dir(root)?.next().is_some() {
                return Err(StoreError::NotAStore(root.to_path_buf()));
            }
            Ok(OpenMode::Create)
        }
        Err(e) => Err(e.into()),
        Ok(meta) if !meta.is_dir() => Err(StoreError::Corrupt(format!(
            "{} is not a directory",
            vault.key_dir().display()
        ))),
        Ok(_) => {
            if !vault.salt_file().exists() {
                return Err(StoreError::Corrupt("missing primary-key salt".into()));
            }
            let index = match vault.load_current_index() {
                Ok(index) => index,
                Err(StoreError::Io(e)) if e.kind() == ErrorKind::NotFound => {
                    return Err(StoreError::Corrupt("missing current-key file".into()));
                }
                Err(e) => return Err(e),
            };
            if !vault.key_path(index).exists() {
                return Err(StoreError::Corrupt(format!(
                    "missing key file for index {index}"
                )));
            }
            Ok(OpenMode::Attach)
        }
    }
}

fn create_store(vault: &KeyVault, password: &[u8]) -> Result<KeyState> {
    DirBuilder::new()
        .recursive(true)
        .mode(DIR_MODE)
        .create(vault.key_dir())?;

    let _lk = FileLock::exclusive_nb(vault.lock_file())?;

    let primary = vault.init_primary(password)?;
    let current = vault.generate_key(&primary, 0)?;
    vault.save_current_index(0)?;

    Ok(KeyState {
        primary,
        current,
        index: 0,
    })
}

fn attach_store(root: &Path, vault: &KeyVault, password: &[u8]) -> Result<KeyState> {
    let state = {
        let _lk = FileLock::shared(vault.lock_file())?;
        let primary = vault.derive_primary(password)?;
        let index = vault.load_current_index()?;
        // Unwrapping the current key envelope authenticates the password.
        let current = vault.load_key(&primary, index)?;
        KeyState {
            primary,
            current,
            index,
        }
    };

    // A password change interrupted before its renames may have left a
    // scratch copy behind.
    let _ = fs::remove_dir_all(root.join(NEWPW_DIR_NAME));

    Ok(state)
}

/// Frame and encrypt one record under the current key:
/// `[key_idx:1][nonce:12][ct+tag]`.
pub(crate) fn encrypt_record(shared: &Shared, data: &[u8]) -> Result<Vec<u8>> {
    let st = read_state(shared);
    let (nonce, ciphertext) = crypto::seal(st.current.as_bytes(), data)?;

    let mut frame = Vec::with_capacity(1 + NONCE_SIZE + ciphertext.len());
    frame.push(st.index);
    frame.extend_from_slice(&nonce);
    frame.extend_from_slice(&ciphertext);
    Ok(frame)
}

/// Decrypt one record, resolving its key-index byte to the in-memory
/// current key or to a demoted key still on disk.
pub(crate) fn decrypt_record(shared: &Shared, frame: &[u8]) -> Result<Vec<u8>> {
    if frame.len() < 1 + NONCE_SIZE {
        return Err(StoreError::Corrupt(format!(
            "record too short: {} bytes",
            frame.len()
        )));
    }

    let index = frame[0];
    let key = {
        let st = read_state(shared);
        if index == st.index {
            st.current.clone()
        } else {
            match shared.vault.load_key(&st.primary, index) {
                Err(StoreError::Io(e)) if e.kind() == ErrorKind::NotFound => {
                    return Err(StoreError::Corrupt(format!(
                        "record references missing key {index}"
                    )));
                }
                other => other?,
            }
        }
    };

    let nonce = &frame[1..1 + NONCE_SIZE];
    let ciphertext = &frame[1 + NONCE_SIZE..];
    match crypto::open(key.as_bytes(), nonce, ciphertext) {
        // The data key itself authenticated under the primary key, so a
        // tag mismatch here means a damaged record, not a wrong password.
        Err(StoreError::AuthFailed) => {
            Err(StoreError::Corrupt("record failed authentication".into()))
        }
        other => other,
    }
}

/// Every data file under `root`, sorted, skipping the key directories.
pub(crate) fn list_data_files(root: &Path) -> Result<Vec<PathBuf>> {
    let mut files = Vec::new();
    collect_data_files(root, root, &mut files)?;
    files.sort();
    Ok(files)
}

fn collect_data_files(root: &Path, dir: &Path, out: &mut Vec<PathBuf>) -> Result<()> {
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        let path = entry.path();
        let file_type = entry.file_type()?;

        if file_type.is_dir() {
            if dir == root {
                let name = entry.file_name();
                if name == KEY_DIR_NAME || name == NEWPW_DIR_NAME || name == OLDPW_DIR_NAME {
                    continue;
                }
            }
            collect_data_files(root, &path, out)?;
        } else if file_type.is_file() {
            out.push(path);
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_store_handle(root: &Path) -> Store {
        // A handle with throwaway key material, for exercising path
        // validation without paying for key derivation.
        let vault = KeyVault::new(root);
        Store {
            shared: Arc::new(Shared {
                root: root.to_path_buf(),
                vault,
                state: RwLock::new(KeyState {
                    primary: PrimaryKey::from_bytes([0u8; KEY_SIZE]),
                    current: DataKey::from_bytes([0u8; KEY_SIZE]),
                    index: 0,
                }),
                closed: AtomicBool::new(false),
            }),
            watcher: None,
        }
    }

    #[test]
    fn clean_paths_stay_inside_root() {
        let dir = tempfile::tempdir().unwrap();
        let store = test_store_handle(dir.path());

        for rel in ["api/key", "a/b/c", "x", "a/./b", "a/b/../c"] {
            let full = store.data_path(rel).unwrap();
            assert!(full.starts_with(dir.path()), "{rel} resolved outside root");
        }
        assert_eq!(
            store.data_path("a/b/../c").unwrap(),
            dir.path().join("a/c")
        );
    }

    #[test]
    fn escaping_paths_are_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let store = test_store_handle(dir.path());

        for rel in ["", "..", "../evil", "a/../..", "a/../../b", "/etc/passwd"] {
            assert!(
                matches!(store.data_path(rel), Err(StoreError::PathEscape(_))),
                "{rel:?} was not rejected"
            );
        }
    }

    #[test]
    fn key_directories_are_reserved() {
        let dir = tempfile::tempdir().unwrap();
        let store = test_store_handle(dir.path());

        for rel in [
            ".keys",
            ".keys/key0",
            ".keys.newpw/x",
            ".keys.oldpw/x",
            "a/../.keys/key0",
        ] {
            assert!(
                matches!(store.data_path(rel), Err(StoreError::PathEscape(_))),
                "{rel:?} was not rejected"
            );
        }
        // Similar names that are not the reserved directories are fine.
        store.data_path(".keysmith").unwrap();
        store.data_path("sub/.keys").unwrap();
    }

    #[test]
    fn record_roundtrip_via_frame() {
        let dir = tempfile::tempdir().unwrap();
        let store = test_store_handle(dir.path());

        let frame = encrypt_record(&store.shared, b"payload").unwrap();
        assert_eq!(frame[0], 0);
        assert_eq!(decrypt_record(&store.shared, &frame).unwrap(), b"payload");
    }

    #[test]
    fn short_records_are_corrupt() {
        let dir = tempfile::tempdir().unwrap();
        let store = test_store_handle(dir.path());

        for frame in [&b""[..], &b"\x00"[..], &b"\x00short"[..]] {
            assert!(matches!(
                decrypt_record(&store.shared, frame),
                Err(StoreError::Corrupt(_))
            ));
        }
    }

    #[test]
    fn record_referencing_missing_key_is_corrupt() {
        let dir = tempfile::tempdir().unwrap();
        let store = test_store_handle(dir.path());
        std::fs::create_dir_all(store.shared.vault.key_dir()).unwrap();

        let mut frame = encrypt_record(&store.shared, b"payload").unwrap();
        frame[0] = 9;
        assert!(matches!(
            decrypt_record(&store.shared, &frame),
            Err(StoreError::Corrupt(_))
        ));
    }

    #[test]
    fn list_data_files_skips_key_directories() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path();
        std::fs::create_dir_all(root.join(".keys")).unwrap();
        std::fs::create_dir_all(root.join(".keys.oldpw")).unwrap();
        std::fs::create_dir_all(root.join("nested/deep")).unwrap();
        std::fs::write(root.join(".keys/key0"), b"k").unwrap();
        std::fs::write(root.join(".keys.oldpw/key0"), b"k").unwrap();
        std::fs::write(root.join("top"), b"d").unwrap();
        std::fs::write(root.join("nested/deep/leaf"), b"d").unwrap();

        let files = list_data_files(root).unwrap();
        assert_eq!(
            files,
            vec![root.join("nested/deep/leaf"), root.join("top")]
        );
    }
}
