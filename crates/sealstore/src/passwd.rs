//! Password change: re-wrap every key envelope under a new primary key.
//!
//! The protocol keeps the store openable under the old or the new password
//! at every interruption point:
//!
//! 1. copy `.keys/` to `.keys.newpw/`
//! 2. write a fresh salt into the copy and re-wrap each key under the new
//!    primary key
//! 3. rename `.keys/` to `.keys.oldpw/`
//! 4. rename `.keys.newpw/` to `.keys/`
//! 5. zero and remove `.keys.oldpw/`
//!
//! Interrupted before step 3: the scratch copy is deleted on the next
//! attach. Interrupted between 3 and 4: open finds `.keys.oldpw/` and
//! renames it back (see `store::check_layout`). After step 4 the new
//! password is live.

use std::fs::{self, DirBuilder, OpenOptions};
use std::os::unix::fs::{DirBuilderExt, FileExt, PermissionsExt};
use std::path::Path;
use std::sync::Arc;

use tracing::debug;

use crate::crypto::PrimaryKey;
use crate::error::{Result, StoreError};
use crate::keys::{self, KeyVault};
use crate::lock::FileLock;
use crate::store::{read_state, write_state, Shared};
use crate::wipe::wipe;
use crate::{io, NEWPW_DIR_NAME, OLDPW_DIR_NAME, ZERO_CAP};

pub(crate) fn passwd(shared: &Arc<Shared>, new_password: &mut [u8]) -> Result<()> {
    let result = passwd_inner(shared, new_password);
    wipe(new_password);
    result
}

fn passwd_inner(shared: &Arc<Shared>, new_password: &[u8]) -> Result<()> {
    if new_password.is_empty() {
        return Err(StoreError::EmptyPassword);
    }

    // Non-blocking: a rotation or another password change owns the store.
    let _lk = FileLock::exclusive_nb(shared.vault.lock_file())?;

    let new_dir = shared.root.join(NEWPW_DIR_NAME);
    let old_dir = shared.root.join(OLDPW_DIR_NAME);

    let _ = fs::remove_dir_all(&new_dir);
    copy_dir(shared.vault.key_dir(), &new_dir)?;

    let new_primary = match rewrap_keys(shared, &new_dir, new_password) {
        Ok(primary) => primary,
        Err(e) => {
            let _ = fs::remove_dir_all(&new_dir);
            return Err(e);
        }
    };

    // The write guard spans both renames: no reader in this process can
    // pair the old primary key with the re-wrapped envelopes.
    {
        let mut st = write_state(shared);
        if let Err(e) = fs::rename(shared.vault.key_dir(), &old_dir) {
            let _ = fs::remove_dir_all(&new_dir);
            return Err(e.into());
        }
        if let Err(e) = fs::rename(&new_dir, shared.vault.key_dir()) {
            // The store has no key directory at this instant. Put the old
            // one back; if even that fails there is nothing further we can
            // do in-process and the error surfaces as-is.
            let _ = fs::rename(&old_dir, shared.vault.key_dir());
            let _ = fs::remove_dir_all(&new_dir);
            return Err(e.into());
        }
        // New key directory is live. Start using the new password; the
        // old primary key zeroizes on drop.
        st.primary = new_primary;
    }

    zero_old_keys(&old_dir);
    Ok(())
}

/// Derive the new primary key in the scratch copy and re-seal every key
/// envelope under it.
fn rewrap_keys(shared: &Arc<Shared>, new_dir: &Path, new_password: &[u8]) -> Result<PrimaryKey> {
    let staged = KeyVault::at(new_dir.to_path_buf());
    let new_primary = staged.init_primary(new_password)?;
    let old_primary = read_state(shared).primary.clone();

    for index in staged.list_key_indices()? {
        let raw = keys::load_key_at(&staged.key_path(index), &old_primary)?;
        let envelope = keys::seal_envelope(&new_primary, &raw)?;
        io::write_file(&staged.key_path(index), &envelope)?;
    }

    Ok(new_primary)
}

/// Copy a directory tree, preserving permission bits.
fn copy_dir(src: &Path, dst: &Path) -> Result<()> {
    let mode = fs::metadata(src)?.permissions().mode() & 0o777;
    DirBuilder::new().mode(mode).create(dst)?;

    for entry in fs::read_dir(src)? {
        let entry = entry?;
        let from = entry.path();
        let to = dst.join(entry.file_name());
        let file_type = entry.file_type()?;
        if file_type.is_dir() {
            copy_dir(&from, &to)?;
        } else if file_type.is_file() {
            fs::copy(&from, &to)?;
        }
    }
    Ok(())
}

/// Overwrite the demoted key files with zeroes, then remove the directory.
/// Best effort throughout; files beyond the sanity bound are skipped so a
/// corrupted store cannot provoke a huge write.
fn zero_old_keys(dir: &Path) {
    if let Ok(entries) = fs::read_dir(dir) {
        for entry in entries.flatten() {
            let name = entry.file_name();
            let Some(name) = name.to_str() else { continue };
            if !name.starts_with("key") {
                continue;
            }
            let Ok(meta) = entry.metadata() else { continue };
            if meta.len() > ZERO_CAP {
                debug!("skipping zeroization of oversized key file {name}");
                continue;
            }
            let Ok(file) = OpenOptions::new().write(true).open(entry.path()) else {
                continue;
            };
            let zeroes = vec![0u8; meta.len() as usize];
            let _ = file.write_all_at(&zeroes, 0);
        }
    }
    let _ = fs::remove_dir_all(dir);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::Store;

    #[test]
    fn passwd_swaps_key_material_in_place() {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::open(dir.path(), &mut b"old".to_vec()).unwrap();
        store.save("svc/token", b"t0ken").unwrap();

        store.passwd(&mut b"new".to_vec()).unwrap();

        // Usable without reopening, and no passwd scratch left behind.
        assert_eq!(store.load("svc/token").unwrap(), b"t0ken");
        store.save("svc/other", b"fresh").unwrap();
        assert!(!dir.path().join(NEWPW_DIR_NAME).exists());
        assert!(!dir.path().join(OLDPW_DIR_NAME).exists());
    }

    #[test]
    fn empty_new_password_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::open(dir.path(), &mut b"old".to_vec()).unwrap();
        assert!(matches!(
            store.passwd(&mut []),
            Err(StoreError::EmptyPassword)
        ));
    }

    #[test]
    fn passwd_fails_busy_under_contention() {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::open(dir.path(), &mut b"old".to_vec()).unwrap();

        let _held = FileLock::exclusive(&dir.path().join(".keys/.keylock")).unwrap();
        assert!(matches!(
            store.passwd(&mut b"new".to_vec()),
            Err(StoreError::Busy)
        ));
    }

    #[test]
    fn new_password_buffer_is_wiped() {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::open(dir.path(), &mut b"old".to_vec()).unwrap();

        let mut new_password = b"swordfish".to_vec();
        store.passwd(&mut new_password).unwrap();
        assert!(new_password.iter().all(|&b| b == 0));
    }
}
