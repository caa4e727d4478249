//! Open-time recovery and store health checks.

use std::path::PathBuf;
use std::sync::Arc;

use tracing::debug;

use crate::error::{Result, StoreError};
use crate::lock::FileLock;
use crate::rotate;
use crate::store::{self, read_state, Shared};

/// If more than one key file survives on disk, an earlier rotation never
/// finished its sweep (or a crash interrupted it). Re-dispatch the sweep;
/// it is idempotent and tolerates rotations from other processes.
pub(crate) fn resume_if_needed(shared: &Arc<Shared>) -> Result<()> {
    let indices = {
        let _lk = FileLock::shared(shared.vault.lock_file())?;
        shared.vault.list_key_indices()?
    };

    if indices.len() > 1 {
        debug!(keys = indices.len(), "incomplete rotation; resuming sweep");
        rotate::spawn_sweep(Arc::clone(shared));
    }
    Ok(())
}

/// Re-check the store's structural invariants: the salt file exists, the
/// current-key pointer is a single byte, and the key it names exists and
/// decrypts under the live primary key.
pub(crate) fn validate(shared: &Shared) -> Result<()> {
    let _lk = FileLock::shared(shared.vault.lock_file())?;

    if !shared.vault.salt_file().exists() {
        return Err(StoreError::Corrupt("missing primary-key salt".into()));
    }
    let index = match shared.vault.load_current_index() {
        Err(StoreError::Io(e)) if e.kind() == std::io::ErrorKind::NotFound => {
            return Err(StoreError::Corrupt("missing current-key file".into()));
        }
        other => other?,
    };
    if !shared.vault.key_path(index).exists() {
        return Err(StoreError::Corrupt(format!(
            "missing key file for index {index}"
        )));
    }

    let primary = read_state(shared).primary.clone();
    shared.vault.load_key(&primary, index)?;
    Ok(())
}

/// Store diagnostics returned by [`crate::Store::info`].
#[derive(Debug, Clone)]
pub struct StoreInfo {
    pub directory: PathBuf,
    pub current_key_index: u8,
    pub secret_count: usize,
    pub key_count: usize,
    pub key_indices: Vec<u8>,
}

pub(crate) fn info(shared: &Shared) -> Result<StoreInfo> {
    let secret_count = store::list_data_files(&shared.root)?.len();
    let indices = {
        let _lk = FileLock::shared(shared.vault.lock_file())?;
        shared.vault.list_key_indices()?
    };

    let current_key_index = read_state(shared).index;
    Ok(StoreInfo {
        directory: shared.root.clone(),
        current_key_index,
        secret_count,
        key_count: indices.len(),
        key_indices: indices.into_iter().collect(),
    })
}
