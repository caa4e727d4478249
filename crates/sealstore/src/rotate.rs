//! Key rotation: new-key installation, the re-encryption sweep, and the
//! watcher that observes rotations performed by other processes.

use std::ffi::OsStr;
use std::fs::{self, DirBuilder, OpenOptions};
use std::io::{ErrorKind, Write};
use std::os::unix::fs::{DirBuilderExt, OpenOptionsExt, PermissionsExt};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use tracing::{debug, warn};

use crate::error::{Result, StoreError};
use crate::lock::FileLock;
use crate::store::{self, read_state, write_state, Shared};
use crate::wipe::wipe;
use crate::{io, DIR_MODE, FILE_MODE, INDEX_FILE, MAX_SWEEP_PASSES};

/// Install a new current key.
///
/// The one-byte write to the current-key pointer is the linearization
/// point: every save issued after it (in any process that has observed it)
/// uses the new key. The re-encryption of existing records happens in a
/// background sweep that this function only launches.
pub(crate) fn rotate(shared: &Arc<Shared>) -> Result<()> {
    let lk = FileLock::exclusive(shared.vault.lock_file())?;

    let (next, primary) = {
        let st = read_state(shared);
        (st.index.wrapping_add(1), st.primary.clone())
    };

    // The successor slot must be free; it is reclaimed by the sweep once
    // the previous rotation has fully settled.
    if shared.vault.key_path(next).exists() {
        return Err(StoreError::KeyspaceFull);
    }

    let key = shared.vault.generate_key(&primary, next)?;

    {
        let mut st = write_state(shared);
        st.current = key;
        st.index = next;
    }
    shared.vault.save_current_index(next)?;

    drop(lk);
    spawn_sweep(Arc::clone(shared));
    Ok(())
}

/// Launch the re-encryption sweep on its own thread.
pub(crate) fn spawn_sweep(shared: Arc<Shared>) {
    let spawned = std::thread::Builder::new()
        .name("sealstore-sweep".into())
        .spawn(move || sweep(&shared, 0));
    if let Err(e) = spawned {
        warn!("failed to spawn sweep thread: {e}");
    }
}

/// One sweep pass: re-encrypt every record not yet under the current key,
/// then verify and clean up demoted keys.
///
/// Reentrant up to [`MAX_SWEEP_PASSES`]; new saves under an older key (from
/// peers that have not yet observed the rotation) and further rotations
/// both show up in the verification walk and trigger another pass. On
/// exceeding the bound the sweep surrenders; the next open re-dispatches
/// it.
fn sweep(shared: &Arc<Shared>, pass: u32) {
    if pass > MAX_SWEEP_PASSES {
        warn!("sweep gave up after {pass} passes; will resume at next open");
        return;
    }
    if shared.closed.load(Ordering::SeqCst) {
        return;
    }

    let tmp_dir = shared.vault.tmp_dir();
    if let Err(e) = DirBuilder::new()
        .recursive(true)
        .mode(DIR_MODE)
        .create(tmp_dir)
    {
        debug!("sweep: cannot create scratch dir: {e}");
        return;
    }

    let files = match store::list_data_files(&shared.root) {
        Ok(files) => files,
        Err(e) => {
            debug!("sweep: cannot walk store tree: {e}");
            return;
        }
    };
    for file in &files {
        if shared.closed.load(Ordering::SeqCst) {
            return;
        }
        reencrypt_file(shared, file);
    }

    // Verify: anything still carrying an older index means a peer saved
    // under a key it had not yet refreshed, or a rotation landed mid-walk.
    let committed = read_state(shared).index;
    let files = match store::list_data_files(&shared.root) {
        Ok(files) => files,
        Err(e) => {
            debug!("sweep: cannot re-walk store tree: {e}");
            return;
        }
    };
    for file in &files {
        match record_key_index(file) {
            Ok(index) if index == committed => {}
            Err(StoreError::Io(e)) if e.kind() == ErrorKind::NotFound => {}
            _ => {
                sweep(shared, pass + 1);
                return;
            }
        }
    }

    // All records use `committed`; delete the demoted keys, unless yet
    // another rotation owns the store now.
    {
        let lk = match FileLock::exclusive(shared.vault.lock_file()) {
            Ok(lk) => lk,
            Err(e) => {
                debug!("sweep: cannot lock key directory: {e}");
                return;
            }
        };
        let superseded = read_state(shared).index != committed;
        if superseded {
            // A newer rotation owns the store; its sweep (or ours, on the
            // next pass) will clean up.
            drop(lk);
            sweep(shared, pass + 1);
            return;
        }
        match shared.vault.list_key_indices() {
            Ok(indices) => {
                for index in indices {
                    if index != committed {
                        if let Err(e) = shared.vault.delete_key(index) {
                            debug!("sweep: failed to delete key{index}: {e}");
                        }
                    }
                }
            }
            Err(e) => {
                debug!("sweep: cannot list keys: {e}");
                return;
            }
        }
    }

    let _ = fs::remove_dir_all(tmp_dir);
}

/// Re-encrypt a single data file under the current key, replacing it
/// atomically via a scratch file in `.keys/.tmp/`.
///
/// Unreadable or undecryptable records are unrecoverable and are deleted;
/// a failed re-encryption leaves the record under its old key for the next
/// pass. Nothing here propagates an error.
fn reencrypt_file(shared: &Arc<Shared>, path: &Path) {
    let _lk = match FileLock::exclusive(path) {
        Ok(lk) => lk,
        Err(e) => {
            debug!(path = %path.display(), "sweep: lock failed: {e}");
            return;
        }
    };

    let frame = match fs::read(path) {
        Ok(frame) => frame,
        Err(e) => {
            debug!(path = %path.display(), "sweep: unreadable record: {e}");
            let _ = fs::remove_file(path);
            return;
        }
    };

    if frame.is_empty() {
        debug!(path = %path.display(), "sweep: zero-length record");
        let _ = fs::remove_file(path);
        return;
    }
    if frame[0] == read_state(shared).index {
        return;
    }

    let mut plaintext = match store::decrypt_record(shared, &frame) {
        Ok(plaintext) => plaintext,
        Err(e) => {
            debug!(path = %path.display(), "sweep: undecryptable record: {e}");
            let _ = fs::remove_file(path);
            return;
        }
    };

    let new_frame = store::encrypt_record(shared, &plaintext);
    wipe(&mut plaintext);
    let new_frame = match new_frame {
        Ok(frame) => frame,
        Err(e) => {
            // Keep the record under its old key; the next pass retries.
            debug!(path = %path.display(), "sweep: re-encryption failed: {e}");
            return;
        }
    };

    let tmp = scratch_path(shared, path);
    let written = OpenOptions::new()
        .write(true)
        .create_new(true)
        .mode(FILE_MODE)
        .open(&tmp)
        .and_then(|mut f| {
            // Explicit chmod: the open mode above is filtered by umask.
            f.set_permissions(fs::Permissions::from_mode(FILE_MODE))?;
            f.write_all(&new_frame)
        });
    if let Err(e) = written {
        debug!(path = %path.display(), "sweep: scratch write failed: {e}");
        let _ = fs::remove_file(&tmp);
        return;
    }

    if let Err(e) = fs::rename(&tmp, path) {
        debug!(path = %path.display(), "sweep: rename failed: {e}");
        let _ = fs::remove_file(&tmp);
    }
}

fn scratch_path(shared: &Shared, path: &Path) -> PathBuf {
    static SEQ: AtomicU64 = AtomicU64::new(0);
    let base = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    shared.vault.tmp_dir().join(format!(
        "{base}.{}.{}",
        std::process::id(),
        SEQ.fetch_add(1, Ordering::Relaxed)
    ))
}

/// The key index a data file was encrypted under (its first byte).
fn record_key_index(path: &Path) -> Result<u8> {
    let frame = io::read_file(path)?;
    frame
        .first()
        .copied()
        .ok_or_else(|| StoreError::Corrupt(format!("empty record {}", path.display())))
}

/// Handle to the running rotation watcher. Dropping it stops event
/// delivery and joins the thread.
pub(crate) struct RotateWatcher {
    watcher: Option<RecommendedWatcher>,
    thread: Option<JoinHandle<()>>,
}

impl Drop for RotateWatcher {
    fn drop(&mut self) {
        // Dropping the notify handle closes the event channel, which ends
        // the loop even if the store's closed flag was never set.
        self.watcher.take();
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

/// Watch `.keys/` for a peer process updating the current-key pointer and
/// reload the in-memory key when it happens.
pub(crate) fn spawn_watch(shared: Arc<Shared>) -> Result<RotateWatcher> {
    let (tx, rx) = mpsc::channel::<()>();

    let mut watcher =
        notify::recommended_watcher(move |res: notify::Result<Event>| match res {
            Ok(event) => {
                let touches_pointer = matches!(
                    event.kind,
                    EventKind::Modify(_) | EventKind::Create(_)
                ) && event
                    .paths
                    .iter()
                    .any(|p| p.file_name() == Some(OsStr::new(INDEX_FILE)));
                if touches_pointer {
                    // A full channel just means a reload is already queued.
                    let _ = tx.send(());
                }
            }
            Err(e) => warn!("rotation watch error: {e}"),
        })
        .map_err(notify_error)?;

    watcher
        .watch(shared.vault.key_dir(), RecursiveMode::NonRecursive)
        .map_err(notify_error)?;

    let thread = std::thread::Builder::new()
        .name("sealstore-watch".into())
        .spawn(move || watch_loop(shared, rx))?;

    Ok(RotateWatcher {
        watcher: Some(watcher),
        thread: Some(thread),
    })
}

fn watch_loop(shared: Arc<Shared>, rx: mpsc::Receiver<()>) {
    loop {
        match rx.recv_timeout(Duration::from_millis(200)) {
            Ok(()) => reload_current_key(&shared),
            Err(RecvTimeoutError::Timeout) => {
                if shared.closed.load(Ordering::SeqCst) {
                    return;
                }
            }
            Err(RecvTimeoutError::Disconnected) => return,
        }
    }
}

/// A peer rotated under us: re-read the pointer and swap in the new key.
/// Failures are logged and swallowed; the next event retries.
fn reload_current_key(shared: &Shared) {
    let _lk = match FileLock::shared(shared.vault.lock_file()) {
        Ok(lk) => lk,
        Err(e) => {
            debug!("watch: cannot lock key directory: {e}");
            return;
        }
    };

    let index = match shared.vault.load_current_index() {
        Ok(index) => index,
        Err(e) => {
            debug!("watch: cannot read current-key pointer: {e}");
            return;
        }
    };
    if read_state(shared).index == index {
        return;
    }

    let primary = read_state(shared).primary.clone();
    let key = match shared.vault.load_key(&primary, index) {
        Ok(key) => key,
        Err(e) => {
            debug!("watch: cannot load key{index}: {e}");
            return;
        }
    };

    let mut st = write_state(shared);
    st.current = key;
    st.index = index;
    debug!(index, "peer rotation observed; current key reloaded");
}

fn notify_error(e: notify::Error) -> StoreError {
    StoreError::Io(std::io::Error::new(ErrorKind::Other, e))
}
