//! Scoped advisory file locks.
//!
//! Locks are `flock`-based and advisory: they serialize access only among
//! cooperating holders. A lock lives for the lifetime of the returned
//! [`FileLock`] and is released on drop, on every exit path.

use std::fs::{DirBuilder, File, OpenOptions};
use std::io;
use std::os::fd::AsRawFd;
use std::os::unix::fs::{DirBuilderExt, MetadataExt, OpenOptionsExt};
use std::path::Path;

use crate::error::{Result, StoreError};
use crate::{DIR_MODE, FILE_MODE};

/// An acquired advisory lock on an open file descriptor.
///
/// Dropping the guard releases the lock and closes the descriptor.
#[derive(Debug)]
pub struct FileLock {
    file: File,
}

impl FileLock {
    /// Acquire a blocking exclusive lock on `path`.
    ///
    /// The file is created (mode 0600) if absent, along with its parent
    /// directory (mode 0700). Fails with [`StoreError::IsDir`] if `path`
    /// names a directory.
    pub fn exclusive(path: &Path) -> Result<Self> {
        Self::write_lock(path, libc::LOCK_EX)
    }

    /// Non-blocking variant of [`FileLock::exclusive`].
    ///
    /// Fails with [`StoreError::Busy`] if another holder has the lock.
    pub fn exclusive_nb(path: &Path) -> Result<Self> {
        Self::write_lock(path, libc::LOCK_EX | libc::LOCK_NB)
    }

    /// Acquire a blocking shared lock on `path`. The file must exist.
    pub fn shared(path: &Path) -> Result<Self> {
        let file = OpenOptions::new().read(true).open(path)?;
        flock(&file, libc::LOCK_SH)?;
        Ok(Self { file })
    }

    /// The locked file handle.
    pub fn file(&self) -> &File {
        &self.file
    }

    fn write_lock(path: &Path, op: libc::c_int) -> Result<Self> {
        loop {
            let file = match path.metadata() {
                Ok(meta) if meta.is_dir() => {
                    return Err(StoreError::IsDir(path.display().to_string()));
                }
                Ok(_) => OpenOptions::new().read(true).write(true).open(path)?,
                Err(_) => {
                    if let Some(parent) = path.parent() {
                        DirBuilder::new()
                            .recursive(true)
                            .mode(DIR_MODE)
                            .create(parent)?;
                    }
                    OpenOptions::new()
                        .read(true)
                        .write(true)
                        .create(true)
                        .mode(FILE_MODE)
                        .open(path)?
                }
            };
            flock(&file, op)?;

            // While we were blocked, a rename-over (the rotation sweep) or
            // an unlink may have detached this inode from the path. A
            // mutation through the stale descriptor would be lost, so
            // re-open and lock whatever the path names now.
            let locked = file.metadata()?;
            match path.metadata() {
                Ok(meta) if meta.dev() == locked.dev() && meta.ino() == locked.ino() => {
                    return Ok(Self { file });
                }
                _ => continue,
            }
        }
    }
}

impl Drop for FileLock {
    fn drop(&mut self) {
        let _ = unsafe { libc::flock(self.file.as_raw_fd(), libc::LOCK_UN) };
    }
}

fn flock(file: &File, op: libc::c_int) -> Result<()> {
    let ret = unsafe { libc::flock(file.as_raw_fd(), op) };
    if ret != 0 {
        let err = io::Error::last_os_error();
        if err.kind() == io::ErrorKind::WouldBlock {
            return Err(StoreError::Busy);
        }
        return Err(StoreError::Io(err));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::os::unix::fs::PermissionsExt;

    use super::*;

    #[test]
    fn exclusive_blocks_try_exclusive() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("locked");

        let _held = FileLock::exclusive(&path).unwrap();
        assert!(matches!(
            FileLock::exclusive_nb(&path),
            Err(StoreError::Busy)
        ));
    }

    #[test]
    fn shared_locks_coexist() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("shared");
        std::fs::write(&path, b"x").unwrap();

        let _a = FileLock::shared(&path).unwrap();
        let _b = FileLock::shared(&path).unwrap();
    }

    #[test]
    fn shared_excludes_try_exclusive() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("reader");
        std::fs::write(&path, b"x").unwrap();

        let _reader = FileLock::shared(&path).unwrap();
        assert!(matches!(
            FileLock::exclusive_nb(&path),
            Err(StoreError::Busy)
        ));
    }

    #[test]
    fn drop_releases_lock() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("released");

        let held = FileLock::exclusive(&path).unwrap();
        drop(held);
        FileLock::exclusive_nb(&path).unwrap();
    }

    #[test]
    fn shared_requires_existing_file() {
        let dir = tempfile::tempdir().unwrap();
        let err = FileLock::shared(&dir.path().join("missing")).unwrap_err();
        match err {
            StoreError::Io(e) => assert_eq!(e.kind(), io::ErrorKind::NotFound),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn exclusive_rejects_directory() {
        let dir = tempfile::tempdir().unwrap();
        assert!(matches!(
            FileLock::exclusive(dir.path()),
            Err(StoreError::IsDir(_))
        ));
    }

    #[test]
    fn exclusive_creates_parent_and_sets_mode() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("a/b/lockfile");

        let _held = FileLock::exclusive(&path).unwrap();

        let file_mode = path.metadata().unwrap().permissions().mode() & 0o777;
        assert_eq!(file_mode, 0o600);
        let dir_mode = path
            .parent()
            .unwrap()
            .metadata()
            .unwrap()
            .permissions()
            .mode()
            & 0o777;
        assert_eq!(dir_mode, 0o700);
    }
}
