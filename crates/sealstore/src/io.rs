//! Whole-file reads and writes under the matching advisory lock.
//!
//! The lock is held for the shortest possible window: acquire, one read or
//! write pass, release. Callers that need atomic replacement (the rotation
//! sweep) write to a scratch file and rename instead of going through
//! [`write_file`].

use std::fs::File;
use std::io::{Read, Write};
use std::path::Path;

use crate::error::Result;
use crate::lock::FileLock;

/// Read the entire contents of `path` while holding a shared lock.
pub fn read_file(path: &Path) -> Result<Vec<u8>> {
    let lk = FileLock::shared(path)?;
    let mut data = Vec::new();
    let mut f: &File = lk.file();
    f.read_to_end(&mut data)?;
    Ok(data)
}

/// Replace the contents of `path` with `data` while holding an exclusive
/// lock. The file is created (mode 0600) if absent.
pub fn write_file(path: &Path, data: &[u8]) -> Result<()> {
    let lk = FileLock::exclusive(path)?;
    let mut f: &File = lk.file();
    f.set_len(0)?;
    f.write_all(data)?;
    Ok(())
}
