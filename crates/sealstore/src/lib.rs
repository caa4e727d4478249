//! sealstore: password-protected, disk-resident secret store
//!
//! Secrets are opaque byte blobs addressed by store-relative path and
//! encrypted at rest with AES-256-GCM under a two-tier key hierarchy:
//!
//! ```text
//! Primary key (256-bit, Argon2id from password + .keys/primarysalt)
//!   └── Data keys key0..key255 (random, wrapped by the primary key)
//!         └── Data files: [key_idx:1][nonce:12][ct+tag]
//! ```
//!
//! Concurrent access by multiple processes and threads is serialized with
//! advisory `flock` locks; `.keys/.keylock` is the rendezvous for
//! store-wide mutations (key rotation, password change). Rotation installs
//! a new current key, then a background sweep re-encrypts every record and
//! deletes demoted keys once nothing references them. Password change
//! re-wraps the key set under a new primary key with a two-rename commit
//! that stays recoverable after arbitrary interruption.
//!
//! # Example
//!
//! ```no_run
//! use sealstore::Store;
//!
//! let mut password = b"hunter2".to_vec();
//! let store = Store::open("/var/lib/myapp/secrets", &mut password)?;
//! store.save("api/key", b"ABCDEFGH")?;
//! assert_eq!(store.load("api/key")?, b"ABCDEFGH");
//! store.close();
//! # Ok::<(), sealstore::StoreError>(())
//! ```

mod crypto;
mod error;
mod io;
mod keys;
mod lock;
mod passwd;
mod recovery;
mod rotate;
mod store;
mod wipe;

pub use error::{Result, StoreError};
pub use recovery::StoreInfo;
pub use store::Store;
pub use wipe::wipe;

/// Key size in bytes for the primary key and every data key (AES-256).
pub const KEY_SIZE: usize = 32;

/// AES-GCM nonce size in bytes.
pub const NONCE_SIZE: usize = 12;

/// GCM authentication tag size in bytes.
pub const TAG_SIZE: usize = 16;

/// Length of the Argon2id salt persisted in a new store.
pub const SALT_LEN: usize = 16;

pub(crate) const ALG_AES_256_GCM: u8 = 0;

pub(crate) const KEY_DIR_NAME: &str = ".keys";
pub(crate) const SALT_FILE: &str = "primarysalt";
pub(crate) const INDEX_FILE: &str = "currentkey";
pub(crate) const LOCK_FILE: &str = ".keylock";
pub(crate) const TMP_DIR_NAME: &str = ".tmp";
pub(crate) const NEWPW_DIR_NAME: &str = ".keys.newpw";
pub(crate) const OLDPW_DIR_NAME: &str = ".keys.oldpw";

pub(crate) const DIR_MODE: u32 = 0o700;
pub(crate) const FILE_MODE: u32 = 0o600;

/// Re-encryption sweep gives up after this many passes; the next open
/// re-dispatches it.
pub(crate) const MAX_SWEEP_PASSES: u32 = 10;

/// Password change skips zeroizing old key files larger than this.
pub(crate) const ZERO_CAP: u64 = 256 * 1024;
