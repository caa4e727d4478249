use std::path::PathBuf;

use thiserror::Error;

pub type Result<T> = std::result::Result<T, StoreError>;

/// Errors surfaced by store operations.
///
/// Background tasks (the rotation sweep and the peer-rotation watcher)
/// never return these to callers; they swallow per-record failures and
/// log diagnostics instead.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("password must not be empty")]
    EmptyPassword,

    #[error("authentication failed: wrong password or tampered key file")]
    AuthFailed,

    #[error("{0} is not a directory")]
    NotADir(PathBuf),

    #[error("{0} is not empty and not a store")]
    NotAStore(PathBuf),

    #[error("corrupt store data: {0}")]
    Corrupt(String),

    #[error("secret not found: {0}")]
    NotFound(String),

    #[error("secret {0} is a directory")]
    IsDir(String),

    #[error("path outside store hierarchy: {0}")]
    PathEscape(String),

    #[error("store is being modified by another process")]
    Busy,

    #[error("no free key index: successor key already exists")]
    KeyspaceFull,

    #[error("unsupported key algorithm: {0}")]
    UnsupportedAlgorithm(u8),

    #[error("crypto error: {0}")]
    Crypto(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}
