//! Error taxonomy shared by every driver.
//!
//! These are *kinds*, not wrapped foreign errors: every driver reports the
//! same handful of variants so callers can match on them regardless of which
//! filesystem they're talking to. Scan-time inconsistencies are recorded in
//! [`crate::notes::Notes`] instead of raised here; see spec.md §7.

use std::io;

/// Errors returned by the core framework and its drivers.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("i/o error: {0}")]
    Io(#[from] io::Error),

    #[error("disk full")]
    DiskFull,

    #[error("not supported by this filesystem: {0}")]
    NotSupported(&'static str),

    #[error("entry is damaged and cannot be accessed: {0}")]
    Damaged(String),

    #[error("object has been disposed")]
    ObjectDisposed,

    #[error("unsupported geometry for this filesystem: {0}")]
    UnsupportedGeometry(String),
}

pub type Result<T> = std::result::Result<T, Error>;
