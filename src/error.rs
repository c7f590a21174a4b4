use std::path::PathBuf;

use thiserror::Error;

/// Errors surfaced by mount, unmount, enumeration and fetch operations.
///
/// Per-asset resolution failures are not represented here; those are logged
/// and skipped by the loader.
#[derive(Error, Debug)]
pub enum PakError {
    #[error("file does not exist: {0}")]
    NotFound(String),
    #[error("pak file isn't mounted: {}", .0.display())]
    NotMounted(PathBuf),
    #[error("pak file {} still has {count} live object handle(s)", .path.display())]
    InUse { path: PathBuf, count: usize },
    #[error("couldn't unmount pak file: {}", .0.display())]
    UnmountFailed(PathBuf),
    #[error("platform file chain misconfigured: {0}")]
    Configuration(String),
    #[error("could only write {written} of {expected} bytes to {}", .path.display())]
    SizeMismatch { path: PathBuf, written: u64, expected: u64 },
    #[error("http request failed: {0}")]
    Http(String),
    #[error(transparent)]
    Archive(#[from] repak::Error),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, PakError>;
