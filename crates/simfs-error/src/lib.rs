#![forbid(unsafe_code)]
//! Error types for SimFS.
//!
//! Defines `SimfsError` and a `Result<T>` alias used throughout the
//! workspace. Every facade operation returns the first error encountered;
//! partial progress is not rolled back.

use simfs_types::LayoutError;
use thiserror::Error;

/// Unified error type for all SimFS operations.
#[derive(Debug, Error)]
pub enum SimfsError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("volume is not mounted")]
    NotMounted,

    #[error("bad superblock magic: {actual:#010x}")]
    BadMagic { actual: u32 },

    #[error("block index {block} out of range (volume has {total} blocks)")]
    BadBlockIndex { block: u32, total: u32 },

    #[error("refusing to free system block {block}")]
    SystemBlock { block: u32 },

    #[error("no free data blocks")]
    OutOfSpace,

    #[error("no free inode slots")]
    OutOfInodes,

    #[error("not found: {0}")]
    NotFound(String),

    #[error("already exists: {0}")]
    Exists(String),

    #[error("not a regular file: {0}")]
    NotAFile(String),

    #[error("not a directory: {0}")]
    NotADirectory(String),

    #[error("name too long: {0}")]
    NameTooLong(String),

    #[error("volume has simulated corruption; run recovery first")]
    Corrupted,

    #[error("layout error: {0}")]
    Layout(#[from] LayoutError),
}

/// Result alias using `SimfsError`.
pub type Result<T> = std::result::Result<T, SimfsError>;
