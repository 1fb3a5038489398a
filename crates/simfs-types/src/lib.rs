#![forbid(unsafe_code)]
//! Core types for SimFS.
//!
//! Newtype indices, on-disk constants, the derived volume layout, and the
//! sentinel predicate every pointer-walking code path must go through.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};
use thiserror::Error;

/// Size of every block in bytes. The image format is defined for this value
/// only; the superblock stores it so a mount can refuse a foreign image.
pub const BLOCK_SIZE: u32 = 4096;

/// Superblock magic ("SIMF" little-endian).
pub const MAGIC: u32 = 0x5349_4D46;

/// Bytes per inode record.
pub const INODE_SIZE: u32 = 128;

/// Direct block slots per inode.
pub const DIRECT_BLOCKS: usize = 12;

/// Bytes per directory entry.
pub const DIR_ENTRY_SIZE: u32 = 64;

/// Maximum stored name length within a directory entry (one byte is kept
/// for a terminating NUL, matching the fixed 56-byte name field).
pub const MAX_NAME_LEN: usize = 55;

/// Reserved journal region size in blocks.
pub const JOURNAL_BLOCKS: u32 = 64;

/// Block references an indirect block can hold.
pub const REFS_PER_INDIRECT: usize = (BLOCK_SIZE / 4) as usize;

/// Default volume size used by the front-end (100 MiB).
pub const DEFAULT_VOLUME_BYTES: u64 = 100 * 1024 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct BlockNo(pub u32);

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct InodeNo(pub u32);

impl InodeNo {
    pub const ROOT: Self = Self(0);
}

impl fmt::Display for BlockNo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for InodeNo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl BlockNo {
    /// Byte offset of this block within the image.
    #[must_use]
    pub fn byte_offset(self) -> u64 {
        u64::from(self.0) * u64::from(BLOCK_SIZE)
    }
}

/// Kind stored in an inode record and echoed in directory entries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[repr(u8)]
pub enum FileKind {
    Free = 0,
    File = 1,
    Dir = 2,
}

impl FileKind {
    pub fn from_tag(tag: u8) -> Result<Self, LayoutError> {
        match tag {
            0 => Ok(Self::Free),
            1 => Ok(Self::File),
            2 => Ok(Self::Dir),
            other => Err(LayoutError::InvalidField {
                field: "file_kind",
                value: u64::from(other),
            }),
        }
    }

    #[must_use]
    pub fn tag(self) -> u8 {
        self as u8
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum LayoutError {
    #[error("image of {bytes} bytes is too small: need at least {min_bytes}")]
    ImageTooSmall { bytes: u64, min_bytes: u64 },
    #[error("image size {bytes} is not a multiple of the {BLOCK_SIZE}-byte block size")]
    NotBlockAligned { bytes: u64 },
    #[error("insufficient data: need {needed} bytes at offset {offset}, got {actual}")]
    InsufficientData {
        needed: usize,
        offset: usize,
        actual: usize,
    },
    #[error("invalid field {field}: {value}")]
    InvalidField { field: &'static str, value: u64 },
}

/// Region table of a volume, derived from its total block count.
///
/// Regions in ascending order: superblock (block 0), bitmap, inode table,
/// journal, data. `data_start` is the first allocatable index.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiskLayout {
    pub total_blocks: u32,
    pub bitmap_start: u32,
    pub bitmap_blocks: u32,
    pub inode_table_start: u32,
    pub inode_table_blocks: u32,
    pub inode_count: u32,
    pub journal_start: u32,
    pub journal_blocks: u32,
    pub data_start: u32,
}

impl DiskLayout {
    /// Derive the region table for an image of `bytes` bytes.
    pub fn for_bytes(bytes: u64) -> Result<Self, LayoutError> {
        if bytes % u64::from(BLOCK_SIZE) != 0 {
            return Err(LayoutError::NotBlockAligned { bytes });
        }
        let total = u32::try_from(bytes / u64::from(BLOCK_SIZE)).map_err(|_| {
            LayoutError::InvalidField {
                field: "total_blocks",
                value: bytes / u64::from(BLOCK_SIZE),
            }
        })?;
        Self::for_total_blocks(total).ok_or(LayoutError::ImageTooSmall {
            bytes,
            min_bytes: u64::from(BLOCK_SIZE) * 1024,
        })
    }

    /// Derive the region table for `total_blocks` blocks.
    ///
    /// Returns `None` when the system regions would leave no data region.
    #[must_use]
    pub fn for_total_blocks(total_blocks: u32) -> Option<Self> {
        let bits_per_block = BLOCK_SIZE * 8;
        let bitmap_blocks = total_blocks.div_ceil(bits_per_block);
        let inode_count = total_blocks / 8;
        let inodes_per_block = BLOCK_SIZE / INODE_SIZE;
        let inode_table_blocks = inode_count.div_ceil(inodes_per_block);

        let bitmap_start = 1u32;
        let inode_table_start = bitmap_start.checked_add(bitmap_blocks)?;
        let journal_start = inode_table_start.checked_add(inode_table_blocks)?;
        let data_start = journal_start.checked_add(JOURNAL_BLOCKS)?;
        if data_start >= total_blocks || inode_count == 0 {
            return None;
        }

        Some(Self {
            total_blocks,
            bitmap_start,
            bitmap_blocks,
            inode_table_start,
            inode_table_blocks,
            inode_count,
            journal_start,
            journal_blocks: JOURNAL_BLOCKS,
            data_start,
        })
    }

    /// The sentinel predicate.
    ///
    /// A raw pointer slot names a real data block only when it falls inside
    /// `[data_start, total_blocks)`; both sentinel encodings (0 and the
    /// all-ones value) and any stale out-of-range value read as empty.
    #[must_use]
    pub fn data_block_ref(&self, raw: u32) -> Option<BlockNo> {
        (self.data_start..self.total_blocks)
            .contains(&raw)
            .then_some(BlockNo(raw))
    }

    /// Whether `block` lies in one of the system regions.
    #[must_use]
    pub fn is_system_block(&self, block: BlockNo) -> bool {
        block.0 < self.data_start
    }

    /// Number of data-region blocks.
    #[must_use]
    pub fn data_blocks(&self) -> u32 {
        self.total_blocks - self.data_start
    }
}

/// Blocks needed to hold `len` bytes of payload.
#[must_use]
pub fn blocks_for_bytes(len: usize) -> u32 {
    let per = BLOCK_SIZE as usize;
    u32::try_from(len.div_ceil(per)).unwrap_or(u32::MAX)
}

/// Current wall-clock time as unix seconds.
///
/// Timestamps are advisory metadata; a pre-epoch clock degrades to 0.
#[must_use]
pub fn unix_now() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |d| i64::try_from(d.as_secs()).unwrap_or(i64::MAX))
}

// ── Little-endian field helpers ─────────────────────────────────────────────

#[inline]
pub fn ensure_slice(data: &[u8], offset: usize, len: usize) -> Result<&[u8], LayoutError> {
    let Some(end) = offset.checked_add(len) else {
        return Err(LayoutError::InvalidField {
            field: "offset",
            value: offset as u64,
        });
    };
    if end > data.len() {
        return Err(LayoutError::InsufficientData {
            needed: len,
            offset,
            actual: data.len().saturating_sub(offset),
        });
    }
    Ok(&data[offset..end])
}

#[inline]
pub fn read_le_u16(data: &[u8], offset: usize) -> Result<u16, LayoutError> {
    let bytes = ensure_slice(data, offset, 2)?;
    Ok(u16::from_le_bytes([bytes[0], bytes[1]]))
}

#[inline]
pub fn read_le_u32(data: &[u8], offset: usize) -> Result<u32, LayoutError> {
    let bytes = ensure_slice(data, offset, 4)?;
    Ok(u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
}

#[inline]
pub fn read_le_u64(data: &[u8], offset: usize) -> Result<u64, LayoutError> {
    let bytes = ensure_slice(data, offset, 8)?;
    Ok(u64::from_le_bytes([
        bytes[0], bytes[1], bytes[2], bytes[3], bytes[4], bytes[5], bytes[6], bytes[7],
    ]))
}

#[inline]
pub fn read_le_i64(data: &[u8], offset: usize) -> Result<i64, LayoutError> {
    read_le_u64(data, offset).map(|v| v as i64)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn layout_for_100mib_image() {
        let layout = DiskLayout::for_bytes(DEFAULT_VOLUME_BYTES).expect("layout");
        assert_eq!(layout.total_blocks, 25600);
        assert_eq!(layout.bitmap_start, 1);
        assert_eq!(layout.bitmap_blocks, 1);
        assert_eq!(layout.inode_count, 3200);
        assert_eq!(layout.inode_table_start, 2);
        assert_eq!(layout.inode_table_blocks, 100);
        assert_eq!(layout.journal_start, 102);
        assert_eq!(layout.data_start, 166);
        assert_eq!(layout.data_blocks(), 25600 - 166);
    }

    #[test]
    fn layout_rejects_unaligned_and_tiny_images() {
        assert!(matches!(
            DiskLayout::for_bytes(4097),
            Err(LayoutError::NotBlockAligned { .. })
        ));
        // A handful of blocks cannot fit the system regions.
        assert!(DiskLayout::for_total_blocks(60).is_none());
        assert!(matches!(
            DiskLayout::for_bytes(u64::from(BLOCK_SIZE) * 8),
            Err(LayoutError::ImageTooSmall { .. })
        ));
    }

    #[test]
    fn sentinel_predicate_bounds() {
        let layout = DiskLayout::for_bytes(DEFAULT_VOLUME_BYTES).unwrap();
        assert_eq!(layout.data_block_ref(0), None);
        assert_eq!(layout.data_block_ref(u32::MAX), None);
        assert_eq!(layout.data_block_ref(layout.data_start - 1), None);
        assert_eq!(
            layout.data_block_ref(layout.data_start),
            Some(BlockNo(layout.data_start))
        );
        assert_eq!(
            layout.data_block_ref(layout.total_blocks - 1),
            Some(BlockNo(layout.total_blocks - 1))
        );
        assert_eq!(layout.data_block_ref(layout.total_blocks), None);
    }

    #[test]
    fn blocks_for_bytes_rounds_up() {
        assert_eq!(blocks_for_bytes(0), 0);
        assert_eq!(blocks_for_bytes(1), 1);
        assert_eq!(blocks_for_bytes(4096), 1);
        assert_eq!(blocks_for_bytes(4097), 2);
        assert_eq!(blocks_for_bytes(13 * 4096), 13);
    }

    #[test]
    fn file_kind_round_trip() {
        for kind in [FileKind::Free, FileKind::File, FileKind::Dir] {
            assert_eq!(FileKind::from_tag(kind.tag()).unwrap(), kind);
        }
        assert!(FileKind::from_tag(7).is_err());
    }

    #[test]
    fn read_helpers() {
        let bytes = [0x34_u8, 0x12, 0x78, 0x56, 0xEF, 0xCD, 0xAB, 0x90];
        assert_eq!(read_le_u16(&bytes, 0).unwrap(), 0x1234);
        assert_eq!(read_le_u32(&bytes, 0).unwrap(), 0x5678_1234);
        assert!(read_le_u64(&bytes, 4).is_err());
    }

    #[test]
    fn block_byte_offset() {
        assert_eq!(BlockNo(0).byte_offset(), 0);
        assert_eq!(BlockNo(3).byte_offset(), 3 * 4096);
    }
}
