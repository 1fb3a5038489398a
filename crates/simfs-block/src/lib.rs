#![forbid(unsafe_code)]
//! Block device layer for SimFS.
//!
//! [`VirtualDisk`] owns the image file and exposes bounds-checked block I/O,
//! the superblock, and the in-memory mirror of the free-space bitmap. The
//! image is exactly `total_blocks * BLOCK_SIZE` bytes; block 0 carries the
//! superblock, followed by the bitmap, inode table, reserved journal, and
//! data regions.

use simfs_error::{Result, SimfsError};
use simfs_types::{
    read_le_u32, BlockNo, DiskLayout, LayoutError, BLOCK_SIZE, JOURNAL_BLOCKS, MAGIC,
};
use std::fs::{File, OpenOptions};
use std::os::unix::fs::FileExt;
use std::path::Path;
use tracing::{debug, info, trace, warn};

// ── Bitmap byte operations ──────────────────────────────────────────────────

/// Get bit `idx` from a bitmap byte slice.
#[must_use]
pub fn bitmap_get(bitmap: &[u8], idx: u32) -> bool {
    let byte_idx = (idx / 8) as usize;
    let bit_idx = idx % 8;
    if byte_idx >= bitmap.len() {
        return false;
    }
    (bitmap[byte_idx] >> bit_idx) & 1 == 1
}

/// Set bit `idx` in a bitmap byte slice.
pub fn bitmap_set(bitmap: &mut [u8], idx: u32) {
    let byte_idx = (idx / 8) as usize;
    let bit_idx = idx % 8;
    if byte_idx < bitmap.len() {
        bitmap[byte_idx] |= 1 << bit_idx;
    }
}

/// Clear bit `idx` in a bitmap byte slice.
pub fn bitmap_clear(bitmap: &mut [u8], idx: u32) {
    let byte_idx = (idx / 8) as usize;
    let bit_idx = idx % 8;
    if byte_idx < bitmap.len() {
        bitmap[byte_idx] &= !(1 << bit_idx);
    }
}

/// Count set (free) bits in the first `count` bits of `bitmap`.
#[must_use]
pub fn bitmap_count_set(bitmap: &[u8], count: u32) -> u32 {
    let full_bytes = (count / 8) as usize;
    let remainder = count % 8;
    let mut set = 0u32;

    for &byte in bitmap.iter().take(full_bytes) {
        set += byte.count_ones();
    }
    if remainder > 0 && full_bytes < bitmap.len() {
        let byte = bitmap[full_bytes];
        for bit in 0..remainder {
            set += u32::from((byte >> bit) & 1);
        }
    }
    set
}

/// Find the first set (free) bit in `[start, count)`.
#[must_use]
pub fn bitmap_find_set(bitmap: &[u8], count: u32, start: u32) -> Option<u32> {
    (start..count).find(|&idx| bitmap_get(bitmap, idx))
}

// ── In-memory bitmap mirror ─────────────────────────────────────────────────

/// One bit per block; bit = 1 means the block is free.
///
/// Bits below `data_start` are permanently zero: system blocks are never
/// allocatable. The mirror must match the on-disk bitmap region after every
/// persist point.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Bitmap {
    bits: Vec<u8>,
    len: u32,
}

impl Bitmap {
    /// Freshly formatted bitmap: all data blocks free, system bits zero.
    #[must_use]
    pub fn formatted(layout: &DiskLayout) -> Self {
        let mut bitmap = Self::all_used(layout.total_blocks);
        for idx in layout.data_start..layout.total_blocks {
            bitmap_set(&mut bitmap.bits, idx);
        }
        bitmap
    }

    #[must_use]
    pub fn all_used(len: u32) -> Self {
        Self {
            bits: vec![0u8; (len as usize).div_ceil(8)],
            len,
        }
    }

    /// Rebuild the mirror from the raw bitmap-region bytes.
    #[must_use]
    pub fn from_region(region: &[u8], len: u32) -> Self {
        let mut bits = vec![0u8; (len as usize).div_ceil(8)];
        let take = bits.len().min(region.len());
        bits[..take].copy_from_slice(&region[..take]);
        // Bits past `len` in the final byte are meaningless; keep them zero.
        let tail_bits = len % 8;
        if tail_bits != 0 {
            if let Some(last) = bits.last_mut() {
                *last &= (1u8 << tail_bits) - 1;
            }
        }
        Self { bits, len }
    }

    #[must_use]
    pub fn len(&self) -> u32 {
        self.len
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    #[must_use]
    pub fn is_free(&self, block: BlockNo) -> bool {
        block.0 < self.len && bitmap_get(&self.bits, block.0)
    }

    pub fn set_free(&mut self, block: BlockNo) {
        bitmap_set(&mut self.bits, block.0);
    }

    pub fn set_used(&mut self, block: BlockNo) {
        bitmap_clear(&mut self.bits, block.0);
    }

    /// First free block at or after `start`.
    #[must_use]
    pub fn find_free_from(&self, start: u32) -> Option<BlockNo> {
        bitmap_find_set(&self.bits, self.len, start).map(BlockNo)
    }

    /// Count of free blocks at or after `start`.
    #[must_use]
    pub fn count_free_from(&self, start: u32) -> u32 {
        bitmap_count_set(&self.bits, self.len) - bitmap_count_set(&self.bits, start.min(self.len))
    }

    #[must_use]
    pub fn as_bytes(&self) -> &[u8] {
        &self.bits
    }
}

// ── Superblock ──────────────────────────────────────────────────────────────

/// On-disk offsets within block 0. All fields little-endian.
const SB_MAGIC: usize = 0x00;
const SB_TOTAL_BLOCKS: usize = 0x04;
const SB_FREE_BLOCKS: usize = 0x08;
const SB_BLOCK_SIZE: usize = 0x0C;
const SB_INODE_COUNT: usize = 0x10;
const SB_FREE_INODES: usize = 0x14;
const SB_BITMAP_START: usize = 0x18;
const SB_INODE_TABLE_START: usize = 0x1C;
const SB_JOURNAL_START: usize = 0x20;
const SB_JOURNAL_SIZE: usize = 0x24;
const SB_DATA_START: usize = 0x28;
const SB_CLEAN_SHUTDOWN: usize = 0x2C;

/// Volume-level metadata record living at block 0.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Superblock {
    pub magic: u32,
    pub total_blocks: u32,
    pub free_blocks: u32,
    pub block_size: u32,
    pub inode_count: u32,
    pub free_inodes: u32,
    pub bitmap_start: u32,
    pub inode_table_start: u32,
    pub journal_start: u32,
    pub journal_size: u32,
    pub data_start: u32,
    pub clean_shutdown: bool,
}

impl Superblock {
    /// Superblock for a freshly formatted volume with the given layout.
    #[must_use]
    pub fn formatted(layout: &DiskLayout) -> Self {
        Self {
            magic: MAGIC,
            total_blocks: layout.total_blocks,
            free_blocks: layout.data_blocks(),
            block_size: BLOCK_SIZE,
            inode_count: layout.inode_count,
            free_inodes: layout.inode_count,
            bitmap_start: layout.bitmap_start,
            inode_table_start: layout.inode_table_start,
            journal_start: layout.journal_start,
            journal_size: JOURNAL_BLOCKS,
            data_start: layout.data_start,
            clean_shutdown: true,
        }
    }

    /// Region table as stored in this superblock.
    #[must_use]
    pub fn layout(&self) -> DiskLayout {
        DiskLayout {
            total_blocks: self.total_blocks,
            bitmap_start: self.bitmap_start,
            bitmap_blocks: self.inode_table_start - self.bitmap_start,
            inode_table_start: self.inode_table_start,
            inode_table_blocks: self.journal_start - self.inode_table_start,
            inode_count: self.inode_count,
            journal_start: self.journal_start,
            journal_blocks: self.journal_size,
            data_start: self.data_start,
        }
    }

    /// Serialize into a block-sized buffer.
    #[must_use]
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = vec![0u8; BLOCK_SIZE as usize];
        buf[SB_MAGIC..SB_MAGIC + 4].copy_from_slice(&self.magic.to_le_bytes());
        buf[SB_TOTAL_BLOCKS..SB_TOTAL_BLOCKS + 4].copy_from_slice(&self.total_blocks.to_le_bytes());
        buf[SB_FREE_BLOCKS..SB_FREE_BLOCKS + 4].copy_from_slice(&self.free_blocks.to_le_bytes());
        buf[SB_BLOCK_SIZE..SB_BLOCK_SIZE + 4].copy_from_slice(&self.block_size.to_le_bytes());
        buf[SB_INODE_COUNT..SB_INODE_COUNT + 4].copy_from_slice(&self.inode_count.to_le_bytes());
        buf[SB_FREE_INODES..SB_FREE_INODES + 4].copy_from_slice(&self.free_inodes.to_le_bytes());
        buf[SB_BITMAP_START..SB_BITMAP_START + 4].copy_from_slice(&self.bitmap_start.to_le_bytes());
        buf[SB_INODE_TABLE_START..SB_INODE_TABLE_START + 4]
            .copy_from_slice(&self.inode_table_start.to_le_bytes());
        buf[SB_JOURNAL_START..SB_JOURNAL_START + 4]
            .copy_from_slice(&self.journal_start.to_le_bytes());
        buf[SB_JOURNAL_SIZE..SB_JOURNAL_SIZE + 4].copy_from_slice(&self.journal_size.to_le_bytes());
        buf[SB_DATA_START..SB_DATA_START + 4].copy_from_slice(&self.data_start.to_le_bytes());
        buf[SB_CLEAN_SHUTDOWN] = u8::from(self.clean_shutdown);
        buf
    }

    /// Parse from block 0 bytes, validating the magic.
    pub fn decode(data: &[u8]) -> Result<Self> {
        let magic = read_le_u32(data, SB_MAGIC).map_err(SimfsError::from)?;
        if magic != MAGIC {
            return Err(SimfsError::BadMagic { actual: magic });
        }
        let sb = Self {
            magic,
            total_blocks: read_le_u32(data, SB_TOTAL_BLOCKS)?,
            free_blocks: read_le_u32(data, SB_FREE_BLOCKS)?,
            block_size: read_le_u32(data, SB_BLOCK_SIZE)?,
            inode_count: read_le_u32(data, SB_INODE_COUNT)?,
            free_inodes: read_le_u32(data, SB_FREE_INODES)?,
            bitmap_start: read_le_u32(data, SB_BITMAP_START)?,
            inode_table_start: read_le_u32(data, SB_INODE_TABLE_START)?,
            journal_start: read_le_u32(data, SB_JOURNAL_START)?,
            journal_size: read_le_u32(data, SB_JOURNAL_SIZE)?,
            data_start: read_le_u32(data, SB_DATA_START)?,
            clean_shutdown: data.get(SB_CLEAN_SHUTDOWN).copied().unwrap_or(0) == 1,
        };
        if sb.block_size != BLOCK_SIZE {
            return Err(LayoutError::InvalidField {
                field: "block_size",
                value: u64::from(sb.block_size),
            }
            .into());
        }
        if sb.data_start == 0 || sb.data_start >= sb.total_blocks {
            return Err(LayoutError::InvalidField {
                field: "data_start",
                value: u64::from(sb.data_start),
            }
            .into());
        }
        Ok(sb)
    }
}

// ── Virtual disk ────────────────────────────────────────────────────────────

/// The block device: an image file plus the superblock and bitmap mirrors.
///
/// Exclusively owned for the lifetime of a mount; all mutation goes through
/// `&mut self`.
#[derive(Debug)]
pub struct VirtualDisk {
    file: File,
    superblock: Superblock,
    layout: DiskLayout,
    bitmap: Bitmap,
}

impl VirtualDisk {
    /// Create a fresh image of `bytes` bytes at `path` and format it.
    ///
    /// Writes exactly `total_blocks` zero-filled blocks, then persists the
    /// superblock and bitmap. The inode table and journal regions are left
    /// as the zero fill, which is their formatted state.
    pub fn create(path: impl AsRef<Path>, bytes: u64) -> Result<Self> {
        let layout = DiskLayout::for_bytes(bytes)?;
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path.as_ref())?;

        // Zero-fill the whole image in 1 MiB strides.
        let zeros = vec![0u8; 256 * BLOCK_SIZE as usize];
        let mut offset = 0u64;
        while offset < bytes {
            let chunk = zeros.len().min((bytes - offset) as usize);
            file.write_all_at(&zeros[..chunk], offset)?;
            offset += chunk as u64;
        }

        let superblock = Superblock::formatted(&layout);
        let bitmap = Bitmap::formatted(&layout);
        let mut disk = Self {
            file,
            superblock,
            layout,
            bitmap,
        };
        disk.write_superblock()?;
        disk.write_bitmap()?;
        info!(
            target: "simfs::block",
            total_blocks = layout.total_blocks,
            data_start = layout.data_start,
            "created volume image"
        );
        Ok(disk)
    }

    /// Open an existing image, validating the superblock magic and reading
    /// the bitmap region into memory.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let file = OpenOptions::new().read(true).write(true).open(path.as_ref())?;

        let mut block0 = vec![0u8; BLOCK_SIZE as usize];
        file.read_exact_at(&mut block0, 0)?;
        let superblock = Superblock::decode(&block0)?;
        let layout = superblock.layout();

        let mut region =
            vec![0u8; layout.bitmap_blocks as usize * BLOCK_SIZE as usize];
        file.read_exact_at(&mut region, BlockNo(layout.bitmap_start).byte_offset())?;
        let bitmap = Bitmap::from_region(&region, layout.total_blocks);

        if !superblock.clean_shutdown {
            warn!(
                target: "simfs::block",
                "volume was not cleanly unmounted; recovery may be needed"
            );
        }
        debug!(
            target: "simfs::block",
            total_blocks = layout.total_blocks,
            free_blocks = superblock.free_blocks,
            clean = superblock.clean_shutdown,
            "opened volume image"
        );
        Ok(Self {
            file,
            superblock,
            layout,
            bitmap,
        })
    }

    /// Flush the bitmap and superblock, sync the image, and release the
    /// file handle.
    pub fn close(mut self) -> Result<()> {
        self.write_bitmap()?;
        self.write_superblock()?;
        self.file.sync_all()?;
        info!(target: "simfs::block", "closed volume image");
        Ok(())
    }

    // ── Block I/O ───────────────────────────────────────────────────────────

    fn check_bounds(&self, block: BlockNo) -> Result<()> {
        if block.0 >= self.layout.total_blocks {
            return Err(SimfsError::BadBlockIndex {
                block: block.0,
                total: self.layout.total_blocks,
            });
        }
        Ok(())
    }

    /// Read one block.
    pub fn read_block(&self, block: BlockNo) -> Result<Vec<u8>> {
        self.check_bounds(block)?;
        let mut buf = vec![0u8; BLOCK_SIZE as usize];
        self.file.read_exact_at(&mut buf, block.byte_offset())?;
        trace!(target: "simfs::block", block = block.0, "read_block");
        Ok(buf)
    }

    /// Write one block. `data` must be exactly one block long.
    pub fn write_block(&mut self, block: BlockNo, data: &[u8]) -> Result<()> {
        self.check_bounds(block)?;
        if data.len() != BLOCK_SIZE as usize {
            return Err(LayoutError::InvalidField {
                field: "block_len",
                value: data.len() as u64,
            }
            .into());
        }
        self.file.write_all_at(data, block.byte_offset())?;
        trace!(target: "simfs::block", block = block.0, "write_block");
        Ok(())
    }

    /// Overwrite a block with zeros.
    pub fn zero_block(&mut self, block: BlockNo) -> Result<()> {
        self.write_block(block, &[0u8; BLOCK_SIZE as usize])
    }

    // ── Superblock and bitmap persistence ───────────────────────────────────

    /// Persist the in-memory superblock into block 0.
    pub fn write_superblock(&mut self) -> Result<()> {
        let encoded = self.superblock.encode();
        self.file.write_all_at(&encoded, 0)?;
        trace!(target: "simfs::block", "write_superblock");
        Ok(())
    }

    /// Persist the in-memory bitmap into the bitmap region.
    pub fn write_bitmap(&mut self) -> Result<()> {
        let bytes = self.bitmap.as_bytes();
        let region_len = self.layout.bitmap_blocks as usize * BLOCK_SIZE as usize;
        let mut region = vec![0u8; region_len];
        let take = bytes.len().min(region_len);
        region[..take].copy_from_slice(&bytes[..take]);
        self.file
            .write_all_at(&region, BlockNo(self.layout.bitmap_start).byte_offset())?;
        trace!(target: "simfs::block", "write_bitmap");
        Ok(())
    }

    /// Set the clean-shutdown flag and persist immediately.
    pub fn mark_clean(&mut self) -> Result<()> {
        self.superblock.clean_shutdown = true;
        self.write_superblock()
    }

    /// Clear the clean-shutdown flag and persist immediately.
    pub fn mark_dirty(&mut self) -> Result<()> {
        self.superblock.clean_shutdown = false;
        self.write_superblock()
    }

    // ── Accessors ───────────────────────────────────────────────────────────

    #[must_use]
    pub fn superblock(&self) -> &Superblock {
        &self.superblock
    }

    pub fn superblock_mut(&mut self) -> &mut Superblock {
        &mut self.superblock
    }

    #[must_use]
    pub fn layout(&self) -> &DiskLayout {
        &self.layout
    }

    #[must_use]
    pub fn bitmap(&self) -> &Bitmap {
        &self.bitmap
    }

    pub fn bitmap_mut(&mut self) -> &mut Bitmap {
        &mut self.bitmap
    }

    #[must_use]
    pub fn total_blocks(&self) -> u32 {
        self.superblock.total_blocks
    }

    #[must_use]
    pub fn free_blocks(&self) -> u32 {
        self.superblock.free_blocks
    }

    #[must_use]
    pub fn is_block_free(&self, block: BlockNo) -> bool {
        self.bitmap.is_free(block)
    }

    #[must_use]
    pub fn was_clean_shutdown(&self) -> bool {
        self.superblock.clean_shutdown
    }
}
