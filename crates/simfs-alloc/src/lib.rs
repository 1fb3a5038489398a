#![forbid(unsafe_code)]
//! Block allocation for SimFS.
//!
//! Two policies over the data region, both scanning the in-memory bitmap:
//! first-fit (`fast_alloc`) and lowest-first (`compact_alloc`). In the
//! single-threaded model the scans are identical; the names are kept as two
//! entry points because the compactor depends on the lowest-first guarantee
//! and its call sites must not pre-seed the scan start.

use simfs_block::VirtualDisk;
use simfs_error::{Result, SimfsError};
use simfs_types::BlockNo;
use tracing::{debug, trace};

/// Result of freeing a block. Frees are idempotent; recovery relies on it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FreeOutcome {
    Freed,
    AlreadyFree,
}

/// Allocate the first free data block, scanning from `data_start`.
pub fn fast_alloc(disk: &mut VirtualDisk) -> Result<BlockNo> {
    let start = disk.layout().data_start;
    let Some(block) = disk.bitmap().find_free_from(start) else {
        debug!(target: "simfs::alloc", "allocation failed: no free data blocks");
        return Err(SimfsError::OutOfSpace);
    };
    disk.bitmap_mut().set_used(block);
    disk.superblock_mut().free_blocks -= 1;
    trace!(target: "simfs::alloc", block = block.0, "fast_alloc");
    Ok(block)
}

/// Allocate the lowest-indexed free data block.
///
/// Used by the compactor, which drains the data region first so successive
/// calls hand out consecutive blocks from `data_start`.
pub fn compact_alloc(disk: &mut VirtualDisk) -> Result<BlockNo> {
    fast_alloc(disk)
}

/// Free a data block: flip its bit, zero its contents, bump the free count.
///
/// System-region blocks are never freeable. Freeing an already-free block is
/// a no-op reported as `FreeOutcome::AlreadyFree`.
pub fn free_block(disk: &mut VirtualDisk, block: BlockNo) -> Result<FreeOutcome> {
    let layout = *disk.layout();
    if block.0 >= layout.total_blocks {
        return Err(SimfsError::BadBlockIndex {
            block: block.0,
            total: layout.total_blocks,
        });
    }
    if layout.is_system_block(block) {
        return Err(SimfsError::SystemBlock { block: block.0 });
    }
    if disk.bitmap().is_free(block) {
        return Ok(FreeOutcome::AlreadyFree);
    }

    disk.bitmap_mut().set_free(block);
    disk.superblock_mut().free_blocks += 1;
    disk.zero_block(block)?;
    trace!(target: "simfs::alloc", block = block.0, "free_block");
    Ok(FreeOutcome::Freed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::NamedTempFile;

    const TEST_BYTES: u64 = 8 * 1024 * 1024;

    fn scratch() -> (NamedTempFile, VirtualDisk) {
        let file = NamedTempFile::new().expect("temp image");
        let disk = VirtualDisk::create(file.path(), TEST_BYTES).expect("create");
        (file, disk)
    }

    #[test]
    fn alloc_hands_out_lowest_free_block() {
        let (_file, mut disk) = scratch();
        let data_start = disk.layout().data_start;

        let a = fast_alloc(&mut disk).unwrap();
        let b = fast_alloc(&mut disk).unwrap();
        assert_eq!(a, BlockNo(data_start));
        assert_eq!(b, BlockNo(data_start + 1));
        assert!(!disk.is_block_free(a));
        assert_eq!(disk.free_blocks(), disk.layout().data_blocks() - 2);
    }

    #[test]
    fn alloc_reuses_freed_hole() {
        let (_file, mut disk) = scratch();
        let a = fast_alloc(&mut disk).unwrap();
        let _b = fast_alloc(&mut disk).unwrap();
        assert_eq!(free_block(&mut disk, a).unwrap(), FreeOutcome::Freed);

        // The hole at `a` is the lowest free block again.
        assert_eq!(compact_alloc(&mut disk).unwrap(), a);
    }

    #[test]
    fn free_zero_fills_the_block() {
        let (_file, mut disk) = scratch();
        let blk = fast_alloc(&mut disk).unwrap();
        disk.write_block(blk, &vec![0xAA; 4096]).unwrap();
        free_block(&mut disk, blk).unwrap();
        assert!(disk.read_block(blk).unwrap().iter().all(|&b| b == 0));
    }

    #[test]
    fn free_is_idempotent() {
        let (_file, mut disk) = scratch();
        let blk = fast_alloc(&mut disk).unwrap();
        let before = disk.free_blocks();
        assert_eq!(free_block(&mut disk, blk).unwrap(), FreeOutcome::Freed);
        assert_eq!(free_block(&mut disk, blk).unwrap(), FreeOutcome::AlreadyFree);
        assert_eq!(disk.free_blocks(), before + 1);
    }

    #[test]
    fn free_refuses_system_blocks() {
        let (_file, mut disk) = scratch();
        assert!(matches!(
            free_block(&mut disk, BlockNo(0)),
            Err(SimfsError::SystemBlock { block: 0 })
        ));
        let last_system = disk.layout().data_start - 1;
        assert!(matches!(
            free_block(&mut disk, BlockNo(last_system)),
            Err(SimfsError::SystemBlock { .. })
        ));
        let total_blocks = disk.total_blocks();
        assert!(matches!(
            free_block(&mut disk, BlockNo(total_blocks)),
            Err(SimfsError::BadBlockIndex { .. })
        ));
    }

    #[test]
    fn exhaustion_returns_out_of_space() {
        let (_file, mut disk) = scratch();
        let data_blocks = disk.layout().data_blocks();
        for _ in 0..data_blocks {
            fast_alloc(&mut disk).unwrap();
        }
        assert_eq!(disk.free_blocks(), 0);
        assert!(matches!(fast_alloc(&mut disk), Err(SimfsError::OutOfSpace)));
    }
}
