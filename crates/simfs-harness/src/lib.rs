#![forbid(unsafe_code)]
//! End-to-end test fixtures for SimFS.
//!
//! A [`TestVolume`] is a temp-file-backed volume that lives for one test.
//! [`check_invariants`] asserts the volume-wide consistency properties that
//! every operation sequence must preserve:
//!
//! - the superblock free counter equals the count of free bitmap bits in the
//!   data region;
//! - no two live inodes reference the same block;
//! - every live file's block count matches `ceil(size / BLOCK_SIZE)`;
//! - every used data block is a data or indirect block of exactly one live
//!   inode.

use simfs::Filesystem;
use simfs_inode::{list_blocks, read_inode};
use simfs_types::{blocks_for_bytes, BlockNo, FileKind, InodeNo};
use std::collections::HashMap;
use tempfile::NamedTempFile;

/// 100 MiB, the reference configuration.
pub const DEFAULT_BYTES: u64 = simfs_types::DEFAULT_VOLUME_BYTES;

/// A mounted volume backed by a temporary image file.
pub struct TestVolume {
    // Keeps the backing file alive for the volume's lifetime.
    _image: NamedTempFile,
    pub fs: Filesystem,
}

impl TestVolume {
    /// Create and mount a fresh volume of `bytes` bytes.
    #[must_use]
    pub fn create(bytes: u64) -> Self {
        let image = NamedTempFile::new().expect("temp image");
        let mut fs = Filesystem::new(image.path());
        fs.create_volume(bytes).expect("create volume");
        Self { _image: image, fs }
    }

    /// Create and mount the reference 100 MiB volume.
    #[must_use]
    pub fn create_default() -> Self {
        Self::create(DEFAULT_BYTES)
    }
}

/// Deterministic payload bytes, distinguishable per `tag`.
#[must_use]
pub fn pattern(tag: u8, len: usize) -> Vec<u8> {
    (0..len)
        .map(|i| tag.wrapping_add((i % 13) as u8))
        .collect()
}

/// Assert the cross-cutting consistency invariants on a mounted volume.
///
/// # Panics
///
/// Panics with a description of the first violated invariant.
pub fn check_invariants(fs: &Filesystem) {
    let disk = fs.disk().expect("mounted");
    let layout = *disk.layout();

    // Bitmap free bits agree with the superblock counter.
    let mut bitmap_free = 0u32;
    for i in layout.data_start..layout.total_blocks {
        if disk.is_block_free(BlockNo(i)) {
            bitmap_free += 1;
        }
    }
    assert_eq!(
        bitmap_free,
        disk.free_blocks(),
        "free-block counter disagrees with bitmap"
    );

    // Walk every live inode once, collecting referenced blocks.
    let mut referenced: HashMap<BlockNo, u32> = HashMap::new();
    for k in 0..layout.inode_count {
        let inode = read_inode(disk, InodeNo(k)).expect("inode read");
        if !inode.is_valid() {
            continue;
        }
        let blocks = list_blocks(disk, &inode).expect("list blocks");
        if inode.kind == FileKind::File {
            assert_eq!(
                blocks.len() as u32,
                blocks_for_bytes(inode.size as usize),
                "inode {k}: block list does not match ceil(size / block_size)"
            );
            assert_eq!(
                inode.block_count,
                blocks.len() as u32,
                "inode {k}: stored block count disagrees with references"
            );
        }
        for block in blocks {
            assert!(
                !layout.is_system_block(block),
                "inode {k} references system block {block}"
            );
            if let Some(previous) = referenced.insert(block, k) {
                panic!("block {block} referenced by both inode {previous} and {k}");
            }
            assert!(
                !disk.is_block_free(block),
                "inode {k} references free block {block}"
            );
        }
        if let Some(indirect) = layout.data_block_ref(inode.indirect) {
            if let Some(previous) = referenced.insert(indirect, k) {
                panic!("indirect block {indirect} also referenced by inode {previous}");
            }
            assert!(!disk.is_block_free(indirect));
        }
    }

    // Every used data block belongs to exactly one live inode.
    for i in layout.data_start..layout.total_blocks {
        let block = BlockNo(i);
        if !disk.is_block_free(block) {
            assert!(
                referenced.contains_key(&block),
                "used block {block} is owned by no inode"
            );
        }
    }
}

/// Set of used data-region blocks, for dense-prefix assertions.
#[must_use]
pub fn used_data_blocks(fs: &Filesystem) -> Vec<BlockNo> {
    let disk = fs.disk().expect("mounted");
    let layout = *disk.layout();
    (layout.data_start..layout.total_blocks)
        .map(BlockNo)
        .filter(|&b| !disk.is_block_free(b))
        .collect()
}
