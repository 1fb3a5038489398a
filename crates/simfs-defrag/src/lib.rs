#![forbid(unsafe_code)]
//! Compaction for SimFS.
//!
//! Whole-volume defragmentation drains every live file and reallocates them
//! lowest-first against an empty data region, so the final layout is a dense
//! prefix starting at `data_start` with one extent per file. A per-file
//! variant exists for spot compaction; it cannot deliver the dense prefix on
//! its own.

use serde::{Deserialize, Serialize};
use simfs_alloc::{compact_alloc, free_block};
use simfs_core::{count_fragments, read_inode_data, Filesystem};
use simfs_error::Result;
use simfs_inode::{append_block, list_blocks, read_inode, write_inode, Inode};
use simfs_types::{blocks_for_bytes, BlockNo, FileKind, InodeNo, BLOCK_SIZE};
use tracing::{debug, info};

/// Progress callback: `(files_done, files_total)`, invoked between files.
pub type Progress<'a> = &'a mut dyn FnMut(usize, usize);

/// Fragmentation snapshot for the whole volume.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FragmentationReport {
    pub total_files: u32,
    pub fragmented_files: u32,
    pub total_fragments: u32,
    pub average_fragments_per_file: f64,
    pub largest_contiguous_free_run: u32,
    pub score: f64,
}

/// Outcome of a whole-volume compaction.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DefragReport {
    pub files_compacted: u32,
    pub score_before: f64,
    pub score_after: f64,
}

/// Measure fragmentation without mutating anything.
pub fn analyze(fs: &Filesystem) -> Result<FragmentationReport> {
    let score = fs.fragmentation_score()?;
    let disk = fs.disk()?;
    let layout = *disk.layout();

    let mut total_files = 0u32;
    let mut fragmented_files = 0u32;
    let mut total_fragments = 0u32;
    for k in 0..layout.inode_count {
        let inode = read_inode(disk, InodeNo(k))?;
        if inode.kind != FileKind::File {
            continue;
        }
        total_files += 1;
        let mut blocks = list_blocks(disk, &inode)?;
        blocks.sort_unstable();
        let fragments = count_fragments(&blocks);
        total_fragments += fragments;
        if fragments > 1 {
            fragmented_files += 1;
        }
    }

    let mut largest_run = 0u32;
    let mut run = 0u32;
    for i in layout.data_start..layout.total_blocks {
        if disk.is_block_free(BlockNo(i)) {
            run += 1;
            largest_run = largest_run.max(run);
        } else {
            run = 0;
        }
    }

    Ok(FragmentationReport {
        total_files,
        fragmented_files,
        total_fragments,
        average_fragments_per_file: if total_files == 0 {
            0.0
        } else {
            f64::from(total_fragments) / f64::from(total_files)
        },
        largest_contiguous_free_run: largest_run,
        score,
    })
}

/// A file staged for reallocation.
struct StagedFile {
    ino: InodeNo,
    inode: Inode,
    payload: Vec<u8>,
}

/// Compact the whole volume by drain-and-reallocate.
///
/// 1. Collect every valid regular file with nonzero size.
/// 2. Drain: free all their blocks, leaving the data region empty of file
///    extents.
/// 3. Reallocate in inode-index order with the lowest-first allocator; with
///    the region drained, each call yields the next consecutive block.
/// 4. Persist the bitmap and superblock.
pub fn defragment(fs: &mut Filesystem, mut progress: Option<Progress<'_>>) -> Result<DefragReport> {
    fs.require_writable()?;
    let score_before = fs.fragmentation_score()?;

    // Collect.
    let mut staged = Vec::new();
    {
        let disk = fs.disk()?;
        for k in 0..disk.layout().inode_count {
            let ino = InodeNo(k);
            let inode = read_inode(disk, ino)?;
            if inode.kind != FileKind::File || inode.size == 0 {
                continue;
            }
            let payload = read_inode_data(disk, &inode)?;
            staged.push(StagedFile { ino, inode, payload });
        }
    }

    // Drain.
    {
        let (disk, owners) = fs.split_mut()?;
        for file in &mut staged {
            let mut old_blocks = list_blocks(disk, &file.inode)?;
            if let Some(indirect) = disk.layout().data_block_ref(file.inode.indirect) {
                old_blocks.push(indirect);
            }
            for &block in &old_blocks {
                free_block(disk, block)?;
                owners.clear(block);
            }
            file.inode.reset_pointers();
            write_inode(disk, file.ino, &file.inode)?;
        }
    }

    // Reallocate.
    let total = staged.len();
    for (done, file) in staged.iter_mut().enumerate() {
        let (disk, owners) = fs.split_mut()?;
        let blocks_needed = blocks_for_bytes(file.payload.len());
        for i in 0..blocks_needed {
            let block = compact_alloc(disk)?;
            if let Some(indirect) = append_block(disk, &mut file.inode, block)? {
                owners.set(indirect, file.ino);
            }
            let offset = i as usize * BLOCK_SIZE as usize;
            let end = (offset + BLOCK_SIZE as usize).min(file.payload.len());
            let mut data = vec![0u8; BLOCK_SIZE as usize];
            data[..end - offset].copy_from_slice(&file.payload[offset..end]);
            disk.write_block(block, &data)?;
            owners.set(block, file.ino);
        }
        write_inode(disk, file.ino, &file.inode)?;
        debug!(
            target: "simfs::defrag",
            ino = file.ino.0,
            blocks = blocks_needed,
            "reallocated file"
        );
        if let Some(cb) = progress.as_mut() {
            cb(done + 1, total);
        }
    }

    // Persist.
    {
        let disk = fs.disk_mut()?;
        disk.write_bitmap()?;
        disk.write_superblock()?;
    }

    let score_after = fs.fragmentation_score()?;
    info!(
        target: "simfs::defrag",
        files = total,
        score_before,
        score_after,
        "defragmentation complete"
    );
    Ok(DefragReport {
        files_compacted: u32::try_from(total).unwrap_or(u32::MAX),
        score_before,
        score_after,
    })
}

/// Compact a single file in place: free its blocks, then reallocate
/// lowest-first.
///
/// Only yields one contiguous extent when the freed range is the lowest free
/// region; global compaction needs [`defragment`].
pub fn defragment_file(fs: &mut Filesystem, path: &str) -> Result<()> {
    fs.require_writable()?;
    let ino = InodeNo(fs.stat(path)?.inode_no);
    let (disk, owners) = fs.split_mut()?;
    let mut inode = read_inode(disk, ino)?;
    if inode.kind != FileKind::File || inode.size == 0 {
        return Ok(());
    }

    let payload = read_inode_data(disk, &inode)?;
    let mut old_blocks = list_blocks(disk, &inode)?;
    if let Some(indirect) = disk.layout().data_block_ref(inode.indirect) {
        old_blocks.push(indirect);
    }
    for &block in &old_blocks {
        free_block(disk, block)?;
        owners.clear(block);
    }
    inode.reset_pointers();

    let blocks_needed = blocks_for_bytes(payload.len());
    for i in 0..blocks_needed {
        let block = compact_alloc(disk)?;
        if let Some(indirect) = append_block(disk, &mut inode, block)? {
            owners.set(indirect, ino);
        }
        let offset = i as usize * BLOCK_SIZE as usize;
        let end = (offset + BLOCK_SIZE as usize).min(payload.len());
        let mut data = vec![0u8; BLOCK_SIZE as usize];
        data[..end - offset].copy_from_slice(&payload[offset..end]);
        disk.write_block(block, &data)?;
        owners.set(block, ino);
    }
    write_inode(disk, ino, &inode)?;
    disk.write_bitmap()?;
    disk.write_superblock()?;
    debug!(target: "simfs::defrag", path, ino = ino.0, "compacted file");
    Ok(())
}
