#![forbid(unsafe_code)]
//! Crash simulation and recovery for SimFS.
//!
//! A simulated crash records a set of "corrupted" data blocks belonging to
//! one file inode and flips the facade into its Corrupted state, in which
//! only recovery and read-only inspection are admissible. Recovery frees the
//! corrupted set, removes the files that referenced it, and re-establishes
//! the bitmap/inode/ownership invariants.

pub mod journal;

use serde::{Deserialize, Serialize};
use simfs_alloc::free_block;
use simfs_core::Filesystem;
use simfs_error::{Result, SimfsError};
use simfs_inode::{append_block, free_inode, read_inode, write_inode};
use simfs_types::{blocks_for_bytes, unix_now, BlockNo, FileKind, InodeNo, BLOCK_SIZE,
    DIRECT_BLOCKS};
use tracing::{debug, info, warn};

/// What a crash injection touched.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CrashReport {
    pub target: InodeNo,
    pub corrupted_blocks: Vec<BlockNo>,
    /// Size the target inode was persisted with, for the during-write
    /// variant.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub truncated_size: Option<u32>,
}

/// Recovery attempt outcome.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecoveryOutcome {
    /// Nothing was pending; the volume was already consistent.
    Clean,
    /// The corrupted set was freed and dangling files were removed.
    Repaired,
}

/// Structured record of one recovery run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecoveryReport {
    pub outcome: RecoveryOutcome,
    pub freed_blocks: usize,
    pub removed_files: Vec<String>,
    pub discarded_journal_entries: usize,
}

impl RecoveryReport {
    pub fn to_json(&self) -> std::result::Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

// ── Crash injection ─────────────────────────────────────────────────────────

/// Inject a crash against the most-recently-modified regular file.
///
/// Its direct-block references become the corrupted set; the inode and its
/// bitmap entries remain live, and the disk is marked dirty.
pub fn simulate_crash(fs: &mut Filesystem) -> Result<CrashReport> {
    fs.require_writable()?;

    let (target, corrupted) = {
        let disk = fs.disk()?;
        let layout = *disk.layout();
        let mut newest: Option<(InodeNo, i64)> = None;
        for k in 0..layout.inode_count {
            let inode = read_inode(disk, InodeNo(k))?;
            if inode.kind != FileKind::File {
                continue;
            }
            // Ties go to the highest index: the latest write in a burst.
            if newest.map_or(true, |(_, best)| inode.modified >= best) {
                newest = Some((InodeNo(k), inode.modified));
            }
        }
        let Some((target, _)) = newest else {
            return Err(SimfsError::NotFound("no regular files to corrupt".into()));
        };
        let inode = read_inode(disk, target)?;
        let corrupted: Vec<BlockNo> = inode
            .direct
            .iter()
            .filter_map(|&raw| layout.data_block_ref(raw))
            .collect();
        (target, corrupted)
    };

    fs.set_corruption(corrupted.clone())?;
    fs.disk_mut()?.mark_dirty()?;
    warn!(
        target: "simfs::repair",
        ino = target.0,
        blocks = corrupted.len(),
        "simulated crash"
    );
    Ok(CrashReport {
        target,
        corrupted_blocks: corrupted,
        truncated_size: None,
    })
}

/// Inject a crash mid-write: persist a partial file, then corrupt exactly
/// the blocks that were written.
///
/// `fraction` of the payload's blocks (rounded down, capped at the direct
/// slots) are allocated and written; the inode is persisted with the
/// truncated size matching what landed on disk.
pub fn simulate_crash_during_write(
    fs: &mut Filesystem,
    path: &str,
    payload: &[u8],
    fraction: f64,
) -> Result<CrashReport> {
    fs.require_writable()?;
    let now = unix_now();

    let ino = if fs.file_exists(path) {
        InodeNo(fs.stat(path)?.inode_no)
    } else {
        fs.create_file(path)?
    };

    let blocks_needed = blocks_for_bytes(payload.len());
    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    let crash_blocks = ((f64::from(blocks_needed) * fraction.clamp(0.0, 1.0)).floor() as u32)
        .min(blocks_needed)
        .min(DIRECT_BLOCKS as u32);

    let (disk, owners) = fs.split_mut()?;
    let mut inode = read_inode(disk, ino)?;
    if inode.kind != FileKind::File {
        return Err(SimfsError::NotAFile(path.to_owned()));
    }

    // Drain anything the file already had, then write the partial payload.
    let mut old_blocks = simfs_inode::list_blocks(disk, &inode)?;
    if let Some(indirect) = disk.layout().data_block_ref(inode.indirect) {
        old_blocks.push(indirect);
    }
    for &block in &old_blocks {
        free_block(disk, block)?;
        owners.clear(block);
    }
    inode.reset_pointers();

    let mut written = Vec::with_capacity(crash_blocks as usize);
    for i in 0..crash_blocks {
        let block = simfs_alloc::fast_alloc(disk)?;
        append_block(disk, &mut inode, block)?;
        let offset = i as usize * BLOCK_SIZE as usize;
        let end = (offset + BLOCK_SIZE as usize).min(payload.len());
        let mut data = vec![0u8; BLOCK_SIZE as usize];
        data[..end - offset].copy_from_slice(&payload[offset..end]);
        disk.write_block(block, &data)?;
        owners.set(block, ino);
        written.push(block);
    }

    let truncated = u32::try_from(payload.len())
        .unwrap_or(u32::MAX)
        .min(crash_blocks * BLOCK_SIZE);
    inode.size = truncated;
    inode.modified = now;
    disk.write_bitmap()?;
    write_inode(disk, ino, &inode)?;

    fs.set_corruption(written.clone())?;
    fs.disk_mut()?.mark_dirty()?;
    warn!(
        target: "simfs::repair",
        path,
        ino = ino.0,
        written = written.len(),
        of = blocks_needed,
        "simulated crash during write"
    );
    Ok(CrashReport {
        target: ino,
        corrupted_blocks: written,
        truncated_size: Some(truncated),
    })
}

// ── Recovery ────────────────────────────────────────────────────────────────

/// Repair the volume after a simulated crash.
///
/// 1. Free every block in the corrupted set (frees are idempotent).
/// 2. Collect the inodes whose direct references intersect the set, skipping
///    the root.
/// 3. Remove each one's root-directory entry, free its remaining blocks, and
///    free the inode.
/// 4. Persist the bitmap and superblock and mark the volume clean.
/// 5. Clear the corruption state and rebuild the ownership map.
pub fn run_recovery(fs: &mut Filesystem) -> Result<RecoveryReport> {
    let discarded = {
        let disk = fs.disk_mut()?;
        let pending = journal::scan_uncommitted(disk)?;
        if !pending.is_empty() {
            debug!(
                target: "simfs::repair",
                entries = pending.len(),
                "discarding uncommitted journal entries"
            );
        }
        journal::clear_journal(disk)?;
        pending.len()
    };

    let corrupted = fs.corrupted_blocks();
    if !fs.has_corruption() {
        // Nothing pending: persist and re-mark clean so recovering a volume
        // that was merely left dirty by a dead process settles it.
        let disk = fs.disk_mut()?;
        disk.write_bitmap()?;
        disk.write_superblock()?;
        disk.mark_clean()?;
        return Ok(RecoveryReport {
            outcome: RecoveryOutcome::Clean,
            freed_blocks: 0,
            removed_files: Vec::new(),
            discarded_journal_entries: discarded,
        });
    }

    let now = unix_now();
    let mut freed_blocks = 0usize;
    let mut removed_files = Vec::new();
    {
        let (disk, owners) = fs.split_mut()?;
        let layout = *disk.layout();

        for &block in &corrupted {
            if free_block(disk, block)? == simfs_alloc::FreeOutcome::Freed {
                freed_blocks += 1;
            }
            owners.clear(block);
        }

        // Inodes whose direct references land in the corrupted set. The root
        // is skipped defensively; corruption only ever targets files.
        let mut affected = Vec::new();
        for k in 1..layout.inode_count {
            let ino = InodeNo(k);
            let inode = read_inode(disk, ino)?;
            if !inode.is_valid() {
                continue;
            }
            let hit = inode
                .direct
                .iter()
                .filter_map(|&raw| layout.data_block_ref(raw))
                .any(|b| corrupted.contains(&b));
            if hit {
                affected.push(ino);
            }
        }

        for ino in affected {
            let root_entries = simfs_dir::list_directory(disk, InodeNo::ROOT)?;
            if let Some(entry) = root_entries.iter().find(|e| e.inode == ino) {
                simfs_dir::remove_entry(disk, InodeNo::ROOT, &entry.name, now)?;
                removed_files.push(format!("/{}", entry.name));
            }
            let released = free_inode(disk, ino)?;
            for block in released {
                owners.clear(block);
            }
            debug!(target: "simfs::repair", ino = ino.0, "removed damaged inode");
        }

        disk.write_bitmap()?;
        disk.write_superblock()?;
        disk.mark_clean()?;
    }

    fs.clear_corruption()?;
    fs.rebuild_ownership()?;
    info!(
        target: "simfs::repair",
        freed_blocks,
        removed = removed_files.len(),
        "recovery complete"
    );
    Ok(RecoveryReport {
        outcome: RecoveryOutcome::Repaired,
        freed_blocks,
        removed_files,
        discarded_journal_entries: discarded,
    })
}
