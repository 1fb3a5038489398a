#![forbid(unsafe_code)]
//! Filesystem facade for SimFS.
//!
//! [`Filesystem`] is the single entry point front-ends drive: volume
//! lifecycle, file and directory operations, introspection, and the
//! block-ownership map. It is a plain value bound to one image path; all
//! mutation goes through `&mut self`, and the crash-corruption state is part
//! of the value rather than module-level state.

use serde::{Deserialize, Serialize};
use simfs_alloc::{fast_alloc, free_block};
use simfs_block::VirtualDisk;
use simfs_error::{Result, SimfsError};
use simfs_inode::{
    allocate_inode, append_block, free_inode, list_blocks, read_inode, write_inode, FILE_MODE,
};
use simfs_types::{blocks_for_bytes, unix_now, BlockNo, FileKind, InodeNo, BLOCK_SIZE};
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

pub use simfs_inode::Inode;

// ── Block ownership ─────────────────────────────────────────────────────────

/// In-memory map from data-region block to the inode that owns it.
///
/// Dense vector indexed by `block - data_start`; never persisted. Rebuildable
/// from the inode table at any time, which makes it authoritative after bulk
/// mutations (compaction, recovery).
#[derive(Debug, Clone)]
pub struct OwnerMap {
    data_start: u32,
    owners: Vec<Option<InodeNo>>,
}

impl OwnerMap {
    #[must_use]
    pub fn new(data_start: u32, data_blocks: u32) -> Self {
        Self {
            data_start,
            owners: vec![None; data_blocks as usize],
        }
    }

    fn slot(&self, block: BlockNo) -> Option<usize> {
        block.0.checked_sub(self.data_start).map(|i| i as usize)
    }

    pub fn set(&mut self, block: BlockNo, owner: InodeNo) {
        if let Some(idx) = self.slot(block) {
            if let Some(entry) = self.owners.get_mut(idx) {
                *entry = Some(owner);
            }
        }
    }

    pub fn clear(&mut self, block: BlockNo) {
        if let Some(idx) = self.slot(block) {
            if let Some(entry) = self.owners.get_mut(idx) {
                *entry = None;
            }
        }
    }

    #[must_use]
    pub fn owner(&self, block: BlockNo) -> Option<InodeNo> {
        self.slot(block).and_then(|idx| self.owners.get(idx).copied().flatten())
    }

    pub fn clear_all(&mut self) {
        self.owners.fill(None);
    }

    /// Count of blocks with a recorded owner.
    #[must_use]
    pub fn owned_blocks(&self) -> usize {
        self.owners.iter().filter(|o| o.is_some()).count()
    }
}

// ── Reports ─────────────────────────────────────────────────────────────────

/// Outcome of `mount`: whether the previous session unmounted cleanly.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct MountReport {
    pub was_clean: bool,
}

/// Snapshot of volume counters for front-end display.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VolumeStats {
    pub total_blocks: u32,
    pub free_blocks: u32,
    pub used_blocks: u32,
    pub free_inodes: u32,
    pub fragmentation_score: f64,
}

// ── Facade ──────────────────────────────────────────────────────────────────

#[derive(Debug, Default)]
struct CorruptionState {
    active: bool,
    blocks: Vec<BlockNo>,
}

#[derive(Debug)]
struct Mounted {
    disk: VirtualDisk,
    owners: OwnerMap,
    corruption: CorruptionState,
}

/// The filesystem facade, bound to one image path.
#[derive(Debug)]
pub struct Filesystem {
    path: PathBuf,
    mounted: Option<Mounted>,
}

impl Filesystem {
    /// An unmounted facade for the image at `path`.
    #[must_use]
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            mounted: None,
        }
    }

    #[must_use]
    pub fn image_path(&self) -> &Path {
        &self.path
    }

    #[must_use]
    pub fn is_mounted(&self) -> bool {
        self.mounted.is_some()
    }

    fn inner(&self) -> Result<&Mounted> {
        self.mounted.as_ref().ok_or(SimfsError::NotMounted)
    }

    fn inner_mut(&mut self) -> Result<&mut Mounted> {
        self.mounted.as_mut().ok_or(SimfsError::NotMounted)
    }

    // ── Volume lifecycle ────────────────────────────────────────────────────

    /// Create and format a fresh volume of `bytes` bytes, install the root
    /// directory, and leave it mounted.
    pub fn create_volume(&mut self, bytes: u64) -> Result<()> {
        let mut disk = VirtualDisk::create(&self.path, bytes)?;
        simfs_dir::init_root(&mut disk, unix_now())?;
        disk.write_bitmap()?;
        // In use from here on; an exit without unmount must read as dirty.
        disk.mark_dirty()?;

        let layout = *disk.layout();
        let mut mounted = Mounted {
            disk,
            owners: OwnerMap::new(layout.data_start, layout.data_blocks()),
            corruption: CorruptionState::default(),
        };
        rebuild_owner_map(&mounted.disk, &mut mounted.owners)?;
        self.mounted = Some(mounted);
        info!(target: "simfs::core", path = %self.path.display(), "volume created and mounted");
        Ok(())
    }

    /// Mount an existing volume image.
    pub fn mount(&mut self) -> Result<MountReport> {
        if self.is_mounted() {
            return Ok(MountReport { was_clean: true });
        }
        let mut disk = VirtualDisk::open(&self.path)?;
        let was_clean = disk.was_clean_shutdown();
        if !was_clean {
            warn!(
                target: "simfs::core",
                path = %self.path.display(),
                "mounting a dirty volume; recovery may be needed"
            );
        }
        disk.mark_dirty()?;

        let layout = *disk.layout();
        let mut mounted = Mounted {
            disk,
            owners: OwnerMap::new(layout.data_start, layout.data_blocks()),
            corruption: CorruptionState::default(),
        };
        rebuild_owner_map(&mounted.disk, &mut mounted.owners)?;
        self.mounted = Some(mounted);
        info!(target: "simfs::core", path = %self.path.display(), was_clean, "volume mounted");
        Ok(MountReport { was_clean })
    }

    /// Mark the volume clean and release it.
    pub fn unmount(&mut self) -> Result<()> {
        let mut mounted = self.mounted.take().ok_or(SimfsError::NotMounted)?;
        mounted.disk.mark_clean()?;
        mounted.disk.close()?;
        info!(target: "simfs::core", path = %self.path.display(), "volume unmounted");
        Ok(())
    }

    // ── Corruption gate ─────────────────────────────────────────────────────

    /// Reject mutating operations while simulated corruption is pending.
    pub fn require_writable(&self) -> Result<()> {
        if self.inner()?.corruption.active {
            return Err(SimfsError::Corrupted);
        }
        Ok(())
    }

    #[must_use]
    pub fn has_corruption(&self) -> bool {
        self.mounted
            .as_ref()
            .is_some_and(|m| m.corruption.active)
    }

    /// Blocks recorded as corrupted by the last crash injection.
    #[must_use]
    pub fn corrupted_blocks(&self) -> Vec<BlockNo> {
        self.mounted
            .as_ref()
            .map(|m| m.corruption.blocks.clone())
            .unwrap_or_default()
    }

    /// Record a corrupted-block set and enter the Corrupted state.
    pub fn set_corruption(&mut self, blocks: Vec<BlockNo>) -> Result<()> {
        let inner = self.inner_mut()?;
        inner.corruption = CorruptionState {
            active: true,
            blocks,
        };
        Ok(())
    }

    /// Leave the Corrupted state and forget the corrupted set.
    pub fn clear_corruption(&mut self) -> Result<()> {
        let inner = self.inner_mut()?;
        inner.corruption = CorruptionState::default();
        Ok(())
    }

    // ── File operations ─────────────────────────────────────────────────────

    /// Create an empty regular file. The new file has size 0 and no blocks.
    pub fn create_file(&mut self, path: &str) -> Result<InodeNo> {
        self.require_writable()?;
        let (parent_path, name) = simfs_dir::split_parent(path);
        if name.is_empty() {
            return Err(SimfsError::NotFound(path.to_owned()));
        }
        let now = unix_now();
        let disk = &mut self.inner_mut()?.disk;
        let parent = simfs_dir::resolve_path(disk, parent_path, InodeNo::ROOT)?;
        if simfs_dir::lookup_entry(disk, parent, name)?.is_some() {
            return Err(SimfsError::Exists(path.to_owned()));
        }
        let (ino, _) = allocate_inode(disk, FileKind::File, FILE_MODE, now)?;
        simfs_dir::add_entry(disk, parent, name, ino, FileKind::File, now)?;
        self.record_inode_ownership(parent)?;
        debug!(target: "simfs::core", path, ino = ino.0, "created file");
        Ok(ino)
    }

    /// Overwrite a file's contents.
    ///
    /// The old extents are freed before the new allocation; a mid-allocation
    /// `OutOfSpace` leaves the file drained at size 0 rather than restored.
    pub fn write_file(&mut self, path: &str, bytes: &[u8]) -> Result<()> {
        self.require_writable()?;
        let now = unix_now();
        let ino = {
            let disk = &self.inner()?.disk;
            simfs_dir::resolve_path(disk, path, InodeNo::ROOT)?
        };
        let inner = self.inner_mut()?;
        let mut inode = read_inode(&inner.disk, ino)?;
        if inode.kind != FileKind::File {
            return Err(SimfsError::NotAFile(path.to_owned()));
        }

        // Drain: free every currently referenced block, including the
        // indirect block itself, and clear its ownership.
        let mut old_blocks = list_blocks(&inner.disk, &inode)?;
        if let Some(indirect) = inner.disk.layout().data_block_ref(inode.indirect) {
            old_blocks.push(indirect);
        }
        for &block in &old_blocks {
            free_block(&mut inner.disk, block)?;
            inner.owners.clear(block);
        }
        inode.reset_pointers();
        inode.size = 0;
        write_inode(&mut inner.disk, ino, &inode)?;

        match write_payload(inner, ino, &mut inode, bytes, now) {
            Ok(()) => {
                debug!(
                    target: "simfs::core",
                    path,
                    bytes = bytes.len(),
                    blocks = inode.block_count,
                    "wrote file"
                );
                Ok(())
            }
            Err(err) => {
                // Roll the partial allocation back to the drained state; the
                // old contents are already gone (documented contract).
                let mut partial = list_blocks(&inner.disk, &inode)?;
                if let Some(indirect) = inner.disk.layout().data_block_ref(inode.indirect) {
                    partial.push(indirect);
                }
                for &block in &partial {
                    free_block(&mut inner.disk, block)?;
                    inner.owners.clear(block);
                }
                inode.reset_pointers();
                inode.size = 0;
                inode.modified = now;
                write_inode(&mut inner.disk, ino, &inode)?;
                warn!(target: "simfs::core", path, "write failed; file left empty");
                Err(err)
            }
        }
    }

    /// Read a file's full contents.
    pub fn read_file(&self, path: &str) -> Result<Vec<u8>> {
        let disk = &self.inner()?.disk;
        let ino = simfs_dir::resolve_path(disk, path, InodeNo::ROOT)?;
        let inode = read_inode(disk, ino)?;
        if inode.kind != FileKind::File {
            return Err(SimfsError::NotAFile(path.to_owned()));
        }
        read_inode_data(disk, &inode)
    }

    /// Delete a file, freeing its inode and all referenced blocks.
    pub fn delete_file(&mut self, path: &str) -> Result<()> {
        self.require_writable()?;
        let (parent_path, name) = simfs_dir::split_parent(path);
        let now = unix_now();
        let inner = self.inner_mut()?;
        let parent = simfs_dir::resolve_path(&inner.disk, parent_path, InodeNo::ROOT)?;
        let ino = simfs_dir::lookup_entry(&inner.disk, parent, name)?
            .ok_or_else(|| SimfsError::NotFound(path.to_owned()))?;
        let inode = read_inode(&inner.disk, ino)?;
        if inode.kind != FileKind::File {
            return Err(SimfsError::NotAFile(path.to_owned()));
        }

        let released = free_inode(&mut inner.disk, ino)?;
        for block in released {
            inner.owners.clear(block);
        }
        simfs_dir::remove_entry(&mut inner.disk, parent, name, now)?;
        debug!(target: "simfs::core", path, ino = ino.0, "deleted file");
        Ok(())
    }

    #[must_use]
    pub fn file_exists(&self, path: &str) -> bool {
        self.inner()
            .ok()
            .and_then(|m| simfs_dir::resolve_path(&m.disk, path, InodeNo::ROOT).ok())
            .is_some()
    }

    /// Metadata record for the inode at `path`.
    pub fn stat(&self, path: &str) -> Result<Inode> {
        let disk = &self.inner()?.disk;
        let ino = simfs_dir::resolve_path(disk, path, InodeNo::ROOT)?;
        read_inode(disk, ino)
    }

    // ── Directory operations ────────────────────────────────────────────────

    /// Create a directory with `.` and `..` installed.
    pub fn create_dir(&mut self, path: &str) -> Result<InodeNo> {
        self.require_writable()?;
        let (parent_path, name) = simfs_dir::split_parent(path);
        if name.is_empty() {
            return Err(SimfsError::Exists(path.to_owned()));
        }
        let now = unix_now();
        let inner = self.inner_mut()?;
        let parent = simfs_dir::resolve_path(&inner.disk, parent_path, InodeNo::ROOT)?;
        if simfs_dir::lookup_entry(&inner.disk, parent, name)?.is_some() {
            return Err(SimfsError::Exists(path.to_owned()));
        }
        let ino = simfs_dir::create_directory(&mut inner.disk, parent, name, now)?;
        self.record_inode_ownership(ino)?;
        self.record_inode_ownership(parent)?;
        debug!(target: "simfs::core", path, ino = ino.0, "created directory");
        Ok(ino)
    }

    /// List the entries of the directory at `path`.
    pub fn list_dir(&self, path: &str) -> Result<Vec<simfs_dir::DirEntry>> {
        let disk = &self.inner()?.disk;
        let ino = simfs_dir::resolve_path(disk, path, InodeNo::ROOT)?;
        simfs_dir::list_directory(disk, ino).map_err(|err| match err {
            SimfsError::NotADirectory(_) => SimfsError::NotADirectory(path.to_owned()),
            other => other,
        })
    }

    // ── Introspection ───────────────────────────────────────────────────────

    pub fn total_blocks(&self) -> Result<u32> {
        Ok(self.inner()?.disk.total_blocks())
    }

    pub fn free_blocks(&self) -> Result<u32> {
        Ok(self.inner()?.disk.free_blocks())
    }

    pub fn used_blocks(&self) -> Result<u32> {
        let disk = &self.inner()?.disk;
        Ok(disk.total_blocks() - disk.free_blocks())
    }

    /// Aggregate fragmentation score in `[0, 100]`.
    ///
    /// Per-file fragments are maximal consecutive runs over the sorted block
    /// list; the score is `(avg_fragments - 1) * 20`, clamped. 0 with no
    /// files.
    pub fn fragmentation_score(&self) -> Result<f64> {
        let disk = &self.inner()?.disk;
        let mut files = 0u32;
        let mut fragments = 0u32;
        for k in 0..disk.layout().inode_count {
            let inode = read_inode(disk, InodeNo(k))?;
            if inode.kind != FileKind::File {
                continue;
            }
            files += 1;
            let mut blocks = list_blocks(disk, &inode)?;
            blocks.sort_unstable();
            fragments += count_fragments(&blocks);
        }
        if files == 0 {
            return Ok(0.0);
        }
        let avg = f64::from(fragments) / f64::from(files);
        Ok(((avg - 1.0) * 20.0).clamp(0.0, 100.0))
    }

    /// Owner of a data block, if any.
    pub fn block_owner(&self, block: BlockNo) -> Result<Option<InodeNo>> {
        Ok(self.inner()?.owners.owner(block))
    }

    /// Root-level path of the file backed by inode `ino`, if one is linked.
    pub fn filename_from_inode(&self, ino: InodeNo) -> Result<Option<String>> {
        let disk = &self.inner()?.disk;
        let entries = simfs_dir::list_directory(disk, InodeNo::ROOT)?;
        Ok(entries
            .into_iter()
            .filter(|e| e.name != "." && e.name != "..")
            .find(|e| e.inode == ino)
            .map(|e| format!("/{}", e.name)))
    }

    /// Counter snapshot for front-end display.
    pub fn stats(&self) -> Result<VolumeStats> {
        Ok(VolumeStats {
            total_blocks: self.total_blocks()?,
            free_blocks: self.free_blocks()?,
            used_blocks: self.used_blocks()?,
            free_inodes: self.inner()?.disk.superblock().free_inodes,
            fragmentation_score: self.fragmentation_score()?,
        })
    }

    // ── Ownership maintenance ───────────────────────────────────────────────

    /// Re-derive the whole ownership map from the inode table. Idempotent;
    /// safe after any bulk mutation (compaction, recovery).
    pub fn rebuild_ownership(&mut self) -> Result<()> {
        let inner = self.inner_mut()?;
        rebuild_owner_map(&inner.disk, &mut inner.owners)
    }

    /// Record ownership for every block currently referenced by `ino`.
    pub fn record_inode_ownership(&mut self, ino: InodeNo) -> Result<()> {
        let inner = self.inner_mut()?;
        let inode = read_inode(&inner.disk, ino)?;
        if !inode.is_valid() {
            return Ok(());
        }
        for block in list_blocks(&inner.disk, &inode)? {
            inner.owners.set(block, ino);
        }
        if let Some(indirect) = inner.disk.layout().data_block_ref(inode.indirect) {
            inner.owners.set(indirect, ino);
        }
        Ok(())
    }

    // ── Component access for maintenance crates ─────────────────────────────

    pub fn disk(&self) -> Result<&VirtualDisk> {
        Ok(&self.inner()?.disk)
    }

    pub fn disk_mut(&mut self) -> Result<&mut VirtualDisk> {
        Ok(&mut self.inner_mut()?.disk)
    }

    /// Simultaneous access to the disk and the ownership map.
    pub fn split_mut(&mut self) -> Result<(&mut VirtualDisk, &mut OwnerMap)> {
        let inner = self.inner_mut()?;
        Ok((&mut inner.disk, &mut inner.owners))
    }
}

// ── Internals ───────────────────────────────────────────────────────────────

/// Allocate blocks for `bytes` and write them through `inode`.
///
/// Direct slots fill first; overflow allocates the indirect block, owned by
/// the same inode. The final partial block is zero-padded.
fn write_payload(
    inner: &mut Mounted,
    ino: InodeNo,
    inode: &mut simfs_inode::Inode,
    bytes: &[u8],
    now: i64,
) -> Result<()> {
    let blocks_needed = blocks_for_bytes(bytes.len());
    for i in 0..blocks_needed {
        let block = fast_alloc(&mut inner.disk)?;
        match append_block(&mut inner.disk, inode, block) {
            Ok(Some(indirect)) => inner.owners.set(indirect, ino),
            Ok(None) => {}
            Err(err) => {
                // The block never made it into the inode; without this free
                // it would be allocated with no owner.
                free_block(&mut inner.disk, block)?;
                return Err(err);
            }
        }
        let offset = i as usize * BLOCK_SIZE as usize;
        let end = (offset + BLOCK_SIZE as usize).min(bytes.len());
        let mut data = vec![0u8; BLOCK_SIZE as usize];
        data[..end - offset].copy_from_slice(&bytes[offset..end]);
        inner.disk.write_block(block, &data)?;
        inner.owners.set(block, ino);
    }
    inode.size = u32::try_from(bytes.len()).map_err(|_| SimfsError::OutOfSpace)?;
    inode.modified = now;
    write_inode(&mut inner.disk, ino, inode)
}

/// Concatenate a file's blocks and truncate to its recorded size.
pub fn read_inode_data(disk: &VirtualDisk, inode: &simfs_inode::Inode) -> Result<Vec<u8>> {
    let mut data = Vec::with_capacity(inode.size as usize);
    for block in list_blocks(disk, inode)? {
        let chunk = disk.read_block(block)?;
        let remaining = inode.size as usize - data.len();
        data.extend_from_slice(&chunk[..remaining.min(chunk.len())]);
        if data.len() >= inode.size as usize {
            break;
        }
    }
    data.truncate(inode.size as usize);
    Ok(data)
}

/// Number of maximal consecutive runs in a sorted block list.
#[must_use]
pub fn count_fragments(sorted: &[BlockNo]) -> u32 {
    if sorted.is_empty() {
        return 0;
    }
    let mut fragments = 1u32;
    for pair in sorted.windows(2) {
        if pair[1].0 != pair[0].0 + 1 {
            fragments += 1;
        }
    }
    fragments
}

fn rebuild_owner_map(disk: &VirtualDisk, owners: &mut OwnerMap) -> Result<()> {
    owners.clear_all();
    for k in 0..disk.layout().inode_count {
        let ino = InodeNo(k);
        let inode = read_inode(disk, ino)?;
        if !inode.is_valid() {
            continue;
        }
        for block in list_blocks(disk, &inode)? {
            owners.set(block, ino);
        }
        if let Some(indirect) = disk.layout().data_block_ref(inode.indirect) {
            owners.set(indirect, ino);
        }
    }
    Ok(())
}
