#![forbid(unsafe_code)]
//! Inode management for SimFS.
//!
//! The 128-byte on-disk inode record, table I/O by index, allocation and
//! freeing, and the direct/single-indirect block-pointer logic. All pointer
//! traversal goes through `DiskLayout::data_block_ref`: a slot outside the
//! data region reads as empty, never as an error.

use simfs_alloc::free_block;
use simfs_block::VirtualDisk;
use simfs_error::{Result, SimfsError};
use simfs_types::{
    read_le_i64, read_le_u16, read_le_u32, BlockNo, DiskLayout, FileKind, InodeNo, LayoutError,
    BLOCK_SIZE, DIRECT_BLOCKS, INODE_SIZE, REFS_PER_INDIRECT,
};
use tracing::{debug, trace};

/// Default permission bits for new inodes (stored, never enforced).
pub const FILE_MODE: u16 = 0o644;
pub const DIR_MODE: u16 = 0o755;

// On-disk offsets within the 128-byte record. All fields little-endian.
const IN_INODE_NO: usize = 0x00;
const IN_KIND: usize = 0x04;
const IN_MODE: usize = 0x06;
const IN_LINK_COUNT: usize = 0x08;
const IN_SIZE: usize = 0x0C;
const IN_BLOCK_COUNT: usize = 0x10;
const IN_CREATED: usize = 0x14;
const IN_MODIFIED: usize = 0x1C;
const IN_ACCESSED: usize = 0x24;
const IN_DIRECT: usize = 0x2C;
const IN_INDIRECT: usize = 0x5C;

/// Per-file metadata record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Inode {
    pub inode_no: u32,
    pub kind: FileKind,
    pub mode: u16,
    pub link_count: u16,
    pub size: u32,
    pub block_count: u32,
    pub created: i64,
    pub modified: i64,
    pub accessed: i64,
    pub direct: [u32; DIRECT_BLOCKS],
    pub indirect: u32,
}

impl Inode {
    /// A zeroed (free) record.
    #[must_use]
    pub fn free() -> Self {
        Self {
            inode_no: 0,
            kind: FileKind::Free,
            mode: 0,
            link_count: 0,
            size: 0,
            block_count: 0,
            created: 0,
            modified: 0,
            accessed: 0,
            direct: [0; DIRECT_BLOCKS],
            indirect: 0,
        }
    }

    /// A fresh live record of the given kind.
    #[must_use]
    pub fn new(inode_no: InodeNo, kind: FileKind, mode: u16, now: i64) -> Self {
        Self {
            inode_no: inode_no.0,
            kind,
            mode,
            link_count: if kind == FileKind::Dir { 2 } else { 1 },
            size: 0,
            block_count: 0,
            created: now,
            modified: now,
            accessed: now,
            direct: [0; DIRECT_BLOCKS],
            indirect: 0,
        }
    }

    #[must_use]
    pub fn is_valid(&self) -> bool {
        self.kind != FileKind::Free
    }

    /// Reset every pointer slot to the sentinel and zero the block count.
    pub fn reset_pointers(&mut self) {
        self.direct = [0; DIRECT_BLOCKS];
        self.indirect = 0;
        self.block_count = 0;
    }

    /// Serialize into a 128-byte record.
    #[must_use]
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = vec![0u8; INODE_SIZE as usize];
        buf[IN_INODE_NO..IN_INODE_NO + 4].copy_from_slice(&self.inode_no.to_le_bytes());
        buf[IN_KIND] = self.kind.tag();
        buf[IN_MODE..IN_MODE + 2].copy_from_slice(&self.mode.to_le_bytes());
        buf[IN_LINK_COUNT..IN_LINK_COUNT + 2].copy_from_slice(&self.link_count.to_le_bytes());
        buf[IN_SIZE..IN_SIZE + 4].copy_from_slice(&self.size.to_le_bytes());
        buf[IN_BLOCK_COUNT..IN_BLOCK_COUNT + 4].copy_from_slice(&self.block_count.to_le_bytes());
        buf[IN_CREATED..IN_CREATED + 8].copy_from_slice(&self.created.to_le_bytes());
        buf[IN_MODIFIED..IN_MODIFIED + 8].copy_from_slice(&self.modified.to_le_bytes());
        buf[IN_ACCESSED..IN_ACCESSED + 8].copy_from_slice(&self.accessed.to_le_bytes());
        for (i, slot) in self.direct.iter().enumerate() {
            let at = IN_DIRECT + i * 4;
            buf[at..at + 4].copy_from_slice(&slot.to_le_bytes());
        }
        buf[IN_INDIRECT..IN_INDIRECT + 4].copy_from_slice(&self.indirect.to_le_bytes());
        buf
    }

    /// Parse a 128-byte record.
    pub fn decode(data: &[u8]) -> Result<Self> {
        let mut direct = [0u32; DIRECT_BLOCKS];
        for (i, slot) in direct.iter_mut().enumerate() {
            *slot = read_le_u32(data, IN_DIRECT + i * 4)?;
        }
        let kind_tag = *data.get(IN_KIND).ok_or(LayoutError::InsufficientData {
            needed: 1,
            offset: IN_KIND,
            actual: data.len(),
        })?;
        Ok(Self {
            inode_no: read_le_u32(data, IN_INODE_NO)?,
            kind: FileKind::from_tag(kind_tag)?,
            mode: read_le_u16(data, IN_MODE)?,
            link_count: read_le_u16(data, IN_LINK_COUNT)?,
            size: read_le_u32(data, IN_SIZE)?,
            block_count: read_le_u32(data, IN_BLOCK_COUNT)?,
            created: read_le_i64(data, IN_CREATED)?,
            modified: read_le_i64(data, IN_MODIFIED)?,
            accessed: read_le_i64(data, IN_ACCESSED)?,
            direct,
            indirect: read_le_u32(data, IN_INDIRECT)?,
        })
    }
}

// ── Table I/O ───────────────────────────────────────────────────────────────

/// Disk location of inode `ino`: containing block and byte offset within it.
#[must_use]
pub fn locate_inode(layout: &DiskLayout, ino: InodeNo) -> (BlockNo, usize) {
    let inodes_per_block = BLOCK_SIZE / INODE_SIZE;
    let block = BlockNo(layout.inode_table_start + ino.0 / inodes_per_block);
    let offset = ((ino.0 % inodes_per_block) * INODE_SIZE) as usize;
    (block, offset)
}

fn check_inode_index(layout: &DiskLayout, ino: InodeNo) -> Result<()> {
    if ino.0 >= layout.inode_count {
        return Err(LayoutError::InvalidField {
            field: "inode_no",
            value: u64::from(ino.0),
        }
        .into());
    }
    Ok(())
}

/// Read and parse inode `ino` from the table.
pub fn read_inode(disk: &VirtualDisk, ino: InodeNo) -> Result<Inode> {
    check_inode_index(disk.layout(), ino)?;
    let (block, offset) = locate_inode(disk.layout(), ino);
    let data = disk.read_block(block)?;
    Inode::decode(&data[offset..offset + INODE_SIZE as usize])
}

/// Serialize `inode` and write it into the table (read-modify-write of the
/// containing block).
pub fn write_inode(disk: &mut VirtualDisk, ino: InodeNo, inode: &Inode) -> Result<()> {
    check_inode_index(disk.layout(), ino)?;
    let (block, offset) = locate_inode(disk.layout(), ino);
    let mut data = disk.read_block(block)?;
    data[offset..offset + INODE_SIZE as usize].copy_from_slice(&inode.encode());
    disk.write_block(block, &data)
}

// ── Allocation ──────────────────────────────────────────────────────────────

/// Allocate the first free inode slot and initialize it.
///
/// Link count starts at 1 for files and 2 for directories; all three
/// timestamps are set to `now`.
pub fn allocate_inode(
    disk: &mut VirtualDisk,
    kind: FileKind,
    mode: u16,
    now: i64,
) -> Result<(InodeNo, Inode)> {
    let count = disk.layout().inode_count;
    for k in 0..count {
        let ino = InodeNo(k);
        let existing = read_inode(disk, ino)?;
        if existing.is_valid() {
            continue;
        }
        let inode = Inode::new(ino, kind, mode, now);
        write_inode(disk, ino, &inode)?;
        disk.superblock_mut().free_inodes -= 1;
        debug!(target: "simfs::inode", ino = k, kind = ?kind, "allocated inode");
        return Ok((ino, inode));
    }
    Err(SimfsError::OutOfInodes)
}

/// Free inode `ino`: release every block it references (direct slots,
/// indirect contents, and the indirect block itself), then zero the record.
///
/// Returns the blocks that were released so callers can clear ownership.
pub fn free_inode(disk: &mut VirtualDisk, ino: InodeNo) -> Result<Vec<BlockNo>> {
    let inode = read_inode(disk, ino)?;
    let mut released = list_blocks(disk, &inode)?;
    if let Some(indirect) = disk.layout().data_block_ref(inode.indirect) {
        released.push(indirect);
    }
    for &block in &released {
        free_block(disk, block)?;
    }
    write_inode(disk, ino, &Inode::free())?;
    disk.superblock_mut().free_inodes += 1;
    debug!(
        target: "simfs::inode",
        ino = ino.0,
        released = released.len(),
        "freed inode"
    );
    Ok(released)
}

// ── Block-pointer logic ─────────────────────────────────────────────────────

/// Append a data block to `inode`, filling direct slots first and spilling
/// into the single indirect block afterwards.
///
/// Allocates the indirect block on first overflow; the allocation is owned
/// by this inode. Returns the freshly allocated indirect block, if any, so
/// callers can record its ownership. The caller persists the mutated inode.
pub fn append_block(
    disk: &mut VirtualDisk,
    inode: &mut Inode,
    block: BlockNo,
) -> Result<Option<BlockNo>> {
    let layout = *disk.layout();

    for slot in &mut inode.direct {
        if layout.data_block_ref(*slot).is_none() {
            *slot = block.0;
            inode.block_count += 1;
            return Ok(None);
        }
    }

    let (indirect, created) = match layout.data_block_ref(inode.indirect) {
        Some(existing) => (existing, None),
        None => {
            let fresh = simfs_alloc::fast_alloc(disk)?;
            inode.indirect = fresh.0;
            trace!(
                target: "simfs::inode",
                ino = inode.inode_no,
                block = fresh.0,
                "allocated indirect block"
            );
            (fresh, Some(fresh))
        }
    };

    // Freed and freshly formatted blocks are zero-filled, so every unused
    // slot in the indirect array reads as the 0 sentinel.
    let mut data = disk.read_block(indirect)?;
    let mut placed = false;
    for i in 0..REFS_PER_INDIRECT {
        let at = i * 4;
        let raw = u32::from_le_bytes([data[at], data[at + 1], data[at + 2], data[at + 3]]);
        if layout.data_block_ref(raw).is_none() {
            data[at..at + 4].copy_from_slice(&block.0.to_le_bytes());
            placed = true;
            break;
        }
    }
    if !placed {
        return Err(SimfsError::OutOfSpace);
    }
    disk.write_block(indirect, &data)?;
    inode.block_count += 1;
    Ok(created)
}

/// Every data block referenced by `inode`, in logical order: valid direct
/// slots first, then valid indirect entries.
///
/// Sentinel and out-of-range entries are holes left by zero-initialized
/// records; they are skipped, never errors. The indirect block itself is not
/// included.
pub fn list_blocks(disk: &VirtualDisk, inode: &Inode) -> Result<Vec<BlockNo>> {
    let layout = disk.layout();
    let mut blocks: Vec<BlockNo> = inode
        .direct
        .iter()
        .filter_map(|&raw| layout.data_block_ref(raw))
        .collect();

    if let Some(indirect) = layout.data_block_ref(inode.indirect) {
        let data = disk.read_block(indirect)?;
        for i in 0..REFS_PER_INDIRECT {
            let at = i * 4;
            let raw = u32::from_le_bytes([data[at], data[at + 1], data[at + 2], data[at + 3]]);
            if let Some(block) = layout.data_block_ref(raw) {
                blocks.push(block);
            }
        }
    }
    Ok(blocks)
}

#[cfg(test)]
mod tests {
    use super::*;
    use simfs_alloc::fast_alloc;
    use tempfile::NamedTempFile;

    const TEST_BYTES: u64 = 8 * 1024 * 1024;
    const NOW: i64 = 1_700_000_000;

    fn scratch() -> (NamedTempFile, VirtualDisk) {
        let file = NamedTempFile::new().expect("temp image");
        let disk = VirtualDisk::create(file.path(), TEST_BYTES).expect("create");
        (file, disk)
    }

    #[test]
    fn codec_round_trip() {
        let mut inode = Inode::new(InodeNo(7), FileKind::File, FILE_MODE, NOW);
        inode.size = 12345;
        inode.block_count = 4;
        inode.direct[0] = 200;
        inode.direct[11] = 311;
        inode.indirect = 400;
        let decoded = Inode::decode(&inode.encode()).unwrap();
        assert_eq!(decoded, inode);
    }

    #[test]
    fn zeroed_record_decodes_as_free() {
        let inode = Inode::decode(&vec![0u8; INODE_SIZE as usize]).unwrap();
        assert!(!inode.is_valid());
        assert_eq!(inode, Inode::free());
    }

    #[test]
    fn locate_inode_math() {
        let layout = *scratch().1.layout();
        let per_block = BLOCK_SIZE / INODE_SIZE; // 32
        let (block, offset) = locate_inode(&layout, InodeNo(0));
        assert_eq!(block, BlockNo(layout.inode_table_start));
        assert_eq!(offset, 0);
        let (block, offset) = locate_inode(&layout, InodeNo(per_block + 1));
        assert_eq!(block, BlockNo(layout.inode_table_start + 1));
        assert_eq!(offset, INODE_SIZE as usize);
    }

    #[test]
    fn allocate_write_read_round_trip() {
        let (_file, mut disk) = scratch();
        let free_inodes = disk.superblock().free_inodes;
        let (ino, inode) = allocate_inode(&mut disk, FileKind::File, FILE_MODE, NOW).unwrap();
        assert_eq!(ino, InodeNo(0));
        assert_eq!(inode.link_count, 1);
        assert_eq!(disk.superblock().free_inodes, free_inodes - 1);

        let read_back = read_inode(&disk, ino).unwrap();
        assert_eq!(read_back, inode);

        let (ino2, dir) = allocate_inode(&mut disk, FileKind::Dir, DIR_MODE, NOW).unwrap();
        assert_eq!(ino2, InodeNo(1));
        assert_eq!(dir.link_count, 2);
    }

    #[test]
    fn fresh_inode_lists_no_blocks() {
        let (_file, mut disk) = scratch();
        let (_, inode) = allocate_inode(&mut disk, FileKind::File, FILE_MODE, NOW).unwrap();
        assert_eq!(list_blocks(&disk, &inode).unwrap(), vec![]);
    }

    #[test]
    fn list_blocks_skips_stale_references() {
        let (_file, mut disk) = scratch();
        let (_, mut inode) = allocate_inode(&mut disk, FileKind::File, FILE_MODE, NOW).unwrap();
        let good = fast_alloc(&mut disk).unwrap();
        inode.direct[0] = u32::MAX; // all-ones sentinel
        inode.direct[1] = 3; // system region
        inode.direct[2] = good.0;
        inode.direct[3] = disk.total_blocks() + 10; // out of range
        assert_eq!(list_blocks(&disk, &inode).unwrap(), vec![good]);
    }

    #[test]
    fn append_fills_direct_then_indirect() {
        let (_file, mut disk) = scratch();
        let (ino, mut inode) = allocate_inode(&mut disk, FileKind::File, FILE_MODE, NOW).unwrap();

        let mut appended = Vec::new();
        let mut indirect_created = None;
        for i in 0..13 {
            let blk = fast_alloc(&mut disk).unwrap();
            let created = append_block(&mut disk, &mut inode, blk).unwrap();
            if created.is_some() {
                assert_eq!(i, 12, "indirect must appear on the 13th append");
                indirect_created = created;
            }
            appended.push(blk);
        }
        write_inode(&mut disk, ino, &inode).unwrap();

        assert_eq!(inode.block_count, 13);
        let indirect = indirect_created.expect("indirect block allocated");
        assert_eq!(BlockNo(inode.indirect), indirect);
        assert_eq!(list_blocks(&disk, &inode).unwrap(), appended);
    }

    #[test]
    fn free_inode_releases_all_blocks_including_indirect() {
        let (_file, mut disk) = scratch();
        let (ino, mut inode) = allocate_inode(&mut disk, FileKind::File, FILE_MODE, NOW).unwrap();
        for _ in 0..13 {
            let blk = fast_alloc(&mut disk).unwrap();
            append_block(&mut disk, &mut inode, blk).unwrap();
        }
        write_inode(&mut disk, ino, &inode).unwrap();
        let free_before = disk.free_blocks();

        let released = free_inode(&mut disk, ino).unwrap();
        // 13 data blocks plus the indirect block itself.
        assert_eq!(released.len(), 14);
        assert_eq!(disk.free_blocks(), free_before + 14);
        assert!(!read_inode(&disk, ino).unwrap().is_valid());
        assert_eq!(disk.superblock().free_inodes, disk.layout().inode_count);
    }
}
