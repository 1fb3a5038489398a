#![forbid(unsafe_code)]
//! Directory operations for SimFS.
//!
//! A directory inode's body is a packed array of fixed 64-byte entries.
//! Entry management rewrites the whole array; shrinking zeroes any body
//! blocks that no longer hold entries so deleted names cannot reappear on a
//! later listing. Path resolution walks `/`-delimited components from the
//! root inode.

use simfs_block::VirtualDisk;
use simfs_error::{Result, SimfsError};
use simfs_inode::{
    allocate_inode, append_block, list_blocks, read_inode, write_inode, Inode, DIR_MODE,
};
use simfs_types::{read_le_u32, FileKind, InodeNo, BLOCK_SIZE, DIR_ENTRY_SIZE, MAX_NAME_LEN};
use tracing::{debug, trace};

/// Entries per directory body block.
pub const ENTRIES_PER_BLOCK: usize = (BLOCK_SIZE / DIR_ENTRY_SIZE) as usize;

// On-disk offsets within the 64-byte entry.
const DE_INODE: usize = 0x00;
const DE_NAME_LEN: usize = 0x04;
const DE_KIND: usize = 0x05;
const DE_NAME: usize = 0x08;
const DE_NAME_FIELD: usize = DIR_ENTRY_SIZE as usize - DE_NAME; // 56 bytes, NUL padded

/// One directory entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirEntry {
    pub inode: InodeNo,
    pub kind: FileKind,
    pub name: String,
}

impl DirEntry {
    pub fn new(inode: InodeNo, name: &str, kind: FileKind) -> Result<Self> {
        if name.len() > MAX_NAME_LEN {
            return Err(SimfsError::NameTooLong(name.to_owned()));
        }
        Ok(Self {
            inode,
            kind,
            name: name.to_owned(),
        })
    }

    /// A slot holds a live entry when it has a name. The inode-zero check
    /// filters stale zeroed slots; the root's own `.`/`..` references are
    /// inode 0 by definition and stay valid.
    #[must_use]
    fn slot_is_live(inode: u32, name: &str) -> bool {
        !name.is_empty() && (inode != 0 || name == "." || name == "..")
    }

    /// Serialize into a 64-byte slot.
    #[must_use]
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = vec![0u8; DIR_ENTRY_SIZE as usize];
        buf[DE_INODE..DE_INODE + 4].copy_from_slice(&self.inode.0.to_le_bytes());
        #[allow(clippy::cast_possible_truncation)] // name capped at MAX_NAME_LEN
        {
            buf[DE_NAME_LEN] = self.name.len() as u8;
        }
        buf[DE_KIND] = self.kind.tag();
        buf[DE_NAME..DE_NAME + self.name.len()].copy_from_slice(self.name.as_bytes());
        buf
    }

    /// Parse a 64-byte slot; `None` for stale or zeroed slots.
    pub fn decode(data: &[u8]) -> Result<Option<Self>> {
        simfs_types::ensure_slice(data, 0, DIR_ENTRY_SIZE as usize)?;
        let inode = read_le_u32(data, DE_INODE)?;
        let name_len = (data[DE_NAME_LEN] as usize).min(DE_NAME_FIELD);
        let name = String::from_utf8_lossy(&data[DE_NAME..DE_NAME + name_len]).into_owned();
        if !Self::slot_is_live(inode, &name) {
            return Ok(None);
        }
        let kind = FileKind::from_tag(data[DE_KIND])?;
        Ok(Some(Self {
            inode: InodeNo(inode),
            kind,
            name,
        }))
    }
}

// ── Path handling ───────────────────────────────────────────────────────────

/// Split a path into its non-empty components.
#[must_use]
pub fn split_path(path: &str) -> Vec<&str> {
    path.split('/').filter(|c| !c.is_empty()).collect()
}

/// Split into parent path and final name: `/a/b` becomes (`/a`, `b`).
#[must_use]
pub fn split_parent(path: &str) -> (&str, &str) {
    match path.rfind('/') {
        Some(0) => ("/", &path[1..]),
        Some(idx) => (&path[..idx], &path[idx + 1..]),
        None => ("/", path),
    }
}

/// Resolve `path` to an inode index.
///
/// Absolute paths walk from the root; relative paths from `start`. Each
/// intermediate component must be a directory.
pub fn resolve_path(disk: &VirtualDisk, path: &str, start: InodeNo) -> Result<InodeNo> {
    if path.is_empty() || path == "/" {
        return Ok(InodeNo::ROOT);
    }
    let mut current = if path.starts_with('/') {
        InodeNo::ROOT
    } else {
        start
    };
    for component in split_path(path) {
        match lookup_entry(disk, current, component)? {
            Some(next) => current = next,
            None => return Err(SimfsError::NotFound(path.to_owned())),
        }
    }
    Ok(current)
}

// ── Entry array I/O ─────────────────────────────────────────────────────────

fn ensure_dir(inode: &Inode) -> Result<()> {
    if inode.kind != FileKind::Dir {
        return Err(SimfsError::NotADirectory(format!(
            "inode {}",
            inode.inode_no
        )));
    }
    Ok(())
}

/// Read the live entries out of a directory inode's body.
pub fn read_entries(disk: &VirtualDisk, dir_inode: &Inode) -> Result<Vec<DirEntry>> {
    ensure_dir(dir_inode)?;
    let mut entries = Vec::new();
    for block in list_blocks(disk, dir_inode)? {
        let data = disk.read_block(block)?;
        for slot in 0..ENTRIES_PER_BLOCK {
            let at = slot * DIR_ENTRY_SIZE as usize;
            if let Some(entry) = DirEntry::decode(&data[at..at + DIR_ENTRY_SIZE as usize])? {
                entries.push(entry);
            }
        }
    }
    Ok(entries)
}

/// Rewrite a directory's body to hold exactly `entries`.
///
/// Grows the body through `append_block` when the packed array needs more
/// blocks. Body blocks past the new length are zeroed in place; they stay
/// allocated to the directory.
pub fn write_entries(
    disk: &mut VirtualDisk,
    dir_ino: InodeNo,
    entries: &[DirEntry],
    now: i64,
) -> Result<()> {
    let mut dir_inode = read_inode(disk, dir_ino)?;
    ensure_dir(&dir_inode)?;

    // A directory keeps at least one body block once created.
    let blocks_needed = entries.len().div_ceil(ENTRIES_PER_BLOCK).max(1);
    let mut blocks = list_blocks(disk, &dir_inode)?;
    while blocks.len() < blocks_needed {
        let fresh = simfs_alloc::fast_alloc(disk)?;
        append_block(disk, &mut dir_inode, fresh)?;
        blocks.push(fresh);
    }

    let mut chunks = entries.chunks(ENTRIES_PER_BLOCK);
    for (idx, &block) in blocks.iter().enumerate() {
        let mut data = vec![0u8; BLOCK_SIZE as usize];
        if idx < blocks_needed {
            if let Some(chunk) = chunks.next() {
                for (slot, entry) in chunk.iter().enumerate() {
                    let at = slot * DIR_ENTRY_SIZE as usize;
                    data[at..at + DIR_ENTRY_SIZE as usize].copy_from_slice(&entry.encode());
                }
            }
        }
        // Blocks past `blocks_needed` get the zero fill, clearing any
        // entries the shrink left behind.
        disk.write_block(block, &data)?;
    }

    #[allow(clippy::cast_possible_truncation)] // entry count bounded by body size
    {
        dir_inode.size = (entries.len() * DIR_ENTRY_SIZE as usize) as u32;
    }
    dir_inode.modified = now;
    write_inode(disk, dir_ino, &dir_inode)
}

// ── Entry management ────────────────────────────────────────────────────────

/// Look up `name` in a directory; `Ok(None)` when absent.
pub fn lookup_entry(disk: &VirtualDisk, dir_ino: InodeNo, name: &str) -> Result<Option<InodeNo>> {
    let dir_inode = read_inode(disk, dir_ino)?;
    let entries = read_entries(disk, &dir_inode)?;
    Ok(entries.iter().find(|e| e.name == name).map(|e| e.inode))
}

/// Append an entry, rejecting duplicate names.
pub fn add_entry(
    disk: &mut VirtualDisk,
    dir_ino: InodeNo,
    name: &str,
    target: InodeNo,
    kind: FileKind,
    now: i64,
) -> Result<()> {
    let dir_inode = read_inode(disk, dir_ino)?;
    let mut entries = read_entries(disk, &dir_inode)?;
    if entries.iter().any(|e| e.name == name) {
        return Err(SimfsError::Exists(name.to_owned()));
    }
    entries.push(DirEntry::new(target, name, kind)?);
    write_entries(disk, dir_ino, &entries, now)?;
    trace!(target: "simfs::dir", dir = dir_ino.0, name, ino = target.0, "add_entry");
    Ok(())
}

/// Remove the entry named `name` and rewrite the body.
pub fn remove_entry(disk: &mut VirtualDisk, dir_ino: InodeNo, name: &str, now: i64) -> Result<()> {
    let dir_inode = read_inode(disk, dir_ino)?;
    let mut entries = read_entries(disk, &dir_inode)?;
    let before = entries.len();
    entries.retain(|e| e.name != name);
    if entries.len() == before {
        return Err(SimfsError::NotFound(name.to_owned()));
    }
    write_entries(disk, dir_ino, &entries, now)?;
    trace!(target: "simfs::dir", dir = dir_ino.0, name, "remove_entry");
    Ok(())
}

/// List a directory by inode index.
pub fn list_directory(disk: &VirtualDisk, dir_ino: InodeNo) -> Result<Vec<DirEntry>> {
    let dir_inode = read_inode(disk, dir_ino)?;
    read_entries(disk, &dir_inode)
}

// ── Directory lifecycle ─────────────────────────────────────────────────────

/// Create a directory named `name` under `parent`: allocate its inode,
/// install `.` and `..`, and link it from the parent.
pub fn create_directory(
    disk: &mut VirtualDisk,
    parent: InodeNo,
    name: &str,
    now: i64,
) -> Result<InodeNo> {
    let (ino, _) = allocate_inode(disk, FileKind::Dir, DIR_MODE, now)?;
    let own = vec![
        DirEntry::new(ino, ".", FileKind::Dir)?,
        DirEntry::new(parent, "..", FileKind::Dir)?,
    ];
    write_entries(disk, ino, &own, now)?;
    add_entry(disk, parent, name, ino, FileKind::Dir, now)?;
    debug!(target: "simfs::dir", parent = parent.0, ino = ino.0, name, "created directory");
    Ok(ino)
}

/// Initialize the root directory at inode 0 on a freshly formatted volume.
///
/// The root's `.` and `..` both reference itself.
pub fn init_root(disk: &mut VirtualDisk, now: i64) -> Result<()> {
    let root = Inode::new(InodeNo::ROOT, FileKind::Dir, DIR_MODE, now);
    write_inode(disk, InodeNo::ROOT, &root)?;
    disk.superblock_mut().free_inodes -= 1;
    let entries = vec![
        DirEntry::new(InodeNo::ROOT, ".", FileKind::Dir)?,
        DirEntry::new(InodeNo::ROOT, "..", FileKind::Dir)?,
    ];
    write_entries(disk, InodeNo::ROOT, &entries, now)?;
    debug!(target: "simfs::dir", "initialized root directory");
    Ok(())
}
