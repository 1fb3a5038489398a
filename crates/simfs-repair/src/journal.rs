//! Reserved journal region codec.
//!
//! The journal region is laid out as an array of 256-byte entries but the
//! current recovery contract does not replay them: recovery is driven by the
//! corrupted-block set, and its only journal interaction is discarding
//! uncommitted entries. The codec and scan exist so the on-disk format is
//! defined and a future write-ahead log can take the region over.

use simfs_block::VirtualDisk;
use simfs_error::Result;
use simfs_types::{read_le_i64, read_le_u32, BlockNo, InodeNo, BLOCK_SIZE};

/// Bytes per journal entry slot.
pub const JOURNAL_ENTRY_SIZE: usize = 256;

/// Entry slots per journal block.
pub const ENTRIES_PER_BLOCK: usize = BLOCK_SIZE as usize / JOURNAL_ENTRY_SIZE;

/// Block references one entry can carry.
pub const MAX_ENTRY_BLOCKS: usize = 32;

// On-disk offsets within the 256-byte slot.
const JE_TXN: usize = 0x00;
const JE_OP: usize = 0x04;
const JE_COMMITTED: usize = 0x05;
const JE_TIMESTAMP: usize = 0x08;
const JE_INODE: usize = 0x10;
const JE_PARENT: usize = 0x14;
const JE_BLOCK_COUNT: usize = 0x18;
const JE_BLOCKS: usize = 0x1C;
const JE_NAME_LEN: usize = 0x9C;
const JE_NAME: usize = 0x9D;
const JE_NAME_FIELD: usize = JOURNAL_ENTRY_SIZE - JE_NAME;

/// Operation tag recorded in a journal entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum JournalOp {
    CreateFile = 1,
    DeleteFile = 2,
    WriteData = 3,
    UpdateInode = 4,
    CreateDir = 5,
    DeleteDir = 6,
}

impl JournalOp {
    #[must_use]
    fn from_tag(tag: u8) -> Option<Self> {
        match tag {
            1 => Some(Self::CreateFile),
            2 => Some(Self::DeleteFile),
            3 => Some(Self::WriteData),
            4 => Some(Self::UpdateInode),
            5 => Some(Self::CreateDir),
            6 => Some(Self::DeleteDir),
            _ => None,
        }
    }
}

/// One journal transaction record. Transaction id 0 marks an empty slot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JournalEntry {
    pub txn_id: u32,
    pub op: JournalOp,
    pub committed: bool,
    pub timestamp: i64,
    pub inode: InodeNo,
    pub parent: InodeNo,
    pub blocks: Vec<BlockNo>,
    pub name: String,
}

impl JournalEntry {
    /// Serialize into a 256-byte slot.
    #[must_use]
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = vec![0u8; JOURNAL_ENTRY_SIZE];
        buf[JE_TXN..JE_TXN + 4].copy_from_slice(&self.txn_id.to_le_bytes());
        buf[JE_OP] = self.op as u8;
        buf[JE_COMMITTED] = u8::from(self.committed);
        buf[JE_TIMESTAMP..JE_TIMESTAMP + 8].copy_from_slice(&self.timestamp.to_le_bytes());
        buf[JE_INODE..JE_INODE + 4].copy_from_slice(&self.inode.0.to_le_bytes());
        buf[JE_PARENT..JE_PARENT + 4].copy_from_slice(&self.parent.0.to_le_bytes());
        let count = self.blocks.len().min(MAX_ENTRY_BLOCKS);
        #[allow(clippy::cast_possible_truncation)] // count capped at MAX_ENTRY_BLOCKS
        {
            buf[JE_BLOCK_COUNT..JE_BLOCK_COUNT + 4].copy_from_slice(&(count as u32).to_le_bytes());
        }
        for (i, block) in self.blocks.iter().take(count).enumerate() {
            let at = JE_BLOCKS + i * 4;
            buf[at..at + 4].copy_from_slice(&block.0.to_le_bytes());
        }
        let name_len = self.name.len().min(JE_NAME_FIELD);
        #[allow(clippy::cast_possible_truncation)] // name capped to the field
        {
            buf[JE_NAME_LEN] = name_len as u8;
        }
        buf[JE_NAME..JE_NAME + name_len].copy_from_slice(&self.name.as_bytes()[..name_len]);
        buf
    }

    /// Parse a 256-byte slot; `None` for empty or unrecognized slots.
    pub fn decode(data: &[u8]) -> Result<Option<Self>> {
        simfs_types::ensure_slice(data, 0, JOURNAL_ENTRY_SIZE)?;
        let txn_id = read_le_u32(data, JE_TXN)?;
        if txn_id == 0 {
            return Ok(None);
        }
        let Some(op) = JournalOp::from_tag(data[JE_OP]) else {
            return Ok(None);
        };
        let count = (read_le_u32(data, JE_BLOCK_COUNT)? as usize).min(MAX_ENTRY_BLOCKS);
        let mut blocks = Vec::with_capacity(count);
        for i in 0..count {
            blocks.push(BlockNo(read_le_u32(data, JE_BLOCKS + i * 4)?));
        }
        let name_len = (data[JE_NAME_LEN] as usize).min(JE_NAME_FIELD);
        let name = String::from_utf8_lossy(&data[JE_NAME..JE_NAME + name_len]).into_owned();
        Ok(Some(Self {
            txn_id,
            op,
            committed: data[JE_COMMITTED] == 1,
            timestamp: read_le_i64(data, JE_TIMESTAMP)?,
            inode: InodeNo(read_le_u32(data, JE_INODE)?),
            parent: InodeNo(read_le_u32(data, JE_PARENT)?),
            blocks,
            name,
        }))
    }
}

/// Write an entry into journal slot `index`.
pub fn write_entry(disk: &mut VirtualDisk, index: u32, entry: &JournalEntry) -> Result<()> {
    let layout = *disk.layout();
    let block = BlockNo(layout.journal_start + index / ENTRIES_PER_BLOCK as u32);
    let offset = (index as usize % ENTRIES_PER_BLOCK) * JOURNAL_ENTRY_SIZE;
    let mut data = disk.read_block(block)?;
    data[offset..offset + JOURNAL_ENTRY_SIZE].copy_from_slice(&entry.encode());
    disk.write_block(block, &data)
}

/// All entries recorded as in-progress (not committed).
pub fn scan_uncommitted(disk: &VirtualDisk) -> Result<Vec<JournalEntry>> {
    let layout = *disk.layout();
    let mut entries = Vec::new();
    for b in 0..layout.journal_blocks {
        let data = disk.read_block(BlockNo(layout.journal_start + b))?;
        for slot in 0..ENTRIES_PER_BLOCK {
            let at = slot * JOURNAL_ENTRY_SIZE;
            if let Some(entry) = JournalEntry::decode(&data[at..at + JOURNAL_ENTRY_SIZE])? {
                if !entry.committed {
                    entries.push(entry);
                }
            }
        }
    }
    Ok(entries)
}

/// Zero the whole journal region.
pub fn clear_journal(disk: &mut VirtualDisk) -> Result<()> {
    let layout = *disk.layout();
    for b in 0..layout.journal_blocks {
        disk.zero_block(BlockNo(layout.journal_start + b))?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::NamedTempFile;

    fn scratch() -> (NamedTempFile, VirtualDisk) {
        let file = NamedTempFile::new().expect("temp image");
        let disk = VirtualDisk::create(file.path(), 8 * 1024 * 1024).expect("create");
        (file, disk)
    }

    fn entry(txn: u32, committed: bool) -> JournalEntry {
        JournalEntry {
            txn_id: txn,
            op: JournalOp::WriteData,
            committed,
            timestamp: 1_700_000_000,
            inode: InodeNo(4),
            parent: InodeNo(0),
            blocks: vec![BlockNo(170), BlockNo(171)],
            name: "f.dat".to_owned(),
        }
    }

    #[test]
    fn entry_codec_round_trip() {
        let original = entry(9, false);
        let decoded = JournalEntry::decode(&original.encode()).unwrap();
        assert_eq!(decoded, Some(original));
    }

    #[test]
    fn empty_slot_decodes_as_none() {
        assert_eq!(
            JournalEntry::decode(&vec![0u8; JOURNAL_ENTRY_SIZE]).unwrap(),
            None
        );
    }

    #[test]
    fn fresh_journal_region_scans_empty() {
        let (_file, disk) = scratch();
        assert!(scan_uncommitted(&disk).unwrap().is_empty());
    }

    #[test]
    fn scan_finds_only_uncommitted_entries() {
        let (_file, mut disk) = scratch();
        write_entry(&mut disk, 0, &entry(1, true)).unwrap();
        write_entry(&mut disk, 1, &entry(2, false)).unwrap();
        // A slot in a later journal block.
        write_entry(&mut disk, ENTRIES_PER_BLOCK as u32 + 3, &entry(3, false)).unwrap();

        let found = scan_uncommitted(&disk).unwrap();
        let ids: Vec<_> = found.iter().map(|e| e.txn_id).collect();
        assert_eq!(ids, vec![2, 3]);
    }

    #[test]
    fn clear_journal_discards_everything() {
        let (_file, mut disk) = scratch();
        write_entry(&mut disk, 0, &entry(1, false)).unwrap();
        clear_journal(&mut disk).unwrap();
        assert!(scan_uncommitted(&disk).unwrap().is_empty());
    }
}
