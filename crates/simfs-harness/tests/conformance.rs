#![forbid(unsafe_code)]
//! End-to-end scenarios against the reference 100 MiB configuration.

use simfs::{defrag, repair, SimfsError};
use simfs_harness::{check_invariants, pattern, used_data_blocks, TestVolume};
use simfs_inode::list_blocks;
use simfs_types::BlockNo;
use std::collections::BTreeMap;

const BLOCK: usize = 4096;

#[test]
fn basic_roundtrip() {
    let mut vol = TestVolume::create_default();
    vol.fs.create_file("/a").unwrap();
    let baseline = vol.fs.free_blocks().unwrap();

    let payload = vec![0xAA; 2 * BLOCK];
    vol.fs.write_file("/a", &payload).unwrap();

    assert_eq!(vol.fs.read_file("/a").unwrap(), payload);
    let stat = vol.fs.stat("/a").unwrap();
    assert_eq!(stat.size as usize, 2 * BLOCK);
    assert_eq!(stat.block_count, 2);
    assert_eq!(vol.fs.free_blocks().unwrap(), baseline - 2);
    check_invariants(&vol.fs);
}

#[test]
fn overwrite_shrinks() {
    let mut vol = TestVolume::create_default();
    vol.fs.create_file("/a").unwrap();
    vol.fs.write_file("/a", &vec![0xAA; 2 * BLOCK]).unwrap();
    let after_first = vol.fs.free_blocks().unwrap();

    vol.fs.write_file("/a", &vec![0xBB; 100]).unwrap();
    let stat = vol.fs.stat("/a").unwrap();
    assert_eq!(stat.size, 100);
    assert_eq!(stat.block_count, 1);
    assert_eq!(vol.fs.free_blocks().unwrap(), after_first + 1);
    assert_eq!(vol.fs.read_file("/a").unwrap(), vec![0xBB; 100]);
    check_invariants(&vol.fs);
}

#[test]
fn indirect_expansion() {
    let mut vol = TestVolume::create_default();
    vol.fs.create_file("/big").unwrap();
    let baseline = vol.fs.free_blocks().unwrap();

    let payload = pattern(3, 13 * BLOCK);
    vol.fs.write_file("/big", &payload).unwrap();

    let stat = vol.fs.stat("/big").unwrap();
    assert_eq!(stat.block_count, 13);
    let layout = *vol.fs.disk().unwrap().layout();
    assert!(
        layout.data_block_ref(stat.indirect).is_some(),
        "indirect pointer must be live, got {}",
        stat.indirect
    );
    assert_eq!(vol.fs.read_file("/big").unwrap(), payload);
    // 13 data blocks plus the indirect block itself.
    assert_eq!(vol.fs.free_blocks().unwrap(), baseline - 14);
    check_invariants(&vol.fs);
}

#[test]
fn defragment_contracts() {
    let mut vol = TestVolume::create_default();

    // 20 files with interleaved sizes, then delete every other one.
    for i in 0..20u8 {
        let path = format!("/f{i}");
        vol.fs.create_file(&path).unwrap();
        vol.fs
            .write_file(&path, &pattern(i, (1 + i as usize % 3) * BLOCK))
            .unwrap();
    }
    for i in (0..20u8).step_by(2) {
        vol.fs.delete_file(&format!("/f{i}")).unwrap();
    }

    let survivors: BTreeMap<String, Vec<u8>> = (0..20u8)
        .filter(|i| i % 2 == 1)
        .map(|i| {
            let path = format!("/f{i}");
            let data = vol.fs.read_file(&path).unwrap();
            (path, data)
        })
        .collect();

    defrag::defragment(&mut vol.fs, None).unwrap();

    for (path, expected) in &survivors {
        assert_eq!(&vol.fs.read_file(path).unwrap(), expected, "{path}");
        let stat = vol.fs.stat(path).unwrap();
        let disk = vol.fs.disk().unwrap();
        let mut blocks = list_blocks(disk, &stat).unwrap();
        blocks.sort_unstable();
        assert_eq!(simfs::count_fragments(&blocks), 1, "{path} fragmented");
    }

    // Used data blocks form a contiguous range at the start of the region.
    let used = used_data_blocks(&vol.fs);
    let data_start = vol.fs.disk().unwrap().layout().data_start;
    let expected: Vec<BlockNo> = (data_start..data_start + used.len() as u32)
        .map(BlockNo)
        .collect();
    assert_eq!(used, expected);
    check_invariants(&vol.fs);
}

#[test]
fn crash_and_recover() {
    let mut vol = TestVolume::create_default();
    let mut payloads = BTreeMap::new();
    for i in 0..5u8 {
        let path = format!("/f{i}");
        let data = pattern(i, BLOCK);
        vol.fs.create_file(&path).unwrap();
        vol.fs.write_file(&path, &data).unwrap();
        payloads.insert(path, data);
    }

    let crash = repair::simulate_crash(&mut vol.fs).unwrap();
    assert!(vol.fs.has_corruption());
    // The most-recently-written file is the victim.
    assert_eq!(crash.target.0, vol.fs.stat("/f4").unwrap().inode_no);

    assert!(matches!(
        vol.fs.write_file("/x", b"rejected"),
        Err(SimfsError::Corrupted)
    ));

    repair::run_recovery(&mut vol.fs).unwrap();
    assert!(!vol.fs.has_corruption());

    let names: Vec<String> = vol
        .fs
        .list_dir("/")
        .unwrap()
        .into_iter()
        .map(|e| e.name)
        .collect();
    assert!(!names.contains(&"f4".to_owned()));
    for i in 0..4u8 {
        let path = format!("/f{i}");
        assert_eq!(&vol.fs.read_file(&path).unwrap(), &payloads[&path]);
    }
    for block in crash.corrupted_blocks {
        assert!(vol.fs.disk().unwrap().is_block_free(block));
        assert_eq!(vol.fs.block_owner(block).unwrap(), None);
    }
    check_invariants(&vol.fs);
}

#[test]
fn sentinel_safety_for_empty_files() {
    let mut vol = TestVolume::create_default();
    let baseline = vol.fs.free_blocks().unwrap();

    vol.fs.create_file("/empty").unwrap();
    assert_eq!(vol.fs.read_file("/empty").unwrap(), Vec::<u8>::new());

    // Compaction skips zero-size files entirely.
    let report = defrag::defragment(&mut vol.fs, None).unwrap();
    assert_eq!(report.files_compacted, 0);
    assert_eq!(vol.fs.stat("/empty").unwrap().block_count, 0);

    vol.fs.delete_file("/empty").unwrap();
    assert_eq!(vol.fs.free_blocks().unwrap(), baseline);
    check_invariants(&vol.fs);
}

#[test]
fn fragmentation_score_drops_to_zero_after_defrag() {
    let mut vol = TestVolume::create_default();
    for i in 0..12u8 {
        let path = format!("/f{i}");
        vol.fs.create_file(&path).unwrap();
        vol.fs
            .write_file(&path, &pattern(i, (1 + i as usize % 2) * BLOCK))
            .unwrap();
    }
    for i in (0..12u8).step_by(2) {
        vol.fs.delete_file(&format!("/f{i}")).unwrap();
    }
    // Rewrite the survivors larger so they scatter across the holes.
    for i in (1..12u8).step_by(2) {
        let path = format!("/f{i}");
        vol.fs.write_file(&path, &pattern(i, 4 * BLOCK)).unwrap();
    }

    let before = vol.fs.fragmentation_score().unwrap();
    assert!(before > 0.0, "setup failed to fragment (score {before})");
    defrag::defragment(&mut vol.fs, None).unwrap();
    assert_eq!(vol.fs.fragmentation_score().unwrap(), 0.0);
}
