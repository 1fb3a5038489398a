#![forbid(unsafe_code)]
//! Property tests for the volume-wide invariants.

use proptest::prelude::*;
use simfs::{defrag, repair, Filesystem, SimfsError};
use simfs_harness::{check_invariants, pattern, used_data_blocks, TestVolume};
use simfs_inode::list_blocks;
use simfs_types::BlockNo;

/// A small volume keeps each generated case fast.
const SMALL: u64 = 8 * 1024 * 1024;

#[derive(Debug, Clone)]
enum Op {
    Write { slot: u8, size: usize },
    Delete { slot: u8 },
    Defragment,
}

fn op_strategy() -> impl Strategy<Value = Op> {
    prop_oneof![
        4 => (0u8..6, 0usize..60_000).prop_map(|(slot, size)| Op::Write { slot, size }),
        2 => (0u8..6).prop_map(|slot| Op::Delete { slot }),
        1 => Just(Op::Defragment),
    ]
}

fn apply(fs: &mut Filesystem, op: &Op) {
    match op {
        Op::Write { slot, size } => {
            let path = format!("/p{slot}");
            if !fs.file_exists(&path) {
                fs.create_file(&path).unwrap();
            }
            fs.write_file(&path, &pattern(*slot, *size)).unwrap();
        }
        Op::Delete { slot } => {
            let path = format!("/p{slot}");
            match fs.delete_file(&path) {
                Ok(()) | Err(SimfsError::NotFound(_)) => {}
                Err(other) => panic!("delete failed: {other}"),
            }
        }
        Op::Defragment => {
            defrag::defragment(fs, None).unwrap();
        }
    }
}

proptest! {
    #![proptest_config(ProptestConfig {
        cases: 12,
        .. ProptestConfig::default()
    })]

    // P1-P4: any sequence of facade calls preserves the counters, the
    // no-double-allocation rule, size consistency, and block ownership.
    #[test]
    fn invariants_hold_after_any_op_sequence(
        ops in proptest::collection::vec(op_strategy(), 1..14),
    ) {
        let mut vol = TestVolume::create(SMALL);
        for op in &ops {
            apply(&mut vol.fs, op);
        }
        check_invariants(&vol.fs);
    }

    // P5: compaction packs the data region without changing file contents.
    #[test]
    fn compaction_preserves_content_and_packs(
        sizes in proptest::collection::vec(0usize..40_000, 1..8),
        delete_mask in any::<u8>(),
    ) {
        let mut vol = TestVolume::create(SMALL);
        for (i, size) in sizes.iter().enumerate() {
            let path = format!("/p{i}");
            vol.fs.create_file(&path).unwrap();
            vol.fs.write_file(&path, &pattern(i as u8, *size)).unwrap();
        }
        for (i, _) in sizes.iter().enumerate() {
            if delete_mask & (1 << (i % 8)) != 0 {
                vol.fs.delete_file(&format!("/p{i}")).unwrap();
            }
        }
        let survivors: Vec<(String, Vec<u8>)> = (0..sizes.len())
            .filter(|i| delete_mask & (1 << (i % 8)) == 0)
            .map(|i| {
                let path = format!("/p{i}");
                let data = vol.fs.read_file(&path).unwrap();
                (path, data)
            })
            .collect();

        defrag::defragment(&mut vol.fs, None).unwrap();

        for (path, expected) in &survivors {
            prop_assert_eq!(&vol.fs.read_file(path).unwrap(), expected);
            let stat = vol.fs.stat(path).unwrap();
            if stat.block_count > 0 {
                let disk = vol.fs.disk().unwrap();
                let mut blocks = list_blocks(disk, &stat).unwrap();
                blocks.sort_unstable();
                prop_assert_eq!(simfs::count_fragments(&blocks), 1);
            }
        }
        let used = used_data_blocks(&vol.fs);
        let data_start = vol.fs.disk().unwrap().layout().data_start;
        let expected: Vec<BlockNo> =
            (data_start..data_start + used.len() as u32).map(BlockNo).collect();
        prop_assert_eq!(used, expected);
        check_invariants(&vol.fs);
    }

    // P6: a crash followed by recovery leaves no trace of the corrupted set.
    #[test]
    fn recovery_restores_invariants(
        count in 1usize..6,
        during_write in any::<bool>(),
        fraction in 0.1f64..1.0,
    ) {
        let mut vol = TestVolume::create(SMALL);
        for i in 0..count {
            let path = format!("/p{i}");
            vol.fs.create_file(&path).unwrap();
            vol.fs.write_file(&path, &pattern(i as u8, 4096 * (1 + i % 3))).unwrap();
        }

        let crash = if during_write {
            repair::simulate_crash_during_write(
                &mut vol.fs,
                "/victim",
                &pattern(0xC0, 6 * 4096),
                fraction,
            ).unwrap()
        } else {
            repair::simulate_crash(&mut vol.fs).unwrap()
        };
        prop_assert!(vol.fs.has_corruption());

        repair::run_recovery(&mut vol.fs).unwrap();
        prop_assert!(!vol.fs.has_corruption());
        for block in &crash.corrupted_blocks {
            prop_assert!(vol.fs.disk().unwrap().is_block_free(*block));
            prop_assert_eq!(vol.fs.block_owner(*block).unwrap(), None);
        }
        check_invariants(&vol.fs);
    }

    // P7: everything survives an unmount/mount cycle unchanged.
    #[test]
    fn persistence_round_trip(
        sizes in proptest::collection::vec(0usize..30_000, 1..6),
    ) {
        let mut vol = TestVolume::create(SMALL);
        let mut expected = Vec::new();
        for (i, size) in sizes.iter().enumerate() {
            let path = format!("/p{i}");
            vol.fs.create_file(&path).unwrap();
            vol.fs.write_file(&path, &pattern(i as u8, *size)).unwrap();
            let stat = vol.fs.stat(&path).unwrap();
            expected.push((path.clone(), vol.fs.read_file(&path).unwrap(), stat.size, stat.block_count));
        }
        let listing_before: Vec<String> =
            vol.fs.list_dir("/").unwrap().into_iter().map(|e| e.name).collect();

        vol.fs.unmount().unwrap();
        let report = vol.fs.mount().unwrap();
        prop_assert!(report.was_clean);

        let listing_after: Vec<String> =
            vol.fs.list_dir("/").unwrap().into_iter().map(|e| e.name).collect();
        prop_assert_eq!(listing_before, listing_after);
        for (path, data, size, block_count) in &expected {
            prop_assert_eq!(&vol.fs.read_file(path).unwrap(), data);
            let stat = vol.fs.stat(path).unwrap();
            prop_assert_eq!(stat.size, *size);
            prop_assert_eq!(stat.block_count, *block_count);
        }
        check_invariants(&vol.fs);
    }
}

// P8: a freshly allocated inode is all sentinels and traverses as empty.
#[test]
fn fresh_inode_tolerates_sentinels() {
    let mut vol = TestVolume::create(SMALL);
    vol.fs.create_file("/empty").unwrap();
    let stat = vol.fs.stat("/empty").unwrap();
    let disk = vol.fs.disk().unwrap();
    assert_eq!(list_blocks(disk, &stat).unwrap(), vec![]);
    assert_eq!(vol.fs.read_file("/empty").unwrap(), Vec::<u8>::new());
}
