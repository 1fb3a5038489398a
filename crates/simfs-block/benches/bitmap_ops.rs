use criterion::{black_box, criterion_group, criterion_main, Criterion};
use simfs_block::{bitmap_clear, bitmap_count_set, bitmap_find_set, bitmap_set};

fn bench_bitmap_ops(c: &mut Criterion) {
    // A 100 MiB volume has 25600 blocks = 3200 bitmap bytes.
    let mut bitmap = vec![0u8; 3200];
    let count = 25600u32;
    for idx in (0..count).step_by(3) {
        bitmap_set(&mut bitmap, idx);
    }

    c.bench_function("bitmap_count_set_25k", |b| {
        b.iter(|| bitmap_count_set(black_box(&bitmap), black_box(count)));
    });

    c.bench_function("bitmap_find_set_from_mid", |b| {
        b.iter(|| bitmap_find_set(black_box(&bitmap), black_box(count), black_box(count / 2)));
    });

    c.bench_function("bitmap_set_clear_cycle", |b| {
        b.iter(|| {
            bitmap_set(black_box(&mut bitmap), black_box(12345));
            bitmap_clear(black_box(&mut bitmap), black_box(12345));
        });
    });
}

criterion_group!(benches, bench_bitmap_ops);
criterion_main!(benches);
