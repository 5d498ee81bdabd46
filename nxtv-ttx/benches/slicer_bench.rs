use criterion::{criterion_group, criterion_main, Criterion};
use std::hint::black_box;

use nxtv_ttx::hamming::{ham84, unham84_pair};
use nxtv_ttx::slicer::{slice_teletext, FPSHIFT, VBI_LINE_SAMPLES, VTSTEP};

fn make_line(bytes: &[u8]) -> Vec<u8> {
    let mut line = vec![0u8; VBI_LINE_SAMPLES];
    let start = 160usize;
    for (byte_idx, &b) in bytes.iter().enumerate() {
        for j in 0..8u64 {
            if (b >> j) & 1 == 1 {
                let cell = byte_idx as u64 * 8 + j;
                let lo = start + ((cell * VTSTEP) >> FPSHIFT) as usize;
                let hi = start + (((cell + 1) * VTSTEP) >> FPSHIFT) as usize;
                for sample in &mut line[lo..hi] {
                    *sample = 0xFF;
                }
            }
        }
    }
    line
}

fn bench_slice_teletext(c: &mut Criterion) {
    let mut bytes = vec![0x55u8, 0x55, 0x27];
    bytes.extend((0..42).map(|i| (i as u8).wrapping_mul(73)));
    let line = make_line(&bytes);

    c.bench_function("slice_teletext_clean", |b| {
        b.iter(|| black_box(slice_teletext(black_box(&line))))
    });

    let flat = vec![0x40u8; VBI_LINE_SAMPLES];
    c.bench_function("slice_teletext_no_signal", |b| {
        b.iter(|| black_box(slice_teletext(black_box(&flat))))
    });
}

fn bench_unham84(c: &mut Criterion) {
    let pairs: Vec<u8> = (0..40).map(|i| ham84(i & 0x0F)).collect();
    c.bench_function("unham84_pair_x20", |b| {
        b.iter(|| {
            for chunk in black_box(&pairs).chunks_exact(2) {
                black_box(unham84_pair(chunk[0], chunk[1]));
            }
        })
    });
}

criterion_group!(benches, bench_slice_teletext, bench_unham84);
criterion_main!(benches);
