use criterion::{black_box, criterion_group, criterion_main, Criterion, Throughput};

use chacha20::cipher::{Iv, KeyIvInit, StreamCipher};
use chacha20::{ChaCha8, Key};

use diskplot::bits::BitReader;
use diskplot::plot::sort::{radix_sort_entries, SortEntry};

const K: u32 = 32;
const CHUNK_ENTRIES: usize = 1 << 16;

/// Keystream generation plus candidate extraction for one F1 chunk slice.
fn bench_candidate_extraction(c: &mut Criterion) {
    let mut group = c.benchmark_group("f1");
    group.throughput(Throughput::Elements(CHUNK_ENTRIES as u64));

    let key = Key::from([1u8; 32]);
    let iv = Iv::<ChaCha8>::default();
    let mut keystream = vec![0u8; CHUNK_ENTRIES * K as usize / 8];

    group.bench_function("candidate_extraction_64k", |b| {
        b.iter(|| {
            keystream.fill(0);
            let mut cipher = ChaCha8::new(&key, &iv);
            cipher.apply_keystream(&mut keystream);
            let mut reader = BitReader::new(&keystream);
            let mut histogram = [0u64; 64];
            for _ in 0..CHUNK_ENTRIES {
                let candidate = reader.read(K);
                histogram[(candidate >> (K - 6)) as usize] += 1;
            }
            black_box(histogram);
        })
    });
    group.finish();
}

/// Radix sort of one bucket's worth of entries.
fn bench_bucket_sort(c: &mut Criterion) {
    let mut group = c.benchmark_group("sort");
    group.throughput(Throughput::Elements(CHUNK_ENTRIES as u64));

    let mut state = 0x9E37_79B9_7F4A_7C15u64;
    let entries: Vec<SortEntry> = (0..CHUNK_ENTRIES)
        .map(|_| {
            state = state
                .wrapping_mul(6364136223846793005)
                .wrapping_add(1442695040888963407);
            SortEntry {
                y: state >> 26,
                meta: u128::from(state),
            }
        })
        .collect();

    group.bench_function("radix_sort_64k", |b| {
        let mut scratch = Vec::new();
        b.iter(|| {
            let mut input = entries.clone();
            radix_sort_entries(&mut input, &mut scratch, 38);
            black_box(input.first().copied());
        })
    });
    group.finish();
}

criterion_group!(benches, bench_candidate_extraction, bench_bucket_sort);
criterion_main!(benches);
