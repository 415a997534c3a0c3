use std::hint::black_box;

use criterion::{criterion_group, criterion_main, BatchSize, Criterion};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;

use cowtrie::{OrderedKey, Trie};

fn shuffled_keys(n: u64) -> Vec<Vec<u8>> {
    let mut keys: Vec<Vec<u8>> = (0..n).map(|i| format!("bench/{i:08}").into_bytes()).collect();
    keys.shuffle(&mut StdRng::seed_from_u64(0x5EED));
    keys
}

fn bench_fill(c: &mut Criterion) {
    let keys = shuffled_keys(10_000);
    c.bench_function("fill_10k_string_keys", |b| {
        b.iter_batched(
            Trie::<u64>::new,
            |trie| {
                for (i, key) in keys.iter().enumerate() {
                    trie.insert(key, i as u64);
                }
                trie
            },
            BatchSize::LargeInput,
        )
    });
}

fn bench_lookup(c: &mut Criterion) {
    let keys = shuffled_keys(10_000);
    let trie: Trie<u64> = Trie::new();
    for (i, key) in keys.iter().enumerate() {
        trie.insert(key, i as u64);
    }
    c.bench_function("lookup_hit", |b| {
        let mut cursor = 0;
        b.iter(|| {
            cursor = (cursor + 1) % keys.len();
            black_box(trie.get(&keys[cursor]))
        })
    });
    c.bench_function("lookup_miss", |b| {
        b.iter(|| black_box(trie.get(b"bench/absent")))
    });
}

fn bench_fixed_keys(c: &mut Criterion) {
    let trie: Trie<u64, 8> = Trie::new();
    for i in 0..100_000u64 {
        trie.insert(&(i * 7).to_key_bytes(), i);
    }
    c.bench_function("lookup_fixed_u64", |b| {
        let mut i = 0u64;
        b.iter(|| {
            i = (i + 1) % 100_000;
            black_box(trie.get(&(i * 7).to_key_bytes()))
        })
    });
}

fn bench_iterate(c: &mut Criterion) {
    let trie: Trie<u64> = Trie::new();
    for (i, key) in shuffled_keys(10_000).iter().enumerate() {
        trie.insert(key, i as u64);
    }
    c.bench_function("iterate_10k", |b| {
        b.iter(|| black_box(trie.iter().count()))
    });
}

criterion_group!(benches, bench_fill, bench_lookup, bench_fixed_keys, bench_iterate);
criterion_main!(benches);
