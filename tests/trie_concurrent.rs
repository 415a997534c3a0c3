#![cfg(feature = "threaded")]

use std::sync::atomic::{AtomicBool, Ordering};

use cowtrie::Trie;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rayon::prelude::*;

fn key(i: u64) -> Vec<u8> {
    format!("key{i:06}").into_bytes()
}

/// One writer churns inserts and erases while readers probe; every read
/// must be linearizable to some point in the writer's history, and the
/// final state must be exactly what the writer produced.
#[test]
fn readers_race_one_writer() {
    const PREPOPULATED: u64 = 1_000;
    const INSERTED: u64 = 10_000;
    const ERASED: u64 = 5_000;
    const READERS: usize = 4;

    let trie: Trie<u64> = Trie::new();
    for i in 0..PREPOPULATED {
        assert!(trie.insert(&key(i), i));
    }

    let done = AtomicBool::new(false);
    std::thread::scope(|scope| {
        for reader in 0..READERS {
            let trie = &trie;
            let done = &done;
            scope.spawn(move || {
                let mut rng = StdRng::seed_from_u64(0xC0FFEE ^ reader as u64);
                while !done.load(Ordering::Relaxed) {
                    let i = rng.gen_range(0..PREPOPULATED + INSERTED);
                    match trie.get(&key(i)) {
                        // A value, when seen, is always the one the writer
                        // bound to this key.
                        Some(value) => assert_eq!(value, i),
                        None => assert!(i >= PREPOPULATED),
                    }
                }
            });
        }

        let trie = &trie;
        scope.spawn(|| {
            for i in PREPOPULATED..PREPOPULATED + INSERTED {
                assert!(trie.insert(&key(i), i));
            }
            for i in PREPOPULATED..PREPOPULATED + ERASED {
                assert!(trie.erase(&key(i)));
            }
            done.store(true, Ordering::Relaxed);
        });
    });

    assert_eq!(trie.len() as u64, PREPOPULATED + INSERTED - ERASED);
    trie.debug_check_invariants();

    (0..PREPOPULATED + INSERTED).into_par_iter().for_each(|i| {
        let expected = if (PREPOPULATED..PREPOPULATED + ERASED).contains(&i) {
            None
        } else {
            Some(i)
        };
        assert_eq!(trie.get(&key(i)), expected, "key {i}");
    });
}

/// Ordered iteration under concurrent mutation yields strictly ascending
/// keys, each bound to a value the writer actually stored.
#[test]
fn iteration_stays_sorted_under_churn() {
    let trie: Trie<u64> = Trie::new();
    for i in 0..2_000 {
        trie.insert(&key(i * 2), i * 2);
    }

    let done = AtomicBool::new(false);
    std::thread::scope(|scope| {
        let t = &trie;
        let done_ref = &done;
        scope.spawn(move || {
            let mut rng = StdRng::seed_from_u64(42);
            for _ in 0..20_000 {
                let i = rng.gen_range(0..4_000u64);
                if i % 2 == 1 {
                    // Odd keys come and go.
                    if !t.insert(&key(i), i) {
                        t.erase(&key(i));
                    }
                } else {
                    t.contains(&key(i));
                }
            }
            done_ref.store(true, Ordering::Relaxed);
        });

        for reader in 0..3usize {
            let t = &trie;
            let done_ref = &done;
            scope.spawn(move || {
                let _ = reader;
                while !done_ref.load(Ordering::Relaxed) {
                    let mut prev: Option<Vec<u8>> = None;
                    for (k, v) in t.iter() {
                        if let Some(prev) = &prev {
                            assert!(*prev < k, "iteration went backwards");
                        }
                        let i: u64 = std::str::from_utf8(&k.clone()[3..])
                            .unwrap()
                            .parse()
                            .unwrap();
                        assert_eq!(v, i);
                        prev = Some(k);
                    }
                }
            });
        }
    });

    // Even keys were never touched by the churn.
    for i in 0..2_000 {
        assert_eq!(trie.get(&key(i * 2)), Some(i * 2));
    }
    trie.debug_check_invariants();
}

/// Cloned-out values must never be torn: a reader either sees a whole
/// previously stored value or none at all.
#[test]
fn value_snapshots_are_never_torn() {
    let trie: Trie<(u64, u64)> = Trie::new();
    let universe: Vec<Vec<u8>> = (0..64u64).map(key).collect();

    let done = AtomicBool::new(false);
    std::thread::scope(|scope| {
        let t = &trie;
        let done_ref = &done;
        scope.spawn(move || {
            for round in 0..30_000u64 {
                let k = &universe[(round % 64) as usize];
                if !t.insert(k, (round, round.wrapping_mul(31))) {
                    t.erase(k);
                    t.insert(k, (round, round.wrapping_mul(31)));
                }
            }
            done_ref.store(true, Ordering::Relaxed);
        });

        for reader in 0..4u64 {
            let t = &trie;
            let done_ref = &done;
            scope.spawn(move || {
                let mut rng = StdRng::seed_from_u64(reader);
                while !done_ref.load(Ordering::Relaxed) {
                    let k = key(rng.gen_range(0..64));
                    if let Some((a, b)) = t.get(&k) {
                        assert_eq!(b, a.wrapping_mul(31), "torn value snapshot");
                    }
                }
            });
        }
    });
    trie.debug_check_invariants();
}
