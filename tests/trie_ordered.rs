use std::collections::BTreeMap;

use cowtrie::Trie;
use proptest::prelude::*;

fn entries(trie: &Trie<u32>) -> Vec<(Vec<u8>, u32)> {
    trie.iter().collect()
}

#[test]
fn iteration_is_byte_lexicographic() {
    let trie: Trie<u32> = Trie::new();
    let keys: Vec<&[u8]> = vec![
        b"zebra", b"", b"a", b"aa", b"ab", b"a\xff", b"a\x00", b"b", b"ba",
    ];
    for (i, key) in keys.iter().enumerate() {
        trie.insert(key, i as u32);
    }
    let seen: Vec<Vec<u8>> = trie.iter().map(|(k, _)| k).collect();
    let mut expected: Vec<Vec<u8>> = keys.iter().map(|k| k.to_vec()).collect();
    expected.sort();
    assert_eq!(seen, expected);
}

#[test]
fn next_after_works_for_absent_bounds() {
    let trie: Trie<u32> = Trie::new();
    trie.insert(b"bb", 1);
    trie.insert(b"dd", 2);
    assert_eq!(trie.next_after(b""), Some((b"bb".to_vec(), 1)));
    assert_eq!(trie.next_after(b"a"), Some((b"bb".to_vec(), 1)));
    assert_eq!(trie.next_after(b"bb"), Some((b"dd".to_vec(), 2)));
    assert_eq!(trie.next_after(b"bbb"), Some((b"dd".to_vec(), 2)));
    assert_eq!(trie.next_after(b"cc"), Some((b"dd".to_vec(), 2)));
    assert_eq!(trie.next_after(b"dd"), None);
    assert_eq!(trie.next_after(b"zz"), None);
}

#[test]
fn first_is_the_smallest_key() {
    let trie: Trie<u32> = Trie::new();
    assert_eq!(trie.first(), None);
    trie.insert(b"m", 1);
    assert_eq!(trie.first(), Some((b"m".to_vec(), 1)));
    trie.insert(b"ma", 2);
    trie.insert(b"al", 3);
    assert_eq!(trie.first(), Some((b"al".to_vec(), 3)));
    trie.insert(b"", 4);
    assert_eq!(trie.first(), Some((b"".to_vec(), 4)));
}

proptest! {
    /// Any insertion order produces the same key set and the same ordered
    /// iteration sequence.
    #[test]
    fn insertion_order_is_irrelevant(
        mut pairs in prop::collection::btree_map(
            prop::collection::vec(any::<u8>(), 0..12),
            any::<u32>(),
            0..64,
        ),
        seed in any::<u64>(),
    ) {
        let reference: BTreeMap<Vec<u8>, u32> = std::mem::take(&mut pairs);

        let in_order: Trie<u32> = reference.iter().map(|(k, v)| (k.clone(), *v)).collect();

        // A cheap deterministic shuffle of the same pairs.
        let mut shuffled: Vec<(Vec<u8>, u32)> =
            reference.iter().map(|(k, v)| (k.clone(), *v)).collect();
        let mut state = seed | 1;
        for i in (1..shuffled.len()).rev() {
            state = state.wrapping_mul(6364136223846793005).wrapping_add(1442695040888963407);
            shuffled.swap(i, (state % (i as u64 + 1)) as usize);
        }
        let scrambled: Trie<u32> = shuffled.into_iter().collect();

        let expected: Vec<(Vec<u8>, u32)> =
            reference.iter().map(|(k, v)| (k.clone(), *v)).collect();
        prop_assert_eq!(entries(&in_order), expected.clone());
        prop_assert_eq!(entries(&scrambled), expected);
        in_order.debug_check_invariants();
        scrambled.debug_check_invariants();
    }

    /// Lookups, iteration and erasure agree with a BTreeMap model under a
    /// random operation sequence.
    #[test]
    fn random_ops_agree_with_model(
        ops in prop::collection::vec(
            (prop::collection::vec(any::<u8>(), 0..6), any::<u32>(), any::<bool>()),
            0..200,
        ),
    ) {
        let trie: Trie<u32> = Trie::new();
        let mut model: BTreeMap<Vec<u8>, u32> = BTreeMap::new();

        for (key, value, erase) in ops {
            if erase {
                prop_assert_eq!(trie.erase(&key), model.remove(&key).is_some());
            } else {
                // Insert never overwrites; the first value sticks.
                let fresh = !model.contains_key(&key);
                prop_assert_eq!(trie.insert(&key, value), fresh);
                model.entry(key).or_insert(value);
            }
        }

        prop_assert_eq!(trie.len(), model.len());
        let expected: Vec<(Vec<u8>, u32)> =
            model.iter().map(|(k, v)| (k.clone(), *v)).collect();
        prop_assert_eq!(entries(&trie), expected);
        for (key, value) in &model {
            prop_assert_eq!(trie.get(key), Some(*value));
        }
        trie.debug_check_invariants();
    }
}
