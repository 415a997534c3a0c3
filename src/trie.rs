//! The container shell: root slot, size counter, writer mutex and the
//! reader retry loop.
//!
//! All mutation is serialized by one mutex; readers never block. A read
//! that keeps colliding with in-place mutation windows restarts a bounded
//! number of times and then falls back to an unambiguous walk under the
//! writer mutex.

use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};

use parking_lot::Mutex;

use crate::epoch::{EpochDomain, RetireLists};
use crate::mutate::{self, EraseOutcome, WriteCx};
use crate::navigate::{self, KeyBuf, Scan};
use crate::node::{
    band_ceil, band_floor, free_subtree, with_interior, with_leaf, BranchIndex, ChildSlot,
    IndexSnap, NodePtr, NodeRef,
};

/// Optimistic read attempts before a reader serializes with the writer.
const READ_RETRIES: usize = 7;

/// A concurrent, ordered map from byte strings to values.
///
/// Keys are arbitrary byte sequences; iteration visits them in ascending
/// byte-lexicographic order. When `FIXED_LEN` is non-zero every key must
/// be exactly that long, and the last trie level stores values inline in
/// leaf nodes instead of behind one more pointer hop.
///
/// All operations take `&self`: mutation is serialized internally by a
/// writer mutex while lookups and iteration stay lock-free.
pub struct Trie<V, const FIXED_LEN: usize = 0> {
    root: ChildSlot<V>,
    count: AtomicUsize,
    epochs: EpochDomain,
    writer: Mutex<RetireLists>,
}

unsafe impl<V: Send, const FIXED_LEN: usize> Send for Trie<V, FIXED_LEN> {}
#[cfg(feature = "threaded")]
unsafe impl<V: Send + Sync, const FIXED_LEN: usize> Sync for Trie<V, FIXED_LEN> {}

impl<V, const FIXED_LEN: usize> Trie<V, FIXED_LEN> {
    pub fn new() -> Self {
        Trie {
            root: ChildSlot::null(),
            count: AtomicUsize::new(0),
            epochs: EpochDomain::new(),
            writer: Mutex::new(RetireLists::new()),
        }
    }

    fn check_key(key: &[u8]) {
        if FIXED_LEN > 0 {
            assert_eq!(key.len(), FIXED_LEN, "key length must match FIXED_LEN");
        }
    }

    /// Number of keys currently stored.
    pub fn len(&self) -> usize {
        self.count.load(Ordering::Relaxed)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Whether `key` is present.
    pub fn contains(&self, key: &[u8]) -> bool {
        self.read(|root| navigate::probe(root, key)).is_some()
    }

    /// Removes every key. Readers concurrently walking the old tree keep
    /// doing so safely until their epoch passes.
    pub fn clear(&self) {
        let mut retire = self.writer.lock();
        if let Some(old_root) = self.root.load() {
            self.root.store(None);
            self.count.store(0, Ordering::Relaxed);
            let mut cx = WriteCx {
                domain: &self.epochs,
                retire: &mut retire,
            };
            cx.retire_subtree(old_root);
        }
        retire.collect(&self.epochs);
    }

    fn read<T>(&self, mut walk: impl FnMut(Option<NodePtr<V>>) -> Scan<T>) -> Option<T> {
        for _ in 0..READ_RETRIES {
            let _guard = self.epochs.enter();
            match walk(self.root.load()) {
                Scan::Hit(value) => return Some(value),
                Scan::Miss => return None,
                Scan::Retry => {}
            }
        }
        // Interference kept winning; with the writer mutex held there is
        // no mutation window left to collide with.
        let _writer = self.writer.lock();
        let _guard = self.epochs.enter();
        loop {
            match walk(self.root.load()) {
                Scan::Hit(value) => return Some(value),
                Scan::Miss => return None,
                Scan::Retry => {}
            }
        }
    }

    fn read_entry(
        &self,
        walk: impl Fn(Option<NodePtr<V>>, &mut KeyBuf) -> Scan<V>,
    ) -> Option<(Vec<u8>, V)> {
        let mut buf = KeyBuf::new();
        let value = self.read(|root| {
            buf.clear();
            walk(root, &mut buf)
        })?;
        Some((buf.to_vec(), value))
    }
}

impl<V: Clone, const FIXED_LEN: usize> Trie<V, FIXED_LEN> {
    /// Inserts `key` with `value`. Returns `false` (leaving the stored
    /// value untouched) if the key was already present.
    pub fn insert(&self, key: &[u8], value: V) -> bool {
        Self::check_key(key);
        let mut retire = self.writer.lock();
        let inserted = {
            let mut cx = WriteCx {
                domain: &self.epochs,
                retire: &mut retire,
            };
            mutate::insert(&mut cx, &self.root, key, value, FIXED_LEN > 0)
        };
        if inserted {
            self.count.fetch_add(1, Ordering::Relaxed);
        }
        retire.collect(&self.epochs);
        inserted
    }

    /// Removes `key`. Returns `false` if it was not present.
    pub fn erase(&self, key: &[u8]) -> bool {
        Self::check_key(key);
        let mut retire = self.writer.lock();
        let outcome = {
            let mut cx = WriteCx {
                domain: &self.epochs,
                retire: &mut retire,
            };
            mutate::erase(&mut cx, &self.root, key, FIXED_LEN > 0)
        };
        let removed = !matches!(outcome, EraseOutcome::NotFound);
        if removed {
            self.count.fetch_sub(1, Ordering::Relaxed);
        }
        retire.collect(&self.epochs);
        removed
    }

    /// Returns a snapshot of the value stored under `key`.
    pub fn get(&self, key: &[u8]) -> Option<V> {
        self.read(|root| navigate::lookup(root, key))
    }

    /// Returns an iterator positioned at `key`, or `None` if absent.
    ///
    /// The iterator stays valid even if its current key is erased: the
    /// next step resolves to the smallest surviving key greater than it.
    pub fn find(&self, key: &[u8]) -> Option<Iter<'_, V, FIXED_LEN>> {
        let value = self.get(key)?;
        Some(Iter {
            trie: self,
            state: IterState::Yield(key.to_vec(), value),
        })
    }

    /// The smallest entry, if any.
    pub fn first(&self) -> Option<(Vec<u8>, V)> {
        self.read_entry(|root, buf| navigate::first_entry(root, buf))
    }

    /// The smallest entry with a key strictly greater than `key`. The key
    /// itself does not have to be present.
    pub fn next_after(&self, key: &[u8]) -> Option<(Vec<u8>, V)> {
        self.read_entry(|root, buf| navigate::next_entry(root, key, buf))
    }

    /// Iterates over all entries in ascending byte-lexicographic order.
    ///
    /// Each step snapshots one entry; the sequence is linearizable against
    /// the writer history rather than a point-in-time snapshot of the
    /// whole map.
    pub fn iter(&self) -> Iter<'_, V, FIXED_LEN> {
        Iter {
            trie: self,
            state: IterState::Start,
        }
    }
}

impl<V, const FIXED_LEN: usize> Default for Trie<V, FIXED_LEN> {
    fn default() -> Self {
        Self::new()
    }
}

impl<V, const FIXED_LEN: usize> fmt::Debug for Trie<V, FIXED_LEN> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Trie").field("len", &self.len()).finish()
    }
}

impl<V, const FIXED_LEN: usize> Drop for Trie<V, FIXED_LEN> {
    fn drop(&mut self) {
        if let Some(root) = self.root.load() {
            unsafe { free_subtree(root) };
        }
        self.writer.get_mut().drain_all();
    }
}

impl<K: AsRef<[u8]>, V: Clone, const FIXED_LEN: usize> FromIterator<(K, V)>
    for Trie<V, FIXED_LEN>
{
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        let trie = Trie::new();
        for (key, value) in iter {
            trie.insert(key.as_ref(), value);
        }
        trie
    }
}

impl<K: AsRef<[u8]>, V: Clone, const FIXED_LEN: usize> Extend<(K, V)> for Trie<V, FIXED_LEN> {
    fn extend<I: IntoIterator<Item = (K, V)>>(&mut self, iter: I) {
        for (key, value) in iter {
            self.insert(key.as_ref(), value);
        }
    }
}

impl<'a, V: Clone, const FIXED_LEN: usize> IntoIterator for &'a Trie<V, FIXED_LEN> {
    type Item = (Vec<u8>, V);
    type IntoIter = Iter<'a, V, FIXED_LEN>;

    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}

enum IterState<V> {
    Start,
    /// `find` landed on an element; yield it before stepping.
    Yield(Vec<u8>, V),
    After(Vec<u8>),
    Done,
}

/// Ordered iterator over a [`Trie`].
///
/// Carries the last yielded key and asks the trie for the strict
/// successor on every step, so concurrent (or interleaved) erasure of the
/// cached key never invalidates it.
pub struct Iter<'a, V, const FIXED_LEN: usize = 0> {
    trie: &'a Trie<V, FIXED_LEN>,
    state: IterState<V>,
}

impl<V: Clone, const FIXED_LEN: usize> Iterator for Iter<'_, V, FIXED_LEN> {
    type Item = (Vec<u8>, V);

    fn next(&mut self) -> Option<Self::Item> {
        let step = match std::mem::replace(&mut self.state, IterState::Done) {
            IterState::Start => self.trie.first(),
            IterState::Yield(key, value) => Some((key, value)),
            IterState::After(key) => self.trie.next_after(&key),
            IterState::Done => None,
        };
        match step {
            Some((key, value)) => {
                self.state = IterState::After(key.clone());
                Some((key, value))
            }
            None => None,
        }
    }
}

impl<V: Clone, const FIXED_LEN: usize> std::iter::FusedIterator for Iter<'_, V, FIXED_LEN> {}

// ---------------------------------------------------------------------------
// Diagnostics
// ---------------------------------------------------------------------------

impl<V, const FIXED_LEN: usize> Trie<V, FIXED_LEN> {
    /// Counts reachable nodes per kind: `[skip-leaf, binary, list, pop,
    /// full]`. Takes the writer mutex for a stable tree.
    pub fn debug_shape_histogram(&self) -> [usize; 5] {
        let _writer = self.writer.lock();
        let mut histogram = [0usize; 5];
        if let Some(root) = self.root.load() {
            count_shapes(root, &mut histogram);
        }
        histogram
    }

    /// Walks the whole tree and asserts every structural invariant: band
    /// membership, skip/flag agreement, no reachable poisoned or
    /// collapse-pending node, and the size counter.
    pub fn debug_check_invariants(&self) {
        let _writer = self.writer.lock();
        let mut total = 0usize;
        if let Some(root) = self.root.load() {
            validate_node(root, &mut total);
        }
        assert_eq!(total, self.len(), "size counter out of sync");
    }
}

fn count_shapes<V>(node: NodePtr<V>, histogram: &mut [usize; 5]) {
    let view = node.view();
    histogram[node.header().load().kind() as usize] += 1;
    with_interior!(&view, |b| {
        b.index.load().for_each(|_, slot| {
            if let Some(child) = b.children[slot].load() {
                count_shapes(child, histogram);
            }
        });
    }, else ());
}

fn validate_node<V>(node: NodePtr<V>, total: &mut usize) {
    let bits = node.header().load();
    assert!(!bits.is_poisoned(), "reachable node is poisoned");
    let view = node.view();
    let skip = view.skip();
    assert_eq!(bits.has_skip(), !skip.is_empty(), "SKIP flag out of sync");
    if bits.has_skip_eos() {
        assert!(bits.has_skip(), "SKIP_EOS requires a non-empty skip");
    }

    match &view {
        NodeRef::SkipLeaf(leaf) => {
            assert!(leaf.value.has_value(), "skip leaf without a value");
            assert!(bits.has_eos() ^ bits.has_skip_eos());
            *total += 1;
        }
        other => {
            let kind = bits.kind();
            let count = other.child_count();
            assert!(
                count >= band_floor(kind) && count <= band_ceil(kind),
                "{count} entries outside the {kind:?} band"
            );
            assert_eq!(count == band_floor(kind), bits.at_floor());
            assert_eq!(count == band_ceil(kind), bits.at_ceiling());

            with_interior!(other, |b| {
                assert!(
                    count > 1 || bits.has_eos() || bits.has_skip_eos(),
                    "single-child node without a value escaped collapse"
                );
                if bits.has_eos() {
                    *total += 1;
                }
                if bits.has_skip_eos() {
                    *total += 1;
                }
                b.index.load().for_each(|_, slot| {
                    let child = b.children[slot].load().expect("indexed slot is detached");
                    validate_node(child, total);
                });
            },
            else with_leaf!(other, |l| {
                l.index.load().for_each(|_, slot| {
                    assert!(l.cells[slot].has_value(), "indexed cell is empty");
                    *total += 1;
                });
            }, else unreachable!()));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn insert_get_erase_round_trip() {
        let trie: Trie<u32> = Trie::new();
        assert!(trie.insert(b"hello", 1));
        assert!(!trie.insert(b"hello", 2));
        assert_eq!(trie.get(b"hello"), Some(1));
        assert!(trie.contains(b"hello"));
        assert!(trie.erase(b"hello"));
        assert!(!trie.erase(b"hello"));
        assert!(trie.is_empty());
        trie.debug_check_invariants();
    }

    #[test]
    fn empty_key_is_a_valid_key() {
        let trie: Trie<u32> = Trie::new();
        assert!(trie.insert(b"", 1));
        assert!(trie.insert(b"a", 2));
        assert_eq!(trie.get(b""), Some(1));
        let keys: Vec<_> = trie.iter().map(|(k, _)| k).collect();
        assert_eq!(keys, vec![b"".to_vec(), b"a".to_vec()]);
        assert!(trie.erase(b""));
        assert_eq!(trie.get(b"a"), Some(2));
        trie.debug_check_invariants();
    }

    #[test]
    fn iterator_survives_erasure_of_its_key() {
        let trie: Trie<u32> = Trie::new();
        trie.insert(b"a", 1);
        trie.insert(b"b", 2);
        trie.insert(b"c", 3);
        let mut iter = trie.iter();
        assert_eq!(iter.next(), Some((b"a".to_vec(), 1)));
        trie.erase(b"a");
        trie.erase(b"b");
        assert_eq!(iter.next(), Some((b"c".to_vec(), 3)));
        assert_eq!(iter.next(), None);
    }

    #[test]
    fn find_yields_the_element_then_continues() {
        let trie: Trie<u32> = Trie::new();
        trie.insert(b"ant", 1);
        trie.insert(b"bee", 2);
        trie.insert(b"cat", 3);
        let mut iter = trie.find(b"bee").expect("bee is present");
        assert_eq!(iter.next(), Some((b"bee".to_vec(), 2)));
        assert_eq!(iter.next(), Some((b"cat".to_vec(), 3)));
        assert_eq!(iter.next(), None);
        assert!(trie.find(b"wasp").is_none());
    }

    #[test]
    fn clear_empties_and_stays_usable() {
        let trie: Trie<u32> = Trie::new();
        for i in 0..100u32 {
            trie.insert(format!("key{i:03}").as_bytes(), i);
        }
        trie.clear();
        assert!(trie.is_empty());
        assert_eq!(trie.first(), None);
        assert!(trie.insert(b"again", 1));
        assert_eq!(trie.len(), 1);
        trie.debug_check_invariants();
    }
}
