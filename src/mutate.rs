//! Writer-side mutation engine.
//!
//! Everything here runs under the container's writer mutex. Mutations come
//! in two flavors:
//!
//! * **in place** — writing a previously empty slot (a trailing append,
//!   or any direct-indexed FULL slot), dropping a trailing entry, or
//!   setting and clearing an end-of-string value. Occupied slots never
//!   move, so a reader observes the old state or the new state of any
//!   slot it can reach; the version bump exists so a reader can detect a
//!   slot that was rebound to a different character across an erase and
//!   a later append, and restart.
//! * **copy-on-write** — skip splits, band transitions, collapses and
//!   every other structural change. A replacement subtree is built off to
//!   the side (poisoned until linked), committed with a single release
//!   store into the highest changed slot, and every replaced node is
//!   retired through the epoch lists.
//!
//! Untouched siblings are never rebuilt: replacement nodes carry the old
//! child pointers over by value, so a reader parked inside a retired node
//! still sees live children until its epoch passes.

use smallvec::SmallVec;

use crate::epoch::{EpochDomain, Retired, RetireLists};
use crate::navigate::common_prefix;
use crate::node::header::{HeaderBits, EOS, SKIP_EOS};
use crate::node::{
    band_ceil, band_floor, build_interior, build_leaf, build_skip_leaf, free_node_erased,
    free_subtree_erased, with_interior, with_leaf, Branch, BranchIndex, ChildSlot, IndexSnap,
    LeafBranch, NodePtr, NodeRef, SkipLeaf,
};

/// Writer context: where replaced nodes go to die.
pub(crate) struct WriteCx<'a> {
    pub domain: &'a EpochDomain,
    pub retire: &'a mut RetireLists,
}

impl WriteCx<'_> {
    pub fn retire_node<V>(&mut self, node: NodePtr<V>) {
        let retired = unsafe { Retired::new(node.as_raw(), free_node_erased::<V>) };
        self.retire.retire(self.domain, retired);
    }

    pub fn retire_subtree<V>(&mut self, node: NodePtr<V>) {
        let retired = unsafe { Retired::new(node.as_raw(), free_subtree_erased::<V>) };
        self.retire.retire(self.domain, retired);
    }
}

/// Links a freshly built node: the poison mark drops and the pointer store
/// publishes the whole subtree with release ordering.
fn publish<V>(slot: &ChildSlot<V>, node: NodePtr<V>) {
    node.header().clear_poisoned();
    slot.store(Some(node));
}

/// Recomputes the band-adjacency hint bits for `count` live entries.
fn refresh_hints(bits: HeaderBits, count: usize) -> HeaderBits {
    use crate::node::header::{CEIL, FLOOR};
    let kind = bits.kind();
    let mut bits = bits.without(FLOOR | CEIL);
    if count == band_floor(kind) {
        bits = bits.with(FLOOR);
    }
    if count == band_ceil(kind) {
        bits = bits.with(CEIL);
    }
    bits
}

// ---------------------------------------------------------------------------
// Writer-side value extraction
// ---------------------------------------------------------------------------

unsafe fn eos_value<V: Clone, X: BranchIndex, const N: usize>(b: &Branch<V, X, N>) -> Option<V> {
    b.eos.writer_peek().cloned()
}

unsafe fn skip_eos_value<V: Clone, X: BranchIndex, const N: usize>(
    b: &Branch<V, X, N>,
) -> Option<V> {
    b.skip_eos.writer_peek().cloned()
}

/// Rebuilds a branch node (interior or leaf) with a new skip and explicit
/// end-of-string values, carrying the children (or cell values) over.
///
/// A value whose key ends at the end of an empty skip is the same as one
/// ending at the entry, so it is normalized into the EOS position.
unsafe fn rebuild_branch<V: Clone>(
    node: NodePtr<V>,
    new_skip: &[u8],
    eos: Option<V>,
    skip_eos: Option<V>,
) -> NodePtr<V> {
    let (eos, skip_eos) = if new_skip.is_empty() {
        debug_assert!(eos.is_none() || skip_eos.is_none());
        (eos.or(skip_eos), None)
    } else {
        (eos, skip_eos)
    };
    let view = node.view();
    with_interior!(&view, |b| build_interior(new_skip, eos, skip_eos, &b.entries()),
        else with_leaf!(&view, |l| {
            debug_assert!(eos.is_none() && skip_eos.is_none());
            build_leaf(new_skip, l.entries())
        }, else unreachable!("skip leaves are rebuilt at their call sites")))
}

// ---------------------------------------------------------------------------
// Insert
// ---------------------------------------------------------------------------

/// Inserts `key` into the subtree behind `slot`. Returns `false` if the
/// key was already present (the stored value is left untouched).
pub(crate) fn insert<V: Clone>(
    cx: &mut WriteCx<'_>,
    slot: &ChildSlot<V>,
    key: &[u8],
    value: V,
    fixed: bool,
) -> bool {
    let Some(node) = slot.load() else {
        publish(slot, build_skip_leaf(key, value));
        return true;
    };
    let view = node.view();
    match &view {
        NodeRef::SkipLeaf(leaf) => insert_at_skip_leaf(cx, slot, node, leaf, key, value, fixed),
        other => with_interior!(other, |b| unsafe {
            insert_at_interior(cx, slot, node, b, key, value, fixed)
        },
        else with_leaf!(other, |l| unsafe {
            insert_at_leaf(cx, slot, node, l, key, value)
        }, else unreachable!())),
    }
}

fn insert_at_skip_leaf<V: Clone>(
    cx: &mut WriteCx<'_>,
    slot: &ChildSlot<V>,
    node: NodePtr<V>,
    leaf: &SkipLeaf<V>,
    key: &[u8],
    value: V,
    fixed: bool,
) -> bool {
    let s: &[u8] = &leaf.skip;
    if key == s {
        return false;
    }
    let old = unsafe { leaf.value.writer_peek() }
        .cloned()
        .expect("a linked skip leaf always holds its value");
    let m = common_prefix(key, s);

    let replacement = if m == s.len() {
        // The stored key is a proper prefix of the inserted one.
        let tail = build_skip_leaf(&key[m + 1..], value);
        let (eos, skip_eos) = if s.is_empty() {
            (Some(old), None)
        } else {
            (None, Some(old))
        };
        build_interior(s, eos, skip_eos, &[(key[m], tail)])
    } else if m == key.len() {
        // The inserted key is a proper prefix of the stored one.
        let tail = build_skip_leaf(&s[m + 1..], old);
        let (eos, skip_eos) = if m == 0 {
            (Some(value), None)
        } else {
            (None, Some(value))
        };
        build_interior(&s[..m], eos, skip_eos, &[(s[m], tail)])
    } else {
        // The keys diverge inside the skip.
        let (old_c, new_c) = (s[m], key[m]);
        let (old_rest, new_rest) = (&s[m + 1..], &key[m + 1..]);
        if fixed && old_rest.is_empty() && new_rest.is_empty() {
            // Both keys end right after the divergence byte: the last level
            // of the fixed-length schedule stores values inline.
            let mut entries: SmallVec<[(u8, V); 8]> = SmallVec::new();
            if old_c < new_c {
                entries.push((old_c, old));
                entries.push((new_c, value));
            } else {
                entries.push((new_c, value));
                entries.push((old_c, old));
            }
            build_leaf(&s[..m], entries)
        } else {
            let old_tail = build_skip_leaf(old_rest, old);
            let new_tail = build_skip_leaf(new_rest, value);
            let mut entries = [(old_c, old_tail), (new_c, new_tail)];
            entries.sort_unstable_by_key(|&(c, _)| c);
            build_interior(&s[..m], None, None, &entries)
        }
    };

    publish(slot, replacement);
    cx.retire_node(node);
    true
}

unsafe fn insert_at_interior<V: Clone, X: BranchIndex, const N: usize>(
    cx: &mut WriteCx<'_>,
    slot: &ChildSlot<V>,
    node: NodePtr<V>,
    b: &Branch<V, X, N>,
    key: &[u8],
    value: V,
    fixed: bool,
) -> bool {
    let h1 = node.header().load();
    let s: &[u8] = &b.skip;

    if key.is_empty() {
        // The key ends at the node's entry, before the skip.
        if h1.has_eos() {
            return false;
        }
        b.eos.write(value);
        node.header().update(|bits| bits.with(EOS));
        return true;
    }

    let m = common_prefix(key, s);
    if m < s.len() {
        split_above(cx, slot, node, s, key, value, m, fixed);
        return true;
    }

    if key.len() == s.len() {
        // The key ends exactly at the end of the skip.
        if h1.has_skip_eos() {
            return false;
        }
        b.skip_eos.write(value);
        node.header().update(|bits| bits.with(SKIP_EOS));
        return true;
    }

    let c = key[s.len()];
    let rest = &key[s.len() + 1..];
    let snap = b.index.load();
    if let Some(idx) = snap.slot_of(c) {
        return insert(cx, &b.children[idx], rest, value, fixed);
    }

    debug_assert!(
        !(fixed && rest.is_empty()),
        "fixed-length last-byte entries live in leaf nodes"
    );
    let tail = build_skip_leaf(rest, value);
    add_child(cx, slot, node, b, c, tail);
    true
}

unsafe fn insert_at_leaf<V: Clone, X: BranchIndex, const N: usize>(
    cx: &mut WriteCx<'_>,
    slot: &ChildSlot<V>,
    node: NodePtr<V>,
    l: &LeafBranch<V, X, N>,
    key: &[u8],
    value: V,
) -> bool {
    let s: &[u8] = &l.skip;
    debug_assert!(key.len() > s.len(), "leaf nodes sit at the last key byte");

    let m = common_prefix(key, s);
    if m < s.len() {
        split_above(cx, slot, node, s, key, value, m, true);
        return true;
    }

    let c = key[s.len()];
    debug_assert!(key.len() == s.len() + 1);
    let snap = l.index.load();
    if snap.slot_of(c).is_some() {
        return false;
    }
    add_cell(cx, slot, node, l, c, value);
    true
}

/// Splits a branch node whose skip disagrees with the inserted key at
/// offset `m`: a new upper node takes over the common prefix (and the old
/// node's entry value), the old node continues below with a shortened skip.
unsafe fn split_above<V: Clone>(
    cx: &mut WriteCx<'_>,
    slot: &ChildSlot<V>,
    node: NodePtr<V>,
    s: &[u8],
    key: &[u8],
    value: V,
    m: usize,
    fixed: bool,
) {
    let view = node.view();
    let moved_eos = with_interior!(&view, |b| eos_value(b), else None);
    let kept_skip_eos = with_interior!(&view, |b| skip_eos_value(b), else None);
    let shortened = rebuild_branch(node, &s[m + 1..], None, kept_skip_eos);
    let old_c = s[m];

    let upper = if m == key.len() {
        // The key ends inside the old skip; its value sits at the end of
        // the upper node's skip (`m > 0`: an empty key ends at the entry
        // and never reaches here).
        debug_assert!(m > 0);
        build_interior(&s[..m], moved_eos, Some(value), &[(old_c, shortened)])
    } else {
        let new_c = key[m];
        let new_rest = &key[m + 1..];
        debug_assert!(
            !(fixed && new_rest.is_empty()),
            "a branch node's keys always extend past a fixed-length divergence"
        );
        let new_tail = build_skip_leaf(new_rest, value);
        let mut entries = [(old_c, shortened), (new_c, new_tail)];
        entries.sort_unstable_by_key(|&(c, _)| c);
        build_interior(&s[..m], moved_eos, None, &entries)
    };

    publish(slot, upper);
    cx.retire_node(node);
}

/// Adds a child to an interior node. In place only when the pointer lands
/// in a previously empty slot and no sibling slot moves: a trailing
/// append in the positional shapes, or any direct-indexed FULL slot.
/// Splicing into the middle of a compact sorted array would rewrite
/// occupied slots under a reader whose walk fits entirely between the
/// version bump and the index store, so those cases copy, as does the
/// promotion out of a full band.
unsafe fn add_child<V: Clone, X: BranchIndex, const N: usize>(
    cx: &mut WriteCx<'_>,
    slot: &ChildSlot<V>,
    node: NodePtr<V>,
    b: &Branch<V, X, N>,
    c: u8,
    child: NodePtr<V>,
) {
    let h1 = node.header().load();
    let snap = b.index.load();
    let count = snap.count();
    debug_assert_eq!(h1.at_ceiling(), count == N);

    if !h1.at_ceiling() {
        let (next, pos) = snap.with_added(c);
        if N == 256 || pos == count {
            node.header().update(|bits| refresh_hints(bits, count + 1));
            child.header().clear_poisoned();
            b.children[pos].store(Some(child));
            b.index.store(next);
            return;
        }
    }

    // Copy with the new child spliced in; at the band ceiling the rebuild
    // promotes into the next shape.
    let mut entries = b.entries();
    let pos = entries.iter().position(|&(ec, _)| ec > c).unwrap_or(entries.len());
    entries.insert(pos, (c, child));
    let rebuilt = build_interior(&b.skip, eos_value(b), skip_eos_value(b), &entries);
    publish(slot, rebuilt);
    cx.retire_node(node);
}

/// Adds an inline value to a leaf node. Cells cannot be shifted in place
/// (a reader may be copying out of one), so the in-place path is limited
/// to appends that land in untouched slots; everything else copies.
unsafe fn add_cell<V: Clone, X: BranchIndex, const N: usize>(
    cx: &mut WriteCx<'_>,
    slot: &ChildSlot<V>,
    node: NodePtr<V>,
    l: &LeafBranch<V, X, N>,
    c: u8,
    value: V,
) {
    let h1 = node.header().load();
    let snap = l.index.load();
    let count = snap.count();
    debug_assert_eq!(h1.at_ceiling(), count == N);

    if !h1.at_ceiling() {
        let (next, pos) = snap.with_added(c);
        if N == 256 || pos == count {
            node.header().update(|bits| refresh_hints(bits, count + 1));
            l.cells[pos].write(value);
            l.index.store(next);
            return;
        }
    }

    let mut entries = l.entries();
    let pos = entries.iter().position(|&(ec, _)| ec > c).unwrap_or(entries.len());
    entries.insert(pos, (c, value));
    let rebuilt = build_leaf(&l.skip, entries);
    publish(slot, rebuilt);
    cx.retire_node(node);
}

// ---------------------------------------------------------------------------
// Erase
// ---------------------------------------------------------------------------

#[derive(Debug, PartialEq, Eq)]
pub(crate) enum EraseOutcome {
    NotFound,
    Removed,
    /// The key was removed and the whole node behind the slot went with
    /// it; the slot has been cleared and the caller owns the cleanup of
    /// its own index entry.
    Detached,
}

/// Which stored value a key termination selects.
enum ValuePos {
    Eos,
    SkipEos,
}

pub(crate) fn erase<V: Clone>(
    cx: &mut WriteCx<'_>,
    slot: &ChildSlot<V>,
    key: &[u8],
    fixed: bool,
) -> EraseOutcome {
    let Some(node) = slot.load() else {
        return EraseOutcome::NotFound;
    };
    let view = node.view();
    match &view {
        NodeRef::SkipLeaf(leaf) => {
            if key == &*leaf.skip {
                slot.store(None);
                cx.retire_node(node);
                EraseOutcome::Detached
            } else {
                EraseOutcome::NotFound
            }
        }
        other => with_interior!(other, |b| unsafe {
            erase_at_interior(cx, slot, node, b, key, fixed)
        },
        else with_leaf!(other, |l| unsafe {
            erase_at_leaf(cx, slot, node, l, key)
        }, else unreachable!())),
    }
}

unsafe fn erase_at_interior<V: Clone, X: BranchIndex, const N: usize>(
    cx: &mut WriteCx<'_>,
    slot: &ChildSlot<V>,
    node: NodePtr<V>,
    b: &Branch<V, X, N>,
    key: &[u8],
    fixed: bool,
) -> EraseOutcome {
    let h1 = node.header().load();
    let s: &[u8] = &b.skip;

    if key.is_empty() {
        if !h1.has_eos() {
            return EraseOutcome::NotFound;
        }
        return remove_value(cx, slot, node, b, ValuePos::Eos);
    }

    let m = common_prefix(key, s);
    if m < s.len() {
        return EraseOutcome::NotFound;
    }
    if key.len() == s.len() {
        if !h1.has_skip_eos() {
            return EraseOutcome::NotFound;
        }
        return remove_value(cx, slot, node, b, ValuePos::SkipEos);
    }

    let c = key[s.len()];
    let rest = &key[s.len() + 1..];
    let snap = b.index.load();
    let Some(idx) = snap.slot_of(c) else {
        return EraseOutcome::NotFound;
    };
    match erase(cx, &b.children[idx], rest, fixed) {
        EraseOutcome::NotFound => EraseOutcome::NotFound,
        EraseOutcome::Removed => EraseOutcome::Removed,
        EraseOutcome::Detached => remove_child_entry(cx, slot, node, b, c),
    }
}

unsafe fn erase_at_leaf<V: Clone, X: BranchIndex, const N: usize>(
    cx: &mut WriteCx<'_>,
    slot: &ChildSlot<V>,
    node: NodePtr<V>,
    l: &LeafBranch<V, X, N>,
    key: &[u8],
) -> EraseOutcome {
    let s: &[u8] = &l.skip;
    if key.len() != s.len() + 1 || common_prefix(key, s) < s.len() {
        return EraseOutcome::NotFound;
    }
    let c = key[s.len()];
    let snap = l.index.load();
    if snap.slot_of(c).is_none() {
        return EraseOutcome::NotFound;
    }
    remove_cell_entry(cx, slot, node, l, c)
}

/// Removes an EOS or SKIP_EOS value, collapsing the node if that leaves a
/// single child and no remaining value.
unsafe fn remove_value<V: Clone, X: BranchIndex, const N: usize>(
    cx: &mut WriteCx<'_>,
    slot: &ChildSlot<V>,
    node: NodePtr<V>,
    b: &Branch<V, X, N>,
    pos: ValuePos,
) -> EraseOutcome {
    let h1 = node.header().load();
    let other_value = match pos {
        ValuePos::Eos => h1.has_skip_eos(),
        ValuePos::SkipEos => h1.has_eos(),
    };
    let entries = b.entries();

    if entries.len() == 1 && !other_value {
        let (c, child) = entries[0];
        collapse_into(cx, slot, node, c, child);
        return EraseOutcome::Removed;
    }

    match pos {
        ValuePos::Eos => {
            node.header().update(|bits| bits.without(EOS));
            b.eos.clear();
        }
        ValuePos::SkipEos => {
            node.header().update(|bits| bits.without(SKIP_EOS));
            b.skip_eos.clear();
        }
    }
    EraseOutcome::Removed
}

/// Cleans up after a detached child: removes its index entry and applies
/// the band rules to what is left.
unsafe fn remove_child_entry<V: Clone, X: BranchIndex, const N: usize>(
    cx: &mut WriteCx<'_>,
    slot: &ChildSlot<V>,
    node: NodePtr<V>,
    b: &Branch<V, X, N>,
    c: u8,
) -> EraseOutcome {
    let h1 = node.header().load();
    let snap = b.index.load();
    let new_count = snap.count() - 1;
    let has_values = h1.has_eos() || h1.has_skip_eos();

    if new_count == 0 {
        let replacement = match (eos_value(b), skip_eos_value(b)) {
            (None, None) => {
                slot.store(None);
                cx.retire_node(node);
                return EraseOutcome::Detached;
            }
            // Entry value plus skip-end value: the entry value keeps the
            // node, the skip-end value moves below a one-child branch.
            (Some(eos), Some(skip_eos)) => {
                let s: &[u8] = &b.skip;
                let lower = build_skip_leaf(&s[1..], skip_eos);
                build_interior(b"", Some(eos), None, &[(s[0], lower)])
            }
            (Some(eos), None) => build_skip_leaf(b"", eos),
            (None, Some(skip_eos)) => build_skip_leaf(&b.skip, skip_eos),
        };
        publish(slot, replacement);
        cx.retire_node(node);
        return EraseOutcome::Removed;
    }

    if new_count == 1 && !has_values {
        let entries = b.entries();
        debug_assert_eq!(entries.len(), 1);
        let (survivor_c, survivor) = entries[0];
        debug_assert_ne!(survivor_c, c);
        collapse_into(cx, slot, node, survivor_c, survivor);
        return EraseOutcome::Removed;
    }

    if new_count >= band_floor(h1.kind()) {
        let (next, pos) = snap.with_removed(c);
        // The detach already cleared the pointer slot; dropping the
        // character from the index is safe in place only when no sibling
        // slot would have to move to keep the array compact.
        if N == 256 || pos == new_count {
            node.header().update(|bits| refresh_hints(bits, new_count));
            b.index.store(next);
            return EraseOutcome::Removed;
        }
    }

    // Copy without the entry, demoting below the band floor.
    let entries = b.entries();
    let rebuilt = build_interior(&b.skip, eos_value(b), skip_eos_value(b), &entries);
    publish(slot, rebuilt);
    cx.retire_node(node);
    EraseOutcome::Removed
}

/// Removes an inline value from a leaf node.
unsafe fn remove_cell_entry<V: Clone, X: BranchIndex, const N: usize>(
    cx: &mut WriteCx<'_>,
    slot: &ChildSlot<V>,
    node: NodePtr<V>,
    l: &LeafBranch<V, X, N>,
    c: u8,
) -> EraseOutcome {
    let h1 = node.header().load();
    let snap = l.index.load();
    let new_count = snap.count() - 1;

    if new_count == 0 {
        slot.store(None);
        cx.retire_node(node);
        return EraseOutcome::Detached;
    }

    if new_count == 1 {
        // One survivor: fold it into a skip leaf, skip plus character.
        let entries = l.entries();
        let (survivor_c, survivor) = entries
            .into_iter()
            .find(|&(ec, _)| ec != c)
            .expect("a second entry survives");
        let mut skip: SmallVec<[u8; 16]> = SmallVec::from_slice(&l.skip);
        skip.push(survivor_c);
        publish(slot, build_skip_leaf(&skip, survivor));
        cx.retire_node(node);
        return EraseOutcome::Removed;
    }

    let (next, pos) = snap.with_removed(c);
    let no_shift = N == 256 || pos == new_count;
    if new_count >= band_floor(h1.kind()) && no_shift {
        node.header().update(|bits| refresh_hints(bits, new_count));
        l.cells[pos].clear();
        l.index.store(next);
        return EraseOutcome::Removed;
    }

    // Copy without the entry; cells cannot be shifted under a reader.
    let entries: SmallVec<[(u8, V); 8]> = l
        .entries()
        .into_iter()
        .filter(|&(ec, _)| ec != c)
        .collect();
    let rebuilt = build_leaf(&l.skip, entries);
    publish(slot, rebuilt);
    cx.retire_node(node);
    EraseOutcome::Removed
}

/// Merges a single-child, value-free node into its child: the replacement
/// carries `parent_skip ∥ char ∥ child_skip`.
///
/// One wrinkle: a child owning both an entry value and a non-empty skip
/// cannot have its entry buried inside a longer skip. In that case the
/// merge stops at the child's entry and re-expresses the child's skip as a
/// one-child link below it.
unsafe fn collapse_into<V: Clone>(
    cx: &mut WriteCx<'_>,
    slot: &ChildSlot<V>,
    node: NodePtr<V>,
    c: u8,
    child: NodePtr<V>,
) {
    let mut merged_skip: SmallVec<[u8; 16]> = SmallVec::from_slice(node.view().skip());
    merged_skip.push(c);

    let child_view = child.view();
    let replacement = match &child_view {
        NodeRef::SkipLeaf(leaf) => {
            merged_skip.extend_from_slice(&leaf.skip);
            let value = leaf
                .value
                .writer_peek()
                .cloned()
                .expect("a linked skip leaf always holds its value");
            build_skip_leaf(&merged_skip, value)
        }
        other => {
            let child_skip = other.skip();
            let child_eos = with_interior!(other, |cb| eos_value(cb), else None);
            let child_skip_eos = with_interior!(other, |cb| skip_eos_value(cb), else None);
            if child_eos.is_some() && !child_skip.is_empty() {
                // Partial collapse: the child's entry value ends where the
                // merged skip would continue.
                let lower = rebuild_branch(child, &child_skip[1..], None, child_skip_eos);
                build_interior(&merged_skip, None, child_eos, &[(child_skip[0], lower)])
            } else {
                merged_skip.extend_from_slice(child_skip);
                let skip_eos = child_eos.or(child_skip_eos);
                rebuild_branch(child, &merged_skip, None, skip_eos)
            }
        }
    };

    publish(slot, replacement);
    cx.retire_node(node);
    cx.retire_node(child);
}
