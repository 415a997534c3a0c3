//! Read-side traversal.
//!
//! All walks here are wait-free and lock-free: they load child slots with
//! acquire ordering, re-check the owning node's version after following a
//! pointer, and read value cells through the optimistic protocol. Any sign
//! of a concurrent in-place mutation surfaces as [`Scan::Retry`], and the
//! container restarts the walk from the root.

use smallvec::SmallVec;

use crate::node::cell::{CellRead, DataCell};
use crate::node::header::HeaderBits;
use crate::node::{ChildRef, NodePtr, NodeRef};

/// Key bytes accumulated during an ordered walk.
pub(crate) type KeyBuf = SmallVec<[u8; 64]>;

/// Outcome of a wait-free walk.
#[derive(Debug, PartialEq, Eq)]
pub(crate) enum Scan<T> {
    Hit(T),
    Miss,
    /// The walk crossed a writer's mutation window; restart from the root.
    Retry,
}

pub(crate) fn common_prefix(a: &[u8], b: &[u8]) -> usize {
    a.iter().zip(b.iter()).take_while(|(x, y)| x == y).count()
}

fn cell_scan<T>(read: CellRead<T>) -> Scan<T> {
    match read {
        CellRead::Value(value) => Scan::Hit(value),
        CellRead::Empty => Scan::Miss,
        CellRead::Interference => Scan::Retry,
    }
}

/// Exact lookup, parameterized over how the terminal cell is read so that
/// presence probes work without `V: Clone`.
pub(crate) fn lookup_with<V, T>(
    root: Option<NodePtr<V>>,
    key: &[u8],
    read: impl Fn(&DataCell<V>) -> CellRead<T>,
) -> Scan<T> {
    let mut cur = match root {
        Some(node) => node,
        None => return Scan::Miss,
    };
    let mut key = key;
    loop {
        let node = cur;
        let h1 = node.header().load();
        debug_assert!(!h1.is_poisoned());
        let view = node.view();
        let skip = view.skip();

        if key.is_empty() {
            if let NodeRef::SkipLeaf(leaf) = &view {
                return if skip.is_empty() {
                    cell_scan(read(&leaf.value))
                } else {
                    Scan::Miss
                };
            }
            return match view.eos_cell() {
                Some(cell) if h1.has_eos() => cell_scan(read(cell)),
                _ => Scan::Miss,
            };
        }

        let m = common_prefix(key, skip);
        if m < skip.len() {
            // The key diverges from the skip or ends inside it.
            return Scan::Miss;
        }
        if key.len() == skip.len() {
            // The key ends exactly at the end of the skip.
            return match view.skip_eos_cell() {
                Some(cell) if h1.has_skip_eos() => cell_scan(read(cell)),
                _ => Scan::Miss,
            };
        }

        let c = key[skip.len()];
        let rest = &key[skip.len() + 1..];
        match view.find_child(c) {
            ChildRef::Missing => return Scan::Miss,
            ChildRef::Cell(cell) => {
                if !rest.is_empty() {
                    return Scan::Miss;
                }
                let scan = cell_scan(read(cell));
                // A trailing-slot erase followed by an append can rebind
                // this cell to a different character; the version pins the
                // mapping the cell was read under.
                if node.header().load().version() != h1.version() {
                    return Scan::Retry;
                }
                return scan;
            }
            ChildRef::Node(child) => {
                // A trailing erase followed by an append can rebind this
                // slot to a different character; a stale index would then
                // have handed back an unrelated subtree.
                if node.header().load().version() != h1.version() {
                    return Scan::Retry;
                }
                cur = child;
                key = rest;
            }
        }
    }
}

pub(crate) fn lookup<V: Clone>(root: Option<NodePtr<V>>, key: &[u8]) -> Scan<V> {
    lookup_with(root, key, DataCell::try_read)
}

pub(crate) fn probe<V>(root: Option<NodePtr<V>>, key: &[u8]) -> Scan<()> {
    lookup_with(root, key, DataCell::try_probe)
}

/// Descends to the smallest key in `node`'s subtree, appending the key
/// bytes below the entry point to `buf`.
pub(crate) fn first_entry<V: Clone>(root: Option<NodePtr<V>>, buf: &mut KeyBuf) -> Scan<V> {
    match root {
        Some(node) => first_entry_at(node, buf),
        None => Scan::Miss,
    }
}

fn first_entry_at<V: Clone>(mut cur: NodePtr<V>, buf: &mut KeyBuf) -> Scan<V> {
    loop {
        let node = cur;
        let h1 = node.header().load();
        let view = node.view();

        if let NodeRef::SkipLeaf(leaf) = &view {
            buf.extend_from_slice(&leaf.skip);
            return cell_scan(leaf.value.try_read());
        }
        if h1.has_eos() {
            if let Some(cell) = view.eos_cell() {
                match cell.try_read() {
                    CellRead::Value(value) => return Scan::Hit(value),
                    CellRead::Empty => {}
                    CellRead::Interference => return Scan::Retry,
                }
            }
        }
        buf.extend_from_slice(view.skip());
        if h1.has_skip_eos() {
            if let Some(cell) = view.skip_eos_cell() {
                match cell.try_read() {
                    CellRead::Value(value) => return Scan::Hit(value),
                    CellRead::Empty => {}
                    CellRead::Interference => return Scan::Retry,
                }
            }
        }

        match descend_first(node, &view, h1, None, buf) {
            Descend::Into(child) => cur = child,
            Descend::Done(scan) => return scan,
        }
    }
}

enum Descend<V> {
    Into(NodePtr<V>),
    Done(Scan<V>),
}

/// Finds the first live child (or inline value) with branch character
/// strictly greater than `after`, skipping detached slots and cleared
/// cells.
fn descend_first<V: Clone>(
    node: NodePtr<V>,
    view: &NodeRef<'_, V>,
    h1: HeaderBits,
    after: Option<u8>,
    buf: &mut KeyBuf,
) -> Descend<V> {
    let mut candidate = match after {
        None => view.first_child(),
        Some(c) => view.child_above(c),
    };
    loop {
        match candidate {
            None => return Descend::Done(Scan::Miss),
            Some((c, ChildRef::Missing)) => candidate = view.child_above(c),
            Some((c, ChildRef::Cell(cell))) => {
                let read = cell.try_read();
                // See the exact-lookup path: the cell may have been rebound
                // to another character if the node moved underneath us.
                if node.header().load().version() != h1.version() {
                    return Descend::Done(Scan::Retry);
                }
                match read {
                    CellRead::Value(value) => {
                        buf.push(c);
                        return Descend::Done(Scan::Hit(value));
                    }
                    CellRead::Empty => candidate = view.child_above(c),
                    CellRead::Interference => return Descend::Done(Scan::Retry),
                }
            }
            Some((c, ChildRef::Node(child))) => {
                if node.header().load().version() != h1.version() {
                    return Descend::Done(Scan::Retry);
                }
                buf.push(c);
                return Descend::Into(child);
            }
        }
    }
}

/// Walks from `after` to the first entry of the next live sibling subtree.
fn first_from_children<V: Clone>(
    node: NodePtr<V>,
    view: &NodeRef<'_, V>,
    h1: HeaderBits,
    after: Option<u8>,
    buf: &mut KeyBuf,
) -> Scan<V> {
    let mut after = after;
    loop {
        match descend_first(node, view, h1, after, buf) {
            Descend::Done(scan) => return scan,
            Descend::Into(child) => {
                let saved = buf.len();
                match first_entry_at(child, buf) {
                    Scan::Hit(value) => return Scan::Hit(value),
                    Scan::Retry => return Scan::Retry,
                    Scan::Miss => {
                        // Transiently empty subtree; move on to the next
                        // sibling character.
                        debug_assert!(saved > 0);
                        after = Some(buf[saved - 1]);
                        buf.truncate(saved - 1);
                    }
                }
            }
        }
    }
}

/// Finds the smallest key strictly greater than `bound`, appending its
/// bytes to `buf`.
pub(crate) fn next_entry<V: Clone>(
    root: Option<NodePtr<V>>,
    bound: &[u8],
    buf: &mut KeyBuf,
) -> Scan<V> {
    match root {
        Some(node) => successor(node, bound, buf),
        None => Scan::Miss,
    }
}

fn successor<V: Clone>(node: NodePtr<V>, bound: &[u8], buf: &mut KeyBuf) -> Scan<V> {
    let h1 = node.header().load();
    let view = node.view();
    let skip = view.skip();
    let m = common_prefix(skip, bound);

    if m < skip.len() {
        if bound.len() == m || bound[m] < skip[m] {
            // The whole subtree below the skip sorts after the bound. The
            // node's entry value does not: its key is a prefix of the bound.
            buf.extend_from_slice(skip);
            return first_from_skip_end(node, &view, h1, buf);
        }
        return Scan::Miss;
    }

    buf.extend_from_slice(skip);
    if bound.len() == m {
        // The bound equals the key ending at the skip; strictly-greater
        // keys start at the children.
        return first_from_children(node, &view, h1, None, buf);
    }

    let c = bound[m];
    let rest = &bound[m + 1..];
    match view.find_child(c) {
        ChildRef::Node(child) => {
            if node.header().load().version() != h1.version() {
                return Scan::Retry;
            }
            let saved = buf.len();
            buf.push(c);
            match successor(child, rest, buf) {
                Scan::Hit(value) => Scan::Hit(value),
                Scan::Retry => Scan::Retry,
                Scan::Miss => {
                    buf.truncate(saved);
                    first_from_children(node, &view, h1, Some(c), buf)
                }
            }
        }
        // An inline value at `c` ends right there, so it can never exceed
        // a bound that still has `rest` to spend (and equals it otherwise).
        ChildRef::Cell(_) | ChildRef::Missing => {
            first_from_children(node, &view, h1, Some(c), buf)
        }
    }
}

fn first_from_skip_end<V: Clone>(
    node: NodePtr<V>,
    view: &NodeRef<'_, V>,
    h1: HeaderBits,
    buf: &mut KeyBuf,
) -> Scan<V> {
    if let NodeRef::SkipLeaf(leaf) = view {
        return cell_scan(leaf.value.try_read());
    }
    if h1.has_skip_eos() {
        if let Some(cell) = view.skip_eos_cell() {
            match cell.try_read() {
                CellRead::Value(value) => return Scan::Hit(value),
                CellRead::Empty => {}
                CellRead::Interference => return Scan::Retry,
            }
        }
    }
    first_from_children(node, view, h1, None, buf)
}
