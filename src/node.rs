//! Node layouts, builder and deleter.
//!
//! Every node is a heap allocation whose first field is the packed
//! [`Header`]; the header's kind and leaf bits select the concrete layout.
//! Interior nodes hold child pointers behind a branch index (a packed char
//! list for BINARY/LIST, a bitmap for POP/FULL); leaf nodes hold value
//! cells in the same arrangement; a skip-leaf holds a single value under a
//! path-compression skip string.
//!
//! Readers derive all polymorphism from the header: [`NodePtr::view`]
//! rebuilds the typed reference a pointer load erased.

pub(crate) mod cell;
pub(crate) mod header;

use std::marker::PhantomData;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicPtr, AtomicU64, Ordering};

use smallvec::SmallVec;

use crate::bitmap::ByteBitmap;
use crate::smalllist::SmallList;
use cell::DataCell;
use header::{Header, HeaderBits, Kind, CEIL, EOS, FLOOR, LEAF, POISONED, SKIP, SKIP_EOS};

/// Inclusive lower bound of a kind's branching band.
pub(crate) fn band_floor(kind: Kind) -> usize {
    match kind {
        Kind::SkipLeaf => 0,
        Kind::Binary => 1,
        Kind::List => 3,
        Kind::Pop => 8,
        Kind::Full => 33,
    }
}

/// Inclusive upper bound of a kind's branching band.
pub(crate) fn band_ceil(kind: Kind) -> usize {
    match kind {
        Kind::SkipLeaf => 0,
        Kind::Binary => 2,
        Kind::List => 7,
        Kind::Pop => 32,
        Kind::Full => 256,
    }
}

/// The kind whose band contains `count` live entries.
pub(crate) fn kind_for_count(count: usize) -> Kind {
    match count {
        0 => unreachable!("empty nodes are detached, not built"),
        1..=2 => Kind::Binary,
        3..=7 => Kind::List,
        8..=32 => Kind::Pop,
        _ => Kind::Full,
    }
}

// ---------------------------------------------------------------------------
// Branch indexes
// ---------------------------------------------------------------------------

/// A copied-out, immutable view of a branch index: the mapping from branch
/// character to child slot. Obtained from one or a few atomic loads, so a
/// reader works against a self-consistent snapshot and relies on the node
/// version re-check to detect that the slots moved underneath it.
pub(crate) trait IndexSnap: Copy {
    fn count(self) -> usize;
    /// Slot of `c`, if present.
    fn slot_of(self, c: u8) -> Option<usize>;
    /// Smallest stored character with its slot.
    fn first(self) -> Option<(u8, usize)>;
    /// Smallest stored character strictly greater than `c`, with its slot.
    fn above(self, c: u8) -> Option<(u8, usize)>;
    /// Adds `c`; returns the updated snapshot and the slot it landed in.
    fn with_added(self, c: u8) -> (Self, usize);
    /// Removes `c`; returns the updated snapshot and the slot it vacated.
    fn with_removed(self, c: u8) -> (Self, usize);
    /// Visits `(char, slot)` pairs in ascending character order.
    fn for_each(self, f: impl FnMut(u8, usize));
}

/// Atomic storage for a branch index.
pub(crate) trait BranchIndex {
    type Snap: IndexSnap;
    fn new_empty() -> Self;
    fn load(&self) -> Self::Snap;
    fn store(&self, snap: Self::Snap);
}

/// BINARY and LIST nodes: a [`SmallList`] in one atomic word.
#[repr(C)]
pub(crate) struct AtomicChars(AtomicU64);

impl BranchIndex for AtomicChars {
    type Snap = SmallList;

    fn new_empty() -> Self {
        AtomicChars(AtomicU64::new(SmallList::new_empty().as_word()))
    }

    fn load(&self) -> SmallList {
        SmallList::from_word(self.0.load(Ordering::Acquire))
    }

    fn store(&self, snap: SmallList) {
        self.0.store(snap.as_word(), Ordering::Release);
    }
}

impl IndexSnap for SmallList {
    fn count(self) -> usize {
        self.len()
    }

    fn slot_of(self, c: u8) -> Option<usize> {
        self.find(c)
    }

    fn first(self) -> Option<(u8, usize)> {
        self.first().map(|c| (c, 0))
    }

    fn above(self, c: u8) -> Option<(u8, usize)> {
        SmallList::above(self, c)
    }

    fn with_added(self, c: u8) -> (Self, usize) {
        self.insert(c)
    }

    fn with_removed(self, c: u8) -> (Self, usize) {
        let pos = self.find(c).expect("removed char must be present");
        (self.remove_at(pos), pos)
    }

    fn for_each(self, mut f: impl FnMut(u8, usize)) {
        for (pos, c) in self.iter() {
            f(c, pos);
        }
    }
}

/// POP and FULL nodes: a 256-bit bitmap over four atomic words. `DIRECT`
/// selects direct slot addressing (FULL) over rank addressing (POP).
#[repr(C)]
pub(crate) struct AtomicBits<const DIRECT: bool>([AtomicU64; 4]);

/// Snapshot of an [`AtomicBits`] index.
#[derive(Copy, Clone)]
pub(crate) struct BitsSnap<const DIRECT: bool>(pub ByteBitmap);

impl<const DIRECT: bool> BranchIndex for AtomicBits<DIRECT> {
    type Snap = BitsSnap<DIRECT>;

    fn new_empty() -> Self {
        AtomicBits(std::array::from_fn(|_| AtomicU64::new(0)))
    }

    fn load(&self) -> BitsSnap<DIRECT> {
        BitsSnap(ByteBitmap::from_words(std::array::from_fn(|word| {
            self.0[word].load(Ordering::Acquire)
        })))
    }

    fn store(&self, snap: BitsSnap<DIRECT>) {
        let words = snap.0.as_words();
        for (word, value) in words.into_iter().enumerate() {
            self.0[word].store(value, Ordering::Release);
        }
    }
}

impl<const DIRECT: bool> BitsSnap<DIRECT> {
    fn slot_for(self, c: u8) -> usize {
        if DIRECT {
            c as usize
        } else {
            self.0.rank(c)
        }
    }
}

impl<const DIRECT: bool> IndexSnap for BitsSnap<DIRECT> {
    fn count(self) -> usize {
        self.0.count()
    }

    fn slot_of(self, c: u8) -> Option<usize> {
        if self.0.test(c) {
            Some(self.slot_for(c))
        } else {
            None
        }
    }

    fn first(self) -> Option<(u8, usize)> {
        self.0.first_set().map(|c| (c, self.slot_for(c)))
    }

    fn above(self, c: u8) -> Option<(u8, usize)> {
        self.0.next_set(c).map(|next| (next, self.slot_for(next)))
    }

    fn with_added(self, c: u8) -> (Self, usize) {
        debug_assert!(!self.0.test(c));
        let mut bits = self.0;
        bits.set(c);
        let next = BitsSnap(bits);
        (next, next.slot_for(c))
    }

    fn with_removed(self, c: u8) -> (Self, usize) {
        debug_assert!(self.0.test(c));
        let slot = self.slot_for(c);
        let mut bits = self.0;
        bits.clear(c);
        (BitsSnap(bits), slot)
    }

    fn for_each(self, mut f: impl FnMut(u8, usize)) {
        let mut cursor = self.0.first_set();
        while let Some(c) = cursor {
            f(c, self.slot_for(c));
            cursor = self.0.next_set(c);
        }
    }
}

// ---------------------------------------------------------------------------
// Pointers and slots
// ---------------------------------------------------------------------------

/// An untyped pointer to a node allocation. The header at offset zero is
/// the source of truth for the concrete layout behind it.
pub(crate) struct NodePtr<V> {
    raw: NonNull<u8>,
    _marker: PhantomData<*mut V>,
}

impl<V> Copy for NodePtr<V> {}
impl<V> Clone for NodePtr<V> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<V> NodePtr<V> {
    pub fn from_raw(raw: NonNull<u8>) -> Self {
        NodePtr {
            raw,
            _marker: PhantomData,
        }
    }

    fn from_box<T>(node: Box<T>) -> Self {
        // SAFETY: Box::into_raw never returns null.
        let raw = unsafe { NonNull::new_unchecked(Box::into_raw(node) as *mut u8) };
        NodePtr::from_raw(raw)
    }

    pub fn as_raw(self) -> NonNull<u8> {
        self.raw
    }

    pub fn header(&self) -> &Header {
        // SAFETY: every node layout is repr(C) with the header first.
        unsafe { &*(self.raw.as_ptr() as *const Header) }
    }

    /// Rebuilds the typed view the erased pointer stands for.
    pub fn view(&self) -> NodeRef<'_, V> {
        let bits = self.header().load();
        let raw = self.raw.as_ptr();
        // SAFETY: the header kind and leaf bit are written once at
        // construction and identify the allocation's concrete type.
        unsafe {
            match (bits.kind(), bits.is_leaf()) {
                (Kind::SkipLeaf, _) => NodeRef::SkipLeaf(&*(raw as *const SkipLeaf<V>)),
                (Kind::Binary, false) => NodeRef::Binary(&*(raw as *const BinaryNode<V>)),
                (Kind::List, false) => NodeRef::List(&*(raw as *const ListNode<V>)),
                (Kind::Pop, false) => NodeRef::Pop(&*(raw as *const PopNode<V>)),
                (Kind::Full, false) => NodeRef::Full(&*(raw as *const FullNode<V>)),
                (Kind::Binary, true) => NodeRef::BinaryLeaf(&*(raw as *const BinaryLeaf<V>)),
                (Kind::List, true) => NodeRef::ListLeaf(&*(raw as *const ListLeaf<V>)),
                (Kind::Pop, true) => NodeRef::PopLeaf(&*(raw as *const PopLeaf<V>)),
                (Kind::Full, true) => NodeRef::FullLeaf(&*(raw as *const FullLeaf<V>)),
            }
        }
    }
}

/// A child pointer slot: one machine word, acquire/release on every access.
#[repr(C)]
pub(crate) struct ChildSlot<V> {
    ptr: AtomicPtr<u8>,
    _marker: PhantomData<*mut V>,
}

impl<V> ChildSlot<V> {
    pub fn null() -> Self {
        ChildSlot {
            ptr: AtomicPtr::new(std::ptr::null_mut()),
            _marker: PhantomData,
        }
    }

    pub fn new(node: NodePtr<V>) -> Self {
        ChildSlot {
            ptr: AtomicPtr::new(node.as_raw().as_ptr()),
            _marker: PhantomData,
        }
    }

    pub fn load(&self) -> Option<NodePtr<V>> {
        NonNull::new(self.ptr.load(Ordering::Acquire)).map(NodePtr::from_raw)
    }

    pub fn store(&self, node: Option<NodePtr<V>>) {
        let raw = node.map_or(std::ptr::null_mut(), |n| n.as_raw().as_ptr());
        self.ptr.store(raw, Ordering::Release);
    }
}

// ---------------------------------------------------------------------------
// Layouts
// ---------------------------------------------------------------------------

/// A value under a skip string: the terminal form of a path-compressed
/// single-key suffix. The skip may be empty (the key ends right at the
/// node's entry), in which case the SKIP flag is unset.
#[repr(C)]
pub(crate) struct SkipLeaf<V> {
    pub header: Header,
    pub skip: Box<[u8]>,
    pub value: DataCell<V>,
}

/// An interior branch node of any of the four shapes.
#[repr(C)]
pub(crate) struct Branch<V, X, const N: usize> {
    pub header: Header,
    pub skip: Box<[u8]>,
    /// Value for the key ending at the node's entry, before the skip.
    pub eos: DataCell<V>,
    /// Value for the key ending at the end of the skip.
    pub skip_eos: DataCell<V>,
    pub index: X,
    pub children: [ChildSlot<V>; N],
}

/// A branch node whose slots hold values inline: the last level of a
/// fixed-length-key trie. Carries no EOS cells; termination is encoded by
/// presence in the index.
#[repr(C)]
pub(crate) struct LeafBranch<V, X, const N: usize> {
    pub header: Header,
    pub skip: Box<[u8]>,
    pub index: X,
    pub cells: [DataCell<V>; N],
}

pub(crate) type BinaryNode<V> = Branch<V, AtomicChars, 2>;
pub(crate) type ListNode<V> = Branch<V, AtomicChars, 7>;
pub(crate) type PopNode<V> = Branch<V, AtomicBits<false>, 32>;
pub(crate) type FullNode<V> = Branch<V, AtomicBits<true>, 256>;
pub(crate) type BinaryLeaf<V> = LeafBranch<V, AtomicChars, 2>;
pub(crate) type ListLeaf<V> = LeafBranch<V, AtomicChars, 7>;
pub(crate) type PopLeaf<V> = LeafBranch<V, AtomicBits<false>, 32>;
pub(crate) type FullLeaf<V> = LeafBranch<V, AtomicBits<true>, 256>;

/// Typed view of a node, reconstructed from the header tag.
pub(crate) enum NodeRef<'a, V> {
    SkipLeaf(&'a SkipLeaf<V>),
    Binary(&'a BinaryNode<V>),
    List(&'a ListNode<V>),
    Pop(&'a PopNode<V>),
    Full(&'a FullNode<V>),
    BinaryLeaf(&'a BinaryLeaf<V>),
    ListLeaf(&'a ListLeaf<V>),
    PopLeaf(&'a PopLeaf<V>),
    FullLeaf(&'a FullLeaf<V>),
}

/// Where a branch character leads: a further node, an inline value cell,
/// or nowhere.
pub(crate) enum ChildRef<'a, V> {
    Node(NodePtr<V>),
    Cell(&'a DataCell<V>),
    Missing,
}

/// Runs `$body` with `$b` bound to the concrete interior branch reference.
macro_rules! with_interior {
    ($view:expr, |$b:ident| $body:expr, else $fallback:expr) => {
        match $view {
            NodeRef::Binary($b) => $body,
            NodeRef::List($b) => $body,
            NodeRef::Pop($b) => $body,
            NodeRef::Full($b) => $body,
            _ => $fallback,
        }
    };
}

/// Runs `$body` with `$l` bound to the concrete leaf branch reference.
macro_rules! with_leaf {
    ($view:expr, |$l:ident| $body:expr, else $fallback:expr) => {
        match $view {
            NodeRef::BinaryLeaf($l) => $body,
            NodeRef::ListLeaf($l) => $body,
            NodeRef::PopLeaf($l) => $body,
            NodeRef::FullLeaf($l) => $body,
            _ => $fallback,
        }
    };
}

pub(crate) use with_interior;
pub(crate) use with_leaf;

impl<'a, V> NodeRef<'a, V> {
    pub fn skip(&self) -> &'a [u8] {
        match self {
            NodeRef::SkipLeaf(n) => &n.skip,
            NodeRef::Binary(n) => &n.skip,
            NodeRef::List(n) => &n.skip,
            NodeRef::Pop(n) => &n.skip,
            NodeRef::Full(n) => &n.skip,
            NodeRef::BinaryLeaf(n) => &n.skip,
            NodeRef::ListLeaf(n) => &n.skip,
            NodeRef::PopLeaf(n) => &n.skip,
            NodeRef::FullLeaf(n) => &n.skip,
        }
    }

    pub fn eos_cell(&self) -> Option<&'a DataCell<V>> {
        with_interior!(self, |b| Some(&b.eos), else None)
    }

    pub fn skip_eos_cell(&self) -> Option<&'a DataCell<V>> {
        match self {
            NodeRef::SkipLeaf(n) => Some(&n.value),
            other => with_interior!(other, |b| Some(&b.skip_eos), else None),
        }
    }

    pub fn child_count(&self) -> usize {
        with_interior!(self, |b| b.index.load().count(),
            else with_leaf!(self, |l| l.index.load().count(), else 0))
    }

    /// Locates the child (or inline cell) for branch character `c`.
    pub fn find_child(&self, c: u8) -> ChildRef<'a, V> {
        with_interior!(self, |b| {
            match b.index.load().slot_of(c) {
                Some(slot) => match b.children[slot].load() {
                    Some(node) => ChildRef::Node(node),
                    None => ChildRef::Missing,
                },
                None => ChildRef::Missing,
            }
        },
        else with_leaf!(self, |l| {
            match l.index.load().slot_of(c) {
                Some(slot) => ChildRef::Cell(&l.cells[slot]),
                None => ChildRef::Missing,
            }
        }, else ChildRef::Missing))
    }

    /// Smallest branch character with its child, if any.
    pub fn first_child(&self) -> Option<(u8, ChildRef<'a, V>)> {
        with_interior!(self, |b| {
            let (c, slot) = IndexSnap::first(b.index.load())?;
            match b.children[slot].load() {
                Some(node) => Some((c, ChildRef::Node(node))),
                None => Some((c, ChildRef::Missing)),
            }
        },
        else with_leaf!(self, |l| {
            let (c, slot) = IndexSnap::first(l.index.load())?;
            Some((c, ChildRef::Cell(&l.cells[slot])))
        }, else None))
    }

    /// Smallest branch character strictly greater than `c`, with its child.
    pub fn child_above(&self, c: u8) -> Option<(u8, ChildRef<'a, V>)> {
        with_interior!(self, |b| {
            let (next, slot) = b.index.load().above(c)?;
            match b.children[slot].load() {
                Some(node) => Some((next, ChildRef::Node(node))),
                None => Some((next, ChildRef::Missing)),
            }
        },
        else with_leaf!(self, |l| {
            let (next, slot) = l.index.load().above(c)?;
            Some((next, ChildRef::Cell(&l.cells[slot])))
        }, else None))
    }
}

// ---------------------------------------------------------------------------
// Writer-side helpers on concrete branches
// ---------------------------------------------------------------------------

impl<V, X: BranchIndex, const N: usize> Branch<V, X, N> {
    /// Collects `(char, child)` pairs in ascending character order,
    /// skipping slots whose pointer was detached.
    ///
    /// # Safety
    ///
    /// Writer-side only: must run under the writer mutex.
    pub unsafe fn entries(&self) -> SmallVec<[(u8, NodePtr<V>); 8]> {
        let mut out = SmallVec::new();
        self.index.load().for_each(|c, slot| {
            if let Some(child) = self.children[slot].load() {
                out.push((c, child));
            }
        });
        out
    }
}

impl<V: Clone, X: BranchIndex, const N: usize> LeafBranch<V, X, N> {
    /// Clones out `(char, value)` pairs in ascending character order,
    /// skipping cells already cleared.
    ///
    /// # Safety
    ///
    /// Writer-side only: must run under the writer mutex.
    pub unsafe fn entries(&self) -> SmallVec<[(u8, V); 8]> {
        let mut out = SmallVec::new();
        self.index.load().for_each(|c, slot| {
            if let Some(value) = self.cells[slot].writer_peek() {
                out.push((c, value.clone()));
            }
        });
        out
    }
}

// ---------------------------------------------------------------------------
// Builders
// ---------------------------------------------------------------------------

fn band_hint_flags(kind: Kind, count: usize) -> u64 {
    let mut flags = 0;
    if count == band_floor(kind) {
        flags |= FLOOR;
    }
    if count == band_ceil(kind) {
        flags |= CEIL;
    }
    flags
}

/// Builds a skip-leaf for a single key suffix. The node is poisoned until
/// linked.
pub(crate) fn build_skip_leaf<V>(skip: &[u8], value: V) -> NodePtr<V> {
    let mut flags = LEAF | POISONED;
    flags |= if skip.is_empty() { EOS } else { SKIP | SKIP_EOS };
    NodePtr::from_box(Box::new(SkipLeaf {
        header: Header::new(HeaderBits::new(Kind::SkipLeaf, flags)),
        skip: skip.into(),
        value: DataCell::new_with(value),
    }))
}

fn build_interior_as<V, X: BranchIndex, const N: usize>(
    kind: Kind,
    skip: &[u8],
    eos: Option<V>,
    skip_eos: Option<V>,
    entries: &[(u8, NodePtr<V>)],
) -> NodePtr<V> {
    debug_assert!(entries.len() <= N);
    debug_assert!(entries.windows(2).all(|w| w[0].0 < w[1].0));
    debug_assert!(skip_eos.is_none() || !skip.is_empty());

    let mut flags = POISONED | band_hint_flags(kind, entries.len());
    if !skip.is_empty() {
        flags |= SKIP;
    }
    if eos.is_some() {
        flags |= EOS;
    }
    if skip_eos.is_some() {
        flags |= SKIP_EOS;
    }

    let mut node = Box::new(Branch::<V, X, N> {
        header: Header::new(HeaderBits::new(kind, flags)),
        skip: skip.into(),
        eos: eos.map_or_else(DataCell::new_empty, DataCell::new_with),
        skip_eos: skip_eos.map_or_else(DataCell::new_empty, DataCell::new_with),
        index: X::new_empty(),
        children: std::array::from_fn(|_| ChildSlot::null()),
    });

    let mut snap = node.index.load();
    for &(c, child) in entries {
        let (next, slot) = snap.with_added(c);
        snap = next;
        // Linking a freshly built child into a parent ends its speculative
        // life even though the parent itself is not published yet.
        child.header().clear_poisoned();
        node.children[slot] = ChildSlot::new(child);
    }
    node.index.store(snap);
    NodePtr::from_box(node)
}

/// Builds an interior node of the band shape matching the entry count.
/// `entries` must be sorted ascending by character and non-empty.
pub(crate) fn build_interior<V>(
    skip: &[u8],
    eos: Option<V>,
    skip_eos: Option<V>,
    entries: &[(u8, NodePtr<V>)],
) -> NodePtr<V> {
    match kind_for_count(entries.len()) {
        Kind::Binary => build_interior_as::<V, AtomicChars, 2>(Kind::Binary, skip, eos, skip_eos, entries),
        Kind::List => build_interior_as::<V, AtomicChars, 7>(Kind::List, skip, eos, skip_eos, entries),
        Kind::Pop => build_interior_as::<V, AtomicBits<false>, 32>(Kind::Pop, skip, eos, skip_eos, entries),
        Kind::Full => build_interior_as::<V, AtomicBits<true>, 256>(Kind::Full, skip, eos, skip_eos, entries),
        Kind::SkipLeaf => unreachable!("interior nodes have at least one child"),
    }
}

fn build_leaf_as<V, X: BranchIndex, const N: usize>(
    kind: Kind,
    skip: &[u8],
    entries: SmallVec<[(u8, V); 8]>,
) -> NodePtr<V> {
    debug_assert!(entries.len() <= N);
    debug_assert!(entries.windows(2).all(|w| w[0].0 < w[1].0));

    let mut flags = LEAF | POISONED | band_hint_flags(kind, entries.len());
    if !skip.is_empty() {
        flags |= SKIP;
    }

    let mut node = Box::new(LeafBranch::<V, X, N> {
        header: Header::new(HeaderBits::new(kind, flags)),
        skip: skip.into(),
        index: X::new_empty(),
        cells: std::array::from_fn(|_| DataCell::new_empty()),
    });

    let mut snap = node.index.load();
    for (c, value) in entries {
        let (next, slot) = snap.with_added(c);
        snap = next;
        node.cells[slot] = DataCell::new_with(value);
    }
    node.index.store(snap);
    NodePtr::from_box(node)
}

/// Builds a leaf branch of the band shape matching the entry count.
/// `entries` must be sorted ascending by character and non-empty.
pub(crate) fn build_leaf<V>(skip: &[u8], entries: SmallVec<[(u8, V); 8]>) -> NodePtr<V> {
    match kind_for_count(entries.len()) {
        Kind::Binary => build_leaf_as::<V, AtomicChars, 2>(Kind::Binary, skip, entries),
        Kind::List => build_leaf_as::<V, AtomicChars, 7>(Kind::List, skip, entries),
        Kind::Pop => build_leaf_as::<V, AtomicBits<false>, 32>(Kind::Pop, skip, entries),
        Kind::Full => build_leaf_as::<V, AtomicBits<true>, 256>(Kind::Full, skip, entries),
        Kind::SkipLeaf => unreachable!("leaf branches have at least one entry"),
    }
}

// ---------------------------------------------------------------------------
// Deleter
// ---------------------------------------------------------------------------

/// Frees a single node allocation. Children are not touched; the caller is
/// responsible for their ownership.
///
/// # Safety
///
/// `node` must be a live allocation produced by one of the builders, no
/// longer reachable by any reader.
pub(crate) unsafe fn free_node<V>(node: NodePtr<V>) {
    let bits = node.header().load();
    let raw = node.as_raw().as_ptr();
    match (bits.kind(), bits.is_leaf()) {
        (Kind::SkipLeaf, _) => drop(Box::from_raw(raw as *mut SkipLeaf<V>)),
        (Kind::Binary, false) => drop(Box::from_raw(raw as *mut BinaryNode<V>)),
        (Kind::List, false) => drop(Box::from_raw(raw as *mut ListNode<V>)),
        (Kind::Pop, false) => drop(Box::from_raw(raw as *mut PopNode<V>)),
        (Kind::Full, false) => drop(Box::from_raw(raw as *mut FullNode<V>)),
        (Kind::Binary, true) => drop(Box::from_raw(raw as *mut BinaryLeaf<V>)),
        (Kind::List, true) => drop(Box::from_raw(raw as *mut ListLeaf<V>)),
        (Kind::Pop, true) => drop(Box::from_raw(raw as *mut PopLeaf<V>)),
        (Kind::Full, true) => drop(Box::from_raw(raw as *mut FullLeaf<V>)),
    }
}

/// Frees a whole unreachable subtree, children first.
///
/// # Safety
///
/// As [`free_node`], and the subtree must exclusively own all its children.
pub(crate) unsafe fn free_subtree<V>(node: NodePtr<V>) {
    with_interior!(&node.view(), |b| {
        b.index.load().for_each(|_, slot| {
            if let Some(child) = b.children[slot].load() {
                free_subtree(child);
            }
        });
    }, else ());
    free_node(node);
}

/// Type-erased deleters for the retire lists.
pub(crate) unsafe fn free_node_erased<V>(raw: NonNull<u8>) {
    free_node(NodePtr::<V>::from_raw(raw));
}

pub(crate) unsafe fn free_subtree_erased<V>(raw: NonNull<u8>) {
    free_subtree(NodePtr::<V>::from_raw(raw));
}

#[cfg(test)]
mod tests {
    use super::cell::CellRead;
    use super::*;
    use smallvec::smallvec;

    #[test]
    fn skip_leaf_view_exposes_value() {
        let node = build_skip_leaf(b"abc", 7u32);
        match node.view() {
            NodeRef::SkipLeaf(leaf) => {
                assert_eq!(&*leaf.skip, b"abc");
                assert_eq!(leaf.value.try_read(), CellRead::Value(7));
            }
            _ => panic!("expected a skip leaf"),
        }
        let bits = node.header().load();
        assert!(bits.is_leaf());
        assert!(bits.has_skip());
        assert!(bits.is_poisoned());
        unsafe { free_node(node) };
    }

    #[test]
    fn interior_builder_picks_the_band_shape() {
        let mut children = Vec::new();
        for c in 0u8..40 {
            children.push((c, build_skip_leaf(b"", c as u32)));
        }
        for (count, kind) in [(1, Kind::Binary), (2, Kind::Binary), (3, Kind::List),
                              (7, Kind::List), (8, Kind::Pop), (32, Kind::Pop), (33, Kind::Full)] {
            let node = build_interior::<u32>(b"", None, None, &children[..count]);
            assert_eq!(node.header().load().kind(), kind);
            assert_eq!(node.view().child_count(), count);
            unsafe { free_node(node) };
        }
        for (_, child) in children {
            unsafe { free_node(child) };
        }
    }

    #[test]
    fn find_child_resolves_each_shape() {
        let chars = [3u8, 9, 17, 40, 77, 130, 200, 201, 202];
        let children: Vec<(u8, NodePtr<u32>)> = chars
            .iter()
            .map(|&c| (c, build_skip_leaf(b"", c as u32)))
            .collect();
        let node = build_interior::<u32>(b"", None, None, &children);
        assert_eq!(node.header().load().kind(), Kind::Pop);
        for &c in &chars {
            assert!(matches!(node.view().find_child(c), ChildRef::Node(_)));
        }
        assert!(matches!(node.view().find_child(4), ChildRef::Missing));
        unsafe { free_subtree(node) };
    }

    #[test]
    fn leaf_builder_stores_values_inline() {
        let entries: SmallVec<[(u8, u32); 8]> = smallvec![(1, 10), (2, 20), (9, 90)];
        let node = build_leaf(b"xy", entries);
        assert_eq!(node.header().load().kind(), Kind::List);
        match node.view().find_child(2) {
            ChildRef::Cell(cell) => assert_eq!(cell.try_read(), CellRead::Value(20)),
            _ => panic!("expected an inline cell"),
        }
        unsafe { free_node(node) };
    }

    #[test]
    fn child_above_walks_in_ascending_order() {
        let chars = [5u8, 60, 200];
        let children: Vec<(u8, NodePtr<u32>)> = chars
            .iter()
            .map(|&c| (c, build_skip_leaf(b"", 0u32)))
            .collect();
        let node = build_interior::<u32>(b"", None, None, &children);
        let view = node.view();
        let (first, _) = view.first_child().unwrap();
        assert_eq!(first, 5);
        let (next, _) = view.child_above(5).unwrap();
        assert_eq!(next, 60);
        let (next, _) = view.child_above(60).unwrap();
        assert_eq!(next, 200);
        assert!(view.child_above(200).is_none());
        unsafe { free_subtree(node) };
    }
}
