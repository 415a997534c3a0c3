//! Packed node header word.
//!
//! The header is the single source of truth for interpreting a node: the
//! top bits carry the value-position flags and the physical kind, the low
//! 48 bits carry a version counter that the writer bumps before every
//! in-place mutation. Readers load the word with acquire semantics, pick a
//! child-finding algorithm from the kind, and re-check the version after
//! following a child slot to detect that they crossed a mutation window.

use std::sync::atomic::{AtomicU64, Ordering};

/// Child slots store values directly instead of child pointers.
pub(crate) const LEAF: u64 = 1 << 63;
/// The node carries an inline skip string (always non-empty when set).
pub(crate) const SKIP: u64 = 1 << 62;
/// A value is attached to the key terminating at the node's entry.
pub(crate) const EOS: u64 = 1 << 61;
/// A value is attached to the key terminating at the end of the skip.
pub(crate) const SKIP_EOS: u64 = 1 << 60;
/// Live entry count sits at the floor of the kind's branching band.
pub(crate) const FLOOR: u64 = 1 << 56;
/// Live entry count sits at the ceiling of the kind's branching band.
pub(crate) const CEIL: u64 = 1 << 55;
/// The node was built speculatively and is not linked yet.
pub(crate) const POISONED: u64 = 1 << 54;

const KIND_SHIFT: u32 = 57;
const KIND_MASK: u64 = 0b111 << KIND_SHIFT;
const VERSION_MASK: u64 = (1 << 48) - 1;

/// Physical layout of a node.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
#[repr(u8)]
pub(crate) enum Kind {
    /// A value under an inline skip string, no branching.
    SkipLeaf = 0,
    /// Up to 2 children behind a packed char list.
    Binary = 1,
    /// 3..=7 children behind a packed char list.
    List = 2,
    /// 8..=32 children behind a rank-indexed bitmap.
    Pop = 3,
    /// 33..=256 children behind direct-indexed slots.
    Full = 4,
}

impl Kind {
    fn from_bits(raw: u64) -> Kind {
        match raw {
            0 => Kind::SkipLeaf,
            1 => Kind::Binary,
            2 => Kind::List,
            3 => Kind::Pop,
            4 => Kind::Full,
            _ => unreachable!("invalid node kind"),
        }
    }
}

/// A decoded snapshot of the header word.
#[derive(Copy, Clone, PartialEq, Eq)]
pub(crate) struct HeaderBits(u64);

impl HeaderBits {
    pub fn new(kind: Kind, flags: u64) -> HeaderBits {
        debug_assert_eq!(flags & (KIND_MASK | VERSION_MASK), 0);
        HeaderBits(((kind as u64) << KIND_SHIFT) | flags)
    }

    pub fn kind(self) -> Kind {
        Kind::from_bits((self.0 & KIND_MASK) >> KIND_SHIFT)
    }

    pub fn version(self) -> u64 {
        self.0 & VERSION_MASK
    }

    pub fn is_leaf(self) -> bool {
        self.0 & LEAF != 0
    }

    pub fn has_skip(self) -> bool {
        self.0 & SKIP != 0
    }

    pub fn has_eos(self) -> bool {
        self.0 & EOS != 0
    }

    pub fn has_skip_eos(self) -> bool {
        self.0 & SKIP_EOS != 0
    }

    pub fn at_floor(self) -> bool {
        self.0 & FLOOR != 0
    }

    pub fn at_ceiling(self) -> bool {
        self.0 & CEIL != 0
    }

    pub fn is_poisoned(self) -> bool {
        self.0 & POISONED != 0
    }

    pub fn with(self, flags: u64) -> HeaderBits {
        HeaderBits(self.0 | flags)
    }

    pub fn without(self, flags: u64) -> HeaderBits {
        HeaderBits(self.0 & !flags)
    }

    fn bumped(self) -> HeaderBits {
        let version = (self.0 + 1) & VERSION_MASK;
        HeaderBits((self.0 & !VERSION_MASK) | version)
    }
}

/// The header word of a heap-allocated node.
///
/// Readers only ever load it; all stores happen under the writer mutex, so
/// plain load-modify-store is sufficient on the writer side.
#[repr(C)]
pub(crate) struct Header {
    bits: AtomicU64,
}

impl Header {
    pub fn new(bits: HeaderBits) -> Header {
        Header {
            bits: AtomicU64::new(bits.0),
        }
    }

    pub fn load(&self) -> HeaderBits {
        HeaderBits(self.bits.load(Ordering::Acquire))
    }

    /// Writer-side header rewrite. Bumps the version before applying `f` so
    /// a reader that overlaps the mutation observes the change.
    pub fn update(&self, f: impl FnOnce(HeaderBits) -> HeaderBits) {
        let current = HeaderBits(self.bits.load(Ordering::Relaxed));
        self.bits.store(f(current.bumped()).0, Ordering::Release);
    }

    /// Clears the speculative-construction mark prior to linking.
    pub fn clear_poisoned(&self) {
        let current = self.bits.load(Ordering::Relaxed);
        self.bits.store(current & !POISONED, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kind_round_trips() {
        for kind in [Kind::SkipLeaf, Kind::Binary, Kind::List, Kind::Pop, Kind::Full] {
            let bits = HeaderBits::new(kind, LEAF | SKIP);
            assert_eq!(bits.kind(), kind);
            assert!(bits.is_leaf());
            assert!(bits.has_skip());
            assert!(!bits.has_eos());
            assert_eq!(bits.version(), 0);
        }
    }

    #[test]
    fn update_bumps_version_and_applies_flags() {
        let header = Header::new(HeaderBits::new(Kind::Binary, 0));
        header.update(|bits| bits.with(EOS));
        let bits = header.load();
        assert_eq!(bits.version(), 1);
        assert!(bits.has_eos());
        header.update(|bits| bits.without(EOS));
        let bits = header.load();
        assert_eq!(bits.version(), 2);
        assert!(!bits.has_eos());
    }
}
