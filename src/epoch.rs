//! Epoch-based reclamation of unlinked nodes.
//!
//! The writer never frees a node it unlinks directly: readers may still
//! hold pointers into the replaced subtree. Instead the node is retired
//! into a list keyed by the current global epoch, and freed once every
//! reader observed in that epoch has left. Readers announce themselves by
//! claiming a cache-line-padded slot carrying {active, epoch}; the writer
//! computes the minimum epoch over the active slots and releases every
//! retirement strictly older than it.

use std::ptr::NonNull;

/// A node (or whole subtree) awaiting reclamation.
pub(crate) struct Retired {
    ptr: NonNull<u8>,
    free: unsafe fn(NonNull<u8>),
}

// The pointee is unreachable by new readers; ownership moved into the list.
unsafe impl Send for Retired {}

impl Retired {
    /// # Safety
    ///
    /// `ptr` must be exclusively owned by the retire list from now on and
    /// `free` must be the matching deleter.
    pub unsafe fn new(ptr: NonNull<u8>, free: unsafe fn(NonNull<u8>)) -> Retired {
        Retired { ptr, free }
    }

    unsafe fn release(self) {
        (self.free)(self.ptr);
    }
}

#[cfg(feature = "threaded")]
mod imp {
    use super::Retired;
    use crossbeam_utils::CachePadded;
    use std::sync::atomic::{fence, AtomicU64, Ordering};

    const SLOT_COUNT: usize = 64;
    const ACTIVE: u64 = 1 << 63;
    const EPOCH_MASK: u64 = ACTIVE - 1;
    /// Current-list length past which the writer tries to advance the epoch.
    const ADVANCE_THRESHOLD: usize = 64;

    /// Shared reclamation state: the global epoch and the reader slots.
    pub(crate) struct EpochDomain {
        global: AtomicU64,
        slots: Box<[CachePadded<AtomicU64>]>,
    }

    impl EpochDomain {
        pub fn new() -> Self {
            EpochDomain {
                global: AtomicU64::new(1),
                slots: (0..SLOT_COUNT)
                    .map(|_| CachePadded::new(AtomicU64::new(0)))
                    .collect(),
            }
        }

        /// Claims a reader slot for the duration of one read operation.
        ///
        /// The epoch is read once before the claim and once after a full
        /// fence; if the writer advanced in between, the slot is refreshed
        /// so the published epoch is never older than what the traversal
        /// can observe.
        pub fn enter(&self) -> EpochGuard<'_> {
            loop {
                for slot in self.slots.iter() {
                    let epoch = self.global.load(Ordering::Relaxed);
                    if slot
                        .compare_exchange(0, ACTIVE | epoch, Ordering::AcqRel, Ordering::Relaxed)
                        .is_ok()
                    {
                        fence(Ordering::SeqCst);
                        let fresh = self.global.load(Ordering::Relaxed);
                        if fresh != epoch {
                            slot.store(ACTIVE | fresh, Ordering::Release);
                            fence(Ordering::SeqCst);
                        }
                        return EpochGuard { slot };
                    }
                }
                // Every slot is taken by a concurrent reader; they are
                // short-lived, so yield rather than grow.
                std::thread::yield_now();
            }
        }

        pub fn global_epoch(&self) -> u64 {
            self.global.load(Ordering::Acquire)
        }

        fn advance(&self, from: u64) {
            let _ = self
                .global
                .compare_exchange(from, from + 1, Ordering::AcqRel, Ordering::Relaxed);
        }

        fn min_active_epoch(&self) -> u64 {
            let mut min = self.global.load(Ordering::Acquire);
            for slot in self.slots.iter() {
                let state = slot.load(Ordering::Acquire);
                if state & ACTIVE != 0 {
                    min = min.min(state & EPOCH_MASK);
                }
            }
            min
        }
    }

    /// An active reader registration; leaving drops the slot claim.
    pub(crate) struct EpochGuard<'a> {
        slot: &'a CachePadded<AtomicU64>,
    }

    impl Drop for EpochGuard<'_> {
        fn drop(&mut self) {
            self.slot.store(0, Ordering::Release);
        }
    }

    /// Per-epoch retirement lists. Only touched under the writer mutex.
    pub(crate) struct RetireLists {
        lists: [(u64, Vec<Retired>); 3],
    }

    impl RetireLists {
        pub fn new() -> Self {
            RetireLists {
                lists: [(0, Vec::new()), (0, Vec::new()), (0, Vec::new())],
            }
        }

        pub fn retire(&mut self, domain: &EpochDomain, retired: Retired) {
            let epoch = domain.global_epoch();
            let entry = &mut self.lists[(epoch % 3) as usize];
            debug_assert!(entry.1.is_empty() || entry.0 == epoch);
            entry.0 = epoch;
            entry.1.push(retired);
        }

        /// Frees every retirement no active reader can still observe, then
        /// advances the epoch if the current list has grown past the
        /// threshold and the next slot is clear.
        pub fn collect(&mut self, domain: &EpochDomain) {
            let min_active = domain.min_active_epoch();
            for (tag, list) in &mut self.lists {
                if *tag < min_active {
                    for retired in list.drain(..) {
                        unsafe { retired.release() };
                    }
                }
            }

            let epoch = domain.global_epoch();
            let current = &self.lists[(epoch % 3) as usize];
            let next = &self.lists[((epoch + 1) % 3) as usize];
            if current.1.len() > ADVANCE_THRESHOLD && next.1.is_empty() {
                domain.advance(epoch);
            }
        }

        /// Frees everything unconditionally. Only sound with exclusive
        /// access to the container (teardown).
        pub fn drain_all(&mut self) {
            for (_, list) in &mut self.lists {
                for retired in list.drain(..) {
                    unsafe { retired.release() };
                }
            }
        }
    }
}

#[cfg(not(feature = "threaded"))]
mod imp {
    use super::Retired;

    /// Single-threaded variant: no reader tracking is needed, so guards
    /// are free and retirement frees eagerly.
    pub(crate) struct EpochDomain;

    impl EpochDomain {
        pub fn new() -> Self {
            EpochDomain
        }

        pub fn enter(&self) -> EpochGuard<'_> {
            EpochGuard {
                _domain: std::marker::PhantomData,
            }
        }
    }

    pub(crate) struct EpochGuard<'a> {
        _domain: std::marker::PhantomData<&'a EpochDomain>,
    }

    pub(crate) struct RetireLists;

    impl RetireLists {
        pub fn new() -> Self {
            RetireLists
        }

        pub fn retire(&mut self, _domain: &EpochDomain, retired: Retired) {
            unsafe { retired.release() };
        }

        pub fn collect(&mut self, _domain: &EpochDomain) {}

        pub fn drain_all(&mut self) {}
    }
}

pub(crate) use imp::{EpochDomain, EpochGuard, RetireLists};

#[cfg(all(test, feature = "threaded"))]
mod tests {
    use super::*;
    use std::cell::Cell;

    thread_local! {
        static FREED: Cell<usize> = const { Cell::new(0) };
    }

    fn freed() -> usize {
        FREED.with(|count| count.get())
    }

    unsafe fn count_free(ptr: std::ptr::NonNull<u8>) {
        FREED.with(|count| count.set(count.get() + 1));
        drop(Box::from_raw(ptr.as_ptr()));
    }

    fn retired_byte() -> Retired {
        let raw = Box::into_raw(Box::new(0u8));
        unsafe { Retired::new(std::ptr::NonNull::new_unchecked(raw), count_free) }
    }

    #[test]
    fn idle_domain_reclaims_immediately() {
        let domain = EpochDomain::new();
        let mut lists = RetireLists::new();
        lists.retire(&domain, retired_byte());
        // The retirement epoch equals the global epoch, so one advance is
        // needed before min_active can pass it.
        lists.collect(&domain);
        assert_eq!(freed(), 0);
        for _ in 0..80 {
            lists.retire(&domain, retired_byte());
        }
        lists.collect(&domain); // grows past the threshold and advances
        lists.collect(&domain); // now strictly older than min_active
        assert_eq!(freed(), 81);
    }

    #[test]
    fn active_reader_blocks_reclamation() {
        let domain = EpochDomain::new();
        let mut lists = RetireLists::new();
        let guard = domain.enter();
        for _ in 0..80 {
            lists.retire(&domain, retired_byte());
        }
        lists.collect(&domain);
        lists.collect(&domain);
        assert_eq!(freed(), 0);
        drop(guard);
        lists.collect(&domain);
        assert_eq!(freed(), 80);
    }

    #[test]
    fn drain_all_frees_everything() {
        let domain = EpochDomain::new();
        let mut lists = RetireLists::new();
        for _ in 0..5 {
            lists.retire(&domain, retired_byte());
        }
        lists.drain_all();
        assert_eq!(freed(), 5);
    }
}
