//! Optimistic-read value cells.
//!
//! A cell holds a value slot and a control word combining a writer bit, a
//! reader-presence count, a has-value bit and a sequence counter. The
//! serialized writer announces itself with the writer bit, waits out
//! readers already copying, rewrites the slot and bumps the sequence.
//! Readers spin briefly on the writer bit, announce themselves, clone the
//! value and then verify that the sequence did not move; a moved sequence
//! means the copy may be mixed state and the whole operation restarts from
//! the root.

use std::cell::UnsafeCell;
use std::hint::spin_loop;
use std::mem::MaybeUninit;
use std::sync::atomic::{AtomicU64, Ordering};

const WRITE: u64 = 1;
const READER_ONE: u64 = 1 << 1;
const READER_MASK: u64 = 0xFF << 1;
const HAS: u64 = 1 << 9;
const SEQ_ONE: u64 = 1 << 10;

/// How long a reader spins on the writer bit before giving up and
/// reporting interference.
const SPIN_LIMIT: u32 = 128;

/// Outcome of an optimistic cell read.
#[derive(Debug, PartialEq, Eq)]
pub(crate) enum CellRead<T> {
    /// A consistent copy of the stored value.
    Value(T),
    /// The cell verifiably held no value.
    Empty,
    /// A writer overlapped the read; restart from the root.
    Interference,
}

/// A value slot guarded by the optimistic-read protocol.
#[repr(C)]
pub(crate) struct DataCell<V> {
    ctrl: AtomicU64,
    slot: UnsafeCell<MaybeUninit<V>>,
}

unsafe impl<V: Send + Sync> Sync for DataCell<V> {}
unsafe impl<V: Send> Send for DataCell<V> {}

impl<V> DataCell<V> {
    pub fn new_empty() -> Self {
        DataCell {
            ctrl: AtomicU64::new(0),
            slot: UnsafeCell::new(MaybeUninit::uninit()),
        }
    }

    pub fn new_with(value: V) -> Self {
        DataCell {
            ctrl: AtomicU64::new(HAS),
            slot: UnsafeCell::new(MaybeUninit::new(value)),
        }
    }

    /// Whether the cell currently holds a value. Only meaningful on the
    /// writer side; readers must go through [`DataCell::try_read`].
    pub fn has_value(&self) -> bool {
        self.ctrl.load(Ordering::Relaxed) & HAS != 0
    }

    /// Writer-side store. Serialized by the container's writer mutex.
    pub fn write(&self, value: V) {
        let prior = self.begin_write();
        unsafe {
            let slot = &mut *self.slot.get();
            if prior & HAS != 0 {
                slot.assume_init_drop();
            }
            slot.write(value);
        }
        self.end_write(|ctrl| ctrl | HAS);
    }

    /// Writer-side removal of the stored value, if any.
    pub fn clear(&self) {
        let prior = self.begin_write();
        if prior & HAS != 0 {
            unsafe { (*self.slot.get()).assume_init_drop() };
        }
        self.end_write(|ctrl| ctrl & !HAS);
    }

    /// Borrow of the stored value for the writer's own use (COW copies).
    ///
    /// # Safety
    ///
    /// Must only be called under the writer mutex: nothing else may rewrite
    /// the slot while the borrow is live.
    pub unsafe fn writer_peek(&self) -> Option<&V> {
        if self.ctrl.load(Ordering::Relaxed) & HAS != 0 {
            Some((*self.slot.get()).assume_init_ref())
        } else {
            None
        }
    }

    fn begin_write(&self) -> u64 {
        let prior = self.ctrl.fetch_or(WRITE, Ordering::Acquire);
        debug_assert_eq!(prior & WRITE, 0, "writers are serialized");
        // Readers that announced themselves before the writer bit landed may
        // still be copying the old value; wait until they drain. New readers
        // observe the bit and back off.
        while self.ctrl.load(Ordering::Acquire) & READER_MASK != 0 {
            spin_loop();
        }
        prior
    }

    fn end_write(&self, apply: impl Fn(u64) -> u64) {
        // The reader count can tick while we were writing (announce then
        // immediately retreat), so the final control word must be published
        // with an RMW rather than a plain store.
        self.ctrl
            .fetch_update(Ordering::Release, Ordering::Relaxed, |ctrl| {
                Some(apply(ctrl & !WRITE).wrapping_add(SEQ_ONE))
            })
            .expect("fetch_update with Some never fails");
    }

    /// Optimistically read the stored value.
    pub fn try_read(&self) -> CellRead<V>
    where
        V: Clone,
    {
        match self.read_with(|slot| unsafe { slot.assume_init_ref().clone() }) {
            Some(read) => read,
            None => CellRead::Interference,
        }
    }

    /// Like [`DataCell::try_read`] but only probes for presence, so it does
    /// not require `V: Clone`.
    pub fn try_probe(&self) -> CellRead<()> {
        match self.read_with(|_| ()) {
            Some(read) => read,
            None => CellRead::Interference,
        }
    }

    fn read_with<T>(&self, copy: impl FnOnce(&MaybeUninit<V>) -> T) -> Option<CellRead<T>> {
        let mut ctrl = self.ctrl.load(Ordering::Acquire);
        let mut spins = 0;
        while ctrl & WRITE != 0 {
            if spins == SPIN_LIMIT {
                return None;
            }
            spins += 1;
            spin_loop();
            ctrl = self.ctrl.load(Ordering::Acquire);
        }
        if ctrl & HAS == 0 {
            return Some(CellRead::Empty);
        }
        let announced = self.ctrl.fetch_add(READER_ONE, Ordering::Acquire);
        if announced & WRITE != 0 {
            self.ctrl.fetch_sub(READER_ONE, Ordering::Release);
            return None;
        }
        let value = copy(unsafe { &*self.slot.get() });
        self.ctrl.fetch_sub(READER_ONE, Ordering::Release);
        let verify = self.ctrl.load(Ordering::Acquire);
        if (verify & !READER_MASK) != (ctrl & !READER_MASK) {
            return None;
        }
        Some(CellRead::Value(value))
    }
}

impl<V> Drop for DataCell<V> {
    fn drop(&mut self) {
        if *self.ctrl.get_mut() & HAS != 0 {
            unsafe { self.slot.get_mut().assume_init_drop() };
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_cell_reads_empty() {
        let cell: DataCell<u32> = DataCell::new_empty();
        assert_eq!(cell.try_read(), CellRead::Empty);
        assert!(!cell.has_value());
    }

    #[test]
    fn write_then_read_round_trips() {
        let cell = DataCell::new_empty();
        cell.write(7u32);
        assert_eq!(cell.try_read(), CellRead::Value(7));
        cell.write(8);
        assert_eq!(cell.try_read(), CellRead::Value(8));
    }

    #[test]
    fn clear_empties_the_cell() {
        let cell = DataCell::new_with(String::from("x"));
        cell.clear();
        assert_eq!(cell.try_read(), CellRead::Empty);
        cell.clear();
        assert_eq!(cell.try_read(), CellRead::Empty);
    }

    #[test]
    fn drop_releases_stored_value() {
        use std::sync::Arc;
        let tracked = Arc::new(());
        {
            let cell = DataCell::new_with(Arc::clone(&tracked));
            assert!(cell.has_value());
        }
        assert_eq!(Arc::strong_count(&tracked), 1);
    }

    #[test]
    fn sequence_moves_on_every_write() {
        let cell = DataCell::new_empty();
        let before = cell.ctrl.load(Ordering::Relaxed);
        cell.write(1u8);
        cell.clear();
        let after = cell.ctrl.load(Ordering::Relaxed);
        assert_eq!((after - before) / SEQ_ONE, 2);
    }
}
