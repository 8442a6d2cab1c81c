use std::{
    cell::UnsafeCell,
    sync::atomic::{AtomicU8, Ordering},
};

/// What a committed log slot describes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum EventKind {
    Allocation = 1,
    Deallocation = 2,
}

const EMPTY: u8 = 0;

/// A log slot written once by the thread that reserved it and read after it is committed.
pub(crate) struct LogSlot<T> {
    state: AtomicU8,
    value: UnsafeCell<T>,
}
unsafe impl<T: Send> Send for LogSlot<T> {}
unsafe impl<T: Send> Sync for LogSlot<T> {}

impl<T> LogSlot<T> {
    pub(crate) const fn new(value: T) -> Self {
        LogSlot {
            state: AtomicU8::new(EMPTY),
            value: UnsafeCell::new(value),
        }
    }

    /// Fill the slot and publish it.
    ///
    /// # Safety
    ///
    /// The caller must own the slot: its index was reserved by this thread and the slot
    /// has not been committed since the last [`LogSlot::clear`].
    pub(crate) unsafe fn commit(&self, kind: EventKind, fill: impl FnOnce(&mut T)) {
        fill(unsafe { &mut *self.value.get() });
        self.state.store(kind as u8, Ordering::Release);
    }

    /// The committed event, or `None` if the slot is still being written.
    pub(crate) fn read(&self) -> Option<(EventKind, &T)> {
        let kind = match self.state.load(Ordering::Acquire) {
            1 => EventKind::Allocation,
            2 => EventKind::Deallocation,
            _ => return None,
        };
        // Safety: committed slots are not written again until cleared.
        Some((kind, unsafe { &*self.value.get() }))
    }

    /// Mark the slot as free. Only called while no thread is logging.
    pub(crate) fn clear(&self) {
        self.state.store(EMPTY, Ordering::Release);
    }
}
