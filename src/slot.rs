use std::sync::atomic::{AtomicBool, Ordering};

use crate::wire::BUFFER_SLOT_SIZE;

/// A fixed-size reusable serialization buffer. The `in_use` flag is the only
/// synchronization between the thread filling the slot and the sink writer
/// holding a borrow of its bytes.
pub(crate) struct BufferSlot {
    in_use: AtomicBool,
    used: usize,
    data: Box<[u8]>,
}

impl BufferSlot {
    fn new() -> BufferSlot {
        BufferSlot {
            in_use: AtomicBool::new(false),
            used: 0,
            data: vec![0u8; BUFFER_SLOT_SIZE].into_boxed_slice(),
        }
    }

    pub fn is_free(&self) -> bool {
        !self.in_use.load(Ordering::Acquire)
    }

    pub fn is_full(&self) -> bool {
        self.used == self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.used == 0
    }

    /// Copy as much of `bytes` as fits, advancing the cursor.
    pub fn fill(&mut self, bytes: &[u8]) -> usize {
        let n = bytes.len().min(self.data.len() - self.used);
        self.data[self.used..self.used + n].copy_from_slice(&bytes[..n]);
        self.used += n;
        n
    }

    /// Borrow the filled region for the sink writer. The slot reports in-use
    /// until the borrow drops.
    pub fn borrow(&self) -> SlotBorrow<'_> {
        self.in_use.store(true, Ordering::Release);
        SlotBorrow { slot: self }
    }

    pub fn reset(&mut self) {
        debug_assert!(self.is_free());
        self.used = 0;
    }
}

pub(crate) struct SlotBorrow<'a> {
    slot: &'a BufferSlot,
}

impl<'a> SlotBorrow<'a> {
    pub fn bytes(&self) -> &[u8] {
        &self.slot.data[..self.slot.used]
    }
}

impl<'a> Drop for SlotBorrow<'a> {
    fn drop(&mut self) {
        self.slot.in_use.store(false, Ordering::Release);
    }
}

/// A small pool of slots cycled between the drain thread and the sink.
pub(crate) struct SlotPool {
    slots: Vec<BufferSlot>,
    current: usize,
}

impl SlotPool {
    pub fn new(count: usize) -> SlotPool {
        assert!(count > 0);
        SlotPool {
            slots: (0..count).map(|_| BufferSlot::new()).collect(),
            current: 0,
        }
    }

    pub fn current(&mut self) -> &mut BufferSlot {
        &mut self.slots[self.current]
    }

    /// Move on to the next free slot, spinning while the sink still holds
    /// every other one.
    pub fn advance(&mut self) {
        let count = self.slots.len();
        let mut next = (self.current + 1) % count;
        while !self.slots[next].is_free() {
            std::hint::spin_loop();
            next = (next + 1) % count;
        }
        self.current = next;
        self.slots[self.current].reset();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fill_stops_at_the_slot_boundary() {
        let mut slot = BufferSlot::new();
        let big = vec![0xABu8; BUFFER_SLOT_SIZE + 10];
        assert_eq!(slot.fill(&big), BUFFER_SLOT_SIZE);
        assert!(slot.is_full());
        assert_eq!(slot.fill(&big), 0);
    }

    #[test]
    fn borrow_toggles_in_use() {
        let mut slot = BufferSlot::new();
        slot.fill(b"abc");
        {
            let borrow = slot.borrow();
            assert_eq!(borrow.bytes(), b"abc");
            assert!(!slot.is_free());
        }
        assert!(slot.is_free());
        slot.reset();
        assert!(slot.is_empty());
    }

    #[test]
    fn pool_rotates_to_free_slots() {
        let mut pool = SlotPool::new(2);
        pool.current().fill(b"xy");
        pool.advance();
        assert!(pool.current().is_empty());
    }
}
