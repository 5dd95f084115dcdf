use std::cell::UnsafeCell;
use std::sync::atomic::{fence, AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};

use num_traits::FromPrimitive;

use crate::value::Value;

// Tagged u64 queue protocol.
//
// Bit 0 = 0: entry is a raw `Arc<Value>` pointer (consumer reconstitutes
//            and releases).
// Bit 0 = 1: entry is a command word.
//            bits [1:31]  = Cmd enum
//            bits [32:63] = length / integer payload

#[repr(u32)]
#[derive(Debug, Copy, Clone, PartialEq, Eq, FromPrimitive)]
pub(crate) enum Cmd {
    Bind = 0,
    ExtBind,
    NewHandle,
    ThreadSwitch,
    BindingDelete,
    HandleRef,
    HandleDelete,
    Flush,
    Shutdown,
    MessageBoundary,
    Stack,
    Dropped,
}

pub(crate) enum Word {
    Object(Arc<Value>),
    Command(Cmd, u32),
}

pub(crate) fn obj_entry(value: Arc<Value>) -> u64 {
    // Arc payloads are at least word aligned, so bit 0 is always clear.
    Arc::into_raw(value) as usize as u64
}

pub(crate) fn cmd_entry(cmd: Cmd, arg: u32) -> u64 {
    ((arg as u64) << 32) | ((cmd as u64) << 1) | 1
}

pub(crate) fn is_object(entry: u64) -> bool {
    entry & 1 == 0
}

/// Release the reference carried by an object word that never made it into
/// the ring (a timed-out or closed push).
pub(crate) fn reclaim(entry: u64) {
    if is_object(entry) {
        unsafe {
            drop(Arc::from_raw(entry as usize as *const Value));
        }
    }
}

pub(crate) fn decode(entry: u64) -> Word {
    if is_object(entry) {
        let value = unsafe { Arc::from_raw(entry as usize as *const Value) };
        Word::Object(value)
    } else {
        let code = ((entry >> 1) & 0x7FFF_FFFF) as u32;
        let cmd = Cmd::from_u32(code).expect("corrupt command word");
        Word::Command(cmd, (entry >> 32) as u32)
    }
}

/// Bounded single-producer single-consumer ring of tagged words. The fast
/// paths are lock free; the mutex and condvars only park a side that found
/// the ring full or empty.
struct Ring {
    buf: Box<[UnsafeCell<u64>]>,
    capacity: usize,
    /// Next slot to pop. Monotonic; index is `head % capacity`.
    head: AtomicUsize,
    /// Next slot to push. Monotonic; index is `tail % capacity`.
    tail: AtomicUsize,
    sleepers: AtomicUsize,
    /// Set when the consumer goes away so a blocked producer cannot wait
    /// forever on a drained ring.
    closed: AtomicBool,
    lock: Mutex<()>,
    not_empty: Condvar,
    not_full: Condvar,
}

unsafe impl Send for Ring {}
unsafe impl Sync for Ring {}

impl Ring {
    fn try_push(&self, entry: u64) -> bool {
        let tail = self.tail.load(Ordering::Relaxed);
        let head = self.head.load(Ordering::Acquire);
        if tail - head == self.capacity {
            return false;
        }
        unsafe {
            *self.buf[tail % self.capacity].get() = entry;
        }
        self.tail.store(tail + 1, Ordering::Release);
        self.wake();
        true
    }

    fn try_pop(&self) -> Option<u64> {
        let head = self.head.load(Ordering::Relaxed);
        let tail = self.tail.load(Ordering::Acquire);
        if head == tail {
            return None;
        }
        let entry = unsafe { *self.buf[head % self.capacity].get() };
        self.head.store(head + 1, Ordering::Release);
        self.wake();
        Some(entry)
    }

    fn wake(&self) {
        // Pairs with the SeqCst bump in the sleep paths: either this load
        // sees the sleeper, or the sleeper's re-check sees the new cursor.
        fence(Ordering::SeqCst);
        if self.sleepers.load(Ordering::Relaxed) > 0 {
            let _guard = self.lock.lock().unwrap();
            self.not_empty.notify_all();
            self.not_full.notify_all();
        }
    }
}

impl Drop for Ring {
    fn drop(&mut self) {
        // Reclaim any object words still in flight.
        let head = self.head.load(Ordering::Acquire);
        let tail = self.tail.load(Ordering::Acquire);
        for pos in head..tail {
            let entry = unsafe { *self.buf[pos % self.capacity].get() };
            if is_object(entry) {
                unsafe {
                    drop(Arc::from_raw(entry as usize as *const Value));
                }
            }
        }
    }
}

pub(crate) struct Producer {
    ring: Arc<Ring>,
}

pub(crate) struct Consumer {
    ring: Arc<Ring>,
}

pub(crate) fn channel(capacity: usize) -> (Producer, Consumer) {
    assert!(capacity > 0);
    let ring = Arc::new(Ring {
        buf: (0..capacity).map(|_| UnsafeCell::new(0)).collect(),
        capacity,
        head: AtomicUsize::new(0),
        tail: AtomicUsize::new(0),
        sleepers: AtomicUsize::new(0),
        closed: AtomicBool::new(false),
        lock: Mutex::new(()),
        not_empty: Condvar::new(),
        not_full: Condvar::new(),
    });
    (Producer { ring: ring.clone() }, Consumer { ring })
}

impl Producer {
    /// Push, blocking while the ring is full. With a timeout, gives up after
    /// the deadline and reports `false` so the caller can count the drop.
    pub fn push(&self, entry: u64, timeout: Option<Duration>) -> bool {
        if self.ring.try_push(entry) {
            return true;
        }
        let deadline = timeout.map(|t| Instant::now() + t);
        let mut guard = self.ring.lock.lock().unwrap();
        self.ring.sleepers.fetch_add(1, Ordering::SeqCst);
        let pushed = loop {
            if self.ring.try_push(entry) {
                break true;
            }
            if self.ring.closed.load(Ordering::Acquire) {
                break false;
            }
            match deadline {
                None => guard = self.ring.not_full.wait(guard).unwrap(),
                Some(d) => {
                    let now = Instant::now();
                    if now >= d {
                        break false;
                    }
                    let (g, _) = self.ring.not_full.wait_timeout(guard, d - now).unwrap();
                    guard = g;
                }
            }
        };
        self.ring.sleepers.fetch_sub(1, Ordering::SeqCst);
        pushed
    }
}

impl Drop for Consumer {
    fn drop(&mut self) {
        self.ring.closed.store(true, Ordering::Release);
        let _guard = self.ring.lock.lock().unwrap();
        self.ring.not_full.notify_all();
    }
}

impl Consumer {
    /// Pop, blocking while the ring is empty.
    pub fn pop(&self) -> u64 {
        if let Some(entry) = self.ring.try_pop() {
            return entry;
        }
        let mut guard = self.ring.lock.lock().unwrap();
        self.ring.sleepers.fetch_add(1, Ordering::SeqCst);
        let entry = loop {
            if let Some(entry) = self.ring.try_pop() {
                break entry;
            }
            guard = self.ring.not_empty.wait(guard).unwrap();
        };
        self.ring.sleepers.fetch_sub(1, Ordering::SeqCst);
        entry
    }
}
