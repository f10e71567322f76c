//! The fixed-capacity record arena used as the landing pad for inbound
//! datagrams.
//!
//! Records are carved out of one contiguous allocation and released in
//! FIFO or LIFO order, which is all the receive path ever needs: a slot is
//! claimed before `recv`, shrunk to the received size, and released either
//! by the dispatcher (oldest first) or immediately when the datagram turns
//! out to be useless (newest first). Going through the arena keeps the
//! per-packet cost at pointer arithmetic instead of heap traffic.

use std::collections::VecDeque;
use std::sync::Mutex;
use std::mem;

/// Record alignment. Must be a power of two.
const ALIGNMENT: usize = 32;

/// A live record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct RingRec {
    offset: usize,
    len: usize,
}

struct RingState {
    /// Total bytes currently allocated, including alignment padding.
    used: usize,
    /// Live records, oldest at the front, most recent at the back.
    ///
    /// Two layouts of live region coexist: front behind back (contiguous)
    /// and back wrapped around before front.
    recs: VecDeque<RingRec>,
}

/// A byte arena with ring allocation order.
///
/// The backing memory never moves, so a record's bytes stay valid for as
/// long as the record is allocated, without holding the internal lock. The
/// caller that allocated a record is the only one allowed to touch its
/// bytes; handing the record to another thread must happen through a
/// synchronizing structure (the provider uses its buffer queues for this).
pub struct RingArena {
    data: *mut u8,
    capacity: usize,
    state: Mutex<RingState>,
}

// The raw data pointer is only ever dereferenced for ranges covered by a
// live record, and every record has exactly one owner at a time.
unsafe impl Send for RingArena {}
unsafe impl Sync for RingArena {}

impl RingArena {
    /// Creates an arena with the given capacity in bytes.
    pub fn new(capacity: usize) -> RingArena {
        let data = {
            let mut data: Vec<u8> = Vec::with_capacity(capacity);
            let ptr = data.as_mut_ptr();
            mem::forget(data);

            ptr
        };

        RingArena {
            data,
            capacity,
            state: Mutex::new(RingState {
                used: 0,
                recs: VecDeque::new(),
            }),
        }
    }

    fn rounded(len: usize) -> usize {
        (len + ALIGNMENT - 1) & !(ALIGNMENT - 1)
    }

    /// Allocates a record of at least `len` bytes.
    ///
    /// Returns the record's offset into the arena, or `None` if the request
    /// fits neither after the most recent record nor, on wrap, before the
    /// oldest one. Records are never split.
    pub fn alloc(&self, len: usize) -> Option<usize> {
        let mut state = self.state.lock().unwrap();
        let len = RingArena::rounded(len);

        let offset = match (state.recs.front(), state.recs.back()) {
            (None, _) => {
                if len > self.capacity {
                    return None;
                }
                0
            }
            (Some(front), Some(back)) => {
                // Try to allocate right after the most recent record first;
                // if that fails, try offset 0.
                let candidate = back.offset + back.len;
                if front.offset > back.offset {
                    // Already wrapped; the free space is the gap between
                    // the newest and the oldest record.
                    if candidate + len <= front.offset {
                        candidate
                    } else {
                        return None;
                    }
                } else if candidate + len <= self.capacity {
                    candidate
                } else if len < front.offset {
                    0
                } else {
                    return None;
                }
            }
            (Some(_), None) => unreachable!(),
        };

        state.recs.push_back(RingRec { offset, len });
        state.used += len;
        Some(offset)
    }

    /// Shortens the most recently allocated record in place.
    ///
    /// The caller guarantees `new_len` is no larger than the record's
    /// current size.
    pub fn shrink_last(&self, offset: usize, new_len: usize) {
        let mut state = self.state.lock().unwrap();
        let new_len = RingArena::rounded(new_len);

        let reclaimed = {
            let rec = state
                .recs
                .back_mut()
                .expect("shrink_last on an empty arena");
            assert_eq!(
                rec.offset, offset,
                "shrink_last target is not the most recent record"
            );
            assert!(rec.len >= new_len);
            let reclaimed = rec.len - new_len;
            rec.len = new_len;
            reclaimed
        };
        state.used -= reclaimed;
    }

    /// Releases a record.
    ///
    /// Only the oldest or the most recent record may be released; anything
    /// else would punch a hole in the ring.
    pub fn dealloc(&self, offset: usize) {
        let mut state = self.state.lock().unwrap();

        let len = if state.recs.front().map(|r| r.offset) == Some(offset) {
            state.recs.pop_front().unwrap().len
        } else if state.recs.back().map(|r| r.offset) == Some(offset) {
            state.recs.pop_back().unwrap().len
        } else {
            panic!("ring arena dealloc of an interior record");
        };
        state.used -= len;
    }

    /// The arena's total capacity in bytes.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Total bytes currently allocated.
    pub fn used(&self) -> usize {
        self.state.lock().unwrap().used
    }

    /// Pointer to a record's first byte.
    ///
    /// The record at `offset` must be live, and the caller must be its
    /// owner for as long as it reads or writes through the pointer.
    pub fn ptr(&self, offset: usize) -> *mut u8 {
        debug_assert!(offset < self.capacity);
        unsafe { self.data.add(offset) }
    }
}

impl Drop for RingArena {
    fn drop(&mut self) {
        unsafe {
            let _: Vec<u8> = Vec::from_raw_parts(self.data, 0, self.capacity);
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn alloc_is_aligned_and_accounted() {
        let ring = RingArena::new(1024);
        assert_eq!(ring.used(), 0);

        let a = ring.alloc(1).unwrap();
        let b = ring.alloc(33).unwrap();
        assert_eq!(a, 0);
        assert_eq!(b, 32);
        assert_eq!(ring.used(), 32 + 64);

        ring.dealloc(a);
        ring.dealloc(b);
        assert_eq!(ring.used(), 0);
    }

    #[test]
    fn refuses_when_full() {
        let ring = RingArena::new(128);
        let a = ring.alloc(64).unwrap();
        let _b = ring.alloc(64).unwrap();
        assert_eq!(ring.alloc(1), None);

        // Freeing the head makes room again at the start of the arena.
        ring.dealloc(a);
        assert!(ring.alloc(16).is_some());
    }

    #[test]
    fn wraps_before_the_head() {
        let ring = RingArena::new(256);
        let a = ring.alloc(96).unwrap();
        let b = ring.alloc(96).unwrap();

        ring.dealloc(a);

        // 64 bytes remain after `b`, but another 64 only fit at offset 0.
        let c = ring.alloc(64).unwrap();
        assert_eq!(c, 0);

        // The gap between the wrapped tail and the head is now full.
        assert_eq!(ring.alloc(96), None);

        ring.dealloc(b);
        ring.dealloc(c);
        assert_eq!(ring.used(), 0);
    }

    #[test]
    fn shrink_last_reclaims_space() {
        let ring = RingArena::new(256);
        let a = ring.alloc(224).unwrap();
        assert_eq!(ring.alloc(32), None);

        ring.shrink_last(a, 32);
        assert_eq!(ring.used(), 32);
        assert!(ring.alloc(128).is_some());
    }

    #[test]
    fn release_is_fifo_or_lifo_only() {
        let ring = RingArena::new(256);
        let _a = ring.alloc(32).unwrap();
        let b = ring.alloc(32).unwrap();
        let _c = ring.alloc(32).unwrap();

        let result =
            ::std::panic::catch_unwind(::std::panic::AssertUnwindSafe(|| ring.dealloc(b)));
        assert!(result.is_err());
    }

    #[test]
    fn bytes_survive_until_release() {
        let ring = RingArena::new(256);
        let a = ring.alloc(16).unwrap();
        unsafe {
            let slot = ::std::slice::from_raw_parts_mut(ring.ptr(a), 16);
            slot.copy_from_slice(b"0123456789abcdef");
        }
        let _b = ring.alloc(64).unwrap();
        unsafe {
            let slot = ::std::slice::from_raw_parts(ring.ptr(a), 16);
            assert_eq!(slot, b"0123456789abcdef");
        }
    }
}
