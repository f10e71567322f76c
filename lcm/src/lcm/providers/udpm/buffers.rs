//! Receive descriptors and the queues that recycle them.
//!
//! A descriptor carries the metadata for one received message; the payload
//! bytes themselves live either in a ring arena slot (ordinary datagrams)
//! or in a heap buffer handed over by the reassembler (fragmented
//! messages). Descriptors circulate between the `empty` queue and the
//! `filled` queue for the life of the provider and are never freed
//! individually.

use std::collections::VecDeque;
use std::mem;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::slice;
use std::sync::Arc;

use super::ringbuf::RingArena;

/// Number of descriptors created up front, and the batch size for topping
/// the pool up when it runs dry.
pub const DEFAULT_RECV_BUFS: usize = 2000;

/// Largest possible unfragmented datagram. Every landing slot starts out
/// this big and is shrunk once the real size is known.
pub const MAX_UNFRAGMENTED_PACKET_SIZE: usize = 65536;

/// Where a descriptor's payload bytes live.
pub enum Storage {
    /// No payload attached.
    None,
    /// A slot in a ring arena. Holding the `Arc` keeps orphaned arenas
    /// alive until their last outstanding slot is released.
    Ring { arena: Arc<RingArena>, offset: usize },
    /// A heap buffer assembled from fragments.
    Heap(Vec<u8>),
}

/// A receive descriptor.
pub struct Buf {
    /// The channel the message arrived on.
    pub channel: String,
    /// Wall-clock microseconds at datagram receipt.
    pub recv_utime: i64,
    pub storage: Storage,
    /// Offset of the payload within the storage.
    pub data_offset: usize,
    /// Size of the payload.
    pub data_size: usize,
    /// The sender.
    pub from: SocketAddr,
}

impl Buf {
    pub fn new() -> Buf {
        Buf {
            channel: String::new(),
            recv_utime: 0,
            storage: Storage::None,
            data_offset: 0,
            data_size: 0,
            from: SocketAddr::new(IpAddr::V4(Ipv4Addr::new(0, 0, 0, 0)), 0),
        }
    }

    /// The full landing slot backing this descriptor.
    ///
    /// Only valid on ring-backed descriptors. This descriptor is the slot's
    /// only owner, so handing out the mutable view is sound.
    pub fn landing_mut(&mut self) -> &mut [u8] {
        match self.storage {
            Storage::Ring { ref arena, offset } => unsafe {
                slice::from_raw_parts_mut(arena.ptr(offset), MAX_UNFRAGMENTED_PACKET_SIZE)
            },
            _ => panic!("landing slot requested on a non-ring descriptor"),
        }
    }

    /// Read-only view of the landing slot.
    pub fn landing(&self) -> &[u8] {
        match self.storage {
            Storage::Ring { ref arena, offset } => unsafe {
                slice::from_raw_parts(arena.ptr(offset), MAX_UNFRAGMENTED_PACKET_SIZE)
            },
            _ => panic!("landing slot requested on a non-ring descriptor"),
        }
    }

    /// The message payload, wherever it lives.
    pub fn payload(&self) -> &[u8] {
        match self.storage {
            Storage::None => &[],
            Storage::Ring { ref arena, offset } => unsafe {
                slice::from_raw_parts(arena.ptr(offset + self.data_offset), self.data_size)
            },
            Storage::Heap(ref data) => &data[self.data_offset..self.data_offset + self.data_size],
        }
    }

    /// Releases the payload bytes back to wherever they came from.
    ///
    /// A ring slot goes back to its owning arena; if that arena was
    /// orphaned, dropping the `Arc` after its final slot frees it.
    pub fn free_data(&mut self) {
        match mem::replace(&mut self.storage, Storage::None) {
            Storage::Ring { arena, offset } => arena.dealloc(offset),
            Storage::Heap(_) | Storage::None => {}
        }
        self.data_offset = 0;
        self.data_size = 0;
    }
}

/// A FIFO of receive descriptors.
pub struct BufQueue {
    bufs: VecDeque<Box<Buf>>,
}

impl BufQueue {
    pub fn new() -> BufQueue {
        BufQueue {
            bufs: VecDeque::new(),
        }
    }

    pub fn enqueue(&mut self, buf: Box<Buf>) {
        self.bufs.push_back(buf);
    }

    pub fn dequeue(&mut self) -> Option<Box<Buf>> {
        self.bufs.pop_front()
    }

    pub fn is_empty(&self) -> bool {
        self.bufs.is_empty()
    }

    pub fn len(&self) -> usize {
        self.bufs.len()
    }
}

/// Takes a descriptor from the empty queue and gives it a maximum-size
/// landing slot.
///
/// The pool is topped up if it has run dry. When the arena cannot fit
/// another slot it is orphaned and replaced with one half again as large;
/// descriptors still pointing into the old arena keep it alive until their
/// slots drain.
pub fn allocate_buf(inbufs_empty: &mut BufQueue, arena: &mut Arc<RingArena>) -> Box<Buf> {
    if inbufs_empty.is_empty() {
        debug!(
            "Receive descriptors exhausted. Allocating {} more.",
            DEFAULT_RECV_BUFS
        );
        for _ in 0..DEFAULT_RECV_BUFS {
            inbufs_empty.enqueue(Box::new(Buf::new()));
        }
    }
    let mut buf = inbufs_empty.dequeue().unwrap();

    let offset = match arena.alloc(MAX_UNFRAGMENTED_PACKET_SIZE) {
        Some(offset) => offset,
        None => {
            let new_capacity = arena.capacity() + arena.capacity() / 2;
            debug!(
                "Ring arena full ({} of {} bytes used). Replacing it with a {} byte arena.",
                arena.used(),
                arena.capacity(),
                new_capacity
            );
            *arena = Arc::new(RingArena::new(new_capacity));
            arena
                .alloc(MAX_UNFRAGMENTED_PACKET_SIZE)
                .expect("a fresh arena always fits one landing slot")
        }
    };

    buf.storage = Storage::Ring {
        arena: arena.clone(),
        offset,
    };
    buf
}
