//! # Static Heap
//!
//! A fixed buffer embedded in the kernel image, used before the physical
//! memory manager exists: it provides the storage for the physical
//! allocation bitmaps and other boot-time structures.
//!
//! Same split and coalesce rules as the [free-list heap](crate::free_list),
//! but only the adjacency list is kept; the allocated flag distinguishes
//! free nodes from used ones and a search walks all nodes in address order.

use core::cell::UnsafeCell;
use core::ptr::NonNull;
use kernel_error::{Fatal, MemError, Result, fatal};

const NIL: u32 = u32::MAX;

#[repr(C)]
#[derive(Debug, Copy, Clone)]
struct Header {
    net_size: u32,
    allocated: u32,
    adj_prev: u32,
    adj_next: u32,
}

/// Size of the in-band node header in bytes.
pub const HEADER_SIZE: usize = size_of::<Header>();

#[allow(clippy::cast_possible_truncation)]
const HEADER: u32 = HEADER_SIZE as u32;

/// Heap over an inline buffer of `N` bytes.
///
/// The buffer is set up on first use. Pointers handed out stay valid only
/// while the heap does not move, so it normally lives in a `static`.
#[repr(C, align(16))]
pub struct StaticHeap<const N: usize> {
    buffer: UnsafeCell<[u8; N]>,
    initialized: bool,
}

// SAFETY: all access goes through `&mut self`.
unsafe impl<const N: usize> Send for StaticHeap<N> {}

impl<const N: usize> Default for StaticHeap<N> {
    fn default() -> Self {
        Self::new()
    }
}

impl<const N: usize> StaticHeap<N> {
    #[must_use]
    pub const fn new() -> Self {
        const {
            assert!(N >= 2 * HEADER_SIZE);
            assert!(N <= u32::MAX as usize);
        };
        Self {
            buffer: UnsafeCell::new([0; N]),
            initialized: false,
        }
    }

    /// Total buffer size.
    #[must_use]
    pub const fn capacity(&self) -> usize {
        N
    }

    const fn base(&self) -> *mut u8 {
        self.buffer.get().cast::<u8>()
    }

    #[allow(clippy::cast_possible_truncation)]
    fn ensure_init(&mut self) {
        if !self.initialized {
            self.write(
                0,
                Header {
                    net_size: N as u32,
                    allocated: 0,
                    adj_prev: NIL,
                    adj_next: NIL,
                },
            );
            self.initialized = true;
        }
    }

    fn read(&self, off: u32) -> Header {
        // SAFETY: node offsets stay inside the buffer.
        unsafe { self.base().add(off as usize).cast::<Header>().read_unaligned() }
    }

    fn write(&mut self, off: u32, header: Header) {
        // SAFETY: as in `read`.
        unsafe { self.base().add(off as usize).cast::<Header>().write_unaligned(header) }
    }

    fn update(&mut self, off: u32, f: impl FnOnce(&mut Header)) {
        let mut header = self.read(off);
        f(&mut header);
        self.write(off, header);
    }

    /// Allocate `bytes` bytes, first fit in address order.
    ///
    /// # Errors
    /// - [`MemError::InvalidArgument`] if `bytes` is zero.
    /// - [`MemError::OutOfMemory`] if no free node is large enough.
    pub fn alloc(&mut self, bytes: usize) -> Result<NonNull<u8>> {
        if bytes == 0 {
            return Err(MemError::InvalidArgument);
        }
        let Some(take) = u32::try_from(bytes).ok().and_then(|b| b.checked_add(HEADER)) else {
            return Err(MemError::OutOfMemory);
        };
        let Some(needed) = take.checked_add(HEADER) else {
            return Err(MemError::OutOfMemory);
        };
        self.ensure_init();

        let mut cursor = 0;
        while cursor != NIL {
            let mut node = self.read(cursor);
            if node.allocated == 0 && node.net_size >= needed {
                let tail = cursor + take;
                let after = node.adj_next;
                self.write(
                    tail,
                    Header {
                        net_size: node.net_size - take,
                        allocated: 0,
                        adj_prev: cursor,
                        adj_next: after,
                    },
                );
                if after != NIL {
                    self.update(after, |h| h.adj_prev = tail);
                }
                node.net_size = take;
                node.allocated = 1;
                node.adj_next = tail;
                self.write(cursor, node);

                // SAFETY: the payload lies inside the buffer.
                return Ok(unsafe { NonNull::new_unchecked(self.base().add((cursor + HEADER) as usize)) });
            }
            cursor = node.adj_next;
        }

        log::warn!("Static heap exhausted allocating {bytes} bytes");
        Err(MemError::OutOfMemory)
    }

    /// Allocate `bytes` bytes and zero them.
    ///
    /// # Errors
    /// As [`alloc`](Self::alloc).
    pub fn alloc_zeroed(&mut self, bytes: usize) -> Result<NonNull<u8>> {
        let ptr = self.alloc(bytes)?;
        // SAFETY: the payload holds at least `bytes` bytes.
        unsafe { ptr.as_ptr().write_bytes(0, bytes) };
        Ok(ptr)
    }

    /// Release an allocation and merge it with free neighbours.
    ///
    /// A pointer that is not a live allocation stops the kernel.
    #[track_caller]
    pub fn free(&mut self, ptr: NonNull<u8>) {
        let addr = ptr.as_ptr() as usize;
        let Some(off) = self.find(addr) else {
            fatal(Fatal::HeapFreeUnknown { addr });
        };
        self.update(off, |h| h.allocated = 0);

        let next = self.read(off).adj_next;
        if next != NIL && self.read(next).allocated == 0 {
            self.absorb(off, next);
        }
        let prev = self.read(off).adj_prev;
        if prev != NIL && self.read(prev).allocated == 0 {
            self.absorb(prev, off);
        }
    }

    fn find(&self, addr: usize) -> Option<u32> {
        if !self.initialized {
            return None;
        }
        let target = addr.checked_sub(self.base() as usize + HEADER_SIZE)?;
        let mut cursor = 0;
        while cursor != NIL {
            let node = self.read(cursor);
            if cursor as usize == target {
                return (node.allocated != 0).then_some(cursor);
            }
            cursor = node.adj_next;
        }
        None
    }

    fn absorb(&mut self, into: u32, victim: u32) {
        let node = self.read(victim);
        self.update(into, |h| {
            h.net_size += node.net_size;
            h.adj_next = node.adj_next;
        });
        if node.adj_next != NIL {
            self.update(node.adj_next, |h| h.adj_prev = into);
        }
    }

    /// Bytes held by allocated nodes, headers included.
    #[must_use]
    pub fn used_memory(&self) -> usize {
        self.nodes().filter(|&(_, _, used)| used).map(|(_, size, _)| size).sum()
    }

    /// Bytes held by free nodes, headers included; the whole buffer before
    /// the first allocation.
    #[must_use]
    pub fn free_memory(&self) -> usize {
        if !self.initialized {
            return N;
        }
        self.nodes().filter(|&(_, _, used)| !used).map(|(_, size, _)| size).sum()
    }

    /// `(offset, net size, allocated)` for every node in address order.
    pub fn nodes(&self) -> impl Iterator<Item = (usize, usize, bool)> + '_ {
        let mut cursor = if self.initialized { 0 } else { NIL };
        core::iter::from_fn(move || {
            if cursor == NIL {
                return None;
            }
            let offset = cursor;
            let node = self.read(offset);
            cursor = node.adj_next;
            Some((offset as usize, node.net_size as usize, node.allocated != 0))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const H: usize = HEADER_SIZE;

    #[test]
    fn lazily_initialized() {
        let heap = Box::new(StaticHeap::<256>::new());
        assert_eq!(heap.nodes().count(), 0);
        assert_eq!(heap.free_memory(), 256);
    }

    #[test]
    fn alloc_splits_in_address_order() {
        let mut heap = Box::new(StaticHeap::<256>::new());
        let a = heap.alloc(20).unwrap();
        let b = heap.alloc(30).unwrap();
        assert_eq!(b.as_ptr() as usize - a.as_ptr() as usize, 20 + H);
        assert_eq!(
            heap.nodes().collect::<Vec<_>>(),
            [(0, H + 20, true), (H + 20, H + 30, true), (2 * H + 50, 256 - 2 * H - 50, false)]
        );
        assert_eq!(heap.used_memory(), 2 * H + 50);
    }

    #[test]
    fn freed_hole_is_reused_first() {
        let mut heap = Box::new(StaticHeap::<512>::new());
        let a = heap.alloc(64).unwrap();
        let _b = heap.alloc(64).unwrap();
        heap.free(a);
        let c = heap.alloc(16).unwrap();
        assert_eq!(a, c);
    }

    #[test]
    fn free_coalesces_back_to_one_node() {
        let mut heap = Box::new(StaticHeap::<512>::new());
        let a = heap.alloc(10).unwrap();
        let b = heap.alloc(10).unwrap();
        let c = heap.alloc(10).unwrap();
        heap.free(a);
        heap.free(c);
        heap.free(b);
        assert_eq!(heap.nodes().collect::<Vec<_>>(), [(0, 512, false)]);
    }

    #[test]
    fn zeroed_allocation() {
        let mut heap = Box::new(StaticHeap::<128>::new());
        let p = heap.alloc(16).unwrap();
        unsafe { p.as_ptr().write_bytes(0xFF, 16) };
        heap.free(p);
        let q = heap.alloc_zeroed(16).unwrap();
        let bytes = unsafe { core::slice::from_raw_parts(q.as_ptr(), 16) };
        assert_eq!(bytes, [0; 16]);
    }

    #[test]
    fn exhaustion() {
        let mut heap = Box::new(StaticHeap::<128>::new());
        assert_eq!(heap.alloc(0), Err(MemError::InvalidArgument));
        assert_eq!(heap.alloc(128 - 2 * H + 1), Err(MemError::OutOfMemory));
        assert!(heap.alloc(128 - 2 * H).is_ok());
    }

    #[test]
    #[should_panic(expected = "is not allocated")]
    fn double_free_is_fatal() {
        let mut heap = Box::new(StaticHeap::<128>::new());
        let p = heap.alloc(8).unwrap();
        heap.free(p);
        heap.free(p);
    }
}
