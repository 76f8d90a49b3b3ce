//! # Free-list Heap
//!
//! General-purpose first-fit allocator over one contiguous region with
//! split-on-allocate and coalesce-on-free.
//!
//! Every node starts with a [`Header`] stored inside the region. Nodes are
//! linked in three intrusive lists using 32-bit offsets from the region
//! base:
//!
//! - the **adjacency list** in address order, which always tiles the region;
//! - the **free list**, searched first-fit;
//! - the **allocation list**, consulted when a pointer is freed.
//!
//! Every node is in exactly one of the free or allocation lists.
//!
//! ```text
//! base                                                          base + size
//! ┌────────┬──────────┬────────┬───────┬────────┬────────────────────────┐
//! │ header │ payload  │ header │  pay. │ header │ free                   │
//! └────────┴──────────┴────────┴───────┴────────┴────────────────────────┘
//!  ◄─── net size ────► ◄─ net size ───► ◄────────── net size ───────────►
//! ```
//!
//! A request of `n` bytes needs a free node of at least `n + 2 × header`;
//! the node is cut into an allocated node of exactly `n + header` and a free
//! remainder placed right after it in both the free and adjacency lists.
//! Payload pointers carry no alignment beyond that of the region base.

use core::fmt;
use core::ptr::{self, NonNull};
use kernel_error::{Fatal, MemError, Result, fatal};

/// End of list.
const NIL: u32 = u32::MAX;
const MAGIC: u32 = 0x4E4F_4445;

/// Node header kept in front of every payload.
#[repr(C)]
#[derive(Debug, Copy, Clone)]
struct Header {
    magic: u32,
    /// Header plus payload.
    net_size: u32,
    allocated: u32,
    reserved: u32,
    /// Neighbours in the free or the allocation list.
    list_prev: u32,
    list_next: u32,
    /// Neighbours in address order.
    adj_prev: u32,
    adj_next: u32,
}

/// Size of the in-band node header in bytes.
pub const HEADER_SIZE: usize = size_of::<Header>();

#[allow(clippy::cast_possible_truncation)]
const HEADER: u32 = HEADER_SIZE as u32;

const _: () = assert!(HEADER_SIZE == 32);

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
enum List {
    Free,
    Alloc,
}

/// Diagnostic view of one heap node.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct HeapNode {
    /// Offset of the header from the region base.
    pub offset: usize,
    /// Header plus payload.
    pub net_size: usize,
    pub allocated: bool,
}

/// The general-purpose kernel heap.
pub struct FreeListHeap {
    base: *mut u8,
    size: u32,
    free_head: u32,
    alloc_head: u32,
}

// SAFETY: the region is owned exclusively by the heap; callers serialize access.
unsafe impl Send for FreeListHeap {}

impl Default for FreeListHeap {
    fn default() -> Self {
        Self::new()
    }
}

impl FreeListHeap {
    /// An empty heap; every allocation fails until [`init`](Self::init).
    #[must_use]
    pub const fn new() -> Self {
        Self {
            base: ptr::null_mut(),
            size: 0,
            free_head: NIL,
            alloc_head: NIL,
        }
    }

    #[must_use]
    pub const fn is_initialized(&self) -> bool {
        !self.base.is_null()
    }

    /// Size of the managed region.
    #[must_use]
    pub const fn size(&self) -> usize {
        self.size as usize
    }

    /// Manage `[base, base + size)` as a single free node. Any previous
    /// state is forgotten.
    ///
    /// # Errors
    /// - [`MemError::InvalidArgument`] if the region cannot hold two headers.
    /// - [`MemError::InvalidRange`] if the region exceeds 4 GiB.
    ///
    /// # Safety
    /// The region must be valid for reads and writes and used by nothing
    /// else for as long as the heap is in use.
    pub unsafe fn init(&mut self, base: NonNull<u8>, size: usize) -> Result<()> {
        if size < 2 * HEADER_SIZE {
            return Err(MemError::InvalidArgument);
        }
        let size = u32::try_from(size).map_err(|_| MemError::InvalidRange)?;

        self.base = base.as_ptr();
        self.size = size;
        self.free_head = NIL;
        self.alloc_head = NIL;
        self.write(
            0,
            Header {
                magic: MAGIC,
                net_size: size,
                allocated: 0,
                reserved: 0,
                list_prev: NIL,
                list_next: NIL,
                adj_prev: NIL,
                adj_next: NIL,
            },
        );
        self.push_front(List::Free, 0);

        log::debug!("Heap of {size} bytes at {:#X}", base.as_ptr() as usize);
        Ok(())
    }

    fn read(&self, off: u32) -> Header {
        debug_assert!(off as usize + HEADER_SIZE <= self.size as usize);
        // SAFETY: `off` is a node offset inside the region handed to `init`.
        unsafe { self.base.add(off as usize).cast::<Header>().read_unaligned() }
    }

    fn write(&mut self, off: u32, header: Header) {
        debug_assert!(off as usize + HEADER_SIZE <= self.size as usize);
        // SAFETY: as in `read`.
        unsafe { self.base.add(off as usize).cast::<Header>().write_unaligned(header) }
    }

    fn update(&mut self, off: u32, f: impl FnOnce(&mut Header)) {
        let mut header = self.read(off);
        f(&mut header);
        self.write(off, header);
    }

    const fn head(&self, list: List) -> u32 {
        match list {
            List::Free => self.free_head,
            List::Alloc => self.alloc_head,
        }
    }

    const fn set_head(&mut self, list: List, off: u32) {
        match list {
            List::Free => self.free_head = off,
            List::Alloc => self.alloc_head = off,
        }
    }

    fn push_front(&mut self, list: List, off: u32) {
        let head = self.head(list);
        self.update(off, |h| {
            h.list_prev = NIL;
            h.list_next = head;
        });
        if head != NIL {
            self.update(head, |h| h.list_prev = off);
        }
        self.set_head(list, off);
    }

    fn insert_after(&mut self, after: u32, off: u32) {
        let next = self.read(after).list_next;
        self.update(off, |h| {
            h.list_prev = after;
            h.list_next = next;
        });
        self.update(after, |h| h.list_next = off);
        if next != NIL {
            self.update(next, |h| h.list_prev = off);
        }
    }

    fn unlink(&mut self, list: List, off: u32) {
        let node = self.read(off);
        if node.list_prev == NIL {
            self.set_head(list, node.list_next);
        } else {
            self.update(node.list_prev, |h| h.list_next = node.list_next);
        }
        if node.list_next != NIL {
            self.update(node.list_next, |h| h.list_prev = node.list_prev);
        }
        self.update(off, |h| {
            h.list_prev = NIL;
            h.list_next = NIL;
        });
    }

    fn contains(&self, list: List, off: u32) -> bool {
        let mut cursor = self.head(list);
        while cursor != NIL {
            if cursor == off {
                return true;
            }
            cursor = self.read(cursor).list_next;
        }
        false
    }

    fn payload(&self, off: u32) -> NonNull<u8> {
        // SAFETY: the payload lies inside the region, whose base is non-null.
        unsafe { NonNull::new_unchecked(self.base.add((off + HEADER) as usize)) }
    }

    /// Cut `off` into a node of `take` bytes and a free remainder after it.
    #[track_caller]
    fn split(&mut self, off: u32, take: u32) {
        let mut node = self.read(off);
        let rest = node.net_size - take;
        if rest < HEADER {
            fatal(Fatal::HeapSplitTooSmall {
                addr: self.base as usize + off as usize,
            });
        }

        let tail = off + take;
        let after = node.adj_next;
        self.write(
            tail,
            Header {
                magic: MAGIC,
                net_size: rest,
                allocated: 0,
                reserved: 0,
                list_prev: NIL,
                list_next: NIL,
                adj_prev: off,
                adj_next: after,
            },
        );
        if after != NIL {
            self.update(after, |h| h.adj_prev = tail);
        }
        node.net_size = take;
        node.adj_next = tail;
        self.write(off, node);
        self.insert_after(off, tail);
    }

    /// Allocate `bytes` bytes.
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

        let mut cursor = self.free_head;
        while cursor != NIL {
            let node = self.read(cursor);
            if node.net_size >= needed {
                self.split(cursor, take);
                self.unlink(List::Free, cursor);
                self.update(cursor, |h| h.allocated = 1);
                self.push_front(List::Alloc, cursor);
                return Ok(self.payload(cursor));
            }
            cursor = node.list_next;
        }

        log::warn!(
            "Heap exhausted allocating {bytes} bytes ({} of {} bytes free)",
            self.free_memory(),
            self.size
        );
        Err(MemError::OutOfMemory)
    }

    /// Allocate `bytes` bytes and zero exactly those.
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
    /// A pointer that is not a live allocation of this heap stops the kernel.
    #[track_caller]
    pub fn free(&mut self, ptr: NonNull<u8>) {
        let addr = ptr.as_ptr() as usize;
        let off = addr
            .checked_sub(self.base as usize + HEADER_SIZE)
            .and_then(|o| u32::try_from(o).ok())
            .filter(|&o| self.is_initialized() && self.contains(List::Alloc, o));
        let Some(off) = off else {
            fatal(Fatal::HeapFreeUnknown { addr });
        };

        self.unlink(List::Alloc, off);
        self.update(off, |h| h.allocated = 0);
        self.push_front(List::Free, off);

        let next = self.read(off).adj_next;
        if next != NIL && self.read(next).allocated == 0 {
            self.absorb(off, next);
        }
        let prev = self.read(off).adj_prev;
        if prev != NIL && self.read(prev).allocated == 0 {
            self.absorb(prev, off);
        }
    }

    /// Merge the free node `victim` into its free left neighbour `into`.
    fn absorb(&mut self, into: u32, victim: u32) {
        let node = self.read(victim);
        self.unlink(List::Free, victim);
        let after = node.adj_next;
        self.update(into, |h| {
            h.net_size += node.net_size;
            h.adj_next = after;
        });
        if after != NIL {
            self.update(after, |h| h.adj_prev = into);
        }
        self.update(victim, |h| h.magic = 0);
    }

    fn sum(&self, list: List) -> usize {
        let mut total = 0;
        let mut cursor = self.head(list);
        while cursor != NIL {
            let node = self.read(cursor);
            total += node.net_size as usize;
            cursor = node.list_next;
        }
        total
    }

    /// Bytes held by allocated nodes, headers included.
    #[must_use]
    pub fn used_memory(&self) -> usize {
        self.sum(List::Alloc)
    }

    /// Bytes held by free nodes, headers included.
    #[must_use]
    pub fn free_memory(&self) -> usize {
        self.sum(List::Free)
    }

    /// Nodes in address order.
    #[must_use]
    pub fn nodes(&self) -> Nodes<'_> {
        Nodes {
            heap: self,
            cursor: if self.is_initialized() { 0 } else { NIL },
            walk: Walk::Adjacency,
        }
    }

    /// Free nodes in search order.
    #[must_use]
    pub fn free_nodes(&self) -> Nodes<'_> {
        Nodes {
            heap: self,
            cursor: self.free_head,
            walk: Walk::List,
        }
    }

    /// Walk the adjacency list and check that it tiles the region and that
    /// every node sits in the list matching its state. Stops the kernel
    /// otherwise.
    #[track_caller]
    pub fn check_integrity(&self) {
        if !self.is_initialized() {
            return;
        }
        let mut expected = 0u32;
        let mut prev = NIL;
        let mut cursor = 0u32;
        while cursor != NIL {
            if cursor != expected || cursor >= self.size {
                self.corrupted(cursor);
            }
            let node = self.read(cursor);
            if node.magic != MAGIC || node.adj_prev != prev || node.net_size < HEADER {
                self.corrupted(cursor);
            }
            let list = if node.allocated == 0 { List::Free } else { List::Alloc };
            if !self.contains(list, cursor) {
                self.corrupted(cursor);
            }
            expected = match expected.checked_add(node.net_size) {
                Some(e) => e,
                None => self.corrupted(cursor),
            };
            prev = cursor;
            cursor = node.adj_next;
        }
        if expected != self.size {
            self.corrupted(expected);
        }
    }
}

impl FreeListHeap {
    #[cold]
    #[track_caller]
    fn corrupted(&self, off: u32) -> ! {
        fatal(Fatal::HeapCorrupted {
            addr: self.base as usize + off as usize,
        })
    }
}

impl fmt::Debug for FreeListHeap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FreeListHeap")
            .field("base", &self.base)
            .field("size", &self.size)
            .field("used", &self.used_memory())
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Copy, Clone)]
enum Walk {
    Adjacency,
    List,
}

/// Iterator over heap nodes; see [`FreeListHeap::nodes`].
pub struct Nodes<'h> {
    heap: &'h FreeListHeap,
    cursor: u32,
    walk: Walk,
}

impl Iterator for Nodes<'_> {
    type Item = HeapNode;

    fn next(&mut self) -> Option<HeapNode> {
        if self.cursor == NIL {
            return None;
        }
        let offset = self.cursor;
        let node = self.heap.read(offset);
        self.cursor = match self.walk {
            Walk::Adjacency => node.adj_next,
            Walk::List => node.list_next,
        };
        Some(HeapNode {
            offset: offset as usize,
            net_size: node.net_size as usize,
            allocated: node.allocated != 0,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const H: usize = HEADER_SIZE;

    fn heap(buffer: &mut [u8]) -> FreeListHeap {
        let mut heap = FreeListHeap::new();
        unsafe { heap.init(NonNull::new(buffer.as_mut_ptr()).unwrap(), buffer.len()) }.unwrap();
        heap
    }

    fn node(offset: usize, net_size: usize, allocated: bool) -> HeapNode {
        HeapNode {
            offset,
            net_size,
            allocated,
        }
    }

    #[test]
    fn init_creates_one_free_node() {
        let mut buffer = vec![0u8; 400];
        let heap = heap(&mut buffer);
        assert_eq!(heap.nodes().collect::<Vec<_>>(), [node(0, 400, false)]);
        assert_eq!(heap.free_memory(), 400);
        assert_eq!(heap.used_memory(), 0);
    }

    #[test]
    fn too_small_region_is_rejected() {
        let mut buffer = [0u8; 2 * H - 1];
        let mut heap = FreeListHeap::new();
        let result = unsafe { heap.init(NonNull::new(buffer.as_mut_ptr()).unwrap(), buffer.len()) };
        assert_eq!(result, Err(MemError::InvalidArgument));
        assert_eq!(heap.alloc(1), Err(MemError::OutOfMemory));
    }

    #[test]
    fn free_middle_does_not_coalesce() {
        let mut buffer = vec![0u8; 400];
        let mut heap = heap(&mut buffer);
        let a = heap.alloc(100).unwrap();
        let b = heap.alloc(50).unwrap();
        let c = heap.alloc(50).unwrap();
        assert_eq!(a.as_ptr() as usize + 100 + H, b.as_ptr() as usize);

        heap.free(b);
        let nodes: Vec<_> = heap.nodes().collect();
        assert_eq!(
            nodes,
            [
                node(0, H + 100, true),
                node(H + 100, H + 50, false),
                node(2 * H + 150, H + 50, true),
                node(3 * H + 200, 400 - 3 * H - 200, false),
            ]
        );
        let matching: Vec<_> = heap
            .free_nodes()
            .filter(|n| n.net_size == H + 50)
            .collect();
        assert_eq!(matching, [node(H + 100, H + 50, false)]);
        heap.check_integrity();
        heap.free(a);
        heap.free(c);
    }

    #[test]
    fn coalesce_both_neighbours() {
        let mut buffer = vec![0u8; 400];
        let mut heap = heap(&mut buffer);
        let a = heap.alloc(100).unwrap();
        let b = heap.alloc(50).unwrap();
        let c = heap.alloc(50).unwrap();

        heap.free(c);
        heap.free(a);
        // `c` merged with the tail remainder.
        assert_eq!(heap.nodes().count(), 3);
        heap.free(b);
        assert_eq!(heap.nodes().collect::<Vec<_>>(), [node(0, 400, false)]);
        assert_eq!(heap.free_nodes().count(), 1);
        heap.check_integrity();
    }

    #[test]
    fn request_needs_room_for_two_headers() {
        let mut buffer = vec![0u8; 200];
        let mut heap = heap(&mut buffer);
        assert_eq!(heap.alloc(200 - 2 * H + 1), Err(MemError::OutOfMemory));
        heap.alloc(200 - 2 * H).unwrap();
        assert_eq!(heap.used_memory(), 200 - H);
        assert_eq!(heap.free_memory(), H);
        assert_eq!(heap.alloc(1), Err(MemError::OutOfMemory));
    }

    #[test]
    fn zero_bytes_is_invalid() {
        let mut buffer = vec![0u8; 200];
        let mut heap = heap(&mut buffer);
        assert_eq!(heap.alloc(0), Err(MemError::InvalidArgument));
    }

    #[test]
    fn alloc_zeroed_clears_reused_memory() {
        let mut buffer = vec![0u8; 256];
        let mut heap = heap(&mut buffer);
        let p = heap.alloc(64).unwrap();
        unsafe { p.as_ptr().write_bytes(0xAA, 64) };
        heap.free(p);
        let q = heap.alloc_zeroed(64).unwrap();
        assert_eq!(p, q);
        let bytes = unsafe { core::slice::from_raw_parts(q.as_ptr(), 64) };
        assert!(bytes.iter().all(|&b| b == 0));
    }

    #[test]
    #[should_panic(expected = "is not allocated")]
    fn double_free_is_fatal() {
        let mut buffer = vec![0u8; 400];
        let mut heap = heap(&mut buffer);
        let a = heap.alloc(10).unwrap();
        heap.free(a);
        heap.free(a);
    }

    #[test]
    #[should_panic(expected = "is not allocated")]
    fn wild_pointer_is_fatal() {
        let mut buffer = vec![0u8; 400];
        let mut heap = heap(&mut buffer);
        let a = heap.alloc(10).unwrap();
        heap.free(NonNull::new(a.as_ptr().wrapping_add(1)).unwrap());
    }
}
