//! Small-object (bin) operations on [`Pool`], plus the per-size free lists.
//!
//! A small page is sliced into equal slots of one bin class. Free slots hold
//! a [`FreeNode`] in place: the slot's first two words are the list link and
//! a back-reference to the owning pool. The smallest bin (16 bytes) is
//! exactly two machine words, which the 64-bit target guard in `lib.rs`
//! relies on.

use crate::heap::host::{Host, Segment};
use crate::heap::pool::{
    bin_for_size, page_bits_set, Bin, BlkAttr, BlkInfo, PageBits, Pool, N_SMALL_BINS,
    PAGE_BITS_WORDS, PAGE_SIZE, SMALL_GRAIN,
};
use crate::heap::sentinel;
use std::ptr::NonNull;

impl Pool {
    /// Claim the first free page for bin class `bin` and return its base
    /// address. `None` when the pool has no free page left.
    pub fn alloc_page(&mut self, bin: Bin) -> Option<NonNull<u8>> {
        debug_assert!(!self.is_large_object);
        debug_assert!(bin.is_small_object());

        let mut pn = self.search_start;
        while pn < self.npages && self.page_table[pn] != Bin::Free {
            pn += 1;
        }
        if pn == self.npages {
            return None;
        }

        self.search_start = pn + 1;
        self.page_table[pn] = bin;
        self.free_pages -= 1;
        log::trace!("alloc_page({bin:?}) -> page {pn}");
        // Safety: pn is within the mapping and the mapping is non-null.
        Some(unsafe { NonNull::new_unchecked(self.page_addr(pn)) })
    }

    pub(crate) fn small_get_size(&self, p: *const u8) -> usize {
        let bin = self.page_table[self.page_of(p)];
        debug_assert!(bin.is_small_object(), "get_size on a {bin:?} page");
        bin.size()
    }

    pub(crate) fn small_get_info(&self, p: *mut u8) -> BlkInfo {
        let pn = self.page_of(p);
        let bin = self.page_table[pn];
        if !bin.is_small_object() {
            return BlkInfo::default();
        }
        let size = bin.size();
        // bin sizes are powers of two dividing the page size, and the pool
        // base is page-aligned, so masking the absolute address is exact
        let base = (p as usize & !(size - 1)) as *mut u8;
        let biti = (base as usize - self.base.as_ptr() as usize) >> self.shift;
        BlkInfo {
            base,
            size,
            attr: self.get_bits(biti),
        }
    }

    /// Finalize (but do not relink) every finalizable slot whose finalizer
    /// lives in `segment`. Freed slots are recorded in `free_bits` via
    /// [`free_page_bits`](Pool::free_page_bits); pushing them back onto the
    /// bucket free lists is the sweep driver's job, with `free_bits` as its
    /// source of truth.
    pub(crate) fn small_run_finalizers(&mut self, segment: &Segment, host: &dyn Host) {
        if self.finals.n_bits() == 0 {
            return;
        }
        for pn in 0..self.npages {
            let bin = self.page_table[pn];
            if !bin.is_small_object() {
                continue;
            }
            let size = bin.size();
            let bit_stride = size / SMALL_GRAIN;
            let bit_base = pn * (PAGE_SIZE / SMALL_GRAIN);
            let page = self.page_addr(pn);

            let mut to_free: PageBits = [0; PAGE_BITS_WORDS];
            let mut freed_any = false;

            let mut offset = 0;
            let mut i = 0;
            while offset < PAGE_SIZE {
                let biti = bit_base + i;
                if self.finals.test(biti) {
                    // Safety: offset stays within the page.
                    let p = unsafe { page.add(offset) };
                    let q = sentinel::sentinel_add(p);
                    // Safety: q points at the slot payload.
                    let user_size = unsafe { sentinel::sentinel_size(q, size) };
                    let attr = self.get_bits(biti);

                    if host.has_finalizer_in_segment(q, user_size, attr, segment) {
                        host.finalize_from_gc(q, user_size, attr);
                        freed_any = true;
                        page_bits_set(&mut to_free, i);
                        log::trace!("collected {p:p} ({size} byte slot)");

                        #[cfg(feature = "leak-log")]
                        self.alloc_log.note_free(q);
                        #[cfg(feature = "memstomp")]
                        // Safety: the slot is owned by this pool and being
                        // reclaimed.
                        unsafe {
                            std::ptr::write_bytes(p, sentinel::STOMP_FREE, size);
                        }
                    }
                }
                offset += size;
                i += bit_stride;
            }

            if freed_any {
                self.free_page_bits(pn, &to_free);
            }
        }
    }
}

/// Link pair living in place inside a free bin slot. Never constructed in
/// isolation: the pool's mapping is the backing store, and `host` is a weak
/// back reference to the pool that outlives every slot it manages.
#[repr(C)]
pub struct FreeNode {
    pub next: Option<NonNull<FreeNode>>,
    pub host: *mut Pool,
}

/// Singly-linked stack of [`FreeNode`]s for one bin class.
pub struct FreeList {
    head: Option<NonNull<FreeNode>>,
}

impl FreeList {
    #[must_use]
    pub const fn new() -> Self {
        Self { head: None }
    }

    #[inline]
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.head.is_none()
    }

    #[inline]
    #[must_use]
    pub fn head(&self) -> Option<NonNull<FreeNode>> {
        self.head
    }

    /// Push a reclaimed slot. O(1); the node is not validated against the
    /// page table here — that is the sweep driver's responsibility.
    ///
    /// # Safety
    /// `node` must point to a writable slot of this list's bin class, with
    /// `host` already set to the owning pool.
    pub unsafe fn free(&mut self, node: NonNull<FreeNode>) {
        // Safety: upheld by caller.
        unsafe {
            (*node.as_ptr()).next = self.head;
        }
        self.head = Some(node);
    }

    /// Pop the most recently pushed slot.
    pub fn pop(&mut self) -> Option<NonNull<FreeNode>> {
        let node = self.head?;
        // Safety: nodes on the list satisfy the `free` contract.
        self.head = unsafe { (*node.as_ptr()).next };
        Some(node)
    }
}

impl Default for FreeList {
    fn default() -> Self {
        Self::new()
    }
}

/// One free list per small bin class.
pub struct Buckets {
    lists: [FreeList; N_SMALL_BINS],
}

impl Buckets {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            lists: [
                FreeList::new(),
                FreeList::new(),
                FreeList::new(),
                FreeList::new(),
                FreeList::new(),
                FreeList::new(),
                FreeList::new(),
                FreeList::new(),
            ],
        }
    }

    #[inline]
    #[must_use]
    pub fn list(&self, bin: Bin) -> &FreeList {
        &self.lists[bin as usize]
    }

    #[inline]
    #[must_use]
    pub fn list_mut(&mut self, bin: Bin) -> &mut FreeList {
        &mut self.lists[bin as usize]
    }

    /// Serve a small allocation of `size` bytes, applying `attr` to the slot.
    ///
    /// An empty bin list is first refilled by carving one fresh page out of
    /// the pool returned by `more_memory` (which may trigger a collection or
    /// create a pool before returning; `None` from it, or a pool with no
    /// free page, fails the allocation). Returns the slot address and the
    /// rounded-up bin size.
    ///
    /// # Safety
    /// Every pool a returned slot came from must outlive this bucket set,
    /// and the caller must serialize access (world stopped or pool lock
    /// held), as everywhere in the heap core.
    pub unsafe fn alloc<F>(
        &mut self,
        size: usize,
        attr: BlkAttr,
        more_memory: F,
    ) -> Option<(NonNull<u8>, usize)>
    where
        F: FnOnce() -> Option<NonNull<Pool>>,
    {
        let bin = bin_for_size(size);
        let alloc_size = bin.size();
        let list = &mut self.lists[bin as usize];

        if list.is_empty() {
            let pool = more_memory()?;
            // Safety: the driver hands us an exclusive, live pool.
            unsafe { Self::carve_page(list, pool, bin)? };
        }

        let node = list.pop()?;
        let p = node.cast::<u8>();
        // Safety: nodes carry a valid back reference to their live pool.
        let pool = unsafe { &mut *(*node.as_ptr()).host };

        let biti = (p.as_ptr() as usize - pool.base.as_ptr() as usize) >> pool.shift;
        pool.free_bits.clear(biti);
        if !attr.is_empty() {
            pool.set_bits(biti, attr);
        }

        #[cfg(feature = "memstomp")]
        // Safety: the slot was just taken off the free list.
        unsafe {
            std::ptr::write_bytes(p.as_ptr(), sentinel::STOMP_ALLOC, alloc_size);
        }
        #[cfg(feature = "leak-log")]
        pool.alloc_log
            .note_alloc(sentinel::sentinel_add(p.as_ptr()), alloc_size);

        Some((p, alloc_size))
    }

    /// Slice one fresh page of `pool` into `bin`-sized slots, thread them
    /// onto `list` in address order, and mark every slot free in the pool's
    /// `free_bits`.
    ///
    /// # Safety
    /// `pool` must be a live small-object pool with exclusive access.
    unsafe fn carve_page(
        list: &mut FreeList,
        pool: NonNull<Pool>,
        bin: Bin,
    ) -> Option<()> {
        // Safety: upheld by caller.
        let pool_ref = unsafe { &mut *pool.as_ptr() };
        let page = pool_ref.alloc_page(bin)?;
        let size = bin.size();
        let slots = PAGE_SIZE / size;
        let base_biti =
            (page.as_ptr() as usize - pool_ref.base.as_ptr() as usize) >> pool_ref.shift;
        let bit_stride = size / SMALL_GRAIN;

        debug_assert!(list.is_empty());
        let mut head: Option<NonNull<FreeNode>> = None;
        for k in (0..slots).rev() {
            // Safety: every slot lies within the freshly claimed page.
            let slot = unsafe { page.as_ptr().add(k * size) }.cast::<FreeNode>();
            // Safety: the slot is unused pool memory, large enough for a
            // FreeNode (16-byte minimum bin, 64-bit target).
            unsafe {
                (*slot).next = head;
                (*slot).host = pool.as_ptr();
            }
            // Safety: slot is non-null (derived from a NonNull page base).
            head = Some(unsafe { NonNull::new_unchecked(slot) });
            pool_ref.free_bits.set(base_biti + k * bit_stride);
        }
        list.head = head;
        log::trace!("carved page into {slots} slots of {size} bytes");
        Some(())
    }
}

impl Default for Buckets {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::heap::testutil::{all_segments, TestHost};

    #[test]
    fn test_alloc_page_scan_and_exhaustion() {
        let mut pool = Pool::new(2, false).unwrap();
        let p0 = pool.alloc_page(Bin::B64).unwrap();
        assert_eq!(p0.as_ptr(), pool.base.as_ptr());
        assert_eq!(pool.page_table[0], Bin::B64);
        assert_eq!(pool.free_pages, 1);
        assert_eq!(pool.search_start, 1);

        let p1 = pool.alloc_page(Bin::B16).unwrap();
        assert_eq!(p1.as_ptr() as usize, pool.base.as_ptr() as usize + PAGE_SIZE);
        assert_eq!(pool.free_pages, 0);

        assert!(pool.alloc_page(Bin::B16).is_none(), "pool exhausted");
        pool.check_invariants();
    }

    #[test]
    fn test_carve_links_in_address_order() {
        let mut pool = Pool::new(2, false).unwrap();
        let mut buckets = Buckets::new();
        let pool_ptr = NonNull::from(&mut pool);

        // Safety: Test code; the pool outlives the buckets.
        let (p, size) = unsafe {
            buckets
                .alloc(100, BlkAttr::empty(), || Some(pool_ptr))
                .unwrap()
        };
        assert_eq!(size, 128);
        assert_eq!(p.as_ptr(), pool.base.as_ptr(), "head slot is the page base");

        // walk the remaining list: strictly ascending addresses, every node
        // hosted by the pool, every node's free bit set
        let mut count = 0;
        let mut prev = p.as_ptr() as usize;
        let mut cursor = buckets.list(Bin::B128).head();
        while let Some(node) = cursor {
            let addr = node.as_ptr() as usize;
            assert!(addr > prev, "free list not in address order");
            prev = addr;
            // Safety: Test code; nodes live in the carved page.
            unsafe {
                assert_eq!((*node.as_ptr()).host, pool_ptr.as_ptr());
                cursor = (*node.as_ptr()).next;
            }
            let biti = (addr - pool.base.as_ptr() as usize) >> pool.shift;
            assert!(pool.free_bits.test(biti));
            count += 1;
        }
        assert_eq!(count, PAGE_SIZE / 128 - 1, "one slot was popped");

        // the popped slot is no longer free
        assert!(!pool.free_bits.test(0));
    }

    #[test]
    fn test_alloc_applies_attributes() {
        let mut pool = Pool::new(2, false).unwrap();
        let mut buckets = Buckets::new();
        let pool_ptr = NonNull::from(&mut pool);

        // Safety: Test code.
        let (p, _) = unsafe {
            buckets
                .alloc(32, BlkAttr::FINALIZE | BlkAttr::NO_SCAN, || Some(pool_ptr))
                .unwrap()
        };
        let biti = (p.as_ptr() as usize - pool.base.as_ptr() as usize) >> pool.shift;
        let got = pool.get_bits(biti);
        assert!(got.contains(BlkAttr::FINALIZE));
        assert!(got.contains(BlkAttr::NO_SCAN));
    }

    #[test]
    fn test_alloc_reuses_list_without_more_memory() {
        let mut pool = Pool::new(2, false).unwrap();
        let mut buckets = Buckets::new();
        let pool_ptr = NonNull::from(&mut pool);

        // Safety: Test code.
        unsafe {
            buckets
                .alloc(16, BlkAttr::empty(), || Some(pool_ptr))
                .unwrap();
            // list is primed; the callback must not fire again
            let (p, size) = buckets
                .alloc(16, BlkAttr::empty(), || {
                    panic!("more_memory called with a non-empty list")
                })
                .unwrap();
            assert_eq!(size, 16);
            assert_eq!(p.as_ptr() as usize % 16, 0);
        }
    }

    #[test]
    fn test_alloc_fails_when_no_memory() {
        let mut buckets = Buckets::new();
        // Safety: Test code.
        let r = unsafe { buckets.alloc(16, BlkAttr::empty(), || None) };
        assert!(r.is_none());
    }

    #[test]
    fn test_free_list_lifo() {
        let mut pool = Pool::new(1, false).unwrap();
        let mut buckets = Buckets::new();
        let pool_ptr = NonNull::from(&mut pool);

        // Safety: Test code.
        unsafe {
            let (a, _) = buckets.alloc(16, BlkAttr::empty(), || Some(pool_ptr)).unwrap();
            let (b, _) = buckets.alloc(16, BlkAttr::empty(), || unreachable!()).unwrap();
            assert_ne!(a, b);

            // push both back, as the sweep driver would
            let list = buckets.list_mut(Bin::B16);
            let node_a = a.cast::<FreeNode>();
            let node_b = b.cast::<FreeNode>();
            (*node_a.as_ptr()).host = pool_ptr.as_ptr();
            (*node_b.as_ptr()).host = pool_ptr.as_ptr();
            list.free(node_a);
            list.free(node_b);

            // LIFO: b comes back first
            let (c, _) = buckets.alloc(16, BlkAttr::empty(), || unreachable!()).unwrap();
            assert_eq!(c, b);
            let (d, _) = buckets.alloc(16, BlkAttr::empty(), || unreachable!()).unwrap();
            assert_eq!(d, a);
        }
    }

    #[test]
    fn test_small_get_size_and_info() {
        let mut pool = Pool::new(2, false).unwrap();
        pool.alloc_page(Bin::B256).unwrap();

        let base = pool.base.as_ptr();
        assert_eq!(pool.get_size(base), 256);

        // an interior pointer rounds down to its slot
        // Safety: Test code; pointer stays inside page 0.
        let interior = unsafe { base.add(3 * 256 + 77) };
        let info = pool.get_info(interior);
        assert_eq!(info.base as usize, base as usize + 3 * 256);
        assert_eq!(info.size, 256);
        let p = interior as usize;
        assert!(info.base as usize <= p && p < info.base as usize + info.size);

        // a pointer into a free page is not an owned allocation
        // Safety: Test code.
        let info = pool.get_info(unsafe { base.add(PAGE_SIZE) });
        assert!(info.base.is_null());
    }

    #[test]
    fn test_small_sweep_frees_slot() {
        // S1: alloc one 16-byte slot, finalize it, check the page bits
        let mut pool = Pool::new(4, false).unwrap();
        let mut buckets = Buckets::new();
        let pool_ptr = NonNull::from(&mut pool);

        // Safety: Test code.
        let (p, size) = unsafe {
            buckets
                .alloc(16, BlkAttr::FINALIZE, || Some(pool_ptr))
                .unwrap()
        };
        assert_eq!(size, 16);
        assert_eq!(p.as_ptr() as usize % 16, 0);
        assert_eq!(pool.page_table[0], Bin::B16);
        assert_eq!(pool.free_pages, 3);
        assert_eq!(pool.search_start, 1);

        let biti = (p.as_ptr() as usize - pool.base.as_ptr() as usize) >> pool.shift;
        pool.appendable.set(biti); // extra attribute to verify stripping
        assert!(!pool.free_bits.test(biti));

        let host = TestHost::new();
        pool.run_finalizers(&all_segments(), &host);

        assert_eq!(host.finalized_count(), 1);
        let (q, fsize, fattr) = host.finalized.borrow()[0];
        assert_eq!(q, sentinel::sentinel_add(p.as_ptr()) as usize);
        #[cfg(not(feature = "sentinel"))]
        assert_eq!(fsize, 16);
        #[cfg(feature = "sentinel")]
        let _ = fsize;
        assert!(fattr.contains(BlkAttr::FINALIZE));

        assert!(pool.free_bits.test(biti), "swept slot must be marked free");
        assert!(!pool.no_scan.test(biti));
        assert!(!pool.appendable.test(biti));
        assert!(!pool.finals.test(biti));

        // the sweep does not reclaim the page itself
        assert_eq!(pool.page_table[0], Bin::B16);
        assert_eq!(pool.free_pages, 3);
        pool.check_invariants();
    }

    #[test]
    fn test_small_sweep_skips_unfinalizable_slots() {
        let mut pool = Pool::new(2, false).unwrap();
        let mut buckets = Buckets::new();
        let pool_ptr = NonNull::from(&mut pool);

        // Safety: Test code.
        let (a, _) = unsafe {
            buckets
                .alloc(64, BlkAttr::FINALIZE, || Some(pool_ptr))
                .unwrap()
        };
        // Safety: Test code.
        let (b, _) = unsafe {
            buckets
                .alloc(64, BlkAttr::empty(), || unreachable!())
                .unwrap()
        };

        let host = TestHost::new();
        pool.run_finalizers(&all_segments(), &host);

        assert_eq!(host.finalized_count(), 1);
        let biti_a = (a.as_ptr() as usize - pool.base.as_ptr() as usize) >> pool.shift;
        let biti_b = (b.as_ptr() as usize - pool.base.as_ptr() as usize) >> pool.shift;
        assert!(pool.free_bits.test(biti_a));
        assert!(!pool.free_bits.test(biti_b), "live slot must survive");
    }

    #[test]
    fn test_distinct_bins_carve_distinct_pages() {
        let mut pool = Pool::new(4, false).unwrap();
        let mut buckets = Buckets::new();
        let pool_ptr = NonNull::from(&mut pool);

        // Safety: Test code.
        unsafe {
            buckets.alloc(16, BlkAttr::empty(), || Some(pool_ptr)).unwrap();
            buckets.alloc(2048, BlkAttr::empty(), || Some(pool_ptr)).unwrap();
        }
        assert_eq!(pool.page_table[0], Bin::B16);
        assert_eq!(pool.page_table[1], Bin::B2048);
        assert_eq!(pool.free_pages, 2);
        pool.check_invariants();
    }
}
