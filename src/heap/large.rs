//! Large-object (whole-page-run) operations on [`Pool`].
//!
//! A run of `n` pages is a leading `Bin::Page` followed by `n - 1`
//! `Bin::PagePlus` tags. `b_page_offsets` carries the run length at the head
//! and the back-distance at every continuation, so both the forward skip in
//! the free-run search and the backward walk for interior pointers are O(1).

use crate::heap::host::{Host, Segment};
use crate::heap::pool::{Bin, BlkAttr, BlkInfo, Pool, PAGE_SIZE};
use crate::heap::sentinel;

impl Pool {
    /// Find the lowest index `i` such that pages `[i, i + n)` are all free.
    ///
    /// On success the caller must tag the run (`Page` + `PagePlus`), adjust
    /// `free_pages`, and call [`update_offsets`](Pool::update_offsets).
    /// `None` means no such run exists; as a side effect `largest_free` is
    /// tightened to the longest run actually seen, so the next oversized
    /// request returns without scanning.
    pub fn alloc_pages(&mut self, n: usize) -> Option<usize> {
        debug_assert!(self.is_large_object);
        debug_assert!(n >= 1);

        if self.largest_free < n || self.search_start + n > self.npages {
            return None;
        }

        // Normalize the hint: step out of a run interior, then hop over
        // whole runs until it rests on a free page or past the end.
        if self.page_table[self.search_start] == Bin::PagePlus {
            self.search_start -= self.b_page_offsets[self.search_start];
        }
        while self.search_start < self.npages && self.page_table[self.search_start] == Bin::Page {
            self.search_start += self.b_page_offsets[self.search_start];
        }

        let mut largest = 0;
        let mut i = self.search_start;
        while i < self.npages {
            match self.page_table[i] {
                Bin::Free => {
                    let start = i;
                    while i < self.npages && i - start < n && self.page_table[i] == Bin::Free {
                        i += 1;
                    }
                    let run = i - start;
                    if run == n {
                        log::trace!("alloc_pages({n}) -> page {start}");
                        return Some(start);
                    }
                    largest = largest.max(run);
                }
                Bin::Page => i += self.b_page_offsets[i],
                _ => i += 1,
            }
        }

        // Tighten the bound so the next request of this size early-outs.
        self.largest_free = largest;
        None
    }

    /// Return pages `[page_num, page_num + count)` to the free state.
    pub fn free_pages(&mut self, page_num: usize, count: usize) {
        debug_assert!(self.is_large_object);
        debug_assert!(page_num + count <= self.npages);

        if page_num < self.search_start {
            self.search_start = page_num;
        }
        for pn in page_num..page_num + count {
            if self.page_table[pn] != Bin::Free {
                self.free_pages += 1;
            }
            self.page_table[pn] = Bin::Free;
        }
        // Pessimistic invalidation; tightened again on the next failed search.
        self.largest_free = self.free_pages;
        log::trace!("free_pages({page_num}, {count})");
    }

    /// Record run metadata for the run headed at `from`: each continuation
    /// page gets its distance back to the head, the head gets the length.
    pub fn update_offsets(&mut self, from: usize) {
        debug_assert!(self.is_large_object);
        debug_assert!(self.page_table[from] == Bin::Page);

        let mut pn = from + 1;
        while pn < self.npages && self.page_table[pn] == Bin::PagePlus {
            self.b_page_offsets[pn] = pn - from;
            pn += 1;
        }
        self.b_page_offsets[from] = pn - from;
    }

    /// Record a freshly reserved run in the allocation log. Driver hook,
    /// called after the run is tagged and [`update_offsets`](Pool::update_offsets)
    /// has run; the small path records inside
    /// [`Buckets::alloc`](crate::heap::small::Buckets::alloc). The sweep
    /// removes the entry on both paths.
    #[cfg(feature = "leak-log")]
    pub fn log_alloc_pages(&mut self, page_num: usize) {
        debug_assert!(self.is_large_object);
        debug_assert!(self.page_table[page_num] == Bin::Page);
        let q = sentinel::sentinel_add(self.page_addr(page_num));
        let size = self.b_page_offsets[page_num] * PAGE_SIZE - sentinel::SENTINEL_EXTRA;
        self.alloc_log.note_alloc(q, size);
    }

    pub(crate) fn large_get_size(&self, p: *const u8) -> usize {
        let pn = self.page_of(p);
        debug_assert!(
            self.page_table[pn] == Bin::Page,
            "get_size on a pointer that is not a run head"
        );
        self.b_page_offsets[pn] * PAGE_SIZE
    }

    pub(crate) fn large_get_info(&self, p: *mut u8) -> BlkInfo {
        let mut pn = self.page_of(p);
        if self.page_table[pn] == Bin::PagePlus {
            pn -= self.b_page_offsets[pn];
        }
        if self.page_table[pn] != Bin::Page {
            return BlkInfo::default();
        }
        BlkInfo {
            base: self.page_addr(pn),
            size: self.b_page_offsets[pn] * PAGE_SIZE,
            attr: self.get_bits(pn),
        }
    }

    pub(crate) fn large_run_finalizers(&mut self, segment: &Segment, host: &dyn Host) {
        if self.finals.n_bits() == 0 {
            return;
        }
        for pn in 0..self.npages {
            if self.page_table[pn] != Bin::Page {
                continue;
            }
            let biti = pn;
            if !self.finals.test(biti) {
                continue;
            }

            let pbase = self.page_addr(pn);
            let q = sentinel::sentinel_add(pbase);
            // Safety: q points at the object payload within the run.
            let size = unsafe {
                sentinel::sentinel_size(
                    q,
                    self.b_page_offsets[pn] * PAGE_SIZE - sentinel::SENTINEL_EXTRA,
                )
            };
            let attr = self.get_bits(biti);

            if !host.has_finalizer_in_segment(q, size, attr, segment) {
                continue;
            }
            host.finalize_from_gc(q, size, attr);
            log::trace!("collected large object at {pbase:p} ({size} bytes)");

            self.clear_bits(biti, BlkAttr::all());
            if pn < self.search_start {
                self.search_start = pn;
            }

            #[cfg(feature = "leak-log")]
            self.alloc_log.note_free(q);

            let mut run = 1;
            while pn + run < self.npages && self.page_table[pn + run] == Bin::PagePlus {
                run += 1;
            }
            #[cfg(feature = "memstomp")]
            // Safety: the run is owned by this pool and being reclaimed.
            unsafe {
                std::ptr::write_bytes(pbase, sentinel::STOMP_FREE, run * PAGE_SIZE);
            }
            self.free_pages(pn, run);
        }
    }
}
