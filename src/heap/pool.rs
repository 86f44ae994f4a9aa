use crate::heap::bits::{BitVector, BITS_PER_WORD};
use crate::heap::host::{Host, Segment};
#[cfg(feature = "leak-log")]
use crate::heap::sentinel::AllocLog;
use crate::heap::stats;
use crate::heap::vm::{PlatformVmOps, VmError, VmOps};
use std::ptr::NonNull;

/// Heap page size. Fixed, independent of the OS page size (mappings are
/// always a multiple of it and at least as aligned).
pub const PAGE_SIZE: usize = 4096;

/// Minimum bytes the driver should request when creating a fresh pool.
pub const POOL_SIZE_MIN: usize = PAGE_SIZE * 256;

/// Granularity of small-object bookkeeping: one attribute bit per 16 bytes.
pub const SMALL_GRAIN: usize = 16;

/// Number of small-object size classes.
pub const N_SMALL_BINS: usize = 8;

/// Largest size served from a bin; anything bigger takes whole pages.
pub const MAX_SMALL_SIZE: usize = 2048;

/// Bit-index divisor shift: 4 for small pools (16-byte grain), 12 for large
/// pools (page grain).
const SMALL_SHIFT: u32 = 4;
const LARGE_SHIFT: u32 = 12;

/// Page table tag. The first eight values are the small-object size classes;
/// `Page`/`PagePlus` describe a multi-page run; `Free` is unallocated.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum Bin {
    B16 = 0,
    B32,
    B64,
    B128,
    B256,
    B512,
    B1024,
    B2048,
    /// First page of a large-object run.
    Page,
    /// Continuation page of a large-object run.
    PagePlus,
    Free,
}

/// Slot size for each small bin, indexed by `Bin as usize`.
pub const BIN_SIZES: [usize; N_SMALL_BINS] = [16, 32, 64, 128, 256, 512, 1024, 2048];

impl Bin {
    #[inline]
    #[must_use]
    pub fn is_small_object(self) -> bool {
        (self as u8) < Bin::Page as u8
    }

    /// Slot size of a small bin.
    #[inline]
    #[must_use]
    pub fn size(self) -> usize {
        debug_assert!(self.is_small_object(), "Bin::size on {self:?}");
        BIN_SIZES[self as usize]
    }
}

/// Requested byte size -> bin tag, for `0 ..= MAX_SMALL_SIZE`.
static BIN_TABLE: [Bin; MAX_SMALL_SIZE + 1] = build_bin_table();

const fn build_bin_table() -> [Bin; MAX_SMALL_SIZE + 1] {
    let mut table = [Bin::B16; MAX_SMALL_SIZE + 1];
    let mut size = 0;
    while size <= MAX_SMALL_SIZE {
        table[size] = if size <= 16 {
            Bin::B16
        } else if size <= 32 {
            Bin::B32
        } else if size <= 64 {
            Bin::B64
        } else if size <= 128 {
            Bin::B128
        } else if size <= 256 {
            Bin::B256
        } else if size <= 512 {
            Bin::B512
        } else if size <= 1024 {
            Bin::B1024
        } else {
            Bin::B2048
        };
        size += 1;
    }
    table
}

/// Bin class serving a request of `size` bytes. Sizes above
/// [`MAX_SMALL_SIZE`] belong on the large-object path and are a programming
/// error here.
#[inline]
#[must_use]
pub fn bin_for_size(size: usize) -> Bin {
    debug_assert!(
        size <= MAX_SMALL_SIZE,
        "request of {size} bytes belongs on the large-object path"
    );
    BIN_TABLE[size]
}

bitflags::bitflags! {
    /// Per-object attribute flags.
    ///
    /// The numeric values are ABI: the embedding runtime stores and compares
    /// them across the driver boundary. Do not renumber.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct BlkAttr: u32 {
        /// Object has a finalizer to run on reclamation.
        const FINALIZE = 1;
        /// Object contains no pointers; the marker skips its body.
        const NO_SCAN = 2;
        /// Object carries an appendable-length prefix.
        const APPENDABLE = 4;
        /// Interior pointers do not keep the object alive (large only).
        const NO_INTERIOR = 8;
        /// Finalizer is a struct destructor rather than a class one.
        const STRUCT_FINAL = 64;
    }
}

/// Descriptor of the allocation enclosing a pointer. A null `base` means
/// "not an owned allocation".
#[derive(Clone, Copy, Debug)]
pub struct BlkInfo {
    pub base: *mut u8,
    pub size: usize,
    pub attr: BlkAttr,
}

impl Default for BlkInfo {
    fn default() -> Self {
        Self {
            base: std::ptr::null_mut(),
            size: 0,
            attr: BlkAttr::empty(),
        }
    }
}

/// Words covering one page's worth of 16-byte slots (256 bits).
pub const PAGE_BITS_WORDS: usize = PAGE_SIZE / SMALL_GRAIN / BITS_PER_WORD;

/// One page's worth of slot bits, accumulated by the small-object sweep and
/// consumed word-parallel by [`Pool::free_page_bits`].
pub type PageBits = [usize; PAGE_BITS_WORDS];

/// Set in-page slot bit `i` of a [`PageBits`].
#[inline]
pub fn page_bits_set(bits: &mut PageBits, i: usize) {
    bits[i / BITS_PER_WORD] |= 1 << (i % BITS_PER_WORD);
}

/// One contiguous, page-aligned virtual region with its own page table and
/// attribute bitmaps.
///
/// A pool serves exactly one regime, fixed at creation: small pools slice
/// pages into fixed-size bins (one attribute bit per 16 bytes), large pools
/// hand out multi-page runs (one attribute bit per page). Cross-regime
/// operations (`get_info`, `get_size`, `run_finalizers`) dispatch on
/// `is_large_object`.
///
/// Fields are public: the external driver marks page runs and adjusts
/// `free_pages` directly after a successful [`alloc_pages`](Pool::alloc_pages),
/// exactly as it owns pool selection and locking. All operations assume the
/// world is stopped or the driver's pool lock is held.
pub struct Pool {
    pub base: NonNull<u8>,
    pub npages: usize,
    /// Count of `Bin::Free` entries in `page_table`.
    pub free_pages: usize,
    pub page_table: Vec<Bin>,
    pub is_large_object: bool,
    /// Divisor shift from byte offset to bit index (4 small, 12 large).
    pub shift: u32,

    // Always allocated.
    pub mark: BitVector,
    pub no_scan: BitVector,
    pub appendable: BitVector,
    /// Which 16-byte slots are currently free. Small regime only; stays in
    /// the unallocated state on large pools.
    pub free_bits: BitVector,

    // Lazily allocated on first set; `n_bits() == 0` reads as all-zero.
    pub finals: BitVector,
    pub struct_finals: BitVector,
    /// Large pools only.
    pub no_interior: BitVector,

    /// Lower bound: no free page exists below this index.
    pub search_start: usize,
    /// Upper bound on the largest contiguous free run. Large pools only;
    /// raised to `free_pages` on free, tightened on a failed search.
    pub largest_free: usize,
    /// Large pools only. For a `Page` at index `i`: the run length. For a
    /// `PagePlus`: the distance back to the owning `Page`.
    pub b_page_offsets: Vec<usize>,

    #[cfg(feature = "leak-log")]
    pub alloc_log: AllocLog,
}

// Safety: Pool owns the mapping; the driver serializes access.
unsafe impl Send for Pool {}

impl Pool {
    /// Map a region of `npages` pages and set up an empty pool.
    ///
    /// # Errors
    ///
    /// Returns `VmError` if `npages` is zero, the byte size overflows, or the
    /// mapping fails.
    pub fn new(npages: usize, is_large_object: bool) -> Result<Self, VmError> {
        let size = npages
            .checked_mul(PAGE_SIZE)
            .filter(|&s| s != 0)
            .ok_or_else(|| {
                VmError::InitializationFailed(format!("invalid pool size: {npages} pages"))
            })?;

        // Safety: FFI call to map memory.
        let base = unsafe { PlatformVmOps::map(size)? };

        stats::TOTAL_MAPPED.add(size);
        stats::TOTAL_POOLS.add(1);

        let shift = if is_large_object {
            LARGE_SHIFT
        } else {
            SMALL_SHIFT
        };
        let n_bits = size >> shift;

        Ok(Self {
            base,
            npages,
            free_pages: npages,
            page_table: vec![Bin::Free; npages],
            is_large_object,
            shift,
            mark: BitVector::allocate(n_bits),
            no_scan: BitVector::allocate(n_bits),
            appendable: BitVector::allocate(n_bits),
            free_bits: if is_large_object {
                BitVector::new()
            } else {
                BitVector::allocate(n_bits)
            },
            finals: BitVector::new(),
            struct_finals: BitVector::new(),
            no_interior: BitVector::new(),
            search_start: 0,
            largest_free: npages,
            b_page_offsets: if is_large_object {
                vec![0; npages]
            } else {
                Vec::new()
            },
            #[cfg(feature = "leak-log")]
            alloc_log: AllocLog::new(),
        })
    }

    /// One past the last byte of the region.
    #[inline]
    #[must_use]
    pub fn top(&self) -> *mut u8 {
        // Safety: stays within the mapping plus one (past-the-end is valid
        // to compute).
        unsafe { self.base.as_ptr().add(self.npages * PAGE_SIZE) }
    }

    #[inline]
    #[must_use]
    pub fn contains(&self, p: *const u8) -> bool {
        let addr = p as usize;
        let base = self.base.as_ptr() as usize;
        addr >= base && addr < base + self.npages * PAGE_SIZE
    }

    /// Page index of `p`. Precondition: `p` lies inside the pool.
    #[inline]
    #[must_use]
    pub fn page_of(&self, p: *const u8) -> usize {
        debug_assert!(self.contains(p), "pointer {p:p} does not belong to this pool");
        (p as usize - self.base.as_ptr() as usize) / PAGE_SIZE
    }

    /// Byte address of page `pn`.
    #[inline]
    pub(crate) fn page_addr(&self, pn: usize) -> *mut u8 {
        debug_assert!(pn < self.npages);
        // Safety: pn is within the mapping.
        unsafe { self.base.as_ptr().add(pn * PAGE_SIZE) }
    }

    /// Read the attribute flags stored at bit index `biti`. Bitmaps still in
    /// the unallocated state read as zero.
    #[must_use]
    pub fn get_bits(&self, biti: usize) -> BlkAttr {
        let mut attr = BlkAttr::empty();
        if self.finals.n_bits() != 0 && self.finals.test(biti) {
            attr |= BlkAttr::FINALIZE;
        }
        if self.struct_finals.n_bits() != 0 && self.struct_finals.test(biti) {
            attr |= BlkAttr::STRUCT_FINAL;
        }
        if self.no_scan.test(biti) {
            attr |= BlkAttr::NO_SCAN;
        }
        if self.no_interior.n_bits() != 0 && self.no_interior.test(biti) {
            attr |= BlkAttr::NO_INTERIOR;
        }
        if self.appendable.test(biti) {
            attr |= BlkAttr::APPENDABLE;
        }
        attr
    }

    /// Set the requested attribute flags at bit index `biti`, allocating the
    /// lazy bitmaps on first use. `NO_INTERIOR` only exists for large
    /// objects and is ignored on small pools.
    pub fn set_bits(&mut self, biti: usize, attr: BlkAttr) {
        let n_bits = self.mark.n_bits();
        if attr.contains(BlkAttr::FINALIZE) {
            if self.finals.n_bits() == 0 {
                self.finals = BitVector::allocate(n_bits);
            }
            self.finals.set(biti);
        }
        if attr.contains(BlkAttr::STRUCT_FINAL) {
            if self.struct_finals.n_bits() == 0 {
                self.struct_finals = BitVector::allocate(n_bits);
            }
            self.struct_finals.set(biti);
        }
        if attr.contains(BlkAttr::NO_SCAN) {
            self.no_scan.set(biti);
        }
        if attr.contains(BlkAttr::NO_INTERIOR) && self.is_large_object {
            if self.no_interior.n_bits() == 0 {
                self.no_interior = BitVector::allocate(n_bits);
            }
            self.no_interior.set(biti);
        }
        if attr.contains(BlkAttr::APPENDABLE) {
            self.appendable.set(biti);
        }
    }

    /// Clear the requested attribute flags at bit index `biti`. Clearing in a
    /// bitmap still in the unallocated state is a no-op.
    pub fn clear_bits(&mut self, biti: usize, attr: BlkAttr) {
        if attr.contains(BlkAttr::FINALIZE) && self.finals.n_bits() != 0 {
            self.finals.clear(biti);
        }
        if attr.contains(BlkAttr::STRUCT_FINAL) && self.struct_finals.n_bits() != 0 {
            self.struct_finals.clear(biti);
        }
        if attr.contains(BlkAttr::NO_SCAN) {
            self.no_scan.clear(biti);
        }
        if attr.contains(BlkAttr::NO_INTERIOR) && self.no_interior.n_bits() != 0 {
            self.no_interior.clear(biti);
        }
        if attr.contains(BlkAttr::APPENDABLE) {
            self.appendable.clear(biti);
        }
    }

    /// Mark every slot bit set in `to_free` as free and strip its
    /// attributes, one word at a time. Small pools only.
    pub fn free_page_bits(&mut self, page_num: usize, to_free: &PageBits) {
        debug_assert!(!self.is_large_object);
        debug_assert!(self.no_interior.n_bits() == 0); // large-only bitmap
        debug_assert!(page_num < self.npages);

        let beg = page_num * PAGE_BITS_WORDS;
        for (i, &w) in to_free.iter().enumerate() {
            if w == 0 {
                continue;
            }
            let wi = beg + i;
            self.free_bits.or_word(wi, w);
            self.no_scan.and_not_word(wi, w);
            self.appendable.and_not_word(wi, w);
        }

        if self.finals.n_bits() != 0 {
            for (i, &w) in to_free.iter().enumerate() {
                if w != 0 {
                    self.finals.and_not_word(beg + i, w);
                }
            }
        }
        if self.struct_finals.n_bits() != 0 {
            for (i, &w) in to_free.iter().enumerate() {
                if w != 0 {
                    self.struct_finals.and_not_word(beg + i, w);
                }
            }
        }
    }

    /// Resolve an arbitrary (possibly interior) pointer into the pool to its
    /// enclosing allocation. An empty descriptor (null `base`) means the
    /// pointer does not hit an owned allocation.
    #[must_use]
    pub fn get_info(&self, p: *mut u8) -> BlkInfo {
        if self.is_large_object {
            self.large_get_info(p)
        } else {
            self.small_get_info(p)
        }
    }

    /// Size in bytes of the allocation starting at `p`.
    #[must_use]
    pub fn get_size(&self, p: *const u8) -> usize {
        if self.is_large_object {
            self.large_get_size(p)
        } else {
            self.small_get_size(p)
        }
    }

    /// Run the finalizer of every finalizable object whose finalizer code
    /// lives in `segment`, then release the object's space.
    pub fn run_finalizers(&mut self, segment: &Segment, host: &dyn Host) {
        if self.is_large_object {
            self.large_run_finalizers(segment, host);
        } else {
            self.small_run_finalizers(segment, host);
        }
    }

    /// Validate the structural invariants. Debug/test aid.
    #[cfg(any(debug_assertions, test))]
    pub fn check_invariants(&self) {
        let free = self
            .page_table
            .iter()
            .filter(|&&tag| tag == Bin::Free)
            .count();
        assert_eq!(free, self.free_pages, "free_pages out of sync");

        for pn in 0..self.search_start.min(self.npages) {
            assert_ne!(
                self.page_table[pn],
                Bin::Free,
                "free page {pn} below search_start {}",
                self.search_start
            );
        }

        if self.is_large_object {
            let mut pn = 0;
            while pn < self.npages {
                match self.page_table[pn] {
                    Bin::Page => {
                        let len = self.b_page_offsets[pn];
                        assert!(len >= 1 && pn + len <= self.npages, "bad run at {pn}");
                        for k in 1..len {
                            assert_eq!(self.page_table[pn + k], Bin::PagePlus);
                            assert_eq!(self.b_page_offsets[pn + k], k);
                        }
                        pn += len;
                    }
                    Bin::PagePlus => panic!("orphan PagePlus at {pn}"),
                    _ => pn += 1,
                }
            }
        } else {
            // a set free_bits word implies its page holds a small bin
            for wi in 0..self.free_bits.n_words() {
                if self.free_bits.word(wi) != 0 {
                    let pn = wi / PAGE_BITS_WORDS;
                    assert!(
                        self.page_table[pn].is_small_object(),
                        "free_bits set on non-bin page {pn}"
                    );
                }
            }
        }
    }
}

impl Drop for Pool {
    fn drop(&mut self) {
        let size = self.npages * PAGE_SIZE;
        // Safety: we own the mapping and no live allocation may reference a
        // pool being destroyed.
        unsafe {
            drop(PlatformVmOps::unmap(self.base, size));
        }
        stats::TOTAL_MAPPED.sub(size);
        stats::TOTAL_POOLS.sub(1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_small_pool() {
        let pool = Pool::new(4, false).unwrap();
        assert_eq!(pool.npages, 4);
        assert_eq!(pool.free_pages, 4);
        assert!(pool.page_table.iter().all(|&t| t == Bin::Free));
        assert_eq!(pool.shift, 4);
        assert_eq!(pool.mark.n_bits(), 4 * PAGE_SIZE / 16);
        assert_eq!(pool.free_bits.n_bits(), 4 * PAGE_SIZE / 16);
        // lazy bitmaps start unallocated
        assert_eq!(pool.finals.n_bits(), 0);
        assert_eq!(pool.struct_finals.n_bits(), 0);
        assert_eq!(pool.no_interior.n_bits(), 0);
        assert!(pool.b_page_offsets.is_empty());
        assert_eq!(pool.search_start, 0);
        pool.check_invariants();
    }

    #[test]
    fn test_new_large_pool() {
        let pool = Pool::new(8, true).unwrap();
        assert_eq!(pool.shift, 12);
        assert_eq!(pool.mark.n_bits(), 8);
        assert_eq!(pool.free_bits.n_bits(), 0, "free_bits is small-only");
        assert_eq!(pool.b_page_offsets.len(), 8);
        assert_eq!(pool.largest_free, 8);
        pool.check_invariants();
    }

    #[test]
    fn test_new_zero_pages_fails() {
        assert!(Pool::new(0, false).is_err());
    }

    #[test]
    fn test_address_range() {
        let pool = Pool::new(4, false).unwrap();
        let base = pool.base.as_ptr();
        assert_eq!(base as usize % PAGE_SIZE, 0);
        assert_eq!(pool.top() as usize - base as usize, 4 * PAGE_SIZE);
        assert!(pool.contains(base));
        // Safety: Test code; in-range pointer arithmetic.
        unsafe {
            assert!(pool.contains(base.add(4 * PAGE_SIZE - 1)));
            assert_eq!(pool.page_of(base.add(PAGE_SIZE)), 1);
            assert_eq!(pool.page_of(base.add(3 * PAGE_SIZE + 17)), 3);
        }
        assert!(!pool.contains(pool.top()));
    }

    #[test]
    fn test_bin_table_boundaries() {
        // B1: requested-size routing at every class boundary
        assert_eq!(bin_for_size(0), Bin::B16);
        assert_eq!(bin_for_size(1), Bin::B16);
        assert_eq!(bin_for_size(16), Bin::B16);
        assert_eq!(bin_for_size(17), Bin::B32);
        assert_eq!(bin_for_size(32), Bin::B32);
        assert_eq!(bin_for_size(33), Bin::B64);
        assert_eq!(bin_for_size(1024), Bin::B1024);
        assert_eq!(bin_for_size(1025), Bin::B2048);
        assert_eq!(bin_for_size(2048), Bin::B2048);
    }

    #[cfg(debug_assertions)]
    #[test]
    #[should_panic(expected = "large-object path")]
    fn test_bin_for_size_rejects_large() {
        // 2049 must be routed to the large path by the caller.
        let _ = bin_for_size(2049);
    }

    #[test]
    fn test_bin_sizes() {
        assert_eq!(Bin::B16.size(), 16);
        assert_eq!(Bin::B2048.size(), 2048);
        assert!(Bin::B16.is_small_object());
        assert!(!Bin::Page.is_small_object());
        assert!(!Bin::Free.is_small_object());
        // every bin holds the in-place free node (two machine words)
        for size in BIN_SIZES {
            assert!(size >= 2 * std::mem::size_of::<usize>());
        }
    }

    #[test]
    fn test_attr_roundtrip() {
        let mut pool = Pool::new(2, false).unwrap();
        let attr = BlkAttr::FINALIZE | BlkAttr::NO_SCAN | BlkAttr::APPENDABLE;
        pool.set_bits(7, attr);
        assert_eq!(pool.get_bits(7) & attr, attr);
        assert_eq!(pool.get_bits(8), BlkAttr::empty());

        pool.clear_bits(7, attr);
        assert_eq!(pool.get_bits(7) & attr, BlkAttr::empty());
    }

    #[test]
    fn test_set_bits_allocates_lazily() {
        let mut pool = Pool::new(2, false).unwrap();
        assert_eq!(pool.finals.n_bits(), 0);
        pool.set_bits(3, BlkAttr::FINALIZE);
        assert_eq!(pool.finals.n_bits(), pool.mark.n_bits());
        assert!(pool.finals.test(3));

        assert_eq!(pool.struct_finals.n_bits(), 0);
        pool.set_bits(3, BlkAttr::STRUCT_FINAL);
        assert_eq!(pool.struct_finals.n_bits(), pool.mark.n_bits());
    }

    #[test]
    fn test_no_interior_ignored_on_small_pool() {
        let mut pool = Pool::new(2, false).unwrap();
        pool.set_bits(0, BlkAttr::NO_INTERIOR);
        assert_eq!(pool.no_interior.n_bits(), 0);
        assert!(!pool.get_bits(0).contains(BlkAttr::NO_INTERIOR));
    }

    #[test]
    fn test_no_interior_on_large_pool() {
        let mut pool = Pool::new(2, true).unwrap();
        pool.set_bits(1, BlkAttr::NO_INTERIOR);
        assert!(pool.get_bits(1).contains(BlkAttr::NO_INTERIOR));
        pool.clear_bits(1, BlkAttr::NO_INTERIOR);
        assert!(!pool.get_bits(1).contains(BlkAttr::NO_INTERIOR));
    }

    #[test]
    fn test_clear_bits_on_unallocated_bitmap_is_noop() {
        let mut pool = Pool::new(2, false).unwrap();
        pool.clear_bits(0, BlkAttr::FINALIZE | BlkAttr::STRUCT_FINAL);
        assert_eq!(pool.finals.n_bits(), 0);
    }

    #[test]
    fn test_free_page_bits_word_parallel() {
        let mut pool = Pool::new(2, false).unwrap();
        // page 1, slots 0, 5 and 200
        let slots = [0usize, 5, 200];
        let page = 1usize;
        let page_base_bit = page * (PAGE_SIZE / SMALL_GRAIN);
        let mut to_free: PageBits = [0; PAGE_BITS_WORDS];
        for &s in &slots {
            pool.set_bits(page_base_bit + s, BlkAttr::FINALIZE | BlkAttr::NO_SCAN);
            pool.appendable.set(page_base_bit + s);
            page_bits_set(&mut to_free, s);
        }

        pool.free_page_bits(page, &to_free);

        for &s in &slots {
            let biti = page_base_bit + s;
            assert!(pool.free_bits.test(biti), "slot {s} not marked free");
            assert!(!pool.no_scan.test(biti));
            assert!(!pool.appendable.test(biti));
            assert!(!pool.finals.test(biti));
        }
        // untouched neighbours keep their state
        assert!(!pool.free_bits.test(page_base_bit + 1));
    }

    #[test]
    fn test_get_info_on_free_page_is_empty() {
        let pool = Pool::new(2, false).unwrap();
        let info = pool.get_info(pool.base.as_ptr());
        assert!(info.base.is_null());
        assert_eq!(info.size, 0);

        let large = Pool::new(2, true).unwrap();
        let info = large.get_info(large.base.as_ptr());
        assert!(info.base.is_null());
    }
}
