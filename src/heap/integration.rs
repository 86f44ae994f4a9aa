//! Randomized cross-module tests: long alloc/free sequences against shadow
//! models, checking the structural invariants after every step.

use crate::heap::pool::{Bin, BlkAttr, Pool, PAGE_SIZE, SMALL_GRAIN};
use crate::heap::small::{Buckets, FreeNode};
use fixedbitset::FixedBitSet;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::ptr::NonNull;

/// Longest free run currently in the page table.
fn actual_largest_free(pool: &Pool) -> usize {
    let mut largest = 0;
    let mut run = 0;
    for &tag in &pool.page_table {
        if tag == Bin::Free {
            run += 1;
            largest = largest.max(run);
        } else {
            run = 0;
        }
    }
    largest
}

fn lowest_free_page(pool: &Pool) -> Option<usize> {
    pool.page_table.iter().position(|&t| t == Bin::Free)
}

#[test]
fn test_random_large_sequences() {
    // X1: 500 random page-run allocs/frees against a shadow run list
    let mut rng = StdRng::seed_from_u64(0x9E37_79B9);
    let mut pool = Pool::new(64, true).unwrap();
    let mut live: Vec<(usize, usize)> = Vec::new();

    for _ in 0..500 {
        if live.is_empty() || rng.gen_bool(0.6) {
            let n = rng.gen_range(1..=6);
            match pool.alloc_pages(n) {
                Some(pn) => {
                    // the returned run must be entirely free
                    assert!(pool.page_table[pn..pn + n].iter().all(|&t| t == Bin::Free));
                    pool.page_table[pn] = Bin::Page;
                    for k in 1..n {
                        pool.page_table[pn + k] = Bin::PagePlus;
                    }
                    pool.free_pages -= n;
                    pool.update_offsets(pn);
                    assert_eq!(pool.get_size(pool.page_addr(pn)), n * PAGE_SIZE);
                    live.push((pn, n));
                }
                None => {
                    // a miss must mean no run of length n exists
                    assert!(
                        actual_largest_free(&pool) < n,
                        "alloc_pages({n}) missed an existing run"
                    );
                }
            }
        } else {
            let (pn, n) = live.swap_remove(rng.gen_range(0..live.len()));
            pool.free_pages(pn, n);
        }

        pool.check_invariants();
        assert!(pool.largest_free >= actual_largest_free(&pool));
        if let Some(lowest) = lowest_free_page(&pool) {
            assert!(pool.search_start <= lowest);
        }

        // interior pointers of a random live run resolve to the run
        if let Some(&(pn, n)) = live.first() {
            let base = pool.page_addr(pn);
            // Safety: Test code; pointer stays inside the run.
            let p = unsafe { base.add(rng.gen_range(0..n * PAGE_SIZE)) };
            let info = pool.get_info(p);
            assert_eq!(info.base, base);
            assert_eq!(info.size, n * PAGE_SIZE);
        }
    }
}

#[test]
fn test_random_small_sequences() {
    // X2: bucket allocs and driver-style frees against a FixedBitSet shadow
    let mut rng = StdRng::seed_from_u64(0xB5297A4D);
    let mut pool = Pool::new(16, false).unwrap();
    let mut buckets = Buckets::new();
    let pool_ptr = NonNull::from(&mut pool);
    let pool_base = pool.base.as_ptr() as usize;

    let mut shadow_live = FixedBitSet::with_capacity(pool.mark.n_bits());
    let mut live: Vec<(NonNull<u8>, usize)> = Vec::new();

    let attrs = [
        BlkAttr::empty(),
        BlkAttr::FINALIZE,
        BlkAttr::NO_SCAN,
        BlkAttr::FINALIZE | BlkAttr::APPENDABLE,
    ];

    for _ in 0..400 {
        if live.is_empty() || rng.gen_bool(0.6) {
            let size = rng.gen_range(1..=2048);
            let attr = attrs[rng.gen_range(0..attrs.len())];
            // Safety: Test code; the pool outlives the buckets.
            let Some((p, alloc_size)) =
                (unsafe { buckets.alloc(size, attr, || Some(pool_ptr)) })
            else {
                continue; // pool exhausted for this bin
            };
            assert!(alloc_size >= size);
            assert_eq!((p.as_ptr() as usize) % alloc_size, 0);

            let biti = (p.as_ptr() as usize - pool_base) >> pool.shift;
            assert!(!pool.free_bits.test(biti), "allocated slot marked free");
            assert_eq!(pool.get_bits(biti) & attr, attr);
            shadow_live.insert(biti);
            live.push((p, alloc_size));
        } else {
            let (p, alloc_size) = live.swap_remove(rng.gen_range(0..live.len()));
            let biti = (p.as_ptr() as usize - pool_base) >> pool.shift;

            // driver-style free: strip attributes, mark the slot free,
            // relink it into its bucket
            pool.clear_bits(biti, BlkAttr::all());
            pool.free_bits.set(biti);
            let node = p.cast::<FreeNode>();
            // Safety: Test code; the slot belongs to this pool.
            unsafe {
                (*node.as_ptr()).host = pool_ptr.as_ptr();
                buckets
                    .list_mut(crate::heap::pool::bin_for_size(alloc_size))
                    .free(node);
            }
            shadow_live.set(biti, false);
            assert_eq!(pool.get_bits(biti), BlkAttr::empty());
        }
        pool.check_invariants();
    }

    // every slot of every bin page is either live (shadow) or free (bit set)
    for pn in 0..pool.npages {
        let bin = pool.page_table[pn];
        if !bin.is_small_object() {
            continue;
        }
        let stride = bin.size() / SMALL_GRAIN;
        let base_bit = pn * (PAGE_SIZE / SMALL_GRAIN);
        for slot in 0..PAGE_SIZE / bin.size() {
            let biti = base_bit + slot * stride;
            assert_eq!(
                pool.free_bits.test(biti),
                !shadow_live.contains(biti),
                "slot bit {biti} disagrees with the shadow model"
            );
        }
    }

    // every node reachable from a free list has its free bit set
    for &bin in &[
        Bin::B16,
        Bin::B32,
        Bin::B64,
        Bin::B128,
        Bin::B256,
        Bin::B512,
        Bin::B1024,
        Bin::B2048,
    ] {
        let mut cursor = buckets.list(bin).head();
        while let Some(node) = cursor {
            let addr = node.as_ptr() as usize;
            let biti = (addr - pool_base) >> pool.shift;
            assert!(pool.free_bits.test(biti), "listed slot not marked free");
            assert_eq!(pool.page_table[pool.page_of(addr as *const u8)], bin);
            // Safety: Test code; nodes live in pool pages.
            cursor = unsafe { (*node.as_ptr()).next };
        }
    }
}

#[test]
fn test_random_attr_roundtrips() {
    // X3: set/get/clear over random bit indices on both regimes
    let mut rng = StdRng::seed_from_u64(0x1F12_3BB5);
    let mut small = Pool::new(4, false).unwrap();
    let mut large = Pool::new(32, true).unwrap();

    let flags = [
        BlkAttr::FINALIZE,
        BlkAttr::NO_SCAN,
        BlkAttr::APPENDABLE,
        BlkAttr::NO_INTERIOR,
        BlkAttr::STRUCT_FINAL,
    ];

    for _ in 0..300 {
        let mut attr = BlkAttr::empty();
        for f in flags {
            if rng.gen_bool(0.5) {
                attr |= f;
            }
        }

        let biti = rng.gen_range(0..small.mark.n_bits());
        small.set_bits(biti, attr);
        let expected = attr - BlkAttr::NO_INTERIOR; // small pools drop it
        assert_eq!(small.get_bits(biti) & attr, expected);
        small.clear_bits(biti, attr);
        assert_eq!(small.get_bits(biti) & attr, BlkAttr::empty());

        let biti = rng.gen_range(0..large.mark.n_bits());
        large.set_bits(biti, attr);
        assert_eq!(large.get_bits(biti) & attr, attr);
        large.clear_bits(biti, attr);
        assert_eq!(large.get_bits(biti) & attr, BlkAttr::empty());
    }
}
