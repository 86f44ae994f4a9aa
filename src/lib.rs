#[cfg(not(target_pointer_width = "64"))]
compile_error!("bibop supports only 64-bit targets.");

// public module: contains implementation details (hidden via pub(crate))
pub mod heap;

// heap data structures
pub use heap::bits::{BitVector, BITS_PER_WORD};
pub use heap::pool::{
    bin_for_size, page_bits_set, Bin, BlkAttr, BlkInfo, PageBits, Pool, BIN_SIZES, MAX_SMALL_SIZE,
    N_SMALL_BINS, PAGE_BITS_WORDS, PAGE_SIZE, POOL_SIZE_MIN, SMALL_GRAIN,
};
pub use heap::small::{Buckets, FreeList, FreeNode};

// runtime upcalls
pub use heap::host::{Host, Segment};

// debug aids
#[cfg(feature = "leak-log")]
pub use heap::sentinel::AllocLog;
pub use heap::sentinel::{
    sentinel_add, sentinel_init, sentinel_invariant, sentinel_size, sentinel_sub, SENTINEL_EXTRA,
    STOMP_ALLOC, STOMP_FREE,
};

// errors
pub use heap::vm::VmError;
