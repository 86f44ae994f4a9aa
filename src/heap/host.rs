use crate::heap::pool::BlkAttr;

/// Address range of a code segment whose finalizers should run, as passed to
/// [`Pool::run_finalizers`](crate::heap::pool::Pool::run_finalizers). The
/// heap only forwards the range; membership of a finalizer in the segment is
/// the host's call.
pub type Segment = core::ops::Range<usize>;

/// Upcalls into the embedding runtime.
///
/// Every method runs under the world-stop the driver imposes, and none of
/// them may allocate managed memory or trigger a collection — doing either
/// would deadlock the collector.
pub trait Host {
    /// Does the object at `p` have a finalizer whose code lives in `segment`?
    fn has_finalizer_in_segment(
        &self,
        p: *mut u8,
        size: usize,
        attr: BlkAttr,
        segment: &Segment,
    ) -> bool;

    /// Invoke the finalizer of the object at `p`. Must not unwind.
    fn finalize_from_gc(&self, p: *mut u8, size: usize, attr: BlkAttr);

    /// Heap corruption was detected (sentinel canary mismatch). Must abort;
    /// the heap is not in a state that can be reasoned about.
    fn invalid_memory_operation(&self) -> !;
}
