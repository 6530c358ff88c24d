//! Contracts the allocator consumes from its surrounding runtime: the
//! address-space source that slabs import regions from, the base allocator
//! used for metadata, and the CPU topology / clock binding.

use core::ptr::NonNull;

use bitflags::bitflags;

use crate::cache::ObjectCache;

bitflags! {
    /// Per-allocation behavior flags.
    pub struct AllocFlags: u32 {
        /// Do not block in the backing source; report failure instead.
        const ATOMIC = 1 << 0;
        /// Report out-of-memory as an error return instead of panicking.
        const ERROR = 1 << 1;
    }
}

bitflags! {
    /// Cache-creation flags.
    pub struct CacheFlags: u32 {
        /// The cache fronts a quantum cache of its source; the import size
        /// is derived from the source's quantum maximum.
        const QCACHE = 1 << 0;
        /// Object memory must never be used for free-list links; forces
        /// bufctl bookkeeping even for small objects.
        const NOTOUCH = 1 << 1;
        /// Internal: slots are tracked through bufctls and the address
        /// hash. Set automatically for large or no-touch caches.
        const USE_BUFCTL = 1 << 8;
    }
}

/// An address-space provider that slabs import backing regions from.
///
/// Embedded-layout caches import one base page at a time and locate the
/// owning slab by rounding object addresses down to a page boundary, so a
/// source feeding such a cache must hand out page-sized, page-aligned
/// regions. Bufctl-layout caches place no alignment demands beyond the
/// source's own.
pub trait MemorySource: Sync {
    /// Returns a region of exactly `size` bytes, or `None` under
    /// `AllocFlags::ATOMIC` when the source cannot satisfy the request
    /// without blocking.
    ///
    /// # Safety
    /// The returned region must stay valid until handed back to `free`.
    unsafe fn alloc(&self, size: usize, flags: AllocFlags) -> Option<NonNull<u8>>;

    /// Returns exactly the region previously obtained from `alloc`.
    ///
    /// # Safety
    /// `addr`/`size` must describe one region returned by `alloc` on this
    /// source, with no objects inside it still in use.
    unsafe fn free(&self, addr: NonNull<u8>, size: usize);

    /// The largest request this source serves from its own quantum caches.
    /// Only consulted for `CacheFlags::QCACHE` caches.
    fn quantum_max(&self) -> usize {
        0
    }

    /// Registers `cache` as an importer, so the source can ask it to reap
    /// under memory pressure.
    fn add_importer(&self, cache: &'static ObjectCache) {
        let _ = cache;
    }

    /// Deregisters a cache previously passed to `add_importer`.
    fn del_importer(&self, cache: &'static ObjectCache) {
        let _ = cache;
    }
}

/// The bootstrap-safe allocator used for allocator metadata: per-CPU cache
/// arrays and grown hash tables. Independent of the slab system and usable
/// before it is up.
pub trait BaseAlloc: Sync {
    /// Allocates `size` bytes aligned to `align`, or null on failure.
    ///
    /// # Safety
    /// `align` must be a power of two.
    unsafe fn alloc(&self, size: usize, align: usize) -> *mut u8;

    /// Like `alloc`, but the returned block is zero-filled.
    ///
    /// # Safety
    /// `align` must be a power of two.
    unsafe fn zalloc(&self, size: usize, align: usize) -> *mut u8;

    /// Releases a block previously returned by `alloc`/`zalloc`.
    ///
    /// # Safety
    /// `(ptr, size, align)` must match a prior allocation exactly.
    unsafe fn free(&self, ptr: *mut u8, size: usize, align: usize);
}

/// CPU indexing and the monotonic clock the depot's contention window runs
/// on.
///
/// `current_cpu` picks the per-CPU cache slot. With strictly one execution
/// context per slot the embedder may rely on interrupt masking alone around
/// allocator calls; this crate additionally spin-locks each slot, which is
/// the documented upgrade for configurations where several contexts share a
/// slot (fewer slots than cores, or interrupt handlers racing the context
/// they preempted).
pub trait CpuTopology: Sync {
    /// Number of per-CPU cache slots to build for every cache.
    fn nr_cpus(&self) -> usize;

    /// Index of the calling context's slot; must be `< nr_cpus()`.
    fn current_cpu(&self) -> usize;

    /// Monotonic nanoseconds; only compared against other values from the
    /// same source.
    fn now_ns(&self) -> u64;
}
