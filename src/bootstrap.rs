//! Bootstrap: the four caches that allocate the allocator's own metadata,
//! and the runtime bindings everything hangs off.
//!
//! The magazine cache must come up first: every cache, the magazine cache
//! included, allocates its per-CPU magazines from the magazine cache's
//! slab layer. The cache-of-caches makes dynamic `create` possible, and
//! the slab-record and bufctl caches back the external slab layout. All
//! four import from the distinguished base source so none of them depends
//! on the general pages source being alive.
//!
//! Magazines are only ever allocated on the free path of some cache, never
//! on an alloc path, which is why the magazine cache cannot deadlock on
//! itself.

use core::cell::UnsafeCell;
use core::mem::{align_of, size_of, MaybeUninit};
use core::ptr;

use spin::Once;

use crate::bufctl::Bufctl;
use crate::cache::{self, ObjectCache};
use crate::magazine::{mag_ctor, Magazine};
use crate::slab::Slab;
use crate::source::{BaseAlloc, CacheFlags, CpuTopology, MemorySource};

struct Bindings {
    topology: &'static dyn CpuTopology,
    base: &'static dyn BaseAlloc,
    pages: &'static dyn MemorySource,
}

static BINDINGS: Once<Bindings> = Once::new();
static BOOT: Once<()> = Once::new();

/// Statically reserved storage for one bootstrap cache.
struct BootCache(UnsafeCell<MaybeUninit<ObjectCache>>);

// Only touched through construct_at under the init Once, then immutable.
unsafe impl Sync for BootCache {}

impl BootCache {
    const fn new() -> BootCache {
        BootCache(UnsafeCell::new(MaybeUninit::uninit()))
    }

    fn ptr(&self) -> *mut ObjectCache {
        self.0.get() as *mut ObjectCache
    }
}

static MAGAZINE_CACHE: BootCache = BootCache::new();
static CACHE_CACHE: BootCache = BootCache::new();
static SLAB_RECORD_CACHE: BootCache = BootCache::new();
static BUFCTL_CACHE: BootCache = BootCache::new();

/// Binds the runtime environment and brings up the reserved caches, in
/// dependency order. Later calls are no-ops; the first caller's bindings
/// win.
///
/// `base_source` feeds the reserved caches and must be usable immediately;
/// `pages` is the default source for caches created without one.
pub fn init(
    topology: &'static dyn CpuTopology,
    base_source: &'static dyn MemorySource,
    base: &'static dyn BaseAlloc,
    pages: &'static dyn MemorySource,
) {
    BINDINGS.call_once(|| Bindings {
        topology,
        base,
        pages,
    });
    BOOT.call_once(|| unsafe {
        // magazine must be first: all caches, this one included, slab-alloc
        // their first magazines from it
        cache::construct_at(
            MAGAZINE_CACHE.ptr(),
            "magazine",
            size_of::<Magazine>(),
            align_of::<Magazine>(),
            CacheFlags::empty(),
            base_source,
            Some(mag_ctor),
            None,
            ptr::null_mut(),
        );
        cache::construct_at(
            CACHE_CACHE.ptr(),
            "object_cache",
            size_of::<ObjectCache>(),
            align_of::<ObjectCache>(),
            CacheFlags::empty(),
            base_source,
            None,
            None,
            ptr::null_mut(),
        );
        cache::construct_at(
            SLAB_RECORD_CACHE.ptr(),
            "slab_record",
            size_of::<Slab>(),
            align_of::<Slab>(),
            CacheFlags::empty(),
            base_source,
            None,
            None,
            ptr::null_mut(),
        );
        cache::construct_at(
            BUFCTL_CACHE.ptr(),
            "bufctl",
            size_of::<Bufctl>(),
            align_of::<Bufctl>(),
            CacheFlags::empty(),
            base_source,
            None,
            None,
            ptr::null_mut(),
        );
    });
}

fn bindings() -> &'static Bindings {
    match BINDINGS.get() {
        Some(b) => b,
        None => panic!("object caches used before init"),
    }
}

// Gated on the bindings rather than the boot flag: the reserved caches
// allocate from each other while they are still being brought up inside the
// boot Once, strictly in init order.
fn boot_cache(slot: &'static BootCache) -> &'static ObjectCache {
    if BINDINGS.get().is_none() {
        panic!("object caches used before init");
    }
    unsafe { &*slot.ptr() }
}

pub(crate) fn cpu_topology() -> &'static dyn CpuTopology {
    bindings().topology
}

pub(crate) fn base_alloc() -> &'static dyn BaseAlloc {
    bindings().base
}

pub(crate) fn pages_source() -> &'static dyn MemorySource {
    bindings().pages
}

/// The cache all magazines come from.
pub(crate) fn magazine_cache() -> &'static ObjectCache {
    boot_cache(&MAGAZINE_CACHE)
}

/// The cache dynamic cache records come from.
pub(crate) fn cache_cache() -> &'static ObjectCache {
    boot_cache(&CACHE_CACHE)
}

/// The cache bufctl-mode slab records come from.
pub(crate) fn slab_record_cache() -> &'static ObjectCache {
    boot_cache(&SLAB_RECORD_CACHE)
}

/// The cache bufctl records come from.
pub(crate) fn bufctl_cache() -> &'static ObjectCache {
    boot_cache(&BUFCTL_CACHE)
}
