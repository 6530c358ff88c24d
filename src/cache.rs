//! The cache container: binds an object type's size, alignment, hooks, and
//! source arena to a slab back-end, a depot, and a per-CPU cache array.
//!
//! Allocation walks the three tiers front to back: the calling CPU's
//! loaded magazine, the previous magazine, the depot, and finally the slab
//! layer. Objects cached anywhere in the magazine subsystem stay
//! constructed; the constructor runs when an object leaves the slab layer
//! and the destructor when it goes back, so magazine hits pay for neither.

use core::cell::UnsafeCell;
use core::mem::{align_of, size_of};
use core::ptr::{self, NonNull};

use log::warn;
use spin::Mutex;

use crate::arch::BASE_PAGE_SIZE;
use crate::bootstrap;
use crate::cpu_cache::PerCpuCache;
use crate::depot::Depot;
use crate::list::Rawlink;
use crate::magazine::Magazine;
use crate::slab::{self, round_up, BackendCtx, SlabBackend};
use crate::source::{AllocFlags, CacheFlags, MemorySource};
use crate::{DEFAULT_SLOTS_PER_SLAB, SLAB_LARGE_CUTOFF};

/// Failures surfaced by cache operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Error {
    /// The source arena could not supply a region.
    OutOfMemory,
    /// The cache's constructor rejected the object.
    CtorFailed,
    /// Alignment not a power of two, zero, or larger than a base page.
    BadAlign,
}

/// Object constructor hook. Runs every time an object leaves the slab
/// layer, outside any allocator lock. Must not allocate from this cache and
/// must not block when `AllocFlags::ATOMIC` is set.
pub type Ctor = fn(obj: NonNull<u8>, cookie: *mut (), flags: AllocFlags) -> Result<(), ()>;

/// Object destructor hook. Runs when an object re-enters the slab layer,
/// outside any allocator lock.
pub type Dtor = fn(obj: NonNull<u8>, cookie: *mut ());

struct RegistryLinks {
    prev: Rawlink<ObjectCache>,
    next: Rawlink<ObjectCache>,
}

/// A named pool of fixed-size, fixed-alignment objects.
pub struct ObjectCache {
    name: &'static str,
    /// Object size after rounding up to the alignment.
    obj_size: usize,
    align: usize,
    flags: CacheFlags,
    /// Region size for one slab import in bufctl mode.
    import_amt: usize,
    source: &'static dyn MemorySource,
    ctor: Option<Ctor>,
    dtor: Option<Dtor>,
    cookie: *mut (),
    /// The cache lock: slab lists, address hash, counters. Never held
    /// across magazine or depot operations.
    backend: Mutex<SlabBackend>,
    depot: Depot,
    pcpu: *mut PerCpuCache,
    nr_pcpu: usize,
    /// Global registry linkage, guarded by the registry lock.
    registry: UnsafeCell<RegistryLinks>,
}

// All mutable state is behind the backend/depot/per-CPU/registry locks;
// the raw pointers reference memory the cache owns for its whole life.
unsafe impl Sync for ObjectCache {}
unsafe impl Send for ObjectCache {}

impl ObjectCache {
    /// Creates a cache. Fully usable on return: registered globally and
    /// with its source, per-CPU caches built. `source` of `None` selects
    /// the default pages source bound at `init`.
    ///
    /// Large objects (`obj_size > SLAB_LARGE_CUTOFF`) and `NOTOUCH` caches
    /// are forced into bufctl bookkeeping.
    #[allow(clippy::too_many_arguments)]
    pub fn create(
        name: &'static str,
        obj_size: usize,
        align: usize,
        flags: CacheFlags,
        source: Option<&'static dyn MemorySource>,
        ctor: Option<Ctor>,
        dtor: Option<Dtor>,
        cookie: *mut (),
    ) -> Result<&'static ObjectCache, Error> {
        if align == 0 || !align.is_power_of_two() || align > BASE_PAGE_SIZE {
            return Err(Error::BadAlign);
        }
        let source = source.unwrap_or_else(bootstrap::pages_source);
        let record = bootstrap::cache_cache().alloc(AllocFlags::ERROR)?;
        let cache = record.cast::<ObjectCache>().as_ptr();
        unsafe {
            construct_at(cache, name, obj_size, align, flags, source, ctor, dtor, cookie);
            Ok(&*cache)
        }
    }

    /// Tears a cache down, releasing every slab, magazine, and metadata
    /// allocation. All objects must have been freed back; live objects are
    /// a caller leak and trip an assertion.
    ///
    /// # Safety
    /// No other thread may touch `cache` during or after this call, and
    /// `cache` must have come from `create` (never a bootstrap cache).
    pub unsafe fn destroy(cache: &'static ObjectCache) {
        let cache_ptr = cache as *const ObjectCache as *mut ObjectCache;
        registry_remove(cache_ptr);
        cache.source.del_importer(cache);
        cache.drain_pcpu_caches();
        cache.drain_depot();
        {
            let ctx = cache.backend_ctx();
            let mut backend = cache.backend.lock();
            assert!(
                backend.full.is_empty() && backend.partial.is_empty(),
                "cache {}: destroyed with live objects",
                cache.name
            );
            while let Some(a_slab) = backend.empty.pop_front() {
                slab::destroy_slab(&ctx, a_slab);
            }
            debug_assert_eq!(backend.nr_cur_alloc, 0);
            backend.hash.release(bootstrap::base_alloc());
        }
        bootstrap::base_alloc().free(
            cache.pcpu as *mut u8,
            cache.nr_pcpu * size_of::<PerCpuCache>(),
            align_of::<PerCpuCache>(),
        );
        bootstrap::cache_cache().free(NonNull::new_unchecked(cache_ptr as *mut u8));
    }

    /// Allocates one object. Magazine hits return a still-constructed
    /// object without touching any shared lock; on a miss the allocation
    /// falls through to the depot and then the slab layer.
    ///
    /// `AllocFlags::ATOMIC` forbids blocking in the source arena;
    /// `AllocFlags::ERROR` turns an out-of-memory panic into an error
    /// return.
    pub fn alloc(&self, flags: AllocFlags) -> Result<NonNull<u8>, Error> {
        let slot = self.my_slot();
        let mut pcc = slot.inner.lock();
        loop {
            let obj = unsafe { (*pcc.loaded).pop() };
            if let Some(obj) = obj {
                pcc.nr_allocs_ever += 1;
                drop(pcc);
                debug_assert!(!obj.is_null());
                return Ok(unsafe { NonNull::new_unchecked(obj) });
            }
            if unsafe { !(*pcc.prev).is_empty() } {
                pcc.swap_mags();
                continue;
            }
            // lock order: per-CPU slot, then depot
            let mut depot = self.depot.lock();
            if let Some(mag) = unsafe { depot.take_not_empty() } {
                unsafe { depot.put(pcc.prev) };
                drop(depot);
                pcc.prev = pcc.loaded;
                pcc.loaded = mag;
                continue;
            }
            drop(depot);
            drop(pcc);
            return self.alloc_from_slab(flags);
        }
    }

    /// Returns one object. The object stays constructed while it sits in
    /// the magazine subsystem; the destructor runs only if the magazine
    /// layer cannot take it (or later, when a magazine drains).
    ///
    /// # Safety
    /// `obj` must have come from `alloc` on this cache and not have been
    /// freed since.
    pub unsafe fn free(&self, obj: NonNull<u8>) {
        let slot = self.my_slot();
        let mut pcc = slot.inner.lock();
        loop {
            if (*pcc.loaded).nr_rounds < pcc.magsize {
                (*pcc.loaded).push(obj.as_ptr());
                return;
            }
            // "has room", not "is empty": after a resize the previous
            // magazine may be a smaller, partially filled one
            if (*pcc.prev).nr_rounds < pcc.magsize {
                pcc.swap_mags();
                continue;
            }
            let mut depot = self.depot.lock();
            // this is how a depot resize reaches the per-CPU caches
            pcc.magsize = depot.magsize;
            if let Some(mag) = depot.take_empty() {
                depot.put(pcc.prev);
                drop(depot);
                pcc.prev = pcc.loaded;
                pcc.loaded = mag;
                continue;
            }
            drop(depot);
            // Both our magazines and the depot are out of room. Try to add
            // a fresh empty magazine to the depot. The slot lock must be
            // released first: the magazine cache's free path runs through
            // this very function.
            drop(pcc);
            match bootstrap::magazine_cache().alloc(AllocFlags::ATOMIC | AllocFlags::ERROR) {
                Ok(mag) => {
                    let mag = mag.cast::<Magazine>().as_ptr();
                    debug_assert_eq!((*mag).nr_rounds, 0);
                    self.depot.lock().put(mag);
                    pcc = slot.inner.lock();
                }
                Err(_) => {
                    // No magazines to be had; the object bypasses the
                    // magazine subsystem entirely.
                    if let Some(dtor) = self.dtor {
                        dtor(obj, self.cookie);
                    }
                    self.free_to_slab(obj.as_ptr());
                    return;
                }
            }
        }
    }

    /// Releases every slab on the empty list back to the source arena.
    pub fn reap(&self) {
        let ctx = self.backend_ctx();
        let mut backend = self.backend.lock();
        unsafe { backend.reap(&ctx) };
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Object size after alignment rounding.
    pub fn obj_size(&self) -> usize {
        self.obj_size
    }

    /// Requested object alignment.
    pub fn align(&self) -> usize {
        self.align
    }

    /// Slots currently outside the slab layer, including rounds parked in
    /// magazines.
    pub fn live_objects(&self) -> usize {
        self.backend.lock().nr_cur_alloc
    }

    /// The depot's current magazine fill target.
    pub fn depot_magsize(&self) -> usize {
        self.depot.lock().magsize
    }

    /// Allocation bypassing the magazines and depot. The normal miss path,
    /// and the bootstrap path for a cache's first magazines.
    pub(crate) fn alloc_from_slab(&self, flags: AllocFlags) -> Result<NonNull<u8>, Error> {
        let ctx = self.backend_ctx();
        let res = {
            let mut backend = self.backend.lock();
            unsafe { backend.alloc_slot(&ctx, flags) }
        };
        let buf = match res {
            Ok(buf) => buf,
            Err(Error::OutOfMemory) if !flags.contains(AllocFlags::ERROR) => {
                panic!("cache {}: out of memory growing a slab", self.name)
            }
            Err(e) => return Err(e),
        };
        let obj = unsafe { NonNull::new_unchecked(buf) };
        if let Some(ctor) = self.ctor {
            if ctor(obj, self.cookie, flags).is_err() {
                warn!("cache {}: constructor failed for {:p}", self.name, buf);
                unsafe { self.free_to_slab(buf) };
                return Err(Error::CtorFailed);
            }
        }
        Ok(obj)
    }

    /// Hands a raw, deconstructed object back to the slab layer.
    pub(crate) unsafe fn free_to_slab(&self, buf: *mut u8) {
        let ctx = self.backend_ctx();
        let mut backend = self.backend.lock();
        backend.free_slot(&ctx, buf);
    }

    fn my_slot(&self) -> &PerCpuCache {
        let cpu = bootstrap::cpu_topology().current_cpu();
        debug_assert!(cpu < self.nr_pcpu);
        unsafe { &*self.pcpu.add(cpu) }
    }

    fn backend_ctx(&self) -> BackendCtx<'_> {
        BackendCtx {
            name: self.name,
            obj_size: self.obj_size,
            import_amt: self.import_amt,
            use_bufctl: self.flags.contains(CacheFlags::USE_BUFCTL),
            source: self.source,
            base: bootstrap::base_alloc(),
        }
    }

    /// Moves every per-CPU magazine to the depot. Destroy-time only; the
    /// locking is a formality since no one else may touch the cache.
    unsafe fn drain_pcpu_caches(&self) {
        for i in 0..self.nr_pcpu {
            let slot = &*self.pcpu.add(i);
            let mut pcc = slot.inner.lock();
            let mut depot = self.depot.lock();
            depot.put(pcc.loaded);
            depot.put(pcc.prev);
            pcc.loaded = ptr::null_mut();
            pcc.prev = ptr::null_mut();
        }
    }

    /// Empties the depot: rounds go back to the slab layer (through the
    /// destructor), magazines go back to the magazine cache.
    unsafe fn drain_depot(&self) {
        loop {
            let mag = {
                let mut depot = self.depot.lock();
                depot.take_not_empty().or_else(|| depot.take_empty())
            };
            let mag = match mag {
                Some(mag) => mag,
                None => break,
            };
            self.drain_mag(mag);
            bootstrap::magazine_cache().free(NonNull::new_unchecked(mag as *mut u8));
        }
    }

    /// Returns a magazine's rounds to the slab layer, destructing each.
    unsafe fn drain_mag(&self, mag: *mut Magazine) {
        while let Some(obj) = (*mag).pop() {
            if let Some(dtor) = self.dtor {
                dtor(NonNull::new_unchecked(obj), self.cookie);
            }
            self.free_to_slab(obj);
        }
    }

    /// Walks the slab lists validating the busy/free bookkeeping.
    #[cfg(test)]
    pub(crate) fn verify_slabs(&self) {
        let mut backend = self.backend.lock();
        unsafe { backend.verify() };
    }

    #[cfg(test)]
    pub(crate) fn import_amt(&self) -> usize {
        self.import_amt
    }

    #[cfg(test)]
    pub(crate) fn uses_bufctl(&self) -> bool {
        self.flags.contains(CacheFlags::USE_BUFCTL)
    }

    #[cfg(test)]
    pub(crate) fn depot_handle(&self) -> &Depot {
        &self.depot
    }

    #[cfg(test)]
    pub(crate) fn slab_counts(&self) -> (usize, usize, usize) {
        let backend = self.backend.lock();
        (
            backend.empty.elements,
            backend.partial.elements,
            backend.full.elements,
        )
    }

    #[cfg(test)]
    pub(crate) fn hash_items(&self) -> usize {
        self.backend.lock().hash.nr_items()
    }

    #[cfg(test)]
    pub(crate) fn local_magsize(&self) -> usize {
        self.my_slot().inner.lock().magsize
    }
}

/// Builds a cache in place at its final address. Shared by `create` and
/// the statically reserved bootstrap caches.
///
/// # Safety
/// `cache` must point at uninitialized storage that lives forever; `align`
/// must already be validated; the runtime bindings of `init` must be in
/// place (for the magazine cache itself, partially: its own record is the
/// one being built).
#[allow(clippy::too_many_arguments)]
pub(crate) unsafe fn construct_at(
    cache: *mut ObjectCache,
    name: &'static str,
    obj_size: usize,
    align: usize,
    mut flags: CacheFlags,
    source: &'static dyn MemorySource,
    ctor: Option<Ctor>,
    dtor: Option<Dtor>,
    cookie: *mut (),
) {
    debug_assert!(align.is_power_of_two() && align <= BASE_PAGE_SIZE);
    // A free slot stores the free-list link in its first word, so a slot is
    // never smaller than one word.
    let obj_size = round_up(obj_size.max(size_of::<usize>()), align);
    let import_amt = if flags.contains(CacheFlags::QCACHE) {
        (3 * source.quantum_max()).next_power_of_two()
    } else {
        round_up(DEFAULT_SLOTS_PER_SLAB * obj_size, BASE_PAGE_SIZE)
    };
    if obj_size > SLAB_LARGE_CUTOFF || flags.contains(CacheFlags::NOTOUCH) {
        flags |= CacheFlags::USE_BUFCTL;
    }
    ptr::write(
        cache,
        ObjectCache {
            name,
            obj_size,
            align,
            flags,
            import_amt,
            source,
            ctor,
            dtor,
            cookie,
            backend: Mutex::new(SlabBackend::unconstructed()),
            depot: Depot::new(),
            pcpu: ptr::null_mut(),
            nr_pcpu: 0,
            registry: UnsafeCell::new(RegistryLinks {
                prev: Rawlink::none(),
                next: Rawlink::none(),
            }),
        },
    );
    // The hash's bucket pointer refers into the record itself; attach it
    // only now that the record sits at its final address.
    (*cache).backend.get_mut().hash.attach_static_table();
    // Built last: the first two magazines of every slot come straight from
    // the magazine cache's slab layer, which during bootstrap is the very
    // cache being constructed here.
    let nr = bootstrap::cpu_topology().nr_cpus();
    (*cache).pcpu = build_pcpu_caches(nr);
    (*cache).nr_pcpu = nr;
    let cache_ref: &'static ObjectCache = &*cache;
    cache_ref.source.add_importer(cache_ref);
    registry_insert(cache);
}

unsafe fn build_pcpu_caches(nr: usize) -> *mut PerCpuCache {
    let arr = bootstrap::base_alloc()
        .alloc(nr * size_of::<PerCpuCache>(), align_of::<PerCpuCache>())
        as *mut PerCpuCache;
    assert!(
        !arr.is_null(),
        "base allocator failed building per-CPU caches"
    );
    for i in 0..nr {
        let loaded = boot_magazine();
        let prev = boot_magazine();
        ptr::write(arr.add(i), PerCpuCache::new(loaded, prev));
    }
    arr
}

/// A magazine taken straight from the slab layer, bypassing the magazine
/// subsystem that may not exist yet.
unsafe fn boot_magazine() -> *mut Magazine {
    match bootstrap::magazine_cache().alloc_from_slab(AllocFlags::empty()) {
        Ok(mag) => mag.cast::<Magazine>().as_ptr(),
        // alloc_from_slab without ERROR panics on OOM, and the magazine
        // ctor cannot fail
        Err(_) => unreachable!(),
    }
}

struct Registry {
    head: Rawlink<ObjectCache>,
    nr: usize,
}

// Links are only followed under the registry lock.
unsafe impl Send for Registry {}

/// Process-wide list of live caches. The original guards this with a
/// sleeping lock; it is only ever taken across create and destroy, never
/// on an allocation path.
static REGISTRY: Mutex<Registry> = Mutex::new(Registry {
    head: Rawlink::none(),
    nr: 0,
});

unsafe fn registry_insert(cache: *mut ObjectCache) {
    let mut reg = REGISTRY.lock();
    let links = &mut *(*cache).registry.get();
    links.prev = Rawlink::none();
    links.next = reg.head;
    if let Some(old_head) = reg.head.resolve_mut() {
        (*old_head.registry.get()).prev = Rawlink::some(cache);
    }
    reg.head = Rawlink::some(cache);
    reg.nr += 1;
}

unsafe fn registry_remove(cache: *mut ObjectCache) {
    let mut reg = REGISTRY.lock();
    let links = &mut *(*cache).registry.get();
    let prev = links.prev.take();
    let next = links.next.take();
    match prev.as_ptr().as_ref() {
        None => reg.head = next,
        Some(p) => (*p.registry.get()).next = next,
    }
    if let Some(n) = next.as_ptr().as_ref() {
        (*n.registry.get()).prev = prev;
    }
    reg.nr -= 1;
}

/// Number of caches currently registered.
pub fn nr_caches() -> usize {
    REGISTRY.lock().nr
}
