//! The slab back-end: carves imported regions into fixed-size slots and
//! tracks them on empty/partial/full lists.
//!
//! Two layouts exist, chosen per cache at creation:
//!
//!  * Embedded: one base page per slab, the `Slab` record at the tail of
//!    the page, free slots threaded into a singly-linked list through their
//!    own first word. The owning slab of any object is found by rounding
//!    the address down to the page boundary.
//!  * Bufctl: the record comes from the slab-record cache and the region
//!    from the source at the cache's import size; every slot is described
//!    by a `Bufctl`, free ones on the slab's list, live ones in the cache's
//!    address hash.
//!
//! Everything here runs under the owning cache's lock; constructors and
//! destructors do not (the container layer runs them outside).

use core::mem::size_of;
use core::ptr;

use log::trace;

use crate::arch::{BASE_PAGE_SIZE, VAddr};
use crate::bootstrap;
use crate::bufctl::{AllocHash, Bufctl};
use crate::cache::Error;
use crate::list::{LinkedList, ListNode, Rawlink};
use crate::source::{AllocFlags, BaseAlloc, MemorySource};

pub(crate) fn round_up(n: usize, align: usize) -> usize {
    (n + align - 1) & !(align - 1)
}

pub(crate) fn round_down(n: usize, align: usize) -> usize {
    n & !(align - 1)
}

/// Free-slot bookkeeping, matching the cache's layout mode.
pub(crate) enum FreeRepr {
    /// Head of the free list threaded through the slots themselves.
    Embedded(*mut u8),
    /// Head of the free bufctl list.
    Bufctl(Rawlink<Bufctl>),
}

/// One imported region carved into `nr_total` equal slots.
#[repr(C)]
pub(crate) struct Slab {
    prev: Rawlink<Slab>,
    next: Rawlink<Slab>,
    /// Base of the imported region. For embedded slabs the record itself
    /// lives at the tail of this region.
    pub(crate) region: *mut u8,
    pub(crate) nr_total: usize,
    pub(crate) nr_busy: usize,
    pub(crate) free: FreeRepr,
}

// The record has to leave room for at least one object in its page.
const _: () = assert!(size_of::<Slab>() < BASE_PAGE_SIZE / 2);

impl ListNode for Slab {
    fn prev(&mut self) -> &mut Rawlink<Slab> {
        &mut self.prev
    }
    fn next(&mut self) -> &mut Rawlink<Slab> {
        &mut self.next
    }
}

/// Usable bytes of an embedded slab's page.
pub(crate) const fn embedded_capacity() -> usize {
    BASE_PAGE_SIZE - size_of::<Slab>()
}

/// Locates the slab record of an embedded-layout object.
pub(crate) unsafe fn slab_for_embedded(buf: *mut u8) -> *mut Slab {
    (round_down(buf as VAddr, BASE_PAGE_SIZE) + embedded_capacity()) as *mut Slab
}

/// The per-cache parameters the back-end needs; the container passes these
/// in so slab code stays free of container locking concerns.
pub(crate) struct BackendCtx<'a> {
    pub(crate) name: &'static str,
    pub(crate) obj_size: usize,
    pub(crate) import_amt: usize,
    pub(crate) use_bufctl: bool,
    pub(crate) source: &'a dyn MemorySource,
    pub(crate) base: &'a dyn BaseAlloc,
}

/// Slab lists, the address hash, and the live counter. One per cache,
/// guarded by the cache lock.
pub(crate) struct SlabBackend {
    pub(crate) empty: LinkedList<Slab>,
    pub(crate) partial: LinkedList<Slab>,
    pub(crate) full: LinkedList<Slab>,
    pub(crate) hash: AllocHash,
    /// Slots currently out of the slab layer, whether held by callers or
    /// parked in magazines.
    pub(crate) nr_cur_alloc: usize,
}

impl SlabBackend {
    pub(crate) const fn unconstructed() -> SlabBackend {
        SlabBackend {
            empty: LinkedList::new(),
            partial: LinkedList::new(),
            full: LinkedList::new(),
            hash: AllocHash::unconstructed(),
            nr_cur_alloc: 0,
        }
    }

    /// Takes one slot out of the slab layer. Grows by one slab when both
    /// the partial and empty lists are dry. The object comes back raw; the
    /// container runs the constructor after dropping the lock.
    pub(crate) unsafe fn alloc_slot(
        &mut self,
        ctx: &BackendCtx<'_>,
        flags: AllocFlags,
    ) -> Result<*mut u8, Error> {
        let slab = match self.partial.front() {
            Some(slab) => slab,
            None => {
                if self.empty.is_empty() {
                    self.grow(ctx, flags)?;
                }
                // grow guarantees an empty slab on success
                let slab = match self.empty.pop_front() {
                    Some(slab) => slab,
                    None => return Err(Error::OutOfMemory),
                };
                self.partial.insert_front(slab);
                slab
            }
        };
        let buf = match &mut (*slab).free {
            FreeRepr::Embedded(head) => {
                let buf = *head;
                debug_assert!(!buf.is_null());
                // the next free slot's address is stored in the first word
                // of the current one
                *head = *(buf as *mut *mut u8);
                buf
            }
            FreeRepr::Bufctl(head) => {
                let bc = head.as_ptr();
                debug_assert!(!bc.is_null());
                *head = (*bc).link.take();
                self.hash.track(bc, ctx.base);
                (*bc).buf
            }
        };
        (*slab).nr_busy += 1;
        if (*slab).nr_busy == (*slab).nr_total {
            trace!("{}: slab {:p} partial -> full", ctx.name, slab);
            self.partial.remove(slab);
            self.full.insert_front(slab);
        }
        self.nr_cur_alloc += 1;
        Ok(buf)
    }

    /// Returns a raw slot to its slab. Destructors never run here; the
    /// container runs them at the point the object leaves the magazine
    /// subsystem.
    pub(crate) unsafe fn free_slot(&mut self, ctx: &BackendCtx<'_>, buf: *mut u8) {
        let slab = if !ctx.use_bufctl {
            let slab = slab_for_embedded(buf);
            match &mut (*slab).free {
                FreeRepr::Embedded(head) => {
                    *(buf as *mut *mut u8) = *head;
                    *head = buf;
                }
                FreeRepr::Bufctl(_) => unreachable!(),
            }
            slab
        } else {
            let bc = match self.hash.yank(buf) {
                Some(bc) => bc,
                None => panic!("cache {}: free of unknown object {:p}", ctx.name, buf),
            };
            let slab = (*bc).slab;
            match &mut (*slab).free {
                FreeRepr::Bufctl(head) => {
                    (*bc).link = *head;
                    *head = Rawlink::some(bc);
                }
                FreeRepr::Embedded(_) => unreachable!(),
            }
            slab
        };
        let was_full = (*slab).nr_busy == (*slab).nr_total;
        (*slab).nr_busy -= 1;
        if was_full {
            trace!("{}: slab {:p} full -> partial", ctx.name, slab);
            self.full.remove(slab);
            self.partial.insert_front(slab);
        }
        if (*slab).nr_busy == 0 {
            trace!("{}: slab {:p} partial -> empty", ctx.name, slab);
            self.partial.remove(slab);
            self.empty.insert_front(slab);
        }
        self.nr_cur_alloc -= 1;
    }

    /// Imports one region from the source and installs it as an empty
    /// slab. `AllocFlags::ATOMIC` is forwarded to the source; the caller
    /// decides whether a failure is an error return or a panic.
    unsafe fn grow(&mut self, ctx: &BackendCtx<'_>, flags: AllocFlags) -> Result<(), Error> {
        // Bookkeeping allocations report failure here and never panic; the
        // flag surface the caller chose applies to the overall operation.
        let meta_flags = (flags & AllocFlags::ATOMIC) | AllocFlags::ERROR;
        let slab = if !ctx.use_bufctl {
            // One page per slab, record at the tail. The source must be
            // feeding page-aligned pages for the address rounding in
            // slab_for_embedded to hold.
            let region = ctx
                .source
                .alloc(BASE_PAGE_SIZE, flags & AllocFlags::ATOMIC)
                .ok_or(Error::OutOfMemory)?
                .as_ptr();
            let slab = region.add(embedded_capacity()) as *mut Slab;
            let nr_total = embedded_capacity() / ctx.obj_size;
            ptr::write(
                slab,
                Slab {
                    prev: Rawlink::none(),
                    next: Rawlink::none(),
                    region,
                    nr_total,
                    nr_busy: 0,
                    free: FreeRepr::Embedded(region),
                },
            );
            // Thread the free list: each free slot's first word holds the
            // next free slot.
            let mut buf = region;
            for _ in 0..nr_total - 1 {
                *(buf as *mut *mut u8) = buf.add(ctx.obj_size);
                buf = buf.add(ctx.obj_size);
            }
            *(buf as *mut *mut u8) = ptr::null_mut();
            slab
        } else {
            let record = bootstrap::slab_record_cache()
                .alloc(meta_flags)?
                .cast::<Slab>()
                .as_ptr();
            let region = match ctx.source.alloc(ctx.import_amt, flags & AllocFlags::ATOMIC) {
                Some(region) => region.as_ptr(),
                None => {
                    bootstrap::slab_record_cache().free(ptr::NonNull::new_unchecked(record as *mut u8));
                    return Err(Error::OutOfMemory);
                }
            };
            let nr_total = ctx.import_amt / ctx.obj_size;
            ptr::write(
                record,
                Slab {
                    prev: Rawlink::none(),
                    next: Rawlink::none(),
                    region,
                    nr_total,
                    nr_busy: 0,
                    free: FreeRepr::Bufctl(Rawlink::none()),
                },
            );
            // One bufctl per slot. If the bufctl cache runs dry midway the
            // whole import is unwound and the failure surfaced.
            let mut buf = region;
            for _ in 0..nr_total {
                let bc = match bootstrap::bufctl_cache().alloc(meta_flags) {
                    Ok(bc) => bc.cast::<Bufctl>().as_ptr(),
                    Err(_) => {
                        Self::release_bufctls(record);
                        ctx.source
                            .free(ptr::NonNull::new_unchecked(region), ctx.import_amt);
                        bootstrap::slab_record_cache().free(ptr::NonNull::new_unchecked(record as *mut u8));
                        return Err(Error::OutOfMemory);
                    }
                };
                (*bc).buf = buf;
                (*bc).slab = record;
                match &mut (*record).free {
                    FreeRepr::Bufctl(head) => {
                        (*bc).link = *head;
                        *head = Rawlink::some(bc);
                    }
                    FreeRepr::Embedded(_) => unreachable!(),
                }
                buf = buf.add(ctx.obj_size);
            }
            record
        };
        trace!(
            "{}: grew by slab {:p} ({} slots)",
            ctx.name,
            slab,
            (*slab).nr_total
        );
        self.empty.insert_front(slab);
        Ok(())
    }

    /// Destroys every slab on the empty list, returning the regions to the
    /// source.
    pub(crate) unsafe fn reap(&mut self, ctx: &BackendCtx<'_>) {
        let mut nr = 0;
        while let Some(slab) = self.empty.pop_front() {
            destroy_slab(ctx, slab);
            nr += 1;
        }
        if nr > 0 {
            trace!("{}: reaped {} empty slabs", ctx.name, nr);
        }
    }

    /// Pops every bufctl off a slab's free list and hands them back to the
    /// bufctl cache.
    unsafe fn release_bufctls(slab: *mut Slab) {
        loop {
            let head = match &mut (*slab).free {
                FreeRepr::Bufctl(head) => head,
                FreeRepr::Embedded(_) => unreachable!(),
            };
            if head.is_none() {
                break;
            }
            let bc = head.as_ptr();
            *head = (*bc).link.take();
            bootstrap::bufctl_cache().free(ptr::NonNull::new_unchecked(bc as *mut u8));
        }
    }

    /// Debug validation: every slab's free count matches its busy count
    /// and every slab is on the list its busy state demands.
    #[cfg(test)]
    pub(crate) unsafe fn verify(&mut self) {
        unsafe fn free_len(slab: *mut Slab) -> usize {
            let mut n = 0;
            match &mut (*slab).free {
                FreeRepr::Embedded(head) => {
                    let mut cur = *head;
                    while !cur.is_null() {
                        n += 1;
                        cur = *(cur as *mut *mut u8);
                    }
                }
                FreeRepr::Bufctl(head) => {
                    let mut cur = *head;
                    while !cur.is_none() {
                        n += 1;
                        cur = (*cur.as_ptr()).link;
                    }
                }
            }
            n
        }
        unsafe fn walk(
            list: &mut LinkedList<Slab>,
            name: &str,
            check: impl Fn(usize, usize) -> bool,
        ) {
            let mut cur = match list.front() {
                Some(s) => Rawlink::some(s),
                None => Rawlink::none(),
            };
            while let Some(slab) = cur.resolve_mut() {
                let busy = slab.nr_busy;
                let total = slab.nr_total;
                assert!(busy <= total);
                assert!(check(busy, total), "slab misfiled on {} list", name);
                assert_eq!(busy + free_len(slab), total);
                cur = *slab.next();
            }
        }
        walk(&mut self.empty, "empty", |busy, _| busy == 0);
        walk(&mut self.partial, "partial", |busy, total| {
            busy > 0 && busy < total
        });
        walk(&mut self.full, "full", |busy, total| busy == total);
    }
}

/// Returns one empty slab's region to the source and releases its
/// bookkeeping.
pub(crate) unsafe fn destroy_slab(ctx: &BackendCtx<'_>, slab: *mut Slab) {
    debug_assert_eq!((*slab).nr_busy, 0);
    if !ctx.use_bufctl {
        // the record lives inside the region, so this frees it too
        ctx.source.free(
            ptr::NonNull::new_unchecked((*slab).region),
            BASE_PAGE_SIZE,
        );
    } else {
        SlabBackend::release_bufctls(slab);
        ctx.source
            .free(ptr::NonNull::new_unchecked((*slab).region), ctx.import_amt);
        bootstrap::slab_record_cache().free(ptr::NonNull::new_unchecked(slab as *mut u8));
    }
}
