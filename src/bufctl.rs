//! External slot bookkeeping for caches that must not touch object memory.
//!
//! In bufctl mode every slot, free or live, is described by a `Bufctl`
//! record. Free bufctls sit on their slab's free list; live ones are
//! indexed by the cache's address hash so `free(addr)` can find the owning
//! slab without address arithmetic on the object itself.

use core::mem::size_of;
use core::ptr;

use crate::list::Rawlink;
use crate::slab::Slab;
use crate::source::BaseAlloc;

/// Bookkeeping record for one object slot.
pub(crate) struct Bufctl {
    /// Slab free-list linkage while the slot is free, hash-chain linkage
    /// while it is live. Never both.
    pub(crate) link: Rawlink<Bufctl>,
    pub(crate) buf: *mut u8,
    /// Non-owning back-reference; the slab outlives its bufctls.
    pub(crate) slab: *mut Slab,
}

/// Buckets in the embedded fallback table every cache starts on.
pub(crate) const STATIC_HASH_LISTS: usize = 8;

/// Chain length the table tolerates before trying to grow.
const HASH_LOAD_LIMIT: usize = 2;

/// Address hash over live bufctls: a power-of-two bucket table of
/// singly-linked chains.
///
/// Starts on the embedded static table so bufctl caches work before (and
/// without) the base allocator having spare memory; grows in place from the
/// base allocator when load demands. A failed grow is non-fatal, the table
/// just runs at a higher load factor.
pub(crate) struct AllocHash {
    table: *mut Rawlink<Bufctl>,
    nr_bits: u32,
    nr_items: usize,
    static_table: [Rawlink<Bufctl>; STATIC_HASH_LISTS],
}

const _: () = assert!(STATIC_HASH_LISTS.is_power_of_two());

fn hash_ptr(addr: *mut u8, nr_bits: u32) -> usize {
    // Fibonacci hashing on the address with the low alignment bits
    // discarded; the top bits of the product index the table.
    let h = ((addr as usize as u64) >> 4).wrapping_mul(0x9E37_79B9_7F4A_7C15);
    (h >> (64 - nr_bits)) as usize
}

impl AllocHash {
    pub(crate) const fn unconstructed() -> AllocHash {
        AllocHash {
            table: ptr::null_mut(),
            nr_bits: STATIC_HASH_LISTS.trailing_zeros(),
            nr_items: 0,
            static_table: [Rawlink::none(); STATIC_HASH_LISTS],
        }
    }

    /// Points the table at the embedded buckets. Must run once the hash has
    /// reached its final address, before any insert.
    pub(crate) fn attach_static_table(&mut self) {
        self.table = self.static_table.as_mut_ptr();
    }

    pub(crate) fn nr_items(&self) -> usize {
        self.nr_items
    }

    fn nr_lists(&self) -> usize {
        1 << self.nr_bits
    }

    unsafe fn bucket(&self, idx: usize) -> *mut Rawlink<Bufctl> {
        self.table.add(idx)
    }

    /// Tracks a live bufctl, growing the table if the load limit is passed.
    pub(crate) unsafe fn track(&mut self, bc: *mut Bufctl, base: &dyn BaseAlloc) {
        let idx = hash_ptr((*bc).buf, self.nr_bits);
        (*bc).link = *self.bucket(idx);
        *self.bucket(idx) = Rawlink::some(bc);
        self.nr_items += 1;
        if self.nr_items > self.nr_lists() * HASH_LOAD_LIMIT {
            self.try_grow(base);
        }
    }

    /// Looks up and unlinks the bufctl tracking `buf`. `None` means the
    /// address was never handed out by this cache; callers treat that as
    /// fatal.
    pub(crate) unsafe fn yank(&mut self, buf: *mut u8) -> Option<*mut Bufctl> {
        let idx = hash_ptr(buf, self.nr_bits);
        let mut prev: *mut Rawlink<Bufctl> = self.bucket(idx);
        let mut cur = *prev;
        while !cur.is_none() {
            let bc = cur.as_ptr();
            if (*bc).buf == buf {
                *prev = (*bc).link.take();
                self.nr_items -= 1;
                return Some(bc);
            }
            prev = &mut (*bc).link;
            cur = (*bc).link;
        }
        None
    }

    /// Doubles the bucket table. Runs under the cache lock, so the base
    /// allocator must be callable from that context; failure leaves the
    /// current table in place.
    unsafe fn try_grow(&mut self, base: &dyn BaseAlloc) {
        let new_bits = self.nr_bits + 1;
        let new_lists = 1usize << new_bits;
        let new_sz = new_lists * size_of::<Rawlink<Bufctl>>();
        let new_table = base.zalloc(new_sz, size_of::<usize>()) as *mut Rawlink<Bufctl>;
        if new_table.is_null() {
            return;
        }
        let old_table = self.table;
        let old_lists = self.nr_lists();
        self.table = new_table;
        self.nr_bits = new_bits;
        for i in 0..old_lists {
            let mut cur = *old_table.add(i);
            while !cur.is_none() {
                let bc = cur.as_ptr();
                cur = (*bc).link;
                let idx = hash_ptr((*bc).buf, self.nr_bits);
                (*bc).link = *self.bucket(idx);
                *self.bucket(idx) = Rawlink::some(bc);
            }
        }
        if old_table != self.static_table.as_mut_ptr() {
            base.free(
                old_table as *mut u8,
                old_lists * size_of::<Rawlink<Bufctl>>(),
                size_of::<usize>(),
            );
        }
    }

    /// Releases a grown table back to the base allocator. The embedded one
    /// is part of the cache record and stays put.
    pub(crate) unsafe fn release(&mut self, base: &dyn BaseAlloc) {
        if !self.table.is_null() && self.table != self.static_table.as_mut_ptr() {
            base.free(
                self.table as *mut u8,
                self.nr_lists() * size_of::<Rawlink<Bufctl>>(),
                size_of::<usize>(),
            );
        }
        self.table = ptr::null_mut();
    }
}
