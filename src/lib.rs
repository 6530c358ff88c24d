//! A type-specific object allocator with per-CPU magazine caching,
//! following the Bonwick slab allocator and the Bonwick/Adams
//! "Magazines and Vmem" design.
//!
//! The organization is as follows (top-down):
//!
//!  * An `ObjectCache` is a named pool of fixed-size, fixed-alignment
//!    objects drawn from a pluggable `MemorySource`.
//!  * Each CPU owns a pair of magazines (loaded/previous) per cache and
//!    serves allocations from them without cross-CPU synchronization.
//!  * A per-cache depot pools not-empty and empty magazines behind the
//!    per-CPU caches and grows the magazine size under lock contention.
//!  * A slab back-end carves regions imported from the source into equal
//!    slots, tracked on empty/partial/full slab lists, with either an
//!    embedded free list or external bufctl bookkeeping plus an address
//!    hash.
//!  * Four statically reserved caches (magazines, cache records, slab
//!    records, bufctls) break the metadata circularity; `init` brings them
//!    up in dependency order.
//!
//! Objects cached in magazines stay constructed: the constructor hook runs
//! when an object leaves the slab layer and the destructor hook when it
//! returns, so the hot path pays for neither.
#![no_std]
#![crate_name = "objcache"]
#![crate_type = "lib"]

#[cfg(test)]
#[macro_use]
extern crate std;

#[cfg(test)]
mod tests;

mod arch;
mod bootstrap;
mod bufctl;
mod cache;
mod cpu_cache;
mod depot;
mod list;
mod magazine;
mod slab;
mod source;

pub use crate::arch::{BASE_PAGE_SIZE, CACHE_LINE_SIZE};
pub use crate::bootstrap::init;
pub use crate::cache::{nr_caches, Ctor, Dtor, Error, ObjectCache};
pub use crate::depot::{set_resize_threshold, set_resize_timeout_ns};
pub use crate::magazine::{MAG_MAX_ROUNDS, MAG_MIN_ROUNDS};
pub use crate::source::{AllocFlags, BaseAlloc, CacheFlags, CpuTopology, MemorySource};

/// Largest object size served by the embedded slab layout; anything bigger
/// (or any `NOTOUCH` cache) gets external bufctl bookkeeping.
pub const SLAB_LARGE_CUTOFF: usize = BASE_PAGE_SIZE / 8;

/// Slots a bufctl-mode slab is sized for when its cache is not a quantum
/// cache.
pub const DEFAULT_SLOTS_PER_SLAB: usize = 8;
