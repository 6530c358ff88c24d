//! The per-CPU front door: a loaded/previous magazine pair per CPU slot.
//!
//! With strictly one execution context per slot, masking interrupts around
//! allocator calls is enough and the slot lock is never contended; when
//! several contexts share a slot (per-NUMA-domain slots, or handlers racing
//! the context they preempted) the same code is correct because every entry
//! goes through the slot's spin lock. Lock order is slot before depot.

use spin::Mutex;

use crate::arch::CACHE_LINE_SIZE;
use crate::magazine::{Magazine, MAG_MIN_ROUNDS};

pub(crate) struct PcpuState {
    pub(crate) loaded: *mut Magazine,
    pub(crate) prev: *mut Magazine,
    /// Local fill target; refreshed from the depot's on every depot visit
    /// of the free path. Only ever grows.
    pub(crate) magsize: usize,
    pub(crate) nr_allocs_ever: u64,
}

// The magazines a slot points at are owned by that slot; the pointers move
// between owners only while both holders' locks are held.
unsafe impl Send for PcpuState {}

impl PcpuState {
    /// Exchanges the loaded and previous magazines. Hold the slot lock.
    pub(crate) fn swap_mags(&mut self) {
        core::mem::swap(&mut self.loaded, &mut self.prev);
    }
}

/// One per-CPU cache slot, padded out to its own cache line so slots do not
/// false-share.
#[cfg_attr(feature = "cacheline_32", repr(align(32)))]
#[cfg_attr(feature = "cacheline_128", repr(align(128)))]
#[cfg_attr(
    not(any(feature = "cacheline_32", feature = "cacheline_128")),
    repr(align(64))
)]
pub(crate) struct PerCpuCache {
    pub(crate) inner: Mutex<PcpuState>,
}

const _: () = assert!(core::mem::align_of::<PerCpuCache>() == CACHE_LINE_SIZE);

impl PerCpuCache {
    /// Builds a slot around its first two magazines. Bootstrap hands in
    /// magazines that came straight from the slab layer, which is what
    /// breaks the magazine-cache-allocates-magazines cycle.
    pub(crate) fn new(loaded: *mut Magazine, prev: *mut Magazine) -> PerCpuCache {
        PerCpuCache {
            inner: Mutex::new(PcpuState {
                loaded,
                prev,
                magsize: MAG_MIN_ROUNDS,
                nr_allocs_ever: 0,
            }),
        }
    }
}
