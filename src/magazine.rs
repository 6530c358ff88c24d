//! Magazines: bounded LIFO stacks of cached object pointers.
//!
//! A magazine is the unit of transfer between a per-CPU cache and the
//! depot. Each magazine tracks its own round count rather than inheriting
//! one from the cache: during a magazine-size resize, magazines filled to
//! the old target stay in circulation until they drain, so the only
//! authoritative count is the one the magazine itself carries. The fill
//! *target* (`magsize`) lives in the per-CPU cache and the depot instead.

use core::mem::size_of;
use core::ptr::NonNull;

use crate::list::Rawlink;
use crate::source::AllocFlags;
use crate::SLAB_LARGE_CUTOFF;

/// Physical bound on rounds per magazine. Sized so a magazine record is
/// exactly `SLAB_LARGE_CUTOFF` bytes: magazines must stay on the embedded
/// slab layout, since the bufctl path allocates bufctls and would recurse
/// into the magazine layer during bootstrap.
pub const MAG_MAX_ROUNDS: usize =
    (SLAB_LARGE_CUTOFF - 2 * size_of::<usize>()) / size_of::<usize>();

/// Initial fill target for fresh per-CPU caches and depots.
pub const MAG_MIN_ROUNDS: usize = 8;

/// A bounded stack of object pointers with its own round count.
#[repr(C)]
pub(crate) struct Magazine {
    /// Depot list linkage; meaningful only while the depot owns the
    /// magazine.
    pub(crate) link: Rawlink<Magazine>,
    pub(crate) nr_rounds: usize,
    pub(crate) rounds: [*mut u8; MAG_MAX_ROUNDS],
}

const _: () = assert!(size_of::<Magazine>() == SLAB_LARGE_CUTOFF);

impl Magazine {
    pub(crate) fn is_empty(&self) -> bool {
        self.nr_rounds == 0
    }

    /// Pops the most recently pushed round. The alloc path trusts only
    /// `nr_rounds`, never the current fill target, so magazines filled to a
    /// larger, older target still drain correctly.
    pub(crate) fn pop(&mut self) -> Option<*mut u8> {
        if self.nr_rounds == 0 {
            return None;
        }
        self.nr_rounds -= 1;
        Some(self.rounds[self.nr_rounds])
    }

    /// Pushes a round. The caller checks the fill target; this only guards
    /// the physical bound.
    pub(crate) fn push(&mut self, obj: *mut u8) {
        debug_assert!(self.nr_rounds < MAG_MAX_ROUNDS);
        self.rounds[self.nr_rounds] = obj;
        self.nr_rounds += 1;
    }
}

/// Constructor installed on the magazine cache: a fresh magazine holds no
/// rounds. Rounds beyond `nr_rounds` are never read, so the array itself is
/// left as-is.
pub(crate) fn mag_ctor(obj: NonNull<u8>, _cookie: *mut (), _flags: AllocFlags) -> Result<(), ()> {
    let mag = obj.cast::<Magazine>().as_ptr();
    unsafe {
        (*mag).link = Rawlink::none();
        (*mag).nr_rounds = 0;
    }
    Ok(())
}
