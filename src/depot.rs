//! The depot: the shared magazine pool behind all per-CPU caches of one
//! cache, and the home of the magazine-size feedback loop.
//!
//! The depot keeps not-empty and empty magazines on two singly-linked
//! lists. The Bonwick/Adams paper says "full", but a resize leaves old
//! magazines filled to a smaller target in circulation, so "not empty" is
//! the accurate term: the alloc path only needs rounds to exist, not a
//! particular count.
//!
//! Contention on the depot lock is the resize signal. Every acquisition
//! that found the lock held is counted against a time window; too many in
//! one window means the per-CPU layer is cycling magazines faster than the
//! magazine size amortizes, so the target grows by one. Per-CPU caches
//! pick the new target up passively the next time their free path visits
//! the depot.

use core::sync::atomic::{AtomicU64, Ordering};

use spin::{Mutex, MutexGuard};

use crate::bootstrap;
use crate::list::Rawlink;
use crate::magazine::{Magazine, MAG_MAX_ROUNDS, MAG_MIN_ROUNDS};

/// Width of the contention accounting window, in nanoseconds.
static RESIZE_TIMEOUT_NS: AtomicU64 = AtomicU64::new(1_000_000_000);

/// Contended acquisitions tolerated per window before the magazine size
/// grows. Neither this nor the window width has been tuned; both stay
/// runtime-settable.
static RESIZE_THRESHOLD: AtomicU64 = AtomicU64::new(1);

pub fn set_resize_timeout_ns(ns: u64) {
    RESIZE_TIMEOUT_NS.store(ns, Ordering::Relaxed);
}

pub fn set_resize_threshold(count: u64) {
    RESIZE_THRESHOLD.store(count, Ordering::Relaxed);
}

/// One singly-linked stack of magazines.
struct MagList {
    head: Rawlink<Magazine>,
    nr: usize,
}

impl MagList {
    const fn new() -> MagList {
        MagList {
            head: Rawlink::none(),
            nr: 0,
        }
    }

    unsafe fn push(&mut self, mag: *mut Magazine) {
        (*mag).link = self.head;
        self.head = Rawlink::some(mag);
        self.nr += 1;
    }

    unsafe fn pop(&mut self) -> Option<*mut Magazine> {
        if self.head.is_none() {
            return None;
        }
        let mag = self.head.as_ptr();
        self.head = (*mag).link.take();
        self.nr -= 1;
        Some(mag)
    }
}

pub(crate) struct DepotInner {
    not_empty: MagList,
    empty: MagList,
    /// Current fill target for magazines. Grows under contention, never
    /// shrinks, capped at `MAG_MAX_ROUNDS`.
    pub(crate) magsize: usize,
    busy_count: u64,
    busy_start: u64,
}

// Magazine pointers transfer between owners only under this lock.
unsafe impl Send for DepotInner {}

pub(crate) struct Depot {
    inner: Mutex<DepotInner>,
}

impl Depot {
    pub(crate) const fn new() -> Depot {
        Depot {
            inner: Mutex::new(DepotInner {
                not_empty: MagList::new(),
                empty: MagList::new(),
                magsize: MAG_MIN_ROUNDS,
                busy_count: 0,
                busy_start: 0,
            }),
        }
    }

    /// Acquires the depot, feeding the contention accounting when the lock
    /// was held.
    ///
    /// The clock is sampled before blocking: a long wait on a heavily
    /// contended lock must not stretch the window and make the burst look
    /// slower than it was. Contention with no not-empty magazines at all is
    /// a shortage of magazines, not of magazine capacity, and is not
    /// counted.
    pub(crate) fn lock(&self) -> MutexGuard<'_, DepotInner> {
        if let Some(guard) = self.inner.try_lock() {
            return guard;
        }
        let time = bootstrap::cpu_topology().now_ns();
        let mut guard = self.inner.lock();
        if guard.not_empty.nr == 0 {
            return guard;
        }
        if time > guard.busy_start + RESIZE_TIMEOUT_NS.load(Ordering::Relaxed) {
            guard.busy_count = 0;
            guard.busy_start = time;
        }
        guard.busy_count += 1;
        if guard.busy_count > RESIZE_THRESHOLD.load(Ordering::Relaxed) {
            guard.busy_count = 0;
            if guard.magsize < MAG_MAX_ROUNDS {
                guard.magsize += 1;
            }
            // That is the whole resize: per-CPU caches notice the new
            // target on their next depot visit.
        }
        guard
    }
}

impl DepotInner {
    pub(crate) unsafe fn take_not_empty(&mut self) -> Option<*mut Magazine> {
        self.not_empty.pop()
    }

    pub(crate) unsafe fn take_empty(&mut self) -> Option<*mut Magazine> {
        self.empty.pop()
    }

    /// Files a magazine on the list matching its state.
    pub(crate) unsafe fn put(&mut self, mag: *mut Magazine) {
        if (*mag).is_empty() {
            self.empty.push(mag);
        } else {
            self.not_empty.push(mag);
        }
    }

    pub(crate) fn nr_not_empty(&self) -> usize {
        self.not_empty.nr
    }

    pub(crate) fn nr_empty(&self) -> usize {
        self.empty.nr
    }
}
