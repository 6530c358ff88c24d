//! Raw-pointer links and the intrusive list used for slab records.
//!
//! Slab records cannot live in owned containers: an embedded-layout record
//! sits inside the page it describes and a bufctl-layout record is a slot of
//! another cache, so list membership has to be intrusive. `Rawlink` is an
//! `Option`-like wrapper for a raw node pointer; `LinkedList` threads
//! doubly-linked `prev`/`next` links through the nodes themselves.

use core::mem;
use core::ptr;

/// Rawlink is a type like Option<T> but for holding a raw pointer.
pub(crate) struct Rawlink<T> {
    p: *mut T,
}

impl<T> Rawlink<T> {
    /// Like Option::None for Rawlink.
    pub(crate) const fn none() -> Rawlink<T> {
        Rawlink { p: ptr::null_mut() }
    }

    /// Like Option::Some for Rawlink.
    pub(crate) fn some(n: *mut T) -> Rawlink<T> {
        Rawlink { p: n }
    }

    pub(crate) fn is_none(&self) -> bool {
        self.p.is_null()
    }

    pub(crate) fn as_ptr(&self) -> *mut T {
        self.p
    }

    /// Convert the `Rawlink` into an Option value.
    ///
    /// **unsafe** because:
    ///
    /// - Dereference of raw pointer.
    /// - Returns reference of arbitrary lifetime.
    pub(crate) unsafe fn resolve_mut<'a>(&mut self) -> Option<&'a mut T> {
        self.p.as_mut()
    }

    /// Return the `Rawlink` and replace with `Rawlink::none()`.
    pub(crate) fn take(&mut self) -> Rawlink<T> {
        mem::replace(self, Rawlink::none())
    }
}

impl<T> Clone for Rawlink<T> {
    fn clone(&self) -> Self {
        Rawlink { p: self.p }
    }
}

impl<T> Copy for Rawlink<T> {}

impl<T> Default for Rawlink<T> {
    fn default() -> Self {
        Rawlink::none()
    }
}

/// A node that carries its own `prev`/`next` links.
pub(crate) trait ListNode: Sized {
    fn prev(&mut self) -> &mut Rawlink<Self>;
    fn next(&mut self) -> &mut Rawlink<Self>;
}

/// An intrusive doubly-linked list of `ListNode`s.
///
/// All operations are O(1) except `contains`, which exists for the
/// `debug_assert!` membership checks on list moves.
pub(crate) struct LinkedList<T: ListNode> {
    head: Rawlink<T>,
    /// Number of elements in the list.
    pub(crate) elements: usize,
}

impl<T: ListNode> LinkedList<T> {
    pub(crate) const fn new() -> LinkedList<T> {
        LinkedList {
            head: Rawlink::none(),
            elements: 0,
        }
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.head.is_none()
    }

    pub(crate) fn front(&self) -> Option<*mut T> {
        if self.head.is_none() {
            None
        } else {
            Some(self.head.as_ptr())
        }
    }

    /// Inserts `node` at the front of the list.
    ///
    /// `node` must not currently be on any list.
    pub(crate) unsafe fn insert_front(&mut self, node: *mut T) {
        *(*node).prev() = Rawlink::none();
        *(*node).next() = self.head;
        if let Some(old_head) = self.head.resolve_mut() {
            *old_head.prev() = Rawlink::some(node);
        }
        self.head = Rawlink::some(node);
        self.elements += 1;
    }

    /// Removes `node` from the list.
    ///
    /// `node` must currently be on this list.
    pub(crate) unsafe fn remove(&mut self, node: *mut T) {
        debug_assert!(self.contains(node));
        let node_prev = (*node).prev().take();
        let node_next = (*node).next().take();
        let mut prev = node_prev;
        let mut next = node_next;
        match prev.resolve_mut() {
            None => self.head = node_next,
            Some(p) => *p.next() = node_next,
        }
        if let Some(n) = next.resolve_mut() {
            *n.prev() = node_prev;
        }
        self.elements -= 1;
    }

    /// Removes and returns the head of the list.
    pub(crate) unsafe fn pop_front(&mut self) -> Option<*mut T> {
        let node = self.front()?;
        self.remove(node);
        Some(node)
    }

    /// Does the list contain `node`? O(n); debug checks only.
    pub(crate) unsafe fn contains(&mut self, node: *const T) -> bool {
        let mut cur = self.head;
        while let Some(n) = cur.resolve_mut() {
            if n as *const T == node {
                return true;
            }
            cur = *n.next();
        }
        false
    }
}
