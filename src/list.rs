//! Intrusive doubly linked list.
//!
//! Chains coroutines and queued connections into the pool's full/free lists
//! and a listener's accept FIFO without a separate allocation per entry: the
//! link lives inside the struct it threads together, the same way
//! `ef_list_entry_t` is embedded in `ef_coroutine_t` and `ef_queue_fd_t` in
//! the runtime this crate is modeled on.
//!
//! A [`ListLink`] used as a list head is conceptually one whose `prev`/`next`
//! both point back to itself; there is no separate sentinel type. A freshly
//! [`detached`](ListLink::detached) link instead stores null in both slots
//! and every operation treats null as "points to self" on read, computing
//! the real self-pointer fresh from `&self` each time. This makes an unused
//! head safe to move (as part of its owning struct) any number of times
//! before its first real use — baking in a self-pointer before the owner
//! reaches its final address would dangle the moment the struct moves. All
//! mutation is `unsafe` because the list only stores raw pointers into
//! caller-owned memory and never asserts anything about the lifetime of the
//! entries it threads together — callers must guarantee an entry stays valid
//! (and its address stays fixed) for as long as it is linked.

use std::cell::Cell;
use std::ptr::NonNull;

/// One link in an intrusive doubly linked list.
///
/// Not `Sync` (it holds `Cell`s) and not meant to be shared across threads —
/// consistent with this crate's single-threaded cooperative scheduling model.
pub struct ListLink {
    prev: Cell<*mut ListLink>,
    next: Cell<*mut ListLink>,
}

impl ListLink {
    /// A detached link: null `prev`/`next`, meaning "points to self" once it
    /// ends up wherever its owner's final address is. Usable directly as an
    /// empty head with no separate initialization step.
    pub const fn detached() -> Self {
        ListLink {
            prev: Cell::new(std::ptr::null_mut()),
            next: Cell::new(std::ptr::null_mut()),
        }
    }

    fn self_ptr(&self) -> *mut ListLink {
        self as *const ListLink as *mut ListLink
    }

    fn next_ptr(&self) -> *mut ListLink {
        let n = self.next.get();
        if n.is_null() {
            self.self_ptr()
        } else {
            n
        }
    }

    fn prev_ptr(&self) -> *mut ListLink {
        let p = self.prev.get();
        if p.is_null() {
            self.self_ptr()
        } else {
            p
        }
    }

    pub fn is_empty(&self) -> bool {
        self.next_ptr() == self.self_ptr()
    }

    /// Unlink this entry from whatever list it is currently a member of.
    ///
    /// # Safety
    /// `self` must currently be linked (via `insert_before`/`insert_after`)
    /// into a list whose neighboring links are still valid.
    pub unsafe fn remove(&self) {
        let prev = &*self.prev_ptr();
        let next = &*self.next_ptr();
        next.prev.set(self.prev_ptr());
        prev.next.set(self.next_ptr());
    }

    /// Insert `entry` immediately before `self` in the list `self` belongs to.
    ///
    /// # Safety
    /// `entry` must not already be linked into a list, and must remain valid
    /// (fixed address) for as long as it stays linked.
    pub unsafe fn insert_before(&self, entry: NonNull<ListLink>) {
        let entry_ref = entry.as_ref();
        let me = self.self_ptr();
        let prev = self.prev_ptr();
        entry_ref.next.set(me);
        (*prev).next.set(entry.as_ptr());
        entry_ref.prev.set(prev);
        self.prev.set(entry.as_ptr());
    }

    /// Insert `entry` immediately after `self` in the list `self` belongs to.
    ///
    /// # Safety
    /// Same requirements as [`insert_before`](ListLink::insert_before).
    pub unsafe fn insert_after(&self, entry: NonNull<ListLink>) {
        let entry_ref = entry.as_ref();
        let me = self.self_ptr();
        let next = self.next_ptr();
        entry_ref.prev.set(me);
        (*next).prev.set(entry.as_ptr());
        entry_ref.next.set(next);
        self.next.set(entry.as_ptr());
    }

    /// The link before `self`, or `None` if `self` is an empty head.
    pub fn before(&self) -> Option<NonNull<ListLink>> {
        if self.is_empty() {
            None
        } else {
            NonNull::new(self.prev_ptr())
        }
    }

    /// The link after `self`, or `None` if `self` is an empty head.
    pub fn after(&self) -> Option<NonNull<ListLink>> {
        if self.is_empty() {
            None
        } else {
            NonNull::new(self.next_ptr())
        }
    }

    /// Detach and return the link after `self` (typically the head of a
    /// FIFO), or `None` if the list is empty.
    ///
    /// # Safety
    /// `self` must be a valid list head.
    pub unsafe fn remove_after(&self) -> Option<NonNull<ListLink>> {
        if self.is_empty() {
            return None;
        }
        let entry = NonNull::new_unchecked(self.next_ptr());
        let next_next = entry.as_ref().next_ptr();
        self.next.set(next_next);
        (*next_next).prev.set(self.self_ptr());
        Some(entry)
    }

    /// Detach and return the link before `self` (typically the tail, used by
    /// LIFO pool reuse), or `None` if the list is empty.
    ///
    /// # Safety
    /// `self` must be a valid list head.
    pub unsafe fn remove_before(&self) -> Option<NonNull<ListLink>> {
        if self.is_empty() {
            return None;
        }
        let entry = NonNull::new_unchecked(self.prev_ptr());
        let prev_prev = entry.as_ref().prev_ptr();
        self.prev.set(prev_prev);
        (*prev_prev).next.set(self.self_ptr());
        Some(entry)
    }
}

/// Recover a pointer to the struct that embeds a [`ListLink`] at `$field`,
/// given a pointer to that link. The intrusive-list equivalent of the
/// original runtime's `CAST_PARENT_PTR` macro.
#[macro_export]
macro_rules! container_of {
    ($ptr:expr, $ty:ty, $field:ident) => {{
        let offset = ::std::mem::offset_of!($ty, $field);
        let ptr = $ptr.as_ptr() as *mut u8;
        ::std::ptr::NonNull::new_unchecked(ptr.sub(offset) as *mut $ty)
    }};
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Item {
        value: u32,
        link: ListLink,
    }

    impl Item {
        fn new(value: u32) -> Box<Item> {
            Box::new(Item { value, link: ListLink::detached() })
        }
    }

    #[test]
    fn empty_head_round_trips() {
        let head = ListLink::detached();
        assert!(head.is_empty());
        assert!(head.before().is_none());
        assert!(head.after().is_none());
    }

    #[test]
    fn fifo_order_via_insert_after_and_remove_after() {
        let head = ListLink::detached();

        let items: Vec<Box<Item>> = (0..3).map(Item::new).collect();
        for item in &items {
            unsafe {
                let link = NonNull::from(&item.link);
                head.insert_before(link);
            }
        }

        let mut seen = Vec::new();
        unsafe {
            while let Some(link) = head.remove_after() {
                let item = container_of!(link, Item, link);
                seen.push(item.as_ref().value);
            }
        }
        assert_eq!(seen, vec![0, 1, 2]);
        assert!(head.is_empty());
    }

    #[test]
    fn lifo_order_via_insert_after_and_remove_before() {
        let head = ListLink::detached();

        let items: Vec<Box<Item>> = (0..3).map(Item::new).collect();
        for item in &items {
            unsafe {
                head.insert_after(NonNull::from(&item.link));
            }
        }

        let mut seen = Vec::new();
        unsafe {
            while let Some(link) = head.remove_before() {
                let item = container_of!(link, Item, link);
                seen.push(item.as_ref().value);
            }
        }
        assert_eq!(seen, vec![0, 1, 2]);
    }

    #[test]
    fn remove_mid_list() {
        let head = ListLink::detached();
        let items: Vec<Box<Item>> = (0..4).map(Item::new).collect();
        for item in &items {
            unsafe { head.insert_before(NonNull::from(&item.link)) };
        }
        unsafe { items[2].link.remove() };

        let mut seen = Vec::new();
        unsafe {
            while let Some(link) = head.remove_after() {
                let item = container_of!(link, Item, link);
                seen.push(item.as_ref().value);
            }
        }
        assert_eq!(seen, vec![0, 1, 3]);
    }
}
