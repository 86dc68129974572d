//! A pool of reusable coroutines built on top of [`crate::fiber`].
//!
//! A [`Coroutine`] is a [`Fiber`] plus pool bookkeeping: which list it is
//! threaded into, when it last ran, and how many times it has run. Exited
//! coroutines go onto a free list instead of being unmapped immediately, so
//! a busy server reuses stacks rather than paying `mmap`/`munmap` per
//! connection; [`CoroutinePool::shrink`] is the periodic call that actually
//! unmaps the ones that have sat idle too long.

use std::cell::Cell;
use std::ffi::c_void;
use std::ptr::{self, NonNull};
use std::time::{Duration, Instant};

use crate::container_of;
use crate::error::{FiberError, RuntimeError};
use crate::fiber::{Fiber, FiberProc, Scheduler};
use crate::list::ListLink;

/// A coroutine: a fiber nested inside pool bookkeeping.
///
/// `#[repr(C)]` with `fiber` as the first field so a pointer to a
/// `Coroutine` and a pointer to its `fiber` are interchangeable, and so a
/// caller that embeds `Coroutine` as the first field of its own larger
/// record (the way [`crate::runtime::Routine`] does) can still reach it
/// through [`Fiber::create`]'s `header_size` mechanism.
#[repr(C)]
pub struct Coroutine {
    pub fiber: Fiber,
    full_entry: ListLink,
    free_entry: ListLink,
    last_run_time: Cell<Instant>,
    run_count: Cell<u32>,
}

impl Coroutine {
    pub fn run_count(&self) -> u32 {
        self.run_count.get()
    }

    pub fn last_run_time(&self) -> Instant {
        self.last_run_time.get()
    }

    fn fiber_ptr(&self) -> NonNull<Fiber> {
        unsafe { NonNull::new_unchecked(&self.fiber as *const Fiber as *mut Fiber) }
    }
}

/// Owns a [`Scheduler`] and the full/free coroutine lists threaded through
/// it. Not `Sync`/`Send`: a pool belongs to exactly one event loop on one
/// thread.
pub struct CoroutinePool {
    sched: Box<Scheduler>,
    stack_size: usize,
    limit_min: usize,
    limit_max: usize,
    full_list: ListLink,
    free_list: ListLink,
    full_count: usize,
    free_count: usize,
    run_count: u64,
}

impl CoroutinePool {
    /// Create a pool whose coroutines get `stack_size`-byte stacks, never
    /// shrinking below `limit_min` coroutines and never growing past
    /// `limit_max`.
    pub fn new(stack_size: usize, limit_min: usize, limit_max: usize) -> Result<Self, RuntimeError> {
        let sched = Scheduler::init(true)?;

        let full_list = ListLink::detached();
        let free_list = ListLink::detached();

        Ok(CoroutinePool {
            sched,
            stack_size,
            limit_min,
            limit_max,
            full_list,
            free_list,
            full_count: 0,
            free_count: 0,
            run_count: 0,
        })
    }

    /// Acquire a coroutine ready to run `proc(param)`: reuses one from the
    /// free list if any are idle, otherwise creates a fresh one unless the
    /// pool is already at `limit_max`.
    pub fn create(&mut self, header_size: usize, proc: FiberProc, param: *mut c_void) -> Option<NonNull<Coroutine>> {
        if self.free_count > 0 {
            self.free_count -= 1;
            let link = unsafe { self.free_list.remove_after() }.expect("free_count > 0 implies a non-empty free list");
            let co = unsafe { container_of!(link, Coroutine, free_entry) };
            unsafe { Fiber::init(co.as_ref().fiber_ptr(), proc, param) };
            log::debug!("reused coroutine {:p} from the free list", co.as_ptr());
            return Some(co);
        }

        if self.full_count >= self.limit_max {
            log::warn!("coroutine pool at capacity ({} coroutines)", self.full_count);
            return None;
        }

        let sched_ptr = self.sched.as_ptr();
        let fiber = unsafe { Fiber::create(sched_ptr, self.stack_size, header_size, proc, param).ok()? };
        let co = fiber.cast::<Coroutine>();
        unsafe {
            ptr::write(ptr::addr_of_mut!((*co.as_ptr()).full_entry), ListLink::detached());
            ptr::write(ptr::addr_of_mut!((*co.as_ptr()).free_entry), ListLink::detached());
            ptr::write(ptr::addr_of_mut!((*co.as_ptr()).last_run_time), Cell::new(Instant::now()));
            ptr::write(ptr::addr_of_mut!((*co.as_ptr()).run_count), Cell::new(0));
            self.full_list.insert_after(NonNull::new_unchecked(ptr::addr_of_mut!((*co.as_ptr()).full_entry)));
        }
        self.full_count += 1;
        log::debug!("created coroutine {:p} ({}/{} in pool)", co.as_ptr(), self.full_count, self.limit_max);
        Some(co)
    }

    /// Resume (or first-run) `co`, passing `to_yield` as the value its next
    /// `yield_now` call receives. When `co` exits, moves it to the free list
    /// for reuse.
    ///
    /// # Safety
    /// `co` must have been returned by this pool's [`create`](Self::create)
    /// and must not already be running.
    pub unsafe fn resume(&mut self, co: NonNull<Coroutine>, to_yield: i64) -> Result<i64, FiberError> {
        let sched_ptr = self.sched.as_ptr();
        let fiber_ptr = co.as_ref().fiber_ptr();
        let retval = Fiber::resume(sched_ptr, fiber_ptr, to_yield)?;

        if co.as_ref().fiber.is_exited() {
            let co_ref = co.as_ref();
            co_ref.run_count.set(co_ref.run_count.get() + 1);
            co_ref.last_run_time.set(Instant::now());
            self.free_list
                .insert_after(NonNull::new_unchecked(ptr::addr_of_mut!((*co.as_ptr()).free_entry)));
            self.free_count += 1;
            self.run_count += 1;
            log::trace!("coroutine {:p} exited, moved to free list", co.as_ptr());
        }

        Ok(retval)
    }

    /// Evict at most `max_count` coroutines from the free list whose idle
    /// time exceeds `idle_millisecs`, stopping at the first one that hasn't
    /// been idle long enough (the free list is ordered oldest-resumed to
    /// newest, so that one marks the end of eligible entries). A negative
    /// `max_count` forces eviction down to `limit_min` regardless of sign
    /// convention elsewhere — mirrored from the pool this is based on, where
    /// a negative count means "shrink as hard as possible."
    pub fn shrink(&mut self, idle_millisecs: u64, max_count: i32) -> usize {
        if self.free_count == 0 || (max_count > 0 && self.full_count <= self.limit_min) {
            return 0;
        }

        let beyond_min = self.full_count as i64 - self.limit_min as i64;
        let mut budget = (max_count as i64).min(beyond_min.max(0));
        if budget < 0 {
            budget = -budget;
        }

        let idle = Duration::from_millis(idle_millisecs);
        let now = Instant::now();
        let head_ptr = &self.free_list as *const ListLink as *mut ListLink;
        let mut cursor = self.free_list.before();
        let mut freed = 0usize;

        while budget > 0 {
            let Some(link) = cursor else { break };
            if link.as_ptr() == head_ptr {
                break;
            }
            let co = unsafe { container_of!(link, Coroutine, free_entry) };
            let prior = unsafe { link.as_ref().before() };

            if now.duration_since(unsafe { co.as_ref().last_run_time.get() }) < idle {
                break;
            }

            unsafe {
                co.as_ref().free_entry.remove();
                co.as_ref().full_entry.remove();
                Fiber::delete(co.as_ref().fiber_ptr());
            }
            self.free_count -= 1;
            self.full_count -= 1;
            freed += 1;
            budget -= 1;
            cursor = prior;
        }

        if freed > 0 {
            log::debug!("pool shrink freed {} coroutines, {} remain", freed, self.full_count);
        }
        freed
    }

    /// The coroutine currently running on this pool's scheduler, or `None`
    /// if the thread itself is running (outside any coroutine).
    pub fn current(&self) -> Option<NonNull<Coroutine>> {
        let current = self.sched.current_fiber();
        if current.is_null() || current == self.sched.thread_fiber_ptr() {
            None
        } else {
            Some(unsafe { NonNull::new_unchecked(current as *mut Coroutine) })
        }
    }

    pub fn limit_min(&self) -> usize {
        self.limit_min
    }

    pub fn full_count(&self) -> usize {
        self.full_count
    }

    pub fn free_count(&self) -> usize {
        self.free_count
    }

    pub fn run_count(&self) -> u64 {
        self.run_count
    }

    pub(crate) fn scheduler_ptr(&self) -> *mut Scheduler {
        self.sched.as_ptr()
    }
}

impl Drop for CoroutinePool {
    fn drop(&mut self) {
        unsafe {
            while let Some(link) = self.full_list.remove_after() {
                let co = container_of!(link, Coroutine, full_entry);
                if co.as_ref().free_entry.before().is_some() {
                    co.as_ref().free_entry.remove();
                }
                Fiber::delete(co.as_ref().fiber_ptr());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc::{channel, Sender};

    extern "C" fn echo_once(param: *mut c_void) -> i64 {
        let tx = unsafe { &*(param as *const Sender<i32>) };
        tx.send(42).unwrap();
        0
    }

    #[test]
    fn create_and_resume_to_completion() {
        let mut pool = CoroutinePool::new(64 * 1024, 2, 8).unwrap();
        let (tx, rx) = channel::<i32>();

        let co = pool.create(std::mem::size_of::<Coroutine>(), echo_once, &tx as *const _ as *mut c_void).unwrap();
        unsafe { pool.resume(co, 0).unwrap() };

        assert_eq!(rx.recv().unwrap(), 42);
        assert_eq!(pool.full_count(), 1);
        assert_eq!(pool.free_count(), 1);
        assert_eq!(pool.run_count(), 1);
    }

    #[test]
    fn exited_coroutine_is_reused_from_free_list() {
        let mut pool = CoroutinePool::new(64 * 1024, 2, 8).unwrap();
        let (tx, rx) = channel::<i32>();

        let first = pool.create(std::mem::size_of::<Coroutine>(), echo_once, &tx as *const _ as *mut c_void).unwrap();
        unsafe { pool.resume(first, 0).unwrap() };
        assert_eq!(rx.recv().unwrap(), 42);

        let second = pool.create(std::mem::size_of::<Coroutine>(), echo_once, &tx as *const _ as *mut c_void).unwrap();
        assert_eq!(first.as_ptr(), second.as_ptr());
        assert_eq!(pool.full_count(), 1);
        assert_eq!(pool.free_count(), 0);

        unsafe { pool.resume(second, 0).unwrap() };
        assert_eq!(rx.recv().unwrap(), 42);
    }

    #[test]
    fn pool_refuses_beyond_limit_max() {
        let mut pool = CoroutinePool::new(64 * 1024, 0, 1).unwrap();
        let (tx, _rx) = channel::<i32>();

        let first = pool.create(std::mem::size_of::<Coroutine>(), echo_once, &tx as *const _ as *mut c_void);
        assert!(first.is_some());
        let second = pool.create(std::mem::size_of::<Coroutine>(), echo_once, &tx as *const _ as *mut c_void);
        assert!(second.is_none());
    }

    #[test]
    fn shrink_respects_limit_min() {
        let mut pool = CoroutinePool::new(64 * 1024, 2, 8).unwrap();
        let (tx, rx) = channel::<i32>();

        let mut handles = Vec::new();
        for _ in 0..4 {
            let co = pool.create(std::mem::size_of::<Coroutine>(), echo_once, &tx as *const _ as *mut c_void).unwrap();
            unsafe { pool.resume(co, 0).unwrap() };
            handles.push(co);
        }
        for _ in 0..4 {
            rx.recv().unwrap();
        }
        assert_eq!(pool.full_count(), 4);
        assert_eq!(pool.free_count(), 4);

        let freed = pool.shrink(0, 10);
        assert_eq!(freed, 2);
        assert_eq!(pool.full_count(), 2);
        assert_eq!(pool.free_count(), 2);
    }
}
