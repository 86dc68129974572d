//! Stackful coroutines with lazily committed, guard-protected stacks.
//!
//! This is the primitive everything else in the crate is built on: a
//! [`Fiber`] is a single execution context with its own stack, switched to
//! and from cooperatively via [`Fiber::resume`] / [`Fiber::yield_now`]. The
//! stack layout mirrors the original runtime's `ef_fiber_t`:
//!
//! ```text
//!  high address
//!  +------------------+  <- stack_upper (== fiber header address)
//!  | Fiber header ... |
//!  |  (and whatever    |
//!  |   the caller nests|
//!  |   it inside)      |
//!  +------------------+  <- stack_lower moves down as the stack grows
//!  |  committed stack  |
//!  |  (grows downward) |
//!  +------------------+
//!  |  reserved, not    |
//!  |  yet committed    |
//!  +------------------+
//!  |   one guard page  |
//!  +------------------+  <- stack_area
//!  low address
//! ```
//!
//! A fiber's stack is reserved with `mmap(PROT_NONE)` and only the top page
//! committed up front; a SIGSEGV/SIGBUS whose fault address lands between the
//! guard page and the current `stack_lower` pages in more memory and resumes.
//! Context switching itself uses POSIX `ucontext` (`getcontext`/
//! `makecontext`/`swapcontext`) rather than hand-rolled assembly — the
//! register-and-stack-pointer save/restore this crate relies on, expressed
//! with the libc facility built for exactly that.

use std::cell::{Cell, UnsafeCell};
use std::ffi::c_void;
use std::os::raw::c_int;
use std::ptr::{self, NonNull};
use std::sync::atomic::{AtomicPtr, Ordering};

use crate::error::RuntimeError;
pub use crate::error::FiberError;

/// Entry point signature for a fiber, mirroring `ef_fiber_proc_t`. Returns
/// the value the fiber ultimately exits with.
pub type FiberProc = extern "C" fn(param: *mut c_void) -> i64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Status {
    /// Allocated but `init()` has not yet run. Never observed by callers —
    /// `Fiber::create` always initializes before returning — kept only so
    /// `resume`'s `NotInited` error path mirrors `ERROR_FIBER_NOT_INITED`.
    Uninited,
    Inited,
    Exited,
}

/// A single stackful execution context.
///
/// `#[repr(C)]` so that an embedding type (like a future coroutine record)
/// can place a `Fiber` as its first field and the two share an address —
/// the Rust expression of "the topmost `header_size` bytes of the stack
/// double as the fiber record" from the stack layout above.
#[repr(C)]
pub struct Fiber {
    stack_size: usize,
    stack_area: *mut c_void,
    stack_upper: *mut c_void,
    stack_lower: Cell<*mut c_void>,
    ctx: UnsafeCell<libc::ucontext_t>,
    status: Cell<Status>,
    parent: Cell<*mut Fiber>,
    sched: Cell<*mut Scheduler>,
}

/// Holds the fiber currently running on this OS thread plus a sentinel fiber
/// representing the thread itself, so yielding from the outermost fiber
/// returns control to the thread's own call stack.
pub struct Scheduler {
    current_fiber: Cell<*mut Fiber>,
    thread_fiber: Fiber,
}

// The signal handler needs to reach "the scheduler for this process" without
// a spare argument slot (siginfo handlers only get sig/info/ucontext). A
// single runtime per process is this crate's documented contract, so a
// process-wide pointer mirrors the original `ef_fiber_sched` global.
static CURRENT_SCHED: AtomicPtr<Scheduler> = AtomicPtr::new(ptr::null_mut());
static CACHED_PAGE_SIZE: AtomicPtr<()> = AtomicPtr::new(ptr::null_mut());

fn page_size() -> usize {
    let cached = CACHED_PAGE_SIZE.load(Ordering::Relaxed) as usize;
    if cached != 0 {
        return cached;
    }
    let sz = unsafe { libc::sysconf(libc::_SC_PAGESIZE) } as usize;
    CACHED_PAGE_SIZE.store(sz as *mut (), Ordering::Relaxed);
    sz
}

struct TrampolineArgs {
    fiber: *mut Fiber,
    proc: FiberProc,
    param: *mut c_void,
}

extern "C" fn trampoline(hi: u32, lo: u32) {
    let packed = ((hi as u64) << 32) | (lo as u64);
    let args = unsafe { Box::from_raw(packed as *mut TrampolineArgs) };
    let fiber = unsafe { &*args.fiber };

    let retval = (args.proc)(args.param);
    fiber.status.set(Status::Exited);

    log::trace!("fiber {:p} exited with {}", args.fiber, retval);

    unsafe {
        let parent = &*fiber.parent.get();
        libc::swapcontext(fiber.ctx.get(), parent.ctx.get());
    }
    unreachable!("resumed an exited fiber");
}

impl Fiber {
    /// Create a fiber in the address space of `sched`, reserving
    /// `stack_size` bytes (rounded up to a page, minimum one page) and
    /// carving out `header_size` bytes at the top for the caller's embedding
    /// struct (which must place a `Fiber` as its first field). Returns a
    /// pointer to that embedded `Fiber`, ready to run `entry(param)` on
    /// first resume.
    ///
    /// # Safety
    /// `header_size` must be at least `size_of::<Fiber>()` and must match
    /// the layout of whatever type the caller will reinterpret the returned
    /// pointer as.
    pub unsafe fn create(
        sched: *mut Scheduler,
        stack_size: usize,
        header_size: usize,
        entry: FiberProc,
        param: *mut c_void,
    ) -> Result<NonNull<Fiber>, RuntimeError> {
        let page = page_size();
        let stack_size = if stack_size == 0 { page } else { (stack_size + page - 1) & !(page - 1) };

        let area = libc::mmap(
            ptr::null_mut(),
            stack_size,
            libc::PROT_NONE,
            libc::MAP_PRIVATE | libc::MAP_ANON,
            -1,
            0,
        );
        if area == libc::MAP_FAILED {
            return Err(RuntimeError::StackMap(std::io::Error::last_os_error()));
        }

        let top_page = (area as *mut u8).add(stack_size - page) as *mut c_void;
        if libc::mprotect(top_page, page, libc::PROT_READ | libc::PROT_WRITE) < 0 {
            let err = std::io::Error::last_os_error();
            libc::munmap(area, stack_size);
            return Err(RuntimeError::StackProtect(err));
        }

        let fiber_ptr = (area as *mut u8).add(stack_size - header_size) as *mut Fiber;
        ptr::write(
            fiber_ptr,
            Fiber {
                stack_size,
                stack_area: area,
                stack_upper: fiber_ptr as *mut c_void,
                stack_lower: Cell::new(top_page),
                ctx: UnsafeCell::new(std::mem::zeroed()),
                status: Cell::new(Status::Uninited),
                parent: Cell::new(ptr::null_mut()),
                sched: Cell::new(sched),
            },
        );

        let fiber = NonNull::new_unchecked(fiber_ptr);
        Self::init(fiber, entry, param);
        Ok(fiber)
    }

    /// Re-initialize an exited fiber in place with a new entry function,
    /// reusing its existing stack. Transitions status back to `Inited`.
    ///
    /// # Safety
    /// `fiber` must point at a live `Fiber` (created via [`Fiber::create`]),
    /// not currently running.
    pub unsafe fn init(fiber: NonNull<Fiber>, entry: FiberProc, param: *mut c_void) {
        let f = fiber.as_ref();

        if libc::getcontext(f.ctx.get()) < 0 {
            panic!("getcontext failed");
        }
        let usable_size = (f.stack_upper as usize) - (f.stack_area as usize) - page_size();
        (*f.ctx.get()).uc_stack.ss_sp = f.stack_area;
        (*f.ctx.get()).uc_stack.ss_size = usable_size;
        (*f.ctx.get()).uc_link = ptr::null_mut();

        let param = if param.is_null() { fiber.as_ptr() as *mut c_void } else { param };
        let args = Box::new(TrampolineArgs { fiber: fiber.as_ptr(), proc: entry, param });
        let packed = Box::into_raw(args) as u64;
        let hi = (packed >> 32) as u32;
        let lo = packed as u32;

        let trampoline_fn: extern "C" fn() = std::mem::transmute(trampoline as extern "C" fn(u32, u32));
        libc::makecontext(f.ctx.get(), trampoline_fn, 2, hi, lo);

        f.status.set(Status::Inited);
    }

    /// Unmap the fiber's entire reserved stack region (which the `Fiber`
    /// record itself lives inside). A fiber must never delete itself.
    ///
    /// # Safety
    /// `fiber` must not be the currently running fiber, and must not be
    /// referenced again afterward.
    pub unsafe fn delete(fiber: NonNull<Fiber>) {
        let f = fiber.as_ref();
        libc::munmap(f.stack_area, f.stack_size);
    }

    /// Resume `to`, switching the calling context onto its stack. Returns
    /// the value `to` next passes to [`Fiber::yield_now`], or its final
    /// return value if it runs to completion.
    ///
    /// # Safety
    /// `sched` must be the scheduler `to` was created against; `to` must not
    /// already be an ancestor of the calling fiber (no cycles), and `to`
    /// must not already be running.
    pub unsafe fn resume(sched: *mut Scheduler, to: NonNull<Fiber>, sndval: i64) -> Result<i64, FiberError> {
        let to_ref = to.as_ref();
        match to_ref.status.get() {
            Status::Exited => return Err(FiberError::Exited),
            Status::Uninited => return Err(FiberError::NotInited),
            Status::Inited => {}
        }

        let sched_ref = &*sched;
        let current = sched_ref.current_fiber.get();
        to_ref.parent.set(current);
        sched_ref.current_fiber.set(to.as_ptr());

        log::trace!("resuming fiber {:p} from {:p}", to.as_ptr(), current);

        RESUME_ARG.with(|c| c.set(sndval));
        libc::swapcontext((*current).ctx.get(), to_ref.ctx.get());
        Ok(YIELD_ARG.with(|c| c.get()))
    }

    /// Suspend the currently running fiber, returning control to its
    /// parent. Returns the value the next `resume` call passes in.
    ///
    /// # Safety
    /// Must be called from within a running fiber (not the thread fiber).
    pub unsafe fn yield_now(sched: *mut Scheduler, sndval: i64) -> i64 {
        let sched_ref = &*sched;
        let current = sched_ref.current_fiber.get();
        let parent = (*current).parent.get();
        sched_ref.current_fiber.set(parent);

        YIELD_ARG.with(|c| c.set(sndval));
        libc::swapcontext((*current).ctx.get(), (*parent).ctx.get());
        RESUME_ARG.with(|c| c.get())
    }

    /// Pages in `[page_aligned(addr), stack_lower)`, refusing if that would
    /// encroach on the guard page (the lowest page of `stack_area`).
    pub fn expand_stack(&self, addr: *mut c_void) -> Result<(), ()> {
        let page = page_size();
        let lower = ((addr as usize) & !(page - 1)) as *mut c_void;

        let area = self.stack_area as usize;
        let cur_lower = self.stack_lower.get() as usize;
        if (lower as usize).wrapping_sub(area) >= page && (lower as usize) < cur_lower {
            let size = cur_lower - lower as usize;
            let rc = unsafe { libc::mprotect(lower, size, libc::PROT_READ | libc::PROT_WRITE) };
            if rc >= 0 {
                self.stack_lower.set(lower);
                return Ok(());
            }
        }
        Err(())
    }

    pub fn is_exited(&self) -> bool {
        self.status.get() == Status::Exited
    }

    pub fn stack_lower(&self) -> *mut c_void {
        self.stack_lower.get()
    }

    pub fn stack_area(&self) -> *mut c_void {
        self.stack_area
    }
}

thread_local! {
    // ucontext's swapcontext carries no payload of its own, so the
    // resume/yield values travel through thread-local cells bracketing each
    // swap, the same role `sndval`/the swap's return value play when a
    // context switch is written directly in assembly.
    static RESUME_ARG: Cell<i64> = const { Cell::new(0) };
    static YIELD_ARG: Cell<i64> = const { Cell::new(0) };
}

impl Scheduler {
    /// Build a scheduler and, if `handle_sigsegv` is set, install the
    /// SIGSEGV/SIGBUS handler (on an alternate signal stack) that expands a
    /// fiber's stack on a legitimate growth fault.
    pub fn init(handle_sigsegv: bool) -> Result<Box<Scheduler>, RuntimeError> {
        let mut sched = Box::new(Scheduler {
            current_fiber: Cell::new(ptr::null_mut()),
            thread_fiber: unsafe {
                Fiber {
                    stack_size: 0,
                    stack_area: ptr::null_mut(),
                    stack_upper: ptr::null_mut(),
                    stack_lower: Cell::new(ptr::null_mut()),
                    ctx: UnsafeCell::new(std::mem::zeroed()),
                    status: Cell::new(Status::Inited),
                    parent: Cell::new(ptr::null_mut()),
                    sched: Cell::new(ptr::null_mut()),
                }
            },
        });

        let thread_fiber_ptr = &sched.thread_fiber as *const Fiber as *mut Fiber;
        sched.current_fiber.set(thread_fiber_ptr);
        sched.thread_fiber.parent.set(thread_fiber_ptr);

        let sched_ptr = sched.as_mut() as *mut Scheduler;
        sched.thread_fiber.sched.set(sched_ptr);

        CURRENT_SCHED.store(sched_ptr, Ordering::Release);

        if handle_sigsegv {
            install_sigsegv_handler()?;
        }
        Ok(sched)
    }

    pub fn as_ptr(&self) -> *mut Scheduler {
        self as *const Scheduler as *mut Scheduler
    }

    pub fn current_fiber(&self) -> *mut Fiber {
        self.current_fiber.get()
    }

    pub fn thread_fiber_ptr(&self) -> *mut Fiber {
        &self.thread_fiber as *const Fiber as *mut Fiber
    }

    pub fn is_thread_running(&self) -> bool {
        self.current_fiber.get() == self.thread_fiber_ptr()
    }
}

fn install_sigsegv_handler() -> Result<(), RuntimeError> {
    unsafe {
        let stack_size = libc::SIGSTKSZ.max(32 * 1024);
        let ss_sp = libc::mmap(
            ptr::null_mut(),
            stack_size,
            libc::PROT_READ | libc::PROT_WRITE,
            libc::MAP_PRIVATE | libc::MAP_ANON,
            -1,
            0,
        );
        if ss_sp == libc::MAP_FAILED {
            return Err(RuntimeError::SchedInit(std::io::Error::last_os_error()));
        }

        let ss = libc::stack_t { ss_sp, ss_size: stack_size, ss_flags: 0 };
        if libc::sigaltstack(&ss, ptr::null_mut()) < 0 {
            return Err(RuntimeError::SchedInit(std::io::Error::last_os_error()));
        }

        let mut sa: libc::sigaction = std::mem::zeroed();
        sa.sa_flags = libc::SA_SIGINFO | libc::SA_ONSTACK;
        sa.sa_sigaction = sigsegv_handler as usize;

        if libc::sigaction(libc::SIGSEGV, &sa, ptr::null_mut()) < 0 {
            return Err(RuntimeError::SchedInit(std::io::Error::last_os_error()));
        }
        if libc::sigaction(libc::SIGBUS, &sa, ptr::null_mut()) < 0 {
            return Err(RuntimeError::SchedInit(std::io::Error::last_os_error()));
        }
    }
    Ok(())
}

extern "C" fn sigsegv_handler(sig: c_int, info: *mut libc::siginfo_t, _ucontext: *mut c_void) {
    // Async-signal-safe: no allocation, no formatting. Pointer arithmetic
    // and mprotect are both safe to call from a signal handler per POSIX.
    let sched = CURRENT_SCHED.load(Ordering::Acquire);
    let legitimate = if sched.is_null() || (sig != libc::SIGSEGV && sig != libc::SIGBUS) {
        false
    } else {
        unsafe {
            let fault_addr = (*info).si_addr();
            let current = (*sched).current_fiber.get();
            if current.is_null() || current == (*sched).thread_fiber_ptr() {
                false
            } else {
                (*current).expand_stack(fault_addr).is_ok()
            }
        }
    };

    if !legitimate {
        unsafe {
            libc::raise(libc::SIGABRT);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc::channel;

    extern "C" fn record_one(param: *mut c_void) -> i64 {
        let tx = unsafe { &*(param as *const std::sync::mpsc::Sender<i32>) };
        tx.send(1).unwrap();
        0
    }

    #[test]
    fn resume_runs_entry_to_completion() {
        let sched = Scheduler::init(false).unwrap();
        let sched_ptr = sched.as_ptr();
        let (tx, rx) = channel::<i32>();

        unsafe {
            let fiber =
                Fiber::create(sched_ptr, 64 * 1024, std::mem::size_of::<Fiber>(), record_one, &tx as *const _ as *mut c_void)
                    .unwrap();
            let ret = Fiber::resume(sched_ptr, fiber, 0).unwrap();
            assert_eq!(ret, 0);
            assert!(fiber.as_ref().is_exited());
            Fiber::delete(fiber);
        }
        assert_eq!(rx.recv().unwrap(), 1);
    }

    extern "C" fn yield_twice(param: *mut c_void) -> i64 {
        let sched = param as *mut Scheduler;
        let first = unsafe { Fiber::yield_now(sched, 10) };
        let second = unsafe { Fiber::yield_now(sched, first + 1) };
        second + 1
    }

    #[test]
    fn yield_and_resume_round_trip_values() {
        let sched = Scheduler::init(false).unwrap();
        let sched_ptr = sched.as_ptr();

        unsafe {
            let fiber = Fiber::create(
                sched_ptr,
                64 * 1024,
                std::mem::size_of::<Fiber>(),
                yield_twice,
                sched_ptr as *mut c_void,
            )
            .unwrap();

            let r1 = Fiber::resume(sched_ptr, fiber, 0).unwrap();
            assert_eq!(r1, 10);
            assert!(!fiber.as_ref().is_exited());

            let r2 = Fiber::resume(sched_ptr, fiber, 100).unwrap();
            assert_eq!(r2, 101);
            assert!(!fiber.as_ref().is_exited());

            let r3 = Fiber::resume(sched_ptr, fiber, 5).unwrap();
            assert_eq!(r3, 6);
            assert!(fiber.as_ref().is_exited());

            Fiber::delete(fiber);
        }
    }

    #[test]
    fn resume_exited_fiber_is_rejected() {
        let sched = Scheduler::init(false).unwrap();
        let sched_ptr = sched.as_ptr();
        let (tx, _rx) = channel::<i32>();

        unsafe {
            let fiber =
                Fiber::create(sched_ptr, 64 * 1024, std::mem::size_of::<Fiber>(), record_one, &tx as *const _ as *mut c_void)
                    .unwrap();
            Fiber::resume(sched_ptr, fiber, 0).unwrap();
            let err = Fiber::resume(sched_ptr, fiber, 0).unwrap_err();
            assert_eq!(err, FiberError::Exited);
            Fiber::delete(fiber);
        }
    }

    extern "C" fn grow_stack(param: *mut c_void) -> i64 {
        fn recurse(sched: *mut Scheduler, depth: u32) -> i64 {
            let mut buf = [0u8; 512];
            buf[0] = depth as u8;
            if depth == 0 {
                unsafe { Fiber::yield_now(sched, buf[0] as i64) }
            } else {
                recurse(sched, depth - 1) + buf[0] as i64 - buf[0] as i64
            }
        }
        let sched = param as *mut Scheduler;
        recurse(sched, 80)
    }

    #[test]
    fn stack_grows_under_recursion_within_budget() {
        let sched = Scheduler::init(true).unwrap();
        let sched_ptr = sched.as_ptr();

        unsafe {
            let fiber = Fiber::create(
                sched_ptr,
                64 * 1024,
                std::mem::size_of::<Fiber>(),
                grow_stack,
                sched_ptr as *mut c_void,
            )
            .unwrap();
            let before = fiber.as_ref().stack_lower();
            let _ = Fiber::resume(sched_ptr, fiber, 0).unwrap();
            let after = fiber.as_ref().stack_lower();
            assert!(after as usize <= before as usize);
            Fiber::delete(fiber);
        }
    }
}
