//! The single-threaded event loop: listener bookkeeping, accept draining,
//! and dispatching readiness events to routines.
//!
//! Grounded on `framework.c`'s `ef_runtime_t`/`ef_listen_info_t`/
//! `ef_poll_data_t`/`ef_routine_t` and `ef_run_loop`. The free-list of
//! reusable `ef_queue_fd_t` records that buffered a listener's accepted
//! connections there is replaced here by a plain `VecDeque<RawFd>` per
//! [`Listener`] — `VecDeque` already amortizes its buffer the way that
//! free list existed to do, so the extra bookkeeping would be pure
//! duplication.

use std::cell::Cell;
use std::collections::VecDeque;
use std::ffi::c_void;
use std::io;
use std::os::unix::io::RawFd;
use std::ptr::{self, NonNull};
use std::sync::atomic::{AtomicBool, AtomicPtr, Ordering};

use crate::config::RuntimeConfig;
use crate::container_of;
use crate::error::RuntimeError;
use crate::fiber::Scheduler;
use crate::pool::{Coroutine, CoroutinePool};
use crate::poll::{DefaultBackend, Event, Interest, Poll};

static CURRENT_RUNTIME: AtomicPtr<Runtime> = AtomicPtr::new(ptr::null_mut());

/// The runtime currently active on this thread, or null if none has been
/// built yet. Used by [`crate::io`] to find "the current routine" without
/// every I/O call threading an explicit handle through.
pub(crate) fn current() -> *mut Runtime {
    CURRENT_RUNTIME.load(Ordering::Relaxed)
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum FdKind {
    Listen,
    Rwc,
}

/// The piece of bookkeeping a fd needs while it's associated with the poll
/// backend: which kind of fd it is, its own value (routines reuse one
/// `PollData` across many connections as their coroutine gets recycled, so
/// the fd isn't implicit), and a sentinel that keeps `close` from running
/// twice when a handler closes its own fd before returning.
pub(crate) struct PollData {
    kind: FdKind,
    pub(crate) fd: Cell<RawFd>,
    listener_ptr: *mut Listener,
    pub(crate) runtime_ptr: *mut Runtime,
    pub(crate) dissociated: Cell<bool>,
}

/// A listening socket plus the handler to run for each connection it
/// accepts, and the fds accepted but not yet handed to a routine.
///
/// Opaque from outside the crate: [`Runtime::add_listener`] owns the one it
/// creates for the lifetime of the runtime, so there is nothing for an
/// embedder to do with this type beyond naming it.
pub struct Listener {
    poll_data: PollData,
    handler: Box<dyn Fn(RawFd, &Routine) -> i64>,
    pending: VecDeque<RawFd>,
}

/// A coroutine running one accepted connection's handler.
///
/// `#[repr(C)]` with `co` as the first field so a `Routine` and the
/// `Coroutine`/`Fiber` embedded at its head share one address — the same
/// trick [`Coroutine`] itself plays on [`crate::fiber::Fiber`]. The
/// trampoline recovers a `Routine` straight out of the fiber-creation
/// param this way instead of stashing a second pointer anywhere.
#[repr(C)]
pub struct Routine {
    pub(crate) co: Coroutine,
    pub(crate) poll_data: PollData,
}

impl Routine {
    pub fn fd(&self) -> RawFd {
        self.poll_data.fd.get()
    }

    pub fn runtime(&self) -> &Runtime {
        unsafe { &*self.poll_data.runtime_ptr }
    }
}

/// Owns the poll backend, the coroutine pool, and every registered
/// listener. One `Runtime` per process; [`Runtime::run_loop`] blocks the
/// calling thread until [`Runtime::stop`] is called and every in-flight
/// routine has drained.
pub struct Runtime {
    poll: Poll<DefaultBackend>,
    pool: CoroutinePool,
    listeners: Vec<Box<Listener>>,
    stopping: AtomicBool,
    shrink_millisecs: u64,
    count_per_shrink: i32,
    poll_capacity: usize,
}

impl Runtime {
    pub fn new(config: RuntimeConfig) -> Result<Box<Runtime>, RuntimeError> {
        let poll = Poll::<DefaultBackend>::new(config.poll_capacity).map_err(|_| RuntimeError::PollCreate)?;
        let pool = CoroutinePool::new(config.stack_size, config.limit_min, config.limit_max)?;

        let rt = Box::new(Runtime {
            poll,
            pool,
            listeners: Vec::new(),
            stopping: AtomicBool::new(false),
            shrink_millisecs: config.shrink_millisecs,
            count_per_shrink: config.count_per_shrink,
            poll_capacity: config.poll_capacity,
        });

        let rt_ptr = Box::into_raw(rt);
        CURRENT_RUNTIME.store(rt_ptr, Ordering::Relaxed);
        Ok(unsafe { Box::from_raw(rt_ptr) })
    }

    /// Register a listening socket and the handler to run for each
    /// connection it accepts. `fd` is switched to non-blocking; the caller
    /// is responsible for having already `bind`/`listen`ed it.
    pub fn add_listener<F>(&mut self, fd: RawFd, handler: F) -> Result<(), RuntimeError>
    where
        F: Fn(RawFd, &Routine) -> i64 + 'static,
    {
        set_nonblocking(fd).map_err(|source| RuntimeError::ListenSetup { fd, source })?;

        let listener = Box::new(Listener {
            poll_data: PollData {
                kind: FdKind::Listen,
                fd: Cell::new(fd),
                listener_ptr: ptr::null_mut(),
                runtime_ptr: self as *mut Runtime,
                dissociated: Cell::new(false),
            },
            handler: Box::new(handler),
            pending: VecDeque::new(),
        });
        self.listeners.push(listener);
        Ok(())
    }

    /// Ask the loop to wind down: stop accepting new connections, let
    /// in-flight routines finish, then return from [`run_loop`](Self::run_loop).
    /// Safe to call from inside a handler.
    pub fn stop(&self) {
        self.stopping.store(true, Ordering::Relaxed);
    }

    pub(crate) fn associate(&mut self, fd: RawFd, interest: Interest, token: usize, fired: bool) -> io::Result<bool> {
        self.poll.associate(fd, interest, token, fired)
    }

    pub(crate) fn dissociate(&mut self, fd: RawFd, fired: bool, onclose: bool) -> io::Result<()> {
        self.poll.dissociate(fd, fired, onclose)
    }

    pub(crate) fn unset(&mut self, fd: RawFd, interest: Interest) {
        self.poll.unset(fd, interest)
    }

    pub(crate) fn scheduler_ptr(&self) -> *mut Scheduler {
        self.pool.scheduler_ptr()
    }

    pub(crate) fn current_coroutine(&self) -> Option<NonNull<Coroutine>> {
        self.pool.current()
    }

    /// Run until every listener is gone and no routine remains, as driven
    /// by [`stop`](Self::stop). Blocks the calling thread; mirrors
    /// `ef_run_loop`'s associate-listeners / wait / dispatch / drain-accepts
    /// / shrink cycle.
    pub fn run_loop(&mut self) -> Result<(), RuntimeError> {
        for listener in &self.listeners {
            let token = &listener.poll_data as *const PollData as usize;
            let fd = listener.poll_data.fd.get();
            self.poll.associate(fd, Interest::READABLE, token, false).map_err(RuntimeError::PollWait)?;
        }

        let mut events = vec![Event::default(); self.poll_capacity.max(128)];

        loop {
            let count = match self.poll.wait(&mut events, 1000) {
                Ok(n) => n,
                Err(e) => {
                    log::error!("poll wait failed: {}", e);
                    return Err(RuntimeError::PollWait(e));
                }
            };
            log::trace!("poll wait returned {} events", count);

            for event in &events[..count] {
                let poll_data_ptr = event.token as *mut PollData;
                let kind = unsafe { (*poll_data_ptr).kind };
                match kind {
                    FdKind::Listen => {
                        let pd = unsafe { NonNull::new_unchecked(poll_data_ptr) };
                        let listener_ptr = unsafe { container_of!(pd, Listener, poll_data) };
                        self.drain_accept(listener_ptr);
                    }
                    FdKind::Rwc => {
                        let pd = unsafe { NonNull::new_unchecked(poll_data_ptr) };
                        let routine_ptr = unsafe { container_of!(pd, Routine, poll_data) };
                        let co = unsafe { NonNull::new_unchecked(routine_ptr.as_ptr() as *mut Coroutine) };
                        if let Err(err) = unsafe { self.pool.resume(co, event.events.0 as i64) } {
                            log::warn!("resuming routine failed: {:?}", err);
                        }
                    }
                }
            }

            'dispatch: for listener in &mut self.listeners {
                while let Some(fd) = listener.pending.pop_front() {
                    let listener_ptr: *mut Listener = &mut **listener;
                    match spawn_routine(&mut self.pool, listener_ptr, fd) {
                        Ok(()) => {}
                        Err(()) => {
                            listener.pending.push_front(fd);
                            break 'dispatch;
                        }
                    }
                }
            }

            if self.stopping.load(Ordering::Relaxed) {
                self.shutdown_listeners();
                if self.pool.free_count() == self.pool.full_count() {
                    let freed = self.pool.shrink(0, -(self.pool.full_count() as i32));
                    log::debug!("stopping: freed {} coroutines, loop exiting", freed);
                    break;
                }
                self.pool.shrink(0, -(self.pool.free_count() as i32));
                continue;
            }

            if self.pool.free_count() > 0 && self.pool.full_count() > self.pool.limit_min() {
                self.pool.shrink(self.shrink_millisecs, self.count_per_shrink);
            }
        }
        Ok(())
    }

    /// Accept every pending connection on `listener_ptr`'s socket, queueing
    /// each fd for the next dispatch pass, then re-arm the listener. Only
    /// treats `EAGAIN`/`EWOULDBLOCK` as "drained" — any other accept error
    /// is logged and the listener stays armed rather than going silent.
    fn drain_accept(&mut self, listener_ptr: NonNull<Listener>) {
        let listener = unsafe { &mut *listener_ptr.as_ptr() };
        loop {
            let fd = unsafe { libc::accept(listener.poll_data.fd.get(), ptr::null_mut(), ptr::null_mut()) };
            if fd < 0 {
                let err = io::Error::last_os_error();
                if err.kind() == io::ErrorKind::WouldBlock {
                    self.poll.unset(listener.poll_data.fd.get(), Interest::READABLE);
                } else {
                    log::warn!("accept on fd {} failed: {}", listener.poll_data.fd.get(), err);
                }
                break;
            }
            if let Err(e) = set_nonblocking(fd) {
                log::warn!("failed to set accepted fd {} non-blocking: {}", fd, e);
                unsafe { libc::close(fd) };
                continue;
            }
            listener.pending.push_back(fd);
        }

        let token = &listener.poll_data as *const PollData as usize;
        let fd = listener.poll_data.fd.get();
        if let Err(e) = self.poll.associate(fd, Interest::READABLE, token, true) {
            log::warn!("failed to re-arm listener fd {}: {}", fd, e);
        }
    }

    fn shutdown_listeners(&mut self) {
        let mut remaining = Vec::new();
        for mut listener in self.listeners.drain(..) {
            let fd = listener.poll_data.fd.get();
            if fd >= 0 {
                let _ = self.poll.dissociate(fd, false, false);
                unsafe { libc::close(fd) };
                listener.poll_data.fd.set(-1);
            }
            if !listener.pending.is_empty() {
                remaining.push(listener);
            }
        }
        self.listeners = remaining;
    }
}

fn set_nonblocking(fd: RawFd) -> io::Result<()> {
    let flags = unsafe { libc::fcntl(fd, libc::F_GETFL) };
    if flags < 0 {
        return Err(io::Error::last_os_error());
    }
    if flags & libc::O_NONBLOCK == 0 && unsafe { libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK) } < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

/// Runs the handler bound to the routine's originating listener, then
/// closes the fd unless the handler already closed it itself via
/// [`crate::io::close`] (which sets `poll_data.dissociated`).
extern "C" fn routine_trampoline(param: *mut c_void) -> i64 {
    let routine_ptr = param as *mut Routine;
    let routine = unsafe { &*routine_ptr };
    let fd = routine.poll_data.fd.get();
    let listener = unsafe { &*routine.poll_data.listener_ptr };

    let retval = (listener.handler)(fd, routine);

    if !routine.poll_data.dissociated.get() {
        let rt = unsafe { &mut *routine.poll_data.runtime_ptr };
        let _ = rt.dissociate(fd, false, true);
        unsafe { libc::close(fd) };
    }
    retval
}

/// Create (or reuse) a coroutine for `fd`, fill in its `PollData`, and run
/// it up to its first yield or exit. Mirrors `ef_routine_run`.
fn spawn_routine(pool: &mut CoroutinePool, listener_ptr: *mut Listener, fd: RawFd) -> Result<(), ()> {
    let co = pool.create(std::mem::size_of::<Routine>(), routine_trampoline, ptr::null_mut()).ok_or(())?;
    let routine_ptr = co.cast::<Routine>();
    let runtime_ptr = unsafe { (*listener_ptr).poll_data.runtime_ptr };

    unsafe {
        ptr::write(
            ptr::addr_of_mut!((*routine_ptr.as_ptr()).poll_data),
            PollData {
                kind: FdKind::Rwc,
                fd: Cell::new(fd),
                listener_ptr,
                runtime_ptr,
                dissociated: Cell::new(false),
            },
        );
    }

    if let Err(err) = unsafe { pool.resume(co, 0) } {
        log::warn!("routine for fd {} failed to start: {:?}", fd, err);
    }
    Ok(())
}
