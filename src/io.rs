//! Synchronous-looking I/O for code running inside a routine.
//!
//! Each primitive associates the fd with the runtime's poll backend, yields
//! back to the event loop until it's ready, retries on `EAGAIN`/
//! `EWOULDBLOCK`, and dissociates once it has a definitive result —
//! mirroring `ef_routine_read`/`_write`/`_recv`/`_send`/`_connect`/`_close`
//! in `framework.c` closely enough to read as a transliteration. Every
//! function here panics if called from outside a routine; there is nothing
//! sensible to yield back to otherwise.

use std::ffi::c_void;
use std::io;
use std::net::SocketAddr;
use std::os::unix::io::RawFd;
use std::ptr::NonNull;

use crate::container_of;
use crate::fiber::Fiber;
use crate::poll::Interest;
use crate::runtime::{self, PollData, Routine};

fn current_routine() -> NonNull<Routine> {
    let rt_ptr = runtime::current();
    assert!(!rt_ptr.is_null(), "no runtime has been built on this thread");
    let co = unsafe { &*rt_ptr }.current_coroutine().expect("I/O primitive called outside a routine");
    unsafe { container_of!(co, Routine, co) }
}

/// Associate `fd` for `interest`, yield until it's ready (or an error/hup
/// fires), then call `attempt` and retry on `EAGAIN`/`EWOULDBLOCK` until it
/// returns a definitive result. Shared by `read`/`write`/`recv`/`send`.
fn perform(fd: RawFd, interest: Interest, mut attempt: impl FnMut() -> isize) -> io::Result<usize> {
    let routine = current_routine();
    let rt_ptr = unsafe { (*routine.as_ptr()).poll_data.runtime_ptr };
    unsafe { (*routine.as_ptr()).poll_data.fd.set(fd) };
    let token = unsafe { &(*routine.as_ptr()).poll_data as *const PollData as usize };
    let sched_ptr = unsafe { (*rt_ptr).scheduler_ptr() };

    let mut ready = unsafe { (*rt_ptr).associate(fd, interest, token, false)? };

    loop {
        if !ready {
            let events = unsafe { Fiber::yield_now(sched_ptr, 0) };
            let fired = Interest(events as u32);
            let fatal = fired.intersects(Interest::ERROR)
                || (interest == Interest::WRITABLE && fired.intersects(Interest::HUP));
            if fatal {
                let _ = unsafe { (*rt_ptr).dissociate(fd, true, false) };
                return Err(io::Error::from_raw_os_error(libc::EBADF));
            }
        }

        let rc = attempt();
        if rc >= 0 {
            let _ = unsafe { (*rt_ptr).dissociate(fd, true, false) };
            return Ok(rc as usize);
        }

        let err = io::Error::last_os_error();
        if err.kind() == io::ErrorKind::WouldBlock {
            unsafe { (*rt_ptr).unset(fd, interest) };
            ready = false;
            continue;
        }

        let _ = unsafe { (*rt_ptr).dissociate(fd, true, false) };
        return Err(err);
    }
}

/// Read into `buf`, yielding to the event loop for as long as `fd` has
/// nothing available.
pub fn read(fd: RawFd, buf: &mut [u8]) -> io::Result<usize> {
    perform(fd, Interest::READABLE, || unsafe { libc::read(fd, buf.as_mut_ptr() as *mut c_void, buf.len()) as isize })
}

/// Write from `buf`, yielding to the event loop for as long as `fd`'s send
/// buffer is full.
pub fn write(fd: RawFd, buf: &[u8]) -> io::Result<usize> {
    perform(fd, Interest::WRITABLE, || unsafe { libc::write(fd, buf.as_ptr() as *const c_void, buf.len()) as isize })
}

pub fn recv(fd: RawFd, buf: &mut [u8], flags: i32) -> io::Result<usize> {
    perform(fd, Interest::READABLE, || unsafe { libc::recv(fd, buf.as_mut_ptr() as *mut c_void, buf.len(), flags) as isize })
}

pub fn send(fd: RawFd, buf: &[u8], flags: i32) -> io::Result<usize> {
    perform(fd, Interest::WRITABLE, || unsafe { libc::send(fd, buf.as_ptr() as *const c_void, buf.len(), flags) as isize })
}

/// Connect `fd` to `addr`, yielding until the connect either succeeds or
/// fails (read back via `SO_ERROR` once the socket reports writable).
pub fn connect(fd: RawFd, addr: SocketAddr) -> io::Result<()> {
    let (storage, len) = socket_addr_to_raw(addr);
    let rc = unsafe { libc::connect(fd, &storage as *const _ as *const libc::sockaddr, len) };
    if rc == 0 {
        return Ok(());
    }
    let err = io::Error::last_os_error();
    if err.raw_os_error() != Some(libc::EINPROGRESS) {
        return Err(err);
    }

    let routine = current_routine();
    let rt_ptr = unsafe { (*routine.as_ptr()).poll_data.runtime_ptr };
    unsafe { (*routine.as_ptr()).poll_data.fd.set(fd) };
    let token = unsafe { &(*routine.as_ptr()).poll_data as *const PollData as usize };
    let sched_ptr = unsafe { (*rt_ptr).scheduler_ptr() };

    unsafe { (*rt_ptr).associate(fd, Interest::WRITABLE, token, false)? };
    let events = unsafe { Fiber::yield_now(sched_ptr, 0) };
    let fired = Interest(events as u32);

    let result = if fired.intersects(Interest::ERROR) || fired.intersects(Interest::HUP) {
        Err(io::Error::from_raw_os_error(libc::EBADF))
    } else {
        let mut sockerr: i32 = 0;
        let mut optlen = std::mem::size_of::<i32>() as libc::socklen_t;
        unsafe {
            libc::getsockopt(fd, libc::SOL_SOCKET, libc::SO_ERROR, &mut sockerr as *mut i32 as *mut c_void, &mut optlen);
        }
        if sockerr == 0 {
            Ok(())
        } else {
            Err(io::Error::from_raw_os_error(sockerr))
        }
    };

    let _ = unsafe { (*rt_ptr).dissociate(fd, true, false) };
    result
}

/// Dissociate and close `fd`. Marks the current routine's `PollData` so the
/// trampoline that runs its handler doesn't close the fd a second time once
/// the handler returns.
pub fn close(fd: RawFd) -> io::Result<()> {
    let routine = current_routine();
    unsafe { (*routine.as_ptr()).poll_data.dissociated.set(true) };
    let rt_ptr = unsafe { (*routine.as_ptr()).poll_data.runtime_ptr };
    unsafe { (*rt_ptr).dissociate(fd, false, true)? };
    if unsafe { libc::close(fd) } < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

fn socket_addr_to_raw(addr: SocketAddr) -> (libc::sockaddr_storage, libc::socklen_t) {
    let mut storage: libc::sockaddr_storage = unsafe { std::mem::zeroed() };
    let len = match addr {
        SocketAddr::V4(v4) => {
            let sin = libc::sockaddr_in {
                sin_family: libc::AF_INET as libc::sa_family_t,
                sin_port: v4.port().to_be(),
                sin_addr: libc::in_addr { s_addr: u32::from_ne_bytes(v4.ip().octets()) },
                sin_zero: [0; 8],
            };
            unsafe { std::ptr::write(&mut storage as *mut _ as *mut libc::sockaddr_in, sin) };
            std::mem::size_of::<libc::sockaddr_in>() as libc::socklen_t
        }
        SocketAddr::V6(v6) => {
            let sin6 = libc::sockaddr_in6 {
                sin6_family: libc::AF_INET6 as libc::sa_family_t,
                sin6_port: v6.port().to_be(),
                sin6_flowinfo: v6.flowinfo(),
                sin6_addr: libc::in6_addr { s6_addr: v6.ip().octets() },
                sin6_scope_id: v6.scope_id(),
            };
            unsafe { std::ptr::write(&mut storage as *mut _ as *mut libc::sockaddr_in6, sin6) };
            std::mem::size_of::<libc::sockaddr_in6>() as libc::socklen_t
        }
    };
    (storage, len)
}
