//! Solaris/illumos event ports.
//!
//! Grounded on the runtime's `port.c`. The simplest backend: `port_associate`
//! and `port_dissociate` map almost directly onto `associate`/`dissociate`,
//! and — unlike every other backend here — the kernel auto-dissociates a fd
//! once its event fires, so `dissociate` on an already-fired fd is a no-op.

use std::io;
use std::os::unix::io::RawFd;

use super::{normalize_capacity, Event, Interest, PollBackend};

pub struct EventPortBackend {
    ptfd: RawFd,
    cap: usize,
    raw_events: Vec<libc::port_event>,
}

fn interest_to_port(interest: Interest) -> i32 {
    let mut bits = 0;
    if interest.contains(Interest::READABLE) {
        bits |= libc::POLLIN;
    }
    if interest.contains(Interest::WRITABLE) {
        bits |= libc::POLLOUT;
    }
    bits
}

fn port_to_interest(bits: i32) -> Interest {
    let mut interest = Interest::NONE;
    if bits & libc::POLLIN != 0 {
        interest = interest | Interest::READABLE;
    }
    if bits & libc::POLLOUT != 0 {
        interest = interest | Interest::WRITABLE;
    }
    if bits & libc::POLLERR != 0 {
        interest = interest | Interest::ERROR;
    }
    if bits & libc::POLLHUP != 0 {
        interest = interest | Interest::HUP;
    }
    interest
}

impl PollBackend for EventPortBackend {
    fn new(capacity: usize) -> io::Result<Self> {
        let cap = normalize_capacity(capacity);
        let ptfd = unsafe { libc::port_create() };
        if ptfd < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(EventPortBackend { ptfd, cap, raw_events: vec![unsafe { std::mem::zeroed() }; cap] })
    }

    fn associate(&mut self, fd: RawFd, interest: Interest, token: usize, _fired: bool) -> io::Result<bool> {
        let rc = unsafe {
            libc::port_associate(self.ptfd, libc::PORT_SOURCE_FD, fd as libc::uintptr_t, interest_to_port(interest), token as *mut libc::c_void)
        };
        if rc < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(false)
    }

    fn dissociate(&mut self, fd: RawFd, fired: bool, _onclose: bool) -> io::Result<()> {
        if fired {
            return Ok(());
        }
        let rc = unsafe { libc::port_dissociate(self.ptfd, libc::PORT_SOURCE_FD, fd as libc::uintptr_t) };
        if rc < 0 {
            let err = io::Error::last_os_error();
            if err.raw_os_error() == Some(libc::ENOENT) {
                return Ok(());
            }
            return Err(err);
        }
        Ok(())
    }

    fn unset(&mut self, _fd: RawFd, _interest: Interest) {}

    fn wait(&mut self, events: &mut [Event], timeout_ms: i32) -> io::Result<usize> {
        let timeout = libc::timespec {
            tv_sec: (timeout_ms / 1000) as libc::time_t,
            tv_nsec: ((timeout_ms % 1000) * 1_000_000) as libc::c_long,
        };
        let count = events.len().min(self.raw_events.len()) as u32;
        let mut nget: u32 = if count > 0 { 1 } else { 0 };

        let rc = unsafe { libc::port_getn(self.ptfd, self.raw_events.as_mut_ptr(), count, &mut nget, &timeout as *const _ as *mut _) };
        if rc < 0 {
            let err = io::Error::last_os_error();
            if err.raw_os_error() == Some(libc::ETIME) {
                return Ok(0);
            }
            if err.kind() == io::ErrorKind::Interrupted {
                return Ok(0);
            }
            return Err(err);
        }

        for i in 0..nget as usize {
            let e = &self.raw_events[i];
            events[i] = Event { events: port_to_interest(e.portev_events), token: e.portev_user as usize };
        }
        Ok(nget as usize)
    }
}

impl Drop for EventPortBackend {
    fn drop(&mut self) {
        unsafe {
            libc::close(self.ptfd);
        }
    }
}
