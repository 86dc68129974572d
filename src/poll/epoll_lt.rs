//! Level-triggered `epoll`, Linux's conventional backend.
//!
//! Grounded on the runtime's `epoll.c`: essentially a thin wrapper, since
//! `epoll_ctl`/`epoll_wait` already do the bookkeeping a classical `poll`
//! backend has to hand-roll. `associate` on an already-fired fd is a no-op,
//! same reasoning as the classical backend — level-triggered epoll re-fires
//! on its own as long as the fd stays registered.

use std::io;
use std::os::unix::io::RawFd;

use super::{normalize_capacity, Event, Interest, PollBackend};

pub struct EpollLtBackend {
    epfd: RawFd,
    cap: usize,
    raw_events: Vec<libc::epoll_event>,
}

fn interest_to_epoll(interest: Interest) -> u32 {
    let mut bits = 0u32;
    if interest.contains(Interest::READABLE) {
        bits |= libc::EPOLLIN as u32;
    }
    if interest.contains(Interest::WRITABLE) {
        bits |= libc::EPOLLOUT as u32;
    }
    bits
}

fn epoll_to_interest(bits: u32) -> Interest {
    let mut interest = Interest::NONE;
    if bits & libc::EPOLLIN as u32 != 0 {
        interest = interest | Interest::READABLE;
    }
    if bits & libc::EPOLLOUT as u32 != 0 {
        interest = interest | Interest::WRITABLE;
    }
    if bits & libc::EPOLLERR as u32 != 0 {
        interest = interest | Interest::ERROR;
    }
    if bits & libc::EPOLLHUP as u32 != 0 {
        interest = interest | Interest::HUP;
    }
    interest
}

impl PollBackend for EpollLtBackend {
    fn new(capacity: usize) -> io::Result<Self> {
        let cap = normalize_capacity(capacity);
        let epfd = unsafe { libc::epoll_create1(libc::EPOLL_CLOEXEC) };
        if epfd < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(EpollLtBackend { epfd, cap, raw_events: vec![unsafe { std::mem::zeroed() }; cap] })
    }

    fn associate(&mut self, fd: RawFd, interest: Interest, token: usize, fired: bool) -> io::Result<bool> {
        if fired {
            return Ok(false);
        }
        let mut ev = libc::epoll_event { events: interest_to_epoll(interest), u64: token as u64 };
        let rc = unsafe { libc::epoll_ctl(self.epfd, libc::EPOLL_CTL_ADD, fd, &mut ev) };
        if rc < 0 {
            let err = io::Error::last_os_error();
            if err.raw_os_error() == Some(libc::EEXIST) {
                let rc = unsafe { libc::epoll_ctl(self.epfd, libc::EPOLL_CTL_MOD, fd, &mut ev) };
                if rc < 0 {
                    return Err(io::Error::last_os_error());
                }
                return Ok(false);
            }
            return Err(err);
        }
        Ok(false)
    }

    fn dissociate(&mut self, fd: RawFd, _fired: bool, _onclose: bool) -> io::Result<()> {
        let mut ev: libc::epoll_event = unsafe { std::mem::zeroed() };
        let rc = unsafe { libc::epoll_ctl(self.epfd, libc::EPOLL_CTL_DEL, fd, &mut ev) };
        if rc < 0 {
            let err = io::Error::last_os_error();
            if err.raw_os_error() == Some(libc::ENOENT) || err.raw_os_error() == Some(libc::EBADF) {
                return Ok(());
            }
            return Err(err);
        }
        Ok(())
    }

    fn unset(&mut self, _fd: RawFd, _interest: Interest) {}

    fn wait(&mut self, events: &mut [Event], timeout_ms: i32) -> io::Result<usize> {
        let count = events.len().min(self.cap);
        let ret = unsafe { libc::epoll_wait(self.epfd, self.raw_events.as_mut_ptr(), count as i32, timeout_ms) };
        if ret < 0 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::Interrupted {
                return Ok(0);
            }
            return Err(err);
        }
        for i in 0..ret as usize {
            events[i] = Event { events: epoll_to_interest(self.raw_events[i].events), token: self.raw_events[i].u64 as usize };
        }
        Ok(ret as usize)
    }
}

impl Drop for EpollLtBackend {
    fn drop(&mut self) {
        unsafe {
            libc::close(self.epfd);
        }
    }
}
