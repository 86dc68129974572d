//! The fallback backend: plain POSIX `poll(2)`, usable on any Unix.
//!
//! Grounded on the runtime's `poll.c`: a dense `pollfd` array plus a
//! `fd -> index` side table so `dissociate` can swap-remove in O(1) instead
//! of scanning. `associate` on an already-fired fd is a no-op — `poll`
//! doesn't auto-dissociate, so there's nothing to re-arm.

use std::io;
use std::os::unix::io::RawFd;

use super::{normalize_capacity, Event, Interest, PollBackend};

pub struct PollClassicalBackend {
    index: Vec<i32>,
    pfds: Vec<libc::pollfd>,
    tokens: Vec<usize>,
}

impl PollClassicalBackend {
    fn expand(&mut self, fd: RawFd) {
        let fd = fd as usize;
        if self.index.len() > fd {
            return;
        }
        let mut cap = self.index.len().max(1);
        while cap <= fd {
            cap <<= 1;
        }
        self.index.resize(cap, -1);
        self.tokens.resize(cap, 0);
    }

    fn interest_to_events(interest: Interest) -> libc::c_short {
        let mut bits = 0;
        if interest.contains(Interest::READABLE) {
            bits |= libc::POLLIN;
        }
        if interest.contains(Interest::WRITABLE) {
            bits |= libc::POLLOUT;
        }
        bits as libc::c_short
    }

    fn revents_to_interest(revents: libc::c_short) -> Interest {
        let mut interest = Interest::NONE;
        if revents as i32 & libc::POLLIN as i32 != 0 {
            interest = interest | Interest::READABLE;
        }
        if revents as i32 & libc::POLLOUT as i32 != 0 {
            interest = interest | Interest::WRITABLE;
        }
        if revents as i32 & libc::POLLERR as i32 != 0 {
            interest = interest | Interest::ERROR;
        }
        if revents as i32 & libc::POLLHUP as i32 != 0 {
            interest = interest | Interest::HUP;
        }
        interest
    }
}

impl PollBackend for PollClassicalBackend {
    fn new(capacity: usize) -> io::Result<Self> {
        let cap = normalize_capacity(capacity);
        Ok(PollClassicalBackend { index: vec![-1; cap], pfds: Vec::with_capacity(cap), tokens: vec![0; cap] })
    }

    fn associate(&mut self, fd: RawFd, interest: Interest, token: usize, fired: bool) -> io::Result<bool> {
        if fired {
            return Ok(false);
        }
        self.expand(fd);

        let fdu = fd as usize;
        let mut idx = self.index[fdu];
        if idx < 0 {
            idx = self.pfds.len() as i32;
            self.index[fdu] = idx;
            self.pfds.push(libc::pollfd { fd, events: 0, revents: 0 });
        }
        self.tokens[fdu] = token;
        self.pfds[idx as usize].events = Self::interest_to_events(interest);
        Ok(false)
    }

    fn dissociate(&mut self, fd: RawFd, _fired: bool, _onclose: bool) -> io::Result<()> {
        let fdu = fd as usize;
        if fdu >= self.index.len() {
            return Ok(());
        }
        let idx = self.index[fdu];
        if idx < 0 {
            return Ok(());
        }
        self.index[fdu] = -1;

        let last = self.pfds.len() - 1;
        if (idx as usize) < last {
            self.pfds.swap(idx as usize, last);
            let moved_fd = self.pfds[idx as usize].fd as usize;
            self.index[moved_fd] = idx;
        }
        self.pfds.pop();
        Ok(())
    }

    fn unset(&mut self, _fd: RawFd, _interest: Interest) {}

    fn wait(&mut self, events: &mut [Event], timeout_ms: i32) -> io::Result<usize> {
        let ret = unsafe { libc::poll(self.pfds.as_mut_ptr(), self.pfds.len() as libc::nfds_t, timeout_ms) };
        if ret < 0 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::Interrupted {
                return Ok(0);
            }
            return Err(err);
        }
        if ret == 0 {
            return Ok(0);
        }

        let mut filled = 0;
        for slot in &self.pfds {
            if filled >= events.len() {
                break;
            }
            if slot.revents != 0 {
                events[filled] = Event { events: Self::revents_to_interest(slot.revents), token: self.tokens[slot.fd as usize] };
                filled += 1;
            }
        }
        Ok(filled)
    }
}
