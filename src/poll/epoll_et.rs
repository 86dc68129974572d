//! Edge-triggered `epoll`.
//!
//! Grounded on the runtime's `epollet.c`. Edge-triggered mode only tells you
//! about a *change* in readiness, so the backend must remember readiness
//! across calls instead of re-querying the kernel each time. It keeps one
//! `EPOLLIN | EPOLLOUT | EPOLLET` registration per fd forever (added once,
//! never modified) and partitions its own `items` array into a "filled"
//! prefix (fds with at least one bit the caller is waiting on already
//! fired) and the rest, swapping entries across the boundary as bits are
//! set or cleared. `wait` only calls into the kernel when the filled prefix
//! is empty; otherwise it drains the prefix directly.

use std::io;
use std::os::unix::io::RawFd;

use super::{normalize_capacity, Event, Interest, PollBackend};

#[derive(Clone, Copy, Default)]
struct Item {
    fd: RawFd,
    waiting: Interest,
    fired: Interest,
    token: usize,
}

pub struct EpollEtBackend {
    epfd: RawFd,
    cap: usize,
    used: usize,
    fill: usize,
    index: Vec<i32>,
    items: Vec<Item>,
    raw_events: Vec<libc::epoll_event>,
}

const ERROR_OR_HUP: Interest = Interest(Interest::ERROR.0 | Interest::HUP.0);

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

impl EpollEtBackend {
    fn expand(&mut self, fd: RawFd) {
        let fdu = fd as usize;
        if self.cap > fdu {
            return;
        }
        let mut cap = self.cap.max(1);
        while cap <= fdu {
            cap <<= 1;
        }
        self.index.resize(cap, -1);
        self.items.resize(cap, Item::default());
        self.cap = cap;
    }

    /// Swap item `idx` to the boundary and grow `fill` by one, so it joins
    /// the filled prefix.
    fn promote(&mut self, idx: usize) {
        if idx > self.fill {
            let boundary_fd = self.items[self.fill].fd as usize;
            self.index[boundary_fd] = idx as i32;
            self.index[self.items[idx].fd as usize] = self.fill as i32;
            self.items.swap(self.fill, idx);
        }
        if idx >= self.fill {
            self.fill += 1;
        }
    }

    /// Swap item `idx` out of the filled prefix, shrinking `fill` by one.
    fn demote(&mut self, idx: usize) {
        if idx < self.fill {
            self.fill -= 1;
            if idx < self.fill {
                let boundary_fd = self.items[self.fill].fd as usize;
                self.index[boundary_fd] = idx as i32;
                self.index[self.items[idx].fd as usize] = self.fill as i32;
                self.items.swap(idx, self.fill);
            }
        }
    }
}

impl PollBackend for EpollEtBackend {
    fn new(capacity: usize) -> io::Result<Self> {
        let cap = normalize_capacity(capacity);
        let epfd = unsafe { libc::epoll_create1(libc::EPOLL_CLOEXEC) };
        if epfd < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(EpollEtBackend {
            epfd,
            cap,
            used: 0,
            fill: 0,
            index: vec![-1; cap],
            items: vec![Item::default(); cap],
            raw_events: vec![unsafe { std::mem::zeroed() }; cap],
        })
    }

    fn associate(&mut self, fd: RawFd, interest: Interest, token: usize, _fired: bool) -> io::Result<bool> {
        self.expand(fd);
        let fdu = fd as usize;
        let mut idx = self.index[fdu];

        if idx < 0 {
            idx = self.used as i32;
            self.used += 1;
            self.index[fdu] = idx;

            self.items[idx as usize] = Item { fd, waiting: interest, fired: Interest::WRITABLE, token };

            let mut ev = libc::epoll_event {
                events: (libc::EPOLLIN | libc::EPOLLOUT | libc::EPOLLET) as u32,
                u64: fd as u64,
            };
            if unsafe { libc::epoll_ctl(self.epfd, libc::EPOLL_CTL_ADD, fd, &mut ev) } < 0 {
                return Err(io::Error::last_os_error());
            }
        } else {
            self.items[idx as usize].waiting = interest;
            self.items[idx as usize].token = token;
        }

        let item = self.items[idx as usize];
        if (item.waiting | ERROR_OR_HUP).intersects(item.fired) {
            self.promote(idx as usize);
            return Ok(true);
        }
        Ok(false)
    }

    fn dissociate(&mut self, fd: RawFd, _fired: bool, onclose: bool) -> io::Result<()> {
        let fdu = fd as usize;
        if fdu >= self.cap {
            return Ok(());
        }
        let idx = self.index[fdu];
        if idx < 0 {
            return Ok(());
        }
        let mut idx = idx as usize;

        if onclose {
            // The entry is being discarded outright, so (unlike `demote`,
            // which preserves both entries across the swap) the last entry
            // in whichever region `idx` sat in is moved directly on top of
            // it and `idx`'s own data is dropped.
            self.index[fdu] = -1;

            if idx < self.fill {
                self.fill -= 1;
                if idx < self.fill {
                    let moved = self.items[self.fill];
                    self.items[idx] = moved;
                    self.index[moved.fd as usize] = idx as i32;
                    idx = self.fill;
                }
            }

            self.used -= 1;
            if idx < self.used {
                let moved = self.items[self.used];
                self.items[idx] = moved;
                self.index[moved.fd as usize] = idx as i32;
            }

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
        } else {
            self.items[idx].waiting = Interest::NONE;
            self.demote(idx);
            Ok(())
        }
    }

    fn unset(&mut self, fd: RawFd, interest: Interest) {
        let fdu = fd as usize;
        if fdu >= self.cap {
            return;
        }
        let idx = self.index[fdu];
        if idx < 0 {
            return;
        }
        let idx = idx as usize;
        self.items[idx].fired = self.items[idx].fired & !interest;

        let item = self.items[idx];
        if idx < self.fill && !(item.waiting | ERROR_OR_HUP).intersects(item.fired) {
            self.demote(idx);
        }
    }

    fn wait(&mut self, events: &mut [Event], timeout_ms: i32) -> io::Result<usize> {
        if self.fill == 0 {
            let count = self.cap.min(self.raw_events.len());
            let ret = unsafe { libc::epoll_wait(self.epfd, self.raw_events.as_mut_ptr(), count as i32, timeout_ms) };
            if ret < 0 {
                let err = io::Error::last_os_error();
                if err.kind() == io::ErrorKind::Interrupted {
                    return Ok(0);
                }
                return Err(err);
            }

            for i in 0..ret as usize {
                let fd = self.raw_events[i].u64 as usize;
                let idx = self.index[fd];
                if idx < 0 {
                    continue;
                }
                let idx = idx as usize;
                self.items[idx].fired = self.items[idx].fired | epoll_to_interest(self.raw_events[i].events);

                let item = self.items[idx];
                if idx >= self.fill && (item.waiting | ERROR_OR_HUP).intersects(item.fired) {
                    self.promote(idx);
                }
            }
        }

        let count = events.len().min(self.fill);
        for i in 0..count {
            let item = self.items[i];
            events[i] = Event { events: (item.waiting | ERROR_OR_HUP) & item.fired, token: item.token };
        }
        Ok(count)
    }
}

impl Drop for EpollEtBackend {
    fn drop(&mut self) {
        unsafe {
            libc::close(self.epfd);
        }
    }
}
