//! `kqueue`, the BSD/macOS backend.
//!
//! Grounded on the runtime's `kqueue.c`: one `read`/`write` filter pair
//! registered per fd, tracked per-fd so `dissociate` only issues
//! `EV_DELETE` for filters that are actually armed.

use std::io;
use std::os::unix::io::RawFd;

use super::{normalize_capacity, Event, Interest, PollBackend};

#[derive(Clone, Copy, Default)]
struct Item {
    read: bool,
    write: bool,
}

pub struct KqueueBackend {
    kqfd: RawFd,
    cap: usize,
    items: Vec<Item>,
    raw_events: Vec<libc::kevent>,
}

impl KqueueBackend {
    fn expand(&mut self, fd: RawFd) {
        let fdu = fd as usize;
        if self.cap > fdu {
            return;
        }
        let mut cap = self.cap.max(1);
        while cap <= fdu {
            cap <<= 1;
        }
        self.items.resize(cap, Item::default());
        self.cap = cap;
    }
}

impl PollBackend for KqueueBackend {
    fn new(capacity: usize) -> io::Result<Self> {
        let cap = normalize_capacity(capacity);
        let kqfd = unsafe { libc::kqueue() };
        if kqfd < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(KqueueBackend { kqfd, cap, items: vec![Item::default(); cap], raw_events: vec![unsafe { std::mem::zeroed() }; cap] })
    }

    fn associate(&mut self, fd: RawFd, interest: Interest, token: usize, fired: bool) -> io::Result<bool> {
        if fired {
            return Ok(false);
        }
        self.expand(fd);

        let mut changes: Vec<libc::kevent> = Vec::with_capacity(2);
        let mut item = self.items[fd as usize];

        if interest.contains(Interest::READABLE) {
            changes.push(libc::kevent {
                ident: fd as usize,
                filter: libc::EVFILT_READ,
                flags: libc::EV_ADD,
                fflags: 0,
                data: 0,
                udata: token as *mut libc::c_void,
            });
            item.read = true;
        }
        if interest.contains(Interest::WRITABLE) {
            changes.push(libc::kevent {
                ident: fd as usize,
                filter: libc::EVFILT_WRITE,
                flags: libc::EV_ADD,
                fflags: 0,
                data: 0,
                udata: token as *mut libc::c_void,
            });
            item.write = true;
        }

        if !changes.is_empty()
            && unsafe { libc::kevent(self.kqfd, changes.as_ptr(), changes.len() as i32, std::ptr::null_mut(), 0, std::ptr::null()) } < 0
        {
            return Err(io::Error::last_os_error());
        }

        self.items[fd as usize] = item;
        Ok(false)
    }

    fn dissociate(&mut self, fd: RawFd, _fired: bool, onclose: bool) -> io::Result<()> {
        let fdu = fd as usize;
        if fdu >= self.cap {
            return Ok(());
        }

        if onclose {
            self.items[fdu] = Item::default();
            return Ok(());
        }

        let item = self.items[fdu];
        let mut changes: Vec<libc::kevent> = Vec::with_capacity(2);
        if item.read {
            changes.push(libc::kevent { ident: fd as usize, filter: libc::EVFILT_READ, flags: libc::EV_DELETE, fflags: 0, data: 0, udata: std::ptr::null_mut() });
        }
        if item.write {
            changes.push(libc::kevent { ident: fd as usize, filter: libc::EVFILT_WRITE, flags: libc::EV_DELETE, fflags: 0, data: 0, udata: std::ptr::null_mut() });
        }

        if !changes.is_empty()
            && unsafe { libc::kevent(self.kqfd, changes.as_ptr(), changes.len() as i32, std::ptr::null_mut(), 0, std::ptr::null()) } < 0
        {
            return Err(io::Error::last_os_error());
        }

        self.items[fdu] = Item::default();
        Ok(())
    }

    fn unset(&mut self, _fd: RawFd, _interest: Interest) {}

    fn wait(&mut self, events: &mut [Event], timeout_ms: i32) -> io::Result<usize> {
        let timeout = libc::timespec {
            tv_sec: (timeout_ms / 1000) as libc::time_t,
            tv_nsec: ((timeout_ms % 1000) * 1_000_000) as libc::c_long,
        };
        let count = events.len().min(self.raw_events.len());

        let ret = unsafe {
            libc::kevent(
                self.kqfd,
                std::ptr::null(),
                0,
                self.raw_events.as_mut_ptr(),
                count as i32,
                if timeout_ms < 0 { std::ptr::null() } else { &timeout },
            )
        };
        if ret < 0 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::Interrupted {
                return Ok(0);
            }
            return Err(err);
        }

        for i in 0..ret as usize {
            let e = &self.raw_events[i];
            let mut interest = match e.filter {
                libc::EVFILT_READ => Interest::READABLE,
                libc::EVFILT_WRITE => Interest::WRITABLE,
                _ => Interest::NONE,
            };
            if e.flags & libc::EV_ERROR != 0 {
                interest = interest | Interest::ERROR;
            }
            if e.flags & libc::EV_EOF != 0 {
                interest = interest | Interest::HUP;
            }
            events[i] = Event { events: interest, token: e.udata as usize };
        }
        Ok(ret as usize)
    }
}

impl Drop for KqueueBackend {
    fn drop(&mut self) {
        unsafe {
            libc::close(self.kqfd);
        }
    }
}
