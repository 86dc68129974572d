//! A uniform readiness-notification contract over five OS demultiplexers.
//!
//! Every backend normalizes to the same five operations — `associate`,
//! `dissociate`, `unset`, `wait`, and being dropped in place of an explicit
//! `free` — so [`crate::runtime::Runtime`] drives whichever one the target
//! OS gets by default (or whichever Cargo feature the embedder picked)
//! through one [`PollBackend`] implementation. The event-vs-pointer pairing
//! (`ef_event_t { events, ptr }` in the runtime this is modeled on) becomes
//! [`Event`] pairing [`Interest`] with an opaque `usize` token the caller
//! chose at `associate` time.

use std::io;
use std::os::unix::io::RawFd;

#[cfg(target_os = "linux")]
mod epoll_et;
#[cfg(target_os = "linux")]
mod epoll_lt;
#[cfg(any(target_os = "illumos", target_os = "solaris"))]
mod event_port;
#[cfg(any(target_os = "macos", target_os = "freebsd", target_os = "netbsd", target_os = "openbsd", target_os = "dragonfly"))]
mod kqueue_backend;
mod poll_classical;

#[cfg(target_os = "linux")]
pub use epoll_et::EpollEtBackend;
#[cfg(target_os = "linux")]
pub use epoll_lt::EpollLtBackend;
#[cfg(any(target_os = "illumos", target_os = "solaris"))]
pub use event_port::EventPortBackend;
#[cfg(any(target_os = "macos", target_os = "freebsd", target_os = "netbsd", target_os = "openbsd", target_os = "dragonfly"))]
pub use kqueue_backend::KqueueBackend;
pub use poll_classical::PollClassicalBackend;

/// Readiness bitmask, matching `EF_POLLIN`/`EF_POLLOUT`/`EF_POLLERR`/
/// `EF_POLLHUP` bit-for-bit so backends can pass OS event masks through with
/// plain bitwise operations instead of a translation table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Interest(pub u32);

impl Interest {
    pub const READABLE: Interest = Interest(0x001);
    pub const WRITABLE: Interest = Interest(0x004);
    pub const ERROR: Interest = Interest(0x008);
    pub const HUP: Interest = Interest(0x010);
    pub const NONE: Interest = Interest(0);

    pub fn contains(self, other: Interest) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn intersects(self, other: Interest) -> bool {
        self.0 & other.0 != 0
    }
}

impl std::ops::BitOr for Interest {
    type Output = Interest;
    fn bitor(self, rhs: Interest) -> Interest {
        Interest(self.0 | rhs.0)
    }
}

impl std::ops::BitAnd for Interest {
    type Output = Interest;
    fn bitand(self, rhs: Interest) -> Interest {
        Interest(self.0 & rhs.0)
    }
}

impl std::ops::Not for Interest {
    type Output = Interest;
    fn not(self) -> Interest {
        Interest(!self.0)
    }
}

/// One readiness notification: what fired, and the token the caller supplied
/// when associating the fd (typically a pointer to the waiting coroutine's
/// queue-fd record, carried as a `usize`).
#[derive(Debug, Clone, Copy, Default)]
pub struct Event {
    pub events: Interest,
    pub token: usize,
}

/// The capability contract every backend implements. `fired` on
/// `associate`/`dissociate` tells the backend whether the caller believes
/// the fd has already delivered an event this round — edge-triggered epoll
/// and Solaris event ports use it to skip a redundant re-arm or to skip an
/// auto-dissociated fd respectively; level-triggered backends ignore it.
pub trait PollBackend: Sized {
    /// Create a backend with room for at least `capacity` events per
    /// `wait` call (every backend enforces a 128-event floor regardless).
    fn new(capacity: usize) -> io::Result<Self>;

    /// Start (or update) watching `fd` for `interest`, tagged with `token`.
    /// Returns `Ok(true)` if the backend already knows the fd is ready for
    /// (part of) that interest — only the edge-triggered epoll backend ever
    /// does, since it tracks readiness across re-associations instead of
    /// re-arming a fresh edge each time.
    fn associate(&mut self, fd: RawFd, interest: Interest, token: usize, fired: bool) -> io::Result<bool>;

    /// Stop watching `fd` entirely. `onclose` signals the fd is being closed
    /// right after (matters to the edge-triggered backend's bookkeeping,
    /// which can skip re-arming index slots it's about to discard anyway).
    fn dissociate(&mut self, fd: RawFd, fired: bool, onclose: bool) -> io::Result<()>;

    /// Clear `interest` bits from whatever `fd` is currently waiting on
    /// without fully dissociating it. A no-op for backends that re-arm from
    /// scratch on every `associate` (poll, level-triggered epoll, kqueue,
    /// event ports); meaningful only for edge-triggered epoll's
    /// already-fired bookkeeping.
    fn unset(&mut self, fd: RawFd, interest: Interest);

    /// Block for at most `timeout_ms` (negative means "forever") and fill
    /// `events` with whatever fired, returning how many slots were filled.
    fn wait(&mut self, events: &mut [Event], timeout_ms: i32) -> io::Result<usize>;
}

/// Minimum event-buffer capacity every backend enforces, matching the
/// runtime this is modeled on hard-coding a 128-event floor regardless of
/// the caller's requested capacity.
pub(crate) const MIN_CAPACITY: usize = 128;

pub(crate) fn normalize_capacity(requested: usize) -> usize {
    requested.max(MIN_CAPACITY)
}

// Backend selection happens at compile time: an explicit feature overrides
// the default, and at most one explicit feature may be set. With none set,
// the conventional backend for `target_os` is picked automatically.

#[cfg(any(
    all(feature = "poll-classical", feature = "epoll-level-triggered"),
    all(feature = "poll-classical", feature = "epoll-edge-triggered"),
    all(feature = "poll-classical", feature = "kqueue"),
    all(feature = "poll-classical", feature = "event-port"),
    all(feature = "epoll-level-triggered", feature = "epoll-edge-triggered"),
    all(feature = "epoll-level-triggered", feature = "kqueue"),
    all(feature = "epoll-level-triggered", feature = "event-port"),
    all(feature = "epoll-edge-triggered", feature = "kqueue"),
    all(feature = "epoll-edge-triggered", feature = "event-port"),
    all(feature = "kqueue", feature = "event-port"),
))]
compile_error!("at most one poll backend feature may be enabled");

#[cfg(all(feature = "epoll-level-triggered", not(target_os = "linux")))]
compile_error!("epoll-level-triggered requires target_os = \"linux\"");

#[cfg(all(feature = "epoll-edge-triggered", not(target_os = "linux")))]
compile_error!("epoll-edge-triggered requires target_os = \"linux\"");

#[cfg(all(feature = "kqueue", not(any(target_os = "macos", target_os = "freebsd", target_os = "netbsd", target_os = "openbsd", target_os = "dragonfly"))))]
compile_error!("kqueue requires a BSD-family target_os");

#[cfg(all(feature = "event-port", not(any(target_os = "illumos", target_os = "solaris"))))]
compile_error!("event-port requires target_os = \"illumos\" or \"solaris\"");

#[cfg(feature = "epoll-level-triggered")]
pub type DefaultBackend = EpollLtBackend;

#[cfg(feature = "epoll-edge-triggered")]
pub type DefaultBackend = EpollEtBackend;

#[cfg(feature = "kqueue")]
pub type DefaultBackend = KqueueBackend;

#[cfg(feature = "event-port")]
pub type DefaultBackend = EventPortBackend;

#[cfg(feature = "poll-classical")]
pub type DefaultBackend = PollClassicalBackend;

#[cfg(not(any(feature = "epoll-level-triggered", feature = "epoll-edge-triggered", feature = "kqueue", feature = "event-port", feature = "poll-classical")))]
mod auto {
    #[cfg(target_os = "linux")]
    pub type DefaultBackend = super::EpollLtBackend;

    #[cfg(any(target_os = "macos", target_os = "freebsd", target_os = "netbsd", target_os = "openbsd", target_os = "dragonfly"))]
    pub type DefaultBackend = super::KqueueBackend;

    #[cfg(any(target_os = "illumos", target_os = "solaris"))]
    pub type DefaultBackend = super::EventPortBackend;

    #[cfg(not(any(
        target_os = "linux",
        target_os = "macos",
        target_os = "freebsd",
        target_os = "netbsd",
        target_os = "openbsd",
        target_os = "dragonfly",
        target_os = "illumos",
        target_os = "solaris",
    )))]
    pub type DefaultBackend = super::PollClassicalBackend;
}

#[cfg(not(any(feature = "epoll-level-triggered", feature = "epoll-edge-triggered", feature = "kqueue", feature = "event-port", feature = "poll-classical")))]
pub use auto::DefaultBackend;

/// A thin, backend-generic handle, matching the runtime's own `ef_poll_t`
/// being nothing more than a pointer to whichever backend's vtable it was
/// built with. [`crate::runtime::Runtime`] holds one of these over
/// [`DefaultBackend`] and never touches an individual backend type directly.
pub struct Poll<B: PollBackend = DefaultBackend> {
    backend: B,
}

impl<B: PollBackend> Poll<B> {
    pub fn new(capacity: usize) -> io::Result<Self> {
        Ok(Poll { backend: B::new(capacity)? })
    }

    pub fn associate(&mut self, fd: RawFd, interest: Interest, token: usize, fired: bool) -> io::Result<bool> {
        self.backend.associate(fd, interest, token, fired)
    }

    pub fn dissociate(&mut self, fd: RawFd, fired: bool, onclose: bool) -> io::Result<()> {
        self.backend.dissociate(fd, fired, onclose)
    }

    pub fn unset(&mut self, fd: RawFd, interest: Interest) {
        self.backend.unset(fd, interest)
    }

    pub fn wait(&mut self, events: &mut [Event], timeout_ms: i32) -> io::Result<usize> {
        self.backend.wait(events, timeout_ms)
    }
}
