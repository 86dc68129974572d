//! A single-threaded, stackful-coroutine runtime for POSIX network servers.
//!
//! Each accepted connection gets its own [`Fiber`](fiber::Fiber) with a
//! lazily committed, guard-paged stack; handler code calls the blocking-
//! looking functions in [`io`] and the scheduler quietly yields back to one
//! event loop ([`Runtime::run_loop`]) whenever they'd otherwise block.
//! There is exactly one OS thread, no preemption, and no work-stealing —
//! see the module docs on [`runtime`] and [`poll`] for how the pieces fit
//! together.

pub mod config;
pub mod error;
pub mod fiber;
pub mod io;
pub mod list;
pub mod pool;
pub mod poll;
pub mod runtime;

pub use config::{RuntimeConfig, RuntimeConfigBuilder};
pub use error::{FiberError, RuntimeError};
pub use poll::{DefaultBackend, Event, Interest, Poll, PollBackend};
pub use runtime::{Listener, Routine, Runtime};
