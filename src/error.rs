//! Error types for construction-time and loop-level failures.
//!
//! Synchronous I/O primitives (`read`/`write`/`recv`/`send`/`connect`/
//! `close`) intentionally do not go through this enum — they keep POSIX
//! value-and-errno semantics via `std::io::Result`, so a caller used to
//! checking `errno` can check `io::Error::raw_os_error()` instead.

use thiserror::Error;

/// Failures from constructing or driving a [`crate::runtime::Runtime`].
#[derive(Debug, Error)]
pub enum RuntimeError {
    #[error("failed to create the readiness demultiplexer")]
    PollCreate,

    #[error("poll wait failed: {0}")]
    PollWait(#[source] std::io::Error),

    #[error("failed to initialize the fiber scheduler (sigaltstack/sigaction)")]
    SchedInit(#[source] std::io::Error),

    #[error("failed to reserve fiber stack memory")]
    StackMap(#[source] std::io::Error),

    #[error("failed to commit fiber stack memory")]
    StackProtect(#[source] std::io::Error),

    #[error("failed to prepare listening socket {fd}")]
    ListenSetup { fd: std::os::unix::io::RawFd, #[source] source: std::io::Error },

    #[error("the coroutine pool is at capacity")]
    PoolExhausted,
}

/// Fiber-level resume failures, mirroring `ERROR_FIBER_EXITED` /
/// `ERROR_FIBER_NOT_INITED` in the original runtime's `fiber.h`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum FiberError {
    #[error("fiber has already exited")]
    Exited,
    #[error("fiber was never initialized")]
    NotInited,
}
