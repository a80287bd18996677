//! Runtime error types

use std::io;
use std::os::unix::io::RawFd;
use thiserror::Error;

/// Errors surfaced by the runtime for OS-call failures.
///
/// Programming-contract violations (double event registration, scheduling
/// after shutdown, stopping off the owner thread) are asserts, not errors:
/// they signal misuse of the API rather than a recoverable condition.
#[derive(Debug, Error)]
pub enum Error {
    /// Creating the epoll instance failed.
    #[error("epoll_create1 failed: {0}")]
    EpollCreate(#[source] io::Error),

    /// Registering, modifying, or removing a descriptor failed.
    #[error("epoll_ctl {op} for fd {fd} failed: {source}")]
    EpollCtl {
        /// Which control operation was attempted (add/mod/del).
        op: &'static str,
        /// The descriptor the operation targeted.
        fd: RawFd,
        /// The underlying OS error.
        #[source]
        source: io::Error,
    },

    /// Creating the cross-thread wakeup pipe failed.
    #[error("wake pipe setup failed: {0}")]
    WakePipe(#[source] io::Error),

    /// Spawning a worker thread failed.
    #[error("spawning worker thread failed: {0}")]
    ThreadSpawn(#[source] io::Error),
}

/// Result alias for runtime operations.
pub type Result<T> = std::result::Result<T, Error>;
