//! Weft Coroutine Runtime
//!
//! A stackful coroutine runtime built from four layers:
//! - **Fibers**: coroutines with their own stacks and explicit yields
//!   (`fiber` module)
//! - **Scheduler**: an N:M dispatcher running fibers and callbacks across a
//!   worker-thread pool (`scheduler` module)
//! - **Timers**: wall-clock one-shot and recurring timers (`timer` module)
//! - **Reactor**: epoll-backed fd readiness wired into the scheduler's idle
//!   time (`reactor` module)
//!
//! # Example
//!
//! ```rust,ignore
//! use weft::{IoManager, IoEvent};
//!
//! let io = IoManager::new(4, false, "io")?;
//!
//! // Plain work.
//! io.schedule(|| println!("on a worker"));
//!
//! // Fiber parked until the fd is readable.
//! io.schedule(move || {
//!     io.wait_event(fd, IoEvent::Read)?;
//!     // ... read without having blocked a thread ...
//! });
//!
//! // Timed work.
//! io.add_timer(500, || println!("half a second later"), false);
//!
//! io.stop();
//! ```

#![warn(missing_docs)]
#![warn(rust_2018_idioms)]

pub mod error;
pub mod fiber;
pub mod hook;
#[cfg(target_os = "linux")]
pub mod reactor;
pub mod scheduler;
pub mod timer;

pub use error::{Error, Result};
pub use fiber::{current_id, yield_hold, yield_ready, Fiber, FiberState, DEFAULT_STACK_SIZE};
#[cfg(target_os = "linux")]
pub use reactor::{IoEvent, IoManager};
pub use scheduler::{Scheduler, SchedulerHooks, SchedulerState};
pub use timer::{Timer, TimerCallback, TimerManager};
