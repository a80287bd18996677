//! Per-thread toggle for the blocking-syscall interception layer.
//!
//! The interception layer itself lives outside this crate; the runtime only
//! guarantees the toggle is enabled on every worker thread when its dispatch
//! loop starts, so hooked blocking calls made inside a fiber register an I/O
//! wait with the active reactor instead of blocking the OS thread.

use std::cell::Cell;

thread_local! {
    static HOOK_ENABLED: Cell<bool> = const { Cell::new(false) };
}

/// Whether blocking-call interception is enabled on the current thread.
pub fn is_enabled() -> bool {
    HOOK_ENABLED.with(|h| h.get())
}

/// Enable or disable blocking-call interception on the current thread.
pub fn set_enabled(enabled: bool) {
    HOOK_ENABLED.with(|h| h.set(enabled));
}
