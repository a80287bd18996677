//! Owned stack buffers for fibers.

use std::alloc::{alloc, dealloc, Layout};
use std::ptr::NonNull;

/// Default stack size for a fiber: 128 KiB.
pub const DEFAULT_STACK_SIZE: usize = 128 * 1024;

/// Stacks are 16-byte aligned; both SysV x86_64 and AAPCS64 require it.
const STACK_ALIGN: usize = 16;

/// A heap-allocated stack buffer owned by a fiber.
///
/// The buffer is never read or written by the runtime itself; the context
/// switch installs its top as the stack pointer of a fresh fiber.
pub(crate) struct FiberStack {
    base: NonNull<u8>,
    size: usize,
}

impl FiberStack {
    /// Allocate a stack of `size` bytes (rounded up to the alignment).
    pub(crate) fn new(size: usize) -> Self {
        let size = size.max(STACK_ALIGN).next_multiple_of(STACK_ALIGN);
        let layout = Layout::from_size_align(size, STACK_ALIGN).expect("stack layout");
        let ptr = unsafe { alloc(layout) };
        let base = NonNull::new(ptr).unwrap_or_else(|| std::alloc::handle_alloc_error(layout));
        Self { base, size }
    }

    /// Highest address of the buffer; stacks grow downward from here.
    pub(crate) fn top(&self) -> *mut u8 {
        unsafe { self.base.as_ptr().add(self.size) }
    }

    /// Size of the buffer in bytes.
    pub(crate) fn size(&self) -> usize {
        self.size
    }
}

impl Drop for FiberStack {
    fn drop(&mut self) {
        let layout = Layout::from_size_align(self.size, STACK_ALIGN).expect("stack layout");
        unsafe { dealloc(self.base.as_ptr(), layout) };
    }
}

// The buffer is exclusively owned by one fiber, which runs on at most one
// thread at a time.
unsafe impl Send for FiberStack {}
unsafe impl Sync for FiberStack {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stack_alignment_and_size() {
        let stack = FiberStack::new(DEFAULT_STACK_SIZE);
        assert_eq!(stack.size(), DEFAULT_STACK_SIZE);
        assert_eq!(stack.top() as usize % STACK_ALIGN, 0);
    }

    #[test]
    fn test_tiny_request_rounds_up() {
        let stack = FiberStack::new(1);
        assert!(stack.size() >= STACK_ALIGN);
    }
}
