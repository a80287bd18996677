//! Stackful fibers.
//!
//! A [`Fiber`] owns a private stack and a saved execution context, and runs a
//! user closure to completion across any number of suspensions. Each thread
//! lazily manufactures a stackless *thread fiber* representing its original
//! stack, so "which fiber am I" is always answerable via [`Fiber::current`].
//!
//! Two switch pairs exist. `call`/`back` move between the native thread and a
//! fiber that was created with `back_to_caller` set (the scheduler uses this
//! for the caller thread's root fiber). `swap_in`/`swap_out` move between the
//! thread's dispatch fiber and an ordinary task fiber. The dispatch fiber is
//! installed per thread by the scheduler before it starts running tasks.

mod context;
mod stack;

pub use stack::DEFAULT_STACK_SIZE;

use std::cell::{RefCell, UnsafeCell};
use std::ffi::c_void;
use std::panic::{self, AssertUnwindSafe};
use std::process;
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use context::Context;
use stack::FiberStack;

static NEXT_ID: AtomicU64 = AtomicU64::new(1);
static FIBER_COUNT: AtomicU64 = AtomicU64::new(0);

/// Sentinel for `Fiber::requested`: no yield pending.
const NO_REQUEST: u8 = u8::MAX;

thread_local! {
    /// The fiber currently executing on this thread.
    static CURRENT: RefCell<Option<Arc<Fiber>>> = const { RefCell::new(None) };
    /// The stackless fiber standing in for the thread's own stack.
    static THREAD_FIBER: RefCell<Option<Arc<Fiber>>> = const { RefCell::new(None) };
    /// The fiber task fibers swap out to, installed by the scheduler.
    static DISPATCH: RefCell<Option<Arc<Fiber>>> = const { RefCell::new(None) };
}

/// Lifecycle of a fiber.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FiberState {
    /// Created or reset, never yet resumed.
    Init,
    /// Suspended without asking to be rescheduled.
    Hold,
    /// Currently executing on some thread.
    Exec,
    /// Suspended and ready to run again.
    Ready,
    /// Closure returned normally.
    Term,
    /// Closure panicked; the panic was contained to this fiber.
    Except,
}

impl FiberState {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => FiberState::Init,
            1 => FiberState::Hold,
            2 => FiberState::Exec,
            3 => FiberState::Ready,
            4 => FiberState::Term,
            5 => FiberState::Except,
            _ => unreachable!("invalid fiber state {v}"),
        }
    }
}

type EntryFn = Box<dyn FnOnce() + Send>;

/// A stackful coroutine.
///
/// Fibers are always handled through `Arc`; the scheduler, the reactor and
/// the per-thread slots all hold clones of the same allocation.
pub struct Fiber {
    id: u64,
    state: AtomicU8,
    /// Yield state requested by a suspending fiber, published by the
    /// resuming side once the switch has returned. A yielding fiber stays
    /// `Exec` until its context is durably saved, so a waiter that enqueues
    /// it early is skipped by the dispatch scan instead of racing the save.
    requested: AtomicU8,
    stack: Option<FiberStack>,
    ctx: UnsafeCell<Context>,
    entry: Mutex<Option<EntryFn>>,
    /// Yielding returns to the native thread rather than the dispatch fiber.
    back_to_caller: bool,
}

// A fiber executes on at most one thread at a time; the scheduler skips
// fibers in the Exec state, so `ctx` is never touched concurrently.
unsafe impl Send for Fiber {}
unsafe impl Sync for Fiber {}

impl Fiber {
    /// Create a fiber running `f` on a default-sized stack.
    pub fn new<F>(f: F) -> Arc<Fiber>
    where
        F: FnOnce() + Send + 'static,
    {
        Self::build(Box::new(f), DEFAULT_STACK_SIZE, false)
    }

    /// Create a fiber running `f` on a stack of `stack_size` bytes.
    pub fn with_stack_size<F>(f: F, stack_size: usize) -> Arc<Fiber>
    where
        F: FnOnce() + Send + 'static,
    {
        Self::build(Box::new(f), stack_size, false)
    }

    /// Create a fiber whose yields return to the native thread instead of
    /// the dispatch fiber. The scheduler's caller-mode root fiber is one.
    pub(crate) fn root<F>(f: F) -> Arc<Fiber>
    where
        F: FnOnce() + Send + 'static,
    {
        Self::build(Box::new(f), DEFAULT_STACK_SIZE, true)
    }

    fn build(entry: EntryFn, stack_size: usize, back_to_caller: bool) -> Arc<Fiber> {
        let fiber = Arc::new(Fiber {
            id: NEXT_ID.fetch_add(1, Ordering::Relaxed),
            state: AtomicU8::new(FiberState::Init as u8),
            requested: AtomicU8::new(NO_REQUEST),
            stack: Some(FiberStack::new(stack_size)),
            ctx: UnsafeCell::new(Context::null()),
            entry: Mutex::new(Some(entry)),
            back_to_caller,
        });
        FIBER_COUNT.fetch_add(1, Ordering::Relaxed);
        let arg = Arc::as_ptr(&fiber) as *mut c_void;
        if let Some(stack) = fiber.stack.as_ref() {
            unsafe { *fiber.ctx.get() = context::prepare(stack, arg) };
            log::trace!("fiber {} created, {} byte stack", fiber.id, stack.size());
        }
        fiber
    }

    /// The fiber executing on this thread, manufacturing the thread fiber on
    /// first use.
    pub fn current() -> Arc<Fiber> {
        if let Some(f) = CURRENT.with(|c| c.borrow().clone()) {
            return f;
        }
        let f = thread_fiber();
        set_current(&f);
        f
    }

    /// Unique id of this fiber.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Current lifecycle state.
    pub fn state(&self) -> FiberState {
        FiberState::from_u8(self.state.load(Ordering::SeqCst))
    }

    /// Number of live fibers, thread fibers included.
    pub fn total() -> u64 {
        FIBER_COUNT.load(Ordering::Relaxed)
    }

    fn set_state(&self, state: FiberState) {
        self.state.store(state as u8, Ordering::SeqCst);
    }

    /// Rearm a finished fiber with a new closure, reusing its stack.
    ///
    /// Panics if the fiber has no stack or is still runnable.
    pub fn reset<F>(&self, f: F)
    where
        F: FnOnce() + Send + 'static,
    {
        let Some(stack) = self.stack.as_ref() else {
            panic!("cannot reset fiber {} without a stack", self.id);
        };
        let state = self.state();
        assert!(
            matches!(
                state,
                FiberState::Init | FiberState::Term | FiberState::Except
            ),
            "cannot reset fiber {} in state {:?}",
            self.id,
            state
        );
        *self.entry.lock() = Some(Box::new(f));
        let arg = self as *const Fiber as *mut c_void;
        unsafe { *self.ctx.get() = context::prepare(stack, arg) };
        self.set_state(FiberState::Init);
    }

    /// Resume this fiber from the native thread. Only meaningful for fibers
    /// created with [`Fiber::root`]; control returns here when the fiber
    /// yields or finishes.
    pub(crate) fn call(self: &Arc<Fiber>) {
        let thread = thread_fiber();
        debug_assert!(self.back_to_caller);
        self.assert_runnable();
        self.set_state(FiberState::Exec);
        set_current(self);
        unsafe { context::switch(thread.ctx.get(), self.ctx.get()) };
        self.publish_requested_yield();
    }

    /// Resume this fiber from the thread's dispatch fiber.
    pub(crate) fn swap_in(self: &Arc<Fiber>) {
        let Some(dispatch) = current_dispatch() else {
            panic!("fiber {} resumed outside a scheduler thread", self.id);
        };
        self.assert_runnable();
        self.set_state(FiberState::Exec);
        set_current(self);
        unsafe { context::switch(dispatch.ctx.get(), self.ctx.get()) };
        self.publish_requested_yield();
    }

    /// Record the state a yield should land in. The fiber keeps running as
    /// `Exec`; the state becomes visible via [`Fiber::publish_requested_yield`]
    /// on the resuming side.
    fn request_yield(&self, state: FiberState) {
        debug_assert!(matches!(state, FiberState::Ready | FiberState::Hold));
        self.requested.store(state as u8, Ordering::SeqCst);
    }

    /// Apply a pending yield request. Runs on the resuming side after the
    /// switch has returned, so the saved context is complete before the
    /// fiber ever looks runnable to another worker.
    fn publish_requested_yield(&self) {
        let requested = self.requested.swap(NO_REQUEST, Ordering::SeqCst);
        if requested != NO_REQUEST {
            self.state.store(requested, Ordering::SeqCst);
        }
    }

    fn assert_runnable(&self) {
        let state = self.state();
        assert!(
            matches!(
                state,
                FiberState::Init | FiberState::Ready | FiberState::Hold
            ),
            "fiber {} is not runnable in state {:?}",
            self.id,
            state
        );
    }

    /// Suspend back to the native thread (`call` counterpart).
    fn back(&self) {
        let thread = thread_fiber();
        set_current(&thread);
        unsafe { context::switch(self.ctx.get(), thread.ctx.get()) };
    }

    /// Suspend back to the dispatch fiber (`swap_in` counterpart).
    fn swap_out(&self) {
        let Some(dispatch) = current_dispatch() else {
            panic!("fiber {} yielded outside a scheduler thread", self.id);
        };
        set_current(&dispatch);
        unsafe { context::switch(self.ctx.get(), dispatch.ctx.get()) };
    }

    fn switch_out(&self) {
        if self.back_to_caller {
            self.back();
        } else {
            self.swap_out();
        }
    }
}

impl Drop for Fiber {
    fn drop(&mut self) {
        FIBER_COUNT.fetch_sub(1, Ordering::Relaxed);
        if self.stack.is_some() {
            let state = self.state();
            assert!(
                matches!(
                    state,
                    FiberState::Init | FiberState::Term | FiberState::Except
                ),
                "fiber {} dropped while suspended in state {:?}",
                self.id,
                state
            );
        }
    }
}

impl std::fmt::Debug for Fiber {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Fiber")
            .field("id", &self.id)
            .field("state", &self.state())
            .finish()
    }
}

/// Id of the fiber running on this thread, or 0 if none has run yet.
pub fn current_id() -> u64 {
    CURRENT.with(|c| c.borrow().as_ref().map_or(0, |f| f.id))
}

/// Suspend the current fiber and mark it ready to run again.
pub fn yield_ready() {
    let cur = Fiber::current();
    assert!(cur.stack.is_some(), "cannot yield from a thread fiber");
    cur.request_yield(FiberState::Ready);
    cur.switch_out();
}

/// Suspend the current fiber without rescheduling it. Someone else must
/// hand it back to a scheduler for it to run again.
pub fn yield_hold() {
    let cur = Fiber::current();
    assert!(cur.stack.is_some(), "cannot yield from a thread fiber");
    cur.request_yield(FiberState::Hold);
    cur.switch_out();
}

/// Install the dispatch fiber for this thread. Worker threads use their
/// thread fiber; the caller thread uses the scheduler's root fiber.
pub(crate) fn set_dispatch(fiber: &Arc<Fiber>) {
    DISPATCH.with(|d| *d.borrow_mut() = Some(fiber.clone()));
}

fn current_dispatch() -> Option<Arc<Fiber>> {
    DISPATCH.with(|d| d.borrow().clone())
}

fn set_current(fiber: &Arc<Fiber>) {
    CURRENT.with(|c| *c.borrow_mut() = Some(fiber.clone()));
}

fn thread_fiber() -> Arc<Fiber> {
    THREAD_FIBER.with(|slot| {
        let mut slot = slot.borrow_mut();
        match &*slot {
            Some(f) => f.clone(),
            None => {
                let f = Arc::new(Fiber {
                    id: NEXT_ID.fetch_add(1, Ordering::Relaxed),
                    state: AtomicU8::new(FiberState::Exec as u8),
                    requested: AtomicU8::new(NO_REQUEST),
                    stack: None,
                    ctx: UnsafeCell::new(Context::null()),
                    entry: Mutex::new(None),
                    back_to_caller: false,
                });
                FIBER_COUNT.fetch_add(1, Ordering::Relaxed);
                *slot = Some(f.clone());
                f
            }
        }
    })
}

/// Entry point every fresh fiber resumes into, reached via the assembly
/// trampoline with the fiber pointer as its argument.
#[no_mangle]
extern "C" fn weft_fiber_main(ptr: *mut c_void) {
    // The resuming side holds an Arc for the whole time the fiber runs, so
    // the reference stays valid across every suspension.
    let fiber = unsafe { &*(ptr as *const Fiber) };
    let entry = fiber.entry.lock().take();
    let result = panic::catch_unwind(AssertUnwindSafe(move || {
        if let Some(entry) = entry {
            entry();
        }
    }));
    match result {
        Ok(()) => fiber.set_state(FiberState::Term),
        Err(_) => {
            fiber.set_state(FiberState::Except);
            log::error!("fiber {} terminated by panic", fiber.id);
        }
    }
    fiber.switch_out();
    // A finished fiber must never be resumed again.
    process::abort();
}
