//! Epoll-driven I/O reactor.
//!
//! [`IoManager`] is a [`Scheduler`] whose idle fibers park in `epoll_wait`
//! instead of spinning. File descriptors are registered edge-triggered with
//! a waiter per direction, either a callback or a suspended fiber, and every
//! registration fires exactly once: when the readiness arrives, when it is
//! cancelled, or when the fd reports an error or hangup. A self-pipe lets
//! any thread pull a parked worker out of `epoll_wait`, and a
//! [`TimerManager`] supplies the wait timeout.
//!
//! Shutdown waits for the runtime to drain: `stop` returns only once no
//! events are pending and no timers remain, so recurring timers must be
//! cancelled first.

use std::io;
use std::os::fd::RawFd;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::{Mutex, RwLock};

use crate::error::{Error, Result};
use crate::fiber::{self, Fiber, FiberState};
use crate::scheduler::{self, Scheduler, SchedulerHooks, SchedulerState};
use crate::timer::{Timer, TimerManager};

const MAX_EVENTS: usize = 256;
const MAX_TIMEOUT_MS: u64 = 3000;
/// epoll user token of the wake pipe; real tokens are fds.
const WAKE_TOKEN: u64 = u64::MAX;

const READ_MASK: u32 = libc::EPOLLIN as u32;
const WRITE_MASK: u32 = libc::EPOLLOUT as u32;
const ET: u32 = libc::EPOLLET as u32;

/// One direction of fd readiness.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IoEvent {
    /// The fd can be read without blocking.
    Read,
    /// The fd can be written without blocking.
    Write,
}

impl IoEvent {
    fn mask(self) -> u32 {
        match self {
            IoEvent::Read => READ_MASK,
            IoEvent::Write => WRITE_MASK,
        }
    }
}

/// Whoever is waiting on one direction of an fd.
#[derive(Default)]
struct EventWaiter {
    /// Scheduler the waiter is resumed on; captured at registration.
    scheduler: Weak<SchedulerState>,
    fiber: Option<Arc<Fiber>>,
    cb: Option<Box<dyn FnOnce() + Send>>,
}

#[derive(Default)]
struct FdInner {
    /// Readiness bits currently registered with epoll.
    events: u32,
    read: EventWaiter,
    write: EventWaiter,
}

impl FdInner {
    fn waiter_mut(&mut self, event: IoEvent) -> &mut EventWaiter {
        match event {
            IoEvent::Read => &mut self.read,
            IoEvent::Write => &mut self.write,
        }
    }
}

struct FdContext {
    fd: RawFd,
    inner: Mutex<FdInner>,
}

struct ReactorCore {
    epfd: RawFd,
    wake_read: RawFd,
    wake_write: RawFd,
    /// Registered waiters not yet fired or cancelled.
    pending: AtomicUsize,
    /// Indexed by fd; grows on demand.
    contexts: RwLock<Vec<Arc<FdContext>>>,
    timers: TimerManager,
    sched: Weak<SchedulerState>,
}

fn op_name(op: libc::c_int) -> &'static str {
    match op {
        libc::EPOLL_CTL_ADD => "add",
        libc::EPOLL_CTL_MOD => "mod",
        libc::EPOLL_CTL_DEL => "del",
        _ => "?",
    }
}

impl ReactorCore {
    fn new(state: &Arc<SchedulerState>) -> Result<Arc<ReactorCore>> {
        let epfd = unsafe { libc::epoll_create1(libc::EPOLL_CLOEXEC) };
        if epfd < 0 {
            return Err(Error::EpollCreate(io::Error::last_os_error()));
        }
        let mut fds: [RawFd; 2] = [0; 2];
        let rc = unsafe { libc::pipe2(fds.as_mut_ptr(), libc::O_NONBLOCK | libc::O_CLOEXEC) };
        if rc != 0 {
            let err = io::Error::last_os_error();
            unsafe { libc::close(epfd) };
            return Err(Error::WakePipe(err));
        }
        let core = Arc::new(ReactorCore {
            epfd,
            wake_read: fds[0],
            wake_write: fds[1],
            pending: AtomicUsize::new(0),
            contexts: RwLock::new(Vec::new()),
            timers: TimerManager::new(),
            sched: Arc::downgrade(state),
        });
        core.epoll_ctl(libc::EPOLL_CTL_ADD, core.wake_read, ET | READ_MASK, WAKE_TOKEN)?;
        Ok(core)
    }

    fn epoll_ctl(&self, op: libc::c_int, fd: RawFd, events: u32, token: u64) -> Result<()> {
        let mut ev = libc::epoll_event { events, u64: token };
        let rc = unsafe { libc::epoll_ctl(self.epfd, op, fd, &mut ev) };
        if rc != 0 {
            return Err(Error::EpollCtl {
                op: op_name(op),
                fd,
                source: io::Error::last_os_error(),
            });
        }
        Ok(())
    }

    /// Context for `fd`, growing the table if this fd is the largest so far.
    fn context_for(&self, fd: RawFd) -> Arc<FdContext> {
        let idx = fd as usize;
        {
            let table = self.contexts.read();
            if let Some(ctx) = table.get(idx) {
                return ctx.clone();
            }
        }
        let mut table = self.contexts.write();
        if table.len() <= idx {
            let target = (idx + 1).max(32).max(table.len() * 3 / 2);
            while table.len() < target {
                let fd = table.len() as RawFd;
                table.push(Arc::new(FdContext {
                    fd,
                    inner: Mutex::new(FdInner::default()),
                }));
            }
        }
        table[idx].clone()
    }

    fn lookup(&self, fd: RawFd) -> Option<Arc<FdContext>> {
        self.contexts.read().get(fd as usize).cloned()
    }

    /// Register a waiter for one direction of `fd`. `cb` of `None` parks the
    /// calling fiber as the waiter; it must then suspend itself.
    fn add_event(&self, fd: RawFd, event: IoEvent, cb: Option<Box<dyn FnOnce() + Send>>) -> Result<()> {
        let ctx = self.context_for(fd);
        let mut inner = ctx.inner.lock();
        assert!(
            inner.events & event.mask() == 0,
            "{:?} event already registered for fd {}",
            event,
            ctx.fd
        );
        let op = if inner.events == 0 {
            libc::EPOLL_CTL_ADD
        } else {
            libc::EPOLL_CTL_MOD
        };
        self.epoll_ctl(op, fd, ET | inner.events | event.mask(), fd as u64)?;
        inner.events |= event.mask();
        self.pending.fetch_add(1, Ordering::SeqCst);

        let sched = scheduler::current_worker()
            .map(|(state, _)| Arc::downgrade(&state))
            .unwrap_or_else(|| self.sched.clone());
        let waiter = inner.waiter_mut(event);
        waiter.scheduler = sched;
        match cb {
            Some(cb) => waiter.cb = Some(cb),
            None => {
                let current = Fiber::current();
                assert_eq!(
                    current.state(),
                    FiberState::Exec,
                    "fd waiter fiber must be running"
                );
                waiter.fiber = Some(current);
            }
        }
        Ok(())
    }

    /// Forget a registration without firing its waiter. False if the event
    /// was not registered.
    fn del_event(&self, fd: RawFd, event: IoEvent) -> Result<bool> {
        let Some(ctx) = self.lookup(fd) else {
            return Ok(false);
        };
        let mut inner = ctx.inner.lock();
        if inner.events & event.mask() == 0 {
            return Ok(false);
        }
        let left = inner.events & !event.mask();
        let op = if left != 0 {
            libc::EPOLL_CTL_MOD
        } else {
            libc::EPOLL_CTL_DEL
        };
        self.epoll_ctl(op, fd, ET | left, fd as u64)?;
        inner.events = left;
        *inner.waiter_mut(event) = EventWaiter::default();
        self.pending.fetch_sub(1, Ordering::SeqCst);
        Ok(true)
    }

    /// Unregister one direction and fire its waiter as if it became ready.
    fn cancel_event(&self, fd: RawFd, event: IoEvent) -> Result<bool> {
        let Some(ctx) = self.lookup(fd) else {
            return Ok(false);
        };
        let mut inner = ctx.inner.lock();
        if inner.events & event.mask() == 0 {
            return Ok(false);
        }
        let left = inner.events & !event.mask();
        let op = if left != 0 {
            libc::EPOLL_CTL_MOD
        } else {
            libc::EPOLL_CTL_DEL
        };
        self.epoll_ctl(op, fd, ET | left, fd as u64)?;
        self.trigger(&mut inner, fd, event);
        Ok(true)
    }

    /// Unregister both directions, firing every waiter.
    fn cancel_all(&self, fd: RawFd) -> Result<bool> {
        let Some(ctx) = self.lookup(fd) else {
            return Ok(false);
        };
        let mut inner = ctx.inner.lock();
        if inner.events == 0 {
            return Ok(false);
        }
        self.epoll_ctl(libc::EPOLL_CTL_DEL, fd, 0, fd as u64)?;
        if inner.events & READ_MASK != 0 {
            self.trigger(&mut inner, fd, IoEvent::Read);
        }
        if inner.events & WRITE_MASK != 0 {
            self.trigger(&mut inner, fd, IoEvent::Write);
        }
        debug_assert_eq!(inner.events, 0);
        Ok(true)
    }

    /// Clear one direction and hand its waiter to a scheduler. Epoll state
    /// must already have been updated by the caller.
    fn trigger(&self, inner: &mut FdInner, fd: RawFd, event: IoEvent) {
        assert!(
            inner.events & event.mask() != 0,
            "{:?} event not registered for fd {}",
            event,
            fd
        );
        inner.events &= !event.mask();
        let waiter = std::mem::take(inner.waiter_mut(event));
        self.pending.fetch_sub(1, Ordering::SeqCst);
        let Some(sched) = waiter.scheduler.upgrade().or_else(|| self.sched.upgrade()) else {
            log::warn!("dropping {:?} waiter for fd {}: scheduler is gone", event, fd);
            return;
        };
        if let Some(cb) = waiter.cb {
            sched.schedule_call(cb, None);
        } else if let Some(fiber) = waiter.fiber {
            sched.schedule_fiber(fiber, None);
        }
    }

    fn drain_wake_pipe(&self) {
        let mut buf = [0u8; 256];
        loop {
            let rc =
                unsafe { libc::read(self.wake_read, buf.as_mut_ptr() as *mut libc::c_void, buf.len()) };
            if rc <= 0 {
                break;
            }
        }
    }
}

impl SchedulerHooks for ReactorCore {
    /// Wake one parked worker by writing to the self-pipe. Nothing to do
    /// when every worker is already busy; a full pipe already wakes.
    fn tickle(&self) {
        let Some(state) = self.sched.upgrade() else {
            return;
        };
        if state.idle_workers() == 0 {
            return;
        }
        let buf = [b'T'];
        let rc = unsafe { libc::write(self.wake_write, buf.as_ptr() as *const libc::c_void, 1) };
        if rc < 0 {
            let err = io::Error::last_os_error();
            if err.kind() != io::ErrorKind::WouldBlock {
                log::error!("wake pipe write failed: {err}");
            }
        }
    }

    fn stopping(&self, state: &SchedulerState) -> bool {
        !self.timers.has_timer() && self.pending.load(Ordering::SeqCst) == 0 && state.base_stopping()
    }

    fn run_idle(&self, state: &Arc<SchedulerState>) {
        log::debug!("reactor {:?} idle fiber running", state.name());
        let mut events = vec![libc::epoll_event { events: 0, u64: 0 }; MAX_EVENTS];
        loop {
            let next = self.timers.next_timer();
            if next.is_none()
                && self.pending.load(Ordering::SeqCst) == 0
                && state.base_stopping()
            {
                break;
            }
            let timeout = next.unwrap_or(MAX_TIMEOUT_MS).min(MAX_TIMEOUT_MS) as i32;

            let ready = loop {
                let rc = unsafe {
                    libc::epoll_wait(self.epfd, events.as_mut_ptr(), MAX_EVENTS as i32, timeout)
                };
                if rc >= 0 {
                    break rc as usize;
                }
                let err = io::Error::last_os_error();
                if err.kind() == io::ErrorKind::Interrupted {
                    continue;
                }
                log::error!("epoll_wait failed: {err}");
                break 0;
            };

            for cb in self.timers.take_expired() {
                state.schedule_call(Box::new(move || cb()), None);
            }

            for ev in &events[..ready] {
                if ev.u64 == WAKE_TOKEN {
                    self.drain_wake_pipe();
                    continue;
                }
                let fd = ev.u64 as RawFd;
                let Some(ctx) = self.lookup(fd) else {
                    continue;
                };
                let mut inner = ctx.inner.lock();
                let mut real = ev.events;
                // An error or hangup must reach whoever is waiting.
                if real & (libc::EPOLLERR | libc::EPOLLHUP) as u32 != 0 {
                    real |= (READ_MASK | WRITE_MASK) & inner.events;
                }
                let fired = real & (READ_MASK | WRITE_MASK) & inner.events;
                if fired == 0 {
                    continue;
                }
                let left = inner.events & !fired;
                let op = if left != 0 {
                    libc::EPOLL_CTL_MOD
                } else {
                    libc::EPOLL_CTL_DEL
                };
                if let Err(err) = self.epoll_ctl(op, fd, ET | left, fd as u64) {
                    log::error!("{err}");
                    continue;
                }
                if fired & READ_MASK != 0 {
                    self.trigger(&mut inner, fd, IoEvent::Read);
                }
                if fired & WRITE_MASK != 0 {
                    self.trigger(&mut inner, fd, IoEvent::Write);
                }
            }

            // One pass per wakeup, then give queued tasks a chance.
            fiber::yield_hold();
        }
        log::debug!("reactor {:?} idle fiber exiting", state.name());
    }
}

impl Drop for ReactorCore {
    fn drop(&mut self) {
        unsafe {
            libc::close(self.epfd);
            libc::close(self.wake_read);
            libc::close(self.wake_write);
        }
    }
}

/// A scheduler with fd readiness and timers wired into its idle time.
pub struct IoManager {
    scheduler: Scheduler,
    core: Arc<ReactorCore>,
}

impl IoManager {
    /// Build and start a reactor-backed scheduler. See [`Scheduler::new`]
    /// for the meaning of `threads` and `use_caller`.
    pub fn new(threads: usize, use_caller: bool, name: &str) -> Result<IoManager> {
        let state = SchedulerState::new(name);
        let core = ReactorCore::new(&state)?;
        state.set_hooks(core.clone());
        let scheduler = Scheduler::from_state(state, threads, use_caller);
        let waker = Arc::downgrade(&core);
        core.timers.set_waker(move || {
            if let Some(core) = waker.upgrade() {
                core.tickle();
            }
        });
        scheduler.start()?;
        Ok(IoManager { scheduler, core })
    }

    /// The underlying scheduler.
    pub fn scheduler(&self) -> &Scheduler {
        &self.scheduler
    }

    /// Queue a callback on any worker.
    pub fn schedule<F>(&self, f: F)
    where
        F: FnOnce() + Send + 'static,
    {
        self.scheduler.schedule(f);
    }

    /// Queue a fiber on any worker.
    pub fn schedule_fiber(&self, fiber: Arc<Fiber>) {
        self.scheduler.schedule_fiber(fiber);
    }

    /// Run `f` when `fd` becomes ready for `event`, or when the event is
    /// cancelled or the fd errors out. One shot; re-register to wait again.
    pub fn add_event<F>(&self, fd: RawFd, event: IoEvent, f: F) -> Result<()>
    where
        F: FnOnce() + Send + 'static,
    {
        self.core.add_event(fd, event, Some(Box::new(f)))
    }

    /// Suspend the calling fiber until `fd` is ready for `event`. Must run
    /// inside a scheduler task.
    pub fn wait_event(&self, fd: RawFd, event: IoEvent) -> Result<()> {
        self.core.add_event(fd, event, None)?;
        fiber::yield_hold();
        Ok(())
    }

    /// Forget a registration without waking its waiter.
    pub fn del_event(&self, fd: RawFd, event: IoEvent) -> Result<bool> {
        self.core.del_event(fd, event)
    }

    /// Unregister one direction of `fd` and wake its waiter now.
    pub fn cancel_event(&self, fd: RawFd, event: IoEvent) -> Result<bool> {
        self.core.cancel_event(fd, event)
    }

    /// Unregister `fd` entirely, waking every waiter. Call before closing
    /// an fd that may still have waiters.
    pub fn cancel_all(&self, fd: RawFd) -> Result<bool> {
        self.core.cancel_all(fd)
    }

    /// Run `f` after `ms` milliseconds on this reactor's workers.
    pub fn add_timer<F>(&self, ms: u64, f: F, recurring: bool) -> Timer
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.core.timers.add_timer(ms, f, recurring)
    }

    /// Timed callback skipped once `cond` is dropped.
    pub fn add_condition_timer<F, T>(&self, ms: u64, f: F, cond: Weak<T>, recurring: bool) -> Timer
    where
        F: Fn() + Send + Sync + 'static,
        T: ?Sized + Send + Sync + 'static,
    {
        self.core.timers.add_condition_timer(ms, f, cond, recurring)
    }

    /// Drain all work, wait for pending events and timers, and shut the
    /// workers down.
    pub fn stop(&self) {
        self.scheduler.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicBool;
    use std::sync::atomic::AtomicUsize;
    use std::thread;
    use std::time::Duration;

    fn init_logs() {
        let _ = env_logger::builder().is_test(true).try_init();
    }

    fn sleep_ms(ms: u64) {
        thread::sleep(Duration::from_millis(ms));
    }

    fn pipe_pair() -> (RawFd, RawFd) {
        let mut fds: [RawFd; 2] = [0; 2];
        let rc = unsafe { libc::pipe2(fds.as_mut_ptr(), libc::O_NONBLOCK) };
        assert_eq!(rc, 0);
        (fds[0], fds[1])
    }

    fn socket_pair() -> (RawFd, RawFd) {
        let mut fds: [RawFd; 2] = [0; 2];
        let rc =
            unsafe { libc::socketpair(libc::AF_UNIX, libc::SOCK_STREAM | libc::SOCK_NONBLOCK, 0, fds.as_mut_ptr()) };
        assert_eq!(rc, 0);
        (fds[0], fds[1])
    }

    fn close_fd(fd: RawFd) {
        unsafe { libc::close(fd) };
    }

    #[test]
    fn test_read_readiness_fires_callback() {
        init_logs();
        let io = IoManager::new(2, false, "io-read").unwrap();
        let (r, w) = pipe_pair();
        let got = Arc::new(AtomicBool::new(false));
        let g = got.clone();
        io.add_event(r, IoEvent::Read, move || {
            g.store(true, Ordering::SeqCst);
        })
        .unwrap();
        assert!(!got.load(Ordering::SeqCst));

        let rc = unsafe { libc::write(w, b"x".as_ptr() as *const libc::c_void, 1) };
        assert_eq!(rc, 1);
        sleep_ms(200);
        assert!(got.load(Ordering::SeqCst));

        io.stop();
        close_fd(r);
        close_fd(w);
    }

    #[test]
    fn test_cancel_fires_the_waiter_exactly_once() {
        init_logs();
        let io = IoManager::new(2, false, "io-cancel").unwrap();
        let (r, w) = pipe_pair();
        let fired = Arc::new(AtomicUsize::new(0));
        let f = fired.clone();
        io.add_event(r, IoEvent::Read, move || {
            f.fetch_add(1, Ordering::SeqCst);
        })
        .unwrap();

        assert!(io.cancel_event(r, IoEvent::Read).unwrap());
        sleep_ms(200);
        assert_eq!(fired.load(Ordering::SeqCst), 1);
        // Already gone.
        assert!(!io.cancel_event(r, IoEvent::Read).unwrap());

        io.stop();
        close_fd(r);
        close_fd(w);
    }

    #[test]
    fn test_del_event_discards_the_waiter() {
        init_logs();
        let io = IoManager::new(2, false, "io-del").unwrap();
        let (r, w) = pipe_pair();
        let fired = Arc::new(AtomicUsize::new(0));
        let f = fired.clone();
        io.add_event(r, IoEvent::Read, move || {
            f.fetch_add(1, Ordering::SeqCst);
        })
        .unwrap();

        assert!(io.del_event(r, IoEvent::Read).unwrap());
        let rc = unsafe { libc::write(w, b"x".as_ptr() as *const libc::c_void, 1) };
        assert_eq!(rc, 1);
        sleep_ms(200);
        assert_eq!(fired.load(Ordering::SeqCst), 0);

        io.stop();
        close_fd(r);
        close_fd(w);
    }

    #[test]
    fn test_double_registration_panics() {
        init_logs();
        let io = IoManager::new(1, false, "io-dup").unwrap();
        let (r, w) = pipe_pair();
        io.add_event(r, IoEvent::Read, || {}).unwrap();
        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            io.add_event(r, IoEvent::Read, || {})
        }));
        assert!(result.is_err());

        io.cancel_event(r, IoEvent::Read).unwrap();
        io.stop();
        close_fd(r);
        close_fd(w);
    }

    #[test]
    fn test_wait_event_suspends_and_resumes_the_fiber() {
        init_logs();
        let io = Arc::new(IoManager::new(2, false, "io-wait").unwrap());
        let (r, w) = pipe_pair();
        let stage = Arc::new(AtomicUsize::new(0));

        let io2 = io.clone();
        let s = stage.clone();
        io.schedule(move || {
            s.store(1, Ordering::SeqCst);
            io2.wait_event(r, IoEvent::Read).unwrap();
            let mut byte = 0u8;
            let rc = unsafe { libc::read(r, (&mut byte) as *mut u8 as *mut libc::c_void, 1) };
            assert_eq!(rc, 1);
            assert_eq!(byte, b'!');
            s.store(2, Ordering::SeqCst);
        });

        sleep_ms(150);
        // Parked on the fd, not finished.
        assert_eq!(stage.load(Ordering::SeqCst), 1);

        let rc = unsafe { libc::write(w, b"!".as_ptr() as *const libc::c_void, 1) };
        assert_eq!(rc, 1);
        sleep_ms(200);
        assert_eq!(stage.load(Ordering::SeqCst), 2);

        io.stop();
        close_fd(r);
        close_fd(w);
    }

    #[test]
    fn test_write_readiness_can_cancel_the_read_side() {
        init_logs();
        let io = Arc::new(IoManager::new(2, false, "io-sock").unwrap());
        let (a, b) = socket_pair();
        let read_fired = Arc::new(AtomicUsize::new(0));
        let write_fired = Arc::new(AtomicUsize::new(0));

        let rf = read_fired.clone();
        io.add_event(a, IoEvent::Read, move || {
            rf.fetch_add(1, Ordering::SeqCst);
        })
        .unwrap();

        let io2 = io.clone();
        let wf = write_fired.clone();
        io.add_event(a, IoEvent::Write, move || {
            wf.fetch_add(1, Ordering::SeqCst);
            // Nobody will ever write to us; force the read waiter out and
            // close the socket. cancel_event drops the last registration,
            // so the fd is already out of epoll when it goes away.
            assert!(io2.cancel_event(a, IoEvent::Read).unwrap());
            close_fd(a);
        })
        .unwrap();

        // A fresh socket is writable immediately.
        sleep_ms(300);
        assert_eq!(write_fired.load(Ordering::SeqCst), 1);
        assert_eq!(read_fired.load(Ordering::SeqCst), 1);

        // The closed fd must not produce another read firing.
        sleep_ms(100);
        assert_eq!(read_fired.load(Ordering::SeqCst), 1);

        io.stop();
        close_fd(b);
    }

    #[test]
    fn test_timers_run_on_the_workers() {
        init_logs();
        let io = IoManager::new(2, false, "io-timer").unwrap();
        let fired = Arc::new(AtomicUsize::new(0));
        let f = fired.clone();
        io.add_timer(
            50,
            move || {
                f.fetch_add(1, Ordering::SeqCst);
            },
            false,
        );
        sleep_ms(250);
        assert_eq!(fired.load(Ordering::SeqCst), 1);
        io.stop();
    }

    #[test]
    fn test_recurring_timer_keeps_firing_until_cancelled() {
        init_logs();
        let io = IoManager::new(1, false, "io-recur").unwrap();
        let fired = Arc::new(AtomicUsize::new(0));
        let f = fired.clone();
        let timer = io.add_timer(
            30,
            move || {
                f.fetch_add(1, Ordering::SeqCst);
            },
            true,
        );
        sleep_ms(250);
        assert!(fired.load(Ordering::SeqCst) >= 2);
        // stop() waits for timers, so a recurring one must go first.
        assert!(timer.cancel());
        io.stop();
    }
}
