//! Cooperative N:M scheduler.
//!
//! A [`Scheduler`] owns a pool of worker threads draining one shared queue of
//! tasks, where a task is either a prepared [`Fiber`] or a plain callback.
//! Tasks may carry an affinity pinning them to a specific worker. With
//! `use_caller` the constructing thread itself becomes worker `0`: it lends
//! its stack through a root fiber that runs the dispatch loop when
//! [`Scheduler::stop`] is called.
//!
//! Subsystems that need to react to scheduling events (the reactor, mainly)
//! plug in through [`SchedulerHooks`]: waking idle workers when work arrives,
//! vetoing shutdown while I/O is pending, and supplying the idle fiber body.

use std::cell::RefCell;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::thread::{self, JoinHandle, ThreadId};
use std::time::Duration;

use once_cell::sync::OnceCell;
use parking_lot::{Condvar, Mutex};

use crate::error::{Error, Result};
use crate::fiber::{self, Fiber, FiberState};
use crate::hook;

thread_local! {
    static WORKER: RefCell<Option<(Weak<SchedulerState>, usize)>> = const { RefCell::new(None) };
}

/// The scheduler state and worker id of the calling thread, if it is a
/// scheduler worker.
pub(crate) fn current_worker() -> Option<(Arc<SchedulerState>, usize)> {
    WORKER.with(|w| {
        w.borrow()
            .as_ref()
            .and_then(|(state, id)| state.upgrade().map(|s| (s, *id)))
    })
}

enum TaskPayload {
    Fiber(Arc<Fiber>),
    Call(Box<dyn FnOnce() + Send>),
}

struct Task {
    payload: TaskPayload,
    affinity: Option<usize>,
}

/// Extension points for embedding the scheduler in a larger runtime.
///
/// The defaults give a pure compute scheduler whose idle fiber spins gently;
/// the reactor overrides all three to park workers in `epoll_wait` instead.
pub trait SchedulerHooks: Send + Sync + 'static {
    /// Called after a task is queued; wake an idle worker if there is one.
    fn tickle(&self) {}

    /// Whether workers are allowed to shut down.
    fn stopping(&self, state: &SchedulerState) -> bool {
        state.base_stopping()
    }

    /// Body of each worker's idle fiber. Must suspend with
    /// [`fiber::yield_hold`] between checks and return once
    /// [`SchedulerHooks::stopping`] holds.
    fn run_idle(&self, state: &Arc<SchedulerState>) {
        while !self.stopping(state) {
            thread::sleep(Duration::from_micros(100));
            fiber::yield_hold();
        }
    }
}

struct DefaultHooks;

impl SchedulerHooks for DefaultHooks {}

/// Startup rendezvous between `start` and the spawned workers.
///
/// Unlike a `Barrier`, it stays sound when some spawns never happen: workers
/// announce themselves and wait for a release, and the starter can abort
/// instead, in which case every worker that did spawn exits immediately.
struct StartGate {
    state: Mutex<GateState>,
    cond: Condvar,
}

#[derive(Default)]
struct GateState {
    arrived: usize,
    released: bool,
    aborted: bool,
}

impl StartGate {
    fn new() -> StartGate {
        StartGate {
            state: Mutex::new(GateState::default()),
            cond: Condvar::new(),
        }
    }

    /// Worker side: announce arrival and park until released. False means
    /// startup was aborted and the worker must not run.
    fn wait(&self) -> bool {
        let mut state = self.state.lock();
        state.arrived += 1;
        self.cond.notify_all();
        while !state.released {
            self.cond.wait(&mut state);
        }
        !state.aborted
    }

    /// Starter side: wait for `expected` workers, then let them run.
    fn release(&self, expected: usize) {
        let mut state = self.state.lock();
        while state.arrived < expected {
            self.cond.wait(&mut state);
        }
        state.released = true;
        self.cond.notify_all();
    }

    /// Starter side: send every arrived (and still-arriving) worker home.
    fn abort(&self) {
        let mut state = self.state.lock();
        state.released = true;
        state.aborted = true;
        self.cond.notify_all();
    }
}

/// Shared core of a scheduler: the task queue plus the flags and counters
/// workers coordinate through.
pub struct SchedulerState {
    name: String,
    queue: Mutex<VecDeque<Task>>,
    hooks: OnceCell<Arc<dyn SchedulerHooks>>,
    started: AtomicBool,
    stopping: AtomicBool,
    stopped: AtomicBool,
    /// Workers currently running a task.
    active: AtomicUsize,
    /// Workers currently inside their idle fiber.
    idle: AtomicUsize,
}

impl SchedulerState {
    pub(crate) fn new(name: &str) -> Arc<SchedulerState> {
        Arc::new(SchedulerState {
            name: name.to_owned(),
            queue: Mutex::new(VecDeque::new()),
            hooks: OnceCell::new(),
            started: AtomicBool::new(false),
            stopping: AtomicBool::new(false),
            stopped: AtomicBool::new(false),
            active: AtomicUsize::new(0),
            idle: AtomicUsize::new(0),
        })
    }

    /// Name the scheduler was created with; worker threads are named after it.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// True once shutdown has been requested, the queue is drained and no
    /// worker is mid-task.
    pub fn base_stopping(&self) -> bool {
        self.stopping.load(Ordering::SeqCst)
            && self.active.load(Ordering::SeqCst) == 0
            && self.queue.lock().is_empty()
    }

    pub(crate) fn idle_workers(&self) -> usize {
        self.idle.load(Ordering::SeqCst)
    }

    pub(crate) fn set_hooks(&self, hooks: Arc<dyn SchedulerHooks>) {
        assert!(
            self.hooks.set(hooks).is_ok(),
            "scheduler hooks installed twice"
        );
    }

    fn hooks(&self) -> Arc<dyn SchedulerHooks> {
        self.hooks
            .get_or_init(|| Arc::new(DefaultHooks))
            .clone()
    }

    pub(crate) fn schedule_fiber(&self, f: Arc<Fiber>, affinity: Option<usize>) {
        self.push(TaskPayload::Fiber(f), affinity);
    }

    pub(crate) fn schedule_call(&self, f: Box<dyn FnOnce() + Send>, affinity: Option<usize>) {
        self.push(TaskPayload::Call(f), affinity);
    }

    fn push(&self, payload: TaskPayload, affinity: Option<usize>) {
        assert!(
            !self.stopped.load(Ordering::SeqCst),
            "schedule on stopped scheduler {:?}",
            self.name
        );
        self.queue.lock().push_back(Task { payload, affinity });
        self.hooks().tickle();
    }
}

/// A pool of fiber-running worker threads.
pub struct Scheduler {
    state: Arc<SchedulerState>,
    threads: Mutex<Vec<JoinHandle<()>>>,
    /// Number of spawned workers, the caller excluded.
    thread_count: usize,
    root_fiber: Option<Arc<Fiber>>,
    /// Set in caller mode; `stop` must run on this thread.
    owner: Option<ThreadId>,
}

impl Scheduler {
    /// Create a scheduler with `threads` workers (`0` means one per CPU).
    ///
    /// With `use_caller` the constructing thread counts as one of the
    /// workers and contributes its stack when `stop` runs.
    pub fn new(threads: usize, use_caller: bool, name: &str) -> Scheduler {
        Self::from_state(SchedulerState::new(name), threads, use_caller)
    }

    pub(crate) fn from_state(
        state: Arc<SchedulerState>,
        threads: usize,
        use_caller: bool,
    ) -> Scheduler {
        let threads = if threads == 0 { num_cpus::get() } else { threads };
        let (thread_count, root_fiber, owner) = if use_caller {
            let root_state = state.clone();
            let root = Fiber::root(move || dispatch_loop(&root_state, 0));
            (threads - 1, Some(root), Some(thread::current().id()))
        } else {
            (threads, None, None)
        };
        Scheduler {
            state,
            threads: Mutex::new(Vec::new()),
            thread_count,
            root_fiber,
            owner,
        }
    }

    /// Spawn the worker threads. Returns once every worker is ready to run
    /// its dispatch loop. Idempotent. On a spawn failure the workers that
    /// did start are unwound and the scheduler is left startable again.
    pub fn start(&self) -> Result<()> {
        if self.state.started.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        log::debug!(
            "scheduler {:?} starting {} worker(s)",
            self.state.name,
            self.thread_count
        );
        let gate = Arc::new(StartGate::new());
        let mut handles = self.threads.lock();
        let first_id = usize::from(self.root_fiber.is_some());
        for i in 0..self.thread_count {
            let id = first_id + i;
            let state = self.state.clone();
            let thread_gate = gate.clone();
            let spawned = thread::Builder::new()
                .name(format!("{}-{}", self.state.name, id))
                .spawn(move || {
                    if thread_gate.wait() {
                        dispatch_loop(&state, id);
                    }
                });
            match spawned {
                Ok(handle) => handles.push(handle),
                Err(err) => {
                    gate.abort();
                    let spawned: Vec<_> = handles.drain(..).collect();
                    drop(handles);
                    for handle in spawned {
                        let _ = handle.join();
                    }
                    self.state.started.store(false, Ordering::SeqCst);
                    return Err(Error::ThreadSpawn(err));
                }
            }
        }
        drop(handles);
        gate.release(self.thread_count);
        Ok(())
    }

    /// Queue a callback on any worker.
    pub fn schedule<F>(&self, f: F)
    where
        F: FnOnce() + Send + 'static,
    {
        self.state.schedule_call(Box::new(f), None);
    }

    /// Queue a callback pinned to the worker with the given id.
    pub fn schedule_on<F>(&self, worker: usize, f: F)
    where
        F: FnOnce() + Send + 'static,
    {
        self.state.schedule_call(Box::new(f), Some(worker));
    }

    /// Queue a fiber on any worker.
    pub fn schedule_fiber(&self, fiber: Arc<Fiber>) {
        self.state.schedule_fiber(fiber, None);
    }

    /// Queue a fiber pinned to the worker with the given id.
    pub fn schedule_fiber_on(&self, worker: usize, fiber: Arc<Fiber>) {
        self.state.schedule_fiber(fiber, Some(worker));
    }

    /// Drain the queue and shut the workers down. In caller mode the calling
    /// thread runs its share of the work here, so this must be invoked from
    /// the thread that created the scheduler.
    pub fn stop(&self) {
        if self.state.stopped.load(Ordering::SeqCst) {
            return;
        }
        if let Some(owner) = self.owner {
            assert_eq!(
                thread::current().id(),
                owner,
                "caller-mode scheduler {:?} stopped from a foreign thread",
                self.state.name
            );
        }
        log::debug!("scheduler {:?} stopping", self.state.name);
        self.state.stopping.store(true, Ordering::SeqCst);
        let hooks = self.state.hooks();
        for _ in 0..self.thread_count {
            hooks.tickle();
        }
        if let Some(root) = &self.root_fiber {
            hooks.tickle();
            if root.state() == FiberState::Init {
                root.call();
            }
        }
        let handles: Vec<_> = self.threads.lock().drain(..).collect();
        for handle in handles {
            let _ = handle.join();
        }
        self.state.stopped.store(true, Ordering::SeqCst);
        log::debug!("scheduler {:?} stopped", self.state.name);
    }
}

impl Drop for Scheduler {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Worker loop: pull tasks, run each inside a fiber, fall back to the idle
/// fiber when the queue has nothing for us.
fn dispatch_loop(state: &Arc<SchedulerState>, worker_id: usize) {
    log::trace!("scheduler {:?} worker {} running", state.name, worker_id);
    hook::set_enabled(true);
    let dispatch = Fiber::current();
    fiber::set_dispatch(&dispatch);
    WORKER.with(|w| *w.borrow_mut() = Some((Arc::downgrade(state), worker_id)));

    let hooks = state.hooks();
    let idle_state = state.clone();
    let idle_hooks = hooks.clone();
    let idle_fiber = Fiber::new(move || idle_hooks.run_idle(&idle_state));
    // Recycled fiber for plain-callback tasks.
    let mut cb_fiber: Option<Arc<Fiber>> = None;

    loop {
        let mut task = None;
        let mut notify_others = false;
        {
            let mut queue = state.queue.lock();
            let mut i = 0;
            while i < queue.len() {
                let candidate = &queue[i];
                if candidate.affinity.is_some_and(|a| a != worker_id) {
                    notify_others = true;
                    i += 1;
                    continue;
                }
                // A fiber still winding down on another worker stays queued.
                if let TaskPayload::Fiber(f) = &candidate.payload {
                    if f.state() == FiberState::Exec {
                        i += 1;
                        continue;
                    }
                }
                task = queue.remove(i);
                break;
            }
            notify_others |= task.is_some() && !queue.is_empty();
        }
        if notify_others {
            hooks.tickle();
        }

        let Some(task) = task else {
            if idle_fiber.state() == FiberState::Term {
                break;
            }
            state.idle.fetch_add(1, Ordering::SeqCst);
            idle_fiber.swap_in();
            state.idle.fetch_sub(1, Ordering::SeqCst);
            continue;
        };

        state.active.fetch_add(1, Ordering::SeqCst);
        match task.payload {
            TaskPayload::Fiber(f) => {
                f.swap_in();
                match f.state() {
                    FiberState::Ready => state.schedule_fiber(f, task.affinity),
                    // Hold: whoever parked it owns rescheduling it.
                    _ => {}
                }
            }
            TaskPayload::Call(cb) => {
                let f = match cb_fiber.take() {
                    Some(f) => {
                        f.reset(cb);
                        f
                    }
                    None => Fiber::new(cb),
                };
                f.swap_in();
                match f.state() {
                    FiberState::Ready => state.schedule_fiber(f, task.affinity),
                    FiberState::Term | FiberState::Except => cb_fiber = Some(f),
                    _ => {}
                }
            }
        }
        state.active.fetch_sub(1, Ordering::SeqCst);
    }

    WORKER.with(|w| *w.borrow_mut() = None);
    log::trace!("scheduler {:?} worker {} exiting", state.name, worker_id);
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn test_start_gate_releases_after_all_arrive() {
        let gate = Arc::new(StartGate::new());
        let mut workers = Vec::new();
        for _ in 0..3 {
            let gate = gate.clone();
            workers.push(thread::spawn(move || gate.wait()));
        }
        gate.release(3);
        for worker in workers {
            assert!(worker.join().unwrap());
        }
    }

    #[test]
    fn test_start_gate_abort_unparks_partial_startup() {
        let gate = Arc::new(StartGate::new());
        let g = gate.clone();
        let early = thread::spawn(move || g.wait());
        // The remaining spawns never happen; abort instead of releasing.
        gate.abort();
        assert!(!early.join().unwrap());
        // A straggler arriving after the abort goes home too.
        let g = gate.clone();
        assert!(!thread::spawn(move || g.wait()).join().unwrap());
    }

    #[test]
    fn test_runs_every_callback_once() {
        let sched = Scheduler::new(4, false, "pool");
        sched.start().unwrap();
        let count = Arc::new(AtomicUsize::new(0));
        for _ in 0..100 {
            let c = count.clone();
            sched.schedule(move || {
                c.fetch_add(1, Ordering::SeqCst);
            });
        }
        sched.stop();
        assert_eq!(count.load(Ordering::SeqCst), 100);
    }

    #[test]
    fn test_affinity_pins_to_named_worker() {
        let sched = Scheduler::new(3, false, "aff");
        sched.start().unwrap();
        let names = Arc::new(Mutex::new(Vec::new()));
        for id in 0..3 {
            let names = names.clone();
            sched.schedule_on(id, move || {
                let name = thread::current().name().map(str::to_owned);
                names.lock().push((id, name));
            });
        }
        sched.stop();
        let mut names = names.lock().clone();
        names.sort();
        assert_eq!(names.len(), 3);
        for (id, name) in names {
            assert_eq!(name.as_deref(), Some(format!("aff-{id}").as_str()));
        }
    }

    #[test]
    fn test_caller_mode_runs_on_owning_thread() {
        let sched = Scheduler::new(1, true, "caller");
        sched.start().unwrap();
        let here = thread::current().id();
        let ran_on = Arc::new(Mutex::new(None));
        let r = ran_on.clone();
        sched.schedule(move || {
            *r.lock() = Some(thread::current().id());
        });
        // Nothing runs until the owning thread lends its stack in stop().
        assert!(ran_on.lock().is_none());
        sched.stop();
        assert_eq!(*ran_on.lock(), Some(here));
    }

    #[test]
    fn test_fibers_survive_yields() {
        let sched = Scheduler::new(2, false, "yield");
        sched.start().unwrap();
        let count = Arc::new(AtomicUsize::new(0));
        let c = count.clone();
        sched.schedule_fiber(Fiber::new(move || {
            c.fetch_add(1, Ordering::SeqCst);
            fiber::yield_ready();
            c.fetch_add(1, Ordering::SeqCst);
        }));
        sched.stop();
        assert_eq!(count.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_tasks_can_schedule_more_tasks() {
        let sched = Arc::new(Scheduler::new(2, false, "nested"));
        sched.start().unwrap();
        let count = Arc::new(AtomicUsize::new(0));
        {
            let sched = sched.clone();
            let count = count.clone();
            sched.clone().schedule(move || {
                for _ in 0..10 {
                    let c = count.clone();
                    sched.schedule(move || {
                        c.fetch_add(1, Ordering::SeqCst);
                    });
                }
            });
        }
        sched.stop();
        assert_eq!(count.load(Ordering::SeqCst), 10);
    }

    #[test]
    fn test_fiber_enqueued_while_running_resumes_after_yield() {
        let sched = Arc::new(Scheduler::new(2, false, "requeue"));
        sched.start().unwrap();
        let count = Arc::new(AtomicUsize::new(0));
        let c = count.clone();
        let s = sched.clone();
        sched.schedule_fiber(Fiber::new(move || {
            c.fetch_add(1, Ordering::SeqCst);
            // Queued while still Exec, the way an fd waiter fires while the
            // waiting fiber is mid-suspend; must not resume before the
            // context is saved.
            s.schedule_fiber(Fiber::current());
            thread::sleep(Duration::from_millis(20));
            fiber::yield_hold();
            c.fetch_add(1, Ordering::SeqCst);
        }));
        thread::sleep(Duration::from_millis(300));
        assert_eq!(count.load(Ordering::SeqCst), 2);
        sched.stop();
        assert_eq!(count.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_panicking_task_does_not_kill_the_worker() {
        let sched = Scheduler::new(1, false, "panicky");
        sched.start().unwrap();
        sched.schedule(|| panic!("task blew up"));
        let ran = Arc::new(AtomicUsize::new(0));
        let r = ran.clone();
        sched.schedule(move || {
            r.fetch_add(1, Ordering::SeqCst);
        });
        sched.stop();
        assert_eq!(ran.load(Ordering::SeqCst), 1);
    }
}
