//! Wall-clock timers.
//!
//! A [`TimerManager`] keeps timers in a `BTreeMap` ordered by absolute
//! deadline in milliseconds, so the earliest deadline is always the first
//! key. The reactor polls [`TimerManager::next_timer`] for its epoll timeout
//! and drains [`TimerManager::take_expired`] after each wakeup; inserting a
//! timer ahead of everything else fires a one-shot waker so a parked reactor
//! shortens its timeout.
//!
//! Deadlines come from the system clock. A sample more than an hour behind
//! the previous one is treated as a clock rollover and every timer fires.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::{SystemTime, UNIX_EPOCH};

use once_cell::sync::OnceCell;
use parking_lot::{Mutex, RwLock};

/// Backward clock jumps smaller than this are ignored.
const ROLLOVER_SLACK_MS: u64 = 60 * 60 * 1000;

static NEXT_TIMER_ID: AtomicU64 = AtomicU64::new(1);

/// Milliseconds since the Unix epoch.
fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// Shared timer callback, as handed out by [`TimerManager::take_expired`].
pub type TimerCallback = Arc<dyn Fn() + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
struct TimerKey {
    next_ms: u64,
    id: u64,
}

struct TimerNode {
    id: u64,
    /// Interval in milliseconds.
    period: AtomicU64,
    /// Absolute deadline in milliseconds.
    next: AtomicU64,
    recurring: bool,
    /// Taken on cancel and after a one-shot fires.
    cb: Mutex<Option<TimerCallback>>,
}

impl TimerNode {
    fn key(&self) -> TimerKey {
        TimerKey {
            next_ms: self.next.load(Ordering::SeqCst),
            id: self.id,
        }
    }
}

struct TimerInner {
    timers: RwLock<BTreeMap<TimerKey, Arc<TimerNode>>>,
    /// Set when the front timer changed and the waker already ran; cleared
    /// by `next_timer` so the next front change wakes again.
    tickled: AtomicBool,
    previous_time: Mutex<u64>,
    waker: OnceCell<Box<dyn Fn() + Send + Sync>>,
}

impl TimerInner {
    /// Insert a node, running the waker when it lands ahead of every other
    /// timer and nobody has been woken since the last `next_timer` call.
    fn insert(&self, node: Arc<TimerNode>) {
        let key = node.key();
        let at_front = {
            let mut map = self.timers.write();
            map.insert(key, node);
            map.keys().next() == Some(&key)
        };
        if at_front && !self.tickled.swap(true, Ordering::SeqCst) {
            if let Some(waker) = self.waker.get() {
                waker();
            }
        }
    }

    /// True when the clock jumped back by more than an hour since the last
    /// sample. Updates the sample either way.
    fn clock_rolled_over(&self, now: u64) -> bool {
        let mut prev = self.previous_time.lock();
        let rolled = now < prev.saturating_sub(ROLLOVER_SLACK_MS);
        *prev = now;
        rolled
    }
}

/// Shared collection of wall-clock timers.
#[derive(Clone)]
pub struct TimerManager {
    inner: Arc<TimerInner>,
}

impl Default for TimerManager {
    fn default() -> Self {
        Self::new()
    }
}

impl TimerManager {
    /// Create an empty manager.
    pub fn new() -> TimerManager {
        TimerManager {
            inner: Arc::new(TimerInner {
                timers: RwLock::new(BTreeMap::new()),
                tickled: AtomicBool::new(false),
                previous_time: Mutex::new(now_ms()),
                waker: OnceCell::new(),
            }),
        }
    }

    /// Run `f` once (or every) `ms` milliseconds from now.
    pub fn add_timer<F>(&self, ms: u64, f: F, recurring: bool) -> Timer
    where
        F: Fn() + Send + Sync + 'static,
    {
        let node = Arc::new(TimerNode {
            id: NEXT_TIMER_ID.fetch_add(1, Ordering::Relaxed),
            period: AtomicU64::new(ms),
            next: AtomicU64::new(now_ms() + ms),
            recurring,
            cb: Mutex::new(Some(Arc::new(f))),
        });
        self.inner.insert(node.clone());
        Timer {
            node,
            inner: Arc::downgrade(&self.inner),
        }
    }

    /// Like [`TimerManager::add_timer`], but the callback is skipped once
    /// `cond` has no strong references left.
    pub fn add_condition_timer<F, T>(&self, ms: u64, f: F, cond: Weak<T>, recurring: bool) -> Timer
    where
        F: Fn() + Send + Sync + 'static,
        T: ?Sized + Send + Sync + 'static,
    {
        self.add_timer(
            ms,
            move || {
                if cond.upgrade().is_some() {
                    f();
                }
            },
            recurring,
        )
    }

    /// Milliseconds until the earliest deadline: `None` with no timers,
    /// `Some(0)` when one is already overdue. Re-arms the insert waker.
    pub fn next_timer(&self) -> Option<u64> {
        self.inner.tickled.store(false, Ordering::SeqCst);
        let map = self.inner.timers.read();
        let key = map.keys().next()?;
        Some(key.next_ms.saturating_sub(now_ms()))
    }

    /// Whether any timer is pending.
    pub fn has_timer(&self) -> bool {
        !self.inner.timers.read().is_empty()
    }

    /// Remove every expired timer and hand back its callback, earliest
    /// first. Recurring timers are re-armed `period` past the current time.
    /// After a rollover every timer counts as expired.
    pub fn take_expired(&self) -> Vec<TimerCallback> {
        let now = now_ms();
        if self.inner.timers.read().is_empty() {
            return Vec::new();
        }
        let rollover = self.inner.clock_rolled_over(now);

        let mut expired = Vec::new();
        let mut due = Vec::new();
        let mut map = self.inner.timers.write();
        loop {
            let key = match map.keys().next() {
                Some(&key) if rollover || key.next_ms <= now => key,
                _ => break,
            };
            if let Some(node) = map.remove(&key) {
                due.push(node);
            }
        }
        for node in due {
            let cb = if node.recurring {
                let period = node.period.load(Ordering::SeqCst);
                node.next.store(now + period, Ordering::SeqCst);
                let cb = node.cb.lock().clone();
                map.insert(node.key(), node.clone());
                cb
            } else {
                node.cb.lock().take()
            };
            if let Some(cb) = cb {
                expired.push(cb);
            }
        }
        expired
    }

    /// Install the hook run when a timer lands at the front of the queue.
    /// May be installed once.
    pub(crate) fn set_waker<F>(&self, f: F)
    where
        F: Fn() + Send + Sync + 'static,
    {
        assert!(
            self.inner.waker.set(Box::new(f)).is_ok(),
            "timer waker installed twice"
        );
    }

    #[cfg(test)]
    fn set_previous_time(&self, ms: u64) {
        *self.inner.previous_time.lock() = ms;
    }
}

/// Handle to a scheduled timer.
pub struct Timer {
    node: Arc<TimerNode>,
    inner: Weak<TimerInner>,
}

impl Timer {
    /// Drop the timer without firing it. Returns false if it already fired
    /// (one-shot), was cancelled, or the manager is gone.
    pub fn cancel(&self) -> bool {
        let Some(inner) = self.inner.upgrade() else {
            return false;
        };
        let mut map = inner.timers.write();
        if self.node.cb.lock().take().is_none() {
            return false;
        }
        map.remove(&self.node.key());
        true
    }

    /// Push the deadline back to `period` from now, keeping the period.
    pub fn refresh(&self) -> bool {
        let Some(inner) = self.inner.upgrade() else {
            return false;
        };
        let mut map = inner.timers.write();
        if self.node.cb.lock().is_none() {
            return false;
        }
        if map.remove(&self.node.key()).is_none() {
            return false;
        }
        let period = self.node.period.load(Ordering::SeqCst);
        self.node.next.store(now_ms() + period, Ordering::SeqCst);
        map.insert(self.node.key(), self.node.clone());
        true
    }

    /// Change the period. With `from_now` the new deadline counts from the
    /// current time, otherwise from the timer's original start.
    pub fn reset(&self, ms: u64, from_now: bool) -> bool {
        let period = self.node.period.load(Ordering::SeqCst);
        if ms == period && !from_now {
            return true;
        }
        let Some(inner) = self.inner.upgrade() else {
            return false;
        };
        let node = {
            let mut map = inner.timers.write();
            if self.node.cb.lock().is_none() {
                return false;
            }
            if map.remove(&self.node.key()).is_none() {
                return false;
            }
            let start = if from_now {
                now_ms()
            } else {
                self.node.next.load(Ordering::SeqCst).saturating_sub(period)
            };
            self.node.period.store(ms, Ordering::SeqCst);
            self.node.next.store(start + ms, Ordering::SeqCst);
            self.node.clone()
        };
        // Reinsert outside the write lock so the at-front waker can run.
        inner.insert(node);
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::thread;
    use std::time::Duration;

    fn sleep_ms(ms: u64) {
        thread::sleep(Duration::from_millis(ms));
    }

    #[test]
    fn test_expires_in_deadline_order() {
        let mgr = TimerManager::new();
        let log = Arc::new(Mutex::new(Vec::new()));
        for (tag, ms) in [("late", 40u64), ("early", 10)] {
            let log = log.clone();
            mgr.add_timer(
                ms,
                move || {
                    log.lock().push(tag);
                },
                false,
            );
        }
        sleep_ms(80);
        for cb in mgr.take_expired() {
            cb();
        }
        assert_eq!(*log.lock(), vec!["early", "late"]);
        assert!(!mgr.has_timer());
    }

    #[test]
    fn test_next_timer_reports_the_front() {
        let mgr = TimerManager::new();
        assert_eq!(mgr.next_timer(), None);
        mgr.add_timer(10_000, || {}, false);
        let t = mgr.add_timer(200, || {}, false);
        let until = mgr.next_timer().unwrap();
        assert!(until <= 200);
        t.cancel();
        assert!(mgr.next_timer().unwrap() > 5_000);

        mgr.add_timer(0, || {}, false);
        assert_eq!(mgr.next_timer(), Some(0));
        assert_eq!(mgr.take_expired().len(), 1);
    }

    #[test]
    fn test_cancel_prevents_firing() {
        let mgr = TimerManager::new();
        let fired = Arc::new(AtomicUsize::new(0));
        let f = fired.clone();
        let timer = mgr.add_timer(
            10,
            move || {
                f.fetch_add(1, Ordering::SeqCst);
            },
            false,
        );
        assert!(timer.cancel());
        assert!(!timer.cancel());
        sleep_ms(30);
        assert!(mgr.take_expired().is_empty());
        assert_eq!(fired.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_recurring_timer_rearms() {
        let mgr = TimerManager::new();
        let fired = Arc::new(AtomicUsize::new(0));
        let f = fired.clone();
        let timer = mgr.add_timer(
            10,
            move || {
                f.fetch_add(1, Ordering::SeqCst);
            },
            true,
        );
        for _ in 0..2 {
            sleep_ms(30);
            for cb in mgr.take_expired() {
                cb();
            }
            assert!(mgr.has_timer());
        }
        assert_eq!(fired.load(Ordering::SeqCst), 2);
        assert!(timer.cancel());
        assert!(!mgr.has_timer());
    }

    #[test]
    fn test_refresh_pushes_the_deadline_back() {
        let mgr = TimerManager::new();
        let timer = mgr.add_timer(200, || {}, false);
        sleep_ms(150);
        assert!(timer.refresh());
        sleep_ms(100);
        // 250ms in, but the deadline moved to the 350ms mark.
        assert!(mgr.take_expired().is_empty());
        sleep_ms(150);
        assert_eq!(mgr.take_expired().len(), 1);
    }

    #[test]
    fn test_reset_changes_the_period() {
        let mgr = TimerManager::new();
        let timer = mgr.add_timer(10_000, || {}, false);
        assert!(timer.reset(20, true));
        sleep_ms(60);
        assert_eq!(mgr.take_expired().len(), 1);
        // Fired one-shots cannot be reset again.
        assert!(!timer.reset(50, true));
    }

    #[test]
    fn test_condition_timer_skips_dead_condition() {
        let mgr = TimerManager::new();
        let fired = Arc::new(AtomicUsize::new(0));
        let f = fired.clone();
        let cond = Arc::new(());
        mgr.add_condition_timer(
            10,
            move || {
                f.fetch_add(1, Ordering::SeqCst);
            },
            Arc::downgrade(&cond),
            false,
        );
        drop(cond);
        sleep_ms(30);
        for cb in mgr.take_expired() {
            cb();
        }
        assert_eq!(fired.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_front_insert_runs_the_waker_once() {
        let mgr = TimerManager::new();
        let wakes = Arc::new(AtomicUsize::new(0));
        let w = wakes.clone();
        mgr.set_waker(move || {
            w.fetch_add(1, Ordering::SeqCst);
        });

        mgr.add_timer(5_000, || {}, false);
        assert_eq!(wakes.load(Ordering::SeqCst), 1);
        // Not at the front: no wake.
        mgr.add_timer(9_000, || {}, false);
        assert_eq!(wakes.load(Ordering::SeqCst), 1);
        // At the front, but the previous wake has not been consumed yet.
        mgr.add_timer(1_000, || {}, false);
        assert_eq!(wakes.load(Ordering::SeqCst), 1);
        // next_timer re-arms the waker.
        mgr.next_timer();
        mgr.add_timer(100, || {}, false);
        assert_eq!(wakes.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_clock_rollover_expires_everything() {
        let mgr = TimerManager::new();
        mgr.add_timer(3_600_000, || {}, false);
        // Pretend the last sample was hours in the future.
        mgr.set_previous_time(now_ms() + 3 * ROLLOVER_SLACK_MS);
        assert_eq!(mgr.take_expired().len(), 1);
        assert!(!mgr.has_timer());
    }
}
