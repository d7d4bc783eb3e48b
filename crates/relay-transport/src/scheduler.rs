//! Timer scheduling for heartbeats and delayed reconnects.
//!
//! Adapters never call `tokio::time` directly for their periodic work; they
//! go through a [`Scheduler`] so tests can substitute virtual time.
//! [`TokioScheduler`] is the production implementation (and is itself
//! deterministic under `tokio::time::pause`), [`ManualScheduler`] advances
//! only when told to.

use futures_util::future::BoxFuture;
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::AbortHandle;
use tokio::time::{Instant, MissedTickBehavior};

/// Work run when a timer fires. Repeating timers call it once per tick.
pub type TimerTask = Box<dyn FnMut() -> BoxFuture<'static, ()> + Send>;

/// Cancellable handle to a scheduled timer.
///
/// Dropping the handle does not cancel the timer.
#[derive(Clone)]
pub struct TimerHandle {
    cancelled: Arc<AtomicBool>,
    abort: Option<AbortHandle>,
}

impl TimerHandle {
    fn new(cancelled: Arc<AtomicBool>, abort: Option<AbortHandle>) -> Self {
        Self { cancelled, abort }
    }

    /// Cancel the timer. A task that already started is aborted at its next
    /// suspension point.
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
        if let Some(abort) = &self.abort {
            abort.abort();
        }
    }

    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }
}

impl fmt::Debug for TimerHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TimerHandle")
            .field("cancelled", &self.is_cancelled())
            .finish()
    }
}

/// A clock plus cancellable timers.
pub trait Scheduler: Send + Sync {
    /// Time elapsed since the scheduler was created.
    fn now(&self) -> Duration;

    /// Run `task` once after `delay`.
    fn schedule_once(&self, delay: Duration, task: TimerTask) -> TimerHandle;

    /// Run `task` every `interval`, first after one interval. Ticks never
    /// overlap: the next tick waits for the previous task to finish.
    fn schedule_repeating(&self, interval: Duration, task: TimerTask) -> TimerHandle;
}

/// Scheduler backed by tokio timers. Must be used inside a tokio runtime.
#[derive(Debug, Clone)]
pub struct TokioScheduler {
    origin: Instant,
}

impl TokioScheduler {
    #[must_use]
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
        }
    }
}

impl Default for TokioScheduler {
    fn default() -> Self {
        Self::new()
    }
}

impl Scheduler for TokioScheduler {
    fn now(&self) -> Duration {
        self.origin.elapsed()
    }

    fn schedule_once(&self, delay: Duration, mut task: TimerTask) -> TimerHandle {
        let cancelled = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&cancelled);
        let join = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if !flag.load(Ordering::SeqCst) {
                task().await;
            }
        });
        TimerHandle::new(cancelled, Some(join.abort_handle()))
    }

    fn schedule_repeating(&self, interval: Duration, mut task: TimerTask) -> TimerHandle {
        let interval = interval.max(Duration::from_millis(1));
        let cancelled = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&cancelled);
        let join = tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(Instant::now() + interval, interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                if flag.load(Ordering::SeqCst) {
                    break;
                }
                task().await;
            }
        });
        TimerHandle::new(cancelled, Some(join.abort_handle()))
    }
}

struct ManualTimer {
    due: Duration,
    interval: Option<Duration>,
    /// `None` while the task is running.
    task: Option<TimerTask>,
    cancelled: Arc<AtomicBool>,
}

#[derive(Default)]
struct ManualState {
    now: Duration,
    next_id: u64,
    timers: BTreeMap<u64, ManualTimer>,
}

/// Virtual-time scheduler: nothing fires until [`ManualScheduler::advance`].
#[derive(Clone, Default)]
pub struct ManualScheduler {
    state: Arc<Mutex<ManualState>>,
}

impl ManualScheduler {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of live (not cancelled, not finished) timers.
    #[must_use]
    pub fn pending(&self) -> usize {
        self.state
            .lock()
            .timers
            .values()
            .filter(|t| !t.cancelled.load(Ordering::SeqCst))
            .count()
    }

    /// Move virtual time forward, running every timer that falls due, in
    /// due order, and awaiting each task before the next.
    pub async fn advance(&self, by: Duration) {
        let target = self.state.lock().now + by;

        loop {
            let next = {
                let mut guard = self.state.lock();
                let state = &mut *guard;
                state
                    .timers
                    .retain(|_, t| !t.cancelled.load(Ordering::SeqCst));

                let due = state
                    .timers
                    .iter()
                    .filter(|(_, t)| t.task.is_some() && t.due <= target)
                    .min_by_key(|(id, t)| (t.due, **id))
                    .map(|(id, t)| (*id, t.due));

                match due {
                    Some((id, at)) => {
                        state.now = state.now.max(at);
                        state
                            .timers
                            .get_mut(&id)
                            .and_then(|t| t.task.take())
                            .map(|task| (id, task))
                    }
                    None => None,
                }
            };

            let Some((id, mut task)) = next else {
                break;
            };
            task().await;

            let mut guard = self.state.lock();
            let state = &mut *guard;
            let reschedule = state.timers.get_mut(&id).and_then(|timer| {
                match timer.interval {
                    Some(interval) if !timer.cancelled.load(Ordering::SeqCst) => {
                        timer.due += interval;
                        timer.task = Some(task);
                        Some(())
                    }
                    _ => None,
                }
            });
            if reschedule.is_none() {
                state.timers.remove(&id);
            }
        }

        let mut state = self.state.lock();
        state.now = state.now.max(target);
    }

    fn insert(&self, delay: Duration, interval: Option<Duration>, task: TimerTask) -> TimerHandle {
        let cancelled = Arc::new(AtomicBool::new(false));
        let mut state = self.state.lock();
        let id = state.next_id;
        state.next_id += 1;
        let due = state.now + delay;
        state.timers.insert(
            id,
            ManualTimer {
                due,
                interval,
                task: Some(task),
                cancelled: Arc::clone(&cancelled),
            },
        );
        TimerHandle::new(cancelled, None)
    }
}

impl Scheduler for ManualScheduler {
    fn now(&self) -> Duration {
        self.state.lock().now
    }

    fn schedule_once(&self, delay: Duration, task: TimerTask) -> TimerHandle {
        self.insert(delay, None, task)
    }

    fn schedule_repeating(&self, interval: Duration, task: TimerTask) -> TimerHandle {
        let interval = interval.max(Duration::from_millis(1));
        self.insert(interval, Some(interval), task)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::FutureExt;
    use std::sync::atomic::AtomicUsize;

    fn counting_task(counter: &Arc<AtomicUsize>) -> TimerTask {
        let counter = Arc::clone(counter);
        Box::new(move || {
            let counter = Arc::clone(&counter);
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
            }
            .boxed()
        })
    }

    #[tokio::test]
    async fn test_manual_once() {
        let scheduler = ManualScheduler::new();
        let fired = Arc::new(AtomicUsize::new(0));
        scheduler.schedule_once(Duration::from_millis(100), counting_task(&fired));

        scheduler.advance(Duration::from_millis(99)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 0);

        scheduler.advance(Duration::from_millis(1)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 1);
        assert_eq!(scheduler.pending(), 0);
        assert_eq!(scheduler.now(), Duration::from_millis(100));
    }

    #[tokio::test]
    async fn test_manual_repeating_and_cancel() {
        let scheduler = ManualScheduler::new();
        let ticks = Arc::new(AtomicUsize::new(0));
        let handle = scheduler.schedule_repeating(Duration::from_millis(50), counting_task(&ticks));

        scheduler.advance(Duration::from_millis(200)).await;
        assert_eq!(ticks.load(Ordering::SeqCst), 4);

        handle.cancel();
        assert!(handle.is_cancelled());
        scheduler.advance(Duration::from_millis(200)).await;
        assert_eq!(ticks.load(Ordering::SeqCst), 4);
        assert_eq!(scheduler.pending(), 0);
    }

    #[tokio::test]
    async fn test_manual_runs_in_due_order() {
        let scheduler = ManualScheduler::new();
        let order = Arc::new(Mutex::new(Vec::new()));

        for (label, delay) in [("late", 30u64), ("early", 10), ("middle", 20)] {
            let order = Arc::clone(&order);
            scheduler.schedule_once(
                Duration::from_millis(delay),
                Box::new(move || {
                    let order = Arc::clone(&order);
                    async move {
                        order.lock().push(label);
                    }
                    .boxed()
                }),
            );
        }

        scheduler.advance(Duration::from_millis(30)).await;
        assert_eq!(*order.lock(), vec!["early", "middle", "late"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_tokio_repeating() {
        let scheduler = TokioScheduler::new();
        let ticks = Arc::new(AtomicUsize::new(0));
        let handle = scheduler.schedule_repeating(Duration::from_millis(50), counting_task(&ticks));

        tokio::time::sleep(Duration::from_millis(210)).await;
        assert_eq!(ticks.load(Ordering::SeqCst), 4);
        assert!(scheduler.now() >= Duration::from_millis(210));

        handle.cancel();
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(ticks.load(Ordering::SeqCst), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn test_tokio_once_cancelled() {
        let scheduler = TokioScheduler::new();
        let fired = Arc::new(AtomicUsize::new(0));
        let handle = scheduler.schedule_once(Duration::from_millis(100), counting_task(&fired));

        handle.cancel();
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 0);
    }
}
