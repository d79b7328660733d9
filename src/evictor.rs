use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering as AtomicOrdering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use tracing::{debug, trace, warn};

/// How long the worker thread keeps running with an empty task list before
/// it shuts itself down. Rationale per the design doc: avoid a permanent
/// background thread for pools that enable eviction only briefly.
const IDLE_SHUTDOWN: Duration = Duration::from_secs(10);

type Task = Arc<dyn Fn() + Send + Sync>;

struct Scheduled {
    id: u64,
    next_run: Instant,
    period: Duration,
    task: Task,
    cancelled: Arc<AtomicBool>,
}

impl PartialEq for Scheduled {
    fn eq(&self, other: &Self) -> bool {
        self.next_run == other.next_run
    }
}
impl Eq for Scheduled {}
impl PartialOrd for Scheduled {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}
impl Ord for Scheduled {
    fn cmp(&self, other: &Self) -> Ordering {
        // BinaryHeap is a max-heap; we want the soonest `next_run` on top.
        other.next_run.cmp(&self.next_run)
    }
}

struct State {
    tasks: BinaryHeap<Scheduled>,
    worker_running: bool,
    next_id: u64,
}

/// A process-wide scheduler shared by every pool that enables eviction.
///
/// Runs every scheduled sweep on a single background worker, started lazily
/// on first `schedule` and stopped after [`IDLE_SHUTDOWN`] with nothing left
/// to run. This is the thread-based analog of the teacher's per-pool
/// `IdleTask` (a lone future racing a timer against a drop notifier); here
/// one worker multiplexes every pool's sweep rather than one task per pool,
/// matching the design doc's "scheduler shared across pools".
#[derive(Clone)]
pub struct EvictionScheduler {
    state: Arc<Mutex<State>>,
    condvar: Arc<Condvar>,
}

impl Default for EvictionScheduler {
    fn default() -> Self {
        Self::new()
    }
}

impl EvictionScheduler {
    pub fn new() -> Self {
        EvictionScheduler {
            state: Arc::new(Mutex::new(State {
                tasks: BinaryHeap::new(),
                worker_running: false,
                next_id: 0,
            })),
            condvar: Arc::new(Condvar::new()),
        }
    }

    /// Schedule `task` to first run after `initial_delay`, then every
    /// `period` thereafter, until the returned handle is cancelled or
    /// dropped.
    pub fn schedule<F>(&self, task: F, initial_delay: Duration, period: Duration) -> TaskHandle
    where
        F: Fn() + Send + Sync + 'static,
    {
        let cancelled = Arc::new(AtomicBool::new(false));
        let mut state = self.state.lock().unwrap();
        let id = state.next_id;
        state.next_id += 1;
        state.tasks.push(Scheduled {
            id,
            next_run: Instant::now() + initial_delay,
            period,
            task: Arc::new(task),
            cancelled: cancelled.clone(),
        });
        trace!(task_id = id, "scheduled eviction task");
        if !state.worker_running {
            state.worker_running = true;
            let state_arc = self.state.clone();
            let condvar = self.condvar.clone();
            thread::spawn(move || Self::run_worker(state_arc, condvar));
        }
        drop(state);
        self.condvar.notify_all();
        TaskHandle { cancelled }
    }

    fn run_worker(state: Arc<Mutex<State>>, condvar: Arc<Condvar>) {
        debug!("eviction scheduler worker starting");
        loop {
            let mut guard = state.lock().unwrap();
            loop {
                match guard.tasks.peek() {
                    None => {
                        let (g, timeout) =
                            condvar.wait_timeout(guard, IDLE_SHUTDOWN).unwrap();
                        guard = g;
                        if timeout.timed_out() && guard.tasks.is_empty() {
                            guard.worker_running = false;
                            debug!("eviction scheduler worker idling out");
                            return;
                        }
                        continue;
                    }
                    Some(scheduled) => {
                        let now = Instant::now();
                        if scheduled.next_run > now {
                            let wait = scheduled.next_run - now;
                            let (g, _) = condvar.wait_timeout(guard, wait).unwrap();
                            guard = g;
                            continue;
                        }
                        break;
                    }
                }
            }
            let scheduled = guard.tasks.pop().expect("peeked Some above");
            drop(guard);

            if scheduled.cancelled.load(AtomicOrdering::Acquire) {
                trace!(task_id = scheduled.id, "skipping cancelled eviction task");
                continue;
            }

            let task = scheduled.task.clone();
            // A misbehaving sweep (factory panic) must not take the shared
            // worker down with it.
            if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(|| task())) {
                warn!(task_id = scheduled.id, ?payload, "eviction task panicked");
            }

            if !scheduled.cancelled.load(AtomicOrdering::Acquire) {
                let mut guard = state.lock().unwrap();
                guard.tasks.push(Scheduled {
                    id: scheduled.id,
                    next_run: Instant::now() + scheduled.period,
                    period: scheduled.period,
                    task: scheduled.task,
                    cancelled: scheduled.cancelled,
                });
            }
        }
    }
}

/// A cancellable handle to a scheduled task. Cancellation is cooperative: a
/// sweep already in flight completes, but no further runs occur. Dropping
/// the handle cancels it too, the same way the teacher's `IdleTask` stops
/// once its `oneshot` drop-notifier goes away — a pool that's dropped
/// without an explicit `close()` doesn't leave its sweep running forever.
pub struct TaskHandle {
    cancelled: Arc<AtomicBool>,
}

impl TaskHandle {
    pub fn cancel(&self) {
        self.cancelled.store(true, AtomicOrdering::Release);
    }
}

impl Drop for TaskHandle {
    fn drop(&mut self) {
        self.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    #[test]
    fn runs_periodically_until_cancelled() {
        let scheduler = EvictionScheduler::new();
        let count = Arc::new(AtomicUsize::new(0));
        let c = count.clone();
        let handle = scheduler.schedule(
            move || {
                c.fetch_add(1, AtomicOrdering::SeqCst);
            },
            Duration::from_millis(5),
            Duration::from_millis(15),
        );

        thread::sleep(Duration::from_millis(80));
        handle.cancel();
        let seen = count.load(AtomicOrdering::SeqCst);
        assert!(seen >= 3, "expected several runs, saw {seen}");

        thread::sleep(Duration::from_millis(60));
        let after_cancel = count.load(AtomicOrdering::SeqCst);
        assert_eq!(after_cancel, seen, "no runs should occur after cancel");
    }

    #[test]
    fn panicking_task_does_not_kill_the_worker() {
        let scheduler = EvictionScheduler::new();
        let count = Arc::new(AtomicUsize::new(0));

        let _h1 = scheduler.schedule(
            || panic!("boom"),
            Duration::from_millis(5),
            Duration::from_millis(500),
        );
        let c = count.clone();
        let _h2 = scheduler.schedule(
            move || {
                c.fetch_add(1, AtomicOrdering::SeqCst);
            },
            Duration::from_millis(5),
            Duration::from_millis(15),
        );

        thread::sleep(Duration::from_millis(80));
        assert!(count.load(AtomicOrdering::SeqCst) >= 3);
    }
}
