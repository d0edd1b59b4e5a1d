//! Shared scheduler for background tasks.
//!
//! A small pool of worker threads (one by default) pulls due tasks from a
//! delay queue. Tasks are repeated according to their policy; a panic inside
//! a task is caught and logged and only stops the task when it opted into
//! stop-on-failure. Worker threads that die are replaced the next time work
//! is scheduled.

use std::cmp::Ordering as CmpOrdering;
use std::collections::BinaryHeap;
use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
#[cfg(test)]
use std::sync::atomic::AtomicUsize;
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crate::atlas_log;

/// How a task is repeated after it runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RepeatPolicy {
    /// Run a single time.
    Once,
    /// Wait for the given delay after each completion.
    FixedDelay(Duration),
    /// Run on multiples of the given period, skipping runs that would
    /// overlap an execution that ran long.
    FixedRateSkip(Duration),
}

/// Options for a scheduled task.
#[derive(Debug, Clone, Copy)]
pub struct SchedulerOptions {
    /// Repeat policy.
    pub repeat: RepeatPolicy,
    /// Delay before the first run.
    pub initial_delay: Duration,
    /// When true, a panicking run moves the task to [`TaskPhase::Failed`]
    /// and it never runs again.
    pub stop_on_failure: bool,
}

impl SchedulerOptions {
    /// Options with the given repeat policy, no initial delay and
    /// stop-on-failure disabled.
    pub fn new(repeat: RepeatPolicy) -> Self {
        SchedulerOptions {
            repeat,
            initial_delay: Duration::ZERO,
            stop_on_failure: false,
        }
    }

    /// Delay before the first run.
    pub fn with_initial_delay(mut self, delay: Duration) -> Self {
        self.initial_delay = delay;
        self
    }

    /// Stop the task permanently when a run panics.
    pub fn with_stop_on_failure(mut self, stop: bool) -> Self {
        self.stop_on_failure = stop;
        self
    }
}

/// Lifecycle of a scheduled task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskPhase {
    /// Waiting in the queue for its next run.
    Scheduled,
    /// Currently executing.
    Running,
    /// Stopped by a panic with stop-on-failure set.
    Failed,
    /// Cancelled by the caller.
    Cancelled,
    /// A one-shot task that has completed.
    Done,
}

struct TaskState {
    phase: Mutex<TaskPhase>,
    cancelled: AtomicBool,
    options: SchedulerOptions,
    run: Mutex<Box<dyn FnMut() + Send>>,
}

impl TaskState {
    fn set_phase(&self, phase: TaskPhase) {
        *lock(&self.phase) = phase;
    }

    fn phase(&self) -> TaskPhase {
        *lock(&self.phase)
    }
}

/// Handle for inspecting and cancelling a scheduled task.
#[derive(Clone)]
pub struct TaskHandle {
    task: Arc<TaskState>,
}

impl TaskHandle {
    /// Prevent any further executions. Takes effect immediately for queued
    /// tasks; an in-flight run completes and is then dropped.
    pub fn cancel(&self) {
        self.task.cancelled.store(true, Ordering::Release);
        self.task.set_phase(TaskPhase::Cancelled);
    }

    /// Current phase of the task.
    pub fn phase(&self) -> TaskPhase {
        self.task.phase()
    }

    /// True once the task will never run again.
    pub fn is_done(&self) -> bool {
        matches!(
            self.phase(),
            TaskPhase::Failed | TaskPhase::Cancelled | TaskPhase::Done
        )
    }
}

impl fmt::Debug for TaskHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskHandle")
            .field("phase", &self.phase())
            .finish()
    }
}

struct QueueEntry {
    next_run: Instant,
    seq: u64,
    task: Arc<TaskState>,
}

impl PartialEq for QueueEntry {
    fn eq(&self, other: &Self) -> bool {
        self.next_run == other.next_run && self.seq == other.seq
    }
}

impl Eq for QueueEntry {}

impl PartialOrd for QueueEntry {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

impl Ord for QueueEntry {
    // Inverted so the binary heap pops the earliest entry first.
    fn cmp(&self, other: &Self) -> CmpOrdering {
        other
            .next_run
            .cmp(&self.next_run)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

struct SchedulerInner {
    name: String,
    num_workers: usize,
    queue: Mutex<BinaryHeap<QueueEntry>>,
    available: Condvar,
    next_seq: AtomicU64,
    shutdown: AtomicBool,
    workers: Mutex<Vec<JoinHandle<()>>>,
    // Test hook: pending worker deaths. Task panics are caught, so this is
    // the only way to exercise the replacement of a dead thread.
    #[cfg(test)]
    kill_workers: AtomicUsize,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

/// A service scheduling repeated background work, used for gauge polling
/// and the publish pipeline. Worker threads are started lazily on the first
/// [`Scheduler::schedule`] call and torn down by [`Scheduler::shutdown`].
#[derive(Clone)]
pub struct Scheduler {
    inner: Arc<SchedulerInner>,
}

impl Scheduler {
    /// Create a scheduler with the given thread-name prefix and worker
    /// count. Most usage wants a single worker so expensive user callbacks
    /// cannot fan out across many threads.
    pub fn new(name: impl Into<String>, num_workers: usize) -> Self {
        Scheduler {
            inner: Arc::new(SchedulerInner {
                name: name.into(),
                num_workers: num_workers.max(1),
                queue: Mutex::new(BinaryHeap::new()),
                available: Condvar::new(),
                next_seq: AtomicU64::new(0),
                shutdown: AtomicBool::new(false),
                workers: Mutex::new(Vec::new()),
                #[cfg(test)]
                kill_workers: AtomicUsize::new(0),
            }),
        }
    }

    /// Schedule a task. Returns a handle that can cancel it.
    pub fn schedule(&self, options: SchedulerOptions, f: impl FnMut() + Send + 'static) -> TaskHandle {
        let task = Arc::new(TaskState {
            phase: Mutex::new(TaskPhase::Scheduled),
            cancelled: AtomicBool::new(false),
            options,
            run: Mutex::new(Box::new(f)),
        });
        self.push(task.clone(), Instant::now() + options.initial_delay);
        self.ensure_workers();
        TaskHandle { task }
    }

    fn push(&self, task: Arc<TaskState>, next_run: Instant) {
        let entry = QueueEntry {
            next_run,
            seq: self.inner.next_seq.fetch_add(1, Ordering::Relaxed),
            task,
        };
        lock(&self.inner.queue).push(entry);
        self.inner.available.notify_one();
    }

    /// Replace any worker threads that have died and start missing ones.
    fn ensure_workers(&self) {
        if self.inner.shutdown.load(Ordering::Acquire) {
            return;
        }
        let mut workers = lock(&self.inner.workers);
        let before = workers.len();
        workers.retain(|w| !w.is_finished());
        if workers.len() < before {
            atlas_log!(warn,
                name: "Scheduler.replaceWorkers",
                scheduler = self.inner.name.clone(),
                replaced = before - workers.len()
            );
        }
        while workers.len() < self.inner.num_workers {
            let inner = self.inner.clone();
            let name = format!("{}-{}", self.inner.name, workers.len());
            match thread::Builder::new()
                .name(name)
                .spawn(move || worker_loop(inner))
            {
                Ok(handle) => workers.push(handle),
                Err(e) => {
                    atlas_log!(error,
                        name: "Scheduler.spawnWorker",
                        scheduler = self.inner.name.clone(),
                        error = e.to_string()
                    );
                    break;
                }
            }
        }
    }

    /// Make one worker thread exit at its next loop iteration, as if it
    /// had died.
    #[cfg(test)]
    fn kill_worker(&self) {
        self.inner.kill_workers.fetch_add(1, Ordering::Release);
        self.inner.available.notify_all();
    }

    #[cfg(test)]
    fn live_workers(&self) -> usize {
        lock(&self.inner.workers)
            .iter()
            .filter(|w| !w.is_finished())
            .count()
    }

    /// Stop all workers. Queued tasks are dropped; a task currently running
    /// completes first. Must not be called from inside a task.
    pub fn shutdown(&self) {
        self.inner.shutdown.store(true, Ordering::Release);
        self.inner.available.notify_all();
        let workers: Vec<JoinHandle<()>> = std::mem::take(&mut *lock(&self.inner.workers));
        for w in workers {
            let _ = w.join();
        }
    }
}

impl fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Scheduler")
            .field("name", &self.inner.name)
            .field("queued", &lock(&self.inner.queue).len())
            .finish()
    }
}

fn worker_loop(inner: Arc<SchedulerInner>) {
    loop {
        if inner.shutdown.load(Ordering::Acquire) {
            return;
        }
        enum NextRun {
            Ready,
            Until(Duration),
            Idle,
        }

        let entry = {
            let mut queue = lock(&inner.queue);
            loop {
                if inner.shutdown.load(Ordering::Acquire) {
                    return;
                }
                #[cfg(test)]
                if inner
                    .kill_workers
                    .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1))
                    .is_ok()
                {
                    return;
                }
                let now = Instant::now();
                let next = match queue.peek() {
                    Some(e) if e.next_run <= now => NextRun::Ready,
                    Some(e) => NextRun::Until(e.next_run - now),
                    None => NextRun::Idle,
                };
                match next {
                    NextRun::Ready => break queue.pop().expect("peeked entry"),
                    NextRun::Until(wait) => {
                        queue = inner
                            .available
                            .wait_timeout(queue, wait)
                            .unwrap_or_else(|e| e.into_inner())
                            .0;
                    }
                    NextRun::Idle => {
                        queue = inner
                            .available
                            .wait(queue)
                            .unwrap_or_else(|e| e.into_inner());
                    }
                }
            }
        };

        let task = entry.task;
        if task.cancelled.load(Ordering::Acquire) {
            continue;
        }
        task.set_phase(TaskPhase::Running);
        let result = catch_unwind(AssertUnwindSafe(|| {
            let mut run = lock(&task.run);
            (*run)();
        }));
        let failed = result.is_err();
        if failed {
            atlas_log!(debug,
                name: "Scheduler.taskFailure",
                scheduler = inner.name.clone(),
                stops_task = task.options.stop_on_failure
            );
        }

        if task.cancelled.load(Ordering::Acquire) {
            task.set_phase(TaskPhase::Cancelled);
            continue;
        }
        if failed && task.options.stop_on_failure {
            task.set_phase(TaskPhase::Failed);
            continue;
        }
        match task.options.repeat {
            RepeatPolicy::Once => task.set_phase(TaskPhase::Done),
            RepeatPolicy::FixedDelay(delay) => {
                task.set_phase(TaskPhase::Scheduled);
                let scheduler = Scheduler {
                    inner: inner.clone(),
                };
                scheduler.push(task, Instant::now() + delay);
            }
            RepeatPolicy::FixedRateSkip(period) => {
                let period = period.max(Duration::from_millis(1));
                let mut next = entry.next_run + period;
                let now = Instant::now();
                while next < now {
                    next += period;
                }
                task.set_phase(TaskPhase::Scheduled);
                let scheduler = Scheduler {
                    inner: inner.clone(),
                };
                scheduler.push(task, next);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    fn wait_for(mut cond: impl FnMut() -> bool, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        while Instant::now() < deadline {
            if cond() {
                return true;
            }
            thread::sleep(Duration::from_millis(5));
        }
        cond()
    }

    #[test]
    fn one_shot_task_runs_once() {
        let scheduler = Scheduler::new("test", 1);
        let runs = Arc::new(AtomicUsize::new(0));
        let counted = runs.clone();
        let handle = scheduler.schedule(SchedulerOptions::new(RepeatPolicy::Once), move || {
            counted.fetch_add(1, Ordering::SeqCst);
        });
        assert!(wait_for(|| handle.phase() == TaskPhase::Done, Duration::from_secs(5)));
        assert_eq!(runs.load(Ordering::SeqCst), 1);
        scheduler.shutdown();
    }

    #[test]
    fn fixed_delay_task_repeats() {
        let scheduler = Scheduler::new("test", 1);
        let runs = Arc::new(AtomicUsize::new(0));
        let counted = runs.clone();
        let handle = scheduler.schedule(
            SchedulerOptions::new(RepeatPolicy::FixedDelay(Duration::from_millis(1))),
            move || {
                counted.fetch_add(1, Ordering::SeqCst);
            },
        );
        assert!(wait_for(
            || runs.load(Ordering::SeqCst) >= 5,
            Duration::from_secs(5)
        ));
        handle.cancel();
        assert!(handle.is_done());
        scheduler.shutdown();
    }

    #[test]
    fn panicking_task_keeps_running_without_stop_on_failure() {
        let scheduler = Scheduler::new("test", 1);
        let runs = Arc::new(AtomicUsize::new(0));
        let counted = runs.clone();
        scheduler.schedule(
            SchedulerOptions::new(RepeatPolicy::FixedDelay(Duration::from_millis(1))),
            move || {
                counted.fetch_add(1, Ordering::SeqCst);
                panic!("boom");
            },
        );
        // The scheduler must survive repeated failures and keep executing.
        assert!(wait_for(
            || runs.load(Ordering::SeqCst) >= 10,
            Duration::from_secs(10)
        ));
        scheduler.shutdown();
    }

    #[test]
    fn stop_on_failure_moves_task_to_failed() {
        let scheduler = Scheduler::new("test", 1);
        let runs = Arc::new(AtomicUsize::new(0));
        let counted = runs.clone();
        let handle = scheduler.schedule(
            SchedulerOptions::new(RepeatPolicy::FixedDelay(Duration::from_millis(1)))
                .with_stop_on_failure(true),
            move || {
                counted.fetch_add(1, Ordering::SeqCst);
                panic!("boom");
            },
        );
        assert!(wait_for(
            || handle.phase() == TaskPhase::Failed,
            Duration::from_secs(5)
        ));
        let seen = runs.load(Ordering::SeqCst);
        assert_eq!(seen, 1);
        assert!(handle.is_done());
        scheduler.shutdown();
    }

    #[test]
    fn dead_workers_are_replaced() {
        let scheduler = Scheduler::new("test", 1);
        let runs = Arc::new(AtomicUsize::new(0));
        let counted = runs.clone();
        scheduler.schedule(
            SchedulerOptions::new(RepeatPolicy::FixedDelay(Duration::from_millis(1))),
            move || {
                counted.fetch_add(1, Ordering::SeqCst);
            },
        );
        assert!(wait_for(
            || runs.load(Ordering::SeqCst) >= 1,
            Duration::from_secs(5)
        ));
        // Kill the only worker several times; each schedule call must
        // notice the dead thread and spawn a replacement that resumes the
        // repeating task.
        for _ in 0..3 {
            scheduler.kill_worker();
            assert!(wait_for(
                || scheduler.live_workers() == 0,
                Duration::from_secs(5)
            ));
            let before = runs.load(Ordering::SeqCst);
            scheduler.schedule(SchedulerOptions::new(RepeatPolicy::Once), || {});
            assert!(wait_for(
                || scheduler.live_workers() == 1,
                Duration::from_secs(5)
            ));
            assert!(wait_for(
                || runs.load(Ordering::SeqCst) > before,
                Duration::from_secs(5)
            ));
        }
        assert!(wait_for(
            || runs.load(Ordering::SeqCst) >= 10,
            Duration::from_secs(10)
        ));
        scheduler.shutdown();
    }

    #[test]
    fn cancelled_queued_task_never_runs() {
        let scheduler = Scheduler::new("test", 1);
        let runs = Arc::new(AtomicUsize::new(0));
        let counted = runs.clone();
        let handle = scheduler.schedule(
            SchedulerOptions::new(RepeatPolicy::FixedDelay(Duration::from_secs(60)))
                .with_initial_delay(Duration::from_secs(60)),
            move || {
                counted.fetch_add(1, Ordering::SeqCst);
            },
        );
        handle.cancel();
        assert_eq!(handle.phase(), TaskPhase::Cancelled);
        thread::sleep(Duration::from_millis(20));
        assert_eq!(runs.load(Ordering::SeqCst), 0);
        scheduler.shutdown();
    }

    #[test]
    fn tasks_run_after_a_worker_panic() {
        // A panicking task must not take the worker with it; later tasks
        // still execute on the same single-threaded scheduler.
        let scheduler = Scheduler::new("test", 1);
        scheduler.schedule(SchedulerOptions::new(RepeatPolicy::Once), || {
            panic!("boom");
        });
        thread::sleep(Duration::from_millis(20));
        let runs = Arc::new(AtomicUsize::new(0));
        let counted = runs.clone();
        scheduler.schedule(SchedulerOptions::new(RepeatPolicy::Once), move || {
            counted.fetch_add(1, Ordering::SeqCst);
        });
        assert!(wait_for(
            || runs.load(Ordering::SeqCst) == 1,
            Duration::from_secs(5)
        ));
        scheduler.shutdown();
    }
}
