//! Dual-lane cooperative task scheduler.
//!
//! Two dedicated threads poll every [`POLL_INTERVAL`]:
//!
//! - The **foreground** lane runs every due task inline, except tasks flagged
//!   background, which are handed to the background lane's queue without
//!   blocking so a slow callback cannot delay every other foreground task.
//! - The **background** lane drains that queue one task at a time, with no
//!   interval logic of its own.
//!
//! A panicking callback is caught, logged with the task's name, and isolated:
//! it never takes down a lane or affects another task. Recurring tasks pick
//! their next due time either *before* the body runs (`drift_corrected`,
//! fixed wall-clock cadence) or *after* it returns (default, fixed spacing
//! between runs). Cancellation is cooperative: a stopped task finishes its
//! current run and is pruned on the next scheduling pass.
//!
//! The live task set is mutated under a lock but exposed to the hot poll loop
//! as an immutable snapshot swapped atomically on structural change only.

use arc_swap::ArcSwap;
use crossbeam_channel::{unbounded, Receiver, RecvTimeoutError, Sender};
use log::{error, info, warn};
use parking_lot::Mutex;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU8, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

/// How often both lanes wake up to look for due work.
pub const POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Upper bound on waiting for a lane thread to exit during shutdown.
const SHUTDOWN_JOIN_WAIT: Duration = Duration::from_secs(2);

/// Best-effort pause letting in-flight network notifications drain before
/// the process hard-stops.
const SHUTDOWN_NETWORK_GRACE: Duration = Duration::from_millis(100);

/// Runs without an explicit repeat count.
const REPEAT_UNLIMITED: i64 = -1;

/// Task lifecycle: Scheduled -> Executing -> Scheduled again (recurring with
/// repeats remaining) or Stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum TaskState {
    Scheduled = 0,
    Executing = 1,
    Stopped = 2,
}

type Callback = Box<dyn FnMut(&ScheduledTask) + Send>;

/// One unit of scheduled work. Callbacks receive their own task handle, may
/// stop it or retune its interval, and must not assume which lane runs them.
pub struct ScheduledTask {
    name: String,
    callback: Mutex<Callback>,
    interval: Mutex<Duration>,
    delay: Duration,
    is_recurring: bool,
    is_background: bool,
    adjust_for_execution_time: bool,
    max_repeats: AtomicI64,
    next_time: Mutex<Instant>,
    state: AtomicU8,
}

impl ScheduledTask {
    fn build(
        name: &str,
        callback: impl FnMut(&ScheduledTask) + Send + 'static,
        interval: Duration,
        delay: Duration,
        is_recurring: bool,
        max_repeats: i64,
    ) -> ScheduledTask {
        ScheduledTask {
            name: name.to_string(),
            callback: Mutex::new(Box::new(callback)),
            interval: Mutex::new(interval),
            delay,
            is_recurring,
            is_background: false,
            adjust_for_execution_time: false,
            max_repeats: AtomicI64::new(max_repeats),
            next_time: Mutex::new(Instant::now()),
            state: AtomicU8::new(TaskState::Scheduled as u8),
        }
    }

    /// A task that fires once after `delay`.
    pub fn once(
        name: &str,
        delay: Duration,
        callback: impl FnMut(&ScheduledTask) + Send + 'static,
    ) -> ScheduledTask {
        ScheduledTask::build(name, callback, Duration::ZERO, delay, false, 1)
    }

    /// A task that fires every `interval` until stopped. The first run is
    /// immediate unless a delay is added with [`ScheduledTask::with_delay`].
    pub fn forever(
        name: &str,
        interval: Duration,
        callback: impl FnMut(&ScheduledTask) + Send + 'static,
    ) -> ScheduledTask {
        ScheduledTask::build(name, callback, interval, Duration::ZERO, true, REPEAT_UNLIMITED)
    }

    /// A task that fires `times` times, `interval` apart, starting after
    /// `delay`.
    pub fn repeating(
        name: &str,
        delay: Duration,
        interval: Duration,
        times: u32,
        callback: impl FnMut(&ScheduledTask) + Send + 'static,
    ) -> ScheduledTask {
        ScheduledTask::build(name, callback, interval, delay, true, times as i64)
    }

    /// Routes this task to the background lane.
    pub fn background(mut self) -> ScheduledTask {
        self.is_background = true;
        self
    }

    /// Computes the next due time before the body runs, keeping a fixed
    /// wall-clock cadence regardless of how long the body takes.
    pub fn drift_corrected(mut self) -> ScheduledTask {
        self.adjust_for_execution_time = true;
        self
    }

    pub fn with_delay(mut self, delay: Duration) -> ScheduledTask {
        self.delay = delay;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn state(&self) -> TaskState {
        match self.state.load(Ordering::Acquire) {
            0 => TaskState::Scheduled,
            1 => TaskState::Executing,
            _ => TaskState::Stopped,
        }
    }

    fn set_state(&self, state: TaskState) {
        self.state.store(state as u8, Ordering::Release);
    }

    /// Requests a cooperative stop. A run already in progress completes; the
    /// task is pruned on the next scheduling pass.
    pub fn stop(&self) {
        self.set_state(TaskState::Stopped);
    }

    pub fn interval(&self) -> Duration {
        *self.interval.lock()
    }

    /// Retunes the recurrence interval; takes effect from the next
    /// scheduling decision.
    pub fn set_interval(&self, interval: Duration) {
        *self.interval.lock() = interval;
    }

    pub fn is_background(&self) -> bool {
        self.is_background
    }

    /// Consumes one repeat. Returns true when this is the final run.
    fn consume_repeat(&self) -> bool {
        let repeats = self.max_repeats.load(Ordering::Acquire);
        if repeats == REPEAT_UNLIMITED {
            return false;
        }
        let remaining = (repeats - 1).max(0);
        self.max_repeats.store(remaining, Ordering::Release);
        remaining == 0
    }
}

struct SchedulerInner {
    tasks: Mutex<Vec<Arc<ScheduledTask>>>,
    snapshot: ArcSwap<Vec<Arc<ScheduledTask>>>,
    background_tx: Sender<Arc<ScheduledTask>>,
    shutdown: AtomicBool,
}

impl SchedulerInner {
    /// Rebuilds the poll loop's snapshot from the live set, dropping
    /// stopped tasks.
    fn prune(&self) {
        let mut tasks = self.tasks.lock();
        tasks.retain(|t| t.state() != TaskState::Stopped);
        self.snapshot.store(Arc::new(tasks.clone()));
    }

    fn publish(&self) {
        let tasks = self.tasks.lock();
        self.snapshot.store(Arc::new(tasks.clone()));
    }

    /// Runs a task body with panic isolation.
    fn run_task(task: &Arc<ScheduledTask>) {
        let result = {
            let mut callback = task.callback.lock();
            catch_unwind(AssertUnwindSafe(|| callback(task)))
        };
        if result.is_err() {
            error!(
                "Task '{}' callback panicked; the task is isolated and the scheduler continues",
                task.name
            );
        }
    }

    /// Post-run bookkeeping shared by both lanes. `last_run` reflects the
    /// repeat consumed at dispatch.
    fn finish_run(task: &Arc<ScheduledTask>, last_run: bool) {
        if task.state() == TaskState::Stopped {
            // Stopped itself or was stopped externally mid-run.
            return;
        }
        if !task.is_recurring || last_run {
            task.set_state(TaskState::Stopped);
            return;
        }
        if !task.adjust_for_execution_time {
            *task.next_time.lock() = Instant::now() + task.interval();
        }
        task.set_state(TaskState::Scheduled);
    }

    /// One foreground pass over the task snapshot.
    fn poll_pass(self: &Arc<Self>) {
        let snapshot = self.snapshot.load_full();
        let now = Instant::now();
        let mut needs_prune = false;

        for task in snapshot.iter() {
            match task.state() {
                TaskState::Stopped => {
                    needs_prune = true;
                    continue;
                }
                // Still running or queued on the background lane.
                TaskState::Executing => continue,
                TaskState::Scheduled => {}
            }
            if *task.next_time.lock() > now {
                continue;
            }

            let last_run = task.consume_repeat();
            task.set_state(TaskState::Executing);
            if task.adjust_for_execution_time {
                *task.next_time.lock() = now + task.interval();
            }

            if task.is_background {
                if self.background_tx.send(Arc::clone(task)).is_err() {
                    warn!(
                        "Background lane is gone; stopping task '{}'",
                        task.name
                    );
                    task.set_state(TaskState::Stopped);
                    needs_prune = true;
                }
            } else {
                Self::run_task(task);
                Self::finish_run(task, last_run);
                if task.state() == TaskState::Stopped {
                    needs_prune = true;
                }
            }
        }

        if needs_prune {
            self.prune();
        }
    }

    fn foreground_loop(self: Arc<Self>) {
        while !self.shutdown.load(Ordering::Acquire) {
            self.poll_pass();
            thread::sleep(POLL_INTERVAL);
        }
    }

    fn background_loop(self: Arc<Self>, rx: Receiver<Arc<ScheduledTask>>) {
        loop {
            match rx.recv_timeout(POLL_INTERVAL) {
                Ok(task) => {
                    if task.state() == TaskState::Stopped {
                        // Stopped while waiting in the queue.
                        self.prune();
                        continue;
                    }
                    // The dispatching pass already consumed the repeat; a
                    // background task past its final repeat carries a zero
                    // counter here.
                    let last_run = !task.is_recurring
                        || task.max_repeats.load(Ordering::Acquire) == 0;
                    Self::run_task(&task);
                    Self::finish_run(&task, last_run);
                    if task.state() == TaskState::Stopped {
                        self.prune();
                    }
                }
                Err(RecvTimeoutError::Timeout) => {
                    if self.shutdown.load(Ordering::Acquire) {
                        break;
                    }
                }
                Err(RecvTimeoutError::Disconnected) => break,
            }
        }
    }
}

/// The dual-lane scheduler. One instance per server; tasks are registered
/// against it explicitly rather than through any process-wide registry.
pub struct Scheduler {
    inner: Arc<SchedulerInner>,
    foreground: Mutex<Option<JoinHandle<()>>>,
    background: Mutex<Option<JoinHandle<()>>>,
}

impl Scheduler {
    /// Starts both lane threads.
    pub fn new() -> Scheduler {
        let (background_tx, background_rx) = unbounded();
        let inner = Arc::new(SchedulerInner {
            tasks: Mutex::new(Vec::new()),
            snapshot: ArcSwap::from_pointee(Vec::new()),
            background_tx,
            shutdown: AtomicBool::new(false),
        });

        let foreground = {
            let inner = Arc::clone(&inner);
            thread::Builder::new()
                .name("sched-fg".to_string())
                .spawn(move || inner.foreground_loop())
        };
        let background = {
            let inner = Arc::clone(&inner);
            thread::Builder::new()
                .name("sched-bg".to_string())
                .spawn(move || inner.background_loop(background_rx))
        };

        Scheduler {
            inner,
            foreground: Mutex::new(foreground.ok()),
            background: Mutex::new(background.ok()),
        }
    }

    /// Arms a task (its delay counts from now) and adds it to the live set.
    /// Returns the shared handle; keep it to stop or retune the task later.
    pub fn register(&self, task: ScheduledTask) -> Arc<ScheduledTask> {
        let task = Arc::new(task);
        *task.next_time.lock() = Instant::now() + task.delay;

        if self.inner.shutdown.load(Ordering::Acquire) {
            warn!(
                "Scheduler is shutting down; task '{}' will not run",
                task.name
            );
            task.set_state(TaskState::Stopped);
            return task;
        }

        self.inner.tasks.lock().push(Arc::clone(&task));
        self.inner.publish();
        task
    }

    /// Cooperative cancel; see [`ScheduledTask::stop`].
    pub fn stop(&self, task: &ScheduledTask) {
        task.stop();
    }

    /// Number of live (not yet pruned) tasks.
    pub fn task_count(&self) -> usize {
        self.inner
            .tasks
            .lock()
            .iter()
            .filter(|t| t.state() != TaskState::Stopped)
            .count()
    }

    /// Stops every task, joins both lanes with a bounded wait, then sleeps a
    /// short grace period so in-flight network notifications get a chance to
    /// flush. Idempotent.
    pub fn shutdown(&self) {
        if self.inner.shutdown.swap(true, Ordering::AcqRel) {
            return;
        }
        info!("Scheduler shutting down");

        for task in self.inner.tasks.lock().iter() {
            task.stop();
        }

        Self::join_lane("foreground", self.foreground.lock().take());
        Self::join_lane("background", self.background.lock().take());

        thread::sleep(SHUTDOWN_NETWORK_GRACE);
    }

    fn join_lane(label: &str, handle: Option<JoinHandle<()>>) {
        let Some(handle) = handle else { return };
        let deadline = Instant::now() + SHUTDOWN_JOIN_WAIT;
        while !handle.is_finished() {
            if Instant::now() >= deadline {
                warn!("Scheduler {} lane did not stop within the shutdown wait", label);
                return;
            }
            thread::sleep(POLL_INTERVAL);
        }
        if handle.join().is_err() {
            error!("Scheduler {} lane thread panicked", label);
        }
    }
}

impl Default for Scheduler {
    fn default() -> Self {
        Scheduler::new()
    }
}

impl Drop for Scheduler {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    fn counter() -> Arc<AtomicUsize> {
        Arc::new(AtomicUsize::new(0))
    }

    #[test]
    fn test_run_once_fires_once_and_stops() {
        let scheduler = Scheduler::new();
        let count = counter();

        let task = {
            let count = Arc::clone(&count);
            scheduler.register(ScheduledTask::once(
                "one-shot",
                Duration::from_millis(20),
                move |_| {
                    count.fetch_add(1, Ordering::SeqCst);
                },
            ))
        };

        thread::sleep(Duration::from_millis(150));
        assert_eq!(count.load(Ordering::SeqCst), 1);
        assert_eq!(task.state(), TaskState::Stopped);
        assert_eq!(scheduler.task_count(), 0);
    }

    #[test]
    fn test_run_forever_until_stopped() {
        let scheduler = Scheduler::new();
        let count = counter();

        let task = {
            let count = Arc::clone(&count);
            scheduler.register(ScheduledTask::forever(
                "ticker",
                Duration::from_millis(20),
                move |_| {
                    count.fetch_add(1, Ordering::SeqCst);
                },
            ))
        };

        thread::sleep(Duration::from_millis(200));
        let before_stop = count.load(Ordering::SeqCst);
        assert!(before_stop >= 3, "expected >= 3 runs, got {}", before_stop);

        scheduler.stop(&task);
        thread::sleep(Duration::from_millis(80));
        let frozen = count.load(Ordering::SeqCst);
        thread::sleep(Duration::from_millis(80));
        assert_eq!(count.load(Ordering::SeqCst), frozen);
    }

    #[test]
    fn test_repeating_honors_repeat_count() {
        let scheduler = Scheduler::new();
        let count = counter();

        {
            let count = Arc::clone(&count);
            scheduler.register(ScheduledTask::repeating(
                "three-times",
                Duration::from_millis(10),
                Duration::from_millis(20),
                3,
                move |_| {
                    count.fetch_add(1, Ordering::SeqCst);
                },
            ));
        }

        thread::sleep(Duration::from_millis(300));
        assert_eq!(count.load(Ordering::SeqCst), 3);
        assert_eq!(scheduler.task_count(), 0);
    }

    #[test]
    fn test_fixed_spacing_between_runs() {
        let scheduler = Scheduler::new();
        let spans: Arc<Mutex<Vec<(Instant, Instant)>>> = Arc::new(Mutex::new(Vec::new()));
        let interval = Duration::from_millis(60);

        {
            let spans = Arc::clone(&spans);
            scheduler.register(ScheduledTask::forever("spacing", interval, move |_| {
                let started = Instant::now();
                thread::sleep(Duration::from_millis(25));
                spans.lock().push((started, Instant::now()));
            }));
        }

        thread::sleep(Duration::from_millis(400));
        let spans = spans.lock();
        assert!(spans.len() >= 3, "expected >= 3 runs, got {}", spans.len());
        for window in spans.windows(2) {
            let gap = window[1].0 - window[0].1;
            // Next time is computed after the body returns, so the gap from
            // run end to next run start is at least the interval.
            assert!(
                gap >= Duration::from_millis(55),
                "gap between runs was {:?}",
                gap
            );
        }
    }

    #[test]
    fn test_drift_corrected_cadence() {
        let scheduler = Scheduler::new();
        let starts: Arc<Mutex<Vec<Instant>>> = Arc::new(Mutex::new(Vec::new()));
        let interval = Duration::from_millis(80);

        {
            let starts = Arc::clone(&starts);
            scheduler.register(
                ScheduledTask::forever("cadence", interval, move |_| {
                    starts.lock().push(Instant::now());
                    thread::sleep(Duration::from_millis(40));
                })
                .drift_corrected(),
            );
        }

        thread::sleep(Duration::from_millis(500));
        let starts = starts.lock();
        assert!(starts.len() >= 3);
        // Fixed-spacing behavior would average >= 120ms between starts; the
        // drift-corrected cadence stays near the interval. Averaging keeps
        // the assertion robust against one slow poll.
        let total = *starts.last().unwrap() - starts[0];
        let average = total / (starts.len() as u32 - 1);
        assert!(
            average < Duration::from_millis(110),
            "average start spacing was {:?}",
            average
        );
    }

    #[test]
    fn test_panicking_task_is_isolated() {
        let scheduler = Scheduler::new();
        let healthy = counter();

        scheduler.register(ScheduledTask::forever(
            "faulty",
            Duration::from_millis(20),
            |_| panic!("task body failure"),
        ));
        {
            let healthy = Arc::clone(&healthy);
            scheduler.register(ScheduledTask::forever(
                "healthy",
                Duration::from_millis(20),
                move |_| {
                    healthy.fetch_add(1, Ordering::SeqCst);
                },
            ));
        }

        thread::sleep(Duration::from_millis(200));
        assert!(healthy.load(Ordering::SeqCst) >= 3);
    }

    #[test]
    fn test_background_task_does_not_stall_foreground() {
        let scheduler = Scheduler::new();
        let fast = counter();

        scheduler.register(
            ScheduledTask::once("slow-bg", Duration::ZERO, |_| {
                thread::sleep(Duration::from_millis(250));
            })
            .background(),
        );
        {
            let fast = Arc::clone(&fast);
            scheduler.register(ScheduledTask::forever(
                "fast-fg",
                Duration::from_millis(20),
                move |_| {
                    fast.fetch_add(1, Ordering::SeqCst);
                },
            ));
        }

        thread::sleep(Duration::from_millis(250));
        assert!(
            fast.load(Ordering::SeqCst) >= 5,
            "foreground lane stalled behind a background task"
        );
    }

    #[test]
    fn test_background_recurring_task_runs() {
        let scheduler = Scheduler::new();
        let count = counter();

        {
            let count = Arc::clone(&count);
            scheduler.register(
                ScheduledTask::forever("bg-ticker", Duration::from_millis(20), move |_| {
                    count.fetch_add(1, Ordering::SeqCst);
                })
                .background(),
            );
        }

        thread::sleep(Duration::from_millis(200));
        assert!(count.load(Ordering::SeqCst) >= 3);
    }

    #[test]
    fn test_callback_can_stop_itself() {
        let scheduler = Scheduler::new();
        let count = counter();

        {
            let count = Arc::clone(&count);
            scheduler.register(ScheduledTask::forever(
                "self-stopping",
                Duration::from_millis(15),
                move |task| {
                    if count.fetch_add(1, Ordering::SeqCst) + 1 >= 3 {
                        task.stop();
                    }
                },
            ));
        }

        thread::sleep(Duration::from_millis(250));
        assert_eq!(count.load(Ordering::SeqCst), 3);
        assert_eq!(scheduler.task_count(), 0);
    }

    #[test]
    fn test_callback_can_retune_interval() {
        let scheduler = Scheduler::new();
        let count = counter();

        {
            let count = Arc::clone(&count);
            scheduler.register(ScheduledTask::forever(
                "retuning",
                Duration::from_millis(10),
                move |task| {
                    count.fetch_add(1, Ordering::SeqCst);
                    task.set_interval(Duration::from_millis(200));
                },
            ));
        }

        thread::sleep(Duration::from_millis(150));
        // First run happens promptly, after which the stretched interval
        // keeps further runs rare.
        let runs = count.load(Ordering::SeqCst);
        assert!(runs >= 1 && runs <= 2, "got {} runs", runs);
    }

    #[test]
    fn test_shutdown_stops_everything() {
        let scheduler = Scheduler::new();
        let count = counter();

        {
            let count = Arc::clone(&count);
            scheduler.register(ScheduledTask::forever(
                "ticker",
                Duration::from_millis(20),
                move |_| {
                    count.fetch_add(1, Ordering::SeqCst);
                },
            ));
        }

        thread::sleep(Duration::from_millis(80));
        scheduler.shutdown();
        let frozen = count.load(Ordering::SeqCst);
        thread::sleep(Duration::from_millis(100));
        assert_eq!(count.load(Ordering::SeqCst), frozen);

        // Registering after shutdown is refused.
        let late = scheduler.register(ScheduledTask::once("late", Duration::ZERO, |_| {}));
        assert_eq!(late.state(), TaskState::Stopped);
    }
}
