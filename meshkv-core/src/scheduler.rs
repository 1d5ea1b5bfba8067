//! Delayed task execution.
//!
//! One worker thread drains a time-ordered queue. Tasks are keyed so a
//! store handle can coalesce and cancel its pending work: delayed syncs
//! and the periodic backup sweep both run here, keeping engine calls off
//! the caller's thread.

use std::collections::BinaryHeap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex, PoisonError};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

/// Work item accepted by the scheduler.
type Job = Box<dyn FnOnce() + Send>;

struct ScheduledTask {
    due: Instant,
    sequence: u64,
    key: u64,
    job: Job,
}

impl PartialEq for ScheduledTask {
    fn eq(&self, other: &Self) -> bool {
        self.due == other.due && self.sequence == other.sequence
    }
}

impl Eq for ScheduledTask {}

impl PartialOrd for ScheduledTask {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for ScheduledTask {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        // BinaryHeap is a max-heap; invert so the earliest deadline wins,
        // with submission order as the tiebreaker.
        other
            .due
            .cmp(&self.due)
            .then_with(|| other.sequence.cmp(&self.sequence))
    }
}

#[derive(Default)]
struct SchedulerState {
    queue: BinaryHeap<ScheduledTask>,
    shutdown: bool,
}

struct SchedulerShared {
    state: Mutex<SchedulerState>,
    wakeup: Condvar,
}

impl SchedulerShared {
    fn locked(&self) -> std::sync::MutexGuard<'_, SchedulerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Keyed delayed-task scheduler with a single worker thread.
pub struct TaskScheduler {
    shared: Arc<SchedulerShared>,
    sequence: AtomicU64,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl Default for TaskScheduler {
    fn default() -> Self {
        Self::new()
    }
}

impl TaskScheduler {
    /// Starts the scheduler and its worker thread.
    #[must_use]
    pub fn new() -> Self {
        let shared = Arc::new(SchedulerShared {
            state: Mutex::new(SchedulerState::default()),
            wakeup: Condvar::new(),
        });
        let worker_shared = Arc::clone(&shared);
        let worker = std::thread::Builder::new()
            .name("meshkv-scheduler".to_string())
            .spawn(move || Self::run(&worker_shared))
            .ok();
        Self {
            shared,
            sequence: AtomicU64::new(0),
            worker: Mutex::new(worker),
        }
    }

    fn run(shared: &SchedulerShared) {
        let mut state = shared.locked();
        loop {
            if state.shutdown {
                return;
            }
            let now = Instant::now();
            match state.queue.peek() {
                Some(task) if task.due <= now => {
                    if let Some(due_task) = state.queue.pop() {
                        drop(state);
                        (due_task.job)();
                        state = shared.locked();
                    }
                }
                Some(task) => {
                    let wait = task.due.saturating_duration_since(now);
                    state = shared
                        .wakeup
                        .wait_timeout(state, wait)
                        .unwrap_or_else(PoisonError::into_inner)
                        .0;
                }
                None => {
                    state = shared
                        .wakeup
                        .wait(state)
                        .unwrap_or_else(PoisonError::into_inner);
                }
            }
        }
    }

    /// Runs `job` after `delay`, tagged with `key` for later removal.
    pub fn schedule(&self, key: u64, delay: Duration, job: impl FnOnce() + Send + 'static) {
        let task = ScheduledTask {
            due: Instant::now() + delay,
            sequence: self.sequence.fetch_add(1, Ordering::Relaxed),
            key,
            job: Box::new(job),
        };
        self.shared.locked().queue.push(task);
        self.shared.wakeup.notify_one();
    }

    /// Drops every pending task tagged with `key`.
    ///
    /// A task already running is not interrupted.
    pub fn remove(&self, key: u64) {
        let mut state = self.shared.locked();
        let queue = std::mem::take(&mut state.queue);
        state.queue = queue.into_iter().filter(|task| task.key != key).collect();
    }

    /// Number of tasks currently waiting for their deadline.
    #[must_use]
    pub fn pending(&self) -> usize {
        self.shared.locked().queue.len()
    }
}

impl Drop for TaskScheduler {
    fn drop(&mut self) {
        self.shared.locked().shutdown = true;
        self.shared.wakeup.notify_all();
        let handle = self
            .worker
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(handle) = handle {
            let _ = handle.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;

    #[test]
    fn test_tasks_run_in_deadline_order() {
        let scheduler = TaskScheduler::new();
        let (sender, receiver) = mpsc::channel();

        let late = sender.clone();
        scheduler.schedule(1, Duration::from_millis(60), move || {
            late.send("late").expect("send");
        });
        scheduler.schedule(2, Duration::from_millis(5), move || {
            sender.send("early").expect("send");
        });

        assert_eq!(receiver.recv_timeout(Duration::from_secs(2)), Ok("early"));
        assert_eq!(receiver.recv_timeout(Duration::from_secs(2)), Ok("late"));
    }

    #[test]
    fn test_remove_drops_pending_tasks_by_key() {
        let scheduler = TaskScheduler::new();
        let (sender, receiver) = mpsc::channel();

        scheduler.schedule(7, Duration::from_millis(50), move || {
            sender.send(()).expect("send");
        });
        scheduler.remove(7);
        assert_eq!(scheduler.pending(), 0);
        assert!(receiver.recv_timeout(Duration::from_millis(200)).is_err());
    }
}
