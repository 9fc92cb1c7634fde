//! Per-process scheduler for match tickers and vote timeouts.
//!
//! Each task is keyed by what it is for, so there is at most one ticker and
//! one vote timeout per match in this process. Cancelling drops the task's
//! cancel sender; the task notices before its next firing but is never
//! interrupted mid-firing, so a cancel racing a firing either lets that
//! firing finish or stops it from starting.

use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use dashmap::DashMap;
use tokio::sync::oneshot;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, info};

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum TaskKey {
    Ticker(String),
    VoteTimeout(String),
}

impl fmt::Display for TaskKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Ticker(code) => write!(f, "ticker:{}", code),
            Self::VoteTimeout(code) => write!(f, "vote-timeout:{}", code),
        }
    }
}

/// What a repeating task wants after one firing
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskControl {
    Continue,
    Stop,
}

struct TaskSlot {
    generation: u64,
    // Dropping the sender is the cancel signal
    _cancel: oneshot::Sender<()>,
}

#[derive(Default)]
struct Inner {
    tasks: DashMap<TaskKey, TaskSlot>,
    next_generation: AtomicU64,
    closed: AtomicBool,
}

impl Inner {
    /// A finished task forgets itself unless it was already replaced
    fn finish(&self, key: &TaskKey, generation: u64) {
        self.tasks.remove_if(key, |_, slot| slot.generation == generation);
    }
}

#[derive(Clone, Default)]
pub struct Scheduler {
    inner: Arc<Inner>,
}

impl Scheduler {
    pub fn new() -> Self {
        Self::default()
    }

    fn register(&self, key: &TaskKey) -> Option<(u64, oneshot::Receiver<()>, Weak<Inner>)> {
        if self.inner.closed.load(Ordering::Acquire) {
            debug!(task = %key, "Scheduler is shut down, task ignored");
            return None;
        }
        let (cancel, cancelled) = oneshot::channel();
        let generation = self.inner.next_generation.fetch_add(1, Ordering::Relaxed);
        if self
            .inner
            .tasks
            .insert(key.clone(), TaskSlot { generation, _cancel: cancel })
            .is_some()
        {
            debug!(task = %key, "Replaced existing task");
        }
        Some((generation, cancelled, Arc::downgrade(&self.inner)))
    }

    /// Runs `job` every `period`, first after one full period, until it
    /// returns [`TaskControl::Stop`] or the key is cancelled. Replaces any
    /// task already scheduled under `key`.
    pub fn schedule_repeating<F, Fut>(&self, key: TaskKey, period: Duration, mut job: F)
    where
        F: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = TaskControl> + Send + 'static,
    {
        let Some((generation, mut cancelled, inner)) = self.register(&key) else {
            return;
        };

        tokio::spawn(async move {
            let mut ticker = interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

            loop {
                tokio::select! {
                    biased;
                    _ = &mut cancelled => {
                        debug!(task = %key, "Repeating task cancelled");
                        break;
                    }
                    _ = ticker.tick() => {
                        if job().await == TaskControl::Stop {
                            debug!(task = %key, "Repeating task stopped itself");
                            break;
                        }
                    }
                }
            }

            if let Some(inner) = inner.upgrade() {
                inner.finish(&key, generation);
            }
        });
    }

    /// Runs `job` once after `delay` unless the key is cancelled first.
    /// Replaces any task already scheduled under `key`.
    pub fn schedule_once<F, Fut>(&self, key: TaskKey, delay: Duration, job: F)
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let Some((generation, mut cancelled, inner)) = self.register(&key) else {
            return;
        };

        tokio::spawn(async move {
            tokio::select! {
                biased;
                _ = &mut cancelled => {
                    debug!(task = %key, "Delayed task cancelled");
                }
                _ = tokio::time::sleep(delay) => {
                    job().await;
                }
            }

            if let Some(inner) = inner.upgrade() {
                inner.finish(&key, generation);
            }
        });
    }

    /// Idempotent. Returns whether a task was pending.
    pub fn cancel(&self, key: &TaskKey) -> bool {
        let removed = self.inner.tasks.remove(key).is_some();
        if removed {
            debug!(task = %key, "Task cancelled");
        }
        removed
    }

    pub fn is_scheduled(&self, key: &TaskKey) -> bool {
        self.inner.tasks.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.inner.tasks.len()
    }

    pub fn count_where(&self, pred: impl Fn(&TaskKey) -> bool) -> usize {
        self.inner.tasks.iter().filter(|task| pred(task.key())).count()
    }

    /// Cancels everything and refuses new tasks
    pub fn shutdown(&self) {
        self.inner.closed.store(true, Ordering::Release);
        let pending = self.inner.tasks.len();
        self.inner.tasks.clear();
        info!(pending, "Scheduler drained");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    fn counter() -> Arc<AtomicUsize> {
        Arc::new(AtomicUsize::new(0))
    }

    #[tokio::test]
    async fn repeating_task_runs_until_it_stops_itself() {
        let scheduler = Scheduler::new();
        let runs = counter();
        let key = TaskKey::Ticker("AAAAAA".into());

        let seen = runs.clone();
        scheduler.schedule_repeating(key.clone(), Duration::from_millis(10), move || {
            let seen = seen.clone();
            async move {
                if seen.fetch_add(1, Ordering::SeqCst) + 1 >= 3 {
                    TaskControl::Stop
                } else {
                    TaskControl::Continue
                }
            }
        });
        assert!(scheduler.is_scheduled(&key));

        tokio::time::sleep(Duration::from_millis(150)).await;
        assert_eq!(runs.load(Ordering::SeqCst), 3);
        assert!(!scheduler.is_scheduled(&key));
    }

    #[tokio::test]
    async fn cancel_is_idempotent_and_stops_future_firings() {
        let scheduler = Scheduler::new();
        let runs = counter();
        let key = TaskKey::Ticker("AAAAAA".into());

        let seen = runs.clone();
        scheduler.schedule_repeating(key.clone(), Duration::from_millis(10), move || {
            let seen = seen.clone();
            async move {
                seen.fetch_add(1, Ordering::SeqCst);
                TaskControl::Continue
            }
        });
        tokio::time::sleep(Duration::from_millis(35)).await;

        assert!(scheduler.cancel(&key));
        assert!(!scheduler.cancel(&key));
        let after_cancel = runs.load(Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(50)).await;
        // at most one firing already in flight may still land
        assert!(runs.load(Ordering::SeqCst) <= after_cancel + 1);
        assert_eq!(scheduler.len(), 0);
    }

    #[tokio::test]
    async fn cancelled_delay_never_fires() {
        let scheduler = Scheduler::new();
        let runs = counter();
        let key = TaskKey::VoteTimeout("AAAAAA".into());

        let seen = runs.clone();
        scheduler.schedule_once(key.clone(), Duration::from_millis(30), move || async move {
            seen.fetch_add(1, Ordering::SeqCst);
        });
        assert!(scheduler.cancel(&key));

        tokio::time::sleep(Duration::from_millis(60)).await;
        assert_eq!(runs.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn rescheduling_replaces_the_old_task() {
        let scheduler = Scheduler::new();
        let first = counter();
        let second = counter();
        let key = TaskKey::VoteTimeout("AAAAAA".into());

        let seen = first.clone();
        scheduler.schedule_once(key.clone(), Duration::from_millis(20), move || async move {
            seen.fetch_add(1, Ordering::SeqCst);
        });
        let seen = second.clone();
        scheduler.schedule_once(key.clone(), Duration::from_millis(20), move || async move {
            seen.fetch_add(1, Ordering::SeqCst);
        });

        tokio::time::sleep(Duration::from_millis(60)).await;
        assert_eq!(first.load(Ordering::SeqCst), 0);
        assert_eq!(second.load(Ordering::SeqCst), 1);
        assert!(!scheduler.is_scheduled(&key));
    }

    #[tokio::test]
    async fn shutdown_drains_and_refuses_new_tasks() {
        let scheduler = Scheduler::new();
        let runs = counter();

        for code in ["A", "B", "C"] {
            let seen = runs.clone();
            scheduler.schedule_once(
                TaskKey::VoteTimeout(code.into()),
                Duration::from_millis(20),
                move || async move {
                    seen.fetch_add(1, Ordering::SeqCst);
                },
            );
        }
        assert_eq!(scheduler.len(), 3);

        scheduler.shutdown();
        let seen = runs.clone();
        scheduler.schedule_once(TaskKey::VoteTimeout("D".into()), Duration::ZERO, move || async move {
            seen.fetch_add(1, Ordering::SeqCst);
        });

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(runs.load(Ordering::SeqCst), 0);
        assert_eq!(scheduler.len(), 0);
    }
}
