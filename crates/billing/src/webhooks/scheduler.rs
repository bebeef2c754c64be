//! Delayed task execution
//!
//! Webhook re-attempts are run through a [`TaskScheduler`] so that tests can
//! step through backoff schedules without sleeping.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use parking_lot::Mutex;

use crate::clock::ManualClock;

pub type ScheduledTask = BoxFuture<'static, ()>;

/// Cancels a scheduled task that has not started yet
#[derive(Debug, Clone)]
pub struct CancelHandle {
    cancelled: Arc<AtomicBool>,
    abort: Option<tokio::task::AbortHandle>,
}

impl CancelHandle {
    fn new(abort: Option<tokio::task::AbortHandle>) -> Self {
        Self {
            cancelled: Arc::new(AtomicBool::new(false)),
            abort,
        }
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
        if let Some(abort) = &self.abort {
            abort.abort();
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }
}

pub trait TaskScheduler: Send + Sync {
    /// Run `task` once after `delay` unless cancelled first
    fn schedule_after(&self, delay: Duration, task: ScheduledTask) -> CancelHandle;
}

/// Spawns each task on the current tokio runtime
#[derive(Debug, Clone, Copy, Default)]
pub struct TokioTaskScheduler;

impl TaskScheduler for TokioTaskScheduler {
    fn schedule_after(&self, delay: Duration, task: ScheduledTask) -> CancelHandle {
        let cancelled = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&cancelled);
        let handle = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if !flag.load(Ordering::SeqCst) {
                task.await;
            }
        });
        CancelHandle {
            cancelled,
            abort: Some(handle.abort_handle()),
        }
    }
}

struct PendingTask {
    due: Duration,
    delay: Duration,
    seq: u64,
    handle: CancelHandle,
    task: ScheduledTask,
}

#[derive(Default)]
struct ManualState {
    elapsed: Duration,
    next_seq: u64,
    pending: Vec<PendingTask>,
}

/// Scheduler for tests: tasks only run when [`ManualTaskScheduler::run_next`] is called.
///
/// Virtual time starts at zero and jumps to each task's due time as it runs.
/// With [`ManualTaskScheduler::with_clock`] the attached clock is advanced by
/// the same amount.
#[derive(Clone, Default)]
pub struct ManualTaskScheduler {
    state: Arc<Mutex<ManualState>>,
    clock: Option<ManualClock>,
}

impl ManualTaskScheduler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_clock(mut self, clock: ManualClock) -> Self {
        self.clock = Some(clock);
        self
    }

    /// Delays of tasks still waiting to run, in scheduling order
    pub fn pending_delays(&self) -> Vec<Duration> {
        let state = self.state.lock();
        let mut pending: Vec<&PendingTask> = state
            .pending
            .iter()
            .filter(|p| !p.handle.is_cancelled())
            .collect();
        pending.sort_by_key(|p| p.seq);
        pending.iter().map(|p| p.delay).collect()
    }

    pub fn pending_count(&self) -> usize {
        self.state
            .lock()
            .pending
            .iter()
            .filter(|p| !p.handle.is_cancelled())
            .count()
    }

    /// Run the earliest due task; returns the delay it was scheduled with
    pub async fn run_next(&self) -> Option<Duration> {
        let next = {
            let mut state = self.state.lock();
            state.pending.retain(|p| !p.handle.is_cancelled());
            let index = state
                .pending
                .iter()
                .enumerate()
                .min_by_key(|(_, p)| (p.due, p.seq))
                .map(|(i, _)| i)?;
            let next = state.pending.remove(index);
            let skipped = next.due.saturating_sub(state.elapsed);
            state.elapsed = state.elapsed.max(next.due);
            (next, skipped)
        };

        let (next, skipped) = next;
        if let Some(clock) = &self.clock {
            clock.advance(skipped);
        }
        next.task.await;
        Some(next.delay)
    }

    /// Run tasks until none are pending; returns the delays in execution order
    pub async fn run_all(&self) -> Vec<Duration> {
        let mut delays = Vec::new();
        while let Some(delay) = self.run_next().await {
            delays.push(delay);
        }
        delays
    }
}

impl TaskScheduler for ManualTaskScheduler {
    fn schedule_after(&self, delay: Duration, task: ScheduledTask) -> CancelHandle {
        let handle = CancelHandle::new(None);
        let mut state = self.state.lock();
        let seq = state.next_seq;
        state.next_seq += 1;
        let due = state.elapsed + delay;
        state.pending.push(PendingTask {
            due,
            delay,
            seq,
            handle: handle.clone(),
            task,
        });
        handle
    }
}
