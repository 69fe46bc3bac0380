//! The worker pool: a fixed slot table, a FIFO queue and the dispatch path.
//!
//! # Architecture
//!
//! ```text
//!   submit() ──┐                               ┌── TaskHandle (Future)
//!              ▼                               │
//!      ┌──────────────── PoolState (one Mutex) ─────────────┐
//!      │  idle: [slot..]   queue: [job, job, ...]            │
//!      │  slots: [unit 0] [unit 1] ... [unit N-1]            │
//!      └──────┬────────────────▲───────────────────▲─────────┘
//!             │ inbox          │ complete()        │ unit_crashed()
//!             ▼                │                   │
//!      ┌─────────────┐   ┌─────┴───────┐     ┌─────┴──────┐
//!      │ unit thread │ … │ unit thread │     │ supervisor │
//!      └─────────────┘   └─────────────┘     └────────────┘
//! ```
//!
//! Every dispatch, completion, crash and shutdown decision happens while
//! holding the single state lock. Only the runner itself executes outside it,
//! in parallel on the unit threads.

mod health;

pub use health::{PoolHealth, PoolStatus, UnitSnapshot};

use crate::config::Config;
use crate::error::{Error, Result};
use crate::executor::{
    result_channel, ExecutionUnit, Job, Next, Outcome, Task, TaskHandle, TaskId, TaskIdGen,
    UnitState,
};
use crate::supervisor::hooks::{Hooks, ShutdownReport, UnitCrash};
use crate::supervisor::CrashHistory;
use crate::telemetry::{Metrics, MetricsSnapshot};
use parking_lot::{Condvar, Mutex};
use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;
use tracing::{debug, info, trace, warn};

pub(crate) type Runner<P, R, E> = Arc<dyn Fn(P) -> std::result::Result<R, E> + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Phase {
    Running,
    Draining,
    Closed,
}

pub(crate) struct Slot<P, R, E> {
    pub(crate) unit: ExecutionUnit<P, R, E>,
    pub(crate) crashes: CrashHistory,
    pub(crate) restarts: u32,
    pub(crate) tasks_completed: u64,
}

impl<P, R, E> Slot<P, R, E> {
    fn new(unit: ExecutionUnit<P, R, E>) -> Self {
        Self {
            unit,
            crashes: CrashHistory::default(),
            restarts: 0,
            tasks_completed: 0,
        }
    }
}

pub(crate) struct PoolState<P, R, E> {
    pub(crate) slots: Vec<Slot<P, R, E>>,
    /// Slots whose unit is waiting on its inbox.
    pub(crate) idle: VecDeque<usize>,
    pub(crate) queue: VecDeque<Job<P, R, E>>,
    pub(crate) phase: Phase,
    pub(crate) report: Option<ShutdownReport>,
}

impl<P, R, E> PoolState<P, R, E> {
    fn new(capacity: usize) -> Self {
        Self {
            slots: Vec::with_capacity(capacity),
            idle: VecDeque::with_capacity(capacity),
            queue: VecDeque::new(),
            phase: Phase::Running,
            report: None,
        }
    }

    /// Hand `job` to an idle unit, or queue it.
    ///
    /// Nothing may overtake an already queued job, so an idle unit is only
    /// used while the queue is empty.
    pub(crate) fn dispatch(&mut self, mut job: Job<P, R, E>) {
        if self.queue.is_empty() {
            while let Some(idx) = self.idle.pop_front() {
                let task_id = job.task.id();
                match self.slots[idx].unit.assign(job) {
                    Ok(()) => {
                        trace!(slot = idx, %task_id, "task dispatched");
                        return;
                    }
                    Err(rejected) => {
                        warn!(slot = idx, error = %rejected.error, "idle unit refused a task");
                        job = rejected.job;
                    }
                }
            }
        }
        trace!(task_id = %job.task.id(), depth = self.queue.len() + 1, "task queued");
        self.queue.push_back(job);
    }

    /// A unit in `idx` is ready for work that must arrive through its inbox:
    /// either the queue head or, if the queue is empty, it joins the idle set.
    /// While draining, a unit with nothing to take is stopped instead.
    pub(crate) fn make_available(&mut self, idx: usize) {
        self.slots[idx].unit.park();
        if self.queue.is_empty() && self.phase != Phase::Running {
            self.slots[idx].unit.stop();
            return;
        }
        if let Some(job) = self.queue.pop_front() {
            match self.slots[idx].unit.assign(job) {
                Ok(()) => return,
                Err(rejected) => {
                    warn!(slot = idx, error = %rejected.error, "fresh unit refused a task");
                    self.queue.push_front(rejected.job);
                    return;
                }
            }
        }
        self.idle.push_back(idx);
    }

    pub(crate) fn busy_count(&self) -> usize {
        self.slots.iter().filter(|s| s.unit.is_busy()).count()
    }

    pub(crate) fn disabled_count(&self) -> usize {
        self.slots
            .iter()
            .filter(|s| s.unit.state == UnitState::Disabled)
            .count()
    }
}

pub(crate) struct Shared<P, R, E> {
    pub(crate) config: Config,
    pub(crate) capacity: usize,
    pub(crate) runner: Runner<P, R, E>,
    pub(crate) state: Mutex<PoolState<P, R, E>>,
    /// Signalled whenever a unit stops being busy outside the Running phase,
    /// and once the pool is closed.
    pub(crate) drained: Condvar,
    pub(crate) hooks: Hooks,
    pub(crate) metrics: Metrics,
    ids: TaskIdGen,
}

impl<P, R, E> Shared<P, R, E>
where
    P: Send + 'static,
    R: Send + 'static,
    E: Send + 'static,
{
    /// Record a finished task and decide what the reporting unit does next.
    fn start_units(self: &Arc<Self>) -> Result<()> {
        let mut state = self.state.lock();
        for idx in 0..self.capacity {
            match ExecutionUnit::spawn(self, idx, 0) {
                Ok(unit) => {
                    state.slots.push(Slot::new(unit));
                    state.idle.push_back(idx);
                }
                Err(err) => {
                    // already running units see their inbox close and exit
                    for slot in state.slots.iter_mut() {
                        slot.unit.stop();
                    }
                    state.idle.clear();
                    state.phase = Phase::Closed;
                    return Err(err);
                }
            }
        }
        Ok(())
    }

    pub(crate) fn complete(
        &self,
        idx: usize,
        generation: u64,
        task_id: TaskId,
        outcome: Outcome<R, E>,
    ) -> Next<P> {
        let mut state = self.state.lock();
        let phase = state.phase;
        let slot = &mut state.slots[idx];

        if slot.unit.generation != generation {
            debug!(slot = idx, generation, %task_id, "stale unit reported; exiting");
            return Next::Exit;
        }

        match slot.unit.finish(task_id) {
            Some(in_flight) => {
                self.metrics
                    .record_completion(&outcome, in_flight.started_at.elapsed());
                slot.tasks_completed += 1;
                in_flight.responder.resolve(outcome);
            }
            None => {
                // already resolved by a forced shutdown
                debug!(slot = idx, %task_id, "discarding late result");
            }
        }

        if phase == Phase::Closed || slot.unit.state == UnitState::Terminating {
            slot.unit.mark_exited();
            self.drained.notify_all();
            return Next::Exit;
        }

        // queue head goes to this unit before it becomes visible as idle
        if let Some(job) = state.queue.pop_front() {
            trace!(slot = idx, task_id = %job.task.id(), "dispatching queued task");
            let task = state.slots[idx].unit.take_inline(job);
            return Next::Run(task);
        }

        if phase == Phase::Draining {
            state.slots[idx].unit.mark_exited();
            self.drained.notify_all();
            return Next::Exit;
        }

        state.slots[idx].unit.park();
        state.idle.push_back(idx);
        Next::Wait
    }
}

/// A fixed-size pool of supervised execution units.
///
/// # Example
///
/// ```no_run
/// use shepherd::WorkerPool;
///
/// let pool = WorkerPool::create(2, |n: u64| -> Result<u64, String> {
///     if n == 0 {
///         return Err("zero".to_string());
///     }
///     Ok(n * 2)
/// })
/// .unwrap();
///
/// let handle = pool.submit(21).unwrap();
/// assert_eq!(handle.wait().outcome, Ok(42));
///
/// pool.shutdown();
/// ```
pub struct WorkerPool<P, R, E> {
    shared: Arc<Shared<P, R, E>>,
}

impl<P, R, E> WorkerPool<P, R, E>
where
    P: Send + 'static,
    R: Send + 'static,
    E: Send + 'static,
{
    /// Create a pool of `capacity` units with default settings otherwise.
    pub fn create<F>(capacity: usize, runner: F) -> Result<Self>
    where
        F: Fn(P) -> std::result::Result<R, E> + Send + Sync + 'static,
    {
        let config = Config::builder().capacity(capacity).build()?;
        Self::new(config, runner)
    }

    pub fn new<F>(config: Config, runner: F) -> Result<Self>
    where
        F: Fn(P) -> std::result::Result<R, E> + Send + Sync + 'static,
    {
        config.validate()?;
        let capacity = config.unit_count();

        info!(
            capacity,
            drain_timeout_ms = config.drain_timeout.as_millis() as u64,
            max_restarts = config.restart_budget.max_restarts,
            restart_window_ms = config.restart_budget.window.as_millis() as u64,
            "Initializing worker pool"
        );

        let shared = Arc::new(Shared {
            config,
            capacity,
            runner: Arc::new(runner),
            state: Mutex::new(PoolState::new(capacity)),
            drained: Condvar::new(),
            hooks: Hooks::default(),
            metrics: Metrics::new(),
            ids: TaskIdGen::new(),
        });

        shared.start_units()?;

        Ok(Self { shared })
    }

    /// Submit a payload for execution.
    ///
    /// Fails immediately with [`Error::PoolClosed`] once shutdown has begun.
    pub fn submit(&self, payload: P) -> Result<TaskHandle<R, E>> {
        let mut state = self.shared.state.lock();
        if state.phase != Phase::Running {
            return Err(Error::PoolClosed);
        }
        Ok(self.enqueue(&mut state, payload))
    }

    /// Submit several payloads at once. They are dispatched in iteration order
    /// and no other submission can interleave with them.
    pub fn submit_batch<I>(&self, payloads: I) -> Result<Vec<TaskHandle<R, E>>>
    where
        I: IntoIterator<Item = P>,
    {
        let mut state = self.shared.state.lock();
        if state.phase != Phase::Running {
            return Err(Error::PoolClosed);
        }
        Ok(payloads
            .into_iter()
            .map(|payload| self.enqueue(&mut state, payload))
            .collect())
    }

    fn enqueue(&self, state: &mut PoolState<P, R, E>, payload: P) -> TaskHandle<R, E> {
        let task = Task::new(self.shared.ids.next(), payload);
        let (responder, handle) = result_channel(task.id());
        self.shared.metrics.record_submit();
        state.dispatch(Job { task, responder });
        handle
    }

    /// Register a callback for unit crashes. Runs on the crashed unit's thread.
    pub fn on_unit_crash<F>(&self, callback: F)
    where
        F: Fn(&UnitCrash) + Send + Sync + 'static,
    {
        self.shared.hooks.on_unit_crash(Arc::new(callback));
    }

    /// Register a callback for the end of shutdown. Runs on the thread that
    /// performed the shutdown.
    pub fn on_shutdown_complete<F>(&self, callback: F)
    where
        F: Fn(&ShutdownReport) + Send + Sync + 'static,
    {
        self.shared.hooks.on_shutdown_complete(Arc::new(callback));
    }

    /// Put every disabled slot back into service with a fresh unit and an
    /// empty crash history. Returns how many slots were restored.
    pub fn restore_disabled(&self) -> Result<usize> {
        self.shared.restore_disabled()
    }

    /// Graceful shutdown bounded by the configured drain timeout.
    pub fn shutdown(&self) -> ShutdownReport {
        self.terminate(true)
    }

    /// Stop the pool.
    ///
    /// `graceful = true` lets in-flight and queued tasks finish until the
    /// drain timeout, then aborts the rest with `ShutdownTimeout`.
    /// `graceful = false` aborts everything at once with `Terminated`.
    /// Calling this again returns the first report.
    pub fn terminate(&self, graceful: bool) -> ShutdownReport {
        self.shared.terminate(graceful, self.shared.config.drain_timeout)
    }

    /// Graceful shutdown with an explicit drain timeout.
    pub fn shutdown_timeout(&self, drain_timeout: std::time::Duration) -> ShutdownReport {
        self.shared.terminate(true, drain_timeout)
    }
}

impl<P, R, E> WorkerPool<P, R, E> {
    /// Configured number of slots.
    pub fn size(&self) -> usize {
        self.shared.capacity
    }

    pub fn queue_depth(&self) -> usize {
        self.shared.state.lock().queue.len()
    }

    pub fn idle_count(&self) -> usize {
        self.shared.state.lock().idle.len()
    }

    pub fn is_closed(&self) -> bool {
        self.shared.state.lock().phase != Phase::Running
    }

    pub fn config(&self) -> &Config {
        &self.shared.config
    }

    pub fn health(&self) -> PoolHealth {
        let state = self.shared.state.lock();
        let degraded_slots = state.disabled_count();
        let status = match state.phase {
            Phase::Closed => PoolStatus::Closed,
            Phase::Draining => PoolStatus::Draining,
            Phase::Running if degraded_slots > 0 => PoolStatus::Degraded,
            Phase::Running => PoolStatus::Healthy,
        };

        PoolHealth {
            capacity: self.shared.capacity,
            live: self.shared.capacity - degraded_slots,
            idle: state.idle.len(),
            busy: state.busy_count(),
            queued: state.queue.len(),
            degraded_slots,
            status,
        }
    }

    pub fn units(&self) -> Vec<UnitSnapshot> {
        let state = self.shared.state.lock();
        state
            .slots
            .iter()
            .enumerate()
            .map(|(slot, s)| UnitSnapshot {
                slot,
                generation: s.unit.generation,
                state: s.unit.state,
                current_task: s.unit.current_task(),
                tasks_completed: s.tasks_completed,
                restarts: s.restarts,
                recent_crashes: s.crashes.len(),
            })
            .collect()
    }

    pub fn metrics(&self) -> MetricsSnapshot {
        self.shared.metrics.snapshot()
    }
}

impl<P, R, E> Drop for WorkerPool<P, R, E> {
    fn drop(&mut self) {
        let drain_timeout = self.shared.config.drain_timeout;
        self.shared.terminate(true, drain_timeout);
    }
}

impl<P, R, E> fmt::Debug for WorkerPool<P, R, E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkerPool")
            .field("capacity", &self.shared.capacity)
            .field("config", &self.shared.config)
            .finish()
    }
}
