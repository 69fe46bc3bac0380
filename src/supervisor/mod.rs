//! Supervision: unit crash handling, restart budget and pool termination.
//!
//! A crash is observed by the dying unit itself once the panic has been
//! caught at the top of its thread. It reports to the control path, which
//! resolves the lost task, decides between replacement and disabling the
//! slot, and fires the crash hooks after releasing the state lock.

mod budget;
pub mod hooks;

pub(crate) use budget::CrashHistory;
pub use hooks::{ShutdownReport, UnitCrash};

use crate::error::{Error, Result};
use crate::executor::{ExecutionUnit, PanicInfo, TaskError, UnitState};
use crate::pool::{Phase, PoolState, Shared};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

impl<P, R, E> Shared<P, R, E>
where
    P: Send + 'static,
    R: Send + 'static,
    E: Send + 'static,
{
    /// Called from the unit thread in `slot` after its run loop panicked.
    pub(crate) fn unit_crashed(self: &Arc<Self>, slot: usize, generation: u64, panic: PanicInfo) {
        let event = {
            let mut state = self.state.lock();
            let phase = state.phase;
            let entry = &mut state.slots[slot];

            if entry.unit.generation != generation {
                debug!(slot, generation, "crash report from a replaced unit");
                return;
            }

            let lost = entry.unit.crash();
            let task_id = lost.as_ref().map(|in_flight| in_flight.responder.task_id());
            if let Some(in_flight) = lost {
                in_flight.responder.resolve(Err(TaskError::WorkerCrashed));
                self.metrics.record_crash();
            }

            warn!(
                slot,
                generation,
                task_id = ?task_id.map(|id| id.as_u64()),
                message = %panic.message,
                "execution unit crashed"
            );

            let mut event = UnitCrash {
                slot,
                generation,
                task_id,
                message: panic.message,
                replaced: false,
                disabled: false,
            };

            if phase == Phase::Closed {
                entry.unit.mark_exited();
                self.drained.notify_all();
            } else if entry
                .crashes
                .record(Instant::now(), &self.config.restart_budget)
            {
                entry.unit = ExecutionUnit::disabled(slot, generation);
                error!(
                    slot,
                    crashes = entry.crashes.len(),
                    max_restarts = self.config.restart_budget.max_restarts,
                    window_ms = self.config.restart_budget.window.as_millis() as u64,
                    "restart budget exhausted; slot disabled"
                );
                event.disabled = true;
                self.drained.notify_all();
            } else {
                match self.respawn(&mut state, slot) {
                    Ok(()) => event.replaced = true,
                    Err(err) => {
                        error!(slot, error = %err, "failed to replace crashed unit; slot disabled");
                        state.slots[slot].unit = ExecutionUnit::disabled(slot, generation);
                        event.disabled = true;
                    }
                }
                // a draining pool may be waiting on this slot
                self.drained.notify_all();
            }

            event
        };

        self.hooks.unit_crashed(&event);
    }

    /// Put a fresh unit into `slot` with the next generation.
    fn respawn(self: &Arc<Self>, state: &mut PoolState<P, R, E>, slot: usize) -> Result<()> {
        let generation = state.slots[slot].unit.generation + 1;
        let unit = ExecutionUnit::spawn(self, slot, generation)?;

        let entry = &mut state.slots[slot];
        entry.unit = unit;
        entry.restarts += 1;
        self.metrics.record_restart();
        info!(slot, generation, restarts = entry.restarts, "execution unit replaced");

        state.make_available(slot);
        Ok(())
    }

    pub(crate) fn restore_disabled(self: &Arc<Self>) -> Result<usize> {
        let mut state = self.state.lock();
        if state.phase != Phase::Running {
            return Err(Error::PoolClosed);
        }

        let disabled: Vec<usize> = state
            .slots
            .iter()
            .enumerate()
            .filter(|(_, entry)| entry.unit.state == UnitState::Disabled)
            .map(|(slot, _)| slot)
            .collect();

        for &slot in &disabled {
            state.slots[slot].crashes.clear();
            self.respawn(&mut state, slot)?;
        }

        if !disabled.is_empty() {
            info!(restored = disabled.len(), "disabled slots restored");
        }
        Ok(disabled.len())
    }
}

impl<P, R, E> Shared<P, R, E> {
    /// Stop the pool and resolve everything still pending.
    ///
    /// Only the first caller performs the shutdown. Later callers block until
    /// it has finished and receive the same report.
    pub(crate) fn terminate(&self, graceful: bool, drain_timeout: Duration) -> ShutdownReport {
        let started = Instant::now();
        let mut state = self.state.lock();

        if state.phase != Phase::Running {
            loop {
                if let Some(report) = state.report.as_ref() {
                    return report.clone();
                }
                self.drained.wait(&mut state);
            }
        }

        state.phase = Phase::Draining;
        info!(
            graceful,
            busy = state.busy_count(),
            queued = state.queue.len(),
            "Shutting down worker pool"
        );

        // idle units exit as soon as their inbox closes
        state.idle.clear();
        for entry in state.slots.iter_mut() {
            if !entry.unit.is_busy() {
                entry.unit.stop();
            }
        }

        if graceful {
            let deadline = started + drain_timeout;
            while state.busy_count() > 0 {
                if self.drained.wait_until(&mut state, deadline).timed_out() {
                    warn!(
                        busy = state.busy_count(),
                        queued = state.queue.len(),
                        drain_timeout_ms = drain_timeout.as_millis() as u64,
                        "drain timeout expired"
                    );
                    break;
                }
            }
        }

        let aborted = abort_pending(&mut state, graceful);
        self.metrics.record_aborted(aborted);

        state.phase = Phase::Closed;
        let joinable: Vec<_> = state
            .slots
            .iter_mut()
            .filter_map(|entry| {
                entry.unit.stop();
                entry.unit.take_joinable()
            })
            .collect();

        let report = ShutdownReport {
            graceful,
            drained: aborted == 0,
            aborted,
            elapsed: started.elapsed(),
        };
        state.report = Some(report.clone());
        self.drained.notify_all();
        drop(state);

        let current = thread::current().id();
        for handle in joinable {
            // a runner may shut the pool down from its own unit
            if handle.thread().id() == current {
                continue;
            }
            if handle.join().is_err() {
                debug!("unit thread ended with a panic");
            }
        }

        info!(
            graceful,
            drained = report.drained,
            aborted,
            elapsed_ms = report.elapsed.as_millis() as u64,
            "Worker pool shut down"
        );

        self.hooks.shutdown_complete(&report);
        report
    }
}

/// Resolve every in-flight and queued task. Busy units are abandoned.
fn abort_pending<P, R, E>(state: &mut PoolState<P, R, E>, graceful: bool) -> usize {
    let reason = || {
        if graceful {
            TaskError::ShutdownTimeout
        } else {
            TaskError::Terminated
        }
    };
    let mut aborted = 0;

    for entry in state.slots.iter_mut() {
        if let Some(in_flight) = entry.unit.abandon() {
            debug!(
                slot = entry.unit.slot,
                task_id = %in_flight.responder.task_id(),
                "abandoning busy unit"
            );
            in_flight.responder.resolve(Err(reason()));
            aborted += 1;
        }
    }

    for job in state.queue.drain(..) {
        job.responder.resolve(Err(reason()));
        aborted += 1;
    }

    aborted
}
