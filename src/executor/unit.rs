// execution unit: one OS thread, one task at a time
use super::panic_handler::{run_contained, PanicInfo};
use super::task::{Outcome, Responder, Task, TaskError, TaskId};
use crate::error::{Error, Result};
use crate::pool::Shared;
use crossbeam_channel::{bounded, Receiver, Sender, TrySendError};
use serde::Serialize;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Instant;
use tracing::{debug, trace, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum UnitState {
    Idle,
    Busy,
    Crashed,
    /// Told to stop, or abandoned by a forced shutdown.
    Terminating,
    Exited,
    /// Crashed too often; no longer replaced.
    Disabled,
}

/// A task together with the sender that resolves it.
pub(crate) struct Job<P, R, E> {
    pub(crate) task: Task<P>,
    pub(crate) responder: Responder<R, E>,
}

/// A job the unit could not take.
pub(crate) struct Rejected<P, R, E> {
    pub(crate) error: Error,
    pub(crate) job: Job<P, R, E>,
}

pub(crate) struct InFlight<R, E> {
    pub(crate) responder: Responder<R, E>,
    pub(crate) started_at: Instant,
}

/// What a unit does after reporting a completion.
pub(crate) enum Next<P> {
    Run(Task<P>),
    Wait,
    Exit,
}

/// Control-side record of one execution unit.
///
/// Only the pool's control path touches this; the unit thread sees nothing
/// but its inbox.
pub(crate) struct ExecutionUnit<P, R, E> {
    pub(crate) slot: usize,
    pub(crate) generation: u64,
    pub(crate) state: UnitState,
    inbox: Option<Sender<Task<P>>>,
    thread: Option<JoinHandle<()>>,
    current: Option<InFlight<R, E>>,
    abandoned: bool,
}

impl<P, R, E> ExecutionUnit<P, R, E>
where
    P: Send + 'static,
    R: Send + 'static,
    E: Send + 'static,
{
    pub(crate) fn spawn(shared: &Arc<Shared<P, R, E>>, slot: usize, generation: u64) -> Result<Self> {
        let config = &shared.config;
        // capacity 1: a second assignment while one is pending is a bug
        let (tx, rx) = bounded(1);
        let name = format!("{}-{}", config.thread_name_prefix, slot);

        let mut builder = thread::Builder::new().name(name);
        if let Some(stack_size) = config.stack_size {
            builder = builder.stack_size(stack_size);
        }

        let shared_clone = Arc::clone(shared);
        let thread = builder
            .spawn(move || unit_main(shared_clone, slot, generation, rx))
            .map_err(|source| Error::Spawn { slot, source })?;

        debug!(slot, generation, "execution unit started");

        Ok(Self {
            slot,
            generation,
            state: UnitState::Idle,
            inbox: Some(tx),
            thread: Some(thread),
            current: None,
            abandoned: false,
        })
    }
}

impl<P, R, E> ExecutionUnit<P, R, E> {
    /// Placeholder for a slot whose unit could not be created.
    pub(crate) fn disabled(slot: usize, generation: u64) -> Self {
        Self {
            slot,
            generation,
            state: UnitState::Disabled,
            inbox: None,
            thread: None,
            current: None,
            abandoned: false,
        }
    }

    pub(crate) fn is_busy(&self) -> bool {
        self.current.is_some()
    }

    pub(crate) fn current_task(&self) -> Option<TaskId> {
        self.current.as_ref().map(|f| f.responder.task_id())
    }

    /// Hand a job to an idle unit through its inbox.
    pub(crate) fn assign(&mut self, job: Job<P, R, E>) -> std::result::Result<(), Rejected<P, R, E>> {
        if self.is_busy() || self.state != UnitState::Idle {
            return Err(Rejected {
                error: Error::UnitBusy(self.slot),
                job,
            });
        }
        let inbox = match self.inbox.as_ref() {
            Some(inbox) => inbox,
            None => {
                return Err(Rejected {
                    error: Error::UnitExited(self.slot),
                    job,
                })
            }
        };

        let Job { task, responder } = job;
        match inbox.try_send(task) {
            Ok(()) => {
                self.begin(responder);
                Ok(())
            }
            Err(TrySendError::Full(task)) => Err(Rejected {
                error: Error::UnitBusy(self.slot),
                job: Job { task, responder },
            }),
            Err(TrySendError::Disconnected(task)) => Err(Rejected {
                error: Error::UnitExited(self.slot),
                job: Job { task, responder },
            }),
        }
    }

    /// Record a job the unit thread will run inline, returning its task.
    pub(crate) fn take_inline(&mut self, job: Job<P, R, E>) -> Task<P> {
        let Job { task, responder } = job;
        self.begin(responder);
        task
    }

    fn begin(&mut self, responder: Responder<R, E>) {
        self.current = Some(InFlight {
            responder,
            started_at: Instant::now(),
        });
        self.state = UnitState::Busy;
    }

    /// Take the in-flight record if it still belongs to `task_id`.
    pub(crate) fn finish(&mut self, task_id: TaskId) -> Option<InFlight<R, E>> {
        if self.current_task() != Some(task_id) {
            return None;
        }
        self.current.take()
    }

    /// Mark the unit idle again.
    pub(crate) fn park(&mut self) {
        self.state = UnitState::Idle;
    }

    /// Graceful stop: the thread exits once its inbox is drained.
    pub(crate) fn stop(&mut self) {
        self.inbox = None;
        if self.state == UnitState::Idle {
            self.state = UnitState::Terminating;
        }
    }

    /// Forced stop. The thread is detached and whatever it produces later is
    /// discarded. Returns the task it was running, if any.
    pub(crate) fn abandon(&mut self) -> Option<InFlight<R, E>> {
        let current = self.current.take();
        if current.is_some() {
            self.abandoned = true;
            self.state = UnitState::Terminating;
            self.inbox = None;
            self.thread = None;
        }
        current
    }

    /// The unit's thread died. Returns the task it was running, if any.
    pub(crate) fn crash(&mut self) -> Option<InFlight<R, E>> {
        self.state = UnitState::Crashed;
        self.inbox = None;
        // the dying thread is the caller; dropping the handle detaches it
        self.thread = None;
        self.current.take()
    }

    pub(crate) fn mark_exited(&mut self) {
        self.state = UnitState::Exited;
        self.inbox = None;
    }

    /// Thread handle to join on shutdown, unless the unit was abandoned.
    pub(crate) fn take_joinable(&mut self) -> Option<JoinHandle<()>> {
        if self.abandoned {
            return None;
        }
        self.thread.take()
    }
}

fn unit_main<P, R, E>(shared: Arc<Shared<P, R, E>>, slot: usize, generation: u64, inbox: Receiver<Task<P>>)
where
    P: Send + 'static,
    R: Send + 'static,
    E: Send + 'static,
{
    // A panic that escapes the loop is this unit's crash. Catching it here
    // lets the supervisor observe the exit from a thread that is no longer
    // unwinding.
    let exit = catch_unwind(AssertUnwindSafe(|| run_loop(&shared, slot, generation, &inbox)));

    match exit {
        Ok(()) => trace!(slot, generation, "execution unit exited"),
        Err(payload) => {
            let info = PanicInfo::from_payload(&*payload);
            shared.unit_crashed(slot, generation, info);
        }
    }
}

fn run_loop<P, R, E>(shared: &Arc<Shared<P, R, E>>, slot: usize, generation: u64, inbox: &Receiver<Task<P>>)
where
    P: Send + 'static,
    R: Send + 'static,
    E: Send + 'static,
{
    // recv fails once the control path drops our sender
    while let Ok(task) = inbox.recv() {
        let mut next = Some(task);

        while let Some(task) = next.take() {
            let task_id = task.id();
            let outcome = execute(shared, slot, task);

            match shared.complete(slot, generation, task_id, outcome) {
                Next::Run(task) => next = Some(task),
                Next::Wait => {}
                Next::Exit => return,
            }
        }
    }
}

fn execute<P, R, E>(shared: &Shared<P, R, E>, slot: usize, task: Task<P>) -> Outcome<R, E> {
    let task_id = task.id();
    let payload = task.into_payload();
    let runner = &shared.runner;

    match run_contained(shared.config.panic_strategy, || runner(payload)) {
        Ok(Ok(value)) => Ok(value),
        Ok(Err(err)) => Err(TaskError::Failed(err)),
        Err(panic) => {
            warn!(slot, %task_id, message = %panic.message, "task panicked");
            Err(TaskError::Panicked(panic.message))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::task::{result_channel, TaskIdGen};

    fn job(ids: &TaskIdGen, payload: u32) -> Job<u32, u32, String> {
        let task = Task::new(ids.next(), payload);
        let (responder, _handle) = result_channel(task.id());
        Job { task, responder }
    }

    #[test]
    fn test_assign_rejects_busy_unit() {
        let ids = TaskIdGen::new();
        let (tx, _rx) = bounded(1);
        let mut unit: ExecutionUnit<u32, u32, String> = ExecutionUnit {
            slot: 0,
            generation: 0,
            state: UnitState::Idle,
            inbox: Some(tx),
            thread: None,
            current: None,
            abandoned: false,
        };

        assert!(unit.assign(job(&ids, 1)).is_ok());
        assert_eq!(unit.state, UnitState::Busy);
        assert!(unit.is_busy());

        let rejected = unit.assign(job(&ids, 2)).err().unwrap();
        assert!(matches!(rejected.error, Error::UnitBusy(0)));
        assert_eq!(*rejected.job.task.payload(), 2);
    }

    #[test]
    fn test_assign_to_stopped_unit_returns_job() {
        let ids = TaskIdGen::new();
        let (tx, rx) = bounded(1);
        drop(rx);
        let mut unit: ExecutionUnit<u32, u32, String> = ExecutionUnit {
            slot: 4,
            generation: 0,
            state: UnitState::Idle,
            inbox: Some(tx),
            thread: None,
            current: None,
            abandoned: false,
        };

        let rejected = unit.assign(job(&ids, 9)).err().unwrap();
        assert!(matches!(rejected.error, Error::UnitExited(4)));
        assert!(!unit.is_busy());
    }

    #[test]
    fn test_finish_only_matches_current_task() {
        let ids = TaskIdGen::new();
        let mut unit: ExecutionUnit<u32, u32, String> = ExecutionUnit::disabled(1, 0);
        let job = job(&ids, 5);
        let id = job.task.id();
        let _task = unit.take_inline(job);

        assert_eq!(unit.current_task(), Some(id));
        assert!(unit.finish(ids.next()).is_none());
        assert!(unit.finish(id).is_some());
        assert!(!unit.is_busy());
    }

    #[test]
    fn test_abandon_detaches_busy_unit() {
        let ids = TaskIdGen::new();
        let mut unit: ExecutionUnit<u32, u32, String> = ExecutionUnit::disabled(2, 0);
        let _task = unit.take_inline(job(&ids, 1));

        assert!(unit.abandon().is_some());
        assert_eq!(unit.state, UnitState::Terminating);
        assert!(unit.take_joinable().is_none());
        assert!(unit.abandon().is_none());
    }
}
