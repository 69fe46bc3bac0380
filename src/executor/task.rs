//! Task representation and the exactly-once result channel.

use futures::channel::oneshot;
use serde::Serialize;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::task::{Context, Poll};
use std::time::Instant;

/// Unique identifier for a task within one pool
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(transparent)]
pub struct TaskId(u64);

impl TaskId {
    pub fn as_u64(self) -> u64 {
        self.0
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "task-{}", self.0)
    }
}

/// Hands out task ids in submission order.
#[derive(Debug)]
pub(crate) struct TaskIdGen {
    next: AtomicU64,
}

impl TaskIdGen {
    pub(crate) fn new() -> Self {
        Self {
            next: AtomicU64::new(1),
        }
    }

    pub(crate) fn next(&self) -> TaskId {
        TaskId(self.next.fetch_add(1, Ordering::Relaxed))
    }
}

/// A submitted unit of work. Immutable once created.
pub struct Task<P> {
    id: TaskId,
    payload: P,
    submitted_at: Instant,
}

impl<P> Task<P> {
    pub(crate) fn new(id: TaskId, payload: P) -> Self {
        Self {
            id,
            payload,
            submitted_at: Instant::now(),
        }
    }

    pub fn id(&self) -> TaskId {
        self.id
    }

    pub fn payload(&self) -> &P {
        &self.payload
    }

    pub fn submitted_at(&self) -> Instant {
        self.submitted_at
    }

    pub(crate) fn into_payload(self) -> P {
        self.payload
    }
}

impl<P> fmt::Debug for Task<P> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Task")
            .field("id", &self.id)
            .field("submitted_at", &self.submitted_at)
            .finish()
    }
}

/// Why a task did not produce a value.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TaskError<E> {
    /// The runner returned an error.
    #[error("task failed: {0}")]
    Failed(E),

    /// The runner panicked and the panic was contained in the unit.
    #[error("task panicked: {0}")]
    Panicked(String),

    /// The unit running the task died before reporting a result.
    #[error("worker crashed while running the task")]
    WorkerCrashed,

    /// The task was still pending when the drain timeout expired.
    #[error("task aborted: shutdown drain timeout expired")]
    ShutdownTimeout,

    /// The pool was force-terminated before the task finished.
    #[error("task aborted: pool terminated")]
    Terminated,
}

impl<E> TaskError<E> {
    /// True for failures caused by the pool rather than by the task itself.
    pub fn is_pool_failure(&self) -> bool {
        matches!(
            self,
            TaskError::WorkerCrashed | TaskError::ShutdownTimeout | TaskError::Terminated
        )
    }
}

pub type Outcome<R, E> = std::result::Result<R, TaskError<E>>;

/// The single result produced for every submitted task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskResult<R, E> {
    pub task_id: TaskId,
    pub outcome: Outcome<R, E>,
}

impl<R, E> TaskResult<R, E> {
    pub fn is_success(&self) -> bool {
        self.outcome.is_ok()
    }

    pub fn into_result(self) -> Outcome<R, E> {
        self.outcome
    }
}

/// Sending half kept by the pool until the task resolves.
pub(crate) struct Responder<R, E> {
    task_id: TaskId,
    tx: oneshot::Sender<TaskResult<R, E>>,
}

impl<R, E> Responder<R, E> {
    pub(crate) fn task_id(&self) -> TaskId {
        self.task_id
    }

    /// Consumes the responder so a second resolution cannot be expressed.
    pub(crate) fn resolve(self, outcome: Outcome<R, E>) {
        let task_id = self.task_id;
        // the caller may have dropped its handle, which is fine
        let _ = self.tx.send(TaskResult { task_id, outcome });
    }
}

pub(crate) fn result_channel<R, E>(task_id: TaskId) -> (Responder<R, E>, TaskHandle<R, E>) {
    let (tx, rx) = oneshot::channel();
    (Responder { task_id, tx }, TaskHandle { task_id, rx })
}

/// Handle returned by `submit`.
///
/// Await it, or call [`TaskHandle::wait`] from synchronous code.
#[must_use = "a TaskHandle does nothing unless awaited or waited on"]
pub struct TaskHandle<R, E> {
    task_id: TaskId,
    rx: oneshot::Receiver<TaskResult<R, E>>,
}

impl<R, E> TaskHandle<R, E> {
    pub fn task_id(&self) -> TaskId {
        self.task_id
    }

    /// Block the current thread until the task resolves.
    pub fn wait(self) -> TaskResult<R, E> {
        futures::executor::block_on(self)
    }

    /// Return the result if it is already available.
    pub fn try_result(&mut self) -> Option<TaskResult<R, E>> {
        match self.rx.try_recv() {
            Ok(Some(result)) => Some(result),
            Ok(None) => None,
            Err(oneshot::Canceled) => Some(self.abandoned()),
        }
    }

    // Only reachable if the pool state was torn down without resolving the
    // task, which the pool never does.
    fn abandoned(&self) -> TaskResult<R, E> {
        TaskResult {
            task_id: self.task_id,
            outcome: Err(TaskError::Terminated),
        }
    }
}

impl<R, E> Future for TaskHandle<R, E> {
    type Output = TaskResult<R, E>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match Pin::new(&mut self.rx).poll(cx) {
            Poll::Ready(Ok(result)) => Poll::Ready(result),
            Poll::Ready(Err(oneshot::Canceled)) => Poll::Ready(self.abandoned()),
            Poll::Pending => Poll::Pending,
        }
    }
}

impl<R, E> fmt::Debug for TaskHandle<R, E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskHandle")
            .field("task_id", &self.task_id)
            .finish()
    }
}
