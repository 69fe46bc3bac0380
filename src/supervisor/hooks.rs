//! Lifecycle callbacks for the embedding application.

use crate::executor::TaskId;
use parking_lot::RwLock;
use serde::Serialize;
use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use std::time::Duration;
use tracing::error;

/// Reported to `on_unit_crash` callbacks.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct UnitCrash {
    pub slot: usize,
    pub generation: u64,
    /// Task that was lost with the unit.
    pub task_id: Option<TaskId>,
    pub message: String,
    /// A fresh unit now occupies the slot.
    pub replaced: bool,
    /// The slot exhausted its restart budget and is out of service.
    pub disabled: bool,
}

/// Summary of a completed shutdown.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ShutdownReport {
    pub graceful: bool,
    /// Every task finished on its own before the pool closed.
    pub drained: bool,
    /// Tasks resolved as `ShutdownTimeout` or `Terminated`.
    pub aborted: usize,
    #[serde(serialize_with = "as_millis")]
    pub elapsed: Duration,
}

type CrashHook = Arc<dyn Fn(&UnitCrash) + Send + Sync>;
type ShutdownHook = Arc<dyn Fn(&ShutdownReport) + Send + Sync>;

#[derive(Default)]
pub(crate) struct Hooks {
    crash: RwLock<Vec<CrashHook>>,
    shutdown: RwLock<Vec<ShutdownHook>>,
}

impl Hooks {
    pub(crate) fn on_unit_crash(&self, hook: CrashHook) {
        self.crash.write().push(hook);
    }

    pub(crate) fn on_shutdown_complete(&self, hook: ShutdownHook) {
        self.shutdown.write().push(hook);
    }

    pub(crate) fn unit_crashed(&self, event: &UnitCrash) {
        // clone so a callback may register more callbacks
        let hooks = self.crash.read().clone();
        for hook in hooks {
            if catch_unwind(AssertUnwindSafe(|| hook(event))).is_err() {
                error!(slot = event.slot, "on_unit_crash callback panicked");
            }
        }
    }

    pub(crate) fn shutdown_complete(&self, report: &ShutdownReport) {
        let hooks = self.shutdown.read().clone();
        for hook in hooks {
            if catch_unwind(AssertUnwindSafe(|| hook(report))).is_err() {
                error!("on_shutdown_complete callback panicked");
            }
        }
    }
}

impl fmt::Debug for Hooks {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Hooks")
            .field("crash", &self.crash.read().len())
            .field("shutdown", &self.shutdown.read().len())
            .finish()
    }
}

fn as_millis<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
where
    S: serde::Serializer,
{
    serializer.serialize_u64(duration.as_millis() as u64)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn crash_event() -> UnitCrash {
        UnitCrash {
            slot: 1,
            generation: 3,
            task_id: None,
            message: "boom".into(),
            replaced: true,
            disabled: false,
        }
    }

    #[test]
    fn test_all_crash_hooks_run() {
        let hooks = Hooks::default();
        let calls = Arc::new(AtomicUsize::new(0));
        for _ in 0..3 {
            let calls = calls.clone();
            hooks.on_unit_crash(Arc::new(move |event: &UnitCrash| {
                assert_eq!(event.slot, 1);
                calls.fetch_add(1, Ordering::SeqCst);
            }));
        }

        hooks.unit_crashed(&crash_event());
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn test_panicking_hook_does_not_stop_others() {
        let hooks = Hooks::default();
        let reached = Arc::new(AtomicUsize::new(0));
        hooks.on_shutdown_complete(Arc::new(|_: &ShutdownReport| panic!("bad hook")));
        {
            let reached = reached.clone();
            hooks.on_shutdown_complete(Arc::new(move |_: &ShutdownReport| {
                reached.fetch_add(1, Ordering::SeqCst);
            }));
        }

        hooks.shutdown_complete(&ShutdownReport {
            graceful: true,
            drained: true,
            aborted: 0,
            elapsed: Duration::from_millis(5),
        });
        assert_eq!(reached.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_crash_event_serializes() {
        let value = serde_json::to_value(crash_event()).unwrap();
        assert_eq!(value["slot"], 1);
        assert!(value["task_id"].is_null());
        assert_eq!(value["replaced"], true);
    }
}
