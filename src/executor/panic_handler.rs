use serde::{Deserialize, Serialize};
use std::any::Any;
use std::panic::{catch_unwind, AssertUnwindSafe};

/// What a unit does when the runner panics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PanicStrategy {
    /// Catch the panic and resolve the task as `TaskError::Panicked`.
    /// The unit keeps serving tasks.
    #[default]
    Isolate,
    /// Let the panic unwind out of the unit. The unit dies, the task resolves
    /// as `TaskError::WorkerCrashed` and the supervisor replaces the unit.
    RestartUnit,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PanicInfo {
    pub message: String,
}

impl PanicInfo {
    pub(crate) fn from_payload(payload: &(dyn Any + Send)) -> Self {
        let message = if let Some(s) = payload.downcast_ref::<&str>() {
            s.to_string()
        } else if let Some(s) = payload.downcast_ref::<String>() {
            s.clone()
        } else {
            "unknown panic".to_string()
        };

        Self { message }
    }
}

/// Run `f` according to `strategy`.
///
/// Under [`PanicStrategy::Isolate`] a panic comes back as `Err(PanicInfo)`.
/// Under [`PanicStrategy::RestartUnit`] the panic keeps unwinding.
pub(crate) fn run_contained<F, T>(strategy: PanicStrategy, f: F) -> Result<T, PanicInfo>
where
    F: FnOnce() -> T,
{
    match strategy {
        PanicStrategy::Isolate => {
            catch_unwind(AssertUnwindSafe(f)).map_err(|payload| PanicInfo::from_payload(&*payload))
        }
        PanicStrategy::RestartUnit => Ok(f()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_isolate_catches_str_panic() {
        let result = run_contained(PanicStrategy::Isolate, || -> u32 {
            panic!("test panic");
        });

        assert_eq!(result.unwrap_err().message, "test panic");
    }

    #[test]
    fn test_isolate_catches_formatted_panic() {
        let n = 7;
        let result = run_contained(PanicStrategy::Isolate, || -> u32 {
            panic!("bad input {}", n);
        });

        assert_eq!(result.unwrap_err().message, "bad input 7");
    }

    #[test]
    fn test_success_passes_through() {
        assert_eq!(run_contained(PanicStrategy::Isolate, || 42), Ok(42));
        assert_eq!(run_contained(PanicStrategy::RestartUnit, || 42), Ok(42));
    }

    #[test]
    fn test_restart_unit_propagates() {
        let outer = catch_unwind(|| {
            let _ = run_contained(PanicStrategy::RestartUnit, || -> u32 {
                panic!("escapes");
            });
        });
        assert!(outer.is_err());
    }

    #[test]
    fn test_unknown_payload() {
        let payload: Box<dyn Any + Send> = Box::new(17u8);
        assert_eq!(PanicInfo::from_payload(&*payload).message, "unknown panic");
    }
}
