//! Task execution infrastructure.
//!
//! This module provides the task and result types, panic containment and the
//! execution units (one OS thread each) that the pool dispatches to.

pub mod panic_handler;
pub mod task;
pub mod unit;

pub use panic_handler::{PanicInfo, PanicStrategy};
pub use task::{Outcome, Task, TaskError, TaskHandle, TaskId, TaskResult};
pub use unit::UnitState;

pub(crate) use task::{result_channel, TaskIdGen};
pub(crate) use unit::{ExecutionUnit, Job, Next};
