//! Shepherd - a supervised worker pool
//!
//! A fixed number of execution units (one OS thread each) run submitted tasks
//! through a shared runner function. Tasks are dispatched in submission order,
//! each resolves exactly once, and units that crash are replaced in place
//! within a restart budget.
//!
//! # Quick Start
//!
//! ```no_run
//! use shepherd::prelude::*;
//!
//! let pool = WorkerPool::create(4, |path: String| -> std::result::Result<usize, String> {
//!     std::fs::read_to_string(&path)
//!         .map(|s| s.len())
//!         .map_err(|e| e.to_string())
//! })
//! .unwrap();
//!
//! let handle = pool.submit("Cargo.toml".to_string()).unwrap();
//! match handle.wait().outcome {
//!     Ok(len) => println!("{} bytes", len),
//!     Err(err) => println!("failed: {}", err),
//! }
//!
//! let report = pool.shutdown();
//! assert!(report.drained);
//! ```
//!
//! # Features
//!
//! - **FIFO dispatch**: queued tasks start in submission order
//! - **Crash isolation**: runner errors and panics only fail their own task
//! - **Supervision**: crashed units are replaced, with a rolling restart budget
//! - **Graceful shutdown**: bounded drain with a `ShutdownReport`
//! - **Async handles**: every `TaskHandle` is also a `Future`
//! - **Telemetry**: outcome counters and an execution-latency histogram

#![warn(missing_debug_implementations)]

pub mod config;
pub mod counter;
pub mod error;
pub mod executor;
pub mod pool;
pub mod prelude;
pub mod supervisor;
pub mod telemetry;

pub use config::{Config, ConfigBuilder, RestartBudget};
pub use counter::SharedCounter;
pub use error::{Error, Result};
pub use executor::{PanicStrategy, TaskError, TaskHandle, TaskId, TaskResult, UnitState};
pub use pool::{PoolHealth, PoolStatus, UnitSnapshot, WorkerPool};
pub use supervisor::{ShutdownReport, UnitCrash};
pub use telemetry::MetricsSnapshot;
