pub use crate::config::{Config, ConfigBuilder, RestartBudget};
pub use crate::counter::SharedCounter;
pub use crate::error::{Error, Result};
pub use crate::executor::{PanicStrategy, TaskError, TaskHandle, TaskId, TaskResult};
pub use crate::pool::{PoolHealth, PoolStatus, WorkerPool};
pub use crate::supervisor::{ShutdownReport, UnitCrash};
pub use crate::telemetry::MetricsSnapshot;
