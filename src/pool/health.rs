use crate::executor::{TaskId, UnitState};
use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PoolStatus {
    Healthy,
    /// One or more slots exhausted their restart budget.
    Degraded,
    Draining,
    Closed,
}

/// Point-in-time view of the pool for monitoring.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PoolHealth {
    /// Configured number of slots. Never changes.
    pub capacity: usize,
    /// Slots still in service (`capacity - degraded_slots`).
    pub live: usize,
    pub idle: usize,
    pub busy: usize,
    pub queued: usize,
    pub degraded_slots: usize,
    pub status: PoolStatus,
}

impl PoolHealth {
    pub fn is_degraded(&self) -> bool {
        self.degraded_slots > 0
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct UnitSnapshot {
    pub slot: usize,
    /// Bumped every time the slot gets a fresh unit.
    pub generation: u64,
    pub state: UnitState,
    pub current_task: Option<TaskId>,
    pub tasks_completed: u64,
    pub restarts: u32,
    /// Crashes still inside the restart window.
    pub recent_crashes: usize,
}
