pub type Result<T> = std::result::Result<T, Error>;

/// Errors returned by the pool's own API.
///
/// Task-level failures never show up here; they are delivered through the
/// task's handle as a [`TaskError`](crate::TaskError).
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("pool is closed")]
    PoolClosed,

    #[error("execution unit {0} is busy")]
    UnitBusy(usize),

    #[error("execution unit {0} has exited")]
    UnitExited(usize),

    #[error("config error: {0}")]
    Config(String),

    #[error("failed to spawn execution unit {slot}: {source}")]
    Spawn {
        slot: usize,
        #[source]
        source: std::io::Error,
    },
}

impl Error {
    pub fn config<S: Into<String>>(msg: S) -> Self {
        Error::Config(msg.into())
    }

    /// Whether this error means the pool will never accept work again.
    pub fn is_closed(&self) -> bool {
        matches!(self, Error::PoolClosed)
    }
}
