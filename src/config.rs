use crate::error::{Error, Result};
use crate::executor::PanicStrategy;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Upper bound on the number of execution units in one pool.
pub const MAX_CAPACITY: usize = 1024;

/// How many crashes a single slot may absorb before it is disabled.
///
/// A slot that crashes more than `max_restarts` times within `window` stops
/// being replaced and the pool reports itself as degraded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RestartBudget {
    pub max_restarts: u32,
    #[serde(rename = "window_ms", with = "duration_millis")]
    pub window: Duration,
}

impl RestartBudget {
    pub fn new(max_restarts: u32, window: Duration) -> Self {
        Self {
            max_restarts,
            window,
        }
    }
}

impl Default for RestartBudget {
    fn default() -> Self {
        Self {
            max_restarts: 5,
            window: Duration::from_secs(60),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Number of execution units. `None` means one per logical CPU.
    pub capacity: Option<usize>,
    #[serde(rename = "drain_timeout_ms", with = "duration_millis")]
    pub drain_timeout: Duration,
    pub restart_budget: RestartBudget,
    pub panic_strategy: PanicStrategy,
    pub stack_size: Option<usize>,
    pub thread_name_prefix: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            capacity: None,
            drain_timeout: Duration::from_secs(30),
            restart_budget: RestartBudget::default(),
            panic_strategy: PanicStrategy::default(),
            stack_size: Some(2 * 1024 * 1024),
            thread_name_prefix: "shepherd-unit".to_string(),
        }
    }
}

impl Config {
    pub fn builder() -> ConfigBuilder {
        ConfigBuilder::new()
    }

    pub fn validate(&self) -> Result<()> {
        if let Some(n) = self.capacity {
            if n == 0 {
                return Err(Error::config("capacity must be > 0"));
            }
            if n > MAX_CAPACITY {
                return Err(Error::config(format!(
                    "capacity too large (max {})",
                    MAX_CAPACITY
                )));
            }
        }

        if self.restart_budget.window.is_zero() {
            return Err(Error::config("restart window must be > 0"));
        }

        if self.thread_name_prefix.contains('\0') {
            return Err(Error::config("thread_name_prefix must not contain NUL"));
        }

        Ok(())
    }

    pub fn unit_count(&self) -> usize {
        self.capacity
            .unwrap_or_else(|| num_cpus::get().min(MAX_CAPACITY))
    }
}

#[derive(Debug, Default)]
pub struct ConfigBuilder {
    config: Config,
}

impl ConfigBuilder {
    pub fn new() -> Self {
        Self {
            config: Config::default(),
        }
    }

    pub fn capacity(mut self, n: usize) -> Self {
        self.config.capacity = Some(n);
        self
    }

    pub fn drain_timeout(mut self, timeout: Duration) -> Self {
        self.config.drain_timeout = timeout;
        self
    }

    pub fn restart_budget(mut self, max_restarts: u32, window: Duration) -> Self {
        self.config.restart_budget = RestartBudget::new(max_restarts, window);
        self
    }

    pub fn panic_strategy(mut self, strategy: PanicStrategy) -> Self {
        self.config.panic_strategy = strategy;
        self
    }

    pub fn stack_size(mut self, size: usize) -> Self {
        self.config.stack_size = Some(size);
        self
    }

    pub fn thread_name_prefix<S: Into<String>>(mut self, prefix: S) -> Self {
        self.config.thread_name_prefix = prefix.into();
        self
    }

    pub fn build(self) -> Result<Config> {
        self.config.validate()?;
        Ok(self.config)
    }
}

/// Serde support for Duration as milliseconds
mod duration_millis {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        (duration.as_millis() as u64).serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let config = Config::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.unit_count(), num_cpus::get());
        assert_eq!(config.drain_timeout, Duration::from_secs(30));
    }

    #[test]
    fn test_builder() {
        let config = Config::builder()
            .capacity(3)
            .drain_timeout(Duration::from_millis(250))
            .restart_budget(2, Duration::from_secs(1))
            .panic_strategy(PanicStrategy::RestartUnit)
            .thread_name_prefix("render")
            .build()
            .unwrap();

        assert_eq!(config.unit_count(), 3);
        assert_eq!(config.drain_timeout, Duration::from_millis(250));
        assert_eq!(config.restart_budget.max_restarts, 2);
        assert_eq!(config.panic_strategy, PanicStrategy::RestartUnit);
        assert_eq!(config.thread_name_prefix, "render");
    }

    #[test]
    fn test_rejects_zero_capacity() {
        let err = Config::builder().capacity(0).build().unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[test]
    fn test_rejects_oversized_capacity() {
        assert!(Config::builder().capacity(MAX_CAPACITY + 1).build().is_err());
        assert!(Config::builder().capacity(MAX_CAPACITY).build().is_ok());
    }

    #[test]
    fn test_rejects_zero_window() {
        let result = Config::builder()
            .restart_budget(3, Duration::ZERO)
            .build();
        assert!(result.is_err());
    }

    #[test]
    fn test_deserialize_millis() {
        let json = r#"{
            "capacity": 4,
            "drain_timeout_ms": 1500,
            "restart_budget": { "max_restarts": 2, "window_ms": 1000 }
        }"#;
        let config: Config = serde_json::from_str(json).unwrap();

        assert_eq!(config.capacity, Some(4));
        assert_eq!(config.drain_timeout, Duration::from_millis(1500));
        assert_eq!(
            config.restart_budget,
            RestartBudget::new(2, Duration::from_secs(1))
        );
        // unspecified fields fall back to defaults
        assert_eq!(config.thread_name_prefix, "shepherd-unit");
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_serialize_round_trip_keeps_millis_keys() {
        let config = Config::builder().capacity(2).build().unwrap();
        let value = serde_json::to_value(&config).unwrap();
        assert_eq!(value["drain_timeout_ms"], 30_000);
        assert_eq!(value["restart_budget"]["window_ms"], 60_000);
    }
}
