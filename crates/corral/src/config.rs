//! Pool configuration structures.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::factory::FactorySpec;

/// Time unit for interval and age settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TimeUnit {
    /// Minutes.
    Min,
    /// Seconds.
    Sec,
    /// Milliseconds.
    Ms,
    /// Microseconds.
    Mu,
}

impl TimeUnit {
    fn micros(self) -> u64 {
        match self {
            TimeUnit::Min => 60_000_000,
            TimeUnit::Sec => 1_000_000,
            TimeUnit::Ms => 1_000,
            TimeUnit::Mu => 1,
        }
    }
}

/// An amount paired with its unit, e.g. `{"amount": 30, "unit": "sec"}`.
///
/// An amount of zero means "disabled" wherever a `TimeSpec` configures a
/// recurring behavior.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeSpec {
    pub amount: u64,
    pub unit: TimeUnit,
}

impl TimeSpec {
    pub const fn new(amount: u64, unit: TimeUnit) -> Self {
        Self { amount, unit }
    }

    /// The disabled value.
    pub const fn zero() -> Self {
        Self::new(0, TimeUnit::Min)
    }

    pub fn is_zero(&self) -> bool {
        self.amount == 0
    }

    pub fn as_duration(&self) -> Duration {
        Duration::from_micros(self.amount.saturating_mul(self.unit.micros()))
    }
}

fn default_max_count() -> u32 {
    10
}

fn default_init_count() -> u32 {
    0
}

fn default_add_member_retry() -> u32 {
    1
}

fn default_time_spec() -> TimeSpec {
    TimeSpec::zero()
}

/// Configuration for one named pool.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolSettings {
    /// Unique pool identifier.
    pub name: String,

    /// Ceiling on total workers (free + in use).
    #[serde(default = "default_max_count")]
    pub max_count: u32,

    /// Target population floor, spawned at pool creation and protected from
    /// culling.
    #[serde(default = "default_init_count")]
    pub init_count: u32,

    /// Opaque descriptor handed to the worker factory for each spawn.
    pub start_spec: FactorySpec,

    /// Growth attempts during a single take when the pool is empty but below
    /// `max_count`. Values of 2 or more allow one spawn plus one successful
    /// take even when a spawn attempt fails transiently.
    #[serde(default = "default_add_member_retry")]
    pub add_member_retry: u32,

    /// How often idle workers are considered for culling. Zero disables
    /// culling for this pool.
    #[serde(default = "default_time_spec")]
    pub cull_interval: TimeSpec,

    /// A free worker idle longer than this is eligible for culling.
    #[serde(default = "default_time_spec")]
    pub max_age: TimeSpec,
}

impl PoolSettings {
    /// Minimal settings with defaults for everything but name and factory
    /// descriptor.
    pub fn new(name: impl Into<String>, start_spec: FactorySpec) -> Self {
        Self {
            name: name.into(),
            max_count: default_max_count(),
            init_count: default_init_count(),
            start_spec,
            add_member_retry: default_add_member_retry(),
            cull_interval: TimeSpec::zero(),
            max_age: TimeSpec::zero(),
        }
    }

    #[must_use]
    pub fn with_max_count(mut self, max_count: u32) -> Self {
        self.max_count = max_count;
        self
    }

    #[must_use]
    pub fn with_init_count(mut self, init_count: u32) -> Self {
        self.init_count = init_count;
        self
    }

    #[must_use]
    pub fn with_add_member_retry(mut self, retries: u32) -> Self {
        self.add_member_retry = retries;
        self
    }

    #[must_use]
    pub fn with_cull_interval(mut self, interval: TimeSpec) -> Self {
        self.cull_interval = interval;
        self
    }

    #[must_use]
    pub fn with_max_age(mut self, max_age: TimeSpec) -> Self {
        self.max_age = max_age;
        self
    }

    /// Validate settings values.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.name.is_empty() {
            return Err(ConfigError::Invalid("pool name must not be empty".into()));
        }
        if self.init_count > self.max_count {
            return Err(ConfigError::Invalid(format!(
                "pool `{}`: init_count {} exceeds max_count {}",
                self.name, self.init_count, self.max_count
            )));
        }
        Ok(())
    }
}

/// Root configuration: the list of pools handed to the coordinator at
/// startup.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CorralConfig {
    pub pools: Vec<PoolSettings>,
}

impl CorralConfig {
    /// Validate every pool and reject duplicate names.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let mut seen = std::collections::HashSet::new();
        for pool in &self.pools {
            pool.validate()?;
            if !seen.insert(pool.name.as_str()) {
                return Err(ConfigError::Invalid(format!(
                    "duplicate pool name `{}`",
                    pool.name
                )));
            }
        }
        Ok(())
    }

    /// Parse configuration from a JSON string and validate.
    pub fn from_json_str(input: &str) -> Result<Self, ConfigError> {
        let cfg: CorralConfig = serde_json::from_str(input)?;
        cfg.validate()?;
        Ok(cfg)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("parse error: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("invalid configuration: {0}")]
    Invalid(String),
}
