use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{Result, StrandError};

/// How deliveries within one super-step are dispatched.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStrategy {
    /// Strictly sequential, deterministic delivery order.
    #[default]
    Lockstep,
    /// Deliveries dispatched concurrently; the step boundary is the join
    /// barrier before advancing.
    Concurrent,
}

/// Runtime configuration for a workflow run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuntimeConfig {
    #[serde(default)]
    pub strategy: ExecutionStrategy,

    /// Poll interval while blocked on pending external requests, in
    /// milliseconds. Short and repeated so cancellation and new input are
    /// both observed promptly.
    #[serde(default = "default_pending_poll_interval_ms")]
    pub pending_poll_interval_ms: u64,

    /// Optional safety limit on super-steps per run; `None` means unbounded.
    #[serde(default)]
    pub max_supersteps: Option<u64>,
}

fn default_pending_poll_interval_ms() -> u64 {
    50
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            strategy: ExecutionStrategy::default(),
            pending_poll_interval_ms: default_pending_poll_interval_ms(),
            max_supersteps: None,
        }
    }
}

impl RuntimeConfig {
    /// Load configuration from a TOML file.
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)?;
        toml::from_str(&raw).map_err(|e| StrandError::Config(e.to_string()))
    }

    pub fn with_strategy(mut self, strategy: ExecutionStrategy) -> Self {
        self.strategy = strategy;
        self
    }
}
