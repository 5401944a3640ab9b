//! Runtime configuration.

use serde::{Deserialize, Serialize};
use tierq_common::{Error, Result};
use tierq_core::CombinerConfig;
use tierq_core::group::MAX_WIDTH;

/// Runtime configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Number of persistent worker groups.
    pub groups: u32,
    /// Lanes (threads) per group.
    pub lanes: u32,
    /// Shared-memory bytes each group may spend on its local chain.
    pub budget: u32,
    /// Records each type's external queue can hold.
    pub global_capacity: usize,
    /// Two-tier policy.
    pub combiner: CombinerConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            groups: 4,
            lanes: 32,
            budget: 48 * 1024,
            global_capacity: 1 << 16,
            combiner: CombinerConfig::default(),
        }
    }
}

impl Config {
    /// Sets the number of worker groups.
    pub fn with_groups(mut self, groups: u32) -> Self {
        self.groups = groups;
        self
    }

    /// Sets the lanes per group.
    pub fn with_lanes(mut self, lanes: u32) -> Self {
        self.lanes = lanes;
        self
    }

    /// Sets the per-group shared-memory budget in bytes.
    pub fn with_budget(mut self, budget: u32) -> Self {
        self.budget = budget;
        self
    }

    /// Sets the external queue capacity per type.
    pub fn with_global_capacity(mut self, capacity: usize) -> Self {
        self.global_capacity = capacity;
        self
    }

    /// Replaces the combiner policy.
    pub fn with_combiner(mut self, combiner: CombinerConfig) -> Self {
        self.combiner = combiner;
        self
    }

    /// Checks every value is in range.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] naming the first bad value.
    pub fn validate(&self) -> Result<()> {
        if self.groups == 0 {
            return Err(Error::Config("at least one worker group is needed".into()));
        }
        if self.lanes == 0 || self.lanes > MAX_WIDTH {
            return Err(Error::Config(format!(
                "{} lanes per group is outside 1..={MAX_WIDTH}",
                self.lanes
            )));
        }
        if self.global_capacity == 0 {
            return Err(Error::Config("global capacity must be non-zero".into()));
        }
        if self.combiner.lanes_per_record > self.lanes {
            return Err(Error::Config(format!(
                "{} lanes per record do not fit a group of {}",
                self.combiner.lanes_per_record, self.lanes
            )));
        }
        self.combiner.validate()
    }
}
