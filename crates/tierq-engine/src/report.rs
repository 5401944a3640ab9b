//! Run reports.

use std::time::Duration;

use serde::Serialize;
use tierq_common::types::TaskTypeId;
use tierq_core::queue::{ExternalStats, Residual, StatsSnapshot};

use crate::config::Config;

/// Records of one task type that were executed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TypeCount {
    /// Task type id.
    pub id: TaskTypeId,
    /// Task type name.
    pub name: &'static str,
    /// Records handed to the type's handler.
    pub executed: u64,
}

/// What a [`Runtime::run`](crate::Runtime::run) did.
#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    /// Configuration the run used.
    pub config: Config,
    /// Combiner counters at the end of the run.
    pub stats: StatsSnapshot,
    /// External tier counters at the end of the run.
    pub external: ExternalStats,
    /// Residual handling summed over all groups.
    pub residual: Residual,
    /// Per-type execution counts in chain order.
    pub executed: Vec<TypeCount>,
    /// Wall time of the run.
    pub elapsed: Duration,
}

impl RunReport {
    /// Records executed across all types.
    #[must_use]
    pub fn total_executed(&self) -> u64 {
        self.executed.iter().map(|t| t.executed).sum()
    }

    /// Executed records per second.
    #[must_use]
    pub fn throughput(&self) -> f64 {
        let secs = self.elapsed.as_secs_f64();
        if secs == 0.0 {
            0.0
        } else {
            self.total_executed() as f64 / secs
        }
    }

    /// Executed count for `id`, or zero if the type is not in the chain.
    #[must_use]
    pub fn executed_of(&self, id: TaskTypeId) -> u64 {
        self.executed
            .iter()
            .find(|t| t.id == id)
            .map_or(0, |t| t.executed)
    }
}
