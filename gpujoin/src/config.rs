// Copyright 2018-2022 Clemens Lutz
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Runtime configuration of a join.

use crate::error::{ErrorKind, Result};
use serde_derive::{Deserialize, Serialize};

/// Tuning knobs of the join engine.
///
/// The configuration is passed by value into `GpuJoin::new` and never read
/// from global state.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct JoinConfig {
    /// Byte size of an outer chunk, and the cap of each intermediate
    /// result region.
    pub chunk_size: usize,

    /// Upper bound of a destination chunk in bytes.
    pub chunk_size_limit: usize,

    /// Safety factor applied to all size predictions.
    pub chunk_size_margin: f64,

    /// Fraction of the planned outer rows after which runtime statistics
    /// replace the planner's ratios.
    pub progress_threshold: f64,

    /// Maximum number of tasks in flight.
    pub max_async_tasks: usize,

    /// Cap of the inner relations' total bytes in one window. `None` uses
    /// half of the smallest device capacity.
    pub inner_total_limit: Option<usize>,

    /// Lower bound of the per-depth inner budget in bytes.
    pub min_inner_budget: usize,
}

impl Default for JoinConfig {
    fn default() -> Self {
        Self {
            chunk_size: 16 << 20,
            chunk_size_limit: 64 << 20,
            chunk_size_margin: 1.25,
            progress_threshold: 0.30,
            max_async_tasks: 8,
            inner_total_limit: None,
            min_inner_budget: 64 << 10,
        }
    }
}

impl JoinConfig {
    pub fn chunk_size(mut self, bytes: usize) -> Self {
        self.chunk_size = bytes;
        self
    }

    pub fn chunk_size_limit(mut self, bytes: usize) -> Self {
        self.chunk_size_limit = bytes;
        self
    }

    pub fn chunk_size_margin(mut self, margin: f64) -> Self {
        self.chunk_size_margin = margin;
        self
    }

    pub fn progress_threshold(mut self, threshold: f64) -> Self {
        self.progress_threshold = threshold;
        self
    }

    pub fn max_async_tasks(mut self, tasks: usize) -> Self {
        self.max_async_tasks = tasks;
        self
    }

    pub fn inner_total_limit(mut self, bytes: Option<usize>) -> Self {
        self.inner_total_limit = bytes;
        self
    }

    pub fn min_inner_budget(mut self, bytes: usize) -> Self {
        self.min_inner_budget = bytes;
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.chunk_size == 0 {
            Err(ErrorKind::InvalidArgument(
                "Chunk size must be greater than zero".to_string(),
            ))?;
        }
        if self.chunk_size_limit < self.chunk_size {
            Err(ErrorKind::InvalidArgument(format!(
                "Chunk size limit ({}) is smaller than the chunk size ({})",
                self.chunk_size_limit, self.chunk_size
            )))?;
        }
        if !(self.chunk_size_margin >= 1.0) || !self.chunk_size_margin.is_finite() {
            Err(ErrorKind::InvalidArgument(format!(
                "Chunk size margin must be at least 1.0, got {}",
                self.chunk_size_margin
            )))?;
        }
        if !(self.progress_threshold > 0.0 && self.progress_threshold <= 1.0) {
            Err(ErrorKind::InvalidArgument(format!(
                "Progress threshold must be in (0, 1], got {}",
                self.progress_threshold
            )))?;
        }
        if self.max_async_tasks == 0 {
            Err(ErrorKind::InvalidArgument(
                "At least one asynchronous task is required".to_string(),
            ))?;
        }
        if self.inner_total_limit == Some(0) {
            Err(ErrorKind::InvalidArgument(
                "Inner total limit must be greater than zero".to_string(),
            ))?;
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let config = JoinConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.chunk_size, 16 * 1024 * 1024);
        assert_eq!(config.max_async_tasks, 8);
    }

    #[test]
    fn limit_below_chunk_size_is_rejected() {
        let config = JoinConfig::default()
            .chunk_size(1 << 20)
            .chunk_size_limit(1 << 10);
        assert!(config.validate().is_err());
    }

    #[test]
    fn margin_below_one_is_rejected() {
        let config = JoinConfig::default().chunk_size_margin(0.5);
        assert!(config.validate().is_err());
    }
}
