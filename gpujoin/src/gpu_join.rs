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

use crate::chunk::ResultChunk;
use crate::config::JoinConfig;
use crate::error::Result;
use crate::exec::scheduler::TaskScheduler;
use crate::plan::JoinPlan;
use crate::source::RowSource;
use crate::stats::JoinStats;
use crate::tuple::Row;
use gpu_runtime::runtime::DeviceSet;
use tracing::warn;

/// Result of `GpuJoin::next_tuple`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Fetch {
    Row(Row),

    /// The current chunk is used up; call `next_chunk`.
    NeedNextChunk,
}

/// A multi-way join executed on a set of devices.
///
/// Results are delivered chunk by chunk in completion order, so the row
/// order is not deterministic.
pub struct GpuJoin {
    scheduler: TaskScheduler,
    current: Option<(ResultChunk, usize)>,
    closed: bool,
}

impl GpuJoin {
    /// Sets up a join of `outer` with `inners`, one inner relation per
    /// depth of `plan`.
    ///
    /// Nothing is loaded until the first fetch. The devices must provide
    /// the kernels listed in [`KernelKind`](crate::exec::KernelKind).
    pub fn new(
        plan: JoinPlan,
        config: JoinConfig,
        devices: DeviceSet,
        outer: Box<dyn RowSource>,
        inners: Vec<Box<dyn RowSource>>,
    ) -> Result<Self> {
        let scheduler = TaskScheduler::new(plan, config, devices, outer, inners)?;
        Ok(Self {
            scheduler,
            current: None,
            closed: false,
        })
    }

    /// Blocks until a task yields a non-empty result chunk. Returns `None`
    /// at the end of the scan.
    ///
    /// The chunk also becomes the source of `next_tuple`.
    pub fn next_chunk(&mut self) -> Result<Option<ResultChunk>> {
        let chunk = self.bulk_fetch()?;
        if let Some(chunk) = &chunk {
            self.current = Some((chunk.clone(), 0));
        }
        Ok(chunk)
    }

    /// Returns the next row of the current chunk.
    pub fn next_tuple(&mut self) -> Result<Fetch> {
        match self.current.as_mut() {
            Some((chunk, index)) if *index < chunk.nitems() => {
                let row = chunk.row(*index)?;
                *index += 1;
                Ok(Fetch::Row(row))
            }
            _ => Ok(Fetch::NeedNextChunk),
        }
    }

    /// Returns the next non-empty result chunk as a whole, or `None` at the
    /// end of the scan. Empty chunks are skipped.
    ///
    /// Rows left in the chunk of `next_tuple` are dropped.
    pub fn bulk_fetch(&mut self) -> Result<Option<ResultChunk>> {
        self.current = None;
        loop {
            match self.scheduler.next()? {
                Some(chunk) if chunk.is_empty() => continue,
                other => return Ok(other),
            }
        }
    }

    /// Restarts the join from the first outer row.
    pub fn rescan(&mut self) -> Result<()> {
        self.current = None;
        self.closed = false;
        self.scheduler.rescan()
    }

    pub fn stats(&self) -> JoinStats {
        self.scheduler.stats().clone()
    }

    /// Waits for running tasks and frees all device memory.
    pub fn close(&mut self) -> Result<()> {
        self.current = None;
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        self.scheduler.close()
    }
}

impl Drop for GpuJoin {
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            warn!("Failed to close the join: {}", e);
        }
    }
}
