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

//! # The GPU Join Library
//!
//! `gpujoin` executes a multi-way relational join of one outer relation
//! against one or more inner relations on a set of devices. The join order
//! and the join method of each depth are decided by a planner beforehand and
//! passed in as a [`JoinPlan`](plan::JoinPlan).
//!
//! Execution proceeds in four stages:
//!
//! 1. The [`InnerRelationLoader`](inner::InnerRelationLoader) materializes
//!    every inner relation into one or more sub-chunks that fit the inner
//!    memory budget. Hash-joined depths with outer-join semantics are split
//!    into disjoint hash ranges.
//! 2. An [`InnerRelationSet`](inner::InnerRelationSet) combines one sub-chunk
//!    per depth into a window. The set is uploaded to each device at most
//!    once and reference counted by the tasks that use it.
//! 3. The task scheduler pairs every outer chunk with every window, sizes
//!    the result buffers with the [`SizeEstimator`](exec::SizeEstimator),
//!    and launches the join kernels asynchronously.
//! 4. Completed tasks are delivered as [`ResultChunk`](chunk::ResultChunk)s.
//!    Tasks that overflow their buffers are retried with larger buffers.
//!    Right and full outer joins emit their unmatched inner rows in a final
//!    sweep task per window.
//!
//! # Kernels
//!
//! The join kernels are looked up by name on each device, see
//! [`KernelKind`](exec::KernelKind). On the simulated host device, the
//! kernels are provided by [`host_module`](host_kernels::host_module).
//!
//! # Example
//!
//! ```
//! # use gpujoin::error::Result;
//! # fn main() -> Result<()> {
//! use gpu_runtime::runtime::{into_device_set, HostDeviceSetBuilder};
//! use gpujoin::config::JoinConfig;
//! use gpujoin::host_kernels::host_module;
//! use gpujoin::plan::{ColumnRef, DepthPlan, JoinPlan, JoinType};
//! use gpujoin::source::VecSource;
//! use gpujoin::GpuJoin;
//!
//! let plan = JoinPlan::new(
//!     1,
//!     vec![DepthPlan::hash(JoinType::Inner, 2, vec![ColumnRef::new(0, 0)], vec![0])],
//!     vec![ColumnRef::new(0, 0), ColumnRef::new(1, 1)],
//! );
//! let devices = HostDeviceSetBuilder::default()
//!     .module(host_module(&plan))
//!     .build()?;
//!
//! let outer = VecSource::new(1, vec![vec![Some(1)], vec![Some(2)]]);
//! let inner = VecSource::new(2, vec![vec![Some(2), Some(20)]]);
//! let mut join = GpuJoin::new(
//!     plan,
//!     JoinConfig::default(),
//!     into_device_set(&devices)?,
//!     Box::new(outer),
//!     vec![Box::new(inner)],
//! )?;
//!
//! let mut rows = Vec::new();
//! while let Some(chunk) = join.bulk_fetch()? {
//!     rows.extend(chunk.rows()?);
//! }
//! assert_eq!(rows, vec![vec![Some(2), Some(20)]]);
//! # Ok(())
//! # }
//! ```

pub mod chunk;
pub mod config;
pub mod control;
pub mod error;
pub mod exec;
pub mod host_kernels;
pub mod inner;
pub mod plan;
pub mod source;
pub mod stats;
pub mod tuple;

mod gpu_join;

pub use gpu_join::{Fetch, GpuJoin};
