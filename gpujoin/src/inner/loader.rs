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

use super::histogram::Histogram;
use crate::chunk::{
    hash_item_len, hash_nslots, hash_store_len, DataChunk, HashRange, HashStoreBuilder,
    RowStoreBuilder,
};
use crate::config::JoinConfig;
use crate::error::{ErrorKind, Result};
use crate::plan::{DepthPlan, JoinMethod, JoinPlan};
use crate::source::RowSource;
use crate::tuple::{hash_key, Datum, Row};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// The materialized sub-chunks of all inner relations.
#[derive(Clone, Debug)]
pub struct InnerChunks {
    depths: Vec<Vec<DataChunk>>,
    load_time: Duration,
}

impl InnerChunks {
    pub fn num_rels(&self) -> usize {
        self.depths.len()
    }

    /// Returns the sub-chunks of `depth`, counting from 1.
    pub fn chunks(&self, depth: usize) -> Result<&[DataChunk]> {
        depth
            .checked_sub(1)
            .and_then(|i| self.depths.get(i))
            .map(|chunks| chunks.as_slice())
            .ok_or_else(|| ErrorKind::InvalidArgument(format!("No such depth: {}", depth)).into())
    }

    /// Number of sub-chunks per depth.
    pub fn window_limits(&self) -> Vec<usize> {
        self.depths.iter().map(|chunks| chunks.len()).collect()
    }

    /// Selects one sub-chunk per depth.
    pub fn window(&self, index: &[usize]) -> Result<Vec<DataChunk>> {
        if index.len() != self.depths.len() {
            Err(ErrorKind::InvalidArgument(format!(
                "Window index has {} depths, expected {}",
                index.len(),
                self.depths.len()
            )))?;
        }

        self.depths
            .iter()
            .zip(index.iter())
            .map(|(chunks, &i)| {
                chunks.get(i).cloned().ok_or_else(|| {
                    ErrorKind::InvalidArgument(format!("No sub-chunk {}", i)).into()
                })
            })
            .collect()
    }

    /// Bytes of all sub-chunks.
    pub fn total_bytes(&self) -> usize {
        self.depths.iter().flatten().map(|chunk| chunk.len()).sum()
    }

    pub fn total_rows(&self) -> usize {
        self.depths.iter().flatten().map(|chunk| chunk.nitems()).sum()
    }

    pub fn load_time(&self) -> Duration {
        self.load_time
    }
}

/// Materializes the inner relations into sub-chunks.
///
/// Nested-loop depths become row stores, hash depths become hash stores.
/// Each sub-chunk fits the depth's byte budget, except for the depths that
/// [`JoinPlan::keeps_whole`] reports, which are never split. Hash depths
/// with outer-join semantics are split into disjoint hash ranges.
#[derive(Debug)]
pub struct InnerRelationLoader<'a> {
    plan: &'a JoinPlan,
    config: &'a JoinConfig,
    total_limit: usize,
}

impl<'a> InnerRelationLoader<'a> {
    /// Creates a loader whose windows fit into `total_limit` bytes.
    pub fn new(plan: &'a JoinPlan, config: &'a JoinConfig, total_limit: usize) -> Self {
        Self {
            plan,
            config,
            total_limit,
        }
    }

    /// Loads all inner relations, depth by depth.
    pub fn load(&self, sources: &mut [Box<dyn RowSource>]) -> Result<InnerChunks> {
        if sources.len() != self.plan.num_rels() {
            Err(ErrorKind::InvalidArgument(format!(
                "Expected {} inner relations, got {}",
                self.plan.num_rels(),
                sources.len()
            )))?;
        }

        let timer = Instant::now();
        let mut window_bytes = 0;
        let mut depths = Vec::with_capacity(sources.len());

        for (i, (depth_plan, source)) in self.plan.depths.iter().zip(sources.iter_mut()).enumerate()
        {
            let depth = i + 1;
            if source.ncols() != depth_plan.inner_ncols {
                Err(ErrorKind::InvalidArgument(format!(
                    "Inner relation of depth {} has {} columns, expected {}",
                    depth,
                    source.ncols(),
                    depth_plan.inner_ncols
                )))?;
            }

            let budget = self.budget(depth, depth_plan, window_bytes);
            let whole = self.plan.keeps_whole(depth)?;
            let chunks = match depth_plan.method {
                JoinMethod::NestLoop => {
                    self.load_nest_loop(depth, depth_plan, source, budget, whole)?
                }
                JoinMethod::Hash if whole => {
                    self.load_hash(depth, depth_plan, source, budget, true)?
                }
                JoinMethod::Hash if depth_plan.needs_clean_partition() => {
                    self.load_hash_partitioned(depth, depth_plan, source, budget)?
                }
                JoinMethod::Hash => self.load_hash(depth, depth_plan, source, budget, false)?,
            };

            window_bytes += chunks.iter().map(|c| c.len()).max().unwrap_or(0);
            info!(
                depth,
                rows = chunks.iter().map(|c| c.nitems()).sum::<usize>(),
                sub_chunks = chunks.len(),
                budget,
                "Loaded inner relation"
            );
            depths.push(chunks);
        }

        Ok(InnerChunks {
            depths,
            load_time: timer.elapsed(),
        })
    }

    /// The byte budget of one sub-chunk of `depth`.
    ///
    /// Once the sub-chunks of the earlier depths use up the total limit, the
    /// budget is frozen at what remains, but never below the configured
    /// minimum.
    fn budget(&self, depth: usize, depth_plan: &DepthPlan, window_bytes: usize) -> usize {
        let budget = std::cmp::max(depth_plan.ichunk_size, self.config.min_inner_budget);
        if window_bytes.saturating_add(budget) <= self.total_limit {
            return budget;
        }

        let frozen = std::cmp::max(
            self.total_limit.saturating_sub(window_bytes),
            self.config.min_inner_budget,
        );
        info!(
            depth,
            budget = frozen,
            total_limit = self.total_limit,
            "Inner total limit reached, freezing the sub-chunk budget"
        );
        frozen
    }

    fn load_nest_loop(
        &self,
        depth: usize,
        depth_plan: &DepthPlan,
        source: &mut Box<dyn RowSource>,
        budget: usize,
        whole: bool,
    ) -> Result<Vec<DataChunk>> {
        let mut chunks = Vec::new();
        let mut builder = RowStoreBuilder::new(depth_plan.inner_ncols);
        let mut warned = false;

        while let Some(row) = source.next_row()? {
            if !builder.is_empty() && builder.usage_with(1) > budget {
                if whole {
                    if !warned {
                        warn!(depth, budget, "Inner relation cannot be split, exceeding its budget");
                        warned = true;
                    }
                } else {
                    let full = std::mem::replace(
                        &mut builder,
                        RowStoreBuilder::new(depth_plan.inner_ncols),
                    );
                    chunks.push(full.seal()?);
                }
            }
            builder.push(&row)?;
        }

        if !builder.is_empty() || chunks.is_empty() {
            chunks.push(builder.seal()?);
        }

        Ok(chunks)
    }

    /// Loads a hash depth into sub-chunks that cover the full hash range.
    /// Overflowing rows start a new sub-chunk, unless the depth is kept
    /// whole.
    fn load_hash(
        &self,
        depth: usize,
        depth_plan: &DepthPlan,
        source: &mut Box<dyn RowSource>,
        budget: usize,
        whole: bool,
    ) -> Result<Vec<DataChunk>> {
        let margin = self.config.chunk_size_margin;
        let mut chunks = Vec::new();
        let mut builder = HashStoreBuilder::new(depth_plan.inner_ncols);
        let mut warned = false;

        while let Some(row) = source.next_row()? {
            let hash = inner_hash(depth_plan, &row)?;
            let overflow = !builder.is_empty() && builder.usage_with(1, margin) > budget;
            if overflow && whole && !warned {
                warn!(depth, budget, "Inner relation cannot be split, exceeding its budget");
                warned = true;
            } else if overflow && !whole {
                let full = std::mem::replace(
                    &mut builder,
                    HashStoreBuilder::new(depth_plan.inner_ncols),
                );
                let nslots = self.nslots(depth_plan, full.nitems(), chunks.is_empty());
                chunks.push(full.seal(nslots, HashRange::FULL)?);
                debug!(depth, sub_chunk = chunks.len(), "Hash sub-chunk is full");
            }
            builder.push(hash, &row)?;
        }

        if !builder.is_empty() || chunks.is_empty() {
            let nslots = self.nslots(depth_plan, builder.nitems(), chunks.is_empty());
            chunks.push(builder.seal(nslots, HashRange::FULL)?);
        }

        Ok(chunks)
    }

    /// Loads a hash depth with outer-join semantics.
    ///
    /// Rows are buffered into a single sub-chunk while the histogram tracks
    /// the hash distribution. If the budget is exceeded, the buffered rows
    /// are spilled and the whole input is split into disjoint hash ranges.
    fn load_hash_partitioned(
        &self,
        depth: usize,
        depth_plan: &DepthPlan,
        source: &mut Box<dyn RowSource>,
        budget: usize,
    ) -> Result<Vec<DataChunk>> {
        let ncols = depth_plan.inner_ncols;
        let margin = self.config.chunk_size_margin;
        let item_len = hash_item_len(ncols);
        let mut histogram = Histogram::for_batches(depth_plan.nbatches_plan);
        let mut builder = HashStoreBuilder::new(ncols);
        let mut spill: Option<Vec<(u32, Row)>> = None;

        while let Some(row) = source.next_row()? {
            let hash = inner_hash(depth_plan, &row)?;
            histogram.add(hash, item_len);

            match spill {
                Some(ref mut rows) => rows.push((hash, row)),
                None if !builder.is_empty() && builder.usage_with(1, margin) > budget => {
                    info!(
                        depth,
                        rows = builder.nitems(),
                        budget,
                        "Spilling inner relation for hash partitioning"
                    );
                    let buffered = std::mem::replace(&mut builder, HashStoreBuilder::new(ncols));
                    let mut rows = buffered.into_rows()?;
                    rows.push((hash, row));
                    spill = Some(rows);
                }
                None => builder.push(hash, &row)?,
            }
        }

        let rows = match spill {
            None => {
                let nslots = self.nslots(depth_plan, builder.nitems(), true);
                return Ok(vec![builder.seal(nslots, HashRange::FULL)?]);
            }
            Some(rows) => rows,
        };

        let partitions = histogram.partition(budget, |nitems| {
            hash_store_len(ncols, nitems, hash_nslots(nitems, margin))
        })?;
        debug!(
            depth,
            partitions = partitions.len(),
            buckets = histogram.nbuckets(),
            "Partitioned inner relation by hash"
        );

        let mut builders = partitions
            .iter()
            .map(|p| HashStoreBuilder::with_capacity(ncols, p.nitems))
            .collect::<Vec<_>>();
        for (hash, row) in rows {
            let target = partitions.partition_point(|p| p.range.max < hash);
            builders
                .get_mut(target)
                .ok_or_else(|| {
                    ErrorKind::LogicError(format!("No partition covers hash {:#x}", hash))
                })?
                .push(hash, &row)?;
        }

        builders
            .into_iter()
            .zip(partitions.iter())
            .enumerate()
            .map(|(i, (builder, partition))| {
                let nslots = self.nslots(depth_plan, builder.nitems(), i == 0);
                builder.seal(nslots, partition.range)
            })
            .collect()
    }

    /// Slot count of a hash sub-chunk; the first sub-chunk of a depth has at
    /// least the planned slot count.
    fn nslots(&self, depth_plan: &DepthPlan, nitems: usize, first: bool) -> usize {
        let nslots = hash_nslots(nitems, self.config.chunk_size_margin);
        if first && nitems > 0 {
            std::cmp::max(nslots, depth_plan.hash_nslots)
        } else {
            nslots
        }
    }
}

fn inner_hash(depth_plan: &DepthPlan, row: &[Datum]) -> Result<u32> {
    let key = depth_plan
        .inner_keys
        .iter()
        .map(|&column| -> Result<Datum> {
            row.get(column).copied().ok_or_else(|| {
                ErrorKind::InvalidArgument(format!(
                    "Inner row has {} columns, key column is {}",
                    row.len(),
                    column
                ))
                .into()
            })
        })
        .collect::<Result<Vec<_>>>()?;
    Ok(hash_key(key))
}
