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

//! The join plan handed over by the planner.
//!
//! Depths are numbered from 1. Depth 0 denotes the outer relation, such that
//! a `ColumnRef` can address a column of any relation joined so far.

use crate::error::{ErrorKind, Result};
use crate::tuple::MAX_COLUMNS;
use serde_derive::{Deserialize, Serialize};
use std::str::FromStr;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum JoinType {
    Inner,
    Left,
    Right,
    Full,
}

impl JoinType {
    /// Unmatched outer rows are emitted with NULL-extended inner columns.
    pub fn fills_outer(self) -> bool {
        matches!(self, JoinType::Left | JoinType::Full)
    }

    /// Unmatched inner rows are emitted with NULL-extended outer columns.
    pub fn fills_inner(self) -> bool {
        matches!(self, JoinType::Right | JoinType::Full)
    }

    pub(crate) fn code(self) -> u32 {
        match self {
            JoinType::Inner => 0,
            JoinType::Left => 1,
            JoinType::Right => 2,
            JoinType::Full => 3,
        }
    }

    pub(crate) fn from_code(code: u32) -> Result<Self> {
        match code {
            0 => Ok(JoinType::Inner),
            1 => Ok(JoinType::Left),
            2 => Ok(JoinType::Right),
            3 => Ok(JoinType::Full),
            _ => Err(ErrorKind::CorruptChunk(format!("Unknown join type {}", code)).into()),
        }
    }
}

impl FromStr for JoinType {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "inner" => Ok(JoinType::Inner),
            "left" => Ok(JoinType::Left),
            "right" => Ok(JoinType::Right),
            "full" => Ok(JoinType::Full),
            _ => Err(format!("Unknown join type: {}", s)),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum JoinMethod {
    NestLoop,
    Hash,
}

impl JoinMethod {
    pub(crate) fn code(self) -> u32 {
        match self {
            JoinMethod::NestLoop => 0,
            JoinMethod::Hash => 1,
        }
    }

    pub(crate) fn from_code(code: u32) -> Result<Self> {
        match code {
            0 => Ok(JoinMethod::NestLoop),
            1 => Ok(JoinMethod::Hash),
            _ => Err(ErrorKind::CorruptChunk(format!("Unknown join method {}", code)).into()),
        }
    }
}

impl FromStr for JoinMethod {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "nestloop" | "nest_loop" => Ok(JoinMethod::NestLoop),
            "hash" => Ok(JoinMethod::Hash),
            _ => Err(format!("Unknown join method: {}", s)),
        }
    }
}

/// Layout of the destination chunks.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ResultFormat {
    Row,
    Slot,
}

/// References column `column` of the relation joined at `depth`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ColumnRef {
    pub depth: usize,
    pub column: usize,
}

impl ColumnRef {
    pub fn new(depth: usize, column: usize) -> Self {
        Self { depth, column }
    }
}

/// Planner decisions for one join depth.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct DepthPlan {
    pub join_type: JoinType,
    pub method: JoinMethod,

    /// Column count of the inner relation.
    pub inner_ncols: usize,

    /// Key expressions over the rows joined so far (depth < this depth).
    pub outer_keys: Vec<ColumnRef>,

    /// Key columns of the inner relation, pairwise equal to `outer_keys`.
    pub inner_keys: Vec<usize>,

    /// Planned ratio of rows leaving this depth per outer row.
    pub nrows_ratio: f64,

    /// Planned sub-chunk size in bytes.
    pub ichunk_size: usize,

    /// Planned number of hash batches.
    pub nbatches_plan: usize,

    /// Planned number of hash slots. Zero lets the loader decide.
    pub hash_nslots: usize,
}

impl DepthPlan {
    const DEFAULT_ICHUNK_SIZE: usize = 16 << 20;

    pub fn hash(
        join_type: JoinType,
        inner_ncols: usize,
        outer_keys: Vec<ColumnRef>,
        inner_keys: Vec<usize>,
    ) -> Self {
        Self::with_method(JoinMethod::Hash, join_type, inner_ncols, outer_keys, inner_keys)
    }

    /// A nested-loop depth. Empty key lists join every pair of rows.
    pub fn nest_loop(
        join_type: JoinType,
        inner_ncols: usize,
        outer_keys: Vec<ColumnRef>,
        inner_keys: Vec<usize>,
    ) -> Self {
        Self::with_method(
            JoinMethod::NestLoop,
            join_type,
            inner_ncols,
            outer_keys,
            inner_keys,
        )
    }

    fn with_method(
        method: JoinMethod,
        join_type: JoinType,
        inner_ncols: usize,
        outer_keys: Vec<ColumnRef>,
        inner_keys: Vec<usize>,
    ) -> Self {
        Self {
            join_type,
            method,
            inner_ncols,
            outer_keys,
            inner_keys,
            nrows_ratio: 1.0,
            ichunk_size: Self::DEFAULT_ICHUNK_SIZE,
            nbatches_plan: 1,
            hash_nslots: 0,
        }
    }

    pub fn nrows_ratio(mut self, ratio: f64) -> Self {
        self.nrows_ratio = ratio;
        self
    }

    pub fn ichunk_size(mut self, bytes: usize) -> Self {
        self.ichunk_size = bytes;
        self
    }

    pub fn nbatches(mut self, nbatches: usize) -> Self {
        self.nbatches_plan = nbatches;
        self
    }

    pub fn hash_nslots(mut self, nslots: usize) -> Self {
        self.hash_nslots = nslots;
        self
    }

    /// Hash-joined depths with outer-join semantics need disjoint hash
    /// ranges across their sub-chunks.
    pub(crate) fn needs_clean_partition(&self) -> bool {
        self.method == JoinMethod::Hash && self.join_type != JoinType::Inner
    }

    /// Nested-loop depths that NULL-extend outer rows must see the whole
    /// inner relation at once.
    pub(crate) fn is_unsplittable(&self) -> bool {
        self.method == JoinMethod::NestLoop && self.join_type.fills_outer()
    }
}

/// A multi-way join plan.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct JoinPlan {
    pub outer_ncols: usize,

    /// Planned row count of the outer relation.
    pub outer_plan_rows: f64,

    /// Planned growth of the intermediate results per outer row.
    pub kresults_ratio: f64,

    pub depths: Vec<DepthPlan>,

    /// Projection of the joined rows.
    pub target_list: Vec<ColumnRef>,

    pub result_format: ResultFormat,
}

impl JoinPlan {
    pub fn new(outer_ncols: usize, depths: Vec<DepthPlan>, target_list: Vec<ColumnRef>) -> Self {
        Self {
            outer_ncols,
            outer_plan_rows: 1000.0,
            kresults_ratio: 1.0,
            depths,
            target_list,
            result_format: ResultFormat::Row,
        }
    }

    pub fn outer_plan_rows(mut self, rows: f64) -> Self {
        self.outer_plan_rows = rows;
        self
    }

    pub fn kresults_ratio(mut self, ratio: f64) -> Self {
        self.kresults_ratio = ratio;
        self
    }

    pub fn result_format(mut self, format: ResultFormat) -> Self {
        self.result_format = format;
        self
    }

    /// Number of inner relations.
    pub fn num_rels(&self) -> usize {
        self.depths.len()
    }

    /// Returns the plan of `depth`, counting from 1.
    pub fn depth(&self, depth: usize) -> Result<&DepthPlan> {
        depth
            .checked_sub(1)
            .and_then(|i| self.depths.get(i))
            .ok_or_else(|| ErrorKind::InvalidArgument(format!("No such depth: {}", depth)).into())
    }

    /// Column count of the relation at `depth`.
    pub fn ncols_at(&self, depth: usize) -> Result<usize> {
        if depth == 0 {
            Ok(self.outer_ncols)
        } else {
            self.depth(depth).map(|d| d.inner_ncols)
        }
    }

    /// Whether the inner relation of `depth` is loaded as a single
    /// sub-chunk.
    ///
    /// Besides nested-loop depths that NULL-extend outer rows, this holds for
    /// every depth in front of a right or full join: a sub-chunk of that
    /// join then occurs in exactly one window per combination of deeper
    /// sub-chunks, and all its matches land in that window's outer join map.
    pub(crate) fn keeps_whole(&self, depth: usize) -> Result<bool> {
        let depth_plan = self.depth(depth)?;
        Ok(depth_plan.is_unsplittable()
            || self.depths[depth..]
                .iter()
                .any(|d| d.join_type.fills_inner()))
    }

    /// The shallowest depth that emits unmatched inner rows. The sweep task
    /// starts its pipeline there.
    pub fn outer_join_start_depth(&self) -> Option<usize> {
        self.depths
            .iter()
            .position(|d| d.join_type.fills_inner())
            .map(|i| i + 1)
    }

    pub fn validate(&self) -> Result<()> {
        if self.depths.is_empty() {
            Err(ErrorKind::InvalidArgument(
                "A join needs at least one inner relation".to_string(),
            ))?;
        }
        if self.outer_ncols > MAX_COLUMNS || self.target_list.len() > MAX_COLUMNS {
            Err(ErrorKind::InvalidArgument(format!(
                "At most {} columns are supported",
                MAX_COLUMNS
            )))?;
        }
        if !(self.kresults_ratio > 0.0 && self.kresults_ratio.is_finite()) {
            Err(ErrorKind::InvalidArgument(format!(
                "Invalid result growth ratio: {}",
                self.kresults_ratio
            )))?;
        }

        for (i, depth_plan) in self.depths.iter().enumerate() {
            let depth = i + 1;

            if depth_plan.inner_ncols > MAX_COLUMNS {
                Err(ErrorKind::InvalidArgument(format!(
                    "Depth {} has more than {} columns",
                    depth, MAX_COLUMNS
                )))?;
            }
            if depth_plan.outer_keys.len() != depth_plan.inner_keys.len() {
                Err(ErrorKind::InvalidArgument(format!(
                    "Depth {} has {} outer keys, but {} inner keys",
                    depth,
                    depth_plan.outer_keys.len(),
                    depth_plan.inner_keys.len()
                )))?;
            }
            if depth_plan.method == JoinMethod::Hash && depth_plan.inner_keys.is_empty() {
                Err(ErrorKind::InvalidArgument(format!(
                    "Hash join at depth {} requires a key",
                    depth
                )))?;
            }
            for key in depth_plan.outer_keys.iter() {
                if key.depth >= depth || key.column >= self.ncols_at(key.depth)? {
                    Err(ErrorKind::InvalidArgument(format!(
                        "Depth {} refers to unavailable column {:?}",
                        depth, key
                    )))?;
                }
            }
            if let Some(key) = depth_plan
                .inner_keys
                .iter()
                .find(|&&key| key >= depth_plan.inner_ncols)
            {
                Err(ErrorKind::InvalidArgument(format!(
                    "Depth {} has no inner key column {}",
                    depth, key
                )))?;
            }
            if !(depth_plan.nrows_ratio >= 0.0 && depth_plan.nrows_ratio.is_finite()) {
                Err(ErrorKind::InvalidArgument(format!(
                    "Invalid row ratio at depth {}: {}",
                    depth, depth_plan.nrows_ratio
                )))?;
            }
        }

        for target in self.target_list.iter() {
            if target.depth > self.num_rels() || target.column >= self.ncols_at(target.depth)? {
                Err(ErrorKind::InvalidArgument(format!(
                    "Target list refers to unavailable column {:?}",
                    target
                )))?;
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn two_way(join_type: JoinType) -> JoinPlan {
        JoinPlan::new(
            2,
            vec![DepthPlan::hash(
                join_type,
                2,
                vec![ColumnRef::new(0, 1)],
                vec![0],
            )],
            vec![ColumnRef::new(0, 0), ColumnRef::new(1, 1)],
        )
    }

    #[test]
    fn depths_before_outer_joins_keep_whole() -> Result<()> {
        let plan = JoinPlan::new(
            1,
            vec![
                DepthPlan::hash(JoinType::Inner, 1, vec![ColumnRef::new(0, 0)], vec![0]),
                DepthPlan::nest_loop(JoinType::Inner, 1, vec![], vec![]),
                DepthPlan::hash(JoinType::Right, 1, vec![ColumnRef::new(0, 0)], vec![0]),
                DepthPlan::nest_loop(JoinType::Inner, 1, vec![], vec![]),
                DepthPlan::nest_loop(JoinType::Left, 1, vec![], vec![]),
            ],
            vec![ColumnRef::new(0, 0)],
        );

        let whole = (1..=plan.num_rels())
            .map(|depth| plan.keeps_whole(depth))
            .collect::<Result<Vec<_>>>()?;
        assert_eq!(whole, vec![true, true, false, false, true]);
        assert!(plan.keeps_whole(6).is_err());
        Ok(())
    }

    #[test]
    fn valid_plan_passes() {
        assert!(two_way(JoinType::Inner).validate().is_ok());
    }

    #[test]
    fn key_from_later_depth_is_rejected() {
        let mut plan = two_way(JoinType::Inner);
        plan.depths[0].outer_keys = vec![ColumnRef::new(1, 0)];
        assert!(plan.validate().is_err());
    }

    #[test]
    fn hash_join_without_key_is_rejected() {
        let plan = JoinPlan::new(
            1,
            vec![DepthPlan::hash(JoinType::Inner, 1, vec![], vec![])],
            vec![ColumnRef::new(0, 0)],
        );
        assert!(plan.validate().is_err());
    }

    #[test]
    fn start_depth_is_first_inner_filling_depth() {
        let mut plan = two_way(JoinType::Left);
        plan.depths
            .push(DepthPlan::nest_loop(JoinType::Full, 1, vec![], vec![]));
        plan.depths
            .push(DepthPlan::nest_loop(JoinType::Right, 1, vec![], vec![]));
        assert_eq!(plan.outer_join_start_depth(), Some(2));
        assert_eq!(two_way(JoinType::Inner).outer_join_start_depth(), None);
    }

    #[test]
    fn join_type_parses_case_insensitively() {
        assert_eq!("FULL".parse::<JoinType>(), Ok(JoinType::Full));
        assert!("cross".parse::<JoinType>().is_err());
    }
}
