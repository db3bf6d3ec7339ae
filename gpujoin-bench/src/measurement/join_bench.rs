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

use crate::error::{ErrorKind, Result};
use crate::types::ArgDistribution;
use datagen::relation::{to_rows, UniformRelation, ZipfRelation};
use gpu_runtime::runtime::DeviceSet;
use gpujoin::config::JoinConfig;
use gpujoin::plan::{ColumnRef, DepthPlan, JoinMethod, JoinPlan, JoinType, ResultFormat};
use gpujoin::source::{RowSource, VecSource};
use gpujoin::stats::JoinStats;
use gpujoin::tuple::Row;
use gpujoin::GpuJoin;
use rayon::prelude::*;
use std::convert::TryFrom;
use std::time::{Duration, Instant};
use tracing::{debug, info};

/// Measurements of one join execution.
#[derive(Clone, Debug, Default)]
pub struct JoinPoint {
    pub join_ns: Option<f64>,
    pub result_rows: Option<usize>,
    pub stats: JoinStats,
}

/// Builds a star join: the outer relation holds one foreign key per inner
/// relation, and every inner relation has a primary key and a payload.
#[derive(Clone, Debug)]
pub struct JoinBenchBuilder {
    outer_len: usize,
    inner_lens: Vec<usize>,
    join_types: Vec<JoinType>,
    join_methods: Vec<JoinMethod>,
    result_format: ResultFormat,
    selectivity: u32,
    distribution: ArgDistribution,
    zipf_exponent: f64,
}

impl Default for JoinBenchBuilder {
    fn default() -> Self {
        Self {
            outer_len: 10_000,
            inner_lens: vec![1_000],
            join_types: vec![JoinType::Inner],
            join_methods: vec![JoinMethod::Hash],
            result_format: ResultFormat::Row,
            selectivity: 100,
            distribution: ArgDistribution::Uniform,
            zipf_exponent: 0.0,
        }
    }
}

impl JoinBenchBuilder {
    pub fn outer_len(&mut self, len: usize) -> &mut Self {
        self.outer_len = len;
        self
    }

    pub fn inner_lens(&mut self, lens: Vec<usize>) -> &mut Self {
        self.inner_lens = lens;
        self
    }

    pub fn join_types(&mut self, join_types: Vec<JoinType>) -> &mut Self {
        self.join_types = join_types;
        self
    }

    pub fn join_methods(&mut self, join_methods: Vec<JoinMethod>) -> &mut Self {
        self.join_methods = join_methods;
        self
    }

    pub fn result_format(&mut self, format: ResultFormat) -> &mut Self {
        self.result_format = format;
        self
    }

    /// Percentage of inner rows with a non-NULL key.
    pub fn selectivity(&mut self, selectivity: u32) -> &mut Self {
        self.selectivity = selectivity;
        self
    }

    pub fn distribution(&mut self, distribution: ArgDistribution, exponent: f64) -> &mut Self {
        self.distribution = distribution;
        self.zipf_exponent = exponent;
        self
    }

    /// Generates the relations. Returns the benchmark and the time spent
    /// generating data.
    pub fn build(&self, config: JoinConfig, devices: DeviceSet) -> Result<(JoinBench, Duration)> {
        let num_rels = self.inner_lens.len();
        if num_rels == 0
            || self.join_types.len() != num_rels
            || self.join_methods.len() != num_rels
        {
            Err(ErrorKind::InvalidArgument(format!(
                "Expected one join type and method per inner relation, got {} relations, {} types, and {} methods",
                num_rels,
                self.join_types.len(),
                self.join_methods.len()
            )))?;
        }
        if self.inner_lens.iter().any(|&len| len == 0) {
            Err(ErrorKind::InvalidArgument(
                "Inner relations must not be empty".to_string(),
            ))?;
        }
        if self.selectivity > 100 {
            Err(ErrorKind::InvalidArgument(format!(
                "Selectivity is a percentage, got {}",
                self.selectivity
            )))?;
        }

        let timer = Instant::now();
        let (outer, inners) = self.gen_relations()?;
        let gen_time = timer.elapsed();
        debug!(
            outer = outer.len(),
            inners = ?self.inner_lens,
            ms = gen_time.as_millis() as u64,
            "Generated relations"
        );

        let bench = JoinBench {
            plan: self.plan(),
            config,
            devices,
            outer,
            inners,
        };
        Ok((bench, gen_time))
    }

    pub fn plan(&self) -> JoinPlan {
        let num_rels = self.inner_lens.len();
        let mut ratio = 1.0;

        let depths = self
            .join_types
            .iter()
            .zip(self.join_methods.iter())
            .enumerate()
            .map(|(d, (&join_type, &method))| {
                if !join_type.fills_outer() {
                    ratio *= f64::from(self.selectivity) / 100.0;
                }
                let outer_keys = vec![ColumnRef::new(0, d)];
                let depth = match method {
                    JoinMethod::Hash => DepthPlan::hash(join_type, 2, outer_keys, vec![0]),
                    JoinMethod::NestLoop => DepthPlan::nest_loop(join_type, 2, outer_keys, vec![0]),
                };
                depth.nrows_ratio(ratio)
            })
            .collect();

        let target_list = std::iter::once(ColumnRef::new(0, num_rels))
            .chain((1..=num_rels).map(|depth| ColumnRef::new(depth, 1)))
            .collect();

        JoinPlan::new(num_rels + 1, depths, target_list)
            .outer_plan_rows(self.outer_len as f64)
            .result_format(self.result_format)
    }

    fn gen_relations(&self) -> Result<(Vec<Row>, Vec<Vec<Row>>)> {
        let mut foreign_keys = Vec::with_capacity(self.inner_lens.len());
        let mut inners = Vec::with_capacity(self.inner_lens.len());

        for &inner_len in self.inner_lens.iter() {
            let mut pk = vec![0_i64; inner_len];
            UniformRelation::gen_primary_key_par(&mut pk, Some(self.selectivity))?;
            inners.push(to_rows(&pk, 1)?);

            let mut fk = vec![0_i64; self.outer_len];
            match self.distribution {
                ArgDistribution::Uniform => UniformRelation::gen_attr_par(&mut fk, 1..=inner_len)?,
                ArgDistribution::Zipf => {
                    ZipfRelation::gen_attr_par(&mut fk, inner_len, self.zipf_exponent)?
                }
            }
            foreign_keys.push(fk);
        }

        let outer = (0..self.outer_len)
            .into_par_iter()
            .map(|i| -> Result<Row> {
                let payload = i64::try_from(i).map_err(|_| {
                    ErrorKind::IntegerOverflow("Row index does not fit into i64".to_string())
                })?;
                Ok(foreign_keys
                    .iter()
                    .map(|fk| Some(fk[i]))
                    .chain(std::iter::once(Some(payload)))
                    .collect())
            })
            .collect::<Result<Vec<_>>>()?;

        Ok((outer, inners))
    }
}

/// A generated join, ready to be executed repeatedly.
pub struct JoinBench {
    pub plan: JoinPlan,
    pub config: JoinConfig,
    pub devices: DeviceSet,
    pub outer: Vec<Row>,
    pub inners: Vec<Vec<Row>>,
}

impl JoinBench {
    pub fn outer_len(&self) -> usize {
        self.outer.len()
    }

    pub fn inner_lens(&self) -> Vec<usize> {
        self.inners.iter().map(|rows| rows.len()).collect()
    }

    /// Executes the join once and counts the result rows.
    pub fn run(&mut self) -> Result<JoinPoint> {
        let outer = Box::new(VecSource::new(self.plan.outer_ncols, self.outer.clone()));
        let inners = self
            .plan
            .depths
            .iter()
            .zip(self.inners.iter())
            .map(|(depth, rows)| {
                Box::new(VecSource::new(depth.inner_ncols, rows.clone())) as Box<dyn RowSource>
            })
            .collect();

        let timer = Instant::now();
        let mut join = GpuJoin::new(
            self.plan.clone(),
            self.config.clone(),
            self.devices.clone(),
            outer,
            inners,
        )?;

        let mut result_rows = 0;
        while let Some(chunk) = join.bulk_fetch()? {
            result_rows += chunk.nitems();
        }
        join.close()?;
        let join_time = timer.elapsed();

        let stats = join.stats();
        info!(
            ms = join_time.as_millis() as u64,
            rows = result_rows,
            retries = stats.retries,
            windows = stats.windows,
            "Join finished"
        );

        Ok(JoinPoint {
            join_ns: Some(join_time.as_nanos() as f64),
            result_rows: Some(result_rows),
            stats,
        })
    }
}
