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

#![allow(dead_code)]

use datagen::relation::{to_rows, UniformRelation, ZipfRelation};
use gpu_runtime::runtime::{into_device_set, HostDevice, HostDeviceSetBuilder};
use gpujoin::config::JoinConfig;
use gpujoin::host_kernels::host_module;
use gpujoin::plan::{ColumnRef, JoinPlan};
use gpujoin::source::{RowSource, VecSource};
use gpujoin::stats::JoinStats;
use gpujoin::tuple::{keys_match, Datum, Row};
use gpujoin::GpuJoin;
use rand::rngs::StdRng;
use rand::SeedableRng;
use std::error::Error;
use std::sync::Arc;

pub type TestResult<T = ()> = Result<T, Box<dyn Error>>;

/// Rows of `(key, payload)` with keys drawn uniformly from `1..=max_key`.
pub fn uniform_rows(len: usize, max_key: usize, seed: u64) -> TestResult<Vec<Row>> {
    let mut rng = StdRng::seed_from_u64(seed);
    let mut keys = vec![0_i64; len];
    UniformRelation::gen_attr(&mut keys, 1..=max_key, &mut rng)?;
    Ok(to_rows(&keys, 1)?)
}

/// Rows of `(key, payload)` with keys drawn from `1..=max_key` following a
/// Zipf distribution.
pub fn zipf_rows(len: usize, max_key: usize, exponent: f64, seed: u64) -> TestResult<Vec<Row>> {
    let mut rng = StdRng::seed_from_u64(seed);
    let mut keys = vec![0_i64; len];
    ZipfRelation::gen_attr(&mut keys, max_key, exponent, &mut rng)?;
    Ok(to_rows(&keys, 1)?)
}

/// Rows of `(key, payload)` with unique keys `1..=len`, of which
/// `100 - selectivity` percent are NULL.
pub fn primary_key_rows(len: usize, selectivity: u32, seed: u64) -> TestResult<Vec<Row>> {
    let mut rng = StdRng::seed_from_u64(seed);
    let mut keys = vec![0_i64; len];
    UniformRelation::gen_primary_key(&mut keys, Some(selectivity), &mut rng)?;
    Ok(to_rows(&keys, 1)?)
}

/// A configuration sized for small test relations.
pub fn test_config() -> JoinConfig {
    JoinConfig::default()
        .chunk_size(64 << 10)
        .chunk_size_limit(1 << 20)
        .max_async_tasks(4)
}

pub fn host_devices(plan: &JoinPlan, devices: usize) -> TestResult<Vec<Arc<HostDevice>>> {
    Ok(HostDeviceSetBuilder::default()
        .devices(devices)
        .module(host_module(plan))
        .build()?)
}

pub fn sources(plan: &JoinPlan, inners: &[Vec<Row>]) -> Vec<Box<dyn RowSource>> {
    plan.depths
        .iter()
        .zip(inners.iter())
        .map(|(depth, rows)| {
            Box::new(VecSource::new(depth.inner_ncols, rows.clone())) as Box<dyn RowSource>
        })
        .collect()
}

/// Runs a join to completion and returns its rows in sorted order.
pub fn run_join(
    plan: &JoinPlan,
    config: JoinConfig,
    devices: &[Arc<HostDevice>],
    outer: &[Row],
    inners: &[Vec<Row>],
) -> TestResult<(Vec<Row>, JoinStats)> {
    let mut join = GpuJoin::new(
        plan.clone(),
        config,
        into_device_set(devices)?,
        Box::new(VecSource::new(plan.outer_ncols, outer.to_vec())),
        sources(plan, inners),
    )?;

    let rows = fetch_all(&mut join)?;
    let stats = join.stats();
    join.close()?;
    Ok((rows, stats))
}

pub fn fetch_all(join: &mut GpuJoin) -> TestResult<Vec<Row>> {
    let mut rows = Vec::new();
    while let Some(chunk) = join.bulk_fetch()? {
        rows.extend(chunk.rows()?);
    }
    rows.sort();
    Ok(rows)
}

/// Joins depth by depth with nested loops, the way the join is defined.
pub fn reference_join(plan: &JoinPlan, outer: &[Row], inners: &[Vec<Row>]) -> Vec<Row> {
    let mut joined: Vec<Vec<Option<&Row>>> = outer.iter().map(|row| vec![Some(row)]).collect();

    for (prior, (depth_plan, inner)) in plan.depths.iter().zip(inners.iter()).enumerate() {
        let mut next = Vec::new();
        let mut inner_matched = vec![false; inner.len()];

        for combination in joined.iter() {
            let key = depth_plan
                .outer_keys
                .iter()
                .map(|&column| value(combination, column))
                .collect::<Vec<Datum>>();
            let mut matched = false;

            for (i, inner_row) in inner.iter().enumerate() {
                let inner_key = depth_plan
                    .inner_keys
                    .iter()
                    .map(|&column| inner_row[column])
                    .collect::<Vec<Datum>>();
                if keys_match(&key, &inner_key) {
                    matched = true;
                    inner_matched[i] = true;
                    let mut extended = combination.clone();
                    extended.push(Some(inner_row));
                    next.push(extended);
                }
            }

            if !matched && depth_plan.join_type.fills_outer() {
                let mut extended = combination.clone();
                extended.push(None);
                next.push(extended);
            }
        }

        if depth_plan.join_type.fills_inner() {
            for (i, inner_row) in inner.iter().enumerate() {
                if !inner_matched[i] {
                    let mut extended = vec![None; prior + 1];
                    extended.push(Some(inner_row));
                    next.push(extended);
                }
            }
        }

        joined = next;
    }

    let mut rows = joined
        .iter()
        .map(|combination| {
            plan.target_list
                .iter()
                .map(|&column| value(combination, column))
                .collect::<Row>()
        })
        .collect::<Vec<_>>();
    rows.sort();
    rows
}

fn value(combination: &[Option<&Row>], column: ColumnRef) -> Datum {
    combination[column.depth].and_then(|row| row[column.column])
}
