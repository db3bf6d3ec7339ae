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

mod error;
mod measurement;
mod types;

use crate::error::{ErrorKind, Result};
use crate::measurement::data_point::DataPoint;
use crate::measurement::harness;
use crate::measurement::join_bench::{JoinBenchBuilder, JoinPoint};
use crate::types::*;

use gpu_runtime::runtime::{into_device_set, DeviceSet, HostDeviceSetBuilder};
use gpujoin::config::JoinConfig;
use gpujoin::host_kernels::host_module;
use gpujoin::plan::JoinPlan;

use std::path::PathBuf;

use structopt::StructOpt;
use tracing_subscriber::EnvFilter;

fn main() -> Result<()> {
    // Parse commandline arguments
    let cmd = CmdOpt::from_args();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new(&cmd.log_level))
        .with_writer(std::io::stderr)
        .init();

    let (jbc, dp) = args_to_bench(&cmd)?;
    harness::measure("gpu_join", cmd.repeat, cmd.csv.clone(), dp, jbc)?;

    Ok(())
}

#[derive(StructOpt)]
#[structopt(name = "gpujoin-bench", about = "A benchmark for multi-way GPU joins")]
pub struct CmdOpt {
    /// Number of times to repeat benchmark
    #[structopt(short = "r", long = "repeat", default_value = "30")]
    repeat: u32,

    /// Output filename for measurement CSV file
    #[structopt(long = "csv", parse(from_os_str))]
    csv: Option<PathBuf>,

    /// Log filter, e.g. "info" or "gpujoin=debug"
    #[structopt(long = "log-level", default_value = "warn")]
    log_level: String,

    /// Use a pre-defined or custom data set.
    //   test: A small two-way join for testing on the laptop
    //   star: A four-way star join
    //   custom: Sizes given by --outer-rel-tuples and --inner-rel-tuples
    #[structopt(
        short = "s",
        long = "data-set",
        default_value = "Test",
        possible_values = &ArgDataSet::variants(),
        case_insensitive = true
    )]
    data_set: ArgDataSet,

    /// Set the outer relation size (tuples); required for `--data-set Custom`
    #[structopt(long = "outer-rel-tuples", required_if("data_set", "Custom"))]
    outer_rel_tuples: Option<usize>,

    /// Set the inner relation sizes (tuples), one per depth; required for
    /// `--data-set Custom`
    #[structopt(
        long = "inner-rel-tuples",
        require_delimiter = true,
        required_if("data_set", "Custom")
    )]
    inner_rel_tuples: Vec<usize>,

    /// Join type of each depth (e.g.: Inner,Left)
    #[structopt(
        long = "join-types",
        default_value = "Inner",
        require_delimiter = true,
        possible_values = &ArgJoinType::variants(),
        case_insensitive = true
    )]
    join_types: Vec<ArgJoinType>,

    /// Join method of each depth (e.g.: Hash,NestLoop)
    #[structopt(
        long = "join-methods",
        default_value = "Hash",
        require_delimiter = true,
        possible_values = &ArgJoinMethod::variants(),
        case_insensitive = true
    )]
    join_methods: Vec<ArgJoinMethod>,

    /// Layout of the result chunks
    #[structopt(
        long = "result-format",
        default_value = "Row",
        possible_values = &ArgResultFormat::variants(),
        case_insensitive = true
    )]
    result_format: ArgResultFormat,

    /// Distribution of the outer relation's foreign keys
    #[structopt(
        long = "distribution",
        default_value = "Uniform",
        possible_values = &ArgDistribution::variants(),
        case_insensitive = true
    )]
    distribution: ArgDistribution,

    /// Exponent of the Zipf distribution
    #[structopt(long = "zipf-exponent", default_value = "1.0")]
    zipf_exponent: f64,

    /// Percentage of inner tuples with a non-NULL key
    #[structopt(long = "selectivity", default_value = "100")]
    selectivity: u32,

    /// Execute on simulated host devices or on CUDA devices
    #[structopt(
        long = "device-type",
        default_value = "Host",
        possible_values = &ArgDeviceType::variants(),
        case_insensitive = true
    )]
    device_type: ArgDeviceType,

    /// Number of devices
    #[structopt(short = "d", long = "devices", default_value = "1")]
    devices: usize,

    /// Memory of each simulated host device (bytes)
    #[structopt(long = "device-memory-bytes", default_value = "1073741824")]
    device_memory_bytes: usize,

    /// PTX module to load on CUDA devices
    #[structopt(long = "kernel-image", parse(from_os_str))]
    kernel_image: Option<PathBuf>,

    /// Size of an outer chunk and of the intermediate results (bytes)
    #[structopt(long = "chunk-bytes", default_value = "16777216")]
    chunk_bytes: usize,

    /// Maximum size of a result chunk (bytes)
    #[structopt(long = "chunk-limit-bytes", default_value = "67108864")]
    chunk_limit_bytes: usize,

    /// Maximum number of join tasks in flight
    #[structopt(long = "max-async-tasks", default_value = "8")]
    max_async_tasks: usize,

    /// Number of threads used to generate the relations (0 = all cores)
    #[structopt(short = "t", long = "threads", default_value = "0")]
    threads: usize,
}

fn args_to_bench(cmd: &CmdOpt) -> Result<(Box<dyn FnMut() -> Result<JoinPoint>>, DataPoint)> {
    let (outer_len, inner_lens, join_types, join_methods) = data_set(cmd)?;

    let config = JoinConfig::default()
        .chunk_size(cmd.chunk_bytes)
        .chunk_size_limit(cmd.chunk_limit_bytes)
        .max_async_tasks(cmd.max_async_tasks);

    let mut jb_builder = JoinBenchBuilder::default();
    jb_builder
        .outer_len(outer_len)
        .inner_lens(inner_lens)
        .join_types(join_types.iter().map(|&jt| jt.into()).collect())
        .join_methods(join_methods.iter().map(|&jm| jm.into()).collect())
        .result_format(cmd.result_format.into())
        .selectivity(cmd.selectivity)
        .distribution(cmd.distribution, cmd.zipf_exponent);

    // Kernels of the host devices are specialized on the plan
    let plan = jb_builder.plan();
    let devices = devices(cmd, &plan)?;

    let thread_pool = rayon::ThreadPoolBuilder::new()
        .num_threads(cmd.threads)
        .build()?;
    let (mut jb, data_gen_time) = thread_pool.install(|| jb_builder.build(config, devices))?;

    // Construct data point template for CSV
    let dp = DataPoint::new()?
        .fill_from_cmd_options(cmd)?
        .fill_from_join_bench(&jb, join_types, join_methods)
        .set_init_time(data_gen_time);

    let jbc: Box<dyn FnMut() -> Result<JoinPoint>> = Box::new(move || jb.run());

    Ok((jbc, dp))
}

type DataSetShape = (usize, Vec<usize>, Vec<ArgJoinType>, Vec<ArgJoinMethod>);

/// Resolves the data set into relation sizes, and a join type and method per
/// depth. A single join type or method applies to all depths.
fn data_set(cmd: &CmdOpt) -> Result<DataSetShape> {
    let (outer_len, inner_lens) = match cmd.data_set {
        ArgDataSet::Test => (10_000, vec![1_000]),
        ArgDataSet::Star => (
            16 * 2_usize.pow(20),
            vec![2_usize.pow(20), 2_usize.pow(16), 2_usize.pow(12)],
        ),
        ArgDataSet::Custom => (
            cmd.outer_rel_tuples.ok_or_else(|| {
                ErrorKind::InvalidArgument(
                    "Couldn't find outer relation size. Did you specify --outer-rel-tuples?"
                        .to_string(),
                )
            })?,
            cmd.inner_rel_tuples.clone(),
        ),
    };

    let join_types = broadcast("join types", &cmd.join_types, inner_lens.len())?;
    let join_methods = broadcast("join methods", &cmd.join_methods, inner_lens.len())?;

    Ok((outer_len, inner_lens, join_types, join_methods))
}

fn broadcast<T: Copy>(name: &str, values: &[T], depths: usize) -> Result<Vec<T>> {
    match values.len() {
        1 => Ok(vec![values[0]; depths]),
        n if n == depths => Ok(values.to_vec()),
        n => Err(ErrorKind::InvalidArgument(format!(
            "Expected 1 or {} {}, got {}",
            depths, name, n
        ))
        .into()),
    }
}

fn devices(cmd: &CmdOpt, plan: &JoinPlan) -> Result<DeviceSet> {
    match cmd.device_type {
        ArgDeviceType::Host => {
            let devices = HostDeviceSetBuilder::default()
                .devices(cmd.devices)
                .capacity(cmd.device_memory_bytes)
                .module(host_module(plan))
                .build()?;
            Ok(into_device_set(&devices)?)
        }
        ArgDeviceType::Cuda => cuda_devices(cmd),
    }
}

#[cfg(feature = "cuda")]
fn cuda_devices(cmd: &CmdOpt) -> Result<DeviceSet> {
    use gpu_runtime::runtime::{CudaDevice, Device};
    use std::sync::Arc;

    let path = cmd.kernel_image.as_ref().ok_or_else(|| {
        ErrorKind::InvalidArgument("CUDA devices require a --kernel-image".to_string())
    })?;
    let image = std::fs::read(path)?;

    let devices = (0..cmd.devices)
        .map(|id| -> Result<Arc<dyn Device>> {
            Ok(Arc::new(CudaDevice::new(id, id as u32, &image)?))
        })
        .collect::<Result<Vec<_>>>()?;
    Ok(DeviceSet::new(devices)?)
}

#[cfg(not(feature = "cuda"))]
fn cuda_devices(_cmd: &CmdOpt) -> Result<DeviceSet> {
    Err(ErrorKind::InvalidArgument(
        "CUDA devices require building with the \"cuda\" feature".to_string(),
    )
    .into())
}
