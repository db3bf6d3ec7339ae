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

use super::join_bench::JoinBench;
use crate::error::{ErrorKind, Result};
use crate::types::*;
use crate::CmdOpt;
use serde::Serializer;
use serde_derive::Serialize;
use std::string::ToString;
use std::time::Duration;

#[derive(Clone, Debug, Default, Serialize)]
pub struct DataPoint {
    pub data_set: Option<String>,
    pub hostname: String,
    pub device_type: Option<ArgDeviceType>,
    pub devices: Option<usize>,
    pub device_memory_bytes: Option<usize>,
    #[serde(serialize_with = "serialize_vec")]
    pub join_types: Option<Vec<ArgJoinType>>,
    #[serde(serialize_with = "serialize_vec")]
    pub join_methods: Option<Vec<ArgJoinMethod>>,
    pub result_format: Option<ArgResultFormat>,
    pub distribution: Option<ArgDistribution>,
    pub zipf_exponent: Option<f64>,
    pub selectivity: Option<u32>,
    pub chunk_bytes: Option<usize>,
    pub chunk_limit_bytes: Option<usize>,
    pub max_async_tasks: Option<usize>,
    pub outer_tuples: Option<usize>,
    #[serde(serialize_with = "serialize_vec")]
    pub inner_tuples: Option<Vec<usize>>,
    pub warm_up: Option<bool>,
    pub result_rows: Option<usize>,
    pub join_ns: Option<f64>,
    pub inner_load_ns: Option<f64>,
    pub tasks_launched: Option<usize>,
    pub retries: Option<usize>,
    pub continuations: Option<usize>,
    pub sweep_tasks: Option<usize>,
    pub windows: Option<usize>,
    pub inner_sub_chunks: Option<usize>,
    pub bytes_uploaded: Option<usize>,
    pub bytes_downloaded: Option<usize>,
    pub bytes_colocated: Option<usize>,
    pub relation_gen_ns: Option<f64>,
}

impl DataPoint {
    pub fn new() -> Result<DataPoint> {
        let hostname = hostname::get()?
            .into_string()
            .map_err(|_| ErrorKind::InvalidArgument("Hostname is not valid UTF-8".to_string()))?;

        let dp = DataPoint {
            hostname,
            ..DataPoint::default()
        };

        Ok(dp)
    }

    pub fn fill_from_cmd_options(&self, cmd: &CmdOpt) -> Result<DataPoint> {
        let dp = DataPoint {
            data_set: Some(cmd.data_set.to_string()),
            device_type: Some(cmd.device_type),
            devices: Some(cmd.devices),
            device_memory_bytes: if cmd.device_type == ArgDeviceType::Host {
                Some(cmd.device_memory_bytes)
            } else {
                None
            },
            result_format: Some(cmd.result_format),
            distribution: Some(cmd.distribution),
            zipf_exponent: if cmd.distribution == ArgDistribution::Zipf {
                Some(cmd.zipf_exponent)
            } else {
                None
            },
            selectivity: Some(cmd.selectivity),
            chunk_bytes: Some(cmd.chunk_bytes),
            chunk_limit_bytes: Some(cmd.chunk_limit_bytes),
            max_async_tasks: Some(cmd.max_async_tasks),
            ..self.clone()
        };

        Ok(dp)
    }

    pub fn fill_from_join_bench(
        &self,
        bench: &JoinBench,
        join_types: Vec<ArgJoinType>,
        join_methods: Vec<ArgJoinMethod>,
    ) -> DataPoint {
        DataPoint {
            join_types: Some(join_types),
            join_methods: Some(join_methods),
            outer_tuples: Some(bench.outer_len()),
            inner_tuples: Some(bench.inner_lens()),
            ..self.clone()
        }
    }

    pub fn set_init_time(&self, data_gen: Duration) -> DataPoint {
        DataPoint {
            relation_gen_ns: Some(data_gen.as_nanos() as f64),
            ..self.clone()
        }
    }
}

/// Serialize `Option<Vec<T>>` by converting it into a `String`.
///
/// This is necessary because the `csv` crate does not support nesting `Vec`
/// instead of flattening it.
fn serialize_vec<S, T>(option: &Option<Vec<T>>, ser: S) -> std::result::Result<S::Ok, S::Error>
where
    S: Serializer,
    T: ToString,
{
    if let Some(vec) = option {
        let record = vec
            .iter()
            .map(|e| e.to_string())
            .collect::<Vec<_>>()
            .join(",");
        ser.serialize_str(&record)
    } else {
        ser.serialize_none()
    }
}
