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

use serde_derive::Serialize;

/// Runtime counters of a join.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct JoinStats {
    /// Task attempts started on a device, including retries.
    pub tasks_launched: usize,

    /// Attempts that ran out of buffer space.
    pub retries: usize,

    /// Tasks that took over unadmitted source rows.
    pub continuations: usize,

    pub sweep_tasks: usize,

    /// Inner windows joined.
    pub windows: usize,

    pub inner_sub_chunks: usize,
    pub result_chunks: usize,
    pub result_rows: usize,
    pub bytes_uploaded: usize,
    pub bytes_downloaded: usize,

    /// Bytes of outer join maps copied between devices.
    pub bytes_colocated: usize,

    pub kernels_launched: usize,

    /// Nanoseconds spent loading the inner relations.
    pub inner_load_ns: u64,
}
