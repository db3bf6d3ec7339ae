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

use crate::error::Result;
use crate::plan::{JoinMethod, ResultFormat};
use gpu_runtime::runtime::{Device, KernelHandle};

/// The device entry points of a join.
///
/// Calling conventions, with pointers that may be NULL marked as optional:
///
/// - `prepare(kgjoin, kmrels, src?, depth)`
/// - `probe_nestloop(kgjoin, kmrels, src?, depth, ojmap?, device_index)`
/// - `probe_hashjoin(kgjoin, kmrels, src?, depth, ojmap?, device_index)`
/// - `sweep_outer_nestloop(kgjoin, kmrels, src?, depth, ojmap?)`
/// - `sweep_outer_hashjoin(kgjoin, kmrels, src?, depth, ojmap?)`
/// - `project_row(kgjoin, kmrels, src?, dst)`
/// - `project_slot(kgjoin, kmrels, src?, dst)`
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum KernelKind {
    Prepare,
    ProbeNestLoop,
    ProbeHashJoin,
    SweepOuterNestLoop,
    SweepOuterHashJoin,
    ProjectRow,
    ProjectSlot,
}

impl KernelKind {
    pub const ALL: [KernelKind; 7] = [
        KernelKind::Prepare,
        KernelKind::ProbeNestLoop,
        KernelKind::ProbeHashJoin,
        KernelKind::SweepOuterNestLoop,
        KernelKind::SweepOuterHashJoin,
        KernelKind::ProjectRow,
        KernelKind::ProjectSlot,
    ];

    pub fn name(self) -> &'static str {
        match self {
            KernelKind::Prepare => "prepare",
            KernelKind::ProbeNestLoop => "probe_nestloop",
            KernelKind::ProbeHashJoin => "probe_hashjoin",
            KernelKind::SweepOuterNestLoop => "sweep_outer_nestloop",
            KernelKind::SweepOuterHashJoin => "sweep_outer_hashjoin",
            KernelKind::ProjectRow => "project_row",
            KernelKind::ProjectSlot => "project_slot",
        }
    }

    /// Identifies the kernel in the control block.
    pub fn code(self) -> u32 {
        Self::ALL.iter().position(|&k| k == self).unwrap_or(0) as u32
    }

    pub fn from_code(code: u32) -> Option<Self> {
        Self::ALL.get(code as usize).copied()
    }

    pub fn probe(method: JoinMethod) -> Self {
        match method {
            JoinMethod::NestLoop => KernelKind::ProbeNestLoop,
            JoinMethod::Hash => KernelKind::ProbeHashJoin,
        }
    }

    pub fn sweep(method: JoinMethod) -> Self {
        match method {
            JoinMethod::NestLoop => KernelKind::SweepOuterNestLoop,
            JoinMethod::Hash => KernelKind::SweepOuterHashJoin,
        }
    }

    pub fn project(format: ResultFormat) -> Self {
        match format {
            ResultFormat::Row => KernelKind::ProjectRow,
            ResultFormat::Slot => KernelKind::ProjectSlot,
        }
    }
}

/// Kernel handles of one device, resolved once per join.
#[derive(Clone, Debug)]
pub struct KernelTable {
    handles: Vec<KernelHandle>,
}

impl KernelTable {
    pub fn resolve(device: &dyn Device) -> Result<Self> {
        let handles = KernelKind::ALL
            .iter()
            .map(|kind| device.function(kind.name()))
            .collect::<gpu_runtime::error::Result<Vec<_>>>()?;
        Ok(Self { handles })
    }

    pub fn get(&self, kind: KernelKind) -> KernelHandle {
        self.handles[kind.code() as usize]
    }
}
