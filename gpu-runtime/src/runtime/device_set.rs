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

use super::{Device, DeviceId};
use crate::error::{ErrorKind, Result};
use std::sync::Arc;

/// The devices that cooperate on one query.
///
/// Device IDs are positions within the set. Memory of one device is
/// reachable from every other device of the set by peer copies.
#[derive(Clone, Debug)]
pub struct DeviceSet {
    devices: Vec<Arc<dyn Device>>,
}

impl DeviceSet {
    pub fn new(devices: Vec<Arc<dyn Device>>) -> Result<Self> {
        if devices.is_empty() {
            Err(ErrorKind::InvalidArgument(
                "Device set requires at least one device".to_string(),
            ))?;
        }

        if let Some((pos, dev)) = devices
            .iter()
            .enumerate()
            .find(|(pos, dev)| dev.id() != *pos)
        {
            Err(ErrorKind::InvalidArgument(format!(
                "Device {} has ID {}, but is at position {}",
                dev.name(),
                dev.id(),
                pos
            )))?;
        }

        Ok(Self { devices })
    }

    pub fn len(&self) -> usize {
        self.devices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.devices.is_empty()
    }

    pub fn get(&self, id: DeviceId) -> Result<&Arc<dyn Device>> {
        self.devices.get(id).ok_or_else(|| {
            ErrorKind::InvalidArgument(format!("Unknown device ID {}", id)).into()
        })
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<dyn Device>> {
        self.devices.iter()
    }

    /// Total memory of the smallest device.
    pub fn min_capacity(&self) -> Result<usize> {
        self.devices
            .iter()
            .map(|dev| dev.mem_info().map(|info| info.total))
            .collect::<Result<Vec<_>>>()
            .map(|totals| totals.into_iter().min().unwrap_or(0))
    }
}
