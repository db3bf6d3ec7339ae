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

use crate::chunk::{DataChunk, MultiRelations};
use crate::error::{poisoned, ErrorKind, Result};
use crate::plan::JoinPlan;
use gpu_runtime::runtime::{DeviceId, DevicePtr, DeviceSet, EventHandle, StreamHandle};
use std::sync::{Arc, Mutex};
use tracing::{debug, warn};

/// Device memory of an inner relation set on one device.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DeviceMirror {
    pub kmrels: DevicePtr,

    /// The outer join map, if any depth emits unmatched inner rows.
    pub ojmap: Option<DevicePtr>,

    /// Bytes uploaded by this call.
    pub uploaded_bytes: usize,
}

/// Outcome of `InnerRelationSet::detach`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Detach {
    /// Other references remain.
    Retained,

    /// The last reference is gone and all device resources are freed.
    Released,

    /// The last reference is handed over to the terminal sweep task, which
    /// must be issued now.
    SweepRequired,
}

#[derive(Debug, Default)]
struct DeviceState {
    refcnt: usize,
    mirror: Option<DevicePtr>,
    event: Option<EventHandle>,
    ojmap: Option<DevicePtr>,
}

#[derive(Debug)]
struct SetState {
    refcnt: usize,
    sweep_issued: bool,
    devices: Vec<DeviceState>,
}

impl SetState {
    fn device(&mut self, device: DeviceId) -> Result<&mut DeviceState> {
        self.devices
            .get_mut(device)
            .ok_or_else(|| ErrorKind::InvalidArgument(format!("Unknown device {}", device)).into())
    }
}

/// A window of the inner relations: one sub-chunk per depth.
///
/// The set is shared by all tasks that join an outer chunk with this window.
/// Each task holds one reference, and additionally one per-device reference
/// while it runs on a device. A device mirror is uploaded on the first
/// per-device reference and freed when the last one is released. The outer
/// join maps survive until the set is released, so that the terminal sweep
/// can combine the matches of all devices.
#[derive(Debug)]
pub struct InnerRelationSet {
    window: Vec<usize>,
    chunks: Vec<DataChunk>,
    kmrels: MultiRelations,
    needs_sweep: bool,
    devices: DeviceSet,
    state: Mutex<SetState>,
}

impl InnerRelationSet {
    /// Creates a set holding one reference.
    pub fn new(
        plan: &JoinPlan,
        window: Vec<usize>,
        chunks: Vec<DataChunk>,
        devices: DeviceSet,
    ) -> Result<Arc<Self>> {
        let kmrels = MultiRelations::build(plan, &chunks, devices.len())?;
        let state = SetState {
            refcnt: 1,
            sweep_issued: false,
            devices: (0..devices.len()).map(|_| DeviceState::default()).collect(),
        };

        Ok(Arc::new(Self {
            window,
            chunks,
            kmrels,
            needs_sweep: plan.outer_join_start_depth().is_some(),
            devices,
            state: Mutex::new(state),
        }))
    }

    /// Index of the sub-chunk per depth.
    pub fn window(&self) -> &[usize] {
        &self.window
    }

    /// Returns the sub-chunk of `depth`, counting from 1.
    pub fn chunk(&self, depth: usize) -> Result<&DataChunk> {
        depth
            .checked_sub(1)
            .and_then(|i| self.chunks.get(i))
            .ok_or_else(|| ErrorKind::InvalidArgument(format!("No such depth: {}", depth)).into())
    }

    pub fn kmrels(&self) -> &MultiRelations {
        &self.kmrels
    }

    pub fn refcnt(&self) -> Result<usize> {
        Ok(self.state.lock().map_err(poisoned)?.refcnt)
    }

    pub fn device_refcnt(&self, device: DeviceId) -> Result<usize> {
        Ok(self.state.lock().map_err(poisoned)?.device(device)?.refcnt)
    }

    /// Adds a reference.
    pub fn attach(self: &Arc<Self>) -> Result<Arc<Self>> {
        let mut state = self.state.lock().map_err(poisoned)?;
        if state.refcnt == 0 {
            Err(ErrorKind::LogicError(
                "Attached to a released inner relation set".to_string(),
            ))?;
        }
        state.refcnt += 1;
        Ok(self.clone())
    }

    /// Adds a per-device reference and returns the device mirror.
    ///
    /// The first reference on a device allocates the mirror and uploads the
    /// image in `stream`. Later references make `stream` wait until the
    /// upload has finished. Returns `None` if the device cannot allocate the
    /// mirror at this time.
    pub fn ensure_device(
        &self,
        device: DeviceId,
        stream: StreamHandle,
    ) -> Result<Option<DeviceMirror>> {
        let dev = self.devices.get(device)?;

        let existing_ojmap = {
            let mut state = self.state.lock().map_err(poisoned)?;
            let slot = state.device(device)?;
            if let (Some(kmrels), Some(event)) = (slot.mirror, slot.event) {
                slot.refcnt += 1;
                let ojmap = slot.ojmap;
                drop(state);

                if let Err(e) = dev.stream_wait_event(stream, event) {
                    self.release_device(device)?;
                    return Err(e.into());
                }
                return Ok(Some(DeviceMirror {
                    kmrels,
                    ojmap,
                    uploaded_bytes: 0,
                }));
            }
            slot.ojmap
        };

        let kmrels = match dev.mem_alloc(self.kmrels.len())? {
            Some(ptr) => ptr,
            None => return Ok(None),
        };

        let (ojmap, fresh_ojmap) = match (self.kmrels.ojmap_len(), existing_ojmap) {
            (0, _) => (None, false),
            (_, Some(ptr)) => (Some(ptr), false),
            (len, None) => match dev.mem_alloc(len)? {
                Some(ptr) => (Some(ptr), true),
                None => {
                    dev.mem_free(kmrels)?;
                    return Ok(None);
                }
            },
        };

        dev.memcpy_htod_async(kmrels, 0, self.kmrels.image().clone(), stream)?;
        if let (Some(ptr), true) = (ojmap, fresh_ojmap) {
            dev.memset_async(ptr, 0, stream)?;
        }
        let event = dev.event_create()?;
        dev.event_record(event, stream)?;

        let mut state = self.state.lock().map_err(poisoned)?;
        let slot = state.device(device)?;
        if slot.mirror.is_some() || slot.refcnt != 0 {
            Err(ErrorKind::LogicError(format!(
                "Concurrent upload of an inner relation set to device {}",
                device
            )))?;
        }
        slot.refcnt = 1;
        slot.mirror = Some(kmrels);
        slot.event = Some(event);
        slot.ojmap = ojmap;

        debug!(
            device,
            window = ?self.window,
            bytes = self.kmrels.len(),
            "Uploading inner relation set"
        );

        Ok(Some(DeviceMirror {
            kmrels,
            ojmap,
            uploaded_bytes: self.kmrels.len(),
        }))
    }

    /// Drops a per-device reference. The last reference frees the device
    /// mirror; the outer join map is kept.
    pub fn release_device(&self, device: DeviceId) -> Result<()> {
        let (mirror, event) = {
            let mut state = self.state.lock().map_err(poisoned)?;
            let slot = state.device(device)?;
            if slot.refcnt == 0 {
                Err(ErrorKind::LogicError(format!(
                    "Released device {} without a reference",
                    device
                )))?;
            }
            slot.refcnt -= 1;
            if slot.refcnt > 0 {
                return Ok(());
            }
            (slot.mirror.take(), slot.event.take())
        };

        let dev = self.devices.get(device)?;
        if let Some(ptr) = mirror {
            dev.mem_free(ptr)?;
        }
        if let Some(event) = event {
            dev.event_destroy(event)?;
        }
        Ok(())
    }

    /// Copies the match bits of `depth` from all other devices into the
    /// outer join map of `target`.
    ///
    /// Returns the number of bytes copied. The target must hold a device
    /// reference.
    pub fn colocate_outer_join_map(
        &self,
        depth: usize,
        target: DeviceId,
        stream: StreamHandle,
    ) -> Result<usize> {
        let layout = *self.kmrels.layout(depth)?;
        if layout.ojmap_slot_len == 0 {
            return Ok(0);
        }

        let (target_map, sources) = {
            let mut state = self.state.lock().map_err(poisoned)?;
            let target_map = state.device(target)?.ojmap.ok_or_else(|| {
                ErrorKind::LogicError(format!("Device {} has no outer join map", target))
            })?;
            let sources = state
                .devices
                .iter()
                .enumerate()
                .filter(|&(id, _)| id != target)
                .filter_map(|(id, slot)| slot.ojmap.map(|ptr| (id, ptr)))
                .collect::<Vec<_>>();
            (target_map, sources)
        };

        let dev = self.devices.get(target)?;
        let mut bytes = 0;
        for (source, ptr) in sources {
            let range = layout.ojmap_slot(source);
            dev.memcpy_peer_async(target_map, range.start, ptr, range.start, range.len(), stream)?;
            bytes += range.len();
        }

        Ok(bytes)
    }

    /// Drops a reference.
    ///
    /// If this is the last reference of a set that needs a sweep which was
    /// not issued yet, and `may_trigger_sweep` is set, the reference is kept
    /// for the sweep task and `Detach::SweepRequired` is returned.
    pub fn detach(&self, may_trigger_sweep: bool) -> Result<Detach> {
        let leftovers = {
            let mut state = self.state.lock().map_err(poisoned)?;
            if state.refcnt == 0 {
                Err(ErrorKind::LogicError(
                    "Detached from a released inner relation set".to_string(),
                ))?;
            }
            if state.refcnt == 1 && may_trigger_sweep && self.needs_sweep && !state.sweep_issued {
                state.sweep_issued = true;
                return Ok(Detach::SweepRequired);
            }

            state.refcnt -= 1;
            if state.refcnt > 0 {
                return Ok(Detach::Retained);
            }
            take_resources(&mut state)
        };

        self.free_resources(leftovers)?;
        Ok(Detach::Released)
    }

    fn free_resources(&self, leftovers: Vec<(DeviceId, DeviceState)>) -> Result<()> {
        for (id, slot) in leftovers {
            if slot.refcnt > 0 {
                warn!(device = id, refcnt = slot.refcnt, "Freeing a device mirror in use");
            }
            let dev = self.devices.get(id)?;
            for ptr in slot.mirror.into_iter().chain(slot.ojmap.into_iter()) {
                dev.mem_free(ptr)?;
            }
            if let Some(event) = slot.event {
                dev.event_destroy(event)?;
            }
        }
        Ok(())
    }
}

fn take_resources(state: &mut SetState) -> Vec<(DeviceId, DeviceState)> {
    state
        .devices
        .iter_mut()
        .enumerate()
        .filter(|(_, slot)| slot.mirror.is_some() || slot.ojmap.is_some() || slot.event.is_some())
        .map(|(id, slot)| (id, std::mem::take(slot)))
        .collect()
}

impl Drop for InnerRelationSet {
    fn drop(&mut self) {
        let leftovers = match self.state.get_mut() {
            Ok(state) => take_resources(state),
            Err(_) => return,
        };
        if !leftovers.is_empty() {
            if let Err(e) = self.free_resources(leftovers) {
                warn!("Failed to free inner relation set: {}", e);
            }
        }
    }
}
