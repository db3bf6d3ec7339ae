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

use super::estimator::{Estimate, PriorAttempt, RuntimeStats, SizeEstimator};
use super::kernel_table::{KernelKind, KernelTable};
use crate::chunk::{row_destination, slot_destination, DataChunk, ResultChunk};
use crate::control::{
    control_len, kgjoin_len, ControlBlock, ERROR_CORRUPT, ERROR_INVALID_ARGUMENT, STATUS_ERROR,
    STATUS_NO_SPACE, STATUS_OK,
};
use crate::error::{Error, ErrorKind, Result};
use crate::inner::{Detach, DeviceMirror, InnerRelationSet};
use crate::plan::{JoinMethod, JoinPlan, ResultFormat};
use crate::stats::JoinStats;
use crate::tuple::to_u32;
use gpu_runtime::runtime::{
    Device, DeviceId, DevicePtr, DeviceSet, HostBuffer, KernelArg, LaunchDim, StreamHandle,
    DEFAULT_BLOCK_SIZE,
};
use std::sync::mpsc::Sender;
use std::sync::Arc;
use tracing::{debug, warn};

/// Overflowed attempts after which a task is given up.
const MAX_ATTEMPTS: u32 = 32;

/// Sent by a device callback when the stream of a task has finished.
#[derive(Debug)]
pub(crate) struct Completion {
    pub task: u64,
    pub result: gpu_runtime::error::Result<()>,
}

/// What a task joins.
#[derive(Clone, Debug)]
enum TaskKind {
    /// Joins an outer chunk with the window.
    Probe { outer: DataChunk },

    /// Emits the unmatched inner rows of right and full outer joins.
    Sweep,
}

/// Whether a launch was accepted by the device.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum Launch {
    Started,
    NoBuffer,
}

#[derive(Debug)]
pub(crate) enum Outcome {
    Success {
        chunk: ResultChunk,
        control: ControlBlock,
    },
    Overflow,
}

/// Everything a launch needs besides the task itself.
pub(crate) struct LaunchContext<'a> {
    pub plan: &'a JoinPlan,
    pub devices: &'a DeviceSet,
    pub kernels: &'a [KernelTable],
    pub sender: &'a Sender<Completion>,
    pub stats: &'a mut JoinStats,
}

/// Device resources of a running task.
#[derive(Debug)]
struct Running {
    device: DeviceId,
    stream: StreamHandle,
    kgjoin: DevicePtr,
    src: Option<DevicePtr>,
    dst: DevicePtr,
    control: HostBuffer,
    result: HostBuffer,
}

/// One unit of work: the rows `oitems_base..oitems_base + oitems_nums` of a
/// source, joined with one inner relation set on one device.
///
/// A task holds one reference to its set. The reference is passed on to
/// continuations and sweep tasks or dropped with `finish` and `discard`.
#[derive(Debug)]
pub(crate) struct JoinTask {
    id: u64,
    set: Arc<InnerRelationSet>,
    kind: TaskKind,
    start_depth: usize,
    oitems_base: usize,
    oitems_nums: usize,
    source_nitems: usize,
    estimate: Option<Estimate>,
    prior: PriorAttempt,
    attempts: u32,
    retained_dst: Option<(DeviceId, DevicePtr)>,
    running: Option<Running>,
}

impl JoinTask {
    /// Creates a task over a whole outer chunk. Takes over the reference
    /// held by `set`.
    pub fn probe(id: u64, set: Arc<InnerRelationSet>, outer: DataChunk) -> Self {
        let source_nitems = outer.nitems();
        Self::new(id, set, TaskKind::Probe { outer }, 1, 0, source_nitems, PriorAttempt::default())
    }

    /// Creates the terminal sweep task of a set. Takes over the reference
    /// handed out by `InnerRelationSet::detach`.
    pub fn sweep(id: u64, set: Arc<InnerRelationSet>, plan: &JoinPlan) -> Result<Self> {
        let start_depth = plan.outer_join_start_depth().ok_or_else(|| {
            ErrorKind::LogicError("Sweep task for a join without outer join depths".to_string())
        })?;
        let source_nitems = set.chunk(start_depth)?.nitems();

        Ok(Self::new(
            id,
            set,
            TaskKind::Sweep,
            start_depth,
            0,
            source_nitems,
            PriorAttempt::default(),
        ))
    }

    fn new(
        id: u64,
        set: Arc<InnerRelationSet>,
        kind: TaskKind,
        start_depth: usize,
        oitems_base: usize,
        source_nitems: usize,
        prior: PriorAttempt,
    ) -> Self {
        Self {
            id,
            set,
            kind,
            start_depth,
            oitems_base,
            oitems_nums: 0,
            source_nitems,
            estimate: None,
            prior,
            attempts: 0,
            retained_dst: None,
            running: None,
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn is_sweep(&self) -> bool {
        match self.kind {
            TaskKind::Sweep => true,
            TaskKind::Probe { .. } => false,
        }
    }

    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    pub fn set(&self) -> &Arc<InnerRelationSet> {
        &self.set
    }

    /// Sizes the buffers of the next attempt.
    pub fn resize(
        &mut self,
        plan: &JoinPlan,
        estimator: &SizeEstimator<'_>,
        stats: &RuntimeStats,
    ) -> Result<()> {
        let remaining = self.source_nitems.saturating_sub(self.oitems_base);
        let estimate = match self.kind {
            TaskKind::Probe { .. } => estimator.estimate(remaining, Some(stats), Some(&self.prior))?,
            TaskKind::Sweep => {
                let mut deeper = 0;
                for depth in self.start_depth + 1..=plan.num_rels() {
                    if plan.depth(depth)?.join_type.fills_inner() {
                        deeper += self.set.chunk(depth)?.nitems();
                    }
                }
                estimator.estimate(remaining + deeper, None, Some(&self.prior))?
            }
        };

        self.oitems_nums = std::cmp::min(estimate.oitems_nums as usize, remaining);
        self.estimate = Some(estimate);
        Ok(())
    }

    /// Takes over the source rows behind the admitted ones.
    ///
    /// Returns `None` if all rows were admitted.
    pub fn continuation(&self, id: u64, control: &ControlBlock) -> Result<Option<Self>> {
        let end = control.admitted().end;
        if end >= self.source_nitems {
            return Ok(None);
        }

        let set = self.set.attach()?;
        Ok(Some(Self::new(
            id,
            set,
            self.kind.clone(),
            self.start_depth,
            end,
            self.source_nitems,
            self.prior.for_continuation(),
        )))
    }

    /// Enqueues all work of one attempt on `device`.
    ///
    /// Returns `Launch::NoBuffer` if the device cannot allocate the buffers
    /// at this time. A destination kept from an earlier attempt is freed in
    /// that case, so the next attempt allocates a new one.
    pub fn launch(&mut self, device: DeviceId, ctx: &mut LaunchContext<'_>) -> Result<Launch> {
        if self.running.is_some() {
            Err(ErrorKind::LogicError(format!("Task {} is already running", self.id)))?;
        }
        let estimate = self.estimate.ok_or_else(|| {
            ErrorKind::LogicError(format!("Task {} was launched without sizes", self.id))
        })?;
        let dev = ctx.devices.get(device)?.clone();
        let num_rels = ctx.plan.num_rels();

        let ncols = ctx.plan.target_list.len();
        let nrooms = estimate.dst_nrooms as usize;
        let dst_header = match ctx.plan.result_format {
            ResultFormat::Row => row_destination(ncols, nrooms)?,
            ResultFormat::Slot => slot_destination(ncols, nrooms)?,
        };
        let dst_len = dst_header.length as usize;
        let dst_header = dst_header.to_bytes()?;
        let kgjoin_bytes = kgjoin_len(num_rels, estimate.kresults_nrooms as usize);
        let outer = match &self.kind {
            TaskKind::Probe { outer } => Some(outer.clone()),
            TaskKind::Sweep => None,
        };

        let retained = match self.retained_dst.take() {
            Some((id, ptr)) if id == device && ptr.len() >= dst_len => Some(ptr),
            Some((id, ptr)) => {
                ctx.devices.get(id)?.mem_free(ptr)?;
                None
            }
            None => None,
        };

        let mut lens = vec![kgjoin_bytes];
        if let Some(outer) = &outer {
            lens.push(outer.len());
        }
        if retained.is_none() {
            lens.push(dst_len);
        }
        let mut buffers = match alloc_all(&*dev, &lens)? {
            Some(buffers) => buffers,
            None => {
                if let Some(ptr) = retained {
                    dev.mem_free(ptr)?;
                }
                return Ok(Launch::NoBuffer);
            }
        };
        let dst = match retained {
            Some(ptr) => ptr,
            None => buffers.pop().ok_or_else(|| ErrorKind::LogicError("Missing buffer".into()))?,
        };
        let src = if outer.is_some() { buffers.pop() } else { None };
        let kgjoin = buffers.pop().ok_or_else(|| ErrorKind::LogicError("Missing buffer".into()))?;

        let free_buffers = |dev: &dyn Device| -> Result<()> {
            for ptr in std::iter::once(kgjoin).chain(src).chain(std::iter::once(dst)) {
                dev.mem_free(ptr)?;
            }
            Ok(())
        };

        let stream = match dev.stream_create() {
            Ok(stream) => stream,
            Err(e) => {
                free_buffers(&*dev)?;
                return Err(e.into());
            }
        };

        let mirror = match self.set.ensure_device(device, stream) {
            Ok(Some(mirror)) => mirror,
            Ok(None) => {
                free_buffers(&*dev)?;
                dev.stream_destroy(stream)?;
                return Ok(Launch::NoBuffer);
            }
            Err(e) => {
                free_buffers(&*dev)?;
                dev.stream_destroy(stream)?;
                return Err(e);
            }
        };

        let running = Running {
            device,
            stream,
            kgjoin,
            src,
            dst,
            control: HostBuffer::zeroed(control_len(num_rels)),
            result: HostBuffer::zeroed(dst_len),
        };

        let enqueued = self.enqueue(
            &*dev,
            &running,
            &mirror,
            estimate,
            outer.as_ref(),
            dst_header,
            ctx,
        );
        if let Err(e) = enqueued {
            free_buffers(&*dev)?;
            dev.stream_destroy(stream)?;
            self.set.release_device(device)?;
            return Err(e);
        }

        debug!(
            task = self.id,
            device,
            sweep = self.is_sweep(),
            oitems_base = self.oitems_base,
            oitems_nums = self.oitems_nums,
            kresults_nrooms = estimate.kresults_nrooms,
            dst_nrooms = estimate.dst_nrooms,
            attempt = self.attempts,
            "Launched join task"
        );
        ctx.stats.tasks_launched += 1;
        self.running = Some(running);
        Ok(Launch::Started)
    }

    #[allow(clippy::too_many_arguments)]
    fn enqueue(
        &self,
        dev: &dyn Device,
        running: &Running,
        mirror: &DeviceMirror,
        estimate: Estimate,
        outer: Option<&DataChunk>,
        dst_header: Vec<u8>,
        ctx: &mut LaunchContext<'_>,
    ) -> Result<()> {
        let plan = ctx.plan;
        let num_rels = plan.num_rels();
        let stream = running.stream;
        let kernels = ctx.kernels.get(running.device).ok_or_else(|| {
            ErrorKind::LogicError(format!("No kernels for device {}", running.device))
        })?;

        let mut control = ControlBlock::new(num_rels, self.start_depth)?;
        control.oitems_base = to_u32(self.oitems_base, "Source offset")?;
        control.oitems_nums = to_u32(self.oitems_nums, "Admitted rows")?;
        control.kresults_nrooms = estimate.kresults_nrooms;
        control.source_nitems = to_u32(self.source_nitems, "Source rows")?;
        let control = control.to_bytes()?;

        let mut uploaded = mirror.uploaded_bytes + control.len() + dst_header.len();
        dev.memcpy_htod_async(running.kgjoin, 0, control.into(), stream)?;
        if let (Some(src), Some(outer)) = (running.src, outer) {
            dev.memcpy_htod_async(src, 0, outer.image().clone(), stream)?;
            uploaded += outer.len();
        }
        dev.memcpy_htod_async(running.dst, 0, dst_header.into(), stream)?;

        if self.is_sweep() {
            for depth in self.start_depth..=num_rels {
                if plan.depth(depth)?.join_type.fills_inner() {
                    ctx.stats.bytes_colocated +=
                        self.set
                            .colocate_outer_join_map(depth, running.device, stream)?;
                }
            }
        }

        let kmrels = KernelArg::from(mirror.kmrels);
        let kgjoin = KernelArg::from(running.kgjoin);
        let src = KernelArg::from(running.src);
        let ojmap = KernelArg::from(mirror.ojmap);
        let nrooms = estimate.kresults_nrooms as usize;
        let mut launches = 0;
        let mut launch = |kind: KernelKind, dim: LaunchDim, args: &[KernelArg]| -> Result<()> {
            dev.launch_async(kernels.get(kind), &dim, args, stream)?;
            launches += 1;
            Ok(())
        };

        for depth in self.start_depth..=num_rels {
            let depth_plan = plan.depth(depth)?;
            let depth_arg = KernelArg::from(to_u32(depth, "Depth")?);

            launch(
                KernelKind::Prepare,
                LaunchDim::linear(nrooms, DEFAULT_BLOCK_SIZE)?,
                &[kgjoin, kmrels, src, depth_arg],
            )?;

            if !(self.is_sweep() && depth == self.start_depth) {
                let dim = match depth_plan.method {
                    JoinMethod::NestLoop => {
                        let inner_nitems = self.set.chunk(depth)?.nitems();
                        LaunchDim::planar(nrooms, inner_nitems, 32, 8)?
                    }
                    JoinMethod::Hash => LaunchDim::linear(nrooms, DEFAULT_BLOCK_SIZE)?,
                };
                launch(
                    KernelKind::probe(depth_plan.method),
                    dim,
                    &[
                        kgjoin,
                        kmrels,
                        src,
                        depth_arg,
                        ojmap,
                        KernelArg::from(to_u32(running.device, "Device")?),
                    ],
                )?;
            }

            if self.is_sweep() && depth_plan.join_type.fills_inner() {
                let inner_nitems = self.set.chunk(depth)?.nitems();
                launch(
                    KernelKind::sweep(depth_plan.method),
                    LaunchDim::linear(inner_nitems, DEFAULT_BLOCK_SIZE)?,
                    &[kgjoin, kmrels, src, depth_arg, ojmap],
                )?;
            }
        }

        launch(
            KernelKind::project(plan.result_format),
            LaunchDim::linear(nrooms, DEFAULT_BLOCK_SIZE)?,
            &[kgjoin, kmrels, src, KernelArg::from(running.dst)],
        )?;

        let control_bytes = control_len(num_rels);
        dev.memcpy_dtoh_async(&running.control, running.kgjoin, 0, control_bytes, stream)?;
        let result_bytes = running.result.len()?;
        dev.memcpy_dtoh_async(&running.result, running.dst, 0, result_bytes, stream)?;

        let sender = ctx.sender.clone();
        let task = self.id;
        dev.stream_add_callback(
            stream,
            Box::new(move |result| {
                if sender.send(Completion { task, result }).is_err() {
                    warn!(task, "Join task completed after the join was closed");
                }
            }),
        )?;

        ctx.stats.kernels_launched += launches;
        ctx.stats.bytes_uploaded += uploaded;
        Ok(())
    }

    /// Processes the completion of the running attempt and frees its
    /// buffers. The destination is kept for a retry after an overflow.
    pub fn complete(
        &mut self,
        result: gpu_runtime::error::Result<()>,
        devices: &DeviceSet,
        stats: &mut JoinStats,
    ) -> Result<Outcome> {
        let running = self.running.take().ok_or_else(|| {
            ErrorKind::LogicError(format!("Task {} completed without running", self.id))
        })?;
        let dev = devices.get(running.device)?.clone();

        let released = self.release_running(&*dev, &running);
        let outcome = released
            .and(result.map_err(Error::from))
            .and_then(|()| self.interpret(&running, stats));

        match outcome {
            Ok(Outcome::Overflow) => self.retained_dst = Some((running.device, running.dst)),
            _ => dev.mem_free(running.dst)?,
        }
        outcome
    }

    fn release_running(&self, dev: &dyn Device, running: &Running) -> Result<()> {
        dev.mem_free(running.kgjoin)?;
        if let Some(src) = running.src {
            dev.mem_free(src)?;
        }
        dev.stream_destroy(running.stream)?;
        self.set.release_device(running.device)
    }

    fn interpret(&mut self, running: &Running, stats: &mut JoinStats) -> Result<Outcome> {
        let control = ControlBlock::read(&running.control.lock()?)?;
        stats.bytes_downloaded += running.control.len()? + running.result.len()?;

        match control.status {
            STATUS_OK => {
                let chunk = ResultChunk::new(DataChunk::from_image(running.result.take()?)?)?;
                Ok(Outcome::Success { chunk, control })
            }
            STATUS_NO_SPACE => {
                self.prior.record(&control);
                self.attempts += 1;
                debug!(
                    task = self.id,
                    attempt = self.attempts,
                    kresults_needed = control.kresults_needed,
                    kresults_nrooms = control.kresults_nrooms,
                    dst_needed = control.dst_needed,
                    "Join task ran out of result buffer space"
                );
                if self.attempts >= MAX_ATTEMPTS {
                    Err(ErrorKind::ResultGrowthTooLarge(format!(
                        "Task {} overflowed its buffers {} times",
                        self.id, self.attempts
                    )))?;
                }
                Ok(Outcome::Overflow)
            }
            STATUS_ERROR => {
                let kernel = KernelKind::from_code(control.error_kernel)
                    .map_or_else(|| format!("kernel #{}", control.error_kernel), |k| {
                        k.name().to_string()
                    });
                let message = match control.error_code {
                    ERROR_CORRUPT => "malformed device image".to_string(),
                    ERROR_INVALID_ARGUMENT => "invalid kernel argument".to_string(),
                    code => format!("error code {}", code),
                };
                Err(ErrorKind::KernelFailed(kernel, control.error_depth, message).into())
            }
            status => Err(ErrorKind::CorruptChunk(format!(
                "Unknown task status {}",
                status
            ))
            .into()),
        }
    }

    /// Drops the reference to the set after a successful task. On error, the
    /// task still holds its reference and must be discarded.
    pub fn finish(&mut self, devices: &DeviceSet) -> Result<Detach> {
        self.release_retained(devices)?;
        self.set.detach(true)
    }

    /// Drops the task without triggering a sweep.
    pub fn discard(mut self, devices: &DeviceSet) -> Result<()> {
        if self.running.is_some() {
            Err(ErrorKind::LogicError(format!(
                "Discarded task {} while it is running",
                self.id
            )))?;
        }
        self.release_retained(devices)?;
        self.set.detach(false).map(|_| ())
    }

    /// Frees the destination kept for a retry. Returns whether there was
    /// one.
    pub fn release_retained(&mut self, devices: &DeviceSet) -> Result<bool> {
        match self.retained_dst.take() {
            Some((device, ptr)) => {
                devices.get(device)?.mem_free(ptr)?;
                Ok(true)
            }
            None => Ok(false),
        }
    }
}

/// Allocates all buffers or none.
fn alloc_all(dev: &dyn Device, lens: &[usize]) -> Result<Option<Vec<DevicePtr>>> {
    let mut buffers = Vec::with_capacity(lens.len());
    for &len in lens {
        match dev.mem_alloc(len)? {
            Some(ptr) => buffers.push(ptr),
            None => {
                for ptr in buffers {
                    dev.mem_free(ptr)?;
                }
                return Ok(None);
            }
        }
    }
    Ok(Some(buffers))
}
