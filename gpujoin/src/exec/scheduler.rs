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

use super::estimator::{RuntimeStats, SizeEstimator};
use super::kernel_table::KernelTable;
use super::odometer::Odometer;
use super::task::{Completion, JoinTask, Launch, LaunchContext, Outcome};
use crate::chunk::{DataChunk, ResultChunk, RowStoreBuilder};
use crate::config::JoinConfig;
use crate::control::ControlBlock;
use crate::error::{ErrorKind, Result};
use crate::inner::{Detach, InnerChunks, InnerRelationLoader, InnerRelationSet};
use crate::plan::JoinPlan;
use crate::source::RowSource;
use crate::stats::JoinStats;
use crate::tuple::Row;
use gpu_runtime::runtime::{DeviceId, DeviceSet};
use std::collections::{HashMap, VecDeque};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Drives a join: produces tasks from the outer relation and the inner
/// windows, launches them on the devices, and collects their results.
///
/// All bookkeeping happens on the thread that calls `next`. Devices only
/// send completion messages.
pub(crate) struct TaskScheduler {
    plan: Arc<JoinPlan>,
    config: JoinConfig,
    devices: DeviceSet,
    kernels: Vec<KernelTable>,
    outer: Box<dyn RowSource>,
    inners: Vec<Box<dyn RowSource>>,
    inner_chunks: Option<InnerChunks>,
    odometer: Option<Odometer>,
    current: Option<Arc<InnerRelationSet>>,
    outer_exhausted: bool,
    carry: Option<Row>,
    scan_done: bool,
    aborted: bool,
    pending: VecDeque<JoinTask>,
    running: HashMap<u64, JoinTask>,
    completed: VecDeque<Result<ResultChunk>>,
    sender: Sender<Completion>,
    receiver: Receiver<Completion>,
    next_device: DeviceId,
    stalled: Vec<bool>,
    runtime: RuntimeStats,
    stats: JoinStats,
    next_task_id: u64,
}

impl TaskScheduler {
    pub fn new(
        plan: JoinPlan,
        config: JoinConfig,
        devices: DeviceSet,
        outer: Box<dyn RowSource>,
        inners: Vec<Box<dyn RowSource>>,
    ) -> Result<Self> {
        plan.validate()?;
        config.validate()?;
        if outer.ncols() != plan.outer_ncols {
            Err(ErrorKind::InvalidArgument(format!(
                "Outer relation has {} columns, expected {}",
                outer.ncols(),
                plan.outer_ncols
            )))?;
        }
        if inners.len() != plan.num_rels() {
            Err(ErrorKind::InvalidArgument(format!(
                "Expected {} inner relations, got {}",
                plan.num_rels(),
                inners.len()
            )))?;
        }

        let kernels = devices
            .iter()
            .map(|dev| KernelTable::resolve(&**dev))
            .collect::<Result<Vec<_>>>()?;
        let (sender, receiver) = mpsc::channel();
        let num_rels = plan.num_rels();
        let ndevs = devices.len();

        Ok(Self {
            plan: Arc::new(plan),
            config,
            devices,
            kernels,
            outer,
            inners,
            inner_chunks: None,
            odometer: None,
            current: None,
            outer_exhausted: false,
            carry: None,
            scan_done: false,
            aborted: false,
            pending: VecDeque::new(),
            running: HashMap::new(),
            completed: VecDeque::new(),
            sender,
            receiver,
            next_device: 0,
            stalled: vec![false; ndevs],
            runtime: RuntimeStats::new(num_rels),
            stats: JoinStats::default(),
            next_task_id: 0,
        })
    }

    pub fn stats(&self) -> &JoinStats {
        &self.stats
    }

    /// Returns the next result chunk in completion order, or `None` at the
    /// end of the scan.
    ///
    /// The first error aborts the join: all tasks are drained and all inner
    /// relation sets are released.
    pub fn next(&mut self) -> Result<Option<ResultChunk>> {
        if self.aborted {
            Err(ErrorKind::LogicError(
                "The join was aborted by an earlier error".to_string(),
            ))?;
        }

        loop {
            match self.completed.pop_front() {
                Some(Ok(chunk)) => return Ok(Some(chunk)),
                Some(Err(e)) => {
                    self.abort();
                    return Err(e);
                }
                None => {}
            }

            match self.step() {
                Ok(true) => return Ok(None),
                Ok(false) => {}
                Err(e) => {
                    self.abort();
                    return Err(e);
                }
            }
        }
    }

    /// Restarts the join.
    ///
    /// The inner relations are reloaded only if one of them reports changed
    /// parameters. Otherwise, the loaded sub-chunks are reused.
    pub fn rescan(&mut self) -> Result<()> {
        self.drain()?;

        if self.inners.iter().any(|inner| inner.params_changed()) {
            info!("Inner relation parameters changed, reloading on the next fetch");
            for inner in self.inners.iter_mut() {
                inner.rescan()?;
            }
            self.inner_chunks = None;
            self.odometer = None;
        } else if let Some(odometer) = self.odometer.as_mut() {
            odometer.reset();
        }

        self.outer.rescan()?;
        self.outer_exhausted = false;
        self.carry = None;
        self.scan_done = false;
        self.aborted = false;
        Ok(())
    }

    /// Waits for all running tasks and releases all resources.
    pub fn close(&mut self) -> Result<()> {
        self.drain()?;
        self.scan_done = true;
        Ok(())
    }

    /// Makes progress. Returns `true` at the end of the scan.
    fn step(&mut self) -> Result<bool> {
        self.dispatch()?;

        while let Ok(completion) = self.receiver.try_recv() {
            self.process(completion)?;
        }
        if !self.completed.is_empty() {
            return Ok(false);
        }

        if self.running.is_empty() {
            if self.pending.is_empty() {
                return Ok(self.scan_done);
            }

            // Result buffers kept for retries may block the others.
            let mut freed = false;
            for task in self.pending.iter_mut() {
                freed |= task.release_retained(&self.devices)?;
            }
            if freed {
                self.stalled.iter_mut().for_each(|s| *s = false);
                return Ok(false);
            }

            warn!(pending = self.pending.len(), "No device can accept a join task");
            Err(ErrorKind::DeviceStarvation(format!(
                "None of the {} devices has memory for the next join task",
                self.devices.len()
            )))?;
        }

        let completion = self.receiver.recv().map_err(|_| {
            ErrorKind::LogicError("Completion channel disconnected".to_string())
        })?;
        self.process(completion)?;
        Ok(false)
    }

    /// Launches pending tasks until the devices are busy.
    fn dispatch(&mut self) -> Result<()> {
        while self.running.len() < self.config.max_async_tasks {
            if self.pending.is_empty() {
                if !self.produce()? {
                    break;
                }
                continue;
            }

            let device = match self.pick_device() {
                Some(device) => device,
                None => break,
            };
            let mut task = match self.pending.pop_front() {
                Some(task) => task,
                None => break,
            };

            let mut ctx = LaunchContext {
                plan: &self.plan,
                devices: &self.devices,
                kernels: &self.kernels,
                sender: &self.sender,
                stats: &mut self.stats,
            };
            match task.launch(device, &mut ctx) {
                Ok(Launch::Started) => {
                    self.running.insert(task.id(), task);
                }
                Ok(Launch::NoBuffer) => {
                    debug!(device, task = task.id(), "Device has no memory for the join task");
                    self.stalled[device] = true;
                    self.pending.push_front(task);
                }
                Err(e) => {
                    self.discard(task);
                    return Err(e);
                }
            }
        }
        Ok(())
    }

    /// Round-robin over the devices that are not out of memory.
    fn pick_device(&mut self) -> Option<DeviceId> {
        let ndevs = self.stalled.len();
        let device = (0..ndevs)
            .map(|i| (self.next_device + i) % ndevs)
            .find(|&device| !self.stalled[device])?;
        self.next_device = (device + 1) % ndevs;
        Some(device)
    }

    fn process(&mut self, completion: Completion) -> Result<()> {
        let mut task = self.running.remove(&completion.task).ok_or_else(|| {
            ErrorKind::LogicError(format!("Completion of unknown task {}", completion.task))
        })?;
        self.stalled.iter_mut().for_each(|s| *s = false);

        match task.complete(completion.result, &self.devices, &mut self.stats) {
            Ok(Outcome::Overflow) => {
                self.stats.retries += 1;
                info!(
                    task = task.id(),
                    attempt = task.attempts(),
                    "Retrying join task with larger buffers"
                );
                self.enqueue(task, true)
            }
            Ok(Outcome::Success { chunk, control }) => {
                if !task.is_sweep() {
                    self.runtime.record(&control);
                }
                if let Err(e) = self.enqueue_continuation(&task, &control) {
                    self.discard(task);
                    return Err(e);
                }

                self.stats.result_chunks += 1;
                self.stats.result_rows += chunk.nitems();
                self.completed.push_back(Ok(chunk));

                let set = task.set().clone();
                match task.finish(&self.devices) {
                    Ok(Detach::SweepRequired) => self.issue_sweep(set),
                    Ok(_) => Ok(()),
                    Err(e) => {
                        self.discard(task);
                        Err(e)
                    }
                }
            }
            Err(e) => {
                self.discard(task);
                self.completed.push_front(Err(e));
                Ok(())
            }
        }
    }

    /// Queues a task for the source rows that `task` did not admit.
    fn enqueue_continuation(&mut self, task: &JoinTask, control: &ControlBlock) -> Result<()> {
        let id = self.next_id();
        if let Some(next) = task.continuation(id, control)? {
            self.enqueue(next, true)?;
            self.stats.continuations += 1;
        }
        Ok(())
    }

    /// Queues the next task. Returns `false` at the end of the scan.
    fn produce(&mut self) -> Result<bool> {
        loop {
            if self.scan_done {
                return Ok(false);
            }
            if self.inner_chunks.is_none() {
                self.load_inner()?;
            }

            let set = match &self.current {
                Some(set) => set.clone(),
                None => {
                    let set = self.open_window()?;
                    self.current = Some(set.clone());
                    set
                }
            };

            if !self.outer_exhausted {
                if let Some(outer) = self.read_outer_chunk()? {
                    let id = self.next_id();
                    let task = JoinTask::probe(id, set.attach()?, outer);
                    self.enqueue(task, false)?;
                    return Ok(true);
                }
                self.outer_exhausted = true;
            }

            self.current = None;
            if set.detach(true)? == Detach::SweepRequired {
                self.issue_sweep(set)?;
            }

            let odometer = self
                .odometer
                .as_mut()
                .ok_or_else(|| ErrorKind::LogicError("Inner relations not loaded".to_string()))?;
            if odometer.advance() {
                debug!(window = ?odometer.current(), "Advancing to the next inner window");
                self.outer.rescan()?;
                self.outer_exhausted = false;
                self.carry = None;
            } else {
                self.scan_done = true;
            }

            if !self.pending.is_empty() {
                return Ok(true);
            }
        }
    }

    fn load_inner(&mut self) -> Result<()> {
        let total_limit = match self.config.inner_total_limit {
            Some(limit) => limit,
            None => self.devices.min_capacity()? / 2,
        };
        let chunks =
            InnerRelationLoader::new(&self.plan, &self.config, total_limit).load(&mut self.inners)?;

        let limits = chunks.window_limits();
        for (i, depth_plan) in self.plan.depths.iter().enumerate() {
            if depth_plan.join_type.fills_inner() && limits[..i].iter().any(|&n| n > 1) {
                Err(ErrorKind::LogicError(format!(
                    "Inner relation in front of the outer join at depth {} was split",
                    i + 1
                )))?;
            }
        }

        self.stats.inner_sub_chunks = limits.iter().sum();
        self.stats.inner_load_ns += chunks.load_time().as_nanos() as u64;
        self.odometer = Some(Odometer::new(limits));
        self.inner_chunks = Some(chunks);
        Ok(())
    }

    fn open_window(&mut self) -> Result<Arc<InnerRelationSet>> {
        let (chunks, odometer) = match (&self.inner_chunks, &self.odometer) {
            (Some(chunks), Some(odometer)) => (chunks, odometer),
            _ => {
                return Err(
                    ErrorKind::LogicError("Inner relations not loaded".to_string()).into(),
                )
            }
        };
        let window = odometer.current().to_vec();
        let set = InnerRelationSet::new(
            &self.plan,
            window.clone(),
            chunks.window(&window)?,
            self.devices.clone(),
        )?;

        self.stats.windows += 1;
        debug!(?window, bytes = set.kmrels().len(), "Opened inner window");
        Ok(set)
    }

    /// Reads up to `chunk_size` bytes of outer rows. The row that does not
    /// fit is carried over into the next chunk.
    fn read_outer_chunk(&mut self) -> Result<Option<DataChunk>> {
        let mut builder = RowStoreBuilder::new(self.plan.outer_ncols);
        loop {
            let row = match self.carry.take() {
                Some(row) => row,
                None => match self.outer.next_row()? {
                    Some(row) => row,
                    None => break,
                },
            };
            if !builder.is_empty() && builder.usage_with(1) > self.config.chunk_size {
                self.carry = Some(row);
                break;
            }
            builder.push(&row)?;
        }

        if builder.is_empty() {
            Ok(None)
        } else {
            builder.seal().map(Some)
        }
    }

    fn issue_sweep(&mut self, set: Arc<InnerRelationSet>) -> Result<()> {
        let id = self.next_id();
        let task = match JoinTask::sweep(id, set.clone(), &self.plan) {
            Ok(task) => task,
            Err(e) => {
                set.detach(false)?;
                return Err(e);
            }
        };

        info!(window = ?set.window(), "Issuing outer join sweep");
        self.stats.sweep_tasks += 1;
        self.enqueue(task, false)
    }

    /// Sizes a task and queues it. Retries and continuations go to the
    /// front.
    fn enqueue(&mut self, mut task: JoinTask, front: bool) -> Result<()> {
        let estimator = SizeEstimator::new(&self.plan, &self.config);
        if let Err(e) = task.resize(&self.plan, &estimator, &self.runtime) {
            self.discard(task);
            return Err(e);
        }

        if front {
            self.pending.push_front(task);
        } else {
            self.pending.push_back(task);
        }
        Ok(())
    }

    fn discard(&self, task: JoinTask) {
        let id = task.id();
        if let Err(e) = task.discard(&self.devices) {
            warn!(task = id, "Failed to release join task: {}", e);
        }
    }

    fn next_id(&mut self) -> u64 {
        self.next_task_id += 1;
        self.next_task_id
    }

    fn abort(&mut self) {
        self.aborted = true;
        if let Err(e) = self.drain() {
            warn!("Failed to release the join after an error: {}", e);
        }
    }

    /// Waits for the running tasks, then drops all tasks and results and
    /// releases the current window without sweeping it.
    fn drain(&mut self) -> Result<()> {
        while !self.running.is_empty() {
            let completion = self.receiver.recv().map_err(|_| {
                ErrorKind::LogicError("Completion channel disconnected".to_string())
            })?;
            if let Some(mut task) = self.running.remove(&completion.task) {
                if let Err(e) = task.complete(completion.result, &self.devices, &mut self.stats) {
                    debug!(task = task.id(), "Dropping failed join task: {}", e);
                }
                task.discard(&self.devices)?;
            }
        }

        for task in self.pending.drain(..) {
            task.discard(&self.devices)?;
        }
        self.completed.clear();
        if let Some(set) = self.current.take() {
            set.detach(false)?;
        }
        Ok(())
    }
}
