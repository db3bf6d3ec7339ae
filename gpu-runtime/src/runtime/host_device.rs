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

//! A simulated device that executes streams on host threads.
//!
//! Device memory is ordinary host memory, accounted against a per-device
//! byte budget. Each stream is a single-threaded `rayon` pool, so work in a
//! stream executes in FIFO order and streams run concurrently. Kernels are
//! Rust closures registered by name in a `HostModule`.

use super::device::check_range;
use super::{
    Device, DeviceId, DevicePtr, DeviceSet, EventHandle, HostBuffer, HostBytes, KernelArg,
    KernelHandle, LaunchDim, MemInfo, StreamCallback, StreamHandle,
};
use crate::error::{poisoned, Error, ErrorKind, Result};
use rayon::{ThreadPool, ThreadPoolBuilder};
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex, RwLock};
use tracing::{debug, warn};

/// Memory of a simulated device allocation.
pub type HostDeviceMemory = Arc<RwLock<Vec<u8>>>;

/// A resolved kernel parameter, as seen by a host kernel.
#[derive(Clone, Debug)]
pub enum HostKernelArg {
    Buffer(HostDeviceMemory),
    Null,
    U32(u32),
    I32(i32),
    U64(u64),
}

impl HostKernelArg {
    pub fn buffer(&self) -> Result<&HostDeviceMemory> {
        match self {
            HostKernelArg::Buffer(mem) => Ok(mem),
            other => Err(ErrorKind::InvalidArgument(format!(
                "Expected a device pointer, got {:?}",
                other
            ))
            .into()),
        }
    }

    pub fn opt_buffer(&self) -> Result<Option<&HostDeviceMemory>> {
        match self {
            HostKernelArg::Null => Ok(None),
            _ => self.buffer().map(Some),
        }
    }

    pub fn u32(&self) -> Result<u32> {
        match *self {
            HostKernelArg::U32(value) => Ok(value),
            ref other => Err(ErrorKind::InvalidArgument(format!(
                "Expected a u32 parameter, got {:?}",
                other
            ))
            .into()),
        }
    }
}

/// Signature of a host kernel.
pub type HostKernelFn = Arc<dyn Fn(&LaunchDim, &[HostKernelArg]) -> Result<()> + Send + Sync>;

/// A named collection of host kernels, the host analogue of a compiled
/// device module.
#[derive(Clone, Default)]
pub struct HostModule {
    functions: Vec<(String, HostKernelFn)>,
}

impl HostModule {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a kernel, replacing any kernel with the same name.
    pub fn register<F>(mut self, name: &str, function: F) -> Self
    where
        F: Fn(&LaunchDim, &[HostKernelArg]) -> Result<()> + Send + Sync + 'static,
    {
        let function: HostKernelFn = Arc::new(function);
        match self.functions.iter_mut().find(|(n, _)| n == name) {
            Some(entry) => entry.1 = function,
            None => self.functions.push((name.to_string(), function)),
        }
        self
    }

    fn lookup(&self, name: &str) -> Option<usize> {
        self.functions.iter().position(|(n, _)| n == name)
    }
}

impl fmt::Debug for HostModule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list()
            .entries(self.functions.iter().map(|(name, _)| name))
            .finish()
    }
}

/// Allocations of all simulated devices in a device set.
///
/// Sharing the pool lets peer copies read another device's memory.
#[derive(Debug, Default)]
struct HostMemoryPool {
    buffers: Mutex<HashMap<(DeviceId, u64), HostDeviceMemory>>,
    next_addr: AtomicU64,
}

impl HostMemoryPool {
    fn insert(&self, device: DeviceId, len: usize) -> Result<DevicePtr> {
        let addr = self.next_addr.fetch_add(1, Ordering::SeqCst) + 1;
        self.buffers
            .lock()
            .map_err(poisoned)?
            .insert((device, addr), Arc::new(RwLock::new(vec![0; len])));
        Ok(DevicePtr::new(device, addr, len))
    }

    fn get(&self, ptr: &DevicePtr) -> Result<HostDeviceMemory> {
        self.buffers
            .lock()
            .map_err(poisoned)?
            .get(&(ptr.device(), ptr.addr()))
            .cloned()
            .ok_or_else(|| {
                ErrorKind::InvalidArgument(format!("Invalid device pointer {:?}", ptr)).into()
            })
    }

    fn remove(&self, ptr: &DevicePtr) -> Result<()> {
        self.buffers
            .lock()
            .map_err(poisoned)?
            .remove(&(ptr.device(), ptr.addr()))
            .map(|_| ())
            .ok_or_else(|| {
                ErrorKind::InvalidArgument(format!("Double free of {:?}", ptr)).into()
            })
    }
}

/// First error that occurred in a stream.
#[derive(Clone, Debug)]
enum StreamFault {
    Device(String),
    Kernel(String, String),
}

impl StreamFault {
    fn from_error(kernel: Option<&str>, error: &Error) -> Self {
        match kernel {
            Some(name) => StreamFault::Kernel(name.to_string(), error.to_string()),
            None => StreamFault::Device(error.to_string()),
        }
    }

    fn to_error(&self) -> Error {
        match self {
            StreamFault::Device(msg) => ErrorKind::DeviceError(msg.clone()).into(),
            StreamFault::Kernel(name, msg) => {
                ErrorKind::KernelError(name.clone(), msg.clone()).into()
            }
        }
    }
}

type FaultSlot = Arc<Mutex<Option<StreamFault>>>;

struct HostStream {
    pool: ThreadPool,
    fault: FaultSlot,
}

impl HostStream {
    /// Enqueues an operation that is skipped once the stream has faulted.
    fn enqueue<F>(&self, kernel: Option<String>, op: F)
    where
        F: FnOnce() -> Result<()> + Send + 'static,
    {
        let fault = self.fault.clone();
        self.pool.spawn_fifo(move || {
            let mut slot = match fault.lock() {
                Ok(slot) => slot,
                Err(_) => return,
            };
            if slot.is_none() {
                if let Err(error) = op() {
                    warn!("Stream operation failed: {}", error);
                    *slot = Some(StreamFault::from_error(kernel.as_deref(), &error));
                }
            }
        });
    }
}

#[derive(Debug)]
struct HostEvent {
    done: Mutex<bool>,
    signal: Condvar,
}

impl HostEvent {
    fn set(&self, done: bool) -> Result<()> {
        *self.done.lock().map_err(poisoned)? = done;
        if done {
            self.signal.notify_all();
        }
        Ok(())
    }

    fn wait(&self) -> Result<()> {
        let mut done = self.done.lock().map_err(poisoned)?;
        while !*done {
            done = self.signal.wait(done).map_err(poisoned)?;
        }
        Ok(())
    }
}

/// Operation counters of a simulated device.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct HostDeviceStats {
    pub allocations: usize,
    pub frees: usize,
    pub bytes_in_use: usize,
    pub htod_bytes: usize,
    pub dtoh_bytes: usize,
    pub peer_bytes: usize,
    pub kernel_launches: usize,
}

#[derive(Debug, Default)]
struct Counters {
    allocations: AtomicUsize,
    frees: AtomicUsize,
    htod_bytes: AtomicUsize,
    dtoh_bytes: AtomicUsize,
    peer_bytes: AtomicUsize,
    kernel_launches: AtomicUsize,
}

/// A simulated device with a fixed memory capacity.
pub struct HostDevice {
    id: DeviceId,
    capacity: usize,
    used: Mutex<usize>,
    pool: Arc<HostMemoryPool>,
    module: HostModule,
    streams: Mutex<HashMap<u64, Arc<HostStream>>>,
    events: Mutex<HashMap<u64, Arc<HostEvent>>>,
    next_handle: AtomicU64,
    counters: Counters,
}

impl HostDevice {
    /// Returns a snapshot of the operation counters.
    pub fn stats(&self) -> Result<HostDeviceStats> {
        let load = |c: &AtomicUsize| c.load(Ordering::SeqCst);

        Ok(HostDeviceStats {
            allocations: load(&self.counters.allocations),
            frees: load(&self.counters.frees),
            bytes_in_use: *self.used.lock().map_err(poisoned)?,
            htod_bytes: load(&self.counters.htod_bytes),
            dtoh_bytes: load(&self.counters.dtoh_bytes),
            peer_bytes: load(&self.counters.peer_bytes),
            kernel_launches: load(&self.counters.kernel_launches),
        })
    }

    fn next_handle(&self) -> u64 {
        self.next_handle.fetch_add(1, Ordering::SeqCst) + 1
    }

    fn stream(&self, stream: StreamHandle) -> Result<Arc<HostStream>> {
        self.streams
            .lock()
            .map_err(poisoned)?
            .get(&stream.0)
            .cloned()
            .ok_or_else(|| {
                ErrorKind::InvalidArgument(format!("Unknown stream {:?}", stream)).into()
            })
    }

    fn event(&self, event: EventHandle) -> Result<Arc<HostEvent>> {
        self.events
            .lock()
            .map_err(poisoned)?
            .get(&event.0)
            .cloned()
            .ok_or_else(|| ErrorKind::InvalidArgument(format!("Unknown event {:?}", event)).into())
    }

    fn own_memory(&self, ptr: &DevicePtr) -> Result<HostDeviceMemory> {
        if ptr.device() != self.id {
            Err(ErrorKind::InvalidArgument(format!(
                "Pointer {:?} does not belong to device {}",
                ptr, self.id
            )))?;
        }
        self.pool.get(ptr)
    }
}

impl fmt::Debug for HostDevice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HostDevice")
            .field("id", &self.id)
            .field("capacity", &self.capacity)
            .field("module", &self.module)
            .finish()
    }
}

impl Device for HostDevice {
    fn id(&self) -> DeviceId {
        self.id
    }

    fn name(&self) -> String {
        format!("host-sim-{}", self.id)
    }

    fn mem_info(&self) -> Result<MemInfo> {
        let used = *self.used.lock().map_err(poisoned)?;
        Ok(MemInfo {
            free: self.capacity - used,
            total: self.capacity,
        })
    }

    fn mem_alloc(&self, bytes: usize) -> Result<Option<DevicePtr>> {
        {
            let mut used = self.used.lock().map_err(poisoned)?;
            if bytes > self.capacity - *used {
                debug!(
                    device = self.id,
                    bytes,
                    free = self.capacity - *used,
                    "Device memory exhausted"
                );
                return Ok(None);
            }
            *used += bytes;
        }

        self.counters.allocations.fetch_add(1, Ordering::SeqCst);
        self.pool.insert(self.id, bytes).map(Some)
    }

    fn mem_free(&self, ptr: DevicePtr) -> Result<()> {
        if ptr.device() != self.id {
            Err(ErrorKind::InvalidArgument(format!(
                "Pointer {:?} does not belong to device {}",
                ptr, self.id
            )))?;
        }
        self.pool.remove(&ptr)?;

        let mut used = self.used.lock().map_err(poisoned)?;
        *used -= ptr.len();
        self.counters.frees.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn stream_create(&self) -> Result<StreamHandle> {
        let handle = self.next_handle();
        let device = self.id;
        let pool = ThreadPoolBuilder::new()
            .num_threads(1)
            .thread_name(move |_| format!("host-sim-{}-stream-{}", device, handle))
            .build()?;
        let stream = Arc::new(HostStream {
            pool,
            fault: Arc::new(Mutex::new(None)),
        });

        self.streams
            .lock()
            .map_err(poisoned)?
            .insert(handle, stream);
        Ok(StreamHandle(handle))
    }

    fn stream_destroy(&self, stream: StreamHandle) -> Result<()> {
        self.streams
            .lock()
            .map_err(poisoned)?
            .remove(&stream.0)
            .map(|_| ())
            .ok_or_else(|| {
                ErrorKind::InvalidArgument(format!("Unknown stream {:?}", stream)).into()
            })
    }

    fn event_create(&self) -> Result<EventHandle> {
        let handle = self.next_handle();
        let event = Arc::new(HostEvent {
            done: Mutex::new(true),
            signal: Condvar::new(),
        });

        self.events.lock().map_err(poisoned)?.insert(handle, event);
        Ok(EventHandle(handle))
    }

    fn event_destroy(&self, event: EventHandle) -> Result<()> {
        self.events
            .lock()
            .map_err(poisoned)?
            .remove(&event.0)
            .map(|_| ())
            .ok_or_else(|| ErrorKind::InvalidArgument(format!("Unknown event {:?}", event)).into())
    }

    fn event_record(&self, event: EventHandle, stream: StreamHandle) -> Result<()> {
        let ev = self.event(event)?;
        let st = self.stream(stream)?;

        // Waiters enqueued after this call must block until the stream
        // reaches the record.
        ev.set(false)?;

        // Records complete even in a faulted stream, otherwise waiters in
        // other streams would block forever.
        st.pool.spawn_fifo(move || {
            if let Err(error) = ev.set(true) {
                warn!("Failed to record event: {}", error);
            }
        });
        Ok(())
    }

    fn stream_wait_event(&self, stream: StreamHandle, event: EventHandle) -> Result<()> {
        let ev = self.event(event)?;
        let st = self.stream(stream)?;

        st.enqueue(None, move || ev.wait());
        Ok(())
    }

    fn memcpy_htod_async(
        &self,
        dst: DevicePtr,
        dst_offset: usize,
        src: HostBytes,
        stream: StreamHandle,
    ) -> Result<()> {
        check_range(&dst, dst_offset, src.len())?;
        let mem = self.own_memory(&dst)?;
        let st = self.stream(stream)?;

        self.counters
            .htod_bytes
            .fetch_add(src.len(), Ordering::SeqCst);
        st.enqueue(None, move || {
            let mut buf = mem.write().map_err(poisoned)?;
            buf[dst_offset..dst_offset + src.len()].copy_from_slice(&src);
            Ok(())
        });
        Ok(())
    }

    fn memcpy_dtoh_async(
        &self,
        dst: &HostBuffer,
        src: DevicePtr,
        src_offset: usize,
        len: usize,
        stream: StreamHandle,
    ) -> Result<()> {
        check_range(&src, src_offset, len)?;
        if dst.len()? < len {
            Err(ErrorKind::OutOfBounds(format!(
                "Host buffer of {} bytes is too small for {} bytes",
                dst.len()?,
                len
            )))?;
        }
        let mem = self.own_memory(&src)?;
        let st = self.stream(stream)?;
        let dst = dst.clone();

        self.counters.dtoh_bytes.fetch_add(len, Ordering::SeqCst);
        st.enqueue(None, move || {
            let buf = mem.read().map_err(poisoned)?;
            let mut host = dst.lock()?;
            host[..len].copy_from_slice(&buf[src_offset..src_offset + len]);
            Ok(())
        });
        Ok(())
    }

    fn memcpy_peer_async(
        &self,
        dst: DevicePtr,
        dst_offset: usize,
        src: DevicePtr,
        src_offset: usize,
        len: usize,
        stream: StreamHandle,
    ) -> Result<()> {
        check_range(&dst, dst_offset, len)?;
        check_range(&src, src_offset, len)?;
        if dst == src {
            Err(ErrorKind::InvalidArgument(
                "Peer copy within one allocation".to_string(),
            ))?;
        }
        let dst_mem = self.own_memory(&dst)?;
        let src_mem = self.pool.get(&src)?;
        let st = self.stream(stream)?;

        self.counters.peer_bytes.fetch_add(len, Ordering::SeqCst);
        st.enqueue(None, move || {
            let from = src_mem.read().map_err(poisoned)?;
            let mut to = dst_mem.write().map_err(poisoned)?;
            to[dst_offset..dst_offset + len].copy_from_slice(&from[src_offset..src_offset + len]);
            Ok(())
        });
        Ok(())
    }

    fn memset_async(&self, dst: DevicePtr, value: u8, stream: StreamHandle) -> Result<()> {
        let mem = self.own_memory(&dst)?;
        let st = self.stream(stream)?;

        st.enqueue(None, move || {
            let mut buf = mem.write().map_err(poisoned)?;
            buf.iter_mut().for_each(|b| *b = value);
            Ok(())
        });
        Ok(())
    }

    fn function(&self, name: &str) -> Result<KernelHandle> {
        self.module
            .lookup(name)
            .map(|index| KernelHandle(index as u64))
            .ok_or_else(|| {
                ErrorKind::InvalidArgument(format!(
                    "Kernel {} not found on device {}",
                    name, self.id
                ))
                .into()
            })
    }

    fn launch_async(
        &self,
        function: KernelHandle,
        dim: &LaunchDim,
        args: &[KernelArg],
        stream: StreamHandle,
    ) -> Result<()> {
        let (name, kernel) = self
            .module
            .functions
            .get(function.0 as usize)
            .cloned()
            .ok_or_else(|| {
                Error::from(ErrorKind::InvalidArgument(format!(
                    "Invalid kernel handle {:?}",
                    function
                )))
            })?;

        let resolved = args
            .iter()
            .map(|arg| match *arg {
                KernelArg::Ptr(ptr) => self.pool.get(&ptr).map(HostKernelArg::Buffer),
                KernelArg::Null => Ok(HostKernelArg::Null),
                KernelArg::U32(v) => Ok(HostKernelArg::U32(v)),
                KernelArg::I32(v) => Ok(HostKernelArg::I32(v)),
                KernelArg::U64(v) => Ok(HostKernelArg::U64(v)),
            })
            .collect::<Result<Vec<_>>>()?;
        let st = self.stream(stream)?;
        let dim = *dim;

        self.counters.kernel_launches.fetch_add(1, Ordering::SeqCst);
        st.enqueue(Some(name), move || kernel(&dim, &resolved));
        Ok(())
    }

    fn stream_add_callback(&self, stream: StreamHandle, callback: StreamCallback) -> Result<()> {
        let st = self.stream(stream)?;
        let fault = st.fault.clone();

        st.pool.spawn_fifo(move || {
            let status = match fault.lock() {
                Ok(slot) => slot.as_ref().map_or(Ok(()), |f| Err(f.to_error())),
                Err(e) => Err(poisoned(e)),
            };
            callback(status);
        });
        Ok(())
    }
}

/// Builds a `DeviceSet` of simulated devices that share one memory pool.
///
/// ```
/// # use gpu_runtime::runtime::HostDeviceSetBuilder;
/// let devices = HostDeviceSetBuilder::default()
///     .devices(2)
///     .capacity(1 << 20)
///     .build()
///     .unwrap();
/// assert_eq!(devices.len(), 2);
/// ```
#[derive(Clone, Debug)]
pub struct HostDeviceSetBuilder {
    devices: usize,
    capacity: usize,
    module: HostModule,
}

impl Default for HostDeviceSetBuilder {
    fn default() -> Self {
        Self {
            devices: 1,
            capacity: 256 << 20,
            module: HostModule::default(),
        }
    }
}

impl HostDeviceSetBuilder {
    pub fn devices(mut self, devices: usize) -> Self {
        self.devices = devices;
        self
    }

    /// Memory capacity of each device in bytes.
    pub fn capacity(mut self, bytes: usize) -> Self {
        self.capacity = bytes;
        self
    }

    pub fn module(mut self, module: HostModule) -> Self {
        self.module = module;
        self
    }

    /// Builds the devices.
    ///
    /// The concrete devices are returned so that callers can inspect their
    /// counters. Use `into_device_set` to combine them.
    pub fn build(self) -> Result<Vec<Arc<HostDevice>>> {
        if self.devices == 0 {
            Err(ErrorKind::InvalidArgument(
                "At least one device is required".to_string(),
            ))?;
        }

        let pool = Arc::new(HostMemoryPool::default());
        let devices = (0..self.devices)
            .map(|id| {
                Arc::new(HostDevice {
                    id,
                    capacity: self.capacity,
                    used: Mutex::new(0),
                    pool: pool.clone(),
                    module: self.module.clone(),
                    streams: Mutex::new(HashMap::new()),
                    events: Mutex::new(HashMap::new()),
                    next_handle: AtomicU64::new(0),
                    counters: Counters::default(),
                })
            })
            .collect();

        Ok(devices)
    }
}

/// Combines simulated devices into a `DeviceSet`.
pub fn into_device_set(devices: &[Arc<HostDevice>]) -> Result<DeviceSet> {
    DeviceSet::new(
        devices
            .iter()
            .map(|dev| dev.clone() as Arc<dyn Device>)
            .collect(),
    )
}
