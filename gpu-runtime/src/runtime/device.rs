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

use super::{KernelArg, LaunchDim};
use crate::error::{poisoned, Result};
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard};

/// Ordinal of a device within its `DeviceSet`.
pub type DeviceId = usize;

/// A pointer into the memory of one device.
///
/// The address is backend-specific. The pointer remembers its device and the
/// allocation length, so that peer copies and bounds checks do not need a
/// separate lookup.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct DevicePtr {
    device: DeviceId,
    addr: u64,
    len: usize,
}

impl DevicePtr {
    pub fn new(device: DeviceId, addr: u64, len: usize) -> Self {
        Self { device, addr, len }
    }

    pub fn device(&self) -> DeviceId {
        self.device
    }

    pub fn addr(&self) -> u64 {
        self.addr
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct StreamHandle(pub u64);

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct EventHandle(pub u64);

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct KernelHandle(pub u64);

/// Device memory information
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct MemInfo {
    /// Free bytes
    pub free: usize,

    /// Total bytes
    pub total: usize,
}

/// Immutable host memory that is uploaded to a device.
///
/// The reference count keeps the memory alive until the asynchronous copy
/// has finished.
pub type HostBytes = Arc<[u8]>;

/// Host memory that receives an asynchronous device-to-host copy.
#[derive(Clone, Debug, Default)]
pub struct HostBuffer(Arc<Mutex<Vec<u8>>>);

impl HostBuffer {
    /// Allocates a zeroed buffer of `len` bytes.
    pub fn zeroed(len: usize) -> Self {
        Self(Arc::new(Mutex::new(vec![0; len])))
    }

    pub fn len(&self) -> Result<usize> {
        Ok(self.lock()?.len())
    }

    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.lock()?.is_empty())
    }

    pub fn lock(&self) -> Result<MutexGuard<'_, Vec<u8>>> {
        self.0.lock().map_err(poisoned)
    }

    /// Takes the contents, leaving an empty buffer behind.
    pub fn take(&self) -> Result<Vec<u8>> {
        Ok(std::mem::take(&mut *self.lock()?))
    }
}

/// Called on completion of all preceding work in a stream.
///
/// The result carries the first error that occurred in the stream. Callbacks
/// must not call back into the device.
pub type StreamCallback = Box<dyn FnOnce(Result<()>) + Send + 'static>;

/// A device that executes asynchronous work in ordered streams.
///
/// All operations suffixed with `_async` only enqueue work. Errors that
/// occur during execution are sticky for the stream and are reported to the
/// next stream callback.
pub trait Device: fmt::Debug + Send + Sync {
    fn id(&self) -> DeviceId;

    fn name(&self) -> String;

    fn mem_info(&self) -> Result<MemInfo>;

    /// Allocates `bytes` of device memory.
    ///
    /// Returns `None` if the device cannot satisfy the allocation at this
    /// time. The caller should retry after other work has freed memory.
    fn mem_alloc(&self, bytes: usize) -> Result<Option<DevicePtr>>;

    fn mem_free(&self, ptr: DevicePtr) -> Result<()>;

    fn stream_create(&self) -> Result<StreamHandle>;

    fn stream_destroy(&self, stream: StreamHandle) -> Result<()>;

    fn event_create(&self) -> Result<EventHandle>;

    fn event_destroy(&self, event: EventHandle) -> Result<()>;

    /// Records the event when the stream reaches this point.
    fn event_record(&self, event: EventHandle, stream: StreamHandle) -> Result<()>;

    /// Makes all future work in `stream` wait for the event.
    fn stream_wait_event(&self, stream: StreamHandle, event: EventHandle) -> Result<()>;

    fn memcpy_htod_async(
        &self,
        dst: DevicePtr,
        dst_offset: usize,
        src: HostBytes,
        stream: StreamHandle,
    ) -> Result<()>;

    fn memcpy_dtoh_async(
        &self,
        dst: &HostBuffer,
        src: DevicePtr,
        src_offset: usize,
        len: usize,
        stream: StreamHandle,
    ) -> Result<()>;

    /// Copies from memory of any device in the same `DeviceSet` into memory
    /// of this device.
    fn memcpy_peer_async(
        &self,
        dst: DevicePtr,
        dst_offset: usize,
        src: DevicePtr,
        src_offset: usize,
        len: usize,
        stream: StreamHandle,
    ) -> Result<()>;

    /// Sets every byte of the allocation to `value`.
    fn memset_async(&self, dst: DevicePtr, value: u8, stream: StreamHandle) -> Result<()>;

    /// Looks up a kernel by name.
    fn function(&self, name: &str) -> Result<KernelHandle>;

    fn launch_async(
        &self,
        function: KernelHandle,
        dim: &LaunchDim,
        args: &[KernelArg],
        stream: StreamHandle,
    ) -> Result<()>;

    fn stream_add_callback(&self, stream: StreamHandle, callback: StreamCallback) -> Result<()>;
}

/// Checks that `offset..offset + len` lies within an allocation.
pub(crate) fn check_range(ptr: &DevicePtr, offset: usize, len: usize) -> Result<()> {
    match offset.checked_add(len) {
        Some(end) if end <= ptr.len() => Ok(()),
        _ => Err(crate::error::ErrorKind::OutOfBounds(format!(
            "Range {}+{} exceeds allocation of {} bytes on device {}",
            offset,
            len,
            ptr.len(),
            ptr.device()
        ))
        .into()),
    }
}
