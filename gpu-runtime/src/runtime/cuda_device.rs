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

//! CUDA backend on top of RustaCUDA.
//!
//! Driver calls that RustaCUDA does not wrap (peer copies, memset, stream
//! callbacks, and waiting on a borrowed event) go through `cuda-driver-sys`.

use super::device::check_range;
use super::{
    Device, DeviceId, DevicePtr, EventHandle, HostBuffer, HostBytes, KernelArg, KernelHandle,
    LaunchDim, MemInfo, StreamCallback, StreamHandle,
};
use crate::error::{poisoned, Error, ErrorKind, Result, ResultExt, ToResult};
use cuda_driver_sys::{
    cuMemGetInfo_v2, cuMemcpyAsync, cuMemsetD8Async, cuStreamAddCallback, cuStreamWaitEvent,
    CUevent, CUresult, CUstream,
};
use rustacuda::context::{Context, ContextFlags, CurrentContext};
use rustacuda::device::Device as CuDevice;
use rustacuda::error::CudaError;
use rustacuda::event::{Event, EventFlags};
use rustacuda::function::{BlockSize, GridSize};
use rustacuda::memory::{AsyncCopyDestination, DeviceBuffer};
use rustacuda::module::Module;
use rustacuda::stream::{Stream, StreamFlags};
use rustacuda::CudaFlags;
use std::collections::HashMap;
use std::ffi::CString;
use std::fmt;
use std::mem::transmute_copy;
use std::os::raw::c_void;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

/// A CUDA device with its own context and one loaded module.
///
/// Streams, events, and allocations are owned by the device and referenced
/// by handle. Dropping the device releases all of them before the context.
pub struct CudaDevice {
    id: DeviceId,
    device: CuDevice,
    module: Module,
    kernels: Mutex<Vec<CString>>,
    streams: Mutex<HashMap<u64, Stream>>,
    events: Mutex<HashMap<u64, Event>>,
    buffers: Mutex<HashMap<u64, DeviceBuffer<u8>>>,
    next_handle: AtomicU64,
    context: Context,
}

// All calls make the device's context current first, so the handles may be
// used from any thread.
unsafe impl Send for CudaDevice {}
unsafe impl Sync for CudaDevice {}

unsafe extern "C" fn stream_callback_trampoline(
    _stream: CUstream,
    status: CUresult,
    user_data: *mut c_void,
) {
    let callback = Box::from_raw(user_data as *mut StreamCallback);
    callback(status.to_result());
}

fn raw_stream(stream: &Stream) -> CUstream {
    // `Stream` is a thin wrapper around the driver handle.
    unsafe { transmute_copy::<Stream, CUstream>(stream) }
}

fn raw_event(event: &Event) -> CUevent {
    unsafe { transmute_copy::<Event, CUevent>(event) }
}

impl CudaDevice {
    /// Opens the device with CUDA ordinal `ordinal` as member `id` of a
    /// device set, and loads the PTX module `image`.
    pub fn new(id: DeviceId, ordinal: u32, image: &[u8]) -> Result<Self> {
        rustacuda::init(CudaFlags::empty())?;
        let device = CuDevice::get_device(ordinal)?;
        let context =
            Context::create_and_push(ContextFlags::MAP_HOST | ContextFlags::SCHED_AUTO, device)?;

        let image = image.strip_suffix(&[0]).unwrap_or(image);
        let ptx = CString::new(image).map_err(|_| {
            ErrorKind::InvalidArgument("Kernel image must be PTX text".to_string())
        })?;
        let module = Module::load_from_string(&ptx)
            .chain_err(|| format!("Failed to load module on device {}", ordinal))?;

        Ok(Self {
            id,
            device,
            module,
            kernels: Mutex::new(Vec::new()),
            streams: Mutex::new(HashMap::new()),
            events: Mutex::new(HashMap::new()),
            buffers: Mutex::new(HashMap::new()),
            next_handle: AtomicU64::new(1),
            context,
        })
    }

    fn make_current(&self) -> Result<()> {
        CurrentContext::set_current(&self.context)?;
        Ok(())
    }

    fn next_handle(&self) -> u64 {
        self.next_handle.fetch_add(1, Ordering::Relaxed)
    }

    fn unknown(what: &str, handle: u64) -> Error {
        ErrorKind::InvalidArgument(format!("Unknown {} handle {}", what, handle)).into()
    }

    /// Runs `f` with the stream behind `handle`.
    fn with_stream<T>(
        &self,
        handle: StreamHandle,
        f: impl FnOnce(&Stream) -> Result<T>,
    ) -> Result<T> {
        self.make_current()?;
        let streams = self.streams.lock().map_err(poisoned)?;
        let stream = streams
            .get(&handle.0)
            .ok_or_else(|| Self::unknown("stream", handle.0))?;
        f(stream)
    }

    /// Keeps `value` alive until the stream reaches this point.
    fn keep_alive<T: Send + 'static>(&self, value: T, stream: StreamHandle) -> Result<()> {
        self.stream_add_callback(stream, Box::new(move |_| drop(value)))
    }
}

impl Drop for CudaDevice {
    fn drop(&mut self) {
        // Resources are released by their own destructors, which need the
        // context to be current.
        let _ = CurrentContext::set_current(&self.context);
    }
}

impl fmt::Debug for CudaDevice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CudaDevice")
            .field("id", &self.id)
            .field("name", &self.name())
            .finish()
    }
}

impl Device for CudaDevice {
    fn id(&self) -> DeviceId {
        self.id
    }

    fn name(&self) -> String {
        self.device
            .name()
            .unwrap_or_else(|_| format!("cuda-{}", self.id))
    }

    fn mem_info(&self) -> Result<MemInfo> {
        self.make_current()?;
        let mut free: usize = 0;
        let mut total: usize = 0;

        unsafe { cuMemGetInfo_v2(&mut free, &mut total) }
            .to_result()
            .chain_err(|| "Failed to get memory information")?;

        Ok(MemInfo { free, total })
    }

    fn mem_alloc(&self, bytes: usize) -> Result<Option<DevicePtr>> {
        self.make_current()?;

        let mut buffer = match unsafe { DeviceBuffer::<u8>::uninitialized(bytes.max(1)) } {
            Ok(buffer) => buffer,
            Err(CudaError::OutOfMemory) => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        let addr = buffer.as_device_ptr().as_raw() as usize as u64;
        self.buffers.lock().map_err(poisoned)?.insert(addr, buffer);

        Ok(Some(DevicePtr::new(self.id, addr, bytes)))
    }

    fn mem_free(&self, ptr: DevicePtr) -> Result<()> {
        self.make_current()?;
        let buffer = self
            .buffers
            .lock()
            .map_err(poisoned)?
            .remove(&ptr.addr())
            .ok_or_else(|| Self::unknown("allocation", ptr.addr()))?;

        DeviceBuffer::drop(buffer).map_err(|(e, _)| e)?;
        Ok(())
    }

    fn stream_create(&self) -> Result<StreamHandle> {
        self.make_current()?;
        let stream = Stream::new(StreamFlags::NON_BLOCKING, None)?;
        let handle = self.next_handle();
        self.streams.lock().map_err(poisoned)?.insert(handle, stream);

        Ok(StreamHandle(handle))
    }

    fn stream_destroy(&self, stream: StreamHandle) -> Result<()> {
        self.make_current()?;
        let stream = self
            .streams
            .lock()
            .map_err(poisoned)?
            .remove(&stream.0)
            .ok_or_else(|| Self::unknown("stream", stream.0))?;

        Stream::drop(stream).map_err(|(e, _)| e)?;
        Ok(())
    }

    fn event_create(&self) -> Result<EventHandle> {
        self.make_current()?;
        let event = Event::new(EventFlags::DISABLE_TIMING)?;
        let handle = self.next_handle();
        self.events.lock().map_err(poisoned)?.insert(handle, event);

        Ok(EventHandle(handle))
    }

    fn event_destroy(&self, event: EventHandle) -> Result<()> {
        self.make_current()?;
        let event = self
            .events
            .lock()
            .map_err(poisoned)?
            .remove(&event.0)
            .ok_or_else(|| Self::unknown("event", event.0))?;

        Event::drop(event).map_err(|(e, _)| e)?;
        Ok(())
    }

    fn event_record(&self, event: EventHandle, stream: StreamHandle) -> Result<()> {
        self.with_stream(stream, |stream| {
            let events = self.events.lock().map_err(poisoned)?;
            let event = events
                .get(&event.0)
                .ok_or_else(|| Self::unknown("event", event.0))?;
            event.record(stream)?;
            Ok(())
        })
    }

    fn stream_wait_event(&self, stream: StreamHandle, event: EventHandle) -> Result<()> {
        // `Stream::wait_event` consumes the event, but the handle stays valid
        // for further records.
        self.with_stream(stream, |stream| {
            let events = self.events.lock().map_err(poisoned)?;
            let event = events
                .get(&event.0)
                .ok_or_else(|| Self::unknown("event", event.0))?;
            unsafe { cuStreamWaitEvent(raw_stream(stream), raw_event(event), 0) }.to_result()
        })
    }

    fn memcpy_htod_async(
        &self,
        dst: DevicePtr,
        dst_offset: usize,
        src: HostBytes,
        stream: StreamHandle,
    ) -> Result<()> {
        check_range(&dst, dst_offset, src.len())?;
        self.with_stream(stream, |stream| {
            let mut buffers = self.buffers.lock().map_err(poisoned)?;
            let buffer = buffers
                .get_mut(&dst.addr())
                .ok_or_else(|| Self::unknown("allocation", dst.addr()))?;
            let slice = &mut buffer[dst_offset..dst_offset + src.len()];
            unsafe { slice.async_copy_from(&src[..], stream) }?;
            Ok(())
        })?;
        self.keep_alive(src, stream)
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
        self.with_stream(stream, |stream| {
            let mut host = dst.lock()?;
            if host.len() < len {
                Err(ErrorKind::OutOfBounds(format!(
                    "Host buffer of {} bytes is too small for {} bytes",
                    host.len(),
                    len
                )))?;
            }
            let buffers = self.buffers.lock().map_err(poisoned)?;
            let buffer = buffers
                .get(&src.addr())
                .ok_or_else(|| Self::unknown("allocation", src.addr()))?;
            let slice = &buffer[src_offset..src_offset + len];
            unsafe { slice.async_copy_to(&mut host[..len], stream) }?;
            Ok(())
        })?;
        self.keep_alive(dst.clone(), stream)
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

        // The source belongs to another device. Unified addressing resolves
        // it from the pointer.
        self.with_stream(stream, |stream| {
            unsafe {
                cuMemcpyAsync(
                    dst.addr() + dst_offset as u64,
                    src.addr() + src_offset as u64,
                    len,
                    raw_stream(stream),
                )
            }
            .to_result()
        })
    }

    fn memset_async(&self, dst: DevicePtr, value: u8, stream: StreamHandle) -> Result<()> {
        self.with_stream(stream, |stream| {
            unsafe { cuMemsetD8Async(dst.addr(), value, dst.len(), raw_stream(stream)) }
                .to_result()
        })
    }

    fn function(&self, name: &str) -> Result<KernelHandle> {
        let mut kernels = self.kernels.lock().map_err(poisoned)?;
        if let Some(index) = kernels.iter().position(|k| k.as_bytes() == name.as_bytes()) {
            return Ok(KernelHandle(index as u64));
        }

        let c_name = CString::new(name)
            .map_err(|_| ErrorKind::InvalidArgument(format!("Invalid kernel name {}", name)))?;
        self.make_current()?;
        self.module
            .get_function(&c_name)
            .chain_err(|| format!("Kernel {} not found", name))?;

        kernels.push(c_name);
        Ok(KernelHandle(kernels.len() as u64 - 1))
    }

    fn launch_async(
        &self,
        function: KernelHandle,
        dim: &LaunchDim,
        args: &[KernelArg],
        stream: StreamHandle,
    ) -> Result<()> {
        let name = self
            .kernels
            .lock()
            .map_err(poisoned)?
            .get(function.0 as usize)
            .cloned()
            .ok_or_else(|| Self::unknown("kernel", function.0))?;

        // Parameters are passed by address; a u64 slot holds any scalar on
        // little-endian hosts.
        let mut values: Vec<u64> = args
            .iter()
            .map(|arg| match *arg {
                KernelArg::Ptr(ptr) => ptr.addr(),
                KernelArg::Null => 0,
                KernelArg::U32(v) => v as u64,
                KernelArg::I32(v) => v as u32 as u64,
                KernelArg::U64(v) => v,
            })
            .collect();
        let params: Vec<*mut c_void> = values
            .iter_mut()
            .map(|v| v as *mut u64 as *mut c_void)
            .collect();

        self.with_stream(stream, |stream| {
            let kernel = self.module.get_function(&name)?;
            let (gx, gy, gz) = dim.grid;
            let (bx, by, bz) = dim.block;

            unsafe {
                stream.launch(
                    &kernel,
                    GridSize::xyz(gx, gy, gz),
                    BlockSize::xyz(bx, by, bz),
                    dim.shared_mem_bytes,
                    &params,
                )
            }
            .map_err(|e| {
                Error::from(ErrorKind::KernelError(
                    name.to_string_lossy().into_owned(),
                    e.to_string(),
                ))
            })
        })
    }

    fn stream_add_callback(&self, stream: StreamHandle, callback: StreamCallback) -> Result<()> {
        let data = Box::into_raw(Box::new(callback)) as *mut c_void;

        let result = self.with_stream(stream, |stream| {
            unsafe {
                cuStreamAddCallback(
                    raw_stream(stream),
                    Some(stream_callback_trampoline),
                    data,
                    0,
                )
            }
            .to_result()
        });

        if result.is_err() {
            // The driver did not take ownership.
            drop(unsafe { Box::from_raw(data as *mut StreamCallback) });
        }
        result
    }
}
