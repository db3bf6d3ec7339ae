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

#![cfg(feature = "cuda")]

use gpu_runtime::error::Result as RuntimeResult;
use gpu_runtime::runtime::{CudaDevice, Device, HostBuffer, KernelArg, LaunchDim, StreamHandle};
use std::error::Error;
use std::sync::mpsc;
use std::sync::Arc;

const NOOP_PTX: &str = "
.version 6.0
.target sm_30
.address_size 64

.visible .entry noop(
    .param .u64 noop_param_0
)
{
    ret;
}
";

fn wait_for_stream(device: &dyn Device, stream: StreamHandle) -> RuntimeResult<()> {
    let (tx, rx) = mpsc::channel();
    device.stream_add_callback(
        stream,
        Box::new(move |status| {
            tx.send(status).unwrap();
        }),
    )?;
    rx.recv().unwrap()
}

#[test]
fn copies_and_memset_round_trip_through_device() -> Result<(), Box<dyn Error>> {
    let dev = CudaDevice::new(0, 0, NOOP_PTX.as_bytes())?;
    let stream = dev.stream_create()?;
    let mem = dev.mem_alloc(8)?.expect("allocation");
    let host = HostBuffer::zeroed(8);

    dev.memset_async(mem, 7, stream)?;
    let input: Arc<[u8]> = vec![1, 2, 3, 4].into();
    dev.memcpy_htod_async(mem, 2, input, stream)?;
    dev.memcpy_dtoh_async(&host, mem, 0, 8, stream)?;
    wait_for_stream(&dev, stream)?;

    assert_eq!(host.take()?, vec![7, 7, 1, 2, 3, 4, 7, 7]);
    dev.stream_destroy(stream)?;
    dev.mem_free(mem)?;
    Ok(())
}

#[test]
fn event_orders_work_across_streams() -> Result<(), Box<dyn Error>> {
    let dev = CudaDevice::new(0, 0, NOOP_PTX.as_bytes())?;
    let producer = dev.stream_create()?;
    let consumer = dev.stream_create()?;
    let event = dev.event_create()?;
    let src = dev.mem_alloc(4)?.expect("allocation");
    let dst = dev.mem_alloc(4)?.expect("allocation");
    let host = HostBuffer::zeroed(4);

    let input: Arc<[u8]> = vec![9, 8, 7, 6].into();
    dev.memcpy_htod_async(src, 0, input, producer)?;
    dev.event_record(event, producer)?;
    dev.stream_wait_event(consumer, event)?;
    dev.memcpy_peer_async(dst, 0, src, 0, 4, consumer)?;
    dev.memcpy_dtoh_async(&host, dst, 0, 4, consumer)?;
    wait_for_stream(&dev, consumer)?;

    assert_eq!(host.take()?, vec![9, 8, 7, 6]);

    // The event stays usable after a wait.
    dev.event_record(event, consumer)?;
    dev.event_destroy(event)?;
    dev.stream_destroy(producer)?;
    dev.stream_destroy(consumer)?;
    dev.mem_free(src)?;
    dev.mem_free(dst)?;
    Ok(())
}

#[test]
fn kernels_are_looked_up_by_name() -> Result<(), Box<dyn Error>> {
    let dev = CudaDevice::new(0, 0, NOOP_PTX.as_bytes())?;
    let stream = dev.stream_create()?;
    let mem = dev.mem_alloc(4)?.expect("allocation");

    let noop = dev.function("noop")?;
    assert_eq!(dev.function("noop")?, noop);
    assert!(dev.function("missing").is_err());

    dev.launch_async(noop, &LaunchDim::linear(4, 32)?, &[KernelArg::Ptr(mem)], stream)?;
    wait_for_stream(&dev, stream)?;

    dev.stream_destroy(stream)?;
    dev.mem_free(mem)?;
    Ok(())
}

#[test]
fn allocation_beyond_capacity_returns_none() -> Result<(), Box<dyn Error>> {
    let dev = CudaDevice::new(0, 0, NOOP_PTX.as_bytes())?;
    let info = dev.mem_info()?;

    assert!(dev.mem_alloc(info.total * 2)?.is_none());
    Ok(())
}
