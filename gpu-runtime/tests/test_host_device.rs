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

use gpu_runtime::error::{ErrorKind, Result as RuntimeResult};
use gpu_runtime::runtime::{
    Device, HostBuffer, HostDeviceSetBuilder, HostKernelArg, HostModule, KernelArg, LaunchDim,
    StreamHandle,
};
use std::error::Error;
use std::sync::mpsc;
use std::sync::Arc;

fn add_one(_dim: &LaunchDim, args: &[HostKernelArg]) -> RuntimeResult<()> {
    let mut data = args[0].buffer()?.write().unwrap();
    data.iter_mut().for_each(|b| *b += 1);
    Ok(())
}

fn always_fails(_dim: &LaunchDim, _args: &[HostKernelArg]) -> RuntimeResult<()> {
    Err(ErrorKind::RuntimeError("illegal address".to_string()).into())
}

fn module() -> HostModule {
    HostModule::new()
        .register("add_one", add_one)
        .register("always_fails", always_fails)
}

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
fn allocation_beyond_capacity_returns_none() -> Result<(), Box<dyn Error>> {
    let devices = HostDeviceSetBuilder::default().capacity(1000).build()?;
    let dev = &devices[0];

    let first = dev.mem_alloc(600)?.expect("fits into capacity");
    assert!(dev.mem_alloc(600)?.is_none());

    dev.mem_free(first)?;
    let second = dev.mem_alloc(600)?;
    assert!(second.is_some());

    let stats = dev.stats()?;
    assert_eq!(stats.allocations, 2);
    assert_eq!(stats.frees, 1);
    assert_eq!(stats.bytes_in_use, 600);
    Ok(())
}

#[test]
fn stream_executes_in_order() -> Result<(), Box<dyn Error>> {
    let devices = HostDeviceSetBuilder::default().module(module()).build()?;
    let dev = &devices[0];
    let stream = dev.stream_create()?;
    let mem = dev.mem_alloc(4)?.expect("allocation");
    let host = HostBuffer::zeroed(4);

    let input: Arc<[u8]> = vec![1, 2, 3, 4].into();
    dev.memcpy_htod_async(mem, 0, input, stream)?;
    let add = dev.function("add_one")?;
    dev.launch_async(add, &LaunchDim::linear(4, 32)?, &[KernelArg::Ptr(mem)], stream)?;
    dev.launch_async(add, &LaunchDim::linear(4, 32)?, &[KernelArg::Ptr(mem)], stream)?;
    dev.memcpy_dtoh_async(&host, mem, 0, 4, stream)?;
    wait_for_stream(dev.as_ref(), stream)?;

    assert_eq!(host.take()?, vec![3, 4, 5, 6]);
    dev.stream_destroy(stream)?;
    dev.mem_free(mem)?;
    Ok(())
}

#[test]
fn event_orders_work_across_streams() -> Result<(), Box<dyn Error>> {
    let devices = HostDeviceSetBuilder::default().build()?;
    let dev = &devices[0];
    let upload = dev.stream_create()?;
    let consumer = dev.stream_create()?;
    let event = dev.event_create()?;
    let mem = dev.mem_alloc(1024)?.expect("allocation");
    let host = HostBuffer::zeroed(1024);

    let input: Arc<[u8]> = vec![7; 1024].into();
    dev.memcpy_htod_async(mem, 0, input, upload)?;
    dev.event_record(event, upload)?;
    dev.stream_wait_event(consumer, event)?;
    dev.memcpy_dtoh_async(&host, mem, 0, 1024, consumer)?;
    wait_for_stream(dev.as_ref(), consumer)?;

    assert!(host.take()?.iter().all(|&b| b == 7));
    dev.event_destroy(event)?;
    Ok(())
}

#[test]
fn kernel_error_is_sticky_and_reported() -> Result<(), Box<dyn Error>> {
    let devices = HostDeviceSetBuilder::default().module(module()).build()?;
    let dev = &devices[0];
    let stream = dev.stream_create()?;
    let mem = dev.mem_alloc(1)?.expect("allocation");
    let host = HostBuffer::zeroed(1);

    let fail = dev.function("always_fails")?;
    let add = dev.function("add_one")?;
    dev.launch_async(fail, &LaunchDim::linear(1, 32)?, &[], stream)?;
    dev.launch_async(add, &LaunchDim::linear(1, 32)?, &[KernelArg::Ptr(mem)], stream)?;
    dev.memcpy_dtoh_async(&host, mem, 0, 1, stream)?;

    match wait_for_stream(dev.as_ref(), stream) {
        Err(e) => match e.kind() {
            ErrorKind::KernelError(name, _) => assert_eq!(name, "always_fails"),
            other => panic!("Unexpected error {:?}", other),
        },
        Ok(()) => panic!("Kernel error was not reported"),
    }

    // The increment was skipped.
    assert_eq!(host.take()?, vec![0]);
    Ok(())
}

#[test]
fn unknown_kernel_is_an_error() -> Result<(), Box<dyn Error>> {
    let devices = HostDeviceSetBuilder::default().module(module()).build()?;
    assert!(devices[0].function("does_not_exist").is_err());
    Ok(())
}

#[test]
fn peer_copy_reads_other_device() -> Result<(), Box<dyn Error>> {
    let devices = HostDeviceSetBuilder::default().devices(2).build()?;
    let (dev0, dev1) = (&devices[0], &devices[1]);

    let src_stream = dev0.stream_create()?;
    let src = dev0.mem_alloc(8)?.expect("allocation");
    let input: Arc<[u8]> = vec![1, 2, 3, 4, 5, 6, 7, 8].into();
    dev0.memcpy_htod_async(src, 0, input, src_stream)?;
    wait_for_stream(dev0.as_ref(), src_stream)?;

    let stream = dev1.stream_create()?;
    let dst = dev1.mem_alloc(8)?.expect("allocation");
    let host = HostBuffer::zeroed(8);
    dev1.memset_async(dst, 0xff, stream)?;
    dev1.memcpy_peer_async(dst, 4, src, 0, 4, stream)?;
    dev1.memcpy_dtoh_async(&host, dst, 0, 8, stream)?;
    wait_for_stream(dev1.as_ref(), stream)?;

    assert_eq!(host.take()?, vec![0xff, 0xff, 0xff, 0xff, 1, 2, 3, 4]);
    assert_eq!(dev1.stats()?.peer_bytes, 4);
    Ok(())
}

#[test]
fn out_of_bounds_copy_is_rejected() -> Result<(), Box<dyn Error>> {
    let devices = HostDeviceSetBuilder::default().build()?;
    let dev = &devices[0];
    let stream = dev.stream_create()?;
    let mem = dev.mem_alloc(4)?.expect("allocation");

    let input: Arc<[u8]> = vec![0; 8].into();
    assert!(dev.memcpy_htod_async(mem, 0, input, stream).is_err());
    Ok(())
}
