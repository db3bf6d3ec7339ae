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

mod common;

use common::{host_devices, TestResult};
use gpu_runtime::runtime::{into_device_set, Device, HostDevice, HostDeviceSetBuilder};
use gpujoin::config::JoinConfig;
use gpujoin::host_kernels::host_module;
use gpujoin::inner::{Detach, InnerRelationLoader, InnerRelationSet};
use gpujoin::plan::{ColumnRef, DepthPlan, JoinPlan, JoinType};
use gpujoin::source::{RowSource, VecSource};
use std::sync::Arc;

fn full_join_plan() -> JoinPlan {
    JoinPlan::new(
        1,
        vec![DepthPlan::hash(
            JoinType::Full,
            2,
            vec![ColumnRef::new(0, 0)],
            vec![0],
        )],
        vec![ColumnRef::new(0, 0), ColumnRef::new(1, 1)],
    )
}

fn relation_set(
    plan: &JoinPlan,
    devices: usize,
) -> TestResult<(Arc<InnerRelationSet>, Vec<Arc<HostDevice>>)> {
    let host_devices = host_devices(plan, devices)?;
    let rows = (0..100).map(|i| vec![Some(i), Some(i * 10)]).collect();
    let mut sources: Vec<Box<dyn RowSource>> = vec![Box::new(VecSource::new(2, rows))];
    let chunks = InnerRelationLoader::new(plan, &JoinConfig::default(), usize::MAX)
        .load(&mut sources)?;

    let set = InnerRelationSet::new(
        plan,
        vec![0],
        chunks.window(&[0])?,
        into_device_set(&host_devices)?,
    )?;
    Ok((set, host_devices))
}

#[test]
fn mirror_is_uploaded_once_per_device() -> TestResult {
    let plan = full_join_plan();
    let (set, devices) = relation_set(&plan, 1)?;
    let dev = &devices[0];
    let stream = dev.stream_create()?;

    let first = set.ensure_device(0, stream)?.ok_or("No mirror")?;
    let second = set.ensure_device(0, stream)?.ok_or("No mirror")?;
    let after_upload = dev.stats()?;

    assert_eq!(first.uploaded_bytes, set.kmrels().len());
    assert_eq!(second.uploaded_bytes, 0);
    assert_eq!(first.kmrels, second.kmrels);
    assert_eq!(first.ojmap, second.ojmap);
    assert_eq!(set.device_refcnt(0)?, 2);

    // The image and the outer join map.
    assert_eq!(after_upload.allocations, 2);

    set.release_device(0)?;
    assert_eq!(dev.stats()?.frees, 0);
    set.release_device(0)?;

    // The mirror is gone, the outer join map stays for the sweep.
    assert_eq!(dev.stats()?.frees, 1);
    assert!(set.release_device(0).is_err());

    dev.stream_destroy(stream)?;
    assert_eq!(set.detach(false)?, Detach::Released);
    assert_eq!(dev.stats()?.frees, 2);
    Ok(())
}

#[test]
fn colocation_copies_the_other_devices_bits() -> TestResult {
    let plan = full_join_plan();
    let ndevs = 3;
    let (set, devices) = relation_set(&plan, ndevs)?;

    let mut streams = Vec::new();
    for (id, dev) in devices.iter().enumerate() {
        let stream = dev.stream_create()?;
        set.ensure_device(id, stream)?.ok_or("No mirror")?;
        streams.push(stream);
    }

    let copied = set.colocate_outer_join_map(1, 0, streams[0])?;
    let slot_len = set.kmrels().layout(1)?.ojmap_slot_len;

    assert!(slot_len > 0);
    assert_eq!(copied, slot_len * (ndevs - 1));
    assert_eq!(devices[0].stats()?.peer_bytes, copied);

    for (id, (dev, stream)) in devices.iter().zip(streams.into_iter()).enumerate() {
        set.release_device(id)?;
        dev.stream_destroy(stream)?;
    }
    assert_eq!(set.detach(false)?, Detach::Released);
    Ok(())
}

#[test]
fn last_detach_hands_over_to_the_sweep() -> TestResult {
    let plan = full_join_plan();
    let (set, _devices) = relation_set(&plan, 1)?;
    let task = set.attach()?;

    assert_eq!(set.refcnt()?, 2);
    assert_eq!(task.detach(true)?, Detach::Retained);
    assert_eq!(set.detach(true)?, Detach::SweepRequired);
    assert_eq!(set.refcnt()?, 1);

    // The sweep task holds the last reference.
    assert_eq!(set.detach(true)?, Detach::Released);
    assert_eq!(set.refcnt()?, 0);
    assert!(set.attach().is_err());
    assert!(set.detach(false).is_err());
    Ok(())
}

#[test]
fn inner_join_needs_no_sweep() -> TestResult {
    let plan = JoinPlan::new(
        1,
        vec![DepthPlan::hash(
            JoinType::Inner,
            2,
            vec![ColumnRef::new(0, 0)],
            vec![0],
        )],
        vec![ColumnRef::new(0, 0)],
    );
    let (set, devices) = relation_set(&plan, 1)?;
    let stream = devices[0].stream_create()?;

    let mirror = set.ensure_device(0, stream)?.ok_or("No mirror")?;
    assert_eq!(mirror.ojmap, None);
    assert_eq!(set.colocate_outer_join_map(1, 0, stream)?, 0);

    set.release_device(0)?;
    devices[0].stream_destroy(stream)?;
    assert_eq!(set.detach(true)?, Detach::Released);
    Ok(())
}

#[test]
fn exhausted_device_reports_no_mirror() -> TestResult {
    let plan = full_join_plan();
    let host_devices = HostDeviceSetBuilder::default()
        .capacity(64)
        .module(host_module(&plan))
        .build()?;
    let rows = (0..100).map(|i| vec![Some(i), Some(i)]).collect();
    let mut sources: Vec<Box<dyn RowSource>> = vec![Box::new(VecSource::new(2, rows))];
    let chunks = InnerRelationLoader::new(&plan, &JoinConfig::default(), usize::MAX)
        .load(&mut sources)?;
    let set = InnerRelationSet::new(
        &plan,
        vec![0],
        chunks.window(&[0])?,
        into_device_set(&host_devices)?,
    )?;
    let stream = host_devices[0].stream_create()?;

    assert!(set.ensure_device(0, stream)?.is_none());
    assert_eq!(set.device_refcnt(0)?, 0);
    assert_eq!(host_devices[0].stats()?.bytes_in_use, 0);

    host_devices[0].stream_destroy(stream)?;
    assert_eq!(set.detach(false)?, Detach::Released);
    Ok(())
}
