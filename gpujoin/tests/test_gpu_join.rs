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

use common::{
    fetch_all, host_devices, primary_key_rows, reference_join, run_join, sources, test_config,
    uniform_rows, zipf_rows, TestResult,
};
use gpu_runtime::runtime::{into_device_set, HostDevice, HostDeviceSetBuilder};
use gpujoin::chunk::row_store_len;
use gpujoin::control::{ControlBlock, STATUS_NO_SPACE};
use gpujoin::error::ErrorKind;
use gpujoin::exec::KernelKind;
use gpujoin::host_kernels::host_module;
use gpujoin::plan::{ColumnRef, DepthPlan, JoinMethod, JoinPlan, JoinType, ResultFormat};
use gpujoin::source::{RowSource, VecSource};
use gpujoin::tuple::Row;
use gpujoin::{Fetch, GpuJoin};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

const JOIN_TYPES: [JoinType; 4] = [
    JoinType::Inner,
    JoinType::Left,
    JoinType::Right,
    JoinType::Full,
];

fn depth_plan(method: JoinMethod, join_type: JoinType) -> DepthPlan {
    let outer_keys = vec![ColumnRef::new(0, 0)];
    match method {
        JoinMethod::Hash => DepthPlan::hash(join_type, 2, outer_keys, vec![0]),
        JoinMethod::NestLoop => DepthPlan::nest_loop(join_type, 2, outer_keys, vec![0]),
    }
}

fn two_way_plan(depth: DepthPlan) -> JoinPlan {
    JoinPlan::new(
        2,
        vec![depth],
        vec![
            ColumnRef::new(0, 0),
            ColumnRef::new(0, 1),
            ColumnRef::new(1, 0),
            ColumnRef::new(1, 1),
        ],
    )
}

/// Host devices whose row projection only rewrites the control block. The
/// result chunks stay empty.
fn devices_with_projection<F>(plan: &JoinPlan, rewrite: F) -> TestResult<Vec<Arc<HostDevice>>>
where
    F: Fn(&mut ControlBlock) + Send + Sync + 'static,
{
    let to_runtime = |e: gpujoin::error::Error| {
        gpu_runtime::error::ErrorKind::KernelError("project_row".to_string(), e.to_string())
    };
    let module = host_module(plan).register(KernelKind::ProjectRow.name(), move |_, args| {
        let memory = args[0].buffer()?;
        let mut kgjoin = memory.write().map_err(|_| {
            gpu_runtime::error::ErrorKind::LogicError("Poisoned control block".to_string())
        })?;
        let mut control = ControlBlock::read(&kgjoin).map_err(to_runtime)?;
        rewrite(&mut control);
        control.write(&mut kgjoin).map_err(to_runtime)?;
        Ok(())
    });

    Ok(HostDeviceSetBuilder::default().module(module).build()?)
}

fn expect_error<T>(result: gpujoin::error::Result<T>, matches: fn(&ErrorKind) -> bool) {
    match result {
        Err(e) if matches(e.kind()) => {}
        Err(e) => panic!("Unexpected error: {}", e),
        Ok(_) => panic!("Expected an error"),
    }
}

#[test]
fn two_way_joins_match_reference() -> TestResult {
    let outer = uniform_rows(500, 300, 1)?;
    let inner = primary_key_rows(200, 90, 2)?;

    for &method in &[JoinMethod::Hash, JoinMethod::NestLoop] {
        for &join_type in JOIN_TYPES.iter() {
            let plan = two_way_plan(depth_plan(method, join_type));
            let devices = host_devices(&plan, 1)?;
            let inners = vec![inner.clone()];

            let (rows, stats) = run_join(&plan, test_config(), &devices, &outer, &inners)?;

            assert_eq!(
                rows,
                reference_join(&plan, &outer, &inners),
                "{:?} {:?} join",
                method,
                join_type
            );
            assert_eq!(stats.result_rows, rows.len());
            assert_eq!(
                stats.sweep_tasks > 0,
                join_type.fills_inner(),
                "{:?} {:?} join",
                method,
                join_type
            );
            assert_eq!(devices[0].stats()?.bytes_in_use, 0);
        }
    }
    Ok(())
}

#[test]
fn nest_loop_inner_is_split_into_sub_chunks() -> TestResult {
    let plan = two_way_plan(
        depth_plan(JoinMethod::NestLoop, JoinType::Inner).ichunk_size(row_store_len(2, 150)),
    );
    let config = test_config().min_inner_budget(0);
    let devices = host_devices(&plan, 1)?;
    let outer = uniform_rows(1000, 400, 3)?;
    let inners = vec![uniform_rows(300, 400, 4)?];

    let (rows, stats) = run_join(&plan, config, &devices, &outer, &inners)?;

    assert_eq!(stats.inner_sub_chunks, 2);
    assert_eq!(stats.windows, 2);
    assert_eq!(rows, reference_join(&plan, &outer, &inners));
    Ok(())
}

#[test]
fn partitioned_right_join_emits_unmatched_rows_once() -> TestResult {
    let plan = two_way_plan(
        depth_plan(JoinMethod::Hash, JoinType::Right)
            .ichunk_size(16 << 10)
            .nbatches(8),
    );
    let config = test_config().min_inner_budget(0);
    let devices = host_devices(&plan, 1)?;
    let outer = uniform_rows(500, 4000, 5)?;
    let inners = vec![primary_key_rows(2000, 95, 6)?];

    let (rows, stats) = run_join(&plan, config, &devices, &outer, &inners)?;

    assert!(stats.inner_sub_chunks > 1);
    assert_eq!(stats.sweep_tasks, stats.windows);
    assert_eq!(rows, reference_join(&plan, &outer, &inners));

    // The payload identifies the inner row.
    let mut seen = HashMap::new();
    for row in rows.iter().filter(|row| row[0].is_none()) {
        *seen.entry(row[3]).or_insert(0) += 1;
    }
    assert!(!seen.is_empty());
    assert!(seen.values().all(|&count| count == 1));
    Ok(())
}

#[test]
fn right_join_after_large_inner_relation() -> TestResult {
    let plan = JoinPlan::new(
        2,
        vec![
            DepthPlan::nest_loop(JoinType::Inner, 2, vec![ColumnRef::new(0, 0)], vec![0])
                .ichunk_size(row_store_len(2, 50)),
            DepthPlan::hash(JoinType::Right, 2, vec![ColumnRef::new(1, 1)], vec![0]),
        ],
        vec![
            ColumnRef::new(0, 0),
            ColumnRef::new(1, 1),
            ColumnRef::new(2, 0),
            ColumnRef::new(2, 1),
        ],
    );
    let config = test_config().min_inner_budget(0);
    let devices = host_devices(&plan, 1)?;
    let outer = uniform_rows(200, 100, 31)?;
    let inners = vec![uniform_rows(100, 100, 32)?, primary_key_rows(60, 90, 33)?];

    let (rows, stats) = run_join(&plan, config, &devices, &outer, &inners)?;

    assert_eq!(stats.windows, 1);
    assert_eq!(stats.sweep_tasks, 1);
    assert_eq!(rows, reference_join(&plan, &outer, &inners));

    let mut unmatched = HashMap::new();
    for row in rows.iter().filter(|row| row[0].is_none()) {
        *unmatched.entry(row[3]).or_insert(0) += 1;
    }
    assert!(!unmatched.is_empty());
    assert!(unmatched.values().all(|&count| count == 1));
    Ok(())
}

#[test]
fn right_join_before_split_inner_relation() -> TestResult {
    let plan = JoinPlan::new(
        2,
        vec![
            DepthPlan::hash(JoinType::Right, 2, vec![ColumnRef::new(0, 0)], vec![0]),
            DepthPlan::nest_loop(JoinType::Inner, 2, vec![ColumnRef::new(1, 1)], vec![0])
                .ichunk_size(row_store_len(2, 50)),
        ],
        vec![
            ColumnRef::new(0, 1),
            ColumnRef::new(1, 0),
            ColumnRef::new(1, 1),
            ColumnRef::new(2, 1),
        ],
    );
    let config = test_config().min_inner_budget(0);
    let devices = host_devices(&plan, 1)?;
    let outer = uniform_rows(200, 150, 34)?;
    let inners = vec![primary_key_rows(100, 90, 35)?, uniform_rows(100, 100, 36)?];

    let (rows, stats) = run_join(&plan, config, &devices, &outer, &inners)?;

    assert_eq!(stats.windows, 2);
    assert_eq!(stats.sweep_tasks, 2);
    assert!(rows.iter().any(|row| row[0].is_none()));
    assert_eq!(rows, reference_join(&plan, &outer, &inners));
    Ok(())
}

#[test]
fn undersized_buffers_are_retried_and_continued() -> TestResult {
    let plan = JoinPlan::new(
        2,
        vec![depth_plan(JoinMethod::Hash, JoinType::Inner).nrows_ratio(0.01)],
        vec![ColumnRef::new(0, 1), ColumnRef::new(1, 1)],
    )
    .outer_plan_rows(1_000_000.0)
    .kresults_ratio(0.01);
    let outer = uniform_rows(400, 10, 7)?;
    let inners = vec![uniform_rows(200, 10, 8)?];

    let small = test_config().chunk_size(8 << 10);
    let (small_rows, small_stats) =
        run_join(&plan, small, &host_devices(&plan, 1)?, &outer, &inners)?;
    let large = test_config().chunk_size(1 << 20).chunk_size_limit(16 << 20);
    let (large_rows, _) = run_join(&plan, large, &host_devices(&plan, 1)?, &outer, &inners)?;

    assert!(small_stats.retries > 0);
    assert!(small_stats.continuations > 0);
    assert_eq!(small_rows, large_rows);
    assert_eq!(small_rows, reference_join(&plan, &outer, &inners));
    Ok(())
}

#[test]
fn skewed_outer_relation_matches_reference() -> TestResult {
    let plan = two_way_plan(depth_plan(JoinMethod::Hash, JoinType::Full));
    let devices = host_devices(&plan, 2)?;
    let config = test_config().chunk_size(8 << 10);
    let outer = zipf_rows(2000, 500, 1.2, 43)?;
    let inners = vec![primary_key_rows(500, 80, 44)?];

    let (rows, stats) = run_join(&plan, config, &devices, &outer, &inners)?;

    assert!(stats.tasks_launched > 1);
    assert_eq!(rows, reference_join(&plan, &outer, &inners));
    Ok(())
}

#[test]
fn full_join_combines_matches_of_all_devices() -> TestResult {
    let plan = two_way_plan(depth_plan(JoinMethod::Hash, JoinType::Full));
    let devices = host_devices(&plan, 2)?;
    let config = test_config().chunk_size(8 << 10);
    let outer = uniform_rows(2000, 3000, 9)?;
    let inners = vec![primary_key_rows(1000, 100, 10)?];

    let (rows, stats) = run_join(&plan, config, &devices, &outer, &inners)?;

    assert!(stats.bytes_colocated > 0);
    assert_eq!(stats.sweep_tasks, 1);
    assert_eq!(rows, reference_join(&plan, &outer, &inners));
    for dev in devices.iter() {
        assert!(dev.stats()?.kernel_launches > 0);
        assert_eq!(dev.stats()?.bytes_in_use, 0);
    }
    Ok(())
}

#[test]
fn three_way_join_with_mixed_outer_joins() -> TestResult {
    let plan = JoinPlan::new(
        2,
        vec![
            DepthPlan::hash(JoinType::Inner, 2, vec![ColumnRef::new(0, 0)], vec![0]),
            DepthPlan::hash(JoinType::Full, 2, vec![ColumnRef::new(0, 0)], vec![0]),
            DepthPlan::nest_loop(JoinType::Right, 2, vec![ColumnRef::new(2, 0)], vec![0]),
        ],
        vec![
            ColumnRef::new(0, 1),
            ColumnRef::new(1, 1),
            ColumnRef::new(2, 0),
            ColumnRef::new(2, 1),
            ColumnRef::new(3, 0),
            ColumnRef::new(3, 1),
        ],
    );
    let devices = host_devices(&plan, 2)?;
    let outer = uniform_rows(300, 100, 11)?;
    let inners = vec![
        primary_key_rows(80, 90, 12)?,
        uniform_rows(60, 150, 13)?,
        uniform_rows(40, 150, 14)?,
    ];

    let (rows, stats) = run_join(&plan, test_config(), &devices, &outer, &inners)?;

    assert_eq!(stats.sweep_tasks, 1);
    assert_eq!(rows, reference_join(&plan, &outer, &inners));
    Ok(())
}

#[test]
fn every_window_is_joined() -> TestResult {
    let plan = JoinPlan::new(
        2,
        vec![
            DepthPlan::nest_loop(JoinType::Inner, 2, vec![ColumnRef::new(0, 0)], vec![0])
                .ichunk_size(row_store_len(2, 50)),
            DepthPlan::nest_loop(JoinType::Inner, 2, vec![ColumnRef::new(0, 0)], vec![0])
                .ichunk_size(row_store_len(2, 50)),
        ],
        vec![
            ColumnRef::new(0, 1),
            ColumnRef::new(1, 1),
            ColumnRef::new(2, 1),
        ],
    );
    let config = test_config().min_inner_budget(0);
    let devices = host_devices(&plan, 1)?;
    let outer = uniform_rows(200, 50, 15)?;
    let inners = vec![uniform_rows(100, 50, 16)?, uniform_rows(100, 50, 17)?];

    let (rows, stats) = run_join(&plan, config, &devices, &outer, &inners)?;

    assert_eq!(stats.inner_sub_chunks, 4);
    assert_eq!(stats.windows, 4);
    assert_eq!(rows, reference_join(&plan, &outer, &inners));
    Ok(())
}

#[test]
fn slot_results_match_row_results() -> TestResult {
    let row_plan = two_way_plan(depth_plan(JoinMethod::Hash, JoinType::Left));
    let slot_plan = row_plan.clone().result_format(ResultFormat::Slot);
    let outer = uniform_rows(300, 200, 18)?;
    let inners = vec![primary_key_rows(150, 80, 19)?];

    let (rows, _) = run_join(
        &row_plan,
        test_config(),
        &host_devices(&row_plan, 1)?,
        &outer,
        &inners,
    )?;
    let (slots, _) = run_join(
        &slot_plan,
        test_config(),
        &host_devices(&slot_plan, 1)?,
        &outer,
        &inners,
    )?;

    assert_eq!(rows, slots);
    Ok(())
}

#[test]
fn slot_results_without_columns_count_rows() -> TestResult {
    let mut plan = two_way_plan(depth_plan(JoinMethod::Hash, JoinType::Inner))
        .result_format(ResultFormat::Slot);
    plan.target_list.clear();
    let outer = uniform_rows(300, 100, 20)?;
    let inners = vec![uniform_rows(100, 100, 21)?];

    let (rows, stats) = run_join(
        &plan,
        test_config(),
        &host_devices(&plan, 1)?,
        &outer,
        &inners,
    )?;
    let expected = reference_join(&plan, &outer, &inners);

    assert!(!expected.is_empty());
    assert_eq!(rows.len(), expected.len());
    assert_eq!(stats.result_rows, expected.len());
    assert!(rows.iter().all(|row| row.is_empty()));
    Ok(())
}

#[test]
fn tiny_devices_starve() -> TestResult {
    let plan = two_way_plan(depth_plan(JoinMethod::Hash, JoinType::Inner));
    let devices = HostDeviceSetBuilder::default()
        .capacity(4 << 10)
        .module(host_module(&plan))
        .build()?;
    let outer = uniform_rows(100, 100, 22)?;
    let inners = vec![uniform_rows(100, 100, 23)?];

    let mut join = GpuJoin::new(
        plan.clone(),
        test_config(),
        into_device_set(&devices)?,
        Box::new(VecSource::new(2, outer)),
        sources(&plan, &inners),
    )?;

    expect_error(join.bulk_fetch(), |kind| {
        matches!(kind, ErrorKind::DeviceStarvation(_))
    });
    join.close()?;
    assert_eq!(devices[0].stats()?.bytes_in_use, 0);
    Ok(())
}

#[test]
fn skewed_outer_join_inner_fails() -> TestResult {
    let plan = two_way_plan(depth_plan(JoinMethod::Hash, JoinType::Left).ichunk_size(4 << 10));
    let config = test_config().min_inner_budget(0);
    let devices = host_devices(&plan, 1)?;
    let outer = uniform_rows(100, 10, 24)?;
    let skewed = (0..1000).map(|i| vec![Some(1), Some(i)]).collect();

    let mut join = GpuJoin::new(
        plan.clone(),
        config,
        into_device_set(&devices)?,
        Box::new(VecSource::new(2, outer)),
        sources(&plan, &[skewed]),
    )?;

    expect_error(join.bulk_fetch(), |kind| {
        matches!(kind, ErrorKind::SkewTooExtreme(_))
    });
    Ok(())
}

#[test]
fn endless_overflow_gives_up() -> TestResult {
    let plan = two_way_plan(depth_plan(JoinMethod::Hash, JoinType::Inner));
    let devices = devices_with_projection(&plan, |control| control.status = STATUS_NO_SPACE)?;
    let outer = uniform_rows(100, 100, 37)?;
    let inners = vec![uniform_rows(100, 100, 38)?];

    let mut join = GpuJoin::new(
        plan.clone(),
        test_config(),
        into_device_set(&devices)?,
        Box::new(VecSource::new(2, outer)),
        sources(&plan, &inners),
    )?;

    expect_error(join.bulk_fetch(), |kind| {
        matches!(kind, ErrorKind::ResultGrowthTooLarge(_))
    });
    assert_eq!(join.stats().retries, 31);
    join.close()?;
    assert_eq!(devices[0].stats()?.bytes_in_use, 0);
    Ok(())
}

#[test]
fn failed_continuation_releases_device_memory() -> TestResult {
    let plan = two_way_plan(depth_plan(JoinMethod::Hash, JoinType::Inner))
        .kresults_ratio(20.0)
        .outer_plan_rows(100.0);
    // Reports an enormous growth, so the rows behind the admitted ones can
    // never fit.
    let devices = devices_with_projection(&plan, |control| {
        let last = control.num_rels();
        control.outer_nitems[last] = 1 << 30;
    })?;
    let outer = uniform_rows(500, 100, 39)?;
    let inners = vec![primary_key_rows(100, 100, 40)?];

    let mut join = GpuJoin::new(
        plan.clone(),
        test_config(),
        into_device_set(&devices)?,
        Box::new(VecSource::new(2, outer)),
        sources(&plan, &inners),
    )?;

    expect_error(join.bulk_fetch(), |kind| {
        matches!(kind, ErrorKind::ResultGrowthTooLarge(_))
    });
    assert_eq!(join.stats().continuations, 0);
    join.close()?;
    assert_eq!(devices[0].stats()?.bytes_in_use, 0);
    Ok(())
}

#[test]
fn chunks_without_rows_are_skipped() -> TestResult {
    let plan = two_way_plan(depth_plan(JoinMethod::Hash, JoinType::Inner));
    let devices = host_devices(&plan, 1)?;
    let outer = (0..100).map(|i| vec![Some(i), Some(i)]).collect::<Vec<Row>>();
    let inner = (1000..1100).map(|i| vec![Some(i), Some(i)]).collect::<Vec<Row>>();

    let mut join = GpuJoin::new(
        plan.clone(),
        test_config(),
        into_device_set(&devices)?,
        Box::new(VecSource::new(2, outer)),
        sources(&plan, &[inner]),
    )?;

    assert!(join.next_chunk()?.is_none());
    assert_eq!(join.next_tuple()?, Fetch::NeedNextChunk);
    assert!(join.stats().result_chunks > 0);
    assert_eq!(join.stats().result_rows, 0);

    join.rescan()?;
    assert!(join.bulk_fetch()?.is_none());
    Ok(())
}

#[test]
fn rescan_with_running_tasks_does_not_sweep() -> TestResult {
    let plan = two_way_plan(depth_plan(JoinMethod::Hash, JoinType::Right));
    let devices = host_devices(&plan, 2)?;
    let outer = uniform_rows(2000, 3000, 41)?;
    let inners = vec![primary_key_rows(1000, 100, 42)?];

    let mut join = GpuJoin::new(
        plan.clone(),
        test_config().chunk_size(8 << 10),
        into_device_set(&devices)?,
        Box::new(VecSource::new(2, outer.clone())),
        sources(&plan, &inners),
    )?;

    assert!(join.next_chunk()?.is_some());
    join.rescan()?;
    assert_eq!(join.stats().sweep_tasks, 0);

    assert_eq!(fetch_all(&mut join)?, reference_join(&plan, &outer, &inners));
    assert_eq!(join.stats().sweep_tasks, 1);
    join.close()?;
    for dev in devices.iter() {
        assert_eq!(dev.stats()?.bytes_in_use, 0);
    }
    Ok(())
}

#[test]
fn empty_relations() -> TestResult {
    let rows = uniform_rows(100, 50, 25)?;

    for &join_type in JOIN_TYPES.iter() {
        let plan = two_way_plan(depth_plan(JoinMethod::Hash, join_type));
        let devices = host_devices(&plan, 1)?;

        let (empty_inner, _) =
            run_join(&plan, test_config(), &devices, &rows, &[Vec::new()])?;
        let (empty_outer, _) =
            run_join(&plan, test_config(), &devices, &[], &[rows.clone()])?;

        let outer_rows = if join_type.fills_outer() { rows.len() } else { 0 };
        let inner_rows = if join_type.fills_inner() { rows.len() } else { 0 };
        assert_eq!(empty_inner.len(), outer_rows, "{:?} join", join_type);
        assert_eq!(empty_outer.len(), inner_rows, "{:?} join", join_type);
        assert!(empty_outer.iter().all(|row| row[0].is_none()));
    }
    Ok(())
}

#[test]
fn mismatching_relations_are_rejected() -> TestResult {
    let plan = two_way_plan(depth_plan(JoinMethod::Hash, JoinType::Inner));
    let devices = host_devices(&plan, 1)?;

    let wrong_outer = GpuJoin::new(
        plan.clone(),
        test_config(),
        into_device_set(&devices)?,
        Box::new(VecSource::new(3, Vec::new())),
        sources(&plan, &[Vec::new()]),
    );
    expect_error(wrong_outer, |kind| matches!(kind, ErrorKind::InvalidArgument(_)));

    let missing_inner = GpuJoin::new(
        plan.clone(),
        test_config(),
        into_device_set(&devices)?,
        Box::new(VecSource::new(2, Vec::new())),
        Vec::new(),
    );
    expect_error(missing_inner, |kind| matches!(kind, ErrorKind::InvalidArgument(_)));
    Ok(())
}

/// An inner relation that counts its scans.
struct CountingSource {
    rows: Arc<Mutex<Vec<Row>>>,
    position: usize,
    scans: Arc<AtomicUsize>,
    changed: Arc<AtomicBool>,
}

impl RowSource for CountingSource {
    fn ncols(&self) -> usize {
        2
    }

    fn next_row(&mut self) -> gpujoin::error::Result<Option<Row>> {
        let rows = self
            .rows
            .lock()
            .map_err(|_| ErrorKind::LogicError("Poisoned rows".to_string()))?;
        let row = rows.get(self.position).cloned();
        self.position += 1;
        if self.position == 1 {
            self.scans.fetch_add(1, Ordering::SeqCst);
        }
        Ok(row)
    }

    fn rescan(&mut self) -> gpujoin::error::Result<()> {
        self.position = 0;
        self.changed.store(false, Ordering::SeqCst);
        Ok(())
    }

    fn params_changed(&self) -> bool {
        self.changed.load(Ordering::SeqCst)
    }
}

#[test]
fn rescan_reloads_only_changed_inner_relations() -> TestResult {
    let plan = two_way_plan(depth_plan(JoinMethod::Hash, JoinType::Inner));
    let devices = host_devices(&plan, 1)?;
    let outer = uniform_rows(300, 100, 26)?;
    let first = uniform_rows(100, 100, 27)?;
    let second = uniform_rows(100, 100, 28)?;

    let rows = Arc::new(Mutex::new(first.clone()));
    let scans = Arc::new(AtomicUsize::new(0));
    let changed = Arc::new(AtomicBool::new(false));
    let inner = CountingSource {
        rows: rows.clone(),
        position: 0,
        scans: scans.clone(),
        changed: changed.clone(),
    };

    let mut join = GpuJoin::new(
        plan.clone(),
        test_config(),
        into_device_set(&devices)?,
        Box::new(VecSource::new(2, outer.clone())),
        vec![Box::new(inner)],
    )?;

    let expected = reference_join(&plan, &outer, &[first]);
    assert_eq!(fetch_all(&mut join)?, expected);
    assert_eq!(scans.load(Ordering::SeqCst), 1);

    join.rescan()?;
    assert_eq!(fetch_all(&mut join)?, expected);
    assert_eq!(scans.load(Ordering::SeqCst), 1);

    *rows.lock().map_err(|_| "Poisoned rows")? = second.clone();
    changed.store(true, Ordering::SeqCst);
    join.rescan()?;
    assert_eq!(
        fetch_all(&mut join)?,
        reference_join(&plan, &outer, &[second])
    );
    assert_eq!(scans.load(Ordering::SeqCst), 2);

    join.close()?;
    join.close()?;
    assert_eq!(devices[0].stats()?.bytes_in_use, 0);
    Ok(())
}

#[test]
fn tuples_are_fetched_one_by_one() -> TestResult {
    let plan = two_way_plan(depth_plan(JoinMethod::Hash, JoinType::Left));
    let devices = host_devices(&plan, 1)?;
    let outer = uniform_rows(300, 100, 29)?;
    let inners = vec![primary_key_rows(100, 90, 30)?];

    let mut join = GpuJoin::new(
        plan.clone(),
        test_config().chunk_size(8 << 10),
        into_device_set(&devices)?,
        Box::new(VecSource::new(2, outer.clone())),
        sources(&plan, &inners),
    )?;

    assert_eq!(join.next_tuple()?, Fetch::NeedNextChunk);

    let mut rows = Vec::new();
    while join.next_chunk()?.is_some() {
        while let Fetch::Row(row) = join.next_tuple()? {
            rows.push(row);
        }
    }
    assert!(join.next_chunk()?.is_none());
    rows.sort();

    assert_eq!(rows, reference_join(&plan, &outer, &inners));
    assert!(join.stats().result_chunks > 1);
    Ok(())
}
