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

//! Host implementations of the join kernels.
//!
//! The kernels run on the stream threads of a simulated
//! [`HostDevice`](gpu_runtime::runtime::HostDevice) and follow the same
//! contract as device code: they communicate only through the control
//! block, the inner relation image, the source and destination chunks, and
//! the outer join map. Errors in the data are reported in the control block.
//! Only a control block that cannot be read fails the stream.

use crate::chunk::{
    set_bit, test_bit, ChunkFormat, ChunkHeader, ChunkView, MultiRelationsView, RowWriter,
    SlotWriter,
};
use crate::control::{
    read_region, write_region, ControlBlock, ERROR_CORRUPT, ERROR_INVALID_ARGUMENT, NULL_ROW,
    STATUS_NO_SPACE, STATUS_OK,
};
use crate::error::{poisoned, ErrorKind, Result};
use crate::exec::KernelKind;
use crate::plan::{ColumnRef, DepthPlan, JoinMethod, JoinPlan};
use crate::tuple::{datum, hash_key, keys_match, Datum};
use gpu_runtime::runtime::{HostKernelArg, HostModule};
use std::ops::Range;
use std::sync::Arc;
use tracing::warn;

/// Builds a module with all join kernels of `plan`.
pub fn host_module(plan: &JoinPlan) -> HostModule {
    let plan = Arc::new(plan.clone());
    KernelKind::ALL
        .iter()
        .fold(HostModule::new(), |module, &kind| {
            let plan = plan.clone();
            module.register(kind.name(), move |_, args| {
                run_kernel(kind, &plan, args).map_err(|e| {
                    gpu_runtime::error::Error::from(gpu_runtime::error::ErrorKind::KernelError(
                        kind.name().to_string(),
                        e.to_string(),
                    ))
                })
            })
        })
}

fn run_kernel(kind: KernelKind, plan: &JoinPlan, args: &[HostKernelArg]) -> Result<()> {
    let kgjoin_mem = arg(args, 0)?.buffer()?;
    let mut kgjoin = kgjoin_mem.write().map_err(poisoned)?;
    let mut control = ControlBlock::read(&kgjoin)?;
    if control.status != STATUS_OK {
        return Ok(());
    }

    let depth = match kind {
        KernelKind::ProjectRow | KernelKind::ProjectSlot => control.num_rels(),
        _ => arg(args, 3)?.u32()? as usize,
    };

    if let Err(e) = run_checked(kind, plan, args, &mut control, &mut kgjoin, depth) {
        warn!(kernel = kind.name(), depth, "Join kernel failed: {}", e);
        let code = match e.kind() {
            ErrorKind::CorruptChunk(_) => ERROR_CORRUPT,
            _ => ERROR_INVALID_ARGUMENT,
        };
        control.fail(depth, kind.code(), code);
    }

    control.write(&mut kgjoin)
}

fn run_checked(
    kind: KernelKind,
    plan: &JoinPlan,
    args: &[HostKernelArg],
    control: &mut ControlBlock,
    kgjoin: &mut [u8],
    depth: usize,
) -> Result<()> {
    if control.num_rels() != plan.num_rels() {
        Err(ErrorKind::InvalidArgument(format!(
            "Control block has {} relations, the plan has {}",
            control.num_rels(),
            plan.num_rels()
        )))?;
    }
    if depth == 0 || depth > plan.num_rels() {
        Err(ErrorKind::InvalidArgument(format!("Invalid depth {}", depth)))?;
    }

    let kmrels_guard = arg(args, 1)?.buffer()?.read().map_err(poisoned)?;
    let src_guard = match arg(args, 2)?.opt_buffer()? {
        Some(mem) => Some(mem.read().map_err(poisoned)?),
        None => None,
    };
    let inputs = Inputs::new(plan, &kmrels_guard, src_guard.as_ref().map(|g| &g[..]))?;

    match kind {
        KernelKind::Prepare => prepare(control, kgjoin, &inputs, depth),
        KernelKind::ProbeNestLoop | KernelKind::ProbeHashJoin => {
            let device = arg(args, 5)?.u32()? as usize;
            let fills_inner = plan.depth(depth)?.join_type.fills_inner();
            let mut ojmap = match arg(args, 4)?.opt_buffer()? {
                Some(mem) => Some(mem.write().map_err(poisoned)?),
                None => None,
            };
            let bits = match ojmap.as_mut() {
                Some(map) if fills_inner => {
                    let range = inputs.kmrels.layout(depth)?.ojmap_slot(device);
                    Some(slice_mut(map, range)?)
                }
                _ => None,
            };
            probe(control, kgjoin, &inputs, depth, bits)
        }
        KernelKind::SweepOuterNestLoop | KernelKind::SweepOuterHashJoin => {
            let ojmap = arg(args, 4)?
                .opt_buffer()?
                .ok_or_else(|| ErrorKind::InvalidArgument("Sweep without outer join map".into()))?
                .read()
                .map_err(poisoned)?;
            sweep(control, kgjoin, &inputs, depth, &ojmap)
        }
        KernelKind::ProjectRow | KernelKind::ProjectSlot => {
            let mut dst = arg(args, 3)?.buffer()?.write().map_err(poisoned)?;
            project(control, kgjoin, &inputs, &mut dst)
        }
    }
}

fn arg(args: &[HostKernelArg], index: usize) -> Result<&HostKernelArg> {
    args.get(index).ok_or_else(|| {
        ErrorKind::InvalidArgument(format!("Missing kernel argument {}", index)).into()
    })
}

fn slice_mut(bytes: &mut [u8], range: Range<usize>) -> Result<&mut [u8]> {
    let len = bytes.len();
    bytes.get_mut(range.clone()).ok_or_else(|| {
        ErrorKind::CorruptChunk(format!(
            "Range {:?} exceeds outer join map of {} bytes",
            range, len
        ))
        .into()
    })
}

/// Read-only inputs of a kernel.
struct Inputs<'a> {
    plan: &'a JoinPlan,
    kmrels: MultiRelationsView<'a>,
    chunks: Vec<ChunkView<'a>>,
    src: Option<ChunkView<'a>>,
}

impl<'a> Inputs<'a> {
    fn new(plan: &'a JoinPlan, kmrels: &'a [u8], src: Option<&'a [u8]>) -> Result<Self> {
        let kmrels = MultiRelationsView::parse(kmrels)?;
        if kmrels.nrels() != plan.num_rels() {
            Err(ErrorKind::CorruptChunk(format!(
                "Inner relation image has {} depths, expected {}",
                kmrels.nrels(),
                plan.num_rels()
            )))?;
        }
        let chunks = (1..=kmrels.nrels())
            .map(|depth| kmrels.chunk(depth))
            .collect::<Result<Vec<_>>>()?;
        let src = src.map(ChunkView::new).transpose()?;

        Ok(Self {
            plan,
            kmrels,
            chunks,
            src,
        })
    }

    fn chunk(&self, depth: usize) -> Result<ChunkView<'a>> {
        match depth {
            0 => self.src.ok_or_else(|| {
                ErrorKind::InvalidArgument("Outer rows referenced without a source".into()).into()
            }),
            _ => self.chunks.get(depth - 1).copied().ok_or_else(|| {
                ErrorKind::InvalidArgument(format!("No such depth: {}", depth)).into()
            }),
        }
    }

    fn datum(&self, index_row: &[u32], column: ColumnRef) -> Result<Datum> {
        let rowid = *index_row.get(column.depth).ok_or_else(|| {
            ErrorKind::CorruptChunk(format!("Index row lacks depth {}", column.depth))
        })?;
        if rowid == NULL_ROW {
            return Ok(None);
        }
        let tuple = self.chunk(column.depth)?.tuple(rowid as usize)?;
        datum(tuple, column.column)
    }

    fn outer_key(&self, depth_plan: &DepthPlan, index_row: &[u32]) -> Result<Vec<Datum>> {
        depth_plan
            .outer_keys
            .iter()
            .map(|&column| self.datum(index_row, column))
            .collect()
    }
}

fn inner_key(depth_plan: &DepthPlan, tuple: &[u8]) -> Result<Vec<Datum>> {
    depth_plan
        .inner_keys
        .iter()
        .map(|&column| datum(tuple, column))
        .collect()
}

/// Collects result index rows up to the region's rooms, counting all.
struct Emitter {
    nrooms: usize,
    rows: Vec<Vec<u32>>,
    needed: usize,
}

impl Emitter {
    fn new(control: &ControlBlock, rows: Vec<Vec<u32>>) -> Self {
        Self {
            nrooms: control.kresults_nrooms as usize,
            needed: rows.len(),
            rows,
        }
    }

    fn emit(&mut self, base: &[u32], depth: usize, rowid: u32) {
        self.needed += 1;
        if self.rows.len() < self.nrooms {
            let mut row = base.to_vec();
            row[depth] = rowid;
            self.rows.push(row);
        }
    }

    fn store(self, control: &mut ControlBlock, kgjoin: &mut [u8], depth: usize) -> Result<()> {
        write_region(kgjoin, control, depth % 2, &self.rows)?;
        control.note_needed(depth, self.needed)
    }
}

/// Fills the input region of the start depth with the admitted source rows
/// and empties the output region.
fn prepare(
    control: &mut ControlBlock,
    kgjoin: &mut [u8],
    inputs: &Inputs<'_>,
    depth: usize,
) -> Result<()> {
    if depth == control.start_depth as usize {
        let nitems = inputs.src.map_or(0, |src| src.nitems());
        let admitted = control.admitted();
        if admitted.end > nitems && inputs.src.is_some() {
            Err(ErrorKind::InvalidArgument(format!(
                "Admitted rows {:?} exceed the source of {} rows",
                admitted, nitems
            )))?;
        }

        let null_row = vec![NULL_ROW; control.num_rels() + 1];
        let mut emitter = Emitter::new(control, Vec::new());
        if inputs.src.is_some() {
            for rowid in admitted {
                emitter.emit(&null_row, 0, rowid as u32);
            }
        }
        emitter.store(control, kgjoin, depth - 1)?;
    }

    write_region(kgjoin, control, depth % 2, &[])
}

/// Joins the rows of the input region with the sub-chunk of `depth`.
fn probe(
    control: &mut ControlBlock,
    kgjoin: &mut [u8],
    inputs: &Inputs<'_>,
    depth: usize,
    mut bits: Option<&mut [u8]>,
) -> Result<()> {
    let depth_plan = inputs.plan.depth(depth)?;
    let inner = inputs.chunk(depth)?;
    let input = read_region(kgjoin, control, (depth - 1) % 2)?;
    let mut emitter = Emitter::new(control, Vec::new());

    for row in input.iter() {
        let key = inputs.outer_key(depth_plan, row)?;
        let mut matched = false;

        match depth_plan.method {
            JoinMethod::Hash => {
                let hash = hash_key(key.iter().copied());
                if !inner.hash_range().contains(hash) {
                    continue;
                }
                for item in inner.hash_chain(hash)? {
                    let item = item?;
                    if item.hash != hash || !keys_match(&key, &inner_key(depth_plan, item.tuple)?) {
                        continue;
                    }
                    matched = true;
                    emitter.emit(row, depth, item.rowid);
                    if let Some(bits) = bits.as_mut() {
                        set_bit(bits, item.rowid as usize)?;
                    }
                }
            }
            JoinMethod::NestLoop => {
                for rowid in 0..inner.nitems() {
                    let tuple = inner.tuple(rowid)?;
                    if !keys_match(&key, &inner_key(depth_plan, tuple)?) {
                        continue;
                    }
                    matched = true;
                    emitter.emit(row, depth, rowid as u32);
                    if let Some(bits) = bits.as_mut() {
                        set_bit(bits, rowid)?;
                    }
                }
            }
        }

        if !matched && depth_plan.join_type.fills_outer() {
            emitter.emit(row, depth, NULL_ROW);
        }
    }

    emitter.store(control, kgjoin, depth)
}

/// Appends the inner rows of `depth` that no device matched.
///
/// At the start depth, only the admitted rows are swept. Deeper depths are
/// swept as a whole by the part of the sweep that admits the last row.
fn sweep(
    control: &mut ControlBlock,
    kgjoin: &mut [u8],
    inputs: &Inputs<'_>,
    depth: usize,
    ojmap: &[u8],
) -> Result<()> {
    let inner = inputs.chunk(depth)?;
    let layout = inputs.kmrels.layout(depth)?;
    let admitted = control.admitted();
    let rows = if depth == control.start_depth as usize {
        admitted.start..std::cmp::min(admitted.end, inner.nitems())
    } else if admitted.end >= control.source_nitems as usize {
        0..inner.nitems()
    } else {
        0..0
    };

    let mut slots = Vec::with_capacity(inputs.kmrels.ndevs());
    for device in 0..inputs.kmrels.ndevs() {
        let range = layout.ojmap_slot(device);
        let bits = ojmap.get(range.clone()).ok_or_else(|| {
            ErrorKind::CorruptChunk(format!("Outer join map lacks {:?}", range))
        })?;
        slots.push(bits);
    }

    let existing = read_region(kgjoin, control, depth % 2)?;
    let null_row = vec![NULL_ROW; control.num_rels() + 1];
    let mut emitter = Emitter::new(control, existing);
    for rowid in rows {
        if !slots.iter().any(|bits| test_bit(bits, rowid)) {
            emitter.emit(&null_row, depth, rowid as u32);
        }
    }

    emitter.store(control, kgjoin, depth)
}

enum Destination<'a> {
    Row(RowWriter<'a>),
    Slot(SlotWriter<'a>),
}

impl<'a> Destination<'a> {
    fn open(bytes: &'a mut [u8]) -> Result<Self> {
        match ChunkHeader::read(bytes)?.format {
            ChunkFormat::Row => RowWriter::open(bytes).map(Destination::Row),
            ChunkFormat::Slot => SlotWriter::open(bytes).map(Destination::Slot),
            ChunkFormat::Hash => Err(ErrorKind::CorruptChunk(
                "Hash store cannot be a destination".to_string(),
            )
            .into()),
        }
    }

    fn push(&mut self, row: &[Datum]) -> Result<bool> {
        match self {
            Destination::Row(writer) => writer.push(row),
            Destination::Slot(writer) => writer.push(row),
        }
    }

    fn finish(self) -> Result<()> {
        match self {
            Destination::Row(writer) => writer.finish(),
            Destination::Slot(writer) => writer.finish(),
        }
    }
}

/// Writes the target list of the last depth's rows into the destination.
fn project(
    control: &mut ControlBlock,
    kgjoin: &mut [u8],
    inputs: &Inputs<'_>,
    dst: &mut [u8],
) -> Result<()> {
    let depth = control.num_rels();
    let input = read_region(kgjoin, control, depth % 2)?;
    let mut destination = Destination::open(dst)?;

    let mut full = false;
    for row in input.iter() {
        let values = inputs
            .plan
            .target_list
            .iter()
            .map(|&column| inputs.datum(row, column))
            .collect::<Result<Vec<_>>>()?;
        if !destination.push(&values)? {
            full = true;
            break;
        }
    }
    destination.finish()?;

    control.dst_needed = input.len() as u32;
    if full && control.status == STATUS_OK {
        control.status = STATUS_NO_SPACE;
    }
    Ok(())
}
