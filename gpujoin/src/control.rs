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

//! The kernel control block ("kgjoin").
//!
//! The control block carries the parameters of one task into the kernels and
//! their progress and status back to the host. It is followed by two result
//! index regions that the depths use alternately: depth `d` reads region
//! `(d - 1) % 2` and writes region `d % 2`.
//!
//! A region is `nitems: u32, pad: u32` followed by `kresults_nrooms` rows of
//! `num_rels + 1` row indexes each. Index `k` of a row selects a row of the
//! relation at depth `k`, or is `NULL_ROW` for a NULL-extended relation.

use crate::error::{ErrorKind, Result};
use crate::tuple::to_u32;
use std::convert::TryInto;

/// Kernels completed.
pub const STATUS_OK: u32 = 0;

/// A result buffer ran out of rooms. The task must be retried with larger
/// buffers.
pub const STATUS_NO_SPACE: u32 = 1;

/// A kernel failed. The failing depth, kernel, and error code are set.
pub const STATUS_ERROR: u32 = 2;

/// Error code of a kernel that found a malformed image.
pub const ERROR_CORRUPT: u32 = 1;

/// Error code of a kernel called with invalid parameters.
pub const ERROR_INVALID_ARGUMENT: u32 = 2;

/// Row index of a NULL-extended relation.
pub const NULL_ROW: u32 = u32::MAX;

const FIXED_LEN: usize = 48;
const REGION_HEADER_LEN: usize = 8;

fn align8(len: usize) -> usize {
    (len + 7) & !7
}

/// Byte length of the control block without its regions.
pub fn control_len(num_rels: usize) -> usize {
    align8(FIXED_LEN + 4 * (num_rels + 1))
}

fn region_len(num_rels: usize, nrooms: usize) -> usize {
    align8(REGION_HEADER_LEN + 4 * (num_rels + 1) * nrooms)
}

/// Byte length of the control block including both regions.
pub fn kgjoin_len(num_rels: usize, nrooms: usize) -> usize {
    control_len(num_rels) + 2 * region_len(num_rels, nrooms)
}

/// Bytes of one result index row.
pub fn index_row_len(num_rels: usize) -> usize {
    4 * (num_rels + 1)
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ControlBlock {
    pub status: u32,
    pub error_depth: u32,
    pub error_kernel: u32,
    pub error_code: u32,
    pub num_rels: u32,
    pub start_depth: u32,

    /// First admitted row of the source.
    pub oitems_base: u32,

    /// Number of admitted rows.
    pub oitems_nums: u32,

    /// Rooms of each result index region.
    pub kresults_nrooms: u32,

    /// Largest number of rooms any depth needed.
    pub kresults_needed: u32,

    /// Rooms the projection needed.
    pub dst_needed: u32,

    /// Rows of the source, admitted or not.
    pub source_nitems: u32,

    /// Rows produced per depth; index 0 counts the admitted source rows.
    pub outer_nitems: Vec<u32>,
}

impl ControlBlock {
    pub fn new(num_rels: usize, start_depth: usize) -> Result<Self> {
        Ok(Self {
            num_rels: to_u32(num_rels, "Relation count")?,
            start_depth: to_u32(start_depth, "Start depth")?,
            outer_nitems: vec![0; num_rels + 1],
            ..Self::default()
        })
    }

    pub fn num_rels(&self) -> usize {
        self.num_rels as usize
    }

    pub fn read(bytes: &[u8]) -> Result<Self> {
        let field = |offset: usize| -> Result<u32> {
            bytes
                .get(offset..offset + 4)
                .and_then(|b| b.try_into().ok())
                .map(u32::from_le_bytes)
                .ok_or_else(|| {
                    ErrorKind::CorruptChunk("Control block is truncated".to_string()).into()
                })
        };

        let num_rels = field(16)? as usize;
        let outer_nitems = (0..=num_rels)
            .map(|d| field(FIXED_LEN + 4 * d))
            .collect::<Result<Vec<_>>>()?;

        Ok(Self {
            status: field(0)?,
            error_depth: field(4)?,
            error_kernel: field(8)?,
            error_code: field(12)?,
            num_rels: num_rels as u32,
            start_depth: field(20)?,
            oitems_base: field(24)?,
            oitems_nums: field(28)?,
            kresults_nrooms: field(32)?,
            kresults_needed: field(36)?,
            dst_needed: field(40)?,
            source_nitems: field(44)?,
            outer_nitems,
        })
    }

    pub fn write(&self, bytes: &mut [u8]) -> Result<()> {
        if bytes.len() < control_len(self.num_rels()) || self.outer_nitems.len() != self.num_rels() + 1
        {
            Err(ErrorKind::CorruptChunk(
                "Control block does not fit".to_string(),
            ))?;
        }

        let fields = [
            self.status,
            self.error_depth,
            self.error_kernel,
            self.error_code,
            self.num_rels,
            self.start_depth,
            self.oitems_base,
            self.oitems_nums,
            self.kresults_nrooms,
            self.kresults_needed,
            self.dst_needed,
            self.source_nitems,
        ];
        for (i, value) in fields.iter().chain(self.outer_nitems.iter()).enumerate() {
            bytes[4 * i..4 * i + 4].copy_from_slice(&value.to_le_bytes());
        }

        Ok(())
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        let mut bytes = vec![0; control_len(self.num_rels())];
        self.write(&mut bytes)?;
        Ok(bytes)
    }

    /// Records that `needed` rooms were required at `depth`, and flags an
    /// overflow if they exceed the region.
    pub fn note_needed(&mut self, depth: usize, needed: usize) -> Result<()> {
        let needed = to_u32(needed, "Needed rooms")?;
        if let Some(nitems) = self.outer_nitems.get_mut(depth) {
            *nitems = needed;
        }
        self.kresults_needed = std::cmp::max(self.kresults_needed, needed);
        if needed > self.kresults_nrooms && self.status == STATUS_OK {
            self.status = STATUS_NO_SPACE;
        }
        Ok(())
    }

    pub fn fail(&mut self, depth: usize, kernel: u32, code: u32) {
        self.status = STATUS_ERROR;
        self.error_depth = depth as u32;
        self.error_kernel = kernel;
        self.error_code = code;
    }

    /// The admitted source rows.
    pub fn admitted(&self) -> std::ops::Range<usize> {
        let base = self.oitems_base as usize;
        base..base + self.oitems_nums as usize
    }
}

/// Reads the rows of result index region `region`.
pub fn read_region(bytes: &[u8], control: &ControlBlock, region: usize) -> Result<Vec<Vec<u32>>> {
    let width = control.num_rels() + 1;
    let start = region_start(control, region);
    let nitems = read_at(bytes, start)? as usize;
    if nitems > control.kresults_nrooms as usize {
        Err(ErrorKind::CorruptChunk(format!(
            "Region {} holds {} rows, but has only {} rooms",
            region, nitems, control.kresults_nrooms
        )))?;
    }

    (0..nitems)
        .map(|i| -> Result<Vec<u32>> {
            let row = start + REGION_HEADER_LEN + 4 * width * i;
            (0..width).map(|k| read_at(bytes, row + 4 * k)).collect()
        })
        .collect()
}

/// Replaces the rows of result index region `region`.
///
/// Rows beyond the region's rooms are dropped; the caller flags the
/// overflow with `ControlBlock::note_needed`.
pub fn write_region(
    bytes: &mut [u8],
    control: &ControlBlock,
    region: usize,
    rows: &[Vec<u32>],
) -> Result<()> {
    let width = control.num_rels() + 1;
    let start = region_start(control, region);
    let nitems = std::cmp::min(rows.len(), control.kresults_nrooms as usize);

    write_at(bytes, start, nitems as u32)?;
    for (i, row) in rows.iter().take(nitems).enumerate() {
        if row.len() != width {
            Err(ErrorKind::LogicError(format!(
                "Index row has {} entries, expected {}",
                row.len(),
                width
            )))?;
        }
        let offset = start + REGION_HEADER_LEN + 4 * width * i;
        for (k, index) in row.iter().enumerate() {
            write_at(bytes, offset + 4 * k, *index)?;
        }
    }

    Ok(())
}

fn region_start(control: &ControlBlock, region: usize) -> usize {
    let num_rels = control.num_rels();
    control_len(num_rels) + (region % 2) * region_len(num_rels, control.kresults_nrooms as usize)
}

fn read_at(bytes: &[u8], offset: usize) -> Result<u32> {
    bytes
        .get(offset..offset + 4)
        .and_then(|b| b.try_into().ok())
        .map(u32::from_le_bytes)
        .ok_or_else(|| ErrorKind::CorruptChunk("Result region is truncated".to_string()).into())
}

fn write_at(bytes: &mut [u8], offset: usize, value: u32) -> Result<()> {
    bytes
        .get_mut(offset..offset + 4)
        .ok_or_else(|| ErrorKind::CorruptChunk("Result region is truncated".to_string()))?
        .copy_from_slice(&value.to_le_bytes());
    Ok(())
}
