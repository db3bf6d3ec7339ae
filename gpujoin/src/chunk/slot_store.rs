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

//! Slot store: header | `i64` values \[nrooms × ncols\] | `u8` null flags
//! \[nrooms × ncols\], both column-major.
//!
//! A slot store without columns only counts rows and has unlimited rooms.

use super::header::{align8, read_u64, write_u64, ChunkFormat, ChunkHeader, HEADER_LEN};
use crate::error::{ErrorKind, Result};
use crate::tuple::{to_u32, Datum, Row};

/// Byte length of a slot store with room for `nrooms` rows.
pub fn slot_store_len(ncols: usize, nrooms: usize) -> usize {
    if ncols == 0 {
        HEADER_LEN
    } else {
        nulls_offset(ncols, nrooms) + align8(nrooms * ncols)
    }
}

fn nulls_offset(ncols: usize, nrooms: usize) -> usize {
    HEADER_LEN + align8(8 * nrooms * ncols)
}

/// Returns the header of an empty slot store destination.
pub fn slot_destination(ncols: usize, nrooms: usize) -> Result<ChunkHeader> {
    let nrooms = if ncols == 0 { u32::MAX as usize } else { nrooms };
    let mut header = ChunkHeader::new(ChunkFormat::Slot, to_u32(ncols, "Column count")?);
    header.nrooms = to_u32(nrooms, "Destination rooms")?;
    header.length = slot_store_len(ncols, nrooms) as u64;
    header.usage = header.length;
    Ok(header)
}

/// Writes rows into a slot store destination in device memory.
#[derive(Debug)]
pub struct SlotWriter<'a> {
    bytes: &'a mut [u8],
    header: ChunkHeader,
}

impl<'a> SlotWriter<'a> {
    pub fn open(bytes: &'a mut [u8]) -> Result<Self> {
        let header = ChunkHeader::read(bytes)?;
        if header.format != ChunkFormat::Slot {
            Err(ErrorKind::CorruptChunk(format!(
                "Expected a slot store destination, got {:?}",
                header.format
            )))?;
        }
        Ok(Self { bytes, header })
    }

    pub fn ncols(&self) -> usize {
        self.header.ncols as usize
    }

    /// Appends a row. Returns `false` if the destination is full.
    pub fn push(&mut self, row: &[Datum]) -> Result<bool> {
        if self.header.nitems >= self.header.nrooms {
            return Ok(false);
        }
        if row.len() != self.ncols() {
            Err(ErrorKind::InvalidArgument(format!(
                "Row has {} columns, destination has {}",
                row.len(),
                self.ncols()
            )))?;
        }

        let ncols = self.ncols();
        let nrooms = self.header.nrooms as usize;
        let index = self.header.nitems as usize;
        let nulls = nulls_offset(ncols, nrooms);

        for (column, datum) in row.iter().enumerate() {
            let cell = column * nrooms + index;
            write_u64(self.bytes, HEADER_LEN + 8 * cell, datum.unwrap_or(0) as u64)?;
            *self
                .bytes
                .get_mut(nulls + cell)
                .ok_or_else(|| ErrorKind::CorruptChunk("Destination is truncated".to_string()))? =
                datum.is_none() as u8;
        }

        self.header.nitems += 1;
        Ok(true)
    }

    pub fn finish(self) -> Result<()> {
        self.header.write(self.bytes)
    }
}

/// Reads row `index` of a slot store image.
pub(crate) fn slot_row(bytes: &[u8], header: &ChunkHeader, index: usize) -> Result<Row> {
    let ncols = header.ncols as usize;
    let nrooms = header.nrooms as usize;
    let nulls = nulls_offset(ncols, nrooms);

    (0..ncols)
        .map(|column| -> Result<Datum> {
            let cell = column * nrooms + index;
            let is_null = *bytes
                .get(nulls + cell)
                .ok_or_else(|| ErrorKind::CorruptChunk("Slot store is truncated".to_string()))?;
            if is_null != 0 {
                Ok(None)
            } else {
                Ok(Some(read_u64(bytes, HEADER_LEN + 8 * cell)? as i64))
            }
        })
        .collect()
}
