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

//! Row store: header | `u32` item offsets \[nrooms\] | tuple images.

use super::header::{align8, write_u32, ChunkFormat, ChunkHeader, HEADER_LEN};
use super::DataChunk;
use crate::error::{ErrorKind, Result};
use crate::tuple::{encode_tuple, to_u32, tuple_len, Datum};

/// Byte length of a row store with room for `nrooms` tuples.
pub fn row_store_len(ncols: usize, nrooms: usize) -> usize {
    tuples_offset(nrooms) + nrooms * tuple_len(ncols)
}

pub(crate) fn tuples_offset(nrooms: usize) -> usize {
    HEADER_LEN + align8(4 * nrooms)
}

/// Accumulates rows into a sealed row store.
///
/// The tuple buffer doubles its capacity whenever it runs full.
#[derive(Debug)]
pub struct RowStoreBuilder {
    ncols: usize,
    tuples: Vec<u8>,
    nitems: usize,
}

impl RowStoreBuilder {
    pub fn new(ncols: usize) -> Self {
        Self::with_capacity(ncols, 0)
    }

    pub fn with_capacity(ncols: usize, rows: usize) -> Self {
        Self {
            ncols,
            tuples: Vec::with_capacity(rows * tuple_len(ncols)),
            nitems: 0,
        }
    }

    pub fn ncols(&self) -> usize {
        self.ncols
    }

    pub fn nitems(&self) -> usize {
        self.nitems
    }

    pub fn is_empty(&self) -> bool {
        self.nitems == 0
    }

    /// Bytes of the sealed image.
    pub fn usage(&self) -> usize {
        row_store_len(self.ncols, self.nitems)
    }

    /// Bytes of the sealed image after `rows` more rows.
    pub fn usage_with(&self, rows: usize) -> usize {
        row_store_len(self.ncols, self.nitems + rows)
    }

    pub fn push(&mut self, row: &[Datum]) -> Result<()> {
        if row.len() != self.ncols {
            Err(ErrorKind::InvalidArgument(format!(
                "Row has {} columns, expected {}",
                row.len(),
                self.ncols
            )))?;
        }

        let len = tuple_len(self.ncols);
        let start = self.tuples.len();
        if start + len > self.tuples.capacity() {
            let additional = std::cmp::max(self.tuples.capacity(), len);
            self.tuples.reserve_exact(additional);
        }
        self.tuples.resize(start + len, 0);
        encode_tuple(row, &mut self.tuples[start..])?;
        self.nitems += 1;

        Ok(())
    }

    pub fn seal(self) -> Result<DataChunk> {
        let len = tuple_len(self.ncols);
        let length = self.usage();
        let base = tuples_offset(self.nitems);

        let mut image = vec![0; length];
        let mut header = ChunkHeader::new(ChunkFormat::Row, to_u32(self.ncols, "Column count")?);
        header.nitems = to_u32(self.nitems, "Row count")?;
        header.nrooms = header.nitems;
        header.length = length as u64;
        header.usage = length as u64;
        header.write(&mut image)?;

        for i in 0..self.nitems {
            let offset = base + i * len;
            write_u32(&mut image, HEADER_LEN + 4 * i, to_u32(offset, "Tuple offset")?)?;
        }
        image[base..].copy_from_slice(&self.tuples);

        DataChunk::from_image(image)
    }
}

/// Returns the header of an empty row store destination with `nrooms` rooms.
///
/// Only the header is uploaded; the kernels fill in the rest.
pub fn row_destination(ncols: usize, nrooms: usize) -> Result<ChunkHeader> {
    let mut header = ChunkHeader::new(ChunkFormat::Row, to_u32(ncols, "Column count")?);
    header.nrooms = to_u32(nrooms, "Destination rooms")?;
    header.length = row_store_len(ncols, nrooms) as u64;
    header.usage = tuples_offset(nrooms) as u64;
    Ok(header)
}

/// Appends tuples to a row store destination in device memory.
#[derive(Debug)]
pub struct RowWriter<'a> {
    bytes: &'a mut [u8],
    header: ChunkHeader,
}

impl<'a> RowWriter<'a> {
    pub fn open(bytes: &'a mut [u8]) -> Result<Self> {
        let header = ChunkHeader::read(bytes)?;
        if header.format != ChunkFormat::Row {
            Err(ErrorKind::CorruptChunk(format!(
                "Expected a row store destination, got {:?}",
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

        let index = self.header.nitems as usize;
        let len = tuple_len(self.ncols());
        let offset = tuples_offset(self.header.nrooms as usize) + index * len;
        let tuple = self
            .bytes
            .get_mut(offset..offset + len)
            .ok_or_else(|| ErrorKind::CorruptChunk("Destination is truncated".to_string()))?;
        encode_tuple(row, tuple)?;
        write_u32(self.bytes, HEADER_LEN + 4 * index, to_u32(offset, "Tuple offset")?)?;

        self.header.nitems += 1;
        self.header.usage = (offset + len) as u64;
        Ok(true)
    }

    pub fn finish(self) -> Result<()> {
        self.header.write(self.bytes)
    }
}
