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

use crate::error::{ErrorKind, Result};
use std::convert::TryInto;

/// Byte length of the header common to all chunk images.
pub const HEADER_LEN: usize = 48;

/// Identifies a chunk image ("GJCK").
pub const CHUNK_MAGIC: u32 = 0x4b43_4a47;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ChunkFormat {
    Row,
    Hash,
    Slot,
}

impl ChunkFormat {
    fn code(self) -> u32 {
        match self {
            ChunkFormat::Row => 1,
            ChunkFormat::Hash => 2,
            ChunkFormat::Slot => 3,
        }
    }

    fn from_code(code: u32) -> Result<Self> {
        match code {
            1 => Ok(ChunkFormat::Row),
            2 => Ok(ChunkFormat::Hash),
            3 => Ok(ChunkFormat::Slot),
            _ => Err(ErrorKind::CorruptChunk(format!("Unknown chunk format {}", code)).into()),
        }
    }
}

/// An inclusive range of 32-bit hash values.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct HashRange {
    pub min: u32,
    pub max: u32,
}

impl HashRange {
    pub const FULL: HashRange = HashRange {
        min: 0,
        max: u32::MAX,
    };

    pub fn new(min: u32, max: u32) -> Self {
        Self { min, max }
    }

    pub fn contains(&self, hash: u32) -> bool {
        self.min <= hash && hash <= self.max
    }
}

/// The common chunk header.
///
/// Layout (little endian): magic, format, ncols, nitems, nrooms, nslots,
/// hash_min, hash_max as `u32`, followed by length and usage as `u64`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ChunkHeader {
    pub format: ChunkFormat,
    pub ncols: u32,
    pub nitems: u32,
    pub nrooms: u32,
    pub nslots: u32,
    pub hash_range: HashRange,

    /// Total bytes of the image.
    pub length: u64,

    /// Bytes in use.
    pub usage: u64,
}

impl ChunkHeader {
    pub fn new(format: ChunkFormat, ncols: u32) -> Self {
        Self {
            format,
            ncols,
            nitems: 0,
            nrooms: 0,
            nslots: 0,
            hash_range: HashRange::FULL,
            length: HEADER_LEN as u64,
            usage: HEADER_LEN as u64,
        }
    }

    pub fn read(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < HEADER_LEN {
            Err(ErrorKind::CorruptChunk(format!(
                "Chunk of {} bytes is shorter than its header",
                bytes.len()
            )))?;
        }
        if read_u32(bytes, 0)? != CHUNK_MAGIC {
            Err(ErrorKind::CorruptChunk("Bad chunk magic".to_string()))?;
        }

        let header = Self {
            format: ChunkFormat::from_code(read_u32(bytes, 4)?)?,
            ncols: read_u32(bytes, 8)?,
            nitems: read_u32(bytes, 12)?,
            nrooms: read_u32(bytes, 16)?,
            nslots: read_u32(bytes, 20)?,
            hash_range: HashRange::new(read_u32(bytes, 24)?, read_u32(bytes, 28)?),
            length: read_u64(bytes, 32)?,
            usage: read_u64(bytes, 40)?,
        };

        if header.length as usize > bytes.len() {
            Err(ErrorKind::CorruptChunk(format!(
                "Chunk header claims {} bytes, but only {} are present",
                header.length,
                bytes.len()
            )))?;
        }

        Ok(header)
    }

    pub fn write(&self, out: &mut [u8]) -> Result<()> {
        write_u32(out, 0, CHUNK_MAGIC)?;
        write_u32(out, 4, self.format.code())?;
        write_u32(out, 8, self.ncols)?;
        write_u32(out, 12, self.nitems)?;
        write_u32(out, 16, self.nrooms)?;
        write_u32(out, 20, self.nslots)?;
        write_u32(out, 24, self.hash_range.min)?;
        write_u32(out, 28, self.hash_range.max)?;
        write_u64(out, 32, self.length)?;
        write_u64(out, 40, self.usage)?;
        Ok(())
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        let mut out = vec![0; HEADER_LEN];
        self.write(&mut out)?;
        Ok(out)
    }
}

pub(crate) const fn align8(len: usize) -> usize {
    (len + 7) & !7
}

pub(crate) fn read_u32(bytes: &[u8], offset: usize) -> Result<u32> {
    bytes
        .get(offset..offset + 4)
        .and_then(|b| b.try_into().ok())
        .map(u32::from_le_bytes)
        .ok_or_else(|| out_of_bounds(offset, bytes.len()))
}

pub(crate) fn read_u64(bytes: &[u8], offset: usize) -> Result<u64> {
    bytes
        .get(offset..offset + 8)
        .and_then(|b| b.try_into().ok())
        .map(u64::from_le_bytes)
        .ok_or_else(|| out_of_bounds(offset, bytes.len()))
}

pub(crate) fn write_u32(bytes: &mut [u8], offset: usize, value: u32) -> Result<()> {
    let len = bytes.len();
    bytes
        .get_mut(offset..offset + 4)
        .ok_or_else(|| out_of_bounds(offset, len))?
        .copy_from_slice(&value.to_le_bytes());
    Ok(())
}

pub(crate) fn write_u64(bytes: &mut [u8], offset: usize, value: u64) -> Result<()> {
    let len = bytes.len();
    bytes
        .get_mut(offset..offset + 8)
        .ok_or_else(|| out_of_bounds(offset, len))?
        .copy_from_slice(&value.to_le_bytes());
    Ok(())
}

fn out_of_bounds(offset: usize, len: usize) -> crate::error::Error {
    ErrorKind::CorruptChunk(format!(
        "Access at offset {} is outside of {} bytes",
        offset, len
    ))
    .into()
}
