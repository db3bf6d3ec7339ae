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

//! Hash store: header | `u32` slot heads \[nslots\] | hash items.
//!
//! A hash item is `hash: u32, next: u32, rowid: u32, pad: u32` followed by
//! the tuple image. `next` and the slot heads hold the byte offset of an
//! item within the chunk; zero terminates a chain.

use super::header::{align8, read_u32, write_u32, ChunkFormat, ChunkHeader, HashRange, HEADER_LEN};
use super::DataChunk;
use crate::error::{ErrorKind, Result};
use crate::tuple::{decode_tuple, encode_tuple, to_u32, tuple_len, Datum, Row};

const ITEM_HEADER_LEN: usize = 16;

/// Slot count of a hash store without items.
pub const EMPTY_HASH_NSLOTS: usize = 4;

/// Lower bound of the slot count of a non-empty hash store.
pub const MIN_HASH_NSLOTS: usize = 128;

pub fn hash_item_len(ncols: usize) -> usize {
    ITEM_HEADER_LEN + tuple_len(ncols)
}

/// Byte length of a hash store.
pub fn hash_store_len(ncols: usize, nitems: usize, nslots: usize) -> usize {
    items_offset(nslots) + nitems * hash_item_len(ncols)
}

/// Slot count for `nitems` items with a safety `margin`.
pub fn hash_nslots(nitems: usize, margin: f64) -> usize {
    if nitems == 0 {
        EMPTY_HASH_NSLOTS
    } else {
        std::cmp::max((nitems as f64 * margin).ceil() as usize, MIN_HASH_NSLOTS)
    }
}

pub(crate) fn items_offset(nslots: usize) -> usize {
    HEADER_LEN + align8(4 * nslots)
}

/// Accumulates hashed rows into a sealed hash store.
#[derive(Debug)]
pub struct HashStoreBuilder {
    ncols: usize,
    hashes: Vec<u32>,
    tuples: Vec<u8>,
}

impl HashStoreBuilder {
    pub fn new(ncols: usize) -> Self {
        Self::with_capacity(ncols, 0)
    }

    pub fn with_capacity(ncols: usize, rows: usize) -> Self {
        Self {
            ncols,
            hashes: Vec::with_capacity(rows),
            tuples: Vec::with_capacity(rows * tuple_len(ncols)),
        }
    }

    pub fn nitems(&self) -> usize {
        self.hashes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.hashes.is_empty()
    }

    /// Bytes of the sealed image after `rows` more rows.
    pub fn usage_with(&self, rows: usize, margin: f64) -> usize {
        let nitems = self.nitems() + rows;
        hash_store_len(self.ncols, nitems, hash_nslots(nitems, margin))
    }

    pub fn usage(&self, margin: f64) -> usize {
        self.usage_with(0, margin)
    }

    pub fn push(&mut self, hash: u32, row: &[Datum]) -> Result<()> {
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
        self.hashes.push(hash);

        Ok(())
    }

    /// Returns the buffered rows with their hashes, in insertion order.
    pub fn into_rows(self) -> Result<Vec<(u32, Row)>> {
        let len = tuple_len(self.ncols);
        self.hashes
            .iter()
            .enumerate()
            .map(|(i, &hash)| {
                decode_tuple(&self.tuples[i * len..(i + 1) * len], self.ncols).map(|row| (hash, row))
            })
            .collect()
    }

    /// Seals the store with `nslots` buckets, covering `range`.
    ///
    /// Every pushed hash must lie within `range`.
    pub fn seal(self, nslots: usize, range: HashRange) -> Result<DataChunk> {
        let nitems = self.nitems();
        let nslots = if nitems == 0 {
            EMPTY_HASH_NSLOTS
        } else {
            std::cmp::max(nslots, 1)
        };
        if let Some(hash) = self.hashes.iter().find(|&&h| !range.contains(h)) {
            Err(ErrorKind::LogicError(format!(
                "Hash {:#x} is outside of the chunk range {:?}",
                hash, range
            )))?;
        }

        let len = tuple_len(self.ncols);
        let item_len = hash_item_len(self.ncols);
        let base = items_offset(nslots);
        let length = hash_store_len(self.ncols, nitems, nslots);

        let mut image = vec![0; length];
        let mut header = ChunkHeader::new(ChunkFormat::Hash, to_u32(self.ncols, "Column count")?);
        header.nitems = to_u32(nitems, "Row count")?;
        header.nrooms = header.nitems;
        header.nslots = to_u32(nslots, "Slot count")?;
        header.hash_range = range;
        header.length = length as u64;
        header.usage = length as u64;
        header.write(&mut image)?;

        for (rowid, &hash) in self.hashes.iter().enumerate() {
            let offset = base + rowid * item_len;
            let slot_offset = HEADER_LEN + 4 * (hash as usize % nslots);
            let next = read_u32(&image, slot_offset)?;

            write_u32(&mut image, offset, hash)?;
            write_u32(&mut image, offset + 4, next)?;
            write_u32(&mut image, offset + 8, to_u32(rowid, "Row id")?)?;
            image[offset + ITEM_HEADER_LEN..offset + item_len]
                .copy_from_slice(&self.tuples[rowid * len..(rowid + 1) * len]);
            write_u32(&mut image, slot_offset, to_u32(offset, "Item offset")?)?;
        }

        DataChunk::from_image(image)
    }
}

/// An item of a hash store.
#[derive(Clone, Copy, Debug)]
pub struct HashItem<'a> {
    pub hash: u32,
    pub rowid: u32,
    pub tuple: &'a [u8],
    next: u32,
}

/// Walks the chain of one hash slot.
///
/// Chains link items in descending offset order.
#[derive(Debug)]
pub struct HashChain<'a> {
    bytes: &'a [u8],
    ncols: usize,
    next: u32,
}

impl<'a> HashChain<'a> {
    pub(crate) fn new(bytes: &'a [u8], ncols: usize, head: u32) -> Self {
        Self {
            bytes,
            ncols,
            next: head,
        }
    }
}

impl<'a> Iterator for HashChain<'a> {
    type Item = Result<HashItem<'a>>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.next == 0 {
            return None;
        }

        let item = hash_item_at(self.bytes, self.ncols, self.next as usize);
        match item {
            Ok(ref item) if item.next >= self.next => {
                self.next = 0;
                Some(Err(ErrorKind::CorruptChunk(
                    "Hash chain does not advance".to_string(),
                )
                .into()))
            }
            Ok(item) => {
                self.next = item.next;
                Some(Ok(item))
            }
            Err(e) => {
                self.next = 0;
                Some(Err(e))
            }
        }
    }
}

pub(crate) fn hash_item_at(bytes: &[u8], ncols: usize, offset: usize) -> Result<HashItem<'_>> {
    let item_len = hash_item_len(ncols);
    let tuple = bytes
        .get(offset + ITEM_HEADER_LEN..offset + item_len)
        .ok_or_else(|| ErrorKind::CorruptChunk(format!("Hash item at {} is truncated", offset)))?;

    Ok(HashItem {
        hash: read_u32(bytes, offset)?,
        next: read_u32(bytes, offset + 4)?,
        rowid: read_u32(bytes, offset + 8)?,
        tuple,
    })
}
