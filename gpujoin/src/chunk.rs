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

//! Chunk images shared by host and devices.
//!
//! Every image starts with a [`ChunkHeader`]. Images are built on the host by
//! the builders, sealed into an immutable [`DataChunk`], and decoded with a
//! [`ChunkView`]. Kernels write destinations in place with the writers.

mod hash_store;
mod header;
mod multi_relations;
mod row_store;
mod slot_store;

pub use self::hash_store::{
    hash_item_len, hash_nslots, hash_store_len, HashChain, HashItem, HashStoreBuilder,
    EMPTY_HASH_NSLOTS, MIN_HASH_NSLOTS,
};
pub use self::header::{ChunkFormat, ChunkHeader, HashRange, CHUNK_MAGIC, HEADER_LEN};
pub use self::multi_relations::{
    ojmap_slot_len, set_bit, test_bit, DepthLayout, MultiRelations, MultiRelationsView,
};
pub use self::row_store::{row_destination, row_store_len, RowStoreBuilder, RowWriter};
pub use self::slot_store::{slot_destination, slot_store_len, SlotWriter};

use self::header::read_u32;
use crate::error::{ErrorKind, Result};
use crate::tuple::{decode_tuple, tuple_len, Row};
use gpu_runtime::runtime::HostBytes;
use std::sync::Arc;

/// A sealed, immutable chunk image.
///
/// Cloning is cheap; all clones share the image.
#[derive(Clone, Debug)]
pub struct DataChunk {
    image: HostBytes,
    header: ChunkHeader,
}

impl DataChunk {
    /// Validates and seals an image. Bytes past the header's length are
    /// dropped.
    pub fn from_image(mut image: Vec<u8>) -> Result<Self> {
        let header = ChunkView::new(&image)?.header;
        image.truncate(header.length as usize);

        Ok(Self {
            image: Arc::from(image),
            header,
        })
    }

    pub fn image(&self) -> &HostBytes {
        &self.image
    }

    pub fn header(&self) -> &ChunkHeader {
        &self.header
    }

    pub fn format(&self) -> ChunkFormat {
        self.header.format
    }

    pub fn ncols(&self) -> usize {
        self.header.ncols as usize
    }

    pub fn nitems(&self) -> usize {
        self.header.nitems as usize
    }

    pub fn hash_range(&self) -> HashRange {
        self.header.hash_range
    }

    /// Bytes of the image.
    pub fn len(&self) -> usize {
        self.image.len()
    }

    pub fn is_empty(&self) -> bool {
        self.image.is_empty()
    }

    pub fn view(&self) -> Result<ChunkView<'_>> {
        ChunkView::new(&self.image)
    }
}

/// Decodes a chunk image in place.
#[derive(Clone, Copy, Debug)]
pub struct ChunkView<'a> {
    bytes: &'a [u8],
    header: ChunkHeader,
}

impl<'a> ChunkView<'a> {
    pub fn new(bytes: &'a [u8]) -> Result<Self> {
        let header = ChunkHeader::read(bytes)?;
        let ncols = header.ncols as usize;

        let (needed, rooms_ok) = match header.format {
            ChunkFormat::Row => (
                row_store_len(ncols, header.nrooms as usize),
                header.nitems <= header.nrooms,
            ),
            ChunkFormat::Hash => (
                hash_store_len(ncols, header.nitems as usize, header.nslots as usize),
                header.nslots > 0,
            ),
            ChunkFormat::Slot => (
                slot_store_len(ncols, header.nrooms as usize),
                header.nitems <= header.nrooms,
            ),
        };
        if !rooms_ok || needed as u64 > header.length {
            Err(ErrorKind::CorruptChunk(format!(
                "{:?} chunk with {} items does not fit into {} bytes",
                header.format, header.nitems, header.length
            )))?;
        }

        Ok(Self {
            bytes: &bytes[..header.length as usize],
            header,
        })
    }

    pub fn header(&self) -> &ChunkHeader {
        &self.header
    }

    pub fn format(&self) -> ChunkFormat {
        self.header.format
    }

    pub fn ncols(&self) -> usize {
        self.header.ncols as usize
    }

    pub fn nitems(&self) -> usize {
        self.header.nitems as usize
    }

    pub fn hash_range(&self) -> HashRange {
        self.header.hash_range
    }

    /// Returns the tuple image of row `rowid` of a row or hash store.
    pub fn tuple(&self, rowid: usize) -> Result<&'a [u8]> {
        if rowid >= self.nitems() {
            Err(ErrorKind::CorruptChunk(format!(
                "Row {} is out of bounds of {} rows",
                rowid,
                self.nitems()
            )))?;
        }

        let ncols = self.ncols();
        match self.format() {
            ChunkFormat::Row => {
                let offset = read_u32(self.bytes, HEADER_LEN + 4 * rowid)? as usize;
                self.bytes
                    .get(offset..offset + tuple_len(ncols))
                    .ok_or_else(|| {
                        ErrorKind::CorruptChunk(format!("Tuple {} is truncated", rowid)).into()
                    })
            }
            ChunkFormat::Hash => {
                let offset = hash_store::items_offset(self.header.nslots as usize)
                    + rowid * hash_item_len(ncols);
                Ok(hash_store::hash_item_at(self.bytes, ncols, offset)?.tuple)
            }
            ChunkFormat::Slot => Err(ErrorKind::InvalidArgument(
                "Slot stores have no tuple images".to_string(),
            )
            .into()),
        }
    }

    /// Returns the chain of hash items in the slot of `hash`.
    pub fn hash_chain(&self, hash: u32) -> Result<HashChain<'a>> {
        if self.format() != ChunkFormat::Hash {
            Err(ErrorKind::InvalidArgument(format!(
                "{:?} chunk has no hash slots",
                self.format()
            )))?;
        }

        let nslots = self.header.nslots as usize;
        let head = read_u32(self.bytes, HEADER_LEN + 4 * (hash as usize % nslots))?;
        Ok(HashChain::new(self.bytes, self.ncols(), head))
    }

    /// Decodes row `index`.
    pub fn row(&self, index: usize) -> Result<Row> {
        match self.format() {
            ChunkFormat::Slot => {
                if index >= self.nitems() {
                    Err(ErrorKind::InvalidArgument(format!(
                        "Row {} is out of bounds of {} rows",
                        index,
                        self.nitems()
                    )))?;
                }
                slot_store::slot_row(self.bytes, &self.header, index)
            }
            _ => decode_tuple(self.tuple(index)?, self.ncols()),
        }
    }

    pub fn rows(&self) -> Result<Vec<Row>> {
        (0..self.nitems()).map(|i| self.row(i)).collect()
    }
}

/// A chunk of join results, in row or slot format.
///
/// A slot-format result without columns carries only its row count.
#[derive(Clone, Debug)]
pub struct ResultChunk {
    chunk: DataChunk,
}

impl ResultChunk {
    pub(crate) fn new(chunk: DataChunk) -> Result<Self> {
        match chunk.format() {
            ChunkFormat::Row | ChunkFormat::Slot => Ok(Self { chunk }),
            ChunkFormat::Hash => Err(ErrorKind::LogicError(
                "A hash store cannot be a join result".to_string(),
            )
            .into()),
        }
    }

    pub fn format(&self) -> ChunkFormat {
        self.chunk.format()
    }

    pub fn ncols(&self) -> usize {
        self.chunk.ncols()
    }

    pub fn nitems(&self) -> usize {
        self.chunk.nitems()
    }

    pub fn is_empty(&self) -> bool {
        self.chunk.nitems() == 0
    }

    /// Bytes of the chunk image.
    pub fn len(&self) -> usize {
        self.chunk.len()
    }

    pub fn row(&self, index: usize) -> Result<Row> {
        self.chunk.view()?.row(index)
    }

    pub fn rows(&self) -> Result<Vec<Row>> {
        self.chunk.view()?.rows()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tuple::hash_key;

    #[test]
    fn row_store_keeps_rows_in_order() -> Result<()> {
        let mut builder = RowStoreBuilder::new(2);
        for i in 0..100 {
            builder.push(&[Some(i), if i % 3 == 0 { None } else { Some(-i) }])?;
        }
        let expected_len = builder.usage();
        let chunk = builder.seal()?;

        assert_eq!(chunk.len(), expected_len);
        assert_eq!(chunk.nitems(), 100);
        assert_eq!(chunk.view()?.row(3)?, vec![Some(3), None]);
        assert_eq!(chunk.view()?.row(4)?, vec![Some(4), Some(-4)]);
        Ok(())
    }

    #[test]
    fn hash_chain_finds_every_item_of_a_key() -> Result<()> {
        let mut builder = HashStoreBuilder::new(1);
        for i in 0..500 {
            let key = Some(i % 50);
            builder.push(hash_key(vec![key]), &[key])?;
        }
        let nslots = hash_nslots(builder.nitems(), 1.25);
        let chunk = builder.seal(nslots, HashRange::FULL)?;
        let view = chunk.view()?;

        let hash = hash_key(vec![Some(7)]);
        let matches = view
            .hash_chain(hash)?
            .filter_map(|item| match item {
                Ok(item) if item.hash == hash => Some(Ok(item.rowid)),
                Ok(_) => None,
                Err(e) => Some(Err(e)),
            })
            .collect::<Result<Vec<_>>>()?;

        assert_eq!(matches.len(), 10);
        for rowid in matches {
            assert_eq!(view.row(rowid as usize)?, vec![Some(7)]);
        }
        Ok(())
    }

    #[test]
    fn empty_hash_store_has_four_slots() -> Result<()> {
        let chunk = HashStoreBuilder::new(3).seal(1000, HashRange::FULL)?;
        assert_eq!(chunk.header().nslots as usize, EMPTY_HASH_NSLOTS);
        assert_eq!(chunk.nitems(), 0);
        Ok(())
    }

    #[test]
    fn hash_outside_of_range_is_rejected() -> Result<()> {
        let mut builder = HashStoreBuilder::new(1);
        builder.push(10, &[Some(1)])?;
        assert!(builder.seal(128, HashRange::new(0, 5)).is_err());
        Ok(())
    }

    #[test]
    fn row_destination_stops_at_capacity() -> Result<()> {
        let header = row_destination(1, 2)?;
        let mut image = vec![0; header.length as usize];
        header.write(&mut image)?;

        let mut writer = RowWriter::open(&mut image)?;
        assert!(writer.push(&[Some(1)])?);
        assert!(writer.push(&[None])?);
        assert!(!writer.push(&[Some(3)])?);
        writer.finish()?;

        let result = ResultChunk::new(DataChunk::from_image(image)?)?;
        assert_eq!(result.rows()?, vec![vec![Some(1)], vec![None]]);
        Ok(())
    }

    #[test]
    fn slot_destination_is_column_major() -> Result<()> {
        let header = slot_destination(2, 3)?;
        let mut image = vec![0; header.length as usize];
        header.write(&mut image)?;

        let mut writer = SlotWriter::open(&mut image)?;
        writer.push(&[Some(1), None])?;
        writer.push(&[Some(2), Some(20)])?;
        writer.finish()?;

        let result = ResultChunk::new(DataChunk::from_image(image)?)?;
        assert_eq!(result.nitems(), 2);
        assert_eq!(result.row(1)?, vec![Some(2), Some(20)]);
        assert_eq!(result.row(0)?, vec![Some(1), None]);
        Ok(())
    }

    #[test]
    fn slot_destination_without_columns_only_counts() -> Result<()> {
        let header = slot_destination(0, 0)?;
        let mut image = header.to_bytes()?;

        let mut writer = SlotWriter::open(&mut image)?;
        for _ in 0..1000 {
            assert!(writer.push(&[])?);
        }
        writer.finish()?;

        let result = ResultChunk::new(DataChunk::from_image(image)?)?;
        assert_eq!(result.nitems(), 1000);
        Ok(())
    }
}
