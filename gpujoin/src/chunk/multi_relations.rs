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

//! The image of an inner relation set, as shared with the kernels.
//!
//! Layout: header (magic, nrels, ndevs, pad as `u32`; length, ojmap_length
//! as `u64`) | one descriptor per depth | chunk images, each aligned to 8
//! bytes.
//!
//! A descriptor holds the chunk offset, the outer join map offset and the
//! map bytes per device slot as `u64`, followed by join type, join method,
//! row count and pad as `u32`.
//!
//! The outer join map is a separate per-device allocation of
//! `ojmap_length` bytes. For each depth that emits unmatched inner rows, it
//! holds `ndevs` bitmaps of `ojmap_slot_len` bytes, one per device.

use super::header::{align8, read_u32, read_u64, write_u32, write_u64, ChunkFormat};
use super::{ChunkView, DataChunk};
use crate::error::{ErrorKind, Result};
use crate::plan::{JoinMethod, JoinPlan, JoinType};
use crate::tuple::to_u32;
use gpu_runtime::runtime::HostBytes;
use std::ops::Range;
use std::sync::Arc;

const KMRELS_MAGIC: u32 = 0x534c_524d;
const KMRELS_HEADER_LEN: usize = 32;
const DESCRIPTOR_LEN: usize = 40;

/// Placement of one depth within the image and the outer join map.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DepthLayout {
    pub chunk_offset: usize,
    pub ojmap_offset: usize,
    pub ojmap_slot_len: usize,
    pub join_type: JoinType,
    pub method: JoinMethod,
    pub nitems: usize,
}

impl DepthLayout {
    /// Byte range of `device`'s bitmap in the outer join map.
    pub fn ojmap_slot(&self, device: usize) -> Range<usize> {
        let start = self.ojmap_offset + device * self.ojmap_slot_len;
        start..start + self.ojmap_slot_len
    }
}

/// Bytes of one device's match bitmap for `nitems` inner rows.
pub fn ojmap_slot_len(nitems: usize) -> usize {
    align8((nitems + 7) / 8)
}

pub fn test_bit(bits: &[u8], index: usize) -> bool {
    bits.get(index / 8)
        .map_or(false, |byte| byte & (1 << (index % 8)) != 0)
}

pub fn set_bit(bits: &mut [u8], index: usize) -> Result<()> {
    let byte = bits.get_mut(index / 8).ok_or_else(|| {
        ErrorKind::CorruptChunk(format!("Outer join map has no bit {}", index))
    })?;
    *byte |= 1 << (index % 8);
    Ok(())
}

/// A sealed multi-relation image with one chunk per depth.
#[derive(Clone, Debug)]
pub struct MultiRelations {
    image: HostBytes,
    ojmap_len: usize,
    layout: Vec<DepthLayout>,
}

impl MultiRelations {
    /// Combines one chunk per depth into an image for `ndevs` devices.
    pub fn build(plan: &JoinPlan, chunks: &[DataChunk], ndevs: usize) -> Result<Self> {
        if chunks.len() != plan.num_rels() {
            Err(ErrorKind::InvalidArgument(format!(
                "Expected {} chunks, got {}",
                plan.num_rels(),
                chunks.len()
            )))?;
        }

        let mut offset = align8(KMRELS_HEADER_LEN + DESCRIPTOR_LEN * chunks.len());
        let mut ojmap_len = 0;
        let mut layout = Vec::with_capacity(chunks.len());

        for (depth_plan, chunk) in plan.depths.iter().zip(chunks.iter()) {
            let expected = match depth_plan.method {
                JoinMethod::NestLoop => ChunkFormat::Row,
                JoinMethod::Hash => ChunkFormat::Hash,
            };
            if chunk.format() != expected || chunk.ncols() != depth_plan.inner_ncols {
                Err(ErrorKind::LogicError(format!(
                    "Chunk {:?} with {} columns does not fit {:?} join with {} columns",
                    chunk.format(),
                    chunk.ncols(),
                    depth_plan.method,
                    depth_plan.inner_ncols
                )))?;
            }

            let slot_len = if depth_plan.join_type.fills_inner() {
                ojmap_slot_len(chunk.nitems())
            } else {
                0
            };
            layout.push(DepthLayout {
                chunk_offset: offset,
                ojmap_offset: ojmap_len,
                ojmap_slot_len: slot_len,
                join_type: depth_plan.join_type,
                method: depth_plan.method,
                nitems: chunk.nitems(),
            });

            offset += align8(chunk.len());
            ojmap_len += slot_len * ndevs;
        }

        let mut image = vec![0; offset];
        write_u32(&mut image, 0, KMRELS_MAGIC)?;
        write_u32(&mut image, 4, to_u32(chunks.len(), "Relation count")?)?;
        write_u32(&mut image, 8, to_u32(ndevs, "Device count")?)?;
        write_u64(&mut image, 16, offset as u64)?;
        write_u64(&mut image, 24, ojmap_len as u64)?;

        for (i, (entry, chunk)) in layout.iter().zip(chunks.iter()).enumerate() {
            let desc = KMRELS_HEADER_LEN + i * DESCRIPTOR_LEN;
            write_u64(&mut image, desc, entry.chunk_offset as u64)?;
            write_u64(&mut image, desc + 8, entry.ojmap_offset as u64)?;
            write_u64(&mut image, desc + 16, entry.ojmap_slot_len as u64)?;
            write_u32(&mut image, desc + 24, entry.join_type.code())?;
            write_u32(&mut image, desc + 28, entry.method.code())?;
            write_u32(&mut image, desc + 32, to_u32(entry.nitems, "Row count")?)?;

            image[entry.chunk_offset..entry.chunk_offset + chunk.len()]
                .copy_from_slice(chunk.image());
        }

        Ok(Self {
            image: Arc::from(image),
            ojmap_len,
            layout,
        })
    }

    pub fn image(&self) -> &HostBytes {
        &self.image
    }

    pub fn len(&self) -> usize {
        self.image.len()
    }

    pub fn is_empty(&self) -> bool {
        self.image.is_empty()
    }

    /// Bytes of the per-device outer join map. Zero if no depth needs one.
    pub fn ojmap_len(&self) -> usize {
        self.ojmap_len
    }

    /// Returns the layout of `depth`, counting from 1.
    pub fn layout(&self, depth: usize) -> Result<&DepthLayout> {
        layout_of(&self.layout, depth)
    }
}

/// A parsed multi-relation image in device memory.
#[derive(Debug)]
pub struct MultiRelationsView<'a> {
    bytes: &'a [u8],
    ndevs: usize,
    layout: Vec<DepthLayout>,
}

impl<'a> MultiRelationsView<'a> {
    pub fn parse(bytes: &'a [u8]) -> Result<Self> {
        if read_u32(bytes, 0)? != KMRELS_MAGIC {
            Err(ErrorKind::CorruptChunk(
                "Bad inner relation set magic".to_string(),
            ))?;
        }
        let nrels = read_u32(bytes, 4)? as usize;
        let ndevs = read_u32(bytes, 8)? as usize;
        if read_u64(bytes, 16)? as usize > bytes.len() {
            Err(ErrorKind::CorruptChunk(
                "Inner relation set is truncated".to_string(),
            ))?;
        }

        let layout = (0..nrels)
            .map(|i| -> Result<DepthLayout> {
                let desc = KMRELS_HEADER_LEN + i * DESCRIPTOR_LEN;
                Ok(DepthLayout {
                    chunk_offset: read_u64(bytes, desc)? as usize,
                    ojmap_offset: read_u64(bytes, desc + 8)? as usize,
                    ojmap_slot_len: read_u64(bytes, desc + 16)? as usize,
                    join_type: JoinType::from_code(read_u32(bytes, desc + 24)?)?,
                    method: JoinMethod::from_code(read_u32(bytes, desc + 28)?)?,
                    nitems: read_u32(bytes, desc + 32)? as usize,
                })
            })
            .collect::<Result<Vec<_>>>()?;

        Ok(Self {
            bytes,
            ndevs,
            layout,
        })
    }

    pub fn nrels(&self) -> usize {
        self.layout.len()
    }

    pub fn ndevs(&self) -> usize {
        self.ndevs
    }

    pub fn layout(&self, depth: usize) -> Result<&DepthLayout> {
        layout_of(&self.layout, depth)
    }

    pub fn chunk(&self, depth: usize) -> Result<ChunkView<'a>> {
        let offset = self.layout(depth)?.chunk_offset;
        let bytes = self.bytes.get(offset..).ok_or_else(|| {
            ErrorKind::CorruptChunk(format!("Chunk of depth {} is out of bounds", depth))
        })?;
        ChunkView::new(bytes)
    }
}

fn layout_of(layout: &[DepthLayout], depth: usize) -> Result<&DepthLayout> {
    depth
        .checked_sub(1)
        .and_then(|i| layout.get(i))
        .ok_or_else(|| ErrorKind::InvalidArgument(format!("No such depth: {}", depth)).into())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chunk::{HashRange, HashStoreBuilder, RowStoreBuilder};
    use crate::plan::{ColumnRef, DepthPlan};

    #[test]
    fn image_exposes_each_depth() -> Result<()> {
        let plan = JoinPlan::new(
            1,
            vec![
                DepthPlan::nest_loop(JoinType::Inner, 1, vec![], vec![]),
                DepthPlan::hash(JoinType::Full, 2, vec![ColumnRef::new(0, 0)], vec![0]),
            ],
            vec![ColumnRef::new(0, 0)],
        );

        let mut rows = RowStoreBuilder::new(1);
        rows.push(&[Some(1)])?;
        let mut hashed = HashStoreBuilder::new(2);
        for i in 0..20 {
            hashed.push(i, &[Some(i as i64), None])?;
        }
        let chunks = vec![rows.seal()?, hashed.seal(128, HashRange::FULL)?];

        let kmrels = MultiRelations::build(&plan, &chunks, 3)?;
        assert_eq!(kmrels.ojmap_len(), 3 * 8);
        assert_eq!(kmrels.layout(1)?.ojmap_slot_len, 0);
        assert_eq!(kmrels.layout(2)?.ojmap_slot(2), 16..24);

        let view = MultiRelationsView::parse(kmrels.image())?;
        assert_eq!(view.nrels(), 2);
        assert_eq!(view.ndevs(), 3);
        assert_eq!(view.chunk(2)?.nitems(), 20);
        assert_eq!(view.chunk(1)?.row(0)?, vec![Some(1)]);
        Ok(())
    }

    #[test]
    fn bits_are_addressed_per_row() -> Result<()> {
        let mut bits = vec![0; ojmap_slot_len(10)];
        set_bit(&mut bits, 9)?;
        assert!(test_bit(&bits, 9));
        assert!(!test_bit(&bits, 8));
        assert!(set_bit(&mut bits, 64).is_err());
        Ok(())
    }
}
