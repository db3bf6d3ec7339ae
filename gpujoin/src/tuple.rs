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

//! Tuple images.
//!
//! A tuple is stored as an 8-byte null bitmap followed by one little-endian
//! `i64` per column. Bit `i` of the bitmap is set if column `i` is NULL.

use crate::error::{ErrorKind, Result};
use std::convert::TryInto;

/// A nullable column value.
pub type Datum = Option<i64>;

/// A row of nullable column values.
pub type Row = Vec<Datum>;

/// Maximum number of columns of a tuple.
pub const MAX_COLUMNS: usize = 64;

const NULL_BITMAP_LEN: usize = 8;
const DATUM_LEN: usize = 8;

/// Byte length of a tuple image with `ncols` columns.
pub const fn tuple_len(ncols: usize) -> usize {
    NULL_BITMAP_LEN + DATUM_LEN * ncols
}

/// Writes the tuple image of `row` into `out`.
///
/// `out` must be exactly `tuple_len(row.len())` bytes long.
pub fn encode_tuple(row: &[Datum], out: &mut [u8]) -> Result<()> {
    if row.len() > MAX_COLUMNS || out.len() != tuple_len(row.len()) {
        Err(ErrorKind::InvalidArgument(format!(
            "Cannot encode {} columns into {} bytes",
            row.len(),
            out.len()
        )))?;
    }

    let mut nulls = 0_u64;
    for (i, datum) in row.iter().enumerate() {
        let offset = NULL_BITMAP_LEN + i * DATUM_LEN;
        let value = match datum {
            Some(value) => *value,
            None => {
                nulls |= 1 << i;
                0
            }
        };
        out[offset..offset + DATUM_LEN].copy_from_slice(&value.to_le_bytes());
    }
    out[..NULL_BITMAP_LEN].copy_from_slice(&nulls.to_le_bytes());

    Ok(())
}

/// Returns the tuple image of `row` as a new vector.
pub fn to_tuple(row: &[Datum]) -> Result<Vec<u8>> {
    let mut out = vec![0; tuple_len(row.len())];
    encode_tuple(row, &mut out)?;
    Ok(out)
}

/// Reads column `column` of a tuple image.
pub fn datum(tuple: &[u8], column: usize) -> Result<Datum> {
    let offset = NULL_BITMAP_LEN + column * DATUM_LEN;
    if column >= MAX_COLUMNS || tuple.len() < offset + DATUM_LEN {
        Err(ErrorKind::CorruptChunk(format!(
            "Column {} is outside of a {} byte tuple",
            column,
            tuple.len()
        )))?;
    }

    let nulls = read_u64(tuple, 0);
    if nulls & (1 << column) != 0 {
        Ok(None)
    } else {
        Ok(Some(read_u64(tuple, offset) as i64))
    }
}

/// Decodes a whole tuple image with `ncols` columns.
pub fn decode_tuple(tuple: &[u8], ncols: usize) -> Result<Row> {
    (0..ncols).map(|column| datum(tuple, column)).collect()
}

/// Hashes a join key.
///
/// NULL values hash to a fixed marker, so that rows with NULL keys are still
/// routed to exactly one hash partition.
pub fn hash_key<I>(key: I) -> u32
where
    I: IntoIterator<Item = Datum>,
{
    let mut hasher = crc32fast::Hasher::new();
    for datum in key {
        match datum {
            Some(value) => {
                hasher.update(&[1]);
                hasher.update(&value.to_le_bytes());
            }
            None => hasher.update(&[0]),
        }
    }
    hasher.finalize()
}

/// Compares two join keys with SQL semantics: NULL never equals anything.
pub fn keys_match(left: &[Datum], right: &[Datum]) -> bool {
    left.len() == right.len()
        && left
            .iter()
            .zip(right.iter())
            .all(|(l, r)| matches!((l, r), (Some(a), Some(b)) if a == b))
}

fn read_u64(bytes: &[u8], offset: usize) -> u64 {
    let mut buf = [0; 8];
    buf.copy_from_slice(&bytes[offset..offset + 8]);
    u64::from_le_bytes(buf)
}

/// Converts a length into the `u32` used by chunk images.
pub(crate) fn to_u32(value: usize, what: &str) -> Result<u32> {
    value.try_into().map_err(|_| {
        ErrorKind::IntegerOverflow(format!("{} ({}) does not fit into u32", what, value)).into()
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tuple_keeps_nulls() -> Result<()> {
        let row = vec![Some(-7), None, Some(i64::MAX)];
        let image = to_tuple(&row)?;

        assert_eq!(image.len(), tuple_len(3));
        assert_eq!(decode_tuple(&image, 3)?, row);
        assert_eq!(datum(&image, 1)?, None);
        Ok(())
    }

    #[test]
    fn column_outside_of_tuple_is_corrupt() -> Result<()> {
        let image = to_tuple(&[Some(1)])?;
        assert!(datum(&image, 1).is_err());
        Ok(())
    }

    #[test]
    fn null_keys_never_match() {
        assert!(keys_match(&[Some(1), Some(2)], &[Some(1), Some(2)]));
        assert!(!keys_match(&[None], &[None]));
        assert!(!keys_match(&[Some(1), None], &[Some(1), None]));
    }

    #[test]
    fn null_and_zero_hash_differently() {
        assert_ne!(hash_key(vec![None]), hash_key(vec![Some(0)]));
        assert_eq!(hash_key(vec![Some(42)]), hash_key(vec![Some(42)]));
    }
}
