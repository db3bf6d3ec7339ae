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

use crate::chunk::HashRange;
use crate::error::{ErrorKind, Result};

/// Most buckets a histogram may have.
const MAX_BITS: u32 = 16;

/// A histogram of row counts and bytes over the 32-bit hash space.
///
/// The buckets are contiguous ranges of equal width. Bucket `b` covers all
/// hashes whose top `bits` bits equal `b`.
#[derive(Clone, Debug)]
pub struct Histogram {
    bits: u32,
    nitems: Vec<usize>,
    bytes: Vec<usize>,
}

/// A contiguous hash range of a partitioned relation.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct HashPartition {
    pub range: HashRange,
    pub nitems: usize,
    pub bytes: usize,
}

impl Histogram {
    /// Sizes the histogram at 16 buckets per planned batch.
    pub fn for_batches(nbatches: usize) -> Self {
        let batch_bits = std::cmp::max(nbatches, 1).next_power_of_two().trailing_zeros();
        let bits = std::cmp::min(batch_bits + 4, MAX_BITS);
        let nbuckets = 1 << bits;

        Self {
            bits,
            nitems: vec![0; nbuckets],
            bytes: vec![0; nbuckets],
        }
    }

    pub fn nbuckets(&self) -> usize {
        self.nitems.len()
    }

    pub fn bucket(&self, hash: u32) -> usize {
        (hash >> (32 - self.bits)) as usize
    }

    pub fn add(&mut self, hash: u32, bytes: usize) {
        let bucket = self.bucket(hash);
        self.nitems[bucket] += 1;
        self.bytes[bucket] += bytes;
    }

    pub fn nitems(&self) -> usize {
        self.nitems.iter().sum()
    }

    fn bucket_min(&self, bucket: usize) -> u32 {
        ((bucket as u64) << (32 - self.bits)) as u32
    }

    /// Splits the hash space into contiguous ranges that each fit `budget`.
    ///
    /// `chunk_len` returns the bytes of a chunk holding the given number of
    /// rows. Buckets are accumulated greedily in hash order. The returned
    /// ranges cover the whole hash space without overlap.
    pub fn partition<F>(&self, budget: usize, chunk_len: F) -> Result<Vec<HashPartition>>
    where
        F: Fn(usize) -> usize,
    {
        let mut partitions = Vec::new();
        let mut current = HashPartition {
            range: HashRange::FULL,
            nitems: 0,
            bytes: 0,
        };

        for bucket in 0..self.nbuckets() {
            let nitems = self.nitems[bucket];
            if nitems == 0 {
                continue;
            }

            if chunk_len(nitems) > budget {
                let max = if bucket + 1 < self.nbuckets() {
                    self.bucket_min(bucket + 1) - 1
                } else {
                    u32::MAX
                };
                Err(ErrorKind::SkewTooExtreme(format!(
                    "Hash range {:#x}..={:#x} alone holds {} rows, which exceeds the budget of {} bytes",
                    self.bucket_min(bucket),
                    max,
                    nitems,
                    budget
                )))?;
            }

            if current.nitems > 0 && chunk_len(current.nitems + nitems) > budget {
                let min = self.bucket_min(bucket);
                current.range.max = min - 1;
                partitions.push(current);
                current = HashPartition {
                    range: HashRange::new(min, u32::MAX),
                    nitems: 0,
                    bytes: 0,
                };
            }

            current.nitems += nitems;
            current.bytes += self.bytes[bucket];
        }
        partitions.push(current);

        Ok(partitions)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tuple::hash_key;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    fn assert_clean(partitions: &[HashPartition]) {
        assert_eq!(partitions.first().map(|p| p.range.min), Some(0));
        assert_eq!(partitions.last().map(|p| p.range.max), Some(u32::MAX));
        for pair in partitions.windows(2) {
            assert_eq!(pair[0].range.max as u64 + 1, pair[1].range.min as u64);
        }
    }

    #[test]
    fn bucket_count_follows_batches() {
        assert_eq!(Histogram::for_batches(0).nbuckets(), 16);
        assert_eq!(Histogram::for_batches(1).nbuckets(), 16);
        assert_eq!(Histogram::for_batches(5).nbuckets(), 128);
        assert_eq!(Histogram::for_batches(1 << 20).nbuckets(), 1 << 16);
    }

    #[test]
    fn partition_is_clean_and_complete() -> Result<()> {
        let mut rng = StdRng::seed_from_u64(42);
        let mut histogram = Histogram::for_batches(4);
        for _ in 0..10_000 {
            let key: i64 = rng.gen_range(0..1_000_000);
            histogram.add(hash_key(vec![Some(key)]), 24);
        }

        let partitions = histogram.partition(24 * 1000, |n| 24 * n)?;

        assert_clean(&partitions);
        assert!(partitions.len() >= 10);
        assert_eq!(partitions.iter().map(|p| p.nitems).sum::<usize>(), 10_000);
        assert!(partitions.iter().all(|p| p.bytes <= 24 * 1000));
        for partition in partitions.iter() {
            let inside = (0..histogram.nbuckets())
                .filter(|&b| partition.range.contains(histogram.bucket_min(b)))
                .map(|b| histogram.nitems[b])
                .sum::<usize>();
            assert_eq!(inside, partition.nitems);
        }
        Ok(())
    }

    #[test]
    fn empty_histogram_has_one_full_partition() -> Result<()> {
        let partitions = Histogram::for_batches(1).partition(1, |n| n)?;
        assert_eq!(partitions.len(), 1);
        assert_eq!(partitions[0].range, HashRange::FULL);
        Ok(())
    }

    #[test]
    fn single_hot_bucket_is_too_skewed() {
        let mut histogram = Histogram::for_batches(1);
        for _ in 0..100 {
            histogram.add(7, 16);
        }

        match histogram.partition(50 * 16, |n| 16 * n) {
            Err(e) => match e.kind() {
                ErrorKind::SkewTooExtreme(_) => {}
                other => panic!("Unexpected error: {}", other),
            },
            Ok(p) => panic!("Expected a skew error, got {:?}", p),
        }
    }
}
