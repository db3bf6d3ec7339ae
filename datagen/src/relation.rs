/*
 * This Source Code Form is subject to the terms of the Mozilla Public License,
 * v. 2.0. If a copy of the MPL was not distributed with this file, You can
 * obtain one at http://mozilla.org/MPL/2.0/.
 *
 *
 * Copyright 2019 German Research Center for Artificial Intelligence (DFKI)
 * Author: Clemens Lutz <clemens.lutz@dfki.de>
 */

//! Data set generators for generating database relations.
//!
//! The generators produce relation attributes following a random distribution.
//! Sequential generators take the random number generator as a parameter, so
//! that a seeded generator reproduces the same relation. Parallel generators
//! use a thread-local generator per worker.

use num_traits::FromPrimitive;

use crate::error::{ErrorKind, Result};

use std::convert::TryFrom;
use std::ops::RangeInclusive;

use rand::distributions::{Distribution, Uniform};
use rand::seq::SliceRandom;
use rand::{thread_rng, Rng};

use rayon::prelude::*;

use zipf::ZipfDistribution;

/// Key value that marks a `NULL` key.
pub const NULL_KEY: i64 = -1;

/// A relation row with nullable integer attributes.
pub type Row = Vec<Option<i64>>;

pub trait KeyAttribute: Sized {
    fn null_key() -> Self;
    fn try_from_usize(x: usize) -> Result<Self>;
}

impl KeyAttribute for i64 {
    fn null_key() -> Self {
        NULL_KEY
    }

    fn try_from_usize(x: usize) -> Result<Self> {
        Self::try_from(x).map_err(|_| {
            ErrorKind::IntegerOverflow("Failed to convert from usize".to_string()).into()
        })
    }
}

/// Generator for relations with uniform distribution.
pub struct UniformRelation;

impl UniformRelation {
    /// Generates a primary key attribute.
    ///
    /// The generated keys are unique and contiguous. The key range starts from
    /// 1 and ends at, i.e. including, attr.len(). Keys are placed at random
    /// locations within the slice.
    ///
    /// `selectivity` specifies the join selectivity in percent. An according
    /// percentage of keys are set to the `NULL` value. By default (`None`), the
    /// selectivity is 100%.
    pub fn gen_primary_key<T: KeyAttribute, R: Rng>(
        attr: &mut [T],
        selectivity: Option<u32>,
        rng: &mut R,
    ) -> Result<()> {
        let selectivity = selectivity.unwrap_or(100);
        let percent = Uniform::from(1..=100);

        attr.iter_mut()
            .zip(1..)
            .map(|(x, i)| {
                T::try_from_usize(i).map(|i| {
                    *x = if percent.sample(rng) <= selectivity {
                        i
                    } else {
                        T::null_key()
                    };
                })
            })
            .collect::<Result<()>>()?;

        attr.shuffle(rng);
        Ok(())
    }

    /// Generates a primary key attribute in parallel.
    ///
    /// See `gen_primary_key` for the semantics of the keys.
    pub fn gen_primary_key_par<T: Clone + Send + KeyAttribute>(
        attr: &mut [T],
        selectivity: Option<u32>,
    ) -> Result<()> {
        let selectivity = selectivity.unwrap_or(100);
        let percent = Uniform::from(1..=100);
        let mut shuffled: Vec<(usize, T)> = (1..(attr.len() + 1))
            .into_par_iter()
            .map_init(thread_rng, |rng, i| {
                T::try_from_usize(i).map(|i| {
                    let val = if percent.sample(rng) <= selectivity {
                        i
                    } else {
                        T::null_key()
                    };
                    (rng.gen(), val)
                })
            })
            .collect::<Result<_>>()?;

        shuffled.as_mut_slice().par_sort_unstable_by_key(|x| x.0);

        attr.par_iter_mut()
            .zip_eq(shuffled.into_par_iter())
            .for_each(|(x, t)| *x = t.1);

        Ok(())
    }

    /// Generates a uniformly distributed attribute.
    ///
    /// The generated values are sampled from `range`.
    pub fn gen_attr<T: FromPrimitive, R: Rng>(
        attr: &mut [T],
        range: RangeInclusive<usize>,
        rng: &mut R,
    ) -> Result<()> {
        let between = Uniform::from(range);

        attr.iter_mut()
            .map(|x| {
                FromPrimitive::from_usize(between.sample(rng))
                    .ok_or_else(|| {
                        ErrorKind::IntegerOverflow("Failed to convert from usize".to_string())
                            .into()
                    })
                    .map(|r| *x = r)
            })
            .collect::<Result<()>>()?;

        Ok(())
    }

    /// Generates a uniformly distributed attribute in parallel.
    ///
    /// The generated values are sampled from `range`.
    pub fn gen_attr_par<T: FromPrimitive + Send>(
        attr: &mut [T],
        range: RangeInclusive<usize>,
    ) -> Result<()> {
        let between = Uniform::from(range);

        attr.par_iter_mut()
            .map_init(thread_rng, |rng, x| {
                FromPrimitive::from_usize(between.sample(rng))
                    .ok_or_else(|| {
                        ErrorKind::IntegerOverflow("Failed to convert from usize".to_string())
                            .into()
                    })
                    .map(|r| *x = r)
            })
            .collect::<Result<()>>()?;

        Ok(())
    }
}

/// Generator for relations with Zipf distribution.
pub struct ZipfRelation;

impl ZipfRelation {
    /// Generates an attribute following the Zipf distribution.
    ///
    /// The generated values are sampled from 1 to num_elements (inclusive).
    /// Note that the exponent must be greather than 0.
    ///
    /// In the literature, num_elements is also called the alphabet size.
    pub fn gen_attr<T: FromPrimitive, R: Rng>(
        attr: &mut [T],
        num_elements: usize,
        exponent: f64,
        rng: &mut R,
    ) -> Result<()> {
        let between = Self::distribution(num_elements, exponent)?;

        attr.iter_mut()
            .map(|x| {
                FromPrimitive::from_usize(between.sample(rng))
                    .ok_or_else(|| {
                        ErrorKind::IntegerOverflow("Failed to convert from usize".to_string())
                            .into()
                    })
                    .map(|r| *x = r)
            })
            .collect::<Result<()>>()?;

        Ok(())
    }

    /// Generates an attribute following the Zipf distribution in parallel.
    pub fn gen_attr_par<T: FromPrimitive + Send>(
        attr: &mut [T],
        num_elements: usize,
        exponent: f64,
    ) -> Result<()> {
        let between = Self::distribution(num_elements, exponent)?;

        attr.par_iter_mut()
            .map_init(thread_rng, |rng, x| {
                FromPrimitive::from_usize(between.sample(rng))
                    .ok_or_else(|| {
                        ErrorKind::IntegerOverflow("Failed to convert from usize".to_string())
                            .into()
                    })
                    .map(|r| *x = r)
            })
            .collect::<Result<()>>()?;

        Ok(())
    }

    fn distribution(num_elements: usize, exponent: f64) -> Result<ZipfDistribution> {
        ZipfDistribution::new(num_elements, exponent).map_err(|_| {
            ErrorKind::InvalidArgument(
                "ZipfDistribution requires num_elements and exponent greater than 0".to_string(),
            )
            .into()
        })
    }
}

/// Assembles rows from a key attribute and `payloads` payload attributes.
///
/// The key is the first column; `NULL_KEY` becomes `NULL`. Payload column
/// `j` of row `i` holds `i * payloads + j`, so that every row is unique.
pub fn to_rows(keys: &[i64], payloads: usize) -> Result<Vec<Row>> {
    keys.iter()
        .enumerate()
        .map(|(i, &key)| -> Result<Row> {
            let key = if key == NULL_KEY { None } else { Some(key) };
            let base = i64::try_from(i * payloads).map_err(|_| {
                ErrorKind::IntegerOverflow("Row index does not fit into i64".to_string())
            })?;
            Ok(std::iter::once(key)
                .chain((0..payloads as i64).map(|j| Some(base + j)))
                .collect())
        })
        .collect()
}
