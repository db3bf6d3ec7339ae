/*
 * This Source Code Form is subject to the terms of the Mozilla Public License,
 * v. 2.0. If a copy of the MPL was not distributed with this file, You can
 * obtain one at http://mozilla.org/MPL/2.0/.
 *
 *
 * Copyright 2019 German Research Center for Artificial Intelligence (DFKI)
 * Author: Clemens Lutz <clemens.lutz@dfki.de>
 */

//! Generators for synthetic join inputs.
//!
//! Attributes are generated column-wise into slices, following the same
//! distributions as in the literature on hash joins.
//! [`to_rows`](relation::to_rows) assembles generated columns into nullable
//! integer rows.

pub mod error;
pub mod relation;
