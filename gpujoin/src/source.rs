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

//! Row producers of the outer and inner relations.

use crate::error::Result;
use crate::tuple::Row;

/// A rescannable producer of rows with a fixed column count.
pub trait RowSource: Send {
    fn ncols(&self) -> usize;

    /// Returns the next row, or `None` when the relation is exhausted.
    fn next_row(&mut self) -> Result<Option<Row>>;

    /// Restarts the relation from its first row.
    fn rescan(&mut self) -> Result<()>;

    /// Tells whether the relation's upstream parameters changed since the
    /// last scan. An unchanged inner relation is not reloaded on rescan.
    fn params_changed(&self) -> bool {
        false
    }
}

/// An in-memory relation.
#[derive(Clone, Debug, Default)]
pub struct VecSource {
    ncols: usize,
    rows: Vec<Row>,
    position: usize,
    params_changed: bool,
}

impl VecSource {
    pub fn new(ncols: usize, rows: Vec<Row>) -> Self {
        Self {
            ncols,
            rows,
            position: 0,
            params_changed: false,
        }
    }

    /// Replaces the rows and flags the relation as changed for the next
    /// rescan.
    pub fn replace_rows(&mut self, rows: Vec<Row>) {
        self.rows = rows;
        self.position = 0;
        self.params_changed = true;
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }
}

impl RowSource for VecSource {
    fn ncols(&self) -> usize {
        self.ncols
    }

    fn next_row(&mut self) -> Result<Option<Row>> {
        let row = self.rows.get(self.position).cloned();
        if row.is_some() {
            self.position += 1;
        }
        Ok(row)
    }

    fn rescan(&mut self) -> Result<()> {
        self.position = 0;
        self.params_changed = false;
        Ok(())
    }

    fn params_changed(&self) -> bool {
        self.params_changed
    }
}
