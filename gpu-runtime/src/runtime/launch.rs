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

use super::DevicePtr;
use crate::error::{ErrorKind, Result};
use std::convert::TryFrom;

/// Default number of threads per block for one-dimensional launches.
pub const DEFAULT_BLOCK_SIZE: u32 = 256;

/// Grid and block dimensions of a kernel launch.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct LaunchDim {
    pub grid: (u32, u32, u32),
    pub block: (u32, u32, u32),
    pub shared_mem_bytes: u32,
}

impl LaunchDim {
    /// Covers `items` work items with one thread each.
    ///
    /// The grid always contains at least one block, so that kernels which
    /// only reset state still run when there is no input.
    pub fn linear(items: usize, block_size: u32) -> Result<Self> {
        let grid = Self::blocks_for(items, block_size)?;

        Ok(Self {
            grid: (grid, 1, 1),
            block: (block_size, 1, 1),
            shared_mem_bytes: 0,
        })
    }

    /// Covers a two-dimensional `x_items` by `y_items` space, e.g., outer
    /// rows times inner rows of a nested-loop join.
    pub fn planar(x_items: usize, y_items: usize, block_x: u32, block_y: u32) -> Result<Self> {
        let grid_x = Self::blocks_for(x_items, block_x)?;
        let grid_y = Self::blocks_for(y_items, block_y)?;

        Ok(Self {
            grid: (grid_x, grid_y, 1),
            block: (block_x, block_y, 1),
            shared_mem_bytes: 0,
        })
    }

    /// Total number of threads in the launch.
    pub fn threads(&self) -> u64 {
        let blocks = self.grid.0 as u64 * self.grid.1 as u64 * self.grid.2 as u64;
        let block = self.block.0 as u64 * self.block.1 as u64 * self.block.2 as u64;
        blocks * block
    }

    fn blocks_for(items: usize, block_size: u32) -> Result<u32> {
        if block_size == 0 {
            Err(ErrorKind::InvalidArgument(
                "Block size must be greater than zero".to_string(),
            ))?;
        }

        let blocks = (items + block_size as usize - 1) / block_size as usize;
        u32::try_from(blocks.max(1)).map_err(|_| {
            ErrorKind::InvalidArgument(format!("Too many blocks for {} items", items)).into()
        })
    }
}

/// A kernel parameter.
///
/// Pointers are passed as device pointers; `Null` is a NULL pointer
/// parameter.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum KernelArg {
    Ptr(DevicePtr),
    Null,
    U32(u32),
    I32(i32),
    U64(u64),
}

impl From<DevicePtr> for KernelArg {
    fn from(ptr: DevicePtr) -> Self {
        KernelArg::Ptr(ptr)
    }
}

impl From<Option<DevicePtr>> for KernelArg {
    fn from(ptr: Option<DevicePtr>) -> Self {
        ptr.map_or(KernelArg::Null, KernelArg::Ptr)
    }
}

impl From<u32> for KernelArg {
    fn from(value: u32) -> Self {
        KernelArg::U32(value)
    }
}

impl From<i32> for KernelArg {
    fn from(value: i32) -> Self {
        KernelArg::I32(value)
    }
}

impl From<u64> for KernelArg {
    fn from(value: u64) -> Self {
        KernelArg::U64(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn linear_launch_rounds_up() -> Result<()> {
        let dim = LaunchDim::linear(1000, 256)?;
        assert_eq!(dim.grid, (4, 1, 1));
        assert_eq!(dim.threads(), 1024);
        Ok(())
    }

    #[test]
    fn empty_launch_has_one_block() -> Result<()> {
        let dim = LaunchDim::linear(0, 128)?;
        assert_eq!(dim.grid, (1, 1, 1));
        Ok(())
    }

    #[test]
    fn planar_launch_covers_both_dimensions() -> Result<()> {
        let dim = LaunchDim::planar(100, 33, 32, 16)?;
        assert_eq!(dim.grid, (4, 3, 1));
        assert_eq!(dim.block, (32, 16, 1));
        Ok(())
    }

    #[test]
    fn zero_block_size_is_rejected() {
        assert!(LaunchDim::linear(10, 0).is_err());
    }
}
