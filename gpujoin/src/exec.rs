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

//! Task execution: sizing, kernel lookup, window enumeration, and
//! scheduling.

mod estimator;
mod kernel_table;
mod odometer;
pub(crate) mod scheduler;
mod task;

pub use self::estimator::{Estimate, PriorAttempt, RuntimeStats, SizeEstimator};
pub use self::kernel_table::{KernelKind, KernelTable};
pub use self::odometer::Odometer;
