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

//! Materialization of the inner relations.

mod histogram;
mod loader;
mod relation_set;

pub use self::histogram::{HashPartition, Histogram};
pub use self::loader::{InnerChunks, InnerRelationLoader};
pub use self::relation_set::{DeviceMirror, Detach, InnerRelationSet};
