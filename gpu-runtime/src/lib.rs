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

//! # The GPU Runtime Library
//!
//! `gpu-runtime` abstracts the small set of device operations that an
//! asynchronous query operator needs from a GPU driver:
//!
//! - device memory allocation that reports budget exhaustion as `None`
//!   instead of failing
//! - ordered streams with events, asynchronous copies (host-to-device,
//!   device-to-host, and peer-to-peer), and memsets
//! - kernel lookup by name and asynchronous kernel launch
//! - completion callbacks attached to a stream
//!
//! Two backends implement the [`Device`](runtime::Device) trait. The
//! [`HostDevice`](runtime::HostDevice) simulates a device with a byte budget
//! and executes each stream on its own worker thread. Kernels are Rust
//! closures registered in a [`HostModule`](runtime::HostModule). The
//! `CudaDevice` wraps the CUDA driver API and is available with the `cuda`
//! feature.

pub mod error;
pub mod runtime;
