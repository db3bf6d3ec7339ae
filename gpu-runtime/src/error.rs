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

#[cfg(feature = "cuda")]
use cuda_driver_sys::CUresult;
use error_chain::error_chain;

error_chain! {
    errors {
        InvalidArgument(msg: String) {
            description("Invalid argument error")
            display("Aborted with: {}", msg)
        }
        OutOfBounds(msg: String) {
            description("Out of bounds error")
            display("Aborted with: {}", msg)
        }
        DeviceError(msg: String) {
            description("Device error")
            display("Device failed with: {}", msg)
        }
        KernelError(name: String, msg: String) {
            description("Kernel execution error")
            display("Kernel {} failed with: {}", name, msg)
        }
        LogicError(msg: String) {
            description("Logic error")
            display("Aborting with: {}", msg)
        }
        RuntimeError(msg: String) {
            description("Runtime error")
            display("Aborting with: {}", msg)
        }
    }

    foreign_links {
        Io(::std::io::Error);
        RayonThreadPoolBuild(rayon::ThreadPoolBuildError);
        Cuda(rustacuda::error::CudaError) #[cfg(feature = "cuda")];
    }
}

/// Converts raw C CUresult into Rust-ified Result type
#[cfg(feature = "cuda")]
pub trait ToResult {
    fn to_result(self) -> Result<()>;
}

#[cfg(feature = "cuda")]
impl ToResult for CUresult {
    fn to_result(self) -> Result<()> {
        match self {
            CUresult::CUDA_SUCCESS => Ok(()),
            other => Err(ErrorKind::DeviceError(format!("{:?}", other)).into()),
        }
    }
}

/// Maps a poisoned lock to a logic error.
///
/// A lock is only poisoned if a thread panicked while holding it, which
/// leaves the protected state unknown.
pub fn poisoned<T>(_: std::sync::PoisonError<T>) -> Error {
    ErrorKind::LogicError("Lock poisoned by a panicked thread".to_string()).into()
}
