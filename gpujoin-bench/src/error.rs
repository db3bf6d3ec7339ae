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

use datagen::error::Error as DatagenError;
use error_chain::error_chain;
use gpu_runtime::error::Error as GpuRuntimeError;
use gpujoin::error::Error as GpuJoinError;
use rayon::ThreadPoolBuildError;

error_chain! {
    errors {
        InvalidArgument(msg: String) {
            description("Invalid argument error")
            display("Aborted with: {}", msg)
        }
        IntegerOverflow(msg: String) {
            description("Integer overflow error")
            display("Aborted with: {}", msg)
        }
    }

    foreign_links {
        Csv(csv::Error);
        Datagen(DatagenError);
        GpuJoin(GpuJoinError);
        GpuRuntime(GpuRuntimeError);
        Io(::std::io::Error);
        RayonThreadPoolBuild(ThreadPoolBuildError);
    }
}
