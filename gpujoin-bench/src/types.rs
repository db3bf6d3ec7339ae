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

use gpujoin::plan::{JoinMethod, JoinType, ResultFormat};
use serde_derive::Serialize;
use structopt::clap::{_clap_count_exprs, arg_enum};

arg_enum! {
    #[derive(Copy, Clone, Debug, PartialEq)]
    pub enum ArgDataSet {
        Test,
        Star,
        Custom,
    }
}

arg_enum! {
    #[derive(Copy, Clone, Debug, PartialEq, Serialize)]
    pub enum ArgDistribution {
        Uniform,
        Zipf,
    }
}

arg_enum! {
    #[derive(Copy, Clone, Debug, PartialEq, Serialize)]
    pub enum ArgDeviceType {
        Host,
        Cuda,
    }
}

arg_enum! {
    #[derive(Copy, Clone, Debug, PartialEq, Serialize)]
    pub enum ArgJoinType {
        Inner,
        Left,
        Right,
        Full,
    }
}

arg_enum! {
    #[derive(Copy, Clone, Debug, PartialEq, Serialize)]
    pub enum ArgJoinMethod {
        Hash,
        NestLoop,
    }
}

arg_enum! {
    #[derive(Copy, Clone, Debug, PartialEq, Serialize)]
    pub enum ArgResultFormat {
        Row,
        Slot,
    }
}

impl From<ArgJoinType> for JoinType {
    fn from(jt: ArgJoinType) -> Self {
        match jt {
            ArgJoinType::Inner => JoinType::Inner,
            ArgJoinType::Left => JoinType::Left,
            ArgJoinType::Right => JoinType::Right,
            ArgJoinType::Full => JoinType::Full,
        }
    }
}

impl From<ArgJoinMethod> for JoinMethod {
    fn from(jm: ArgJoinMethod) -> Self {
        match jm {
            ArgJoinMethod::Hash => JoinMethod::Hash,
            ArgJoinMethod::NestLoop => JoinMethod::NestLoop,
        }
    }
}

impl From<ArgResultFormat> for ResultFormat {
    fn from(rf: ArgResultFormat) -> Self {
        match rf {
            ArgResultFormat::Row => ResultFormat::Row,
            ArgResultFormat::Slot => ResultFormat::Slot,
        }
    }
}
