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

#[derive(Debug)]
pub enum ErrorKind {
    CorruptChunk(String),
    DeviceStarvation(String),
    IntegerOverflow(String),
    InvalidArgument(String),
    KernelFailed(String, u32, String),
    LogicError(String),
    ResultGrowthTooLarge(String),
    RuntimeError(gpu_runtime::error::Error),
    SkewTooExtreme(String),
    Msg(String),
}

#[derive(Debug)]
pub struct Error {
    kind: ErrorKind,
}

impl Error {
    pub fn kind(&self) -> &ErrorKind {
        &self.kind
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self.kind {
            ErrorKind::RuntimeError(ref e) => Some(e),
            _ => None,
        }
    }
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        std::fmt::Display::fmt(&self.kind, f)
    }
}

impl From<gpu_runtime::error::Error> for Error {
    fn from(error: gpu_runtime::error::Error) -> Self {
        Self {
            kind: ErrorKind::RuntimeError(error),
        }
    }
}

impl From<ErrorKind> for Error {
    fn from(kind: ErrorKind) -> Self {
        Self { kind }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            ErrorKind::CorruptChunk(ref s) => write!(f, "CorruptChunk: {}", s),
            ErrorKind::DeviceStarvation(ref s) => write!(f, "DeviceStarvation: {}", s),
            ErrorKind::IntegerOverflow(ref s) => write!(f, "IntegerOverflow: {}", s),
            ErrorKind::InvalidArgument(ref s) => write!(f, "InvalidArgument: {}", s),
            ErrorKind::KernelFailed(ref name, depth, ref s) => {
                write!(f, "KernelFailed: {} at depth {}: {}", name, depth, s)
            }
            ErrorKind::LogicError(ref s) => write!(f, "LogicError: {}", s),
            ErrorKind::ResultGrowthTooLarge(ref s) => write!(f, "ResultGrowthTooLarge: {}", s),
            ErrorKind::RuntimeError(ref e) => e.fmt(f),
            ErrorKind::SkewTooExtreme(ref s) => write!(f, "SkewTooExtreme: {}", s),
            ErrorKind::Msg(ref s) => write!(f, "Msg: {}", s),
        }
    }
}

impl From<String> for ErrorKind {
    fn from(s: String) -> Self {
        ErrorKind::Msg(s)
    }
}

impl<'a> From<&'a str> for ErrorKind {
    fn from(s: &'a str) -> Self {
        ErrorKind::Msg(s.to_string())
    }
}

pub type Result<T> = std::result::Result<T, Error>;

/// Maps a poisoned lock to a logic error.
pub(crate) fn poisoned<T>(_: std::sync::PoisonError<T>) -> Error {
    ErrorKind::LogicError("Lock poisoned by a panicked thread".to_string()).into()
}
